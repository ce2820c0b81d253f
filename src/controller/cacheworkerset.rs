//! CacheWorkerSet reconciliation.
//!
//! Every notification on a set or one of its pods runs [`reconcile`] once.
//! A pass reads the set and its pods, lets targeted scale-in act first,
//! resolves revisions, drives pods one safe step through the synchronizer and
//! writes the resulting status back. Passes are idempotent: replaying one
//! against unchanged state issues no writes.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Client, Resource, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

use super::client::{KubeWorkloadClient, WorkloadClient};
use crate::config::ControllerConfig;
use crate::crd::CacheWorkerSet;
use crate::events::{actions, reasons, EventPublisher, KubeEventPublisher};
use crate::identity::is_member_of;
use crate::metrics::{self, ReconcileTimer, ScaleInPhase};
use crate::pod_control::{CacheDrainHook, NoopDrainHook, PodController};
use crate::revision::RevisionStore;
use crate::scale_in::{self, ScaleInCoordinator};
use crate::status::StatusProjector;
use crate::sync::PodSynchronizer;
use crate::Error;

/// Controller context shared by every reconcile
pub struct Context {
    /// Platform client (trait object for testability)
    pub client: Arc<dyn WorkloadClient>,
    /// Event publisher for `kubectl describe` output
    pub events: Arc<dyn EventPublisher>,
    /// Hook awaited before any pod is removed
    pub drain: Arc<dyn CacheDrainHook>,
    /// Retry, requeue and scale-in settings
    pub config: ControllerConfig,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(client: Client) -> ContextBuilder {
        ContextBuilder::new(client)
    }

    /// Create a context for testing with custom clients
    #[cfg(test)]
    pub fn for_testing(
        client: Arc<dyn WorkloadClient>,
        events: Arc<dyn EventPublisher>,
        drain: Arc<dyn CacheDrainHook>,
        config: ControllerConfig,
    ) -> Self {
        Self {
            client,
            events,
            drain,
            config,
        }
    }

    fn pod_controller(&self) -> PodController {
        PodController::new(
            self.client.clone(),
            self.events.clone(),
            self.drain.clone(),
            self.config.pod_update_retry.clone(),
        )
    }

    fn revisions(&self) -> RevisionStore {
        RevisionStore::new(self.client.clone(), self.config.conflict_retry.clone())
    }

    fn synchronizer(&self) -> PodSynchronizer {
        PodSynchronizer::new(self.pod_controller(), self.events.clone())
    }

    fn scale_in(&self) -> ScaleInCoordinator {
        ScaleInCoordinator::new(
            self.client.clone(),
            self.pod_controller(),
            self.events.clone(),
            self.config.scale_in_window,
            self.config.conflict_retry.clone(),
        )
    }

    fn status(&self) -> StatusProjector {
        StatusProjector::new(self.client.clone(), self.config.conflict_retry.clone())
    }
}

/// Builder for constructing [`Context`] instances
///
/// ```ignore
/// let ctx = Context::builder(client)
///     .config(config)
///     .drain_hook(Arc::new(engine_drain))
///     .build();
/// ```
pub struct ContextBuilder {
    client: Client,
    workload: Option<Arc<dyn WorkloadClient>>,
    events: Option<Arc<dyn EventPublisher>>,
    drain: Option<Arc<dyn CacheDrainHook>>,
    config: ControllerConfig,
}

impl ContextBuilder {
    fn new(client: Client) -> Self {
        Self {
            client,
            workload: None,
            events: None,
            drain: None,
            config: ControllerConfig::default(),
        }
    }

    /// Set the controller configuration
    pub fn config(mut self, config: ControllerConfig) -> Self {
        self.config = config;
        self
    }

    /// Override the platform client
    pub fn workload_client(mut self, client: Arc<dyn WorkloadClient>) -> Self {
        self.workload = Some(client);
        self
    }

    /// Override the event publisher
    pub fn event_publisher(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    /// Install the cache engine's drain hook
    pub fn drain_hook(mut self, drain: Arc<dyn CacheDrainHook>) -> Self {
        self.drain = Some(drain);
        self
    }

    /// Build the Context
    pub fn build(self) -> Context {
        let field_manager = self.config.field_manager.clone();
        Context {
            client: self.workload.unwrap_or_else(|| {
                Arc::new(KubeWorkloadClient::new(self.client.clone(), &field_manager))
            }),
            events: self.events.unwrap_or_else(|| {
                Arc::new(KubeEventPublisher::new(self.client.clone(), &field_manager))
            }),
            drain: self.drain.unwrap_or_else(|| Arc::new(NoopDrainHook)),
            config: self.config,
        }
    }
}

/// Reconcile a CacheWorkerSet
///
/// Targeted scale-in runs before the synchronizer. A pass that removes
/// marked pods ends there. While marks wait out their window the
/// synchronizer still runs, with ordinal-order removal held back so only the
/// marked pods leave the set. A set being deleted still has its status
/// projected, but no pod is created or removed.
#[instrument(
    skip(set, ctx),
    fields(set = %set.name_any(), namespace = %set.namespace().unwrap_or_default())
)]
pub async fn reconcile(set: Arc<CacheWorkerSet>, ctx: Arc<Context>) -> Result<Action, Error> {
    let timer = ReconcileTimer::start(set.name_any());
    let result = reconcile_set(&set, &ctx).await;
    match &result {
        Ok(_) => timer.success(),
        Err(_) => timer.error(),
    }
    result
}

async fn reconcile_set(set: &CacheWorkerSet, ctx: &Context) -> Result<Action, Error> {
    let namespace = set
        .namespace()
        .ok_or(Error::MissingObjectKey("metadata.namespace"))?;
    let name = set.name_any();

    let Some(set) = ctx.client.get_set(&namespace, &name).await? else {
        debug!("CacheWorkerSet is gone");
        return Ok(Action::await_change());
    };
    let deleting = set.metadata.deletion_timestamp.is_some();

    if let Err(e) = set.spec.validate() {
        warn!(error = %e, "CacheWorkerSet validation failed");
        ctx.events
            .publish(
                &set.object_ref(&()),
                EventType::Warning,
                reasons::VALIDATION_FAILED,
                actions::RECONCILE,
                Some(e.to_string()),
            )
            .await;
        return Ok(Action::await_change());
    }

    let store = ctx.revisions();
    let revisions = store.list(&set).await?;
    let pods: Vec<_> = ctx
        .client
        .list_pods(&namespace, &set.spec.selector)
        .await?
        .into_iter()
        .filter(|p| is_member_of(&set, p))
        .collect();

    let mut wake = None;
    if !deleting && scale_in::is_enabled(&set) {
        match scale_in_step(&set, &pods, ctx).await? {
            ScaleInStep::Removed => return Ok(Action::requeue(ctx.config.requeue_interval)),
            ScaleInStep::Waiting(wait) => wake = Some(wait),
            ScaleInStep::Idle => {}
        }
    }

    let resolved = store.reconcile(&set, &revisions).await?;
    let status = ctx
        .synchronizer()
        .hold_removals(wake.is_some())
        .sync(&set, &resolved, &pods)
        .await?;
    if ctx.status().project(&set, status).await? {
        info!("Status updated");
    }

    // history is truncated against the pods this pass started from
    store
        .truncate_history(&set, &revisions, &resolved, &pods)
        .await?;

    if deleting {
        debug!("CacheWorkerSet is being deleted");
        return Ok(Action::await_change());
    }
    let requeue = wake.map_or(ctx.config.requeue_interval, |w| {
        w.min(ctx.config.requeue_interval)
    });
    Ok(Action::requeue(requeue))
}

/// Where the scale-in phases left the pass
#[derive(Debug, PartialEq)]
enum ScaleInStep {
    /// Marked pods were reserved or removed; the pass ends
    Removed,
    /// Marks are waiting out their window
    Waiting(Duration),
    /// Nothing to scale in
    Idle,
}

async fn scale_in_step(
    set: &CacheWorkerSet,
    pods: &[Pod],
    ctx: &Context,
) -> Result<ScaleInStep, Error> {
    let coordinator = ctx.scale_in();
    let now = Utc::now();
    let set_name = set.name_any();

    let outcome = coordinator.execute(set, pods, now).await?;
    if outcome.acted() {
        info!(
            deleted = ?outcome.deleted,
            reserved = ?outcome.reserved,
            "Executed scale-in"
        );
        metrics::record_scale_in(&set_name, ScaleInPhase::Removed, outcome.deleted.len());
        return Ok(ScaleInStep::Removed);
    }
    if let Some(due) = outcome.next_due {
        let wait = (due - now).to_std().unwrap_or(Duration::ZERO);
        debug!(?wait, "Waiting for scale-in window");
        return Ok(ScaleInStep::Waiting(wait));
    }

    let reduction = scale_in::pending_reduction(set, pods);
    if reduction > 0 {
        let marked = coordinator.mark(set, pods, reduction).await?;
        if !marked.is_empty() {
            metrics::record_scale_in(&set_name, ScaleInPhase::Marked, marked.len());
            return Ok(ScaleInStep::Waiting(ctx.config.scale_in_window));
        }
    }
    Ok(ScaleInStep::Idle)
}

/// Error policy for the controller
///
/// Every failure is counted and retried after the configured delay; the
/// process never exits on a reconcile error.
pub fn error_policy(set: Arc<CacheWorkerSet>, error: &Error, ctx: Arc<Context>) -> Action {
    metrics::record_reconcile_error(&set.name_any(), error);
    error!(
        ?error,
        set = %set.name_any(),
        "reconciliation failed"
    );
    Action::requeue(ctx.config.error_requeue_interval)
}
