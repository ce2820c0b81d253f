//! Pod and claim operations for a CacheWorkerSet.
//!
//! [`PodController`] is the only component that creates, updates or deletes
//! pods. It keeps claims in step with pods, funnels every deletion through the
//! cache drain hook and records an event for every outcome.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

#[cfg(test)]
use mockall::automock;

use crate::controller::WorkloadClient;
use crate::crd::CacheWorkerSet;
use crate::events::{actions, reasons, EventPublisher};
use crate::identity::{
    claims_for_pod, identity_matches, storage_matches, update_identity, update_storage,
};
use crate::retry::{retry_on, RetryPolicy};
use crate::Error;

/// Hook the cache engine uses to move data off a pod before it is removed.
///
/// The controller awaits the hook; the pod is only deleted once it returns Ok.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CacheDrainHook: Send + Sync {
    /// Release the cache held by `pod`
    async fn drain(&self, set: &CacheWorkerSet, pod: &Pod) -> Result<(), Error>;
}

/// Drain hook for engines that need no preparation before removal
pub struct NoopDrainHook;

#[async_trait]
impl CacheDrainHook for NoopDrainHook {
    async fn drain(&self, _set: &CacheWorkerSet, _pod: &Pod) -> Result<(), Error> {
        Ok(())
    }
}

#[derive(Clone, Copy, Debug)]
enum Verb {
    Create,
    Update,
    Delete,
}

impl Verb {
    fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }

    fn action(self) -> &'static str {
        match self {
            Self::Create => actions::CREATE,
            Self::Update => actions::UPDATE,
            Self::Delete => actions::DELETE,
        }
    }

    fn reason(self, failed: bool) -> &'static str {
        match (self, failed) {
            (Self::Create, false) => reasons::SUCCESSFUL_CREATE,
            (Self::Create, true) => reasons::FAILED_CREATE,
            (Self::Update, false) => reasons::SUCCESSFUL_UPDATE,
            (Self::Update, true) => reasons::FAILED_UPDATE,
            (Self::Delete, false) => reasons::SUCCESSFUL_DELETE,
            (Self::Delete, true) => reasons::FAILED_DELETE,
        }
    }
}

/// Executes pod and claim writes for the synchronizer and scale-in
pub struct PodController {
    client: Arc<dyn WorkloadClient>,
    events: Arc<dyn EventPublisher>,
    drain: Arc<dyn CacheDrainHook>,
    update_policy: RetryPolicy,
}

impl PodController {
    /// Create a pod controller
    pub fn new(
        client: Arc<dyn WorkloadClient>,
        events: Arc<dyn EventPublisher>,
        drain: Arc<dyn CacheDrainHook>,
        update_policy: RetryPolicy,
    ) -> Self {
        Self {
            client,
            events,
            drain,
            update_policy,
        }
    }

    /// Create the pod's claims, then the pod.
    ///
    /// Objects that already exist count as created.
    pub async fn create(&self, set: &CacheWorkerSet, pod: &Pod) -> Result<(), Error> {
        let namespace = namespace_of(set)?;
        let name = pod.name_any();

        if let Err(e) = self.create_claims(set, pod).await {
            self.record_pod(Verb::Create, set, &name, Some(&e)).await;
            return Err(e);
        }

        let result = match self.client.create_pod(namespace, pod).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_already_exists() => {
                debug!(pod = %name, "Pod already exists");
                return Ok(());
            }
            Err(e) => Err(e),
        };
        self.record_pod(Verb::Create, set, &name, result.as_ref().err())
            .await;
        if result.is_ok() {
            info!(pod = %name, set = %set.name_any(), "Created pod");
        }
        result
    }

    /// Bring the pod's identity and storage back in line with the set.
    ///
    /// Conflicting writes re-read the pod and try again within the update
    /// retry policy. A pod that disappeared meanwhile counts as updated. An
    /// event is recorded only if a write was attempted on a live pod.
    pub async fn update(&self, set: &CacheWorkerSet, pod: &Pod) -> Result<(), Error> {
        let namespace = namespace_of(set)?;
        let name = pod.name_any();
        let current = Mutex::new(pod.clone());
        let attempted = AtomicBool::new(false);
        let vanished = AtomicBool::new(false);

        let (name_ref, current_ref, attempted_ref, vanished_ref) =
            (&name, &current, &attempted, &vanished);
        let result = retry_on(&self.update_policy, "update_pod", Error::is_conflict, || async move {
            let mut pod = current_ref.lock().await;
            let mut consistent = true;

            if !identity_matches(set, &pod) {
                update_identity(set, &mut pod);
                consistent = false;
            }
            if !storage_matches(set, &pod) {
                update_storage(set, &mut pod);
                consistent = false;
                self.create_claims(set, &pod).await?;
            }
            if consistent {
                return Ok(());
            }

            attempted_ref.store(true, Ordering::SeqCst);
            match self.client.replace_pod(namespace, &pod).await {
                Ok(_) => Ok(()),
                Err(e) if e.is_not_found() => {
                    vanished_ref.store(true, Ordering::SeqCst);
                    Ok(())
                }
                Err(e) if e.is_conflict() => {
                    match self.client.get_pod(namespace, name_ref).await {
                        Ok(Some(fresh)) => *pod = fresh,
                        Ok(None) => {
                            vanished_ref.store(true, Ordering::SeqCst);
                            return Ok(());
                        }
                        Err(get_err) => warn!(
                            pod = %name_ref,
                            error = %get_err,
                            "Failed to re-read pod after conflict"
                        ),
                    }
                    Err(e)
                }
                Err(e) => Err(e),
            }
        })
        .await;

        // a pod deleted underneath the update leaves nothing to repair
        if vanished.load(Ordering::SeqCst) {
            debug!(pod = %name, "Pod is gone, skipping update");
            return Ok(());
        }
        if attempted.load(Ordering::SeqCst) {
            self.record_pod(Verb::Update, set, &name, result.as_ref().err())
                .await;
        }
        result
    }

    /// Drain the pod's cache, then delete it.
    ///
    /// A failed drain keeps the pod. A pod that is already gone counts as
    /// deleted.
    pub async fn delete(&self, set: &CacheWorkerSet, pod: &Pod) -> Result<(), Error> {
        let namespace = namespace_of(set)?;
        let name = pod.name_any();

        if let Err(e) = self.drain.drain(set, pod).await {
            let err = match e {
                Error::Drain { .. } => e,
                other => Error::drain(&name, other.to_string()),
            };
            warn!(pod = %name, error = %err, "Cache drain failed, keeping pod");
            self.record_pod(Verb::Delete, set, &name, Some(&err)).await;
            return Err(err);
        }

        let result = match self.client.delete_pod(namespace, &name).await {
            Err(e) if e.is_not_found() => Ok(()),
            other => other,
        };
        self.record_pod(Verb::Delete, set, &name, result.as_ref().err())
            .await;
        if result.is_ok() {
            info!(pod = %name, set = %set.name_any(), "Deleted pod");
        }
        result
    }

    /// Create any claim the pod needs that does not exist yet.
    ///
    /// Every claim is attempted; the first failure is returned.
    async fn create_claims(&self, set: &CacheWorkerSet, pod: &Pod) -> Result<(), Error> {
        let namespace = namespace_of(set)?;
        let pod_name = pod.name_any();
        let mut first_error = None;

        for claim in claims_for_pod(set, pod).into_values() {
            let claim_name = claim.name_any();
            let outcome = match self.client.get_claim(namespace, &claim_name).await {
                Ok(Some(_)) => continue,
                Ok(None) => match self.client.create_claim(namespace, &claim).await {
                    Ok(_) => Ok(()),
                    Err(e) if e.is_already_exists() => continue,
                    Err(e) => Err(e),
                },
                Err(e) => Err(e),
            };
            self.record_claim(set, &pod_name, &claim_name, outcome.as_ref().err())
                .await;
            if let Err(e) = outcome {
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn record_pod(&self, verb: Verb, set: &CacheWorkerSet, pod: &str, err: Option<&Error>) {
        let set_name = set.name_any();
        let (type_, note) = match err {
            None => (
                EventType::Normal,
                format!("{} Pod {pod} in CacheWorkerSet {set_name} successful", verb.as_str()),
            ),
            Some(e) => (
                EventType::Warning,
                format!(
                    "{} Pod {pod} in CacheWorkerSet {set_name} failed error: {e}",
                    verb.as_str()
                ),
            ),
        };
        self.events
            .publish(
                &set.object_ref(&()),
                type_,
                verb.reason(err.is_some()),
                verb.action(),
                Some(note),
            )
            .await;
    }

    async fn record_claim(&self, set: &CacheWorkerSet, pod: &str, claim: &str, err: Option<&Error>) {
        let set_name = set.name_any();
        let (type_, note) = match err {
            None => (
                EventType::Normal,
                format!("create Claim {claim} Pod {pod} in CacheWorkerSet {set_name} success"),
            ),
            Some(e) => (
                EventType::Warning,
                format!(
                    "create Claim {claim} for Pod {pod} in CacheWorkerSet {set_name} failed error: {e}"
                ),
            ),
        };
        self.events
            .publish(
                &set.object_ref(&()),
                type_,
                Verb::Create.reason(err.is_some()),
                actions::CREATE,
                Some(note),
            )
            .await;
    }
}

fn namespace_of(set: &CacheWorkerSet) -> Result<&str, Error> {
    set.metadata
        .namespace
        .as_deref()
        .ok_or(Error::MissingObjectKey("metadata.namespace"))
}
