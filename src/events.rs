//! Kubernetes Event recording for the cache worker set controller.
//!
//! Provides a trait-based abstraction over `kube::runtime::events::Recorder`
//! so that pod/claim operations show up in `kubectl describe cacheworkerset`.
//!
//! Events are **fire-and-forget**: failures are logged as warnings and never
//! propagate errors. A failed event must never break reconciliation.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

/// Trait for publishing Kubernetes Events.
///
/// Implementations are expected to be fire-and-forget: `publish()` logs a
/// warning on failure but never returns an error.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish a Kubernetes Event on the given resource.
    ///
    /// # Arguments
    ///
    /// * `resource_ref` - The Kubernetes object this event is about
    /// * `type_` - Normal or Warning
    /// * `reason` - Machine-readable reason string (e.g. "SuccessfulCreate")
    /// * `action` - What action was taken (e.g. "Create")
    /// * `note` - Optional human-readable message
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Production implementation wrapping `kube::runtime::events::Recorder`.
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Create a new publisher for the given controller name.
    ///
    /// The controller name appears as the "reportingComponent" on Events.
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = kube::runtime::events::Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(
                reason,
                action,
                error = %e,
                "Failed to publish Kubernetes event"
            );
        }
    }
}

/// No-op implementation, used when event recording is disabled.
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        _type_: EventType,
        _reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
    }
}

/// Well-known event reason strings.
///
/// These appear in `kubectl get events` under the REASON column.
pub mod reasons {
    /// Pod or claim created
    pub const SUCCESSFUL_CREATE: &str = "SuccessfulCreate";
    /// Pod or claim creation failed
    pub const FAILED_CREATE: &str = "FailedCreate";
    /// Pod identity/storage brought back in line
    pub const SUCCESSFUL_UPDATE: &str = "SuccessfulUpdate";
    /// Pod identity/storage update failed
    pub const FAILED_UPDATE: &str = "FailedUpdate";
    /// Pod deleted (after its cache was drained)
    pub const SUCCESSFUL_DELETE: &str = "SuccessfulDelete";
    /// Pod deletion or cache drain failed
    pub const FAILED_DELETE: &str = "FailedDelete";
    /// A Failed/Succeeded pod is being replaced at the same ordinal
    pub const RECREATING_FAILED_POD: &str = "RecreatingFailedPod";
    /// Pods were selected for targeted scale-in
    pub const SCALE_IN_MARKED: &str = "ScaleInMarked";
    /// Ordinals of scaled-in pods were reserved
    pub const ORDINALS_RESERVED: &str = "OrdinalsReserved";
    /// Spec validation failed
    pub const VALIDATION_FAILED: &str = "ValidationFailed";
}

/// Well-known event action strings.
///
/// These appear in `kubectl get events` under the ACTION column.
pub mod actions {
    /// Standard reconciliation loop
    pub const RECONCILE: &str = "Reconcile";
    /// Creating pods or claims
    pub const CREATE: &str = "Create";
    /// Updating pods in place
    pub const UPDATE: &str = "Update";
    /// Deleting pods
    pub const DELETE: &str = "Delete";
    /// Targeted scale-in
    pub const SCALE_IN: &str = "ScaleIn";
}
