//! Controller configuration.
//!
//! Built once in `main` from CLI flags and environment, then handed to every
//! reconcile through [`crate::controller::Context`].

use std::time::Duration;

use crate::retry::RetryPolicy;
use crate::DEFAULT_FIELD_MANAGER;

/// Knobs shared by every reconcile pass
#[derive(Clone, Debug, PartialEq)]
pub struct ControllerConfig {
    /// Field manager recorded on every write
    pub field_manager: String,
    /// Requeue delay after a successful pass
    pub requeue_interval: Duration,
    /// Requeue delay after a failed pass
    pub error_requeue_interval: Duration,
    /// How long a scale-in mark stands before the pod is removed
    pub scale_in_window: Duration,
    /// Retries when repairing a pod's identity or storage
    pub pod_update_retry: RetryPolicy,
    /// Retries for read-modify-write cycles that hit a stale resourceVersion
    pub conflict_retry: RetryPolicy,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            field_manager: DEFAULT_FIELD_MANAGER.to_string(),
            requeue_interval: Duration::from_secs(300),
            error_requeue_interval: Duration::from_secs(5),
            scale_in_window: Duration::from_secs(30),
            pod_update_retry: RetryPolicy::pod_update(),
            conflict_retry: RetryPolicy::conflict(),
        }
    }
}

impl ControllerConfig {
    /// Set the field manager
    pub fn with_field_manager(mut self, field_manager: impl Into<String>) -> Self {
        self.field_manager = field_manager.into();
        self
    }

    /// Set the requeue delays after successful and failed passes
    pub fn with_requeue(mut self, success: Duration, failure: Duration) -> Self {
        self.requeue_interval = success;
        self.error_requeue_interval = failure;
        self
    }

    /// Set the scale-in window
    pub fn with_scale_in_window(mut self, window: Duration) -> Self {
        self.scale_in_window = window;
        self
    }
}
