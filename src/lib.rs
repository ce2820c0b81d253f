//! CacheWorkerSet - StatefulSet-style controller for distributed cache workers
//!
//! A CacheWorkerSet keeps a fixed number of cache worker pods with stable
//! ordinal names, per-ordinal storage and revision-tracked rolling updates.
//! On top of StatefulSet semantics it adds reserved ordinals (holes that are
//! never filled) and a two-phase scale-in that lets a data layer choose which
//! workers go away instead of always removing the highest ordinal.
//!
//! # Architecture
//!
//! Every notification on a set or one of its pods runs one reconcile pass:
//! - Revisions snapshot the pod template and decide current vs update
//! - Ordinal planning maps replicas and reservations onto pod slots
//! - The synchronizer creates, repairs, updates and condemns pods in order
//! - Scale-in marks chosen pods first and removes them after a window
//! - Status is projected back onto the set when it changed
//!
//! # Modules
//!
//! - [`crd`] - CacheWorkerSet Custom Resource Definition
//! - [`controller`] - Reconcile loop and the platform client seam
//! - [`identity`] - Pod naming, membership and health predicates
//! - [`ordinal`] - Replica and reservation to ordinal planning
//! - [`revision`] - Controller revision history
//! - [`pod_control`] - Single-pod create/update/delete with events
//! - [`sync`] - Ordered pod synchronization
//! - [`scale_in`] - Two-phase targeted scale-in
//! - [`status`] - Status conditions and write-back
//! - [`workerset`] - Uniform view over StatefulSet, CacheWorkerSet and DaemonSet
//! - [`config`] - Controller configuration
//! - [`metrics`] - OpenTelemetry reconcile and scale-in metrics
//! - [`telemetry`] - Logging, tracing and metrics export setup
//! - [`error`] - Error types for the controller

#![deny(missing_docs)]

pub mod config;
pub mod controller;
pub mod crd;
pub mod error;
pub mod events;
pub mod identity;
pub mod metrics;
pub mod ordinal;
pub mod pod_control;
pub mod retry;
pub mod revision;
pub mod scale_in;
pub mod status;
pub mod sync;
pub mod telemetry;
pub mod workerset;

#[cfg(test)]
pub(crate) mod testing;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T, E = Error> = std::result::Result<T, E>;

// =============================================================================
// Default Configuration Constants
// =============================================================================

/// Revisions kept beyond the live ones when a set does not say
pub const DEFAULT_REVISION_HISTORY_LIMIT: i32 = 10;

/// Field manager and event reporter name of the controller
pub const DEFAULT_FIELD_MANAGER: &str = "cacheworkerset-controller";
