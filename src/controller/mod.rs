//! Controller implementation for the CacheWorkerSet CRD
//!
//! Follows the Kubernetes controller pattern: every notification on a set or
//! its pods runs one observe-diff-act pass.

mod cacheworkerset;
mod client;

pub use cacheworkerset::{error_policy, reconcile, Context, ContextBuilder};
#[cfg(test)]
pub use client::MockWorkloadClient;
pub use client::{KubeWorkloadClient, WorkloadClient};
