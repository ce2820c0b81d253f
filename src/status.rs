//! Status projection.
//!
//! The synchronizer counts pods; this module turns those counters into the
//! status block other components read (dataset binding decides the dataset
//! phase from `readyReplicas` and the `Ready` condition) and writes it back
//! only when something a reader could observe has changed.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use kube::ResourceExt;
use tracing::debug;

use crate::controller::WorkloadClient;
use crate::crd::{CacheWorkerSet, CacheWorkerSetStatus, Condition, ConditionStatus, UpdateStrategyType};
use crate::retry::{retry_on, RetryPolicy};
use crate::Error;

/// Condition type reporting whether enough pods are ready
pub const READY_CONDITION: &str = "Ready";

/// Condition type reporting whether every pod runs the update revision
pub const UPDATED_CONDITION: &str = "Updated";

/// Finish a rolling update once every pod is updated and ready.
///
/// The update revision then becomes the current revision.
pub fn complete_rolling_update(set: &CacheWorkerSet, status: &mut CacheWorkerSetStatus) {
    if set.spec.update_strategy.type_ != UpdateStrategyType::RollingUpdate {
        return;
    }
    if status.updated_replicas == status.replicas && status.ready_replicas == status.replicas {
        status.current_replicas = status.updated_replicas;
        status.current_revision = status.update_revision.clone();
    }
}

/// Derive the `Ready` and `Updated` conditions from the counters.
///
/// Conditions whose status did not change keep their transition time.
pub fn project_conditions(set: &CacheWorkerSet, status: &mut CacheWorkerSetStatus) {
    let previous = set.status.as_ref();
    let desired = set.spec.replicas();

    let ready = if status.ready_replicas >= desired {
        Condition::new(
            READY_CONDITION,
            ConditionStatus::True,
            "ReplicasReady",
            format!("{}/{} replicas ready", status.ready_replicas, desired),
        )
    } else {
        Condition::new(
            READY_CONDITION,
            ConditionStatus::False,
            "ReplicasNotReady",
            format!("{}/{} replicas ready", status.ready_replicas, desired),
        )
    };

    let updated = if status.current_revision == status.update_revision {
        Condition::new(
            UPDATED_CONDITION,
            ConditionStatus::True,
            "UpdateComplete",
            format!("all pods at revision {}", status.update_revision),
        )
    } else {
        Condition::new(
            UPDATED_CONDITION,
            ConditionStatus::False,
            "RollingUpdateInProgress",
            format!(
                "{}/{} pods at revision {}",
                status.updated_replicas, status.replicas, status.update_revision
            ),
        )
    };

    for condition in [ready, updated] {
        let prev = previous.and_then(|s| s.condition(&condition.type_));
        let carried = condition.carry_transition_time(prev);
        status.set_condition(carried);
    }
}

fn same_condition(a: &Condition, b: &Condition) -> bool {
    a.type_ == b.type_ && a.status == b.status && a.reason == b.reason && a.message == b.message
}

/// Whether `status` differs from the status stored on `set` in any field a
/// reader can observe
pub fn inconsistent_status(set: &CacheWorkerSet, status: &CacheWorkerSetStatus) -> bool {
    let Some(stored) = set.status.as_ref() else {
        return true;
    };
    status.observed_generation > stored.observed_generation
        || status.replicas != stored.replicas
        || status.ready_replicas != stored.ready_replicas
        || status.current_replicas != stored.current_replicas
        || status.updated_replicas != stored.updated_replicas
        || status.current_revision != stored.current_revision
        || status.update_revision != stored.update_revision
        || status.collision_count != stored.collision_count
        || status.conditions.len() != stored.conditions.len()
        || status
            .conditions
            .iter()
            .any(|c| stored.condition(&c.type_).is_none_or(|s| !same_condition(c, s)))
}

/// Writes computed status back to the set
pub struct StatusProjector {
    client: Arc<dyn WorkloadClient>,
    retry: RetryPolicy,
}

impl StatusProjector {
    /// Create a projector; `retry` governs conflicts on the status write
    pub fn new(client: Arc<dyn WorkloadClient>, retry: RetryPolicy) -> Self {
        Self { client, retry }
    }

    /// Complete the status computed by a pass and persist it if it changed.
    ///
    /// Returns whether a write happened. A set deleted in the meantime is
    /// not an error.
    pub async fn project(
        &self,
        set: &CacheWorkerSet,
        mut status: CacheWorkerSetStatus,
    ) -> Result<bool, Error> {
        complete_rolling_update(set, &mut status);
        project_conditions(set, &mut status);
        if !inconsistent_status(set, &status) {
            debug!(set = %set.name_any(), "Status unchanged");
            return Ok(false);
        }

        let namespace = set
            .metadata
            .namespace
            .as_deref()
            .ok_or(Error::MissingObjectKey("metadata.namespace"))?;
        let name = set.name_any();
        let client = &self.client;
        let status = &status;
        let attempts = AtomicU32::new(0);

        let written = retry_on(&self.retry, "patch_set_status", Error::is_conflict, || {
            let name = name.clone();
            let attempts = &attempts;
            async move {
                let observed = if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                    set.clone()
                } else {
                    match client.get_set(namespace, &name).await? {
                        Some(fresh) => fresh,
                        None => return Ok(false),
                    }
                };
                if !inconsistent_status(&observed, status) {
                    return Ok(false);
                }
                client
                    .patch_set_status(
                        namespace,
                        &name,
                        observed.metadata.resource_version.clone(),
                        status,
                    )
                    .await?;
                Ok(true)
            }
        })
        .await;

        match written {
            Ok(written) => {
                if written {
                    debug!(
                        set = %name,
                        replicas = status.replicas,
                        ready = status.ready_replicas,
                        "Updated status"
                    );
                }
                Ok(written)
            }
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }
}
