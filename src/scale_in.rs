//! Targeted scale-in.
//!
//! Reducing replicas on a plain ordinal set always removes the highest
//! ordinals. Cache workers are interchangeable for load but not for eviction
//! cost, so sets whose template carries the `advanced_statefulset` worker type
//! remove pods in two phases instead:
//!
//! 1. **mark**: pick pods at random and annotate them with
//!    `fluid.io/need-scale-in: "true"` and the time of marking
//! 2. **execute**: once the scale-in window has elapsed, reserve the marked
//!    ordinals in the set's `delete-slots` annotation and delete the pods
//!
//! The window gives an external rebalance process time to move cache data off
//! the marked pods before they are removed.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use rand::seq::SliceRandom;
use tracing::{debug, info};

use crate::controller::WorkloadClient;
use crate::crd::CacheWorkerSet;
use crate::events::{actions, reasons, EventPublisher};
use crate::identity::{is_created, is_terminating, ordinal_of};
use crate::ordinal::{
    annotated_slots, delete_slots_value, ordinal_ceiling, reserved_ordinals,
    DELETE_SLOTS_ANNOTATION,
};
use crate::pod_control::PodController;
use crate::retry::{retry_on, RetryPolicy};
use crate::workerset::{WorkerType, WORKER_TYPE_ANNOTATION};
use crate::Error;

/// Pod annotation selecting a pod for removal
pub const NEED_SCALE_IN_ANNOTATION: &str = "fluid.io/need-scale-in";

/// Pod annotation recording when the pod was selected (RFC 3339)
pub const SCALE_IN_MARKED_AT_ANNOTATION: &str = "fluid.io/need-scale-in-at";

/// Whether the set removes pods through targeted scale-in
pub fn is_enabled(set: &CacheWorkerSet) -> bool {
    set.spec
        .template
        .metadata
        .as_ref()
        .and_then(|m| m.annotations.as_ref())
        .and_then(|a| a.get(WORKER_TYPE_ANNOTATION))
        .is_some_and(|v| v == WorkerType::AdvancedStatefulSet.as_str())
}

/// Whether the pod has been selected for removal
pub fn is_marked(pod: &Pod) -> bool {
    pod.annotations()
        .get(NEED_SCALE_IN_ANNOTATION)
        .is_some_and(|v| v == "true")
}

fn is_advanced_worker(pod: &Pod) -> bool {
    pod.annotations()
        .get(WORKER_TYPE_ANNOTATION)
        .is_some_and(|v| v == WorkerType::AdvancedStatefulSet.as_str())
}

fn marked_at(pod: &Pod) -> Option<DateTime<Utc>> {
    let raw = pod.annotations().get(SCALE_IN_MARKED_AT_ANNOTATION)?;
    match DateTime::parse_from_rfc3339(raw) {
        Ok(t) => Some(t.with_timezone(&Utc)),
        Err(e) => {
            debug!(pod = %pod.name_any(), value = %raw, error = %e, "Unreadable scale-in mark time");
            None
        }
    }
}

/// Pods that count against the desired replicas: created, not terminating
/// and holding an ordinal that is not reserved
pub fn counted_pods<'a>(set: &CacheWorkerSet, pods: &'a [Pod]) -> Vec<&'a Pod> {
    let reserved = reserved_ordinals(set);
    pods.iter()
        .filter(|p| is_created(p) && !is_terminating(p))
        .filter(|p| ordinal_of(p).is_some_and(|o| !reserved.contains(&o)))
        .collect()
}

/// How many counted pods exceed the desired replicas
pub fn pending_reduction(set: &CacheWorkerSet, pods: &[Pod]) -> usize {
    let desired = usize::try_from(set.spec.replicas()).unwrap_or(0);
    counted_pods(set, pods).len().saturating_sub(desired)
}

/// What one execute call did
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ExecuteOutcome {
    /// Ordinals newly written to `delete-slots`
    pub reserved: Vec<i32>,
    /// Pods deleted
    pub deleted: Vec<String>,
    /// Due pods that were already terminating
    pub skipped: Vec<String>,
    /// Earliest time a marked pod not yet due becomes due
    pub next_due: Option<DateTime<Utc>>,
}

impl ExecuteOutcome {
    /// Whether any write was issued
    pub fn acted(&self) -> bool {
        !self.reserved.is_empty() || !self.deleted.is_empty()
    }
}

/// Marks and removes pods for targeted scale-in
pub struct ScaleInCoordinator {
    client: Arc<dyn WorkloadClient>,
    control: PodController,
    events: Arc<dyn EventPublisher>,
    window: Duration,
    retry: RetryPolicy,
}

impl ScaleInCoordinator {
    /// Create a coordinator; `window` is how long a mark stands before the
    /// pod is removed and `retry` governs conflicts on the set annotation
    pub fn new(
        client: Arc<dyn WorkloadClient>,
        control: PodController,
        events: Arc<dyn EventPublisher>,
        window: Duration,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            client,
            control,
            events,
            window,
            retry,
        }
    }

    /// Mark up to `reduction` counted pods, chosen uniformly at random.
    ///
    /// Counted pods already carrying the mark count towards the reduction.
    /// Returns the names of the pods marked by this call.
    pub async fn mark(
        &self,
        set: &CacheWorkerSet,
        pods: &[Pod],
        reduction: usize,
    ) -> Result<Vec<String>, Error> {
        let namespace = namespace_of(set)?;
        let counted = counted_pods(set, pods);
        let already = counted.iter().filter(|p| is_marked(p)).count();
        let wanted = reduction.saturating_sub(already);
        if wanted == 0 {
            return Ok(Vec::new());
        }

        let unmarked: Vec<&Pod> = counted.into_iter().filter(|p| !is_marked(p)).collect();
        let chosen: Vec<String> = {
            let mut rng = rand::thread_rng();
            unmarked
                .choose_multiple(&mut rng, wanted)
                .map(|p| p.name_any())
                .collect()
        };
        if chosen.is_empty() {
            return Ok(chosen);
        }

        let annotations = BTreeMap::from([
            (NEED_SCALE_IN_ANNOTATION.to_string(), "true".to_string()),
            (
                SCALE_IN_MARKED_AT_ANNOTATION.to_string(),
                Utc::now().to_rfc3339(),
            ),
        ]);
        for name in &chosen {
            self.client
                .patch_pod_annotations(namespace, name, &annotations)
                .await?;
            info!(pod = %name, set = %set.name_any(), "Marked pod for scale-in");
        }

        self.events
            .publish(
                &set.object_ref(&()),
                EventType::Normal,
                reasons::SCALE_IN_MARKED,
                actions::SCALE_IN,
                Some(format!(
                    "Marked pods [{}] in CacheWorkerSet {} for scale-in",
                    chosen.join(", "),
                    set.name_any()
                )),
            )
            .await;
        Ok(chosen)
    }

    /// Remove marked pods whose window has elapsed at `now`.
    ///
    /// Only pods carrying both the mark and the `advanced_statefulset`
    /// worker type are touched. Their ordinals are reserved before any pod is
    /// deleted so the synchronizer does not refill them.
    pub async fn execute(
        &self,
        set: &CacheWorkerSet,
        pods: &[Pod],
        now: DateTime<Utc>,
    ) -> Result<ExecuteOutcome, Error> {
        let window = chrono::Duration::from_std(self.window).unwrap_or(chrono::Duration::zero());
        let mut outcome = ExecuteOutcome::default();
        let mut due: Vec<&Pod> = Vec::new();

        for pod in pods.iter().filter(|p| is_marked(p) && is_advanced_worker(p)) {
            match marked_at(pod).map(|t| t + window) {
                Some(at) if at > now => {
                    outcome.next_due = Some(outcome.next_due.map_or(at, |d| d.min(at)));
                }
                _ => due.push(pod),
            }
        }
        if due.is_empty() {
            return Ok(outcome);
        }

        let ordinals: BTreeSet<i32> = due.iter().filter_map(|p| ordinal_of(p)).collect();
        outcome.reserved = self.reserve(set, &ordinals).await?;

        for pod in due {
            if is_terminating(pod) {
                debug!(pod = %pod.name_any(), "Marked pod already terminating");
                outcome.skipped.push(pod.name_any());
                continue;
            }
            self.control.delete(set, pod).await?;
            info!(pod = %pod.name_any(), set = %set.name_any(), "Scaled in pod");
            outcome.deleted.push(pod.name_any());
        }
        Ok(outcome)
    }

    /// Add to `delete-slots` every ordinal in `ordinals` the set would
    /// otherwise keep or refill, returning those newly added
    async fn reserve(
        &self,
        set: &CacheWorkerSet,
        ordinals: &BTreeSet<i32>,
    ) -> Result<Vec<i32>, Error> {
        let namespace = namespace_of(set)?;
        let name = set.name_any();
        let client = &self.client;

        let added = retry_on(&self.retry, "reserve_ordinals", Error::is_conflict, || {
            let name = name.clone();
            async move {
                let fresh = client
                    .get_set(namespace, &name)
                    .await?
                    .ok_or_else(|| Error::not_found(format!("CacheWorkerSet {namespace}/{name}")))?;

                let mut reserved = reserved_ordinals(&fresh);
                let mut added = Vec::new();
                for &ordinal in ordinals {
                    let (ceiling, _) = ordinal_ceiling(fresh.spec.replicas(), &reserved);
                    if ordinal < ceiling && reserved.insert(ordinal) {
                        added.push(ordinal);
                    }
                }
                if added.is_empty() {
                    return Ok(added);
                }

                let mut slots = annotated_slots(&fresh);
                slots.extend(added.iter().copied());
                let annotations = BTreeMap::from([(
                    DELETE_SLOTS_ANNOTATION.to_string(),
                    delete_slots_value(&slots),
                )]);
                client
                    .patch_set_annotations(
                        namespace,
                        &name,
                        fresh.metadata.resource_version.clone(),
                        &annotations,
                    )
                    .await?;
                Ok(added)
            }
        })
        .await?;

        if !added.is_empty() {
            info!(set = %name, ordinals = ?added, "Reserved ordinals for scale-in");
            self.events
                .publish(
                    &set.object_ref(&()),
                    EventType::Normal,
                    reasons::ORDINALS_RESERVED,
                    actions::SCALE_IN,
                    Some(format!("Reserved ordinals {added:?} in CacheWorkerSet {name}")),
                )
                .await;
        }
        Ok(added)
    }
}

fn namespace_of(set: &CacheWorkerSet) -> Result<&str, Error> {
    set.metadata
        .namespace
        .as_deref()
        .ok_or(Error::MissingObjectKey("metadata.namespace"))
}
