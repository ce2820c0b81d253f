//! The per-pass pod state machine.
//!
//! One call to [`PodSynchronizer::sync`] walks the set's ordinals once and
//! issues at most the writes that are safe right now:
//!
//! 1. replace failed pods and create missing ones, lowest ordinal first
//! 2. repair identity or storage drift in place
//! 3. remove condemned pods, highest ordinal first
//! 4. roll out-of-date pods onto the update revision, highest ordinal first
//!
//! Under `OrderedReady` the pass stops at the first pod that is being created,
//! is not ready, or is terminating. Progress resumes on the next trigger.
//!
//! While a targeted scale-in is pending, steps 3 and 4 are held back so that
//! only the pods chosen for removal leave the set.

use k8s_openapi::api::core::v1::Pod;
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use std::sync::Arc;
use tracing::{debug, info};

use crate::crd::{CacheWorkerSet, CacheWorkerSetStatus, UpdateStrategyType};
use crate::events::{actions, reasons, EventPublisher};
use crate::identity::{
    identity_matches, is_created, is_failed, is_healthy, is_running_and_ready, is_succeeded,
    is_terminating, new_pod, ordinal_of, pod_revision, set_pod_revision, storage_matches,
};
use crate::ordinal::{reserved_ordinals, OrdinalPlan};
use crate::pod_control::PodController;
use crate::revision::{template_from_revision, Revisions};
use crate::Error;

/// Tracks the per-revision counters as pods come and go during a pass
struct Counters<'a> {
    status: CacheWorkerSetStatus,
    current: &'a str,
    update: &'a str,
}

impl Counters<'_> {
    fn add(&mut self, pod: &Pod, delta: i32) {
        let revision = pod_revision(pod);
        if revision == self.current {
            self.status.current_replicas += delta;
        }
        if revision == self.update {
            self.status.updated_replicas += delta;
        }
    }
}

/// Drives pods toward the set's desired state one safe step at a time
pub struct PodSynchronizer {
    control: PodController,
    events: Arc<dyn EventPublisher>,
    hold_removals: bool,
}

impl PodSynchronizer {
    /// Create a synchronizer writing through `control`
    pub fn new(control: PodController, events: Arc<dyn EventPublisher>) -> Self {
        Self {
            control,
            events,
            hold_removals: false,
        }
    }

    /// Skip condemned and out-of-date pod removal for this synchronizer
    pub fn hold_removals(mut self, hold: bool) -> Self {
        self.hold_removals = hold;
        self
    }

    /// Run one pass over `pods` and return the status it observed.
    ///
    /// Counters in the returned status already reflect the writes this pass
    /// issued.
    pub async fn sync(
        &self,
        set: &CacheWorkerSet,
        revisions: &Revisions,
        pods: &[Pod],
    ) -> Result<CacheWorkerSetStatus, Error> {
        let current_name = revisions.current_name();
        let update_name = revisions.update_name();
        let current_template = template_from_revision(&revisions.current)?;
        let update_template = template_from_revision(&revisions.update)?;

        let mut counters = Counters {
            status: CacheWorkerSetStatus {
                observed_generation: set.metadata.generation.unwrap_or(0),
                current_revision: current_name.clone(),
                update_revision: update_name.clone(),
                collision_count: Some(revisions.collision_count),
                ..Default::default()
            },
            current: &current_name,
            update: &update_name,
        };

        for pod in pods {
            counters.status.replicas += 1;
            if is_running_and_ready(pod) {
                counters.status.ready_replicas += 1;
            }
            if is_created(pod) && !is_terminating(pod) {
                counters.add(pod, 1);
            }
        }

        let plan = OrdinalPlan::build(pods, set.spec.replicas(), &reserved_ordinals(set));
        let observed_current = set.status.as_ref().map_or(0, |s| s.current_replicas);
        let versioned = |ordinal: i32| -> Pod {
            let strategy = &set.spec.update_strategy;
            let below_partition = match &strategy.rolling_update {
                None => {
                    strategy.type_ == UpdateStrategyType::RollingUpdate
                        && ordinal < observed_current
                }
                Some(_) => ordinal < strategy.partition().unwrap_or(0),
            };
            let (template, revision) = if below_partition {
                (&current_template, current_name.as_str())
            } else {
                (&update_template, update_name.as_str())
            };
            let mut pod = new_pod(set, template, ordinal);
            set_pod_revision(&mut pod, revision);
            pod
        };

        let mut slots = plan.slots.clone();
        for ordinal in plan.missing_ordinals() {
            if let Some(slot) = usize::try_from(ordinal).ok().and_then(|i| slots.get_mut(i)) {
                *slot = Some(versioned(ordinal));
            }
        }

        let (unhealthy, first_unhealthy) = first_unhealthy(&slots, &plan.condemned);
        if let Some(first) = &first_unhealthy {
            info!(
                set = %set.name_any(),
                unhealthy,
                first_unhealthy_pod = %first,
                "CacheWorkerSet has unhealthy pods"
            );
        }

        if set.meta().deletion_timestamp.is_some() {
            return Ok(counters.status);
        }

        let monotonic = !set.spec.is_parallel();

        for ordinal in 0..slots.len() {
            let Some(mut pod) = slots[ordinal].clone() else {
                continue;
            };
            let ordinal_i32 = i32::try_from(ordinal).unwrap_or(i32::MAX);

            if is_failed(&pod) || is_succeeded(&pod) {
                self.events
                    .publish(
                        &set.object_ref(&()),
                        EventType::Warning,
                        reasons::RECREATING_FAILED_POD,
                        actions::RECONCILE,
                        Some(format!(
                            "CacheWorkerSet {}/{} is recreating failed Pod {}",
                            set.namespace().unwrap_or_default(),
                            set.name_any(),
                            pod.name_any()
                        )),
                    )
                    .await;
                self.control.delete(set, &pod).await?;
                counters.add(&pod, -1);
                counters.status.replicas -= 1;
                pod = versioned(ordinal_i32);
                slots[ordinal] = Some(pod.clone());
            }

            if !is_created(&pod) {
                self.control.create(set, &pod).await?;
                counters.status.replicas += 1;
                counters.add(&pod, 1);
                if monotonic {
                    return Ok(counters.status);
                }
                continue;
            }

            if is_terminating(&pod) && monotonic {
                info!(pod = %pod.name_any(), "Waiting for pod to terminate");
                return Ok(counters.status);
            }

            if !is_running_and_ready(&pod) && monotonic {
                info!(pod = %pod.name_any(), "Waiting for pod to be running and ready");
                return Ok(counters.status);
            }

            if identity_matches(set, &pod) && storage_matches(set, &pod) {
                continue;
            }
            self.control.update(set, &pod).await?;
        }

        if self.hold_removals {
            debug!(
                set = %set.name_any(),
                condemned = plan.condemned.len(),
                "Removals held for pending scale-in"
            );
            return Ok(counters.status);
        }

        for pod in plan.condemned.iter().rev() {
            let name = pod.name_any();
            if is_terminating(pod) {
                info!(pod = %name, "Waiting for pod to terminate prior to scale down");
                if monotonic {
                    return Ok(counters.status);
                }
                continue;
            }

            if !is_running_and_ready(pod)
                && monotonic
                && first_unhealthy.as_deref() != Some(name.as_str())
            {
                info!(
                    pod = %first_unhealthy.as_deref().unwrap_or_default(),
                    "Waiting for pod to be running and ready prior to scale down"
                );
                return Ok(counters.status);
            }

            info!(pod = %name, "Terminating pod for scale down");
            self.control.delete(set, pod).await?;
            counters.add(pod, -1);
            if monotonic {
                return Ok(counters.status);
            }
        }

        if set.spec.is_on_delete() {
            return Ok(counters.status);
        }

        let update_min = usize::try_from(set.spec.partition().unwrap_or(0)).unwrap_or(0);
        for target in (update_min..slots.len()).rev() {
            let Some(pod) = &slots[target] else {
                continue;
            };

            if pod_revision(pod) != update_name && !is_terminating(pod) {
                info!(pod = %pod.name_any(), "Terminating pod for update");
                self.control.delete(set, pod).await?;
                if pod_revision(pod) == current_name {
                    counters.status.current_replicas -= 1;
                }
                return Ok(counters.status);
            }

            if !is_healthy(pod) {
                debug!(pod = %pod.name_any(), "Waiting for pod to update");
                return Ok(counters.status);
            }
        }

        Ok(counters.status)
    }
}

/// Count unhealthy pods and name the one with the lowest ordinal
fn first_unhealthy(slots: &[Option<Pod>], condemned: &[Pod]) -> (usize, Option<String>) {
    let mut count = 0;
    let mut first: Option<(i32, String)> = None;
    for pod in slots.iter().flatten().chain(condemned) {
        if is_healthy(pod) {
            continue;
        }
        count += 1;
        let ordinal = ordinal_of(pod).unwrap_or(i32::MAX);
        if first.as_ref().is_none_or(|(o, _)| ordinal < *o) {
            first = Some((ordinal, pod.name_any()));
        }
    }
    (count, first.map(|(_, name)| name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{PodManagementPolicy, RollingUpdateStrategy};
    use crate::identity::POD_NAME_LABEL;
    use crate::pod_control::NoopDrainHook;
    use crate::retry::RetryPolicy;
    use crate::revision::RevisionStore;
    use crate::testing::{sample_set, FakeCluster, RecordingEventPublisher};
    use k8s_openapi::api::core::v1::Container;

    struct Harness {
        cluster: Arc<FakeCluster>,
        events: Arc<RecordingEventPublisher>,
        store: RevisionStore,
        sync: PodSynchronizer,
    }

    fn harness() -> Harness {
        let cluster = Arc::new(FakeCluster::new());
        let events = Arc::new(RecordingEventPublisher::new());
        let control = PodController::new(
            cluster.clone(),
            events.clone(),
            Arc::new(NoopDrainHook),
            RetryPolicy::pod_update(),
        );
        Harness {
            store: RevisionStore::new(cluster.clone(), RetryPolicy::conflict()),
            sync: PodSynchronizer::new(control, events.clone()),
            cluster,
            events,
        }
    }

    impl Harness {
        /// Run one pass against the stored set and persist the status it
        /// computes, the way the reconciler does
        async fn pass(&self, name: &str) -> CacheWorkerSetStatus {
            let set = self.cluster.set(name).unwrap();
            let revisions = self.store.list(&set).await.unwrap();
            let resolved = self.store.reconcile(&set, &revisions).await.unwrap();
            let pods = self.cluster.member_pods(&set);
            let mut status = self.sync.sync(&set, &resolved, &pods).await.unwrap();
            crate::status::complete_rolling_update(&set, &mut status);
            self.cluster.store_status(name, status.clone());
            status
        }
    }

    fn with_image(mut set: CacheWorkerSet, image: &str) -> CacheWorkerSet {
        if let Some(spec) = set.spec.template.spec.as_mut() {
            spec.containers = vec![Container {
                name: "worker".to_string(),
                image: Some(image.to_string()),
                ..Default::default()
            }];
        }
        set
    }

    // ==========================================================================
    // Story Tests: ordered bring-up and scale-down
    // ==========================================================================

    /// Story: pods come up strictly one ordinal at a time
    ///
    /// Ordinal k+1 is never created while ordinal k is not ready.
    #[tokio::test]
    async fn story_ordered_bring_up() {
        let h = harness();
        h.cluster.add_set(sample_set("cache", 3));

        h.pass("cache").await;
        assert_eq!(h.cluster.pod_names(), vec!["cache-0"]);

        // cache-0 is still Pending: nothing else happens
        h.pass("cache").await;
        assert_eq!(h.cluster.pod_names(), vec!["cache-0"]);

        h.cluster.mark_ready("cache-0");
        h.pass("cache").await;
        assert_eq!(h.cluster.pod_names(), vec!["cache-0", "cache-1"]);

        h.cluster.mark_ready("cache-1");
        h.pass("cache").await;
        h.cluster.mark_ready("cache-2");
        let status = h.pass("cache").await;

        assert_eq!(h.cluster.pod_names(), vec!["cache-0", "cache-1", "cache-2"]);
        assert_eq!(status.replicas, 3);
        assert_eq!(status.ready_replicas, 3);
        assert_eq!(status.current_revision, status.update_revision);
    }

    /// Story: parallel management creates every missing pod in one pass
    #[tokio::test]
    async fn story_parallel_bring_up() {
        let h = harness();
        let mut set = sample_set("cache", 3);
        set.spec.pod_management_policy = PodManagementPolicy::Parallel;
        h.cluster.add_set(set);

        let status = h.pass("cache").await;
        assert_eq!(h.cluster.pod_names(), vec!["cache-0", "cache-1", "cache-2"]);
        assert_eq!(status.replicas, 3);
        assert_eq!(status.updated_replicas, 3);
    }

    /// Story: scaling 3 -> 1 removes ordinal 2 first and waits for it
    #[tokio::test]
    async fn story_scale_down_highest_first() {
        let h = harness();
        h.cluster.add_set(sample_set("cache", 3));
        h.cluster.enable_graceful_deletion();
        for _ in 0..3 {
            h.pass("cache").await;
            h.cluster.mark_all_ready();
        }
        assert_eq!(h.cluster.pod_names().len(), 3);

        h.cluster.set_replicas("cache", 1);
        h.pass("cache").await;
        assert!(h.cluster.pod("cache-2").unwrap().metadata.deletion_timestamp.is_some());
        assert!(h.cluster.pod("cache-1").unwrap().metadata.deletion_timestamp.is_none());

        // cache-2 still terminating: cache-1 is left alone
        h.pass("cache").await;
        assert!(h.cluster.pod("cache-1").unwrap().metadata.deletion_timestamp.is_none());

        h.cluster.finish_terminating();
        h.pass("cache").await;
        assert!(h.cluster.pod("cache-1").unwrap().metadata.deletion_timestamp.is_some());

        h.cluster.finish_terminating();
        let status = h.pass("cache").await;
        assert_eq!(h.cluster.pod_names(), vec!["cache-0"]);
        assert_eq!(status.replicas, 1);
    }

    /// Story: the lowest unhealthy pod may be removed during scale-down
    #[tokio::test]
    async fn story_unhealthy_bypass_only_for_first_unhealthy() {
        let h = harness();
        let mut set = sample_set("cache", 4);
        set.spec.pod_management_policy = PodManagementPolicy::Parallel;
        h.cluster.add_set(set);
        h.pass("cache").await;
        h.cluster.mark_all_ready();

        // switch to ordered and shrink to 2; cache-3 is healthy, cache-2 is not
        let mut set = h.cluster.set("cache").unwrap();
        set.spec.pod_management_policy = PodManagementPolicy::OrderedReady;
        set.spec.replicas = Some(2);
        h.cluster.put_set(set);
        h.cluster.mark_not_ready("cache-2");

        h.pass("cache").await;
        assert!(h.cluster.pod("cache-3").is_none());

        // cache-2 is the lowest unhealthy pod, so it may go
        h.pass("cache").await;
        assert!(h.cluster.pod("cache-2").is_none());

        let mut set = h.cluster.set("cache").unwrap();
        set.spec.replicas = Some(4);
        h.cluster.put_set(set);
        h.pass("cache").await;
        h.cluster.mark_ready("cache-2");
        h.pass("cache").await;
        h.cluster.mark_not_ready("cache-2");
        h.cluster.mark_not_ready("cache-3");
        let mut set = h.cluster.set("cache").unwrap();
        set.spec.replicas = Some(2);
        h.cluster.put_set(set);

        // cache-3 is unhealthy but cache-2 is the lowest unhealthy pod
        h.pass("cache").await;
        assert!(h.cluster.pod("cache-2").is_some());
        assert!(h.cluster.pod("cache-3").is_some());
    }

    /// Story: a failed pod is replaced at the same ordinal
    #[tokio::test]
    async fn story_failed_pod_recreated_in_place() {
        let h = harness();
        h.cluster.add_set(sample_set("cache", 1));
        h.pass("cache").await;
        h.cluster.mark_all_ready();
        h.cluster.set_phase("cache-0", "Failed");
        let uid_before = h.cluster.pod("cache-0").unwrap().metadata.uid;

        h.pass("cache").await;

        let pod = h.cluster.pod("cache-0").unwrap();
        assert_ne!(pod.metadata.uid, uid_before);
        assert!(h
            .events
            .reasons()
            .iter()
            .any(|r| r == reasons::RECREATING_FAILED_POD));
    }

    /// Story: a ready pod with drifted identity is updated, not deleted
    #[tokio::test]
    async fn story_identity_drift_repaired_in_place() {
        let h = harness();
        h.cluster.add_set(sample_set("cache", 1));
        h.pass("cache").await;
        h.cluster.mark_all_ready();
        h.cluster.edit_pod("cache-0", |p| {
            p.labels_mut().remove(POD_NAME_LABEL);
        });
        let uid_before = h.cluster.pod("cache-0").unwrap().metadata.uid;

        h.pass("cache").await;

        let pod = h.cluster.pod("cache-0").unwrap();
        assert_eq!(pod.metadata.uid, uid_before);
        assert_eq!(pod.labels().get(POD_NAME_LABEL).unwrap(), "cache-0");
    }

    // ==========================================================================
    // Story Tests: rolling update
    // ==========================================================================

    async fn converge(h: &Harness, name: &str, passes: usize) -> CacheWorkerSetStatus {
        let mut status = CacheWorkerSetStatus::default();
        for _ in 0..passes {
            h.cluster.finish_terminating();
            status = h.pass(name).await;
            h.cluster.mark_all_ready();
        }
        status
    }

    /// Story: with partition P, ordinals >= P move to the new revision and
    /// ordinals < P stay on the old one
    #[tokio::test]
    async fn story_partition_convergence() {
        let h = harness();
        let mut set = with_image(sample_set("cache", 4), "cache:v1");
        set.spec.update_strategy.rolling_update = Some(RollingUpdateStrategy {
            partition: Some(2),
        });
        h.cluster.add_set(set);
        let first = converge(&h, "cache", 6).await;
        let v1 = first.update_revision.clone();

        let set = with_image(h.cluster.set("cache").unwrap(), "cache:v2");
        h.cluster.put_set(set);
        let status = converge(&h, "cache", 12).await;
        let v2 = status.update_revision.clone();
        assert_ne!(v1, v2);
        assert_eq!(status.current_revision, v1);

        for (name, expected) in [
            ("cache-0", &v1),
            ("cache-1", &v1),
            ("cache-2", &v2),
            ("cache-3", &v2),
        ] {
            assert_eq!(pod_revision(&h.cluster.pod(name).unwrap()), expected, "{name}");
        }
        assert_eq!(status.updated_replicas, 2);
        assert_eq!(status.current_replicas, 2);
    }

    /// Story: without a partition the update completes and current catches up
    #[tokio::test]
    async fn story_full_rolling_update_completes() {
        let h = harness();
        h.cluster
            .add_set(with_image(sample_set("cache", 3), "cache:v1"));
        converge(&h, "cache", 5).await;

        let set = with_image(h.cluster.set("cache").unwrap(), "cache:v2");
        h.cluster.put_set(set);

        // the first pass deletes only the highest ordinal
        h.pass("cache").await;
        assert_eq!(h.cluster.pod_names(), vec!["cache-0", "cache-1"]);

        let status = converge(&h, "cache", 10).await;
        assert_eq!(status.current_revision, status.update_revision);
        assert_eq!(status.updated_replicas, 3);
        for name in h.cluster.pod_names() {
            assert_eq!(pod_revision(&h.cluster.pod(&name).unwrap()), status.update_revision);
        }
    }

    /// Story: OnDelete never replaces out-of-date pods by itself
    #[tokio::test]
    async fn story_on_delete_leaves_pods_alone() {
        let h = harness();
        let mut set = with_image(sample_set("cache", 2), "cache:v1");
        set.spec.update_strategy.type_ = UpdateStrategyType::OnDelete;
        h.cluster.add_set(set);
        converge(&h, "cache", 4).await;
        let before: Vec<_> = h.cluster.pod_names();

        let set = with_image(h.cluster.set("cache").unwrap(), "cache:v2");
        h.cluster.put_set(set);
        let status = converge(&h, "cache", 3).await;

        assert_eq!(h.cluster.pod_names(), before);
        assert_eq!(status.updated_replicas, 0);
        assert_ne!(status.current_revision, status.update_revision);
    }

    // ==========================================================================
    // Story Tests: reserved ordinals and idempotence
    // ==========================================================================

    /// Story: reserved ordinals stay empty and the set grows past them
    #[tokio::test]
    async fn story_reserved_ordinals_are_skipped() {
        let h = harness();
        let mut set = sample_set("cache", 3);
        set.spec.reserved_ordinals = vec![1];
        set.spec.pod_management_policy = PodManagementPolicy::Parallel;
        h.cluster.add_set(set);

        h.pass("cache").await;
        assert_eq!(h.cluster.pod_names(), vec!["cache-0", "cache-2", "cache-3"]);
    }

    /// Story: replaying a pass over a converged set writes nothing
    #[tokio::test]
    async fn story_converged_pass_is_idempotent() {
        let h = harness();
        h.cluster.add_set(sample_set("cache", 3));
        converge(&h, "cache", 5).await;

        let writes = h.cluster.write_count();
        let set = h.cluster.set("cache").unwrap();
        let revisions = h.store.list(&set).await.unwrap();
        let resolved = h.store.reconcile(&set, &revisions).await.unwrap();
        let pods = h.cluster.member_pods(&set);
        h.sync.sync(&set, &resolved, &pods).await.unwrap();

        assert_eq!(h.cluster.write_count(), writes);
    }

    #[tokio::test]
    async fn test_deleting_set_only_reports_status() {
        let h = harness();
        let mut set = sample_set("cache", 2);
        set.metadata.deletion_timestamp = Some(
            k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(chrono::Utc::now()),
        );
        h.cluster.add_set(set);

        let status = h.pass("cache").await;
        assert!(h.cluster.pod_names().is_empty());
        assert_eq!(status.replicas, 0);
    }

    /// Story: a synchronizer holding removals leaves condemned pods alone
    /// until the hold is lifted
    #[tokio::test]
    async fn story_held_removals_keep_condemned_pods() {
        let h = harness();
        h.cluster.add_set(sample_set("cache", 3));
        for _ in 0..3 {
            h.pass("cache").await;
            h.cluster.mark_all_ready();
        }
        h.cluster.set_replicas("cache", 2);

        let held = PodSynchronizer::new(
            PodController::new(
                h.cluster.clone(),
                h.events.clone(),
                Arc::new(NoopDrainHook),
                RetryPolicy::pod_update(),
            ),
            h.events.clone(),
        )
        .hold_removals(true);
        let set = h.cluster.set("cache").unwrap();
        let revisions = h.store.list(&set).await.unwrap();
        let resolved = h.store.reconcile(&set, &revisions).await.unwrap();
        let writes = h.cluster.write_count();

        let status = held
            .sync(&set, &resolved, &h.cluster.member_pods(&set))
            .await
            .unwrap();
        assert_eq!(status.replicas, 3);
        assert_eq!(h.cluster.pod_names(), vec!["cache-0", "cache-1", "cache-2"]);
        assert_eq!(h.cluster.write_count(), writes);

        h.pass("cache").await;
        assert_eq!(h.cluster.pod_names(), vec!["cache-0", "cache-1"]);
    }

    #[test]
    fn test_first_unhealthy_picks_lowest_ordinal() {
        let set = sample_set("cache", 3);
        let slots = vec![
            Some(crate::testing::ready_pod(&set, 0, "r")),
            Some(new_pod(&set, &set.spec.template, 1)),
            Some(new_pod(&set, &set.spec.template, 2)),
        ];
        let condemned = vec![new_pod(&set, &set.spec.template, 5)];
        let (count, first) = first_unhealthy(&slots, &condemned);
        assert_eq!(count, 3);
        assert_eq!(first.as_deref(), Some("cache-1"));
    }
}
