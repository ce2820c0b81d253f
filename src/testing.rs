//! In-memory cluster and fixtures for tests.
//!
//! [`FakeCluster`] implements [`WorkloadClient`] with the apiserver behaviour
//! the controller relies on: optimistic concurrency on resourceVersion,
//! AlreadyExists on duplicate creates, NotFound on missing objects and
//! optionally graceful pod deletion. Scenario tests drive whole reconcile
//! passes against it and play the kubelet's part by flipping pod phases.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::apps::v1::ControllerRevision;
use k8s_openapi::api::core::v1::{
    Container, ObjectReference, PersistentVolumeClaim, Pod, PodCondition, PodSpec, PodStatus,
    PodTemplateSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, Time};
use kube::runtime::events::EventType;
use kube::ResourceExt;

use crate::controller::WorkloadClient;
use crate::crd::{CacheWorkerSet, CacheWorkerSetSpec, CacheWorkerSetStatus};
use crate::events::EventPublisher;
use crate::identity::{is_member_of, new_pod, ordinal_of, selector_matches, set_pod_revision};
use crate::workerset::{WorkerType, WORKER_TYPE_ANNOTATION};
use crate::Error;

// =============================================================================
// Fixtures
// =============================================================================

/// Spec with `app=cache` labels, one `data` claim template and a headless
/// service
pub fn sample_spec(replicas: i32) -> CacheWorkerSetSpec {
    let labels = BTreeMap::from([("app".to_string(), "cache".to_string())]);
    CacheWorkerSetSpec {
        replicas: Some(replicas),
        selector: LabelSelector {
            match_labels: Some(labels.clone()),
            ..Default::default()
        },
        template: PodTemplateSpec {
            metadata: Some(ObjectMeta {
                labels: Some(labels),
                ..Default::default()
            }),
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: "worker".to_string(),
                    image: Some("cache:v1".to_string()),
                    ..Default::default()
                }],
                ..Default::default()
            }),
        },
        volume_claim_templates: vec![PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some("data".to_string()),
                ..Default::default()
            },
            ..Default::default()
        }],
        service_name: "cache-headless".to_string(),
        pod_management_policy: Default::default(),
        update_strategy: Default::default(),
        revision_history_limit: None,
        reserved_ordinals: Vec::new(),
    }
}

/// A set named `name` in `default` with a fixed uid
pub fn sample_set(name: &str, replicas: i32) -> CacheWorkerSet {
    let mut set = CacheWorkerSet::new(name, sample_spec(replicas));
    set.metadata.namespace = Some("default".to_string());
    set.metadata.uid = Some(format!("uid-{name}"));
    set.metadata.generation = Some(1);
    set
}

/// A sample set whose pods carry the `advanced_statefulset` worker type
pub fn advanced_set(name: &str, replicas: i32) -> CacheWorkerSet {
    let mut set = sample_set(name, replicas);
    if let Some(meta) = set.spec.template.metadata.as_mut() {
        meta.annotations = Some(BTreeMap::from([(
            WORKER_TYPE_ANNOTATION.to_string(),
            WorkerType::AdvancedStatefulSet.as_str().to_string(),
        )]));
    }
    set
}

fn ready_status(ready: bool) -> PodStatus {
    PodStatus {
        phase: Some("Running".to_string()),
        conditions: Some(vec![PodCondition {
            type_: "Ready".to_string(),
            status: if ready { "True" } else { "False" }.to_string(),
            ..Default::default()
        }]),
        ..Default::default()
    }
}

/// A running, ready pod of `set` at `ordinal` labelled with `revision`
pub fn ready_pod(set: &CacheWorkerSet, ordinal: i32, revision: &str) -> Pod {
    let mut pod = new_pod(set, &set.spec.template, ordinal);
    set_pod_revision(&mut pod, revision);
    pod.status = Some(ready_status(true));
    pod
}

// =============================================================================
// FakeCluster
// =============================================================================

#[derive(Default)]
struct State {
    sets: BTreeMap<String, CacheWorkerSet>,
    pods: BTreeMap<String, Pod>,
    claims: BTreeMap<String, PersistentVolumeClaim>,
    revisions: BTreeMap<String, ControllerRevision>,
    version: u64,
    uids: u64,
    writes: usize,
    graceful: bool,
    conflicting_replaces: usize,
    replace_attempts: usize,
}

impl State {
    fn next_version(&mut self) -> Option<String> {
        self.version += 1;
        Some(self.version.to_string())
    }

    fn next_uid(&mut self) -> Option<String> {
        self.uids += 1;
        Some(format!("fake-uid-{}", self.uids))
    }
}

fn not_found(kind: &str, name: &str) -> Error {
    Error::api(404, "NotFound", format!("{kind} \"{name}\" not found"))
}

fn already_exists(kind: &str, name: &str) -> Error {
    Error::api(409, "AlreadyExists", format!("{kind} \"{name}\" already exists"))
}

fn conflict(kind: &str, name: &str) -> Error {
    Error::api(
        409,
        "Conflict",
        format!("Operation cannot be fulfilled on {kind} \"{name}\": the object has been modified"),
    )
}

fn check_version(
    kind: &str,
    name: &str,
    stored: &Option<String>,
    requested: &Option<String>,
) -> Result<(), Error> {
    match requested {
        Some(rv) if Some(rv) != stored.as_ref() => Err(conflict(kind, name)),
        _ => Ok(()),
    }
}

/// In-memory apiserver holding one namespace worth of objects
#[derive(Default)]
pub struct FakeCluster {
    state: Mutex<State>,
}

impl FakeCluster {
    /// Empty cluster with immediate pod deletion
    pub fn new() -> Self {
        Self::default()
    }

    fn with<T>(&self, f: impl FnOnce(&mut State) -> T) -> T {
        let mut state = self.state.lock().unwrap();
        f(&mut state)
    }

    /// Store a set and return it as stored
    pub fn add_set(&self, mut set: CacheWorkerSet) -> CacheWorkerSet {
        self.with(|s| {
            if set.metadata.uid.is_none() {
                set.metadata.uid = s.next_uid();
            }
            set.metadata.generation.get_or_insert(1);
            set.metadata.resource_version = s.next_version();
            s.sets.insert(set.name_any(), set.clone());
            set
        })
    }

    /// Replace a stored set as a user edit would, bumping its generation
    pub fn put_set(&self, mut set: CacheWorkerSet) {
        self.with(|s| {
            set.metadata.generation = Some(set.metadata.generation.unwrap_or(0) + 1);
            set.metadata.resource_version = s.next_version();
            s.sets.insert(set.name_any(), set);
        })
    }

    /// Change a set's replicas
    pub fn set_replicas(&self, name: &str, replicas: i32) {
        let mut set = self.set(name).unwrap();
        set.spec.replicas = Some(replicas);
        self.put_set(set);
    }

    /// Overwrite a set's status without counting a write
    pub fn store_status(&self, name: &str, status: CacheWorkerSetStatus) {
        self.with(|s| {
            if let Some(set) = s.sets.get_mut(name) {
                set.status = Some(status);
            }
        })
    }

    /// Stored set
    pub fn set(&self, name: &str) -> Option<CacheWorkerSet> {
        self.with(|s| s.sets.get(name).cloned())
    }

    /// Store a pod and return it as stored
    pub fn add_pod(&self, mut pod: Pod) -> Pod {
        self.with(|s| {
            if pod.metadata.uid.is_none() {
                pod.metadata.uid = s.next_uid();
            }
            pod.metadata.resource_version = s.next_version();
            s.pods.insert(pod.name_any(), pod.clone());
            pod
        })
    }

    /// Stored pod
    pub fn pod(&self, name: &str) -> Option<Pod> {
        self.with(|s| s.pods.get(name).cloned())
    }

    /// Every pod name, sorted
    pub fn pod_names(&self) -> Vec<String> {
        self.with(|s| s.pods.keys().cloned().collect())
    }

    /// Pods selected by and belonging to `set`, ascending by ordinal
    pub fn member_pods(&self, set: &CacheWorkerSet) -> Vec<Pod> {
        let mut pods: Vec<Pod> = self.with(|s| {
            s.pods
                .values()
                .filter(|p| selector_matches(&set.spec.selector, p.labels()))
                .filter(|p| is_member_of(set, p))
                .cloned()
                .collect()
        });
        pods.sort_by_key(|p| ordinal_of(p).unwrap_or(i32::MAX));
        pods
    }

    /// Modify a stored pod in place
    pub fn edit_pod(&self, name: &str, f: impl FnOnce(&mut Pod)) {
        self.with(|s| {
            if s.pods.contains_key(name) {
                let version = s.next_version();
                let pod = s.pods.get_mut(name).expect("pod present");
                f(pod);
                pod.metadata.resource_version = version;
            }
        })
    }

    /// Set a pod's phase
    pub fn set_phase(&self, name: &str, phase: &str) {
        self.edit_pod(name, |p| {
            p.status.get_or_insert_with(Default::default).phase = Some(phase.to_string());
        });
    }

    /// Make a pod Running and Ready
    pub fn mark_ready(&self, name: &str) {
        self.edit_pod(name, |p| p.status = Some(ready_status(true)));
    }

    /// Make a pod Running but not Ready
    pub fn mark_not_ready(&self, name: &str) {
        self.edit_pod(name, |p| p.status = Some(ready_status(false)));
    }

    /// Make every pod that is not terminating Running and Ready
    pub fn mark_all_ready(&self) {
        for name in self.pod_names() {
            if self
                .pod(&name)
                .is_some_and(|p| p.metadata.deletion_timestamp.is_none())
            {
                self.mark_ready(&name);
            }
        }
    }

    /// Leave deleted pods terminating until [`Self::finish_terminating`]
    pub fn enable_graceful_deletion(&self) {
        self.with(|s| s.graceful = true);
    }

    /// Remove every terminating pod
    pub fn finish_terminating(&self) {
        self.with(|s| s.pods.retain(|_, p| p.metadata.deletion_timestamp.is_none()));
    }

    /// Fail the next `n` pod replaces with a conflict
    pub fn fail_pod_replaces_with_conflict(&self, n: usize) {
        self.with(|s| s.conflicting_replaces = n);
    }

    /// Pod replaces attempted so far
    pub fn pod_replace_attempts(&self) -> usize {
        self.with(|s| s.replace_attempts)
    }

    /// Every claim name, sorted
    pub fn claim_names(&self) -> Vec<String> {
        self.with(|s| s.claims.keys().cloned().collect())
    }

    /// Store a revision as-is
    pub fn add_revision(&self, mut revision: ControllerRevision) {
        self.with(|s| {
            revision.metadata.resource_version = s.next_version();
            s.revisions.insert(revision.name_any(), revision);
        })
    }

    /// Every revision name, sorted
    pub fn revision_names(&self) -> Vec<String> {
        self.with(|s| s.revisions.keys().cloned().collect())
    }

    /// Write calls received so far, failed ones included
    pub fn write_count(&self) -> usize {
        self.with(|s| s.writes)
    }
}

#[async_trait]
impl WorkloadClient for FakeCluster {
    async fn get_set(&self, _namespace: &str, name: &str) -> Result<Option<CacheWorkerSet>, Error> {
        Ok(self.set(name))
    }

    async fn patch_set_status(
        &self,
        _namespace: &str,
        name: &str,
        resource_version: Option<String>,
        status: &CacheWorkerSetStatus,
    ) -> Result<CacheWorkerSet, Error> {
        self.with(|s| {
            s.writes += 1;
            let version = s.next_version();
            let set = s
                .sets
                .get_mut(name)
                .ok_or_else(|| not_found("cacheworkersets", name))?;
            check_version(
                "cacheworkersets",
                name,
                &set.metadata.resource_version,
                &resource_version,
            )?;
            set.status = Some(status.clone());
            set.metadata.resource_version = version;
            Ok(set.clone())
        })
    }

    async fn patch_set_annotations(
        &self,
        _namespace: &str,
        name: &str,
        resource_version: Option<String>,
        annotations: &BTreeMap<String, String>,
    ) -> Result<CacheWorkerSet, Error> {
        self.with(|s| {
            s.writes += 1;
            let version = s.next_version();
            let set = s
                .sets
                .get_mut(name)
                .ok_or_else(|| not_found("cacheworkersets", name))?;
            check_version(
                "cacheworkersets",
                name,
                &set.metadata.resource_version,
                &resource_version,
            )?;
            set.annotations_mut().extend(annotations.clone());
            set.metadata.resource_version = version;
            Ok(set.clone())
        })
    }

    async fn list_pods(&self, _namespace: &str, selector: &LabelSelector) -> Result<Vec<Pod>, Error> {
        Ok(self.with(|s| {
            s.pods
                .values()
                .filter(|p| selector_matches(selector, p.labels()))
                .cloned()
                .collect()
        }))
    }

    async fn get_pod(&self, _namespace: &str, name: &str) -> Result<Option<Pod>, Error> {
        Ok(self.pod(name))
    }

    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<Pod, Error> {
        self.with(|s| {
            s.writes += 1;
            let name = pod.name_any();
            if s.pods.contains_key(&name) {
                return Err(already_exists("pods", &name));
            }
            let mut created = pod.clone();
            created.metadata.namespace = Some(namespace.to_string());
            created.metadata.uid = s.next_uid();
            created.metadata.resource_version = s.next_version();
            created.status = Some(PodStatus {
                phase: Some("Pending".to_string()),
                ..Default::default()
            });
            s.pods.insert(name, created.clone());
            Ok(created)
        })
    }

    async fn replace_pod(&self, _namespace: &str, pod: &Pod) -> Result<Pod, Error> {
        self.with(|s| {
            s.writes += 1;
            s.replace_attempts += 1;
            let name = pod.name_any();
            if s.conflicting_replaces > 0 {
                s.conflicting_replaces -= 1;
                return Err(conflict("pods", &name));
            }
            let version = s.next_version();
            let stored = s.pods.get_mut(&name).ok_or_else(|| not_found("pods", &name))?;
            check_version(
                "pods",
                &name,
                &stored.metadata.resource_version,
                &pod.metadata.resource_version,
            )?;
            let mut replaced = pod.clone();
            replaced.metadata.uid = stored.metadata.uid.clone();
            replaced.metadata.deletion_timestamp = stored.metadata.deletion_timestamp.clone();
            replaced.metadata.resource_version = version;
            replaced.status = stored.status.clone();
            *stored = replaced.clone();
            Ok(replaced)
        })
    }

    async fn patch_pod_annotations(
        &self,
        _namespace: &str,
        name: &str,
        annotations: &BTreeMap<String, String>,
    ) -> Result<Pod, Error> {
        self.with(|s| {
            s.writes += 1;
            let version = s.next_version();
            let pod = s.pods.get_mut(name).ok_or_else(|| not_found("pods", name))?;
            pod.annotations_mut().extend(annotations.clone());
            pod.metadata.resource_version = version;
            Ok(pod.clone())
        })
    }

    async fn delete_pod(&self, _namespace: &str, name: &str) -> Result<(), Error> {
        self.with(|s| {
            s.writes += 1;
            if !s.pods.contains_key(name) {
                return Err(not_found("pods", name));
            }
            if s.graceful {
                let version = s.next_version();
                if let Some(pod) = s.pods.get_mut(name) {
                    if pod.metadata.deletion_timestamp.is_none() {
                        pod.metadata.deletion_timestamp = Some(Time(Utc::now()));
                        pod.metadata.resource_version = version;
                    }
                }
            } else {
                s.pods.remove(name);
            }
            Ok(())
        })
    }

    async fn get_claim(
        &self,
        _namespace: &str,
        name: &str,
    ) -> Result<Option<PersistentVolumeClaim>, Error> {
        Ok(self.with(|s| s.claims.get(name).cloned()))
    }

    async fn create_claim(
        &self,
        _namespace: &str,
        claim: &PersistentVolumeClaim,
    ) -> Result<PersistentVolumeClaim, Error> {
        self.with(|s| {
            s.writes += 1;
            let name = claim.name_any();
            if s.claims.contains_key(&name) {
                return Err(already_exists("persistentvolumeclaims", &name));
            }
            let mut created = claim.clone();
            created.metadata.uid = s.next_uid();
            created.metadata.resource_version = s.next_version();
            s.claims.insert(name, created.clone());
            Ok(created)
        })
    }

    async fn list_revisions(
        &self,
        _namespace: &str,
        selector: &LabelSelector,
    ) -> Result<Vec<ControllerRevision>, Error> {
        Ok(self.with(|s| {
            s.revisions
                .values()
                .filter(|r| selector_matches(selector, r.labels()))
                .cloned()
                .collect()
        }))
    }

    async fn get_revision(
        &self,
        _namespace: &str,
        name: &str,
    ) -> Result<Option<ControllerRevision>, Error> {
        Ok(self.with(|s| s.revisions.get(name).cloned()))
    }

    async fn create_revision(
        &self,
        _namespace: &str,
        revision: &ControllerRevision,
    ) -> Result<ControllerRevision, Error> {
        self.with(|s| {
            s.writes += 1;
            let name = revision.name_any();
            if s.revisions.contains_key(&name) {
                return Err(already_exists("controllerrevisions", &name));
            }
            let mut created = revision.clone();
            created.metadata.uid = s.next_uid();
            created.metadata.resource_version = s.next_version();
            s.revisions.insert(name, created.clone());
            Ok(created)
        })
    }

    async fn replace_revision(
        &self,
        _namespace: &str,
        revision: &ControllerRevision,
    ) -> Result<ControllerRevision, Error> {
        self.with(|s| {
            s.writes += 1;
            let name = revision.name_any();
            let version = s.next_version();
            let stored = s
                .revisions
                .get_mut(&name)
                .ok_or_else(|| not_found("controllerrevisions", &name))?;
            check_version(
                "controllerrevisions",
                &name,
                &stored.metadata.resource_version,
                &revision.metadata.resource_version,
            )?;
            let mut replaced = revision.clone();
            replaced.metadata.uid = stored.metadata.uid.clone();
            replaced.metadata.resource_version = version;
            *stored = replaced.clone();
            Ok(replaced)
        })
    }

    async fn delete_revision(&self, _namespace: &str, name: &str) -> Result<(), Error> {
        self.with(|s| {
            s.writes += 1;
            s.revisions
                .remove(name)
                .map(|_| ())
                .ok_or_else(|| not_found("controllerrevisions", name))
        })
    }
}

// =============================================================================
// RecordingEventPublisher
// =============================================================================

/// Event publisher that keeps every event for assertions
#[derive(Default)]
pub struct RecordingEventPublisher {
    events: Mutex<Vec<(EventType, String, Option<String>)>>,
}

impl RecordingEventPublisher {
    /// Empty recorder
    pub fn new() -> Self {
        Self::default()
    }

    /// Reasons of recorded events, in order
    pub fn reasons(&self) -> Vec<String> {
        let events = self.events.lock().unwrap();
        events.iter().map(|(_, reason, _)| reason.clone()).collect()
    }

    /// Notes of recorded events, in order
    pub fn notes(&self) -> Vec<String> {
        let events = self.events.lock().unwrap();
        events.iter().filter_map(|(_, _, note)| note.clone()).collect()
    }
}

#[async_trait]
impl EventPublisher for RecordingEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        _action: &str,
        note: Option<String>,
    ) {
        self.events
            .lock()
            .unwrap()
            .push((type_, reason.to_string(), note));
    }
}
