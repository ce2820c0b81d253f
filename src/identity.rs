//! Pod identity, storage and health derivation.
//!
//! Everything here is a pure function of the set and the pod. The same
//! functions decide what a new pod looks like and whether an existing pod
//! still matches, so the two can never drift apart.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    PersistentVolumeClaim, PersistentVolumeClaimVolumeSource, Pod, PodSpec, PodTemplateSpec,
    Volume,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use kube::{Resource, ResourceExt};

use crate::crd::CacheWorkerSet;

/// Label carrying a pod's own name, used for per-pod services
pub const POD_NAME_LABEL: &str = "statefulset.kubernetes.io/pod-name";

/// Label carrying the revision that produced a pod
pub const REVISION_LABEL: &str = "controller-revision-hash";

/// Name of the pod at `ordinal`
pub fn pod_name(set_name: &str, ordinal: i32) -> String {
    format!("{set_name}-{ordinal}")
}

/// Split a pod name into its parent set name and ordinal.
///
/// Returns `None` unless the name ends in `-<digits>`.
pub fn parent_and_ordinal(name: &str) -> Option<(&str, i32)> {
    let (parent, suffix) = name.rsplit_once('-')?;
    if parent.is_empty() || suffix.is_empty() || !suffix.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let ordinal = suffix.parse::<i32>().ok()?;
    Some((parent, ordinal))
}

/// Ordinal encoded in a pod's name
pub fn ordinal_of(pod: &Pod) -> Option<i32> {
    parent_and_ordinal(pod.metadata.name.as_deref()?).map(|(_, o)| o)
}

/// Name of the claim for `template` at `ordinal`
pub fn claim_name(set_name: &str, template_name: &str, ordinal: i32) -> String {
    format!("{template_name}-{set_name}-{ordinal}")
}

/// Whether the pod's name identifies it as a member of `set`.
///
/// Pods controlled by another object are never members.
pub fn is_member_of(set: &CacheWorkerSet, pod: &Pod) -> bool {
    let named = pod
        .metadata
        .name
        .as_deref()
        .and_then(parent_and_ordinal)
        .is_some_and(|(parent, _)| parent == set.name_any());
    if !named {
        return false;
    }
    match (pod.controller_owner_ref(&()), set.uid()) {
        (Some(owner), Some(uid)) => owner.uid == uid,
        _ => true,
    }
}

/// Whether name, namespace and the pod-name label agree with the ordinal
pub fn identity_matches(set: &CacheWorkerSet, pod: &Pod) -> bool {
    let Some(name) = pod.metadata.name.as_deref() else {
        return false;
    };
    let Some((parent, ordinal)) = parent_and_ordinal(name) else {
        return false;
    };
    let set_name = set.name_any();
    ordinal >= 0
        && parent == set_name
        && name == pod_name(&set_name, ordinal)
        && pod.metadata.namespace == set.metadata.namespace
        && pod.labels().get(POD_NAME_LABEL).map(String::as_str) == Some(name)
}

/// Whether every claim template is mounted from the claim for this ordinal
pub fn storage_matches(set: &CacheWorkerSet, pod: &Pod) -> bool {
    let Some(ordinal) = ordinal_of(pod) else {
        return false;
    };
    let set_name = set.name_any();
    let volumes: BTreeMap<&str, &Volume> = pod
        .spec
        .iter()
        .flat_map(|s| s.volumes.iter().flatten())
        .map(|v| (v.name.as_str(), v))
        .collect();

    set.spec.volume_claim_templates.iter().all(|template| {
        let template_name = template.metadata.name.as_deref().unwrap_or_default();
        volumes
            .get(template_name)
            .and_then(|v| v.persistent_volume_claim.as_ref())
            .is_some_and(|pvc| pvc.claim_name == claim_name(&set_name, template_name, ordinal))
    })
}

/// Claims the pod needs, keyed by claim template name
pub fn claims_for_pod(set: &CacheWorkerSet, pod: &Pod) -> BTreeMap<String, PersistentVolumeClaim> {
    let Some(ordinal) = ordinal_of(pod) else {
        return BTreeMap::new();
    };
    let set_name = set.name_any();
    let match_labels = set.spec.selector.match_labels.clone().unwrap_or_default();

    set.spec
        .volume_claim_templates
        .iter()
        .map(|template| {
            let template_name = template.metadata.name.clone().unwrap_or_default();
            let mut claim = template.clone();
            claim.metadata.name = Some(claim_name(&set_name, &template_name, ordinal));
            claim.metadata.namespace = set.metadata.namespace.clone();
            claim
                .metadata
                .labels
                .get_or_insert_with(BTreeMap::new)
                .extend(match_labels.clone());
            claim.status = None;
            (template_name, claim)
        })
        .collect()
}

/// Point the pod's claim-backed volumes at the claims for its ordinal.
///
/// Volumes that do not belong to a claim template are kept as they are.
pub fn update_storage(set: &CacheWorkerSet, pod: &mut Pod) {
    let claims = claims_for_pod(set, pod);
    let spec = pod.spec.get_or_insert_with(PodSpec::default);
    let current = spec.volumes.take().unwrap_or_default();

    let mut volumes: Vec<Volume> = claims
        .iter()
        .map(|(template_name, claim)| Volume {
            name: template_name.clone(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: claim.metadata.name.clone().unwrap_or_default(),
                read_only: Some(false),
            }),
            ..Default::default()
        })
        .collect();
    volumes.extend(
        current
            .into_iter()
            .filter(|v| !claims.contains_key(&v.name)),
    );

    if !volumes.is_empty() {
        spec.volumes = Some(volumes);
    }
}

/// Bring name, namespace and the pod-name label back in line with the ordinal
pub fn update_identity(set: &CacheWorkerSet, pod: &mut Pod) {
    if let Some(ordinal) = ordinal_of(pod) {
        pod.metadata.name = Some(pod_name(&set.name_any(), ordinal));
    }
    pod.metadata.namespace = set.metadata.namespace.clone();
    let name = pod.metadata.name.clone().unwrap_or_default();
    pod.labels_mut().insert(POD_NAME_LABEL.to_string(), name);
}

/// Set identity plus the fields that are immutable after creation
pub fn init_identity(set: &CacheWorkerSet, pod: &mut Pod) {
    update_identity(set, pod);
    let name = pod.metadata.name.clone();
    let spec = pod.spec.get_or_insert_with(PodSpec::default);
    spec.hostname = name;
    if !set.spec.service_name.is_empty() {
        spec.subdomain = Some(set.spec.service_name.clone());
    }
}

/// Revision label of a pod, empty when missing
pub fn pod_revision(pod: &Pod) -> &str {
    pod.labels()
        .get(REVISION_LABEL)
        .map(String::as_str)
        .unwrap_or_default()
}

/// Stamp the revision label onto a pod
pub fn set_pod_revision(pod: &mut Pod, revision: &str) {
    pod.labels_mut()
        .insert(REVISION_LABEL.to_string(), revision.to_string());
}

/// Build the pod for `ordinal` from a template
pub fn new_pod(set: &CacheWorkerSet, template: &PodTemplateSpec, ordinal: i32) -> Pod {
    let template_meta = template.metadata.clone().unwrap_or_default();
    let mut pod = Pod {
        metadata: ObjectMeta {
            name: Some(pod_name(&set.name_any(), ordinal)),
            generate_name: Some(format!("{}-", set.name_any())),
            labels: template_meta.labels,
            annotations: template_meta.annotations,
            finalizers: template_meta.finalizers,
            owner_references: set.controller_owner_ref(&()).map(|r| vec![r]),
            ..Default::default()
        },
        spec: template.spec.clone(),
        status: None,
    };
    init_identity(set, &mut pod);
    update_storage(set, &mut pod);
    pod
}

/// The pod has been accepted by a kubelet (it has a phase)
pub fn is_created(pod: &Pod) -> bool {
    phase(pod).is_some_and(|p| !p.is_empty())
}

/// The pod terminated with a failure
pub fn is_failed(pod: &Pod) -> bool {
    phase(pod) == Some("Failed")
}

/// The pod terminated successfully
pub fn is_succeeded(pod: &Pod) -> bool {
    phase(pod) == Some("Succeeded")
}

/// Deletion of the pod has been requested
pub fn is_terminating(pod: &Pod) -> bool {
    pod.metadata.deletion_timestamp.is_some()
}

/// Running with a Ready=True condition
pub fn is_running_and_ready(pod: &Pod) -> bool {
    phase(pod) == Some("Running")
        && pod
            .status
            .as_ref()
            .and_then(|s| s.conditions.as_ref())
            .is_some_and(|c| c.iter().any(|c| c.type_ == "Ready" && c.status == "True"))
}

/// Running, ready and not being deleted
pub fn is_healthy(pod: &Pod) -> bool {
    is_running_and_ready(pod) && !is_terminating(pod)
}

fn phase(pod: &Pod) -> Option<&str> {
    pod.status.as_ref().and_then(|s| s.phase.as_deref())
}

/// Render a label selector in the apiserver's query syntax
pub fn label_selector_string(selector: &LabelSelector) -> String {
    let mut parts: Vec<String> = selector
        .match_labels
        .iter()
        .flatten()
        .map(|(k, v)| format!("{k}={v}"))
        .collect();

    for expr in selector.match_expressions.iter().flatten() {
        let values = expr.values.clone().unwrap_or_default().join(",");
        parts.push(match expr.operator.as_str() {
            "In" => format!("{} in ({values})", expr.key),
            "NotIn" => format!("{} notin ({values})", expr.key),
            "Exists" => expr.key.clone(),
            "DoesNotExist" => format!("!{}", expr.key),
            other => format!("{} {other} ({values})", expr.key),
        });
    }
    parts.join(",")
}

/// Whether `labels` satisfy `selector`.
///
/// An empty selector matches nothing. Unknown operators never match.
pub fn selector_matches(selector: &LabelSelector, labels: &BTreeMap<String, String>) -> bool {
    let match_labels = selector.match_labels.as_ref();
    let expressions = selector.match_expressions.as_ref();
    if match_labels.is_none_or(|m| m.is_empty()) && expressions.is_none_or(|e| e.is_empty()) {
        return false;
    }

    let labels_ok = match_labels
        .into_iter()
        .flatten()
        .all(|(k, v)| labels.get(k) == Some(v));

    let expressions_ok = expressions.into_iter().flatten().all(|expr| {
        let values = expr.values.as_deref().unwrap_or_default();
        let value = labels.get(&expr.key);
        match expr.operator.as_str() {
            "In" => value.is_some_and(|v| values.contains(v)),
            "NotIn" => value.is_none_or(|v| !values.contains(v)),
            "Exists" => value.is_some(),
            "DoesNotExist" => value.is_none(),
            _ => false,
        }
    });

    labels_ok && expressions_ok
}
