//! Ordinal planning.
//!
//! A set with `replicas = N` owns the first N ordinals that are not reserved.
//! Reserved ordinals come from `spec.reservedOrdinals` and from the
//! `delete-slots` annotation that targeted scale-in writes.

use std::collections::BTreeSet;

use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use tracing::warn;

use crate::crd::CacheWorkerSet;
use crate::identity::ordinal_of;

/// Set annotation holding reserved ordinals as a JSON integer array
pub const DELETE_SLOTS_ANNOTATION: &str = "delete-slots";

/// Ordinals reserved on a set.
///
/// A malformed `delete-slots` annotation is logged and ignored.
pub fn reserved_ordinals(set: &CacheWorkerSet) -> BTreeSet<i32> {
    let mut reserved: BTreeSet<i32> = set
        .spec
        .reserved_ordinals
        .iter()
        .copied()
        .filter(|o| *o >= 0)
        .collect();
    reserved.extend(annotated_slots(set));
    reserved
}

/// Ordinals listed in the `delete-slots` annotation alone
pub fn annotated_slots(set: &CacheWorkerSet) -> BTreeSet<i32> {
    let Some(raw) = set.annotations().get(DELETE_SLOTS_ANNOTATION) else {
        return BTreeSet::new();
    };
    match serde_json::from_str::<Vec<i32>>(raw) {
        Ok(slots) => slots.into_iter().filter(|o| *o >= 0).collect(),
        Err(e) => {
            warn!(
                set = %set.name_any(),
                annotation = DELETE_SLOTS_ANNOTATION,
                value = %raw,
                error = %e,
                "Ignoring malformed reserved ordinal annotation"
            );
            BTreeSet::new()
        }
    }
}

/// Render reserved ordinals for the `delete-slots` annotation
pub fn delete_slots_value(reserved: &BTreeSet<i32>) -> String {
    let slots: Vec<i32> = reserved.iter().copied().collect();
    serde_json::to_string(&slots).unwrap_or_else(|_| "[]".to_string())
}

/// Smallest ceiling giving exactly `replicas` usable ordinals.
///
/// Returns the ceiling together with the reserved ordinals below it; those at
/// or above the ceiling have no effect and are dropped.
pub fn ordinal_ceiling(replicas: i32, reserved: &BTreeSet<i32>) -> (i32, BTreeSet<i32>) {
    let mut ceiling = replicas.max(0);
    let mut effective = BTreeSet::new();
    for &slot in reserved {
        if slot < ceiling {
            ceiling += 1;
            effective.insert(slot);
        }
    }
    (ceiling, effective)
}

/// Every observed pod sorted into a slot or the condemned list
#[derive(Clone, Debug, Default)]
pub struct OrdinalPlan {
    /// One past the highest usable ordinal
    pub ceiling: i32,
    /// Reserved ordinals below the ceiling
    pub reserved: BTreeSet<i32>,
    /// Indexed by ordinal; `None` for empty or reserved slots
    pub slots: Vec<Option<Pod>>,
    /// Pods to remove, ascending by ordinal
    pub condemned: Vec<Pod>,
}

impl OrdinalPlan {
    /// Classify pods against `replicas` and the reserved ordinals.
    ///
    /// Pods whose name carries no ordinal are ignored.
    pub fn build(pods: &[Pod], replicas: i32, reserved: &BTreeSet<i32>) -> Self {
        let (ceiling, reserved) = ordinal_ceiling(replicas, reserved);
        let mut slots: Vec<Option<Pod>> = vec![None; usize::try_from(ceiling).unwrap_or(0)];
        let mut condemned = Vec::new();

        for pod in pods {
            let Some(ordinal) = ordinal_of(pod) else {
                continue;
            };
            if ordinal < ceiling && !reserved.contains(&ordinal) {
                if let Some(slot) = usize::try_from(ordinal).ok().and_then(|i| slots.get_mut(i)) {
                    *slot = Some(pod.clone());
                }
            } else if ordinal >= ceiling || reserved.contains(&ordinal) {
                condemned.push(pod.clone());
            }
        }
        condemned.sort_by_key(|p| ordinal_of(p).unwrap_or(i32::MAX));

        Self {
            ceiling,
            reserved,
            slots,
            condemned,
        }
    }

    /// Whether `ordinal` is a hole
    pub fn is_reserved(&self, ordinal: i32) -> bool {
        self.reserved.contains(&ordinal)
    }

    /// Usable ordinals with no pod, ascending
    pub fn missing_ordinals(&self) -> Vec<i32> {
        (0..self.ceiling)
            .filter(|o| !self.is_reserved(*o))
            .filter(|o| {
                usize::try_from(*o)
                    .ok()
                    .and_then(|i| self.slots.get(i))
                    .is_some_and(Option::is_none)
            })
            .collect()
    }

    /// Usable ordinals, ascending
    pub fn usable_ordinals(&self) -> impl Iterator<Item = i32> + '_ {
        (0..self.ceiling).filter(|o| !self.is_reserved(*o))
    }
}
