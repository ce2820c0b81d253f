//! CacheWorkerSet Custom Resource Definition
//!
//! A CacheWorkerSet runs a fixed number of cache worker pods with stable
//! ordinal identities. It behaves like a StatefulSet with two additions:
//! ordinals can be reserved (left as holes) and pods can be removed by name
//! through a two-phase, annotation-driven scale-in.

use k8s_openapi::api::core::v1::{PersistentVolumeClaim, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{Condition, PodManagementPolicy, UpdateStrategy, UpdateStrategyType};
use crate::identity::selector_matches;
use crate::DEFAULT_REVISION_HISTORY_LIMIT;

/// Specification for a CacheWorkerSet
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "data.fluid.io",
    version = "v1alpha1",
    kind = "CacheWorkerSet",
    plural = "cacheworkersets",
    shortname = "cws",
    status = "CacheWorkerSetStatus",
    namespaced,
    printcolumn = r#"{"name":"Desired","type":"integer","jsonPath":".spec.replicas"}"#,
    printcolumn = r#"{"name":"Ready","type":"integer","jsonPath":".status.readyReplicas"}"#,
    printcolumn = r#"{"name":"Updated","type":"integer","jsonPath":".status.updatedReplicas"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct CacheWorkerSetSpec {
    /// Desired number of pods (defaults to 1)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,

    /// Label selector for pods owned by this set
    pub selector: LabelSelector,

    /// Template for the pods this set creates
    pub template: PodTemplateSpec,

    /// Claims created per ordinal and mounted into the pod
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volume_claim_templates: Vec<PersistentVolumeClaim>,

    /// Headless service that governs pod DNS names
    #[serde(default)]
    pub service_name: String,

    /// Ordered (one pod at a time) or parallel pod management
    #[serde(default)]
    pub pod_management_policy: PodManagementPolicy,

    /// How pods are moved onto a new template revision
    #[serde(default)]
    pub update_strategy: UpdateStrategy,

    /// Number of old revisions to keep (defaults to 10)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision_history_limit: Option<i32>,

    /// Ordinals that are never filled
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reserved_ordinals: Vec<i32>,
}

impl CacheWorkerSetSpec {
    /// Desired replica count
    pub fn replicas(&self) -> i32 {
        self.replicas.unwrap_or(1)
    }

    /// Number of revisions kept besides current and update
    pub fn revision_history_limit(&self) -> i32 {
        self.revision_history_limit
            .unwrap_or(DEFAULT_REVISION_HISTORY_LIMIT)
    }

    /// Partition for rolling updates, if configured
    pub fn partition(&self) -> Option<i32> {
        self.update_strategy.partition()
    }

    /// Pods are created and removed without waiting on their neighbours
    pub fn is_parallel(&self) -> bool {
        self.pod_management_policy == PodManagementPolicy::Parallel
    }

    /// Pods are only replaced when something else deletes them
    pub fn is_on_delete(&self) -> bool {
        self.update_strategy.type_ == UpdateStrategyType::OnDelete
    }

    /// Validate the set specification
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.replicas() < 0 {
            return Err(crate::Error::validation(format!(
                "replicas must not be negative, got {}",
                self.replicas()
            )));
        }

        let has_labels = self
            .selector
            .match_labels
            .as_ref()
            .is_some_and(|l| !l.is_empty());
        let has_expressions = self
            .selector
            .match_expressions
            .as_ref()
            .is_some_and(|e| !e.is_empty());
        if !has_labels && !has_expressions {
            return Err(crate::Error::validation("selector must not be empty"));
        }

        let template_labels = self
            .template
            .metadata
            .as_ref()
            .and_then(|m| m.labels.clone())
            .unwrap_or_default();
        if !selector_matches(&self.selector, &template_labels) {
            return Err(crate::Error::validation(
                "selector does not match template labels",
            ));
        }

        if let Some(ordinal) = self.reserved_ordinals.iter().find(|o| **o < 0) {
            return Err(crate::Error::validation(format!(
                "reserved ordinal must not be negative, got {ordinal}"
            )));
        }

        if let Some(partition) = self.partition() {
            if partition < 0 {
                return Err(crate::Error::validation(format!(
                    "partition must not be negative, got {partition}"
                )));
            }
        }

        if self.revision_history_limit.is_some_and(|l| l < 0) {
            return Err(crate::Error::validation(
                "revisionHistoryLimit must not be negative",
            ));
        }

        for claim in &self.volume_claim_templates {
            if claim.metadata.name.as_deref().unwrap_or_default().is_empty() {
                return Err(crate::Error::validation(
                    "volumeClaimTemplates entries must be named",
                ));
            }
        }

        Ok(())
    }
}

/// Status for a CacheWorkerSet
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CacheWorkerSetStatus {
    /// Generation most recently acted on
    #[serde(default)]
    pub observed_generation: i64,

    /// Number of pods observed for this set
    #[serde(default)]
    pub replicas: i32,

    /// Number of running and ready pods
    #[serde(default)]
    pub ready_replicas: i32,

    /// Number of pods at the current revision
    #[serde(default)]
    pub current_replicas: i32,

    /// Number of pods at the update revision
    #[serde(default)]
    pub updated_replicas: i32,

    /// Revision used for pods below the partition
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub current_revision: String,

    /// Revision pods are being moved onto
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub update_revision: String,

    /// Incremented whenever a revision name collides with different content
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collision_count: Option<i32>,

    /// Current conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl CacheWorkerSetStatus {
    /// Look up a condition by type
    pub fn condition(&self, type_: &str) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.type_ == type_)
    }

    /// Replace (or add) the condition with the same type
    pub fn set_condition(&mut self, condition: Condition) {
        match self
            .conditions
            .iter_mut()
            .find(|c| c.type_ == condition.type_)
        {
            Some(existing) => *existing = condition,
            None => self.conditions.push(condition),
        }
    }
}
