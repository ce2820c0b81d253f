//! Shared types for the CacheWorkerSet CRD

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// How pods are created and removed across ordinals
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum PodManagementPolicy {
    /// Strictly sequential: one pod changes at a time, lower ordinals first on
    /// scale-up and higher ordinals first on scale-down
    #[default]
    OrderedReady,
    /// Create and delete without waiting for neighbours to become ready
    Parallel,
}

/// Strategy used to roll pods onto a new template revision
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum UpdateStrategyType {
    /// Replace out-of-date pods highest ordinal first, down to the partition
    #[default]
    RollingUpdate,
    /// Only replace pods when they are deleted by someone else
    OnDelete,
}

/// Parameters for the RollingUpdate strategy
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RollingUpdateStrategy {
    /// Ordinals at or above the partition are updated; lower ones keep the
    /// current revision
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition: Option<i32>,
}

/// Update strategy for a CacheWorkerSet
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UpdateStrategy {
    /// Strategy type (defaults to RollingUpdate)
    #[serde(rename = "type", default)]
    pub type_: UpdateStrategyType,

    /// RollingUpdate parameters
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rolling_update: Option<RollingUpdateStrategy>,
}

impl UpdateStrategy {
    /// Partition ordinal, if a rollingUpdate block is present
    pub fn partition(&self) -> Option<i32> {
        self.rolling_update
            .as_ref()
            .map(|r| r.partition.unwrap_or(0))
    }
}

/// Condition status following Kubernetes conventions
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// Condition is true
    True,
    /// Condition is false
    False,
    /// Condition status is unknown
    #[default]
    Unknown,
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::True => write!(f, "True"),
            Self::False => write!(f, "False"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Kubernetes-style condition for status reporting
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct Condition {
    /// Type of condition (e.g., Ready, Updated)
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition (True, False, Unknown)
    pub status: ConditionStatus,

    /// Machine-readable reason for the condition
    pub reason: String,

    /// Human-readable message
    pub message: String,

    /// Last time the condition transitioned
    #[serde(rename = "lastTransitionTime")]
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    /// Create a new condition with the current timestamp
    pub fn new(
        type_: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_: type_.into(),
            status,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: Utc::now(),
        }
    }

    /// Keep the previous transition time when the status did not flip
    pub fn carry_transition_time(mut self, previous: Option<&Condition>) -> Self {
        if let Some(prev) = previous {
            if prev.status == self.status {
                self.last_transition_time = prev.last_transition_time;
            }
        }
        self
    }
}
