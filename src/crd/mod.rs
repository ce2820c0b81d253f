//! Custom Resource Definitions for the cache worker set controller
//!
//! This module contains the CacheWorkerSet CRD and its shared status types.

mod types;
mod workerset;

pub use types::{
    Condition, ConditionStatus, PodManagementPolicy, RollingUpdateStrategy, UpdateStrategy,
    UpdateStrategyType,
};
pub use workerset::{CacheWorkerSet, CacheWorkerSetSpec, CacheWorkerSetStatus};
