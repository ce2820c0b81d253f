//! The three kinds of pod set a cache runtime can run its workers in.
//!
//! Callers outside the controller (dataset binding, runtime setup) only need a
//! handful of facts about a worker set: how many replicas it wants, how many
//! are ready, which pods it selects. [`WorkerSet`] answers those uniformly for
//! a plain StatefulSet, a DaemonSet or a CacheWorkerSet, resolved once through
//! [`WorkerSet::lookup`].

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{DaemonSet, StatefulSet};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::api::{Api, PostParams};
use kube::{Client, ResourceExt};
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use crate::crd::CacheWorkerSet;
use crate::retry::{retry_on, RetryPolicy};
use crate::Error;

/// Pod template annotation naming the kind of set a worker runs in
pub const WORKER_TYPE_ANNOTATION: &str = "fluid.io/workerset-type";

/// Kind of pod set backing a cache runtime's workers
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum WorkerType {
    /// apps/v1 StatefulSet
    #[default]
    StatefulSet,
    /// CacheWorkerSet with targeted scale-in
    AdvancedStatefulSet,
    /// apps/v1 DaemonSet
    DaemonSet,
}

impl WorkerType {
    /// Annotation value for this type
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StatefulSet => "statefulset",
            Self::AdvancedStatefulSet => "advanced_statefulset",
            Self::DaemonSet => "daemonset",
        }
    }
}

impl fmt::Display for WorkerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkerType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "statefulset" => Ok(Self::StatefulSet),
            "advanced_statefulset" => Ok(Self::AdvancedStatefulSet),
            "daemonset" => Ok(Self::DaemonSet),
            other => Err(Error::validation(format!(
                "unsupported worker type '{other}'"
            ))),
        }
    }
}

/// Reads and writes the objects a [`WorkerSet`] can wrap
#[cfg_attr(test, automock)]
#[async_trait]
pub trait WorkerSetSource: Send + Sync {
    /// Fetch a StatefulSet
    async fn get_statefulset(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<StatefulSet>, Error>;

    /// Fetch a DaemonSet
    async fn get_daemonset(&self, namespace: &str, name: &str)
        -> Result<Option<DaemonSet>, Error>;

    /// Fetch a CacheWorkerSet
    async fn get_cache_worker_set(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<CacheWorkerSet>, Error>;

    /// Replace a CacheWorkerSet (fails with a conflict on a stale resourceVersion)
    async fn replace_cache_worker_set(
        &self,
        namespace: &str,
        set: &CacheWorkerSet,
    ) -> Result<CacheWorkerSet, Error>;
}

/// [`WorkerSetSource`] backed by the Kubernetes API
pub struct KubeWorkerSetSource {
    client: Client,
    field_manager: String,
}

impl KubeWorkerSetSource {
    /// Create a source writing under the given field manager
    pub fn new(client: Client, field_manager: impl Into<String>) -> Self {
        Self {
            client,
            field_manager: field_manager.into(),
        }
    }
}

#[async_trait]
impl WorkerSetSource for KubeWorkerSetSource {
    async fn get_statefulset(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<StatefulSet>, Error> {
        let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn get_daemonset(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DaemonSet>, Error> {
        let api: Api<DaemonSet> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn get_cache_worker_set(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<CacheWorkerSet>, Error> {
        let api: Api<CacheWorkerSet> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn replace_cache_worker_set(
        &self,
        namespace: &str,
        set: &CacheWorkerSet,
    ) -> Result<CacheWorkerSet, Error> {
        let api: Api<CacheWorkerSet> = Api::namespaced(self.client.clone(), namespace);
        let params = PostParams {
            field_manager: Some(self.field_manager.clone()),
            ..Default::default()
        };
        Ok(api.replace(&set.name_any(), &params, set).await?)
    }
}

/// A resolved worker set of one of the supported kinds
#[derive(Clone, Debug)]
pub enum WorkerSet {
    /// Plain StatefulSet
    StatefulSet(Box<StatefulSet>),
    /// CacheWorkerSet
    Advanced(Box<CacheWorkerSet>),
    /// DaemonSet
    DaemonSet(Box<DaemonSet>),
}

impl WorkerSet {
    /// Fetch the worker set `namespace/name` of the given kind.
    ///
    /// A missing object is reported as [`Error::NotFound`].
    pub async fn lookup(
        source: &dyn WorkerSetSource,
        name: &str,
        namespace: &str,
        worker_type: WorkerType,
    ) -> Result<Self, Error> {
        let missing = || Error::not_found(format!("{worker_type} {namespace}/{name}"));
        let set = match worker_type {
            WorkerType::StatefulSet => source
                .get_statefulset(namespace, name)
                .await?
                .map(|s| Self::StatefulSet(Box::new(s))),
            WorkerType::AdvancedStatefulSet => source
                .get_cache_worker_set(namespace, name)
                .await?
                .map(|s| Self::Advanced(Box::new(s))),
            WorkerType::DaemonSet => source
                .get_daemonset(namespace, name)
                .await?
                .map(|s| Self::DaemonSet(Box::new(s))),
        };
        set.ok_or_else(missing)
    }

    /// Kind of the wrapped set
    pub fn worker_type(&self) -> WorkerType {
        match self {
            Self::StatefulSet(_) => WorkerType::StatefulSet,
            Self::Advanced(_) => WorkerType::AdvancedStatefulSet,
            Self::DaemonSet(_) => WorkerType::DaemonSet,
        }
    }

    /// Object name
    pub fn name(&self) -> String {
        match self {
            Self::StatefulSet(s) => s.name_any(),
            Self::Advanced(s) => s.name_any(),
            Self::DaemonSet(s) => s.name_any(),
        }
    }

    /// Object namespace
    pub fn namespace(&self) -> Option<String> {
        match self {
            Self::StatefulSet(s) => s.namespace(),
            Self::Advanced(s) => s.namespace(),
            Self::DaemonSet(s) => s.namespace(),
        }
    }

    /// Desired replica count.
    ///
    /// A DaemonSet has no desired count of its own; the number of nodes it
    /// is currently scheduled on stands in.
    pub fn replicas(&self) -> i32 {
        match self {
            Self::StatefulSet(s) => s.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1),
            Self::Advanced(s) => s.spec.replicas(),
            Self::DaemonSet(s) => s.status.as_ref().map_or(0, |s| s.current_number_scheduled),
        }
    }

    /// Pod selector
    pub fn selector(&self) -> Option<&LabelSelector> {
        match self {
            Self::StatefulSet(s) => s.spec.as_ref().map(|s| &s.selector),
            Self::Advanced(s) => Some(&s.spec.selector),
            Self::DaemonSet(s) => s.spec.as_ref().map(|s| &s.selector),
        }
    }

    /// Pods that are running and ready
    pub fn ready_replicas(&self) -> i32 {
        match self {
            Self::StatefulSet(s) => s
                .status
                .as_ref()
                .and_then(|s| s.ready_replicas)
                .unwrap_or(0),
            Self::Advanced(s) => s.status.as_ref().map_or(0, |s| s.ready_replicas),
            Self::DaemonSet(s) => s.status.as_ref().map_or(0, |s| s.number_ready),
        }
    }

    /// Pods at the current revision; a DaemonSet reports its scheduled pods
    pub fn current_replicas(&self) -> i32 {
        match self {
            Self::StatefulSet(s) => s
                .status
                .as_ref()
                .and_then(|s| s.current_replicas)
                .unwrap_or(0),
            Self::Advanced(s) => s.status.as_ref().map_or(0, |s| s.current_replicas),
            Self::DaemonSet(s) => s.status.as_ref().map_or(0, |s| s.current_number_scheduled),
        }
    }

    /// Node selector of the pod template
    pub fn node_selector(&self) -> BTreeMap<String, String> {
        let template = match self {
            Self::StatefulSet(s) => s.spec.as_ref().map(|s| &s.template),
            Self::Advanced(s) => Some(&s.spec.template),
            Self::DaemonSet(s) => s.spec.as_ref().map(|s| &s.template),
        };
        template
            .and_then(|t| t.spec.as_ref())
            .and_then(|s| s.node_selector.clone())
            .unwrap_or_default()
    }

    /// Whether the set is being deleted
    pub fn is_deleting(&self) -> bool {
        let timestamp = match self {
            Self::StatefulSet(s) => &s.metadata.deletion_timestamp,
            Self::Advanced(s) => &s.metadata.deletion_timestamp,
            Self::DaemonSet(s) => &s.metadata.deletion_timestamp,
        };
        timestamp.is_some()
    }
}

/// Set `spec.replicas` of a CacheWorkerSet, retrying on conflict.
///
/// Each attempt re-reads the set; nothing is written when the value already
/// matches.
pub async fn scale_worker_set(
    source: &dyn WorkerSetSource,
    name: &str,
    namespace: &str,
    replicas: i32,
    policy: &RetryPolicy,
) -> Result<(), Error> {
    retry_on(policy, "scale_worker_set", Error::is_conflict, || async move {
        let mut set = source
            .get_cache_worker_set(namespace, name)
            .await?
            .ok_or_else(|| Error::not_found(format!("CacheWorkerSet {namespace}/{name}")))?;

        if set.spec.replicas == Some(replicas) {
            debug!(set = %name, replicas, "Worker set already at requested scale");
            return Ok(());
        }

        set.spec.replicas = Some(replicas);
        source.replace_cache_worker_set(namespace, &set).await?;
        info!(set = %name, replicas, "Scaled worker set");
        Ok(())
    })
    .await
}
