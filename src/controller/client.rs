//! Platform client used by every reconcile component.
//!
//! All reads and writes a pass performs go through [`WorkloadClient`], so the
//! whole controller can be driven against an in-memory cluster in tests.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::ControllerRevision;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::Client;

#[cfg(test)]
use mockall::automock;

use crate::crd::{CacheWorkerSet, CacheWorkerSetStatus};
use crate::identity::label_selector_string;
use crate::Error;

/// Trait abstracting Kubernetes operations for CacheWorkerSets and the objects
/// they own
///
/// `get_*` methods return `None` for objects that do not exist. Writes carry
/// the object's resourceVersion where one is supplied, so a stale write fails
/// with a conflict instead of overwriting.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait WorkloadClient: Send + Sync {
    /// Fetch a CacheWorkerSet
    async fn get_set(&self, namespace: &str, name: &str) -> Result<Option<CacheWorkerSet>, Error>;

    /// Merge-patch the status subresource
    ///
    /// # Arguments
    ///
    /// * `resource_version` - Version the status was computed from
    /// * `status` - New status to write
    async fn patch_set_status(
        &self,
        namespace: &str,
        name: &str,
        resource_version: Option<String>,
        status: &CacheWorkerSetStatus,
    ) -> Result<CacheWorkerSet, Error>;

    /// Merge-patch annotations onto a CacheWorkerSet
    async fn patch_set_annotations(
        &self,
        namespace: &str,
        name: &str,
        resource_version: Option<String>,
        annotations: &BTreeMap<String, String>,
    ) -> Result<CacheWorkerSet, Error>;

    /// List pods matching a selector
    async fn list_pods(&self, namespace: &str, selector: &LabelSelector)
        -> Result<Vec<Pod>, Error>;

    /// Fetch a pod
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>, Error>;

    /// Create a pod
    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<Pod, Error>;

    /// Replace a pod (fails with a conflict on a stale resourceVersion)
    async fn replace_pod(&self, namespace: &str, pod: &Pod) -> Result<Pod, Error>;

    /// Merge-patch annotations onto a pod
    async fn patch_pod_annotations(
        &self,
        namespace: &str,
        name: &str,
        annotations: &BTreeMap<String, String>,
    ) -> Result<Pod, Error>;

    /// Delete a pod
    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), Error>;

    /// Fetch a persistent volume claim
    async fn get_claim(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<PersistentVolumeClaim>, Error>;

    /// Create a persistent volume claim
    async fn create_claim(
        &self,
        namespace: &str,
        claim: &PersistentVolumeClaim,
    ) -> Result<PersistentVolumeClaim, Error>;

    /// List controller revisions matching a selector
    async fn list_revisions(
        &self,
        namespace: &str,
        selector: &LabelSelector,
    ) -> Result<Vec<ControllerRevision>, Error>;

    /// Fetch a controller revision
    async fn get_revision(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ControllerRevision>, Error>;

    /// Create a controller revision
    async fn create_revision(
        &self,
        namespace: &str,
        revision: &ControllerRevision,
    ) -> Result<ControllerRevision, Error>;

    /// Replace a controller revision
    async fn replace_revision(
        &self,
        namespace: &str,
        revision: &ControllerRevision,
    ) -> Result<ControllerRevision, Error>;

    /// Delete a controller revision
    async fn delete_revision(&self, namespace: &str, name: &str) -> Result<(), Error>;
}

/// Real Kubernetes client implementation
pub struct KubeWorkloadClient {
    client: Client,
    field_manager: String,
}

impl KubeWorkloadClient {
    /// Create a new client writing under the given field manager
    pub fn new(client: Client, field_manager: impl Into<String>) -> Self {
        Self {
            client,
            field_manager: field_manager.into(),
        }
    }

    fn patch_params(&self) -> PatchParams {
        PatchParams::apply(&self.field_manager)
    }

    fn post_params(&self) -> PostParams {
        PostParams {
            field_manager: Some(self.field_manager.clone()),
            ..Default::default()
        }
    }
}

fn named<'a>(name: &'a Option<String>) -> Result<&'a str, Error> {
    name.as_deref().ok_or(Error::MissingObjectKey("metadata.name"))
}

#[async_trait]
impl WorkloadClient for KubeWorkloadClient {
    async fn get_set(&self, namespace: &str, name: &str) -> Result<Option<CacheWorkerSet>, Error> {
        let api: Api<CacheWorkerSet> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn patch_set_status(
        &self,
        namespace: &str,
        name: &str,
        resource_version: Option<String>,
        status: &CacheWorkerSetStatus,
    ) -> Result<CacheWorkerSet, Error> {
        let api: Api<CacheWorkerSet> = Api::namespaced(self.client.clone(), namespace);
        let patch = serde_json::json!({
            "metadata": { "resourceVersion": resource_version },
            "status": status
        });
        Ok(api
            .patch_status(name, &self.patch_params(), &Patch::Merge(&patch))
            .await?)
    }

    async fn patch_set_annotations(
        &self,
        namespace: &str,
        name: &str,
        resource_version: Option<String>,
        annotations: &BTreeMap<String, String>,
    ) -> Result<CacheWorkerSet, Error> {
        let api: Api<CacheWorkerSet> = Api::namespaced(self.client.clone(), namespace);
        let patch = serde_json::json!({
            "metadata": {
                "resourceVersion": resource_version,
                "annotations": annotations
            }
        });
        Ok(api
            .patch(name, &self.patch_params(), &Patch::Merge(&patch))
            .await?)
    }

    async fn list_pods(
        &self,
        namespace: &str,
        selector: &LabelSelector,
    ) -> Result<Vec<Pod>, Error> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let params = ListParams::default().labels(&label_selector_string(selector));
        Ok(api.list(&params).await?.items)
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>, Error> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<Pod, Error> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.create(&self.post_params(), pod).await?)
    }

    async fn replace_pod(&self, namespace: &str, pod: &Pod) -> Result<Pod, Error> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        Ok(api
            .replace(named(&pod.metadata.name)?, &self.post_params(), pod)
            .await?)
    }

    async fn patch_pod_annotations(
        &self,
        namespace: &str,
        name: &str,
        annotations: &BTreeMap<String, String>,
    ) -> Result<Pod, Error> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let patch = serde_json::json!({
            "metadata": { "annotations": annotations }
        });
        Ok(api
            .patch(name, &self.patch_params(), &Patch::Merge(&patch))
            .await?)
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        api.delete(name, &DeleteParams::default()).await?;
        Ok(())
    }

    async fn get_claim(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<PersistentVolumeClaim>, Error> {
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn create_claim(
        &self,
        namespace: &str,
        claim: &PersistentVolumeClaim,
    ) -> Result<PersistentVolumeClaim, Error> {
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.create(&self.post_params(), claim).await?)
    }

    async fn list_revisions(
        &self,
        namespace: &str,
        selector: &LabelSelector,
    ) -> Result<Vec<ControllerRevision>, Error> {
        let api: Api<ControllerRevision> = Api::namespaced(self.client.clone(), namespace);
        let params = ListParams::default().labels(&label_selector_string(selector));
        Ok(api.list(&params).await?.items)
    }

    async fn get_revision(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ControllerRevision>, Error> {
        let api: Api<ControllerRevision> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn create_revision(
        &self,
        namespace: &str,
        revision: &ControllerRevision,
    ) -> Result<ControllerRevision, Error> {
        let api: Api<ControllerRevision> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.create(&self.post_params(), revision).await?)
    }

    async fn replace_revision(
        &self,
        namespace: &str,
        revision: &ControllerRevision,
    ) -> Result<ControllerRevision, Error> {
        let api: Api<ControllerRevision> = Api::namespaced(self.client.clone(), namespace);
        Ok(api
            .replace(named(&revision.metadata.name)?, &self.post_params(), revision)
            .await?)
    }

    async fn delete_revision(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let api: Api<ControllerRevision> = Api::namespaced(self.client.clone(), namespace);
        api.delete(name, &DeleteParams::default()).await?;
        Ok(())
    }
}
