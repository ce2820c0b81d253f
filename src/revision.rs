//! Pod template revisions.
//!
//! Every distinct pod template a set has run is snapshotted into an immutable
//! `ControllerRevision`. The revision name is derived from a 32-bit FNV-1 hash
//! of the snapshot, so identical templates always land on the same name. When
//! two different templates hash to the same name the set's collision counter is
//! bumped and fed into the hash to move the next candidate elsewhere.

use std::collections::HashSet;
use std::sync::Arc;

use k8s_openapi::api::apps::v1::ControllerRevision;
use k8s_openapi::api::core::v1::{Pod, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::runtime::RawExtension;
use kube::{Resource, ResourceExt};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::controller::WorkloadClient;
use crate::crd::CacheWorkerSet;
use crate::identity::pod_revision;
use crate::retry::{retry_on, RetryPolicy};
use crate::Error;

/// Label carrying the hash part of a revision name
pub const HASH_LABEL: &str = "controller.kubernetes.io/hash";

/// Alphabet used to render hashes without vowels or look-alike characters
const SAFE_ALPHABET: &[u8] = b"bcdfghjklmnpqrstvwxz2456789";

/// Longest set-name prefix kept in a revision name
const MAX_PREFIX_BYTES: usize = 223;

/// Upper bound on collision attempts within one pass
const MAX_COLLISION_ATTEMPTS: i32 = 16;

const FNV_OFFSET_BASIS: u32 = 2_166_136_261;
const FNV_PRIME: u32 = 16_777_619;

fn fnv1_32(chunks: &[&[u8]]) -> u32 {
    chunks
        .iter()
        .flat_map(|c| c.iter())
        .fold(FNV_OFFSET_BASIS, |hash, byte| {
            hash.wrapping_mul(FNV_PRIME) ^ u32::from(*byte)
        })
}

fn safe_encode(s: &str) -> String {
    s.bytes()
        .map(|b| char::from(SAFE_ALPHABET[usize::from(b) % SAFE_ALPHABET.len()]))
        .collect()
}

/// Hash revision data together with a collision count.
///
/// Returns the encoded digest and the collision count to use if this digest
/// turns out to be taken by different content.
pub fn hash_revision(data: &[u8], collision_count: i32) -> (String, i32) {
    let salt = collision_count.to_string();
    let hash = fnv1_32(&[data, salt.as_bytes()]);
    (safe_encode(&hash.to_string()), collision_count.saturating_add(1))
}

/// Revision name for a set name and digest
pub fn revision_name(prefix: &str, digest: &str) -> String {
    let mut end = prefix.len().min(MAX_PREFIX_BYTES);
    while !prefix.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}-{digest}", &prefix[..end])
}

/// Snapshot stored in a revision: the pod template as a replace patch
pub fn revision_data(template: &PodTemplateSpec) -> Result<Value, Error> {
    let mut template = serde_json::to_value(template)?;
    if let Value::Object(fields) = &mut template {
        fields.insert("$patch".to_string(), Value::String("replace".to_string()));
    }
    Ok(serde_json::json!({ "spec": { "template": template } }))
}

fn data_bytes(revision: &ControllerRevision) -> Result<Vec<u8>, Error> {
    match &revision.data {
        Some(RawExtension(value)) => Ok(serde_json::to_vec(value)?),
        None => Ok(Vec::new()),
    }
}

/// Build the candidate revision for the set's current template.
///
/// Returns the revision together with the collision count that the next
/// attempt should use.
pub fn new_revision(
    set: &CacheWorkerSet,
    number: i64,
    collision_count: i32,
) -> Result<(ControllerRevision, i32), Error> {
    let data = revision_data(&set.spec.template)?;
    let (digest, next) = hash_revision(&serde_json::to_vec(&data)?, collision_count);

    let mut labels = set
        .spec
        .template
        .metadata
        .as_ref()
        .and_then(|m| m.labels.clone())
        .unwrap_or_default();
    labels.insert(HASH_LABEL.to_string(), digest.clone());

    let revision = ControllerRevision {
        metadata: ObjectMeta {
            name: Some(revision_name(&set.name_any(), &digest)),
            namespace: set.metadata.namespace.clone(),
            labels: Some(labels),
            annotations: set.metadata.annotations.clone(),
            owner_references: set.controller_owner_ref(&()).map(|r| vec![r]),
            ..Default::default()
        },
        data: Some(RawExtension(data)),
        revision: number,
    };
    Ok((revision, next))
}

/// Order revisions by number, then creation time, then name
pub fn sort_revisions(revisions: &mut [ControllerRevision]) {
    revisions.sort_by(|a, b| {
        a.revision
            .cmp(&b.revision)
            .then_with(|| {
                let at = a.metadata.creation_timestamp.as_ref().map(|t| t.0);
                let bt = b.metadata.creation_timestamp.as_ref().map(|t| t.0);
                at.cmp(&bt)
            })
            .then_with(|| a.metadata.name.cmp(&b.metadata.name))
    });
}

/// Number for the next revision of a sorted history
pub fn next_revision_number(revisions: &[ControllerRevision]) -> i64 {
    revisions.last().map_or(1, |r| r.revision + 1)
}

/// Two revisions snapshot byte-identical content
pub fn equal_revision(a: &ControllerRevision, b: &ControllerRevision) -> bool {
    match (data_bytes(a), data_bytes(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

/// Recover the pod template a revision snapshotted
pub fn template_from_revision(revision: &ControllerRevision) -> Result<PodTemplateSpec, Error> {
    let mut template = revision
        .data
        .as_ref()
        .and_then(|RawExtension(data)| data.get("spec"))
        .and_then(|spec| spec.get("template"))
        .cloned()
        .ok_or_else(|| {
            Error::serialization(format!(
                "revision {} has no spec.template",
                revision.name_any()
            ))
        })?;
    if let Value::Object(fields) = &mut template {
        fields.remove("$patch");
    }
    Ok(serde_json::from_value(template)?)
}

/// Current and update revisions resolved for one pass
#[derive(Clone, Debug)]
pub struct Revisions {
    /// Revision pods below the partition run
    pub current: ControllerRevision,
    /// Revision matching the set's template now
    pub update: ControllerRevision,
    /// Collision count to persist in status
    pub collision_count: i32,
}

impl Revisions {
    /// Name of the current revision
    pub fn current_name(&self) -> String {
        self.current.name_any()
    }

    /// Name of the update revision
    pub fn update_name(&self) -> String {
        self.update.name_any()
    }
}

/// Reads and writes a set's revision history
pub struct RevisionStore {
    client: Arc<dyn WorkloadClient>,
    retry: RetryPolicy,
}

impl RevisionStore {
    /// Create a store; `retry` governs conflicts when renumbering a revision
    pub fn new(client: Arc<dyn WorkloadClient>, retry: RetryPolicy) -> Self {
        Self { client, retry }
    }

    /// Revisions selected by the set's selector, oldest first
    pub async fn list(&self, set: &CacheWorkerSet) -> Result<Vec<ControllerRevision>, Error> {
        let namespace = namespace_of(set)?;
        let mut revisions = self
            .client
            .list_revisions(namespace, &set.spec.selector)
            .await?;
        sort_revisions(&mut revisions);
        Ok(revisions)
    }

    /// Resolve the current and update revisions, creating or renumbering the
    /// update revision as needed
    pub async fn reconcile(
        &self,
        set: &CacheWorkerSet,
        revisions: &[ControllerRevision],
    ) -> Result<Revisions, Error> {
        let collision_count = set
            .status
            .as_ref()
            .and_then(|s| s.collision_count)
            .unwrap_or(0);
        let number = next_revision_number(revisions);
        let (candidate, _) = new_revision(set, number, collision_count)?;

        let equal: Vec<&ControllerRevision> = revisions
            .iter()
            .filter(|r| equal_revision(r, &candidate))
            .collect();

        let (update, collision_count) = match equal.last() {
            Some(_) if revisions.last().is_some_and(|r| equal_revision(r, &candidate)) => {
                let latest = revisions.last().cloned().unwrap_or(candidate);
                (latest, collision_count)
            }
            Some(existing) => {
                let renumbered = self.renumber(existing, number).await?;
                (renumbered, collision_count)
            }
            None => self.create(set, number, collision_count).await?,
        };

        let current_name = set
            .status
            .as_ref()
            .map(|s| s.current_revision.as_str())
            .unwrap_or_default();
        let current = revisions
            .iter()
            .find(|r| !current_name.is_empty() && r.metadata.name.as_deref() == Some(current_name))
            .cloned()
            .unwrap_or_else(|| update.clone());

        Ok(Revisions {
            current,
            update,
            collision_count,
        })
    }

    async fn renumber(
        &self,
        existing: &ControllerRevision,
        number: i64,
    ) -> Result<ControllerRevision, Error> {
        let namespace = existing
            .metadata
            .namespace
            .as_deref()
            .ok_or(Error::MissingObjectKey("metadata.namespace"))?;
        let name = existing.name_any();
        let client = &self.client;

        info!(revision = %name, number, "Reusing equal revision under a new number");

        retry_on(&self.retry, "renumber_revision", Error::is_conflict, || {
            let name = name.clone();
            async move {
                let mut current = client
                    .get_revision(namespace, &name)
                    .await?
                    .ok_or_else(|| Error::not_found(format!("ControllerRevision {name}")))?;
                if current.revision == number {
                    return Ok(current);
                }
                current.revision = number;
                client.replace_revision(namespace, &current).await
            }
        })
        .await
    }

    async fn create(
        &self,
        set: &CacheWorkerSet,
        number: i64,
        mut collision_count: i32,
    ) -> Result<(ControllerRevision, i32), Error> {
        let namespace = namespace_of(set)?;
        for _ in 0..MAX_COLLISION_ATTEMPTS {
            let (candidate, next) = new_revision(set, number, collision_count)?;
            match self.client.create_revision(namespace, &candidate).await {
                Ok(created) => {
                    info!(revision = %created.name_any(), number, "Created revision");
                    return Ok((created, collision_count));
                }
                Err(e) if e.is_already_exists() => {
                    let name = candidate.name_any();
                    match self.client.get_revision(namespace, &name).await? {
                        Some(existing) if equal_revision(&existing, &candidate) => {
                            debug!(revision = %name, "Revision already exists with equal content");
                            return Ok((existing, collision_count));
                        }
                        _ if next == collision_count => {
                            warn!(revision = %name, "Revision collision count is saturated");
                            break;
                        }
                        _ => {
                            info!(
                                revision = %name,
                                collision_count = next,
                                "Revision name collision, trying next name"
                            );
                            collision_count = next;
                        }
                    }
                }
                Err(e) => return Err(e),
            }
        }

        Err(Error::invariant(format!(
            "revision name for {} still colliding after {MAX_COLLISION_ATTEMPTS} attempts",
            set.name_any()
        )))
    }

    /// Delete the oldest revisions beyond the set's history limit.
    ///
    /// The current and update revisions and any revision still labelled on a
    /// pod are never deleted.
    pub async fn truncate_history(
        &self,
        set: &CacheWorkerSet,
        revisions: &[ControllerRevision],
        resolved: &Revisions,
        pods: &[Pod],
    ) -> Result<(), Error> {
        let namespace = namespace_of(set)?;
        let current = resolved.current_name();
        let update = resolved.update_name();
        let live: HashSet<&str> = pods
            .iter()
            .map(pod_revision)
            .filter(|r| !r.is_empty())
            .chain([current.as_str(), update.as_str()])
            .collect();

        let history: Vec<&ControllerRevision> = revisions
            .iter()
            .filter(|r| !live.contains(r.metadata.name.as_deref().unwrap_or_default()))
            .collect();

        let limit = usize::try_from(set.spec.revision_history_limit()).unwrap_or(0);
        let excess = history.len().saturating_sub(limit);

        for revision in history.into_iter().take(excess) {
            let name = revision.name_any();
            match self.client.delete_revision(namespace, &name).await {
                Ok(()) => debug!(revision = %name, "Deleted old revision"),
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

fn namespace_of(set: &CacheWorkerSet) -> Result<&str, Error> {
    set.metadata
        .namespace
        .as_deref()
        .ok_or(Error::MissingObjectKey("metadata.namespace"))
}
