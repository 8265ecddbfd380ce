//! Idempotent create/update/delete of managed objects
//!
//! Every object the operator creates carries a content-hash annotation
//! computed from the inputs that produced it. An object is replaced only when
//! the stored hash differs from the freshly computed one, which makes
//! reconciliation generic over object kinds without per-field diffing.
//!
//! Namespaced objects that are not owned by the spec ConfigMap are never
//! mutated or deleted unless they carry the adoption annotation.

use crate::annotations::{is_flag_set, ADOPTED_ANNOTATION, CONFIG_HASH_ANNOTATION};
use crate::error::{OperatorError, Result};
use crate::spec::Disableable;
use crate::store::{ManagedKind, ObjectStore};
use k8s_openapi::api::core::v1::ConfigMap;
use kube::{Resource, ResourceExt};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

/// What a reconciliation call did to the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Created,
    Updated,
    Unchanged,
    Deleted,
    /// Nothing to delete
    Absent,
    /// The object exists but is not ours to touch
    Refused,
}

#[derive(Serialize)]
struct VersionedInputs<'a, T: ?Sized> {
    config: &'a T,
    version: &'a str,
}

/// Hex-encoded SHA-256 of the JSON serialization of `inputs`.
pub fn config_hash<T: Serialize + ?Sized>(inputs: &T) -> Result<String> {
    let bytes = serde_json::to_vec(inputs)?;
    Ok(format!("{:x}", Sha256::digest(&bytes)))
}

/// Whether `object` lists `owner` among its owner references.
pub fn is_owned_by<K: Resource>(object: &K, owner: &ConfigMap) -> bool {
    let Some(owner_uid) = owner.meta().uid.as_deref() else {
        return false;
    };
    object
        .owner_references()
        .iter()
        .any(|r| r.uid == owner_uid)
}

fn owner_namespace(owner: &ConfigMap) -> Result<String> {
    owner
        .namespace()
        .ok_or_else(|| OperatorError::InvalidState("spec ConfigMap has no namespace".to_string()))
}

/// Disable-aware entry point used by every per-service step.
///
/// Deletes `desired` when `config` is disabled, otherwise creates or updates
/// it with `hash_inputs` and the requested `version` folded into the hash.
pub async fn reconcile_object<S, K, T, D>(
    store: &S,
    owner: &ConfigMap,
    desired: K,
    hash_inputs: &T,
    config: &D,
    version: &str,
) -> Result<Outcome>
where
    S: ObjectStore,
    K: ManagedKind,
    T: Serialize + ?Sized + Sync,
    D: Disableable + ?Sized + Sync,
{
    if config.is_disabled() {
        let name = desired.name_any();
        return ensure_deleted::<S, K>(store, owner, &name).await;
    }

    let inputs = VersionedInputs {
        config: hash_inputs,
        version,
    };
    create_or_update(store, owner, desired, &inputs).await
}

/// Creates `desired` if missing, or replaces the live object when its stored
/// content hash differs from the hash of `hash_inputs`.
pub async fn create_or_update<S, K, T>(
    store: &S,
    owner: &ConfigMap,
    mut desired: K,
    hash_inputs: &T,
) -> Result<Outcome>
where
    S: ObjectStore,
    K: ManagedKind,
    T: Serialize + ?Sized + Sync,
{
    let kind = K::kind(&()).to_string();
    let name = desired.name_any();
    let namespace = owner_namespace(owner)?;

    let hash = config_hash(hash_inputs)?;
    desired
        .annotations_mut()
        .insert(CONFIG_HASH_ANNOTATION.to_string(), hash.clone());

    if K::NAMESPACED {
        match desired.meta().namespace.as_deref() {
            Some(ns) if ns != namespace => {
                return Err(OperatorError::InvalidState(format!(
                    "cannot own {} {}/{} from namespace {}",
                    kind, ns, name, namespace
                )));
            }
            Some(_) => {}
            None => desired.meta_mut().namespace = Some(namespace.clone()),
        }
        let owner_ref = owner.controller_owner_ref(&()).ok_or_else(|| {
            OperatorError::InvalidState(format!(
                "spec ConfigMap {} has no name or uid to own {} {}",
                owner.name_any(),
                kind,
                name
            ))
        })?;
        let refs = desired.owner_references_mut();
        refs.retain(|r| r.uid != owner_ref.uid);
        refs.push(owner_ref);
    }

    let existing = match store.get::<K>(&namespace, &name).await? {
        Some(existing) => existing,
        None => {
            info!("Creating {} {}/{}", kind, namespace, name);
            store.create(&namespace, &desired).await?;
            return Ok(Outcome::Created);
        }
    };

    let owned = !K::NAMESPACED || is_owned_by(&existing, owner);
    if !owned && !is_flag_set(existing.annotations(), ADOPTED_ANNOTATION) {
        info!(
            "{} {}/{} exists but is not owned by the appliance, refusing to update",
            kind, namespace, name
        );
        return Ok(Outcome::Refused);
    }

    // An adopted object takes the owner reference even if its content matches.
    if owned && existing.annotations().get(CONFIG_HASH_ANNOTATION) == Some(&hash) {
        debug!("{} {}/{} is up to date", kind, namespace, name);
        return Ok(Outcome::Unchanged);
    }

    desired.meta_mut().resource_version = existing.meta().resource_version.clone();
    info!("Updating {} {}/{}", kind, namespace, name);
    store.replace(&namespace, &desired).await?;
    Ok(Outcome::Updated)
}

/// Deletes the named object if it exists and belongs to `owner`.
pub async fn ensure_deleted<S, K>(store: &S, owner: &ConfigMap, name: &str) -> Result<Outcome>
where
    S: ObjectStore,
    K: ManagedKind,
{
    let kind = K::kind(&()).to_string();
    let namespace = owner_namespace(owner)?;

    let Some(existing) = store.get::<K>(&namespace, name).await? else {
        return Ok(Outcome::Absent);
    };

    if K::NAMESPACED && !is_owned_by(&existing, owner) {
        info!(
            "{} {}/{} is not owned by the appliance, refusing to delete",
            kind, namespace, name
        );
        return Ok(Outcome::Refused);
    }

    info!("Deleting {} {}/{}", kind, namespace, name);
    if store.delete::<K>(&namespace, name).await? {
        Ok(Outcome::Deleted)
    } else {
        Ok(Outcome::Absent)
    }
}

/// Creates `object` without an owner reference if nothing of that name
/// exists yet. An existing object is left untouched.
pub async fn ensure_present_unowned<S, K>(store: &S, namespace: &str, object: K) -> Result<Outcome>
where
    S: ObjectStore,
    K: ManagedKind,
{
    let name = object.name_any();
    if store.get::<K>(namespace, &name).await?.is_some() {
        debug!("{} {}/{} already present", K::kind(&()), namespace, name);
        return Ok(Outcome::Unchanged);
    }
    info!("Creating unowned {} {}/{}", K::kind(&()), namespace, name);
    store.create(namespace, &object).await?;
    Ok(Outcome::Created)
}
