//! Per-service configuration shared by every component

use k8s_openapi::api::core::v1::ResourceRequirements;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Anything that can be switched off in the spec.
pub trait Disableable {
    fn is_disabled(&self) -> bool;
}

/// Configuration of a single Sourcegraph service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceConfig {
    /// Turn the service off; its owned objects are deleted
    #[serde(default)]
    pub disabled: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,

    /// Size of the data volume, for services that persist data
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_size: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,

    /// Extra environment variables, overriding the built-in ones
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub service_account_annotations: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_selector: BTreeMap<String, String>,

    /// Full image reference replacing `<repository>/<name>:<version>`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_image: Option<String>,
}

impl Disableable for ServiceConfig {
    fn is_disabled(&self) -> bool {
        self.disabled
    }
}

impl ServiceConfig {
    pub(crate) fn default_replicas(&mut self, replicas: i32) {
        self.replicas.get_or_insert(replicas);
    }

    pub(crate) fn default_storage(&mut self, size: &str) {
        self.storage_size.get_or_insert_with(|| size.to_string());
    }

    pub fn replica_count(&self) -> i32 {
        self.replicas.unwrap_or(1)
    }

    pub fn storage(&self) -> &str {
        self.storage_size.as_deref().unwrap_or("10Gi")
    }
}
