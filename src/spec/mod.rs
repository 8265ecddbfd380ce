//! Desired state of a Sourcegraph instance
//!
//! The spec is YAML stored under the `spec` key of the appliance ConfigMap.
//! It is decoded from scratch on every reconciliation pass; unset fields are
//! filled with built-in defaults.

mod service;

pub use service::{Disableable, ServiceConfig};

use crate::annotations::{Stage, CURRENT_VERSION_ANNOTATION, STAGE_ANNOTATION};
use crate::error::{OperatorError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Full declarative configuration of the instance
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DesiredSpec {
    /// Sourcegraph version to deploy
    #[serde(default)]
    pub requested_version: String,

    /// Registry and path prefix for all images
    #[serde(default = "default_image_repository")]
    pub image_repository: String,

    /// Storage class for data volumes; cluster default when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class_name: Option<String>,

    #[serde(default)]
    pub blobstore: ServiceConfig,

    #[serde(default)]
    pub pgsql: ServiceConfig,

    #[serde(default, rename = "codeintelDB")]
    pub codeintel_db: ServiceConfig,

    #[serde(default)]
    pub redis_cache: ServiceConfig,

    #[serde(default)]
    pub redis_store: ServiceConfig,

    #[serde(default)]
    pub syntect_server: ServiceConfig,

    #[serde(default)]
    pub symbols: ServiceConfig,

    #[serde(default)]
    pub searcher: ServiceConfig,

    #[serde(default)]
    pub gitserver: ServiceConfig,

    #[serde(default)]
    pub indexed_search: ServiceConfig,

    #[serde(default)]
    pub repo_updater: ServiceConfig,

    #[serde(default)]
    pub worker: ServiceConfig,

    #[serde(default)]
    pub frontend: ServiceConfig,

    /// Pseudo-status read from the ConfigMap annotations, never from YAML
    #[serde(skip)]
    pub status: SpecStatus,
}

/// Status fields carried in annotations on the spec ConfigMap
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SpecStatus {
    pub current_version: Option<String>,
    pub stage: Stage,
}

impl SpecStatus {
    pub fn from_annotations(annotations: &BTreeMap<String, String>) -> Self {
        Self {
            current_version: annotations
                .get(CURRENT_VERSION_ANNOTATION)
                .filter(|v| !v.is_empty())
                .cloned(),
            stage: Stage::parse(annotations.get(STAGE_ANNOTATION).map(String::as_str)),
        }
    }

    /// Writes the status back into an annotation map.
    pub fn write_annotations(&self, annotations: &mut BTreeMap<String, String>) {
        match &self.current_version {
            Some(version) => {
                annotations.insert(CURRENT_VERSION_ANNOTATION.to_string(), version.clone());
            }
            None => {
                annotations.remove(CURRENT_VERSION_ANNOTATION);
            }
        }
        match self.stage.as_str() {
            Some(stage) => {
                annotations.insert(STAGE_ANNOTATION.to_string(), stage.to_string());
            }
            None => {
                annotations.remove(STAGE_ANNOTATION);
            }
        }
    }
}

fn default_image_repository() -> String {
    "index.docker.io/sourcegraph".to_string()
}

impl DesiredSpec {
    /// Decodes the YAML spec blob and applies defaults.
    pub fn decode(blob: &str) -> Result<Self> {
        let mut spec: DesiredSpec = if blob.trim().is_empty() {
            DesiredSpec {
                image_repository: default_image_repository(),
                ..Default::default()
            }
        } else {
            serde_yaml::from_str(blob)?
        };

        if spec.requested_version.trim().is_empty() {
            return Err(OperatorError::Decode(
                "requestedVersion must be set".to_string(),
            ));
        }
        spec.apply_defaults();
        Ok(spec)
    }

    fn apply_defaults(&mut self) {
        self.blobstore.default_storage("100Gi");
        self.pgsql.default_storage("200Gi");
        self.codeintel_db.default_storage("200Gi");
        self.redis_cache.default_storage("100Gi");
        self.redis_store.default_storage("100Gi");
        self.gitserver.default_storage("200Gi");
        self.indexed_search.default_storage("200Gi");

        self.gitserver.default_replicas(1);
        self.indexed_search.default_replicas(1);
        self.searcher.default_replicas(1);
        self.symbols.default_replicas(1);
        self.syntect_server.default_replicas(1);
        self.worker.default_replicas(1);
        self.frontend.default_replicas(2);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_applies_defaults() {
        let spec = DesiredSpec::decode("requestedVersion: 5.4.0\n").unwrap();
        assert_eq!(spec.requested_version, "5.4.0");
        assert_eq!(spec.image_repository, "index.docker.io/sourcegraph");
        assert_eq!(spec.pgsql.storage(), "200Gi");
        assert_eq!(spec.frontend.replica_count(), 2);
        assert!(!spec.gitserver.is_disabled());
        assert_eq!(spec.status, SpecStatus::default());
    }

    #[test]
    fn test_decode_keeps_explicit_fields() {
        let yaml = r#"
requestedVersion: 5.4.0
imageRepository: registry.internal/sg
codeintelDB:
  disabled: true
frontend:
  replicas: 4
  env:
    SRC_LOG_LEVEL: debug
gitserver:
  storageSize: 2Ti
"#;
        let spec = DesiredSpec::decode(yaml).unwrap();
        assert_eq!(spec.image_repository, "registry.internal/sg");
        assert!(spec.codeintel_db.is_disabled());
        assert_eq!(spec.frontend.replica_count(), 4);
        assert_eq!(spec.frontend.env.get("SRC_LOG_LEVEL").unwrap(), "debug");
        assert_eq!(spec.gitserver.storage(), "2Ti");
    }

    #[test]
    fn test_decode_rejects_malformed_blob() {
        let err = DesiredSpec::decode("frontend: [1, 2").unwrap_err();
        assert!(matches!(err, OperatorError::Decode(_)));
    }

    #[test]
    fn test_decode_requires_version() {
        let err = DesiredSpec::decode("frontend:\n  replicas: 1\n").unwrap_err();
        assert!(matches!(err, OperatorError::Decode(_)));
        assert!(DesiredSpec::decode("").is_err());
    }

    #[test]
    fn test_status_annotations_roundtrip() {
        let mut annotations = BTreeMap::new();
        let status = SpecStatus {
            current_version: Some("5.3.2".to_string()),
            stage: Stage::Refresh,
        };
        status.write_annotations(&mut annotations);
        assert_eq!(annotations.get(CURRENT_VERSION_ANNOTATION).unwrap(), "5.3.2");
        assert_eq!(annotations.get(STAGE_ANNOTATION).unwrap(), "refresh");
        assert_eq!(SpecStatus::from_annotations(&annotations), status);
    }
}
