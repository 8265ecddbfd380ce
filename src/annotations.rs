//! Annotation keys, labels and lifecycle stages
//!
//! The spec ConfigMap has no status subresource, so the operator keeps its
//! pseudo-status in annotations on the ConfigMap itself.

use std::fmt;

// Spec ConfigMap
/// Marker that must be `"true"` for the control loop to act on the ConfigMap
pub const MANAGED_ANNOTATION: &str = "appliance.sourcegraph.com/managed";
pub const CURRENT_VERSION_ANNOTATION: &str = "appliance.sourcegraph.com/currentVersion";
pub const STAGE_ANNOTATION: &str = "appliance.sourcegraph.com/stage";
pub const SPEC_DATA_KEY: &str = "spec";

// Managed objects
pub const CONFIG_HASH_ANNOTATION: &str = "appliance.sourcegraph.com/configHash";
pub const ADOPTED_ANNOTATION: &str = "appliance.sourcegraph.com/adopted";
pub const AUTH_CHECKSUM_ANNOTATION: &str = "checksum/auth";

// Labels
pub const APP_LABEL: &str = "app";
pub const DEPLOY_LABEL: &str = "deploy";
pub const DEPLOY_LABEL_VALUE: &str = "sourcegraph";
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const MANAGED_BY: &str = "appliance-operator";

// Events
pub const REASON_RECONCILE_FINISHED: &str = "ReconcileFinished";

/// Returns true if the annotation map marks the object with `key: "true"`.
pub fn is_flag_set(annotations: &std::collections::BTreeMap<String, String>, key: &str) -> bool {
    annotations.get(key).is_some_and(|v| v == "true")
}

/// Coarse lifecycle stage of the installation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Stage {
    /// No stage annotation present
    #[default]
    Unknown,
    Install,
    Installing,
    Upgrading,
    WaitForAdmin,
    /// Post-install steady state
    Refresh,
}

impl Stage {
    pub fn parse(value: Option<&str>) -> Stage {
        match value {
            Some("install") => Stage::Install,
            Some("installing") => Stage::Installing,
            Some("upgrading") => Stage::Upgrading,
            Some("wait-for-admin") => Stage::WaitForAdmin,
            Some("refresh") => Stage::Refresh,
            _ => Stage::Unknown,
        }
    }

    pub fn as_str(&self) -> Option<&'static str> {
        match self {
            Stage::Unknown => None,
            Stage::Install => Some("install"),
            Stage::Installing => Some("installing"),
            Stage::Upgrading => Some("upgrading"),
            Stage::WaitForAdmin => Some("wait-for-admin"),
            Stage::Refresh => Some("refresh"),
        }
    }

    /// Stage recorded after a pass that reconciled every service.
    pub fn after_successful_pass(self) -> Stage {
        match self {
            Stage::WaitForAdmin => Stage::WaitForAdmin,
            _ => Stage::Refresh,
        }
    }

    pub fn is_post_install(&self) -> bool {
        *self == Stage::Refresh
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str().unwrap_or("unknown"))
    }
}
