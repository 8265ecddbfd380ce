//! Operator configuration
//!
//! Built once at startup from the command line and shared by every loop.

use crate::error::{OperatorError, Result};
use std::collections::BTreeMap;
use std::time::Duration;

/// Runtime configuration for all operator loops
#[derive(Debug, Clone)]
pub struct OperatorConfig {
    /// Namespace holding the spec ConfigMap and every managed object
    pub namespace: String,
    /// Name of the spec ConfigMap
    pub config_map: String,
    pub health_check: HealthCheckConfig,
    pub self_update: SelfUpdateConfig,
}

#[derive(Debug, Clone)]
pub struct HealthCheckConfig {
    pub interval: Duration,
    pub grace_period: Duration,
    /// Label selector of the pods that must be ready
    pub probe_selector: String,
    /// Service whose selector is flipped
    pub service_name: String,
    pub normal_selector: BTreeMap<String, String>,
    pub maintenance_selector: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct SelfUpdateConfig {
    pub enabled: bool,
    pub interval: Duration,
    pub max_minor_advance: u64,
    pub registry_url: String,
    /// Deployments running the operator itself
    pub deployments: Vec<String>,
    pub current_version: String,
}

/// Parses `key=value[,key=value]` into a selector map.
pub fn parse_selector(selector: &str) -> Result<BTreeMap<String, String>> {
    let mut labels = BTreeMap::new();
    for pair in selector.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (key, value) = pair.split_once('=').ok_or_else(|| {
            OperatorError::Configuration(format!("invalid selector term '{}'", pair))
        })?;
        labels.insert(key.trim().to_string(), value.trim().to_string());
    }
    if labels.is_empty() {
        return Err(OperatorError::Configuration(format!(
            "empty selector '{}'",
            selector
        )));
    }
    Ok(labels)
}

/// Converts a polling period given in seconds, rejecting zero.
pub fn polling_interval(flag: &str, secs: u64) -> Result<Duration> {
    if secs == 0 {
        return Err(OperatorError::Configuration(format!(
            "--{} must be at least 1 second",
            flag
        )));
    }
    Ok(Duration::from_secs(secs))
}

/// Detects the namespace to operate in.
///
/// Priority: explicit argument, then the service account file, then `"default"`.
pub fn detect_namespace(explicit: &str) -> String {
    if !explicit.is_empty() {
        return explicit.to_string();
    }
    std::fs::read_to_string("/var/run/secrets/kubernetes.io/serviceaccount/namespace")
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|_| "default".to_string())
}
