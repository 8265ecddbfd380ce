//! Health-check failover loop
//!
//! Inert until the control loop opens the activation latch. Afterwards it
//! probes frontend readiness on a fixed interval and points the
//! ingress-facing Service at the maintenance backend after two consecutive
//! failed probes separated by the grace period.

use super::Controller;
use crate::config::HealthCheckConfig;
use crate::error::{OperatorError, Result};
use crate::latch::Latch;
use crate::store::ObjectStore;
use k8s_openapi::api::core::v1::{Pod, Service};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Where the ingress-facing Service sends traffic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectorTarget {
    Normal,
    Maintenance,
}

fn is_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|status| status.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
}

pub struct HealthChecker<S> {
    store: Arc<S>,
    namespace: String,
    config: HealthCheckConfig,
    latch: Latch,
}

impl<S: ObjectStore> HealthChecker<S> {
    pub fn new(store: Arc<S>, namespace: &str, config: HealthCheckConfig, latch: Latch) -> Self {
        Self {
            store,
            namespace: namespace.to_string(),
            config,
            latch,
        }
    }

    /// True if at least one pod matching the probe selector is ready. A
    /// failed listing counts as an unhealthy probe.
    pub async fn probe(&self) -> bool {
        match self
            .store
            .list_pods(&self.namespace, &self.config.probe_selector)
            .await
        {
            Ok(pods) => pods.iter().any(is_ready),
            Err(e) => {
                warn!("Failed to list pods {}: {}", self.config.probe_selector, e);
                false
            }
        }
    }

    /// One monitoring tick: probe, and on failure wait out the grace period
    /// and probe again before failing over.
    pub async fn tick(&self, cancel: &CancellationToken) -> Result<SelectorTarget> {
        let target = if self.probe().await {
            SelectorTarget::Normal
        } else {
            debug!(
                "Frontend probe failed, re-probing in {:?}",
                self.config.grace_period
            );
            tokio::select! {
                _ = cancel.cancelled() => return Err(OperatorError::Cancelled),
                _ = tokio::time::sleep(self.config.grace_period) => {}
            }
            if self.probe().await {
                SelectorTarget::Normal
            } else {
                SelectorTarget::Maintenance
            }
        };

        self.point_service_at(target).await?;
        Ok(target)
    }

    /// Sets the Service selector for `target`. Returns false if it was
    /// already correct and nothing was written.
    pub async fn point_service_at(&self, target: SelectorTarget) -> Result<bool> {
        let desired = match target {
            SelectorTarget::Normal => &self.config.normal_selector,
            SelectorTarget::Maintenance => &self.config.maintenance_selector,
        };

        let mut service = self
            .store
            .get::<Service>(&self.namespace, &self.config.service_name)
            .await?
            .ok_or_else(|| {
                OperatorError::NotFound(format!("Service {}", self.config.service_name))
            })?;

        let spec = service.spec.get_or_insert_with(Default::default);
        if spec.selector.as_ref() == Some(desired) {
            return Ok(false);
        }
        spec.selector = Some(desired.clone());
        self.store.replace(&self.namespace, &service).await?;

        match target {
            SelectorTarget::Normal => info!(
                "Frontend healthy, pointing Service {} back at it",
                self.config.service_name
            ),
            SelectorTarget::Maintenance => warn!(
                "Frontend unhealthy, pointing Service {} at the maintenance backend",
                self.config.service_name
            ),
        }
        Ok(true)
    }

    fn selector_string(selector: &BTreeMap<String, String>) -> String {
        selector
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(",")
    }
}

#[async_trait::async_trait]
impl<S: ObjectStore + 'static> Controller for HealthChecker<S> {
    async fn run(&self, cancel: CancellationToken) -> Result<()> {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Health check cancelled before activation");
                return Ok(());
            }
            _ = self.latch.wait() => {}
        }

        info!(
            "Health check activated for Service {} (normal {}, maintenance {})",
            self.config.service_name,
            Self::selector_string(&self.config.normal_selector),
            Self::selector_string(&self.config.maintenance_selector)
        );

        // The first tick completes immediately.
        let mut interval = tokio::time::interval(self.config.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }
            match self.tick(&cancel).await {
                Ok(_) | Err(OperatorError::Cancelled) => {}
                Err(e) => warn!("Health check tick failed: {}", e),
            }
        }

        info!("Health check stopped");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "health-check"
    }
}
