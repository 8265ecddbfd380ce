//! Self-update loop
//!
//! Periodically asks the release registry for public versions and moves the
//! operator's own Deployments to the highest version that is safe to reach
//! from the running one.

use super::Controller;
use crate::config::SelfUpdateConfig;
use crate::error::Result;
use crate::registry::{public_versions, ReleaseRegistry};
use crate::store::ObjectStore;
use crate::versions::{highest_safe_version, versions_within_n_minor};
use k8s_openapi::api::apps::v1::Deployment;
use semver::Version;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Replaces the tag of an image reference, dropping any digest.
fn with_tag(image: &str, tag: &str) -> String {
    let without_digest = image.split('@').next().unwrap_or(image);
    let repository = match without_digest.rfind(':') {
        Some(colon) if without_digest.rfind('/').map_or(true, |slash| colon > slash) => {
            &without_digest[..colon]
        }
        _ => without_digest,
    };
    format!("{}:{}", repository, tag)
}

/// Points every container of `deployment` at `tag`. Returns true if any
/// image changed.
fn retag(deployment: &mut Deployment, tag: &str) -> bool {
    let Some(pod_spec) = deployment
        .spec
        .as_mut()
        .and_then(|spec| spec.template.spec.as_mut())
    else {
        return false;
    };

    let mut changed = false;
    for container in pod_spec.containers.iter_mut() {
        if let Some(image) = container.image.as_mut() {
            let updated = with_tag(image, tag);
            if *image != updated {
                *image = updated;
                changed = true;
            }
        }
    }
    changed
}

pub struct SelfUpdater<S, R> {
    store: Arc<S>,
    registry: R,
    namespace: String,
    config: SelfUpdateConfig,
}

impl<S: ObjectStore, R: ReleaseRegistry> SelfUpdater<S, R> {
    pub fn new(store: Arc<S>, registry: R, namespace: &str, config: SelfUpdateConfig) -> Self {
        Self {
            store,
            registry,
            namespace: namespace.to_string(),
            config,
        }
    }

    /// One update attempt. Returns the version the operator Deployments were
    /// moved to, if any of them changed.
    pub async fn update_once(&self) -> Result<Option<Version>> {
        let versions = public_versions(&self.registry).await?;
        let current = self.config.current_version.as_str();
        let budget = self.config.max_minor_advance;

        match versions_within_n_minor(&versions, current, budget) {
            Ok(window) => debug!(
                "Versions supported from {}: {:?}",
                current,
                window.iter().map(Version::to_string).collect::<Vec<_>>()
            ),
            Err(e) => debug!("No support window for {}: {}", current, e),
        }

        let target = highest_safe_version(&versions, current, budget)?;
        if target.to_string() == current.trim_start_matches('v') {
            debug!("Operator {} is up to date", current);
            return Ok(None);
        }

        let tag = target.to_string();
        let mut updated = false;
        for name in &self.config.deployments {
            let Some(mut deployment) = self
                .store
                .get::<Deployment>(&self.namespace, name)
                .await?
            else {
                warn!("Operator Deployment {}/{} not found", self.namespace, name);
                continue;
            };
            if retag(&mut deployment, &tag) {
                info!("Updating operator Deployment {} from {} to {}", name, current, tag);
                self.store.replace(&self.namespace, &deployment).await?;
                updated = true;
            }
        }

        Ok(updated.then_some(target))
    }
}

#[async_trait::async_trait]
impl<S, R> Controller for SelfUpdater<S, R>
where
    S: ObjectStore + 'static,
    R: ReleaseRegistry + 'static,
{
    async fn run(&self, cancel: CancellationToken) -> Result<()> {
        if !self.config.enabled {
            info!("Self-update disabled");
            return Ok(());
        }

        info!(
            "Starting self-update loop for version {} (every {:?})",
            self.config.current_version, self.config.interval
        );
        loop {
            if let Err(e) = self.update_once().await {
                error!("Self-update failed: {}", e);
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.interval) => {}
            }
        }

        info!("Self-update loop stopped");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "self-update"
    }
}
