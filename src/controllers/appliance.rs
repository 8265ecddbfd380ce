//! Appliance control loop
//!
//! Every trigger (a change to the spec ConfigMap, to an object it owns, or to
//! one of the credential Secrets) becomes a request on a single-worker queue.
//! The worker runs one full reconciliation pass per request, so passes never
//! interleave. A pass decodes the spec from scratch, runs every service step
//! in order and stops at the first failure. Only a fully successful pass
//! updates the status annotations and emits the completion event.

use super::Controller;
use crate::annotations::{
    is_flag_set, Stage, MANAGED_ANNOTATION, MANAGED_BY, MANAGED_BY_LABEL,
    REASON_RECONCILE_FINISHED, SPEC_DATA_KEY,
};
use crate::config::OperatorConfig;
use crate::error::{OperatorError, Result};
use crate::latch::Latch;
use crate::services::{Step, StepContext, AUTH_SECRETS};
use crate::spec::{DesiredSpec, SpecStatus};
use crate::store::{ManagedKind, ObjectStore};
use futures::StreamExt;
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{ConfigMap, Secret, Service, ServiceAccount};
use k8s_openapi::api::rbac::v1::{Role, RoleBinding};
use kube::runtime::controller::{self, Action};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher;
use kube::{Api, Client, Resource, ResourceExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Periodic resync after a successful pass
const RESYNC_INTERVAL: Duration = Duration::from_secs(300);
const ERROR_REQUEUE: Duration = Duration::from_secs(30);
const QUEUE_CAPACITY: usize = 16;

/// Result of a reconciliation pass that did not fail
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PassOutcome {
    /// The spec ConfigMap does not exist
    Missing,
    /// The spec ConfigMap lacks the managed marker and is ignored
    Unmanaged,
    Reconciled { version: String, stage: Stage },
}

/// Runs reconciliation passes against one spec ConfigMap.
pub struct ApplianceReconciler<S> {
    store: Arc<S>,
    namespace: String,
    config_map: String,
    latch: Latch,
}

impl<S: ObjectStore> ApplianceReconciler<S> {
    pub fn new(store: Arc<S>, namespace: &str, config_map: &str, latch: Latch) -> Self {
        Self {
            store,
            namespace: namespace.to_string(),
            config_map: config_map.to_string(),
            latch,
        }
    }

    /// Runs one full pass. Callers must not run passes concurrently; use
    /// [`PassQueue`] for that.
    pub async fn run_pass(&self) -> Result<PassOutcome> {
        let Some(mut config_map) = self
            .store
            .get::<ConfigMap>(&self.namespace, &self.config_map)
            .await?
        else {
            debug!("Spec ConfigMap {} not found, nothing to reconcile", self.config_map);
            return Ok(PassOutcome::Missing);
        };

        if !is_flag_set(config_map.annotations(), MANAGED_ANNOTATION) {
            debug!(
                "Spec ConfigMap {} is not marked {}=true, ignoring",
                self.config_map, MANAGED_ANNOTATION
            );
            return Ok(PassOutcome::Unmanaged);
        }

        let blob = config_map
            .data
            .as_ref()
            .and_then(|data| data.get(SPEC_DATA_KEY))
            .map(String::as_str)
            .unwrap_or_default();
        let mut spec = DesiredSpec::decode(blob)?;
        spec.status = SpecStatus::from_annotations(config_map.annotations());

        debug!(
            "Reconciling {}/{} (requested {}, stage {})",
            self.namespace, self.config_map, spec.requested_version, spec.status.stage
        );

        let ctx = StepContext {
            store: self.store.as_ref(),
            owner: &config_map,
            spec: &spec,
            namespace: &self.namespace,
        };
        for step in Step::ORDER {
            debug!("Reconciling {}", step.name());
            if let Err(e) = step.run(&ctx).await {
                error!("Step {} failed, aborting pass: {}", step.name(), e);
                return Err(e);
            }
        }

        let status = SpecStatus {
            current_version: Some(spec.requested_version.clone()),
            stage: spec.status.stage.after_successful_pass(),
        };
        let status_changed = status != spec.status;
        if status_changed {
            status.write_annotations(config_map.annotations_mut());
            self.store.replace(&self.namespace, &config_map).await?;
        }

        self.store
            .publish_event(
                &config_map.object_ref(&()),
                REASON_RECONCILE_FINISHED,
                &format!("Reconciled version {}", spec.requested_version),
            )
            .await?;

        if status.stage.is_post_install() && self.latch.set() {
            info!("Installation reached the post-install stage, activating health check");
        }

        if status_changed {
            info!(
                "Recorded version {} (stage {}) on {}/{}",
                spec.requested_version, status.stage, self.namespace, self.config_map
            );
        } else {
            debug!("Reconciliation pass for {} finished", self.config_map);
        }
        Ok(PassOutcome::Reconciled {
            version: spec.requested_version,
            stage: status.stage,
        })
    }
}

type Reply = oneshot::Sender<Result<PassOutcome>>;

/// Handle to the single worker that runs reconciliation passes in FIFO order.
#[derive(Clone)]
pub struct PassQueue {
    tx: mpsc::Sender<Reply>,
}

impl PassQueue {
    /// Starts the worker. It exits when `cancel` fires or every handle is dropped.
    pub fn spawn<S: ObjectStore + 'static>(
        reconciler: Arc<ApplianceReconciler<S>>,
        cancel: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<Reply>(QUEUE_CAPACITY);
        let worker = tokio::spawn(async move {
            loop {
                let reply = tokio::select! {
                    _ = cancel.cancelled() => break,
                    next = rx.recv() => match next {
                        Some(reply) => reply,
                        None => break,
                    },
                };
                let result = reconciler.run_pass().await;
                // The requester may have given up waiting.
                let _ = reply.send(result);
            }
            debug!("Reconciliation worker stopped");
        });
        (Self { tx }, worker)
    }

    /// Queues a pass and waits for its result.
    pub async fn submit(&self) -> Result<PassOutcome> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(reply_tx)
            .await
            .map_err(|_| OperatorError::Cancelled)?;
        reply_rx.await.map_err(|_| OperatorError::Cancelled)?
    }
}

/// Watches the spec ConfigMap and everything it owns, feeding the pass queue.
pub struct ApplianceController {
    client: Client,
    config: Arc<OperatorConfig>,
    queue: PassQueue,
}

impl ApplianceController {
    pub fn new(client: Client, config: Arc<OperatorConfig>, queue: PassQueue) -> Self {
        Self {
            client,
            config,
            queue,
        }
    }

    async fn reconcile(queue: Arc<PassQueue>) -> std::result::Result<Action, OperatorError> {
        match queue.submit().await? {
            PassOutcome::Missing | PassOutcome::Unmanaged => Ok(Action::await_change()),
            PassOutcome::Reconciled { .. } => Ok(Action::requeue(RESYNC_INTERVAL)),
        }
    }
}

#[async_trait::async_trait]
impl Controller for ApplianceController {
    async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let ns = self.config.namespace.as_str();
        let client = self.client.clone();

        let spec_config_maps: Api<ConfigMap> = Api::namespaced(client.clone(), ns);
        let spec_watch = watcher::Config::default()
            .fields(&format!("metadata.name={}", self.config.config_map));
        let managed_by = format!("{}={}", MANAGED_BY_LABEL, MANAGED_BY);
        let owned = || watcher::Config::default().labels(&managed_by);

        let spec_ref = ObjectRef::<ConfigMap>::new(&self.config.config_map).within(ns);
        let credentials_changed = move |secret: Secret| {
            AUTH_SECRETS
                .contains(&secret.name_any().as_str())
                .then(|| spec_ref.clone())
        };

        info!("Starting appliance controller for {}/{}", ns, self.config.config_map);

        controller::Controller::new(spec_config_maps, spec_watch)
            .owns(Deployment::api(client.clone(), ns), owned())
            .owns(StatefulSet::api(client.clone(), ns), owned())
            .owns(Service::api(client.clone(), ns), owned())
            .owns(ServiceAccount::api(client.clone(), ns), owned())
            .owns(Role::api(client.clone(), ns), owned())
            .owns(RoleBinding::api(client.clone(), ns), owned())
            .watches(
                Secret::api(client.clone(), ns),
                watcher::Config::default(),
                credentials_changed,
            )
            .graceful_shutdown_on(async move { cancel.cancelled().await })
            .run(
                |_config_map, queue| Self::reconcile(queue),
                |config_map, error, _queue| {
                    warn!("Reconciliation of {} failed: {}", config_map.name_any(), error);
                    Action::requeue(ERROR_REQUEUE)
                },
                Arc::new(self.queue.clone()),
            )
            .for_each(|result| async move {
                match result {
                    Ok((obj, _action)) => debug!("Reconciled ConfigMap: {}", obj.name),
                    Err(e) => debug!("Reconciliation failed: {:?}", e),
                }
            })
            .await;

        info!("Appliance controller stopped");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "appliance"
    }
}
