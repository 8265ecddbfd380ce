//! Sourcegraph Appliance Operator
//!
//! Deploys and reconciles a Sourcegraph instance from a spec ConfigMap.
//!
//! ## Usage
//!
//! ```bash
//! # Run the operator (requires kubeconfig or in-cluster service account)
//! appliance-operator --namespace sourcegraph
//!
//! # Run with custom log level
//! RUST_LOG=debug appliance-operator
//! ```

use appliance_operator::config::{
    detect_namespace, parse_selector, polling_interval, HealthCheckConfig, OperatorConfig,
    SelfUpdateConfig,
};
use appliance_operator::latch::Latch;
use appliance_operator::registry::HttpReleaseRegistry;
use appliance_operator::{
    ApplianceController, ApplianceReconciler, Controller, HealthChecker, KubeStore, PassQueue,
    SelfUpdater,
};
use clap::Parser;
use kube::Client;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Sourcegraph Appliance Operator
#[derive(Parser, Debug)]
#[command(name = "appliance-operator")]
#[command(version, about = "Kubernetes operator for Sourcegraph appliance installations")]
struct Args {
    /// Namespace of the spec ConfigMap and all managed objects (auto-detected if empty)
    #[arg(long, env = "POD_NAMESPACE", default_value = "")]
    namespace: String,

    /// Name of the spec ConfigMap
    #[arg(long, default_value = "sourcegraph-appliance")]
    config_map: String,

    /// Seconds between frontend health probes
    #[arg(long, default_value_t = 5)]
    health_check_interval_secs: u64,

    /// Seconds to wait before re-probing a failed frontend
    #[arg(long, default_value_t = 10)]
    health_check_grace_secs: u64,

    /// Label selector of the frontend pods to probe
    #[arg(long, default_value = "app=sourcegraph-frontend")]
    frontend_selector: String,

    /// Ingress-facing Service whose selector is switched on failover
    #[arg(long, default_value = "sourcegraph-frontend")]
    ingress_service: String,

    /// `app` label of the maintenance backend
    #[arg(long, default_value = "sourcegraph-appliance-frontend")]
    maintenance_app: String,

    /// Disable the self-update loop
    #[arg(long)]
    no_self_update: bool,

    /// Seconds between self-update checks
    #[arg(long, default_value_t = 3600)]
    self_update_interval_secs: u64,

    /// Maximum number of minor versions a single self-update may advance
    #[arg(long, default_value_t = 2)]
    self_update_max_minor: u64,

    /// Base URL of the release registry
    #[arg(long, default_value = "https://releaseregistry.sourcegraph.com")]
    release_registry_url: String,

    /// Deployments running the operator itself
    #[arg(long, value_delimiter = ',', default_value = "sourcegraph-appliance")]
    self_deployments: Vec<String>,

    /// Version of the running operator
    #[arg(long, default_value = env!("CARGO_PKG_VERSION"))]
    operator_version: String,
}

impl Args {
    fn into_config(self) -> anyhow::Result<OperatorConfig> {
        let normal_selector = parse_selector(&self.frontend_selector)?;
        let mut maintenance_selector = BTreeMap::new();
        maintenance_selector.insert("app".to_string(), self.maintenance_app);

        Ok(OperatorConfig {
            namespace: detect_namespace(&self.namespace),
            config_map: self.config_map,
            health_check: HealthCheckConfig {
                interval: polling_interval(
                    "health-check-interval-secs",
                    self.health_check_interval_secs,
                )?,
                grace_period: Duration::from_secs(self.health_check_grace_secs),
                probe_selector: self.frontend_selector,
                service_name: self.ingress_service,
                normal_selector,
                maintenance_selector,
            },
            self_update: SelfUpdateConfig {
                enabled: !self.no_self_update,
                interval: polling_interval(
                    "self-update-interval-secs",
                    self.self_update_interval_secs,
                )?,
                max_minor_advance: self.self_update_max_minor,
                registry_url: self.release_registry_url,
                deployments: self.self_deployments,
                current_version: self.operator_version,
            },
        })
    }
}

fn spawn_controller(controller: Arc<dyn Controller>, cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = controller.run(cancel).await {
            error!("{} controller error: {}", controller.name(), e);
        }
    })
}

/// Runs until `shutdown` resolves or the appliance controller exits, then
/// cancels every loop and joins all tasks.
async fn wait_for_shutdown(
    shutdown: impl Future<Output = ()>,
    mut appliance: JoinHandle<()>,
    others: Vec<(&'static str, JoinHandle<()>)>,
    cancel: CancellationToken,
) {
    let appliance_finished = tokio::select! {
        _ = shutdown => false,
        result = &mut appliance => {
            if let Err(e) = result {
                error!("Appliance controller task failed: {}", e);
            }
            true
        }
    };

    cancel.cancel();
    if !appliance_finished {
        if let Err(e) = appliance.await {
            error!("Appliance controller task failed: {}", e);
        }
    }
    for (name, handle) in others {
        if let Err(e) = handle.await {
            error!("{} task failed: {}", name, e);
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let config = Arc::new(Args::parse().into_config()?);

    info!("Starting Sourcegraph Appliance Operator");
    info!(
        "Watching ConfigMap {}/{} (operator version {})",
        config.namespace, config.config_map, config.self_update.current_version
    );

    let client = Client::try_default().await?;
    info!("Connected to Kubernetes API server");

    let store = Arc::new(KubeStore::new(client.clone()));
    let cancel = CancellationToken::new();
    let latch = Latch::new();

    let reconciler = Arc::new(ApplianceReconciler::new(
        Arc::clone(&store),
        &config.namespace,
        &config.config_map,
        latch.clone(),
    ));
    let (queue, worker) = PassQueue::spawn(reconciler, cancel.clone());

    let appliance = Arc::new(ApplianceController::new(
        client.clone(),
        Arc::clone(&config),
        queue,
    ));
    let health_check = Arc::new(HealthChecker::new(
        Arc::clone(&store),
        &config.namespace,
        config.health_check.clone(),
        latch,
    ));
    let self_update = Arc::new(SelfUpdater::new(
        Arc::clone(&store),
        HttpReleaseRegistry::new(&config.self_update.registry_url)?,
        &config.namespace,
        config.self_update.clone(),
    ));

    let appliance_handle = spawn_controller(appliance, cancel.clone());
    let health_handle = spawn_controller(health_check, cancel.clone());
    let self_update_handle = spawn_controller(self_update, cancel.clone());

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {}", e);
        }
        info!("Received shutdown signal");
    };
    wait_for_shutdown(
        shutdown,
        appliance_handle,
        vec![
            ("health-check", health_handle),
            ("self-update", self_update_handle),
            ("worker", worker),
        ],
        cancel,
    )
    .await;

    info!("Appliance Operator shutting down");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn parse(extra: &[&str]) -> anyhow::Result<OperatorConfig> {
        let args = ["appliance-operator", "--namespace", "sourcegraph"]
            .iter()
            .chain(extra)
            .copied();
        Args::try_parse_from(args)?.into_config()
    }

    #[test]
    fn test_defaults_build_a_config() {
        let config = parse(&[]).unwrap();
        assert_eq!(config.namespace, "sourcegraph");
        assert_eq!(config.health_check.interval, Duration::from_secs(5));
        assert_eq!(config.self_update.interval, Duration::from_secs(3600));
    }

    #[tokio::test]
    async fn test_shutdown_joins_the_appliance_controller() {
        let cancel = CancellationToken::new();
        let stopped = Arc::new(AtomicBool::new(false));
        let task = |stopped: Arc<AtomicBool>, cancel: CancellationToken| {
            tokio::spawn(async move {
                cancel.cancelled().await;
                tokio::task::yield_now().await;
                stopped.store(true, Ordering::SeqCst);
            })
        };
        let appliance = task(Arc::clone(&stopped), cancel.clone());
        let worker_stopped = Arc::new(AtomicBool::new(false));
        let worker = task(Arc::clone(&worker_stopped), cancel.clone());

        wait_for_shutdown(async {}, appliance, vec![("worker", worker)], cancel.clone()).await;

        assert!(cancel.is_cancelled());
        assert!(stopped.load(Ordering::SeqCst));
        assert!(worker_stopped.load(Ordering::SeqCst));
    }

    #[test]
    fn test_zero_intervals_are_rejected() {
        let err = parse(&["--health-check-interval-secs", "0"]).unwrap_err();
        assert!(err.to_string().contains("health-check-interval-secs"));

        let err = parse(&["--self-update-interval-secs", "0"]).unwrap_err();
        assert!(err.to_string().contains("self-update-interval-secs"));
    }
}
