//! Per-service reconcile steps
//!
//! Each step builds the desired objects for one Sourcegraph service from the
//! spec and hands them to the reconciliation primitive. Steps run strictly in
//! [`Step::ORDER`]: data tiers first, then the services that read their
//! credentials.

mod frontend;
mod search;
mod storage;

use crate::annotations::{
    APP_LABEL, AUTH_CHECKSUM_ANNOTATION, DEPLOY_LABEL, DEPLOY_LABEL_VALUE, MANAGED_BY,
    MANAGED_BY_LABEL,
};
use crate::error::Result;
use crate::reconcile::{config_hash, reconcile_object, Outcome};
use crate::spec::{DesiredSpec, ServiceConfig};
use crate::store::{ManagedKind, ObjectStore};
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec, StatefulSet, StatefulSetSpec};
use k8s_openapi::api::core::v1::{
    ConfigMap, Container, ContainerPort, EmptyDirVolumeSource, EnvVar, EnvVarSource,
    PersistentVolumeClaim, PersistentVolumeClaimSpec, PodSpec, PodTemplateSpec, Secret,
    SecretKeySelector, Service, ServiceAccount, ServicePort, ServiceSpec, Volume, VolumeMount,
    VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use serde::Serialize;
use std::collections::BTreeMap;

/// Secrets whose content is folded into the pod template of every workload
/// that connects to the data tier.
pub const AUTH_SECRETS: [&str; 4] = [
    "pgsql-auth",
    "codeintel-db-auth",
    "redis-cache",
    "redis-store",
];

/// Everything a step needs for one pass
pub struct StepContext<'a, S> {
    pub store: &'a S,
    pub owner: &'a ConfigMap,
    pub spec: &'a DesiredSpec,
    pub namespace: &'a str,
}

/// Everything besides the object itself that determines its content.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StepInputs<'a> {
    config: &'a ServiceConfig,
    image_repository: &'a str,
    storage_class_name: Option<&'a str>,
    auth_checksum: Option<&'a str>,
}

impl<'a, S: ObjectStore> StepContext<'a, S> {
    /// Reconciles one object belonging to the service configured by `config`.
    /// Pass `auth_checksum` for workloads that read the credential Secrets.
    pub async fn apply<K: ManagedKind>(
        &self,
        object: K,
        config: &ServiceConfig,
        auth_checksum: Option<&str>,
    ) -> Result<Outcome> {
        let inputs = StepInputs {
            config,
            image_repository: &self.spec.image_repository,
            storage_class_name: self.spec.storage_class_name.as_deref(),
            auth_checksum,
        };
        reconcile_object(
            self.store,
            self.owner,
            object,
            &inputs,
            config,
            &self.spec.requested_version,
        )
        .await
    }

    /// Reconciles the ServiceAccount every service runs as.
    pub async fn apply_service_account(
        &self,
        name: &str,
        config: &ServiceConfig,
    ) -> Result<Outcome> {
        let account = ServiceAccount {
            metadata: ObjectMeta {
                annotations: non_empty(config.service_account_annotations.clone()),
                ..self.metadata(name)
            },
            ..Default::default()
        };
        self.apply(account, config, None).await
    }

    pub fn metadata(&self, name: &str) -> ObjectMeta {
        ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(self.namespace.to_string()),
            labels: Some(common_labels(name)),
            ..Default::default()
        }
    }

    /// `<repository>/<image>:<version>`, unless the service overrides it.
    pub fn image(&self, config: &ServiceConfig, image: &str) -> String {
        config.container_image.clone().unwrap_or_else(|| {
            format!(
                "{}/{}:{}",
                self.spec.image_repository.trim_end_matches('/'),
                image,
                self.spec.requested_version
            )
        })
    }

    /// Checksum over the live credential Secrets. A Secret that does not
    /// exist yet contributes an empty placeholder.
    pub async fn auth_checksum(&self) -> Result<String> {
        let mut contents = Vec::with_capacity(AUTH_SECRETS.len());
        for name in AUTH_SECRETS {
            let secret = self.store.get::<Secret>(self.namespace, name).await?;
            let data = secret.map(|s| {
                (
                    s.data.unwrap_or_default(),
                    s.string_data.unwrap_or_default(),
                )
            });
            contents.push((name, data));
        }
        config_hash(&contents)
    }
}

/// Reconcile steps in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Blobstore,
    Pgsql,
    CodeintelDb,
    RedisCache,
    RedisStore,
    SyntectServer,
    Symbols,
    Searcher,
    Gitserver,
    IndexedSearch,
    RepoUpdater,
    Worker,
    Frontend,
}

impl Step {
    pub const ORDER: [Step; 13] = [
        Step::Blobstore,
        Step::Pgsql,
        Step::CodeintelDb,
        Step::RedisCache,
        Step::RedisStore,
        Step::SyntectServer,
        Step::Symbols,
        Step::Searcher,
        Step::Gitserver,
        Step::IndexedSearch,
        Step::RepoUpdater,
        Step::Worker,
        Step::Frontend,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Step::Blobstore => "blobstore",
            Step::Pgsql => "pgsql",
            Step::CodeintelDb => "codeintel-db",
            Step::RedisCache => "redis-cache",
            Step::RedisStore => "redis-store",
            Step::SyntectServer => "syntect-server",
            Step::Symbols => "symbols",
            Step::Searcher => "searcher",
            Step::Gitserver => "gitserver",
            Step::IndexedSearch => "indexed-search",
            Step::RepoUpdater => "repo-updater",
            Step::Worker => "worker",
            Step::Frontend => "frontend",
        }
    }

    pub async fn run<S: ObjectStore>(self, ctx: &StepContext<'_, S>) -> Result<()> {
        match self {
            Step::Blobstore => storage::reconcile_blobstore(ctx).await,
            Step::Pgsql => storage::reconcile_pgsql(ctx).await,
            Step::CodeintelDb => storage::reconcile_codeintel_db(ctx).await,
            Step::RedisCache => {
                storage::reconcile_redis(ctx, "redis-cache", &ctx.spec.redis_cache).await
            }
            Step::RedisStore => {
                storage::reconcile_redis(ctx, "redis-store", &ctx.spec.redis_store).await
            }
            Step::SyntectServer => search::reconcile_syntect_server(ctx).await,
            Step::Symbols => search::reconcile_symbols(ctx).await,
            Step::Searcher => search::reconcile_searcher(ctx).await,
            Step::Gitserver => search::reconcile_gitserver(ctx).await,
            Step::IndexedSearch => search::reconcile_indexed_search(ctx).await,
            Step::RepoUpdater => frontend::reconcile_repo_updater(ctx).await,
            Step::Worker => frontend::reconcile_worker(ctx).await,
            Step::Frontend => frontend::reconcile_frontend(ctx).await,
        }
    }
}

pub fn common_labels(name: &str) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(APP_LABEL.to_string(), name.to_string());
    labels.insert(DEPLOY_LABEL.to_string(), DEPLOY_LABEL_VALUE.to_string());
    labels.insert(MANAGED_BY_LABEL.to_string(), MANAGED_BY.to_string());
    labels
}

pub fn pod_selector(name: &str) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(APP_LABEL.to_string(), name.to_string());
    labels
}

fn non_empty(map: BTreeMap<String, String>) -> Option<BTreeMap<String, String>> {
    if map.is_empty() {
        None
    } else {
        Some(map)
    }
}

pub fn env(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.into()),
        ..Default::default()
    }
}

pub fn secret_env(name: &str, secret: &str, key: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            secret_key_ref: Some(SecretKeySelector {
                name: Some(secret.to_string()),
                key: key.to_string(),
                optional: Some(true),
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Environment of every service that talks to the databases and redis.
pub fn data_tier_env() -> Vec<EnvVar> {
    let mut vars = Vec::new();
    for (prefix, secret) in [("PG", "pgsql-auth"), ("CODEINTEL_PG", "codeintel-db-auth")] {
        vars.push(secret_env(&format!("{}HOST", prefix), secret, "host"));
        vars.push(secret_env(&format!("{}PORT", prefix), secret, "port"));
        vars.push(secret_env(&format!("{}USER", prefix), secret, "user"));
        vars.push(secret_env(&format!("{}PASSWORD", prefix), secret, "password"));
        vars.push(secret_env(&format!("{}DATABASE", prefix), secret, "database"));
    }
    vars.push(secret_env("REDIS_CACHE_ENDPOINT", "redis-cache", "endpoint"));
    vars.push(secret_env("REDIS_STORE_ENDPOINT", "redis-store", "endpoint"));
    vars
}

/// Builds the main container of a service. Variables from the spec override
/// built-in ones with the same name.
pub fn container(
    name: &str,
    image: String,
    config: &ServiceConfig,
    ports: &[(&str, i32)],
    mut env_vars: Vec<EnvVar>,
    mounts: Vec<VolumeMount>,
) -> Container {
    for (key, value) in &config.env {
        env_vars.retain(|v| &v.name != key);
        env_vars.push(env(key, value.clone()));
    }

    Container {
        name: name.to_string(),
        image: Some(image),
        image_pull_policy: Some("IfNotPresent".to_string()),
        env: if env_vars.is_empty() { None } else { Some(env_vars) },
        ports: if ports.is_empty() {
            None
        } else {
            Some(
                ports
                    .iter()
                    .map(|(port_name, port)| ContainerPort {
                        name: Some(port_name.to_string()),
                        container_port: *port,
                        ..Default::default()
                    })
                    .collect(),
            )
        },
        resources: config.resources.clone(),
        volume_mounts: if mounts.is_empty() { None } else { Some(mounts) },
        termination_message_policy: Some("FallbackToLogsOnError".to_string()),
        ..Default::default()
    }
}

pub fn mount(name: &str, path: &str) -> VolumeMount {
    VolumeMount {
        name: name.to_string(),
        mount_path: path.to_string(),
        ..Default::default()
    }
}

pub fn empty_dir(name: &str) -> Volume {
    Volume {
        name: name.to_string(),
        empty_dir: Some(EmptyDirVolumeSource::default()),
        ..Default::default()
    }
}

pub fn pod_template(
    name: &str,
    config: &ServiceConfig,
    containers: Vec<Container>,
    volumes: Vec<Volume>,
    annotations: BTreeMap<String, String>,
) -> PodTemplateSpec {
    PodTemplateSpec {
        metadata: Some(ObjectMeta {
            labels: Some(common_labels(name)),
            annotations: non_empty(annotations),
            ..Default::default()
        }),
        spec: Some(PodSpec {
            service_account_name: Some(name.to_string()),
            containers,
            volumes: if volumes.is_empty() { None } else { Some(volumes) },
            node_selector: non_empty(config.node_selector.clone()),
            ..Default::default()
        }),
    }
}

/// Pod template annotations carrying the credential checksum.
pub fn auth_annotations(checksum: &str) -> BTreeMap<String, String> {
    let mut annotations = BTreeMap::new();
    annotations.insert(AUTH_CHECKSUM_ANNOTATION.to_string(), checksum.to_string());
    annotations
}

pub fn deployment<S: ObjectStore>(
    ctx: &StepContext<'_, S>,
    name: &str,
    config: &ServiceConfig,
    template: PodTemplateSpec,
) -> Deployment {
    Deployment {
        metadata: ctx.metadata(name),
        spec: Some(DeploymentSpec {
            replicas: Some(config.replica_count()),
            selector: LabelSelector {
                match_labels: Some(pod_selector(name)),
                ..Default::default()
            },
            template,
            min_ready_seconds: Some(10),
            revision_history_limit: Some(10),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// StatefulSet with a `data` volume claim template. The claims it creates
/// are not owned by the spec ConfigMap and outlive the StatefulSet.
pub fn stateful_set<S: ObjectStore>(
    ctx: &StepContext<'_, S>,
    name: &str,
    config: &ServiceConfig,
    template: PodTemplateSpec,
) -> StatefulSet {
    StatefulSet {
        metadata: ctx.metadata(name),
        spec: Some(StatefulSetSpec {
            replicas: Some(config.replica_count()),
            selector: LabelSelector {
                match_labels: Some(pod_selector(name)),
                ..Default::default()
            },
            service_name: name.to_string(),
            template,
            volume_claim_templates: Some(vec![volume_claim_template(
                config.storage(),
                ctx.spec.storage_class_name.clone(),
            )]),
            revision_history_limit: Some(10),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn volume_claim_template(size: &str, storage_class_name: Option<String>) -> PersistentVolumeClaim {
    let mut requests = BTreeMap::new();
    requests.insert("storage".to_string(), Quantity(size.to_string()));
    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some("data".to_string()),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            storage_class_name,
            resources: Some(VolumeResourceRequirements {
                requests: Some(requests),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// ClusterIP service exposing `ports` of the pods labelled `app=<selector_app>`.
pub fn service<S: ObjectStore>(
    ctx: &StepContext<'_, S>,
    name: &str,
    selector_app: &str,
    ports: &[(&str, i32)],
    headless: bool,
) -> Service {
    Service {
        metadata: ctx.metadata(name),
        spec: Some(ServiceSpec {
            cluster_ip: if headless { Some("None".to_string()) } else { None },
            selector: Some(pod_selector(selector_app)),
            ports: Some(
                ports
                    .iter()
                    .map(|(port_name, port)| ServicePort {
                        name: Some(port_name.to_string()),
                        port: *port,
                        target_port: Some(IntOrString::String(port_name.to_string())),
                        ..Default::default()
                    })
                    .collect(),
            ),
            ..Default::default()
        }),
        ..Default::default()
    }
}
