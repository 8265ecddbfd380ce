//! Data tier: blobstore, the two Postgres databases and the two redis instances

use super::{
    container, env, mount, pod_template, secret_env, service, stateful_set, StepContext,
};
use crate::error::Result;
use crate::reconcile::ensure_present_unowned;
use crate::spec::{Disableable, ServiceConfig};
use crate::store::ObjectStore;
use k8s_openapi::api::core::v1::Secret;
use std::collections::BTreeMap;

const PASSWORD_LENGTH: usize = 32;

fn generate_password() -> String {
    use rand::Rng;

    const CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    (0..PASSWORD_LENGTH)
        .map(|_| CHARSET[rng.gen_range(0..CHARSET.len())] as char)
        .collect()
}

/// Creates a credential Secret unless one already exists. Admins may
/// pre-create these to point services at external databases, so the
/// operator never owns or rewrites them.
async fn ensure_credentials<S: ObjectStore>(
    ctx: &StepContext<'_, S>,
    name: &str,
    data: BTreeMap<String, String>,
) -> Result<()> {
    let secret = Secret {
        metadata: ctx.metadata(name),
        string_data: Some(data),
        ..Default::default()
    };
    ensure_present_unowned(ctx.store, ctx.namespace, secret).await?;
    Ok(())
}

pub(super) async fn reconcile_blobstore<S: ObjectStore>(ctx: &StepContext<'_, S>) -> Result<()> {
    let name = "blobstore";
    let cfg = &ctx.spec.blobstore;
    let ports = [("blobstore", 9000)];

    let main = container(
        name,
        ctx.image(cfg, "blobstore"),
        cfg,
        &ports,
        vec![],
        vec![mount("data", "/data")],
    );
    let template = pod_template(name, cfg, vec![main], vec![], BTreeMap::new());

    ctx.apply_service_account(name, cfg).await?;
    ctx.apply(service(ctx, name, name, &ports, false), cfg, None).await?;
    ctx.apply(stateful_set(ctx, name, cfg, template), cfg, None).await?;
    Ok(())
}

pub(super) async fn reconcile_pgsql<S: ObjectStore>(ctx: &StepContext<'_, S>) -> Result<()> {
    reconcile_postgres(ctx, "pgsql", "pgsql-auth", "postgres-12-alpine", &ctx.spec.pgsql).await
}

pub(super) async fn reconcile_codeintel_db<S: ObjectStore>(
    ctx: &StepContext<'_, S>,
) -> Result<()> {
    reconcile_postgres(
        ctx,
        "codeintel-db",
        "codeintel-db-auth",
        "codeintel-db",
        &ctx.spec.codeintel_db,
    )
    .await
}

async fn reconcile_postgres<S: ObjectStore>(
    ctx: &StepContext<'_, S>,
    name: &str,
    secret: &str,
    image: &str,
    cfg: &ServiceConfig,
) -> Result<()> {
    let ports = [("pgsql", 5432)];

    if !cfg.is_disabled() {
        let mut data = BTreeMap::new();
        data.insert("database".to_string(), "sg".to_string());
        data.insert("host".to_string(), name.to_string());
        data.insert("password".to_string(), generate_password());
        data.insert("port".to_string(), "5432".to_string());
        data.insert("user".to_string(), "sg".to_string());
        ensure_credentials(ctx, secret, data).await?;
    }

    let main = container(
        name,
        ctx.image(cfg, image),
        cfg,
        &ports,
        vec![
            secret_env("POSTGRES_DATABASE", secret, "database"),
            secret_env("POSTGRES_USER", secret, "user"),
            secret_env("POSTGRES_PASSWORD", secret, "password"),
            env("PGDATA", "/data/pgdata-12"),
        ],
        vec![mount("data", "/data")],
    );
    let template = pod_template(name, cfg, vec![main], vec![], BTreeMap::new());

    ctx.apply_service_account(name, cfg).await?;
    ctx.apply(service(ctx, name, name, &ports, false), cfg, None).await?;
    ctx.apply(stateful_set(ctx, name, cfg, template), cfg, None).await?;
    Ok(())
}

pub(super) async fn reconcile_redis<S: ObjectStore>(
    ctx: &StepContext<'_, S>,
    name: &str,
    cfg: &ServiceConfig,
) -> Result<()> {
    let ports = [("redis", 6379)];

    if !cfg.is_disabled() {
        let mut data = BTreeMap::new();
        data.insert("endpoint".to_string(), format!("redis://{}:6379", name));
        ensure_credentials(ctx, name, data).await?;
    }

    let main = container(
        name,
        ctx.image(cfg, name),
        cfg,
        &ports,
        vec![],
        vec![mount("data", "/redis-data")],
    );
    let template = pod_template(name, cfg, vec![main], vec![], BTreeMap::new());

    ctx.apply_service_account(name, cfg).await?;
    ctx.apply(service(ctx, name, name, &ports, false), cfg, None).await?;
    ctx.apply(stateful_set(ctx, name, cfg, template), cfg, None).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::Step;
    use crate::spec::DesiredSpec;
    use crate::testing::{owner_config_map, FakeStore, NAMESPACE};
    use k8s_openapi::api::apps::v1::StatefulSet;

    #[test]
    fn test_generated_passwords_differ() {
        let a = generate_password();
        assert_eq!(a.len(), PASSWORD_LENGTH);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(a, generate_password());
    }

    #[tokio::test]
    async fn test_pgsql_statefulset_claims_data_volume() {
        let store = FakeStore::new();
        let owner = owner_config_map();
        let mut spec =
            DesiredSpec::decode("requestedVersion: 5.4.0\nstorageClassName: fast\n").unwrap();
        spec.pgsql.storage_size = Some("50Gi".to_string());
        let ctx = StepContext {
            store: &store,
            owner: &owner,
            spec: &spec,
            namespace: NAMESPACE,
        };

        Step::Pgsql.run(&ctx).await.unwrap();

        let sts: StatefulSet = store.object(NAMESPACE, "pgsql").unwrap();
        let claim = &sts.spec.unwrap().volume_claim_templates.unwrap()[0];
        let claim_spec = claim.spec.as_ref().unwrap();
        assert_eq!(claim_spec.storage_class_name.as_deref(), Some("fast"));
        let size = &claim_spec.resources.as_ref().unwrap().requests.as_ref().unwrap()["storage"];
        assert_eq!(size.0, "50Gi");
    }

    #[tokio::test]
    async fn test_disabled_database_keeps_admin_credentials() {
        let store = FakeStore::new();
        let owner = owner_config_map();
        let mut spec = DesiredSpec::decode("requestedVersion: 5.4.0\n").unwrap();
        spec.codeintel_db.disabled = true;
        let ctx = StepContext {
            store: &store,
            owner: &owner,
            spec: &spec,
            namespace: NAMESPACE,
        };

        Step::CodeintelDb.run(&ctx).await.unwrap();

        assert!(store.object::<Secret>(NAMESPACE, "codeintel-db-auth").is_none());
        assert!(store.object::<StatefulSet>(NAMESPACE, "codeintel-db").is_none());
        assert!(store.calls().is_empty());
    }

    #[tokio::test]
    async fn test_redis_endpoint_secret() {
        let store = FakeStore::new();
        let owner = owner_config_map();
        let spec = DesiredSpec::decode("requestedVersion: 5.4.0\n").unwrap();
        let ctx = StepContext {
            store: &store,
            owner: &owner,
            spec: &spec,
            namespace: NAMESPACE,
        };

        Step::RedisStore.run(&ctx).await.unwrap();

        let secret: Secret = store.object(NAMESPACE, "redis-store").unwrap();
        assert_eq!(
            secret.string_data.unwrap()["endpoint"],
            "redis://redis-store:6379"
        );
    }
}
