//! Frontend and the background services that share its configuration

use super::{
    auth_annotations, container, data_tier_env, deployment, env, pod_template, service,
    StepContext,
};
use crate::error::Result;
use crate::spec::DesiredSpec;
use crate::store::ObjectStore;
use k8s_openapi::api::core::v1::EnvVar;
use k8s_openapi::api::rbac::v1::{PolicyRule, Role, RoleBinding, RoleRef, Subject};

/// Name of the frontend workload and of the ingress-facing Service.
const FRONTEND: &str = "sourcegraph-frontend";
const FRONTEND_INTERNAL: &str = "sourcegraph-frontend-internal";

/// Addresses of the backend services as the frontend and its peers see them.
fn endpoints_env(spec: &DesiredSpec) -> Vec<EnvVar> {
    let replicas = |count: i32, name: &str, port: u16| {
        (0..count.max(1))
            .map(|i| format!("{name}-{i}.{name}:{port}"))
            .collect::<Vec<_>>()
            .join(" ")
    };

    vec![
        env("DEPLOY_TYPE", "appliance"),
        env("SRC_FRONTEND_INTERNAL", format!("{}:80", FRONTEND_INTERNAL)),
        env(
            "SRC_GIT_SERVERS",
            replicas(spec.gitserver.replica_count(), "gitserver", 3178),
        ),
        env(
            "INDEXED_SEARCH_SERVERS",
            replicas(spec.indexed_search.replica_count(), "indexed-search", 6070),
        ),
        env("SEARCHER_URL", "k8s+http://searcher:3181"),
        env("SYMBOLS_URL", "k8s+http://symbols:3184"),
        env("SRC_SYNTECT_SERVER", "http://syntect-server:9238"),
        env("REPO_UPDATER_URL", "http://repo-updater:3182"),
        env("PRECISE_CODE_INTEL_UPLOAD_BACKEND", "blobstore"),
        env("PRECISE_CODE_INTEL_UPLOAD_AWS_ENDPOINT", "http://blobstore:9000"),
    ]
}

pub(super) async fn reconcile_repo_updater<S: ObjectStore>(
    ctx: &StepContext<'_, S>,
) -> Result<()> {
    let name = "repo-updater";
    let cfg = &ctx.spec.repo_updater;
    let ports = [("http", 3182)];
    let checksum = ctx.auth_checksum().await?;

    let mut vars = data_tier_env();
    vars.extend(endpoints_env(ctx.spec));
    let main = container(name, ctx.image(cfg, name), cfg, &ports, vars, vec![]);
    let template = pod_template(name, cfg, vec![main], vec![], auth_annotations(&checksum));

    ctx.apply_service_account(name, cfg).await?;
    ctx.apply(service(ctx, name, name, &ports, false), cfg, None).await?;
    ctx.apply(deployment(ctx, name, cfg, template), cfg, Some(&checksum))
        .await?;
    Ok(())
}

pub(super) async fn reconcile_worker<S: ObjectStore>(ctx: &StepContext<'_, S>) -> Result<()> {
    let name = "worker";
    let cfg = &ctx.spec.worker;
    let ports = [("http", 3189)];
    let checksum = ctx.auth_checksum().await?;

    let mut vars = data_tier_env();
    vars.extend(endpoints_env(ctx.spec));
    let main = container(name, ctx.image(cfg, name), cfg, &ports, vars, vec![]);
    let template = pod_template(name, cfg, vec![main], vec![], auth_annotations(&checksum));

    ctx.apply_service_account(name, cfg).await?;
    ctx.apply(service(ctx, name, name, &ports, false), cfg, None).await?;
    ctx.apply(deployment(ctx, name, cfg, template), cfg, Some(&checksum))
        .await?;
    Ok(())
}

fn frontend_role<S: ObjectStore>(ctx: &StepContext<'_, S>) -> Role {
    Role {
        metadata: ctx.metadata(FRONTEND),
        rules: Some(vec![PolicyRule {
            api_groups: Some(vec![String::new()]),
            resources: Some(
                ["configmaps", "endpoints", "pods", "services"]
                    .into_iter()
                    .map(String::from)
                    .collect(),
            ),
            verbs: ["get", "list", "watch"].into_iter().map(String::from).collect(),
            ..Default::default()
        }]),
    }
}

fn frontend_role_binding<S: ObjectStore>(ctx: &StepContext<'_, S>) -> RoleBinding {
    RoleBinding {
        metadata: ctx.metadata(FRONTEND),
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "Role".to_string(),
            name: FRONTEND.to_string(),
        },
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".to_string(),
            name: FRONTEND.to_string(),
            namespace: Some(ctx.namespace.to_string()),
            ..Default::default()
        }]),
    }
}

pub(super) async fn reconcile_frontend<S: ObjectStore>(ctx: &StepContext<'_, S>) -> Result<()> {
    let cfg = &ctx.spec.frontend;
    let ports = [("http", 3080), ("http-internal", 3090)];
    let checksum = ctx.auth_checksum().await?;

    let mut vars = data_tier_env();
    vars.extend(endpoints_env(ctx.spec));
    let main = container("frontend", ctx.image(cfg, "frontend"), cfg, &ports, vars, vec![]);
    let template = pod_template(FRONTEND, cfg, vec![main], vec![], auth_annotations(&checksum));

    ctx.apply_service_account(FRONTEND, cfg).await?;
    ctx.apply(frontend_role(ctx), cfg, None).await?;
    ctx.apply(frontend_role_binding(ctx), cfg, None).await?;
    // The health checker may repoint this selector at the maintenance app.
    // Its hash does not cover the selector, so that flip survives passes.
    ctx.apply(service(ctx, FRONTEND, FRONTEND, &[("http", 30080)], false), cfg, None)
        .await?;
    ctx.apply(
        service(ctx, FRONTEND_INTERNAL, FRONTEND, &[("http-internal", 80)], false),
        cfg,
        None,
    )
    .await?;
    ctx.apply(deployment(ctx, FRONTEND, cfg, template), cfg, Some(&checksum))
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::Step;
    use crate::testing::{owner_config_map, FakeStore, NAMESPACE};
    use k8s_openapi::api::apps::v1::Deployment;
    use k8s_openapi::api::core::v1::Service;

    #[test]
    fn test_endpoints_follow_replica_counts() {
        let mut spec = DesiredSpec::decode("requestedVersion: 5.4.0\n").unwrap();
        spec.gitserver.replicas = Some(2);
        let vars = endpoints_env(&spec);
        let gitservers = vars
            .iter()
            .find(|v| v.name == "SRC_GIT_SERVERS")
            .and_then(|v| v.value.clone())
            .unwrap();
        assert_eq!(gitservers, "gitserver-0.gitserver:3178 gitserver-1.gitserver:3178");
    }

    #[tokio::test]
    async fn test_frontend_objects() {
        let store = FakeStore::new();
        let owner = owner_config_map();
        let spec = DesiredSpec::decode("requestedVersion: 5.4.0\n").unwrap();
        let ctx = StepContext {
            store: &store,
            owner: &owner,
            spec: &spec,
            namespace: NAMESPACE,
        };

        Step::Frontend.run(&ctx).await.unwrap();

        let deploy: Deployment = store.object(NAMESPACE, FRONTEND).unwrap();
        assert_eq!(deploy.spec.unwrap().replicas, Some(2));
        let binding: RoleBinding = store.object(NAMESPACE, FRONTEND).unwrap();
        assert_eq!(binding.role_ref.name, FRONTEND);
        assert!(store.object::<Role>(NAMESPACE, FRONTEND).is_some());

        let svc: Service = store.object(NAMESPACE, FRONTEND).unwrap();
        let selector = svc.spec.unwrap().selector.unwrap();
        assert_eq!(selector.get("app").map(String::as_str), Some(FRONTEND));
    }

    #[tokio::test]
    async fn test_maintenance_selector_survives_pass() {
        let store = FakeStore::new();
        let owner = owner_config_map();
        let spec = DesiredSpec::decode("requestedVersion: 5.4.0\n").unwrap();
        let ctx = StepContext {
            store: &store,
            owner: &owner,
            spec: &spec,
            namespace: NAMESPACE,
        };
        Step::Frontend.run(&ctx).await.unwrap();

        let mut svc: Service = store.object(NAMESPACE, FRONTEND).unwrap();
        svc.spec.as_mut().unwrap().selector = Some(
            [("app".to_string(), "sourcegraph-appliance-frontend".to_string())].into(),
        );
        store.insert(NAMESPACE, &svc);
        store.clear_calls();

        Step::Frontend.run(&ctx).await.unwrap();

        assert_eq!(store.mutations_of("Service", FRONTEND), 0);
        let svc: Service = store.object(NAMESPACE, FRONTEND).unwrap();
        assert_eq!(
            svc.spec.unwrap().selector.unwrap()["app"],
            "sourcegraph-appliance-frontend"
        );
    }
}
