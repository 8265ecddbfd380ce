//! Code intelligence and search services, and gitserver which they read from

use super::{
    auth_annotations, container, data_tier_env, deployment, empty_dir, env, mount, pod_template,
    service, stateful_set, StepContext,
};
use crate::error::Result;
use crate::store::ObjectStore;
use std::collections::BTreeMap;

pub(super) async fn reconcile_syntect_server<S: ObjectStore>(
    ctx: &StepContext<'_, S>,
) -> Result<()> {
    let name = "syntect-server";
    let cfg = &ctx.spec.syntect_server;
    let ports = [("http", 9238)];

    let main = container(
        name,
        ctx.image(cfg, "syntax-highlighter"),
        cfg,
        &ports,
        vec![],
        vec![],
    );
    let template = pod_template(name, cfg, vec![main], vec![], BTreeMap::new());

    ctx.apply_service_account(name, cfg).await?;
    ctx.apply(service(ctx, name, name, &ports, false), cfg, None).await?;
    ctx.apply(deployment(ctx, name, cfg, template), cfg, None).await?;
    Ok(())
}

pub(super) async fn reconcile_symbols<S: ObjectStore>(ctx: &StepContext<'_, S>) -> Result<()> {
    let name = "symbols";
    let cfg = &ctx.spec.symbols;
    let ports = [("http", 3184), ("debug", 6060)];

    let main = container(
        name,
        ctx.image(cfg, name),
        cfg,
        &ports,
        vec![env("CACHE_DIR", "/mnt/cache/symbols")],
        vec![mount("cache", "/mnt/cache")],
    );
    let template = pod_template(name, cfg, vec![main], vec![empty_dir("cache")], BTreeMap::new());

    ctx.apply_service_account(name, cfg).await?;
    ctx.apply(service(ctx, name, name, &ports[..1], false), cfg, None).await?;
    ctx.apply(deployment(ctx, name, cfg, template), cfg, None).await?;
    Ok(())
}

pub(super) async fn reconcile_searcher<S: ObjectStore>(ctx: &StepContext<'_, S>) -> Result<()> {
    let name = "searcher";
    let cfg = &ctx.spec.searcher;
    let ports = [("http", 3181), ("debug", 6060)];
    let checksum = ctx.auth_checksum().await?;

    let mut vars = data_tier_env();
    vars.push(env("CACHE_DIR", "/mnt/cache/searcher"));
    let main = container(
        name,
        ctx.image(cfg, name),
        cfg,
        &ports,
        vars,
        vec![mount("cache", "/mnt/cache")],
    );
    let template = pod_template(
        name,
        cfg,
        vec![main],
        vec![empty_dir("cache")],
        auth_annotations(&checksum),
    );

    ctx.apply_service_account(name, cfg).await?;
    ctx.apply(service(ctx, name, name, &ports[..1], false), cfg, None).await?;
    ctx.apply(deployment(ctx, name, cfg, template), cfg, Some(&checksum))
        .await?;
    Ok(())
}

pub(super) async fn reconcile_gitserver<S: ObjectStore>(ctx: &StepContext<'_, S>) -> Result<()> {
    let name = "gitserver";
    let cfg = &ctx.spec.gitserver;
    let ports = [("rpc", 3178)];
    let checksum = ctx.auth_checksum().await?;

    let mut vars = data_tier_env();
    vars.push(env("SRC_REPOS_DIR", "/data/repos"));
    let main = container(
        name,
        ctx.image(cfg, name),
        cfg,
        &ports,
        vars,
        vec![mount("data", "/data/repos"), mount("tmpdir", "/tmp")],
    );
    let template = pod_template(
        name,
        cfg,
        vec![main],
        vec![empty_dir("tmpdir")],
        auth_annotations(&checksum),
    );

    ctx.apply_service_account(name, cfg).await?;
    // Headless so every replica gets a stable DNS name.
    ctx.apply(service(ctx, name, name, &ports, true), cfg, None).await?;
    ctx.apply(stateful_set(ctx, name, cfg, template), cfg, Some(&checksum))
        .await?;
    Ok(())
}

pub(super) async fn reconcile_indexed_search<S: ObjectStore>(
    ctx: &StepContext<'_, S>,
) -> Result<()> {
    let name = "indexed-search";
    let cfg = &ctx.spec.indexed_search;
    let webserver_ports = [("http", 6070)];
    let indexer_ports = [("index-http", 6072)];
    let checksum = ctx.auth_checksum().await?;

    let webserver = container(
        "zoekt-webserver",
        ctx.image(cfg, "indexed-searcher"),
        cfg,
        &webserver_ports,
        vec![],
        vec![mount("data", "/data")],
    );
    let indexer = container(
        "zoekt-indexserver",
        ctx.image(cfg, "search-indexer"),
        cfg,
        &indexer_ports,
        data_tier_env(),
        vec![mount("data", "/data")],
    );
    let template = pod_template(
        name,
        cfg,
        vec![webserver, indexer],
        vec![],
        auth_annotations(&checksum),
    );

    ctx.apply_service_account(name, cfg).await?;
    ctx.apply(service(ctx, name, name, &webserver_ports, true), cfg, None)
        .await?;
    ctx.apply(
        service(ctx, "indexed-search-indexer", name, &indexer_ports, true),
        cfg,
        None,
    )
    .await?;
    ctx.apply(stateful_set(ctx, name, cfg, template), cfg, Some(&checksum))
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::annotations::AUTH_CHECKSUM_ANNOTATION;
    use crate::services::Step;
    use crate::spec::DesiredSpec;
    use crate::testing::{owner_config_map, FakeStore, NAMESPACE};
    use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
    use k8s_openapi::api::core::v1::Service;

    #[tokio::test]
    async fn test_indexed_search_runs_both_containers() {
        let store = FakeStore::new();
        let owner = owner_config_map();
        let spec = DesiredSpec::decode("requestedVersion: 5.4.0\n").unwrap();
        let ctx = StepContext {
            store: &store,
            owner: &owner,
            spec: &spec,
            namespace: NAMESPACE,
        };

        Step::IndexedSearch.run(&ctx).await.unwrap();

        let sts: StatefulSet = store.object(NAMESPACE, "indexed-search").unwrap();
        let template = sts.spec.unwrap().template;
        let names: Vec<_> = template
            .spec
            .unwrap()
            .containers
            .into_iter()
            .map(|c| c.name)
            .collect();
        assert_eq!(names, vec!["zoekt-webserver", "zoekt-indexserver"]);
        assert!(template
            .metadata
            .unwrap()
            .annotations
            .unwrap()
            .contains_key(AUTH_CHECKSUM_ANNOTATION));

        let indexer: Service = store.object(NAMESPACE, "indexed-search-indexer").unwrap();
        assert_eq!(indexer.spec.unwrap().cluster_ip.as_deref(), Some("None"));
    }

    #[tokio::test]
    async fn test_symbols_has_no_credential_checksum() {
        let store = FakeStore::new();
        let owner = owner_config_map();
        let spec = DesiredSpec::decode("requestedVersion: 5.4.0\n").unwrap();
        let ctx = StepContext {
            store: &store,
            owner: &owner,
            spec: &spec,
            namespace: NAMESPACE,
        };

        Step::Symbols.run(&ctx).await.unwrap();

        let symbols: Deployment = store.object(NAMESPACE, "symbols").unwrap();
        let template = symbols.spec.unwrap().template;
        assert!(template.metadata.unwrap().annotations.is_none());
    }
}
