//! Object store seam
//!
//! Everything the engine does against the cluster goes through
//! [`ObjectStore`], so reconciliation can run against the live API server
//! ([`KubeStore`]) or an in-memory store in tests.

use crate::error::{OperatorError, Result};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{
    ConfigMap, ObjectReference, PersistentVolumeClaim, Pod, Secret, Service, ServiceAccount,
};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, Role, RoleBinding};
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::{Client, Resource};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;

/// An object kind the operator is allowed to manage.
///
/// The set is closed: only the kinds listed below implement it.
pub trait ManagedKind:
    Resource<DynamicType = ()> + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Whether objects of this kind live in a namespace. Cluster-scoped
    /// objects cannot carry an owner reference to the spec ConfigMap.
    const NAMESPACED: bool;

    fn api(client: Client, namespace: &str) -> Api<Self>;
}

macro_rules! namespaced_kinds {
    ($($kind:ty),+ $(,)?) => {
        $(
            impl ManagedKind for $kind {
                const NAMESPACED: bool = true;

                fn api(client: Client, namespace: &str) -> Api<Self> {
                    Api::namespaced(client, namespace)
                }
            }
        )+
    };
}

macro_rules! cluster_kinds {
    ($($kind:ty),+ $(,)?) => {
        $(
            impl ManagedKind for $kind {
                const NAMESPACED: bool = false;

                fn api(client: Client, _namespace: &str) -> Api<Self> {
                    Api::all(client)
                }
            }
        )+
    };
}

namespaced_kinds!(
    ConfigMap,
    Deployment,
    PersistentVolumeClaim,
    Role,
    RoleBinding,
    Secret,
    Service,
    ServiceAccount,
    StatefulSet,
);

cluster_kinds!(ClusterRole, ClusterRoleBinding);

/// Cluster operations used by the reconciliation engine and the loops.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetches an object; `Ok(None)` when it does not exist.
    async fn get<K: ManagedKind>(&self, namespace: &str, name: &str) -> Result<Option<K>>;

    async fn create<K: ManagedKind>(&self, namespace: &str, object: &K) -> Result<()>;

    /// Full replace of an existing object.
    async fn replace<K: ManagedKind>(&self, namespace: &str, object: &K) -> Result<()>;

    /// Deletes an object. Returns `Ok(false)` if it was already gone.
    async fn delete<K: ManagedKind>(&self, namespace: &str, name: &str) -> Result<bool>;

    async fn list_pods(&self, namespace: &str, label_selector: &str) -> Result<Vec<Pod>>;

    /// Publishes a normal event against `regarding`.
    async fn publish_event(
        &self,
        regarding: &ObjectReference,
        reason: &str,
        note: &str,
    ) -> Result<()>;
}

/// [`ObjectStore`] backed by the Kubernetes API server.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
    reporter: Reporter,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        let reporter = Reporter {
            controller: crate::annotations::MANAGED_BY.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self { client, reporter }
    }

    pub fn client(&self) -> Client {
        self.client.clone()
    }
}

fn object_name<K: ManagedKind>(object: &K) -> Result<String> {
    object.meta().name.clone().ok_or_else(|| {
        OperatorError::InvalidState(format!("{} object has no name", K::kind(&())))
    })
}

#[async_trait]
impl ObjectStore for KubeStore {
    async fn get<K: ManagedKind>(&self, namespace: &str, name: &str) -> Result<Option<K>> {
        let api = K::api(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn create<K: ManagedKind>(&self, namespace: &str, object: &K) -> Result<()> {
        let api = K::api(self.client.clone(), namespace);
        api.create(&PostParams::default(), object).await?;
        Ok(())
    }

    async fn replace<K: ManagedKind>(&self, namespace: &str, object: &K) -> Result<()> {
        let name = object_name(object)?;
        let api = K::api(self.client.clone(), namespace);
        api.replace(&name, &PostParams::default(), object).await?;
        Ok(())
    }

    async fn delete<K: ManagedKind>(&self, namespace: &str, name: &str) -> Result<bool> {
        let api = K::api(self.client.clone(), namespace);
        match api.delete(name, &DeleteParams::background()).await {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_pods(&self, namespace: &str, label_selector: &str) -> Result<Vec<Pod>> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let list = pods
            .list(&ListParams::default().labels(label_selector))
            .await?;
        Ok(list.items)
    }

    async fn publish_event(
        &self,
        regarding: &ObjectReference,
        reason: &str,
        note: &str,
    ) -> Result<()> {
        let recorder = Recorder::new(
            self.client.clone(),
            self.reporter.clone(),
            regarding.clone(),
        );
        recorder
            .publish(Event {
                type_: EventType::Normal,
                reason: reason.to_string(),
                note: Some(note.to_string()),
                action: "Reconcile".to_string(),
                secondary: None,
            })
            .await?;
        Ok(())
    }
}
