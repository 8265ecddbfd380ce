//! In-memory [`ObjectStore`] used by unit tests.

use crate::annotations::MANAGED_ANNOTATION;
use crate::error::{OperatorError, Result};
use crate::store::{ManagedKind, ObjectStore};
use async_trait::async_trait;
use kube::Resource;
use k8s_openapi::api::core::v1::{ConfigMap, ObjectReference, Pod, PodCondition, PodStatus};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Create(String, String),
    Replace(String, String),
    Delete(String, String),
}

type Key = (String, String, String);

#[derive(Default)]
pub struct FakeStore {
    objects: Mutex<BTreeMap<Key, serde_json::Value>>,
    calls: Mutex<Vec<Call>>,
    failures: Mutex<HashSet<(String, String)>>,
    pod_lists: Mutex<VecDeque<Result<Vec<Pod>>>>,
    pod_probes: Mutex<usize>,
    events: Mutex<Vec<(String, String)>>,
}

impl FakeStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn key<K: ManagedKind>(namespace: &str, name: &str) -> Key {
        let namespace = if K::NAMESPACED { namespace } else { "" };
        (
            K::kind(&()).to_string(),
            namespace.to_string(),
            name.to_string(),
        )
    }

    /// Seeds an object without recording a call.
    pub fn insert<K: ManagedKind>(&self, namespace: &str, object: &K) {
        let name = object.meta().name.clone().unwrap_or_default();
        self.objects.lock().unwrap().insert(
            Self::key::<K>(namespace, &name),
            serde_json::to_value(object).unwrap(),
        );
    }

    pub fn object<K: ManagedKind>(&self, namespace: &str, name: &str) -> Option<K> {
        self.objects
            .lock()
            .unwrap()
            .get(&Self::key::<K>(namespace, name))
            .map(|v| serde_json::from_value(v.clone()).unwrap())
    }

    /// Makes every mutating call against `kind`/`name` fail.
    pub fn fail_on(&self, kind: &str, name: &str) {
        self.failures
            .lock()
            .unwrap()
            .insert((kind.to_string(), name.to_string()));
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
    }

    pub fn mutations_of(&self, kind: &str, name: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| match c {
                Call::Create(k, n) | Call::Replace(k, n) | Call::Delete(k, n) => {
                    k == kind && n == name
                }
            })
            .count()
    }

    pub fn events(&self) -> Vec<(String, String)> {
        self.events.lock().unwrap().clone()
    }

    /// Queues the result of the next `list_pods` call. Once the queue is
    /// drained, `list_pods` returns an empty list.
    pub fn push_pods(&self, pods: Result<Vec<Pod>>) {
        self.pod_lists.lock().unwrap().push_back(pods);
    }

    pub fn pod_probes(&self) -> usize {
        *self.pod_probes.lock().unwrap()
    }

    fn check_failure<K: ManagedKind>(&self, name: &str) -> Result<()> {
        let kind = K::kind(&()).to_string();
        if self
            .failures
            .lock()
            .unwrap()
            .contains(&(kind.clone(), name.to_string()))
        {
            return Err(OperatorError::KubeApi(format!(
                "injected failure for {}/{}",
                kind, name
            )));
        }
        Ok(())
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl ObjectStore for FakeStore {
    async fn get<K: ManagedKind>(&self, namespace: &str, name: &str) -> Result<Option<K>> {
        Ok(self.object(namespace, name))
    }

    async fn create<K: ManagedKind>(&self, namespace: &str, object: &K) -> Result<()> {
        let name = object.meta().name.clone().unwrap_or_default();
        self.check_failure::<K>(&name)?;
        let key = Self::key::<K>(namespace, &name);
        let mut objects = self.objects.lock().unwrap();
        if objects.contains_key(&key) {
            return Err(OperatorError::KubeApi(format!("{} already exists", name)));
        }
        objects.insert(key, serde_json::to_value(object)?);
        drop(objects);
        self.record(Call::Create(K::kind(&()).to_string(), name));
        Ok(())
    }

    async fn replace<K: ManagedKind>(&self, namespace: &str, object: &K) -> Result<()> {
        let name = object.meta().name.clone().unwrap_or_default();
        self.check_failure::<K>(&name)?;
        let key = Self::key::<K>(namespace, &name);
        let mut objects = self.objects.lock().unwrap();
        if !objects.contains_key(&key) {
            return Err(OperatorError::KubeApi(format!("{} not found", name)));
        }
        objects.insert(key, serde_json::to_value(object)?);
        drop(objects);
        self.record(Call::Replace(K::kind(&()).to_string(), name));
        Ok(())
    }

    async fn delete<K: ManagedKind>(&self, namespace: &str, name: &str) -> Result<bool> {
        self.check_failure::<K>(name)?;
        let removed = self
            .objects
            .lock()
            .unwrap()
            .remove(&Self::key::<K>(namespace, name))
            .is_some();
        if removed {
            self.record(Call::Delete(K::kind(&()).to_string(), name.to_string()));
        }
        Ok(removed)
    }

    async fn list_pods(&self, _namespace: &str, _label_selector: &str) -> Result<Vec<Pod>> {
        *self.pod_probes.lock().unwrap() += 1;
        self.pod_lists
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(Vec::new()))
    }

    async fn publish_event(
        &self,
        _regarding: &ObjectReference,
        reason: &str,
        note: &str,
    ) -> Result<()> {
        self.events
            .lock()
            .unwrap()
            .push((reason.to_string(), note.to_string()));
        Ok(())
    }
}

pub const NAMESPACE: &str = "sourcegraph";
pub const OWNER_UID: &str = "4c7d3c1e-0000-4000-8000-000000000001";

/// The spec ConfigMap that owns everything in tests.
pub fn owner_config_map() -> ConfigMap {
    ConfigMap {
        metadata: ObjectMeta {
            name: Some("sourcegraph-appliance".to_string()),
            namespace: Some(NAMESPACE.to_string()),
            uid: Some(OWNER_UID.to_string()),
            annotations: Some(BTreeMap::from([(
                MANAGED_ANNOTATION.to_string(),
                "true".to_string(),
            )])),
            ..Default::default()
        },
        ..Default::default()
    }
}

pub fn pod(name: &str, ready: bool) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(NAMESPACE.to_string()),
            ..Default::default()
        },
        status: Some(PodStatus {
            conditions: Some(vec![PodCondition {
                type_: "Ready".to_string(),
                status: if ready { "True" } else { "False" }.to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}
