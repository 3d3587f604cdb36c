//! In-memory [`ClusterApi`] for reconciler tests.
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt::Debug,
    marker::PhantomData,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use k8s_openapi::{ClusterResourceScope, NamespaceResourceScope};
use kube::{
    api::DynamicObject,
    error::ErrorResponse,
    runtime::events::Event,
    Resource, ResourceExt,
};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;

use crate::{resources::CrdVersion, Error, Result};

use super::{ClusterApi, ManagedKind, ObjectApi};

type Key = (String, String, String);

#[derive(Default)]
struct Objects {
    stored: Mutex<BTreeMap<Key, Value>>,
    failing: Mutex<BTreeSet<String>>,
    failing_reads: Mutex<BTreeSet<String>>,
    events: Mutex<Vec<(String, String)>>,
    git_version: Mutex<String>,
}

#[derive(Clone, Default)]
pub(crate) struct FakeCluster {
    objects: Arc<Objects>,
}

fn api_error(code: u16, reason: &str, message: String) -> Error {
    Error::KubeError(kube::Error::Api(ErrorResponse {
        status: "Failure".into(),
        message,
        reason: reason.into(),
        code,
    }))
}

fn crd_kind(version: CrdVersion) -> String {
    format!("CustomResourceDefinition.{}", version.version())
}

impl FakeCluster {
    pub fn with_git_version(git_version: &str) -> Self {
        let fake = Self::default();
        *fake.objects.git_version.lock().unwrap() = git_version.into();
        fake
    }

    /// Store an object as if somebody else had created it.
    pub fn insert<K: Resource<DynamicType = ()> + Serialize>(&self, object: &K) {
        let key = (
            K::kind(&()).to_string(),
            object.namespace().unwrap_or_default(),
            object.name_any(),
        );
        let value = serde_json::to_value(object).unwrap();
        self.objects.stored.lock().unwrap().insert(key, value);
    }

    pub fn get<K: Resource<DynamicType = ()> + DeserializeOwned>(
        &self,
        namespace: &str,
        name: &str,
    ) -> Option<K> {
        let key = (K::kind(&()).to_string(), namespace.to_string(), name.to_string());
        let stored = self.objects.stored.lock().unwrap();
        stored.get(&key).map(|v| serde_json::from_value(v.clone()).unwrap())
    }

    pub fn all<K: Resource<DynamicType = ()> + DeserializeOwned>(&self) -> Vec<K> {
        let kind = K::kind(&()).to_string();
        let stored = self.objects.stored.lock().unwrap();
        stored
            .iter()
            .filter(|((k, _, _), _)| *k == kind)
            .map(|(_, v)| serde_json::from_value(v.clone()).unwrap())
            .collect()
    }

    pub fn crd(&self, version: CrdVersion, name: &str) -> Option<Value> {
        let key = (crd_kind(version), String::new(), name.to_string());
        self.objects.stored.lock().unwrap().get(&key).cloned()
    }

    /// Make every create and replace of `kind` fail with a server error.
    pub fn fail_kind(&self, kind: &str) {
        self.objects.failing.lock().unwrap().insert(kind.into());
    }

    /// Make every lookup of `kind` fail with a server error.
    pub fn fail_reads(&self, kind: &str) {
        self.objects.failing_reads.lock().unwrap().insert(kind.into());
    }

    /// Published events as `(type, reason)`.
    pub fn events(&self) -> Vec<(String, String)> {
        self.objects.events.lock().unwrap().clone()
    }

    fn api<K>(&self, kind: String, namespace: Option<&str>) -> Box<dyn ObjectApi<K>>
    where
        K: Resource + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        Box::new(FakeApi {
            objects: self.objects.clone(),
            kind,
            namespace: namespace.map(str::to_string),
            _kind: PhantomData,
        })
    }
}

struct FakeApi<K> {
    objects: Arc<Objects>,
    kind: String,
    namespace: Option<String>,
    _kind: PhantomData<fn() -> K>,
}

impl<K: Resource> FakeApi<K> {
    fn key(&self, name: &str) -> Key {
        (
            self.kind.clone(),
            self.namespace.clone().unwrap_or_default(),
            name.to_string(),
        )
    }

    fn check_failure(&self, name: &str) -> Result<()> {
        if self.objects.failing.lock().unwrap().contains(&self.kind) {
            return Err(api_error(500, "InternalError", format!("{} {name} refused", self.kind)));
        }
        Ok(())
    }
}

#[async_trait]
impl<K> ObjectApi<K> for FakeApi<K>
where
    K: Resource + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn list(&self) -> Result<Vec<K>> {
        let stored = self.objects.stored.lock().unwrap();
        stored
            .iter()
            .filter(|((kind, ns, _), _)| {
                *kind == self.kind && self.namespace.as_ref().map_or(true, |want| want == ns)
            })
            .map(|(_, v)| serde_json::from_value(v.clone()).map_err(Error::from))
            .collect()
    }

    async fn get_opt(&self, name: &str) -> Result<Option<K>> {
        if self.objects.failing_reads.lock().unwrap().contains(&self.kind) {
            return Err(api_error(503, "ServiceUnavailable", format!("{} {name} unreadable", self.kind)));
        }
        let stored = self.objects.stored.lock().unwrap();
        match stored.get(&self.key(name)) {
            Some(v) => Ok(Some(serde_json::from_value(v.clone())?)),
            None => Ok(None),
        }
    }

    async fn create(&self, object: &K) -> Result<K> {
        let name = object.name_any();
        self.check_failure(&name)?;
        let mut stored = self.objects.stored.lock().unwrap();
        let key = self.key(&name);
        if stored.contains_key(&key) {
            return Err(api_error(409, "AlreadyExists", format!("{} {name} exists", self.kind)));
        }
        let mut object = object.clone();
        object.meta_mut().resource_version = Some("1".into());
        stored.insert(key, serde_json::to_value(&object)?);
        Ok(object)
    }

    async fn replace(&self, name: &str, object: &K) -> Result<K> {
        self.check_failure(name)?;
        let mut stored = self.objects.stored.lock().unwrap();
        let key = self.key(name);
        let Some(current) = stored.get(&key) else {
            return Err(api_error(404, "NotFound", format!("{} {name} not found", self.kind)));
        };
        let version = current
            .pointer("/metadata/resourceVersion")
            .and_then(Value::as_str)
            .map(str::to_string);
        if object.meta().resource_version != version {
            return Err(api_error(409, "Conflict", format!("{} {name} is stale", self.kind)));
        }
        let next = version.and_then(|v| v.parse::<u64>().ok()).unwrap_or(0) + 1;
        let mut object = object.clone();
        object.meta_mut().resource_version = Some(next.to_string());
        stored.insert(key, serde_json::to_value(&object)?);
        Ok(object)
    }

    async fn delete(&self, name: &str) -> Result<()> {
        self.objects.stored.lock().unwrap().remove(&self.key(name));
        Ok(())
    }

    async fn patch_status(&self, name: &str, patch: &Value) -> Result<K> {
        let mut stored = self.objects.stored.lock().unwrap();
        let Some(current) = stored.get_mut(&self.key(name)) else {
            return Err(api_error(404, "NotFound", format!("{} {name} not found", self.kind)));
        };
        current["status"] = patch["status"].clone();
        Ok(serde_json::from_value(current.clone())?)
    }
}

#[async_trait]
impl ClusterApi for FakeCluster {
    fn namespaced<K>(&self, namespace: &str) -> Box<dyn ObjectApi<K>>
    where
        K: ManagedKind + Resource<Scope = NamespaceResourceScope>,
    {
        self.api(K::kind(&()).to_string(), Some(namespace))
    }

    fn cluster_scoped<K>(&self) -> Box<dyn ObjectApi<K>>
    where
        K: ManagedKind + Resource<Scope = ClusterResourceScope>,
    {
        self.api(K::kind(&()).to_string(), None)
    }

    fn crds(&self, version: CrdVersion) -> Box<dyn ObjectApi<DynamicObject>> {
        self.api(crd_kind(version), None)
    }

    async fn git_version(&self) -> Result<String> {
        Ok(self.objects.git_version.lock().unwrap().clone())
    }

    async fn publish<K>(&self, _object: &K, event: Event) -> Result<()>
    where
        K: Resource<DynamicType = ()> + Sync,
    {
        self.objects
            .events
            .lock()
            .unwrap()
            .push((format!("{:?}", event.type_), event.reason));
        Ok(())
    }
}
