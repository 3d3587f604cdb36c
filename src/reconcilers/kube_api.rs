use std::fmt::Debug;

use async_trait::async_trait;
use k8s_openapi::{ClusterResourceScope, NamespaceResourceScope};
use kube::{
    api::{ApiResource, DeleteParams, DynamicObject, GroupVersionKind, ListParams, Patch, PatchParams, PostParams},
    runtime::events::{Event, Recorder, Reporter},
    Api, Client, Resource,
};
use serde::{de::DeserializeOwned, Serialize};

use crate::{resources::CrdVersion, Error, Result, MANAGER_NAME};

use super::{ClusterApi, ManagedKind, ObjectApi};

#[async_trait]
impl<K> ObjectApi<K> for Api<K>
where
    K: Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn list(&self) -> Result<Vec<K>> {
        Ok(Api::list(self, &ListParams::default()).await?.items)
    }

    async fn get_opt(&self, name: &str) -> Result<Option<K>> {
        Ok(Api::get_opt(self, name).await?)
    }

    async fn create(&self, object: &K) -> Result<K> {
        Ok(Api::create(self, &PostParams::default(), object).await?)
    }

    async fn replace(&self, name: &str, object: &K) -> Result<K> {
        Ok(Api::replace(self, name, &PostParams::default(), object).await?)
    }

    async fn delete(&self, name: &str) -> Result<()> {
        match Api::delete(self, name, &DeleteParams::background()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
            Err(e) => Err(Error::KubeError(e)),
        }
    }

    async fn patch_status(&self, name: &str, patch: &serde_json::Value) -> Result<K> {
        let params = PatchParams::apply(MANAGER_NAME).force();
        Ok(Api::patch_status(self, name, &params, &Patch::Apply(patch)).await?)
    }
}

/// [`ClusterApi`] backed by a kube client.
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
    reporter: Reporter,
}

impl KubeCluster {
    pub fn new(client: Client, reporter: Reporter) -> Self {
        Self { client, reporter }
    }
}

#[async_trait]
impl ClusterApi for KubeCluster {
    fn namespaced<K>(&self, namespace: &str) -> Box<dyn ObjectApi<K>>
    where
        K: ManagedKind + Resource<Scope = NamespaceResourceScope>,
    {
        Box::new(Api::<K>::namespaced(self.client.clone(), namespace))
    }

    fn cluster_scoped<K>(&self) -> Box<dyn ObjectApi<K>>
    where
        K: ManagedKind + Resource<Scope = ClusterResourceScope>,
    {
        Box::new(Api::<K>::all(self.client.clone()))
    }

    fn crds(&self, version: CrdVersion) -> Box<dyn ObjectApi<DynamicObject>> {
        let gvk = GroupVersionKind::gvk(CrdVersion::GROUP, version.version(), "CustomResourceDefinition");
        let resource = ApiResource::from_gvk_with_plural(&gvk, "customresourcedefinitions");
        Box::new(Api::<DynamicObject>::all_with(self.client.clone(), &resource))
    }

    async fn git_version(&self) -> Result<String> {
        Ok(self.client.apiserver_version().await?.git_version)
    }

    async fn publish<K>(&self, object: &K, event: Event) -> Result<()>
    where
        K: Resource<DynamicType = ()> + Sync,
    {
        let recorder = Recorder::new(self.client.clone(), self.reporter.clone(), object.object_ref(&()));
        Ok(recorder.publish(event).await?)
    }
}
