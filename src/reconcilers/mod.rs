use std::{fmt::Debug, sync::Arc};

use async_trait::async_trait;
use k8s_openapi::{
    apimachinery::pkg::apis::meta::v1::OwnerReference, ClusterResourceScope,
    NamespaceResourceScope,
};
use kube::{
    api::DynamicObject,
    runtime::{controller::Action, events::Event},
    CustomResourceExt, Resource, ResourceExt,
};
use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::RwLock;

use crate::{operator::Diagnostics, resources::CrdVersion, Metrics, Result};

mod crds;
mod desired;
mod kube_api;
mod owned;
mod runtime;
mod service_package;
mod status;
#[cfg(test)]
pub(crate) mod testing;

pub use crds::CrdGate;
pub use kube_api::KubeCluster;

/// The context passed around
pub struct Context<C> {
    /// Access to the cluster
    pub cluster: C,

    /// Diagnostics read by the web server
    pub diagnostics: Arc<RwLock<Diagnostics>>,

    /// Prometheus metrics
    pub metrics: Metrics,

    /// Which CRD schema variants the cluster accepts
    pub crd_gate: CrdGate,
}

/// A resource that can be reconciled by a controller
#[async_trait]
pub(crate) trait Reconcile
where
    Self: CustomResourceExt + ResourceExt,
{
    /// Attempt to reconcile a resource
    async fn reconcile<C: ClusterApi>(&self, context: Arc<Context<C>>) -> Result<Action>;

    /// Attempt to deploy all necessary sub-resources for this CRD.
    async fn deploy_resources<C: ClusterApi>(&self, context: Arc<Context<C>>) -> Result<()>;
}

/// The handful of calls the reconcilers make against one kind of object.
#[async_trait]
pub trait ObjectApi<K>: Send + Sync {
    async fn list(&self) -> Result<Vec<K>>;

    async fn get_opt(&self, name: &str) -> Result<Option<K>>;

    async fn create(&self, object: &K) -> Result<K>;

    async fn replace(&self, name: &str, object: &K) -> Result<K>;

    /// Delete by name. A missing object is not an error.
    async fn delete(&self, name: &str) -> Result<()>;

    /// Server-side apply of a status patch body.
    async fn patch_status(&self, name: &str, patch: &serde_json::Value) -> Result<K>;
}

/// Kinds the reconcilers can read and write.
pub trait ManagedKind:
    Resource<DynamicType = ()> + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

impl<K> ManagedKind for K where
    K: Resource<DynamicType = ()> + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

/// Hands out object handles and publishes events.
#[async_trait]
pub trait ClusterApi: Send + Sync + 'static {
    fn namespaced<K>(&self, namespace: &str) -> Box<dyn ObjectApi<K>>
    where
        K: ManagedKind + Resource<Scope = NamespaceResourceScope>;

    fn cluster_scoped<K>(&self) -> Box<dyn ObjectApi<K>>
    where
        K: ManagedKind + Resource<Scope = ClusterResourceScope>;

    /// Raw custom resource definitions of one schema variant.
    fn crds(&self, version: CrdVersion) -> Box<dyn ObjectApi<DynamicObject>>;

    /// `GitVersion` of the API server.
    async fn git_version(&self) -> Result<String>;

    async fn publish<K>(&self, object: &K, event: Event) -> Result<()>
    where
        K: Resource<DynamicType = ()> + Sync;
}

/// Whether `object` carries an owner reference naming `owner`.
pub(crate) fn is_owned_by<K: Resource>(object: &K, owner: &OwnerReference) -> bool {
    object.owner_references().iter().any(|r| {
        r.kind == owner.kind && r.api_version == owner.api_version && r.name == owner.name
    })
}
