use async_trait::async_trait;
use k8s_openapi::api::core::v1::Namespace;
use kube::{
    api::{DeleteParams, DynamicObject, PostParams},
    discovery::ApiResource,
    Api, Client, ResourceExt,
};
use serde_json::Value;
use tracing::{info, warn};

use crate::{model::Gvr, resources::ServicePackage, Error, Result};

use super::{ClusterGateway, Payload};

/// Gateway backed by a live API server.
#[derive(Clone)]
pub struct KubeGateway {
    client: Client,
}

impl KubeGateway {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn packages(&self, namespace: &str) -> Api<ServicePackage> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn dynamic(&self, gvr: &Gvr, kind: &str, namespace: &str) -> Api<DynamicObject> {
        let resource = ApiResource {
            group: gvr.group.clone(),
            version: gvr.version.clone(),
            api_version: gvr.api_version(),
            kind: kind.to_string(),
            plural: gvr.resource.clone(),
        };
        Api::namespaced_with(self.client.clone(), namespace, &resource)
    }

    fn dynamic_object(value: Value) -> Result<(String, DynamicObject)> {
        let kind = value
            .get("kind")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let object: DynamicObject = serde_json::from_value(value)?;
        Ok((kind, object))
    }
}

/// Report a failed cluster write as the operation it broke. A missing object
/// keeps its kube form so callers can still tell it apart.
fn write_error(wrap: fn(String) -> Error) -> impl Fn(kube::Error) -> Error {
    move |e| {
        if matches!(&e, kube::Error::Api(response) if response.code == 404) {
            Error::KubeError(e)
        } else {
            wrap(e.to_string())
        }
    }
}

#[async_trait]
impl ClusterGateway for KubeGateway {
    async fn get_service_package(&self, name: &str, namespace: &str) -> Result<Option<ServicePackage>> {
        Ok(self.packages(namespace).get_opt(name).await?)
    }

    async fn create_service_package(&self, package: &ServicePackage) -> Result<ServicePackage> {
        let namespace = package.namespace().unwrap_or_else(|| crate::SYSTEM_NAMESPACE.into());
        let created = self
            .packages(&namespace)
            .create(&PostParams::default(), package)
            .await
            .map_err(write_error(Error::ServiceInstallError))?;
        info!(r#"Created ServicePackage "{namespace}/{}""#, created.name_any());
        Ok(created)
    }

    async fn update_service_package(&self, package: &ServicePackage) -> Result<ServicePackage> {
        let namespace = package.namespace().unwrap_or_else(|| crate::SYSTEM_NAMESPACE.into());
        let api = self.packages(&namespace);
        let name = package.name_any();

        // Carry the live resourceVersion and status over so only the spec changes
        let mut live = api
            .get(&name)
            .await
            .map_err(write_error(Error::ServiceInstallError))?;
        live.spec = package.spec.clone();
        api.replace(&name, &PostParams::default(), &live)
            .await
            .map_err(write_error(Error::ServiceInstallError))
    }

    async fn delete_service_package(&self, name: &str, namespace: &str) -> Result<()> {
        match self.packages(namespace).delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
            Err(e) => Err(Error::ServiceDeleteError(e.to_string())),
        }
    }

    async fn custom_resource_exists(&self, gvr: &Gvr, name: &str, namespace: &str) -> Result<bool> {
        let found = self.dynamic(gvr, "", namespace).get_opt(name).await?;
        Ok(found.is_some())
    }

    async fn deploy_custom_resource(&self, gvr: &Gvr, namespace: &str, payload: Payload) -> Result<()> {
        let (kind, object) = Self::dynamic_object(payload.into_object()?)?;
        self.dynamic(gvr, &kind, namespace)
            .create(&PostParams::default(), &object)
            .await
            .map_err(write_error(Error::InstanceCreateError))?;
        info!(r#"Deployed {kind} "{namespace}/{}""#, object.name_any());
        Ok(())
    }

    async fn update_custom_resource(&self, gvr: &Gvr, namespace: &str, payload: Payload) -> Result<()> {
        let (kind, mut object) = Self::dynamic_object(payload.into_object()?)?;
        let api = self.dynamic(gvr, &kind, namespace);
        let name = object.name_any();

        let live = api
            .get(&name)
            .await
            .map_err(write_error(Error::InstanceCreateError))?;
        object.metadata.resource_version = live.metadata.resource_version;
        api.replace(&name, &PostParams::default(), &object)
            .await
            .map_err(write_error(Error::InstanceCreateError))?;
        Ok(())
    }

    async fn delete_custom_resource(&self, gvr: &Gvr, name: &str, namespace: &str) -> Result<()> {
        self.dynamic(gvr, "", namespace)
            .delete(name, &DeleteParams::default())
            .await
            .map_err(write_error(Error::ServiceDeleteError))?;
        Ok(())
    }

    async fn namespace_exists(&self, namespace: &str) -> bool {
        let namespaces: Api<Namespace> = Api::all(self.client.clone());
        match namespaces.get_opt(namespace).await {
            Ok(found) => found.is_some(),
            Err(e) => {
                warn!("namespace {namespace} lookup failed, treating it as absent: {e}");
                false
            }
        }
    }
}
