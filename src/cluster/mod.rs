//! Access to the target cluster from the lifecycle processor.

use std::{path::Path, time::Duration};

use async_trait::async_trait;
use kube::{
    config::{KubeConfigOptions, Kubeconfig},
    Client, Config,
};
use serde_json::Value;

use crate::{model::Gvr, resources::ServicePackage, Error, Result};

mod gateway;
pub use gateway::KubeGateway;

#[cfg(test)]
pub(crate) mod fake;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Build a client from an explicit kubeconfig, or from the in-cluster
/// service account when none is given.
pub async fn create_client(kubeconfig: Option<&Path>) -> Result<Client> {
    let mut config = match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                Error::ConfigError(format!("failed to read kubeconfig {}: {e}", path.display()))
            })?;
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(|e| Error::ConfigError(format!("failed to load kubeconfig: {e}")))?
        }
        None => Config::incluster()
            .map_err(|e| Error::ConfigError(format!("failed to load in-cluster config: {e}")))?,
    };
    config.connect_timeout = Some(CONNECT_TIMEOUT);
    config.read_timeout = Some(READ_TIMEOUT);
    Ok(Client::try_from(config)?)
}

/// A custom resource body, either already structured or as YAML/JSON text.
#[derive(Clone, Debug, PartialEq)]
pub enum Payload {
    Object(Value),
    Text(String),
}

impl Payload {
    /// Decode into a JSON object carrying `apiVersion`, `kind` and `metadata.name`.
    pub fn into_object(self) -> Result<Value> {
        let value = match self {
            Payload::Object(value) => value,
            Payload::Text(text) => serde_yaml::from_str::<Value>(&text)?,
        };
        if !value.is_object() {
            return Err(Error::ValidationError("custom resource must be an object".into()));
        }
        for field in ["/apiVersion", "/kind", "/metadata/name"] {
            if value.pointer(field).and_then(Value::as_str).is_none() {
                return Err(Error::ValidationError(format!(
                    "custom resource is missing {}",
                    field.trim_start_matches('/').replace('/', ".")
                )));
            }
        }
        Ok(value)
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        Payload::Object(value)
    }
}

/// Cluster operations the lifecycle processor and facade need.
///
/// Reads of a single object follow one convention: an object that does not
/// exist is `Ok(None)` / `Ok(false)`, every other failure is an error.
#[async_trait]
pub trait ClusterGateway: Send + Sync {
    async fn get_service_package(&self, name: &str, namespace: &str) -> Result<Option<ServicePackage>>;

    async fn create_service_package(&self, package: &ServicePackage) -> Result<ServicePackage>;

    /// Replace the spec of an existing package, keeping its status.
    async fn update_service_package(&self, package: &ServicePackage) -> Result<ServicePackage>;

    /// Delete a package. A package that is already gone is not an error.
    async fn delete_service_package(&self, name: &str, namespace: &str) -> Result<()>;

    async fn custom_resource_exists(&self, gvr: &Gvr, name: &str, namespace: &str) -> Result<bool>;

    async fn deploy_custom_resource(&self, gvr: &Gvr, namespace: &str, payload: Payload) -> Result<()>;

    async fn update_custom_resource(&self, gvr: &Gvr, namespace: &str, payload: Payload) -> Result<()>;

    /// Delete a custom resource. A missing object is reported as a not-found
    /// error so callers can decide whether that counts as success.
    async fn delete_custom_resource(&self, gvr: &Gvr, name: &str, namespace: &str) -> Result<()>;

    /// Whether the namespace exists. Lookup failures count as absent.
    async fn namespace_exists(&self, namespace: &str) -> bool;
}
