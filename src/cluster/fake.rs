use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Mutex,
};

use async_trait::async_trait;
use kube::ResourceExt;
use serde_json::Value;

use crate::{
    model::Gvr,
    resources::{PackagePhase, ServicePackage, ServicePackageStatus},
    Error, Result,
};

use super::{ClusterGateway, Payload};

/// In-memory cluster for processor and facade tests.
#[derive(Default)]
pub struct FakeGateway {
    packages: Mutex<BTreeMap<(String, String), ServicePackage>>,
    resources: Mutex<BTreeMap<(String, String, String), Value>>,
    namespaces: Mutex<BTreeSet<String>>,
    failure: Mutex<Option<String>>,
}

impl FakeGateway {
    pub fn with_namespaces(namespaces: &[&str]) -> Self {
        let fake = Self::default();
        fake.namespaces
            .lock()
            .unwrap()
            .extend(namespaces.iter().map(|ns| ns.to_string()));
        fake
    }

    pub fn package(&self, name: &str) -> Option<ServicePackage> {
        self.packages
            .lock()
            .unwrap()
            .get(&(crate::SYSTEM_NAMESPACE.to_string(), name.to_string()))
            .cloned()
    }

    pub fn insert_package(&self, package: ServicePackage) {
        let key = (
            package.namespace().unwrap_or_else(|| crate::SYSTEM_NAMESPACE.into()),
            package.name_any(),
        );
        self.packages.lock().unwrap().insert(key, package);
    }

    /// Stand in for the reconciler writing status.
    pub fn set_status(&self, name: &str, phase: PackagePhase, current_version: &str) {
        let mut packages = self.packages.lock().unwrap();
        if let Some(package) = packages.get_mut(&(crate::SYSTEM_NAMESPACE.to_string(), name.to_string())) {
            package.status = Some(ServicePackageStatus {
                phase,
                current_version: current_version.into(),
                ..Default::default()
            });
        }
    }

    pub fn custom_resource(&self, gvr: &Gvr, namespace: &str, name: &str) -> Option<Value> {
        self.resources
            .lock()
            .unwrap()
            .get(&(gvr.to_string(), namespace.to_string(), name.to_string()))
            .cloned()
    }

    /// Make every custom resource call fail with a transient error.
    pub fn fail_custom_resources(&self, message: Option<&str>) {
        *self.failure.lock().unwrap() = message.map(str::to_string);
    }

    /// The configured failure, shaped the way the live gateway reports it.
    fn check_failure(&self, wrap: fn(String) -> Error) -> Result<()> {
        match self.failure.lock().unwrap().as_ref() {
            Some(message) => Err(wrap(message.clone())),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl ClusterGateway for FakeGateway {
    async fn get_service_package(&self, name: &str, namespace: &str) -> Result<Option<ServicePackage>> {
        Ok(self
            .packages
            .lock()
            .unwrap()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn create_service_package(&self, package: &ServicePackage) -> Result<ServicePackage> {
        let key = (
            package.namespace().unwrap_or_else(|| crate::SYSTEM_NAMESPACE.into()),
            package.name_any(),
        );
        let mut packages = self.packages.lock().unwrap();
        if packages.contains_key(&key) {
            return Err(Error::ServiceInstallError(format!("{} already exists", key.1)));
        }
        packages.insert(key, package.clone());
        Ok(package.clone())
    }

    async fn update_service_package(&self, package: &ServicePackage) -> Result<ServicePackage> {
        let key = (
            package.namespace().unwrap_or_else(|| crate::SYSTEM_NAMESPACE.into()),
            package.name_any(),
        );
        let mut packages = self.packages.lock().unwrap();
        let live = packages
            .get_mut(&key)
            .ok_or_else(|| Error::NotFound(format!("service package {}", key.1)))?;
        live.spec = package.spec.clone();
        Ok(live.clone())
    }

    async fn delete_service_package(&self, name: &str, namespace: &str) -> Result<()> {
        self.packages
            .lock()
            .unwrap()
            .remove(&(namespace.to_string(), name.to_string()));
        Ok(())
    }

    async fn custom_resource_exists(&self, gvr: &Gvr, name: &str, namespace: &str) -> Result<bool> {
        self.check_failure(unavailable)?;
        Ok(self.custom_resource(gvr, namespace, name).is_some())
    }

    async fn deploy_custom_resource(&self, gvr: &Gvr, namespace: &str, payload: Payload) -> Result<()> {
        self.check_failure(Error::InstanceCreateError)?;
        let object = payload.into_object()?;
        let name = object["metadata"]["name"].as_str().unwrap_or_default().to_string();
        let key = (gvr.to_string(), namespace.to_string(), name.clone());
        let mut resources = self.resources.lock().unwrap();
        if resources.contains_key(&key) {
            return Err(Error::InstanceCreateError(format!("{name} already exists")));
        }
        resources.insert(key, object);
        Ok(())
    }

    async fn update_custom_resource(&self, gvr: &Gvr, namespace: &str, payload: Payload) -> Result<()> {
        self.check_failure(Error::InstanceCreateError)?;
        let object = payload.into_object()?;
        let name = object["metadata"]["name"].as_str().unwrap_or_default().to_string();
        let key = (gvr.to_string(), namespace.to_string(), name.clone());
        let mut resources = self.resources.lock().unwrap();
        match resources.get_mut(&key) {
            Some(live) => {
                *live = object;
                Ok(())
            }
            None => Err(Error::NotFound(name)),
        }
    }

    async fn delete_custom_resource(&self, gvr: &Gvr, name: &str, namespace: &str) -> Result<()> {
        self.check_failure(Error::ServiceDeleteError)?;
        self.resources
            .lock()
            .unwrap()
            .remove(&(gvr.to_string(), namespace.to_string(), name.to_string()))
            .map(|_| ())
            .ok_or_else(|| Error::NotFound(format!("{gvr} {namespace}/{name}")))
    }

    async fn namespace_exists(&self, namespace: &str) -> bool {
        self.namespaces.lock().unwrap().contains(namespace)
    }
}

/// A read the API server could not answer.
fn unavailable(message: String) -> Error {
    Error::KubeError(kube::Error::Api(kube::error::ErrorResponse {
        status: "Failure".into(),
        message,
        reason: "ServiceUnavailable".into(),
        code: 503,
    }))
}
