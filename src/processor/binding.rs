use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use kube::core::ObjectMeta;
use tracing::info;

use crate::{
    cluster::ClusterGateway,
    model::{LifecycleStatus, ServiceBinding},
    resources::{resources_to_base64, PackagePhase, ServicePackage, ServicePackageSpec},
    store::Store,
    Result, SYSTEM_NAMESPACE,
};

use super::{deadline_in, Flow, LifecycleHandler};

/// Step deadline of every binding phase.
pub const BINDING_DEADLINE: Duration = Duration::from_secs(3 * 60);

/// Installs, upgrades and removes the `ServicePackage` of a binding.
pub struct BindingHandler {
    store: Arc<Store>,
    cluster: Arc<dyn ClusterGateway>,
}

impl BindingHandler {
    pub fn new(store: Arc<Store>, cluster: Arc<dyn ClusterGateway>) -> Self {
        Self { store, cluster }
    }

    async fn start_deadline(&self, binding: &mut ServiceBinding) -> Result<()> {
        if binding.process_time == 0 {
            self.store
                .set_binding_process_time(binding, deadline_in(BINDING_DEADLINE))
                .await?;
        }
        Ok(())
    }

    /// Bring the cluster package in line with the binding and wait for it to run.
    async fn converge(&self, binding: &mut ServiceBinding) -> Result<Flow> {
        self.start_deadline(binding).await?;

        let desired = package_for(binding)?;
        let Some(package) = self
            .cluster
            .get_service_package(&binding.name, SYSTEM_NAMESPACE)
            .await?
        else {
            self.cluster.create_service_package(&desired).await?;
            info!(r#"Created ServicePackage for binding "{}""#, binding.name);
            return Ok(Flow::requeue("service package created"));
        };

        if package.spec.version != desired.spec.version
            || package.spec.resources != desired.spec.resources
        {
            self.cluster.update_service_package(&desired).await?;
            info!(
                r#"Updated ServicePackage "{}" to version {}"#,
                binding.name, binding.version
            );
            return Ok(Flow::requeue("service package updated"));
        }

        match package.phase() {
            PackagePhase::Running if package.current_version() == binding.version => {
                self.store
                    .update_binding_status_msg(binding, LifecycleStatus::Succeeded, "")
                    .await?;
                Ok(Flow::Next)
            }
            phase => {
                let reason = package
                    .status
                    .as_ref()
                    .map(|s| s.reason.as_str())
                    .filter(|r| !r.is_empty())
                    .map(|r| format!("service package is {phase}: {r}"))
                    .unwrap_or_else(|| format!("service package is {phase}"));
                Ok(Flow::requeue(reason))
            }
        }
    }
}

#[async_trait]
impl LifecycleHandler<ServiceBinding> for BindingHandler {
    async fn install(&self, binding: &mut ServiceBinding) -> Result<Flow> {
        self.converge(binding).await
    }

    async fn upgrade(&self, binding: &mut ServiceBinding) -> Result<Flow> {
        self.converge(binding).await
    }

    async fn delete(&self, binding: &mut ServiceBinding) -> Result<Flow> {
        self.start_deadline(binding).await?;

        let remaining = self.store.count_instances(&binding.id).await?;
        if remaining > 0 {
            return Ok(Flow::requeue(format!("{remaining} instances still exist")));
        }

        let Some(mut package) = self
            .cluster
            .get_service_package(&binding.name, SYSTEM_NAMESPACE)
            .await?
        else {
            self.store.delete_binding(binding).await?;
            info!(r#"Removed binding "{}""#, binding.name);
            return Ok(Flow::Next);
        };

        if !package.spec.version.is_empty() {
            package.spec.version.clear();
            self.cluster.update_service_package(&package).await?;
            return Ok(Flow::requeue("waiting for owned resources to be removed"));
        }

        match package.phase() {
            PackagePhase::Deleted => {
                self.cluster
                    .delete_service_package(&binding.name, SYSTEM_NAMESPACE)
                    .await?;
                self.store.delete_binding(binding).await?;
                info!(r#"Removed binding "{}" and its ServicePackage"#, binding.name);
                Ok(Flow::Next)
            }
            phase => Ok(Flow::requeue(format!("service package is {phase}"))),
        }
    }
}

/// The `ServicePackage` a binding asks for.
pub fn package_for(binding: &ServiceBinding) -> Result<ServicePackage> {
    Ok(ServicePackage {
        metadata: ObjectMeta {
            name: Some(binding.name.clone()),
            namespace: Some(SYSTEM_NAMESPACE.into()),
            ..Default::default()
        },
        spec: ServicePackageSpec {
            service_id: binding.service_id.clone(),
            name: binding.service_name.clone(),
            version: binding.version.clone(),
            resources: resources_to_base64(&binding.service_resources())?,
            raw_resources: None,
        },
        status: None,
    })
}
