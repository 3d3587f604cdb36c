use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use k8s_openapi::{
    api::{
        apps::v1::{DaemonSet, Deployment, StatefulSet},
        core::v1::ServiceAccount,
        rbac::v1::{ClusterRole, ClusterRoleBinding},
    },
    apimachinery::pkg::apis::meta::v1::OwnerReference,
};
use kube::{
    runtime::{
        controller::Action,
        events::{Event, EventType},
    },
    Resource, ResourceExt,
};
use tokio::try_join;
use tracing::{info, warn};

use crate::{
    resources::{base64_to_resources, PackagePhase, ServicePackage, ServicePackageStatus},
    Error, Result, SYSTEM_NAMESPACE,
};

use super::{
    crds,
    desired::Desired,
    owned::{converge, remove_all},
    runtime,
    status::{after_reconcile, after_runtime_check, same_status, status_patch, verify_status},
    ClusterApi, Context, ObjectApi, Reconcile,
};

#[async_trait]
impl Reconcile for ServicePackage {
    async fn reconcile<C: ClusterApi>(&self, context: Arc<Context<C>>) -> Result<Action> {
        let name = self.name_any();
        let namespace = self.namespace().unwrap_or_default();
        if namespace != SYSTEM_NAMESPACE {
            warn!(r#"Ignoring ServicePackage "{namespace}/{name}" outside {SYSTEM_NAMESPACE}"#);
            return Ok(Action::await_change());
        }

        // Work on the latest copy, the watch event may be stale
        let packages = context.cluster.namespaced::<ServicePackage>(&namespace);
        let Some(mut package) = packages.get_opt(&name).await? else {
            return Ok(Action::await_change());
        };
        if package.phase() == PackagePhase::Deleted {
            return Ok(Action::requeue(Duration::from_secs(60 * 60)));
        }

        if let Some(status) = verify_status(&package) {
            package = write_status(&*context, &*packages, &package, status).await?;
        }

        let result = package.deploy_resources(context.clone()).await;
        let before = package.status.clone().unwrap_or_default();
        let mut next = after_reconcile(&before, &package.spec.version, result.as_ref().err());

        if result.is_ok() && !before.phase.is_converging() {
            let bundle = base64_to_resources(&package.spec.resources)?;
            let health = runtime::check(&context.cluster, &namespace, &bundle.workloads).await?;
            next = after_runtime_check(&before, health.phase, &health.reasons);
        }

        if !same_status(&before, &next) {
            package = write_status(&*context, &*packages, &package, next).await?;
        }
        result?;

        Ok(Action::requeue(requeue_after(package.phase())))
    }

    async fn deploy_resources<C: ClusterApi>(&self, context: Arc<Context<C>>) -> Result<()> {
        let name = self.name_any();
        let namespace = self.namespace().unwrap_or_default();
        let owner = owner_reference(self)?;
        let cluster = &context.cluster;

        let service_accounts = cluster.namespaced::<ServiceAccount>(&namespace);
        let cluster_roles = cluster.cluster_scoped::<ClusterRole>();
        let cluster_role_bindings = cluster.cluster_scoped::<ClusterRoleBinding>();
        let deployments = cluster.namespaced::<Deployment>(&namespace);
        let daemon_sets = cluster.namespaced::<DaemonSet>(&namespace);
        let stateful_sets = cluster.namespaced::<StatefulSet>(&namespace);

        if self.phase().is_deleting() {
            info!(r#"Removing resources owned by "{namespace}/{name}""#);
            try_join!(
                remove_all(&*deployments, &owner),
                remove_all(&*daemon_sets, &owner),
                remove_all(&*stateful_sets, &owner),
            )?;
            remove_all(&*cluster_role_bindings, &owner).await?;
            try_join!(
                remove_all(&*cluster_roles, &owner),
                remove_all(&*service_accounts, &owner),
            )?;
            return Ok(());
        }

        let bundle = base64_to_resources(&self.spec.resources)?;
        let desired = Desired::build(&name, &namespace, &owner, &bundle)?;
        let upgrading = self.phase() == PackagePhase::Upgrading;
        info!(r#"Deploying resources of "{namespace}/{name}" version {}"#, self.spec.version);

        // Independent of each other, so created at once
        try_join!(
            converge(&*service_accounts, &owner, desired.service_accounts, upgrading),
            converge(&*cluster_roles, &owner, desired.cluster_roles, upgrading),
            crds::deploy(cluster, context.crd_gate, &bundle.crds),
        )?;
        converge(
            &*cluster_role_bindings,
            &owner,
            desired.cluster_role_bindings,
            upgrading,
        )
        .await?;

        // Now the workloads that run with the above
        try_join!(
            converge(&*deployments, &owner, desired.deployments, upgrading),
            converge(&*daemon_sets, &owner, desired.daemon_sets, upgrading),
            converge(&*stateful_sets, &owner, desired.stateful_sets, upgrading),
        )?;
        Ok(())
    }
}

fn owner_reference(package: &ServicePackage) -> Result<OwnerReference> {
    package.controller_owner_ref(&()).ok_or_else(|| {
        Error::IllegalServicePackage(format!("{} has no uid yet", package.name_any()))
    })
}

fn requeue_after(phase: PackagePhase) -> Duration {
    match phase {
        PackagePhase::Running => Duration::from_secs(5 * 60),
        PackagePhase::Deleted => Duration::from_secs(60 * 60),
        PackagePhase::Failed | PackagePhase::Unknown => Duration::from_secs(30),
        _ => Duration::from_secs(2),
    }
}

/// Persist `status` and announce phase changes as events.
async fn write_status<C: ClusterApi>(
    context: &Context<C>,
    packages: &dyn ObjectApi<ServicePackage>,
    package: &ServicePackage,
    status: ServicePackageStatus,
) -> Result<ServicePackage> {
    let previous = package.status.as_ref().map(|s| s.phase);
    let updated = packages
        .patch_status(&package.name_any(), &status_patch(&status))
        .await?;

    let event = if status.phase == PackagePhase::Failed {
        Some(Event {
            type_: EventType::Warning,
            reason: "ReconcileFailed".into(),
            note: Some(status.reason.clone()),
            action: "Reconciling".into(),
            secondary: None,
        })
    } else if previous != Some(status.phase) {
        Some(Event {
            type_: EventType::Normal,
            reason: status.phase.to_string(),
            note: Some(status.reason.clone()),
            action: "Reconciling".into(),
            secondary: None,
        })
    } else {
        None
    };
    if let Some(event) = event {
        if let Err(e) = context.cluster.publish(&updated, event).await {
            warn!("cannot publish event for {}: {e}", updated.name_any());
        }
    }
    Ok(updated)
}
