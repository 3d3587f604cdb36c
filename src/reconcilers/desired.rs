use std::collections::BTreeMap;

use k8s_openapi::{
    api::{
        apps::v1::{DaemonSet, Deployment, StatefulSet},
        core::v1::ServiceAccount,
        rbac::v1::{ClusterRole, ClusterRoleBinding, RoleRef, Subject},
    },
    apimachinery::pkg::apis::meta::v1::OwnerReference,
};
use kube::{Resource, ResourceExt};

use crate::{
    resources::{meta, ServiceResources},
    Error, Result,
};

/// Everything a bundle asks for, keyed by object name per kind.
#[derive(Default, Debug)]
pub(crate) struct Desired {
    pub service_accounts: BTreeMap<String, ServiceAccount>,
    pub cluster_roles: BTreeMap<String, ClusterRole>,
    pub cluster_role_bindings: BTreeMap<String, ClusterRoleBinding>,
    pub deployments: BTreeMap<String, Deployment>,
    pub daemon_sets: BTreeMap<String, DaemonSet>,
    pub stateful_sets: BTreeMap<String, StatefulSet>,
}

impl Desired {
    pub fn build(
        package: &str,
        namespace: &str,
        owner: &OwnerReference,
        resources: &ServiceResources,
    ) -> Result<Self> {
        let mut desired = Desired::default();

        for permission in &resources.permissions {
            let account = permission.service_account_name.as_str();
            if account.is_empty() {
                return Err(Error::IllegalServicePackage(
                    "permission without a service account name".into(),
                ));
            }
            let role = format!("{package}-cr-{account}");
            let binding = format!("{package}-crb-{account}");

            desired.service_accounts.insert(
                account.to_string(),
                ServiceAccount {
                    metadata: meta! {
                        owners: vec![owner.clone()],
                        name: Some(account.to_string()),
                        namespace: Some(namespace.to_string())
                    },
                    ..Default::default()
                },
            );
            desired.cluster_roles.insert(
                role.clone(),
                ClusterRole {
                    metadata: meta! { owners: vec![owner.clone()], name: Some(role.clone()) },
                    rules: Some(permission.rules.clone()),
                    aggregation_rule: None,
                },
            );
            desired.cluster_role_bindings.insert(
                binding.clone(),
                ClusterRoleBinding {
                    metadata: meta! { owners: vec![owner.clone()], name: Some(binding) },
                    role_ref: RoleRef {
                        api_group: "rbac.authorization.k8s.io".into(),
                        kind: "ClusterRole".into(),
                        name: role,
                    },
                    subjects: Some(vec![Subject {
                        kind: "ServiceAccount".into(),
                        name: account.to_string(),
                        namespace: Some(namespace.to_string()),
                        api_group: None,
                    }]),
                },
            );
        }

        let workloads = &resources.workloads;
        desired.deployments = owned_by(&workloads.deployments, namespace, owner)?;
        desired.daemon_sets = owned_by(&workloads.daemon_sets, namespace, owner)?;
        desired.stateful_sets = owned_by(&workloads.stateful_sets, namespace, owner)?;
        Ok(desired)
    }
}

/// Bundle workloads placed in `namespace` and owned by `owner`.
fn owned_by<K: Resource<DynamicType = ()> + Clone>(
    objects: &[K],
    namespace: &str,
    owner: &OwnerReference,
) -> Result<BTreeMap<String, K>> {
    let mut keyed = BTreeMap::new();
    for object in objects {
        let mut object = object.clone();
        let name = object.meta().name.clone().ok_or_else(|| {
            Error::IllegalServicePackage(format!("{} without a name", K::kind(&())))
        })?;
        let meta = object.meta_mut();
        meta.namespace = Some(namespace.to_string());
        meta.owner_references = Some(vec![owner.clone()]);
        meta.resource_version = None;
        meta.uid = None;
        keyed.insert(name, object);
    }
    Ok(keyed)
}

/// Copy what the server needs to accept a replace of `existing`.
pub(crate) fn prepare_replace<K: Resource>(desired: &mut K, existing: &K) {
    desired.meta_mut().resource_version = existing.resource_version();
}
