//! Synchronous operations behind the HTTP API.
//!
//! Every write lands in the database first and is then announced on the
//! [`EventBus`]; the processors do the cluster work asynchronously.
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::{
    cluster::ClusterGateway,
    event::{EventBus, EventOp, BINDING_CHANNEL, INSTANCE_CHANNEL},
    model::{Instance, LifecycleStatus, ResourceRecord, ServiceBinding},
    processor::Repository,
    resources::{Permission, Workloads},
    store::{Filter, Store},
    Error, Result, DEFAULT_CLUSTER, SYSTEM_NAMESPACE,
};

mod phase;
pub use phase::{aggregate_phase, AggregatePhase, ResourceState};

const MAX_LABEL_LEN: usize = 63;
const MAX_SUBDOMAIN_LEN: usize = 253;

/// Body of an install or upgrade request.
#[derive(Deserialize, Serialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct InstallRequest {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub service_id: Option<String>,
    #[serde(default)]
    pub cluster_name: Option<String>,
    #[serde(default)]
    pub workloads: Workloads,
    #[serde(default)]
    pub permissions: Vec<Permission>,
    #[serde(default)]
    pub crds: Vec<Value>,
    #[serde(default)]
    pub capability_plugin: Option<Value>,
}

/// Identity returned by install.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct BindingRef {
    pub name: String,
    pub id: String,
}

#[derive(Serialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct BindingView {
    #[serde(flatten)]
    pub binding: ServiceBinding,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aggregate: Option<AggregatePhase>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resources: Option<Vec<ResourceRecord>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instances: Option<Vec<Instance>>,
}

#[derive(Serialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct InstanceView {
    #[serde(flatten)]
    pub instance: Instance,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aggregate: Option<AggregatePhase>,
}

/// Entry point for binding and instance operations.
pub struct ResourceFacade {
    store: Arc<Store>,
    cluster: Arc<dyn ClusterGateway>,
    bus: Arc<EventBus>,
}

impl ResourceFacade {
    pub fn new(store: Arc<Store>, cluster: Arc<dyn ClusterGateway>, bus: Arc<EventBus>) -> Self {
        Self { store, cluster, bus }
    }

    /// Record a new binding and hand it to the binding processor.
    ///
    /// Installing a `(name, cluster)` pair twice returns the existing binding
    /// without publishing anything.
    pub async fn create_service_binding(
        &self,
        request: InstallRequest,
        cluster_name: &str,
    ) -> Result<BindingRef> {
        validate_name("service binding", &request.name, MAX_LABEL_LEN, false)?;
        if request.version.trim().is_empty() {
            return Err(Error::ValidationError("version must not be empty".into()));
        }
        let cluster_name = request
            .cluster_name
            .clone()
            .filter(|c| !c.is_empty())
            .unwrap_or_else(|| cluster_or_default(cluster_name));

        if let Some(existing) = self.store.get_binding_by_name(&request.name, &cluster_name).await? {
            info!(r#"Binding "{}" already exists in cluster {cluster_name}"#, existing.name);
            return Ok(BindingRef {
                name: existing.name,
                id: existing.id,
            });
        }

        let mut binding = ServiceBinding {
            name: request.name.clone(),
            cluster_name,
            version: request.version,
            service_name: request.name,
            service_id: request.service_id.unwrap_or_default(),
            status: LifecycleStatus::Installing,
            workloads: request.workloads,
            permissions: request.permissions,
            crd: request.crds,
            capability_plugin: request.capability_plugin,
            ..Default::default()
        };
        let resources = binding.resource_records().map_err(illegal_bundle)?;
        self.record_binding(binding, resources).await
    }

    /// Insert a new binding and announce it. An install of the same
    /// `(name, cluster)` that committed first wins and is returned instead.
    async fn record_binding(
        &self,
        mut binding: ServiceBinding,
        mut resources: Vec<ResourceRecord>,
    ) -> Result<BindingRef> {
        match self.store.create_binding(&mut binding, &mut resources).await {
            Ok(()) => {}
            Err(e) if e.is_unique_violation() => {
                let existing = self
                    .store
                    .get_binding_by_name(&binding.name, &binding.cluster_name)
                    .await?
                    .ok_or(e)?;
                info!(
                    r#"Binding "{}" was installed concurrently in cluster {}"#,
                    existing.name, existing.cluster_name
                );
                return Ok(BindingRef {
                    name: existing.name,
                    id: existing.id,
                });
            }
            Err(e) => return Err(e),
        }
        self.bus
            .add_event(&binding, EventOp::Create, BINDING_CHANNEL)
            .await?;
        info!(r#"Accepted install of "{}" {}"#, binding.name, binding.version);

        Ok(BindingRef {
            name: binding.name,
            id: binding.id,
        })
    }

    /// Store a new bundle for an installed binding and start its upgrade.
    pub async fn upgrade_service_binding(
        &self,
        name: &str,
        cluster_name: &str,
        request: InstallRequest,
    ) -> Result<BindingRef> {
        if request.version.trim().is_empty() {
            return Err(Error::ValidationError("version must not be empty".into()));
        }
        let mut binding = self.binding(name, cluster_name).await?;
        if matches!(
            binding.status,
            LifecycleStatus::Deleting | LifecycleStatus::DeleteFailed
        ) {
            return Err(Error::ValidationError(format!(
                "service binding {name} is being deleted"
            )));
        }

        binding.version = request.version;
        if let Some(service_id) = request.service_id.filter(|id| !id.is_empty()) {
            binding.service_id = service_id;
        }
        binding.workloads = request.workloads;
        binding.permissions = request.permissions;
        binding.crd = request.crds;
        binding.capability_plugin = request.capability_plugin;
        binding.status = LifecycleStatus::Upgrading;
        binding.message.clear();
        binding.process_time = 0;

        let mut resources = binding.resource_records().map_err(illegal_bundle)?;
        self.store.upgrade_binding(&mut binding, &mut resources).await?;
        self.bus
            .add_event(&binding, EventOp::Update, BINDING_CHANNEL)
            .await?;
        info!(r#"Accepted upgrade of "{}" to {}"#, binding.name, binding.version);

        Ok(BindingRef {
            name: binding.name,
            id: binding.id,
        })
    }

    /// Mark a binding and all of its instances for deletion.
    pub async fn delete_service_binding(&self, name: &str, cluster_name: &str) -> Result<()> {
        let mut binding = self.binding(name, cluster_name).await?;

        let instances = self
            .store
            .list_instances(&Filter::new().eq("service_binding_id", binding.id.clone()))
            .await?;
        for mut instance in instances {
            self.mark_instance_deleting(&mut instance).await?;
        }

        binding.status = LifecycleStatus::Deleting;
        binding.message.clear();
        binding.process_time = 0;
        self.store.update_binding(&mut binding).await?;
        self.bus
            .add_event(&binding, EventOp::Delete, BINDING_CHANNEL)
            .await?;
        info!(r#"Accepted delete of binding "{}""#, binding.name);
        Ok(())
    }

    pub async fn get_service_binding(
        &self,
        name: &str,
        cluster_name: &str,
        detail: bool,
    ) -> Result<BindingView> {
        let binding = self.binding(name, cluster_name).await?;
        self.binding_view(binding, detail).await
    }

    pub async fn list_service_bindings(
        &self,
        cluster_name: &str,
        detail: bool,
    ) -> Result<Vec<BindingView>> {
        let bindings = self
            .store
            .list_bindings(&Filter::new().eq("cluster_name", cluster_or_default(cluster_name)))
            .await?;
        let mut views = Vec::with_capacity(bindings.len());
        for binding in bindings {
            views.push(self.binding_view(binding, detail).await?);
        }
        Ok(views)
    }

    /// Record custom resources of a binding and hand them to the instance processor.
    pub async fn create_instances(
        &self,
        binding_name: &str,
        cluster_name: &str,
        namespace: &str,
        raw: Vec<Value>,
    ) -> Result<Vec<BindingRef>> {
        if raw.is_empty() {
            return Err(Error::ValidationError("no instances given".into()));
        }
        let binding = self.binding(binding_name, cluster_name).await?;
        if matches!(
            binding.status,
            LifecycleStatus::Deleting | LifecycleStatus::DeleteFailed
        ) {
            return Err(Error::ValidationError(format!(
                "service binding {binding_name} is being deleted"
            )));
        }

        let mut instances = Vec::with_capacity(raw.len());
        for document in raw {
            let instance = Instance::from_raw(document, namespace_or_default(namespace), &binding.cluster_name)
                .ok_or_else(|| {
                    Error::ValidationError(
                        "instance needs apiVersion, kind and metadata.name".into(),
                    )
                })?;
            validate_name("instance", &instance.name, MAX_SUBDOMAIN_LEN, true)?;
            validate_name("namespace", &instance.namespace, MAX_LABEL_LEN, false)?;
            if self
                .store
                .get_instance_by_name(&instance.name, &instance.namespace, &instance.cluster_name)
                .await?
                .is_some()
            {
                return Err(Error::ValidationError(format!(
                    "instance {}/{} already exists",
                    instance.namespace, instance.name
                )));
            }
            instances.push(instance);
        }

        let mut namespaces: Vec<&str> = instances.iter().map(|i| i.namespace.as_str()).collect();
        namespaces.sort_unstable();
        namespaces.dedup();
        for namespace in namespaces {
            if !self.cluster.namespace_exists(namespace).await {
                return Err(Error::ValidationError(format!(
                    "namespace {namespace} does not exist"
                )));
            }
        }

        self.store.create_instances(&mut instances, &binding.id).await?;
        let mut refs = Vec::with_capacity(instances.len());
        for instance in instances {
            self.bus
                .add_event(&instance, EventOp::Create, INSTANCE_CHANNEL)
                .await?;
            refs.push(BindingRef {
                name: instance.name,
                id: instance.id,
            });
        }
        info!(r#"Accepted {} instances of "{binding_name}""#, refs.len());
        Ok(refs)
    }

    pub async fn delete_instance(
        &self,
        binding_name: &str,
        cluster_name: &str,
        namespace: &str,
        name: &str,
    ) -> Result<()> {
        let mut instance = self.instance(binding_name, cluster_name, namespace, name).await?;
        self.mark_instance_deleting(&mut instance).await?;
        info!(r#"Accepted delete of instance "{}/{}""#, instance.namespace, instance.name);
        Ok(())
    }

    pub async fn get_instance(
        &self,
        binding_name: &str,
        cluster_name: &str,
        namespace: &str,
        name: &str,
        detail: bool,
    ) -> Result<InstanceView> {
        let instance = self.instance(binding_name, cluster_name, namespace, name).await?;
        self.instance_view(instance, detail).await
    }

    /// Instances of a binding, optionally limited to one namespace.
    pub async fn list_instances(
        &self,
        binding_name: &str,
        cluster_name: &str,
        namespace: Option<&str>,
        detail: bool,
    ) -> Result<Vec<InstanceView>> {
        let binding = self.binding(binding_name, cluster_name).await?;
        let mut filter = Filter::new().eq("service_binding_id", binding.id);
        if let Some(namespace) = namespace {
            filter = filter.eq("namespace", namespace_or_default(namespace));
        }
        let instances = self.store.list_instances(&filter).await?;

        let mut views = Vec::with_capacity(instances.len());
        for instance in instances {
            views.push(self.instance_view(instance, detail).await?);
        }
        Ok(views)
    }

    async fn binding(&self, name: &str, cluster_name: &str) -> Result<ServiceBinding> {
        self.store
            .get_binding_by_name(name, &cluster_or_default(cluster_name))
            .await?
            .ok_or_else(|| Error::NotFound(format!("service binding {name}")))
    }

    async fn instance(
        &self,
        binding_name: &str,
        cluster_name: &str,
        namespace: &str,
        name: &str,
    ) -> Result<Instance> {
        let binding = self.binding(binding_name, cluster_name).await?;
        let namespace = namespace_or_default(namespace);
        self.store
            .get_instance_by_name(name, namespace, &binding.cluster_name)
            .await?
            .filter(|instance| instance.service_binding_id == binding.id)
            .ok_or_else(|| Error::NotFound(format!("instance {namespace}/{name}")))
    }

    async fn mark_instance_deleting(&self, instance: &mut Instance) -> Result<()> {
        instance.status = LifecycleStatus::Deleting;
        instance.message.clear();
        instance.process_time = 0;
        self.store.update_instance(instance).await?;
        self.bus
            .add_event(&*instance, EventOp::Delete, INSTANCE_CHANNEL)
            .await
    }

    async fn binding_view(&self, binding: ServiceBinding, detail: bool) -> Result<BindingView> {
        if !detail {
            return Ok(BindingView {
                binding,
                aggregate: None,
                resources: None,
                instances: None,
            });
        }

        let package = self
            .cluster
            .get_service_package(&binding.name, SYSTEM_NAMESPACE)
            .await?;
        let mut states = vec![ResourceState::of_package(package.as_ref())];
        let instances = self
            .store
            .list_instances(&Filter::new().eq("service_binding_id", binding.id.clone()))
            .await?;
        for instance in &instances {
            states.push(self.instance_state(instance).await?);
        }
        let resources = self.store.list_resources(&binding.id).await?;

        Ok(BindingView {
            binding,
            aggregate: Some(aggregate_phase(&states)),
            resources: Some(resources),
            instances: Some(instances),
        })
    }

    async fn instance_view(&self, instance: Instance, detail: bool) -> Result<InstanceView> {
        let aggregate = if detail {
            Some(aggregate_phase(&[self.instance_state(&instance).await?]))
        } else {
            None
        };
        Ok(InstanceView { instance, aggregate })
    }

    async fn instance_state(&self, instance: &Instance) -> Result<ResourceState> {
        let exists = match self
            .cluster
            .custom_resource_exists(&instance.gvr(), &instance.name, &instance.namespace)
            .await
        {
            Ok(exists) => exists,
            Err(e) => {
                warn!("cannot look up instance {}: {e}", instance.name);
                false
            }
        };
        Ok(ResourceState::of_instance(instance, exists))
    }
}

#[async_trait]
impl Repository<ServiceBinding> for ResourceFacade {
    async fn load(&self, id: &str) -> Result<Option<ServiceBinding>> {
        self.store.get_binding_by_id(id).await
    }

    async fn list_by_status(&self, statuses: &[LifecycleStatus]) -> Result<Vec<ServiceBinding>> {
        self.store.list_bindings_by_status(statuses).await
    }

    async fn clear_process_time(&self, binding: &mut ServiceBinding) -> Result<()> {
        if binding.process_time == 0 {
            return Ok(());
        }
        self.store.set_binding_process_time(binding, 0).await
    }

    async fn record_message(&self, binding: &mut ServiceBinding, message: &str) -> Result<()> {
        self.store.set_binding_message(binding, message).await
    }

    async fn mark_failed(
        &self,
        binding: &mut ServiceBinding,
        status: LifecycleStatus,
        message: &str,
    ) -> Result<()> {
        self.store
            .update_binding_status_msg(binding, status, message)
            .await
    }
}

#[async_trait]
impl Repository<Instance> for ResourceFacade {
    async fn load(&self, id: &str) -> Result<Option<Instance>> {
        self.store.get_instance_by_id(id).await
    }

    async fn list_by_status(&self, statuses: &[LifecycleStatus]) -> Result<Vec<Instance>> {
        self.store.list_instances_by_status(statuses).await
    }

    async fn clear_process_time(&self, instance: &mut Instance) -> Result<()> {
        if instance.process_time == 0 {
            return Ok(());
        }
        self.store.set_instance_process_time(instance, 0).await
    }

    async fn record_message(&self, instance: &mut Instance, message: &str) -> Result<()> {
        self.store.set_instance_message(instance, message).await
    }

    async fn mark_failed(
        &self,
        instance: &mut Instance,
        status: LifecycleStatus,
        message: &str,
    ) -> Result<()> {
        self.store
            .update_instance_status_msg(instance, status, message)
            .await
    }
}

fn cluster_or_default(cluster_name: &str) -> String {
    if cluster_name.is_empty() {
        DEFAULT_CLUSTER.to_string()
    } else {
        cluster_name.to_string()
    }
}

fn namespace_or_default(namespace: &str) -> &str {
    if namespace.is_empty() {
        crate::DEFAULT_NAMESPACE
    } else {
        namespace
    }
}

fn illegal_bundle(e: Error) -> Error {
    match e {
        Error::IllegalServicePackage(reason) => Error::ValidationError(reason),
        other => other,
    }
}

/// RFC 1123 label (or subdomain when `dots` is set) check.
fn validate_name(what: &str, name: &str, max_len: usize, dots: bool) -> Result<()> {
    if name.is_empty() {
        return Err(Error::ValidationError(format!("{what} name must not be empty")));
    }
    if name.len() > max_len {
        return Err(Error::ValidationError(format!(
            "{what} name {name:?} is longer than {max_len} characters"
        )));
    }
    let legal = |c: char| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || (dots && c == '.');
    let edge = |c: char| c.is_ascii_lowercase() || c.is_ascii_digit();
    let well_formed = name.chars().all(legal)
        && name.chars().next().is_some_and(edge)
        && name.chars().last().is_some_and(edge);
    if !well_formed {
        return Err(Error::ValidationError(format!(
            "{what} name {name:?} must consist of lower case alphanumeric characters or '-', \
             and start and end with an alphanumeric character"
        )));
    }
    Ok(())
}
