use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use tracing::{info, warn};

use crate::{
    cluster::{ClusterGateway, Payload},
    model::{ConditionStatus, ConditionType, Instance, LifecycleStatus},
    resources::PackagePhase,
    store::Store,
    Error, Result, SYSTEM_NAMESPACE,
};

use super::{deadline_in, Flow, LifecycleHandler};

/// Deadline for the service of an instance to become ready.
pub const INSTANCE_WAIT_DEADLINE: Duration = Duration::from_secs(2 * 60);

/// Deadline for the custom resource to be created once the service is ready.
pub const INSTANCE_CREATE_DEADLINE: Duration = Duration::from_secs(3 * 60);

/// Creates, updates and deletes the custom resource behind an instance.
pub struct InstanceHandler {
    store: Arc<Store>,
    cluster: Arc<dyn ClusterGateway>,
}

impl InstanceHandler {
    pub fn new(store: Arc<Store>, cluster: Arc<dyn ClusterGateway>) -> Self {
        Self { store, cluster }
    }

    /// Check that the service of the instance runs, requeueing while it cannot
    /// serve yet and failing the instance when it failed.
    async fn wait_for_service(&self, instance: &Instance) -> Result<Option<Flow>> {
        let Some(binding) = self
            .store
            .get_binding_by_id(&instance.service_binding_id)
            .await?
        else {
            return Ok(Some(Flow::requeue("service binding not found")));
        };
        let Some(package) = self
            .cluster
            .get_service_package(&binding.name, SYSTEM_NAMESPACE)
            .await?
        else {
            return Ok(Some(Flow::requeue(format!(
                "service package {} does not exist yet",
                binding.name
            ))));
        };

        match package.phase() {
            PackagePhase::Failed => Err(Error::IllegalServicePackage(format!(
                "service {} failed: {}",
                binding.name,
                package.status.map(|s| s.reason).unwrap_or_default()
            ))),
            phase @ (PackagePhase::Pending | PackagePhase::Deleting | PackagePhase::Deleted) => {
                Ok(Some(Flow::requeue(format!("service package is {phase}"))))
            }
            _ => Ok(None),
        }
    }

    /// Record a failed `CreateResource` step, then hand the error back.
    async fn record_failure(&self, instance: &mut Instance, error: Error) -> Result<Flow> {
        instance.install_state.update_condition(
            ConditionType::CreateResource,
            ConditionStatus::Failed,
            error.to_string(),
        );
        let status = instance.status;
        match self.store.advance_instance(instance, status).await {
            Ok(()) => {}
            Err(e @ Error::Conflict(_)) => return Err(e),
            Err(e) => warn!("cannot record failure of instance {}: {e}", instance.name),
        }
        Err(error)
    }

    async fn finish(&self, instance: &mut Instance, message: &str) -> Result<Flow> {
        instance.install_state.update_condition(
            ConditionType::CreateResource,
            ConditionStatus::Success,
            message,
        );
        instance.message.clear();
        instance.process_time = 0;
        self.store
            .advance_instance(instance, LifecycleStatus::Initialized)
            .await?;
        info!(
            r#"Instance "{}/{}" is initialized"#,
            instance.namespace, instance.name
        );
        Ok(Flow::Next)
    }
}

#[async_trait]
impl LifecycleHandler<Instance> for InstanceHandler {
    async fn install(&self, instance: &mut Instance) -> Result<Flow> {
        if instance.process_time == 0 {
            self.store
                .set_instance_process_time(instance, deadline_in(INSTANCE_WAIT_DEADLINE))
                .await?;
        }
        if let Some(flow) = self.wait_for_service(instance).await? {
            return Ok(flow);
        }

        let ready = instance.install_state.update_condition(
            ConditionType::InstallOperator,
            ConditionStatus::Success,
            "successful to InstallOperator",
        );
        let running = instance.install_state.update_condition(
            ConditionType::CreateResource,
            ConditionStatus::Running,
            "",
        );
        if ready {
            instance.process_time = deadline_in(INSTANCE_CREATE_DEADLINE);
        }
        if ready || running {
            let status = instance.status;
            self.store.advance_instance(instance, status).await?;
        }

        let gvr = instance.gvr();
        match self
            .cluster
            .custom_resource_exists(&gvr, &instance.name, &instance.namespace)
            .await
        {
            Ok(true) => return self.finish(instance, "custom resource already exists").await,
            Ok(false) => {}
            Err(e) => return self.record_failure(instance, e).await,
        }

        let payload = Payload::Object(instance.raw_resource.clone());
        match self
            .cluster
            .deploy_custom_resource(&gvr, &instance.namespace, payload)
            .await
        {
            Ok(()) => self.finish(instance, "successful to CreateResource").await,
            Err(e) => self.record_failure(instance, e).await,
        }
    }

    async fn upgrade(&self, instance: &mut Instance) -> Result<Flow> {
        if instance.process_time == 0 {
            self.store
                .set_instance_process_time(instance, deadline_in(INSTANCE_CREATE_DEADLINE))
                .await?;
        }
        if let Some(flow) = self.wait_for_service(instance).await? {
            return Ok(flow);
        }

        let gvr = instance.gvr();
        let payload = Payload::Object(instance.raw_resource.clone());
        match self
            .cluster
            .update_custom_resource(&gvr, &instance.namespace, payload.clone())
            .await
        {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                self.cluster
                    .deploy_custom_resource(&gvr, &instance.namespace, payload)
                    .await?
            }
            Err(e) => return Err(e),
        }

        instance.message.clear();
        instance.process_time = 0;
        self.store
            .advance_instance(instance, LifecycleStatus::Initialized)
            .await?;
        Ok(Flow::Next)
    }

    async fn delete(&self, instance: &mut Instance) -> Result<Flow> {
        if instance.process_time == 0 {
            self.store
                .set_instance_process_time(instance, deadline_in(INSTANCE_CREATE_DEADLINE))
                .await?;
        }

        let gvr = instance.gvr();
        match self
            .cluster
            .delete_custom_resource(&gvr, &instance.name, &instance.namespace)
            .await
        {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        self.store.delete_instance(instance).await?;
        info!(
            r#"Removed instance "{}/{}""#,
            instance.namespace, instance.name
        );
        Ok(Flow::Next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cluster::fake::FakeGateway,
        config::ProcessorSettings,
        model::unix_now,
        processor::{binding::package_for, Outcome, Processor, Repository},
        store::fixtures::{insert_sample, sample_instance},
        Metrics,
    };

    struct Setup {
        store: Arc<Store>,
        cluster: Arc<FakeGateway>,
        handler: InstanceHandler,
        instance: Instance,
    }

    async fn setup(phase: Option<PackagePhase>) -> Setup {
        let store = Arc::new(Store::in_memory().await.unwrap());
        let cluster = Arc::new(FakeGateway::default());
        let binding = insert_sample(&store, "mysql").await;
        if let Some(phase) = phase {
            cluster.insert_package(package_for(&binding).unwrap());
            cluster.set_status("mysql", phase, "1.0.0");
        }
        let mut instances = vec![sample_instance("orders")];
        store.create_instances(&mut instances, &binding.id).await.unwrap();
        let instance = store
            .get_instance_by_id(&instances[0].id)
            .await
            .unwrap()
            .unwrap();

        let handler = InstanceHandler::new(store.clone(), cluster.clone());
        Setup {
            store,
            cluster,
            handler,
            instance,
        }
    }

    #[tokio::test]
    async fn install_waits_for_a_running_service() {
        let mut s = setup(None).await;
        let flow = s.handler.install(&mut s.instance).await.unwrap();
        assert_eq!(flow, Flow::requeue("service package mysql does not exist yet"));
        assert!(s.instance.process_time > unix_now());

        let mut s = setup(Some(PackagePhase::Pending)).await;
        let flow = s.handler.install(&mut s.instance).await.unwrap();
        assert_eq!(flow, Flow::requeue("service package is Pending"));
    }

    #[tokio::test]
    async fn install_fails_when_the_service_failed() {
        let mut s = setup(Some(PackagePhase::Failed)).await;
        let err = s.handler.install(&mut s.instance).await.unwrap_err();
        assert!(err.is_terminal());
    }

    #[tokio::test]
    async fn install_deploys_the_custom_resource() {
        let mut s = setup(Some(PackagePhase::Running)).await;
        assert_eq!(s.handler.install(&mut s.instance).await.unwrap(), Flow::Next);

        let gvr = s.instance.gvr();
        let deployed = s.cluster.custom_resource(&gvr, "shop", "orders").unwrap();
        assert_eq!(deployed["spec"]["replicas"], 1);

        let stored = s
            .store
            .get_instance_by_id(&s.instance.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, LifecycleStatus::Initialized);
        assert_eq!(stored.install_state.phase, LifecycleStatus::Initialized);
        assert!(stored.install_state.is_complete());
        assert_eq!(stored.process_time, 0);
    }

    #[tokio::test]
    async fn existing_custom_resource_counts_as_created() {
        let mut s = setup(Some(PackagePhase::Running)).await;
        let gvr = s.instance.gvr();
        s.cluster
            .deploy_custom_resource(&gvr, "shop", Payload::Object(s.instance.raw_resource.clone()))
            .await
            .unwrap();

        assert_eq!(s.handler.install(&mut s.instance).await.unwrap(), Flow::Next);
        let condition = s
            .instance
            .install_state
            .condition(ConditionType::CreateResource)
            .unwrap();
        assert_eq!(condition.status, ConditionStatus::Success);
        assert_eq!(condition.message, "custom resource already exists");
    }

    #[tokio::test]
    async fn deploy_failures_are_recorded_and_retried() {
        let mut s = setup(Some(PackagePhase::Running)).await;
        s.cluster.fail_custom_resources(Some("api unavailable"));

        let err = s.handler.install(&mut s.instance).await.unwrap_err();
        assert!(!err.is_terminal());
        let stored = s
            .store
            .get_instance_by_id(&s.instance.id)
            .await
            .unwrap()
            .unwrap();
        let condition = stored
            .install_state
            .condition(ConditionType::CreateResource)
            .unwrap();
        assert_eq!(condition.status, ConditionStatus::Failed);
        assert!(condition.message.contains("api unavailable"));
        assert_eq!(stored.status, LifecycleStatus::Initializing);
    }

    #[tokio::test]
    async fn delete_tolerates_a_missing_custom_resource() {
        let mut s = setup(Some(PackagePhase::Running)).await;
        s.instance.status = LifecycleStatus::Deleting;
        s.store.update_instance(&mut s.instance).await.unwrap();
        assert_eq!(s.handler.delete(&mut s.instance).await.unwrap(), Flow::Next);
        assert!(s
            .store
            .get_instance_by_id(&s.instance.id)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn delete_retries_other_errors() {
        let mut s = setup(Some(PackagePhase::Running)).await;
        s.cluster.fail_custom_resources(Some("api unavailable"));
        assert!(s.handler.delete(&mut s.instance).await.is_err());
        assert!(s
            .store
            .get_instance_by_id(&s.instance.id)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn delete_requested_during_install_wins() {
        let mut s = setup(Some(PackagePhase::Running)).await;

        // The user deletes the instance after the worker loaded it
        let mut deleting = s.instance.clone();
        deleting.status = LifecycleStatus::Deleting;
        s.store.update_instance(&mut deleting).await.unwrap();

        let err = s.handler.install(&mut s.instance).await.unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
        let stored = s
            .store
            .get_instance_by_id(&s.instance.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, LifecycleStatus::Deleting);

        let processor = Processor::new(
            facade_repository(&s),
            Arc::new(InstanceHandler::new(s.store.clone(), s.cluster.clone())),
            ProcessorSettings::default(),
            Metrics::default(),
        );
        assert_eq!(processor.process_item(&s.instance.id).await, Outcome::Done);
        assert!(s.cluster.custom_resource(&s.instance.gvr(), "shop", "orders").is_none());
        assert!(s
            .store
            .get_instance_by_id(&s.instance.id)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn waiting_reason_is_stored_on_the_instance() {
        let s = setup(Some(PackagePhase::Pending)).await;
        let processor = Processor::new(
            facade_repository(&s),
            Arc::new(InstanceHandler::new(s.store.clone(), s.cluster.clone())),
            ProcessorSettings::default(),
            Metrics::default(),
        );

        assert_eq!(processor.process_item(&s.instance.id).await, Outcome::Requeued);
        let stored = s
            .store
            .get_instance_by_id(&s.instance.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.message, "service package is Pending");
        assert_eq!(stored.status, LifecycleStatus::Initializing);
        assert_eq!(stored.update_time, s.instance.update_time);
    }

    fn facade_repository(s: &Setup) -> Arc<dyn Repository<Instance>> {
        Arc::new(crate::facade::ResourceFacade::new(
            s.store.clone(),
            s.cluster.clone(),
            Arc::new(crate::event::EventBus::new()),
        ))
    }

    /// An instance past its budget with a running step is failed by the next cycle.
    #[tokio::test]
    async fn stale_instance_times_out() {
        let s = setup(None).await;
        let mut instance = s.instance.clone();
        instance.install_state.update_condition(
            ConditionType::CreateResource,
            ConditionStatus::Running,
            "",
        );
        s.store.update_instance(&mut instance).await.unwrap();
        s.store
            .backdate_instance(&instance.id, unix_now() - 21 * 60)
            .await
            .unwrap();

        let processor = Processor::new(
            facade_repository(&s),
            Arc::new(InstanceHandler::new(s.store.clone(), s.cluster.clone())),
            ProcessorSettings::default(),
            Metrics::default(),
        );

        assert_eq!(processor.process_item(&instance.id).await, Outcome::Failed);
        let failed = s.store.get_instance_by_id(&instance.id).await.unwrap().unwrap();
        assert_eq!(failed.status, LifecycleStatus::InitFailed);
        assert!(failed.message.contains("timed out to do CreateResource"));
        assert_eq!(failed.process_time, 0);
        assert!(processor.queue().is_empty());
    }
}
