use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use futures::StreamExt;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use kube::{
    api::ListParams,
    runtime::{controller::Action, events::Reporter, watcher::Config, Controller},
    Api, Client, ResourceExt,
};
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{error, field, info, instrument, warn, Span};

use crate::{
    reconcilers::{ClusterApi, Context, CrdGate, KubeCluster, Reconcile},
    resources::ServicePackage,
    telemetry, Error, Metrics, Result, MANAGER_NAME, SYSTEM_NAMESPACE,
};

/// Diagnostics to be exposed by the web server
#[derive(Clone, Serialize)]
pub struct Diagnostics {
    pub last_event: DateTime<Utc>,
    #[serde(skip)]
    pub reporter: Reporter,
}
impl Default for Diagnostics {
    fn default() -> Self {
        Self {
            last_event: Utc::now(),
            reporter: MANAGER_NAME.into(),
        }
    }
}

/// State shared between the controller, the processors and the web servers
#[derive(Clone)]
pub struct State {
    /// Diagnostics populated by the reconciler
    diagnostics: Arc<RwLock<Diagnostics>>,
    /// Metrics registry
    registry: prometheus::Registry,
    /// Metrics registered once in `registry`
    metrics: Metrics,
}

impl State {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = prometheus::Registry::default();
        let metrics = Metrics::default().register(&registry)?;
        Ok(Self {
            diagnostics: Arc::default(),
            registry,
            metrics,
        })
    }

    /// Metrics getter
    pub fn metrics(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }

    /// Handles for code outside the controller to record into
    pub fn recorder(&self) -> Metrics {
        self.metrics.clone()
    }

    /// State getter
    pub async fn diagnostics(&self) -> Diagnostics {
        self.diagnostics.read().await.clone()
    }

    // Create a Controller Context that can update State
    pub(crate) fn to_context<C: ClusterApi>(&self, cluster: C, crd_gate: CrdGate) -> Arc<Context<C>> {
        Arc::new(Context {
            cluster,
            diagnostics: self.diagnostics.clone(),
            metrics: self.metrics.clone(),
            crd_gate,
        })
    }
}

/// Watches `ServicePackage` objects in the system namespace and the workloads they own.
pub struct PackageController {
    state: State,
}

impl PackageController {
    pub fn new(state: State) -> Self {
        Self { state }
    }

    /// Initialize the controller and run it until shutdown (given the crd is installed)
    pub async fn run(self, client: Client) -> Result<(), anyhow::Error> {
        let reporter = self.state.diagnostics().await.reporter;
        let cluster = KubeCluster::new(client.clone(), reporter);

        let crd_gate = match cluster.git_version().await {
            Ok(version) => {
                info!("Cluster runs {version}");
                CrdGate::from_git_version(&version)
            }
            Err(e) => {
                warn!("cannot read cluster version, assuming v1 CRDs: {e}");
                CrdGate::default()
            }
        };

        let packages = Api::<ServicePackage>::namespaced(client.clone(), SYSTEM_NAMESPACE);

        // Test that we can actually query for our CRD (a.k.a. it is installed)
        if let Err(e) = packages.list(&ListParams::default().limit(1)).await {
            error!("CRD is not queryable; {e:?}. Is the CRD installed?");
            info!("Installation: cargo run --bin crdgen | kubectl apply -f -");
            return Err(Error::KubeError(e).into());
        }

        let watching_config = Config::default().page_size(50).any_semantic();
        Controller::new(packages, watching_config.clone())
            .shutdown_on_signal()
            .owns(
                Api::<Deployment>::namespaced(client.clone(), SYSTEM_NAMESPACE),
                watching_config.clone(),
            )
            .owns(
                Api::<DaemonSet>::namespaced(client.clone(), SYSTEM_NAMESPACE),
                watching_config.clone(),
            )
            .owns(
                Api::<StatefulSet>::namespaced(client, SYSTEM_NAMESPACE),
                watching_config,
            )
            .run(
                reconcile::<KubeCluster>,
                error_policy::<KubeCluster>,
                self.state.to_context(cluster, crd_gate),
            )
            .filter_map(|x| async move { Result::ok(x) })
            .for_each(|_| futures::future::ready(()))
            .await;

        Ok(())
    }
}

// Error handler for failed reconciliations
fn error_policy<C: ClusterApi>(package: Arc<ServicePackage>, error: &Error, ctx: Arc<Context<C>>) -> Action {
    error!("reconcile failed: {:?}", error);
    ctx.metrics.reconcile_failure(&package, error);
    Action::requeue(Duration::from_secs(5))
}

#[instrument(skip(ctx, package), fields(trace_id))]
async fn reconcile<C: ClusterApi>(package: Arc<ServicePackage>, ctx: Arc<Context<C>>) -> Result<Action> {
    let trace_id = telemetry::get_trace_id();
    Span::current().record("trace_id", &field::display(&trace_id));
    let _timer = ctx.metrics.count_and_measure();
    ctx.diagnostics.write().await.last_event = Utc::now();

    let name = package.name_any();
    let namespace = package.namespace().unwrap_or_default();
    info!(r#"Starting ServicePackage reconciliation for "{namespace}/{name}""#);
    package.reconcile(ctx).await
}
