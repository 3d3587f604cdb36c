use std::{future::IntoFuture as _, sync::Arc};

use anyhow::anyhow;
use kappital_engine::{
    api,
    cluster::{self, ClusterGateway, KubeGateway},
    config::Settings,
    event::{decode_binding, decode_instance, EventBus, BINDING_CHANNEL, INSTANCE_CHANNEL},
    facade::ResourceFacade,
    model::{Instance, ServiceBinding},
    operator::{PackageController, State},
    processor::{BindingHandler, InstanceHandler, Processor},
    store::Store,
    telemetry,
};
use tokio::{net::TcpListener, sync::watch};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init().await?;
    let settings = Settings::from_env()?;

    let client = cluster::create_client(settings.kubeconfig.as_deref()).await?;
    let store = Arc::new(Store::connect(&settings.database).await?);
    let gateway: Arc<dyn ClusterGateway> = Arc::new(KubeGateway::new(client.clone()));
    let bus = Arc::new(EventBus::new());
    let facade = Arc::new(ResourceFacade::new(store.clone(), gateway.clone(), bus.clone()));
    let state = State::new()?;

    // Lifecycle processors fed by the event bus
    let bindings = Arc::new(Processor::<ServiceBinding>::new(
        facade.clone(),
        Arc::new(BindingHandler::new(store.clone(), gateway.clone())),
        settings.processor.clone(),
        state.recorder(),
    ));
    let instances = Arc::new(Processor::<Instance>::new(
        facade.clone(),
        Arc::new(InstanceHandler::new(store.clone(), gateway)),
        settings.processor.clone(),
        state.recorder(),
    ));
    bus.register(BINDING_CHANNEL, decode_binding, bindings.clone());
    bus.register(INSTANCE_CHANNEL, decode_instance, instances.clone());

    let (stop, stopped) = watch::channel(false);
    let dispatcher = bus.start(stopped.clone())?;
    let mut workers = bindings.start(&bus, stopped.clone()).await?;
    workers.extend(instances.start(&bus, stopped).await?);

    // Start web servers
    let listener = TcpListener::bind(("0.0.0.0", settings.server.port)).await?;
    info!("API listening on {}", settings.server.port);
    let api_server = axum::serve(listener, api::router(facade, &settings.server));

    let listener = TcpListener::bind(("0.0.0.0", settings.server.ops_port)).await?;
    let ops_server = axum::serve(listener, handlers::router().with_state(state.clone()));

    let controller = PackageController::new(state);

    // The controller returns on SIGINT/SIGTERM, anything else finishing is an error
    let outcome = tokio::select! {
        c = controller.run(client) => c,
        s = api_server.into_future() => match s {
            Ok(()) => Err(anyhow!("api server exited early")),
            Err(e) => Err(anyhow!("api server failed: {e}")),
        },
        s = ops_server.into_future() => match s {
            Ok(()) => Err(anyhow!("ops server exited early")),
            Err(e) => Err(anyhow!("ops server failed: {e}")),
        },
    };

    info!("shutting down processors");
    if stop.send(true).is_err() {
        warn!("processors already stopped");
    }
    for worker in workers {
        worker.await?;
    }
    dispatcher.await?;
    outcome
}

/// Handlers for the operations web server
mod handlers {
    use axum::{extract::State, http::StatusCode, response::IntoResponse, routing, Json, Router};
    use prometheus::{Encoder, TextEncoder};

    use kappital_engine::operator::State as OperatorState;

    /// Construct the router for all the handlers
    pub fn router() -> Router<OperatorState> {
        Router::new()
            .route("/metrics", routing::get(metrics))
            .route("/health", routing::get(health))
            .route("/", routing::get(index))
    }

    /// Handler for exposing prometheus metrics
    async fn metrics(State(state): State<OperatorState>) -> impl IntoResponse {
        let metrics = state.metrics();
        let encoder = TextEncoder::new();
        let mut buffer = vec![];
        match encoder.encode(&metrics, &mut buffer) {
            Ok(()) => (StatusCode::OK, buffer),
            Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string().into_bytes()),
        }
    }

    /// Handler for checking the health of the server
    async fn health() -> impl IntoResponse {
        (StatusCode::OK, Json("healthy"))
    }

    /// Handler for interacting with the operator
    async fn index(State(state): State<OperatorState>) -> impl IntoResponse {
        let diagnostics = state.diagnostics().await;

        (StatusCode::OK, Json(diagnostics))
    }
}
