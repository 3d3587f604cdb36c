//! REST surface under `/api/v1alpha1` translating requests into facade calls.
use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, rejection::QueryRejection, DefaultBodyLimit, Path, Query, State},
    middleware,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::instrument;

use crate::{
    config::ServerSettings,
    facade::{BindingRef, BindingView, InstallRequest, InstanceView, ResourceFacade},
    Error,
};

mod error;
mod guard;

pub use error::{ApiError, ErrorBody};
pub use guard::TokenBucket;

pub const BASE_PATH: &str = "/api/v1alpha1";

/// Largest accepted request body.
pub const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

type ApiResult<T> = Result<Json<T>, ApiError>;

#[derive(Clone)]
struct ApiState {
    facade: Arc<ResourceFacade>,
}

/// Query parameters shared by every route.
#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct Params {
    #[serde(default)]
    pub cluster_name: String,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub detail: bool,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct Deleted {
    pub name: String,
}

/// Construct the router for the API server, guards included.
pub fn router(facade: Arc<ResourceFacade>, settings: &ServerSettings) -> Router {
    let routes = Router::new()
        .route("/servicebinding", get(list_bindings).post(create_binding))
        .route("/servicebinding/:name", get(get_binding).delete(delete_binding))
        .route("/servicebinding/:name/upgrade", post(upgrade_binding))
        .route(
            "/servicebinding/:name/instance",
            get(list_instances).post(create_instances),
        )
        .route(
            "/servicebinding/:name/instance/:instance",
            get(get_instance).delete(delete_instance),
        )
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .with_state(ApiState { facade });
    let api = Router::new().nest(BASE_PATH, routes);

    // Guards wrap the whole api so paths can be rewritten before routing
    let bucket = Arc::new(TokenBucket::new(settings.qps, settings.burst));
    Router::new()
        .fallback_service(api)
        .layer(middleware::from_fn(guard::canonical_request))
        .layer(middleware::from_fn_with_state(bucket, guard::rate_limit))
}

fn params(query: Result<Query<Params>, QueryRejection>) -> Result<Params, ApiError> {
    match query {
        Ok(Query(params)) => Ok(params),
        Err(rejection) => Err(Error::ValidationError(rejection.body_text()).into()),
    }
}

fn body<T>(json: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    match json {
        Ok(Json(body)) => Ok(body),
        Err(rejection) => Err(Error::ValidationError(rejection.body_text()).into()),
    }
}

#[instrument(skip(state, request))]
async fn create_binding(
    State(state): State<ApiState>,
    query: Result<Query<Params>, QueryRejection>,
    request: Result<Json<InstallRequest>, JsonRejection>,
) -> ApiResult<BindingRef> {
    let params = params(query)?;
    let request = body(request)?;
    let created = state
        .facade
        .create_service_binding(request, &params.cluster_name)
        .await?;
    Ok(Json(created))
}

async fn list_bindings(
    State(state): State<ApiState>,
    query: Result<Query<Params>, QueryRejection>,
) -> ApiResult<Vec<BindingView>> {
    let params = params(query)?;
    let views = state
        .facade
        .list_service_bindings(&params.cluster_name, params.detail)
        .await?;
    Ok(Json(views))
}

async fn get_binding(
    State(state): State<ApiState>,
    Path(name): Path<String>,
    query: Result<Query<Params>, QueryRejection>,
) -> ApiResult<BindingView> {
    let params = params(query)?;
    let view = state
        .facade
        .get_service_binding(&name, &params.cluster_name, params.detail)
        .await?;
    Ok(Json(view))
}

#[instrument(skip(state))]
async fn delete_binding(
    State(state): State<ApiState>,
    Path(name): Path<String>,
    query: Result<Query<Params>, QueryRejection>,
) -> ApiResult<Deleted> {
    let params = params(query)?;
    state
        .facade
        .delete_service_binding(&name, &params.cluster_name)
        .await?;
    Ok(Json(Deleted { name }))
}

#[instrument(skip(state, request))]
async fn upgrade_binding(
    State(state): State<ApiState>,
    Path(name): Path<String>,
    query: Result<Query<Params>, QueryRejection>,
    request: Result<Json<InstallRequest>, JsonRejection>,
) -> ApiResult<BindingRef> {
    let params = params(query)?;
    let request = body(request)?;
    let upgraded = state
        .facade
        .upgrade_service_binding(&name, &params.cluster_name, request)
        .await?;
    Ok(Json(upgraded))
}

/// Accepts one custom resource or an array of them.
#[instrument(skip(state, documents))]
async fn create_instances(
    State(state): State<ApiState>,
    Path(name): Path<String>,
    query: Result<Query<Params>, QueryRejection>,
    documents: Result<Json<Value>, JsonRejection>,
) -> ApiResult<Vec<BindingRef>> {
    let params = params(query)?;
    let documents = match body(documents)? {
        Value::Array(documents) => documents,
        document => vec![document],
    };
    let namespace = params.namespace.unwrap_or_default();
    let created = state
        .facade
        .create_instances(&name, &params.cluster_name, &namespace, documents)
        .await?;
    Ok(Json(created))
}

async fn list_instances(
    State(state): State<ApiState>,
    Path(name): Path<String>,
    query: Result<Query<Params>, QueryRejection>,
) -> ApiResult<Vec<InstanceView>> {
    let params = params(query)?;
    let views = state
        .facade
        .list_instances(
            &name,
            &params.cluster_name,
            params.namespace.as_deref(),
            params.detail,
        )
        .await?;
    Ok(Json(views))
}

async fn get_instance(
    State(state): State<ApiState>,
    Path((name, instance)): Path<(String, String)>,
    query: Result<Query<Params>, QueryRejection>,
) -> ApiResult<InstanceView> {
    let params = params(query)?;
    let namespace = params.namespace.unwrap_or_default();
    let view = state
        .facade
        .get_instance(&name, &params.cluster_name, &namespace, &instance, params.detail)
        .await?;
    Ok(Json(view))
}

#[instrument(skip(state))]
async fn delete_instance(
    State(state): State<ApiState>,
    Path((name, instance)): Path<(String, String)>,
    query: Result<Query<Params>, QueryRejection>,
) -> ApiResult<Deleted> {
    let params = params(query)?;
    let namespace = params.namespace.unwrap_or_default();
    state
        .facade
        .delete_instance(&name, &params.cluster_name, &namespace, &instance)
        .await?;
    Ok(Json(Deleted { name: instance }))
}
