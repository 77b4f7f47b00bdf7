//! HTTP surface
//!
//! Exposes the Builder and Engine over a small REST API: setup an
//! environment, execute against it, list and tear down environments, and a
//! health check for orchestrators.

mod handlers;
mod middleware;

use std::sync::Arc;
use std::time::Duration;

use axum::{
    routing::{delete, get, post},
    Router,
};
use tower::ServiceBuilder;
use tower_http::{
    catch_panic::CatchPanicLayer,
    cors::{Any, CorsLayer},
    limit::RequestBodyLimitLayer,
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};

use crate::builder::EnvironmentBuilder;
use crate::config::Configuration;
use crate::engine::ExecutionEngine;
use crate::runtime::ContainerRuntime;
use crate::store::Store;

const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Execute request bodies are hard-capped well below the general limit:
/// they're a small data payload, not a module upload.
const EXECUTE_MAX_BODY_BYTES: usize = 1024 * 1024;

/// State shared across every handler.
#[derive(Clone)]
pub struct AppState {
    pub builder: Arc<EnvironmentBuilder>,
    pub engine: Arc<ExecutionEngine>,
    pub runtime: Arc<dyn ContainerRuntime>,
    pub store: Arc<Store>,
    pub config: Arc<Configuration>,
}

pub fn build_router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/environments/setup", post(handlers::setup_environment))
        .route("/environments", get(handlers::list_environments))
        .route("/environments/:id", get(handlers::get_environment))
        .route("/environments/:id", delete(handlers::delete_environment))
        .route(
            "/environments/:id/execute",
            post(handlers::execute_environment)
                .route_layer(RequestBodyLimitLayer::new(EXECUTE_MAX_BODY_BYTES)),
        )
        .route_layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::auth::require_auth,
        ));

    Router::new()
        .route("/health", get(handlers::health))
        .merge(protected)
        .layer(
            ServiceBuilder::new()
                .layer(CatchPanicLayer::new())
                .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
                .layer(TraceLayer::new_for_http())
                .layer(PropagateRequestIdLayer::x_request_id())
                .layer(TimeoutLayer::new(Duration::from_secs(120)))
                .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
                .layer(
                    CorsLayer::new()
                        .allow_origin(Any)
                        .allow_methods(Any)
                        .allow_headers(Any),
                ),
        )
        .with_state(state)
}
