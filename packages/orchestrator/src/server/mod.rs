//! HTTP admin surface: a thin axum layer over [`Orchestrator`].

pub mod routes;

use axum::Router;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::facade::Orchestrator;

pub fn build_app(orchestrator: Arc<Orchestrator>) -> Router {
    Router::new()
        .merge(routes::router())
        .with_state(orchestrator)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}
