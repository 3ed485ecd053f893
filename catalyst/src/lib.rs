#[macro_use]
extern crate tracing;

pub mod api;
pub mod config;
pub mod graphite;
pub mod ingest;
pub mod log;
pub mod metrics;
pub mod middleware;
pub mod point;
pub mod token;
pub mod warp;

#[cfg(test)]
mod test_util;

use std::sync::Arc;

use axum::Router;
use axum::http::{HeaderName, Method, header};
use tower_http::cors::{Any, CorsLayer};

use crate::config::Conf;
use crate::warp::WarpConnector;

#[derive(Clone)]
pub struct AppState {
    pub conf: Arc<Conf>,
    pub warp: WarpConnector,
}

impl AppState {
    pub fn new(conf: Arc<Conf>) -> anyhow::Result<Self> {
        let warp = WarpConnector::new(&conf)?;
        Ok(Self { conf, warp })
    }
}

/// The ingestion router with its middleware stack.
pub fn make_http_service(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::PUT, Method::POST, Method::DELETE])
        .allow_headers([
            header::ORIGIN,
            header::AUTHORIZATION,
            header::CONTENT_TYPE,
            HeaderName::from_static("x-warp10-token"),
        ]);

    api::make_router(state.clone())
        .layer(axum::middleware::from_fn_with_state(state, middleware::auth::bannishment))
        .layer(axum::middleware::from_fn(middleware::log::log_requests))
        .layer(cors)
}

/// The telemetry router, bound on its own listener.
pub fn make_metrics_service() -> Router {
    Router::new().route("/metrics", axum::routing::get(api::metrics_handler))
}
