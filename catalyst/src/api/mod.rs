pub mod forward;
pub mod graphite;
pub mod influxdb;
pub mod opentsdb;
pub mod prometheus;
pub mod remote_write;
pub mod warp10;

use axum::Router;
use axum::http::StatusCode;
use axum::routing::{any, get, post};

use crate::AppState;

pub fn make_router(state: AppState) -> Router {
    Router::new()
        // legacy, unversioned paths
        .route("/opentsdb", post(opentsdb::handler))
        .route("/prometheus", post(prometheus::handler).put(prometheus::handler))
        .route("/warp", post(warp10::handler))
        .route("/influxdb", post(influxdb::handler))
        .route("/graphite/api/v1/sink", post(graphite::handler))
        // versioned surface
        .route("/opentsdb/{*path}", post(opentsdb::handler))
        .route(
            "/prometheus/remote_write",
            post(remote_write::handler).put(remote_write::handler),
        )
        .route(
            "/prometheus/remote_write/{*path}",
            post(remote_write::handler).put(remote_write::handler),
        )
        .route("/prometheus/{*path}", post(prometheus::handler).put(prometheus::handler))
        .route("/influxdb/write", post(influxdb::handler))
        .route("/influxdb/write/{*path}", post(influxdb::handler))
        .route("/influxdb/ping", get(influxdb::ping))
        .route("/influxdb/ping/{*path}", get(influxdb::ping))
        .route("/warp/api/v0/update", post(warp10::handler))
        .route("/warp/api/v0/update/{*path}", post(warp10::handler))
        // everything else on the sink API is proxied
        .route("/warp/api/v0/delete", any(forward::delete))
        .route("/warp/api/v0/delete/{*path}", any(forward::delete))
        .route("/warp/api/v0/{*path}", any(forward::generic))
        .with_state(state)
}

/// Text exposition of the default registry.
pub async fn metrics_handler() -> (StatusCode, String) {
    let families = ::prometheus::default_registry().gather();
    match ::prometheus::TextEncoder::new().encode_to_string(&families) {
        Ok(body) => (StatusCode::OK, body),
        Err(error) => (StatusCode::INTERNAL_SERVER_ERROR, error.to_string()),
    }
}
