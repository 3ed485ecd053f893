//! Reverse proxy for the sink's non-ingest endpoints (delete, fetch, …).
//! Bodies are streamed in both directions; only `X-Warp*` response headers
//! and the content type are forwarded back.

use axum::body::Body;
use axum::extract::{Path, Request, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};

use crate::AppState;

/// `/warp/api/v0/delete*` → the delete endpoint.
pub async fn delete(State(state): State<AppState>, request: Request) -> Response {
    let target = format!(
        "{}/api/v0/delete",
        state.conf.warp_endpoint_delete.as_str().trim_end_matches('/')
    );
    forward(&state, target, request).await
}

/// `/warp/api/v0/*` → the same path on the sink.
pub async fn generic(State(state): State<AppState>, Path(rest): Path<String>, request: Request) -> Response {
    let target = format!(
        "{}/api/v0/{rest}",
        state.conf.warp_endpoint.as_str().trim_end_matches('/')
    );
    forward(&state, target, request).await
}

async fn forward(state: &AppState, mut target: String, request: Request) -> Response {
    if let Some(query) = request.uri().query() {
        target.push('?');
        target.push_str(query);
    }

    debug!(%target, method = %request.method(), "execute reverse proxy");

    let (mut parts, body) = request.into_parts();
    parts.headers.remove(header::HOST);

    let upstream = state
        .warp
        .client()
        .request(parts.method, &target)
        .headers(parts.headers)
        .body(reqwest::Body::wrap_stream(body.into_data_stream()))
        .send()
        .await;

    let upstream = match upstream {
        Ok(upstream) => upstream,
        Err(error) => {
            error!(%error, "cannot execute the request on the sink");
            return StatusCode::BAD_GATEWAY.into_response();
        }
    };

    let status = upstream.status();

    let mut headers = HeaderMap::new();
    for (name, value) in upstream.headers() {
        if name.as_str().starts_with("x-warp") {
            headers.insert(name.clone(), value.clone());
        }
    }
    if let Some(content_type) = upstream.headers().get(header::CONTENT_TYPE) {
        headers.insert(header::CONTENT_TYPE, content_type.clone());
    }

    (status, headers, Body::from_stream(upstream.bytes_stream())).into_response()
}
