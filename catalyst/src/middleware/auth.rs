//! Banishment middleware: extracts the credential once per request and
//! slow-rejects anything carrying a banned token, so misbehaving emitters
//! pay for their retries.

use axum::body::{Body, to_bytes};
use axum::extract::{Request, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use crate::AppState;
use crate::metrics;
use crate::middleware::Txn;
use crate::token;

/// Only applies when the token has to be searched in an urlencoded body;
/// such bodies are small.
const FORM_BODY_LIMIT: usize = 64 * 1024;

/// Write credential, stashed in the request extensions for the ingestion
/// driver.
#[derive(Debug, Clone)]
pub struct IngestToken(pub String);

pub async fn bannishment(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let txn = request.extensions().get::<Txn>().cloned().unwrap_or_default();

    let (mut parts, body) = request.into_parts();

    let (token, body) = match token::from_parts(&parts.headers, &parts.uri) {
        Ok(token) => (Some(token), body),
        Err(_) if is_form(&parts.headers) => match to_bytes(body, FORM_BODY_LIMIT).await {
            Ok(bytes) => {
                let token = token::from_form_body(&bytes);
                (token, Body::from(bytes))
            }
            Err(_) => (None, Body::empty()),
        },
        Err(_) => (None, body),
    };

    let Some(token) = token else {
        warn!(txn = %txn, "unauthorized: invalid credentials");
        return StatusCode::UNAUTHORIZED.into_response();
    };

    if token::is_banned(&token) {
        info!(txn = %txn, "unauthorized: banned token");
        metrics::BANNISH_REQUESTS.with_label_values(&[token.as_str()]).inc();
        tokio::time::sleep(state.conf.bannishment_duration).await;
        return StatusCode::UNAUTHORIZED.into_response();
    }

    parts.extensions.insert(IngestToken(token));

    next.run(Request::from_parts(parts, body)).await
}

fn is_form(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.starts_with("application/x-www-form-urlencoded"))
}
