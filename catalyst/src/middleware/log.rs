//! Transaction ids and request logging.

use std::fmt;
use std::time::Instant;

use axum::extract::Request;
use axum::middleware::Next;
use axum::response::Response;
use uuid::Uuid;

use crate::ingest::Datapoints;

/// Per-request correlation id, also forwarded to the sink in the `Txn`
/// header.
#[derive(Debug, Clone, Default)]
pub struct Txn(pub String);

impl Txn {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Txn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub async fn log_requests(mut request: Request, next: Next) -> Response {
    let txn = Txn(Uuid::new_v4().simple().to_string());
    request.extensions_mut().insert(txn.clone());

    let method = request.method().clone();
    let path = request.uri().path().to_owned();
    let started = Instant::now();

    let response = next.run(request).await;

    let datapoints = response
        .extensions()
        .get::<Datapoints>()
        .map(|datapoints| datapoints.0)
        .unwrap_or_default();

    info!(
        txn = %txn,
        %method,
        %path,
        status = response.status().as_u16(),
        datapoints,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "request served"
    );

    response
}
