//! Generic ingestion driver shared by every protocol endpoint: decompress,
//! authenticate, open a sink session, hand the body to the protocol
//! catalyser, close the session and map whatever failed onto an HTTP status.

use std::io;
use std::pin::Pin;

use async_compression::tokio::bufread::GzipDecoder;
use async_trait::async_trait;
use axum::body::Body;
use axum::http::{HeaderMap, Request, StatusCode, Uri, header};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures::TryStreamExt as _;
use prometheus::IntCounter;
use serde_json::json;
use thiserror::Error;
use tokio::io::{AsyncBufRead, BufReader};
use tokio_util::io::StreamReader;

use crate::AppState;
use crate::metrics;
use crate::middleware::{IngestToken, Txn};
use crate::token;
use crate::warp::{WarpError, WarpSession};

pub type BodyReader = Pin<Box<dyn AsyncBufRead + Send>>;

/// Malformed client payload, echoing the offending row.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("{msg}\n{row}")]
pub struct ParsingError {
    pub msg: String,
    pub row: String,
}

impl ParsingError {
    pub fn new(msg: impl Into<String>, row: impl Into<String>) -> Self {
        Self {
            msg: msg.into(),
            row: row.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    Parsing(#[from] ParsingError),
    #[error("{0}")]
    Influx(String),
    #[error("{0}")]
    PathLabels(String),
    #[error(transparent)]
    Warp(#[from] WarpError),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Snappy(#[from] snap::Error),
}

/// Where parsers push encoded points. Abstracted from [`WarpSession`] so the
/// parsers can be exercised without a live sink.
#[async_trait]
pub trait PointSink: Send {
    async fn send(&mut self, bytes: Bytes) -> Result<(), WarpError>;
}

#[async_trait]
impl PointSink for WarpSession {
    async fn send(&mut self, bytes: Bytes) -> Result<(), WarpError> {
        WarpSession::send(self, bytes).await
    }
}

/// Request data handed to a catalyser.
pub struct IngestRequest {
    pub uri: Uri,
    pub headers: HeaderMap,
    pub body: BodyReader,
}

/// One wire-format front end. Implementations stream the request body,
/// normalize the samples it carries and push their encodings into the sink.
#[async_trait]
pub trait Catalyser {
    const PROTOCOL: &'static str;
    const SUCCESS: StatusCode;

    async fn ingest(
        req: IngestRequest,
        sink: &mut dyn PointSink,
        datapoints: &IntCounter,
    ) -> Result<u64, IngestError>;

    /// Rewrite errors before they are mapped to a status, for
    /// protocol-specific quirks.
    fn on_error(error: IngestError) -> IngestError {
        error
    }
}

/// Number of datapoints a request carried, stashed on the response for the
/// request logging middleware.
#[derive(Debug, Clone, Copy)]
pub struct Datapoints(pub u64);

pub async fn run<C: Catalyser>(state: &AppState, request: Request<Body>) -> Response {
    metrics::PROTOCOL_REQUESTS.with_label_values(&[C::PROTOCOL]).inc();

    let (parts, body) = request.into_parts();

    let txn = parts.extensions.get::<Txn>().cloned().unwrap_or_default();

    let Some(IngestToken(token)) = parts.extensions.get::<IngestToken>().cloned() else {
        warn!(txn = %txn, "bad token");
        metrics::PROTOCOL_STATUS.with_label_values(&[C::PROTOCOL, "401"]).inc();
        return StatusCode::UNAUTHORIZED.into_response();
    };

    let now = parts
        .headers
        .get("X-Warp10-Now")
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned);

    let mut reader = body_reader(&parts.headers, body);

    if state.conf.dryrun {
        let mut stdout = tokio::io::stdout();
        if let Err(error) = tokio::io::copy_buf(&mut reader, &mut stdout).await {
            warn!(txn = %txn, %error, "failed to echo the request body");
        }
        return StatusCode::OK.into_response();
    }

    let mut session = match state.warp.open(&token, txn.as_str(), now.as_deref()) {
        Ok(session) => session,
        Err(error) => {
            error!(txn = %txn, %error, "unable to open a sink session");
            metrics::PROTOCOL_STATUS.with_label_values(&[C::PROTOCOL, "502"]).inc();
            return StatusCode::BAD_GATEWAY.into_response();
        }
    };

    let datapoint_counter = metrics::PROTOCOL_DATAPOINTS.with_label_values(&[C::PROTOCOL]);

    let req = IngestRequest {
        uri: parts.uri,
        headers: parts.headers,
        body: reader,
    };

    let mut datapoints = 0;
    let mut failure: Option<(StatusCode, String)> = None;

    match C::ingest(req, &mut session, &datapoint_counter).await {
        Ok(count) => datapoints = count,
        Err(error) => {
            failure = Some(handle_err(state, &txn, C::on_error(error)));
        }
    }

    if let Err(error) = session.close().await {
        let close_failure = handle_err(state, &txn, C::on_error(IngestError::Warp(error)));
        warn!(txn = %txn, code = close_failure.0.as_u16(), "failed to close the sink session");
        failure = Some(match failure {
            // a specific parser status beats a generic upstream failure
            Some(previous) if close_failure.0 == StatusCode::BAD_GATEWAY => previous,
            _ => close_failure,
        });
    }

    let (status, message) = match failure {
        Some((status, message)) => {
            metrics::PROTOCOL_STATUS
                .with_label_values(&[C::PROTOCOL, status.as_str()])
                .inc();
            (status, message)
        }
        None => (C::SUCCESS, String::new()),
    };

    let mut response = (status, message).into_response();
    response.extensions_mut().insert(Datapoints(datapoints));
    response
}

fn body_reader(headers: &HeaderMap, body: Body) -> BodyReader {
    let stream = body.into_data_stream().map_err(io::Error::other);
    let reader = StreamReader::new(stream);

    // "If the request body is compressed, the Content-Type header MUST be
    // set to the value application/gzip" (OpenTSDB); the others use
    // Content-Encoding.
    let gzipped = headers
        .get(header::CONTENT_ENCODING)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.eq_ignore_ascii_case("gzip"))
        || headers
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value == "application/gzip");

    if gzipped {
        Box::pin(BufReader::new(GzipDecoder::new(reader)))
    } else {
        Box::pin(reader)
    }
}

/// Map a typed failure to the response status and body, applying side
/// effects (banishment, quota counters are bumped at classification time).
fn handle_err(state: &AppState, txn: &Txn, error: IngestError) -> (StatusCode, String) {
    match error {
        IngestError::Warp(warp) => {
            let message = warp.to_string();

            match warp {
                WarpError::InvalidToken { token }
                | WarpError::ExpiredToken { token }
                | WarpError::RevokedToken { token } => {
                    warn!(txn = %txn, "bannish token");
                    token::bannish(&token);
                    (StatusCode::UNAUTHORIZED, String::new())
                }
                WarpError::MadsExceeded { app, limit, body } => {
                    warn!(txn = %txn, app, limit, body, "MADS limit reached");
                    (StatusCode::TOO_MANY_REQUESTS, message)
                }
                WarpError::DdpExceeded { app, limit, body } => {
                    warn!(txn = %txn, app, limit, body, "DDP limit reached");
                    (StatusCode::TOO_MANY_REQUESTS, message)
                }
                WarpError::Input { input, body } => {
                    error!(txn = %txn, metric = %input, body, "sink rejected the input");
                    (StatusCode::UNPROCESSABLE_ENTITY, message)
                }
                WarpError::Gone { input, body } => {
                    error!(txn = %txn, metric = %input, body, "application gone");
                    (StatusCode::GONE, message)
                }
                WarpError::Timeout(text) => {
                    warn!(txn = %txn, metric = "client.timeout", "sink timeout");
                    (StatusCode::REQUEST_TIMEOUT, text)
                }
                WarpError::Unavailable(text) => {
                    warn!(txn = %txn, metric = "service.unavailable", "sink unavailable");
                    (StatusCode::SERVICE_UNAVAILABLE, text)
                }
                WarpError::Unprocessable(text) => {
                    warn!(txn = %txn, metric = "eof", "truncated exchange with the sink");
                    (StatusCode::UNPROCESSABLE_ENTITY, text)
                }
                WarpError::Upstream(text) => {
                    error!(txn = %txn, body = %text, "sink failure");
                    (StatusCode::BAD_GATEWAY, text)
                }
            }
        }
        IngestError::Parsing(parsing) => {
            warn!(txn = %txn, metric = %parsing.row, "failed to parse a datapoint");
            (StatusCode::UNPROCESSABLE_ENTITY, parsing.to_string())
        }
        IngestError::Influx(message) => {
            warn!(txn = %txn, from = %state.conf.hostname, %message, "invalid line protocol");
            (StatusCode::BAD_REQUEST, json!({ "error": message }).to_string())
        }
        IngestError::PathLabels(message) => {
            warn!(txn = %txn, %message, "bad label path");
            (StatusCode::BAD_REQUEST, message)
        }
        IngestError::Io(error) => {
            warn!(txn = %txn, %error, "failed to read the payload");
            (StatusCode::UNPROCESSABLE_ENTITY, error.to_string())
        }
        IngestError::Snappy(error) => {
            error!(txn = %txn, %error, "could not decode the remote write payload");
            (StatusCode::UNPROCESSABLE_ENTITY, error.to_string())
        }
    }
}

/// First value of a query parameter, if any.
pub(crate) fn query_param(uri: &Uri, name: &str) -> Option<String> {
    let query = uri.query()?;
    serde_urlencoded::from_str::<Vec<(String, String)>>(query)
        .ok()?
        .into_iter()
        .find_map(|(key, value)| (key == name).then_some(value))
}
