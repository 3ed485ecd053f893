//! Streaming sessions to the sink `/api/v0/update` endpoint, and the
//! classification of everything that can go wrong with them.

use std::sync::Arc;

use anyhow::Context as _;
use bytes::Bytes;
use futures::StreamExt as _;
use lazy_static::lazy_static;
use parking_lot::Mutex;
use regex::Regex;
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderValue};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use url::Url;

use crate::config::Conf;
use crate::metrics;

/// In-flight chunks between the parsers and the upstream request body.
/// Writes block once the sink stops draining, which is the only
/// backpressure this service applies.
const SESSION_PIPE_DEPTH: usize = 16;

/// Closed taxonomy of sink failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum WarpError {
    #[error("Invalid token: {token}")]
    InvalidToken { token: String },
    #[error("Token expired: {token}")]
    ExpiredToken { token: String },
    #[error("Revoked token: {token}")]
    RevokedToken { token: String },
    #[error("MADS exceeded: {limit}")]
    MadsExceeded { app: String, limit: String, body: String },
    #[error("DDP exceeded: {limit}")]
    DdpExceeded { app: String, limit: String, body: String },
    #[error("Invalid input: {input}")]
    Input { input: String, body: String },
    #[error("Invalid application: {input}")]
    Gone { input: String, body: String },
    #[error("sink timeout: {0}")]
    Timeout(String),
    #[error("sink unavailable: {0}")]
    Unavailable(String),
    #[error("unprocessable payload: {0}")]
    Unprocessable(String),
    #[error("{0}")]
    Upstream(String),
}

lazy_static! {
    static ref MADS_RE: Regex = Regex::new(
        r"Monthly Active Data Streams limit(?: for application (?:&apos;|.)([^\(]*?)(?:&apos;|.)) \((\d+)(.\d+)?(E-\d)?\). \(Geo Time Series"
    )
    .expect("mads pattern");
    static ref DDP_APP_RE: Regex = Regex::new(r"[,{]\.app=(.*?)[,}]").expect("ddp app pattern");
    static ref DDP_RATE_RE: Regex =
        Regex::new(r"Current maximum rate is \((\d+)(.\d+)?(E-\d)?\) datapoints/s").expect("ddp rate pattern");
    static ref PARSE_ERROR_RE: Regex =
        Regex::new(r"<pre>\s*Parse error at &apos;(.*)&apos;</pre>").expect("parse error pattern");
    static ref INPUT_STRING_RE: Regex =
        Regex::new(r"<pre>\s*For input string: &quot;(.*)&quot;</pre>").expect("input string pattern");
}

/// Map a raw sink failure (response body or transport error text) to a typed
/// error. This table is the single place where sink errors are recognized;
/// the sink answers with HTML or free text, so it is substring and regex
/// matching all the way down.
pub fn classify(token: &str, raw: &str) -> WarpError {
    let body = raw.replace('\n', " ");

    if raw.contains("broken pipe") || raw.contains("Broken pipe") {
        metrics::ERROR_BROKEN_PIPE.inc();
    }
    if raw.contains("Connection reset by peer") || raw.contains("connection reset") {
        metrics::ERROR_CONNRESET.inc();
    }

    if raw.contains("io.warp10.script.WarpScriptException: Invalid token") {
        return WarpError::InvalidToken { token: token.to_owned() };
    }
    if raw.contains("io.warp10.script.WarpScriptException: Write token missing") {
        return WarpError::InvalidToken {
            token: "Write token missing".to_owned(),
        };
    }
    if raw.contains("io.warp10.script.WarpScriptException: Token Expired") {
        return WarpError::ExpiredToken { token: token.to_owned() };
    }
    if raw.contains("io.warp10.script.WarpScriptException: Token revoked") {
        return WarpError::RevokedToken { token: token.to_owned() };
    }

    if raw.contains("exceed your Monthly Active Data Streams limit")
        || raw.contains("exceed the Monthly Active Data Streams limit")
    {
        let (app, limit) = match MADS_RE.captures(&body) {
            Some(caps) => (
                caps.get(1).map(|m| m.as_str().to_owned()).unwrap_or_default(),
                caps.get(2)
                    .map(|m| m.as_str().to_owned())
                    .unwrap_or_else(|| "-1".to_owned()),
            ),
            None => (String::new(), "-1".to_owned()),
        };

        metrics::ERROR_MADS.with_label_values(&[app.as_str()]).inc();

        return WarpError::MadsExceeded { app, limit, body };
    }

    if raw.contains("Daily Data Points limit being already exceeded") {
        let app = DDP_APP_RE
            .captures(raw)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().to_owned())
            .unwrap_or_default();

        let (limit, body) = match DDP_RATE_RE.captures(raw) {
            Some(caps) => (
                caps.get(1)
                    .map(|m| m.as_str().to_owned())
                    .unwrap_or_else(|| "-1".to_owned()),
                caps.get(0).map(|m| m.as_str().to_owned()).unwrap_or(body),
            ),
            None => ("-1".to_owned(), body),
        };

        metrics::ERROR_DDP.with_label_values(&[app.as_str()]).inc();

        return WarpError::DdpExceeded { app, limit, body };
    }

    if raw.contains("Parse error at") {
        let input = PARSE_ERROR_RE
            .captures(raw)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().to_owned())
            .unwrap_or_default();
        return WarpError::Input { input, body };
    }

    if raw.contains("Application suspended or closed") {
        return WarpError::Gone {
            input: "Application suspended or closed".to_owned(),
            body,
        };
    }

    if raw.contains("For input string") {
        let input = INPUT_STRING_RE
            .captures(raw)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().to_owned())
            .unwrap_or_default();
        return WarpError::Input { input, body };
    }

    if raw.contains("Client.Timeout")
        || raw.contains("operation timed out")
        || raw.contains("408 Request Time-out")
        || raw.starts_with("status 408")
        || raw.contains("transport connection broken")
    {
        return WarpError::Timeout(body);
    }

    if raw.contains("Error 503: server unavailable") {
        return WarpError::Unavailable(body);
    }

    if raw.contains("EOF") {
        return WarpError::Unprocessable(body);
    }

    WarpError::Upstream(body)
}

/// Shared HTTP plumbing towards the sink, built once at startup and cloned
/// into every listener.
#[derive(Clone)]
pub struct WarpConnector {
    client: reqwest::Client,
    update_url: Url,
}

impl WarpConnector {
    pub fn new(conf: &Conf) -> anyhow::Result<Self> {
        // reqwest has no dedicated TLS handshake timeout, the TLS budget is
        // folded into the connect budget
        let connect_timeout = conf.connection.dial_timeout + conf.connection.tls_timeout;

        let client = reqwest::Client::builder()
            .timeout(conf.connection.timeout)
            .connect_timeout(connect_timeout)
            .pool_idle_timeout(conf.connection.keep_alive_timeout)
            .pool_max_idle_per_host(conf.connection.idle_max)
            .build()
            .context("failed to build the sink HTTP client")?;

        let update_url = Url::parse(&format!(
            "{}/api/v0/update",
            conf.warp_endpoint.as_str().trim_end_matches('/')
        ))
        .context("invalid sink endpoint")?;

        Ok(Self { client, update_url })
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    /// Open one streaming update session.
    ///
    /// The `#\r\n` priming write makes the load-balancer in front of the
    /// sink see payload bytes as soon as the TCP session is established;
    /// without it, requests that dialed but did not write yet are answered
    /// with spurious 408s.
    pub fn open(&self, token: &str, txn: &str, now: Option<&str>) -> Result<WarpSession, WarpError> {
        let as_header = |value: &str| HeaderValue::from_str(value).map_err(|error| WarpError::Upstream(error.to_string()));

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));

        let token_value = as_header(token)?;
        headers.insert("X-Warp10-Token", token_value.clone());
        headers.insert("X-CityzenData-Token", token_value);
        headers.insert("Txn", as_header(txn)?);
        if let Some(now) = now {
            headers.insert("X-Warp10-Now", as_header(now)?);
        }

        let (tx, rx) = mpsc::channel::<Bytes>(SESSION_PIPE_DEPTH);
        let terminal: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));

        let body = reqwest::Body::wrap_stream(ReceiverStream::new(rx).map(Ok::<_, std::io::Error>));
        let request = self.client.post(self.update_url.clone()).headers(headers).body(body);

        let reader = tokio::spawn({
            let terminal = Arc::clone(&terminal);
            async move {
                match request.send().await {
                    Err(error) => {
                        *terminal.lock() = Some(format!("{:#}", anyhow::Error::new(error)));
                    }
                    Ok(response) => {
                        let status = response.status();
                        match response.text().await {
                            Err(error) => {
                                *terminal.lock() = Some(format!("{:#}", anyhow::Error::new(error)));
                            }
                            Ok(body) if !status.is_success() => {
                                *terminal.lock() = Some(format!("status {} - {}", status.as_u16(), body));
                            }
                            Ok(_) => {}
                        }
                    }
                }
            }
        });

        let _ = tx.try_send(Bytes::from_static(b"#\r\n"));

        Ok(WarpSession {
            token: token.to_owned(),
            tx,
            terminal,
            reader,
        })
    }
}

/// One per-request streaming connection to the sink.
///
/// The writer half is this struct; the reader half is a task driving the
/// HTTP exchange and recording its terminal error. Dropping the writer (in
/// [`WarpSession::close`]) is the EOF signal the reader waits for.
pub struct WarpSession {
    token: String,
    tx: mpsc::Sender<Bytes>,
    terminal: Arc<Mutex<Option<String>>>,
    reader: JoinHandle<()>,
}

impl WarpSession {
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Append encoded points to the upstream body.
    ///
    /// The write itself is best-effort: once the sink has failed, the pipe
    /// is gone and writes vanish, but the reader task's terminal error is
    /// the authoritative signal and is consulted both before and after the
    /// write.
    pub async fn send(&mut self, bytes: Bytes) -> Result<(), WarpError> {
        if let Some(error) = self.terminal_error() {
            return Err(error);
        }

        let _ = self.tx.send(bytes).await;

        match self.terminal_error() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Close the writer half and wait for the sink's verdict. All bytes
    /// passed to `send` are presented to the sink, in order, before it sees
    /// EOF.
    pub async fn close(self) -> Result<(), WarpError> {
        let Self { token, tx, terminal, reader } = self;

        drop(tx);
        let _ = reader.await;

        let guard = terminal.lock();
        match guard.as_deref() {
            Some(raw) => Err(classify(&token, raw)),
            None => Ok(()),
        }
    }

    fn terminal_error(&self) -> Option<WarpError> {
        self.terminal.lock().as_deref().map(|raw| classify(&self.token, raw))
    }
}
