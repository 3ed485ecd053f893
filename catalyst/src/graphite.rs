//! Graphite plaintext: line parsing shared by the HTTP endpoint and the
//! dedicated TCP listener, plus the listener itself.
//!
//! The TCP protocol has no headers to carry a credential, so the first line
//! of a connection inlines it: `<token>@.<metric> <value> [<timestamp>]`.
//! The remainder of that first line is already a metric.

use std::net::SocketAddr;
use std::time::Instant;

use anyhow::Context as _;
use indexmap::IndexMap;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt as _, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::Instrument as _;
use uuid::Uuid;

use crate::metrics;
use crate::point::{self, Point, Value};
use crate::warp::{WarpConnector, WarpSession};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LineError {
    #[error("bad metric format")]
    Format,
    #[error("bad metric part: timestamp")]
    Timestamp,
    #[error("bad metric part: tag")]
    Tag,
}

/// Parse one plaintext line: `name[;k=v;…] value [timestamp]`.
///
/// With `parse` set, the dotted name hierarchy is mapped onto labels keyed
/// by position, so `cpu.load` also carries `0=cpu,1=load`. Explicit `;k=v`
/// tags are applied on top.
pub fn parse_line(metric: &str, parse: bool) -> Result<Point, LineError> {
    let split: Vec<&str> = metric.split(' ').collect();

    if split.len() < 2 {
        return Err(LineError::Format);
    }

    let ts = if split.len() >= 3 {
        split[2].parse::<i64>().map_err(|_| LineError::Timestamp)?
    } else {
        point::now_millis()
    };

    let value = parse_value(split[1]);

    let (name, tags) = match split[0].split_once(';') {
        Some((name, tags)) => (name, Some(tags)),
        None => (split[0], None),
    };

    let mut labels = IndexMap::new();

    if parse {
        for (idx, part) in name.split('.').enumerate() {
            labels.insert(idx.to_string(), part.to_owned());
        }
    }

    if let Some(tags) = tags {
        for tag in tags.split(';') {
            let (key, value) = tag.split_once('=').ok_or(LineError::Tag)?;
            labels.insert(key.to_owned(), value.to_owned());
        }
    }

    Ok(Point {
        ts: point::epoch_micros(ts),
        name: name.to_owned(),
        labels,
        value,
    })
}

/// Value parse order: float (only when a dot is present), 64-bit integer,
/// boolean, else an opaque string.
fn parse_value(raw: &str) -> Value {
    if raw.contains('.') {
        if let Ok(number) = raw.parse::<f64>() {
            return Value::Float(number);
        }
    }

    if let Ok(number) = raw.parse::<i64>() {
        return Value::Int(number);
    }

    if raw.eq_ignore_ascii_case("true") {
        return Value::Bool(true);
    }
    if raw.eq_ignore_ascii_case("false") {
        return Value::Bool(false);
    }

    Value::Str(raw.to_owned())
}

/// Long-lived plaintext TCP intake.
pub struct GraphiteListener {
    listener: TcpListener,
    parse: bool,
    connector: WarpConnector,
}

impl GraphiteListener {
    pub async fn bind(addr: SocketAddr, parse: bool, connector: WarpConnector) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("cannot open graphite TCP listener ({addr})"))?;

        info!(%addr, "graphite TCP listener started");

        Ok(Self {
            listener,
            parse,
            connector,
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        self.listener.local_addr().context("graphite listener address")
    }

    /// Accept loop. Non-fatal accept errors are logged and the loop goes on;
    /// only losing the listener itself ends the task.
    pub async fn run(self) -> anyhow::Result<()> {
        loop {
            match self.listener.accept().await {
                Ok((stream, peer_addr)) => {
                    let parse = self.parse;
                    let connector = self.connector.clone();

                    tokio::spawn(
                        handle_connection(stream, parse, connector)
                            .instrument(info_span!("graphite_tcp", client = %peer_addr)),
                    );
                }
                Err(error) => {
                    warn!(%error, "error while accepting a TCP connection");
                }
            }
        }
    }
}

async fn handle_connection(stream: TcpStream, parse: bool, connector: WarpConnector) {
    metrics::GRAPHITE_TCP_REQUESTS.inc();

    let txn = Uuid::new_v4().simple().to_string();
    let started = Instant::now();

    let mut reader = BufReader::new(stream);
    let mut session: Option<WarpSession> = None;
    let mut prefix_len = 0;
    let mut datapoints = 0_u64;

    let mut line = String::new();
    loop {
        line.clear();
        let read = match reader.read_line(&mut line).await {
            Ok(read) => read,
            Err(error) => {
                metrics::GRAPHITE_TCP_ERRORS.inc();
                warn!(txn, %error, "unable to read TCP payload");
                if let Some(session) = session.take() {
                    let _ = session.close().await;
                }
                metrics::GRAPHITE_TCP_ELAPSED.inc_by(started.elapsed().as_secs_f64());
                return;
            }
        };

        if read == 0 {
            if let Some(session) = session.take() {
                if let Err(error) = session.close().await {
                    metrics::GRAPHITE_TCP_ERRORS.inc();
                    info!(txn, %error, "failed to close the sink session");
                    metrics::GRAPHITE_TCP_ELAPSED.inc_by(started.elapsed().as_secs_f64());
                    return;
                }
            }

            metrics::GRAPHITE_TCP_DATAPOINTS.inc_by(datapoints);
            metrics::GRAPHITE_TCP_OK.inc();
            metrics::GRAPHITE_TCP_ELAPSED.inc_by(started.elapsed().as_secs_f64());
            return;
        }

        let payload = line.trim();

        if session.is_none() {
            if payload.is_empty() {
                continue;
            }

            let token = match payload.split_once("@.") {
                Some((token, _)) if !token.is_empty() => token,
                _ => {
                    metrics::GRAPHITE_TCP_NOAUTH.inc();
                    return;
                }
            };

            prefix_len = token.len() + 2;

            match connector.open(token, &txn, None) {
                Ok(opened) => session = Some(opened),
                Err(error) => {
                    metrics::GRAPHITE_TCP_ERRORS.inc();
                    info!(txn, %error, "unable to open a sink session");
                    return;
                }
            }
        }

        let Some(session_ref) = session.as_mut() else {
            continue;
        };

        let metric = match payload.get(prefix_len..) {
            Some(metric) if !metric.is_empty() => metric,
            _ => continue,
        };

        let datapoint = match parse_line(metric, parse) {
            Ok(datapoint) => datapoint,
            Err(error) => {
                info!(txn, %error, metric, "unable to parse line");
                continue;
            }
        };

        if let Err(error) = session_ref.send(datapoint.encode()).await {
            metrics::GRAPHITE_TCP_ERRORS.inc();
            info!(txn, %error, metric, "sink write error");
            if let Some(session) = session.take() {
                let _ = session.close().await;
            }
            metrics::GRAPHITE_TCP_ELAPSED.inc_by(started.elapsed().as_secs_f64());
            return;
        }

        datapoints += 1;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("1", Value::Int(1))]
    #[case("-12", Value::Int(-12))]
    #[case("0.5", Value::Float(0.5))]
    #[case("42.0", Value::Float(42.0))]
    #[case("true", Value::Bool(true))]
    #[case("FALSE", Value::Bool(false))]
    #[case("up", Value::Str("up".to_owned()))]
    #[case("1e3", Value::Str("1e3".to_owned()))]
    fn value_parse_order(#[case] raw: &str, #[case] expected: Value) {
        let point = parse_line(&format!("cpu.load {raw} 1700000000"), false).unwrap();
        assert_eq!(point.value, expected);
    }

    #[test]
    fn hierarchy_becomes_positional_labels() {
        let point = parse_line("cpu.load 0.5 1700000000", true).unwrap();
        assert_eq!(point.name, "cpu.load");
        assert_eq!(point.ts, 1_700_000_000_000_000.0);
        assert_eq!(point.labels.get("0").map(String::as_str), Some("cpu"));
        assert_eq!(point.labels.get("1").map(String::as_str), Some("load"));
    }

    #[test]
    fn explicit_tags_are_parsed_and_hierarchy_still_applies() {
        let point = parse_line("cpu.load;dc=gra;host=web-1 1 1700000000", true).unwrap();
        assert_eq!(point.name, "cpu.load");
        assert_eq!(point.labels.get("0").map(String::as_str), Some("cpu"));
        assert_eq!(point.labels.get("dc").map(String::as_str), Some("gra"));
        assert_eq!(point.labels.get("host").map(String::as_str), Some("web-1"));
    }

    #[test]
    fn no_hierarchy_labels_when_parse_is_disabled() {
        let point = parse_line("cpu.load 1 1700000000", false).unwrap();
        assert!(point.labels.is_empty());
    }

    #[test]
    fn missing_timestamp_defaults_to_now() {
        let before = point::now_micros();
        let point = parse_line("cpu.load 1", false).unwrap();
        assert!(point.ts >= before);
    }

    #[rstest]
    #[case("cpu.load")]
    #[case("")]
    fn too_few_parts_is_a_format_error(#[case] metric: &str) {
        assert_eq!(parse_line(metric, true), Err(LineError::Format));
    }

    #[test]
    fn bad_timestamp_is_rejected() {
        assert_eq!(parse_line("cpu.load 1 not-a-ts", true), Err(LineError::Timestamp));
    }

    #[test]
    fn tag_without_value_is_rejected() {
        assert_eq!(parse_line("cpu.load;dc 1 1700000000", true), Err(LineError::Tag));
    }

    #[test]
    fn millisecond_timestamps_are_detected() {
        let point = parse_line("cpu.load 1 1700000000000", false).unwrap();
        assert_eq!(point.ts, 1_700_000_000_000_000.0);
    }
}
