//! Prometheus exposition intake, text or protobuf framing selected by the
//! request Content-Type. Extra labels can be appended through the URL path:
//! `/prometheus/dc/gra/host/web-1` carries `dc=gra,host=web-1`.

use std::io;

use async_trait::async_trait;
use axum::extract::{Request, State};
use axum::http::{StatusCode, header};
use axum::response::Response;
use indexmap::IndexMap;
use prometheus::IntCounter;
use prost::Message as _;
use tokio::io::{AsyncBufReadExt as _, AsyncReadExt as _};

use crate::AppState;
use crate::ingest::{self, BodyReader, Catalyser, IngestError, IngestRequest, ParsingError, PointSink};
use crate::point::{self, Point, Value};

pub async fn handler(State(state): State<AppState>, request: Request) -> Response {
    ingest::run::<Prometheus>(&state, request).await
}

pub struct Prometheus;

#[async_trait]
impl Catalyser for Prometheus {
    const PROTOCOL: &'static str = "prometheus";
    const SUCCESS: StatusCode = StatusCode::ACCEPTED;

    async fn ingest(
        req: IngestRequest,
        sink: &mut dyn PointSink,
        datapoints: &IntCounter,
    ) -> Result<u64, IngestError> {
        let extra = path_labels(req.uri.path())?;
        let now_ms = point::now_millis();

        let protobuf = req
            .headers
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .is_some_and(is_protobuf);

        if protobuf {
            return ingest_protobuf(req.body, &extra, now_ms, sink, datapoints).await;
        }

        let mut count = 0_u64;
        let mut lines = req.body.lines();

        while let Some(line) = lines.next_line().await? {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let sample =
                parse_sample(line).map_err(|message| ParsingError::new("Invalid format", format!("{message}: {line}")))?;

            if let Some(datapoint) = sample_point(sample, &extra, now_ms) {
                sink.send(datapoint.encode()).await?;
                datapoints.inc();
                count += 1;
            }
        }

        Ok(count)
    }
}

struct Sample {
    name: String,
    labels: IndexMap<String, String>,
    value: f64,
    timestamp_ms: Option<i64>,
}

/// Non-finite samples are never forwarded; the timestamp defaults to the
/// request clock; path labels override scraped ones.
fn sample_point(sample: Sample, extra: &IndexMap<String, String>, now_ms: i64) -> Option<Point> {
    if sample.value.is_infinite() || sample.value.is_nan() {
        return None;
    }

    let mut labels = sample.labels;
    for (key, value) in extra {
        labels.insert(key.clone(), value.clone());
    }

    Some(Point {
        ts: sample.timestamp_ms.unwrap_or(now_ms) as f64 * 1_000.0,
        name: sample.name,
        labels,
        value: Value::Float(sample.value),
    })
}

fn path_labels(path: &str) -> Result<IndexMap<String, String>, IngestError> {
    let mut trimmed = path;
    trimmed = trimmed.strip_prefix("/prometheus").unwrap_or(trimmed);
    trimmed = trimmed.strip_prefix("/metrics").unwrap_or(trimmed);
    let trimmed = trimmed.trim_matches('/');

    let mut labels = IndexMap::new();
    if trimmed.is_empty() {
        return Ok(labels);
    }

    let segments: Vec<&str> = trimmed.split('/').collect();
    if segments.len() % 2 != 0 {
        return Err(IngestError::PathLabels(format!(
            "bad number of labels in URL (must be even but got {} entries)",
            segments.len()
        )));
    }

    for pair in segments.chunks(2) {
        labels.insert(pair[0].to_owned(), pair[1].to_owned());
    }

    Ok(labels)
}

fn is_protobuf(content_type: &str) -> bool {
    content_type.starts_with("application/vnd.google.protobuf")
        && content_type.contains("proto=io.prometheus.client.MetricFamily")
}

/// One text exposition sample: `name{k="v",…} value [timestamp_ms]`.
fn parse_sample(line: &str) -> Result<Sample, String> {
    let name_end = line
        .as_bytes()
        .iter()
        .position(|&byte| byte == b'{' || byte == b' ' || byte == b'\t')
        .unwrap_or(line.len());

    let name = line[..name_end].to_owned();
    if name.is_empty() {
        return Err("missing metric name".to_owned());
    }

    let (labels, rest) = if line[name_end..].starts_with('{') {
        let (labels, used) = parse_labels(&line[name_end..])?;
        (labels, &line[name_end + used..])
    } else {
        (IndexMap::new(), &line[name_end..])
    };

    let mut parts = rest.split_ascii_whitespace();

    let value = parts.next().ok_or_else(|| "missing sample value".to_owned())?;
    let value = parse_sample_value(value)?;

    let timestamp_ms = match parts.next() {
        Some(raw) => Some(raw.parse::<i64>().map_err(|_| "bad sample timestamp".to_owned())?),
        None => None,
    };

    if parts.next().is_some() {
        return Err("trailing data after the sample".to_owned());
    }

    Ok(Sample {
        name,
        labels,
        value,
        timestamp_ms,
    })
}

fn parse_sample_value(raw: &str) -> Result<f64, String> {
    match raw {
        "+Inf" | "Inf" => Ok(f64::INFINITY),
        "-Inf" => Ok(f64::NEG_INFINITY),
        "NaN" => Ok(f64::NAN),
        other => other.parse::<f64>().map_err(|_| format!("bad sample value '{other}'")),
    }
}

/// Parse a `{k="v",…}` block; `block` starts at the opening brace. Returns
/// the labels and the byte length consumed, closing brace included.
fn parse_labels(block: &str) -> Result<(IndexMap<String, String>, usize), String> {
    let bytes = block.as_bytes();
    let mut labels = IndexMap::new();
    let mut idx = 1;

    loop {
        while idx < bytes.len() && matches!(bytes[idx], b',' | b' ' | b'\t') {
            idx += 1;
        }
        if idx >= bytes.len() {
            return Err("unterminated label set".to_owned());
        }
        if bytes[idx] == b'}' {
            return Ok((labels, idx + 1));
        }

        let name_start = idx;
        while idx < bytes.len() && bytes[idx] != b'=' {
            idx += 1;
        }
        if idx >= bytes.len() {
            return Err("missing label value".to_owned());
        }
        let name = block[name_start..idx].trim().to_owned();
        idx += 1;

        while idx < bytes.len() && matches!(bytes[idx], b' ' | b'\t') {
            idx += 1;
        }
        if idx >= bytes.len() || bytes[idx] != b'"' {
            return Err("label value must be quoted".to_owned());
        }
        idx += 1;

        let mut value = String::new();
        loop {
            if idx >= bytes.len() {
                return Err("unterminated label value".to_owned());
            }
            match bytes[idx] {
                b'\\' => {
                    idx += 1;
                    match bytes.get(idx) {
                        Some(b'n') => value.push('\n'),
                        Some(b'\\') => value.push('\\'),
                        Some(b'"') => value.push('"'),
                        Some(&other) => {
                            value.push('\\');
                            value.push(other as char);
                        }
                        None => return Err("unterminated label value".to_owned()),
                    }
                    idx += 1;
                }
                b'"' => {
                    idx += 1;
                    break;
                }
                _ => {
                    let ch = block[idx..]
                        .chars()
                        .next()
                        .ok_or_else(|| "invalid label value".to_owned())?;
                    value.push(ch);
                    idx += ch.len_utf8();
                }
            }
        }

        labels.insert(name, value);
    }
}

/// Protobuf exposition: varint length-delimited `MetricFamily` messages.
async fn ingest_protobuf(
    mut body: BodyReader,
    extra: &IndexMap<String, String>,
    now_ms: i64,
    sink: &mut dyn PointSink,
    datapoints: &IntCounter,
) -> Result<u64, IngestError> {
    let mut count = 0_u64;

    while let Some(len) = read_varint(&mut body).await? {
        let mut frame = vec![0_u8; len];
        body.read_exact(&mut frame).await?;

        let family = proto::MetricFamily::decode(frame.as_slice())
            .map_err(|error| ParsingError::new("Invalid format", error.to_string()))?;

        for sample in extract_samples(&family) {
            if let Some(datapoint) = sample_point(sample, extra, now_ms) {
                sink.send(datapoint.encode()).await?;
                datapoints.inc();
                count += 1;
            }
        }
    }

    Ok(count)
}

async fn read_varint(body: &mut BodyReader) -> Result<Option<usize>, IngestError> {
    let mut value = 0_u64;
    let mut shift = 0_u32;
    let mut first = true;

    loop {
        let mut byte = [0_u8; 1];
        match body.read_exact(&mut byte).await {
            Ok(_) => {}
            Err(error) if first && error.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(error) => return Err(error.into()),
        }

        value |= u64::from(byte[0] & 0x7f) << shift;
        if byte[0] & 0x80 == 0 {
            return Ok(Some(value as usize));
        }

        shift += 7;
        if shift > 63 {
            return Err(ParsingError::new("Invalid format", "varint overflow").into());
        }
        first = false;
    }
}

/// Flatten one family into raw samples, the way the exposition formats
/// define it: summaries and histograms expand into quantile/bucket series
/// plus `_sum` and `_count`.
fn extract_samples(family: &proto::MetricFamily) -> Vec<Sample> {
    let name = family.name.clone().unwrap_or_default();
    let kind = proto::MetricType::try_from(family.r#type.unwrap_or(0)).unwrap_or(proto::MetricType::Untyped);

    let mut samples = Vec::new();

    for metric in &family.metric {
        let labels: IndexMap<String, String> = metric
            .label
            .iter()
            .map(|pair| {
                (
                    pair.name.clone().unwrap_or_default(),
                    pair.value.clone().unwrap_or_default(),
                )
            })
            .collect();
        let timestamp_ms = metric.timestamp_ms;

        let mut push = |name: String, labels: IndexMap<String, String>, value: f64| {
            samples.push(Sample {
                name,
                labels,
                value,
                timestamp_ms,
            });
        };

        match kind {
            proto::MetricType::Counter => {
                push(name.clone(), labels, metric.counter.as_ref().and_then(|c| c.value).unwrap_or(0.0));
            }
            proto::MetricType::Gauge => {
                push(name.clone(), labels, metric.gauge.as_ref().and_then(|g| g.value).unwrap_or(0.0));
            }
            proto::MetricType::Untyped => {
                push(name.clone(), labels, metric.untyped.as_ref().and_then(|u| u.value).unwrap_or(0.0));
            }
            proto::MetricType::Summary => {
                let summary = metric.summary.clone().unwrap_or_default();
                for quantile in &summary.quantile {
                    let mut labels = labels.clone();
                    labels.insert("quantile".to_owned(), render_float(quantile.quantile.unwrap_or(0.0)));
                    push(name.clone(), labels, quantile.value.unwrap_or(0.0));
                }
                push(format!("{name}_sum"), labels.clone(), summary.sample_sum.unwrap_or(0.0));
                push(format!("{name}_count"), labels, summary.sample_count.unwrap_or(0) as f64);
            }
            proto::MetricType::Histogram => {
                let histogram = metric.histogram.clone().unwrap_or_default();
                let mut saw_inf = false;
                for bucket in &histogram.bucket {
                    let upper = bucket.upper_bound.unwrap_or(0.0);
                    saw_inf = saw_inf || upper.is_infinite();
                    let mut labels = labels.clone();
                    labels.insert("le".to_owned(), render_float(upper));
                    push(
                        format!("{name}_bucket"),
                        labels,
                        bucket.cumulative_count.unwrap_or(0) as f64,
                    );
                }
                if !saw_inf {
                    let mut labels = labels.clone();
                    labels.insert("le".to_owned(), "+Inf".to_owned());
                    push(
                        format!("{name}_bucket"),
                        labels,
                        histogram.sample_count.unwrap_or(0) as f64,
                    );
                }
                push(format!("{name}_sum"), labels.clone(), histogram.sample_sum.unwrap_or(0.0));
                push(format!("{name}_count"), labels, histogram.sample_count.unwrap_or(0) as f64);
            }
        }
    }

    samples
}

fn render_float(value: f64) -> String {
    if value == f64::INFINITY {
        "+Inf".to_owned()
    } else if value == f64::NEG_INFINITY {
        "-Inf".to_owned()
    } else {
        format!("{value}")
    }
}

/// Subset of `io.prometheus.client` needed to decode the protobuf
/// exposition format.
pub(crate) mod proto {
    #[derive(Clone, PartialEq, prost::Message)]
    pub struct LabelPair {
        #[prost(string, optional, tag = "1")]
        pub name: Option<String>,
        #[prost(string, optional, tag = "2")]
        pub value: Option<String>,
    }

    #[derive(Clone, Copy, PartialEq, prost::Message)]
    pub struct Gauge {
        #[prost(double, optional, tag = "1")]
        pub value: Option<f64>,
    }

    #[derive(Clone, Copy, PartialEq, prost::Message)]
    pub struct Counter {
        #[prost(double, optional, tag = "1")]
        pub value: Option<f64>,
    }

    #[derive(Clone, Copy, PartialEq, prost::Message)]
    pub struct Quantile {
        #[prost(double, optional, tag = "1")]
        pub quantile: Option<f64>,
        #[prost(double, optional, tag = "2")]
        pub value: Option<f64>,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct Summary {
        #[prost(uint64, optional, tag = "1")]
        pub sample_count: Option<u64>,
        #[prost(double, optional, tag = "2")]
        pub sample_sum: Option<f64>,
        #[prost(message, repeated, tag = "3")]
        pub quantile: Vec<Quantile>,
    }

    #[derive(Clone, Copy, PartialEq, prost::Message)]
    pub struct Untyped {
        #[prost(double, optional, tag = "1")]
        pub value: Option<f64>,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct Histogram {
        #[prost(uint64, optional, tag = "1")]
        pub sample_count: Option<u64>,
        #[prost(double, optional, tag = "2")]
        pub sample_sum: Option<f64>,
        #[prost(message, repeated, tag = "3")]
        pub bucket: Vec<Bucket>,
    }

    #[derive(Clone, Copy, PartialEq, prost::Message)]
    pub struct Bucket {
        #[prost(uint64, optional, tag = "1")]
        pub cumulative_count: Option<u64>,
        #[prost(double, optional, tag = "2")]
        pub upper_bound: Option<f64>,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct Metric {
        #[prost(message, repeated, tag = "1")]
        pub label: Vec<LabelPair>,
        #[prost(message, optional, tag = "2")]
        pub gauge: Option<Gauge>,
        #[prost(message, optional, tag = "3")]
        pub counter: Option<Counter>,
        #[prost(message, optional, tag = "4")]
        pub summary: Option<Summary>,
        #[prost(message, optional, tag = "5")]
        pub untyped: Option<Untyped>,
        #[prost(int64, optional, tag = "6")]
        pub timestamp_ms: Option<i64>,
        #[prost(message, optional, tag = "7")]
        pub histogram: Option<Histogram>,
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq, prost::Enumeration)]
    #[repr(i32)]
    pub enum MetricType {
        Counter = 0,
        Gauge = 1,
        Summary = 2,
        Untyped = 3,
        Histogram = 4,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct MetricFamily {
        #[prost(string, optional, tag = "1")]
        pub name: Option<String>,
        #[prost(string, optional, tag = "2")]
        pub help: Option<String>,
        #[prost(enumeration = "MetricType", optional, tag = "3")]
        pub r#type: Option<i32>,
        #[prost(message, repeated, tag = "4")]
        pub metric: Vec<Metric>,
    }
}
