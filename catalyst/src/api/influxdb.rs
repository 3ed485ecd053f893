//! InfluxDB 1.x line-protocol intake. Each line may define several fields;
//! one point is emitted per field, named `measurement.field`.

use async_trait::async_trait;
use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use indexmap::IndexMap;
use prometheus::IntCounter;
use tokio::io::AsyncBufReadExt as _;

use crate::AppState;
use crate::ingest::{self, Catalyser, IngestError, IngestRequest, PointSink};
use crate::middleware::Txn;
use crate::point::{self, Point, Value};

pub const INFLUXDB_VERSION: &str = "1.4.x";

pub async fn handler(State(state): State<AppState>, request: Request) -> Response {
    ingest::run::<InfluxDb>(&state, request).await
}

/// `GET /influxdb/ping`
pub async fn ping(request: Request) -> Response {
    let txn = request.extensions().get::<Txn>().cloned().unwrap_or_default();

    (
        StatusCode::NO_CONTENT,
        [("X-Influxdb-Version", INFLUXDB_VERSION), ("Request-Id", txn.as_str())],
    )
        .into_response()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Precision {
    Nanos,
    Micros,
    Millis,
    Seconds,
    Minutes,
    Hours,
}

impl Precision {
    fn from_query(raw: Option<&str>) -> Self {
        match raw {
            Some("u") => Precision::Micros,
            Some("ms") => Precision::Millis,
            Some("s") => Precision::Seconds,
            Some("m") => Precision::Minutes,
            Some("h") => Precision::Hours,
            _ => Precision::Nanos,
        }
    }

    fn nanos_multiplier(self) -> i64 {
        match self {
            Precision::Nanos => 1,
            Precision::Micros => 1_000,
            Precision::Millis => 1_000_000,
            Precision::Seconds => 1_000_000_000,
            Precision::Minutes => 60 * 1_000_000_000,
            Precision::Hours => 3_600 * 1_000_000_000,
        }
    }
}

pub struct InfluxDb;

#[async_trait]
impl Catalyser for InfluxDb {
    const PROTOCOL: &'static str = "influxdb";
    const SUCCESS: StatusCode = StatusCode::NO_CONTENT;

    async fn ingest(
        req: IngestRequest,
        sink: &mut dyn PointSink,
        datapoints: &IntCounter,
    ) -> Result<u64, IngestError> {
        let precision = Precision::from_query(ingest::query_param(&req.uri, "precision").as_deref());

        let mut count = 0_u64;
        let mut lines = req.body.lines();

        while let Some(line) = lines.next_line().await? {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let points = parse_points(line, precision).map_err(IngestError::Influx)?;
            for datapoint in points {
                sink.send(datapoint.encode()).await?;
                datapoints.inc();
                count += 1;
            }
        }

        Ok(count)
    }
}

/// Parse one line-protocol entry into one point per field.
fn parse_points(line: &str, precision: Precision) -> Result<Vec<Point>, String> {
    let bytes = line.as_bytes();

    let key_end =
        find_unescaped_space(bytes, 0).ok_or_else(|| format!("unable to parse '{line}': missing fields"))?;
    let (name, labels) = parse_key(&line[..key_end], line)?;

    let fields_start = key_end + 1;
    let fields_end = find_field_set_end(bytes, fields_start);
    let fields = parse_fields(&line[fields_start..fields_end], line)?;
    if fields.is_empty() {
        return Err(format!("unable to parse '{line}': missing fields"));
    }

    let timestamp_nanos = match line[fields_end..].trim() {
        "" => truncated_now(precision),
        raw => raw
            .parse::<i64>()
            .map_err(|_| format!("unable to parse '{line}': bad timestamp"))?
            .saturating_mul(precision.nanos_multiplier()),
    };

    let ts = (timestamp_nanos / 1_000) as f64;

    Ok(fields
        .into_iter()
        .map(|(field, value)| Point {
            ts,
            name: format!("{name}.{field}"),
            labels: labels.clone(),
            value,
        })
        .collect())
}

fn truncated_now(precision: Precision) -> i64 {
    let now = point::now_nanos();
    let step = precision.nanos_multiplier();
    now - now % step
}

fn find_unescaped_space(bytes: &[u8], start: usize) -> Option<usize> {
    let mut idx = start;
    while idx < bytes.len() {
        match bytes[idx] {
            b'\\' => idx += 2,
            b' ' => return Some(idx),
            _ => idx += 1,
        }
    }
    None
}

/// End of the field set: the first space that is neither escaped nor inside
/// a quoted string value.
fn find_field_set_end(bytes: &[u8], start: usize) -> usize {
    let mut idx = start;
    let mut in_string = false;
    while idx < bytes.len() {
        match bytes[idx] {
            b'\\' => idx += 2,
            b'"' => {
                in_string = !in_string;
                idx += 1;
            }
            b' ' if !in_string => return idx,
            _ => idx += 1,
        }
    }
    bytes.len()
}

fn parse_key(key: &str, line: &str) -> Result<(String, IndexMap<String, String>), String> {
    let mut segments = split_unescaped(key, b',').into_iter();

    let measurement = segments.next().unwrap_or_default();
    if measurement.is_empty() {
        return Err(format!("unable to parse '{line}': missing measurement"));
    }

    let mut labels = IndexMap::new();
    for tag in segments {
        let mut pair = split_unescaped(tag, b'=').into_iter();
        let tag_key = pair.next().unwrap_or_default();
        let tag_value = pair.next().unwrap_or_default();
        if tag_key.is_empty() || tag_value.is_empty() {
            return Err(format!("unable to parse '{line}': bad tag"));
        }
        labels.insert(unescape(tag_key), unescape(tag_value));
    }

    Ok((unescape(measurement), labels))
}

fn parse_fields(raw: &str, line: &str) -> Result<Vec<(String, Value)>, String> {
    let bytes = raw.as_bytes();
    let mut fields = Vec::new();
    let mut start = 0;
    let mut idx = 0;
    let mut in_string = false;

    while idx <= bytes.len() {
        let at_separator = idx == bytes.len() || (bytes[idx] == b',' && !in_string);
        if at_separator {
            let segment = &raw[start..idx];
            if segment.is_empty() {
                if !(start == 0 && idx == bytes.len()) {
                    return Err(format!("unable to parse '{line}': bad field"));
                }
            } else {
                fields.push(parse_field(segment, line)?);
            }
            start = idx + 1;
            idx += 1;
            continue;
        }

        match bytes[idx] {
            b'\\' => idx = (idx + 2).min(bytes.len()),
            b'"' => {
                in_string = !in_string;
                idx += 1;
            }
            _ => idx += 1,
        }
    }

    Ok(fields)
}

fn parse_field(segment: &str, line: &str) -> Result<(String, Value), String> {
    let bytes = segment.as_bytes();
    let mut idx = 0;
    let mut split_at = None;
    while idx < bytes.len() {
        match bytes[idx] {
            b'\\' => idx += 2,
            b'=' => {
                split_at = Some(idx);
                break;
            }
            _ => idx += 1,
        }
    }

    let split_at = split_at.ok_or_else(|| format!("unable to parse '{line}': bad field"))?;
    let key = unescape(&segment[..split_at]);
    let raw_value = &segment[split_at + 1..];
    if key.is_empty() || raw_value.is_empty() {
        return Err(format!("unable to parse '{line}': bad field"));
    }

    Ok((key, parse_field_value(raw_value, line)?))
}

fn parse_field_value(raw: &str, line: &str) -> Result<Value, String> {
    if raw.starts_with('"') {
        if raw.len() < 2 || !raw.ends_with('"') {
            return Err(format!("unable to parse '{line}': unbalanced quotes"));
        }
        return Ok(Value::Str(unescape(&raw[1..raw.len() - 1])));
    }

    if let Some(integer) = raw.strip_suffix('i') {
        return integer
            .parse::<i64>()
            .map(Value::Int)
            .map_err(|_| format!("unable to parse '{line}': bad integer"));
    }
    if let Some(unsigned) = raw.strip_suffix('u') {
        return unsigned
            .parse::<u64>()
            .map(|value| Value::Int(value as i64))
            .map_err(|_| format!("unable to parse '{line}': bad unsigned integer"));
    }

    match raw {
        "t" | "T" | "true" | "True" | "TRUE" => return Ok(Value::Bool(true)),
        "f" | "F" | "false" | "False" | "FALSE" => return Ok(Value::Bool(false)),
        _ => {}
    }

    raw.parse::<f64>()
        .map(Value::Float)
        .map_err(|_| format!("unable to parse '{line}': bad field value"))
}

fn split_unescaped(input: &str, separator: u8) -> Vec<&str> {
    let bytes = input.as_bytes();
    let mut segments = Vec::new();
    let mut start = 0;
    let mut idx = 0;

    while idx < bytes.len() {
        match bytes[idx] {
            b'\\' => idx += 2,
            byte if byte == separator => {
                segments.push(&input[start..idx]);
                start = idx + 1;
                idx += 1;
            }
            _ => idx += 1,
        }
    }

    segments.push(&input[start.min(input.len())..]);
    segments
}

fn unescape(input: &str) -> String {
    if !input.contains('\\') {
        return input.to_owned();
    }

    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some(next @ (',' | '=' | ' ' | '"' | '\\')) => out.push(next),
            Some(next) => {
                out.push('\\');
                out.push(next);
            }
            None => out.push('\\'),
        }
    }
    out
}
