//! OpenTSDB JSON intake: one datapoint object or an array of them, decoded
//! object by object without buffering the request.

use std::io;
use std::pin::Pin;

use async_trait::async_trait;
use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::response::Response;
use indexmap::IndexMap;
use prometheus::IntCounter;
use serde::Deserialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt as _};

use crate::AppState;
use crate::ingest::{self, Catalyser, IngestError, IngestRequest, ParsingError, PointSink};
use crate::point::{self, Point, Value};

pub async fn handler(State(state): State<AppState>, request: Request) -> Response {
    ingest::run::<OpenTsdb>(&state, request).await
}

/// Wire shape of one datapoint. Every field is optional on the wire; absent
/// fields keep their zero value, like the sink itself tolerates.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct DataPoint {
    metric: String,
    timestamp: i64,
    value: serde_json::Value,
    tags: IndexMap<String, String>,
}

impl From<DataPoint> for Point {
    fn from(dp: DataPoint) -> Self {
        Point {
            ts: point::epoch_micros(dp.timestamp),
            name: dp.metric,
            labels: dp.tags,
            value: Value::from_json(dp.value),
        }
    }
}

pub struct OpenTsdb;

#[async_trait]
impl Catalyser for OpenTsdb {
    const PROTOCOL: &'static str = "opentsdb";
    const SUCCESS: StatusCode = StatusCode::NO_CONTENT;

    async fn ingest(
        req: IngestRequest,
        sink: &mut dyn PointSink,
        datapoints: &IntCounter,
    ) -> Result<u64, IngestError> {
        let mut scanner = JsonScanner::new(req.body);

        // anything before the first brace or bracket is discarded
        let solo = loop {
            match scanner.peek().await? {
                None => return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "empty payload").into()),
                Some(b'{') => break true,
                Some(b'[') => break false,
                Some(_) => scanner.bump(),
            }
        };

        let mut count = 0_u64;

        if solo {
            let datapoint = scanner.next_point().await?;
            sink.send(datapoint.encode()).await?;
            datapoints.inc();
            count += 1;
            return Ok(count);
        }

        scanner.bump();
        loop {
            match scanner.peek().await? {
                Some(b']') => {
                    scanner.bump();
                    break;
                }
                Some(b',') => scanner.bump(),
                Some(byte) if byte.is_ascii_whitespace() => scanner.bump(),
                Some(b'{') => {
                    let datapoint = scanner.next_point().await?;
                    sink.send(datapoint.encode()).await?;
                    datapoints.inc();
                    count += 1;
                }
                Some(byte) => {
                    return Err(ParsingError::new(
                        format!("Failed to parse datapoint: unexpected character '{}'", byte as char),
                        "",
                    )
                    .into());
                }
                None => {
                    return Err(ParsingError::new("Failed to parse datapoint: unterminated array", "").into());
                }
            }
        }

        Ok(count)
    }
}

/// Byte-level scanner yielding balanced JSON objects out of a buffered
/// stream, so arrays of arbitrary length are handled in constant memory.
struct JsonScanner<R> {
    reader: R,
}

impl<R: AsyncBufRead + Send + Unpin> JsonScanner<R> {
    fn new(reader: R) -> Self {
        Self { reader }
    }

    async fn peek(&mut self) -> io::Result<Option<u8>> {
        let buf = self.reader.fill_buf().await?;
        Ok(buf.first().copied())
    }

    fn bump(&mut self) {
        Pin::new(&mut self.reader).consume(1);
    }

    async fn next_point(&mut self) -> Result<Point, IngestError> {
        let mut raw = Vec::new();
        self.read_object(&mut raw).await?;

        let datapoint: DataPoint = serde_json::from_slice(&raw)
            .map_err(|error| ParsingError::new(format!("Failed to parse datapoint: {error}"), ""))?;

        Ok(datapoint.into())
    }

    /// Append one balanced `{…}` value to `out`. The cursor must be on the
    /// opening brace.
    async fn read_object(&mut self, out: &mut Vec<u8>) -> Result<(), IngestError> {
        let mut depth = 0_u32;
        let mut in_string = false;
        let mut escaped = false;

        loop {
            let chunk = self.reader.fill_buf().await?;
            if chunk.is_empty() {
                return Err(ParsingError::new("Failed to parse datapoint - EOF", "").into());
            }

            let mut used = 0;
            let mut done = false;

            for &byte in chunk {
                used += 1;
                out.push(byte);

                if in_string {
                    if escaped {
                        escaped = false;
                    } else if byte == b'\\' {
                        escaped = true;
                    } else if byte == b'"' {
                        in_string = false;
                    }
                    continue;
                }

                match byte {
                    b'"' => in_string = true,
                    b'{' => depth += 1,
                    b'}' => {
                        depth = depth.saturating_sub(1);
                        if depth == 0 {
                            done = true;
                            break;
                        }
                    }
                    _ => {}
                }
            }

            Pin::new(&mut self.reader).consume(used);

            if done {
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use prometheus::IntCounter;

    use super::*;
    use crate::test_util::{RecordingSink, body, ingest_request};

    fn counter() -> IntCounter {
        crate::metrics::PROTOCOL_DATAPOINTS.with_label_values(&["opentsdb"])
    }

    #[tokio::test]
    async fn single_object_yields_one_point() {
        let mut sink = RecordingSink::default();
        let req = ingest_request("/opentsdb", body(br#"{"metric":"m","timestamp":1700000000,"value":7,"tags":{"h":"x"}}"#));

        let count = OpenTsdb::ingest(req, &mut sink, &counter()).await.unwrap();

        assert_eq!(count, 1);
        assert_eq!(sink.utf8_lines(), vec!["1700000000000000// m{h=x} 7\r\n"]);
    }

    #[tokio::test]
    async fn array_seconds_and_milliseconds_normalize_to_micros() {
        let mut sink = RecordingSink::default();
        let req = ingest_request(
            "/opentsdb",
            body(
                br#"[{"metric":"m","timestamp":1700000000,"value":7,"tags":{"h":"x"}},{"metric":"n","timestamp":1700000000000,"value":1.5,"tags":{}}]"#,
            ),
        );

        let count = OpenTsdb::ingest(req, &mut sink, &counter()).await.unwrap();

        assert_eq!(count, 2);
        assert_eq!(
            sink.utf8_lines(),
            vec![
                "1700000000000000// m{h=x} 7\r\n",
                "1700000000000000// n{} 1.500000\r\n",
            ]
        );
    }

    #[tokio::test]
    async fn value_types_are_preserved() {
        let mut sink = RecordingSink::default();
        let req = ingest_request(
            "/opentsdb",
            body(
                br#"[{"metric":"a","timestamp":1,"value":"up","tags":{}},{"metric":"b","timestamp":1,"value":true,"tags":{}}]"#,
            ),
        );

        OpenTsdb::ingest(req, &mut sink, &counter()).await.unwrap();

        assert_eq!(
            sink.utf8_lines(),
            vec!["1000000// a{} 'up'\r\n", "1000000// b{} T\r\n"]
        );
    }

    #[tokio::test]
    async fn nested_braces_inside_strings_do_not_split_objects() {
        let mut sink = RecordingSink::default();
        let req = ingest_request(
            "/opentsdb",
            body(br#"[{"metric":"m","timestamp":1,"value":"{\"quoted\":1}","tags":{"k":"}"}}]"#),
        );

        let count = OpenTsdb::ingest(req, &mut sink, &counter()).await.unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn leading_junk_is_discarded() {
        let mut sink = RecordingSink::default();
        let req = ingest_request("/opentsdb", body(b"\n\t  {\"metric\":\"m\",\"timestamp\":1,\"value\":1,\"tags\":{}}"));

        let count = OpenTsdb::ingest(req, &mut sink, &counter()).await.unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn empty_payload_is_an_eof_error() {
        let mut sink = RecordingSink::default();
        let req = ingest_request("/opentsdb", body(b"  "));

        let error = OpenTsdb::ingest(req, &mut sink, &counter()).await.unwrap_err();
        assert!(matches!(error, IngestError::Io(_)));
    }

    #[tokio::test]
    async fn malformed_object_is_a_parsing_error() {
        let mut sink = RecordingSink::default();
        let req = ingest_request("/opentsdb", body(br#"[{"metric":1337,"timestamp":"x"}]"#));

        let error = OpenTsdb::ingest(req, &mut sink, &counter()).await.unwrap_err();
        assert!(matches!(error, IngestError::Parsing(_)));
    }
}
