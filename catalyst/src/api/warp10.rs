//! Native sink-format pass-through: lines are already in the sink input
//! format and are forwarded untouched, in groups.

use async_trait::async_trait;
use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::response::Response;
use bytes::Bytes;
use prometheus::IntCounter;
use tokio::io::AsyncBufReadExt as _;

use crate::AppState;
use crate::ingest::{self, Catalyser, IngestError, IngestRequest, ParsingError, PointSink};
use crate::warp::WarpError;

/// Batching factor between client lines and upstream writes.
const LINES_PER_WRITE: usize = 27;

pub async fn handler(State(state): State<AppState>, request: Request) -> Response {
    ingest::run::<Warp10>(&state, request).await
}

pub struct Warp10;

#[async_trait]
impl Catalyser for Warp10 {
    const PROTOCOL: &'static str = "warp";
    const SUCCESS: StatusCode = StatusCode::OK;

    async fn ingest(
        req: IngestRequest,
        sink: &mut dyn PointSink,
        datapoints: &IntCounter,
    ) -> Result<u64, IngestError> {
        let mut count = 0_u64;
        let mut buffered = 0_usize;
        let mut group = String::new();

        let mut lines = req.body.lines();
        while let Some(line) = lines.next_line().await? {
            group.push_str(&line);
            group.push_str("\r\n");
            buffered += 1;

            if buffered >= LINES_PER_WRITE {
                sink.send(Bytes::from(std::mem::take(&mut group))).await?;
                buffered = 0;
            }

            datapoints.inc();
            count += 1;
        }

        if buffered > 0 {
            sink.send(Bytes::from(group)).await?;
        }

        Ok(count)
    }

    /// A sink-side input rejection on this path means the client payload
    /// itself was malformed.
    fn on_error(error: IngestError) -> IngestError {
        match error {
            IngestError::Warp(WarpError::Input { input, .. }) => {
                ParsingError::new("Failed to parse datapoint", input).into()
            }
            other => other,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::test_util::{RecordingSink, body, ingest_request};

    fn counter() -> IntCounter {
        crate::metrics::PROTOCOL_DATAPOINTS.with_label_values(&["warp"])
    }

    #[tokio::test]
    async fn lines_are_grouped_by_twenty_seven() {
        let payload: String = (0..30).map(|idx| format!("{idx}// m{{}} {idx}\n")).collect();

        let mut sink = RecordingSink::default();
        let req = ingest_request("/warp/api/v0/update", body(payload.into_bytes().leak()));

        let count = Warp10::ingest(req, &mut sink, &counter()).await.unwrap();

        assert_eq!(count, 30);
        assert_eq!(sink.lines.len(), 2);
        assert_eq!(sink.utf8_lines()[0].matches("\r\n").count(), 27);
        assert_eq!(sink.utf8_lines()[1].matches("\r\n").count(), 3);
    }

    #[tokio::test]
    async fn partial_group_is_flushed_at_eof() {
        let mut sink = RecordingSink::default();
        let req = ingest_request("/warp/api/v0/update", body(b"1// m{} 1\n2// m{} 2\n"));

        let count = Warp10::ingest(req, &mut sink, &counter()).await.unwrap();

        assert_eq!(count, 2);
        assert_eq!(sink.utf8_lines(), vec!["1// m{} 1\r\n2// m{} 2\r\n"]);
    }

    #[test]
    fn sink_input_errors_become_parsing_errors() {
        let error = IngestError::Warp(WarpError::Input {
            input: "broken gts".to_owned(),
            body: String::new(),
        });

        match Warp10::on_error(error) {
            IngestError::Parsing(parsing) => assert_eq!(parsing.row, "broken gts"),
            other => panic!("unexpected rewrite: {other:?}"),
        }
    }

    #[test]
    fn other_errors_pass_through() {
        let error = IngestError::Warp(WarpError::Timeout(String::new()));
        assert!(matches!(Warp10::on_error(error), IngestError::Warp(WarpError::Timeout(_))));
    }
}
