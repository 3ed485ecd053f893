//! Graphite plaintext over HTTP. Unlike the TCP intake, authentication
//! comes from the regular request credential, and hierarchy labelling is
//! always on.

use async_trait::async_trait;
use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::response::Response;
use prometheus::IntCounter;
use tokio::io::AsyncBufReadExt as _;

use crate::AppState;
use crate::graphite::parse_line;
use crate::ingest::{self, Catalyser, IngestError, IngestRequest, ParsingError, PointSink};

pub async fn handler(State(state): State<AppState>, request: Request) -> Response {
    ingest::run::<GraphiteHttp>(&state, request).await
}

pub struct GraphiteHttp;

#[async_trait]
impl Catalyser for GraphiteHttp {
    const PROTOCOL: &'static str = "graphite";
    const SUCCESS: StatusCode = StatusCode::OK;

    async fn ingest(
        req: IngestRequest,
        sink: &mut dyn PointSink,
        datapoints: &IntCounter,
    ) -> Result<u64, IngestError> {
        let mut count = 0_u64;

        let mut lines = req.body.lines();
        while let Some(line) = lines.next_line().await? {
            let line = line.trim();

            let datapoint =
                parse_line(line, true).map_err(|_| ParsingError::new("Failed to parse datapoint", line))?;

            sink.send(datapoint.encode()).await?;
            datapoints.inc();
            count += 1;
        }

        Ok(count)
    }
}
