//! Prometheus remote-write intake: a snappy-compressed protobuf
//! `WriteRequest`. The only format that requires buffering the whole body.

use async_trait::async_trait;
use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::response::Response;
use indexmap::IndexMap;
use prometheus::IntCounter;
use prost::Message as _;
use tokio::io::AsyncReadExt as _;

use crate::AppState;
use crate::ingest::{self, Catalyser, IngestError, IngestRequest, ParsingError, PointSink};
use crate::point::{Point, Value};

pub async fn handler(State(state): State<AppState>, request: Request) -> Response {
    ingest::run::<RemoteWrite>(&state, request).await
}

pub struct RemoteWrite;

#[async_trait]
impl Catalyser for RemoteWrite {
    const PROTOCOL: &'static str = "prometheus_remote_write";
    const SUCCESS: StatusCode = StatusCode::OK;

    async fn ingest(
        mut req: IngestRequest,
        sink: &mut dyn PointSink,
        datapoints: &IntCounter,
    ) -> Result<u64, IngestError> {
        let mut compressed = Vec::new();
        req.body.read_to_end(&mut compressed).await?;

        let raw = snap::raw::Decoder::new().decompress_vec(&compressed)?;

        let request = prompb::WriteRequest::decode(raw.as_slice())
            .map_err(|error| ParsingError::new("failed to decode the remote write request", error.to_string()))?;

        let mut count = 0_u64;

        for series in &request.timeseries {
            let mut name = String::new();
            let mut labels = IndexMap::new();

            for label in &series.labels {
                if label.name == "__name__" {
                    name = label.value.clone();
                } else {
                    labels.insert(label.name.clone(), label.value.clone());
                }
            }

            for sample in &series.samples {
                let mut value = sample.value;
                if value.is_infinite() || value.is_nan() {
                    value = 0.0;
                }

                let datapoint = Point {
                    // milliseconds to microseconds
                    ts: sample.timestamp as f64 * 1_000.0,
                    name: name.clone(),
                    labels: labels.clone(),
                    value: Value::Float(value),
                };

                // write failures surface when the session is closed
                let _ = sink.send(datapoint.encode()).await;
                datapoints.inc();
                count += 1;
            }
        }

        Ok(count)
    }
}

/// Subset of `prometheus.prompb` needed for ingestion.
pub(crate) mod prompb {
    #[derive(Clone, PartialEq, prost::Message)]
    pub struct WriteRequest {
        #[prost(message, repeated, tag = "1")]
        pub timeseries: Vec<TimeSeries>,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct TimeSeries {
        #[prost(message, repeated, tag = "1")]
        pub labels: Vec<Label>,
        #[prost(message, repeated, tag = "2")]
        pub samples: Vec<Sample>,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct Label {
        #[prost(string, tag = "1")]
        pub name: String,
        #[prost(string, tag = "2")]
        pub value: String,
    }

    #[derive(Clone, Copy, PartialEq, prost::Message)]
    pub struct Sample {
        #[prost(double, tag = "1")]
        pub value: f64,
        #[prost(int64, tag = "2")]
        pub timestamp: i64,
    }
}
