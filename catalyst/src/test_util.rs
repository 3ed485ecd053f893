//! Helpers shared by the unit tests.

use async_trait::async_trait;
use bytes::Bytes;

use crate::ingest::{BodyReader, IngestRequest, PointSink};
use crate::warp::WarpError;

/// Sink capturing what the parsers emit, optionally failing every send.
#[derive(Default)]
pub struct RecordingSink {
    pub lines: Vec<Bytes>,
    pub fail_with: Option<WarpError>,
}

impl RecordingSink {
    pub fn utf8_lines(&self) -> Vec<String> {
        self.lines
            .iter()
            .map(|line| String::from_utf8_lossy(line).into_owned())
            .collect()
    }
}

#[async_trait]
impl PointSink for RecordingSink {
    async fn send(&mut self, bytes: Bytes) -> Result<(), WarpError> {
        if let Some(error) = &self.fail_with {
            return Err(error.clone());
        }
        self.lines.push(bytes);
        Ok(())
    }
}

pub fn body(content: &'static [u8]) -> BodyReader {
    Box::pin(content)
}

pub fn ingest_request(uri: &str, body: BodyReader) -> IngestRequest {
    IngestRequest {
        uri: uri.parse().expect("test uri"),
        headers: Default::default(),
        body,
    }
}
