//! # Peer Protocol
//!
//! Paths, headers and the NDJSON framing shared by the peer client and
//! the peer server.
//!
//! ## Discovery Exchange
//! ```text
//! Node A                                                   Node B
//!   │  POST /api/v1/sync/p2p/discovery                        │
//!   │  Content-Type: application/x-ndjson                     │
//!   │  Authorization: Bearer <token>                          │
//!   │  X-Issuer: https://node-a.example.org                   │
//!   │                                                         │
//!   │  {"id":"urn:PO:1","type":"product-offering",...}\n ───► │
//!   │  {"id":"urn:PO:2","type":"product-offering",...}\n ───► │
//!   │                                                         │
//!   │ ◄─── 200 OK (application/x-ndjson)                      │
//!   │ ◄─── {"id":"urn:PO:1","version":"1.2",...}\n            │
//!   │ ◄─── {"id":"urn:PO:7",...}\n                            │
//! ```
//!
//! Both bodies are streamed: nothing is buffered as a whole on either side.

use std::io;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::stream::{self, BoxStream, Stream, StreamExt, TryStreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::io::AsyncBufReadExt;
use tokio_stream::wrappers::LinesStream;
use tokio_util::io::StreamReader;

/// Summary exchange endpoint.
pub const DISCOVERY_PATH: &str = "/api/v1/sync/p2p/discovery";

/// Full-entity fetch endpoint.
pub const ENTITIES_PATH: &str = "/api/v1/sync/p2p/entities";

/// Liveness endpoint.
pub const HEALTH_PATH: &str = "/health";

/// Header carrying the caller's domain id.
pub const ISSUER_HEADER: &str = "X-Issuer";

pub const NDJSON_CONTENT_TYPE: &str = "application/x-ndjson";

/// Failure while reading an NDJSON body.
#[derive(Debug, Error)]
pub enum NdjsonError {
    /// The underlying body failed mid-stream.
    #[error("body stream failed: {0}")]
    Io(#[from] io::Error),

    /// A line is not a valid document.
    #[error("invalid NDJSON line: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Encodes items as an NDJSON byte stream, one line per item.
pub fn ndjson_stream<T>(
    items: Arc<[T]>,
) -> impl Stream<Item = Result<Bytes, serde_json::Error>> + Send + 'static
where
    T: Serialize + Send + Sync + 'static,
{
    stream::iter(0..items.len()).map(move |i| encode_line(&items[i]))
}

fn encode_line<T: Serialize>(item: &T) -> Result<Bytes, serde_json::Error> {
    let mut line = serde_json::to_vec(item)?;
    line.push(b'\n');
    Ok(Bytes::from(line))
}

/// Decodes an NDJSON byte stream incrementally. Blank lines are skipped.
pub fn decode_ndjson<T, S, E>(body: S) -> BoxStream<'static, Result<T, NdjsonError>>
where
    T: DeserializeOwned + Send + 'static,
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: Into<Box<dyn std::error::Error + Send + Sync>> + 'static,
{
    let reader = StreamReader::new(body.map_err(io::Error::other));

    LinesStream::new(reader.lines())
        .filter_map(|line| async move {
            match line {
                Ok(line) if line.trim().is_empty() => None,
                Ok(line) => Some(serde_json::from_str::<T>(&line).map_err(NdjsonError::from)),
                Err(e) => Some(Err(NdjsonError::Io(e))),
            }
        })
        .boxed()
}
