//! Bounded reading of request bodies.

use axum::body::Body;
use bytes::{BufMut, Bytes, BytesMut};
use futures::StreamExt;
use tracing::warn;

const INITIAL_BUFFER: usize = 64 * 1024;

/// What the HTTP layer could read from a request body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestBody {
    /// No bytes were sent, or the body could not be read
    Missing,
    Complete(Bytes),
    /// More than the read cap was sent, the rest was not buffered
    Oversized,
}

impl RequestBody {
    pub fn from_bytes(bytes: impl Into<Bytes>) -> Self {
        let bytes = bytes.into();
        if bytes.is_empty() {
            RequestBody::Missing
        } else {
            RequestBody::Complete(bytes)
        }
    }
}

/// Streams `body` into memory, stopping as soon as more than `hard_limit` bytes arrived.
pub async fn read_body(body: Body, hard_limit: usize) -> RequestBody {
    let mut stream = body.into_data_stream();
    let mut buf = BytesMut::with_capacity(std::cmp::min(hard_limit, INITIAL_BUFFER));

    while let Some(chunk) = stream.next().await {
        match chunk {
            Ok(chunk) => {
                if buf.len() + chunk.len() > hard_limit {
                    return RequestBody::Oversized;
                }
                buf.put(chunk);
            }
            Err(e) => {
                warn!("error reading request body: {}", e);
                return RequestBody::Missing;
            }
        }
    }

    RequestBody::from_bytes(buf.freeze())
}
