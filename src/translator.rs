//! Byte range → chunk fetch translation.
//!
//! The store only serves fixed-size, chunk-aligned windows. A client range is
//! turned into a [`FetchPlan`]: the aligned offset of the first window, how
//! many windows it touches, and how much to cut from the first and last of
//! them. [`stream_range`] then pulls the windows one at a time, in offset
//! order, and yields exactly the requested bytes.

use std::sync::Arc;
use std::time::Instant;

use async_stream::stream;
use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use serde_json::json;

use crate::error::{GatewayError, GatewayResult};
use crate::fetcher::ChunkFetcher;
use crate::range::{validate, RangeRequest};
use crate::store::{ObjectDescriptor, ObjectStore, PartitionId};
use crate::trace::{trace_event, SharedTrace};

pub const DEFAULT_CHUNK_SIZE: u64 = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchPlan {
    /// Chunk-aligned offset of the first fetch.
    pub offset: u64,
    pub chunk_size: u64,
    /// Number of chunks the range touches.
    pub part_count: u64,
    /// Bytes dropped from the front of the first chunk.
    pub first_part_cut: u64,
    /// Bytes kept from the front of the last chunk.
    pub last_part_cut: u64,
    pub requested_length: u64,
}

impl FetchPlan {
    pub fn new(object_size: u64, range: RangeRequest, chunk_size: u64) -> GatewayResult<Self> {
        if chunk_size == 0 {
            return Err(GatewayError::Internal("chunk size must be > 0".into()));
        }
        validate(range, object_size)?;

        let first_index = range.from_byte / chunk_size;
        let last_index = range.until_byte / chunk_size;
        let offset = first_index * chunk_size;

        Ok(Self {
            offset,
            chunk_size,
            part_count: last_index - first_index + 1,
            first_part_cut: range.from_byte - offset,
            last_part_cut: range.until_byte % chunk_size + 1,
            requested_length: range.len(),
        })
    }

    /// The slice of `chunk` that belongs to the range, for 1-based `part`.
    /// Cuts are clamped to what the store actually returned.
    pub fn trim(&self, part: u64, chunk: &Bytes) -> Bytes {
        let len = chunk.len() as u64;
        let start = if part == 1 {
            self.first_part_cut.min(len)
        } else {
            0
        };
        let end = if part == self.part_count {
            self.last_part_cut.min(len)
        } else {
            len
        };
        chunk.slice(start as usize..end.max(start) as usize)
    }
}

/// Where a plan's chunks come from.
#[async_trait]
pub trait ChunkSource: Send + Sync {
    /// Name used in logs and traces.
    fn label(&self) -> String;

    async fn fetch(&self, offset: u64, limit: u64) -> GatewayResult<Bytes>;
}

/// A stored object read through the shared partition session cache.
pub struct ObjectReader {
    pub fetcher: Arc<ChunkFetcher>,
    pub store: Arc<dyn ObjectStore>,
    pub object: ObjectDescriptor,
    pub partition: PartitionId,
}

#[async_trait]
impl ChunkSource for ObjectReader {
    fn label(&self) -> String {
        self.object.to_string()
    }

    async fn fetch(&self, offset: u64, limit: u64) -> GatewayResult<Bytes> {
        self.fetcher
            .fetch(
                self.store.as_ref(),
                &self.object,
                &self.partition,
                offset,
                limit,
            )
            .await
    }
}

/// Lazily fetch and trim the chunks of `plan`.
///
/// Each chunk is requested only after the previous one was taken by the
/// consumer, so a slow client slows the upstream fetch rate. An empty or
/// short chunk means the object ended early: the stream stops without error,
/// possibly having delivered fewer than `plan.requested_length` bytes. A
/// failed fetch ends the stream with that error.
pub fn stream_range<C>(
    plan: FetchPlan,
    source: C,
    trace: SharedTrace,
) -> impl Stream<Item = GatewayResult<Bytes>> + Send + 'static
where
    C: ChunkSource + 'static,
{
    stream! {
        let label = source.label();
        let mut offset = plan.offset;

        for part in 1..=plan.part_count {
            let t0 = Instant::now();
            let chunk = match source.fetch(offset, plan.chunk_size).await {
                Ok(chunk) => chunk,
                Err(e) => {
                    yield Err::<Bytes, GatewayError>(e);
                    return;
                }
            };

            trace_event(&trace, || json!({
                "event": "chunk_fetched",
                "object": label,
                "part": part,
                "offset": offset,
                "bytes": chunk.len(),
                "latency_ms": t0.elapsed().as_secs_f64() * 1000.0,
            }));

            if chunk.is_empty() {
                break;
            }
            let short = (chunk.len() as u64) < plan.chunk_size;
            yield Ok::<Bytes, GatewayError>(plan.trim(part, &chunk));
            if short {
                break;
            }
            offset += plan.chunk_size;
        }
    }
}
