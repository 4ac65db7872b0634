//! Data-plane transport seam.
//!
//! The client never talks to the network directly. Every remote operation is
//! a server-streaming call behind `DataTransport`, so tests and the in-memory
//! emulator can stand in for a real store.

use async_trait::async_trait;
use futures_util::stream::BoxStream;

use crate::planner::ReadRequest;
use crate::sample::SampleKeyRecord;
use crate::status::EntryResult;
use crate::types::{Chunk, MutationEntry};

pub type EntryResultStream = BoxStream<'static, anyhow::Result<EntryResult>>;
pub type ChunkStream = BoxStream<'static, anyhow::Result<Chunk>>;
pub type SampleKeyRecordStream = BoxStream<'static, anyhow::Result<SampleKeyRecord>>;

/// Transport interface for table data RPCs.
///
/// Returning `Err` from a method means the call could not be opened at all.
/// An `Err` item inside a returned stream means the stream broke part way;
/// items delivered before it remain valid.
#[async_trait]
pub trait DataTransport: Send + Sync + 'static {
    /// Submit one batch; results carry indices local to `entries`.
    ///
    /// A batch may return results for only a subset of its entries.
    async fn send_mutation_batch(
        &self,
        table: &str,
        entries: Vec<MutationEntry>,
    ) -> anyhow::Result<EntryResultStream>;

    async fn send_read_request(
        &self,
        table: &str,
        request: ReadRequest,
    ) -> anyhow::Result<ChunkStream>;

    async fn send_sample_keys_request(
        &self,
        table: &str,
    ) -> anyhow::Result<SampleKeyRecordStream>;
}
