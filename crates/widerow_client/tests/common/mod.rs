//! Shared helpers for integration tests.
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{self, Stream, StreamExt};
use widerow_client::transport::{ChunkStream, EntryResultStream, SampleKeyRecordStream};
use widerow_client::{
    Chunk, ClientConfig, DataTransport, EntryResult, MutationEntry, ReadRequest, SampleKeyRecord,
    StatusCode, Table,
};

/// Scripted outcome of one mutation batch call.
#[derive(Clone, Debug)]
pub enum BatchScript {
    /// Status per row key; keys not listed succeed.
    ByKey(Vec<(&'static str, StatusCode)>),
    /// Raw results with batch-local indices, streamed as given.
    Raw(Vec<EntryResult>),
    /// The call cannot be opened.
    FailCall,
    /// Keyed statuses for the first `delivered` entries, then a stream error.
    BreakAfter {
        delivered: usize,
        statuses: Vec<(&'static str, StatusCode)>,
    },
    /// Keyed statuses for the first `delivered` entries, then no further items.
    Stall {
        delivered: usize,
        statuses: Vec<(&'static str, StatusCode)>,
    },
}

#[derive(Default)]
struct Script {
    batches: VecDeque<BatchScript>,
    reads: VecDeque<anyhow::Result<ChunkStream>>,
    samples: VecDeque<Vec<anyhow::Result<SampleKeyRecord>>>,
    sent_batches: Vec<Vec<MutationEntry>>,
    read_requests: Vec<ReadRequest>,
}

/// Fault-injecting transport that records every call it receives.
///
/// Batch calls without a remaining script succeed for every entry.
#[derive(Default)]
pub struct ScriptedTransport {
    script: Mutex<Script>,
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push_batch(&self, batch: BatchScript) {
        self.lock().batches.push_back(batch);
    }

    pub fn push_read(&self, chunks: ChunkStream) {
        self.lock().reads.push_back(Ok(chunks));
    }

    pub fn push_read_chunks(&self, chunks: Vec<Chunk>) {
        self.push_read(stream::iter(chunks.into_iter().map(Ok)).boxed());
    }

    pub fn push_read_failure(&self, message: &'static str) {
        self.lock().reads.push_back(Err(anyhow!(message)));
    }

    pub fn push_samples(&self, records: Vec<anyhow::Result<SampleKeyRecord>>) {
        self.lock().samples.push_back(records);
    }

    /// Entries of every batch call, in call order.
    pub fn sent_batches(&self) -> Vec<Vec<MutationEntry>> {
        self.lock().sent_batches.clone()
    }

    /// Row keys of every batch call, as strings.
    pub fn sent_keys(&self) -> Vec<Vec<String>> {
        self.sent_batches()
            .iter()
            .map(|batch| {
                batch
                    .iter()
                    .map(|entry| String::from_utf8_lossy(&entry.key).into_owned())
                    .collect()
            })
            .collect()
    }

    pub fn read_requests(&self) -> Vec<ReadRequest> {
        self.lock().read_requests.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Script> {
        self.script
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn keyed_results(
    entries: &[MutationEntry],
    statuses: &[(&'static str, StatusCode)],
) -> Vec<EntryResult> {
    let by_key: HashMap<&[u8], StatusCode> = statuses
        .iter()
        .map(|(key, code)| (key.as_bytes(), *code))
        .collect();
    entries
        .iter()
        .enumerate()
        .map(|(index, entry)| {
            let code = by_key
                .get(entry.key.as_ref())
                .copied()
                .unwrap_or(StatusCode::Ok);
            EntryResult::new(index, code)
        })
        .collect()
}

#[async_trait]
impl DataTransport for ScriptedTransport {
    async fn send_mutation_batch(
        &self,
        _table: &str,
        entries: Vec<MutationEntry>,
    ) -> anyhow::Result<EntryResultStream> {
        let mut script = self.lock();
        script.sent_batches.push(entries.clone());
        let batch = script
            .batches
            .pop_front()
            .unwrap_or(BatchScript::ByKey(Vec::new()));
        let items: Vec<anyhow::Result<EntryResult>> = match batch {
            BatchScript::ByKey(statuses) => keyed_results(&entries, &statuses)
                .into_iter()
                .map(Ok)
                .collect(),
            BatchScript::Raw(results) => results.into_iter().map(Ok).collect(),
            BatchScript::FailCall => return Err(anyhow!("scripted batch call failure")),
            BatchScript::BreakAfter {
                delivered,
                statuses,
            } => keyed_results(&entries, &statuses)
                .into_iter()
                .take(delivered)
                .map(Ok)
                .chain(std::iter::once(Err(anyhow!("scripted stream break"))))
                .collect(),
            BatchScript::Stall {
                delivered,
                statuses,
            } => {
                let items = keyed_results(&entries, &statuses)
                    .into_iter()
                    .take(delivered)
                    .map(Ok)
                    .collect::<Vec<_>>();
                return Ok(stream::iter(items).chain(stream::pending()).boxed());
            }
        };
        Ok(stream::iter(items).boxed())
    }

    async fn send_read_request(
        &self,
        _table: &str,
        request: ReadRequest,
    ) -> anyhow::Result<ChunkStream> {
        let mut script = self.lock();
        script.read_requests.push(request);
        script
            .reads
            .pop_front()
            .unwrap_or_else(|| Ok(stream::empty().boxed()))
    }

    async fn send_sample_keys_request(
        &self,
        _table: &str,
    ) -> anyhow::Result<SampleKeyRecordStream> {
        let records = self.lock().samples.pop_front().unwrap_or_default();
        Ok(stream::iter(records).boxed())
    }
}

/// Chunk stream that records when it is dropped.
pub struct TrackedChunks {
    inner: ChunkStream,
    dropped: Arc<AtomicBool>,
}

impl Stream for TrackedChunks {
    type Item = anyhow::Result<Chunk>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

impl Drop for TrackedChunks {
    fn drop(&mut self) {
        self.dropped.store(true, Ordering::SeqCst);
    }
}

/// `chunks` followed by a source that never ends, plus its drop flag.
pub fn endless_chunks(chunks: Vec<Chunk>) -> (ChunkStream, Arc<AtomicBool>) {
    let dropped = Arc::new(AtomicBool::new(false));
    let inner = stream::iter(chunks.into_iter().map(Ok))
        .chain(stream::pending())
        .boxed();
    let tracked = TrackedChunks {
        inner,
        dropped: dropped.clone(),
    };
    (tracked.boxed(), dropped)
}

/// Configuration with fast, deterministic retry pacing.
pub fn fast_config(max_retries: u32) -> ClientConfig {
    ClientConfig {
        max_retries,
        retry_base_delay: Duration::from_millis(1),
        retry_max_delay: Duration::from_millis(4),
        rpc_timeout: Some(Duration::from_secs(5)),
        app_profile_id: None,
    }
}

pub fn table_over(transport: Arc<dyn DataTransport>, max_retries: u32) -> Table {
    Table::new("test-table", transport, fast_config(max_retries))
}

/// Single-cell insert entry keyed by `key`.
pub fn put(key: &str) -> MutationEntry {
    MutationEntry::insert(
        Bytes::copy_from_slice(key.as_bytes()),
        [widerow_client::CellWrite::new("cf", "q", format!("value-{key}"))],
    )
}
