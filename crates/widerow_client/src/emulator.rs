//! In-memory `DataTransport` for tests and local workloads.
//!
//! Tables are ordered maps from row key to families, columns and cell
//! versions (newest first). Reads are answered with the same chunk framing a
//! real store uses, including values split across several chunks, so the
//! full client stack can run without a network. A small fault plan can inject
//! per-entry statuses, whole-call failures and broken read streams.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{self, StreamExt};
use tracing::debug;

use crate::planner::ReadRequest;
use crate::sample::SampleKeyRecord;
use crate::status::{EntryResult, Status, StatusCode};
use crate::transport::{ChunkStream, DataTransport, EntryResultStream, SampleKeyRecordStream};
use crate::types::{Chunk, ColumnEdit, MutationEntry, RowFilter, SERVER_TIMESTAMP};

const DEFAULT_MAX_CHUNK_VALUE: usize = 64 * 1024;
const DEFAULT_SAMPLE_INTERVAL: usize = 16;

#[derive(Clone, Debug)]
struct StoredCell {
    timestamp_micros: i64,
    value: Bytes,
}

/// family -> qualifier -> versions, newest first.
type StoredRow = BTreeMap<String, BTreeMap<Bytes, Vec<StoredCell>>>;
type StoredTable = BTreeMap<Bytes, StoredRow>;

/// Cell view used while evaluating filters.
#[derive(Clone, Debug)]
struct FilteredCell {
    family: String,
    qualifier: Bytes,
    timestamp_micros: i64,
    value: Bytes,
    labels: Vec<String>,
}

#[derive(Debug, Default)]
struct FaultPlan {
    /// Statuses returned, in order, for the next entries that target a key.
    entry_statuses: HashMap<Bytes, VecDeque<Status>>,
    failing_batch_calls: u32,
    failing_read_calls: u32,
    truncate_read_after: Option<usize>,
}

#[derive(Debug)]
struct EmulatorState {
    tables: BTreeMap<String, StoredTable>,
    /// Logical clock for server-assigned timestamps.
    clock_micros: i64,
    max_chunk_value: usize,
    sample_interval: usize,
    faults: FaultPlan,
    batch_calls: u64,
    read_calls: u64,
}

/// Emulated store shared by every handle that holds it.
#[derive(Debug)]
pub struct MemoryTransport {
    state: Mutex<EmulatorState>,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(EmulatorState {
                tables: BTreeMap::new(),
                clock_micros: 0,
                max_chunk_value: DEFAULT_MAX_CHUNK_VALUE,
                sample_interval: DEFAULT_SAMPLE_INTERVAL,
                faults: FaultPlan::default(),
                batch_calls: 0,
                read_calls: 0,
            }),
        }
    }

    /// Split cell values longer than `bytes` across several chunks.
    pub fn with_max_chunk_value(self, bytes: usize) -> Self {
        self.lock().max_chunk_value = bytes.max(1);
        self
    }

    /// Emit one sample key every `rows` rows.
    pub fn with_sample_interval(self, rows: usize) -> Self {
        self.lock().sample_interval = rows.max(1);
        self
    }

    pub fn create_table(&self, name: impl Into<String>) {
        self.lock().tables.entry(name.into()).or_default();
    }

    /// Queue statuses for the next entries that target `key`.
    ///
    /// Each queued non-ok status is returned instead of applying the entry.
    /// Once the queue is drained, entries for the key apply normally.
    pub fn inject_entry_statuses<I, S>(&self, key: impl Into<Bytes>, statuses: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<Status>,
    {
        self.lock()
            .faults
            .entry_statuses
            .entry(key.into())
            .or_default()
            .extend(statuses.into_iter().map(Into::into));
    }

    /// Fail the next `calls` mutation batch calls before any entry is applied.
    pub fn fail_next_batch_calls(&self, calls: u32) {
        self.lock().faults.failing_batch_calls = calls;
    }

    pub fn fail_next_read_calls(&self, calls: u32) {
        self.lock().faults.failing_read_calls = calls;
    }

    /// Break the next read stream with an error after `chunks` chunks.
    pub fn truncate_next_read_after(&self, chunks: usize) {
        self.lock().faults.truncate_read_after = Some(chunks);
    }

    pub fn batch_calls(&self) -> u64 {
        self.lock().batch_calls
    }

    pub fn read_calls(&self) -> u64 {
        self.lock().read_calls
    }

    pub fn row_count(&self, table: &str) -> usize {
        self.lock().tables.get(table).map_or(0, BTreeMap::len)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, EmulatorState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl EmulatorState {
    fn next_timestamp(&mut self) -> i64 {
        self.clock_micros += 1_000;
        self.clock_micros
    }

    fn table_mut(&mut self, name: &str) -> Result<&mut StoredTable> {
        self.tables
            .get_mut(name)
            .ok_or_else(|| anyhow!("table {name} not found"))
    }

    fn apply_entry(&mut self, table: &str, entry: &MutationEntry) -> Result<()> {
        let now = self.next_timestamp();
        let rows = self.table_mut(table)?;
        for edit in &entry.edits {
            match edit {
                ColumnEdit::SetCell {
                    family,
                    qualifier,
                    timestamp_micros,
                    value,
                } => {
                    let timestamp_micros = if *timestamp_micros == SERVER_TIMESTAMP {
                        now
                    } else {
                        *timestamp_micros
                    };
                    let versions = rows
                        .entry(entry.key.clone())
                        .or_default()
                        .entry(family.clone())
                        .or_default()
                        .entry(qualifier.clone())
                        .or_default();
                    versions.retain(|cell| cell.timestamp_micros != timestamp_micros);
                    let pos = versions
                        .iter()
                        .position(|cell| cell.timestamp_micros < timestamp_micros)
                        .unwrap_or(versions.len());
                    versions.insert(
                        pos,
                        StoredCell {
                            timestamp_micros,
                            value: value.clone(),
                        },
                    );
                }
                ColumnEdit::DeleteFromColumn {
                    family,
                    qualifier,
                    time_range,
                } => {
                    if let Some(columns) = rows
                        .get_mut(&entry.key)
                        .and_then(|row| row.get_mut(family))
                    {
                        if let Some(versions) = columns.get_mut(qualifier) {
                            match time_range {
                                Some(range) => {
                                    versions.retain(|cell| !range.contains(cell.timestamp_micros))
                                }
                                None => versions.clear(),
                            }
                        }
                    }
                }
                ColumnEdit::DeleteFromFamily { family } => {
                    if let Some(row) = rows.get_mut(&entry.key) {
                        row.remove(family);
                    }
                }
                ColumnEdit::DeleteFromRow => {
                    rows.remove(&entry.key);
                }
            }
        }
        prune_row(rows, &entry.key);
        Ok(())
    }

    fn entry_status(&mut self, table: &str, entry: &MutationEntry) -> Status {
        let injected = self
            .faults
            .entry_statuses
            .get_mut(&entry.key)
            .and_then(VecDeque::pop_front);
        if let Some(status) = injected {
            if !status.is_ok() {
                return status;
            }
        }
        match self.apply_entry(table, entry) {
            Ok(()) => Status::ok(),
            Err(err) => Status::new(StatusCode::NotFound, err.to_string()),
        }
    }

    fn read_chunks(&self, table: &str, request: &ReadRequest) -> Result<Vec<Chunk>> {
        let rows = self
            .tables
            .get(table)
            .ok_or_else(|| anyhow!("table {table} not found"))?;

        let mut chunks = Vec::new();
        let mut emitted = 0u64;
        for (key, row) in rows {
            if request.rows_limit.map_or(false, |limit| emitted >= limit) {
                break;
            }
            if !request.selects(key) {
                continue;
            }
            let mut cells = flatten_row(row);
            if let Some(filter) = request.filter.as_ref() {
                cells = apply_filter(filter, cells);
            }
            if cells.is_empty() {
                continue;
            }
            self.push_row_chunks(key, cells, &mut chunks);
            emitted += 1;
        }
        Ok(chunks)
    }

    fn push_row_chunks(&self, key: &Bytes, cells: Vec<FilteredCell>, chunks: &mut Vec<Chunk>) {
        let mut current_family: Option<String> = None;
        for cell in cells {
            let family = if current_family.as_deref() == Some(cell.family.as_str()) {
                None
            } else {
                current_family = Some(cell.family.clone());
                Some(cell.family)
            };
            let row_key = if chunks.last().map_or(true, |chunk: &Chunk| chunk.commit_row) {
                Some(key.clone())
            } else {
                None
            };

            let total = cell.value.len();
            let mut pieces = split_value(&cell.value, self.max_chunk_value).into_iter();
            let first = pieces.next().unwrap_or_default();
            let remaining = total - first.len();
            chunks.push(Chunk {
                row_key,
                family,
                qualifier: Some(cell.qualifier),
                timestamp_micros: cell.timestamp_micros,
                labels: cell.labels,
                value: first,
                value_size: if remaining > 0 { total as u32 } else { 0 },
                reset_row: false,
                commit_row: false,
            });
            let mut sent = total - remaining;
            for piece in pieces {
                sent += piece.len();
                chunks.push(Chunk {
                    value: piece,
                    value_size: if sent < total { total as u32 } else { 0 },
                    ..Chunk::default()
                });
            }
        }
        if let Some(last) = chunks.last_mut() {
            last.commit_row = true;
        }
    }

    fn sample_records(&self, table: &str) -> Result<Vec<SampleKeyRecord>> {
        let rows = self
            .tables
            .get(table)
            .ok_or_else(|| anyhow!("table {table} not found"))?;
        let mut records = Vec::new();
        let mut offset = 0i64;
        for (position, (key, row)) in rows.iter().enumerate() {
            offset += row_size(key, row) as i64;
            if (position + 1) % self.sample_interval == 0 {
                records.push(SampleKeyRecord::new(key.clone(), offset));
            }
        }
        // Trailing empty key marks the end of the table.
        records.push(SampleKeyRecord::new(Bytes::new(), offset));
        Ok(records)
    }
}

fn prune_row(rows: &mut StoredTable, key: &Bytes) {
    let Some(row) = rows.get_mut(key) else {
        return;
    };
    for columns in row.values_mut() {
        columns.retain(|_, versions| !versions.is_empty());
    }
    row.retain(|_, columns| !columns.is_empty());
    if row.is_empty() {
        rows.remove(key);
    }
}

fn row_size(key: &Bytes, row: &StoredRow) -> usize {
    let cells: usize = row
        .iter()
        .flat_map(|(family, columns)| {
            columns.iter().map(move |(qualifier, versions)| {
                versions
                    .iter()
                    .map(|cell| family.len() + qualifier.len() + cell.value.len() + 8)
                    .sum::<usize>()
            })
        })
        .sum();
    key.len() + cells
}

fn split_value(value: &Bytes, max: usize) -> Vec<Bytes> {
    if value.is_empty() {
        return vec![Bytes::new()];
    }
    let mut pieces = Vec::with_capacity(value.len().div_ceil(max));
    let mut start = 0;
    while start < value.len() {
        let end = (start + max).min(value.len());
        pieces.push(value.slice(start..end));
        start = end;
    }
    pieces
}

fn flatten_row(row: &StoredRow) -> Vec<FilteredCell> {
    row.iter()
        .flat_map(|(family, columns)| {
            columns.iter().flat_map(move |(qualifier, versions)| {
                versions.iter().map(move |cell| FilteredCell {
                    family: family.clone(),
                    qualifier: qualifier.clone(),
                    timestamp_micros: cell.timestamp_micros,
                    value: cell.value.clone(),
                    labels: Vec::new(),
                })
            })
        })
        .collect()
}

fn apply_filter(filter: &RowFilter, cells: Vec<FilteredCell>) -> Vec<FilteredCell> {
    match filter {
        RowFilter::PassAll => cells,
        RowFilter::BlockAll => Vec::new(),
        RowFilter::FamilyName(family) => cells
            .into_iter()
            .filter(|cell| &cell.family == family)
            .collect(),
        RowFilter::ColumnQualifier(qualifier) => cells
            .into_iter()
            .filter(|cell| &cell.qualifier == qualifier)
            .collect(),
        RowFilter::TimestampRange(range) => cells
            .into_iter()
            .filter(|cell| range.contains(cell.timestamp_micros))
            .collect(),
        RowFilter::CellsPerRowLimit(limit) => cells.into_iter().take(*limit as usize).collect(),
        RowFilter::CellsPerColumnLimit(limit) => {
            let mut seen: HashMap<(String, Bytes), u32> = HashMap::new();
            cells
                .into_iter()
                .filter(|cell| {
                    let count = seen
                        .entry((cell.family.clone(), cell.qualifier.clone()))
                        .or_insert(0);
                    *count += 1;
                    *count <= *limit
                })
                .collect()
        }
        RowFilter::StripValue => cells
            .into_iter()
            .map(|cell| FilteredCell {
                value: Bytes::new(),
                ..cell
            })
            .collect(),
        RowFilter::Label(label) => cells
            .into_iter()
            .map(|mut cell| {
                cell.labels.push(label.clone());
                cell
            })
            .collect(),
        RowFilter::Chain(filters) => filters
            .iter()
            .fold(cells, |cells, filter| apply_filter(filter, cells)),
        RowFilter::Interleave(filters) => {
            let mut merged = filters
                .iter()
                .flat_map(|filter| apply_filter(filter, cells.clone()))
                .collect::<Vec<_>>();
            merged.sort_by(|a, b| {
                (&a.family, &a.qualifier)
                    .cmp(&(&b.family, &b.qualifier))
                    .then(b.timestamp_micros.cmp(&a.timestamp_micros))
            });
            merged
        }
    }
}

#[async_trait]
impl DataTransport for MemoryTransport {
    async fn send_mutation_batch(
        &self,
        table: &str,
        entries: Vec<MutationEntry>,
    ) -> anyhow::Result<EntryResultStream> {
        let mut state = self.lock();
        state.batch_calls += 1;
        if state.faults.failing_batch_calls > 0 {
            state.faults.failing_batch_calls -= 1;
            return Err(anyhow!("injected mutation batch failure"));
        }
        let results = entries
            .iter()
            .enumerate()
            .map(|(index, entry)| {
                let status = state.entry_status(table, entry);
                Ok::<_, anyhow::Error>(EntryResult::new(index, status))
            })
            .collect::<Vec<_>>();
        debug!(table, entries = entries.len(), "emulator applied batch");
        Ok(stream::iter(results).boxed())
    }

    async fn send_read_request(
        &self,
        table: &str,
        request: ReadRequest,
    ) -> anyhow::Result<ChunkStream> {
        let mut state = self.lock();
        state.read_calls += 1;
        if state.faults.failing_read_calls > 0 {
            state.faults.failing_read_calls -= 1;
            return Err(anyhow!("injected read call failure"));
        }
        let chunks = state.read_chunks(table, &request)?;
        debug!(table, chunks = chunks.len(), "emulator answered read");

        match state.faults.truncate_read_after.take() {
            Some(after) => {
                let items = chunks
                    .into_iter()
                    .take(after)
                    .map(Ok)
                    .chain(std::iter::once(Err(anyhow!(
                        "injected read stream interruption"
                    ))))
                    .collect::<Vec<_>>();
                Ok(stream::iter(items).boxed())
            }
            None => Ok(stream::iter(chunks.into_iter().map(Ok::<_, anyhow::Error>)).boxed()),
        }
    }

    async fn send_sample_keys_request(
        &self,
        table: &str,
    ) -> anyhow::Result<SampleKeyRecordStream> {
        let records = self.lock().sample_records(table)?;
        Ok(stream::iter(records.into_iter().map(Ok::<_, anyhow::Error>)).boxed())
    }
}

#[cfg(test)]
mod tests {
    use futures_util::TryStreamExt;

    use super::*;
    use crate::assembler::RowAssembler;
    use crate::range::RowRange;
    use crate::types::{AssembledRow, CellWrite, TimestampRange};

    async fn write(
        transport: &MemoryTransport,
        entries: Vec<MutationEntry>,
    ) -> Vec<EntryResult> {
        transport
            .send_mutation_batch("t", entries)
            .await
            .expect("open batch")
            .try_collect()
            .await
            .expect("batch results")
    }

    async fn read(transport: &MemoryTransport, request: ReadRequest) -> Vec<AssembledRow> {
        let chunks: Vec<Chunk> = transport
            .send_read_request("t", request)
            .await
            .expect("open read")
            .try_collect()
            .await
            .expect("chunks");
        let mut assembler = RowAssembler::new(true);
        let mut rows = Vec::new();
        for chunk in chunks {
            if let Some(row) = assembler.push(chunk).expect("well-formed chunks") {
                rows.push(row);
            }
        }
        assembler.finish().expect("complete scan");
        rows
    }

    fn seeded() -> MemoryTransport {
        let transport = MemoryTransport::new();
        transport.create_table("t");
        transport
    }

    #[tokio::test]
    async fn writes_are_readable_in_key_order() {
        let transport = seeded();
        let results = write(
            &transport,
            vec![
                MutationEntry::insert("b", [CellWrite::new("cf", "q", "2")]),
                MutationEntry::insert("a", [CellWrite::new("cf", "q", "1")]),
            ],
        )
        .await;
        assert!(results.iter().all(|result| result.status.is_ok()));

        let rows = read(&transport, ReadRequest::default()).await;
        let keys = rows.iter().map(|row| row.key.clone()).collect::<Vec<_>>();
        assert_eq!(keys, vec![Bytes::from_static(b"a"), Bytes::from_static(b"b")]);
        assert_eq!(transport.row_count("t"), 2);
    }

    #[tokio::test]
    async fn versions_are_newest_first_and_deletes_apply() {
        let transport = seeded();
        write(
            &transport,
            vec![MutationEntry::insert(
                "k",
                [
                    CellWrite::new("cf", "q", "old").at(10),
                    CellWrite::new("cf", "q", "new").at(20),
                    CellWrite::new("cf2", "x", "y").at(5),
                ],
            )],
        )
        .await;
        let rows = read(&transport, ReadRequest::default()).await;
        let values = rows[0]
            .cells("cf", b"q")
            .iter()
            .map(|cell| cell.timestamp_micros)
            .collect::<Vec<_>>();
        assert_eq!(values, vec![20, 10]);

        let range = TimestampRange {
            start_micros: Some(15),
            end_micros: None,
        };
        write(
            &transport,
            vec![
                MutationEntry::delete_cells("k", &["cf:q"], Some(range)).expect("selector"),
                MutationEntry::delete_cells("k", &["cf2"], None).expect("selector"),
            ],
        )
        .await;
        let rows = read(&transport, ReadRequest::default()).await;
        assert_eq!(rows[0].cell_count(), 1);
        assert_eq!(rows[0].latest("cf", b"q").expect("cell").timestamp_micros, 10);

        write(&transport, vec![MutationEntry::delete_row("k")]).await;
        assert_eq!(transport.row_count("t"), 0);
    }

    #[tokio::test]
    async fn long_values_are_split_and_reassembled() {
        let transport = seeded().with_max_chunk_value(4);
        write(
            &transport,
            vec![MutationEntry::insert("k", [CellWrite::new("cf", "q", "0123456789")])],
        )
        .await;
        let chunks: Vec<Chunk> = transport
            .send_read_request("t", ReadRequest::default())
            .await
            .expect("open read")
            .try_collect()
            .await
            .expect("chunks");
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].value_size, 10);
        assert_eq!(chunks[2].value_size, 0);
        assert!(chunks[2].commit_row);

        let rows = read(&transport, ReadRequest::default()).await;
        assert_eq!(
            rows[0].latest("cf", b"q").expect("cell").value.as_str(),
            Some("0123456789")
        );
    }

    #[tokio::test]
    async fn filters_ranges_and_limits_shape_the_read() {
        let transport = seeded();
        let entries = ["a1", "a2", "b1", "c1"]
            .into_iter()
            .map(|key| {
                MutationEntry::insert(
                    key,
                    [
                        CellWrite::new("cf", "q", "v1").at(1),
                        CellWrite::new("cf", "q", "v2").at(2),
                        CellWrite::new("meta", "m", "x").at(1),
                    ],
                )
            })
            .collect();
        write(&transport, entries).await;

        let rows = read(
            &transport,
            ReadRequest {
                row_ranges: vec![RowRange::closed_open("a", "c")],
                filter: Some(RowFilter::Chain(vec![
                    RowFilter::FamilyName("cf".to_string()),
                    RowFilter::CellsPerColumnLimit(1),
                ])),
                rows_limit: Some(2),
                ..ReadRequest::default()
            },
        )
        .await;
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].key, Bytes::from_static(b"a2"));
        assert_eq!(rows[0].cell_count(), 1);
        assert_eq!(rows[0].latest("cf", b"q").expect("cell").value.as_str(), Some("v2"));

        let rows = read(
            &transport,
            ReadRequest {
                row_keys: vec![Bytes::from_static(b"c1")],
                filter: Some(RowFilter::Chain(vec![
                    RowFilter::CellsPerRowLimit(1),
                    RowFilter::StripValue,
                    RowFilter::Label("probe".to_string()),
                ])),
                ..ReadRequest::default()
            },
        )
        .await;
        assert_eq!(rows.len(), 1);
        let cell = rows[0].latest("cf", b"q").expect("cell");
        assert!(cell.value.is_empty());
        assert_eq!(cell.labels, vec!["probe".to_string()]);

        let rows = read(
            &transport,
            ReadRequest {
                filter: Some(RowFilter::BlockAll),
                ..ReadRequest::default()
            },
        )
        .await;
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn injected_statuses_preempt_apply() {
        let transport = seeded();
        transport.inject_entry_statuses("k", [StatusCode::Unavailable]);
        let results = write(
            &transport,
            vec![MutationEntry::insert("k", [CellWrite::new("cf", "q", "v")])],
        )
        .await;
        assert_eq!(results[0].status.code, StatusCode::Unavailable);
        assert_eq!(transport.row_count("t"), 0);

        let results = write(
            &transport,
            vec![MutationEntry::insert("k", [CellWrite::new("cf", "q", "v")])],
        )
        .await;
        assert!(results[0].status.is_ok());
        assert_eq!(transport.row_count("t"), 1);
    }

    #[tokio::test]
    async fn call_failures_and_missing_tables() {
        let transport = seeded();
        transport.fail_next_batch_calls(1);
        assert!(transport
            .send_mutation_batch("t", vec![MutationEntry::delete_row("k")])
            .await
            .is_err());
        assert_eq!(transport.batch_calls(), 1);

        transport.fail_next_read_calls(1);
        assert!(transport
            .send_read_request("t", ReadRequest::default())
            .await
            .is_err());
        assert!(transport
            .send_read_request("missing", ReadRequest::default())
            .await
            .is_err());
        assert_eq!(transport.read_calls(), 2);

        let results = transport
            .send_mutation_batch("missing", vec![MutationEntry::delete_row("k")])
            .await
            .expect("open batch")
            .try_collect::<Vec<_>>()
            .await
            .expect("results");
        assert_eq!(results[0].status.code, StatusCode::NotFound);
    }

    #[tokio::test]
    async fn sample_records_end_with_empty_key() {
        let transport = seeded().with_sample_interval(2);
        let entries = (0..5)
            .map(|idx| MutationEntry::insert(format!("k{idx}"), [CellWrite::new("cf", "q", "v")]))
            .collect();
        write(&transport, entries).await;

        let records: Vec<SampleKeyRecord> = transport
            .send_sample_keys_request("t")
            .await
            .expect("open sample")
            .try_collect()
            .await
            .expect("records");
        let keys = records
            .iter()
            .map(|record| record.row_key.clone())
            .collect::<Vec<_>>();
        assert_eq!(
            keys,
            vec![Bytes::from_static(b"k1"), Bytes::from_static(b"k3"), Bytes::new()]
        );
        assert!(records.windows(2).all(|pair| pair[0].offset_bytes <= pair[1].offset_bytes));
    }
}
