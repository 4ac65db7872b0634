//! Chunk-to-row reassembly for one scan.
//!
//! The store streams rows as a flat sequence of chunks. A row starts with a
//! key-bearing chunk, may span many chunks (a single cell value may itself be
//! split across chunks), and ends with a chunk carrying the commit flag. A
//! reset chunk tells the reader to drop everything accumulated for the row in
//! progress; the server then restarts that row.
//!
//! `RowAssembler` is a synchronous state machine with no I/O so the framing
//! rules can be exercised directly. `ReadStream` drives it from a transport
//! chunk stream and hands rows to the caller one at a time.
//!
//! States:
//! - `Idle`: between rows; the next chunk must carry a row key.
//! - `AccumulatingRow`: a row is open (or was reset and awaits its restart).
//! - `RowComplete`: a row was just emitted; behaves like `Idle` on input.
//! - `ScanComplete`: input ended or a protocol error poisoned the scan.

use std::collections::BTreeMap;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use bytes::{Bytes, BytesMut};
use futures_util::Stream;
use tracing::{debug, warn};

use crate::error::{ClientError, ProtocolError};
use crate::metrics::ClientMetrics;
use crate::transport::ChunkStream;
use crate::types::{AssembledRow, Cell, CellValue, Chunk, ColumnMap};

/// Largest buffer reserved up front for a split cell value.
const SPLIT_VALUE_CAPACITY_HINT: usize = 64 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AssemblerState {
    Idle,
    AccumulatingRow,
    RowComplete,
    ScanComplete,
}

/// Cell whose value is still arriving in continuation chunks.
#[derive(Debug)]
struct OpenCell {
    timestamp_micros: i64,
    labels: Vec<String>,
    value: BytesMut,
}

#[derive(Debug)]
struct RowInProgress {
    /// `None` after a reset, until the restarted row's first chunk arrives.
    key: Option<Bytes>,
    /// Key of the row before a reset, kept for error reporting.
    reset_key: Option<Bytes>,
    data: BTreeMap<String, ColumnMap>,
    family: Option<String>,
    qualifier: Option<Bytes>,
    open_cell: Option<OpenCell>,
}

impl RowInProgress {
    fn new(key: Bytes) -> Self {
        Self {
            key: Some(key),
            reset_key: None,
            data: BTreeMap::new(),
            family: None,
            qualifier: None,
            open_cell: None,
        }
    }

    fn awaiting_restart(previous: Option<Bytes>) -> Self {
        Self {
            key: None,
            reset_key: previous,
            data: BTreeMap::new(),
            family: None,
            qualifier: None,
            open_cell: None,
        }
    }

    fn current_key(&self) -> Option<Bytes> {
        self.key.clone().or_else(|| self.reset_key.clone())
    }
}

/// Reassembles rows from the chunks of a single scan.
#[derive(Debug)]
pub struct RowAssembler {
    state: AssemblerState,
    decode: bool,
    row: Option<RowInProgress>,
    last_row_key: Option<Bytes>,
    rows_emitted: u64,
}

impl RowAssembler {
    pub fn new(decode: bool) -> Self {
        Self {
            state: AssemblerState::Idle,
            decode,
            row: None,
            last_row_key: None,
            rows_emitted: 0,
        }
    }

    pub fn state(&self) -> AssemblerState {
        self.state
    }

    pub fn rows_emitted(&self) -> u64 {
        self.rows_emitted
    }

    pub fn last_row_key(&self) -> Option<&Bytes> {
        self.last_row_key.as_ref()
    }

    /// Whether a row has been started (or reset) but not committed.
    pub fn has_row_in_progress(&self) -> bool {
        self.state == AssemblerState::AccumulatingRow
    }

    /// Feed one chunk; returns the row it completed, if any.
    ///
    /// Any protocol error moves the assembler to `ScanComplete` and discards
    /// the row in progress.
    pub fn push(&mut self, chunk: Chunk) -> Result<Option<AssembledRow>, ProtocolError> {
        let result = match self.state {
            AssemblerState::ScanComplete => Err(ProtocolError::ChunkAfterScanComplete),
            AssemblerState::Idle | AssemblerState::RowComplete => self.start_row(chunk),
            AssemblerState::AccumulatingRow => self.continue_row(chunk),
        };
        if result.is_err() {
            self.row = None;
            self.state = AssemblerState::ScanComplete;
        }
        result
    }

    /// Signal end of input.
    pub fn finish(&mut self) -> Result<(), ProtocolError> {
        match self.state {
            AssemblerState::Idle | AssemblerState::RowComplete | AssemblerState::ScanComplete => {
                self.state = AssemblerState::ScanComplete;
                Ok(())
            }
            AssemblerState::AccumulatingRow => {
                let row_key = self.row.take().and_then(|row| row.current_key());
                self.state = AssemblerState::ScanComplete;
                Err(ProtocolError::IncompleteRow { row_key })
            }
        }
    }

    fn start_row(&mut self, chunk: Chunk) -> Result<Option<AssembledRow>, ProtocolError> {
        if chunk.reset_row {
            return Err(ProtocolError::InvalidReset { row_key: None });
        }
        let key = self.validate_new_key(&chunk)?;
        self.state = AssemblerState::AccumulatingRow;
        self.row = Some(RowInProgress::new(key));
        self.apply(chunk)
    }

    fn continue_row(&mut self, chunk: Chunk) -> Result<Option<AssembledRow>, ProtocolError> {
        let Some(row) = self.row.as_ref() else {
            return Err(ProtocolError::MissingRowKey);
        };

        if chunk.reset_row {
            let row_key = row.current_key();
            if chunk.row_key.is_some() || chunk.has_cell_data() || chunk.commit_row {
                return Err(ProtocolError::InvalidReset { row_key });
            }
            self.row = Some(RowInProgress::awaiting_restart(row_key));
            return Ok(None);
        }

        let restart = match (&row.key, &chunk.row_key) {
            (None, Some(_)) => true,
            (None, None) => return Err(ProtocolError::MissingRowKey),
            (Some(current), Some(next)) if current != next => {
                return Err(ProtocolError::RowKeyChanged {
                    current: current.clone(),
                    next: next.clone(),
                });
            }
            (Some(_), _) => false,
        };
        if restart {
            let key = self.validate_new_key(&chunk)?;
            self.row = Some(RowInProgress::new(key));
        }
        self.apply(chunk)
    }

    fn validate_new_key(&self, chunk: &Chunk) -> Result<Bytes, ProtocolError> {
        let key = match chunk.row_key.as_ref() {
            Some(key) if !key.is_empty() => key.clone(),
            _ => return Err(ProtocolError::MissingRowKey),
        };
        if let Some(previous) = self.last_row_key.as_ref() {
            if key <= *previous {
                return Err(ProtocolError::OutOfOrderRow {
                    previous: previous.clone(),
                    next: key,
                });
            }
        }
        Ok(key)
    }

    /// Merge the cell content of `chunk` into the open row and handle commit.
    fn apply(&mut self, chunk: Chunk) -> Result<Option<AssembledRow>, ProtocolError> {
        let decode = self.decode;
        let Some(row) = self.row.as_mut() else {
            return Err(ProtocolError::MissingRowKey);
        };
        let Some(row_key) = row.key.clone() else {
            return Err(ProtocolError::MissingRowKey);
        };

        if let Some(mut open) = row.open_cell.take() {
            if chunk.family.is_some()
                || chunk.qualifier.is_some()
                || chunk.timestamp_micros != 0
                || !chunk.labels.is_empty()
            {
                return Err(ProtocolError::InvalidContinuation { row_key });
            }
            open.value.extend_from_slice(&chunk.value);
            if chunk.value_size > 0 {
                row.open_cell = Some(open);
            } else {
                let cell = Cell {
                    value: CellValue::from_bytes(open.value.freeze(), decode),
                    timestamp_micros: open.timestamp_micros,
                    labels: open.labels,
                };
                push_cell(row, cell);
            }
        } else if chunk.has_cell_data() {
            if let Some(family) = chunk.family {
                if chunk.qualifier.is_none() {
                    return Err(ProtocolError::MissingQualifier { row_key });
                }
                row.family = Some(family);
            }
            if let Some(qualifier) = chunk.qualifier {
                row.qualifier = Some(qualifier);
            }
            if row.family.is_none() {
                return Err(ProtocolError::MissingFamily { row_key });
            }
            if row.qualifier.is_none() {
                return Err(ProtocolError::MissingQualifier { row_key });
            }

            if chunk.value_size > 0 {
                // The declared size is only a hint from the server.
                let capacity = (chunk.value_size as usize)
                    .min(chunk.value.len().max(SPLIT_VALUE_CAPACITY_HINT));
                let mut value = BytesMut::with_capacity(capacity);
                value.extend_from_slice(&chunk.value);
                row.open_cell = Some(OpenCell {
                    timestamp_micros: chunk.timestamp_micros,
                    labels: chunk.labels,
                    value,
                });
            } else {
                let cell = Cell {
                    value: CellValue::from_bytes(chunk.value, decode),
                    timestamp_micros: chunk.timestamp_micros,
                    labels: chunk.labels,
                };
                push_cell(row, cell);
            }
        }

        if !chunk.commit_row {
            return Ok(None);
        }
        if row.open_cell.is_some() {
            return Err(ProtocolError::CommitInsideCell { row_key });
        }

        let data = std::mem::take(&mut row.data);
        self.row = None;
        self.state = AssemblerState::RowComplete;
        self.last_row_key = Some(row_key.clone());
        self.rows_emitted += 1;
        Ok(Some(AssembledRow { key: row_key, data }))
    }
}

fn push_cell(row: &mut RowInProgress, cell: Cell) {
    // Both are set before any cell is pushed.
    let (Some(family), Some(qualifier)) = (row.family.as_ref(), row.qualifier.as_ref()) else {
        return;
    };
    row.data
        .entry(family.clone())
        .or_default()
        .entry(qualifier.clone())
        .or_default()
        .push(cell);
}

/// Lazy, single-pass sequence of assembled rows for one read.
///
/// Rows are yielded as soon as their commit chunk arrives. The upstream chunk
/// stream is dropped when the scan ends, on the first error, once the row
/// limit is reached, or when the caller cancels or drops the stream.
pub struct ReadStream {
    table: String,
    chunks: Option<ChunkStream>,
    assembler: RowAssembler,
    rows_limit: Option<u64>,
    metrics: Arc<ClientMetrics>,
}

impl ReadStream {
    pub(crate) fn new(
        table: impl Into<String>,
        chunks: ChunkStream,
        decode: bool,
        rows_limit: Option<u64>,
        metrics: Arc<ClientMetrics>,
    ) -> Self {
        metrics.record_read_stream();
        Self {
            table: table.into(),
            chunks: Some(chunks),
            assembler: RowAssembler::new(decode),
            rows_limit,
            metrics,
        }
    }

    /// Stop the read and release the upstream chunk source.
    ///
    /// A row in progress is discarded. Calling this more than once is a no-op.
    pub fn cancel(&mut self) {
        if self.chunks.take().is_some() {
            self.metrics.record_read_cancellation();
            debug!(
                table = %self.table,
                rows = self.assembler.rows_emitted(),
                "read stream cancelled"
            );
        }
    }

    /// Whether the upstream chunk source has been released.
    pub fn is_closed(&self) -> bool {
        self.chunks.is_none()
    }

    pub fn rows_emitted(&self) -> u64 {
        self.assembler.rows_emitted()
    }

    fn limit_reached(&self) -> bool {
        self.rows_limit
            .map_or(false, |limit| self.assembler.rows_emitted() >= limit)
    }

    fn close(&mut self, reason: &'static str) {
        if self.chunks.take().is_some() {
            debug!(
                table = %self.table,
                rows = self.assembler.rows_emitted(),
                reason,
                "read stream closed"
            );
        }
    }

    fn protocol_error(&mut self, err: ProtocolError) -> ClientError {
        self.close("protocol error");
        self.metrics.record_protocol_error();
        warn!(
            table = %self.table,
            row_key = %err.row_key().map(hex::encode).unwrap_or_default(),
            error = %err,
            "malformed chunk sequence"
        );
        ClientError::Protocol(err)
    }
}

impl Stream for ReadStream {
    type Item = Result<AssembledRow, ClientError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            let Some(chunks) = this.chunks.as_mut() else {
                return Poll::Ready(None);
            };
            match ready!(chunks.as_mut().poll_next(cx)) {
                None => {
                    this.close("end of scan");
                    if let Err(err) = this.assembler.finish() {
                        return Poll::Ready(Some(Err(this.protocol_error(err))));
                    }
                    return Poll::Ready(None);
                }
                Some(Err(err)) => {
                    this.close("transport error");
                    warn!(table = %this.table, error = %err, "read stream failed");
                    return Poll::Ready(Some(Err(ClientError::Transport(err))));
                }
                Some(Ok(chunk)) => {
                    this.metrics.record_chunk();
                    match this.assembler.push(chunk) {
                        Ok(Some(row)) => {
                            this.metrics.record_row();
                            if this.limit_reached() {
                                this.close("row limit reached");
                            }
                            return Poll::Ready(Some(Ok(row)));
                        }
                        Ok(None) => continue,
                        Err(err) => return Poll::Ready(Some(Err(this.protocol_error(err)))),
                    }
                }
            }
        }
    }
}

impl Drop for ReadStream {
    fn drop(&mut self) {
        if self.chunks.is_some() {
            self.cancel();
        }
    }
}
