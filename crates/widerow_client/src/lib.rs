//! Client access layer for a wide-column, range-partitioned store.
//!
//! The crate turns caller requests into transport calls and back:
//! - [`planner`] translates a [`ReadSpec`] into row keys and row ranges.
//! - [`assembler`] rebuilds rows from the chunk stream of a scan and exposes
//!   them as a lazy, cancellable [`ReadStream`].
//! - [`mutation`] submits multi-row mutations and re-submits only the entries
//!   that reported a transient status.
//! - [`table`] ties these together behind a per-table handle.
//!
//! All remote I/O goes through the [`DataTransport`] trait. [`emulator`]
//! provides an in-memory implementation for tests and local workloads.

pub mod assembler;
pub mod config;
pub mod emulator;
pub mod error;
pub mod metrics;
pub mod mutation;
pub mod planner;
pub mod range;
pub mod sample;
pub mod status;
pub mod table;
pub mod transport;
pub mod types;

pub use assembler::{AssemblerState, ReadStream, RowAssembler};
pub use config::ClientConfig;
pub use emulator::MemoryTransport;
pub use error::{ClientError, EntryFailure, PartialFailure, ProtocolError, Result};
pub use metrics::{ClientMetrics, ClientMetricsSnapshot};
pub use mutation::{BatchAttemptState, MutateOptions, MutationBatcher};
pub use planner::{plan_read, ReadRequest};
pub use range::{prefix_successor, prefix_to_range, KeyBound, RowRange};
pub use sample::{SampleKey, SampleKeyRecord, SampleKeyStream};
pub use status::{EntryResult, Status, StatusCode};
pub use table::Table;
pub use transport::DataTransport;
pub use types::{
    AssembledRow, Cell, CellValue, CellWrite, Chunk, ColumnEdit, MutationEntry, MutationMethod,
    ReadSpec, RowFilter, TimestampRange,
};
