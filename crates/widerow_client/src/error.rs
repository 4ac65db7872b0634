//! Error types returned by the client.

use std::fmt;

use bytes::Bytes;
use thiserror::Error;

use crate::status::Status;
use crate::types::MutationEntry;

pub type Result<T, E = ClientError> = std::result::Result<T, E>;

/// Errors surfaced to callers of the client.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Caller arguments are structurally unusable; raised before any remote call.
    #[error("invalid specification: {0}")]
    InvalidSpecification(String),

    /// Some mutation entries never reached `ok`.
    #[error(transparent)]
    PartialFailure(#[from] PartialFailure),

    /// The chunk sequence of a read violated the row framing rules.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// A read or sample call could not be opened, or its stream failed.
    #[error(transparent)]
    Transport(#[from] anyhow::Error),
}

impl ClientError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidSpecification(message.into())
    }

    pub fn as_partial_failure(&self) -> Option<&PartialFailure> {
        match self {
            Self::PartialFailure(failure) => Some(failure),
            _ => None,
        }
    }
}

/// Malformed chunk sequences observed while assembling rows.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("chunk stream ended before row {} was committed", display_key(.row_key))]
    IncompleteRow { row_key: Option<Bytes> },

    #[error("chunk without a row key arrived while no row was in progress")]
    MissingRowKey,

    #[error("row key changed from {} to {} before commit", hex::encode(.current), hex::encode(.next))]
    RowKeyChanged { current: Bytes, next: Bytes },

    #[error("row {} does not sort after previously committed row {}", hex::encode(.next), hex::encode(.previous))]
    OutOfOrderRow { previous: Bytes, next: Bytes },

    #[error("reset chunk for row {} carried row data or flags", display_key(.row_key))]
    InvalidReset { row_key: Option<Bytes> },

    #[error("first cell of row {} has no column family", hex::encode(.row_key))]
    MissingFamily { row_key: Bytes },

    #[error("cell in row {} has no column qualifier", hex::encode(.row_key))]
    MissingQualifier { row_key: Bytes },

    #[error("continuation chunk for a split cell in row {} re-declared the cell", hex::encode(.row_key))]
    InvalidContinuation { row_key: Bytes },

    #[error("row {} committed while a split cell value was still open", hex::encode(.row_key))]
    CommitInsideCell { row_key: Bytes },

    #[error("chunk received after the scan completed")]
    ChunkAfterScanComplete,

    #[error("sample key record carried negative offset {offset}")]
    NegativeSampleOffset { offset: i64 },
}

impl ProtocolError {
    /// Row key of the offending row, when the error is tied to one.
    pub fn row_key(&self) -> Option<&Bytes> {
        match self {
            Self::IncompleteRow { row_key } | Self::InvalidReset { row_key } => row_key.as_ref(),
            Self::RowKeyChanged { current, .. } => Some(current),
            Self::OutOfOrderRow { next, .. } => Some(next),
            Self::MissingFamily { row_key }
            | Self::MissingQualifier { row_key }
            | Self::InvalidContinuation { row_key }
            | Self::CommitInsideCell { row_key } => Some(row_key),
            Self::MissingRowKey | Self::ChunkAfterScanComplete | Self::NegativeSampleOffset { .. } => {
                None
            }
        }
    }
}

fn display_key(key: &Option<Bytes>) -> String {
    match key {
        Some(key) => hex::encode(key),
        None => "<none>".to_string(),
    }
}

/// One entry that never reached `ok`.
#[derive(Clone, Debug)]
pub struct EntryFailure {
    /// Position in the caller's original entry sequence.
    pub index: usize,
    /// Last status observed for the entry.
    pub status: Status,
    pub entry: MutationEntry,
}

/// Aggregated report for a mutate call where some entries failed.
#[derive(Clone, Debug)]
pub struct PartialFailure {
    /// Failed entries in original-index order.
    pub failures: Vec<EntryFailure>,
    pub total_entries: usize,
    pub attempts: u32,
    /// The call stopped scheduling attempts because the caller cancelled it.
    pub cancelled: bool,
}

impl PartialFailure {
    pub fn indices(&self) -> Vec<usize> {
        self.failures.iter().map(|failure| failure.index).collect()
    }

    pub fn failure_for(&self, index: usize) -> Option<&EntryFailure> {
        self.failures
            .binary_search_by_key(&index, |failure| failure.index)
            .ok()
            .map(|pos| &self.failures[pos])
    }
}

impl fmt::Display for PartialFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} of {} mutation entries failed after {} attempt(s)",
            self.failures.len(),
            self.total_entries,
            self.attempts
        )?;
        if self.cancelled {
            write!(f, " (cancelled)")?;
        }
        if let Some(first) = self.failures.first() {
            write!(f, "; first failure: entry {} {}", first.index, first.status)?;
        }
        Ok(())
    }
}

impl std::error::Error for PartialFailure {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::StatusCode;

    #[test]
    fn partial_failure_display_names_first_failure() {
        let failure = PartialFailure {
            failures: vec![EntryFailure {
                index: 2,
                status: Status::new(StatusCode::PermissionDenied, "denied"),
                entry: MutationEntry::delete_row("k2"),
            }],
            total_entries: 3,
            attempts: 2,
            cancelled: false,
        };
        assert_eq!(
            failure.to_string(),
            "1 of 3 mutation entries failed after 2 attempt(s); first failure: entry 2 permission_denied: denied"
        );
        assert_eq!(failure.indices(), vec![2]);
        assert!(failure.failure_for(2).is_some());
        assert!(failure.failure_for(0).is_none());
    }

    #[test]
    fn protocol_errors_expose_row_key() {
        let err = ProtocolError::IncompleteRow {
            row_key: Some(Bytes::from_static(b"k")),
        };
        assert_eq!(err.row_key().map(|key| &key[..]), Some(&b"k"[..]));
        assert_eq!(
            err.to_string(),
            "chunk stream ended before row 6b was committed"
        );
        let wrapped = ClientError::from(err);
        assert!(matches!(wrapped, ClientError::Protocol(_)));
    }
}
