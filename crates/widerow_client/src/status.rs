//! Remote status codes and per-entry batch results.
//!
//! The code space mirrors the canonical RPC status codes used by the store.
//! Only a small fixed set is considered transient; everything else that is not
//! `Ok` is terminal for the entry that reported it.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Canonical remote status code.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusCode {
    Ok = 0,
    Cancelled = 1,
    Unknown = 2,
    InvalidArgument = 3,
    DeadlineExceeded = 4,
    NotFound = 5,
    AlreadyExists = 6,
    PermissionDenied = 7,
    ResourceExhausted = 8,
    FailedPrecondition = 9,
    Aborted = 10,
    OutOfRange = 11,
    Unimplemented = 12,
    Internal = 13,
    Unavailable = 14,
    DataLoss = 15,
    Unauthenticated = 16,
}

impl StatusCode {
    /// Map a raw wire code, treating anything outside the known space as `Unknown`.
    pub fn from_i32(code: i32) -> Self {
        match code {
            0 => Self::Ok,
            1 => Self::Cancelled,
            3 => Self::InvalidArgument,
            4 => Self::DeadlineExceeded,
            5 => Self::NotFound,
            6 => Self::AlreadyExists,
            7 => Self::PermissionDenied,
            8 => Self::ResourceExhausted,
            9 => Self::FailedPrecondition,
            10 => Self::Aborted,
            11 => Self::OutOfRange,
            12 => Self::Unimplemented,
            13 => Self::Internal,
            14 => Self::Unavailable,
            15 => Self::DataLoss,
            16 => Self::Unauthenticated,
            _ => Self::Unknown,
        }
    }

    pub fn as_i32(self) -> i32 {
        self as i32
    }

    pub fn is_ok(self) -> bool {
        self == Self::Ok
    }

    /// Whether an entry that reported this code may be re-submitted.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::DeadlineExceeded | Self::Aborted | Self::Unavailable
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Cancelled => "cancelled",
            Self::Unknown => "unknown",
            Self::InvalidArgument => "invalid_argument",
            Self::DeadlineExceeded => "deadline_exceeded",
            Self::NotFound => "not_found",
            Self::AlreadyExists => "already_exists",
            Self::PermissionDenied => "permission_denied",
            Self::ResourceExhausted => "resource_exhausted",
            Self::FailedPrecondition => "failed_precondition",
            Self::Aborted => "aborted",
            Self::OutOfRange => "out_of_range",
            Self::Unimplemented => "unimplemented",
            Self::Internal => "internal",
            Self::Unavailable => "unavailable",
            Self::DataLoss => "data_loss",
            Self::Unauthenticated => "unauthenticated",
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status reported for one entry (code plus server-provided message).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Status {
    pub code: StatusCode,
    pub message: String,
}

impl Status {
    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn ok() -> Self {
        Self::new(StatusCode::Ok, "")
    }

    pub fn is_ok(&self) -> bool {
        self.code.is_ok()
    }

    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }
}

impl From<StatusCode> for Status {
    fn from(code: StatusCode) -> Self {
        Self::new(code, "")
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.code)
        } else {
            write!(f, "{}: {}", self.code, self.message)
        }
    }
}

/// One per-entry result streamed back for a batch call.
///
/// `index` is the entry's position inside the batch that was sent, not its
/// position in the caller's original sequence.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EntryResult {
    pub index: usize,
    pub status: Status,
}

impl EntryResult {
    pub fn new(index: usize, status: impl Into<Status>) -> Self {
        Self {
            index,
            status: status.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_set_is_exactly_transient_codes() {
        let retryable = (0..=16)
            .map(StatusCode::from_i32)
            .filter(|code| code.is_retryable())
            .collect::<Vec<_>>();
        assert_eq!(
            retryable,
            vec![
                StatusCode::DeadlineExceeded,
                StatusCode::Aborted,
                StatusCode::Unavailable
            ]
        );
    }

    #[test]
    fn unknown_wire_codes_map_to_unknown() {
        assert_eq!(StatusCode::from_i32(99), StatusCode::Unknown);
        assert_eq!(StatusCode::from_i32(-1), StatusCode::Unknown);
        assert_eq!(StatusCode::from_i32(14).as_i32(), 14);
    }

    #[test]
    fn status_display_includes_message() {
        let status = Status::new(StatusCode::PermissionDenied, "no write access");
        assert_eq!(status.to_string(), "permission_denied: no write access");
        assert_eq!(Status::ok().to_string(), "ok");
    }
}
