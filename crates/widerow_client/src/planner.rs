//! Translation of a caller `ReadSpec` into the request sent to the store.
//!
//! The planner is a faithful translator: it does not coalesce or deduplicate
//! ranges, and it does not reorder keys. Overlap handling is the store's job.

use bytes::Bytes;

use crate::error::ClientError;
use crate::range::{bounds_to_range, prefix_to_range, prefixes_to_ranges, RowRange};
use crate::types::{ReadSpec, RowFilter};

/// Request descriptor handed to the transport for one read.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReadRequest {
    pub app_profile_id: Option<String>,
    /// Keys fetched independently, in caller order.
    pub row_keys: Vec<Bytes>,
    pub row_ranges: Vec<RowRange>,
    pub filter: Option<RowFilter>,
    pub rows_limit: Option<u64>,
    /// Expose UTF-8 cell values of the assembled rows as text.
    pub decode: bool,
}

impl ReadRequest {
    /// No keys and no ranges: the whole table is read.
    pub fn is_full_scan(&self) -> bool {
        self.row_keys.is_empty() && self.row_ranges.is_empty()
    }

    /// Whether `key` is selected by the explicit keys or any range.
    pub fn selects(&self, key: &[u8]) -> bool {
        self.is_full_scan()
            || self.row_keys.iter().any(|candidate| candidate.as_ref() == key)
            || self.row_ranges.iter().any(|range| range.contains(key))
    }
}

/// Build the request for `spec`.
///
/// Ranges are emitted in this order: caller-supplied ranges, the `start`/`end`
/// pair, `prefix`, then `prefixes`.
pub fn plan_read(spec: &ReadSpec) -> Result<ReadRequest, ClientError> {
    if spec.limit == Some(0) {
        return Err(ClientError::invalid("row limit must be greater than zero"));
    }

    if let Some(position) = spec.keys.iter().position(|key| key.is_empty()) {
        return Err(ClientError::invalid(format!(
            "row key at position {position} is empty"
        )));
    }

    let mut row_ranges = Vec::with_capacity(
        spec.ranges.len() + spec.prefixes.len() + 2,
    );
    for (position, range) in spec.ranges.iter().enumerate() {
        if range.is_empty() {
            return Err(ClientError::invalid(format!(
                "row range at position {position} is empty: {range}"
            )));
        }
        row_ranges.push(range.clone());
    }

    if spec.start.is_some() || spec.end.is_some() {
        let range = bounds_to_range(spec.start.as_ref(), spec.end.as_ref());
        if range.is_empty() {
            return Err(ClientError::invalid(format!(
                "start bound sorts after end bound: {range}"
            )));
        }
        row_ranges.push(range);
    }

    if let Some(prefix) = spec.prefix.as_ref() {
        row_ranges.push(prefix_to_range(prefix));
    }
    row_ranges.extend(prefixes_to_ranges(&spec.prefixes));

    Ok(ReadRequest {
        app_profile_id: None,
        row_keys: spec.keys.clone(),
        row_ranges,
        filter: spec.filter.clone(),
        rows_limit: spec.limit,
        decode: spec.decode,
    })
}
