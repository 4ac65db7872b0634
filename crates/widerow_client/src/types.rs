//! Shared data model: mutation entries, row filters, read specifications,
//! wire chunks, and assembled rows.
//!
//! These types are plain data. Behaviour lives in the modules
//! that consume them (`planner`, `assembler`, `mutation`).

use std::collections::BTreeMap;

use bytes::Bytes;

use crate::error::ClientError;
use crate::range::RowRange;

/// Timestamp value asking the server to assign the cell timestamp.
pub const SERVER_TIMESTAMP: i64 = -1;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MutationMethod {
    Insert,
    Delete,
}

/// Half-open timestamp range `[start, end)` in microseconds; `None` is unbounded.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TimestampRange {
    pub start_micros: Option<i64>,
    pub end_micros: Option<i64>,
}

impl TimestampRange {
    pub fn contains(&self, timestamp_micros: i64) -> bool {
        self.start_micros.map_or(true, |start| timestamp_micros >= start)
            && self.end_micros.map_or(true, |end| timestamp_micros < end)
    }
}

/// A single edit applied to one row.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ColumnEdit {
    SetCell {
        family: String,
        qualifier: Bytes,
        timestamp_micros: i64,
        value: Bytes,
    },
    DeleteFromColumn {
        family: String,
        qualifier: Bytes,
        time_range: Option<TimestampRange>,
    },
    DeleteFromFamily {
        family: String,
    },
    DeleteFromRow,
}

/// One cell to write in an insert entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CellWrite {
    pub family: String,
    pub qualifier: Bytes,
    pub value: Bytes,
    /// `None` lets the server assign the timestamp.
    pub timestamp_micros: Option<i64>,
}

impl CellWrite {
    pub fn new(
        family: impl Into<String>,
        qualifier: impl Into<Bytes>,
        value: impl Into<Bytes>,
    ) -> Self {
        Self {
            family: family.into(),
            qualifier: qualifier.into(),
            value: value.into(),
            timestamp_micros: None,
        }
    }

    pub fn at(mut self, timestamp_micros: i64) -> Self {
        self.timestamp_micros = Some(timestamp_micros);
        self
    }
}

/// One caller-specified row mutation.
///
/// Entries are identified by their position in the submitted sequence, never by
/// key: several entries may target the same row.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MutationEntry {
    pub key: Bytes,
    pub method: MutationMethod,
    pub edits: Vec<ColumnEdit>,
}

impl MutationEntry {
    pub fn insert<I>(key: impl Into<Bytes>, cells: I) -> Self
    where
        I: IntoIterator<Item = CellWrite>,
    {
        let edits = cells
            .into_iter()
            .map(|cell| ColumnEdit::SetCell {
                family: cell.family,
                qualifier: cell.qualifier,
                timestamp_micros: cell.timestamp_micros.unwrap_or(SERVER_TIMESTAMP),
                value: cell.value,
            })
            .collect();
        Self {
            key: key.into(),
            method: MutationMethod::Insert,
            edits,
        }
    }

    pub fn delete_row(key: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            method: MutationMethod::Delete,
            edits: vec![ColumnEdit::DeleteFromRow],
        }
    }

    /// Delete whole families (`"family"`) or single columns (`"family:qualifier"`).
    ///
    /// `time_range` only applies to column selectors.
    pub fn delete_cells<S>(
        key: impl Into<Bytes>,
        selectors: &[S],
        time_range: Option<TimestampRange>,
    ) -> Result<Self, ClientError>
    where
        S: AsRef<str>,
    {
        if selectors.is_empty() {
            return Err(ClientError::invalid("delete_cells requires at least one selector"));
        }
        let mut edits = Vec::with_capacity(selectors.len());
        for selector in selectors {
            let selector = selector.as_ref();
            let (family, qualifier) = match selector.split_once(':') {
                Some((family, qualifier)) => (family, Some(qualifier)),
                None => (selector, None),
            };
            if family.is_empty() {
                return Err(ClientError::invalid(format!(
                    "delete selector {selector:?} has an empty column family"
                )));
            }
            edits.push(match qualifier {
                Some(qualifier) => ColumnEdit::DeleteFromColumn {
                    family: family.to_string(),
                    qualifier: Bytes::copy_from_slice(qualifier.as_bytes()),
                    time_range,
                },
                None => ColumnEdit::DeleteFromFamily {
                    family: family.to_string(),
                },
            });
        }
        Ok(Self {
            key: key.into(),
            method: MutationMethod::Delete,
            edits,
        })
    }
}

/// Row filter tree passed through to the store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RowFilter {
    PassAll,
    BlockAll,
    FamilyName(String),
    ColumnQualifier(Bytes),
    TimestampRange(TimestampRange),
    CellsPerRowLimit(u32),
    CellsPerColumnLimit(u32),
    StripValue,
    Label(String),
    /// Apply each filter to the output of the previous one.
    Chain(Vec<RowFilter>),
    /// Union of each filter applied to the same input.
    Interleave(Vec<RowFilter>),
}

/// Caller description of one read.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReadSpec {
    pub keys: Vec<Bytes>,
    pub ranges: Vec<RowRange>,
    /// Inclusive start of an explicit bound pair.
    pub start: Option<Bytes>,
    /// Inclusive end of an explicit bound pair.
    pub end: Option<Bytes>,
    pub prefix: Option<Bytes>,
    pub prefixes: Vec<Bytes>,
    pub filter: Option<RowFilter>,
    pub limit: Option<u64>,
    /// Expose UTF-8 cell values as text.
    pub decode: bool,
}

impl Default for ReadSpec {
    fn default() -> Self {
        Self {
            keys: Vec::new(),
            ranges: Vec::new(),
            start: None,
            end: None,
            prefix: None,
            prefixes: Vec::new(),
            filter: None,
            limit: None,
            decode: true,
        }
    }
}

impl ReadSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn key(mut self, key: impl Into<Bytes>) -> Self {
        self.keys.push(key.into());
        self
    }

    pub fn keys<I, K>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<Bytes>,
    {
        self.keys.extend(keys.into_iter().map(Into::into));
        self
    }

    pub fn range(mut self, range: RowRange) -> Self {
        self.ranges.push(range);
        self
    }

    pub fn start(mut self, start: impl Into<Bytes>) -> Self {
        self.start = Some(start.into());
        self
    }

    pub fn end(mut self, end: impl Into<Bytes>) -> Self {
        self.end = Some(end.into());
        self
    }

    pub fn prefix(mut self, prefix: impl Into<Bytes>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    pub fn prefixes<I, K>(mut self, prefixes: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<Bytes>,
    {
        self.prefixes.extend(prefixes.into_iter().map(Into::into));
        self
    }

    pub fn filter(mut self, filter: RowFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn decode(mut self, decode: bool) -> Self {
        self.decode = decode;
        self
    }
}

/// Wire fragment of a row as streamed by a range read.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Chunk {
    /// Present on the first chunk of a row.
    pub row_key: Option<Bytes>,
    /// Present when the family changes; otherwise inherited.
    pub family: Option<String>,
    /// Present when the column changes; otherwise inherited.
    pub qualifier: Option<Bytes>,
    pub timestamp_micros: i64,
    pub labels: Vec<String>,
    pub value: Bytes,
    /// Non-zero when the cell value continues in following chunks.
    pub value_size: u32,
    pub reset_row: bool,
    pub commit_row: bool,
}

impl Chunk {
    /// First chunk of a row.
    pub fn row(key: impl Into<Bytes>) -> Self {
        Self {
            row_key: Some(key.into()),
            ..Self::default()
        }
    }

    /// Chunk continuing the row in progress.
    pub fn cont() -> Self {
        Self::default()
    }

    pub fn reset() -> Self {
        Self {
            reset_row: true,
            ..Self::default()
        }
    }

    pub fn cell(
        mut self,
        family: impl Into<String>,
        qualifier: impl Into<Bytes>,
        value: impl Into<Bytes>,
    ) -> Self {
        self.family = Some(family.into());
        self.qualifier = Some(qualifier.into());
        self.value = value.into();
        self
    }

    pub fn qualifier(mut self, qualifier: impl Into<Bytes>) -> Self {
        self.qualifier = Some(qualifier.into());
        self
    }

    pub fn value(mut self, value: impl Into<Bytes>) -> Self {
        self.value = value.into();
        self
    }

    pub fn at(mut self, timestamp_micros: i64) -> Self {
        self.timestamp_micros = timestamp_micros;
        self
    }

    pub fn labels<I, S>(mut self, labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.labels = labels.into_iter().map(Into::into).collect();
        self
    }

    pub fn split(mut self, value_size: u32) -> Self {
        self.value_size = value_size;
        self
    }

    pub fn commit(mut self) -> Self {
        self.commit_row = true;
        self
    }

    /// Whether the chunk carries anything that describes a cell.
    pub(crate) fn has_cell_data(&self) -> bool {
        self.family.is_some()
            || self.qualifier.is_some()
            || !self.value.is_empty()
            || self.value_size > 0
            || self.timestamp_micros != 0
            || !self.labels.is_empty()
    }
}

/// Cell value as exposed to callers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CellValue {
    Bytes(Bytes),
    Text(String),
}

impl CellValue {
    /// Decode to text when requested and the bytes are valid UTF-8.
    pub fn from_bytes(value: Bytes, decode: bool) -> Self {
        if decode {
            if let Ok(text) = std::str::from_utf8(&value) {
                return Self::Text(text.to_string());
            }
        }
        Self::Bytes(value)
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Bytes(bytes) => bytes.as_ref(),
            Self::Text(text) => text.as_bytes(),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text.as_str()),
            Self::Bytes(_) => None,
        }
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Cell {
    pub value: CellValue,
    pub timestamp_micros: i64,
    pub labels: Vec<String>,
}

/// Qualifier → cells in delivery order (timestamp-descending from the store).
pub type ColumnMap = BTreeMap<Bytes, Vec<Cell>>;

/// A fully assembled row.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AssembledRow {
    pub key: Bytes,
    pub data: BTreeMap<String, ColumnMap>,
}

impl AssembledRow {
    pub fn new(key: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            data: BTreeMap::new(),
        }
    }

    pub fn cells(&self, family: &str, qualifier: &[u8]) -> &[Cell] {
        self.data
            .get(family)
            .and_then(|columns| columns.get(qualifier))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// First delivered cell of a column, which is the newest version.
    pub fn latest(&self, family: &str, qualifier: &[u8]) -> Option<&Cell> {
        self.cells(family, qualifier).first()
    }

    pub fn cell_count(&self) -> usize {
        self.data
            .values()
            .flat_map(|columns| columns.values())
            .map(Vec::len)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.cell_count() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_defaults_to_server_timestamp() {
        let entry = MutationEntry::insert(
            "row",
            [
                CellWrite::new("cf", "a", "1"),
                CellWrite::new("cf", "b", "2").at(42),
            ],
        );
        assert_eq!(entry.method, MutationMethod::Insert);
        assert_eq!(
            entry.edits,
            vec![
                ColumnEdit::SetCell {
                    family: "cf".to_string(),
                    qualifier: Bytes::from_static(b"a"),
                    timestamp_micros: SERVER_TIMESTAMP,
                    value: Bytes::from_static(b"1"),
                },
                ColumnEdit::SetCell {
                    family: "cf".to_string(),
                    qualifier: Bytes::from_static(b"b"),
                    timestamp_micros: 42,
                    value: Bytes::from_static(b"2"),
                },
            ]
        );
    }

    #[test]
    fn delete_selectors_parse_family_and_column() {
        let range = TimestampRange {
            start_micros: Some(10),
            end_micros: None,
        };
        let entry = MutationEntry::delete_cells("row", &["cf1", "cf2:q"], Some(range))
            .expect("valid selectors");
        assert_eq!(
            entry.edits,
            vec![
                ColumnEdit::DeleteFromFamily {
                    family: "cf1".to_string()
                },
                ColumnEdit::DeleteFromColumn {
                    family: "cf2".to_string(),
                    qualifier: Bytes::from_static(b"q"),
                    time_range: Some(range),
                },
            ]
        );
    }

    #[test]
    fn delete_selectors_reject_empty_family() {
        let err = MutationEntry::delete_cells("row", &[":q"], None).unwrap_err();
        assert!(matches!(err, ClientError::InvalidSpecification(_)));
        let empty: [&str; 0] = [];
        assert!(MutationEntry::delete_cells("row", &empty, None).is_err());
    }

    #[test]
    fn decode_falls_back_to_bytes_for_invalid_utf8() {
        let text = CellValue::from_bytes(Bytes::from_static(b"hello"), true);
        assert_eq!(text.as_str(), Some("hello"));
        let raw = CellValue::from_bytes(Bytes::from_static(&[0xFF, 0xFE]), true);
        assert_eq!(raw, CellValue::Bytes(Bytes::from_static(&[0xFF, 0xFE])));
        let undecoded = CellValue::from_bytes(Bytes::from_static(b"hello"), false);
        assert!(undecoded.as_str().is_none());
        assert_eq!(undecoded.as_bytes(), b"hello");
    }

    #[test]
    fn timestamp_range_is_half_open() {
        let range = TimestampRange {
            start_micros: Some(10),
            end_micros: Some(20),
        };
        assert!(range.contains(10));
        assert!(!range.contains(20));
        assert!(TimestampRange::default().contains(i64::MIN));
    }
}
