//! Result and report types

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;

/// One parsed row: header name to sanitized value, in column order
pub type Record = IndexMap<String, String>;

/// Spreadsheet letter for a zero-based column index (`0` → `A`, `26` → `AA`)
#[must_use]
pub fn column_letter(index: usize) -> String {
    let mut n = index + 1;
    let mut letters = Vec::new();
    while n > 0 {
        let rem = (n - 1) % 26;
        letters.push(b'A' + rem as u8);
        n = (n - 1) / 26;
    }
    letters.reverse();
    letters.into_iter().map(char::from).collect()
}

/// What went wrong with a cell or row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CellErrorKind {
    /// Value matched the denylist; the cell was excluded
    DangerousContent,
    /// Formula cell while formulas are disallowed; the cell was excluded
    FormulaBlocked,
    /// Row could not be read; the row was excluded
    Row,
    /// Value repeats an earlier row's value for the unique field; row kept
    Duplicate,
}

impl fmt::Display for CellErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::DangerousContent => "dangerous content",
            Self::FormulaBlocked => "formula blocked",
            Self::Row => "row error",
            Self::Duplicate => "duplicate",
        })
    }
}

/// Non-fatal per-cell or per-row problem
///
/// `row` is the 1-based data row (the row after the header is `1`); header
/// problems use row `0`. `column` is absent for whole-row problems.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellError {
    /// Data row number
    pub row: usize,
    /// Spreadsheet column letter
    pub column: Option<String>,
    /// Problem class
    pub kind: CellErrorKind,
    /// Human-readable detail
    pub message: String,
}

impl CellError {
    /// Error for one cell
    #[must_use]
    pub fn cell(row: usize, column: impl Into<String>, kind: CellErrorKind, message: impl Into<String>) -> Self {
        Self {
            row,
            column: Some(column.into()),
            kind,
            message: message.into(),
        }
    }

    /// Error for a whole row
    #[must_use]
    pub fn row(row: usize, message: impl Into<String>) -> Self {
        Self {
            row,
            column: None,
            kind: CellErrorKind::Row,
            message: message.into(),
        }
    }

    /// Whether this error concerns the header row
    #[inline]
    #[must_use]
    pub fn is_header(&self) -> bool {
        self.row == 0
    }
}

impl fmt::Display for CellError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.column {
            Some(column) => write!(f, "row {} column {}: {}: {}", self.row, column, self.kind, self.message),
            None => write!(f, "row {}: {}: {}", self.row, self.kind, self.message),
        }
    }
}

/// Timing, memory and accounting for one call
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportMetadata {
    /// Raw row count of the processed sheet, header included
    pub total_rows: usize,
    /// Used column count of the processed sheet
    pub total_columns: usize,
    /// Processed sheet
    pub sheet_name: String,
    /// Wall-clock duration of the call
    pub processing_time_ms: u64,
    /// Growth of `heap_used` across the call (zero when unavailable)
    pub memory_used_bytes: u64,
    /// Rows dropped because no field was populated
    pub skipped_rows: usize,
    /// Cells cut to `max_cell_length`
    pub truncated_cells: usize,
    /// Processing windows
    pub chunks: usize,
    /// Whether windows ran on the execution pool
    pub dispatched: bool,
}

/// Outcome of a read
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportResult {
    /// Parsed rows in source order
    pub rows: Vec<Record>,
    /// Accumulated cell and row errors
    pub errors: Vec<CellError>,
    /// Call metadata
    pub metadata: ImportMetadata,
}

impl ImportResult {
    /// Whether any cell or row error was recorded
    #[inline]
    #[must_use]
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }
}

/// Outcome of a validate-only call
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    /// No fatal problem and no header error
    pub is_valid: bool,
    /// Fatal problem that would have rejected the file
    pub fatal: Option<String>,
    /// Header problems
    pub errors: Vec<CellError>,
    /// Call metadata (row accounting fields stay zero)
    pub metadata: ImportMetadata,
}

/// First rows of a file, for upload wizards
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Preview {
    /// Mapped header names in column order
    pub headers: Vec<String>,
    /// Up to `sample_size` parsed rows
    pub rows: Vec<Record>,
    /// Errors within the sampled rows and the header
    pub errors: Vec<CellError>,
    /// Raw row count of the sheet, header included
    pub total_rows: usize,
    /// Processed sheet
    pub sheet_name: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn column_letters() {
        assert_eq!(column_letter(0), "A");
        assert_eq!(column_letter(1), "B");
        assert_eq!(column_letter(25), "Z");
        assert_eq!(column_letter(26), "AA");
        assert_eq!(column_letter(27), "AB");
        assert_eq!(column_letter(701), "ZZ");
        assert_eq!(column_letter(702), "AAA");
    }

    #[test]
    fn cell_error_display() {
        let err = CellError::cell(2, "B", CellErrorKind::DangerousContent, "script tag");
        assert_eq!(err.to_string(), "row 2 column B: dangerous content: script tag");
        assert!(!err.is_header());
        assert_eq!(CellError::row(4, "bad").to_string(), "row 4: row error: bad");
    }
}
