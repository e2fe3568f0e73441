//! Chunk row processing
//!
//! A [`ChunkTask`] owns everything needed to turn a window of raw rows into
//! records: no shared mutable state, so it can run inline or on a pool worker.
//! [`ChunkExecutor`] is the seam through which the reader hands tasks to a pool.

use crate::error::CodecError;
use crate::options::ImportOptions;
use crate::security::sanitize_with_report;
use crate::source::{SourceCell, SourceRow};
use crate::types::{column_letter, CellError, CellErrorKind, Record};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Per-cell policy extracted from [`ImportOptions`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CellPolicy {
    /// Truncation limit in chars
    pub max_cell_length: usize,
    /// Keep formula cells
    pub allow_formulas: bool,
    /// Keep markup
    pub allow_html: bool,
}

impl From<&ImportOptions> for CellPolicy {
    fn from(options: &ImportOptions) -> Self {
        Self {
            max_cell_length: options.max_cell_length,
            allow_formulas: options.allow_formulas,
            allow_html: options.allow_html,
        }
    }
}

/// Column-index to header-name mapping; `None` leaves a column unmapped
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderMap {
    /// Absolute zero-based column of the first mapped slot
    pub first_column: usize,
    /// Names by relative column
    pub columns: Vec<Option<String>>,
}

impl HeaderMap {
    /// Header name for a relative column
    #[inline]
    #[must_use]
    pub fn name(&self, column: usize) -> Option<&str> {
        self.columns.get(column).and_then(Option::as_deref)
    }

    /// Spreadsheet letter for a relative column
    #[inline]
    #[must_use]
    pub fn letter(&self, column: usize) -> String {
        column_letter(self.first_column + column)
    }

    /// Mapped names in column order
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.columns.iter().flatten().cloned().collect()
    }
}

/// One window of raw rows
#[derive(Debug, Clone)]
pub struct ChunkTask {
    /// Window position within the import
    pub index: usize,
    /// Data-row number of the first row in `rows`
    pub first_row: usize,
    /// Raw rows
    pub rows: Vec<SourceRow>,
    /// Shared header mapping
    pub headers: Arc<HeaderMap>,
    /// Cell policy
    pub policy: CellPolicy,
}

/// A kept row with its data-row number
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedRow {
    /// Data-row number
    pub row: usize,
    /// Sanitized fields
    pub record: Record,
}

/// Result of processing one window
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChunkOutcome {
    /// Window position within the import
    pub index: usize,
    /// Kept rows in source order
    pub rows: Vec<ParsedRow>,
    /// Cell and row errors in source order
    pub errors: Vec<CellError>,
    /// Rows dropped for having no populated field
    pub skipped_rows: usize,
    /// Cells cut to the length limit
    pub truncated_cells: usize,
}

/// Processing stopped because cancellation was requested
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("chunk {index} cancelled after {processed} rows")]
pub struct ChunkCancelled {
    /// Window position
    pub index: usize,
    /// Rows processed before stopping
    pub processed: usize,
}

/// Turn a window of raw rows into records.
///
/// Checks `cancel` before every row.
///
/// # Errors
/// `ChunkCancelled` when `cancel` is raised mid-window
pub fn process_chunk(task: &ChunkTask, cancel: &AtomicBool) -> Result<ChunkOutcome, ChunkCancelled> {
    let mut outcome = ChunkOutcome {
        index: task.index,
        ..ChunkOutcome::default()
    };

    for (offset, raw) in task.rows.iter().enumerate() {
        if cancel.load(Ordering::Relaxed) {
            return Err(ChunkCancelled {
                index: task.index,
                processed: offset,
            });
        }
        let row = task.first_row + offset;

        let cells = match raw {
            SourceRow::Cells(cells) => cells,
            SourceRow::Malformed(message) => {
                outcome.errors.push(CellError::row(row, message.clone()));
                continue;
            }
        };

        let mut record = Record::new();
        for (column, cell) in cells.iter().enumerate() {
            let Some(name) = task.headers.name(column) else {
                continue;
            };
            let raw_value = match cell {
                SourceCell::Empty => continue,
                SourceCell::Formula(_) if !task.policy.allow_formulas => {
                    outcome.errors.push(CellError::cell(
                        row,
                        task.headers.letter(column),
                        CellErrorKind::FormulaBlocked,
                        "formulas are not allowed",
                    ));
                    continue;
                }
                SourceCell::Formula(text) | SourceCell::Value(text) => text,
            };

            match sanitize_with_report(raw_value, task.policy.max_cell_length, task.policy.allow_html) {
                Ok(sanitized) => {
                    if sanitized.truncated {
                        outcome.truncated_cells += 1;
                        tracing::debug!(
                            row,
                            column = %task.headers.letter(column),
                            limit = task.policy.max_cell_length,
                            "cell truncated"
                        );
                    }
                    if !sanitized.value.is_empty() {
                        record.insert(name.to_string(), sanitized.value);
                    }
                }
                Err(err) => outcome.errors.push(CellError::cell(
                    row,
                    task.headers.letter(column),
                    CellErrorKind::DangerousContent,
                    err.to_string(),
                )),
            }
        }

        if record.is_empty() {
            outcome.skipped_rows += 1;
        } else {
            outcome.rows.push(ParsedRow { row, record });
        }
    }

    Ok(outcome)
}

/// Runs chunk tasks somewhere other than the caller's task
#[async_trait]
pub trait ChunkExecutor: Send + Sync {
    /// Process one window and return its outcome
    ///
    /// # Errors
    /// `CodecError::Dispatch` when the window could not be processed
    async fn execute(&self, task: ChunkTask) -> Result<ChunkOutcome, CodecError>;

    /// Windows worth keeping in flight at once
    fn parallelism(&self) -> usize;
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn headers(names: &[&str]) -> Arc<HeaderMap> {
        Arc::new(HeaderMap {
            first_column: 0,
            columns: names.iter().map(|n| Some((*n).to_string())).collect(),
        })
    }

    fn value(text: &str) -> SourceCell {
        SourceCell::Value(text.to_string())
    }

    fn task(rows: Vec<SourceRow>, policy: CellPolicy) -> ChunkTask {
        ChunkTask {
            index: 0,
            first_row: 1,
            rows,
            headers: headers(&["name", "age"]),
            policy,
        }
    }

    fn policy() -> CellPolicy {
        CellPolicy::from(&ImportOptions::default())
    }

    #[test]
    fn dangerous_cell_excluded_row_kept() {
        let rows = vec![
            SourceRow::Cells(vec![value("Alice"), value("30")]),
            SourceRow::Cells(vec![value("Bob"), value("<script>x</script>")]),
        ];
        let outcome = process_chunk(&task(rows, policy()), &AtomicBool::new(false)).unwrap();

        assert_eq!(outcome.rows.len(), 2);
        assert_eq!(outcome.rows[1].record.get("name").map(String::as_str), Some("Bob"));
        assert!(outcome.rows[1].record.get("age").is_none());
        assert_eq!(outcome.errors.len(), 1);
        assert_eq!(outcome.errors[0].row, 2);
        assert_eq!(outcome.errors[0].column.as_deref(), Some("B"));
        assert_eq!(outcome.errors[0].kind, CellErrorKind::DangerousContent);
    }

    #[test]
    fn blank_rows_skipped_silently() {
        let rows = vec![
            SourceRow::Cells(vec![SourceCell::Empty, SourceCell::Empty]),
            SourceRow::Cells(vec![value("  "), value("<b></b>")]),
        ];
        let outcome = process_chunk(&task(rows, policy()), &AtomicBool::new(false)).unwrap();
        assert!(outcome.rows.is_empty());
        assert!(outcome.errors.is_empty());
        assert_eq!(outcome.skipped_rows, 2);
    }

    #[test]
    fn formula_blocked_unless_allowed() {
        let rows = vec![SourceRow::Cells(vec![
            value("Carol"),
            SourceCell::Formula("=1+1".into()),
        ])];

        let blocked = process_chunk(&task(rows.clone(), policy()), &AtomicBool::new(false)).unwrap();
        assert_eq!(blocked.errors[0].kind, CellErrorKind::FormulaBlocked);
        assert_eq!(blocked.rows[0].record.len(), 1);

        let allowed_policy = CellPolicy {
            allow_formulas: true,
            ..policy()
        };
        let allowed = process_chunk(&task(rows, allowed_policy), &AtomicBool::new(false)).unwrap();
        assert!(allowed.errors.is_empty());
        assert_eq!(allowed.rows[0].record.get("age").map(String::as_str), Some("=1+1"));
    }

    #[test]
    fn truncation_counted_not_reported() {
        let long = "x".repeat(12_000);
        let rows = vec![SourceRow::Cells(vec![value(&long)])];
        let outcome = process_chunk(&task(rows, policy()), &AtomicBool::new(false)).unwrap();
        assert!(outcome.errors.is_empty());
        assert_eq!(outcome.truncated_cells, 1);
        assert_eq!(outcome.rows[0].record["name"].chars().count(), 10_000);
    }

    #[test]
    fn malformed_row_recorded_and_rest_continue() {
        let rows = vec![
            SourceRow::Malformed("invalid UTF-8 in column A".into()),
            SourceRow::Cells(vec![value("Dan")]),
        ];
        let outcome = process_chunk(&task(rows, policy()), &AtomicBool::new(false)).unwrap();
        assert_eq!(outcome.errors, vec![CellError::row(1, "invalid UTF-8 in column A")]);
        assert_eq!(outcome.rows.len(), 1);
        assert_eq!(outcome.rows[0].row, 2);
    }

    #[test]
    fn unmapped_columns_ignored() {
        let mut t = task(vec![SourceRow::Cells(vec![value("Eve"), value("40"), value("extra")])], policy());
        t.headers = Arc::new(HeaderMap {
            first_column: 0,
            columns: vec![Some("name".into()), None],
        });
        let outcome = process_chunk(&t, &AtomicBool::new(false)).unwrap();
        assert_eq!(outcome.rows[0].record.len(), 1);
    }

    #[test]
    fn cancel_stops_processing() {
        let rows = vec![SourceRow::Cells(vec![value("Fay")])];
        let err = process_chunk(&task(rows, policy()), &AtomicBool::new(true)).unwrap_err();
        assert_eq!(err.processed, 0);
    }
}
