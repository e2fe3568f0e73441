//! XLSX writer using umya-spreadsheet
//!
//! Headers come from the first record's keys. Data rows are written in
//! `chunk_size` batches with a reclamation hint every few batches. Encoding is
//! CPU-bound and synchronous; async callers should run it on a blocking thread.

use crate::error::CodecError;
use crate::options::ImportOptions;
use crate::reader::RECLAIM_EVERY_CHUNKS;
use crate::types::{column_letter, Record};
use sheetgate_monitor::Reclaimer;
use std::io::Cursor;
use std::sync::Arc;

/// Rows sampled for column auto-sizing
pub const WIDTH_SAMPLE_ROWS: usize = 100;

/// Column width bounds, in characters
pub const MIN_COLUMN_WIDTH: f64 = 10.0;
/// Column width bounds, in characters
pub const MAX_COLUMN_WIDTH: f64 = 50.0;

const HEADER_FILL: &str = "FFD9D9D9";
const DEFAULT_SHEET: &str = "Sheet1";

/// Streaming XLSX writer
#[derive(Debug, Clone)]
pub struct StreamingWriter {
    reclaimer: Arc<Reclaimer>,
}

impl StreamingWriter {
    /// Create a writer that hints `reclaimer` between batches
    #[inline]
    #[must_use]
    pub fn new(reclaimer: Arc<Reclaimer>) -> Self {
        Self { reclaimer }
    }

    /// Encode `rows` as a single-sheet XLSX workbook.
    ///
    /// # Errors
    /// - `CodecError::EmptyData` if `rows` is empty
    /// - `CodecError::Encode` if the workbook cannot be serialized
    pub fn write(&self, rows: &[Record], sheet_name: &str, options: &ImportOptions) -> Result<Vec<u8>, CodecError> {
        let Some(first) = rows.first() else {
            return Err(CodecError::EmptyData);
        };
        let headers: Vec<String> = first.keys().cloned().collect();

        let mut book = umya_spreadsheet::new_file();
        let sheet = book
            .get_sheet_by_name_mut(DEFAULT_SHEET)
            .ok_or_else(|| CodecError::Encode("default sheet missing".to_string()))?;
        if !sheet_name.is_empty() {
            sheet.set_name(sheet_name);
        }

        for (index, header) in headers.iter().enumerate() {
            let coordinate = (sheet_col(index), 1);
            sheet.get_cell_mut(coordinate).set_value(header.clone());
            let style = sheet.get_style_mut(coordinate);
            style.get_font_mut().set_bold(true);
            style.set_background_color(HEADER_FILL);
        }

        let chunk_size = options.effective_chunk_size();
        for (batch, chunk) in rows.chunks(chunk_size).enumerate() {
            let base = batch * chunk_size;
            for (offset, record) in chunk.iter().enumerate() {
                let row = sheet_row(base + offset + 1);
                for (index, header) in headers.iter().enumerate() {
                    if let Some(value) = record.get(header) {
                        sheet.get_cell_mut((sheet_col(index), row)).set_value(value.clone());
                    }
                }
            }
            tracing::debug!(batch, rows = chunk.len(), "batch written");
            if (batch + 1) % RECLAIM_EVERY_CHUNKS == 0 {
                self.reclaimer.suggest();
            }
        }

        for (index, width) in column_widths(&headers, rows).into_iter().enumerate() {
            sheet
                .get_column_dimension_mut(&column_letter(index))
                .set_width(width);
        }

        let mut buffer = Cursor::new(Vec::new());
        umya_spreadsheet::writer::xlsx::write_writer(&book, &mut buffer)
            .map_err(|err| CodecError::Encode(err.to_string()))?;

        let bytes = buffer.into_inner();
        tracing::info!(rows = rows.len(), columns = headers.len(), bytes = bytes.len(), "workbook written");
        Ok(bytes)
    }
}

/// Width per header: the longest value among the header and the first
/// [`WIDTH_SAMPLE_ROWS`] rows, clamped to the width bounds.
#[must_use]
pub fn column_widths(headers: &[String], rows: &[Record]) -> Vec<f64> {
    headers
        .iter()
        .map(|header| {
            let longest = rows
                .iter()
                .take(WIDTH_SAMPLE_ROWS)
                .filter_map(|record| record.get(header))
                .map(|value| value.chars().count())
                .chain(std::iter::once(header.chars().count()))
                .max()
                .unwrap_or(0);
            (longest as f64).clamp(MIN_COLUMN_WIDTH, MAX_COLUMN_WIDTH)
        })
        .collect()
}

fn sheet_col(index: usize) -> u32 {
    u32::try_from(index + 1).unwrap_or(u32::MAX)
}

fn sheet_row(data_row: usize) -> u32 {
    u32::try_from(data_row + 1).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::StreamingReader;
    use pretty_assertions::assert_eq;
    use sheetgate_monitor::{FileKind, MemoryProbe, NoopProbe};

    fn record(pairs: &[(&str, &str)]) -> Record {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    fn reclaimer() -> Arc<Reclaimer> {
        Arc::new(Reclaimer::new(Arc::new(NoopProbe)))
    }

    #[test]
    fn empty_rows_rejected() {
        let writer = StreamingWriter::new(reclaimer());
        let err = writer.write(&[], "Data", &ImportOptions::default()).unwrap_err();
        assert!(matches!(err, CodecError::EmptyData));
    }

    #[test]
    fn widths_clamped() {
        let headers = vec!["id".to_string(), "description".to_string()];
        let rows = vec![
            record(&[("id", "1"), ("description", &"x".repeat(80))]),
            record(&[("id", "2"), ("description", "short")]),
        ];
        assert_eq!(column_widths(&headers, &rows), vec![10.0, 50.0]);
    }

    #[test]
    fn widths_sample_only_first_hundred_rows() {
        let headers = vec!["name".to_string()];
        let mut rows: Vec<Record> = (0..WIDTH_SAMPLE_ROWS).map(|_| record(&[("name", "abc")])).collect();
        rows.push(record(&[("name", &"y".repeat(40))]));
        assert_eq!(column_widths(&headers, &rows), vec![10.0]);

        let headers = vec!["a_rather_long_header_name".to_string()];
        assert_eq!(column_widths(&headers, &[]), vec![25.0]);
    }

    #[tokio::test]
    async fn written_workbook_reads_back() {
        let reclaimer = reclaimer();
        let writer = StreamingWriter::new(Arc::clone(&reclaimer));
        let rows = vec![
            record(&[("name", "Alice"), ("age", "30")]),
            record(&[("name", "Bob"), ("age", "41")]),
            record(&[("name", "Carol"), ("age", "27")]),
        ];
        let bytes = writer
            .write(&rows, "People", &ImportOptions::default().with_chunk_size(2))
            .unwrap();

        let probe: Arc<dyn MemoryProbe> = Arc::new(NoopProbe);
        let reader = StreamingReader::new(probe, reclaimer);
        let result = reader
            .read(&bytes, FileKind::Xlsx, &ImportOptions::default())
            .await
            .unwrap();

        assert_eq!(result.metadata.sheet_name, "People");
        assert_eq!(result.rows, rows);
        assert!(result.errors.is_empty());
    }
}
