//! Chunked, security-checked reader
//!
//! `read` fails fast on file-level limits, maps the header row, then walks the
//! data rows in fixed windows. Windows run inline with a yield between them,
//! or on a [`ChunkExecutor`] for large sheets. Either way they are reassembled
//! in source order, so chunking never changes the output.

use crate::cache::SanitizeCache;
use crate::chunk::{process_chunk, CellPolicy, ChunkExecutor, ChunkOutcome, ChunkTask, HeaderMap, ParsedRow};
use crate::error::CodecError;
use crate::options::ImportOptions;
use crate::source::{decode, SheetGrid, SheetLimits, SourceCell, SourceFormat, SourceRow};
use crate::types::{CellError, CellErrorKind, ImportMetadata, ImportResult, Preview, ValidationReport};
use futures::stream::{self, StreamExt};
use sheetgate_monitor::{FileKind, MemoryProbe, RawMemory, Reclaimable, Reclaimer};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Instant;

/// Windows between reclamation hints
pub const RECLAIM_EVERY_CHUNKS: usize = 5;

/// Default preview sample size
pub const DEFAULT_PREVIEW_ROWS: usize = 10;

/// Progress notification after each reassembled window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkProgress {
    /// Window position
    pub index: usize,
    /// Windows in this import
    pub total: usize,
    /// Data rows covered so far
    pub rows_processed: usize,
}

/// Streaming tabular reader
pub struct StreamingReader {
    probe: Arc<dyn MemoryProbe>,
    reclaimer: Arc<Reclaimer>,
    cache: Arc<SanitizeCache>,
    executor: Option<Arc<dyn ChunkExecutor>>,
    parallel_row_threshold: usize,
}

impl std::fmt::Debug for StreamingReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingReader")
            .field("has_executor", &self.executor.is_some())
            .field("parallel_row_threshold", &self.parallel_row_threshold)
            .finish_non_exhaustive()
    }
}

struct HeaderScan {
    map: HeaderMap,
    errors: Vec<CellError>,
    truncated: usize,
}

#[derive(Default)]
struct Accumulator {
    rows: Vec<ParsedRow>,
    errors: Vec<CellError>,
    skipped_rows: usize,
    truncated_cells: usize,
    chunks: usize,
    rows_processed: usize,
}

impl Accumulator {
    fn absorb(&mut self, outcome: ChunkOutcome, window_rows: usize) {
        self.rows.extend(outcome.rows);
        self.errors.extend(outcome.errors);
        self.skipped_rows += outcome.skipped_rows;
        self.truncated_cells += outcome.truncated_cells;
        self.chunks += 1;
        self.rows_processed += window_rows;
    }
}

impl StreamingReader {
    /// Create a reader that runs every window inline.
    ///
    /// The reader's sanitize cache is registered with `reclaimer`.
    #[must_use]
    pub fn new(probe: Arc<dyn MemoryProbe>, reclaimer: Arc<Reclaimer>) -> Self {
        let cache = Arc::new(SanitizeCache::default());
        let as_dyn: Arc<dyn Reclaimable> = cache.clone();
        reclaimer.register(&as_dyn);
        Self {
            probe,
            reclaimer,
            cache,
            executor: None,
            parallel_row_threshold: usize::MAX,
        }
    }

    /// Dispatch windows to `executor` for sheets with more than `threshold` data rows
    #[inline]
    #[must_use]
    pub fn with_executor(mut self, executor: Arc<dyn ChunkExecutor>, threshold: usize) -> Self {
        self.executor = Some(executor);
        self.parallel_row_threshold = threshold;
        self
    }

    /// Header sanitize cache
    #[inline]
    #[must_use]
    pub fn cache(&self) -> &Arc<SanitizeCache> {
        &self.cache
    }

    /// Read a buffer into records.
    ///
    /// # Errors
    /// - `CodecError::FileTooLarge` if the buffer exceeds `max_file_size`
    /// - `CodecError::NoSheet` if there is no sheet to process
    /// - `CodecError::DimensionExceeded` if the sheet is too tall or wide
    /// - `CodecError::Decode` if the bytes cannot be parsed
    /// - `CodecError::Dispatch` if a dispatched window fails
    pub async fn read(&self, buffer: &[u8], kind: FileKind, options: &ImportOptions) -> Result<ImportResult, CodecError> {
        self.read_observed(buffer, kind, options, &mut |_| {}).await
    }

    /// [`read`](Self::read), calling `observer` after each reassembled window.
    ///
    /// # Errors
    /// Same as [`read`](Self::read)
    pub async fn read_observed(
        &self,
        buffer: &[u8],
        kind: FileKind,
        options: &ImportOptions,
        observer: &mut (dyn FnMut(ChunkProgress) + Send),
    ) -> Result<ImportResult, CodecError> {
        let started = Instant::now();
        let before = self.probe.sample();

        let grid = self.load(buffer, kind, options)?;
        let scan = self.scan_headers(&grid, options);
        let headers = Arc::new(scan.map);

        let SheetGrid {
            name: sheet_name,
            width: total_columns,
            rows: raw_rows,
            ..
        } = grid;
        let total_rows = raw_rows.len();
        let data_rows: Vec<SourceRow> = raw_rows.into_iter().skip(1).collect();
        let data_len = data_rows.len();

        let chunk_size = options.effective_chunk_size();
        let windowed = options.use_streaming && data_len > chunk_size;
        let window = if windowed { chunk_size } else { data_len.max(1) };
        let tasks = build_tasks(data_rows, window, &headers, CellPolicy::from(options));
        let total = tasks.len();

        let dispatched = windowed && data_len > self.parallel_row_threshold && self.executor.is_some();
        tracing::info!(
            sheet = %sheet_name,
            rows = data_len,
            columns = total_columns,
            windows = total,
            dispatched,
            "reading sheet"
        );

        let mut acc = Accumulator {
            errors: scan.errors,
            truncated_cells: scan.truncated,
            ..Accumulator::default()
        };

        match (&self.executor, dispatched) {
            (Some(executor), true) => {
                let sizes: Vec<usize> = tasks.iter().map(|task| task.rows.len()).collect();
                let mut outcomes = stream::iter(tasks)
                    .map(|task| executor.execute(task))
                    .buffered(executor.parallelism().max(1));
                while let Some(outcome) = outcomes.next().await {
                    let outcome = outcome?;
                    let size = sizes.get(outcome.index).copied().unwrap_or(0);
                    self.after_window(&mut acc, outcome, size, total, observer);
                }
            }
            _ => {
                let never = AtomicBool::new(false);
                for task in tasks {
                    let size = task.rows.len();
                    let outcome = process_chunk(&task, &never)
                        .map_err(|cancelled| CodecError::Dispatch(cancelled.to_string()))?;
                    self.after_window(&mut acc, outcome, size, total, observer);
                    if windowed {
                        tokio::task::yield_now().await;
                    }
                }
            }
        }

        if let Some(field) = &options.unique_field {
            acc.errors.extend(find_duplicates(&acc.rows, field, &headers));
        }

        let after = self.probe.sample();
        let metadata = ImportMetadata {
            total_rows,
            total_columns,
            sheet_name,
            processing_time_ms: elapsed_ms(started),
            memory_used_bytes: memory_delta(&before, &after),
            skipped_rows: acc.skipped_rows,
            truncated_cells: acc.truncated_cells,
            chunks: acc.chunks,
            dispatched,
        };

        tracing::info!(
            rows = acc.rows.len(),
            errors = acc.errors.len(),
            skipped = metadata.skipped_rows,
            elapsed_ms = metadata.processing_time_ms,
            "sheet read"
        );

        Ok(ImportResult {
            rows: acc.rows.into_iter().map(|parsed| parsed.record).collect(),
            errors: acc.errors,
            metadata,
        })
    }

    /// Run the file-level checks and header scan without materializing rows.
    ///
    /// Fatal conditions are reported in the result instead of as errors.
    #[must_use]
    pub fn validate(&self, buffer: &[u8], kind: FileKind, options: &ImportOptions) -> ValidationReport {
        let started = Instant::now();
        let before = self.probe.sample();

        let grid = match self.load(buffer, kind, options) {
            Ok(grid) => grid,
            Err(err) => {
                tracing::info!(error = %err, "validation failed");
                return ValidationReport {
                    is_valid: false,
                    fatal: Some(err.to_string()),
                    errors: Vec::new(),
                    metadata: ImportMetadata {
                        processing_time_ms: elapsed_ms(started),
                        ..ImportMetadata::default()
                    },
                };
            }
        };

        let scan = self.scan_headers(&grid, options);
        let after = self.probe.sample();
        ValidationReport {
            is_valid: scan.errors.is_empty(),
            fatal: None,
            errors: scan.errors,
            metadata: ImportMetadata {
                total_rows: grid.total_rows(),
                total_columns: grid.width,
                sheet_name: grid.name,
                processing_time_ms: elapsed_ms(started),
                memory_used_bytes: memory_delta(&before, &after),
                truncated_cells: scan.truncated,
                ..ImportMetadata::default()
            },
        }
    }

    /// Headers and the first `sample_size` data rows.
    ///
    /// # Errors
    /// Same file-level errors as [`read`](Self::read)
    pub fn preview(
        &self,
        buffer: &[u8],
        kind: FileKind,
        options: &ImportOptions,
        sample_size: usize,
    ) -> Result<Preview, CodecError> {
        let grid = self.load(buffer, kind, options)?;
        let scan = self.scan_headers(&grid, options);
        let headers = Arc::new(scan.map);
        let total_rows = grid.total_rows();

        let sample: Vec<SourceRow> = grid.rows.into_iter().skip(1).take(sample_size).collect();
        let task = ChunkTask {
            index: 0,
            first_row: 1,
            rows: sample,
            headers: Arc::clone(&headers),
            policy: CellPolicy::from(options),
        };
        let outcome = process_chunk(&task, &AtomicBool::new(false))
            .map_err(|cancelled| CodecError::Dispatch(cancelled.to_string()))?;

        let mut errors = scan.errors;
        errors.extend(outcome.errors);
        Ok(Preview {
            headers: headers.names(),
            rows: outcome.rows.into_iter().map(|parsed| parsed.record).collect(),
            errors,
            total_rows,
            sheet_name: grid.name,
        })
    }

    fn load(&self, buffer: &[u8], kind: FileKind, options: &ImportOptions) -> Result<SheetGrid, CodecError> {
        let size = buffer.len() as u64;
        if size > options.max_file_size {
            return Err(CodecError::FileTooLarge {
                size,
                limit: options.max_file_size,
            });
        }

        let format = SourceFormat::detect(kind, buffer);
        decode(buffer, format, options.sheet_name.as_deref(), SheetLimits::from(options))
    }

    fn scan_headers(&self, grid: &SheetGrid, options: &ImportOptions) -> HeaderScan {
        let mut scan = HeaderScan {
            map: HeaderMap {
                first_column: grid.first_column,
                columns: Vec::new(),
            },
            errors: Vec::new(),
            truncated: 0,
        };

        let cells = match grid.rows.first() {
            Some(SourceRow::Cells(cells)) => cells,
            Some(SourceRow::Malformed(message)) => {
                scan.errors.push(CellError::row(0, message.clone()));
                return scan;
            }
            None => return scan,
        };

        let mut used: HashSet<String> = HashSet::new();
        for (column, cell) in cells.iter().enumerate() {
            let text = match cell {
                SourceCell::Empty => {
                    scan.map.columns.push(None);
                    continue;
                }
                SourceCell::Formula(_) if !options.allow_formulas => {
                    scan.errors.push(CellError::cell(
                        0,
                        scan.map.letter(column),
                        CellErrorKind::FormulaBlocked,
                        "formulas are not allowed in headers",
                    ));
                    scan.map.columns.push(None);
                    continue;
                }
                SourceCell::Formula(text) | SourceCell::Value(text) => text,
            };

            match self.cache.sanitize(text, options.max_cell_length, options.allow_html) {
                Ok(sanitized) if sanitized.value.is_empty() => scan.map.columns.push(None),
                Ok(sanitized) => {
                    if sanitized.truncated {
                        scan.truncated += 1;
                    }
                    let name = unique_name(&mut used, sanitized.value);
                    scan.map.columns.push(Some(name));
                }
                Err(err) => {
                    scan.errors.push(CellError::cell(
                        0,
                        scan.map.letter(column),
                        CellErrorKind::DangerousContent,
                        err.to_string(),
                    ));
                    scan.map.columns.push(None);
                }
            }
        }
        scan
    }

    fn after_window(
        &self,
        acc: &mut Accumulator,
        outcome: ChunkOutcome,
        window_rows: usize,
        total: usize,
        observer: &mut (dyn FnMut(ChunkProgress) + Send),
    ) {
        let index = outcome.index;
        acc.absorb(outcome, window_rows);
        tracing::debug!(window = index, of = total, rows = acc.rows_processed, "window processed");

        if (index + 1) % RECLAIM_EVERY_CHUNKS == 0 {
            self.reclaimer.suggest();
        }
        observer(ChunkProgress {
            index,
            total,
            rows_processed: acc.rows_processed,
        });
    }
}

fn build_tasks(rows: Vec<SourceRow>, window: usize, headers: &Arc<HeaderMap>, policy: CellPolicy) -> Vec<ChunkTask> {
    let mut tasks = Vec::new();
    let mut iter = rows.into_iter();
    let mut first_row = 1;
    loop {
        let window_rows: Vec<SourceRow> = iter.by_ref().take(window).collect();
        if window_rows.is_empty() {
            break;
        }
        let len = window_rows.len();
        tasks.push(ChunkTask {
            index: tasks.len(),
            first_row,
            rows: window_rows,
            headers: Arc::clone(headers),
            policy,
        });
        first_row += len;
    }
    tasks
}

fn unique_name(used: &mut HashSet<String>, base: String) -> String {
    if used.insert(base.clone()) {
        return base;
    }
    let mut n = 2;
    loop {
        let candidate = format!("{base}_{n}");
        if used.insert(candidate.clone()) {
            return candidate;
        }
        n += 1;
    }
}

fn find_duplicates(rows: &[ParsedRow], field: &str, headers: &HeaderMap) -> Vec<CellError> {
    let Some(column) = headers.columns.iter().position(|name| name.as_deref() == Some(field)) else {
        return Vec::new();
    };
    let letter = headers.letter(column);

    let mut first_seen: HashMap<&str, usize> = HashMap::new();
    let mut errors = Vec::new();
    for parsed in rows {
        let Some(value) = parsed.record.get(field) else {
            continue;
        };
        match first_seen.get(value.as_str()) {
            Some(first) => errors.push(CellError::cell(
                parsed.row,
                letter.clone(),
                CellErrorKind::Duplicate,
                format!("duplicate {field} '{value}', first seen in row {first}"),
            )),
            None => {
                first_seen.insert(value.as_str(), parsed.row);
            }
        }
    }
    errors
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

fn memory_delta(before: &RawMemory, after: &RawMemory) -> u64 {
    if before.heap_total == 0 || after.heap_total == 0 {
        return 0;
    }
    after.heap_used.saturating_sub(before.heap_used)
}
