//! Source decoding into a row grid
//!
//! CSV/TSV are decoded with the `csv` crate, workbooks with `calamine`. Both
//! produce a [`SheetGrid`]: raw rows of [`SourceCell`]s plus the absolute
//! column of the grid's first cell so errors can name the real column.

use crate::error::CodecError;
use crate::options::ImportOptions;
use calamine::{open_workbook_auto_from_rs, Data, ExcelDateTime, Reader, Sheets, Xlsx};
use chrono::NaiveTime;
use sheetgate_monitor::FileKind;
use std::io::{Cursor, Read, Seek};

const ZIP_MAGIC: &[u8] = b"PK\x03\x04";
const OLE_MAGIC: &[u8] = &[0xD0, 0xCF, 0x11, 0xE0, 0xA1, 0xB1, 0x1A, 0xE1];

/// Raw cell as it came out of the decoder
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceCell {
    /// No value
    Empty,
    /// Literal value rendered as text
    Value(String),
    /// Formula text, leading `=` included
    Formula(String),
}

impl SourceCell {
    /// Classify a delimited-text field. Leading whitespace does not hide a formula.
    #[must_use]
    pub fn from_field(field: &str) -> Self {
        if field.is_empty() {
            Self::Empty
        } else if field.trim_start().starts_with('=') {
            Self::Formula(field.to_string())
        } else {
            Self::Value(field.to_string())
        }
    }

    /// Whether the cell carries anything
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }
}

/// Raw row as it came out of the decoder
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceRow {
    /// Decoded cells
    Cells(Vec<SourceCell>),
    /// Row the decoder could not read
    Malformed(String),
}

/// One decoded sheet
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SheetGrid {
    /// Sheet name (`Sheet1` for delimited text)
    pub name: String,
    /// Absolute zero-based column of the grid's first column
    pub first_column: usize,
    /// Used width
    pub width: usize,
    /// Raw rows, header first
    pub rows: Vec<SourceRow>,
}

impl SheetGrid {
    /// Raw row count, header included
    #[inline]
    #[must_use]
    pub fn total_rows(&self) -> usize {
        self.rows.len()
    }

    /// Data rows after the header
    #[inline]
    #[must_use]
    pub fn data_rows(&self) -> usize {
        self.rows.len().saturating_sub(1)
    }
}

/// Concrete decoder selection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceFormat {
    /// Delimited text with the given separator
    Delimited(u8),
    /// Any workbook container calamine can open
    Workbook,
}

impl SourceFormat {
    /// Pick a decoder from the declared kind, sniffing the bytes when unknown
    #[must_use]
    pub fn detect(kind: FileKind, buffer: &[u8]) -> Self {
        match kind {
            FileKind::Csv => Self::Delimited(b','),
            FileKind::Tsv => Self::Delimited(b'\t'),
            FileKind::Xlsx | FileKind::Xlsm | FileKind::Xlsb | FileKind::Xls | FileKind::Ods => Self::Workbook,
            FileKind::Unknown => {
                if buffer.starts_with(ZIP_MAGIC) || buffer.starts_with(OLE_MAGIC) {
                    Self::Workbook
                } else {
                    Self::Delimited(b',')
                }
            }
        }
    }
}

/// Row and column caps enforced while a sheet is decoded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SheetLimits {
    /// Raw rows, header included
    pub max_rows: usize,
    /// Used width
    pub max_columns: usize,
}

impl SheetLimits {
    /// No caps
    pub const UNBOUNDED: Self = Self {
        max_rows: usize::MAX,
        max_columns: usize::MAX,
    };

    /// Whether a `rows` x `columns` sheet is over either cap
    #[inline]
    #[must_use]
    pub fn exceeded_by(self, rows: usize, columns: usize) -> bool {
        rows > self.max_rows || columns > self.max_columns
    }

    fn error(self, rows: usize, columns: usize) -> CodecError {
        CodecError::DimensionExceeded {
            rows,
            columns,
            max_rows: self.max_rows,
            max_columns: self.max_columns,
        }
    }
}

impl From<&ImportOptions> for SheetLimits {
    fn from(options: &ImportOptions) -> Self {
        Self {
            max_rows: options.max_rows,
            max_columns: options.max_columns,
        }
    }
}

/// Decode `buffer` into the selected sheet.
///
/// Nothing proportional to the sheet's extent is allocated once it is known
/// to be over `limits`.
///
/// # Errors
/// - `CodecError::NoSheet` if the workbook has no sheets or lacks `sheet_name`
/// - `CodecError::DimensionExceeded` if the sheet is over `limits`
/// - `CodecError::Decode` if the bytes cannot be parsed at all
pub fn decode(
    buffer: &[u8],
    format: SourceFormat,
    sheet_name: Option<&str>,
    limits: SheetLimits,
) -> Result<SheetGrid, CodecError> {
    match format {
        SourceFormat::Delimited(delimiter) => decode_delimited(buffer, delimiter, sheet_name, limits),
        SourceFormat::Workbook => decode_workbook(buffer, sheet_name, limits),
    }
}

fn decode_delimited(
    buffer: &[u8],
    delimiter: u8,
    sheet_name: Option<&str>,
    limits: SheetLimits,
) -> Result<SheetGrid, CodecError> {
    const SHEET: &str = "Sheet1";
    if let Some(name) = sheet_name {
        if name != SHEET {
            return Err(CodecError::NoSheet(Some(name.to_string())));
        }
    }

    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(false)
        .flexible(true)
        .from_reader(buffer);

    let mut sheet = DelimitedSheet {
        limits,
        rows: Vec::new(),
        total: 0,
        width: 0,
        over: false,
    };
    let mut record = csv::ByteRecord::new();
    // Byte offset just past the previous record
    let mut consumed = 0;
    while reader.read_byte_record(&mut record)? {
        // The csv reader drops empty lines; they still occupy a row number.
        // Blank lines ahead of the header are trimmed like a workbook's used range.
        if sheet.total > 0 {
            sheet.blank(blank_lines(buffer, consumed));
        }
        consumed = usize::try_from(reader.position().byte()).unwrap_or(buffer.len());
        sheet.push(&record);
    }
    if sheet.total > 0 {
        sheet.blank(blank_lines(buffer, consumed));
    }

    if sheet.over {
        return Err(limits.error(sheet.total, sheet.width));
    }
    Ok(SheetGrid {
        name: SHEET.to_string(),
        first_column: 0,
        width: sheet.width,
        rows: sheet.rows,
    })
}

/// Delimited rows plus running totals; rows stop being kept once over the limits
struct DelimitedSheet {
    limits: SheetLimits,
    rows: Vec<SourceRow>,
    total: usize,
    width: usize,
    over: bool,
}

impl DelimitedSheet {
    fn push(&mut self, record: &csv::ByteRecord) {
        self.total += 1;
        self.width = self.width.max(record.len());
        if self.check() {
            self.rows.push(delimited_row(record));
        }
    }

    fn blank(&mut self, count: usize) {
        if count == 0 {
            return;
        }
        self.total += count;
        if self.check() {
            self.rows
                .extend(std::iter::repeat_with(|| SourceRow::Cells(Vec::new())).take(count));
        }
    }

    /// Returns whether rows are still kept
    fn check(&mut self) -> bool {
        if !self.over && self.limits.exceeded_by(self.total, self.width) {
            self.over = true;
            self.rows = Vec::new();
        }
        !self.over
    }
}

fn delimited_row(record: &csv::ByteRecord) -> SourceRow {
    let mut cells = Vec::with_capacity(record.len());
    for (index, field) in record.iter().enumerate() {
        match std::str::from_utf8(field) {
            Ok(text) => cells.push(SourceCell::from_field(text)),
            Err(_) => {
                return SourceRow::Malformed(format!(
                    "invalid UTF-8 in column {}",
                    crate::types::column_letter(index)
                ));
            }
        }
    }
    SourceRow::Cells(cells)
}

/// Empty lines starting at byte `at`, the end of the previous record.
///
/// The reader may stop before, inside or after that record's terminator, so
/// an unread terminator (or the LF of a split CRLF) is not counted.
fn blank_lines(buffer: &[u8], at: usize) -> usize {
    let Some(rest) = buffer.get(at..) else {
        return 0;
    };
    let before = at.checked_sub(1).and_then(|index| buffer.get(index)).copied();

    let mut index = usize::from(before == Some(b'\r') && rest.first() == Some(&b'\n'));
    let mut terminators = 0;
    while let Some(&byte) = rest.get(index) {
        match byte {
            b'\r' if rest.get(index + 1) == Some(&b'\n') => index += 2,
            b'\r' | b'\n' => index += 1,
            _ => break,
        }
        terminators += 1;
    }

    match before {
        Some(b'\r' | b'\n') | None => terminators,
        Some(_) => terminators.saturating_sub(1),
    }
}

fn decode_workbook(buffer: &[u8], sheet_name: Option<&str>, limits: SheetLimits) -> Result<SheetGrid, CodecError> {
    let workbook = open_workbook_auto_from_rs(Cursor::new(buffer))?;
    let names = workbook.sheet_names();

    let name = match sheet_name {
        Some(wanted) => names
            .iter()
            .find(|name| name.as_str() == wanted)
            .cloned()
            .ok_or_else(|| CodecError::NoSheet(Some(wanted.to_string())))?,
        None => names.first().cloned().ok_or(CodecError::NoSheet(None))?,
    };

    let mut sheet = SparseSheet::new(limits);
    match workbook {
        Sheets::Xlsx(mut xlsx) => stream_xlsx(&mut xlsx, &name, &mut sheet)?,
        mut other => {
            let range = other.worksheet_range(&name)?;
            let (height, width) = range.get_size();
            if limits.exceeded_by(height, width) {
                return Err(limits.error(height, width));
            }
            let (top, left) = range.start().unwrap_or_default();
            for (row, col, value) in range.used_cells() {
                sheet.value(top + row as u32, left + col as u32, render(value));
            }
            if let Ok(formulas) = other.worksheet_formula(&name) {
                let (top, left) = formulas.start().unwrap_or_default();
                for (row, col, text) in formulas.used_cells() {
                    sheet.formula(top + row as u32, left + col as u32, text);
                }
            }
        }
    }
    sheet.into_grid(name)
}

/// Read XLSX cells one at a time so a sparse sheet spanning the whole grid
/// is rejected before anything dense exists.
fn stream_xlsx<RS: Read + Seek>(xlsx: &mut Xlsx<RS>, name: &str, sheet: &mut SparseSheet) -> Result<(), CodecError> {
    let mut cells = xlsx.worksheet_cells_reader(name).map_err(calamine::Error::Xlsx)?;
    while let Some(cell) = cells.next_cell().map_err(calamine::Error::Xlsx)? {
        let (row, col) = cell.get_position();
        sheet.value(row, col, render(&Data::from(cell.get_value().clone())));
    }
    drop(cells);
    if sheet.over {
        return Ok(());
    }

    let mut formulas = xlsx.worksheet_cells_reader(name).map_err(calamine::Error::Xlsx)?;
    while let Some(cell) = formulas.next_formula().map_err(calamine::Error::Xlsx)? {
        let (row, col) = cell.get_position();
        sheet.formula(row, col, cell.get_value());
    }
    Ok(())
}

#[derive(Debug, Clone, Copy)]
struct Bounds {
    top: u32,
    bottom: u32,
    left: u32,
    right: u32,
}

impl Bounds {
    fn height(self) -> usize {
        (self.bottom - self.top) as usize + 1
    }

    fn width(self) -> usize {
        (self.right - self.left) as usize + 1
    }
}

/// Non-empty workbook cells at absolute positions
struct SparseSheet {
    limits: SheetLimits,
    values: Vec<(u32, u32, SourceCell)>,
    formulas: Vec<(u32, u32, String)>,
    bounds: Option<Bounds>,
    over: bool,
}

impl SparseSheet {
    fn new(limits: SheetLimits) -> Self {
        Self {
            limits,
            values: Vec::new(),
            formulas: Vec::new(),
            bounds: None,
            over: false,
        }
    }

    fn value(&mut self, row: u32, col: u32, cell: SourceCell) {
        if !cell.is_empty() && self.track(row, col) {
            self.values.push((row, col, cell));
        }
    }

    fn formula(&mut self, row: u32, col: u32, text: &str) {
        if !text.is_empty() && self.track(row, col) {
            self.formulas
                .push((row, col, format!("={}", text.trim_start_matches('='))));
        }
    }

    /// Grow the used range to cover the cell. Returns whether cells are still kept.
    fn track(&mut self, row: u32, col: u32) -> bool {
        let bounds = self.bounds.get_or_insert(Bounds {
            top: row,
            bottom: row,
            left: col,
            right: col,
        });
        bounds.top = bounds.top.min(row);
        bounds.bottom = bounds.bottom.max(row);
        bounds.left = bounds.left.min(col);
        bounds.right = bounds.right.max(col);
        let (height, width) = (bounds.height(), bounds.width());

        if !self.over && self.limits.exceeded_by(height, width) {
            self.over = true;
            self.values = Vec::new();
            self.formulas = Vec::new();
        }
        !self.over
    }

    fn into_grid(self, name: String) -> Result<SheetGrid, CodecError> {
        let Some(bounds) = self.bounds else {
            return Ok(SheetGrid {
                name,
                ..SheetGrid::default()
            });
        };
        let (height, width) = (bounds.height(), bounds.width());
        if self.over {
            return Err(self.limits.error(height, width));
        }

        let mut grid: Vec<Vec<SourceCell>> = vec![vec![SourceCell::Empty; width]; height];
        let at = |row: u32, col: u32| ((row - bounds.top) as usize, (col - bounds.left) as usize);
        for (row, col, cell) in self.values {
            let (r, c) = at(row, col);
            grid[r][c] = cell;
        }
        for (row, col, text) in self.formulas {
            let (r, c) = at(row, col);
            grid[r][c] = SourceCell::Formula(text);
        }

        Ok(SheetGrid {
            name,
            first_column: bounds.left as usize,
            width,
            rows: grid.into_iter().map(SourceRow::Cells).collect(),
        })
    }
}

fn render(value: &Data) -> SourceCell {
    match value {
        Data::Empty => SourceCell::Empty,
        Data::String(text) if text.is_empty() => SourceCell::Empty,
        Data::String(text) | Data::DateTimeIso(text) | Data::DurationIso(text) => SourceCell::Value(text.clone()),
        Data::Float(number) => SourceCell::Value(render_float(*number)),
        Data::Int(number) => SourceCell::Value(number.to_string()),
        Data::Bool(flag) => SourceCell::Value(flag.to_string()),
        Data::DateTime(moment) => SourceCell::Value(render_datetime(moment)),
        Data::Error(error) => SourceCell::Value(error.to_string()),
    }
}

/// Dates as `YYYY-MM-DD`, adding `THH:MM:SS` when there is a time of day.
/// Durations as `H:MM:SS`.
fn render_datetime(moment: &ExcelDateTime) -> String {
    if moment.is_duration() {
        if let Some(duration) = moment.as_duration() {
            let seconds = duration.num_seconds();
            let sign = if seconds < 0 { "-" } else { "" };
            let seconds = seconds.unsigned_abs();
            return format!("{sign}{}:{:02}:{:02}", seconds / 3600, seconds % 3600 / 60, seconds % 60);
        }
    }
    match moment.as_datetime() {
        Some(at) if at.time() == NaiveTime::MIN => at.format("%Y-%m-%d").to_string(),
        Some(at) => at.format("%Y-%m-%dT%H:%M:%S").to_string(),
        None => render_float(moment.as_f64()),
    }
}

fn render_float(number: f64) -> String {
    if number.fract() == 0.0 && number.abs() < 1e15 {
        format!("{}", number as i64)
    } else {
        number.to_string()
    }
}
