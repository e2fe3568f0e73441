//! Import limits and behavior switches

use serde::{Deserialize, Serialize};

/// Options for one import, export or validation call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImportOptions {
    /// Buffers larger than this many bytes are rejected outright
    pub max_file_size: u64,
    /// Sheets with more raw rows (header included) are rejected outright
    pub max_rows: usize,
    /// Sheets with more used columns are rejected outright
    pub max_columns: usize,
    /// Cell values are truncated to this many characters
    pub max_cell_length: usize,
    /// Formula cells are kept instead of reported
    pub allow_formulas: bool,
    /// Markup is kept instead of stripped
    pub allow_html: bool,
    /// Rows per processing window; also the writer's batch size
    pub chunk_size: usize,
    /// Process large sheets in windows
    pub use_streaming: bool,
    /// Sheet to process; the first sheet when unset
    pub sheet_name: Option<String>,
    /// Field whose values must not repeat across rows
    pub unique_field: Option<String>,
}

impl Default for ImportOptions {
    fn default() -> Self {
        Self {
            max_file_size: 50 * 1024 * 1024,
            max_rows: 100_000,
            max_columns: 100,
            max_cell_length: 10_000,
            allow_formulas: false,
            allow_html: false,
            chunk_size: 1_000,
            use_streaming: true,
            sheet_name: None,
            unique_field: None,
        }
    }
}

impl ImportOptions {
    /// With max file size in bytes
    #[inline]
    #[must_use]
    pub fn with_max_file_size(mut self, bytes: u64) -> Self {
        self.max_file_size = bytes;
        self
    }

    /// With row and column limits
    #[inline]
    #[must_use]
    pub fn with_dimensions(mut self, max_rows: usize, max_columns: usize) -> Self {
        self.max_rows = max_rows;
        self.max_columns = max_columns;
        self
    }

    /// With max cell length
    #[inline]
    #[must_use]
    pub fn with_max_cell_length(mut self, chars: usize) -> Self {
        self.max_cell_length = chars;
        self
    }

    /// With formulas allowed or blocked
    #[inline]
    #[must_use]
    pub fn with_formulas(mut self, allow: bool) -> Self {
        self.allow_formulas = allow;
        self
    }

    /// With markup allowed or stripped
    #[inline]
    #[must_use]
    pub fn with_html(mut self, allow: bool) -> Self {
        self.allow_html = allow;
        self
    }

    /// With chunk size (clamped to at least one row)
    #[inline]
    #[must_use]
    pub fn with_chunk_size(mut self, rows: usize) -> Self {
        self.chunk_size = rows.max(1);
        self
    }

    /// With streaming enabled or disabled
    #[inline]
    #[must_use]
    pub fn with_streaming(mut self, enabled: bool) -> Self {
        self.use_streaming = enabled;
        self
    }

    /// With sheet selection
    #[inline]
    #[must_use]
    pub fn with_sheet(mut self, name: impl Into<String>) -> Self {
        self.sheet_name = Some(name.into());
        self
    }

    /// With duplicate detection on a field
    #[inline]
    #[must_use]
    pub fn with_unique_field(mut self, field: impl Into<String>) -> Self {
        self.unique_field = Some(field.into());
        self
    }

    /// Chunk size, never zero
    #[inline]
    #[must_use]
    pub fn effective_chunk_size(&self) -> usize {
        self.chunk_size.max(1)
    }
}
