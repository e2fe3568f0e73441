//! CLI command definitions

use clap::{Parser, Subcommand};
use sheetgate_monitor::FileKind;
use std::path::PathBuf;

/// Sheetgate tabular import engine
#[derive(Debug, Parser)]
#[command(name = "sheetgate", author, version, about, long_about = None)]
pub struct Cli {
    /// Engine configuration file (TOML)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Default log filter when `RUST_LOG` is unset
    #[arg(short, long, global = true, default_value = "info")]
    pub log_level: String,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub json_logs: bool,

    /// Command to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Import a file and print the result
    Import {
        /// CSV, TSV or workbook file
        file: PathBuf,

        /// Sheet to process instead of the first
        #[arg(long)]
        sheet: Option<String>,

        /// Print the full result as JSON
        #[arg(long)]
        json: bool,
    },

    /// Check limits and headers without importing rows
    Validate {
        /// CSV, TSV or workbook file
        file: PathBuf,

        /// Sheet to check instead of the first
        #[arg(long)]
        sheet: Option<String>,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show the first rows of a file
    Preview {
        /// CSV, TSV or workbook file
        file: PathBuf,

        /// Number of rows to show
        #[arg(short, long, default_value_t = sheetgate_codec::DEFAULT_PREVIEW_ROWS)]
        rows: usize,

        /// Print the preview as JSON
        #[arg(long)]
        json: bool,
    },

    /// Write a JSON array of records as an XLSX workbook
    Export {
        /// JSON file holding an array of flat objects
        input: PathBuf,

        /// Destination workbook
        output: PathBuf,

        /// Worksheet name
        #[arg(long, default_value = "Sheet1")]
        sheet: String,
    },

    /// Print the current memory sample and an admission decision
    Probe {
        /// File size in bytes to ask admission about
        #[arg(short, long, default_value_t = 0)]
        size: u64,

        /// File kind to ask admission about
        #[arg(short, long, default_value = "csv", value_parser = parse_kind)]
        kind: FileKind,

        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
}

fn parse_kind(value: &str) -> Result<FileKind, String> {
    match FileKind::from_extension(value) {
        FileKind::Unknown => Err(format!("unknown file kind `{value}`")),
        kind => Ok(kind),
    }
}
