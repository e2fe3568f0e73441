//! Command runners
//!
//! Runners render their report into an [`Outcome`] instead of printing, so
//! `main` owns stdout and the exit code.

use crate::cli::Commands;
use anyhow::{Context, Result};
use indexmap::IndexMap;
use serde_json::{json, Value};
use sheetgate_codec::{CellError, ImportOptions, Record};
use sheetgate_core::ImportEngine;
use sheetgate_monitor::FileKind;
use std::fmt::Write as _;
use std::path::Path;

const MIB: f64 = 1024.0 * 1024.0;

/// Rendered command output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    /// Text for stdout
    pub output: String,
    /// Whether the process should exit with status 0
    pub success: bool,
}

impl Outcome {
    fn ok(output: String) -> Self {
        Self { output, success: true }
    }
}

/// Run `command` against `engine`
///
/// # Errors
/// Unreadable input files, fatal engine errors and malformed export input
pub async fn execute(engine: &ImportEngine, command: &Commands) -> Result<Outcome> {
    match command {
        Commands::Import { file, sheet, json } => import(engine, file, sheet.as_deref(), *json).await,
        Commands::Validate { file, sheet, json } => validate(engine, file, sheet.as_deref(), *json).await,
        Commands::Preview { file, rows, json } => preview(engine, file, *rows, *json).await,
        Commands::Export { input, output, sheet } => export(engine, input, output, sheet).await,
        Commands::Probe { size, kind, json } => probe(engine, *size, *kind, *json),
    }
}

async fn import(engine: &ImportEngine, file: &Path, sheet: Option<&str>, json: bool) -> Result<Outcome> {
    let buffer = read_input(file).await?;
    let options = options_for(engine, sheet);
    let result = engine
        .import_with(&buffer, FileKind::from_path(file), &options)
        .await
        .with_context(|| format!("failed to import {}", file.display()))?;

    if json {
        return Ok(Outcome::ok(serde_json::to_string_pretty(&result)?));
    }

    let meta = &result.metadata;
    let mut out = String::new();
    writeln!(out, "sheet: {}", meta.sheet_name)?;
    writeln!(
        out,
        "rows: {} imported, {} skipped, {} total",
        result.rows.len(),
        meta.skipped_rows,
        meta.total_rows
    )?;
    writeln!(out, "columns: {}", meta.total_columns)?;
    writeln!(
        out,
        "chunks: {}{}",
        meta.chunks,
        if meta.dispatched { " (pooled)" } else { "" }
    )?;
    if meta.truncated_cells > 0 {
        writeln!(out, "truncated cells: {}", meta.truncated_cells)?;
    }
    write_errors(&mut out, &result.errors)?;
    writeln!(out, "time: {} ms", meta.processing_time_ms)?;
    Ok(Outcome::ok(out))
}

async fn validate(engine: &ImportEngine, file: &Path, sheet: Option<&str>, json: bool) -> Result<Outcome> {
    let buffer = read_input(file).await?;
    let options = options_for(engine, sheet);
    let report = engine.validate_with(&buffer, FileKind::from_path(file), &options);

    let output = if json {
        serde_json::to_string_pretty(&report)?
    } else {
        let mut out = String::new();
        writeln!(out, "valid: {}", report.is_valid)?;
        if let Some(fatal) = &report.fatal {
            writeln!(out, "fatal: {fatal}")?;
        }
        writeln!(
            out,
            "dimensions: {} rows x {} columns",
            report.metadata.total_rows, report.metadata.total_columns
        )?;
        write_errors(&mut out, &report.errors)?;
        out
    };
    Ok(Outcome {
        output,
        success: report.is_valid,
    })
}

async fn preview(engine: &ImportEngine, file: &Path, rows: usize, json: bool) -> Result<Outcome> {
    let buffer = read_input(file).await?;
    let preview = engine
        .preview(&buffer, FileKind::from_path(file), rows)
        .with_context(|| format!("failed to preview {}", file.display()))?;

    if json {
        return Ok(Outcome::ok(serde_json::to_string_pretty(&preview)?));
    }

    let mut out = String::new();
    writeln!(out, "{}", preview.headers.join("\t"))?;
    for row in &preview.rows {
        let cells: Vec<&str> = preview
            .headers
            .iter()
            .map(|header| row.get(header).map_or("", String::as_str))
            .collect();
        writeln!(out, "{}", cells.join("\t"))?;
    }
    writeln!(
        out,
        "({} of {} rows, sheet {})",
        preview.rows.len(),
        preview.total_rows.saturating_sub(1),
        preview.sheet_name
    )?;
    write_errors(&mut out, &preview.errors)?;
    Ok(Outcome::ok(out))
}

async fn export(engine: &ImportEngine, input: &Path, output: &Path, sheet: &str) -> Result<Outcome> {
    let text = tokio::fs::read_to_string(input)
        .await
        .with_context(|| format!("failed to read {}", input.display()))?;
    let rows = parse_records(&text).with_context(|| format!("invalid records in {}", input.display()))?;
    let count = rows.len();

    let bytes = engine.export(rows, sheet).await?;
    tokio::fs::write(output, &bytes)
        .await
        .with_context(|| format!("failed to write {}", output.display()))?;

    tracing::info!(rows = count, bytes = bytes.len(), path = %output.display(), "workbook written");
    Ok(Outcome::ok(format!(
        "wrote {count} rows to {} (sheet {sheet})\n",
        output.display()
    )))
}

fn probe(engine: &ImportEngine, size: u64, kind: FileKind, json: bool) -> Result<Outcome> {
    let sample = engine.current_sample();
    let decision = engine.admission(size, kind);

    let output = if json {
        serde_json::to_string_pretty(&json!({
            "sample": sample,
            "usage_ratio": sample.usage_ratio(),
            "file_size": size,
            "kind": kind,
            "decision": decision,
        }))?
    } else {
        let mut out = String::new();
        match sample.usage_ratio() {
            Some(ratio) => writeln!(
                out,
                "memory: {:.1} MiB used of {:.1} MiB ({:.1}%)",
                sample.heap_used as f64 / MIB,
                sample.heap_total as f64 / MIB,
                ratio * 100.0
            )?,
            None => writeln!(out, "memory: unavailable")?,
        }
        let verdict = if decision.can_process { "admit" } else { "reject" };
        writeln!(out, "admission ({kind}, {size} bytes): {verdict}")?;
        if let Some(reason) = &decision.reason {
            writeln!(out, "reason: {reason}")?;
        }
        for suggestion in &decision.suggestions {
            writeln!(out, "  - {suggestion}")?;
        }
        out
    };
    Ok(Outcome {
        output,
        success: decision.can_process,
    })
}

/// Parse a JSON array of flat objects into records, keeping key order.
/// Strings are taken as-is, `null` drops the field and any other value is
/// stored as its JSON text.
///
/// # Errors
/// Input that is not an array of objects
pub fn parse_records(text: &str) -> Result<Vec<Record>> {
    let objects: Vec<IndexMap<String, Value>> = serde_json::from_str(text)?;
    Ok(objects
        .into_iter()
        .map(|object| {
            object
                .into_iter()
                .filter_map(|(key, value)| match value {
                    Value::Null => None,
                    Value::String(text) => Some((key, text)),
                    other => Some((key, other.to_string())),
                })
                .collect()
        })
        .collect())
}

async fn read_input(path: &Path) -> Result<Vec<u8>> {
    tokio::fs::read(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))
}

fn options_for(engine: &ImportEngine, sheet: Option<&str>) -> ImportOptions {
    let options = engine.config().import.clone();
    match sheet {
        Some(name) => options.with_sheet(name),
        None => options,
    }
}

fn write_errors(out: &mut String, errors: &[CellError]) -> std::fmt::Result {
    if errors.is_empty() {
        return Ok(());
    }
    writeln!(out, "errors: {}", errors.len())?;
    for error in errors {
        writeln!(out, "  {error}")?;
    }
    Ok(())
}
