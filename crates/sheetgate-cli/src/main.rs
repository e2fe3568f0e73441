//! Sheetgate CLI entry point

use anyhow::{Context, Result};
use clap::Parser;
use sheetgate_cli::{execute, logging, Cli};
use sheetgate_core::{EngineConfig, ImportEngine};
use std::process::ExitCode;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    logging::init(&cli.log_level, cli.json_logs)?;

    let config = match &cli.config {
        Some(path) => EngineConfig::from_path(path)
            .with_context(|| format!("failed to load configuration from {}", path.display()))?,
        None => EngineConfig::default(),
    };
    let engine = ImportEngine::with_system_probe(config)?;

    let outcome = execute(&engine, &cli.command).await;
    engine.shutdown();
    let outcome = outcome?;

    print!("{}", outcome.output);
    if !outcome.output.ends_with('\n') {
        println!();
    }
    Ok(if outcome.success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
