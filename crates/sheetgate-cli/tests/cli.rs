use clap::Parser;
use pretty_assertions::assert_eq;
use sheetgate_cli::{execute, Cli, Commands};
use sheetgate_core::{EngineConfig, ImportEngine};
use sheetgate_monitor::{FileKind, NoopProbe};
use sheetgate_test_utils::{csv_bytes, numbered_csv, ScriptedProbe, MIB};
use std::path::PathBuf;
use std::sync::Arc;

fn engine() -> ImportEngine {
    ImportEngine::new(EngineConfig::default(), Arc::new(NoopProbe)).unwrap()
}

fn parse(args: &[&str]) -> Cli {
    Cli::try_parse_from(std::iter::once("sheetgate").chain(args.iter().copied())).unwrap()
}

#[test]
fn global_flags_after_subcommand() {
    let cli = parse(&["import", "data.csv", "--json", "--config", "cfg.toml", "--json-logs"]);
    assert_eq!(cli.config, Some(PathBuf::from("cfg.toml")));
    assert!(cli.json_logs);
    assert_eq!(cli.log_level, "info");
    match cli.command {
        Commands::Import { file, sheet, json } => {
            assert_eq!(file, PathBuf::from("data.csv"));
            assert_eq!(sheet, None);
            assert!(json);
        }
        other => panic!("unexpected command: {other:?}"),
    }
}

#[test]
fn probe_kind_parsed_and_checked() {
    match parse(&["probe", "--size", "2048", "--kind", "XLSX"]).command {
        Commands::Probe { size, kind, json } => {
            assert_eq!(size, 2048);
            assert_eq!(kind, FileKind::Xlsx);
            assert!(!json);
        }
        other => panic!("unexpected command: {other:?}"),
    }
    assert!(Cli::try_parse_from(["sheetgate", "probe", "--kind", "pdf"]).is_err());
}

#[test]
fn export_requires_output() {
    assert!(Cli::try_parse_from(["sheetgate", "export", "rows.json"]).is_err());
    match parse(&["export", "rows.json", "out.xlsx"]).command {
        Commands::Export { sheet, .. } => assert_eq!(sheet, "Sheet1"),
        other => panic!("unexpected command: {other:?}"),
    }
}

#[tokio::test]
async fn import_summary_lists_cell_errors() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("people.csv");
    std::fs::write(
        &path,
        csv_bytes(&["name", "age"], &[&["Alice", "30"], &["Bob", "<script>x</script>"]]),
    )
    .unwrap();

    let command = parse(&["import", path.to_str().unwrap()]).command;
    let outcome = execute(&engine(), &command).await.unwrap();

    assert!(outcome.success);
    assert!(outcome.output.contains("rows: 2 imported, 0 skipped, 3 total"));
    assert!(outcome.output.contains("errors: 1"));
    assert!(outcome.output.contains("row 2 column B: dangerous content"));
}

#[tokio::test]
async fn import_json_is_parseable() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("numbers.csv");
    std::fs::write(&path, numbered_csv(3)).unwrap();

    let command = parse(&["import", path.to_str().unwrap(), "--json"]).command;
    let outcome = execute(&engine(), &command).await.unwrap();

    let value: serde_json::Value = serde_json::from_str(&outcome.output).unwrap();
    assert_eq!(value["rows"].as_array().unwrap().len(), 3);
    assert_eq!(value["rows"][2]["name"], "name-3");
    assert_eq!(value["metadata"]["total_rows"], 4);
}

#[tokio::test]
async fn missing_file_is_error() {
    let command = parse(&["import", "/definitely/not/here.csv"]).command;
    let err = execute(&engine(), &command).await.unwrap_err();
    assert!(err.to_string().contains("failed to read"));
}

#[tokio::test]
async fn validate_fails_over_limits() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tall.csv");
    std::fs::write(&path, numbered_csv(20)).unwrap();

    let mut config = EngineConfig::default();
    config.import.max_rows = 10;
    let engine = ImportEngine::new(config, Arc::new(NoopProbe)).unwrap();

    let command = parse(&["validate", path.to_str().unwrap()]).command;
    let outcome = execute(&engine, &command).await.unwrap();
    assert!(!outcome.success);
    assert!(outcome.output.contains("valid: false"));
    assert!(outcome.output.contains("fatal:"));
}

#[tokio::test]
async fn preview_prints_requested_rows() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("numbers.csv");
    std::fs::write(&path, numbered_csv(30)).unwrap();

    let command = parse(&["preview", path.to_str().unwrap(), "--rows", "2"]).command;
    let outcome = execute(&engine(), &command).await.unwrap();

    let lines: Vec<&str> = outcome.output.lines().collect();
    assert_eq!(lines[0], "id\tname");
    assert_eq!(lines[1], "1\tname-1");
    assert_eq!(lines[2], "2\tname-2");
    assert!(lines[3].starts_with("(2 of 30 rows"));
}

#[tokio::test]
async fn export_writes_importable_workbook() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("rows.json");
    let output = dir.path().join("rows.xlsx");
    std::fs::write(&input, r#"[{"sku": "A-1", "qty": 4}, {"sku": "B-2", "qty": 12}]"#).unwrap();

    let engine = engine();
    let command = parse(&[
        "export",
        input.to_str().unwrap(),
        output.to_str().unwrap(),
        "--sheet",
        "Stock",
    ])
    .command;
    let outcome = execute(&engine, &command).await.unwrap();
    assert!(outcome.output.starts_with("wrote 2 rows"));

    let command = parse(&["import", output.to_str().unwrap(), "--json"]).command;
    let outcome = execute(&engine, &command).await.unwrap();
    let value: serde_json::Value = serde_json::from_str(&outcome.output).unwrap();
    assert_eq!(value["metadata"]["sheet_name"], "Stock");
    assert_eq!(value["rows"][1]["qty"], "12");
}

#[tokio::test]
async fn probe_without_monitoring_admits() {
    let command = parse(&["probe", "--size", "1048576"]).command;
    let outcome = execute(&engine(), &command).await.unwrap();
    assert!(outcome.success);
    assert!(outcome.output.contains("memory: unavailable"));
    assert!(outcome.output.contains("admission (csv, 1048576 bytes): admit"));
}

#[tokio::test]
async fn probe_rejects_under_pressure() {
    let probe = Arc::new(ScriptedProbe::fixed(MIB - 100 * 1024, MIB));
    let engine = ImportEngine::new(EngineConfig::default(), probe).unwrap();

    let command = parse(&["probe", "--size", "1048576", "--kind", "xlsx", "--json"]).command;
    let outcome = execute(&engine, &command).await.unwrap();
    assert!(!outcome.success);

    let value: serde_json::Value = serde_json::from_str(&outcome.output).unwrap();
    assert_eq!(value["decision"]["can_process"], false);
    assert_eq!(value["kind"], "xlsx");
}
