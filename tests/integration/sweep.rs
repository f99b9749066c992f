//! End-to-end sweeps against the in-memory workbook.

use anyhow::Result;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use reactor_sweep::config::AppConfig;
use reactor_sweep::engine::runner::{RunSettings, SweepRunner};
use reactor_sweep::sampler::Sampler;
use reactor_sweep::types::{CellValue, RunReport, SweepError};

use crate::fake_workbook::FakeWorkbook;
use crate::log_capture::CapturedLogs;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn config(trials: u64, checkpoint_interval: u64, output: &Path, extra_run: &str, sampling: &str) -> AppConfig {
    let toml = format!(
        r#"
[run]
trials = {trials}
checkpoint_interval = {checkpoint_interval}
trial_delay_ms = 0
output_path = {output:?}
seed = 2024
{extra_run}

[sampling]
{sampling}

[poll]
timeout_ms = 1000
initial_backoff_ms = 1
max_backoff_ms = 2

[workbook]
path = "reactor.xlsx"
sheet = "Reactor"

[workbook.bridge]
command = "unused"

[[parameters]]
name = "X0"
range = [45, 55]
cell = "B12"

[[parameters]]
name = "S0"
range = [460, 490]
cell = "B13"

[[parameters]]
name = "Pr0"
range = [150, 200]
cell = "B14"

[[validations]]
name = "Pr0_check"
cell = "B20"

[[results]]
name = "Profit"
cell = "AB18"
"#,
        output = output.display().to_string(),
    );
    let cfg = AppConfig::from_toml(&toml).unwrap();
    cfg.validate().unwrap();
    cfg
}

fn uniform(trials: u64, checkpoint_interval: u64, output: &Path) -> AppConfig {
    config(trials, checkpoint_interval, output, "", "mode = \"uniform\"")
}

async fn run(cfg: &AppConfig, workbook: FakeWorkbook) -> Result<RunReport> {
    SweepRunner::new(
        workbook,
        cfg.plan(),
        Sampler::new(cfg.sampling),
        RunSettings::from_config(cfg),
    )
    .run()
    .await
}

fn num(cells: &HashMap<String, CellValue>, cell: &str) -> f64 {
    cells.get(cell).and_then(CellValue::as_f64).unwrap_or(f64::NAN)
}

/// Profit = X0 + S0 + Pr0; guard fails on the listed trials.
fn model(invalid_trials: &'static [u64]) -> FakeWorkbook {
    FakeWorkbook::new(Box::new(move |trial: u64, cells: &mut HashMap<String, CellValue>| {
        let guard = if invalid_trials.contains(&trial) { "INVALID" } else { "VALID" };
        cells.insert("B20".into(), CellValue::from(guard));
        let profit = num(cells, "B12") + num(cells, "B13") + num(cells, "B14");
        cells.insert("AB18".into(), CellValue::Number(profit));
    }))
}

fn read_csv(path: &Path) -> (Vec<String>, Vec<Vec<String>>) {
    let mut reader = csv::Reader::from_path(path).unwrap();
    let headers = reader.headers().unwrap().iter().map(str::to_string).collect();
    let rows = reader
        .records()
        .map(|r| r.unwrap().iter().map(str::to_string).collect())
        .collect();
    (headers, rows)
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_all_valid_five_trials() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("results.csv");
    let cfg = uniform(5, 5, &out);
    let wb = model(&[]);

    let report = run(&cfg, wb.clone()).await.unwrap();

    assert_eq!(report.trials_run, 5);
    assert_eq!(report.accepted, 5);
    assert_eq!(report.rejected, 0);
    assert_eq!(report.checkpoints_written, 1);
    assert_eq!(wb.state().close_calls, 1);

    let (headers, rows) = read_csv(&out);
    assert_eq!(headers, vec!["X0", "S0", "Pr0", "Pr0_check", "Profit"]);
    assert_eq!(rows.len(), 5);
    for row in &rows {
        assert_eq!(row.len(), 5);
        assert_eq!(row[3], "VALID");
        let inputs: Vec<f64> = row[..3].iter().map(|v| v.parse().unwrap()).collect();
        let profit: f64 = row[4].parse().unwrap();
        assert_eq!(profit, inputs[0] + inputs[1] + inputs[2]);
        assert!((45.0..=55.0).contains(&inputs[0]));
        assert!((460.0..=490.0).contains(&inputs[1]));
        assert!((150.0..=200.0).contains(&inputs[2]));
    }
}

#[tokio::test]
async fn test_invalid_trials_are_dropped() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("results.csv");
    let cfg = uniform(5, 5, &out);
    let wb = model(&[2, 4]);
    let logs = CapturedLogs::default();
    let _guard = logs.install();

    let report = run(&cfg, wb.clone()).await.unwrap();

    assert_eq!(report.accepted, 3);
    assert_eq!(report.rejected, 2);
    assert_eq!(report.trials_run, 5);
    assert_eq!(logs.trials("Trial rejected"), vec![2, 4]);
    assert_eq!(logs.trials("Trial accepted"), vec![1, 3, 5]);
    assert!(logs
        .lines()
        .iter()
        .filter(|l| l.contains("Trial rejected"))
        .all(|l| l.contains("INVALID")));

    let (_, rows) = read_csv(&out);
    assert_eq!(rows.len(), 3);

    // Accepted rows are trials 1, 3, 5 in order: match their X0 writes.
    let state = wb.state();
    let x0_writes: Vec<String> = state
        .writes
        .iter()
        .filter(|(cell, _)| cell == "B12")
        .map(|(_, v)| v.to_string())
        .collect();
    assert_eq!(x0_writes.len(), 5);
    let x0_rows: Vec<&String> = rows.iter().map(|r| &r[0]).collect();
    assert_eq!(x0_rows, vec![&x0_writes[0], &x0_writes[2], &x0_writes[4]]);
}

#[tokio::test]
async fn test_checkpoints_overwrite() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("results.csv");
    let cfg = uniform(10, 3, &out);

    // Before trials 4, 7 and 10 recalculate, look at what the previous
    // checkpoint left on disk.
    let seen: Arc<Mutex<Vec<(u64, usize)>>> = Arc::new(Mutex::new(Vec::new()));
    let log = seen.clone();
    let path = out.clone();
    let wb = FakeWorkbook::new(Box::new(move |trial: u64, cells: &mut HashMap<String, CellValue>| {
        if trial > 1 && (trial - 1) % 3 == 0 {
            let rows = std::fs::read_to_string(&path).unwrap().lines().count() - 1;
            log.lock().unwrap().push((trial - 1, rows));
        }
        let guard = if trial % 2 == 0 { "INVALID" } else { "VALID" };
        cells.insert("B20".into(), CellValue::from(guard));
        cells.insert("AB18".into(), CellValue::Number(trial as f64));
    }));

    let report = run(&cfg, wb).await.unwrap();

    // Odd trials are accepted: 1..=3 -> 2 rows, 1..=6 -> 3, 1..=9 -> 5.
    assert_eq!(*seen.lock().unwrap(), vec![(3, 2), (6, 3), (9, 5)]);
    assert_eq!(report.checkpoints_written, 3);
    assert_eq!(report.accepted, 5);

    let (_, rows) = read_csv(&out);
    let profits: Vec<&str> = rows.iter().map(|r| r[4].as_str()).collect();
    assert_eq!(profits, vec!["1", "3", "5", "7", "9"]);
}

#[tokio::test]
async fn test_same_seed_same_results() {
    let dir = tempfile::tempdir().unwrap();
    let a = dir.path().join("a.csv");
    let b = dir.path().join("b.csv");

    run(&uniform(6, 6, &a), model(&[3])).await.unwrap();
    run(&uniform(6, 6, &b), model(&[3])).await.unwrap();

    assert_eq!(
        std::fs::read_to_string(&a).unwrap(),
        std::fs::read_to_string(&b).unwrap()
    );
}

#[tokio::test]
async fn test_midpoint_sampling_window() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("results.csv");
    let cfg = config(
        50,
        50,
        &out,
        "",
        "mode = \"midpoint\"\ndeviation_fraction = 0.10",
    );
    let wb = model(&[]);

    run(&cfg, wb.clone()).await.unwrap();

    let state = wb.state();
    for (cell, value) in &state.writes {
        let v = value.as_f64().unwrap();
        let (lo, hi) = match cell.as_str() {
            "B12" => (49.0, 51.0),
            "B13" => (472.0, 478.0),
            "B14" => (170.0, 180.0),
            other => panic!("unexpected write to {other}"),
        };
        assert!(v >= lo - 1e-9 && v <= hi + 1e-9, "{cell}={v} outside [{lo}, {hi}]");
    }
}

#[tokio::test]
async fn test_rows_without_validation_columns() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("results.csv");
    let cfg = config(3, 3, &out, "record_validation = false", "mode = \"uniform\"");

    let report = run(&cfg, model(&[2])).await.unwrap();
    assert_eq!(report.accepted, 2);

    let (headers, rows) = read_csv(&out);
    assert_eq!(headers, vec!["X0", "S0", "Pr0", "Profit"]);
    assert_eq!(rows.len(), 2);
}

#[tokio::test]
async fn test_waits_through_busy_recalc() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("results.csv");
    let cfg = uniform(4, 2, &out);
    let wb = model(&[]).with_busy_polls(3);

    let report = run(&cfg, wb.clone()).await.unwrap();

    assert_eq!(report.accepted, 4);
    let state = wb.state();
    assert_eq!(state.recalcs, 4);
    assert_eq!(state.idle_polls, 16);
}

#[tokio::test]
async fn test_error_string_in_result_is_kept() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("results.csv");
    let cfg = uniform(2, 10, &out);
    let wb = FakeWorkbook::new(Box::new(|_: u64, cells: &mut HashMap<String, CellValue>| {
        cells.insert("B20".into(), CellValue::from("VALID"));
        cells.insert("AB18".into(), CellValue::from("#DIV/0!"));
    }));

    let report = run(&cfg, wb).await.unwrap();
    assert_eq!(report.accepted, 2);
    assert_eq!(report.checkpoints_written, 0);

    let (_, rows) = read_csv(&out);
    assert!(rows.iter().all(|r| r[4] == "#DIV/0!"));
}

#[tokio::test]
async fn test_stuck_recalc_aborts_and_closes_once() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("results.csv");
    let mut cfg = uniform(5, 1, &out);
    cfg.poll.timeout_ms = 15;
    let wb = model(&[]).with_busy_polls(u32::MAX);

    let err = run(&cfg, wb.clone()).await.unwrap_err();

    assert!(matches!(
        err.downcast_ref::<SweepError>(),
        Some(SweepError::RecalcTimeout { .. })
    ));
    assert_eq!(wb.state().close_calls, 1);
    let (headers, rows) = read_csv(&out);
    assert_eq!(headers.len(), 5);
    assert!(rows.is_empty());
}
