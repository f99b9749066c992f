//! Reactor sweep entry point.
//!
//! Loads configuration, initialises structured logging, starts the
//! automation bridge, and runs the Monte Carlo sweep. Ctrl+C stops the
//! sweep after the trial in progress; results are still saved and the
//! workbook closed. A second Ctrl+C exits immediately.

use anyhow::Result;
use clap::Parser;
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use reactor_sweep::config::AppConfig;
use reactor_sweep::engine::runner::{RunSettings, SweepRunner};
use reactor_sweep::sampler::Sampler;
use reactor_sweep::storage;
use reactor_sweep::workbook::bridge::BridgeWorkbook;

/// Monte Carlo sweep over a spreadsheet reactor model.
#[derive(Debug, Parser)]
#[command(name = "reactor-sweep", version, about)]
struct Cli {
    /// Path to the TOML configuration.
    #[arg(short, long, env = "SWEEP_CONFIG", default_value = "config.toml")]
    config: PathBuf,

    /// Override the number of trials.
    #[arg(long)]
    trials: Option<u64>,

    /// Override the RNG seed.
    #[arg(long)]
    seed: Option<u64>,

    /// Override the results CSV path.
    #[arg(short, long)]
    output: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (non-fatal if missing)
    let _ = dotenv::dotenv();

    let cli = Cli::parse();

    init_logging();

    let mut cfg = AppConfig::load(&cli.config)?;
    if let Some(trials) = cli.trials {
        cfg.run.trials = trials;
    }
    if let Some(seed) = cli.seed {
        cfg.run.seed = Some(seed);
    }
    if let Some(output) = cli.output {
        cfg.run.output_path = output;
    }
    cfg.validate()?;

    info!(
        config = %cli.config.display(),
        workbook = %cfg.workbook.path.display(),
        sheet = %cfg.workbook.sheet,
        parameters = cfg.parameters.len(),
        validations = cfg.validations.len(),
        results = cfg.results.len(),
        "Reactor sweep starting up"
    );

    // -- Open the workbook -----------------------------------------------

    let workbook =
        BridgeWorkbook::spawn(&cfg.workbook.bridge, &cfg.workbook.path, &cfg.workbook.sheet)
            .await?;
    tokio::time::sleep(Duration::from_millis(cfg.workbook.open_settle_ms)).await;

    // -- Run -------------------------------------------------------------

    let runner = SweepRunner::new(
        workbook,
        cfg.plan(),
        Sampler::new(cfg.sampling),
        RunSettings::from_config(&cfg),
    );

    let stop = runner.stop_handle();
    tokio::spawn(async move {
        if watch_interrupts(tokio::signal::ctrl_c, stop).await {
            std::process::exit(130);
        }
    });

    let report = runner.run().await?;

    let summary_path = cfg.summary_path();
    storage::save_summary(&report, &summary_path)?;

    info!(
        run_id = %report.run_id,
        seed = report.seed,
        trials = report.trials_run,
        accepted = report.accepted,
        rejected = report.rejected,
        acceptance = format!("{:.1}%", report.acceptance_rate() * 100.0),
        summary = %summary_path.display(),
        "Reactor sweep finished"
    );
    println!("{report}");

    Ok(())
}

/// Handle Ctrl+C for the whole run.
///
/// The first interrupt sets `stop`. Returns `true` on the second one, when
/// the caller should exit without waiting for the trial in progress.
async fn watch_interrupts<F, Fut>(mut interrupt: F, stop: Arc<AtomicBool>) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::io::Result<()>>,
{
    while interrupt().await.is_ok() {
        if stop.swap(true, Ordering::SeqCst) {
            warn!("Second shutdown signal received, exiting now");
            return true;
        }
        warn!("Shutdown signal received, finishing current trial (Ctrl+C again to exit now)");
    }
    false
}

/// Initialise the `tracing` subscriber.
fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("reactor_sweep=info"));

    let json_logging = std::env::var("SWEEP_LOG_JSON").is_ok();

    if json_logging {
        fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_thread_ids(true)
            .init();
    } else {
        fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    }
}
