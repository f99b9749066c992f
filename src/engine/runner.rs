//! Run orchestrator.
//!
//! Repeats the sample → write → recalc → validate → read cycle a fixed
//! number of times, strictly one trial after another: the sheet is a
//! single shared surface and trials are not isolated from each other.
//! Accepted rows accumulate in a `ResultsTable` that is checkpointed to
//! disk at a fixed cadence and saved once more at the end. The workbook
//! is closed exactly once, whichever way the run ends.

use anyhow::Result;
use chrono::Utc;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};
use uuid::Uuid;

use super::driver::run_simulation;
use crate::config::{AppConfig, PollConfig};
use crate::sampler::Sampler;
use crate::storage::{self, ResultsTable};
use crate::types::{RunReport, SweepError, SweepPlan};
use crate::workbook::Workbook;

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// Knobs for a single sweep.
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub trials: u64,
    pub checkpoint_interval: u64,
    pub trial_delay: Duration,
    pub output_path: PathBuf,
    pub poll: PollConfig,
    pub seed: u64,
}

impl RunSettings {
    /// Settings from a loaded config. A missing seed is drawn at random.
    pub fn from_config(cfg: &AppConfig) -> Self {
        Self {
            trials: cfg.run.trials,
            checkpoint_interval: cfg.run.checkpoint_interval.max(1),
            trial_delay: Duration::from_millis(cfg.run.trial_delay_ms),
            output_path: cfg.run.output_path.clone(),
            poll: cfg.poll.clone(),
            seed: cfg.run.seed.unwrap_or_else(rand::random),
        }
    }
}

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

/// Drives a full sweep against one workbook.
pub struct SweepRunner<W: Workbook> {
    workbook: W,
    plan: SweepPlan,
    sampler: Sampler,
    settings: RunSettings,
    rng: StdRng,
    table: ResultsTable,
    stop: Arc<AtomicBool>,
}

/// Counters kept while trials run.
#[derive(Debug, Default)]
struct Progress {
    trials_run: u64,
    accepted: u64,
    rejected: u64,
    checkpoints_written: u64,
    stopped_early: bool,
}

impl<W: Workbook> SweepRunner<W> {
    pub fn new(workbook: W, plan: SweepPlan, sampler: Sampler, settings: RunSettings) -> Self {
        let table = ResultsTable::new(plan.columns());
        Self {
            workbook,
            plan,
            sampler,
            rng: StdRng::seed_from_u64(settings.seed),
            settings,
            table,
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag that ends the run after the trial in progress when set.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    /// Run every trial, save the results and close the workbook.
    ///
    /// A fatal error still closes the workbook and makes a best-effort
    /// save of the accepted rows before it is returned.
    pub async fn run(mut self) -> Result<RunReport> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let mut progress = Progress::default();

        info!(
            %run_id,
            trials = self.settings.trials,
            checkpoint_interval = self.settings.checkpoint_interval,
            seed = self.settings.seed,
            sampling = ?self.sampler.mode(),
            output = %self.settings.output_path.display(),
            "Sweep starting"
        );

        let outcome = match self.run_trials(&mut progress).await {
            Ok(()) => self.save().map(|_| {
                info!(
                    trials = progress.trials_run,
                    rows = self.table.len(),
                    output = %self.settings.output_path.display(),
                    "Sweep complete, results saved"
                );
            }),
            Err(e) => {
                error!(error = %format!("{e:#}"), trial = progress.trials_run, "Sweep aborted");
                if let Err(save_err) = self.save() {
                    warn!(error = %save_err, "Could not save accepted rows after abort");
                }
                Err(e)
            }
        };

        let closed = self.workbook.close().await;
        if let Err(e) = &closed {
            warn!(error = %e, "Failed to close workbook");
        }

        outcome?;
        closed?;

        Ok(RunReport {
            run_id,
            seed: self.settings.seed,
            started_at,
            finished_at: Utc::now(),
            trials_requested: self.settings.trials,
            trials_run: progress.trials_run,
            accepted: progress.accepted,
            rejected: progress.rejected,
            checkpoints_written: progress.checkpoints_written,
            output_path: self.settings.output_path.clone(),
            stopped_early: progress.stopped_early,
        })
    }

    async fn run_trials(&mut self, progress: &mut Progress) -> Result<()> {
        for trial in 1..=self.settings.trials {
            if self.stop.load(Ordering::SeqCst) {
                info!(trial, "Stop requested, ending sweep early");
                progress.stopped_early = true;
                break;
            }

            let now = Instant::now();
            let result = run_simulation(
                &mut self.workbook,
                &self.plan,
                &self.sampler,
                &mut self.rng,
                &self.settings.poll,
            )
            .await;
            let elapsed_ms = now.elapsed().as_secs_f64() * 1000.0;
            progress.trials_run = trial;

            match result {
                Ok(row) => {
                    self.table.push(row)?;
                    progress.accepted += 1;
                    info!(
                        trial,
                        elapsed_ms = format!("{elapsed_ms:.2}"),
                        "Trial accepted"
                    );
                }
                Err(e) => {
                    let rejected = matches!(
                        e.downcast_ref::<SweepError>(),
                        Some(SweepError::Validation { .. })
                    );
                    if !rejected {
                        return Err(e.context(format!("Trial {trial} failed")));
                    }
                    progress.rejected += 1;
                    info!(
                        trial,
                        elapsed_ms = format!("{elapsed_ms:.2}"),
                        reason = %e,
                        "Trial rejected"
                    );
                }
            }

            if !self.settings.trial_delay.is_zero() {
                tokio::time::sleep(self.settings.trial_delay).await;
            }

            if trial % self.settings.checkpoint_interval == 0 {
                info!(trial, rows = self.table.len(), "Saving checkpoint");
                self.save()?;
                progress.checkpoints_written += 1;
            }
        }
        Ok(())
    }

    fn save(&self) -> Result<()> {
        storage::write_csv(&self.table, &self.settings.output_path)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
