//! Workbook driver: one trial against the open sheet.
//!
//! Samples every parameter, writes the draws into their cells, waits for
//! the host to finish recalculating, checks the guard cells and, if they
//! all read `VALID`, reads the result cells back.

use anyhow::{Context, Result};
use rand::Rng;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::config::PollConfig;
use crate::sampler::Sampler;
use crate::types::{CellValue, SimulationRow, SweepError, SweepPlan};
use crate::workbook::Workbook;

const MIN_BACKOFF: Duration = Duration::from_millis(1);

/// Block until the workbook reports idle, backing off between polls.
///
/// Returns the number of polls it took. Exceeding `poll.timeout_ms`
/// yields `SweepError::RecalcTimeout`.
pub async fn wait_for_idle<W>(workbook: &mut W, poll: &PollConfig) -> Result<u32>
where
    W: Workbook + ?Sized,
{
    let started = Instant::now();
    let max_backoff = poll.max_backoff().max(MIN_BACKOFF);
    let mut backoff = poll.initial_backoff().clamp(MIN_BACKOFF, max_backoff);
    let mut polls = 0u32;

    loop {
        polls += 1;
        if workbook.is_idle().await.context("Failed to query calculation state")? {
            trace!(polls, "Recalculation idle");
            return Ok(polls);
        }

        let waited = started.elapsed();
        if waited >= poll.timeout() {
            return Err(SweepError::RecalcTimeout {
                waited_ms: waited.as_millis() as u64,
            }
            .into());
        }

        let remaining = poll.timeout() - waited;
        tokio::time::sleep(backoff.min(remaining)).await;
        backoff = (backoff * 2).min(max_backoff);
    }
}

/// Run one trial and return the accepted row.
///
/// A trial whose guard cells are not all `VALID` fails with
/// `SweepError::Validation` carrying every observed guard value; result
/// cells are not read in that case. Any other error is fatal to the run.
pub async fn run_simulation<W, R>(
    workbook: &mut W,
    plan: &SweepPlan,
    sampler: &Sampler,
    rng: &mut R,
    poll: &PollConfig,
) -> Result<SimulationRow>
where
    W: Workbook + ?Sized,
    R: Rng,
{
    let mut inputs = Vec::with_capacity(plan.parameters.len());
    for param in &plan.parameters {
        let value = sampler
            .sample(param.range, rng)
            .with_context(|| format!("Failed to sample {}", param.name))?;
        workbook
            .write_cell(&param.cell, CellValue::Number(value))
            .await
            .with_context(|| format!("Failed to write {} to {}", param.name, param.cell))?;
        inputs.push((param.name.clone(), value));
    }

    let polls = wait_for_idle(workbook, poll).await?;

    let mut observed = Vec::with_capacity(plan.validations.len());
    for check in &plan.validations {
        let value = workbook
            .read_cell(&check.cell)
            .await
            .with_context(|| format!("Failed to read guard {} at {}", check.name, check.cell))?;
        observed.push((check.name.clone(), value));
    }

    if !observed.iter().all(|(_, v)| v.is_valid_sentinel()) {
        return Err(SweepError::Validation { observed }.into());
    }

    let mut row = SimulationRow::new();
    for (name, value) in inputs {
        row.push(name, CellValue::Number(value));
    }
    if plan.record_validation {
        for (name, value) in observed {
            row.push(name, value);
        }
    }
    for field in &plan.results {
        let value = workbook
            .read_cell(&field.cell)
            .await
            .with_context(|| format!("Failed to read result {} at {}", field.name, field.cell))?;
        row.push(field.name.clone(), value);
    }

    debug!(polls, columns = row.len(), "Trial row collected");
    Ok(row)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
