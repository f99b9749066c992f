//! Shared types for the sweep harness.
//!
//! These types form the data model used across all modules: cell
//! addresses and values, the fixed sweep plan built from configuration,
//! the per-trial row, the run report and the domain error enum.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use uuid::Uuid;

/// The literal a guard cell must hold for a trial's outputs to be trusted.
pub const VALID_SENTINEL: &str = "VALID";

// ---------------------------------------------------------------------------
// Cell addresses
// ---------------------------------------------------------------------------

/// An A1-style cell reference such as `B12` or `AB4`.
///
/// Column letters are normalised to upper case. At most three column
/// letters are accepted, which covers every column a workbook can hold.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CellAddress(String);

impl CellAddress {
    pub fn parse(raw: &str) -> Result<Self, SweepError> {
        let trimmed = raw.trim();
        let split = trimmed
            .find(|c: char| c.is_ascii_digit())
            .unwrap_or(trimmed.len());
        let (letters, digits) = trimmed.split_at(split);

        let letters_ok = (1..=3).contains(&letters.len())
            && letters.chars().all(|c| c.is_ascii_alphabetic());
        let row_ok = !digits.is_empty()
            && digits.chars().all(|c| c.is_ascii_digit())
            && digits.parse::<u32>().map(|r| r >= 1).unwrap_or(false);

        if !letters_ok || !row_ok {
            return Err(SweepError::InvalidCell(raw.to_string()));
        }

        Ok(Self(format!("{}{}", letters.to_ascii_uppercase(), digits)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for CellAddress {
    type Err = SweepError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for CellAddress {
    type Error = SweepError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<CellAddress> for String {
    fn from(cell: CellAddress) -> Self {
        cell.0
    }
}

impl fmt::Display for CellAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Cell values
// ---------------------------------------------------------------------------

/// A value read from or written to a workbook cell.
///
/// Maps one-to-one onto JSON: `null`, booleans, numbers and strings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CellValue {
    Empty,
    Bool(bool),
    Number(f64),
    Text(String),
}

impl CellValue {
    /// True only for the exact text `VALID`.
    pub fn is_valid_sentinel(&self) -> bool {
        matches!(self, CellValue::Text(s) if s == VALID_SENTINEL)
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            CellValue::Number(n) => Some(*n),
            _ => None,
        }
    }
}

impl From<f64> for CellValue {
    fn from(value: f64) -> Self {
        CellValue::Number(value)
    }
}

impl From<&str> for CellValue {
    fn from(value: &str) -> Self {
        CellValue::Text(value.to_string())
    }
}

impl fmt::Display for CellValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CellValue::Empty => Ok(()),
            CellValue::Bool(b) => write!(f, "{b}"),
            CellValue::Number(n) => write!(f, "{n}"),
            CellValue::Text(s) => f.write_str(s),
        }
    }
}

// ---------------------------------------------------------------------------
// Sweep plan
// ---------------------------------------------------------------------------

/// Two bounds for a sampled parameter, in the order they were configured.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ParameterRange(pub f64, pub f64);

impl ParameterRange {
    pub fn low(&self) -> f64 {
        self.0.min(self.1)
    }

    pub fn high(&self) -> f64 {
        self.0.max(self.1)
    }

    pub fn is_finite(&self) -> bool {
        self.0.is_finite() && self.1.is_finite()
    }
}

/// A sampled model input and the cell it is written to.
#[derive(Debug, Clone, PartialEq)]
pub struct Parameter {
    pub name: String,
    pub range: ParameterRange,
    pub cell: CellAddress,
}

/// A guard cell that must read `VALID` after recalculation.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationCheck {
    pub name: String,
    pub cell: CellAddress,
}

/// A derived output read back after a trial is accepted.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultField {
    pub name: String,
    pub cell: CellAddress,
}

/// Everything a trial touches, fixed for the lifetime of a run.
#[derive(Debug, Clone)]
pub struct SweepPlan {
    pub parameters: Vec<Parameter>,
    pub validations: Vec<ValidationCheck>,
    pub results: Vec<ResultField>,
    /// Whether accepted rows carry the validation columns.
    pub record_validation: bool,
}

impl SweepPlan {
    /// Column names in row order: inputs, validations (when recorded), results.
    pub fn columns(&self) -> Vec<String> {
        let validations: &[ValidationCheck] = if self.record_validation {
            &self.validations
        } else {
            &[]
        };

        self.parameters
            .iter()
            .map(|p| p.name.clone())
            .chain(validations.iter().map(|v| v.name.clone()))
            .chain(self.results.iter().map(|r| r.name.clone()))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Simulation row
// ---------------------------------------------------------------------------

/// One accepted trial: named values in schema order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SimulationRow {
    fields: Vec<(String, CellValue)>,
}

impl SimulationRow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, name: impl Into<String>, value: CellValue) {
        self.fields.push((name.into(), value));
    }

    pub fn get(&self, name: &str) -> Option<&CellValue> {
        self.fields.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|(n, _)| n.as_str())
    }

    pub fn values(&self) -> impl Iterator<Item = &CellValue> {
        self.fields.iter().map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Run report
// ---------------------------------------------------------------------------

/// Summary of a whole sweep, persisted next to the results file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub seed: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub trials_requested: u64,
    pub trials_run: u64,
    pub accepted: u64,
    pub rejected: u64,
    pub checkpoints_written: u64,
    pub output_path: PathBuf,
    pub stopped_early: bool,
}

impl RunReport {
    /// Share of executed trials that passed validation, in `[0, 1]`.
    pub fn acceptance_rate(&self) -> f64 {
        if self.trials_run == 0 {
            0.0
        } else {
            self.accepted as f64 / self.trials_run as f64
        }
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Run {}: trials={}/{} accepted={} rejected={} ({:.1}%) checkpoints={} output={}{}",
            self.run_id,
            self.trials_run,
            self.trials_requested,
            self.accepted,
            self.rejected,
            self.acceptance_rate() * 100.0,
            self.checkpoints_written,
            self.output_path.display(),
            if self.stopped_early { " [stopped early]" } else { "" },
        )
    }
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Domain-specific error types for the sweep harness.
///
/// Only `Validation` is recoverable: it rejects the current trial and the
/// run moves on. Everything else ends the run.
#[derive(Debug, thiserror::Error)]
pub enum SweepError {
    #[error("Validation failed: {}", format_observed(.observed))]
    Validation { observed: Vec<(String, CellValue)> },

    #[error("Recalculation still busy after {waited_ms} ms")]
    RecalcTimeout { waited_ms: u64 },

    #[error("Bridge error ({op}): {message}")]
    Bridge { op: String, message: String },

    #[error("Row columns do not match table schema: expected {expected:?}, got {actual:?}")]
    SchemaMismatch {
        expected: Vec<String>,
        actual: Vec<String>,
    },

    #[error("Cannot sample between {low} and {high}")]
    SamplingRange { low: f64, high: f64 },

    #[error("Invalid cell address: {0:?}")]
    InvalidCell(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

fn format_observed(observed: &[(String, CellValue)]) -> String {
    observed
        .iter()
        .map(|(name, value)| format!("{name}={value:?}"))
        .collect::<Vec<_>>()
        .join(", ")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
