//! Configuration loading from TOML.
//!
//! Reads `config.toml` and deserializes into strongly-typed structs.
//! Cell addresses, parameter names, validation names and result names
//! are fixed here and never change during a run.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::sampler::{Sampler, SamplingMode};
use crate::types::{
    CellAddress, Parameter, ParameterRange, ResultField, SweepError, SweepPlan, ValidationCheck,
};

/// Top-level application configuration.
#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub run: RunConfig,
    #[serde(default)]
    pub sampling: SamplingMode,
    #[serde(default)]
    pub poll: PollConfig,
    pub workbook: WorkbookConfig,
    pub parameters: Vec<ParameterConfig>,
    #[serde(default)]
    pub validations: Vec<CellConfig>,
    #[serde(default)]
    pub results: Vec<CellConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RunConfig {
    pub trials: u64,
    pub checkpoint_interval: u64,
    /// Pause after every trial, accepted or not.
    #[serde(default = "default_trial_delay_ms")]
    pub trial_delay_ms: u64,
    pub output_path: PathBuf,
    /// Keep the validation columns in accepted rows.
    #[serde(default = "default_true")]
    pub record_validation: bool,
    /// Fixed RNG seed. A random one is drawn and logged when absent.
    #[serde(default)]
    pub seed: Option<u64>,
}

/// Bounds on the wait for the host application to finish recalculating.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct PollConfig {
    #[serde(default = "default_poll_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_poll_timeout_ms(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl PollConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct WorkbookConfig {
    pub path: PathBuf,
    pub sheet: String,
    /// Grace period after opening before the first trial.
    #[serde(default = "default_open_settle_ms")]
    pub open_settle_ms: u64,
    pub bridge: BridgeConfig,
}

/// External automation bridge process that owns the host application.
#[derive(Debug, Deserialize, Clone)]
pub struct BridgeConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ParameterConfig {
    pub name: String,
    pub range: ParameterRange,
    pub cell: CellAddress,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CellConfig {
    pub name: String,
    pub cell: CellAddress,
}

fn default_true() -> bool {
    true
}

fn default_trial_delay_ms() -> u64 {
    100
}

fn default_poll_timeout_ms() -> u64 {
    300_000
}

fn default_initial_backoff_ms() -> u64 {
    1
}

fn default_max_backoff_ms() -> u64 {
    50
}

fn default_open_settle_ms() -> u64 {
    1_000
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(contents)?;
        Ok(config)
    }

    /// Check the invariants a run depends on.
    pub fn validate(&self) -> Result<(), SweepError> {
        if self.run.trials == 0 {
            return Err(SweepError::Config("run.trials must be at least 1".into()));
        }
        if self.run.checkpoint_interval == 0 {
            return Err(SweepError::Config(
                "run.checkpoint_interval must be at least 1".into(),
            ));
        }
        if self.parameters.is_empty() {
            return Err(SweepError::Config("at least one [[parameters]] entry is required".into()));
        }

        if let SamplingMode::Midpoint { deviation_fraction } = self.sampling {
            if !deviation_fraction.is_finite() || deviation_fraction < 0.0 {
                return Err(SweepError::Config(format!(
                    "sampling.deviation_fraction must be a non-negative number, got {deviation_fraction}"
                )));
            }
        }

        let sampler = Sampler::new(self.sampling);
        for p in &self.parameters {
            if !p.range.is_finite() {
                return Err(SweepError::Config(format!(
                    "parameter {} has a non-finite range",
                    p.name
                )));
            }
            if let Err(e) = sampler.window(p.range) {
                return Err(SweepError::Config(format!("parameter {}: {e}", p.name)));
            }
        }

        if self.poll.timeout_ms == 0 {
            return Err(SweepError::Config("poll.timeout_ms must be at least 1".into()));
        }
        if self.poll.initial_backoff_ms > self.poll.max_backoff_ms {
            return Err(SweepError::Config(
                "poll.initial_backoff_ms must not exceed poll.max_backoff_ms".into(),
            ));
        }

        let mut seen = HashSet::new();
        let names = self
            .parameters
            .iter()
            .map(|p| &p.name)
            .chain(self.validations.iter().map(|v| &v.name))
            .chain(self.results.iter().map(|r| &r.name));
        for name in names {
            if name.trim().is_empty() {
                return Err(SweepError::Config("column names must not be empty".into()));
            }
            if !seen.insert(name.as_str()) {
                return Err(SweepError::Config(format!("duplicate column name: {name}")));
            }
        }

        Ok(())
    }

    /// Build the fixed plan every trial follows.
    pub fn plan(&self) -> SweepPlan {
        SweepPlan {
            parameters: self
                .parameters
                .iter()
                .map(|p| Parameter {
                    name: p.name.clone(),
                    range: p.range,
                    cell: p.cell.clone(),
                })
                .collect(),
            validations: self
                .validations
                .iter()
                .map(|v| ValidationCheck {
                    name: v.name.clone(),
                    cell: v.cell.clone(),
                })
                .collect(),
            results: self
                .results
                .iter()
                .map(|r| ResultField {
                    name: r.name.clone(),
                    cell: r.cell.clone(),
                })
                .collect(),
            record_validation: self.run.record_validation,
        }
    }

    /// Where the run summary lands: next to the results file.
    pub fn summary_path(&self) -> PathBuf {
        let mut name = self.run.output_path.as_os_str().to_owned();
        name.push(".summary.json");
        PathBuf::from(name)
    }
}
