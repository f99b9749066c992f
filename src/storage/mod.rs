//! Persistence layer.
//!
//! Holds the accumulated results table and writes it to CSV. Every write
//! is a full overwrite of the target file, so a checkpoint always reflects
//! exactly the rows accepted so far. The run summary is saved as JSON.

use anyhow::{Context, Result};
use std::path::Path;
use tracing::debug;

use crate::types::{CellValue, RunReport, SimulationRow, SweepError};

// ---------------------------------------------------------------------------
// Results table
// ---------------------------------------------------------------------------

/// Append-only table of accepted trials with a schema fixed up front.
#[derive(Debug, Clone)]
pub struct ResultsTable {
    columns: Vec<String>,
    rows: Vec<Vec<CellValue>>,
}

impl ResultsTable {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn rows(&self) -> impl Iterator<Item = &[CellValue]> {
        self.rows.iter().map(Vec::as_slice)
    }

    /// Append a row. Its columns must match the schema name for name.
    pub fn push(&mut self, row: SimulationRow) -> Result<(), SweepError> {
        if !row.columns().eq(self.columns.iter().map(String::as_str)) {
            return Err(SweepError::SchemaMismatch {
                expected: self.columns.clone(),
                actual: row.columns().map(str::to_string).collect(),
            });
        }
        self.rows.push(row.values().cloned().collect());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// CSV output
// ---------------------------------------------------------------------------

/// Write the whole table to `path`, replacing whatever was there.
pub fn write_csv(table: &ResultsTable, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create output directory {}", parent.display()))?;
    }

    let mut writer = csv::WriterBuilder::new()
        .terminator(csv::Terminator::Any(b'\n'))
        .from_path(path)
        .with_context(|| format!("Failed to open {} for writing", path.display()))?;

    writer
        .write_record(table.columns())
        .context("Failed to write CSV header")?;
    for row in table.rows() {
        writer
            .write_record(row.iter().map(|v| v.to_string()))
            .context("Failed to write CSV row")?;
    }
    writer
        .flush()
        .with_context(|| format!("Failed to flush {}", path.display()))?;

    debug!(path = %path.display(), rows = table.len(), "Results written");
    Ok(())
}

// ---------------------------------------------------------------------------
// Run summary
// ---------------------------------------------------------------------------

/// Save the run summary as pretty-printed JSON.
pub fn save_summary(report: &RunReport, path: &Path) -> Result<()> {
    let json = serde_json::to_string_pretty(report).context("Failed to serialise run summary")?;

    std::fs::write(path, &json)
        .with_context(|| format!("Failed to write run summary to {}", path.display()))?;

    debug!(path = %path.display(), run_id = %report.run_id, "Run summary saved");
    Ok(())
}

/// Load a run summary written by `save_summary`.
pub fn load_summary(path: &Path) -> Result<RunReport> {
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read run summary from {}", path.display()))?;

    serde_json::from_str(&json)
        .with_context(|| format!("Failed to parse run summary from {}", path.display()))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
