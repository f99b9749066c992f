//! Workbook integrations.
//!
//! Defines the `Workbook` trait, the only surface the harness needs from
//! the host spreadsheet application, and the `bridge` backend that drives
//! a real workbook through an external automation process.

pub mod bridge;

use anyhow::Result;
use async_trait::async_trait;

use crate::types::{CellAddress, CellValue};

/// Abstraction over an open, addressable sheet.
///
/// Writing an input is expected to trigger the host's recalculation;
/// `is_idle` reports when that recalculation has finished. Implementors
/// need not be thread-safe beyond `Send`: trials never run concurrently.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Workbook: Send {
    /// Write a value into a cell.
    async fn write_cell(&mut self, cell: &CellAddress, value: CellValue) -> Result<()>;

    /// Read the current value of a cell.
    async fn read_cell(&mut self, cell: &CellAddress) -> Result<CellValue>;

    /// Whether the host has finished all pending recalculation.
    async fn is_idle(&mut self) -> Result<bool>;

    /// Release the workbook. Called exactly once per run.
    async fn close(&mut self) -> Result<()>;
}
