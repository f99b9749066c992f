//! Reactor sweep: Monte Carlo harness for a spreadsheet model.
//!
//! Library crate exposing all modules for use by integration tests
//! and the binary entry point.

pub mod config;
pub mod types;
pub mod sampler;
pub mod workbook;
pub mod engine;
pub mod storage;
