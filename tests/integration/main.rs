//! Integration tests for the sweep harness.
//!
//! Everything runs against `FakeWorkbook`, an in-memory sheet whose
//! "recalculation" is a test-supplied closure.

mod sweep;
