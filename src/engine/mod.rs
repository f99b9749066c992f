//! Core engine: the trial driver and the sweep loop around it.

pub mod driver;
pub mod runner;
