//! Stochastic parameter sampling.
//!
//! Turns a parameter's two configured bounds into one draw. The random
//! source is always passed in by the caller so runs can be reproduced
//! from a seed.

use rand::Rng;
use serde::Deserialize;

use crate::types::{ParameterRange, SweepError};

/// Default half-width of the midpoint window, as a fraction of the range.
pub const DEFAULT_DEVIATION_FRACTION: f64 = 0.10;

fn default_deviation_fraction() -> f64 {
    DEFAULT_DEVIATION_FRACTION
}

/// How a parameter's range is turned into a sample.
#[derive(Debug, Clone, Copy, Default, PartialEq, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum SamplingMode {
    /// Uniform over the whole closed range.
    #[default]
    Uniform,
    /// Uniform over `midpoint ± (upper - lower) * deviation_fraction`.
    Midpoint {
        #[serde(default = "default_deviation_fraction")]
        deviation_fraction: f64,
    },
}

#[derive(Debug, Clone, Copy)]
pub struct Sampler {
    mode: SamplingMode,
}

impl Sampler {
    pub fn new(mode: SamplingMode) -> Self {
        Self { mode }
    }

    pub fn mode(&self) -> SamplingMode {
        self.mode
    }

    /// The closed interval a draw for `range` falls in.
    ///
    /// Bounds may arrive in either order. Fails when the interval or its
    /// width is too large to draw from.
    pub fn window(&self, range: ParameterRange) -> Result<(f64, f64), SweepError> {
        let (low, high) = match self.mode {
            SamplingMode::Uniform => (range.low(), range.high()),
            SamplingMode::Midpoint { deviation_fraction } => {
                let midpoint = range.0 / 2.0 + range.1 / 2.0;
                let delta = ((range.1 - range.0) * deviation_fraction).abs();
                (midpoint - delta, midpoint + delta)
            }
        };

        // gen_range scales by slightly more than the width
        let width = high - low;
        if !low.is_finite() || !high.is_finite() || width > f64::MAX / 2.0 {
            return Err(SweepError::SamplingRange { low, high });
        }
        Ok((low, high))
    }

    /// Draw one value for `range`. A degenerate range returns its bound.
    pub fn sample<R: Rng>(&self, range: ParameterRange, rng: &mut R) -> Result<f64, SweepError> {
        let (low, high) = self.window(range)?;
        if low >= high {
            return Ok(low);
        }
        Ok(rng.gen_range(low..=high))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
