//! Seeded random source shared by every randomized component.
//!
//! One `SimRng` is owned by the `Simulation` and handed out by `&mut` to the
//! mobility models, the MAC backoff and the traffic generators. Because events
//! dispatch in a deterministic order, the sequence of draws (and therefore the
//! whole run) is reproducible from the seed alone.

use rand::{Rng, RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Exp, Normal};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{SimError, SimResult};

/// Deterministic random number generator for one simulation run.
#[derive(Debug, Clone)]
pub struct SimRng {
    rng: ChaCha8Rng,
    seed: u64,
}

impl SimRng {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: ChaCha8Rng::seed_from_u64(seed),
            seed,
        }
    }

    /// Seed this generator was created with.
    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Uniform sample in `[low, high)`; returns `low` for an empty range.
    pub fn uniform(&mut self, low: f64, high: f64) -> f64 {
        if low < high { self.rng.gen_range(low..high) } else { low }
    }

    /// Uniform integer in `[0, bound)`; returns 0 when `bound` is 0.
    pub fn below(&mut self, bound: u32) -> u32 {
        if bound == 0 { 0 } else { self.rng.gen_range(0..bound) }
    }
}

impl RngCore for SimRng {
    fn next_u32(&mut self) -> u32 {
        self.rng.next_u32()
    }

    fn next_u64(&mut self) -> u64 {
        self.rng.next_u64()
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        self.rng.fill_bytes(dest)
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand::Error> {
        self.rng.try_fill_bytes(dest)
    }
}

/// Scalar random variable used for on/off periods and walker speeds.
///
/// In TOML: `{ kind = "constant", value = 1.0 }`,
/// `{ kind = "uniform", min = 0.5, max = 1.5 }`,
/// `{ kind = "exponential", mean = 0.2 }` or
/// `{ kind = "normal", mean = 5.0, std_dev = 1.0 }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", deny_unknown_fields)]
pub enum RandomVariable {
    Constant { value: f64 },
    Uniform { min: f64, max: f64 },
    Exponential { mean: f64 },
    /// Normal distribution; negative samples are clamped to zero.
    Normal { mean: f64, std_dev: f64 },
}

impl RandomVariable {
    pub fn constant(value: f64) -> Self {
        RandomVariable::Constant { value }
    }

    /// Draw one sample. Never negative.
    pub fn sample(&self, rng: &mut SimRng) -> f64 {
        let value = match *self {
            RandomVariable::Constant { value } => value,
            RandomVariable::Uniform { min, max } => rng.uniform(min, max),
            RandomVariable::Exponential { mean } => match Exp::new(1.0 / mean) {
                Ok(exp) => exp.sample(rng),
                Err(_) => 0.0,
            },
            RandomVariable::Normal { mean, std_dev } => match Normal::new(mean, std_dev) {
                Ok(normal) => normal.sample(rng),
                Err(_) => mean,
            },
        };
        value.max(0.0)
    }

    /// Draw one sample interpreted as seconds, saturating at `Duration::MAX`.
    pub fn sample_duration(&self, rng: &mut SimRng) -> Duration {
        saturating_secs(self.sample(rng))
    }

    /// True when every sample is guaranteed to be zero.
    pub fn is_always_zero(&self) -> bool {
        match *self {
            RandomVariable::Constant { value } => value <= 0.0,
            RandomVariable::Uniform { max, .. } => max <= 0.0,
            _ => false,
        }
    }

    pub(crate) fn validate(&self, what: &str) -> SimResult<()> {
        let ok = match *self {
            RandomVariable::Constant { value } => value.is_finite() && value >= 0.0,
            RandomVariable::Uniform { min, max } => min.is_finite() && max.is_finite() && min >= 0.0 && min <= max,
            RandomVariable::Exponential { mean } => mean.is_finite() && mean > 0.0,
            RandomVariable::Normal { mean, std_dev } => mean.is_finite() && std_dev.is_finite() && std_dev >= 0.0,
        };
        if ok {
            Ok(())
        } else {
            Err(SimError::InvalidConfig(format!("{what}: invalid random variable {self:?}")))
        }
    }
}

/// Convert seconds to a `Duration`, saturating instead of panicking on values
/// too large to represent. Negative and NaN inputs map to zero.
pub(crate) fn saturating_secs(secs: f64) -> Duration {
    match Duration::try_from_secs_f64(secs) {
        Ok(duration) => duration,
        Err(_) if secs > 0.0 => Duration::MAX,
        Err(_) => Duration::ZERO,
    }
}
