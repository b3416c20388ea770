use serde::{Deserialize, Serialize};

use crate::{EngineError, Result, Sample};

/// Attack/release time constants in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct EnvelopeTiming {
    pub attack: f32,
    pub release: f32,
}

/// One-pole attack/release follower over the rectified signal.
///
/// The follower keeps a single scalar of state, so feeding a batch through
/// [`EnvelopeFollower::process`] is identical to calling
/// [`EnvelopeFollower::update`] for every sample in order.
#[derive(Debug, Clone)]
pub struct EnvelopeFollower {
    attack_rate: f32,
    release_rate: f32,
    value: f32,
}

impl EnvelopeFollower {
    pub fn new(timing: EnvelopeTiming, sample_rate: f32) -> Result<Self> {
        if !(sample_rate.is_finite() && sample_rate > 0.0) {
            return Err(EngineError::invalid(format!(
                "envelope sample rate must be positive, got {sample_rate}"
            )));
        }

        Ok(Self {
            attack_rate: smoothing_rate(timing.attack, sample_rate),
            release_rate: smoothing_rate(timing.release, sample_rate),
            value: 0.0,
        })
    }

    /// Advances by one sample and returns the new envelope value.
    ///
    /// With a rate of 1 the value is set to `|sample|` outright, so an
    /// instantaneous follower carries no rounding from earlier samples.
    #[inline]
    pub fn update(&mut self, sample: Sample) -> f32 {
        let target = sample.abs();
        let rate = if target > self.value {
            self.attack_rate
        } else {
            self.release_rate
        };
        if rate >= 1.0 {
            self.value = target;
        } else {
            self.value += (target - self.value) * rate;
        }
        self.value
    }

    /// Folds [`Self::update`] over `samples`. An empty batch leaves the value
    /// untouched.
    pub fn process(&mut self, samples: &[Sample]) -> f32 {
        samples.iter().fold(self.value, |_, &sample| self.update(sample))
    }

    pub fn value(&self) -> f32 {
        self.value
    }

    pub fn reset(&mut self) {
        self.value = 0.0;
    }
}

/// Per-sample smoothing coefficient `1 - exp(-1 / (tau * fs))` in `[0, 1]`.
///
/// Non-positive time constants yield `1.0`, i.e. the follower snaps to the
/// input.
pub fn smoothing_rate(tau: f32, sample_rate: f32) -> f32 {
    if tau.is_nan() || tau <= 0.0 {
        return 1.0;
    }
    let rate = 1.0 - (-1.0 / (tau * sample_rate)).exp();
    if rate.is_nan() {
        1.0
    } else {
        rate.clamp(0.0, 1.0)
    }
}
