use rand::Rng;

use crate::config::ConfigError;

/// Decides per message whether speech is synthesized.
///
/// `0.0` never passes and `1.0` always passes without drawing a random number;
/// otherwise a uniform draw in [0, 1) passes iff it is below the probability.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProbabilityGate {
    probability: f64,
}

impl ProbabilityGate {
    pub fn new(probability: f64) -> Result<Self, ConfigError> {
        if !probability.is_finite() || !(0.0..=1.0).contains(&probability) {
            return Err(ConfigError::InvalidProbability(probability));
        }
        Ok(Self { probability })
    }

    pub fn probability(&self) -> f64 {
        self.probability
    }

    pub fn should_synthesize(&self) -> bool {
        self.should_synthesize_with(&mut rand::thread_rng())
    }

    pub fn should_synthesize_with<R: Rng + ?Sized>(&self, rng: &mut R) -> bool {
        if self.probability <= 0.0 {
            return false;
        }
        if self.probability >= 1.0 {
            return true;
        }
        rng.gen::<f64>() < self.probability
    }
}
