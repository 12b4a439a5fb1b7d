//! Early-stop policies for the generation loop

use rand::{Rng, RngCore};

/// Decides after each accepted token whether the run should end.
pub trait StopCriterion: Send + Sync {
    /// `fragment` is the decoded text of the token just appended
    fn should_stop(&self, fragment: &str, rng: &mut dyn RngCore) -> bool;
}

/// Stochastic stop on sentence-ending punctuation.
///
/// When the decoded fragment is exactly one of the terminators, one uniform
/// value is drawn and the run stops if it falls below `probability`. Other
/// fragments never consume randomness.
#[derive(Debug, Clone)]
pub struct SentenceEndStop {
    terminators: Vec<String>,
    probability: f64,
}

impl SentenceEndStop {
    pub fn new(probability: f64) -> Self {
        Self {
            terminators: [".", "!", "?"].iter().map(|s| s.to_string()).collect(),
            probability: probability.clamp(0.0, 1.0),
        }
    }

    /// Replace the terminator set
    pub fn with_terminators<I, S>(mut self, terminators: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.terminators = terminators.into_iter().map(Into::into).collect();
        self
    }

    pub fn probability(&self) -> f64 {
        self.probability
    }

    pub fn is_terminator(&self, fragment: &str) -> bool {
        self.terminators.iter().any(|t| t == fragment)
    }
}

impl Default for SentenceEndStop {
    fn default() -> Self {
        Self::new(0.3)
    }
}

impl StopCriterion for SentenceEndStop {
    fn should_stop(&self, fragment: &str, rng: &mut dyn RngCore) -> bool {
        self.is_terminator(fragment) && rng.random::<f64>() < self.probability
    }
}

/// Runs every generation to `max_tokens`
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverStop;

impl StopCriterion for NeverStop {
    fn should_stop(&self, _fragment: &str, _rng: &mut dyn RngCore) -> bool {
        false
    }
}
