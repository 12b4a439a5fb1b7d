//! Generation and runtime configuration

use nayan_core::error::{Error, Result};
use nayan_core::{LoadOptions, BLOCK_SIZE};
use serde::{Deserialize, Serialize};

/// Per-run generation configuration
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    /// Maximum number of tokens to generate
    pub max_tokens: usize,
    /// Temperature for sampling (must be > 0)
    pub temperature: f32,
    /// Top-k sampling (0 = greedy)
    pub top_k: usize,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self { max_tokens: 100, temperature: 0.8, top_k: 40 }
    }
}

impl GenerationConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| Error::InvalidConfig(format!("Invalid generation config JSON: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the sampler cannot run with
    pub fn validate(&self) -> Result<()> {
        if !self.temperature.is_finite() || self.temperature <= 0.0 {
            return Err(Error::InvalidConfig(format!(
                "temperature must be a finite value > 0, got {}",
                self.temperature
            )));
        }
        if self.max_tokens == 0 {
            return Err(Error::InvalidConfig("max_tokens must be > 0".to_string()));
        }
        Ok(())
    }
}

/// Runtime configuration for one engine instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Trailing tokens fed to the forward pass each step
    pub block_size: usize,
    pub inter_op_threads: usize,
    pub intra_op_threads: usize,
    /// Fixed seed for sampling and early stop; `None` draws from OS entropy
    pub seed: Option<u64>,
    /// Chance of stopping after a sentence-ending fragment
    pub stop_probability: f64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        let load = LoadOptions::default();
        Self {
            block_size: BLOCK_SIZE,
            inter_op_threads: load.inter_op_threads,
            intra_op_threads: load.intra_op_threads,
            seed: None,
            stop_probability: 0.3,
        }
    }
}

impl RuntimeConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| Error::ParseError(format!("Invalid config JSON: {}", e)))?;
        if config.block_size == 0 {
            return Err(Error::ParseError("block_size must be > 0".to_string()));
        }
        if !(0.0..=1.0).contains(&config.stop_probability) {
            return Err(Error::ParseError(format!(
                "stop_probability must be within [0, 1], got {}",
                config.stop_probability
            )));
        }
        Ok(config)
    }

    pub fn load_options(&self) -> LoadOptions {
        LoadOptions {
            inter_op_threads: self.inter_op_threads,
            intra_op_threads: self.intra_op_threads,
        }
    }
}
