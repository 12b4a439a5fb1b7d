//! Core text-generation primitives for nayan
//!
//! This crate provides the building blocks the generation engine is assembled from:
//! - Vocabulary constants and the tokenizer contract
//! - The sliding context window over a run's token history
//! - The forward-pass engine contract
//! - Error types shared by every layer

pub mod backend;
pub mod error;
pub mod tokenizer;
pub mod window;

pub use backend::{BackendError, ForwardPass, LoadOptions};
pub use error::{Error, Result};
pub use tokenizer::{CharTokenizer, Tokenizer};
pub use window::ContextWindow;

/// Core version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Token identifier in `[0, VOCAB_SIZE)`
pub type TokenId = u32;

/// Number of entries in every score vector (GPT-2 vocabulary padded to a multiple of 64)
pub const VOCAB_SIZE: usize = 50304;

/// Maximum number of trailing tokens fed to the forward pass
pub const BLOCK_SIZE: usize = 1024;
