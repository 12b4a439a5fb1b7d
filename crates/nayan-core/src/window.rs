//! Sliding context window over the token history of one generation run
//!
//! The full history is kept; only the trailing `block_size` tokens are handed
//! to the forward pass. Older tokens fall out of the model input once the
//! window is full but stay in the history.

use crate::{TokenId, BLOCK_SIZE};

#[derive(Debug, Clone)]
pub struct ContextWindow {
    tokens: Vec<TokenId>,
    block_size: usize,
}

impl ContextWindow {
    /// Create an empty window bounded by `block_size` (clamped to at least 1)
    pub fn new(block_size: usize) -> Self {
        Self { tokens: Vec::new(), block_size: block_size.max(1) }
    }

    /// Create a window seeded with prompt tokens
    pub fn with_tokens(tokens: Vec<TokenId>, block_size: usize) -> Self {
        Self { tokens, block_size: block_size.max(1) }
    }

    pub fn append(&mut self, id: TokenId) {
        self.tokens.push(id);
    }

    /// The last `min(len, block_size)` tokens, in order
    pub fn current_slice(&self) -> &[TokenId] {
        let start = self.tokens.len().saturating_sub(self.block_size);
        &self.tokens[start..]
    }

    /// Full token history
    pub fn tokens(&self) -> &[TokenId] {
        &self.tokens
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }
}

impl Default for ContextWindow {
    fn default() -> Self {
        Self::new(BLOCK_SIZE)
    }
}
