//! Tokenizer for text encoding/decoding
//!
//! The shipped vocabulary is a placeholder character codec, not byte-pair
//! encoding: every character maps to one id and no merges are applied. A real
//! subword vocabulary plugs in through the [`Tokenizer`] trait without touching
//! the generation loop.

use crate::{TokenId, VOCAB_SIZE};

/// Maps text to token ids and back.
pub trait Tokenizer: Send + Sync {
    /// Encode text into token IDs
    fn encode(&self, text: &str) -> Vec<TokenId>;

    /// Decode a single token ID into its text fragment (may be empty)
    fn decode_token(&self, id: TokenId) -> String;

    /// Decode a token sequence as the in-order concatenation of its fragments
    fn decode(&self, ids: &[TokenId]) -> String {
        ids.iter().map(|&id| self.decode_token(id)).collect()
    }

    /// Number of ids the vocabulary covers
    fn vocab_size(&self) -> usize {
        VOCAB_SIZE
    }
}

/// Character codec standing in for a GPT-2 BPE vocabulary.
///
/// `encode` reduces each code point modulo `VOCAB_SIZE`; `decode_token` reduces
/// the id modulo 128 and reads it back as a code point. The mapping is not
/// injective and does not round-trip outside 7-bit ASCII.
#[derive(Debug, Clone, Copy, Default)]
pub struct CharTokenizer;

/// Range `decode_token` folds ids into.
const DECODE_MODULUS: u32 = 128;

impl CharTokenizer {
    pub fn new() -> Self {
        Self
    }
}

impl Tokenizer for CharTokenizer {
    fn encode(&self, text: &str) -> Vec<TokenId> {
        text.chars().map(|c| c as u32 % VOCAB_SIZE as u32).collect()
    }

    fn decode_token(&self, id: TokenId) -> String {
        // Always a valid scalar value: every u32 below 128 is ASCII.
        char::from_u32(id % DECODE_MODULUS).map(String::from).unwrap_or_default()
    }
}
