/// Inference session management with token streaming
///
/// One session is one generation run: it owns the run's token history and
/// output text and borrows the loaded model for its lifetime. Tokens are
/// produced lazily, one forward pass per `next_token` call.
use log::{debug, trace};
use nayan_core::error::{Error, Result};
use nayan_core::{BackendError, ContextWindow, ForwardPass, TokenId, Tokenizer};
use rand::RngCore;

use crate::config::GenerationConfig;
use crate::sampling::Sampler;
use crate::stopping::StopCriterion;

/// Session state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Ready to generate
    Ready,
    /// Currently generating
    Generating,
    /// Generation complete (max tokens reached)
    Complete,
    /// Generation stopped by the stop criterion
    Stopped,
    /// Caller ended the run early
    Cancelled,
    /// A step failed; the run produced no result
    Failed,
}

/// Why a run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    MaxTokens,
    StopCriterion,
    Cancelled,
}

/// One accepted token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedToken {
    /// Position among the generated tokens, starting at 0
    pub index: usize,
    pub id: TokenId,
    /// Decoded fragment (may be empty or several characters)
    pub text: String,
}

/// Result of text generation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerateResult {
    /// Prompt followed by every decoded fragment
    pub text: String,
    /// Generated token IDs
    pub tokens: Vec<TokenId>,
    pub num_prompt_tokens: usize,
    pub num_generated_tokens: usize,
    pub finish_reason: FinishReason,
}

/// Everything a session borrows from its engine for one run
pub struct StepContext<'a, B: ForwardPass> {
    pub backend: &'a B,
    pub handle: &'a mut B::Handle,
    pub tokenizer: &'a dyn Tokenizer,
    pub stop: &'a dyn StopCriterion,
    pub rng: &'a mut dyn RngCore,
}

/// Inference session with streaming support
pub struct InferenceSession<'a, B: ForwardPass> {
    ctx: StepContext<'a, B>,
    sampler: Sampler,
    config: GenerationConfig,
    window: ContextWindow,
    text: String,
    num_prompt_tokens: usize,
    generated_tokens: Vec<TokenId>,
    state: SessionState,
}

impl<'a, B: ForwardPass> InferenceSession<'a, B> {
    /// Create a new inference session seeded with `prompt`
    pub fn new(
        ctx: StepContext<'a, B>,
        prompt: &str,
        config: GenerationConfig,
        block_size: usize,
    ) -> Result<Self> {
        config.validate()?;
        let sampler = Sampler::from_config(&config)?;

        let prompt_tokens = ctx.tokenizer.encode(prompt);
        if prompt_tokens.is_empty() {
            return Err(Error::EmptyPrompt);
        }
        let num_prompt_tokens = prompt_tokens.len();

        Ok(Self {
            ctx,
            sampler,
            config,
            window: ContextWindow::with_tokens(prompt_tokens, block_size),
            text: prompt.to_string(),
            num_prompt_tokens,
            generated_tokens: Vec::new(),
            state: SessionState::Ready,
        })
    }

    /// Get current session state
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Check if generation is over (successfully or not)
    pub fn is_complete(&self) -> bool {
        !matches!(self.state, SessionState::Ready | SessionState::Generating)
    }

    /// Get number of tokens generated
    pub fn tokens_generated(&self) -> usize {
        self.generated_tokens.len()
    }

    /// Get all generated tokens so far
    pub fn generated_tokens(&self) -> &[TokenId] {
        &self.generated_tokens
    }

    /// Text accumulated so far, prompt included
    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn window(&self) -> &ContextWindow {
        &self.window
    }

    /// End the run before the next step
    pub fn cancel(&mut self) {
        if !self.is_complete() {
            self.state = SessionState::Cancelled;
        }
    }

    /// Generate next token
    ///
    /// Returns None once generation is complete. A failed step aborts the run:
    /// the error is returned once and every later call yields None.
    pub fn next_token(&mut self) -> Result<Option<GeneratedToken>> {
        if self.is_complete() {
            return Ok(None);
        }

        if self.state == SessionState::Ready {
            self.state = SessionState::Generating;
        }

        if self.generated_tokens.len() >= self.config.max_tokens {
            self.state = SessionState::Complete;
            return Ok(None);
        }

        match self.step() {
            Ok(token) => Ok(Some(token)),
            Err(e) => {
                self.state = SessionState::Failed;
                Err(e)
            }
        }
    }

    /// Consume the session into its final result
    ///
    /// Drives any remaining steps first, so calling this on a fresh session
    /// runs the whole generation.
    pub fn finish(mut self) -> Result<GenerateResult> {
        while self.next_token()?.is_some() {}

        let finish_reason = match self.state {
            SessionState::Stopped => FinishReason::StopCriterion,
            SessionState::Cancelled => FinishReason::Cancelled,
            _ => FinishReason::MaxTokens,
        };

        Ok(GenerateResult {
            num_generated_tokens: self.generated_tokens.len(),
            text: self.text,
            tokens: self.generated_tokens,
            num_prompt_tokens: self.num_prompt_tokens,
            finish_reason,
        })
    }

    fn step(&mut self) -> Result<GeneratedToken> {
        let scores = self.forward_last_position()?;
        let id = self.sampler.choose(&scores, &mut *self.ctx.rng)?;
        drop(scores);

        self.window.append(id);
        self.generated_tokens.push(id);
        let fragment = self.ctx.tokenizer.decode_token(id);
        self.text.push_str(&fragment);

        let index = self.generated_tokens.len() - 1;
        trace!("token {}: id={} fragment={:?}", index, id, fragment);

        if self.ctx.stop.should_stop(&fragment, &mut *self.ctx.rng) {
            debug!("stop criterion triggered after {} tokens", index + 1);
            self.state = SessionState::Stopped;
        } else if self.generated_tokens.len() >= self.config.max_tokens {
            self.state = SessionState::Complete;
        }

        Ok(GeneratedToken { index, id, text: fragment })
    }

    /// Run the forward pass over the current window and keep only the
    /// scores of the final position
    fn forward_last_position(&mut self) -> Result<Vec<f32>> {
        let slice = self.window.current_slice();
        let len = slice.len();

        let mut input_ids: Vec<i64> = Vec::new();
        input_ids.try_reserve_exact(len)?;
        input_ids.extend(slice.iter().map(|&id| id as i64));

        let mut scores = self
            .ctx
            .backend
            .run(&mut *self.ctx.handle, &input_ids)
            .map_err(BackendError::into_run_error)?;
        drop(input_ids);

        let vocab_size = self.ctx.tokenizer.vocab_size();
        if scores.len() != len * vocab_size {
            return Err(Error::ForwardPassFailure(format!(
                "expected {} scores for shape [1, {}, {}], got {}",
                len * vocab_size,
                len,
                vocab_size,
                scores.len()
            )));
        }

        scores.drain(..(len - 1) * vocab_size);
        Ok(scores)
    }
}

impl<B: ForwardPass> Iterator for InferenceSession<'_, B> {
    type Item = Result<GeneratedToken>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_token().transpose()
    }
}
