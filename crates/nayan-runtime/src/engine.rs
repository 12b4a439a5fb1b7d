//! Generation controller.
//!
//! [`InferenceEngine`] owns the loaded model handle, the random source and
//! the engine state machine:
//!
//! ```text
//! Idle -> ModelLoading -> Ready <-> Generating
//!            |                          |
//!            +--------> Failed <--------+
//! ```
//!
//! Every entry point takes `&self`, so an engine can be shared across threads
//! behind an `Arc`. Only one load or generation runs at a time; a second
//! caller is rejected with [`Error::Busy`] instead of waiting.

use std::fmt;
use std::path::Path;

use log::{debug, info, warn};
use nayan_core::error::{Error, Result};
use nayan_core::{CharTokenizer, ForwardPass, Tokenizer};
use parking_lot::{Mutex, MutexGuard, RwLock};
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};

use crate::config::{GenerationConfig, RuntimeConfig};
use crate::inference::{GenerateResult, GeneratedToken, InferenceSession, StepContext};
use crate::stopping::{SentenceEndStop, StopCriterion};

/// Engine state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerationState {
    /// No model loaded
    Idle,
    /// A load is in flight
    ModelLoading,
    /// Model loaded, no generation running
    Ready,
    /// A generation is in flight
    Generating,
    /// Last load or generation failed; a new load is required
    Failed(String),
}

/// Per-engine exclusive resources; held for the whole of a load or run
struct Slot<H> {
    handle: Option<H>,
    rng: Box<dyn RngCore + Send>,
}

/// Builder for creating an InferenceEngine.
pub struct EngineBuilder<B: ForwardPass> {
    backend: B,
    config: RuntimeConfig,
    tokenizer: Option<Box<dyn Tokenizer>>,
    stop: Option<Box<dyn StopCriterion>>,
    rng: Option<Box<dyn RngCore + Send>>,
}

impl<B: ForwardPass> EngineBuilder<B> {
    pub fn new(backend: B) -> Self {
        Self { backend, config: RuntimeConfig::default(), tokenizer: None, stop: None, rng: None }
    }

    /// Set runtime configuration
    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    /// Replace the placeholder character tokenizer
    pub fn tokenizer(mut self, tokenizer: impl Tokenizer + 'static) -> Self {
        self.tokenizer = Some(Box::new(tokenizer));
        self
    }

    /// Replace the sentence-end stop policy
    pub fn stop_criterion(mut self, stop: impl StopCriterion + 'static) -> Self {
        self.stop = Some(Box::new(stop));
        self
    }

    /// Inject the random source used for sampling and early stop
    pub fn rng(mut self, rng: impl RngCore + Send + 'static) -> Self {
        self.rng = Some(Box::new(rng));
        self
    }

    /// Seed the default random source
    pub fn seed(mut self, seed: u64) -> Self {
        self.config.seed = Some(seed);
        self
    }

    /// Build the engine.
    pub fn build(self) -> InferenceEngine<B> {
        let rng = self.rng.unwrap_or_else(|| match self.config.seed {
            Some(seed) => Box::new(StdRng::seed_from_u64(seed)),
            None => Box::new(StdRng::from_os_rng()),
        });
        let stop = self
            .stop
            .unwrap_or_else(|| Box::new(SentenceEndStop::new(self.config.stop_probability)));
        let tokenizer = self.tokenizer.unwrap_or_else(|| Box::new(CharTokenizer::new()));

        InferenceEngine {
            backend: self.backend,
            config: self.config,
            tokenizer,
            stop,
            state: RwLock::new(GenerationState::Idle),
            slot: Mutex::new(Slot { handle: None, rng }),
        }
    }
}

/// Text generation engine over an external forward pass.
pub struct InferenceEngine<B: ForwardPass> {
    backend: B,
    config: RuntimeConfig,
    tokenizer: Box<dyn Tokenizer>,
    stop: Box<dyn StopCriterion>,
    state: RwLock<GenerationState>,
    slot: Mutex<Slot<B::Handle>>,
}

impl<B: ForwardPass> InferenceEngine<B> {
    /// Create an engine with default configuration
    pub fn new(backend: B) -> Self {
        EngineBuilder::new(backend).build()
    }

    /// Create a new engine builder.
    pub fn builder(backend: B) -> EngineBuilder<B> {
        EngineBuilder::new(backend)
    }

    /// Current state; readable while a load or run is in flight
    pub fn state(&self) -> GenerationState {
        self.state.read().clone()
    }

    pub fn is_ready(&self) -> bool {
        *self.state.read() == GenerationState::Ready
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn tokenizer(&self) -> &dyn Tokenizer {
        self.tokenizer.as_ref()
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    fn set_state(&self, state: GenerationState) {
        *self.state.write() = state;
    }

    /// Load a model artifact, replacing any model already loaded
    ///
    /// On failure the engine is left in `Failed` and the error is returned;
    /// a later `generate` reports `ModelNotLoaded`.
    pub fn load_model(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let mut slot = self
            .slot
            .try_lock()
            .ok_or_else(|| Error::Busy(format!("cannot load model while {:?}", self.state())))?;

        if let Some(old) = slot.handle.take() {
            debug!("closing previous model before reload");
            if let Err(e) = self.backend.close(old) {
                warn!("failed to close previous model handle: {}", e);
            }
        }

        self.set_state(GenerationState::ModelLoading);
        info!("loading model from {} ({})", path.display(), self.backend.name());

        match self.backend.load(path, &self.config.load_options()) {
            Ok(handle) => {
                slot.handle = Some(handle);
                self.set_state(GenerationState::Ready);
                info!("model loaded");
                Ok(())
            }
            Err(e) => {
                let reason = e.to_string();
                warn!("model load failed for {}: {}", path.display(), reason);
                self.set_state(GenerationState::Failed(reason.clone()));
                Err(Error::ModelLoadFailure(format!("{}: {}", path.display(), reason)))
            }
        }
    }

    /// Generate text from a prompt (blocking)
    pub fn generate(&self, prompt: &str, config: GenerationConfig) -> Result<GenerateResult> {
        self.generate_stream(prompt, config, |_| true)
    }

    /// Generate with streaming callback
    ///
    /// `on_token` runs after each accepted token, in generation order.
    /// Returning `false` ends the run early with `FinishReason::Cancelled`.
    pub fn generate_stream<F>(
        &self,
        prompt: &str,
        config: GenerationConfig,
        mut on_token: F,
    ) -> Result<GenerateResult>
    where
        F: FnMut(&GeneratedToken) -> bool,
    {
        config.validate()?;

        let slot = self.slot.try_lock().ok_or_else(|| self.contended(&self.state()))?;
        let state = self.state();
        if state != GenerationState::Ready || slot.handle.is_none() {
            return Err(self.not_ready(&state));
        }

        self.set_state(GenerationState::Generating);
        let mut run = RunGuard { engine: self, slot, finished: false };
        debug!(
            "generating: {} prompt chars, max_tokens={}, temperature={}, top_k={}",
            prompt.chars().count(),
            config.max_tokens,
            config.temperature,
            config.top_k
        );

        let Slot { handle, rng } = &mut *run.slot;
        let outcome = match handle.as_mut() {
            Some(handle) => {
                let ctx = StepContext {
                    backend: &self.backend,
                    handle,
                    tokenizer: self.tokenizer.as_ref(),
                    stop: self.stop.as_ref(),
                    rng: &mut **rng,
                };
                run_session(ctx, prompt, config, self.config.block_size, &mut on_token)
            }
            None => Err(Error::ModelNotLoaded("model handle missing".to_string())),
        };
        run.finished = true;

        match outcome {
            Ok(result) => {
                self.set_state(GenerationState::Ready);
                info!(
                    "generation finished: {} tokens ({:?})",
                    result.num_generated_tokens, result.finish_reason
                );
                Ok(result)
            }
            Err(e) if e.is_recoverable() => {
                warn!("generation aborted: {}", e);
                self.set_state(GenerationState::Ready);
                Err(e)
            }
            Err(e) => {
                warn!("generation failed, releasing model: {}", e);
                self.release_handle(&mut run.slot);
                self.set_state(GenerationState::Failed(e.to_string()));
                Err(e)
            }
        }
    }

    /// Release the loaded model and return to `Idle`
    pub fn close(&self) -> Result<()> {
        let mut slot = self
            .slot
            .try_lock()
            .ok_or_else(|| Error::Busy(format!("cannot close while {:?}", self.state())))?;

        let closed = match slot.handle.take() {
            Some(handle) => self
                .backend
                .close(handle)
                .map_err(|e| Error::ResourceError(format!("failed to close model: {}", e))),
            None => Ok(()),
        };
        self.set_state(GenerationState::Idle);
        info!("engine closed");
        closed
    }

    fn release_handle(&self, slot: &mut Slot<B::Handle>) {
        if let Some(handle) = slot.handle.take() {
            if let Err(e) = self.backend.close(handle) {
                warn!("failed to close model handle: {}", e);
            }
        }
    }

    /// Error for a caller that lost the race for the slot
    ///
    /// `Ready` still shows while a winning run has the slot but has not yet
    /// moved to `Generating`.
    fn contended(&self, state: &GenerationState) -> Error {
        match state {
            GenerationState::Ready | GenerationState::Generating => {
                Error::Busy("a generation is already in flight".to_string())
            }
            other => self.not_ready(other),
        }
    }

    fn not_ready(&self, state: &GenerationState) -> Error {
        match state {
            GenerationState::Generating => {
                Error::Busy("a generation is already in flight".to_string())
            }
            other => Error::ModelNotLoaded(format!("engine is {:?}", other)),
        }
    }
}

fn run_session<B: ForwardPass>(
    ctx: StepContext<'_, B>,
    prompt: &str,
    config: GenerationConfig,
    block_size: usize,
    on_token: &mut dyn FnMut(&GeneratedToken) -> bool,
) -> Result<GenerateResult> {
    let mut session = InferenceSession::new(ctx, prompt, config, block_size)?;
    while let Some(token) = session.next_token()? {
        if !on_token(&token) {
            debug!("caller ended generation after {} tokens", token.index + 1);
            session.cancel();
        }
    }
    session.finish()
}

/// Holds the slot for one run; if the run unwinds before reporting its
/// outcome, releases the model and marks the engine failed
struct RunGuard<'a, B: ForwardPass> {
    engine: &'a InferenceEngine<B>,
    slot: MutexGuard<'a, Slot<B::Handle>>,
    finished: bool,
}

impl<B: ForwardPass> Drop for RunGuard<'_, B> {
    fn drop(&mut self) {
        if !self.finished {
            warn!("generation panicked, releasing model");
            self.engine.release_handle(&mut self.slot);
            self.engine.set_state(GenerationState::Failed("generation panicked".to_string()));
        }
    }
}

impl<B: ForwardPass> Drop for InferenceEngine<B> {
    fn drop(&mut self) {
        if let Some(handle) = self.slot.get_mut().handle.take() {
            if let Err(e) = self.backend.close(handle) {
                warn!("failed to close model handle on drop: {}", e);
            }
        }
    }
}

impl<B: ForwardPass> fmt::Debug for InferenceEngine<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InferenceEngine")
            .field("backend", &self.backend.name())
            .field("config", &self.config)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::FinishReason;
    use crate::stopping::NeverStop;
    use nayan_core::{BackendError, LoadOptions, VOCAB_SIZE};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Default)]
    struct CountingBackend {
        runs: AtomicUsize,
        closes: Arc<AtomicUsize>,
        fail_close: bool,
    }

    impl ForwardPass for CountingBackend {
        type Handle = u32;

        fn load(
            &self,
            path: &Path,
            _options: &LoadOptions,
        ) -> std::result::Result<u32, BackendError> {
            if path.ends_with("missing.onnx") {
                Err(BackendError::new("file not found"))
            } else {
                Ok(1)
            }
        }

        fn run(
            &self,
            _handle: &mut u32,
            input_ids: &[i64],
        ) -> std::result::Result<Vec<f32>, BackendError> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            let mut scores = vec![0.0; input_ids.len() * VOCAB_SIZE];
            let last = scores.len() - VOCAB_SIZE;
            scores[last + 'z' as usize] = 1.0;
            Ok(scores)
        }

        fn close(&self, _handle: u32) -> std::result::Result<(), BackendError> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            if self.fail_close {
                return Err(BackendError::new("teardown"));
            }
            Ok(())
        }
    }

    fn engine() -> InferenceEngine<CountingBackend> {
        InferenceEngine::builder(CountingBackend::default())
            .stop_criterion(NeverStop)
            .seed(1)
            .build()
    }

    #[test]
    fn test_starts_idle() {
        let engine = engine();
        assert_eq!(engine.state(), GenerationState::Idle);
        assert!(!engine.is_ready());
    }

    #[test]
    fn test_load_then_generate() {
        let engine = engine();
        engine.load_model("model.onnx").unwrap();
        assert_eq!(engine.state(), GenerationState::Ready);

        let config = GenerationConfig { max_tokens: 3, top_k: 0, ..Default::default() };
        let result = engine.generate("q", config).unwrap();
        assert_eq!(result.text, "qzzz");
        assert_eq!(result.finish_reason, FinishReason::MaxTokens);
        assert_eq!(engine.state(), GenerationState::Ready);
    }

    #[test]
    fn test_generate_before_load() {
        let engine = engine();
        let result = engine.generate("q", GenerationConfig::default());
        assert!(matches!(result, Err(Error::ModelNotLoaded(_))));
        assert_eq!(engine.backend().runs.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_failed_load() {
        let engine = engine();
        let result = engine.load_model("/models/missing.onnx");
        assert!(matches!(result, Err(Error::ModelLoadFailure(_))));
        assert!(matches!(engine.state(), GenerationState::Failed(_)));

        let result = engine.generate("q", GenerationConfig::default());
        assert!(matches!(result, Err(Error::ModelNotLoaded(_))));
        assert_eq!(engine.backend().runs.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_reload_closes_previous_handle() {
        let engine = engine();
        engine.load_model("a.onnx").unwrap();
        engine.load_model("b.onnx").unwrap();
        assert_eq!(engine.backend().closes.load(Ordering::SeqCst), 1);
        assert!(engine.is_ready());
    }

    #[test]
    fn test_close_returns_to_idle() {
        let engine = engine();
        engine.load_model("model.onnx").unwrap();
        engine.close().unwrap();
        assert_eq!(engine.state(), GenerationState::Idle);
        assert_eq!(engine.backend().closes.load(Ordering::SeqCst), 1);
        assert!(matches!(
            engine.generate("q", GenerationConfig::default()),
            Err(Error::ModelNotLoaded(_))
        ));
    }

    #[test]
    fn test_stream_callback_can_cancel() {
        let engine = engine();
        engine.load_model("model.onnx").unwrap();

        let mut seen = Vec::new();
        let config = GenerationConfig { max_tokens: 10, top_k: 0, ..Default::default() };
        let result = engine
            .generate_stream("q", config, |token| {
                seen.push(token.index);
                token.index < 1
            })
            .unwrap();

        assert_eq!(seen, vec![0, 1]);
        assert_eq!(result.num_generated_tokens, 2);
        assert_eq!(result.finish_reason, FinishReason::Cancelled);
        assert!(engine.is_ready());
    }

    #[test]
    fn test_state_is_generating_inside_callback() {
        let engine = engine();
        engine.load_model("model.onnx").unwrap();

        let config = GenerationConfig { max_tokens: 1, top_k: 0, ..Default::default() };
        let mut observed = None;
        engine
            .generate_stream("q", config, |_| {
                observed = Some(engine.state());
                true
            })
            .unwrap();
        assert_eq!(observed, Some(GenerationState::Generating));
    }

    #[test]
    fn test_reentrant_generate_is_busy() {
        let engine = engine();
        engine.load_model("model.onnx").unwrap();

        let config = GenerationConfig { max_tokens: 1, top_k: 0, ..Default::default() };
        let mut nested = None;
        engine
            .generate_stream("q", config, |_| {
                nested = Some(engine.generate("again", config));
                true
            })
            .unwrap();
        assert!(matches!(nested, Some(Err(Error::Busy(_)))));
    }

    #[test]
    fn test_drop_closes_handle() {
        let closes = Arc::new(AtomicUsize::new(0));
        let backend = CountingBackend { closes: closes.clone(), ..Default::default() };
        let engine = InferenceEngine::new(backend);
        engine.load_model("model.onnx").unwrap();
        drop(engine);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_invalid_config_checked_first() {
        let engine = engine();
        let config = GenerationConfig { temperature: 0.0, ..Default::default() };
        assert!(matches!(engine.generate("q", config), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_close_teardown_failure_is_resource_error() {
        let backend = CountingBackend { fail_close: true, ..Default::default() };
        let engine = InferenceEngine::builder(backend).stop_criterion(NeverStop).build();
        engine.load_model("a.onnx").unwrap();

        // Reload proceeds even though the old handle failed to close
        engine.load_model("b.onnx").unwrap();
        assert!(engine.is_ready());
        assert_eq!(engine.backend().closes.load(Ordering::SeqCst), 1);

        assert!(matches!(engine.close(), Err(Error::ResourceError(_))));
        assert_eq!(engine.state(), GenerationState::Idle);
        assert_eq!(engine.backend().closes.load(Ordering::SeqCst), 2);
        assert!(matches!(
            engine.generate("q", GenerationConfig::default()),
            Err(Error::ModelNotLoaded(_))
        ));
    }

    #[test]
    fn test_panicking_callback_releases_model() {
        let engine = engine();
        engine.load_model("model.onnx").unwrap();

        let config = GenerationConfig { max_tokens: 3, top_k: 0, ..Default::default() };
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            engine.generate_stream("q", config, |_| panic!("callback failed"))
        }));

        assert!(outcome.is_err());
        assert_eq!(engine.state(), GenerationState::Failed("generation panicked".to_string()));
        assert_eq!(engine.backend().closes.load(Ordering::SeqCst), 1);
        assert!(matches!(engine.generate("q", config), Err(Error::ModelNotLoaded(_))));

        engine.load_model("model.onnx").unwrap();
        assert_eq!(engine.generate("q", config).unwrap().text, "qzzz");
    }

    #[test]
    fn test_lost_race_while_ready_is_busy() {
        let engine = engine();
        engine.load_model("model.onnx").unwrap();

        // Slot taken by a run that has not yet moved to Generating
        let held = engine.slot.lock();
        assert_eq!(engine.state(), GenerationState::Ready);
        let config = GenerationConfig { max_tokens: 1, top_k: 0, ..Default::default() };
        assert!(matches!(engine.generate("q", config), Err(Error::Busy(_))));
        drop(held);

        assert!(engine.generate("q", config).is_ok());
    }
}
