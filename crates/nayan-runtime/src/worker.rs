//! Background generation on tokio's blocking pool

use std::sync::Arc;

use log::debug;
use nayan_core::error::{Error, Result};
use nayan_core::ForwardPass;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::GenerationConfig;
use crate::engine::InferenceEngine;
use crate::inference::{GenerateResult, GeneratedToken};

/// Handle to a generation running off the caller's thread
pub struct GenerationTask {
    /// Accepted tokens in generation order; closes when the run ends
    pub tokens: mpsc::UnboundedReceiver<GeneratedToken>,
    result: JoinHandle<Result<GenerateResult>>,
}

impl GenerationTask {
    /// Wait for the final result
    pub async fn join(self) -> Result<GenerateResult> {
        self.result
            .await
            .map_err(|e| Error::ResourceError(format!("generation worker failed: {}", e)))?
    }

    pub fn is_finished(&self) -> bool {
        self.result.is_finished()
    }
}

/// Run `engine.generate_stream` on the blocking pool.
///
/// Tokens keep flowing into `tokens` as they are accepted. Dropping the
/// receiver does not stop the run; the final result is still available
/// through [`GenerationTask::join`].
pub fn spawn_generation<B>(
    engine: Arc<InferenceEngine<B>>,
    prompt: impl Into<String>,
    config: GenerationConfig,
) -> GenerationTask
where
    B: ForwardPass + 'static,
{
    let prompt = prompt.into();
    let (sender, tokens) = mpsc::unbounded_channel();

    let result = tokio::task::spawn_blocking(move || {
        engine.generate_stream(&prompt, config, |token| {
            if sender.send(token.clone()).is_err() {
                debug!("token receiver dropped, run continues");
            }
            true
        })
    });

    GenerationTask { tokens, result }
}
