//! Nayan generation runtime with stable ABI
//!
//! Drives an external forward pass to produce text one token at a time:
//! temperature and top-k sampling, stochastic sentence-end stopping, a
//! single-flight engine state machine, streaming callbacks, a tokio worker and
//! C exports for host integration.

mod abi;
mod config;
mod engine;
mod inference;
mod sampling;
mod stopping;
mod worker;

pub use abi::*;
pub use config::{GenerationConfig, RuntimeConfig};
pub use engine::{EngineBuilder, GenerationState, InferenceEngine};
pub use inference::{
    FinishReason, GenerateResult, GeneratedToken, InferenceSession, SessionState, StepContext,
};
pub use sampling::{choose, Candidate, Sampler, Sampling};
pub use stopping::{NeverStop, SentenceEndStop, StopCriterion};
pub use worker::{spawn_generation, GenerationTask};

pub use nayan_core::{
    BackendError, CharTokenizer, ContextWindow, Error, ForwardPass, LoadOptions, Result, TokenId,
    Tokenizer, BLOCK_SIZE, VOCAB_SIZE,
};

/// Runtime version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Error codes for C ABI
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Ok = 0,
    GenericFailure = 1,
    ModelNotLoaded = 2,
    ModelLoadFailure = 3,
    InvalidConfig = 4,
    ForwardPassFailure = 5,
    ResourceError = 6,
    Busy = 7,
    InvalidArgument = 8,
    IoError = 9,
}

impl From<&Error> for ErrorCode {
    fn from(e: &Error) -> Self {
        match e {
            Error::ModelNotLoaded(_) => ErrorCode::ModelNotLoaded,
            Error::ModelLoadFailure(_) => ErrorCode::ModelLoadFailure,
            Error::InvalidConfig(_) | Error::ParseError(_) => ErrorCode::InvalidConfig,
            Error::ForwardPassFailure(_) => ErrorCode::ForwardPassFailure,
            Error::ResourceError(_) => ErrorCode::ResourceError,
            Error::Busy(_) => ErrorCode::Busy,
            Error::EmptyPrompt => ErrorCode::InvalidArgument,
            Error::Io(_) => ErrorCode::IoError,
        }
    }
}

/// Thread-local error message storage for C ABI
use std::cell::RefCell;

thread_local! {
    static LAST_ERROR: RefCell<Option<String>> = const { RefCell::new(None) };
}

pub(crate) fn set_last_error(msg: String) {
    LAST_ERROR.with(|e| *e.borrow_mut() = Some(msg));
}

pub(crate) fn take_last_error() -> Option<String> {
    LAST_ERROR.with(|e| e.borrow_mut().take())
}
