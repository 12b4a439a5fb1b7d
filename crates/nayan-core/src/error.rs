use thiserror::Error;

/// Core error types for nayan
#[derive(Error, Debug)]
pub enum Error {
    #[error("Model not loaded: {0}")]
    ModelNotLoaded(String),

    #[error("Model load failed: {0}")]
    ModelLoadFailure(String),

    #[error("Invalid generation config: {0}")]
    InvalidConfig(String),

    #[error("Forward pass failed: {0}")]
    ForwardPassFailure(String),

    #[error("Resource error: {0}")]
    ResourceError(String),

    #[error("Engine busy: {0}")]
    Busy(String),

    #[error("Prompt encodes to zero tokens")]
    EmptyPrompt,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    ParseError(String),
}

impl Error {
    /// Whether the engine can stay loaded after a `generate` call failed
    /// with this error.
    ///
    /// A forward-pass failure leaves the handle in an unknown state and forces
    /// a reload; everything else (bad input, per-step allocation) does not.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Error::ForwardPassFailure(_) | Error::ModelLoadFailure(_))
    }
}

impl From<std::collections::TryReserveError> for Error {
    fn from(e: std::collections::TryReserveError) -> Self {
        Error::ResourceError(format!("failed to reserve step buffer: {}", e))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
