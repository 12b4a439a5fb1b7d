// Forward-pass contract for the external inference engine

use std::path::Path;
use thiserror::Error;

/// Error reported by a forward-pass engine.
///
/// The controller wraps it into the matching [`crate::Error`] kind depending
/// on which operation failed. Errors built with [`BackendError::resource`]
/// always map to [`crate::Error::ResourceError`].
#[derive(Error, Debug)]
#[error("{message}")]
pub struct BackendError {
    message: String,
    resource: bool,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl BackendError {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into(), resource: false, source: None }
    }

    pub fn with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self { message: message.into(), resource: false, source: Some(Box::new(source)) }
    }

    /// Allocation or teardown failure of a transient buffer
    pub fn resource(message: impl Into<String>) -> Self {
        Self { message: message.into(), resource: true, source: None }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_resource(&self) -> bool {
        self.resource
    }

    /// Map into the crate error for a failed forward pass
    pub fn into_run_error(self) -> crate::Error {
        if self.resource {
            crate::Error::ResourceError(self.to_string())
        } else {
            crate::Error::ForwardPassFailure(self.to_string())
        }
    }
}

/// Session options handed to the engine at load time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadOptions {
    /// Threads used to run independent graph nodes in parallel
    pub inter_op_threads: usize,
    /// Threads used inside a single operator
    pub intra_op_threads: usize,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self { inter_op_threads: 2, intra_op_threads: 4 }
    }
}

/// Forward-pass engine (load model, run batch, close)
///
/// `run` receives a `[1, len]` batch of token ids and returns a dense
/// `[1, len, VOCAB_SIZE]` score tensor flattened row-major.
pub trait ForwardPass: Send + Sync {
    /// Loaded-model handle, owned by whoever called `load`
    type Handle: Send;

    /// Load a converted model artifact
    fn load(&self, path: &Path, options: &LoadOptions) -> Result<Self::Handle, BackendError>;

    /// Run one forward pass over `input_ids`
    fn run(&self, handle: &mut Self::Handle, input_ids: &[i64]) -> Result<Vec<f32>, BackendError>;

    /// Release a handle
    fn close(&self, handle: Self::Handle) -> Result<(), BackendError>;

    /// Backend name for debugging
    fn name(&self) -> &'static str {
        "external"
    }
}
