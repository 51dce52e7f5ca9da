//! Error types for frame construction and execution

use crate::backend::BackendError;
use thiserror::Error;

/// Configuration errors of a single render graph
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("Cycle between passes: {}", .passes.join(" -> "))]
    Cycle { passes: Vec<String> },
    #[error("Pass '{pass}' reads '{resource}' which is neither written by any pass nor imported")]
    UndefinedRead { pass: String, resource: String },
    #[error("Render target '{resource}' has an invalid description: {reason}")]
    InvalidDescription { resource: String, reason: String },
    #[error("Pass '{pass}' references unknown resource #{index}")]
    UnknownResource { pass: String, index: u32 },
    #[error("Pass '{pass}' uses '{resource}' without declaring it")]
    UndeclaredAccess { pass: String, resource: String },
}

/// Broad classes of failure, used by the frame loop to pick a recovery strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Bad graph or configuration: skip the frame
    Configuration,
    /// Out of pooled memory or ring space: skip the frame
    ResourceExhaustion,
    /// A shader failed to compile: fatal for the material at load time
    ShaderCompilation,
    /// Lost device or GPU out-of-memory: reinitialize the pipeline
    Gpu,
}

/// Any failure while building, recording or submitting a frame
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RenderError {
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error("Pass '{pass}' could not allocate '{resource}': {source}")]
    ResourceExhausted {
        pass: String,
        resource: String,
        #[source]
        source: BackendError,
    },
    #[error("Pass '{pass}' requested {requested} uniform bytes but only {available} remain")]
    UniformRingExhausted {
        pass: String,
        requested: u64,
        available: u64,
    },
    #[error("Shader '{source_id}' failed to compile: {message}")]
    ShaderCompilation { source_id: String, message: String },
    #[error("GPU error: {0}")]
    Gpu(#[from] BackendError),
    #[error("Pass '{pass}' failed while recording: {message}")]
    Recording { pass: String, message: String },
    #[error("Invalid renderer configuration '{field}': {reason}")]
    InvalidConfig { field: &'static str, reason: String },
}

impl RenderError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            RenderError::Graph(_)
            | RenderError::Recording { .. }
            | RenderError::InvalidConfig { .. } => ErrorCategory::Configuration,
            RenderError::ResourceExhausted { source, .. } => {
                if *source == BackendError::DeviceLost {
                    ErrorCategory::Gpu
                } else {
                    ErrorCategory::ResourceExhaustion
                }
            }
            RenderError::UniformRingExhausted { .. } => ErrorCategory::ResourceExhaustion,
            RenderError::ShaderCompilation { .. } => ErrorCategory::ShaderCompilation,
            RenderError::Gpu(_) => ErrorCategory::Gpu,
        }
    }
}

pub type Result<T> = std::result::Result<T, RenderError>;
