//! Backend abstraction layer
//!
//! Provides the capability interface the renderer drives, the command stream
//! it records, and a headless recording implementation.

pub mod command;
pub mod recording;
pub mod traits;
pub mod types;

pub use command::*;
pub use recording::{PassStateSnapshot, PipelineStateTracker, RecordingBackend};
pub use traits::*;
pub use types::*;
