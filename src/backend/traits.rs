//! Core backend abstraction traits
//!
//! The renderer never talks to a graphics API directly. It creates resources
//! through [`GraphicsBackend`] and hands over a fully recorded [`Submission`]
//! once per frame.

use crate::backend::command::CommandList;
use crate::backend::types::*;
use crate::render_graph::Hazard;
use crate::resources::CompiledShader;
use thiserror::Error;

/// Backend error type
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("Out of memory")]
    OutOfMemory,
    #[error("Device lost")]
    DeviceLost,
    #[error("Failed to create resource: {0}")]
    ResourceCreationFailed(String),
    #[error("Invalid handle: {0}")]
    InvalidHandle(String),
    #[error("Submission failed: {0}")]
    SubmissionFailed(String),
}

impl BackendError {
    /// Errors after which every handle from this backend must be recreated
    pub fn requires_reinitialization(&self) -> bool {
        matches!(self, BackendError::DeviceLost | BackendError::OutOfMemory)
    }
}

pub type BackendResult<T> = Result<T, BackendError>;

/// Handle to a GPU buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferHandle(pub(crate) u64);

/// Handle to a GPU texture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TextureHandle(pub(crate) u64);

/// Handle to a linked shader program
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProgramHandle(pub(crate) u64);

impl TextureHandle {
    /// Raw identifier, for logging and tooling
    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// A sub-range of a GPU buffer bound as uniform or storage data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferRange {
    pub buffer: BufferHandle,
    pub offset: u64,
    pub size: u64,
}

/// A barrier resolved against the physical texture it protects
#[derive(Debug, Clone, PartialEq)]
pub struct PhysicalBarrier {
    pub texture: TextureHandle,
    /// Name of the virtual resource, for diagnostics
    pub resource: String,
    pub hazard: Hazard,
    pub src_stages: PipelineStages,
    pub dst_stages: PipelineStages,
}

/// One pass worth of work inside a submission
#[derive(Debug, Clone)]
pub struct SubmittedPass {
    pub name: String,
    /// Barriers that must complete before any command of this pass
    pub barriers: Vec<PhysicalBarrier>,
    pub commands: CommandList,
}

/// Staged uniform data copied into the ring buffer before the passes run
#[derive(Debug, Clone)]
pub struct UniformUpload {
    pub buffer: BufferHandle,
    pub offset: u64,
    pub data: Vec<u8>,
}

/// Everything the GPU executes for one frame, in submission order
#[derive(Debug, Clone)]
pub struct Submission {
    pub frame_index: u64,
    pub uniform_upload: Option<UniformUpload>,
    pub passes: Vec<SubmittedPass>,
    pub present: Option<TextureHandle>,
}

impl Submission {
    pub fn new(frame_index: u64) -> Self {
        Self {
            frame_index,
            uniform_upload: None,
            passes: Vec::new(),
            present: None,
        }
    }

    pub fn pass_names(&self) -> impl Iterator<Item = &str> {
        self.passes.iter().map(|p| p.name.as_str())
    }

    pub fn barrier_count(&self) -> usize {
        self.passes.iter().map(|p| p.barriers.len()).sum()
    }
}

/// Capability interface the renderer consumes from the graphics API layer
pub trait GraphicsBackend {
    /// Human readable backend name
    fn name(&self) -> &str;

    // Resource creation

    /// Create a texture
    fn create_texture(&mut self, desc: &TextureDescriptor) -> BackendResult<TextureHandle>;

    /// Destroy a texture
    fn destroy_texture(&mut self, texture: TextureHandle);

    /// Create a buffer
    fn create_buffer(&mut self, desc: &BufferDescriptor) -> BackendResult<BufferHandle>;

    /// Destroy a buffer
    fn destroy_buffer(&mut self, buffer: BufferHandle);

    /// Write data to a buffer outside of a submission
    fn write_buffer(&mut self, buffer: BufferHandle, offset: u64, data: &[u8])
        -> BackendResult<()>;

    /// Create a program from a validated shader variant
    fn create_program(&mut self, shader: &CompiledShader) -> BackendResult<ProgramHandle>;

    /// Destroy a program
    fn destroy_program(&mut self, program: ProgramHandle);

    // Execution

    /// Execute one frame. Either every pass is queued or none is.
    fn submit(&mut self, submission: Submission) -> BackendResult<()>;

    /// Whether the GPU finished the work submitted for `frame_index`
    fn is_frame_complete(&self, frame_index: u64) -> bool;

    /// Block until the GPU finished the work submitted for `frame_index`
    fn wait_for_frame(&mut self, frame_index: u64) -> BackendResult<()>;

    /// Recreate the device after a loss. All previously created handles are invalid afterwards.
    fn recreate_device(&mut self) -> BackendResult<()>;
}
