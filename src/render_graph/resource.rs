//! Virtual resources for the render graph

use crate::backend::types::*;
use crate::backend::TextureHandle;
use crate::error::GraphError;

/// Reference into a graph's virtual resource table.
///
/// Not a live buffer: the executor binds it to a physical texture only while
/// the frame is being recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RenderTargetHandle(pub(crate) u32);

impl RenderTargetHandle {
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

/// Describes texture dimensions that can be relative to screen size
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TextureSize {
    /// Absolute size in pixels
    Absolute { width: u32, height: u32 },
    /// Screen size divided by an integer fraction (1 = full screen)
    Fraction(u32),
}

impl Default for TextureSize {
    fn default() -> Self {
        TextureSize::Fraction(1)
    }
}

impl TextureSize {
    pub fn resolve(&self, screen_width: u32, screen_height: u32) -> (u32, u32) {
        match *self {
            TextureSize::Absolute { width, height } => (width, height),
            TextureSize::Fraction(fraction) => {
                let fraction = fraction.max(1);
                (
                    (screen_width / fraction).max(1),
                    (screen_height / fraction).max(1),
                )
            }
        }
    }
}

/// Content-addressed description of a 2D render target.
///
/// Two identical descriptions may share pooled storage across passes and frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RenderTargetDescription {
    pub width: u32,
    pub height: u32,
    pub format: TextureFormat,
    pub sample_count: u32,
    pub mip_levels: u32,
    pub usage: TextureUsage,
}

impl RenderTargetDescription {
    /// Single-sampled attachment that later passes can sample
    pub fn new(width: u32, height: u32, format: TextureFormat) -> Self {
        Self {
            width,
            height,
            format,
            sample_count: 1,
            mip_levels: 1,
            usage: TextureUsage::RENDER_ATTACHMENT | TextureUsage::SAMPLED,
        }
    }

    pub fn sized(size: TextureSize, screen: (u32, u32), format: TextureFormat) -> Self {
        let (width, height) = size.resolve(screen.0, screen.1);
        Self::new(width, height, format)
    }

    pub fn with_usage(mut self, usage: TextureUsage) -> Self {
        self.usage = usage;
        self
    }

    pub fn with_mip_levels(mut self, mip_levels: u32) -> Self {
        self.mip_levels = mip_levels;
        self
    }

    pub fn with_sample_count(mut self, sample_count: u32) -> Self {
        self.sample_count = sample_count;
        self
    }

    /// Number of mips in a full chain for this size
    pub fn full_mip_chain(&self) -> u32 {
        32 - self.width.max(self.height).max(1).leading_zeros()
    }

    /// Reject descriptions no backend could allocate.
    pub fn validate(&self, name: &str) -> Result<(), GraphError> {
        let invalid = |reason: String| GraphError::InvalidDescription {
            resource: name.to_string(),
            reason,
        };

        if self.width == 0 || self.height == 0 {
            return Err(invalid(format!(
                "zero extent {}x{}",
                self.width, self.height
            )));
        }
        if self.sample_count == 0 || !self.sample_count.is_power_of_two() || self.sample_count > 16 {
            return Err(invalid(format!(
                "sample count {} must be a power of two between 1 and 16",
                self.sample_count
            )));
        }
        if self.mip_levels == 0 || self.mip_levels > self.full_mip_chain() {
            return Err(invalid(format!(
                "{} mip levels requested, {}x{} supports at most {}",
                self.mip_levels,
                self.width,
                self.height,
                self.full_mip_chain()
            )));
        }
        if self.sample_count > 1 && self.mip_levels > 1 {
            return Err(invalid("multisampled targets cannot have mips".to_string()));
        }
        if self.usage.is_empty() {
            return Err(invalid("no usage flags".to_string()));
        }
        if self.format.is_depth() && self.usage.contains(TextureUsage::STORAGE) {
            return Err(invalid(format!(
                "{:?} cannot be used as a storage image",
                self.format
            )));
        }
        Ok(())
    }

    pub fn texture_descriptor(&self, label: &str) -> TextureDescriptor {
        TextureDescriptor {
            label: label.to_string(),
            width: self.width,
            height: self.height,
            mip_levels: self.mip_levels,
            sample_count: self.sample_count,
            format: self.format,
            usage: self.usage,
        }
    }
}

/// Access mode of a dependency declaration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Access {
    Read,
    Write,
}

/// Pipeline stage at which a pass touches a resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineStage {
    VertexShader,
    FragmentShader,
    EarlyFragmentTests,
    LateFragmentTests,
    ColorAttachmentOutput,
    ComputeShader,
    Transfer,
    Present,
}

impl PipelineStage {
    pub fn flags(self) -> PipelineStages {
        match self {
            PipelineStage::VertexShader => PipelineStages::VERTEX_SHADER,
            PipelineStage::FragmentShader => PipelineStages::FRAGMENT_SHADER,
            PipelineStage::EarlyFragmentTests => PipelineStages::EARLY_FRAGMENT_TESTS,
            PipelineStage::LateFragmentTests => PipelineStages::LATE_FRAGMENT_TESTS,
            PipelineStage::ColorAttachmentOutput => PipelineStages::COLOR_ATTACHMENT_OUTPUT,
            PipelineStage::ComputeShader => PipelineStages::COMPUTE_SHADER,
            PipelineStage::Transfer => PipelineStages::TRANSFER,
            PipelineStage::Present => PipelineStages::PRESENT,
        }
    }
}

/// One `(resource, access, stage)` declaration of a pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceDependency {
    pub target: RenderTargetHandle,
    pub access: Access,
    pub stage: PipelineStage,
}

/// All declarations of one pass on one resource, merged
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceUse {
    pub target: RenderTargetHandle,
    pub read_stages: PipelineStages,
    pub write_stages: PipelineStages,
}

impl ResourceUse {
    pub fn is_read(&self) -> bool {
        !self.read_stages.is_empty()
    }

    pub fn is_write(&self) -> bool {
        !self.write_stages.is_empty()
    }

    /// Read-modify-write within one pass
    pub fn is_read_write(&self) -> bool {
        self.is_read() && self.is_write()
    }

    pub fn stages(&self) -> PipelineStages {
        self.read_stages | self.write_stages
    }
}

/// Kind of conflicting access a barrier resolves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Hazard {
    ReadAfterWrite,
    WriteAfterWrite,
    WriteAfterRead,
}

/// Synchronization required before a pass touches a resource
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Barrier {
    pub target: RenderTargetHandle,
    pub hazard: Hazard,
    pub src_stages: PipelineStages,
    pub dst_stages: PipelineStages,
}

/// State an imported resource is in when the frame starts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExternalState {
    pub access: Access,
    pub stage: PipelineStage,
}

/// Where a virtual resource's storage comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    /// Acquired from the render target pool for this frame only
    Transient,
    /// Owned outside the graph (probe textures, persistent targets)
    Imported {
        texture: TextureHandle,
        initial: Option<ExternalState>,
    },
}

/// Virtual resource in the render graph
#[derive(Debug, Clone)]
pub struct VirtualResource {
    pub name: String,
    pub description: RenderTargetDescription,
    pub kind: ResourceKind,
    /// Kept alive until the end of the frame even after its last use
    pub exported: bool,
}

impl VirtualResource {
    pub fn is_transient(&self) -> bool {
        matches!(self.kind, ResourceKind::Transient)
    }
}

/// First and last position in the execution order that touch a resource
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceLifetime {
    pub first_use: usize,
    pub last_use: usize,
}
