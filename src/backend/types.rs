//! Common types shared between the renderer and backends

use bitflags::bitflags;

/// Pixel formats of render targets, the atlas and probe textures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum TextureFormat {
    Rgba8Unorm,
    Rgba8UnormSrgb,
    Bgra8Unorm,
    Rgba16Float,
    Rgba32Float,
    Rg16Float,
    R32Float,
    Depth32Float,
    Depth24PlusStencil8,
}

impl TextureFormat {
    pub fn is_depth(&self) -> bool {
        matches!(
            self,
            TextureFormat::Depth32Float | TextureFormat::Depth24PlusStencil8
        )
    }

    pub fn has_stencil(&self) -> bool {
        matches!(self, TextureFormat::Depth24PlusStencil8)
    }

    pub fn bytes_per_pixel(&self) -> u32 {
        match self {
            TextureFormat::Rgba8Unorm
            | TextureFormat::Rgba8UnormSrgb
            | TextureFormat::Bgra8Unorm
            | TextureFormat::Rg16Float
            | TextureFormat::R32Float
            | TextureFormat::Depth32Float
            | TextureFormat::Depth24PlusStencil8 => 4,
            TextureFormat::Rgba16Float => 8,
            TextureFormat::Rgba32Float => 16,
        }
    }
}

bitflags! {
    /// How a texture may be used by the GPU
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct TextureUsage: u32 {
        const COPY_SRC = 1 << 0;
        const COPY_DST = 1 << 1;
        const SAMPLED = 1 << 2;
        const STORAGE = 1 << 3;
        const RENDER_ATTACHMENT = 1 << 4;
    }
}

bitflags! {
    /// How a buffer may be used by the GPU
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BufferUsage: u32 {
        const COPY_DST = 1 << 0;
        const INDEX = 1 << 1;
        const VERTEX = 1 << 2;
        const UNIFORM = 1 << 3;
        const STORAGE = 1 << 4;
    }
}

bitflags! {
    /// GPU pipeline stages, used to scope synchronization barriers
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PipelineStages: u32 {
        const VERTEX_SHADER = 1 << 0;
        const FRAGMENT_SHADER = 1 << 1;
        const EARLY_FRAGMENT_TESTS = 1 << 2;
        const LATE_FRAGMENT_TESTS = 1 << 3;
        const COLOR_ATTACHMENT_OUTPUT = 1 << 4;
        const COMPUTE_SHADER = 1 << 5;
        const TRANSFER = 1 << 6;
        const PRESENT = 1 << 7;
    }
}

/// Texture descriptor passed to the backend
#[derive(Debug, Clone, PartialEq)]
pub struct TextureDescriptor {
    pub label: String,
    pub width: u32,
    pub height: u32,
    pub mip_levels: u32,
    pub sample_count: u32,
    pub format: TextureFormat,
    pub usage: TextureUsage,
}

impl Default for TextureDescriptor {
    fn default() -> Self {
        Self {
            label: String::new(),
            width: 1,
            height: 1,
            mip_levels: 1,
            sample_count: 1,
            format: TextureFormat::Rgba8Unorm,
            usage: TextureUsage::SAMPLED | TextureUsage::COPY_DST,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BufferDescriptor {
    pub label: String,
    pub size: u64,
    pub usage: BufferUsage,
}

/// Depth test
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompareFunction {
    Never,
    Less,
    Equal,
    LessEqual,
    Greater,
    NotEqual,
    GreaterEqual,
    Always,
}

/// Depth test configuration used while drawing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DepthState {
    pub compare: CompareFunction,
    pub write_enabled: bool,
}

impl DepthState {
    /// Regular depth test with writes
    pub const LESS_WRITE: Self = Self {
        compare: CompareFunction::Less,
        write_enabled: true,
    };

    /// Second pass after a depth prepass: only the visible surface passes
    pub const EQUAL_NO_WRITE: Self = Self {
        compare: CompareFunction::Equal,
        write_enabled: false,
    };

    /// Test without writing, used by transparent geometry
    pub const LESS_NO_WRITE: Self = Self {
        compare: CompareFunction::Less,
        write_enabled: false,
    };

    pub const DISABLED: Self = Self {
        compare: CompareFunction::Always,
        write_enabled: false,
    };
}

impl Default for DepthState {
    fn default() -> Self {
        Self::LESS_WRITE
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlendFactor {
    Zero,
    One,
    Src,
    OneMinusSrc,
    SrcAlpha,
    OneMinusSrcAlpha,
    Dst,
    OneMinusDst,
    DstAlpha,
    OneMinusDstAlpha,
}

/// Source and destination factors for one color attachment.
///
/// The alpha channel has its own pair so a blend can composite color while
/// multiplying coverage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlendFactors {
    pub src: BlendFactor,
    pub dst: BlendFactor,
    pub src_alpha: BlendFactor,
    pub dst_alpha: BlendFactor,
}

impl BlendFactors {
    /// Replace the destination with the source
    pub const OPAQUE: Self = Self::uniform(BlendFactor::One, BlendFactor::Zero);

    /// Premultiplied "under" compositing: color is `src + dst * src.a`, the
    /// alpha channel keeps the product of the transmittances.
    pub const COMPOSITE: Self = Self {
        src: BlendFactor::One,
        dst: BlendFactor::SrcAlpha,
        src_alpha: BlendFactor::Zero,
        dst_alpha: BlendFactor::SrcAlpha,
    };

    pub const ADDITIVE: Self = Self::uniform(BlendFactor::One, BlendFactor::One);

    /// Same factors for color and alpha
    pub const fn uniform(src: BlendFactor, dst: BlendFactor) -> Self {
        Self {
            src,
            dst,
            src_alpha: src,
            dst_alpha: dst,
        }
    }

    pub fn is_opaque(&self) -> bool {
        *self == Self::OPAQUE
    }
}

impl Default for BlendFactors {
    fn default() -> Self {
        Self::OPAQUE
    }
}

/// Attachment load operation
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LoadOp {
    Clear([f32; 4]),
    Load,
    DontCare,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOp {
    Store,
    Discard,
}

/// Sampler used when binding a texture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SamplerKind {
    NearestClamp,
    LinearClamp,
    LinearRepeat,
    /// Depth comparison sampler for shadow lookups
    ShadowCompare,
}

/// Viewport rectangle in pixels
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl Viewport {
    pub fn full(width: u32, height: u32) -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            width: width as f32,
            height: height as f32,
        }
    }
}

/// Shader stage of an entry point
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShaderStage {
    Vertex,
    Fragment,
    Compute,
}
