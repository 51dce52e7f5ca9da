//! Backend-agnostic command recording
//!
//! Passes record into a [`CommandList`] on worker threads. The lists are
//! concatenated in graph order and handed to the backend in one submission.

use crate::backend::traits::*;
use crate::backend::types::*;

/// Color attachment of a render pass
#[derive(Debug, Clone, PartialEq)]
pub struct ColorAttachment {
    pub texture: TextureHandle,
    pub load: LoadOp,
    pub store: StoreOp,
}

impl ColorAttachment {
    pub fn clear(texture: TextureHandle, color: [f32; 4]) -> Self {
        Self {
            texture,
            load: LoadOp::Clear(color),
            store: StoreOp::Store,
        }
    }

    pub fn load(texture: TextureHandle) -> Self {
        Self {
            texture,
            load: LoadOp::Load,
            store: StoreOp::Store,
        }
    }
}

/// Depth load operation
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DepthLoadOp {
    Clear(f32),
    Load,
}

/// Depth-stencil attachment of a render pass
#[derive(Debug, Clone, PartialEq)]
pub struct DepthAttachment {
    pub texture: TextureHandle,
    pub load: DepthLoadOp,
    pub store: StoreOp,
    /// Attached for testing only, never written
    pub read_only: bool,
}

/// A single recorded GPU operation
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    BeginRenderPass {
        label: String,
        color: Vec<ColorAttachment>,
        depth: Option<DepthAttachment>,
    },
    EndRenderPass,
    SetViewport(Viewport),
    BindProgram(ProgramHandle),
    BindTexture {
        binding: u32,
        texture: TextureHandle,
        sampler: SamplerKind,
    },
    BindUniforms {
        binding: u32,
        range: BufferRange,
    },
    BindStorage {
        binding: u32,
        range: BufferRange,
    },
    SetBlendFactors {
        attachment: u32,
        factors: BlendFactors,
    },
    SetDepthState(DepthState),
    DrawIndexed {
        vertex_buffer: BufferHandle,
        index_buffer: BufferHandle,
        index_count: u32,
        instance_count: u32,
    },
    DrawFullscreenQuad,
    Dispatch {
        x: u32,
        y: u32,
        z: u32,
    },
}

/// Ordered list of commands recorded by one pass (or one chunk of a pass)
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandList {
    commands: Vec<Command>,
}

impl CommandList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, command: Command) {
        self.commands.push(command);
    }

    pub fn begin_render_pass(
        &mut self,
        label: &str,
        color: Vec<ColorAttachment>,
        depth: Option<DepthAttachment>,
    ) {
        self.push(Command::BeginRenderPass {
            label: label.to_string(),
            color,
            depth,
        });
    }

    pub fn end_render_pass(&mut self) {
        self.push(Command::EndRenderPass);
    }

    pub fn set_viewport(&mut self, viewport: Viewport) {
        self.push(Command::SetViewport(viewport));
    }

    pub fn bind_program(&mut self, program: ProgramHandle) {
        self.push(Command::BindProgram(program));
    }

    pub fn bind_texture(&mut self, binding: u32, texture: TextureHandle, sampler: SamplerKind) {
        self.push(Command::BindTexture {
            binding,
            texture,
            sampler,
        });
    }

    pub fn bind_uniforms(&mut self, binding: u32, range: BufferRange) {
        self.push(Command::BindUniforms { binding, range });
    }

    pub fn bind_storage(&mut self, binding: u32, range: BufferRange) {
        self.push(Command::BindStorage { binding, range });
    }

    pub fn set_blend_factors(&mut self, attachment: u32, factors: BlendFactors) {
        self.push(Command::SetBlendFactors {
            attachment,
            factors,
        });
    }

    pub fn set_depth_state(&mut self, state: DepthState) {
        self.push(Command::SetDepthState(state));
    }

    pub fn draw_indexed(
        &mut self,
        vertex_buffer: BufferHandle,
        index_buffer: BufferHandle,
        index_count: u32,
        instance_count: u32,
    ) {
        self.push(Command::DrawIndexed {
            vertex_buffer,
            index_buffer,
            index_count,
            instance_count,
        });
    }

    pub fn draw_fullscreen_quad(&mut self) {
        self.push(Command::DrawFullscreenQuad);
    }

    pub fn dispatch(&mut self, x: u32, y: u32, z: u32) {
        self.push(Command::Dispatch { x, y, z });
    }

    /// Record `f` with the given blend factors on `attachment`, then restore the opaque default.
    ///
    /// The restore is recorded even when `f` fails, so the list never leaks blending
    /// state into later passes.
    pub fn with_blend_factors<R>(
        &mut self,
        attachment: u32,
        factors: BlendFactors,
        f: impl FnOnce(&mut Self) -> R,
    ) -> R {
        self.set_blend_factors(attachment, factors);
        let result = f(self);
        self.set_blend_factors(attachment, BlendFactors::OPAQUE);
        result
    }

    /// Append every command of `other`
    pub fn append(&mut self, other: CommandList) {
        self.commands.extend(other.commands);
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Textures attached or bound anywhere in the list
    pub fn referenced_textures(&self) -> impl Iterator<Item = TextureHandle> + '_ {
        self.commands.iter().flat_map(|command| {
            let textures: Vec<TextureHandle> = match command {
                Command::BeginRenderPass { color, depth, .. } => color
                    .iter()
                    .map(|a| a.texture)
                    .chain(depth.iter().map(|d| d.texture))
                    .collect(),
                Command::BindTexture { texture, .. } => vec![*texture],
                _ => Vec::new(),
            };
            textures
        })
    }

    pub fn draw_count(&self) -> usize {
        self.commands
            .iter()
            .filter(|c| {
                matches!(
                    c,
                    Command::DrawIndexed { .. } | Command::DrawFullscreenQuad
                )
            })
            .count()
    }
}
