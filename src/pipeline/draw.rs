//! Draw lists shared by the geometry passes

use bytemuck::{Pod, Zeroable};
use glam::Mat4;

use super::shaders::{ALBEDO_BINDING, DRAW_BINDING};
use crate::backend::{BufferHandle, ProgramHandle, SamplerKind, TextureHandle};
use crate::error::Result;
use crate::render_graph::PassRecordContext;
use crate::resources::{Material, MaterialPass, MaterialUniform};
use crate::scene::{BoundingSphere, Renderable};

/// Per-draw uniform block
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct DrawUniform {
    pub model: Mat4,
    pub normal_matrix: Mat4,
    pub material: MaterialUniform,
}

/// One renderable resolved against its material for a specific pass
#[derive(Debug, Clone, Copy)]
pub struct DrawItem {
    pub program: ProgramHandle,
    pub vertex_buffer: BufferHandle,
    pub index_buffer: BufferHandle,
    pub index_count: u32,
    pub uniform: DrawUniform,
    pub albedo: Option<TextureHandle>,
    pub bounds: BoundingSphere,
}

impl DrawItem {
    /// `None` when the material has no variant for `pass`
    pub fn new(renderable: &Renderable, material: &Material, pass: MaterialPass) -> Option<Self> {
        let variant = material.variant(pass)?;
        Some(Self {
            program: variant.program(),
            vertex_buffer: renderable.mesh.vertex_buffer,
            index_buffer: renderable.mesh.index_buffer,
            index_count: renderable.mesh.index_count,
            uniform: DrawUniform {
                model: renderable.transform,
                normal_matrix: renderable.normal_matrix(),
                material: *material.uniform(),
            },
            albedo: material.descriptor().albedo_texture,
            bounds: renderable.world_bounds(),
        })
    }
}

/// Number of recording chunks for `draws` items, never zero
pub fn chunks_for(draws: usize, draws_per_chunk: u32) -> u32 {
    (draws.div_ceil(draws_per_chunk.max(1) as usize)).max(1) as u32
}

/// Record `draws` with one uniform block each, rebinding the program only when it changes
pub fn record_draws<'a>(
    ctx: &mut PassRecordContext,
    draws: impl IntoIterator<Item = &'a DrawItem>,
) -> Result<usize> {
    let mut bound = None;
    let mut count = 0;
    for draw in draws {
        if bound != Some(draw.program) {
            ctx.commands().bind_program(draw.program);
            bound = Some(draw.program);
        }
        let token = ctx.push_uniforms(&draw.uniform)?;
        ctx.bind_uniforms(DRAW_BINDING, &token)?;
        if let Some(albedo) = draw.albedo {
            ctx.commands()
                .bind_texture(ALBEDO_BINDING, albedo, SamplerKind::LinearRepeat);
        }
        ctx.commands()
            .draw_indexed(draw.vertex_buffer, draw.index_buffer, draw.index_count, 1);
        count += 1;
    }
    Ok(count)
}
