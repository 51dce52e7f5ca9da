//! Shared helpers for the integration tests.
//!
//! Everything runs on [`RecordingBackend`], so the tests need no GPU.

#![allow(dead_code)]

use deferred_renderer::backend::{
    BufferDescriptor, BufferUsage, ColorAttachment, GraphicsBackend, RecordingBackend,
    TextureFormat,
};
use deferred_renderer::render_graph::{
    PassRecordContext, PassSetupContext, PipelineStage, RenderPass, RenderTargetDescription,
    RenderTargetHandle,
};
use deferred_renderer::resources::MaterialId;
use deferred_renderer::scene::{BoundingSphere, Camera, Mesh, Projection, Renderable};
use deferred_renderer::{RendererConfig, Result};
use glam::{Mat4, Vec3};

/// Route `log` output through the test harness
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Small frame with a small atlas, so tests stay fast
pub fn test_config() -> RendererConfig {
    RendererConfig::default()
        .with_resolution(96, 48)
        .with_cluster_counts([8, 4, 12])
        .with_shadow_atlas(1024, 4)
        .with_uniform_ring_size(512 * 1024)
        .with_worker_threads(2)
        .with_draws_per_chunk(4)
}

pub fn test_camera() -> Camera {
    Camera::new(
        Vec3::new(0.0, 4.0, 10.0),
        Vec3::ZERO,
        Projection::perspective(60.0, 2.0, 0.1, 100.0),
    )
}

/// Unit cube geometry with buffers created on `backend`
pub fn cube_mesh(backend: &mut RecordingBackend) -> Mesh {
    let vertex_buffer = backend
        .create_buffer(&BufferDescriptor {
            label: "cube_vertices".to_string(),
            size: 24 * 32,
            usage: BufferUsage::VERTEX,
        })
        .unwrap();
    let index_buffer = backend
        .create_buffer(&BufferDescriptor {
            label: "cube_indices".to_string(),
            size: 36 * 4,
            usage: BufferUsage::INDEX,
        })
        .unwrap();
    Mesh {
        vertex_buffer,
        index_buffer,
        index_count: 36,
        bounds: BoundingSphere::new(Vec3::ZERO, 0.87),
    }
}

pub fn place(mesh: Mesh, material: MaterialId, position: Vec3) -> Renderable {
    Renderable::new(Mat4::from_translation(position), mesh, material)
}

pub fn color_target(size: u32) -> RenderTargetDescription {
    RenderTargetDescription::new(size, size, TextureFormat::Rgba8Unorm)
}

/// Clears what it writes; reads are only declared
pub struct ClearPass {
    name: String,
    reads: Vec<RenderTargetHandle>,
    writes: Vec<RenderTargetHandle>,
}

impl ClearPass {
    pub fn new(name: &str, reads: &[RenderTargetHandle], writes: &[RenderTargetHandle]) -> Self {
        Self {
            name: name.to_string(),
            reads: reads.to_vec(),
            writes: writes.to_vec(),
        }
    }
}

impl RenderPass for ClearPass {
    fn name(&self) -> &str {
        &self.name
    }

    fn setup(&self, ctx: &mut PassSetupContext) {
        for &target in &self.reads {
            ctx.read(target, PipelineStage::FragmentShader);
        }
        for &target in &self.writes {
            ctx.write(target, PipelineStage::ColorAttachmentOutput);
        }
    }

    fn record(&self, ctx: &mut PassRecordContext) -> Result<()> {
        let mut attachments = Vec::with_capacity(self.writes.len());
        for &target in &self.writes {
            attachments.push(ColorAttachment::clear(ctx.texture(target)?, [0.0; 4]));
        }
        let commands = ctx.commands();
        commands.begin_render_pass(&self.name, attachments, None);
        commands.end_render_pass();
        Ok(())
    }
}
