//! Forward shading of transparent geometry.
//!
//! Transparent draws are lit per object into a reduced-resolution buffer
//! holding premultiplied color in RGB and the remaining transmittance in
//! alpha. The buffer starts as (0, 0, 0, 1), an empty layer that lets the
//! background through unchanged. "Forward Upscale" then composites the layer
//! over the shaded opaque image, picking for every full-resolution pixel the
//! low-resolution texel whose depth is closest to the opaque surface.
//!
//! Both passes blend with [`BlendFactors::COMPOSITE`] and put the opaque
//! default back before they end.

use std::sync::Arc;

use super::draw::{chunks_for, record_draws, DrawItem, DrawUniform};
use super::shaders::*;
use crate::backend::*;
use crate::error::{GraphError, Result};
use crate::frame::FrameContext;
use crate::render_graph::*;

/// Source id of the upscale composite shader
pub const FORWARD_UPSCALE_SHADER: &str = "forward_upscale";

/// Transparent draws into `forward_color`
pub struct ForwardPass {
    frame: Arc<FrameContext>,
    draws: Arc<[DrawItem]>,
    draws_per_chunk: u32,
    depth: RenderTargetHandle,
    shadow_atlas: RenderTargetHandle,
    color: RenderTargetHandle,
    size: (u32, u32),
}

impl ForwardPass {
    /// `depth` is the downscaled depth; `forward_color` is created at its size.
    /// `draws` must already be sorted back to front.
    pub fn new(
        graph: &mut RenderGraph,
        frame: Arc<FrameContext>,
        draws: Arc<[DrawItem]>,
        draws_per_chunk: u32,
        depth: RenderTargetHandle,
        shadow_atlas: RenderTargetHandle,
    ) -> std::result::Result<Self, GraphError> {
        let depth_description = graph
            .resource(depth)
            .map(|r| r.description)
            .ok_or(GraphError::UnknownResource {
                pass: "Forward Shading".to_string(),
                index: depth.index() as u32,
            })?;
        let size = (depth_description.width, depth_description.height);
        let color = graph.new_render_target(
            "forward_color",
            RenderTargetDescription::new(size.0, size.1, TextureFormat::Rgba16Float),
        )?;
        Ok(Self {
            frame,
            draws,
            draws_per_chunk,
            depth,
            shadow_atlas,
            color,
            size,
        })
    }

    pub fn color(&self) -> RenderTargetHandle {
        self.color
    }

    pub fn size(&self) -> (u32, u32) {
        self.size
    }
}

impl RenderPass for ForwardPass {
    fn name(&self) -> &str {
        "Forward Shading"
    }

    fn setup(&self, ctx: &mut PassSetupContext) {
        ctx.read(self.depth, PipelineStage::EarlyFragmentTests)
            .read(self.shadow_atlas, PipelineStage::FragmentShader)
            .write(self.color, PipelineStage::ColorAttachmentOutput);
    }

    fn chunk_count(&self) -> u32 {
        chunks_for(self.draws.len(), self.draws_per_chunk)
    }

    fn chunk_uniforms(&self, _chunk: u32) -> UniformRequest {
        UniformRequest::of::<DrawUniform>(self.draws_per_chunk.min(self.draws.len() as u32) as usize)
    }

    fn record(&self, ctx: &mut PassRecordContext) -> Result<()> {
        let color = ctx.texture(self.color)?;
        let depth = ctx.texture(self.depth)?;
        let atlas = ctx.texture(self.shadow_atlas)?;
        let range = ctx.chunk_range(self.draws.len());
        let attachment = if ctx.chunk_index() == 0 {
            ColorAttachment::clear(color, [0.0, 0.0, 0.0, 1.0])
        } else {
            ColorAttachment::load(color)
        };

        ctx.commands().begin_render_pass(
            self.name(),
            vec![attachment],
            Some(DepthAttachment {
                texture: depth,
                load: DepthLoadOp::Load,
                store: StoreOp::Store,
                read_only: true,
            }),
        );
        ctx.commands()
            .set_viewport(Viewport::full(self.size.0, self.size.1));
        ctx.commands().set_depth_state(DepthState::LESS_NO_WRITE);

        let tokens = *self.frame.tokens();
        ctx.bind_uniforms(CAMERA_BINDING, &tokens.camera)?;
        ctx.bind_uniforms(LIGHTING_BINDING, &tokens.lighting)?;
        ctx.bind_storage(LIGHTS_BINDING, &tokens.lights)?;
        ctx.bind_storage(SHADOW_VIEWS_BINDING, &tokens.shadow_views)?;
        ctx.commands()
            .bind_texture(SHADOW_ATLAS_BINDING, atlas, SamplerKind::NearestClamp);

        ctx.with_blend_factors(0, BlendFactors::COMPOSITE, |ctx| {
            record_draws(ctx, &self.draws[range])
        })?;

        ctx.commands().end_render_pass();
        Ok(())
    }
}

/// Depth-aware composite of `forward_color` into the shaded color
pub struct ForwardUpscalePass {
    program: ProgramHandle,
    forward_color: RenderTargetHandle,
    forward_depth: RenderTargetHandle,
    full_depth: RenderTargetHandle,
    target: RenderTargetHandle,
    size: (u32, u32),
}

impl ForwardUpscalePass {
    pub fn new(
        graph: &RenderGraph,
        program: ProgramHandle,
        forward: &ForwardPass,
        full_depth: RenderTargetHandle,
        target: RenderTargetHandle,
    ) -> Self {
        Self {
            program,
            forward_color: forward.color(),
            forward_depth: forward.depth,
            full_depth,
            target,
            size: graph.screen_size(),
        }
    }
}

impl RenderPass for ForwardUpscalePass {
    fn name(&self) -> &str {
        "Forward Upscale"
    }

    fn setup(&self, ctx: &mut PassSetupContext) {
        ctx.read(self.forward_color, PipelineStage::FragmentShader)
            .read(self.forward_depth, PipelineStage::FragmentShader)
            .read(self.full_depth, PipelineStage::FragmentShader)
            .read_write(
                self.target,
                PipelineStage::ColorAttachmentOutput,
                PipelineStage::ColorAttachmentOutput,
            );
    }

    fn record(&self, ctx: &mut PassRecordContext) -> Result<()> {
        let target = ctx.texture(self.target)?;
        let forward_color = ctx.texture(self.forward_color)?;
        let forward_depth = ctx.texture(self.forward_depth)?;
        let full_depth = ctx.texture(self.full_depth)?;

        let commands = ctx.commands();
        commands.begin_render_pass("Forward Upscale", vec![ColorAttachment::load(target)], None);
        commands.set_viewport(Viewport::full(self.size.0, self.size.1));
        commands.set_depth_state(DepthState::DISABLED);
        commands.bind_program(self.program);
        commands.bind_texture(FORWARD_COLOR_BINDING, forward_color, SamplerKind::NearestClamp);
        commands.bind_texture(FORWARD_DEPTH_BINDING, forward_depth, SamplerKind::NearestClamp);
        commands.bind_texture(GBUFFER_DEPTH_BINDING, full_depth, SamplerKind::NearestClamp);
        commands.with_blend_factors(0, BlendFactors::COMPOSITE, |commands| {
            commands.draw_fullscreen_quad();
        });
        commands.end_render_pass();
        Ok(())
    }
}

/// Specialized by the forward buffer size `SRC_WIDTH` x `SRC_HEIGHT` and the
/// framebuffer size `FB_WIDTH` x `FB_HEIGHT`
pub const FORWARD_UPSCALE_WGSL: &str = concat!(
    fullscreen_vertex_wgsl!(),
    r#"
@group(0) @binding(12) var gbuffer_depth: texture_depth_2d;
@group(0) @binding(17) var forward_color: texture_2d<f32>;
@group(0) @binding(18) var forward_depth: texture_depth_2d;

@fragment
fn fs_main(@builtin(position) frag_coord: vec4<f32>) -> @location(0) vec4<f32> {
    let depth = textureLoad(gbuffer_depth, vec2<i32>(frag_coord.xy), 0);
    let scale = vec2<f32>(f32(SRC_WIDTH) / f32(FB_WIDTH), f32(SRC_HEIGHT) / f32(FB_HEIGHT));
    let base = vec2<i32>(floor(frag_coord.xy * scale - vec2<f32>(0.5)));
    let last = vec2<i32>(i32(SRC_WIDTH) - 1, i32(SRC_HEIGHT) - 1);

    var best = clamp(base, vec2<i32>(0), last);
    var best_diff = 3.0e38;
    for (var i = 0u; i < 4u; i++) {
        let texel = clamp(base + vec2<i32>(i32(i & 1u), i32(i >> 1u)), vec2<i32>(0), last);
        let diff = abs(textureLoad(forward_depth, texel, 0) - depth);
        if (diff < best_diff) {
            best_diff = diff;
            best = texel;
        }
    }
    return textureLoad(forward_color, best, 0);
}
"#
);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::{ConstantSet, ShaderVariantCache};

    #[test]
    fn test_upscale_shader_compiles() {
        let mut backend = RecordingBackend::new();
        let cache = ShaderVariantCache::new();
        cache.register_source(FORWARD_UPSCALE_SHADER, FORWARD_UPSCALE_WGSL, &FULLSCREEN_ENTRY_POINTS);
        let constants = ConstantSet::new()
            .with_u32("SRC_WIDTH", 32)
            .with_u32("SRC_HEIGHT", 16)
            .with_u32("FB_WIDTH", 64)
            .with_u32("FB_HEIGHT", 32);
        cache
            .get_or_create(&mut backend, FORWARD_UPSCALE_SHADER, &constants)
            .unwrap();
    }

    #[test]
    fn test_forward_buffer_follows_depth_size() {
        let mut graph = RenderGraph::new(64, 32);
        let frame = Arc::new(crate::pipeline::tests::test_frame(0, (64, 32)));
        let depth = graph
            .new_render_target(
                "forward_depth",
                RenderTargetDescription::new(32, 16, TextureFormat::Depth32Float),
            )
            .unwrap();
        let atlas = graph
            .new_render_target(
                "shadow_atlas",
                RenderTargetDescription::new(256, 256, TextureFormat::Depth32Float),
            )
            .unwrap();
        let pass = ForwardPass::new(&mut graph, frame, Arc::from(Vec::new()), 16, depth, atlas).unwrap();
        assert_eq!(pass.size(), (32, 16));
        assert_eq!(graph.resource(pass.color()).unwrap().description.width, 32);
    }
}
