//! Depth downscale for the reduced-resolution forward pass.
//!
//! Each output texel keeps the farthest of the full-resolution depths it
//! covers, so transparent surfaces are never hidden by an opaque edge that
//! only partly covers the texel.

use super::shaders::GBUFFER_DEPTH_BINDING;
use crate::backend::*;
use crate::error::{GraphError, Result};
use crate::render_graph::*;

/// Source id of the downscale shader
pub const DEPTH_DOWNSCALE_SHADER: &str = "depth_downscale";

/// Depth test that overwrites unconditionally
const REPLACE_DEPTH: DepthState = DepthState {
    compare: CompareFunction::Always,
    write_enabled: true,
};

pub struct DepthDownscalePass {
    program: ProgramHandle,
    source: RenderTargetHandle,
    target: RenderTargetHandle,
    size: (u32, u32),
}

impl DepthDownscalePass {
    /// Creates `forward_depth` at `1 / factor` of the screen size
    pub fn new(
        graph: &mut RenderGraph,
        program: ProgramHandle,
        source: RenderTargetHandle,
        factor: u32,
    ) -> std::result::Result<Self, GraphError> {
        let description = RenderTargetDescription::sized(
            TextureSize::Fraction(factor),
            graph.screen_size(),
            TextureFormat::Depth32Float,
        );
        let size = (description.width, description.height);
        let target = graph.new_render_target("forward_depth", description)?;
        Ok(Self {
            program,
            source,
            target,
            size,
        })
    }

    pub fn target(&self) -> RenderTargetHandle {
        self.target
    }
}

impl RenderPass for DepthDownscalePass {
    fn name(&self) -> &str {
        "Depth Downscale"
    }

    fn setup(&self, ctx: &mut PassSetupContext) {
        ctx.read(self.source, PipelineStage::FragmentShader)
            .write(self.target, PipelineStage::LateFragmentTests);
    }

    fn record(&self, ctx: &mut PassRecordContext) -> Result<()> {
        let source = ctx.texture(self.source)?;
        let target = ctx.texture(self.target)?;
        let commands = ctx.commands();
        commands.begin_render_pass(
            "Depth Downscale",
            Vec::new(),
            Some(DepthAttachment {
                texture: target,
                load: DepthLoadOp::Clear(1.0),
                store: StoreOp::Store,
                read_only: false,
            }),
        );
        commands.set_viewport(Viewport::full(self.size.0, self.size.1));
        commands.set_depth_state(REPLACE_DEPTH);
        commands.bind_program(self.program);
        commands.bind_texture(GBUFFER_DEPTH_BINDING, source, SamplerKind::NearestClamp);
        commands.draw_fullscreen_quad();
        commands.end_render_pass();
        Ok(())
    }
}

/// Specialized by `DOWNSCALE_FACTOR`
pub const DEPTH_DOWNSCALE_WGSL: &str = concat!(
    fullscreen_vertex_wgsl!(),
    r#"
@group(0) @binding(12) var gbuffer_depth: texture_depth_2d;

@fragment
fn fs_main(@builtin(position) frag_coord: vec4<f32>) -> @builtin(frag_depth) f32 {
    let size = textureDimensions(gbuffer_depth);
    let base = vec2<u32>(frag_coord.xy) * DOWNSCALE_FACTOR;
    var farthest = 0.0;
    for (var y = 0u; y < DOWNSCALE_FACTOR; y++) {
        for (var x = 0u; x < DOWNSCALE_FACTOR; x++) {
            let texel = min(base + vec2<u32>(x, y), size - vec2<u32>(1u));
            farthest = max(farthest, textureLoad(gbuffer_depth, texel, 0));
        }
    }
    return farthest;
}
"#
);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::shaders::FULLSCREEN_ENTRY_POINTS;
    use crate::resources::{ConstantSet, ShaderVariantCache};

    #[test]
    fn test_downscale_shader_compiles() {
        let mut backend = RecordingBackend::new();
        let cache = ShaderVariantCache::new();
        cache.register_source(DEPTH_DOWNSCALE_SHADER, DEPTH_DOWNSCALE_WGSL, &FULLSCREEN_ENTRY_POINTS);
        let variant = cache
            .get_or_create(
                &mut backend,
                DEPTH_DOWNSCALE_SHADER,
                &ConstantSet::new().with_u32("DOWNSCALE_FACTOR", 2),
            )
            .unwrap();
        assert!(variant.shader().has_entry_point("fs_main", ShaderStage::Fragment));
    }

    #[test]
    fn test_target_is_reduced() {
        let mut graph = RenderGraph::new(101, 50);
        let source = graph
            .new_render_target(
                "gbuffer_depth",
                RenderTargetDescription::new(101, 50, TextureFormat::Depth32Float),
            )
            .unwrap();
        let pass = DepthDownscalePass::new(&mut graph, ProgramHandle(1), source, 2).unwrap();
        let target = graph.resource(pass.target()).unwrap();
        assert_eq!(target.description.format, TextureFormat::Depth32Float);
        assert_eq!(pass.size, (50, 25));
    }
}
