//! G-Buffer pass for deferred rendering
//!
//! Rasterizes opaque geometry into three color targets plus depth:
//! - `gbuffer_albedo_emission`: RGB albedo, A emission strength
//! - `gbuffer_specular_roughness`: R specular, G roughness
//! - `gbuffer_normals`: world-space normal
//! - `gbuffer_depth`: device depth
//!
//! When the depth prepass runs, depth is laid down first and the G-buffer
//! pass only shades the surviving surface with an equal test.

use std::sync::Arc;

use super::draw::{chunks_for, record_draws, DrawItem, DrawUniform};
use super::shaders::CAMERA_BINDING;
use crate::backend::*;
use crate::error::{GraphError, Result};
use crate::frame::FrameContext;
use crate::render_graph::*;

/// Entry points every material shader provides
pub const MATERIAL_ENTRY_POINTS: [(&str, ShaderStage); 3] = [
    ("vs_main", ShaderStage::Vertex),
    ("fs_gbuffer", ShaderStage::Fragment),
    ("fs_forward", ShaderStage::Fragment),
];

/// Output handles of the geometry stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GBufferTargets {
    pub albedo_emission: RenderTargetHandle,
    pub specular_roughness: RenderTargetHandle,
    pub normals: RenderTargetHandle,
    pub depth: RenderTargetHandle,
}

impl GBufferTargets {
    pub fn colors(&self) -> [RenderTargetHandle; 3] {
        [self.albedo_emission, self.specular_roughness, self.normals]
    }
}

fn depth_target(graph: &mut RenderGraph) -> std::result::Result<RenderTargetHandle, GraphError> {
    let (width, height) = graph.screen_size();
    graph.new_render_target(
        "gbuffer_depth",
        RenderTargetDescription::new(width, height, TextureFormat::Depth32Float),
    )
}

/// Depth-only pass over the opaque draw list
pub struct DepthPrepassPass {
    frame: Arc<FrameContext>,
    draws: Arc<[DrawItem]>,
    draws_per_chunk: u32,
    depth: RenderTargetHandle,
}

impl DepthPrepassPass {
    pub fn new(
        graph: &mut RenderGraph,
        frame: Arc<FrameContext>,
        draws: Arc<[DrawItem]>,
        draws_per_chunk: u32,
    ) -> std::result::Result<Self, GraphError> {
        let depth = depth_target(graph)?;
        Ok(Self {
            frame,
            draws,
            draws_per_chunk,
            depth,
        })
    }

    pub fn depth(&self) -> RenderTargetHandle {
        self.depth
    }
}

impl RenderPass for DepthPrepassPass {
    fn name(&self) -> &str {
        "Depth Prepass"
    }

    fn setup(&self, ctx: &mut PassSetupContext) {
        ctx.write(self.depth, PipelineStage::LateFragmentTests);
    }

    fn chunk_count(&self) -> u32 {
        chunks_for(self.draws.len(), self.draws_per_chunk)
    }

    fn chunk_uniforms(&self, _chunk: u32) -> UniformRequest {
        UniformRequest::of::<DrawUniform>(self.draws_per_chunk.min(self.draws.len() as u32) as usize)
    }

    fn record(&self, ctx: &mut PassRecordContext) -> Result<()> {
        let (width, height) = self.frame.resolution();
        let depth = ctx.texture(self.depth)?;
        let load = if ctx.chunk_index() == 0 {
            DepthLoadOp::Clear(1.0)
        } else {
            DepthLoadOp::Load
        };
        let range = ctx.chunk_range(self.draws.len());

        ctx.commands().begin_render_pass(
            self.name(),
            Vec::new(),
            Some(DepthAttachment {
                texture: depth,
                load,
                store: StoreOp::Store,
                read_only: false,
            }),
        );
        ctx.commands().set_viewport(Viewport::full(width, height));
        ctx.commands().set_depth_state(DepthState::LESS_WRITE);
        ctx.bind_uniforms(CAMERA_BINDING, &self.frame.tokens().camera)?;
        record_draws(ctx, &self.draws[range])?;
        ctx.commands().end_render_pass();
        Ok(())
    }
}

/// Opaque geometry into the G-buffer
pub struct GBufferPass {
    frame: Arc<FrameContext>,
    draws: Arc<[DrawItem]>,
    draws_per_chunk: u32,
    targets: GBufferTargets,
    /// Depth comes from the prepass
    prepass: bool,
}

impl GBufferPass {
    /// Create the G-buffer targets. `prepass_depth` is the depth written by a
    /// [`DepthPrepassPass`], otherwise the pass creates and writes its own.
    pub fn new(
        graph: &mut RenderGraph,
        frame: Arc<FrameContext>,
        draws: Arc<[DrawItem]>,
        draws_per_chunk: u32,
        prepass_depth: Option<RenderTargetHandle>,
    ) -> std::result::Result<Self, GraphError> {
        let (width, height) = graph.screen_size();
        let albedo_emission = graph.new_render_target(
            "gbuffer_albedo_emission",
            RenderTargetDescription::new(width, height, TextureFormat::Rgba8Unorm),
        )?;
        let specular_roughness = graph.new_render_target(
            "gbuffer_specular_roughness",
            RenderTargetDescription::new(width, height, TextureFormat::Rgba8Unorm),
        )?;
        let normals = graph.new_render_target(
            "gbuffer_normals",
            RenderTargetDescription::new(width, height, TextureFormat::Rgba16Float),
        )?;
        let depth = match prepass_depth {
            Some(depth) => depth,
            None => depth_target(graph)?,
        };

        Ok(Self {
            frame,
            draws,
            draws_per_chunk,
            targets: GBufferTargets {
                albedo_emission,
                specular_roughness,
                normals,
                depth,
            },
            prepass: prepass_depth.is_some(),
        })
    }

    pub fn targets(&self) -> GBufferTargets {
        self.targets
    }
}

impl RenderPass for GBufferPass {
    fn name(&self) -> &str {
        "G-Buffer"
    }

    fn setup(&self, ctx: &mut PassSetupContext) {
        for target in self.targets.colors() {
            ctx.write(target, PipelineStage::ColorAttachmentOutput);
        }
        if self.prepass {
            ctx.read(self.targets.depth, PipelineStage::EarlyFragmentTests);
        } else {
            ctx.write(self.targets.depth, PipelineStage::LateFragmentTests);
        }
    }

    fn chunk_count(&self) -> u32 {
        chunks_for(self.draws.len(), self.draws_per_chunk)
    }

    fn chunk_uniforms(&self, _chunk: u32) -> UniformRequest {
        UniformRequest::of::<DrawUniform>(self.draws_per_chunk.min(self.draws.len() as u32) as usize)
    }

    fn record(&self, ctx: &mut PassRecordContext) -> Result<()> {
        let (width, height) = self.frame.resolution();
        let first = ctx.chunk_index() == 0;

        let mut color = Vec::with_capacity(3);
        for target in self.targets.colors() {
            let texture = ctx.texture(target)?;
            color.push(if first {
                ColorAttachment::clear(texture, [0.0; 4])
            } else {
                ColorAttachment::load(texture)
            });
        }
        let depth = DepthAttachment {
            texture: ctx.texture(self.targets.depth)?,
            load: if first && !self.prepass {
                DepthLoadOp::Clear(1.0)
            } else {
                DepthLoadOp::Load
            },
            store: StoreOp::Store,
            read_only: self.prepass,
        };
        let range = ctx.chunk_range(self.draws.len());

        ctx.commands().begin_render_pass(self.name(), color, Some(depth));
        ctx.commands().set_viewport(Viewport::full(width, height));
        ctx.commands().set_depth_state(if self.prepass {
            DepthState::EQUAL_NO_WRITE
        } else {
            DepthState::LESS_WRITE
        });
        ctx.bind_uniforms(CAMERA_BINDING, &self.frame.tokens().camera)?;
        record_draws(ctx, &self.draws[range])?;
        ctx.commands().end_render_pass();
        Ok(())
    }
}

/// Built-in material shader: G-buffer output, depth-only and forward shading
/// variants selected by the `RENDER_PASS` constant
pub const STANDARD_MATERIAL_WGSL: &str = concat!(
    camera_wgsl!(),
    light_functions_wgsl!(),
    r#"
struct MaterialData {
    base_color: vec4<f32>,
    emission_roughness: vec4<f32>,
    // x = specular
    params: vec4<f32>,
}

struct DrawUniforms {
    model: mat4x4<f32>,
    normal_matrix: mat4x4<f32>,
    material: MaterialData,
}

@group(0) @binding(1) var<uniform> object: DrawUniforms;

struct VertexInput {
    @location(0) position: vec3<f32>,
    @location(1) normal: vec3<f32>,
    @location(2) uv: vec2<f32>,
}

// Depth must match exactly between the prepass and the G-buffer pass
struct VertexOutput {
    @builtin(position) @invariant clip_position: vec4<f32>,
    @location(0) world_position: vec3<f32>,
    @location(1) world_normal: vec3<f32>,
    @location(2) uv: vec2<f32>,
}

struct GBufferOutput {
    @location(0) albedo_emission: vec4<f32>,
    @location(1) specular_roughness: vec4<f32>,
    @location(2) normal: vec4<f32>,
}

@vertex
fn vs_main(input: VertexInput) -> VertexOutput {
    var output: VertexOutput;
    let world_pos = object.model * vec4<f32>(input.position, 1.0);
    output.world_position = world_pos.xyz;
    output.clip_position = camera.view_proj * world_pos;
    output.world_normal = normalize((object.normal_matrix * vec4<f32>(input.normal, 0.0)).xyz);
    output.uv = input.uv;
    return output;
}

@fragment
fn fs_gbuffer(input: VertexOutput) -> GBufferOutput {
    var output: GBufferOutput;
    let material = object.material;
    let emission = material.emission_roughness.xyz;
    let strength = max(max(emission.x, emission.y), emission.z);

    output.albedo_emission = vec4<f32>(material.base_color.rgb, clamp(strength / EMISSION_RANGE, 0.0, 1.0));
    output.specular_roughness = vec4<f32>(material.params.x, material.emission_roughness.w, 0.0, 1.0);
    output.normal = vec4<f32>(normalize(input.world_normal), 1.0);
    return output;
}

// Premultiplied color, alpha = share of the background that shows through
@fragment
fn fs_forward(input: VertexOutput) -> @location(0) vec4<f32> {
    let material = object.material;
    let n = normalize(input.world_normal);
    let v = normalize(camera.position.xyz - input.world_position);
    let albedo = material.base_color.rgb;

    var color = lighting.ambient.rgb * albedo;
    for (var i = 0u; i < lighting.counts.y; i++) {
        let light = lights[i];
        let visibility = shadow_visibility(light, input.world_position);
        color += shade_light(light, input.world_position, n, v, albedo, material.params.x, material.emission_roughness.w) * visibility;
    }
    color += material.emission_roughness.xyz;

    let alpha = material.base_color.a;
    return vec4<f32>(color * alpha, 1.0 - alpha);
}
"#
);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::{ConstantSet, ShaderVariantCache, STANDARD_MATERIAL_SHADER};

    #[test]
    fn test_standard_material_compiles_every_pass() {
        let mut backend = RecordingBackend::new();
        let cache = ShaderVariantCache::new();
        cache.register_source(STANDARD_MATERIAL_SHADER, STANDARD_MATERIAL_WGSL, &MATERIAL_ENTRY_POINTS);
        for pass in 0..3 {
            let constants = ConstantSet::new().with_u32("RENDER_PASS", pass);
            cache
                .get_or_create(&mut backend, STANDARD_MATERIAL_SHADER, &constants)
                .unwrap();
        }
        assert_eq!(cache.variant_count(), 3);
    }

    #[test]
    fn test_prepass_shares_depth() {
        let mut graph = RenderGraph::new(64, 32);
        let frame = Arc::new(crate::pipeline::tests::test_frame(0, (64, 32)));
        let draws: Arc<[DrawItem]> = Arc::from(Vec::new());
        let prepass = DepthPrepassPass::new(&mut graph, frame.clone(), draws.clone(), 16).unwrap();
        let depth = prepass.depth();
        let gbuffer = GBufferPass::new(&mut graph, frame, draws, 16, Some(depth)).unwrap();
        assert_eq!(gbuffer.targets().depth, depth);
        graph.add_pass(prepass).unwrap();
        graph.add_pass(gbuffer).unwrap();

        let compiled = graph.compile().unwrap();
        assert_eq!(compiled.pass_names(), &["Depth Prepass", "G-Buffer"]);
        // The G-buffer waits for the prepass depth writes.
        assert!(compiled
            .barriers_before(1)
            .iter()
            .any(|b| b.hazard == Hazard::ReadAfterWrite));
    }
}
