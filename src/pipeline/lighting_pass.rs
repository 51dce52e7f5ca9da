//! Light shading pass
//!
//! Fullscreen pass that reconstructs each pixel's surface from the G-buffer
//! and accumulates the directional lights plus the local lights binned into
//! the pixel's cluster. Shadowed lights are tested against the atlas, and
//! probe light from the indirect pass replaces the flat ambient term where
//! a probe reaches.

use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use glam::Vec4;

use super::gbuffer_pass::GBufferTargets;
use super::indirect_pass::IndirectTargets;
use super::shaders::*;
use crate::backend::*;
use crate::error::{GraphError, Result};
use crate::frame::FrameContext;
use crate::render_graph::*;

/// Source id of the light shading shader
pub const LIGHT_SHADING_SHADER: &str = "light_shading";

/// Lighting parameters as read by the shaders
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct GpuLightingParams {
    pub ambient: Vec4,
    /// x = directional lights, y = all lights, z = shadow views
    pub counts: [u32; 4],
    /// x = near, y = far, z = ln(far / near)
    pub cluster_depth: Vec4,
    /// xy = framebuffer size, zw = shadow atlas size
    pub screen: Vec4,
}

pub struct LightShadingPass {
    frame: Arc<FrameContext>,
    program: ProgramHandle,
    gbuffer: GBufferTargets,
    shadow_atlas: RenderTargetHandle,
    indirect: IndirectTargets,
    color: RenderTargetHandle,
}

impl LightShadingPass {
    /// Creates and exports the `light_shading_color` target
    pub fn new(
        graph: &mut RenderGraph,
        frame: Arc<FrameContext>,
        program: ProgramHandle,
        gbuffer: GBufferTargets,
        shadow_atlas: RenderTargetHandle,
        indirect: IndirectTargets,
    ) -> std::result::Result<Self, GraphError> {
        let (width, height) = graph.screen_size();
        let color = graph.new_render_target(
            "light_shading_color",
            RenderTargetDescription::new(width, height, TextureFormat::Rgba16Float),
        )?;
        graph.export(color)?;
        Ok(Self {
            frame,
            program,
            gbuffer,
            shadow_atlas,
            indirect,
            color,
        })
    }

    /// Shaded color buffer
    pub fn color(&self) -> RenderTargetHandle {
        self.color
    }

    fn sampled(&self) -> [(u32, RenderTargetHandle); 7] {
        [
            (SHADOW_ATLAS_BINDING, self.shadow_atlas),
            (GBUFFER_ALBEDO_BINDING, self.gbuffer.albedo_emission),
            (GBUFFER_SPECULAR_BINDING, self.gbuffer.specular_roughness),
            (GBUFFER_NORMAL_BINDING, self.gbuffer.normals),
            (GBUFFER_DEPTH_BINDING, self.gbuffer.depth),
            (IRRADIANCE_BINDING, self.indirect.irradiance),
            (REFLECTION_BINDING, self.indirect.reflection),
        ]
    }
}

impl RenderPass for LightShadingPass {
    fn name(&self) -> &str {
        "Light Shading"
    }

    fn setup(&self, ctx: &mut PassSetupContext) {
        for (_, target) in self.sampled() {
            ctx.read(target, PipelineStage::FragmentShader);
        }
        ctx.write(self.color, PipelineStage::ColorAttachmentOutput);
    }

    fn record(&self, ctx: &mut PassRecordContext) -> Result<()> {
        let (width, height) = self.frame.resolution();
        let color = ctx.texture(self.color)?;
        let mut inputs = Vec::with_capacity(7);
        for (binding, target) in self.sampled() {
            inputs.push((binding, ctx.texture(target)?));
        }

        ctx.commands().begin_render_pass(
            self.name(),
            vec![ColorAttachment::clear(color, [0.0, 0.0, 0.0, 1.0])],
            None,
        );
        ctx.commands().set_viewport(Viewport::full(width, height));
        ctx.commands().set_depth_state(DepthState::DISABLED);
        ctx.commands().bind_program(self.program);

        let tokens = *self.frame.tokens();
        ctx.bind_uniforms(CAMERA_BINDING, &tokens.camera)?;
        ctx.bind_uniforms(LIGHTING_BINDING, &tokens.lighting)?;
        ctx.bind_storage(LIGHTS_BINDING, &tokens.lights)?;
        ctx.bind_storage(SHADOW_VIEWS_BINDING, &tokens.shadow_views)?;
        ctx.bind_storage(CLUSTERS_BINDING, &tokens.clusters)?;
        ctx.bind_storage(CLUSTER_INDICES_BINDING, &tokens.cluster_indices)?;

        let commands = ctx.commands();
        for (binding, texture) in inputs {
            commands.bind_texture(binding, texture, SamplerKind::NearestClamp);
        }
        commands.draw_fullscreen_quad();
        commands.end_render_pass();
        Ok(())
    }
}

/// Specialized by `CLUSTER_COUNT_X`, `CLUSTER_COUNT_Y`, `CLUSTER_COUNT_Z` and
/// their product `CLUSTER_COUNT`
pub const LIGHT_SHADING_WGSL: &str = concat!(
    camera_wgsl!(),
    light_functions_wgsl!(),
    fullscreen_vertex_wgsl!(),
    r#"
struct ClusterRange {
    offset: u32,
    count: u32,
}

@group(0) @binding(7) var<storage, read> clusters: array<ClusterRange, CLUSTER_COUNT>;
@group(0) @binding(8) var<storage, read> cluster_lights: array<u32>;
@group(0) @binding(9) var gbuffer_albedo: texture_2d<f32>;
@group(0) @binding(10) var gbuffer_specular: texture_2d<f32>;
@group(0) @binding(11) var gbuffer_normal: texture_2d<f32>;
@group(0) @binding(12) var gbuffer_depth: texture_depth_2d;
@group(0) @binding(13) var irradiance_buffer: texture_2d<f32>;
@group(0) @binding(14) var reflection_buffer: texture_2d<f32>;

fn cluster_of(frag_xy: vec2<f32>, world_pos: vec3<f32>) -> u32 {
    let view_depth = -(camera.view * vec4<f32>(world_pos, 1.0)).z;
    let near = lighting.cluster_depth.x;
    let t = log(max(view_depth, near) / near) / lighting.cluster_depth.z;
    let z = min(u32(max(t * f32(CLUSTER_COUNT_Z), 0.0)), CLUSTER_COUNT_Z - 1u);
    let uv = frag_xy / lighting.screen.xy;
    let x = min(u32(max(uv.x * f32(CLUSTER_COUNT_X), 0.0)), CLUSTER_COUNT_X - 1u);
    let y = min(u32(max(uv.y * f32(CLUSTER_COUNT_Y), 0.0)), CLUSTER_COUNT_Y - 1u);
    return x + y * CLUSTER_COUNT_X + z * CLUSTER_COUNT_X * CLUSTER_COUNT_Y;
}

@fragment
fn fs_main(@builtin(position) frag_coord: vec4<f32>) -> @location(0) vec4<f32> {
    let texel = vec2<i32>(frag_coord.xy);
    let depth = textureLoad(gbuffer_depth, texel, 0);
    if (depth >= 1.0) {
        return vec4<f32>(0.0, 0.0, 0.0, 1.0);
    }

    let albedo_emission = textureLoad(gbuffer_albedo, texel, 0);
    let specular_roughness = textureLoad(gbuffer_specular, texel, 0);
    let n = normalize(textureLoad(gbuffer_normal, texel, 0).xyz);
    let world_pos = reconstruct_world_position(frag_coord.xy, depth);
    let v = normalize(camera.position.xyz - world_pos);
    let albedo = albedo_emission.rgb;
    let specular = specular_roughness.r;
    let roughness = specular_roughness.g;

    var color = albedo * lighting.ambient.rgb;
    let irradiance = textureLoad(irradiance_buffer, texel, 0);
    if (irradiance.a > 0.0) {
        color = albedo * irradiance.rgb / irradiance.a;
    }
    let reflection = textureLoad(reflection_buffer, texel, 0);
    if (reflection.a > 0.0) {
        color += specular * reflection.rgb / reflection.a;
    }

    for (var i = 0u; i < lighting.counts.x; i++) {
        let light = lights[i];
        color += shade_light(light, world_pos, n, v, albedo, specular, roughness) * shadow_visibility(light, world_pos);
    }

    let cell = clusters[cluster_of(frag_coord.xy, world_pos)];
    for (var i = 0u; i < cell.count; i++) {
        let light = lights[cluster_lights[cell.offset + i]];
        color += shade_light(light, world_pos, n, v, albedo, specular, roughness) * shadow_visibility(light, world_pos);
    }

    color += albedo * albedo_emission.a * EMISSION_RANGE;
    return vec4<f32>(color, 1.0);
}
"#
);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::{ConstantSet, ShaderVariantCache};

    #[test]
    fn test_lighting_params_layout() {
        assert_eq!(std::mem::size_of::<GpuLightingParams>(), 64);
    }

    #[test]
    fn test_light_shading_shader_compiles() {
        let mut backend = RecordingBackend::new();
        let cache = ShaderVariantCache::new();
        cache.register_source(LIGHT_SHADING_SHADER, LIGHT_SHADING_WGSL, &FULLSCREEN_ENTRY_POINTS);
        let constants = ConstantSet::new()
            .with_u32("CLUSTER_COUNT_X", 16)
            .with_u32("CLUSTER_COUNT_Y", 8)
            .with_u32("CLUSTER_COUNT_Z", 24)
            .with_u32("CLUSTER_COUNT", 16 * 8 * 24);
        cache
            .get_or_create(&mut backend, LIGHT_SHADING_SHADER, &constants)
            .unwrap();
    }
}
