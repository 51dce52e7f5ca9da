//! Indirect lighting from reflection probes.
//!
//! Every probe is drawn as an additive fullscreen pass into two half-float
//! accumulation targets. The RGB channels carry probe light scaled by the
//! probe's influence at the pixel and alpha carries the influence itself, so
//! light shading divides the two to blend overlapping probes.

use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use glam::Vec4;

use super::gbuffer_pass::GBufferTargets;
use super::shaders::*;
use crate::backend::*;
use crate::error::{GraphError, Result};
use crate::frame::FrameContext;
use crate::render_graph::*;
use crate::scene::ReflectionProbe;

/// Source id of the probe shader
pub const INDIRECT_SHADER: &str = "indirect";

/// Per-probe uniform block
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct ProbeUniform {
    /// xyz = position, w = radius
    pub position_radius: Vec4,
}

/// A visible probe with the program compiled for its mip chain
#[derive(Debug, Clone, Copy)]
pub struct ProbeBinding {
    pub probe: ReflectionProbe,
    pub program: ProgramHandle,
    pub mip_levels: u32,
}

#[derive(Debug, Clone, Copy)]
struct ProbeDraw {
    texture: RenderTargetHandle,
    program: ProgramHandle,
    uniform: ProbeUniform,
}

/// Output handles of the indirect pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndirectTargets {
    pub irradiance: RenderTargetHandle,
    pub reflection: RenderTargetHandle,
}

pub struct IndirectPass {
    frame: Arc<FrameContext>,
    gbuffer: GBufferTargets,
    probes: Vec<ProbeDraw>,
    targets: IndirectTargets,
}

impl IndirectPass {
    pub fn new(
        graph: &mut RenderGraph,
        frame: Arc<FrameContext>,
        gbuffer: GBufferTargets,
        probes: &[ProbeBinding],
    ) -> std::result::Result<Self, GraphError> {
        let (width, height) = graph.screen_size();
        let irradiance = graph.new_render_target(
            "indirect_irradiance",
            RenderTargetDescription::new(width, height, TextureFormat::Rgba16Float),
        )?;
        let reflection = graph.new_render_target(
            "indirect_reflection",
            RenderTargetDescription::new(width, height, TextureFormat::Rgba16Float),
        )?;

        let probes = probes
            .iter()
            .enumerate()
            .map(|(i, binding)| {
                let probe = &binding.probe;
                let description =
                    RenderTargetDescription::new(probe.size, probe.size, TextureFormat::Rgba16Float)
                        .with_usage(TextureUsage::SAMPLED)
                        .with_mip_levels(binding.mip_levels);
                ProbeDraw {
                    texture: graph.import_texture(
                        &format!("reflection_probe_{i}"),
                        probe.texture,
                        description,
                        None,
                    ),
                    program: binding.program,
                    uniform: ProbeUniform {
                        position_radius: probe.position.extend(probe.radius),
                    },
                }
            })
            .collect();

        Ok(Self {
            frame,
            gbuffer,
            probes,
            targets: IndirectTargets {
                irradiance,
                reflection,
            },
        })
    }

    pub fn targets(&self) -> IndirectTargets {
        self.targets
    }
}

/// `IR_MIPMAP_COUNT` of a probe with `size` texel faces, capped at `max_mips`
pub fn probe_mip_count(size: u32, max_mips: u32) -> u32 {
    (32 - size.max(1).leading_zeros()).min(max_mips).max(1)
}

impl RenderPass for IndirectPass {
    fn name(&self) -> &str {
        "Indirect Lighting"
    }

    fn setup(&self, ctx: &mut PassSetupContext) {
        ctx.read(self.gbuffer.specular_roughness, PipelineStage::FragmentShader)
            .read(self.gbuffer.normals, PipelineStage::FragmentShader)
            .read(self.gbuffer.depth, PipelineStage::FragmentShader);
        for probe in &self.probes {
            ctx.read(probe.texture, PipelineStage::FragmentShader);
        }
        ctx.write(self.targets.irradiance, PipelineStage::ColorAttachmentOutput)
            .write(self.targets.reflection, PipelineStage::ColorAttachmentOutput);
    }

    fn chunk_uniforms(&self, _chunk: u32) -> UniformRequest {
        UniformRequest::of::<ProbeUniform>(self.probes.len())
    }

    fn record(&self, ctx: &mut PassRecordContext) -> Result<()> {
        let (width, height) = self.frame.resolution();
        let irradiance = ctx.texture(self.targets.irradiance)?;
        let reflection = ctx.texture(self.targets.reflection)?;
        let specular = ctx.texture(self.gbuffer.specular_roughness)?;
        let normals = ctx.texture(self.gbuffer.normals)?;
        let depth = ctx.texture(self.gbuffer.depth)?;

        let mut draws = Vec::with_capacity(self.probes.len());
        for probe in &self.probes {
            let token = ctx.push_uniforms(&probe.uniform)?;
            draws.push((ctx.texture(probe.texture)?, probe.program, token));
        }

        ctx.commands().begin_render_pass(
            self.name(),
            vec![
                ColorAttachment::clear(irradiance, [0.0; 4]),
                ColorAttachment::clear(reflection, [0.0; 4]),
            ],
            None,
        );
        ctx.commands().set_viewport(Viewport::full(width, height));
        ctx.commands().set_depth_state(DepthState::DISABLED);
        ctx.bind_uniforms(CAMERA_BINDING, &self.frame.tokens().camera)?;
        {
            let commands = ctx.commands();
            commands.bind_texture(GBUFFER_SPECULAR_BINDING, specular, SamplerKind::NearestClamp);
            commands.bind_texture(GBUFFER_NORMAL_BINDING, normals, SamplerKind::NearestClamp);
            commands.bind_texture(GBUFFER_DEPTH_BINDING, depth, SamplerKind::NearestClamp);
        }

        ctx.with_blend_factors(0, BlendFactors::ADDITIVE, |ctx| {
            ctx.with_blend_factors(1, BlendFactors::ADDITIVE, |ctx| {
                for (texture, program, token) in &draws {
                    ctx.commands().bind_program(*program);
                    ctx.bind_uniforms(DRAW_BINDING, token)?;
                    ctx.commands()
                        .bind_texture(PROBE_BINDING, *texture, SamplerKind::LinearClamp);
                    ctx.commands().draw_fullscreen_quad();
                }
                Ok::<(), crate::error::RenderError>(())
            })
        })?;

        ctx.commands().end_render_pass();
        Ok(())
    }
}

/// Specialized by `IR_MIPMAP_COUNT`, the mip count of the probe cube
pub const INDIRECT_WGSL: &str = concat!(
    camera_wgsl!(),
    fullscreen_vertex_wgsl!(),
    r#"
struct ProbeData {
    position_radius: vec4<f32>,
}

@group(0) @binding(1) var<uniform> probe: ProbeData;
@group(0) @binding(10) var gbuffer_specular: texture_2d<f32>;
@group(0) @binding(11) var gbuffer_normal: texture_2d<f32>;
@group(0) @binding(12) var gbuffer_depth: texture_depth_2d;
@group(0) @binding(15) var probe_cube: texture_cube<f32>;
@group(0) @binding(16) var probe_sampler: sampler;

struct IndirectOutput {
    @location(0) irradiance: vec4<f32>,
    @location(1) reflection: vec4<f32>,
}

@fragment
fn fs_main(@builtin(position) frag_coord: vec4<f32>) -> IndirectOutput {
    var output: IndirectOutput;
    output.irradiance = vec4<f32>(0.0);
    output.reflection = vec4<f32>(0.0);

    let texel = vec2<i32>(frag_coord.xy);
    let depth = textureLoad(gbuffer_depth, texel, 0);
    if (depth >= 1.0) {
        return output;
    }

    let world_pos = reconstruct_world_position(frag_coord.xy, depth);
    let dist = length(world_pos - probe.position_radius.xyz);
    let radius = probe.position_radius.w;
    if (dist >= radius) {
        return output;
    }
    let falloff = 1.0 - dist / radius;
    let weight = falloff * falloff;

    let n = normalize(textureLoad(gbuffer_normal, texel, 0).xyz);
    let v = normalize(camera.position.xyz - world_pos);
    let roughness = textureLoad(gbuffer_specular, texel, 0).g;
    let last_mip = f32(IR_MIPMAP_COUNT - 1u);

    let diffuse = textureSampleLevel(probe_cube, probe_sampler, n, last_mip).rgb;
    let specular = textureSampleLevel(probe_cube, probe_sampler, reflect(-v, n), roughness * last_mip).rgb;
    output.irradiance = vec4<f32>(diffuse * weight, weight);
    output.reflection = vec4<f32>(specular * weight, weight);
    return output;
}
"#
);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::{ConstantSet, ShaderVariantCache};

    #[test]
    fn test_mip_count() {
        assert_eq!(probe_mip_count(1, 5), 1);
        assert_eq!(probe_mip_count(16, 8), 5);
        assert_eq!(probe_mip_count(128, 5), 5);
        assert_eq!(probe_mip_count(128, 0), 1);
    }

    #[test]
    fn test_indirect_shader_compiles() {
        let mut backend = RecordingBackend::new();
        let cache = ShaderVariantCache::new();
        cache.register_source(INDIRECT_SHADER, INDIRECT_WGSL, &FULLSCREEN_ENTRY_POINTS);
        cache
            .get_or_create(
                &mut backend,
                INDIRECT_SHADER,
                &ConstantSet::new().with_u32("IR_MIPMAP_COUNT", probe_mip_count(64, 5)),
            )
            .unwrap();
    }
}
