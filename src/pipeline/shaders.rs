//! WGSL shared by the built-in shaders, and the binding slots they agree on.
//!
//! The snippets are macros so they can be spliced into the `&'static str`
//! sources with `concat!`.

/// Camera block at binding 0 and world-position reconstruction
macro_rules! camera_wgsl {
    () => {
        r#"
struct CameraUniforms {
    view: mat4x4<f32>,
    proj: mat4x4<f32>,
    view_proj: mat4x4<f32>,
    inv_view_proj: mat4x4<f32>,
    position: vec4<f32>,
    // x = near, y = far, zw = framebuffer size
    near_far_size: vec4<f32>,
}

@group(0) @binding(0) var<uniform> camera: CameraUniforms;

fn reconstruct_world_position(frag_xy: vec2<f32>, depth: f32) -> vec3<f32> {
    let uv = frag_xy / camera.near_far_size.zw;
    let ndc = vec4<f32>(uv.x * 2.0 - 1.0, 1.0 - uv.y * 2.0, depth, 1.0);
    let world = camera.inv_view_proj * ndc;
    return world.xyz / world.w;
}
"#
    };
}

/// Light list, shadow atlas and the per-light shading model
macro_rules! light_functions_wgsl {
    () => {
        r#"
struct LightData {
    position_radius: vec4<f32>,
    color_intensity: vec4<f32>,
    // w = kind: 0 point, 1 spot, 2 directional
    direction_kind: vec4<f32>,
    // x = cos(inner), y = cos(outer), z = first shadow view or -1
    params: vec4<f32>,
}

struct ShadowView {
    view_proj: mat4x4<f32>,
    // xy = offset, zw = scale in atlas uv
    atlas_rect: vec4<f32>,
}

struct LightingParams {
    ambient: vec4<f32>,
    // x = directional lights, y = all lights, z = shadow views
    counts: vec4<u32>,
    // x = near, y = far, z = ln(far / near)
    cluster_depth: vec4<f32>,
    // xy = framebuffer size, zw = shadow atlas size
    screen: vec4<f32>,
}

const SHADOW_BIAS: f32 = 0.002;
const EMISSION_RANGE: f32 = 16.0;

@group(0) @binding(3) var<uniform> lighting: LightingParams;
@group(0) @binding(4) var<storage, read> lights: array<LightData>;
@group(0) @binding(5) var<storage, read> shadow_views: array<ShadowView>;
@group(0) @binding(6) var shadow_atlas: texture_depth_2d;

// xyz = direction towards the light, w = attenuation
fn light_incidence(light: LightData, world_pos: vec3<f32>) -> vec4<f32> {
    let kind = light.direction_kind.w;
    if (kind > 1.5) {
        return vec4<f32>(-light.direction_kind.xyz, 1.0);
    }
    let to_light = light.position_radius.xyz - world_pos;
    let dist = length(to_light);
    let radius = light.position_radius.w;
    if (dist >= radius) {
        return vec4<f32>(0.0);
    }
    let l = to_light / max(dist, 0.0001);
    let ratio = dist / radius;
    let falloff = 1.0 - ratio * ratio;
    var attenuation = falloff * falloff;
    if (kind > 0.5) {
        let cos_angle = dot(-l, light.direction_kind.xyz);
        if (light.params.x - light.params.y > 0.0001) {
            attenuation *= smoothstep(light.params.y, light.params.x, cos_angle);
        } else {
            attenuation *= f32(cos_angle >= light.params.y);
        }
    }
    return vec4<f32>(l, attenuation);
}

fn shade_light(
    light: LightData,
    world_pos: vec3<f32>,
    n: vec3<f32>,
    v: vec3<f32>,
    albedo: vec3<f32>,
    specular: f32,
    roughness: f32,
) -> vec3<f32> {
    let incidence = light_incidence(light, world_pos);
    let l = incidence.xyz;
    let n_dot_l = dot(n, l);
    if (incidence.w <= 0.0 || n_dot_l <= 0.0) {
        return vec3<f32>(0.0);
    }
    let h = normalize(l + v);
    let shininess = 2.0 / max(roughness * roughness, 0.001);
    let highlight = specular * pow(max(dot(n, h), 0.0), shininess);
    let radiance = light.color_intensity.rgb * light.color_intensity.w * incidence.w;
    return (albedo + vec3<f32>(highlight)) * radiance * n_dot_l;
}

fn cube_face(d: vec3<f32>) -> u32 {
    let a = abs(d);
    if (a.x >= a.y && a.x >= a.z) {
        return select(1u, 0u, d.x > 0.0);
    }
    if (a.y >= a.z) {
        return select(3u, 2u, d.y > 0.0);
    }
    return select(5u, 4u, d.z > 0.0);
}

fn shadow_visibility(light: LightData, world_pos: vec3<f32>) -> f32 {
    let first_view = light.params.z;
    if (first_view < 0.0) {
        return 1.0;
    }
    var view_index = u32(first_view);
    if (light.direction_kind.w < 0.5) {
        view_index += cube_face(world_pos - light.position_radius.xyz);
    }
    let shadow_view = shadow_views[view_index];
    let clip = shadow_view.view_proj * vec4<f32>(world_pos, 1.0);
    let ndc = clip.xyz / clip.w;
    if (any(abs(ndc.xy) > vec2<f32>(1.0)) || ndc.z < 0.0 || ndc.z > 1.0) {
        return 1.0;
    }
    let uv = vec2<f32>(ndc.x * 0.5 + 0.5, 0.5 - ndc.y * 0.5);
    let atlas_uv = shadow_view.atlas_rect.xy + uv * shadow_view.atlas_rect.zw;
    let texel = vec2<i32>(atlas_uv * lighting.screen.zw);
    let occluder = textureLoad(shadow_atlas, texel, 0);
    return f32(ndc.z - SHADOW_BIAS <= occluder);
}
"#
    };
}

/// Fullscreen triangle from the vertex index, no vertex buffer
macro_rules! fullscreen_vertex_wgsl {
    () => {
        r#"
@vertex
fn vs_main(@builtin(vertex_index) vertex_index: u32) -> @builtin(position) vec4<f32> {
    let x = f32((vertex_index << 1u) & 2u);
    let y = f32(vertex_index & 2u);
    return vec4<f32>(x * 2.0 - 1.0, y * 2.0 - 1.0, 0.0, 1.0);
}
"#
    };
}

use crate::backend::ShaderStage;

/// Entry points of the fullscreen shaders
pub const FULLSCREEN_ENTRY_POINTS: [(&str, ShaderStage); 2] = [
    ("vs_main", ShaderStage::Vertex),
    ("fs_main", ShaderStage::Fragment),
];

pub const CAMERA_BINDING: u32 = 0;
pub const DRAW_BINDING: u32 = 1;
pub const ALBEDO_BINDING: u32 = 2;
pub const LIGHTING_BINDING: u32 = 3;
pub const LIGHTS_BINDING: u32 = 4;
pub const SHADOW_VIEWS_BINDING: u32 = 5;
pub const SHADOW_ATLAS_BINDING: u32 = 6;
pub const CLUSTERS_BINDING: u32 = 7;
pub const CLUSTER_INDICES_BINDING: u32 = 8;
pub const GBUFFER_ALBEDO_BINDING: u32 = 9;
pub const GBUFFER_SPECULAR_BINDING: u32 = 10;
pub const GBUFFER_NORMAL_BINDING: u32 = 11;
pub const GBUFFER_DEPTH_BINDING: u32 = 12;
pub const IRRADIANCE_BINDING: u32 = 13;
pub const REFLECTION_BINDING: u32 = 14;
/// Probe cube map; its sampler sits at the next slot
pub const PROBE_BINDING: u32 = 15;
pub const FORWARD_COLOR_BINDING: u32 = 17;
pub const FORWARD_DEPTH_BINDING: u32 = 18;

/// Depth bias and emission scale, kept equal to the WGSL constants
pub const SHADOW_BIAS: f32 = 0.002;
pub const EMISSION_RANGE: f32 = 16.0;
