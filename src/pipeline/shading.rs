//! CPU reference of the light shading model.
//!
//! The functions here follow the WGSL in [`super::shaders`] and the light
//! shading pass step by step, so lighting results can be checked without a
//! GPU. Shadow lookups go through [`ShadowVisibility`]; tests use
//! [`OccluderSpheres`], which answers the same question the atlas answers
//! by casting a ray against spheres.

use glam::{Vec2, Vec3, Vec4};

use super::light_clustering::{ClusterBins, ClusterGrid};
use super::shaders::{EMISSION_RANGE, SHADOW_BIAS};
use crate::frame::FrameLights;
use crate::scene::{BoundingSphere, Camera, Light, LightKind};

/// Surface attributes of one pixel as decoded from the G-buffer
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Surface {
    pub position: Vec3,
    pub normal: Vec3,
    pub albedo: Vec3,
    pub specular: f32,
    pub roughness: f32,
    /// Encoded emission strength, `[0, 1]` of [`EMISSION_RANGE`]
    pub emission: f32,
}

impl Surface {
    /// Decode a pixel at window coordinates `uv` with device depth `depth`
    pub fn from_gbuffer(
        camera: &Camera,
        uv: Vec2,
        depth: f32,
        albedo_emission: Vec4,
        specular_roughness: Vec4,
        normal: Vec3,
    ) -> Self {
        Self {
            position: camera.reconstruct_world_position(uv, depth),
            normal: normal.normalize_or_zero(),
            albedo: albedo_emission.truncate(),
            specular: specular_roughness.x,
            roughness: specular_roughness.y,
            emission: albedo_emission.w,
        }
    }
}

/// Value the G-buffer stores for a material's emission color
pub fn encode_emission(emission: Vec3) -> f32 {
    (emission.max_element() / EMISSION_RANGE).clamp(0.0, 1.0)
}

/// Accumulated probe light, RGB weighted by the probe influence stored in alpha
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct IndirectSample {
    pub irradiance: Vec4,
    pub reflection: Vec4,
}

/// Fraction of a light that reaches a point
pub trait ShadowVisibility {
    fn visibility(&self, light: &Light, world_pos: Vec3) -> f32;
}

/// Every light reaches every point
#[derive(Debug, Clone, Copy, Default)]
pub struct Unshadowed;

impl ShadowVisibility for Unshadowed {
    fn visibility(&self, _light: &Light, _world_pos: Vec3) -> f32 {
        1.0
    }
}

/// Analytic occluders: a point is shadowed when a sphere sits between it and the light
#[derive(Debug, Clone, Default)]
pub struct OccluderSpheres {
    spheres: Vec<BoundingSphere>,
}

impl OccluderSpheres {
    pub fn new(spheres: Vec<BoundingSphere>) -> Self {
        Self { spheres }
    }
}

impl ShadowVisibility for OccluderSpheres {
    fn visibility(&self, light: &Light, world_pos: Vec3) -> f32 {
        if !light.casts_shadow {
            return 1.0;
        }
        let (direction, max_distance) = match light.kind {
            LightKind::Point { position, .. } | LightKind::Spot { position, .. } => {
                let to_light = position - world_pos;
                (to_light.normalize_or_zero(), to_light.length())
            }
            LightKind::Directional { direction } => (-direction, f32::INFINITY),
        };
        let origin = world_pos + direction * SHADOW_BIAS;
        let blocked = self.spheres.iter().any(|sphere| {
            !sphere.contains(world_pos)
                && sphere
                    .ray_hit(origin, direction)
                    .is_some_and(|t| t < max_distance)
        });
        if blocked {
            0.0
        } else {
            1.0
        }
    }
}

/// Direction towards the light and its attenuation at `world_pos`,
/// `None` when the light does not reach the point
pub fn light_incidence(light: &Light, world_pos: Vec3) -> Option<(Vec3, f32)> {
    let (position, radius) = match light.kind {
        LightKind::Directional { direction } => return Some((-direction, 1.0)),
        LightKind::Point { position, radius } | LightKind::Spot { position, radius, .. } => {
            (position, radius)
        }
    };

    let to_light = position - world_pos;
    let dist = to_light.length();
    if dist >= radius {
        return None;
    }
    let l = to_light / dist.max(1e-4);
    let ratio = dist / radius;
    let falloff = 1.0 - ratio * ratio;
    let mut attenuation = falloff * falloff;

    if let LightKind::Spot {
        direction,
        inner_angle,
        outer_angle,
        ..
    } = light.kind
    {
        let cos_angle = (-l).dot(direction);
        let (cos_inner, cos_outer) = (inner_angle.cos(), outer_angle.cos());
        attenuation *= if cos_inner - cos_outer > 1e-4 {
            smoothstep(cos_outer, cos_inner, cos_angle)
        } else if cos_angle >= cos_outer {
            1.0
        } else {
            0.0
        };
    }

    (attenuation > 0.0).then_some((l, attenuation))
}

fn smoothstep(edge0: f32, edge1: f32, x: f32) -> f32 {
    let t = ((x - edge0) / (edge1 - edge0)).clamp(0.0, 1.0);
    t * t * (3.0 - 2.0 * t)
}

/// Blinn-Phong contribution of one light, before shadowing
pub fn shade_light(light: &Light, surface: &Surface, view_dir: Vec3) -> Vec3 {
    let Some((l, attenuation)) = light_incidence(light, surface.position) else {
        return Vec3::ZERO;
    };
    let n_dot_l = surface.normal.dot(l);
    if n_dot_l <= 0.0 {
        return Vec3::ZERO;
    }
    let h = (l + view_dir).normalize_or_zero();
    let shininess = 2.0 / (surface.roughness * surface.roughness).max(0.001);
    let highlight = surface.specular * surface.normal.dot(h).max(0.0).powf(shininess);
    let radiance = light.color * light.intensity * attenuation;
    (surface.albedo + Vec3::splat(highlight)) * radiance * n_dot_l
}

/// Final color of a surface lit by `lights`
pub fn shade_surface<'a>(
    surface: &Surface,
    eye: Vec3,
    lights: impl IntoIterator<Item = &'a Light>,
    ambient: Vec3,
    indirect: IndirectSample,
    shadows: &dyn ShadowVisibility,
) -> Vec3 {
    let view_dir = (eye - surface.position).normalize_or_zero();

    let mut color = if indirect.irradiance.w > 0.0 {
        surface.albedo * indirect.irradiance.truncate() / indirect.irradiance.w
    } else {
        surface.albedo * ambient
    };
    if indirect.reflection.w > 0.0 {
        color += surface.specular * indirect.reflection.truncate() / indirect.reflection.w;
    }

    for light in lights {
        let direct = shade_light(light, surface, view_dir);
        if direct != Vec3::ZERO {
            color += direct * shadows.visibility(light, surface.position);
        }
    }

    color + surface.albedo * surface.emission * EMISSION_RANGE
}

/// Lights the shading pass evaluates for the pixel `(px, py)` showing `world_pos`
pub fn lights_for_pixel<'a>(
    grid: &ClusterGrid,
    bins: &'a ClusterBins,
    lights: &'a FrameLights,
    camera: &Camera,
    (px, py): (u32, u32),
    world_pos: Vec3,
) -> impl Iterator<Item = &'a Light> + 'a {
    let cluster = grid.cluster_at(px, py, camera.view_depth(world_pos));
    bins.shading_lights(cluster)
        .filter_map(|index| lights.all().get(index as usize))
}
