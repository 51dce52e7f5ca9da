//! Lights consumed by the shadow and light shading passes

use bytemuck::{Pod, Zeroable};
use glam::{Vec3, Vec4};

use crate::scene::BoundingSphere;

/// Stable identity of a light across frames, assigned by the scene
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LightId(pub u64);

/// Kind-specific geometry of a light
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LightKind {
    Point {
        position: Vec3,
        radius: f32,
    },
    Spot {
        position: Vec3,
        direction: Vec3,
        radius: f32,
        /// Full-intensity half angle, radians
        inner_angle: f32,
        /// Cutoff half angle, radians
        outer_angle: f32,
    },
    /// Infinitely distant light such as the sun
    Directional { direction: Vec3 },
}

impl LightKind {
    /// Type tag shared with the shaders
    pub fn gpu_tag(&self) -> f32 {
        match self {
            LightKind::Point { .. } => 0.0,
            LightKind::Spot { .. } => 1.0,
            LightKind::Directional { .. } => 2.0,
        }
    }
}

/// A light of any kind
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Light {
    pub id: LightId,
    pub kind: LightKind,
    pub color: Vec3,
    pub intensity: f32,
    pub casts_shadow: bool,
}

impl Light {
    pub fn point(id: u64, position: Vec3, radius: f32, color: Vec3, intensity: f32) -> Self {
        Self {
            id: LightId(id),
            kind: LightKind::Point { position, radius },
            color,
            intensity,
            casts_shadow: false,
        }
    }

    pub fn spot(
        id: u64,
        position: Vec3,
        direction: Vec3,
        radius: f32,
        inner_angle: f32,
        outer_angle: f32,
        color: Vec3,
        intensity: f32,
    ) -> Self {
        let outer_angle = outer_angle.clamp(0.0, std::f32::consts::PI);
        Self {
            id: LightId(id),
            kind: LightKind::Spot {
                position,
                direction: direction.normalize_or_zero(),
                radius,
                inner_angle: inner_angle.clamp(0.0, outer_angle),
                outer_angle,
            },
            color,
            intensity,
            casts_shadow: false,
        }
    }

    pub fn directional(id: u64, direction: Vec3, color: Vec3, intensity: f32) -> Self {
        Self {
            id: LightId(id),
            kind: LightKind::Directional {
                direction: direction.normalize_or_zero(),
            },
            color,
            intensity,
            casts_shadow: false,
        }
    }

    pub fn with_shadow(mut self, casts_shadow: bool) -> Self {
        self.casts_shadow = casts_shadow;
        self
    }

    pub fn is_directional(&self) -> bool {
        matches!(self.kind, LightKind::Directional { .. })
    }

    /// Number of shadow map views the light needs
    pub fn shadow_view_count(&self) -> u32 {
        match self.kind {
            LightKind::Point { .. } => 6,
            LightKind::Spot { .. } | LightKind::Directional { .. } => 1,
        }
    }

    /// Volume used for clustering; `None` for lights that reach everywhere.
    ///
    /// Spot lights use the tightest sphere around their cone. A cone wider
    /// than a hemisphere reaches behind its apex, so it gets the full range sphere.
    pub fn bounding_sphere(&self) -> Option<BoundingSphere> {
        match self.kind {
            LightKind::Point { position, radius } => Some(BoundingSphere::new(position, radius)),
            LightKind::Spot {
                position,
                direction,
                radius,
                outer_angle,
                ..
            } => {
                let (sin, cos) = outer_angle.sin_cos();
                if outer_angle >= std::f32::consts::FRAC_PI_2 {
                    Some(BoundingSphere::new(position, radius))
                } else if outer_angle > std::f32::consts::FRAC_PI_4 {
                    Some(BoundingSphere::new(
                        position + direction * (cos * radius),
                        sin * radius,
                    ))
                } else {
                    let sphere_radius = radius / (2.0 * cos);
                    Some(BoundingSphere::new(
                        position + direction * sphere_radius,
                        sphere_radius,
                    ))
                }
            }
            LightKind::Directional { .. } => None,
        }
    }

    /// Convert to GPU data format.
    ///
    /// `shadow_index` is the first entry of the light's shadow views, if it has any this frame.
    pub fn to_gpu_data(&self, shadow_index: Option<u32>) -> GpuLightData {
        let shadow = shadow_index.map_or(-1.0, |i| i as f32);
        let color_intensity = self.color.extend(self.intensity);
        match self.kind {
            LightKind::Point { position, radius } => GpuLightData {
                position_radius: position.extend(radius),
                color_intensity,
                direction_kind: Vec4::new(0.0, 0.0, 0.0, self.kind.gpu_tag()),
                params: Vec4::new(0.0, 0.0, shadow, 0.0),
            },
            LightKind::Spot {
                position,
                direction,
                radius,
                inner_angle,
                outer_angle,
            } => GpuLightData {
                position_radius: position.extend(radius),
                color_intensity,
                direction_kind: direction.extend(self.kind.gpu_tag()),
                params: Vec4::new(inner_angle.cos(), outer_angle.cos(), shadow, 0.0),
            },
            LightKind::Directional { direction } => GpuLightData {
                position_radius: Vec4::new(0.0, 0.0, 0.0, f32::MAX),
                color_intensity,
                direction_kind: direction.extend(self.kind.gpu_tag()),
                params: Vec4::new(0.0, 0.0, shadow, 0.0),
            },
        }
    }
}

/// GPU-friendly light data structure
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct GpuLightData {
    /// xyz = position, w = radius
    pub position_radius: Vec4,
    /// xyz = color, w = intensity
    pub color_intensity: Vec4,
    /// xyz = direction, w = light kind (0=point, 1=spot, 2=directional)
    pub direction_kind: Vec4,
    /// x = cos(inner_angle), y = cos(outer_angle), z = first shadow view or -1
    pub params: Vec4,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spot_bounding_sphere_contains_cone() {
        let light = Light::spot(
            1,
            Vec3::ZERO,
            Vec3::NEG_Z,
            10.0,
            0.2,
            0.4,
            Vec3::ONE,
            1.0,
        );
        let sphere = light.bounding_sphere().unwrap();
        // Apex and both rim points of the cone cap must be inside.
        assert!(sphere.contains(Vec3::ZERO));
        let rim = Vec3::new(0.4f32.sin() * 10.0, 0.0, -0.4f32.cos() * 10.0);
        assert!(sphere.center.distance(rim) <= sphere.radius + 1e-4);
        assert!(sphere.contains(Vec3::new(0.0, 0.0, -10.0)));
    }

    #[test]
    fn test_wide_spot_bounding_sphere() {
        let light = Light::spot(1, Vec3::ZERO, Vec3::X, 4.0, 1.0, 1.2, Vec3::ONE, 1.0);
        let sphere = light.bounding_sphere().unwrap();
        let rim = Vec3::new(1.2f32.cos() * 4.0, 1.2f32.sin() * 4.0, 0.0);
        assert!(sphere.center.distance(rim) <= sphere.radius + 1e-4);
    }

    #[test]
    fn test_hemisphere_spot_bounding_sphere_reaches_behind_apex() {
        let light = Light::spot(1, Vec3::ZERO, Vec3::NEG_Z, 8.0, 1.5, 2.0, Vec3::ONE, 1.0);
        let sphere = light.bounding_sphere().unwrap();
        // Sample the lit region: every direction within the outer angle, up to the range.
        for step in 0..=40 {
            let angle = 2.0 * step as f32 / 40.0;
            for distance in [0.5, 4.0, 7.9] {
                let point = Vec3::new(angle.sin(), 0.0, -angle.cos()) * distance;
                assert!(sphere.contains(point), "angle {angle} distance {distance}");
            }
        }
    }

    #[test]
    fn test_spot_angles_are_clamped() {
        let light = Light::spot(1, Vec3::ZERO, Vec3::X, 4.0, 5.0, 4.0, Vec3::ONE, 1.0);
        let LightKind::Spot {
            inner_angle,
            outer_angle,
            ..
        } = light.kind
        else {
            unreachable!()
        };
        assert_eq!(outer_angle, std::f32::consts::PI);
        assert_eq!(inner_angle, outer_angle);
    }

    #[test]
    fn test_directional_has_no_volume() {
        let light = Light::directional(2, Vec3::NEG_Y, Vec3::ONE, 1.0);
        assert!(light.bounding_sphere().is_none());
        assert_eq!(light.to_gpu_data(None).direction_kind.w, 2.0);
        assert_eq!(light.to_gpu_data(Some(3)).params.z, 3.0);
    }

    #[test]
    fn test_point_shadow_views() {
        let light = Light::point(3, Vec3::ZERO, 5.0, Vec3::ONE, 1.0).with_shadow(true);
        assert_eq!(light.shadow_view_count(), 6);
        assert!(light.casts_shadow);
        assert_eq!(light.to_gpu_data(None).params.z, -1.0);
    }
}
