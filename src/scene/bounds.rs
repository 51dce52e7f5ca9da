//! Bounding volumes used for clustering and shadow culling

use glam::{Mat4, Vec3};

/// Axis-aligned bounding box
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Aabb {
    pub min: Vec3,
    pub max: Vec3,
}

impl Aabb {
    pub fn new(min: Vec3, max: Vec3) -> Self {
        Self { min, max }
    }

    /// Smallest box containing every point
    pub fn from_points(points: impl IntoIterator<Item = Vec3>) -> Self {
        let mut min = Vec3::splat(f32::INFINITY);
        let mut max = Vec3::splat(f32::NEG_INFINITY);
        for p in points {
            min = min.min(p);
            max = max.max(p);
        }
        Self { min, max }
    }

    pub fn contains(&self, point: Vec3) -> bool {
        point.cmpge(self.min).all() && point.cmple(self.max).all()
    }

    /// Squared distance from `point` to the closest point of the box
    pub fn distance_squared(&self, point: Vec3) -> f32 {
        let closest = point.clamp(self.min, self.max);
        closest.distance_squared(point)
    }

    pub fn union(&self, other: &Aabb) -> Aabb {
        Aabb {
            min: self.min.min(other.min),
            max: self.max.max(other.max),
        }
    }
}

/// Bounding sphere
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingSphere {
    pub center: Vec3,
    pub radius: f32,
}

impl BoundingSphere {
    pub fn new(center: Vec3, radius: f32) -> Self {
        Self { center, radius }
    }

    pub fn intersects_aabb(&self, aabb: &Aabb) -> bool {
        aabb.distance_squared(self.center) <= self.radius * self.radius
    }

    pub fn intersects_sphere(&self, other: &BoundingSphere) -> bool {
        let r = self.radius + other.radius;
        self.center.distance_squared(other.center) <= r * r
    }

    pub fn contains(&self, point: Vec3) -> bool {
        self.center.distance_squared(point) <= self.radius * self.radius
    }

    /// Sphere enclosing this one after `transform` (scale taken as the largest axis scale)
    pub fn transformed(&self, transform: &Mat4) -> BoundingSphere {
        let scale = transform
            .x_axis
            .truncate()
            .length()
            .max(transform.y_axis.truncate().length())
            .max(transform.z_axis.truncate().length());
        BoundingSphere {
            center: transform.transform_point3(self.center),
            radius: self.radius * scale,
        }
    }

    /// Distance along `dir` (normalized) from `origin` to the first hit, if any
    pub fn ray_hit(&self, origin: Vec3, dir: Vec3) -> Option<f32> {
        let oc = origin - self.center;
        let b = oc.dot(dir);
        let c = oc.length_squared() - self.radius * self.radius;
        let discriminant = b * b - c;
        if discriminant < 0.0 {
            return None;
        }
        let sqrt = discriminant.sqrt();
        let near = -b - sqrt;
        let far = -b + sqrt;
        if near >= 0.0 {
            Some(near)
        } else if far >= 0.0 {
            Some(far)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sphere_aabb_intersection() {
        let aabb = Aabb::new(Vec3::ZERO, Vec3::ONE);
        assert!(BoundingSphere::new(Vec3::splat(0.5), 0.1).intersects_aabb(&aabb));
        assert!(BoundingSphere::new(Vec3::new(2.0, 0.5, 0.5), 1.0).intersects_aabb(&aabb));
        assert!(!BoundingSphere::new(Vec3::new(2.0, 2.0, 2.0), 1.0).intersects_aabb(&aabb));
    }

    #[test]
    fn test_from_points() {
        let aabb = Aabb::from_points([Vec3::new(1.0, -1.0, 0.0), Vec3::new(-2.0, 3.0, 1.0)]);
        assert_eq!(aabb.min, Vec3::new(-2.0, -1.0, 0.0));
        assert_eq!(aabb.max, Vec3::new(1.0, 3.0, 1.0));
    }

    #[test]
    fn test_ray_hit() {
        let sphere = BoundingSphere::new(Vec3::new(0.0, 0.0, -5.0), 1.0);
        let hit = sphere.ray_hit(Vec3::ZERO, Vec3::NEG_Z).unwrap();
        assert!((hit - 4.0).abs() < 1e-5);
        assert!(sphere.ray_hit(Vec3::ZERO, Vec3::Z).is_none());
    }

    #[test]
    fn test_transformed_sphere() {
        let sphere = BoundingSphere::new(Vec3::ZERO, 1.0);
        let moved = sphere.transformed(&Mat4::from_scale_rotation_translation(
            Vec3::new(1.0, 3.0, 1.0),
            glam::Quat::IDENTITY,
            Vec3::X,
        ));
        assert_eq!(moved.center, Vec3::X);
        assert!((moved.radius - 3.0).abs() < 1e-6);
    }
}
