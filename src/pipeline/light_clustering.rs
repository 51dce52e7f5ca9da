//! Clustered light binning.
//!
//! The view frustum is split into `X × Y` screen tiles and `Z` exponential
//! depth slices. Each cell gets a view-space AABB; every point or spot light
//! is tested against the cells its bounding sphere can reach and recorded in
//! the cell's light list. Spot cones narrower than a hemisphere are also
//! tested against each cell's bounding sphere, which drops the cells beside
//! the cone that its bounding sphere still touches. Directional lights reach every cell and are not
//! binned: shaders loop over them first, then over the cell's list.
//!
//! Binning runs on the CPU while the graph is built. The result is uploaded
//! as two storage ranges: one `(offset, count)` pair per cell and a flat
//! index array.

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3, Vec4};

use crate::frame::FrameLights;
use crate::scene::{Aabb, BoundingSphere, Camera, Light, LightKind};

/// Light list range of one cluster, as read by the light shading shader
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct GpuClusterRange {
    pub offset: u32,
    pub count: u32,
}

/// Cell layout of one frame
#[derive(Debug, Clone)]
pub struct ClusterGrid {
    counts: [u32; 3],
    resolution: (u32, u32),
    near: f32,
    far: f32,
    view: Mat4,
    cells: Vec<Aabb>,
    /// Union of the cell x extents per (slice, column)
    columns: Vec<(f32, f32)>,
    /// Union of the cell y extents per (slice, row)
    rows: Vec<(f32, f32)>,
}

impl ClusterGrid {
    pub fn new(counts: [u32; 3], resolution: (u32, u32), camera: &Camera) -> Self {
        let counts = counts.map(|c| c.max(1));
        let [nx, ny, nz] = counts;
        let near = camera.near().max(f32::EPSILON);
        let far = camera.far().max(near * 1.0001);
        let inv_proj = camera.projection_matrix().inverse();

        let mut grid = Self {
            counts,
            resolution: (resolution.0.max(1), resolution.1.max(1)),
            near,
            far,
            view: camera.view_matrix(),
            cells: Vec::with_capacity((nx * ny * nz) as usize),
            columns: vec![(f32::INFINITY, f32::NEG_INFINITY); (nz * nx) as usize],
            rows: vec![(f32::INFINITY, f32::NEG_INFINITY); (nz * ny) as usize],
        };

        for z in 0..nz {
            let d0 = grid.slice_depth(z);
            let d1 = grid.slice_depth(z + 1);
            for y in 0..ny {
                for x in 0..nx {
                    let ndc_x = [x as f32 / nx as f32 * 2.0 - 1.0, (x + 1) as f32 / nx as f32 * 2.0 - 1.0];
                    let ndc_y = [1.0 - y as f32 / ny as f32 * 2.0, 1.0 - (y + 1) as f32 / ny as f32 * 2.0];
                    let mut corners = Vec::with_capacity(8);
                    for &px in &ndc_x {
                        for &py in &ndc_y {
                            let a = unproject(&inv_proj, Vec3::new(px, py, 0.0));
                            let b = unproject(&inv_proj, Vec3::new(px, py, 1.0));
                            corners.push(point_at_depth(a, b, d0));
                            corners.push(point_at_depth(a, b, d1));
                        }
                    }
                    let aabb = Aabb::from_points(corners);

                    let column = &mut grid.columns[(z * nx + x) as usize];
                    column.0 = column.0.min(aabb.min.x);
                    column.1 = column.1.max(aabb.max.x);
                    let row = &mut grid.rows[(z * ny + y) as usize];
                    row.0 = row.0.min(aabb.min.y);
                    row.1 = row.1.max(aabb.max.y);

                    grid.cells.push(aabb);
                }
            }
        }
        grid
    }

    pub fn counts(&self) -> [u32; 3] {
        self.counts
    }

    pub fn cluster_count(&self) -> usize {
        self.cells.len()
    }

    /// View depth where slice `k` begins; `k == Z` gives the far plane
    pub fn slice_depth(&self, k: u32) -> f32 {
        self.near * (self.far / self.near).powf(k as f32 / self.counts[2] as f32)
    }

    /// Depth slice containing a positive view depth, clamped to the grid
    pub fn slice_for_depth(&self, view_depth: f32) -> u32 {
        if view_depth <= self.near {
            return 0;
        }
        let t = (view_depth / self.near).ln() / (self.far / self.near).ln();
        ((t * self.counts[2] as f32).floor() as u32).min(self.counts[2] - 1)
    }

    pub fn cluster_index(&self, x: u32, y: u32, z: u32) -> usize {
        let [nx, ny, _] = self.counts;
        (x + y * nx + z * nx * ny) as usize
    }

    /// Cell of the pixel `(px, py)` (y down) at a positive view depth
    pub fn cluster_at(&self, px: u32, py: u32, view_depth: f32) -> usize {
        let [nx, ny, _] = self.counts;
        let (width, height) = self.resolution;
        let x = (((px as f32 + 0.5) * nx as f32 / width as f32) as u32).min(nx - 1);
        let y = (((py as f32 + 0.5) * ny as f32 / height as f32) as u32).min(ny - 1);
        self.cluster_index(x, y, self.slice_for_depth(view_depth))
    }

    /// View-space bounds of a cell
    pub fn cell_bounds(&self, cluster: usize) -> Option<&Aabb> {
        self.cells.get(cluster)
    }

    /// Light volume in view space, `None` for lights that reach every cell
    pub fn view_space_volume(&self, sphere: &BoundingSphere) -> BoundingSphere {
        BoundingSphere::new(self.view.transform_point3(sphere.center), sphere.radius)
    }

    /// Bin every local light of the frame into the cells it touches
    pub fn bin(&self, lights: &FrameLights, max_per_cluster: u32) -> ClusterBins {
        let [nx, ny, nz] = self.counts;
        let mut lists: Vec<Vec<u32>> = vec![Vec::new(); self.cells.len()];
        let first_local = lights.directional_count();

        for (offset, light) in lights.local().iter().enumerate() {
            let Some(world) = light.bounding_sphere() else {
                continue;
            };
            let sphere = self.view_space_volume(&world);
            let depth = -sphere.center.z;
            let (min_depth, max_depth) = (depth - sphere.radius, depth + sphere.radius);
            if max_depth < self.near || min_depth > self.far {
                continue;
            }
            let z0 = self.slice_for_depth(min_depth.max(self.near)).saturating_sub(1);
            let z1 = (self.slice_for_depth(max_depth.min(self.far)) + 1).min(nz - 1);
            let light_index = (first_local + offset) as u32;
            let cone = ViewCone::of(light, &self.view);

            for z in z0..=z1 {
                let xs: Vec<u32> = (0..nx)
                    .filter(|&x| overlaps(self.columns[(z * nx + x) as usize], sphere.center.x, sphere.radius))
                    .collect();
                for y in 0..ny {
                    if !overlaps(self.rows[(z * ny + y) as usize], sphere.center.y, sphere.radius) {
                        continue;
                    }
                    for &x in &xs {
                        let cluster = self.cluster_index(x, y, z);
                        let cell = &self.cells[cluster];
                        if sphere.intersects_aabb(cell)
                            && cone.map_or(true, |cone| cone.intersects_aabb(cell))
                        {
                            lists[cluster].push(light_index);
                        }
                    }
                }
            }
        }

        let mut ranges = Vec::with_capacity(lists.len());
        let mut indices = Vec::new();
        let mut overflowed = 0;
        for list in &lists {
            let count = if list.len() > max_per_cluster as usize {
                overflowed += 1;
                max_per_cluster as usize
            } else {
                list.len()
            };
            ranges.push(GpuClusterRange {
                offset: indices.len() as u32,
                count: count as u32,
            });
            indices.extend_from_slice(&list[..count]);
        }
        if overflowed > 0 {
            log::warn!(
                "{} clusters exceeded {} lights, extra lights dropped",
                overflowed,
                max_per_cluster
            );
        }

        ClusterBins {
            ranges,
            indices,
            global_count: first_local as u32,
            overflowed,
        }
    }

    /// Shader-facing parameters: x = near, y = far, z = ln(far / near), w unused
    pub fn depth_params(&self) -> Vec4 {
        Vec4::new(self.near, self.far, (self.far / self.near).ln(), 0.0)
    }
}

/// Per-cell light lists of one frame
#[derive(Debug, Clone, Default)]
pub struct ClusterBins {
    ranges: Vec<GpuClusterRange>,
    indices: Vec<u32>,
    global_count: u32,
    overflowed: usize,
}

impl ClusterBins {
    pub fn ranges(&self) -> &[GpuClusterRange] {
        &self.ranges
    }

    pub fn indices(&self) -> &[u32] {
        &self.indices
    }

    /// Binned light indices of one cell, ascending
    pub fn lights_in(&self, cluster: usize) -> &[u32] {
        match self.ranges.get(cluster) {
            Some(range) => {
                let start = range.offset as usize;
                &self.indices[start..start + range.count as usize]
            }
            None => &[],
        }
    }

    /// Every light that shades a pixel of the cell: the directional lights, then the binned ones
    pub fn shading_lights(&self, cluster: usize) -> impl Iterator<Item = u32> + '_ {
        (0..self.global_count).chain(self.lights_in(cluster).iter().copied())
    }

    /// Directional lights, at the front of the frame light list
    pub fn global_count(&self) -> u32 {
        self.global_count
    }

    /// Cells whose list was truncated
    pub fn overflowed_clusters(&self) -> usize {
        self.overflowed
    }
}

/// Spot cone in view space
#[derive(Debug, Clone, Copy)]
struct ViewCone {
    apex: Vec3,
    direction: Vec3,
    range: f32,
    sin: f32,
    cos: f32,
}

impl ViewCone {
    /// `None` for non-spot lights and cones of a hemisphere or wider
    fn of(light: &Light, view: &Mat4) -> Option<Self> {
        let LightKind::Spot {
            position,
            direction,
            radius,
            outer_angle,
            ..
        } = light.kind
        else {
            return None;
        };
        if outer_angle >= std::f32::consts::FRAC_PI_2 {
            return None;
        }
        let (sin, cos) = outer_angle.sin_cos();
        Some(Self {
            apex: view.transform_point3(position),
            direction: view.transform_vector3(direction).normalize_or_zero(),
            range: radius,
            sin,
            cos,
        })
    }

    /// False only when no point of the box's bounding sphere lies in the cone
    fn intersects_aabb(&self, aabb: &Aabb) -> bool {
        let center = (aabb.min + aabb.max) * 0.5;
        let radius = (aabb.max - aabb.min).length() * 0.5;
        let v = center - self.apex;
        let along = v.dot(self.direction);
        let across = (v.length_squared() - along * along).max(0.0).sqrt();
        // Lower bound of the distance to the cone's side, negative inside
        let side = self.cos * across - self.sin * along;
        side <= radius && along <= self.range + radius && along >= -radius
    }
}

fn unproject(inv_proj: &Mat4, ndc: Vec3) -> Vec3 {
    let p = *inv_proj * ndc.extend(1.0);
    p.truncate() / p.w
}

/// Point of the line through `a` and `b` at positive view depth `depth`
fn point_at_depth(a: Vec3, b: Vec3, depth: f32) -> Vec3 {
    let (da, db) = (-a.z, -b.z);
    let t = if (db - da).abs() > f32::EPSILON {
        (depth - da) / (db - da)
    } else {
        0.0
    };
    a + (b - a) * t
}

fn overlaps(extent: (f32, f32), center: f32, radius: f32) -> bool {
    extent.0 <= center + radius && extent.1 >= center - radius
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::{Light, Projection};

    fn camera() -> Camera {
        Camera::new(
            Vec3::new(0.0, 0.0, 10.0),
            Vec3::ZERO,
            Projection::perspective(60.0, 16.0 / 9.0, 0.5, 100.0),
        )
    }

    #[test]
    fn test_exponential_slices() {
        let grid = ClusterGrid::new([4, 4, 8], (320, 180), &camera());
        assert!((grid.slice_depth(0) - 0.5).abs() < 1e-5);
        assert!((grid.slice_depth(8) - 100.0).abs() < 1e-2);
        for k in 0..8 {
            let mid = (grid.slice_depth(k) * grid.slice_depth(k + 1)).sqrt();
            assert_eq!(grid.slice_for_depth(mid), k);
        }
        assert_eq!(grid.slice_for_depth(0.1), 0);
        assert_eq!(grid.slice_for_depth(1000.0), 7);
    }

    #[test]
    fn test_cluster_at_corners() {
        let grid = ClusterGrid::new([4, 2, 8], (400, 200), &camera());
        assert_eq!(grid.cluster_at(0, 0, 0.5), 0);
        assert_eq!(grid.cluster_at(399, 0, 0.5), 3);
        assert_eq!(grid.cluster_at(0, 199, 0.5), 4);
        assert_eq!(grid.cluster_at(399, 199, 100.0), grid.cluster_count() - 1);
    }

    #[test]
    fn test_cells_contain_pixel_points() {
        let cam = camera();
        let grid = ClusterGrid::new([8, 4, 12], (320, 160), &cam);
        let view = cam.view_matrix();
        let world = Vec3::new(1.5, -0.75, -4.0);
        let (uv, _) = cam.project(world);
        let px = (uv.x * 320.0) as u32;
        let py = (uv.y * 160.0) as u32;
        let cluster = grid.cluster_at(px, py, cam.view_depth(world));
        let bounds = grid.cell_bounds(cluster).unwrap();
        let padded = Aabb::new(bounds.min - Vec3::splat(0.1), bounds.max + Vec3::splat(0.1));
        assert!(padded.contains(view.transform_point3(world)));
    }

    #[test]
    fn test_directional_lights_are_global() {
        let grid = ClusterGrid::new([2, 2, 2], (64, 64), &camera());
        let lights = FrameLights::new(&[Light::directional(1, Vec3::NEG_Y, Vec3::ONE, 1.0)]);
        let bins = grid.bin(&lights, 16);
        assert!(bins.indices().is_empty());
        assert_eq!(bins.shading_lights(5).collect::<Vec<_>>(), vec![0]);
    }

    #[test]
    fn test_light_behind_camera_not_binned() {
        let grid = ClusterGrid::new([4, 4, 8], (64, 64), &camera());
        let lights = FrameLights::new(&[Light::point(1, Vec3::new(0.0, 0.0, 20.0), 2.0, Vec3::ONE, 1.0)]);
        let bins = grid.bin(&lights, 16);
        assert!(bins.indices().is_empty());
    }

    #[test]
    fn test_spot_cone_skips_cells_beside_it() {
        let grid = ClusterGrid::new([16, 8, 24], (320, 180), &camera());
        let spot = Light::spot(0, Vec3::new(-3.0, 1.0, 0.0), Vec3::X, 8.0, 0.1, 0.2, Vec3::ONE, 1.0);
        let sphere = spot.bounding_sphere().unwrap();
        let enclosing = Light::point(0, sphere.center, sphere.radius, Vec3::ONE, 1.0);

        let cone_bins = grid.bin(&FrameLights::new(&[spot]), 16);
        let sphere_bins = grid.bin(&FrameLights::new(&[enclosing]), 16);
        let cells = |bins: &ClusterBins| -> Vec<usize> {
            (0..grid.cluster_count())
                .filter(|&c| !bins.lights_in(c).is_empty())
                .collect()
        };
        let (cone_cells, sphere_cells) = (cells(&cone_bins), cells(&sphere_bins));
        assert!(!cone_cells.is_empty());
        assert!(cone_cells.iter().all(|c| sphere_cells.contains(c)));
        assert!(cone_cells.len() < sphere_cells.len());
    }

    #[test]
    fn test_cone_keeps_cells_it_lights() {
        let cone = ViewCone::of(
            &Light::spot(0, Vec3::ZERO, Vec3::NEG_Z, 10.0, 0.3, 0.5, Vec3::ONE, 1.0),
            &Mat4::IDENTITY,
        )
        .unwrap();
        let on_axis = Aabb::new(Vec3::new(-0.1, -0.1, -5.1), Vec3::new(0.1, 0.1, -4.9));
        let beside = Aabb::new(Vec3::new(7.9, -0.1, -2.1), Vec3::new(8.1, 0.1, -1.9));
        let behind = Aabb::new(Vec3::new(-0.1, -0.1, 1.9), Vec3::new(0.1, 0.1, 2.1));
        let past_range = Aabb::new(Vec3::new(-0.1, -0.1, -12.1), Vec3::new(0.1, 0.1, -11.9));
        assert!(cone.intersects_aabb(&on_axis));
        assert!(!cone.intersects_aabb(&beside));
        assert!(!cone.intersects_aabb(&behind));
        assert!(!cone.intersects_aabb(&past_range));
    }

    #[test]
    fn test_overflow_truncates() {
        let grid = ClusterGrid::new([1, 1, 1], (64, 64), &camera());
        let lights: Vec<Light> = (0..5)
            .map(|i| Light::point(i, Vec3::new(0.0, 0.0, -(i as f32)), 3.0, Vec3::ONE, 1.0))
            .collect();
        let bins = grid.bin(&FrameLights::new(&lights), 3);
        assert_eq!(bins.lights_in(0), &[0, 1, 2]);
        assert_eq!(bins.overflowed_clusters(), 1);
    }
}
