//! Clustered light binning against brute-force geometry.

mod common;

use common::test_camera;
use deferred_renderer::frame::FrameLights;
use deferred_renderer::pipeline::shading::light_incidence;
use deferred_renderer::pipeline::ClusterGrid;
use deferred_renderer::scene::{Aabb, Light, LightKind};
use glam::Vec3;
use rstest::rstest;

/// Deterministic light field spread around the origin. Every fourth light is
/// a spot, cycling through narrow, wide and wider-than-hemisphere cones.
fn scattered_lights(count: u64) -> Vec<Light> {
    let mut state = 0x2545_f491_u32;
    let mut next = move || {
        state ^= state << 13;
        state ^= state >> 17;
        state ^= state << 5;
        state as f32 / u32::MAX as f32
    };
    let cones = [0.6, 1.0, 2.0];

    (0..count)
        .map(|id| {
            let position = Vec3::new(next() * 30.0 - 15.0, next() * 6.0 - 1.0, next() * 40.0 - 30.0);
            let radius = 0.5 + next() * 6.0;
            if id % 4 == 3 {
                let direction = Vec3::new(next() - 0.5, -1.0, next() - 0.5).normalize();
                let outer = cones[(id / 4) as usize % cones.len()];
                Light::spot(id, position, direction, radius, outer * 0.6, outer, Vec3::ONE, 2.0)
            } else {
                Light::point(id, position, radius, Vec3::ONE, 1.0)
            }
        })
        .collect()
}

/// Corners, center and face centers of a box
fn sample_points(cell: &Aabb) -> Vec<Vec3> {
    let center = (cell.min + cell.max) * 0.5;
    let mut points = vec![center];
    for i in 0..8 {
        points.push(Vec3::new(
            if i & 1 == 0 { cell.min.x } else { cell.max.x },
            if i & 2 == 0 { cell.min.y } else { cell.max.y },
            if i & 4 == 0 { cell.min.z } else { cell.max.z },
        ));
    }
    for axis in 0..3 {
        for bound in [cell.min[axis], cell.max[axis]] {
            let mut face = center;
            face[axis] = bound;
            points.push(face);
        }
    }
    points
}

fn light_position(light: &Light) -> Option<(Vec3, f32)> {
    match light.kind {
        LightKind::Point { position, radius } | LightKind::Spot { position, radius, .. } => {
            Some((position, radius))
        }
        LightKind::Directional { .. } => None,
    }
}

#[rstest]
#[case(0, [16, 8, 24])]
#[case(1, [16, 8, 24])]
#[case(17, [8, 4, 12])]
#[case(64, [16, 8, 24])]
#[case(200, [4, 4, 4])]
fn test_bins_cover_every_lit_point(#[case] light_count: u64, #[case] counts: [u32; 3]) {
    let camera = test_camera();
    let mut lights = scattered_lights(light_count);
    lights.push(Light::directional(9999, Vec3::NEG_Y, Vec3::ONE, 0.2));
    let frame_lights = FrameLights::new(&lights);
    let grid = ClusterGrid::new(counts, (320, 160), &camera);
    let bins = grid.bin(&frame_lights, u32::MAX);
    assert_eq!(bins.overflowed_clusters(), 0);
    assert_eq!(bins.global_count(), 1);

    let view = camera.view_matrix();
    let view_to_world = view.inverse();
    for cluster in 0..grid.cluster_count() {
        let cell = grid.cell_bounds(cluster).unwrap();
        let binned = bins.lights_in(cluster);

        // Every light that reaches a point of the cell is in its list
        for point in sample_points(cell) {
            let world = view_to_world.transform_point3(point);
            for (index, light) in frame_lights.all().iter().enumerate() {
                if light.is_directional() {
                    continue;
                }
                let lit = light_incidence(light, world).is_some_and(|(_, attenuation)| attenuation > 1e-4);
                if lit {
                    assert!(
                        binned.contains(&(index as u32)),
                        "light {:?} reaches {world} but is missing from cluster {cluster}",
                        light.id
                    );
                }
            }
        }

        // Nothing far out of range is listed. A cone's bounding sphere stays
        // within sqrt(2) of the range around the apex.
        for &index in binned {
            let light = &frame_lights.all()[index as usize];
            let (position, radius) = light_position(light).unwrap();
            let distance = cell.distance_squared(view.transform_point3(position)).sqrt();
            assert!(
                distance <= radius * std::f32::consts::SQRT_2 + 1e-3,
                "cluster {cluster} lists distant light {:?}",
                light.id
            );
        }
    }
}

#[test]
fn test_hemisphere_spot_reaches_cells_behind_it() {
    let camera = test_camera();
    let apex = Vec3::new(0.0, 0.0, 2.0);
    let spot = Light::spot(0, apex, Vec3::NEG_Z, 8.0, 1.5, 2.0, Vec3::ONE, 1.0);
    let frame_lights = FrameLights::new(&[spot]);
    let grid = ClusterGrid::new([32, 16, 64], (320, 160), &camera);
    let bins = grid.bin(&frame_lights, u32::MAX);

    // Along the axis, and along a ray past 90 degrees from it
    let rays = [Vec3::NEG_Z, Vec3::new(1.7f32.sin(), 0.0, -1.7f32.cos())];
    let mut lit_points = 0;
    for step in 0..160 {
        let world = apex + rays[step % 2] * (7.9 * (step / 2) as f32 / 80.0);
        if light_incidence(&spot, world).is_none() {
            continue;
        }
        let (uv, _) = camera.project(world);
        if !(0.0..1.0).contains(&uv.x) || !(0.0..1.0).contains(&uv.y) {
            continue;
        }
        let depth = camera.view_depth(world);
        if depth <= camera.near() {
            continue;
        }
        lit_points += 1;
        let cluster = grid.cluster_at((uv.x * 320.0) as u32, (uv.y * 160.0) as u32, depth);
        assert!(bins.lights_in(cluster).contains(&0), "{world} lit but cluster {cluster} is empty");
    }
    assert!(lit_points > 0);
}

#[test]
fn test_every_light_index_is_valid() {
    let lights = scattered_lights(48);
    let frame_lights = FrameLights::new(&lights);
    let grid = ClusterGrid::new([16, 8, 24], (320, 160), &test_camera());
    let bins = grid.bin(&frame_lights, 256);

    assert!(bins
        .indices()
        .iter()
        .all(|&index| (index as usize) < frame_lights.len()));
    let total: u32 = bins.ranges().iter().map(|r| r.count).sum();
    assert_eq!(total as usize, bins.indices().len());
}
