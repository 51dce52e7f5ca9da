//! Shadow atlas and the pass that renders into it.
//!
//! The atlas is one depth texture split into a grid of square tiles. Point
//! lights take six tiles (one per cube face), spot and directional lights
//! one. Tile assignments persist across frames: a light keeps its tiles while
//! it stays visible, lights that disappear give theirs back, and new lights
//! take the lowest free tiles. When the frame asks for more tiles than the
//! grid holds, the grid is subdivided so every light still gets a map at a
//! lower resolution.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3, Vec4};

use super::draw::{record_draws, DrawItem, DrawUniform};
use super::shaders::CAMERA_BINDING;
use crate::backend::*;
use crate::error::{GraphError, Result};
use crate::frame::{FrameContext, FrameLights};
use crate::render_graph::*;
use crate::scene::{BoundingSphere, Camera, CameraUniformData, LightId, LightKind};

/// Near plane of point and spot shadow projections
const SHADOW_NEAR: f32 = 0.05;
/// How many times the grid may be split in four
const MAX_SUBDIVISION: u32 = 2;
/// Tiles are never split below this many texels per side
const MIN_TILE_SIZE: u32 = 16;

/// View direction and up vector of each cube face, in the order the shaders use
const CUBE_FACES: [(Vec3, Vec3); 6] = [
    (Vec3::X, Vec3::Y),
    (Vec3::NEG_X, Vec3::Y),
    (Vec3::Y, Vec3::Z),
    (Vec3::NEG_Y, Vec3::Z),
    (Vec3::Z, Vec3::Y),
    (Vec3::NEG_Z, Vec3::Y),
];

/// One depth rendering of one light into one atlas tile
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ShadowView {
    pub light: LightId,
    /// Index of the light in the frame light list
    pub light_index: usize,
    pub face: u32,
    pub tile: u32,
    pub viewport: Viewport,
    pub view: Mat4,
    pub proj: Mat4,
    /// Origin of the projection
    pub eye: Vec3,
    /// xy = offset, zw = scale in atlas uv
    pub atlas_rect: Vec4,
    /// Only casters touching this volume are drawn
    pub cull: Option<BoundingSphere>,
}

impl ShadowView {
    pub fn view_proj(&self) -> Mat4 {
        self.proj * self.view
    }

    pub fn gpu_data(&self) -> GpuShadowView {
        GpuShadowView {
            view_proj: self.view_proj(),
            atlas_rect: self.atlas_rect,
        }
    }

    /// Camera block the material vertex shader renders the view with
    fn camera_data(&self, near: f32, far: f32) -> CameraUniformData {
        let view_proj = self.view_proj();
        CameraUniformData {
            view: self.view,
            proj: self.proj,
            view_proj,
            inv_view_proj: view_proj.inverse(),
            position: self.eye.extend(1.0),
            near_far_size: Vec4::new(near, far, self.viewport.width, self.viewport.height),
        }
    }
}

/// Shadow view as read by the shaders
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct GpuShadowView {
    pub view_proj: Mat4,
    pub atlas_rect: Vec4,
}

/// Atlas layout for one frame
#[derive(Debug, Clone, Default)]
pub struct ShadowPlan {
    pub views: Vec<ShadowView>,
    /// First view of each frame light, `None` when it renders without shadows
    pub first_view: Vec<Option<u32>>,
    /// Shadow casters without a shadow map: those that did not fit, then repeated ids
    pub dropped: Vec<LightId>,
}

impl ShadowPlan {
    pub fn shadowed_lights(&self) -> Vec<LightId> {
        let mut lights: Vec<LightId> = self.views.iter().map(|v| v.light).collect();
        lights.dedup();
        lights
    }
}

/// Persistent tile allocator of the shadow atlas
#[derive(Debug, Clone)]
pub struct ShadowAtlas {
    size: u32,
    base_tiles: u32,
    level: u32,
    assignments: BTreeMap<LightId, Vec<u32>>,
    free: BTreeSet<u32>,
}

impl ShadowAtlas {
    pub fn new(size: u32, tiles_per_side: u32) -> Self {
        let mut atlas = Self {
            size: size.max(1),
            base_tiles: tiles_per_side.max(1),
            level: 0,
            assignments: BTreeMap::new(),
            free: BTreeSet::new(),
        };
        atlas.reset(0);
        atlas
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    /// Current subdivision level, 0 at full tile resolution
    pub fn level(&self) -> u32 {
        self.level
    }

    pub fn tiles_per_side(&self) -> u32 {
        self.tiles_at(self.level)
    }

    pub fn tile_size(&self) -> u32 {
        self.size / self.tiles_per_side()
    }

    pub fn capacity(&self) -> usize {
        let tiles = self.tiles_per_side() as usize;
        tiles * tiles
    }

    pub fn free_tiles(&self) -> usize {
        self.free.len()
    }

    pub fn tiles_of(&self, light: LightId) -> Option<&[u32]> {
        self.assignments.get(&light).map(Vec::as_slice)
    }

    fn tiles_at(&self, level: u32) -> u32 {
        self.base_tiles << level
    }

    fn max_level(&self) -> u32 {
        let mut level = 0;
        while level < MAX_SUBDIVISION && self.size / self.tiles_at(level + 1) >= MIN_TILE_SIZE {
            level += 1;
        }
        level
    }

    fn reset(&mut self, level: u32) {
        self.level = level;
        self.assignments.clear();
        let capacity = self.tiles_at(level) * self.tiles_at(level);
        self.free = (0..capacity).collect();
    }

    /// Pixel rectangle of a tile
    pub fn tile_viewport(&self, tile: u32) -> Viewport {
        let tiles = self.tiles_per_side();
        let size = self.tile_size() as f32;
        Viewport {
            x: (tile % tiles) as f32 * size,
            y: (tile / tiles) as f32 * size,
            width: size,
            height: size,
        }
    }

    fn atlas_rect(&self, tile: u32) -> Vec4 {
        let viewport = self.tile_viewport(tile);
        let size = self.size as f32;
        Vec4::new(
            viewport.x / size,
            viewport.y / size,
            viewport.width / size,
            viewport.height / size,
        )
    }

    /// Assign tiles for this frame's shadow casters and build their views
    pub fn plan(&mut self, lights: &FrameLights, camera: &Camera, directional_extent: f32) -> ShadowPlan {
        // Tiles are keyed by light id; a repeated id renders unshadowed.
        let mut seen = BTreeSet::new();
        let mut duplicates = Vec::new();
        let casters: Vec<(usize, &crate::scene::Light)> = lights
            .shadow_casters()
            .filter(|(_, light)| {
                let first = seen.insert(light.id);
                if !first {
                    duplicates.push(light.id);
                }
                first
            })
            .collect();
        let demand: usize = casters.iter().map(|(_, l)| l.shadow_view_count() as usize).sum();

        let max_level = self.max_level();
        let mut level = 0;
        while level < max_level && (self.tiles_at(level) * self.tiles_at(level)) < demand as u32 {
            level += 1;
        }
        if level != self.level {
            log::debug!(
                "Shadow atlas level {} -> {} for {} views",
                self.level,
                level,
                demand
            );
            self.reset(level);
        }

        // Give back tiles of lights that left, or whose view count changed.
        let wanted: BTreeMap<LightId, usize> = casters
            .iter()
            .map(|(_, l)| (l.id, l.shadow_view_count() as usize))
            .collect();
        let stale: Vec<LightId> = self
            .assignments
            .iter()
            .filter(|(id, tiles)| wanted.get(*id) != Some(&tiles.len()))
            .map(|(id, _)| *id)
            .collect();
        for id in stale {
            if let Some(tiles) = self.assignments.remove(&id) {
                self.free.extend(tiles);
            }
        }

        let mut plan = ShadowPlan {
            views: Vec::new(),
            first_view: vec![None; lights.len()],
            dropped: Vec::new(),
        };
        if !duplicates.is_empty() {
            log::warn!(
                "Shadow casting lights share ids {:?}; only the first of each gets a shadow map",
                duplicates
            );
        }

        for (index, light) in casters {
            let needed = light.shadow_view_count() as usize;
            if !self.assignments.contains_key(&light.id) {
                if self.free.len() < needed {
                    plan.dropped.push(light.id);
                    continue;
                }
                let tiles: Vec<u32> = self.free.iter().take(needed).copied().collect();
                for tile in &tiles {
                    self.free.remove(tile);
                }
                self.assignments.insert(light.id, tiles);
            }
            let Some(tiles) = self.assignments.get(&light.id) else {
                continue;
            };

            plan.first_view[index] = Some(plan.views.len() as u32);
            for (face, &tile) in tiles.iter().enumerate() {
                let (eye, view, proj, cull) = light_view(light, face, camera, directional_extent);
                plan.views.push(ShadowView {
                    light: light.id,
                    light_index: index,
                    face: face as u32,
                    tile,
                    viewport: self.tile_viewport(tile),
                    view,
                    proj,
                    eye,
                    atlas_rect: self.atlas_rect(tile),
                    cull,
                });
            }
        }

        let unfit = plan.dropped.len();
        plan.dropped.extend(duplicates);
        if unfit > 0 {
            log::warn!(
                "{} shadow casting lights did not fit in the atlas and render unshadowed",
                unfit
            );
        }
        plan
    }
}

fn up_for(direction: Vec3) -> Vec3 {
    if direction.abs_diff_eq(Vec3::Y, 1e-3) || direction.abs_diff_eq(Vec3::NEG_Y, 1e-3) {
        Vec3::Z
    } else {
        Vec3::Y
    }
}

/// Eye, view, projection and culling volume of one face of a light
fn light_view(
    light: &crate::scene::Light,
    face: usize,
    camera: &Camera,
    directional_extent: f32,
) -> (Vec3, Mat4, Mat4, Option<BoundingSphere>) {
    match light.kind {
        LightKind::Point { position, radius } => {
            let (direction, up) = CUBE_FACES[face % 6];
            let view = Mat4::look_to_rh(position, direction, up);
            let proj = Mat4::perspective_rh(std::f32::consts::FRAC_PI_2, 1.0, SHADOW_NEAR, radius.max(SHADOW_NEAR * 2.0));
            (position, view, proj, light.bounding_sphere())
        }
        LightKind::Spot {
            position,
            direction,
            radius,
            outer_angle,
            ..
        } => {
            let view = Mat4::look_to_rh(position, direction, up_for(direction));
            let fov = (outer_angle * 2.0).clamp(0.01, std::f32::consts::PI - 0.01);
            let proj = Mat4::perspective_rh(fov, 1.0, SHADOW_NEAR, radius.max(SHADOW_NEAR * 2.0));
            (position, view, proj, light.bounding_sphere())
        }
        LightKind::Directional { direction } => {
            let extent = directional_extent.max(f32::EPSILON);
            let eye = camera.position - direction * extent;
            let view = Mat4::look_to_rh(eye, direction, up_for(direction));
            let proj = Mat4::orthographic_rh(-extent, extent, -extent, extent, 0.0, extent * 2.0);
            (eye, view, proj, None)
        }
    }
}

/// Depth of every shadow caster into its lights' atlas tiles
pub struct ShadowPass {
    frame: Arc<FrameContext>,
    views: Arc<[ShadowView]>,
    casters: Arc<[DrawItem]>,
    atlas: RenderTargetHandle,
}

impl ShadowPass {
    pub fn new(
        graph: &mut RenderGraph,
        frame: Arc<FrameContext>,
        views: Arc<[ShadowView]>,
        casters: Arc<[DrawItem]>,
        atlas_size: u32,
    ) -> std::result::Result<Self, GraphError> {
        let atlas = graph.new_render_target(
            "shadow_atlas",
            RenderTargetDescription::new(atlas_size, atlas_size, TextureFormat::Depth32Float),
        )?;
        Ok(Self {
            frame,
            views,
            casters,
            atlas,
        })
    }

    pub fn atlas(&self) -> RenderTargetHandle {
        self.atlas
    }

    fn casters_for<'a>(&'a self, view: &'a ShadowView) -> impl Iterator<Item = &'a DrawItem> + 'a {
        self.casters.iter().filter(move |draw| match &view.cull {
            Some(volume) => volume.intersects_sphere(&draw.bounds),
            None => true,
        })
    }
}

impl RenderPass for ShadowPass {
    fn name(&self) -> &str {
        "Shadows"
    }

    fn setup(&self, ctx: &mut PassSetupContext) {
        ctx.write(self.atlas, PipelineStage::LateFragmentTests);
    }

    /// One chunk per shadow view
    fn chunk_count(&self) -> u32 {
        self.views.len().max(1) as u32
    }

    fn chunk_uniforms(&self, chunk: u32) -> UniformRequest {
        match self.views.get(chunk as usize) {
            Some(view) => UniformRequest::of::<CameraUniformData>(1)
                .and::<DrawUniform>(self.casters_for(view).count()),
            None => UniformRequest::NONE,
        }
    }

    fn record(&self, ctx: &mut PassRecordContext) -> Result<()> {
        let atlas = ctx.texture(self.atlas)?;
        let load = if ctx.chunk_index() == 0 {
            DepthLoadOp::Clear(1.0)
        } else {
            DepthLoadOp::Load
        };
        ctx.commands().begin_render_pass(
            self.name(),
            Vec::new(),
            Some(DepthAttachment {
                texture: atlas,
                load,
                store: StoreOp::Store,
                read_only: false,
            }),
        );

        if let Some(view) = self.views.get(ctx.chunk_index() as usize) {
            ctx.commands().set_viewport(view.viewport);
            ctx.commands().set_depth_state(DepthState::LESS_WRITE);
            let far = self.frame.camera().far();
            let camera = ctx.push_uniforms(&view.camera_data(SHADOW_NEAR, far))?;
            ctx.bind_uniforms(CAMERA_BINDING, &camera)?;
            record_draws(ctx, self.casters_for(view))?;
        }

        ctx.commands().end_render_pass();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::{Light, Projection};

    fn camera() -> Camera {
        Camera::new(Vec3::new(0.0, 2.0, 8.0), Vec3::ZERO, Projection::default())
    }

    fn point(id: u64) -> Light {
        Light::point(id, Vec3::new(id as f32, 1.0, 0.0), 5.0, Vec3::ONE, 1.0).with_shadow(true)
    }

    fn spot(id: u64) -> Light {
        Light::spot(id, Vec3::Y * 3.0, Vec3::NEG_Y, 6.0, 0.3, 0.5, Vec3::ONE, 1.0).with_shadow(true)
    }

    #[test]
    fn test_tiles_per_light_kind() {
        let mut atlas = ShadowAtlas::new(1024, 4);
        let lights = FrameLights::new(&[point(1), spot(2)]);
        let plan = atlas.plan(&lights, &camera(), 20.0);
        assert_eq!(plan.views.len(), 7);
        assert_eq!(atlas.tiles_of(LightId(1)).unwrap().len(), 6);
        assert_eq!(atlas.tiles_of(LightId(2)).unwrap(), &[6]);
        assert_eq!(plan.first_view, vec![Some(0), Some(6)]);
        assert_eq!(atlas.free_tiles(), 16 - 7);
    }

    #[test]
    fn test_assignments_are_stable() {
        let mut atlas = ShadowAtlas::new(1024, 4);
        let lights = FrameLights::new(&[spot(1), spot(2), spot(3)]);
        atlas.plan(&lights, &camera(), 20.0);
        let before = atlas.tiles_of(LightId(3)).unwrap().to_vec();
        atlas.plan(&lights, &camera(), 20.0);
        assert_eq!(atlas.tiles_of(LightId(3)).unwrap(), before.as_slice());
    }

    #[test]
    fn test_evicted_tiles_are_reused() {
        let mut atlas = ShadowAtlas::new(1024, 4);
        atlas.plan(&FrameLights::new(&[spot(1), spot(2)]), &camera(), 20.0);
        let freed = atlas.tiles_of(LightId(1)).unwrap().to_vec();

        // Light 1 left the view, light 3 appears and takes its tile.
        atlas.plan(&FrameLights::new(&[spot(2), spot(3)]), &camera(), 20.0);
        assert!(atlas.tiles_of(LightId(1)).is_none());
        assert_eq!(atlas.tiles_of(LightId(3)).unwrap(), freed.as_slice());
        assert_eq!(atlas.tiles_of(LightId(2)).unwrap(), &[1]);
    }

    #[test]
    fn test_demand_lowers_resolution() {
        let mut atlas = ShadowAtlas::new(1024, 2);
        let lights = FrameLights::new(&[point(1)]);
        atlas.plan(&lights, &camera(), 20.0);
        assert_eq!(atlas.level(), 1);
        assert_eq!(atlas.tile_size(), 256);

        // Back to full resolution once the demand fits.
        atlas.plan(&FrameLights::new(&[spot(2)]), &camera(), 20.0);
        assert_eq!(atlas.level(), 0);
        assert_eq!(atlas.tile_size(), 512);
    }

    #[test]
    fn test_overflow_drops_lights() {
        let mut atlas = ShadowAtlas::new(64, 1);
        // 64 texels split twice gives 16 tiles at 16 texels.
        let lights: Vec<Light> = (0..3).map(point).collect();
        let plan = atlas.plan(&FrameLights::new(&lights), &camera(), 20.0);
        assert_eq!(atlas.capacity(), 16);
        assert_eq!(plan.dropped, vec![LightId(2)]);
        assert_eq!(plan.first_view[2], None);
        assert_eq!(plan.shadowed_lights(), vec![LightId(0), LightId(1)]);
    }

    #[test]
    fn test_repeated_light_id_gets_no_tiles() {
        let mut atlas = ShadowAtlas::new(1024, 4);
        let twin = Light::spot(1, Vec3::new(4.0, 3.0, 0.0), Vec3::NEG_Y, 6.0, 0.3, 0.5, Vec3::ONE, 1.0)
            .with_shadow(true);
        let plan = atlas.plan(&FrameLights::new(&[spot(1), twin, spot(2)]), &camera(), 20.0);

        assert_eq!(plan.first_view, vec![Some(0), None, Some(1)]);
        assert_eq!(plan.views.len(), 2);
        assert_eq!(plan.dropped, vec![LightId(1)]);
        assert_eq!(atlas.tiles_of(LightId(1)).unwrap(), &[0]);
        assert_eq!(atlas.tiles_of(LightId(2)).unwrap(), &[1]);
        assert_ne!(plan.views[0].tile, plan.views[1].tile);
    }

    #[test]
    fn test_point_faces_cover_directions() {
        let mut atlas = ShadowAtlas::new(1024, 4);
        let light = point(1);
        let plan = atlas.plan(&FrameLights::new(&[light]), &camera(), 20.0);
        let LightKind::Point { position, .. } = light.kind else {
            unreachable!()
        };
        for (face, (direction, _)) in CUBE_FACES.iter().enumerate() {
            let clip = plan.views[face].view_proj() * (position + *direction * 2.0).extend(1.0);
            let ndc = clip.truncate() / clip.w;
            assert!(ndc.x.abs() < 1e-3 && ndc.y.abs() < 1e-3, "face {face}");
            assert!((0.0..=1.0).contains(&ndc.z));
        }
    }

    #[test]
    fn test_atlas_rect_matches_viewport() {
        let atlas = ShadowAtlas::new(1024, 4);
        let rect = atlas.atlas_rect(5);
        assert_eq!(rect, Vec4::new(0.25, 0.25, 0.25, 0.25));
        assert_eq!(atlas.tile_viewport(5).x, 256.0);
    }
}
