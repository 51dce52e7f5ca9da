//! Deferred rendering pipeline
//!
//! Every frame [`DeferredRenderer::render_frame`] builds a fresh render graph:
//! 1. Depth prepass (optional) and G-buffer pass for opaque geometry
//! 2. Shadow pass into the shared atlas
//! 3. Indirect lighting from reflection probes
//! 4. Clustered light shading into `light_shading_color`
//! 5. Depth downscale, forward shading of transparent geometry and the
//!    upscale composite, when the frame has transparent draws
//!
//! The graph is compiled, recorded and submitted in one piece. A frame that
//! fails anywhere before submission leaves no trace on the GPU.

#[macro_use]
pub mod shaders;

pub mod depth_downscale;
pub mod draw;
pub mod forward_pass;
pub mod gbuffer_pass;
pub mod indirect_pass;
pub mod light_clustering;
pub mod lighting_pass;
pub mod shading;
pub mod shadow_pass;

pub use depth_downscale::DepthDownscalePass;
pub use draw::{DrawItem, DrawUniform};
pub use forward_pass::{ForwardPass, ForwardUpscalePass};
pub use gbuffer_pass::{DepthPrepassPass, GBufferPass, GBufferTargets};
pub use indirect_pass::{IndirectPass, IndirectTargets, ProbeBinding};
pub use light_clustering::{ClusterBins, ClusterGrid, GpuClusterRange};
pub use lighting_pass::{GpuLightingParams, LightShadingPass};
pub use shadow_pass::{ShadowAtlas, ShadowPass, ShadowPlan, ShadowView};

use std::sync::Arc;

use glam::Vec4;

use crate::backend::{GraphicsBackend, TextureHandle};
use crate::error::{RenderError, Result};
use crate::frame::{FrameContext, FrameLights, FrameTokens};
use crate::render_graph::{RenderGraph, RenderGraphExecutor, RenderTargetDescription, TextureSize};
use crate::resources::{
    ConstantSet, FrameUniforms, Material, MaterialDescriptor, MaterialId, MaterialLibrary, MaterialPass,
    RenderTargetPool, ShaderVariantCache, UniformRingBuffer, STANDARD_MATERIAL_SHADER,
};
use crate::scene::{LightId, SceneView};
use crate::RendererConfig;

use depth_downscale::{DEPTH_DOWNSCALE_SHADER, DEPTH_DOWNSCALE_WGSL};
use forward_pass::{FORWARD_UPSCALE_SHADER, FORWARD_UPSCALE_WGSL};
use gbuffer_pass::{MATERIAL_ENTRY_POINTS, STANDARD_MATERIAL_WGSL};
use indirect_pass::{probe_mip_count, INDIRECT_SHADER, INDIRECT_WGSL};
use lighting_pass::{LIGHT_SHADING_SHADER, LIGHT_SHADING_WGSL};
use shaders::FULLSCREEN_ENTRY_POINTS;

/// Name used for uniform allocations made before any pass runs
const FRAME_SETUP: &str = "Frame Setup";

/// What one call to [`DeferredRenderer::render_frame`] did
#[derive(Debug, Clone, PartialEq)]
pub struct FrameReport {
    pub frame_index: u64,
    /// Submitted passes in execution order
    pub pass_order: Vec<String>,
    pub barrier_count: usize,
    /// Lights that got atlas tiles this frame
    pub shadowed_lights: Vec<LightId>,
    /// Shadow casters rendered without shadows for lack of atlas space
    pub dropped_shadows: Vec<LightId>,
    /// Atlas subdivision level, 0 = full-size tiles
    pub shadow_level: u32,
    pub depth_prepass: bool,
    /// Transparent geometry was rendered
    pub forward: bool,
    pub presented: Option<TextureHandle>,
    /// Clusters whose light list was truncated
    pub cluster_overflow: usize,
    pub draw_count: usize,
}

/// Opaque, transparent and shadow caster draw lists of one frame
struct FrameDraws {
    opaque: Arc<[DrawItem]>,
    depth_only: Arc<[DrawItem]>,
    transparent: Arc<[DrawItem]>,
    average_shading_cost: f32,
}

/// Deferred renderer: long-lived resources plus per-frame graph construction
pub struct DeferredRenderer {
    config: RendererConfig,
    pool: RenderTargetPool,
    ring: UniformRingBuffer,
    shaders: ShaderVariantCache,
    materials: MaterialLibrary,
    atlas: ShadowAtlas,
    executor: RenderGraphExecutor,
    frame_index: u64,
}

impl DeferredRenderer {
    pub fn new<B: GraphicsBackend>(config: RendererConfig, backend: &mut B) -> Result<Self> {
        config.validate()?;

        let ring = UniformRingBuffer::new(
            backend,
            config.uniform_ring_size,
            config.frames_in_flight,
            config.uniform_alignment,
        )?;
        let shaders = ShaderVariantCache::new();
        register_builtin_shaders(&shaders);

        let renderer = Self {
            pool: RenderTargetPool::new(config.render_target_idle_frames),
            ring,
            shaders,
            materials: MaterialLibrary::new(),
            atlas: ShadowAtlas::new(config.shadow_atlas_size, config.shadow_atlas_tiles_per_side),
            executor: RenderGraphExecutor::new(config.worker_threads),
            frame_index: 0,
            config,
        };
        renderer.precompile(backend)?;

        log::info!(
            "Deferred renderer initialized on {} ({}x{}, {} clusters, {} recording threads)",
            backend.name(),
            renderer.config.width,
            renderer.config.height,
            renderer.config.cluster_count(),
            renderer.executor.worker_threads()
        );
        Ok(renderer)
    }

    /// Compile the shaders every frame needs so failures surface at startup
    fn precompile<B: GraphicsBackend>(&self, backend: &mut B) -> Result<()> {
        self.shaders
            .get_or_create(backend, LIGHT_SHADING_SHADER, &self.cluster_constants())?;
        self.shaders
            .get_or_create(backend, DEPTH_DOWNSCALE_SHADER, &self.downscale_constants())?;
        Ok(())
    }

    fn cluster_constants(&self) -> ConstantSet {
        let [x, y, z] = self.config.cluster_counts;
        ConstantSet::new()
            .with_u32("CLUSTER_COUNT_X", x)
            .with_u32("CLUSTER_COUNT_Y", y)
            .with_u32("CLUSTER_COUNT_Z", z)
            .with_u32("CLUSTER_COUNT", self.config.cluster_count())
    }

    fn downscale_constants(&self) -> ConstantSet {
        ConstantSet::new().with_u32("DOWNSCALE_FACTOR", self.config.forward_fraction)
    }

    /// Make a custom material shader available to [`MaterialDescriptor::with_shader`]
    pub fn register_shader_source(&self, source_id: &str, wgsl: &str) {
        self.shaders
            .register_source(source_id, wgsl, &MATERIAL_ENTRY_POINTS);
    }

    /// Compile a material's variants. Fails with `ShaderCompilation` when any variant does not build.
    pub fn register_material<B: GraphicsBackend>(
        &mut self,
        descriptor: MaterialDescriptor,
        backend: &mut B,
    ) -> Result<MaterialId> {
        self.materials.register(descriptor, &self.shaders, backend)
    }

    pub fn material(&self, id: MaterialId) -> Option<&Material> {
        self.materials.get(id)
    }

    pub fn config(&self) -> &RendererConfig {
        &self.config
    }

    /// Index the next frame will get
    pub fn frame_index(&self) -> u64 {
        self.frame_index
    }

    pub fn pool(&self) -> &RenderTargetPool {
        &self.pool
    }

    pub fn shader_cache(&self) -> &ShaderVariantCache {
        &self.shaders
    }

    pub fn atlas(&self) -> &ShadowAtlas {
        &self.atlas
    }

    /// Build, record and submit one frame.
    ///
    /// On error nothing was submitted and the frame's uniform slot stays free.
    pub fn render_frame<B: GraphicsBackend>(
        &mut self,
        scene: &SceneView,
        backend: &mut B,
    ) -> Result<FrameReport> {
        let frame_index = self.frame_index;
        self.frame_index += 1;

        self.pool.begin_frame(frame_index);
        let mut uniforms = self.ring.begin_frame(frame_index, backend)?;
        let result = self.build_frame(frame_index, scene, &mut uniforms, backend);
        let result = match result {
            Ok((mut submission, mut report)) => {
                submission.uniform_upload = Some(self.ring.end_frame(uniforms));
                report.draw_count = submission
                    .passes
                    .iter()
                    .map(|pass| pass.commands.draw_count())
                    .sum();
                match backend.submit(submission) {
                    Ok(()) => {
                        self.ring.mark_submitted(frame_index);
                        Ok(report)
                    }
                    Err(error) => Err(RenderError::Gpu(error)),
                }
            }
            Err(error) => {
                self.ring.abandon_frame(uniforms);
                Err(error)
            }
        };

        self.pool.end_frame(frame_index, backend);
        match &result {
            Ok(report) => log::trace!(
                "Frame {} submitted: {} passes, {} draws",
                frame_index,
                report.pass_order.len(),
                report.draw_count
            ),
            Err(error) => log::warn!("Frame {} abandoned: {}", frame_index, error),
        }
        result
    }

    fn build_frame<B: GraphicsBackend>(
        &mut self,
        frame_index: u64,
        scene: &SceneView,
        uniforms: &mut FrameUniforms,
        backend: &mut B,
    ) -> Result<(crate::backend::Submission, FrameReport)> {
        let resolution = (self.config.width, self.config.height);
        let camera = &scene.camera;
        let draws = self.resolve_draws(scene)?;
        let depth_prepass = !draws.opaque.is_empty()
            && self.config.depth_prepass.enabled(draws.average_shading_cost);
        let forward = !draws.transparent.is_empty();

        let lights = FrameLights::new(&scene.lights);
        let plan = self
            .atlas
            .plan(&lights, camera, self.config.directional_shadow_extent);
        let grid = ClusterGrid::new(self.config.cluster_counts, resolution, camera);
        let bins = grid.bin(&lights, self.config.max_lights_per_cluster);

        // Shader variants this frame depends on
        let light_shading = self
            .shaders
            .get_or_create(backend, LIGHT_SHADING_SHADER, &self.cluster_constants())?;
        let mut probes = Vec::with_capacity(scene.probes.len());
        for probe in &scene.probes {
            let mip_levels = probe_mip_count(probe.size, self.config.reflection_mip_count);
            let variant = self.shaders.get_or_create(
                backend,
                INDIRECT_SHADER,
                &ConstantSet::new().with_u32("IR_MIPMAP_COUNT", mip_levels),
            )?;
            probes.push(ProbeBinding {
                probe: *probe,
                program: variant.program(),
                mip_levels,
            });
        }
        let forward_programs = if forward {
            let downscale = self
                .shaders
                .get_or_create(backend, DEPTH_DOWNSCALE_SHADER, &self.downscale_constants())?;
            let reduced = RenderTargetDescription::sized(
                TextureSize::Fraction(self.config.forward_fraction),
                resolution,
                crate::backend::TextureFormat::Rgba16Float,
            );
            let upscale = self.shaders.get_or_create(
                backend,
                FORWARD_UPSCALE_SHADER,
                &ConstantSet::new()
                    .with_u32("SRC_WIDTH", reduced.width)
                    .with_u32("SRC_HEIGHT", reduced.height)
                    .with_u32("FB_WIDTH", resolution.0)
                    .with_u32("FB_HEIGHT", resolution.1),
            )?;
            Some((downscale.program(), upscale.program()))
        } else {
            None
        };

        // Frame-wide uniforms
        let gpu_lights: Vec<_> = lights
            .all()
            .iter()
            .zip(&plan.first_view)
            .map(|(light, first_view)| light.to_gpu_data(*first_view))
            .collect();
        let shadow_views: Vec<_> = plan.views.iter().map(ShadowView::gpu_data).collect();
        let atlas_size = self.atlas.size() as f32;
        let params = GpuLightingParams {
            ambient: self.config.ambient_color.extend(1.0),
            counts: [
                lights.directional_count() as u32,
                lights.len() as u32,
                plan.views.len() as u32,
                0,
            ],
            cluster_depth: grid.depth_params(),
            screen: Vec4::new(resolution.0 as f32, resolution.1 as f32, atlas_size, atlas_size),
        };
        let tokens = FrameTokens {
            camera: uniforms.push(FRAME_SETUP, &camera.uniform_data(resolution.0, resolution.1))?,
            lights: uniforms.push_slice(FRAME_SETUP, &gpu_lights)?,
            shadow_views: uniforms.push_slice(FRAME_SETUP, &shadow_views)?,
            clusters: uniforms.push_slice(FRAME_SETUP, bins.ranges())?,
            cluster_indices: uniforms.push_slice(FRAME_SETUP, bins.indices())?,
            lighting: uniforms.push(FRAME_SETUP, &params)?,
        };
        let frame = Arc::new(FrameContext::new(
            frame_index,
            resolution,
            camera.clone(),
            lights,
            tokens,
        ));

        // Graph
        let draws_per_chunk = self.config.draws_per_chunk;
        let mut graph = RenderGraph::new(resolution.0, resolution.1);
        let prepass_depth = if depth_prepass {
            let prepass = DepthPrepassPass::new(
                &mut graph,
                frame.clone(),
                draws.depth_only.clone(),
                draws_per_chunk,
            )?;
            let depth = prepass.depth();
            graph.add_pass(prepass)?;
            Some(depth)
        } else {
            None
        };

        let gbuffer = GBufferPass::new(
            &mut graph,
            frame.clone(),
            draws.opaque.clone(),
            draws_per_chunk,
            prepass_depth,
        )?;
        let gbuffer_targets = gbuffer.targets();
        graph.add_pass(gbuffer)?;

        let shadows = ShadowPass::new(
            &mut graph,
            frame.clone(),
            Arc::from(plan.views.clone()),
            draws.depth_only.clone(),
            self.atlas.size(),
        )?;
        let shadow_atlas = shadows.atlas();
        graph.add_pass(shadows)?;

        let indirect = IndirectPass::new(&mut graph, frame.clone(), gbuffer_targets, &probes)?;
        let indirect_targets = indirect.targets();
        graph.add_pass(indirect)?;

        let shading = LightShadingPass::new(
            &mut graph,
            frame.clone(),
            light_shading.program(),
            gbuffer_targets,
            shadow_atlas,
            indirect_targets,
        )?;
        let color = shading.color();
        graph.add_pass(shading)?;

        if let Some((downscale_program, upscale_program)) = forward_programs {
            let downscale = DepthDownscalePass::new(
                &mut graph,
                downscale_program,
                gbuffer_targets.depth,
                self.config.forward_fraction,
            )?;
            let forward_depth = downscale.target();
            graph.add_pass(downscale)?;

            let forward_pass = ForwardPass::new(
                &mut graph,
                frame.clone(),
                draws.transparent.clone(),
                draws_per_chunk,
                forward_depth,
                shadow_atlas,
            )?;
            let upscale = ForwardUpscalePass::new(
                &graph,
                upscale_program,
                &forward_pass,
                gbuffer_targets.depth,
                color,
            );
            graph.add_pass(forward_pass)?;
            graph.add_pass(upscale)?;
        }

        let compiled = graph.compile()?;
        let submission = self.executor.execute(
            &graph,
            &compiled,
            &mut self.pool,
            uniforms,
            backend,
            Some(color),
        )?;

        let report = FrameReport {
            frame_index,
            pass_order: compiled.pass_names().to_vec(),
            barrier_count: submission.barrier_count(),
            shadowed_lights: plan.shadowed_lights(),
            dropped_shadows: plan.dropped.clone(),
            shadow_level: self.atlas.level(),
            depth_prepass,
            forward,
            presented: submission.present,
            cluster_overflow: bins.overflowed_clusters(),
            draw_count: 0,
        };
        Ok((submission, report))
    }

    /// Split the visible renderables into per-pass draw lists
    fn resolve_draws(&self, scene: &SceneView) -> Result<FrameDraws> {
        let mut opaque = Vec::new();
        let mut depth_only = Vec::new();
        let mut transparent = Vec::new();
        let mut total_cost = 0.0;

        for renderable in &scene.renderables {
            let material = self
                .materials
                .get(renderable.material)
                .ok_or_else(|| RenderError::Recording {
                    pass: FRAME_SETUP.to_string(),
                    message: format!("unknown material #{}", renderable.material.index()),
                })?;

            if material.is_transparent() {
                if let Some(draw) = DrawItem::new(renderable, material, MaterialPass::Forward) {
                    let depth = scene.camera.view_depth(draw.bounds.center);
                    transparent.push((depth, draw));
                }
                continue;
            }

            total_cost += material.shading_cost();
            opaque.extend(DrawItem::new(renderable, material, MaterialPass::GBuffer));
            depth_only.extend(DrawItem::new(renderable, material, MaterialPass::DepthOnly));
        }

        // Back to front
        transparent.sort_by(|a, b| b.0.total_cmp(&a.0));
        let average_shading_cost = if opaque.is_empty() {
            0.0
        } else {
            total_cost / opaque.len() as f32
        };

        Ok(FrameDraws {
            opaque: Arc::from(opaque),
            depth_only: Arc::from(depth_only),
            transparent: transparent.into_iter().map(|(_, draw)| draw).collect(),
            average_shading_cost,
        })
    }

    /// Rebuild every GPU resource after the device was recreated.
    ///
    /// Old handles are dropped without being destroyed; material ids stay valid.
    pub fn reinitialize<B: GraphicsBackend>(&mut self, backend: &mut B) -> Result<()> {
        log::info!("Reinitializing deferred renderer on {}", backend.name());
        self.pool.forget_all();
        self.shaders.forget_all();
        self.ring = UniformRingBuffer::new(
            backend,
            self.config.uniform_ring_size,
            self.config.frames_in_flight,
            self.config.uniform_alignment,
        )?;
        self.atlas = ShadowAtlas::new(
            self.config.shadow_atlas_size,
            self.config.shadow_atlas_tiles_per_side,
        );
        self.precompile(backend)?;
        self.materials.rebuild(&self.shaders, backend)
    }

    /// Change the output resolution; pooled targets of the old size age out.
    pub fn resize(&mut self, width: u32, height: u32) -> Result<()> {
        let config = self.config.clone().with_resolution(width, height);
        config.validate()?;
        log::debug!("Resizing deferred renderer to {}x{}", width, height);
        self.config = config;
        Ok(())
    }

    /// Release every GPU resource owned by the renderer
    pub fn destroy<B: GraphicsBackend>(self, backend: &mut B) {
        let Self {
            mut pool,
            ring,
            shaders,
            ..
        } = self;
        pool.clear(backend);
        shaders.clear(backend);
        ring.destroy(backend);
    }
}

fn register_builtin_shaders(shaders: &ShaderVariantCache) {
    shaders.register_source(STANDARD_MATERIAL_SHADER, STANDARD_MATERIAL_WGSL, &MATERIAL_ENTRY_POINTS);
    shaders.register_source(LIGHT_SHADING_SHADER, LIGHT_SHADING_WGSL, &FULLSCREEN_ENTRY_POINTS);
    shaders.register_source(INDIRECT_SHADER, INDIRECT_WGSL, &FULLSCREEN_ENTRY_POINTS);
    shaders.register_source(DEPTH_DOWNSCALE_SHADER, DEPTH_DOWNSCALE_WGSL, &FULLSCREEN_ENTRY_POINTS);
    shaders.register_source(FORWARD_UPSCALE_SHADER, FORWARD_UPSCALE_WGSL, &FULLSCREEN_ENTRY_POINTS);
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::backend::{BackendError, BufferHandle, RecordingBackend};
    use crate::scene::{BoundingSphere, Camera, CameraUniformData, GpuLightData, Light, Mesh, Renderable};
    use crate::DepthPrepassMode;
    use glam::{Mat4, Vec3};

    /// Frame context with valid tokens and no lights
    pub(crate) fn test_frame(frame_index: u64, resolution: (u32, u32)) -> FrameContext {
        let mut backend = RecordingBackend::new();
        let mut ring = UniformRingBuffer::new(&mut backend, 64 * 1024, 1, 256).unwrap();
        let mut uniforms = ring.begin_frame(frame_index, &mut backend).unwrap();
        let camera = Camera::default();
        let camera_data: CameraUniformData = camera.uniform_data(resolution.0, resolution.1);
        let tokens = FrameTokens {
            camera: uniforms.push("Test", &camera_data).unwrap(),
            lights: uniforms.push_slice::<GpuLightData>("Test", &[]).unwrap(),
            shadow_views: uniforms.push_slice::<shadow_pass::GpuShadowView>("Test", &[]).unwrap(),
            clusters: uniforms.push_slice::<GpuClusterRange>("Test", &[]).unwrap(),
            cluster_indices: uniforms.push_slice::<u32>("Test", &[]).unwrap(),
            lighting: uniforms.push("Test", &GpuLightingParams::default()).unwrap(),
        };
        ring.abandon_frame(uniforms);
        FrameContext::new(frame_index, resolution, camera, FrameLights::default(), tokens)
    }

    fn renderer(backend: &mut RecordingBackend, config: RendererConfig) -> DeferredRenderer {
        DeferredRenderer::new(
            config
                .with_resolution(64, 32)
                .with_shadow_atlas(512, 4)
                .with_uniform_ring_size(256 * 1024)
                .with_worker_threads(2),
            backend,
        )
        .unwrap()
    }

    fn cube(material: MaterialId, position: Vec3) -> Renderable {
        let mesh = Mesh {
            vertex_buffer: BufferHandle(1),
            index_buffer: BufferHandle(2),
            index_count: 36,
            bounds: BoundingSphere::new(Vec3::ZERO, 0.9),
        };
        Renderable::new(Mat4::from_translation(position), mesh, material)
    }

    #[test]
    fn test_empty_scene_presents_cleared_output() {
        let mut backend = RecordingBackend::new();
        let mut renderer = renderer(&mut backend, RendererConfig::default());
        let report = renderer
            .render_frame(&SceneView::new(Camera::default()), &mut backend)
            .unwrap();

        assert_eq!(
            report.pass_order,
            vec!["G-Buffer", "Shadows", "Indirect Lighting", "Light Shading"]
        );
        assert!(!report.forward);
        assert!(!report.depth_prepass);
        assert!(report.presented.is_some());
        assert_eq!(backend.presented().len(), 1);
        // Only the light shading quad draws
        assert_eq!(report.draw_count, 1);
        assert!(backend.state().is_blend_opaque());
    }

    #[test]
    fn test_transparent_draws_add_forward_passes() {
        let mut backend = RecordingBackend::new();
        let mut renderer = renderer(&mut backend, RendererConfig::default());
        let wall = renderer
            .register_material(MaterialDescriptor::plastic(Vec3::ONE), &mut backend)
            .unwrap();
        let glass = renderer
            .register_material(MaterialDescriptor::glass(0.4), &mut backend)
            .unwrap();
        let scene = SceneView::new(Camera::default())
            .with_renderable(cube(wall, Vec3::ZERO))
            .with_renderable(cube(glass, Vec3::new(0.0, 0.0, 2.0)))
            .with_light(Light::point(1, Vec3::new(0.0, 2.0, 2.0), 5.0, Vec3::ONE, 1.0));

        let report = renderer.render_frame(&scene, &mut backend).unwrap();
        assert!(report.forward);
        assert_eq!(
            &report.pass_order[report.pass_order.len() - 3..],
            &["Depth Downscale", "Forward Shading", "Forward Upscale"]
        );

        let snapshots = backend.state().snapshots();
        for name in ["Forward Shading", "Forward Upscale"] {
            let snapshot = snapshots.iter().find(|s| s.pass == name).unwrap();
            assert!(snapshot.opaque_on_entry(), "{name} started blended");
            assert!(snapshot.opaque_on_exit(), "{name} left blending on");
        }
        assert!(backend.state().is_blend_opaque());
    }

    #[test]
    fn test_prepass_follows_shading_cost() {
        let mut backend = RecordingBackend::new();
        let mut renderer = renderer(
            &mut backend,
            RendererConfig::default().with_depth_prepass(DepthPrepassMode::CostThreshold(4.0)),
        );
        let cheap = renderer
            .register_material(
                MaterialDescriptor::plastic(Vec3::ONE).with_shading_cost(1.0),
                &mut backend,
            )
            .unwrap();
        let expensive = renderer
            .register_material(
                MaterialDescriptor::metal(Vec3::ONE, 0.2).with_shading_cost(12.0),
                &mut backend,
            )
            .unwrap();

        let report = renderer
            .render_frame(
                &SceneView::new(Camera::default()).with_renderable(cube(cheap, Vec3::ZERO)),
                &mut backend,
            )
            .unwrap();
        assert!(!report.depth_prepass);

        let report = renderer
            .render_frame(
                &SceneView::new(Camera::default()).with_renderable(cube(expensive, Vec3::ZERO)),
                &mut backend,
            )
            .unwrap();
        assert!(report.depth_prepass);
        assert_eq!(report.pass_order[0], "Depth Prepass");
        assert_eq!(report.pass_order[1], "G-Buffer");
    }

    #[test]
    fn test_unknown_material_skips_frame() {
        let mut backend = RecordingBackend::new();
        let mut renderer = renderer(&mut backend, RendererConfig::default());
        let scene = SceneView::new(Camera::default()).with_renderable(cube(MaterialId(7), Vec3::ZERO));

        let error = renderer.render_frame(&scene, &mut backend).unwrap_err();
        assert!(matches!(error, RenderError::Recording { .. }));
        assert!(backend.submissions().is_empty());

        // The next frame is unaffected
        renderer
            .render_frame(&SceneView::new(Camera::default()), &mut backend)
            .unwrap();
        assert_eq!(backend.submissions().len(), 1);
    }

    #[test]
    fn test_shadow_casters_get_atlas_tiles() {
        let mut backend = RecordingBackend::new();
        let mut renderer = renderer(&mut backend, RendererConfig::default());
        let scene = SceneView::new(Camera::default())
            .with_light(Light::point(1, Vec3::Y, 4.0, Vec3::ONE, 1.0).with_shadow(true))
            .with_light(Light::directional(2, Vec3::NEG_Y, Vec3::ONE, 1.0).with_shadow(true))
            .with_light(Light::point(3, Vec3::X, 4.0, Vec3::ONE, 1.0));

        let report = renderer.render_frame(&scene, &mut backend).unwrap();
        let mut shadowed = report.shadowed_lights.clone();
        shadowed.sort();
        assert_eq!(shadowed, vec![LightId(1), LightId(2)]);
        assert!(report.dropped_shadows.is_empty());
        // 6 cube faces and 1 directional view fit in 16 full-size tiles
        assert_eq!(report.shadow_level, 0);
    }

    #[test]
    fn test_submit_failure_leaves_renderer_usable() {
        let mut backend = RecordingBackend::new();
        let mut renderer = renderer(&mut backend, RendererConfig::default());
        backend.fail_next_submit(BackendError::SubmissionFailed("queue full".into()));
        let error = renderer
            .render_frame(&SceneView::new(Camera::default()), &mut backend)
            .unwrap_err();
        assert!(matches!(error, RenderError::Gpu(_)));

        renderer
            .render_frame(&SceneView::new(Camera::default()), &mut backend)
            .unwrap();
        assert_eq!(renderer.frame_index(), 2);
    }
}
