//! Per-frame scene snapshot shared by every pass of one render graph.
//!
//! A [`FrameContext`] is built once per frame before the graph is assembled.
//! It holds the camera, the visible lights split by kind and the uniform
//! tokens allocated for this frame from the ring buffer. Passes keep an
//! `Arc<FrameContext>` and read it from worker threads while recording.
//! Dropping the context at the end of the frame is all it takes to release
//! the tokens; the ring reuses their slot once the GPU is done with it.

use crate::resources::UniformToken;
use crate::scene::{Camera, CameraUniformData, Light};

/// Visible lights of one frame.
///
/// Directional lights come first so shaders can loop over them without a
/// cluster lookup; point and spot lights follow in scene order. Indices into
/// [`FrameLights::all`] are the light indices used by clustering and the GPU
/// light list.
#[derive(Debug, Clone, Default)]
pub struct FrameLights {
    lights: Vec<Light>,
    directional_count: usize,
}

impl FrameLights {
    pub fn new(lights: &[Light]) -> Self {
        let mut ordered: Vec<Light> = lights.iter().filter(|l| l.is_directional()).copied().collect();
        let directional_count = ordered.len();
        ordered.extend(lights.iter().filter(|l| !l.is_directional()).copied());
        Self {
            lights: ordered,
            directional_count,
        }
    }

    pub fn all(&self) -> &[Light] {
        &self.lights
    }

    pub fn directional(&self) -> &[Light] {
        &self.lights[..self.directional_count]
    }

    /// Point and spot lights
    pub fn local(&self) -> &[Light] {
        &self.lights[self.directional_count..]
    }

    pub fn directional_count(&self) -> usize {
        self.directional_count
    }

    pub fn len(&self) -> usize {
        self.lights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lights.is_empty()
    }

    /// Lights that asked for a shadow map, with their frame index
    pub fn shadow_casters(&self) -> impl Iterator<Item = (usize, &Light)> {
        self.lights.iter().enumerate().filter(|(_, l)| l.casts_shadow)
    }
}

/// Uniform and storage ranges allocated for the frame before recording starts
#[derive(Debug, Clone, Copy)]
pub struct FrameTokens {
    /// `CameraUniformData`
    pub camera: UniformToken,
    /// `GpuLightData` array in [`FrameLights::all`] order
    pub lights: UniformToken,
    /// One entry per shadow view in the atlas
    pub shadow_views: UniformToken,
    /// `(offset, count)` per cluster
    pub clusters: UniformToken,
    /// Light indices referenced by `clusters`
    pub cluster_indices: UniformToken,
    /// Ambient color, light counts and cluster parameters
    pub lighting: UniformToken,
}

/// Scene snapshot and uniform tokens of one frame
#[derive(Debug, Clone)]
pub struct FrameContext {
    frame_index: u64,
    resolution: (u32, u32),
    camera: Camera,
    camera_data: CameraUniformData,
    lights: FrameLights,
    tokens: FrameTokens,
}

impl FrameContext {
    pub fn new(
        frame_index: u64,
        resolution: (u32, u32),
        camera: Camera,
        lights: FrameLights,
        tokens: FrameTokens,
    ) -> Self {
        let camera_data = camera.uniform_data(resolution.0, resolution.1);
        Self {
            frame_index,
            resolution,
            camera,
            camera_data,
            lights,
            tokens,
        }
    }

    pub fn frame_index(&self) -> u64 {
        self.frame_index
    }

    pub fn resolution(&self) -> (u32, u32) {
        self.resolution
    }

    pub fn camera(&self) -> &Camera {
        &self.camera
    }

    pub fn camera_data(&self) -> &CameraUniformData {
        &self.camera_data
    }

    pub fn lights(&self) -> &FrameLights {
        &self.lights
    }

    pub fn tokens(&self) -> &FrameTokens {
        &self.tokens
    }
}
