//! Deferred Renderer - a render graph-driven deferred rendering pipeline
//!
//! Each frame the renderer turns a [`scene::SceneView`] into one GPU
//! submission:
//! - G-buffer pass (with an optional depth prepass) for opaque geometry
//! - shadow atlas shared by every shadow-casting light
//! - indirect lighting from reflection probes
//! - clustered light shading
//! - transparent geometry at reduced resolution, composited with a
//!   depth-aware upscale
//!
//! Passes declare what they read and write; the render graph orders them,
//! inserts barriers and binds pooled render targets. Recording runs on worker
//! threads and the result is submitted in one piece, so a frame that fails to
//! build never reaches the GPU.
//!
//! The GPU itself is behind the [`backend::GraphicsBackend`] trait.
//! [`backend::RecordingBackend`] implements it headlessly.

pub mod backend;
pub mod engine;
pub mod error;
pub mod frame;
pub mod pipeline;
pub mod render_graph;
pub mod resources;
pub mod scene;

pub use engine::{Engine, FrameOutcome};
pub use error::{ErrorCategory, GraphError, RenderError, Result};
pub use pipeline::{DeferredRenderer, FrameReport};

use glam::Vec3;

/// When the G-buffer pass gets a depth prepass
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DepthPrepassMode {
    Never,
    Always,
    /// Enabled when the average shading cost of the opaque draws exceeds the threshold
    CostThreshold(f32),
}

impl DepthPrepassMode {
    pub fn enabled(&self, average_shading_cost: f32) -> bool {
        match *self {
            DepthPrepassMode::Never => false,
            DepthPrepassMode::Always => true,
            DepthPrepassMode::CostThreshold(threshold) => average_shading_cost > threshold,
        }
    }
}

/// Configuration of the deferred renderer
#[derive(Debug, Clone, PartialEq)]
pub struct RendererConfig {
    /// Framebuffer width
    pub width: u32,
    /// Framebuffer height
    pub height: u32,
    /// Light clusters along x, y and depth
    pub cluster_counts: [u32; 3],
    pub max_lights_per_cluster: u32,
    /// Edge length of the square shadow atlas
    pub shadow_atlas_size: u32,
    /// Tiles per atlas side at full tile resolution
    pub shadow_atlas_tiles_per_side: u32,
    /// Half extent of directional light shadow volumes around the camera
    pub directional_shadow_extent: f32,
    /// Transparent geometry renders at `1 / forward_fraction` resolution
    pub forward_fraction: u32,
    /// Upper bound on the mips sampled from reflection probes
    pub reflection_mip_count: u32,
    pub depth_prepass: DepthPrepassMode,
    pub frames_in_flight: u32,
    /// Bytes of uniform ring per frame
    pub uniform_ring_size: u64,
    pub uniform_alignment: u64,
    /// Recording threads, 1 records on the calling thread
    pub worker_threads: usize,
    /// Per-chunk uniform budget
    pub uniform_bytes_per_chunk: u64,
    pub draws_per_chunk: u32,
    /// Pooled render targets unused for this many frames are destroyed
    pub render_target_idle_frames: u32,
    /// Consecutive full reinitializations tolerated after GPU errors
    pub max_reinitializations: u32,
    pub ambient_color: Vec3,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            cluster_counts: [16, 8, 24],
            max_lights_per_cluster: 256,
            shadow_atlas_size: 4096,
            shadow_atlas_tiles_per_side: 8,
            directional_shadow_extent: 50.0,
            forward_fraction: 2,
            reflection_mip_count: 5,
            depth_prepass: DepthPrepassMode::CostThreshold(4.0),
            frames_in_flight: 3,
            uniform_ring_size: 4 * 1024 * 1024,
            uniform_alignment: 256,
            worker_threads: std::thread::available_parallelism().map_or(1, |n| n.get()),
            uniform_bytes_per_chunk: 64 * 1024,
            draws_per_chunk: 256,
            render_target_idle_frames: 3,
            max_reinitializations: 3,
            ambient_color: Vec3::splat(0.03),
        }
    }
}

impl RendererConfig {
    pub fn with_resolution(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    pub fn with_cluster_counts(mut self, counts: [u32; 3]) -> Self {
        self.cluster_counts = counts;
        self
    }

    pub fn with_max_lights_per_cluster(mut self, max: u32) -> Self {
        self.max_lights_per_cluster = max;
        self
    }

    pub fn with_shadow_atlas(mut self, size: u32, tiles_per_side: u32) -> Self {
        self.shadow_atlas_size = size;
        self.shadow_atlas_tiles_per_side = tiles_per_side;
        self
    }

    pub fn with_forward_fraction(mut self, fraction: u32) -> Self {
        self.forward_fraction = fraction;
        self
    }

    pub fn with_depth_prepass(mut self, mode: DepthPrepassMode) -> Self {
        self.depth_prepass = mode;
        self
    }

    pub fn with_frames_in_flight(mut self, frames: u32) -> Self {
        self.frames_in_flight = frames;
        self
    }

    pub fn with_uniform_ring_size(mut self, bytes: u64) -> Self {
        self.uniform_ring_size = bytes;
        self
    }

    pub fn with_worker_threads(mut self, threads: usize) -> Self {
        self.worker_threads = threads;
        self
    }

    pub fn with_draws_per_chunk(mut self, draws: u32) -> Self {
        self.draws_per_chunk = draws;
        self
    }

    pub fn with_max_reinitializations(mut self, attempts: u32) -> Self {
        self.max_reinitializations = attempts;
        self
    }

    pub fn with_ambient_color(mut self, color: Vec3) -> Self {
        self.ambient_color = color;
        self
    }

    /// Number of light clusters
    pub fn cluster_count(&self) -> u32 {
        self.cluster_counts.iter().product()
    }

    pub fn validate(&self) -> Result<()> {
        let positive = |field: &'static str, value: u64| {
            if value == 0 {
                Err(RenderError::InvalidConfig {
                    field,
                    reason: "must be greater than zero".to_string(),
                })
            } else {
                Ok(())
            }
        };

        positive("width", self.width as u64)?;
        positive("height", self.height as u64)?;
        for (field, count) in ["cluster_counts.x", "cluster_counts.y", "cluster_counts.z"]
            .into_iter()
            .zip(self.cluster_counts)
        {
            positive(field, count as u64)?;
        }
        positive("max_lights_per_cluster", self.max_lights_per_cluster as u64)?;
        positive("shadow_atlas_size", self.shadow_atlas_size as u64)?;
        positive("shadow_atlas_tiles_per_side", self.shadow_atlas_tiles_per_side as u64)?;
        positive("forward_fraction", self.forward_fraction as u64)?;
        positive("reflection_mip_count", self.reflection_mip_count as u64)?;
        positive("frames_in_flight", self.frames_in_flight as u64)?;
        positive("uniform_ring_size", self.uniform_ring_size)?;
        positive("worker_threads", self.worker_threads as u64)?;
        positive("uniform_bytes_per_chunk", self.uniform_bytes_per_chunk)?;
        positive("draws_per_chunk", self.draws_per_chunk as u64)?;

        if !self.uniform_alignment.is_power_of_two() {
            return Err(RenderError::InvalidConfig {
                field: "uniform_alignment",
                reason: format!("{} is not a power of two", self.uniform_alignment),
            });
        }
        if self.shadow_atlas_tiles_per_side > self.shadow_atlas_size {
            return Err(RenderError::InvalidConfig {
                field: "shadow_atlas_tiles_per_side",
                reason: format!(
                    "{} tiles do not fit in a {} texel atlas",
                    self.shadow_atlas_tiles_per_side, self.shadow_atlas_size
                ),
            });
        }
        if !(self.directional_shadow_extent > 0.0) {
            return Err(RenderError::InvalidConfig {
                field: "directional_shadow_extent",
                reason: format!("{} is not a positive extent", self.directional_shadow_extent),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = RendererConfig::default();
        config.validate().unwrap();
        assert_eq!(config.cluster_count(), 16 * 8 * 24);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let error = RendererConfig::default()
            .with_cluster_counts([16, 0, 24])
            .validate()
            .unwrap_err();
        assert!(matches!(
            error,
            RenderError::InvalidConfig {
                field: "cluster_counts.y",
                ..
            }
        ));

        let config = RendererConfig {
            uniform_alignment: 100,
            ..Default::default()
        };
        assert!(config.validate().is_err());
        assert!(RendererConfig::default()
            .with_frames_in_flight(0)
            .validate()
            .is_err());
    }

    #[test]
    fn test_prepass_modes() {
        assert!(!DepthPrepassMode::Never.enabled(100.0));
        assert!(DepthPrepassMode::Always.enabled(0.0));
        assert!(DepthPrepassMode::CostThreshold(4.0).enabled(4.5));
        assert!(!DepthPrepassMode::CostThreshold(4.0).enabled(4.0));
    }
}
