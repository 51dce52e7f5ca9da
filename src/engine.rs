//! Main frame loop
//!
//! [`Engine`] owns the backend and the renderer and decides what a failed
//! frame means:
//! - configuration and exhaustion errors skip the frame, the next one starts clean
//! - GPU errors recreate the device and rebuild the whole pipeline, up to
//!   `max_reinitializations` times in a row
//! - shader compilation errors are fatal

use crate::backend::GraphicsBackend;
use crate::error::{ErrorCategory, RenderError, Result};
use crate::pipeline::{DeferredRenderer, FrameReport};
use crate::resources::{MaterialDescriptor, MaterialId};
use crate::scene::SceneView;
use crate::RendererConfig;

/// Result of one [`Engine::run_frame`]
#[derive(Debug)]
pub enum FrameOutcome {
    Presented(FrameReport),
    /// The frame was dropped; rendering continues with the next one
    Skipped(RenderError),
}

impl FrameOutcome {
    pub fn is_presented(&self) -> bool {
        matches!(self, FrameOutcome::Presented(_))
    }

    pub fn report(&self) -> Option<&FrameReport> {
        match self {
            FrameOutcome::Presented(report) => Some(report),
            FrameOutcome::Skipped(_) => None,
        }
    }
}

/// Backend plus renderer, driven one frame at a time
pub struct Engine<B: GraphicsBackend> {
    backend: B,
    renderer: DeferredRenderer,
    consecutive_reinitializations: u32,
    total_reinitializations: u32,
}

impl<B: GraphicsBackend> Engine<B> {
    pub fn new(config: RendererConfig, mut backend: B) -> Result<Self> {
        let renderer = DeferredRenderer::new(config, &mut backend)?;
        Ok(Self {
            backend,
            renderer,
            consecutive_reinitializations: 0,
            total_reinitializations: 0,
        })
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn renderer(&self) -> &DeferredRenderer {
        &self.renderer
    }

    pub fn register_material(&mut self, descriptor: MaterialDescriptor) -> Result<MaterialId> {
        self.renderer.register_material(descriptor, &mut self.backend)
    }

    pub fn reinitialization_count(&self) -> u32 {
        self.total_reinitializations
    }

    pub fn resize(&mut self, width: u32, height: u32) -> Result<()> {
        self.renderer.resize(width, height)
    }

    /// Render one frame.
    ///
    /// Returns an error only when rendering cannot continue: a shader failed to
    /// compile, or the GPU kept failing after every allowed reinitialization.
    pub fn run_frame(&mut self, scene: &SceneView) -> Result<FrameOutcome> {
        let error = match self.renderer.render_frame(scene, &mut self.backend) {
            Ok(report) => {
                self.consecutive_reinitializations = 0;
                return Ok(FrameOutcome::Presented(report));
            }
            Err(error) => error,
        };

        match error.category() {
            ErrorCategory::Configuration | ErrorCategory::ResourceExhaustion => {
                log::error!("Skipping frame: {}", error);
                Ok(FrameOutcome::Skipped(error))
            }
            ErrorCategory::ShaderCompilation => {
                log::error!("Shader failure, stopping: {}", error);
                Err(error)
            }
            ErrorCategory::Gpu => {
                log::error!("GPU error: {}", error);
                self.recover()?;
                Ok(FrameOutcome::Skipped(error))
            }
        }
    }

    /// Recreate the device and rebuild the pipeline, retrying while the budget lasts
    fn recover(&mut self) -> Result<()> {
        let max = self.renderer.config().max_reinitializations;
        loop {
            if self.consecutive_reinitializations >= max {
                log::error!("Giving up after {} reinitializations", max);
                return Err(RenderError::Gpu(crate::backend::BackendError::DeviceLost));
            }
            self.consecutive_reinitializations += 1;
            self.total_reinitializations += 1;
            log::info!(
                "Reinitializing pipeline (attempt {} of {})",
                self.consecutive_reinitializations,
                max
            );

            let attempt = self
                .backend
                .recreate_device()
                .map_err(RenderError::from)
                .and_then(|()| self.renderer.reinitialize(&mut self.backend));
            match attempt {
                Ok(()) => return Ok(()),
                Err(error) if error.category() == ErrorCategory::Gpu => {
                    log::warn!("Reinitialization failed: {}", error);
                }
                Err(error) => return Err(error),
            }
        }
    }

    /// Release the renderer's GPU resources and hand the backend back
    pub fn shutdown(self) -> B {
        let Self {
            mut backend,
            renderer,
            ..
        } = self;
        renderer.destroy(&mut backend);
        backend
    }
}
