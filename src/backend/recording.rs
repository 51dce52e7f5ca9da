//! Headless recording backend for tests and tooling.
//!
//! This backend performs no GPU work. It hands out handles, keeps every
//! submission, and replays the commands through a [`PipelineStateTracker`]
//! so that state leaks (blending, open render passes, dangling handles)
//! are caught without GPU hardware.

use std::collections::{HashMap, HashSet};

use crate::backend::command::{Command, DepthLoadOp};
use crate::backend::traits::*;
use crate::backend::types::*;
use crate::resources::CompiledShader;

/// Blend and depth state observed at the boundaries of one submitted pass
#[derive(Debug, Clone, PartialEq)]
pub struct PassStateSnapshot {
    pub frame_index: u64,
    pub pass: String,
    pub blend_on_entry: Vec<(u32, BlendFactors)>,
    pub blend_on_exit: Vec<(u32, BlendFactors)>,
    /// Every non-default blend setting used inside the pass
    pub blend_used: Vec<(u32, BlendFactors)>,
    pub depth_states: Vec<DepthState>,
    pub draw_count: usize,
}

impl PassStateSnapshot {
    pub fn opaque_on_entry(&self) -> bool {
        self.blend_on_entry.iter().all(|(_, f)| f.is_opaque())
    }

    pub fn opaque_on_exit(&self) -> bool {
        self.blend_on_exit.iter().all(|(_, f)| f.is_opaque())
    }
}

/// Emulates the mutable pipeline state of a GPU queue
#[derive(Debug, Default)]
pub struct PipelineStateTracker {
    blend: HashMap<u32, BlendFactors>,
    depth: DepthState,
    program: Option<ProgramHandle>,
    open_pass: Option<String>,
    clears: Vec<(TextureHandle, [f32; 4])>,
    depth_clears: Vec<(TextureHandle, f32)>,
    snapshots: Vec<PassStateSnapshot>,
}

impl PipelineStateTracker {
    /// Current blend factors of an attachment
    pub fn blend_factors(&self, attachment: u32) -> BlendFactors {
        self.blend.get(&attachment).copied().unwrap_or_default()
    }

    /// Whether every attachment is in the opaque default state
    pub fn is_blend_opaque(&self) -> bool {
        self.blend.values().all(|f| f.is_opaque())
    }

    pub fn depth_state(&self) -> DepthState {
        self.depth
    }

    pub fn clears(&self) -> &[(TextureHandle, [f32; 4])] {
        &self.clears
    }

    pub fn depth_clears(&self) -> &[(TextureHandle, f32)] {
        &self.depth_clears
    }

    pub fn snapshots(&self) -> &[PassStateSnapshot] {
        &self.snapshots
    }

    fn sorted_blend(&self) -> Vec<(u32, BlendFactors)> {
        let mut blend: Vec<_> = self.blend.iter().map(|(a, f)| (*a, *f)).collect();
        blend.sort_by_key(|(a, _)| *a);
        blend
    }

    fn replay(
        &mut self,
        frame_index: u64,
        pass: &SubmittedPass,
        live_textures: &HashSet<TextureHandle>,
        live_programs: &HashSet<ProgramHandle>,
    ) -> BackendResult<()> {
        let mut snapshot = PassStateSnapshot {
            frame_index,
            pass: pass.name.clone(),
            blend_on_entry: self.sorted_blend(),
            blend_on_exit: Vec::new(),
            blend_used: Vec::new(),
            depth_states: Vec::new(),
            draw_count: 0,
        };

        for barrier in &pass.barriers {
            if !live_textures.contains(&barrier.texture) {
                return Err(BackendError::InvalidHandle(format!(
                    "barrier on '{}' in pass '{}'",
                    barrier.resource, pass.name
                )));
            }
        }

        let check_texture = |texture: &TextureHandle| {
            if live_textures.contains(texture) {
                Ok(())
            } else {
                Err(BackendError::InvalidHandle(format!(
                    "texture #{} used by pass '{}'",
                    texture.0, pass.name
                )))
            }
        };

        for command in pass.commands.commands() {
            match command {
                Command::BeginRenderPass { label, color, depth } => {
                    if let Some(open) = &self.open_pass {
                        return Err(BackendError::SubmissionFailed(format!(
                            "render pass '{}' begun while '{}' is open",
                            label, open
                        )));
                    }
                    for attachment in color {
                        check_texture(&attachment.texture)?;
                        if let LoadOp::Clear(value) = attachment.load {
                            self.clears.push((attachment.texture, value));
                        }
                    }
                    if let Some(depth) = depth {
                        check_texture(&depth.texture)?;
                        if let DepthLoadOp::Clear(value) = depth.load {
                            self.depth_clears.push((depth.texture, value));
                        }
                    }
                    self.open_pass = Some(label.clone());
                }
                Command::EndRenderPass => {
                    if self.open_pass.take().is_none() {
                        return Err(BackendError::SubmissionFailed(format!(
                            "pass '{}' ends a render pass that was never begun",
                            pass.name
                        )));
                    }
                }
                Command::SetViewport(_) => {}
                Command::BindProgram(program) => {
                    if !live_programs.contains(program) {
                        return Err(BackendError::InvalidHandle(format!(
                            "program #{} used by pass '{}'",
                            program.0, pass.name
                        )));
                    }
                    self.program = Some(*program);
                }
                Command::BindTexture { texture, .. } => check_texture(texture)?,
                Command::BindUniforms { .. } | Command::BindStorage { .. } => {}
                Command::SetBlendFactors {
                    attachment,
                    factors,
                } => {
                    if !factors.is_opaque() {
                        snapshot.blend_used.push((*attachment, *factors));
                    }
                    self.blend.insert(*attachment, *factors);
                }
                Command::SetDepthState(state) => {
                    snapshot.depth_states.push(*state);
                    self.depth = *state;
                }
                Command::DrawIndexed { .. } | Command::DrawFullscreenQuad => {
                    if self.open_pass.is_none() {
                        return Err(BackendError::SubmissionFailed(format!(
                            "pass '{}' draws outside a render pass",
                            pass.name
                        )));
                    }
                    if self.program.is_none() {
                        return Err(BackendError::SubmissionFailed(format!(
                            "pass '{}' draws without a program",
                            pass.name
                        )));
                    }
                    snapshot.draw_count += 1;
                }
                Command::Dispatch { .. } => {
                    if self.open_pass.is_some() {
                        return Err(BackendError::SubmissionFailed(format!(
                            "pass '{}' dispatches inside a render pass",
                            pass.name
                        )));
                    }
                }
            }
        }

        if let Some(open) = &self.open_pass {
            return Err(BackendError::SubmissionFailed(format!(
                "pass '{}' leaves render pass '{}' open",
                pass.name, open
            )));
        }

        snapshot.blend_on_exit = self.sorted_blend();
        self.snapshots.push(snapshot);
        Ok(())
    }
}

/// Recording backend.
#[derive(Debug, Default)]
pub struct RecordingBackend {
    next_handle: u64,
    textures: HashMap<TextureHandle, TextureDescriptor>,
    buffers: HashMap<BufferHandle, BufferDescriptor>,
    programs: HashMap<ProgramHandle, String>,
    submissions: Vec<Submission>,
    presented: Vec<TextureHandle>,
    state: PipelineStateTracker,
    completed_frame: Option<u64>,
    manual_completion: bool,
    wait_count: usize,
    textures_created: usize,
    texture_budget: Option<usize>,
    pending_failure: Option<BackendError>,
    device_lost: bool,
    device_generation: u32,
}

impl RecordingBackend {
    /// Create a new recording backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail texture creation with `OutOfMemory` once `budget` textures are alive.
    pub fn with_texture_budget(mut self, budget: usize) -> Self {
        self.texture_budget = Some(budget);
        self
    }

    /// Keep submitted frames pending until [`complete_frames_through`](Self::complete_frames_through)
    /// or a wait marks them done.
    pub fn with_manual_completion(mut self) -> Self {
        self.manual_completion = true;
        self
    }

    /// Make the next submission fail with `error`.
    pub fn fail_next_submit(&mut self, error: BackendError) {
        self.pending_failure = Some(error);
    }

    /// Simulate the GPU finishing every frame up to and including `frame_index`.
    pub fn complete_frames_through(&mut self, frame_index: u64) {
        self.completed_frame = Some(self.completed_frame.map_or(frame_index, |f| f.max(frame_index)));
    }

    pub fn submissions(&self) -> &[Submission] {
        &self.submissions
    }

    pub fn last_submission(&self) -> Option<&Submission> {
        self.submissions.last()
    }

    pub fn presented(&self) -> &[TextureHandle] {
        &self.presented
    }

    pub fn state(&self) -> &PipelineStateTracker {
        &self.state
    }

    pub fn live_texture_count(&self) -> usize {
        self.textures.len()
    }

    pub fn textures_created(&self) -> usize {
        self.textures_created
    }

    pub fn texture_descriptor(&self, texture: TextureHandle) -> Option<&TextureDescriptor> {
        self.textures.get(&texture)
    }

    pub fn live_program_count(&self) -> usize {
        self.programs.len()
    }

    pub fn wait_count(&self) -> usize {
        self.wait_count
    }

    pub fn device_generation(&self) -> u32 {
        self.device_generation
    }

    fn allocate_handle(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    fn check_device(&self) -> BackendResult<()> {
        if self.device_lost {
            Err(BackendError::DeviceLost)
        } else {
            Ok(())
        }
    }
}

impl GraphicsBackend for RecordingBackend {
    fn name(&self) -> &str {
        "Recording Backend"
    }

    fn create_texture(&mut self, desc: &TextureDescriptor) -> BackendResult<TextureHandle> {
        self.check_device()?;
        if let Some(budget) = self.texture_budget {
            if self.textures.len() >= budget {
                log::trace!(
                    "RecordingBackend: texture budget of {} exhausted by {:?}",
                    budget,
                    desc.label
                );
                return Err(BackendError::OutOfMemory);
            }
        }
        let handle = TextureHandle(self.allocate_handle());
        log::trace!(
            "RecordingBackend: creating texture {:?} ({}x{}, {:?})",
            desc.label,
            desc.width,
            desc.height,
            desc.format
        );
        self.textures.insert(handle, desc.clone());
        self.textures_created += 1;
        Ok(handle)
    }

    fn destroy_texture(&mut self, texture: TextureHandle) {
        log::trace!("RecordingBackend: destroying texture #{}", texture.0);
        self.textures.remove(&texture);
    }

    fn create_buffer(&mut self, desc: &BufferDescriptor) -> BackendResult<BufferHandle> {
        self.check_device()?;
        let handle = BufferHandle(self.allocate_handle());
        log::trace!(
            "RecordingBackend: creating buffer {:?} (size: {})",
            desc.label,
            desc.size
        );
        self.buffers.insert(handle, desc.clone());
        Ok(handle)
    }

    fn destroy_buffer(&mut self, buffer: BufferHandle) {
        self.buffers.remove(&buffer);
    }

    fn write_buffer(&mut self, buffer: BufferHandle, offset: u64, data: &[u8]) -> BackendResult<()> {
        self.check_device()?;
        let desc = self
            .buffers
            .get(&buffer)
            .ok_or_else(|| BackendError::InvalidHandle(format!("buffer #{}", buffer.0)))?;
        if offset + data.len() as u64 > desc.size {
            return Err(BackendError::SubmissionFailed(format!(
                "write of {} bytes at {} overflows buffer {:?} ({} bytes)",
                data.len(),
                offset,
                desc.label,
                desc.size
            )));
        }
        Ok(())
    }

    fn create_program(&mut self, shader: &CompiledShader) -> BackendResult<ProgramHandle> {
        self.check_device()?;
        let handle = ProgramHandle(self.allocate_handle());
        log::trace!("RecordingBackend: creating program for {}", shader.label());
        self.programs.insert(handle, shader.label());
        Ok(handle)
    }

    fn destroy_program(&mut self, program: ProgramHandle) {
        self.programs.remove(&program);
    }

    fn submit(&mut self, submission: Submission) -> BackendResult<()> {
        self.check_device()?;
        if let Some(error) = self.pending_failure.take() {
            if error == BackendError::DeviceLost {
                self.device_lost = true;
            }
            return Err(error);
        }

        if let Some(upload) = &submission.uniform_upload {
            self.write_buffer(upload.buffer, upload.offset, &upload.data)?;
        }

        let live_textures: HashSet<TextureHandle> = self.textures.keys().copied().collect();
        let live_programs: HashSet<ProgramHandle> = self.programs.keys().copied().collect();
        for pass in &submission.passes {
            self.state
                .replay(submission.frame_index, pass, &live_textures, &live_programs)?;
        }

        if let Some(present) = submission.present {
            if !live_textures.contains(&present) {
                return Err(BackendError::InvalidHandle(format!(
                    "presented texture #{}",
                    present.0
                )));
            }
            self.presented.push(present);
        }

        log::trace!(
            "RecordingBackend: frame {} submitted ({} passes, {} barriers)",
            submission.frame_index,
            submission.passes.len(),
            submission.barrier_count()
        );
        if !self.manual_completion {
            self.complete_frames_through(submission.frame_index);
        }
        self.submissions.push(submission);
        Ok(())
    }

    fn is_frame_complete(&self, frame_index: u64) -> bool {
        self.completed_frame.is_some_and(|f| f >= frame_index)
    }

    fn wait_for_frame(&mut self, frame_index: u64) -> BackendResult<()> {
        self.check_device()?;
        self.wait_count += 1;
        self.complete_frames_through(frame_index);
        Ok(())
    }

    fn recreate_device(&mut self) -> BackendResult<()> {
        log::trace!("RecordingBackend: recreating device");
        self.textures.clear();
        self.buffers.clear();
        self.programs.clear();
        self.state = PipelineStateTracker::default();
        self.device_lost = false;
        self.device_generation += 1;
        Ok(())
    }
}
