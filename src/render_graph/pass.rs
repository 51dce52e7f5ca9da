//! Render pass definitions for the render graph

use std::ops::Range;

use bytemuck::Pod;

use crate::backend::{BackendError, BlendFactors, CommandList, PipelineStages, TextureHandle};
use crate::error::{GraphError, RenderError, Result};
use crate::render_graph::resource::*;
use crate::resources::{align_up, RegionWriter, UniformToken};

/// Unique identifier for a render pass, in registration order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PassId(pub(crate) u32);

impl PassId {
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

/// Type of render pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassType {
    /// Graphics render pass
    Graphics,
    /// Compute pass
    Compute,
    /// Transfer/copy pass
    Transfer,
}

/// Uniform space one recording chunk writes through its [`RegionWriter`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UniformRequest {
    pub count: u64,
    /// Size of one value in bytes
    pub size: u64,
}

impl UniformRequest {
    pub const NONE: UniformRequest = UniformRequest { count: 0, size: 0 };

    pub fn of<T: Pod>(count: usize) -> Self {
        Self {
            count: count as u64,
            size: std::mem::size_of::<T>() as u64,
        }
    }

    /// Add `count` values of `T`; every slot is sized for the larger type
    pub fn and<T: Pod>(self, count: usize) -> Self {
        Self {
            count: self.count + count as u64,
            size: self.size.max(std::mem::size_of::<T>() as u64),
        }
    }

    /// Bytes needed when every value starts on an `alignment` boundary
    pub fn region_size(&self, alignment: u64) -> u64 {
        if self.count == 0 {
            return 0;
        }
        self.count * align_up(self.size.max(16), alignment)
    }
}

/// Trait for render passes.
///
/// Outputs are created on the graph when the pass is constructed; `setup`
/// only declares how the pass touches them. `record` may run on any worker
/// thread, once per chunk.
pub trait RenderPass: Send + Sync {
    /// Get the pass name for debugging
    fn name(&self) -> &str;

    fn pass_type(&self) -> PassType {
        PassType::Graphics
    }

    /// Declare resource dependencies
    fn setup(&self, ctx: &mut PassSetupContext);

    /// Number of independent recording chunks
    fn chunk_count(&self) -> u32 {
        1
    }

    /// Uniform space recorded by one chunk
    fn chunk_uniforms(&self, _chunk: u32) -> UniformRequest {
        UniformRequest::NONE
    }

    /// Record commands for one chunk
    fn record(&self, ctx: &mut PassRecordContext) -> Result<()>;
}

/// Context for declaring pass dependencies
pub struct PassSetupContext<'a> {
    pass_name: &'a str,
    resource_count: u32,
    dependencies: Vec<ResourceDependency>,
    error: Option<GraphError>,
}

impl<'a> PassSetupContext<'a> {
    pub(crate) fn new(pass_name: &'a str, resource_count: u32) -> Self {
        Self {
            pass_name,
            resource_count,
            dependencies: Vec::new(),
            error: None,
        }
    }

    /// Declare that this pass reads from a resource
    pub fn read(&mut self, target: RenderTargetHandle, stage: PipelineStage) -> &mut Self {
        self.declare(target, Access::Read, stage)
    }

    /// Declare that this pass writes to a resource
    pub fn write(&mut self, target: RenderTargetHandle, stage: PipelineStage) -> &mut Self {
        self.declare(target, Access::Write, stage)
    }

    /// Read-modify-write in one pass
    pub fn read_write(
        &mut self,
        target: RenderTargetHandle,
        read_stage: PipelineStage,
        write_stage: PipelineStage,
    ) -> &mut Self {
        self.declare(target, Access::Read, read_stage)
            .declare(target, Access::Write, write_stage)
    }

    fn declare(
        &mut self,
        target: RenderTargetHandle,
        access: Access,
        stage: PipelineStage,
    ) -> &mut Self {
        if target.0 >= self.resource_count {
            if self.error.is_none() {
                self.error = Some(GraphError::UnknownResource {
                    pass: self.pass_name.to_string(),
                    index: target.0,
                });
            }
        } else {
            self.dependencies.push(ResourceDependency {
                target,
                access,
                stage,
            });
        }
        self
    }

    /// Merge the declarations per resource, in first-declaration order
    pub(crate) fn finish(self) -> std::result::Result<Vec<ResourceUse>, GraphError> {
        if let Some(error) = self.error {
            return Err(error);
        }
        let mut uses: Vec<ResourceUse> = Vec::new();
        for dep in self.dependencies {
            let index = match uses.iter().position(|u| u.target == dep.target) {
                Some(index) => index,
                None => {
                    uses.push(ResourceUse {
                        target: dep.target,
                        read_stages: PipelineStages::empty(),
                        write_stages: PipelineStages::empty(),
                    });
                    uses.len() - 1
                }
            };
            match dep.access {
                Access::Read => uses[index].read_stages |= dep.stage.flags(),
                Access::Write => uses[index].write_stages |= dep.stage.flags(),
            }
        }
        Ok(uses)
    }
}

/// Explicit rendering context handed to [`RenderPass::record`].
///
/// Each chunk gets its own command list and its own uniform region, so chunks
/// can be recorded on different threads without sharing mutable state.
pub struct PassRecordContext<'a> {
    pass_name: &'a str,
    uses: &'a [ResourceUse],
    resources: &'a [VirtualResource],
    physical: &'a [Option<TextureHandle>],
    chunk_index: u32,
    chunk_count: u32,
    frame_index: u64,
    commands: CommandList,
    uniforms: RegionWriter<'a>,
}

impl<'a> PassRecordContext<'a> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        pass_name: &'a str,
        uses: &'a [ResourceUse],
        resources: &'a [VirtualResource],
        physical: &'a [Option<TextureHandle>],
        chunk_index: u32,
        chunk_count: u32,
        frame_index: u64,
        uniforms: RegionWriter<'a>,
    ) -> Self {
        Self {
            pass_name,
            uses,
            resources,
            physical,
            chunk_index,
            chunk_count,
            frame_index,
            commands: CommandList::new(),
            uniforms,
        }
    }

    pub fn pass_name(&self) -> &str {
        self.pass_name
    }

    pub fn chunk_index(&self) -> u32 {
        self.chunk_index
    }

    pub fn chunk_count(&self) -> u32 {
        self.chunk_count
    }

    pub fn frame_index(&self) -> u64 {
        self.frame_index
    }

    /// Slice of a list of `len` items this chunk is responsible for
    pub fn chunk_range(&self, len: usize) -> Range<usize> {
        let count = self.chunk_count.max(1) as usize;
        let index = self.chunk_index as usize;
        let per_chunk = len.div_ceil(count);
        let start = (index * per_chunk).min(len);
        let end = (start + per_chunk).min(len);
        start..end
    }

    /// Physical texture bound to a declared resource
    pub fn texture(&self, target: RenderTargetHandle) -> Result<TextureHandle> {
        let resource = self.resource(target)?;
        if !self.uses.iter().any(|u| u.target == target) {
            return Err(GraphError::UndeclaredAccess {
                pass: self.pass_name.to_string(),
                resource: resource.name.clone(),
            }
            .into());
        }
        self.physical
            .get(target.index())
            .copied()
            .flatten()
            .ok_or_else(|| RenderError::ResourceExhausted {
                pass: self.pass_name.to_string(),
                resource: resource.name.clone(),
                source: BackendError::InvalidHandle("resource has no physical texture".to_string()),
            })
    }

    pub fn description(&self, target: RenderTargetHandle) -> Result<RenderTargetDescription> {
        Ok(self.resource(target)?.description)
    }

    fn resource(&self, target: RenderTargetHandle) -> Result<&VirtualResource> {
        self.resources.get(target.index()).ok_or_else(|| {
            GraphError::UnknownResource {
                pass: self.pass_name.to_string(),
                index: target.0,
            }
            .into()
        })
    }

    pub fn commands(&mut self) -> &mut CommandList {
        &mut self.commands
    }

    /// Write a value into this chunk's private uniform region
    pub fn push_uniforms<T: Pod>(&mut self, value: &T) -> Result<UniformToken> {
        self.uniforms.push(value)
    }

    pub fn bind_uniforms(&mut self, binding: u32, token: &UniformToken) -> Result<()> {
        self.check_token(token)?;
        self.commands.bind_uniforms(binding, token.range());
        Ok(())
    }

    pub fn bind_storage(&mut self, binding: u32, token: &UniformToken) -> Result<()> {
        self.check_token(token)?;
        self.commands.bind_storage(binding, token.range());
        Ok(())
    }

    /// Record `f` with `factors` on `attachment`; opaque blending is restored
    /// afterwards whether `f` succeeds or not.
    pub fn with_blend_factors<R>(
        &mut self,
        attachment: u32,
        factors: BlendFactors,
        f: impl FnOnce(&mut Self) -> R,
    ) -> R {
        self.commands.set_blend_factors(attachment, factors);
        let result = f(self);
        self.commands
            .set_blend_factors(attachment, BlendFactors::OPAQUE);
        result
    }

    fn check_token(&self, token: &UniformToken) -> Result<()> {
        if token.frame_index() != self.frame_index {
            return Err(RenderError::Recording {
                pass: self.pass_name.to_string(),
                message: format!(
                    "uniform token from frame {} used in frame {}",
                    token.frame_index(),
                    self.frame_index
                ),
            });
        }
        Ok(())
    }

    pub(crate) fn finish(self) -> CommandList {
        self.commands
    }
}

/// Metadata about a pass in the graph
#[derive(Debug, Clone)]
pub struct PassNode {
    pub id: PassId,
    pub name: String,
    pub pass_type: PassType,
    pub uses: Vec<ResourceUse>,
}

impl PassNode {
    pub fn use_of(&self, target: RenderTargetHandle) -> Option<&ResourceUse> {
        self.uses.iter().find(|u| u.target == target)
    }

    pub fn reads_resource(&self, target: RenderTargetHandle) -> bool {
        self.use_of(target).is_some_and(|u| u.is_read())
    }

    pub fn writes_resource(&self, target: RenderTargetHandle) -> bool {
        self.use_of(target).is_some_and(|u| u.is_write())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BufferHandle, TextureFormat};

    #[test]
    fn test_setup_merges_read_write() {
        let mut ctx = PassSetupContext::new("Upscale", 2);
        ctx.read(RenderTargetHandle(0), PipelineStage::FragmentShader)
            .read_write(
                RenderTargetHandle(1),
                PipelineStage::ColorAttachmentOutput,
                PipelineStage::ColorAttachmentOutput,
            );
        let uses = ctx.finish().unwrap();
        assert_eq!(uses.len(), 2);
        assert!(!uses[0].is_write());
        assert!(uses[1].is_read_write());
        assert_eq!(uses[1].stages(), PipelineStages::COLOR_ATTACHMENT_OUTPUT);
    }

    #[test]
    fn test_setup_rejects_unknown_handle() {
        let mut ctx = PassSetupContext::new("Broken", 1);
        ctx.write(RenderTargetHandle(5), PipelineStage::ColorAttachmentOutput);
        assert_eq!(
            ctx.finish().unwrap_err(),
            GraphError::UnknownResource {
                pass: "Broken".into(),
                index: 5
            }
        );
    }

    #[test]
    fn test_chunk_ranges_cover_list() {
        let resources: Vec<VirtualResource> = Vec::new();
        let covered: Vec<usize> = (0..3)
            .flat_map(|chunk| {
                let ctx = PassRecordContext::new(
                    "G-Buffer",
                    &[],
                    &resources,
                    &[],
                    chunk,
                    3,
                    0,
                    RegionWriter::empty("G-Buffer", 0, BufferHandle(0)),
                );
                ctx.chunk_range(10)
            })
            .collect();
        assert_eq!(covered, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_undeclared_texture_access() {
        let resources = vec![VirtualResource {
            name: "shadow_atlas".into(),
            description: RenderTargetDescription::new(4, 4, TextureFormat::Depth32Float),
            kind: ResourceKind::Transient,
            exported: false,
        }];
        let physical = vec![Some(TextureHandle(9))];
        let ctx = PassRecordContext::new(
            "Sneaky",
            &[],
            &resources,
            &physical,
            0,
            1,
            0,
            RegionWriter::empty("Sneaky", 0, BufferHandle(0)),
        );
        let error = ctx.texture(RenderTargetHandle(0)).unwrap_err();
        assert!(matches!(
            error,
            RenderError::Graph(GraphError::UndeclaredAccess { ref resource, .. }) if resource == "shadow_atlas"
        ));
    }

    #[test]
    fn test_region_size_aligns_each_value() {
        let request = UniformRequest { count: 3, size: 80 };
        assert_eq!(request.region_size(256), 768);
        assert_eq!(UniformRequest::NONE.region_size(256), 0);

        let mixed = UniformRequest::of::<[f32; 4]>(2).and::<[f32; 72]>(1);
        assert_eq!(mixed, UniformRequest { count: 3, size: 288 });
        assert_eq!(mixed.region_size(256), 1536);
    }
}
