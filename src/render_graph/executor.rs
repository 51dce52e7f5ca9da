//! Render graph executor
//!
//! Turns a compiled graph into one [`Submission`]:
//!
//! 1. walk the execution order once, acquiring each transient target from
//!    the pool at its first use and releasing it after its last use
//! 2. record every `(pass, chunk)` job, in parallel when worker threads are
//!    available, each job with its own command list and uniform region
//! 3. concatenate the command lists in execution order with the barriers the
//!    compiler planned plus aliasing barriers for reused textures
//!
//! Nothing reaches the backend from here; the caller submits the result.
//! On any failure every acquired target goes back to the pool.

use std::collections::{HashMap, HashSet};

use crate::backend::*;
use crate::error::{GraphError, RenderError, Result};
use crate::render_graph::graph::*;
use crate::render_graph::pass::*;
use crate::render_graph::resource::*;
use crate::resources::{FrameUniforms, PooledTarget, RegionWriter, RenderTargetPool};

/// Executor for running the compiled render graph
#[derive(Debug, Clone)]
pub struct RenderGraphExecutor {
    worker_threads: usize,
}

impl Default for RenderGraphExecutor {
    fn default() -> Self {
        Self::new(std::thread::available_parallelism().map_or(1, |n| n.get()))
    }
}

/// Targets checked out for one frame, returned to the pool on drop
struct TargetLease<'p> {
    pool: &'p mut RenderTargetPool,
    held: HashMap<usize, PooledTarget>,
}

impl<'p> TargetLease<'p> {
    fn new(pool: &'p mut RenderTargetPool) -> Self {
        Self {
            pool,
            held: HashMap::new(),
        }
    }

    fn acquire<B: GraphicsBackend>(
        &mut self,
        resource: usize,
        description: &RenderTargetDescription,
        label: &str,
        backend: &mut B,
    ) -> BackendResult<TextureHandle> {
        let target = self.pool.acquire(description, label, backend)?;
        self.held.insert(resource, target);
        Ok(target.texture())
    }

    fn release(&mut self, resource: usize) {
        if let Some(target) = self.held.remove(&resource) {
            self.pool.release(target);
        }
    }
}

impl Drop for TargetLease<'_> {
    fn drop(&mut self) {
        for (_, target) in self.held.drain() {
            self.pool.release(target);
        }
    }
}

/// How a physical texture was last touched earlier in the frame
#[derive(Debug, Clone, Copy)]
struct PhysicalUse {
    stages: PipelineStages,
    written: bool,
}

struct Job<'a> {
    position: usize,
    chunk: u32,
    chunk_count: u32,
    pass: &'a dyn RenderPass,
    node: &'a PassNode,
    region: RegionWriter<'a>,
}

impl Job<'_> {
    fn record(
        self,
        resources: &[VirtualResource],
        physical: &[Option<TextureHandle>],
        frame_index: u64,
    ) -> Result<CommandList> {
        let mut ctx = PassRecordContext::new(
            &self.node.name,
            &self.node.uses,
            resources,
            physical,
            self.chunk,
            self.chunk_count,
            frame_index,
            self.region,
        );
        self.pass.record(&mut ctx)?;
        Ok(ctx.finish())
    }
}

impl RenderGraphExecutor {
    pub fn new(worker_threads: usize) -> Self {
        Self {
            worker_threads: worker_threads.max(1),
        }
    }

    pub fn worker_threads(&self) -> usize {
        self.worker_threads
    }

    /// Bind, record and assemble the frame.
    ///
    /// `present` must be exported or imported so its texture outlives the
    /// last pass.
    pub fn execute<B: GraphicsBackend>(
        &self,
        graph: &RenderGraph,
        compiled: &CompiledGraph,
        pool: &mut RenderTargetPool,
        uniforms: &mut FrameUniforms,
        backend: &mut B,
        present: Option<RenderTargetHandle>,
    ) -> Result<Submission> {
        let frame_index = uniforms.frame_index();
        let resources = graph.resources();
        let mut lease = TargetLease::new(pool);
        let (physical, aliasing) = bind_targets(graph, compiled, &mut lease, backend)?;

        let present_texture = match present {
            Some(target) => {
                let resource = graph.resource(target).ok_or(GraphError::UnknownResource {
                    pass: "<present>".to_string(),
                    index: target.0,
                })?;
                if resource.is_transient() && !resource.exported {
                    return Err(GraphError::InvalidDescription {
                        resource: resource.name.clone(),
                        reason: "presented target is not exported".to_string(),
                    }
                    .into());
                }
                Some(physical_texture(&physical, resources, target, "<present>")?)
            }
            None => None,
        };

        // One job per (pass, chunk), in execution order
        let mut requests: Vec<(&str, u64)> = Vec::new();
        let mut layout: Vec<(usize, u32, u32)> = Vec::new();
        for (position, &id) in compiled.pass_order().iter().enumerate() {
            let pass = graph.pass(id).ok_or(GraphError::UnknownResource {
                pass: "<graph>".to_string(),
                index: id.0,
            })?;
            let chunk_count = pass.chunk_count().max(1);
            for chunk in 0..chunk_count {
                requests.push((
                    pass.name(),
                    pass.chunk_uniforms(chunk).region_size(uniforms.alignment()),
                ));
                layout.push((position, chunk, chunk_count));
            }
        }

        let regions = uniforms.reserve_regions(&requests)?;
        let mut jobs = Vec::with_capacity(layout.len());
        for ((position, chunk, chunk_count), region) in layout.into_iter().zip(regions) {
            let id = compiled.pass_order()[position];
            if let (Some(pass), Some(node)) = (graph.pass(id), graph.node(id)) {
                jobs.push(Job {
                    position,
                    chunk,
                    chunk_count,
                    pass,
                    node,
                    region,
                });
            }
        }

        let mut recorded: Vec<CommandList> = vec![CommandList::new(); compiled.pass_order().len()];
        for (position, list) in self.record_jobs(jobs, resources, &physical, frame_index)? {
            recorded[position].append(list);
        }

        let mut submission = Submission::new(frame_index);
        submission.present = present_texture;
        for (position, &id) in compiled.pass_order().iter().enumerate() {
            let node = graph.node(id).ok_or(GraphError::UnknownResource {
                pass: "<graph>".to_string(),
                index: id.0,
            })?;

            let mut barriers = aliasing.get(&position).cloned().unwrap_or_default();
            for barrier in compiled.barriers_before(position) {
                barriers.push(PhysicalBarrier {
                    texture: physical_texture(&physical, resources, barrier.target, &node.name)?,
                    resource: resources[barrier.target.index()].name.clone(),
                    hazard: barrier.hazard,
                    src_stages: barrier.src_stages,
                    dst_stages: barrier.dst_stages,
                });
            }

            let commands = std::mem::take(&mut recorded[position]);
            check_declared(node, &commands, resources, &physical)?;

            submission.passes.push(SubmittedPass {
                name: node.name.clone(),
                barriers,
                commands,
            });
        }

        log::debug!(
            "Frame {}: {} passes, {} barriers, {} pooled targets live",
            frame_index,
            submission.passes.len(),
            submission.barrier_count(),
            lease.held.len()
        );
        Ok(submission)
    }

    /// Record every job; results come back ordered by position then chunk
    fn record_jobs(
        &self,
        jobs: Vec<Job<'_>>,
        resources: &[VirtualResource],
        physical: &[Option<TextureHandle>],
        frame_index: u64,
    ) -> Result<Vec<(usize, CommandList)>> {
        let job_count = jobs.len();
        let workers = self.worker_threads.min(job_count);

        let mut results: Vec<(usize, usize, Result<CommandList>)> = if workers <= 1 {
            jobs.into_iter()
                .enumerate()
                .map(|(i, job)| (i, job.position, job.record(resources, physical, frame_index)))
                .collect()
        } else {
            let per_worker = job_count.div_ceil(workers);
            let mut groups: Vec<Vec<(usize, Job<'_>)>> = (0..workers).map(|_| Vec::new()).collect();
            for (i, job) in jobs.into_iter().enumerate() {
                groups[i / per_worker].push((i, job));
            }

            std::thread::scope(|s| {
                let handles: Vec<_> = groups
                    .into_iter()
                    .map(|group| {
                        s.spawn(move || {
                            group
                                .into_iter()
                                .map(|(i, job)| {
                                    let position = job.position;
                                    (i, position, job.record(resources, physical, frame_index))
                                })
                                .collect::<Vec<_>>()
                        })
                    })
                    .collect();

                let mut results = Vec::with_capacity(job_count);
                for handle in handles {
                    match handle.join() {
                        Ok(list) => results.extend(list),
                        Err(_) => results.push((
                            usize::MAX,
                            usize::MAX,
                            Err(RenderError::Recording {
                                pass: "<worker>".to_string(),
                                message: "recording thread panicked".to_string(),
                            }),
                        )),
                    }
                }
                results
            })
        };

        results.sort_by_key(|(i, _, _)| *i);
        results
            .into_iter()
            .map(|(_, position, result)| result.map(|list| (position, list)))
            .collect()
    }
}

/// Assign physical textures in execution order and plan aliasing barriers
fn bind_targets<B: GraphicsBackend>(
    graph: &RenderGraph,
    compiled: &CompiledGraph,
    lease: &mut TargetLease<'_>,
    backend: &mut B,
) -> Result<(Vec<Option<TextureHandle>>, HashMap<usize, Vec<PhysicalBarrier>>)> {
    let resources = graph.resources();
    let mut physical: Vec<Option<TextureHandle>> = resources
        .iter()
        .map(|r| match r.kind {
            ResourceKind::Imported { texture, .. } => Some(texture),
            ResourceKind::Transient => None,
        })
        .collect();
    let mut history: HashMap<TextureHandle, PhysicalUse> = HashMap::new();
    let mut aliasing: HashMap<usize, Vec<PhysicalBarrier>> = HashMap::new();

    for (position, &id) in compiled.pass_order().iter().enumerate() {
        let Some(node) = graph.node(id) else {
            continue;
        };

        for usage in &node.uses {
            let index = usage.target.index();
            let resource = &resources[index];
            let Some(lifetime) = compiled.lifetime(usage.target) else {
                continue;
            };
            if !resource.is_transient() || lifetime.first_use != position {
                continue;
            }

            let texture = lease
                .acquire(index, &resource.description, &resource.name, backend)
                .map_err(|source| RenderError::ResourceExhausted {
                    pass: node.name.clone(),
                    resource: resource.name.clone(),
                    source,
                })?;
            physical[index] = Some(texture);

            if let Some(previous) = history.remove(&texture) {
                aliasing.entry(position).or_default().push(PhysicalBarrier {
                    texture,
                    resource: resource.name.clone(),
                    hazard: if previous.written && !usage.is_read() {
                        Hazard::WriteAfterWrite
                    } else {
                        Hazard::WriteAfterRead
                    },
                    src_stages: previous.stages,
                    dst_stages: usage.stages(),
                });
            }
        }

        for usage in &node.uses {
            let index = usage.target.index();
            let resource = &resources[index];
            let last_use = compiled.lifetime(usage.target).map(|l| l.last_use);
            if resource.is_transient() && last_use == Some(position) && !resource.exported {
                if let Some(texture) = physical[index] {
                    history.insert(
                        texture,
                        PhysicalUse {
                            stages: usage.stages(),
                            written: usage.is_write(),
                        },
                    );
                }
                lease.release(index);
            }
        }
    }

    Ok((physical, aliasing))
}

fn physical_texture(
    physical: &[Option<TextureHandle>],
    resources: &[VirtualResource],
    target: RenderTargetHandle,
    pass: &str,
) -> Result<TextureHandle> {
    physical.get(target.index()).copied().flatten().ok_or_else(|| {
        RenderError::Recording {
            pass: pass.to_string(),
            message: format!(
                "'{}' has no physical texture",
                resources
                    .get(target.index())
                    .map_or("<unknown>", |r| r.name.as_str())
            ),
        }
    })
}

/// Reject commands that touch a graph texture the pass never declared
fn check_declared(
    node: &PassNode,
    commands: &CommandList,
    resources: &[VirtualResource],
    physical: &[Option<TextureHandle>],
) -> Result<()> {
    let declared: HashSet<TextureHandle> = node
        .uses
        .iter()
        .filter_map(|u| physical.get(u.target.index()).copied().flatten())
        .collect();

    for texture in commands.referenced_textures() {
        if declared.contains(&texture) {
            continue;
        }
        if let Some(index) = physical.iter().position(|p| *p == Some(texture)) {
            return Err(GraphError::UndeclaredAccess {
                pass: node.name.clone(),
                resource: resources[index].name.clone(),
            }
            .into());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::UniformRingBuffer;

    /// Clears its outputs and samples its inputs, one chunk per `draws` entry
    struct ClearPass {
        name: String,
        reads: Vec<RenderTargetHandle>,
        writes: Vec<RenderTargetHandle>,
        chunks: u32,
    }

    impl ClearPass {
        fn new(name: &str, reads: &[RenderTargetHandle], writes: &[RenderTargetHandle]) -> Self {
            Self {
                name: name.to_string(),
                reads: reads.to_vec(),
                writes: writes.to_vec(),
                chunks: 1,
            }
        }

        fn with_chunks(mut self, chunks: u32) -> Self {
            self.chunks = chunks;
            self
        }
    }

    impl RenderPass for ClearPass {
        fn name(&self) -> &str {
            &self.name
        }

        fn setup(&self, ctx: &mut PassSetupContext) {
            for &r in &self.reads {
                ctx.read(r, PipelineStage::FragmentShader);
            }
            for &w in &self.writes {
                ctx.write(w, PipelineStage::ColorAttachmentOutput);
            }
        }

        fn chunk_count(&self) -> u32 {
            self.chunks
        }

        fn chunk_uniforms(&self, _chunk: u32) -> UniformRequest {
            UniformRequest::of::<[f32; 4]>(1)
        }

        fn record(&self, ctx: &mut PassRecordContext) -> Result<()> {
            let color = self
                .writes
                .iter()
                .map(|&w| ctx.texture(w).map(|t| ColorAttachment::clear(t, [0.0; 4])))
                .collect::<Result<Vec<_>>>()?;
            let inputs = self
                .reads
                .iter()
                .map(|&r| ctx.texture(r))
                .collect::<Result<Vec<_>>>()?;
            let token = ctx.push_uniforms(&[ctx.chunk_index() as f32; 4])?;
            ctx.bind_uniforms(0, &token)?;
            let label = format!("{} #{}", self.name, ctx.chunk_index());
            let commands = ctx.commands();
            commands.begin_render_pass(&label, color, None);
            for (binding, texture) in inputs.into_iter().enumerate() {
                commands.bind_texture(binding as u32 + 1, texture, SamplerKind::NearestClamp);
            }
            commands.draw_fullscreen_quad();
            commands.end_render_pass();
            Ok(())
        }
    }

    /// Binds a texture it never declared
    struct SneakyPass {
        texture: TextureHandle,
    }

    impl RenderPass for SneakyPass {
        fn name(&self) -> &str {
            "Sneaky"
        }

        fn setup(&self, _ctx: &mut PassSetupContext) {}

        fn record(&self, ctx: &mut PassRecordContext) -> Result<()> {
            ctx.commands()
                .bind_texture(0, self.texture, SamplerKind::LinearClamp);
            Ok(())
        }
    }

    fn rgba(size: u32) -> RenderTargetDescription {
        RenderTargetDescription::new(size, size, TextureFormat::Rgba8Unorm)
    }

    struct Harness {
        backend: RecordingBackend,
        pool: RenderTargetPool,
        ring: UniformRingBuffer,
    }

    impl Harness {
        fn new() -> Self {
            let mut backend = RecordingBackend::new();
            let ring = UniformRingBuffer::new(&mut backend, 64 * 1024, 2, 256).unwrap();
            Self {
                backend,
                pool: RenderTargetPool::new(2),
                ring,
            }
        }

        fn run(
            &mut self,
            executor: &RenderGraphExecutor,
            graph: &RenderGraph,
            frame: u64,
            present: Option<RenderTargetHandle>,
        ) -> Result<Submission> {
            let compiled = graph.compile()?;
            let mut uniforms = self.ring.begin_frame(frame, &mut self.backend)?;
            let result = executor.execute(
                graph,
                &compiled,
                &mut self.pool,
                &mut uniforms,
                &mut self.backend,
                present,
            );
            self.ring.abandon_frame(uniforms);
            result
        }
    }

    #[test]
    fn test_commands_follow_topological_order() {
        let mut harness = Harness::new();
        let mut graph = RenderGraph::new(16, 16);
        let a = graph.new_render_target("a", rgba(16)).unwrap();
        let b = graph.new_render_target("b", rgba(16)).unwrap();
        graph.add_pass(ClearPass::new("Second", &[a], &[b])).unwrap();
        graph.add_pass(ClearPass::new("First", &[], &[a]).with_chunks(3)).unwrap();
        graph.export(b).unwrap();

        let executor = RenderGraphExecutor::new(4);
        let submission = harness.run(&executor, &graph, 0, Some(b)).unwrap();

        assert_eq!(submission.pass_names().collect::<Vec<_>>(), ["First", "Second"]);
        assert_eq!(submission.passes[0].commands.draw_count(), 3);
        let labels: Vec<_> = submission.passes[0]
            .commands
            .commands()
            .iter()
            .filter_map(|c| match c {
                Command::BeginRenderPass { label, .. } => Some(label.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(labels, ["First #0", "First #1", "First #2"]);
        assert_eq!(submission.passes[1].barriers.len(), 1);
        assert_eq!(submission.passes[1].barriers[0].resource, "a");
        assert!(submission.present.is_some());
    }

    #[test]
    fn test_parallel_matches_serial() {
        let build = || {
            let mut graph = RenderGraph::new(16, 16);
            let a = graph.new_render_target("a", rgba(16)).unwrap();
            let b = graph.new_render_target("b", rgba(8)).unwrap();
            graph.add_pass(ClearPass::new("A", &[], &[a]).with_chunks(5)).unwrap();
            graph.add_pass(ClearPass::new("B", &[a], &[b]).with_chunks(2)).unwrap();
            graph.add_pass(ClearPass::new("C", &[b], &[]).with_chunks(1)).unwrap();
            graph
        };

        let serial = Harness::new()
            .run(&RenderGraphExecutor::new(1), &build(), 0, None)
            .unwrap();
        let parallel = Harness::new()
            .run(&RenderGraphExecutor::new(8), &build(), 0, None)
            .unwrap();

        for (s, p) in serial.passes.iter().zip(&parallel.passes) {
            assert_eq!(s.name, p.name);
            assert_eq!(s.commands, p.commands);
            assert_eq!(s.barriers, p.barriers);
        }
    }

    #[test]
    fn test_transient_reused_with_aliasing_barrier() {
        let mut harness = Harness::new();
        let mut graph = RenderGraph::new(16, 16);
        let first = graph.new_render_target("first", rgba(16)).unwrap();
        let second = graph.new_render_target("second", rgba(16)).unwrap();
        graph.add_pass(ClearPass::new("Early", &[], &[first])).unwrap();
        graph.add_pass(ClearPass::new("Late", &[], &[second])).unwrap();

        let submission = harness
            .run(&RenderGraphExecutor::new(1), &graph, 0, None)
            .unwrap();

        assert_eq!(harness.backend.textures_created(), 1);
        let barrier = &submission.passes[1].barriers[0];
        assert_eq!(barrier.resource, "second");
        assert_eq!(barrier.hazard, Hazard::WriteAfterWrite);
        assert_eq!(harness.pool.live_count(), 0);
    }

    #[test]
    fn test_exhaustion_releases_targets() {
        let mut harness = Harness::new();
        harness.backend = RecordingBackend::new().with_texture_budget(1);
        let mut graph = RenderGraph::new(16, 16);
        let a = graph.new_render_target("a", rgba(16)).unwrap();
        let b = graph.new_render_target("b", rgba(8)).unwrap();
        graph.add_pass(ClearPass::new("Both", &[], &[a, b])).unwrap();

        let error = harness
            .run(&RenderGraphExecutor::new(1), &graph, 0, None)
            .unwrap_err();
        assert!(matches!(
            error,
            RenderError::ResourceExhausted { ref pass, ref resource, source: BackendError::OutOfMemory }
                if pass == "Both" && resource == "b"
        ));
        assert_eq!(harness.pool.live_count(), 0);
        assert_eq!(harness.pool.free_count(), 1);
        assert!(harness.backend.submissions().is_empty());
    }

    #[test]
    fn test_undeclared_binding_rejected() {
        let mut harness = Harness::new();
        let mut graph = RenderGraph::new(16, 16);
        let hidden = graph.new_render_target("hidden", rgba(16)).unwrap();
        graph.add_pass(ClearPass::new("Owner", &[], &[hidden])).unwrap();
        graph.export(hidden).unwrap();

        // Find the texture the pool will hand out, then bind it behind the graph's back
        let probe = harness
            .run(&RenderGraphExecutor::new(1), &graph, 0, Some(hidden))
            .unwrap();
        let texture = probe.present.unwrap();
        graph.add_pass(SneakyPass { texture }).unwrap();

        let error = harness
            .run(&RenderGraphExecutor::new(1), &graph, 1, Some(hidden))
            .unwrap_err();
        assert_eq!(
            error,
            RenderError::Graph(GraphError::UndeclaredAccess {
                pass: "Sneaky".into(),
                resource: "hidden".into()
            })
        );
    }

    #[test]
    fn test_present_requires_export() {
        let mut harness = Harness::new();
        let mut graph = RenderGraph::new(16, 16);
        let color = graph.new_render_target("color", rgba(16)).unwrap();
        graph.add_pass(ClearPass::new("Color", &[], &[color])).unwrap();

        let error = harness
            .run(&RenderGraphExecutor::new(1), &graph, 0, Some(color))
            .unwrap_err();
        assert_eq!(error.category(), crate::error::ErrorCategory::Configuration);
    }
}
