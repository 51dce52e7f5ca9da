//! Render graph definition and compilation

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use crate::backend::{PipelineStages, TextureHandle};
use crate::error::GraphError;
use crate::render_graph::pass::*;
use crate::render_graph::resource::*;

/// The passes and render targets of one frame.
///
/// Rebuilt every frame. Resources are created up front by the code that
/// builds each pass; passes then declare how they touch them.
pub struct RenderGraph {
    width: u32,
    height: u32,
    resources: Vec<VirtualResource>,
    passes: Vec<Box<dyn RenderPass>>,
    nodes: Vec<PassNode>,
}

impl RenderGraph {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            resources: Vec::new(),
            passes: Vec::new(),
            nodes: Vec::new(),
        }
    }

    pub fn screen_size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Create a transient render target backed by the pool for this frame only
    pub fn new_render_target(
        &mut self,
        name: &str,
        description: RenderTargetDescription,
    ) -> Result<RenderTargetHandle, GraphError> {
        description.validate(name)?;
        Ok(self.push_resource(name, description, ResourceKind::Transient))
    }

    /// Register a texture owned outside the graph
    pub fn import_texture(
        &mut self,
        name: &str,
        texture: TextureHandle,
        description: RenderTargetDescription,
        initial: Option<ExternalState>,
    ) -> RenderTargetHandle {
        self.push_resource(name, description, ResourceKind::Imported { texture, initial })
    }

    fn push_resource(
        &mut self,
        name: &str,
        description: RenderTargetDescription,
        kind: ResourceKind,
    ) -> RenderTargetHandle {
        let handle = RenderTargetHandle(self.resources.len() as u32);
        self.resources.push(VirtualResource {
            name: name.to_string(),
            description,
            kind,
            exported: false,
        });
        handle
    }

    /// Keep a transient resource alive until the end of the frame
    pub fn export(&mut self, target: RenderTargetHandle) -> Result<(), GraphError> {
        let resource = self
            .resources
            .get_mut(target.index())
            .ok_or(GraphError::UnknownResource {
                pass: "<export>".to_string(),
                index: target.0,
            })?;
        resource.exported = true;
        Ok(())
    }

    pub fn resource(&self, target: RenderTargetHandle) -> Option<&VirtualResource> {
        self.resources.get(target.index())
    }

    pub fn resources(&self) -> &[VirtualResource] {
        &self.resources
    }

    /// Add a render pass to the graph
    pub fn add_pass<P: RenderPass + 'static>(&mut self, pass: P) -> Result<PassId, GraphError> {
        let id = PassId(self.passes.len() as u32);
        let name = pass.name().to_string();

        let mut ctx = PassSetupContext::new(&name, self.resources.len() as u32);
        pass.setup(&mut ctx);
        let uses = ctx.finish()?;

        self.nodes.push(PassNode {
            id,
            pass_type: pass.pass_type(),
            name,
            uses,
        });
        self.passes.push(Box::new(pass));
        Ok(id)
    }

    pub fn pass_count(&self) -> usize {
        self.passes.len()
    }

    /// Get pass by ID
    pub fn pass(&self, id: PassId) -> Option<&dyn RenderPass> {
        self.passes.get(id.index()).map(|p| p.as_ref())
    }

    /// Get pass node by ID
    pub fn node(&self, id: PassId) -> Option<&PassNode> {
        self.nodes.get(id.index())
    }

    pub fn nodes(&self) -> &[PassNode] {
        &self.nodes
    }

    /// Order the passes, synthesize barriers and compute resource lifetimes.
    pub fn compile(&self) -> Result<CompiledGraph, GraphError> {
        let successors = self.build_edges()?;
        let order = self.sort(&successors)?;

        let mut position = vec![0usize; self.nodes.len()];
        for (pos, id) in order.iter().enumerate() {
            position[id.index()] = pos;
        }

        let barriers = self.plan_barriers(&order);
        let lifetimes = self.plan_lifetimes(&order);
        let names = order
            .iter()
            .map(|id| self.nodes[id.index()].name.clone())
            .collect();

        Ok(CompiledGraph {
            order,
            position,
            barriers,
            lifetimes,
            names,
        })
    }

    /// Successor lists, deduplicated and sorted
    fn build_edges(&self) -> Result<Vec<Vec<usize>>, GraphError> {
        let mut successors: Vec<Vec<usize>> = vec![Vec::new(); self.nodes.len()];

        for (index, resource) in self.resources.iter().enumerate() {
            let target = RenderTargetHandle(index as u32);
            let writers: Vec<usize> = self
                .nodes
                .iter()
                .enumerate()
                .filter(|(_, n)| n.writes_resource(target))
                .map(|(i, _)| i)
                .collect();

            // Write-after-write follows registration order
            for pair in writers.windows(2) {
                successors[pair[0]].push(pair[1]);
            }

            for (reader, node) in self.nodes.iter().enumerate() {
                let Some(usage) = node.use_of(target) else {
                    continue;
                };
                if usage.is_write() {
                    continue;
                }
                if writers.is_empty() && resource.is_transient() {
                    return Err(GraphError::UndefinedRead {
                        pass: node.name.clone(),
                        resource: resource.name.clone(),
                    });
                }
                for &writer in &writers {
                    successors[writer].push(reader);
                }
            }
        }

        for list in &mut successors {
            list.sort_unstable();
            list.dedup();
        }
        Ok(successors)
    }

    /// Kahn's algorithm, always taking the earliest registered ready pass
    fn sort(&self, successors: &[Vec<usize>]) -> Result<Vec<PassId>, GraphError> {
        let count = self.nodes.len();
        let mut in_degree = vec![0usize; count];
        for list in successors {
            for &s in list {
                in_degree[s] += 1;
            }
        }

        let mut ready: BinaryHeap<Reverse<usize>> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, &d)| d == 0)
            .map(|(i, _)| Reverse(i))
            .collect();

        let mut order = Vec::with_capacity(count);
        while let Some(Reverse(index)) = ready.pop() {
            order.push(PassId(index as u32));
            for &s in &successors[index] {
                in_degree[s] -= 1;
                if in_degree[s] == 0 {
                    ready.push(Reverse(s));
                }
            }
        }

        if order.len() < count {
            return Err(GraphError::Cycle {
                passes: self.find_cycle(successors, &in_degree),
            });
        }
        Ok(order)
    }

    /// Names along one cycle among the passes Kahn's algorithm could not place.
    ///
    /// Every such pass has an unplaced predecessor, so walking predecessors
    /// from the earliest one must revisit a pass.
    fn find_cycle(&self, successors: &[Vec<usize>], in_degree: &[usize]) -> Vec<String> {
        let stuck = |i: usize| in_degree[i] > 0;
        let Some(start) = (0..self.nodes.len()).find(|&i| stuck(i)) else {
            return Vec::new();
        };

        let mut path = vec![start];
        let mut current = start;
        loop {
            let predecessor = (0..self.nodes.len())
                .find(|&p| stuck(p) && successors[p].binary_search(&current).is_ok());
            let Some(predecessor) = predecessor else {
                break;
            };
            if let Some(seen) = path.iter().position(|&p| p == predecessor) {
                path.drain(..seen);
                break;
            }
            path.push(predecessor);
            current = predecessor;
        }

        // Walked backwards; report in execution direction starting from the
        // earliest registered pass of the cycle
        path.reverse();
        if let Some(min) = path.iter().enumerate().min_by_key(|(_, &p)| p).map(|(i, _)| i) {
            path.rotate_left(min);
        }
        if let Some(&first) = path.first() {
            path.push(first);
        }
        path.into_iter()
            .map(|i| self.nodes[i].name.clone())
            .collect()
    }

    fn plan_barriers(&self, order: &[PassId]) -> Vec<Vec<Barrier>> {
        let mut states: Vec<AccessState> = self
            .resources
            .iter()
            .map(|r| match r.kind {
                ResourceKind::Imported {
                    initial: Some(state),
                    ..
                } => AccessState::external(state),
                _ => AccessState::default(),
            })
            .collect();

        order
            .iter()
            .map(|id| {
                let node = &self.nodes[id.index()];
                let mut barriers = Vec::new();
                for usage in &node.uses {
                    states[usage.target.index()].apply(usage, &mut barriers);
                }
                barriers
            })
            .collect()
    }

    fn plan_lifetimes(&self, order: &[PassId]) -> Vec<Option<ResourceLifetime>> {
        let mut lifetimes: Vec<Option<ResourceLifetime>> = vec![None; self.resources.len()];
        for (pos, id) in order.iter().enumerate() {
            for usage in &self.nodes[id.index()].uses {
                let lifetime = lifetimes[usage.target.index()].get_or_insert(ResourceLifetime {
                    first_use: pos,
                    last_use: pos,
                });
                lifetime.last_use = pos;
            }
        }

        if let Some(end) = order.len().checked_sub(1) {
            for (resource, lifetime) in self.resources.iter().zip(lifetimes.iter_mut()) {
                match lifetime {
                    Some(lifetime) if resource.exported => lifetime.last_use = end,
                    _ => {}
                }
            }
        }
        lifetimes
    }
}

/// Per-resource synchronization state while walking the execution order
#[derive(Debug, Default)]
struct AccessState {
    /// Stages of the most recent write
    last_write: Option<PipelineStages>,
    /// Stages that already waited for the most recent write
    synced: PipelineStages,
    /// Stages that read since the most recent write
    readers: PipelineStages,
}

impl AccessState {
    fn external(state: ExternalState) -> Self {
        match state.access {
            Access::Write => Self {
                last_write: Some(state.stage.flags()),
                ..Default::default()
            },
            Access::Read => Self {
                readers: state.stage.flags(),
                ..Default::default()
            },
        }
    }

    fn apply(&mut self, usage: &ResourceUse, barriers: &mut Vec<Barrier>) {
        if usage.is_read() {
            if let Some(write) = self.last_write {
                if !self.synced.contains(usage.read_stages) {
                    barriers.push(Barrier {
                        target: usage.target,
                        hazard: Hazard::ReadAfterWrite,
                        src_stages: write,
                        dst_stages: usage.read_stages,
                    });
                    self.synced |= usage.read_stages;
                }
            }
        }

        if usage.is_write() {
            if !self.readers.is_empty() {
                barriers.push(Barrier {
                    target: usage.target,
                    hazard: Hazard::WriteAfterRead,
                    src_stages: self.readers,
                    dst_stages: usage.write_stages,
                });
            } else if let (Some(write), false) = (self.last_write, usage.is_read()) {
                barriers.push(Barrier {
                    target: usage.target,
                    hazard: Hazard::WriteAfterWrite,
                    src_stages: write,
                    dst_stages: usage.write_stages,
                });
            }
            self.last_write = Some(usage.write_stages);
            self.synced = PipelineStages::empty();
            self.readers = PipelineStages::empty();
        } else {
            self.readers |= usage.read_stages;
        }
    }
}

/// Compiled render graph with execution order, barriers and resource lifetimes
#[derive(Debug, Clone)]
pub struct CompiledGraph {
    order: Vec<PassId>,
    /// Execution position of each pass, by registration index
    position: Vec<usize>,
    barriers: Vec<Vec<Barrier>>,
    lifetimes: Vec<Option<ResourceLifetime>>,
    names: Vec<String>,
}

impl CompiledGraph {
    pub fn pass_order(&self) -> &[PassId] {
        &self.order
    }

    pub fn position_of(&self, pass: PassId) -> Option<usize> {
        self.position.get(pass.index()).copied()
    }

    pub fn pass_name(&self, position: usize) -> Option<&str> {
        self.names.get(position).map(String::as_str)
    }

    pub fn pass_names(&self) -> &[String] {
        &self.names
    }

    /// Barriers to resolve before the pass at `position` starts
    pub fn barriers_before(&self, position: usize) -> &[Barrier] {
        match self.barriers.get(position) {
            Some(list) => list,
            None => &[],
        }
    }

    /// Every barrier with the position of the pass that waits on it
    pub fn barriers(&self) -> impl Iterator<Item = (usize, &Barrier)> {
        self.barriers
            .iter()
            .enumerate()
            .flat_map(|(pos, list)| list.iter().map(move |b| (pos, b)))
    }

    pub fn barrier_count(&self) -> usize {
        self.barriers.iter().map(Vec::len).sum()
    }

    /// `None` for resources no pass touches
    pub fn lifetime(&self, target: RenderTargetHandle) -> Option<ResourceLifetime> {
        self.lifetimes.get(target.index()).copied().flatten()
    }

    /// Check if a resource is alive at a given execution step
    pub fn is_resource_alive(&self, target: RenderTargetHandle, step: usize) -> bool {
        self.lifetime(target)
            .is_some_and(|l| step >= l.first_use && step <= l.last_use)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::TextureFormat;
    use crate::error::Result;

    struct TestPass {
        name: String,
        reads: Vec<RenderTargetHandle>,
        writes: Vec<RenderTargetHandle>,
    }

    impl TestPass {
        fn new(name: &str, reads: &[RenderTargetHandle], writes: &[RenderTargetHandle]) -> Self {
            Self {
                name: name.to_string(),
                reads: reads.to_vec(),
                writes: writes.to_vec(),
            }
        }
    }

    impl RenderPass for TestPass {
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

        fn record(&self, _ctx: &mut PassRecordContext) -> Result<()> {
            Ok(())
        }
    }

    fn target(graph: &mut RenderGraph, name: &str) -> RenderTargetHandle {
        graph
            .new_render_target(name, RenderTargetDescription::new(8, 8, TextureFormat::Rgba8Unorm))
            .unwrap()
    }

    #[test]
    fn test_reader_after_writer() {
        let mut graph = RenderGraph::new(8, 8);
        let color = target(&mut graph, "color");
        graph.add_pass(TestPass::new("Read", &[color], &[])).unwrap();
        graph.add_pass(TestPass::new("Write", &[], &[color])).unwrap();

        let compiled = graph.compile().unwrap();
        assert_eq!(compiled.pass_names(), ["Write", "Read"]);
        let barriers = compiled.barriers_before(1);
        assert_eq!(barriers.len(), 1);
        assert_eq!(barriers[0].hazard, Hazard::ReadAfterWrite);
    }

    #[test]
    fn test_independent_passes_keep_registration_order() {
        let mut graph = RenderGraph::new(8, 8);
        let a = target(&mut graph, "a");
        let b = target(&mut graph, "b");
        let c = target(&mut graph, "c");
        graph.add_pass(TestPass::new("C", &[], &[c])).unwrap();
        graph.add_pass(TestPass::new("A", &[], &[a])).unwrap();
        graph.add_pass(TestPass::new("B", &[], &[b])).unwrap();

        let compiled = graph.compile().unwrap();
        assert_eq!(compiled.pass_names(), ["C", "A", "B"]);
        assert_eq!(compiled.barrier_count(), 0);
    }

    #[test]
    fn test_cycle_reports_path() {
        let mut graph = RenderGraph::new(8, 8);
        let x = target(&mut graph, "x");
        let y = target(&mut graph, "y");
        graph.add_pass(TestPass::new("Unrelated", &[], &[])).unwrap();
        graph.add_pass(TestPass::new("A", &[y], &[x])).unwrap();
        graph.add_pass(TestPass::new("B", &[x], &[y])).unwrap();

        let error = graph.compile().unwrap_err();
        assert_eq!(
            error,
            GraphError::Cycle {
                passes: vec!["A".into(), "B".into(), "A".into()]
            }
        );
    }

    #[test]
    fn test_undefined_read() {
        let mut graph = RenderGraph::new(8, 8);
        let ghost = target(&mut graph, "ghost");
        graph.add_pass(TestPass::new("Reader", &[ghost], &[])).unwrap();
        assert_eq!(
            graph.compile().unwrap_err(),
            GraphError::UndefinedRead {
                pass: "Reader".into(),
                resource: "ghost".into()
            }
        );
    }

    #[test]
    fn test_imported_read_is_defined() {
        let mut graph = RenderGraph::new(8, 8);
        let probe = graph.import_texture(
            "probe",
            TextureHandle(42),
            RenderTargetDescription::new(8, 8, TextureFormat::Rgba16Float),
            Some(ExternalState {
                access: Access::Write,
                stage: PipelineStage::Transfer,
            }),
        );
        let out = target(&mut graph, "out");
        graph.add_pass(TestPass::new("Sample", &[probe], &[out])).unwrap();

        let compiled = graph.compile().unwrap();
        assert_eq!(compiled.barriers_before(0).len(), 1);
        assert_eq!(compiled.barriers_before(0)[0].target, probe);
    }

    #[test]
    fn test_read_after_read_has_no_barrier() {
        let mut graph = RenderGraph::new(8, 8);
        let depth = target(&mut graph, "depth");
        let out_a = target(&mut graph, "out_a");
        let out_b = target(&mut graph, "out_b");
        graph.add_pass(TestPass::new("Write", &[], &[depth])).unwrap();
        graph.add_pass(TestPass::new("ReadA", &[depth], &[out_a])).unwrap();
        graph.add_pass(TestPass::new("ReadB", &[depth], &[out_b])).unwrap();

        let compiled = graph.compile().unwrap();
        assert_eq!(compiled.barriers_before(1).len(), 1);
        assert!(compiled.barriers_before(2).is_empty());
    }

    #[test]
    fn test_write_after_write_barrier() {
        let mut graph = RenderGraph::new(8, 8);
        let color = target(&mut graph, "color");
        let out = target(&mut graph, "out");
        graph.add_pass(TestPass::new("Write", &[], &[color])).unwrap();
        graph.add_pass(TestPass::new("Read", &[color], &[out])).unwrap();
        graph.add_pass(TestPass::new("Overwrite", &[], &[color])).unwrap();

        // Readers depend on every writer, so "Read" moves after "Overwrite"
        let compiled = graph.compile().unwrap();
        assert_eq!(compiled.pass_names(), ["Write", "Overwrite", "Read"]);
        assert_eq!(compiled.barriers_before(1)[0].hazard, Hazard::WriteAfterWrite);
        assert_eq!(compiled.barriers_before(2)[0].hazard, Hazard::ReadAfterWrite);
    }

    #[test]
    fn test_write_after_read_barrier() {
        let mut graph = RenderGraph::new(8, 8);
        let history = graph.import_texture(
            "history",
            TextureHandle(7),
            RenderTargetDescription::new(8, 8, TextureFormat::Rgba16Float),
            Some(ExternalState {
                access: Access::Read,
                stage: PipelineStage::FragmentShader,
            }),
        );
        graph.add_pass(TestPass::new("Store", &[], &[history])).unwrap();

        let compiled = graph.compile().unwrap();
        let barrier = compiled.barriers_before(0)[0];
        assert_eq!(barrier.hazard, Hazard::WriteAfterRead);
        assert_eq!(barrier.src_stages, PipelineStages::FRAGMENT_SHADER);
    }

    #[test]
    fn test_unused_output_released_after_writer() {
        let mut graph = RenderGraph::new(8, 8);
        let scratch = target(&mut graph, "scratch");
        let color = target(&mut graph, "color");
        let untouched = target(&mut graph, "untouched");
        graph.add_pass(TestPass::new("Scratch", &[], &[scratch])).unwrap();
        graph.add_pass(TestPass::new("Color", &[], &[color])).unwrap();
        graph.add_pass(TestPass::new("Final", &[color], &[])).unwrap();
        graph.export(color).unwrap();

        let compiled = graph.compile().unwrap();
        assert_eq!(
            compiled.lifetime(scratch),
            Some(ResourceLifetime {
                first_use: 0,
                last_use: 0
            })
        );
        assert_eq!(compiled.lifetime(color).unwrap().last_use, 2);
        assert!(compiled.lifetime(untouched).is_none());
        assert!(compiled.is_resource_alive(color, 2));
    }

    #[test]
    fn test_invalid_description_rejected() {
        let mut graph = RenderGraph::new(8, 8);
        let result =
            graph.new_render_target("empty", RenderTargetDescription::new(0, 0, TextureFormat::R32Float));
        assert!(matches!(result, Err(GraphError::InvalidDescription { .. })));
        assert!(graph.resources().is_empty());
    }
}
