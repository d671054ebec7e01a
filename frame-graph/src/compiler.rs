use crate::aliasing::{
    self, AliasCandidate, AliasSignature, BucketAssignment, BucketId, assign_buckets,
};
use crate::device::DeviceLayer;
use crate::pass::{PassId, PassNode};
use crate::resources::{
    BufferDescriptor, ResourceDescriptor, ResourceHandle, ResourceLifetime, ResourceRegistry,
};
use crate::{RenderGraphError, Result};
use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use wgpu::StoreOp;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileOptions {
    /// When disabled every transient resource gets a dedicated bucket.
    pub aliasing: bool,
    /// Drop passes whose outputs never reach an imported resource.
    pub cull_unused_passes: bool,
    /// Buffers whose sizes round up to the same multiple may share a bucket.
    pub buffer_size_granularity: u64,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            aliasing: true,
            cull_unused_passes: false,
            buffer_size_granularity: 64 * 1024,
        }
    }
}

impl CompileOptions {
    pub fn with_aliasing(mut self, enabled: bool) -> Self {
        self.aliasing = enabled;
        self
    }

    pub fn with_culling(mut self, enabled: bool) -> Self {
        self.cull_unused_passes = enabled;
        self
    }

    pub fn with_buffer_size_granularity(mut self, granularity: u64) -> Self {
        self.buffer_size_granularity = granularity;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DependencyEdge {
    pub from: PassId,
    pub to: PassId,
    /// The resource that first caused this edge.
    pub resource: ResourceHandle,
}

/// One physical allocation shared by non-overlapping transient resources.
#[derive(Debug, Clone)]
pub struct PhysicalBucket {
    pub id: BucketId,
    pub signature: AliasSignature,
    /// What the device layer is asked to allocate; usages are the union of the occupants'.
    pub descriptor: ResourceDescriptor,
    pub occupants: Vec<ResourceHandle>,
}

/// Output of [`RenderGraph::compile`](crate::RenderGraph::compile).
///
/// A plan is plain data: it can be cloned, kept as a fallback when a later
/// compile fails, and shared read-only with recording threads.
#[derive(Debug, Clone)]
pub struct CompiledPlan {
    pub(crate) plan_id: u64,
    pub(crate) topology_version: u64,
    order: Vec<PassId>,
    positions: HashMap<PassId, usize>,
    culled: Vec<PassId>,
    edges: Vec<DependencyEdge>,
    lifetimes: Vec<Option<ResourceLifetime>>,
    bucket_of: Vec<Option<BucketId>>,
    buckets: Vec<PhysicalBucket>,
    store_ops: HashMap<(PassId, ResourceHandle), StoreOp>,
    transient_bytes: u64,
    physical_bytes: u64,
}

impl CompiledPlan {
    pub fn topology_version(&self) -> u64 {
        self.topology_version
    }

    pub fn order(&self) -> &[PassId] {
        &self.order
    }

    pub fn position_of(&self, pass: PassId) -> Option<usize> {
        self.positions.get(&pass).copied()
    }

    pub fn culled_passes(&self) -> &[PassId] {
        &self.culled
    }

    pub fn edges(&self) -> &[DependencyEdge] {
        &self.edges
    }

    pub fn dependencies_of(&self, pass: PassId) -> impl Iterator<Item = PassId> + '_ {
        self.edges
            .iter()
            .filter(move |edge| edge.to == pass)
            .map(|edge| edge.from)
    }

    /// Groups the order into waves; passes in the same wave have no dependency
    /// path between them and may be recorded in parallel.
    pub fn dependency_levels(&self) -> Vec<Vec<PassId>> {
        let mut levels: HashMap<PassId, usize> = HashMap::new();
        let mut waves: Vec<Vec<PassId>> = Vec::new();

        for &pass in &self.order {
            let level = self
                .dependencies_of(pass)
                .filter_map(|dependency| levels.get(&dependency))
                .map(|level| level + 1)
                .max()
                .unwrap_or(0);
            levels.insert(pass, level);

            if waves.len() <= level {
                waves.resize_with(level + 1, Vec::new);
            }
            waves[level].push(pass);
        }

        waves
    }

    pub fn lifetime(&self, handle: ResourceHandle) -> Option<ResourceLifetime> {
        self.lifetimes.get(handle.index()).copied().flatten()
    }

    pub(crate) fn lifetimes(&self) -> &[Option<ResourceLifetime>] {
        &self.lifetimes
    }

    pub fn bucket_of(&self, handle: ResourceHandle) -> Option<BucketId> {
        self.bucket_of.get(handle.index()).copied().flatten()
    }

    pub fn buckets(&self) -> &[PhysicalBucket] {
        &self.buckets
    }

    pub fn bucket(&self, id: BucketId) -> Option<&PhysicalBucket> {
        self.buckets.get(id.index())
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Peak number of aliasable resources live at one position of the order.
    pub fn high_water_mark(&self) -> usize {
        aliasing::high_water_mark(
            self.lifetimes
                .iter()
                .zip(&self.bucket_of)
                .filter(|(_, bucket)| bucket.is_some())
                .filter_map(|(lifetime, _)| *lifetime),
        )
    }

    /// `Discard` when nothing later in the order reads what `pass` wrote.
    pub fn store_op(&self, pass: PassId, handle: ResourceHandle) -> StoreOp {
        self.store_ops
            .get(&(pass, handle))
            .copied()
            .unwrap_or(StoreOp::Store)
    }

    /// Sum of the sizes of every transient resource as if none were aliased.
    pub fn transient_bytes(&self) -> u64 {
        self.transient_bytes
    }

    /// Sum of the sizes of the physical buckets.
    pub fn physical_bytes(&self) -> u64 {
        self.physical_bytes
    }
}

pub(crate) fn compile<D: DeviceLayer>(
    passes: &[PassNode<D>],
    resources: &ResourceRegistry<D::Physical>,
    options: &CompileOptions,
    plan_id: u64,
    topology_version: u64,
) -> Result<CompiledPlan> {
    if let Some(error) = passes.iter().find_map(|pass| pass.errors.first()) {
        return Err(error.clone());
    }
    validate_written_resources(passes, resources)?;

    let (graph, edges) = build_dependency_graph(passes, resources);
    let order = topological_order(&graph, passes)?;

    let (order, culled) = if options.cull_unused_passes {
        cull_unused_passes(passes, resources, order)
    } else {
        (order, Vec::new())
    };
    let positions = order
        .iter()
        .enumerate()
        .map(|(position, &pass)| (pass, position))
        .collect();

    let lifetimes = compute_resource_lifetimes(passes, resources.len(), &order);
    let (bucket_of, buckets) = compute_aliasing(resources, &lifetimes, options);
    let store_ops = compute_store_ops(passes, resources, &order);

    let transient_bytes = resources
        .iter()
        .filter(|(handle, _)| bucket_of[handle.index()].is_some())
        .filter_map(|(_, entry)| entry.descriptor())
        .map(ResourceDescriptor::byte_size)
        .sum();
    let physical_bytes = buckets
        .iter()
        .map(|bucket| bucket.descriptor.byte_size())
        .sum();

    Ok(CompiledPlan {
        plan_id,
        topology_version,
        order,
        positions,
        culled,
        edges,
        lifetimes,
        bucket_of,
        buckets,
        store_ops,
        transient_bytes,
        physical_bytes,
    })
}

fn validate_written_resources<D: DeviceLayer>(
    passes: &[PassNode<D>],
    resources: &ResourceRegistry<D::Physical>,
) -> Result<()> {
    for (_, entry) in resources.iter() {
        if entry.is_imported() || !entry.writers().is_empty() {
            continue;
        }
        if let Some(&reader) = entry.consumers().first() {
            return Err(RenderGraphError::UnwrittenResource {
                resource: entry.name().to_string(),
                reader: passes[reader.index()].name().to_string(),
            });
        }
    }
    Ok(())
}

type DependencyGraph = DiGraph<PassId, ResourceHandle>;

fn connect(
    graph: &mut DependencyGraph,
    edges: &mut Vec<DependencyEdge>,
    from: PassId,
    to: PassId,
    resource: ResourceHandle,
) {
    if from == to {
        return;
    }
    let (a, b) = (NodeIndex::new(from.index()), NodeIndex::new(to.index()));
    if !graph.contains_edge(a, b) {
        graph.add_edge(a, b, resource);
        edges.push(DependencyEdge { from, to, resource });
    }
}

/// Node `i` of the returned graph is the pass declared `i`-th.
fn build_dependency_graph<D: DeviceLayer>(
    passes: &[PassNode<D>],
    resources: &ResourceRegistry<D::Physical>,
) -> (DependencyGraph, Vec<DependencyEdge>) {
    let mut graph = DependencyGraph::with_capacity(passes.len(), 0);
    for pass in passes {
        graph.add_node(pass.id());
    }
    let mut edges = Vec::new();

    for (handle, entry) in resources.iter() {
        // An imported resource already holds content when the frame starts, so
        // every writer modifies it and readers are ordered by declaration.
        let modifiers = match entry.producer() {
            Some(producer) => {
                for &pass in entry.consumers().iter().chain(&entry.writers()[1..]) {
                    connect(&mut graph, &mut edges, producer, pass, handle);
                }
                &entry.writers()[1..]
            }
            None => entry.writers(),
        };

        // Modifiers version the resource in declaration order.
        for pair in modifiers.windows(2) {
            connect(&mut graph, &mut edges, pair[0], pair[1], handle);
        }
        for &reader in entry.consumers() {
            if let Some(&source) = modifiers.iter().rev().find(|&&writer| writer < reader) {
                connect(&mut graph, &mut edges, source, reader, handle);
            }
            if let Some(&next) = modifiers.iter().find(|&&writer| writer > reader) {
                connect(&mut graph, &mut edges, reader, next, handle);
            }
        }
    }

    (graph, edges)
}

/// Kahn's algorithm; among ready passes the earliest declared runs first.
fn topological_order<D: DeviceLayer>(
    graph: &DependencyGraph,
    passes: &[PassNode<D>],
) -> Result<Vec<PassId>> {
    let mut in_degree: Vec<usize> = graph
        .node_indices()
        .map(|node| graph.neighbors_directed(node, Direction::Incoming).count())
        .collect();

    let mut ready: BinaryHeap<Reverse<NodeIndex>> = graph
        .node_indices()
        .filter(|node| in_degree[node.index()] == 0)
        .map(Reverse)
        .collect();

    let mut order = Vec::with_capacity(graph.node_count());
    while let Some(Reverse(node)) = ready.pop() {
        order.push(graph[node]);
        for next in graph.neighbors_directed(node, Direction::Outgoing) {
            in_degree[next.index()] -= 1;
            if in_degree[next.index()] == 0 {
                ready.push(Reverse(next));
            }
        }
    }

    if order.len() < graph.node_count() {
        let cycle = find_cycle(graph, &in_degree)
            .into_iter()
            .map(|node| passes[node.index()].name().to_string())
            .collect();
        return Err(RenderGraphError::CyclicDependency { cycle });
    }

    Ok(order)
}

/// Every pass left with a non-zero in-degree has an unresolved predecessor, so
/// walking predecessors from any of them must revisit a node.
fn find_cycle(graph: &DependencyGraph, in_degree: &[usize]) -> Vec<NodeIndex> {
    let unresolved = |node: &NodeIndex| in_degree[node.index()] > 0;

    let Some(mut current) = graph.node_indices().find(unresolved) else {
        return Vec::new();
    };
    let mut path: Vec<NodeIndex> = Vec::new();
    let mut seen: HashMap<NodeIndex, usize> = HashMap::new();

    loop {
        if let Some(&start) = seen.get(&current) {
            let mut cycle: Vec<NodeIndex> = path[start..].iter().rev().copied().collect();
            if let Some(first) = cycle
                .iter()
                .enumerate()
                .min_by_key(|(_, node)| **node)
                .map(|(index, _)| index)
            {
                cycle.rotate_left(first);
            }
            if let Some(&head) = cycle.first() {
                cycle.push(head);
            }
            return cycle;
        }
        seen.insert(current, path.len());
        path.push(current);

        match graph
            .neighbors_directed(current, Direction::Incoming)
            .find(unresolved)
        {
            Some(predecessor) => current = predecessor,
            None => return path,
        }
    }
}

fn cull_unused_passes<D: DeviceLayer>(
    passes: &[PassNode<D>],
    resources: &ResourceRegistry<D::Physical>,
    order: Vec<PassId>,
) -> (Vec<PassId>, Vec<PassId>) {
    let mut required_resources: HashSet<ResourceHandle> = resources
        .iter()
        .filter(|(_, entry)| entry.is_imported())
        .map(|(handle, _)| handle)
        .collect();
    let mut required_passes: HashSet<PassId> = HashSet::new();

    for &pass_id in order.iter().rev() {
        let pass = &passes[pass_id.index()];
        let has_side_effects = pass.outputs().is_empty();
        let writes_required_resource = pass
            .outputs()
            .iter()
            .any(|handle| required_resources.contains(handle));

        if has_side_effects || writes_required_resource {
            required_passes.insert(pass_id);
            required_resources.extend(pass.inputs());
        }
    }

    let (kept, culled): (Vec<PassId>, Vec<PassId>) = order
        .into_iter()
        .partition(|pass| required_passes.contains(pass));
    if !culled.is_empty() {
        log::debug!(
            "Culled {} unused pass(es): {:?}",
            culled.len(),
            culled
                .iter()
                .map(|pass| passes[pass.index()].name())
                .collect::<Vec<_>>()
        );
    }
    (kept, culled)
}

fn compute_resource_lifetimes<D: DeviceLayer>(
    passes: &[PassNode<D>],
    resource_count: usize,
    order: &[PassId],
) -> Vec<Option<ResourceLifetime>> {
    let mut lifetimes: Vec<Option<ResourceLifetime>> = vec![None; resource_count];

    for (position, &pass_id) in order.iter().enumerate() {
        for handle in passes[pass_id.index()].declared_resources() {
            match &mut lifetimes[handle.index()] {
                Some(lifetime) => lifetime.extend(position),
                slot @ None => *slot = Some(ResourceLifetime::at(position)),
            }
        }
    }

    lifetimes
}

fn compute_aliasing<P>(
    resources: &ResourceRegistry<P>,
    lifetimes: &[Option<ResourceLifetime>],
    options: &CompileOptions,
) -> (Vec<Option<BucketId>>, Vec<PhysicalBucket>) {
    let mut descriptors: HashMap<ResourceHandle, &ResourceDescriptor> = HashMap::new();
    let mut candidates: Vec<AliasCandidate> = Vec::new();

    for (handle, entry) in resources.iter() {
        // Imported resources have an external, unbounded lifetime.
        let Some(descriptor) = entry.descriptor() else {
            continue;
        };
        let Some(lifetime) = lifetimes[handle.index()] else {
            continue;
        };
        descriptors.insert(handle, descriptor);
        candidates.push(AliasCandidate {
            resource: handle,
            signature: AliasSignature::of(descriptor, options.buffer_size_granularity),
            lifetime,
        });
    }

    let assignment = if options.aliasing {
        assign_buckets(&candidates)
    } else {
        aliasing::assign_dedicated(&candidates)
    };

    let bucket_of = resources
        .iter()
        .map(|(handle, _)| assignment.bucket_of(handle))
        .collect();
    let buckets = physical_buckets(&assignment, &descriptors);

    (bucket_of, buckets)
}

fn physical_buckets(
    assignment: &BucketAssignment,
    descriptors: &HashMap<ResourceHandle, &ResourceDescriptor>,
) -> Vec<PhysicalBucket> {
    assignment
        .buckets()
        .map(|id| {
            let occupants = assignment.occupants(id).to_vec();
            let signature = assignment.signature(id).clone();

            let mut descriptor = descriptors[&occupants[0]].clone();
            for handle in &occupants[1..] {
                widen_usage(&mut descriptor, descriptors[handle]);
            }
            if let (ResourceDescriptor::Buffer(buffer), AliasSignature::Buffer { size_class }) =
                (&mut descriptor, &signature)
            {
                *buffer = BufferDescriptor {
                    size: *size_class,
                    usage: buffer.usage,
                };
            }

            PhysicalBucket {
                id,
                signature,
                descriptor,
                occupants,
            }
        })
        .collect()
}

fn widen_usage(target: &mut ResourceDescriptor, other: &ResourceDescriptor) {
    match (target, other) {
        (ResourceDescriptor::Texture(target), ResourceDescriptor::Texture(other)) => {
            target.usage |= other.usage;
        }
        (ResourceDescriptor::Buffer(target), ResourceDescriptor::Buffer(other)) => {
            target.usage |= other.usage;
        }
        _ => {}
    }
}

fn compute_store_ops<D: DeviceLayer>(
    passes: &[PassNode<D>],
    resources: &ResourceRegistry<D::Physical>,
    order: &[PassId],
) -> HashMap<(PassId, ResourceHandle), StoreOp> {
    let mut last_read: HashMap<ResourceHandle, usize> = HashMap::new();
    for (position, &pass_id) in order.iter().enumerate() {
        for &handle in passes[pass_id.index()].inputs() {
            last_read.insert(handle, position);
        }
    }

    let mut store_ops = HashMap::new();
    for (position, &pass_id) in order.iter().enumerate() {
        for &handle in passes[pass_id.index()].outputs() {
            let imported = resources.get(handle).is_some_and(|entry| entry.is_imported());
            let read_later = last_read.get(&handle).is_some_and(|&last| last > position);

            let store_op = if imported || read_later {
                StoreOp::Store
            } else {
                StoreOp::Discard
            };
            store_ops.insert((pass_id, handle), store_op);
        }
    }

    store_ops
}
