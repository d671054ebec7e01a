use crate::compiler::{self, CompileOptions, CompiledPlan};
use crate::device::DeviceLayer;
use crate::executor::{self, ExecutionState, PassStatistics, PhysicalPool};
use crate::pass::{PassBuilder, PassId, PassNode};
use crate::resources::{BufferDescriptor, ResourceHandle, ResourceRegistry, TextureDescriptor};
use crate::{GraphWarning, RenderGraphError, Result};

/// Owns the declared passes and resources of a frame.
///
/// The graph is single-threaded: declaration, compilation and execution all
/// take `&mut self`. A [`CompiledPlan`] stays valid until the next structural
/// change (a new pass, a new resource, a resize or a [`reset`](Self::reset));
/// executing an older plan returns [`RenderGraphError::StalePlan`].
pub struct RenderGraph<D: DeviceLayer> {
    resources: ResourceRegistry<D::Physical>,
    passes: Vec<PassNode<D>>,
    options: CompileOptions,
    warnings: Vec<GraphWarning>,
    topology_version: u64,
    plans_compiled: u64,
    pool: PhysicalPool<D::Physical>,
    execution: ExecutionState,
}

impl<D: DeviceLayer> RenderGraph<D> {
    pub fn new() -> Self {
        Self::with_options(CompileOptions::default())
    }

    pub fn with_options(options: CompileOptions) -> Self {
        Self {
            resources: ResourceRegistry::new(),
            passes: Vec::new(),
            options,
            warnings: Vec::new(),
            topology_version: 0,
            plans_compiled: 0,
            pool: PhysicalPool::new(),
            execution: ExecutionState::default(),
        }
    }

    pub fn options(&self) -> &CompileOptions {
        &self.options
    }

    /// Takes effect at the next [`compile`](Self::compile).
    pub fn set_options(&mut self, options: CompileOptions) {
        self.options = options;
        self.topology_version += 1;
    }

    pub fn create_texture(
        &mut self,
        name: &str,
        descriptor: TextureDescriptor,
    ) -> Result<ResourceHandle> {
        let handle = self.resources.create_texture(name, descriptor)?;
        self.topology_version += 1;
        Ok(handle)
    }

    pub fn create_buffer(
        &mut self,
        name: &str,
        descriptor: BufferDescriptor,
    ) -> Result<ResourceHandle> {
        let handle = self.resources.create_buffer(name, descriptor)?;
        self.topology_version += 1;
        Ok(handle)
    }

    pub fn import_resource(&mut self, name: &str, binding: D::Physical) -> ResourceHandle {
        self.topology_version += 1;
        self.resources.import_resource(name, binding)
    }

    /// Rebinds an imported resource, e.g. to this frame's swapchain image.
    /// Compiled plans stay valid.
    pub fn update_import(&mut self, handle: ResourceHandle, binding: D::Physical) -> Result<()> {
        self.resources.update_import(handle, binding)
    }

    pub fn resize_texture(&mut self, handle: ResourceHandle, width: u32, height: u32) -> Result<()> {
        self.resources.resize_texture(handle, width, height)?;
        self.topology_version += 1;
        Ok(())
    }

    /// Declares a pass. `setup` runs immediately with a builder scoped to the
    /// new pass, and whatever it returns is handed back to the caller.
    pub fn create_pass<R>(
        &mut self,
        name: &str,
        setup: impl FnOnce(&mut PassBuilder<'_, D>) -> R,
    ) -> R {
        let mut node = PassNode::new(PassId::new(self.passes.len()), name);
        let result = {
            let mut builder = PassBuilder::new(&mut node, &mut self.resources, &mut self.warnings);
            setup(&mut builder)
        };
        self.passes.push(node);
        self.topology_version += 1;
        result
    }

    /// Orders the passes and plans physical memory.
    ///
    /// Fails with the first error recorded while declaring passes, if any.
    /// Compiling the same declarations twice yields identical plans.
    pub fn compile(&mut self) -> Result<CompiledPlan> {
        self.plans_compiled += 1;
        let result = compiler::compile(
            &self.passes,
            &self.resources,
            &self.options,
            self.plans_compiled,
            self.topology_version,
        );

        match result {
            Ok(plan) => {
                self.resources.set_lifetimes(plan.lifetimes());
                log::debug!(
                    "Compiled {} passes ({} culled) into {} buckets; {} transient bytes backed by {}",
                    plan.order().len(),
                    plan.culled_passes().len(),
                    plan.bucket_count(),
                    plan.transient_bytes(),
                    plan.physical_bytes()
                );
                Ok(plan)
            }
            Err(error) => {
                self.resources.clear_lifetimes();
                log::error!("Render graph compilation failed: {error}");
                Err(error)
            }
        }
    }

    /// Runs every pass of `plan` in order against `device`.
    ///
    /// Physical resources are materialized the first time a pass touches their
    /// bucket and stay pooled for later frames. An allocation failure aborts the
    /// rest of the frame.
    pub fn execute(&mut self, plan: &CompiledPlan, device: &mut D) -> Result<()> {
        if plan.topology_version != self.topology_version {
            return Err(RenderGraphError::StalePlan {
                plan_version: plan.topology_version,
                graph_version: self.topology_version,
            });
        }

        let Self {
            resources,
            passes,
            warnings,
            pool,
            execution,
            ..
        } = self;
        executor::execute_plan(plan, passes, resources, pool, device, execution, warnings)
    }

    /// Hands every pooled physical resource back to `device`.
    pub fn release_physical_resources(&mut self, device: &mut D) {
        self.pool.release_all(device);
    }

    /// Number of physical objects currently held in the pool.
    pub fn pooled_physical_count(&self) -> usize {
        self.pool.live_count()
    }

    /// Drops all passes and resources. Pooled physical objects are kept so the
    /// next frame's plan can reuse them.
    pub fn reset(&mut self) {
        self.passes.clear();
        self.resources.clear();
        self.warnings.clear();
        self.execution.forget_reported();
        self.topology_version += 1;
    }

    pub fn resources(&self) -> &ResourceRegistry<D::Physical> {
        &self.resources
    }

    pub fn passes(&self) -> &[PassNode<D>] {
        &self.passes
    }

    pub fn pass(&self, id: PassId) -> Option<&PassNode<D>> {
        self.passes.get(id.index())
    }

    pub fn pass_by_name(&self, name: &str) -> Option<&PassNode<D>> {
        self.passes.iter().find(|pass| pass.name() == name)
    }

    /// Names of the plan's passes in execution order.
    pub fn pass_names(&self, plan: &CompiledPlan) -> Vec<&str> {
        plan.order()
            .iter()
            .filter_map(|&id| self.pass(id))
            .map(PassNode::name)
            .collect()
    }

    pub fn warnings(&self) -> &[GraphWarning] {
        &self.warnings
    }

    pub fn take_warnings(&mut self) -> Vec<GraphWarning> {
        std::mem::take(&mut self.warnings)
    }

    pub fn enable_profiling(&mut self, enabled: bool) {
        self.execution.profiling = enabled;
        if !enabled {
            self.execution.statistics.clear();
        }
    }

    /// Per-pass timings of the last executed frame; empty unless profiling is on.
    pub fn statistics(&self) -> &[PassStatistics] {
        &self.execution.statistics
    }

    pub fn topology_version(&self) -> u64 {
        self.topology_version
    }
}

impl<D: DeviceLayer> Default for RenderGraph<D> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::testing::NullDevice;
    use std::cell::RefCell;
    use std::rc::Rc;
    use wgpu::{BufferUsages, StoreOp, TextureFormat};

    fn rgba(width: u32, height: u32) -> TextureDescriptor {
        TextureDescriptor::new(TextureFormat::Rgba8Unorm, width, height)
    }

    fn names(graph: &RenderGraph<NullDevice>, plan: &CompiledPlan) -> Vec<String> {
        graph
            .pass_names(plan)
            .into_iter()
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn deferred_frame_orders_and_aliases() {
        let mut graph = RenderGraph::<NullDevice>::new();
        let surface = graph.import_resource("surface", 0);

        let (position, normal) = graph.create_pass("GBuffer", |builder| {
            let position = builder.create_texture("position", rgba(64, 64)).unwrap();
            let normal = builder.create_texture("normal", rgba(64, 64)).unwrap();
            builder.add_render_target(position);
            builder.add_render_target(normal);
            (position, normal)
        });
        let lit = graph.create_pass("Lighting", |builder| {
            builder.add_input(position);
            builder.add_input(normal);
            let lit = builder.create_texture("lit", rgba(64, 64)).unwrap();
            builder.add_render_target(lit);
            lit
        });
        graph.create_pass("Present", |builder| {
            builder.add_input(lit);
            builder.add_output(surface);
        });

        let plan = graph.compile().unwrap();

        assert_eq!(names(&graph, &plan), ["GBuffer", "Lighting", "Present"]);
        assert_eq!(plan.bucket_of(surface), None);
        assert_ne!(plan.bucket_of(position), plan.bucket_of(normal));
        assert_eq!(plan.bucket_count(), 3);
        assert_eq!(plan.high_water_mark(), 3);
        assert_eq!(plan.store_op(PassId::new(0), position), StoreOp::Store);
        assert_eq!(plan.store_op(PassId::new(2), surface), StoreOp::Store);
        assert_eq!(
            graph.resources().get(lit).unwrap().lifetime(),
            plan.lifetime(lit)
        );
    }

    #[test]
    fn declaration_order_breaks_ties() {
        let mut graph = RenderGraph::<NullDevice>::new();
        for name in ["C", "A", "B"] {
            graph.create_pass(name, |builder| builder.set_execute(|_| {}));
        }

        let plan = graph.compile().unwrap();
        assert_eq!(names(&graph, &plan), ["C", "A", "B"]);
        assert!(plan.edges().is_empty());
        assert_eq!(plan.dependency_levels().len(), 1);
    }

    #[test]
    fn reader_declared_first_still_runs_after_producer() {
        let mut graph = RenderGraph::<NullDevice>::new();
        let shadow = graph.create_texture("shadow", rgba(32, 32)).unwrap();

        graph.create_pass("Consume", |builder| {
            builder.add_input(shadow);
        });
        graph.create_pass("Produce", |builder| {
            builder.add_render_target(shadow);
        });

        let plan = graph.compile().unwrap();
        assert_eq!(names(&graph, &plan), ["Produce", "Consume"]);
    }

    #[test]
    fn cycle_is_reported_with_pass_names() {
        let mut graph = RenderGraph::<NullDevice>::new();
        let x = graph.create_texture("X", rgba(8, 8)).unwrap();
        let y = graph.create_texture("Y", rgba(8, 8)).unwrap();

        graph.create_pass("A", |builder| {
            builder.add_output(x);
            builder.add_input(y);
        });
        graph.create_pass("B", |builder| {
            builder.add_input(x);
            builder.add_output(y);
        });

        let error = graph.compile().unwrap_err();
        assert_eq!(
            error,
            RenderGraphError::CyclicDependency {
                cycle: vec!["A".to_string(), "B".to_string(), "A".to_string()]
            }
        );
        assert_eq!(graph.resources().get(x).unwrap().lifetime(), None);
    }

    #[test]
    fn first_declaration_error_fails_compile() {
        let mut graph = RenderGraph::<NullDevice>::new();
        let buffer = graph
            .create_buffer("params", BufferDescriptor::new(256, BufferUsages::UNIFORM))
            .unwrap();

        graph.create_pass("Bad", |builder| {
            builder.add_render_target(buffer);
            builder.add_input(ResourceHandle::INVALID);
        });

        assert!(matches!(
            graph.compile(),
            Err(RenderGraphError::RenderTargetNotTexture { .. })
        ));
    }

    #[test]
    fn handle_from_before_reset_is_rejected() {
        let mut graph = RenderGraph::<NullDevice>::new();
        let old = graph.create_texture("old_a", rgba(8, 8)).unwrap();

        graph.reset();
        let new = graph.create_texture("new_b", rgba(8, 8)).unwrap();
        graph.create_pass("Writer", |builder| {
            builder.add_output(old);
        });

        assert_eq!(old.index(), new.index());
        assert!(graph.resources().get(new).unwrap().writers().is_empty());
        assert!(matches!(
            graph.compile(),
            Err(RenderGraphError::InvalidHandle { handle, .. }) if handle == old
        ));
    }

    #[test]
    fn passes_are_found_by_name() {
        let mut graph = RenderGraph::<NullDevice>::new();
        graph.create_pass("Shadows", |_| {});
        graph.create_pass("Lighting", |_| {});

        let lighting = graph.pass_by_name("Lighting").unwrap();
        assert_eq!(lighting.id(), PassId::new(1));
        assert!(graph.pass_by_name("Bloom").is_none());

        graph.reset();
        assert!(graph.pass_by_name("Shadows").is_none());
    }

    #[test]
    fn execute_rejects_stale_plan() {
        let mut graph = RenderGraph::<NullDevice>::new();
        let mut device = NullDevice { next: 0 };
        graph.create_pass("Only", |builder| builder.set_execute(|_| {}));
        let plan = graph.compile().unwrap();

        graph.create_pass("Late", |builder| builder.set_execute(|_| {}));

        assert!(matches!(
            graph.execute(&plan, &mut device),
            Err(RenderGraphError::StalePlan { .. })
        ));
    }

    #[test]
    fn callbacks_see_their_own_bindings_only() {
        let mut graph = RenderGraph::<NullDevice>::new();
        let mut device = NullDevice { next: 100 };
        let seen = Rc::new(RefCell::new(Vec::new()));

        let color = graph.create_pass("Draw", |builder| {
            let color = builder.create_texture("color", rgba(16, 16)).unwrap();
            builder.add_render_target(color);
            let seen = seen.clone();
            builder.set_execute(move |ctx| {
                seen.borrow_mut().push((
                    ctx.pass_name().to_string(),
                    ctx.framebuffer().cloned(),
                    ctx.is_first_use(color),
                ));
            });
            color
        });
        let hidden = graph.create_texture("hidden", rgba(16, 16)).unwrap();
        graph.create_pass("Read", |builder| {
            builder.add_input(color);
            let seen = seen.clone();
            builder.set_execute(move |ctx| {
                let denied = ctx.physical(hidden).is_err();
                seen.borrow_mut()
                    .push((ctx.pass_name().to_string(), None, denied));
            });
        });

        let plan = graph.compile().unwrap();
        graph.execute(&plan, &mut device).unwrap();

        let seen = seen.borrow();
        assert_eq!(seen[0], ("Draw".to_string(), Some(vec![101]), true));
        assert_eq!(seen[1], ("Read".to_string(), None, true));
    }
}
