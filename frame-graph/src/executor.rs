use crate::compiler::{CompiledPlan, PhysicalBucket};
use crate::device::DeviceLayer;
use crate::pass::{ExecuteFn, PassCallback, PassId, PassNode};
use crate::resources::{ResourceDescriptor, ResourceHandle, ResourceRegistry};
use crate::{GraphWarning, RenderGraphError, Result};
use std::collections::HashSet;
use std::time::Duration;
use web_time::Instant;
use wgpu::StoreOp;

#[derive(Debug, Clone)]
pub struct PassStatistics {
    pub pass_name: String,
    pub execution_time: Duration,
    /// `false` when the pass was skipped for lacking a callback.
    pub executed: bool,
}

/// What a pass callback sees while it runs.
///
/// Only resources the pass declared are reachable; asking for anything else
/// yields [`RenderGraphError::ResourceNotDeclared`].
pub struct PassContext<'a, D: DeviceLayer> {
    pass: PassId,
    name: &'a str,
    position: usize,
    device: &'a mut D,
    bindings: Vec<(ResourceHandle, &'a D::Physical)>,
    render_targets: &'a [ResourceHandle],
    framebuffer: Option<D::Framebuffer>,
    plan: &'a CompiledPlan,
}

impl<'a, D: DeviceLayer> PassContext<'a, D> {
    pub fn pass_id(&self) -> PassId {
        self.pass
    }

    pub fn pass_name(&self) -> &str {
        self.name
    }

    /// Position of this pass in the compiled order.
    pub fn position(&self) -> usize {
        self.position
    }

    pub fn device(&mut self) -> &mut D {
        self.device
    }

    pub fn physical(&self, handle: ResourceHandle) -> Result<&'a D::Physical> {
        self.bindings
            .iter()
            .find(|(bound, _)| *bound == handle)
            .map(|(_, physical)| *physical)
            .ok_or_else(|| RenderGraphError::ResourceNotDeclared {
                pass: self.name.to_string(),
                handle,
            })
    }

    /// Present when the pass declared render targets.
    pub fn framebuffer(&self) -> Option<&D::Framebuffer> {
        self.framebuffer.as_ref()
    }

    pub fn take_framebuffer(&mut self) -> Option<D::Framebuffer> {
        self.framebuffer.take()
    }

    pub fn render_targets(&self) -> &'a [ResourceHandle] {
        self.render_targets
    }

    pub fn store_op(&self, handle: ResourceHandle) -> StoreOp {
        self.plan.store_op(self.pass, handle)
    }

    /// True when no earlier pass in this frame touched `handle`, so its
    /// contents are undefined and should be cleared rather than loaded.
    pub fn is_first_use(&self, handle: ResourceHandle) -> bool {
        self.plan
            .lifetime(handle)
            .is_some_and(|lifetime| lifetime.first_use == self.position)
    }

    pub fn plan(&self) -> &'a CompiledPlan {
        self.plan
    }
}

struct PooledPhysical<P> {
    descriptor: ResourceDescriptor,
    physical: P,
}

/// Physical objects kept across frames, indexed by bucket of the last executed plan.
///
/// When a different plan runs, objects of the previous plan become spares and
/// are handed to new buckets with an identical descriptor. Spares nobody
/// claimed by the end of the frame go back to the device layer.
pub(crate) struct PhysicalPool<P> {
    plan_id: Option<u64>,
    slots: Vec<Option<PooledPhysical<P>>>,
    spares: Vec<PooledPhysical<P>>,
}

impl<P> PhysicalPool<P> {
    pub(crate) fn new() -> Self {
        Self {
            plan_id: None,
            slots: Vec::new(),
            spares: Vec::new(),
        }
    }

    pub(crate) fn prepare(&mut self, plan: &CompiledPlan) {
        if self.plan_id == Some(plan.plan_id) {
            return;
        }
        self.spares.extend(self.slots.drain(..).flatten());
        self.slots.resize_with(plan.bucket_count(), || None);
        self.plan_id = Some(plan.plan_id);
    }

    pub(crate) fn materialize<D>(
        &mut self,
        bucket: &PhysicalBucket,
        label: &str,
        device: &mut D,
    ) -> Result<()>
    where
        D: DeviceLayer<Physical = P>,
    {
        if self.get(bucket).is_some() {
            return Ok(());
        }

        let reusable = self
            .spares
            .iter()
            .position(|spare| spare.descriptor == bucket.descriptor);
        let pooled = match reusable {
            Some(index) => self.spares.swap_remove(index),
            None => {
                log::debug!("Allocating bucket {:?} for '{label}'", bucket.id);
                let physical = device
                    .allocate_physical(label, &bucket.descriptor)
                    .map_err(|error| RenderGraphError::AllocationFailure {
                        resource: label.to_string(),
                        reason: error.reason,
                    })?;
                PooledPhysical {
                    descriptor: bucket.descriptor.clone(),
                    physical,
                }
            }
        };

        if let Some(slot) = self.slots.get_mut(bucket.id.index()) {
            *slot = Some(pooled);
        }
        Ok(())
    }

    pub(crate) fn get(&self, bucket: &PhysicalBucket) -> Option<&P> {
        self.slots
            .get(bucket.id.index())
            .and_then(Option::as_ref)
            .map(|pooled| &pooled.physical)
    }

    pub(crate) fn live_count(&self) -> usize {
        self.slots.iter().flatten().count() + self.spares.len()
    }

    /// Returns unclaimed spares to the device.
    pub(crate) fn finish<D>(&mut self, device: &mut D)
    where
        D: DeviceLayer<Physical = P>,
    {
        for spare in self.spares.drain(..) {
            device.release_physical(spare.physical);
        }
    }

    pub(crate) fn release_all<D>(&mut self, device: &mut D)
    where
        D: DeviceLayer<Physical = P>,
    {
        self.spares.extend(self.slots.drain(..).flatten());
        self.finish(device);
        self.plan_id = None;
    }
}

#[derive(Default)]
pub(crate) struct ExecutionState {
    pub(crate) profiling: bool,
    pub(crate) statistics: Vec<PassStatistics>,
    reported_missing: HashSet<PassId>,
}

impl ExecutionState {
    pub(crate) fn forget_reported(&mut self) {
        self.reported_missing.clear();
    }
}

pub(crate) fn execute_plan<D: DeviceLayer>(
    plan: &CompiledPlan,
    passes: &mut [PassNode<D>],
    resources: &ResourceRegistry<D::Physical>,
    pool: &mut PhysicalPool<D::Physical>,
    device: &mut D,
    state: &mut ExecutionState,
    warnings: &mut Vec<GraphWarning>,
) -> Result<()> {
    pool.prepare(plan);
    if state.profiling {
        state.statistics.clear();
    }

    for (position, &pass_id) in plan.order().iter().enumerate() {
        let index = pass_id.index();
        let callback = std::mem::replace(&mut passes[index].callback, PassCallback::Missing);

        let PassCallback::Present(mut execute) = callback else {
            if state.reported_missing.insert(pass_id) {
                let warning = GraphWarning::MissingExecuteCallback {
                    pass: passes[index].name().to_string(),
                };
                log::warn!("{warning}");
                warnings.push(warning);
            }
            if state.profiling {
                state.statistics.push(PassStatistics {
                    pass_name: passes[index].name().to_string(),
                    execution_time: Duration::ZERO,
                    executed: false,
                });
            }
            continue;
        };

        let started = Instant::now();
        let result = run_pass(
            plan,
            &passes[index],
            position,
            &mut execute,
            resources,
            pool,
            device,
        );
        passes[index].callback = PassCallback::Present(execute);

        if let Err(error) = result {
            log::error!(
                "Aborting frame at pass '{}': {error}",
                passes[index].name()
            );
            return Err(error);
        }

        if state.profiling {
            state.statistics.push(PassStatistics {
                pass_name: passes[index].name().to_string(),
                execution_time: started.elapsed(),
                executed: true,
            });
        }
    }

    pool.finish(device);
    Ok(())
}

fn run_pass<D: DeviceLayer>(
    plan: &CompiledPlan,
    pass: &PassNode<D>,
    position: usize,
    execute: &mut ExecuteFn<D>,
    resources: &ResourceRegistry<D::Physical>,
    pool: &mut PhysicalPool<D::Physical>,
    device: &mut D,
) -> Result<()> {
    for handle in pass.declared_resources() {
        if let Some(bucket) = plan.bucket_of(handle).and_then(|id| plan.bucket(id)) {
            pool.materialize(bucket, resources.name(handle), device)?;
        }
    }

    let pool: &PhysicalPool<D::Physical> = pool;
    let bindings = pass
        .declared_resources()
        .map(|handle| resolve(plan, resources, pool, handle).map(|physical| (handle, physical)))
        .collect::<Result<Vec<_>>>()?;

    let framebuffer = if pass.render_targets().is_empty() {
        None
    } else {
        let targets: Vec<&D::Physical> = pass
            .render_targets()
            .iter()
            .filter_map(|target| {
                bindings
                    .iter()
                    .find(|(handle, _)| handle == target)
                    .map(|(_, physical)| *physical)
            })
            .collect();
        let framebuffer = device.bind_render_targets(&targets).map_err(|error| {
            RenderGraphError::AllocationFailure {
                resource: format!("render targets of '{}'", pass.name()),
                reason: error.reason,
            }
        })?;
        Some(framebuffer)
    };

    log::trace!("Executing pass '{}' at position {position}", pass.name());
    let mut context = PassContext {
        pass: pass.id(),
        name: pass.name(),
        position,
        device,
        bindings,
        render_targets: pass.render_targets(),
        framebuffer,
        plan,
    };
    execute(&mut context);
    Ok(())
}

fn resolve<'a, P>(
    plan: &CompiledPlan,
    resources: &'a ResourceRegistry<P>,
    pool: &'a PhysicalPool<P>,
    handle: ResourceHandle,
) -> Result<&'a P> {
    let entry = resources
        .get(handle)
        .ok_or_else(|| RenderGraphError::InvalidHandle {
            handle,
            context: "resolving pass bindings".to_string(),
        })?;

    let physical = match entry.imported_binding() {
        Some(binding) => Some(binding),
        None => plan
            .bucket_of(handle)
            .and_then(|id| plan.bucket(id))
            .and_then(|bucket| pool.get(bucket)),
    };
    physical.ok_or_else(|| RenderGraphError::ResourceNotBound {
        resource: entry.name().to_string(),
    })
}
