use crate::device::DeviceLayer;
use crate::executor::PassContext;
use crate::resources::{BufferDescriptor, ResourceHandle, ResourceRegistry, TextureDescriptor};
use crate::{GraphWarning, RenderGraphError, Result};
use std::fmt;

/// Position of a pass in declaration order.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PassId(u32);

impl PassId {
    /// # Panics
    ///
    /// Panics if `index` does not fit in a `u32`.
    pub fn new(index: usize) -> Self {
        match u32::try_from(index) {
            Ok(index) => Self(index),
            Err(_) => panic!("pass index {index} exceeds u32::MAX"),
        }
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for PassId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pass({})", self.0)
    }
}

pub type ExecuteFn<D> = Box<dyn FnMut(&mut PassContext<'_, D>)>;

pub(crate) enum PassCallback<D: DeviceLayer> {
    Missing,
    Present(ExecuteFn<D>),
}

pub struct PassNode<D: DeviceLayer> {
    id: PassId,
    name: String,
    inputs: Vec<ResourceHandle>,
    outputs: Vec<ResourceHandle>,
    render_targets: Vec<ResourceHandle>,
    read_writes: Vec<ResourceHandle>,
    pub(crate) callback: PassCallback<D>,
    pub(crate) errors: Vec<RenderGraphError>,
}

impl<D: DeviceLayer> PassNode<D> {
    pub(crate) fn new(id: PassId, name: &str) -> Self {
        Self {
            id,
            name: name.to_string(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            render_targets: Vec::new(),
            read_writes: Vec::new(),
            callback: PassCallback::Missing,
            errors: Vec::new(),
        }
    }

    pub fn id(&self) -> PassId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn inputs(&self) -> &[ResourceHandle] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[ResourceHandle] {
        &self.outputs
    }

    /// Subset of [`outputs`](Self::outputs) bound as framebuffer attachments.
    pub fn render_targets(&self) -> &[ResourceHandle] {
        &self.render_targets
    }

    pub fn is_read_write(&self, handle: ResourceHandle) -> bool {
        self.read_writes.contains(&handle)
    }

    pub fn reads(&self, handle: ResourceHandle) -> bool {
        self.inputs.contains(&handle)
    }

    pub fn writes(&self, handle: ResourceHandle) -> bool {
        self.outputs.contains(&handle)
    }

    pub fn has_execute(&self) -> bool {
        matches!(self.callback, PassCallback::Present(_))
    }

    /// Every resource the pass declared, inputs first, without duplicates.
    pub fn declared_resources(&self) -> impl Iterator<Item = ResourceHandle> + '_ {
        self.inputs.iter().copied().chain(
            self.outputs
                .iter()
                .copied()
                .filter(|handle| !self.inputs.contains(handle)),
        )
    }
}

/// Write-only view handed to a pass's setup closure.
///
/// The builder borrows the graph for the duration of `create_pass` only, so it
/// cannot escape the setup call.
pub struct PassBuilder<'g, D: DeviceLayer> {
    node: &'g mut PassNode<D>,
    resources: &'g mut ResourceRegistry<D::Physical>,
    warnings: &'g mut Vec<GraphWarning>,
}

impl<'g, D: DeviceLayer> PassBuilder<'g, D> {
    pub(crate) fn new(
        node: &'g mut PassNode<D>,
        resources: &'g mut ResourceRegistry<D::Physical>,
        warnings: &'g mut Vec<GraphWarning>,
    ) -> Self {
        Self {
            node,
            resources,
            warnings,
        }
    }

    pub fn pass_id(&self) -> PassId {
        self.node.id
    }

    pub fn name(&self) -> &str {
        &self.node.name
    }

    pub fn create_texture(
        &mut self,
        name: &str,
        descriptor: TextureDescriptor,
    ) -> Result<ResourceHandle> {
        let handle = self.resources.create_texture(name, descriptor)?;
        Ok(self.add_output(handle))
    }

    pub fn create_buffer(
        &mut self,
        name: &str,
        descriptor: BufferDescriptor,
    ) -> Result<ResourceHandle> {
        let handle = self.resources.create_buffer(name, descriptor)?;
        Ok(self.add_output(handle))
    }

    pub fn add_input(&mut self, handle: ResourceHandle) -> ResourceHandle {
        if !self.check_handle(handle) || self.node.inputs.contains(&handle) {
            return handle;
        }
        if self.node.outputs.contains(&handle) && !self.node.is_read_write(handle) {
            self.record_read_write_conflict(handle);
            return handle;
        }
        self.node.inputs.push(handle);
        self.resources.record_read(handle, self.node.id);
        handle
    }

    pub fn add_output(&mut self, handle: ResourceHandle) -> ResourceHandle {
        if !self.check_handle(handle) || self.node.outputs.contains(&handle) {
            return handle;
        }
        if self.node.inputs.contains(&handle) && !self.node.is_read_write(handle) {
            self.record_read_write_conflict(handle);
            return handle;
        }
        self.node.outputs.push(handle);
        self.resources.record_write(handle, self.node.id);
        handle
    }

    /// Declares `handle` as both read and written by this pass.
    pub fn add_read_write(&mut self, handle: ResourceHandle) -> ResourceHandle {
        if !self.check_handle(handle) {
            return handle;
        }
        if !self.node.read_writes.contains(&handle) {
            self.node.read_writes.push(handle);
        }
        self.add_input(handle);
        self.add_output(handle)
    }

    /// Declares `handle` as an output that is bound as a framebuffer attachment.
    pub fn add_render_target(&mut self, handle: ResourceHandle) -> ResourceHandle {
        if !self.check_handle(handle) || self.node.render_targets.contains(&handle) {
            return handle;
        }
        let is_texture = self
            .resources
            .get(handle)
            .is_some_and(|entry| entry.is_texture());
        if !is_texture {
            self.record_error(RenderGraphError::RenderTargetNotTexture {
                pass: self.node.name.clone(),
                resource: self.resources.name(handle).to_string(),
            });
            return handle;
        }
        self.add_output(handle);
        if self.node.outputs.contains(&handle) {
            self.node.render_targets.push(handle);
        }
        handle
    }

    /// Sets the callback run when the pass executes. Calling this again replaces
    /// the previous callback and records a [`GraphWarning::DuplicateExecute`].
    pub fn set_execute<F>(&mut self, execute: F)
    where
        F: FnMut(&mut PassContext<'_, D>) + 'static,
    {
        if self.node.has_execute() {
            let warning = GraphWarning::DuplicateExecute {
                pass: self.node.name.clone(),
            };
            log::warn!("{warning}");
            self.warnings.push(warning);
        }
        self.node.callback = PassCallback::Present(Box::new(execute));
    }

    fn check_handle(&mut self, handle: ResourceHandle) -> bool {
        if self.resources.contains(handle) {
            return true;
        }
        self.record_error(RenderGraphError::InvalidHandle {
            handle,
            context: format!("declared by pass '{}'", self.node.name),
        });
        false
    }

    fn record_read_write_conflict(&mut self, handle: ResourceHandle) {
        self.record_error(RenderGraphError::UndeclaredReadWrite {
            pass: self.node.name.clone(),
            resource: self.resources.name(handle).to_string(),
        });
    }

    fn record_error(&mut self, error: RenderGraphError) {
        log::error!("{error}");
        self.node.errors.push(error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pass_ids_follow_their_index() {
        assert_eq!(PassId::new(7).index(), 7);
        assert_eq!(format!("{:?}", PassId::new(3)), "Pass(3)");
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    #[should_panic(expected = "exceeds u32::MAX")]
    fn pass_index_beyond_u32_panics() {
        PassId::new(u32::MAX as usize + 1);
    }
}
