use crate::resources::ResourceDescriptor;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{reason}")]
pub struct AllocationError {
    pub reason: String,
}

impl AllocationError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// The graph's only route to real GPU objects.
///
/// The executor asks the device layer to materialize a physical bucket the first
/// time a pass touches it, hands the resulting objects to pass callbacks, and
/// gives them back through [`release_physical`](Self::release_physical) once no
/// plan needs them. Synchronization between dependent passes is the device
/// layer's concern; the graph only guarantees ordering.
pub trait DeviceLayer {
    type Physical;
    type Framebuffer;

    fn allocate_physical(
        &mut self,
        label: &str,
        descriptor: &ResourceDescriptor,
    ) -> Result<Self::Physical, AllocationError>;

    fn release_physical(&mut self, physical: Self::Physical);

    /// `targets` are in the order the pass declared its render targets.
    fn bind_render_targets(
        &mut self,
        targets: &[&Self::Physical],
    ) -> Result<Self::Framebuffer, AllocationError>;
}
