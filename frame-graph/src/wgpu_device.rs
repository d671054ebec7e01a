use crate::device::{AllocationError, DeviceLayer};
use crate::resources::ResourceDescriptor;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub enum WgpuPhysical {
    Texture {
        texture: Arc<wgpu::Texture>,
        view: Arc<wgpu::TextureView>,
    },
    Buffer(Arc<wgpu::Buffer>),
}

impl WgpuPhysical {
    pub fn texture(&self) -> Option<&wgpu::Texture> {
        match self {
            WgpuPhysical::Texture { texture, .. } => Some(texture),
            WgpuPhysical::Buffer(_) => None,
        }
    }

    /// Shared so callers can tell with `Arc::ptr_eq` whether the backing changed.
    pub fn view(&self) -> Option<&Arc<wgpu::TextureView>> {
        match self {
            WgpuPhysical::Texture { view, .. } => Some(view),
            WgpuPhysical::Buffer(_) => None,
        }
    }

    pub fn buffer(&self) -> Option<&wgpu::Buffer> {
        match self {
            WgpuPhysical::Buffer(buffer) => Some(buffer),
            WgpuPhysical::Texture { .. } => None,
        }
    }

    /// True when both refer to the same GPU object.
    pub fn same_backing(&self, other: &WgpuPhysical) -> bool {
        match (self, other) {
            (WgpuPhysical::Texture { view: a, .. }, WgpuPhysical::Texture { view: b, .. }) => {
                Arc::ptr_eq(a, b)
            }
            (WgpuPhysical::Buffer(a), WgpuPhysical::Buffer(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

/// Attachments of one pass, split into color targets and an optional depth target.
#[derive(Debug, Clone, Default)]
pub struct WgpuFramebuffer {
    pub color: Vec<Arc<wgpu::TextureView>>,
    pub depth: Option<Arc<wgpu::TextureView>>,
}

/// [`DeviceLayer`] backed by a `wgpu` device.
///
/// Passes record into a single command encoder per frame, obtained with
/// [`encoder`](Self::encoder) and submitted by [`submit`](Self::submit).
/// wgpu tracks resource state itself, so ordering the passes is all the
/// synchronization the graph needs.
pub struct WgpuDevice {
    device: wgpu::Device,
    queue: wgpu::Queue,
    encoder: Option<wgpu::CommandEncoder>,
    allocations: usize,
}

impl WgpuDevice {
    pub fn new(device: wgpu::Device, queue: wgpu::Queue) -> Self {
        Self {
            device,
            queue,
            encoder: None,
            allocations: 0,
        }
    }

    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    pub fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }

    /// Live physical objects created through this layer.
    pub fn allocations(&self) -> usize {
        self.allocations
    }

    pub fn import_texture(&self, texture: Arc<wgpu::Texture>) -> WgpuPhysical {
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        WgpuPhysical::Texture {
            texture,
            view: Arc::new(view),
        }
    }

    /// Starts recording a new frame, dropping anything recorded but never submitted.
    pub fn begin_frame(&mut self) {
        if self.encoder.take().is_some() {
            log::warn!("Discarding commands recorded for a frame that was never submitted");
        }
    }

    pub fn encoder(&mut self) -> &mut wgpu::CommandEncoder {
        let device = &self.device;
        self.encoder.get_or_insert_with(|| {
            device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Frame Graph Encoder"),
            })
        })
    }

    /// Submits everything recorded since the last call. Returns `None` when no
    /// pass recorded anything.
    pub fn submit(&mut self) -> Option<wgpu::SubmissionIndex> {
        let encoder = self.encoder.take()?;
        Some(self.queue.submit(std::iter::once(encoder.finish())))
    }

    fn check_limits(&self, descriptor: &ResourceDescriptor) -> Result<(), AllocationError> {
        let limits = self.device.limits();
        match descriptor {
            ResourceDescriptor::Texture(texture) => {
                let max = limits.max_texture_dimension_2d;
                if texture.width > max || texture.height > max {
                    return Err(AllocationError::new(format!(
                        "{}x{} exceeds the device limit of {max}",
                        texture.width, texture.height
                    )));
                }
                if texture.depth_or_array_layers > limits.max_texture_array_layers {
                    return Err(AllocationError::new(format!(
                        "{} array layers exceed the device limit of {}",
                        texture.depth_or_array_layers, limits.max_texture_array_layers
                    )));
                }
            }
            ResourceDescriptor::Buffer(buffer) => {
                if buffer.size > limits.max_buffer_size {
                    return Err(AllocationError::new(format!(
                        "{} bytes exceed the device limit of {}",
                        buffer.size, limits.max_buffer_size
                    )));
                }
            }
        }
        Ok(())
    }
}

impl DeviceLayer for WgpuDevice {
    type Physical = WgpuPhysical;
    type Framebuffer = WgpuFramebuffer;

    fn allocate_physical(
        &mut self,
        label: &str,
        descriptor: &ResourceDescriptor,
    ) -> Result<WgpuPhysical, AllocationError> {
        self.check_limits(descriptor)?;

        let physical = match descriptor {
            ResourceDescriptor::Texture(texture) => {
                let texture = self
                    .device
                    .create_texture(&texture.to_wgpu_descriptor(Some(label)));
                let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
                WgpuPhysical::Texture {
                    texture: Arc::new(texture),
                    view: Arc::new(view),
                }
            }
            ResourceDescriptor::Buffer(buffer) => WgpuPhysical::Buffer(Arc::new(
                self.device
                    .create_buffer(&buffer.to_wgpu_descriptor(Some(label))),
            )),
        };
        self.allocations += 1;
        Ok(physical)
    }

    fn release_physical(&mut self, physical: WgpuPhysical) {
        self.allocations = self.allocations.saturating_sub(1);
        match physical {
            WgpuPhysical::Texture { texture, view } => {
                drop(view);
                if let Some(texture) = Arc::into_inner(texture) {
                    texture.destroy();
                }
            }
            WgpuPhysical::Buffer(buffer) => {
                if let Some(buffer) = Arc::into_inner(buffer) {
                    buffer.destroy();
                }
            }
        }
    }

    fn bind_render_targets(
        &mut self,
        targets: &[&WgpuPhysical],
    ) -> Result<WgpuFramebuffer, AllocationError> {
        let mut framebuffer = WgpuFramebuffer::default();
        for target in targets {
            let WgpuPhysical::Texture { texture, view } = target else {
                return Err(AllocationError::new("buffers cannot be bound as render targets"));
            };
            if texture.format().is_depth_stencil_format() {
                if framebuffer.depth.is_some() {
                    return Err(AllocationError::new("more than one depth attachment"));
                }
                framebuffer.depth = Some(view.clone());
            } else {
                framebuffer.color.push(view.clone());
            }
        }
        Ok(framebuffer)
    }
}
