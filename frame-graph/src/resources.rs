use crate::pass::PassId;
use crate::{RenderGraphError, Result};
use std::fmt;
use wgpu::{BufferUsages, Extent3d, TextureFormat, TextureUsages};

/// Index of a virtual resource inside its owning [`ResourceRegistry`].
///
/// A handle also carries the registry generation it was issued in. Clearing the
/// registry starts a new generation, so handles from an earlier declaration
/// phase no longer resolve.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceHandle {
    index: u32,
    generation: u32,
}

impl ResourceHandle {
    pub const INVALID: Self = Self {
        index: u32::MAX,
        generation: 0,
    };

    /// Indices that do not fit below `u32::MAX` map to [`INVALID`](Self::INVALID).
    pub(crate) fn new(index: usize) -> Self {
        match u32::try_from(index) {
            Ok(index) => Self {
                index,
                generation: 0,
            },
            Err(_) => Self::INVALID,
        }
    }

    pub(crate) fn with_generation(self, generation: u32) -> Self {
        Self { generation, ..self }
    }

    pub fn index(self) -> usize {
        self.index as usize
    }

    pub fn generation(self) -> u32 {
        self.generation
    }

    pub fn is_valid(self) -> bool {
        self.index != u32::MAX
    }
}

impl Default for ResourceHandle {
    fn default() -> Self {
        Self::INVALID
    }
}

impl fmt::Debug for ResourceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "Resource({})", self.index)
        } else {
            write!(f, "Resource(INVALID)")
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TextureDescriptor {
    pub format: TextureFormat,
    pub width: u32,
    pub height: u32,
    pub usage: TextureUsages,
    pub mip_level_count: u32,
    pub depth_or_array_layers: u32,
    pub sample_count: u32,
}

impl TextureDescriptor {
    pub fn new(format: TextureFormat, width: u32, height: u32) -> Self {
        Self {
            format,
            width,
            height,
            usage: TextureUsages::RENDER_ATTACHMENT | TextureUsages::TEXTURE_BINDING,
            mip_level_count: 1,
            depth_or_array_layers: 1,
            sample_count: 1,
        }
    }

    pub fn usage(mut self, usage: TextureUsages) -> Self {
        self.usage = usage;
        self
    }

    pub fn mip_levels(mut self, levels: u32) -> Self {
        self.mip_level_count = levels;
        self
    }

    pub fn array_layers(mut self, layers: u32) -> Self {
        self.depth_or_array_layers = layers;
        self
    }

    pub fn cube_map(self) -> Self {
        self.array_layers(6)
    }

    pub fn sample_count(mut self, count: u32) -> Self {
        self.sample_count = count;
        self
    }

    /// Approximate memory footprint across all mips, layers and samples.
    pub fn byte_size(&self) -> u64 {
        let block_size = u64::from(self.format.block_copy_size(None).unwrap_or(4));
        let (block_width, block_height) = self.format.block_dimensions();

        let per_layer: u64 = (0..self.mip_level_count)
            .map(|mip| {
                let width = (self.width >> mip).max(1).div_ceil(block_width);
                let height = (self.height >> mip).max(1).div_ceil(block_height);
                u64::from(width) * u64::from(height) * block_size
            })
            .sum();

        per_layer * u64::from(self.depth_or_array_layers) * u64::from(self.sample_count)
    }

    pub fn to_wgpu_descriptor<'a>(&self, label: Option<&'a str>) -> wgpu::TextureDescriptor<'a> {
        wgpu::TextureDescriptor {
            label,
            size: Extent3d {
                width: self.width,
                height: self.height,
                depth_or_array_layers: self.depth_or_array_layers,
            },
            mip_level_count: self.mip_level_count,
            sample_count: self.sample_count,
            dimension: wgpu::TextureDimension::D2,
            format: self.format,
            usage: self.usage,
            view_formats: &[],
        }
    }

    fn validate(&self) -> std::result::Result<(), String> {
        if self.width == 0 || self.height == 0 {
            return Err(format!(
                "texture extent must be non-zero, got {}x{}",
                self.width, self.height
            ));
        }
        if self.mip_level_count == 0 {
            return Err("mip level count must be at least 1".to_string());
        }
        if self.depth_or_array_layers == 0 {
            return Err("array layer count must be at least 1".to_string());
        }
        if self.sample_count == 0 {
            return Err("sample count must be at least 1".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BufferDescriptor {
    pub size: u64,
    pub usage: BufferUsages,
}

impl BufferDescriptor {
    pub fn new(size: u64, usage: BufferUsages) -> Self {
        Self { size, usage }
    }

    pub fn to_wgpu_descriptor<'a>(&self, label: Option<&'a str>) -> wgpu::BufferDescriptor<'a> {
        wgpu::BufferDescriptor {
            label,
            size: self.size,
            usage: self.usage,
            mapped_at_creation: false,
        }
    }

    fn validate(&self) -> std::result::Result<(), String> {
        if self.size == 0 {
            return Err("buffer size must be non-zero".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ResourceDescriptor {
    Texture(TextureDescriptor),
    Buffer(BufferDescriptor),
}

impl ResourceDescriptor {
    pub fn byte_size(&self) -> u64 {
        match self {
            ResourceDescriptor::Texture(texture) => texture.byte_size(),
            ResourceDescriptor::Buffer(buffer) => buffer.size,
        }
    }

    pub fn as_texture(&self) -> Option<&TextureDescriptor> {
        match self {
            ResourceDescriptor::Texture(texture) => Some(texture),
            ResourceDescriptor::Buffer(_) => None,
        }
    }

    pub fn as_buffer(&self) -> Option<&BufferDescriptor> {
        match self {
            ResourceDescriptor::Buffer(buffer) => Some(buffer),
            ResourceDescriptor::Texture(_) => None,
        }
    }

    fn validate(&self) -> std::result::Result<(), String> {
        match self {
            ResourceDescriptor::Texture(texture) => texture.validate(),
            ResourceDescriptor::Buffer(buffer) => buffer.validate(),
        }
    }
}

/// Inclusive span of compiled-order positions during which a resource is live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceLifetime {
    pub first_use: usize,
    pub last_use: usize,
}

impl ResourceLifetime {
    pub fn at(position: usize) -> Self {
        Self {
            first_use: position,
            last_use: position,
        }
    }

    pub(crate) fn extend(&mut self, position: usize) {
        self.first_use = self.first_use.min(position);
        self.last_use = self.last_use.max(position);
    }

    pub fn contains(&self, position: usize) -> bool {
        self.first_use <= position && position <= self.last_use
    }

    pub fn overlaps(&self, other: &ResourceLifetime) -> bool {
        self.first_use <= other.last_use && other.first_use <= self.last_use
    }
}

enum Backing<P> {
    Transient(ResourceDescriptor),
    Imported(P),
}

pub struct ResourceEntry<P> {
    name: String,
    backing: Backing<P>,
    writers: Vec<PassId>,
    consumers: Vec<PassId>,
    lifetime: Option<ResourceLifetime>,
}

impl<P> ResourceEntry<P> {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// `None` for imported resources, whose backing is owned elsewhere.
    pub fn descriptor(&self) -> Option<&ResourceDescriptor> {
        match &self.backing {
            Backing::Transient(descriptor) => Some(descriptor),
            Backing::Imported(_) => None,
        }
    }

    pub fn is_imported(&self) -> bool {
        matches!(self.backing, Backing::Imported(_))
    }

    pub fn imported_binding(&self) -> Option<&P> {
        match &self.backing {
            Backing::Imported(binding) => Some(binding),
            Backing::Transient(_) => None,
        }
    }

    pub fn is_texture(&self) -> bool {
        match &self.backing {
            Backing::Transient(descriptor) => descriptor.as_texture().is_some(),
            // The graph cannot inspect external bindings; treat them as attachable.
            Backing::Imported(_) => true,
        }
    }

    /// The first pass, in declaration order, that writes this resource.
    ///
    /// Always `None` for imported resources: their contents come from outside
    /// the frame, and every pass writing them only modifies that content.
    pub fn producer(&self) -> Option<PassId> {
        if self.is_imported() {
            return None;
        }
        self.writers.first().copied()
    }

    pub fn writers(&self) -> &[PassId] {
        &self.writers
    }

    pub fn consumers(&self) -> &[PassId] {
        &self.consumers
    }

    /// Only set after a successful compile.
    pub fn lifetime(&self) -> Option<ResourceLifetime> {
        self.lifetime
    }
}

pub struct ResourceRegistry<P> {
    entries: Vec<ResourceEntry<P>>,
    generation: u32,
}

impl<P> ResourceRegistry<P> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            generation: 0,
        }
    }

    pub fn create_texture(
        &mut self,
        name: &str,
        descriptor: TextureDescriptor,
    ) -> Result<ResourceHandle> {
        self.create_transient(name, ResourceDescriptor::Texture(descriptor))
    }

    pub fn create_buffer(
        &mut self,
        name: &str,
        descriptor: BufferDescriptor,
    ) -> Result<ResourceHandle> {
        self.create_transient(name, ResourceDescriptor::Buffer(descriptor))
    }

    fn create_transient(
        &mut self,
        name: &str,
        descriptor: ResourceDescriptor,
    ) -> Result<ResourceHandle> {
        if let Err(reason) = descriptor.validate() {
            log::warn!("Rejected resource '{name}': {reason}");
            return Err(RenderGraphError::InvalidDescriptor {
                resource: name.to_string(),
                reason,
            });
        }
        Ok(self.push(name, Backing::Transient(descriptor)))
    }

    /// Registers a resource whose physical backing is supplied by the caller.
    /// Imported resources are never aliased or released by the graph.
    pub fn import_resource(&mut self, name: &str, binding: P) -> ResourceHandle {
        self.push(name, Backing::Imported(binding))
    }

    fn push(&mut self, name: &str, backing: Backing<P>) -> ResourceHandle {
        let handle = ResourceHandle::new(self.entries.len()).with_generation(self.generation);
        self.entries.push(ResourceEntry {
            name: name.to_string(),
            backing,
            writers: Vec::new(),
            consumers: Vec::new(),
            lifetime: None,
        });
        handle
    }

    pub fn get(&self, handle: ResourceHandle) -> Option<&ResourceEntry<P>> {
        self.slot(handle).map(|index| &self.entries[index])
    }

    /// False for [`ResourceHandle::INVALID`], out-of-range indices and handles
    /// issued before the last [`clear`](Self::clear).
    pub fn contains(&self, handle: ResourceHandle) -> bool {
        self.slot(handle).is_some()
    }

    fn slot(&self, handle: ResourceHandle) -> Option<usize> {
        let index = handle.index();
        (handle.generation() == self.generation && index < self.entries.len()).then_some(index)
    }

    /// Bumped by every [`clear`](Self::clear).
    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub fn name(&self, handle: ResourceHandle) -> &str {
        self.get(handle).map_or("<invalid>", |entry| entry.name())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ResourceHandle, &ResourceEntry<P>)> {
        let generation = self.generation;
        self.entries
            .iter()
            .enumerate()
            .map(move |(index, entry)| {
                (ResourceHandle::new(index).with_generation(generation), entry)
            })
    }

    pub fn update_import(&mut self, handle: ResourceHandle, binding: P) -> Result<()> {
        let entry = self.entry_mut(handle, "update_import")?;
        match &mut entry.backing {
            Backing::Imported(current) => {
                *current = binding;
                Ok(())
            }
            Backing::Transient(_) => Err(RenderGraphError::InvalidHandle {
                handle,
                context: format!("'{}' is not an imported resource", entry.name),
            }),
        }
    }

    pub fn resize_texture(&mut self, handle: ResourceHandle, width: u32, height: u32) -> Result<()> {
        let entry = self.entry_mut(handle, "resize_texture")?;
        let name = entry.name.clone();

        let texture = match &mut entry.backing {
            Backing::Imported(_) => {
                return Err(RenderGraphError::CannotResizeImported { resource: name });
            }
            Backing::Transient(ResourceDescriptor::Buffer(_)) => {
                return Err(RenderGraphError::CannotResizeBuffer { resource: name });
            }
            Backing::Transient(ResourceDescriptor::Texture(texture)) => texture,
        };

        let resized = TextureDescriptor {
            width,
            height,
            ..texture.clone()
        };
        resized
            .validate()
            .map_err(|reason| RenderGraphError::InvalidDescriptor {
                resource: name,
                reason,
            })?;
        *texture = resized;
        Ok(())
    }

    fn entry_mut(&mut self, handle: ResourceHandle, context: &str) -> Result<&mut ResourceEntry<P>> {
        self.slot(handle)
            .and_then(|index| self.entries.get_mut(index))
            .ok_or_else(|| RenderGraphError::InvalidHandle {
                handle,
                context: context.to_string(),
            })
    }

    pub(crate) fn record_read(&mut self, handle: ResourceHandle, pass: PassId) {
        if let Some(entry) = self.slot(handle).and_then(|index| self.entries.get_mut(index))
            && !entry.consumers.contains(&pass)
        {
            entry.consumers.push(pass);
        }
    }

    pub(crate) fn record_write(&mut self, handle: ResourceHandle, pass: PassId) {
        if let Some(entry) = self.slot(handle).and_then(|index| self.entries.get_mut(index))
            && !entry.writers.contains(&pass)
        {
            entry.writers.push(pass);
        }
    }

    pub(crate) fn set_lifetimes(&mut self, lifetimes: &[Option<ResourceLifetime>]) {
        for (entry, lifetime) in self.entries.iter_mut().zip(lifetimes) {
            entry.lifetime = *lifetime;
        }
    }

    pub(crate) fn clear_lifetimes(&mut self) {
        for entry in &mut self.entries {
            entry.lifetime = None;
        }
    }

    /// Drops every entry and starts a new handle generation.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.generation = self.generation.wrapping_add(1);
    }
}

impl<P> Default for ResourceRegistry<P> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn color(width: u32, height: u32) -> TextureDescriptor {
        TextureDescriptor::new(TextureFormat::Rgba8Unorm, width, height)
    }

    #[test]
    fn zero_width_texture_is_rejected_and_not_registered() {
        let mut registry = ResourceRegistry::<()>::new();

        let result = registry.create_texture("broken", color(0, 64));

        assert!(matches!(
            result,
            Err(RenderGraphError::InvalidDescriptor { ref resource, .. }) if resource == "broken"
        ));
        assert!(registry.is_empty());
    }

    #[test]
    fn zero_sized_buffer_is_rejected() {
        let mut registry = ResourceRegistry::<()>::new();
        let result = registry.create_buffer("empty", BufferDescriptor::new(0, BufferUsages::STORAGE));
        assert!(result.is_err());
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn handles_are_sequential_indices() {
        let mut registry = ResourceRegistry::<u32>::new();
        let a = registry.create_texture("a", color(4, 4)).unwrap();
        let b = registry
            .create_buffer("b", BufferDescriptor::new(16, BufferUsages::UNIFORM))
            .unwrap();
        let c = registry.import_resource("c", 7);

        assert_eq!((a.index(), b.index(), c.index()), (0, 1, 2));
        assert!(registry.get(c).unwrap().is_imported());
        assert_eq!(registry.get(c).unwrap().imported_binding(), Some(&7));
        assert!(registry.get(a).unwrap().descriptor().is_some());
        assert!(!registry.contains(ResourceHandle::INVALID));
    }

    #[test]
    fn clear_invalidates_earlier_handles() {
        let mut registry = ResourceRegistry::<()>::new();
        let old = registry.create_texture("old_a", color(4, 4)).unwrap();

        registry.clear();
        let new = registry.create_texture("new_b", color(4, 4)).unwrap();

        assert_eq!(old.index(), new.index());
        assert_ne!(old, new);
        assert!(!registry.contains(old));
        assert!(registry.get(old).is_none());
        assert_eq!(registry.name(old), "<invalid>");
        assert!(matches!(
            registry.resize_texture(old, 8, 8),
            Err(RenderGraphError::InvalidHandle { .. })
        ));
        assert_eq!(registry.iter().map(|(handle, _)| handle).collect::<Vec<_>>(), [new]);
    }

    #[test]
    fn out_of_range_index_is_invalid() {
        assert!(!ResourceHandle::new(u32::MAX as usize).is_valid());
        #[cfg(target_pointer_width = "64")]
        assert_eq!(ResourceHandle::new(u32::MAX as usize + 1), ResourceHandle::INVALID);
        assert!(ResourceHandle::new(u32::MAX as usize - 1).is_valid());
    }

    #[test]
    fn lifetime_is_undefined_before_compile() {
        let mut registry = ResourceRegistry::<()>::new();
        let handle = registry.create_texture("a", color(4, 4)).unwrap();
        assert_eq!(registry.get(handle).unwrap().lifetime(), None);
    }

    #[test]
    fn read_and_write_relationships_are_deduplicated() {
        let mut registry = ResourceRegistry::<()>::new();
        let handle = registry.create_texture("a", color(4, 4)).unwrap();

        registry.record_write(handle, PassId::new(0));
        registry.record_write(handle, PassId::new(0));
        registry.record_read(handle, PassId::new(1));
        registry.record_read(handle, PassId::new(1));

        let entry = registry.get(handle).unwrap();
        assert_eq!(entry.producer(), Some(PassId::new(0)));
        assert_eq!(entry.writers(), &[PassId::new(0)]);
        assert_eq!(entry.consumers(), &[PassId::new(1)]);
    }

    #[test]
    fn imported_resources_have_no_producer() {
        let mut registry = ResourceRegistry::<()>::new();
        let history = registry.import_resource("history", ());

        registry.record_write(history, PassId::new(1));

        let entry = registry.get(history).unwrap();
        assert_eq!(entry.producer(), None);
        assert_eq!(entry.writers(), &[PassId::new(1)]);
    }

    #[test]
    fn resize_rules() {
        let mut registry = ResourceRegistry::<()>::new();
        let texture = registry.create_texture("t", color(4, 4)).unwrap();
        let buffer = registry
            .create_buffer("b", BufferDescriptor::new(16, BufferUsages::STORAGE))
            .unwrap();
        let imported = registry.import_resource("i", ());

        registry.resize_texture(texture, 8, 2).unwrap();
        let resized = registry.get(texture).unwrap().descriptor().unwrap();
        assert_eq!(resized.as_texture().map(|t| (t.width, t.height)), Some((8, 2)));

        assert!(matches!(
            registry.resize_texture(buffer, 8, 8),
            Err(RenderGraphError::CannotResizeBuffer { .. })
        ));
        assert!(matches!(
            registry.resize_texture(imported, 8, 8),
            Err(RenderGraphError::CannotResizeImported { .. })
        ));
        assert!(matches!(
            registry.resize_texture(texture, 0, 8),
            Err(RenderGraphError::InvalidDescriptor { .. })
        ));
    }

    #[test]
    fn texture_byte_size_counts_mips_and_layers() {
        let descriptor = color(4, 4).mip_levels(3).array_layers(2);
        // (16 + 4 + 1) texels * 4 bytes * 2 layers
        assert_eq!(descriptor.byte_size(), 168);
    }

    #[test]
    fn cube_map_has_six_layers() {
        let face = color(8, 8);
        let cube = color(8, 8).cube_map();

        assert_eq!(cube.depth_or_array_layers, 6);
        assert_eq!(cube.byte_size(), face.byte_size() * 6);
        assert_eq!(cube.to_wgpu_descriptor(None).size.depth_or_array_layers, 6);
    }

    #[test]
    fn lifetime_overlap() {
        let a = ResourceLifetime { first_use: 0, last_use: 2 };
        let b = ResourceLifetime { first_use: 2, last_use: 4 };
        let c = ResourceLifetime { first_use: 3, last_use: 3 };
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c));
        assert!(b.contains(3));
    }
}
