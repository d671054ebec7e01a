//! A declarative frame graph.
//!
//! Rendering code declares a frame as a set of named passes that read and write
//! virtual resources. [`RenderGraph::compile`] turns those declarations into a
//! [`CompiledPlan`]: a deterministic execution order plus an aliasing plan that
//! lets transient resources with disjoint lifetimes share physical memory.
//! [`RenderGraph::execute`] then walks the plan against a [`DeviceLayer`].
//!
//! ```ignore
//! let mut graph = RenderGraph::<WgpuDevice>::new();
//! let surface = graph.import_resource("surface", device.import_texture(target));
//!
//! let color = graph.create_pass("Scene", |builder| {
//!     let color = builder.create_texture("color", TextureDescriptor::new(format, 1280, 720))?;
//!     builder.add_render_target(color);
//!     builder.set_execute(move |ctx| { /* record commands */ });
//!     Ok::<_, RenderGraphError>(color)
//! })?;
//!
//! graph.create_pass("Present", |builder| {
//!     builder.add_input(color);
//!     builder.add_output(surface);
//!     builder.set_execute(|ctx| { /* blit */ });
//! });
//!
//! let plan = graph.compile()?;
//! graph.execute(&plan, &mut device)?;
//! ```

mod aliasing;
mod compiler;
mod device;
mod executor;
mod graph;
mod pass;
mod resources;
mod wgpu_device;

pub use aliasing::{
    AliasCandidate, AliasSignature, BucketAssignment, BucketId, assign_buckets, assign_dedicated,
    high_water_mark,
};
pub use compiler::{CompileOptions, CompiledPlan, DependencyEdge, PhysicalBucket};
pub use device::{AllocationError, DeviceLayer};
pub use executor::{PassContext, PassStatistics};
pub use graph::RenderGraph;
pub use pass::{ExecuteFn, PassBuilder, PassId, PassNode};
pub use resources::{
    BufferDescriptor, ResourceDescriptor, ResourceEntry, ResourceHandle, ResourceLifetime,
    ResourceRegistry, TextureDescriptor,
};
pub use wgpu_device::{WgpuDevice, WgpuFramebuffer, WgpuPhysical};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RenderGraphError {
    #[error("Invalid descriptor for resource '{resource}': {reason}")]
    InvalidDescriptor { resource: String, reason: String },

    #[error("Handle {handle:?} is not registered ({context})")]
    InvalidHandle {
        handle: ResourceHandle,
        context: String,
    },

    #[error("Render graph contains a cycle: {}", cycle.join(" -> "))]
    CyclicDependency { cycle: Vec<String> },

    #[error("Pass '{pass}' reads and writes '{resource}' without declaring it read-write")]
    UndeclaredReadWrite { pass: String, resource: String },

    #[error("Pass '{pass}' uses buffer '{resource}' as a render target")]
    RenderTargetNotTexture { pass: String, resource: String },

    #[error("Resource '{resource}' is read by '{reader}' but never written")]
    UnwrittenResource { resource: String, reader: String },

    #[error("Pass '{pass}' did not declare resource {handle:?}")]
    ResourceNotDeclared {
        pass: String,
        handle: ResourceHandle,
    },

    #[error("Resource '{resource}' has no physical binding")]
    ResourceNotBound { resource: String },

    #[error("Failed to allocate '{resource}': {reason}")]
    AllocationFailure { resource: String, reason: String },

    #[error("Plan was compiled for topology {plan_version} but the graph is at {graph_version}")]
    StalePlan {
        plan_version: u64,
        graph_version: u64,
    },

    #[error("Cannot resize imported resource '{resource}'")]
    CannotResizeImported { resource: String },

    #[error("Cannot resize buffer '{resource}' with width/height")]
    CannotResizeBuffer { resource: String },
}

pub type Result<T> = std::result::Result<T, RenderGraphError>;

/// Conditions the graph reports but does not fail on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphWarning {
    /// `set_execute` was called more than once on a pass; the last callback wins.
    DuplicateExecute { pass: String },
    /// A pass reached execution without a callback and was skipped.
    MissingExecuteCallback { pass: String },
}

impl std::fmt::Display for GraphWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GraphWarning::DuplicateExecute { pass } => {
                write!(f, "Pass '{pass}' set its execute callback more than once")
            }
            GraphWarning::MissingExecuteCallback { pass } => {
                write!(f, "Pass '{pass}' has no execute callback and was skipped")
            }
        }
    }
}
