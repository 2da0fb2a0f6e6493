//! GPU Backend Collaborator
//!
//! The runtime core never talks to a driver directly. Everything that creates,
//! destroys, submits or waits on GPU objects goes through [`GpuBackend`], which
//! a Vulkan (or mock) implementation provides.
//!
//! # Threading
//!
//! The backend is shared between the rendering thread and the background
//! relink workers, so implementations must be `Send + Sync`. The runtime makes
//! no further ordering promises beyond those documented on each method.

use std::sync::Arc;

use smallvec::SmallVec;

use crate::error::BackendError;
use crate::flags::{BufferUsage, PipelineStage, ShaderStage};
use crate::handle::{
    CommandBufferHandle, DescriptorPoolHandle, DescriptorSetHandle, DescriptorSetLayoutHandle,
    FrameHandle, Handle, HandleKind, PipelineHandle, PipelineLayoutHandle, ScratchBufferHandle,
    SemaphoreHandle, SurfaceImageHandle,
};
use crate::reflect::DescriptorType;

/// Shared, type-erased backend.
pub type SharedBackend = Arc<dyn GpuBackend>;

// ─── Creation Requests ───────────────────────────────────────────────────────

/// One binding of a descriptor-set layout as handed to the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LayoutBinding {
    pub binding: u32,
    pub descriptor_type: DescriptorType,
    pub count: u32,
    pub stages: ShaderStage,
}

/// Merged push-constant block of a pipeline layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PushConstantBlock {
    pub stages: ShaderStage,
    pub offset: u32,
    pub size: u32,
}

/// Number of descriptors of one type a pool bank reserves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSize {
    pub descriptor_type: DescriptorType,
    pub count: u32,
}

/// Parameters of a backend object creation.
///
/// `name` is a debug label; it is never used for identity.
#[derive(Debug, Clone, Copy)]
pub enum CreateRequest<'a> {
    DescriptorSetLayout {
        name: &'a str,
        bindings: &'a [LayoutBinding],
    },
    PipelineLayout {
        name: &'a str,
        set_layouts: &'a [DescriptorSetLayoutHandle],
        push_constants: Option<PushConstantBlock>,
    },
    DescriptorPool {
        name: &'a str,
        max_sets: u32,
        pool_sizes: &'a [PoolSize],
    },
    DescriptorSet {
        name: &'a str,
        pool: DescriptorPoolHandle,
        layout: DescriptorSetLayoutHandle,
    },
    /// A shader-stage pipeline library or a compute pipeline.
    Pipeline {
        name: &'a str,
        shader: &'a str,
        entry_point: &'a str,
        stage: ShaderStage,
        layout: PipelineLayoutHandle,
        spec_constants: &'a [u32],
    },
    TimelineSemaphore {
        name: &'a str,
    },
    Frame {
        index: u32,
    },
    ScratchBuffer {
        name: &'a str,
        frame: FrameHandle,
        size: u64,
        usage: BufferUsage,
    },
    CommandBuffer {
        name: &'a str,
        frame: FrameHandle,
    },
}

impl CreateRequest<'_> {
    /// Kind of the handle the backend must return for this request.
    #[must_use]
    pub const fn kind(&self) -> HandleKind {
        match self {
            Self::DescriptorSetLayout { .. } => HandleKind::DescriptorSetLayout,
            Self::PipelineLayout { .. } => HandleKind::PipelineLayout,
            Self::DescriptorPool { .. } => HandleKind::DescriptorPool,
            Self::DescriptorSet { .. } => HandleKind::DescriptorSet,
            Self::Pipeline { .. } => HandleKind::Pipeline,
            Self::TimelineSemaphore { .. } => HandleKind::Semaphore,
            Self::Frame { .. } => HandleKind::Frame,
            Self::ScratchBuffer { .. } => HandleKind::ScratchBuffer,
            Self::CommandBuffer { .. } => HandleKind::CommandBuffer,
        }
    }
}

// ─── Pipeline Linking ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkMode {
    /// Cheap link so rendering is never blocked on optimization.
    Fast,
    /// Link-time optimized; may take considerably longer.
    Optimized,
}

/// Links shader-stage pipeline libraries into an executable pipeline.
#[derive(Debug, Clone, Copy)]
pub struct LinkRequest<'a> {
    pub name: &'a str,
    pub layout: PipelineLayoutHandle,
    pub libraries: &'a [PipelineHandle],
    pub mode: LinkMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkedPipeline {
    pub handle: PipelineHandle,
    /// Set when the backend produced an optimized pipeline even for a fast
    /// link, in which case no background relink is needed.
    pub optimized: bool,
}

// ─── Descriptor Updates ──────────────────────────────────────────────────────

/// A resource written into a descriptor slot. Buffers and images live outside
/// the runtime core and are referenced by their raw backend value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorResource {
    Buffer { raw: u64, offset: u64, range: u64 },
    Image { raw: u64 },
    Sampler { raw: u64 },
    CombinedImageSampler { image: u64, sampler: u64 },
}

impl DescriptorResource {
    /// Whether this resource may be written into a slot of type `ty`.
    #[must_use]
    pub const fn matches(&self, ty: DescriptorType) -> bool {
        match self {
            Self::Buffer { .. } => matches!(
                ty,
                DescriptorType::UniformBuffer
                    | DescriptorType::StorageBuffer
                    | DescriptorType::UniformTexelBuffer
                    | DescriptorType::StorageTexelBuffer
            ),
            Self::Image { .. } => {
                matches!(ty, DescriptorType::SampledImage | DescriptorType::StorageImage)
            }
            Self::Sampler { .. } => matches!(ty, DescriptorType::Sampler),
            Self::CombinedImageSampler { .. } => {
                matches!(ty, DescriptorType::CombinedImageSampler)
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DescriptorWrite<'a> {
    pub set: DescriptorSetHandle,
    pub binding: u32,
    pub first_element: u32,
    pub descriptor_type: DescriptorType,
    pub resources: &'a [DescriptorResource],
}

// ─── Frames & Submission ─────────────────────────────────────────────────────

/// Result of acquiring the next presentation image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SurfaceAcquire {
    Acquired(SurfaceImageHandle),
    /// Usable, but the surface should be recreated soon.
    Suboptimal(SurfaceImageHandle),
    /// The surface changed (resize, minimize); nothing was acquired.
    OutOfDate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitStatus {
    Ok,
    Suboptimal,
    OutOfDate,
}

/// A timeline semaphore value to wait on or signal at a pipeline stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SemaphoreSubmit {
    pub semaphore: SemaphoreHandle,
    pub value: u64,
    pub stage: PipelineStage,
}

pub type SemaphoreList = SmallVec<[SemaphoreSubmit; 4]>;

#[derive(Debug, Clone, Copy)]
pub struct SubmitInfo<'a> {
    pub frame: FrameHandle,
    pub command_buffers: &'a [CommandBufferHandle],
    pub waits: &'a [SemaphoreSubmit],
    pub signals: &'a [SemaphoreSubmit],
    /// Image to present once the submitted work completes.
    pub present: Option<SurfaceImageHandle>,
}

/// Something the CPU can block on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitTarget {
    /// Until the semaphore's counter reaches `value`.
    Semaphore {
        semaphore: SemaphoreHandle,
        value: u64,
    },
    /// Until the frame's last submission (and presentation) completed.
    Frame(FrameHandle),
}

// ─── Backend Trait ───────────────────────────────────────────────────────────

/// The GPU device, queue and surface collaborator.
pub trait GpuBackend: Send + Sync {
    /// Creates one object. The returned handle must be of `request.kind()`.
    fn create_handle(&self, request: &CreateRequest<'_>) -> Result<Handle, BackendError>;

    /// Releases one object. The runtime guarantees the GPU no longer uses it.
    fn destroy_handle(&self, handle: Handle);

    fn link_pipeline(&self, request: &LinkRequest<'_>) -> Result<LinkedPipeline, BackendError>;

    fn update_descriptor_set(&self, write: &DescriptorWrite<'_>);

    /// Host write into a scratch buffer. Bounds are checked by the caller.
    fn write_buffer(&self, buffer: ScratchBufferHandle, offset: u64, data: &[u8]);

    /// Resets the frame's transient allocations for a new recording.
    fn begin_frame(&self, frame: FrameHandle, name: &str);

    fn end_frame(&self, frame: FrameHandle);

    fn acquire_surface(&self, frame: FrameHandle) -> Result<SurfaceAcquire, BackendError>;

    fn submit(&self, submit: &SubmitInfo<'_>) -> Result<SubmitStatus, BackendError>;

    /// Blocks the calling thread until `target` is reached.
    fn wait(&self, target: WaitTarget);

    fn query_current_value(&self, semaphore: SemaphoreHandle) -> u64;

    /// Host-side signal of a timeline semaphore.
    fn signal(&self, semaphore: SemaphoreHandle, value: u64) -> Result<(), BackendError>;

    fn wait_idle(&self);
}
