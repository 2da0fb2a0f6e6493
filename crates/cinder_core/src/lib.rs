//! # Cinder Core
//!
//! Shared vocabulary of the Cinder runtime: typed backend handles, the
//! [`GpuBackend`] collaborator contract, the error taxonomy and its fatal
//! path, [`RuntimeSettings`], canonical [`CacheKey`]s and the shader
//! reflection input the caches derive layouts from.

pub mod backend;
pub mod error;
pub mod flags;
pub mod handle;
pub mod key;
pub mod reflect;
pub mod settings;

pub use backend::{
    CreateRequest, DescriptorResource, DescriptorWrite, GpuBackend, LayoutBinding, LinkMode,
    LinkRequest, LinkedPipeline, PoolSize, PushConstantBlock, SemaphoreList, SemaphoreSubmit,
    SharedBackend, SubmitInfo, SubmitStatus, SurfaceAcquire, WaitTarget,
};
pub use error::{BackendContext, BackendError, CinderError, OrAbort, Result, fatal};
pub use flags::{BufferUsage, PipelineStage, ShaderStage};
pub use handle::{
    CommandBufferHandle, DescriptorPoolHandle, DescriptorSetHandle, DescriptorSetLayoutHandle,
    FrameHandle, Handle, HandleKind, PipelineHandle, PipelineLayoutHandle, ScratchBufferHandle,
    SemaphoreHandle, SurfaceImageHandle,
};
pub use key::{CacheKey, CacheKeyBuilder};
pub use reflect::{
    DescriptorCount, DescriptorType, PipelineLayoutCreateInfo, PushConstantRange, ShaderBinding,
    ShaderLayout,
};
pub use settings::RuntimeSettings;
