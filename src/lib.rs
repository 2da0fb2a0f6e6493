//! # Cinder
//!
//! Resource caching and lifecycle synchronization core for real-time GPU
//! renderers. Expensive driver objects (pipelines, pipeline and descriptor-set
//! layouts, descriptor sets) are created once per distinct description, safe
//! under concurrent creation, and destroyed only once the GPU provably stopped
//! referencing them.
//!
//! The facade re-exports the member crates:
//!
//! - [`cinder_core`]: handles, the [`GpuBackend`] contract, errors, settings
//! - [`cinder_sync`]: timeline semaphores and deferred destroyers
//! - [`cinder_cache`]: object, layout, descriptor-set and pipeline caches
//! - [`cinder_frame`]: the frame-in-flight ring
//!
//! [`Runtime`] owns one of each and wires them together.

pub mod runtime;

pub use {cinder_cache, cinder_core, cinder_frame, cinder_sync};

pub use cinder_cache::{
    DescriptorSet, DescriptorSetLayout, ObjectCache, Outcome, Pipeline, PipelineDesc,
    PipelineLayout,
};
pub use cinder_core::{
    BackendError, CacheKey, CinderError, GpuBackend, PipelineLayoutCreateInfo, Result,
    RuntimeSettings, ShaderLayout, ShaderStage, SharedBackend,
};
pub use cinder_frame::{Frame, FrameRing, ScratchBuffer};
pub use cinder_sync::{
    BoxedDestroyer, Destroyer, DestroyerSender, TimelinePromise, TimelineSemaphore,
    TimelineSignal, TimelineWaiter,
};
pub use runtime::{Runtime, RuntimeSnapshot};
