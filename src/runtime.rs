//! Runtime Core Module
//!
//! [`Runtime`] is the single owner of every process-wide cache and of the
//! frame ring. It wires them together:
//!
//! - the pipeline cache posts superseded and evicted pipelines into the frame
//!   ring's destroyer mailbox, so they are released only after the frame that
//!   picks them up has completed on the GPU;
//! - descriptor sets are banked per set layout and go back to their bank
//!   through [`Frame::queue_destroy`] or [`Runtime::queue_destroy`];
//! - teardown runs in a fixed order once the device is idle.
//!
//! # Example
//!
//! ```rust,ignore
//! use cinder::{Runtime, RuntimeSettings};
//!
//! let runtime = Runtime::new(backend, RuntimeSettings::default())?;
//!
//! let layout = runtime.create_pipeline_layout(&stages)?;
//! let vs = runtime.create_pipeline(&vertex_desc);
//! let fs = runtime.create_pipeline(&fragment_desc);
//! let pipeline = runtime.link_pipeline(&layout, &[vs, fs]);
//!
//! loop {
//!     let mut frame = runtime.begin_frame();
//!     let Some(image) = frame.surface() else {
//!         frame.cancel();
//!         continue;
//!     };
//!     // ... record ...
//!     frame.end(Vec::new());
//! }
//! ```

use std::sync::Arc;

use cinder_cache::{
    CacheSnapshot, DescriptorSet, DescriptorSetCache, DescriptorSetCacheSnapshot,
    DescriptorSetLayout, LayoutCache, LayoutSnapshot, Pipeline, PipelineCache, PipelineDesc,
    PipelineLayout,
};
use cinder_core::{OrAbort, PipelineLayoutCreateInfo, Result, RuntimeSettings, SharedBackend};
use cinder_frame::{Frame, FrameRing};
use cinder_sync::{Destroyer, DestroyerSender, TimelineSemaphore};
use parking_lot::Mutex;
use serde::Serialize;

/// Serializable view of every cache.
#[derive(Debug, Clone, Serialize)]
pub struct RuntimeSnapshot {
    pub layouts: LayoutSnapshot,
    pub descriptor_sets: DescriptorSetCacheSnapshot,
    pub pipelines: CacheSnapshot,
}

pub struct Runtime {
    backend: SharedBackend,
    settings: RuntimeSettings,

    layouts: LayoutCache,
    descriptor_sets: Arc<DescriptorSetCache>,
    pipelines: PipelineCache,
    frames: FrameRing,

    extent: Mutex<(u32, u32)>,
    shut_down: bool,
}

impl Runtime {
    /// Creates the caches, the frame ring and the relink workers.
    ///
    /// Invalid settings are the one recoverable failure.
    pub fn new(backend: SharedBackend, settings: RuntimeSettings) -> Result<Self> {
        settings.validate()?;

        let frames = FrameRing::new(backend.clone(), settings.max_frames_in_flight as usize)?;
        let pipelines = PipelineCache::new(
            backend.clone(),
            frames.destroyer_sender(),
            settings.relink_workers,
        )?;
        log::info!(
            "Cinder runtime initialized: {} frames in flight, descriptor banks of {}, {} relink workers",
            settings.max_frames_in_flight,
            settings.descriptor_pool_bank_size,
            settings.relink_workers
        );

        Ok(Self {
            layouts: LayoutCache::new(backend.clone()),
            descriptor_sets: DescriptorSetCache::new(
                backend.clone(),
                settings.descriptor_pool_bank_size,
            ),
            pipelines,
            frames,
            backend,
            settings,
            extent: Mutex::new((0, 0)),
            shut_down: false,
        })
    }

    #[must_use]
    pub fn settings(&self) -> &RuntimeSettings {
        &self.settings
    }

    #[must_use]
    pub fn backend(&self) -> &SharedBackend {
        &self.backend
    }

    // ========================================================================
    // Caches
    // ========================================================================

    #[must_use]
    pub fn layouts(&self) -> &LayoutCache {
        &self.layouts
    }

    #[must_use]
    pub fn descriptor_sets(&self) -> &Arc<DescriptorSetCache> {
        &self.descriptor_sets
    }

    #[must_use]
    pub fn pipelines(&self) -> &PipelineCache {
        &self.pipelines
    }

    #[must_use]
    pub fn frames(&self) -> &FrameRing {
        &self.frames
    }

    pub fn create_pipeline_layout(
        &self,
        stages: &[PipelineLayoutCreateInfo<'_>],
    ) -> Result<Arc<PipelineLayout>> {
        self.layouts.create_pipeline_layout(stages)
    }

    /// Allocates a descriptor set of `layout`. Failing to grow a pool bank is
    /// fatal.
    pub fn new_descriptor_set(&self, layout: &Arc<DescriptorSetLayout>) -> DescriptorSet {
        self.descriptor_sets.allocate(layout).or_abort()
    }

    pub fn create_pipeline(&self, desc: &PipelineDesc) -> Pipeline {
        self.pipelines.create_pipeline(desc)
    }

    pub fn link_pipeline(&self, layout: &PipelineLayout, libraries: &[Pipeline]) -> Pipeline {
        self.pipelines.link(layout, libraries)
    }

    pub fn timeline_semaphore(&self, name: &str) -> TimelineSemaphore {
        TimelineSemaphore::new(self.backend.clone(), name).or_abort()
    }

    // ========================================================================
    // Frames
    // ========================================================================

    pub fn begin_frame(&self) -> Frame<'_> {
        self.frames.begin_frame()
    }

    /// A mailbox endpoint for other threads.
    #[must_use]
    pub fn destroyer_sender(&self) -> DestroyerSender {
        self.frames.destroyer_sender()
    }

    /// Defers `destroyer` until the next frame to end has completed.
    pub fn queue_destroy(&self, destroyer: impl Destroyer) {
        self.frames.queue_destroy(destroyer);
    }

    /// Handles a surface resize. A zero extent puts frames to sleep until the
    /// next non-zero resize.
    pub fn resize(&self, width: u32, height: u32) {
        *self.extent.lock() = (width, height);
        if width == 0 || height == 0 {
            self.frames.set_sleeping(true);
            return;
        }
        self.frames.wait_all().or_abort();
        self.frames.set_sleeping(false);
        log::info!("Resized to {width}x{height}");
    }

    /// Changes the ring length, clamped to `max_frames_in_flight`.
    pub fn set_frames_in_flight(&self, frames: u32) -> Result<()> {
        let n = frames.min(self.settings.max_frames_in_flight);
        self.frames.resize(n as usize)
    }

    #[must_use]
    pub fn extent(&self) -> (u32, u32) {
        *self.extent.lock()
    }

    #[must_use]
    pub fn is_sleeping(&self) -> bool {
        self.frames.is_sleeping()
    }

    // ========================================================================
    // Diagnostics & Teardown
    // ========================================================================

    #[must_use]
    pub fn snapshot(&self) -> RuntimeSnapshot {
        RuntimeSnapshot {
            layouts: self.layouts.snapshot(),
            descriptor_sets: self.descriptor_sets.snapshot(),
            pipelines: self.pipelines.snapshot(),
        }
    }

    /// Tears the runtime down. Dropping the runtime does the same.
    pub fn shutdown(mut self) {
        self.teardown();
    }

    fn teardown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;
        log::info!("Shutting down Cinder runtime");

        self.backend.wait_idle();
        self.pipelines.flush_relinks();
        // also drains the mailbox
        let ran = self.frames.wait_all().or_abort();
        log::debug!("Ran {ran} pending destroyers");

        if self.settings.dump_caches_on_shutdown {
            match serde_json::to_string_pretty(&self.snapshot()) {
                Ok(json) => log::debug!("Cache snapshot:\n{json}"),
                Err(err) => log::warn!("Failed to serialize cache snapshot: {err}"),
            }
        }

        let pipelines = self.pipelines.destroy_all();
        let pipeline_layouts = self.layouts.pipeline_layouts().destroy_all();
        let set_layouts = self.layouts.set_layouts().destroy_all();
        let pools = self.descriptor_sets.destroy_all();
        let frames = self.frames.destroy_all();
        log::debug!(
            "Destroyed {pipelines} pipelines, {pipeline_layouts} pipeline layouts, \
             {set_layouts} set layouts, {pools} descriptor pools, {frames} late destroyers"
        );
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.teardown();
    }
}
