//! The frame recording guard.

use std::fmt;
use std::sync::atomic::Ordering;

use cinder_core::{
    BackendContext, BufferUsage, CinderError, CommandBufferHandle, CreateRequest, FrameHandle,
    OrAbort, Result, ScratchBufferHandle, SemaphoreList, SemaphoreSubmit, SharedBackend,
    SubmitInfo, SubmitStatus, SurfaceAcquire, SurfaceImageHandle, WaitTarget, fatal,
};
use cinder_sync::{BoxedDestroyer, Destroyer, TimelineSignal, TimelineWaiter};
use parking_lot::MutexGuard;
use smallvec::SmallVec;

use crate::ring::{FrameRing, FrameSlot, RingState};

/// A frame being recorded.
///
/// Holds the ring's lock, so only one frame records at a time. A frame stays
/// cancelable until it touches the GPU: acquiring the surface, creating a
/// scratch or command buffer, or taking on a semaphore signal.
#[must_use = "a frame must be ended or cancelled"]
pub struct Frame<'a> {
    ring: &'a FrameRing,
    state: MutexGuard<'a, RingState>,
    index: usize,
    name: String,
    surface: Option<SurfaceImageHandle>,
    cancelable: bool,
    command_buffers: SmallVec<[CommandBufferHandle; 4]>,
    waits: SemaphoreList,
    signals: SemaphoreList,
    signal_tickets: SmallVec<[TimelineSignal; 2]>,
    finished: bool,
}

impl<'a> Frame<'a> {
    pub(crate) fn new(
        ring: &'a FrameRing,
        state: MutexGuard<'a, RingState>,
        index: usize,
        name: String,
    ) -> Self {
        Self {
            ring,
            state,
            index,
            name,
            surface: None,
            cancelable: true,
            command_buffers: SmallVec::new(),
            waits: SemaphoreList::new(),
            signals: SemaphoreList::new(),
            signal_tickets: SmallVec::new(),
            finished: false,
        }
    }

    #[inline]
    fn slot(&mut self) -> &mut FrameSlot {
        &mut self.state.slots[self.index]
    }

    #[inline]
    fn backend(&self) -> &SharedBackend {
        &self.ring.backend
    }

    /// Ring slot being recorded.
    #[inline]
    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    /// How many frames were ended before this one.
    #[must_use]
    pub fn absolute_index(&self) -> u64 {
        self.ring.absolute_index()
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn handle(&self) -> FrameHandle {
        self.state.slots[self.index].handle
    }

    #[must_use]
    pub fn is_cancelable(&self) -> bool {
        self.cancelable
    }

    /// Acquires the presentation image, once per frame.
    ///
    /// Returns `None` while the ring sleeps. An out-of-date surface puts the
    /// ring to sleep.
    pub fn surface(&mut self) -> Option<SurfaceImageHandle> {
        if self.ring.is_sleeping() {
            return None;
        }
        if self.surface.is_some() {
            return self.surface;
        }

        let handle = self.handle();
        // the slot's waiter may not cover the previous presentation
        self.backend().wait(WaitTarget::Frame(handle));
        let acquired = self
            .backend()
            .acquire_surface(handle)
            .context(|| format!("acquiring the surface for {}", self.name))
            .or_abort();
        let image = match acquired {
            SurfaceAcquire::Acquired(image) => image,
            SurfaceAcquire::Suboptimal(image) => {
                log::debug!("{}: surface is suboptimal", self.name);
                image
            }
            SurfaceAcquire::OutOfDate => {
                log::debug!("{}: surface is out of date", self.name);
                self.ring.set_sleeping(true);
                return None;
            }
        };
        self.surface = Some(image);
        self.cancelable = false;
        self.surface
    }

    /// Creates a host-visible buffer that lives until this slot is next
    /// reused.
    pub fn new_scratch_buffer(&mut self, name: &str, size: u64, usage: BufferUsage) -> ScratchBuffer {
        let name = format!("{}_{name}", self.name);
        let frame = self.handle();
        let h = self
            .backend()
            .create_handle(&CreateRequest::ScratchBuffer {
                name: &name,
                frame,
                size,
                usage,
            })
            .context(|| format!("creating scratch buffer {name} ({size} bytes, {usage:?})"))
            .or_abort();
        self.slot().transient.push(h);
        self.cancelable = false;
        ScratchBuffer {
            backend: self.backend().clone(),
            handle: ScratchBufferHandle::from_handle(h),
            name,
            size,
            usage,
        }
    }

    /// Creates a single-use command buffer submitted with this frame.
    pub fn new_command_buffer(&mut self, name: &str) -> CommandBufferHandle {
        let name = format!("{}_{name}", self.name);
        let frame = self.handle();
        let h = self
            .backend()
            .create_handle(&CreateRequest::CommandBuffer { name: &name, frame })
            .context(|| format!("creating command buffer {name}"))
            .or_abort();
        self.slot().transient.push(h);
        self.cancelable = false;
        let cb = CommandBufferHandle::from_handle(h);
        self.command_buffers.push(cb);
        cb
    }

    /// Makes this frame's submission wait on `wait`.
    pub fn wait_semaphore(&mut self, wait: SemaphoreSubmit) {
        self.waits.push(wait);
    }

    /// Makes this frame's submission signal `signal`. The ticket must be
    /// fulfilled, so the frame can no longer be cancelled.
    pub fn signal_semaphore(&mut self, signal: TimelineSignal) {
        self.signals.push(signal.info());
        self.signal_tickets.push(signal);
        self.cancelable = false;
    }

    /// Defers `destroyer` until this slot's submission completed. Same as
    /// passing it to [`end`](Self::end).
    pub fn queue_destroy(&mut self, destroyer: impl Destroyer) {
        self.slot().deferred.push(Box::new(destroyer));
    }

    /// Abandons the frame. The ring index does not move and no destroyer
    /// runs.
    pub fn cancel(mut self) {
        if !self.cancelable {
            fatal(CinderError::programmer(format!(
                "cannot cancel {} after acquiring its surface or creating frame resources",
                self.name
            )));
        }
        self.finish_cancel();
    }

    fn finish_cancel(&mut self) {
        let handle = self.handle();
        self.backend().end_frame(handle);
        self.slot().waiter = None;
        self.finished = true;
        log::trace!("{} cancelled", self.name);
    }

    /// Submits and presents the frame. The slot is reclaimed once its
    /// presentation completed.
    pub fn end(self, destroyers: impl IntoIterator<Item = BoxedDestroyer>) {
        self.end_with_waiter(None, destroyers);
    }

    /// Submits the frame; the slot is reclaimed once `waiter` resolved, or,
    /// without a waiter, once the frame's presentation completed.
    ///
    /// A frame without a surface needs a waiter.
    pub fn end_with_waiter(
        mut self,
        waiter: Option<TimelineWaiter>,
        destroyers: impl IntoIterator<Item = BoxedDestroyer>,
    ) {
        if self.surface.is_none() && waiter.is_none() {
            fatal(CinderError::programmer(format!(
                "cannot end {} without an acquired surface and without a waiter",
                self.name
            )));
        }

        let handle = self.handle();
        if self.surface.is_some() || !self.command_buffers.is_empty() || !self.signals.is_empty()
        {
            let status = self
                .backend()
                .submit(&SubmitInfo {
                    frame: handle,
                    command_buffers: &self.command_buffers,
                    waits: &self.waits,
                    signals: &self.signals,
                    present: self.surface,
                })
                .context(|| format!("submitting {}", self.name))
                .or_abort();
            for ticket in self.signal_tickets.drain(..) {
                ticket.submitted();
            }
            if status != SubmitStatus::Ok {
                log::debug!("{}: submit returned {status:?}", self.name);
                self.ring.set_sleeping(true);
            }
        }
        self.backend().end_frame(handle);

        let ring = self.ring;
        let slot = self.slot();
        let drained = ring.mailbox.drain_into(&mut slot.deferred);
        slot.waiter = waiter;
        slot.deferred.extend(destroyers);
        if drained > 0 {
            log::trace!("frame_{}: took {drained} destroyers from the mailbox", ring.index());
        }

        let len = self.state.slots.len();
        ring.index.store((self.index + 1) % len, Ordering::Release);
        ring.absolute.fetch_add(1, Ordering::AcqRel);
        self.finished = true;
    }
}

impl Drop for Frame<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if self.cancelable {
            log::warn!("{} dropped without being ended, cancelling it", self.name);
            self.finish_cancel();
        } else if std::thread::panicking() {
            let handle = self.handle();
            self.backend().end_frame(handle);
        } else {
            fatal(CinderError::programmer(format!(
                "{} dropped after acquiring GPU resources without being ended",
                self.name
            )));
        }
    }
}

impl fmt::Debug for Frame<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("name", &self.name)
            .field("surface", &self.surface)
            .field("cancelable", &self.cancelable)
            .field("command_buffers", &self.command_buffers.len())
            .finish_non_exhaustive()
    }
}

/// Host-visible buffer scoped to one frame slot.
pub struct ScratchBuffer {
    backend: SharedBackend,
    handle: ScratchBufferHandle,
    name: String,
    size: u64,
    usage: BufferUsage,
}

impl ScratchBuffer {
    #[inline]
    #[must_use]
    pub fn handle(&self) -> ScratchBufferHandle {
        self.handle
    }

    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    #[must_use]
    pub fn usage(&self) -> BufferUsage {
        self.usage
    }

    pub fn write(&self, offset: u64, data: &[u8]) -> Result<()> {
        let end = offset.checked_add(data.len() as u64);
        if end.is_none_or(|end| end > self.size) {
            return Err(CinderError::validation(format!(
                "writing {} bytes at offset {offset} overflows {} ({} bytes)",
                data.len(),
                self.name,
                self.size
            )));
        }
        self.backend.write_buffer(self.handle, offset, data);
        Ok(())
    }
}

impl fmt::Debug for ScratchBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ScratchBuffer({}, {}, {} bytes)", self.name, self.handle, self.size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use cinder_core::HandleKind;
    use cinder_dev_utils::{MockBackend, MockEvent};

    fn ring() -> (Arc<MockBackend>, FrameRing) {
        let backend = Arc::new(MockBackend::new());
        let ring = FrameRing::new(backend.clone(), 2).unwrap();
        (backend, ring)
    }

    #[test]
    fn scratch_write_is_bounds_checked() {
        let (backend, ring) = ring();
        let mut frame = ring.begin_frame();
        let buf = frame.new_scratch_buffer("uniforms", 64, BufferUsage::UNIFORM);
        assert!(buf.write(0, &[0; 64]).is_ok());
        assert!(buf.write(60, &[0; 8]).is_err());
        assert!(buf.write(u64::MAX, &[0]).is_err());
        assert!(!frame.is_cancelable());
        assert!(frame.surface().is_some());
        frame.end(Vec::new());

        let writes = backend
            .events()
            .iter()
            .filter(|e| matches!(e, MockEvent::WriteBuffer { .. }))
            .count();
        assert_eq!(writes, 1);
    }

    #[test]
    fn transient_buffers_are_reclaimed_on_revisit() {
        let (backend, ring) = ring();
        for _ in 0..2 {
            let mut frame = ring.begin_frame();
            frame.new_command_buffer("main");
            frame.surface();
            frame.end(Vec::new());
        }
        assert_eq!(backend.live(HandleKind::CommandBuffer), 2);
        ring.begin_frame().cancel();
        assert_eq!(backend.live(HandleKind::CommandBuffer), 1);
    }

    #[test]
    #[should_panic(expected = "cannot cancel frame_0")]
    fn cancel_after_surface_is_fatal() {
        let (_backend, ring) = ring();
        let mut frame = ring.begin_frame();
        let _ = frame.surface();
        frame.cancel();
    }

    #[test]
    #[should_panic(expected = "without an acquired surface and without a waiter")]
    fn end_without_surface_or_waiter_is_fatal() {
        let (_backend, ring) = ring();
        ring.begin_frame().end(Vec::new());
    }

    #[test]
    fn dropping_cancelable_frame_cancels_it() {
        let (backend, ring) = ring();
        {
            let _frame = ring.begin_frame();
        }
        assert_eq!(ring.index(), 0);
        assert!(backend.position(|e| matches!(e, MockEvent::EndFrame(_))).is_some());
        ring.begin_frame().cancel();
    }
}
