//! Frame-in-flight Ring
//!
//! The ring owns `N` frame slots that are recorded round robin. Every slot
//! carries what it needs to be reused safely:
//!
//! ```text
//!  slot i ── handle      backend frame (command pool, fence, scratch arena)
//!         ── waiter      resolves once the slot's last submission completed
//!         ── deferred    destroyers queued while the slot was recording
//!         ── transient   per-frame scratch and command buffers
//! ```
//!
//! # Slot Lifecycle
//!
//! ```text
//! Idle ──begin──► Recording ──cancel──► Idle            (index unchanged)
//!                     │
//!                     └──end──► Submitted ──(revisit)──► wait ► drain ► Idle
//! ```
//!
//! Reclamation is lazy. A submitted slot is only waited on when the ring
//! comes back around to it, which is also when its deferred destroyers run.
//! A resource released during frame `K` therefore stays valid until frame
//! `K + N` begins.
//!
//! Background producers cannot reach a slot directly. They post into the
//! ring's [`DestroyerQueue`] mailbox, which every frame end drains into the
//! slot being submitted.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use cinder_core::{
    BackendContext, CinderError, CreateRequest, FrameHandle, Handle, Result, SharedBackend,
    WaitTarget, fatal,
};
use cinder_sync::{
    BoxedDestroyer, Destroyer, DestroyerQueue, DestroyerSender, TimelineWaiter, run_destroyers,
};
use parking_lot::Mutex;

use crate::frame::Frame;

// ─── Slot ────────────────────────────────────────────────────────────────────

pub(crate) struct FrameSlot {
    pub(crate) handle: FrameHandle,
    pub(crate) waiter: Option<TimelineWaiter>,
    pub(crate) deferred: Vec<BoxedDestroyer>,
    pub(crate) transient: Vec<Handle>,
}

impl FrameSlot {
    fn create(backend: &SharedBackend, index: usize) -> Result<Self> {
        let h = backend
            .create_handle(&CreateRequest::Frame { index: index as u32 })
            .context(|| format!("creating frame slot {index}"))?;
        Ok(Self {
            handle: FrameHandle::from_handle(h),
            waiter: None,
            deferred: Vec::new(),
            transient: Vec::new(),
        })
    }

    /// Blocks until the slot's last submission completed, then reclaims
    /// everything that submission may have referenced.
    pub(crate) fn wait(&mut self, backend: &SharedBackend) -> usize {
        match self.waiter.take() {
            Some(waiter) => waiter.wait(),
            None => backend.wait(WaitTarget::Frame(self.handle)),
        }
        for h in self.transient.drain(..) {
            backend.destroy_handle(h);
        }
        run_destroyers(self.deferred.drain(..))
    }

    fn destroy(mut self, backend: &SharedBackend) -> usize {
        let n = self.wait(backend);
        backend.destroy_handle(self.handle.into());
        n
    }
}

pub(crate) struct RingState {
    pub(crate) slots: Vec<FrameSlot>,
}

// ─── Ring ────────────────────────────────────────────────────────────────────

pub struct FrameRing {
    pub(crate) backend: SharedBackend,
    pub(crate) state: Mutex<RingState>,
    pub(crate) mailbox: DestroyerQueue,
    // [Write] only while `state` is locked
    pub(crate) index: AtomicUsize,
    pub(crate) absolute: AtomicU64,
    len: AtomicUsize,
    sleeping: AtomicBool,
}

impl FrameRing {
    pub fn new(backend: SharedBackend, frames_in_flight: usize) -> Result<Self> {
        if frames_in_flight == 0 {
            return Err(CinderError::validation("a frame ring needs at least one frame"));
        }
        let slots = (0..frames_in_flight)
            .map(|i| FrameSlot::create(&backend, i))
            .collect::<Result<Vec<_>>>()?;
        log::debug!("Created frame ring with {frames_in_flight} frames in flight");
        Ok(Self {
            backend,
            state: Mutex::new(RingState { slots }),
            mailbox: DestroyerQueue::new(),
            index: AtomicUsize::new(0),
            absolute: AtomicU64::new(0),
            len: AtomicUsize::new(frames_in_flight),
            sleeping: AtomicBool::new(false),
        })
    }

    /// Starts recording the next slot.
    ///
    /// Blocks until the slot's previous submission completed and its deferred
    /// destroyers ran. Beginning a frame while another one is recording is a
    /// programmer error.
    pub fn begin_frame(&self) -> Frame<'_> {
        let Some(mut state) = self.state.try_lock() else {
            fatal(CinderError::programmer(
                "begin_frame called while a frame is recording",
            ));
        };
        let index = self.index();
        let slot = &mut state.slots[index];
        let ran = slot.wait(&self.backend);
        if ran > 0 {
            log::trace!("frame_{index}: ran {ran} deferred destroyers");
        }
        let name = format!("frame_{index}");
        self.backend.begin_frame(slot.handle, &name);
        Frame::new(self, state, index, name)
    }

    /// Slot the next [`begin_frame`](Self::begin_frame) records into.
    #[inline]
    #[must_use]
    pub fn index(&self) -> usize {
        self.index.load(Ordering::Acquire)
    }

    /// Number of frames ended so far.
    #[inline]
    #[must_use]
    pub fn absolute_index(&self) -> u64 {
        self.absolute.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn frames_in_flight(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    /// While sleeping, frames have no surface. Set when the surface is out of
    /// date or has a zero extent.
    #[must_use]
    pub fn is_sleeping(&self) -> bool {
        self.sleeping.load(Ordering::Acquire)
    }

    pub fn set_sleeping(&self, sleeping: bool) {
        if self.sleeping.swap(sleeping, Ordering::AcqRel) != sleeping {
            log::debug!("Frame ring {}", if sleeping { "sleeping" } else { "awake" });
        }
    }

    /// Producer endpoint of the mailbox drained at every frame end.
    #[must_use]
    pub fn destroyer_sender(&self) -> DestroyerSender {
        self.mailbox.sender()
    }

    /// Queues a destroyer from any thread. It runs once the frame that
    /// drains it has completed on the GPU.
    pub fn queue_destroy(&self, destroyer: impl Destroyer) {
        self.mailbox.sender().send(destroyer);
    }

    /// Destroyers posted to the mailbox that no frame has picked up yet.
    #[must_use]
    pub fn pending_mailbox(&self) -> usize {
        self.mailbox.len()
    }

    /// Grows or shrinks the ring.
    ///
    /// Every slot is waited first; removed slots are then destroyed and new
    /// ones created. Recording resumes at slot 0.
    pub fn resize(&self, frames_in_flight: usize) -> Result<()> {
        if frames_in_flight == 0 {
            return Err(CinderError::validation("a frame ring needs at least one frame"));
        }
        let Some(mut state) = self.state.try_lock() else {
            return Err(CinderError::programmer("resizing the frame ring while a frame is recording"));
        };
        for slot in &mut state.slots {
            slot.wait(&self.backend);
        }
        while state.slots.len() > frames_in_flight {
            if let Some(slot) = state.slots.pop() {
                slot.destroy(&self.backend);
            }
        }
        for i in state.slots.len()..frames_in_flight {
            state.slots.push(FrameSlot::create(&self.backend, i)?);
        }
        self.index.store(0, Ordering::Release);
        self.len.store(frames_in_flight, Ordering::Release);
        log::info!("Frame ring resized to {frames_in_flight} frames in flight");
        Ok(())
    }

    /// Waits every slot and runs every pending destroyer, including the ones
    /// still in the mailbox.
    pub fn wait_all(&self) -> Result<usize> {
        let Some(mut state) = self.state.try_lock() else {
            return Err(CinderError::programmer("waiting the frame ring while a frame is recording"));
        };
        let mut n = 0;
        for slot in &mut state.slots {
            n += slot.wait(&self.backend);
        }
        Ok(n + run_destroyers(self.mailbox.drain()))
    }

    /// Waits every slot, then destroys every backend frame. The ring is empty
    /// afterwards.
    pub fn destroy_all(&self) -> usize {
        let mut state = self.state.lock();
        let mut n = 0;
        for slot in state.slots.drain(..) {
            n += slot.destroy(&self.backend);
        }
        self.len.store(0, Ordering::Release);
        n + run_destroyers(self.mailbox.drain())
    }
}

impl Drop for FrameRing {
    fn drop(&mut self) {
        if !self.state.get_mut().slots.is_empty() {
            self.destroy_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use cinder_core::HandleKind;
    use cinder_dev_utils::MockBackend;

    #[test]
    fn rejects_empty_ring() {
        let backend = Arc::new(MockBackend::new());
        assert!(FrameRing::new(backend, 0).is_err());
    }

    #[test]
    fn resize_replaces_slots() {
        let backend = Arc::new(MockBackend::new());
        let ring = FrameRing::new(backend.clone(), 3).unwrap();
        ring.resize(1).unwrap();
        assert_eq!(ring.frames_in_flight(), 1);
        assert_eq!(backend.live(HandleKind::Frame), 1);
        ring.resize(2).unwrap();
        assert_eq!(backend.live(HandleKind::Frame), 2);
        assert_eq!(ring.index(), 0);
    }

    #[test]
    fn drop_runs_mailbox_and_destroys_frames() {
        let backend = Arc::new(MockBackend::new());
        let ran = Arc::new(AtomicUsize::new(0));
        {
            let ring = FrameRing::new(backend.clone(), 2).unwrap();
            let r = ran.clone();
            ring.queue_destroy(move || {
                r.fetch_add(1, Ordering::SeqCst);
            });
            assert_eq!(ring.pending_mailbox(), 1);
        }
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert_eq!(backend.live_total(), 0);
    }
}
