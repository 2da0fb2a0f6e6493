//! Recording mock of the GPU backend.
//!
//! [`MockBackend`] hands out unique handles, tracks which ones are alive, logs
//! every call as a [`MockEvent`] and models timeline semaphores and frame
//! fences closely enough to exercise the runtime's ordering guarantees.
//!
//! By default the mock GPU completes work at submission time. Call
//! [`MockBackend::set_auto_complete(false)`](MockBackend::set_auto_complete)
//! to hold submitted signals until [`MockBackend::complete_all`].
//!
//! Every blocking wait gives up after [`WAIT_TIMEOUT`] and panics, so a
//! missed signal fails the test instead of hanging it.

use std::collections::VecDeque;
use std::num::NonZeroU64;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use cinder_core::{
    BackendError, CreateRequest, DescriptorSetHandle, DescriptorWrite, FrameHandle, GpuBackend,
    Handle, HandleKind, LinkMode, LinkRequest, LinkedPipeline, PipelineHandle,
    ScratchBufferHandle, SemaphoreHandle, SemaphoreSubmit, SubmitInfo, SubmitStatus,
    SurfaceAcquire, SurfaceImageHandle, WaitTarget,
};
use parking_lot::{Condvar, Mutex};
use rustc_hash::{FxHashMap, FxHashSet};

pub const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// One recorded backend call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockEvent {
    Create(Handle),
    Destroy(Handle),
    Link {
        handle: PipelineHandle,
        mode: LinkMode,
    },
    UpdateDescriptorSet {
        set: DescriptorSetHandle,
        binding: u32,
        first_element: u32,
        count: usize,
    },
    WriteBuffer {
        buffer: ScratchBufferHandle,
        offset: u64,
        len: usize,
    },
    BeginFrame(FrameHandle),
    EndFrame(FrameHandle),
    AcquireSurface(FrameHandle),
    Submit {
        frame: FrameHandle,
        command_buffers: usize,
        waits: Vec<SemaphoreSubmit>,
        signals: Vec<SemaphoreSubmit>,
        present: bool,
    },
    Wait(WaitTarget),
    Signal {
        semaphore: SemaphoreHandle,
        value: u64,
    },
    WaitIdle,
}

/// Scripted outcome of the next `acquire_surface` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireScript {
    Acquired,
    Suboptimal,
    OutOfDate,
    Fail(BackendError),
}

#[derive(Default)]
struct Ledger {
    live: FxHashSet<Handle>,
    created: FxHashMap<HandleKind, usize>,
    destroyed: FxHashMap<HandleKind, usize>,
    /// Sets allocated from each pool; destroying the pool frees them.
    pool_sets: FxHashMap<Handle, Vec<Handle>>,
    fail_next: Option<(HandleKind, BackendError)>,
}

#[derive(Default)]
struct GpuState {
    values: FxHashMap<SemaphoreHandle, u64>,
    /// Every value each semaphore was advanced to, in order.
    history: FxHashMap<SemaphoreHandle, Vec<u64>>,
    queued_signals: Vec<SemaphoreSubmit>,
    busy_frames: FxHashSet<FrameHandle>,
}

impl GpuState {
    fn advance(&mut self, semaphore: SemaphoreHandle, value: u64) {
        let current = self.values.entry(semaphore).or_insert(0);
        if value > *current {
            *current = value;
            self.history.entry(semaphore).or_default().push(value);
        }
    }

    fn value(&self, semaphore: SemaphoreHandle) -> u64 {
        self.values.get(&semaphore).copied().unwrap_or(0)
    }
}

pub struct MockBackend {
    next_raw: AtomicU64,
    ledger: Mutex<Ledger>,
    events: Mutex<Vec<MockEvent>>,

    gpu: Mutex<GpuState>,
    gpu_changed: Condvar,
    auto_complete: AtomicBool,

    acquire_script: Mutex<VecDeque<AcquireScript>>,
    submit_script: Mutex<VecDeque<Result<SubmitStatus, BackendError>>>,

    create_delay: Mutex<Duration>,
    fast_links_optimized: AtomicBool,
    panic_optimized: AtomicBool,
    hold_optimized: Mutex<bool>,
    hold_released: Condvar,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBackend {
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_raw: AtomicU64::new(0x1000),
            ledger: Mutex::default(),
            events: Mutex::default(),
            gpu: Mutex::default(),
            gpu_changed: Condvar::new(),
            auto_complete: AtomicBool::new(true),
            acquire_script: Mutex::default(),
            submit_script: Mutex::default(),
            create_delay: Mutex::new(Duration::ZERO),
            fast_links_optimized: AtomicBool::new(false),
            panic_optimized: AtomicBool::new(false),
            hold_optimized: Mutex::new(false),
            hold_released: Condvar::new(),
        }
    }

    // ── Configuration ────────────────────────────────────────────────────────

    /// When off, submitted signals and frame fences stay pending until
    /// [`complete_all`](Self::complete_all).
    pub fn set_auto_complete(&self, on: bool) {
        self.auto_complete.store(on, Ordering::SeqCst);
    }

    /// Sleeps inside every `create_handle` to widen race windows.
    pub fn set_create_delay(&self, delay: Duration) {
        *self.create_delay.lock() = delay;
    }

    /// The next creation of `kind` fails with `error`.
    pub fn fail_next_create(&self, kind: HandleKind, error: BackendError) {
        self.ledger.lock().fail_next = Some((kind, error));
    }

    pub fn script_acquire(&self, outcome: AcquireScript) {
        self.acquire_script.lock().push_back(outcome);
    }

    pub fn script_submit(&self, outcome: Result<SubmitStatus, BackendError>) {
        self.submit_script.lock().push_back(outcome);
    }

    /// Make fast links report an already optimized pipeline.
    pub fn set_fast_links_optimized(&self, on: bool) {
        self.fast_links_optimized.store(on, Ordering::SeqCst);
    }

    /// The next optimized link panics inside the backend call.
    pub fn panic_next_optimized_link(&self) {
        self.panic_optimized.store(true, Ordering::SeqCst);
    }

    /// Blocks every optimized link until [`release_optimized_links`](Self::release_optimized_links).
    pub fn hold_optimized_links(&self) {
        *self.hold_optimized.lock() = true;
    }

    pub fn release_optimized_links(&self) {
        *self.hold_optimized.lock() = false;
        self.hold_released.notify_all();
    }

    // ── Simulated GPU ────────────────────────────────────────────────────────

    /// Moves a semaphore forward as if the GPU signalled it.
    pub fn set_semaphore_value(&self, semaphore: SemaphoreHandle, value: u64) {
        self.gpu.lock().advance(semaphore, value);
        self.gpu_changed.notify_all();
    }

    /// Completes every pending submission.
    pub fn complete_all(&self) {
        let mut gpu = self.gpu.lock();
        for s in std::mem::take(&mut gpu.queued_signals) {
            gpu.advance(s.semaphore, s.value);
        }
        gpu.busy_frames.clear();
        drop(gpu);
        self.gpu_changed.notify_all();
    }

    #[must_use]
    pub fn semaphore_value(&self, semaphore: SemaphoreHandle) -> u64 {
        self.gpu.lock().value(semaphore)
    }

    /// Every value `semaphore` has been advanced to, in order.
    #[must_use]
    pub fn signal_history(&self, semaphore: SemaphoreHandle) -> Vec<u64> {
        self.gpu
            .lock()
            .history
            .get(&semaphore)
            .cloned()
            .unwrap_or_default()
    }

    // ── Inspection ───────────────────────────────────────────────────────────

    #[must_use]
    pub fn created(&self, kind: HandleKind) -> usize {
        self.ledger.lock().created.get(&kind).copied().unwrap_or(0)
    }

    #[must_use]
    pub fn destroyed(&self, kind: HandleKind) -> usize {
        self.ledger.lock().destroyed.get(&kind).copied().unwrap_or(0)
    }

    #[must_use]
    pub fn live(&self, kind: HandleKind) -> usize {
        self.ledger
            .lock()
            .live
            .iter()
            .filter(|h| h.kind() == kind)
            .count()
    }

    #[must_use]
    pub fn live_total(&self) -> usize {
        self.ledger.lock().live.len()
    }

    #[must_use]
    pub fn is_live(&self, handle: Handle) -> bool {
        self.ledger.lock().live.contains(&handle)
    }

    #[must_use]
    pub fn events(&self) -> Vec<MockEvent> {
        self.events.lock().clone()
    }

    pub fn clear_events(&self) {
        self.events.lock().clear();
    }

    /// Position of the first event matching `pred`.
    #[must_use]
    pub fn position(&self, pred: impl Fn(&MockEvent) -> bool) -> Option<usize> {
        self.events.lock().iter().position(pred)
    }

    // ── Internals ────────────────────────────────────────────────────────────

    fn record(&self, event: MockEvent) {
        self.events.lock().push(event);
    }

    fn fresh(&self, kind: HandleKind) -> Handle {
        let raw = self.next_raw.fetch_add(1, Ordering::Relaxed);
        Handle::new(kind, NonZeroU64::new(raw).unwrap_or(NonZeroU64::MIN))
    }

    fn track(&self, kind: HandleKind) -> Handle {
        let handle = self.fresh(kind);
        let mut ledger = self.ledger.lock();
        ledger.live.insert(handle);
        *ledger.created.entry(kind).or_insert(0) += 1;
        drop(ledger);
        self.record(MockEvent::Create(handle));
        handle
    }

    fn block_until(&self, what: &str, mut ready: impl FnMut(&GpuState) -> bool) {
        let deadline = Instant::now() + WAIT_TIMEOUT;
        let mut gpu = self.gpu.lock();
        while !ready(&gpu) {
            if self.gpu_changed.wait_until(&mut gpu, deadline).timed_out() && !ready(&gpu) {
                drop(gpu);
                panic!("MockBackend: timed out waiting for {what}");
            }
        }
    }
}

impl GpuBackend for MockBackend {
    fn create_handle(&self, request: &CreateRequest<'_>) -> Result<Handle, BackendError> {
        let kind = request.kind();
        {
            let mut ledger = self.ledger.lock();
            if ledger.fail_next.as_ref().is_some_and(|(k, _)| *k == kind) {
                if let Some((_, err)) = ledger.fail_next.take() {
                    return Err(err);
                }
            }
        }
        let delay = *self.create_delay.lock();
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        let handle = self.track(kind);
        if let CreateRequest::DescriptorSet { pool, .. } = request {
            self.ledger
                .lock()
                .pool_sets
                .entry(pool.handle())
                .or_default()
                .push(handle);
        }
        log::trace!("mock: created {handle:?}");
        Ok(handle)
    }

    fn destroy_handle(&self, handle: Handle) {
        let mut ledger = self.ledger.lock();
        assert!(
            ledger.live.remove(&handle),
            "MockBackend: destroy of {handle:?} which is not alive (double destroy?)"
        );
        *ledger.destroyed.entry(handle.kind()).or_insert(0) += 1;
        if let Some(sets) = ledger.pool_sets.remove(&handle) {
            for set in sets {
                ledger.live.remove(&set);
            }
        }
        drop(ledger);
        self.record(MockEvent::Destroy(handle));
    }

    fn link_pipeline(&self, request: &LinkRequest<'_>) -> Result<LinkedPipeline, BackendError> {
        if request.mode == LinkMode::Optimized {
            if self.panic_optimized.swap(false, Ordering::SeqCst) {
                panic!("MockBackend: optimized link of {} panicked", request.name);
            }
            let deadline = Instant::now() + WAIT_TIMEOUT;
            let mut held = self.hold_optimized.lock();
            while *held {
                if self.hold_released.wait_until(&mut held, deadline).timed_out() {
                    panic!("MockBackend: optimized link held for too long");
                }
            }
        }
        let handle = PipelineHandle::from_handle(self.track(HandleKind::Pipeline));
        self.record(MockEvent::Link {
            handle,
            mode: request.mode,
        });
        let optimized = match request.mode {
            LinkMode::Optimized => true,
            LinkMode::Fast => self.fast_links_optimized.load(Ordering::SeqCst),
        };
        Ok(LinkedPipeline { handle, optimized })
    }

    fn update_descriptor_set(&self, write: &DescriptorWrite<'_>) {
        self.record(MockEvent::UpdateDescriptorSet {
            set: write.set,
            binding: write.binding,
            first_element: write.first_element,
            count: write.resources.len(),
        });
    }

    fn write_buffer(&self, buffer: ScratchBufferHandle, offset: u64, data: &[u8]) {
        self.record(MockEvent::WriteBuffer {
            buffer,
            offset,
            len: data.len(),
        });
    }

    fn begin_frame(&self, frame: FrameHandle, name: &str) {
        log::trace!("mock: begin {name}");
        self.record(MockEvent::BeginFrame(frame));
    }

    fn end_frame(&self, frame: FrameHandle) {
        self.record(MockEvent::EndFrame(frame));
    }

    fn acquire_surface(&self, frame: FrameHandle) -> Result<SurfaceAcquire, BackendError> {
        self.record(MockEvent::AcquireSurface(frame));
        let script = self
            .acquire_script
            .lock()
            .pop_front()
            .unwrap_or(AcquireScript::Acquired);
        let image = || SurfaceImageHandle::from_handle(self.fresh(HandleKind::SurfaceImage));
        match script {
            AcquireScript::Acquired => Ok(SurfaceAcquire::Acquired(image())),
            AcquireScript::Suboptimal => Ok(SurfaceAcquire::Suboptimal(image())),
            AcquireScript::OutOfDate => Ok(SurfaceAcquire::OutOfDate),
            AcquireScript::Fail(err) => Err(err),
        }
    }

    fn submit(&self, submit: &SubmitInfo<'_>) -> Result<SubmitStatus, BackendError> {
        self.record(MockEvent::Submit {
            frame: submit.frame,
            command_buffers: submit.command_buffers.len(),
            waits: submit.waits.to_vec(),
            signals: submit.signals.to_vec(),
            present: submit.present.is_some(),
        });
        let status = self.submit_script.lock().pop_front().unwrap_or(Ok(SubmitStatus::Ok));

        let mut gpu = self.gpu.lock();
        if self.auto_complete.load(Ordering::SeqCst) {
            for s in submit.signals {
                gpu.advance(s.semaphore, s.value);
            }
        } else {
            gpu.queued_signals.extend_from_slice(submit.signals);
            gpu.busy_frames.insert(submit.frame);
        }
        drop(gpu);
        self.gpu_changed.notify_all();
        status
    }

    fn wait(&self, target: WaitTarget) {
        self.record(MockEvent::Wait(target));
        match target {
            WaitTarget::Semaphore { semaphore, value } => {
                self.block_until(&format!("{semaphore:?} to reach {value}"), |gpu| {
                    gpu.value(semaphore) >= value
                });
            }
            WaitTarget::Frame(frame) => {
                self.block_until(&format!("{frame:?} to complete"), |gpu| {
                    !gpu.busy_frames.contains(&frame)
                });
            }
        }
    }

    fn query_current_value(&self, semaphore: SemaphoreHandle) -> u64 {
        self.semaphore_value(semaphore)
    }

    fn signal(&self, semaphore: SemaphoreHandle, value: u64) -> Result<(), BackendError> {
        self.record(MockEvent::Signal { semaphore, value });
        self.set_semaphore_value(semaphore, value);
        Ok(())
    }

    fn wait_idle(&self) {
        self.record(MockEvent::WaitIdle);
        self.complete_all();
    }
}
