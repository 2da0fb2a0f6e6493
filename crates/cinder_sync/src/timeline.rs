//! Timeline Semaphores
//!
//! A timeline semaphore is a monotonically increasing `u64` counter shared by
//! the CPU and the GPU. The runtime hands out *tickets* (the next counter
//! value) in program order and guarantees the counter is advanced through them
//! in that same order, no matter which thread signals.
//!
//! # Tickets
//!
//! | Issued by                          | Fulfilled by                         |
//! |------------------------------------|--------------------------------------|
//! | [`TimelineSemaphore::promise`]     | [`TimelinePromise::signal`] on CPU   |
//! | [`TimelineSemaphore::signal_info`] | a GPU submission carrying the value  |
//!
//! [`TimelinePromise::signal`] first waits until ticket `t - 1` is observed,
//! so out-of-order `signal` calls from concurrent producers still advance the
//! counter strictly `1, 2, 3, …`.
//!
//! A GPU ticket is a [`TimelineSignal`]. It only counts as outstanding once
//! [`TimelineSignal::submitted`] records that a submission carrying it was
//! accepted, so dropping the semaphore never waits on a ticket that no
//! submission will fulfil.
//!
//! # Waiters
//!
//! A [`TimelineWaiter`] snapshots a target value once. Later tickets do not
//! move it. [`TimelineWaiter::poll`] never reports completion before
//! [`TimelineWaiter::wait`] would return, and always does afterwards, since
//! both compare the same monotonic counter against the same fixed target.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use cinder_core::{
    BackendContext, CinderError, CreateRequest, OrAbort, PipelineStage, Result, SemaphoreHandle,
    SemaphoreSubmit, SharedBackend, WaitTarget, fatal,
};

use crate::destroyer::Destroyer;

struct Inner {
    backend: SharedBackend,
    handle: SemaphoreHandle,
    name: String,
    /// Last ticket issued, CPU or GPU.
    pending: AtomicU64,
    /// Last ticket issued as a CPU promise.
    cpu_pending: AtomicU64,
    /// Last GPU ticket whose submission was accepted.
    gpu_pending: AtomicU64,
    /// Highest value known to have been reached.
    observed: AtomicU64,
}

impl Inner {
    #[inline]
    fn observed(&self) -> u64 {
        self.observed.load(Ordering::Acquire)
    }

    #[inline]
    fn observe(&self, value: u64) {
        self.observed.fetch_max(value, Ordering::AcqRel);
    }

    fn issue(&self) -> u64 {
        self.pending.fetch_add(1, Ordering::AcqRel) + 1
    }

    fn wait_for(&self, value: u64) {
        if self.observed() >= value {
            return;
        }
        self.backend.wait(WaitTarget::Semaphore {
            semaphore: self.handle,
            value,
        });
        self.observe(value);
    }

    fn query(&self) -> u64 {
        let value = self.backend.query_current_value(self.handle);
        self.observe(value);
        self.observed()
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        // Only submitted GPU tickets are guaranteed to be fulfilled; an
        // abandoned CPU promise or unsubmitted signal would block forever.
        let gpu = self.gpu_pending.load(Ordering::Acquire);
        self.wait_for(gpu);
        log::trace!("Destroying timeline semaphore '{}' ({})", self.name, self.handle);
        self.backend.destroy_handle(self.handle.into());
    }
}

/// CPU/GPU timeline semaphore.
///
/// Dropping the semaphore waits for its outstanding GPU signals and then
/// releases the backend object. Promises and waiters keep it alive.
pub struct TimelineSemaphore {
    inner: Arc<Inner>,
}

impl TimelineSemaphore {
    pub fn new(backend: SharedBackend, name: &str) -> Result<Self> {
        let handle = backend
            .create_handle(&CreateRequest::TimelineSemaphore { name })
            .context(|| format!("creating timeline semaphore '{name}'"))?;
        let handle = SemaphoreHandle::from_handle(handle);
        log::debug!("Created timeline semaphore '{name}' ({handle})");
        Ok(Self {
            inner: Arc::new(Inner {
                backend,
                handle,
                name: name.to_owned(),
                pending: AtomicU64::new(0),
                cpu_pending: AtomicU64::new(0),
                gpu_pending: AtomicU64::new(0),
                observed: AtomicU64::new(0),
            }),
        })
    }

    #[inline]
    #[must_use]
    pub fn handle(&self) -> SemaphoreHandle {
        self.inner.handle
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Value reported by the backend right now.
    #[must_use]
    pub fn value(&self) -> u64 {
        self.inner.query()
    }

    /// Highest value this semaphore has observed, without asking the backend.
    #[must_use]
    pub fn observed_value(&self) -> u64 {
        self.inner.observed()
    }

    /// The last ticket issued.
    #[must_use]
    pub fn pending_value(&self) -> u64 {
        self.inner.pending.load(Ordering::Acquire)
    }

    /// Issues the next ticket as a CPU obligation.
    #[must_use]
    pub fn promise(&self) -> TimelinePromise {
        let value = self.inner.issue();
        self.inner.cpu_pending.fetch_max(value, Ordering::AcqRel);
        log::trace!("'{}': promise for {value}", self.inner.name);
        TimelinePromise {
            inner: self.inner.clone(),
            value,
            fulfilled: false,
        }
    }

    /// Issues the next ticket for a GPU submission to signal at `stage`.
    ///
    /// Call [`TimelineSignal::submitted`] once the submission carrying it was
    /// accepted by the backend.
    pub fn signal_info(&self, stage: PipelineStage) -> TimelineSignal {
        let value = self.inner.issue();
        log::trace!("'{}': GPU signal for {value}", self.inner.name);
        TimelineSignal {
            inner: self.inner.clone(),
            info: SemaphoreSubmit {
                semaphore: self.inner.handle,
                value,
                stage,
            },
            submitted: false,
        }
    }

    /// A submission wait on the last issued ticket.
    #[must_use]
    pub fn wait_info(&self, stage: PipelineStage) -> SemaphoreSubmit {
        SemaphoreSubmit {
            semaphore: self.inner.handle,
            value: self.pending_value(),
            stage,
        }
    }

    #[must_use]
    pub fn waiter_for_pending_value(&self) -> TimelineWaiter {
        TimelineWaiter {
            inner: self.inner.clone(),
            value: self.pending_value(),
        }
    }

    #[must_use]
    pub fn waiter_for_current_value(&self) -> TimelineWaiter {
        TimelineWaiter {
            inner: self.inner.clone(),
            value: self.inner.query(),
        }
    }

    /// Blocks until every issued ticket has been reached.
    pub fn wait(&self) {
        self.inner.wait_for(self.pending_value());
    }
}

impl fmt::Debug for TimelineSemaphore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimelineSemaphore")
            .field("name", &self.inner.name)
            .field("handle", &self.inner.handle)
            .field("pending", &self.pending_value())
            .field("cpu_pending", &self.inner.cpu_pending.load(Ordering::Relaxed))
            .field("gpu_pending", &self.inner.gpu_pending.load(Ordering::Relaxed))
            .field("observed", &self.observed_value())
            .finish()
    }
}

impl Destroyer for TimelineSemaphore {
    fn destroy(self: Box<Self>) {
        drop(self);
    }
}

/// A single-use CPU signal obligation for one ticket.
#[must_use = "an unsignaled promise stalls every later ticket"]
pub struct TimelinePromise {
    inner: Arc<Inner>,
    value: u64,
    fulfilled: bool,
}

impl TimelinePromise {
    #[inline]
    #[must_use]
    pub fn value(&self) -> u64 {
        self.value
    }

    /// Signals this ticket once the previous one was reached.
    ///
    /// Blocks the calling thread while ticket `value - 1` is outstanding.
    pub fn signal(mut self) {
        let inner = &self.inner;
        inner.wait_for(self.value - 1);

        if inner.observed() >= self.value {
            fatal(CinderError::programmer(format!(
                "'{}': no pending CPU signal promise for {} (observed {})",
                inner.name,
                self.value,
                inner.observed()
            )));
        }
        inner
            .backend
            .signal(inner.handle, self.value)
            .context(|| format!("signalling '{}' to {}", inner.name, self.value))
            .or_abort();
        inner.observe(self.value);
        log::trace!("'{}': signalled {}", inner.name, self.value);
        self.fulfilled = true;
    }
}

impl Drop for TimelinePromise {
    fn drop(&mut self) {
        if !self.fulfilled && !std::thread::panicking() {
            log::warn!(
                "'{}': promise for {} dropped without being signalled",
                self.inner.name,
                self.value
            );
        }
    }
}

impl fmt::Debug for TimelinePromise {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TimelinePromise({}, {})", self.inner.name, self.value)
    }
}

/// A GPU signal ticket on its way into a submission.
#[must_use = "an unsubmitted GPU signal stalls every later ticket"]
pub struct TimelineSignal {
    inner: Arc<Inner>,
    info: SemaphoreSubmit,
    submitted: bool,
}

impl TimelineSignal {
    #[inline]
    #[must_use]
    pub fn value(&self) -> u64 {
        self.info.value
    }

    /// The entry to put in a submission's signal list.
    #[inline]
    #[must_use]
    pub fn info(&self) -> SemaphoreSubmit {
        self.info
    }

    /// Records that the backend accepted a submission signalling this
    /// ticket. Dropping the semaphore waits for it from then on.
    pub fn submitted(mut self) {
        self.inner
            .gpu_pending
            .fetch_max(self.info.value, Ordering::AcqRel);
        self.submitted = true;
    }
}

impl Drop for TimelineSignal {
    fn drop(&mut self) {
        if !self.submitted && !std::thread::panicking() {
            log::warn!(
                "'{}': GPU signal for {} dropped without being submitted",
                self.inner.name,
                self.info.value
            );
        }
    }
}

impl fmt::Debug for TimelineSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TimelineSignal({}, {})", self.inner.name, self.info.value)
    }
}

/// A fixed target value on one semaphore.
#[derive(Clone)]
pub struct TimelineWaiter {
    inner: Arc<Inner>,
    value: u64,
}

impl TimelineWaiter {
    #[inline]
    #[must_use]
    pub fn value(&self) -> u64 {
        self.value
    }

    #[must_use]
    pub fn semaphore(&self) -> SemaphoreHandle {
        self.inner.handle
    }

    /// Blocks until the counter reached the target.
    pub fn wait(&self) {
        self.inner.wait_for(self.value);
    }

    /// Non-blocking [`wait`](Self::wait).
    #[must_use]
    pub fn poll(&self) -> bool {
        self.inner.observed() >= self.value || self.inner.query() >= self.value
    }

    /// A submission wait on this waiter's target.
    #[must_use]
    pub fn wait_info(&self, stage: PipelineStage) -> SemaphoreSubmit {
        SemaphoreSubmit {
            semaphore: self.inner.handle,
            value: self.value,
            stage,
        }
    }
}

impl fmt::Debug for TimelineWaiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TimelineWaiter({}, {})", self.inner.name, self.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cinder_dev_utils::MockBackend;

    fn semaphore(name: &str) -> (Arc<MockBackend>, TimelineSemaphore) {
        let backend = Arc::new(MockBackend::new());
        let sem = TimelineSemaphore::new(backend.clone(), name).unwrap();
        (backend, sem)
    }

    #[test]
    fn tickets_are_issued_in_order() {
        let (backend, sem) = semaphore("tickets");
        let a = sem.promise();
        let b = sem.signal_info(PipelineStage::ALL);
        let c = sem.promise();
        assert_eq!((a.value(), b.value(), c.value()), (1, 2, 3));
        assert_eq!(sem.wait_info(PipelineStage::ALL).value, 3);

        a.signal();
        // the GPU reaches its ticket
        backend.set_semaphore_value(sem.handle(), b.value());
        b.submitted();
        drop(c);
    }

    #[test]
    fn unsubmitted_gpu_signal_does_not_block_drop() {
        let (backend, sem) = semaphore("unsubmitted");
        backend.set_auto_complete(false);
        let handle = sem.handle();
        let signal = sem.signal_info(PipelineStage::ALL);
        assert_eq!(signal.info().value, 1);
        drop(signal);
        drop(sem);
        assert!(!backend.is_live(handle.into()));
    }

    #[test]
    fn submitted_gpu_signal_is_waited_on_drop() {
        let (backend, sem) = semaphore("submitted");
        backend.set_auto_complete(false);
        let handle = sem.handle();
        sem.signal_info(PipelineStage::ALL).submitted();

        let gpu = {
            let backend = backend.clone();
            std::thread::spawn(move || {
                std::thread::sleep(std::time::Duration::from_millis(20));
                backend.set_semaphore_value(handle, 1);
            })
        };
        drop(sem);
        assert_eq!(backend.semaphore_value(handle), 1);
        assert!(!backend.is_live(handle.into()));
        gpu.join().unwrap();
    }

    #[test]
    fn waiter_target_is_fixed_at_creation() {
        let (_backend, sem) = semaphore("fixed");
        let p1 = sem.promise();
        let w = sem.waiter_for_pending_value();
        let p2 = sem.promise();
        assert_eq!(w.value(), 1);
        assert!(!w.poll());

        p1.signal();
        assert!(w.poll());
        w.wait();
        assert_eq!(sem.observed_value(), 1);
        p2.signal();
        assert_eq!(sem.value(), 2);
    }

    #[test]
    fn current_value_waiter_is_already_reached() {
        let (backend, sem) = semaphore("current");
        backend.set_semaphore_value(sem.handle(), 5);
        let w = sem.waiter_for_current_value();
        assert_eq!(w.value(), 5);
        assert!(w.poll());
    }

    #[test]
    fn drop_destroys_backend_object() {
        let (backend, sem) = semaphore("drop");
        let handle = sem.handle();
        let w = sem.waiter_for_current_value();
        drop(sem);
        assert!(backend.is_live(handle.into()));
        drop(w);
        assert!(!backend.is_live(handle.into()));
    }
}
