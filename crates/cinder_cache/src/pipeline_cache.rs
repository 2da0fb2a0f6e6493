//! Pipeline Cache & Background Relinking
//!
//! Shader-stage pipeline libraries (and compute pipelines) are memoized
//! through an [`ObjectCache`] keyed by shader, entry point, stage, layout and
//! specialization constants.
//!
//! # Relink / Optimize
//!
//! Linking libraries into an executable pipeline has two speeds. [`link`]
//! inserts a *fast* link synchronously so rendering never waits for
//! optimization, then queues a [`RelinkJob`] on the worker pool. A worker
//! performs the optimized link and, under the cache's exclusive lock, swaps
//! the entry from the fast handle to the optimized one. The fast handle may
//! still be referenced by recorded GPU work, so its destruction is posted to
//! the destroyer mailbox rather than run on the spot.
//!
//! If the entry was evicted (or replaced) while the job ran, the optimized
//! handle was never visible to anyone and is destroyed immediately.
//!
//! [`link`]: PipelineCache::link

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;

use cinder_core::{
    BackendContext, BackendError, CacheKey, CacheKeyBuilder, CinderError, CreateRequest, LinkMode,
    LinkRequest, OrAbort, PipelineHandle, PipelineLayoutHandle, Result, ShaderStage,
    SharedBackend,
};
use cinder_sync::DestroyerSender;
use parking_lot::{Condvar, Mutex};
use smallvec::SmallVec;

use crate::layout::PipelineLayout;
use crate::object_cache::{CacheSnapshot, ObjectCache, Outcome};

// ─── Descriptions ────────────────────────────────────────────────────────────

/// Defines one shader-stage pipeline library or compute pipeline.
#[derive(Debug, Clone)]
pub struct PipelineDesc {
    /// Identity of the compiled shader module (a content hash or a path).
    pub shader: String,
    pub entry_point: String,
    pub stage: ShaderStage,
    pub layout: Arc<PipelineLayout>,
    pub spec_constants: SmallVec<[u32; 8]>,
}

impl PipelineDesc {
    #[must_use]
    pub fn key(&self) -> CacheKey {
        let spec = self
            .spec_constants
            .iter()
            .fold(CacheKeyBuilder::new(), |b, &v| b.field_u32(v))
            .into_string();
        CacheKeyBuilder::new()
            .field_str(&self.shader)
            .field_str(&self.entry_point)
            .field_hex(u64::from(self.stage.bits()))
            .nested(self.layout.key())
            .field_str(&spec)
            .build()
    }
}

/// A cached pipeline: its identity plus the handle current at lookup time.
///
/// After a background relink the cache holds a newer handle for the same
/// key; look it up again with [`PipelineCache::current`].
#[derive(Clone, PartialEq, Eq)]
pub struct Pipeline {
    key: CacheKey,
    handle: PipelineHandle,
}

impl Pipeline {
    #[must_use]
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    #[inline]
    #[must_use]
    pub fn handle(&self) -> PipelineHandle {
        self.handle
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pipeline({}, {})", self.handle, self.key)
    }
}

// ─── Relink Workers ──────────────────────────────────────────────────────────

/// One optimized relink, run on a worker thread.
struct RelinkJob {
    key: CacheKey,
    name: String,
    layout: PipelineLayoutHandle,
    libraries: SmallVec<[PipelineHandle; 4]>,
    fast: PipelineHandle,
}

struct Shared {
    backend: SharedBackend,
    pipelines: ObjectCache<PipelineHandle>,
    mailbox: DestroyerSender,
    in_flight: Mutex<usize>,
    idle: Condvar,
}

impl Shared {
    fn run(&self, job: RelinkJob) {
        let linked = self.backend.link_pipeline(&LinkRequest {
            name: &job.name,
            layout: job.layout,
            libraries: &job.libraries,
            mode: LinkMode::Optimized,
        });
        let optimized = match linked {
            Ok(l) => l.handle,
            Err(err) => {
                log::warn!("Optimized relink of {} failed, keeping fast link: {err}", job.name);
                return;
            }
        };

        if self.pipelines.replace_if(&job.key, job.fast, optimized) {
            log::debug!("Relinked {}: {} -> {optimized}", job.name, job.fast);
            let backend = self.backend.clone();
            let (name, old) = (job.name, job.fast);
            self.mailbox.send(move || {
                log::debug!("Destroying unoptimized pipeline {name} ({old})");
                backend.destroy_handle(old.into());
            });
        } else {
            log::debug!("{} was evicted during relink, dropping {optimized}", job.name);
            self.backend.destroy_handle(optimized.into());
        }
    }

    fn finish_one(&self) {
        let mut n = self.in_flight.lock();
        *n -= 1;
        if *n == 0 {
            self.idle.notify_all();
        }
    }
}

/// Decrements the in-flight count even if the job panicked.
struct InFlight<'a>(&'a Shared);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.finish_one();
    }
}

struct RelinkWorkers {
    jobs: Option<flume::Sender<RelinkJob>>,
    threads: Vec<JoinHandle<()>>,
}

impl RelinkWorkers {
    fn spawn(shared: &Arc<Shared>, count: usize) -> Result<Self> {
        let (tx, rx) = flume::unbounded::<RelinkJob>();
        let mut threads = Vec::with_capacity(count);
        for i in 0..count {
            let rx = rx.clone();
            let shared = shared.clone();
            let thread = std::thread::Builder::new()
                .name(format!("cinder-relink-{i}"))
                .spawn(move || {
                    while let Ok(job) = rx.recv() {
                        let _guard = InFlight(&shared);
                        let name = job.name.clone();
                        // a panicking backend must not take the worker down
                        if panic::catch_unwind(AssertUnwindSafe(|| shared.run(job))).is_err() {
                            log::error!("Optimized relink of {name} panicked, keeping fast link");
                        }
                    }
                })
                .map_err(|e| {
                    CinderError::backend(
                        format!("spawning relink worker {i}"),
                        BackendError::Other(e.to_string()),
                    )
                })?;
            threads.push(thread);
        }
        Ok(Self {
            jobs: Some(tx),
            threads,
        })
    }
}

impl Drop for RelinkWorkers {
    fn drop(&mut self) {
        // closing the channel ends every worker loop
        self.jobs.take();
        for t in self.threads.drain(..) {
            if t.join().is_err() {
                log::error!("A relink worker panicked");
            }
        }
    }
}

// ─── Cache ───────────────────────────────────────────────────────────────────

pub struct PipelineCache {
    shared: Arc<Shared>,
    workers: RelinkWorkers,
}

impl PipelineCache {
    /// Creates the cache and spawns `workers` relink threads.
    ///
    /// Superseded handles are posted to `mailbox`.
    pub fn new(backend: SharedBackend, mailbox: DestroyerSender, workers: usize) -> Result<Self> {
        let shared = Arc::new(Shared {
            pipelines: ObjectCache::new("pipelines", backend.clone()),
            backend,
            mailbox,
            in_flight: Mutex::new(0),
            idle: Condvar::new(),
        });
        let workers = RelinkWorkers::spawn(&shared, workers.max(1))?;
        Ok(Self { shared, workers })
    }

    /// Get-or-create of a shader-stage library or compute pipeline.
    pub fn create_pipeline(&self, desc: &PipelineDesc) -> Pipeline {
        let key = desc.key();
        let backend = &self.shared.backend;
        let handle = self.shared.pipelines.lookup_or_create(&key, || {
            let name = format!("{}:{}", desc.shader, desc.entry_point);
            let h = backend
                .create_handle(&CreateRequest::Pipeline {
                    name: &name,
                    shader: &desc.shader,
                    entry_point: &desc.entry_point,
                    stage: desc.stage,
                    layout: desc.layout.handle(),
                    spec_constants: &desc.spec_constants,
                })
                .context(|| format!("creating pipeline {name}"))?;
            Ok(PipelineHandle::from_handle(h))
        });
        Pipeline { key, handle }
    }

    /// Links `libraries` into an executable pipeline.
    ///
    /// The first caller gets a fast link and queues the optimized relink;
    /// later callers get whichever handle is current.
    pub fn link(&self, layout: &PipelineLayout, libraries: &[Pipeline]) -> Pipeline {
        let key = libraries
            .iter()
            .fold(CacheKeyBuilder::new().nested(layout.key()), |b, lib| {
                b.nested(lib.key())
            })
            .build();
        let handles: SmallVec<[PipelineHandle; 4]> = libraries.iter().map(|l| l.handle).collect();
        let name = format!("linked_{:016x}", key.hash64());

        let mut needs_relink = false;
        let (handle, outcome) = self.shared.pipelines.resolve(&key, || {
            let linked = self
                .shared
                .backend
                .link_pipeline(&LinkRequest {
                    name: &name,
                    layout: layout.handle(),
                    libraries: &handles,
                    mode: LinkMode::Fast,
                })
                .context(|| format!("linking {name}"))?;
            needs_relink = !linked.optimized;
            Ok(linked.handle)
        });

        if outcome == Outcome::Created && needs_relink {
            self.queue_relink(RelinkJob {
                key: key.clone(),
                name,
                layout: layout.handle(),
                libraries: handles,
                fast: handle,
            });
        }
        Pipeline { key, handle }
    }

    fn queue_relink(&self, job: RelinkJob) {
        *self.shared.in_flight.lock() += 1;
        let sent = self
            .workers
            .jobs
            .as_ref()
            .ok_or_else(|| CinderError::programmer("relink queue already closed"))
            .and_then(|tx| {
                tx.send(job)
                    .map_err(|_| CinderError::programmer("relink workers are gone"))
            });
        if sent.is_err() {
            self.shared.finish_one();
        }
        sent.or_abort();
    }

    /// Handle currently cached for `pipeline`'s key.
    #[must_use]
    pub fn current(&self, pipeline: &Pipeline) -> Option<PipelineHandle> {
        self.shared.pipelines.get(&pipeline.key)
    }

    /// Evicts every pipeline whose key has `fragment` as a whole field, such
    /// as a shader name or a library key. Linked pipelines nest their
    /// libraries' keys, so they go with them. Their destruction goes through
    /// the destroyer mailbox.
    pub fn evict(&self, fragment: &str) -> usize {
        let removed = self.shared.pipelines.remove_matching(|k| k.has_field(fragment));
        for (key, handle) in &removed {
            let backend = self.shared.backend.clone();
            let key = key.clone();
            let handle = *handle;
            self.shared.mailbox.send(move || {
                log::debug!("Destroying pipeline {handle} ({key})");
                backend.destroy_handle(handle.into());
            });
        }
        removed.len()
    }

    /// Blocks until every queued relink has finished.
    pub fn flush_relinks(&self) {
        let mut n = self.shared.in_flight.lock();
        while *n > 0 {
            self.shared.idle.wait(&mut n);
        }
    }

    #[must_use]
    pub fn pending_relinks(&self) -> usize {
        *self.shared.in_flight.lock()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.shared.pipelines.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.shared.pipelines.is_empty()
    }

    #[must_use]
    pub fn cache(&self) -> &ObjectCache<PipelineHandle> {
        &self.shared.pipelines
    }

    #[must_use]
    pub fn snapshot(&self) -> CacheSnapshot {
        self.shared.pipelines.snapshot()
    }

    /// Waits for pending relinks, then destroys every cached pipeline.
    ///
    /// Only valid once the device is idle.
    pub fn destroy_all(&self) -> usize {
        self.flush_relinks();
        self.shared.pipelines.destroy_all()
    }
}
