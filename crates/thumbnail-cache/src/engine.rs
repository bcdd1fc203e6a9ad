//! The deduplicating front door of the cache.
//!
//! `enqueue` maps every request onto exactly one unit of work per cache id:
//! concurrent requests for the same id share a single [`TaskResult`], and a
//! request whose thumbnail already exists gets a pre-closed sentinel without
//! touching the scheduler at all.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fs;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::Duration;

use parking_lot::{Condvar, Mutex, RwLock};
use tracing::info;

use crate::cache::{Factory, ThumbInfo};
use crate::error::{Error, Result};
use crate::gc::Gc;
use crate::scheduler::{panic_message, Scheduler};
use crate::CacheConfig;

/// Shared, write-once completion handle for one generation task.
///
/// The error slot is written before the signal closes, so a waiter that has
/// observed completion may read the error without further synchronization.
/// Closing is idempotent: later closes neither crash nor overwrite the
/// recorded outcome.
#[derive(Clone, Debug)]
pub struct TaskResult {
    inner: Arc<ResultInner>,
}

#[derive(Debug)]
struct ResultInner {
    done: Mutex<bool>,
    cv: Condvar,
    error: OnceLock<Error>,
}

impl TaskResult {
    fn open() -> TaskResult {
        TaskResult {
            inner: Arc::new(ResultInner {
                done: Mutex::new(false),
                cv: Condvar::new(),
                error: OnceLock::new(),
            }),
        }
    }

    /// A sentinel that was born closed; safe to hand to any number of
    /// readers because it is never written again.
    fn closed() -> TaskResult {
        TaskResult {
            inner: Arc::new(ResultInner {
                done: Mutex::new(true),
                cv: Condvar::new(),
                error: OnceLock::new(),
            }),
        }
    }

    fn close(&self, error: Option<Error>) {
        if let Some(e) = error {
            // First writer wins; a shutdown close after a worker close must
            // not clobber the task's real outcome.
            let _ = self.inner.error.set(e);
        }
        let mut done = self.inner.done.lock();
        if !*done {
            *done = true;
            self.inner.cv.notify_all();
        }
    }

    /// Block until the task finishes, then report its outcome.
    pub fn wait(&self) -> Result<()> {
        let mut done = self.inner.done.lock();
        while !*done {
            self.inner.cv.wait(&mut done);
        }
        drop(done);
        match self.inner.error.get() {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }

    /// Like [`wait`](Self::wait) but bounded; `None` means the timeout fired
    /// before completion.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<()>> {
        let deadline = std::time::Instant::now() + timeout;
        let mut done = self.inner.done.lock();
        while !*done {
            if self.inner.cv.wait_until(&mut done, deadline).timed_out() {
                if *done {
                    break;
                }
                return None;
            }
        }
        drop(done);
        Some(match self.inner.error.get() {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        })
    }

    pub fn is_done(&self) -> bool {
        *self.inner.done.lock()
    }

    /// The recorded error, if any. Meaningful once the handle has closed.
    pub fn error(&self) -> Option<Error> {
        self.inner.error.get().cloned()
    }
}

type PendingMap = Mutex<HashMap<String, TaskResult>>;

/// Long-lived service façade: factory + scheduler + GC + pending registry.
pub struct Engine {
    factory: Factory,
    scheduler: Scheduler,
    gc: Gc,
    /// `None` once shutdown has begun; swapping the whole registry out lets
    /// `enqueue` detect closure without a dedicated flag.
    pending: RwLock<Option<Arc<PendingMap>>>,
    sentinel: TaskResult,
}

impl Engine {
    /// Engine over `base_dir` with default configuration.
    pub fn new(base_dir: &std::path::Path) -> Result<Engine> {
        Engine::with_config(base_dir, CacheConfig::default())
    }

    pub fn with_config(base_dir: &std::path::Path, config: CacheConfig) -> Result<Engine> {
        config.validate()?;
        let factory = Factory::with_program(base_dir, &config.convert_program)?;
        let gc = Gc::new(
            factory.base_dir(),
            config.limit_bytes,
            config.high_ratio,
            config.low_ratio,
        );
        let scheduler = Scheduler::new(config.workers, config.buffer, config.panic_handler());
        Ok(Engine {
            factory,
            scheduler,
            gc,
            pending: RwLock::new(Some(Arc::new(Mutex::new(HashMap::new())))),
            sentinel: TaskResult::closed(),
        })
    }

    /// The factory used to build `ThumbInfo` values for this cache.
    pub fn factory(&self) -> &Factory {
        &self.factory
    }

    /// Current tracked disk usage estimate in bytes.
    pub fn cache_used(&self) -> i64 {
        self.gc.used()
    }

    /// Ensure a generation task exists for `ti` and return its result handle.
    ///
    /// Fast path: if the thumbnail is already on disk (which also applies
    /// the lazy atime touch) the shared pre-closed sentinel comes back and
    /// no work is scheduled. Otherwise the first caller in wins: it installs
    /// the pending entry and submits the task; every concurrent duplicate
    /// receives the same handle and therefore the same outcome.
    pub fn enqueue(&self, ti: ThumbInfo) -> Result<TaskResult> {
        let pending = match &*self.pending.read() {
            Some(p) => Arc::clone(p),
            None => return Err(Error::EngineClosed),
        };
        if ti.exists() {
            return Ok(self.sentinel.clone());
        }

        let fresh = TaskResult::open();
        let existing = {
            let mut map = pending.lock();
            match map.entry(ti.id().to_string()) {
                Entry::Occupied(entry) => Some(entry.get().clone()),
                Entry::Vacant(slot) => {
                    slot.insert(fresh.clone());
                    None
                }
            }
        };
        if let Some(handle) = existing {
            // Piggyback on the in-flight task. If that task finished between
            // our existence probe and the registry read, the handle is
            // already closed with its outcome, which is exactly what a
            // late-joining waiter should see.
            return Ok(handle);
        }

        let task = {
            let ti = ti.clone();
            let handle = fresh.clone();
            let gc = self.gc.clone();
            let registry = Arc::clone(&pending);
            move || {
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| run_task(&ti, &gc)));
                let error = match outcome {
                    Ok(Ok(())) => None,
                    Ok(Err(e)) => Some(e),
                    Err(payload) => Some(Error::Internal(panic_message(payload.as_ref()))),
                };
                // Close before unregistering: the registry must never hold
                // an entry for a task that is neither queued nor running,
                // and late arrivals that find the entry get a closed handle.
                handle.close(error);
                registry.lock().remove(ti.id());
            }
        };

        if let Err(e) = self.scheduler.submit(Box::new(task)) {
            pending.lock().remove(ti.id());
            fresh.close(Some(e.clone()));
            return Err(e);
        }
        Ok(fresh)
    }

    /// Resolve a thumbnail to its on-disk path, generating it if necessary.
    pub fn get(&self, ti: &ThumbInfo) -> Result<PathBuf> {
        self.enqueue(ti.clone())?.wait()?;
        Ok(ti.path().to_path_buf())
    }

    /// Whether a generation task for `ti` is currently queued or running.
    pub fn is_pending(&self, ti: &ThumbInfo) -> bool {
        match &*self.pending.read() {
            Some(p) => p.lock().contains_key(ti.id()),
            None => false,
        }
    }

    /// Stop accepting requests, drain or discard outstanding work within
    /// `deadline`, and unblock every remaining waiter with
    /// [`Error::EngineClosed`]. Idempotent; later calls return `Ok`.
    pub fn shutdown(&self, deadline: Duration) -> Result<()> {
        let Some(old) = self.pending.write().take() else {
            return Ok(());
        };
        info!("engine shutting down");

        let gc = self.gc.clone();
        let gc_join = thread::spawn(move || gc.shutdown(deadline));
        let scheduler_result = self.scheduler.shutdown(deadline);
        let gc_result = gc_join
            .join()
            .unwrap_or_else(|_| Err(Error::Internal("gc shutdown thread panicked".into())));

        // Anything still registered belongs to a task that was discarded or
        // is beyond the deadline; release its waiters. Close is guarded, so
        // racing with a worker that finishes late is harmless.
        for (_, handle) in old.lock().drain() {
            handle.close(Some(Error::EngineClosed));
        }
        scheduler_result.and(gc_result)
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        // An engine dropped without an explicit shutdown must not strand
        // waiters on handles that will never close.
        let _ = self.shutdown(Duration::ZERO);
    }
}

fn run_task(ti: &ThumbInfo, gc: &Gc) -> Result<()> {
    if ti.exists() {
        // Someone else produced it between scheduling and execution.
        return Ok(());
    }
    ti.make()?;
    let md = fs::metadata(ti.path())
        .map_err(|e| Error::io(format!("stat generated {}", ti.path().display()), &e))?;
    gc.track(md.len() as i64);
    Ok(())
}
