//! Bounded-buffer, LIFO, fixed-worker task runner with graceful shutdown.
//!
//! Newest-first ordering is deliberate: a freshly requested thumbnail is the
//! one a user is waiting on right now, while older queued entries may have
//! already timed out upstream. Submission never blocks; a saturated buffer
//! surfaces as [`Error::QueueFull`] so callers see backpressure.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{error, warn};

use crate::error::{Error, Result};

pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Callback invoked with the panic message when a task panics. Installing
/// one keeps panic reporting out of the log stream if embedders prefer
/// their own channel.
pub type PanicHandler = Arc<dyn Fn(&str) + Send + Sync + 'static>;

pub struct Scheduler {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

struct Shared {
    state: Mutex<State>,
    /// Wakes workers when work arrives or shutdown begins.
    work_cv: Condvar,
    /// Wakes the shutdown waiter when the pool drains.
    idle_cv: Condvar,
    buffer: usize,
    panic_handler: Option<PanicHandler>,
}

struct State {
    queue: Vec<Task>,
    active: usize,
    closed: bool,
}

impl Scheduler {
    pub fn new(workers: usize, buffer: usize, panic_handler: Option<PanicHandler>) -> Scheduler {
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                queue: Vec::with_capacity(buffer),
                active: 0,
                closed: false,
            }),
            work_cv: Condvar::new(),
            idle_cv: Condvar::new(),
            buffer,
            panic_handler,
        });
        let handles = (0..workers.max(1))
            .map(|i| {
                let shared = Arc::clone(&shared);
                thread::Builder::new()
                    .name(format!("thumb-worker-{i}"))
                    .spawn(move || worker_loop(&shared))
                    .expect("spawn worker thread")
            })
            .collect();
        Scheduler {
            shared,
            workers: Mutex::new(handles),
        }
    }

    /// Enqueue a task, newest-first. Fails fast with [`Error::QueueFull`]
    /// when the buffer is saturated and [`Error::EngineClosed`] once
    /// shutdown has begun; never blocks on worker progress.
    pub fn submit(&self, task: Task) -> Result<()> {
        let mut state = self.shared.state.lock();
        if state.closed {
            return Err(Error::EngineClosed);
        }
        if state.queue.len() >= self.shared.buffer {
            return Err(Error::QueueFull);
        }
        state.queue.push(task);
        drop(state);
        self.shared.work_cv.notify_one();
        Ok(())
    }

    /// Number of tasks waiting in the buffer (not counting in-flight ones).
    pub fn queued(&self) -> usize {
        self.shared.state.lock().queue.len()
    }

    /// Stop accepting submissions and wait for queued plus in-flight work to
    /// drain. If the deadline fires first, the remaining queue is discarded
    /// (their result handles are the engine's responsibility) and
    /// [`Error::ShutdownTimeout`] is returned.
    pub fn shutdown(&self, deadline: Duration) -> Result<()> {
        let deadline_at = Instant::now() + deadline;
        let mut state = self.shared.state.lock();
        state.closed = true;
        self.shared.work_cv.notify_all();

        while !(state.queue.is_empty() && state.active == 0) {
            if self
                .shared
                .idle_cv
                .wait_until(&mut state, deadline_at)
                .timed_out()
            {
                let discarded = state.queue.len();
                state.queue.clear();
                drop(state);
                self.shared.work_cv.notify_all();
                warn!(discarded, "shutdown deadline reached; discarded queued tasks");
                return Err(Error::ShutdownTimeout);
            }
        }
        drop(state);
        self.shared.work_cv.notify_all();
        for handle in self.workers.lock().drain(..) {
            let _ = handle.join();
        }
        Ok(())
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock();
        if !state.closed {
            state.closed = true;
            state.queue.clear();
        }
        drop(state);
        self.shared.work_cv.notify_all();
        // Workers exit on their own; in-flight tasks are left to finish.
    }
}

fn worker_loop(shared: &Shared) {
    loop {
        let task = {
            let mut state = shared.state.lock();
            loop {
                if let Some(task) = state.queue.pop() {
                    state.active += 1;
                    break task;
                }
                if state.closed {
                    return;
                }
                shared.work_cv.wait(&mut state);
            }
        };

        run_contained(shared, task);

        let mut state = shared.state.lock();
        state.active -= 1;
        if state.queue.is_empty() && state.active == 0 {
            shared.idle_cv.notify_all();
        }
    }
}

/// Run one task, containing any panic so the worker survives.
fn run_contained(shared: &Shared, task: Task) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(task)) {
        let msg = panic_message(payload.as_ref());
        match &shared.panic_handler {
            Some(handler) => handler(&msg),
            None => error!("worker task panicked: {msg}"),
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "opaque panic payload".to_string()
    }
}
