//! Background garbage collector bounding cache disk usage.
//!
//! One dedicated thread tracks an estimated `used` byte count. When a tracked
//! write pushes the estimate over the high watermark, the worker evicts files
//! until it drops to the low watermark, picking victims by random-sampled
//! approximated LRU: choose a random shard directory, then delete the file
//! with the oldest atime inside it. The lazy touch performed on cache hits
//! keeps served files newer than idle ones, so the sampling is strongly
//! biased toward the true LRU tail. Eviction errors are logged and swallowed;
//! the policy only bounds disk usage, it owes nobody an exact answer.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use filetime::FileTime;
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use rand::Rng;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Pause between eviction attempts that found nothing removable, so a stale
/// `used` estimate cannot hot-spin the worker.
const EMPTY_EVICTION_BACKOFF: Duration = Duration::from_millis(100);

/// Cloneable handle to the collector; all clones share one worker thread.
#[derive(Clone)]
pub struct Gc {
    state: Arc<GcState>,
    /// Unit capacity: concurrent kicks coalesce into one pending wakeup.
    kick: SyncSender<()>,
    done: Arc<Mutex<Option<Receiver<()>>>>,
}

struct GcState {
    dir: PathBuf,
    high_watermark: i64,
    low_watermark: i64,
    used: AtomicI64,
    stop: AtomicBool,
}

impl Gc {
    /// Spawn the collector for `dir` with `limit` bytes capacity. Eviction
    /// starts above `limit * high_ratio` and stops at `limit * low_ratio`.
    pub fn new(dir: &Path, limit: i64, high_ratio: f64, low_ratio: f64) -> Gc {
        let state = Arc::new(GcState {
            dir: dir.to_path_buf(),
            high_watermark: (limit as f64 * high_ratio) as i64,
            low_watermark: (limit as f64 * low_ratio) as i64,
            used: AtomicI64::new(0),
            stop: AtomicBool::new(false),
        });
        let (kick_tx, kick_rx) = mpsc::sync_channel(1);
        let (done_tx, done_rx) = mpsc::sync_channel(0);
        {
            let state = Arc::clone(&state);
            thread::Builder::new()
                .name("thumb-gc".to_string())
                .spawn(move || worker(&state, &kick_rx, done_tx))
                .expect("spawn gc thread");
        }
        Gc {
            state,
            kick: kick_tx,
            done: Arc::new(Mutex::new(Some(done_rx))),
        }
    }

    /// Add `delta` bytes to the usage estimate and nudge the worker. Never
    /// blocks: a full kick channel means a wakeup is already pending.
    pub fn track(&self, delta: i64) {
        self.state.used.fetch_add(delta, Ordering::Relaxed);
        match self.kick.try_send(()) {
            Ok(()) | Err(TrySendError::Full(())) => {}
            Err(TrySendError::Disconnected(())) => {}
        }
    }

    /// Current usage estimate in bytes.
    pub fn used(&self) -> i64 {
        self.state.used.load(Ordering::Relaxed)
    }

    /// Stop the worker and wait for it to exit, up to `deadline`.
    /// Idempotent; later calls return `Ok` immediately.
    pub fn shutdown(&self, deadline: Duration) -> Result<()> {
        self.state.stop.store(true, Ordering::Release);
        let _ = self.kick.try_send(());
        let Some(done) = self.done.lock().take() else {
            return Ok(());
        };
        match done.recv_timeout(deadline) {
            // The worker signals exit by dropping its sender.
            Ok(()) | Err(RecvTimeoutError::Disconnected) => Ok(()),
            Err(RecvTimeoutError::Timeout) => Err(Error::ShutdownTimeout),
        }
    }
}

fn worker(state: &GcState, kick: &Receiver<()>, _done: SyncSender<()>) {
    let initial = initial_scan(state);
    state.used.fetch_add(initial, Ordering::Relaxed);
    debug!(bytes = initial, "initial cache scan complete");
    if state.used.load(Ordering::Relaxed) > state.high_watermark {
        run_eviction(state);
    }

    loop {
        if kick.recv().is_err() {
            // Every handle is gone; nobody can track or shut down anymore.
            return;
        }
        if state.stop.load(Ordering::Acquire) {
            return;
        }
        if state.used.load(Ordering::Relaxed) > state.high_watermark {
            run_eviction(state);
        }
    }
}

/// Sum regular-file sizes across the two-level shard tree. Races with
/// concurrent writes are fine; `used` is an estimate re-based at startup.
fn initial_scan(state: &GcState) -> i64 {
    let mut total = 0;
    for shard in subdirs(&state.dir) {
        if state.stop.load(Ordering::Acquire) {
            break;
        }
        for inner in subdirs(&shard) {
            for entry in entries_of(&inner) {
                if let Ok(md) = entry.metadata() {
                    if md.is_file() {
                        total += md.len() as i64;
                    }
                }
            }
        }
    }
    total
}

fn run_eviction(state: &GcState) {
    let before = state.used.load(Ordering::Relaxed);
    info!(
        used = before,
        low_watermark = state.low_watermark,
        "disk usage over high watermark; evicting"
    );
    let mut rng = rand::thread_rng();
    let mut freed = 0;
    while state.used.load(Ordering::Relaxed) > state.low_watermark {
        if state.stop.load(Ordering::Acquire) {
            return;
        }
        let removed = evict_one(state, &mut rng);
        freed += removed;
        if removed == 0 {
            thread::sleep(EMPTY_EVICTION_BACKOFF);
        }
    }
    info!(
        freed,
        used = state.used.load(Ordering::Relaxed),
        "eviction complete"
    );
}

/// Remove one approximately-least-recently-used file.
///
/// Samples one random outer and inner shard directory, then deletes the file
/// with the smallest atime in that directory. Empty directories encountered
/// along the way are pruned. Returns the bytes freed (0 when the sample was
/// empty or the victim vanished concurrently).
fn evict_one(state: &GcState, rng: &mut impl Rng) -> i64 {
    let outer = subdirs(&state.dir);
    let Some(outer) = outer.choose(rng) else {
        return 0;
    };
    let inner = subdirs(outer);
    if inner.is_empty() {
        let _ = fs::remove_dir(outer);
        return 0;
    }
    let Some(inner) = inner.choose(rng) else {
        return 0;
    };

    let mut files = Vec::new();
    for entry in entries_of(inner) {
        if let Ok(md) = entry.metadata() {
            if md.is_file() {
                files.push((entry.path(), md));
            }
        }
    }
    if files.is_empty() {
        let _ = fs::remove_dir(inner);
        return 0;
    }
    let remaining = files.len();
    // Oldest access time in the sample; on filesystems without usable atime
    // this degrades to mtime ordering, which the lazy touch keeps equivalent.
    let Some((victim, md)) = files
        .into_iter()
        .min_by_key(|(_, md)| FileTime::from_last_access_time(md))
    else {
        return 0;
    };

    let size = md.len() as i64;
    if let Err(e) = fs::remove_file(&victim) {
        warn!(path = %victim.display(), "failed to evict: {e}");
        return 0;
    }
    debug!(path = %victim.display(), size, "evicted");
    if remaining == 1 {
        let _ = fs::remove_dir(inner);
    }
    state.used.fetch_sub(size, Ordering::Relaxed);
    size
}

fn subdirs(path: &Path) -> Vec<PathBuf> {
    let mut out = Vec::new();
    for entry in entries_of(path) {
        match entry.file_type() {
            Ok(ft) if ft.is_dir() => out.push(entry.path()),
            _ => {}
        }
    }
    out
}

fn entries_of(path: &Path) -> Vec<fs::DirEntry> {
    match fs::read_dir(path) {
        Ok(rd) => rd.filter_map(|e| e.ok()).collect(),
        Err(e) => {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %path.display(), "failed to list directory: {e}");
            }
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;
    use tempfile::tempdir;

    /// Lay out `count` files of `size` bytes in a single shard directory,
    /// with strictly increasing atimes. One shard means every sample lands
    /// on it, so eviction order is exactly atime order.
    fn populate(dir: &Path, count: usize, size: usize) -> Vec<PathBuf> {
        let shard = dir.join("ab").join("cd");
        fs::create_dir_all(&shard).unwrap();
        let mut paths = Vec::new();
        for i in 0..count {
            let path = shard.join(format!("file-{i}"));
            fs::write(&path, vec![0u8; size]).unwrap();
            let stamp = FileTime::from_unix_time(1_000_000 + i as i64 * 1000, 0);
            filetime::set_file_times(&path, stamp, stamp).unwrap();
            paths.push(path);
        }
        paths
    }

    fn wait_until(deadline: Duration, mut check: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if check() {
                return true;
            }
            thread::sleep(Duration::from_millis(20));
        }
        check()
    }

    #[test]
    fn initial_scan_picks_up_existing_files() {
        let tmp = tempdir().unwrap();
        populate(tmp.path(), 4, 256);
        let gc = Gc::new(tmp.path(), 1 << 30, 0.9, 0.75);
        assert!(wait_until(Duration::from_secs(5), || gc.used() == 4 * 256));
        gc.shutdown(Duration::from_secs(5)).unwrap();
    }

    #[test]
    fn track_accumulates() {
        let tmp = tempdir().unwrap();
        let gc = Gc::new(tmp.path(), 1 << 30, 0.9, 0.75);
        gc.track(100);
        gc.track(50);
        gc.track(-30);
        assert_eq!(gc.used(), 120);
        gc.shutdown(Duration::from_secs(5)).unwrap();
    }

    #[test]
    fn eviction_converges_below_low_watermark() {
        let tmp = tempdir().unwrap();
        // 10 KiB limit, 16 files of 1 KiB => 16 KiB used. Low watermark is
        // 7.5 KiB, so at least 9 files must go.
        let paths = populate(tmp.path(), 16, 1024);
        let gc = Gc::new(tmp.path(), 10 * 1024, 0.9, 0.75);

        assert!(wait_until(Duration::from_secs(10), || {
            gc.used() <= (10.0 * 1024.0 * 0.75) as i64
        }));
        let survivors: Vec<_> = paths.iter().filter(|p| p.exists()).collect();
        assert!(survivors.len() <= 7);
        assert!(!paths[0].exists(), "oldest file must be evicted");
        assert!(paths.last().unwrap().exists(), "newest file survives");
        gc.shutdown(Duration::from_secs(5)).unwrap();
    }

    #[test]
    fn no_eviction_below_high_watermark() {
        let tmp = tempdir().unwrap();
        let paths = populate(tmp.path(), 4, 1024);
        let gc = Gc::new(tmp.path(), 1 << 20, 0.9, 0.75);
        assert!(wait_until(Duration::from_secs(5), || gc.used() == 4 * 1024));
        thread::sleep(Duration::from_millis(200));
        assert!(paths.iter().all(|p| p.exists()));
        gc.shutdown(Duration::from_secs(5)).unwrap();
    }

    #[test]
    fn oldest_file_in_sampled_shard_goes_first() {
        let tmp = tempdir().unwrap();
        // Single shard directory: sampling always lands on it, so eviction
        // order is exactly atime order.
        let shard = tmp.path().join("ab").join("cd");
        fs::create_dir_all(&shard).unwrap();
        for (name, at) in [("old", 1_000), ("mid", 2_000), ("new", 3_000)] {
            let p = shard.join(name);
            fs::write(&p, vec![0u8; 512]).unwrap();
            let stamp = FileTime::from_unix_time(at, 0);
            filetime::set_file_times(&p, stamp, stamp).unwrap();
        }
        // Limit tuned so exactly one eviction suffices: used = 1536 is over
        // the high watermark (1228); dropping one 512-byte file lands at
        // 1024, under the low watermark (1064).
        let gc = Gc::new(tmp.path(), 1365, 0.9, 0.78);

        assert!(wait_until(Duration::from_secs(5), || {
            !shard.join("old").exists()
        }));
        assert!(shard.join("mid").exists());
        assert!(shard.join("new").exists());
        gc.shutdown(Duration::from_secs(5)).unwrap();
    }

    #[test]
    fn empty_shard_directories_are_pruned() {
        let tmp = tempdir().unwrap();
        let inner = tmp.path().join("aa").join("bb");
        fs::create_dir_all(&inner).unwrap();
        let state = GcState {
            dir: tmp.path().to_path_buf(),
            high_watermark: 0,
            low_watermark: 0,
            used: AtomicI64::new(0),
            stop: AtomicBool::new(false),
        };
        let mut rng = rand::thread_rng();
        assert_eq!(evict_one(&state, &mut rng), 0);
        assert!(!inner.exists());
        assert_eq!(evict_one(&state, &mut rng), 0);
        assert!(!tmp.path().join("aa").exists());
    }

    #[test]
    fn shutdown_stops_the_worker_within_deadline() {
        let tmp = tempdir().unwrap();
        let gc = Gc::new(tmp.path(), 1 << 30, 0.9, 0.75);
        let started = Instant::now();
        gc.shutdown(Duration::from_secs(5)).unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
        // Idempotent.
        gc.shutdown(Duration::from_millis(10)).unwrap();
    }
}
