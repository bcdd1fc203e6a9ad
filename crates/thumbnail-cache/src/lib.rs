//! On-demand thumbnail cache engine with content-addressed disk storage.
//!
//! This crate is the core of a long-running thumbnail service: a request
//! names a source image plus a transform (dimensions, resize mode, output
//! format), and the engine guarantees a matching thumbnail exists on disk,
//! returning its path. Thumbnails are produced by an external converter
//! (ImageMagick `convert` by default) and stored in a two-level sharded
//! directory tree keyed by a fingerprint of the source file.
//!
//! # Features
//!
//! - **Content addressing**: cache keys derive from (path, size, mtime), so
//!   editing a source automatically invalidates its thumbnails
//! - **Request deduplication**: concurrent identical requests share a single
//!   generation task and observe the same outcome
//! - **Bounded concurrency**: a fixed worker pool draining a LIFO buffer,
//!   with backpressure surfaced as [`Error::QueueFull`]
//! - **Disk budget**: a background collector bounds total usage under a
//!   high/low watermark policy with approximated-LRU eviction
//! - **Atomic writes**: readers never observe partially written thumbnails
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//! use thumbnail_cache::{CacheConfig, Dimensions, Engine, Format, Mode};
//!
//! # fn main() -> thumbnail_cache::Result<()> {
//! let engine = Engine::with_config(Path::new("/var/cache/thumbs"), CacheConfig::default())?;
//! let ti = engine
//!     .factory()
//!     .from_file(Path::new("/photos/cat.jpg"), Dimensions::square(256), Mode::Crop, Format::Jpeg)?;
//! let path = engine.get(&ti)?;
//! println!("thumbnail at {}", path.display());
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod descriptor;
pub mod engine;
pub mod error;
pub mod fingerprint;
mod gc;
mod generate;
pub mod scheduler;

pub use cache::{Factory, ThumbInfo, LAZY_TOUCH_WINDOW};
pub use descriptor::{Dimensions, Format, Mode};
pub use engine::{Engine, TaskResult};
pub use error::{Error, Result};
pub use fingerprint::{Fingerprint, Hash};
pub use scheduler::PanicHandler;

use serde::{Deserialize, Serialize};

/// Tunables for an [`Engine`].
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Total disk budget for the cache tree, in bytes.
    pub limit_bytes: i64,
    /// Eviction starts above `limit_bytes * high_ratio`.
    pub high_ratio: f64,
    /// Eviction stops at `limit_bytes * low_ratio`.
    pub low_ratio: f64,
    /// Worker threads running the external converter.
    pub workers: usize,
    /// Queued-task capacity; submissions beyond it fail fast.
    pub buffer: usize,
    /// External converter program name or path.
    pub convert_program: String,
    #[serde(skip)]
    panic_handler: Option<PanicHandler>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            limit_bytes: 1 << 30, // 1 GiB
            high_ratio: 0.90,
            low_ratio: 0.75,
            workers: 4,
            buffer: 128,
            convert_program: "convert".to_string(),
            panic_handler: None,
        }
    }
}

impl CacheConfig {
    /// Install a callback receiving worker panic messages instead of having
    /// them logged.
    pub fn with_panic_handler(mut self, handler: PanicHandler) -> Self {
        self.panic_handler = Some(handler);
        self
    }

    pub(crate) fn panic_handler(&self) -> Option<PanicHandler> {
        self.panic_handler.clone()
    }

    pub fn validate(&self) -> Result<()> {
        if self.limit_bytes <= 0 {
            return Err(Error::Config("limit_bytes must be positive".into()));
        }
        if !(self.low_ratio > 0.0 && self.high_ratio <= 1.0 && self.low_ratio < self.high_ratio) {
            return Err(Error::Config(
                "ratios must satisfy 0 < low_ratio < high_ratio <= 1".into(),
            ));
        }
        if self.workers == 0 {
            return Err(Error::Config("workers must be positive".into()));
        }
        if self.buffer == 0 {
            return Err(Error::Config("buffer must be positive".into()));
        }
        Ok(())
    }
}

impl std::fmt::Debug for CacheConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheConfig")
            .field("limit_bytes", &self.limit_bytes)
            .field("high_ratio", &self.high_ratio)
            .field("low_ratio", &self.low_ratio)
            .field("workers", &self.workers)
            .field("buffer", &self.buffer)
            .field("convert_program", &self.convert_program)
            .field("panic_handler", &self.panic_handler.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        CacheConfig::default().validate().unwrap();
    }

    #[test]
    fn bad_ratios_are_rejected() {
        let mut config = CacheConfig::default();
        config.low_ratio = 0.95;
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        config.low_ratio = 0.0;
        assert!(config.validate().is_err());

        config.low_ratio = 0.5;
        config.high_ratio = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_sizes_are_rejected() {
        let mut config = CacheConfig::default();
        config.workers = 0;
        assert!(config.validate().is_err());

        let mut config = CacheConfig::default();
        config.buffer = 0;
        assert!(config.validate().is_err());

        let mut config = CacheConfig::default();
        config.limit_bytes = 0;
        assert!(config.validate().is_err());
    }
}
