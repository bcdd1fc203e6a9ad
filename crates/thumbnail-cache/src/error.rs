//! Error types shared across the cache engine.
//!
//! The engine broadcasts a failed task's error to every concurrent waiter,
//! so `Error` is `Clone`; raw `std::io::Error` values are reduced to their
//! `ErrorKind` plus a context string at the point of capture.

use std::io;
use std::path::Path;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Error {
    /// The source path does not resolve to an existing regular file.
    #[error("source file not found: {0}")]
    SourceNotFound(String),

    /// The source file exists but cannot be read.
    #[error("source file not readable: {0}")]
    SourceUnreadable(String),

    /// A size, mode, or format string failed to parse.
    #[error("invalid thumbnail descriptor: {0}")]
    InvalidDescriptor(String),

    /// The scheduler buffer is saturated; backpressure is visible to callers.
    #[error("task queue is full")]
    QueueFull,

    /// Shutdown began before or during this request.
    #[error("engine is closed")]
    EngineClosed,

    /// The external image-processing binary failed; carries its stderr.
    #[error("thumbnail generation failed: {0}")]
    GenerationFailed(String),

    /// A worker task panicked; the panic payload is preserved as text.
    #[error("internal error: {0}")]
    Internal(String),

    /// Configuration rejected at construction time.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Shutdown did not complete within its deadline.
    #[error("shutdown deadline exceeded")]
    ShutdownTimeout,

    /// Filesystem failure outside the kinds above (factory probe, rename, stat).
    #[error("{context}: {kind}")]
    Io {
        context: String,
        kind: io::ErrorKind,
    },
}

impl Error {
    pub(crate) fn io(context: impl Into<String>, err: &io::Error) -> Self {
        Error::Io {
            context: context.into(),
            kind: err.kind(),
        }
    }

    /// Classify a stat failure on a source file per its io kind.
    pub(crate) fn from_source_stat(path: &Path, err: &io::Error) -> Self {
        let shown = path.display().to_string();
        match err.kind() {
            io::ErrorKind::NotFound => Error::SourceNotFound(shown),
            io::ErrorKind::PermissionDenied => Error::SourceUnreadable(shown),
            _ => Error::io(format!("stat {shown}"), err),
        }
    }
}
