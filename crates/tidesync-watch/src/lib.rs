//! # TideSync Watch
//!
//! Filesystem watcher for the TideSync engine.
//!
//! One [`ShareWatcher`](watcher::ShareWatcher) observes one sync root:
//! every non-excluded directory gets its own non-recursive watch, new
//! directories are registered as they appear, and raw notifications are
//! coalesced per path through a debounce window before they reach the
//! bounded output channel. When the channel is full events are dropped
//! with a warning; the next reconciliation scan recovers them.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod debounce;
pub mod exclude;
pub mod watcher;

pub use debounce::Debouncer;
pub use exclude::ExcludeSet;
pub use watcher::{ShareWatcher, WatcherConfig};

use chrono::{DateTime, Utc};
use thiserror::Error;

/// What happened to a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchOp {
    /// Path came into existence.
    Create,
    /// Path contents changed.
    Write,
    /// Path is gone.
    Remove,
    /// Path was renamed (either end of the rename).
    Rename,
    /// Permission/metadata-only change; suppressed by the debouncer.
    Chmod,
}

/// A coalesced filesystem event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    /// Absolute path of the affected file or directory.
    pub path: std::path::PathBuf,
    /// Coalesced operation.
    pub op: WatchOp,
    /// Whether the path is (or was) a directory.
    pub is_directory: bool,
    /// Instant the underlying notification arrived.
    pub timestamp: DateTime<Utc>,
}

/// Errors produced by the watcher.
#[derive(Debug, Error)]
pub enum WatchError {
    /// Underlying platform watcher failure.
    #[error("watch backend error: {0}")]
    Backend(#[from] notify::Error),

    /// Exclude pattern failed to compile.
    #[error("invalid exclude pattern {pattern}: {message}")]
    Pattern {
        /// The offending pattern.
        pattern: String,
        /// Compiler message.
        message: String,
    },

    /// The watch root does not exist or is not a directory.
    #[error("watch root {0} is not a directory")]
    BadRoot(String),

    /// Filesystem error during enumeration.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for watcher operations.
pub type Result<T> = std::result::Result<T, WatchError>;
