//! # TideSync Store
//!
//! Durable local state for the TideSync engine, backed by SQLite.
//!
//! The store is the single source of truth for everything the engine
//! remembers between runs: per-path file records, per-share change-feed
//! cursors, the priority operation queue, the conflict log, and the
//! user-visible activity history. Every mutation is transactional and
//! crash-safe (WAL journal); no caller holds a transaction across a
//! suspension point because the API is entirely synchronous.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod store;
pub mod types;

pub use store::StateStore;
pub use types::{
    ActivityEntry, ConflictEntry, ConflictResolution, FileKind, FileRecord, QueueEntry, QueueOp,
    ShareRecord, ShareStats, SyncStatus,
};

use thiserror::Error;

/// Errors produced by the state store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying SQLite failure.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A stored enum column held an unknown value.
    #[error("corrupt row: {0}")]
    CorruptRow(String),

    /// JSON (de)serialization of an embedded column failed.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// Filesystem error opening the database.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
