//! # TideSync Core
//!
//! The synchronization engine: keeps local share directories consistent
//! with the remote store.
//!
//! Architecture, leaves first:
//! - [`config`] - engine configuration and queue priorities
//! - [`error`] - the engine-level failure taxonomy
//! - [`events`] - observer interface for state/progress/conflict updates
//! - [`localfs`] - atomic writes and streaming file hashing
//! - [`conflict`] - conflict naming and policy types
//! - [`queue`] - retry backoff schedule
//! - [`smartsync`] - placeholder dehydration planning
//! - [`reconciler`] - the per-share sync pass and queue drain
//! - [`engine`] - lifecycle state machine, watchers, tick loop
//!
//! The engine owns its collaborators: watchers feed it events over
//! bounded channels, the transport is consumed through the
//! [`tidesync_transport::RemoteStore`] trait, and the state store is the
//! single source of truth that every component reads directly.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod conflict;
pub mod engine;
pub mod error;
pub mod events;
pub mod localfs;
pub mod queue;
pub mod reconciler;
pub mod smartsync;

pub use config::{EngineConfig, priority};
pub use conflict::ConflictPolicy;
pub use engine::{EncryptionContext, SyncEngine};
pub use error::{EngineError, Result};
pub use events::{EngineEvent, EngineObserver, EngineState, ObserverHandle, ObserverRegistry};
pub use reconciler::{PassSummary, Reconciler};
