//! Observer interface for engine notifications.
//!
//! Callers register an observer and get back an opaque handle; dropping
//! the handle deregisters. The engine publishes outside any store
//! transaction, so observers may block briefly without holding up
//! durability, though they should still return quickly.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Engine lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    /// Not running.
    Stopped,
    /// Start-up checks in progress.
    Starting,
    /// Running, between passes.
    Idle,
    /// A sync pass is in flight.
    Syncing,
    /// Running, but passes and drains are suspended.
    Paused,
    /// Start-up failed; `start` may recover.
    Error,
}

impl EngineState {
    /// Lowercase wire/name form.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Idle => "idle",
            Self::Syncing => "syncing",
            Self::Paused => "paused",
            Self::Error => "error",
        }
    }
}

/// Notifications published by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// The lifecycle state changed.
    StateChanged {
        /// New state.
        state: EngineState,
    },
    /// One path finished reconciling.
    ItemSynced {
        /// Share the item belongs to.
        share_id: String,
        /// Share-relative path.
        path: String,
        /// What happened (`upload`, `download`, `delete`, ...).
        action: String,
        /// Bytes moved.
        bytes: u64,
    },
    /// A divergence was recorded.
    ConflictDetected {
        /// Share the conflict belongs to.
        share_id: String,
        /// Share-relative path.
        path: String,
    },
    /// Transfer progress for a large item.
    Progress {
        /// Share the item belongs to.
        share_id: String,
        /// Share-relative path.
        path: String,
        /// Bytes done.
        transferred: u64,
        /// Bytes total.
        total: u64,
    },
    /// A path failed terminally.
    ItemError {
        /// Share the item belongs to.
        share_id: String,
        /// Share-relative path.
        path: String,
        /// Failure description.
        message: String,
    },
    /// One share's pass finished.
    PassCompleted {
        /// Share the pass covered.
        share_id: String,
        /// Changes applied.
        applied: u64,
        /// Item failures recorded.
        failed: u64,
    },
}

/// Receives engine events.
pub trait EngineObserver: Send + Sync {
    /// Called for every published event.
    fn on_event(&self, event: &EngineEvent);
}

impl<F: Fn(&EngineEvent) + Send + Sync> EngineObserver for F {
    fn on_event(&self, event: &EngineEvent) {
        self(event)
    }
}

type ObserverMap = HashMap<u64, Arc<dyn EngineObserver>>;

/// Registry of live observers. Cheap to clone; clones share the set.
#[derive(Clone, Default)]
pub struct ObserverRegistry {
    observers: Arc<RwLock<ObserverMap>>,
    next_id: Arc<AtomicU64>,
}

impl ObserverRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an observer; the returned handle deregisters on drop.
    pub fn subscribe(&self, observer: Arc<dyn EngineObserver>) -> ObserverHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.observers.write().insert(id, observer);
        ObserverHandle { id, observers: Arc::downgrade(&self.observers) }
    }

    /// Publish an event to every live observer.
    pub fn publish(&self, event: &EngineEvent) {
        let observers: Vec<Arc<dyn EngineObserver>> =
            self.observers.read().values().cloned().collect();
        for observer in observers {
            observer.on_event(event);
        }
    }

    /// Number of registered observers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.observers.read().len()
    }

    /// Whether no observers are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.observers.read().is_empty()
    }
}

/// Opaque deregistration handle; dropping it removes the observer.
pub struct ObserverHandle {
    id: u64,
    observers: std::sync::Weak<RwLock<ObserverMap>>,
}

impl Drop for ObserverHandle {
    fn drop(&mut self) {
        if let Some(observers) = self.observers.upgrade() {
            observers.write().remove(&self.id);
        }
    }
}
