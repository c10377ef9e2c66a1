//! Engine lifecycle: state machine, watchers, event processing, ticking.

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::events::{EngineEvent, EngineObserver, EngineState, ObserverHandle, ObserverRegistry};
use crate::localfs::{atomic_write, hash_file};
use crate::queue::priority_for;
use crate::reconciler::{PassSummary, Reconciler};
use crate::smartsync::{self, SmartSyncState};
use chrono::{Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tidesync_crypto::cipher::CipherAlgorithm;
use tidesync_crypto::keys::KeyStore;
use tidesync_crypto::{SecretKey, container};
use tidesync_store::{FileKind, FileRecord, QueueOp, ShareRecord, StateStore, SyncStatus};
use tidesync_transport::RemoteStore;
use tidesync_watch::{ExcludeSet, ShareWatcher, WatchEvent, WatchOp, WatcherConfig};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

/// Share-key material for at-rest encryption of file bodies.
///
/// The master key lives here for the engine's lifetime and is zeroized
/// when the context drops.
pub struct EncryptionContext {
    keystore: KeyStore,
    master: SecretKey,
}

impl EncryptionContext {
    /// Wrap an unlocked key store.
    #[must_use]
    pub fn new(keystore: KeyStore, master: SecretKey) -> Self {
        Self { keystore, master }
    }

    /// Open the key directory and unlock the master key.
    pub fn unlock(keys_dir: &Path, password: &[u8]) -> Result<Self> {
        let keystore = KeyStore::open(keys_dir).map_err(EngineError::from)?;
        let master = keystore.unlock_master(password).map_err(EngineError::from)?;
        Ok(Self { keystore, master })
    }

    /// Encrypt a file body under the share key.
    pub(crate) fn encrypt(&self, share_id: &str, plaintext: &[u8]) -> Result<Vec<u8>> {
        let key = self.keystore.share_key(&self.master, share_id)?;
        let key_id = self.keystore.share_key_id(share_id)?;
        Ok(container::encrypt_bytes(
            plaintext,
            &key,
            &key_id,
            CipherAlgorithm::XChaCha20Poly1305,
        )?)
    }

    /// Decrypt a downloaded file body under the share key.
    pub(crate) fn decrypt(&self, share_id: &str, body: &[u8]) -> Result<Vec<u8>> {
        let key = self.keystore.share_key(&self.master, share_id)?;
        Ok(container::decrypt_bytes(body, &key)?)
    }
}

struct WatcherSlot {
    watcher: ShareWatcher,
}

/// The synchronization engine.
///
/// Owns the watchers, the reconciler, and the lifecycle state machine.
/// Used through an `Arc`: background tasks hold clones.
pub struct SyncEngine {
    config: Arc<EngineConfig>,
    store: Arc<StateStore>,
    reconciler: Arc<Reconciler>,
    events: ObserverRegistry,
    state: RwLock<EngineState>,
    last_error: RwLock<Option<String>>,
    running: Arc<AtomicBool>,
    paused: Arc<AtomicBool>,
    trigger: Arc<Notify>,
    intent_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    watchers: Mutex<Vec<WatcherSlot>>,
    smartsync: Mutex<SmartSyncState>,
}

impl SyncEngine {
    /// Build an engine over its collaborators. Validates nothing yet;
    /// `start` performs the configuration and connectivity checks.
    #[must_use]
    pub fn new(
        config: EngineConfig,
        store: Arc<StateStore>,
        remote: Arc<dyn RemoteStore>,
        crypto: Option<EncryptionContext>,
    ) -> Arc<Self> {
        let config = Arc::new(config);
        let events = ObserverRegistry::new();
        let reconciler = Arc::new(Reconciler::new(
            Arc::clone(&config),
            Arc::clone(&store),
            remote,
            events.clone(),
            crypto.map(Arc::new),
        ));

        Arc::new(Self {
            config,
            store,
            reconciler,
            events,
            state: RwLock::new(EngineState::Stopped),
            last_error: RwLock::new(None),
            running: Arc::new(AtomicBool::new(false)),
            paused: Arc::new(AtomicBool::new(false)),
            trigger: Arc::new(Notify::new()),
            intent_locks: DashMap::new(),
            watchers: Mutex::new(Vec::new()),
            smartsync: Mutex::new(SmartSyncState::default()),
        })
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> EngineState {
        *self.state.read()
    }

    /// Message of the last engine-level failure, if any.
    #[must_use]
    pub fn last_error(&self) -> Option<String> {
        self.last_error.read().clone()
    }

    /// Register an observer; dropping the handle deregisters it.
    pub fn subscribe(&self, observer: Arc<dyn EngineObserver>) -> ObserverHandle {
        self.events.subscribe(observer)
    }

    /// Direct access to the state store (read-mostly: status displays).
    #[must_use]
    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    fn set_state(&self, state: EngineState) {
        *self.state.write() = state;
        self.events.publish(&EngineEvent::StateChanged { state });
    }

    /// Start the engine: configuration check, connectivity check, share
    /// enumeration, watchers, tick loop.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if self.running.load(Ordering::SeqCst) {
            return Err(EngineError::InvalidState("engine already running".into()));
        }
        self.set_state(EngineState::Starting);

        match self.startup(self).await {
            Ok(share_count) => {
                self.running.store(true, Ordering::SeqCst);
                self.paused.store(false, Ordering::SeqCst);
                self.set_state(EngineState::Idle);
                self.spawn_tick_loop();
                info!(shares = share_count, "engine started");
                Ok(())
            }
            Err(e) => {
                *self.last_error.write() = Some(e.to_string());
                self.set_state(EngineState::Error);
                error!("engine start failed: {e}");
                Err(e)
            }
        }
    }

    async fn startup(&self, this: &Arc<Self>) -> Result<usize> {
        self.config.validate()?;
        std::fs::create_dir_all(&self.config.data_dir)?;

        // Connectivity check doubles as share discovery.
        let shares = self
            .reconciler
            .remote
            .list_shares()
            .await
            .map_err(EngineError::from)?;

        *self.smartsync.lock() =
            SmartSyncState::load(&self.config.smartsync_state_path())?;

        for share in &shares {
            let record = ShareRecord {
                id: share.id.clone(),
                name: share.name.clone(),
                excludes: share.excludes.clone(),
                size_limit: share.size_limit,
            };
            self.store.upsert_share(&record)?;

            let root = self.config.share_root(&share.id);
            std::fs::create_dir_all(&root)?;
            this.start_watcher(&record)?;
        }
        Ok(shares.len())
    }

    fn start_watcher(self: &Arc<Self>, share: &ShareRecord) -> Result<()> {
        let mut patterns = self.config.excludes.clone();
        patterns.extend(share.excludes.iter().cloned());
        let excludes = ExcludeSet::new(&patterns)?;

        let root = self.config.share_root(&share.id);
        let (watcher, mut rx) = ShareWatcher::spawn(
            &root,
            excludes,
            WatcherConfig {
                debounce: self.config.debounce(),
                ..WatcherConfig::default()
            },
        )?;
        self.watchers.lock().push(WatcherSlot { watcher });

        // One event processor per share keeps per-path causality: events
        // for a path are handled in arrival order.
        let this = Arc::clone(self);
        let share = share.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if let Err(e) = this.process_watch_event(&share, &event) {
                    warn!(
                        share_id = %share.id,
                        path = %event.path.display(),
                        "watch event processing failed: {e}"
                    );
                }
            }
            debug!(share_id = %share.id, "event processor stopped");
        });
        Ok(())
    }

    /// Translate one debounced filesystem event into store updates and
    /// queue entries.
    fn process_watch_event(&self, share: &ShareRecord, event: &WatchEvent) -> Result<()> {
        let root = self.config.share_root(&share.id);
        let relative = event
            .path
            .strip_prefix(&root)
            .map_err(|_| EngineError::LocalIo(format!("event outside root: {}", event.path.display())))?;
        let rel_path = format!("/{}", relative.to_string_lossy().replace('\\', "/"));
        let priority = priority_for(event.op);

        match event.op {
            WatchOp::Remove => {
                if self.store.get_file(&share.id, &rel_path)?.is_some() {
                    self.store
                        .enqueue(&share.id, &rel_path, QueueOp::DeleteRemote, priority)?;
                }
            }
            WatchOp::Create | WatchOp::Write | WatchOp::Rename => {
                if !event.path.exists() {
                    // A rename source or short-lived file: treat as gone.
                    if self.store.get_file(&share.id, &rel_path)?.is_some() {
                        self.store.enqueue(
                            &share.id,
                            &rel_path,
                            QueueOp::DeleteRemote,
                            priority_for(WatchOp::Remove),
                        )?;
                    }
                    return Ok(());
                }

                if event.path.is_dir() {
                    let mut record = FileRecord::directory(&share.id, &rel_path, event.timestamp);
                    record.sync_status = SyncStatus::PendingUpload;
                    self.store.upsert_file(&record)?;
                    self.store
                        .enqueue(&share.id, &rel_path, QueueOp::MkdirRemote, priority)?;
                    return Ok(());
                }

                // Dehydrated placeholders are not user content; uploading
                // one would clobber the authoritative remote bytes.
                if self.config.smartsync.enabled && smartsync::is_placeholder(&event.path) {
                    return Ok(());
                }

                let size = std::fs::metadata(&event.path)?.len();
                if let Some(limit) = share.size_limit {
                    if size > limit {
                        self.store.log_activity(
                            &share.id,
                            &rel_path,
                            "watch",
                            "skipped",
                            0,
                            Some("share size limit exceeded"),
                        )?;
                        return Ok(());
                    }
                }

                let local_hash = hash_file(&event.path)?;
                let stored = self.store.get_file(&share.id, &rel_path)?;
                if let Some(record) = &stored {
                    if record.local_hash == local_hash
                        && record.sync_status == SyncStatus::Synced
                    {
                        // Touch without content change (e.g. mtime-only).
                        return Ok(());
                    }
                }

                self.store.upsert_file(&FileRecord {
                    share_id: share.id.clone(),
                    path: rel_path.clone(),
                    kind: FileKind::File,
                    size,
                    mod_time: event.timestamp,
                    local_hash,
                    remote_hash: stored.map(|r| r.remote_hash).unwrap_or_default(),
                    last_sync_at: None,
                    version: 0,
                    sync_status: SyncStatus::PendingUpload,
                    error_message: None,
                })?;
                self.store
                    .enqueue(&share.id, &rel_path, QueueOp::Upload, priority)?;
            }
            WatchOp::Chmod => {}
        }
        Ok(())
    }

    fn spawn_tick_loop(self: &Arc<Self>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = tokio::time::sleep(this.config.poll_interval()) => {}
                    () = this.trigger.notified() => {}
                }
                if !this.running.load(Ordering::SeqCst) {
                    break;
                }
                if this.paused.load(Ordering::SeqCst) {
                    continue;
                }
                if let Err(e) = this.run_pass().await {
                    *this.last_error.write() = Some(e.to_string());
                    warn!("sync pass failed: {e}");
                }
            }
            debug!("tick loop stopped");
        });
    }

    /// Run one pass over every share. Distinct shares run concurrently;
    /// passes for the same share are serialized by an intent lock.
    pub async fn run_pass(self: &Arc<Self>) -> Result<PassSummary> {
        if self.paused.load(Ordering::SeqCst) {
            return Err(EngineError::InvalidState("engine is paused".into()));
        }
        self.set_state(EngineState::Syncing);

        let shares = self.store.list_shares()?;
        let mut handles = Vec::with_capacity(shares.len());
        for share in shares {
            let this = Arc::clone(self);
            handles.push(tokio::spawn(async move {
                let lock = this.intent_lock(&share.id);
                let _guard = lock.lock().await;
                this.reconciler.sync_share(&share).await
            }));
        }

        let mut total = PassSummary::default();
        let mut first_error = None;
        for handle in handles {
            match handle.await {
                Ok(Ok(summary)) => {
                    total.applied += summary.applied;
                    total.failed += summary.failed;
                    total.drained += summary.drained;
                }
                Ok(Err(e)) => {
                    warn!("share pass failed: {e}");
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
                Err(e) => {
                    if first_error.is_none() {
                        first_error = Some(EngineError::InvalidState(format!(
                            "pass task panicked: {e}"
                        )));
                    }
                }
            }
        }

        self.prune_activity();
        let next = if self.paused.load(Ordering::SeqCst) {
            EngineState::Paused
        } else {
            EngineState::Idle
        };
        self.set_state(next);

        match first_error {
            Some(e) => Err(e),
            None => Ok(total),
        }
    }

    fn prune_activity(&self) {
        let horizon = Utc::now() - ChronoDuration::days(self.config.activity_retention_days);
        if let Err(e) = self.store.prune_activity(horizon) {
            debug!("activity prune failed: {e}");
        }
    }

    fn intent_lock(&self, share_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.intent_locks
            .entry(share_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Request an immediate pass.
    pub fn trigger_sync(&self) {
        self.trigger.notify_one();
    }

    /// Suspend passes and drains. In-flight work finishes its current
    /// atomic step; watcher events keep accumulating.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
        self.set_state(EngineState::Paused);
        info!("engine paused");
    }

    /// Resume from a pause.
    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        self.set_state(EngineState::Idle);
        self.trigger.notify_one();
        info!("engine resumed");
    }

    /// Stop the engine. Watchers halt, queued work stays durable.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.trigger.notify_one();
        for slot in self.watchers.lock().drain(..) {
            slot.watcher.stop();
        }
        if let Err(e) = self.smartsync.lock().save(&self.config.smartsync_state_path()) {
            debug!("smartsync state save failed: {e}");
        }
        self.set_state(EngineState::Stopped);
        info!("engine stopped");
    }

    // ------------------------------------------------------------------
    // Smartsync
    // ------------------------------------------------------------------

    /// Plan and apply dehydration for one share: replace selected local
    /// copies with placeholder markers and flip their records to
    /// `pending_download` so the next hydration is a plain download.
    pub fn dehydrate_share(&self, share_id: &str, needed_bytes: u64) -> Result<Vec<String>> {
        if !self.config.smartsync.enabled {
            return Ok(Vec::new());
        }
        let max_age = ChronoDuration::days(self.config.smartsync.max_age_days);

        let mut smartsync = self.smartsync.lock();
        let selected = smartsync::plan_dehydration(smartsync.hydrated(share_id), needed_bytes, max_age);

        for path in &selected {
            let abs = self.reconciler.abs_path(share_id, path);
            atomic_write(&abs, smartsync::PLACEHOLDER_MARKER)?;
            if let Some(mut record) = self.store.get_file(share_id, path)? {
                record.sync_status = SyncStatus::PendingDownload;
                record.local_hash = String::new();
                self.store.upsert_file(&record)?;
            }
            smartsync.forget(share_id, path);
            self.store
                .log_activity(share_id, path, "dehydrate", "ok", 0, None)?;
        }
        smartsync.save(&self.config.smartsync_state_path())?;
        Ok(selected)
    }

    /// Queue a hydration download for a placeholder path.
    pub fn hydrate_path(&self, share_id: &str, path: &str) -> Result<()> {
        self.store
            .enqueue(share_id, path, QueueOp::Download, crate::config::priority::CREATE)?;
        self.trigger_sync();
        Ok(())
    }

    /// Record a hydrated file access for dehydration accounting.
    pub fn note_access(&self, share_id: &str, path: &str, size: u64) {
        self.smartsync.lock().touch(share_id, path, size);
    }
}
