//! The per-share sync pass and queue drain.
//!
//! A pass pulls remote changes from the stored cursor, applies them to
//! the filesystem and state store, commits the cursor only after every
//! change in the batch applied, then drains the operation queue. Item
//! failures of the protocol/integrity classes are recorded and skipped;
//! transport failures abort the pass before the cursor commit so the
//! same changes replay on the next tick.

use crate::config::{EngineConfig, priority};
use crate::conflict::{ConflictPolicy, conflict_sibling};
use crate::engine::EncryptionContext;
use crate::error::{EngineError, Result};
use crate::events::{EngineEvent, ObserverRegistry};
use crate::localfs::{atomic_write, hash_bytes, hash_file, remove_path_idempotent};
use crate::queue::backoff_delay;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tidesync_delta::manifest::BlockManifest;
use tidesync_delta::plan::{BlockSource, DeltaPlan, DownloadPlan};
use tidesync_delta::{DeltaError, FULL_DOWNLOAD_THRESHOLD};
use tidesync_store::{
    ConflictEntry, ConflictResolution, FileKind, FileRecord, QueueEntry, QueueOp, ShareRecord,
    StateStore, SyncStatus,
};
use tidesync_transport::types::{ChangeAction, EntryKind, FileChange, SyncStateDoc};
use tidesync_transport::{RemoteStore, TransportError};
use tidesync_watch::ExcludeSet;
use tracing::{debug, info, warn};

/// Upper bound of one change-feed page.
const CHANGE_BATCH: usize = 100;

/// Minimum fraction of bytes a delta upload must save to be worth it.
const DELTA_UPLOAD_MIN_SAVINGS: f64 = 0.2;

/// Counters of one share's pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassSummary {
    /// Remote changes applied.
    pub applied: u64,
    /// Item-level failures recorded.
    pub failed: u64,
    /// Queue entries drained.
    pub drained: u64,
}

/// Executes sync passes. Shared between the engine's tick loop and its
/// drain workers via `Arc`.
pub struct Reconciler {
    pub(crate) config: Arc<EngineConfig>,
    pub(crate) store: Arc<StateStore>,
    pub(crate) remote: Arc<dyn RemoteStore>,
    pub(crate) events: ObserverRegistry,
    pub(crate) crypto: Option<Arc<EncryptionContext>>,
    exclude_cache: DashMap<String, Arc<ExcludeSet>>,
}

impl Reconciler {
    /// Build a reconciler over the engine's shared collaborators.
    pub fn new(
        config: Arc<EngineConfig>,
        store: Arc<StateStore>,
        remote: Arc<dyn RemoteStore>,
        events: ObserverRegistry,
        crypto: Option<Arc<EncryptionContext>>,
    ) -> Self {
        Self {
            config,
            store,
            remote,
            events,
            crypto,
            exclude_cache: DashMap::new(),
        }
    }

    /// Absolute path of a share-relative path.
    pub(crate) fn abs_path(&self, share_id: &str, path: &str) -> PathBuf {
        self.config
            .share_root(share_id)
            .join(path.trim_start_matches('/'))
    }

    pub(crate) fn excludes_for(&self, share: &ShareRecord) -> Result<Arc<ExcludeSet>> {
        if let Some(cached) = self.exclude_cache.get(&share.id) {
            return Ok(Arc::clone(&cached));
        }
        let mut patterns = self.config.excludes.clone();
        patterns.extend(share.excludes.iter().cloned());
        let set = Arc::new(ExcludeSet::new(&patterns)?);
        self.exclude_cache.insert(share.id.clone(), Arc::clone(&set));
        Ok(set)
    }

    fn is_excluded(&self, share: &ShareRecord, path: &str) -> Result<bool> {
        let excludes = self.excludes_for(share)?;
        Ok(excludes.is_excluded(std::path::Path::new(path.trim_start_matches('/'))))
    }

    // ------------------------------------------------------------------
    // The pass
    // ------------------------------------------------------------------

    /// Run one full pass for a share: pull and apply remote changes,
    /// commit the cursor, drain the queue, mirror the sync state.
    pub async fn sync_share(self: &Arc<Self>, share: &ShareRecord) -> Result<PassSummary> {
        let mut summary = PassSummary::default();
        let mut cursor = self.store.get_cursor(&share.id)?;

        loop {
            let response = self
                .remote
                .get_changes(&share.id, cursor.as_deref(), CHANGE_BATCH)
                .await
                .map_err(EngineError::from)?;
            let has_more = response.has_more;
            let next_cursor = response.cursor.clone();

            for change in &response.changes {
                match self.apply_change(share, change).await {
                    Ok(applied) => {
                        if applied {
                            summary.applied += 1;
                        }
                    }
                    Err(e) if e.is_item_fatal() => {
                        summary.failed += 1;
                        self.record_item_failure(&share.id, &change.path, &e)?;
                    }
                    Err(e) => return Err(e),
                }
            }

            // Cursor commit only after the whole batch applied; an abort
            // above leaves it untouched so the changes replay.
            self.store.set_cursor(&share.id, &next_cursor)?;
            cursor = Some(next_cursor);
            if !has_more {
                break;
            }
        }

        summary.drained = self.drain_queue().await?;

        // Best-effort mirror; the server copy is informational.
        let state = SyncStateDoc {
            cursor: cursor.unwrap_or_default(),
            status: "idle".to_string(),
        };
        if let Err(e) = self.remote.put_sync_state(&share.id, &state).await {
            debug!(share_id = %share.id, "sync state mirror failed: {e}");
        }

        self.events.publish(&EngineEvent::PassCompleted {
            share_id: share.id.clone(),
            applied: summary.applied,
            failed: summary.failed,
        });
        info!(
            share_id = %share.id,
            applied = summary.applied,
            failed = summary.failed,
            drained = summary.drained,
            "pass completed"
        );
        Ok(summary)
    }

    fn record_item_failure(&self, share_id: &str, path: &str, error: &EngineError) -> Result<()> {
        if matches!(error, EngineError::PolicyReject(_)) {
            self.store
                .log_activity(share_id, path, "apply", "skipped", 0, Some(&error.to_string()))?;
            return Ok(());
        }
        warn!(share_id, path, "item failed: {error}");
        self.store.set_file_error(share_id, path, &error.to_string())?;
        self.store
            .log_activity(share_id, path, "apply", "error", 0, Some(&error.to_string()))?;
        self.events.publish(&EngineEvent::ItemError {
            share_id: share_id.to_string(),
            path: path.to_string(),
            message: error.to_string(),
        });
        Ok(())
    }

    async fn apply_change(&self, share: &ShareRecord, change: &FileChange) -> Result<bool> {
        if self.is_excluded(share, &change.path)? {
            self.store.log_activity(
                &share.id,
                &change.path,
                "apply",
                "skipped",
                0,
                Some("excluded path"),
            )?;
            return Ok(false);
        }

        match (change.action, change.kind) {
            (ChangeAction::Deleted, _) => self.apply_delete(share, change).map(|()| true),
            (ChangeAction::Moved, _) => self.apply_move(share, change).await.map(|()| true),
            (_, EntryKind::Directory) => self.apply_directory(share, change).map(|()| true),
            (_, EntryKind::File) => self.apply_file(share, change).await.map(|()| true),
        }
    }

    fn apply_delete(&self, share: &ShareRecord, change: &FileChange) -> Result<()> {
        let abs = self.abs_path(&share.id, &change.path);
        remove_path_idempotent(&abs)?;
        self.store.delete_file(&share.id, &change.path)?;
        self.store
            .log_activity(&share.id, &change.path, "delete", "ok", 0, None)?;
        self.events.publish(&EngineEvent::ItemSynced {
            share_id: share.id.clone(),
            path: change.path.clone(),
            action: "delete".to_string(),
            bytes: 0,
        });
        Ok(())
    }

    fn apply_directory(&self, share: &ShareRecord, change: &FileChange) -> Result<()> {
        let abs = self.abs_path(&share.id, &change.path);
        std::fs::create_dir_all(&abs)?;

        let mut record = FileRecord::directory(&share.id, &change.path, change.mod_time);
        record.version = change.version;
        record.sync_status = SyncStatus::Synced;
        record.last_sync_at = Some(Utc::now());
        self.store.upsert_file(&record)?;
        Ok(())
    }

    async fn apply_file(&self, share: &ShareRecord, change: &FileChange) -> Result<()> {
        let abs = self.abs_path(&share.id, &change.path);
        let stored = self.store.get_file(&share.id, &change.path)?;
        let placeholder =
            self.config.smartsync.enabled && crate::smartsync::is_placeholder(&abs);

        if abs.is_file() && !placeholder {
            let current = hash_file(&abs)?;

            if current == change.content_strong_hash {
                // Bytes already match: metadata-only update, no transfer.
                self.finish_file(share, change, &current, 0)?;
                return Ok(());
            }

            let last_known = stored.as_ref().map(|r| r.local_hash.as_str());
            if last_known != Some(current.as_str()) {
                // The local file changed since the last sync and the
                // remote moved too: divergence.
                return self.handle_conflict(share, change, &current).await;
            }
        } else if !abs.is_file() {
            if let Some(record) = &stored {
                if record.sync_status == SyncStatus::Synced && !record.local_hash.is_empty() {
                    // The file was synced here and has since been deleted
                    // locally while the remote modified it: divergence.
                    return self.handle_conflict(share, change, "").await;
                }
            }
        }

        let transferred = self.download_to_path(share, change, &abs).await?;
        self.finish_file(share, change, &change.content_strong_hash, transferred)?;
        Ok(())
    }

    /// Update the record and logs after a file landed locally.
    fn finish_file(
        &self,
        share: &ShareRecord,
        change: &FileChange,
        local_hash: &str,
        transferred: u64,
    ) -> Result<()> {
        self.store.upsert_file(&FileRecord {
            share_id: share.id.clone(),
            path: change.path.clone(),
            kind: FileKind::File,
            size: change.size,
            mod_time: change.mod_time,
            local_hash: local_hash.to_string(),
            remote_hash: change.content_strong_hash.clone(),
            last_sync_at: Some(Utc::now()),
            version: change.version,
            sync_status: SyncStatus::Synced,
            error_message: None,
        })?;
        self.store.log_activity(
            &share.id,
            &change.path,
            "download",
            "ok",
            transferred,
            None,
        )?;
        self.events.publish(&EngineEvent::ItemSynced {
            share_id: share.id.clone(),
            path: change.path.clone(),
            action: "download".to_string(),
            bytes: transferred,
        });
        Ok(())
    }

    async fn apply_move(&self, share: &ShareRecord, change: &FileChange) -> Result<()> {
        let Some(previous) = change.previous_path.as_deref() else {
            // A move without a source degrades to a plain apply.
            return self.apply_file(share, change).await;
        };

        let old_abs = self.abs_path(&share.id, previous);
        let new_abs = self.abs_path(&share.id, &change.path);

        if new_abs.is_file() {
            let current = hash_file(&new_abs)?;
            if current != change.content_strong_hash {
                // Destination already occupied by different bytes.
                self.handle_conflict(share, change, &current).await?;
                self.store.delete_file(&share.id, previous)?;
                remove_path_idempotent(&old_abs)?;
                return Ok(());
            }
        }

        let mut moved = false;
        if old_abs.exists() && !new_abs.exists() {
            if let Some(parent) = new_abs.parent() {
                std::fs::create_dir_all(parent)?;
            }
            match std::fs::rename(&old_abs, &new_abs) {
                Ok(()) => moved = true,
                Err(e) => {
                    debug!(
                        from = %old_abs.display(),
                        to = %new_abs.display(),
                        "local rename failed ({e}), falling back to download"
                    );
                }
            }
        }

        let mut transferred = 0;
        let hash_after = if new_abs.is_file() { hash_file(&new_abs)? } else { String::new() };
        if !moved && hash_after != change.content_strong_hash {
            transferred = self.download_to_path(share, change, &new_abs).await?;
        } else if moved && hash_after != change.content_strong_hash {
            // Renamed a stale local copy; bring the bytes up to date.
            transferred = self.download_to_path(share, change, &new_abs).await?;
        }

        remove_path_idempotent(&old_abs)?;
        self.store.delete_file(&share.id, previous)?;
        self.finish_file(share, change, &change.content_strong_hash, transferred)?;
        self.store
            .log_activity(&share.id, previous, "move", "ok", 0, Some(&change.path))?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Conflicts
    // ------------------------------------------------------------------

    async fn handle_conflict(
        &self,
        share: &ShareRecord,
        change: &FileChange,
        local_hash: &str,
    ) -> Result<()> {
        let abs = self.abs_path(&share.id, &change.path);
        let local_mod_time = local_mod_time(&abs);

        let conflict_id = self.store.add_conflict(&ConflictEntry {
            id: 0,
            share_id: share.id.clone(),
            path: change.path.clone(),
            local_hash: local_hash.to_string(),
            remote_hash: change.content_strong_hash.clone(),
            local_mod_time,
            remote_mod_time: change.mod_time,
            resolution: None,
            resolved_at: None,
            created_at: Utc::now(),
        })?;

        self.events.publish(&EngineEvent::ConflictDetected {
            share_id: share.id.clone(),
            path: change.path.clone(),
        });
        info!(share_id = %share.id, path = %change.path, "conflict detected");

        // A queued local delete for this path is overruled by whatever
        // the policy decides; without this the drain could delete the
        // remote copy the policy just chose to keep.
        let local_exists = abs.is_file();
        if !local_exists && self.store.cancel(&share.id, &change.path, QueueOp::DeleteRemote)? {
            debug!(path = %change.path, "queued remote delete superseded by conflict policy");
        }

        let policy = self.config.conflict_policy.effective();
        match policy {
            ConflictPolicy::KeepLocal if !local_exists => {
                // The local state is "deleted"; keeping local means
                // propagating the deletion.
                self.store
                    .enqueue(&share.id, &change.path, QueueOp::DeleteRemote, priority::DELETE)?;
                self.store.resolve_conflict(conflict_id, ConflictResolution::KeepLocal)?;
            }
            ConflictPolicy::KeepLocal => {
                // Local wins: discard the remote change, push our bytes.
                let mut record = self.file_record_for_local(share, change, local_hash)?;
                record.sync_status = SyncStatus::PendingUpload;
                self.store.upsert_file(&record)?;
                self.store
                    .enqueue(&share.id, &change.path, QueueOp::Upload, priority::RENAME)?;
                self.store.resolve_conflict(conflict_id, ConflictResolution::KeepLocal)?;
            }
            ConflictPolicy::KeepRemote => {
                let transferred = self.download_to_path(share, change, &abs).await?;
                self.finish_file(share, change, &change.content_strong_hash, transferred)?;
                self.store.resolve_conflict(conflict_id, ConflictResolution::KeepRemote)?;
            }
            ConflictPolicy::KeepBoth | ConflictPolicy::Merge if !local_exists => {
                // Nothing local survives to preserve; the remote version
                // simply takes the path again.
                let transferred = self.download_to_path(share, change, &abs).await?;
                self.finish_file(share, change, &change.content_strong_hash, transferred)?;
                self.store.resolve_conflict(conflict_id, ConflictResolution::KeepBoth)?;
            }
            ConflictPolicy::KeepBoth | ConflictPolicy::Merge => {
                let sibling = conflict_sibling(&change.path, Utc::now());
                let sibling_abs = self.abs_path(&share.id, &sibling);
                std::fs::rename(&abs, &sibling_abs)?;

                let transferred = self.download_to_path(share, change, &abs).await?;
                self.finish_file(share, change, &change.content_strong_hash, transferred)?;

                let sibling_size = std::fs::metadata(&sibling_abs)?.len();
                self.store.upsert_file(&FileRecord {
                    share_id: share.id.clone(),
                    path: sibling.clone(),
                    kind: FileKind::File,
                    size: sibling_size,
                    mod_time: local_mod_time,
                    local_hash: local_hash.to_string(),
                    remote_hash: String::new(),
                    last_sync_at: None,
                    version: 0,
                    sync_status: SyncStatus::PendingUpload,
                    error_message: None,
                })?;
                self.store
                    .enqueue(&share.id, &sibling, QueueOp::Upload, priority::CREATE)?;
                self.store.resolve_conflict(conflict_id, ConflictResolution::KeepBoth)?;
                info!(path = %change.path, sibling = %sibling, "conflict preserved both versions");
            }
        }
        Ok(())
    }

    fn file_record_for_local(
        &self,
        share: &ShareRecord,
        change: &FileChange,
        local_hash: &str,
    ) -> Result<FileRecord> {
        let abs = self.abs_path(&share.id, &change.path);
        let size = std::fs::metadata(&abs).map(|m| m.len()).unwrap_or(0);
        Ok(FileRecord {
            share_id: share.id.clone(),
            path: change.path.clone(),
            kind: FileKind::File,
            size,
            mod_time: local_mod_time(&abs),
            local_hash: local_hash.to_string(),
            remote_hash: change.content_strong_hash.clone(),
            last_sync_at: None,
            version: change.version,
            sync_status: SyncStatus::PendingUpload,
            error_message: None,
        })
    }

    // ------------------------------------------------------------------
    // Downloads
    // ------------------------------------------------------------------

    /// Bring `change`'s bytes to `abs`. Returns wire bytes transferred.
    async fn download_to_path(
        &self,
        share: &ShareRecord,
        change: &FileChange,
        abs: &std::path::Path,
    ) -> Result<u64> {
        let delta_eligible = abs.is_file()
            && change.size > self.config.delta_threshold
            && self.crypto.is_none()
            && !change.content_strong_hash.is_empty();

        if delta_eligible {
            match self.delta_download(share, change, abs).await {
                Ok(Some(transferred)) => return Ok(transferred),
                Ok(None) => {
                    debug!(path = %change.path, "delta download not worthwhile, full download");
                }
                Err(e) if matches!(e, EngineError::Integrity(_)) => {
                    warn!(path = %change.path, "delta reconstruction failed ({e}), full download");
                }
                Err(e) => return Err(e),
            }
        }

        let raw = self
            .remote
            .download(&share.id, &change.path)
            .await
            .map_err(EngineError::from)?;
        let transferred = raw.len() as u64;

        let plain = match &self.crypto {
            Some(crypto) => crypto.decrypt(&share.id, &raw)?,
            None => raw,
        };

        if !change.content_strong_hash.is_empty() {
            let actual = hash_bytes(&plain);
            if actual != change.content_strong_hash {
                return Err(EngineError::Integrity(format!(
                    "downloaded {} hashes to {actual}, server declared {}",
                    change.path, change.content_strong_hash
                )));
            }
        }

        atomic_write(abs, &plain)?;
        Ok(transferred)
    }

    /// Delta download: reuse local blocks, range-fetch the rest.
    /// `Ok(None)` means "fall back to a full download".
    async fn delta_download(
        &self,
        share: &ShareRecord,
        change: &FileChange,
        abs: &std::path::Path,
    ) -> Result<Option<u64>> {
        let block_size = self.config.block_size as u32;
        let response = self
            .remote
            .get_block_hashes(&share.id, &change.path, block_size)
            .await
            .map_err(EngineError::from)?;
        let remote_manifest = response
            .into_manifest(&change.content_strong_hash)
            .map_err(EngineError::from)?;

        let local_manifest = BlockManifest::from_file(abs, block_size as usize)?;
        let plan = DownloadPlan::compute(&remote_manifest, &local_manifest);

        if plan.missing_fraction() > FULL_DOWNLOAD_THRESHOLD {
            return Ok(None);
        }

        let local_bytes = std::fs::read(abs)?;
        let mut assembled = Vec::with_capacity(remote_manifest.file_size as usize);
        let mut transferred = 0u64;

        for block in &plan.blocks {
            match block.source {
                BlockSource::Reuse { local_offset } => {
                    let start = local_offset as usize;
                    let end = start + block.size as usize;
                    assembled.extend_from_slice(&local_bytes[start..end]);
                }
                BlockSource::Fetch => {
                    let data = self
                        .remote
                        .download_range(&share.id, &change.path, block.offset, u64::from(block.size))
                        .await
                        .map_err(EngineError::from)?;
                    if data.len() != block.size as usize {
                        return Err(EngineError::Protocol(format!(
                            "range {}+{} returned {} bytes",
                            block.offset,
                            block.size,
                            data.len()
                        )));
                    }
                    transferred += data.len() as u64;
                    assembled.extend_from_slice(&data);
                    self.events.publish(&EngineEvent::Progress {
                        share_id: share.id.clone(),
                        path: change.path.clone(),
                        transferred: assembled.len() as u64,
                        total: remote_manifest.file_size,
                    });
                }
            }
        }

        match remote_manifest.verify(&assembled) {
            Ok(()) => {}
            Err(DeltaError::HashMismatch { .. }) => {
                // Local base must have raced a writer; the full download
                // path re-fetches authoritative bytes.
                warn!(path = %change.path, "delta reconstruction hash mismatch");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        }

        atomic_write(abs, &assembled)?;
        debug!(
            path = %change.path,
            reused = plan.reused_bytes,
            fetched = transferred,
            "delta download complete"
        );
        Ok(Some(transferred))
    }

    // ------------------------------------------------------------------
    // Queue drain
    // ------------------------------------------------------------------

    /// Drain due queue entries in batches of `max_concurrent`. Entries
    /// fail independently; an auth failure aborts the drain (retries are
    /// pointless until the user re-authenticates).
    pub async fn drain_queue(self: &Arc<Self>) -> Result<u64> {
        let mut drained = 0u64;
        loop {
            let batch = self.store.dequeue(self.config.max_concurrent.max(1))?;
            if batch.is_empty() {
                break;
            }

            let mut handles = Vec::with_capacity(batch.len());
            for entry in batch {
                let this = Arc::clone(self);
                handles.push(tokio::spawn(async move {
                    let result = this.process_entry(&entry).await;
                    (entry, result)
                }));
            }

            for handle in handles {
                let (entry, result) = handle
                    .await
                    .map_err(|e| EngineError::InvalidState(format!("drain worker: {e}")))?;
                match result {
                    Ok(()) => drained += 1,
                    Err(EngineError::Auth(message)) => {
                        // Put the entry back untouched and surface.
                        self.store.requeue(
                            &entry,
                            &message,
                            entry.retry_count,
                            backoff_delay(1, self.config.retry_base_secs, self.config.retry_max_secs),
                        )?;
                        return Err(EngineError::Auth(message));
                    }
                    Err(e) => self.handle_entry_failure(&entry, &e)?,
                }
            }
        }
        Ok(drained)
    }

    fn handle_entry_failure(&self, entry: &QueueEntry, error: &EngineError) -> Result<()> {
        if matches!(error, EngineError::PolicyReject(_)) {
            self.store.log_activity(
                &entry.share_id,
                &entry.path,
                op_name(entry.op),
                "skipped",
                0,
                Some(&error.to_string()),
            )?;
            return Ok(());
        }

        if error.is_retryable() {
            let retry_count = entry.retry_count + 1;
            if retry_count <= self.config.retry_budget {
                let delay = backoff_delay(
                    retry_count,
                    self.config.retry_base_secs,
                    self.config.retry_max_secs,
                );
                debug!(
                    path = %entry.path,
                    retry = retry_count,
                    delay_secs = delay.num_seconds(),
                    "operation failed, retry scheduled: {error}"
                );
                self.store
                    .requeue(entry, &error.to_string(), retry_count, delay)?;
                return Ok(());
            }
        }

        // Retry budget exhausted or terminal failure class.
        warn!(path = %entry.path, "operation abandoned: {error}");
        self.store
            .set_file_error(&entry.share_id, &entry.path, &error.to_string())?;
        self.store.log_activity(
            &entry.share_id,
            &entry.path,
            op_name(entry.op),
            "error",
            0,
            Some(&error.to_string()),
        )?;
        self.events.publish(&EngineEvent::ItemError {
            share_id: entry.share_id.clone(),
            path: entry.path.clone(),
            message: error.to_string(),
        });
        Ok(())
    }

    async fn process_entry(&self, entry: &QueueEntry) -> Result<()> {
        match entry.op {
            QueueOp::Upload => self.process_upload(entry).await,
            QueueOp::Download => self.process_download(entry).await,
            QueueOp::DeleteRemote => self.process_delete_remote(entry).await,
            QueueOp::MkdirRemote => self.process_mkdir_remote(entry).await,
        }
    }

    async fn process_upload(&self, entry: &QueueEntry) -> Result<()> {
        let share = self.require_share(&entry.share_id)?;
        let abs = self.abs_path(&entry.share_id, &entry.path);

        if !abs.is_file() {
            // Vanished between enqueue and drain; nothing to push.
            self.store.log_activity(
                &entry.share_id,
                &entry.path,
                "upload",
                "skipped",
                0,
                Some("local file gone"),
            )?;
            return Ok(());
        }

        let bytes = std::fs::read(&abs)?;
        if let Some(limit) = share.size_limit {
            if bytes.len() as u64 > limit {
                return Err(EngineError::PolicyReject(format!(
                    "{} exceeds share size limit of {limit} bytes",
                    entry.path
                )));
            }
        }

        let plain_hash = hash_bytes(&bytes);
        let stored = self.store.get_file(&entry.share_id, &entry.path)?;

        self.maybe_plan_delta_upload(entry, &bytes, stored.as_ref()).await;

        let body = match &self.crypto {
            Some(crypto) => crypto.encrypt(&entry.share_id, &bytes)?,
            None => bytes.clone(),
        };
        let wire_bytes = body.len() as u64;
        self.remote
            .upload(&entry.share_id, &entry.path, body)
            .await
            .map_err(EngineError::from)?;

        let mod_time = local_mod_time(&abs);
        self.store.upsert_file(&FileRecord {
            share_id: entry.share_id.clone(),
            path: entry.path.clone(),
            kind: FileKind::File,
            size: bytes.len() as u64,
            mod_time,
            local_hash: plain_hash.clone(),
            remote_hash: plain_hash,
            last_sync_at: Some(Utc::now()),
            version: stored.map(|r| r.version).unwrap_or(0),
            sync_status: SyncStatus::Synced,
            error_message: None,
        })?;
        self.store
            .log_activity(&entry.share_id, &entry.path, "upload", "ok", wire_bytes, None)?;
        self.events.publish(&EngineEvent::ItemSynced {
            share_id: entry.share_id.clone(),
            path: entry.path.clone(),
            action: "upload".to_string(),
            bytes: wire_bytes,
        });
        Ok(())
    }

    /// Compute and log the delta-upload plan when it would pay off. The
    /// transfer itself stays a full upload until the server can negotiate
    /// delta application; this keeps the savings measurable in the logs.
    async fn maybe_plan_delta_upload(
        &self,
        entry: &QueueEntry,
        bytes: &[u8],
        stored: Option<&FileRecord>,
    ) {
        let remote_hash = match stored {
            Some(record) if !record.remote_hash.is_empty() => record.remote_hash.clone(),
            _ => return,
        };
        if self.crypto.is_some() || (bytes.len() as u64) <= self.config.delta_threshold {
            return;
        }

        let block_size = self.config.block_size as u32;
        let response = match self
            .remote
            .get_block_hashes(&entry.share_id, &entry.path, block_size)
            .await
        {
            Ok(response) => response,
            Err(e) => {
                debug!(path = %entry.path, "delta upload probe failed: {e}");
                return;
            }
        };
        let manifest = match response.into_manifest(&remote_hash) {
            Ok(manifest) => manifest,
            Err(e) => {
                debug!(path = %entry.path, "delta upload manifest rejected: {e}");
                return;
            }
        };

        let plan = DeltaPlan::compute(bytes, &manifest);
        if plan.savings() < DELTA_UPLOAD_MIN_SAVINGS {
            debug!(
                path = %entry.path,
                savings = plan.savings(),
                "delta upload refused, expected savings below threshold"
            );
        } else if self.config.server_delta_upload {
            // TODO: wire the delta body once the server's negotiation
            // endpoint ships; the plan is already correct here.
            debug!(path = %entry.path, savings = plan.savings(), "delta upload negotiated but unsupported");
        } else {
            debug!(
                path = %entry.path,
                savings = plan.savings(),
                matched = plan.bytes_matched,
                "delta upload would save bytes; server support not negotiated"
            );
        }
    }

    async fn process_download(&self, entry: &QueueEntry) -> Result<()> {
        let share = self.require_share(&entry.share_id)?;
        let metadata = self
            .remote
            .get_metadata(&entry.share_id, &entry.path, false)
            .await
            .map_err(EngineError::from)?;

        let change = FileChange {
            path: entry.path.clone(),
            kind: metadata.kind,
            action: ChangeAction::Modified,
            previous_path: None,
            size: metadata.size,
            mod_time: metadata.mod_time,
            content_strong_hash: metadata.content_strong_hash,
            version: metadata.version,
        };

        match metadata.kind {
            EntryKind::Directory => self.apply_directory(&share, &change),
            EntryKind::File => {
                let abs = self.abs_path(&entry.share_id, &entry.path);
                let transferred = self.download_to_path(&share, &change, &abs).await?;
                self.finish_file(&share, &change, &change.content_strong_hash, transferred)
            }
        }
    }

    async fn process_delete_remote(&self, entry: &QueueEntry) -> Result<()> {
        match self.remote.delete(&entry.share_id, &entry.path).await {
            Ok(()) => {}
            // Already gone remotely: the goal state holds.
            Err(TransportError::Http { status: 404, .. }) => {}
            Err(e) => return Err(e.into()),
        }
        self.store.delete_file(&entry.share_id, &entry.path)?;
        self.store
            .log_activity(&entry.share_id, &entry.path, "delete_remote", "ok", 0, None)?;
        self.events.publish(&EngineEvent::ItemSynced {
            share_id: entry.share_id.clone(),
            path: entry.path.clone(),
            action: "delete_remote".to_string(),
            bytes: 0,
        });
        Ok(())
    }

    async fn process_mkdir_remote(&self, entry: &QueueEntry) -> Result<()> {
        match self.remote.mkdir(&entry.share_id, &entry.path).await {
            Ok(()) => {}
            // MKCOL on an existing collection; the goal state holds.
            Err(TransportError::Http { status: 405, .. })
            | Err(TransportError::Http { status: 409, .. }) => {}
            Err(e) => return Err(e.into()),
        }

        let mut record = FileRecord::directory(&entry.share_id, &entry.path, Utc::now());
        record.sync_status = SyncStatus::Synced;
        record.last_sync_at = Some(Utc::now());
        self.store.upsert_file(&record)?;
        self.store
            .log_activity(&entry.share_id, &entry.path, "mkdir_remote", "ok", 0, None)?;
        Ok(())
    }

    fn require_share(&self, share_id: &str) -> Result<ShareRecord> {
        self.store
            .get_share(share_id)?
            .ok_or_else(|| EngineError::InvalidState(format!("unknown share {share_id}")))
    }
}

fn op_name(op: QueueOp) -> &'static str {
    match op {
        QueueOp::Upload => "upload",
        QueueOp::Download => "download",
        QueueOp::DeleteRemote => "delete_remote",
        QueueOp::MkdirRemote => "mkdir_remote",
    }
}

fn local_mod_time(path: &std::path::Path) -> DateTime<Utc> {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| Utc::now())
}
