//! Shared fixtures for TideSync integration tests.
//!
//! [`InMemoryRemote`] implements the full [`RemoteStore`] surface over
//! hash maps so engine scenarios run without a server. Bodies are stored
//! as plain bytes; changes are an append-only feed whose cursor is the
//! feed index rendered as a string.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use tidesync_core::{EngineConfig, SyncEngine};
use tidesync_delta::manifest::BlockManifest;
use tidesync_delta::strong_digest_hex;
use tidesync_store::StateStore;
use tidesync_transport::types::{
    BlockHashResponse, ChangeAction, ChangesResponse, EntryKind, FileChange, RemoteMetadata,
    Share, SyncConfigDoc, SyncStateDoc,
};
use tidesync_transport::{RemoteStore, TransportError};

type Result<T> = std::result::Result<T, TransportError>;

/// In-memory authoritative store for tests.
#[derive(Default)]
pub struct InMemoryRemote {
    /// Shares returned by `list_shares`.
    pub shares: Mutex<Vec<Share>>,
    /// File bodies keyed by `(share_id, path)`.
    pub files: Mutex<HashMap<(String, String), Vec<u8>>>,
    /// Change feed per share.
    pub changes: Mutex<HashMap<String, Vec<FileChange>>>,
    /// Mirrored per-share sync state.
    pub sync_states: Mutex<HashMap<String, SyncStateDoc>>,
    /// Force uploads to fail with a transport error.
    pub fail_uploads: AtomicBool,
    /// Ranged download calls observed.
    pub range_calls: AtomicUsize,
    /// Ranged download bytes served.
    pub range_bytes: AtomicU64,
    /// Whole-file download calls observed.
    pub full_download_calls: AtomicUsize,
    /// Upload attempts observed.
    pub upload_calls: AtomicUsize,
}

impl InMemoryRemote {
    /// Remote with a single share.
    pub fn with_share(share_id: &str) -> Arc<Self> {
        let remote = Self::default();
        remote.shares.lock().push(Share {
            id: share_id.to_string(),
            name: format!("{share_id} share"),
            excludes: Vec::new(),
            size_limit: None,
        });
        Arc::new(remote)
    }

    /// Store a body server-side and append the matching feed change.
    pub fn put_file_with_change(&self, share_id: &str, path: &str, body: &[u8], action: ChangeAction) {
        let hash = strong_digest_hex(body);
        let size = body.len() as u64;
        self.files
            .lock()
            .insert((share_id.to_string(), path.to_string()), body.to_vec());

        let mut changes = self.changes.lock();
        let feed = changes.entry(share_id.to_string()).or_default();
        let version = feed.len() as i64 + 1;
        feed.push(FileChange {
            path: path.to_string(),
            kind: EntryKind::File,
            action,
            previous_path: None,
            size,
            mod_time: Utc::now(),
            content_strong_hash: hash,
            version,
        });
    }

    /// Current body of a file, if any.
    pub fn file_body(&self, share_id: &str, path: &str) -> Option<Vec<u8>> {
        self.files
            .lock()
            .get(&(share_id.to_string(), path.to_string()))
            .cloned()
    }
}

#[async_trait]
impl RemoteStore for InMemoryRemote {
    async fn list_shares(&self) -> Result<Vec<Share>> {
        Ok(self.shares.lock().clone())
    }

    async fn get_config(&self) -> Result<SyncConfigDoc> {
        Ok(SyncConfigDoc::default())
    }

    async fn put_config(&self, _config: &SyncConfigDoc) -> Result<()> {
        Ok(())
    }

    async fn get_changes(
        &self,
        share_id: &str,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<ChangesResponse> {
        let changes = self.changes.lock();
        let feed = changes.get(share_id).cloned().unwrap_or_default();
        let start: usize = cursor.and_then(|c| c.parse().ok()).unwrap_or(0);
        let end = (start + limit).min(feed.len());
        Ok(ChangesResponse {
            changes: feed[start.min(feed.len())..end].to_vec(),
            cursor: end.to_string(),
            has_more: end < feed.len(),
        })
    }

    async fn get_metadata(
        &self,
        share_id: &str,
        path: &str,
        _include_children: bool,
    ) -> Result<RemoteMetadata> {
        let body = self.file_body(share_id, path).ok_or(TransportError::Http {
            status: 404,
            message: format!("{path} not found"),
        })?;
        Ok(RemoteMetadata {
            path: path.to_string(),
            kind: EntryKind::File,
            size: body.len() as u64,
            mod_time: Utc::now(),
            content_strong_hash: strong_digest_hex(&body),
            version: 1,
            children: None,
        })
    }

    async fn get_block_hashes(
        &self,
        share_id: &str,
        path: &str,
        block_size: u32,
    ) -> Result<BlockHashResponse> {
        let body = self.file_body(share_id, path).ok_or(TransportError::Http {
            status: 404,
            message: format!("{path} not found"),
        })?;
        let manifest = BlockManifest::from_bytes(&body, block_size as usize)
            .map_err(|e| TransportError::Protocol(e.to_string()))?;
        Ok(BlockHashResponse {
            path: path.to_string(),
            size: manifest.file_size,
            block_size: manifest.block_size,
            blocks: manifest.blocks,
        })
    }

    async fn get_sync_state(&self, share_id: &str) -> Result<SyncStateDoc> {
        Ok(self.sync_states.lock().get(share_id).cloned().unwrap_or_default())
    }

    async fn put_sync_state(&self, share_id: &str, state: &SyncStateDoc) -> Result<()> {
        self.sync_states.lock().insert(share_id.to_string(), state.clone());
        Ok(())
    }

    async fn download(&self, share_id: &str, path: &str) -> Result<Vec<u8>> {
        self.full_download_calls.fetch_add(1, Ordering::SeqCst);
        self.file_body(share_id, path).ok_or(TransportError::Http {
            status: 404,
            message: format!("{path} not found"),
        })
    }

    async fn download_range(
        &self,
        share_id: &str,
        path: &str,
        offset: u64,
        length: u64,
    ) -> Result<Vec<u8>> {
        let body = self.file_body(share_id, path).ok_or(TransportError::Http {
            status: 404,
            message: format!("{path} not found"),
        })?;
        let start = offset as usize;
        let end = (start + length as usize).min(body.len());
        if start > body.len() {
            return Err(TransportError::Http {
                status: 416,
                message: "range not satisfiable".to_string(),
            });
        }
        self.range_calls.fetch_add(1, Ordering::SeqCst);
        self.range_bytes.fetch_add((end - start) as u64, Ordering::SeqCst);
        Ok(body[start..end].to_vec())
    }

    async fn upload(&self, share_id: &str, path: &str, bytes: Vec<u8>) -> Result<()> {
        self.upload_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_uploads.load(Ordering::SeqCst) {
            return Err(TransportError::Network("injected upload failure".to_string()));
        }
        self.files
            .lock()
            .insert((share_id.to_string(), path.to_string()), bytes);
        Ok(())
    }

    async fn delete(&self, share_id: &str, path: &str) -> Result<()> {
        self.files
            .lock()
            .remove(&(share_id.to_string(), path.to_string()));
        Ok(())
    }

    async fn mkdir(&self, _share_id: &str, _path: &str) -> Result<()> {
        Ok(())
    }

    async fn rename(&self, share_id: &str, src: &str, dst: &str) -> Result<()> {
        let mut files = self.files.lock();
        if let Some(body) = files.remove(&(share_id.to_string(), src.to_string())) {
            files.insert((share_id.to_string(), dst.to_string()), body);
        }
        Ok(())
    }
}

/// Engine fixture: temp data dir, in-memory remote, fast timers.
pub struct EngineFixture {
    /// Keeps the temp dir alive.
    pub dir: tempfile::TempDir,
    /// The engine under test.
    pub engine: Arc<SyncEngine>,
    /// The fake remote.
    pub remote: Arc<InMemoryRemote>,
    /// The engine's store.
    pub store: Arc<StateStore>,
    /// The configuration the engine runs with.
    pub config: EngineConfig,
}

impl EngineFixture {
    /// Build a fixture around one share.
    pub fn new(share_id: &str) -> Self {
        Self::with_config(share_id, |_| {})
    }

    /// Build a fixture, letting the caller tweak the config first.
    pub fn with_config(share_id: &str, tweak: impl FnOnce(&mut EngineConfig)) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = EngineConfig {
            server_url: "http://remote.invalid".to_string(),
            device_id: "test-device".to_string(),
            refresh_token: "test-refresh".to_string(),
            data_dir: dir.path().to_path_buf(),
            poll_interval_secs: 3600,
            debounce_ms: 100,
            retry_base_secs: 0,
            ..EngineConfig::default()
        };
        tweak(&mut config);

        let remote = InMemoryRemote::with_share(share_id);
        let store = Arc::new(StateStore::open(config.store_path()).expect("store"));
        let engine = SyncEngine::new(
            config.clone(),
            Arc::clone(&store),
            Arc::clone(&remote) as Arc<dyn RemoteStore>,
            None,
        );

        Self { dir, engine, remote, store, config }
    }

    /// Absolute path inside the share root.
    pub fn local_path(&self, share_id: &str, rel: &str) -> std::path::PathBuf {
        self.config.share_root(share_id).join(rel.trim_start_matches('/'))
    }
}

/// Hex SHA-256 of a byte slice; mirrors what the engine records.
pub fn sha256_hex(data: &[u8]) -> String {
    strong_digest_hex(data)
}
