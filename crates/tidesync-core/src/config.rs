//! Engine configuration.

use crate::conflict::ConflictPolicy;
use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Queue priorities; higher drains first.
pub mod priority {
    /// Remote deletions.
    pub const DELETE: i64 = 100;
    /// Renames and conflict-preserving uploads.
    pub const RENAME: i64 = 90;
    /// Newly created paths.
    pub const CREATE: i64 = 80;
    /// Content modifications.
    pub const MODIFY: i64 = 60;
}

/// Smartsync (placeholder dehydration) tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmartSyncConfig {
    /// Whether dehydration planning runs at all.
    pub enabled: bool,
    /// Hydrated files idle longer than this are dehydrated regardless of
    /// space pressure.
    pub max_age_days: i64,
    /// Free-space floor in bytes; below it the planner frees space
    /// oldest-first until the shortfall is covered.
    pub min_free_bytes: u64,
}

impl Default for SmartSyncConfig {
    fn default() -> Self {
        Self { enabled: false, max_age_days: 30, min_free_bytes: 0 }
    }
}

/// Engine configuration. Defaults are usable except for the server URL
/// and device credentials, which must come from enrollment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Server base URL.
    pub server_url: String,
    /// Device identifier issued at enrollment.
    pub device_id: String,
    /// Last known access token; may be empty.
    #[serde(default)]
    pub access_token: String,
    /// Long-lived refresh token.
    #[serde(default)]
    pub refresh_token: String,
    /// Per-user data directory (state store, keys, smartsync state).
    #[serde(default)]
    pub data_dir: PathBuf,
    /// Root under which per-share directories materialize. Defaults to
    /// `<data_dir>/cache`.
    #[serde(default)]
    pub sync_root: Option<PathBuf>,
    /// Seconds between periodic sync passes.
    #[serde(default = "default_poll_secs")]
    pub poll_interval_secs: u64,
    /// Watcher debounce window in milliseconds.
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    /// Delta block size in bytes.
    #[serde(default = "default_block_size")]
    pub block_size: usize,
    /// Files above this size use delta transfer when a local base exists.
    #[serde(default = "default_delta_threshold")]
    pub delta_threshold: u64,
    /// Queue drain concurrency.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// Retries before an operation is abandoned.
    #[serde(default = "default_retry_budget")]
    pub retry_budget: i64,
    /// Base retry delay in seconds; doubles per retry.
    #[serde(default = "default_retry_base_secs")]
    pub retry_base_secs: u64,
    /// Retry delay ceiling in seconds.
    #[serde(default = "default_retry_max_secs")]
    pub retry_max_secs: u64,
    /// Conflict resolution policy.
    #[serde(default)]
    pub conflict_policy: ConflictPolicy,
    /// Device-level exclude patterns, merged with per-share ones.
    #[serde(default)]
    pub excludes: Vec<String>,
    /// Advisory upload pacing in bytes/second; 0 = unlimited.
    #[serde(default)]
    pub upload_limit: u64,
    /// Advisory download pacing in bytes/second; 0 = unlimited.
    #[serde(default)]
    pub download_limit: u64,
    /// Whether the server negotiated delta uploads. Off until a
    /// capability endpoint exists; the plan is still computed and logged.
    #[serde(default)]
    pub server_delta_upload: bool,
    /// Encrypt file bodies with the share key before upload and decrypt
    /// after download.
    #[serde(default)]
    pub encrypt_at_rest: bool,
    /// Days of activity history to keep.
    #[serde(default = "default_activity_days")]
    pub activity_retention_days: i64,
    /// Dehydration tuning.
    #[serde(default)]
    pub smartsync: SmartSyncConfig,
}

fn default_poll_secs() -> u64 {
    30
}
fn default_debounce_ms() -> u64 {
    500
}
fn default_block_size() -> usize {
    tidesync_delta::DEFAULT_BLOCK_SIZE
}
fn default_delta_threshold() -> u64 {
    1024 * 1024
}
fn default_max_concurrent() -> usize {
    4
}
fn default_retry_budget() -> i64 {
    3
}
fn default_retry_base_secs() -> u64 {
    5
}
fn default_retry_max_secs() -> u64 {
    300
}
fn default_activity_days() -> i64 {
    30
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            server_url: String::new(),
            device_id: String::new(),
            access_token: String::new(),
            refresh_token: String::new(),
            data_dir: PathBuf::new(),
            sync_root: None,
            poll_interval_secs: default_poll_secs(),
            debounce_ms: default_debounce_ms(),
            block_size: default_block_size(),
            delta_threshold: default_delta_threshold(),
            max_concurrent: default_max_concurrent(),
            retry_budget: default_retry_budget(),
            retry_base_secs: default_retry_base_secs(),
            retry_max_secs: default_retry_max_secs(),
            conflict_policy: ConflictPolicy::default(),
            excludes: Vec::new(),
            upload_limit: 0,
            download_limit: 0,
            server_delta_upload: false,
            encrypt_at_rest: false,
            activity_retention_days: default_activity_days(),
            smartsync: SmartSyncConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Reject configurations the engine cannot start with.
    pub fn validate(&self) -> Result<()> {
        if self.server_url.trim().is_empty() {
            return Err(EngineError::NotConfigured("server URL missing".into()));
        }
        if self.device_id.trim().is_empty() {
            return Err(EngineError::NotConfigured("device ID missing".into()));
        }
        if self.refresh_token.trim().is_empty() {
            return Err(EngineError::NotConfigured("device refresh token missing".into()));
        }
        if self.data_dir.as_os_str().is_empty() {
            return Err(EngineError::NotConfigured("data directory missing".into()));
        }
        Ok(())
    }

    /// Root under which share directories live.
    #[must_use]
    pub fn sync_root(&self) -> PathBuf {
        self.sync_root
            .clone()
            .unwrap_or_else(|| self.data_dir.join("cache"))
    }

    /// Local root of one share.
    #[must_use]
    pub fn share_root(&self, share_id: &str) -> PathBuf {
        self.sync_root().join(share_id)
    }

    /// Path of the state store database.
    #[must_use]
    pub fn store_path(&self) -> PathBuf {
        self.data_dir.join("sync.db")
    }

    /// Key directory.
    #[must_use]
    pub fn keys_dir(&self) -> PathBuf {
        self.data_dir.join("keys")
    }

    /// Smartsync state file.
    #[must_use]
    pub fn smartsync_state_path(&self) -> PathBuf {
        self.data_dir.join("smartsync").join("state.json")
    }

    /// Poll interval as a [`Duration`].
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    /// Debounce window as a [`Duration`].
    #[must_use]
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms.max(10))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn configured() -> EngineConfig {
        EngineConfig {
            server_url: "https://cloud.example.com".into(),
            device_id: "dev1".into(),
            refresh_token: "r".into(),
            data_dir: PathBuf::from("/tmp/tidesync"),
            ..EngineConfig::default()
        }
    }

    #[test]
    fn test_validate_requires_credentials() {
        assert!(configured().validate().is_ok());

        let mut config = configured();
        config.server_url.clear();
        assert!(matches!(config.validate(), Err(EngineError::NotConfigured(_))));

        let mut config = configured();
        config.refresh_token.clear();
        assert!(matches!(config.validate(), Err(EngineError::NotConfigured(_))));
    }

    #[test]
    fn test_derived_paths() {
        let config = configured();
        assert_eq!(config.store_path(), PathBuf::from("/tmp/tidesync/sync.db"));
        assert_eq!(config.share_root("s1"), PathBuf::from("/tmp/tidesync/cache/s1"));
        assert_eq!(
            config.smartsync_state_path(),
            PathBuf::from("/tmp/tidesync/smartsync/state.json")
        );
    }

    #[test]
    fn test_priorities_ordering() {
        assert!(priority::DELETE > priority::RENAME);
        assert!(priority::RENAME > priority::CREATE);
        assert!(priority::CREATE > priority::MODIFY);
    }

    #[test]
    fn test_toml_defaults_fill_in() {
        let parsed: EngineConfig = toml_like_json(
            r#"{
                "server_url": "https://x",
                "device_id": "d",
                "data_dir": "/data"
            }"#,
        );
        assert_eq!(parsed.poll_interval_secs, 30);
        assert_eq!(parsed.debounce_ms, 500);
        assert_eq!(parsed.retry_budget, 3);
        assert_eq!(parsed.block_size, tidesync_delta::DEFAULT_BLOCK_SIZE);
    }

    fn toml_like_json(json: &str) -> EngineConfig {
        serde_json::from_str(json).unwrap()
    }
}
