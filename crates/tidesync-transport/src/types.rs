//! Typed wire shapes for the sync API.
//!
//! Unknown JSON fields are ignored on read; field names are stable for
//! forward compatibility of persisted documents.

use crate::{Result, TransportError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tidesync_delta::manifest::{BlockHash, BlockManifest};

/// A remote root the device may sync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Share {
    /// Opaque share identifier.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// Server-configured exclude patterns.
    #[serde(default)]
    pub excludes: Vec<String>,
    /// Optional byte cap.
    #[serde(default)]
    pub size_limit: Option<u64>,
}

/// File-or-directory discriminator on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    /// Regular file.
    File,
    /// Directory.
    Directory,
}

/// What the change feed says happened to a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeAction {
    /// Path appeared.
    Created,
    /// Path content changed.
    Modified,
    /// Path is gone.
    Deleted,
    /// Path moved; `previous_path` names the old location.
    Moved,
}

/// One entry of the per-share change feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChange {
    /// Share-relative path.
    pub path: String,
    /// File or directory.
    #[serde(rename = "type")]
    pub kind: EntryKind,
    /// Change kind.
    pub action: ChangeAction,
    /// Old path for `Moved` changes.
    #[serde(default)]
    pub previous_path: Option<String>,
    /// Size after the change; 0 for deletes and directories.
    #[serde(default)]
    pub size: u64,
    /// Modification instant after the change.
    pub mod_time: DateTime<Utc>,
    /// SHA-256 (hex) of the content after the change; empty for
    /// directories and deletes.
    #[serde(default)]
    pub content_strong_hash: String,
    /// Server-assigned monotone version.
    #[serde(default)]
    pub version: i64,
}

/// Response of the change feed endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangesResponse {
    /// Changes in feed order.
    pub changes: Vec<FileChange>,
    /// Cursor to persist after applying every change above.
    pub cursor: String,
    /// Whether another page is immediately available.
    #[serde(default)]
    pub has_more: bool,
}

/// Metadata of one remote path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteMetadata {
    /// Share-relative path.
    pub path: String,
    /// File or directory.
    #[serde(rename = "type")]
    pub kind: EntryKind,
    /// Byte length; 0 for directories.
    #[serde(default)]
    pub size: u64,
    /// Modification instant.
    pub mod_time: DateTime<Utc>,
    /// SHA-256 (hex) of the content; empty for directories.
    #[serde(default)]
    pub content_strong_hash: String,
    /// Server-assigned version.
    #[serde(default)]
    pub version: i64,
    /// Directory children, when requested.
    #[serde(default)]
    pub children: Option<Vec<RemoteMetadata>>,
}

/// Response of the block-hash endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHashResponse {
    /// Share-relative path.
    pub path: String,
    /// File size the hashes describe.
    pub size: u64,
    /// Block size the hashes were computed at.
    pub block_size: u32,
    /// Per-block hashes in file order.
    pub blocks: Vec<BlockHash>,
}

impl BlockHashResponse {
    /// Combine with the file-level hash (carried by the change feed or
    /// metadata endpoint) into a [`BlockManifest`].
    pub fn into_manifest(self, file_hash_hex: &str) -> Result<BlockManifest> {
        let mut file_hash = [0u8; 32];
        hex::decode_to_slice(file_hash_hex, &mut file_hash).map_err(|_| {
            TransportError::Protocol(format!("bad file hash {file_hash_hex:?}"))
        })?;
        Ok(BlockManifest {
            file_size: self.size,
            block_size: self.block_size,
            file_hash,
            blocks: self.blocks,
        })
    }
}

/// Per-device sync configuration document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfigDoc {
    /// Device identifier the config belongs to.
    #[serde(default)]
    pub device_id: String,
    /// Device-level exclude patterns.
    #[serde(default)]
    pub excludes: Vec<String>,
    /// Advisory upload limit in bytes/second; 0 = unlimited.
    #[serde(default)]
    pub upload_limit: u64,
    /// Advisory download limit in bytes/second; 0 = unlimited.
    #[serde(default)]
    pub download_limit: u64,
}

/// Per-share sync state mirrored to the server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStateDoc {
    /// Last committed change-feed cursor.
    #[serde(default)]
    pub cursor: String,
    /// Engine status string (`idle`, `syncing`, `paused`, `error`).
    #[serde(default)]
    pub status: String,
}

/// Body of the token refresh endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshRequest {
    /// Long-lived refresh token.
    pub refresh_token: String,
    /// Device identifier.
    pub device_id: String,
}

/// Response of the token refresh endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshResponse {
    /// Fresh short-lived access token.
    pub access_token: String,
    /// Rotated refresh token.
    pub refresh_token: String,
    /// Expiry of the access token.
    pub access_expires_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_change_feed_parses_with_unknown_fields() {
        let json = r#"{
            "changes": [{
                "path": "/a.txt",
                "type": "file",
                "action": "modified",
                "size": 2,
                "mod_time": "2025-01-15T14:30:00Z",
                "content_strong_hash": "ab",
                "version": 5,
                "server_internal_field": true
            }],
            "cursor": "c1",
            "has_more": false,
            "next_hint": "ignored"
        }"#;

        let response: ChangesResponse = serde_json::from_str(json).unwrap();
        assert_eq!(response.cursor, "c1");
        assert_eq!(response.changes[0].action, ChangeAction::Modified);
        assert_eq!(response.changes[0].kind, EntryKind::File);
        assert_eq!(response.changes[0].version, 5);
        assert_eq!(response.changes[0].previous_path, None);
    }

    #[test]
    fn test_moved_change_carries_previous_path() {
        let json = r#"{
            "path": "/new.txt",
            "type": "file",
            "action": "moved",
            "previous_path": "/old.txt",
            "mod_time": "2025-01-15T14:30:00Z"
        }"#;
        let change: FileChange = serde_json::from_str(json).unwrap();
        assert_eq!(change.action, ChangeAction::Moved);
        assert_eq!(change.previous_path.as_deref(), Some("/old.txt"));
    }

    #[test]
    fn test_block_hash_response_into_manifest() {
        let data = vec![5u8; 8192];
        let manifest =
            BlockManifest::from_bytes(&data, tidesync_delta::MIN_BLOCK_SIZE).unwrap();
        let response = BlockHashResponse {
            path: "/f".to_string(),
            size: manifest.file_size,
            block_size: manifest.block_size,
            blocks: manifest.blocks.clone(),
        };

        let rebuilt = response
            .into_manifest(&hex::encode(manifest.file_hash))
            .unwrap();
        assert_eq!(rebuilt, manifest);
    }

    #[test]
    fn test_bad_file_hash_is_protocol_error() {
        let response = BlockHashResponse {
            path: "/f".to_string(),
            size: 0,
            block_size: 4096,
            blocks: vec![],
        };
        assert!(matches!(
            response.into_manifest("zz-not-hex"),
            Err(TransportError::Protocol(_))
        ));
    }
}
