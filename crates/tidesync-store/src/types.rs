//! Data model of the local state store.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// A remote root the engine is authorized to sync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShareRecord {
    /// Opaque server-assigned identifier.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// Exclude patterns (glob, `**` means any depth).
    #[serde(default)]
    pub excludes: Vec<String>,
    /// Optional byte cap for the share.
    #[serde(default)]
    pub size_limit: Option<u64>,
}

/// Whether a path is a file or a directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileKind {
    /// Regular file.
    File,
    /// Directory.
    Directory,
}

impl FileKind {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::File => "file",
            Self::Directory => "directory",
        }
    }

    pub(crate) fn parse(text: &str) -> Option<Self> {
        match text {
            "file" => Some(Self::File),
            "directory" => Some(Self::Directory),
            _ => None,
        }
    }
}

/// Reconciliation state of one path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    /// Local and remote agree.
    Synced,
    /// Local bytes await upload.
    PendingUpload,
    /// Remote bytes await download.
    PendingDownload,
    /// Divergence recorded, awaiting resolution.
    Conflict,
    /// A terminal error is recorded on the path.
    Error,
}

impl SyncStatus {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::Synced => "synced",
            Self::PendingUpload => "pending_upload",
            Self::PendingDownload => "pending_download",
            Self::Conflict => "conflict",
            Self::Error => "error",
        }
    }

    pub(crate) fn parse(text: &str) -> Option<Self> {
        match text {
            "synced" => Some(Self::Synced),
            "pending_upload" => Some(Self::PendingUpload),
            "pending_download" => Some(Self::PendingDownload),
            "conflict" => Some(Self::Conflict),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

/// Durable record of one path within a share.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    /// Owning share.
    pub share_id: String,
    /// Share-relative path.
    pub path: String,
    /// File or directory.
    pub kind: FileKind,
    /// Byte length; 0 for directories.
    pub size: u64,
    /// Last observed modification instant.
    pub mod_time: DateTime<Utc>,
    /// SHA-256 (hex) of the last observed local bytes, or empty.
    pub local_hash: String,
    /// SHA-256 (hex) the server last acknowledged, or empty.
    pub remote_hash: String,
    /// Instant of the last confirmed reconciliation.
    pub last_sync_at: Option<DateTime<Utc>>,
    /// Server-assigned monotone version; 0 when unknown.
    pub version: i64,
    /// Reconciliation state.
    pub sync_status: SyncStatus,
    /// Terminal error message, when `sync_status == Error`.
    pub error_message: Option<String>,
}

impl FileRecord {
    /// Fresh record for a newly observed directory.
    #[must_use]
    pub fn directory(share_id: &str, path: &str, mod_time: DateTime<Utc>) -> Self {
        Self {
            share_id: share_id.to_string(),
            path: path.to_string(),
            kind: FileKind::Directory,
            size: 0,
            mod_time,
            local_hash: String::new(),
            remote_hash: String::new(),
            last_sync_at: None,
            version: 0,
            sync_status: SyncStatus::PendingUpload,
            error_message: None,
        }
    }
}

/// Remote operation kinds carried by the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueOp {
    /// Push local bytes to the server.
    Upload,
    /// Pull remote bytes to disk.
    Download,
    /// Delete the remote path.
    DeleteRemote,
    /// Create a remote directory.
    MkdirRemote,
}

impl QueueOp {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::Upload => "upload",
            Self::Download => "download",
            Self::DeleteRemote => "delete_remote",
            Self::MkdirRemote => "mkdir_remote",
        }
    }

    pub(crate) fn parse(text: &str) -> Option<Self> {
        match text {
            "upload" => Some(Self::Upload),
            "download" => Some(Self::Download),
            "delete_remote" => Some(Self::DeleteRemote),
            "mkdir_remote" => Some(Self::MkdirRemote),
            _ => None,
        }
    }
}

/// One queued operation. Unique per `(share_id, path, op)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    /// Owning share.
    pub share_id: String,
    /// Share-relative path.
    pub path: String,
    /// Operation kind.
    pub op: QueueOp,
    /// Drain priority; higher drains first.
    pub priority: i64,
    /// Failed attempts so far.
    pub retry_count: i64,
    /// Earliest instant the entry may be dequeued.
    pub scheduled_at: DateTime<Utc>,
    /// Message of the last failure, if any.
    pub last_error: Option<String>,
    /// Enqueue instant; FIFO tie-break within a priority.
    pub created_at: DateTime<Utc>,
}

/// How a conflict was (or will be) settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictResolution {
    /// Local bytes win; remote discarded.
    KeepLocal,
    /// Remote bytes win; local overwritten.
    KeepRemote,
    /// Local renamed aside, remote takes the path.
    KeepBoth,
    /// Delegated to an external merge collaborator.
    Merge,
}

impl ConflictResolution {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::KeepLocal => "keep_local",
            Self::KeepRemote => "keep_remote",
            Self::KeepBoth => "keep_both",
            Self::Merge => "merge",
        }
    }

    pub(crate) fn parse(text: &str) -> Option<Self> {
        match text {
            "keep_local" => Some(Self::KeepLocal),
            "keep_remote" => Some(Self::KeepRemote),
            "keep_both" => Some(Self::KeepBoth),
            "merge" => Some(Self::Merge),
            _ => None,
        }
    }
}

/// A recorded divergence between local and remote content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictEntry {
    /// Row identifier; 0 before insertion.
    #[serde(default)]
    pub id: i64,
    /// Owning share.
    pub share_id: String,
    /// Share-relative path.
    pub path: String,
    /// Local content hash at detection time (hex).
    pub local_hash: String,
    /// Remote content hash at detection time (hex).
    pub remote_hash: String,
    /// Local modification instant.
    pub local_mod_time: DateTime<Utc>,
    /// Remote modification instant.
    pub remote_mod_time: DateTime<Utc>,
    /// Applied resolution; `None` until resolved.
    pub resolution: Option<ConflictResolution>,
    /// Resolution instant.
    pub resolved_at: Option<DateTime<Utc>>,
    /// Detection instant.
    pub created_at: DateTime<Utc>,
}

/// One line of the user-visible history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityEntry {
    /// Row identifier; 0 before insertion.
    #[serde(default)]
    pub id: i64,
    /// Owning share.
    pub share_id: String,
    /// Share-relative path.
    pub path: String,
    /// What happened (`upload`, `download`, `delete`, `skip`, ...).
    pub action: String,
    /// Outcome (`ok`, `error`, `skipped`).
    pub status: String,
    /// Bytes moved by the action.
    pub bytes: u64,
    /// Optional detail, e.g. an error message.
    pub message: Option<String>,
    /// Instant of the action.
    pub created_at: DateTime<Utc>,
}

/// Aggregate counters for one share.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShareStats {
    /// Files currently synced.
    pub synced: u64,
    /// Files awaiting upload.
    pub pending_upload: u64,
    /// Files awaiting download.
    pub pending_download: u64,
    /// Files in conflict.
    pub conflict: u64,
    /// Files with a terminal error.
    pub error: u64,
    /// Total bytes across file records.
    pub total_bytes: u64,
    /// Bytes across not-yet-synced file records.
    pub pending_bytes: u64,
}

/// Instant to store representation (UTC milliseconds).
#[must_use]
pub fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

/// Store representation (UTC milliseconds) to instant.
#[must_use]
pub fn from_millis(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis).single().unwrap_or_else(Utc::now)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enum_text_roundtrips() {
        for status in [
            SyncStatus::Synced,
            SyncStatus::PendingUpload,
            SyncStatus::PendingDownload,
            SyncStatus::Conflict,
            SyncStatus::Error,
        ] {
            assert_eq!(SyncStatus::parse(status.as_str()), Some(status));
        }
        for op in [
            QueueOp::Upload,
            QueueOp::Download,
            QueueOp::DeleteRemote,
            QueueOp::MkdirRemote,
        ] {
            assert_eq!(QueueOp::parse(op.as_str()), Some(op));
        }
        assert_eq!(SyncStatus::parse("bogus"), None);
    }

    #[test]
    fn test_millis_roundtrip() {
        let at = Utc.with_ymd_and_hms(2025, 1, 15, 14, 30, 0).unwrap();
        assert_eq!(from_millis(to_millis(at)), at);
    }

    #[test]
    fn test_serde_field_names_stable() {
        let record = FileRecord {
            share_id: "s".into(),
            path: "/a.txt".into(),
            kind: FileKind::File,
            size: 2,
            mod_time: Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(),
            local_hash: "ab".into(),
            remote_hash: "ab".into(),
            last_sync_at: None,
            version: 1,
            sync_status: SyncStatus::Synced,
            error_message: None,
        };
        let json = serde_json::to_string(&record).unwrap();
        for field in [
            "share_id", "path", "kind", "size", "mod_time", "local_hash",
            "remote_hash", "last_sync_at", "version", "sync_status",
        ] {
            assert!(json.contains(field), "missing field {field}");
        }
        assert!(json.contains("\"synced\""));
    }
}
