//! Conflict policy and naming.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// How detected divergences are settled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Upload the local version; discard the remote.
    KeepLocal,
    /// Download the remote version over the local one.
    KeepRemote,
    /// Rename the local copy aside, take the remote, upload the copy.
    #[default]
    KeepBoth,
    /// Delegate to an external merge collaborator; falls back to
    /// [`ConflictPolicy::KeepBoth`] when none is wired in.
    Merge,
}

impl ConflictPolicy {
    /// The policy actually applied: `Merge` has no collaborator here and
    /// degrades to `KeepBoth`.
    #[must_use]
    pub fn effective(self) -> Self {
        match self {
            Self::Merge => Self::KeepBoth,
            other => other,
        }
    }
}

/// Sibling name for the preserved local copy:
/// `<basename> (Conflict YYYY-MM-DD HH-MM-SS)<ext>`.
#[must_use]
pub fn conflict_sibling(path: &str, at: DateTime<Utc>) -> String {
    let stamp = at.format("%Y-%m-%d %H-%M-%S");
    let as_path = Path::new(path);
    let parent = as_path.parent().map(Path::to_string_lossy).unwrap_or_default();
    let stem = as_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = as_path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();

    let name = format!("{stem} (Conflict {stamp}){ext}");
    if parent.is_empty() || parent == "/" {
        format!("{parent}{name}")
    } else {
        format!("{parent}/{name}")
    }
}
