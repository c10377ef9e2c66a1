//! Placeholder dehydration planning.
//!
//! Hydrated files are tracked with their last-access instant in
//! `smartsync/state.json`. The planner picks dehydration candidates with
//! a two-part predicate: under space pressure it frees the oldest files
//! first until the shortfall is covered, and independently of pressure it
//! dehydrates anything idle past the age ceiling. A young file is never
//! dehydrated when there is no pressure.

use crate::error::Result;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use tracing::debug;

/// One hydrated file the planner may dehydrate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HydratedFile {
    /// Share-relative path.
    pub path: String,
    /// Materialized byte size.
    pub size: u64,
    /// Last observed access.
    pub last_access: DateTime<Utc>,
}

/// Persisted smartsync state: hydrated paths per share.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SmartSyncState {
    /// Hydrated files keyed by `share_id`.
    #[serde(default)]
    pub shares: HashMap<String, Vec<HydratedFile>>,
}

impl SmartSyncState {
    /// Load from disk; a missing file is an empty state.
    pub fn load(path: &Path) -> Result<Self> {
        match fs::read(path) {
            Ok(data) => Ok(serde_json::from_slice(&data)
                .map_err(|e| crate::EngineError::Protocol(format!("smartsync state: {e}")))?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// Persist to disk, creating the parent directory.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_vec_pretty(self)
            .map_err(|e| crate::EngineError::Protocol(format!("smartsync state: {e}")))?;
        fs::write(path, json)?;
        Ok(())
    }

    /// Record a hydration (or refresh an access) for a path.
    pub fn touch(&mut self, share_id: &str, path: &str, size: u64) {
        let files = self.shares.entry(share_id.to_string()).or_default();
        match files.iter_mut().find(|f| f.path == path) {
            Some(file) => {
                file.size = size;
                file.last_access = Utc::now();
            }
            None => files.push(HydratedFile {
                path: path.to_string(),
                size,
                last_access: Utc::now(),
            }),
        }
    }

    /// Forget a path (dehydrated or deleted).
    pub fn forget(&mut self, share_id: &str, path: &str) {
        if let Some(files) = self.shares.get_mut(share_id) {
            files.retain(|f| f.path != path);
        }
    }

    /// Hydrated files of one share.
    #[must_use]
    pub fn hydrated(&self, share_id: &str) -> &[HydratedFile] {
        self.shares.get(share_id).map_or(&[], Vec::as_slice)
    }
}

/// Select dehydration candidates.
///
/// `needed_bytes` is the space shortfall (0 = no pressure); `max_age` is
/// the idle ceiling. A file is selected iff it is needed to cover the
/// shortfall (walking oldest-first) or it is older than the ceiling.
#[must_use]
pub fn plan_dehydration(
    files: &[HydratedFile],
    needed_bytes: u64,
    max_age: Duration,
) -> Vec<String> {
    let now = Utc::now();
    let mut by_age: Vec<&HydratedFile> = files.iter().collect();
    by_age.sort_by_key(|f| f.last_access);

    let mut selected = Vec::new();
    let mut freed = 0u64;
    for file in by_age {
        let over_age = now.signed_duration_since(file.last_access) > max_age;
        let under_pressure = needed_bytes > 0 && freed < needed_bytes;
        if under_pressure || over_age {
            freed += file.size;
            selected.push(file.path.clone());
        }
    }

    debug!(
        candidates = files.len(),
        selected = selected.len(),
        freed,
        needed = needed_bytes,
        "dehydration planned"
    );
    selected
}

/// Placeholder file contents; a dehydrated path holds this marker until
/// the next hydration download replaces it.
pub const PLACEHOLDER_MARKER: &[u8] = b"tidesync-placeholder-v1\n";

/// Whether a local file currently holds the placeholder marker.
#[must_use]
pub fn is_placeholder(path: &Path) -> bool {
    match fs::read(path) {
        Ok(data) => data == PLACEHOLDER_MARKER,
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(path: &str, size: u64, idle_days: i64) -> HydratedFile {
        HydratedFile {
            path: path.to_string(),
            size,
            last_access: Utc::now() - Duration::days(idle_days),
        }
    }

    #[test]
    fn test_no_pressure_keeps_young_files() {
        let files = vec![file("/a", 100, 1), file("/b", 100, 5)];
        let selected = plan_dehydration(&files, 0, Duration::days(30));
        assert!(selected.is_empty(), "young files dehydrated without pressure");
    }

    #[test]
    fn test_age_ceiling_applies_without_pressure() {
        let files = vec![file("/old", 100, 45), file("/young", 100, 2)];
        let selected = plan_dehydration(&files, 0, Duration::days(30));
        assert_eq!(selected, vec!["/old".to_string()]);
    }

    #[test]
    fn test_pressure_frees_oldest_first_until_satisfied() {
        let files = vec![
            file("/newest", 100, 1),
            file("/oldest", 100, 10),
            file("/middle", 100, 5),
        ];
        let selected = plan_dehydration(&files, 150, Duration::days(30));
        // 150 bytes needed: the two oldest cover it; the newest survives.
        assert_eq!(selected, vec!["/oldest".to_string(), "/middle".to_string()]);
    }

    #[test]
    fn test_pressure_and_age_combine() {
        let files = vec![
            file("/ancient", 10, 90),
            file("/old", 10, 40),
            file("/young-big", 1000, 1),
        ];
        // Pressure needs 15 bytes: /ancient + /old cover it oldest-first;
        // both are also past the ceiling; the young file stays hydrated.
        let selected = plan_dehydration(&files, 15, Duration::days(30));
        assert_eq!(selected, vec!["/ancient".to_string(), "/old".to_string()]);
    }

    #[test]
    fn test_state_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("smartsync/state.json");

        let mut state = SmartSyncState::default();
        state.touch("s1", "/a.bin", 500);
        state.touch("s1", "/b.bin", 300);
        state.touch("s1", "/a.bin", 600);
        state.save(&path).unwrap();

        let loaded = SmartSyncState::load(&path).unwrap();
        assert_eq!(loaded.hydrated("s1").len(), 2);
        assert_eq!(
            loaded.hydrated("s1").iter().find(|f| f.path == "/a.bin").unwrap().size,
            600
        );

        let mut loaded = loaded;
        loaded.forget("s1", "/a.bin");
        assert_eq!(loaded.hydrated("s1").len(), 1);
    }

    #[test]
    fn test_missing_state_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let state = SmartSyncState::load(&dir.path().join("nope.json")).unwrap();
        assert!(state.shares.is_empty());
    }
}
