//! Local filesystem helpers: atomic writes and streaming hashes.

use crate::error::Result;
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Temp sibling used for atomic replacement. The prefix is in the
/// default exclude set so the watcher never reports these.
fn temp_sibling(target: &Path) -> PathBuf {
    let seq = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    let pid = std::process::id();
    let name = format!(".tidesync-tmp-{pid}-{seq}");
    match target.parent() {
        Some(parent) => parent.join(name),
        None => PathBuf::from(name),
    }
}

/// Write `bytes` to `target` atomically: temp sibling, flush, rename.
/// No observer ever sees a partial file at the target path.
pub fn atomic_write(target: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = temp_sibling(target);
    let result = (|| {
        let mut file = File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&tmp, target)?;
        Ok(())
    })();
    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

/// Streaming SHA-256 of a file, lowercase hex.
pub fn hash_file(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 128 * 1024];
    loop {
        let n = file.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// SHA-256 of in-memory bytes, lowercase hex.
#[must_use]
pub fn hash_bytes(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Remove a file, treating "already gone" as success.
pub fn remove_file_idempotent(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Remove a path of either kind, treating "already gone" as success.
pub fn remove_path_idempotent(path: &Path) -> Result<()> {
    if path.is_dir() {
        match fs::remove_dir_all(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    } else {
        remove_file_idempotent(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_atomic_write_creates_parents() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("a/b/c.txt");
        atomic_write(&target, b"content").unwrap();
        assert_eq!(fs::read(&target).unwrap(), b"content");
    }

    #[test]
    fn test_atomic_write_replaces() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("f.txt");
        atomic_write(&target, b"one").unwrap();
        atomic_write(&target, b"two").unwrap();
        assert_eq!(fs::read(&target).unwrap(), b"two");

        // No temp siblings left behind.
        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(".tidesync-tmp-"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_hash_file_matches_hash_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data");
        fs::write(&path, b"hi").unwrap();
        assert_eq!(hash_file(&path).unwrap(), hash_bytes(b"hi"));
        assert_eq!(
            hash_file(&path).unwrap(),
            "8f434346648f6b96df89dda901c5176b10a6d83961dd3c1ac88b59b2dc327aa4"
        );
    }

    #[test]
    fn test_remove_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ghost");
        remove_file_idempotent(&path).unwrap();
        fs::write(&path, b"x").unwrap();
        remove_file_idempotent(&path).unwrap();
        assert!(!path.exists());

        let sub = dir.path().join("tree/deep");
        fs::create_dir_all(&sub).unwrap();
        remove_path_idempotent(&dir.path().join("tree")).unwrap();
        remove_path_idempotent(&dir.path().join("tree")).unwrap();
    }
}
