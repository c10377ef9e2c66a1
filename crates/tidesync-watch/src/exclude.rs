//! Exclude-pattern matching.
//!
//! Patterns are globs with `**` meaning any depth, matched against
//! root-relative paths. A directory match prunes its whole subtree.

use crate::{Result, WatchError};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::Path;

/// Patterns excluded from every share regardless of configuration.
pub const DEFAULT_EXCLUDES: &[&str] = &[
    "**/.git/**",
    "**/.git",
    "**/node_modules/**",
    "**/.DS_Store",
    "**/Thumbs.db",
    "**/*.tmp",
    "**/*.swp",
    "**/*~",
    "**/.tidesync-tmp-*",
];

/// Compiled exclude patterns for one share.
#[derive(Debug, Clone)]
pub struct ExcludeSet {
    set: GlobSet,
}

impl ExcludeSet {
    /// Compile the built-in defaults plus share-specific patterns.
    pub fn new(patterns: &[String]) -> Result<Self> {
        let mut builder = GlobSetBuilder::new();
        for pattern in DEFAULT_EXCLUDES.iter().copied().map(str::to_string).chain(patterns.iter().cloned()) {
            let glob = Glob::new(&pattern).map_err(|e| WatchError::Pattern {
                pattern: pattern.clone(),
                message: e.to_string(),
            })?;
            builder.add(glob);
        }
        let set = builder.build().map_err(|e| WatchError::Pattern {
            pattern: "<set>".to_string(),
            message: e.to_string(),
        })?;
        Ok(Self { set })
    }

    /// Compile only the built-in defaults.
    pub fn defaults() -> Result<Self> {
        Self::new(&[])
    }

    /// Whether a root-relative path is excluded.
    ///
    /// A path is excluded when it matches directly or when any ancestor
    /// component matches, so `build/` style directory patterns prune the
    /// whole subtree.
    #[must_use]
    pub fn is_excluded(&self, relative: &Path) -> bool {
        if self.set.is_match(relative) {
            return true;
        }
        relative.ancestors().skip(1).any(|ancestor| {
            !ancestor.as_os_str().is_empty() && self.set.is_match(ancestor)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn test_default_patterns() {
        let set = ExcludeSet::defaults().unwrap();
        assert!(set.is_excluded(Path::new(".git/config")));
        assert!(set.is_excluded(Path::new("src/.git/HEAD")));
        assert!(set.is_excluded(Path::new("notes.tmp")));
        assert!(set.is_excluded(Path::new("deep/nested/file.swp")));
        assert!(!set.is_excluded(Path::new("notes.txt")));
        assert!(!set.is_excluded(Path::new("src/main.rs")));
    }

    #[test]
    fn test_share_patterns_any_depth() {
        let set = ExcludeSet::new(&["**/build/**".to_string(), "*.iso".to_string()]).unwrap();
        assert!(set.is_excluded(Path::new("a/build/out.o")));
        assert!(set.is_excluded(Path::new("disk.iso")));
        assert!(!set.is_excluded(Path::new("a/built/out.o")));
    }

    #[test]
    fn test_directory_match_prunes_subtree() {
        let set = ExcludeSet::new(&["cache".to_string()]).unwrap();
        assert!(set.is_excluded(Path::new("cache")));
        assert!(set.is_excluded(Path::new("cache/entry/deep.bin")));
        assert!(!set.is_excluded(Path::new("cachet/file")));
    }

    #[test]
    fn test_bad_pattern_is_reported() {
        let err = ExcludeSet::new(&["[".to_string()]).unwrap_err();
        assert!(matches!(err, WatchError::Pattern { .. }));
    }

    #[test]
    fn test_temp_sibling_prefix_excluded() {
        let set = ExcludeSet::defaults().unwrap();
        assert!(set.is_excluded(Path::new("docs/.tidesync-tmp-a1b2")));
    }
}
