//! The per-share filesystem watcher.

use crate::debounce::Debouncer;
use crate::exclude::ExcludeSet;
use crate::{Result, WatchError, WatchEvent, WatchOp};
use notify::event::{EventKind, ModifyKind};
use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Watcher tuning knobs.
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    /// Debounce window; same-path events inside it collapse.
    pub debounce: Duration,
    /// Capacity of the bounded output channel.
    pub channel_capacity: usize,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(500),
            channel_capacity: 1024,
        }
    }
}

/// Watches one sync root and emits debounced [`WatchEvent`]s.
///
/// Every non-excluded directory holds its own non-recursive watch, so an
/// excluded directory never even registers and new directories can be
/// picked up incrementally when their create event arrives.
pub struct ShareWatcher {
    root: PathBuf,
    excludes: ExcludeSet,
    backend: Arc<Mutex<RecommendedWatcher>>,
    debouncer: Arc<Debouncer>,
    running: Arc<AtomicBool>,
    dropped_events: Arc<AtomicU64>,
}

impl ShareWatcher {
    /// Start watching `root`. Returns the watcher handle and the event
    /// channel. Must be called from within a tokio runtime; the flush
    /// task is spawned onto it.
    pub fn spawn(
        root: &Path,
        excludes: ExcludeSet,
        config: WatcherConfig,
    ) -> Result<(Self, mpsc::Receiver<WatchEvent>)> {
        if !root.is_dir() {
            return Err(WatchError::BadRoot(root.display().to_string()));
        }
        let root = root.canonicalize()?;

        let debouncer = Arc::new(Debouncer::new());
        let (tx, rx) = mpsc::channel(config.channel_capacity);

        let callback_root = root.clone();
        let callback_excludes = excludes.clone();
        let callback_debouncer = Arc::clone(&debouncer);
        let backend = RecommendedWatcher::new(
            move |result: std::result::Result<Event, notify::Error>| match result {
                Ok(event) => process_notification(
                    &event,
                    &callback_root,
                    &callback_excludes,
                    &callback_debouncer,
                ),
                Err(e) => warn!("watch backend error: {e}"),
            },
            Config::default(),
        )?;

        let watcher = Self {
            root,
            excludes,
            backend: Arc::new(Mutex::new(backend)),
            debouncer,
            running: Arc::new(AtomicBool::new(true)),
            dropped_events: Arc::new(AtomicU64::new(0)),
        };

        let registered = watcher.register_tree(&watcher.root.clone())?;
        info!(
            root = %watcher.root.display(),
            directories = registered,
            "watcher started"
        );

        watcher.spawn_flush_task(tx, config.debounce);
        Ok((watcher, rx))
    }

    /// Root being watched.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Events dropped because the output channel was full.
    #[must_use]
    pub fn dropped_events(&self) -> u64 {
        self.dropped_events.load(Ordering::Relaxed)
    }

    /// Stop the flush loop and drop pending events. Correctness after a
    /// stop relies on the next full scan.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.debouncer.clear();
    }

    /// Register non-recursive watches for `dir` and every non-excluded
    /// directory below it. Returns the number of directories registered.
    fn register_tree(&self, dir: &Path) -> Result<usize> {
        let mut count = 0;
        let root = self.root.clone();
        let excludes = self.excludes.clone();

        let walk = WalkDir::new(dir).follow_links(false).into_iter().filter_entry(|entry| {
            if !entry.file_type().is_dir() {
                return true;
            }
            match entry.path().strip_prefix(&root) {
                Ok(relative) if !relative.as_os_str().is_empty() => {
                    !excludes.is_excluded(relative)
                }
                _ => true,
            }
        });

        let mut backend = self.backend.lock();
        for entry in walk {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("enumeration error under {}: {e}", dir.display());
                    continue;
                }
            };
            if entry.file_type().is_dir() {
                match backend.watch(entry.path(), RecursiveMode::NonRecursive) {
                    Ok(()) => count += 1,
                    Err(e) => warn!("failed to watch {}: {e}", entry.path().display()),
                }
            }
        }
        Ok(count)
    }

    fn spawn_flush_task(&self, tx: mpsc::Sender<WatchEvent>, window: Duration) {
        let debouncer = Arc::clone(&self.debouncer);
        let backend = Arc::clone(&self.backend);
        let running = Arc::clone(&self.running);
        let dropped = Arc::clone(&self.dropped_events);
        let root = self.root.clone();
        let excludes = self.excludes.clone();

        tokio::spawn(async move {
            let tick = window.checked_div(2).unwrap_or(window).max(Duration::from_millis(50));
            let mut interval = tokio::time::interval(tick);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            while running.load(Ordering::SeqCst) {
                interval.tick().await;

                for event in debouncer.drain_due(window) {
                    // A new directory gets its subtree registered before
                    // the event is forwarded, so children are covered by
                    // the time the engine reacts.
                    if event.is_directory && matches!(event.op, WatchOp::Create) {
                        register_subtree(&backend, &root, &excludes, &event.path);
                    }
                    if event.is_directory && matches!(event.op, WatchOp::Remove) {
                        // Dead watches are harmless but noisy; drop them.
                        let _ = backend.lock().unwatch(&event.path);
                    }

                    match tx.try_send(event) {
                        Ok(()) => {}
                        Err(mpsc::error::TrySendError::Full(event)) => {
                            dropped.fetch_add(1, Ordering::Relaxed);
                            warn!(
                                path = %event.path.display(),
                                "event channel full, dropping event; next scan reconciles"
                            );
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => {
                            debug!("event channel closed, stopping watcher flush loop");
                            return;
                        }
                    }
                }
            }
            debug!("watcher flush loop stopped");
        });
    }
}

impl Drop for ShareWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

fn register_subtree(
    backend: &Arc<Mutex<RecommendedWatcher>>,
    root: &Path,
    excludes: &ExcludeSet,
    dir: &Path,
) {
    if !dir.is_dir() {
        return;
    }
    let walk = WalkDir::new(dir).follow_links(false).into_iter().filter_entry(|entry| {
        if !entry.file_type().is_dir() {
            return true;
        }
        match entry.path().strip_prefix(root) {
            Ok(relative) if !relative.as_os_str().is_empty() => !excludes.is_excluded(relative),
            _ => true,
        }
    });

    let mut backend = backend.lock();
    for entry in walk.flatten() {
        if entry.file_type().is_dir() {
            if let Err(e) = backend.watch(entry.path(), RecursiveMode::NonRecursive) {
                warn!("failed to watch new directory {}: {e}", entry.path().display());
            } else {
                debug!(path = %entry.path().display(), "watching new directory");
            }
        }
    }
}

fn process_notification(
    event: &Event,
    root: &Path,
    excludes: &ExcludeSet,
    debouncer: &Debouncer,
) {
    let op = match event.kind {
        EventKind::Create(_) => WatchOp::Create,
        EventKind::Modify(ModifyKind::Metadata(_)) => WatchOp::Chmod,
        EventKind::Modify(ModifyKind::Name(_)) => WatchOp::Rename,
        EventKind::Modify(_) => WatchOp::Write,
        EventKind::Remove(_) => WatchOp::Remove,
        _ => return,
    };

    for path in &event.paths {
        let relative = match path.strip_prefix(root) {
            Ok(relative) => relative,
            Err(_) => continue,
        };
        if excludes.is_excluded(relative) {
            continue;
        }

        // For removes the path is already gone and is_dir() reports false;
        // the engine treats a missing path uniformly either way.
        let is_directory = path.is_dir();
        debouncer.record(path.clone(), op, is_directory);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn recv_event(
        rx: &mut mpsc::Receiver<WatchEvent>,
        what: &str,
    ) -> WatchEvent {
        tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for {what}"))
            .expect("channel closed")
    }

    fn fast_config() -> WatcherConfig {
        WatcherConfig {
            debounce: Duration::from_millis(100),
            channel_capacity: 64,
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_create_event_surfaces() {
        let dir = tempfile::tempdir().unwrap();
        let (_watcher, mut rx) =
            ShareWatcher::spawn(dir.path(), ExcludeSet::defaults().unwrap(), fast_config())
                .unwrap();

        // Give the backend a beat to arm its watches.
        tokio::time::sleep(Duration::from_millis(200)).await;
        std::fs::write(dir.path().join("hello.txt"), b"hi").unwrap();

        let event = recv_event(&mut rx, "create of hello.txt").await;
        assert_eq!(event.path.file_name().unwrap(), "hello.txt");
        assert!(matches!(event.op, WatchOp::Create | WatchOp::Write));
        assert!(!event.is_directory);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_excluded_paths_never_surface() {
        let dir = tempfile::tempdir().unwrap();
        let (_watcher, mut rx) =
            ShareWatcher::spawn(dir.path(), ExcludeSet::defaults().unwrap(), fast_config())
                .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        std::fs::write(dir.path().join("scratch.tmp"), b"x").unwrap();
        std::fs::write(dir.path().join("kept.txt"), b"y").unwrap();

        // Only the non-excluded file arrives.
        let event = recv_event(&mut rx, "create of kept.txt").await;
        assert_eq!(event.path.file_name().unwrap(), "kept.txt");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_burst_collapses_to_single_event() {
        let dir = tempfile::tempdir().unwrap();
        let config = WatcherConfig {
            debounce: Duration::from_millis(300),
            channel_capacity: 64,
        };
        let (_watcher, mut rx) =
            ShareWatcher::spawn(dir.path(), ExcludeSet::defaults().unwrap(), config).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let path = dir.path().join("burst.txt");
        for i in 0..5 {
            std::fs::write(&path, format!("rev {i}")).unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let first = recv_event(&mut rx, "coalesced burst event").await;
        assert_eq!(first.path.file_name().unwrap(), "burst.txt");

        // No second event for the same burst.
        let second = tokio::time::timeout(Duration::from_millis(600), rx.recv()).await;
        assert!(second.is_err(), "burst produced more than one event");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_bad_root_rejected() {
        let result = ShareWatcher::spawn(
            Path::new("/definitely/not/a/real/root"),
            ExcludeSet::defaults().unwrap(),
            fast_config(),
        );
        assert!(matches!(result, Err(WatchError::BadRoot(_))));
    }
}
