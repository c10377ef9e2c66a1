//! Terminal progress rendering for foreground syncs.

use indicatif::{ProgressBar, ProgressStyle};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tidesync_core::{EngineEvent, ObserverHandle, SyncEngine};

/// Human-readable byte count.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

struct ProgressObserver {
    bars: Mutex<HashMap<String, ProgressBar>>,
}

impl tidesync_core::EngineObserver for ProgressObserver {
    fn on_event(&self, event: &EngineEvent) {
        match event {
            EngineEvent::Progress { path, transferred, total, .. } => {
                let mut bars = match self.bars.lock() {
                    Ok(bars) => bars,
                    Err(_) => return,
                };
                let bar = bars.entry(path.clone()).or_insert_with(|| {
                    let bar = ProgressBar::new(*total);
                    bar.set_style(
                        ProgressStyle::with_template(
                            "{msg:30!} [{bar:30}] {bytes}/{total_bytes}",
                        )
                        .unwrap_or_else(|_| ProgressStyle::default_bar()),
                    );
                    bar.set_message(path.clone());
                    bar
                });
                bar.set_position(*transferred);
            }
            EngineEvent::ItemSynced { path, action, bytes, .. } => {
                if let Ok(mut bars) = self.bars.lock() {
                    if let Some(bar) = bars.remove(path) {
                        bar.finish_and_clear();
                    }
                }
                println!("{action:<10} {path} ({})", format_bytes(*bytes));
            }
            EngineEvent::ConflictDetected { path, .. } => {
                println!("conflict   {path}");
            }
            EngineEvent::ItemError { path, message, .. } => {
                eprintln!("error      {path}: {message}");
            }
            _ => {}
        }
    }
}

/// Attach a progress renderer; events stop rendering when the returned
/// handle drops.
pub fn attach(engine: &Arc<SyncEngine>) -> ObserverHandle {
    engine.subscribe(Arc::new(ProgressObserver { bars: Mutex::new(HashMap::new()) }))
}
