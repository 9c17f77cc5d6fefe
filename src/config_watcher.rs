//! Config-file hot reload.
//!
//! Watches the directory holding the config file (editors typically replace
//! the file rather than writing in place) and invokes the callback on
//! debounced create/modify events that touch it.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use notify::{EventKind, RecursiveMode};
use notify_debouncer_full::{DebounceEventResult, new_debouncer};
use tracing::{info, warn};

const DEBOUNCE_MS: u64 = 500;

pub struct ConfigWatcher {
    _debouncer: notify_debouncer_full::Debouncer<
        notify::RecommendedWatcher,
        notify_debouncer_full::RecommendedCache,
    >,
}

impl ConfigWatcher {
    pub fn start(
        config_path: &Path,
        on_change: Arc<dyn Fn() + Send + Sync>,
    ) -> Result<Self, notify::Error> {
        let watched = config_path.to_path_buf();
        let watch_dir = config_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| watched.clone());

        let target = watched.clone();
        let mut debouncer = new_debouncer(
            Duration::from_millis(DEBOUNCE_MS),
            None,
            move |result: DebounceEventResult| match result {
                Ok(events) => {
                    let touched = events.iter().any(|event| {
                        matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_))
                            && event.paths.iter().any(|p| p == &target)
                    });
                    if touched {
                        info!("config file changed: {}", target.display());
                        on_change();
                    }
                }
                Err(errors) => {
                    for e in errors {
                        warn!("config watcher error: {:?}", e);
                    }
                }
            },
        )?;

        debouncer.watch(&watch_dir, RecursiveMode::NonRecursive)?;
        info!("watching config file {}", watched.display());
        Ok(Self {
            _debouncer: debouncer,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn fires_on_config_file_rewrite() {
        let tmp = TempDir::new().unwrap();
        let config = tmp.path().join("config.yaml");
        std::fs::write(&config, "server:\n  port: 8765\n").unwrap();

        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let _watcher = ConfigWatcher::start(
            &config,
            Arc::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        std::fs::write(&config, "server:\n  port: 9000\n").unwrap();

        // Debounce plus filesystem latency: poll generously.
        for _ in 0..40 {
            if fired.load(Ordering::SeqCst) > 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        panic!("config change never observed");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn ignores_sibling_files() {
        let tmp = TempDir::new().unwrap();
        let config = tmp.path().join("config.yaml");
        std::fs::write(&config, "server: {}\n").unwrap();

        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let _watcher = ConfigWatcher::start(
            &config,
            Arc::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        std::fs::write(tmp.path().join("other.txt"), "noise").unwrap();
        tokio::time::sleep(Duration::from_millis(1200)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
