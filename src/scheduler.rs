//! Periodic refresh scheduling.
//!
//! A single task ticks at the configured interval and runs the refresh job
//! on the blocking pool. Single-flight: the loop awaits the running job, and
//! missed ticks are skipped rather than queued, so at most one refresh is in
//! progress at any time. Shutdown is cooperative with a bounded wait for an
//! in-flight refresh.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// How long `stop` waits for an in-flight refresh before abandoning it.
const SHUTDOWN_WAIT: Duration = Duration::from_secs(5);

pub struct ReloadScheduler {
    handle: Mutex<Option<JoinHandle<()>>>,
    shutdown: watch::Sender<bool>,
    reloading: Arc<AtomicBool>,
}

impl ReloadScheduler {
    /// Spawn the scheduler loop. `job` runs on the blocking pool once per
    /// interval; it is expected to swallow and log its own errors.
    pub fn start(interval: Duration, job: Arc<dyn Fn() + Send + Sync>) -> Self {
        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let reloading = Arc::new(AtomicBool::new(false));
        let flag = reloading.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick of a tokio interval fires immediately; the
            // startup build already ran, so consume it.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                        flag.store(true, Ordering::SeqCst);
                        let job = job.clone();
                        let joined = tokio::task::spawn_blocking(move || job()).await;
                        flag.store(false, Ordering::SeqCst);
                        if joined.is_err() {
                            warn!("refresh job panicked");
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        break;
                    }
                }
            }
            debug!("reload scheduler loop exited");
        });

        info!("reload scheduler started (interval: {:?})", interval);
        Self {
            handle: Mutex::new(Some(handle)),
            shutdown,
            reloading,
        }
    }

    pub fn is_reloading(&self) -> bool {
        self.reloading.load(Ordering::SeqCst)
    }

    /// Signal shutdown and wait (bounded) for an in-flight refresh.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if tokio::time::timeout(SHUTDOWN_WAIT, handle).await.is_err() {
                warn!(
                    "in-flight refresh did not finish within {:?}, abandoning wait",
                    SHUTDOWN_WAIT
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn ticks_never_overlap_a_running_refresh() {
        let active = Arc::new(AtomicUsize::new(0));
        let max_active = Arc::new(AtomicUsize::new(0));
        let completed = Arc::new(AtomicUsize::new(0));

        let job = {
            let active = active.clone();
            let max_active = max_active.clone();
            let completed = completed.clone();
            Arc::new(move || {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                max_active.fetch_max(now, Ordering::SeqCst);
                // A refresh three times slower than the interval.
                std::thread::sleep(Duration::from_millis(150));
                active.fetch_sub(1, Ordering::SeqCst);
                completed.fetch_add(1, Ordering::SeqCst);
            }) as Arc<dyn Fn() + Send + Sync>
        };

        let scheduler = ReloadScheduler::start(Duration::from_millis(50), job);
        tokio::time::sleep(Duration::from_millis(600)).await;
        scheduler.stop().await;

        assert_eq!(max_active.load(Ordering::SeqCst), 1);
        // Slow refreshes drop ticks instead of queueing them, but the next
        // tick after completion still fires.
        let done = completed.load(Ordering::SeqCst);
        assert!(done >= 2, "expected at least 2 completed refreshes, got {done}");
        assert!(done <= 4, "expected dropped ticks, got {done} refreshes");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stop_prevents_further_refreshes() {
        let runs = Arc::new(AtomicUsize::new(0));
        let job = {
            let runs = runs.clone();
            Arc::new(move || {
                runs.fetch_add(1, Ordering::SeqCst);
            }) as Arc<dyn Fn() + Send + Sync>
        };

        let scheduler = ReloadScheduler::start(Duration::from_millis(30), job);
        tokio::time::sleep(Duration::from_millis(100)).await;
        scheduler.stop().await;
        let after_stop = runs.load(Ordering::SeqCst);
        assert!(after_stop >= 1);

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(runs.load(Ordering::SeqCst), after_stop);
        assert!(!scheduler.is_reloading());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn is_reloading_tracks_the_running_job() {
        let job = Arc::new(|| {
            std::thread::sleep(Duration::from_millis(120));
        }) as Arc<dyn Fn() + Send + Sync>;

        let scheduler = ReloadScheduler::start(Duration::from_millis(20), job);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(scheduler.is_reloading());
        scheduler.stop().await;
        assert!(!scheduler.is_reloading());
    }
}
