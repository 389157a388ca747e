//! Named, cancellable, extendable timers
//!
//! One armed entry per command id. Arming replaces any existing entry
//! (last writer wins), cancelling removes it, extending rearms with the
//! original callback and start time. Callbacks fire at most once and run
//! fire-and-forget on their own task.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

/// Async callback invoked on expiry.
pub type TimeoutCallback = Arc<dyn Fn(Uuid) -> BoxFuture<'static, ()> + Send + Sync>;

struct TimeoutEntry {
    generation: u64,
    cancel: CancellationToken,
    callback: TimeoutCallback,
    started_at: Instant,
}

/// Per-session timer table.
pub struct TimeoutService {
    entries: Arc<Mutex<HashMap<Uuid, TimeoutEntry>>>,
    generation: Mutex<u64>,
    shutdown: CancellationToken,
}

impl TimeoutService {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            generation: Mutex::new(0),
            shutdown: CancellationToken::new(),
        }
    }

    /// Arm (or re-arm) the timer for `id`. On expiry the callback runs
    /// exactly once and the entry is removed.
    pub fn arm(&self, id: Uuid, duration: Duration, callback: TimeoutCallback) {
        self.arm_from(id, duration, callback, Instant::now());
    }

    fn arm_from(&self, id: Uuid, duration: Duration, callback: TimeoutCallback, started_at: Instant) {
        if self.shutdown.is_cancelled() {
            warn!("Timeout service is shut down; not arming timer for {}", id);
            return;
        }

        let generation = {
            let mut generation = self.generation.lock();
            *generation += 1;
            *generation
        };

        let cancel = CancellationToken::new();
        let entry = TimeoutEntry {
            generation,
            cancel: cancel.clone(),
            callback: callback.clone(),
            started_at,
        };

        // Replacing an armed entry stops its timer
        if let Some(old) = self.entries.lock().insert(id, entry) {
            old.cancel.cancel();
        }

        let entries = self.entries.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {},
                _ = shutdown.cancelled() => {},
                _ = tokio::time::sleep(duration) => {
                    // Only the current incarnation may fire
                    let fire = {
                        let mut entries = entries.lock();
                        match entries.get(&id) {
                            Some(entry) if entry.generation == generation => {
                                entries.remove(&id);
                                true
                            },
                            _ => false,
                        }
                    };
                    if fire {
                        debug!("Timer fired for {}", id);
                        callback(id).await;
                    }
                },
            }
        });
    }

    /// Stop and remove the timer for `id`. Returns true if one was armed.
    pub fn cancel(&self, id: Uuid) -> bool {
        match self.entries.lock().remove(&id) {
            Some(entry) => {
                entry.cancel.cancel();
                true
            },
            None => false,
        }
    }

    /// Re-arm `id` for `additional` past now, preserving the original
    /// callback and start time. Returns false if nothing was armed.
    pub fn extend(&self, id: Uuid, additional: Duration) -> bool {
        let (callback, started_at) = {
            let entries = self.entries.lock();
            match entries.get(&id) {
                Some(entry) => (entry.callback.clone(), entry.started_at),
                None => return false,
            }
        };
        self.arm_from(id, additional, callback, started_at);
        true
    }

    /// How long ago the entry for `id` was first armed.
    pub fn elapsed(&self, id: Uuid) -> Option<Duration> {
        self.entries
            .lock()
            .get(&id)
            .map(|entry| entry.started_at.elapsed())
    }

    /// Number of armed timers.
    pub fn armed_count(&self) -> usize {
        self.entries.lock().len()
    }

    /// Cancel every outstanding timer and refuse new ones.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        let mut entries = self.entries.lock();
        for (_, entry) in entries.drain() {
            entry.cancel.cancel();
        }
    }
}

impl Default for TimeoutService {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_callback(counter: Arc<AtomicUsize>) -> TimeoutCallback {
        Arc::new(move |_id| {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            })
        })
    }

    #[tokio::test]
    async fn test_timer_fires_once() {
        let service = TimeoutService::new();
        let fired = Arc::new(AtomicUsize::new(0));

        service.arm(
            Uuid::new_v4(),
            Duration::from_millis(50),
            counting_callback(fired.clone()),
        );

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(service.armed_count(), 0);
    }

    #[tokio::test]
    async fn test_cancel_prevents_firing() {
        let service = TimeoutService::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let id = Uuid::new_v4();

        service.arm(id, Duration::from_millis(50), counting_callback(fired.clone()));
        assert!(service.cancel(id));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(!service.cancel(id));
    }

    #[tokio::test]
    async fn test_rearm_replaces_previous_timer() {
        let service = TimeoutService::new();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        let id = Uuid::new_v4();

        service.arm(id, Duration::from_millis(50), counting_callback(first.clone()));
        service.arm(id, Duration::from_millis(100), counting_callback(second.clone()));

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(first.load(Ordering::SeqCst), 0, "replaced timer must not fire");
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_extend_preserves_callback_and_start() {
        let service = TimeoutService::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let id = Uuid::new_v4();

        service.arm(id, Duration::from_millis(80), counting_callback(fired.clone()));
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(service.extend(id, Duration::from_millis(200)));

        // The original deadline passes without firing
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        // Elapsed time still counts from the original arm
        let elapsed = service.elapsed(id).unwrap();
        assert!(elapsed >= Duration::from_millis(100));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_extend_unknown_id_returns_false() {
        let service = TimeoutService::new();
        assert!(!service.extend(Uuid::new_v4(), Duration::from_millis(50)));
    }

    #[tokio::test]
    async fn test_shutdown_cancels_everything() {
        let service = TimeoutService::new();
        let fired = Arc::new(AtomicUsize::new(0));

        for _ in 0..5 {
            service.arm(
                Uuid::new_v4(),
                Duration::from_millis(50),
                counting_callback(fired.clone()),
            );
        }
        service.shutdown();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(service.armed_count(), 0);

        // Arming after shutdown is refused
        service.arm(
            Uuid::new_v4(),
            Duration::from_millis(10),
            counting_callback(fired.clone()),
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
