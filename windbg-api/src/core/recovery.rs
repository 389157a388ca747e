//! Session recovery
//!
//! Restores a stuck session without losing the whole process. A recovery
//! cycle escalates: cancel all queued work, interrupt the debugger, probe
//! responsiveness with a cheap command, and finally force-restart the
//! child. Concurrent cycles coalesce into one; repeated failures latch the
//! coordinator into a failed state that only an external reset clears.

use std::sync::Arc;
use std::sync::Weak;
use std::sync::atomic::{AtomicU32, Ordering};

use cdb_sdk::{DebugEngine, DriverError};
use parking_lot::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::core::command_queue::CommandQueue;
use crate::core::config::RecoveryConfig;
use crate::core::notifications::{Notification, NotificationBus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryState {
    /// Nothing in flight
    Healthy,
    /// A recovery cycle is running
    Recovering,
    /// The last cycle gave up; the session must be closed and recreated
    Failed,
}

pub struct RecoveryCoordinator {
    session_id: String,
    engine: Arc<dyn DebugEngine>,
    bus: Arc<NotificationBus>,
    config: RecoveryConfig,
    state: Mutex<RecoveryState>,
    /// Serializes cycles; concurrent `recover` calls coalesce on this lock
    cycle: tokio::sync::Mutex<()>,
    attempts: AtomicU32,
    last_probe: Mutex<Option<(Instant, bool)>>,
    last_outcome: Mutex<bool>,
    queue: Mutex<Option<Weak<CommandQueue>>>,
}

impl RecoveryCoordinator {
    pub fn new(
        session_id: impl Into<String>,
        engine: Arc<dyn DebugEngine>,
        bus: Arc<NotificationBus>,
        config: RecoveryConfig,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            engine,
            bus,
            config,
            state: Mutex::new(RecoveryState::Healthy),
            cycle: tokio::sync::Mutex::new(()),
            attempts: AtomicU32::new(0),
            last_probe: Mutex::new(None),
            last_outcome: Mutex::new(true),
            queue: Mutex::new(None),
        }
    }

    /// Late-bind the queue this coordinator cancels during a cycle. The
    /// session owns both; only a weak reference crosses the seam.
    pub fn bind_queue(&self, queue: &Arc<CommandQueue>) {
        *self.queue.lock() = Some(Arc::downgrade(queue));
    }

    pub fn state(&self) -> RecoveryState {
        *self.state.lock()
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// External reset after the caller replaced or repaired the session.
    pub fn reset(&self) {
        self.attempts.store(0, Ordering::SeqCst);
        *self.state.lock() = RecoveryState::Healthy;
        *self.last_probe.lock() = None;
        *self.last_outcome.lock() = true;
    }

    /// Whether the session can take a command right now. Probing is
    /// rate-limited: results are cached for the configured window so a busy
    /// queue does not turn every command into two.
    pub async fn is_healthy(&self) -> bool {
        if *self.state.lock() == RecoveryState::Failed {
            return false;
        }
        if self.attempts.load(Ordering::SeqCst) > self.config.max_attempts {
            return false;
        }
        if !self.engine.is_active() {
            return false;
        }

        if let Some((at, ok)) = *self.last_probe.lock()
            && at.elapsed() < self.config.health_cache()
        {
            return ok;
        }

        let ok = self.probe().await;
        *self.last_probe.lock() = Some((Instant::now(), ok));
        ok
    }

    /// Cheap responsiveness check: the probe command must return non-empty
    /// output within its own short timeout.
    async fn probe(&self) -> bool {
        let token = CancellationToken::new();
        let run = self.engine.execute(&self.config.probe_command, &token);
        match tokio::time::timeout(self.config.probe_timeout(), run).await {
            Ok(Ok(output)) => !output.trim().is_empty(),
            // A busy driver is a live driver
            Ok(Err(DriverError::Busy)) => true,
            Ok(Err(_)) => false,
            Err(_) => {
                token.cancel();
                false
            },
        }
    }

    /// Run one recovery cycle. Returns true when the session is usable
    /// again. Concurrent invocations coalesce: late callers wait for the
    /// running cycle and adopt its outcome.
    pub async fn recover(&self, reason: &str) -> bool {
        let guard = match self.cycle.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                let _guard = self.cycle.lock().await;
                return *self.last_outcome.lock();
            },
        };

        let outcome = self.run_cycle(reason).await;
        *self.last_outcome.lock() = outcome;
        drop(guard);
        outcome
    }

    async fn run_cycle(&self, reason: &str) -> bool {
        if *self.state.lock() == RecoveryState::Failed {
            return false;
        }
        *self.state.lock() = RecoveryState::Recovering;
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        info!(
            "Recovery cycle {} for session {}: {}",
            attempt, self.session_id, reason
        );
        self.bus
            .publish(Notification::session_recovery(&self.session_id, "started", reason));

        // 1. Clear the queue so nothing piles up behind a wedged command
        if let Some(queue) = self.queue.lock().clone()
            && let Some(queue) = queue.upgrade()
        {
            let cancelled = queue.cancel_all(reason);
            if cancelled > 0 {
                info!("Recovery cancelled {} commands", cancelled);
            }
        }

        // 2. Interrupt whatever the debugger is chewing on
        self.engine.cancel_current();
        tokio::time::sleep(self.config.interrupt_wait()).await;

        // 3. Probe
        if self.probe().await {
            info!("Session {} responsive after interrupt", self.session_id);
            self.attempts.store(0, Ordering::SeqCst);
            *self.last_probe.lock() = Some((Instant::now(), true));
            *self.state.lock() = RecoveryState::Healthy;
            self.bus.publish(Notification::session_recovery(
                &self.session_id,
                "recovered",
                reason,
            ));
            return true;
        }

        // 4. Force restart
        warn!(
            "Session {} unresponsive, force-restarting debugger",
            self.session_id
        );
        match self.engine.stop().await {
            Ok(_) => {
                tokio::time::sleep(std::time::Duration::from_millis(500)).await;
                if !self.engine.is_active() {
                    *self.last_probe.lock() = None;
                    *self.state.lock() = RecoveryState::Healthy;
                    self.bus.publish(Notification::session_recovery(
                        &self.session_id,
                        "restarted",
                        reason,
                    ));
                    true
                } else {
                    *self.state.lock() = RecoveryState::Failed;
                    self.bus.publish(Notification::session_recovery(
                        &self.session_id,
                        "failed",
                        reason,
                    ));
                    false
                }
            },
            Err(e) => {
                warn!("Force restart failed for session {}: {}", self.session_id, e);
                *self.state.lock() = RecoveryState::Failed;
                self.bus.publish(Notification::session_recovery(
                    &self.session_id,
                    "failed",
                    reason,
                ));
                false
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use cdb_sdk::{Result as DriverResult, Target};
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::time::Duration;

    /// Engine with dial-a-behavior responses for state-machine tests.
    struct StubEngine {
        active: AtomicBool,
        probe_ok: AtomicBool,
        stop_fails: AtomicBool,
        interrupts: AtomicUsize,
        stops: AtomicUsize,
    }

    impl StubEngine {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                active: AtomicBool::new(true),
                probe_ok: AtomicBool::new(true),
                stop_fails: AtomicBool::new(false),
                interrupts: AtomicUsize::new(0),
                stops: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl DebugEngine for StubEngine {
        async fn start(&self, _target: &Target) -> DriverResult<()> {
            self.active.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn execute(
            &self,
            _command: &str,
            _cancel: &tokio_util::sync::CancellationToken,
        ) -> DriverResult<String> {
            if !self.active.load(Ordering::SeqCst) {
                return Err(DriverError::invalid_state("not active"));
            }
            if self.probe_ok.load(Ordering::SeqCst) {
                Ok("responsive".to_string())
            } else {
                // Alive but useless: empty output fails the probe check
                Ok(String::new())
            }
        }

        fn cancel_current(&self) {
            self.interrupts.fetch_add(1, Ordering::SeqCst);
        }

        async fn stop(&self) -> DriverResult<bool> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            if self.stop_fails.load(Ordering::SeqCst) {
                return Err(DriverError::invalid_state("refusing to die"));
            }
            self.active.store(false, Ordering::SeqCst);
            Ok(true)
        }

        fn is_active(&self) -> bool {
            self.active.load(Ordering::SeqCst)
        }
    }

    fn coordinator(
        engine: Arc<StubEngine>,
        health_cache_secs: u64,
    ) -> (Arc<RecoveryCoordinator>, Arc<NotificationBus>) {
        let bus = Arc::new(NotificationBus::new(64));
        let config = RecoveryConfig {
            interrupt_wait_ms: 20,
            probe_command: "version".to_string(),
            probe_timeout_ms: 500,
            max_attempts: 3,
            health_cache_secs,
        };
        (
            Arc::new(RecoveryCoordinator::new(
                "s-recovery",
                engine as Arc<dyn DebugEngine>,
                bus.clone(),
                config,
            )),
            bus,
        )
    }

    #[tokio::test]
    async fn test_healthy_engine_passes_gate() {
        let engine = StubEngine::new();
        let (recovery, _bus) = coordinator(engine, 30);
        assert!(recovery.is_healthy().await);
        assert_eq!(recovery.state(), RecoveryState::Healthy);
    }

    #[tokio::test]
    async fn test_inactive_engine_fails_gate() {
        let engine = StubEngine::new();
        engine.active.store(false, Ordering::SeqCst);
        let (recovery, _bus) = coordinator(engine, 30);
        assert!(!recovery.is_healthy().await);
    }

    #[tokio::test]
    async fn test_health_probe_is_cached() {
        let engine = StubEngine::new();
        let (recovery, _bus) = coordinator(engine.clone(), 30);
        assert!(recovery.is_healthy().await);

        // The engine degrades, but the cached verdict stands inside the window
        engine.probe_ok.store(false, Ordering::SeqCst);
        assert!(recovery.is_healthy().await);
    }

    #[tokio::test]
    async fn test_health_probe_without_cache_sees_degradation() {
        let engine = StubEngine::new();
        let (recovery, _bus) = coordinator(engine.clone(), 0);
        assert!(recovery.is_healthy().await);

        engine.probe_ok.store(false, Ordering::SeqCst);
        assert!(!recovery.is_healthy().await);
    }

    #[tokio::test]
    async fn test_recover_via_probe_resets_attempts() {
        let engine = StubEngine::new();
        let (recovery, _bus) = coordinator(engine.clone(), 30);

        assert!(recovery.recover("stall suspected").await);
        assert_eq!(recovery.state(), RecoveryState::Healthy);
        assert_eq!(recovery.attempts(), 0);
        assert_eq!(engine.interrupts.load(Ordering::SeqCst), 1);
        assert_eq!(engine.stops.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_recover_escalates_to_force_restart() {
        let engine = StubEngine::new();
        engine.probe_ok.store(false, Ordering::SeqCst);
        let (recovery, bus) = coordinator(engine.clone(), 0);
        let mut rx = bus.subscribe();

        assert!(recovery.recover("wedged command").await);
        assert_eq!(recovery.state(), RecoveryState::Healthy);
        assert_eq!(engine.stops.load(Ordering::SeqCst), 1);
        assert!(!engine.is_active());

        let mut phases = Vec::new();
        while let Ok(Ok(n)) =
            tokio::time::timeout(Duration::from_millis(200), rx.recv()).await
        {
            if n.method == "sessionRecovery" {
                phases.push(n.params["phase"].as_str().unwrap_or_default().to_string());
            }
        }
        assert_eq!(phases, vec!["started", "restarted"]);
    }

    #[tokio::test]
    async fn test_failed_restart_latches_failed_state() {
        let engine = StubEngine::new();
        engine.probe_ok.store(false, Ordering::SeqCst);
        engine.stop_fails.store(true, Ordering::SeqCst);
        let (recovery, _bus) = coordinator(engine.clone(), 0);

        assert!(!recovery.recover("wedged command").await);
        assert_eq!(recovery.state(), RecoveryState::Failed);
        assert!(!recovery.is_healthy().await);

        // Further cycles refuse to run until an external reset
        assert!(!recovery.recover("still wedged").await);
        assert_eq!(engine.stops.load(Ordering::SeqCst), 1);

        recovery.reset();
        assert_eq!(recovery.state(), RecoveryState::Healthy);
        assert_eq!(recovery.attempts(), 0);
    }

    #[tokio::test]
    async fn test_attempt_ceiling_blocks_health() {
        let engine = StubEngine::new();
        engine.probe_ok.store(false, Ordering::SeqCst);
        let (recovery, _bus) = coordinator(engine.clone(), 0);

        // Each cycle force-restarts without resetting the attempt counter;
        // restart the engine in between so only the counter accumulates.
        for _ in 0..4 {
            assert!(recovery.recover("flapping").await);
            engine.start(&Target::dump_file("/tmp/x.dmp")).await.unwrap();
        }
        assert_eq!(recovery.attempts(), 4);
        assert!(!recovery.is_healthy().await);
    }

    #[tokio::test]
    async fn test_concurrent_recover_calls_coalesce() {
        let engine = StubEngine::new();
        let (recovery, _bus) = coordinator(engine.clone(), 30);

        let a = {
            let recovery = recovery.clone();
            tokio::spawn(async move { recovery.recover("first caller").await })
        };
        let b = {
            let recovery = recovery.clone();
            tokio::spawn(async move { recovery.recover("second caller").await })
        };

        assert!(a.await.unwrap());
        assert!(b.await.unwrap());
        // One cycle ran: a single interrupt, counter bumped once then reset
        assert!(engine.interrupts.load(Ordering::SeqCst) <= 2);
        assert_eq!(recovery.attempts(), 0);
    }
}
