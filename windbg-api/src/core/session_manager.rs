//! Session lifecycle owner
//!
//! Creates sessions under a capacity check, routes lookups by id, expires
//! idle sessions on a sweeper, and tears everything down with a bounded
//! budget at shutdown. The session map is a concurrent map with lock-free
//! reads; inserts are serialized only while the size limit is checked.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use cdb_sdk::{CdbDriver, DebugEngine, Target};
use chrono::Utc;
use dashmap::DashMap;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::core::config::{DebuggingConfig, QueueConfig, RecoveryConfig, SessionConfig};
use crate::core::notifications::{Notification, NotificationBus};
use crate::core::session::{Session, SessionContext, SessionStatus};

/// Why a session could not be created.
#[derive(Debug, thiserror::Error)]
pub enum CreateSessionError {
    #[error("target must not be empty")]
    InvalidTarget,
    #[error("session limit exceeded ({current}/{max})")]
    LimitExceeded { current: usize, max: usize },
    #[error("failed to start debugger: {0}")]
    StartFailed(String),
}

/// Builds one engine per session; injected so tests can supply scripted
/// engines instead of real subprocesses.
pub type EngineFactory =
    Arc<dyn Fn(&Target, Option<&str>) -> Arc<dyn DebugEngine> + Send + Sync>;

/// Counter snapshot for the stats surface.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatistics {
    pub active_sessions: usize,
    pub sessions_created: u64,
    pub sessions_closed: u64,
    pub sessions_expired: u64,
    pub commands_processed: u64,
    pub average_session_lifetime_secs: u64,
    pub memory_bytes: u64,
    pub uptime_secs: u64,
}

struct ManagerCounters {
    created: AtomicU64,
    closed: AtomicU64,
    expired: AtomicU64,
    retired_commands: AtomicU64,
    total_lifetime_secs: AtomicU64,
}

pub struct SessionManager {
    sessions: DashMap<String, Arc<Session>>,
    /// Held only across the capacity check and reservation insert
    creation_lock: tokio::sync::Mutex<()>,
    engine_factory: EngineFactory,
    bus: Arc<NotificationBus>,
    session_config: SessionConfig,
    queue_config: QueueConfig,
    recovery_config: RecoveryConfig,
    counters: ManagerCounters,
    started_at: Instant,
    shutdown: CancellationToken,
    sweeper: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl SessionManager {
    /// Manager over real subprocess drivers.
    pub fn new(
        debugging: DebuggingConfig,
        session_config: SessionConfig,
        queue_config: QueueConfig,
        recovery_config: RecoveryConfig,
        bus: Arc<NotificationBus>,
    ) -> Arc<Self> {
        let factory: EngineFactory = Arc::new(move |_target, symbols| {
            Arc::new(CdbDriver::new(debugging.driver_options(symbols))) as Arc<dyn DebugEngine>
        });
        Self::with_engine_factory(factory, session_config, queue_config, recovery_config, bus)
    }

    /// Manager over an injected engine factory.
    pub fn with_engine_factory(
        engine_factory: EngineFactory,
        session_config: SessionConfig,
        queue_config: QueueConfig,
        recovery_config: RecoveryConfig,
        bus: Arc<NotificationBus>,
    ) -> Arc<Self> {
        let manager = Arc::new(Self {
            sessions: DashMap::new(),
            creation_lock: tokio::sync::Mutex::new(()),
            engine_factory,
            bus,
            session_config,
            queue_config,
            recovery_config,
            counters: ManagerCounters {
                created: AtomicU64::new(0),
                closed: AtomicU64::new(0),
                expired: AtomicU64::new(0),
                retired_commands: AtomicU64::new(0),
                total_lifetime_secs: AtomicU64::new(0),
            },
            started_at: Instant::now(),
            shutdown: CancellationToken::new(),
            sweeper: parking_lot::Mutex::new(None),
        });

        let sweeper = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.sweeper_loop().await })
        };
        *manager.sweeper.lock() = Some(sweeper);

        manager
    }

    /// Create a session: enforce the cap, assemble the components, start
    /// the debugger. On start failure everything is torn down and the map
    /// is left untouched.
    pub async fn create(
        &self,
        target: &str,
        symbols_path: Option<&str>,
    ) -> Result<String, CreateSessionError> {
        let target = Target::parse(target).ok_or(CreateSessionError::InvalidTarget)?;

        let session = {
            let _guard = self.creation_lock.lock().await;
            let current = self.sessions.len();
            let max = self.session_config.max_concurrent_sessions;
            if current >= max {
                return Err(CreateSessionError::LimitExceeded { current, max });
            }

            let id = Uuid::new_v4().to_string();
            let engine = (self.engine_factory)(&target, symbols_path);
            let session = Session::assemble(
                id,
                target,
                symbols_path.map(String::from),
                engine,
                self.bus.clone(),
                self.queue_config.clone(),
                self.recovery_config.clone(),
            );
            self.sessions.insert(session.id.clone(), session.clone());
            session
        };

        match session.engine.start(&session.target).await {
            Ok(()) => {
                session.set_status(SessionStatus::Active);
                self.counters.created.fetch_add(1, Ordering::SeqCst);
                self.bus.publish(Notification::session_event(
                    &session.id,
                    "created",
                    &session.target.describe(),
                ));
                info!(
                    "Created session {} for target {}",
                    session.id,
                    session.target.describe()
                );
                Ok(session.id.clone())
            },
            Err(e) => {
                error!("Debugger start failed for {}: {}", session.target.describe(), e);
                session.set_status(SessionStatus::Error);
                self.sessions.remove(&session.id);
                session.queue.dispose("Session failed to start").await;
                session.timeouts.shutdown();
                let _ = session.engine.stop().await;
                Err(CreateSessionError::StartFailed(e.to_string()))
            },
        }
    }

    /// Look up a session and record the activity. Closed ids return `None`.
    pub fn get(&self, session_id: &str) -> Option<Arc<Session>> {
        let session = self.sessions.get(session_id).map(|e| e.value().clone())?;
        session.touch();
        Some(session)
    }

    /// Atomic remove-or-noop close. Returns true iff the session existed.
    pub async fn close(&self, session_id: &str) -> bool {
        let Some((_, session)) = self.sessions.remove(session_id) else {
            return false;
        };
        self.dispose_session(session, "Session closing").await;
        self.counters.closed.fetch_add(1, Ordering::SeqCst);
        true
    }

    /// Queue-then-driver teardown with a bounded grace for the driver.
    async fn dispose_session(&self, session: Arc<Session>, reason: &str) {
        session.set_status(SessionStatus::Disposing);

        session.queue.dispose(reason).await;
        session.timeouts.shutdown();

        let budget = self.session_config.disposal_timeout();
        match tokio::time::timeout(budget, session.engine.stop()).await {
            Ok(Ok(graceful)) => {
                if !graceful {
                    warn!("Session {} debugger was force-killed", session.id);
                }
            },
            Ok(Err(e)) => warn!("Session {} debugger stop failed: {}", session.id, e),
            Err(_) => warn!(
                "Session {} debugger stop exceeded {:?}",
                session.id, budget
            ),
        }

        session.set_status(SessionStatus::Disposed);
        self.counters
            .retired_commands
            .fetch_add(session.queue.processed(), Ordering::SeqCst);
        let lifetime = (Utc::now() - session.created_at).num_seconds().max(0) as u64;
        self.counters
            .total_lifetime_secs
            .fetch_add(lifetime, Ordering::SeqCst);
        self.bus.publish(Notification::session_event(
            &session.id,
            "closed",
            &session.target.describe(),
        ));
        info!("Closed session {}", session.id);
    }

    /// Shallow projections of every live session.
    pub fn list(&self) -> Vec<SessionContext> {
        let mut contexts: Vec<SessionContext> =
            self.sessions.iter().map(|e| e.value().context()).collect();
        contexts.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        contexts
    }

    pub fn active_count(&self) -> usize {
        self.sessions.len()
    }

    /// Counter snapshot; commands from live sessions are summed on the fly.
    pub fn stats(&self) -> SessionStatistics {
        let live_commands: u64 = self
            .sessions
            .iter()
            .map(|e| e.value().queue.processed())
            .sum();
        let closed_total = self.counters.closed.load(Ordering::SeqCst)
            + self.counters.expired.load(Ordering::SeqCst);
        let average_lifetime = if closed_total > 0 {
            self.counters.total_lifetime_secs.load(Ordering::SeqCst) / closed_total
        } else {
            0
        };

        SessionStatistics {
            active_sessions: self.sessions.len(),
            sessions_created: self.counters.created.load(Ordering::SeqCst),
            sessions_closed: self.counters.closed.load(Ordering::SeqCst),
            sessions_expired: self.counters.expired.load(Ordering::SeqCst),
            commands_processed: self.counters.retired_commands.load(Ordering::SeqCst)
                + live_commands,
            average_session_lifetime_secs: average_lifetime,
            memory_bytes: process_memory_bytes(),
            uptime_secs: self.started_at.elapsed().as_secs(),
        }
    }

    /// Close every session idle beyond the configured timeout. Returns the
    /// number closed.
    pub async fn cleanup_expired(&self) -> usize {
        let timeout = chrono::Duration::from_std(self.session_config.session_timeout())
            .unwrap_or_else(|_| chrono::Duration::seconds(30 * 60));
        let now = Utc::now();

        let expired: Vec<String> = self
            .sessions
            .iter()
            .filter(|e| now - e.value().last_activity() > timeout)
            .map(|e| e.key().clone())
            .collect();

        let mut closed = 0;
        for id in expired {
            if let Some((_, session)) = self.sessions.remove(&id) {
                info!("Expiring idle session {}", id);
                self.dispose_session(session, "Session expired after inactivity")
                    .await;
                self.counters.expired.fetch_add(1, Ordering::SeqCst);
                closed += 1;
            }
        }
        closed
    }

    async fn sweeper_loop(self: Arc<Self>) {
        let interval = self.session_config.cleanup_interval();
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(interval) => {},
            }

            let expired = self.cleanup_expired().await;
            if expired > 0 {
                info!("Sweeper closed {} idle sessions", expired);
            }

            let memory = process_memory_bytes();
            if memory > self.session_config.memory_cleanup_threshold_bytes {
                warn!(
                    "Process memory {} bytes exceeds cleanup threshold; sweeping command results",
                    memory
                );
                for entry in self.sessions.iter() {
                    entry.value().queue.sweep_expired();
                }
            }
        }
    }

    /// Close every session within a bounded total budget; stuck sessions
    /// are abandoned to their force-kill rather than allowed to block
    /// shutdown.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        if let Some(sweeper) = self.sweeper.lock().take() {
            sweeper.abort();
        }

        let ids: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        info!("Shutting down session manager ({} sessions)", ids.len());

        let budget = self.session_config.disposal_timeout();
        let drain = async {
            for id in &ids {
                self.close(id).await;
            }
        };
        if tokio::time::timeout(budget, drain).await.is_err() {
            warn!("Session drain exceeded {:?}; killing stragglers", budget);
            let leftovers: Vec<String> =
                self.sessions.iter().map(|e| e.key().clone()).collect();
            for id in leftovers {
                if let Some((_, session)) = self.sessions.remove(&id) {
                    let _ = session.engine.stop().await;
                }
            }
        }
    }
}

/// Approximate resident-set size. Linux only; elsewhere the snapshot
/// reports zero.
pub fn process_memory_bytes() -> u64 {
    #[cfg(target_os = "linux")]
    {
        if let Ok(statm) = std::fs::read_to_string("/proc/self/statm")
            && let Some(resident_pages) = statm.split_whitespace().nth(1)
            && let Ok(pages) = resident_pages.parse::<u64>()
        {
            return pages * 4096;
        }
    }
    0
}
