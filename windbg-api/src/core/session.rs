//! One debugger session
//!
//! A session pairs one debugger child process with one serialized command
//! queue, plus the timeout service and recovery coordinator that watch over
//! them. All four are owned by the session and torn down together,
//! queue-then-driver.

use std::sync::Arc;

use cdb_sdk::{DebugEngine, Target};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::warn;

use crate::core::command_queue::CommandQueue;
use crate::core::config::{QueueConfig, RecoveryConfig};
use crate::core::notifications::NotificationBus;
use crate::core::recovery::RecoveryCoordinator;
use crate::core::timeout::TimeoutService;

/// Session lifecycle status with linear transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionStatus {
    Initializing,
    Active,
    Disposing,
    Disposed,
    Error,
}

impl SessionStatus {
    /// Permitted transitions: Initializing→Active, Active→Disposing,
    /// Disposing→Disposed, and any→Error.
    pub fn can_transition_to(self, next: SessionStatus) -> bool {
        use SessionStatus::*;
        matches!(
            (self, next),
            (Initializing, Active) | (Active, Disposing) | (Disposing, Disposed) | (_, Error)
        )
    }
}

/// Shallow projection for listings.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionContext {
    pub session_id: String,
    pub target: String,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub status: SessionStatus,
    pub queue_depth: usize,
}

pub struct Session {
    pub id: String,
    pub target: Target,
    pub symbols_path: Option<String>,
    pub created_at: DateTime<Utc>,
    last_activity: Mutex<DateTime<Utc>>,
    status: Mutex<SessionStatus>,
    pub engine: Arc<dyn DebugEngine>,
    pub queue: Arc<CommandQueue>,
    pub timeouts: Arc<TimeoutService>,
    pub recovery: Arc<RecoveryCoordinator>,
}

impl Session {
    /// Assemble a session around an engine: timeout service, recovery
    /// coordinator, and command queue, wired to the shared bus. The engine
    /// is not started here.
    pub fn assemble(
        id: impl Into<String>,
        target: Target,
        symbols_path: Option<String>,
        engine: Arc<dyn DebugEngine>,
        bus: Arc<NotificationBus>,
        queue_config: QueueConfig,
        recovery_config: RecoveryConfig,
    ) -> Arc<Self> {
        let id = id.into();
        let timeouts = Arc::new(TimeoutService::new());
        let recovery = Arc::new(RecoveryCoordinator::new(
            id.clone(),
            engine.clone(),
            bus.clone(),
            recovery_config,
        ));
        let queue = CommandQueue::new(
            id.clone(),
            engine.clone(),
            timeouts.clone(),
            recovery.clone(),
            bus.clone(),
            queue_config,
        );
        recovery.bind_queue(&queue);

        let now = Utc::now();
        Arc::new(Self {
            id,
            target,
            symbols_path,
            created_at: now,
            last_activity: Mutex::new(now),
            status: Mutex::new(SessionStatus::Initializing),
            engine,
            queue,
            timeouts,
            recovery,
        })
    }

    pub fn status(&self) -> SessionStatus {
        *self.status.lock()
    }

    /// Apply a transition, refusing anything outside the linear ladder.
    pub fn set_status(&self, next: SessionStatus) -> bool {
        let mut status = self.status.lock();
        if status.can_transition_to(next) {
            *status = next;
            true
        } else {
            warn!(
                "Refusing session {} status transition {:?} -> {:?}",
                self.id, *status, next
            );
            false
        }
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        *self.last_activity.lock()
    }

    /// Record client activity for idle-expiry accounting.
    pub fn touch(&self) {
        *self.last_activity.lock() = Utc::now();
    }

    pub fn context(&self) -> SessionContext {
        SessionContext {
            session_id: self.id.clone(),
            target: self.target.describe(),
            created_at: self.created_at,
            last_activity: self.last_activity(),
            status: self.status(),
            queue_depth: self.queue.depth(),
        }
    }
}
