//! Per-session command queue
//!
//! A FIFO of pending debugger commands drained by a single background
//! worker, so commands become Executing in strict enqueue order and at most
//! one is in flight at any instant. Terminal states are settled by a
//! first-writer-wins transition on the command's completion slot: a cancel
//! that lands before the queue observes the driver's return beats a late
//! driver result.
//!
//! Terminal commands stay in the map for the configured retention window so
//! clients can still fetch results across polls; a periodic sweep evicts
//! them afterwards.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use cdb_sdk::{DebugEngine, DriverError};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::core::classify::{self, CommandClass};
use crate::core::config::QueueConfig;
use crate::core::notifications::{Notification, NotificationBus};
use crate::core::recovery::RecoveryCoordinator;
use crate::core::timeout::{TimeoutCallback, TimeoutService};

/// Why an enqueue was refused.
#[derive(Debug, thiserror::Error)]
pub enum EnqueueError {
    #[error("command must not be empty")]
    EmptyCommand,
    #[error("command queue has been disposed")]
    Disposed,
    #[error("configured timeout of {bucket_secs}s exceeds the {max_secs}s ceiling")]
    TimeoutAboveCeiling { bucket_secs: u64, max_secs: u64 },
}

/// Per-command lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandState {
    Queued,
    Executing,
    Completed,
    Cancelled,
    Failed,
}

impl CommandState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Executing => "executing",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        }
    }
}

/// Non-blocking answer to a result poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResultView {
    Pending,
    Executing,
    Completed(String),
    Cancelled(String),
    Failed(String),
    NotFound,
}

/// Read-only projection of one queued command.
#[derive(Debug, Clone)]
pub struct CommandSnapshot {
    pub id: Uuid,
    pub command: String,
    pub queued_at: DateTime<Utc>,
    pub state: CommandState,
}

struct CompletionSlot {
    state: CommandState,
    result: Option<String>,
    finished_at: Option<Instant>,
}

struct CommandCell {
    id: Uuid,
    command: String,
    queued_at: DateTime<Utc>,
    queued_mono: Instant,
    class: CommandClass,
    cancel: CancellationToken,
    cancel_reason: Mutex<Option<String>>,
    slot: Mutex<CompletionSlot>,
}

impl CommandCell {
    fn state(&self) -> CommandState {
        self.slot.lock().state
    }

    fn view(&self) -> ResultView {
        let slot = self.slot.lock();
        let text = || slot.result.clone().unwrap_or_default();
        match slot.state {
            CommandState::Queued => ResultView::Pending,
            CommandState::Executing => ResultView::Executing,
            CommandState::Completed => ResultView::Completed(text()),
            CommandState::Cancelled => ResultView::Cancelled(text()),
            CommandState::Failed => ResultView::Failed(text()),
        }
    }

    fn snapshot(&self) -> CommandSnapshot {
        CommandSnapshot {
            id: self.id,
            command: self.command.clone(),
            queued_at: self.queued_at,
            state: self.state(),
        }
    }

    /// First terminal writer wins; everyone else is a no-op. The status
    /// notification goes out under the slot lock so a late heartbeat can
    /// never trail the terminal event.
    fn try_finish(
        &self,
        bus: &NotificationBus,
        session_id: &str,
        state: CommandState,
        message: String,
    ) -> bool {
        debug_assert!(state.is_terminal());
        let mut slot = self.slot.lock();
        if slot.state.is_terminal() {
            return false;
        }
        slot.state = state;
        slot.result = Some(message.clone());
        slot.finished_at = Some(Instant::now());
        bus.publish(Notification::command_status(
            session_id,
            &self.id.to_string(),
            &self.command,
            state.label(),
            Some(&message),
        ));
        true
    }

    fn mark_executing(&self, bus: &NotificationBus, session_id: &str) -> bool {
        let mut slot = self.slot.lock();
        if slot.state != CommandState::Queued {
            return false;
        }
        slot.state = CommandState::Executing;
        bus.publish(Notification::command_status(
            session_id,
            &self.id.to_string(),
            &self.command,
            CommandState::Executing.label(),
            None,
        ));
        true
    }

    fn heartbeat_if_executing(
        &self,
        bus: &NotificationBus,
        session_id: &str,
        elapsed: Duration,
    ) -> bool {
        let slot = self.slot.lock();
        if slot.state != CommandState::Executing {
            return false;
        }
        bus.publish(Notification::command_heartbeat(
            session_id,
            &self.id.to_string(),
            elapsed.as_secs(),
            classify::progress_hint(self.class, elapsed),
        ));
        true
    }

    fn reason_or(&self, fallback: &str) -> String {
        self.cancel_reason
            .lock()
            .clone()
            .unwrap_or_else(|| fallback.to_string())
    }
}

/// FIFO queue with a single-flight worker, per session.
pub struct CommandQueue {
    session_id: String,
    engine: Arc<dyn DebugEngine>,
    timeouts: Arc<TimeoutService>,
    recovery: Arc<RecoveryCoordinator>,
    bus: Arc<NotificationBus>,
    config: QueueConfig,
    commands: DashMap<Uuid, Arc<CommandCell>>,
    pending: Mutex<VecDeque<Uuid>>,
    work: Semaphore,
    current: Mutex<Option<Uuid>>,
    disposed: AtomicBool,
    shutdown: CancellationToken,
    processed: AtomicU64,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl CommandQueue {
    /// Build the queue and spawn its worker and retention sweeper.
    pub fn new(
        session_id: impl Into<String>,
        engine: Arc<dyn DebugEngine>,
        timeouts: Arc<TimeoutService>,
        recovery: Arc<RecoveryCoordinator>,
        bus: Arc<NotificationBus>,
        config: QueueConfig,
    ) -> Arc<Self> {
        let queue = Arc::new(Self {
            session_id: session_id.into(),
            engine,
            timeouts,
            recovery,
            bus,
            config,
            commands: DashMap::new(),
            pending: Mutex::new(VecDeque::new()),
            work: Semaphore::new(0),
            current: Mutex::new(None),
            disposed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            processed: AtomicU64::new(0),
            tasks: Mutex::new(Vec::new()),
        });

        let worker = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.worker_loop().await })
        };
        let sweeper = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.sweeper_loop().await })
        };
        queue.tasks.lock().extend([worker, sweeper]);

        queue
    }

    /// Append a command; returns its id immediately.
    pub fn enqueue(&self, command: &str) -> Result<Uuid, EnqueueError> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(EnqueueError::Disposed);
        }
        if command.trim().is_empty() {
            return Err(EnqueueError::EmptyCommand);
        }

        let class = classify::classify(command, &self.config);
        let bucket = classify::timeout_for(class, &self.config);
        let max = Duration::from_secs(self.config.max_timeout_secs);
        if bucket > max {
            return Err(EnqueueError::TimeoutAboveCeiling {
                bucket_secs: bucket.as_secs(),
                max_secs: max.as_secs(),
            });
        }

        let id = Uuid::new_v4();
        let cell = Arc::new(CommandCell {
            id,
            command: command.to_string(),
            queued_at: Utc::now(),
            queued_mono: Instant::now(),
            class,
            cancel: CancellationToken::new(),
            cancel_reason: Mutex::new(None),
            slot: Mutex::new(CompletionSlot {
                state: CommandState::Queued,
                result: None,
                finished_at: None,
            }),
        });

        self.commands.insert(id, cell.clone());
        self.pending.lock().push_back(id);
        self.bus.publish(Notification::command_status(
            &self.session_id,
            &id.to_string(),
            command,
            CommandState::Queued.label(),
            None,
        ));
        debug!(
            "Enqueued {} ({}) on session {}",
            id,
            class.label(),
            self.session_id
        );
        self.work.add_permits(1);
        Ok(id)
    }

    /// Non-blocking result poll.
    pub fn get_result(&self, id: Uuid) -> ResultView {
        match self.commands.get(&id) {
            Some(cell) => cell.view(),
            None => ResultView::NotFound,
        }
    }

    /// Cancel one command. Queued commands are marked and drained by the
    /// worker in order; the executing command is settled immediately and
    /// the driver interrupted. Returns false for unknown or already
    /// terminal commands.
    pub fn cancel(&self, id: Uuid, reason: &str) -> bool {
        let Some(cell) = self.commands.get(&id).map(|e| e.value().clone()) else {
            return false;
        };
        self.cancel_cell(&cell, reason)
    }

    fn cancel_cell(&self, cell: &CommandCell, reason: &str) -> bool {
        let mut slot = cell.slot.lock();
        match slot.state {
            CommandState::Queued => {
                *cell.cancel_reason.lock() = Some(reason.to_string());
                // Mark-and-drain: the worker resolves it on dequeue so the
                // notification order matches the executing-cancel path.
                cell.cancel.cancel();
                true
            },
            CommandState::Executing => {
                slot.state = CommandState::Cancelled;
                slot.result = Some(reason.to_string());
                slot.finished_at = Some(Instant::now());
                self.bus.publish(Notification::command_status(
                    &self.session_id,
                    &cell.id.to_string(),
                    &cell.command,
                    CommandState::Cancelled.label(),
                    Some(reason),
                ));
                // Interrupt while still holding the slot lock: the worker
                // cannot advance to the next command, so the interrupt can
                // only land on this one.
                self.engine.cancel_current();
                cell.cancel.cancel();
                true
            },
            _ => false,
        }
    }

    /// Cancel every non-terminal command. Never fails; returns the count.
    pub fn cancel_all(&self, reason: &str) -> usize {
        let cells: Vec<Arc<CommandCell>> =
            self.commands.iter().map(|e| e.value().clone()).collect();
        let mut cancelled = 0;
        for cell in cells {
            if self.cancel_cell(&cell, reason) {
                cancelled += 1;
            }
        }
        if cancelled > 0 {
            info!(
                "Cancelled {} commands on session {}: {}",
                cancelled, self.session_id, reason
            );
        }
        cancelled
    }

    /// Snapshot of every retained command, oldest first.
    pub fn queue_status(&self) -> Vec<CommandSnapshot> {
        let mut snapshots: Vec<CommandSnapshot> =
            self.commands.iter().map(|e| e.value().snapshot()).collect();
        snapshots.sort_by(|a, b| a.queued_at.cmp(&b.queued_at).then(a.id.cmp(&b.id)));
        snapshots
    }

    /// The command presently executing, if any.
    pub fn current(&self) -> Option<CommandSnapshot> {
        let id = (*self.current.lock())?;
        self.commands.get(&id).map(|cell| cell.snapshot())
    }

    /// Commands waiting to start.
    pub fn depth(&self) -> usize {
        self.pending.lock().len()
    }

    /// Commands the worker has settled since creation.
    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::SeqCst)
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Evict terminal commands older than the retention window. Returns the
    /// number evicted.
    pub fn sweep_expired(&self) -> usize {
        let retention = self.config.command_retention();
        let before = self.commands.len();
        self.commands.retain(|_, cell| {
            let slot = cell.slot.lock();
            !(slot.state.is_terminal() && cell.queued_mono.elapsed() > retention)
        });
        let evicted = before - self.commands.len();
        if evicted > 0 {
            debug!(
                "Swept {} expired command results on session {}",
                evicted, self.session_id
            );
        }
        evicted
    }

    /// Refuse new work, cancel what remains, and stop the worker. Safe to
    /// call more than once.
    pub async fn dispose(&self, reason: &str) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Disposing queue for session {}", self.session_id);
        self.cancel_all(reason);

        // The worker is going away; settle still-queued entries here
        // instead of draining them through it.
        loop {
            let id = self.pending.lock().pop_front();
            let Some(id) = id else { break };
            if let Some(cell) = self.commands.get(&id).map(|e| e.value().clone()) {
                cell.try_finish(
                    &self.bus,
                    &self.session_id,
                    CommandState::Cancelled,
                    cell.reason_or(reason),
                );
            }
        }

        self.shutdown.cancel();
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for mut task in tasks {
            if tokio::time::timeout(Duration::from_secs(5), &mut task)
                .await
                .is_err()
            {
                warn!("Queue task for session {} did not stop; aborting", self.session_id);
                task.abort();
            }
        }
    }

    async fn worker_loop(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                permit = self.work.acquire() => match permit {
                    Ok(permit) => permit.forget(),
                    Err(_) => break,
                },
            }

            let id = self.pending.lock().pop_front();
            let Some(id) = id else { continue };
            let Some(cell) = self.commands.get(&id).map(|e| e.value().clone()) else {
                continue;
            };
            self.run_one(cell).await;
        }
        debug!("Queue worker for session {} stopped", self.session_id);
    }

    async fn sweeper_loop(self: Arc<Self>) {
        let interval = self.config.cleanup_interval();
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(interval) => {},
            }
            self.sweep_expired();
        }
        debug!("Queue sweeper for session {} stopped", self.session_id);
    }

    async fn run_one(self: &Arc<Self>, cell: Arc<CommandCell>) {
        // Cancelled while queued: skip execution entirely
        if cell.cancel.is_cancelled() {
            cell.try_finish(
                &self.bus,
                &self.session_id,
                CommandState::Cancelled,
                cell.reason_or("Command cancelled while queued"),
            );
            self.processed.fetch_add(1, Ordering::SeqCst);
            return;
        }

        // Health gate: a sick session gets one recovery cycle before the
        // command is declared unrecoverable.
        if !self.recovery.is_healthy().await {
            let recovered = self
                .recovery
                .recover("session unhealthy before command execution")
                .await;
            if !recovered {
                cell.try_finish(
                    &self.bus,
                    &self.session_id,
                    CommandState::Failed,
                    "Session is unrecoverable; close it and create a new one".to_string(),
                );
                self.processed.fetch_add(1, Ordering::SeqCst);
                return;
            }
            // Recovery may have cancelled this command along with the rest
            if cell.state().is_terminal() {
                self.processed.fetch_add(1, Ordering::SeqCst);
                return;
            }
        }

        if !cell.mark_executing(&self.bus, &self.session_id) {
            self.processed.fetch_add(1, Ordering::SeqCst);
            return;
        }
        *self.current.lock() = Some(cell.id);

        let bucket = classify::timeout_for(cell.class, &self.config);
        self.timeouts.arm(cell.id, bucket, self.timeout_callback(&cell, bucket));

        let heartbeat = self.spawn_heartbeat(&cell);

        // A recovery probe may hold the driver for a moment; the worker is
        // the only other executor, so a busy driver is always transient and
        // waiting it out keeps BusyError from ever reaching a client.
        let outcome = loop {
            if cell.cancel.is_cancelled() {
                break Err(DriverError::Cancelled);
            }
            match self.engine.execute(&cell.command, &cell.cancel).await {
                Err(DriverError::Busy) => {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                },
                other => break other,
            }
        };

        self.timeouts.cancel(cell.id);
        heartbeat.abort();

        match outcome {
            Ok(output) => {
                cell.try_finish(&self.bus, &self.session_id, CommandState::Completed, output);
            },
            Err(DriverError::Cancelled) => {
                cell.try_finish(
                    &self.bus,
                    &self.session_id,
                    CommandState::Cancelled,
                    cell.reason_or("Command cancelled"),
                );
            },
            Err(DriverError::TimedOut { seconds }) => {
                if cell.try_finish(
                    &self.bus,
                    &self.session_id,
                    CommandState::Failed,
                    format!("Command timed out after {seconds} seconds"),
                ) {
                    self.trigger_recovery("driver wall-clock timeout");
                }
            },
            Err(e) if e.is_fatal() => {
                cell.try_finish(
                    &self.bus,
                    &self.session_id,
                    CommandState::Failed,
                    format!("Debugger failure: {e}"),
                );
                self.trigger_recovery("debugger process failure");
            },
            Err(e) => {
                cell.try_finish(
                    &self.bus,
                    &self.session_id,
                    CommandState::Failed,
                    format!("Command failed: {e}"),
                );
            },
        }

        *self.current.lock() = None;
        self.processed.fetch_add(1, Ordering::SeqCst);
    }

    /// A queue-level timeout is a cancellation originating inside the
    /// system: settle the command as Failed, free the driver through the
    /// cancel token, and kick off recovery.
    fn timeout_callback(&self, cell: &Arc<CommandCell>, bucket: Duration) -> TimeoutCallback {
        let cell = cell.clone();
        let bus = self.bus.clone();
        let session_id = self.session_id.clone();
        let recovery = self.recovery.clone();
        Arc::new(move |_id| {
            let cell = cell.clone();
            let bus = bus.clone();
            let session_id = session_id.clone();
            let recovery = recovery.clone();
            let message = format!("Command timed out after {} seconds", bucket.as_secs());
            Box::pin(async move {
                if cell.try_finish(&bus, &session_id, CommandState::Failed, message) {
                    cell.cancel.cancel();
                    tokio::spawn(async move {
                        recovery.recover("command timeout").await;
                    });
                }
            })
        })
    }

    fn spawn_heartbeat(&self, cell: &Arc<CommandCell>) -> JoinHandle<()> {
        let cell = cell.clone();
        let bus = self.bus.clone();
        let session_id = self.session_id.clone();
        let interval = self.config.heartbeat_interval();
        tokio::spawn(async move {
            let started = Instant::now();
            loop {
                tokio::time::sleep(interval).await;
                if !cell.heartbeat_if_executing(&bus, &session_id, started.elapsed()) {
                    break;
                }
            }
        })
    }

    fn trigger_recovery(&self, reason: &str) {
        let recovery = self.recovery.clone();
        let reason = reason.to_string();
        tokio::spawn(async move {
            recovery.recover(&reason).await;
        });
    }
}
