//! In-process notification bus
//!
//! Multicasts lifecycle and progress events to any attached transport
//! adapters. Delivery is best-effort and fire-and-forget: a slow or broken
//! subscriber never blocks the publisher, and handler panics are isolated.
//! For a single command the publisher emits `queued`, `executing`,
//! heartbeats, and exactly one terminal status, in that order.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use serde::Serialize;
use serde_json::{Value, json};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// A server-initiated event: `{method, params}` with an ISO-8601 timestamp
/// inside `params`.
#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    pub method: String,
    pub params: Value,
}

fn stamp(mut params: Value) -> Value {
    if let Some(map) = params.as_object_mut() {
        map.insert("timestamp".to_string(), json!(Utc::now().to_rfc3339()));
    }
    params
}

impl Notification {
    pub fn command_status(
        session_id: &str,
        command_id: &str,
        command: &str,
        state: &str,
        result: Option<&str>,
    ) -> Self {
        Self {
            method: "commandStatus".to_string(),
            params: stamp(json!({
                "sessionId": session_id,
                "commandId": command_id,
                "command": command,
                "state": state,
                "result": result,
            })),
        }
    }

    pub fn command_heartbeat(
        session_id: &str,
        command_id: &str,
        elapsed_secs: u64,
        hint: &str,
    ) -> Self {
        Self {
            method: "commandHeartbeat".to_string(),
            params: stamp(json!({
                "sessionId": session_id,
                "commandId": command_id,
                "elapsedSeconds": elapsed_secs,
                "hint": hint,
            })),
        }
    }

    pub fn session_recovery(session_id: &str, phase: &str, reason: &str) -> Self {
        Self {
            method: "sessionRecovery".to_string(),
            params: stamp(json!({
                "sessionId": session_id,
                "phase": phase,
                "reason": reason,
            })),
        }
    }

    pub fn session_event(session_id: &str, event: &str, target: &str) -> Self {
        Self {
            method: "sessionEvent".to_string(),
            params: stamp(json!({
                "sessionId": session_id,
                "event": event,
                "target": target,
            })),
        }
    }

    pub fn tools_list_changed() -> Self {
        Self {
            method: "toolsListChanged".to_string(),
            params: stamp(json!({})),
        }
    }

    pub fn server_health(active_sessions: usize, uptime_secs: u64, memory_bytes: u64) -> Self {
        Self {
            method: "serverHealth".to_string(),
            params: stamp(json!({
                "activeSessions": active_sessions,
                "uptimeSeconds": uptime_secs,
                "memoryBytes": memory_bytes,
            })),
        }
    }
}

/// Process-local publish/subscribe for [`Notification`]s.
pub struct NotificationBus {
    tx: broadcast::Sender<Notification>,
    closed: AtomicBool,
}

impl NotificationBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            closed: AtomicBool::new(false),
        }
    }

    /// Publish to all current subscribers. Returns false after close or
    /// when nobody is listening; both are fine.
    pub fn publish(&self, notification: Notification) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            debug!(
                "Dropping notification after bus close: {}",
                notification.method
            );
            return false;
        }
        self.tx.send(notification).is_ok()
    }

    /// Raw subscription for transport adapters that drain the stream
    /// themselves.
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }

    /// Attach a callback handler on its own task. Panics inside the handler
    /// are caught and logged; they never affect other handlers or the
    /// publisher.
    pub fn attach<F>(&self, name: &str, handler: F) -> JoinHandle<()>
    where
        F: Fn(Notification) + Send + Sync + 'static,
    {
        let mut rx = self.tx.subscribe();
        let name = name.to_string();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(notification) => {
                        let result = std::panic::catch_unwind(AssertUnwindSafe(|| {
                            handler(notification);
                        }));
                        if result.is_err() {
                            error!("Notification handler '{}' panicked", name);
                        }
                    },
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Notification handler '{}' lagged by {} events", name, n);
                    },
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// Refuse all further dispatch. Existing subscribers drain what they
    /// already received.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
