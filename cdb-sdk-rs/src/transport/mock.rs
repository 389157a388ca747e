//! Scripted mock transport for tests
//!
//! Behaves like a debugger child at the line level: input lines are matched
//! against scripted behaviors, echo commands reproduce their token, and
//! interrupt/terminate mirror the subprocess transport's contract. Used by
//! driver unit tests and by gateway integration tests.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{InterruptHandle, ProcessTransport, TransportState};
use crate::errors::{DriverError, Result};

/// How the mock reacts to a scripted command line.
#[derive(Debug, Clone)]
enum MockMode {
    /// Emit the lines after the delay; an interrupt aborts the delay and
    /// suppresses the output.
    Respond,
    /// Produce nothing until interrupted, then continue with the next line.
    HangUntilInterrupt,
    /// Wedge the child entirely; only terminate gets out.
    HangForever,
}

#[derive(Debug, Clone)]
struct MockBehavior {
    mode: MockMode,
    delay: Duration,
    lines: Vec<String>,
}

#[derive(Default)]
struct MockScript {
    behaviors: HashMap<String, MockBehavior>,
    writes: Vec<String>,
}

/// Shared control surface for a [`MockTransport`], usable after the
/// transport has been boxed into a driver.
#[derive(Clone)]
pub struct MockController {
    script: Arc<Mutex<MockScript>>,
    spawn_count: Arc<AtomicUsize>,
    interrupt: Arc<Mutex<CancellationToken>>,
    interrupts_sent: Arc<AtomicUsize>,
}

impl MockController {
    /// Script an immediate response for `command`.
    pub fn respond(&self, command: &str, lines: &[&str]) {
        self.respond_after(command, Duration::ZERO, lines);
    }

    /// Script a delayed response for `command`.
    pub fn respond_after(&self, command: &str, delay: Duration, lines: &[&str]) {
        self.script.lock().behaviors.insert(
            command.to_string(),
            MockBehavior {
                mode: MockMode::Respond,
                delay,
                lines: lines.iter().map(|s| s.to_string()).collect(),
            },
        );
    }

    /// Script `command` to block until interrupted.
    pub fn hang_until_interrupt(&self, command: &str) {
        self.script.lock().behaviors.insert(
            command.to_string(),
            MockBehavior {
                mode: MockMode::HangUntilInterrupt,
                delay: Duration::ZERO,
                lines: Vec::new(),
            },
        );
    }

    /// Script `command` to wedge the child until terminate.
    pub fn hang_forever(&self, command: &str) {
        self.script.lock().behaviors.insert(
            command.to_string(),
            MockBehavior {
                mode: MockMode::HangForever,
                delay: Duration::ZERO,
                lines: Vec::new(),
            },
        );
    }

    /// Every line written to the child, in order.
    pub fn writes(&self) -> Vec<String> {
        self.script.lock().writes.clone()
    }

    /// How many times the transport has been spawned.
    pub fn spawn_count(&self) -> usize {
        self.spawn_count.load(Ordering::SeqCst)
    }

    /// How many interrupts were delivered.
    pub fn interrupts_sent(&self) -> usize {
        self.interrupts_sent.load(Ordering::SeqCst)
    }
}

struct MockInterrupt {
    controller: MockController,
}

impl InterruptHandle for MockInterrupt {
    fn interrupt(&self) -> Result<()> {
        self.controller
            .interrupts_sent
            .fetch_add(1, Ordering::SeqCst);
        self.controller.interrupt.lock().cancel();
        Ok(())
    }
}

/// In-memory transport with scripted behavior.
pub struct MockTransport {
    controller: MockController,
    echo_prefix: String,
    in_tx: Option<mpsc::Sender<String>>,
    out_rx: Option<mpsc::Receiver<String>>,
    running: Arc<AtomicBool>,
    shutdown: CancellationToken,
    state: TransportState,
}

impl MockTransport {
    /// Create a mock that recognizes the default `.echo ` marker command.
    pub fn new() -> Self {
        Self::with_echo_prefix(".echo ")
    }

    /// Create a mock recognizing a custom echo-command prefix.
    pub fn with_echo_prefix(prefix: impl Into<String>) -> Self {
        Self {
            controller: MockController {
                script: Arc::new(Mutex::new(MockScript::default())),
                spawn_count: Arc::new(AtomicUsize::new(0)),
                interrupt: Arc::new(Mutex::new(CancellationToken::new())),
                interrupts_sent: Arc::new(AtomicUsize::new(0)),
            },
            echo_prefix: prefix.into(),
            in_tx: None,
            out_rx: None,
            running: Arc::new(AtomicBool::new(false)),
            shutdown: CancellationToken::new(),
            state: TransportState::Idle,
        }
    }

    /// Control surface shared with the processing task; clone before boxing
    /// the transport into a driver.
    pub fn controller(&self) -> MockController {
        self.controller.clone()
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProcessTransport for MockTransport {
    async fn spawn(
        &mut self,
        _program: &Path,
        _args: &[String],
        _envs: &[(String, String)],
    ) -> Result<()> {
        if self.state == TransportState::Running {
            return Err(DriverError::invalid_state("child process already running"));
        }

        let (in_tx, mut in_rx) = mpsc::channel::<String>(64);
        let (out_tx, out_rx) = mpsc::channel::<String>(64);
        let shutdown = CancellationToken::new();
        let running = Arc::new(AtomicBool::new(true));

        let controller = self.controller.clone();
        let echo_prefix = self.echo_prefix.clone();
        let task_shutdown = shutdown.clone();
        let task_running = running.clone();

        tokio::spawn(async move {
            loop {
                let line = tokio::select! {
                    _ = task_shutdown.cancelled() => break,
                    line = in_rx.recv() => match line {
                        Some(line) => line,
                        None => break,
                    },
                };

                controller.script.lock().writes.push(line.clone());

                // Echo commands reproduce their token like the real child
                if let Some(token) = line.strip_prefix(&echo_prefix) {
                    if out_tx.send(token.trim().to_string()).await.is_err() {
                        break;
                    }
                    continue;
                }

                let behavior = controller.script.lock().behaviors.get(&line).cloned();
                let behavior = behavior.unwrap_or(MockBehavior {
                    mode: MockMode::Respond,
                    delay: Duration::ZERO,
                    lines: vec![format!("mock: {line}")],
                });

                // Fresh interrupt scope per command
                let cancel = CancellationToken::new();
                *controller.interrupt.lock() = cancel.clone();

                match behavior.mode {
                    MockMode::Respond => {
                        let interrupted = tokio::select! {
                            _ = task_shutdown.cancelled() => break,
                            _ = cancel.cancelled() => true,
                            _ = tokio::time::sleep(behavior.delay) => false,
                        };
                        if !interrupted {
                            for out in behavior.lines {
                                if out_tx.send(out).await.is_err() {
                                    break;
                                }
                            }
                        } else {
                            debug!("Mock command interrupted: {line}");
                        }
                    },
                    MockMode::HangUntilInterrupt => {
                        tokio::select! {
                            _ = task_shutdown.cancelled() => break,
                            _ = cancel.cancelled() => {
                                debug!("Mock hang released by interrupt: {line}");
                            },
                        }
                    },
                    MockMode::HangForever => {
                        task_shutdown.cancelled().await;
                        break;
                    },
                }
            }
            task_running.store(false, Ordering::SeqCst);
        });

        self.controller.spawn_count.fetch_add(1, Ordering::SeqCst);
        self.in_tx = Some(in_tx);
        self.out_rx = Some(out_rx);
        self.shutdown = shutdown;
        self.running = running;
        self.state = TransportState::Running;
        Ok(())
    }

    fn writer(&self) -> Result<mpsc::Sender<String>> {
        self.in_tx.clone().ok_or(DriverError::ChannelClosed)
    }

    async fn next_line(&mut self) -> Option<String> {
        match self.out_rx {
            Some(ref mut rx) => rx.recv().await,
            None => None,
        }
    }

    fn interrupt_handle(&self) -> Option<Arc<dyn InterruptHandle>> {
        Some(Arc::new(MockInterrupt {
            controller: self.controller.clone(),
        }))
    }

    async fn terminate(&mut self, _quit_command: &str, _grace: Duration) -> Result<bool> {
        self.shutdown.cancel();
        self.in_tx = None;
        self.out_rx = None;
        self.running.store(false, Ordering::SeqCst);
        self.state = TransportState::Stopped;
        Ok(true)
    }

    fn is_running(&self) -> bool {
        self.state == TransportState::Running && self.running.load(Ordering::SeqCst)
    }

    fn state(&self) -> TransportState {
        self.state
    }
}
