//! Debugger driver
//!
//! [`CdbDriver`] owns exactly one child debugger process and turns its
//! unframed output stream into discrete command results.
//!
//! ## Sentinel framing
//!
//! Every `execute` writes the user command and immediately follows it with
//! an echo command that prints a high-entropy token. Everything read before
//! the token line is the command's output. The token is generated per start
//! (not per command) and regenerated on every restart, so output captured
//! from one incarnation can never terminate framing in another.
//!
//! ## Serialization
//!
//! `execute` is single-flight: the transport lock is acquired with
//! `try_lock`, and a second caller fails fast with [`DriverError::Busy`]
//! instead of queueing. Queueing is the command queue's job, not the
//! driver's.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::errors::{DriverError, Result};
use crate::locate::find_debugger;
use crate::sentinel::SentinelToken;
use crate::transport::{InterruptHandle, ProcessTransport, SubprocessTransport};
use crate::types::{DriverOptions, Target};

/// Driver lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    /// Constructed, never started
    Created,
    /// Child running, commands accepted
    Active,
    /// Write failure or premature EOF; requires stop + start before reuse
    Errored,
    /// Stop in progress
    Stopping,
    /// Child reaped; may be started again
    Stopped,
}

/// The capability set the gateway needs from a debugger.
///
/// `CdbDriver` is the production implementation; tests drive the same
/// trait over a scripted mock transport.
#[async_trait]
pub trait DebugEngine: Send + Sync {
    /// Spawn the child, attach the target, and flush the startup banner.
    /// Fails if the driver is already started.
    async fn start(&self, target: &Target) -> Result<()>;

    /// Run one command to completion and return its output, excluding the
    /// echoed command and the sentinel line.
    async fn execute(&self, command: &str, cancel: &CancellationToken) -> Result<String>;

    /// Best-effort interruption of the in-flight `execute`; a no-op when
    /// nothing is executing beyond poking the child.
    fn cancel_current(&self);

    /// Quit gracefully within the grace window, then force-kill. Returns
    /// whether the exit was graceful. Idempotent.
    async fn stop(&self) -> Result<bool>;

    /// True iff the child is running and not stopping.
    fn is_active(&self) -> bool;
}

/// Driver for the cdb command-line debugger.
pub struct CdbDriver {
    options: DriverOptions,
    io: tokio::sync::Mutex<Box<dyn ProcessTransport>>,
    sentinel: RwLock<SentinelToken>,
    state: Mutex<DriverState>,
    interrupter: Mutex<Option<Arc<dyn InterruptHandle>>>,
    current_cancel: Mutex<Option<CancellationToken>>,
}

impl CdbDriver {
    /// Create a driver backed by a real subprocess.
    pub fn new(options: DriverOptions) -> Self {
        let transport = SubprocessTransport::new(options.channel_buffer);
        Self::with_transport(options, Box::new(transport))
    }

    /// Create a driver over an explicit transport (tests use the mock).
    pub fn with_transport(options: DriverOptions, transport: Box<dyn ProcessTransport>) -> Self {
        Self {
            options,
            io: tokio::sync::Mutex::new(transport),
            sentinel: RwLock::new(SentinelToken::generate()),
            state: Mutex::new(DriverState::Created),
            interrupter: Mutex::new(None),
            current_cancel: Mutex::new(None),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> DriverState {
        *self.state.lock()
    }

    /// The sentinel token for the current incarnation.
    pub fn sentinel_token(&self) -> String {
        self.sentinel.read().as_str().to_string()
    }

    fn mark_errored(&self) {
        let mut state = self.state.lock();
        if matches!(*state, DriverState::Active) {
            warn!("Driver entering errored state");
            *state = DriverState::Errored;
        }
    }

    fn startup_drain_budget(&self) -> Duration {
        // Symbol resolution dominates startup; when symbol-server settings
        // are present they bound the banner drain.
        match self.options.symbol_server_timeout {
            Some(timeout) => {
                let retries = self.options.symbol_server_max_retries.unwrap_or(0);
                timeout * (retries + 1)
            },
            None => Duration::from_secs(30),
        }
    }

    /// Wait for the sentinel after a startup or restart, discarding banner
    /// output.
    async fn drain_until_sentinel(
        &self,
        io: &mut Box<dyn ProcessTransport>,
        sentinel: &SentinelToken,
        budget: Duration,
    ) -> Result<()> {
        let deadline = Instant::now() + budget;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                self.mark_errored();
                return Err(DriverError::timed_out(budget.as_secs()));
            }
            match tokio::time::timeout(remaining, io.next_line()).await {
                Ok(Some(line)) if sentinel.matches_line(&line) => return Ok(()),
                Ok(Some(line)) => debug!("Startup output: {}", line),
                Ok(None) => {
                    self.mark_errored();
                    return Err(DriverError::UnexpectedStreamEnd);
                },
                Err(_) => {
                    self.mark_errored();
                    return Err(DriverError::timed_out(budget.as_secs()));
                },
            }
        }
    }

    /// Interrupt the child and drain until the sentinel or the grace window
    /// runs out, then surface `reason` to the caller. If the sentinel never
    /// arrives the child is wedged and the driver latches errored.
    async fn finish_interrupted(
        &self,
        io: &mut Box<dyn ProcessTransport>,
        sentinel: &SentinelToken,
        reason: DriverError,
    ) -> Result<String> {
        if let Some(handle) = self.interrupter.lock().clone()
            && let Err(e) = handle.interrupt()
        {
            warn!("Failed to interrupt debugger: {}", e);
        }

        let deadline = Instant::now() + self.options.interrupt_grace;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                warn!("No sentinel within interrupt grace; child is wedged");
                self.mark_errored();
                break;
            }
            match tokio::time::timeout(remaining, io.next_line()).await {
                Ok(Some(line)) if sentinel.matches_line(&line) => {
                    debug!("Child responsive after interrupt");
                    break;
                },
                Ok(Some(_)) => {},
                Ok(None) => {
                    self.mark_errored();
                    break;
                },
                Err(_) => {
                    warn!("No sentinel within interrupt grace; child is wedged");
                    self.mark_errored();
                    break;
                },
            }
        }
        Err(reason)
    }

    async fn execute_framed(
        &self,
        io: &mut Box<dyn ProcessTransport>,
        command: &str,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let sentinel = self.sentinel.read().clone();
        let echo = sentinel.echo_command(&self.options.echo_format);

        let writer = io.writer()?;
        if writer.send(command.to_string()).await.is_err()
            || writer.send(echo.clone()).await.is_err()
        {
            self.mark_errored();
            return Err(DriverError::ChannelClosed);
        }

        let deadline = Instant::now() + self.options.command_timeout;
        let mut collected: Vec<String> = Vec::new();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    return self
                        .finish_interrupted(io, &sentinel, DriverError::Cancelled)
                        .await;
                },
                _ = tokio::time::sleep_until(deadline) => {
                    let seconds = self.options.command_timeout.as_secs();
                    return self
                        .finish_interrupted(io, &sentinel, DriverError::timed_out(seconds))
                        .await;
                },
                line = io.next_line() => match line {
                    None => {
                        self.mark_errored();
                        return Err(DriverError::UnexpectedStreamEnd);
                    },
                    Some(line) if sentinel.matches_line(&line) => break,
                    // Echoed input lines are not output
                    Some(line) if line.trim() == command.trim() || line.contains(&echo) => {},
                    Some(line) => collected.push(line),
                },
            }
        }

        Ok(collected.join("\n"))
    }
}

#[async_trait]
impl DebugEngine for CdbDriver {
    async fn start(&self, target: &Target) -> Result<()> {
        {
            let state = self.state.lock();
            if !matches!(*state, DriverState::Created | DriverState::Stopped) {
                return Err(DriverError::invalid_state(format!(
                    "driver already started (state: {:?})",
                    *state
                )));
            }
        }

        let program = find_debugger(self.options.executable.as_deref())?;

        let mut args = target.to_args();
        if let Some(ref symbols) = self.options.symbols_path {
            args.push("-y".to_string());
            args.push(symbols.clone());
        }
        args.extend(self.options.extra_args.iter().cloned());

        let mut envs: Vec<(String, String)> = Vec::new();
        if let Some(ref symbols) = self.options.symbols_path {
            envs.push(("_NT_SYMBOL_PATH".to_string(), symbols.clone()));
        }

        // Fresh token per incarnation
        let sentinel = SentinelToken::generate();
        *self.sentinel.write() = sentinel.clone();

        let mut io = self.io.lock().await;
        io.spawn(&program, &args, &envs).await?;
        *self.interrupter.lock() = io.interrupt_handle();
        *self.state.lock() = DriverState::Active;

        // Flush the startup banner through a sentinel so the first real
        // command starts with a clean stream.
        let echo = sentinel.echo_command(&self.options.echo_format);
        io.writer()?.send(echo).await?;
        self.drain_until_sentinel(&mut io, &sentinel, self.startup_drain_budget())
            .await?;

        info!("Debugger started for target: {}", target.describe());
        Ok(())
    }

    async fn execute(&self, command: &str, cancel: &CancellationToken) -> Result<String> {
        if command.trim().is_empty() {
            return Err(DriverError::ConfigError("command must not be empty".into()));
        }
        {
            let state = self.state.lock();
            if *state != DriverState::Active {
                return Err(DriverError::invalid_state(format!(
                    "driver is not active (state: {:?})",
                    *state
                )));
            }
        }

        let mut io = self.io.try_lock().map_err(|_| DriverError::Busy)?;

        // A local scope for cancel_current: interrupting this execute must
        // not trip the caller's token.
        let local = cancel.child_token();
        *self.current_cancel.lock() = Some(local.clone());

        let result = self.execute_framed(&mut io, command, &local).await;

        *self.current_cancel.lock() = None;
        result
    }

    fn cancel_current(&self) {
        let current = self.current_cancel.lock().clone();
        match current {
            Some(token) => token.cancel(),
            None => {
                // Nothing in flight; poke the child anyway so a wedged
                // busy-loop breaks back to the prompt.
                if let Some(handle) = self.interrupter.lock().clone() {
                    let _ = handle.interrupt();
                }
            },
        }
    }

    async fn stop(&self) -> Result<bool> {
        {
            let mut state = self.state.lock();
            match *state {
                DriverState::Stopped | DriverState::Created => return Ok(true),
                DriverState::Stopping => return Ok(true),
                _ => *state = DriverState::Stopping,
            }
        }

        // Kick any in-flight execute off the transport lock first
        self.cancel_current();

        let mut io = self.io.lock().await;
        let graceful = io
            .terminate(&self.options.quit_command, self.options.quit_grace)
            .await
            .unwrap_or(false);

        *self.interrupter.lock() = None;
        *self.state.lock() = DriverState::Stopped;
        info!("Debugger stopped (graceful: {})", graceful);
        Ok(graceful)
    }

    fn is_active(&self) -> bool {
        *self.state.lock() == DriverState::Active
    }
}
