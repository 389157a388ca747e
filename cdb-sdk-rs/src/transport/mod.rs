//! Process transport abstractions
//!
//! This module defines the [`ProcessTransport`] trait the driver talks
//! through, with a real subprocess implementation and a scripted mock for
//! tests.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc::Sender;

use crate::errors::Result;

pub mod mock;
pub mod subprocess;

pub use mock::{MockController, MockTransport};
pub use subprocess::SubprocessTransport;

/// Best-effort interrupt of the child, usable without holding the
/// transport. The subprocess implementation signals the child's process
/// group; the mock unblocks its scripted command.
pub trait InterruptHandle: Send + Sync {
    /// Deliver the interrupt. Errors are reported, not fatal.
    fn interrupt(&self) -> Result<()>;
}

/// Byte-stream plumbing around one child process.
///
/// The transport owns the child and its pipes; the driver layers sentinel
/// framing and single-flight semantics on top. `spawn` may be called again
/// after `terminate` to restart the child.
#[async_trait]
pub trait ProcessTransport: Send + Sync {
    /// Spawn the child process with the given arguments and environment.
    async fn spawn(&mut self, program: &Path, args: &[String], envs: &[(String, String)])
    -> Result<()>;

    /// A clonable sink for input lines. Each sent string is written to the
    /// child's stdin followed by a newline.
    fn writer(&self) -> Result<Sender<String>>;

    /// Next line of child stdout; `None` once the stream has ended.
    async fn next_line(&mut self) -> Option<String>;

    /// Handle for interrupting the child without holding the transport.
    fn interrupt_handle(&self) -> Option<Arc<dyn InterruptHandle>>;

    /// Ask the child to exit via `quit_command`, wait up to `grace`, then
    /// force-kill. Returns `Ok(true)` if the exit was graceful. The child is
    /// always reaped.
    async fn terminate(&mut self, quit_command: &str, grace: Duration) -> Result<bool>;

    /// True while the child is running and its stdout has not ended.
    fn is_running(&self) -> bool;

    /// Current lifecycle state.
    fn state(&self) -> TransportState;
}

/// Transport lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    /// No child process yet
    Idle,
    /// Child is running
    Running,
    /// Terminate in progress
    Stopping,
    /// Child has been reaped
    Stopped,
}
