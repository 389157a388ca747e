//! Error types for the cdb driver
//!
//! The errors are designed to be informative and actionable: discovery
//! failures list every searched path, and the driver distinguishes
//! cancellation, timeout, and child-process death so callers can pick the
//! right terminal state for a command.

use thiserror::Error;

/// Main error type for driver operations
#[derive(Error, Debug)]
pub enum DriverError {
    /// Debugger executable was not found
    #[error(
        "Debugger executable not found. Install the Debugging Tools for Windows or set an explicit path.\n\nSearched in:\n{searched_paths}"
    )]
    DebuggerNotFound {
        /// Paths that were searched for the executable
        searched_paths: String,
    },

    /// Process-related errors (spawn, pipe setup)
    #[error("Debugger process error: {0}")]
    ProcessError(#[from] std::io::Error),

    /// Another command is already executing on this driver
    #[error("Driver is busy executing another command")]
    Busy,

    /// The in-flight command was cancelled
    #[error("Command cancelled")]
    Cancelled,

    /// The driver-level wall clock expired
    #[error("Command timed out after {seconds} seconds")]
    TimedOut {
        /// Number of seconds waited before timeout
        seconds: u64,
    },

    /// The child process exited or closed its output before the sentinel
    #[error("Debugger process exited unexpectedly with code {code:?}")]
    ProcessExited {
        /// Exit code if available
        code: Option<i32>,
    },

    /// Output stream ended before the sentinel line arrived
    #[error("Debugger output stream ended before the command completed")]
    UnexpectedStreamEnd,

    /// Invalid state transition (e.g. execute before start, start twice)
    #[error("Invalid driver state: {message}")]
    InvalidState {
        /// Description of the invalid state
        message: String,
    },

    /// Invalid configuration
    #[error("Invalid driver configuration: {0}")]
    ConfigError(String),

    /// A channel to the child-process tasks closed unexpectedly
    #[error("Channel to the debugger process closed unexpectedly")]
    ChannelClosed,
}

/// Result type alias for driver operations
pub type Result<T> = std::result::Result<T, DriverError>;

impl DriverError {
    /// Create a new TimedOut error
    pub fn timed_out(seconds: u64) -> Self {
        Self::TimedOut { seconds }
    }

    /// Create a new InvalidState error
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState {
            message: message.into(),
        }
    }

    /// True for errors that end the command but leave the child usable
    pub fn is_interruption(&self) -> bool {
        matches!(self, Self::Cancelled | Self::TimedOut { .. })
    }

    /// True for errors that mean the child process is gone or wedged and
    /// the driver needs a restart before it can be used again
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::ProcessExited { .. } | Self::UnexpectedStreamEnd | Self::ChannelClosed
        )
    }

    /// Check if the error is a configuration issue
    pub fn is_config_error(&self) -> bool {
        matches!(self, Self::DebuggerNotFound { .. } | Self::ConfigError(_))
    }
}

// The stdin writer task owns the receiving half; a failed send means the
// task (and therefore the child) is gone.
impl<T> From<tokio::sync::mpsc::error::SendError<T>> for DriverError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Self::ChannelClosed
    }
}
