//! Multi-session RPC gateway for the cdb command-line debugger.
//!
//! Each client session owns one long-lived debugger child process attached
//! to a crash dump or a remote target. Clients enqueue textual debugger
//! commands against a session and poll for results asynchronously; a
//! per-session queue serializes execution, attaches timeouts, and feeds a
//! recovery ladder when the debugger stalls.

pub mod api;
pub mod core;
pub mod models;
