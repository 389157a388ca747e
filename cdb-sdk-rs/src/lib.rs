//! # cdb driver substrate
//!
//! A Rust driver for the `cdb` command-line debugger, built for gateway
//! services that need to run debugger commands against crash dumps or
//! remote targets from async code.
//!
//! ## Features
//!
//! - **Sentinel framing**: turns the debugger's unframed output stream into
//!   discrete, per-command results without parsing debugger semantics
//! - **Single-flight execution**: one command in flight per driver, with a
//!   fail-fast busy error on re-entry
//! - **Cancellation**: per-command cancellation tokens plus a best-effort
//!   interrupt of the child process
//! - **Bounded teardown**: graceful quit with a grace window, then a hard
//!   kill of the whole process group
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use cdb_sdk::{CdbDriver, DriverOptions, Target};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> cdb_sdk::Result<()> {
//!     let driver = CdbDriver::new(DriverOptions::default());
//!     driver.start(&Target::dump_file("/tmp/crash.dmp")).await?;
//!
//!     let output = driver.execute("version", &CancellationToken::new()).await?;
//!     println!("{output}");
//!
//!     driver.stop().await?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

mod driver;
mod errors;
/// Debugger executable discovery
pub mod locate;
mod sentinel;
/// Process transport abstractions (subprocess and scripted mock)
pub mod transport;
mod types;

pub use driver::{CdbDriver, DebugEngine, DriverState};
pub use errors::{DriverError, Result};
pub use locate::find_debugger;
pub use sentinel::SentinelToken;
pub use transport::{InterruptHandle, ProcessTransport, TransportState};
pub use types::{DriverOptions, DriverOptionsBuilder, Target};
