//! Debugger executable discovery
//!
//! Search order:
//! 1. Explicit override (trusted as-is, no existence check)
//! 2. System PATH (`cdb`, `kd`)
//! 3. Conventional Windows Kits install roots and a per-user fallback

use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::errors::{DriverError, Result};

/// Find the debugger executable.
pub fn find_debugger(explicit: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = explicit {
        debug!("Using explicit debugger path: {}", path.display());
        return Ok(path.to_path_buf());
    }

    for name in &["cdb", "kd"] {
        if let Ok(path) = which::which(name) {
            debug!("Found debugger in PATH at: {}", path.display());
            return Ok(path);
        }
    }

    let mut locations: Vec<PathBuf> = vec![
        PathBuf::from(r"C:\Program Files (x86)\Windows Kits\10\Debuggers\x64\cdb.exe"),
        PathBuf::from(r"C:\Program Files (x86)\Windows Kits\10\Debuggers\x86\cdb.exe"),
        PathBuf::from(r"C:\Program Files\Windows Kits\10\Debuggers\x64\cdb.exe"),
        PathBuf::from(r"C:\Program Files (x86)\Windows Kits\8.1\Debuggers\x64\cdb.exe"),
        PathBuf::from("/usr/local/bin/cdb"),
    ];
    if let Some(home) = dirs::home_dir() {
        locations.push(home.join(".windbg/cdb.exe"));
        locations.push(home.join(".local/bin/cdb"));
    }

    let mut searched = Vec::new();
    for path in &locations {
        searched.push(path.display().to_string());
        if path.exists() && path.is_file() {
            debug!("Found debugger at: {}", path.display());
            return Ok(path.clone());
        }
    }

    warn!("Debugger executable not found in any standard location");
    Err(DriverError::DebuggerNotFound {
        searched_paths: searched.join("\n"),
    })
}
