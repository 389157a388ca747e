//! Command classification and timeout buckets
//!
//! The timeout for a command is chosen from its text at enqueue time:
//! configured heavy markers select the complex bucket, short commands with a
//! light prefix select the quick bucket, everything else gets the default.
//! Heartbeat hints rotate through phase descriptions per class as elapsed
//! time crosses fixed thresholds.

use std::time::Duration;

use crate::core::config::QueueConfig;

/// A command longer than this is never "light", whatever its prefix.
const SHORT_COMMAND_MAX: usize = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandClass {
    Quick,
    Standard,
    Complex,
}

impl CommandClass {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Quick => "quick",
            Self::Standard => "standard",
            Self::Complex => "complex",
        }
    }
}

/// Classify a command by its text.
pub fn classify(command: &str, config: &QueueConfig) -> CommandClass {
    let trimmed = command.trim();
    let lower = trimmed.to_ascii_lowercase();

    if config
        .heavy_markers
        .iter()
        .any(|marker| lower.contains(&marker.to_ascii_lowercase()))
    {
        return CommandClass::Complex;
    }

    if trimmed.len() <= SHORT_COMMAND_MAX
        && config
            .light_prefixes
            .iter()
            .any(|prefix| trimmed.starts_with(prefix.as_str()))
    {
        return CommandClass::Quick;
    }

    CommandClass::Standard
}

/// The timeout bucket for a class.
pub fn timeout_for(class: CommandClass, config: &QueueConfig) -> Duration {
    let secs = match class {
        CommandClass::Quick => config.quick_timeout_secs,
        CommandClass::Standard => config.default_timeout_secs,
        CommandClass::Complex => config.complex_timeout_secs,
    };
    Duration::from_secs(secs)
}

/// Advisory progress hint for a heartbeat, per class and elapsed time.
/// Thresholds: under 2 minutes, 2-5, 5-10, beyond 10.
pub fn progress_hint(class: CommandClass, elapsed: Duration) -> &'static str {
    let phase = match elapsed.as_secs() {
        0..=119 => 0,
        120..=299 => 1,
        300..=599 => 2,
        _ => 3,
    };

    match class {
        CommandClass::Quick => [
            "running command",
            "taking longer than usual for a quick command",
            "quick command still has not returned",
            "command appears wedged, consider cancelling",
        ][phase],
        CommandClass::Standard => [
            "running command",
            "collecting output",
            "still executing",
            "long-running command, consider cancelling",
        ][phase],
        CommandClass::Complex => [
            "starting analysis",
            "walking structures, this can take a while",
            "deep scan in progress",
            "large target, still working",
        ][phase],
    }
}
