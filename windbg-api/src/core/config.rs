use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Settings {
    pub server: ServerConfig,
    pub debugging: DebuggingConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub recovery: RecoveryConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DebuggingConfig {
    /// Driver-level wall clock per command, milliseconds
    pub command_timeout_ms: u64,
    pub symbol_server_timeout_ms: Option<u64>,
    pub symbol_server_max_retries: Option<u32>,
    pub symbol_search_path: Option<String>,
    /// Override the auto-detected debugger executable
    pub custom_debugger_path: Option<String>,
    /// Grace after interrupt before declaring the child wedged, milliseconds
    pub interrupt_grace_ms: u64,
    /// Grace after the quit command before force-kill, milliseconds
    pub quit_grace_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SessionConfig {
    pub max_concurrent_sessions: usize,
    pub session_timeout_secs: u64,
    pub cleanup_interval_secs: u64,
    pub disposal_timeout_secs: u64,
    pub memory_cleanup_threshold_bytes: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_concurrent_sessions: 1000,
            session_timeout_secs: 30 * 60,
            cleanup_interval_secs: 5 * 60,
            disposal_timeout_secs: 30,
            memory_cleanup_threshold_bytes: 1_000_000_000,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct QueueConfig {
    pub command_retention_secs: u64,
    pub cleanup_interval_secs: u64,
    pub heartbeat_interval_secs: u64,
    /// Substrings marking a command as heavy (analysis, heap walks, ...)
    pub heavy_markers: Vec<String>,
    /// Prefixes marking a short command as light (stack walk, registers, ...)
    pub light_prefixes: Vec<String>,
    pub complex_timeout_secs: u64,
    pub default_timeout_secs: u64,
    pub quick_timeout_secs: u64,
    pub max_timeout_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            command_retention_secs: 60 * 60,
            cleanup_interval_secs: 5 * 60,
            heartbeat_interval_secs: 30,
            heavy_markers: default_heavy_markers(),
            light_prefixes: default_light_prefixes(),
            complex_timeout_secs: 30 * 60,
            default_timeout_secs: 10 * 60,
            quick_timeout_secs: 2 * 60,
            max_timeout_secs: 60 * 60,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RecoveryConfig {
    pub interrupt_wait_ms: u64,
    pub probe_command: String,
    pub probe_timeout_ms: u64,
    pub max_attempts: u32,
    pub health_cache_secs: u64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            interrupt_wait_ms: 5000,
            probe_command: "version".to_string(),
            probe_timeout_ms: 10_000,
            max_attempts: 3,
            health_cache_secs: 30,
        }
    }
}

pub fn default_heavy_markers() -> Vec<String> {
    [
        "!analyze",
        "!heap",
        "!locks",
        "!poolused",
        "!process 0",
        "!verifier",
        ".dump",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

pub fn default_light_prefixes() -> Vec<String> {
    ["k", "lm", "r", "version", "~", "|", ".time", ".lastevent"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let s = Config::builder()
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 8229)?
            .set_default("debugging.command_timeout_ms", 30_000)?
            .set_default("debugging.interrupt_grace_ms", 5000)?
            .set_default("debugging.quit_grace_ms", 5000)?
            .add_source(File::with_name(&format!("config/{run_mode}")).required(false))
            .add_source(File::with_name("config/local").required(false))
            .add_source(Environment::with_prefix("WINDBG_GATEWAY").separator("__"))
            .build()?;

        s.try_deserialize()
    }
}

impl DebuggingConfig {
    /// Render the driver options for one session.
    pub fn driver_options(&self, symbols_path: Option<&str>) -> cdb_sdk::DriverOptions {
        let mut builder = cdb_sdk::DriverOptions::builder()
            .command_timeout(Duration::from_millis(self.command_timeout_ms))
            .interrupt_grace(Duration::from_millis(self.interrupt_grace_ms))
            .quit_grace(Duration::from_millis(self.quit_grace_ms));
        if let Some(path) = &self.custom_debugger_path {
            builder = builder.executable(path);
        }
        // A per-session symbols path beats the configured search path
        if let Some(symbols) = symbols_path.or(self.symbol_search_path.as_deref()) {
            builder = builder.symbols_path(symbols);
        }
        if let Some(ms) = self.symbol_server_timeout_ms {
            builder = builder.symbol_server_timeout(Duration::from_millis(ms));
        }
        if let Some(retries) = self.symbol_server_max_retries {
            builder = builder.symbol_server_max_retries(retries);
        }
        builder.build()
    }
}

impl QueueConfig {
    pub fn command_retention(&self) -> Duration {
        Duration::from_secs(self.command_retention_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }
}

impl SessionConfig {
    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    pub fn disposal_timeout(&self) -> Duration {
        Duration::from_secs(self.disposal_timeout_secs)
    }
}

impl RecoveryConfig {
    pub fn interrupt_wait(&self) -> Duration {
        Duration::from_millis(self.interrupt_wait_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn health_cache(&self) -> Duration {
        Duration::from_secs(self.health_cache_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_defaults() {
        let queue = QueueConfig::default();
        assert_eq!(queue.command_retention(), Duration::from_secs(3600));
        assert_eq!(queue.quick_timeout_secs, 120);
        assert_eq!(queue.default_timeout_secs, 600);
        assert_eq!(queue.complex_timeout_secs, 1800);
        assert_eq!(queue.max_timeout_secs, 3600);
        assert!(queue.heavy_markers.iter().any(|m| m == "!analyze"));
        assert!(queue.light_prefixes.iter().any(|p| p == "k"));
    }

    #[test]
    fn test_session_defaults() {
        let session = SessionConfig::default();
        assert_eq!(session.max_concurrent_sessions, 1000);
        assert_eq!(session.session_timeout(), Duration::from_secs(1800));
        assert_eq!(session.disposal_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_driver_options_rendering() {
        let debugging = DebuggingConfig {
            command_timeout_ms: 45_000,
            symbol_server_timeout_ms: Some(2000),
            symbol_server_max_retries: Some(2),
            symbol_search_path: Some("srv*".to_string()),
            custom_debugger_path: Some("/opt/cdb".to_string()),
            interrupt_grace_ms: 1000,
            quit_grace_ms: 1000,
        };

        let options = debugging.driver_options(None);
        assert_eq!(options.command_timeout, Duration::from_millis(45_000));
        assert_eq!(options.symbols_path.as_deref(), Some("srv*"));
        assert_eq!(
            options.executable.as_deref(),
            Some(std::path::Path::new("/opt/cdb"))
        );

        // Per-session symbols override the configured search path
        let options = debugging.driver_options(Some("c:\\syms"));
        assert_eq!(options.symbols_path.as_deref(), Some("c:\\syms"));
    }
}
