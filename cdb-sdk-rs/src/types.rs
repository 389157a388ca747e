//! Driver configuration types

use std::path::PathBuf;
use std::time::Duration;

/// What the debugger attaches to when it starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// A crash dump file on disk (`-z <path>`)
    DumpFile(PathBuf),
    /// A remote-connection descriptor, passed through verbatim
    /// (`-remote tcp:Port=...,Server=...`)
    Remote(String),
}

impl Target {
    /// Convenience constructor for a dump-file target
    pub fn dump_file(path: impl Into<PathBuf>) -> Self {
        Self::DumpFile(path.into())
    }

    /// Convenience constructor for a remote target
    pub fn remote(descriptor: impl Into<String>) -> Self {
        Self::Remote(descriptor.into())
    }

    /// Interpret an opaque target string: remote descriptors carry a
    /// transport prefix, everything else is treated as a dump path.
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }
        let lower = raw.to_ascii_lowercase();
        if lower.starts_with("tcp:") || lower.starts_with("npipe:") || lower.starts_with("com:") {
            Some(Self::Remote(raw.to_string()))
        } else {
            Some(Self::DumpFile(PathBuf::from(raw)))
        }
    }

    /// Command-line arguments selecting this target
    pub fn to_args(&self) -> Vec<String> {
        match self {
            Self::DumpFile(path) => vec!["-z".to_string(), path.display().to_string()],
            Self::Remote(descriptor) => vec!["-remote".to_string(), descriptor.clone()],
        }
    }

    /// Human-readable description used in logs and session listings
    pub fn describe(&self) -> String {
        match self {
            Self::DumpFile(path) => path.display().to_string(),
            Self::Remote(descriptor) => descriptor.clone(),
        }
    }
}

/// Configuration for a [`crate::CdbDriver`].
///
/// All fields have working defaults; use [`DriverOptions::builder`] to
/// override them.
#[derive(Debug, Clone)]
pub struct DriverOptions {
    /// Explicit debugger executable. When set, discovery is skipped and the
    /// path is trusted as-is.
    pub executable: Option<PathBuf>,
    /// Extra arguments appended after the generated ones
    pub extra_args: Vec<String>,
    /// Symbol search path, passed via `-y` and `_NT_SYMBOL_PATH`
    pub symbols_path: Option<String>,
    /// Symbol-server timeout, exported to the child environment
    pub symbol_server_timeout: Option<Duration>,
    /// Symbol-server retry count, exported to the child environment
    pub symbol_server_max_retries: Option<u32>,
    /// Wall clock for a single `execute` call
    pub command_timeout: Duration,
    /// How long to wait for the sentinel after an interrupt before
    /// declaring the child wedged
    pub interrupt_grace: Duration,
    /// How long to wait for a graceful exit after the quit command
    pub quit_grace: Duration,
    /// Command template that makes the debugger echo a literal token.
    /// `{token}` is replaced with the sentinel.
    pub echo_format: String,
    /// Command that asks the debugger to exit
    pub quit_command: String,
    /// Buffer size for the stdin/stdout channels
    pub channel_buffer: usize,
}

impl Default for DriverOptions {
    fn default() -> Self {
        Self {
            executable: None,
            extra_args: Vec::new(),
            symbols_path: None,
            symbol_server_timeout: None,
            symbol_server_max_retries: None,
            command_timeout: Duration::from_secs(30),
            interrupt_grace: Duration::from_secs(5),
            quit_grace: Duration::from_secs(5),
            echo_format: ".echo {token}".to_string(),
            quit_command: "q".to_string(),
            channel_buffer: 100,
        }
    }
}

impl DriverOptions {
    /// Create a builder with default options
    pub fn builder() -> DriverOptionsBuilder {
        DriverOptionsBuilder::default()
    }
}

/// Builder for [`DriverOptions`]
#[derive(Debug, Default)]
pub struct DriverOptionsBuilder {
    options: DriverOptions,
}

impl DriverOptionsBuilder {
    /// Set an explicit debugger executable path
    pub fn executable(mut self, path: impl Into<PathBuf>) -> Self {
        self.options.executable = Some(path.into());
        self
    }

    /// Append an extra command-line argument
    pub fn extra_arg(mut self, arg: impl Into<String>) -> Self {
        self.options.extra_args.push(arg.into());
        self
    }

    /// Set the symbol search path
    pub fn symbols_path(mut self, path: impl Into<String>) -> Self {
        self.options.symbols_path = Some(path.into());
        self
    }

    /// Set the symbol-server timeout
    pub fn symbol_server_timeout(mut self, timeout: Duration) -> Self {
        self.options.symbol_server_timeout = Some(timeout);
        self
    }

    /// Set the symbol-server retry count
    pub fn symbol_server_max_retries(mut self, retries: u32) -> Self {
        self.options.symbol_server_max_retries = Some(retries);
        self
    }

    /// Set the per-command wall clock
    pub fn command_timeout(mut self, timeout: Duration) -> Self {
        self.options.command_timeout = timeout;
        self
    }

    /// Set the post-interrupt grace window
    pub fn interrupt_grace(mut self, grace: Duration) -> Self {
        self.options.interrupt_grace = grace;
        self
    }

    /// Set the graceful-quit grace window
    pub fn quit_grace(mut self, grace: Duration) -> Self {
        self.options.quit_grace = grace;
        self
    }

    /// Override the echo-command template (`{token}` placeholder)
    pub fn echo_format(mut self, format: impl Into<String>) -> Self {
        self.options.echo_format = format.into();
        self
    }

    /// Override the quit command
    pub fn quit_command(mut self, command: impl Into<String>) -> Self {
        self.options.quit_command = command.into();
        self
    }

    /// Build the options
    pub fn build(self) -> DriverOptions {
        self.options
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_parse() {
        assert_eq!(
            Target::parse("/tmp/crash.dmp"),
            Some(Target::dump_file("/tmp/crash.dmp"))
        );
        assert_eq!(
            Target::parse("tcp:Port=5005,Server=build01"),
            Some(Target::remote("tcp:Port=5005,Server=build01"))
        );
        assert_eq!(
            Target::parse("npipe:Pipe=dbg,Server=lab"),
            Some(Target::remote("npipe:Pipe=dbg,Server=lab"))
        );
        assert_eq!(Target::parse("   "), None);
    }

    #[test]
    fn test_target_args() {
        let dump = Target::dump_file("/tmp/x.dmp");
        assert_eq!(dump.to_args(), vec!["-z", "/tmp/x.dmp"]);

        let remote = Target::remote("tcp:Port=9,Server=a");
        assert_eq!(remote.to_args(), vec!["-remote", "tcp:Port=9,Server=a"]);
    }

    #[test]
    fn test_options_builder() {
        let options = DriverOptions::builder()
            .executable("/opt/debuggers/cdb")
            .symbols_path("srv*C:\\symbols*https://msdl.microsoft.com/download/symbols")
            .command_timeout(Duration::from_secs(120))
            .interrupt_grace(Duration::from_millis(500))
            .extra_arg("-lines")
            .build();

        assert_eq!(options.executable, Some(PathBuf::from("/opt/debuggers/cdb")));
        assert_eq!(options.command_timeout, Duration::from_secs(120));
        assert_eq!(options.interrupt_grace, Duration::from_millis(500));
        assert_eq!(options.extra_args, vec!["-lines"]);
        // Untouched fields keep their defaults
        assert_eq!(options.echo_format, ".echo {token}");
        assert_eq!(options.quit_command, "q");
    }
}
