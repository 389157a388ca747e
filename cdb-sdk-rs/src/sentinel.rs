//! Sentinel tokens for output framing
//!
//! The debugger's output is an unframed byte stream. After every command the
//! driver issues an echo command that prints a literal token; everything read
//! before the token line belongs to the command. The token is generated once
//! per driver start with enough entropy that command output cannot guess it,
//! and regenerated on every restart.

use rand::Rng;
use rand::distributions::Alphanumeric;

/// Number of random alphanumeric characters in a token. 20 characters of
/// base-62 carry well over 64 bits of entropy.
const TOKEN_LEN: usize = 20;

const TOKEN_PREFIX: &str = "DBG_END_";

/// A high-entropy marker that delimits command output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentinelToken(String);

impl SentinelToken {
    /// Generate a fresh token
    pub fn generate() -> Self {
        let suffix: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(TOKEN_LEN)
            .map(char::from)
            .collect();
        Self(format!("{TOKEN_PREFIX}{suffix}"))
    }

    /// The token text
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Render the echo command for this token from a `{token}` template
    pub fn echo_command(&self, format: &str) -> String {
        format.replace("{token}", &self.0)
    }

    /// True iff `line` is exactly the token (modulo surrounding whitespace).
    /// A line that merely contains the token does not match, so output that
    /// quotes the token cannot terminate framing early.
    pub fn matches_line(&self, line: &str) -> bool {
        line.trim() == self.0
    }
}

impl std::fmt::Display for SentinelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_length_and_prefix() {
        let token = SentinelToken::generate();
        assert!(token.as_str().starts_with(TOKEN_PREFIX));
        assert_eq!(token.as_str().len(), TOKEN_PREFIX.len() + TOKEN_LEN);
    }

    #[test]
    fn test_tokens_are_unique_per_generation() {
        let a = SentinelToken::generate();
        let b = SentinelToken::generate();
        assert_ne!(a, b);
    }

    #[test]
    fn test_matches_exact_line_only() {
        let token = SentinelToken::generate();
        assert!(token.matches_line(token.as_str()));
        assert!(token.matches_line(&format!("  {token}  ")));

        // Output that embeds the token must not end framing
        assert!(!token.matches_line(&format!("0:000> .echo {token}")));
        assert!(!token.matches_line(&format!("{token} trailing")));
        assert!(!token.matches_line(&format!("prefix {token}")));
    }

    #[test]
    fn test_echo_command_rendering() {
        let token = SentinelToken::generate();
        let cmd = token.echo_command(".echo {token}");
        assert_eq!(cmd, format!(".echo {token}"));

        let shell = token.echo_command("echo {token}");
        assert_eq!(shell, format!("echo {token}"));
    }
}
