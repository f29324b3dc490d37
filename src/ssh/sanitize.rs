//! Command sanitization and shell quoting
//!
//! Every value interpolated into a remote command line goes through
//! [`shell_quote`], which is safe for a minimal POSIX `sh`.

use std::borrow::Cow;

use crate::error::{IsyncError, Result};

/// Sanitize a user-typed command before execution
///
/// Trims whitespace, rejects empty commands and, when `max_chars` is set,
/// commands longer than the limit.
///
/// # Examples
/// ```
/// use isync::ssh::sanitize::sanitize_command;
///
/// let cmd = sanitize_command("  ls -la /var/mobile  ", Some(1000)).unwrap();
/// assert_eq!(cmd, "ls -la /var/mobile");
///
/// assert!(sanitize_command("a".repeat(100).as_str(), Some(50)).is_err());
/// ```
pub fn sanitize_command(command: &str, max_chars: Option<usize>) -> Result<String> {
    let trimmed = command.trim();

    if trimmed.is_empty() {
        return Err(IsyncError::invalid_params("Command cannot be empty"));
    }

    if let Some(max) = max_chars {
        if trimmed.len() > max {
            return Err(IsyncError::invalid_params(format!(
                "Command is too long (max {} characters, got {})",
                max,
                trimmed.len()
            )));
        }
    }

    Ok(trimmed.to_string())
}

fn is_safe(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '@' | '%' | '+' | '=' | ':' | '/' | '-' | '_' | '.' | ',')
}

/// Quote `s` as a single shell word.
///
/// Words made only of ASCII alphanumerics and `@%+=:/-_.,` pass through
/// unchanged; anything else is single-quoted with embedded quotes written
/// as `'\''`. The empty string becomes `''`.
///
/// # Examples
/// ```
/// use isync::ssh::sanitize::shell_quote;
///
/// assert_eq!(shell_quote("/var/mobile/App.zip"), "/var/mobile/App.zip");
/// assert_eq!(shell_quote("My App.app"), "'My App.app'");
/// assert_eq!(shell_quote("it's"), "'it'\\''s'");
/// assert_eq!(shell_quote(""), "''");
/// ```
pub fn shell_quote(s: &str) -> Cow<'_, str> {
    if s.is_empty() {
        return Cow::Borrowed("''");
    }

    if s.chars().all(is_safe) {
        return Cow::Borrowed(s);
    }

    Cow::Owned(format!("'{}'", s.replace('\'', "'\\''")))
}
