//! Remote command construction
//!
//! The device side is a bare POSIX shell, so commands are plain strings.
//! [`RemoteCommand`] keeps the quoting rules in one place: program names and
//! shell fragments are trusted, every argument is quoted.

use std::fmt;

use super::sanitize::shell_quote;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCommand {
    line: String,
}

impl RemoteCommand {
    /// Start a command with a trusted program name
    pub fn new(program: &str) -> Self {
        Self {
            line: program.to_string(),
        }
    }

    /// A trusted shell fragment, used verbatim
    pub fn raw(fragment: impl Into<String>) -> Self {
        Self {
            line: fragment.into(),
        }
    }

    /// Append one quoted argument
    pub fn arg(mut self, value: impl AsRef<str>) -> Self {
        self.line.push(' ');
        self.line.push_str(&shell_quote(value.as_ref()));
        self
    }

    /// Append several quoted arguments
    pub fn args<I, S>(self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        values.into_iter().fold(self, |cmd, v| cmd.arg(v))
    }

    /// `self && next`
    pub fn and(self, next: RemoteCommand) -> Self {
        self.join(" && ", next)
    }

    /// `self || next`
    pub fn or(self, next: RemoteCommand) -> Self {
        self.join(" || ", next)
    }

    /// `self; next`
    pub fn then(self, next: RemoteCommand) -> Self {
        self.join("; ", next)
    }

    /// `(self)`
    pub fn group(self) -> Self {
        Self {
            line: format!("({})", self.line),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.line
    }

    pub fn into_string(self) -> String {
        self.line
    }

    fn join(mut self, sep: &str, next: RemoteCommand) -> Self {
        self.line.push_str(sep);
        self.line.push_str(&next.line);
        self
    }
}

impl fmt::Display for RemoteCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.line)
    }
}

impl From<RemoteCommand> for String {
    fn from(cmd: RemoteCommand) -> Self {
        cmd.line
    }
}
