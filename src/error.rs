//! Error types for isync

use thiserror::Error;

/// Main error type for isync
#[derive(Debug, Error)]
pub enum IsyncError {
    /// The device could not be reached (DNS, TCP, SSH handshake, timeout)
    #[error("could not reach device: {0}")]
    Connect(String),

    /// Every configured credential strategy was rejected
    #[error("authentication failed (tried {}): {last_error}", attempted.join(", "))]
    Auth {
        attempted: Vec<String>,
        last_error: String,
    },

    /// The device refused one credential
    #[error("credentials rejected: {0}")]
    Rejected(String),

    /// A single file transfer failed
    #[error("transfer of {path} failed: {cause}")]
    Transfer { path: String, cause: String },

    /// A remote command ran and exited non-zero
    #[error("remote command exited with status {exit_code}: {command}")]
    RemoteCommand {
        command: String,
        exit_code: u32,
        output: String,
    },

    /// A local helper binary (scp) could not be started
    #[error("local tool {tool} failed to start: {cause}")]
    LocalTool { tool: String, cause: String },

    /// The SSH channel ended before the remote process reported an exit status
    #[error("connection lost while running command: {0}")]
    Disconnected(String),

    /// Reading or writing an IPA/zip archive failed
    #[error("archive error: {0}")]
    Archive(String),

    /// Invalid parameters provided
    #[error("invalid parameters: {0}")]
    InvalidParams(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// SSH key parsing error
    #[error("SSH key error: {0}")]
    SshKey(String),

    /// HTTP download failed
    #[error("download failed: {0}")]
    Http(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias using IsyncError
pub type Result<T> = std::result::Result<T, IsyncError>;

impl IsyncError {
    /// Create a connect error from a string
    pub fn connect(msg: impl Into<String>) -> Self {
        IsyncError::Connect(msg.into())
    }

    /// Create a transfer error for `path`
    pub fn transfer(path: impl Into<String>, cause: impl ToString) -> Self {
        IsyncError::Transfer {
            path: path.into(),
            cause: cause.to_string(),
        }
    }

    /// Create a local tool error
    pub fn local_tool(tool: impl Into<String>, cause: impl ToString) -> Self {
        IsyncError::LocalTool {
            tool: tool.into(),
            cause: cause.to_string(),
        }
    }

    /// Create an archive error from anything displayable
    pub fn archive(cause: impl ToString) -> Self {
        IsyncError::Archive(cause.to_string())
    }

    /// Create an invalid params error from a string
    pub fn invalid_params(msg: impl Into<String>) -> Self {
        IsyncError::InvalidParams(msg.into())
    }

    /// Create a config error from a string
    pub fn config(msg: impl Into<String>) -> Self {
        IsyncError::Config(msg.into())
    }

    /// True when the device was reached and a remote command ran but failed.
    ///
    /// Everything else is a local or transport problem.
    pub fn is_remote_failure(&self) -> bool {
        matches!(self, IsyncError::RemoteCommand { .. })
    }

    /// Exit code of a failed remote command
    pub fn exit_code(&self) -> Option<u32> {
        match self {
            IsyncError::RemoteCommand { exit_code, .. } => Some(*exit_code),
            _ => None,
        }
    }
}

impl From<zip::result::ZipError> for IsyncError {
    fn from(err: zip::result::ZipError) -> Self {
        IsyncError::Archive(err.to_string())
    }
}

impl From<walkdir::Error> for IsyncError {
    fn from(err: walkdir::Error) -> Self {
        match err.into_io_error() {
            Some(io) => IsyncError::Io(io),
            None => IsyncError::Io(std::io::Error::other("filesystem loop detected")),
        }
    }
}

impl From<reqwest::Error> for IsyncError {
    fn from(err: reqwest::Error) -> Self {
        IsyncError::Http(err.to_string())
    }
}
