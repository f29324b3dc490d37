//! SSH session layer
//!
//! Connection establishment with ordered credential fallback, streamed
//! command execution, and the building blocks for the shell command lines
//! the flows send to the device.

pub mod auth;
pub mod command;
pub mod config;
pub mod connection;
pub mod elevation;
pub mod handler;
pub mod output;
pub mod sanitize;
pub mod template;

// Re-exports
pub use auth::{AuthMethod, AuthPlan};
pub use command::{exec_checked, RemoteExecutor};
pub use config::{KeyKind, SshConfig};
pub use connection::SshSession;
pub use handler::DeviceHandler;
pub use output::{CollectingSink, OutputEvent, OutputMode, OutputSink};
pub use sanitize::shell_quote;
pub use template::RemoteCommand;
