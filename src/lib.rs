//! isync - manage a jailbroken iOS device over SSH/SFTP
//!
//! This crate connects to a device running an SSH server, runs shell
//! commands on it and moves files to and from it. On top of that sit the
//! flows a user actually asks for: installing IPA and .deb packages,
//! dropping `.app` bundles into the applications directory, batch installs
//! and a small file explorer.
//!
//! # Layers
//!
//! - [`ssh`]: connection with ordered credential fallback (each key kind,
//!   then password), streamed command execution, shell quoting
//! - [`transfer`]: SFTP file operations, recursive upload and delete,
//!   optional external `scp` tried first
//! - [`archive`]: IPA extraction and bundle packing
//! - [`flows`]: the named end-to-end operations
//! - [`app`]: application state and the per-action worker dispatcher
//!
//! # Example Usage (CLI)
//!
//! ```bash
//! isync --host=192.168.1.20 --password=alpine install-deb ./tweak.deb
//! isync --host=iphone.local --key ~/.ssh/id_ed25519 appdrop ./MyApp.ipa
//! ```

pub mod app;
pub mod archive;
pub mod config;
pub mod device;
pub mod error;
pub mod flows;
pub mod ssh;
pub mod transfer;

// Re-exports for convenience
pub use app::{Action, AppEvent, AppState, Dispatcher};
pub use config::{Args, Config};
pub use device::{Connector, DeviceSession, SshConnector};
pub use error::{IsyncError, Result};
pub use flows::{FlowContext, FlowOptions, FlowOutcome, FlowState};
pub use ssh::{shell_quote, OutputEvent, OutputMode, OutputSink, SshConfig, SshSession};
pub use transfer::{BatchReport, TransferEngine};
