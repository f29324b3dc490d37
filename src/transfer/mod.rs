//! File transfer layer
//!
//! [`RemoteFs`] is the device filesystem as seen through SFTP. The
//! [`TransferEngine`] builds single-file, tree and batch transfers on top of
//! it, optionally trying an external `scp` binary first.

pub mod engine;
#[cfg(test)]
pub mod memory;
pub mod progress;
pub mod scp;
pub mod sftp;

use std::path::Path;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::Result;

pub use engine::{BatchReport, TransferEngine, TransferItem, TransferStrategy, TreeReport};
pub use progress::{ProgressMeter, ProgressObserver};
pub use scp::ScpTransport;
pub use sftp::SftpFs;

/// Kind and size of a remote path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteStat {
    pub is_dir: bool,
    pub size: u64,
}

/// One directory entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteEntry {
    pub name: String,
    pub path: String,
    pub is_dir: bool,
    pub size: u64,
    /// Seconds since the epoch, when the server reports it
    pub modified: Option<u64>,
}

/// Device filesystem operations
#[async_trait]
pub trait RemoteFs: Send + Sync {
    /// `None` when the path does not exist
    async fn stat(&self, path: &str) -> Result<Option<RemoteStat>>;

    async fn mkdir(&self, path: &str) -> Result<()>;

    /// Entries of `path`, without `.` and `..`
    async fn read_dir(&self, path: &str) -> Result<Vec<RemoteEntry>>;

    async fn remove_file(&self, path: &str) -> Result<()>;

    /// Remove an empty directory
    async fn remove_dir(&self, path: &str) -> Result<()>;

    async fn rename(&self, from: &str, to: &str) -> Result<()>;

    /// Copy a local file to `remote`, creating or truncating it
    async fn put(&self, local: &Path, remote: &str, progress: &mut ProgressMeter) -> Result<()>;

    /// Copy `remote` into a local file, creating or truncating it
    async fn get(&self, remote: &str, local: &Path, progress: &mut ProgressMeter) -> Result<()>;

    async fn exists(&self, path: &str) -> Result<bool> {
        Ok(self.stat(path).await?.is_some())
    }
}

/// Join a remote directory and a name with exactly one `/`
pub fn join_remote(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        return name.to_string();
    }
    format!("{}/{}", dir.trim_end_matches('/'), name.trim_start_matches('/'))
}

/// Parent directory of a remote path (`/` for top-level paths)
pub fn remote_parent(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(idx) => trimmed[..idx].to_string(),
    }
}

/// Final component of a remote path
pub fn remote_basename(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    trimmed.rsplit('/').next().unwrap_or(trimmed)
}

/// Sort entries the way the explorer shows them: directories first, then
/// case-insensitive by name.
pub fn sort_entries(entries: &mut [RemoteEntry]) {
    entries.sort_by(|a, b| {
        b.is_dir
            .cmp(&a.is_dir)
            .then_with(|| a.name.to_lowercase().cmp(&b.name.to_lowercase()))
    });
}
