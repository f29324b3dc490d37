//! SFTP-backed [`RemoteFs`]

use std::path::Path;

use async_trait::async_trait;
use russh::client::Msg;
use russh::Channel;
use russh_sftp::client::SftpSession;
use russh_sftp::protocol::OpenFlags;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info};

use super::progress::ProgressMeter;
use super::{join_remote, RemoteEntry, RemoteFs, RemoteStat};
use crate::error::{IsyncError, Result};

/// Copy buffer size for put/get
const CHUNK_SIZE: usize = 32 * 1024;

/// The SFTP subsystem of one session
pub struct SftpFs {
    sftp: SftpSession,
}

impl SftpFs {
    /// Start the `sftp` subsystem on a fresh session channel
    pub async fn open(channel: Channel<Msg>) -> Result<Self> {
        channel
            .request_subsystem(true, "sftp")
            .await
            .map_err(|e| IsyncError::Disconnected(format!("Failed to request SFTP subsystem: {}", e)))?;

        let sftp = SftpSession::new(channel.into_stream())
            .await
            .map_err(|e| IsyncError::Disconnected(format!("SFTP handshake failed: {}", e)))?;

        debug!("SFTP subsystem started");
        Ok(Self { sftp })
    }

    pub async fn close(&self) {
        if let Err(e) = self.sftp.close().await {
            debug!("SFTP close failed: {}", e);
        }
    }
}

fn op_error(path: &str, e: impl ToString) -> IsyncError {
    IsyncError::transfer(path, e)
}

#[async_trait]
impl RemoteFs for SftpFs {
    async fn stat(&self, path: &str) -> Result<Option<RemoteStat>> {
        let exists = self
            .sftp
            .try_exists(path)
            .await
            .map_err(|e| op_error(path, e))?;
        if !exists {
            return Ok(None);
        }

        let metadata = self
            .sftp
            .metadata(path)
            .await
            .map_err(|e| op_error(path, e))?;

        Ok(Some(RemoteStat {
            is_dir: metadata.is_dir(),
            size: metadata.size.unwrap_or(0),
        }))
    }

    async fn mkdir(&self, path: &str) -> Result<()> {
        self.sftp
            .create_dir(path)
            .await
            .map_err(|e| op_error(path, e))
    }

    async fn read_dir(&self, path: &str) -> Result<Vec<RemoteEntry>> {
        let read_dir = self
            .sftp
            .read_dir(path)
            .await
            .map_err(|e| op_error(path, e))?;

        let mut entries = Vec::new();
        for entry in read_dir {
            let name = entry.file_name();
            if name == "." || name == ".." {
                continue;
            }
            let metadata = entry.metadata();
            entries.push(RemoteEntry {
                path: join_remote(path, &name),
                is_dir: metadata.is_dir(),
                size: metadata.size.unwrap_or(0),
                modified: metadata.mtime.map(u64::from),
                name,
            });
        }

        debug!("Listed {} entries in {}", entries.len(), path);
        Ok(entries)
    }

    async fn remove_file(&self, path: &str) -> Result<()> {
        self.sftp
            .remove_file(path)
            .await
            .map_err(|e| op_error(path, e))
    }

    async fn remove_dir(&self, path: &str) -> Result<()> {
        self.sftp
            .remove_dir(path)
            .await
            .map_err(|e| op_error(path, e))
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        self.sftp
            .rename(from, to)
            .await
            .map_err(|e| op_error(from, e))
    }

    async fn put(&self, local: &Path, remote: &str, progress: &mut ProgressMeter) -> Result<()> {
        let mut source = tokio::fs::File::open(local)
            .await
            .map_err(|e| op_error(&local.display().to_string(), e))?;
        let total = source.metadata().await?.len();

        let mut target = self
            .sftp
            .open_with_flags(
                remote,
                OpenFlags::CREATE | OpenFlags::TRUNCATE | OpenFlags::WRITE,
            )
            .await
            .map_err(|e| op_error(remote, e))?;

        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut sent = 0u64;
        loop {
            let n = source.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            target
                .write_all(&buf[..n])
                .await
                .map_err(|e| op_error(remote, e))?;
            sent += n as u64;
            progress.update(sent, total);
        }

        target.flush().await.map_err(|e| op_error(remote, e))?;
        target.shutdown().await.map_err(|e| op_error(remote, e))?;
        progress.update(total, total);

        info!("Uploaded {} ({} bytes) via SFTP", remote, sent);
        Ok(())
    }

    async fn get(&self, remote: &str, local: &Path, progress: &mut ProgressMeter) -> Result<()> {
        let total = self
            .sftp
            .metadata(remote)
            .await
            .map_err(|e| op_error(remote, e))?
            .size
            .unwrap_or(0);

        let mut source = self
            .sftp
            .open(remote)
            .await
            .map_err(|e| op_error(remote, e))?;
        let mut target = tokio::fs::File::create(local)
            .await
            .map_err(|e| op_error(&local.display().to_string(), e))?;

        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut received = 0u64;
        loop {
            let n = source.read(&mut buf).await.map_err(|e| op_error(remote, e))?;
            if n == 0 {
                break;
            }
            target.write_all(&buf[..n]).await?;
            received += n as u64;
            progress.update(received, total);
        }

        target.flush().await?;
        progress.update(total, total);

        info!("Downloaded {} ({} bytes) via SFTP", remote, received);
        Ok(())
    }
}
