//! Device access seams
//!
//! Flows only see a [`Connector`] that hands out fresh [`DeviceSession`]s.
//! Each flow opens its own session and closes it when done; sessions are
//! never pooled or shared between flows.

use async_trait::async_trait;

use crate::error::Result;
use crate::ssh::{RemoteExecutor, SshConfig, SshSession};
use crate::transfer::{RemoteFs, ScpTransport, TransferStrategy};

/// One authenticated connection: a shell plus a filesystem
#[async_trait]
pub trait DeviceSession: RemoteExecutor {
    /// The device filesystem (SFTP for real sessions)
    async fn fs(&self) -> Result<&dyn RemoteFs>;

    async fn close(&self);

    fn as_executor(&self) -> &dyn RemoteExecutor;
}

/// Opens new sessions to one device
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn DeviceSession>>;

    /// Transport to try before SFTP for single-file transfers
    fn external_transport(&self) -> Option<&dyn TransferStrategy> {
        None
    }

    /// `user@host:port`, for messages
    fn target(&self) -> String;
}

#[async_trait]
impl DeviceSession for SshSession {
    async fn fs(&self) -> Result<&dyn RemoteFs> {
        let sftp = self.sftp().await?;
        Ok(sftp)
    }

    async fn close(&self) {
        SshSession::close(self).await
    }

    fn as_executor(&self) -> &dyn RemoteExecutor {
        self
    }
}

/// Connects over SSH with a fixed configuration
#[derive(Debug, Clone)]
pub struct SshConnector {
    config: SshConfig,
    scp: Option<ScpTransport>,
}

impl SshConnector {
    pub fn new(config: SshConfig) -> Self {
        Self { config, scp: None }
    }

    /// Use an external `scp` for single-file transfers
    pub fn with_scp(mut self, scp: Option<ScpTransport>) -> Self {
        self.scp = scp;
        self
    }

    pub fn config(&self) -> &SshConfig {
        &self.config
    }
}

#[async_trait]
impl Connector for SshConnector {
    async fn connect(&self) -> Result<Box<dyn DeviceSession>> {
        let session = SshSession::connect(&self.config).await?;
        Ok(Box::new(session))
    }

    fn external_transport(&self) -> Option<&dyn TransferStrategy> {
        self.scp.as_ref().map(|scp| scp as &dyn TransferStrategy)
    }

    fn target(&self) -> String {
        format!("{}@{}", self.config.username, self.config.address())
    }
}
