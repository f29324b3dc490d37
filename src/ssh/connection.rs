//! SSH session establishment
//!
//! A [`SshSession`] is created per flow, authenticated with the ordered
//! [`AuthPlan`], and closed when the flow ends. A transport that exhausted
//! every credential strategy is disconnected and never handed out, so a
//! failed session cannot be reused.

use std::sync::Arc;

use async_trait::async_trait;
use russh::client::{self, Handle, Msg};
use russh::keys::{Algorithm, PrivateKey, PrivateKeyWithHashAlg};
use russh::Channel;
use tokio::sync::OnceCell;
use tokio::time::timeout;
use tracing::{debug, error, info};

use super::auth::{authenticate, AuthMethod, AuthPlan, Authenticator};
use super::command::{stream_output, ChannelSource, RemoteExecutor};
use super::config::{KeyKind, SshConfig, CONNECT_TIMEOUT};
use super::handler::DeviceHandler;
use super::output::{present, OutputEvent, OutputSink};
use crate::error::{IsyncError, Result};
use crate::transfer::sftp::SftpFs;

/// An authenticated connection to a device
pub struct SshSession {
    /// `user@host:port`, for logging
    label: String,

    handle: Handle<DeviceHandler>,

    /// Method that authenticated this session
    method: AuthMethod,

    /// SFTP subsystem, opened on first use
    sftp: OnceCell<SftpFs>,
}

impl SshSession {
    /// Connect and authenticate.
    ///
    /// Fails with [`IsyncError::Connect`] when the device cannot be reached
    /// within [`CONNECT_TIMEOUT`], or [`IsyncError::Auth`] once every
    /// configured strategy was rejected.
    pub async fn connect(config: &SshConfig) -> Result<Self> {
        let plan = AuthPlan::from_config(config);
        if plan.is_empty() {
            return Err(IsyncError::invalid_params(
                "No authentication method available (require a private key or password fallback)",
            ));
        }

        info!("Connecting to {}...", config.address());

        let ssh_config = Arc::new(client::Config::default());
        let addr = config.address();
        let connect_result = timeout(
            CONNECT_TIMEOUT,
            client::connect(ssh_config, addr.as_str(), DeviceHandler::new()),
        )
        .await;

        let mut handle = match connect_result {
            Ok(Ok(handle)) => handle,
            Ok(Err(e)) => {
                error!("SSH connection failed: {}", e);
                return Err(IsyncError::connect(e.to_string()));
            }
            Err(_) => {
                error!("SSH connection timeout after {}s", CONNECT_TIMEOUT.as_secs());
                return Err(IsyncError::connect(format!(
                    "Connection timeout after {}s",
                    CONNECT_TIMEOUT.as_secs()
                )));
            }
        };

        let outcome = {
            let mut auth = HandleAuthenticator {
                handle: &mut handle,
                config,
            };
            authenticate(&plan, &mut auth).await
        };

        let method = match outcome {
            Ok(method) => method,
            Err(e) => {
                let _ = handle
                    .disconnect(russh::Disconnect::ByApplication, "", "")
                    .await;
                return Err(e);
            }
        };

        let label = format!("{}@{}", config.username, config.address());
        info!("Connected to {} with {}", label, method);

        Ok(Self {
            label,
            handle,
            method,
            sftp: OnceCell::new(),
        })
    }

    /// The method that authenticated this session
    pub fn auth_method(&self) -> AuthMethod {
        self.method
    }

    /// Open a new session channel
    pub async fn open_channel(&self) -> Result<Channel<Msg>> {
        self.handle
            .channel_open_session()
            .await
            .map_err(|e| IsyncError::Disconnected(format!("Failed to open channel: {}", e)))
    }

    /// The SFTP subsystem for this session
    pub async fn sftp(&self) -> Result<&SftpFs> {
        self.sftp
            .get_or_try_init(|| async {
                let channel = self.open_channel().await?;
                SftpFs::open(channel).await
            })
            .await
    }

    /// Close SFTP (if opened) and disconnect
    pub async fn close(&self) {
        if let Some(sftp) = self.sftp.get() {
            sftp.close().await;
        }

        let _ = self
            .handle
            .disconnect(russh::Disconnect::ByApplication, "", "")
            .await;

        info!("SSH connection to {} closed", self.label);
    }
}

#[async_trait]
impl RemoteExecutor for SshSession {
    async fn exec(&self, command: &str, sink: &mut dyn OutputSink) -> Result<u32> {
        present(sink, OutputEvent::Command(command.to_string()));

        let channel = self.open_channel().await?;
        channel
            .exec(true, command)
            .await
            .map_err(|e| IsyncError::Disconnected(format!("Failed to exec command: {}", e)))?;

        let mut source = ChannelSource::new(channel);
        stream_output(&mut source, sink).await
    }
}

impl std::fmt::Debug for SshSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshSession")
            .field("target", &self.label)
            .field("method", &self.method)
            .field("sftp_open", &self.sftp.initialized())
            .finish()
    }
}

/// Tries single methods against a live russh handle
struct HandleAuthenticator<'a> {
    handle: &'a mut Handle<DeviceHandler>,
    config: &'a SshConfig,
}

impl HandleAuthenticator<'_> {
    fn load_key(&self, kind: KeyKind) -> Result<PrivateKey> {
        let material = self
            .config
            .private_key
            .as_deref()
            .ok_or_else(|| IsyncError::SshKey("no private key configured".to_string()))?;

        let key = russh::keys::decode_secret_key(material, self.config.key_passphrase.as_deref())
            .map_err(|e| IsyncError::SshKey(format!("Failed to load {} key: {}", kind, e)))?;

        let matches = match (kind, key.algorithm()) {
            (KeyKind::Rsa, Algorithm::Rsa { .. }) => true,
            (KeyKind::Ed25519, Algorithm::Ed25519) => true,
            _ => false,
        };
        if !matches {
            return Err(IsyncError::SshKey(format!(
                "configured key is {}, not {}",
                key.algorithm(),
                kind
            )));
        }

        Ok(key)
    }

    async fn try_key(&mut self, kind: KeyKind) -> Result<()> {
        let key = self.load_key(kind)?;

        let hash_alg = match kind {
            KeyKind::Rsa => self
                .handle
                .best_supported_rsa_hash()
                .await
                .map_err(|e| IsyncError::connect(e.to_string()))?
                .flatten(),
            KeyKind::Ed25519 => None,
        };

        let user = self.config.username.clone();
        let attempt = self
            .handle
            .authenticate_publickey(user, PrivateKeyWithHashAlg::new(Arc::new(key), hash_alg));

        let result = timeout(CONNECT_TIMEOUT, attempt)
            .await
            .map_err(|_| IsyncError::connect(format!("{} key authentication timed out", kind)))?
            .map_err(|e| IsyncError::connect(e.to_string()))?;

        if result.success() {
            Ok(())
        } else {
            Err(IsyncError::Rejected(format!("{} key", kind)))
        }
    }

    async fn try_password(&mut self) -> Result<()> {
        let password = self.config.password.clone().unwrap_or_default();
        let user = self.config.username.clone();

        let result = timeout(
            CONNECT_TIMEOUT,
            self.handle.authenticate_password(user, password),
        )
        .await
        .map_err(|_| IsyncError::connect("password authentication timed out"))?
        .map_err(|e| IsyncError::connect(e.to_string()))?;

        if result.success() {
            Ok(())
        } else {
            Err(IsyncError::Rejected("password".to_string()))
        }
    }
}

#[async_trait]
impl Authenticator for HandleAuthenticator<'_> {
    async fn attempt(&mut self, method: AuthMethod) -> Result<()> {
        debug!("Authenticating {} with {}", self.config.username, method);
        match method {
            AuthMethod::Key(kind) => self.try_key(kind).await,
            AuthMethod::Password => self.try_password().await,
        }
    }
}
