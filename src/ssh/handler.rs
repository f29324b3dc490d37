//! SSH client handler implementation
//!
//! Implements the `russh::client::Handler` trait to handle SSH connection events.

use tracing::debug;

/// SSH client handler for russh
///
/// Jailbroken devices regenerate host keys on every re-jailbreak, so the
/// handler accepts whatever key the device presents (auto-add policy).
#[derive(Debug, Clone, Default)]
pub struct DeviceHandler;

impl DeviceHandler {
    pub fn new() -> Self {
        Self
    }
}

impl russh::client::Handler for DeviceHandler {
    type Error = anyhow::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &russh::keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        debug!("Accepting device host key ({})", server_public_key.algorithm());
        Ok(true)
    }
}
