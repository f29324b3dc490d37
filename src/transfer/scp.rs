//! External `scp` transport
//!
//! Used as the first transfer strategy when a system `scp` binary is
//! available. Runs non-interactively, so it only succeeds when the device
//! accepts the user's own SSH keys; otherwise the engine falls back to SFTP.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use super::engine::TransferStrategy;
use super::progress::ProgressMeter;
use crate::error::{IsyncError, Result};
use crate::ssh::shell_quote;

const TOOL: &str = "scp";

/// Invokes `scp -P <port> -q -o BatchMode=yes <src> <dst>`
#[derive(Debug, Clone)]
pub struct ScpTransport {
    program: PathBuf,
    host: String,
    port: u16,
    username: String,
}

impl ScpTransport {
    pub fn new(
        program: impl Into<PathBuf>,
        host: impl Into<String>,
        port: u16,
        username: impl Into<String>,
    ) -> Self {
        Self {
            program: program.into(),
            host: host.into(),
            port,
            username: username.into(),
        }
    }

    /// Look `scp` up on `PATH`
    pub fn discover(host: &str, port: u16, username: &str) -> Option<Self> {
        match which::which(TOOL) {
            Ok(program) => {
                debug!("Found external transport at {}", program.display());
                Some(Self::new(program, host, port, username))
            }
            Err(e) => {
                debug!("No external scp available: {}", e);
                None
            }
        }
    }

    /// `user@host:path`; the remote side runs the path through a shell
    fn remote_spec(&self, remote: &str) -> String {
        format!("{}@{}:{}", self.username, self.host, shell_quote(remote))
    }

    /// Arguments for copying `src` to `dst`
    pub fn args(&self, src: &str, dst: &str) -> Vec<String> {
        vec![
            "-P".to_string(),
            self.port.to_string(),
            "-q".to_string(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            src.to_string(),
            dst.to_string(),
        ]
    }

    async fn run(&self, src: &str, dst: &str, subject: &str) -> Result<()> {
        let output = Command::new(&self.program)
            .args(self.args(src, dst))
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| IsyncError::local_tool(self.program.display().to_string(), e))?;

        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let cause = match output.status.code() {
            Some(code) => format!("scp exited with status {}: {}", code, stderr.trim()),
            None => format!("scp terminated by signal: {}", stderr.trim()),
        };
        Err(IsyncError::transfer(subject, cause))
    }
}

/// A relative local path with a `:` before any `/` would be read as a host
fn local_spec(local: &Path) -> String {
    let path = local.display().to_string();
    let colon_first = match (path.find(':'), path.find('/')) {
        (Some(colon), Some(slash)) => colon < slash,
        (Some(_), None) => true,
        _ => false,
    };
    if colon_first && !local.is_absolute() {
        format!("./{}", path)
    } else {
        path
    }
}

#[async_trait]
impl TransferStrategy for ScpTransport {
    fn name(&self) -> &str {
        TOOL
    }

    async fn upload(&self, local: &Path, remote: &str, progress: &mut ProgressMeter) -> Result<()> {
        let src = local_spec(local);
        self.run(&src, &self.remote_spec(remote), remote).await?;
        progress.complete();
        Ok(())
    }

    async fn download(&self, remote: &str, local: &Path, progress: &mut ProgressMeter) -> Result<()> {
        let dst = local_spec(local);
        self.run(&self.remote_spec(remote), &dst, remote).await?;
        progress.complete();
        Ok(())
    }
}
