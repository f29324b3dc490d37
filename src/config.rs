//! Configuration and CLI argument parsing for isync

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::app::Action;
use crate::error::{IsyncError, Result};
use crate::flows::templates::ipainstaller_args;
use crate::flows::{FlowOptions, Installer};
use crate::ssh::{KeyKind, OutputMode, SshConfig};
use crate::transfer::ScpTransport;

/// Explorer directory listed when none is given
pub const DEFAULT_LIST_DIR: &str = "/var/mobile";

/// isync CLI arguments
#[derive(Parser, Debug, Clone)]
#[command(name = "isync")]
#[command(version)]
#[command(about = "Manage a jailbroken iOS device over SSH/SFTP")]
pub struct Args {
    /// Device hostname or IP address
    #[arg(long, global = true, env = "ISYNC_HOST")]
    pub host: Option<String>,

    /// SSH port
    #[arg(long, global = true, default_value = "22", env = "ISYNC_PORT")]
    pub port: u16,

    /// SSH username
    #[arg(long, global = true, default_value = "root", env = "ISYNC_USER")]
    pub user: String,

    /// Password, tried after every key kind has been rejected
    #[arg(long, global = true, env = "ISYNC_PASSWORD")]
    pub password: Option<String>,

    /// Never fall back to password authentication
    #[arg(long, global = true, env = "ISYNC_NO_PASSWORD_FALLBACK")]
    pub no_password_fallback: bool,

    /// Path to an SSH private key file
    #[arg(long, global = true, env = "ISYNC_KEY")]
    pub key: Option<PathBuf>,

    /// Passphrase for the private key
    #[arg(long, global = true, env = "ISYNC_KEY_PASSPHRASE")]
    pub key_passphrase: Option<String>,

    /// Only try the key as this kind (rsa, ed25519)
    #[arg(long, global = true, env = "ISYNC_KEY_KIND")]
    pub key_kind: Option<KeyKind>,

    /// Try the system `scp` before SFTP for single-file transfers
    #[arg(long, global = true, env = "ISYNC_SCP")]
    pub scp: bool,

    /// Explicit path of the `scp` binary (implies --scp)
    #[arg(long, global = true, env = "ISYNC_SCP_PATH")]
    pub scp_path: Option<PathBuf>,

    /// Install IPAs with `appinst` instead of `ipainstaller`
    #[arg(long, global = true)]
    pub appinst: bool,

    /// Do not respring or refresh the icon cache after installing
    #[arg(long, global = true, env = "ISYNC_NO_RESPRING")]
    pub no_respring: bool,

    /// Stop a batch at the first failed item
    #[arg(long, global = true)]
    pub stop_on_error: bool,

    /// Print events as JSON lines
    #[arg(long, global = true)]
    pub json: bool,

    /// Show command output only
    #[arg(long, global = true, conflicts_with = "commands_only")]
    pub raw: bool,

    /// Show the command lines only
    #[arg(long, global = true)]
    pub commands_only: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Connect, authenticate, disconnect
    TestConnection,
    /// Run a shell command on the device
    Exec {
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },
    /// Upload an IPA to /var/mobile/ipas and install it
    InstallIpa {
        ipa: PathBuf,
        /// ipainstaller flag, optionally with a value (`-u=com.a,com.b`)
        #[arg(long = "flag", allow_hyphen_values = true)]
        flags: Vec<String>,
    },
    /// Run ipainstaller with flags only
    Ipainstaller {
        #[arg(allow_hyphen_values = true)]
        flags: Vec<String>,
    },
    /// Upload a .deb to /var/root and install it with dpkg
    InstallDeb { deb: PathBuf },
    /// Download a .deb and install it
    InstallUrl { url: String },
    /// Install AppSync Unified
    InstallAppsync,
    /// Remove a package with dpkg -r
    Uninstall { package: String },
    /// Place a .app directory or an IPA's bundle into the applications root
    Appdrop { input: PathBuf },
    /// Upload an IPA's bundle to /var/mobile/Payload
    Jailfree { ipa: PathBuf },
    /// Remove leftovers of an earlier app drop
    Cleanup { input: PathBuf },
    /// Jailfree-install several IPAs
    BatchInstall {
        #[arg(required = true)]
        ipas: Vec<PathBuf>,
    },
    /// App-drop every bundle found below a folder
    BatchAppdrop { folder: PathBuf },
    /// Rebuild the icon cache
    Uicache,
    /// Restart SpringBoard
    Respring,
    /// List the device root directory
    PeekRoot,
    /// Report jailbreak mode and AppSync presence
    CheckAppsync,
    /// List installed application bundles
    Apps,
    /// List a remote directory
    Ls {
        #[arg(default_value = DEFAULT_LIST_DIR)]
        path: String,
    },
    /// Upload local files into a remote directory
    Upload {
        #[arg(required = true)]
        files: Vec<PathBuf>,
        #[arg(long)]
        to: String,
    },
    /// Download remote files into a local directory
    Download {
        #[arg(required = true)]
        remotes: Vec<String>,
        #[arg(long, default_value = ".")]
        to: PathBuf,
    },
    /// Delete a remote file or directory tree
    Rm { path: String },
    /// Create a remote directory
    Mkdir { path: String },
    /// Rename a remote path
    Mv { from: String, to: String },
}

/// Parsed and validated configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub ssh: SshConfig,

    /// External transport, when enabled and found
    pub scp: Option<ScpTransport>,

    pub flow: FlowOptions,

    pub output: OutputMode,

    /// Emit JSON lines instead of rendered text
    pub json: bool,

    pub action: Action,
}

impl Config {
    /// Create Config from CLI Args
    pub fn from_args(args: Args) -> Result<Self> {
        validate_args(&args)?;

        let host = args.host.clone().unwrap_or_default();
        let mut ssh = SshConfig::new(host.trim(), args.user.trim()).with_port(args.port);

        if let Some(path) = &args.key {
            let key = std::fs::read_to_string(path).map_err(|e| {
                IsyncError::SshKey(format!("cannot read {}: {}", path.display(), e))
            })?;
            ssh = ssh.with_private_key(key);
        }
        if let Some(passphrase) = sanitize_password(args.key_passphrase.clone()) {
            ssh = ssh.with_key_passphrase(passphrase);
        }
        if let Some(kind) = args.key_kind {
            ssh = ssh.pin_key_kind(kind);
        }
        if let Some(password) = sanitize_password(args.password.clone()) {
            ssh = ssh.with_password(password);
        }
        if args.no_password_fallback {
            ssh.allow_password = false;
        }

        let scp = match &args.scp_path {
            Some(program) => Some(ScpTransport::new(
                program.clone(),
                ssh.host.clone(),
                ssh.port,
                ssh.username.clone(),
            )),
            None if args.scp => ScpTransport::discover(&ssh.host, ssh.port, &ssh.username),
            None => None,
        };

        let output = if args.raw {
            OutputMode::Raw
        } else if args.commands_only {
            OutputMode::CommandsOnly
        } else {
            OutputMode::Normal
        };

        let installer = if args.appinst {
            Installer::Appinst
        } else {
            let flags = match &args.command {
                Command::InstallIpa { flags, .. } => flags.as_slice(),
                _ => &[],
            };
            Installer::IpaInstaller {
                args: ipainstaller_args(&split_flags(flags)),
            }
        };

        let flow = FlowOptions {
            no_respring: args.no_respring,
            continue_on_error: !args.stop_on_error,
            installer,
        };

        Ok(Config {
            ssh,
            scp,
            flow,
            output,
            json: args.json,
            action: action_for(args.command),
        })
    }
}

/// Validate CLI arguments
fn validate_args(args: &Args) -> Result<()> {
    let mut errors = Vec::new();

    if args.host.as_deref().map_or(true, |h| h.trim().is_empty()) {
        errors.push("Missing required --host".to_string());
    }

    if args.user.trim().is_empty() {
        errors.push("--user must not be empty".to_string());
    }

    let has_password = sanitize_password(args.password.clone()).is_some();
    if args.key.is_none() && (!has_password || args.no_password_fallback) {
        errors.push("Must provide --key, or --password with password fallback enabled".to_string());
    }

    if let Some(ref key_path) = args.key {
        if !key_path.exists() {
            errors.push(format!("SSH key file not found: {}", key_path.display()));
        }
    }

    if args.key_kind.is_some() && args.key.is_none() {
        errors.push("--key-kind requires --key".to_string());
    }

    if let Some(ref scp) = args.scp_path {
        if !scp.exists() {
            errors.push(format!("scp binary not found: {}", scp.display()));
        }
    }

    if !errors.is_empty() {
        return Err(IsyncError::Config(format!(
            "Configuration error:\n{}",
            errors.join("\n")
        )));
    }

    Ok(())
}

/// `-u=com.a,com.b` → (`-u`, `com.a,com.b`); a bare flag has no value
fn split_flags(flags: &[String]) -> Vec<(String, Option<String>)> {
    flags
        .iter()
        .map(|flag| match flag.split_once('=') {
            Some((name, value)) => (name.trim().to_string(), Some(value.to_string())),
            None => (flag.trim().to_string(), None),
        })
        .collect()
}

fn action_for(command: Command) -> Action {
    match command {
        Command::TestConnection => Action::TestConnection,
        Command::Exec { command } => Action::RunCommand(command.join(" ")),
        Command::InstallIpa { ipa, .. } => Action::InstallIpa(ipa),
        Command::Ipainstaller { flags } => {
            Action::RunIpainstaller(ipainstaller_args(&split_flags(&flags)))
        }
        Command::InstallDeb { deb } => Action::InstallDeb(deb),
        Command::InstallUrl { url } => Action::InstallDebFromUrl(url),
        Command::InstallAppsync => Action::InstallAppSync,
        Command::Uninstall { package } => Action::UninstallPackage(package),
        Command::Appdrop { input } => Action::Appdrop(input),
        Command::Jailfree { ipa } => Action::JailfreeInstall(ipa),
        Command::Cleanup { input } => Action::CleanupLeftovers(input),
        Command::BatchInstall { ipas } => Action::BatchInstallIpas(ipas),
        Command::BatchAppdrop { folder } => Action::BatchAppdrop(folder),
        Command::Uicache => Action::Uicache,
        Command::Respring => Action::Respring,
        Command::PeekRoot => Action::PeekRoot,
        Command::CheckAppsync => Action::CheckAppSync,
        Command::Apps => Action::ListApplications,
        Command::Ls { path } => Action::ListDir(path),
        Command::Upload { files, to } => Action::UploadFiles {
            files,
            remote_dir: to,
        },
        Command::Download { remotes, to } => Action::DownloadFiles {
            remotes,
            local_dir: to,
        },
        Command::Rm { path } => Action::Delete(path),
        Command::Mkdir { path } => Action::Mkdir(path),
        Command::Mv { from, to } => Action::Rename { from, to },
    }
}

/// Sanitize password: return None if empty
fn sanitize_password(password: Option<String>) -> Option<String> {
    password.filter(|p| !p.is_empty())
}
