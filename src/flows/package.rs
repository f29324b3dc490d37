//! Package flows: IPA and .deb install, package removal

use std::path::Path;

use tracing::{info, warn};

use super::templates::{self, DEB_DIR, IPAS_DIR};
use super::{finish, require_file, FlowContext, FlowOutcome, FlowState, FlowTracker, Installer};
use crate::device::DeviceSession;
use crate::error::{IsyncError, Result};
use crate::ssh::output::{message, OutputSink};
use crate::ssh::exec_checked;
use crate::transfer::join_remote;

/// Upload `local` into `remote_dir` unless a file of that name is already
/// there. Returns the remote path.
async fn upload_unless_present(
    ctx: &FlowContext,
    session: &dyn DeviceSession,
    local: &Path,
    file_name: &str,
    remote_dir: &str,
    sink: &mut dyn OutputSink,
) -> Result<String> {
    let fs = session.fs().await?;
    let remote = join_remote(remote_dir, file_name);

    if fs.exists(&remote).await? {
        message(sink, format!("Remote exists, skipping upload: {}", remote));
        return Ok(remote);
    }

    let engine = ctx.engine(fs);
    engine.ensure_remote_dir(remote_dir).await;
    message(sink, format!("Uploading {} -> {}", local.display(), remote));
    engine.upload_file(local, &remote).await?;
    Ok(remote)
}

/// Upload an IPA to `/var/mobile/ipas` and install it with the configured
/// installer
pub async fn install_ipa(ctx: &FlowContext, ipa: &Path, sink: &mut dyn OutputSink) -> FlowOutcome {
    let mut tracker = ctx.tracker("install_ipa");
    let result = install_ipa_steps(ctx, ipa, &mut tracker, sink).await;
    finish(tracker, result, sink)
}

async fn install_ipa_steps(
    ctx: &FlowContext,
    ipa: &Path,
    tracker: &mut FlowTracker,
    sink: &mut dyn OutputSink,
) -> Result<()> {
    tracker.advance(FlowState::Validating);
    let file_name = require_file(ipa)?;

    let session = ctx.open(tracker, sink).await?;
    let result = install_ipa_on(ctx, session.as_ref(), ipa, &file_name, tracker, sink).await;
    session.close().await;
    result
}

async fn install_ipa_on(
    ctx: &FlowContext,
    session: &dyn DeviceSession,
    ipa: &Path,
    file_name: &str,
    tracker: &mut FlowTracker,
    sink: &mut dyn OutputSink,
) -> Result<()> {
    tracker.advance(FlowState::Transferring);
    let remote = upload_unless_present(ctx, session, ipa, file_name, IPAS_DIR, sink).await?;

    tracker.advance(FlowState::Executing);
    let shell = session.as_executor();
    match &ctx.options().installer {
        Installer::IpaInstaller { args } => {
            exec_checked(shell, &templates::ipainstaller(args, Some(&remote)), sink).await
        }
        Installer::Appinst => {
            let code = shell.exec(&templates::appinst_install(), sink).await?;
            if code != 0 {
                warn!("appinst install/update exited with {}", code);
            }
            exec_checked(shell, &templates::appinst_run(&remote), sink).await
        }
    }
}

/// Run `ipainstaller` with flags only (`-h` when none are given)
pub async fn run_ipainstaller(
    ctx: &FlowContext,
    args: &[String],
    sink: &mut dyn OutputSink,
) -> FlowOutcome {
    let mut tracker = ctx.tracker("run_ipainstaller");
    let result = run_ipainstaller_steps(ctx, args, &mut tracker, sink).await;
    finish(tracker, result, sink)
}

async fn run_ipainstaller_steps(
    ctx: &FlowContext,
    args: &[String],
    tracker: &mut FlowTracker,
    sink: &mut dyn OutputSink,
) -> Result<()> {
    tracker.advance(FlowState::Validating);
    let args = if args.is_empty() {
        vec!["-h".to_string()]
    } else {
        args.to_vec()
    };

    let session = ctx.open(tracker, sink).await?;
    tracker.advance(FlowState::Executing);
    let result = exec_checked(
        session.as_executor(),
        &templates::ipainstaller(&args, None),
        sink,
    )
    .await;
    session.close().await;
    result
}

/// Upload a .deb to `/var/root`, `dpkg -i` it, then fix dependencies
pub async fn install_deb(ctx: &FlowContext, deb: &Path, sink: &mut dyn OutputSink) -> FlowOutcome {
    let mut tracker = ctx.tracker("install_deb");
    let result = install_deb_steps(ctx, deb, &mut tracker, sink).await;
    finish(tracker, result, sink)
}

async fn install_deb_steps(
    ctx: &FlowContext,
    deb: &Path,
    tracker: &mut FlowTracker,
    sink: &mut dyn OutputSink,
) -> Result<()> {
    tracker.advance(FlowState::Validating);
    let file_name = require_file(deb)?;

    let session = ctx.open(tracker, sink).await?;
    let result = install_deb_on(ctx, session.as_ref(), deb, &file_name, tracker, sink).await;
    session.close().await;
    result
}

async fn install_deb_on(
    ctx: &FlowContext,
    session: &dyn DeviceSession,
    deb: &Path,
    file_name: &str,
    tracker: &mut FlowTracker,
    sink: &mut dyn OutputSink,
) -> Result<()> {
    tracker.advance(FlowState::Transferring);
    let remote = upload_unless_present(ctx, session, deb, file_name, DEB_DIR, sink).await?;

    tracker.advance(FlowState::Executing);
    let shell = session.as_executor();
    let installed = exec_checked(shell, &templates::dpkg_install(&remote), sink).await;
    if let Err(e) = &installed {
        if !e.is_remote_failure() {
            return installed;
        }
        message(sink, "dpkg reported a problem, trying to fix dependencies...");
    }
    shell.exec(&templates::apt_fix(), sink).await?;

    installed?;
    message(sink, "Install finished. You may need to respring.");
    Ok(())
}

/// Download a .deb over HTTP(S) and install it
pub async fn install_deb_from_url(
    ctx: &FlowContext,
    url: &str,
    sink: &mut dyn OutputSink,
) -> FlowOutcome {
    let mut tracker = ctx.tracker("install_deb_from_url");
    let result = install_from_url_steps(ctx, url, &mut tracker, sink).await;
    finish(tracker, result, sink)
}

/// Install AppSync Unified from its release URL
pub async fn install_appsync(ctx: &FlowContext, sink: &mut dyn OutputSink) -> FlowOutcome {
    let mut tracker = ctx.tracker("install_appsync");
    let result = install_from_url_steps(ctx, templates::APPSYNC_URL, &mut tracker, sink).await;
    finish(tracker, result, sink)
}

async fn install_from_url_steps(
    ctx: &FlowContext,
    url: &str,
    tracker: &mut FlowTracker,
    sink: &mut dyn OutputSink,
) -> Result<()> {
    tracker.advance(FlowState::Validating);
    let parsed = reqwest::Url::parse(url)
        .map_err(|e| IsyncError::invalid_params(format!("invalid URL {}: {}", url, e)))?;
    let file_name = parsed
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|name| !name.is_empty())
        .unwrap_or("package.deb")
        .to_string();

    let scratch = tempfile::Builder::new().prefix("isync-deb-").tempdir()?;
    let local = scratch.path().join(&file_name);

    message(sink, format!("Downloading {} ...", url));
    let body = reqwest::get(parsed).await?.error_for_status()?.bytes().await?;
    tokio::fs::write(&local, &body).await?;
    info!("Downloaded {} ({} bytes)", file_name, body.len());

    let session = ctx.open(tracker, sink).await?;
    let result = install_deb_on(ctx, session.as_ref(), &local, &file_name, tracker, sink).await;
    session.close().await;
    result
}

/// `dpkg -r <package>`
pub async fn uninstall_package(
    ctx: &FlowContext,
    package: &str,
    sink: &mut dyn OutputSink,
) -> FlowOutcome {
    let mut tracker = ctx.tracker("uninstall_package");
    let result = uninstall_steps(ctx, package.trim(), &mut tracker, sink).await;
    finish(tracker, result, sink)
}

async fn uninstall_steps(
    ctx: &FlowContext,
    package: &str,
    tracker: &mut FlowTracker,
    sink: &mut dyn OutputSink,
) -> Result<()> {
    tracker.advance(FlowState::Validating);
    if package.is_empty() {
        return Err(IsyncError::invalid_params("package id is empty"));
    }

    let session = ctx.open(tracker, sink).await?;
    tracker.advance(FlowState::Executing);
    let result = exec_checked(session.as_executor(), &templates::dpkg_remove(package), sink).await;
    session.close().await;
    if result.is_ok() {
        message(sink, "Package removal finished. You may need to respring.");
    }
    result
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::sync::Arc;

    use super::*;
    use crate::flows::mock::{MockConnector, MockDevice};
    use crate::flows::FlowOptions;
    use crate::ssh::CollectingSink;
    use crate::transfer::memory::MemoryFs;

    fn context(device: &Arc<MockDevice>, options: FlowOptions) -> FlowContext {
        FlowContext::new(MockConnector::new(Arc::clone(device)), options)
    }

    fn local_file(dir: &tempfile::TempDir, name: &str) -> std::path::PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, name.as_bytes()).unwrap();
        path
    }

    #[tokio::test]
    async fn test_install_ipa_uploads_then_installs() {
        let dir = tempfile::tempdir().unwrap();
        let ipa = local_file(&dir, "My App.ipa");
        let device = MockDevice::new(MemoryFs::new().with_dir("/var/mobile"));
        let options = FlowOptions {
            installer: Installer::IpaInstaller {
                args: vec!["-f".into()],
            },
            ..FlowOptions::default()
        };
        let ctx = context(&device, options);
        let mut sink = CollectingSink::new();

        let outcome = install_ipa(&ctx, &ipa, &mut sink).await;
        assert!(outcome.is_success(), "{:?}", outcome.error);
        assert!(device.fs.file("/var/mobile/ipas/My App.ipa").is_some());
        assert_eq!(
            device.commands(),
            vec!["ipainstaller -f '/var/mobile/ipas/My App.ipa'"]
        );
        assert_eq!(device.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_install_ipa_skips_existing_upload() {
        let dir = tempfile::tempdir().unwrap();
        let ipa = local_file(&dir, "App.ipa");
        let device = MockDevice::new(MemoryFs::new().with_file("/var/mobile/ipas/App.ipa", b"old"));
        let ctx = context(&device, FlowOptions::default());
        let mut sink = CollectingSink::new();

        assert!(install_ipa(&ctx, &ipa, &mut sink).await.is_success());
        assert_eq!(device.fs.file("/var/mobile/ipas/App.ipa").unwrap(), b"old".to_vec());
        assert!(!device.fs.ops().iter().any(|op| op.starts_with("put")));
    }

    #[tokio::test]
    async fn test_install_ipa_with_appinst() {
        let dir = tempfile::tempdir().unwrap();
        let ipa = local_file(&dir, "App.ipa");
        let device = MockDevice::new(MemoryFs::new());
        device.respond("apt-get update", 100, "");
        let options = FlowOptions {
            installer: Installer::Appinst,
            ..FlowOptions::default()
        };
        let ctx = context(&device, options);
        let mut sink = CollectingSink::new();

        // a failed apt refresh does not stop the install attempt
        assert!(install_ipa(&ctx, &ipa, &mut sink).await.is_success());
        let commands = device.commands();
        assert_eq!(commands.len(), 2);
        assert!(commands[1].contains("appinst /var/mobile/ipas/App.ipa"));
    }

    #[tokio::test]
    async fn test_install_deb_runs_fix_even_when_dpkg_fails() {
        let dir = tempfile::tempdir().unwrap();
        let deb = local_file(&dir, "tweak.deb");
        let device = MockDevice::new(MemoryFs::new().with_dir("/var/root"));
        device.respond("dpkg -i", 1, "dpkg: dependency problems\n");
        let ctx = context(&device, FlowOptions::default());
        let mut sink = CollectingSink::new();

        let outcome = install_deb(&ctx, &deb, &mut sink).await;
        assert_eq!(outcome.state, FlowState::Failed);
        assert_eq!(outcome.remote_exit_code, Some(1));
        assert_eq!(
            device.commands(),
            vec!["dpkg -i /var/root/tweak.deb", "apt-get -f install -y || true"]
        );
    }

    #[tokio::test]
    async fn test_unreachable_device_is_not_a_remote_failure() {
        let dir = tempfile::tempdir().unwrap();
        let deb = local_file(&dir, "tweak.deb");
        let device = MockDevice::new(MemoryFs::new());
        let ctx = FlowContext::new(MockConnector::unreachable(Arc::clone(&device)), FlowOptions::default());
        let mut sink = CollectingSink::new();

        let outcome = install_deb(&ctx, &deb, &mut sink).await;
        assert_eq!(outcome.state, FlowState::Failed);
        assert_eq!(outcome.remote_exit_code, None);
        assert!(outcome.error.unwrap().contains("could not reach device"));
        assert!(device.commands().is_empty());
    }

    #[tokio::test]
    async fn test_missing_local_file_fails_validation() {
        let device = MockDevice::new(MemoryFs::new());
        let connector = MockConnector::new(Arc::clone(&device));
        let ctx = FlowContext::new(connector.clone(), FlowOptions::default());
        let mut sink = CollectingSink::new();

        let outcome = install_deb(&ctx, Path::new("/nonexistent/x.deb"), &mut sink).await;
        assert_eq!(outcome.state, FlowState::Failed);
        assert_eq!(connector.connects.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_run_ipainstaller_defaults_to_help() {
        let device = MockDevice::new(MemoryFs::new());
        let ctx = context(&device, FlowOptions::default());
        let mut sink = CollectingSink::new();

        assert!(run_ipainstaller(&ctx, &[], &mut sink).await.is_success());
        assert_eq!(device.commands(), vec!["ipainstaller -h"]);
    }

    #[tokio::test]
    async fn test_uninstall_package() {
        let device = MockDevice::new(MemoryFs::new());
        let ctx = context(&device, FlowOptions::default());
        let mut sink = CollectingSink::new();

        assert!(uninstall_package(&ctx, " com.example.pkg ", &mut sink).await.is_success());
        assert_eq!(device.commands(), vec!["dpkg -r com.example.pkg"]);

        let empty = uninstall_package(&ctx, "  ", &mut sink).await;
        assert_eq!(empty.state, FlowState::Failed);
    }
}
