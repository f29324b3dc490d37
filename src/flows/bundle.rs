//! App bundle flows: app drop (zip-and-place), jailfree install, cleanup
//!
//! App drop re-packs a bundle as `<Name>.zip`, uploads it to `/var/mobile`
//! and runs one chained shell pipeline that unpacks it and moves it into
//! the applications root. Jailfree uploads the extracted bundle tree to
//! `/var/mobile/Payload` instead and leaves the applications root alone.

use std::path::{Path, PathBuf};

use tempfile::TempDir;
use tracing::{info, warn};

use super::apps::applications_root;
use super::templates::{self, JAILFREE_PAYLOAD, MOBILE_HOME};
use super::{blocking, finish, FlowContext, FlowOutcome, FlowState, FlowTracker};
use crate::archive::{self, strip_bundle_suffix};
use crate::device::DeviceSession;
use crate::error::{IsyncError, Result};
use crate::ssh::exec_checked;
use crate::ssh::output::{message, OutputSink};
use crate::transfer::join_remote;

/// A zip ready for upload, plus the scratch space it lives in
struct PackedBundle {
    _scratch: TempDir,
    zip: PathBuf,
    /// `<Name>.app`, the single top-level entry of the zip
    bundle_dir: String,
}

impl PackedBundle {
    fn zip_name(&self) -> String {
        format!("{}.zip", strip_bundle_suffix(&self.bundle_dir))
    }
}

fn is_bundle_dir(path: &Path) -> bool {
    path.is_dir()
        && path
            .file_name()
            .map(|n| n.to_string_lossy())
            .is_some_and(|n| strip_bundle_suffix(&n).len() != n.len())
}

/// Bundle directory name for either a `.app` directory or an IPA
fn bundle_dir_of(input: &Path) -> Result<String> {
    if input.is_dir() {
        if !is_bundle_dir(input) {
            return Err(IsyncError::invalid_params(format!(
                "{} is not a .app directory",
                input.display()
            )));
        }
        return Ok(input
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default());
    }
    if input.is_file() {
        return archive::ipa_bundle_dir(input);
    }
    Err(IsyncError::invalid_params(format!(
        "{} does not exist",
        input.display()
    )))
}

/// Materialize the bundle (extracting an IPA if needed) and pack it
fn pack(input: &Path) -> Result<PackedBundle> {
    let scratch = tempfile::Builder::new().prefix("isync-appdrop-").tempdir()?;

    let bundle = if input.is_dir() {
        bundle_dir_of(input)?;
        input.to_path_buf()
    } else if input.is_file() {
        let staging = scratch.path().join("extracted");
        std::fs::create_dir(&staging)?;
        archive::extract_bundle(input, &staging)?
    } else {
        return Err(IsyncError::invalid_params(format!(
            "{} does not exist",
            input.display()
        )));
    };

    let bundle_dir = bundle
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| IsyncError::invalid_params("bundle has no directory name"))?;
    let zip = archive::pack_bundle(&bundle, scratch.path())?;

    Ok(PackedBundle {
        _scratch: scratch,
        zip,
        bundle_dir,
    })
}

/// Drop a `.app` directory or an IPA into the applications root
pub async fn appdrop(ctx: &FlowContext, input: &Path, sink: &mut dyn OutputSink) -> FlowOutcome {
    let mut tracker = ctx.tracker("appdrop");
    let result = appdrop_steps(ctx, input, &mut tracker, sink).await;
    finish(tracker, result, sink)
}

pub(crate) async fn appdrop_steps(
    ctx: &FlowContext,
    input: &Path,
    tracker: &mut FlowTracker,
    sink: &mut dyn OutputSink,
) -> Result<()> {
    tracker.advance(FlowState::Validating);
    message(sink, format!("Preparing {} ...", input.display()));
    let owned = input.to_path_buf();
    let packed = blocking(move || pack(&owned)).await?;
    info!("Packed {} as {}", packed.bundle_dir, packed.zip.display());

    let session = ctx.open(tracker, sink).await?;
    let result = appdrop_on(ctx, session.as_ref(), &packed, tracker, sink).await;
    session.close().await;
    result
}

async fn appdrop_on(
    ctx: &FlowContext,
    session: &dyn DeviceSession,
    packed: &PackedBundle,
    tracker: &mut FlowTracker,
    sink: &mut dyn OutputSink,
) -> Result<()> {
    let fs = session.fs().await?;
    let zip_name = packed.zip_name();
    let remote_zip = join_remote(MOBILE_HOME, &zip_name);

    tracker.advance(FlowState::Transferring);
    message(sink, format!("Uploading {} -> {}", zip_name, remote_zip));
    ctx.engine(fs).upload_file(&packed.zip, &remote_zip).await?;

    tracker.advance(FlowState::Executing);
    let dest_root = applications_root(fs).await?;
    let shell = session.as_executor();

    let code = shell.exec(&templates::free_space(), sink).await?;
    if code != 0 {
        warn!("df exited with {}", code);
    }

    let chain = templates::appdrop_chain(
        &zip_name,
        &packed.bundle_dir,
        dest_root,
        !ctx.options().no_respring,
    );
    exec_checked(shell, &chain, sink).await?;
    message(
        sink,
        format!("Installed {} into {}", packed.bundle_dir, dest_root),
    );
    Ok(())
}

/// Upload an IPA's bundle to `/var/mobile/Payload` for jailfree signing
pub async fn jailfree_install(
    ctx: &FlowContext,
    ipa: &Path,
    sink: &mut dyn OutputSink,
) -> FlowOutcome {
    let mut tracker = ctx.tracker("jailfree_install");
    let result = jailfree_steps(ctx, ipa, &mut tracker, sink).await;
    finish(tracker, result, sink)
}

pub(crate) async fn jailfree_steps(
    ctx: &FlowContext,
    ipa: &Path,
    tracker: &mut FlowTracker,
    sink: &mut dyn OutputSink,
) -> Result<()> {
    tracker.advance(FlowState::Validating);
    if !ipa.is_file() {
        return Err(IsyncError::invalid_params(format!(
            "{} is not a file",
            ipa.display()
        )));
    }
    let owned = ipa.to_path_buf();
    let (scratch, bundle) = blocking(move || {
        let scratch = tempfile::Builder::new().prefix("isync-jailfree-").tempdir()?;
        let bundle = archive::extract_bundle(&owned, scratch.path())?;
        Ok((scratch, bundle))
    })
    .await?;

    let session = ctx.open(tracker, sink).await?;
    let result = jailfree_on(ctx, session.as_ref(), &bundle, tracker, sink).await;
    session.close().await;
    drop(scratch);
    result
}

async fn jailfree_on(
    ctx: &FlowContext,
    session: &dyn DeviceSession,
    bundle: &Path,
    tracker: &mut FlowTracker,
    sink: &mut dyn OutputSink,
) -> Result<()> {
    let bundle_dir = bundle
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| IsyncError::archive("extracted bundle has no name"))?;
    let remote = join_remote(JAILFREE_PAYLOAD, &bundle_dir);
    let shell = session.as_executor();

    tracker.advance(FlowState::Transferring);
    exec_checked(shell, &templates::mkdir_p(JAILFREE_PAYLOAD), sink).await?;
    message(sink, format!("Uploading {} -> {}", bundle_dir, remote));
    let fs = session.fs().await?;
    let report = ctx.engine(fs).upload_tree(bundle, &remote).await?;
    info!(
        "Uploaded {} files in {} directories to {}",
        report.files, report.directories, remote
    );

    tracker.advance(FlowState::Executing);
    exec_checked(shell, &templates::chown_mobile(&remote), sink).await?;
    if !ctx.options().no_respring {
        let code = shell.exec(&templates::respring_as_mobile(), sink).await?;
        if code != 0 {
            warn!("respring exited with {}", code);
        }
    }
    let code = shell.exec(&templates::uicache_plain_as_mobile(), sink).await?;
    if code != 0 {
        warn!("uicache exited with {}", code);
    }
    Ok(())
}

/// Remove `/var/mobile/<Name>.zip` and the installed `<Name>.app` left by
/// an earlier app drop
pub async fn cleanup_leftovers(
    ctx: &FlowContext,
    input: &Path,
    sink: &mut dyn OutputSink,
) -> FlowOutcome {
    let mut tracker = ctx.tracker("cleanup_leftovers");
    let result = cleanup_steps(ctx, input, &mut tracker, sink).await;
    finish(tracker, result, sink)
}

async fn cleanup_steps(
    ctx: &FlowContext,
    input: &Path,
    tracker: &mut FlowTracker,
    sink: &mut dyn OutputSink,
) -> Result<()> {
    tracker.advance(FlowState::Validating);
    let owned = input.to_path_buf();
    let bundle_dir = blocking(move || bundle_dir_of(&owned)).await?;
    let zip_name = format!("{}.zip", strip_bundle_suffix(&bundle_dir));

    let session = ctx.open(tracker, sink).await?;
    tracker.advance(FlowState::Executing);
    let result = cleanup_on(session.as_ref(), &bundle_dir, &zip_name, sink).await;
    session.close().await;
    result
}

async fn cleanup_on(
    session: &dyn DeviceSession,
    bundle_dir: &str,
    zip_name: &str,
    sink: &mut dyn OutputSink,
) -> Result<()> {
    let root = applications_root(session.fs().await?).await?;
    let installed = join_remote(root, bundle_dir);
    message(sink, format!("Removing {} and {}", zip_name, installed));
    exec_checked(
        session.as_executor(),
        &templates::cleanup_chain(Some(zip_name), Some(&installed)),
        sink,
    )
    .await
}
