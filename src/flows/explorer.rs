//! File explorer operations
//!
//! Each call is its own flow with its own session, like every other flow.

use std::path::{Path, PathBuf};

use super::{finish, FlowContext, FlowOutcome, FlowState, FlowTracker};
use crate::error::{IsyncError, Result};
use crate::ssh::output::{message, OutputSink};
use crate::transfer::{join_remote, remote_basename, BatchReport, RemoteEntry, TransferItem};

fn remote_path(path: &str) -> Result<String> {
    let trimmed = path.trim();
    if trimmed.is_empty() {
        return Err(IsyncError::invalid_params("remote path is empty"));
    }
    Ok(trimmed.to_string())
}

/// Directory listing, directories first then by name
pub async fn list_dir(
    ctx: &FlowContext,
    path: &str,
    sink: &mut dyn OutputSink,
) -> FlowOutcome<Vec<RemoteEntry>> {
    let mut tracker = ctx.tracker("list_dir");
    let result = list_steps(ctx, path, &mut tracker, sink).await;
    finish(tracker, result, sink)
}

async fn list_steps(
    ctx: &FlowContext,
    path: &str,
    tracker: &mut FlowTracker,
    sink: &mut dyn OutputSink,
) -> Result<Vec<RemoteEntry>> {
    tracker.advance(FlowState::Validating);
    let path = remote_path(path)?;
    let session = ctx.open(tracker, sink).await?;
    tracker.advance(FlowState::Transferring);
    let result = async {
        let fs = session.fs().await?;
        ctx.engine(fs).list_dir(&path).await
    }
    .await;
    session.close().await;
    result
}

/// Upload local files into `remote_dir`, keeping their names
pub async fn upload_files(
    ctx: &FlowContext,
    files: &[PathBuf],
    remote_dir: &str,
    sink: &mut dyn OutputSink,
) -> FlowOutcome<BatchReport> {
    let mut tracker = ctx.tracker("upload_files");
    let result = upload_steps(ctx, files, remote_dir, &mut tracker, sink).await;
    finish(tracker, result, sink)
}

async fn upload_steps(
    ctx: &FlowContext,
    files: &[PathBuf],
    remote_dir: &str,
    tracker: &mut FlowTracker,
    sink: &mut dyn OutputSink,
) -> Result<BatchReport> {
    tracker.advance(FlowState::Validating);
    let remote_dir = remote_path(remote_dir)?;
    let items = files
        .iter()
        .map(|local| {
            let name = super::require_file(local)?;
            Ok(TransferItem::upload(local.clone(), join_remote(&remote_dir, &name)))
        })
        .collect::<Result<Vec<_>>>()?;

    let session = ctx.open(tracker, sink).await?;
    tracker.advance(FlowState::Transferring);
    let result = async {
        let fs = session.fs().await?;
        ctx.engine(fs).upload_items(&items).await
    }
    .await;
    session.close().await;

    let report = result?;
    message(sink, format!("Upload finished: {}", report));
    Ok(report)
}

/// Download remote files into `local_dir`, keeping their names
pub async fn download_files(
    ctx: &FlowContext,
    remotes: &[String],
    local_dir: &Path,
    sink: &mut dyn OutputSink,
) -> FlowOutcome<BatchReport> {
    let mut tracker = ctx.tracker("download_files");
    let result = download_steps(ctx, remotes, local_dir, &mut tracker, sink).await;
    finish(tracker, result, sink)
}

async fn download_steps(
    ctx: &FlowContext,
    remotes: &[String],
    local_dir: &Path,
    tracker: &mut FlowTracker,
    sink: &mut dyn OutputSink,
) -> Result<BatchReport> {
    tracker.advance(FlowState::Validating);
    let items = remotes
        .iter()
        .map(|remote| {
            let remote = remote_path(remote)?;
            let name = remote_basename(&remote);
            if name.is_empty() || name == "." || name == ".." {
                return Err(IsyncError::invalid_params(format!(
                    "{} does not name a file to download",
                    remote
                )));
            }
            let local = local_dir.join(name);
            Ok(TransferItem::download(remote, local))
        })
        .collect::<Result<Vec<_>>>()?;

    let session = ctx.open(tracker, sink).await?;
    tracker.advance(FlowState::Transferring);
    let result = async {
        let fs = session.fs().await?;
        ctx.engine(fs).download_items(&items).await
    }
    .await;
    session.close().await;

    let report = result?;
    message(sink, format!("Download finished: {}", report));
    Ok(report)
}

/// Delete a file or a whole directory tree
pub async fn delete(ctx: &FlowContext, path: &str, sink: &mut dyn OutputSink) -> FlowOutcome {
    let mut tracker = ctx.tracker("delete");
    let result = delete_steps(ctx, path, &mut tracker, sink).await;
    finish(tracker, result, sink)
}

async fn delete_steps(
    ctx: &FlowContext,
    path: &str,
    tracker: &mut FlowTracker,
    sink: &mut dyn OutputSink,
) -> Result<()> {
    tracker.advance(FlowState::Validating);
    let path = remote_path(path)?;
    if path.trim_end_matches('/').is_empty() {
        return Err(IsyncError::invalid_params("refusing to delete /"));
    }

    let session = ctx.open(tracker, sink).await?;
    tracker.advance(FlowState::Transferring);
    let result = async {
        let fs = session.fs().await?;
        ctx.engine(fs).remove_recursive(&path).await
    }
    .await;
    session.close().await;
    result
}

pub async fn mkdir(ctx: &FlowContext, path: &str, sink: &mut dyn OutputSink) -> FlowOutcome {
    let mut tracker = ctx.tracker("mkdir");
    let result = mkdir_steps(ctx, path, &mut tracker, sink).await;
    finish(tracker, result, sink)
}

async fn mkdir_steps(
    ctx: &FlowContext,
    path: &str,
    tracker: &mut FlowTracker,
    sink: &mut dyn OutputSink,
) -> Result<()> {
    tracker.advance(FlowState::Validating);
    let path = remote_path(path)?;
    let session = ctx.open(tracker, sink).await?;
    tracker.advance(FlowState::Transferring);
    let result = async { session.fs().await?.mkdir(&path).await }.await;
    session.close().await;
    result
}

pub async fn rename(
    ctx: &FlowContext,
    from: &str,
    to: &str,
    sink: &mut dyn OutputSink,
) -> FlowOutcome {
    let mut tracker = ctx.tracker("rename");
    let result = rename_steps(ctx, from, to, &mut tracker, sink).await;
    finish(tracker, result, sink)
}

async fn rename_steps(
    ctx: &FlowContext,
    from: &str,
    to: &str,
    tracker: &mut FlowTracker,
    sink: &mut dyn OutputSink,
) -> Result<()> {
    tracker.advance(FlowState::Validating);
    let from = remote_path(from)?;
    let to = remote_path(to)?;
    let session = ctx.open(tracker, sink).await?;
    tracker.advance(FlowState::Transferring);
    let result = async { session.fs().await?.rename(&from, &to).await }.await;
    session.close().await;
    result
}
