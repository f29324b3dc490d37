//! Installed application listing

use serde::Serialize;
use tracing::debug;

use super::templates::{ROOTFUL_APPLICATIONS, ROOTLESS_APPLICATIONS};
use super::{finish, FlowContext, FlowOutcome, FlowState, FlowTracker};
use crate::archive::strip_bundle_suffix;
use crate::error::Result;
use crate::ssh::output::OutputSink;
use crate::transfer::RemoteFs;

/// One `.app` directory in the applications root
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AppEntry {
    /// Bundle directory name, e.g. `Filza.app`
    pub name: String,
    pub path: String,
}

/// `/var/jb/Applications` on rootless jailbreaks, `/Applications` otherwise
pub async fn applications_root(fs: &dyn RemoteFs) -> Result<&'static str> {
    let root = if fs.exists(ROOTLESS_APPLICATIONS).await? {
        ROOTLESS_APPLICATIONS
    } else {
        ROOTFUL_APPLICATIONS
    };
    debug!("Applications root: {}", root);
    Ok(root)
}

pub async fn list_applications(
    ctx: &FlowContext,
    sink: &mut dyn OutputSink,
) -> FlowOutcome<Vec<AppEntry>> {
    let mut tracker = ctx.tracker("list_applications");
    let result = list_steps(ctx, &mut tracker, sink).await;
    finish(tracker, result, sink)
}

async fn list_steps(
    ctx: &FlowContext,
    tracker: &mut FlowTracker,
    sink: &mut dyn OutputSink,
) -> Result<Vec<AppEntry>> {
    tracker.advance(FlowState::Validating);
    let session = ctx.open(tracker, sink).await?;
    tracker.advance(FlowState::Executing);
    let result = match session.fs().await {
        Ok(fs) => bundles_in(fs).await,
        Err(e) => Err(e),
    };
    session.close().await;
    result
}

async fn bundles_in(fs: &dyn RemoteFs) -> Result<Vec<AppEntry>> {
    let root = applications_root(fs).await?;
    let mut apps: Vec<AppEntry> = fs
        .read_dir(root)
        .await?
        .into_iter()
        .filter(|e| e.is_dir && strip_bundle_suffix(&e.name).len() != e.name.len())
        .map(|e| AppEntry {
            name: e.name,
            path: e.path,
        })
        .collect();
    apps.sort_by_cached_key(|app| app.name.to_lowercase());
    Ok(apps)
}
