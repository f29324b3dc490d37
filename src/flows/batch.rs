//! Batch variants of the bundle flows
//!
//! Every item runs as a complete single-item flow with its own session.
//! With `continue_on_error` a failed item is recorded and the batch moves
//! on; otherwise the first failure ends the batch. Progress is reported once
//! per finished item as `completed / total`.

use std::path::{Path, PathBuf};

use tracing::warn;

use super::bundle::{appdrop_steps, jailfree_steps};
use super::{blocking, describe, finish, FlowContext, FlowOutcome, FlowState, FlowTracker};
use crate::archive::{bundle_display_name, scan_bundles};
use crate::error::{IsyncError, Result};
use crate::ssh::output::{message, OutputSink};
use crate::transfer::{BatchReport, ProgressMeter};

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// Book-keeping after one item; `Err` means stop the batch
fn record(
    ctx: &FlowContext,
    report: &mut BatchReport,
    name: &str,
    result: Result<()>,
    sink: &mut dyn OutputSink,
) -> Result<()> {
    match result {
        Ok(()) => {
            report.record_success();
            Ok(())
        }
        Err(e) => {
            warn!("Batch item {} failed: {}", name, e);
            message(sink, format!("Error: {}: {}", name, describe(&e)));
            report.record_failure(name, &e);
            if ctx.options().continue_on_error {
                Ok(())
            } else {
                Err(e)
            }
        }
    }
}

/// Jailfree-install several IPAs one after another
pub async fn batch_install_ipas(
    ctx: &FlowContext,
    ipas: &[PathBuf],
    sink: &mut dyn OutputSink,
) -> FlowOutcome<BatchReport> {
    let mut tracker = ctx.tracker("batch_install_ipas");
    let result = install_ipas_steps(ctx, ipas, &mut tracker, sink).await;
    finish(tracker, result, sink)
}

async fn install_ipas_steps(
    ctx: &FlowContext,
    ipas: &[PathBuf],
    tracker: &mut FlowTracker,
    sink: &mut dyn OutputSink,
) -> Result<BatchReport> {
    tracker.advance(FlowState::Validating);
    if ipas.is_empty() {
        return Err(IsyncError::invalid_params("no IPA files given"));
    }

    tracker.advance(FlowState::Executing);
    let total = ipas.len();
    let mut report = BatchReport::new(total);
    let item_ctx = ctx.item_context();
    let mut progress = ProgressMeter::from_option(ctx.progress());
    for (idx, ipa) in ipas.iter().enumerate() {
        let name = display_name(ipa);
        message(sink, format!("[{}/{}] Installing {}", idx + 1, total, name));
        let mut item = FlowTracker::new("jailfree_install");
        let result = jailfree_steps(&item_ctx, ipa, &mut item, sink).await;
        record(ctx, &mut report, &name, result, sink)?;
        progress.update(idx as u64 + 1, total as u64);
    }

    message(sink, format!("Batch finished: {}.", report));
    Ok(report)
}

/// App-drop every `.app` bundle found (at most two levels) below `folder`
pub async fn batch_appdrop(
    ctx: &FlowContext,
    folder: &Path,
    sink: &mut dyn OutputSink,
) -> FlowOutcome<BatchReport> {
    let mut tracker = ctx.tracker("batch_appdrop");
    let result = appdrop_folder_steps(ctx, folder, &mut tracker, sink).await;
    finish(tracker, result, sink)
}

async fn appdrop_folder_steps(
    ctx: &FlowContext,
    folder: &Path,
    tracker: &mut FlowTracker,
    sink: &mut dyn OutputSink,
) -> Result<BatchReport> {
    tracker.advance(FlowState::Validating);
    let root = folder.to_path_buf();
    let bundles = blocking(move || {
        let named = scan_bundles(&root)?
            .into_iter()
            .map(|bundle| {
                let name = bundle_display_name(&bundle);
                (bundle, name)
            })
            .collect::<Vec<_>>();
        Ok(named)
    })
    .await?;
    if bundles.is_empty() {
        return Err(IsyncError::invalid_params(format!(
            "no .app bundles found under {}",
            folder.display()
        )));
    }
    let names: Vec<&str> = bundles.iter().map(|(_, name)| name.as_str()).collect();
    message(sink, format!("Ready to batch install: {}", names.join(", ")));

    tracker.advance(FlowState::Executing);
    let total = bundles.len();
    let mut report = BatchReport::new(total);
    let item_ctx = ctx.item_context();
    let mut progress = ProgressMeter::from_option(ctx.progress());
    for (idx, (bundle, name)) in bundles.iter().enumerate() {
        message(sink, format!("[{}/{}] Installing {}", idx + 1, total, name));
        let mut item = FlowTracker::new("appdrop");
        let result = appdrop_steps(&item_ctx, bundle, &mut item, sink).await;
        record(ctx, &mut report, name, result, sink)?;
        progress.update(idx as u64 + 1, total as u64);
    }

    message(sink, format!("Batch finished: {}.", report));
    Ok(report)
}
