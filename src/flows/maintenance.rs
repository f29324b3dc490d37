//! Single-command device maintenance flows

use tracing::info;

use super::templates;
use super::{finish, FlowContext, FlowOutcome, FlowState, FlowTracker};
use crate::error::Result;
use crate::ssh::exec_checked;
use crate::ssh::output::{message, OutputSink};
use crate::ssh::sanitize::sanitize_command;

/// Longest command line accepted from the user
pub const MAX_COMMAND_CHARS: usize = 8192;

/// Connect, report, disconnect
pub async fn test_connection(ctx: &FlowContext, sink: &mut dyn OutputSink) -> FlowOutcome {
    let mut tracker = ctx.tracker("test_connection");
    let result = connect_steps(ctx, &mut tracker, sink).await;
    finish(tracker, result, sink)
}

async fn connect_steps(
    ctx: &FlowContext,
    tracker: &mut FlowTracker,
    sink: &mut dyn OutputSink,
) -> Result<()> {
    tracker.advance(FlowState::Validating);
    let session = ctx.open(tracker, sink).await?;
    session.close().await;
    info!("Connection test to {} succeeded", ctx.connector().target());
    message(sink, "Connection OK");
    Ok(())
}

/// Run `commands` in order on one session, stopping at the first failure
async fn run_sequence(
    ctx: &FlowContext,
    commands: &[String],
    tracker: &mut FlowTracker,
    sink: &mut dyn OutputSink,
) -> Result<()> {
    tracker.advance(FlowState::Validating);
    let session = ctx.open(tracker, sink).await?;
    tracker.advance(FlowState::Executing);

    let mut result = Ok(());
    for command in commands {
        result = exec_checked(session.as_executor(), command, sink).await;
        if result.is_err() {
            break;
        }
    }
    session.close().await;
    result
}

async fn single(
    ctx: &FlowContext,
    flow: &'static str,
    command: String,
    sink: &mut dyn OutputSink,
) -> FlowOutcome {
    let mut tracker = ctx.tracker(flow);
    let result = run_sequence(ctx, &[command], &mut tracker, sink).await;
    finish(tracker, result, sink)
}

/// Rebuild the icon cache as `mobile`
pub async fn uicache(ctx: &FlowContext, sink: &mut dyn OutputSink) -> FlowOutcome {
    single(ctx, "uicache", templates::uicache_as_mobile(), sink).await
}

/// Restart SpringBoard
pub async fn respring(ctx: &FlowContext, sink: &mut dyn OutputSink) -> FlowOutcome {
    single(ctx, "respring", templates::respring(), sink).await
}

/// `ls -al /`
pub async fn peek_root(ctx: &FlowContext, sink: &mut dyn OutputSink) -> FlowOutcome {
    single(ctx, "peek_root", templates::peek_root(), sink).await
}

/// Jailbreak mode, kernel, and where (if anywhere) AppSync is installed
pub async fn check_appsync(ctx: &FlowContext, sink: &mut dyn OutputSink) -> FlowOutcome {
    let mut tracker = ctx.tracker("check_appsync");
    let result = run_sequence(ctx, &templates::check_appsync(), &mut tracker, sink).await;
    finish(tracker, result, sink)
}

/// Run a command typed by the user
pub async fn run_command(ctx: &FlowContext, command: &str, sink: &mut dyn OutputSink) -> FlowOutcome {
    let mut tracker = ctx.tracker("run_command");
    let result = match sanitize_command(command, Some(MAX_COMMAND_CHARS)) {
        Ok(command) => run_sequence(ctx, &[command], &mut tracker, sink).await,
        Err(e) => Err(e),
    };
    finish(tracker, result, sink)
}
