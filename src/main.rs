//! isync - Entry point
//!
//! Parses CLI arguments, validates configuration, dispatches the requested
//! action on a worker task and prints its events until it finishes.

use std::future::Future;
use std::io::Write;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use isync::app::{AppEvent, AppState, Dispatcher, FlowId};
use isync::config::{Args, Config};
use isync::device::SshConnector;
use isync::flows::{FlowContext, FlowState};
use isync::ssh::OutputEvent;
use tokio::sync::mpsc::UnboundedReceiver;

#[tokio::main]
async fn main() -> ExitCode {
    // Logs go to stderr; stdout carries command output and flow events
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let config = match Config::from_args(args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::from(2);
        }
    };

    info!("isync v{} starting...", env!("CARGO_PKG_VERSION"));
    info!(
        "Target {}@{} ({} key kind(s), password fallback {})",
        config.ssh.username,
        config.ssh.address(),
        if config.ssh.private_key.is_some() {
            config.ssh.key_kinds.len()
        } else {
            0
        },
        if config.ssh.allow_password { "on" } else { "off" }
    );
    if config.scp.is_some() {
        info!("External scp transport enabled");
    }

    let connector = SshConnector::new(config.ssh.clone()).with_scp(config.scp.clone());
    let ctx = FlowContext::new(Arc::new(connector), config.flow.clone());
    let (dispatcher, mut events) = Dispatcher::new(ctx, config.output);

    let id = dispatcher.spawn(config.action.clone());
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Cannot listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };
    ExitCode::from(drive(&mut events, id, config.json, shutdown).await)
}

/// Show events of flow `id` until it finishes or `shutdown` resolves.
///
/// Returns the process exit status: 0 on success, 1 for a partial batch or
/// a local failure, the remote exit code (at least 1) when a device command
/// failed, 130 on shutdown.
async fn drive(
    events: &mut UnboundedReceiver<AppEvent>,
    id: FlowId,
    json: bool,
    shutdown: impl Future<Output = ()>,
) -> u8 {
    tokio::pin!(shutdown);
    let mut state = AppState::new();
    let mut partial = false;

    loop {
        let event = tokio::select! {
            event = events.recv() => event,
            _ = &mut shutdown => {
                warn!("Received SIGINT (Ctrl+C), abandoning running flow");
                return 130;
            }
        };
        let Some(event) = event else {
            break;
        };

        if json {
            match serde_json::to_string(&event) {
                Ok(line) => println!("{}", line),
                Err(e) => warn!("Cannot encode event: {}", e),
            }
        } else {
            print_event(&event);
        }

        if let AppEvent::Batch { report, .. } = &event {
            partial |= !report.all_succeeded();
        }
        let finished = matches!(&event, AppEvent::FlowFinished { id: done, .. } if *done == id);
        state.apply(event);
        if finished {
            break;
        }
    }

    let Some(status) = state.flow(id) else {
        return 1;
    };
    match (status.state, status.remote_exit_code) {
        (FlowState::Done, _) if partial => 1,
        (FlowState::Done, _) => 0,
        (_, Some(code)) => u8::try_from(code).unwrap_or(u8::MAX).max(1),
        _ => 1,
    }
}

/// Human-readable rendering of one event
fn print_event(event: &AppEvent) {
    match event {
        AppEvent::Output { output, .. } => match output {
            OutputEvent::Stdout(text) | OutputEvent::Stderr(text) => {
                print!("{}", text);
                let _ = std::io::stdout().flush();
            }
            other => println!("{}", other.render()),
        },
        AppEvent::Applications { apps, .. } => {
            for app in apps {
                println!("{}\t{}", app.name, app.path);
            }
        }
        AppEvent::Listing { entries, .. } => {
            for entry in entries {
                let kind = if entry.is_dir { 'd' } else { '-' };
                println!("{} {:>12} {}", kind, entry.size, entry.name);
            }
        }
        AppEvent::Batch { report, .. } => {
            for failure in &report.failures {
                println!("failed: {}: {}", failure.item, failure.error);
            }
        }
        AppEvent::FlowFinished { summary, .. } => eprintln!("{}", summary),
        AppEvent::FlowStarted { .. } | AppEvent::Progress { .. } | AppEvent::Phase { .. } => {}
    }
}
