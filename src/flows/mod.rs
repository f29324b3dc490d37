//! Flow orchestrators
//!
//! A flow is one named end-to-end operation: connect, move files, run
//! commands, disconnect. Every flow owns its session for exactly one run.
//! Errors stop at the flow boundary: the public entry points never return
//! `Err`, they return a [`FlowOutcome`] in state `Done` or `Failed` and log
//! what went wrong.

pub mod apps;
pub mod batch;
pub mod bundle;
pub mod explorer;
pub mod maintenance;
#[cfg(test)]
pub mod mock;
pub mod package;
pub mod state;
pub mod templates;

use std::path::Path;
use std::sync::Arc;

use serde::Serialize;
use tracing::{error, info};

use crate::device::{Connector, DeviceSession};
use crate::error::{IsyncError, Result};
use crate::ssh::output::{message, OutputSink};
use crate::transfer::{ProgressObserver, RemoteFs, TransferEngine};

pub use state::{FlowState, FlowTracker, PhaseObserver};

/// Which on-device tool installs IPAs
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Installer {
    /// `ipainstaller` with the given flags
    IpaInstaller { args: Vec<String> },
    /// `appinst`, installed through apt first if needed
    Appinst,
}

impl Default for Installer {
    fn default() -> Self {
        Installer::IpaInstaller { args: Vec::new() }
    }
}

/// Knobs shared by all flows
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowOptions {
    /// Skip SpringBoard restart and icon cache refresh after app drop
    pub no_respring: bool,
    /// Batch flows keep going after a failed item
    pub continue_on_error: bool,
    pub installer: Installer,
}

impl Default for FlowOptions {
    fn default() -> Self {
        Self {
            no_respring: false,
            continue_on_error: true,
            installer: Installer::default(),
        }
    }
}

/// Everything a flow needs besides its own arguments
#[derive(Clone)]
pub struct FlowContext {
    connector: Arc<dyn Connector>,
    options: FlowOptions,
    progress: Option<Arc<dyn ProgressObserver>>,
    phases: Option<PhaseObserver>,
}

impl FlowContext {
    pub fn new(connector: Arc<dyn Connector>, options: FlowOptions) -> Self {
        Self {
            connector,
            options,
            progress: None,
            phases: None,
        }
    }

    pub fn with_progress(mut self, observer: Arc<dyn ProgressObserver>) -> Self {
        self.progress = Some(observer);
        self
    }

    pub fn with_phases(mut self, observer: PhaseObserver) -> Self {
        self.phases = Some(observer);
        self
    }

    /// Progress observer of this context, if any
    pub(crate) fn progress(&self) -> Option<Arc<dyn ProgressObserver>> {
        self.progress.clone()
    }

    /// Context for one item of a batch: the batch reports progress per
    /// finished item, so the item's own transfers stay silent
    pub(crate) fn item_context(&self) -> FlowContext {
        FlowContext {
            progress: None,
            ..self.clone()
        }
    }

    /// Tracker for a top-level run, reporting phases to the observer
    pub(crate) fn tracker(&self, flow: &'static str) -> FlowTracker {
        FlowTracker::observed(flow, self.phases.clone())
    }

    pub fn options(&self) -> &FlowOptions {
        &self.options
    }

    pub fn connector(&self) -> &dyn Connector {
        self.connector.as_ref()
    }

    /// Open a fresh session for this flow
    pub(crate) async fn open(
        &self,
        tracker: &mut FlowTracker,
        sink: &mut dyn OutputSink,
    ) -> Result<Box<dyn DeviceSession>> {
        tracker.advance(FlowState::Connecting);
        message(sink, format!("Connecting to {}...", self.connector.target()));
        self.connector.connect().await
    }

    /// Transfer engine over `fs`, with this context's transports and progress
    pub(crate) fn engine<'a>(&'a self, fs: &'a dyn RemoteFs) -> TransferEngine<'a> {
        TransferEngine::new(fs)
            .with_external(self.connector.external_transport())
            .with_observer(self.progress.clone())
            .continue_on_error(self.options.continue_on_error)
    }
}

/// Result of one flow run
#[derive(Debug, Clone, Serialize)]
pub struct FlowOutcome<T = ()> {
    pub flow: &'static str,
    pub state: FlowState,
    /// Flow-specific result, present on success
    pub value: Option<T>,
    /// Human-readable failure
    pub error: Option<String>,
    /// Set when the device was reached and a command on it failed
    pub remote_exit_code: Option<u32>,
}

impl<T> FlowOutcome<T> {
    pub fn is_success(&self) -> bool {
        self.state == FlowState::Done
    }

    /// One line for a status bar
    pub fn summary(&self) -> String {
        match &self.error {
            None => format!("{}: done", self.flow),
            Some(e) => format!("{}: {}", self.flow, e),
        }
    }

    /// Drop the value, keeping the status
    pub fn discard(self) -> FlowOutcome {
        FlowOutcome {
            flow: self.flow,
            state: self.state,
            value: self.value.map(|_| ()),
            error: self.error,
            remote_exit_code: self.remote_exit_code,
        }
    }
}

/// Close out a run: mark the tracker, log, tell the sink
pub(crate) fn finish<T>(
    mut tracker: FlowTracker,
    result: Result<T>,
    sink: &mut dyn OutputSink,
) -> FlowOutcome<T> {
    match result {
        Ok(value) => {
            tracker.succeed();
            info!("{} finished", tracker.flow());
            FlowOutcome {
                flow: tracker.flow(),
                state: tracker.state(),
                value: Some(value),
                error: None,
                remote_exit_code: None,
            }
        }
        Err(e) => {
            tracker.fail();
            let text = describe(&e);
            error!("{} failed: {}", tracker.flow(), text);
            message(sink, format!("Error: {}", text));
            FlowOutcome {
                flow: tracker.flow(),
                state: tracker.state(),
                value: None,
                error: Some(text),
                remote_exit_code: e.exit_code(),
            }
        }
    }
}

/// Wording that separates "the device ran it and it failed" from "we never
/// got that far"
pub fn describe(err: &IsyncError) -> String {
    match err {
        IsyncError::RemoteCommand {
            command, exit_code, ..
        } => format!("`{}` exited with status {} on the device", command, exit_code),
        other => other.to_string(),
    }
}

/// File name of an existing local file, for building the remote path
pub(crate) fn require_file(path: &Path) -> Result<String> {
    if !path.is_file() {
        return Err(IsyncError::invalid_params(format!(
            "{} is not a file",
            path.display()
        )));
    }
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| IsyncError::invalid_params(format!("{} has no file name", path.display())))
}

/// Run blocking archive work off the async runtime
pub(crate) async fn blocking<T, F>(work: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| IsyncError::archive(format!("worker failed: {}", e)))?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_describe_distinguishes_remote_failures() {
        let remote = IsyncError::RemoteCommand {
            command: "dpkg -i x.deb".into(),
            exit_code: 1,
            output: String::new(),
        };
        assert_eq!(describe(&remote), "`dpkg -i x.deb` exited with status 1 on the device");

        let unreachable = IsyncError::connect("Connection timeout after 15s");
        assert_eq!(
            describe(&unreachable),
            "could not reach device: Connection timeout after 15s"
        );
    }

    #[test]
    fn test_finish_marks_state() {
        let mut sink = crate::ssh::CollectingSink::new();
        let outcome = finish::<()>(
            FlowTracker::new("respring"),
            Err(IsyncError::RemoteCommand {
                command: "killall SpringBoard".into(),
                exit_code: 1,
                output: String::new(),
            }),
            &mut sink,
        );
        assert_eq!(outcome.state, FlowState::Failed);
        assert_eq!(outcome.remote_exit_code, Some(1));
        assert!(outcome.summary().contains("status 1"));
        assert_eq!(sink.events.len(), 1);
    }
}
