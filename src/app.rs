//! Application state and the worker dispatcher
//!
//! The event loop owns an [`AppState`] and is the only place it changes.
//! Every user action runs on its own tokio task through the [`Dispatcher`];
//! workers report back exclusively through [`AppEvent`]s sent over one
//! unbounded channel, so the events of one worker arrive in the order they
//! were produced.
//!
//! Listing requests (installed apps, explorer directory) are stamped with a
//! generation number when dispatched. A result whose generation is older
//! than the latest request of the same kind is dropped by [`AppState::apply`].

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::flows::apps::{self, AppEntry};
use crate::flows::{batch, bundle, explorer, maintenance, package};
use crate::flows::{FlowContext, FlowOutcome, FlowState};
use crate::ssh::output::{ChannelSink, OutputEvent, OutputMode};
use crate::transfer::{BatchReport, RemoteEntry};

/// Identifies one dispatched action
pub type FlowId = u64;

/// Something the user asked for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    TestConnection,
    RunCommand(String),
    InstallIpa(PathBuf),
    RunIpainstaller(Vec<String>),
    InstallDeb(PathBuf),
    InstallDebFromUrl(String),
    InstallAppSync,
    UninstallPackage(String),
    Appdrop(PathBuf),
    JailfreeInstall(PathBuf),
    CleanupLeftovers(PathBuf),
    BatchInstallIpas(Vec<PathBuf>),
    BatchAppdrop(PathBuf),
    Uicache,
    Respring,
    PeekRoot,
    CheckAppSync,
    ListApplications,
    ListDir(String),
    UploadFiles {
        files: Vec<PathBuf>,
        remote_dir: String,
    },
    DownloadFiles {
        remotes: Vec<String>,
        local_dir: PathBuf,
    },
    Delete(String),
    Mkdir(String),
    Rename {
        from: String,
        to: String,
    },
}

impl Action {
    /// Name of the flow this action runs
    pub fn flow_name(&self) -> &'static str {
        match self {
            Action::TestConnection => "test_connection",
            Action::RunCommand(_) => "run_command",
            Action::InstallIpa(_) => "install_ipa",
            Action::RunIpainstaller(_) => "run_ipainstaller",
            Action::InstallDeb(_) => "install_deb",
            Action::InstallDebFromUrl(_) => "install_deb_from_url",
            Action::InstallAppSync => "install_appsync",
            Action::UninstallPackage(_) => "uninstall_package",
            Action::Appdrop(_) => "appdrop",
            Action::JailfreeInstall(_) => "jailfree_install",
            Action::CleanupLeftovers(_) => "cleanup_leftovers",
            Action::BatchInstallIpas(_) => "batch_install_ipas",
            Action::BatchAppdrop(_) => "batch_appdrop",
            Action::Uicache => "uicache",
            Action::Respring => "respring",
            Action::PeekRoot => "peek_root",
            Action::CheckAppSync => "check_appsync",
            Action::ListApplications => "list_applications",
            Action::ListDir(_) => "list_dir",
            Action::UploadFiles { .. } => "upload_files",
            Action::DownloadFiles { .. } => "download_files",
            Action::Delete(_) => "delete",
            Action::Mkdir(_) => "mkdir",
            Action::Rename { .. } => "rename",
        }
    }

    fn listing_kind(&self) -> Option<ListingKind> {
        match self {
            Action::ListApplications => Some(ListingKind::Applications),
            Action::ListDir(_) => Some(ListingKind::Directory),
            _ => None,
        }
    }
}

/// Results that can go stale
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ListingKind {
    Applications,
    Directory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ListingRequest {
    pub kind: ListingKind,
    pub generation: u64,
}

/// Messages from workers to the event loop
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum AppEvent {
    FlowStarted {
        id: FlowId,
        flow: &'static str,
        listing: Option<ListingRequest>,
    },
    Output {
        id: FlowId,
        output: OutputEvent,
    },
    Progress {
        id: FlowId,
        percent: f64,
    },
    /// The flow entered a new live phase
    Phase {
        id: FlowId,
        state: FlowState,
    },
    Applications {
        id: FlowId,
        generation: u64,
        apps: Vec<AppEntry>,
    },
    Listing {
        id: FlowId,
        generation: u64,
        path: String,
        entries: Vec<RemoteEntry>,
    },
    Batch {
        id: FlowId,
        report: BatchReport,
    },
    FlowFinished {
        id: FlowId,
        flow: &'static str,
        state: FlowState,
        summary: String,
        remote_exit_code: Option<u32>,
    },
}

/// What the UI knows about one dispatched flow
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FlowStatus {
    pub flow: &'static str,
    pub state: FlowState,
    pub progress: f64,
    pub summary: Option<String>,
    pub remote_exit_code: Option<u32>,
}

/// Directory currently shown in the explorer
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DirListing {
    pub path: String,
    pub entries: Vec<RemoteEntry>,
}

/// Everything the event loop shows
#[derive(Debug, Default)]
pub struct AppState {
    flows: BTreeMap<FlowId, FlowStatus>,
    log: Vec<(FlowId, String)>,
    applications: Vec<AppEntry>,
    apps_generation: u64,
    listing: Option<DirListing>,
    listing_generation: u64,
    status: String,
}

impl AppState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn flow(&self, id: FlowId) -> Option<&FlowStatus> {
        self.flows.get(&id)
    }

    /// Rendered output lines, tagged with the flow that produced them
    pub fn log(&self) -> &[(FlowId, String)] {
        &self.log
    }

    pub fn applications(&self) -> &[AppEntry] {
        &self.applications
    }

    pub fn listing(&self) -> Option<&DirListing> {
        self.listing.as_ref()
    }

    /// Last status bar line
    pub fn status(&self) -> &str {
        &self.status
    }

    /// Fold one worker event into the state. Returns `false` when the event
    /// was dropped as stale.
    pub fn apply(&mut self, event: AppEvent) -> bool {
        match event {
            AppEvent::FlowStarted { id, flow, listing } => {
                if let Some(request) = listing {
                    match request.kind {
                        ListingKind::Applications => {
                            self.apps_generation = self.apps_generation.max(request.generation)
                        }
                        ListingKind::Directory => {
                            self.listing_generation =
                                self.listing_generation.max(request.generation)
                        }
                    }
                }
                self.flows.insert(
                    id,
                    FlowStatus {
                        flow,
                        state: FlowState::Idle,
                        progress: 0.0,
                        summary: None,
                        remote_exit_code: None,
                    },
                );
                self.status = format!("{}: running", flow);
            }
            AppEvent::Output { id, output } => {
                self.log.push((id, output.render()));
            }
            AppEvent::Progress { id, percent } => {
                if let Some(status) = self.flows.get_mut(&id) {
                    status.progress = status.progress.max(percent);
                }
            }
            AppEvent::Phase { id, state } => {
                if let Some(status) = self.flows.get_mut(&id) {
                    if !status.state.is_terminal() && state > status.state {
                        status.state = state;
                    }
                }
            }
            AppEvent::Applications {
                generation, apps, ..
            } => {
                if generation != self.apps_generation {
                    debug!(
                        "Dropping stale application list (generation {}, latest {})",
                        generation, self.apps_generation
                    );
                    return false;
                }
                self.applications = apps;
            }
            AppEvent::Listing {
                generation,
                path,
                entries,
                ..
            } => {
                if generation != self.listing_generation {
                    debug!(
                        "Dropping stale listing of {} (generation {}, latest {})",
                        path, generation, self.listing_generation
                    );
                    return false;
                }
                self.listing = Some(DirListing { path, entries });
            }
            AppEvent::Batch { id, report } => {
                self.log.push((id, format!("Batch finished: {}.", report)));
            }
            AppEvent::FlowFinished {
                id,
                flow,
                state,
                summary,
                remote_exit_code,
            } => {
                let status = self.flows.entry(id).or_insert(FlowStatus {
                    flow,
                    state,
                    progress: 0.0,
                    summary: None,
                    remote_exit_code: None,
                });
                status.state = state;
                status.remote_exit_code = remote_exit_code;
                status.summary = Some(summary.clone());
                self.status = summary;
            }
        }
        true
    }
}

/// Runs actions on worker tasks and funnels their events into one channel
pub struct Dispatcher {
    ctx: FlowContext,
    mode: OutputMode,
    tx: mpsc::UnboundedSender<AppEvent>,
    next_id: AtomicU64,
    generation: AtomicU64,
}

impl Dispatcher {
    pub fn new(ctx: FlowContext, mode: OutputMode) -> (Self, mpsc::UnboundedReceiver<AppEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let dispatcher = Self {
            ctx,
            mode,
            tx,
            next_id: AtomicU64::new(1),
            generation: AtomicU64::new(0),
        };
        (dispatcher, rx)
    }

    /// Start `action` on its own task.
    ///
    /// `FlowStarted` is queued before the task exists, so it always precedes
    /// the worker's own events. A worker that panics still produces a
    /// `FlowFinished` in state `Failed`.
    pub fn spawn(&self, action: Action) -> FlowId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let flow = action.flow_name();
        let listing = action.listing_kind().map(|kind| ListingRequest {
            kind,
            generation: self.generation.fetch_add(1, Ordering::SeqCst) + 1,
        });

        let _ = self.tx.send(AppEvent::FlowStarted { id, flow, listing });

        let progress_tx = self.tx.clone();
        let phase_tx = self.tx.clone();
        let ctx = self
            .ctx
            .clone()
            .with_progress(Arc::new(move |percent: f64| {
                let _ = progress_tx.send(AppEvent::Progress { id, percent });
            }))
            .with_phases(Arc::new(move |state: FlowState| {
                let _ = phase_tx.send(AppEvent::Phase { id, state });
            }));
        let worker = Worker {
            id,
            generation: listing.map(|l| l.generation).unwrap_or(0),
            tx: self.tx.clone(),
            mode: self.mode,
        };
        let handle = tokio::spawn(worker.run(ctx, action));

        let tx = self.tx.clone();
        tokio::spawn(async move {
            if let Err(e) = handle.await {
                error!("{} worker {} died: {}", flow, id, e);
                let _ = tx.send(AppEvent::FlowFinished {
                    id,
                    flow,
                    state: FlowState::Failed,
                    summary: format!("{}: worker failed: {}", flow, e),
                    remote_exit_code: None,
                });
            }
        });

        id
    }
}

struct Worker {
    id: FlowId,
    generation: u64,
    tx: mpsc::UnboundedSender<AppEvent>,
    mode: OutputMode,
}

impl Worker {
    fn send(&self, event: AppEvent) {
        let _ = self.tx.send(event);
    }

    /// Forward a flow's value as an event, keeping only its status
    fn publish<T>(&self, mut outcome: FlowOutcome<T>, to_event: impl FnOnce(T) -> AppEvent) -> FlowOutcome {
        if let Some(value) = outcome.value.take() {
            self.send(to_event(value));
        }
        outcome.discard()
    }

    async fn run(self, ctx: FlowContext, action: Action) {
        let id = self.id;
        let generation = self.generation;
        let mut sink = ChannelSink::new(self.tx.clone(), self.mode, move |output| {
            AppEvent::Output { id, output }
        });
        let sink = &mut sink;

        let outcome = match action {
            Action::TestConnection => maintenance::test_connection(&ctx, sink).await,
            Action::RunCommand(command) => maintenance::run_command(&ctx, &command, sink).await,
            Action::InstallIpa(ipa) => package::install_ipa(&ctx, &ipa, sink).await,
            Action::RunIpainstaller(args) => package::run_ipainstaller(&ctx, &args, sink).await,
            Action::InstallDeb(deb) => package::install_deb(&ctx, &deb, sink).await,
            Action::InstallDebFromUrl(url) => package::install_deb_from_url(&ctx, &url, sink).await,
            Action::InstallAppSync => package::install_appsync(&ctx, sink).await,
            Action::UninstallPackage(package) => {
                package::uninstall_package(&ctx, &package, sink).await
            }
            Action::Appdrop(input) => bundle::appdrop(&ctx, &input, sink).await,
            Action::JailfreeInstall(ipa) => bundle::jailfree_install(&ctx, &ipa, sink).await,
            Action::CleanupLeftovers(input) => bundle::cleanup_leftovers(&ctx, &input, sink).await,
            Action::BatchInstallIpas(ipas) => {
                let outcome = batch::batch_install_ipas(&ctx, &ipas, sink).await;
                self.publish(outcome, |report| AppEvent::Batch { id, report })
            }
            Action::BatchAppdrop(folder) => {
                let outcome = batch::batch_appdrop(&ctx, &folder, sink).await;
                self.publish(outcome, |report| AppEvent::Batch { id, report })
            }
            Action::Uicache => maintenance::uicache(&ctx, sink).await,
            Action::Respring => maintenance::respring(&ctx, sink).await,
            Action::PeekRoot => maintenance::peek_root(&ctx, sink).await,
            Action::CheckAppSync => maintenance::check_appsync(&ctx, sink).await,
            Action::ListApplications => {
                let outcome = apps::list_applications(&ctx, sink).await;
                self.publish(outcome, |apps| AppEvent::Applications {
                    id,
                    generation,
                    apps,
                })
            }
            Action::ListDir(path) => {
                let outcome = explorer::list_dir(&ctx, &path, sink).await;
                self.publish(outcome, |entries| AppEvent::Listing {
                    id,
                    generation,
                    path,
                    entries,
                })
            }
            Action::UploadFiles { files, remote_dir } => {
                let outcome = explorer::upload_files(&ctx, &files, &remote_dir, sink).await;
                self.publish(outcome, |report| AppEvent::Batch { id, report })
            }
            Action::DownloadFiles { remotes, local_dir } => {
                let outcome = explorer::download_files(&ctx, &remotes, &local_dir, sink).await;
                self.publish(outcome, |report| AppEvent::Batch { id, report })
            }
            Action::Delete(path) => explorer::delete(&ctx, &path, sink).await,
            Action::Mkdir(path) => explorer::mkdir(&ctx, &path, sink).await,
            Action::Rename { from, to } => explorer::rename(&ctx, &from, &to, sink).await,
        };

        self.send(AppEvent::FlowFinished {
            id,
            flow: outcome.flow,
            state: outcome.state,
            summary: outcome.summary(),
            remote_exit_code: outcome.remote_exit_code,
        });
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::device::{Connector, DeviceSession};
    use crate::error::Result;
    use crate::flows::mock::{MockConnector, MockDevice};
    use crate::flows::FlowOptions;
    use crate::transfer::memory::MemoryFs;

    fn dispatcher(fs: MemoryFs) -> (Arc<MockDevice>, Dispatcher, mpsc::UnboundedReceiver<AppEvent>) {
        let device = MockDevice::new(fs);
        let ctx = FlowContext::new(MockConnector::new(Arc::clone(&device)), FlowOptions::default());
        let (dispatcher, rx) = Dispatcher::new(ctx, OutputMode::Normal);
        (device, dispatcher, rx)
    }

    /// Receive events until `id` finishes
    async fn drain(
        rx: &mut mpsc::UnboundedReceiver<AppEvent>,
        id: FlowId,
        state: &mut AppState,
    ) -> Vec<AppEvent> {
        let mut seen = Vec::new();
        while let Some(event) = rx.recv().await {
            let done = matches!(event, AppEvent::FlowFinished { id: done, .. } if done == id);
            seen.push(event.clone());
            state.apply(event);
            if done {
                break;
            }
        }
        seen
    }

    #[tokio::test]
    async fn test_worker_events_arrive_in_order() {
        let (device, dispatcher, mut rx) = dispatcher(MemoryFs::new());
        device.respond("uname", 0, "Darwin\n");
        let mut state = AppState::new();

        let id = dispatcher.spawn(Action::RunCommand("uname -a".into()));
        let events = drain(&mut rx, id, &mut state).await;

        assert!(matches!(events.first(), Some(AppEvent::FlowStarted { .. })));
        let rendered: Vec<String> = events
            .iter()
            .filter_map(|e| match e {
                AppEvent::Output { output, .. } => Some(output.render()),
                _ => None,
            })
            .collect();
        assert_eq!(
            rendered,
            vec!["Connecting to root@mock:22...", "$ uname -a", "Darwin\n", "[exit 0]"]
        );
        assert_eq!(state.flow(id).unwrap().state, FlowState::Done);
        assert_eq!(state.status(), "run_command: done");
    }

    #[tokio::test]
    async fn test_phases_are_reported_while_running() {
        let (device, dispatcher, mut rx) = dispatcher(MemoryFs::new());
        device.respond("uname", 0, "Darwin\n");
        let mut state = AppState::new();

        let id = dispatcher.spawn(Action::RunCommand("uname -a".into()));
        let events = drain(&mut rx, id, &mut state).await;

        let phases: Vec<FlowState> = events
            .iter()
            .filter_map(|e| match e {
                AppEvent::Phase { state, .. } => Some(*state),
                _ => None,
            })
            .collect();
        assert_eq!(
            phases,
            vec![FlowState::Validating, FlowState::Connecting, FlowState::Executing]
        );
        assert_eq!(state.flow(id).unwrap().state, FlowState::Done);
    }

    #[test]
    fn test_phase_only_moves_forward() {
        let mut state = AppState::new();
        state.apply(AppEvent::FlowStarted {
            id: 7,
            flow: "appdrop",
            listing: None,
        });
        state.apply(AppEvent::Phase {
            id: 7,
            state: FlowState::Transferring,
        });
        assert_eq!(state.flow(7).unwrap().state, FlowState::Transferring);

        state.apply(AppEvent::Phase {
            id: 7,
            state: FlowState::Connecting,
        });
        assert_eq!(state.flow(7).unwrap().state, FlowState::Transferring);

        state.apply(AppEvent::FlowFinished {
            id: 7,
            flow: "appdrop",
            state: FlowState::Failed,
            summary: "appdrop: failed".into(),
            remote_exit_code: None,
        });
        state.apply(AppEvent::Phase {
            id: 7,
            state: FlowState::Executing,
        });
        assert_eq!(state.flow(7).unwrap().state, FlowState::Failed);
    }

    #[tokio::test]
    async fn test_failed_flow_is_reported_not_raised() {
        let (device, dispatcher, mut rx) = dispatcher(MemoryFs::new());
        device.respond("killall", 1, "");
        let mut state = AppState::new();

        let id = dispatcher.spawn(Action::Respring);
        drain(&mut rx, id, &mut state).await;

        let status = state.flow(id).unwrap();
        assert_eq!(status.state, FlowState::Failed);
        assert_eq!(status.remote_exit_code, Some(1));
    }

    #[tokio::test]
    async fn test_application_list_applied() {
        let fs = MemoryFs::new().with_dir("/Applications/Stock.app");
        let (_device, dispatcher, mut rx) = dispatcher(fs);
        let mut state = AppState::new();

        let id = dispatcher.spawn(Action::ListApplications);
        drain(&mut rx, id, &mut state).await;
        assert_eq!(state.applications().len(), 1);
        assert_eq!(state.applications()[0].name, "Stock.app");
    }

    #[test]
    fn test_stale_listing_is_dropped() {
        let mut state = AppState::new();
        for (id, generation) in [(1, 1), (2, 2)] {
            state.apply(AppEvent::FlowStarted {
                id,
                flow: "list_dir",
                listing: Some(ListingRequest {
                    kind: ListingKind::Directory,
                    generation,
                }),
            });
        }

        let newer = AppEvent::Listing {
            id: 2,
            generation: 2,
            path: "/var/mobile".into(),
            entries: Vec::new(),
        };
        let older = AppEvent::Listing {
            id: 1,
            generation: 1,
            path: "/var/root".into(),
            entries: Vec::new(),
        };
        assert!(state.apply(newer));
        assert!(!state.apply(older));
        assert_eq!(state.listing().unwrap().path, "/var/mobile");
    }

    struct Exploding;

    #[async_trait]
    impl Connector for Exploding {
        async fn connect(&self) -> Result<Box<dyn DeviceSession>> {
            panic!("connector blew up");
        }

        fn target(&self) -> String {
            "root@boom:22".to_string()
        }
    }

    #[tokio::test]
    async fn test_panicking_worker_yields_failed_event() {
        let ctx = FlowContext::new(Arc::new(Exploding), FlowOptions::default());
        let (dispatcher, mut rx) = Dispatcher::new(ctx, OutputMode::Normal);
        let mut state = AppState::new();

        let id = dispatcher.spawn(Action::TestConnection);
        drain(&mut rx, id, &mut state).await;

        let status = state.flow(id).unwrap();
        assert_eq!(status.state, FlowState::Failed);
        assert!(status.summary.as_deref().unwrap().contains("worker failed"));
    }
}
