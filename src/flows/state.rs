//! Per-flow state machine

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn};

/// Phases of one flow run, in order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowState {
    Idle,
    Validating,
    Connecting,
    Transferring,
    Executing,
    Done,
    Failed,
}

impl FlowState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, FlowState::Done | FlowState::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FlowState::Idle => "idle",
            FlowState::Validating => "validating",
            FlowState::Connecting => "connecting",
            FlowState::Transferring => "transferring",
            FlowState::Executing => "executing",
            FlowState::Done => "done",
            FlowState::Failed => "failed",
        }
    }
}

impl fmt::Display for FlowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Told about every live (non-terminal) phase a tracked run enters
pub type PhaseObserver = Arc<dyn Fn(FlowState) + Send + Sync>;

/// Tracks one run; states only move forward and a terminal state is final
#[derive(Clone)]
pub struct FlowTracker {
    flow: &'static str,
    state: FlowState,
    history: Vec<FlowState>,
    observer: Option<PhaseObserver>,
}

impl FlowTracker {
    pub fn new(flow: &'static str) -> Self {
        Self::observed(flow, None)
    }

    /// A tracker that reports its live phases to `observer`
    pub fn observed(flow: &'static str, observer: Option<PhaseObserver>) -> Self {
        Self {
            flow,
            state: FlowState::Idle,
            history: vec![FlowState::Idle],
            observer,
        }
    }

    pub fn flow(&self) -> &'static str {
        self.flow
    }

    pub fn state(&self) -> FlowState {
        self.state
    }

    /// Every state entered, in order
    pub fn history(&self) -> &[FlowState] {
        &self.history
    }

    /// Move to `next`. Staying put is a no-op; moving backwards or leaving a
    /// terminal state is refused.
    pub fn advance(&mut self, next: FlowState) {
        if next == self.state {
            return;
        }
        if self.state.is_terminal() || next < self.state {
            warn!(
                "{}: refusing transition {} -> {}",
                self.flow, self.state, next
            );
            return;
        }
        debug!("{}: {} -> {}", self.flow, self.state, next);
        self.state = next;
        self.history.push(next);

        if !next.is_terminal() {
            if let Some(observer) = &self.observer {
                observer(next);
            }
        }
    }

    pub fn succeed(&mut self) {
        self.advance(FlowState::Done);
    }

    pub fn fail(&mut self) {
        if self.state.is_terminal() {
            return;
        }
        debug!("{}: {} -> failed", self.flow, self.state);
        self.state = FlowState::Failed;
        self.history.push(FlowState::Failed);
    }
}

impl fmt::Debug for FlowTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowTracker")
            .field("flow", &self.flow)
            .field("state", &self.state)
            .field("history", &self.history)
            .field("observed", &self.observer.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[test]
    fn test_forward_only() {
        let mut tracker = FlowTracker::new("install_deb");
        tracker.advance(FlowState::Validating);
        tracker.advance(FlowState::Connecting);
        tracker.advance(FlowState::Executing);
        tracker.advance(FlowState::Transferring);
        assert_eq!(tracker.state(), FlowState::Executing);

        tracker.succeed();
        tracker.fail();
        assert_eq!(tracker.state(), FlowState::Done);
        assert_eq!(
            tracker.history(),
            &[
                FlowState::Idle,
                FlowState::Validating,
                FlowState::Connecting,
                FlowState::Executing,
                FlowState::Done
            ]
        );
    }

    #[test]
    fn test_fail_from_any_live_state() {
        let mut tracker = FlowTracker::new("appdrop");
        tracker.advance(FlowState::Connecting);
        tracker.fail();
        assert_eq!(tracker.state(), FlowState::Failed);
        tracker.advance(FlowState::Executing);
        assert_eq!(tracker.state(), FlowState::Failed);
    }

    #[test]
    fn test_observer_sees_live_phases_only() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let record = Arc::clone(&seen);
        let mut tracker = FlowTracker::observed(
            "install_deb",
            Some(Arc::new(move |state: FlowState| {
                record.lock().unwrap().push(state)
            })),
        );
        tracker.advance(FlowState::Validating);
        tracker.advance(FlowState::Validating);
        tracker.advance(FlowState::Connecting);
        tracker.advance(FlowState::Executing);
        tracker.advance(FlowState::Transferring);
        tracker.succeed();

        assert_eq!(
            *seen.lock().unwrap(),
            vec![FlowState::Validating, FlowState::Connecting, FlowState::Executing]
        );
    }
}
