//! Test lifecycle transition table.
//!
//! `transition` is pure: it maps the current state and an incoming event to
//! the next state plus the effects the driver must execute. Events that do not
//! apply to the current state return `None` and are dropped, which is what
//! makes late timer or probe signals harmless.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestState {
    #[default]
    Idle,
    Starting,
    Running,
    Stopping,
    Finished,
    Aborted,
}

impl TestState {
    /// A run is in flight.
    pub fn is_active(&self) -> bool {
        matches!(self, TestState::Starting | TestState::Running | TestState::Stopping)
    }

    /// Nothing is in flight: never started, or the last run is over.
    pub fn is_settled(&self) -> bool {
        !self.is_active()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TestState::Idle => "idle",
            TestState::Starting => "starting",
            TestState::Running => "running",
            TestState::Stopping => "stopping",
            TestState::Finished => "finished",
            TestState::Aborted => "aborted",
        }
    }
}

impl std::fmt::Display for TestState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestEvent {
    Start,
    /// Setup finished; probes are in flight.
    Launched,
    /// A precondition or setup step failed; nothing to measure.
    PreconditionFailed,
    Stop,
    Deadline,
    AllSettled,
    TornDown,
    Abort,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    Launch,
    Monitor,
    Teardown,
    Publish,
}

pub fn transition(state: TestState, event: TestEvent) -> Option<(TestState, Vec<Effect>)> {
    use TestEvent::*;
    use TestState::*;

    match (state, event) {
        (Idle | Finished | Aborted, Start) => Some((Starting, vec![Effect::Launch])),
        (Starting, Launched) => Some((Running, vec![Effect::Monitor])),
        (Starting | Running, Stop | Deadline | AllSettled | PreconditionFailed) => {
            Some((Stopping, vec![Effect::Teardown]))
        }
        (Stopping, TornDown) => Some((Finished, vec![Effect::Publish])),
        (Starting | Running, Abort) => Some((Aborted, vec![Effect::Teardown])),
        _ => None,
    }
}
