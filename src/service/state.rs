//! Service state machine
//!
//! ```text
//! NotStarted --start--> Running <--pause/continue--> Paused
//!                          \                          /
//!                           +---stop/shutdown--------+--> Stopping --> Stopped
//! ```
//!
//! Interrogate re-reports the current state. Anything else is ignored.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceState {
    NotStarted,
    Running,
    Paused,
    Stopping,
    Stopped,
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ServiceState::NotStarted => "not started",
            ServiceState::Running => "running",
            ServiceState::Paused => "paused",
            ServiceState::Stopping => "stopping",
            ServiceState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Control request from the service manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlSignal {
    Stop,
    Shutdown,
    Pause,
    Continue,
    Interrogate,
    /// Raw code of a request this service does not act on.
    Other(u32),
}

/// Signals advertised to the service manager while running or paused.
pub const ACCEPTED_SIGNALS: [ControlSignal; 4] = [
    ControlSignal::Stop,
    ControlSignal::Shutdown,
    ControlSignal::Pause,
    ControlSignal::Continue,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceStatus {
    pub state: ServiceState,
    pub accepted: &'static [ControlSignal],
}

impl ServiceStatus {
    pub fn new(state: ServiceState) -> Self {
        let accepted: &'static [ControlSignal] = match state {
            ServiceState::Running | ServiceState::Paused => &ACCEPTED_SIGNALS,
            _ => &[],
        };
        Self { state, accepted }
    }

    pub fn accepts(&self, signal: ControlSignal) -> bool {
        self.accepted.contains(&signal)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Move to the new state and report it.
    Report,
    /// Report the new state and leave the control loop.
    Stop,
    Ignore,
}

pub fn transition(state: ServiceState, signal: ControlSignal) -> (ServiceState, Action) {
    use ControlSignal::*;
    use ServiceState::*;

    match (state, signal) {
        (Stopping | Stopped, _) => (state, Action::Ignore),
        (_, Stop | Shutdown) => (Stopping, Action::Stop),
        (Running | Paused, Pause) => (Paused, Action::Report),
        (Running | Paused, Continue) => (Running, Action::Report),
        (_, Interrogate) => (state, Action::Report),
        _ => (state, Action::Ignore),
    }
}
