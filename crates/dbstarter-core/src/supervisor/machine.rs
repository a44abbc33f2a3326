//! Restart state machine of one role.
//!
//! The transition function is pure: given the current state, the recent
//! failure count and an event, it yields the next state and count. The
//! supervisor loop feeds it events and acts on the resulting state.

use std::time::Duration;

/// Restart policy. Short runs count as failures; too many in a row give
/// the role up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartPolicy {
    /// Runs shorter than this count as failures.
    pub min_uptime: Duration,
    /// Consecutive failures after which the role is given up.
    pub max_recent_failures: u32,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            min_uptime: Duration::from_secs(30),
            max_recent_failures: 100,
        }
    }
}

/// Where a role's supervisor stands. `generation` counts restarts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Starting { generation: u32 },
    AwaitingReady { generation: u32 },
    Running { generation: u32 },
    Restarting { generation: u32 },
    GivenUp,
    Stopped,
}

impl SupervisorState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SupervisorState::GivenUp | SupervisorState::Stopped)
    }
}

/// Input to the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorEvent {
    /// A new instance was launched.
    Started,
    /// A running, ready instance was found and taken over.
    Adopted,
    /// The instance answered its readiness probe.
    Ready,
    /// The instance exited after `uptime`; `stopping` is the service stop flag.
    Exited { uptime: Duration, stopping: bool },
    /// Launching failed. Not retried.
    StartFailed,
    /// The service is stopping before an instance was launched.
    StopRequested,
    /// Leave `Restarting` for the next generation.
    Restart,
}

/// Pure transition function.
pub fn transition(
    state: SupervisorState,
    recent_failures: u32,
    event: SupervisorEvent,
    policy: &RestartPolicy,
) -> (SupervisorState, u32) {
    use SupervisorEvent as E;
    use SupervisorState as S;

    match (state, event) {
        (S::Starting { generation }, E::Started) => {
            (S::AwaitingReady { generation }, recent_failures)
        }
        (S::Starting { generation }, E::Adopted) => (S::Running { generation }, recent_failures),
        (S::Starting { .. }, E::StartFailed) => (S::Stopped, recent_failures),
        (S::Starting { .. } | S::Restarting { .. }, E::StopRequested) => {
            (S::Stopped, recent_failures)
        }
        (S::AwaitingReady { generation }, E::Ready) => {
            (S::Running { generation }, recent_failures)
        }
        (
            S::AwaitingReady { generation } | S::Running { generation },
            E::Exited { uptime, stopping },
        ) => {
            let failures = if uptime < policy.min_uptime {
                recent_failures + 1
            } else {
                0
            };
            let next = if stopping {
                S::Stopped
            } else if failures >= policy.max_recent_failures {
                S::GivenUp
            } else {
                S::Restarting { generation }
            };
            (next, failures)
        }
        (S::Restarting { generation }, E::Restart) => (
            S::Starting {
                generation: generation + 1,
            },
            recent_failures,
        ),
        (state, _) => (state, recent_failures),
    }
}

/// Stateful wrapper over [`transition`].
#[derive(Debug, Clone)]
pub struct SupervisorMachine {
    state: SupervisorState,
    recent_failures: u32,
    policy: RestartPolicy,
}

impl SupervisorMachine {
    pub fn new(policy: RestartPolicy) -> Self {
        Self {
            state: SupervisorState::Starting { generation: 0 },
            recent_failures: 0,
            policy,
        }
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    pub fn recent_failures(&self) -> u32 {
        self.recent_failures
    }

    /// Apply `event` and return the new state.
    pub fn on_event(&mut self, event: SupervisorEvent) -> SupervisorState {
        let (state, failures) = transition(self.state, self.recent_failures, event, &self.policy);
        self.state = state;
        self.recent_failures = failures;
        state
    }
}
