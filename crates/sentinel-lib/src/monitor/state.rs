//! Connection state machine of a monitor agent
//!
//! `Disconnected → Connecting → Connected → Disconnected (session lost) →
//! Connecting (retry)`, terminal only on explicit shutdown. A transport that
//! repairs its own link passes through `Reconnecting` instead. The
//! transition function is pure; [`super::MonitorAgent`] performs the effects.

use crate::error::ErrorKind;

/// Where the agent is in its connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    /// No session; a retry is scheduled after `attempt` consecutive failures
    Disconnected { attempt: u32 },
    /// A connect call is in flight
    Connecting { attempt: u32 },
    /// Session up, polling on every tick
    Connected,
    /// Session exists but the link dropped; the transport is reconnecting
    Reconnecting,
    /// Credentials rejected; waits for an operator instead of retrying
    AuthRejected,
    Shutdown,
}

impl Default for MonitorState {
    fn default() -> Self {
        MonitorState::Disconnected { attempt: 0 }
    }
}

impl MonitorState {
    pub fn as_str(&self) -> &'static str {
        match self {
            MonitorState::Disconnected { .. } => "disconnected",
            MonitorState::Connecting { .. } => "connecting",
            MonitorState::Connected => "connected",
            MonitorState::Reconnecting => "reconnecting",
            MonitorState::AuthRejected => "auth_rejected",
            MonitorState::Shutdown => "shutdown",
        }
    }

    pub fn is_polling(&self) -> bool {
        matches!(self, MonitorState::Connected)
    }
}

/// Inputs to the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorEvent {
    /// Poll interval elapsed
    Tick,
    /// Backoff delay before the next connect attempt elapsed
    RetryElapsed,
    ConnectSucceeded,
    ConnectFailed(ErrorKind),
    /// The transport is repairing the link itself
    LinkDown,
    LinkUp,
    /// The session ended for good and needs a fresh connect
    SessionEnded,
    ShutdownRequested,
}

/// Side effects requested by a transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    /// Open a transport session
    Connect,
    /// Wait out the backoff for the given attempt, then feed `RetryElapsed`
    ScheduleRetry { attempt: u32 },
    /// Poll the hypervisor and publish one sample per entity
    Poll,
    /// Publish a heartbeat for this tick
    PublishHeartbeat,
    /// Surface a rejected session to the operator
    ReportAuthFailure,
    /// Close the session
    Close,
}

/// Compute the next state and its effects
pub fn transition(state: MonitorState, event: MonitorEvent) -> (MonitorState, Vec<Effect>) {
    use MonitorEvent as E;
    use MonitorState as S;

    match (state, event) {
        (S::Shutdown, _) => (S::Shutdown, vec![]),

        (S::Connected | S::Reconnecting, E::ShutdownRequested) => {
            (S::Shutdown, vec![Effect::Close])
        }
        (_, E::ShutdownRequested) => (S::Shutdown, vec![]),

        (S::Disconnected { attempt }, E::RetryElapsed) => {
            (S::Connecting { attempt }, vec![Effect::Connect])
        }

        (S::Connecting { .. }, E::ConnectSucceeded) => (S::Connected, vec![]),
        (S::Connecting { .. }, E::ConnectFailed(ErrorKind::Auth)) => {
            (S::AuthRejected, vec![Effect::ReportAuthFailure])
        }
        (S::Connecting { attempt }, E::ConnectFailed(_)) => {
            let attempt = attempt.saturating_add(1);
            (
                S::Disconnected { attempt },
                vec![Effect::ScheduleRetry { attempt }],
            )
        }

        (S::Connected, E::Tick) => (S::Connected, vec![Effect::Poll, Effect::PublishHeartbeat]),
        (S::Connected, E::LinkDown) => (S::Reconnecting, vec![]),
        (S::Reconnecting, E::LinkUp) => (S::Connected, vec![]),
        (S::Connected | S::Reconnecting, E::SessionEnded) => (
            S::Disconnected { attempt: 1 },
            vec![Effect::Close, Effect::ScheduleRetry { attempt: 1 }],
        ),
        // Credentials revoked while the transport was re-establishing the link
        (S::Connected | S::Reconnecting, E::ConnectFailed(ErrorKind::Auth)) => {
            (S::AuthRejected, vec![Effect::Close, Effect::ReportAuthFailure])
        }

        // Anything else leaves the state as is; samples are never replayed
        (state, _) => (state, vec![]),
    }
}
