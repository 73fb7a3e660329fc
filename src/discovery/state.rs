//! Connection State Machine
//!
//! Tracks one discovery session or one controller connection through
//! `Idle → LogRequested → LogReceived → Connecting → Connected`. A failed
//! connection never reaches `Connected`; only a connected one may be
//! disconnected.

use crate::codec::StatusField;
use serde::Serialize;
use tracing::trace;

/// Why a session or connection ended in `Failed`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    /// The discovery log could not be read or parsed
    Log { message: String },
    /// The target rejected Connect with a non-retryable status
    Rejected { status: StatusField },
    /// A non-retryable transport failure
    Transport { message: String },
    RetriesExhausted { attempts: u32 },
    Cancelled,
    /// The connection succeeded but the topology refused it
    Attach { message: String },
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureReason::Log { message } => write!(f, "discovery log: {}", message),
            FailureReason::Rejected { status } => write!(f, "rejected: {}", status),
            FailureReason::Transport { message } => write!(f, "transport: {}", message),
            FailureReason::RetriesExhausted { attempts } => {
                write!(f, "gave up after {} attempts", attempts)
            }
            FailureReason::Cancelled => write!(f, "cancelled"),
            FailureReason::Attach { message } => write!(f, "attach: {}", message),
        }
    }
}

/// Discovery and connection states
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum DiscoveryState {
    Idle,
    LogRequested,
    LogReceived,
    Connecting,
    Connected,
    Failed { reason: FailureReason },
    Disconnected,
}

impl DiscoveryState {
    /// Check whether `next` may follow this state
    pub fn can_transition(&self, next: &DiscoveryState) -> bool {
        use DiscoveryState::*;
        matches!(
            (self, next),
            (Idle, LogRequested)
                | (Idle, Connecting)
                | (LogRequested, LogReceived)
                | (LogRequested, Failed { .. })
                | (LogReceived, Connecting)
                | (LogReceived, Failed { .. })
                | (Connecting, Connecting)
                | (Connecting, Connected)
                | (Connecting, Failed { .. })
                | (Connected, Disconnected)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DiscoveryState::Failed { .. } | DiscoveryState::Disconnected
        )
    }
}

impl std::fmt::Display for DiscoveryState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DiscoveryState::Idle => write!(f, "idle"),
            DiscoveryState::LogRequested => write!(f, "log-requested"),
            DiscoveryState::LogReceived => write!(f, "log-received"),
            DiscoveryState::Connecting => write!(f, "connecting"),
            DiscoveryState::Connected => write!(f, "connected"),
            DiscoveryState::Failed { reason } => write!(f, "failed ({})", reason),
            DiscoveryState::Disconnected => write!(f, "disconnected"),
        }
    }
}

/// State of one session with its Connect attempt counter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionStateMachine {
    state: DiscoveryState,
    attempts: u32,
}

impl Default for ConnectionStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionStateMachine {
    pub fn new() -> Self {
        Self {
            state: DiscoveryState::Idle,
            attempts: 0,
        }
    }

    pub fn state(&self) -> &DiscoveryState {
        &self.state
    }

    /// Connect attempts issued so far
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Move to `next`
    ///
    /// Every transition into `Connecting` counts one Connect attempt.
    pub fn advance(&mut self, next: DiscoveryState) {
        debug_assert!(
            self.state.can_transition(&next),
            "invalid transition {} -> {}",
            self.state,
            next
        );
        trace!(from = %self.state, to = %next, "State transition");
        if next == DiscoveryState::Connecting {
            self.attempts += 1;
        }
        self.state = next;
    }

    /// Enter `Connecting` for a new attempt and return its number
    pub fn begin_attempt(&mut self) -> u32 {
        self.advance(DiscoveryState::Connecting);
        self.attempts
    }

    pub fn fail(&mut self, reason: FailureReason) {
        self.advance(DiscoveryState::Failed { reason });
    }

    pub fn failure(&self) -> Option<&FailureReason> {
        match &self.state {
            DiscoveryState::Failed { reason } => Some(reason),
            _ => None,
        }
    }
}
