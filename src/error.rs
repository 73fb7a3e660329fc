//! Error types for the NVMe host manager
//!
//! Provides structured error types for every layer of the library: the
//! command codec, the transport gateway, the topology tree, the discovery
//! state machine and the persisted configuration.

use crate::codec::{Opcode, Outcome, StatusField};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

// =============================================================================
// Transport Errors
// =============================================================================

/// Failures reported by the passthrough transport
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Target not connected: {target}")]
    NotConnected { target: String },

    #[error("Command {opcode} timed out on {target}")]
    Timeout { target: String, opcode: String },

    #[error("I/O failure on {target} ({opcode}): errno {errno}")]
    IoFailure {
        target: String,
        opcode: String,
        errno: i32,
    },
}

impl TransportError {
    /// Map a raw errno reported by the kernel
    pub fn from_errno(target: impl Into<String>, opcode: impl Into<String>, errno: i32) -> Self {
        let target = target.into();
        let opcode = opcode.into();
        match errno {
            libc::ETIMEDOUT => TransportError::Timeout { target, opcode },
            libc::ENODEV | libc::ENXIO | libc::ENOTCONN => TransportError::NotConnected { target },
            errno => TransportError::IoFailure {
                target,
                opcode,
                errno,
            },
        }
    }

    /// Check whether a retry of the same command may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            TransportError::Timeout { .. } => true,
            TransportError::NotConnected { .. } => false,
            TransportError::IoFailure { errno, .. } => matches!(
                *errno,
                libc::EAGAIN
                    | libc::EBUSY
                    | libc::EINTR
                    | libc::ECONNREFUSED
                    | libc::ECONNRESET
                    | libc::EHOSTUNREACH
                    | libc::ENETUNREACH
                    | libc::EALREADY
            ),
        }
    }

    /// Target the error was reported for
    pub fn target(&self) -> &str {
        match self {
            TransportError::NotConnected { target }
            | TransportError::Timeout { target, .. }
            | TransportError::IoFailure { target, .. } => target,
        }
    }
}

// =============================================================================
// Protocol Errors
// =============================================================================

/// Malformed commands or completions
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Malformed completion: expected 16 bytes, got {len}")]
    MalformedCompletion { len: usize },

    #[error("Reserved status code type {sct:#x} in completion for command id {command_id}")]
    UnexpectedStatusType { sct: u8, command_id: u16 },

    #[error("Completion for command id {actual} does not match submitted id {expected}")]
    CommandIdMismatch { expected: u16, actual: u16 },

    #[error("Unknown {queue} opcode {opcode:#04x}")]
    UnknownOpcode { queue: &'static str, opcode: u8 },

    #[error("{opcode} transfers {expected} bytes, buffer holds {actual}")]
    TransferLength {
        opcode: String,
        expected: usize,
        actual: usize,
    },

    #[error("Invalid field {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },

    #[error("Malformed {structure}: {reason}")]
    MalformedData {
        structure: &'static str,
        reason: String,
    },

    #[error("Discovery log changed during retrieval (generation {first} -> {last})")]
    LogGenerationUnstable { first: u64, last: u64 },
}

// =============================================================================
// Topology Errors
// =============================================================================

/// Refusals from `attach_controller`
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AttachError {
    #[error("Controller {address} already attached to subsystem {subnqn}")]
    Duplicate { subnqn: String, address: String },

    #[error("Subsystem not found: {subnqn}")]
    SubsystemNotFound { subnqn: String },

    #[error("Host not found: {hostnqn}")]
    HostNotFound { hostnqn: String },

    #[error("Controller name {name} already in use")]
    NameInUse { name: String },

    #[error("Controller not found: {controller}")]
    ControllerNotFound { controller: String },
}

/// Refusals from `detach_controller`
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DetachError {
    #[error("Controller not found: {controller}")]
    NotFound { controller: String },

    #[error("Controller {controller} is the only path to in-use namespace {nsid} of {subnqn}")]
    Busy {
        controller: String,
        subnqn: String,
        nsid: u32,
    },
}

// =============================================================================
// Configuration Errors
// =============================================================================

/// Failures loading or saving the persisted configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed configuration {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to serialize configuration for {path}: {source}")]
    Serialize {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

// =============================================================================
// Unified Error
// =============================================================================

/// Unified error type for the library
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("{opcode} failed on {target}: {status}")]
    Command {
        target: String,
        opcode: Opcode,
        status: StatusField,
    },

    #[error("Connect to {subnqn} at {target} failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        target: String,
        subnqn: String,
        attempts: u32,
        last: Box<Error>,
    },

    #[error("Operation on {target} cancelled")]
    Cancelled { target: String },

    #[error(transparent)]
    Attach(#[from] AttachError),

    #[error(transparent)]
    Detach(#[from] DetachError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Topology scan failed: {0}")]
    Scan(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Action a caller should take on error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Re-issue the command after a backoff delay
    RetryWithBackoff(Duration),
    /// The target must be reconnected before retrying
    Reconnect,
    /// Report to the caller, never retried
    Surface,
}

impl Error {
    /// Determine what action to take for this error
    pub fn action(&self) -> ErrorAction {
        match self {
            Error::Transport(e) if e.is_retryable() => {
                ErrorAction::RetryWithBackoff(Duration::from_secs(1))
            }
            Error::Transport(TransportError::NotConnected { .. }) => ErrorAction::Reconnect,
            Error::Command { opcode, status, .. } => match status.outcome(*opcode) {
                Outcome::Retryable => ErrorAction::RetryWithBackoff(Duration::from_secs(1)),
                Outcome::Success | Outcome::Fatal => ErrorAction::Surface,
            },
            _ => ErrorAction::Surface,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self.action(), ErrorAction::RetryWithBackoff(_))
    }

    /// Process exit code used by the command line front end
    pub fn exit_code(&self) -> u8 {
        match self {
            Error::Transport(_) | Error::RetriesExhausted { .. } | Error::Cancelled { .. } => 2,
            Error::Command { .. } | Error::Protocol(_) => 2,
            Error::Attach(_) | Error::Detach(_) => 3,
            Error::InvalidInput(_) | Error::Config(_) => 1,
            Error::Scan(_) | Error::Io(_) => 2,
        }
    }
}

/// Result type alias for the library
pub type Result<T> = std::result::Result<T, Error>;
