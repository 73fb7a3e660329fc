//! Discovery and Connect
//!
//! Reads discovery log pages, connects the advertised controllers with
//! bounded retry and records them in the topology.

pub mod engine;
pub mod retry;
pub mod state;

pub use engine::{DiscoveryConfig, DiscoveryEngine, DiscoveryReport, EntryOutcome, EntryReport};
pub use retry::{CancelToken, RetryPolicy};
pub use state::{ConnectionStateMachine, DiscoveryState, FailureReason};
