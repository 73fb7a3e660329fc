//! NVMe Host Manager
//!
//! Host-side management of NVMe and NVMe over Fabrics: command encoding,
//! passthrough submission, discovery and connect with bounded retry, and a
//! live model of the host's subsystems, controllers, namespaces and paths.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                         NvmeContext / nvme-host CLI                          │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────────────────┐        ┌────────────────────────────────────┐  │
//! │  │   Discovery Engine      │        │   Topology (RwLock + broadcast)    │  │
//! │  │   state machine, retry  │───────▶│   Host → Subsystem → Controller    │  │
//! │  └────────────┬────────────┘        │           └──▶ Namespace (paths)   │  │
//! │               │                     └─────────────────▲──────────────────┘  │
//! │               ▼                                       │ rescan               │
//! │  ┌─────────────────────────┐        ┌─────────────────┴──────────────────┐  │
//! │  │   Transport Gateway     │        │   Topology Source (sysfs)          │  │
//! │  │   per-handle serialize  │        └────────────────────────────────────┘  │
//! │  └────────────┬────────────┘                                                │
//! │               ▼                                                             │
//! │  ┌─────────────────────────┐        ┌────────────────────────────────────┐  │
//! │  │   Passthrough           │◀──────▶│   Command Codec (SQE/CQE, fabrics, │  │
//! │  │   (Linux ioctl / sim)   │        │   identify, discovery log)         │  │
//! │  └─────────────────────────┘        └────────────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`codec`]: Submission/completion entries and data structure parsing
//! - [`transport`]: Transport gateway and passthrough implementations
//! - [`topology`]: Topology tree, rescan and persistence snapshots
//! - [`discovery`]: Discovery log retrieval and the connect state machine
//! - [`config`]: Settings, host identity and the configuration store
//! - [`context`]: `NvmeContext`, the owner of one host's state
//! - [`domain`]: Address types and the OS port traits
//! - [`error`]: Error types and handling

pub mod codec;
pub mod config;
pub mod context;
pub mod discovery;
pub mod domain;
pub mod error;
pub mod topology;
pub mod transport;

// Re-export commonly used types
pub use codec::{
    Command, Completion, DiscoveryLog, DiscoveryLogEntry, IdentifyController, IdentifyNamespace,
    Opcode, Outcome, StatusField,
};

pub use config::{ConfigStore, HostIdentity, HostIdentitySources, LibraryConfig};

pub use context::NvmeContext;

pub use discovery::{
    CancelToken, ConnectionStateMachine, DiscoveryConfig, DiscoveryEngine, DiscoveryReport,
    DiscoveryState, EntryOutcome, FailureReason, RetryPolicy,
};

pub use domain::{
    ControllerAddress, DataBuffer, Passthrough, QueueKind, SubsystemType, TargetHandle,
    TargetSpec, TopologySource, TransportType, DISCOVERY_NQN,
};

pub use error::{Error, ErrorAction, Result};

pub use topology::{
    Controller, ControllerKey, ControllerState, DetachReport, Namespace, NamespaceHandle,
    RescanReport, Subsystem, SysfsSource, Topology, TopologyEvent, TopologySnapshot, TopologyView,
};

pub use transport::{GatewayConfig, SimulatedPassthrough, TransportGateway};

#[cfg(target_os = "linux")]
pub use transport::{LinuxPassthrough, LinuxPassthroughConfig};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
