//! Topology Tree
//!
//! The host's view of NVMe: hosts own subsystems, subsystems own
//! controllers and namespaces, and paths connect controllers to the
//! namespaces they can reach.

pub mod entities;
pub mod events;
pub mod handle;
pub mod rescan;
pub mod snapshot;
pub mod sysfs;
pub mod tree;

pub use entities::{
    AnaState, Controller, ControllerKey, ControllerOrigin, ControllerSpec, ControllerState, Host,
    HostKey, Namespace, NamespaceHandle, NamespaceKey, Path, Subsystem, SubsystemKey,
};
pub use events::TopologyEvent;
pub use handle::Topology;
pub use rescan::{
    reconcile, RescanReport, ScannedController, ScannedNamespace, ScannedPath, ScannedSubsystem,
    StaticSource, SystemSnapshot,
};
pub use snapshot::{
    ControllerRecord, HostRecord, NamespaceRecord, SubsystemRecord, TopologySnapshot, TopologyView,
};
pub use sysfs::SysfsSource;
pub use tree::{DetachReport, PathChange, TopologyTree};
