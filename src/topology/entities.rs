//! Topology Entities
//!
//! Hosts, subsystems, controllers, namespaces and the path edges between
//! controllers and namespaces. Entities refer to each other by copyable
//! keys into the tree's arenas, never by owning references.

use crate::domain::{ControllerAddress, SubsystemType, TargetHandle};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use uuid::Uuid;

// =============================================================================
// Keys
// =============================================================================

macro_rules! entity_key {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub u64);

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, concat!($prefix, "{}"), self.0)
            }
        }
    };
}

entity_key!(
    /// Stable key of a host
    HostKey,
    "host#"
);
entity_key!(
    /// Stable key of a subsystem
    SubsystemKey,
    "subsys#"
);
entity_key!(
    /// Stable key of a controller
    ControllerKey,
    "ctrl#"
);
entity_key!(
    /// Stable key of a namespace
    NamespaceKey,
    "ns#"
);

// =============================================================================
// States
// =============================================================================

/// Connection state of a controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControllerState {
    Disconnected,
    Connecting,
    Connected,
    Resetting,
    Failed,
}

impl ControllerState {
    /// Map the kernel `state` attribute of a controller
    pub fn from_sysfs(state: &str) -> Self {
        match state.trim() {
            "live" => ControllerState::Connected,
            "new" | "connecting" => ControllerState::Connecting,
            "resetting" => ControllerState::Resetting,
            "deleting" | "deleting (no IO)" | "dead" => ControllerState::Failed,
            _ => ControllerState::Failed,
        }
    }

    pub fn is_live(&self) -> bool {
        matches!(self, ControllerState::Connected | ControllerState::Resetting)
    }
}

impl std::fmt::Display for ControllerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ControllerState::Disconnected => write!(f, "disconnected"),
            ControllerState::Connecting => write!(f, "connecting"),
            ControllerState::Connected => write!(f, "connected"),
            ControllerState::Resetting => write!(f, "resetting"),
            ControllerState::Failed => write!(f, "failed"),
        }
    }
}

/// Asymmetric namespace access state of a path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AnaState {
    Optimized,
    NonOptimized,
    Inaccessible,
    PersistentLoss,
    Change,
}

impl AnaState {
    pub fn from_sysfs(state: &str) -> Option<Self> {
        match state.trim() {
            "optimized" => Some(AnaState::Optimized),
            "non-optimized" => Some(AnaState::NonOptimized),
            "inaccessible" => Some(AnaState::Inaccessible),
            "persistent-loss" => Some(AnaState::PersistentLoss),
            "change" => Some(AnaState::Change),
            _ => None,
        }
    }

    /// Whether I/O may be routed over the path
    pub fn is_usable(&self) -> bool {
        matches!(self, AnaState::Optimized | AnaState::NonOptimized)
    }
}

impl std::fmt::Display for AnaState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AnaState::Optimized => write!(f, "optimized"),
            AnaState::NonOptimized => write!(f, "non-optimized"),
            AnaState::Inaccessible => write!(f, "inaccessible"),
            AnaState::PersistentLoss => write!(f, "persistent-loss"),
            AnaState::Change => write!(f, "change"),
        }
    }
}

/// How a controller entered the tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControllerOrigin {
    /// Observed by a rescan
    Scanned,
    /// Created by an explicit Connect
    Connected,
    /// Declared in the persisted configuration
    Config,
}

// =============================================================================
// Entities
// =============================================================================

/// A host identity
#[derive(Debug, Clone, Serialize)]
pub struct Host {
    pub key: HostKey,
    pub hostnqn: String,
    pub hostid: Uuid,
    pub subsystems: Vec<SubsystemKey>,
}

/// An NVM or discovery subsystem
#[derive(Debug, Clone, Serialize)]
pub struct Subsystem {
    pub key: SubsystemKey,
    pub host: HostKey,
    pub subnqn: String,
    pub subtype: SubsystemType,
    pub model: Option<String>,
    pub serial: Option<String>,
    pub firmware: Option<String>,
    pub controllers: Vec<ControllerKey>,
    pub namespaces: Vec<NamespaceKey>,
}

/// A controller of a subsystem
#[derive(Debug, Clone, Serialize)]
pub struct Controller {
    pub key: ControllerKey,
    pub subsystem: SubsystemKey,
    /// Kernel instance name (nvme0), once assigned
    pub name: Option<String>,
    pub address: ControllerAddress,
    pub cntlid: Option<u16>,
    pub state: ControllerState,
    pub origin: ControllerOrigin,
    /// Gateway handle held open for the controller
    #[serde(skip)]
    pub handle: Option<TargetHandle>,
}

impl Controller {
    /// Name used in logs and events
    pub fn label(&self) -> String {
        self.name.clone().unwrap_or_else(|| self.address.to_string())
    }
}

/// A namespace of a subsystem, shared by every controller with a path to it
#[derive(Debug, Clone, Serialize)]
pub struct Namespace {
    pub key: NamespaceKey,
    pub subsystem: SubsystemKey,
    pub nsid: u32,
    /// Block device name (nvme0n1), once known
    pub name: Option<String>,
    /// Size in logical blocks
    pub size_blocks: u64,
    pub block_size: u32,
    pub ana_group_id: Option<u32>,
    #[serde(skip)]
    pub(crate) in_use: Arc<AtomicUsize>,
}

impl Namespace {
    pub fn capacity_bytes(&self) -> u64 {
        self.size_blocks.saturating_mul(self.block_size as u64)
    }

    /// Number of caller-held handles
    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Acquire)
    }

    pub fn is_busy(&self) -> bool {
        self.in_use() > 0
    }
}

/// Edge between a controller and a namespace
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Path {
    pub controller: ControllerKey,
    pub namespace: NamespaceKey,
    pub ana_state: AnaState,
    /// Per-path device name (nvme0c1n1), once known
    pub name: Option<String>,
}

// =============================================================================
// Attach Spec
// =============================================================================

/// Description of a controller to attach
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerSpec {
    pub address: ControllerAddress,
    pub name: Option<String>,
    pub cntlid: Option<u16>,
    pub state: ControllerState,
    pub origin: ControllerOrigin,
    pub handle: Option<TargetHandle>,
}

impl ControllerSpec {
    pub fn new(address: ControllerAddress, origin: ControllerOrigin) -> Self {
        Self {
            address,
            name: None,
            cntlid: None,
            state: match origin {
                ControllerOrigin::Config => ControllerState::Disconnected,
                ControllerOrigin::Scanned | ControllerOrigin::Connected => ControllerState::Connected,
            },
            origin,
            handle: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_cntlid(mut self, cntlid: u16) -> Self {
        self.cntlid = Some(cntlid);
        self
    }

    pub fn with_state(mut self, state: ControllerState) -> Self {
        self.state = state;
        self
    }

    pub fn with_handle(mut self, handle: TargetHandle) -> Self {
        self.handle = Some(handle);
        self
    }
}

// =============================================================================
// Namespace Handle
// =============================================================================

/// A caller-held reference marking a namespace in use
///
/// While any handle is alive, detaching the last controller with a path to
/// the namespace fails with `DetachError::Busy` unless forced.
#[derive(Debug)]
pub struct NamespaceHandle {
    subnqn: String,
    nsid: u32,
    key: NamespaceKey,
    counter: Arc<AtomicUsize>,
}

impl NamespaceHandle {
    pub(crate) fn acquire(subnqn: &str, namespace: &Namespace) -> Self {
        namespace.in_use.fetch_add(1, Ordering::AcqRel);
        Self {
            subnqn: subnqn.to_string(),
            nsid: namespace.nsid,
            key: namespace.key,
            counter: Arc::clone(&namespace.in_use),
        }
    }

    pub fn subnqn(&self) -> &str {
        &self.subnqn
    }

    pub fn nsid(&self) -> u32 {
        self.nsid
    }

    pub fn key(&self) -> NamespaceKey {
        self.key
    }
}

impl Drop for NamespaceHandle {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::TransportType;

    fn namespace() -> Namespace {
        Namespace {
            key: NamespaceKey(1),
            subsystem: SubsystemKey(1),
            nsid: 1,
            name: None,
            size_blocks: 1024,
            block_size: 4096,
            ana_group_id: None,
            in_use: Arc::new(AtomicUsize::new(0)),
        }
    }

    #[test]
    fn test_controller_state_from_sysfs() {
        assert_eq!(ControllerState::from_sysfs("live\n"), ControllerState::Connected);
        assert_eq!(ControllerState::from_sysfs("connecting"), ControllerState::Connecting);
        assert_eq!(ControllerState::from_sysfs("resetting"), ControllerState::Resetting);
        assert_eq!(ControllerState::from_sysfs("dead"), ControllerState::Failed);
    }

    #[test]
    fn test_ana_state_from_sysfs() {
        assert_eq!(AnaState::from_sysfs("non-optimized\n"), Some(AnaState::NonOptimized));
        assert_eq!(AnaState::from_sysfs("bogus"), None);
        assert!(AnaState::Optimized.is_usable());
        assert!(!AnaState::Inaccessible.is_usable());
    }

    #[test]
    fn test_namespace_handle_counts() {
        let ns = namespace();
        assert!(!ns.is_busy());
        let first = NamespaceHandle::acquire("nqn.test-1", &ns);
        let second = NamespaceHandle::acquire("nqn.test-1", &ns);
        assert_eq!(ns.in_use(), 2);
        assert_eq!(first.nsid(), 1);
        drop(first);
        assert_eq!(ns.in_use(), 1);
        drop(second);
        assert!(!ns.is_busy());
        assert_eq!(ns.capacity_bytes(), 4 * 1024 * 1024);
    }

    #[test]
    fn test_controller_spec_defaults() {
        let addr = ControllerAddress::new(TransportType::Tcp, "10.0.0.1").with_trsvcid("4420");
        let spec = ControllerSpec::new(addr.clone(), ControllerOrigin::Config);
        assert_eq!(spec.state, ControllerState::Disconnected);
        let spec = ControllerSpec::new(addr, ControllerOrigin::Connected).with_cntlid(3);
        assert_eq!(spec.state, ControllerState::Connected);
        assert_eq!(spec.cntlid, Some(3));
    }
}
