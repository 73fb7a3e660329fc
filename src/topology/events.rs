//! Topology Events
//!
//! Events emitted by the topology tree for external consumers to react to
//! entity lifecycle changes.

use super::entities::{AnaState, ControllerState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Events emitted by the topology tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TopologyEvent {
    /// A host was added
    HostAdded { hostnqn: String },

    /// A host and everything below it was released
    HostRemoved { hostnqn: String },

    /// A subsystem appeared under a host
    SubsystemAdded { hostnqn: String, subnqn: String },

    /// A subsystem was released
    SubsystemRemoved { hostnqn: String, subnqn: String },

    /// A controller was attached to a subsystem
    ControllerAttached {
        subnqn: String,
        controller: String,
        address: String,
    },

    /// A controller was detached from a subsystem
    ControllerDetached { subnqn: String, controller: String },

    /// A controller's connection state changed
    ControllerStateChanged {
        subnqn: String,
        controller: String,
        from: ControllerState,
        to: ControllerState,
    },

    /// A namespace became reachable
    NamespaceAdded {
        subnqn: String,
        nsid: u32,
        capacity_bytes: u64,
    },

    /// A namespace was removed
    NamespaceRemoved { subnqn: String, nsid: u32 },

    /// The ANA state of a path changed
    PathStateChanged {
        subnqn: String,
        controller: String,
        nsid: u32,
        ana_state: AnaState,
    },

    /// A rescan finished
    RescanCompleted {
        added: u32,
        updated: u32,
        removed: u32,
        failed: u32,
        at: DateTime<Utc>,
    },
}

impl TopologyEvent {
    /// Subsystem NQN the event concerns, if any
    pub fn subnqn(&self) -> Option<&str> {
        match self {
            TopologyEvent::SubsystemAdded { subnqn, .. }
            | TopologyEvent::SubsystemRemoved { subnqn, .. }
            | TopologyEvent::ControllerAttached { subnqn, .. }
            | TopologyEvent::ControllerDetached { subnqn, .. }
            | TopologyEvent::ControllerStateChanged { subnqn, .. }
            | TopologyEvent::NamespaceAdded { subnqn, .. }
            | TopologyEvent::NamespaceRemoved { subnqn, .. }
            | TopologyEvent::PathStateChanged { subnqn, .. } => Some(subnqn),
            TopologyEvent::HostAdded { .. }
            | TopologyEvent::HostRemoved { .. }
            | TopologyEvent::RescanCompleted { .. } => None,
        }
    }

    /// Check if this is a controller-level event
    pub fn is_controller_event(&self) -> bool {
        matches!(
            self,
            TopologyEvent::ControllerAttached { .. }
                | TopologyEvent::ControllerDetached { .. }
                | TopologyEvent::ControllerStateChanged { .. }
        )
    }

    /// Check if this is a namespace-level event
    pub fn is_namespace_event(&self) -> bool {
        matches!(
            self,
            TopologyEvent::NamespaceAdded { .. }
                | TopologyEvent::NamespaceRemoved { .. }
                | TopologyEvent::PathStateChanged { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_subnqn() {
        let event = TopologyEvent::ControllerAttached {
            subnqn: "nqn.test-1".to_string(),
            controller: "nvme0".to_string(),
            address: "tcp traddr=10.0.0.1,trsvcid=4420".to_string(),
        };
        assert_eq!(event.subnqn(), Some("nqn.test-1"));
        assert!(event.is_controller_event());
        assert!(!event.is_namespace_event());
    }

    #[test]
    fn test_event_namespace() {
        let event = TopologyEvent::NamespaceRemoved {
            subnqn: "nqn.test-1".to_string(),
            nsid: 1,
        };
        assert!(event.is_namespace_event());

        let event = TopologyEvent::HostAdded {
            hostnqn: "nqn.host".to_string(),
        };
        assert_eq!(event.subnqn(), None);
    }
}
