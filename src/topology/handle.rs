//! Shared Topology Handle
//!
//! One tree-wide `RwLock` gives single-writer, multi-reader access. Events
//! recorded by a mutation are broadcast after the write lock is released.

use super::entities::{
    Controller, ControllerKey, ControllerSpec, HostKey, NamespaceHandle, Subsystem, SubsystemKey,
};
use super::events::TopologyEvent;
use super::rescan::{reconcile, RescanReport};
use super::snapshot::{TopologySnapshot, TopologyView};
use super::tree::{DetachReport, TopologyTree};
use crate::domain::ports::TopologySource;
use crate::domain::ControllerAddress;
use crate::error::{AttachError, ConfigError, DetachError, Result};
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

/// Capacity of the topology event channel
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Cloneable handle to the shared topology tree
#[derive(Clone)]
pub struct Topology {
    tree: Arc<RwLock<TopologyTree>>,
    event_sender: broadcast::Sender<TopologyEvent>,
}

impl std::fmt::Debug for Topology {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Topology")
            .field("subscribers", &self.event_sender.receiver_count())
            .finish()
    }
}

impl Default for Topology {
    fn default() -> Self {
        Self::new()
    }
}

impl Topology {
    pub fn new() -> Self {
        let (event_sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            tree: Arc::new(RwLock::new(TopologyTree::new())),
            event_sender,
        }
    }

    /// Get an event receiver
    pub fn subscribe(&self) -> broadcast::Receiver<TopologyEvent> {
        self.event_sender.subscribe()
    }

    /// Run a closure under the read lock
    pub fn read<R>(&self, f: impl FnOnce(&TopologyTree) -> R) -> R {
        let tree = self.tree.read();
        f(&tree)
    }

    /// Run a closure under the write lock, then publish its events
    pub fn write<R>(&self, f: impl FnOnce(&mut TopologyTree) -> R) -> R {
        let (result, events) = {
            let mut tree = self.tree.write();
            let result = f(&mut *tree);
            (result, tree.take_events())
        };
        for event in events {
            // No subscribers is fine
            let _ = self.event_sender.send(event);
        }
        result
    }

    /// Reconcile one host's subsystems with the live system
    ///
    /// The source is scanned before the lock is taken.
    pub fn rescan(&self, host: HostKey, source: &dyn TopologySource) -> Result<RescanReport> {
        let snapshot = source.scan()?;
        debug!(subsystems = snapshot.subsystems.len(), "Applying topology scan");
        Ok(self.write(|tree| reconcile(tree, host, &snapshot)))
    }

    /// Copy the tree for persistence
    pub fn snapshot(&self) -> TopologySnapshot {
        self.read(TopologyTree::snapshot)
    }

    /// Replace the tree with a persisted document, leaving it empty on error
    pub fn replace(&self, snapshot: &TopologySnapshot) -> std::result::Result<(), ConfigError> {
        self.write(|tree| tree.replace(snapshot))
    }

    pub fn view(&self) -> TopologyView {
        self.read(TopologyTree::view)
    }

    pub fn find_subsystem(&self, subnqn: &str) -> Option<Subsystem> {
        self.read(|tree| tree.find_subsystem(subnqn).cloned())
    }

    pub fn find_controller(&self, address: &ControllerAddress) -> Option<Controller> {
        self.read(|tree| tree.find_controller(address).cloned())
    }

    pub fn attach_controller(
        &self,
        subsystem: SubsystemKey,
        spec: ControllerSpec,
    ) -> std::result::Result<Controller, AttachError> {
        self.write(|tree| tree.attach_controller(subsystem, spec).cloned())
    }

    pub fn detach_controller(
        &self,
        controller: ControllerKey,
        force: bool,
    ) -> std::result::Result<DetachReport, DetachError> {
        self.write(|tree| tree.detach_controller(controller, force))
    }

    /// Take an in-use reference on a namespace
    pub fn open_namespace(&self, subnqn: &str, nsid: u32) -> Option<NamespaceHandle> {
        self.read(|tree| tree.open_namespace(subnqn, nsid))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{SubsystemType, TransportType};
    use crate::error::Error;
    use crate::topology::entities::ControllerOrigin;
    use crate::topology::rescan::{ScannedController, ScannedSubsystem, StaticSource, SystemSnapshot};
    use crate::topology::ControllerState;
    use assert_matches::assert_matches;
    use uuid::Uuid;

    struct FailingSource;

    impl TopologySource for FailingSource {
        fn scan(&self) -> Result<SystemSnapshot> {
            Err(Error::Scan("sysfs unavailable".into()))
        }
    }

    fn address(traddr: &str) -> ControllerAddress {
        ControllerAddress::new(TransportType::Tcp, traddr).with_trsvcid("4420")
    }

    #[test]
    fn test_events_published_after_write() {
        let topology = Topology::new();
        let mut rx = topology.subscribe();

        let sub = topology.write(|tree| {
            let host = tree.add_host("nqn.host", Uuid::nil());
            tree.ensure_subsystem(host, "nqn.test-1", SubsystemType::Nvm)
        });
        let sub = sub.unwrap();
        topology
            .attach_controller(sub, ControllerSpec::new(address("10.0.0.1"), ControllerOrigin::Connected))
            .unwrap();

        assert_matches!(rx.try_recv().unwrap(), TopologyEvent::HostAdded { .. });
        assert_matches!(rx.try_recv().unwrap(), TopologyEvent::SubsystemAdded { .. });
        assert_matches!(
            rx.try_recv().unwrap(),
            TopologyEvent::ControllerAttached { ref subnqn, .. } if subnqn == "nqn.test-1"
        );
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_rescan_from_static_source() {
        let topology = Topology::new();
        let host = topology.write(|tree| tree.add_host("nqn.host", Uuid::nil()));

        let mut sub = ScannedSubsystem::new("nqn.test-1");
        sub.controllers.push(ScannedController {
            name: "nvme0".into(),
            address: address("10.0.0.1"),
            cntlid: Some(1),
            state: ControllerState::Connected,
        });
        let source = StaticSource::new(SystemSnapshot {
            subsystems: vec![sub],
        });

        let report = topology.rescan(host, &source).unwrap();
        assert_eq!(report.added, 2);
        assert!(topology.find_controller(&address("10.0.0.1")).is_some());
        assert!(topology.rescan(host, &source).unwrap().is_unchanged());
    }

    #[test]
    fn test_rescan_source_error_leaves_tree() {
        let topology = Topology::new();
        let host = topology.write(|tree| tree.add_host("nqn.host", Uuid::nil()));
        assert_matches!(topology.rescan(host, &FailingSource), Err(Error::Scan(_)));
        assert!(topology.read(|tree| !tree.is_empty()));
    }

    #[test]
    fn test_concurrent_readers() {
        let topology = Topology::new();
        let sub = topology
            .write(|tree| {
                let host = tree.add_host("nqn.host", Uuid::nil());
                tree.ensure_subsystem(host, "nqn.test-1", SubsystemType::Nvm)
            })
            .unwrap();

        std::thread::scope(|s| {
            for i in 0..4 {
                let topology = topology.clone();
                s.spawn(move || {
                    let traddr = format!("10.0.1.{}", i);
                    topology
                        .attach_controller(
                            sub,
                            ControllerSpec::new(address(&traddr), ControllerOrigin::Connected),
                        )
                        .unwrap();
                    for _ in 0..100 {
                        assert!(topology.find_subsystem("nqn.test-1").is_some());
                    }
                });
            }
        });

        assert_eq!(topology.read(|tree| tree.controllers_of(sub).count()), 4);
        topology.read(|tree| tree.check_invariants()).unwrap();
    }
}
