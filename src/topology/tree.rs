//! Topology Tree
//!
//! Arena of hosts, subsystems, controllers and namespaces keyed by stable
//! copyable keys, with controller/namespace paths stored as key pairs.
//! The tree itself is not synchronized; `Topology` wraps it in a lock.

use super::entities::{
    AnaState, Controller, ControllerKey, ControllerOrigin, ControllerSpec, ControllerState, Host,
    HostKey, Namespace, NamespaceHandle, NamespaceKey, Path, Subsystem, SubsystemKey,
};
use super::events::TopologyEvent;
use crate::domain::{ControllerAddress, SubsystemType, TargetHandle};
use crate::error::{AttachError, DetachError};
use indexmap::IndexMap;
use serde::Serialize;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Outcome of a successful detach
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DetachReport {
    pub controller: String,
    pub subnqn: String,
    /// Namespaces removed with the controller or its released subsystem
    pub removed_namespaces: Vec<u32>,
    /// Whether the subsystem was released because no controller remained
    pub subsystem_removed: bool,
}

struct DetachPlan {
    label: String,
    subsystem: SubsystemKey,
    subnqn: String,
    doomed: Vec<NamespaceKey>,
    last_controller: bool,
}

/// Result of a path update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathChange {
    Added,
    Updated,
    Unchanged,
}

/// Entity graph of the host's NVMe topology
#[derive(Debug, Default)]
pub struct TopologyTree {
    next_key: u64,
    pub(super) hosts: IndexMap<HostKey, Host>,
    pub(super) subsystems: IndexMap<SubsystemKey, Subsystem>,
    pub(super) controllers: IndexMap<ControllerKey, Controller>,
    pub(super) namespaces: IndexMap<NamespaceKey, Namespace>,
    pub(super) paths: IndexMap<(ControllerKey, NamespaceKey), Path>,
    pending_events: Vec<TopologyEvent>,
}

impl TopologyTree {
    pub fn new() -> Self {
        Self::default()
    }

    fn allocate_key(&mut self) -> u64 {
        self.next_key += 1;
        self.next_key
    }

    pub(super) fn emit(&mut self, event: TopologyEvent) {
        self.pending_events.push(event);
    }

    /// Drain events recorded by mutations since the last call
    pub(crate) fn take_events(&mut self) -> Vec<TopologyEvent> {
        std::mem::take(&mut self.pending_events)
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    /// Release every entity
    pub fn clear(&mut self) {
        let hosts: Vec<HostKey> = self.hosts.keys().copied().collect();
        for host in hosts {
            self.remove_host(host);
        }
    }

    // =========================================================================
    // Hosts
    // =========================================================================

    pub fn hosts(&self) -> impl Iterator<Item = &Host> {
        self.hosts.values()
    }

    pub fn host(&self, key: HostKey) -> Option<&Host> {
        self.hosts.get(&key)
    }

    pub fn find_host(&self, hostnqn: &str) -> Option<&Host> {
        self.hosts.values().find(|h| h.hostnqn == hostnqn)
    }

    /// Add a host, or return the existing one with the same NQN
    pub fn add_host(&mut self, hostnqn: &str, hostid: Uuid) -> HostKey {
        if let Some(host) = self.find_host(hostnqn) {
            return host.key;
        }
        let key = HostKey(self.allocate_key());
        self.hosts.insert(
            key,
            Host {
                key,
                hostnqn: hostnqn.to_string(),
                hostid,
                subsystems: Vec::new(),
            },
        );
        self.emit(TopologyEvent::HostAdded {
            hostnqn: hostnqn.to_string(),
        });
        key
    }

    /// Release a host and everything below it
    pub fn remove_host(&mut self, key: HostKey) -> bool {
        let Some(host) = self.hosts.get(&key) else {
            return false;
        };
        let subsystems = host.subsystems.clone();
        for subsystem in subsystems {
            self.remove_subsystem(subsystem);
        }
        if let Some(host) = self.hosts.shift_remove(&key) {
            self.emit(TopologyEvent::HostRemoved {
                hostnqn: host.hostnqn,
            });
        }
        true
    }

    // =========================================================================
    // Subsystems
    // =========================================================================

    pub fn subsystems(&self) -> impl Iterator<Item = &Subsystem> {
        self.subsystems.values()
    }

    pub fn subsystem(&self, key: SubsystemKey) -> Option<&Subsystem> {
        self.subsystems.get(&key)
    }

    /// Find a subsystem by NQN under any host
    pub fn find_subsystem(&self, subnqn: &str) -> Option<&Subsystem> {
        self.subsystems.values().find(|s| s.subnqn == subnqn)
    }

    /// Find a subsystem by NQN under one host
    pub fn find_subsystem_in(&self, host: HostKey, subnqn: &str) -> Option<&Subsystem> {
        self.hosts
            .get(&host)?
            .subsystems
            .iter()
            .filter_map(|k| self.subsystems.get(k))
            .find(|s| s.subnqn == subnqn)
    }

    /// Return the subsystem with `subnqn` under `host`, creating it if needed
    pub fn ensure_subsystem(
        &mut self,
        host: HostKey,
        subnqn: &str,
        subtype: SubsystemType,
    ) -> Result<SubsystemKey, AttachError> {
        if let Some(subsystem) = self.find_subsystem_in(host, subnqn) {
            return Ok(subsystem.key);
        }
        let hostnqn = match self.hosts.get(&host) {
            Some(h) => h.hostnqn.clone(),
            None => {
                return Err(AttachError::HostNotFound {
                    hostnqn: host.to_string(),
                })
            }
        };

        let key = SubsystemKey(self.allocate_key());
        self.subsystems.insert(
            key,
            Subsystem {
                key,
                host,
                subnqn: subnqn.to_string(),
                subtype,
                model: None,
                serial: None,
                firmware: None,
                controllers: Vec::new(),
                namespaces: Vec::new(),
            },
        );
        if let Some(h) = self.hosts.get_mut(&host) {
            h.subsystems.push(key);
        }
        self.emit(TopologyEvent::SubsystemAdded {
            hostnqn,
            subnqn: subnqn.to_string(),
        });
        Ok(key)
    }

    /// Release a subsystem with its controllers and namespaces
    pub fn remove_subsystem(&mut self, key: SubsystemKey) -> bool {
        let Some(subsystem) = self.subsystems.get(&key) else {
            return false;
        };
        let controllers = subsystem.controllers.clone();
        let namespaces = subsystem.namespaces.clone();

        for controller in controllers {
            self.remove_controller_entity(controller);
        }
        for namespace in namespaces {
            self.remove_namespace(namespace);
        }

        if let Some(subsystem) = self.subsystems.shift_remove(&key) {
            let hostnqn = match self.hosts.get_mut(&subsystem.host) {
                Some(host) => {
                    host.subsystems.retain(|k| *k != key);
                    host.hostnqn.clone()
                }
                None => String::new(),
            };
            self.emit(TopologyEvent::SubsystemRemoved {
                hostnqn,
                subnqn: subsystem.subnqn,
            });
        }
        true
    }

    // =========================================================================
    // Controllers
    // =========================================================================

    pub fn controllers(&self) -> impl Iterator<Item = &Controller> {
        self.controllers.values()
    }

    pub fn controller(&self, key: ControllerKey) -> Option<&Controller> {
        self.controllers.get(&key)
    }

    pub fn controllers_of(&self, subsystem: SubsystemKey) -> impl Iterator<Item = &Controller> {
        self.subsystems
            .get(&subsystem)
            .map(|s| s.controllers.as_slice())
            .unwrap_or(&[])
            .iter()
            .filter_map(|k| self.controllers.get(k))
    }

    /// Find a controller by its address tuple
    pub fn find_controller(&self, address: &ControllerAddress) -> Option<&Controller> {
        self.controllers.values().find(|c| &c.address == address)
    }

    /// Find a controller by its kernel instance name
    pub fn find_controller_by_name(&self, name: &str) -> Option<&Controller> {
        self.controllers
            .values()
            .find(|c| c.name.as_deref() == Some(name))
    }

    /// Attach a controller to a subsystem
    ///
    /// Refuses a second controller with the same address in one subsystem.
    pub fn attach_controller(
        &mut self,
        subsystem: SubsystemKey,
        spec: ControllerSpec,
    ) -> Result<&Controller, AttachError> {
        let sub = self
            .subsystems
            .get(&subsystem)
            .ok_or_else(|| AttachError::SubsystemNotFound {
                subnqn: subsystem.to_string(),
            })?;
        let subnqn = sub.subnqn.clone();

        if self.controllers_of(subsystem).any(|c| c.address == spec.address) {
            return Err(AttachError::Duplicate {
                subnqn,
                address: spec.address.to_string(),
            });
        }
        if let Some(name) = &spec.name {
            if self.find_controller_by_name(name).is_some() {
                return Err(AttachError::NameInUse { name: name.clone() });
            }
        }

        let key = ControllerKey(self.allocate_key());
        let controller = Controller {
            key,
            subsystem,
            name: spec.name,
            address: spec.address,
            cntlid: spec.cntlid,
            state: spec.state,
            origin: spec.origin,
            handle: spec.handle,
        };
        debug!(%subnqn, controller = %controller.label(), "Attaching controller");

        if let Some(sub) = self.subsystems.get_mut(&subsystem) {
            sub.controllers.push(key);
        }
        self.emit(TopologyEvent::ControllerAttached {
            subnqn,
            controller: controller.label(),
            address: controller.address.to_string(),
        });
        let controller: &Controller = self.controllers.entry(key).or_insert(controller);
        Ok(controller)
    }

    /// Detach a controller
    ///
    /// Namespaces whose last path was this controller are removed with it.
    /// When this is the subsystem's last controller the subsystem is
    /// released together with every namespace it still holds. If any
    /// namespace that would be removed is held by a `NamespaceHandle` the
    /// detach is refused unless `force` is set.
    pub fn detach_controller(
        &mut self,
        key: ControllerKey,
        force: bool,
    ) -> Result<DetachReport, DetachError> {
        let plan = self.plan_detach(key, force)?;

        self.remove_controller_entity(key);
        let mut removed_namespaces = Vec::new();
        for namespace in plan.doomed {
            if let Some(nsid) = self.remove_namespace(namespace) {
                removed_namespaces.push(nsid);
            }
        }

        let subsystem_removed = plan.last_controller && self.remove_subsystem(plan.subsystem);

        Ok(DetachReport {
            controller: plan.label,
            subnqn: plan.subnqn,
            removed_namespaces,
            subsystem_removed,
        })
    }

    /// Check whether a controller could be detached without mutating the tree
    pub fn check_detach(&self, key: ControllerKey, force: bool) -> Result<(), DetachError> {
        self.plan_detach(key, force).map(|_| ())
    }

    fn plan_detach(&self, key: ControllerKey, force: bool) -> Result<DetachPlan, DetachError> {
        let controller = self
            .controllers
            .get(&key)
            .ok_or_else(|| DetachError::NotFound {
                controller: key.to_string(),
            })?;
        let label = controller.label();
        let subsystem = controller.subsystem;
        let (subnqn, last_controller) = match self.subsystems.get(&subsystem) {
            Some(s) => (s.subnqn.clone(), s.controllers.iter().all(|c| *c == key)),
            None => (String::new(), false),
        };

        let mut doomed = self.sole_path_namespaces(key);
        if last_controller {
            for ns in self.namespaces_of(subsystem) {
                if !doomed.contains(&ns.key) {
                    doomed.push(ns.key);
                }
            }
        }

        if let Some(busy) = doomed
            .iter()
            .filter_map(|n| self.namespaces.get(n))
            .find(|ns| ns.is_busy())
        {
            if !force {
                return Err(DetachError::Busy {
                    controller: label,
                    subnqn,
                    nsid: busy.nsid,
                });
            }
            warn!(controller = %label, %subnqn, nsid = busy.nsid, "Forcing detach of in-use namespace");
        }

        Ok(DetachPlan {
            label,
            subsystem,
            subnqn,
            doomed,
            last_controller,
        })
    }

    /// Namespaces reachable only through `controller`
    pub fn sole_path_namespaces(&self, controller: ControllerKey) -> Vec<NamespaceKey> {
        self.paths
            .keys()
            .filter(|(c, _)| *c == controller)
            .map(|(_, n)| *n)
            .filter(|n| self.path_count(*n) == 1)
            .collect()
    }

    /// Update a controller's state, returning whether it changed
    pub fn set_controller_state(&mut self, key: ControllerKey, state: ControllerState) -> bool {
        let Some(controller) = self.controllers.get_mut(&key) else {
            return false;
        };
        if controller.state == state {
            return false;
        }
        let from = controller.state;
        controller.state = state;
        let label = controller.label();
        let subsystem = controller.subsystem;
        let subnqn = self
            .subsystems
            .get(&subsystem)
            .map(|s| s.subnqn.clone())
            .unwrap_or_default();
        self.emit(TopologyEvent::ControllerStateChanged {
            subnqn,
            controller: label,
            from,
            to: state,
        });
        true
    }

    pub fn set_controller_handle(&mut self, key: ControllerKey, handle: Option<TargetHandle>) {
        if let Some(controller) = self.controllers.get_mut(&key) {
            controller.handle = handle;
        }
    }

    /// Bind a live connection to a controller restored from configuration
    pub fn bind_controller(
        &mut self,
        key: ControllerKey,
        name: Option<String>,
        cntlid: u16,
        handle: TargetHandle,
    ) -> Result<&Controller, AttachError> {
        if !self.controllers.contains_key(&key) {
            return Err(AttachError::ControllerNotFound {
                controller: key.to_string(),
            });
        }
        if let Some(name) = &name {
            if self.find_controller_by_name(name).is_some_and(|c| c.key != key) {
                return Err(AttachError::NameInUse { name: name.clone() });
            }
        }
        if let Some(controller) = self.controllers.get_mut(&key) {
            if name.is_some() {
                controller.name = name;
            }
            controller.cntlid = Some(cntlid);
            controller.handle = Some(handle);
            controller.origin = ControllerOrigin::Connected;
        }
        self.set_controller_state(key, ControllerState::Connected);
        self.controllers
            .get(&key)
            .ok_or_else(|| AttachError::ControllerNotFound {
                controller: key.to_string(),
            })
    }

    /// Remove a controller and its paths without touching namespaces
    pub(super) fn remove_controller_entity(&mut self, key: ControllerKey) {
        self.paths.retain(|(c, _), _| *c != key);
        let Some(controller) = self.controllers.shift_remove(&key) else {
            return;
        };
        let subnqn = match self.subsystems.get_mut(&controller.subsystem) {
            Some(sub) => {
                sub.controllers.retain(|k| *k != key);
                sub.subnqn.clone()
            }
            None => String::new(),
        };
        self.emit(TopologyEvent::ControllerDetached {
            subnqn,
            controller: controller.label(),
        });
    }

    // =========================================================================
    // Namespaces
    // =========================================================================

    pub fn namespaces(&self) -> impl Iterator<Item = &Namespace> {
        self.namespaces.values()
    }

    pub fn namespace(&self, key: NamespaceKey) -> Option<&Namespace> {
        self.namespaces.get(&key)
    }

    pub fn namespaces_of(&self, subsystem: SubsystemKey) -> impl Iterator<Item = &Namespace> {
        self.subsystems
            .get(&subsystem)
            .map(|s| s.namespaces.as_slice())
            .unwrap_or(&[])
            .iter()
            .filter_map(|k| self.namespaces.get(k))
    }

    pub fn find_namespace(&self, subsystem: SubsystemKey, nsid: u32) -> Option<&Namespace> {
        self.namespaces_of(subsystem).find(|ns| ns.nsid == nsid)
    }

    /// Return the namespace `nsid` of a subsystem, creating it if needed
    pub fn ensure_namespace(&mut self, subsystem: SubsystemKey, nsid: u32) -> Option<NamespaceKey> {
        if let Some(ns) = self.find_namespace(subsystem, nsid) {
            return Some(ns.key);
        }
        let subnqn = self.subsystems.get(&subsystem)?.subnqn.clone();
        let key = NamespaceKey(self.allocate_key());
        self.namespaces.insert(
            key,
            Namespace {
                key,
                subsystem,
                nsid,
                name: None,
                size_blocks: 0,
                block_size: 0,
                ana_group_id: None,
                in_use: Arc::new(AtomicUsize::new(0)),
            },
        );
        if let Some(sub) = self.subsystems.get_mut(&subsystem) {
            sub.namespaces.push(key);
        }
        self.emit(TopologyEvent::NamespaceAdded {
            subnqn,
            nsid,
            capacity_bytes: 0,
        });
        Some(key)
    }

    /// Update the format attributes of a namespace, returning whether any changed
    pub fn update_namespace(
        &mut self,
        key: NamespaceKey,
        size_blocks: u64,
        block_size: u32,
        ana_group_id: Option<u32>,
    ) -> bool {
        let Some(ns) = self.namespaces.get_mut(&key) else {
            return false;
        };
        let changed = ns.size_blocks != size_blocks
            || ns.block_size != block_size
            || ns.ana_group_id != ana_group_id;
        ns.size_blocks = size_blocks;
        ns.block_size = block_size;
        ns.ana_group_id = ana_group_id;
        changed
    }

    pub(super) fn set_namespace_name(&mut self, key: NamespaceKey, name: Option<String>) -> bool {
        match self.namespaces.get_mut(&key) {
            Some(ns) if ns.name != name => {
                ns.name = name;
                true
            }
            _ => false,
        }
    }

    /// Remove a namespace and every path to it, returning its NSID
    pub(super) fn remove_namespace(&mut self, key: NamespaceKey) -> Option<u32> {
        self.paths.retain(|(_, n), _| *n != key);
        let ns = self.namespaces.shift_remove(&key)?;
        let subnqn = match self.subsystems.get_mut(&ns.subsystem) {
            Some(sub) => {
                sub.namespaces.retain(|k| *k != key);
                sub.subnqn.clone()
            }
            None => String::new(),
        };
        if ns.is_busy() {
            warn!(%subnqn, nsid = ns.nsid, "Removing namespace with outstanding handles");
        }
        self.emit(TopologyEvent::NamespaceRemoved {
            subnqn,
            nsid: ns.nsid,
        });
        Some(ns.nsid)
    }

    /// Take an in-use reference on a namespace
    pub fn open_namespace(&self, subnqn: &str, nsid: u32) -> Option<NamespaceHandle> {
        let subsystem = self.find_subsystem(subnqn)?;
        let ns = self.find_namespace(subsystem.key, nsid)?;
        Some(NamespaceHandle::acquire(subnqn, ns))
    }

    // =========================================================================
    // Paths
    // =========================================================================

    pub fn paths(&self) -> impl Iterator<Item = &Path> {
        self.paths.values()
    }

    pub fn path(&self, controller: ControllerKey, namespace: NamespaceKey) -> Option<&Path> {
        self.paths.get(&(controller, namespace))
    }

    pub fn paths_of_controller(&self, controller: ControllerKey) -> impl Iterator<Item = &Path> {
        self.paths.values().filter(move |p| p.controller == controller)
    }

    pub fn paths_of_namespace(&self, namespace: NamespaceKey) -> impl Iterator<Item = &Path> {
        self.paths.values().filter(move |p| p.namespace == namespace)
    }

    pub fn path_count(&self, namespace: NamespaceKey) -> usize {
        self.paths_of_namespace(namespace).count()
    }

    /// Create or update the path between a controller and a namespace
    ///
    /// Both must belong to the same subsystem.
    pub fn set_path(
        &mut self,
        controller: ControllerKey,
        namespace: NamespaceKey,
        ana_state: AnaState,
        name: Option<String>,
    ) -> Option<PathChange> {
        let ctrl = self.controllers.get(&controller)?;
        let ns = self.namespaces.get(&namespace)?;
        if ctrl.subsystem != ns.subsystem {
            return None;
        }
        let label = ctrl.label();
        let nsid = ns.nsid;
        let subsystem = ns.subsystem;

        let change = match self.paths.get_mut(&(controller, namespace)) {
            Some(path) if path.ana_state == ana_state && path.name == name => PathChange::Unchanged,
            Some(path) => {
                path.ana_state = ana_state;
                path.name = name;
                PathChange::Updated
            }
            None => {
                self.paths.insert(
                    (controller, namespace),
                    Path {
                        controller,
                        namespace,
                        ana_state,
                        name,
                    },
                );
                PathChange::Added
            }
        };

        if change != PathChange::Unchanged {
            let subnqn = self
                .subsystems
                .get(&subsystem)
                .map(|s| s.subnqn.clone())
                .unwrap_or_default();
            self.emit(TopologyEvent::PathStateChanged {
                subnqn,
                controller: label,
                nsid,
                ana_state,
            });
        }
        Some(change)
    }

    pub(super) fn remove_path(&mut self, controller: ControllerKey, namespace: NamespaceKey) -> bool {
        self.paths.shift_remove(&(controller, namespace)).is_some()
    }

    // =========================================================================
    // Invariants
    // =========================================================================

    /// Check the structural invariants of the tree
    pub fn check_invariants(&self) -> Result<(), String> {
        for host in self.hosts.values() {
            let mut seen = std::collections::HashSet::new();
            for key in &host.subsystems {
                let sub = self
                    .subsystems
                    .get(key)
                    .ok_or_else(|| format!("{} lists missing {}", host.hostnqn, key))?;
                if sub.host != host.key {
                    return Err(format!("{} has wrong parent", sub.subnqn));
                }
                if !seen.insert(sub.subnqn.as_str()) {
                    return Err(format!("duplicate subsystem {} under {}", sub.subnqn, host.hostnqn));
                }
            }
        }

        for sub in self.subsystems.values() {
            if !self.hosts.contains_key(&sub.host) {
                return Err(format!("{} has no host", sub.subnqn));
            }
            let mut nsids = std::collections::HashSet::new();
            for ns in self.namespaces_of(sub.key) {
                if !nsids.insert(ns.nsid) {
                    return Err(format!("duplicate nsid {} in {}", ns.nsid, sub.subnqn));
                }
                if self.path_count(ns.key) > 0 && sub.controllers.is_empty() {
                    return Err(format!("nsid {} of {} has paths but no controllers", ns.nsid, sub.subnqn));
                }
            }
        }

        for controller in self.controllers.values() {
            let sub = self
                .subsystems
                .get(&controller.subsystem)
                .ok_or_else(|| format!("{} outlived its subsystem", controller.label()))?;
            if !sub.controllers.contains(&controller.key) {
                return Err(format!("{} not listed by {}", controller.label(), sub.subnqn));
            }
        }

        for path in self.paths.values() {
            let ctrl = self
                .controllers
                .get(&path.controller)
                .ok_or_else(|| format!("path from missing {}", path.controller))?;
            let ns = self
                .namespaces
                .get(&path.namespace)
                .ok_or_else(|| format!("path to missing {}", path.namespace))?;
            if ctrl.subsystem != ns.subsystem {
                return Err(format!("path {} -> {} crosses subsystems", ctrl.label(), ns.nsid));
            }
        }
        Ok(())
    }
}
