//! Rescan
//!
//! Reconciles the tree with a snapshot of the live system taken by a
//! `TopologySource`. Reconciliation is idempotent: applying the same
//! snapshot twice reports no changes the second time.

use super::entities::{
    AnaState, ControllerKey, ControllerOrigin, ControllerSpec, ControllerState, HostKey,
    NamespaceKey, SubsystemKey,
};
use super::events::TopologyEvent;
use super::tree::{PathChange, TopologyTree};
use crate::domain::ports::TopologySource;
use crate::domain::{ControllerAddress, SubsystemType};
use crate::error::Result;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tracing::{debug, info, warn};

// =============================================================================
// Snapshot Types
// =============================================================================

/// Observed state of the system's NVMe topology
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemSnapshot {
    pub subsystems: Vec<ScannedSubsystem>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScannedSubsystem {
    pub subnqn: String,
    pub subtype: SubsystemType,
    pub model: Option<String>,
    pub serial: Option<String>,
    pub firmware: Option<String>,
    pub controllers: Vec<ScannedController>,
    pub namespaces: Vec<ScannedNamespace>,
}

impl ScannedSubsystem {
    pub fn new(subnqn: impl Into<String>) -> Self {
        Self {
            subnqn: subnqn.into(),
            subtype: SubsystemType::Nvm,
            model: None,
            serial: None,
            firmware: None,
            controllers: Vec::new(),
            namespaces: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScannedController {
    /// Kernel instance name (nvme0)
    pub name: String,
    pub address: ControllerAddress,
    pub cntlid: Option<u16>,
    pub state: ControllerState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScannedNamespace {
    pub nsid: u32,
    pub name: Option<String>,
    pub size_blocks: u64,
    pub block_size: u32,
    pub ana_group_id: Option<u32>,
    pub paths: Vec<ScannedPath>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScannedPath {
    /// Instance name of the controller the path goes through
    pub controller: String,
    pub ana_state: AnaState,
    pub name: Option<String>,
}

// =============================================================================
// Report
// =============================================================================

/// Entity counts changed by one rescan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RescanReport {
    pub added: u32,
    pub updated: u32,
    pub removed: u32,
    /// Entities that could not be reconciled, or controllers newly marked failed
    pub failed: u32,
    pub at: DateTime<Utc>,
}

impl RescanReport {
    fn new() -> Self {
        Self {
            added: 0,
            updated: 0,
            removed: 0,
            failed: 0,
            at: Utc::now(),
        }
    }

    /// Whether the rescan changed nothing
    pub fn is_unchanged(&self) -> bool {
        self.added == 0 && self.updated == 0 && self.removed == 0 && self.failed == 0
    }
}

// =============================================================================
// Reconciliation
// =============================================================================

/// Apply a snapshot to the subsystems of one host
pub fn reconcile(tree: &mut TopologyTree, host: HostKey, snapshot: &SystemSnapshot) -> RescanReport {
    let mut report = RescanReport::new();
    let mut seen_subsystems = HashSet::new();

    for scanned in &snapshot.subsystems {
        let existing = tree.find_subsystem_in(host, &scanned.subnqn).map(|s| s.key);
        let key = match existing {
            Some(key) => key,
            None => match tree.ensure_subsystem(host, &scanned.subnqn, scanned.subtype) {
                Ok(key) => {
                    report.added += 1;
                    key
                }
                Err(e) => {
                    warn!(subnqn = %scanned.subnqn, error = %e, "Cannot add scanned subsystem");
                    report.failed += 1;
                    continue;
                }
            },
        };
        seen_subsystems.insert(key);

        if update_subsystem(tree, key, scanned) && existing.is_some() {
            report.updated += 1;
        }

        let controllers = reconcile_controllers(tree, key, scanned, &mut report);
        let namespaces = reconcile_namespaces(tree, key, scanned, &controllers, &mut report);
        let seen_controllers: HashSet<ControllerKey> = controllers.values().copied().collect();
        prune_subsystem(tree, key, &seen_controllers, &namespaces, &mut report);
    }

    let vanished: Vec<SubsystemKey> = tree
        .host(host)
        .map(|h| h.subsystems.clone())
        .unwrap_or_default()
        .into_iter()
        .filter(|k| !seen_subsystems.contains(k))
        .collect();
    for key in vanished {
        prune_subsystem(tree, key, &HashSet::new(), &HashSet::new(), &mut report);
        let empty = tree
            .subsystem(key)
            .is_some_and(|s| s.controllers.is_empty() && s.namespaces.is_empty());
        if empty && tree.remove_subsystem(key) {
            report.removed += 1;
        }
    }

    report.at = Utc::now();
    tree.emit(TopologyEvent::RescanCompleted {
        added: report.added,
        updated: report.updated,
        removed: report.removed,
        failed: report.failed,
        at: report.at,
    });
    info!(
        added = report.added,
        updated = report.updated,
        removed = report.removed,
        failed = report.failed,
        "Rescan complete"
    );
    report
}

fn update_subsystem(tree: &mut TopologyTree, key: SubsystemKey, scanned: &ScannedSubsystem) -> bool {
    let Some(sub) = tree.subsystems.get_mut(&key) else {
        return false;
    };
    let changed = sub.subtype != scanned.subtype
        || sub.model != scanned.model
        || sub.serial != scanned.serial
        || sub.firmware != scanned.firmware;
    sub.subtype = scanned.subtype;
    sub.model.clone_from(&scanned.model);
    sub.serial.clone_from(&scanned.serial);
    sub.firmware.clone_from(&scanned.firmware);
    changed
}

/// Same transport endpoint, ignoring host-side selectors the kernel may add
fn same_endpoint(a: &ControllerAddress, b: &ControllerAddress) -> bool {
    a.transport == b.transport && a.traddr == b.traddr && a.trsvcid == b.trsvcid
}

/// Reconcile controllers, returning instance name to key for every scanned one
fn reconcile_controllers(
    tree: &mut TopologyTree,
    subsystem: SubsystemKey,
    scanned: &ScannedSubsystem,
    report: &mut RescanReport,
) -> HashMap<String, ControllerKey> {
    let mut by_name = HashMap::new();

    for sc in &scanned.controllers {
        let existing = tree
            .controllers_of(subsystem)
            .find(|c| c.name.as_deref() == Some(sc.name.as_str()))
            .or_else(|| {
                tree.controllers_of(subsystem)
                    .find(|c| c.name.is_none() && same_endpoint(&c.address, &sc.address))
            })
            .map(|c| c.key);

        match existing {
            Some(key) => {
                let mut changed = tree.set_controller_state(key, sc.state);
                if let Some(controller) = tree.controllers.get_mut(&key) {
                    if controller.name.as_deref() != Some(sc.name.as_str())
                        || controller.address != sc.address
                        || controller.cntlid != sc.cntlid
                    {
                        controller.name = Some(sc.name.clone());
                        controller.address = sc.address.clone();
                        controller.cntlid = sc.cntlid;
                        changed = true;
                    }
                }
                if changed {
                    report.updated += 1;
                }
                by_name.insert(sc.name.clone(), key);
            }
            None => {
                let mut spec = ControllerSpec::new(sc.address.clone(), ControllerOrigin::Scanned)
                    .with_name(sc.name.as_str())
                    .with_state(sc.state);
                spec.cntlid = sc.cntlid;
                match tree.attach_controller(subsystem, spec) {
                    Ok(controller) => {
                        by_name.insert(sc.name.clone(), controller.key);
                        report.added += 1;
                    }
                    Err(e) => {
                        warn!(controller = %sc.name, error = %e, "Cannot attach scanned controller");
                        report.failed += 1;
                    }
                }
            }
        }
    }
    by_name
}

/// Reconcile namespaces and their paths, returning the keys seen
fn reconcile_namespaces(
    tree: &mut TopologyTree,
    subsystem: SubsystemKey,
    scanned: &ScannedSubsystem,
    controllers: &HashMap<String, ControllerKey>,
    report: &mut RescanReport,
) -> HashSet<NamespaceKey> {
    let mut seen = HashSet::new();

    for sn in &scanned.namespaces {
        let existed = tree.find_namespace(subsystem, sn.nsid).is_some();
        let Some(key) = tree.ensure_namespace(subsystem, sn.nsid) else {
            report.failed += 1;
            continue;
        };
        if !existed {
            report.added += 1;
        }
        seen.insert(key);

        let mut changed = tree.update_namespace(key, sn.size_blocks, sn.block_size, sn.ana_group_id);
        changed |= tree.set_namespace_name(key, sn.name.clone());

        let mut wanted = HashSet::new();
        for path in &sn.paths {
            let Some(&controller) = controllers.get(&path.controller) else {
                debug!(nsid = sn.nsid, controller = %path.controller, "Path through unknown controller");
                continue;
            };
            wanted.insert(controller);
            match tree.set_path(controller, key, path.ana_state, path.name.clone()) {
                Some(PathChange::Added) | Some(PathChange::Updated) => changed = true,
                Some(PathChange::Unchanged) | None => {}
            }
        }
        let stale: Vec<ControllerKey> = tree
            .paths_of_namespace(key)
            .map(|p| p.controller)
            .filter(|c| !wanted.contains(c))
            .collect();
        for controller in stale {
            changed |= tree.remove_path(controller, key);
        }

        if changed && existed {
            report.updated += 1;
        }
    }
    seen
}

/// Remove namespaces and controllers of a subsystem that were not observed
fn prune_subsystem(
    tree: &mut TopologyTree,
    subsystem: SubsystemKey,
    seen_controllers: &HashSet<ControllerKey>,
    seen_namespaces: &HashSet<NamespaceKey>,
    report: &mut RescanReport,
) {
    // Pathless namespaces come from configuration and are left alone.
    let vanished: Vec<(NamespaceKey, bool)> = tree
        .namespaces_of(subsystem)
        .filter(|ns| !seen_namespaces.contains(&ns.key))
        .filter(|ns| tree.path_count(ns.key) > 0)
        .map(|ns| (ns.key, ns.is_busy()))
        .collect();
    for (key, busy) in vanished {
        if busy {
            debug!(namespace = %key, "Keeping vanished namespace held by a caller");
            continue;
        }
        if tree.remove_namespace(key).is_some() {
            report.removed += 1;
        }
    }

    let vanished: Vec<ControllerKey> = tree
        .controllers_of(subsystem)
        .filter(|c| !seen_controllers.contains(&c.key))
        .filter(|c| !(c.origin == ControllerOrigin::Config && c.state == ControllerState::Disconnected))
        .map(|c| c.key)
        .collect();
    for key in vanished {
        let holds_busy = tree
            .sole_path_namespaces(key)
            .iter()
            .filter_map(|n| tree.namespace(*n))
            .any(|ns| ns.is_busy());
        if holds_busy {
            if tree.set_controller_state(key, ControllerState::Failed) {
                warn!(controller = %key, "Vanished controller is the last path to an in-use namespace");
                report.failed += 1;
            }
            continue;
        }
        tree.remove_controller_entity(key);
        report.removed += 1;
    }
}

// =============================================================================
// Static Source
// =============================================================================

/// Topology source returning a fixed snapshot
#[derive(Debug, Default)]
pub struct StaticSource {
    snapshot: Mutex<SystemSnapshot>,
}

impl StaticSource {
    pub fn new(snapshot: SystemSnapshot) -> Self {
        Self {
            snapshot: Mutex::new(snapshot),
        }
    }

    /// Replace the snapshot returned by subsequent scans
    pub fn set(&self, snapshot: SystemSnapshot) {
        *self.snapshot.lock() = snapshot;
    }
}

impl TopologySource for StaticSource {
    fn scan(&self) -> Result<SystemSnapshot> {
        Ok(self.snapshot.lock().clone())
    }
}
