//! Topology Snapshots
//!
//! Serializable copies of the tree. `TopologySnapshot` is the persisted
//! configuration document; `TopologyView` is the richer listing form.

use super::entities::{AnaState, ControllerOrigin, ControllerSpec, ControllerState};
use super::tree::TopologyTree;
use crate::codec::fabrics::validate_nqn;
use crate::domain::{ControllerAddress, SubsystemType, TransportType};
use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::{info, warn};
use uuid::Uuid;

// =============================================================================
// Persisted Document
// =============================================================================

/// Persisted configuration: an array of hosts
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TopologySnapshot {
    pub hosts: Vec<HostRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostRecord {
    pub hostnqn: String,
    pub hostid: Uuid,
    #[serde(default)]
    pub subsystems: Vec<SubsystemRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubsystemRecord {
    pub nqn: String,
    #[serde(default)]
    pub controllers: Vec<ControllerRecord>,
    #[serde(default)]
    pub namespaces: Vec<NamespaceRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ControllerRecord {
    pub transport: TransportType,
    pub traddr: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trsvcid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "host_traddr")]
    pub host_traddr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "host_iface")]
    pub host_iface: Option<String>,
}

impl From<&ControllerAddress> for ControllerRecord {
    fn from(address: &ControllerAddress) -> Self {
        Self {
            transport: address.transport,
            traddr: address.traddr.clone(),
            trsvcid: address.trsvcid.clone(),
            host_traddr: address.host_traddr.clone(),
            host_iface: address.host_iface.clone(),
        }
    }
}

impl From<&ControllerRecord> for ControllerAddress {
    fn from(record: &ControllerRecord) -> Self {
        Self {
            transport: record.transport,
            traddr: record.traddr.clone(),
            trsvcid: record.trsvcid.clone(),
            host_traddr: record.host_traddr.clone(),
            host_iface: record.host_iface.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceRecord {
    pub nsid: u32,
}

impl TopologySnapshot {
    /// Check the whole document before anything is applied
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut hostnqns = HashSet::new();
        for host in &self.hosts {
            validate_nqn("hostnqn", &host.hostnqn)
                .map_err(|e| ConfigError::Invalid(e.to_string()))?;
            if !hostnqns.insert(host.hostnqn.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicate host {}", host.hostnqn)));
            }

            let mut subnqns = HashSet::new();
            for sub in &host.subsystems {
                validate_nqn("subnqn", &sub.nqn).map_err(|e| ConfigError::Invalid(e.to_string()))?;
                if !subnqns.insert(sub.nqn.as_str()) {
                    return Err(ConfigError::Invalid(format!(
                        "duplicate subsystem {} under {}",
                        sub.nqn, host.hostnqn
                    )));
                }

                let mut addresses = HashSet::new();
                for record in &sub.controllers {
                    let address = ControllerAddress::from(record);
                    address
                        .validate()
                        .map_err(|e| ConfigError::Invalid(format!("{}: {}", sub.nqn, e)))?;
                    if !addresses.insert(address.clone()) {
                        return Err(ConfigError::Invalid(format!(
                            "duplicate controller {} in {}",
                            address, sub.nqn
                        )));
                    }
                }

                let mut nsids = HashSet::new();
                for ns in &sub.namespaces {
                    if ns.nsid == 0 || ns.nsid == u32::MAX {
                        return Err(ConfigError::Invalid(format!(
                            "invalid nsid {} in {}",
                            ns.nsid, sub.nqn
                        )));
                    }
                    if !nsids.insert(ns.nsid) {
                        return Err(ConfigError::Invalid(format!(
                            "duplicate nsid {} in {}",
                            ns.nsid, sub.nqn
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

impl TopologyTree {
    /// Copy the tree into the persisted document form
    pub fn snapshot(&self) -> TopologySnapshot {
        let hosts = self
            .hosts()
            .map(|host| HostRecord {
                hostnqn: host.hostnqn.clone(),
                hostid: host.hostid,
                subsystems: host
                    .subsystems
                    .iter()
                    .filter_map(|k| self.subsystem(*k))
                    .filter(|s| s.subtype == SubsystemType::Nvm)
                    .map(|sub| SubsystemRecord {
                        nqn: sub.subnqn.clone(),
                        controllers: self
                            .controllers_of(sub.key)
                            .map(|c| ControllerRecord::from(&c.address))
                            .collect(),
                        namespaces: self
                            .namespaces_of(sub.key)
                            .map(|ns| NamespaceRecord { nsid: ns.nsid })
                            .collect(),
                    })
                    .collect(),
            })
            .collect();
        TopologySnapshot { hosts }
    }

    /// Replace the whole tree with a persisted document
    ///
    /// The document is validated first; on any error the tree is left empty.
    pub fn replace(&mut self, snapshot: &TopologySnapshot) -> Result<(), ConfigError> {
        self.clear();
        if let Err(e) = snapshot.validate() {
            warn!(error = %e, "Rejecting configuration");
            return Err(e);
        }
        if let Err(e) = self.build(snapshot) {
            warn!(error = %e, "Configuration could not be applied");
            self.clear();
            return Err(e);
        }
        info!(hosts = snapshot.hosts.len(), "Topology loaded from configuration");
        Ok(())
    }

    fn build(&mut self, snapshot: &TopologySnapshot) -> Result<(), ConfigError> {
        for host in &snapshot.hosts {
            let host_key = self.add_host(&host.hostnqn, host.hostid);
            for sub in &host.subsystems {
                let sub_key = self
                    .ensure_subsystem(host_key, &sub.nqn, SubsystemType::Nvm)
                    .map_err(|e| ConfigError::Invalid(e.to_string()))?;
                for record in &sub.controllers {
                    let spec = ControllerSpec::new(record.into(), ControllerOrigin::Config);
                    self.attach_controller(sub_key, spec)
                        .map_err(|e| ConfigError::Invalid(e.to_string()))?;
                }
                for ns in &sub.namespaces {
                    self.ensure_namespace(sub_key, ns.nsid).ok_or_else(|| {
                        ConfigError::Invalid(format!("cannot add nsid {} to {}", ns.nsid, sub.nqn))
                    })?;
                }
            }
        }
        Ok(())
    }

    /// Copy the tree into the listing form
    pub fn view(&self) -> TopologyView {
        let subsystems = self
            .subsystems()
            .map(|sub| SubsystemView {
                subnqn: sub.subnqn.clone(),
                subtype: sub.subtype,
                model: sub.model.clone(),
                serial: sub.serial.clone(),
                controllers: self
                    .controllers_of(sub.key)
                    .map(|c| ControllerView {
                        name: c.name.clone(),
                        address: c.address.to_string(),
                        cntlid: c.cntlid,
                        state: c.state,
                        origin: c.origin,
                    })
                    .collect(),
                namespaces: self
                    .namespaces_of(sub.key)
                    .map(|ns| NamespaceView {
                        nsid: ns.nsid,
                        name: ns.name.clone(),
                        capacity_bytes: ns.capacity_bytes(),
                        block_size: ns.block_size,
                        in_use: ns.in_use(),
                        paths: self
                            .paths_of_namespace(ns.key)
                            .filter_map(|p| {
                                self.controller(p.controller).map(|c| PathView {
                                    controller: c.label(),
                                    ana_state: p.ana_state,
                                })
                            })
                            .collect(),
                    })
                    .collect(),
            })
            .collect();
        TopologyView { subsystems }
    }
}

// =============================================================================
// Listing
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TopologyView {
    pub subsystems: Vec<SubsystemView>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubsystemView {
    pub subnqn: String,
    pub subtype: SubsystemType,
    pub model: Option<String>,
    pub serial: Option<String>,
    pub controllers: Vec<ControllerView>,
    pub namespaces: Vec<NamespaceView>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ControllerView {
    pub name: Option<String>,
    pub address: String,
    pub cntlid: Option<u16>,
    pub state: ControllerState,
    pub origin: ControllerOrigin,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NamespaceView {
    pub nsid: u32,
    pub name: Option<String>,
    pub capacity_bytes: u64,
    pub block_size: u32,
    pub in_use: usize,
    pub paths: Vec<PathView>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PathView {
    pub controller: String,
    pub ana_state: AnaState,
}

impl std::fmt::Display for TopologyView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for sub in &self.subsystems {
            writeln!(f, "{} ({})", sub.subnqn, sub.subtype)?;
            for c in &sub.controllers {
                writeln!(
                    f,
                    " +- {} {} {}",
                    c.name.as_deref().unwrap_or("-"),
                    c.address,
                    c.state
                )?;
            }
            for ns in &sub.namespaces {
                let paths: Vec<String> = ns
                    .paths
                    .iter()
                    .map(|p| format!("{}:{}", p.controller, p.ana_state))
                    .collect();
                writeln!(
                    f,
                    " +- nsid {} {} bytes [{}]",
                    ns.nsid,
                    ns.capacity_bytes,
                    paths.join(" ")
                )?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    const DOCUMENT: &str = r#"[
      {
        "hostnqn": "nqn.2014-08.org.nvmexpress:uuid:00000000-0000-0000-0000-000000000001",
        "hostid": "00000000-0000-0000-0000-000000000001",
        "subsystems": [
          {
            "nqn": "nqn.test-1",
            "controllers": [
              {"transport": "tcp", "traddr": "10.0.0.1", "trsvcid": "4420", "host-traddr": "10.0.0.100"},
              {"transport": "tcp", "traddr": "10.0.0.2", "trsvcid": "4420", "host_iface": "eth1"}
            ],
            "namespaces": [{"nsid": 1}, {"nsid": 2}]
          }
        ]
      }
    ]"#;

    #[test]
    fn test_parse_document() {
        let doc: TopologySnapshot = serde_json::from_str(DOCUMENT).unwrap();
        assert_eq!(doc.hosts.len(), 1);
        let sub = &doc.hosts[0].subsystems[0];
        assert_eq!(sub.controllers[0].host_traddr.as_deref(), Some("10.0.0.100"));
        assert_eq!(sub.controllers[1].host_iface.as_deref(), Some("eth1"));
        doc.validate().unwrap();

        let json = serde_json::to_value(&doc).unwrap();
        assert_eq!(json[0]["subsystems"][0]["controllers"][0]["host-traddr"], "10.0.0.100");
    }

    #[test]
    fn test_replace_then_snapshot() {
        let doc: TopologySnapshot = serde_json::from_str(DOCUMENT).unwrap();
        let mut tree = TopologyTree::new();
        tree.replace(&doc).unwrap();

        let sub = tree.find_subsystem("nqn.test-1").unwrap();
        assert_eq!(tree.controllers_of(sub.key).count(), 2);
        assert!(tree
            .controllers()
            .all(|c| c.state == ControllerState::Disconnected));
        assert_eq!(tree.namespaces_of(sub.key).count(), 2);
        tree.check_invariants().unwrap();

        assert_eq!(tree.snapshot(), doc);
    }

    #[test]
    fn test_replace_invalid_leaves_tree_empty() {
        let mut doc: TopologySnapshot = serde_json::from_str(DOCUMENT).unwrap();
        let mut tree = TopologyTree::new();
        tree.replace(&doc).unwrap();

        doc.hosts[0].subsystems[0].namespaces.push(NamespaceRecord { nsid: 1 });
        assert_matches!(tree.replace(&doc), Err(ConfigError::Invalid(_)));
        assert!(tree.is_empty());
    }

    #[test]
    fn test_validate_rejects_duplicate_controller() {
        let mut doc: TopologySnapshot = serde_json::from_str(DOCUMENT).unwrap();
        let first = doc.hosts[0].subsystems[0].controllers[0].clone();
        doc.hosts[0].subsystems[0].controllers.push(first);
        assert_matches!(doc.validate(), Err(ConfigError::Invalid(_)));
    }

    #[test]
    fn test_validate_rejects_missing_trsvcid() {
        let mut doc: TopologySnapshot = serde_json::from_str(DOCUMENT).unwrap();
        doc.hosts[0].subsystems[0].controllers[0].trsvcid = None;
        assert_matches!(doc.validate(), Err(ConfigError::Invalid(_)));
    }

    #[test]
    fn test_view_lists_paths() {
        let doc: TopologySnapshot = serde_json::from_str(DOCUMENT).unwrap();
        let mut tree = TopologyTree::new();
        tree.replace(&doc).unwrap();
        let view = tree.view();
        assert_eq!(view.subsystems[0].controllers.len(), 2);
        assert!(view.subsystems[0].namespaces[0].paths.is_empty());
        assert!(view.to_string().contains("nqn.test-1 (nvm)"));
    }
}
