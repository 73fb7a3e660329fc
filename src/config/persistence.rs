//! Configuration Persistence
//!
//! Loads and saves the topology as a JSON document. Saving copies the tree
//! under the read lock and writes outside it; the file is replaced
//! atomically through a temporary sibling.

use crate::error::ConfigError;
use crate::topology::{Topology, TopologySnapshot};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// JSON file holding the persisted topology
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read and validate the document, `None` when no file exists
    pub fn read(&self) -> Result<Option<TopologySnapshot>, ConfigError> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(ConfigError::Read {
                    path: self.path.clone(),
                    source,
                })
            }
        };
        let snapshot: TopologySnapshot =
            serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
                path: self.path.clone(),
                source,
            })?;
        snapshot.validate()?;
        Ok(Some(snapshot))
    }

    /// Validate and atomically write a document
    pub fn write(&self, snapshot: &TopologySnapshot) -> Result<(), ConfigError> {
        snapshot.validate()?;
        let json = serde_json::to_vec_pretty(snapshot).map_err(|source| ConfigError::Serialize {
            path: self.path.clone(),
            source,
        })?;

        let io = |source| ConfigError::Write {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(io)?;
        }
        let temp = self.temp_path();
        let result = (|| {
            let mut file = std::fs::File::create(&temp)?;
            file.write_all(&json)?;
            file.write_all(b"\n")?;
            file.sync_all()?;
            std::fs::rename(&temp, &self.path)
        })();
        if let Err(e) = result {
            let _ = std::fs::remove_file(&temp);
            return Err(io(e));
        }
        debug!(path = %self.path.display(), bytes = json.len(), "Configuration written");
        Ok(())
    }

    /// Replace the topology with the stored document
    ///
    /// Returns false when there is no file. A document that cannot be read,
    /// parsed or applied leaves the topology empty and the error is returned.
    pub fn load_into(&self, topology: &Topology) -> Result<bool, ConfigError> {
        let snapshot = match self.read() {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => {
                debug!(path = %self.path.display(), "No saved configuration");
                return Ok(false);
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Discarding saved configuration");
                topology.write(|tree| tree.clear());
                return Err(e);
            }
        };
        topology.replace(&snapshot)?;
        info!(path = %self.path.display(), hosts = snapshot.hosts.len(), "Configuration loaded");
        Ok(true)
    }

    /// Save the current topology
    pub fn save_from(&self, topology: &Topology) -> Result<(), ConfigError> {
        let snapshot = topology.snapshot();
        self.write(&snapshot)?;
        info!(path = %self.path.display(), hosts = snapshot.hosts.len(), "Configuration saved");
        Ok(())
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(format!(".tmp.{}", std::process::id()));
        self.path.with_file_name(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ControllerAddress, SubsystemType, TransportType};
    use crate::topology::{ControllerOrigin, ControllerSpec, ControllerState};
    use assert_matches::assert_matches;
    use tempfile::TempDir;
    use uuid::Uuid;

    const DOCUMENT: &str = r#"[
  {
    "hostnqn": "nqn.2014-08.org.nvmexpress:uuid:3fa85f64-5717-4562-b3fc-2c963f66afa6",
    "hostid": "3fa85f64-5717-4562-b3fc-2c963f66afa6",
    "subsystems": [
      {
        "nqn": "nqn.2014-08.org.example:subsys-a",
        "controllers": [
          { "transport": "tcp", "traddr": "10.0.0.1", "trsvcid": "4420", "host_traddr": "10.0.0.200" }
        ],
        "namespaces": [ { "nsid": 1 } ]
      }
    ]
  }
]"#;

    fn store(dir: &TempDir) -> ConfigStore {
        ConfigStore::new(dir.path().join("nvme").join("config.json"))
    }

    #[test]
    fn test_load_document() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        std::fs::create_dir_all(store.path().parent().unwrap()).unwrap();
        std::fs::write(store.path(), DOCUMENT).unwrap();

        let topology = Topology::new();
        assert!(store.load_into(&topology).unwrap());

        let sub = topology.find_subsystem("nqn.2014-08.org.example:subsys-a").unwrap();
        assert_eq!(sub.controllers.len(), 1);
        assert_eq!(sub.namespaces.len(), 1);
        let address = ControllerAddress::new(TransportType::Tcp, "10.0.0.1")
            .with_trsvcid("4420")
            .with_host_traddr("10.0.0.200");
        let controller = topology.find_controller(&address).unwrap();
        assert_eq!(controller.state, ControllerState::Disconnected);
        assert_eq!(controller.origin, ControllerOrigin::Config);
    }

    #[test]
    fn test_save_then_load() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);

        let topology = Topology::new();
        let sub = topology
            .write(|tree| {
                let host = tree.add_host("nqn.host-a", Uuid::from_u128(7));
                tree.ensure_subsystem(host, "nqn.subsys-a", SubsystemType::Nvm)
            })
            .unwrap();
        let address = ControllerAddress::new(TransportType::Rdma, "192.168.1.5").with_trsvcid("4420");
        topology
            .attach_controller(sub, ControllerSpec::new(address.clone(), ControllerOrigin::Connected))
            .unwrap();
        store.save_from(&topology).unwrap();

        let restored = Topology::new();
        assert!(store.load_into(&restored).unwrap());
        assert_eq!(restored.snapshot(), topology.snapshot());
        assert!(restored.find_controller(&address).is_some());

        // no temporary file is left behind
        let entries = std::fs::read_dir(store.path().parent().unwrap()).unwrap().count();
        assert_eq!(entries, 1);
    }

    #[test]
    fn test_missing_file() {
        let dir = TempDir::new().unwrap();
        let topology = Topology::new();
        assert!(!store(&dir).load_into(&topology).unwrap());
        assert!(topology.read(|tree| tree.is_empty()));
    }

    #[test]
    fn test_malformed_document() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        std::fs::create_dir_all(store.path().parent().unwrap()).unwrap();

        std::fs::write(store.path(), "{ not json").unwrap();
        assert_matches!(store.read(), Err(ConfigError::Parse { .. }));

        let invalid = DOCUMENT.replace("\"nsid\": 1", "\"nsid\": 0");
        std::fs::write(store.path(), invalid).unwrap();
        assert_matches!(store.read(), Err(ConfigError::Invalid(_)));
    }

    #[test]
    fn test_malformed_document_empties_topology() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        std::fs::create_dir_all(store.path().parent().unwrap()).unwrap();
        std::fs::write(store.path(), DOCUMENT).unwrap();

        let topology = Topology::new();
        assert!(store.load_into(&topology).unwrap());
        assert!(!topology.read(|tree| tree.is_empty()));

        std::fs::write(store.path(), "{ not json").unwrap();
        assert_matches!(store.load_into(&topology), Err(ConfigError::Parse { .. }));
        assert!(topology.read(|tree| tree.is_empty()));

        std::fs::write(store.path(), DOCUMENT).unwrap();
        assert!(store.load_into(&topology).unwrap());
        let invalid = DOCUMENT.replace("\"nsid\": 1", "\"nsid\": 0");
        std::fs::write(store.path(), invalid).unwrap();
        assert_matches!(store.load_into(&topology), Err(ConfigError::Invalid(_)));
        assert!(topology.read(|tree| tree.is_empty()));
    }
}
