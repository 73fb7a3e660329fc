//! Host Identity
//!
//! Resolves the host NQN and host ID presented in every Connect. Explicit
//! files win; otherwise both are derived from one UUID taken from the
//! existing host ID, the host NQN, the DMI product UUID or a fresh v4 UUID.

use crate::codec::fabrics::validate_nqn;
use crate::error::{ConfigError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use uuid::Uuid;

/// Prefix of a UUID-based host NQN
pub const UUID_NQN_PREFIX: &str = "nqn.2014-08.org.nvmexpress:uuid:";

/// Where the host identity is read from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostIdentitySources {
    pub hostnqn_path: PathBuf,
    pub hostid_path: PathBuf,
    pub dmi_uuid_path: PathBuf,
}

impl Default for HostIdentitySources {
    fn default() -> Self {
        Self {
            hostnqn_path: PathBuf::from("/etc/nvme/hostnqn"),
            hostid_path: PathBuf::from("/etc/nvme/hostid"),
            dmi_uuid_path: PathBuf::from("/sys/class/dmi/id/product_uuid"),
        }
    }
}

impl HostIdentitySources {
    /// Sources relative to an alternate root directory
    pub fn under(root: &Path) -> Self {
        Self {
            hostnqn_path: root.join("etc/nvme/hostnqn"),
            hostid_path: root.join("etc/nvme/hostid"),
            dmi_uuid_path: root.join("sys/class/dmi/id/product_uuid"),
        }
    }
}

/// Host NQN and host ID of this machine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostIdentity {
    pub hostnqn: String,
    pub hostid: Uuid,
}

impl HostIdentity {
    pub fn new(hostnqn: impl Into<String>, hostid: Uuid) -> Result<Self> {
        let hostnqn = hostnqn.into();
        validate_nqn("hostnqn", &hostnqn)?;
        Ok(Self { hostnqn, hostid })
    }

    /// Identity derived from a single UUID
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self {
            hostnqn: format!("{}{}", UUID_NQN_PREFIX, uuid),
            hostid: uuid,
        }
    }

    /// UUID embedded in a UUID-based host NQN
    pub fn nqn_uuid(hostnqn: &str) -> Option<Uuid> {
        hostnqn
            .strip_prefix(UUID_NQN_PREFIX)
            .and_then(|uuid| Uuid::parse_str(uuid).ok())
    }

    /// Resolve the identity from the configured files
    pub fn resolve(sources: &HostIdentitySources) -> Result<Self> {
        let hostnqn = read_optional(&sources.hostnqn_path)?;
        let hostid = read_optional(&sources.hostid_path)?
            .map(|raw| {
                Uuid::parse_str(&raw).map_err(|e| {
                    ConfigError::Invalid(format!(
                        "host ID in {}: {}",
                        sources.hostid_path.display(),
                        e
                    ))
                })
            })
            .transpose()?;

        let hostid = match hostid {
            Some(id) => id,
            None => hostnqn
                .as_deref()
                .and_then(Self::nqn_uuid)
                .or_else(|| dmi_uuid(&sources.dmi_uuid_path))
                .unwrap_or_else(|| {
                    debug!("No stable host UUID found, generating one");
                    Uuid::new_v4()
                }),
        };
        let identity = match hostnqn {
            Some(hostnqn) => Self::new(hostnqn, hostid)?,
            None => Self::from_uuid(hostid),
        };

        info!(hostnqn = %identity.hostnqn, hostid = %identity.hostid, "Resolved host identity");
        Ok(identity)
    }

    /// Write the identity files that do not exist yet
    pub fn persist(&self, sources: &HostIdentitySources) -> Result<()> {
        write_missing(&sources.hostnqn_path, &self.hostnqn)?;
        write_missing(&sources.hostid_path, &self.hostid.to_string())
    }
}

/// Trimmed file contents, `None` when the file is absent or empty
fn read_optional(path: &Path) -> Result<Option<String>> {
    match std::fs::read_to_string(path) {
        Ok(raw) => {
            let value = raw.trim();
            Ok((!value.is_empty()).then(|| value.to_string()))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(ConfigError::Read {
            path: path.to_path_buf(),
            source,
        }
        .into()),
    }
}

/// DMI product UUID; unreadable or nil values are ignored
fn dmi_uuid(path: &Path) -> Option<Uuid> {
    let raw = std::fs::read_to_string(path).ok()?;
    Uuid::parse_str(raw.trim()).ok().filter(|uuid| !uuid.is_nil())
}

fn write_missing(path: &Path, value: &str) -> Result<()> {
    if path.exists() {
        return Ok(());
    }
    let io = |source| ConfigError::Write {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(io)?;
    }
    std::fs::write(path, format!("{}\n", value)).map_err(io)?;
    Ok(())
}
