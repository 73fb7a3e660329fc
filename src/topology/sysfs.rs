//! Sysfs Topology Source
//!
//! Reads the kernel's view of NVMe subsystems, controllers, namespaces and
//! paths from `class/nvme-subsystem` and `class/nvme`.

use super::entities::{AnaState, ControllerState};
use super::rescan::{
    ScannedController, ScannedNamespace, ScannedPath, ScannedSubsystem, SystemSnapshot,
};
use crate::domain::ports::TopologySource;
use crate::domain::{ControllerAddress, SubsystemType, TransportType};
use crate::error::{Error, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Kernel size attributes count 512-byte sectors
const SECTOR_SIZE: u64 = 512;

/// Kind of entry found in a sysfs NVMe directory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NvmeEntry {
    /// nvme0
    Controller,
    /// nvme0n1, the multipath head or a private namespace
    Namespace,
    /// nvme0c1n1, one controller's path to a shared namespace
    Path,
}

fn leading_digits(s: &str) -> Option<(&str, &str)> {
    let end = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    (end > 0).then(|| s.split_at(end))
}

fn classify(name: &str) -> Option<NvmeEntry> {
    let (_, rest) = leading_digits(name.strip_prefix("nvme")?)?;
    if rest.is_empty() {
        return Some(NvmeEntry::Controller);
    }
    let (kind, rest) = match rest.strip_prefix('c') {
        Some(rest) => (NvmeEntry::Path, leading_digits(rest)?.1),
        None => (NvmeEntry::Namespace, rest),
    };
    let (_, tail) = leading_digits(rest.strip_prefix('n')?)?;
    tail.is_empty().then_some(kind)
}

/// Topology source backed by sysfs
#[derive(Debug, Clone)]
pub struct SysfsSource {
    sysfs_path: PathBuf,
}

impl Default for SysfsSource {
    fn default() -> Self {
        Self::new("/sys")
    }
}

impl SysfsSource {
    pub fn new(sysfs_path: impl Into<PathBuf>) -> Self {
        Self {
            sysfs_path: sysfs_path.into(),
        }
    }

    pub fn sysfs_path(&self) -> &Path {
        &self.sysfs_path
    }

    fn read_attr(&self, base: &Path, attr: &str) -> Result<String> {
        let path = base.join(attr);
        fs::read_to_string(&path)
            .map(|s| s.trim().to_string())
            .map_err(|e| Error::Scan(format!("Failed to read {}: {}", path.display(), e)))
    }

    fn read_opt(&self, base: &Path, attr: &str) -> Option<String> {
        self.read_attr(base, attr).ok().filter(|s| !s.is_empty())
    }

    fn read_num<T: std::str::FromStr>(&self, base: &Path, attr: &str) -> Result<T> {
        let value = self.read_attr(base, attr)?;
        value.parse().map_err(|_| {
            Error::Scan(format!(
                "Invalid {} in {}: {}",
                attr,
                base.display(),
                value
            ))
        })
    }

    fn entries(dir: &Path) -> Result<Vec<(String, PathBuf)>> {
        let mut entries = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            entries.push((entry.file_name().to_string_lossy().to_string(), entry.path()));
        }
        entries.sort();
        Ok(entries)
    }

    fn scan_subsystem(&self, dir: &Path) -> Result<ScannedSubsystem> {
        let subnqn = self.read_attr(dir, "subsysnqn")?;
        let mut subsystem = ScannedSubsystem::new(subnqn);
        subsystem.subtype = match self.read_opt(dir, "subsystype").as_deref() {
            Some("discovery") => SubsystemType::Discovery,
            _ => SubsystemType::Nvm,
        };
        subsystem.model = self.read_opt(dir, "model");
        subsystem.serial = self.read_opt(dir, "serial");
        subsystem.firmware = self.read_opt(dir, "firmware_rev");

        let entries = Self::entries(dir)?;
        for (name, path) in &entries {
            if let Some(NvmeEntry::Namespace) = classify(name) {
                match self.scan_namespace(name, path) {
                    Ok(ns) => subsystem.namespaces.push(ns),
                    Err(e) => warn!(namespace = %name, error = %e, "Skipping namespace"),
                }
            }
        }

        for (name, _) in &entries {
            if classify(name) != Some(NvmeEntry::Controller) {
                continue;
            }
            let ctrl_dir = self.sysfs_path.join("class/nvme").join(name);
            match self.scan_controller(name, &ctrl_dir) {
                Ok(controller) => {
                    self.scan_paths(name, &ctrl_dir, &mut subsystem.namespaces)?;
                    subsystem.controllers.push(controller);
                }
                Err(e) => warn!(controller = %name, error = %e, "Skipping controller"),
            }
        }

        Ok(subsystem)
    }

    fn scan_controller(&self, name: &str, dir: &Path) -> Result<ScannedController> {
        let transport: TransportType = self
            .read_attr(dir, "transport")?
            .parse()
            .map_err(Error::Scan)?;
        let address = ControllerAddress::from_sysfs(transport, &self.read_attr(dir, "address")?);
        let state = self
            .read_opt(dir, "state")
            .map_or(ControllerState::Failed, |s| ControllerState::from_sysfs(&s));
        let cntlid = self.read_num(dir, "cntlid").ok();

        debug!(controller = %name, %address, %state, "Scanned controller");
        Ok(ScannedController {
            name: name.to_string(),
            address,
            cntlid,
            state,
        })
    }

    fn scan_namespace(&self, name: &str, dir: &Path) -> Result<ScannedNamespace> {
        let nsid = self.read_num(dir, "nsid")?;
        let sectors: u64 = self.read_num(dir, "size")?;
        let block_size: u32 = self
            .read_num(dir, "queue/logical_block_size")
            .unwrap_or(SECTOR_SIZE as u32);
        let size_blocks = match block_size {
            0 => 0,
            bs => sectors.saturating_mul(SECTOR_SIZE) / bs as u64,
        };

        Ok(ScannedNamespace {
            nsid,
            name: Some(name.to_string()),
            size_blocks,
            block_size,
            ana_group_id: self.read_num(dir, "ana_grpid").ok(),
            paths: Vec::new(),
        })
    }

    /// Record the controller's paths on the subsystem's namespaces
    fn scan_paths(
        &self,
        controller: &str,
        dir: &Path,
        namespaces: &mut Vec<ScannedNamespace>,
    ) -> Result<()> {
        for (name, path) in Self::entries(dir)? {
            let (path_name, ns) = match classify(&name) {
                Some(NvmeEntry::Path) => (Some(name.clone()), None),
                // Without multipath the namespace hangs directly off the controller
                Some(NvmeEntry::Namespace) => (None, Some(self.scan_namespace(&name, &path))),
                _ => continue,
            };
            let nsid: u32 = match &ns {
                Some(Ok(ns)) => ns.nsid,
                Some(Err(e)) => {
                    warn!(namespace = %name, error = %e, "Skipping namespace");
                    continue;
                }
                None => match self.read_num(&path, "nsid") {
                    Ok(nsid) => nsid,
                    Err(e) => {
                        warn!(path = %name, error = %e, "Skipping path");
                        continue;
                    }
                },
            };
            let ana_state = self
                .read_opt(&path, "ana_state")
                .and_then(|s| AnaState::from_sysfs(&s))
                .unwrap_or(AnaState::Optimized);

            let index = match namespaces.iter().position(|n| n.nsid == nsid) {
                Some(index) => index,
                None => match ns {
                    Some(Ok(ns)) => {
                        namespaces.push(ns);
                        namespaces.len() - 1
                    }
                    _ => {
                        debug!(path = %name, nsid, "Path to namespace without a head");
                        continue;
                    }
                },
            };
            namespaces[index].paths.push(ScannedPath {
                controller: controller.to_string(),
                ana_state,
                name: path_name,
            });
        }
        Ok(())
    }
}

impl TopologySource for SysfsSource {
    fn scan(&self) -> Result<SystemSnapshot> {
        let class_dir = self.sysfs_path.join("class/nvme-subsystem");
        if !class_dir.exists() {
            debug!("No NVMe subsystem sysfs path found at {:?}", class_dir);
            return Ok(SystemSnapshot::default());
        }

        let mut snapshot = SystemSnapshot::default();
        for (name, dir) in Self::entries(&class_dir)? {
            match self.scan_subsystem(&dir) {
                Ok(subsystem) => snapshot.subsystems.push(subsystem),
                Err(e) => warn!(subsystem = %name, error = %e, "Skipping subsystem"),
            }
        }
        Ok(snapshot)
    }
}
