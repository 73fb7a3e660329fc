//! Library Settings
//!
//! Filesystem locations and tunables used to build an `NvmeContext`.

use super::host::HostIdentitySources;
use crate::discovery::DiscoveryConfig;
use crate::transport::GatewayConfig;
use std::path::{Path, PathBuf};

/// Default location of the persisted topology
pub const DEFAULT_CONFIG_PATH: &str = "/etc/nvme/nvme-host.json";

/// Settings of the host manager
#[derive(Debug, Clone)]
pub struct LibraryConfig {
    /// Root of the sysfs mount
    pub sysfs_root: PathBuf,
    /// Directory holding the controller character devices
    pub dev_dir: PathBuf,
    /// Fabrics control device
    pub fabrics_device: PathBuf,
    pub identity: HostIdentitySources,
    /// Persisted topology document
    pub config_path: PathBuf,
    pub gateway: GatewayConfig,
    pub discovery: DiscoveryConfig,
}

impl Default for LibraryConfig {
    fn default() -> Self {
        Self {
            sysfs_root: PathBuf::from("/sys"),
            dev_dir: PathBuf::from("/dev"),
            fabrics_device: PathBuf::from("/dev/nvme-fabrics"),
            identity: HostIdentitySources::default(),
            config_path: PathBuf::from(DEFAULT_CONFIG_PATH),
            gateway: GatewayConfig::default(),
            discovery: DiscoveryConfig::default(),
        }
    }
}

impl LibraryConfig {
    /// Settings with every path placed under `root`
    pub fn under(root: &Path) -> Self {
        Self {
            sysfs_root: root.join("sys"),
            dev_dir: root.join("dev"),
            fabrics_device: root.join("dev/nvme-fabrics"),
            identity: HostIdentitySources::under(root),
            config_path: root.join(DEFAULT_CONFIG_PATH.trim_start_matches('/')),
            ..Default::default()
        }
    }

    /// Settings of the kernel passthrough
    #[cfg(target_os = "linux")]
    pub fn passthrough(&self) -> crate::transport::LinuxPassthroughConfig {
        crate::transport::LinuxPassthroughConfig {
            fabrics_device: self.fabrics_device.clone(),
            class_dir: self.sysfs_root.join("class/nvme"),
            dev_dir: self.dev_dir.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_defaults() {
        let config = LibraryConfig::default();
        assert_eq!(config.fabrics_device, PathBuf::from("/dev/nvme-fabrics"));
        assert_eq!(config.gateway.command_timeout, Duration::from_secs(30));
        assert_eq!(config.discovery.retry.max_attempts, 3);
        assert_eq!(config.discovery.genctr_retries, 3);
    }

    #[test]
    fn test_rooted_paths() {
        let config = LibraryConfig::under(Path::new("/tmp/root"));
        assert_eq!(config.sysfs_root, PathBuf::from("/tmp/root/sys"));
        assert_eq!(config.config_path, PathBuf::from("/tmp/root/etc/nvme/nvme-host.json"));
        assert_eq!(
            config.identity.hostnqn_path,
            PathBuf::from("/tmp/root/etc/nvme/hostnqn")
        );
    }
}
