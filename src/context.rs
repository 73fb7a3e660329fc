//! Host Manager Context
//!
//! Owns the shared topology, the transport gateway and the discovery engine
//! for one host. Every operation of the library goes through a context; the
//! command line front end creates exactly one.

use crate::codec::IdentifyNamespace;
use crate::config::{ConfigStore, HostIdentity, LibraryConfig};
use crate::discovery::{CancelToken, DiscoveryEngine, DiscoveryReport};
use crate::domain::{
    ControllerAddress, PassthroughRef, TargetHandle, TargetSpec, TopologySourceRef,
};
use crate::error::{DetachError, Error, ProtocolError, Result};
use crate::topology::{
    Controller, ControllerKey, DetachReport, NamespaceHandle, RescanReport, Topology,
    TopologyEvent, TopologyView,
};
use crate::transport::TransportGateway;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Entry point of the host manager
pub struct NvmeContext {
    config: LibraryConfig,
    topology: Topology,
    gateway: Arc<TransportGateway>,
    engine: DiscoveryEngine,
    source: TopologySourceRef,
    store: ConfigStore,
}

impl std::fmt::Debug for NvmeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NvmeContext")
            .field("hostnqn", &self.engine.identity().hostnqn)
            .field("config_path", &self.store.path())
            .field("gateway", &self.gateway)
            .finish()
    }
}

impl NvmeContext {
    /// Build a context over explicit ports
    pub fn new(
        config: LibraryConfig,
        identity: HostIdentity,
        passthrough: PassthroughRef,
        source: TopologySourceRef,
    ) -> Self {
        let topology = Topology::new();
        let gateway = Arc::new(TransportGateway::new(passthrough, config.gateway.clone()));
        let engine = DiscoveryEngine::new(
            Arc::clone(&gateway),
            topology.clone(),
            identity,
            config.discovery.clone(),
        );
        let store = ConfigStore::new(config.config_path.clone());
        Self {
            config,
            topology,
            gateway,
            engine,
            source,
            store,
        }
    }

    /// Build a context over the Linux NVMe driver and sysfs
    #[cfg(target_os = "linux")]
    pub fn open(config: LibraryConfig) -> Result<Self> {
        use crate::topology::SysfsSource;
        use crate::transport::LinuxPassthrough;

        let identity = HostIdentity::resolve(&config.identity)?;
        let passthrough: PassthroughRef = Arc::new(LinuxPassthrough::new(config.passthrough()));
        let source: TopologySourceRef = Arc::new(SysfsSource::new(config.sysfs_root.clone()));
        info!(
            hostnqn = %identity.hostnqn,
            sysfs = %config.sysfs_root.display(),
            "Opening NVMe host context"
        );
        Ok(Self::new(config, identity, passthrough, source))
    }

    pub fn config(&self) -> &LibraryConfig {
        &self.config
    }

    pub fn identity(&self) -> &HostIdentity {
        self.engine.identity()
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn gateway(&self) -> &Arc<TransportGateway> {
        &self.gateway
    }

    pub fn engine(&self) -> &DiscoveryEngine {
        &self.engine
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TopologyEvent> {
        self.topology.subscribe()
    }

    // =========================================================================
    // Topology
    // =========================================================================

    /// Reconcile the tree with the running system
    pub fn rescan(&self) -> Result<RescanReport> {
        self.topology.rescan(self.engine.host(), self.source.as_ref())
    }

    pub fn view(&self) -> TopologyView {
        self.topology.view()
    }

    /// Take an in-use reference on a namespace
    pub fn open_namespace(&self, subnqn: &str, nsid: u32) -> Option<NamespaceHandle> {
        self.topology.open_namespace(subnqn, nsid)
    }

    /// Refresh a namespace's size, format and ANA group from Identify
    ///
    /// Returns whether anything changed.
    pub fn refresh_namespace(&self, subnqn: &str, nsid: u32) -> Result<bool> {
        let subsystem = self
            .topology
            .find_subsystem(subnqn)
            .ok_or_else(|| Error::InvalidInput(format!("unknown subsystem {}", subnqn)))?;
        let controller = self
            .topology
            .read(|tree| {
                tree.controllers_of(subsystem.key)
                    .find(|c| c.state.is_live())
                    .cloned()
            })
            .ok_or_else(|| {
                Error::InvalidInput(format!("no connected controller for {}", subnqn))
            })?;

        let identify = self.identify_through(&controller, nsid)?;
        if identify.nsze == 0 {
            return Err(Error::InvalidInput(format!(
                "namespace {} of {} is not active",
                nsid, subnqn
            )));
        }
        let block_size =
            u32::try_from(identify.block_size()).map_err(|_| ProtocolError::MalformedData {
                structure: "identify namespace",
                reason: format!("block size {} does not fit 32 bits", identify.block_size()),
            })?;
        let ana_group_id = (identify.anagrpid != 0).then_some(identify.anagrpid);

        let changed = self.topology.write(|tree| {
            let Some(ns) = tree.ensure_namespace(subsystem.key, nsid) else {
                return false;
            };
            tree.update_namespace(ns, identify.nsze, block_size, ana_group_id)
        });
        debug!(%subnqn, nsid, changed, "Namespace refreshed");
        Ok(changed)
    }

    fn identify_through(&self, controller: &Controller, nsid: u32) -> Result<IdentifyNamespace> {
        if let Some(handle) = controller.handle.filter(|h| self.gateway.is_open(*h)) {
            return self.gateway.identify_namespace(handle, nsid);
        }
        let name = controller.name.clone().ok_or_else(|| {
            Error::InvalidInput(format!("controller {} has no device", controller.label()))
        })?;
        let handle = self
            .gateway
            .open(&TargetSpec::existing(controller.address.clone(), name))?;
        let result = self.gateway.identify_namespace(handle, nsid);
        self.close_quietly(handle);
        result
    }

    fn close_quietly(&self, handle: TargetHandle) {
        if let Err(e) = self.gateway.close(handle, false) {
            debug!(%handle, error = %e, "Failed to close handle");
        }
    }

    // =========================================================================
    // Discovery / Connect
    // =========================================================================

    pub fn discover(&self, address: &ControllerAddress, cancel: &CancelToken) -> Result<DiscoveryReport> {
        self.engine.discover(address, cancel)
    }

    pub fn connect(
        &self,
        address: &ControllerAddress,
        subnqn: &str,
        cancel: &CancelToken,
    ) -> Result<Controller> {
        self.engine.connect(address, subnqn, cancel)
    }

    pub fn disconnect(&self, controller: ControllerKey, force: bool) -> Result<DetachReport> {
        self.engine.disconnect(controller, force)
    }

    /// Disconnect a controller by kernel instance name
    pub fn disconnect_device(&self, name: &str, force: bool) -> Result<DetachReport> {
        let key = self
            .topology
            .read(|tree| tree.find_controller_by_name(name).map(|c| c.key))
            .ok_or_else(|| DetachError::NotFound {
                controller: name.to_string(),
            })?;
        self.engine.disconnect(key, force)
    }

    /// Disconnect every controller of a subsystem
    ///
    /// Stops at the first refusal; controllers already disconnected stay
    /// disconnected.
    pub fn disconnect_subsystem(&self, subnqn: &str, force: bool) -> Result<Vec<DetachReport>> {
        let keys: Vec<ControllerKey> = self
            .topology
            .find_subsystem(subnqn)
            .map(|s| s.controllers)
            .ok_or_else(|| DetachError::NotFound {
                controller: subnqn.to_string(),
            })?;
        let mut reports = Vec::with_capacity(keys.len());
        for key in keys {
            reports.push(self.engine.disconnect(key, force)?);
        }
        info!(%subnqn, controllers = reports.len(), "Subsystem disconnected");
        Ok(reports)
    }

    // =========================================================================
    // Configuration
    // =========================================================================

    /// Replace the tree with the saved configuration, if any
    pub fn load_config(&self) -> Result<bool> {
        Ok(self.store.load_into(&self.topology)?)
    }

    pub fn save_config(&self) -> Result<()> {
        Ok(self.store.save_from(&self.topology)?)
    }

    /// Close every handle this context holds, leaving controllers connected
    pub fn release(&self) {
        self.engine.release();
        if self.gateway.open_handles() > 0 {
            warn!(open = self.gateway.open_handles(), "Handles still open after release");
        }
    }
}
