//! Discovery Engine
//!
//! Reads discovery logs and establishes controller connections through the
//! transport gateway, recording each live controller in the topology.
//! Every connection is driven by a `ConnectionStateMachine`; Connect is
//! retried with the configured backoff only for retryable outcomes.

use super::retry::{CancelToken, RetryPolicy};
use super::state::{ConnectionStateMachine, DiscoveryState, FailureReason};
use crate::codec::fabrics::{self, ConnectData, ConnectParams, ConnectResponse};
use crate::codec::{DiscoveryLog, DiscoveryLogHeader, SkippedEntry, DISCOVERY_LOG_HEADER_SIZE};
use crate::config::HostIdentity;
use crate::domain::{
    ControllerAddress, DataBuffer, SubsystemType, TargetHandle, TargetSpec, DISCOVERY_NQN,
};
use crate::error::{AttachError, DetachError, Error, ProtocolError, Result};
use crate::topology::{
    Controller, ControllerKey, ControllerOrigin, ControllerSpec, ControllerState, DetachReport,
    HostKey, Topology,
};
use crate::transport::TransportGateway;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

// =============================================================================
// Configuration
// =============================================================================

/// Discovery and connect settings
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    pub retry: RetryPolicy,
    /// Extra log reads allowed when the generation counter moves mid-read
    pub genctr_retries: u32,
    /// Keep the discovery controller connected after reading its log
    pub persistent: bool,
    /// Keep alive timeout for I/O controllers, in milliseconds
    pub keep_alive_ms: u32,
    /// Keep alive timeout for persistent discovery controllers, in milliseconds
    pub discovery_keep_alive_ms: u32,
    /// Admin queue entries requested in Connect
    pub admin_queue_size: u16,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            genctr_retries: 3,
            persistent: false,
            keep_alive_ms: 120_000,
            discovery_keep_alive_ms: 30_000,
            admin_queue_size: 32,
        }
    }
}

// =============================================================================
// Reports
// =============================================================================

/// What happened to one discovery log entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum EntryOutcome {
    Connected {
        controller: String,
        cntlid: u16,
        attempts: u32,
    },
    /// The controller was already attached; nothing was sent
    AlreadyConnected { controller: String },
    Failed {
        reason: FailureReason,
        attempts: u32,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntryReport {
    pub subnqn: String,
    pub address: ControllerAddress,
    #[serde(flatten)]
    pub outcome: EntryOutcome,
}

/// Result of one discovery session
#[derive(Debug, Clone, Serialize)]
pub struct DiscoveryReport {
    pub discovery_address: ControllerAddress,
    pub genctr: u64,
    pub numrec: u64,
    pub entries: Vec<EntryReport>,
    pub skipped: Vec<SkippedEntry>,
    /// Other discovery controllers advertised by the log
    pub referrals: Vec<ControllerAddress>,
    pub cancelled: bool,
    pub completed_at: DateTime<Utc>,
}

impl DiscoveryReport {
    pub fn connected(&self) -> usize {
        self.count(|o| matches!(o, EntryOutcome::Connected { .. }))
    }

    pub fn already_connected(&self) -> usize {
        self.count(|o| matches!(o, EntryOutcome::AlreadyConnected { .. }))
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, EntryOutcome::Failed { .. }))
    }

    fn count(&self, f: impl Fn(&EntryOutcome) -> bool) -> usize {
        self.entries.iter().filter(|e| f(&e.outcome)).count()
    }
}

impl std::fmt::Display for DiscoveryReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "Discovery log from {} (generation {}, {} records)",
            self.discovery_address, self.genctr, self.numrec
        )?;
        for entry in &self.entries {
            match &entry.outcome {
                EntryOutcome::Connected { controller, .. } => writeln!(
                    f,
                    "  connected  {} {} as {}",
                    entry.subnqn, entry.address, controller
                )?,
                EntryOutcome::AlreadyConnected { controller } => writeln!(
                    f,
                    "  existing   {} {} as {}",
                    entry.subnqn, entry.address, controller
                )?,
                EntryOutcome::Failed { reason, .. } => writeln!(
                    f,
                    "  failed     {} {}: {}",
                    entry.subnqn, entry.address, reason
                )?,
            }
        }
        for skipped in &self.skipped {
            writeln!(f, "  skipped    record {}: {}", skipped.index, skipped.reason)?;
        }
        for referral in &self.referrals {
            writeln!(f, "  referral   {}", referral)?;
        }
        if self.cancelled {
            writeln!(f, "  (cancelled)")?;
        }
        Ok(())
    }
}

// =============================================================================
// Engine
// =============================================================================

/// A Connect that succeeded on the wire
struct Established {
    handle: TargetHandle,
    cntlid: u16,
    device: Option<String>,
}

/// An open discovery controller
struct DiscoverySession {
    handle: TargetHandle,
    /// Left open when the session ends
    keep: bool,
}

/// Discovers and connects NVMe over Fabrics controllers
pub struct DiscoveryEngine {
    gateway: Arc<TransportGateway>,
    topology: Topology,
    identity: HostIdentity,
    config: DiscoveryConfig,
}

impl std::fmt::Debug for DiscoveryEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscoveryEngine")
            .field("hostnqn", &self.identity.hostnqn)
            .field("config", &self.config)
            .finish()
    }
}

impl DiscoveryEngine {
    pub fn new(
        gateway: Arc<TransportGateway>,
        topology: Topology,
        identity: HostIdentity,
        config: DiscoveryConfig,
    ) -> Self {
        let engine = Self {
            gateway,
            topology,
            identity,
            config,
        };
        engine.host();
        engine
    }

    pub fn identity(&self) -> &HostIdentity {
        &self.identity
    }

    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    /// Key of this host in the topology, registering it when absent
    pub fn host(&self) -> HostKey {
        self.topology
            .write(|tree| tree.add_host(&self.identity.hostnqn, self.identity.hostid))
    }

    // =========================================================================
    // Discovery
    // =========================================================================

    /// Read the discovery log at `address` and connect every NVM entry
    ///
    /// Entries already attached are left alone; a new address for a known
    /// subsystem becomes an additional path. Per-entry failures are reported,
    /// not returned.
    pub fn discover(&self, address: &ControllerAddress, cancel: &CancelToken) -> Result<DiscoveryReport> {
        address.validate().map_err(Error::InvalidInput)?;
        if cancel.is_cancelled() {
            return Err(Error::Cancelled {
                target: address.to_string(),
            });
        }
        info!(discovery = %address, "Starting discovery");

        let mut session = ConnectionStateMachine::new();
        session.advance(DiscoveryState::LogRequested);

        let discovery = match self.open_discovery(address, cancel) {
            Ok(discovery) => discovery,
            Err(e) => {
                session.fail(failure_reason(&e));
                return Err(e);
            }
        };
        let log = match self.read_log(discovery.handle) {
            Ok(log) => log,
            Err(e) => {
                session.fail(FailureReason::Log {
                    message: e.to_string(),
                });
                self.end_discovery(&discovery);
                return Err(e);
            }
        };
        session.advance(DiscoveryState::LogReceived);
        info!(
            discovery = %address,
            genctr = log.header.genctr,
            numrec = log.header.numrec,
            skipped = log.skipped.len(),
            "Discovery log received"
        );
        for skipped in &log.skipped {
            warn!(discovery = %address, index = skipped.index, reason = %skipped.reason, "Skipping discovery log entry");
        }

        let mut report = DiscoveryReport {
            discovery_address: address.clone(),
            genctr: log.header.genctr,
            numrec: log.header.numrec,
            entries: Vec::new(),
            skipped: log.skipped.clone(),
            referrals: Vec::new(),
            cancelled: false,
            completed_at: Utc::now(),
        };

        for entry in &log.entries {
            let entry_address = inherit_host_side(entry.address(), address);
            match entry.subtype {
                SubsystemType::Discovery => {
                    debug!(referral = %entry_address, "Discovery referral");
                    report.referrals.push(entry_address);
                    continue;
                }
                SubsystemType::CurrentDiscovery => continue,
                SubsystemType::Nvm => {}
            }
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }

            let mut machine = session.clone();
            let outcome = self.connect_entry(&mut machine, &entry.subnqn, &entry_address, cancel);
            report.cancelled = machine.failure() == Some(&FailureReason::Cancelled);
            report.entries.push(EntryReport {
                subnqn: entry.subnqn.clone(),
                address: entry_address,
                outcome,
            });
            if report.cancelled {
                break;
            }
        }

        self.end_discovery(&discovery);
        report.completed_at = Utc::now();
        info!(
            discovery = %address,
            connected = report.connected(),
            existing = report.already_connected(),
            failed = report.failed(),
            skipped = report.skipped.len(),
            "Discovery finished"
        );
        Ok(report)
    }

    /// Connect to a discovery controller, or reuse a persistent one
    fn open_discovery(&self, address: &ControllerAddress, cancel: &CancelToken) -> Result<DiscoverySession> {
        let existing = self.topology.read(|tree| {
            tree.find_controller(address)
                .filter(|c| {
                    tree.subsystem(c.subsystem)
                        .is_some_and(|s| s.subtype != SubsystemType::Nvm)
                })
                .and_then(|c| c.handle)
        });
        if let Some(handle) = existing.filter(|h| self.gateway.is_open(*h)) {
            debug!(discovery = %address, %handle, "Reusing persistent discovery controller");
            return Ok(DiscoverySession { handle, keep: true });
        }

        let kato = if self.config.persistent {
            self.config.discovery_keep_alive_ms
        } else {
            0
        };
        let mut machine = ConnectionStateMachine::new();
        let established = self.establish(&mut machine, DISCOVERY_NQN, address, kato, cancel)?;

        if self.config.persistent {
            match self.register(DISCOVERY_NQN, SubsystemType::Discovery, address, &established, None) {
                Ok(controller) => {
                    machine.advance(DiscoveryState::Connected);
                    info!(discovery = %address, controller = %controller.label(), "Persistent discovery controller attached");
                    return Ok(DiscoverySession {
                        handle: established.handle,
                        keep: true,
                    });
                }
                Err(e) => {
                    warn!(discovery = %address, error = %e, "Discovery controller not tracked, using it once");
                }
            }
        }
        machine.advance(DiscoveryState::Connected);
        Ok(DiscoverySession {
            handle: established.handle,
            keep: false,
        })
    }

    fn end_discovery(&self, discovery: &DiscoverySession) {
        if discovery.keep {
            return;
        }
        if let Err(e) = self.gateway.close(discovery.handle, true) {
            warn!(handle = %discovery.handle, error = %e, "Failed to release discovery controller");
        }
    }

    /// Read a consistent discovery log
    ///
    /// The header is re-read after the full log; a generation counter that
    /// moved in between forces another read.
    fn read_log(&self, handle: TargetHandle) -> Result<DiscoveryLog> {
        let mut header = self.read_header(handle)?;
        let first = header.genctr;

        for attempt in 0..=self.config.genctr_retries {
            let len = header.log_len().ok_or_else(|| ProtocolError::MalformedData {
                structure: "discovery log",
                reason: format!("{} records exceed the addressable log size", header.numrec),
            })?;
            let log = DiscoveryLog::parse(&self.gateway.get_discovery_log(handle, len)?)?;
            let check = self.read_header(handle)?;
            if log.header.genctr == header.genctr && check.genctr == header.genctr {
                return Ok(log);
            }
            debug!(
                attempt,
                from = header.genctr,
                to = check.genctr,
                "Discovery log changed while reading"
            );
            header = check;
        }

        Err(ProtocolError::LogGenerationUnstable {
            first,
            last: header.genctr,
        }
        .into())
    }

    fn read_header(&self, handle: TargetHandle) -> Result<DiscoveryLogHeader> {
        let data = self.gateway.get_discovery_log(handle, DISCOVERY_LOG_HEADER_SIZE)?;
        Ok(DiscoveryLogHeader::parse(&data)?)
    }

    fn connect_entry(
        &self,
        machine: &mut ConnectionStateMachine,
        subnqn: &str,
        address: &ControllerAddress,
        cancel: &CancelToken,
    ) -> EntryOutcome {
        match self.connect_with(machine, subnqn, address, cancel) {
            Ok(controller) => EntryOutcome::Connected {
                controller: controller.label(),
                cntlid: controller.cntlid.unwrap_or_default(),
                attempts: machine.attempts(),
            },
            Err(Error::Attach(AttachError::Duplicate { .. })) if machine.attempts() == 0 => {
                let controller = self
                    .topology
                    .find_controller(address)
                    .map_or_else(|| address.to_string(), |c| c.label());
                debug!(%subnqn, %controller, "Entry already connected");
                EntryOutcome::AlreadyConnected { controller }
            }
            Err(e) => {
                warn!(%subnqn, endpoint = %address, error = %e, "Failed to connect discovery entry");
                EntryOutcome::Failed {
                    reason: machine
                        .failure()
                        .cloned()
                        .unwrap_or_else(|| failure_reason(&e)),
                    attempts: machine.attempts(),
                }
            }
        }
    }

    // =========================================================================
    // Connect
    // =========================================================================

    /// Connect one controller of `subnqn` at `address` and attach it
    ///
    /// Connecting an address that is already attached to the subsystem
    /// fails with `AttachError::Duplicate` without sending anything.
    pub fn connect(
        &self,
        address: &ControllerAddress,
        subnqn: &str,
        cancel: &CancelToken,
    ) -> Result<Controller> {
        address.validate().map_err(Error::InvalidInput)?;
        fabrics::validate_nqn("subnqn", subnqn)?;
        if cancel.is_cancelled() {
            return Err(Error::Cancelled {
                target: address.to_string(),
            });
        }
        let mut machine = ConnectionStateMachine::new();
        self.connect_with(&mut machine, subnqn, address, cancel)
    }

    fn connect_with(
        &self,
        machine: &mut ConnectionStateMachine,
        subnqn: &str,
        address: &ControllerAddress,
        cancel: &CancelToken,
    ) -> Result<Controller> {
        let host = self.host();
        let existing = self.topology.read(|tree| {
            tree.find_subsystem_in(host, subnqn).and_then(|sub| {
                tree.controllers_of(sub.key)
                    .find(|c| &c.address == address)
                    .map(|c| (c.key, c.state))
            })
        });
        // Only a restored, never-connected entry may be connected again
        let restored = match existing {
            Some((key, ControllerState::Disconnected)) => Some(key),
            Some(_) => {
                return Err(AttachError::Duplicate {
                    subnqn: subnqn.to_string(),
                    address: address.to_string(),
                }
                .into())
            }
            None => None,
        };

        let subtype = if subnqn == DISCOVERY_NQN {
            SubsystemType::Discovery
        } else {
            SubsystemType::Nvm
        };
        let established =
            self.establish(machine, subnqn, address, self.config.keep_alive_ms, cancel)?;
        match self.register(subnqn, subtype, address, &established, restored) {
            Ok(controller) => {
                machine.advance(DiscoveryState::Connected);
                info!(
                    %subnqn,
                    endpoint = %address,
                    controller = %controller.label(),
                    cntlid = established.cntlid,
                    attempts = machine.attempts(),
                    "Controller connected"
                );
                Ok(controller)
            }
            Err(e) => {
                machine.fail(failure_reason(&e));
                Err(e)
            }
        }
    }

    /// Issue Connect until it succeeds, fails for good or runs out of attempts
    ///
    /// Leaves the machine in `Connecting` on success so the caller can
    /// record the controller before declaring it connected.
    fn establish(
        &self,
        machine: &mut ConnectionStateMachine,
        subnqn: &str,
        address: &ControllerAddress,
        kato: u32,
        cancel: &CancelToken,
    ) -> Result<Established> {
        let mut handle = None;
        loop {
            let attempt = machine.begin_attempt();
            let error = match self.try_connect(&mut handle, subnqn, address, kato) {
                Ok(established) => return Ok(established),
                Err(e) => e,
            };

            if !error.is_retryable() {
                warn!(%subnqn, endpoint = %address, attempt, error = %error, "Connect failed");
                self.discard(handle);
                machine.fail(failure_reason(&error));
                return Err(error);
            }
            if !self.config.retry.allows_retry(attempt) {
                warn!(%subnqn, endpoint = %address, attempts = attempt, error = %error, "Connect retries exhausted");
                self.discard(handle);
                machine.fail(FailureReason::RetriesExhausted { attempts: attempt });
                return Err(Error::RetriesExhausted {
                    target: address.to_string(),
                    subnqn: subnqn.to_string(),
                    attempts: attempt,
                    last: Box::new(error),
                });
            }

            let delay = self.config.retry.delay_for(attempt);
            warn!(
                %subnqn,
                endpoint = %address,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Connect failed, retrying"
            );
            if !cancel.wait(delay) {
                info!(%subnqn, endpoint = %address, "Connect cancelled");
                self.discard(handle);
                machine.fail(FailureReason::Cancelled);
                return Err(Error::Cancelled {
                    target: address.to_string(),
                });
            }
        }
    }

    fn try_connect(
        &self,
        handle: &mut Option<TargetHandle>,
        subnqn: &str,
        address: &ControllerAddress,
        kato: u32,
    ) -> Result<Established> {
        let data = ConnectData::new(self.identity.hostid, subnqn, self.identity.hostnqn.clone());
        let params = ConnectParams::admin(self.config.admin_queue_size.saturating_sub(1), kato);
        let (command, payload) = fabrics::connect(params, &data)?;

        let current = match *handle {
            Some(current) => current,
            None => {
                let opened = self.gateway.open(&TargetSpec::new(address.clone()))?;
                *handle = Some(opened);
                opened
            }
        };
        let completion = self
            .gateway
            .submit(current, command, DataBuffer::ToDevice(&payload))?;
        if !completion.status.is_success() {
            return Err(self.gateway.command_error(current, command.opcode, &completion));
        }

        Ok(Established {
            handle: current,
            cntlid: ConnectResponse::from_completion(&completion).cntlid,
            device: self.gateway.device_name(current),
        })
    }

    /// Release the handle of an abandoned Connect
    fn discard(&self, handle: Option<TargetHandle>) {
        if let Some(handle) = handle {
            if let Err(e) = self.gateway.close(handle, false) {
                debug!(%handle, error = %e, "Failed to release handle");
            }
        }
    }

    /// Record an established connection in the topology
    ///
    /// The connection is torn down again when the topology refuses it.
    fn register(
        &self,
        subnqn: &str,
        subtype: SubsystemType,
        address: &ControllerAddress,
        established: &Established,
        restored: Option<ControllerKey>,
    ) -> Result<Controller> {
        let host = self.host();
        let attached = self.topology.write(|tree| -> std::result::Result<Controller, AttachError> {
            if let Some(key) = restored {
                return tree
                    .bind_controller(key, established.device.clone(), established.cntlid, established.handle)
                    .cloned();
            }
            let sub = tree.ensure_subsystem(host, subnqn, subtype)?;
            let mut spec = ControllerSpec::new(address.clone(), ControllerOrigin::Connected)
                .with_cntlid(established.cntlid)
                .with_handle(established.handle);
            if let Some(device) = &established.device {
                spec = spec.with_name(device.clone());
            }
            let attached = tree.attach_controller(sub, spec).cloned();
            if attached.is_err()
                && tree
                    .subsystem(sub)
                    .is_some_and(|s| s.controllers.is_empty() && s.namespaces.is_empty())
            {
                tree.remove_subsystem(sub);
            }
            attached
        });

        attached.map_err(|e| {
            warn!(%subnqn, endpoint = %address, error = %e, "Topology refused controller, disconnecting");
            if let Err(close) = self.gateway.close(established.handle, true) {
                warn!(handle = %established.handle, error = %close, "Failed to delete refused controller");
            }
            e.into()
        })
    }

    // =========================================================================
    // Disconnect
    // =========================================================================

    /// Detach a controller and delete its connection
    ///
    /// The topology is checked first, so a controller that is the last path
    /// to an in-use namespace stays connected unless `force` is set. The
    /// controller leaves the tree only after its association is torn down.
    pub fn disconnect(&self, key: ControllerKey, force: bool) -> Result<DetachReport> {
        let controller = self.topology.read(|tree| -> std::result::Result<Controller, DetachError> {
            tree.check_detach(key, force)?;
            tree.controller(key).cloned().ok_or_else(|| DetachError::NotFound {
                controller: key.to_string(),
            })
        })?;

        if let Err(e) = self.teardown(&controller) {
            warn!(controller = %controller.label(), error = %e, "Teardown failed, controller kept");
            return Err(e);
        }

        let report = match self.topology.detach_controller(key, force) {
            Ok(report) => report,
            Err(e) => {
                // A handle was taken after the check; the association is gone
                self.topology.write(|tree| {
                    tree.set_controller_state(key, ControllerState::Disconnected);
                    tree.set_controller_handle(key, None);
                });
                return Err(e.into());
            }
        };
        info!(
            controller = %report.controller,
            subnqn = %report.subnqn,
            removed_namespaces = report.removed_namespaces.len(),
            "Controller disconnected"
        );
        Ok(report)
    }

    fn teardown(&self, controller: &Controller) -> Result<()> {
        if controller.state == ControllerState::Disconnected {
            return Ok(());
        }

        if let Some(handle) = controller.handle.filter(|h| self.gateway.is_open(*h)) {
            self.gateway.close(handle, true)?;
        } else if let Some(name) = &controller.name {
            // Controllers found by a scan are deleted through their device
            let handle = self
                .gateway
                .open(&TargetSpec::existing(controller.address.clone(), name.clone()))?;
            if let Err(e) = self.gateway.close(handle, true) {
                if self.gateway.close(handle, false).is_err() {
                    debug!(%handle, "Could not release teardown handle");
                }
                return Err(e);
            }
        }
        Ok(())
    }

    /// Close every handle held by attached controllers without deleting them
    pub fn release(&self) {
        let handles: Vec<TargetHandle> = self.topology.write(|tree| {
            let keys: Vec<(ControllerKey, TargetHandle)> = tree
                .controllers()
                .filter_map(|c| c.handle.map(|h| (c.key, h)))
                .collect();
            for (key, _) in &keys {
                tree.set_controller_handle(*key, None);
            }
            keys.into_iter().map(|(_, h)| h).collect()
        });
        for handle in handles {
            if let Err(e) = self.gateway.close(handle, false) {
                debug!(%handle, error = %e, "Failed to release handle");
            }
        }
    }
}

/// Entries inherit the host-side selectors of the discovery connection
fn inherit_host_side(mut entry: ControllerAddress, discovery: &ControllerAddress) -> ControllerAddress {
    if entry.host_traddr.is_none() {
        entry.host_traddr.clone_from(&discovery.host_traddr);
    }
    if entry.host_iface.is_none() {
        entry.host_iface.clone_from(&discovery.host_iface);
    }
    entry
}

fn failure_reason(error: &Error) -> FailureReason {
    match error {
        Error::Command { status, .. } => FailureReason::Rejected { status: *status },
        Error::Cancelled { .. } => FailureReason::Cancelled,
        Error::RetriesExhausted { attempts, .. } => FailureReason::RetriesExhausted {
            attempts: *attempts,
        },
        Error::Attach(e) => FailureReason::Attach {
            message: e.to_string(),
        },
        other => FailureReason::Transport {
            message: other.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::completion::command_specific;
    use crate::codec::{
        build_discovery_log, AdminOpcode, DiscoveryLogEntry, FabricsCommandType, Opcode, SkipReason,
        StatusCodeType, StatusField,
    };
    use crate::domain::TransportType;
    use crate::error::TransportError;
    use crate::topology::AnaState;
    use crate::transport::{GatewayConfig, SimResponse, SimulatedPassthrough};
    use assert_matches::assert_matches;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use uuid::Uuid;

    const SUBSYS_A: &str = "nqn.2014-08.org.example:subsys-a";
    const SUBSYS_B: &str = "nqn.2014-08.org.example:subsys-b";

    fn tcp(traddr: &str, trsvcid: &str) -> ControllerAddress {
        ControllerAddress::new(TransportType::Tcp, traddr).with_trsvcid(trsvcid)
    }

    fn discovery_address() -> ControllerAddress {
        tcp("10.0.0.100", "8009")
    }

    fn setup(config: DiscoveryConfig) -> (Arc<SimulatedPassthrough>, DiscoveryEngine) {
        let sim = Arc::new(SimulatedPassthrough::new());
        let gateway = Arc::new(TransportGateway::new(sim.clone(), GatewayConfig::default()));
        let identity = HostIdentity::from_uuid(Uuid::from_u128(0x1234));
        let engine = DiscoveryEngine::new(gateway, Topology::new(), identity, config);
        (sim, engine)
    }

    fn fast_config() -> DiscoveryConfig {
        DiscoveryConfig {
            retry: RetryPolicy::immediate(3),
            ..Default::default()
        }
    }

    fn connect_calls(sim: &SimulatedPassthrough, address: &ControllerAddress) -> usize {
        sim.calls_to(address)
            .iter()
            .filter(|c| c.opcode == Opcode::Fabrics(FabricsCommandType::Connect))
            .count()
    }

    fn busy() -> StatusField {
        StatusField::new(StatusCodeType::CommandSpecific, command_specific::CONNECT_CONTROLLER_BUSY)
    }

    #[test]
    fn test_discover_connects_valid_entries() {
        let (sim, engine) = setup(fast_config());
        let mut log = build_discovery_log(
            7,
            &[
                DiscoveryLogEntry::nvm(TransportType::Tcp, SUBSYS_A, "10.0.0.1", "4420"),
                DiscoveryLogEntry::nvm(TransportType::Tcp, SUBSYS_B, "10.0.0.2", "4420"),
                DiscoveryLogEntry::nvm(TransportType::Tcp, SUBSYS_B, "10.0.0.3", "4420"),
            ],
        );
        // corrupt the transport type of the third record
        log[DISCOVERY_LOG_HEADER_SIZE + 2 * 1024] = 0xee;
        sim.set_discovery_log(&discovery_address(), log);

        let report = engine.discover(&discovery_address(), &CancelToken::new()).unwrap();
        assert_eq!(report.genctr, 7);
        assert_eq!(report.numrec, 3);
        assert_eq!(report.connected(), 2);
        assert_eq!(
            report.skipped,
            vec![SkippedEntry {
                index: 2,
                reason: SkipReason::UnknownTransport(0xee),
            }]
        );
        assert!(!report.cancelled);

        let a = engine.topology.find_subsystem(SUBSYS_A).unwrap();
        let b = engine.topology.find_subsystem(SUBSYS_B).unwrap();
        assert_eq!(a.controllers.len(), 1);
        assert_eq!(b.controllers.len(), 1);
        assert!(engine.topology.find_subsystem(DISCOVERY_NQN).is_none());

        // only the discovery controller was released
        assert_eq!(sim.closed(), vec![(TargetHandle(1), true)]);
        assert_eq!(sim.open_handles(), 2);
    }

    #[test]
    fn test_discover_skips_truncated_record() {
        let (sim, engine) = setup(fast_config());
        let mut log = build_discovery_log(
            4,
            &[
                DiscoveryLogEntry::nvm(TransportType::Tcp, "nqn.test-1", "10.0.0.1", "4420"),
                DiscoveryLogEntry::nvm(TransportType::Tcp, "nqn.test-2", "10.0.0.2", "4420"),
                DiscoveryLogEntry::nvm(TransportType::Tcp, "nqn.test-3", "10.0.0.3", "4420"),
            ],
        );
        // the controller holds only part of the third record
        log.truncate(DISCOVERY_LOG_HEADER_SIZE + 2 * 1024 + 100);
        sim.set_discovery_log(&discovery_address(), log);

        let report = engine.discover(&discovery_address(), &CancelToken::new()).unwrap();
        assert_eq!(report.numrec, 3);
        assert_eq!(report.connected(), 2);
        assert_eq!(
            report.skipped,
            vec![SkippedEntry {
                index: 2,
                reason: SkipReason::Truncated { available: 0 },
            }]
        );

        assert_eq!(engine.topology.find_subsystem("nqn.test-1").unwrap().controllers.len(), 1);
        assert_eq!(engine.topology.find_subsystem("nqn.test-2").unwrap().controllers.len(), 1);
        assert!(engine.topology.find_subsystem("nqn.test-3").is_none());
        assert_eq!(
            engine.topology.read(|tree| tree
                .controllers()
                .filter(|c| c.state == ControllerState::Connected)
                .count()),
            2
        );
        engine.topology.read(|tree| tree.check_invariants()).unwrap();
        assert_eq!(connect_calls(&sim, &tcp("10.0.0.3", "4420")), 0);
    }

    #[test]
    fn test_empty_log() {
        let (sim, engine) = setup(fast_config());
        sim.set_discovery_log(&discovery_address(), build_discovery_log(1, &[]));

        let report = engine.discover(&discovery_address(), &CancelToken::new()).unwrap();
        assert!(report.entries.is_empty());
        assert!(report.skipped.is_empty());
        assert!(engine.topology.read(|tree| tree.subsystems().next().is_none()));
    }

    #[test]
    fn test_rediscovery_is_noop() {
        let (sim, engine) = setup(fast_config());
        let target = tcp("10.0.0.1", "4420");
        sim.set_discovery_log(
            &discovery_address(),
            build_discovery_log(
                1,
                &[DiscoveryLogEntry::nvm(TransportType::Tcp, SUBSYS_A, "10.0.0.1", "4420")],
            ),
        );

        engine.discover(&discovery_address(), &CancelToken::new()).unwrap();
        let report = engine.discover(&discovery_address(), &CancelToken::new()).unwrap();

        assert_eq!(report.already_connected(), 1);
        assert_eq!(connect_calls(&sim, &target), 1);
        assert_eq!(engine.topology.find_subsystem(SUBSYS_A).unwrap().controllers.len(), 1);
    }

    #[test]
    fn test_new_address_adds_path() {
        let (sim, engine) = setup(fast_config());
        sim.set_discovery_log(
            &discovery_address(),
            build_discovery_log(
                1,
                &[
                    DiscoveryLogEntry::nvm(TransportType::Tcp, SUBSYS_A, "10.0.0.1", "4420"),
                    DiscoveryLogEntry::nvm(TransportType::Tcp, SUBSYS_A, "10.0.1.1", "4420"),
                ],
            ),
        );

        let report = engine.discover(&discovery_address(), &CancelToken::new()).unwrap();
        assert_eq!(report.connected(), 2);
        let sub = engine.topology.find_subsystem(SUBSYS_A).unwrap();
        assert_eq!(sub.controllers.len(), 2);
        engine.topology.read(|tree| tree.check_invariants()).unwrap();
    }

    #[test]
    fn test_referrals_and_host_side_inherited() {
        let (sim, engine) = setup(fast_config());
        let mut referral = DiscoveryLogEntry::nvm(TransportType::Tcp, DISCOVERY_NQN, "10.0.0.101", "8009");
        referral.subtype = SubsystemType::Discovery;
        let discovery = discovery_address().with_host_traddr("10.0.0.200");
        sim.set_discovery_log(
            &discovery,
            build_discovery_log(
                1,
                &[
                    referral,
                    DiscoveryLogEntry::nvm(TransportType::Tcp, SUBSYS_A, "10.0.0.1", "4420"),
                ],
            ),
        );

        let report = engine.discover(&discovery, &CancelToken::new()).unwrap();
        assert_eq!(report.referrals.len(), 1);
        assert_eq!(report.referrals[0].traddr, "10.0.0.101");
        assert_eq!(report.entries.len(), 1);

        let attached = engine
            .topology
            .find_controller(&tcp("10.0.0.1", "4420").with_host_traddr("10.0.0.200"))
            .unwrap();
        assert_eq!(attached.origin, ControllerOrigin::Connected);
    }

    #[test]
    fn test_connect_retries_retryable_status() {
        let (sim, engine) = setup(fast_config());
        let target = tcp("10.0.0.1", "4420");
        sim.push_connect_status(&target, busy());
        sim.push_connect_status(&target, busy());

        let controller = engine.connect(&target, SUBSYS_A, &CancelToken::new()).unwrap();
        assert_eq!(connect_calls(&sim, &target), 3);
        assert_eq!(controller.state, ControllerState::Connected);
        assert_eq!(controller.cntlid, Some(1));
        assert!(controller.name.is_some());
    }

    #[test]
    fn test_connect_retries_transport_timeout() {
        let (sim, engine) = setup(fast_config());
        let target = tcp("10.0.0.1", "4420");
        sim.push_connect_failure(
            &target,
            TransportError::Timeout {
                target: target.to_string(),
                opcode: "connect".into(),
            },
        );

        engine.connect(&target, SUBSYS_A, &CancelToken::new()).unwrap();
        assert_eq!(connect_calls(&sim, &target), 2);
    }

    #[test]
    fn test_fatal_status_not_retried() {
        let (sim, engine) = setup(fast_config());
        let target = tcp("10.0.0.1", "4420");
        let rejected = StatusField::new(StatusCodeType::CommandSpecific, command_specific::CONNECT_INVALID_HOST)
            .with_dnr(true);
        sim.push_connect_status(&target, rejected);

        let err = engine.connect(&target, SUBSYS_A, &CancelToken::new()).unwrap_err();
        assert_matches!(err, Error::Command { status, .. } if status == rejected);
        assert_eq!(connect_calls(&sim, &target), 1);
        assert!(engine.topology.find_subsystem(SUBSYS_A).is_none());
        assert_eq!(sim.open_handles(), 0);
    }

    #[test]
    fn test_retries_exhausted() {
        let (sim, engine) = setup(fast_config());
        let target = tcp("10.0.0.1", "4420");
        sim.set_unreachable(&target);

        let err = engine.connect(&target, SUBSYS_A, &CancelToken::new()).unwrap_err();
        assert_matches!(err, Error::RetriesExhausted { attempts: 3, .. });
        assert_eq!(connect_calls(&sim, &target), 3);
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn test_failed_entry_reported() {
        let (sim, engine) = setup(fast_config());
        sim.set_discovery_log(
            &discovery_address(),
            build_discovery_log(
                1,
                &[
                    DiscoveryLogEntry::nvm(TransportType::Tcp, SUBSYS_A, "10.0.0.1", "4420"),
                    DiscoveryLogEntry::nvm(TransportType::Tcp, SUBSYS_B, "10.0.0.2", "4420"),
                ],
            ),
        );
        sim.set_unreachable(&tcp("10.0.0.1", "4420"));

        let report = engine.discover(&discovery_address(), &CancelToken::new()).unwrap();
        assert_eq!(report.connected(), 1);
        assert_matches!(
            report.entries[0].outcome,
            EntryOutcome::Failed {
                reason: FailureReason::RetriesExhausted { attempts: 3 },
                attempts: 3
            }
        );
    }

    #[test]
    fn test_cancel_between_attempts() {
        let config = DiscoveryConfig {
            retry: RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_secs(30),
            },
            ..Default::default()
        };
        let (sim, engine) = setup(config);
        let target = tcp("10.0.0.1", "4420");
        sim.push_connect_status(&target, busy());

        let cancel = CancelToken::new();
        let remote = cancel.clone();
        let canceller = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            remote.cancel();
        });

        let err = engine.connect(&target, SUBSYS_A, &cancel).unwrap_err();
        canceller.join().unwrap();
        assert_matches!(err, Error::Cancelled { .. });
        assert_eq!(connect_calls(&sim, &target), 1);
        assert_eq!(sim.open_handles(), 0);

        // a cancelled token stops discovery before anything is sent
        assert_matches!(
            engine.discover(&discovery_address(), &cancel),
            Err(Error::Cancelled { .. })
        );
    }

    #[test]
    fn test_genctr_change_rereads_log() {
        let (sim, engine) = setup(fast_config());
        let first = build_discovery_log(
            1,
            &[DiscoveryLogEntry::nvm(TransportType::Tcp, SUBSYS_A, "10.0.0.1", "4420")],
        );
        let second = build_discovery_log(
            2,
            &[
                DiscoveryLogEntry::nvm(TransportType::Tcp, SUBSYS_A, "10.0.0.1", "4420"),
                DiscoveryLogEntry::nvm(TransportType::Tcp, SUBSYS_B, "10.0.0.2", "4420"),
            ],
        );
        let reads = AtomicUsize::new(0);
        sim.set_handler(move |request| {
            if request.command.opcode != Opcode::Admin(AdminOpcode::GetLogPage) {
                return None;
            }
            // header and full log come from the first generation, then it changes
            let log = if reads.fetch_add(1, Ordering::SeqCst) < 2 {
                &first
            } else {
                &second
            };
            let offset = request.command.cdw[2] as usize;
            let mut data = vec![0u8; request.read_len];
            if offset < log.len() {
                let end = log.len().min(offset + request.read_len);
                data[..end - offset].copy_from_slice(&log[offset..end]);
            }
            Some(SimResponse::data(data))
        });

        let report = engine.discover(&discovery_address(), &CancelToken::new()).unwrap();
        assert_eq!(report.genctr, 2);
        assert_eq!(report.connected(), 2);
    }

    #[test]
    fn test_unstable_genctr_fails() {
        let (sim, engine) = setup(fast_config());
        let reads = AtomicUsize::new(0);
        sim.set_handler(move |request| {
            if request.command.opcode != Opcode::Admin(AdminOpcode::GetLogPage) {
                return None;
            }
            let genctr = reads.fetch_add(1, Ordering::SeqCst) as u64;
            let log = build_discovery_log(
                genctr,
                &[DiscoveryLogEntry::nvm(TransportType::Tcp, SUBSYS_A, "10.0.0.1", "4420")],
            );
            let mut data = vec![0u8; request.read_len];
            let len = data.len().min(log.len());
            data[..len].copy_from_slice(&log[..len]);
            Some(SimResponse::data(data))
        });

        let err = engine.discover(&discovery_address(), &CancelToken::new()).unwrap_err();
        assert_matches!(err, Error::Protocol(ProtocolError::LogGenerationUnstable { first: 0, .. }));
        assert!(engine.topology.find_subsystem(SUBSYS_A).is_none());
        assert_eq!(sim.open_handles(), 0);
    }

    #[test]
    fn test_persistent_discovery_controller() {
        let config = DiscoveryConfig {
            persistent: true,
            ..fast_config()
        };
        let (sim, engine) = setup(config);
        sim.set_discovery_log(&discovery_address(), build_discovery_log(1, &[]));

        engine.discover(&discovery_address(), &CancelToken::new()).unwrap();
        engine.discover(&discovery_address(), &CancelToken::new()).unwrap();

        let sub = engine.topology.find_subsystem(DISCOVERY_NQN).unwrap();
        assert_eq!(sub.subtype, SubsystemType::Discovery);
        assert_eq!(sub.controllers.len(), 1);
        assert_eq!(connect_calls(&sim, &discovery_address()), 1);
        assert!(sim.closed().is_empty());
    }

    #[test]
    fn test_disconnect_respects_busy_namespace() {
        let (sim, engine) = setup(fast_config());
        let target = tcp("10.0.0.1", "4420");
        let controller = engine.connect(&target, SUBSYS_A, &CancelToken::new()).unwrap();
        engine.topology.write(|tree| {
            let ns = tree.ensure_namespace(controller.subsystem, 1).unwrap();
            tree.set_path(controller.key, ns, AnaState::Optimized, None);
        });
        let handle = engine.topology.open_namespace(SUBSYS_A, 1).unwrap();

        let err = engine.disconnect(controller.key, false).unwrap_err();
        assert_matches!(err, Error::Detach(DetachError::Busy { nsid: 1, .. }));
        assert_eq!(err.exit_code(), 3);
        assert!(sim.closed().is_empty());

        drop(handle);
        let report = engine.disconnect(controller.key, false).unwrap();
        assert_eq!(report.removed_namespaces, vec![1]);
        assert!(report.subsystem_removed);
        assert_eq!(sim.closed(), vec![(controller.handle.unwrap(), true)]);
    }

    #[test]
    fn test_failed_teardown_keeps_controller() {
        let (sim, engine) = setup(fast_config());
        let target = tcp("10.0.0.1", "4420");
        let controller = engine.connect(&target, SUBSYS_A, &CancelToken::new()).unwrap();
        let handle = controller.handle.unwrap();
        sim.refuse_delete(&target, true);

        let err = engine.disconnect(controller.key, false).unwrap_err();
        assert_matches!(err, Error::Transport(TransportError::IoFailure { .. }));
        let kept = engine.topology.read(|tree| tree.controller(controller.key).cloned()).unwrap();
        assert_eq!(kept.state, ControllerState::Connected);
        assert_eq!(kept.handle, Some(handle));
        assert!(engine.gateway.is_open(handle));
        assert!(engine.topology.find_subsystem(SUBSYS_A).is_some());
        assert!(sim.closed().is_empty());

        sim.refuse_delete(&target, false);
        let report = engine.disconnect(controller.key, false).unwrap();
        assert!(report.subsystem_removed);
        assert_eq!(sim.closed(), vec![(handle, true)]);
        engine.topology.read(|tree| tree.check_invariants()).unwrap();
    }

    #[test]
    fn test_duplicate_connect_refused() {
        let (sim, engine) = setup(fast_config());
        let target = tcp("10.0.0.1", "4420");
        engine.connect(&target, SUBSYS_A, &CancelToken::new()).unwrap();

        let err = engine.connect(&target, SUBSYS_A, &CancelToken::new()).unwrap_err();
        assert_matches!(err, Error::Attach(AttachError::Duplicate { .. }));
        assert_eq!(connect_calls(&sim, &target), 1);

        engine.release();
        assert_eq!(sim.open_handles(), 0);
        assert!(engine.topology.find_controller(&target).unwrap().handle.is_none());
    }
}
