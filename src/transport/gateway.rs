//! Transport Gateway
//!
//! Submits encoded commands through the passthrough port and returns the
//! decoded completion. Commands on one handle are serialized; commands on
//! different handles run concurrently. The gateway never retries.

use crate::codec::command::{cns, get_log_page, identify, log_id};
use crate::codec::{
    decode_completion, Command, Completion, DataDirection, IdentifyController, IdentifyNamespace,
    Opcode, DISCOVERY_LOG_ENTRY_SIZE, DISCOVERY_LOG_HEADER_SIZE, IDENTIFY_DATA_SIZE,
};
use crate::domain::{DataBuffer, PassthroughRef, TargetHandle, TargetSpec};
use crate::error::{Error, ProtocolError, Result, TransportError};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

// =============================================================================
// Configuration
// =============================================================================

/// Gateway configuration
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Timeout handed to the passthrough for each command
    pub command_timeout: Duration,
    /// Largest Get Log Page transfer issued in one command
    pub log_chunk_size: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            command_timeout: Duration::from_secs(30),
            log_chunk_size: 4096,
        }
    }
}

// =============================================================================
// Handle State
// =============================================================================

struct HandleSlot {
    target: TargetSpec,
    next_command_id: u16,
}

impl HandleSlot {
    fn allocate_command_id(&mut self) -> u16 {
        let id = self.next_command_id;
        self.next_command_id = self.next_command_id.wrapping_add(1);
        id
    }
}

// =============================================================================
// Gateway
// =============================================================================

/// Executes commands against opened targets
pub struct TransportGateway {
    passthrough: PassthroughRef,
    config: GatewayConfig,
    handles: DashMap<TargetHandle, Arc<Mutex<HandleSlot>>>,
}

impl TransportGateway {
    pub fn new(passthrough: PassthroughRef, config: GatewayConfig) -> Self {
        Self {
            passthrough,
            config,
            handles: DashMap::new(),
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Open a handle to a target
    pub fn open(&self, target: &TargetSpec) -> Result<TargetHandle> {
        let handle = self.passthrough.open(target)?;
        debug!(%handle, endpoint = %target, "Opened target");
        self.handles.insert(
            handle,
            Arc::new(Mutex::new(HandleSlot {
                target: target.clone(),
                next_command_id: 1,
            })),
        );
        Ok(handle)
    }

    /// Release a handle, optionally deleting the controller behind it
    ///
    /// The handle stays usable when the passthrough refuses the close.
    pub fn close(&self, handle: TargetHandle, delete_controller: bool) -> Result<()> {
        let Some(slot) = self.handles.get(&handle).map(|s| s.value().clone()) else {
            return Err(TransportError::NotConnected {
                target: handle.to_string(),
            }
            .into());
        };
        // Wait for any in-flight command on the handle
        let slot = slot.lock();
        debug!(%handle, endpoint = %slot.target, delete_controller, "Closing target");
        if let Err(e) = self.passthrough.close(handle, delete_controller) {
            warn!(%handle, endpoint = %slot.target, error = %e, "Close failed");
            return Err(e.into());
        }
        self.handles.remove(&handle);
        Ok(())
    }

    /// Kernel instance name bound to a handle
    pub fn device_name(&self, handle: TargetHandle) -> Option<String> {
        self.passthrough.device_name(handle)
    }

    /// Target a handle was opened for
    pub fn target(&self, handle: TargetHandle) -> Option<TargetSpec> {
        self.handles
            .get(&handle)
            .map(|slot| slot.value().lock().target.clone())
    }

    pub fn is_open(&self, handle: TargetHandle) -> bool {
        self.handles.contains_key(&handle)
    }

    pub fn open_handles(&self) -> usize {
        self.handles.len()
    }

    // =========================================================================
    // Submission
    // =========================================================================

    /// Submit one command and return its completion, whatever its status
    pub fn submit(
        &self,
        handle: TargetHandle,
        command: Command,
        data: DataBuffer<'_>,
    ) -> Result<Completion> {
        check_buffer(&command, &data)?;

        let slot = self
            .handles
            .get(&handle)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| TransportError::NotConnected {
                target: handle.to_string(),
            })?;
        let mut slot = slot.lock();

        let command = command.with_command_id(slot.allocate_command_id());
        let sqe = command.to_bytes();
        let started = Instant::now();

        let raw = self
            .passthrough
            .execute(handle, command.queue(), &sqe, data, self.config.command_timeout)
            .map_err(|e| {
                warn!(endpoint = %slot.target, opcode = %command.opcode, error = %e, "Passthrough failed");
                e
            })?;
        let completion = decode_completion(&raw)?;

        if completion.command_id != command.command_id {
            return Err(ProtocolError::CommandIdMismatch {
                expected: command.command_id,
                actual: completion.command_id,
            }
            .into());
        }

        trace!(
            endpoint = %slot.target,
            opcode = %command.opcode,
            command_id = command.command_id,
            status = %completion.status,
            elapsed_us = started.elapsed().as_micros() as u64,
            "Command completed"
        );
        Ok(completion)
    }

    /// Submit a command and turn a non-success status into an error
    pub fn execute(
        &self,
        handle: TargetHandle,
        command: Command,
        data: DataBuffer<'_>,
    ) -> Result<Completion> {
        let opcode = command.opcode;
        let completion = self.submit(handle, command, data)?;
        if !completion.status.is_success() {
            return Err(self.command_error(handle, opcode, &completion));
        }
        Ok(completion)
    }

    /// Build the error reported for a failed completion
    pub fn command_error(&self, handle: TargetHandle, opcode: Opcode, completion: &Completion) -> Error {
        Error::Command {
            target: self
                .target(handle)
                .map_or_else(|| handle.to_string(), |t| t.to_string()),
            opcode,
            status: completion.status,
        }
    }

    // =========================================================================
    // Convenience Commands
    // =========================================================================

    /// Read `len` bytes of a log page, in chunks of at most `log_chunk_size`
    pub fn get_log_page(&self, handle: TargetHandle, lid: u8, nsid: u32, len: usize) -> Result<Vec<u8>> {
        let mut page = vec![0u8; len];
        let chunk_size = self.chunk_size();
        let mut offset = 0usize;
        while offset < len {
            let chunk = chunk_size.min(len - offset);
            self.read_log_range(handle, lid, nsid, offset, &mut page[offset..offset + chunk])?;
            offset += chunk;
        }
        Ok(page)
    }

    /// Read the discovery log page
    ///
    /// A controller holding fewer records than its header announced refuses
    /// reads past the end of its log. The page is then re-read one record at
    /// a time and returned up to the last record the controller holds.
    pub fn get_discovery_log(&self, handle: TargetHandle, len: usize) -> Result<Vec<u8>> {
        let mut page = vec![0u8; len];
        let chunk_size = self.chunk_size();
        let mut offset = 0usize;
        while offset < len {
            let chunk = chunk_size.min(len - offset);
            let end = offset + chunk;
            match self.read_log_range(handle, log_id::DISCOVERY, 0, offset, &mut page[offset..end]) {
                Ok(()) => {}
                Err(Error::Command { status, .. }) if status.dnr() && end > DISCOVERY_LOG_HEADER_SIZE => {
                    let held = self.read_discovery_records(handle, &mut page, offset, end)?;
                    if held < end {
                        warn!(%handle, announced = len, held, "Discovery log shorter than announced");
                        page.truncate(held);
                        return Ok(page);
                    }
                }
                Err(e) => return Err(e),
            }
            offset = end;
        }
        Ok(page)
    }

    /// Read `[start, end)` of the discovery log record by record, returning
    /// the offset of the first record the controller refused
    fn read_discovery_records(
        &self,
        handle: TargetHandle,
        page: &mut [u8],
        start: usize,
        end: usize,
    ) -> Result<usize> {
        let mut offset = start;
        while offset < end {
            let next = if offset < DISCOVERY_LOG_HEADER_SIZE {
                DISCOVERY_LOG_HEADER_SIZE
            } else {
                offset + DISCOVERY_LOG_ENTRY_SIZE
                    - (offset - DISCOVERY_LOG_HEADER_SIZE) % DISCOVERY_LOG_ENTRY_SIZE
            }
            .min(end);
            match self.read_log_range(handle, log_id::DISCOVERY, 0, offset, &mut page[offset..next]) {
                Ok(()) => offset = next,
                Err(Error::Command { status, .. })
                    if status.dnr() && offset >= DISCOVERY_LOG_HEADER_SIZE =>
                {
                    return Ok(offset)
                }
                Err(e) => return Err(e),
            }
        }
        Ok(offset)
    }

    fn read_log_range(
        &self,
        handle: TargetHandle,
        lid: u8,
        nsid: u32,
        offset: usize,
        buf: &mut [u8],
    ) -> Result<()> {
        let command = get_log_page(lid, nsid, offset as u64, buf.len(), 0, false)?;
        self.execute(handle, command, DataBuffer::FromDevice(buf))?;
        Ok(())
    }

    fn chunk_size(&self) -> usize {
        (self.config.log_chunk_size.max(4)) & !3
    }

    pub fn identify_controller(&self, handle: TargetHandle) -> Result<IdentifyController> {
        let mut data = vec![0u8; IDENTIFY_DATA_SIZE];
        self.execute(
            handle,
            identify(cns::CONTROLLER, 0, 0),
            DataBuffer::FromDevice(&mut data),
        )?;
        Ok(IdentifyController::parse(&data)?)
    }

    pub fn identify_namespace(&self, handle: TargetHandle, nsid: u32) -> Result<IdentifyNamespace> {
        let mut data = vec![0u8; IDENTIFY_DATA_SIZE];
        self.execute(
            handle,
            identify(cns::NAMESPACE, nsid, 0),
            DataBuffer::FromDevice(&mut data),
        )?;
        Ok(IdentifyNamespace::parse(&data)?)
    }
}

/// The buffer must match the transfer length and direction of the command
fn check_buffer(command: &Command, data: &DataBuffer<'_>) -> std::result::Result<(), ProtocolError> {
    if data.len() != command.data_len as usize {
        return Err(ProtocolError::TransferLength {
            opcode: command.opcode.to_string(),
            expected: command.data_len as usize,
            actual: data.len(),
        });
    }
    let direction_ok = match (command.opcode.direction(), data) {
        (_, buffer) if buffer.is_empty() => true,
        (DataDirection::ControllerToHost, DataBuffer::FromDevice(_)) => true,
        (DataDirection::HostToController, DataBuffer::ToDevice(_)) => true,
        (DataDirection::Bidirectional, _) => true,
        _ => false,
    };
    if !direction_ok {
        return Err(ProtocolError::InvalidField {
            field: "data",
            reason: format!("buffer direction does not match {}", command.opcode),
        });
    }
    Ok(())
}

impl std::fmt::Debug for TransportGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportGateway")
            .field("config", &self.config)
            .field("open_handles", &self.handles.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::command::keep_alive;
    use crate::codec::completion::{generic, StatusCodeType, StatusField};
    use crate::codec::{build_discovery_log, AdminOpcode, DiscoveryLogEntry};
    use crate::domain::{ControllerAddress, TransportType};
    use crate::transport::simulator::{SimResponse, SimulatedPassthrough};
    use assert_matches::assert_matches;

    fn target() -> TargetSpec {
        TargetSpec::new(ControllerAddress::new(TransportType::Tcp, "10.0.0.9").with_trsvcid("8009"))
    }

    fn gateway(sim: &Arc<SimulatedPassthrough>, config: GatewayConfig) -> TransportGateway {
        TransportGateway::new(sim.clone(), config)
    }

    #[test]
    fn test_submit_assigns_command_ids() {
        let sim = Arc::new(SimulatedPassthrough::new());
        let gw = gateway(&sim, GatewayConfig::default());
        let handle = gw.open(&target()).unwrap();

        gw.execute(handle, keep_alive(), DataBuffer::None).unwrap();
        gw.execute(handle, keep_alive(), DataBuffer::None).unwrap();

        let ids: Vec<u16> = sim.calls().iter().map(|c| c.command_id).collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn test_buffer_length_checked_before_submission() {
        let sim = Arc::new(SimulatedPassthrough::new());
        let gw = gateway(&sim, GatewayConfig::default());
        let handle = gw.open(&target()).unwrap();

        let mut short = vec![0u8; 512];
        let result = gw.submit(handle, identify(cns::CONTROLLER, 0, 0), DataBuffer::FromDevice(&mut short));
        assert_matches!(
            result,
            Err(Error::Protocol(ProtocolError::TransferLength { expected: 4096, actual: 512, .. }))
        );
        assert!(sim.calls().is_empty());
    }

    #[test]
    fn test_command_id_mismatch() {
        let sim = Arc::new(SimulatedPassthrough::new());
        sim.set_handler(|request| {
            let cqe = Completion::new(request.command.command_id.wrapping_add(7), StatusField::SUCCESS);
            Some(SimResponse::Raw(cqe.to_bytes()))
        });
        let gw = gateway(&sim, GatewayConfig::default());
        let handle = gw.open(&target()).unwrap();

        assert_matches!(
            gw.submit(handle, keep_alive(), DataBuffer::None),
            Err(Error::Protocol(ProtocolError::CommandIdMismatch { expected: 1, actual: 8 }))
        );
    }

    #[test]
    fn test_failed_status_is_returned_not_retried() {
        let sim = Arc::new(SimulatedPassthrough::new());
        let status = StatusField::new(StatusCodeType::Generic, generic::NAMESPACE_NOT_READY);
        sim.set_handler(move |_| Some(SimResponse::status(status)));
        let gw = gateway(&sim, GatewayConfig::default());
        let handle = gw.open(&target()).unwrap();

        let completion = gw.submit(handle, keep_alive(), DataBuffer::None).unwrap();
        assert_eq!(completion.status, status);

        let err = gw.execute(handle, keep_alive(), DataBuffer::None).unwrap_err();
        assert_matches!(err, Error::Command { opcode: Opcode::Admin(AdminOpcode::KeepAlive), .. });
        assert!(err.is_retryable());
        assert_eq!(sim.calls().len(), 2);
    }

    #[test]
    fn test_get_log_page_in_chunks() {
        let sim = Arc::new(SimulatedPassthrough::new());
        let entries = vec![
            DiscoveryLogEntry::nvm(TransportType::Tcp, "nqn.2024-01.io.example:a", "10.0.0.5", "4420"),
            DiscoveryLogEntry::nvm(TransportType::Tcp, "nqn.2024-01.io.example:b", "10.0.0.6", "4420"),
        ];
        let log = build_discovery_log(3, &entries);
        sim.set_discovery_log(&target().address, log.clone());

        let gw = gateway(
            &sim,
            GatewayConfig {
                log_chunk_size: 1024,
                ..Default::default()
            },
        );
        let handle = gw.open(&target()).unwrap();
        let page = gw.get_discovery_log(handle, log.len()).unwrap();

        assert_eq!(page, log);
        assert_eq!(sim.calls().len(), 3);
    }

    #[test]
    fn test_closed_handle_is_not_connected() {
        let sim = Arc::new(SimulatedPassthrough::new());
        let gw = gateway(&sim, GatewayConfig::default());
        let handle = gw.open(&target()).unwrap();
        gw.close(handle, false).unwrap();

        assert!(!gw.is_open(handle));
        assert_matches!(
            gw.submit(handle, keep_alive(), DataBuffer::None),
            Err(Error::Transport(TransportError::NotConnected { .. }))
        );
        assert_matches!(gw.close(handle, false), Err(Error::Transport(_)));
    }

    #[test]
    fn test_short_discovery_log_returns_held_records() {
        let sim = Arc::new(SimulatedPassthrough::new());
        let entries = vec![
            DiscoveryLogEntry::nvm(TransportType::Tcp, "nqn.2024-01.io.example:a", "10.0.0.5", "4420"),
            DiscoveryLogEntry::nvm(TransportType::Tcp, "nqn.2024-01.io.example:b", "10.0.0.6", "4420"),
        ];
        let full = build_discovery_log(3, &entries);
        let mut held = full.clone();
        held.truncate(DISCOVERY_LOG_HEADER_SIZE + DISCOVERY_LOG_ENTRY_SIZE + 10);
        sim.set_discovery_log(&target().address, held);

        let gw = gateway(&sim, GatewayConfig::default());
        let handle = gw.open(&target()).unwrap();
        let page = gw.get_discovery_log(handle, full.len()).unwrap();

        assert_eq!(page.as_slice(), &full[..DISCOVERY_LOG_HEADER_SIZE + DISCOVERY_LOG_ENTRY_SIZE]);
        // one refused chunk, then header, first record and the refused second record
        assert_eq!(sim.calls().len(), 4);

        // other log pages are not shortened
        assert_matches!(
            gw.get_log_page(handle, log_id::DISCOVERY, 0, full.len()),
            Err(Error::Command { .. })
        );
    }

    #[test]
    fn test_failed_close_keeps_handle() {
        let sim = Arc::new(SimulatedPassthrough::new());
        let gw = gateway(&sim, GatewayConfig::default());
        let handle = gw.open(&target()).unwrap();
        sim.refuse_delete(&target().address, true);

        assert_matches!(
            gw.close(handle, true),
            Err(Error::Transport(TransportError::IoFailure { .. }))
        );
        assert!(gw.is_open(handle));
        assert_eq!(gw.open_handles(), 1);
        gw.execute(handle, keep_alive(), DataBuffer::None).unwrap();

        sim.refuse_delete(&target().address, false);
        gw.close(handle, true).unwrap();
        assert!(!gw.is_open(handle));
        assert_eq!(sim.closed(), vec![(handle, true)]);
    }

    #[test]
    fn test_concurrent_handles() {
        let sim = Arc::new(SimulatedPassthrough::new());
        let gw = Arc::new(gateway(&sim, GatewayConfig::default()));
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let spec = TargetSpec::new(
                    ControllerAddress::new(TransportType::Tcp, format!("10.0.1.{}", i)).with_trsvcid("4420"),
                );
                gw.open(&spec).unwrap()
            })
            .collect();

        std::thread::scope(|scope| {
            for handle in &handles {
                let gw = gw.clone();
                let handle = *handle;
                scope.spawn(move || {
                    for _ in 0..25 {
                        gw.execute(handle, keep_alive(), DataBuffer::None).unwrap();
                    }
                });
            }
        });

        assert_eq!(sim.calls().len(), 100);
        for handle in handles {
            let mut ids: Vec<u16> = sim
                .calls()
                .iter()
                .filter(|c| c.handle == handle)
                .map(|c| c.command_id)
                .collect();
            ids.sort_unstable();
            assert_eq!(ids, (1..=25).collect::<Vec<u16>>());
        }
    }
}
