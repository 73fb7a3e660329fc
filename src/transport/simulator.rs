//! Simulated Passthrough
//!
//! In-memory stand-in for the kernel passthrough. Targets answer Connect,
//! Identify, Get Log Page and Disconnect from scripted state, and every
//! executed command is recorded for inspection.

use crate::codec::command::cns;
use crate::codec::completion::{command_specific, generic};
use crate::codec::fabrics::ConnectData;
use crate::codec::{
    log_id, AdminOpcode, Command, Completion, FabricsCommandType, IdentifyController,
    IdentifyNamespace, Opcode, StatusCodeType, StatusField, CQE_SIZE, SQE_SIZE,
};
use crate::domain::{
    ControllerAddress, DataBuffer, Passthrough, QueueKind, TargetHandle, TargetSpec,
};
use crate::error::TransportError;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

/// Targets are matched on transport, traddr and trsvcid only
fn target_key(address: &ControllerAddress) -> (String, String, String) {
    (
        address.transport.to_string(),
        address.traddr.clone(),
        address.trsvcid.clone().unwrap_or_default(),
    )
}

type TargetKey = (String, String, String);

/// A command seen by the simulator
#[derive(Debug, Clone, PartialEq)]
pub struct SimCall {
    pub handle: TargetHandle,
    pub address: ControllerAddress,
    pub queue: QueueKind,
    pub opcode: Opcode,
    pub command_id: u16,
}

/// A request passed to a custom handler
#[derive(Debug)]
pub struct SimRequest {
    pub handle: TargetHandle,
    pub target: TargetSpec,
    pub queue: QueueKind,
    pub command: Command,
    /// Host-to-controller payload
    pub payload: Vec<u8>,
    /// Size of the controller-to-host buffer
    pub read_len: usize,
}

/// Reply from a custom handler
#[derive(Debug, Clone)]
pub enum SimResponse {
    Complete {
        status: StatusField,
        result: u32,
        data: Vec<u8>,
    },
    /// Raw completion bytes, returned unchanged
    Raw([u8; CQE_SIZE]),
    Fail(TransportError),
}

impl SimResponse {
    pub fn success() -> Self {
        Self::status(StatusField::SUCCESS)
    }

    pub fn status(status: StatusField) -> Self {
        SimResponse::Complete {
            status,
            result: 0,
            data: Vec::new(),
        }
    }

    pub fn data(data: Vec<u8>) -> Self {
        SimResponse::Complete {
            status: StatusField::SUCCESS,
            result: 0,
            data,
        }
    }
}

type Handler = Box<dyn Fn(&SimRequest) -> Option<SimResponse> + Send + Sync>;

#[derive(Default)]
struct SimTarget {
    discovery_log: Option<Vec<u8>>,
    connect_statuses: VecDeque<StatusField>,
    connect_failures: VecDeque<TransportError>,
    refuse_open: bool,
    refuse_delete: bool,
    controller: Option<IdentifyController>,
    namespaces: HashMap<u32, IdentifyNamespace>,
    next_cntlid: u16,
}

#[derive(Default)]
struct SimState {
    next_handle: u64,
    next_instance: u32,
    targets: HashMap<TargetKey, SimTarget>,
    open: HashMap<TargetHandle, TargetSpec>,
    devices: HashMap<TargetHandle, String>,
    calls: Vec<SimCall>,
    closed: Vec<(TargetHandle, bool)>,
    unreachable: HashSet<TargetKey>,
}

/// In-memory passthrough for tests
#[derive(Default)]
pub struct SimulatedPassthrough {
    state: Mutex<SimState>,
    handler: Mutex<Option<Handler>>,
}

impl SimulatedPassthrough {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a handler consulted before the scripted behaviour
    pub fn set_handler<F>(&self, handler: F)
    where
        F: Fn(&SimRequest) -> Option<SimResponse> + Send + Sync + 'static,
    {
        *self.handler.lock() = Some(Box::new(handler));
    }

    /// Serve `log` as the discovery log page of `address`
    pub fn set_discovery_log(&self, address: &ControllerAddress, log: Vec<u8>) {
        self.with_target(address, |t| t.discovery_log = Some(log));
    }

    /// Fail the next Connect to `address` with `status`
    pub fn push_connect_status(&self, address: &ControllerAddress, status: StatusField) {
        self.with_target(address, |t| t.connect_statuses.push_back(status));
    }

    /// Fail the next Connect to `address` at the transport level
    pub fn push_connect_failure(&self, address: &ControllerAddress, error: TransportError) {
        self.with_target(address, |t| t.connect_failures.push_back(error));
    }

    /// Every command to `address` fails with a retryable transport error
    pub fn set_unreachable(&self, address: &ControllerAddress) {
        self.state.lock().unreachable.insert(target_key(address));
    }

    /// Opening `address` fails
    pub fn refuse_open(&self, address: &ControllerAddress) {
        self.with_target(address, |t| t.refuse_open = true);
    }

    /// Closing a handle to `address` with controller deletion fails with EBUSY
    pub fn refuse_delete(&self, address: &ControllerAddress, refuse: bool) {
        self.with_target(address, |t| t.refuse_delete = refuse);
    }

    pub fn set_controller(&self, address: &ControllerAddress, controller: IdentifyController) {
        self.with_target(address, |t| t.controller = Some(controller));
    }

    pub fn set_namespace(&self, address: &ControllerAddress, nsid: u32, namespace: IdentifyNamespace) {
        self.with_target(address, |t| {
            t.namespaces.insert(nsid, namespace);
        });
    }

    /// Commands executed so far
    pub fn calls(&self) -> Vec<SimCall> {
        self.state.lock().calls.clone()
    }

    /// Commands executed against `address`
    pub fn calls_to(&self, address: &ControllerAddress) -> Vec<SimCall> {
        let key = target_key(address);
        self.state
            .lock()
            .calls
            .iter()
            .filter(|c| target_key(&c.address) == key)
            .cloned()
            .collect()
    }

    /// Handles closed so far with their delete flag
    pub fn closed(&self) -> Vec<(TargetHandle, bool)> {
        self.state.lock().closed.clone()
    }

    pub fn open_handles(&self) -> usize {
        self.state.lock().open.len()
    }

    fn with_target<R>(&self, address: &ControllerAddress, f: impl FnOnce(&mut SimTarget) -> R) -> R {
        let mut state = self.state.lock();
        f(state.targets.entry(target_key(address)).or_default())
    }

    fn scripted(&self, state: &mut SimState, request: &SimRequest) -> SimResponse {
        let key = target_key(&request.target.address);
        if state.unreachable.contains(&key) {
            return SimResponse::Fail(TransportError::IoFailure {
                target: request.target.to_string(),
                opcode: request.command.opcode.to_string(),
                errno: libc::ECONNREFUSED,
            });
        }

        match request.command.opcode {
            Opcode::Fabrics(FabricsCommandType::Connect) => self.connect(state, key, request),
            Opcode::Admin(AdminOpcode::GetLogPage) => {
                let lid = request.command.cdw10() as u8;
                let offset = request.command.cdw[2] as u64 | (request.command.cdw[3] as u64) << 32;
                let offset = usize::try_from(offset).unwrap_or(usize::MAX);
                let target = state.targets.entry(key).or_default();
                match (&target.discovery_log, lid) {
                    (Some(log), log_id::DISCOVERY) => {
                        // the log is served as written; reads past its end are refused
                        match offset.checked_add(request.read_len) {
                            Some(end) if end <= log.len() => SimResponse::data(log[offset..end].to_vec()),
                            _ => SimResponse::status(
                                StatusField::new(StatusCodeType::Generic, generic::INVALID_FIELD)
                                    .with_dnr(true),
                            ),
                        }
                    }
                    _ => SimResponse::status(
                        StatusField::new(StatusCodeType::CommandSpecific, command_specific::INVALID_LOG_PAGE)
                            .with_dnr(true),
                    ),
                }
            }
            Opcode::Admin(AdminOpcode::Identify) => {
                let target = state.targets.entry(key).or_default();
                match request.command.cdw10() as u8 {
                    cns::CONTROLLER => {
                        let controller = target.controller.clone().unwrap_or_else(|| IdentifyController {
                            vid: 0x1b36,
                            ssvid: 0x1b36,
                            serial: format!("SIM{:04}", request.handle.0),
                            model: "Simulated Controller".into(),
                            firmware: "1.0".into(),
                            mdts: 5,
                            cntlid: 1,
                            version: 0x0001_0400,
                            nn: target.namespaces.len() as u32,
                            subnqn: String::new(),
                        });
                        SimResponse::data(controller.to_bytes())
                    }
                    cns::NAMESPACE => match target.namespaces.get(&request.command.nsid) {
                        Some(ns) => SimResponse::data(ns.to_bytes()),
                        None => SimResponse::status(
                            StatusField::new(StatusCodeType::Generic, generic::INVALID_NAMESPACE_OR_FORMAT)
                                .with_dnr(true),
                        ),
                    },
                    _ => SimResponse::status(
                        StatusField::new(StatusCodeType::Generic, generic::INVALID_FIELD).with_dnr(true),
                    ),
                }
            }
            _ => SimResponse::success(),
        }
    }

    fn connect(&self, state: &mut SimState, key: TargetKey, request: &SimRequest) -> SimResponse {
        let target = state.targets.entry(key).or_default();
        if let Some(error) = target.connect_failures.pop_front() {
            return SimResponse::Fail(error);
        }
        if let Some(status) = target.connect_statuses.pop_front() {
            return SimResponse::status(status);
        }
        if let Err(e) = ConnectData::from_bytes(&request.payload) {
            tracing::debug!(error = %e, "Simulated connect rejected");
            return SimResponse::status(
                StatusField::new(StatusCodeType::CommandSpecific, command_specific::CONNECT_INVALID_PARAMETERS)
                    .with_dnr(true),
            );
        }

        target.next_cntlid += 1;
        let cntlid = target.next_cntlid;
        let instance = state.next_instance;
        state.next_instance += 1;
        state.devices.insert(request.handle, format!("nvme{}", instance));

        SimResponse::Complete {
            status: StatusField::SUCCESS,
            result: cntlid as u32,
            data: Vec::new(),
        }
    }
}

impl Passthrough for SimulatedPassthrough {
    fn open(&self, target: &TargetSpec) -> Result<TargetHandle, TransportError> {
        let mut state = self.state.lock();
        if state
            .targets
            .get(&target_key(&target.address))
            .is_some_and(|t| t.refuse_open)
        {
            return Err(TransportError::NotConnected {
                target: target.to_string(),
            });
        }
        state.next_handle += 1;
        let handle = TargetHandle(state.next_handle);
        state.open.insert(handle, target.clone());
        if let Some(device) = &target.device {
            state.devices.insert(handle, device.clone());
        }
        Ok(handle)
    }

    fn execute(
        &self,
        handle: TargetHandle,
        queue: QueueKind,
        sqe: &[u8; SQE_SIZE],
        data: DataBuffer<'_>,
        _timeout: Duration,
    ) -> Result<[u8; CQE_SIZE], TransportError> {
        let target = self
            .state
            .lock()
            .open
            .get(&handle)
            .cloned()
            .ok_or_else(|| TransportError::NotConnected {
                target: handle.to_string(),
            })?;
        let command = Command::from_bytes(sqe, queue).map_err(|e| TransportError::IoFailure {
            target: target.to_string(),
            opcode: e.to_string(),
            errno: libc::EINVAL,
        })?;

        let (payload, read_len) = match &data {
            DataBuffer::None => (Vec::new(), 0),
            DataBuffer::ToDevice(buf) => (buf.to_vec(), 0),
            DataBuffer::FromDevice(buf) => (Vec::new(), buf.len()),
        };
        let request = SimRequest {
            handle,
            target,
            queue,
            command,
            payload,
            read_len,
        };

        let custom = self.handler.lock().as_ref().and_then(|h| h(&request));
        let response = {
            let mut state = self.state.lock();
            state.calls.push(SimCall {
                handle,
                address: request.target.address.clone(),
                queue,
                opcode: command.opcode,
                command_id: command.command_id,
            });
            match custom {
                Some(response) => response,
                None => self.scripted(&mut state, &request),
            }
        };

        match response {
            SimResponse::Fail(error) => Err(error),
            SimResponse::Raw(cqe) => Ok(cqe),
            SimResponse::Complete {
                status,
                result,
                data: reply,
            } => {
                if let DataBuffer::FromDevice(buf) = data {
                    let len = buf.len().min(reply.len());
                    buf[..len].copy_from_slice(&reply[..len]);
                }
                Ok(Completion::new(command.command_id, status)
                    .with_result(result)
                    .to_bytes())
            }
        }
    }

    fn device_name(&self, handle: TargetHandle) -> Option<String> {
        self.state.lock().devices.get(&handle).cloned()
    }

    fn close(&self, handle: TargetHandle, delete_controller: bool) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        let Some(target) = state.open.get(&handle) else {
            return Err(TransportError::NotConnected {
                target: handle.to_string(),
            });
        };
        let refused = delete_controller
            && state
                .targets
                .get(&target_key(&target.address))
                .is_some_and(|t| t.refuse_delete);
        if refused {
            return Err(TransportError::IoFailure {
                target: target.to_string(),
                opcode: "delete_controller".into(),
                errno: libc::EBUSY,
            });
        }
        state.open.remove(&handle);
        state.devices.remove(&handle);
        state.closed.push((handle, delete_controller));
        Ok(())
    }
}
