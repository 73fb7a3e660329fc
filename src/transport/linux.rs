//! Linux Passthrough
//!
//! Executes commands through the NVMe passthrough ioctls of the kernel
//! driver. Fabrics Connect is carried out through the fabrics control
//! device and Disconnect through the controller's sysfs entry, since the
//! kernel owns the fabrics queues.

use crate::codec::completion::generic;
use crate::codec::fabrics::{connect_params, ConnectData};
use crate::codec::{
    Command, Completion, FabricsCommandType, Opcode, StatusCodeType, StatusField, CQE_SIZE,
    SQE_SIZE,
};
use crate::domain::{DataBuffer, Passthrough, QueueKind, TargetHandle, TargetSpec, TransportType};
use crate::error::TransportError;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::os::unix::io::AsRawFd;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

mod ioctl {
    use nix::ioctl_readwrite;

    #[repr(C)]
    #[derive(Debug, Default)]
    pub struct NvmePassthruCmd {
        pub opcode: u8,
        pub flags: u8,
        pub rsvd1: u16,
        pub nsid: u32,
        pub cdw2: u32,
        pub cdw3: u32,
        pub metadata: u64,
        pub addr: u64,
        pub metadata_len: u32,
        pub data_len: u32,
        pub cdw10: u32,
        pub cdw11: u32,
        pub cdw12: u32,
        pub cdw13: u32,
        pub cdw14: u32,
        pub cdw15: u32,
        pub timeout_ms: u32,
        pub result: u32,
    }

    // #define NVME_IOCTL_ADMIN_CMD	_IOWR('N', 0x41, struct nvme_admin_cmd)
    const NVME_IOC_MAGIC: u8 = b'N';
    ioctl_readwrite!(nvme_ioctl_admin_cmd, NVME_IOC_MAGIC, 0x41, NvmePassthruCmd);

    // #define NVME_IOCTL_IO_CMD	_IOWR('N', 0x43, struct nvme_passthru_cmd)
    ioctl_readwrite!(nvme_ioctl_io_cmd, NVME_IOC_MAGIC, 0x43, NvmePassthruCmd);
}

// =============================================================================
// Configuration
// =============================================================================

/// Locations of the kernel interfaces
#[derive(Debug, Clone)]
pub struct LinuxPassthroughConfig {
    /// Fabrics control device
    pub fabrics_device: PathBuf,
    /// Controller class directory in sysfs
    pub class_dir: PathBuf,
    /// Directory holding the controller character devices
    pub dev_dir: PathBuf,
}

impl Default for LinuxPassthroughConfig {
    fn default() -> Self {
        Self {
            fabrics_device: PathBuf::from("/dev/nvme-fabrics"),
            class_dir: PathBuf::from("/sys/class/nvme"),
            dev_dir: PathBuf::from("/dev"),
        }
    }
}

// =============================================================================
// Passthrough
// =============================================================================

struct OpenTarget {
    spec: TargetSpec,
    device: Option<String>,
    file: Option<Arc<File>>,
}

/// Passthrough backed by the Linux NVMe driver
pub struct LinuxPassthrough {
    config: LinuxPassthroughConfig,
    next_handle: AtomicU64,
    targets: Mutex<HashMap<TargetHandle, OpenTarget>>,
}

impl LinuxPassthrough {
    pub fn new(config: LinuxPassthroughConfig) -> Self {
        Self {
            config,
            next_handle: AtomicU64::new(1),
            targets: Mutex::new(HashMap::new()),
        }
    }

    fn open_device(&self, target: &TargetSpec, device: &str) -> Result<File, TransportError> {
        OpenOptions::new()
            .read(true)
            .write(true)
            .open(self.config.dev_dir.join(device))
            .map_err(|e| io_error(target, "open", &e))
    }

    /// Create a fabrics controller and bind it to `handle`
    fn fabrics_connect(
        &self,
        handle: TargetHandle,
        spec: &TargetSpec,
        command: &Command,
        payload: &[u8],
    ) -> Result<[u8; CQE_SIZE], TransportError> {
        let data = ConnectData::from_bytes(payload).map_err(|e| TransportError::IoFailure {
            target: spec.to_string(),
            opcode: format!("connect ({})", e),
            errno: libc::EINVAL,
        })?;
        let options = connect_options(spec, command, &data);
        debug!(target_spec = %spec, %options, "Writing fabrics connect options");

        let mut fabrics = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.config.fabrics_device)
            .map_err(|e| io_error(spec, "connect", &e))?;
        fabrics
            .write_all(options.as_bytes())
            .map_err(|e| io_error(spec, "connect", &e))?;

        let mut reply = [0u8; 256];
        let len = fabrics
            .read(&mut reply)
            .map_err(|e| io_error(spec, "connect", &e))?;
        let reply = String::from_utf8_lossy(&reply[..len]);
        let (instance, cntlid) = parse_connect_reply(&reply).ok_or_else(|| TransportError::IoFailure {
            target: spec.to_string(),
            opcode: format!("connect (unexpected reply {:?})", reply.trim()),
            errno: libc::EPROTO,
        })?;

        let device = format!("nvme{}", instance);
        let file = self.open_device(spec, &device)?;
        info!(target_spec = %spec, %device, cntlid, "Fabrics controller created");

        if let Some(target) = self.targets.lock().get_mut(&handle) {
            target.device = Some(device);
            target.file = Some(Arc::new(file));
        }

        Ok(Completion::new(command.command_id, StatusField::SUCCESS)
            .with_result(cntlid as u32)
            .to_bytes())
    }

    fn delete_controller(&self, spec: &TargetSpec, device: &str) -> Result<(), TransportError> {
        let path = self.config.class_dir.join(device).join("delete_controller");
        std::fs::write(&path, "1").map_err(|e| io_error(spec, "disconnect", &e))?;
        info!(target_spec = %spec, %device, "Deleted fabrics controller");
        Ok(())
    }
}

impl Default for LinuxPassthrough {
    fn default() -> Self {
        Self::new(LinuxPassthroughConfig::default())
    }
}

impl Passthrough for LinuxPassthrough {
    fn open(&self, target: &TargetSpec) -> Result<TargetHandle, TransportError> {
        let file = match (&target.device, target.address.transport) {
            (Some(device), _) => Some(Arc::new(self.open_device(target, device)?)),
            // The controller is created by the Connect command
            (None, transport) if transport.is_fabrics() => None,
            (None, _) => {
                return Err(TransportError::NotConnected {
                    target: target.to_string(),
                })
            }
        };

        let handle = TargetHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        self.targets.lock().insert(
            handle,
            OpenTarget {
                spec: target.clone(),
                device: target.device.clone(),
                file,
            },
        );
        Ok(handle)
    }

    fn execute(
        &self,
        handle: TargetHandle,
        queue: QueueKind,
        sqe: &[u8; SQE_SIZE],
        data: DataBuffer<'_>,
        timeout: Duration,
    ) -> Result<[u8; CQE_SIZE], TransportError> {
        let (spec, device, file) = {
            let targets = self.targets.lock();
            let target = targets.get(&handle).ok_or_else(|| TransportError::NotConnected {
                target: handle.to_string(),
            })?;
            (target.spec.clone(), target.device.clone(), target.file.clone())
        };
        let command = Command::from_bytes(sqe, queue).map_err(|e| TransportError::IoFailure {
            target: spec.to_string(),
            opcode: e.to_string(),
            errno: libc::EINVAL,
        })?;

        match command.opcode {
            Opcode::Fabrics(FabricsCommandType::Connect) => {
                let DataBuffer::ToDevice(payload) = data else {
                    return Err(TransportError::IoFailure {
                        target: spec.to_string(),
                        opcode: "connect".into(),
                        errno: libc::EINVAL,
                    });
                };
                return self.fabrics_connect(handle, &spec, &command, payload);
            }
            Opcode::Fabrics(FabricsCommandType::Disconnect) => {
                if let Some(device) = &device {
                    self.delete_controller(&spec, device)?;
                }
                return Ok(Completion::new(command.command_id, StatusField::SUCCESS).to_bytes());
            }
            Opcode::Fabrics(fctype) => {
                // Remaining capsules are issued by the kernel on its own queues
                warn!(target_spec = %spec, %fctype, "Fabrics command not available through passthrough");
                return Ok(Completion::new(
                    command.command_id,
                    StatusField::new(StatusCodeType::Generic, generic::INVALID_OPCODE).with_dnr(true),
                )
                .to_bytes());
            }
            _ => {}
        }

        let file = file.ok_or_else(|| TransportError::NotConnected {
            target: spec.to_string(),
        })?;

        let (addr, data_len) = match &data {
            DataBuffer::None => (0u64, 0u32),
            DataBuffer::FromDevice(buf) => (buf.as_ptr() as u64, buf.len() as u32),
            DataBuffer::ToDevice(buf) => (buf.as_ptr() as u64, buf.len() as u32),
        };
        let mut cmd = ioctl::NvmePassthruCmd {
            opcode: command.opcode.code(),
            flags: command.flags,
            rsvd1: 0,
            nsid: command.nsid,
            cdw2: command.cdw2,
            cdw3: command.cdw3,
            metadata: 0,
            addr,
            metadata_len: 0,
            data_len,
            cdw10: command.cdw[0],
            cdw11: command.cdw[1],
            cdw12: command.cdw[2],
            cdw13: command.cdw[3],
            cdw14: command.cdw[4],
            cdw15: command.cdw[5],
            timeout_ms: timeout.as_millis().min(u32::MAX as u128) as u32,
            result: !0,
        };

        // SAFETY: The FD is owned by the File held in `file` for the duration
        //         of the call, and `addr`/`data_len` describe a buffer borrowed
        //         by `data` that outlives the ioctl. More documentation on this
        //         specific ioctl can be found in nvme_ioctl.h.
        let result = unsafe {
            match queue {
                QueueKind::Admin => ioctl::nvme_ioctl_admin_cmd(file.as_raw_fd(), &mut cmd),
                QueueKind::Io => ioctl::nvme_ioctl_io_cmd(file.as_raw_fd(), &mut cmd),
            }
        };

        let status = match result {
            Ok(status) => status,
            Err(errno) => {
                return Err(TransportError::from_errno(
                    spec.to_string(),
                    command.opcode.to_string(),
                    errno as i32,
                ))
            }
        };

        // A positive return is the completion status without the phase bit
        Ok(Completion::new(command.command_id, StatusField::from_raw((status as u16) << 1))
            .with_result(cmd.result)
            .to_bytes())
    }

    fn device_name(&self, handle: TargetHandle) -> Option<String> {
        self.targets.lock().get(&handle).and_then(|t| t.device.clone())
    }

    fn close(&self, handle: TargetHandle, delete_controller: bool) -> Result<(), TransportError> {
        let (spec, device) = self
            .targets
            .lock()
            .get(&handle)
            .map(|t| (t.spec.clone(), t.device.clone()))
            .ok_or_else(|| TransportError::NotConnected {
                target: handle.to_string(),
            })?;

        if delete_controller && spec.address.transport != TransportType::Pcie {
            if let Some(device) = &device {
                self.delete_controller(&spec, device)?;
            }
        }
        self.targets.lock().remove(&handle);
        Ok(())
    }
}

// =============================================================================
// Fabrics Control Device
// =============================================================================

/// Build the option string written to the fabrics control device
fn connect_options(spec: &TargetSpec, command: &Command, data: &ConnectData) -> String {
    let address = &spec.address;
    let params = connect_params(command);

    let mut options = vec![
        format!("nqn={}", data.subnqn),
        format!("transport={}", address.transport),
        format!("traddr={}", address.traddr),
    ];
    if let Some(trsvcid) = &address.trsvcid {
        options.push(format!("trsvcid={}", trsvcid));
    }
    if let Some(host_traddr) = &address.host_traddr {
        options.push(format!("host_traddr={}", host_traddr));
    }
    if let Some(host_iface) = &address.host_iface {
        options.push(format!("host_iface={}", host_iface));
    }
    options.push(format!("hostnqn={}", data.hostnqn));
    options.push(format!("hostid={}", data.hostid.hyphenated()));
    if params.qid == 0 && params.sqsize > 0 {
        options.push(format!("queue_size={}", params.sqsize as u32 + 1));
    }
    if params.kato > 0 {
        options.push(format!("keep_alive_tmo={}", params.kato.div_ceil(1000)));
    }
    options.join(",")
}

/// Parse `instance=N,cntlid=M` returned by the fabrics control device
fn parse_connect_reply(reply: &str) -> Option<(u32, u16)> {
    let mut instance = None;
    let mut cntlid = None;
    for part in reply.trim().split(',') {
        match part.split_once('=') {
            Some(("instance", value)) => instance = value.trim().parse().ok(),
            Some(("cntlid", value)) => cntlid = value.trim().parse().ok(),
            _ => {}
        }
    }
    Some((instance?, cntlid.unwrap_or(0)))
}

fn io_error(target: &TargetSpec, opcode: &str, error: &std::io::Error) -> TransportError {
    TransportError::from_errno(
        target.to_string(),
        opcode,
        error.raw_os_error().unwrap_or(libc::EIO),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::fabrics::{connect, ConnectParams};
    use crate::domain::ControllerAddress;
    use uuid::Uuid;

    #[test]
    fn test_connect_options() {
        let spec = TargetSpec::new(
            ControllerAddress::new(TransportType::Tcp, "192.168.1.20")
                .with_trsvcid("4420")
                .with_host_iface("eth1"),
        );
        let data = ConnectData::new(
            Uuid::parse_str("4b4c8f3a-1c7e-4a59-9d7c-3e2f1a6b5c4d").unwrap(),
            "nqn.2024-01.io.example:array1",
            "nqn.2014-08.org.nvmexpress:uuid:4b4c8f3a-1c7e-4a59-9d7c-3e2f1a6b5c4d",
        );
        let (command, _) = connect(ConnectParams::admin(127, 5_000), &data).unwrap();

        assert_eq!(
            connect_options(&spec, &command, &data),
            "nqn=nqn.2024-01.io.example:array1,transport=tcp,traddr=192.168.1.20,\
             trsvcid=4420,host_iface=eth1,\
             hostnqn=nqn.2014-08.org.nvmexpress:uuid:4b4c8f3a-1c7e-4a59-9d7c-3e2f1a6b5c4d,\
             hostid=4b4c8f3a-1c7e-4a59-9d7c-3e2f1a6b5c4d,queue_size=128,keep_alive_tmo=5"
        );
    }

    #[test]
    fn test_parse_connect_reply() {
        assert_eq!(parse_connect_reply("instance=3,cntlid=17\n"), Some((3, 17)));
        assert_eq!(parse_connect_reply("instance=0"), Some((0, 0)));
        assert_eq!(parse_connect_reply("error"), None);
    }

    #[test]
    fn test_open_pcie_requires_device() {
        let passthrough = LinuxPassthrough::default();
        let spec = TargetSpec::new(ControllerAddress::new(TransportType::Pcie, "0000:01:00.0"));
        assert!(matches!(
            passthrough.open(&spec),
            Err(TransportError::NotConnected { .. })
        ));
    }

    #[test]
    fn test_open_fabrics_defers_device() {
        let passthrough = LinuxPassthrough::default();
        let spec = TargetSpec::new(
            ControllerAddress::new(TransportType::Tcp, "10.0.0.1").with_trsvcid("8009"),
        );
        let handle = passthrough.open(&spec).unwrap();
        assert_eq!(passthrough.device_name(handle), None);
        passthrough.close(handle, true).unwrap();
    }

    #[test]
    fn test_failed_delete_keeps_handle() {
        let dir = tempfile::tempdir().unwrap();
        let dev_dir = dir.path().join("dev");
        let class_dir = dir.path().join("class");
        std::fs::create_dir_all(&dev_dir).unwrap();
        std::fs::write(dev_dir.join("nvme5"), b"").unwrap();
        let passthrough = LinuxPassthrough::new(LinuxPassthroughConfig {
            fabrics_device: dir.path().join("nvme-fabrics"),
            class_dir: class_dir.clone(),
            dev_dir,
        });
        let spec = TargetSpec::existing(
            ControllerAddress::new(TransportType::Tcp, "10.0.0.1").with_trsvcid("4420"),
            "nvme5",
        );
        let handle = passthrough.open(&spec).unwrap();

        // No sysfs entry to write
        assert!(passthrough.close(handle, true).is_err());
        assert_eq!(passthrough.device_name(handle).as_deref(), Some("nvme5"));

        std::fs::create_dir_all(class_dir.join("nvme5")).unwrap();
        passthrough.close(handle, true).unwrap();
        assert_eq!(
            std::fs::read_to_string(class_dir.join("nvme5").join("delete_controller")).unwrap(),
            "1"
        );
        assert!(passthrough.device_name(handle).is_none());
    }
}
