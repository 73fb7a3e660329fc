//! Domain Ports - Boundaries to the operating system
//!
//! These traits define where the library meets the kernel. Production
//! builds supply the Linux implementations; tests supply in-memory ones.

use crate::codec::{CQE_SIZE, SQE_SIZE};
use crate::domain::ControllerAddress;
use crate::error::{Result, TransportError};
use crate::topology::SystemSnapshot;
use std::sync::Arc;
use std::time::Duration;

// =============================================================================
// Passthrough Types
// =============================================================================

/// Queue a raw command is submitted to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueKind {
    Admin,
    Io,
}

impl std::fmt::Display for QueueKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueueKind::Admin => write!(f, "admin"),
            QueueKind::Io => write!(f, "io"),
        }
    }
}

/// Data buffer accompanying a command
#[derive(Debug)]
pub enum DataBuffer<'a> {
    None,
    /// Controller-to-host transfer
    FromDevice(&'a mut [u8]),
    /// Host-to-controller transfer
    ToDevice(&'a [u8]),
}

impl DataBuffer<'_> {
    pub fn len(&self) -> usize {
        match self {
            DataBuffer::None => 0,
            DataBuffer::FromDevice(buf) => buf.len(),
            DataBuffer::ToDevice(buf) => buf.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Opaque handle to an opened target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TargetHandle(pub u64);

impl std::fmt::Display for TargetHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "handle-{}", self.0)
    }
}

/// What to open a handle to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetSpec {
    /// Address tuple of the controller
    pub address: ControllerAddress,
    /// Kernel instance name when the controller already exists (e.g. nvme3)
    pub device: Option<String>,
}

impl TargetSpec {
    pub fn new(address: ControllerAddress) -> Self {
        Self {
            address,
            device: None,
        }
    }

    pub fn existing(address: ControllerAddress, device: impl Into<String>) -> Self {
        Self {
            address,
            device: Some(device.into()),
        }
    }
}

impl std::fmt::Display for TargetSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.device {
            Some(device) => write!(f, "{} ({})", device, self.address),
            None => write!(f, "{}", self.address),
        }
    }
}

// =============================================================================
// Passthrough Port
// =============================================================================

/// Port for the kernel passthrough call
///
/// Implementations receive a fully encoded submission queue entry and
/// return the raw completion queue entry. They never retry.
pub trait Passthrough: Send + Sync {
    /// Open a handle to a target. Fabrics targets may be opened before a
    /// Connect command has been executed on them.
    fn open(&self, target: &TargetSpec) -> std::result::Result<TargetHandle, TransportError>;

    /// Execute one command and wait for its completion
    fn execute(
        &self,
        handle: TargetHandle,
        queue: QueueKind,
        sqe: &[u8; SQE_SIZE],
        data: DataBuffer<'_>,
        timeout: Duration,
    ) -> std::result::Result<[u8; CQE_SIZE], TransportError>;

    /// Kernel instance name bound to the handle, once known
    fn device_name(&self, handle: TargetHandle) -> Option<String>;

    /// Release a handle, optionally tearing down the fabrics association
    fn close(
        &self,
        handle: TargetHandle,
        delete_controller: bool,
    ) -> std::result::Result<(), TransportError>;
}

// =============================================================================
// Topology Source Port
// =============================================================================

/// Port for reading the live system topology
pub trait TopologySource: Send + Sync {
    /// Take a consistent snapshot of subsystems, controllers and namespaces
    fn scan(&self) -> Result<SystemSnapshot>;
}

// =============================================================================
// Type Aliases for Arc'd Traits
// =============================================================================

pub type PassthroughRef = Arc<dyn Passthrough>;
pub type TopologySourceRef = Arc<dyn TopologySource>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::TransportType;

    #[test]
    fn test_data_buffer_len() {
        let mut buf = [0u8; 16];
        assert_eq!(DataBuffer::FromDevice(&mut buf).len(), 16);
        assert_eq!(DataBuffer::ToDevice(&[1, 2, 3]).len(), 3);
        assert!(DataBuffer::None.is_empty());
    }

    #[test]
    fn test_target_spec_display() {
        let addr = ControllerAddress::new(TransportType::Pcie, "0000:01:00.0");
        assert_eq!(
            TargetSpec::existing(addr.clone(), "nvme0").to_string(),
            "nvme0 (pcie traddr=0000:01:00.0)"
        );
        assert_eq!(TargetSpec::new(addr).to_string(), "pcie traddr=0000:01:00.0");
    }
}
