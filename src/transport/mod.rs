//! Transport Gateway
//!
//! Bridges encoded commands to the passthrough port. The gateway owns the
//! handle table; the passthrough implementations talk to the kernel or to
//! an in-memory simulation.

pub mod gateway;
#[cfg(target_os = "linux")]
pub mod linux;
pub mod simulator;

pub use gateway::{GatewayConfig, TransportGateway};
#[cfg(target_os = "linux")]
pub use linux::{LinuxPassthrough, LinuxPassthroughConfig};
pub use simulator::{SimCall, SimRequest, SimResponse, SimulatedPassthrough};
