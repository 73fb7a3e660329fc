//! Transport Addressing
//!
//! Transport types, address families and the controller address tuple that
//! identifies a controller within a subsystem.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Well-known NQN of the discovery subsystem
pub const DISCOVERY_NQN: &str = "nqn.2014-08.org.nvmexpress.discovery";

/// Default NVMe/TCP and NVMe/RDMA I/O port
pub const DEFAULT_IO_PORT: &str = "4420";

/// Default NVMe/TCP discovery port
pub const DEFAULT_DISCOVERY_PORT: &str = "8009";

// =============================================================================
// Transport Type
// =============================================================================

/// Transport a controller is reached over
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportType {
    Pcie,
    Rdma,
    Fc,
    Tcp,
    Loop,
}

impl TransportType {
    /// Decode the TRTYPE field of a discovery log entry
    pub fn from_trtype(value: u8) -> Option<Self> {
        match value {
            1 => Some(TransportType::Rdma),
            2 => Some(TransportType::Fc),
            3 => Some(TransportType::Tcp),
            254 => Some(TransportType::Loop),
            _ => None,
        }
    }

    /// TRTYPE wire value (PCIe has none)
    pub fn trtype(&self) -> Option<u8> {
        match self {
            TransportType::Pcie => None,
            TransportType::Rdma => Some(1),
            TransportType::Fc => Some(2),
            TransportType::Tcp => Some(3),
            TransportType::Loop => Some(254),
        }
    }

    /// Whether the transport is a fabrics transport
    pub fn is_fabrics(&self) -> bool {
        !matches!(self, TransportType::Pcie)
    }

    /// Whether the transport is addressed by IP address and service id
    pub fn is_ip_based(&self) -> bool {
        matches!(self, TransportType::Tcp | TransportType::Rdma)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransportType::Pcie => "pcie",
            TransportType::Rdma => "rdma",
            TransportType::Fc => "fc",
            TransportType::Tcp => "tcp",
            TransportType::Loop => "loop",
        }
    }
}

impl std::fmt::Display for TransportType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TransportType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "pcie" => Ok(TransportType::Pcie),
            "rdma" => Ok(TransportType::Rdma),
            "fc" => Ok(TransportType::Fc),
            "tcp" => Ok(TransportType::Tcp),
            "loop" => Ok(TransportType::Loop),
            other => Err(format!("unknown transport type: {}", other)),
        }
    }
}

// =============================================================================
// Address Family / Subsystem Type
// =============================================================================

/// ADRFAM field of a discovery log entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressFamily {
    Ipv4,
    Ipv6,
    Ib,
    Fc,
    Loop,
}

impl AddressFamily {
    pub fn from_adrfam(value: u8) -> Option<Self> {
        match value {
            1 => Some(AddressFamily::Ipv4),
            2 => Some(AddressFamily::Ipv6),
            3 => Some(AddressFamily::Ib),
            4 => Some(AddressFamily::Fc),
            254 => Some(AddressFamily::Loop),
            _ => None,
        }
    }

    pub fn adrfam(&self) -> u8 {
        match self {
            AddressFamily::Ipv4 => 1,
            AddressFamily::Ipv6 => 2,
            AddressFamily::Ib => 3,
            AddressFamily::Fc => 4,
            AddressFamily::Loop => 254,
        }
    }
}

/// SUBTYPE field of a discovery log entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SubsystemType {
    /// Referral to another discovery subsystem
    Discovery,
    /// NVM subsystem carrying namespaces
    Nvm,
    /// The discovery subsystem that returned the log
    CurrentDiscovery,
}

impl SubsystemType {
    pub fn from_subtype(value: u8) -> Option<Self> {
        match value {
            1 => Some(SubsystemType::Discovery),
            2 => Some(SubsystemType::Nvm),
            3 => Some(SubsystemType::CurrentDiscovery),
            _ => None,
        }
    }

    pub fn subtype(&self) -> u8 {
        match self {
            SubsystemType::Discovery => 1,
            SubsystemType::Nvm => 2,
            SubsystemType::CurrentDiscovery => 3,
        }
    }
}

impl std::fmt::Display for SubsystemType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubsystemType::Discovery => write!(f, "discovery"),
            SubsystemType::Nvm => write!(f, "nvm"),
            SubsystemType::CurrentDiscovery => write!(f, "current-discovery"),
        }
    }
}

// =============================================================================
// Controller Address
// =============================================================================

/// Transport address tuple identifying a controller
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ControllerAddress {
    pub transport: TransportType,
    pub traddr: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trsvcid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_traddr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_iface: Option<String>,
}

impl ControllerAddress {
    pub fn new(transport: TransportType, traddr: impl Into<String>) -> Self {
        Self {
            transport,
            traddr: traddr.into(),
            trsvcid: None,
            host_traddr: None,
            host_iface: None,
        }
    }

    pub fn with_trsvcid(mut self, trsvcid: impl Into<String>) -> Self {
        self.trsvcid = Some(trsvcid.into());
        self
    }

    pub fn with_host_traddr(mut self, host_traddr: impl Into<String>) -> Self {
        self.host_traddr = Some(host_traddr.into());
        self
    }

    pub fn with_host_iface(mut self, host_iface: impl Into<String>) -> Self {
        self.host_iface = Some(host_iface.into());
        self
    }

    /// Check the tuple is complete for its transport
    pub fn validate(&self) -> Result<(), String> {
        if self.traddr.trim().is_empty() {
            return Err(format!("{} address requires traddr", self.transport));
        }
        if self.transport.is_ip_based() && self.trsvcid.as_deref().map_or(true, str::is_empty) {
            return Err(format!("{} address requires trsvcid", self.transport));
        }
        Ok(())
    }

    /// Parse the kernel `address` attribute of a controller
    ///
    /// Fabrics controllers report `traddr=..,trsvcid=..,host_traddr=..`;
    /// PCIe controllers report the bare PCI function address.
    pub fn from_sysfs(transport: TransportType, attr: &str) -> Self {
        let attr = attr.trim();
        if !attr.contains('=') {
            return Self::new(transport, attr);
        }

        let mut address = Self::new(transport, "");
        for part in attr.split(',') {
            let Some((key, value)) = part.split_once('=') else {
                continue;
            };
            let value = value.trim().to_string();
            match key.trim() {
                "traddr" => address.traddr = value,
                "trsvcid" => address.trsvcid = Some(value),
                "host_traddr" | "src_addr" => address.host_traddr = Some(value),
                "host_iface" => address.host_iface = Some(value),
                _ => {}
            }
        }
        address
    }
}

impl std::fmt::Display for ControllerAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} traddr={}", self.transport, self.traddr)?;
        if let Some(trsvcid) = &self.trsvcid {
            write!(f, ",trsvcid={}", trsvcid)?;
        }
        if let Some(host_traddr) = &self.host_traddr {
            write!(f, ",host_traddr={}", host_traddr)?;
        }
        if let Some(host_iface) = &self.host_iface {
            write!(f, ",host_iface={}", host_iface)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_type_round_trip() {
        assert_eq!(TransportType::from_trtype(3), Some(TransportType::Tcp));
        assert_eq!(TransportType::from_trtype(1), Some(TransportType::Rdma));
        assert_eq!(TransportType::from_trtype(9), None);
        assert_eq!(TransportType::Pcie.trtype(), None);
        assert_eq!("TCP".parse::<TransportType>().unwrap(), TransportType::Tcp);
        assert!("ib".parse::<TransportType>().is_err());
    }

    #[test]
    fn test_address_from_sysfs_fabrics() {
        let addr = ControllerAddress::from_sysfs(
            TransportType::Tcp,
            "traddr=192.168.10.5,trsvcid=4420,src_addr=192.168.10.1\n",
        );
        assert_eq!(addr.traddr, "192.168.10.5");
        assert_eq!(addr.trsvcid.as_deref(), Some("4420"));
        assert_eq!(addr.host_traddr.as_deref(), Some("192.168.10.1"));
        assert!(addr.host_iface.is_none());
    }

    #[test]
    fn test_address_from_sysfs_pcie() {
        let addr = ControllerAddress::from_sysfs(TransportType::Pcie, "0000:01:00.0\n");
        assert_eq!(addr.traddr, "0000:01:00.0");
        assert!(addr.trsvcid.is_none());
        assert!(addr.validate().is_ok());
    }

    #[test]
    fn test_address_validate() {
        let addr = ControllerAddress::new(TransportType::Tcp, "10.0.0.1");
        assert!(addr.validate().is_err());
        assert!(addr.with_trsvcid("4420").validate().is_ok());
        assert!(ControllerAddress::new(TransportType::Fc, " ").validate().is_err());
    }

    #[test]
    fn test_address_display() {
        let addr = ControllerAddress::new(TransportType::Tcp, "10.0.0.1")
            .with_trsvcid("4420")
            .with_host_iface("eth0");
        assert_eq!(
            addr.to_string(),
            "tcp traddr=10.0.0.1,trsvcid=4420,host_iface=eth0"
        );
    }
}
