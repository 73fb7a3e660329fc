//! Discovery Log Page
//!
//! Parses the discovery log (log identifier 70h) into entries. A malformed
//! entry is skipped with a reason; it never fails the whole page.

use super::{read_fixed_str, write_fixed_str};
use crate::domain::{AddressFamily, ControllerAddress, SubsystemType, TransportType};
use crate::error::ProtocolError;
use bytes::{Buf, BufMut, BytesMut};
use serde::Serialize;

/// Size of the log header, entries start right after it
pub const DISCOVERY_LOG_HEADER_SIZE: usize = 1024;

/// Size of one log entry
pub const DISCOVERY_LOG_ENTRY_SIZE: usize = 1024;

/// Bytes of the header that carry fields
const HEADER_FIELDS_LEN: usize = 18;

/// Discovery log header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DiscoveryLogHeader {
    /// Generation counter, changes whenever the log changes
    pub genctr: u64,
    /// Number of records
    pub numrec: u64,
    pub recfmt: u16,
}

impl DiscoveryLogHeader {
    pub fn parse(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() < HEADER_FIELDS_LEN {
            return Err(ProtocolError::MalformedData {
                structure: "discovery log header",
                reason: format!("{} bytes", data.len()),
            });
        }
        let mut buf = data;
        Ok(Self {
            genctr: buf.get_u64_le(),
            numrec: buf.get_u64_le(),
            recfmt: buf.get_u16_le(),
        })
    }

    /// Total log size in bytes for `numrec` entries
    pub fn log_len(&self) -> Option<usize> {
        usize::try_from(self.numrec)
            .ok()?
            .checked_mul(DISCOVERY_LOG_ENTRY_SIZE)?
            .checked_add(DISCOVERY_LOG_HEADER_SIZE)
    }
}

// =============================================================================
// Entries
// =============================================================================

/// One subsystem port advertised by a discovery controller
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiscoveryLogEntry {
    pub transport: TransportType,
    pub adrfam: Option<AddressFamily>,
    pub subtype: SubsystemType,
    /// Transport requirements
    pub treq: u8,
    pub portid: u16,
    pub cntlid: u16,
    /// Admin max submission queue size
    pub asqsz: u16,
    pub eflags: u16,
    pub trsvcid: String,
    pub subnqn: String,
    pub traddr: String,
    /// ANA group of the port, not carried by the standard entry format
    pub ana_group_id: Option<u32>,
}

impl DiscoveryLogEntry {
    /// Entry for an NVM subsystem port
    pub fn nvm(transport: TransportType, subnqn: &str, traddr: &str, trsvcid: &str) -> Self {
        Self {
            transport,
            adrfam: match transport {
                TransportType::Tcp | TransportType::Rdma => Some(AddressFamily::Ipv4),
                TransportType::Fc => Some(AddressFamily::Fc),
                TransportType::Loop => Some(AddressFamily::Loop),
                TransportType::Pcie => None,
            },
            subtype: SubsystemType::Nvm,
            treq: 0,
            portid: 1,
            cntlid: 0xffff,
            asqsz: 32,
            eflags: 0,
            trsvcid: trsvcid.into(),
            subnqn: subnqn.into(),
            traddr: traddr.into(),
            ana_group_id: None,
        }
    }

    /// Whether the entry points at another discovery controller
    pub fn is_referral(&self) -> bool {
        self.subtype == SubsystemType::Discovery
    }

    /// Controller address tuple of the advertised port
    pub fn address(&self) -> ControllerAddress {
        let address = ControllerAddress::new(self.transport, self.traddr.clone());
        if self.trsvcid.is_empty() {
            address
        } else {
            address.with_trsvcid(self.trsvcid.clone())
        }
    }

    /// Parse one 1024-byte record
    pub fn parse(record: &[u8]) -> Result<Self, SkipReason> {
        if record.len() < DISCOVERY_LOG_ENTRY_SIZE {
            return Err(SkipReason::Truncated {
                available: record.len(),
            });
        }
        let transport =
            TransportType::from_trtype(record[0]).ok_or(SkipReason::UnknownTransport(record[0]))?;
        let subtype = SubsystemType::from_subtype(record[2])
            .ok_or(SkipReason::UnknownSubsystemType(record[2]))?;

        let mut buf = &record[4..12];
        let portid = buf.get_u16_le();
        let cntlid = buf.get_u16_le();
        let asqsz = buf.get_u16_le();
        let eflags = buf.get_u16_le();

        let entry = Self {
            transport,
            adrfam: AddressFamily::from_adrfam(record[1]),
            subtype,
            treq: record[3],
            portid,
            cntlid,
            asqsz,
            eflags,
            trsvcid: read_fixed_str(&record[32..64]),
            subnqn: read_fixed_str(&record[256..512]),
            traddr: read_fixed_str(&record[512..768]),
            ana_group_id: None,
        };

        if entry.subnqn.is_empty() {
            return Err(SkipReason::MissingField("subnqn"));
        }
        if entry.traddr.is_empty() {
            return Err(SkipReason::MissingField("traddr"));
        }
        Ok(entry)
    }

    pub fn to_bytes(&self) -> [u8; DISCOVERY_LOG_ENTRY_SIZE] {
        let mut buf = BytesMut::with_capacity(12);
        buf.put_u8(self.transport.trtype().unwrap_or(0));
        buf.put_u8(self.adrfam.map_or(0, |a| a.adrfam()));
        buf.put_u8(self.subtype.subtype());
        buf.put_u8(self.treq);
        buf.put_u16_le(self.portid);
        buf.put_u16_le(self.cntlid);
        buf.put_u16_le(self.asqsz);
        buf.put_u16_le(self.eflags);

        let mut record = [0u8; DISCOVERY_LOG_ENTRY_SIZE];
        record[..12].copy_from_slice(&buf);
        write_fixed_str(&mut record[32..64], &self.trsvcid);
        write_fixed_str(&mut record[256..512], &self.subnqn);
        write_fixed_str(&mut record[512..768], &self.traddr);
        record
    }
}

/// Why a log entry was not turned into a `DiscoveryLogEntry`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum SkipReason {
    Truncated { available: usize },
    UnknownTransport(u8),
    UnknownSubsystemType(u8),
    MissingField(&'static str),
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::Truncated { available } => {
                write!(f, "truncated entry ({} bytes)", available)
            }
            SkipReason::UnknownTransport(t) => write!(f, "unknown transport type {}", t),
            SkipReason::UnknownSubsystemType(t) => write!(f, "unknown subsystem type {}", t),
            SkipReason::MissingField(field) => write!(f, "missing {}", field),
        }
    }
}

/// An entry that was skipped while parsing
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedEntry {
    pub index: u64,
    pub reason: SkipReason,
}

// =============================================================================
// Log
// =============================================================================

/// A parsed discovery log page
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiscoveryLog {
    pub header: DiscoveryLogHeader,
    pub entries: Vec<DiscoveryLogEntry>,
    pub skipped: Vec<SkippedEntry>,
}

impl DiscoveryLog {
    /// Parse a log page holding the header and up to `numrec` entries
    ///
    /// Records missing from the buffer are reported as one truncated skip.
    pub fn parse(data: &[u8]) -> Result<Self, ProtocolError> {
        let header = DiscoveryLogHeader::parse(data)?;
        let mut entries = Vec::new();
        let mut skipped = Vec::new();

        let records = data.get(DISCOVERY_LOG_HEADER_SIZE..).unwrap_or(&[]);
        let mut index = 0u64;
        let mut partial = false;
        for record in records.chunks(DISCOVERY_LOG_ENTRY_SIZE) {
            if index >= header.numrec {
                break;
            }
            partial = record.len() < DISCOVERY_LOG_ENTRY_SIZE;
            match DiscoveryLogEntry::parse(record) {
                Ok(entry) => entries.push(entry),
                Err(reason) => skipped.push(SkippedEntry { index, reason }),
            }
            index += 1;
        }
        if index < header.numrec && !partial {
            skipped.push(SkippedEntry {
                index,
                reason: SkipReason::Truncated { available: 0 },
            });
        }

        Ok(Self {
            header,
            entries,
            skipped,
        })
    }
}

/// Serialize a complete log page
pub fn build_discovery_log(genctr: u64, entries: &[DiscoveryLogEntry]) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(
        DISCOVERY_LOG_HEADER_SIZE + entries.len() * DISCOVERY_LOG_ENTRY_SIZE,
    );
    buf.put_u64_le(genctr);
    buf.put_u64_le(entries.len() as u64);
    buf.put_u16_le(0);
    buf.put_bytes(0, DISCOVERY_LOG_HEADER_SIZE - HEADER_FIELDS_LEN);
    for entry in entries {
        buf.put_slice(&entry.to_bytes());
    }
    buf.to_vec()
}
