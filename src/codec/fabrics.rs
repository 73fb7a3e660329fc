//! Fabrics Commands
//!
//! Connect, Property Get/Set and Disconnect capsules plus the 1024-byte
//! Connect data block.

use super::command::{encode_fabrics, Command};
use super::completion::Completion;
use super::opcode::FabricsCommandType;
use super::{read_fixed_str, write_fixed_str};
use crate::error::ProtocolError;
use uuid::Uuid;

/// Size of the Connect command data block
pub const CONNECT_DATA_SIZE: usize = 1024;

/// Maximum length of an NVMe qualified name
pub const NQN_MAX_LEN: usize = 223;

/// CNTLID requesting a dynamic controller
pub const DYNAMIC_CNTLID: u16 = 0xffff;

const HOSTID_OFFSET: usize = 0;
const CNTLID_OFFSET: usize = 16;
const SUBNQN_OFFSET: usize = 256;
const HOSTNQN_OFFSET: usize = 512;
const NQN_FIELD_LEN: usize = 256;

/// Controller property offsets reachable with Property Get/Set
pub mod property {
    pub const CAP: u32 = 0x00;
    pub const VS: u32 = 0x08;
    pub const CC: u32 = 0x14;
    pub const CSTS: u32 = 0x1c;
    pub const NSSR: u32 = 0x20;
}

/// Check that an NQN fits its wire field
pub fn validate_nqn(field: &'static str, nqn: &str) -> Result<(), ProtocolError> {
    if nqn.is_empty() {
        return Err(ProtocolError::InvalidField {
            field,
            reason: "NQN is empty".into(),
        });
    }
    if nqn.len() > NQN_MAX_LEN {
        return Err(ProtocolError::InvalidField {
            field,
            reason: format!("NQN is {} bytes, limit is {}", nqn.len(), NQN_MAX_LEN),
        });
    }
    if !nqn.is_ascii() || nqn.bytes().any(|b| b.is_ascii_control()) {
        return Err(ProtocolError::InvalidField {
            field,
            reason: "NQN contains non-printable characters".into(),
        });
    }
    Ok(())
}

// =============================================================================
// Connect
// =============================================================================

/// Queue parameters of a Connect command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectParams {
    /// Record format, 0 for this revision
    pub recfmt: u16,
    /// 0 for the admin queue
    pub qid: u16,
    /// Zero-based submission queue size
    pub sqsize: u16,
    pub cattr: u8,
    /// Keep alive timeout in milliseconds (admin queue only)
    pub kato: u32,
}

impl ConnectParams {
    /// Parameters for an admin queue connect
    pub fn admin(sqsize: u16, kato: u32) -> Self {
        Self {
            recfmt: 0,
            qid: 0,
            sqsize,
            cattr: 0,
            kato,
        }
    }
}

impl Default for ConnectParams {
    fn default() -> Self {
        Self::admin(31, 0)
    }
}

/// The Connect data block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectData {
    pub hostid: Uuid,
    pub cntlid: u16,
    pub subnqn: String,
    pub hostnqn: String,
}

impl ConnectData {
    pub fn new(hostid: Uuid, subnqn: impl Into<String>, hostnqn: impl Into<String>) -> Self {
        Self {
            hostid,
            cntlid: DYNAMIC_CNTLID,
            subnqn: subnqn.into(),
            hostnqn: hostnqn.into(),
        }
    }

    pub fn validate(&self) -> Result<(), ProtocolError> {
        validate_nqn("subnqn", &self.subnqn)?;
        validate_nqn("hostnqn", &self.hostnqn)
    }

    pub fn to_bytes(&self) -> Result<[u8; CONNECT_DATA_SIZE], ProtocolError> {
        self.validate()?;
        let mut data = [0u8; CONNECT_DATA_SIZE];
        data[HOSTID_OFFSET..HOSTID_OFFSET + 16].copy_from_slice(self.hostid.as_bytes());
        data[CNTLID_OFFSET..CNTLID_OFFSET + 2].copy_from_slice(&self.cntlid.to_le_bytes());
        write_fixed_str(&mut data[SUBNQN_OFFSET..SUBNQN_OFFSET + NQN_FIELD_LEN], &self.subnqn);
        write_fixed_str(&mut data[HOSTNQN_OFFSET..HOSTNQN_OFFSET + NQN_FIELD_LEN], &self.hostnqn);
        Ok(data)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() < CONNECT_DATA_SIZE {
            return Err(ProtocolError::MalformedData {
                structure: "connect data",
                reason: format!("{} bytes, expected {}", data.len(), CONNECT_DATA_SIZE),
            });
        }
        let mut hostid = [0u8; 16];
        hostid.copy_from_slice(&data[HOSTID_OFFSET..HOSTID_OFFSET + 16]);
        let parsed = Self {
            hostid: Uuid::from_bytes(hostid),
            cntlid: u16::from_le_bytes([data[CNTLID_OFFSET], data[CNTLID_OFFSET + 1]]),
            subnqn: read_fixed_str(&data[SUBNQN_OFFSET..SUBNQN_OFFSET + NQN_FIELD_LEN]),
            hostnqn: read_fixed_str(&data[HOSTNQN_OFFSET..HOSTNQN_OFFSET + NQN_FIELD_LEN]),
        };
        parsed.validate()?;
        Ok(parsed)
    }
}

/// Encode a Connect capsule and its data block
pub fn connect(
    params: ConnectParams,
    data: &ConnectData,
) -> Result<(Command, [u8; CONNECT_DATA_SIZE]), ProtocolError> {
    let block = data.to_bytes()?;
    let command = encode_fabrics(
        FabricsCommandType::Connect,
        [
            params.recfmt as u32 | (params.qid as u32) << 16,
            params.sqsize as u32 | (params.cattr as u32) << 16,
            params.kato,
            0,
            0,
            0,
        ],
        CONNECT_DATA_SIZE,
    )?;
    Ok((command, block))
}

/// Recover the queue parameters from an encoded Connect capsule
pub fn connect_params(command: &Command) -> ConnectParams {
    ConnectParams {
        recfmt: command.cdw[0] as u16,
        qid: (command.cdw[0] >> 16) as u16,
        sqsize: command.cdw[1] as u16,
        cattr: (command.cdw[1] >> 16) as u8,
        kato: command.cdw[2],
    }
}

/// Result of a successful Connect
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectResponse {
    /// Controller id assigned by the subsystem
    pub cntlid: u16,
    /// Authentication requirements
    pub authreq: u16,
}

impl ConnectResponse {
    pub fn from_completion(completion: &Completion) -> Self {
        Self {
            cntlid: completion.result as u16,
            authreq: (completion.result >> 16) as u16,
        }
    }

    pub fn result(&self) -> u32 {
        self.cntlid as u32 | (self.authreq as u32) << 16
    }
}

// =============================================================================
// Properties / Disconnect
// =============================================================================

/// Property Get of a 4- or 8-byte property
pub fn property_get(offset: u32, eight_bytes: bool) -> Result<Command, ProtocolError> {
    encode_fabrics(
        FabricsCommandType::PropertyGet,
        [eight_bytes as u32, offset, 0, 0, 0, 0],
        0,
    )
}

/// Property Set of a 4- or 8-byte property
pub fn property_set(offset: u32, value: u64, eight_bytes: bool) -> Result<Command, ProtocolError> {
    if !eight_bytes && value > u32::MAX as u64 {
        return Err(ProtocolError::InvalidField {
            field: "value",
            reason: format!("{:#x} does not fit a 4-byte property", value),
        });
    }
    encode_fabrics(
        FabricsCommandType::PropertySet,
        [
            eight_bytes as u32,
            offset,
            value as u32,
            (value >> 32) as u32,
            0,
            0,
        ],
        0,
    )
}

/// Disconnect the queue the capsule is submitted on
pub fn disconnect() -> Result<Command, ProtocolError> {
    encode_fabrics(FabricsCommandType::Disconnect, [0; 6], 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::completion::StatusField;
    use crate::codec::opcode::Opcode;
    use crate::domain::{QueueKind, DISCOVERY_NQN};

    const HOSTNQN: &str = "nqn.2014-08.org.nvmexpress:uuid:4b4c8f3a-1c7e-4a59-9d7c-3e2f1a6b5c4d";

    #[test]
    fn test_connect_capsule_layout() {
        let hostid = Uuid::parse_str("4b4c8f3a-1c7e-4a59-9d7c-3e2f1a6b5c4d").unwrap();
        let data = ConnectData::new(hostid, DISCOVERY_NQN, HOSTNQN);
        let (command, block) = connect(ConnectParams::admin(31, 120_000), &data).unwrap();

        let sqe = command.with_command_id(9).to_bytes();
        assert_eq!(sqe[0], 0x7f);
        assert_eq!(sqe[4], 0x01);
        assert_eq!(&sqe[2..4], &9u16.to_le_bytes());
        assert_eq!(&sqe[40..44], &0u32.to_le_bytes());
        assert_eq!(&sqe[44..48], &31u32.to_le_bytes());
        assert_eq!(&sqe[48..52], &120_000u32.to_le_bytes());

        assert_eq!(&block[0..16], hostid.as_bytes());
        assert_eq!(&block[16..18], &[0xff, 0xff]);
        assert_eq!(&block[256..256 + DISCOVERY_NQN.len()], DISCOVERY_NQN.as_bytes());
        assert_eq!(block[256 + DISCOVERY_NQN.len()], 0);
        assert_eq!(&block[512..512 + HOSTNQN.len()], HOSTNQN.as_bytes());

        let parsed = Command::from_bytes(&sqe, QueueKind::Admin).unwrap();
        assert_eq!(parsed.opcode, Opcode::Fabrics(FabricsCommandType::Connect));
        assert_eq!(connect_params(&parsed), ConnectParams::admin(31, 120_000));
        assert_eq!(ConnectData::from_bytes(&block).unwrap(), data);
    }

    #[test]
    fn test_connect_rejects_long_nqn() {
        let data = ConnectData::new(Uuid::nil(), "n".repeat(NQN_MAX_LEN + 1), HOSTNQN);
        assert!(matches!(
            connect(ConnectParams::default(), &data),
            Err(ProtocolError::InvalidField { field: "subnqn", .. })
        ));

        let data = ConnectData::new(Uuid::nil(), "n".repeat(NQN_MAX_LEN), HOSTNQN);
        assert!(connect(ConnectParams::default(), &data).is_ok());
    }

    #[test]
    fn test_connect_response() {
        let completion = Completion::new(1, StatusField::SUCCESS).with_result(0x0001_0005);
        let response = ConnectResponse::from_completion(&completion);
        assert_eq!(response.cntlid, 5);
        assert_eq!(response.authreq, 1);
        assert_eq!(response.result(), 0x0001_0005);
    }

    #[test]
    fn test_property_commands() {
        let get = property_get(property::CAP, true).unwrap();
        assert_eq!(get.cdw[0], 1);
        assert_eq!(get.cdw[1], property::CAP);
        assert_eq!(get.data_len, 0);

        let set = property_set(property::CC, 0x0046_0001, false).unwrap();
        assert_eq!(set.cdw[1], 0x14);
        assert_eq!(set.cdw[2], 0x0046_0001);
        assert!(property_set(property::CC, 1 << 40, false).is_err());

        let sqe = disconnect().unwrap().to_bytes();
        assert_eq!(sqe[4], 0x08);
    }
}
