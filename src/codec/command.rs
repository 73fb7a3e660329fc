//! Submission Queue Entries
//!
//! Encodes Admin, I/O and Fabrics commands into the 64-byte submission queue
//! entry layout. Every multi-byte field is written little-endian.

use super::opcode::{AdminOpcode, DataDirection, FabricsCommandType, IoOpcode, Opcode, FABRICS_OPCODE};
use crate::domain::QueueKind;
use crate::error::ProtocolError;
use bytes::{Buf, BufMut, BytesMut};

/// Size of a submission queue entry
pub const SQE_SIZE: usize = 64;

/// Identify data structure size
pub const IDENTIFY_DATA_SIZE: usize = 4096;

/// Identify CNS values
pub mod cns {
    pub const NAMESPACE: u8 = 0x00;
    pub const CONTROLLER: u8 = 0x01;
    pub const ACTIVE_NAMESPACES: u8 = 0x02;
    pub const NAMESPACE_DESCRIPTORS: u8 = 0x03;
}

/// Log page identifiers
pub mod log_id {
    pub const ERROR_INFORMATION: u8 = 0x01;
    pub const HEALTH_INFORMATION: u8 = 0x02;
    pub const FIRMWARE_SLOT: u8 = 0x03;
    pub const ANA: u8 = 0x0c;
    pub const DISCOVERY: u8 = 0x70;
}

// =============================================================================
// Command
// =============================================================================

/// A decoded submission queue entry plus the sizes of its buffers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Command {
    pub opcode: Opcode,
    /// FUSE and PSDT bits (byte 1)
    pub flags: u8,
    pub command_id: u16,
    /// Namespace identifier (unused by fabrics capsules)
    pub nsid: u32,
    pub cdw2: u32,
    pub cdw3: u32,
    /// CDW10 through CDW15
    pub cdw: [u32; 6],
    /// Length of the data buffer travelling with the command
    pub data_len: u32,
    /// Length of the metadata buffer travelling with the command
    pub metadata_len: u32,
}

impl Command {
    fn new(opcode: Opcode, nsid: u32, cdw: [u32; 6], data_len: usize) -> Result<Self, ProtocolError> {
        validate_transfer(opcode, data_len)?;
        let data_len = u32::try_from(data_len).map_err(|_| ProtocolError::InvalidField {
            field: "data_len",
            reason: format!("transfer of {} bytes exceeds 32 bits", data_len),
        })?;
        Ok(Self {
            opcode,
            flags: 0,
            command_id: 0,
            nsid,
            cdw2: 0,
            cdw3: 0,
            cdw,
            data_len,
            metadata_len: 0,
        })
    }

    /// Set the command identifier
    pub fn with_command_id(mut self, command_id: u16) -> Self {
        self.command_id = command_id;
        self
    }

    /// Attach a metadata buffer length
    pub fn with_metadata_len(mut self, metadata_len: u32) -> Self {
        self.metadata_len = metadata_len;
        self
    }

    pub fn cdw10(&self) -> u32 {
        self.cdw[0]
    }

    pub fn cdw11(&self) -> u32 {
        self.cdw[1]
    }

    /// Queue this command must be submitted to
    pub fn queue(&self) -> QueueKind {
        self.opcode.queue()
    }

    /// Serialize to the 64-byte wire layout
    pub fn to_bytes(&self) -> [u8; SQE_SIZE] {
        let mut buf = BytesMut::with_capacity(SQE_SIZE);
        buf.put_u8(self.opcode.code());
        buf.put_u8(self.flags);
        buf.put_u16_le(self.command_id);
        match self.opcode {
            Opcode::Fabrics(fctype) => buf.put_u32_le(fctype.code() as u32),
            _ => buf.put_u32_le(self.nsid),
        }
        buf.put_u32_le(self.cdw2);
        buf.put_u32_le(self.cdw3);
        // MPTR and DPTR are filled in by the kernel from the attached buffers
        buf.put_bytes(0, 24);
        for dword in self.cdw {
            buf.put_u32_le(dword);
        }

        let mut sqe = [0u8; SQE_SIZE];
        sqe.copy_from_slice(&buf);
        sqe
    }

    /// Parse the 64-byte wire layout submitted to `queue`
    pub fn from_bytes(sqe: &[u8; SQE_SIZE], queue: QueueKind) -> Result<Self, ProtocolError> {
        let mut buf = &sqe[..];
        let code = buf.get_u8();
        let flags = buf.get_u8();
        let command_id = buf.get_u16_le();
        let dword1 = buf.get_u32_le();
        let cdw2 = buf.get_u32_le();
        let cdw3 = buf.get_u32_le();
        buf.advance(24);
        let mut cdw = [0u32; 6];
        for dword in cdw.iter_mut() {
            *dword = buf.get_u32_le();
        }

        let (opcode, nsid) = match queue {
            QueueKind::Admin if code == FABRICS_OPCODE => (
                Opcode::Fabrics(FabricsCommandType::try_from(sqe[4])?),
                0,
            ),
            QueueKind::Admin => (Opcode::Admin(AdminOpcode::try_from(code)?), dword1),
            QueueKind::Io => (Opcode::Io(IoOpcode::try_from(code)?), dword1),
        };

        Ok(Self {
            opcode,
            flags,
            command_id,
            nsid,
            cdw2,
            cdw3,
            cdw,
            data_len: 0,
            metadata_len: 0,
        })
    }
}

/// Check a buffer length against the transfer the protocol fixes for `opcode`
pub fn validate_transfer(opcode: Opcode, data_len: usize) -> Result<(), ProtocolError> {
    if let Some(expected) = opcode.fixed_transfer_len() {
        if expected != data_len {
            return Err(ProtocolError::TransferLength {
                opcode: opcode.to_string(),
                expected,
                actual: data_len,
            });
        }
    }
    if opcode.direction() == DataDirection::None && data_len != 0 {
        return Err(ProtocolError::TransferLength {
            opcode: opcode.to_string(),
            expected: 0,
            actual: data_len,
        });
    }
    Ok(())
}

// =============================================================================
// Generic Encoders
// =============================================================================

/// Encode an admin command
pub fn encode_admin(
    opcode: AdminOpcode,
    nsid: u32,
    cdw: [u32; 6],
    data_len: usize,
) -> Result<Command, ProtocolError> {
    if opcode == AdminOpcode::Fabrics {
        return Err(ProtocolError::InvalidField {
            field: "opcode",
            reason: "fabrics capsules are encoded with encode_fabrics".into(),
        });
    }
    Command::new(Opcode::Admin(opcode), nsid, cdw, data_len)
}

/// Encode an I/O command
pub fn encode_io(
    opcode: IoOpcode,
    nsid: u32,
    cdw: [u32; 6],
    data_len: usize,
) -> Result<Command, ProtocolError> {
    Command::new(Opcode::Io(opcode), nsid, cdw, data_len)
}

/// Encode a fabrics command capsule
pub fn encode_fabrics(
    fctype: FabricsCommandType,
    cdw: [u32; 6],
    data_len: usize,
) -> Result<Command, ProtocolError> {
    Command::new(Opcode::Fabrics(fctype), 0, cdw, data_len)
}

// =============================================================================
// Admin Command Builders
// =============================================================================

/// Identify with the given CNS
pub fn identify(cns: u8, nsid: u32, cntid: u16) -> Command {
    Command {
        opcode: Opcode::Admin(AdminOpcode::Identify),
        flags: 0,
        command_id: 0,
        nsid,
        cdw2: 0,
        cdw3: 0,
        cdw: [cns as u32 | (cntid as u32) << 16, 0, 0, 0, 0, 0],
        data_len: IDENTIFY_DATA_SIZE as u32,
        metadata_len: 0,
    }
}

/// Get Log Page for `len` bytes starting at byte `offset`
pub fn get_log_page(
    lid: u8,
    nsid: u32,
    offset: u64,
    len: usize,
    lsp: u8,
    rae: bool,
) -> Result<Command, ProtocolError> {
    if len == 0 || len % 4 != 0 {
        return Err(ProtocolError::InvalidField {
            field: "numd",
            reason: format!("log length {} is not a non-zero multiple of 4", len),
        });
    }
    if offset % 4 != 0 {
        return Err(ProtocolError::InvalidField {
            field: "lpo",
            reason: format!("log offset {} is not dword aligned", offset),
        });
    }

    let numd = u32::try_from(len / 4 - 1).map_err(|_| ProtocolError::InvalidField {
        field: "numd",
        reason: format!("log length {} exceeds the dword count field", len),
    })?;
    let cdw10 = lid as u32
        | ((lsp & 0x7f) as u32) << 8
        | (rae as u32) << 15
        | (numd & 0xffff) << 16;
    let cdw11 = numd >> 16;
    let cdw = [cdw10, cdw11, offset as u32, (offset >> 32) as u32, 0, 0];
    encode_admin(AdminOpcode::GetLogPage, nsid, cdw, len)
}

/// Get Features for feature `fid`; `sel` selects current/default/saved
pub fn get_features(fid: u8, nsid: u32, sel: u8) -> Command {
    Command {
        opcode: Opcode::Admin(AdminOpcode::GetFeatures),
        flags: 0,
        command_id: 0,
        nsid,
        cdw2: 0,
        cdw3: 0,
        cdw: [fid as u32 | ((sel & 0x7) as u32) << 8, 0, 0, 0, 0, 0],
        data_len: 0,
        metadata_len: 0,
    }
}

/// Set Features with a dword value
pub fn set_features(fid: u8, nsid: u32, value: u32, save: bool) -> Command {
    Command {
        opcode: Opcode::Admin(AdminOpcode::SetFeatures),
        flags: 0,
        command_id: 0,
        nsid,
        cdw2: 0,
        cdw3: 0,
        cdw: [fid as u32 | (save as u32) << 31, value, 0, 0, 0, 0],
        data_len: 0,
        metadata_len: 0,
    }
}

/// Format NVM with LBA format `lbaf` and secure erase setting `ses`
pub fn format_nvm(nsid: u32, lbaf: u8, ses: u8) -> Command {
    let cdw10 = (lbaf & 0xf) as u32 | ((ses & 0x7) as u32) << 9 | (((lbaf >> 4) & 0x3) as u32) << 12;
    Command {
        opcode: Opcode::Admin(AdminOpcode::FormatNvm),
        flags: 0,
        command_id: 0,
        nsid,
        cdw2: 0,
        cdw3: 0,
        cdw: [cdw10, 0, 0, 0, 0, 0],
        data_len: 0,
        metadata_len: 0,
    }
}

pub fn keep_alive() -> Command {
    Command {
        opcode: Opcode::Admin(AdminOpcode::KeepAlive),
        flags: 0,
        command_id: 0,
        nsid: 0,
        cdw2: 0,
        cdw3: 0,
        cdw: [0; 6],
        data_len: 0,
        metadata_len: 0,
    }
}

// =============================================================================
// I/O Command Builders
// =============================================================================

fn rw(opcode: IoOpcode, nsid: u32, slba: u64, nlb: u32, block_size: u32) -> Result<Command, ProtocolError> {
    if nlb == 0 || nlb > 0x1_0000 {
        return Err(ProtocolError::InvalidField {
            field: "nlb",
            reason: format!("block count {} outside 1..=65536", nlb),
        });
    }
    let cdw = [slba as u32, (slba >> 32) as u32, nlb - 1, 0, 0, 0];
    encode_io(opcode, nsid, cdw, nlb as usize * block_size as usize)
}

/// Read `nlb` logical blocks starting at `slba`
pub fn read(nsid: u32, slba: u64, nlb: u32, block_size: u32) -> Result<Command, ProtocolError> {
    rw(IoOpcode::Read, nsid, slba, nlb, block_size)
}

/// Write `nlb` logical blocks starting at `slba`
pub fn write(nsid: u32, slba: u64, nlb: u32, block_size: u32) -> Result<Command, ProtocolError> {
    rw(IoOpcode::Write, nsid, slba, nlb, block_size)
}

pub fn flush(nsid: u32) -> Command {
    Command {
        opcode: Opcode::Io(IoOpcode::Flush),
        flags: 0,
        command_id: 0,
        nsid,
        cdw2: 0,
        cdw3: 0,
        cdw: [0; 6],
        data_len: 0,
        metadata_len: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identify_layout() {
        let cmd = identify(cns::CONTROLLER, 0, 0x0012).with_command_id(0x1234);
        let sqe = cmd.to_bytes();

        assert_eq!(sqe[0], 0x06);
        assert_eq!(&sqe[2..4], &[0x34, 0x12]);
        assert_eq!(&sqe[4..8], &[0, 0, 0, 0]);
        // CDW10: CNS in byte 40, CNTID in bytes 42..44
        assert_eq!(&sqe[40..44], &[0x01, 0x00, 0x12, 0x00]);
        assert!(sqe[44..].iter().all(|b| *b == 0));
        assert_eq!(cmd.data_len, 4096);
    }

    #[test]
    fn test_identify_requires_full_page() {
        let err = encode_admin(AdminOpcode::Identify, 1, [0; 6], 512).unwrap_err();
        assert_eq!(
            err,
            ProtocolError::TransferLength {
                opcode: "identify".into(),
                expected: 4096,
                actual: 512,
            }
        );
    }

    #[test]
    fn test_get_log_page_dwords() {
        let cmd = get_log_page(log_id::DISCOVERY, 0, 4096, 4096, 0, false).unwrap();
        // NUMD = 1023 (0-based dwords)
        assert_eq!(cmd.cdw10(), 0x70 | 1023 << 16);
        assert_eq!(cmd.cdw11(), 0);
        assert_eq!(cmd.cdw[2], 4096);
        assert_eq!(cmd.cdw[3], 0);

        let large = get_log_page(log_id::DISCOVERY, 0, 1 << 32, 512 * 1024, 0, true).unwrap();
        let numd = 512 * 1024 / 4 - 1;
        assert_eq!(large.cdw10() >> 16, numd & 0xffff);
        assert_eq!(large.cdw10() & (1 << 15), 1 << 15);
        assert_eq!(large.cdw11(), numd >> 16);
        assert_eq!(large.cdw[3], 1);

        assert!(get_log_page(log_id::DISCOVERY, 0, 0, 6, 0, false).is_err());
        assert!(get_log_page(log_id::DISCOVERY, 0, 2, 8, 0, false).is_err());
    }

    #[test]
    fn test_sqe_round_trip() {
        let cmd = set_features(0x07, 0, 0x0003_0003, true).with_command_id(9);
        let parsed = Command::from_bytes(&cmd.to_bytes(), QueueKind::Admin).unwrap();
        assert_eq!(parsed, cmd);

        let io = read(1, 0x1_0000_0010, 8, 512).unwrap().with_command_id(77);
        let mut parsed = Command::from_bytes(&io.to_bytes(), QueueKind::Io).unwrap();
        parsed.data_len = io.data_len;
        assert_eq!(parsed, io);
        assert_eq!(io.data_len, 4096);
    }

    #[test]
    fn test_admin_and_io_opcodes_are_distinct_namespaces() {
        let write = write(1, 0, 1, 512).unwrap();
        let sqe = write.to_bytes();
        // 0x01 is Write on an I/O queue but Create I/O SQ on the admin queue
        assert_eq!(
            Command::from_bytes(&sqe, QueueKind::Admin).unwrap().opcode,
            Opcode::Admin(AdminOpcode::CreateIoSubmissionQueue)
        );
        assert_eq!(
            Command::from_bytes(&sqe, QueueKind::Io).unwrap().opcode,
            Opcode::Io(IoOpcode::Write)
        );
    }

    #[test]
    fn test_rejects_data_on_no_transfer_opcode() {
        assert!(encode_admin(AdminOpcode::KeepAlive, 0, [0; 6], 4).is_err());
        assert!(encode_admin(AdminOpcode::Fabrics, 0, [0; 6], 0).is_err());
        assert!(read(1, 0, 0, 512).is_err());
    }

    #[test]
    #[cfg(target_pointer_width = "64")]
    fn test_oversized_transfer_rejected() {
        let len = u32::MAX as usize + 4;
        assert!(matches!(
            encode_admin(AdminOpcode::GetLogPage, 0, [0; 6], len),
            Err(ProtocolError::InvalidField { field: "data_len", .. })
        ));
        assert!(matches!(
            get_log_page(log_id::DISCOVERY, 0, 0, len * 4, 0, false),
            Err(ProtocolError::InvalidField { field: "numd", .. })
        ));
    }

    #[test]
    fn test_format_nvm_fields() {
        let cmd = format_nvm(1, 0x12, 1);
        assert_eq!(cmd.cdw10() & 0xf, 0x2);
        assert_eq!((cmd.cdw10() >> 9) & 0x7, 1);
        assert_eq!((cmd.cdw10() >> 12) & 0x3, 1);
    }
}
