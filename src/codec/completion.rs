//! Completion Queue Entries
//!
//! Decodes the 16-byte completion queue entry and classifies its status
//! into Success / Retryable / Fatal for the retry policy upstream.

use super::opcode::{FabricsCommandType, Opcode};
use crate::error::ProtocolError;
use bytes::{Buf, BufMut, BytesMut};
use serde::{Serialize, Serializer};

/// Size of a completion queue entry
pub const CQE_SIZE: usize = 16;

// =============================================================================
// Status Codes
// =============================================================================

/// Generic command status values (SCT 0)
pub mod generic {
    pub const SUCCESS: u8 = 0x00;
    pub const INVALID_OPCODE: u8 = 0x01;
    pub const INVALID_FIELD: u8 = 0x02;
    pub const COMMAND_ID_CONFLICT: u8 = 0x03;
    pub const DATA_TRANSFER_ERROR: u8 = 0x04;
    pub const INTERNAL_ERROR: u8 = 0x06;
    pub const ABORT_REQUESTED: u8 = 0x07;
    pub const ABORTED_SQ_DELETION: u8 = 0x08;
    pub const INVALID_NAMESPACE_OR_FORMAT: u8 = 0x0b;
    pub const COMMAND_SEQUENCE_ERROR: u8 = 0x0c;
    pub const HOST_ID_INCONSISTENT_FORMAT: u8 = 0x18;
    pub const KEEP_ALIVE_EXPIRED: u8 = 0x19;
    pub const COMMAND_INTERRUPTED: u8 = 0x21;
    pub const TRANSIENT_TRANSPORT_ERROR: u8 = 0x22;
    pub const ADMIN_MEDIA_NOT_READY: u8 = 0x24;
    pub const LBA_OUT_OF_RANGE: u8 = 0x80;
    pub const CAPACITY_EXCEEDED: u8 = 0x81;
    pub const NAMESPACE_NOT_READY: u8 = 0x82;
    pub const RESERVATION_CONFLICT: u8 = 0x83;
    pub const FORMAT_IN_PROGRESS: u8 = 0x84;
    pub const AUTHENTICATION_REQUIRED: u8 = 0x91;
}

/// Command specific status values (SCT 1)
pub mod command_specific {
    pub const INVALID_LOG_PAGE: u8 = 0x09;
    pub const INVALID_FORMAT: u8 = 0x0a;
    pub const CONNECT_INCOMPATIBLE_FORMAT: u8 = 0x80;
    pub const CONNECT_CONTROLLER_BUSY: u8 = 0x81;
    pub const CONNECT_INVALID_PARAMETERS: u8 = 0x82;
    pub const CONNECT_RESTART_DISCOVERY: u8 = 0x83;
    pub const CONNECT_INVALID_HOST: u8 = 0x84;
}

/// Path related status values (SCT 3)
pub mod path {
    pub const INTERNAL_PATH_ERROR: u8 = 0x00;
    pub const ANA_PERSISTENT_LOSS: u8 = 0x01;
    pub const ANA_INACCESSIBLE: u8 = 0x02;
    pub const ANA_TRANSITION: u8 = 0x03;
    pub const CONTROLLER_PATHING_ERROR: u8 = 0x60;
    pub const HOST_PATHING_ERROR: u8 = 0x70;
    pub const ABORTED_BY_HOST: u8 = 0x71;
}

/// Status code type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum StatusCodeType {
    Generic,
    CommandSpecific,
    MediaError,
    PathRelated,
    VendorSpecific,
}

impl StatusCodeType {
    /// Decode the 3-bit SCT; values 4..=6 are reserved
    pub fn from_bits(bits: u8) -> Option<Self> {
        match bits & 0x7 {
            0 => Some(StatusCodeType::Generic),
            1 => Some(StatusCodeType::CommandSpecific),
            2 => Some(StatusCodeType::MediaError),
            3 => Some(StatusCodeType::PathRelated),
            7 => Some(StatusCodeType::VendorSpecific),
            _ => None,
        }
    }

    pub fn bits(&self) -> u8 {
        match self {
            StatusCodeType::Generic => 0,
            StatusCodeType::CommandSpecific => 1,
            StatusCodeType::MediaError => 2,
            StatusCodeType::PathRelated => 3,
            StatusCodeType::VendorSpecific => 7,
        }
    }
}

/// Classified result of a completion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Outcome {
    Success,
    Retryable,
    Fatal,
}

// =============================================================================
// Status Field
// =============================================================================

/// The 16-bit status field of a completion (DW3 bits 31:16)
///
/// Bit 0 phase tag, bits 8:1 status code, bits 11:9 status code type,
/// bits 13:12 command retry delay, bit 14 more, bit 15 do-not-retry.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct StatusField(u16);

impl StatusField {
    pub const SUCCESS: StatusField = StatusField(0);

    pub fn from_raw(raw: u16) -> Self {
        Self(raw)
    }

    pub fn new(sct: StatusCodeType, sc: u8) -> Self {
        Self((sc as u16) << 1 | (sct.bits() as u16) << 9)
    }

    pub fn with_phase(self, phase: bool) -> Self {
        Self(self.0 & !1 | phase as u16)
    }

    pub fn with_retry_delay(self, crd: u8) -> Self {
        Self(self.0 & !(0x3 << 12) | ((crd & 0x3) as u16) << 12)
    }

    pub fn with_more(self, more: bool) -> Self {
        Self(self.0 & !(1 << 14) | (more as u16) << 14)
    }

    pub fn with_dnr(self, dnr: bool) -> Self {
        Self(self.0 & !(1 << 15) | (dnr as u16) << 15)
    }

    pub fn raw(&self) -> u16 {
        self.0
    }

    pub fn phase(&self) -> bool {
        self.0 & 1 != 0
    }

    pub fn status_code(&self) -> u8 {
        (self.0 >> 1) as u8
    }

    pub fn status_code_type_bits(&self) -> u8 {
        ((self.0 >> 9) & 0x7) as u8
    }

    pub fn status_code_type(&self) -> Option<StatusCodeType> {
        StatusCodeType::from_bits(self.status_code_type_bits())
    }

    pub fn retry_delay(&self) -> u8 {
        ((self.0 >> 12) & 0x3) as u8
    }

    pub fn more(&self) -> bool {
        self.0 & (1 << 14) != 0
    }

    pub fn dnr(&self) -> bool {
        self.0 & (1 << 15) != 0
    }

    pub fn is_success(&self) -> bool {
        self.status_code() == generic::SUCCESS && self.status_code_type_bits() == 0
    }

    /// Classify the status of a completion for `opcode`
    pub fn outcome(&self, opcode: Opcode) -> Outcome {
        if self.is_success() {
            return Outcome::Success;
        }
        if self.dnr() {
            return Outcome::Fatal;
        }

        let sc = self.status_code();
        match self.status_code_type() {
            Some(StatusCodeType::Generic) => match sc {
                generic::ABORTED_SQ_DELETION
                | generic::COMMAND_INTERRUPTED
                | generic::TRANSIENT_TRANSPORT_ERROR
                | generic::ADMIN_MEDIA_NOT_READY
                | generic::NAMESPACE_NOT_READY => Outcome::Retryable,
                _ => Outcome::Fatal,
            },
            Some(StatusCodeType::CommandSpecific) => match (opcode, sc) {
                (
                    Opcode::Fabrics(FabricsCommandType::Connect),
                    command_specific::CONNECT_CONTROLLER_BUSY,
                ) => Outcome::Retryable,
                _ => Outcome::Fatal,
            },
            Some(StatusCodeType::PathRelated) => match sc {
                path::ANA_PERSISTENT_LOSS => Outcome::Fatal,
                _ => Outcome::Retryable,
            },
            Some(StatusCodeType::MediaError)
            | Some(StatusCodeType::VendorSpecific)
            | None => Outcome::Fatal,
        }
    }

    /// Human readable name of the status
    pub fn description(&self) -> &'static str {
        let sc = self.status_code();
        match self.status_code_type() {
            Some(StatusCodeType::Generic) => match sc {
                generic::SUCCESS => "success",
                generic::INVALID_OPCODE => "invalid command opcode",
                generic::INVALID_FIELD => "invalid field in command",
                generic::COMMAND_ID_CONFLICT => "command id conflict",
                generic::DATA_TRANSFER_ERROR => "data transfer error",
                generic::INTERNAL_ERROR => "internal error",
                generic::ABORT_REQUESTED => "command abort requested",
                generic::ABORTED_SQ_DELETION => "command aborted due to sq deletion",
                generic::INVALID_NAMESPACE_OR_FORMAT => "invalid namespace or format",
                generic::COMMAND_SEQUENCE_ERROR => "command sequence error",
                generic::HOST_ID_INCONSISTENT_FORMAT => "host identifier inconsistent format",
                generic::KEEP_ALIVE_EXPIRED => "keep alive timer expired",
                generic::COMMAND_INTERRUPTED => "command interrupted",
                generic::TRANSIENT_TRANSPORT_ERROR => "transient transport error",
                generic::ADMIN_MEDIA_NOT_READY => "admin command media not ready",
                generic::LBA_OUT_OF_RANGE => "lba out of range",
                generic::CAPACITY_EXCEEDED => "capacity exceeded",
                generic::NAMESPACE_NOT_READY => "namespace not ready",
                generic::RESERVATION_CONFLICT => "reservation conflict",
                generic::FORMAT_IN_PROGRESS => "format in progress",
                generic::AUTHENTICATION_REQUIRED => "authentication required",
                _ => "generic error",
            },
            Some(StatusCodeType::CommandSpecific) => match sc {
                command_specific::INVALID_LOG_PAGE => "invalid log page",
                command_specific::INVALID_FORMAT => "invalid format",
                command_specific::CONNECT_INCOMPATIBLE_FORMAT => "connect incompatible format",
                command_specific::CONNECT_CONTROLLER_BUSY => "connect controller busy",
                command_specific::CONNECT_INVALID_PARAMETERS => "connect invalid parameters",
                command_specific::CONNECT_RESTART_DISCOVERY => "connect restart discovery",
                command_specific::CONNECT_INVALID_HOST => "connect invalid host",
                _ => "command specific error",
            },
            Some(StatusCodeType::MediaError) => "media or data integrity error",
            Some(StatusCodeType::PathRelated) => match sc {
                path::INTERNAL_PATH_ERROR => "internal path error",
                path::ANA_PERSISTENT_LOSS => "asymmetric access persistent loss",
                path::ANA_INACCESSIBLE => "asymmetric access inaccessible",
                path::ANA_TRANSITION => "asymmetric access transition",
                path::CONTROLLER_PATHING_ERROR => "controller pathing error",
                path::HOST_PATHING_ERROR => "host pathing error",
                path::ABORTED_BY_HOST => "command aborted by host",
                _ => "path related error",
            },
            Some(StatusCodeType::VendorSpecific) => "vendor specific error",
            None => "reserved status code type",
        }
    }
}

impl std::fmt::Display for StatusField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} (sct {:#x}, sc {:#04x}",
            self.description(),
            self.status_code_type_bits(),
            self.status_code()
        )?;
        if self.dnr() {
            write!(f, ", dnr")?;
        }
        write!(f, ")")
    }
}

impl std::fmt::Debug for StatusField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusField")
            .field("sct", &self.status_code_type_bits())
            .field("sc", &self.status_code())
            .field("crd", &self.retry_delay())
            .field("more", &self.more())
            .field("dnr", &self.dnr())
            .field("phase", &self.phase())
            .finish()
    }
}

impl Serialize for StatusField {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u16(self.0)
    }
}

// =============================================================================
// Completion
// =============================================================================

/// A decoded completion queue entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    /// Command specific result (DW0)
    pub result: u32,
    /// DW1, command specific in newer revisions
    pub result_hi: u32,
    pub sq_head: u16,
    pub sq_id: u16,
    pub command_id: u16,
    pub status: StatusField,
}

impl Completion {
    pub fn new(command_id: u16, status: StatusField) -> Self {
        Self {
            result: 0,
            result_hi: 0,
            sq_head: 0,
            sq_id: 0,
            command_id,
            status,
        }
    }

    pub fn with_result(mut self, result: u32) -> Self {
        self.result = result;
        self
    }

    /// Classify for the command that produced this completion
    pub fn outcome(&self, opcode: Opcode) -> Outcome {
        self.status.outcome(opcode)
    }

    /// Serialize to the 16-byte wire layout
    pub fn to_bytes(&self) -> [u8; CQE_SIZE] {
        let mut buf = BytesMut::with_capacity(CQE_SIZE);
        buf.put_u32_le(self.result);
        buf.put_u32_le(self.result_hi);
        buf.put_u16_le(self.sq_head);
        buf.put_u16_le(self.sq_id);
        buf.put_u16_le(self.command_id);
        buf.put_u16_le(self.status.raw());

        let mut cqe = [0u8; CQE_SIZE];
        cqe.copy_from_slice(&buf);
        cqe
    }
}

/// Decode a raw completion queue entry
///
/// Reserved bits are ignored; a reserved status code type is rejected
/// because the outcome cannot be classified.
pub fn decode_completion(raw: &[u8]) -> Result<Completion, ProtocolError> {
    if raw.len() != CQE_SIZE {
        return Err(ProtocolError::MalformedCompletion { len: raw.len() });
    }

    let mut buf = raw;
    let completion = Completion {
        result: buf.get_u32_le(),
        result_hi: buf.get_u32_le(),
        sq_head: buf.get_u16_le(),
        sq_id: buf.get_u16_le(),
        command_id: buf.get_u16_le(),
        status: StatusField::from_raw(buf.get_u16_le()),
    };

    if completion.status.status_code_type().is_none() {
        return Err(ProtocolError::UnexpectedStatusType {
            sct: completion.status.status_code_type_bits(),
            command_id: completion.command_id,
        });
    }
    Ok(completion)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::opcode::AdminOpcode;

    const IDENTIFY: Opcode = Opcode::Admin(AdminOpcode::Identify);
    const CONNECT: Opcode = Opcode::Fabrics(FabricsCommandType::Connect);

    #[test]
    fn test_status_field_bits() {
        let status = StatusField::new(StatusCodeType::CommandSpecific, 0x81)
            .with_dnr(true)
            .with_more(true)
            .with_phase(true)
            .with_retry_delay(2);

        assert_eq!(status.raw(), 0x8000 | 0x4000 | 0x2000 | 1 << 9 | 0x81 << 1 | 1);
        assert_eq!(status.status_code(), 0x81);
        assert_eq!(status.status_code_type(), Some(StatusCodeType::CommandSpecific));
        assert_eq!(status.retry_delay(), 2);
        assert!(status.dnr());
        assert!(status.more());
        assert!(status.phase());
    }

    #[test]
    fn test_decode_completion_little_endian() {
        let raw = [
            0x78, 0x56, 0x34, 0x12, // DW0
            0, 0, 0, 0, // DW1
            0x05, 0x00, // SQHD
            0x01, 0x00, // SQID
            0xcd, 0xab, // CID
            0x05, 0x80, // status: phase, sc 0x02, dnr
        ];
        let cqe = decode_completion(&raw).unwrap();
        assert_eq!(cqe.result, 0x1234_5678);
        assert_eq!(cqe.sq_head, 5);
        assert_eq!(cqe.sq_id, 1);
        assert_eq!(cqe.command_id, 0xabcd);
        assert_eq!(cqe.status.status_code(), generic::INVALID_FIELD);
        assert!(cqe.status.dnr());
        assert!(cqe.status.phase());
        assert_eq!(cqe.to_bytes(), raw);
    }

    #[test]
    fn test_decode_rejects_wrong_length() {
        assert_eq!(
            decode_completion(&[0u8; 15]),
            Err(ProtocolError::MalformedCompletion { len: 15 })
        );
    }

    #[test]
    fn test_decode_rejects_reserved_status_type() {
        let raw = Completion::new(3, StatusField::from_raw(5 << 9)).to_bytes();
        assert_eq!(
            decode_completion(&raw),
            Err(ProtocolError::UnexpectedStatusType {
                sct: 5,
                command_id: 3
            })
        );
    }

    #[test]
    fn test_decode_ignores_reserved_dword() {
        let mut raw = Completion::new(1, StatusField::SUCCESS).to_bytes();
        raw[4..8].copy_from_slice(&[0xff; 4]);
        let cqe = decode_completion(&raw).unwrap();
        assert!(cqe.status.is_success());
    }

    #[test]
    fn test_outcome_classification() {
        assert_eq!(StatusField::SUCCESS.outcome(IDENTIFY), Outcome::Success);

        let busy = StatusField::new(StatusCodeType::CommandSpecific, command_specific::CONNECT_CONTROLLER_BUSY);
        assert_eq!(busy.outcome(CONNECT), Outcome::Retryable);
        assert_eq!(busy.outcome(IDENTIFY), Outcome::Fatal);
        assert_eq!(busy.with_dnr(true).outcome(CONNECT), Outcome::Fatal);

        let invalid_host = StatusField::new(StatusCodeType::CommandSpecific, command_specific::CONNECT_INVALID_HOST);
        assert_eq!(invalid_host.outcome(CONNECT), Outcome::Fatal);

        let transient = StatusField::new(StatusCodeType::Generic, generic::TRANSIENT_TRANSPORT_ERROR);
        assert_eq!(transient.outcome(CONNECT), Outcome::Retryable);

        let invalid_field = StatusField::new(StatusCodeType::Generic, generic::INVALID_FIELD);
        assert_eq!(invalid_field.outcome(IDENTIFY), Outcome::Fatal);

        let auth = StatusField::new(StatusCodeType::Generic, generic::AUTHENTICATION_REQUIRED);
        assert_eq!(auth.outcome(CONNECT), Outcome::Fatal);

        let ana = StatusField::new(StatusCodeType::PathRelated, path::ANA_TRANSITION);
        assert_eq!(ana.outcome(IDENTIFY), Outcome::Retryable);
        let loss = StatusField::new(StatusCodeType::PathRelated, path::ANA_PERSISTENT_LOSS);
        assert_eq!(loss.outcome(IDENTIFY), Outcome::Fatal);
    }

    #[test]
    fn test_status_display() {
        let status = StatusField::new(StatusCodeType::Generic, generic::INVALID_FIELD).with_dnr(true);
        assert_eq!(
            status.to_string(),
            "invalid field in command (sct 0x0, sc 0x02, dnr)"
        );
    }
}
