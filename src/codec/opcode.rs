//! Opcodes
//!
//! Admin, I/O and Fabrics command opcodes recognized by the codec.

use crate::domain::QueueKind;
use crate::error::ProtocolError;
use serde::Serialize;

/// Opcode of the fabrics command capsule (the command type lives in byte 4)
pub const FABRICS_OPCODE: u8 = 0x7f;

macro_rules! wire_enum {
    (
        $(#[$meta:meta])*
        pub enum $name:ident: $queue:literal {
            $($variant:ident = $value:literal => $label:literal,)+
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
        #[repr(u8)]
        pub enum $name {
            $($variant = $value,)+
        }

        impl $name {
            /// Every recognized value
            pub const ALL: &'static [$name] = &[$($name::$variant,)+];

            pub fn code(self) -> u8 {
                self as u8
            }

            pub fn name(self) -> &'static str {
                match self {
                    $($name::$variant => $label,)+
                }
            }
        }

        impl TryFrom<u8> for $name {
            type Error = ProtocolError;

            fn try_from(value: u8) -> Result<Self, Self::Error> {
                match value {
                    $($value => Ok($name::$variant),)+
                    opcode => Err(ProtocolError::UnknownOpcode {
                        queue: $queue,
                        opcode,
                    }),
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.name())
            }
        }
    };
}

wire_enum! {
    /// Admin command set opcodes
    pub enum AdminOpcode: "admin" {
        DeleteIoSubmissionQueue = 0x00 => "delete-io-sq",
        CreateIoSubmissionQueue = 0x01 => "create-io-sq",
        GetLogPage = 0x02 => "get-log-page",
        DeleteIoCompletionQueue = 0x04 => "delete-io-cq",
        CreateIoCompletionQueue = 0x05 => "create-io-cq",
        Identify = 0x06 => "identify",
        Abort = 0x08 => "abort",
        SetFeatures = 0x09 => "set-features",
        GetFeatures = 0x0a => "get-features",
        AsyncEventRequest = 0x0c => "async-event-request",
        NamespaceManagement = 0x0d => "ns-management",
        FirmwareCommit = 0x10 => "fw-commit",
        FirmwareImageDownload = 0x11 => "fw-download",
        DeviceSelfTest = 0x14 => "device-self-test",
        NamespaceAttachment = 0x15 => "ns-attachment",
        KeepAlive = 0x18 => "keep-alive",
        Fabrics = 0x7f => "fabrics",
        FormatNvm = 0x80 => "format-nvm",
        SecuritySend = 0x81 => "security-send",
        SecurityReceive = 0x82 => "security-receive",
        Sanitize = 0x84 => "sanitize",
    }
}

wire_enum! {
    /// NVM command set I/O opcodes
    pub enum IoOpcode: "io" {
        Flush = 0x00 => "flush",
        Write = 0x01 => "write",
        Read = 0x02 => "read",
        WriteUncorrectable = 0x04 => "write-uncorrectable",
        Compare = 0x05 => "compare",
        WriteZeroes = 0x08 => "write-zeroes",
        DatasetManagement = 0x09 => "dataset-management",
    }
}

wire_enum! {
    /// Fabrics command types (FCTYPE)
    pub enum FabricsCommandType: "fabrics" {
        PropertySet = 0x00 => "property-set",
        Connect = 0x01 => "connect",
        PropertyGet = 0x04 => "property-get",
        AuthenticationSend = 0x05 => "auth-send",
        AuthenticationReceive = 0x06 => "auth-receive",
        Disconnect = 0x08 => "disconnect",
    }
}

/// Direction of the data phase, from the low two opcode bits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataDirection {
    None,
    HostToController,
    ControllerToHost,
    Bidirectional,
}

impl DataDirection {
    fn from_opcode_bits(opcode: u8) -> Self {
        match opcode & 0b11 {
            0b00 => DataDirection::None,
            0b01 => DataDirection::HostToController,
            0b10 => DataDirection::ControllerToHost,
            _ => DataDirection::Bidirectional,
        }
    }
}

// =============================================================================
// Opcode
// =============================================================================

/// A fully qualified opcode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Opcode {
    Admin(AdminOpcode),
    Io(IoOpcode),
    Fabrics(FabricsCommandType),
}

impl Opcode {
    /// Byte 0 of the submission queue entry
    pub fn code(&self) -> u8 {
        match self {
            Opcode::Admin(op) => op.code(),
            Opcode::Io(op) => op.code(),
            Opcode::Fabrics(_) => FABRICS_OPCODE,
        }
    }

    /// Queue the opcode is defined for
    pub fn queue(&self) -> QueueKind {
        match self {
            Opcode::Io(_) => QueueKind::Io,
            Opcode::Admin(_) | Opcode::Fabrics(_) => QueueKind::Admin,
        }
    }

    /// Data transfer direction
    pub fn direction(&self) -> DataDirection {
        match self {
            Opcode::Fabrics(FabricsCommandType::Connect)
            | Opcode::Fabrics(FabricsCommandType::AuthenticationSend) => {
                DataDirection::HostToController
            }
            Opcode::Fabrics(FabricsCommandType::AuthenticationReceive) => {
                DataDirection::ControllerToHost
            }
            Opcode::Fabrics(_) => DataDirection::None,
            op => DataDirection::from_opcode_bits(op.code()),
        }
    }

    /// Transfer size fixed by the protocol, if any
    pub fn fixed_transfer_len(&self) -> Option<usize> {
        match self {
            Opcode::Admin(AdminOpcode::Identify) => Some(4096),
            Opcode::Admin(AdminOpcode::KeepAlive) => Some(0),
            Opcode::Fabrics(FabricsCommandType::Connect) => Some(1024),
            Opcode::Fabrics(FabricsCommandType::PropertyGet)
            | Opcode::Fabrics(FabricsCommandType::PropertySet)
            | Opcode::Fabrics(FabricsCommandType::Disconnect) => Some(0),
            Opcode::Io(IoOpcode::Flush) => Some(0),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Opcode::Admin(op) => op.name(),
            Opcode::Io(op) => op.name(),
            Opcode::Fabrics(op) => op.name(),
        }
    }
}

impl std::fmt::Display for Opcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl From<AdminOpcode> for Opcode {
    fn from(op: AdminOpcode) -> Self {
        Opcode::Admin(op)
    }
}

impl From<IoOpcode> for Opcode {
    fn from(op: IoOpcode) -> Self {
        Opcode::Io(op)
    }
}

impl From<FabricsCommandType> for Opcode {
    fn from(op: FabricsCommandType) -> Self {
        Opcode::Fabrics(op)
    }
}
