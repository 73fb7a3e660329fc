//! Command Codec
//!
//! Pure encoding and decoding of NVMe wire structures: 64-byte submission
//! queue entries, 16-byte completions, fabrics capsules, identify data and
//! the discovery log page. All multi-byte fields are little-endian.

pub mod command;
pub mod completion;
pub mod discovery_log;
pub mod fabrics;
pub mod identify;
pub mod opcode;

pub use command::{
    cns, encode_admin, encode_fabrics, encode_io, log_id, validate_transfer, Command,
    IDENTIFY_DATA_SIZE, SQE_SIZE,
};
pub use completion::{
    decode_completion, Completion, Outcome, StatusCodeType, StatusField, CQE_SIZE,
};
pub use discovery_log::{
    build_discovery_log, DiscoveryLog, DiscoveryLogEntry, DiscoveryLogHeader, SkipReason,
    SkippedEntry, DISCOVERY_LOG_ENTRY_SIZE, DISCOVERY_LOG_HEADER_SIZE,
};
pub use fabrics::{
    ConnectData, ConnectParams, ConnectResponse, CONNECT_DATA_SIZE, DYNAMIC_CNTLID, NQN_MAX_LEN,
};
pub use identify::{IdentifyController, IdentifyNamespace, LbaFormat};
pub use opcode::{AdminOpcode, DataDirection, FabricsCommandType, IoOpcode, Opcode};

/// Read a fixed-width ASCII field, dropping NUL and space padding
pub(crate) fn read_fixed_str(field: &[u8]) -> String {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).trim().to_string()
}

/// Write `value` into a fixed-width field, NUL padded and truncated to fit
pub(crate) fn write_fixed_str(field: &mut [u8], value: &str) {
    field.fill(0);
    let len = value.len().min(field.len());
    field[..len].copy_from_slice(&value.as_bytes()[..len]);
}
