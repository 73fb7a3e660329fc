//! Identify Data
//!
//! Parsers for the Identify Controller and Identify Namespace data
//! structures, limited to the fields the topology tree records.

use super::command::IDENTIFY_DATA_SIZE;
use super::{read_fixed_str, write_fixed_str};
use crate::error::ProtocolError;
use serde::Serialize;

fn check_len(structure: &'static str, data: &[u8]) -> Result<(), ProtocolError> {
    if data.len() < IDENTIFY_DATA_SIZE {
        return Err(ProtocolError::MalformedData {
            structure,
            reason: format!("{} bytes, expected {}", data.len(), IDENTIFY_DATA_SIZE),
        });
    }
    Ok(())
}

fn u16_at(data: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([data[offset], data[offset + 1]])
}

fn u32_at(data: &[u8], offset: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&data[offset..offset + 4]);
    u32::from_le_bytes(bytes)
}

fn u64_at(data: &[u8], offset: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&data[offset..offset + 8]);
    u64::from_le_bytes(bytes)
}

// =============================================================================
// Identify Controller
// =============================================================================

/// Identify Controller data (CNS 01h)
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IdentifyController {
    pub vid: u16,
    pub ssvid: u16,
    pub serial: String,
    pub model: String,
    pub firmware: String,
    /// Maximum data transfer size as a power of two of the minimum page size
    pub mdts: u8,
    pub cntlid: u16,
    pub version: u32,
    /// Number of namespaces
    pub nn: u32,
    pub subnqn: String,
}

impl IdentifyController {
    pub fn parse(data: &[u8]) -> Result<Self, ProtocolError> {
        check_len("identify controller", data)?;
        Ok(Self {
            vid: u16_at(data, 0),
            ssvid: u16_at(data, 2),
            serial: read_fixed_str(&data[4..24]),
            model: read_fixed_str(&data[24..64]),
            firmware: read_fixed_str(&data[64..72]),
            mdts: data[77],
            cntlid: u16_at(data, 78),
            version: u32_at(data, 80),
            nn: u32_at(data, 516),
            subnqn: read_fixed_str(&data[768..1024]),
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut data = vec![0u8; IDENTIFY_DATA_SIZE];
        data[0..2].copy_from_slice(&self.vid.to_le_bytes());
        data[2..4].copy_from_slice(&self.ssvid.to_le_bytes());
        write_padded(&mut data[4..24], &self.serial);
        write_padded(&mut data[24..64], &self.model);
        write_padded(&mut data[64..72], &self.firmware);
        data[77] = self.mdts;
        data[78..80].copy_from_slice(&self.cntlid.to_le_bytes());
        data[80..84].copy_from_slice(&self.version.to_le_bytes());
        data[516..520].copy_from_slice(&self.nn.to_le_bytes());
        write_fixed_str(&mut data[768..1024], &self.subnqn);
        data
    }

    /// Version as "major.minor.tertiary"
    pub fn version_string(&self) -> String {
        format!(
            "{}.{}.{}",
            self.version >> 16,
            (self.version >> 8) & 0xff,
            self.version & 0xff
        )
    }
}

/// ASCII fields of identify data are space padded
fn write_padded(field: &mut [u8], value: &str) {
    field.fill(b' ');
    let len = value.len().min(field.len());
    field[..len].copy_from_slice(&value.as_bytes()[..len]);
}

// =============================================================================
// Identify Namespace
// =============================================================================

/// One LBA format descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LbaFormat {
    /// Metadata bytes per block
    pub ms: u16,
    /// Block size as a power of two
    pub lbads: u8,
    /// Relative performance
    pub rp: u8,
}

impl LbaFormat {
    pub fn block_size(&self) -> u64 {
        if self.lbads >= 9 && self.lbads < 64 {
            1 << self.lbads
        } else {
            0
        }
    }
}

/// Identify Namespace data (CNS 00h)
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IdentifyNamespace {
    /// Namespace size in blocks
    pub nsze: u64,
    pub ncap: u64,
    pub nuse: u64,
    /// Index of the active LBA format
    pub flbas: u8,
    pub anagrpid: u32,
    pub lba_formats: Vec<LbaFormat>,
}

impl IdentifyNamespace {
    pub fn parse(data: &[u8]) -> Result<Self, ProtocolError> {
        check_len("identify namespace", data)?;
        // NLBAF is zero based
        let count = data[25] as usize + 1;
        if count > 64 {
            return Err(ProtocolError::MalformedData {
                structure: "identify namespace",
                reason: format!("{} LBA formats", count),
            });
        }
        let lba_formats = (0..count)
            .map(|i| {
                let offset = 128 + i * 4;
                LbaFormat {
                    ms: u16_at(data, offset),
                    lbads: data[offset + 2],
                    rp: data[offset + 3] & 0x3,
                }
            })
            .collect();

        Ok(Self {
            nsze: u64_at(data, 0),
            ncap: u64_at(data, 8),
            nuse: u64_at(data, 16),
            flbas: data[26],
            anagrpid: u32_at(data, 92),
            lba_formats,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut data = vec![0u8; IDENTIFY_DATA_SIZE];
        data[0..8].copy_from_slice(&self.nsze.to_le_bytes());
        data[8..16].copy_from_slice(&self.ncap.to_le_bytes());
        data[16..24].copy_from_slice(&self.nuse.to_le_bytes());
        data[25] = self.lba_formats.len().saturating_sub(1) as u8;
        data[26] = self.flbas;
        data[92..96].copy_from_slice(&self.anagrpid.to_le_bytes());
        for (i, format) in self.lba_formats.iter().take(64).enumerate() {
            let offset = 128 + i * 4;
            data[offset..offset + 2].copy_from_slice(&format.ms.to_le_bytes());
            data[offset + 2] = format.lbads;
            data[offset + 3] = format.rp;
        }
        data
    }

    /// Active LBA format
    pub fn active_format(&self) -> Option<&LbaFormat> {
        // FLBAS bits 3:0 low index, bits 6:5 high index
        let index = (self.flbas & 0xf) as usize | ((self.flbas as usize >> 5) & 0x3) << 4;
        self.lba_formats.get(index)
    }

    /// Block size of the active format, 0 when unknown
    pub fn block_size(&self) -> u64 {
        self.active_format().map_or(0, LbaFormat::block_size)
    }

    /// Capacity in bytes
    pub fn capacity_bytes(&self) -> u64 {
        self.nsze.saturating_mul(self.block_size())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_controller() -> IdentifyController {
        IdentifyController {
            vid: 0x1b36,
            ssvid: 0x1af4,
            serial: "SN-0001".into(),
            model: "Fabric Target".into(),
            firmware: "1.0".into(),
            mdts: 5,
            cntlid: 7,
            version: 0x0001_0400,
            nn: 32,
            subnqn: "nqn.2024-01.io.example:array1".into(),
        }
    }

    #[test]
    fn test_identify_controller_offsets() {
        let data = sample_controller().to_bytes();
        assert_eq!(&data[4..11], b"SN-0001");
        assert_eq!(data[11], b' ');
        assert_eq!(&data[78..80], &7u16.to_le_bytes());
        assert_eq!(&data[516..520], &32u32.to_le_bytes());

        let parsed = IdentifyController::parse(&data).unwrap();
        assert_eq!(parsed, sample_controller());
        assert_eq!(parsed.version_string(), "1.4.0");
    }

    #[test]
    fn test_identify_short_buffer() {
        assert!(matches!(
            IdentifyController::parse(&[0u8; 512]),
            Err(ProtocolError::MalformedData { .. })
        ));
        assert!(IdentifyNamespace::parse(&[0u8; 4095]).is_err());
    }

    #[test]
    fn test_identify_namespace_block_size() {
        let ns = IdentifyNamespace {
            nsze: 2048,
            ncap: 2048,
            nuse: 100,
            flbas: 1,
            anagrpid: 3,
            lba_formats: vec![
                LbaFormat { ms: 0, lbads: 9, rp: 2 },
                LbaFormat { ms: 0, lbads: 12, rp: 0 },
            ],
        };
        let parsed = IdentifyNamespace::parse(&ns.to_bytes()).unwrap();
        assert_eq!(parsed, ns);
        assert_eq!(parsed.block_size(), 4096);
        assert_eq!(parsed.capacity_bytes(), 2048 * 4096);
        assert_eq!(parsed.anagrpid, 3);
    }

    #[test]
    fn test_identify_namespace_unknown_format() {
        let mut data = vec![0u8; IDENTIFY_DATA_SIZE];
        data[26] = 4;
        let parsed = IdentifyNamespace::parse(&data).unwrap();
        assert_eq!(parsed.lba_formats.len(), 1);
        assert_eq!(parsed.block_size(), 0);
    }
}
