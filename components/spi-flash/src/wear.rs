use storage_device::crc::crc16;

use crate::registers::SECTOR_SIZE;

/// Bytes reserved at the end of every sector for its wear record.
pub const WEAR_RECORD_SIZE: u32 = 16;
/// User bytes per sector once the trailer is taken out.
pub const DATA_PER_SECTOR: u32 = SECTOR_SIZE - WEAR_RECORD_SIZE;

pub const WEAR_MAGIC: u32 = 0x5745_4152;

const CRC_OFFSET: usize = 8;

/// Erase counter stored in a sector's trailer.
///
/// Layout, big endian: magic (4), erase count (4), CRC16 over the first
/// eight bytes (2), then padding left erased (`0xff`).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WearRecord {
    pub erase_count: u32,
}

impl WearRecord {
    pub const fn new(erase_count: u32) -> Self {
        Self { erase_count }
    }

    pub fn encode(&self) -> [u8; WEAR_RECORD_SIZE as usize] {
        let mut bytes = [0xff; WEAR_RECORD_SIZE as usize];
        bytes[..4].copy_from_slice(&WEAR_MAGIC.to_be_bytes());
        bytes[4..8].copy_from_slice(&self.erase_count.to_be_bytes());
        let crc = crc16(&bytes[..CRC_OFFSET]);
        bytes[CRC_OFFSET..CRC_OFFSET + 2].copy_from_slice(&crc.to_be_bytes());
        bytes
    }

    /// `None` for an erased, torn or otherwise corrupt trailer.
    pub fn decode(bytes: &[u8; WEAR_RECORD_SIZE as usize]) -> Option<Self> {
        let magic = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let crc = u16::from_be_bytes([bytes[CRC_OFFSET], bytes[CRC_OFFSET + 1]]);
        if magic != WEAR_MAGIC || crc != crc16(&bytes[..CRC_OFFSET]) {
            return None;
        }
        Some(Self {
            erase_count: u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
        })
    }
}
