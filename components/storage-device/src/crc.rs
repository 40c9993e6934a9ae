//! CRC16-CCITT (polynomial `0x1021`, initial value `0xFFFF`, MSB first, no
//! final XOR).
//!
//! This checksum is part of the on-device format of the circular log header,
//! the flash wear records and the CRC-guarded FRAM transfers, so the bitwise
//! loop below must stay bit-identical.

pub const CRC16_POLYNOMIAL: u16 = 0x1021;
pub const CRC16_INIT: u16 = 0xFFFF;

/// Length of an encoded checksum on the device (big endian).
pub const CRC16_LEN: usize = 2;

pub fn crc16(data: &[u8]) -> u16 {
    crc16_update(CRC16_INIT, data)
}

/// Continues a checksum over `data`, allowing a structure to be hashed in
/// several pieces.
pub fn crc16_update(mut crc: u16, data: &[u8]) -> u16 {
    for &byte in data {
        crc ^= (byte as u16) << 8;
        for _ in 0..8 {
            if crc & 0x8000 != 0 {
                crc = (crc << 1) ^ CRC16_POLYNOMIAL;
            } else {
                crc <<= 1;
            }
        }
    }
    crc
}
