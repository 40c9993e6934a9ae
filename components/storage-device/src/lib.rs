#![no_std]

//! Common contract for the node's non-volatile storage backends.
//!
//! Every backend (FRAM, SPI NOR flash, the resilient wrapper and the
//! in-memory device) implements [`StorageDevice`]. Transfers are bounded to
//! [`MAX_TRANSFER_SIZE`] bytes so that drivers can stage them in a fixed
//! stack buffer, and every request is validated against the device's
//! address space before any bus traffic happens:
//!
//! | condition                        | error                              |
//! |----------------------------------|------------------------------------|
//! | `len == 0` or `len > 256`        | [`StorageError::InvalidSize`]      |
//! | `address >= capacity`            | [`StorageError::InvalidAddress`]   |
//! | `address + len > capacity`       | [`StorageError::AddressOverflow`]  |
//!
//! The checksum used for every on-device structure is the bitwise
//! CRC16-CCITT in [`crc`].

#[macro_use]
extern crate delog;
generate_macros!();

#[cfg(test)]
#[macro_use]
extern crate std;

pub mod crc;
mod device;
mod ram;
mod shared;

pub use crate::device::*;
pub use crate::ram::RamStorage;
pub use crate::shared::SharedStorage;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StorageError {
    InvalidAddress,
    InvalidSize,
    AddressOverflow,
    InvalidIndex,
    InvalidConfig,
    NotInitialized,
    DeviceIdMismatch,
    WriteEnableFailed,
    CrcMismatch,
    Asleep,
    WriteProtected,
    Busy,
    Timeout,
    WriteFailed,
    EraseFailed,
    BufferFull,
    BufferEmpty,
    HeaderCorrupted,
    SizeMismatch,
    /// The bus transfer or the chip-select line reported an error.
    Bus,
}

pub type Result<T, E = StorageError> = core::result::Result<T, E>;
