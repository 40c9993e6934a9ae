#![cfg_attr(not(test), no_std)]

//! Driver for 25-series SPI NOR flash used as the node's fallback storage,
//! with a per-sector erase counter kept in each sector's trailer.

#[macro_use]
extern crate delog;
generate_macros!();

mod device;
pub mod registers;
pub mod wear;

pub use device::{
    FlashConfig, FlashStorageDevice, DEFAULT_ENDURANCE, PAGE_PROGRAM_TIMEOUT, POLL_INTERVAL,
    SECTOR_ERASE_TIMEOUT,
};
pub use registers::{FlashProperties, PAGE_SIZE, SECTOR_SIZE, SUPPORTED_FLASH};
pub use wear::{WearRecord, DATA_PER_SECTOR, WEAR_RECORD_SIZE};

#[cfg(test)]
mod tests;
