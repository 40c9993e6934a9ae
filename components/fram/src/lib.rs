#![cfg_attr(not(test), no_std)]

//! Driver for SPI ferroelectric RAM used as the node's primary storage.
//!
//! The chip is byte addressable and needs no erase; `erase` only validates
//! the range. Identity (manufacturer and density code) is checked on `init`.

#[macro_use]
extern crate delog;
generate_macros!();

mod device;
pub mod registers;

pub use device::{FramConfig, FramState, FramStorageDevice, WAKE_RECOVERY};
pub use registers::{Density, ProtectionLevel};
