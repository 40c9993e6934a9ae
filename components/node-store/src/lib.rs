#![no_std]

//! Boot-time assembly of the node's persistent storage: the FRAM primary and
//! SPI flash fallback behind one resilient device, the node configuration
//! blob, and the event and message logs laid out by [`MemoryRegions`].
//!
//! [`MemoryRegions`]: memory_regions::MemoryRegions

#[macro_use]
extern crate delog;
generate_macros!();

#[cfg(test)]
#[macro_use]
extern crate std;

mod store;

pub use store::{
    init_storage, init_store, NodeLog, NodeStorage, NodeStore, EVENT_ENTRY_SIZE,
    MESSAGE_ENTRY_SIZE,
};

bitflags::bitflags! {
    /// Problems found while bringing up storage.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct InitStatus: u8 {
        const PRIMARY_ERROR = 0b0000_0001;
        const FALLBACK_ERROR = 0b0000_0010;
        const STORAGE_FAILED = 0b0000_0100;
        const EVENT_LOG_FORMATTED = 0b0000_1000;
        const MESSAGE_LOG_FORMATTED = 0b0001_0000;
    }
}

#[cfg(test)]
mod tests;
