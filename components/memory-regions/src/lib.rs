#![no_std]

use core::ops::Range;

/// Layout of the node's persistent storage.
///
/// `config`, `event_log` and `message_log` partition the logical address
/// space served by the resilient storage, i.e. the smaller of the FRAM
/// region and the flash region's data area. `fallback` is the sector-aligned
/// chip range of the SPI flash owned by the fallback device.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemoryRegions {
    pub config: Range<u32>,
    pub event_log: Range<u32>,
    pub message_log: Range<u32>,
    pub fallback: Range<u32>,
}

impl MemoryRegions {
    /// MB85RS256 FRAM backed by the last eight sectors of a 2 MiB flash.
    /// Eight sectors hold 8 * 4080 = 0x7f80 data bytes.
    pub const FRAM_32K: Self = Self::split(0..0x7f80, 0x400, 0x2400, 0x1f_8000..0x20_0000);

    /// MB85RS64 FRAM with a two-sector fallback.
    pub const FRAM_8K: Self = Self::split(0..0x1fe0, 0x200, 0x1000, 0x1f_e000..0x20_0000);

    pub const fn split(
        region: Range<u32>,
        config_end: u32,
        event_log_end: u32,
        fallback: Range<u32>,
    ) -> Self {
        Self {
            config: region.start..config_end,
            event_log: config_end..event_log_end,
            message_log: event_log_end..region.end,
            fallback,
        }
    }

    /// Logical bytes covered by the three partitions.
    pub const fn logical_size(&self) -> u32 {
        self.message_log.end - self.config.start
    }

    pub const fn fallback_sectors(&self, sector_size: u32) -> u32 {
        (self.fallback.end - self.fallback.start) / sector_size
    }
}
