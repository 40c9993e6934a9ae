#![no_std]

//! Primary/fallback composition of two storage devices.
//!
//! [`ResilientStorage`] serves every request from the primary device (FRAM
//! on the node) until it fails `failure_threshold` times in a row, then
//! switches to the fallback (SPI flash) and replays the failed request
//! there. While on the fallback it re-probes the primary after a number of
//! served operations that grows geometrically with every failed probe.
//!
//! ```text
//!            init ok                 threshold reached
//!   Failed ----------> Primary -----------------------> Fallback
//!     ^                  ^                                 |  ^
//!     |                  |  probe ok            interval   |  | probe failed
//!     |                  +----------- Recovering <---------+  |
//!     |                                   +-------------------+
//!     +---- both devices unusable
//! ```
//!
//! Data written while on the fallback is tracked but not copied back
//! automatically; see [`ResilientStorage::sync_to_primary`].

#[macro_use]
extern crate delog;
generate_macros!();

#[cfg(test)]
#[macro_use]
extern crate std;

mod dirty;
mod resilient;

pub use dirty::{DirtyRanges, MAX_DIRTY_RANGES};
pub use resilient::{Observer, ResilientStorage};

use storage_device::{Result, StorageError, MAX_TRANSFER_SIZE};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResilientState {
    Primary,
    Fallback,
    /// Transient, only visible to the observer while a probe runs.
    Recovering,
    /// Neither device is usable; every call fails until the next `init`.
    Failed,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DeviceStats {
    pub reads: u32,
    pub writes: u32,
    pub errors: u32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ResilientStats {
    pub primary: DeviceStats,
    pub fallback: DeviceStats,
    pub failovers: u32,
    pub recoveries: u32,
    pub recovery_attempts: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResilientConfig {
    /// Consecutive errors after which a device is given up.
    pub failure_threshold: u32,
    /// Operations served by the fallback before the first primary probe.
    pub initial_retry_interval: u32,
    /// Multiplier applied to the interval after a failed probe.
    pub backoff_factor: u32,
    pub max_retry_interval: u32,
    /// Range read from the primary to verify it after re-initialisation.
    pub probe_address: u32,
    pub probe_len: u32,
}

impl ResilientConfig {
    pub const fn new() -> Self {
        Self {
            failure_threshold: 3,
            initial_retry_interval: 16,
            backoff_factor: 2,
            max_retry_interval: 1024,
            probe_address: 0,
            probe_len: 16,
        }
    }

    pub const fn with_backoff(mut self, initial: u32, factor: u32, max: u32) -> Self {
        self.initial_retry_interval = initial;
        self.backoff_factor = factor;
        self.max_retry_interval = max;
        self
    }

    pub const fn with_probe(mut self, address: u32, len: u32) -> Self {
        self.probe_address = address;
        self.probe_len = len;
        self
    }

    /// Interval to use after a failed probe.
    pub fn next_interval(&self, current: u32) -> u32 {
        current
            .saturating_mul(self.backoff_factor)
            .min(self.max_retry_interval)
    }

    fn validate(&self) -> Result<()> {
        if self.failure_threshold == 0
            || self.initial_retry_interval == 0
            || self.backoff_factor == 0
            || self.max_retry_interval < self.initial_retry_interval
            || self.probe_len == 0
            || self.probe_len as usize > MAX_TRANSFER_SIZE
        {
            return Err(StorageError::InvalidConfig);
        }
        Ok(())
    }
}

impl Default for ResilientConfig {
    fn default() -> Self {
        Self::new()
    }
}
