use core::ops::Range;

use circular_log::{header::HEADER_SLOT_SIZE, CircularLogConfig, PersistentCircularLog, Recovery};
use memory_regions::MemoryRegions;
use resilient_storage::{Observer, ResilientConfig, ResilientState, ResilientStats, ResilientStorage};
use storage_device::{
    crc::{crc16, CRC16_LEN},
    Result, SharedStorage, StorageDevice, StorageError, StorageHealth, MAX_TRANSFER_SIZE,
};

use crate::InitStatus;

pub const EVENT_ENTRY_SIZE: u16 = 16;
pub const MESSAGE_ENTRY_SIZE: u16 = 128;

/// Resilient FRAM/flash pair shared by every user of the store.
pub type NodeStorage<P, F> = SharedStorage<ResilientStorage<P, F>>;

pub type NodeLog<'a, P, F> = PersistentCircularLog<&'a NodeStorage<P, F>>;

fn log_transition(_old: ResilientState, _new: ResilientState) {
    info!("storage {:?} -> {:?}", _old, _new);
}

/// Builds and initialises the resilient storage, recording device failures
/// in `status`.
pub fn init_storage<P, F>(
    primary: P,
    fallback: F,
    config: ResilientConfig,
    status: &mut InitStatus,
) -> NodeStorage<P, F>
where
    P: StorageDevice,
    F: StorageDevice,
{
    let mut storage =
        ResilientStorage::new(primary, fallback, config).with_observer(log_transition as Observer);
    if let Err(_e) = storage.init() {
        error!("storage init failed: {:?}", _e);
        status.insert(InitStatus::STORAGE_FAILED);
    }
    if !storage.primary().is_ready() {
        error!("primary storage unavailable");
        status.insert(InitStatus::PRIMARY_ERROR);
    }
    // the fallback is only brought up when the primary is missing
    if storage.state() != ResilientState::Primary && !storage.fallback().is_ready() {
        error!("fallback storage unavailable");
        status.insert(InitStatus::FALLBACK_ERROR);
    }
    SharedStorage::new(storage)
}

fn log_config(region: &Range<u32>, entry_size: u16) -> CircularLogConfig {
    let entries = (region.end - region.start).saturating_sub(2 * HEADER_SLOT_SIZE) / entry_size as u32;
    CircularLogConfig::new(region.start, entry_size, entries.min(u16::MAX as u32) as u16)
}

fn open_log<D: StorageDevice>(
    log: &mut PersistentCircularLog<D>,
    _name: &str,
    formatted: InitStatus,
    status: &mut InitStatus,
) {
    match log.init() {
        Ok(Recovery::Formatted) => {
            warn!("{} log formatted", _name);
            status.insert(formatted);
        }
        Ok(Recovery::Restored(_slot)) => {
            info!("{} log: {} records (slot {:?})", _name, log.len(), _slot);
        }
        Err(_e) => {
            error!("{} log unavailable: {:?}", _name, _e);
            status.insert(InitStatus::STORAGE_FAILED);
        }
    }
}

/// Mounts the event and message logs on `storage`.
///
/// Every call on a log locks the storage once per device access. To run
/// whole operations (an append, a config update) under a single lock, share
/// the returned store itself through a [`SharedStorage`] and use its
/// [`lock`](SharedStorage::lock).
pub fn init_store<'a, P, F>(
    storage: &'a NodeStorage<P, F>,
    regions: &MemoryRegions,
    status: &mut InitStatus,
) -> NodeStore<'a, P, F>
where
    P: StorageDevice,
    F: StorageDevice,
{
    let events_config = log_config(&regions.event_log, EVENT_ENTRY_SIZE).overwrite_on_full(true);
    let mut events = PersistentCircularLog::new(storage, events_config);
    open_log(&mut events, "event", InitStatus::EVENT_LOG_FORMATTED, status);

    let messages_config = log_config(&regions.message_log, MESSAGE_ENTRY_SIZE);
    let mut messages = PersistentCircularLog::new(storage, messages_config);
    open_log(&mut messages, "message", InitStatus::MESSAGE_LOG_FORMATTED, status);

    NodeStore {
        storage,
        regions: regions.clone(),
        events,
        messages,
    }
}

pub struct NodeStore<'a, P, F> {
    storage: &'a NodeStorage<P, F>,
    regions: MemoryRegions,
    events: NodeLog<'a, P, F>,
    messages: NodeLog<'a, P, F>,
}

impl<'a, P, F> NodeStore<'a, P, F>
where
    P: StorageDevice,
    F: StorageDevice,
{
    /// Fixed-size event records; the oldest are overwritten when full.
    pub fn events(&mut self) -> &mut NodeLog<'a, P, F> {
        &mut self.events
    }

    /// Queued messages; writes fail with `BufferFull` when full.
    pub fn messages(&mut self) -> &mut NodeLog<'a, P, F> {
        &mut self.messages
    }

    pub fn regions(&self) -> &MemoryRegions {
        &self.regions
    }

    pub fn state(&self) -> ResilientState {
        self.storage.lock(|storage| storage.state())
    }

    pub fn stats(&self) -> ResilientStats {
        self.storage.lock(|storage| storage.stats())
    }

    pub fn health(&self) -> StorageHealth {
        self.storage.lock(|storage| storage.health())
    }

    /// Stores the node configuration blob followed by its CRC16.
    pub fn store_config(&mut self, data: &[u8]) -> Result<()> {
        let frame_len = data.len() + CRC16_LEN;
        if data.is_empty() || frame_len > self.config_capacity() {
            return Err(StorageError::InvalidSize);
        }
        let mut frame = [0u8; MAX_TRANSFER_SIZE];
        frame[..data.len()].copy_from_slice(data);
        frame[data.len()..frame_len].copy_from_slice(&crc16(data).to_be_bytes());

        let mut device = self.storage;
        device.write(self.regions.config.start, &frame[..frame_len])
    }

    /// Loads a configuration blob of `buf.len()` bytes, verifying its CRC16.
    /// `buf` is left untouched on a mismatch.
    pub fn load_config(&mut self, buf: &mut [u8]) -> Result<()> {
        let frame_len = buf.len() + CRC16_LEN;
        if buf.is_empty() || frame_len > self.config_capacity() {
            return Err(StorageError::InvalidSize);
        }
        let mut frame = [0u8; MAX_TRANSFER_SIZE];
        let mut device = self.storage;
        device.read(self.regions.config.start, &mut frame[..frame_len])?;

        let (payload, stored) = frame[..frame_len].split_at(buf.len());
        if crc16(payload) != u16::from_be_bytes([stored[0], stored[1]]) {
            warn!("config CRC mismatch");
            return Err(StorageError::CrcMismatch);
        }
        buf.copy_from_slice(payload);
        Ok(())
    }

    fn config_capacity(&self) -> usize {
        let region = &self.regions.config;
        ((region.end - region.start) as usize).min(MAX_TRANSFER_SIZE)
    }

    /// Copies the writes the fallback took while the primary was away back
    /// onto the primary and remounts both logs from it. Bytes written to the
    /// primary since the recovery are kept. Writes that hit the fallback
    /// before a reset are not known anymore and are not copied.
    pub fn resync(&mut self) -> Result<()> {
        let start = self.regions.config.start;
        let size = self.regions.message_log.end - start;
        self.storage
            .lock(|storage| storage.sync_to_primary(start, size))?;
        self.events.init()?;
        self.messages.init()?;
        info!("store resynced from fallback");
        Ok(())
    }
}
