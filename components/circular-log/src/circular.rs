use storage_device::{Result, StorageDevice, StorageError, MAX_TRANSFER_SIZE};

use crate::header::{is_seq_newer, LogHeader, Slot, HEADER_LEN, HEADER_SLOT_SIZE};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CircularLogConfig {
    /// Device address of header slot A.
    pub base_address: u32,
    /// Size of every record, at most one transfer.
    pub entry_size: u16,
    pub max_entries: u16,
    /// Evict the oldest record instead of failing with `BufferFull`.
    pub overwrite_on_full: bool,
}

impl CircularLogConfig {
    pub const fn new(base_address: u32, entry_size: u16, max_entries: u16) -> Self {
        Self {
            base_address,
            entry_size,
            max_entries,
            overwrite_on_full: false,
        }
    }

    pub const fn overwrite_on_full(mut self, overwrite: bool) -> Self {
        self.overwrite_on_full = overwrite;
        self
    }

    /// Bytes taken on the device: both header slots plus every entry slot.
    pub const fn footprint(&self) -> u64 {
        2 * HEADER_SLOT_SIZE as u64 + self.entry_size as u64 * self.max_entries as u64
    }

    fn validate(&self, capacity: u32) -> Result<()> {
        if self.entry_size == 0
            || self.entry_size as usize > MAX_TRANSFER_SIZE
            || self.max_entries == 0
            || self.base_address as u64 + self.footprint() > capacity as u64
        {
            return Err(StorageError::InvalidConfig);
        }
        Ok(())
    }
}

/// How `init` found the log.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Recovery {
    /// State restored from the given header slot.
    Restored(Slot),
    /// No valid header; an empty log was written.
    Formatted,
}

/// Ring of fixed-size records on a [`StorageDevice`], surviving power loss
/// at any point.
///
/// Two header slots hold the ring state. A change is committed by writing
/// the new state, with the sequence number incremented, to the slot that is
/// *not* active and only then switching over, so one slot always holds the
/// last committed state. Payloads are written before the header that makes
/// them visible.
///
/// The device must accept overwrites without an erase (FRAM, RAM).
pub struct PersistentCircularLog<D> {
    device: D,
    config: CircularLogConfig,
    header: LogHeader,
    active: Slot,
    ready: bool,
}

impl<D> PersistentCircularLog<D> {
    pub fn new(device: D, config: CircularLogConfig) -> Self {
        Self {
            device,
            config,
            header: LogHeader::empty(config.entry_size, config.max_entries, 0),
            active: Slot::A,
            ready: false,
        }
    }

    pub fn config(&self) -> &CircularLogConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.header.count as usize
    }

    pub fn is_empty(&self) -> bool {
        self.header.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.header.is_full()
    }

    /// Maximum number of records.
    pub fn capacity(&self) -> usize {
        self.config.max_entries as usize
    }

    /// Sequence number of the last committed header.
    pub fn sequence(&self) -> u16 {
        self.header.sequence
    }

    pub fn active_slot(&self) -> Slot {
        self.active
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    pub fn release(self) -> D {
        self.device
    }

    fn slot_address(&self, slot: Slot) -> u32 {
        self.config.base_address + slot.offset()
    }

    fn entry_address(&self, index: u16) -> u32 {
        self.config.base_address
            + 2 * HEADER_SLOT_SIZE
            + index as u32 * self.config.entry_size as u32
    }

    fn ensure_ready(&self) -> Result<()> {
        if self.ready {
            Ok(())
        } else {
            Err(StorageError::NotInitialized)
        }
    }

    fn check_entry(&self, len: usize) -> Result<()> {
        self.ensure_ready()?;
        if len != self.config.entry_size as usize {
            return Err(StorageError::SizeMismatch);
        }
        Ok(())
    }
}

impl<D: StorageDevice> PersistentCircularLog<D> {
    /// Restores the newest valid header, or formats the log when neither slot
    /// holds one. The device must already be initialised.
    pub fn init(&mut self) -> Result<Recovery> {
        self.ready = false;
        self.config.validate(self.device.capacity())?;

        let a = self.load(Slot::A)?;
        let b = self.load(Slot::B)?;
        let (slot, header) = match (a, b) {
            (Some(a), Some(b)) if is_seq_newer(b.sequence, a.sequence) => (Slot::B, b),
            (Some(a), _) => (Slot::A, a),
            (None, Some(b)) => (Slot::B, b),
            (None, None) => {
                warn!("log at {:x}: no valid header, formatting", self.config.base_address);
                self.format()?;
                return Ok(Recovery::Formatted);
            }
        };
        self.header = header;
        self.active = slot;
        self.ready = true;
        info!(
            "log at {:x}: {} of {} from slot {:?}, seq {}",
            self.config.base_address, header.count, header.max_entries, slot, header.sequence
        );
        Ok(Recovery::Restored(slot))
    }

    /// A slot's header if it is intact and describes this log's geometry.
    fn load(&mut self, slot: Slot) -> Result<Option<LogHeader>> {
        let mut bytes = [0u8; HEADER_LEN];
        self.device.read(self.slot_address(slot), &mut bytes)?;
        match LogHeader::decode(&bytes) {
            Ok(header)
                if header.entry_size == self.config.entry_size
                    && header.max_entries == self.config.max_entries =>
            {
                Ok(Some(header))
            }
            Ok(_header) => {
                warn!(
                    "log slot {:?}: geometry {}x{} does not match",
                    slot, _header.entry_size, _header.max_entries
                );
                Ok(None)
            }
            Err(_e) => {
                debug!("log slot {:?}: {:?}", slot, _e);
                Ok(None)
            }
        }
    }

    /// Writes an empty header to both slots and makes slot A active. Existing
    /// records are dropped.
    pub fn format(&mut self) -> Result<()> {
        self.config.validate(self.device.capacity())?;
        let header = LogHeader::empty(self.config.entry_size, self.config.max_entries, 0);
        let bytes = header.encode();
        self.device.write(self.slot_address(Slot::A), &bytes)?;
        self.device.write(self.slot_address(Slot::B), &bytes)?;
        self.header = header;
        self.active = Slot::A;
        self.ready = true;
        Ok(())
    }

    /// Persists `next` with the following sequence number to the inactive
    /// slot, then switches to it. On error nothing changes in memory.
    fn commit(&mut self, next: LogHeader) -> Result<()> {
        let next = LogHeader {
            sequence: self.header.sequence.wrapping_add(1),
            ..next
        };
        let target = self.active.other();
        self.device.write(self.slot_address(target), &next.encode())?;
        trace!(
            "log commit {:?} seq {} h{} t{} n{}",
            target, next.sequence, next.head, next.tail, next.count
        );
        self.header = next;
        self.active = target;
        Ok(())
    }

    /// Appends a record of exactly `entry_size` bytes.
    ///
    /// Each append commits the header once. When the log is full and
    /// overwrites, the eviction of the oldest record is committed first, so
    /// that append costs two header writes and advances the sequence by 2.
    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        self.check_entry(data.len())?;
        if self.header.is_full() {
            if !self.config.overwrite_on_full {
                return Err(StorageError::BufferFull);
            }
            // the oldest record is dropped before its slot is overwritten
            self.commit(self.header.popped())?;
        }
        self.device.write(self.entry_address(self.header.head), data)?;
        self.commit(self.header.pushed())
    }

    /// Copies the oldest record into `buf` without removing it.
    pub fn peek(&mut self, buf: &mut [u8]) -> Result<()> {
        self.check_entry(buf.len())?;
        if self.header.is_empty() {
            return Err(StorageError::BufferEmpty);
        }
        self.device.read(self.entry_address(self.header.tail), buf)
    }

    /// Removes the oldest record into `buf`.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<()> {
        self.peek(buf)?;
        self.commit(self.header.popped())
    }

    /// Drops the oldest record.
    pub fn pop(&mut self) -> Result<()> {
        self.ensure_ready()?;
        if self.header.is_empty() {
            return Err(StorageError::BufferEmpty);
        }
        self.commit(self.header.popped())
    }

    /// Copies the `index`-th oldest record into `buf`.
    pub fn read_at(&mut self, index: usize, buf: &mut [u8]) -> Result<()> {
        self.check_entry(buf.len())?;
        if index >= self.len() {
            return Err(StorageError::InvalidIndex);
        }
        let slot = self.header.nth(index as u16);
        self.device.read(self.entry_address(slot), buf)
    }

    /// Empties the log through a regular commit.
    pub fn clear(&mut self) -> Result<()> {
        self.ensure_ready()?;
        self.commit(LogHeader::empty(
            self.config.entry_size,
            self.config.max_entries,
            self.header.sequence,
        ))
    }
}
