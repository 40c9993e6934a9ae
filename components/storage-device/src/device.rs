use crate::{Result, StorageError};

/// Upper bound of a single `read` / `write` request.
pub const MAX_TRANSFER_SIZE: usize = 256;

/// Length of a validated transfer, `1..=MAX_TRANSFER_SIZE` bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct TransferSize(u16);

impl TransferSize {
    pub const MAX: Self = Self(MAX_TRANSFER_SIZE as u16);

    pub const fn new(len: usize) -> Result<Self> {
        if len == 0 || len > MAX_TRANSFER_SIZE {
            Err(StorageError::InvalidSize)
        } else {
            Ok(Self(len as u16))
        }
    }

    pub const fn get(self) -> usize {
        self.0 as usize
    }
}

/// Validates a `read` / `write` request of `len` bytes at `address` against a
/// device of `capacity` bytes.
pub fn check_transfer(address: u32, len: usize, capacity: u32) -> Result<TransferSize> {
    let size = TransferSize::new(len)?;
    check_span(address, len as u32, capacity)?;
    Ok(size)
}

/// Validates an arbitrary (non-empty) span, as used by `erase`.
pub fn check_span(address: u32, len: u32, capacity: u32) -> Result<()> {
    if len == 0 {
        return Err(StorageError::InvalidSize);
    }
    if address >= capacity {
        return Err(StorageError::InvalidAddress);
    }
    match address.checked_add(len) {
        Some(end) if end <= capacity => Ok(()),
        _ => Err(StorageError::AddressOverflow),
    }
}

/// Derived health snapshot of a device. Never persisted.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StorageHealth {
    pub initialized: bool,
    pub healthy: bool,
    pub degraded: bool,
    pub error_count: u32,
    pub write_count: u32,
    /// Remaining endurance, 0-100.
    pub health_percent: u8,
}

pub trait StorageDevice {
    /// Probes the hardware and makes the device usable. Must be called before
    /// any other operation; may be called again to re-probe.
    fn init(&mut self) -> Result<()>;

    /// Fills `buf` from `address`; `buf.len()` is the transfer size.
    fn read(&mut self, address: u32, buf: &mut [u8]) -> Result<()>;

    fn write(&mut self, address: u32, data: &[u8]) -> Result<()>;

    /// Returns `len` bytes at `address` to the erased state. Byte-addressable
    /// memories only validate the range.
    fn erase(&mut self, address: u32, len: u32) -> Result<()>;

    /// Usable size of the device's address space in bytes.
    fn capacity(&self) -> u32;

    fn is_ready(&self) -> bool;

    fn health(&self) -> StorageHealth;
}

impl<T: StorageDevice + ?Sized> StorageDevice for &mut T {
    fn init(&mut self) -> Result<()> {
        (**self).init()
    }

    fn read(&mut self, address: u32, buf: &mut [u8]) -> Result<()> {
        (**self).read(address, buf)
    }

    fn write(&mut self, address: u32, data: &[u8]) -> Result<()> {
        (**self).write(address, data)
    }

    fn erase(&mut self, address: u32, len: u32) -> Result<()> {
        (**self).erase(address, len)
    }

    fn capacity(&self) -> u32 {
        (**self).capacity()
    }

    fn is_ready(&self) -> bool {
        (**self).is_ready()
    }

    fn health(&self) -> StorageHealth {
        (**self).health()
    }
}
