use core::cell::RefCell;

use critical_section::Mutex;

use crate::{Result, StorageDevice, StorageHealth};

/// A storage device shared between tasks.
///
/// Each `StorageDevice` call made through `&SharedStorage` runs inside a
/// single critical section, so read-modify-write sequences inside a driver
/// (write-enable check then data phase) are never interleaved with another
/// caller's bus traffic. Sequences spanning several calls, such as a whole
/// log append or a failover-and-retry, go through [`lock`](Self::lock).
///
/// Calling `lock` from within `lock` on the same instance panics.
///
/// The critical section is held for the whole call, bus I/O included, and
/// masks interrupts on single-core targets. A flash sector erase can keep it
/// for up to 400 ms and a chip erase for seconds; run long erases where that
/// latency is acceptable.
pub struct SharedStorage<D> {
    inner: Mutex<RefCell<D>>,
}

impl<D> SharedStorage<D> {
    pub const fn new(device: D) -> Self {
        Self {
            inner: Mutex::new(RefCell::new(device)),
        }
    }

    pub fn lock<R>(&self, f: impl FnOnce(&mut D) -> R) -> R {
        critical_section::with(|cs| f(&mut self.inner.borrow_ref_mut(cs)))
    }

    pub fn into_inner(self) -> D {
        self.inner.into_inner().into_inner()
    }
}

impl<D: StorageDevice> StorageDevice for &SharedStorage<D> {
    fn init(&mut self) -> Result<()> {
        self.lock(|device| device.init())
    }

    fn read(&mut self, address: u32, buf: &mut [u8]) -> Result<()> {
        self.lock(|device| device.read(address, buf))
    }

    fn write(&mut self, address: u32, data: &[u8]) -> Result<()> {
        self.lock(|device| device.write(address, data))
    }

    fn erase(&mut self, address: u32, len: u32) -> Result<()> {
        self.lock(|device| device.erase(address, len))
    }

    fn capacity(&self) -> u32 {
        self.lock(|device| device.capacity())
    }

    fn is_ready(&self) -> bool {
        self.lock(|device| device.is_ready())
    }

    fn health(&self) -> StorageHealth {
        self.lock(|device| device.health())
    }
}
