use crate::{check_span, check_transfer, Result, StorageDevice, StorageError, StorageHealth};

/// Byte-addressable storage kept in RAM.
///
/// Used as a volatile backend and as a stand-in for real chips on the host.
/// Faults can be injected to simulate a failing chip or a power cut:
///
/// * [`fail_next`](Self::fail_next): the next `n` operations fail with
///   [`StorageError::Bus`],
/// * [`set_offline`](Self::set_offline): every operation, `init` included,
///   fails until the device is brought back,
/// * [`cut_power_after`](Self::cut_power_after): after `n` more complete
///   writes, nothing reaches the array anymore,
/// * [`tear_write`](Self::tear_write): after `n` more complete writes, the
///   next one only stores its first bytes before the power is cut.
///
/// With [`program_like_nor`](Self::program_like_nor) writes can only clear
/// bits and `erase` resets the range to [`ERASE_VALUE`](Self::ERASE_VALUE).
/// A write whose bytes do not read back fails with
/// [`StorageError::WriteFailed`].
pub struct RamStorage<const N: usize> {
    data: [u8; N],
    initialized: bool,
    offline: bool,
    fail_next: u32,
    writes_until_cut: Option<u32>,
    tear: Option<(u32, usize)>,
    powered: bool,
    nor: bool,
    error_count: u32,
    write_count: u32,
}

impl<const N: usize> Default for RamStorage<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> RamStorage<N> {
    pub const ERASE_VALUE: u8 = 0xff;

    pub const fn new() -> Self {
        Self {
            data: [Self::ERASE_VALUE; N],
            initialized: false,
            offline: false,
            fail_next: 0,
            writes_until_cut: None,
            tear: None,
            powered: true,
            nor: false,
            error_count: 0,
            write_count: 0,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Direct access to the array, bypassing validation and fault injection.
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn fail_next(&mut self, count: u32) {
        self.fail_next = count;
    }

    pub fn set_offline(&mut self, offline: bool) {
        self.offline = offline;
        if offline {
            self.initialized = false;
        }
    }

    pub fn cut_power_after(&mut self, writes: u32) {
        self.writes_until_cut = Some(writes);
    }

    pub fn tear_write(&mut self, after: u32, keep: usize) {
        self.tear = Some((after, keep));
    }

    pub fn program_like_nor(&mut self, nor: bool) {
        self.nor = nor;
    }

    /// Clears every pending or active fault, as after a reboot.
    pub fn restore_power(&mut self) {
        self.powered = true;
        self.offline = false;
        self.fail_next = 0;
        self.writes_until_cut = None;
        self.tear = None;
    }

    pub fn is_powered(&self) -> bool {
        self.powered
    }

    fn injected_fault(&mut self) -> Result<()> {
        if self.offline || !self.powered {
            self.error_count += 1;
            return Err(StorageError::Bus);
        }
        if self.fail_next > 0 {
            self.fail_next -= 1;
            self.error_count += 1;
            return Err(StorageError::Bus);
        }
        Ok(())
    }

    fn ensure_ready(&mut self) -> Result<()> {
        if !self.initialized {
            return Err(StorageError::NotInitialized);
        }
        self.injected_fault()
    }
}

impl<const N: usize> StorageDevice for RamStorage<N> {
    fn init(&mut self) -> Result<()> {
        self.injected_fault()?;
        self.initialized = true;
        Ok(())
    }

    fn read(&mut self, address: u32, buf: &mut [u8]) -> Result<()> {
        check_transfer(address, buf.len(), self.capacity())?;
        self.ensure_ready()?;
        let start = address as usize;
        buf.copy_from_slice(&self.data[start..start + buf.len()]);
        Ok(())
    }

    fn write(&mut self, address: u32, data: &[u8]) -> Result<()> {
        check_transfer(address, data.len(), self.capacity())?;
        self.ensure_ready()?;
        let start = address as usize;

        match self.tear {
            Some((0, keep)) => {
                self.tear = None;
                let keep = keep.min(data.len());
                self.data[start..start + keep].copy_from_slice(&data[..keep]);
                warn!("RAM power cut after {} of {} bytes at {:x}", keep, data.len(), address);
                self.powered = false;
                self.error_count += 1;
                return Err(StorageError::Bus);
            }
            Some((after, keep)) => self.tear = Some((after - 1, keep)),
            None => {}
        }
        if let Some(remaining) = self.writes_until_cut.as_mut() {
            if *remaining == 0 {
                warn!("RAM power cut before write at {:x}", address);
                self.powered = false;
                self.error_count += 1;
                return Err(StorageError::Bus);
            }
            *remaining -= 1;
        }

        let target = &mut self.data[start..start + data.len()];
        if self.nor {
            target.iter_mut().zip(data).for_each(|(cell, byte)| *cell &= byte);
            if target[..] != data[..] {
                warn!("RAM program over unerased bytes at {:x}", address);
                self.error_count += 1;
                return Err(StorageError::WriteFailed);
            }
        } else {
            target.copy_from_slice(data);
        }
        self.write_count = self.write_count.wrapping_add(1);
        Ok(())
    }

    fn erase(&mut self, address: u32, len: u32) -> Result<()> {
        check_span(address, len, self.capacity())?;
        self.ensure_ready()?;
        if self.nor {
            let start = address as usize;
            self.data[start..start + len as usize].fill(Self::ERASE_VALUE);
        }
        Ok(())
    }

    fn capacity(&self) -> u32 {
        N as u32
    }

    fn is_ready(&self) -> bool {
        self.initialized && !self.offline && self.powered
    }

    fn health(&self) -> StorageHealth {
        let healthy = self.is_ready();
        StorageHealth {
            initialized: self.initialized,
            healthy,
            degraded: self.error_count > 0,
            error_count: self.error_count,
            write_count: self.write_count,
            health_percent: if healthy { 100 } else { 0 },
        }
    }
}
