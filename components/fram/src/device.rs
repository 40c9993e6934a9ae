use embedded_hal::{
    blocking::{
        delay::DelayUs,
        spi::{Transfer, Write as SpiWrite},
    },
    digital::v2::OutputPin,
};
use embedded_time::{duration::Microseconds, rate::Hertz};
use heapless::Vec;
use storage_device::{
    check_span, check_transfer,
    crc::{crc16, CRC16_LEN},
    Result, StorageDevice, StorageError, StorageHealth, TransferSize, MAX_TRANSFER_SIZE,
};

use crate::registers::{opcode, Density, ProtectionLevel, Status, MANUFACTURER_ID};

/// Time the chip needs after the wake-up chip-select pulse (tREC).
pub const WAKE_RECOVERY: Microseconds<u32> = Microseconds(400);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FramConfig {
    /// Chip address of the first byte handed out by the device.
    pub base_address: u32,
    pub region_size: u32,
    pub clock: Hertz<u32>,
    pub density: Density,
}

impl FramConfig {
    pub const MAX_CLOCK: Hertz<u32> = Hertz(20_000_000);

    /// Whole chip of the given density at the maximum clock.
    pub const fn new(density: Density) -> Self {
        Self {
            base_address: 0,
            region_size: density.size(),
            clock: Self::MAX_CLOCK,
            density,
        }
    }

    pub const fn with_region(mut self, base_address: u32, region_size: u32) -> Self {
        self.base_address = base_address;
        self.region_size = region_size;
        self
    }

    /// Sets the bus clock, bounded to the chip's rated maximum.
    pub const fn with_clock(mut self, clock: Hertz<u32>) -> Self {
        self.clock = if clock.0 > Self::MAX_CLOCK.0 {
            Self::MAX_CLOCK
        } else {
            clock
        };
        self
    }

    fn validate(&self) -> Result<()> {
        match self.base_address.checked_add(self.region_size) {
            Some(end) if self.region_size > 0 && end <= self.density.size() => Ok(()),
            _ => Err(StorageError::InvalidConfig),
        }
    }
}

impl Default for FramConfig {
    fn default() -> Self {
        Self::new(Density::Kbit256)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FramState {
    pub initialized: bool,
    pub asleep: bool,
    pub last_status: u8,
}

enum DataPhase<'a> {
    None,
    Write(&'a [u8]),
    Read(&'a mut [u8]),
}

/// SPI FRAM (Fujitsu MB85RS series) used as the node's primary storage.
///
/// The device hands out `config.region_size` bytes starting at
/// `config.base_address` on the chip. Writes never rely on a cached
/// protection level: the status register is read again right before every
/// write, then the write-enable latch is set and verified, and the data phase
/// follows in a single chip-select transaction after which the latch clears
/// on its own.
pub struct FramStorageDevice<SPI, CS, D> {
    spi: SPI,
    cs: CS,
    delay: D,
    config: FramConfig,
    state: FramState,
    error_count: u32,
    write_count: u32,
}

impl<SPI, CS, D> FramStorageDevice<SPI, CS, D> {
    pub fn new(spi: SPI, cs: CS, delay: D, config: FramConfig) -> Self {
        Self {
            spi,
            cs,
            delay,
            config,
            state: FramState::default(),
            error_count: 0,
            write_count: 0,
        }
    }

    pub fn config(&self) -> &FramConfig {
        &self.config
    }

    pub fn state(&self) -> FramState {
        self.state
    }

    pub fn is_asleep(&self) -> bool {
        self.state.asleep
    }

    pub fn release(self) -> (SPI, CS, D) {
        (self.spi, self.cs, self.delay)
    }

    fn ensure_awake(&self) -> Result<()> {
        if !self.state.initialized {
            Err(StorageError::NotInitialized)
        } else if self.state.asleep {
            Err(StorageError::Asleep)
        } else {
            Ok(())
        }
    }

    fn tally<T>(&mut self, result: Result<T>) -> Result<T> {
        if result.is_err() {
            self.error_count = self.error_count.saturating_add(1);
        }
        result
    }

    fn header(&self, op: u8, address: u32) -> ([u8; 4], usize) {
        let [_, a2, a1, a0] = address.to_be_bytes();
        if self.config.density.address_bytes() == 3 {
            ([op, a2, a1, a0], 4)
        } else {
            ([op, a1, a0, 0], 3)
        }
    }
}

impl<SPI, CS, D, E> FramStorageDevice<SPI, CS, D>
where
    SPI: Transfer<u8, Error = E> + SpiWrite<u8, Error = E>,
    CS: OutputPin,
    D: DelayUs<u32>,
{
    fn transaction(&mut self, header: &[u8], data: DataPhase<'_>) -> Result<()> {
        self.cs.set_low().map_err(|_| StorageError::Bus)?;
        let result = self.spi.write(header).and_then(|()| match data {
            DataPhase::None => Ok(()),
            DataPhase::Write(data) => self.spi.write(data),
            DataPhase::Read(buf) => {
                buf.fill(0);
                self.spi.transfer(buf).map(|_| ())
            }
        });
        let released = self.cs.set_high();
        result.map_err(|_| StorageError::Bus)?;
        released.map_err(|_| StorageError::Bus)
    }

    fn command(&mut self, op: u8) -> Result<()> {
        trace!("FRAM cmd {:02x}", op);
        self.transaction(&[op], DataPhase::None)
    }

    fn read_status(&mut self) -> Result<Status> {
        let mut status = [0u8];
        self.transaction(&[opcode::RDSR], DataPhase::Read(&mut status))?;
        self.state.last_status = status[0];
        Ok(Status::from(status[0]))
    }

    fn read_id(&mut self) -> Result<[u8; 4]> {
        let mut id = [0u8; 4];
        self.transaction(&[opcode::RDID], DataPhase::Read(&mut id))?;
        Ok(id)
    }

    fn write_enable(&mut self) -> Result<()> {
        self.command(opcode::WREN)?;
        if !self.read_status()?.wel() {
            warn!("FRAM WEL not set, status {:02x}", self.state.last_status);
            return Err(StorageError::WriteEnableFailed);
        }
        Ok(())
    }

    fn wake_pulse(&mut self) -> Result<()> {
        self.cs.set_low().map_err(|_| StorageError::Bus)?;
        self.cs.set_high().map_err(|_| StorageError::Bus)?;
        self.delay.delay_us(WAKE_RECOVERY.0);
        Ok(())
    }

    fn probe(&mut self) -> Result<()> {
        self.config.validate()?;
        // the chip may still be asleep from before a reset
        self.wake_pulse()?;

        let id = self.read_id()?;
        info!("FRAM id {}", delog::hex_str!(&id));
        if id[..2] != MANUFACTURER_ID {
            error!("FRAM manufacturer mismatch: {:02x} {:02x}", id[0], id[1]);
            return Err(StorageError::DeviceIdMismatch);
        }
        if Density::from_product_id(id[2]) != Some(self.config.density) {
            error!("FRAM density mismatch: {:02x}", id[2]);
            return Err(StorageError::DeviceIdMismatch);
        }

        let _status = self.read_status()?;
        debug!("FRAM status {:?}", _status);
        Ok(())
    }

    /// Current protection level, read from the chip.
    pub fn protection(&mut self) -> Result<ProtectionLevel> {
        self.ensure_awake()?;
        let status = self.read_status();
        self.tally(status).map(|status| status.protection())
    }

    pub fn set_protection(&mut self, level: ProtectionLevel) -> Result<()> {
        self.ensure_awake()?;
        let result = self.write_status_protection(level);
        self.tally(result)
    }

    fn write_status_protection(&mut self, level: ProtectionLevel) -> Result<()> {
        let mut status = self.read_status()?;
        status.set_block_protect(level.bits());
        self.write_enable()?;
        self.transaction(&[opcode::WRSR, u8::from(status)], DataPhase::None)?;
        if self.read_status()?.protection() != level {
            return Err(StorageError::WriteFailed);
        }
        info!("FRAM protection {:?}", level);
        Ok(())
    }

    fn program(&mut self, address: u32, data: &[u8]) -> Result<()> {
        let chip_address = self.config.base_address + address;
        let protection = self.read_status()?.protection();
        if protection.covers(self.config.density.size(), chip_address, data.len() as u32) {
            warn!("FRAM write {:x} rejected by {:?}", chip_address, protection);
            return Err(StorageError::WriteProtected);
        }
        self.write_enable()?;
        let (header, len) = self.header(opcode::WRITE, chip_address);
        self.transaction(&header[..len], DataPhase::Write(data))
    }

    /// Writes `data` followed by its big-endian CRC16.
    pub fn write_with_crc(&mut self, address: u32, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Err(StorageError::InvalidSize);
        }
        let mut frame: Vec<u8, MAX_TRANSFER_SIZE> = Vec::new();
        frame
            .extend_from_slice(data)
            .map_err(|_| StorageError::InvalidSize)?;
        frame
            .extend_from_slice(&crc16(data).to_be_bytes())
            .map_err(|_| StorageError::InvalidSize)?;
        self.write(address, &frame)
    }

    /// Reads `buf.len()` bytes plus the trailing CRC16 and checks it. A
    /// mismatch leaves `buf` untouched.
    pub fn read_with_crc(&mut self, address: u32, buf: &mut [u8]) -> Result<()> {
        if buf.is_empty() {
            return Err(StorageError::InvalidSize);
        }
        let total = TransferSize::new(buf.len() + CRC16_LEN)?.get();
        let mut frame = [0u8; MAX_TRANSFER_SIZE];
        self.read(address, &mut frame[..total])?;

        let (payload, stored) = frame[..total].split_at(buf.len());
        if crc16(payload) != u16::from_be_bytes([stored[0], stored[1]]) {
            warn!("FRAM CRC mismatch at {:x}", address);
            self.error_count = self.error_count.saturating_add(1);
            return Err(StorageError::CrcMismatch);
        }
        buf.copy_from_slice(payload);
        Ok(())
    }

    /// Puts the chip into its low-power mode. Every operation but
    /// [`wake`](Self::wake) fails with `Asleep` until then.
    pub fn sleep(&mut self) -> Result<()> {
        if !self.state.initialized {
            return Err(StorageError::NotInitialized);
        }
        if self.state.asleep {
            return Ok(());
        }
        let result = self.command(opcode::SLEEP);
        self.tally(result)?;
        self.state.asleep = true;
        debug!("FRAM asleep");
        Ok(())
    }

    /// Pulses chip select and blocks for [`WAKE_RECOVERY`].
    pub fn wake(&mut self) -> Result<()> {
        let result = self.wake_pulse();
        self.tally(result)?;
        self.state.asleep = false;
        debug!("FRAM awake");
        Ok(())
    }
}

impl<SPI, CS, D, E> StorageDevice for FramStorageDevice<SPI, CS, D>
where
    SPI: Transfer<u8, Error = E> + SpiWrite<u8, Error = E>,
    CS: OutputPin,
    D: DelayUs<u32>,
{
    fn init(&mut self) -> Result<()> {
        self.state.initialized = false;
        let result = self.probe();
        self.tally(result)?;
        self.state.initialized = true;
        self.state.asleep = false;
        info!(
            "FRAM ready: {:x}+{:x} @ {} Hz",
            self.config.base_address, self.config.region_size, self.config.clock.0
        );
        Ok(())
    }

    fn read(&mut self, address: u32, buf: &mut [u8]) -> Result<()> {
        check_transfer(address, buf.len(), self.capacity())?;
        self.ensure_awake()?;
        trace!("FRAM r {:x} {:x}", address, buf.len());
        let (header, len) = self.header(opcode::READ, self.config.base_address + address);
        let result = self.transaction(&header[..len], DataPhase::Read(buf));
        self.tally(result)
    }

    fn write(&mut self, address: u32, data: &[u8]) -> Result<()> {
        check_transfer(address, data.len(), self.capacity())?;
        self.ensure_awake()?;
        trace!("FRAM w {:x} {:x}", address, data.len());
        let result = self.program(address, data);
        self.tally(result)?;
        self.write_count = self.write_count.wrapping_add(1);
        Ok(())
    }

    fn erase(&mut self, address: u32, len: u32) -> Result<()> {
        check_span(address, len, self.capacity())?;
        self.ensure_awake()
    }

    fn capacity(&self) -> u32 {
        self.config.region_size
    }

    fn is_ready(&self) -> bool {
        self.state.initialized && !self.state.asleep
    }

    fn health(&self) -> StorageHealth {
        StorageHealth {
            initialized: self.state.initialized,
            healthy: self.state.initialized,
            degraded: self.error_count > 0,
            error_count: self.error_count,
            write_count: self.write_count,
            health_percent: if self.state.initialized { 100 } else { 0 },
        }
    }
}
