use core::cmp::min;

use embedded_hal::{
    blocking::{
        delay::DelayUs,
        spi::{Transfer, Write as SpiWrite},
    },
    digital::v2::OutputPin,
};
use embedded_time::{duration::Microseconds, rate::Hertz};
use storage_device::{
    check_span, check_transfer, Result, StorageDevice, StorageError, StorageHealth,
};

use crate::{
    registers::{lookup, opcode, FlashProperties, Status, PAGE_SIZE, SECTOR_SIZE},
    wear::{WearRecord, DATA_PER_SECTOR, WEAR_RECORD_SIZE},
};

/// Upper bound for a page program to complete.
pub const PAGE_PROGRAM_TIMEOUT: Microseconds<u32> = Microseconds(5_000);
/// Upper bound for a 4 KiB sector erase to complete.
pub const SECTOR_ERASE_TIMEOUT: Microseconds<u32> = Microseconds(400_000);
/// Delay between two status polls while the chip is busy.
pub const POLL_INTERVAL: Microseconds<u32> = Microseconds(100);

/// Typical rated program/erase cycles per sector.
pub const DEFAULT_ENDURANCE: u32 = 100_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FlashConfig {
    /// Chip address of the first owned sector, sector aligned.
    pub base_address: u32,
    /// Owned bytes on the chip, a whole number of sectors.
    pub region_size: u32,
    pub clock: Hertz<u32>,
    /// Erase cycles at which a sector is considered worn out.
    pub endurance: u32,
}

impl FlashConfig {
    pub const MAX_CLOCK: Hertz<u32> = Hertz(33_000_000);

    pub const fn new(base_address: u32, sectors: u32) -> Self {
        Self {
            base_address,
            region_size: sectors * SECTOR_SIZE,
            clock: Self::MAX_CLOCK,
            endurance: DEFAULT_ENDURANCE,
        }
    }

    /// Sets the bus clock, bounded to the slowest supported chip's maximum.
    pub const fn with_clock(mut self, clock: Hertz<u32>) -> Self {
        self.clock = if clock.0 > Self::MAX_CLOCK.0 {
            Self::MAX_CLOCK
        } else {
            clock
        };
        self
    }

    pub const fn with_endurance(mut self, endurance: u32) -> Self {
        self.endurance = endurance;
        self
    }

    pub const fn sectors(&self) -> u32 {
        self.region_size / SECTOR_SIZE
    }

    fn validate(&self, chip_size: u32) -> Result<()> {
        if self.base_address % SECTOR_SIZE != 0
            || self.region_size == 0
            || self.region_size % SECTOR_SIZE != 0
            || self.endurance == 0
        {
            return Err(StorageError::InvalidConfig);
        }
        match self.base_address.checked_add(self.region_size) {
            Some(end) if end <= chip_size => Ok(()),
            _ => Err(StorageError::InvalidConfig),
        }
    }
}

impl Default for FlashConfig {
    fn default() -> Self {
        Self::new(0, 16)
    }
}

enum DataPhase<'a> {
    None,
    Write(&'a [u8]),
    Read(&'a mut [u8]),
}

/// SPI NOR flash used as the node's fallback storage.
///
/// The last [`WEAR_RECORD_SIZE`] bytes of every owned sector hold a
/// [`WearRecord`]; they are not part of the logical address space, which is
/// `sectors * DATA_PER_SECTOR` bytes long and maps onto the chip sector by
/// sector. Writes are split so that no page program crosses a page or the end
/// of a sector's data area, and every program and erase is followed by a
/// bounded busy poll.
///
/// Writes do not erase: callers erase the containing range first, the same
/// way a block device is driven. Every page program is read back, and a
/// write over data that was not erased fails with `WriteFailed`.
pub struct FlashStorageDevice<SPI, CS, D> {
    spi: SPI,
    cs: CS,
    delay: D,
    config: FlashConfig,
    identity: Option<&'static FlashProperties>,
    max_erase_count: u32,
    error_count: u32,
    write_count: u32,
}

impl<SPI, CS, D> FlashStorageDevice<SPI, CS, D> {
    pub fn new(spi: SPI, cs: CS, delay: D, config: FlashConfig) -> Self {
        Self {
            spi,
            cs,
            delay,
            config,
            identity: None,
            max_erase_count: 0,
            error_count: 0,
            write_count: 0,
        }
    }

    pub fn config(&self) -> &FlashConfig {
        &self.config
    }

    /// The detected chip, once `init` succeeded.
    pub fn identity(&self) -> Option<&'static FlashProperties> {
        self.identity
    }

    /// Highest erase count seen on any owned sector.
    pub fn max_erase_count(&self) -> u32 {
        self.max_erase_count
    }

    pub fn release(self) -> (SPI, CS, D) {
        (self.spi, self.cs, self.delay)
    }

    fn ensure_ready(&self) -> Result<()> {
        match self.identity {
            Some(_) => Ok(()),
            None => Err(StorageError::NotInitialized),
        }
    }

    fn tally<T>(&mut self, result: Result<T>) -> Result<T> {
        if result.is_err() {
            self.error_count = self.error_count.saturating_add(1);
        }
        result
    }

    fn sector_base(&self, sector: u32) -> u32 {
        self.config.base_address + sector * SECTOR_SIZE
    }

    fn physical(&self, logical: u32) -> u32 {
        self.sector_base(logical / DATA_PER_SECTOR) + logical % DATA_PER_SECTOR
    }
}

impl<SPI, CS, D, E> FlashStorageDevice<SPI, CS, D>
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

    fn addressed(op: u8, address: u32) -> [u8; 4] {
        let [_, a2, a1, a0] = address.to_be_bytes();
        [op, a2, a1, a0]
    }

    fn read_status(&mut self) -> Result<Status> {
        let mut status = [0u8];
        self.transaction(&[opcode::RDSR], DataPhase::Read(&mut status))?;
        Ok(Status::from(status[0]))
    }

    fn read_jedec(&mut self) -> Result<[u8; 3]> {
        let mut jedec = [0u8; 3];
        self.transaction(&[opcode::RDID], DataPhase::Read(&mut jedec))?;
        Ok(jedec)
    }

    fn write_enable(&mut self) -> Result<()> {
        self.transaction(&[opcode::WREN], DataPhase::None)?;
        let status = self.read_status()?;
        if !status.wel() {
            warn!("EF WEL not set, status {:02x}", u8::from(status));
            return Err(StorageError::WriteEnableFailed);
        }
        Ok(())
    }

    /// Polls the status register until the chip is idle, at most `timeout`.
    fn wait_ready(&mut self, timeout: Microseconds<u32>) -> Result<()> {
        let polls = timeout.0 / POLL_INTERVAL.0;
        for _ in 0..=polls {
            if !self.read_status()?.busy() {
                return Ok(());
            }
            self.delay.delay_us(POLL_INTERVAL.0);
        }
        Err(StorageError::Timeout)
    }

    fn read_raw(&mut self, physical: u32, buf: &mut [u8]) -> Result<()> {
        let header = Self::addressed(opcode::READ, physical);
        self.transaction(&header, DataPhase::Read(buf))
    }

    fn program_page(&mut self, physical: u32, data: &[u8]) -> Result<()> {
        self.write_enable()?;
        let header = Self::addressed(opcode::PAGE_PROGRAM, physical);
        self.transaction(&header, DataPhase::Write(data))?;
        self.wait_ready(PAGE_PROGRAM_TIMEOUT).map_err(|e| match e {
            StorageError::Timeout => {
                error!("EF program timeout at {:x}", physical);
                StorageError::WriteFailed
            }
            other => other,
        })?;
        self.verify(physical, data)
    }

    /// Reads a programmed range back. Programming only clears bits, so a
    /// target that was not erased reads back as something else.
    fn verify(&mut self, physical: u32, data: &[u8]) -> Result<()> {
        let mut page = [0u8; PAGE_SIZE as usize];
        let back = &mut page[..data.len()];
        self.read_raw(physical, back)?;
        if back != data {
            warn!("EF verify failed at {:x}", physical);
            return Err(StorageError::WriteFailed);
        }
        Ok(())
    }

    fn read_wear(&mut self, sector: u32) -> Result<u32> {
        let mut trailer = [0u8; WEAR_RECORD_SIZE as usize];
        let address = self.sector_base(sector) + DATA_PER_SECTOR;
        self.read_raw(address, &mut trailer)?;
        match WearRecord::decode(&trailer) {
            Some(record) => Ok(record.erase_count),
            None => {
                debug!("EF sector {} has no wear record", sector);
                Ok(0)
            }
        }
    }

    fn erase_sector(&mut self, sector: u32) -> Result<()> {
        let base = self.sector_base(sector);
        let previous = self.read_wear(sector)?;
        trace!("EFe sector {} at {:x}, {} cycles", sector, base, previous);

        self.write_enable()?;
        let header = Self::addressed(opcode::SECTOR_ERASE, base);
        self.transaction(&header, DataPhase::None)?;
        self.wait_ready(SECTOR_ERASE_TIMEOUT).map_err(|e| match e {
            StorageError::Timeout => {
                error!("EF erase timeout at {:x}", base);
                StorageError::EraseFailed
            }
            other => other,
        })?;

        let record = WearRecord::new(previous.saturating_add(1));
        self.program_page(base + DATA_PER_SECTOR, &record.encode())?;
        self.max_erase_count = self.max_erase_count.max(record.erase_count);
        Ok(())
    }

    fn probe(&mut self) -> Result<&'static FlashProperties> {
        let jedec = self.read_jedec()?;
        info!("EF JEDEC {}", delog::hex_str!(&jedec));
        let props = match lookup(jedec) {
            Some(props) => props,
            None => {
                error!("EF unknown chip {}", delog::hex_str!(&jedec));
                return Err(StorageError::NotInitialized);
            }
        };
        self.config.validate(props.size)?;

        let mut max_erase_count = 0;
        for sector in 0..self.config.sectors() {
            max_erase_count = max_erase_count.max(self.read_wear(sector)?);
        }
        self.max_erase_count = max_erase_count;
        Ok(props)
    }

    /// Erase cycles recorded for an owned sector, 0 without a valid record.
    pub fn erase_count(&mut self, sector: u32) -> Result<u32> {
        self.ensure_ready()?;
        if sector >= self.config.sectors() {
            return Err(StorageError::InvalidAddress);
        }
        let result = self.read_wear(sector);
        self.tally(result)
    }

    /// Erases every owned sector.
    pub fn erase_all(&mut self) -> Result<()> {
        let capacity = self.capacity();
        self.erase(0, capacity)
    }

    fn program(&mut self, address: u32, data: &[u8]) -> Result<()> {
        let mut done = 0;
        while done < data.len() {
            let logical = address + done as u32;
            let physical = self.physical(logical);
            let sector_left = DATA_PER_SECTOR - logical % DATA_PER_SECTOR;
            let page_left = PAGE_SIZE - physical % PAGE_SIZE;
            let len = min(min(sector_left, page_left) as usize, data.len() - done);
            self.program_page(physical, &data[done..done + len])?;
            done += len;
        }
        Ok(())
    }

    fn fetch(&mut self, address: u32, buf: &mut [u8]) -> Result<()> {
        let mut done = 0;
        while done < buf.len() {
            let logical = address + done as u32;
            let sector_left = DATA_PER_SECTOR - logical % DATA_PER_SECTOR;
            let len = min(sector_left as usize, buf.len() - done);
            let physical = self.physical(logical);
            self.read_raw(physical, &mut buf[done..done + len])?;
            done += len;
        }
        Ok(())
    }
}

impl<SPI, CS, D, E> StorageDevice for FlashStorageDevice<SPI, CS, D>
where
    SPI: Transfer<u8, Error = E> + SpiWrite<u8, Error = E>,
    CS: OutputPin,
    D: DelayUs<u32>,
{
    fn init(&mut self) -> Result<()> {
        self.identity = None;
        let result = self.probe();
        let props = self.tally(result)?;
        self.identity = Some(props);
        info!(
            "EF ready: {} {:x}+{:x} @ {} Hz, max erase count {}",
            props.name,
            self.config.base_address,
            self.config.region_size,
            self.config.clock.0,
            self.max_erase_count
        );
        Ok(())
    }

    fn read(&mut self, address: u32, buf: &mut [u8]) -> Result<()> {
        check_transfer(address, buf.len(), self.capacity())?;
        self.ensure_ready()?;
        trace!("EFr {:x} {:x}", address, buf.len());
        let result = self.fetch(address, buf);
        self.tally(result)
    }

    fn write(&mut self, address: u32, data: &[u8]) -> Result<()> {
        check_transfer(address, data.len(), self.capacity())?;
        self.ensure_ready()?;
        trace!("EFw {:x} {:x}", address, data.len());
        let result = self.program(address, data);
        self.tally(result)?;
        self.write_count = self.write_count.wrapping_add(1);
        Ok(())
    }

    fn erase(&mut self, address: u32, len: u32) -> Result<()> {
        check_span(address, len, self.capacity())?;
        self.ensure_ready()?;
        let first = address / DATA_PER_SECTOR;
        let last = (address + len - 1) / DATA_PER_SECTOR;
        for sector in first..=last {
            let result = self.erase_sector(sector);
            self.tally(result)?;
        }
        Ok(())
    }

    fn capacity(&self) -> u32 {
        self.config.sectors() * DATA_PER_SECTOR
    }

    fn is_ready(&self) -> bool {
        self.identity.is_some()
    }

    fn health(&self) -> StorageHealth {
        let initialized = self.identity.is_some();
        let worn = min(
            self.max_erase_count as u64 * 100 / self.config.endurance.max(1) as u64,
            100,
        ) as u8;
        let health_percent = if initialized { 100 - worn } else { 0 };
        StorageHealth {
            initialized,
            healthy: initialized && health_percent > 0,
            degraded: self.error_count > 0 || worn >= 90,
            error_count: self.error_count,
            write_count: self.write_count,
            health_percent,
        }
    }
}
