use std::{
    cell::{Cell, RefCell},
    convert::Infallible,
    rc::Rc,
    vec::Vec,
};

use embedded_hal::{
    blocking::{
        delay::DelayUs,
        spi::{Transfer, Write},
    },
    digital::v2::OutputPin,
};
use embedded_time::rate::Hertz;
use quickcheck::TestResult;
use storage_device::{StorageDevice, StorageError};

use crate::{
    registers::opcode, FlashConfig, FlashStorageDevice, WearRecord, DATA_PER_SECTOR,
    PAGE_PROGRAM_TIMEOUT, POLL_INTERVAL, SECTOR_ERASE_TIMEOUT, SECTOR_SIZE,
};

const GD25Q16: [u8; 3] = [0xc8, 0x40, 0x15];
const CHIP_SIZE: usize = 0x20_0000;

/// Behavioural model of a 25-series NOR chip: programming can only clear
/// bits, a page program wraps inside its page, erase sets a whole sector to
/// `0xff`, and both leave the chip busy for `busy_cycles` status reads.
struct Chip {
    memory: Vec<u8>,
    jedec: [u8; 3],
    wel: bool,
    busy_polls: u32,
    busy_cycles: u32,
    stuck_busy: bool,
    ignore_wren: bool,
    selected: bool,
    rx: Vec<u8>,
    programs: Vec<(usize, usize)>,
    erases: Vec<usize>,
}

impl Chip {
    fn new() -> Self {
        Self {
            memory: vec![0xff; CHIP_SIZE],
            jedec: GD25Q16,
            wel: false,
            busy_polls: 0,
            busy_cycles: 1,
            stuck_busy: false,
            ignore_wren: false,
            selected: false,
            rx: Vec::new(),
            programs: Vec::new(),
            erases: Vec::new(),
        }
    }

    fn address(&self) -> usize {
        ((self.rx[1] as usize) << 16) | ((self.rx[2] as usize) << 8) | self.rx[3] as usize
    }

    fn busy(&self) -> bool {
        self.stuck_busy || self.busy_polls > 0
    }

    fn select(&mut self) {
        self.selected = true;
        self.rx.clear();
    }

    fn deselect(&mut self) {
        self.selected = false;
        let op = match self.rx.first() {
            Some(&op) => op,
            None => return,
        };
        match op {
            opcode::WREN if !self.ignore_wren => self.wel = true,
            opcode::PAGE_PROGRAM if self.rx.len() > 4 && self.wel => {
                let start = self.address();
                let page = start & !0xff;
                for (i, byte) in self.rx[4..].iter().enumerate() {
                    let address = page | ((start + i) & 0xff);
                    self.memory[address] &= byte;
                }
                self.programs.push((start, self.rx.len() - 4));
                self.wel = false;
                self.busy_polls = self.busy_cycles;
            }
            opcode::SECTOR_ERASE if self.rx.len() == 4 && self.wel => {
                let sector = self.address() & !(SECTOR_SIZE as usize - 1);
                self.memory[sector..sector + SECTOR_SIZE as usize].fill(0xff);
                self.erases.push(sector);
                self.wel = false;
                self.busy_polls = self.busy_cycles;
            }
            _ => {}
        }
    }

    fn clock(&mut self, byte: u8) -> u8 {
        assert!(self.selected, "clocked without chip select");
        let index = self.rx.len();
        self.rx.push(byte);
        let op = self.rx[0];
        match op {
            opcode::RDID if index > 0 => self.jedec.get(index - 1).copied().unwrap_or(0),
            opcode::RDSR if index > 0 => {
                let status = self.busy() as u8 | (self.wel as u8) << 1;
                self.busy_polls = self.busy_polls.saturating_sub(1);
                status
            }
            opcode::READ if index > 3 => {
                let address = (self.address() + index - 4) % self.memory.len();
                self.memory[address]
            }
            _ => 0,
        }
    }
}

#[derive(Debug)]
struct BusFault;

struct SimBus(Rc<RefCell<Chip>>);

impl Write<u8> for SimBus {
    type Error = BusFault;

    fn write(&mut self, words: &[u8]) -> Result<(), BusFault> {
        let mut chip = self.0.borrow_mut();
        for &word in words {
            chip.clock(word);
        }
        Ok(())
    }
}

impl Transfer<u8> for SimBus {
    type Error = BusFault;

    fn transfer<'w>(&mut self, words: &'w mut [u8]) -> Result<&'w [u8], BusFault> {
        let mut chip = self.0.borrow_mut();
        for word in words.iter_mut() {
            *word = chip.clock(*word);
        }
        Ok(words)
    }
}

struct SimCs(Rc<RefCell<Chip>>);

impl OutputPin for SimCs {
    type Error = Infallible;

    fn set_low(&mut self) -> Result<(), Infallible> {
        self.0.borrow_mut().select();
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Infallible> {
        self.0.borrow_mut().deselect();
        Ok(())
    }
}

#[derive(Clone, Default)]
struct SimDelay(Rc<Cell<u32>>);

impl DelayUs<u32> for SimDelay {
    fn delay_us(&mut self, us: u32) {
        self.0.set(self.0.get() + us);
    }
}

type Flash = FlashStorageDevice<SimBus, SimCs, SimDelay>;

const SECTORS: u32 = 4;

fn setup(chip: Chip, config: FlashConfig) -> (Flash, Rc<RefCell<Chip>>, SimDelay) {
    let chip = Rc::new(RefCell::new(chip));
    let delay = SimDelay::default();
    let flash = FlashStorageDevice::new(
        SimBus(chip.clone()),
        SimCs(chip.clone()),
        delay.clone(),
        config,
    );
    (flash, chip, delay)
}

fn ready() -> (Flash, Rc<RefCell<Chip>>, SimDelay) {
    let (mut flash, chip, delay) = setup(Chip::new(), FlashConfig::new(0, SECTORS));
    flash.init().unwrap();
    (flash, chip, delay)
}

fn trailer(sector: usize) -> usize {
    sector * SECTOR_SIZE as usize + DATA_PER_SECTOR as usize
}

#[test]
fn init_identifies_chip() {
    let (flash, _, _) = ready();
    assert_eq!(flash.identity().map(|p| p.name), Some("GD25Q16"));
    assert_eq!(flash.capacity(), SECTORS * DATA_PER_SECTOR);
    assert!(flash.is_ready());
    assert_eq!(flash.health().health_percent, 100);
}

#[test]
fn unknown_chip_is_refused() {
    let mut chip = Chip::new();
    chip.jedec = [0xef, 0x40, 0x17];
    let (mut flash, _, _) = setup(chip, FlashConfig::new(0, SECTORS));
    assert_eq!(flash.init(), Err(StorageError::NotInitialized));
    assert!(!flash.is_ready());
    assert_eq!(flash.identity(), None);
    assert_eq!(flash.read(0, &mut [0; 4]), Err(StorageError::NotInitialized));
    assert_eq!(flash.health().health_percent, 0);
}

#[test]
fn region_must_fit_chip() {
    let (mut flash, _, _) = setup(Chip::new(), FlashConfig::new(0x1f_f000, 2));
    assert_eq!(flash.init(), Err(StorageError::InvalidConfig));

    let (mut flash, _, _) = setup(Chip::new(), FlashConfig::new(0x100, 1));
    assert_eq!(flash.init(), Err(StorageError::InvalidConfig));

    let (mut flash, _, _) = setup(Chip::new(), FlashConfig::new(0x1f_f000, 1));
    assert_eq!(flash.init(), Ok(()));
}

#[test]
fn clock_is_bounded() {
    let config = FlashConfig::default().with_clock(Hertz(80_000_000));
    assert_eq!(config.clock, FlashConfig::MAX_CLOCK);
}

#[test]
fn write_is_split_at_page_boundaries() {
    let (mut flash, chip, _) = ready();
    flash.erase_all().unwrap();
    chip.borrow_mut().programs.clear();

    flash.write(250, &[0xaa; 20]).unwrap();
    assert_eq!(chip.borrow().programs, vec![(250, 6), (256, 14)]);
    assert_eq!(&chip.borrow().memory[250..270], &[0xaa; 20]);
    assert_eq!(chip.borrow().memory[270], 0xff);
}

#[test]
fn logical_space_skips_wear_trailer() {
    let (mut flash, chip, _) = ready();
    flash.erase_all().unwrap();
    chip.borrow_mut().programs.clear();

    let data: Vec<u8> = (0..20).collect();
    flash.write(DATA_PER_SECTOR - 10, &data).unwrap();
    assert_eq!(chip.borrow().programs, vec![(4070, 10), (4096, 10)]);

    let mut record = [0; 16];
    record.copy_from_slice(&chip.borrow().memory[trailer(0)..trailer(0) + 16]);
    assert_eq!(WearRecord::decode(&record), Some(WearRecord::new(1)));

    let mut back = [0; 20];
    flash.read(DATA_PER_SECTOR - 10, &mut back).unwrap();
    assert_eq!(&back[..], &data[..]);
}

#[test]
fn erase_expands_to_whole_sectors() {
    let (mut flash, chip, _) = ready();
    flash.erase(100, 10).unwrap();
    assert_eq!(chip.borrow().erases, vec![0]);
    assert_eq!(flash.erase_count(0), Ok(1));
    assert_eq!(flash.erase_count(1), Ok(0));

    flash.erase(4000, 200).unwrap();
    assert_eq!(chip.borrow().erases, vec![0, 0, 4096]);
    assert_eq!(flash.erase_count(0), Ok(2));
    assert_eq!(flash.erase_count(1), Ok(1));
    assert_eq!(flash.max_erase_count(), 2);
    assert_eq!(flash.erase_count(SECTORS), Err(StorageError::InvalidAddress));
}

#[test]
fn rewrite_without_erase_is_write_failed() {
    let (mut flash, chip, _) = ready();
    flash.erase(0, 1).unwrap();
    assert_eq!(flash.write(0, &[0x0f]), Ok(()));
    assert_eq!(flash.write(0, &[0xf0]), Err(StorageError::WriteFailed));
    assert_eq!(chip.borrow().memory[0], 0x00);
    assert_eq!(flash.health().error_count, 1);
    assert_eq!(flash.health().write_count, 1);

    // clearing further bits of a programmed byte still verifies
    assert_eq!(flash.write(0, &[0x00]), Ok(()));
    flash.erase(0, 1).unwrap();
    assert_eq!(flash.write(0, &[0xf0]), Ok(()));
}

#[test]
fn erase_resets_data() {
    let (mut flash, _, _) = ready();
    flash.erase(0, 16).unwrap();
    flash.write(0, &[0x12; 16]).unwrap();
    flash.erase(0, 16).unwrap();
    let mut back = [0; 16];
    flash.read(0, &mut back).unwrap();
    assert_eq!(back, [0xff; 16]);
}

#[test]
fn init_recovers_wear_counts() {
    let mut chip = Chip::new();
    let at = trailer(2);
    chip.memory[at..at + 16].copy_from_slice(&WearRecord::new(50_000).encode());
    let (mut flash, _, _) = setup(chip, FlashConfig::new(0, SECTORS));
    flash.init().unwrap();
    assert_eq!(flash.max_erase_count(), 50_000);
    assert_eq!(flash.health().health_percent, 50);
    assert_eq!(flash.erase_count(2), Ok(50_000));
}

#[test]
fn corrupt_wear_record_counts_as_zero() {
    let mut chip = Chip::new();
    let at = trailer(0);
    let mut record = WearRecord::new(900).encode();
    record[5] ^= 0xff;
    chip.memory[at..at + 16].copy_from_slice(&record);
    let (mut flash, _, _) = setup(chip, FlashConfig::new(0, SECTORS));
    flash.init().unwrap();
    assert_eq!(flash.max_erase_count(), 0);

    flash.erase(0, 1).unwrap();
    assert_eq!(flash.erase_count(0), Ok(1));
}

#[test]
fn health_follows_endurance() {
    let config = FlashConfig::new(0, SECTORS).with_endurance(10);
    let (mut flash, _, _) = setup(Chip::new(), config);
    flash.init().unwrap();
    for _ in 0..5 {
        flash.erase(0, 1).unwrap();
    }
    assert_eq!(flash.health().health_percent, 50);
    assert!(flash.health().healthy);
    for _ in 0..5 {
        flash.erase(0, 1).unwrap();
    }
    assert_eq!(flash.health().health_percent, 0);
    assert!(!flash.health().healthy);
}

#[test]
fn busy_poll_waits_for_program() {
    let (mut flash, chip, delay) = ready();
    flash.erase(0, 1).unwrap();
    chip.borrow_mut().busy_cycles = 3;
    let before = delay.0.get();
    flash.write(0, &[1, 2, 3]).unwrap();
    assert_eq!(delay.0.get() - before, 3 * POLL_INTERVAL.0);
}

#[test]
fn program_timeout_is_write_failed() {
    let (mut flash, chip, delay) = ready();
    flash.erase(0, 1).unwrap();
    chip.borrow_mut().stuck_busy = true;
    let before = delay.0.get();
    assert_eq!(flash.write(0, &[1]), Err(StorageError::WriteFailed));
    let waited = delay.0.get() - before;
    assert!(waited >= PAGE_PROGRAM_TIMEOUT.0);
    assert!(waited <= PAGE_PROGRAM_TIMEOUT.0 + POLL_INTERVAL.0);
    assert!(flash.health().degraded);
}

#[test]
fn erase_timeout_is_erase_failed() {
    let (mut flash, chip, delay) = ready();
    chip.borrow_mut().stuck_busy = true;
    assert_eq!(flash.erase(0, 1), Err(StorageError::EraseFailed));
    assert!(delay.0.get() >= SECTOR_ERASE_TIMEOUT.0);
    assert_eq!(flash.health().error_count, 1);
}

#[test]
fn missing_write_enable_is_reported() {
    let (mut flash, chip, _) = ready();
    chip.borrow_mut().ignore_wren = true;
    assert_eq!(flash.write(0, &[1]), Err(StorageError::WriteEnableFailed));
    assert_eq!(flash.erase(0, 1), Err(StorageError::WriteEnableFailed));
    assert!(chip.borrow().programs.is_empty());
}

#[test]
fn request_validation() {
    let (mut flash, _, _) = ready();
    let capacity = flash.capacity();
    assert_eq!(flash.write(0, &[]), Err(StorageError::InvalidSize));
    assert_eq!(flash.read(capacity, &mut [0]), Err(StorageError::InvalidAddress));
    assert_eq!(flash.write(capacity - 1, &[0; 2]), Err(StorageError::AddressOverflow));
    assert_eq!(flash.erase(0, capacity + 1), Err(StorageError::AddressOverflow));
}

quickcheck::quickcheck! {
    fn round_trip(address: u16, data: Vec<u8>) -> TestResult {
        let capacity = SECTORS * DATA_PER_SECTOR;
        let address = address as u32 % capacity;
        if data.is_empty() || data.len() > 256 || address + data.len() as u32 > capacity {
            return TestResult::discard();
        }
        let (mut flash, chip, _) = ready();
        flash.erase_all().unwrap();
        flash.write(address, &data).unwrap();
        let mut back = vec![0; data.len()];
        flash.read(address, &mut back).unwrap();

        let trailers_intact = (0..SECTORS as usize).all(|sector| {
            let mut record = [0; 16];
            record.copy_from_slice(&chip.borrow().memory[trailer(sector)..trailer(sector) + 16]);
            WearRecord::decode(&record) == Some(WearRecord::new(1))
        });
        TestResult::from_bool(back == data && trailers_intact)
    }
}
