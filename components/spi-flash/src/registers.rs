use bitfield::bitfield;

/// Common 25-series SPI NOR opcodes.
pub mod opcode {
    pub const WREN: u8 = 0x06;
    pub const PAGE_PROGRAM: u8 = 0x02;
    pub const READ: u8 = 0x03;
    pub const SECTOR_ERASE: u8 = 0x20;
    pub const RDSR: u8 = 0x05;
    pub const RDID: u8 = 0x9f;
}

/// Largest span a single page program may cover.
pub const PAGE_SIZE: u32 = 256;
/// Smallest erasable unit.
pub const SECTOR_SIZE: u32 = 4096;

bitfield! {
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct Status(u8);
    impl Debug;
    pub busy, _: 0;
    pub wel, _: 1;
    pub u8, block_protect, _: 5, 2;
}

impl From<u8> for Status {
    fn from(value: u8) -> Self {
        Self(value)
    }
}

impl From<Status> for u8 {
    fn from(value: Status) -> u8 {
        value.0
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FlashProperties {
    pub name: &'static str,
    /// Manufacturer, memory type and capacity bytes returned by RDID.
    pub jedec: [u8; 3],
    pub size: u32,
}

/// Chips the driver accepts. Anything else is refused at `init`.
pub const SUPPORTED_FLASH: [FlashProperties; 5] = [
    FlashProperties {
        name: "W25Q16",
        jedec: [0xef, 0x40, 0x15],
        size: 0x20_0000,
    },
    FlashProperties {
        name: "W25Q32",
        jedec: [0xef, 0x40, 0x16],
        size: 0x40_0000,
    },
    FlashProperties {
        name: "W25Q128",
        jedec: [0xef, 0x40, 0x18],
        size: 0x100_0000,
    },
    FlashProperties {
        name: "GD25Q16",
        jedec: [0xc8, 0x40, 0x15],
        size: 0x20_0000,
    },
    FlashProperties {
        name: "MX25R6435F",
        jedec: [0xc2, 0x28, 0x17],
        size: 0x80_0000,
    },
];

pub fn lookup(jedec: [u8; 3]) -> Option<&'static FlashProperties> {
    SUPPORTED_FLASH.iter().find(|props| props.jedec == jedec)
}
