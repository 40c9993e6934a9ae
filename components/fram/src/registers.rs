use bitfield::bitfield;

/// SPI opcodes of the MB85RS family.
pub mod opcode {
    pub const WREN: u8 = 0x06;
    pub const WRDI: u8 = 0x04;
    pub const RDSR: u8 = 0x05;
    pub const WRSR: u8 = 0x01;
    pub const READ: u8 = 0x03;
    pub const WRITE: u8 = 0x02;
    pub const RDID: u8 = 0x9f;
    pub const SLEEP: u8 = 0xb9;
}

/// JEDEC manufacturer code followed by the continuation code.
pub const MANUFACTURER_ID: [u8; 2] = [0x04, 0x7f];

const DENSITY_MASK: u8 = 0x1f;

bitfield! {
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct Status(u8);
    impl Debug;
    pub wpen, set_wpen: 7;
    pub u8, block_protect, set_block_protect: 3, 2;
    pub wel, _: 1;
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

impl Status {
    pub fn protection(&self) -> ProtectionLevel {
        ProtectionLevel::from_bits(self.block_protect())
    }
}

/// Write protection selected by the BP1:BP0 status bits.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ProtectionLevel {
    None = 0b00,
    UpperQuarter = 0b01,
    UpperHalf = 0b10,
    All = 0b11,
}

impl ProtectionLevel {
    pub const fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0b00 => Self::None,
            0b01 => Self::UpperQuarter,
            0b10 => Self::UpperHalf,
            _ => Self::All,
        }
    }

    pub const fn bits(self) -> u8 {
        self as u8
    }

    /// First protected chip address, `None` when nothing is protected.
    pub const fn protected_start(self, chip_size: u32) -> Option<u32> {
        match self {
            Self::None => None,
            Self::UpperQuarter => Some(chip_size - chip_size / 4),
            Self::UpperHalf => Some(chip_size / 2),
            Self::All => Some(0),
        }
    }

    /// Whether any byte of `[address, address + len)` is protected.
    pub fn covers(self, chip_size: u32, address: u32, len: u32) -> bool {
        match self.protected_start(chip_size) {
            None => false,
            Some(start) => address.saturating_add(len) > start,
        }
    }
}

/// Density code reported in the low bits of the first product ID byte.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Density {
    Kbit64 = 0x03,
    Kbit128 = 0x04,
    Kbit256 = 0x05,
    Kbit512 = 0x06,
    Mbit1 = 0x07,
    Mbit2 = 0x08,
}

impl Density {
    pub const fn from_product_id(product_id: u8) -> Option<Self> {
        match product_id & DENSITY_MASK {
            0x03 => Some(Self::Kbit64),
            0x04 => Some(Self::Kbit128),
            0x05 => Some(Self::Kbit256),
            0x06 => Some(Self::Kbit512),
            0x07 => Some(Self::Mbit1),
            0x08 => Some(Self::Mbit2),
            _ => None,
        }
    }

    /// Chip size in bytes.
    pub const fn size(self) -> u32 {
        match self {
            Self::Kbit64 => 8 * 1024,
            Self::Kbit128 => 16 * 1024,
            Self::Kbit256 => 32 * 1024,
            Self::Kbit512 => 64 * 1024,
            Self::Mbit1 => 128 * 1024,
            Self::Mbit2 => 256 * 1024,
        }
    }

    pub const fn address_bytes(self) -> usize {
        if self.size() > 64 * 1024 {
            3
        } else {
            2
        }
    }
}
