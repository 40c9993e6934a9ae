use storage_device::{crc::crc16, Result, StorageError};

pub const HEADER_MAGIC: u32 = 0x434c_4f47;
/// Encoded header length.
pub const HEADER_LEN: usize = 18;
/// Stride between the two header slots; entries start after both.
pub const HEADER_SLOT_SIZE: u32 = 32;

const CRC_OFFSET: usize = HEADER_LEN - 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Slot {
    A,
    B,
}

impl Slot {
    pub const fn other(self) -> Self {
        match self {
            Slot::A => Slot::B,
            Slot::B => Slot::A,
        }
    }

    /// Offset of the slot from the log's base address.
    pub const fn offset(self) -> u32 {
        match self {
            Slot::A => 0,
            Slot::B => HEADER_SLOT_SIZE,
        }
    }
}

/// Whether sequence `a` was committed after `b`, modulo 2^16.
pub fn is_seq_newer(a: u16, b: u16) -> bool {
    let distance = a.wrapping_sub(b);
    distance != 0 && distance < 0x8000
}

/// Ring state as persisted in a header slot.
///
/// Layout, big endian: magic (4), entry size (2), max entries (2), head (2),
/// tail (2), count (2), sequence (2), CRC16 over everything before it (2).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LogHeader {
    pub entry_size: u16,
    pub max_entries: u16,
    /// Next slot to write.
    pub head: u16,
    /// Oldest entry.
    pub tail: u16,
    pub count: u16,
    pub sequence: u16,
}

impl LogHeader {
    pub const fn empty(entry_size: u16, max_entries: u16, sequence: u16) -> Self {
        Self {
            entry_size,
            max_entries,
            head: 0,
            tail: 0,
            count: 0,
            sequence,
        }
    }

    pub const fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub const fn is_full(&self) -> bool {
        self.count == self.max_entries
    }

    fn step(&self, index: u16) -> u16 {
        ((index as u32 + 1) % self.max_entries as u32) as u16
    }

    /// Ring index of the `i`-th oldest entry.
    pub fn nth(&self, i: u16) -> u16 {
        ((self.tail as u32 + i as u32) % self.max_entries as u32) as u16
    }

    /// State after appending at `head`. The caller evicts first when full.
    pub fn pushed(&self) -> Self {
        Self {
            head: self.step(self.head),
            count: self.count + 1,
            ..*self
        }
    }

    /// State after dropping the oldest entry.
    pub fn popped(&self) -> Self {
        Self {
            tail: self.step(self.tail),
            count: self.count - 1,
            ..*self
        }
    }

    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut bytes = [0u8; HEADER_LEN];
        bytes[..4].copy_from_slice(&HEADER_MAGIC.to_be_bytes());
        let fields = [
            self.entry_size,
            self.max_entries,
            self.head,
            self.tail,
            self.count,
            self.sequence,
        ];
        for (chunk, field) in bytes[4..CRC_OFFSET].chunks_exact_mut(2).zip(fields) {
            chunk.copy_from_slice(&field.to_be_bytes());
        }
        let crc = crc16(&bytes[..CRC_OFFSET]);
        bytes[CRC_OFFSET..].copy_from_slice(&crc.to_be_bytes());
        bytes
    }

    /// Rejects slots with a bad magic or CRC, and slots whose ring state is
    /// inconsistent.
    pub fn decode(bytes: &[u8; HEADER_LEN]) -> Result<Self> {
        let field = |at: usize| u16::from_be_bytes([bytes[at], bytes[at + 1]]);
        let magic = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        if magic != HEADER_MAGIC || field(CRC_OFFSET) != crc16(&bytes[..CRC_OFFSET]) {
            return Err(StorageError::HeaderCorrupted);
        }
        let header = Self {
            entry_size: field(4),
            max_entries: field(6),
            head: field(8),
            tail: field(10),
            count: field(12),
            sequence: field(14),
        };
        let max = header.max_entries as u32;
        if max == 0
            || header.head as u32 >= max
            || header.tail as u32 >= max
            || header.count as u32 > max
            || (header.tail as u32 + header.count as u32) % max != header.head as u32
        {
            return Err(StorageError::HeaderCorrupted);
        }
        Ok(header)
    }
}
