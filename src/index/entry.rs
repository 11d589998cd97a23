//! Hash entry and bucket record definitions
//!
//! A `HashEntry` is 12 bytes with 2-byte alignment:
//! ```text
//! ┌───────────────────────────┬───────────┬──────────────┬──────────┐
//! │ flags(4) | blocks(12)  u16 │ synd u16  │ address u48  │ cntr u16 │
//! └───────────────────────────┴───────────┴──────────────┴──────────┘
//! ```

use super::ENTRIES_PER_BUCKET;

const USED: u16 = 1 << 0;
const DELETED: u16 = 1 << 1;
const REFERENCED: u16 = 1 << 2;
const RESERVED: u16 = 1 << 3;
const BLOCKS_SHIFT: u16 = 4;
const BLOCKS_MASK: u16 = 0xFFF;

/// Largest block address an entry can hold
pub const MAX_ADDRESS: u64 = (1 << 48) - 1;

/// 16-bit discriminator kept inline in every entry
pub fn syndrome_fragment(syndrome: u64) -> u16 {
    (syndrome >> 48) as u16
}

/// One slot of a bucket record
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HashEntry {
    header: u16,
    syndrome: u16,
    address: [u16; 3],
    cntr_id: u16,
}

impl HashEntry {
    /// A used entry for an object located by its full syndrome
    pub fn new(syndrome: u64, address: u64, blocks: u16, cntr_id: u16) -> Self {
        Self::from_fragment(syndrome_fragment(syndrome), address, blocks, cntr_id)
    }

    /// A used entry when only the stored fragment is known (recovery)
    pub fn from_fragment(fragment: u16, address: u64, blocks: u16, cntr_id: u16) -> Self {
        debug_assert!(address <= MAX_ADDRESS);
        let mut entry = Self {
            header: USED,
            syndrome: fragment,
            address: [0; 3],
            cntr_id,
        };
        entry.set_blocks(blocks);
        entry.set_address(address);
        entry
    }

    pub fn is_used(&self) -> bool {
        self.header & USED != 0
    }

    pub fn is_deleted(&self) -> bool {
        self.header & DELETED != 0
    }

    pub fn is_referenced(&self) -> bool {
        self.header & REFERENCED != 0
    }

    pub fn is_reserved(&self) -> bool {
        self.header & RESERVED != 0
    }

    pub fn set_deleted(&mut self, on: bool) {
        self.set_flag(DELETED, on);
    }

    pub fn set_referenced(&mut self, on: bool) {
        self.set_flag(REFERENCED, on);
    }

    pub fn set_reserved(&mut self, on: bool) {
        self.set_flag(RESERVED, on);
    }

    fn set_flag(&mut self, flag: u16, on: bool) {
        if on {
            self.header |= flag;
        } else {
            self.header &= !flag;
        }
    }

    /// Device blocks occupied by the object
    pub fn blocks(&self) -> u16 {
        (self.header >> BLOCKS_SHIFT) & BLOCKS_MASK
    }

    pub fn set_blocks(&mut self, blocks: u16) {
        debug_assert!(blocks <= BLOCKS_MASK);
        self.header = (self.header & !(BLOCKS_MASK << BLOCKS_SHIFT))
            | ((blocks & BLOCKS_MASK) << BLOCKS_SHIFT);
    }

    pub fn syndrome(&self) -> u16 {
        self.syndrome
    }

    pub fn address(&self) -> u64 {
        u64::from(self.address[0])
            | u64::from(self.address[1]) << 16
            | u64::from(self.address[2]) << 32
    }

    pub fn set_address(&mut self, address: u64) {
        self.address = [address as u16, (address >> 16) as u16, (address >> 32) as u16];
    }

    pub fn cntr_id(&self) -> u16 {
        self.cntr_id
    }

    /// Reset to the unused state
    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

/// Fixed-size bucket record: a slot array plus the overflow link
#[derive(Debug, Clone, Copy, Default)]
pub struct BucketEntry {
    pub entries: [HashEntry; ENTRIES_PER_BUCKET],
    /// Next bucket in the chain (array index + 1, 0 = end)
    pub next: u32,
}

impl BucketEntry {
    /// Number of used slots
    pub fn used(&self) -> usize {
        self.entries.iter().filter(|e| e.is_used()).count()
    }

    /// First unused slot, if any
    pub fn free_slot(&self) -> Option<usize> {
        self.entries.iter().position(|e| !e.is_used())
    }

    /// Last used slot, if any
    pub fn last_used(&self) -> Option<usize> {
        self.entries.iter().rposition(|e| e.is_used())
    }

    pub fn is_empty(&self) -> bool {
        self.entries.iter().all(|e| !e.is_used())
    }
}
