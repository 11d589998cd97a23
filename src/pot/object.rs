//! POT element definitions
//!
//! ```text
//! ┌──────────┬──────────────────────────┬────────────┬──────────┬────────────┐
//! │ synd u16 │ deleted:1 | blocks:12 u16│ bucket u32 │ cntr u16 │ seqno u48  │
//! └──────────┴──────────────────────────┴────────────┴──────────┴────────────┘
//! ```
//! All fields little-endian, 16 bytes per element.

use bytes::{Buf, BufMut};

use super::POT_ELEMENT_SIZE;

const DELETED_BIT: u16 = 1 << 15;
const BLOCKS_MASK: u16 = 0xFFF;

/// Largest sequence number a POT element can store
pub const MAX_SEQNO: u64 = (1 << 48) - 1;

/// Persistent record of the object stored at one data block
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlashObject {
    /// Syndrome fragment
    pub syndrome: u16,
    pub deleted: bool,
    pub blocks: u16,
    /// Hash slot the object was indexed under
    pub bucket: u32,
    pub cntr_id: u16,
    pub seqno: u64,
}

impl FlashObject {
    /// Whether the slot describes a live object
    pub fn is_occupied(&self) -> bool {
        self.blocks > 0 && !self.deleted
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }

    pub fn encode(&self, buf: &mut impl BufMut) {
        let flags = (self.blocks & BLOCKS_MASK) | if self.deleted { DELETED_BIT } else { 0 };
        buf.put_u16_le(self.syndrome);
        buf.put_u16_le(flags);
        buf.put_u32_le(self.bucket);
        buf.put_u16_le(self.cntr_id);
        buf.put_uint_le(self.seqno & MAX_SEQNO, 6);
    }

    /// Decode one element; `buf` must hold at least `POT_ELEMENT_SIZE` bytes
    pub fn decode(buf: &mut impl Buf) -> Self {
        debug_assert!(buf.remaining() >= POT_ELEMENT_SIZE);
        let syndrome = buf.get_u16_le();
        let flags = buf.get_u16_le();
        Self {
            syndrome,
            deleted: flags & DELETED_BIT != 0,
            blocks: flags & BLOCKS_MASK,
            bucket: buf.get_u32_le(),
            cntr_id: buf.get_u16_le(),
            seqno: buf.get_uint_le(6),
        }
    }
}

/// Encode a page of elements into a byte buffer of the same length
pub(crate) fn encode_page(elements: &[FlashObject], out: &mut [u8]) {
    let mut buf = out;
    for e in elements {
        e.encode(&mut buf);
    }
}

/// Decode a byte buffer into a page of elements
pub(crate) fn decode_page(bytes: &[u8]) -> Box<[FlashObject]> {
    let mut buf = bytes;
    (0..bytes.len() / POT_ELEMENT_SIZE)
        .map(|_| FlashObject::decode(&mut buf))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_element_layout() {
        let obj = FlashObject {
            syndrome: 0xBEEF,
            deleted: false,
            blocks: 3,
            bucket: 0x0102_0304,
            cntr_id: 7,
            seqno: 0x0000_0A0B_0C0D_0E0F,
        };
        let mut out = [0u8; POT_ELEMENT_SIZE];
        encode_page(&[obj], &mut out);

        assert_eq!(&out[0..2], &[0xEF, 0xBE]);
        assert_eq!(&out[2..4], &[3, 0]);
        assert_eq!(&out[4..8], &[4, 3, 2, 1]);
        assert_eq!(&out[8..10], &[7, 0]);
        assert_eq!(&out[10..16], &[0x0F, 0x0E, 0x0D, 0x0C, 0x0B, 0x0A]);
        assert_eq!(decode_page(&out)[0], obj);
    }

    #[test]
    fn test_deleted_slot_is_not_occupied() {
        let mut obj = FlashObject {
            blocks: 1,
            ..Default::default()
        };
        assert!(obj.is_occupied());
        obj.deleted = true;
        assert!(!obj.is_occupied());

        let mut out = [0u8; POT_ELEMENT_SIZE];
        encode_page(&[obj], &mut out);
        assert_eq!(out[3] & 0x80, 0x80);
    }
}
