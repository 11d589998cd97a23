//! Log record definitions
//!
//! Defines the structure of individual log records.
//!
//! ```text
//! ┌──────────┬─────────────────────────────┬────────────┬──────────┬─────────┐
//! │ synd u16 │ raw:1 deleted:1 blocks:12   │ bucket u32 │ cntr u16 │ pad (6) │
//! ├──────────┴───────────┬─────────────────┴────┬───────┴──────────┴─────────┤
//! │ blk_offset u64       │ old_offset + 1 u64   │ seqno u64 │ target_seqno u64│
//! └──────────────────────┴──────────────────────┴───────────┴────────────────┘
//! ```

use bytes::{Buf, BufMut};

/// Size of one encoded record slot
pub const LOG_RECORD_SIZE: usize = 48;

const RAW_BIT: u16 = 1 << 15;
const DELETED_BIT: u16 = 1 << 14;
const BLOCKS_MASK: u16 = 0xFFF;

/// One object table mutation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LogRecord {
    /// Large object record; only touches the slab bitmap
    pub raw: bool,
    pub deleted: bool,
    /// Syndrome fragment
    pub syndrome: u16,
    pub blocks: u16,
    /// Hash slot of the object
    pub bucket: u32,
    pub cntr_id: u16,
    pub blk_offset: u64,
    /// Previous location of a relocated object
    pub old_offset: Option<u64>,
    pub seqno: u64,
    /// Deletes only clear slots written at or before this sequence number
    pub target_seqno: u64,
}

impl LogRecord {
    /// Object stored at `blk_offset`
    pub fn create(
        syndrome: u16,
        blocks: u16,
        bucket: u32,
        cntr_id: u16,
        blk_offset: u64,
        seqno: u64,
    ) -> Self {
        Self {
            syndrome,
            blocks,
            bucket,
            cntr_id,
            blk_offset,
            seqno,
            ..Default::default()
        }
    }

    /// Object moved from `old_offset` to `blk_offset`
    pub fn relocate(mut self, old_offset: u64) -> Self {
        self.old_offset = Some(old_offset);
        self.target_seqno = self.seqno;
        self
    }

    /// Object at `blk_offset` removed
    pub fn delete(
        syndrome: u16,
        blocks: u16,
        bucket: u32,
        cntr_id: u16,
        blk_offset: u64,
        seqno: u64,
    ) -> Self {
        Self {
            deleted: true,
            target_seqno: seqno,
            ..Self::create(syndrome, blocks, bucket, cntr_id, blk_offset, seqno)
        }
    }

    /// Raw object slot starting at `blk_offset` allocated or freed
    pub fn raw(blk_offset: u64, blocks: u16, freed: bool, seqno: u64) -> Self {
        Self {
            raw: true,
            deleted: freed,
            blocks,
            blk_offset,
            seqno,
            target_seqno: if freed { seqno } else { 0 },
            ..Default::default()
        }
    }

    pub fn encode(&self, buf: &mut impl BufMut) {
        let mut flags = self.blocks & BLOCKS_MASK;
        if self.raw {
            flags |= RAW_BIT;
        }
        if self.deleted {
            flags |= DELETED_BIT;
        }
        buf.put_u16_le(self.syndrome);
        buf.put_u16_le(flags);
        buf.put_u32_le(self.bucket);
        buf.put_u16_le(self.cntr_id);
        buf.put_bytes(0, 6);
        buf.put_u64_le(self.blk_offset);
        buf.put_u64_le(self.old_offset.map_or(0, |o| o + 1));
        buf.put_u64_le(self.seqno);
        buf.put_u64_le(self.target_seqno);
    }

    /// Decode one slot; `None` for an unused (all-zero) slot
    pub fn decode(slot: &[u8]) -> Option<Self> {
        debug_assert_eq!(slot.len(), LOG_RECORD_SIZE);
        if slot.iter().all(|&b| b == 0) {
            return None;
        }

        let mut buf = slot;
        let syndrome = buf.get_u16_le();
        let flags = buf.get_u16_le();
        let bucket = buf.get_u32_le();
        let cntr_id = buf.get_u16_le();
        buf.advance(6);
        let blk_offset = buf.get_u64_le();
        let old = buf.get_u64_le();

        Some(Self {
            raw: flags & RAW_BIT != 0,
            deleted: flags & DELETED_BIT != 0,
            syndrome,
            blocks: flags & BLOCKS_MASK,
            bucket,
            cntr_id,
            blk_offset,
            old_offset: old.checked_sub(1),
            seqno: buf.get_u64_le(),
            target_seqno: buf.get_u64_le(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_slot_layout() {
        let rec = LogRecord::create(0x1234, 2, 99, 7, 40, 5).relocate(0);
        let mut slot = Vec::with_capacity(LOG_RECORD_SIZE);
        rec.encode(&mut slot);

        assert_eq!(slot.len(), LOG_RECORD_SIZE);
        assert_eq!(&slot[2..4], &[2, 0]);
        // Relocation from block 0 is stored as 1
        assert_eq!(&slot[24..32], &1u64.to_le_bytes());
        assert_eq!(LogRecord::decode(&slot), Some(rec));
    }

    #[test]
    fn test_flag_bits() {
        let mut slot = Vec::new();
        LogRecord::raw(256, 128, true, 9).encode(&mut slot);
        assert_eq!(slot[3] & 0xC0, 0xC0);

        let decoded = LogRecord::decode(&slot).unwrap();
        assert!(decoded.raw && decoded.deleted);
        assert_eq!(decoded.blocks, 128);
        assert_eq!(decoded.old_offset, None);
    }

    #[test]
    fn test_zero_slot_is_unused() {
        assert_eq!(LogRecord::decode(&[0u8; LOG_RECORD_SIZE]), None);
    }
}
