//! Per-segment slab-class occupancy
//!
//! Each segment serves one size class (the power of two covering the block
//! count of its first object). The class is released when the segment
//! empties.

/// Occupancy of one segment
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SegmentClass {
    /// Block count of the class (0 = unassigned)
    pub class_blocks: u16,
    pub objects: u32,
    pub blocks_used: u64,
}

/// Slab-class occupancy for every segment of a shard
#[derive(Debug, Clone)]
pub struct SegmentUsage {
    segment_blocks: u64,
    segments: Vec<SegmentClass>,
}

impl SegmentUsage {
    pub fn new(segments: u64, segment_blocks: u64) -> Self {
        Self {
            segment_blocks,
            segments: vec![SegmentClass::default(); segments as usize],
        }
    }

    fn slot(&mut self, address: u64) -> Option<&mut SegmentClass> {
        self.segments.get_mut((address / self.segment_blocks) as usize)
    }

    /// Account an object of `blocks` blocks stored at `address`
    pub fn record_insert(&mut self, address: u64, blocks: u16) {
        let Some(seg) = self.slot(address) else {
            tracing::warn!(address, "usage update outside the data area");
            return;
        };
        if seg.objects == 0 {
            seg.class_blocks = blocks.max(1).next_power_of_two();
        }
        seg.objects += 1;
        seg.blocks_used += u64::from(blocks);
    }

    /// Release an object of `blocks` blocks stored at `address`
    pub fn record_delete(&mut self, address: u64, blocks: u16) {
        let Some(seg) = self.slot(address) else {
            return;
        };
        seg.objects = seg.objects.saturating_sub(1);
        seg.blocks_used = seg.blocks_used.saturating_sub(u64::from(blocks));
        if seg.objects == 0 {
            *seg = SegmentClass::default();
        }
    }

    pub fn segment(&self, segment: u64) -> Option<&SegmentClass> {
        self.segments.get(segment as usize)
    }

    pub fn segments(&self) -> &[SegmentClass] {
        &self.segments
    }

    /// Objects accounted across all segments
    pub fn total_objects(&self) -> u64 {
        self.segments.iter().map(|s| u64::from(s.objects)).sum()
    }

    pub fn reset(&mut self) {
        self.segments.fill(SegmentClass::default());
    }
}
