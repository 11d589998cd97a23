//! POT page cache
//!
//! Holds the POT pages of active segments in memory. A page is cached if and
//! only if its POT bitmap bit is set. Pages are faulted in zero-filled rather
//! than read, because a page that was never saved has no defined content on
//! flash.

use super::object::{decode_page, encode_page};
use super::{BitmapKind, FlashObject, PersistentBitmap, POT_ELEMENT_SIZE};
use crate::checksum;
use crate::device::BlockDevice;
use crate::error::{Result, StormError};
use crate::layout::{Region, ShardLayout};

/// In-memory cache of active POT pages
pub struct PotCache {
    region: Region,
    block_size: usize,
    page_blocks: u64,
    segment_blocks: u64,
    checksums: bool,
    bitmap: PersistentBitmap,
    pages: Vec<Option<Box<[FlashObject]>>>,
}

impl PotCache {
    /// Load the POT bitmap and every active page
    ///
    /// Without `lean_memory` every page becomes resident; pages that were
    /// never saved start out empty.
    pub fn load(
        device: &dyn BlockDevice,
        layout: &ShardLayout,
        lean_memory: bool,
        checksums: bool,
    ) -> Result<Self> {
        let bitmap = PersistentBitmap::load(
            device,
            layout.pot_bitmap,
            BitmapKind::Pot,
            layout.segments,
            layout.segments as usize,
            checksums,
        )?;

        let mut cache = Self {
            region: layout.pot,
            block_size: layout.block_size,
            page_blocks: layout.pot_page_blocks,
            segment_blocks: layout.segment_blocks,
            checksums,
            bitmap,
            pages: vec![None; layout.segments as usize],
        };

        let active: Vec<u64> = cache.bitmap.iter_ones().collect();
        for &page in &active {
            let loaded = cache.read_page(device, page)?;
            cache.pages[page as usize] = Some(loaded);
        }

        if !lean_memory {
            for page in 0..layout.segments {
                if cache.pages[page as usize].is_none() {
                    cache.install_empty(page);
                }
            }
        }

        tracing::debug!(
            loaded = active.len(),
            resident = cache.active_pages(),
            lean_memory,
            "POT cache loaded"
        );
        Ok(cache)
    }

    fn page_bytes(&self) -> usize {
        self.page_blocks as usize * self.block_size
    }

    fn read_page(&self, device: &dyn BlockDevice, page: u64) -> Result<Box<[FlashObject]>> {
        let mut raw = vec![0u8; self.page_bytes()];
        device.read_blocks(self.region.start + page * self.page_blocks, &mut raw)?;

        let stored = self.bitmap.trailer(page as usize);
        if self.checksums && stored != 0 {
            let computed = checksum::crc(&raw);
            if computed != stored {
                tracing::error!(page, stored, computed, "POT page checksum mismatch");
                return Err(StormError::Corruption(format!(
                    "POT page {} checksum mismatch: stored {:#010x}, computed {:#010x}",
                    page, stored, computed
                )));
            }
        }
        Ok(decode_page(&raw))
    }

    fn install_empty(&mut self, page: u64) {
        let elements = self.segment_blocks as usize;
        self.pages[page as usize] = Some(vec![FlashObject::default(); elements].into_boxed_slice());
        self.bitmap.set(page);
    }

    fn locate(&self, blk: u64) -> Result<(usize, usize)> {
        let page = blk / self.segment_blocks;
        if page >= self.pages.len() as u64 {
            return Err(StormError::AddressOutOfRange {
                address: blk,
                limit: self.pages.len() as u64 * self.segment_blocks,
            });
        }
        Ok((page as usize, (blk % self.segment_blocks) as usize))
    }

    /// POT slot of data block `blk`, faulting its page in if needed
    pub fn access(&mut self, blk: u64) -> Result<&mut FlashObject> {
        let (page, slot) = self.locate(blk)?;
        if self.pages[page].is_none() {
            tracing::trace!(page, "faulting in empty POT page");
            self.install_empty(page as u64);
        }
        match self.pages[page].as_deref_mut() {
            Some(elements) => Ok(&mut elements[slot]),
            None => Err(StormError::Corruption(format!("POT page {} vanished", page))),
        }
    }

    /// POT slot of data block `blk` if its page is cached
    pub fn get(&self, blk: u64) -> Option<&FlashObject> {
        let (page, slot) = self.locate(blk).ok()?;
        self.pages[page].as_deref().map(|elements| &elements[slot])
    }

    /// Elements of a cached page
    pub fn page(&self, page: u64) -> Option<&[FlashObject]> {
        self.pages.get(page as usize)?.as_deref()
    }

    /// Write every cached page, record its checksum, then save the bitmap
    pub fn save(&mut self, device: &dyn BlockDevice) -> Result<()> {
        let mut raw = vec![0u8; self.page_bytes()];
        let mut written = 0usize;

        for page in 0..self.pages.len() {
            let Some(elements) = self.pages[page].as_deref() else {
                continue;
            };
            raw.fill(0);
            encode_page(elements, &mut raw[..elements.len() * POT_ELEMENT_SIZE]);
            device
                .write_blocks(self.region.start + page as u64 * self.page_blocks, &raw)
                .map_err(|e| {
                    tracing::error!(page, "POT page write failed: {}", e);
                    e
                })?;
            self.bitmap.set_trailer(page, checksum::crc(&raw));
            written += 1;
        }

        self.bitmap.save(device)?;
        tracing::debug!(pages = written, "POT cache saved");
        Ok(())
    }

    /// Every occupied slot of every cached page, as (data block, element)
    pub fn occupied(&self) -> impl Iterator<Item = (u64, FlashObject)> + '_ {
        let seg = self.segment_blocks;
        self.bitmap.iter_ones().flat_map(move |page| {
            self.pages[page as usize]
                .iter()
                .flat_map(|elements| elements.iter().copied().enumerate())
                .filter(|(_, e)| e.is_occupied())
                .map(move |(slot, e)| (page * seg + slot as u64, e))
        })
    }

    pub fn bitmap(&self) -> &PersistentBitmap {
        &self.bitmap
    }

    pub fn active_pages(&self) -> usize {
        self.pages.iter().filter(|p| p.is_some()).count()
    }

    /// Whether bitmap bits and cached pages agree for every page
    pub fn check_invariant(&self) -> bool {
        self.pages
            .iter()
            .enumerate()
            .all(|(p, page)| self.bitmap.query(p as u64) == page.is_some())
    }
}
