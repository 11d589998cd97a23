//! Bucket arena
//!
//! Flat, preallocated array of bucket records. Records are handed out from
//! three places, and every record is in exactly one of them at any time:
//!
//! - a live chain (owned by the hash table),
//! - the free list of the stripe it was last released to,
//! - the global unallocated pool (`allocated..capacity`).
//!
//! Free lists are intrusive through `BucketEntry::next`. A bitset marks the
//! stripes whose free list is non-empty so that cross-stripe reuse does not
//! have to scan every stripe.

use super::entry::BucketEntry;
use crate::error::{Result, StormError};

/// Null bucket reference
pub const NULL_BUCKET: u32 = 0;

/// Arena of bucket records with per-stripe free lists
pub struct BucketArena {
    buckets: Vec<BucketEntry>,
    /// Records drawn from the global pool so far
    allocated: usize,
    /// Head of each stripe's free list
    stripe_free: Vec<u32>,
    /// Length of each stripe's free list
    stripe_free_len: Vec<u32>,
    /// One bit per stripe with a non-empty free list
    free_stripes: Vec<u64>,
}

impl BucketArena {
    /// Allocate an arena of `capacity` records for `stripes` lock stripes
    pub fn new(capacity: usize, stripes: usize) -> Result<Self> {
        if capacity >= u32::MAX as usize {
            return Err(StormError::OutOfMemory(format!(
                "{} bucket records exceed the 32-bit index space",
                capacity
            )));
        }

        let buckets = zeroed_vec(capacity, "bucket arena")?;
        let stripe_free = zeroed_vec(stripes, "stripe free lists")?;
        let stripe_free_len = zeroed_vec(stripes, "stripe free counts")?;
        let free_stripes = zeroed_vec(stripes.div_ceil(64), "stripe free bitmap")?;

        Ok(Self {
            buckets,
            allocated: 0,
            stripe_free,
            stripe_free_len,
            free_stripes,
        })
    }

    pub fn capacity(&self) -> usize {
        self.buckets.len()
    }

    /// Records ever taken from the global pool
    pub fn allocated(&self) -> usize {
        self.allocated
    }

    /// Records sitting on any stripe free list
    pub fn free_listed(&self) -> usize {
        self.stripe_free_len.iter().map(|&n| n as usize).sum()
    }

    /// Records on one stripe's free list
    pub fn stripe_free_len(&self, stripe: usize) -> usize {
        self.stripe_free_len[stripe] as usize
    }

    pub fn stripe_has_free(&self, stripe: usize) -> bool {
        self.free_stripes[stripe / 64] & (1 << (stripe % 64)) != 0
    }

    pub fn bucket(&self, idx: u32) -> &BucketEntry {
        &self.buckets[idx as usize - 1]
    }

    pub fn bucket_mut(&mut self, idx: u32) -> &mut BucketEntry {
        &mut self.buckets[idx as usize - 1]
    }

    /// Take a record from a stripe's own free list
    pub fn alloc_from_stripe(&mut self, stripe: usize) -> Option<u32> {
        let idx = self.stripe_free[stripe];
        if idx == NULL_BUCKET {
            return None;
        }

        let bucket = self.bucket_mut(idx);
        let next = bucket.next;
        *bucket = BucketEntry::default();

        self.stripe_free[stripe] = next;
        self.stripe_free_len[stripe] -= 1;
        if next == NULL_BUCKET {
            self.free_stripes[stripe / 64] &= !(1 << (stripe % 64));
        }
        Some(idx)
    }

    /// Take a never-used record from the global pool
    pub fn alloc_fresh(&mut self) -> Option<u32> {
        if self.allocated == self.buckets.len() {
            return None;
        }
        self.allocated += 1;
        Some(self.allocated as u32)
    }

    /// Take a record from the first other stripe (in index order) that has one
    pub fn steal(&mut self, except: usize) -> Option<(u32, usize)> {
        let stripe = self.first_free_stripe(except)?;
        self.alloc_from_stripe(stripe).map(|idx| (idx, stripe))
    }

    fn first_free_stripe(&self, except: usize) -> Option<usize> {
        for (w, &word) in self.free_stripes.iter().enumerate() {
            let mut bits = word;
            while bits != 0 {
                let stripe = w * 64 + bits.trailing_zeros() as usize;
                bits &= bits - 1;
                if stripe != except {
                    return Some(stripe);
                }
            }
        }
        None
    }

    /// Return an unlinked record to a stripe's free list
    pub fn release(&mut self, stripe: usize, idx: u32) {
        let head = self.stripe_free[stripe];
        let bucket = self.bucket_mut(idx);
        *bucket = BucketEntry::default();
        bucket.next = head;

        self.stripe_free[stripe] = idx;
        self.stripe_free_len[stripe] += 1;
        self.free_stripes[stripe / 64] |= 1 << (stripe % 64);
    }

    /// Walk one stripe's free list (for audits)
    pub fn free_list(&self, stripe: usize) -> FreeListIter<'_> {
        FreeListIter {
            arena: self,
            next: self.stripe_free[stripe],
        }
    }

    pub fn stripes(&self) -> usize {
        self.stripe_free.len()
    }
}

/// Iterator over the record indices on one free list
pub struct FreeListIter<'a> {
    arena: &'a BucketArena,
    next: u32,
}

impl Iterator for FreeListIter<'_> {
    type Item = u32;

    fn next(&mut self) -> Option<u32> {
        if self.next == NULL_BUCKET {
            return None;
        }
        let idx = self.next;
        self.next = self.arena.bucket(idx).next;
        Some(idx)
    }
}

/// Allocate a zero-initialized vector, reporting failure instead of aborting
pub(crate) fn zeroed_vec<T: Default + Clone>(len: usize, what: &str) -> Result<Vec<T>> {
    let mut v = Vec::new();
    v.try_reserve_exact(len).map_err(|e| {
        tracing::error!(len, what, "allocation failed: {}", e);
        StormError::OutOfMemory(format!("{} ({} elements): {}", what, len, e))
    })?;
    v.resize(len, T::default());
    Ok(v)
}
