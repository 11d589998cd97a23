//! Hash table implementation
//!
//! Syndrome-addressed, bucket-chained index from keys to data blocks.
//!
//! ```text
//! hash_idx = syndrome % hash_size
//! group    = hash_idx / BUCKET_GROUP_SIZE
//!
//! heads[group] ─► [e0 e1 _ _] ─► [e0 e1 e2 e3] ─► [e0 e1 e2 e3] ─► 0
//!                  head bucket    full overflow buckets
//! ```
//!
//! Only the head bucket of a chain may have unused slots: inserts fill the
//! head (pushing a new head when it is full) and deletes outside the head
//! refill the hole from the head.
//!
//! The table performs no locking of its own. Callers serialize work on a
//! stripe through [`StripeLocks`] and [`HashTable::find_lock`].

use parking_lot::{Mutex, MutexGuard};

use super::arena::{zeroed_vec, BucketArena, NULL_BUCKET};
use super::entry::{syndrome_fragment, BucketEntry, HashEntry, MAX_ADDRESS};
use super::{BUCKET_GROUP_SIZE, ENTRIES_PER_BUCKET};
use crate::checksum::hashck;
use crate::config::{CacheMode, Config};
use crate::error::{Result, StormError};

// =============================================================================
// Geometry
// =============================================================================

/// Sizing inputs besides capacity and object limit
#[derive(Debug, Clone, Copy)]
pub struct IndexOptions {
    pub block_size: u64,
    pub segment_blocks: u64,
    pub lock_bucket_size: u64,
    pub max_lock_stripes: u64,
}

impl From<&Config> for IndexOptions {
    fn from(config: &Config) -> Self {
        Self {
            block_size: config.block_size as u64,
            segment_blocks: config.segment_blocks(),
            lock_bucket_size: config.lock_bucket_size,
            max_lock_stripes: config.max_lock_stripes,
        }
    }
}

/// Derived dimensions of a hash table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexGeometry {
    /// Hash slots (syndromes are reduced modulo this)
    pub hash_size: u64,
    /// Bucket groups (chains)
    pub num_groups: u64,
    /// Data blocks covered by the address table
    pub data_blocks: u64,
    /// Hash slots per lock stripe
    pub lock_bktsize: u64,
    pub num_stripes: u64,
    /// Bucket records in the arena
    pub arena_capacity: u64,
}

impl IndexGeometry {
    pub fn compute(total_size: u64, max_objects: u64, opts: &IndexOptions) -> Result<Self> {
        let seg = opts.segment_blocks;
        if seg == 0 || opts.block_size == 0 || !seg.is_power_of_two() || seg < BUCKET_GROUP_SIZE {
            return Err(StormError::Config(format!(
                "segment of {} blocks cannot host bucket groups",
                seg
            )));
        }

        let data_blocks = total_size / opts.block_size / seg * seg;
        if data_blocks == 0 {
            return Err(StormError::Config(format!(
                "capacity {} holds no complete segment",
                total_size
            )));
        }

        let mut hash_size = data_blocks;
        if max_objects > 0 && max_objects < hash_size {
            hash_size = max_objects.div_ceil(seg) * seg;
        }

        // Shrink the stripe to at most a segment, then grow it until the
        // stripe count fits the bound.
        let mut lock_bktsize = opts.lock_bucket_size.max(BUCKET_GROUP_SIZE);
        while lock_bktsize > seg && lock_bktsize / 2 >= BUCKET_GROUP_SIZE {
            lock_bktsize /= 2;
        }
        while hash_size.div_ceil(lock_bktsize) > opts.max_lock_stripes.max(1) {
            lock_bktsize *= 2;
        }
        let num_stripes = hash_size.div_ceil(lock_bktsize);

        let num_groups = hash_size / BUCKET_GROUP_SIZE;
        let arena_capacity = hash_size / ENTRIES_PER_BUCKET as u64 + num_groups;

        Ok(Self {
            hash_size,
            num_groups,
            data_blocks,
            lock_bktsize,
            num_stripes,
            arena_capacity,
        })
    }
}

// =============================================================================
// Locking Helpers
// =============================================================================

/// What to pick a stripe by
#[derive(Debug, Clone, Copy)]
pub enum LockKey {
    Syndrome(u64),
    Address(u64),
}

/// One mutex per lock stripe
pub struct StripeLocks {
    locks: Vec<Mutex<()>>,
}

impl StripeLocks {
    pub fn new(stripes: u64) -> Self {
        Self {
            locks: (0..stripes).map(|_| Mutex::new(())).collect(),
        }
    }

    /// Block until the stripe is ours
    pub fn lock(&self, stripe: usize) -> MutexGuard<'_, ()> {
        self.locks[stripe].lock()
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

// =============================================================================
// Key Verification
// =============================================================================

/// Resolves syndrome collisions by comparing the stored key
pub trait KeyVerifier {
    /// Whether the object described by `entry` was stored under `key`
    fn verify(&self, entry: &HashEntry, key: &[u8]) -> Result<bool>;
}

impl<F> KeyVerifier for F
where
    F: Fn(&HashEntry, &[u8]) -> Result<bool>,
{
    fn verify(&self, entry: &HashEntry, key: &[u8]) -> Result<bool> {
        self(entry, key)
    }
}

// =============================================================================
// Hash Table
// =============================================================================

/// Position of an entry: bucket record (index + 1) and slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryLoc {
    pub bucket: u32,
    pub slot: u8,
}

/// Result of [`HashTable::audit`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexAudit {
    pub entries: usize,
    pub chained_buckets: usize,
    pub free_listed_buckets: usize,
    pub pool_buckets: usize,
}

/// The in-memory object index of one shard
pub struct HashTable {
    geometry: IndexGeometry,
    mode: CacheMode,
    /// Chain head per bucket group (bucket index + 1, 0 = empty)
    heads: Vec<u32>,
    /// Owning bucket group per data block (group + 1, 0 = unowned)
    addr_table: Vec<u32>,
    arena: BucketArena,
    entries: usize,
}

impl HashTable {
    /// Size and allocate a table for `total_size` bytes of data area
    pub fn init(
        total_size: u64,
        max_objects: u64,
        mode: CacheMode,
        opts: &IndexOptions,
    ) -> Result<Self> {
        let geometry = IndexGeometry::compute(total_size, max_objects, opts)?;
        Self::with_geometry(geometry, mode)
    }

    /// Table sized from a shard config
    pub fn from_config(config: &Config) -> Result<Self> {
        Self::init(
            config.total_size,
            config.max_objects,
            config.mode,
            &IndexOptions::from(config),
        )
    }

    pub fn with_geometry(geometry: IndexGeometry, mode: CacheMode) -> Result<Self> {
        // Hash slots are logged and persisted as u32
        if geometry.hash_size > u32::MAX as u64 {
            return Err(StormError::Config(format!(
                "{} hash slots exceed the bucket field range",
                geometry.hash_size
            )));
        }

        let heads = zeroed_vec(geometry.num_groups as usize, "hash bucket heads")?;
        let addr_table = zeroed_vec(geometry.data_blocks as usize, "address table")?;
        let arena = BucketArena::new(
            geometry.arena_capacity as usize,
            geometry.num_stripes as usize,
        )?;

        tracing::debug!(
            hash_size = geometry.hash_size,
            groups = geometry.num_groups,
            stripes = geometry.num_stripes,
            lock_bktsize = geometry.lock_bktsize,
            arena = geometry.arena_capacity,
            "hash table initialized"
        );

        Ok(Self {
            geometry,
            mode,
            heads,
            addr_table,
            arena,
            entries: 0,
        })
    }

    // =========================================================================
    // Addressing
    // =========================================================================

    pub fn geometry(&self) -> &IndexGeometry {
        &self.geometry
    }

    pub fn mode(&self) -> CacheMode {
        self.mode
    }

    /// Container-scoped syndrome of a key
    pub fn syndrome(&self, key: &[u8], cntr_id: u16) -> u64 {
        hashck(key, 0).wrapping_add(u64::from(cntr_id).wrapping_mul(self.geometry.num_groups))
    }

    pub fn hash_index(&self, syndrome: u64) -> u64 {
        syndrome % self.geometry.hash_size
    }

    fn group_of(&self, hash_idx: u64) -> usize {
        (hash_idx / BUCKET_GROUP_SIZE) as usize
    }

    fn stripe_of_group(&self, group: usize) -> usize {
        (group as u64 * BUCKET_GROUP_SIZE / self.geometry.lock_bktsize) as usize
    }

    /// Stripe guarding a syndrome
    pub fn stripe_of(&self, syndrome: u64) -> usize {
        (self.hash_index(syndrome) / self.geometry.lock_bktsize) as usize
    }

    /// Stripe guarding a syndrome or an owned block address
    ///
    /// Returns `None` for an address no group currently owns.
    pub fn find_lock(&self, key: LockKey) -> Option<usize> {
        match key {
            LockKey::Syndrome(s) => Some(self.stripe_of(s)),
            LockKey::Address(a) => self.owner_of(a).map(|g| self.stripe_of_group(g)),
        }
    }

    /// Bucket group owning a data block
    pub fn owner_of(&self, address: u64) -> Option<usize> {
        match self.addr_table.get(address as usize) {
            Some(&g) if g != 0 => Some(g as usize - 1),
            _ => None,
        }
    }

    fn check_address(&self, address: u64) -> Result<()> {
        let limit = self.geometry.data_blocks.min(MAX_ADDRESS + 1);
        if address >= limit {
            return Err(StormError::AddressOutOfRange { address, limit });
        }
        Ok(())
    }

    // =========================================================================
    // Lookup
    // =========================================================================

    /// Find the entry for `key` in container `cntr_id`
    ///
    /// Cheap checks (used, container, fragment) run first; the verifier is
    /// only consulted on a fragment match.
    pub fn get(
        &self,
        key: &[u8],
        cntr_id: u16,
        verifier: &impl KeyVerifier,
    ) -> Result<Option<(EntryLoc, HashEntry)>> {
        if key.is_empty() {
            return Err(StormError::InvalidArgument("empty key".to_string()));
        }

        let syndrome = self.syndrome(key, cntr_id);
        let fragment = syndrome_fragment(syndrome);
        let group = self.group_of(self.hash_index(syndrome));

        let mut idx = self.heads[group];
        while idx != NULL_BUCKET {
            let bucket = self.arena.bucket(idx);
            for (slot, entry) in bucket.entries.iter().enumerate() {
                if !entry.is_used() || entry.cntr_id() != cntr_id || entry.syndrome() != fragment {
                    continue;
                }
                if verifier.verify(entry, key)? {
                    let loc = EntryLoc {
                        bucket: idx,
                        slot: slot as u8,
                    };
                    return Ok(Some((loc, *entry)));
                }
                tracing::trace!(syndrome, address = entry.address(), "syndrome collision");
            }
            idx = bucket.next;
        }

        Ok(None)
    }

    pub fn entry(&self, loc: EntryLoc) -> &HashEntry {
        &self.arena.bucket(loc.bucket).entries[loc.slot as usize]
    }

    pub fn entry_mut(&mut self, loc: EntryLoc) -> &mut HashEntry {
        &mut self.arena.bucket_mut(loc.bucket).entries[loc.slot as usize]
    }

    /// Set the referenced bit after a hit (slab mode only)
    pub fn mark_referenced(&mut self, loc: EntryLoc) {
        if self.mode == CacheMode::Slab {
            self.entry_mut(loc).set_referenced(true);
        }
    }

    /// Locate the used entry pointing at `address`
    pub fn find_by_address(&self, address: u64) -> Option<EntryLoc> {
        let group = self.owner_of(address)?;
        self.chain(group)
            .find(|(_, e)| e.is_used() && e.address() == address)
            .map(|(loc, _)| loc)
    }

    /// Every used entry of one group, head first
    fn chain(&self, group: usize) -> impl Iterator<Item = (EntryLoc, HashEntry)> + '_ {
        let mut idx = self.heads[group];
        std::iter::from_fn(move || {
            if idx == NULL_BUCKET {
                return None;
            }
            let current = idx;
            let bucket = self.arena.bucket(current);
            idx = bucket.next;
            Some((current, *bucket))
        })
        .flat_map(|(bucket, record)| {
            record
                .entries
                .into_iter()
                .enumerate()
                .map(move |(slot, e)| {
                    (
                        EntryLoc {
                            bucket,
                            slot: slot as u8,
                        },
                        e,
                    )
                })
        })
    }

    /// Every used entry in the table
    pub fn iter(&self) -> impl Iterator<Item = (EntryLoc, HashEntry)> + '_ {
        (0..self.heads.len())
            .flat_map(move |g| self.chain(g))
            .filter(|(_, e)| e.is_used())
    }

    // =========================================================================
    // Insert
    // =========================================================================

    /// Insert a new entry for `syndrome`
    ///
    /// Slot search order: free head slot, this stripe's free list, the global
    /// pool, any other stripe's free list.
    pub fn insert_by_key(&mut self, syndrome: u64, entry: HashEntry) -> Result<EntryLoc> {
        let hash_idx = self.hash_index(syndrome);
        self.insert_at(hash_idx, entry)
            .map_err(|e| self.log_exhaustion(e, syndrome))
    }

    /// Insert an entry whose hash slot is already known (POT rebuild)
    pub fn recovery_insert(&mut self, hash_idx: u64, entry: HashEntry) -> Result<EntryLoc> {
        if hash_idx >= self.geometry.hash_size {
            return Err(StormError::Corruption(format!(
                "recovered bucket {} beyond hash size {}",
                hash_idx, self.geometry.hash_size
            )));
        }
        self.insert_at(hash_idx, entry)
            .map_err(|e| self.log_exhaustion(e, hash_idx))
    }

    /// Replace the object at `address` with `entry`, or add `entry` to the
    /// group that owns `address`
    pub fn insert_by_addr(&mut self, address: u64, entry: HashEntry) -> Result<EntryLoc> {
        self.check_address(address)?;
        self.check_address(entry.address())?;
        let group = self.owner_of(address).ok_or(StormError::NotOwned { address })?;

        let loc = match self.find_by_address(address) {
            Some(loc) => {
                *self.entry_mut(loc) = entry;
                loc
            }
            None => {
                let hash_idx = group as u64 * BUCKET_GROUP_SIZE;
                let loc = self.place(group, hash_idx, entry)?;
                self.entries += 1;
                loc
            }
        };

        if entry.address() != address {
            self.addr_table[address as usize] = 0;
        }
        self.addr_table[entry.address() as usize] = group as u32 + 1;
        Ok(loc)
    }

    fn insert_at(&mut self, hash_idx: u64, entry: HashEntry) -> Result<EntryLoc> {
        self.check_address(entry.address())?;
        let group = self.group_of(hash_idx);
        let loc = self.place(group, hash_idx, entry)?;
        self.addr_table[entry.address() as usize] = group as u32 + 1;
        self.entries += 1;
        Ok(loc)
    }

    /// Put `entry` into the head bucket of `group`, growing the chain if needed
    fn place(&mut self, group: usize, hash_idx: u64, entry: HashEntry) -> Result<EntryLoc> {
        let head = self.heads[group];
        if head != NULL_BUCKET {
            if let Some(slot) = self.arena.bucket(head).free_slot() {
                self.arena.bucket_mut(head).entries[slot] = entry;
                return Ok(EntryLoc {
                    bucket: head,
                    slot: slot as u8,
                });
            }
        }

        let stripe = (hash_idx / self.geometry.lock_bktsize) as usize;
        let idx = match self.arena.alloc_from_stripe(stripe) {
            Some(idx) => idx,
            None => match self.arena.alloc_fresh() {
                Some(idx) => idx,
                None => match self.arena.steal(stripe) {
                    Some((idx, from)) => {
                        tracing::debug!(stripe, from, "reused bucket entry from another stripe");
                        idx
                    }
                    None => return Err(StormError::OutOfBuckets { syndrome: hash_idx }),
                },
            },
        };

        let bucket = self.arena.bucket_mut(idx);
        *bucket = BucketEntry::default();
        bucket.entries[0] = entry;
        bucket.next = head;
        self.heads[group] = idx;

        Ok(EntryLoc { bucket: idx, slot: 0 })
    }

    fn log_exhaustion(&self, err: StormError, syndrome: u64) -> StormError {
        match err {
            StormError::OutOfBuckets { .. } => {
                tracing::error!(
                    syndrome,
                    capacity = self.arena.capacity(),
                    entries = self.entries,
                    "hash table out of bucket entries"
                );
                StormError::OutOfBuckets { syndrome }
            }
            other => other,
        }
    }

    // =========================================================================
    // Delete
    // =========================================================================

    /// Remove the entry at `loc`, which must belong to `hash_idx`'s group
    ///
    /// Returns the removed entry.
    pub fn delete(&mut self, loc: EntryLoc, hash_idx: u64) -> Result<HashEntry> {
        if loc.bucket == NULL_BUCKET
            || loc.bucket as usize > self.arena.allocated()
            || loc.slot as usize >= ENTRIES_PER_BUCKET
        {
            return Err(StormError::InvalidArgument(format!(
                "delete at invalid location {:?}",
                loc
            )));
        }
        let removed = *self.entry(loc);
        if !removed.is_used() {
            return Err(StormError::InvalidArgument(format!(
                "delete of unused slot {:?}",
                loc
            )));
        }

        let group = self.group_of(hash_idx % self.geometry.hash_size);
        let head = self.heads[group];
        if head == NULL_BUCKET {
            return Err(StormError::InvalidArgument(format!(
                "delete from empty group {}",
                group
            )));
        }

        if let Some(slot) = self.addr_table.get_mut(removed.address() as usize) {
            *slot = 0;
        }

        if loc.bucket == head {
            self.entry_mut(loc).clear();
        } else {
            // Refill the hole from the head so only the head has free slots
            let last = self
                .arena
                .bucket(head)
                .last_used()
                .ok_or_else(|| StormError::Corruption(format!("empty head bucket in group {}", group)))?;
            let moved = self.arena.bucket(head).entries[last];
            self.arena.bucket_mut(head).entries[last].clear();
            *self.entry_mut(loc) = moved;
        }
        self.entries -= 1;

        if self.arena.bucket(head).is_empty() {
            self.heads[group] = self.arena.bucket(head).next;
            let stripe = self.stripe_of_group(group);
            self.arena.release(stripe, head);
        }

        Ok(removed)
    }

    // =========================================================================
    // Stats & Audit
    // =========================================================================

    /// Number of used entries
    pub fn len(&self) -> usize {
        self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries == 0
    }

    /// Records ever drawn from the global pool
    pub fn arena_allocated(&self) -> usize {
        self.arena.allocated()
    }

    pub fn arena(&self) -> &BucketArena {
        &self.arena
    }

    /// Check the address-table and bucket-partition invariants
    pub fn audit(&self) -> Result<IndexAudit> {
        let mut audit = IndexAudit::default();
        let mut seen = vec![false; self.arena.capacity()];

        for group in 0..self.heads.len() {
            let mut idx = self.heads[group];
            let mut first = true;
            while idx != NULL_BUCKET {
                if std::mem::replace(&mut seen[idx as usize - 1], true) {
                    return Err(StormError::Corruption(format!("bucket {} linked twice", idx)));
                }
                audit.chained_buckets += 1;

                let bucket = self.arena.bucket(idx);
                if !first && bucket.used() != ENTRIES_PER_BUCKET {
                    return Err(StormError::Corruption(format!(
                        "overflow bucket {} of group {} has holes",
                        idx, group
                    )));
                }
                for entry in bucket.entries.iter().filter(|e| e.is_used()) {
                    audit.entries += 1;
                    if self.owner_of(entry.address()) != Some(group) {
                        return Err(StormError::Corruption(format!(
                            "address {} not owned by group {}",
                            entry.address(),
                            group
                        )));
                    }
                }
                first = false;
                idx = bucket.next;
            }
        }

        for stripe in 0..self.arena.stripes() {
            for idx in self.arena.free_list(stripe) {
                if std::mem::replace(&mut seen[idx as usize - 1], true) {
                    return Err(StormError::Corruption(format!(
                        "free bucket {} also in use",
                        idx
                    )));
                }
                audit.free_listed_buckets += 1;
            }
        }

        audit.pool_buckets = self.arena.capacity() - self.arena.allocated();
        let accounted = audit.chained_buckets + audit.free_listed_buckets + audit.pool_buckets;
        if accounted != self.arena.capacity() || audit.entries != self.entries {
            return Err(StormError::Corruption(format!(
                "bucket accounting off: {:?} of {}, {} entries recorded",
                audit,
                self.arena.capacity(),
                self.entries
            )));
        }

        Ok(audit)
    }
}
