//! Checksum helpers
//!
//! All on-flash checksums are CRC32 over the whole structure with the
//! checksum field itself zeroed. Log pages are additionally salted with their
//! own LSN so a page copied to the wrong position fails verification.

use xxhash_rust::xxh64::xxh64;

/// 64-bit hash of `key` at recursion `level`; the base of every syndrome
pub fn hashck(key: &[u8], level: u64) -> u64 {
    xxh64(key, level)
}

/// CRC32 of `buf`, treating `buf[field..field + 4]` as zero
pub fn crc_without_field(buf: &[u8], field: usize) -> u32 {
    crc_salted(buf, field, 0)
}

/// CRC32 of `buf` seeded with `salt`, treating the 4-byte checksum field as zero
pub fn crc_salted(buf: &[u8], field: usize, salt: u32) -> u32 {
    let mut hasher = crc32fast::Hasher::new_with_initial(salt);
    hasher.update(&buf[..field]);
    hasher.update(&[0u8; 4]);
    hasher.update(&buf[field + 4..]);
    hasher.finalize()
}

/// Fold a 64-bit LSN into a CRC seed
pub fn lsn_salt(lsn: u64) -> u32 {
    (lsn ^ (lsn >> 32)) as u32
}

/// Plain CRC32 of a buffer
pub fn crc(buf: &[u8]) -> u32 {
    crc32fast::hash(buf)
}
