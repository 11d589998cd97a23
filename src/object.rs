//! On-flash object format
//!
//! ```text
//! ┌──────────┬──────────────┬──────────────┬──────────────┬─────────┬─────┬──────┐
//! │ "SOBJ"   │ key_len u16  │ cntr_id u16  │ data_len u32 │ CRC u32 │ key │ data │
//! └──────────┴──────────────┴──────────────┴──────────────┴─────────┴─────┴──────┘
//! ```
//! Objects start on a block boundary and are zero padded to whole blocks.
//! The CRC covers key and data.

use bytes::{Buf, BufMut};

use crate::config::MAX_OBJECT_BLOCKS;
use crate::device::BlockDevice;
use crate::error::{Result, StormError};
use crate::index::{HashEntry, KeyVerifier};

/// Eye-catcher of a stored object
pub const OBJECT_MAGIC: [u8; 4] = *b"SOBJ";

/// Bytes before the key
pub const OBJECT_HEADER_SIZE: usize = 16;

/// Blocks needed for an object with this key and payload
pub fn object_blocks(key_len: usize, data_len: usize, block_size: usize) -> u64 {
    (OBJECT_HEADER_SIZE + key_len + data_len).div_ceil(block_size) as u64
}

/// Serialize an object into whole blocks
pub fn encode_object(key: &[u8], cntr_id: u16, data: &[u8], block_size: usize) -> Result<Vec<u8>> {
    if key.is_empty() || key.len() > u16::MAX as usize {
        return Err(StormError::InvalidArgument(format!(
            "key length {} outside 1..={}",
            key.len(),
            u16::MAX
        )));
    }
    let blocks = object_blocks(key.len(), data.len(), block_size);
    if blocks > MAX_OBJECT_BLOCKS || data.len() > u32::MAX as usize {
        return Err(StormError::InvalidArgument(format!(
            "object of {} blocks exceeds {}",
            blocks, MAX_OBJECT_BLOCKS
        )));
    }

    let mut crc = crc32fast::Hasher::new();
    crc.update(key);
    crc.update(data);

    let mut buf = Vec::with_capacity(blocks as usize * block_size);
    buf.put_slice(&OBJECT_MAGIC);
    buf.put_u16_le(key.len() as u16);
    buf.put_u16_le(cntr_id);
    buf.put_u32_le(data.len() as u32);
    buf.put_u32_le(crc.finalize());
    buf.put_slice(key);
    buf.put_slice(data);
    buf.resize(blocks as usize * block_size, 0);
    Ok(buf)
}

/// Fixed header of a stored object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectHeader {
    pub key_len: usize,
    pub cntr_id: u16,
    pub data_len: usize,
    pub crc: u32,
}

impl ObjectHeader {
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < OBJECT_HEADER_SIZE || buf[..4] != OBJECT_MAGIC {
            return Err(StormError::Corruption(
                "index entry points at a block without an object".to_string(),
            ));
        }
        let mut buf = &buf[4..];
        Ok(Self {
            key_len: buf.get_u16_le() as usize,
            cntr_id: buf.get_u16_le(),
            data_len: buf.get_u32_le() as usize,
            crc: buf.get_u32_le(),
        })
    }
}

/// A decoded object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub cntr_id: u16,
    pub key: Vec<u8>,
    pub data: Vec<u8>,
}

/// Decode and verify a full object
pub fn decode_object(buf: &[u8]) -> Result<StoredObject> {
    let header = ObjectHeader::parse(buf)?;
    let end = OBJECT_HEADER_SIZE + header.key_len + header.data_len;
    if buf.len() < end {
        return Err(StormError::Corruption(format!(
            "object of {} bytes truncated to {}",
            end,
            buf.len()
        )));
    }

    let key = &buf[OBJECT_HEADER_SIZE..OBJECT_HEADER_SIZE + header.key_len];
    let data = &buf[OBJECT_HEADER_SIZE + header.key_len..end];
    let mut crc = crc32fast::Hasher::new();
    crc.update(key);
    crc.update(data);
    let computed = crc.finalize();
    if computed != header.crc {
        return Err(StormError::Corruption(format!(
            "object checksum mismatch: stored {:#010x}, computed {:#010x}",
            header.crc, computed
        )));
    }

    Ok(StoredObject {
        cntr_id: header.cntr_id,
        key: key.to_vec(),
        data: data.to_vec(),
    })
}

/// Read the whole object an index entry points at
pub fn read_object(device: &dyn BlockDevice, data_start: u64, entry: &HashEntry) -> Result<StoredObject> {
    let mut buf = vec![0u8; entry.blocks().max(1) as usize * device.block_size()];
    device.read_blocks(data_start + entry.address(), &mut buf)?;
    decode_object(&buf)
}

// =============================================================================
// Key Verification
// =============================================================================

/// Compares a lookup key with the key stored on flash
pub struct DeviceKeyVerifier<'a> {
    device: &'a dyn BlockDevice,
    data_start: u64,
}

impl<'a> DeviceKeyVerifier<'a> {
    pub fn new(device: &'a dyn BlockDevice, data_start: u64) -> Self {
        Self { device, data_start }
    }
}

impl KeyVerifier for DeviceKeyVerifier<'_> {
    fn verify(&self, entry: &HashEntry, key: &[u8]) -> Result<bool> {
        let bs = self.device.block_size();
        // Only the blocks that hold the header and key
        let blocks = ((OBJECT_HEADER_SIZE + key.len()).div_ceil(bs) as u64)
            .clamp(1, u64::from(entry.blocks().max(1)));
        let mut buf = vec![0u8; blocks as usize * bs];
        self.device
            .read_blocks(self.data_start + entry.address(), &mut buf)?;

        let header = ObjectHeader::parse(&buf)?;
        if header.key_len != key.len()
            || header.cntr_id != entry.cntr_id()
            || OBJECT_HEADER_SIZE + key.len() > buf.len()
        {
            return Ok(false);
        }
        Ok(&buf[OBJECT_HEADER_SIZE..OBJECT_HEADER_SIZE + key.len()] == key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_padding() {
        let buf = encode_object(b"k", 1, &[7u8; 600], 512).unwrap();
        assert_eq!(buf.len(), 1024);
        assert_eq!(object_blocks(1, 600, 512), 2);

        let obj = decode_object(&buf).unwrap();
        assert_eq!(obj.key, b"k");
        assert_eq!(obj.data.len(), 600);
    }

    #[test]
    fn test_payload_corruption_detected() {
        let mut buf = encode_object(b"key", 1, b"payload", 512).unwrap();
        buf[OBJECT_HEADER_SIZE + 4] ^= 0xFF;
        assert!(matches!(decode_object(&buf), Err(StormError::Corruption(_))));
    }

    #[test]
    fn test_empty_key_rejected() {
        assert!(matches!(
            encode_object(b"", 1, b"x", 512),
            Err(StormError::InvalidArgument(_))
        ));
    }
}
