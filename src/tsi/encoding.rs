//! Low-level binary helpers shared by the block encoders and readers.
//!
//! Every block in an index file has the same outer shape:
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │ DATA (variable)                          │
//! ├──────────────────────────────────────────┤
//! │ INDEX: count × u64 (block-relative)      │
//! ├──────────────────────────────────────────┤
//! │ TAIL (20 bytes)                          │
//! │   data_size: u64                         │
//! │   count: u64                             │
//! │   checksum: u32 (CRC32 of data + index)  │
//! └──────────────────────────────────────────┘
//! ```
//!
//! Variable-length integers are unsigned LEB128. Series id lists are stored
//! as a count followed by ascending deltas.

use crate::tsi::error::{IndexError, IndexResult};
use std::io::Write;

/// Size of the fixed tail at the end of every block
pub(crate) const BLOCK_TAIL_SIZE: usize = 20;

/// Entry flag bit marking a tombstone
pub(crate) const FLAG_DELETED: u8 = 0x01;

pub(crate) fn flags(deleted: bool) -> u8 {
    if deleted {
        FLAG_DELETED
    } else {
        0
    }
}

/// Append `v` as an unsigned LEB128 varint
pub(crate) fn put_uvarint(buf: &mut Vec<u8>, mut v: u64) {
    while v >= 0x80 {
        buf.push((v as u8) | 0x80);
        v >>= 7;
    }
    buf.push(v as u8);
}

/// Append a length-prefixed byte string
pub(crate) fn put_bytes(buf: &mut Vec<u8>, b: &[u8]) {
    put_uvarint(buf, b.len() as u64);
    buf.extend_from_slice(b);
}

/// Append a strictly ascending id list as count + deltas
pub(crate) fn put_ids(buf: &mut Vec<u8>, ids: &[u64]) {
    put_uvarint(buf, ids.len() as u64);
    let mut prev = 0u64;
    for &id in ids {
        put_uvarint(buf, id - prev);
        prev = id;
    }
}

/// Check that ids are strictly ascending
pub(crate) fn check_ids_ascending(ids: &[u64], context: &str) -> IndexResult<()> {
    if let Some(pair) = ids.windows(2).find(|w| w[0] >= w[1]) {
        return Err(IndexError::OutOfOrder(format!(
            "series ids for {} not strictly ascending: {} then {}",
            context, pair[0], pair[1]
        )));
    }
    Ok(())
}

fn le_u64(buf: &[u8]) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[..8]);
    u64::from_le_bytes(b)
}

/// Forward-only reader over an encoded byte slice
#[derive(Debug, Clone)]
pub(crate) struct Decoder<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Start decoding at `pos` within `data`
    pub(crate) fn at(data: &'a [u8], pos: usize) -> IndexResult<Self> {
        if pos > data.len() {
            return Err(IndexError::Corruption(format!(
                "offset {} beyond block of {} bytes",
                pos,
                data.len()
            )));
        }
        Ok(Self { data, pos })
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    fn truncated(&self, what: &str) -> IndexError {
        IndexError::Corruption(format!("truncated {} at offset {}", what, self.pos))
    }

    pub(crate) fn read_u8(&mut self, what: &str) -> IndexResult<u8> {
        let b = *self.data.get(self.pos).ok_or_else(|| self.truncated(what))?;
        self.pos += 1;
        Ok(b)
    }

    pub(crate) fn read_u64(&mut self, what: &str) -> IndexResult<u64> {
        if self.remaining() < 8 {
            return Err(self.truncated(what));
        }
        let v = le_u64(&self.data[self.pos..]);
        self.pos += 8;
        Ok(v)
    }

    pub(crate) fn read_uvarint(&mut self, what: &str) -> IndexResult<u64> {
        let mut value = 0u64;
        let mut shift = 0u32;
        loop {
            let b = self.read_u8(what)?;
            if shift == 63 && b > 1 {
                return Err(IndexError::Corruption(format!("varint overflow in {}", what)));
            }
            value |= u64::from(b & 0x7f) << shift;
            if b & 0x80 == 0 {
                return Ok(value);
            }
            shift += 7;
            if shift > 63 {
                return Err(IndexError::Corruption(format!("varint overflow in {}", what)));
            }
        }
    }

    pub(crate) fn read_bytes(&mut self, what: &str) -> IndexResult<&'a [u8]> {
        let len = self.read_uvarint(what)?;
        if len > self.remaining() as u64 {
            return Err(self.truncated(what));
        }
        let start = self.pos;
        self.pos += len as usize;
        Ok(&self.data[start..self.pos])
    }

    pub(crate) fn read_ids(&mut self, what: &str) -> IndexResult<Vec<u64>> {
        let count = self.read_uvarint(what)?;
        // Every delta takes at least one byte.
        if count > self.remaining() as u64 {
            return Err(self.truncated(what));
        }
        let mut ids = Vec::with_capacity(count as usize);
        let mut prev = 0u64;
        for _ in 0..count {
            let delta = self.read_uvarint(what)?;
            prev = prev
                .checked_add(delta)
                .ok_or_else(|| IndexError::Corruption(format!("id overflow in {}", what)))?;
            ids.push(prev);
        }
        Ok(ids)
    }
}

/// Parsed fixed tail of a block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BlockTail {
    /// Bytes of entry data at the start of the block
    pub data_size: u64,
    /// Number of entries (and index slots)
    pub count: u64,
    /// CRC32 of data + index
    pub checksum: u32,
}

impl BlockTail {
    /// Parse and bounds-check the tail of `block`. Does not verify the checksum.
    pub(crate) fn read(block: &[u8], kind: &str) -> IndexResult<Self> {
        if block.len() < BLOCK_TAIL_SIZE {
            return Err(IndexError::Corruption(format!(
                "{} block too small: {} bytes",
                kind,
                block.len()
            )));
        }

        let body = block.len() - BLOCK_TAIL_SIZE;
        let tail = &block[body..];
        let data_size = le_u64(&tail[0..8]);
        let count = le_u64(&tail[8..16]);
        let checksum = u32::from_le_bytes([tail[16], tail[17], tail[18], tail[19]]);

        let expected = count
            .checked_mul(8)
            .and_then(|index_size| index_size.checked_add(data_size));
        if expected != Some(body as u64) {
            return Err(IndexError::Corruption(format!(
                "{} block layout mismatch: data={} count={} body={}",
                kind, data_size, count, body
            )));
        }

        Ok(Self {
            data_size,
            count,
            checksum,
        })
    }

    /// Verify the block checksum
    pub(crate) fn verify(&self, block: &[u8], kind: &str) -> IndexResult<()> {
        let body = block.len().saturating_sub(BLOCK_TAIL_SIZE);
        let computed = crc32fast::hash(&block[..body]);
        if computed != self.checksum {
            return Err(IndexError::Corruption(format!(
                "{} block checksum mismatch: stored={}, computed={}",
                kind, self.checksum, computed
            )));
        }
        Ok(())
    }

    /// Block-relative offset of entry `i` from the index
    pub(crate) fn index_entry(&self, block: &[u8], i: usize) -> u64 {
        let start = self.data_size as usize + i * 8;
        le_u64(&block[start..start + 8])
    }
}

/// Checksumming writer that lays out `[data][index][tail]`
pub(crate) struct BlockSink<W: Write> {
    w: W,
    n: u64,
    hasher: crc32fast::Hasher,
}

impl<W: Write> BlockSink<W> {
    pub(crate) fn new(w: W) -> Self {
        Self {
            w,
            n: 0,
            hasher: crc32fast::Hasher::new(),
        }
    }

    /// Bytes written so far
    pub(crate) fn n(&self) -> u64 {
        self.n
    }

    pub(crate) fn write(&mut self, buf: &[u8]) -> IndexResult<()> {
        self.w.write_all(buf)?;
        self.hasher.update(buf);
        self.n += buf.len() as u64;
        Ok(())
    }

    /// Write the offset index and tail, returning total block size
    pub(crate) fn finish(mut self, index: &[u64]) -> IndexResult<u64> {
        let data_size = self.n;

        let mut buf = Vec::with_capacity(index.len() * 8);
        for offset in index {
            buf.extend_from_slice(&offset.to_le_bytes());
        }
        self.write(&buf)?;

        let checksum = self.hasher.clone().finalize();
        let mut tail = [0u8; BLOCK_TAIL_SIZE];
        tail[0..8].copy_from_slice(&data_size.to_le_bytes());
        tail[8..16].copy_from_slice(&(index.len() as u64).to_le_bytes());
        tail[16..20].copy_from_slice(&checksum.to_le_bytes());
        self.w.write_all(&tail)?;
        self.n += BLOCK_TAIL_SIZE as u64;

        Ok(self.n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uvarint_edges() {
        for v in [0u64, 1, 127, 128, 300, u32::MAX as u64, u64::MAX] {
            let mut buf = Vec::new();
            put_uvarint(&mut buf, v);
            let mut dec = Decoder::new(&buf);
            assert_eq!(dec.read_uvarint("v").unwrap(), v);
            assert!(dec.is_empty());
        }
    }

    #[test]
    fn test_truncated_bytes() {
        let mut buf = Vec::new();
        put_uvarint(&mut buf, 10);
        buf.extend_from_slice(b"abc");

        let mut dec = Decoder::new(&buf);
        let err = dec.read_bytes("name").unwrap_err();
        assert!(matches!(err, IndexError::Corruption(_)));
    }

    #[test]
    fn test_ids_delta_encoding() {
        let mut buf = Vec::new();
        put_ids(&mut buf, &[3, 10, 11, 500]);
        // count + 4 deltas (3, 7, 1, 489 -> two bytes)
        assert_eq!(buf.len(), 1 + 1 + 1 + 1 + 2);

        let mut dec = Decoder::new(&buf);
        assert_eq!(dec.read_ids("ids").unwrap(), vec![3, 10, 11, 500]);
    }

    #[test]
    fn test_check_ids_ascending() {
        assert!(check_ids_ascending(&[], "x").is_ok());
        assert!(check_ids_ascending(&[1, 2, 9], "x").is_ok());
        assert!(matches!(
            check_ids_ascending(&[1, 1], "x"),
            Err(IndexError::OutOfOrder(_))
        ));
        assert!(check_ids_ascending(&[5, 2], "x").is_err());
    }

    #[test]
    fn test_block_sink_layout() {
        let mut out = Vec::new();
        let mut sink = BlockSink::new(&mut out);
        sink.write(b"hello").unwrap();
        sink.write(b"world").unwrap();
        let size = sink.finish(&[0, 5]).unwrap();

        assert_eq!(size as usize, out.len());
        assert_eq!(out.len(), 10 + 16 + BLOCK_TAIL_SIZE);

        let tail = BlockTail::read(&out, "test").unwrap();
        assert_eq!(tail.data_size, 10);
        assert_eq!(tail.count, 2);
        tail.verify(&out, "test").unwrap();
        assert_eq!(tail.index_entry(&out, 1), 5);
    }

    #[test]
    fn test_block_tail_detects_corruption() {
        let mut out = Vec::new();
        let mut sink = BlockSink::new(&mut out);
        sink.write(b"payload").unwrap();
        sink.finish(&[0]).unwrap();

        out[2] ^= 0xff;
        let tail = BlockTail::read(&out, "test").unwrap();
        assert!(matches!(
            tail.verify(&out, "test"),
            Err(IndexError::Corruption(_))
        ));

        assert!(BlockTail::read(&out[..10], "test").is_err());
    }
}
