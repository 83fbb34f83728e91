//! Index file signature and trailer.
//!
//! File layout:
//! ```text
//! ┌─────────────────────────────────────────┐
//! │ SIGNATURE: [u8; 4] = "TSI1"             │
//! ├─────────────────────────────────────────┤
//! │ SERIES BLOCK                            │
//! ├─────────────────────────────────────────┤
//! │ TAG BLOCKS (one per measurement)        │
//! ├─────────────────────────────────────────┤
//! │ MEASUREMENT BLOCK                       │
//! ├─────────────────────────────────────────┤
//! │ TRAILER (38 bytes)                      │
//! │   series_block: offset u64, size u64    │
//! │   measurement_block: offset u64, size   │
//! │   version: u16                          │
//! │   checksum: u32                         │
//! └─────────────────────────────────────────┘
//! ```
//!
//! A file without a valid trailer was never completely written and is not
//! an index file.

use crate::tsi::error::{IndexError, IndexResult};
use serde::{Deserialize, Serialize};
use std::io::Write;

/// Magic bytes at the start of every index file
pub const FILE_SIGNATURE: &[u8; 4] = b"TSI1";

/// Current trailer format version
pub const TRAILER_VERSION: u16 = 1;

/// Trailer size in bytes
pub const TRAILER_SIZE: usize = 38;

/// Bincode-encoded block positions
const TRAILER_BODY_SIZE: usize = 32;

/// Offset and size of a region of an index file
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockPos {
    pub offset: u64,
    pub size: u64,
}

impl BlockPos {
    pub fn new(offset: u64, size: u64) -> Self {
        Self { offset, size }
    }

    /// One past the last byte of the region
    pub fn end(&self) -> Option<u64> {
        self.offset.checked_add(self.size)
    }
}

/// Fixed footer locating the series and measurement blocks
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexFileTrailer {
    pub series_block: BlockPos,
    pub measurement_block: BlockPos,
}

impl IndexFileTrailer {
    /// Serialize trailer to bytes
    pub fn to_bytes(&self) -> IndexResult<[u8; TRAILER_SIZE]> {
        let body = bincode::serialize(self)?;
        if body.len() != TRAILER_BODY_SIZE {
            return Err(IndexError::Serialization(format!(
                "trailer body is {} bytes, expected {}",
                body.len(),
                TRAILER_BODY_SIZE
            )));
        }

        let mut buf = [0u8; TRAILER_SIZE];
        buf[..TRAILER_BODY_SIZE].copy_from_slice(&body);
        buf[32..34].copy_from_slice(&TRAILER_VERSION.to_le_bytes());

        let checksum = crc32fast::hash(&buf[..34]);
        buf[34..38].copy_from_slice(&checksum.to_le_bytes());

        Ok(buf)
    }

    /// Write the trailer, returning bytes written
    pub fn write_to<W: Write>(&self, mut w: W) -> IndexResult<u64> {
        let buf = self.to_bytes()?;
        w.write_all(&buf)?;
        Ok(TRAILER_SIZE as u64)
    }

    /// Read and validate the trailer at the end of a whole index file
    pub fn read(file: &[u8]) -> IndexResult<Self> {
        if file.len() < FILE_SIGNATURE.len() + TRAILER_SIZE {
            return Err(IndexError::InvalidFile(format!(
                "file too small: {} bytes",
                file.len()
            )));
        }

        let buf = &file[file.len() - TRAILER_SIZE..];

        let stored = u32::from_le_bytes([buf[34], buf[35], buf[36], buf[37]]);
        let computed = crc32fast::hash(&buf[..34]);
        if stored != computed {
            return Err(IndexError::Corruption(format!(
                "Trailer checksum mismatch: stored={}, computed={}",
                stored, computed
            )));
        }

        let version = u16::from_le_bytes([buf[32], buf[33]]);
        if version != TRAILER_VERSION {
            return Err(IndexError::InvalidFile(format!(
                "Unsupported trailer version: {}",
                version
            )));
        }

        let trailer: IndexFileTrailer = bincode::deserialize(&buf[..TRAILER_BODY_SIZE])?;

        let body_end = (file.len() - TRAILER_SIZE) as u64;
        for (what, pos) in [
            ("series block", trailer.series_block),
            ("measurement block", trailer.measurement_block),
        ] {
            let in_bounds = pos.offset >= FILE_SIGNATURE.len() as u64
                && pos.end().map_or(false, |end| end <= body_end);
            if !in_bounds {
                return Err(IndexError::InvalidFile(format!(
                    "{} [{}, +{}) outside file body of {} bytes",
                    what, pos.offset, pos.size, body_end
                )));
            }
        }

        Ok(trailer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_file(trailer: &IndexFileTrailer, body: usize) -> Vec<u8> {
        let mut file = FILE_SIGNATURE.to_vec();
        file.resize(FILE_SIGNATURE.len() + body, 0);
        trailer.write_to(&mut file).unwrap();
        file
    }

    #[test]
    fn test_trailer_roundtrip() {
        let trailer = IndexFileTrailer {
            series_block: BlockPos::new(4, 100),
            measurement_block: BlockPos::new(150, 50),
        };
        let file = sample_file(&trailer, 196);
        assert_eq!(file.len(), 4 + 196 + TRAILER_SIZE);

        let restored = IndexFileTrailer::read(&file).unwrap();
        assert_eq!(restored, trailer);
    }

    #[test]
    fn test_trailer_checksum_mismatch() {
        let trailer = IndexFileTrailer {
            series_block: BlockPos::new(4, 10),
            measurement_block: BlockPos::new(14, 10),
        };
        let mut file = sample_file(&trailer, 20);
        let n = file.len();
        file[n - 10] ^= 0x01;

        assert!(matches!(
            IndexFileTrailer::read(&file),
            Err(IndexError::Corruption(_))
        ));
    }

    #[test]
    fn test_trailer_out_of_bounds() {
        let trailer = IndexFileTrailer {
            series_block: BlockPos::new(4, 10),
            measurement_block: BlockPos::new(14, 1000),
        };
        let file = sample_file(&trailer, 20);

        assert!(matches!(
            IndexFileTrailer::read(&file),
            Err(IndexError::InvalidFile(_))
        ));
    }

    #[test]
    fn test_missing_trailer() {
        assert!(matches!(
            IndexFileTrailer::read(b"TSI1"),
            Err(IndexError::InvalidFile(_))
        ));
    }
}
