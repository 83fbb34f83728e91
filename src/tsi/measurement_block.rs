//! Measurement block: one entry per measurement, sorted by name.
//!
//! Layout:
//! ```text
//! ┌─────────────────────────────────────────┐
//! │ ENTRIES (sorted by name)                │
//! │   flags: u8                             │
//! │   name: uvarint len + bytes             │
//! │   tagset_offset: u64                    │
//! │   tagset_size: u64                      │
//! │   series ids: count + deltas            │
//! ├─────────────────────────────────────────┤
//! │ INDEX: u64 offset per entry             │
//! ├─────────────────────────────────────────┤
//! │ TAIL (see encoding)                     │
//! └─────────────────────────────────────────┘
//! ```
//!
//! The tagset offset is file-relative: it points at the measurement's tag
//! block elsewhere in the same index file.

use crate::tsi::encoding::{
    check_ids_ascending, flags, put_bytes, put_ids, BlockSink, BlockTail, Decoder, FLAG_DELETED,
};
use crate::tsi::error::{IndexError, IndexResult};
use crate::tsi::trailer::BlockPos;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::io::Write;

const KIND: &str = "measurement";

#[derive(Debug)]
struct PendingMeasurement {
    deleted: bool,
    tagset: BlockPos,
    series_ids: Vec<u64>,
}

/// Collects measurements and writes them as one block
#[derive(Debug, Default)]
pub struct MeasurementBlockWriter {
    entries: BTreeMap<Vec<u8>, PendingMeasurement>,
}

impl MeasurementBlockWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a measurement. `series_ids` must be strictly ascending.
    pub fn add(
        &mut self,
        name: &[u8],
        deleted: bool,
        tagset_offset: u64,
        tagset_size: u64,
        series_ids: Vec<u64>,
    ) -> IndexResult<()> {
        check_ids_ascending(&series_ids, "measurement")?;
        if self.entries.contains_key(name) {
            return Err(IndexError::OutOfOrder(format!(
                "measurement {} added twice",
                String::from_utf8_lossy(name)
            )));
        }

        self.entries.insert(
            name.to_vec(),
            PendingMeasurement {
                deleted,
                tagset: BlockPos::new(tagset_offset, tagset_size),
                series_ids,
            },
        );
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Write the block to `w`, returning bytes written
    pub fn write_to<W: Write>(&self, w: W) -> IndexResult<u64> {
        let mut sink = BlockSink::new(w);
        let mut offsets = Vec::with_capacity(self.entries.len());
        let mut buf = Vec::new();

        for (name, m) in &self.entries {
            buf.clear();
            buf.push(flags(m.deleted));
            put_bytes(&mut buf, name);
            buf.extend_from_slice(&m.tagset.offset.to_le_bytes());
            buf.extend_from_slice(&m.tagset.size.to_le_bytes());
            put_ids(&mut buf, &m.series_ids);

            offsets.push(sink.n());
            sink.write(&buf)?;
        }

        sink.finish(&offsets)
    }
}

/// A decoded measurement entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeasurementEntry<'a> {
    pub name: &'a [u8],
    pub deleted: bool,
    pub tagset: BlockPos,
    pub series_ids: Vec<u64>,
}

/// Read-only view over an encoded measurement block
#[derive(Debug, Clone, Copy)]
pub struct MeasurementBlock<'a> {
    data: &'a [u8],
    tail: BlockTail,
}

impl<'a> MeasurementBlock<'a> {
    /// Open and checksum a measurement block
    pub fn open(data: &'a [u8]) -> IndexResult<Self> {
        let block = Self::open_unchecked(data)?;
        block.tail.verify(data, KIND)?;
        Ok(block)
    }

    pub(crate) fn open_unchecked(data: &'a [u8]) -> IndexResult<Self> {
        let tail = BlockTail::read(data, KIND)?;
        Ok(Self { data, tail })
    }

    pub fn len(&self) -> usize {
        self.tail.count as usize
    }

    pub fn is_empty(&self) -> bool {
        self.tail.count == 0
    }

    fn entry_at(&self, i: usize) -> IndexResult<MeasurementEntry<'a>> {
        let offset = self.tail.index_entry(self.data, i);
        let entries = &self.data[..self.tail.data_size as usize];
        let mut dec = Decoder::at(entries, offset as usize)?;

        let flag = dec.read_u8("measurement flags")?;
        let name = dec.read_bytes("measurement name")?;
        let tagset_offset = dec.read_u64("tagset offset")?;
        let tagset_size = dec.read_u64("tagset size")?;
        let series_ids = dec.read_ids("measurement series ids")?;

        Ok(MeasurementEntry {
            name,
            deleted: flag & FLAG_DELETED != 0,
            tagset: BlockPos::new(tagset_offset, tagset_size),
            series_ids,
        })
    }

    /// All measurements in name order
    pub fn iter(&self) -> impl Iterator<Item = IndexResult<MeasurementEntry<'a>>> + 'a {
        let block = *self;
        (0..block.len()).map(move |i| block.entry_at(i))
    }

    /// Find a measurement by binary search
    pub fn find(&self, name: &[u8]) -> IndexResult<Option<MeasurementEntry<'a>>> {
        let (mut lo, mut hi) = (0usize, self.len());
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let entry = self.entry_at(mid)?;
            match entry.name.cmp(name) {
                Ordering::Less => lo = mid + 1,
                Ordering::Greater => hi = mid,
                Ordering::Equal => return Ok(Some(entry)),
            }
        }
        Ok(None)
    }
}
