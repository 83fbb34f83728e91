//! Series block: every unique series of an index file, in series order.
//!
//! Layout:
//! ```text
//! ┌─────────────────────────────────────────┐
//! │ PADDING: u8 = 0                         │
//! ├─────────────────────────────────────────┤
//! │ ENTRIES                                 │
//! │   flags: u8 (bit 0 = deleted)           │
//! │   series key                            │
//! ├─────────────────────────────────────────┤
//! │ INDEX: u64 offset per entry             │
//! ├─────────────────────────────────────────┤
//! │ TAIL (see encoding)                     │
//! └─────────────────────────────────────────┘
//! ```
//!
//! A series id is the block-relative offset of its entry. The leading
//! padding byte keeps offset 0 free to mean "not found".

use crate::tsi::encoding::{flags, BlockSink, BlockTail, Decoder, FLAG_DELETED};
use crate::tsi::error::{IndexError, IndexResult};
use crate::tsi::iter::SeriesElem;
use crate::tsi::series::{append_series_key, compare_series, decode_series_key, Tags};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::io::Write;

const KIND: &str = "series";

/// Streams series into a series block and remembers where each one landed
pub struct SeriesBlockEncoder<W: Write> {
    sink: BlockSink<W>,
    offsets: Vec<u64>,
    lookup: HashMap<Vec<u8>, u64>,
    prev: Option<(Vec<u8>, Tags)>,
    buf: Vec<u8>,
}

impl<W: Write> SeriesBlockEncoder<W> {
    /// Start a new block on `w`, writing the padding byte
    pub fn new(w: W) -> IndexResult<Self> {
        let mut sink = BlockSink::new(w);
        sink.write(&[0])?;

        Ok(Self {
            sink,
            offsets: Vec::new(),
            lookup: HashMap::new(),
            prev: None,
            buf: Vec::new(),
        })
    }

    /// Encode one series. Series must arrive in strictly increasing order.
    pub fn encode(&mut self, name: &[u8], tags: &Tags, deleted: bool) -> IndexResult<()> {
        if let Some((prev_name, prev_tags)) = &self.prev {
            if compare_series(prev_name, prev_tags, name, tags) != Ordering::Less {
                return Err(IndexError::OutOfOrder(format!(
                    "series {} {} after {} {}",
                    String::from_utf8_lossy(name),
                    tags,
                    String::from_utf8_lossy(prev_name),
                    prev_tags
                )));
            }
        }

        let offset = self.sink.n();

        self.buf.clear();
        self.buf.push(flags(deleted));
        append_series_key(&mut self.buf, name, tags);
        self.sink.write(&self.buf)?;

        self.lookup.insert(self.buf[1..].to_vec(), offset);
        self.offsets.push(offset);
        self.prev = Some((name.to_vec(), tags.clone()));

        Ok(())
    }

    /// Id of a previously encoded series key, or 0 if it was never encoded
    pub fn offset(&self, series_key: &[u8]) -> u64 {
        self.lookup.get(series_key).copied().unwrap_or(0)
    }

    /// Bytes written so far
    pub fn n(&self) -> u64 {
        self.sink.n()
    }

    /// Number of series encoded so far
    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    /// Write the index and tail. The returned table keeps answering id
    /// lookups after the writer is released.
    pub fn close(self) -> IndexResult<SeriesOffsets> {
        let Self {
            sink,
            offsets,
            lookup,
            ..
        } = self;

        let size = sink.finish(&offsets)?;

        Ok(SeriesOffsets { lookup, size })
    }
}

/// Series key → id table of a finished series block
#[derive(Debug, Default)]
pub struct SeriesOffsets {
    lookup: HashMap<Vec<u8>, u64>,
    size: u64,
}

impl SeriesOffsets {
    /// Id of a series key, or 0 if the block does not hold it
    pub fn offset(&self, series_key: &[u8]) -> u64 {
        self.lookup.get(series_key).copied().unwrap_or(0)
    }

    /// Total size of the encoded block in bytes
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn len(&self) -> usize {
        self.lookup.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lookup.is_empty()
    }
}

/// Read-only view over an encoded series block
#[derive(Debug, Clone, Copy)]
pub struct SeriesBlock<'a> {
    data: &'a [u8],
    tail: BlockTail,
}

impl<'a> SeriesBlock<'a> {
    /// Open and checksum a series block
    pub fn open(data: &'a [u8]) -> IndexResult<Self> {
        let block = Self::open_unchecked(data)?;
        block.tail.verify(data, KIND)?;
        Ok(block)
    }

    /// Open without verifying the checksum (the block was verified earlier)
    pub(crate) fn open_unchecked(data: &'a [u8]) -> IndexResult<Self> {
        let tail = BlockTail::read(data, KIND)?;
        if tail.data_size == 0 {
            return Err(IndexError::Corruption("series block missing padding".into()));
        }
        Ok(Self { data, tail })
    }

    /// Number of series in the block
    pub fn len(&self) -> usize {
        self.tail.count as usize
    }

    pub fn is_empty(&self) -> bool {
        self.tail.count == 0
    }

    /// Decode the series stored under `id`
    pub fn series_at(&self, id: u64) -> IndexResult<SeriesElem> {
        if id == 0 || id >= self.tail.data_size {
            return Err(IndexError::Corruption(format!(
                "series id {} outside series block",
                id
            )));
        }

        let entries = &self.data[..self.tail.data_size as usize];
        let mut dec = Decoder::at(entries, id as usize)?;
        let flag = dec.read_u8("series flags")?;
        let (name, tags) = decode_series_key(&mut dec)?;

        Ok(SeriesElem {
            name,
            tags,
            deleted: flag & FLAG_DELETED != 0,
        })
    }

    /// All ids in series order
    pub fn ids(&self) -> impl Iterator<Item = u64> + 'a {
        let block = *self;
        (0..block.len()).map(move |i| block.tail.index_entry(block.data, i))
    }

    /// All series in series order
    pub fn iter(&self) -> impl Iterator<Item = IndexResult<SeriesElem>> + 'a {
        let block = *self;
        self.ids().map(move |id| block.series_at(id))
    }

    /// Look up the id of a series by binary search. Returns 0 if absent.
    pub fn offset(&self, name: &[u8], tags: &Tags) -> IndexResult<u64> {
        let (mut lo, mut hi) = (0usize, self.len());
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let id = self.tail.index_entry(self.data, mid);
            let elem = self.series_at(id)?;
            match compare_series(&elem.name, &elem.tags, name, tags) {
                Ordering::Less => lo = mid + 1,
                Ordering::Greater => hi = mid,
                Ordering::Equal => return Ok(id),
            }
        }
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tsi::series::series_key;

    fn host(h: &str) -> Tags {
        Tags::from_pairs([("host", h)])
    }

    fn encode_block(series: &[(&str, &str, bool)]) -> (Vec<u8>, SeriesOffsets) {
        let mut out = Vec::new();
        let mut enc = SeriesBlockEncoder::new(&mut out).unwrap();
        for (name, h, deleted) in series {
            enc.encode(name.as_bytes(), &host(h), *deleted).unwrap();
        }
        let offsets = enc.close().unwrap();
        (out, offsets)
    }

    #[test]
    fn test_ids_are_nonzero_offsets() {
        let (out, offsets) = encode_block(&[("cpu", "a", false), ("cpu", "b", true)]);

        assert_eq!(offsets.size() as usize, out.len());
        assert_eq!(offsets.len(), 2);

        let a = offsets.offset(&series_key(b"cpu", &host("a")));
        let b = offsets.offset(&series_key(b"cpu", &host("b")));
        assert_eq!(a, 1);
        assert!(b > a);
        assert_eq!(offsets.offset(&series_key(b"mem", &host("a"))), 0);
    }

    #[test]
    fn test_encoder_lookup_before_close() {
        let mut out = Vec::new();
        let mut enc = SeriesBlockEncoder::new(&mut out).unwrap();
        enc.encode(b"cpu", &host("a"), false).unwrap();

        assert_eq!(enc.offset(&series_key(b"cpu", &host("a"))), 1);
        assert_eq!(enc.len(), 1);
        assert!(enc.n() > 1);
    }

    #[test]
    fn test_encoder_rejects_out_of_order() {
        let mut out = Vec::new();
        let mut enc = SeriesBlockEncoder::new(&mut out).unwrap();
        enc.encode(b"mem", &host("a"), false).unwrap();

        let err = enc.encode(b"cpu", &host("a"), false).unwrap_err();
        assert!(matches!(err, IndexError::OutOfOrder(_)));

        let err = enc.encode(b"mem", &host("a"), false).unwrap_err();
        assert!(matches!(err, IndexError::OutOfOrder(_)));
    }

    #[test]
    fn test_reader_iterates_and_resolves() {
        let (out, offsets) =
            encode_block(&[("cpu", "a", false), ("cpu", "b", true), ("mem", "a", false)]);

        let block = SeriesBlock::open(&out).unwrap();
        assert_eq!(block.len(), 3);

        let all: Vec<SeriesElem> = block.iter().map(|s| s.unwrap()).collect();
        assert_eq!(all[0], SeriesElem::new("cpu", host("a"), false));
        assert_eq!(all[1], SeriesElem::new("cpu", host("b"), true));
        assert_eq!(all[2], SeriesElem::new("mem", host("a"), false));

        for id in block.ids() {
            let elem = block.series_at(id).unwrap();
            assert_eq!(offsets.offset(&series_key(&elem.name, &elem.tags)), id);
            assert_eq!(block.offset(&elem.name, &elem.tags).unwrap(), id);
        }
        assert_eq!(block.offset(b"disk", &host("a")).unwrap(), 0);
    }

    #[test]
    fn test_empty_block() {
        let (out, offsets) = encode_block(&[]);
        assert!(offsets.is_empty());

        let block = SeriesBlock::open(&out).unwrap();
        assert!(block.is_empty());
        assert_eq!(block.iter().count(), 0);
        assert!(block.series_at(0).is_err());
    }

    #[test]
    fn test_reader_detects_corruption() {
        let (mut out, _) = encode_block(&[("cpu", "a", false)]);
        out[3] ^= 0x55;
        assert!(matches!(
            SeriesBlock::open(&out),
            Err(IndexError::Corruption(_))
        ));
    }
}
