//! Tag block: per-measurement map of tag key → tag value → series ids.
//!
//! Layout:
//! ```text
//! ┌─────────────────────────────────────────┐
//! │ KEY ENTRIES (sorted by key)             │
//! │   flags: u8                             │
//! │   key: uvarint len + bytes              │
//! │   value_count: uvarint                  │
//! │   VALUE ENTRIES (sorted by value)       │
//! │     flags: u8                           │
//! │     value: uvarint len + bytes          │
//! │     series ids: count + deltas          │
//! ├─────────────────────────────────────────┤
//! │ INDEX: u64 offset per key entry         │
//! ├─────────────────────────────────────────┤
//! │ TAIL (see encoding)                     │
//! └─────────────────────────────────────────┘
//! ```

use crate::tsi::encoding::{
    check_ids_ascending, flags, put_bytes, put_ids, put_uvarint, BlockSink, BlockTail, Decoder,
    FLAG_DELETED,
};
use crate::tsi::error::{IndexError, IndexResult};
use std::cmp::Ordering;
use std::io::Write;

const KIND: &str = "tag";

struct PendingKey {
    key: Vec<u8>,
    deleted: bool,
    values: Vec<u8>,
    count: u64,
    last_value: Option<Vec<u8>>,
}

/// Encodes one measurement's tag keys and values.
///
/// Values of a key are buffered until the next key (or close) so the value
/// count can precede them.
pub struct TagBlockEncoder<W: Write> {
    sink: BlockSink<W>,
    offsets: Vec<u64>,
    pending: Option<PendingKey>,
    prev_key: Option<Vec<u8>>,
}

impl<W: Write> TagBlockEncoder<W> {
    pub fn new(w: W) -> Self {
        Self {
            sink: BlockSink::new(w),
            offsets: Vec::new(),
            pending: None,
            prev_key: None,
        }
    }

    /// Start a new tag key. Keys must be strictly increasing.
    pub fn encode_key(&mut self, key: &[u8], deleted: bool) -> IndexResult<()> {
        if let Some(prev) = &self.prev_key {
            if prev.as_slice() >= key {
                return Err(IndexError::OutOfOrder(format!(
                    "tag key {} after {}",
                    String::from_utf8_lossy(key),
                    String::from_utf8_lossy(prev)
                )));
            }
        }

        self.flush_key()?;
        self.pending = Some(PendingKey {
            key: key.to_vec(),
            deleted,
            values: Vec::new(),
            count: 0,
            last_value: None,
        });
        self.prev_key = Some(key.to_vec());

        Ok(())
    }

    /// Add a value to the current key. Values must be strictly increasing
    /// and `series_ids` strictly ascending.
    pub fn encode_value(&mut self, value: &[u8], deleted: bool, series_ids: &[u64]) -> IndexResult<()> {
        let pending = self
            .pending
            .as_mut()
            .ok_or_else(|| IndexError::OutOfOrder("tag value encoded before any tag key".into()))?;

        if let Some(last) = &pending.last_value {
            if last.as_slice() >= value {
                return Err(IndexError::OutOfOrder(format!(
                    "tag value {} after {}",
                    String::from_utf8_lossy(value),
                    String::from_utf8_lossy(last)
                )));
            }
        }
        check_ids_ascending(series_ids, "tag value")?;

        pending.values.push(flags(deleted));
        put_bytes(&mut pending.values, value);
        put_ids(&mut pending.values, series_ids);
        pending.count += 1;
        pending.last_value = Some(value.to_vec());

        Ok(())
    }

    fn flush_key(&mut self) -> IndexResult<()> {
        let Some(pending) = self.pending.take() else {
            return Ok(());
        };

        let mut buf = Vec::with_capacity(pending.key.len() + pending.values.len() + 12);
        buf.push(flags(pending.deleted));
        put_bytes(&mut buf, &pending.key);
        put_uvarint(&mut buf, pending.count);
        buf.extend_from_slice(&pending.values);

        self.offsets.push(self.sink.n());
        self.sink.write(&buf)
    }

    /// Bytes written so far (buffered values of the current key excluded)
    pub fn n(&self) -> u64 {
        self.sink.n()
    }

    /// Write the pending key, index and tail. Returns the block size.
    pub fn close(mut self) -> IndexResult<u64> {
        self.flush_key()?;
        let Self { sink, offsets, .. } = self;
        sink.finish(&offsets)
    }
}

/// A decoded tag key entry
#[derive(Debug, Clone)]
pub struct TagKeyEntry<'a> {
    pub key: &'a [u8],
    pub deleted: bool,
    value_count: u64,
    values: Decoder<'a>,
}

impl<'a> TagKeyEntry<'a> {
    /// Number of values under this key
    pub fn value_count(&self) -> u64 {
        self.value_count
    }

    /// Iterate this key's values in order
    pub fn values(&self) -> TagValueEntries<'a> {
        TagValueEntries {
            dec: self.values.clone(),
            remaining: self.value_count,
        }
    }
}

/// A decoded tag value entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagValueEntry<'a> {
    pub value: &'a [u8],
    pub deleted: bool,
    pub series_ids: Vec<u64>,
}

/// Iterator over the values of one tag key
pub struct TagValueEntries<'a> {
    dec: Decoder<'a>,
    remaining: u64,
}

impl<'a> TagValueEntries<'a> {
    fn decode(&mut self) -> IndexResult<TagValueEntry<'a>> {
        let flag = self.dec.read_u8("tag value flags")?;
        let value = self.dec.read_bytes("tag value")?;
        let series_ids = self.dec.read_ids("tag value series ids")?;
        Ok(TagValueEntry {
            value,
            deleted: flag & FLAG_DELETED != 0,
            series_ids,
        })
    }
}

impl<'a> Iterator for TagValueEntries<'a> {
    type Item = IndexResult<TagValueEntry<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        let entry = self.decode();
        if entry.is_err() {
            self.remaining = 0;
        }
        Some(entry)
    }
}

/// Read-only view over an encoded tag block
#[derive(Debug, Clone, Copy)]
pub struct TagBlock<'a> {
    data: &'a [u8],
    tail: BlockTail,
}

impl<'a> TagBlock<'a> {
    /// Open and checksum a tag block
    pub fn open(data: &'a [u8]) -> IndexResult<Self> {
        let block = Self::open_unchecked(data)?;
        block.tail.verify(data, KIND)?;
        Ok(block)
    }

    pub(crate) fn open_unchecked(data: &'a [u8]) -> IndexResult<Self> {
        let tail = BlockTail::read(data, KIND)?;
        Ok(Self { data, tail })
    }

    /// Number of tag keys
    pub fn len(&self) -> usize {
        self.tail.count as usize
    }

    pub fn is_empty(&self) -> bool {
        self.tail.count == 0
    }

    fn key_at(&self, i: usize) -> IndexResult<TagKeyEntry<'a>> {
        let offset = self.tail.index_entry(self.data, i);
        let entries = &self.data[..self.tail.data_size as usize];
        let mut dec = Decoder::at(entries, offset as usize)?;

        let flag = dec.read_u8("tag key flags")?;
        let key = dec.read_bytes("tag key")?;
        let value_count = dec.read_uvarint("tag value count")?;

        Ok(TagKeyEntry {
            key,
            deleted: flag & FLAG_DELETED != 0,
            value_count,
            values: dec,
        })
    }

    /// All keys in order
    pub fn keys(&self) -> impl Iterator<Item = IndexResult<TagKeyEntry<'a>>> + 'a {
        let block = *self;
        (0..block.len()).map(move |i| block.key_at(i))
    }

    /// Find a key by binary search
    pub fn find_key(&self, key: &[u8]) -> IndexResult<Option<TagKeyEntry<'a>>> {
        let (mut lo, mut hi) = (0usize, self.len());
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let entry = self.key_at(mid)?;
            match entry.key.cmp(key) {
                Ordering::Less => lo = mid + 1,
                Ordering::Greater => hi = mid,
                Ordering::Equal => return Ok(Some(entry)),
            }
        }
        Ok(None)
    }

    /// Find a value under a key
    pub fn find_value(&self, key: &[u8], value: &[u8]) -> IndexResult<Option<TagValueEntry<'a>>> {
        let Some(entry) = self.find_key(key)? else {
            return Ok(None);
        };

        for v in entry.values() {
            let v = v?;
            match v.value.cmp(value) {
                Ordering::Less => continue,
                Ordering::Equal => return Ok(Some(v)),
                Ordering::Greater => break,
            }
        }
        Ok(None)
    }
}
