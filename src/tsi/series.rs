//! Series keys and tag sets
//!
//! A series is identified by its measurement name plus its tag set. The
//! series key is the byte-exact encoding of both:
//!
//! ```text
//! uvarint(len name) name uvarint(ntags) (uvarint(len k) k uvarint(len v) v)*
//! ```
//!
//! Tags are kept sorted by key with unique keys, so two equal series always
//! encode to identical bytes.

use crate::tsi::encoding::{put_bytes, put_uvarint, Decoder};
use crate::tsi::error::IndexResult;
use std::cmp::Ordering;
use std::fmt;

/// A single key/value tag pair
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Tag {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl Tag {
    pub fn new(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Tag set sorted by key, with unique keys
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Tags(Vec<Tag>);

impl Tags {
    /// Build a tag set. Tags are sorted by key; for duplicate keys the
    /// last one supplied wins.
    pub fn new(tags: Vec<Tag>) -> Self {
        let mut tags = tags;
        // Stable sort keeps insertion order among equal keys.
        tags.sort_by(|a, b| a.key.cmp(&b.key));
        let mut out: Vec<Tag> = Vec::with_capacity(tags.len());
        for tag in tags {
            match out.last_mut() {
                Some(last) if last.key == tag.key => *last = tag,
                _ => out.push(tag),
            }
        }
        Self(out)
    }

    /// Build a tag set from string pairs
    pub fn from_pairs<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: AsRef<[u8]>,
        V: AsRef<[u8]>,
    {
        Self::new(
            pairs
                .into_iter()
                .map(|(k, v)| Tag::new(k.as_ref(), v.as_ref()))
                .collect(),
        )
    }

    /// Value for a tag key, if present
    pub fn get(&self, key: &[u8]) -> Option<&[u8]> {
        self.0
            .binary_search_by(|t| t.key.as_slice().cmp(key))
            .ok()
            .map(|i| self.0[i].value.as_slice())
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Tag> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<'a> IntoIterator for &'a Tags {
    type Item = &'a Tag;
    type IntoIter = std::slice::Iter<'a, Tag>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl fmt::Display for Tags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, tag) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(
                f,
                "{}={}",
                String::from_utf8_lossy(&tag.key),
                String::from_utf8_lossy(&tag.value)
            )?;
        }
        Ok(())
    }
}

/// Append the series key for `(name, tags)` to `dst`
pub fn append_series_key(dst: &mut Vec<u8>, name: &[u8], tags: &Tags) {
    put_bytes(dst, name);
    put_uvarint(dst, tags.len() as u64);
    for tag in tags {
        put_bytes(dst, &tag.key);
        put_bytes(dst, &tag.value);
    }
}

/// Encode a series key into a fresh buffer
pub fn series_key(name: &[u8], tags: &Tags) -> Vec<u8> {
    let mut buf = Vec::with_capacity(name.len() + 16);
    append_series_key(&mut buf, name, tags);
    buf
}

/// Decode a series key, returning name and tags
pub fn parse_series_key(data: &[u8]) -> IndexResult<(Vec<u8>, Tags)> {
    let mut dec = Decoder::new(data);
    decode_series_key(&mut dec)
}

pub(crate) fn decode_series_key(dec: &mut Decoder<'_>) -> IndexResult<(Vec<u8>, Tags)> {
    let name = dec.read_bytes("series name")?.to_vec();
    let ntags = dec.read_uvarint("tag count")?;
    let mut tags = Vec::new();
    for _ in 0..ntags {
        let key = dec.read_bytes("tag key")?;
        let value = dec.read_bytes("tag value")?;
        tags.push(Tag::new(key, value));
    }
    // Keys were written sorted and unique; keep the order as stored.
    Ok((name, Tags(tags)))
}

/// Order series by name, then by tags pairwise
pub fn compare_series(a_name: &[u8], a_tags: &Tags, b_name: &[u8], b_tags: &Tags) -> Ordering {
    a_name.cmp(b_name).then_with(|| a_tags.cmp(b_tags))
}
