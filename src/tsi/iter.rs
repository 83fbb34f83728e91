//! Index elements, iterator types and k-way merging
//!
//! Each index file exposes sorted iterators over its measurements, tag keys,
//! tag values and series. The merge functions here combine K such iterators
//! into one sorted, deduplicated sequence.
//!
//! # Merge order
//!
//! Sources are passed oldest first. When several sources hold the same
//! entry, the entry from the newest (last) source wins, which decides the
//! merged `deleted` flag:
//!
//! ```text
//! source 0: cpu{host=a}  cpu{host=b}
//! source 1:              cpu{host=b}*   mem{host=a}      (* deleted)
//!  merged : cpu{host=a}  cpu{host=b}*   mem{host=a}
//! ```
//!
//! Tag keys present in several sources have their value iterators merged
//! recursively.

use crate::tsi::error::{IndexError, IndexResult};
use crate::tsi::series::{append_series_key, compare_series, Tags};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fmt;

pub type MeasurementIter<'a> = Box<dyn Iterator<Item = IndexResult<MeasurementElem>> + 'a>;
pub type TagKeyIter<'a> = Box<dyn Iterator<Item = IndexResult<TagKeyElem<'a>>> + 'a>;
pub type TagValueIter<'a> = Box<dyn Iterator<Item = IndexResult<TagValueElem>> + 'a>;
pub type SeriesIter<'a> = Box<dyn Iterator<Item = IndexResult<SeriesElem>> + 'a>;

/// A measurement name with its tombstone flag
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeasurementElem {
    pub name: Vec<u8>,
    pub deleted: bool,
}

/// A tag key with its tombstone flag and the iterator over its values
pub struct TagKeyElem<'a> {
    pub key: Vec<u8>,
    pub deleted: bool,
    pub values: TagValueIter<'a>,
}

impl fmt::Debug for TagKeyElem<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TagKeyElem")
            .field("key", &String::from_utf8_lossy(&self.key))
            .field("deleted", &self.deleted)
            .finish()
    }
}

/// A tag value with its tombstone flag
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagValueElem {
    pub value: Vec<u8>,
    pub deleted: bool,
}

/// A series with its tombstone flag
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeriesElem {
    pub name: Vec<u8>,
    pub tags: Tags,
    pub deleted: bool,
}

impl SeriesElem {
    pub fn new(name: impl Into<Vec<u8>>, tags: Tags, deleted: bool) -> Self {
        Self {
            name: name.into(),
            tags,
            deleted,
        }
    }

    /// Append this series' key to `dst`
    pub fn append_key(&self, dst: &mut Vec<u8>) {
        append_series_key(dst, &self.name, &self.tags);
    }
}

/// Ordering used to line up equal entries across sources
trait MergeOrd {
    fn merge_cmp(&self, other: &Self) -> Ordering;
}

impl MergeOrd for MeasurementElem {
    fn merge_cmp(&self, other: &Self) -> Ordering {
        self.name.cmp(&other.name)
    }
}

impl MergeOrd for TagKeyElem<'_> {
    fn merge_cmp(&self, other: &Self) -> Ordering {
        self.key.cmp(&other.key)
    }
}

impl MergeOrd for TagValueElem {
    fn merge_cmp(&self, other: &Self) -> Ordering {
        self.value.cmp(&other.value)
    }
}

impl MergeOrd for SeriesElem {
    fn merge_cmp(&self, other: &Self) -> Ordering {
        compare_series(&self.name, &self.tags, &other.name, &other.tags)
    }
}

type SourceIter<'a, T> = Box<dyn Iterator<Item = IndexResult<T>> + 'a>;

struct HeapEntry<'a, T> {
    head: T,
    source: usize,
    iter: SourceIter<'a, T>,
}

impl<T: MergeOrd> PartialEq for HeapEntry<'_, T> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<T: MergeOrd> Eq for HeapEntry<'_, T> {}

impl<T: MergeOrd> PartialOrd for HeapEntry<'_, T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T: MergeOrd> Ord for HeapEntry<'_, T> {
    // BinaryHeap is a max-heap: smallest key, then lowest source, pops first.
    fn cmp(&self, other: &Self) -> Ordering {
        self.head
            .merge_cmp(&other.head)
            .then_with(|| self.source.cmp(&other.source))
            .reverse()
    }
}

/// All entries sharing one key: `newest` from the last source holding it,
/// `shadowed` from earlier sources in source order.
struct Merged<T> {
    newest: T,
    shadowed: Vec<T>,
}

struct MergeGroups<'a, T> {
    heap: BinaryHeap<HeapEntry<'a, T>>,
    err: Option<IndexError>,
    done: bool,
}

impl<'a, T: MergeOrd> MergeGroups<'a, T> {
    fn new(iters: Vec<SourceIter<'a, T>>) -> Self {
        let mut groups = Self {
            heap: BinaryHeap::with_capacity(iters.len()),
            err: None,
            done: false,
        };
        for (source, iter) in iters.into_iter().enumerate() {
            groups.advance(source, iter);
        }
        groups
    }

    fn advance(&mut self, source: usize, mut iter: SourceIter<'a, T>) {
        match iter.next() {
            Some(Ok(head)) => self.heap.push(HeapEntry { head, source, iter }),
            Some(Err(e)) => {
                if self.err.is_none() {
                    self.err = Some(e);
                }
            }
            None => {}
        }
    }
}

impl<T: MergeOrd> Iterator for MergeGroups<'_, T> {
    type Item = IndexResult<Merged<T>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if let Some(e) = self.err.take() {
            self.done = true;
            return Some(Err(e));
        }

        let first = self.heap.pop()?;
        let mut merged = Merged {
            newest: first.head,
            shadowed: Vec::new(),
        };
        self.advance(first.source, first.iter);

        while self
            .heap
            .peek()
            .map_or(false, |e| e.head.merge_cmp(&merged.newest) == Ordering::Equal)
        {
            if let Some(entry) = self.heap.pop() {
                let older = std::mem::replace(&mut merged.newest, entry.head);
                merged.shadowed.push(older);
                self.advance(entry.source, entry.iter);
            }
        }

        Some(Ok(merged))
    }
}

/// Merge measurement iterators; newest source decides `deleted`
pub fn merge_measurement_iterators<'a>(iters: Vec<MeasurementIter<'a>>) -> MeasurementIter<'a> {
    Box::new(MergeGroups::new(iters).map(|r| r.map(|m| m.newest)))
}

/// Merge series iterators; newest source decides `deleted`
pub fn merge_series_iterators<'a>(iters: Vec<SeriesIter<'a>>) -> SeriesIter<'a> {
    Box::new(MergeGroups::new(iters).map(|r| r.map(|m| m.newest)))
}

/// Merge tag value iterators; newest source decides `deleted`
pub fn merge_tag_value_iterators<'a>(iters: Vec<TagValueIter<'a>>) -> TagValueIter<'a> {
    Box::new(MergeGroups::new(iters).map(|r| r.map(|m| m.newest)))
}

/// Merge tag key iterators. The merged key's values are the merge of the
/// value iterators of every source holding that key.
pub fn merge_tag_key_iterators<'a>(iters: Vec<TagKeyIter<'a>>) -> TagKeyIter<'a> {
    Box::new(MergeGroups::new(iters).map(|r| {
        r.map(|m| {
            let mut values: Vec<TagValueIter<'a>> = m.shadowed.into_iter().map(|k| k.values).collect();
            values.push(m.newest.values);
            TagKeyElem {
                key: m.newest.key,
                deleted: m.newest.deleted,
                values: merge_tag_value_iterators(values),
            }
        })
    }))
}

/// An iterator that yields nothing
pub fn empty_iter<'a, T: 'a>() -> Box<dyn Iterator<Item = IndexResult<T>> + 'a> {
    Box::new(std::iter::empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn measurements(items: &[(&str, bool)]) -> MeasurementIter<'static> {
        let v: Vec<IndexResult<MeasurementElem>> = items
            .iter()
            .map(|(n, d)| {
                Ok(MeasurementElem {
                    name: n.as_bytes().to_vec(),
                    deleted: *d,
                })
            })
            .collect();
        Box::new(v.into_iter())
    }

    fn values(items: &[(&str, bool)]) -> TagValueIter<'static> {
        let v: Vec<IndexResult<TagValueElem>> = items
            .iter()
            .map(|(n, d)| {
                Ok(TagValueElem {
                    value: n.as_bytes().to_vec(),
                    deleted: *d,
                })
            })
            .collect();
        Box::new(v.into_iter())
    }

    fn series(name: &str, host: &str, deleted: bool) -> SeriesElem {
        SeriesElem::new(name, Tags::from_pairs([("host", host)]), deleted)
    }

    #[test]
    fn test_merge_empty() {
        let mut itr = merge_measurement_iterators(Vec::new());
        assert!(itr.next().is_none());
    }

    #[test]
    fn test_merge_measurements_sorted_deduplicated() {
        let itr = merge_measurement_iterators(vec![
            measurements(&[("cpu", false), ("disk", false)]),
            measurements(&[("cpu", false), ("mem", false)]),
            measurements(&[("aaa", false)]),
        ]);

        let names: Vec<Vec<u8>> = itr.map(|m| m.unwrap().name).collect();
        assert_eq!(
            names,
            vec![b"aaa".to_vec(), b"cpu".to_vec(), b"disk".to_vec(), b"mem".to_vec()]
        );
    }

    #[test]
    fn test_merge_newest_source_wins() {
        let itr = merge_measurement_iterators(vec![
            measurements(&[("cpu", false), ("mem", true)]),
            measurements(&[("cpu", true), ("mem", false)]),
        ]);

        let merged: Vec<MeasurementElem> = itr.map(|m| m.unwrap()).collect();
        assert_eq!(merged.len(), 2);
        assert!(merged[0].deleted);
        assert!(!merged[1].deleted);
    }

    #[test]
    fn test_merge_series() {
        let a: SeriesIter<'static> = Box::new(
            vec![Ok(series("cpu", "a", false)), Ok(series("cpu", "b", false))].into_iter(),
        );
        let b: SeriesIter<'static> = Box::new(
            vec![Ok(series("cpu", "b", true)), Ok(series("mem", "a", false))].into_iter(),
        );

        let merged: Vec<SeriesElem> = merge_series_iterators(vec![a, b])
            .map(|s| s.unwrap())
            .collect();

        assert_eq!(
            merged,
            vec![
                series("cpu", "a", false),
                series("cpu", "b", true),
                series("mem", "a", false),
            ]
        );
    }

    #[test]
    fn test_merge_tag_keys_unions_values() {
        let a: TagKeyIter<'static> = Box::new(
            vec![Ok(TagKeyElem {
                key: b"host".to_vec(),
                deleted: false,
                values: values(&[("a", false), ("c", false)]),
            })]
            .into_iter(),
        );
        let b: TagKeyIter<'static> = Box::new(
            vec![
                Ok(TagKeyElem {
                    key: b"host".to_vec(),
                    deleted: true,
                    values: values(&[("b", false), ("c", true)]),
                }),
                Ok(TagKeyElem {
                    key: b"region".to_vec(),
                    deleted: false,
                    values: values(&[("us", false)]),
                }),
            ]
            .into_iter(),
        );

        let mut keys = merge_tag_key_iterators(vec![a, b]);

        let host = keys.next().unwrap().unwrap();
        assert_eq!(host.key, b"host");
        assert!(host.deleted);
        let vals: Vec<TagValueElem> = host.values.map(|v| v.unwrap()).collect();
        assert_eq!(vals.len(), 3);
        assert_eq!(vals[0].value, b"a");
        assert_eq!(vals[1].value, b"b");
        assert_eq!(vals[2].value, b"c");
        assert!(vals[2].deleted);

        let region = keys.next().unwrap().unwrap();
        assert_eq!(region.key, b"region");
        assert!(keys.next().is_none());
    }

    #[test]
    fn test_merge_propagates_error_and_stops() {
        let good = measurements(&[("cpu", false), ("mem", false)]);
        let bad: MeasurementIter<'static> = Box::new(
            vec![
                Ok(MeasurementElem {
                    name: b"aaa".to_vec(),
                    deleted: false,
                }),
                Err(IndexError::Corruption("broken".into())),
            ]
            .into_iter(),
        );

        let results: Vec<IndexResult<MeasurementElem>> =
            merge_measurement_iterators(vec![good, bad]).collect();

        assert!(results[0].is_ok());
        assert!(matches!(results[1], Err(IndexError::Corruption(_))));
        assert_eq!(results.len(), 2);
    }
}
