//! In-memory index segment
//!
//! Holds series and tombstones in sorted maps and exposes them through the
//! same [`IndexFile`] iterators as an on-disk file. Compacting a collection
//! of one `MemIndexFile` is how a fresh index file is produced from
//! recently written series.

use crate::tsi::file::{IndexFile, RefCount};
use crate::tsi::iter::{
    MeasurementElem, MeasurementIter, SeriesElem, SeriesIter, TagKeyElem, TagKeyIter,
    TagValueElem, TagValueIter,
};
use crate::tsi::series::Tags;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

/// Tag key → (deleted, values → deleted) for one measurement
type TagSet = BTreeMap<Vec<u8>, (bool, BTreeMap<Vec<u8>, bool>)>;

/// Mutable, in-memory index segment
#[derive(Debug)]
pub struct MemIndexFile {
    id: u64,
    path: PathBuf,
    series: BTreeMap<(Vec<u8>, Tags), bool>,
    measurement_tombstones: BTreeSet<Vec<u8>>,
    tag_key_tombstones: BTreeSet<(Vec<u8>, Vec<u8>)>,
    tag_value_tombstones: BTreeSet<(Vec<u8>, Vec<u8>, Vec<u8>)>,
    refs: RefCount,
}

impl MemIndexFile {
    pub fn new(id: u64, path: impl Into<PathBuf>) -> Self {
        Self {
            id,
            path: path.into(),
            series: BTreeMap::new(),
            measurement_tombstones: BTreeSet::new(),
            tag_key_tombstones: BTreeSet::new(),
            tag_value_tombstones: BTreeSet::new(),
            refs: RefCount::default(),
        }
    }

    /// Add a live series (clears an earlier tombstone for it)
    pub fn add_series(&mut self, name: impl AsRef<[u8]>, tags: Tags) {
        self.series.insert((name.as_ref().to_vec(), tags), false);
    }

    /// Record a series tombstone
    pub fn delete_series(&mut self, name: impl AsRef<[u8]>, tags: Tags) {
        self.series.insert((name.as_ref().to_vec(), tags), true);
    }

    pub fn delete_measurement(&mut self, name: impl AsRef<[u8]>) {
        self.measurement_tombstones.insert(name.as_ref().to_vec());
    }

    pub fn delete_tag_key(&mut self, name: impl AsRef<[u8]>, key: impl AsRef<[u8]>) {
        self.tag_key_tombstones
            .insert((name.as_ref().to_vec(), key.as_ref().to_vec()));
    }

    pub fn delete_tag_value(
        &mut self,
        name: impl AsRef<[u8]>,
        key: impl AsRef<[u8]>,
        value: impl AsRef<[u8]>,
    ) {
        self.tag_value_tombstones.insert((
            name.as_ref().to_vec(),
            key.as_ref().to_vec(),
            value.as_ref().to_vec(),
        ));
    }

    /// Number of series entries, tombstones included
    pub fn series_count(&self) -> usize {
        self.series.len()
    }

    pub fn ref_count(&self) -> usize {
        self.refs.get()
    }

    fn measurement_names(&self) -> BTreeSet<&[u8]> {
        self.series
            .keys()
            .map(|(name, _)| name.as_slice())
            .chain(self.measurement_tombstones.iter().map(|n| n.as_slice()))
            .chain(self.tag_key_tombstones.iter().map(|(n, _)| n.as_slice()))
            .chain(self.tag_value_tombstones.iter().map(|(n, _, _)| n.as_slice()))
            .collect()
    }

    fn measurement_series(&self, name: &[u8]) -> impl Iterator<Item = (&Tags, bool)> + '_ {
        let name = name.to_vec();
        self.series
            .range((name.clone(), Tags::default())..)
            .take_while(move |((n, _), _)| *n == name)
            .map(|((_, tags), deleted)| (tags, *deleted))
    }

    fn tag_set(&self, name: &[u8]) -> TagSet {
        let mut set = TagSet::new();
        for (tags, _) in self.measurement_series(name) {
            for tag in tags {
                set.entry(tag.key.clone())
                    .or_default()
                    .1
                    .insert(tag.value.clone(), false);
            }
        }

        for (n, key) in &self.tag_key_tombstones {
            if n.as_slice() == name {
                set.entry(key.clone()).or_default().0 = true;
            }
        }
        for (n, key, value) in &self.tag_value_tombstones {
            if n.as_slice() == name {
                set.entry(key.clone()).or_default().1.insert(value.clone(), true);
            }
        }
        set
    }

    fn series_vec_iter<'a>(&self, series: Vec<SeriesElem>) -> Option<SeriesIter<'a>> {
        if series.is_empty() {
            return None;
        }
        Some(Box::new(series.into_iter().map(Ok)))
    }
}

impl IndexFile for MemIndexFile {
    fn id(&self) -> u64 {
        self.id
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn retain(&self) {
        self.refs.retain();
    }

    fn release(&self) {
        self.refs.release(self.id);
    }

    fn measurement_iterator(&self) -> Option<MeasurementIter<'_>> {
        let names = self.measurement_names();
        if names.is_empty() {
            return None;
        }
        let elems: Vec<MeasurementElem> = names
            .into_iter()
            .map(|name| MeasurementElem {
                deleted: self.measurement_tombstones.contains(name),
                name: name.to_vec(),
            })
            .collect();
        Some(Box::new(elems.into_iter().map(Ok)))
    }

    fn tag_key_iterator(&self, name: &[u8]) -> Option<TagKeyIter<'_>> {
        let set = self.tag_set(name);
        if set.is_empty() {
            return None;
        }
        let keys: Vec<TagKeyElem<'_>> = set
            .into_iter()
            .map(|(key, (deleted, values))| {
                let values: Vec<TagValueElem> = values
                    .into_iter()
                    .map(|(value, deleted)| TagValueElem { value, deleted })
                    .collect();
                let values: TagValueIter<'_> = Box::new(values.into_iter().map(Ok));
                TagKeyElem {
                    key,
                    deleted,
                    values,
                }
            })
            .collect();
        Some(Box::new(keys.into_iter().map(Ok)))
    }

    fn series_iterator(&self) -> Option<SeriesIter<'_>> {
        let series = self
            .series
            .iter()
            .map(|((name, tags), deleted)| SeriesElem::new(name.clone(), tags.clone(), *deleted))
            .collect();
        self.series_vec_iter(series)
    }

    fn measurement_series_iterator(&self, name: &[u8]) -> Option<SeriesIter<'_>> {
        let series = self
            .measurement_series(name)
            .map(|(tags, deleted)| SeriesElem::new(name, tags.clone(), deleted))
            .collect();
        self.series_vec_iter(series)
    }

    fn tag_value_series_iterator(
        &self,
        name: &[u8],
        key: &[u8],
        value: &[u8],
    ) -> Option<SeriesIter<'_>> {
        let series = self
            .measurement_series(name)
            .filter(|(tags, _)| tags.get(key) == Some(value))
            .map(|(tags, deleted)| SeriesElem::new(name, tags.clone(), deleted))
            .collect();
        self.series_vec_iter(series)
    }
}
