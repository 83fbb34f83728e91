//! Index file handles
//!
//! [`IndexFile`] is the capability the compaction writer needs from a
//! source: identity, reference counting and sorted iterators. It is
//! implemented by [`IndexFileHandle`] for finished on-disk files and by
//! [`MemIndexFile`](crate::tsi::MemIndexFile) for in-memory segments.
//!
//! Iterator factories return `None` when the file holds no data for the
//! query.

use crate::tsi::error::{IndexError, IndexResult};
use crate::tsi::iter::{
    MeasurementElem, MeasurementIter, SeriesElem, SeriesIter, TagKeyElem, TagKeyIter,
    TagValueElem,
};
use crate::tsi::measurement_block::{MeasurementBlock, MeasurementEntry};
use crate::tsi::series::Tags;
use crate::tsi::series_block::SeriesBlock;
use crate::tsi::tag_block::TagBlock;
use crate::tsi::trailer::{BlockPos, IndexFileTrailer, FILE_SIGNATURE};
use memmap2::Mmap;
use std::fmt;
use std::fs::File;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

/// A source of index data that can take part in a compaction
pub trait IndexFile {
    /// Monotonically assigned file identifier
    fn id(&self) -> u64;

    /// Location of the file on disk
    fn path(&self) -> &Path;

    /// Add a reference
    fn retain(&self);

    /// Drop a reference
    fn release(&self);

    fn measurement_iterator(&self) -> Option<MeasurementIter<'_>>;

    fn tag_key_iterator(&self, name: &[u8]) -> Option<TagKeyIter<'_>>;

    fn series_iterator(&self) -> Option<SeriesIter<'_>>;

    fn measurement_series_iterator(&self, name: &[u8]) -> Option<SeriesIter<'_>>;

    fn tag_value_series_iterator(
        &self,
        name: &[u8],
        key: &[u8],
        value: &[u8],
    ) -> Option<SeriesIter<'_>>;
}

/// Reference counter for shared file handles.
///
/// Reaching zero only makes the file eligible for removal; whoever observes
/// it does the removing.
#[derive(Debug, Default)]
pub struct RefCount(AtomicUsize);

impl RefCount {
    pub fn retain(&self) {
        self.0.fetch_add(1, Ordering::AcqRel);
    }

    /// Decrement, saturating at zero. Returns the new count.
    pub fn release(&self, file_id: u64) -> usize {
        match self
            .0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
        {
            Ok(prev) => prev - 1,
            Err(_) => {
                tracing::warn!(file_id, "release called on index file with no references");
                0
            }
        }
    }

    pub fn get(&self) -> usize {
        self.0.load(Ordering::Acquire)
    }
}

/// Wrap an error as a one-item iterator so it reaches the consumer
fn fail<'a, T: 'a>(err: IndexError) -> Box<dyn Iterator<Item = IndexResult<T>> + 'a> {
    Box::new(std::iter::once(Err(err)))
}

enum FileData {
    Mapped(Mmap),
    Owned(Vec<u8>),
}

impl Deref for FileData {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            FileData::Mapped(m) => &m[..],
            FileData::Owned(v) => &v[..],
        }
    }
}

fn region(data: &[u8], pos: BlockPos) -> IndexResult<&[u8]> {
    match pos.end() {
        Some(end) if end <= data.len() as u64 => Ok(&data[pos.offset as usize..end as usize]),
        _ => Err(IndexError::InvalidFile(format!(
            "block [{}, +{}) outside file of {} bytes",
            pos.offset,
            pos.size,
            data.len()
        ))),
    }
}

/// A finished, immutable index file
pub struct IndexFileHandle {
    id: u64,
    path: PathBuf,
    data: FileData,
    trailer: IndexFileTrailer,
    series_count: usize,
    measurement_count: usize,
    refs: RefCount,
}

impl IndexFileHandle {
    /// Memory-map and validate an index file
    pub fn open(id: u64, path: impl AsRef<Path>) -> IndexResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;

        // SAFETY: index files are immutable once written and are only
        // removed after every reference has been released.
        let mmap = unsafe { Mmap::map(&file)? };

        Self::with_data(id, path, FileData::Mapped(mmap))
    }

    /// Validate an index file held in memory
    pub fn from_bytes(id: u64, path: impl Into<PathBuf>, bytes: Vec<u8>) -> IndexResult<Self> {
        Self::with_data(id, path.into(), FileData::Owned(bytes))
    }

    fn with_data(id: u64, path: PathBuf, data: FileData) -> IndexResult<Self> {
        if data.len() < FILE_SIGNATURE.len() || &data[..FILE_SIGNATURE.len()] != FILE_SIGNATURE {
            return Err(IndexError::InvalidFile(format!(
                "{:?}: missing index file signature",
                path
            )));
        }

        let trailer = IndexFileTrailer::read(&data)?;

        let series = SeriesBlock::open(region(&data, trailer.series_block)?)?;
        let measurements = MeasurementBlock::open(region(&data, trailer.measurement_block)?)?;
        for entry in measurements.iter() {
            TagBlock::open(region(&data, entry?.tagset)?)?;
        }
        let series_count = series.len();
        let measurement_count = measurements.len();

        tracing::debug!(
            file_id = id,
            path = ?path,
            series = series_count,
            measurements = measurement_count,
            "Opened index file"
        );

        Ok(Self {
            id,
            path,
            series_count,
            measurement_count,
            data,
            trailer,
            refs: RefCount::default(),
        })
    }

    /// Current reference count
    pub fn ref_count(&self) -> usize {
        self.refs.get()
    }

    pub fn trailer(&self) -> &IndexFileTrailer {
        &self.trailer
    }

    /// File size in bytes
    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }

    /// Whether the file indexes no series and no measurements
    pub fn is_empty(&self) -> bool {
        self.series_count == 0 && self.measurement_count == 0
    }

    pub fn series_count(&self) -> usize {
        self.series_count
    }

    pub fn measurement_count(&self) -> usize {
        self.measurement_count
    }

    /// Raw file contents
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn series_block(&self) -> IndexResult<SeriesBlock<'_>> {
        SeriesBlock::open_unchecked(region(&self.data, self.trailer.series_block)?)
    }

    pub fn measurement_block(&self) -> IndexResult<MeasurementBlock<'_>> {
        MeasurementBlock::open_unchecked(region(&self.data, self.trailer.measurement_block)?)
    }

    /// Tag block at a file-relative position
    pub fn tag_block(&self, pos: BlockPos) -> IndexResult<TagBlock<'_>> {
        TagBlock::open_unchecked(region(&self.data, pos)?)
    }

    /// Id of a series, or 0 if absent
    pub fn series_id(&self, name: &[u8], tags: &Tags) -> IndexResult<u64> {
        self.series_block()?.offset(name, tags)
    }

    /// Series stored under `id`
    pub fn series_by_id(&self, id: u64) -> IndexResult<SeriesElem> {
        self.series_block()?.series_at(id)
    }

    /// Measurement entry by name
    pub fn measurement(&self, name: &[u8]) -> IndexResult<Option<MeasurementEntry<'_>>> {
        self.measurement_block()?.find(name)
    }

    fn resolve_ids(&self, ids: Vec<u64>) -> IndexResult<Option<SeriesIter<'_>>> {
        if ids.is_empty() {
            return Ok(None);
        }
        let series = self.series_block()?;
        Ok(Some(Box::new(ids.into_iter().map(move |id| series.series_at(id)))))
    }

    fn try_measurement_iterator(&self) -> IndexResult<Option<MeasurementIter<'_>>> {
        let block = self.measurement_block()?;
        if block.is_empty() {
            return Ok(None);
        }
        Ok(Some(Box::new(block.iter().map(|r| {
            r.map(|e| MeasurementElem {
                name: e.name.to_vec(),
                deleted: e.deleted,
            })
        }))))
    }

    fn try_tag_key_iterator(&self, name: &[u8]) -> IndexResult<Option<TagKeyIter<'_>>> {
        let Some(m) = self.measurement(name)? else {
            return Ok(None);
        };
        let block = self.tag_block(m.tagset)?;
        if block.is_empty() {
            return Ok(None);
        }
        Ok(Some(Box::new(block.keys().map(|r| {
            r.map(|k| TagKeyElem {
                key: k.key.to_vec(),
                deleted: k.deleted,
                values: Box::new(k.values().map(|v| {
                    v.map(|v| TagValueElem {
                        value: v.value.to_vec(),
                        deleted: v.deleted,
                    })
                })),
            })
        }))))
    }

    fn try_series_iterator(&self) -> IndexResult<Option<SeriesIter<'_>>> {
        let block = self.series_block()?;
        if block.is_empty() {
            return Ok(None);
        }
        Ok(Some(Box::new(block.iter())))
    }

    fn try_measurement_series_iterator(&self, name: &[u8]) -> IndexResult<Option<SeriesIter<'_>>> {
        match self.measurement(name)? {
            Some(m) => self.resolve_ids(m.series_ids),
            None => Ok(None),
        }
    }

    fn try_tag_value_series_iterator(
        &self,
        name: &[u8],
        key: &[u8],
        value: &[u8],
    ) -> IndexResult<Option<SeriesIter<'_>>> {
        let Some(m) = self.measurement(name)? else {
            return Ok(None);
        };
        match self.tag_block(m.tagset)?.find_value(key, value)? {
            Some(v) => self.resolve_ids(v.series_ids),
            None => Ok(None),
        }
    }
}

impl IndexFile for IndexFileHandle {
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
        self.try_measurement_iterator()
            .unwrap_or_else(|e| Some(fail(e)))
    }

    fn tag_key_iterator(&self, name: &[u8]) -> Option<TagKeyIter<'_>> {
        self.try_tag_key_iterator(name)
            .unwrap_or_else(|e| Some(fail(e)))
    }

    fn series_iterator(&self) -> Option<SeriesIter<'_>> {
        self.try_series_iterator().unwrap_or_else(|e| Some(fail(e)))
    }

    fn measurement_series_iterator(&self, name: &[u8]) -> Option<SeriesIter<'_>> {
        self.try_measurement_series_iterator(name)
            .unwrap_or_else(|e| Some(fail(e)))
    }

    fn tag_value_series_iterator(
        &self,
        name: &[u8],
        key: &[u8],
        value: &[u8],
    ) -> Option<SeriesIter<'_>> {
        self.try_tag_value_series_iterator(name, key, value)
            .unwrap_or_else(|e| Some(fail(e)))
    }
}

impl fmt::Debug for IndexFileHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IndexFileHandle")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("len", &self.data.len())
            .field("series", &self.series_count)
            .field("measurements", &self.measurement_count)
            .field("refs", &self.refs.get())
            .finish()
    }
}
