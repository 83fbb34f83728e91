//! Index file collections and compaction.
//!
//! An [`IndexFiles`] is an ordered set of index files, oldest first. It
//! merges the files' iterators into a single sorted view and can write that
//! view out as one new index file:
//!
//! 1. the series block, which assigns every series its id
//! 2. one tag block per measurement, in measurement order
//! 3. the measurement block, pointing at each tag block
//! 4. the trailer
//!
//! Every pass consumes a fresh merged iterator, so the output reflects the
//! union of all inputs with the newest file's tombstones winning.

use crate::config::CompactionConfig;
use crate::tsi::error::{IndexError, IndexResult};
use crate::tsi::file::{IndexFile, IndexFileHandle};
use crate::tsi::iter::{
    merge_measurement_iterators, merge_series_iterators, merge_tag_key_iterators,
    merge_tag_value_iterators, MeasurementIter, SeriesElem, SeriesIter, TagKeyIter, TagValueIter,
};
use crate::tsi::measurement_block::MeasurementBlockWriter;
use crate::tsi::series_block::{SeriesBlockEncoder, SeriesOffsets};
use crate::tsi::tag_block::TagBlockEncoder;
use crate::tsi::trailer::{BlockPos, IndexFileTrailer, FILE_SIGNATURE};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

/// Buffer size used by [`IndexFiles::write_to`]
pub const DEFAULT_WRITE_BUFFER_SIZE: usize = 64 * 1024;

/// Aggregate on-disk statistics for a collection
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexFilesInfo {
    /// Size of the largest file
    pub max_size: u64,
    /// Total size of all files
    pub size: u64,
    /// Most recent modification time, `None` if no file was found
    pub mod_time: Option<DateTime<Utc>>,
}

/// An ordered collection of index files, oldest first
pub struct IndexFiles<F: IndexFile + ?Sized = IndexFileHandle> {
    files: Vec<Arc<F>>,
}

impl<F: IndexFile + ?Sized> IndexFiles<F> {
    pub fn new(files: Vec<Arc<F>>) -> Self {
        Self { files }
    }

    pub fn files(&self) -> &[Arc<F>] {
        &self.files
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// File ids in collection order
    pub fn ids(&self) -> Vec<u64> {
        self.files.iter().map(|f| f.id()).collect()
    }

    /// Add a reference to every file
    pub fn retain(&self) {
        for f in &self.files {
            f.retain();
        }
    }

    /// Drop a reference from every file
    pub fn release(&self) {
        for f in &self.files {
            f.release();
        }
    }

    /// Sorted names of every measurement in the collection, tombstoned ones
    /// included
    pub fn measurement_names(&self) -> IndexResult<Vec<Vec<u8>>> {
        let mut names = self
            .measurement_iterator()
            .map(|m| m.map(|m| m.name))
            .collect::<IndexResult<Vec<_>>>()?;
        names.sort();
        Ok(names)
    }

    pub fn measurement_iterator(&self) -> MeasurementIter<'_> {
        merge_measurement_iterators(
            self.files
                .iter()
                .filter_map(|f| f.measurement_iterator())
                .collect(),
        )
    }

    pub fn tag_key_iterator(&self, name: &[u8]) -> TagKeyIter<'_> {
        merge_tag_key_iterators(
            self.files
                .iter()
                .filter_map(|f| f.tag_key_iterator(name))
                .collect(),
        )
    }

    pub fn series_iterator(&self) -> SeriesIter<'_> {
        merge_series_iterators(self.files.iter().filter_map(|f| f.series_iterator()).collect())
    }

    pub fn measurement_series_iterator(&self, name: &[u8]) -> SeriesIter<'_> {
        merge_series_iterators(
            self.files
                .iter()
                .filter_map(|f| f.measurement_series_iterator(name))
                .collect(),
        )
    }

    pub fn tag_value_series_iterator(&self, name: &[u8], key: &[u8], value: &[u8]) -> SeriesIter<'_> {
        merge_series_iterators(
            self.files
                .iter()
                .filter_map(|f| f.tag_value_series_iterator(name, key, value))
                .collect(),
        )
    }

    /// Values of one tag key merged across files
    pub fn tag_value_iterator(&self, name: &[u8], key: &[u8]) -> IndexResult<TagValueIter<'_>> {
        let mut values = Vec::new();
        for elem in self.tag_key_iterator(name) {
            let elem = elem?;
            if elem.key.as_slice() == key {
                values.push(elem.values);
            }
        }
        Ok(merge_tag_value_iterators(values))
    }

    /// Sum file sizes and find the newest modification time.
    ///
    /// Files that have disappeared from disk are skipped.
    pub fn stat(&self) -> IndexResult<IndexFilesInfo> {
        let mut info = IndexFilesInfo::default();
        for f in &self.files {
            let meta = match fs::metadata(f.path()) {
                Ok(meta) => meta,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    tracing::debug!(file_id = f.id(), path = ?f.path(), "Skipping missing index file");
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            let size = meta.len();
            info.size += size;
            info.max_size = info.max_size.max(size);

            let modified: DateTime<Utc> = meta.modified()?.into();
            if info.mod_time.map_or(true, |t| modified > t) {
                info.mod_time = Some(modified);
            }
        }
        Ok(info)
    }

    /// Compact the collection into `w`, returning bytes written.
    ///
    /// Only a successful call reports a byte count. On error the bytes
    /// already handed to `w` have no trailer and are not an index file, so
    /// no partial count is returned alongside the error.
    pub fn write_to<W: Write>(&self, w: W) -> IndexResult<u64> {
        self.write_to_with_capacity(w, DEFAULT_WRITE_BUFFER_SIZE)
    }

    /// Compact the collection into `w` through a buffer of `capacity` bytes
    pub fn write_to_with_capacity<W: Write>(&self, w: W, capacity: usize) -> IndexResult<u64> {
        let start = Instant::now();
        let mut bw = BufWriter::with_capacity(capacity, w);
        let mut trailer = IndexFileTrailer::default();
        let mut n = 0u64;

        bw.write_all(FILE_SIGNATURE)?;
        n += FILE_SIGNATURE.len() as u64;

        trailer.series_block.offset = n;
        let series = self.write_series_block(&mut bw)?;
        n += series.size();
        trailer.series_block.size = series.size();

        let mut ctx = CompactionContext::new(series);

        n = self.write_tagsets(&mut bw, &mut ctx, n)?;

        trailer.measurement_block.offset = n;
        let size = self.write_measurement_block(&mut bw, &mut ctx)?;
        n += size;
        trailer.measurement_block.size = size;

        n += trailer.write_to(&mut bw)?;
        bw.flush()?;

        tracing::info!(
            files = ?self.ids(),
            series = ctx.series.len(),
            measurements = ctx.tag_sets.len(),
            bytes = n,
            duration_ms = start.elapsed().as_millis() as u64,
            "Compacted index files"
        );

        Ok(n)
    }

    /// Compact the collection into a new file at `path`.
    ///
    /// Output goes to a sibling temp file that is renamed into place once
    /// complete, so `path` never holds a partial index.
    pub fn compact_to(&self, path: impl AsRef<Path>, config: &CompactionConfig) -> IndexResult<u64> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let tmp = temp_path(path, &config.temp_suffix);
        let result = self
            .write_file(&tmp, config)
            .and_then(|n| fs::rename(&tmp, path).map(|_| n).map_err(IndexError::from));

        let n = match result {
            Ok(n) => n,
            Err(e) => {
                if let Err(rm) = fs::remove_file(&tmp) {
                    if rm.kind() != io::ErrorKind::NotFound {
                        tracing::warn!(path = ?tmp, error = %rm, "Failed to remove temp file");
                    }
                }
                return Err(e);
            }
        };

        if config.sync_on_complete {
            sync_parent_dir(path)?;
        }

        tracing::debug!(path = ?path, bytes = n, "Index file written");
        Ok(n)
    }

    fn write_file(&self, path: &Path, config: &CompactionConfig) -> IndexResult<u64> {
        let file = File::create(path)?;
        let n = self.write_to_with_capacity(&file, config.write_buffer_size)?;
        if config.sync_on_complete {
            file.sync_all()?;
        }
        Ok(n)
    }

    fn write_series_block<W: Write>(&self, w: &mut W) -> IndexResult<SeriesOffsets> {
        let mut enc = SeriesBlockEncoder::new(&mut *w)?;
        for elem in self.series_iterator() {
            let elem = elem?;
            enc.encode(&elem.name, &elem.tags, elem.deleted)?;
        }
        enc.close()
    }

    /// Write every measurement's tag block, returning the new file offset
    fn write_tagsets<W: Write>(
        &self,
        w: &mut W,
        ctx: &mut CompactionContext,
        mut n: u64,
    ) -> IndexResult<u64> {
        for m in self.measurement_iterator() {
            let m = m?;
            let size = self.write_tagset(w, ctx, &m.name)?;
            ctx.tag_sets.insert(m.name, BlockPos::new(n, size));
            n += size;
        }
        Ok(n)
    }

    fn write_tagset<W: Write>(
        &self,
        w: &mut W,
        ctx: &mut CompactionContext,
        name: &[u8],
    ) -> IndexResult<u64> {
        let mut enc = TagBlockEncoder::new(&mut *w);
        for key in self.tag_key_iterator(name) {
            let key = key?;
            enc.encode_key(&key.key, key.deleted)?;

            for value in key.values {
                let value = value?;
                let ids = ctx.resolve_series_ids(
                    self.tag_value_series_iterator(name, &key.key, &value.value),
                )?;
                enc.encode_value(&value.value, value.deleted, &ids)?;
            }
        }
        enc.close()
    }

    fn write_measurement_block<W: Write>(
        &self,
        w: &mut W,
        ctx: &mut CompactionContext,
    ) -> IndexResult<u64> {
        let mut mw = MeasurementBlockWriter::new();
        for m in self.measurement_iterator() {
            let m = m?;
            let ids = ctx.resolve_series_ids(self.measurement_series_iterator(&m.name))?;
            let pos = ctx.tagset(&m.name)?;
            mw.add(&m.name, m.deleted, pos.offset, pos.size, ids)?;
        }
        mw.write_to(&mut *w)
    }
}

impl<F: IndexFile + ?Sized> Clone for IndexFiles<F> {
    fn clone(&self) -> Self {
        Self {
            files: self.files.clone(),
        }
    }
}

impl<F: IndexFile + ?Sized> fmt::Debug for IndexFiles<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IndexFiles")
            .field("ids", &self.ids())
            .finish()
    }
}

/// State shared between the passes of one compaction
struct CompactionContext {
    series: SeriesOffsets,
    tag_sets: HashMap<Vec<u8>, BlockPos>,
    key_buf: Vec<u8>,
}

impl CompactionContext {
    fn new(series: SeriesOffsets) -> Self {
        Self {
            series,
            tag_sets: HashMap::new(),
            key_buf: Vec::new(),
        }
    }

    /// Id assigned to `elem` by the series pass
    fn series_id(&mut self, elem: &SeriesElem) -> IndexResult<u64> {
        self.key_buf.clear();
        elem.append_key(&mut self.key_buf);

        match self.series.offset(&self.key_buf) {
            0 => {
                let name = String::from_utf8_lossy(&elem.name).into_owned();
                let tags = elem.tags.to_string();
                tracing::error!(measurement = %name, tags = %tags, "Series missing from series block");
                Err(IndexError::SeriesIdNotFound { name, tags })
            }
            id => Ok(id),
        }
    }

    /// Resolve every series of `itr` to its id, sorted ascending
    fn resolve_series_ids(&mut self, itr: SeriesIter<'_>) -> IndexResult<Vec<u64>> {
        let mut ids = Vec::new();
        for elem in itr {
            ids.push(self.series_id(&elem?)?);
        }
        ids.sort_unstable();
        Ok(ids)
    }

    fn tagset(&self, name: &[u8]) -> IndexResult<BlockPos> {
        self.tag_sets.get(name).copied().ok_or_else(|| {
            IndexError::TagSetNotFound(String::from_utf8_lossy(name).into_owned())
        })
    }
}

fn temp_path(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".");
    name.push(suffix);
    PathBuf::from(name)
}

#[cfg(unix)]
fn sync_parent_dir(path: &Path) -> io::Result<()> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
fn sync_parent_dir(_path: &Path) -> io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tsi::file::RefCount;
    use crate::tsi::iter::{empty_iter, MeasurementElem};
    use crate::tsi::series::Tags;
    use crate::tsi::MemIndexFile;
    use tempfile::tempdir;

    fn host(h: &str) -> Tags {
        Tags::from_pairs([("host", h)])
    }

    fn mem_file(id: u64, series: &[(&str, &str)]) -> MemIndexFile {
        let mut f = MemIndexFile::new(id, format!("mem-{}", id));
        for (name, h) in series {
            f.add_series(*name, host(h));
        }
        f
    }

    #[test]
    fn test_ids_and_len() {
        let files = IndexFiles::new(vec![
            Arc::new(mem_file(3, &[])),
            Arc::new(mem_file(1, &[])),
        ]);
        assert_eq!(files.ids(), vec![3, 1]);
        assert_eq!(files.len(), 2);
        assert!(!files.is_empty());
        assert!(IndexFiles::<MemIndexFile>::new(vec![]).is_empty());
    }

    #[test]
    fn test_retain_release_every_file() {
        let a = Arc::new(mem_file(1, &[]));
        let b = Arc::new(mem_file(2, &[]));
        let files = IndexFiles::new(vec![a.clone(), b.clone()]);

        files.retain();
        files.retain();
        files.release();
        assert_eq!(a.ref_count(), 1);
        assert_eq!(b.ref_count(), 1);

        files.release();
        files.release();
        assert_eq!(a.ref_count(), 0);

        let empty = IndexFiles::<MemIndexFile>::new(vec![]);
        empty.retain();
        empty.release();
    }

    #[test]
    fn test_measurement_names_merged() {
        let a = mem_file(1, &[("mem", "a"), ("cpu", "a")]);
        let mut b = mem_file(2, &[("disk", "a"), ("cpu", "b")]);
        b.delete_measurement("net");

        let files = IndexFiles::new(vec![Arc::new(a), Arc::new(b)]);
        let names = files.measurement_names().unwrap();
        assert_eq!(
            names,
            vec![b"cpu".to_vec(), b"disk".to_vec(), b"mem".to_vec(), b"net".to_vec()]
        );
    }

    #[test]
    fn test_tag_value_iterator_merges_sources() {
        let a = mem_file(1, &[("cpu", "a"), ("cpu", "c")]);
        let mut b = mem_file(2, &[("cpu", "b")]);
        b.delete_tag_value("cpu", "host", "c");

        let files = IndexFiles::new(vec![Arc::new(a), Arc::new(b)]);
        let values: Vec<(Vec<u8>, bool)> = files
            .tag_value_iterator(b"cpu", b"host")
            .unwrap()
            .map(|v| v.map(|v| (v.value, v.deleted)).unwrap())
            .collect();
        assert_eq!(
            values,
            vec![
                (b"a".to_vec(), false),
                (b"b".to_vec(), false),
                (b"c".to_vec(), true)
            ]
        );
        assert_eq!(files.tag_value_iterator(b"cpu", b"region").unwrap().count(), 0);
    }

    #[test]
    fn test_write_empty_collection() {
        let files = IndexFiles::<MemIndexFile>::new(vec![]);
        let mut out = Vec::new();
        let n = files.write_to(&mut out).unwrap();
        assert_eq!(n as usize, out.len());

        let file = IndexFileHandle::from_bytes(1, "empty.tsi", out).unwrap();
        assert!(file.is_empty());
        assert_eq!(file.size(), n);
        assert_eq!(file.series_count(), 0);
        assert_eq!(file.measurement_count(), 0);
        assert!(file.measurement_iterator().is_none());
        assert!(file.series_iterator().is_none());
    }

    #[test]
    fn test_write_small_buffer() {
        let files = IndexFiles::new(vec![Arc::new(mem_file(
            1,
            &[("cpu", "a"), ("cpu", "b"), ("mem", "a")],
        ))]);

        let mut small = Vec::new();
        let mut large = Vec::new();
        files.write_to_with_capacity(&mut small, 1).unwrap();
        files.write_to(&mut large).unwrap();
        assert_eq!(small, large);
    }

    #[test]
    fn test_stat() {
        let dir = tempdir().unwrap();
        let a_path = dir.path().join("a.tsi");
        let b_path = dir.path().join("b.tsi");
        fs::write(&a_path, vec![0u8; 100]).unwrap();
        fs::write(&b_path, vec![0u8; 250]).unwrap();

        let files = IndexFiles::new(vec![
            Arc::new(MemIndexFile::new(1, &a_path)),
            Arc::new(MemIndexFile::new(2, &b_path)),
            Arc::new(MemIndexFile::new(3, dir.path().join("gone.tsi"))),
        ]);

        let info = files.stat().unwrap();
        assert_eq!(info.size, 350);
        assert_eq!(info.max_size, 250);
        assert!(info.mod_time.is_some());
    }

    #[test]
    fn test_stat_nothing_on_disk() {
        let dir = tempdir().unwrap();
        let files = IndexFiles::new(vec![Arc::new(MemIndexFile::new(
            1,
            dir.path().join("missing.tsi"),
        ))]);
        assert_eq!(files.stat().unwrap(), IndexFilesInfo::default());
    }

    #[test]
    fn test_stat_surfaces_other_errors() {
        let dir = tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        fs::write(&blocker, b"x").unwrap();

        let files = IndexFiles::new(vec![Arc::new(MemIndexFile::new(
            1,
            blocker.join("child.tsi"),
        ))]);
        assert!(matches!(files.stat(), Err(IndexError::Io(_))));
    }

    #[test]
    fn test_compact_to_leaves_no_temp_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("index-1.tsi");
        let config = CompactionConfig::default();

        let files = IndexFiles::new(vec![Arc::new(mem_file(1, &[("cpu", "a")]))]);
        let n = files.compact_to(&path, &config).unwrap();

        assert_eq!(fs::metadata(&path).unwrap().len(), n);
        assert!(!temp_path(&path, &config.temp_suffix).exists());
    }

    /// Source whose measurement iterator fails after the series pass
    struct FailingMeasurements {
        inner: MemIndexFile,
        refs: RefCount,
    }

    impl IndexFile for FailingMeasurements {
        fn id(&self) -> u64 {
            self.inner.id()
        }

        fn path(&self) -> &Path {
            self.inner.path()
        }

        fn retain(&self) {
            self.refs.retain();
        }

        fn release(&self) {
            self.refs.release(self.id());
        }

        fn measurement_iterator(&self) -> Option<MeasurementIter<'_>> {
            let items: Vec<IndexResult<MeasurementElem>> =
                vec![Err(IndexError::Corruption("bad measurement".into()))];
            Some(Box::new(items.into_iter()))
        }

        fn tag_key_iterator(&self, _name: &[u8]) -> Option<TagKeyIter<'_>> {
            Some(empty_iter())
        }

        fn series_iterator(&self) -> Option<SeriesIter<'_>> {
            self.inner.series_iterator()
        }

        fn measurement_series_iterator(&self, name: &[u8]) -> Option<SeriesIter<'_>> {
            self.inner.measurement_series_iterator(name)
        }

        fn tag_value_series_iterator(
            &self,
            name: &[u8],
            key: &[u8],
            value: &[u8],
        ) -> Option<SeriesIter<'_>> {
            self.inner.tag_value_series_iterator(name, key, value)
        }
    }

    #[test]
    fn test_compact_to_removes_temp_file_on_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("index-2.tsi");
        let config = CompactionConfig::default();

        let source = FailingMeasurements {
            inner: mem_file(1, &[("cpu", "a")]),
            refs: RefCount::default(),
        };
        let files = IndexFiles::new(vec![Arc::new(source)]);

        let err = files.compact_to(&path, &config).unwrap_err();
        assert!(matches!(err, IndexError::Corruption(_)));
        assert!(!path.exists());
        assert!(!temp_path(&path, &config.temp_suffix).exists());
    }

    #[test]
    fn test_temp_path() {
        assert_eq!(
            temp_path(Path::new("/data/index-3.tsi"), "compacting"),
            PathBuf::from("/data/index-3.tsi.compacting")
        );
    }
}
