//! Series index files
//!
//! This module provides the on-disk series index and its compaction:
//!
//! - **series**: Tags and series key encoding
//! - **series_block**: Series block, the source of series ids
//! - **tag_block**: Per-measurement tag keys, values and their series
//! - **measurement_block**: Measurement entries pointing at tag blocks
//! - **trailer**: File signature and trailer
//! - **iter**: Element types and k-way merge iterators
//! - **file**: The `IndexFile` trait and memory-mapped file handles
//! - **mem**: In-memory index segment
//! - **index_files**: File collections and compaction
//! - **error**: Error types
//!
//! # Architecture
//!
//! ```text
//! Compaction:
//!   IndexFiles → merge → series block → tag blocks → measurement block → trailer
//!
//! Lookup:
//!   measurement block → tag block → series ids → series block
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use chronicle_tsi::config::CompactionConfig;
//! use chronicle_tsi::tsi::{IndexFileHandle, IndexFiles, MemIndexFile, Tags};
//! use std::sync::Arc;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut mem = MemIndexFile::new(1, "index-1.tsi");
//!     mem.add_series("cpu", Tags::from_pairs([("host", "a")]));
//!
//!     let files = IndexFiles::new(vec![Arc::new(mem)]);
//!     files.compact_to("./index/index-1.tsi", &CompactionConfig::default())?;
//!
//!     let file = IndexFileHandle::open(1, "./index/index-1.tsi")?;
//!     println!("{} series", file.series_count());
//!     Ok(())
//! }
//! ```

mod encoding;
pub mod error;
pub mod file;
pub mod index_files;
pub mod iter;
pub mod measurement_block;
pub mod mem;
pub mod series;
pub mod series_block;
pub mod tag_block;
pub mod trailer;

pub use error::{IndexError, IndexResult};
pub use file::{IndexFile, IndexFileHandle, RefCount};
pub use index_files::{IndexFiles, IndexFilesInfo, DEFAULT_WRITE_BUFFER_SIZE};
pub use iter::{
    empty_iter, merge_measurement_iterators, merge_series_iterators, merge_tag_key_iterators,
    merge_tag_value_iterators, MeasurementElem, MeasurementIter, SeriesElem, SeriesIter,
    TagKeyElem, TagKeyIter, TagValueElem, TagValueIter,
};
pub use measurement_block::{MeasurementBlock, MeasurementBlockWriter, MeasurementEntry};
pub use mem::MemIndexFile;
pub use series::{append_series_key, compare_series, parse_series_key, series_key, Tag, Tags};
pub use series_block::{SeriesBlock, SeriesBlockEncoder, SeriesOffsets};
pub use tag_block::{TagBlock, TagBlockEncoder, TagKeyEntry, TagValueEntry};
pub use trailer::{BlockPos, IndexFileTrailer, FILE_SIGNATURE, TRAILER_SIZE};
