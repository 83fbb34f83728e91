//! # Chronicle TSI
//!
//! Time-series index files and their compaction.
//!
//! ## Features
//!
//! - **Immutable index files**: Series, tag and measurement blocks behind a checksummed trailer
//! - **Merged views**: Sorted k-way merge over any number of files, newest tombstones win
//! - **Compaction**: Three-pass writer producing one self-consistent file from many
//! - **Atomic output**: Temp file, fsync and rename
//!
//! ## Modules
//!
//! - [`tsi`]: Index file format, merge iterators and compaction
//! - [`config`]: TOML configuration
//! - [`logging`]: Tracing subscriber setup
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use chronicle_tsi::{CompactionConfig, IndexFileHandle, IndexFiles};
//! use std::sync::Arc;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Open two existing files, oldest first
//!     let a = Arc::new(IndexFileHandle::open(1, "index/L0-00000001.tsi")?);
//!     let b = Arc::new(IndexFileHandle::open(2, "index/L0-00000002.tsi")?);
//!
//!     let files = IndexFiles::new(vec![a, b]);
//!     files.retain();
//!     let n = files.compact_to("index/L1-00000003.tsi", &CompactionConfig::default());
//!     files.release();
//!
//!     println!("Wrote {} bytes", n?);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod logging;
pub mod tsi;

// Re-export top-level types for convenience
pub use tsi::{
    IndexError, IndexFile, IndexFileHandle, IndexFiles, IndexFilesInfo, IndexResult,
    MemIndexFile, SeriesElem, Tag, Tags,
};

pub use config::{CompactionConfig, Config, ConfigError, LoggingConfig};

pub use logging::init_logging;
