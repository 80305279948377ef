//! Record-oriented, append-only table storage for stampdb.
//!
//! Layering, bottom up:
//!
//! - [`repo`]: named random-access files (filesystem or in-memory)
//! - [`record`]: the physical record codec
//! - [`tablefile`]: block-structured append-only table files
//! - [`datamap`]: refcounted block windows with a shared byte budget
//! - [`index`]: rebuildable ordered indexes plus their sidecar files
//! - [`wal`]: the per-database write-ahead log
//!
//! Every stored record is stamped with a 64-bit logical timestamp; the
//! transaction layer above decides which stamps a reader may see. This
//! crate only promises that appends are block-aligned, replayable from
//! the log, and readable through stable windows.

pub mod datamap;
pub mod error;
pub mod index;
pub mod record;
pub mod repo;
pub mod tablefile;
pub mod wal;

pub use datamap::{DataMapCache, MapBudget, MapRef};
pub use error::{IndexError, RecordError, TableFileError, WalError};
pub use record::{content_hash, Record, RecordBuilder};
pub use repo::{Fs, Memory, Repo, TableStorage};
pub use tablefile::{CreateOptions, RecordCursor, TableFile, TableHead};
pub use wal::{LogReader, Wal};
