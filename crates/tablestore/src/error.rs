use std::io;

use stampdb_primitives::{ColId, DbOff, VTableId};
use thiserror::Error;

/// Error produced while decoding a physical record.
#[derive(Debug, Error)]
pub enum RecordError {
    #[error("bad record magic {found:#04x} at offset {offset}")]
    BadMagic { offset: DbOff, found: u8 },
    #[error("record at offset {offset} overruns its buffer (size={size})")]
    Truncated { offset: DbOff, size: i32 },
    #[error("record flags {0:#04x} name more than one operation")]
    BadFlags(u8),
    #[error("column {0:?} appears twice in one record")]
    DuplicateColumn(ColId),
    #[error("column headers are not sorted by id")]
    UnsortedColumns,
    #[error("column {col:?} extends past the record end")]
    ColumnOverrun { col: ColId },
}

/// Error produced by the physical table file layer.
#[derive(Debug, Error)]
pub enum TableFileError {
    #[error("bad table magic {0:#010x}")]
    BadMagic(u32),
    #[error("unsupported table version {0}")]
    BadVersion(i32),
    #[error("bad block type {0}")]
    BadBlockType(i32),
    #[error("table file was truncated: header claims {claimed} bytes, file has {actual}")]
    Truncated { claimed: DbOff, actual: DbOff },
    #[error("table file corrupt: {0}")]
    Corrupt(String),
    #[error("block size {0} is not a power of two in [4KiB, 8MiB]")]
    BadBlockSize(i32),
    #[error("record of {size} bytes does not fit a {block_size} byte block")]
    RecordTooLarge { size: usize, block_size: i32 },
    #[error(transparent)]
    Record(#[from] RecordError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Error produced by the index layer.
#[derive(Debug, Error)]
pub enum IndexError {
    #[error("bad index magic {0:#010x}")]
    BadMagic(u32),
    #[error("unsupported index version {0}")]
    BadVersion(i32),
    #[error("index file for {vtable:?}/{col:?} was not cleanly synced")]
    NotSynced { vtable: VTableId, col: ColId },
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Error produced by the write-ahead log.
#[derive(Debug, Error)]
pub enum WalError {
    #[error("bad log record magic {0:#04x}")]
    BadMagic(u8),
    #[error("log sequence gap: expected {expected}, found {found}")]
    SequenceGap { expected: u16, found: u16 },
    #[error("transaction crc mismatch: computed {computed:#010x}, logged {logged:#010x}")]
    CrcMismatch { computed: u32, logged: u32 },
    #[error("commit without a matching begin")]
    CommitWithoutBegin,
    #[error(transparent)]
    Io(#[from] io::Error),
}
