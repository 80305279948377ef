//! Physical append-only table files.
//!
//! A file is a sequence of fixed-size blocks. Every block starts with a
//! [`BlockHead`]; the first block additionally carries the [`TableHead`]
//! metadata. Records never straddle block boundaries: a zero record magic
//! inside a block means the rest of the block is free and the scan resumes
//! at the next block. Advancing the append offset is serialized behind the
//! head lock (single writer); readers work from an append snapshot taken
//! when their cursor was created.

use std::io;
use std::sync::Arc;

use bitflags::bitflags;
use log::{debug, trace};
use parking_lot::Mutex;
use stampdb_primitives::{align8, DbOff, DbStamp};

use crate::datamap::{DataMapCache, MapBudget, MapRef};
use crate::error::TableFileError;
use crate::record::{REC_HEAD_LEN, REC_MAGIC};
use crate::repo::{Repo, TableStorage};

pub const BH_MAGIC_TABLE: u32 = 0x6D6174B1;
pub const BH_MAGIC: u32 = 0x00AA5500;

pub const BH_TYPE_TABLE: i32 = 1;
pub const BH_TYPE_FREE: i32 = 2;
pub const BH_TYPE_DATA: i32 = 3;

pub const BLOCK_HEAD_LEN: usize = 24;

pub const TF_VERSION: i32 = 2;

pub const MIN_BLOCK_SIZE: i32 = 4 * 1024;
pub const DEFAULT_BLOCK_SIZE: i32 = 128 * 1024;
pub const MAX_BLOCK_SIZE: i32 = 8192 * 1024;
pub const DEFAULT_APPEND_INC: i32 = 1024 * 1024;

const HEAD_LEN: usize = 184;
const NAME_LEN: usize = 64;

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct TableFlags: i32 {
        const CREATED = 0x0001;
        const VALID   = 0x0002;
        const CORRUPT = 0x0004;
        const DIRTY   = 0x0008;
    }
}

/// Cached, lock-protected copy of the first-block metadata.
#[derive(Clone, Debug)]
pub struct TableHead {
    pub version: i32,
    pub head_size: i32,
    pub append_inc: i32,
    pub flags: TableFlags,
    pub block_size: i32,
    /// Base of data: the first data block starts here.
    pub data_off: DbOff,
    /// Current (possibly pre-extended) file size.
    pub file_size: DbOff,
    /// Coherent append point; everything below it is stable.
    pub append: DbOff,
    /// Earliest stamp still present in the file.
    pub hist_stamp: DbStamp,
    /// Everything before this stamp is known to be present.
    pub sync_stamp: DbStamp,
    /// Next allocatable stamp (root system table only).
    pub next_stamp: DbStamp,
    /// Bumped to invalidate caches built over this file.
    pub generation: u64,
    /// Database creation stamp, doubling as the replication group id.
    pub create_stamp: DbStamp,
    pub name: String,
    pub error: i32,
}

impl TableHead {
    fn encode(&self) -> [u8; HEAD_LEN] {
        let mut buf = [0u8; HEAD_LEN];
        buf[0..4].copy_from_slice(&BH_MAGIC_TABLE.to_le_bytes());
        buf[4..8].copy_from_slice(&BH_TYPE_TABLE.to_le_bytes());
        // reserved words and block crc stay zero
        buf[24..28].copy_from_slice(&self.version.to_le_bytes());
        buf[28..32].copy_from_slice(&(HEAD_LEN as i32).to_le_bytes());
        buf[32..36].copy_from_slice(&self.append_inc.to_le_bytes());
        buf[36..40].copy_from_slice(&self.flags.bits().to_le_bytes());
        buf[40..44].copy_from_slice(&self.block_size.to_le_bytes());
        buf[48..56].copy_from_slice(&self.data_off.to_le_bytes());
        buf[56..64].copy_from_slice(&self.file_size.to_le_bytes());
        buf[64..72].copy_from_slice(&self.append.to_le_bytes());
        buf[72..80].copy_from_slice(&self.hist_stamp.raw().to_le_bytes());
        buf[80..88].copy_from_slice(&self.sync_stamp.raw().to_le_bytes());
        buf[88..96].copy_from_slice(&self.next_stamp.raw().to_le_bytes());
        buf[96..104].copy_from_slice(&self.generation.to_le_bytes());
        buf[104..112].copy_from_slice(&self.create_stamp.raw().to_le_bytes());
        let name = self.name.as_bytes();
        let n = name.len().min(NAME_LEN - 1);
        buf[112..112 + n].copy_from_slice(&name[..n]);
        buf[176..180].copy_from_slice(&self.error.to_le_bytes());
        buf
    }

    fn decode(buf: &[u8; HEAD_LEN]) -> Result<TableHead, TableFileError> {
        let magic = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        if magic != BH_MAGIC_TABLE {
            return Err(TableFileError::BadMagic(magic));
        }
        let btype = i32::from_le_bytes(buf[4..8].try_into().unwrap());
        if btype != BH_TYPE_TABLE {
            return Err(TableFileError::BadBlockType(btype));
        }
        let version = i32::from_le_bytes(buf[24..28].try_into().unwrap());
        if version != TF_VERSION {
            return Err(TableFileError::BadVersion(version));
        }
        let block_size = i32::from_le_bytes(buf[40..44].try_into().unwrap());
        validate_block_size(block_size)?;
        let name_end = buf[112..112 + NAME_LEN]
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(NAME_LEN);
        Ok(TableHead {
            version,
            head_size: i32::from_le_bytes(buf[28..32].try_into().unwrap()),
            append_inc: i32::from_le_bytes(buf[32..36].try_into().unwrap()),
            flags: TableFlags::from_bits_retain(i32::from_le_bytes(buf[36..40].try_into().unwrap())),
            block_size,
            data_off: i64::from_le_bytes(buf[48..56].try_into().unwrap()),
            file_size: i64::from_le_bytes(buf[56..64].try_into().unwrap()),
            append: i64::from_le_bytes(buf[64..72].try_into().unwrap()),
            hist_stamp: DbStamp::new(u64::from_le_bytes(buf[72..80].try_into().unwrap())),
            sync_stamp: DbStamp::new(u64::from_le_bytes(buf[80..88].try_into().unwrap())),
            next_stamp: DbStamp::new(u64::from_le_bytes(buf[88..96].try_into().unwrap())),
            generation: u64::from_le_bytes(buf[96..104].try_into().unwrap()),
            create_stamp: DbStamp::new(u64::from_le_bytes(buf[104..112].try_into().unwrap())),
            name: String::from_utf8_lossy(&buf[112..112 + name_end]).into_owned(),
            error: i32::from_le_bytes(buf[176..180].try_into().unwrap()),
        })
    }
}

fn validate_block_size(block_size: i32) -> Result<(), TableFileError> {
    if block_size < MIN_BLOCK_SIZE || block_size > MAX_BLOCK_SIZE || !(block_size as u32).is_power_of_two() {
        return Err(TableFileError::BadBlockSize(block_size));
    }
    Ok(())
}

#[derive(Clone, Debug)]
pub struct CreateOptions {
    pub block_size: i32,
    pub append_inc: i32,
    pub create_stamp: DbStamp,
}

impl Default for CreateOptions {
    fn default() -> Self {
        CreateOptions {
            block_size: DEFAULT_BLOCK_SIZE,
            append_inc: DEFAULT_APPEND_INC,
            create_stamp: DbStamp::default(),
        }
    }
}

/// One open physical table file.
pub struct TableFile<S: TableStorage> {
    storage: Arc<S>,
    head: Mutex<TableHead>,
    cache: DataMapCache<S>,
}

impl<S: TableStorage> std::fmt::Debug for TableFile<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableFile")
            .field("head", &*self.head.lock())
            .finish()
    }
}

impl<S: TableStorage> TableFile<S> {
    pub fn create<R: Repo<Storage = S>>(
        repo: &R,
        name: &str,
        opts: &CreateOptions,
        budget: Arc<MapBudget>,
    ) -> Result<Self, TableFileError> {
        validate_block_size(opts.block_size)?;
        let storage = Arc::new(repo.create(name)?);
        let head = TableHead {
            version: TF_VERSION,
            head_size: HEAD_LEN as i32,
            append_inc: opts.append_inc.max(opts.block_size),
            flags: TableFlags::CREATED | TableFlags::VALID,
            block_size: opts.block_size,
            data_off: opts.block_size as DbOff,
            file_size: opts.block_size as DbOff,
            append: opts.block_size as DbOff,
            hist_stamp: DbStamp::default(),
            sync_stamp: DbStamp::default(),
            next_stamp: DbStamp::default(),
            generation: 1,
            create_stamp: opts.create_stamp,
            name: name.to_owned(),
            error: 0,
        };
        storage.set_len(opts.block_size as u64)?;
        storage.write_all_at(&head.encode(), 0)?;
        storage.sync_data()?;
        debug!("created table file {name} block_size={}", opts.block_size);
        let cache = DataMapCache::new(storage.clone(), opts.block_size as usize, budget);
        Ok(TableFile {
            storage,
            head: Mutex::new(head),
            cache,
        })
    }

    pub fn open<R: Repo<Storage = S>>(
        repo: &R,
        name: &str,
        budget: Arc<MapBudget>,
    ) -> Result<Self, TableFileError> {
        let storage = Arc::new(repo.open(name)?);
        let mut buf = [0u8; HEAD_LEN];
        storage
            .read_exact_at(&mut buf, 0)
            .map_err(|e| match e.kind() {
                io::ErrorKind::UnexpectedEof => TableFileError::Truncated {
                    claimed: HEAD_LEN as DbOff,
                    actual: 0,
                },
                _ => TableFileError::Io(e),
            })?;
        let head = TableHead::decode(&buf)?;
        let actual = storage.len()? as DbOff;
        if actual < head.file_size {
            return Err(TableFileError::Truncated {
                claimed: head.file_size,
                actual,
            });
        }
        if head.append < head.data_off || head.append > head.file_size {
            return Err(TableFileError::Corrupt(format!(
                "append offset {} outside [{}, {}]",
                head.append, head.data_off, head.file_size
            )));
        }
        let cache = DataMapCache::new(storage.clone(), head.block_size as usize, budget);
        Ok(TableFile {
            storage,
            head: Mutex::new(head),
            cache,
        })
    }

    /// Snapshot of the metadata block.
    pub fn head(&self) -> TableHead {
        self.head.lock().clone()
    }

    pub fn block_size(&self) -> i32 {
        self.head.lock().block_size
    }

    /// Append one encoded record, returning its file offset.
    ///
    /// The record must already be 8-aligned ([`crate::record::RecordBuilder`]
    /// guarantees this) and must fit within a single block.
    pub fn append_record(&self, rec: &[u8]) -> Result<DbOff, TableFileError> {
        debug_assert_eq!(rec.len() % 8, 0);
        debug_assert_eq!(rec[0], REC_MAGIC);
        let mut head = self.head.lock();
        let bs = head.block_size as DbOff;
        if rec.len() + BLOCK_HEAD_LEN > bs as usize {
            return Err(TableFileError::RecordTooLarge {
                size: rec.len(),
                block_size: head.block_size,
            });
        }

        let mut pos = head.append;
        loop {
            if pos % bs == 0 {
                // Fresh block: extend the file if needed and stamp the
                // block header. The freed tail of the previous block is
                // zero-filled already, which is exactly the "skip to next
                // block" marker the cursor looks for.
                self.ensure_len(&mut head, pos + bs)?;
                let mut bh = [0u8; BLOCK_HEAD_LEN];
                bh[0..4].copy_from_slice(&BH_MAGIC.to_le_bytes());
                bh[4..8].copy_from_slice(&BH_TYPE_DATA.to_le_bytes());
                self.storage.write_all_at(&bh, pos as u64)?;
                pos += BLOCK_HEAD_LEN as DbOff;
            }
            let block_end = (pos / bs + 1) * bs;
            if pos + rec.len() as DbOff <= block_end {
                break;
            }
            pos = block_end;
        }

        self.storage.write_all_at(rec, pos as u64)?;
        head.append = pos + rec.len() as DbOff;
        self.write_meta(&head)?;
        trace!("append {} bytes at {} -> append={}", rec.len(), pos, head.append);
        Ok(pos)
    }

    fn ensure_len(&self, head: &mut TableHead, needed: DbOff) -> Result<(), TableFileError> {
        if head.file_size >= needed {
            return Ok(());
        }
        let inc = head.append_inc as DbOff;
        let bs = head.block_size as DbOff;
        let mut new_len = (needed + inc - 1) / inc * inc;
        new_len = (new_len + bs - 1) / bs * bs;
        self.storage.set_len(new_len as u64)?;
        head.file_size = new_len;
        Ok(())
    }

    fn write_meta(&self, head: &TableHead) -> Result<(), TableFileError> {
        self.storage.write_all_at(&head.encode(), 0)?;
        Ok(())
    }

    /// Flush data and metadata to stable storage.
    pub fn sync(&self) -> Result<(), TableFileError> {
        let head = self.head.lock();
        self.write_meta(&head)?;
        self.storage.sync_data()?;
        Ok(())
    }

    pub fn set_sync_stamp(&self, stamp: DbStamp) -> Result<(), TableFileError> {
        let mut head = self.head.lock();
        if stamp > head.sync_stamp {
            head.sync_stamp = stamp;
            self.write_meta(&head)?;
        }
        Ok(())
    }

    pub fn set_next_stamp(&self, stamp: DbStamp) -> Result<(), TableFileError> {
        let mut head = self.head.lock();
        if stamp > head.next_stamp {
            head.next_stamp = stamp;
            self.write_meta(&head)?;
        }
        Ok(())
    }

    pub fn set_hist_stamp(&self, stamp: DbStamp) -> Result<(), TableFileError> {
        let mut head = self.head.lock();
        head.hist_stamp = stamp;
        self.write_meta(&head)
    }

    /// Invalidate every cache built over this file.
    pub fn bump_generation(&self) -> Result<(), TableFileError> {
        let mut head = self.head.lock();
        head.generation += 1;
        self.cache.invalidate();
        self.write_meta(&head)
    }

    /// Cursor over `[from.unwrap_or(data_off), append-at-call)`.
    pub fn cursor(&self, from: Option<DbOff>) -> RecordCursor<S> {
        let head = self.head.lock();
        RecordCursor {
            cache: self.cache.clone(),
            block_size: head.block_size as DbOff,
            limit: head.append,
            pos: from.unwrap_or(head.data_off),
        }
    }

    /// Cursor bounded above by an explicit append snapshot (a query must
    /// not step over records it wrote itself).
    pub fn cursor_bounded(&self, from: Option<DbOff>, limit: DbOff) -> RecordCursor<S> {
        let head = self.head.lock();
        RecordCursor {
            cache: self.cache.clone(),
            block_size: head.block_size as DbOff,
            limit,
            pos: from.unwrap_or(head.data_off),
        }
    }

    /// Fetch the single record at `off`.
    pub fn record_at(&self, off: DbOff) -> Result<(MapRef, std::ops::Range<usize>), TableFileError> {
        let head = self.head.lock();
        let bs = head.block_size as DbOff;
        let append = head.append;
        drop(head);
        let block = off / bs * bs;
        let closed = append >= block + bs;
        let map = self.cache.get(block as u64, closed)?;
        let in_off = (off - block) as usize;
        if in_off + REC_HEAD_LEN > map.len() {
            return Err(TableFileError::Corrupt(format!("record offset {off} overruns block")));
        }
        let size = i32::from_le_bytes(map[in_off + 4..in_off + 8].try_into().unwrap());
        if size < REC_HEAD_LEN as i32 || in_off + size as usize > map.len() {
            return Err(TableFileError::Corrupt(format!("bad record size {size} at {off}")));
        }
        Ok((map, in_off..in_off + size as usize))
    }
}

/// Forward scan over the records of one table file.
///
/// Yields `(offset, window, range)`; the caller parses the record out of
/// the window. Records never straddle blocks, so one window always covers
/// one record.
pub struct RecordCursor<S: TableStorage> {
    cache: DataMapCache<S>,
    block_size: DbOff,
    limit: DbOff,
    pos: DbOff,
}

impl<S: TableStorage> RecordCursor<S> {
    pub fn next_record(
        &mut self,
    ) -> Result<Option<(DbOff, MapRef, std::ops::Range<usize>)>, TableFileError> {
        let bs = self.block_size;
        loop {
            if self.pos >= self.limit {
                return Ok(None);
            }
            let block = self.pos / bs * bs;
            let mut in_off = (self.pos - block) as usize;
            if in_off == 0 {
                in_off = BLOCK_HEAD_LEN;
                self.pos += BLOCK_HEAD_LEN as DbOff;
            }
            if (in_off + REC_HEAD_LEN) as DbOff > bs {
                self.pos = block + bs;
                continue;
            }
            let closed = self.limit >= block + bs;
            let map = self.cache.get(block as u64, closed)?;
            if map[in_off] == 0 {
                // zero magic: rest of the block is free
                self.pos = block + bs;
                continue;
            }
            let size = i32::from_le_bytes(map[in_off + 4..in_off + 8].try_into().unwrap());
            if size < REC_HEAD_LEN as i32
                || size % 8 != 0
                || (in_off + size as usize) as DbOff > bs
            {
                return Err(TableFileError::Corrupt(format!(
                    "bad record size {size} at offset {}",
                    self.pos
                )));
            }
            let off = self.pos;
            self.pos += align8(size as usize) as DbOff;
            return Ok(Some((off, map, in_off..in_off + size as usize)));
        }
    }

    /// Reposition the cursor.
    pub fn seek(&mut self, pos: DbOff) {
        self.pos = pos;
    }

    pub fn limit(&self) -> DbOff {
        self.limit
    }
}
