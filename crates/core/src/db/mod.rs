//! Database state: schema catalog, table handles, the transaction stack
//! and the two-phase commit protocol.

pub mod database;
pub mod schema;
pub mod table;

pub use database::{Db, ScanOpts, TxFlags};
pub use schema::{ColDef, SchemaSnapshot, TableDef};
pub use table::TableHandle;

use stampdb_primitives::{ColId, DbOff, DbStamp, RecordFlags, UserId};

/// Where a visible row came from, ordered the way the scanner encounters
/// rows: committed file records first (by offset), then the transaction's
/// own pending writes (by statement sequence). Delete suppression is
/// positional; a delete hides matching rows written before it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum RecPos {
    Committed(DbOff),
    Pending(u64),
}

/// One visible row, owned, with its columns decoded.
#[derive(Clone, Debug)]
pub struct OwnedRecord {
    pub pos: RecPos,
    pub flags: RecordFlags,
    pub stamp: DbStamp,
    pub user: UserId,
    pub hash: u16,
    pub cols: Vec<(ColId, Option<Vec<u8>>)>,
}

impl OwnedRecord {
    pub fn get(&self, col: ColId) -> Option<Option<&[u8]>> {
        self.cols
            .iter()
            .find(|(c, _)| *c == col)
            .map(|(_, v)| v.as_deref())
    }

    pub fn is_delete(&self) -> bool {
        self.flags.contains(RecordFlags::DELETE)
    }

    /// True when `del` (a DELETE record) targets this row: same content
    /// hash, every column carried by the delete matches, written at or
    /// after this row's stamp, and positioned after it in scan order.
    pub fn deleted_by(&self, del: &OwnedRecord) -> bool {
        if del.hash != self.hash || del.stamp < self.stamp || del.pos <= self.pos {
            return false;
        }
        del.cols.iter().all(|(col, val)| {
            col.is_system() || self.get(*col).map(|v| v == val.as_deref()).unwrap_or(false)
        })
    }
}

/// One queued modification, applied to storage at phase-2 commit.
#[derive(Clone, Debug)]
pub struct PendingWrite {
    /// Physical file the record belongs in.
    pub file: String,
    pub vtable: stampdb_primitives::VTableId,
    pub flags: RecordFlags,
    pub hash: u16,
    /// Tentative stamp for intra-transaction visibility; replaced by the
    /// commit stamp in phase 2.
    pub stamp: DbStamp,
    pub cols: Vec<(ColId, Option<Vec<u8>>)>,
}

impl PendingWrite {
    pub fn to_owned_record(&self, seq: u64) -> OwnedRecord {
        OwnedRecord {
            pos: RecPos::Pending(seq),
            flags: self.flags,
            stamp: self.stamp,
            user: UserId(0),
            hash: self.hash,
            cols: self.cols.clone(),
        }
    }
}
