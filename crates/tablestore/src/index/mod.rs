//! Index abstraction over table files.
//!
//! An index orders the records of one `(table, vtable, column)` tuple by a
//! key derived from the column value. There is one index per op class: the
//! exact class keys on the raw bytes and serves `=`/`<`/`>` scans, the
//! case-folding class keys on lowercased bytes and serves `LIKE`/`SAME`.
//!
//! Indexes are strictly a performance artifact: the table file is
//! authoritative, and an index file that was not cleanly synced is thrown
//! away and rebuilt by scanning the table.

use std::collections::BTreeSet;
use std::ops::Bound;

use parking_lot::{Mutex, RwLock};
use stampdb_primitives::{ColId, DbOff, VTableId};

mod file;

pub use file::{index_file_name, load_index, mark_index_dirty, save_index};

/// Key normalization class. Determines which scans an index can serve.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum IndexOpClass {
    /// Raw byte ordering: `=`, `<`, `<=`, `>`, `>=`.
    Exact,
    /// Lowercase-folded ordering: `LIKE` prefix scans and `SAME`.
    CaseFold,
}

impl IndexOpClass {
    pub fn normalize(self, key: &[u8]) -> Vec<u8> {
        match self {
            IndexOpClass::Exact => key.to_vec(),
            IndexOpClass::CaseFold => key.to_ascii_lowercase(),
        }
    }

    pub(crate) fn code(self) -> u8 {
        match self {
            IndexOpClass::Exact => 0,
            IndexOpClass::CaseFold => 1,
        }
    }

    pub(crate) fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(IndexOpClass::Exact),
            1 => Some(IndexOpClass::CaseFold),
            _ => None,
        }
    }
}

/// How to position a range scan.
#[derive(Clone, Copy, Debug)]
pub enum ScanBound<'a> {
    All,
    Eq(&'a [u8]),
    Lt(&'a [u8]),
    LtEq(&'a [u8]),
    Gt(&'a [u8]),
    GtEq(&'a [u8]),
    /// Everything whose normalized key starts with the normalized prefix.
    Prefix(&'a [u8]),
}

/// One in-memory index over a table file.
#[derive(Debug)]
pub struct TableIndex {
    vtable: VTableId,
    col: ColId,
    op_class: IndexOpClass,
    entries: RwLock<BTreeSet<(Vec<u8>, DbOff)>>,
    /// Last equality lookup; short-circuits the repeated root descents a
    /// `a.key = b.key` join would otherwise do.
    pos_cache: Mutex<Option<(Vec<u8>, Vec<DbOff>)>>,
}

impl TableIndex {
    pub fn new(vtable: VTableId, col: ColId, op_class: IndexOpClass) -> Self {
        TableIndex {
            vtable,
            col,
            op_class,
            entries: RwLock::new(BTreeSet::new()),
            pos_cache: Mutex::new(None),
        }
    }

    pub fn vtable(&self) -> VTableId {
        self.vtable
    }

    pub fn col(&self) -> ColId {
        self.col
    }

    pub fn op_class(&self) -> IndexOpClass {
        self.op_class
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Record a newly written offset so the writing transaction's own
    /// subsequent scans see it.
    pub fn update(&self, key: &[u8], off: DbOff) {
        let key = self.op_class.normalize(key);
        *self.pos_cache.lock() = None;
        self.entries.write().insert((key, off));
    }

    pub fn insert_normalized(&self, key: Vec<u8>, off: DbOff) {
        self.entries.write().insert((key, off));
    }

    /// Offsets satisfying `bound`, in key order.
    pub fn scan(&self, bound: ScanBound<'_>) -> Vec<DbOff> {
        if let ScanBound::Eq(key) = bound {
            let key = self.op_class.normalize(key);
            if let Some((cached, offs)) = &*self.pos_cache.lock() {
                if *cached == key {
                    return offs.clone();
                }
            }
            let offs = self.collect(ScanBound::Eq(&key), false);
            *self.pos_cache.lock() = Some((key, offs.clone()));
            return offs;
        }
        self.collect(bound, true)
    }

    fn collect(&self, bound: ScanBound<'_>, normalize: bool) -> Vec<DbOff> {
        let entries = self.entries.read();
        let norm = |key: &[u8]| {
            if normalize {
                self.op_class.normalize(key)
            } else {
                key.to_vec()
            }
        };
        let range = |lo: Bound<(Vec<u8>, DbOff)>, hi: Bound<(Vec<u8>, DbOff)>| {
            entries
                .range((lo, hi))
                .map(|(_, off)| *off)
                .collect::<Vec<_>>()
        };
        match bound {
            ScanBound::All => entries.iter().map(|(_, off)| *off).collect(),
            ScanBound::Eq(key) => {
                let key = norm(key);
                range(
                    Bound::Included((key.clone(), DbOff::MIN)),
                    Bound::Included((key, DbOff::MAX)),
                )
            }
            ScanBound::Lt(key) => range(
                Bound::Unbounded,
                Bound::Excluded((norm(key), DbOff::MIN)),
            ),
            ScanBound::LtEq(key) => range(
                Bound::Unbounded,
                Bound::Included((norm(key), DbOff::MAX)),
            ),
            ScanBound::Gt(key) => range(
                Bound::Excluded((norm(key), DbOff::MAX)),
                Bound::Unbounded,
            ),
            ScanBound::GtEq(key) => range(
                Bound::Included((norm(key), DbOff::MIN)),
                Bound::Unbounded,
            ),
            ScanBound::Prefix(prefix) => {
                let prefix = norm(prefix);
                let mut out = Vec::new();
                for (key, off) in
                    entries.range((Bound::Included((prefix.clone(), DbOff::MIN)), Bound::Unbounded))
                {
                    if !key.starts_with(&prefix) {
                        break;
                    }
                    out.push(*off);
                }
                out
            }
        }
    }

    /// Remove every entry (full rebuild).
    pub fn clear(&self) {
        self.entries.write().clear();
        *self.pos_cache.lock() = None;
    }

    pub(crate) fn snapshot(&self) -> Vec<(Vec<u8>, DbOff)> {
        self.entries.read().iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn index() -> TableIndex {
        let idx = TableIndex::new(VTableId::new(0x400), ColId::new(0x400), IndexOpClass::Exact);
        for (i, key) in [b"apple", b"grape", b"lemon", b"mango", b"peach"].iter().enumerate() {
            idx.update(*key, i as DbOff * 100);
        }
        idx
    }

    #[test]
    fn eq_scan_hits_one_key() {
        let idx = index();
        assert_eq!(idx.scan(ScanBound::Eq(b"lemon")), vec![200]);
        assert_eq!(idx.scan(ScanBound::Eq(b"kiwi")), Vec::<DbOff>::new());
    }

    #[test]
    fn range_scans_follow_key_order() {
        let idx = index();
        assert_eq!(idx.scan(ScanBound::Lt(b"lemon")), vec![0, 100]);
        assert_eq!(idx.scan(ScanBound::LtEq(b"lemon")), vec![0, 100, 200]);
        assert_eq!(idx.scan(ScanBound::Gt(b"lemon")), vec![300, 400]);
        assert_eq!(idx.scan(ScanBound::GtEq(b"lemon")), vec![200, 300, 400]);
        assert_eq!(idx.scan(ScanBound::All).len(), 5);
    }

    #[test]
    fn casefold_prefix_scan() {
        let idx = TableIndex::new(VTableId::new(0x400), ColId::new(0x400), IndexOpClass::CaseFold);
        idx.update(b"Alpha", 1);
        idx.update(b"ALPINE", 2);
        idx.update(b"beta", 3);
        let mut offs = idx.scan(ScanBound::Prefix(b"alp"));
        offs.sort_unstable();
        assert_eq!(offs, vec![1, 2]);
    }

    #[test]
    fn duplicate_keys_keep_every_offset() {
        let idx = TableIndex::new(VTableId::new(0x400), ColId::new(0x400), IndexOpClass::Exact);
        idx.update(b"k", 10);
        idx.update(b"k", 20);
        assert_eq!(idx.scan(ScanBound::Eq(b"k")), vec![10, 20]);
    }

    #[test]
    fn position_cache_invalidated_by_update() {
        let idx = index();
        assert_eq!(idx.scan(ScanBound::Eq(b"mango")), vec![300]);
        idx.update(b"mango", 999);
        assert_eq!(idx.scan(ScanBound::Eq(b"mango")), vec![300, 999]);
    }
}
