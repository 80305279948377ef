//! In-memory table handles.
//!
//! A [`TableHandle`] is the refcounted bridge between the engine and one
//! physical table file: it owns the file, the indexes built over it, and
//! the phase-1 commit rendezvous slots used for write-write conflict
//! detection.

use std::collections::HashMap;
use std::fs::File;
use std::sync::Arc;

use log::{debug, warn};
use parking_lot::Mutex;
use stampdb_primitives::{ColId, DbOff, DbStamp, VTableId};
use stampdb_tablestore::index::{
    index_file_name, load_index, mark_index_dirty, save_index, IndexOpClass, TableIndex,
};
use stampdb_tablestore::record::Record;
use stampdb_tablestore::repo::Fs;
use stampdb_tablestore::tablefile::TableFile;

use crate::error::Result;

/// One phase-1 commit registration: the transaction's chosen minimum
/// commit stamp and the content hashes of the rows it intends to write.
#[derive(Clone, Debug)]
pub struct TtsEntry {
    pub min_cts: DbStamp,
    pub hashes: Vec<u16>,
}

pub struct TableHandle {
    file_name: String,
    tf: TableFile<File>,
    repo: Fs,
    indexes: Mutex<HashMap<(VTableId, ColId, IndexOpClass), Arc<TableIndex>>>,
    tts: Mutex<Vec<Option<TtsEntry>>>,
}

impl TableHandle {
    pub fn new(file_name: String, tf: TableFile<File>, repo: Fs) -> TableHandle {
        TableHandle {
            file_name,
            tf,
            repo,
            indexes: Mutex::new(HashMap::new()),
            tts: Mutex::new(Vec::new()),
        }
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn tf(&self) -> &TableFile<File> {
        &self.tf
    }

    /// The index for `(vtable, col, class)`, loading its sidecar file or
    /// rebuilding from the table file when the sidecar cannot be trusted.
    pub fn index(
        &self,
        vtable: VTableId,
        col: ColId,
        class: IndexOpClass,
    ) -> Result<Arc<TableIndex>> {
        let mut indexes = self.indexes.lock();
        if let Some(idx) = indexes.get(&(vtable, col, class)) {
            return Ok(idx.clone());
        }

        let generation = self.tf.head().generation;
        let name = index_file_name(&self.file_name, vtable, col, class);
        let idx = match load_index(&self.repo, &name, vtable, col, generation) {
            Ok(idx) => {
                debug!("loaded index {name} ({} entries)", idx.len());
                idx
            }
            Err(e) => {
                debug!("rebuilding index {name}: {e}");
                self.rebuild_index(vtable, col, class)?
            }
        };
        // any modification from here on must defeat the sidecar until the
        // next save
        if let Err(e) = mark_index_dirty(&self.repo, &name) {
            warn!("could not mark index {name} dirty: {e}");
        }
        let idx = Arc::new(idx);
        indexes.insert((vtable, col, class), idx.clone());
        Ok(idx)
    }

    fn rebuild_index(
        &self,
        vtable: VTableId,
        col: ColId,
        class: IndexOpClass,
    ) -> Result<TableIndex> {
        let idx = TableIndex::new(vtable, col, class);
        let mut cursor = self.tf.cursor(None);
        while let Some((off, map, range)) = cursor.next_record()? {
            let rec = Record::parse(&map[range], off).map_err(|e| {
                crate::error::DBError::Storage(stampdb_tablestore::TableFileError::Record(e))
            })?;
            if rec.vtable() != vtable {
                continue;
            }
            if let Some(Some(key)) = rec.get(col) {
                idx.update(key, off);
            }
        }
        Ok(idx)
    }

    /// Fold a newly appended record into every cached index on its vtable.
    pub fn note_append(&self, vtable: VTableId, cols: &[(ColId, Option<Vec<u8>>)], off: DbOff) {
        let indexes = self.indexes.lock();
        for ((vt, col, _), idx) in indexes.iter() {
            if *vt != vtable {
                continue;
            }
            if let Some((_, Some(key))) = cols.iter().find(|(c, _)| c == col) {
                idx.update(key, off);
            }
        }
    }

    /// Persist every cached index, stamping the table's generation.
    pub fn save_indexes(&self) {
        let generation = self.tf.head().generation;
        let indexes = self.indexes.lock();
        for ((vt, col, class), idx) in indexes.iter() {
            let name = index_file_name(&self.file_name, *vt, *col, *class);
            if let Err(e) = save_index(&self.repo, &name, idx, generation) {
                warn!("could not save index {name}: {e}");
            }
        }
    }

    /// Drop cached indexes (schema change invalidates them).
    pub fn invalidate_indexes(&self) {
        self.indexes.lock().clear();
    }

    // -- phase-1 commit rendezvous -------------------------------------

    /// Register a phase-1 commit, returning the slot to clear later.
    pub fn tts_register(&self, entry: TtsEntry) -> usize {
        let mut tts = self.tts.lock();
        for (i, slot) in tts.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(entry);
                return i;
            }
        }
        tts.push(Some(entry));
        tts.len() - 1
    }

    pub fn tts_clear(&self, slot: usize) {
        let mut tts = self.tts.lock();
        if let Some(s) = tts.get_mut(slot) {
            *s = None;
        }
    }

    /// Smallest min-commit stamp of any other in-flight phase-1
    /// transaction whose write set overlaps `hashes`.
    pub fn tts_conflict(&self, exclude: Option<usize>, hashes: &[u16]) -> Option<DbStamp> {
        let tts = self.tts.lock();
        tts.iter()
            .enumerate()
            .filter(|(i, _)| Some(*i) != exclude)
            .filter_map(|(_, slot)| slot.as_ref())
            .filter(|entry| entry.hashes.iter().any(|h| hashes.contains(h)))
            .map(|entry| entry.min_cts)
            .max()
    }
}

impl std::fmt::Debug for TableHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableHandle")
            .field("file", &self.file_name)
            .finish()
    }
}
