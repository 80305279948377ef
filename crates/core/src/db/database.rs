//! The database handle and its transaction stack.
//!
//! Every client instance owns a [`Db`]; all instances of one database
//! share the process-wide [`DbShared`] state behind it (table handles,
//! the write-ahead log, the data-map budget), so phase-1 commit
//! rendezvous and append serialization work across instances.
//!
//! A transaction is one [`TxLevel`] on the stack. Reads at a level see
//! committed records with `stamp <= freeze_ts` plus the transaction's own
//! pending writes; writes stay queued until phase-2 commit applies them
//! to the table files at the commit stamp.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use bitflags::bitflags;
use log::{debug, info};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use stampdb_primitives::{DbStamp, UserId, VTableId};
use stampdb_tablestore::datamap::MapBudget;
use stampdb_tablestore::record::{Record, RecordBuilder};
use stampdb_tablestore::repo::Fs;
use stampdb_tablestore::tablefile::{CreateOptions, TableFile};
use stampdb_tablestore::wal::Wal;

use super::schema::{SchemaSnapshot, VT_SYS_SCHEMA, VT_SYS_TABLE};
use super::table::{TableHandle, TtsEntry};
use super::{OwnedRecord, PendingWrite, RecPos};
use crate::config::EngineOptions;
use crate::error::{DBError, Result};

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct TxFlags: u32 {
        const READONLY   = 0x0001;
        const RWSYNC     = 0x0008;
        const STREAM     = 0x0010;
        const COMMIT1    = 0x0100;
        const COMMITFAIL = 0x0200;
    }
}

/// One pushed transaction.
#[derive(Debug)]
struct TxLevel {
    freeze_ts: DbStamp,
    flags: TxFlags,
    writes: Vec<PendingWrite>,
    /// Statement counter; writes of one statement share a tentative stamp.
    write_seq: u64,
    min_cts: Option<DbStamp>,
    /// Registered TTS slots to clear on completion.
    tts: Vec<(Arc<TableHandle>, usize)>,
}

impl Drop for TxLevel {
    // A level dropped on any path must release its rendezvous slots, or
    // every later transaction on these tables would see phantom
    // conflicts.
    fn drop(&mut self) {
        for (handle, slot) in self.tts.drain(..) {
            handle.tts_clear(slot);
        }
    }
}

/// Process-wide state of one open database directory.
pub struct DbShared {
    dir: PathBuf,
    repo: Fs,
    opts: EngineOptions,
    budget: Arc<MapBudget>,
    tables: Mutex<HashMap<String, Arc<TableHandle>>>,
    sys: Arc<TableHandle>,
    wal: Mutex<Wal>,
    /// Signalled after every phase-2 commit, for WAIT_TRAN.
    pub commit_notify: tokio::sync::Notify,
}

pub const SYS_FILE: &str = "sys.dt0";

static OPEN_DBS: Lazy<Mutex<HashMap<PathBuf, Arc<DbShared>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

impl DbShared {
    fn open(dir: &Path, opts: &EngineOptions, create: bool) -> Result<Arc<DbShared>> {
        let mut open = OPEN_DBS.lock();
        if let Some(shared) = open.get(dir) {
            return Ok(shared.clone());
        }

        if create {
            std::fs::create_dir_all(dir).map_err(DBError::CantMakeDir)?;
        }
        let repo = Fs::new(dir);
        let budget = Arc::new(MapBudget::new(opts.map_budget));
        let create_opts = CreateOptions {
            block_size: opts.block_size,
            append_inc: opts.block_size.max(1024 * 1024),
            create_stamp: now_micros(),
        };
        let sys_tf = match TableFile::open(&repo, SYS_FILE, budget.clone()) {
            Ok(tf) => tf,
            Err(stampdb_tablestore::TableFileError::Io(e))
                if e.kind() == std::io::ErrorKind::NotFound && create =>
            {
                info!("creating database at {}", dir.display());
                TableFile::create(&repo, SYS_FILE, &create_opts, budget.clone())?
            }
            Err(stampdb_tablestore::TableFileError::Io(e))
                if e.kind() == std::io::ErrorKind::NotFound =>
            {
                return Err(DBError::CantOpen);
            }
            Err(e) => return Err(e.into()),
        };
        let sys = Arc::new(TableHandle::new(SYS_FILE.to_owned(), sys_tf, repo.clone()));
        let wal = Wal::open(dir).map_err(DBError::Wal)?;

        let shared = Arc::new(DbShared {
            dir: dir.to_owned(),
            repo,
            opts: opts.clone(),
            budget,
            tables: Mutex::new(HashMap::new()),
            sys,
            wal: Mutex::new(wal),
            commit_notify: tokio::sync::Notify::new(),
        });
        open.insert(dir.to_owned(), shared.clone());
        Ok(shared)
    }

    fn table(&self, file: &str, create: bool) -> Result<Arc<TableHandle>> {
        if file == SYS_FILE {
            return Ok(self.sys.clone());
        }
        let mut tables = self.tables.lock();
        if let Some(handle) = tables.get(file) {
            return Ok(handle.clone());
        }
        let tf = match TableFile::open(&self.repo, file, self.budget.clone()) {
            Ok(tf) => tf,
            Err(stampdb_tablestore::TableFileError::Io(e))
                if e.kind() == std::io::ErrorKind::NotFound && create =>
            {
                let opts = CreateOptions {
                    block_size: self.opts.block_size,
                    append_inc: self.opts.block_size.max(1024 * 1024),
                    create_stamp: self.sys.tf().head().create_stamp,
                };
                TableFile::create(&self.repo, file, &opts, self.budget.clone())?
            }
            Err(stampdb_tablestore::TableFileError::Io(e))
                if e.kind() == std::io::ErrorKind::NotFound =>
            {
                return Err(DBError::CantOpen);
            }
            Err(e) => return Err(e.into()),
        };
        let handle = Arc::new(TableHandle::new(file.to_owned(), tf, self.repo.clone()));
        tables.insert(file.to_owned(), handle.clone());
        Ok(handle)
    }
}

fn now_micros() -> DbStamp {
    let micros = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0);
    DbStamp::new(micros & !DbStamp::ID_MASK)
}

/// Options for [`Db::scan_visible`].
#[derive(Clone, Copy, Debug)]
pub struct ScanOpts {
    pub freeze: DbStamp,
    /// Merge the transaction's own pending writes into the view.
    pub include_writes: bool,
    /// Return every version including deletes (HISTORY).
    pub return_all: bool,
}

/// One instance's view of a database: the shared state plus its own
/// transaction stack.
pub struct Db {
    shared: Arc<DbShared>,
    stamp_id: u8,
    levels: Vec<TxLevel>,
}

impl Db {
    pub fn open(dir: &Path, opts: EngineOptions, create: bool) -> Result<Db> {
        let shared = DbShared::open(dir, &opts, create)?;
        Ok(Db {
            shared,
            stamp_id: 0,
            levels: Vec::new(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.shared.dir
    }

    pub fn options(&self) -> &EngineOptions {
        &self.shared.opts
    }

    pub fn shared(&self) -> &Arc<DbShared> {
        &self.shared
    }

    pub fn set_stamp_id(&mut self, id: u8) {
        self.stamp_id = id;
    }

    pub fn stamp_id(&self) -> u8 {
        self.stamp_id
    }

    pub fn sys(&self) -> Arc<TableHandle> {
        self.shared.sys.clone()
    }

    pub fn open_table(&self, file: &str, create: bool) -> Result<Arc<TableHandle>> {
        self.shared.table(file, create)
    }

    pub fn block_size(&self) -> i32 {
        self.shared.sys.tf().head().block_size
    }

    /// Best known synchronization stamp (everything below it is present).
    pub fn sync_ts(&self) -> DbStamp {
        self.shared.sys.tf().head().sync_stamp
    }

    /// Best known minimum commit stamp hint.
    pub fn min_cts_hint(&self) -> DbStamp {
        self.shared.sys.tf().head().next_stamp
    }

    pub fn update_sync_ts(&self, stamp: DbStamp) -> Result<()> {
        self.shared.sys.tf().set_sync_stamp(stamp)?;
        self.shared.commit_notify.notify_waiters();
        Ok(())
    }

    pub fn now_stamp(&self) -> DbStamp {
        now_micros().with_id(self.stamp_id)
    }

    /// Freeze stamp a new top-level transaction gets when the client does
    /// not name one.
    pub fn latest_stamp(&self) -> DbStamp {
        let head = self.shared.sys.tf().head();
        head.sync_stamp
            .max(head.next_stamp)
            .max(self.now_stamp())
    }

    // -- transaction stack ---------------------------------------------

    pub fn in_txn(&self) -> bool {
        !self.levels.is_empty()
    }

    pub fn level(&self) -> usize {
        self.levels.len()
    }

    pub fn tx_flags(&self) -> TxFlags {
        self.levels.last().map(|l| l.flags).unwrap_or_default()
    }

    pub fn freeze_ts(&self) -> DbStamp {
        self.levels
            .last()
            .map(|l| l.freeze_ts)
            .unwrap_or_else(|| self.latest_stamp())
    }

    /// Push a transaction. Sub-transactions inherit the parent's freeze
    /// stamp regardless of the argument.
    pub fn push(&mut self, freeze: DbStamp, flags: TxFlags) {
        let freeze = match self.levels.last() {
            Some(parent) => parent.freeze_ts,
            None => {
                let mut f = freeze;
                if f.raw() == 0 {
                    f = self.latest_stamp();
                }
                if flags.contains(TxFlags::RWSYNC) {
                    f = f.max(self.latest_stamp());
                }
                f
            }
        };
        debug!("push txn level={} freeze={freeze}", self.levels.len() + 1);
        self.levels.push(TxLevel {
            freeze_ts: freeze,
            flags,
            writes: Vec::new(),
            write_seq: 0,
            min_cts: None,
            tts: Vec::new(),
        });
    }

    /// Abort the current level, discarding its modifications. Dropping
    /// the level releases its TTS slots.
    pub fn abort(&mut self) -> Result<()> {
        let level = self.levels.pop().ok_or(DBError::AbortOutsideTrans)?;
        debug!("abort txn, {} writes dropped", level.writes.len());
        Ok(())
    }

    /// Roll phase 1 back without losing the transaction itself.
    pub fn uncommit1(&mut self) -> Result<()> {
        let level = self.levels.last_mut().ok_or(DBError::NotInTransaction)?;
        if !level.flags.contains(TxFlags::COMMIT1) {
            return Err(DBError::Commit2WithoutCommit1);
        }
        for (handle, slot) in level.tts.drain(..) {
            handle.tts_clear(slot);
        }
        level.flags.remove(TxFlags::COMMIT1 | TxFlags::COMMITFAIL);
        level.min_cts = None;
        Ok(())
    }

    // -- writes ----------------------------------------------------------

    /// Tentative stamp for the next statement's writes. The two records
    /// of an UPDATE pair are written under one statement stamp.
    pub fn begin_statement(&mut self) -> Result<DbStamp> {
        let level = self.levels.last_mut().ok_or(DBError::NotInTransaction)?;
        if level.flags.contains(TxFlags::READONLY) {
            return Err(DBError::General);
        }
        level.write_seq += 1;
        Ok(DbStamp::new(level.freeze_ts.raw() + level.write_seq))
    }

    pub fn queue_write(&mut self, write: PendingWrite) -> Result<()> {
        let level = self.levels.last_mut().ok_or(DBError::NotInTransaction)?;
        level.writes.push(write);
        Ok(())
    }

    pub fn pending_count(&self) -> usize {
        self.levels.iter().map(|l| l.writes.len()).sum()
    }

    /// All pending writes visible at the current level, in write order.
    fn pending_records<'a>(
        &'a self,
        file: &'a str,
        vtable: VTableId,
    ) -> impl Iterator<Item = OwnedRecord> + 'a {
        self.levels
            .iter()
            .flat_map(|l| l.writes.iter())
            .filter(move |w| w.file == file && w.vtable == vtable)
            .enumerate()
            .map(|(i, w)| w.to_owned_record(i as u64))
    }

    // -- reads -----------------------------------------------------------

    /// Materialize every row of `vtable` visible under `opts`, delete
    /// suppression applied unless `return_all`.
    pub fn scan_visible(
        &self,
        handle: &Arc<TableHandle>,
        vtable: VTableId,
        opts: ScanOpts,
    ) -> Result<Vec<OwnedRecord>> {
        let mut rows = Vec::new();
        let mut cursor = handle.tf().cursor(None);
        while let Some((off, map, range)) = cursor.next_record()? {
            let rec = Record::parse(&map[range], off)
                .map_err(|e| DBError::Storage(stampdb_tablestore::TableFileError::Record(e)))?;
            if rec.vtable() != vtable || rec.stamp() > opts.freeze {
                continue;
            }
            rows.push(OwnedRecord {
                pos: RecPos::Committed(off),
                flags: rec.flags(),
                stamp: rec.stamp(),
                user: rec.user(),
                hash: rec.hash(),
                cols: rec.cols().map(|(c, v)| (c, v.map(|b| b.to_vec()))).collect(),
            });
        }
        if opts.include_writes {
            rows.extend(self.pending_records(handle.file_name(), vtable));
        }
        if !opts.return_all {
            rows = suppress_deleted(rows);
        }
        Ok(rows)
    }

    /// Like [`Db::scan_visible`], addressed by file name. A file that
    /// does not exist yet (its CREATE TABLE is still pending in this
    /// transaction) reads as empty plus the pending writes.
    pub fn scan_table(
        &self,
        file: &str,
        vtable: VTableId,
        opts: ScanOpts,
    ) -> Result<Vec<OwnedRecord>> {
        match self.open_table(file, false) {
            Ok(handle) => self.scan_visible(&handle, vtable, opts),
            Err(DBError::CantOpen) => {
                let mut rows = Vec::new();
                if opts.include_writes {
                    rows.extend(self.pending_records(file, vtable));
                }
                if !opts.return_all {
                    rows = suppress_deleted(rows);
                }
                Ok(rows)
            }
            Err(e) => Err(e),
        }
    }

    /// Current schema as of this transaction's freeze stamp, pending DDL
    /// included.
    pub fn schema_snapshot(&self) -> Result<SchemaSnapshot> {
        let freeze = self.freeze_ts();
        let opts = ScanOpts {
            freeze,
            include_writes: true,
            return_all: false,
        };
        let sys = self.sys();
        let mut snap = SchemaSnapshot::default();
        for rec in self.scan_visible(&sys, VT_SYS_SCHEMA, opts)? {
            snap.add_schema_row(&rec);
        }
        for rec in self.scan_visible(&sys, VT_SYS_TABLE, opts)? {
            snap.add_table_row(&rec);
        }
        let keys: Vec<(String, String, VTableId, String)> = snap
            .tables
            .values()
            .map(|t| (t.schema.clone(), t.name.clone(), t.vtable, t.file.clone()))
            .collect();
        for (schema, table, vtable, file) in keys {
            for rec in self.scan_table(&file, vtable.meta(), opts)? {
                snap.add_col_row(&schema, &table, &rec);
            }
        }
        Ok(snap)
    }

    // -- two-phase commit ------------------------------------------------

    /// Phase 1: conflict check and minimum-commit-stamp assignment.
    ///
    /// `lower` is the caller's lower bound. On a conflict the returned
    /// error carries the conflicting stamp so the client can retry at a
    /// higher freeze point.
    pub fn commit1(&mut self, lower: DbStamp) -> Result<DbStamp> {
        if self.levels.is_empty() {
            return Err(DBError::NotInTransaction);
        }
        let freeze = self.freeze_ts();
        let stamp_id = self.stamp_id;
        let now = self.now_stamp();

        // Collect this level's write set grouped by physical file.
        let top = self.levels.last().unwrap();
        if top.flags.contains(TxFlags::COMMIT1) {
            return Err(DBError::General);
        }
        let mut by_file: HashMap<String, (Vec<u16>, Vec<VTableId>)> = HashMap::new();
        for w in &top.writes {
            let entry = by_file.entry(w.file.clone()).or_default();
            entry.0.push(w.hash);
            if !entry.1.contains(&w.vtable) {
                entry.1.push(w.vtable);
            }
        }

        let mut max_cand = lower.max(freeze).max(now).max(self.min_cts_hint());
        let mut conflict: Option<DbStamp> = None;

        let mut handles: Vec<(Arc<TableHandle>, Vec<u16>)> = Vec::new();
        for (file, (hashes, vtables)) in &by_file {
            let handle = self.open_table(file, true)?;
            // Writes committed after our freeze point that overlap our
            // write set are a phase-1 conflict.
            let mut cursor = handle.tf().cursor(None);
            while let Some((off, map, range)) = cursor.next_record()? {
                let rec = Record::parse(&map[range], off).map_err(|e| {
                    DBError::Storage(stampdb_tablestore::TableFileError::Record(e))
                })?;
                if rec.stamp() <= freeze || !vtables.contains(&rec.vtable()) {
                    continue;
                }
                max_cand = max_cand.max(rec.stamp());
                if hashes.contains(&rec.hash()) {
                    conflict = Some(conflict.map_or(rec.stamp(), |c| c.max(rec.stamp())));
                }
            }
            // So are other transactions that finished their own phase 1
            // over an overlapping write set.
            if let Some(ts) = handle.tts_conflict(None, hashes) {
                conflict = Some(conflict.map_or(ts, |c| c.max(ts)));
                max_cand = max_cand.max(ts);
            }
            handles.push((handle, hashes.clone()));
        }

        let top = self.levels.last_mut().unwrap();
        if let Some(ts) = conflict {
            top.flags.insert(TxFlags::COMMITFAIL);
            debug!("commit1 conflict at {ts}");
            return Err(DBError::Commit1Conflict { conflict: ts });
        }

        let min_cts = max_cand.next_unique(stamp_id);
        for (handle, hashes) in handles {
            let slot = handle.tts_register(TtsEntry {
                min_cts,
                hashes,
            });
            top.tts.push((handle, slot));
        }
        top.min_cts = Some(min_cts);
        top.flags.insert(TxFlags::COMMIT1);
        self.shared.sys.tf().set_next_stamp(min_cts)?;
        debug!("commit1 ok, min_cts={min_cts}");
        Ok(min_cts)
    }

    /// Phase 2: apply the write set at `ts` and pop the transaction.
    pub fn commit2(&mut self, ts: DbStamp, user: UserId) -> Result<()> {
        if self.levels.is_empty() {
            return Err(DBError::NotInTransaction);
        }
        let top = self.levels.last().unwrap();
        if !top.flags.contains(TxFlags::COMMIT1) {
            return Err(DBError::Commit2WithoutCommit1);
        }
        if top.min_cts.is_some_and(|m| ts < m) {
            return Err(DBError::Commit2WithoutCommit1);
        }

        if self.levels.len() == 1 {
            let level = self.levels.pop().unwrap();
            let result = self.apply_writes(&level.writes, ts, user);
            drop(level);
            if result.is_ok() {
                self.shared.commit_notify.notify_waiters();
            }
            result
        } else {
            // Inner commit: fold the write set into the parent.
            let mut level = self.levels.pop().unwrap();
            let writes = std::mem::take(&mut level.writes);
            drop(level);
            let parent = self.levels.last_mut().unwrap();
            parent.write_seq += 1;
            let stamp = DbStamp::new(parent.freeze_ts.raw() + parent.write_seq);
            for mut w in writes {
                w.stamp = stamp;
                parent.writes.push(w);
            }
            Ok(())
        }
    }

    fn apply_writes(&self, writes: &[PendingWrite], ts: DbStamp, user: UserId) -> Result<()> {
        if writes.is_empty() {
            self.shared.sys.tf().set_next_stamp(ts.next_unique(self.stamp_id))?;
            return Ok(());
        }
        let mut wal = self.shared.wal.lock();
        wal.begin(ts).map_err(DBError::Wal)?;

        let mut touched: Vec<Arc<TableHandle>> = Vec::new();
        for w in writes {
            let handle = self.open_table(&w.file, true)?;
            let mut builder = RecordBuilder::new(w.vtable, w.flags, ts, user).hash(w.hash);
            for (col, val) in &w.cols {
                builder = builder.col(*col, val.as_deref());
            }
            let bytes = builder
                .build()
                .map_err(|e| DBError::Storage(stampdb_tablestore::TableFileError::Record(e)))?;
            let off = handle.tf().append_record(&bytes)?;
            let file_id = wal.file_id(&w.file).map_err(DBError::Wal)?;
            wal.table_data(file_id, off, &bytes).map_err(DBError::Wal)?;
            wal.append_offset(file_id, handle.tf().head().append)
                .map_err(DBError::Wal)?;
            handle.note_append(w.vtable, &w.cols, off);
            if !touched.iter().any(|h| h.file_name() == w.file) {
                touched.push(handle);
            }
        }
        wal.commit(ts).map_err(DBError::Wal)?;
        drop(wal);

        for handle in &touched {
            handle.tf().set_sync_stamp(ts)?;
            handle.save_indexes();
            handle.tf().sync()?;
        }
        self.shared
            .sys
            .tf()
            .set_next_stamp(ts.next_unique(self.stamp_id))?;
        info!("commit2 applied {} writes at {ts}", writes.len());
        Ok(())
    }

    // -- raw replication access -----------------------------------------

    /// Every physical file of the database, system table first.
    pub fn physical_files(&self) -> Result<Vec<String>> {
        let snap = self.schema_snapshot()?;
        let mut files = vec![SYS_FILE.to_owned()];
        for def in snap.schemas.values() {
            if !files.contains(&def.file) {
                files.push(def.file.clone());
            }
        }
        for def in snap.tables.values() {
            if !files.contains(&def.file) {
                files.push(def.file.clone());
            }
        }
        Ok(files)
    }

    /// Stream raw record bytes with `bts <= stamp < ets` to `emit`.
    pub fn raw_scan(
        &self,
        file: &str,
        bts: DbStamp,
        ets: DbStamp,
        emit: &mut dyn FnMut(&str, i32, &[u8]) -> Result<()>,
    ) -> Result<DbStamp> {
        let handle = self.open_table(file, false)?;
        let block_size = handle.tf().head().block_size;
        let mut cursor = handle.tf().cursor(None);
        while let Some((off, map, range)) = cursor.next_record()? {
            let rec = Record::parse(&map[range], off)
                .map_err(|e| DBError::Storage(stampdb_tablestore::TableFileError::Record(e)))?;
            if rec.stamp() < bts || rec.stamp() >= ets {
                continue;
            }
            emit(file, block_size, rec.as_bytes())?;
        }
        Ok(ets)
    }

    /// Merge raw records (from a replication peer) into `file`, skipping
    /// records already present. Records must arrive in ascending stamp
    /// order within the batch.
    pub fn raw_merge(
        &self,
        file: &str,
        block_size: i32,
        records: &[Vec<u8>],
    ) -> Result<usize> {
        if records.is_empty() {
            return Ok(0);
        }
        let _ = block_size; // files use their creation-time block size
        let handle = self.open_table(file, true)?;

        let mut lo = DbStamp::MAX;
        let mut hi = DbStamp::default();
        for bytes in records {
            let rec = Record::parse(bytes, 0)
                .map_err(|e| DBError::Storage(stampdb_tablestore::TableFileError::Record(e)))?;
            lo = lo.min(rec.stamp());
            hi = hi.max(rec.stamp());
        }

        // Dedupe against what the window already holds.
        let mut present: Vec<(DbStamp, u16)> = Vec::new();
        let mut cursor = handle.tf().cursor(None);
        while let Some((off, map, range)) = cursor.next_record()? {
            let rec = Record::parse(&map[range], off)
                .map_err(|e| DBError::Storage(stampdb_tablestore::TableFileError::Record(e)))?;
            if rec.stamp() >= lo && rec.stamp() <= hi {
                present.push((rec.stamp(), rec.hash()));
            }
        }

        let mut merged = 0;
        for bytes in records {
            let rec = Record::parse(bytes, 0)
                .map_err(|e| DBError::Storage(stampdb_tablestore::TableFileError::Record(e)))?;
            if present.contains(&(rec.stamp(), rec.hash())) {
                continue;
            }
            let off = handle.tf().append_record(bytes)?;
            let cols: Vec<_> = rec.cols().map(|(c, v)| (c, v.map(|b| b.to_vec()))).collect();
            handle.note_append(rec.vtable(), &cols, off);
            merged += 1;
        }
        handle.tf().set_sync_stamp(hi)?;
        handle.tf().sync()?;
        if merged > 0 {
            self.shared.commit_notify.notify_waiters();
        }
        Ok(merged)
    }
}

/// Positional delete suppression: a DELETE hides every earlier matching
/// row with an equal or older stamp. Delete records themselves are
/// dropped from the result.
fn suppress_deleted(rows: Vec<OwnedRecord>) -> Vec<OwnedRecord> {
    let deletes: Vec<OwnedRecord> = rows.iter().filter(|r| r.is_delete()).cloned().collect();
    rows.into_iter()
        .filter(|r| !r.is_delete() && !deletes.iter().any(|d| r.deleted_by(d)))
        .collect()
}
