//! Query execution.
//!
//! A plan executes as a nested cartesian scan over its table instances.
//! Each instance materializes the rows visible at the transaction's
//! freeze stamp (committed records plus the transaction's own pending
//! writes, with positional delete suppression already applied), ordered
//! by an index when a WHERE clause can drive one. Clause evaluation uses
//! the comparator region codes to cut indexed scans short instead of
//! running them to the end.
//!
//! Writes never touch storage here: INSERT/UPDATE/DELETE queue pending
//! writes on the transaction, and phase-2 commit applies them.

use std::collections::HashMap;

use log::debug;
use stampdb_primitives::{ColId, DbOff, RecordFlags, VTableId};
use stampdb_tablestore::content_hash;
use stampdb_tablestore::index::ScanBound;

use crate::db::schema::{self, SchemaSnapshot, VT_SYS_SCHEMA, VT_SYS_TABLE};
use crate::db::{Db, OwnedRecord, PendingWrite, RecPos, ScanOpts};
use crate::error::{DBError, Result};
use crate::query::{ColDefSpec, ColIFlags, DdlSpec, Query, QueryFlags, QueryOp, RangeRhs};
use crate::sql::types::{op_func, OpId};
use stampdb_client_api_messages::{ORDER_STRING_FWD, ORDER_STRING_REV};

/// Sort-column flag bits carried next to each sort value.
pub const SORT_DESC: u32 = 0x4000_0000;
/// The sort column is already part of the display set.
pub const SORT_SHOWN: u32 = 0x8000_0000;

/// One materialized result row: display values plus any sort keys.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ResultRow {
    pub show: Vec<Option<Vec<u8>>>,
    pub sort: Vec<(Option<Vec<u8>>, u32)>,
}

/// What the dispatcher needs to finish a query reply.
#[derive(Debug, Default)]
pub struct QueryOutcome {
    /// Matched (or affected) row count.
    pub count: i32,
    /// Sort descriptor to send when the client must order the rows.
    pub client_order: Option<Vec<i32>>,
    /// LIMIT window to send when the client must apply it.
    pub client_limit: Option<(i32, i32)>,
}

pub type RowSink<'s> = &'s mut dyn FnMut(ResultRow) -> Result<()>;

/// Execute one parsed query at the database's current transaction level.
pub fn run_query(db: &mut Db, q: &Query, sink: RowSink<'_>) -> Result<QueryOutcome> {
    if !db.in_txn() {
        return Err(DBError::NotInTransaction);
    }
    match q.op {
        QueryOp::Select | QueryOp::History => run_select(db, q, sink),
        QueryOp::Count => run_count(db, q),
        QueryOp::Insert => run_insert(db, q),
        QueryOp::Delete => run_delete(db, q),
        QueryOp::Update => run_update(db, q, false),
        QueryOp::CloneRows => run_update(db, q, true),
        QueryOp::CreateTable | QueryOp::AlterTable | QueryOp::DropTable => run_ddl(db, q),
    }
}

// ---------------------------------------------------------------------
// scanning

struct TablePlan {
    rows: Vec<OwnedRecord>,
    by_off: HashMap<DbOff, usize>,
    /// Clause index driving an indexed scan of this table, if any.
    index_clause: Option<usize>,
}

struct Scanner<'q> {
    q: &'q Query,
    plans: Vec<TablePlan>,
    /// Clause -> innermost table level it can be evaluated at.
    clause_level: Vec<usize>,
}

impl<'q> Scanner<'q> {
    fn new(db: &Db, q: &'q Query) -> Result<Scanner<'q>> {
        let freeze = db.freeze_ts();
        let opts = ScanOpts {
            freeze,
            include_writes: true,
            return_all: q.flags.contains(QueryFlags::RETURN_ALL),
        };

        let mut plans = Vec::with_capacity(q.tables.len());
        for (ti, t) in q.tables.iter().enumerate() {
            let rows = db.scan_table(&t.file, t.vtable, opts)?;
            let by_off: HashMap<DbOff, usize> = rows
                .iter()
                .enumerate()
                .filter_map(|(i, r)| match r.pos {
                    RecPos::Committed(off) => Some((off, i)),
                    RecPos::Pending(_) => None,
                })
                .collect();

            // Lowest-numbered indexable column bound by a constant clause
            // wins; everything else is a full scan.
            let mut index_clause: Option<usize> = None;
            for (ri, r) in q.ranges.iter().enumerate() {
                let col = &q.cols[r.col];
                if col.table != ti || col.col_id.is_system() {
                    continue;
                }
                let RangeRhs::Const(Some(_)) = &r.rhs else {
                    continue;
                };
                if r.op.index_class().is_none() {
                    continue;
                }
                match index_clause {
                    Some(prev) if q.cols[q.ranges[prev].col].col_id <= col.col_id => {}
                    _ => index_clause = Some(ri),
                }
            }

            let mut plan = TablePlan {
                rows,
                by_off,
                index_clause,
            };

            // Reorder candidates through the index so clause evaluation
            // can terminate the scan on a high-region code. A table whose
            // file is still pending creation has nothing to index.
            let handle = match db.open_table(&t.file, false) {
                Ok(handle) => Some(handle),
                Err(DBError::CantOpen) => None,
                Err(e) => return Err(e),
            };
            if let (Some(ri), Some(handle)) = (plan.index_clause, handle) {
                let r = &q.ranges[ri];
                let col = &q.cols[r.col];
                let class = r.op.index_class().unwrap();
                let RangeRhs::Const(Some(key)) = &r.rhs else {
                    unreachable!()
                };
                let idx = handle.index(t.vtable, col.col_id, class)?;
                let bound = match r.op {
                    OpId::EqEq => ScanBound::Eq(key),
                    OpId::Lt => ScanBound::Lt(key),
                    OpId::LtEq => ScanBound::LtEq(key),
                    OpId::Gt => ScanBound::Gt(key),
                    OpId::GtEq => ScanBound::GtEq(key),
                    OpId::Like => ScanBound::Prefix(key),
                    OpId::Same => ScanBound::Eq(key),
                    _ => ScanBound::All,
                };
                let offsets = idx.scan(bound);
                let mut ordered = Vec::with_capacity(offsets.len());
                let mut taken = vec![false; plan.rows.len()];
                for off in offsets {
                    if let Some(&i) = plan.by_off.get(&off) {
                        ordered.push(plan.rows[i].clone());
                        taken[i] = true;
                    }
                }
                // the transaction's own writes are not in the index yet
                for (i, row) in plan.rows.iter().enumerate() {
                    if !taken[i] && matches!(row.pos, RecPos::Pending(_)) {
                        ordered.push(row.clone());
                    }
                }
                debug!(
                    "table {} indexed scan: {} of {} candidates",
                    t.alias,
                    ordered.len(),
                    plan.rows.len()
                );
                plan.rows = ordered;
                plan.by_off.clear();
            }
            plans.push(plan);
        }

        // A clause can run once every table it references is bound.
        let clause_level = q
            .ranges
            .iter()
            .map(|r| {
                let mut level = q.cols[r.col].table;
                if let RangeRhs::Col(c) = &r.rhs {
                    level = level.max(q.cols[*c].table);
                }
                level
            })
            .collect();

        Ok(Scanner {
            q,
            plans,
            clause_level,
        })
    }

    /// Drive the nested scan; `emit` sees every fully matched binding.
    fn scan(
        &self,
        emit: &mut dyn FnMut(&[&OwnedRecord]) -> Result<bool>,
    ) -> Result<()> {
        if self.q.tables.is_empty() {
            return Ok(());
        }
        let mut bound: Vec<&OwnedRecord> = Vec::with_capacity(self.plans.len());
        self.scan_level(0, &mut bound, emit)?;
        Ok(())
    }

    fn scan_level<'s>(
        &'s self,
        level: usize,
        bound: &mut Vec<&'s OwnedRecord>,
        emit: &mut dyn FnMut(&[&OwnedRecord]) -> Result<bool>,
    ) -> Result<bool> {
        'rows: for row in &self.plans[level].rows {
            bound.push(row);
            for (ri, range) in self.q.ranges.iter().enumerate() {
                if self.clause_level[ri] != level {
                    continue;
                }
                let code = self.eval_clause(ri, bound);
                if code <= 0 {
                    bound.pop();
                    // High-region FALSE on the clause that ordered this
                    // scan: nothing further can match.
                    if code == -2
                        && self.plans[level].index_clause == Some(ri)
                        && matches!(row.pos, RecPos::Committed(_))
                    {
                        break 'rows;
                    }
                    continue 'rows;
                }
            }
            let keep_going = if level + 1 == self.plans.len() {
                emit(bound)?
            } else {
                self.scan_level(level + 1, bound, emit)?
            };
            bound.pop();
            if !keep_going {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn eval_clause(&self, ri: usize, bound: &[&OwnedRecord]) -> i32 {
        let range = &self.q.ranges[ri];
        let lhs_col = &self.q.cols[range.col];
        let lhs = col_value(bound[lhs_col.table], lhs_col);
        let rhs = match &range.rhs {
            RangeRhs::Const(v) => v.clone(),
            RangeRhs::Col(c) => {
                let col = &self.q.cols[*c];
                col_value(bound[col.table], col)
            }
        };
        match (lhs, rhs) {
            (Some(a), Some(b)) => op_func(lhs_col.dtype, range.op)(&a, &b),
            // NULL never satisfies a comparison
            _ => -1,
        }
    }
}

/// A column's value under the current binding. System pseudo-columns are
/// cooked from the record header into their display form.
fn col_value(rec: &OwnedRecord, col: &crate::query::ColInst) -> Option<Vec<u8>> {
    if col.flags.contains(ColIFlags::SPECIAL) {
        let cooked = match col.col_id {
            ColId::STAMP => format!("{:016x}", rec.stamp.raw()),
            ColId::USERID => format!("{:08x}", rec.user.raw()),
            ColId::VTID => format!("{:04x}", 0),
            ColId::OPCODE => {
                let f = rec.flags;
                let c = if f.contains(RecordFlags::DELETE) {
                    "d"
                } else if f.contains(RecordFlags::UPDATE) {
                    "u"
                } else if f.contains(RecordFlags::REPLICATED) {
                    "r"
                } else {
                    "i"
                };
                c.to_owned()
            }
            _ => String::new(),
        };
        return Some(cooked.into_bytes());
    }
    match rec.get(col.col_id) {
        Some(Some(v)) => Some(v.to_vec()),
        _ => None,
    }
}

// ---------------------------------------------------------------------
// SELECT / HISTORY / COUNT

fn build_row(q: &Query, bound: &[&OwnedRecord]) -> ResultRow {
    let mut row = ResultRow::default();
    for &ci in &q.display {
        let col = &q.cols[ci];
        row.show.push(col_value(bound[col.table], col));
    }
    for &ci in &q.sort {
        let col = &q.cols[ci];
        let mut flags = 0;
        if col.flags.contains(ColIFlags::SORTDESC) {
            flags |= SORT_DESC;
        }
        if col.flags.contains(ColIFlags::ORDER) {
            flags |= SORT_SHOWN;
        }
        row.sort.push((col_value(bound[col.table], col), flags));
    }
    row
}

/// The server-side ordering: iterate sort columns, NULL first, byte-wise
/// compare over the common prefix, length as tiebreaker; a DESC column
/// inverts the comparison that decided.
pub fn compare_rows(a: &ResultRow, b: &ResultRow) -> std::cmp::Ordering {
    use std::cmp::Ordering;
    let mut r = 0i32;
    let mut deciding = 0usize;
    for i in 0..a.sort.len().min(b.sort.len()) {
        deciding = i;
        let (av, _) = &a.sort[i];
        let (bv, _) = &b.sort[i];
        match (av, bv) {
            (None, None) => continue,
            (None, Some(_)) => {
                r = -1;
                break;
            }
            (Some(_), None) => {
                r = 1;
                break;
            }
            (Some(av), Some(bv)) => {
                let min = av.len().min(bv.len());
                match av[..min].cmp(&bv[..min]) {
                    Ordering::Less => {
                        r = -1;
                        break;
                    }
                    Ordering::Greater => {
                        r = 1;
                        break;
                    }
                    Ordering::Equal => {}
                }
                r = av.len() as i32 - bv.len() as i32;
                if r != 0 {
                    break;
                }
            }
        }
    }
    if r != 0 && a.sort[deciding].1 & SORT_DESC != 0 {
        r = -r;
    }
    r.cmp(&0)
}

fn run_select(db: &mut Db, q: &Query, sink: RowSink<'_>) -> Result<QueryOutcome> {
    let scanner = Scanner::new(db, q)?;
    // a streaming transaction keeps its cursor live and never buffers
    let sort_cutoff = if db.tx_flags().contains(crate::db::TxFlags::STREAM) {
        0
    } else {
        db.options().sort_buffer_rows
    };
    let with_order = q.flags.contains(QueryFlags::WITH_ORDER);
    let with_limit = q.flags.contains(QueryFlags::WITH_LIMIT);

    let mut buffer: Vec<ResultRow> = Vec::new();
    let mut overflowed = false;
    let mut count: i32 = 0;
    let mut emitted: i32 = 0;

    scanner.scan(&mut |bound| {
        let row = build_row(q, bound);
        count += 1;

        if with_order {
            if !overflowed && (count as usize) <= sort_cutoff {
                buffer.push(row);
                return Ok(true);
            }
            // past the cutoff: dump the buffer unsorted and stream; the
            // client is told to sort
            if !overflowed {
                overflowed = true;
                for buffered in buffer.drain(..) {
                    sink(buffered)?;
                }
            }
            sink(row)?;
            return Ok(true);
        }

        // no ordering: the limit window applies as we stream
        if with_limit {
            if count <= q.start_row {
                return Ok(true);
            }
            if q.max_rows >= 0 && emitted >= q.max_rows {
                return Ok(false);
            }
        }
        emitted += 1;
        sink(row)?;
        Ok(true)
    })?;

    let mut outcome = QueryOutcome::default();
    if with_order && !overflowed {
        buffer.sort_by(compare_rows);
        let start = if with_limit { q.start_row.max(0) as usize } else { 0 };
        let end = if with_limit && q.max_rows >= 0 {
            (start + q.max_rows as usize).min(buffer.len())
        } else {
            buffer.len()
        };
        let mut sent = 0;
        for row in buffer.drain(..) {
            if sent >= start && sent < end {
                sink(row)?;
                emitted += 1;
            }
            sent += 1;
        }
        outcome.count = emitted;
    } else if with_order {
        // streamed unsorted
        outcome.count = count;
        outcome.client_order = Some(order_descriptor(q));
        if with_limit {
            outcome.client_limit = Some((q.start_row, q.max_rows));
        }
    } else {
        outcome.count = if with_limit { emitted } else { count };
    }
    Ok(outcome)
}

fn order_descriptor(q: &Query) -> Vec<i32> {
    q.sort
        .iter()
        .map(|&ci| {
            let col = &q.cols[ci];
            let dir = if col.flags.contains(ColIFlags::SORTDESC) {
                ORDER_STRING_REV
            } else {
                ORDER_STRING_FWD
            };
            dir | col.order_index
        })
        .collect()
}

fn run_count(db: &mut Db, q: &Query) -> Result<QueryOutcome> {
    let scanner = Scanner::new(db, q)?;
    let mut count = 0;
    scanner.scan(&mut |_| {
        count += 1;
        Ok(true)
    })?;
    Ok(QueryOutcome {
        count,
        ..QueryOutcome::default()
    })
}

// ---------------------------------------------------------------------
// DML

/// Hash a record's identity: its key columns when it has any, otherwise
/// every column it carries.
fn record_hash(cols: &[(ColId, Option<Vec<u8>>)], key_ids: &[ColId]) -> u16 {
    if key_ids.is_empty() {
        content_hash(cols.iter().map(|(c, v)| (*c, v.as_deref())))
    } else {
        content_hash(
            cols.iter()
                .filter(|(c, _)| key_ids.contains(c))
                .map(|(c, v)| (*c, v.as_deref())),
        )
    }
}

fn table_def<'s>(snap: &'s SchemaSnapshot, q: &Query, ti: usize) -> Result<&'s schema::TableDef> {
    let t = &q.tables[ti];
    snap.table(&t.schema, &t.name)
        .ok_or_else(|| DBError::TableNotFound(t.loc, t.qualified()))
}

fn run_insert(db: &mut Db, q: &Query) -> Result<QueryOutcome> {
    let snap = db.schema_snapshot()?;
    let def = table_def(&snap, q, 0)?.clone();
    let t = &q.tables[0];

    let mut cols: Vec<(ColId, Option<Vec<u8>>)> = Vec::with_capacity(def.cols.len());
    for cd in &def.cols {
        let provided = q
            .cols
            .iter()
            .find(|ci| ci.table == 0 && ci.col_id == cd.id)
            .and_then(|ci| ci.const_val.clone());
        let value = match provided {
            Some(v) => v,
            None => cd.default.clone(),
        };
        if value.as_ref().map_or(true, |v| v.is_empty())
            && cd.flags.intersects(ColIFlags::KEY | ColIFlags::NOTNULL)
        {
            return Err(DBError::KeyNull);
        }
        cols.push((cd.id, value));
    }

    let key_ids: Vec<ColId> = def.key_cols().iter().map(|c| c.id).collect();
    let hash = record_hash(&cols, &key_ids);

    // A primary key may only exist once.
    if !key_ids.is_empty() {
        let visible = db.scan_table(
            &t.file,
            t.vtable,
            ScanOpts {
                freeze: db.freeze_ts(),
                include_writes: true,
                return_all: false,
            },
        )?;
        let key_val = cols
            .iter()
            .find(|(c, _)| *c == key_ids[0])
            .and_then(|(_, v)| v.clone())
            .unwrap_or_default();
        let dup = match db.open_table(&t.file, false) {
            Ok(handle) => {
                let idx = handle.index(
                    t.vtable,
                    key_ids[0],
                    stampdb_tablestore::index::IndexOpClass::Exact,
                )?;
                idx.scan(ScanBound::Eq(&key_val))
                    .into_iter()
                    .any(|off| visible.iter().any(|r| r.pos == RecPos::Committed(off)))
                    || visible.iter().any(|r| {
                        matches!(r.pos, RecPos::Pending(_))
                            && r.get(key_ids[0]) == Some(Some(key_val.as_slice()))
                    })
            }
            // the table file is still pending creation
            Err(DBError::CantOpen) => visible
                .iter()
                .any(|r| r.get(key_ids[0]) == Some(Some(key_val.as_slice()))),
            Err(e) => return Err(e),
        };
        if dup {
            return Err(DBError::RecordAlready);
        }
    }

    let stamp = db.begin_statement()?;
    db.queue_write(PendingWrite {
        file: t.file.clone(),
        vtable: t.vtable,
        flags: RecordFlags::INSERT,
        hash,
        stamp,
        cols,
    })?;
    Ok(QueryOutcome {
        count: 1,
        ..QueryOutcome::default()
    })
}

fn run_delete(db: &mut Db, q: &Query) -> Result<QueryOutcome> {
    let matches = collect_matches(db, q)?;
    let t = &q.tables[0];
    let stamp = db.begin_statement()?;
    let count = matches.len() as i32;
    for rec in matches {
        db.queue_write(PendingWrite {
            file: t.file.clone(),
            vtable: t.vtable,
            flags: RecordFlags::DELETE,
            hash: rec.hash,
            stamp,
            cols: rec.cols,
        })?;
    }
    Ok(QueryOutcome {
        count,
        ..QueryOutcome::default()
    })
}

/// UPDATE rewrites each matched row as a DELETE of the old version plus
/// an INSERT of the new one under a single stamp; CLONE keeps the old
/// version and only inserts the modified copy.
fn run_update(db: &mut Db, q: &Query, clone_rows: bool) -> Result<QueryOutcome> {
    let snap = db.schema_snapshot()?;
    let def = table_def(&snap, q, 0)?.clone();
    let key_ids: Vec<ColId> = def.key_cols().iter().map(|c| c.id).collect();

    let matches = collect_matches(db, q)?;
    let t = &q.tables[0];
    let stamp = db.begin_statement()?;
    let count = matches.len() as i32;

    for rec in matches {
        if !clone_rows {
            db.queue_write(PendingWrite {
                file: t.file.clone(),
                vtable: t.vtable,
                flags: RecordFlags::DELETE,
                hash: rec.hash,
                stamp,
                cols: rec.cols.clone(),
            })?;
        }
        let mut cols = rec.cols.clone();
        for ci in q.cols.iter().filter(|c| c.table == 0) {
            let Some(new_val) = &ci.const_val else {
                continue;
            };
            match cols.iter_mut().find(|(c, _)| *c == ci.col_id) {
                Some(slot) => slot.1 = new_val.clone(),
                None => cols.push((ci.col_id, new_val.clone())),
            }
        }
        cols.sort_by_key(|(c, _)| *c);
        let hash = record_hash(&cols, &key_ids);
        let mut flags = RecordFlags::INSERT;
        if !clone_rows {
            flags |= RecordFlags::UPDATE;
        }
        db.queue_write(PendingWrite {
            file: t.file.clone(),
            vtable: t.vtable,
            flags,
            hash,
            stamp,
            cols,
        })?;
    }
    Ok(QueryOutcome {
        count,
        ..QueryOutcome::default()
    })
}

/// Rows of the statement's single target table matching its WHERE list.
/// The set is materialized before any write is queued so a statement
/// never steps over its own output.
fn collect_matches(db: &mut Db, q: &Query) -> Result<Vec<OwnedRecord>> {
    let scanner = Scanner::new(db, q)?;
    let mut out = Vec::new();
    scanner.scan(&mut |bound| {
        out.push(bound[0].clone());
        Ok(true)
    })?;
    Ok(out)
}

// ---------------------------------------------------------------------
// DDL

fn run_ddl(db: &mut Db, q: &Query) -> Result<QueryOutcome> {
    let snap = db.schema_snapshot()?;
    let t = &q.tables[0];
    let stamp = db.begin_statement()?;

    match q.ddl.as_ref().ok_or(DBError::General)? {
        DdlSpec::CreateTable { cols } => {
            if snap.table(&t.schema, &t.name).is_some() {
                return Err(DBError::TableExists(t.loc, t.qualified()));
            }
            let schema_file = match snap.schemas.get(&t.schema) {
                Some(def) => def.file.clone(),
                None => {
                    // first table in a new schema creates the schema too
                    let file = format!("{}.dt0", t.schema);
                    let cols = schema::schema_record_cols(&t.schema, &file);
                    db.queue_write(PendingWrite {
                        file: crate::db::database::SYS_FILE.to_owned(),
                        vtable: VT_SYS_SCHEMA,
                        flags: RecordFlags::INSERT,
                        hash: record_hash(&cols, &[]),
                        stamp,
                        cols,
                    })?;
                    file
                }
            };

            let vtable = VTableId((snap.max_vtable() | 1) + 1);
            let tab_cols = schema::table_record_cols(&t.schema, &t.name, vtable, &schema_file);
            db.queue_write(PendingWrite {
                file: crate::db::database::SYS_FILE.to_owned(),
                vtable: VT_SYS_TABLE,
                flags: RecordFlags::INSERT,
                hash: record_hash(&tab_cols, &[]),
                stamp,
                cols: tab_cols,
            })?;

            for (i, spec) in cols.iter().enumerate() {
                let id = ColId(ColId::USER_BASE + i as u16);
                let rec_cols = schema::col_record_cols(spec, id);
                db.queue_write(PendingWrite {
                    file: schema_file.clone(),
                    vtable: vtable.meta(),
                    flags: RecordFlags::INSERT,
                    hash: record_hash(&rec_cols, &[]),
                    stamp,
                    cols: rec_cols,
                })?;
            }
            debug!("create table {} as vtable {vtable:?}", t.qualified());
        }
        DdlSpec::AlterAddColumn { col } => {
            let def = table_def(&snap, q, 0)?;
            if def.col_by_name(&col.name).is_some() {
                return Err(DBError::ColumnExists(col.loc, col.name.clone()));
            }
            let id = def.next_col_id();
            let rec_cols = schema::col_record_cols(col, id);
            db.queue_write(PendingWrite {
                file: def.file.clone(),
                vtable: def.vtable.meta(),
                flags: RecordFlags::INSERT,
                hash: record_hash(&rec_cols, &[]),
                stamp,
                cols: rec_cols,
            })?;
        }
        DdlSpec::AlterDropColumn { name, loc } => {
            let def = table_def(&snap, q, 0)?;
            let cd = def
                .col_by_name(name)
                .ok_or_else(|| DBError::ColumnNotFound(*loc, name.clone()))?;
            let spec = ColDefSpec {
                name: cd.name.clone(),
                dtype: cd.dtype,
                flags: cd.flags,
                default: cd.default.clone(),
                loc: *loc,
            };
            let rec_cols = schema::col_record_cols(&spec, cd.id);
            db.queue_write(PendingWrite {
                file: def.file.clone(),
                vtable: def.vtable.meta(),
                flags: RecordFlags::DELETE,
                hash: record_hash(&rec_cols, &[]),
                stamp,
                cols: rec_cols,
            })?;
        }
        DdlSpec::DropTable => {
            let def = table_def(&snap, q, 0)?;
            let rec_cols =
                schema::table_record_cols(&def.schema, &def.name, def.vtable, &def.file);
            db.queue_write(PendingWrite {
                file: crate::db::database::SYS_FILE.to_owned(),
                vtable: VT_SYS_TABLE,
                flags: RecordFlags::DELETE,
                hash: record_hash(&rec_cols, &[]),
                stamp,
                cols: rec_cols,
            })?;
        }
    }
    Ok(QueryOutcome::default())
}
