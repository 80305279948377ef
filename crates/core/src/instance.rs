//! The per-client instance task.
//!
//! One instance owns one [`Db`] and one framed stream. It announces
//! itself with HELLO, then serves the command loop: transaction control,
//! query execution with streamed RESULT rows under a stall-credit scheme,
//! stamp maintenance, and the raw record read/write used by replication.
//!
//! Queries that stream rows run the synchronous engine on a blocking
//! thread; rows flow back over a small channel so the server never holds
//! more than the stall credit plus a handful of rows ahead of a slow
//! client.

use log::{debug, info, warn};
use stampdb_client_api_messages as proto;
use stampdb_client_api_messages::{Body, Endian, Msg, PktFlags, RowBuilder};
use stampdb_primitives::DbStamp;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::db::{Db, TxFlags};
use crate::engine::{self, QueryOutcome, ResultRow, SORT_SHOWN};
use crate::error::{DBError, Result};
use crate::query::QueryOp;
use crate::sql;

/// Raw-write merges flush at these batch limits, but never split the
/// records of a single transaction stamp.
const MERGE_COUNT: usize = 1000;
const MERGE_BYTES: usize = 100_000;

pub struct Instance<S> {
    stream: S,
    db: Option<Db>,
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send> Instance<S> {
    pub fn new(db: Db, stream: S) -> Instance<S> {
        Instance {
            stream,
            db: Some(db),
        }
    }

    fn db(&mut self) -> &mut Db {
        self.db.as_mut().expect("instance database is open")
    }

    async fn send(&mut self, msg: &Msg) -> Result<()> {
        proto::write_msg(&mut self.stream, msg, Endian::NATIVE)
            .await
            .map_err(|_| DBError::LostLink)
    }

    async fn reply(&mut self, body: Body, error: i32) -> Result<()> {
        self.send(&Msg::with_error(body, error)).await
    }

    /// Serve this instance until the peer closes the stream.
    pub async fn run(mut self) -> Result<()> {
        info!("instance start");
        let hello = {
            let db = self.db();
            Body::Hello(proto::Hello {
                sync_ts: db.sync_ts(),
                min_cts: db.min_cts_hint(),
                block_size: db.block_size(),
                dbname: String::new(),
            })
        };
        self.send(&Msg::new(hello)).await?;

        loop {
            let msg = match proto::read_msg(&mut self.stream).await {
                Ok(Some(msg)) => msg,
                Ok(None) => break,
                Err(e) => {
                    warn!("instance read error: {e}");
                    break;
                }
            };
            match msg.body {
                // stray credit from an earlier, finished query
                Body::Continue | Body::BreakQuery => {}
                Body::CloseInstance => {
                    self.reply(Body::CloseInstance, 0).await?;
                    break;
                }
                Body::Begin(b) => {
                    let mut flags = TxFlags::empty();
                    if msg.flags.contains(PktFlags::READONLY) {
                        flags |= TxFlags::READONLY;
                    }
                    if msg.flags.contains(PktFlags::RWSYNC) {
                        flags |= TxFlags::RWSYNC;
                    }
                    if msg.flags.contains(PktFlags::STREAM) {
                        flags |= TxFlags::STREAM;
                    }
                    self.db().push(b.freeze_ts, flags);
                }
                Body::RunQuery(sql) => self.run_query(sql).await?,
                Body::RecQuery(sql) => self.rec_query(sql),
                Body::Abort => {
                    if self.db().in_txn() {
                        let _ = self.db().abort();
                    }
                }
                Body::Uncommit1 => {
                    let error = if !self.db().in_txn() {
                        -1
                    } else if !self.db().tx_flags().contains(TxFlags::COMMIT1) {
                        -2
                    } else {
                        self.db().uncommit1().map(|_| 0).unwrap_or(-2)
                    };
                    self.reply(Body::Uncommit1, error).await?;
                }
                Body::Commit1(c1) => {
                    let (error, min_cts) = if !self.db().in_txn() {
                        (-1, c1.min_cts)
                    } else if self.db().tx_flags().contains(TxFlags::COMMIT1) {
                        (-2, c1.min_cts)
                    } else {
                        match self.db().commit1(c1.min_cts) {
                            Ok(min_cts) => (0, min_cts),
                            // the conflicting stamp rides back in the
                            // min-cts field so the client can re-freeze
                            Err(DBError::Commit1Conflict { conflict }) => {
                                (DBError::Commit1Conflict { conflict }.code(), conflict)
                            }
                            Err(e) => (e.code(), c1.min_cts),
                        }
                    };
                    self.reply(Body::Commit1(proto::Commit1 { min_cts }), error)
                        .await?;
                }
                Body::Commit2(c2) => {
                    let error = if !self.db().in_txn() {
                        -1
                    } else if !self.db().tx_flags().contains(TxFlags::COMMIT1) {
                        -2
                    } else {
                        match self.db().commit2(c2.min_cts, c2.user_id) {
                            Ok(()) => 0,
                            Err(e) => e.code(),
                        }
                    };
                    self.reply(Body::Commit2(c2), error).await?;
                }
                Body::SyncStamp(ts) | Body::UpdateSyncTs(ts) => {
                    let error = self.db().update_sync_ts(ts).map(|_| 0).unwrap_or(-1);
                    self.reply(Body::UpdateSyncTs(ts), error).await?;
                }
                Body::UpdateStampId(ts) => {
                    self.db().set_stamp_id(ts.id());
                    self.reply(Body::UpdateStampId(ts), 0).await?;
                }
                Body::WaitTran(ts) => {
                    self.wait_tran(ts).await;
                    self.reply(Body::WaitTran(ts), 0).await?;
                }
                Body::RawRead(r) => self.raw_read(r).await?,
                Body::RawWrite(r) => self.raw_write(r).await?,
                Body::Hello(_)
                | Body::OpenInstance
                | Body::Result(_)
                | Body::ResultReset
                | Body::RawData(_)
                | Body::RawWriteEnd(_)
                | Body::RawDataFile(_)
                | Body::ResultOrder(_)
                | Body::ResultLimit(_) => {
                    self.reply(msg.body, -2).await?;
                }
            }
        }

        // teardown: unwind any transaction the client left open
        let mut db = self.db.take().expect("instance database is open");
        while db.in_txn() {
            if db.tx_flags().contains(TxFlags::COMMIT1) {
                let _ = db.uncommit1();
            }
            let _ = db.abort();
        }
        info!("instance stop");
        Ok(())
    }

    // -- queries ---------------------------------------------------------

    async fn run_query(&mut self, sql: String) -> Result<()> {
        let query = match self.parse(&sql) {
            Ok(q) => q,
            Err(e) => {
                return self.reply(Body::RunQuery(String::new()), e.code()).await;
            }
        };

        if matches!(query.op, QueryOp::Select | QueryOp::History) {
            return self.stream_query(query).await;
        }

        // side-effecting statements produce no rows, only a count
        let mut db = self.db.take().expect("instance database is open");
        let result = engine::run_query(&mut db, &query, &mut |_| Ok(()));
        self.db = Some(db);
        let error = match result {
            Ok(outcome) => outcome.count,
            Err(e) => e.code(),
        };
        self.reply(Body::RunQuery(String::new()), error).await
    }

    fn rec_query(&mut self, sql: String) {
        // Recorded queries re-run on the conflict-resolution path; selects
        // have no side effects and are skipped outright. No reply either
        // way.
        let Ok(query) = self.parse(&sql) else { return };
        if query.op.is_read_only() {
            return;
        }
        let mut db = self.db.take().expect("instance database is open");
        let _ = engine::run_query(&mut db, &query, &mut |_| Ok(()));
        self.db = Some(db);
    }

    fn parse(&mut self, sql: &str) -> Result<crate::query::Query> {
        let db = self.db();
        if !db.in_txn() {
            return Err(DBError::NotInTransaction);
        }
        let snap = db.schema_snapshot()?;
        sql::parse(sql.as_bytes(), &snap).inspect_err(|e| {
            if let Some(loc) = e.loc() {
                let (lexer, _) = sql::Lexer::new(sql.as_bytes());
                let token = sql::Token {
                    ty: 0,
                    off: loc.off,
                    len: loc.len,
                    line: loc.line,
                };
                debug!("query error {}:\n{}", e.code(), lexer.error_context(&token));
            }
        })
    }

    /// SELECT/HISTORY: engine on a blocking thread, rows streamed here,
    /// stall credit enforced against the client.
    async fn stream_query(&mut self, query: crate::query::Query) -> Result<()> {
        let mut db = self.db.take().expect("instance database is open");
        let stall_credit = db.options().stall_credit;
        let (tx, mut rx) = tokio::sync::mpsc::channel::<ResultRow>(32);

        let worker = tokio::task::spawn_blocking(move || {
            let result = engine::run_query(&mut db, &query, &mut |row| {
                tx.blocking_send(row).map_err(|_| DBError::SelectBreak)
            });
            (db, result)
        });

        let mut stall: i32 = 0;
        let mut broke = false;
        let mut link_lost = false;
        while let Some(row) = rx.recv().await {
            let msg = Msg::new(Body::Result(row_to_wire(&row)));
            let bytes = msg.encode(Endian::NATIVE).len() as i32;
            if self.send(&msg).await.is_err() {
                // the worker still owns the database; unwind it before
                // surfacing the dead link
                link_lost = true;
                broke = true;
            }
            stall += bytes;

            while stall > stall_credit && !broke {
                match proto::read_msg(&mut self.stream).await {
                    Ok(Some(m)) => match m.body {
                        Body::Continue => stall -= stall_credit / 2,
                        Body::BreakQuery => {
                            broke = true;
                            stall = 0;
                        }
                        _ => {}
                    },
                    Ok(None) | Err(_) => {
                        broke = true;
                        link_lost = true;
                        stall = 0;
                    }
                }
            }
            if broke {
                rx.close();
                break;
            }
        }
        // drain whatever the engine managed to queue before it saw the
        // closed channel
        while rx.recv().await.is_some() {}

        let (db, result) = worker.await.map_err(|_| DBError::General)?;
        self.db = Some(db);
        if link_lost {
            return Err(DBError::LostLink);
        }

        let error = if broke {
            DBError::SelectBreak.code()
        } else {
            match result {
                Ok(QueryOutcome {
                    count,
                    client_order,
                    client_limit,
                }) => {
                    if let Some(order) = client_order {
                        self.send(&Msg::new(Body::ResultOrder(order))).await?;
                    }
                    if let Some((start_row, max_rows)) = client_limit {
                        self.send(&Msg::new(Body::ResultLimit(proto::ResultLimit {
                            start_row,
                            max_rows,
                        })))
                        .await?;
                    }
                    count
                }
                Err(e) => e.code(),
            }
        };
        self.reply(Body::RunQuery(String::new()), error).await
    }

    // -- stamps ----------------------------------------------------------

    async fn wait_tran(&mut self, ts: DbStamp) {
        loop {
            let (done, shared) = {
                let db = self.db();
                (db.sync_ts() >= ts, db.shared().clone())
            };
            if done {
                return;
            }
            let notified = shared.commit_notify.notified();
            let _ = tokio::time::timeout(std::time::Duration::from_millis(100), notified).await;
        }
    }

    // -- raw replication -------------------------------------------------

    async fn raw_read(&mut self, r: proto::RawRange) -> Result<()> {
        self.db().push(r.end_ts, TxFlags::READONLY);
        let result = self.raw_read_inner(r).await;
        let _ = self.db().abort();
        let end_ts = result?;
        self.send(&Msg::new(Body::RawRead(proto::RawRange {
            start_ts: r.start_ts,
            end_ts,
        })))
        .await
    }

    async fn raw_read_inner(&mut self, r: proto::RawRange) -> Result<DbStamp> {
        let files = {
            let db = self.db();
            db.physical_files()?
        };
        let mut end_ts = r.end_ts;
        for file in files {
            // collect this file's window, then stream it out
            let mut packets: Vec<Msg> = Vec::new();
            let mut announced = false;
            let scanned = {
                let db = self.db();
                db.raw_scan(&file, r.start_ts, r.end_ts, &mut |name, block_size, bytes| {
                    if !announced {
                        announced = true;
                        packets.push(Msg::new(Body::RawDataFile(proto::RawDataFile {
                            block_size,
                            file_name: name.to_owned(),
                        })));
                    }
                    packets.push(Msg::new(Body::RawData(bytes.to_vec().into())));
                    Ok(())
                })?
            };
            end_ts = end_ts.min(scanned);
            for msg in packets {
                self.send(&msg).await?;
            }
        }
        Ok(end_ts)
    }

    async fn raw_write(&mut self, _r: proto::RawRange) -> Result<()> {
        let mut cur_file: Option<proto::RawDataFile> = None;
        let mut batch: Vec<Vec<u8>> = Vec::new();
        let mut batch_bytes = 0usize;

        loop {
            let msg = match proto::read_msg(&mut self.stream).await {
                Ok(Some(msg)) => msg,
                Ok(None) | Err(_) => return Err(DBError::LostLink),
            };
            match msg.body {
                Body::RawDataFile(f) => {
                    self.flush_merge(&cur_file, &mut batch)?;
                    batch_bytes = 0;
                    cur_file = Some(f);
                }
                Body::RawData(bytes) => {
                    batch_bytes += bytes.len();
                    batch.push(bytes.to_vec());
                    if batch.len() >= MERGE_COUNT || batch_bytes >= MERGE_BYTES {
                        // only flush on a stamp boundary so one
                        // transaction's records always merge together
                        let last_stamp = record_stamp(batch.last().unwrap());
                        let boundary = batch
                            .iter()
                            .rev()
                            .skip(1)
                            .any(|b| record_stamp(b) != last_stamp);
                        if boundary {
                            let tail: Vec<Vec<u8>> = {
                                let split = batch
                                    .iter()
                                    .position(|b| record_stamp(b) == last_stamp)
                                    .unwrap_or(batch.len());
                                batch.split_off(split)
                            };
                            self.flush_merge(&cur_file, &mut batch)?;
                            batch = tail;
                            batch_bytes = batch.iter().map(Vec::len).sum();
                        }
                    }
                }
                Body::RawWriteEnd(ts) => {
                    self.flush_merge(&cur_file, &mut batch)?;
                    return self.reply(Body::RawWriteEnd(ts), 0).await;
                }
                _ => return Err(DBError::LostLink),
            }
        }
    }

    fn flush_merge(
        &mut self,
        file: &Option<proto::RawDataFile>,
        batch: &mut Vec<Vec<u8>>,
    ) -> Result<()> {
        let Some(f) = file else {
            batch.clear();
            return Ok(());
        };
        if batch.is_empty() {
            return Ok(());
        }
        let records = std::mem::take(batch);
        let merged = {
            let db = self.db();
            db.raw_merge(&f.file_name, f.block_size, &records)?
        };
        debug!("raw merge {}: {merged}/{} records", f.file_name, records.len());
        Ok(())
    }
}

/// Tentative stamp of an encoded record (header offset 8).
fn record_stamp(bytes: &[u8]) -> u64 {
    bytes
        .get(8..16)
        .and_then(|b| b.try_into().ok())
        .map(u64::from_le_bytes)
        .unwrap_or(0)
}

/// Lay a materialized row out as a wire RESULT packet: display columns
/// first, then any sort keys the client needs but does not show.
pub fn row_to_wire(row: &ResultRow) -> proto::RowData {
    let mut b = RowBuilder::new();
    for val in &row.show {
        b.push(val.as_deref());
    }
    b.mark_shown();
    for (val, flags) in &row.sort {
        if flags & SORT_SHOWN != 0 {
            continue;
        }
        b.push(val.as_deref());
    }
    b.finish()
}
