//! Instance dispatcher tests: the framed command loop end to end over an
//! in-memory duplex, including streamed results with stall credit.

use stampdb::db::Db;
use stampdb::{EngineOptions, Instance};
use stampdb_client_api_messages as proto;
use stampdb_client_api_messages::{Body, Endian, Msg, PktFlags};
use stampdb_primitives::{DbStamp, UserId};
use tokio::io::DuplexStream;

async fn start_instance(dir: &std::path::Path, opts: EngineOptions) -> DuplexStream {
    let db = Db::open(dir, opts, true).unwrap();
    let (client, server) = tokio::io::duplex(1 << 20);
    tokio::spawn(Instance::new(db, server).run());
    client
}

async fn send(stream: &mut DuplexStream, msg: &Msg) {
    proto::write_msg(stream, msg, Endian::NATIVE).await.unwrap();
}

async fn recv(stream: &mut DuplexStream) -> Msg {
    proto::read_msg(stream).await.unwrap().expect("stream open")
}

async fn begin(stream: &mut DuplexStream, freeze: DbStamp, flags: PktFlags) {
    send(
        stream,
        &Msg::with_flags(Body::Begin(proto::Begin { freeze_ts: freeze }), flags),
    )
    .await;
}

/// Run one statement and return the terminator's error/count word.
async fn run_sql(stream: &mut DuplexStream, sql: &str) -> i32 {
    send(stream, &Msg::new(Body::RunQuery(sql.into()))).await;
    loop {
        let msg = recv(stream).await;
        if let Body::RunQuery(_) = msg.body {
            return msg.error;
        }
    }
}

async fn commit(stream: &mut DuplexStream) -> DbStamp {
    send(
        stream,
        &Msg::new(Body::Commit1(proto::Commit1 {
            min_cts: DbStamp::new(0),
        })),
    )
    .await;
    let reply = recv(stream).await;
    assert_eq!(reply.error, 0, "commit1 failed");
    let Body::Commit1(c1) = reply.body else {
        panic!("expected commit1 reply")
    };
    send(
        stream,
        &Msg::new(Body::Commit2(proto::Commit2 {
            min_cts: c1.min_cts,
            user_id: UserId(7),
        })),
    )
    .await;
    let reply = recv(stream).await;
    assert_eq!(reply.error, 0, "commit2 failed");
    c1.min_cts
}

#[tokio::test]
async fn hello_then_basic_transaction() {
    let dir = tempfile::tempdir().unwrap();
    let mut c = start_instance(dir.path(), EngineOptions::default()).await;

    let hello = recv(&mut c).await;
    let Body::Hello(h) = hello.body else {
        panic!("instance must greet with HELLO")
    };
    assert!(h.block_size >= 4096);

    begin(&mut c, DbStamp::new(1), PktFlags::empty()).await;
    assert_eq!(
        run_sql(
            &mut c,
            "CREATE TABLE sch.t (a varchar PRIMARY KEY, b varchar);"
        )
        .await,
        0
    );
    assert_eq!(
        run_sql(&mut c, "INSERT INTO sch.t (a,b) VALUES ('k','v');").await,
        1
    );
    let cts = commit(&mut c).await;

    begin(&mut c, cts, PktFlags::READONLY).await;
    send(
        &mut c,
        &Msg::new(Body::RunQuery("SELECT a,b FROM sch.t WHERE a='k';".into())),
    )
    .await;
    let row = recv(&mut c).await;
    let Body::Result(row) = row.body else {
        panic!("expected a RESULT row")
    };
    assert_eq!(row.show_count, 2);
    assert_eq!(row.col(0), Some(&b"k"[..]));
    assert_eq!(row.col(1), Some(&b"v"[..]));
    let term = recv(&mut c).await;
    assert!(matches!(term.body, Body::RunQuery(_)));
    assert_eq!(term.error, 1, "terminator carries the row count");

    send(&mut c, &Msg::new(Body::Abort)).await;
    send(&mut c, &Msg::new(Body::CloseInstance)).await;
    let bye = recv(&mut c).await;
    assert!(matches!(bye.body, Body::CloseInstance));
}

#[tokio::test]
async fn parse_error_reports_wire_code() {
    let dir = tempfile::tempdir().unwrap();
    let mut c = start_instance(dir.path(), EngineOptions::default()).await;
    recv(&mut c).await; // HELLO

    begin(&mut c, DbStamp::new(1), PktFlags::empty()).await;
    // the missing column list must come back as Expected Column
    assert_eq!(run_sql(&mut c, "SELECT FROM t;").await, -36);
    // and running outside a transaction is its own error
    send(&mut c, &Msg::new(Body::Abort)).await;
    assert_eq!(run_sql(&mut c, "SELECT a FROM sch.t;").await, -47);
}

#[tokio::test]
async fn commit1_conflict_travels_back_with_stamp() {
    let dir = tempfile::tempdir().unwrap();
    let mut c1 = start_instance(dir.path(), EngineOptions::default()).await;
    recv(&mut c1).await;

    begin(&mut c1, DbStamp::new(1), PktFlags::empty()).await;
    run_sql(
        &mut c1,
        "CREATE TABLE sch.t (a varchar PRIMARY KEY, b varchar);",
    )
    .await;
    run_sql(&mut c1, "INSERT INTO sch.t (a,b) VALUES ('k','v');").await;
    let base = commit(&mut c1).await;

    let mut c2 = start_instance(dir.path(), EngineOptions::default()).await;
    recv(&mut c2).await;

    begin(&mut c1, base, PktFlags::empty()).await;
    begin(&mut c2, base, PktFlags::empty()).await;
    assert_eq!(
        run_sql(&mut c1, "UPDATE sch.t=t SET t.b='one' WHERE t.a='k';").await,
        1
    );
    assert_eq!(
        run_sql(&mut c2, "UPDATE sch.t=t SET t.b='two' WHERE t.a='k';").await,
        1
    );
    let winner = commit(&mut c1).await;

    send(
        &mut c2,
        &Msg::new(Body::Commit1(proto::Commit1 {
            min_cts: DbStamp::new(0),
        })),
    )
    .await;
    let reply = recv(&mut c2).await;
    assert_eq!(reply.error, -66);
    let Body::Commit1(c) = reply.body else {
        panic!("conflict reply still carries the stamp field")
    };
    assert!(c.min_cts >= winner, "conflicting stamp must come back");
    send(&mut c2, &Msg::new(Body::Abort)).await;
}

#[tokio::test]
async fn streaming_stalls_and_break_stops_the_scan() {
    let dir = tempfile::tempdir().unwrap();
    let mut c = start_instance(dir.path(), EngineOptions::default()).await;
    recv(&mut c).await;

    begin(&mut c, DbStamp::new(1), PktFlags::empty()).await;
    run_sql(
        &mut c,
        "CREATE TABLE sch.t (a varchar PRIMARY KEY, b varchar);",
    )
    .await;
    let filler = "x".repeat(1000);
    for i in 0..300 {
        assert_eq!(
            run_sql(
                &mut c,
                &format!("INSERT INTO sch.t (a,b) VALUES ('key-{i:04}','{filler}');"),
            )
            .await,
            1
        );
    }
    let cts = commit(&mut c).await;

    begin(&mut c, cts, PktFlags::STREAM).await;
    send(
        &mut c,
        &Msg::new(Body::RunQuery("SELECT a,b FROM sch.t;".into())),
    )
    .await;

    // read without granting credit: the server must stall near 64 KiB,
    // far short of the ~300 KiB result. 300ms of silence on an in-memory
    // duplex means the server has stopped sending.
    let mut rows_before_break = 0;
    while let Ok(msg) = tokio::time::timeout(
        std::time::Duration::from_millis(300),
        proto::read_msg(&mut c),
    )
    .await
    {
        match msg.unwrap().unwrap().body {
            Body::Result(_) => rows_before_break += 1,
            other => panic!("unexpected message {other:?}"),
        }
    }
    assert!(
        rows_before_break < 150,
        "server ran {rows_before_break} rows ahead without credit"
    );

    send(&mut c, &Msg::new(Body::BreakQuery)).await;
    // everything after the break is at most in-flight rows, then the
    // terminator with the break error
    let mut term_error = None;
    for _ in 0..rows_before_break + 20 {
        let msg = recv(&mut c).await;
        if let Body::RunQuery(_) = msg.body {
            term_error = Some(msg.error);
            break;
        }
    }
    assert_eq!(term_error, Some(-69), "break must end the query");
    send(&mut c, &Msg::new(Body::Abort)).await;

    // the instance keeps serving after a broken query
    begin(&mut c, cts, PktFlags::READONLY).await;
    assert_eq!(run_sql(&mut c, "COUNT * FROM sch.t;").await, 300);
}

#[tokio::test]
async fn streaming_with_credit_runs_to_completion() {
    let dir = tempfile::tempdir().unwrap();
    let mut c = start_instance(dir.path(), EngineOptions::default()).await;
    recv(&mut c).await;

    begin(&mut c, DbStamp::new(1), PktFlags::empty()).await;
    run_sql(
        &mut c,
        "CREATE TABLE sch.t (a varchar PRIMARY KEY, b varchar);",
    )
    .await;
    let filler = "y".repeat(1000);
    for i in 0..200 {
        run_sql(
            &mut c,
            &format!("INSERT INTO sch.t (a,b) VALUES ('key-{i:04}','{filler}');"),
        )
        .await;
    }
    let cts = commit(&mut c).await;

    begin(&mut c, cts, PktFlags::STREAM).await;
    send(
        &mut c,
        &Msg::new(Body::RunQuery("SELECT a FROM sch.t;".into())),
    )
    .await;

    let mut rows = 0;
    let count = loop {
        let msg = recv(&mut c).await;
        match msg.body {
            Body::Result(_) => {
                rows += 1;
                // grant credit as we consume
                if rows % 20 == 0 {
                    send(&mut c, &Msg::new(Body::Continue)).await;
                }
            }
            Body::RunQuery(_) => break msg.error,
            other => panic!("unexpected message {other:?}"),
        }
    };
    assert_eq!(rows, 200);
    assert_eq!(count, 200);
}

#[tokio::test]
async fn big_endian_client_interoperates() {
    let dir = tempfile::tempdir().unwrap();
    let mut c = start_instance(dir.path(), EngineOptions::default()).await;
    recv(&mut c).await;

    // every client packet encoded most-significant-byte first
    proto::write_msg(
        &mut c,
        &Msg::new(Body::Begin(proto::Begin {
            freeze_ts: DbStamp::new(1),
        })),
        Endian::Big,
    )
    .await
    .unwrap();
    proto::write_msg(
        &mut c,
        &Msg::new(Body::RunQuery(
            "CREATE TABLE sch.t (a varchar PRIMARY KEY);".into(),
        )),
        Endian::Big,
    )
    .await
    .unwrap();
    let term = recv(&mut c).await;
    assert_eq!(term.error, 0);

    proto::write_msg(
        &mut c,
        &Msg::new(Body::RunQuery("INSERT INTO sch.t (a) VALUES ('k');".into())),
        Endian::Big,
    )
    .await
    .unwrap();
    let term = recv(&mut c).await;
    assert_eq!(term.error, 1);

    proto::write_msg(
        &mut c,
        &Msg::new(Body::Commit1(proto::Commit1 {
            min_cts: DbStamp::new(0),
        })),
        Endian::Big,
    )
    .await
    .unwrap();
    let reply = recv(&mut c).await;
    assert_eq!(reply.error, 0);
    let Body::Commit1(c1) = reply.body else { panic!() };
    proto::write_msg(
        &mut c,
        &Msg::new(Body::Commit2(proto::Commit2 {
            min_cts: c1.min_cts,
            user_id: UserId(1),
        })),
        Endian::Big,
    )
    .await
    .unwrap();
    assert_eq!(recv(&mut c).await.error, 0);
}

#[tokio::test]
async fn wait_tran_returns_once_stamp_is_synced() {
    let dir = tempfile::tempdir().unwrap();
    let mut c = start_instance(dir.path(), EngineOptions::default()).await;
    recv(&mut c).await;

    begin(&mut c, DbStamp::new(1), PktFlags::empty()).await;
    run_sql(&mut c, "CREATE TABLE sch.t (a varchar PRIMARY KEY);").await;
    let cts = commit(&mut c).await;

    send(&mut c, &Msg::new(Body::WaitTran(cts))).await;
    let reply = recv(&mut c).await;
    assert!(matches!(reply.body, Body::WaitTran(_)));
    assert_eq!(reply.error, 0);
}

#[tokio::test]
async fn raw_read_streams_records_and_raw_write_merges_them() {
    let src_dir = tempfile::tempdir().unwrap();
    let mut src = start_instance(src_dir.path(), EngineOptions::default()).await;
    recv(&mut src).await;

    begin(&mut src, DbStamp::new(1), PktFlags::empty()).await;
    run_sql(
        &mut src,
        "CREATE TABLE sch.t (a varchar PRIMARY KEY, b varchar);",
    )
    .await;
    run_sql(&mut src, "INSERT INTO sch.t (a,b) VALUES ('k','v');").await;
    let cts = commit(&mut src).await;

    // pull every raw record committed so far
    send(
        &mut src,
        &Msg::new(Body::RawRead(proto::RawRange {
            start_ts: DbStamp::new(0),
            end_ts: DbStamp::new(u64::MAX >> 1),
        })),
    )
    .await;
    let mut files: Vec<(proto::RawDataFile, Vec<bytes::Bytes>)> = Vec::new();
    loop {
        let msg = recv(&mut src).await;
        match msg.body {
            Body::RawDataFile(f) => files.push((f, Vec::new())),
            Body::RawData(data) => files.last_mut().unwrap().1.push(data),
            Body::RawRead(_) => break,
            other => panic!("unexpected message {other:?}"),
        }
    }
    assert!(!files.is_empty());
    let total: usize = files.iter().map(|(_, recs)| recs.len()).sum();
    assert!(total >= 4, "schema, table, column and data records");

    // push them into a fresh database
    let dst_dir = tempfile::tempdir().unwrap();
    let mut dst = start_instance(dst_dir.path(), EngineOptions::default()).await;
    recv(&mut dst).await;

    send(
        &mut dst,
        &Msg::new(Body::RawWrite(proto::RawRange {
            start_ts: DbStamp::new(0),
            end_ts: cts,
        })),
    )
    .await;
    for (file, recs) in &files {
        send(&mut dst, &Msg::new(Body::RawDataFile(file.clone()))).await;
        for rec in recs {
            send(&mut dst, &Msg::new(Body::RawData(rec.clone()))).await;
        }
    }
    send(&mut dst, &Msg::new(Body::RawWriteEnd(cts))).await;
    let done = recv(&mut dst).await;
    assert!(matches!(done.body, Body::RawWriteEnd(_)));
    assert_eq!(done.error, 0);

    // the replica now answers the same query
    begin(&mut dst, cts, PktFlags::READONLY).await;
    send(
        &mut dst,
        &Msg::new(Body::RunQuery("SELECT b FROM sch.t WHERE a='k';".into())),
    )
    .await;
    let row = recv(&mut dst).await;
    let Body::Result(row) = row.body else {
        panic!("replica must return the replicated row")
    };
    assert_eq!(row.col(0), Some(&b"v"[..]));
}
