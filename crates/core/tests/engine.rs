//! End-to-end engine scenarios: DDL + DML through parse, execute and
//! two-phase commit, and the visibility rules across freeze stamps.

use pretty_assertions::assert_eq;
use stampdb::db::Db;
use stampdb::engine::{run_query, ResultRow};
use stampdb::error::DBError;
use stampdb::{EngineOptions, TxFlags};
use stampdb_primitives::{DbStamp, UserId};

fn open_db(dir: &std::path::Path) -> Db {
    Db::open(dir, EngineOptions::default(), true).unwrap()
}

fn exec(db: &mut Db, sql: &str) -> Result<i32, DBError> {
    let snap = db.schema_snapshot()?;
    let q = stampdb::sql::parse(sql.as_bytes(), &snap)?;
    run_query(db, &q, &mut |_| Ok(())).map(|o| o.count)
}

fn rows(db: &mut Db, sql: &str) -> Result<(i32, Vec<Vec<Option<Vec<u8>>>>), DBError> {
    let snap = db.schema_snapshot()?;
    let q = stampdb::sql::parse(sql.as_bytes(), &snap)?;
    let mut out = Vec::new();
    let outcome = run_query(db, &q, &mut |row: ResultRow| {
        out.push(row.show.clone());
        Ok(())
    })?;
    Ok((outcome.count, out))
}

fn commit(db: &mut Db) -> DbStamp {
    let min_cts = db.commit1(DbStamp::new(0)).unwrap();
    db.commit2(min_cts, UserId(1)).unwrap();
    min_cts
}

fn s(v: &str) -> Option<Vec<u8>> {
    Some(v.as_bytes().to_vec())
}

#[test]
fn create_insert_select_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let mut db = open_db(dir.path());

    db.push(DbStamp::new(1), TxFlags::empty());
    exec(
        &mut db,
        "CREATE TABLE sch.t (a varchar PRIMARY KEY, b varchar);",
    )
    .unwrap();
    assert_eq!(
        exec(&mut db, "INSERT INTO sch.t (a,b) VALUES ('k','v');").unwrap(),
        1
    );
    let cts = commit(&mut db);

    db.push(cts, TxFlags::READONLY);
    let (count, got) = rows(&mut db, "SELECT a,b FROM sch.t WHERE a='k';").unwrap();
    assert_eq!(count, 1);
    assert_eq!(got, vec![vec![s("k"), s("v")]]);
    db.abort().unwrap();
}

#[test]
fn own_writes_are_visible_before_commit() {
    let dir = tempfile::tempdir().unwrap();
    let mut db = open_db(dir.path());

    db.push(DbStamp::new(1), TxFlags::empty());
    exec(&mut db, "CREATE TABLE sch.t (a varchar PRIMARY KEY, b varchar);").unwrap();
    exec(&mut db, "INSERT INTO sch.t (a,b) VALUES ('k','v');").unwrap();
    let (count, got) = rows(&mut db, "SELECT b FROM sch.t WHERE a='k';").unwrap();
    assert_eq!(count, 1);
    assert_eq!(got[0], vec![s("v")]);
    db.abort().unwrap();

    // aborted: nothing committed
    db.push(db.latest_stamp(), TxFlags::READONLY);
    assert!(matches!(
        rows(&mut db, "SELECT b FROM sch.t WHERE a='k';"),
        Err(DBError::TableNotFound(..))
    ));
    db.abort().unwrap();
}

#[test]
fn update_visibility_across_freeze_stamps() {
    let dir = tempfile::tempdir().unwrap();
    let mut db = open_db(dir.path());

    db.push(DbStamp::new(1), TxFlags::empty());
    exec(&mut db, "CREATE TABLE sch.t (a varchar PRIMARY KEY, b varchar);").unwrap();
    exec(&mut db, "INSERT INTO sch.t (a,b) VALUES ('k1','v1');").unwrap();
    exec(&mut db, "INSERT INTO sch.t (a,b) VALUES ('k2','v2');").unwrap();
    let cts1 = commit(&mut db);

    db.push(cts1, TxFlags::empty());
    assert_eq!(
        exec(&mut db, "UPDATE sch.t=t SET t.b='v2x' WHERE t.a='k2';").unwrap(),
        1
    );
    let cts2 = commit(&mut db);
    assert!(cts2 > cts1);

    // a reader at the old freeze stamp still sees the old value
    db.push(cts1, TxFlags::READONLY);
    let (_, got) = rows(&mut db, "SELECT b FROM sch.t WHERE a='k2';").unwrap();
    assert_eq!(got, vec![vec![s("v2")]]);
    db.abort().unwrap();

    // a reader at the new freeze sees the update
    db.push(cts2, TxFlags::READONLY);
    let (_, got) = rows(&mut db, "SELECT b FROM sch.t WHERE a='k2';").unwrap();
    assert_eq!(got, vec![vec![s("v2x")]]);
    // and k1 is untouched
    let (_, got) = rows(&mut db, "SELECT b FROM sch.t WHERE a='k1';").unwrap();
    assert_eq!(got, vec![vec![s("v1")]]);
    db.abort().unwrap();
}

#[test]
fn commit1_conflict_reports_conflicting_stamp() {
    let dir = tempfile::tempdir().unwrap();
    let mut db1 = open_db(dir.path());

    db1.push(DbStamp::new(1), TxFlags::empty());
    exec(&mut db1, "CREATE TABLE sch.t (a varchar PRIMARY KEY, b varchar);").unwrap();
    exec(&mut db1, "INSERT INTO sch.t (a,b) VALUES ('k','v');").unwrap();
    let base = commit(&mut db1);

    // two transactions frozen at the same point update the same row
    let mut db2 = open_db(dir.path());
    db1.push(base, TxFlags::empty());
    db2.push(base, TxFlags::empty());
    exec(&mut db1, "UPDATE sch.t=t SET t.b='from-t1' WHERE t.a='k';").unwrap();
    exec(&mut db2, "UPDATE sch.t=t SET t.b='from-t2' WHERE t.a='k';").unwrap();

    let cts1 = commit(&mut db1);

    let err = db2.commit1(DbStamp::new(0)).unwrap_err();
    match err {
        DBError::Commit1Conflict { conflict } => assert!(conflict >= cts1),
        other => panic!("expected conflict, got {other:?}"),
    }
    db2.abort().unwrap();
}

#[test]
fn phase1_rendezvous_conflicts_before_commit2() {
    let dir = tempfile::tempdir().unwrap();
    let mut db1 = open_db(dir.path());

    db1.push(DbStamp::new(1), TxFlags::empty());
    exec(&mut db1, "CREATE TABLE sch.t (a varchar PRIMARY KEY, b varchar);").unwrap();
    exec(&mut db1, "INSERT INTO sch.t (a,b) VALUES ('k','v');").unwrap();
    let base = commit(&mut db1);

    let mut db2 = open_db(dir.path());
    db1.push(base, TxFlags::empty());
    db2.push(base, TxFlags::empty());
    exec(&mut db1, "UPDATE sch.t=t SET t.b='x' WHERE t.a='k';").unwrap();
    exec(&mut db2, "UPDATE sch.t=t SET t.b='y' WHERE t.a='k';").unwrap();

    // only phase 1 has happened on db1; db2 must still observe it
    let min1 = db1.commit1(DbStamp::new(0)).unwrap();
    let err = db2.commit1(DbStamp::new(0)).unwrap_err();
    match err {
        DBError::Commit1Conflict { conflict } => assert!(conflict >= min1),
        other => panic!("expected conflict, got {other:?}"),
    }

    // backing out phase 1 releases the rendezvous slot
    db1.uncommit1().unwrap();
    db2.abort().unwrap();
    let min2 = db1.commit1(DbStamp::new(0)).unwrap();
    db1.commit2(min2, UserId(1)).unwrap();
}

#[test]
fn update_pair_shares_one_stamp() {
    let dir = tempfile::tempdir().unwrap();
    let mut db = open_db(dir.path());

    db.push(DbStamp::new(1), TxFlags::empty());
    exec(&mut db, "CREATE TABLE sch.t (a varchar PRIMARY KEY, b varchar);").unwrap();
    exec(&mut db, "INSERT INTO sch.t (a,b) VALUES ('k','v');").unwrap();
    commit(&mut db);

    db.push(db.latest_stamp(), TxFlags::empty());
    exec(&mut db, "UPDATE sch.t=t SET t.b='v2' WHERE t.a='k';").unwrap();
    commit(&mut db);

    // HISTORY exposes every version; the delete and the update-insert of
    // the pair must carry identical timestamps
    db.push(db.latest_stamp(), TxFlags::READONLY);
    let (_, got) = rows(
        &mut db,
        "HISTORY __opcode, __timestamp, b FROM sch.t WHERE a='k';",
    )
    .unwrap();
    let find = |op: &str| {
        got.iter()
            .filter(|r| r[0] == s(op))
            .map(|r| r[1].clone().unwrap())
            .collect::<Vec<_>>()
    };
    let deletes = find("d");
    let updates = find("u");
    assert_eq!(deletes.len(), 1);
    assert_eq!(updates.len(), 1);
    assert_eq!(deletes[0], updates[0], "update pair stamps must match");
    db.abort().unwrap();
}

#[test]
fn delete_suppresses_and_history_returns_all() {
    let dir = tempfile::tempdir().unwrap();
    let mut db = open_db(dir.path());

    db.push(DbStamp::new(1), TxFlags::empty());
    exec(&mut db, "CREATE TABLE sch.t (a varchar PRIMARY KEY, b varchar);").unwrap();
    exec(&mut db, "INSERT INTO sch.t (a,b) VALUES ('k1','v1');").unwrap();
    exec(&mut db, "INSERT INTO sch.t (a,b) VALUES ('k2','v2');").unwrap();
    commit(&mut db);

    db.push(db.latest_stamp(), TxFlags::empty());
    assert_eq!(exec(&mut db, "DELETE FROM sch.t WHERE a='k1';").unwrap(), 1);
    let cts = commit(&mut db);

    db.push(cts, TxFlags::READONLY);
    let (count, got) = rows(&mut db, "SELECT a FROM sch.t;").unwrap();
    assert_eq!(count, 1);
    assert_eq!(got, vec![vec![s("k2")]]);

    // the full history still carries the dead row and its delete marker
    let (_, hist) = rows(&mut db, "HISTORY a, __opcode FROM sch.t WHERE a='k1';").unwrap();
    assert_eq!(hist.len(), 2);
    assert!(hist.iter().any(|r| r[1] == s("d")));
    assert!(hist.iter().any(|r| r[1] == s("i")));
    db.abort().unwrap();
}

#[test]
fn duplicate_primary_key_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let mut db = open_db(dir.path());

    db.push(DbStamp::new(1), TxFlags::empty());
    exec(&mut db, "CREATE TABLE sch.t (a varchar PRIMARY KEY, b varchar);").unwrap();
    exec(&mut db, "INSERT INTO sch.t (a,b) VALUES ('k','v');").unwrap();
    commit(&mut db);

    db.push(db.latest_stamp(), TxFlags::empty());
    let err = exec(&mut db, "INSERT INTO sch.t (a,b) VALUES ('k','other');").unwrap_err();
    assert_eq!(err.code(), -59);
    // a NULL key is just as illegal
    let err = exec(&mut db, "INSERT INTO sch.t (a,b) VALUES (NULL,'x');").unwrap_err();
    assert_eq!(err.code(), -57);
    db.abort().unwrap();
}

#[test]
fn order_by_sorts_and_limit_bounds() {
    let dir = tempfile::tempdir().unwrap();
    let mut db = open_db(dir.path());

    db.push(DbStamp::new(1), TxFlags::empty());
    exec(&mut db, "CREATE TABLE sch.t (a varchar PRIMARY KEY, b varchar);").unwrap();
    for (a, b) in [("3", "c"), ("1", "a"), ("5", "e"), ("2", "b"), ("4", "d")] {
        exec(
            &mut db,
            &format!("INSERT INTO sch.t (a,b) VALUES ('{a}','{b}');"),
        )
        .unwrap();
    }
    let cts = commit(&mut db);

    db.push(cts, TxFlags::READONLY);
    let (count, got) = rows(&mut db, "SELECT a FROM sch.t ORDER BY a LIMIT 3;").unwrap();
    assert_eq!(count, 3);
    assert_eq!(got, vec![vec![s("1")], vec![s("2")], vec![s("3")]]);

    let (_, got) = rows(&mut db, "SELECT a FROM sch.t ORDER BY a DESC LIMIT 2;").unwrap();
    assert_eq!(got, vec![vec![s("5")], vec![s("4")]]);

    // LIMIT start,max names a window
    let (_, got) = rows(&mut db, "SELECT a FROM sch.t ORDER BY a LIMIT 1, 2;").unwrap();
    assert_eq!(got, vec![vec![s("2")], vec![s("3")]]);
    db.abort().unwrap();
}

#[test]
fn order_by_above_cutoff_streams_and_asks_client_to_sort() {
    let dir = tempfile::tempdir().unwrap();
    let mut db = Db::open(
        dir.path(),
        EngineOptions::default().sort_buffer_rows(4),
        true,
    )
    .unwrap();

    db.push(DbStamp::new(1), TxFlags::empty());
    exec(&mut db, "CREATE TABLE sch.t (a varchar PRIMARY KEY, b varchar);").unwrap();
    for i in 0..10 {
        exec(
            &mut db,
            &format!("INSERT INTO sch.t (a,b) VALUES ('k{i}','v');"),
        )
        .unwrap();
    }
    let cts = commit(&mut db);

    db.push(cts, TxFlags::READONLY);
    let snap = db.schema_snapshot().unwrap();
    let q = stampdb::sql::parse(b"SELECT a FROM sch.t ORDER BY a LIMIT 3;", &snap).unwrap();
    let mut n = 0;
    let outcome = run_query(&mut db, &q, &mut |_| {
        n += 1;
        Ok(())
    })
    .unwrap();
    // ten rows streamed unsorted; ordering and the limit belong to the
    // client now
    assert_eq!(n, 10);
    assert!(outcome.client_order.is_some());
    assert_eq!(outcome.client_limit, Some((0, 3)));
    db.abort().unwrap();
}

#[test]
fn count_and_cartesian_join() {
    let dir = tempfile::tempdir().unwrap();
    let mut db = open_db(dir.path());

    db.push(DbStamp::new(1), TxFlags::empty());
    exec(&mut db, "CREATE TABLE sch.t (a varchar PRIMARY KEY, b varchar);").unwrap();
    exec(&mut db, "CREATE TABLE sch.u (k varchar PRIMARY KEY, w varchar);").unwrap();
    exec(&mut db, "INSERT INTO sch.t (a,b) VALUES ('x','1');").unwrap();
    exec(&mut db, "INSERT INTO sch.t (a,b) VALUES ('y','2');").unwrap();
    exec(&mut db, "INSERT INTO sch.u (k,w) VALUES ('x','one');").unwrap();
    exec(&mut db, "INSERT INTO sch.u (k,w) VALUES ('y','two');").unwrap();
    let cts = commit(&mut db);

    db.push(cts, TxFlags::READONLY);
    assert_eq!(exec(&mut db, "COUNT * FROM sch.t;").unwrap(), 2);

    // equi-join through the WHERE clause
    let (count, got) = rows(
        &mut db,
        "SELECT t.a, u.w FROM sch.t=t, sch.u=u WHERE t.a = u.k ORDER BY t.a;",
    )
    .unwrap();
    assert_eq!(count, 2);
    assert_eq!(
        got,
        vec![vec![s("x"), s("one")], vec![s("y"), s("two")]]
    );
    db.abort().unwrap();
}

#[test]
fn ddl_alter_and_drop() {
    let dir = tempfile::tempdir().unwrap();
    let mut db = open_db(dir.path());

    db.push(DbStamp::new(1), TxFlags::empty());
    exec(&mut db, "CREATE TABLE sch.t (a varchar PRIMARY KEY);").unwrap();
    commit(&mut db);

    db.push(db.latest_stamp(), TxFlags::empty());
    exec(&mut db, "ALTER TABLE sch.t ADD COLUMN b varchar;").unwrap();
    commit(&mut db);

    db.push(db.latest_stamp(), TxFlags::empty());
    exec(&mut db, "INSERT INTO sch.t (a,b) VALUES ('k','v');").unwrap();
    let cts = commit(&mut db);

    db.push(cts, TxFlags::READONLY);
    let (_, got) = rows(&mut db, "SELECT b FROM sch.t WHERE a='k';").unwrap();
    assert_eq!(got, vec![vec![s("v")]]);
    db.abort().unwrap();

    db.push(db.latest_stamp(), TxFlags::empty());
    exec(&mut db, "DROP TABLE sch.t;").unwrap();
    commit(&mut db);

    db.push(db.latest_stamp(), TxFlags::READONLY);
    assert!(matches!(
        rows(&mut db, "SELECT a FROM sch.t;"),
        Err(DBError::TableNotFound(..))
    ));
    db.abort().unwrap();
}

#[test]
fn create_table_sql_reparses_to_same_schema() {
    let dir = tempfile::tempdir().unwrap();
    let mut db = open_db(dir.path());

    db.push(DbStamp::new(1), TxFlags::empty());
    exec(
        &mut db,
        "CREATE TABLE sch.t (a varchar PRIMARY KEY, b varchar NOT NULL, c varchar);",
    )
    .unwrap();
    commit(&mut db);

    db.push(db.latest_stamp(), TxFlags::empty());
    let snap = db.schema_snapshot().unwrap();
    let def = snap.table("sch", "t").unwrap().clone();

    // emit the DDL back out, rebuild under another name, compare
    let sql = def.to_create_sql().replace("sch.t", "sch.t2");
    exec(&mut db, &sql).unwrap();
    commit(&mut db);

    db.push(db.latest_stamp(), TxFlags::READONLY);
    let snap = db.schema_snapshot().unwrap();
    let redef = snap.table("sch", "t2").unwrap();
    assert_eq!(def.cols.len(), redef.cols.len());
    for (c1, c2) in def.cols.iter().zip(&redef.cols) {
        assert_eq!(c1.name, c2.name);
        assert_eq!(c1.flags, c2.flags);
        assert_eq!(c1.dtype, c2.dtype);
    }
    db.abort().unwrap();
}

#[test]
fn nested_transactions_merge_into_parent() {
    let dir = tempfile::tempdir().unwrap();
    let mut db = open_db(dir.path());

    db.push(DbStamp::new(1), TxFlags::empty());
    exec(&mut db, "CREATE TABLE sch.t (a varchar PRIMARY KEY, b varchar);").unwrap();
    commit(&mut db);

    db.push(db.latest_stamp(), TxFlags::empty());
    // inner transaction commits into the parent, not to disk
    db.push(DbStamp::new(0), TxFlags::empty());
    exec(&mut db, "INSERT INTO sch.t (a,b) VALUES ('k','inner');").unwrap();
    let min = db.commit1(DbStamp::new(0)).unwrap();
    db.commit2(min, UserId(1)).unwrap();
    assert_eq!(db.level(), 1);

    // the parent sees it, a concurrent reader does not
    let (count, _) = rows(&mut db, "SELECT a FROM sch.t WHERE a='k';").unwrap();
    assert_eq!(count, 1);
    let cts = commit(&mut db);

    db.push(cts, TxFlags::READONLY);
    let (count, _) = rows(&mut db, "SELECT a FROM sch.t WHERE a='k';").unwrap();
    assert_eq!(count, 1);
    db.abort().unwrap();
}

#[test]
fn clone_keeps_the_original_row() {
    let dir = tempfile::tempdir().unwrap();
    let mut db = open_db(dir.path());

    db.push(DbStamp::new(1), TxFlags::empty());
    exec(&mut db, "CREATE TABLE sch.t (a varchar, b varchar);").unwrap();
    exec(&mut db, "INSERT INTO sch.t (a,b) VALUES ('k','orig');").unwrap();
    commit(&mut db);

    db.push(db.latest_stamp(), TxFlags::empty());
    assert_eq!(
        exec(&mut db, "CLONE sch.t=t SET t.b='copy' WHERE t.a='k';").unwrap(),
        1
    );
    let cts = commit(&mut db);

    db.push(cts, TxFlags::READONLY);
    let (count, mut got) = rows(&mut db, "SELECT b FROM sch.t WHERE a='k';").unwrap();
    got.sort();
    assert_eq!(count, 2);
    assert_eq!(got, vec![vec![s("copy")], vec![s("orig")]]);
    db.abort().unwrap();
}
