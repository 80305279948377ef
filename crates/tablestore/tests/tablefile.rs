use std::sync::Arc;

use pretty_assertions::assert_eq;
use stampdb_primitives::{ColId, DbStamp, RecordFlags, UserId, VTableId};
use stampdb_tablestore::datamap::MapBudget;
use stampdb_tablestore::error::TableFileError;
use stampdb_tablestore::index::{IndexOpClass, ScanBound, TableIndex};
use stampdb_tablestore::record::{Record, RecordBuilder};
use stampdb_tablestore::repo::{Fs, Memory};
use stampdb_tablestore::tablefile::{CreateOptions, TableFile, MIN_BLOCK_SIZE};

fn ucol(n: u16) -> ColId {
    ColId::new(ColId::USER_BASE + n)
}

fn small_opts() -> CreateOptions {
    CreateOptions {
        block_size: MIN_BLOCK_SIZE,
        append_inc: MIN_BLOCK_SIZE,
        create_stamp: DbStamp::new(0x42),
    }
}

fn rec(vt: VTableId, stamp: u64, a: &[u8]) -> Vec<u8> {
    RecordBuilder::new(vt, RecordFlags::INSERT, DbStamp::new(stamp), UserId(1))
        .col(ucol(0), Some(a))
        .build()
        .unwrap()
}

#[test]
fn create_append_reopen_scan() {
    let dir = tempfile::tempdir().unwrap();
    let repo = Fs::new(dir.path());
    let vt = VTableId::new(0x0400);

    let offs: Vec<_> = {
        let tf = TableFile::create(&repo, "sch.dt0", &small_opts(), Arc::new(MapBudget::default()))
            .unwrap();
        let offs = (0..10)
            .map(|i| {
                tf.append_record(&rec(vt, 0x100 + i, format!("value-{i}").as_bytes()))
                    .unwrap()
            })
            .collect();
        tf.sync().unwrap();
        offs
    };

    let tf = TableFile::open(&repo, "sch.dt0", Arc::new(MapBudget::default())).unwrap();
    let head = tf.head();
    assert_eq!(head.name, "sch.dt0");
    assert_eq!(head.create_stamp, DbStamp::new(0x42));

    let mut cursor = tf.cursor(None);
    let mut seen = Vec::new();
    while let Some((off, map, range)) = cursor.next_record().unwrap() {
        let rec = Record::parse(&map[range], off).unwrap();
        assert_eq!(rec.vtable(), vt);
        seen.push((off, rec.stamp().raw()));
    }
    assert_eq!(seen.len(), 10);
    assert_eq!(seen.iter().map(|(o, _)| *o).collect::<Vec<_>>(), offs);
    assert_eq!(seen[3].1, 0x103);
}

#[test]
fn records_never_straddle_blocks() {
    let repo = Memory::new();
    let tf = TableFile::create(&repo, "t.dt0", &small_opts(), Arc::new(MapBudget::default()))
        .unwrap();
    let vt = VTableId::new(0x0400);

    // wide records so only a few fit per 4 KiB block
    let wide = vec![b'x'; 1000];
    let mut offs = Vec::new();
    let mut rec_len = 0;
    for i in 0..20u64 {
        let bytes = RecordBuilder::new(vt, RecordFlags::INSERT, DbStamp::new(i + 1), UserId(0))
            .col(ucol(0), Some(&wide))
            .build()
            .unwrap();
        rec_len = bytes.len() as i64;
        offs.push(tf.append_record(&bytes).unwrap());
    }
    let bs = MIN_BLOCK_SIZE as i64;
    for off in &offs {
        assert!(off % bs >= 24, "records sit behind the block header");
        assert!(off % bs + rec_len <= bs, "record must not straddle a block");
    }

    let mut cursor = tf.cursor(None);
    let mut n = 0;
    while let Some((_, map, range)) = cursor.next_record().unwrap() {
        let rec = Record::parse(&map[range], 0).unwrap();
        assert_eq!(rec.get(ucol(0)).unwrap().unwrap().len(), 1000);
        n += 1;
    }
    assert_eq!(n, 20);
}

#[test]
fn cursor_bounded_hides_later_appends() {
    let repo = Memory::new();
    let tf = TableFile::create(&repo, "t.dt0", &small_opts(), Arc::new(MapBudget::default()))
        .unwrap();
    let vt = VTableId::new(0x0400);
    tf.append_record(&rec(vt, 1, b"one")).unwrap();
    let limit = tf.head().append;
    tf.append_record(&rec(vt, 2, b"two")).unwrap();

    let mut cursor = tf.cursor_bounded(None, limit);
    let mut stamps = Vec::new();
    while let Some((off, map, range)) = cursor.next_record().unwrap() {
        stamps.push(Record::parse(&map[range], off).unwrap().stamp().raw());
    }
    assert_eq!(stamps, vec![1]);
}

#[test]
fn open_rejects_truncated_file() {
    let dir = tempfile::tempdir().unwrap();
    let repo = Fs::new(dir.path());
    {
        let tf = TableFile::create(&repo, "t.dt0", &small_opts(), Arc::new(MapBudget::default()))
            .unwrap();
        tf.append_record(&rec(VTableId::new(0x400), 1, b"x")).unwrap();
        tf.sync().unwrap();
    }
    let path = dir.path().join("t.dt0");
    let len = std::fs::metadata(&path).unwrap().len();
    let f = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
    f.set_len(len / 2).unwrap();

    let err = TableFile::open(&repo, "t.dt0", Arc::new(MapBudget::default())).unwrap_err();
    assert!(matches!(err, TableFileError::Truncated { .. }));
}

#[test]
fn open_rejects_bad_magic() {
    let repo = Memory::new();
    {
        TableFile::create(&repo, "t.dt0", &small_opts(), Arc::new(MapBudget::default())).unwrap();
    }
    use stampdb_tablestore::repo::{Repo, TableStorage};
    let storage = repo.open("t.dt0").unwrap();
    storage.write_all_at(&[0xde, 0xad, 0xbe, 0xef], 0).unwrap();

    let err = TableFile::open(&repo, "t.dt0", Arc::new(MapBudget::default())).unwrap_err();
    assert!(matches!(err, TableFileError::BadMagic(_)));
}

#[test]
fn stamp_setters_persist_across_reopen() {
    let repo = Memory::new();
    {
        let tf = TableFile::create(&repo, "t.dt0", &small_opts(), Arc::new(MapBudget::default()))
            .unwrap();
        tf.set_sync_stamp(DbStamp::new(0x500)).unwrap();
        tf.set_next_stamp(DbStamp::new(0x600)).unwrap();
        // setters never move stamps backwards
        tf.set_sync_stamp(DbStamp::new(0x100)).unwrap();
        tf.sync().unwrap();
    }
    let tf = TableFile::open(&repo, "t.dt0", Arc::new(MapBudget::default())).unwrap();
    assert_eq!(tf.head().sync_stamp, DbStamp::new(0x500));
    assert_eq!(tf.head().next_stamp, DbStamp::new(0x600));
}

#[test]
fn index_rebuild_matches_saved_index() {
    let repo = Memory::new();
    let vt = VTableId::new(0x0400);
    let tf = TableFile::create(&repo, "t.dt0", &small_opts(), Arc::new(MapBudget::default()))
        .unwrap();

    let saved = TableIndex::new(vt, ucol(0), IndexOpClass::Exact);
    for key in ["cherry", "apple", "banana"] {
        let off = tf.append_record(&rec(vt, 1, key.as_bytes())).unwrap();
        saved.update(key.as_bytes(), off);
    }

    // rebuild from the authoritative table file
    let rebuilt = TableIndex::new(vt, ucol(0), IndexOpClass::Exact);
    let mut cursor = tf.cursor(None);
    while let Some((off, map, range)) = cursor.next_record().unwrap() {
        let rec = Record::parse(&map[range], off).unwrap();
        if let Some(Some(key)) = rec.get(ucol(0)) {
            rebuilt.update(key, off);
        }
    }

    assert_eq!(
        saved.scan(ScanBound::All),
        rebuilt.scan(ScanBound::All),
        "rebuilt index must order offsets identically"
    );
}
