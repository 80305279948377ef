//! Sidecar index files.
//!
//! The on-disk form is a header plus sorted `(key, offset)` pairs. A file
//! is only trusted when its SYNCED flag is set and its generation matches
//! the table's; anything else is discarded and the index is rebuilt from
//! the table file, which is authoritative.

use stampdb_primitives::{align4, ColId, VTableId};

use super::{IndexOpClass, TableIndex};
use crate::error::IndexError;
use crate::repo::{Repo, TableStorage};

pub const IX_MAGIC: u32 = 0x6478_6942;
pub const IX_VERSION: i32 = 1;
const IX_HEAD_LEN: usize = 32;

const IXF_SYNCED: i32 = 0x0001;

/// File name of the index for one `(vtable, col, opclass)` tuple, derived
/// from the table file's stem (`sch.dt0` -> `sch.o04000400e`).
pub fn index_file_name(table_file: &str, vtable: VTableId, col: ColId, op: IndexOpClass) -> String {
    let stem = table_file.strip_suffix(".dt0").unwrap_or(table_file);
    let tag = match op {
        IndexOpClass::Exact => 'e',
        IndexOpClass::CaseFold => 'f',
    };
    format!("{stem}.o{:04x}{:04x}{tag}", vtable.raw(), col.raw())
}

fn encode_head(op: IndexOpClass, flags: i32, generation: u64, count: u32) -> [u8; IX_HEAD_LEN] {
    let mut buf = [0u8; IX_HEAD_LEN];
    buf[0..4].copy_from_slice(&IX_MAGIC.to_le_bytes());
    buf[4..8].copy_from_slice(&IX_VERSION.to_le_bytes());
    buf[8..12].copy_from_slice(&(IX_HEAD_LEN as i32).to_le_bytes());
    buf[12..16].copy_from_slice(&flags.to_le_bytes());
    buf[16..24].copy_from_slice(&generation.to_le_bytes());
    buf[24..28].copy_from_slice(&count.to_le_bytes());
    buf[28] = op.code();
    buf
}

/// Persist the index. SYNCED is only set once every entry has reached the
/// file, so a crash mid-save leaves a file the loader refuses.
pub fn save_index<R: Repo>(
    repo: &R,
    name: &str,
    index: &TableIndex,
    generation: u64,
) -> Result<(), IndexError> {
    let storage = match repo.open(name) {
        Ok(s) => s,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => repo.create(name)?,
        Err(e) => return Err(e.into()),
    };

    let entries = index.snapshot();
    let head = encode_head(index.op_class(), 0, generation, entries.len() as u32);

    let mut buf = Vec::with_capacity(IX_HEAD_LEN + entries.len() * 24);
    buf.extend_from_slice(&head);
    for (key, off) in &entries {
        buf.extend_from_slice(&(key.len() as u32).to_le_bytes());
        buf.extend_from_slice(&off.to_le_bytes());
        buf.extend_from_slice(key);
        buf.resize(align4(buf.len()), 0);
    }

    storage.set_len(0)?;
    storage.write_all_at(&buf, 0)?;
    storage.sync_data()?;

    let head = encode_head(index.op_class(), IXF_SYNCED, generation, entries.len() as u32);
    storage.write_all_at(&head, 0)?;
    storage.sync_data()?;
    Ok(())
}

/// Clear the SYNCED flag before the first modification after load.
pub fn mark_index_dirty<R: Repo>(repo: &R, name: &str) -> Result<(), IndexError> {
    match repo.open(name) {
        Ok(storage) => {
            let mut head = [0u8; IX_HEAD_LEN];
            storage.read_exact_at(&mut head, 0)?;
            head[12..16].copy_from_slice(&0i32.to_le_bytes());
            storage.write_all_at(&head, 0)?;
            storage.sync_data()?;
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Load a cleanly synced index file whose generation matches the table's.
pub fn load_index<R: Repo>(
    repo: &R,
    name: &str,
    vtable: VTableId,
    col: ColId,
    expect_generation: u64,
) -> Result<TableIndex, IndexError> {
    let storage = repo.open(name)?;
    let mut head = [0u8; IX_HEAD_LEN];
    storage.read_exact_at(&mut head, 0)?;

    let magic = u32::from_le_bytes(head[0..4].try_into().unwrap());
    if magic != IX_MAGIC {
        return Err(IndexError::BadMagic(magic));
    }
    let version = i32::from_le_bytes(head[4..8].try_into().unwrap());
    if version != IX_VERSION {
        return Err(IndexError::BadVersion(version));
    }
    let flags = i32::from_le_bytes(head[12..16].try_into().unwrap());
    let generation = u64::from_le_bytes(head[16..24].try_into().unwrap());
    if flags & IXF_SYNCED == 0 || generation != expect_generation {
        return Err(IndexError::NotSynced { vtable, col });
    }
    let count = u32::from_le_bytes(head[24..28].try_into().unwrap());
    let op = IndexOpClass::from_code(head[28]).ok_or(IndexError::NotSynced { vtable, col })?;

    let total = storage.len()? as usize;
    let mut buf = vec![0u8; total - IX_HEAD_LEN];
    storage.read_exact_at(&mut buf, IX_HEAD_LEN as u64)?;

    let index = TableIndex::new(vtable, col, op);
    let mut pos = 0usize;
    for _ in 0..count {
        if pos + 12 > buf.len() {
            return Err(IndexError::NotSynced { vtable, col });
        }
        let key_len = u32::from_le_bytes(buf[pos..pos + 4].try_into().unwrap()) as usize;
        let off = i64::from_le_bytes(buf[pos + 4..pos + 12].try_into().unwrap());
        pos += 12;
        if pos + key_len > buf.len() {
            return Err(IndexError::NotSynced { vtable, col });
        }
        index.insert_normalized(buf[pos..pos + key_len].to_vec(), off);
        pos = align4(pos + key_len);
    }
    Ok(index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repo::Memory;
    use pretty_assertions::assert_eq;

    #[test]
    fn save_load_roundtrip() {
        let repo = Memory::new();
        let vt = VTableId::new(0x0400);
        let col = ColId::new(0x0400);
        let idx = TableIndex::new(vt, col, IndexOpClass::Exact);
        idx.update(b"alpha", 128);
        idx.update(b"beta", 256);

        let name = index_file_name("sch.dt0", vt, col, IndexOpClass::Exact);
        save_index(&repo, &name, &idx, 7).unwrap();

        let loaded = load_index(&repo, &name, vt, col, 7).unwrap();
        assert_eq!(loaded.scan(crate::index::ScanBound::Eq(b"alpha")), vec![128]);
        assert_eq!(loaded.len(), 2);
    }

    #[test]
    fn stale_generation_is_rejected() {
        let repo = Memory::new();
        let vt = VTableId::new(0x0400);
        let col = ColId::new(0x0400);
        let idx = TableIndex::new(vt, col, IndexOpClass::Exact);
        idx.update(b"alpha", 128);
        let name = index_file_name("sch.dt0", vt, col, IndexOpClass::Exact);
        save_index(&repo, &name, &idx, 7).unwrap();

        let err = load_index(&repo, &name, vt, col, 8).unwrap_err();
        assert!(matches!(err, IndexError::NotSynced { .. }));
    }

    #[test]
    fn dirty_mark_defeats_load() {
        let repo = Memory::new();
        let vt = VTableId::new(0x0400);
        let col = ColId::new(0x0400);
        let idx = TableIndex::new(vt, col, IndexOpClass::CaseFold);
        idx.update(b"Alpha", 64);
        let name = index_file_name("sch.dt0", vt, col, IndexOpClass::CaseFold);
        save_index(&repo, &name, &idx, 1).unwrap();
        mark_index_dirty(&repo, &name).unwrap();

        let err = load_index(&repo, &name, vt, col, 1).unwrap_err();
        assert!(matches!(err, IndexError::NotSynced { .. }));
    }
}
