//! Physical record encode/decode.
//!
//! A record is a fixed header, a sorted array of column headers, then the
//! column payloads. Payloads are 4-byte aligned and always followed by at
//! least two NUL bytes; the whole record is rounded up to 8 bytes. Column
//! lengths use a two-tier scheme: values below `0xF0` are the literal
//! unaligned length, `0xF0` means a 32-bit length prefixes the payload,
//! and `0xFF` marks a NULL column with no payload at all.
//!
//! All multi-byte fields are little-endian on disk.

use smallvec::SmallVec;
use stampdb_primitives::{align4, align8, ColId, DbOff, DbStamp, RecordFlags, UserId, VTableId};

use crate::error::RecordError;

pub const REC_MAGIC: u8 = 0xD1;

pub const BSIZE_EXT_BASE: u8 = 0xF0;
pub const BSIZE_EXT_32: u8 = 0xF0;
pub const BSIZE_EXT_NULL: u8 = 0xFF;

pub const REC_HEAD_LEN: usize = 24;
pub const COL_HEAD_LEN: usize = 4;

/// 16-bit content hash used by the delete-match logic.
///
/// Both halves of an update pair must hash equal over the columns that
/// identify the row, so the hash is computed over an explicit column
/// subset by the caller.
pub fn content_hash<'a, I>(cols: I) -> u16
where
    I: IntoIterator<Item = (ColId, Option<&'a [u8]>)>,
{
    let mut h: u32 = 0x811c_9dc5;
    let mut mix = |b: u8| {
        h ^= b as u32;
        h = h.wrapping_mul(0x0100_0193);
    };
    for (col, data) in cols {
        mix(col.raw() as u8);
        mix((col.raw() >> 8) as u8);
        match data {
            None => mix(0xFF),
            Some(bytes) => {
                for &b in bytes {
                    mix(b);
                }
                mix(0);
            }
        }
    }
    (h ^ (h >> 16)) as u16
}

/// Assembles one record into its aligned on-disk byte form.
#[derive(Debug, Default)]
pub struct RecordBuilder {
    flags: RecordFlags,
    vtable: VTableId,
    stamp: DbStamp,
    user: UserId,
    hash: u16,
    cols: Vec<(ColId, Option<Vec<u8>>)>,
}

impl RecordBuilder {
    pub fn new(vtable: VTableId, flags: RecordFlags, stamp: DbStamp, user: UserId) -> Self {
        RecordBuilder {
            flags,
            vtable,
            stamp,
            user,
            hash: 0,
            cols: Vec::new(),
        }
    }

    pub fn hash(mut self, hash: u16) -> Self {
        self.hash = hash;
        self
    }

    pub fn col(mut self, col: ColId, data: Option<&[u8]>) -> Self {
        self.cols.push((col, data.map(|d| d.to_vec())));
        self
    }

    pub fn encoded_len(&self) -> usize {
        let mut n = REC_HEAD_LEN + COL_HEAD_LEN * self.cols.len();
        for (_, data) in &self.cols {
            n += match data {
                None => 0,
                Some(d) if d.len() < BSIZE_EXT_BASE as usize => align4(d.len() + 2),
                Some(d) => align4(4 + d.len() + 2),
            };
        }
        align8(n)
    }

    pub fn build(mut self) -> Result<Vec<u8>, RecordError> {
        if !self.flags.op_valid() {
            return Err(RecordError::BadFlags(self.flags.bits()));
        }
        self.cols.sort_by_key(|(col, _)| *col);
        for w in self.cols.windows(2) {
            if w[0].0 == w[1].0 {
                return Err(RecordError::DuplicateColumn(w[0].0));
            }
        }

        let size = self.encoded_len();
        let mut buf = vec![0u8; size];

        buf[0] = REC_MAGIC;
        buf[1] = self.flags.bits();
        buf[2..4].copy_from_slice(&self.vtable.raw().to_le_bytes());
        buf[4..8].copy_from_slice(&(size as i32).to_le_bytes());
        buf[8..16].copy_from_slice(&self.stamp.raw().to_le_bytes());
        buf[16..18].copy_from_slice(&(self.cols.len() as u16).to_le_bytes());
        buf[18..20].copy_from_slice(&self.hash.to_le_bytes());
        buf[20..24].copy_from_slice(&self.user.raw().to_le_bytes());

        let mut hoff = REC_HEAD_LEN;
        let mut doff = REC_HEAD_LEN + COL_HEAD_LEN * self.cols.len();
        for (col, data) in &self.cols {
            buf[hoff..hoff + 2].copy_from_slice(&col.raw().to_le_bytes());
            buf[hoff + 2] = 0;
            match data {
                None => buf[hoff + 3] = BSIZE_EXT_NULL,
                Some(d) if d.len() < BSIZE_EXT_BASE as usize => {
                    buf[hoff + 3] = d.len() as u8;
                    buf[doff..doff + d.len()].copy_from_slice(d);
                    // trailing NULs already zero-filled
                    doff += align4(d.len() + 2);
                }
                Some(d) => {
                    buf[hoff + 3] = BSIZE_EXT_32;
                    buf[doff..doff + 4].copy_from_slice(&(d.len() as u32).to_le_bytes());
                    buf[doff + 4..doff + 4 + d.len()].copy_from_slice(d);
                    doff += align4(4 + d.len() + 2);
                }
            }
            hoff += COL_HEAD_LEN;
        }
        Ok(buf)
    }
}

type ColSpan = Option<(usize, usize)>;

/// A decoded view borrowing the record's bytes.
#[derive(Debug)]
pub struct Record<'a> {
    buf: &'a [u8],
    cols: SmallVec<[(ColId, ColSpan); 8]>,
}

impl<'a> Record<'a> {
    /// Decode and validate the record starting at `buf[0]`. `offset` is
    /// only used for error reporting.
    pub fn parse(buf: &'a [u8], offset: DbOff) -> Result<Record<'a>, RecordError> {
        if buf.len() < REC_HEAD_LEN {
            return Err(RecordError::Truncated {
                offset,
                size: buf.len() as i32,
            });
        }
        if buf[0] != REC_MAGIC {
            return Err(RecordError::BadMagic {
                offset,
                found: buf[0],
            });
        }
        let flags = RecordFlags::from_bits_retain(buf[1]);
        if !flags.op_valid() {
            return Err(RecordError::BadFlags(buf[1]));
        }
        let size = i32::from_le_bytes(buf[4..8].try_into().unwrap());
        if size < REC_HEAD_LEN as i32 || size as usize > buf.len() {
            return Err(RecordError::Truncated { offset, size });
        }
        let buf = &buf[..size as usize];
        let ncols = u16::from_le_bytes(buf[16..18].try_into().unwrap()) as usize;
        if REC_HEAD_LEN + ncols * COL_HEAD_LEN > buf.len() {
            return Err(RecordError::Truncated { offset, size });
        }

        let mut cols = SmallVec::with_capacity(ncols);
        let mut doff = REC_HEAD_LEN + ncols * COL_HEAD_LEN;
        let mut prev: Option<ColId> = None;
        for i in 0..ncols {
            let hoff = REC_HEAD_LEN + i * COL_HEAD_LEN;
            let col = ColId::new(u16::from_le_bytes(buf[hoff..hoff + 2].try_into().unwrap()));
            match prev {
                Some(p) if p == col => return Err(RecordError::DuplicateColumn(col)),
                Some(p) if p > col => return Err(RecordError::UnsortedColumns),
                _ => prev = Some(col),
            }
            let code = buf[hoff + 3];
            let span = match code {
                BSIZE_EXT_NULL => None,
                BSIZE_EXT_32 => {
                    if doff + 4 > buf.len() {
                        return Err(RecordError::ColumnOverrun { col });
                    }
                    let len =
                        u32::from_le_bytes(buf[doff..doff + 4].try_into().unwrap()) as usize;
                    let start = doff + 4;
                    if start + len + 2 > buf.len() {
                        return Err(RecordError::ColumnOverrun { col });
                    }
                    doff += align4(4 + len + 2);
                    Some((start, len))
                }
                len if len < BSIZE_EXT_BASE => {
                    let len = len as usize;
                    if doff + len + 2 > buf.len() {
                        return Err(RecordError::ColumnOverrun { col });
                    }
                    let start = doff;
                    doff += align4(len + 2);
                    Some((start, len))
                }
                _ => return Err(RecordError::ColumnOverrun { col }),
            };
            cols.push((col, span));
        }
        Ok(Record { buf, cols })
    }

    pub fn flags(&self) -> RecordFlags {
        RecordFlags::from_bits_retain(self.buf[1])
    }

    pub fn vtable(&self) -> VTableId {
        VTableId::new(u16::from_le_bytes(self.buf[2..4].try_into().unwrap()))
    }

    pub fn size(&self) -> i32 {
        i32::from_le_bytes(self.buf[4..8].try_into().unwrap())
    }

    pub fn stamp(&self) -> DbStamp {
        DbStamp::new(u64::from_le_bytes(self.buf[8..16].try_into().unwrap()))
    }

    pub fn ncols(&self) -> usize {
        self.cols.len()
    }

    pub fn hash(&self) -> u16 {
        u16::from_le_bytes(self.buf[18..20].try_into().unwrap())
    }

    pub fn user(&self) -> UserId {
        UserId(u32::from_le_bytes(self.buf[20..24].try_into().unwrap()))
    }

    /// Column value by id. Outer `None`: column absent from the record.
    /// Inner `None`: column present and NULL.
    pub fn get(&self, col: ColId) -> Option<Option<&'a [u8]>> {
        let i = self.cols.binary_search_by_key(&col, |(c, _)| *c).ok()?;
        Some(self.cols[i].1.map(|(start, len)| &self.buf[start..start + len]))
    }

    pub fn cols(&self) -> impl Iterator<Item = (ColId, Option<&'a [u8]>)> + '_ {
        self.cols
            .iter()
            .map(|&(col, span)| (col, span.map(|(start, len)| &self.buf[start..start + len])))
    }

    pub fn as_bytes(&self) -> &'a [u8] {
        self.buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn col(n: u16) -> ColId {
        ColId::new(ColId::USER_BASE + n)
    }

    #[test]
    fn roundtrip_simple() {
        let bytes = RecordBuilder::new(
            VTableId::new(0x0400),
            RecordFlags::INSERT,
            DbStamp::new(0x1234_5600),
            UserId(7),
        )
        .col(col(1), Some(b"world"))
        .col(col(0), Some(b"hello"))
        .col(col(2), None)
        .build()
        .unwrap();

        assert_eq!(bytes.len() % 8, 0);
        let rec = Record::parse(&bytes, 0).unwrap();
        assert_eq!(rec.vtable(), VTableId::new(0x0400));
        assert_eq!(rec.flags(), RecordFlags::INSERT);
        assert_eq!(rec.stamp(), DbStamp::new(0x1234_5600));
        assert_eq!(rec.ncols(), 3);
        // builder sorts by column id
        assert_eq!(rec.get(col(0)), Some(Some(&b"hello"[..])));
        assert_eq!(rec.get(col(1)), Some(Some(&b"world"[..])));
        assert_eq!(rec.get(col(2)), Some(None));
        assert_eq!(rec.get(col(3)), None);
    }

    #[test]
    fn payloads_are_doubly_nul_terminated_and_aligned() {
        let bytes = RecordBuilder::new(
            VTableId::new(2),
            RecordFlags::INSERT,
            DbStamp::new(1),
            UserId(0),
        )
        .col(col(0), Some(b"abcd"))
        .build()
        .unwrap();
        let rec = Record::parse(&bytes, 0).unwrap();
        let data = rec.get(col(0)).unwrap().unwrap();
        let start = data.as_ptr() as usize - bytes.as_ptr() as usize;
        assert_eq!(start % 4, 0);
        assert_eq!(&bytes[start + 4..start + 6], &[0, 0]);
    }

    #[test]
    fn wide_column_uses_ext32() {
        let big = vec![b'x'; 1000];
        let bytes = RecordBuilder::new(
            VTableId::new(2),
            RecordFlags::INSERT,
            DbStamp::new(1),
            UserId(0),
        )
        .col(col(0), Some(&big))
        .build()
        .unwrap();
        // header byte carries the extension code, not a length
        assert_eq!(bytes[REC_HEAD_LEN + 3], BSIZE_EXT_32);
        let rec = Record::parse(&bytes, 0).unwrap();
        assert_eq!(rec.get(col(0)).unwrap().unwrap(), &big[..]);
    }

    #[test]
    fn conflicting_op_flags_rejected() {
        let err = RecordBuilder::new(
            VTableId::new(2),
            RecordFlags::INSERT | RecordFlags::DELETE,
            DbStamp::new(1),
            UserId(0),
        )
        .build()
        .unwrap_err();
        assert!(matches!(err, RecordError::BadFlags(_)));
    }

    #[test]
    fn update_pair_hash_matches_on_key_columns() {
        let key: &[u8] = b"k2";
        let del = content_hash([(col(0), Some(key))]);
        let ins = content_hash([(col(0), Some(key))]);
        assert_eq!(del, ins);
        assert_ne!(del, content_hash([(col(0), Some(&b"k1"[..]))]));
    }

    proptest! {
        #[test]
        fn roundtrip_arbitrary(cols in proptest::collection::vec(
            (0u16..64, proptest::option::of(proptest::collection::vec(any::<u8>(), 0..300))),
            0..10,
        )) {
            let mut b = RecordBuilder::new(
                VTableId::new(0x0400),
                RecordFlags::INSERT,
                DbStamp::new(42),
                UserId(1),
            );
            let mut seen = std::collections::BTreeMap::new();
            for (id, data) in &cols {
                // last duplicate wins in the model; builder rejects dups,
                // so only keep first occurrence
                seen.entry(*id).or_insert_with(|| data.clone());
            }
            for (id, data) in &seen {
                b = b.col(col(*id), data.as_deref());
            }
            let bytes = b.build().unwrap();
            prop_assert_eq!(bytes.len() % 8, 0);
            let rec = Record::parse(&bytes, 0).unwrap();
            prop_assert_eq!(rec.ncols(), seen.len());
            for (id, data) in &seen {
                prop_assert_eq!(rec.get(col(*id)), Some(data.as_deref()));
            }
        }
    }
}
