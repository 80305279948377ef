//! Message bodies and the per-command payload codec.

use bytes::Bytes;
use stampdb_primitives::{align4, align8, DbStamp, UserId};

use crate::frame::{Cmd, Endian, FrameError, FrameHead, PktFlags, FRAME_HEAD_LEN, MAX_DBNAME};

pub const ORDER_COL_MASK: i32 = 0x000F_FFF;
pub const ORDER_STRING_FWD: i32 = 0x001_0000;
pub const ORDER_STRING_REV: i32 = 0x002_0000;

/// One packet: header flag word, error word, and a typed body.
#[derive(Clone, Debug, PartialEq)]
pub struct Msg {
    pub flags: PktFlags,
    pub error: i32,
    pub body: Body,
}

impl Msg {
    pub fn new(body: Body) -> Msg {
        Msg {
            flags: PktFlags::empty(),
            error: 0,
            body,
        }
    }

    pub fn with_flags(body: Body, flags: PktFlags) -> Msg {
        Msg {
            flags,
            error: 0,
            body,
        }
    }

    pub fn with_error(body: Body, error: i32) -> Msg {
        Msg {
            flags: PktFlags::empty(),
            error,
            body,
        }
    }

    pub fn cmd(&self) -> Cmd {
        self.body.cmd()
    }

    /// Full wire frame, padded to 8 bytes.
    pub fn encode(&self, endian: Endian) -> Vec<u8> {
        let payload = self.body.encode_payload(endian);
        let bytes = (FRAME_HEAD_LEN + payload.len()) as i32;
        let head = FrameHead {
            endian,
            cmd: self.cmd(),
            flags: self.flags,
            bytes,
            error: self.error,
        };
        let mut buf = Vec::with_capacity(align8(bytes as usize));
        buf.extend_from_slice(&head.encode());
        buf.extend_from_slice(&payload);
        buf.resize(align8(buf.len()), 0);
        buf
    }

    /// Decode a payload that arrived under `head`. `payload` holds
    /// exactly `head.bytes - 12` bytes (padding already stripped).
    pub fn decode(head: &FrameHead, payload: &[u8]) -> Result<Msg, FrameError> {
        let body = Body::decode_payload(head.cmd, head.endian, payload)?;
        Ok(Msg {
            flags: head.flags,
            error: head.error,
            body,
        })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Body {
    Hello(Hello),
    OpenInstance,
    CloseInstance,
    Begin(Begin),
    RunQuery(String),
    RecQuery(String),
    Abort,
    Commit1(Commit1),
    Commit2(Commit2),
    Result(RowData),
    ResultReset,
    SyncStamp(DbStamp),
    UpdateSyncTs(DbStamp),
    UpdateStampId(DbStamp),
    Uncommit1,
    RawRead(RawRange),
    RawData(Bytes),
    RawWrite(RawRange),
    RawWriteEnd(DbStamp),
    RawDataFile(RawDataFile),
    WaitTran(DbStamp),
    Continue,
    BreakQuery,
    ResultOrder(Vec<i32>),
    ResultLimit(ResultLimit),
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Hello {
    pub sync_ts: DbStamp,
    pub min_cts: DbStamp,
    pub block_size: i32,
    pub dbname: String,
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Begin {
    pub freeze_ts: DbStamp,
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Commit1 {
    pub min_cts: DbStamp,
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Commit2 {
    pub min_cts: DbStamp,
    pub user_id: UserId,
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct RawRange {
    pub start_ts: DbStamp,
    pub end_ts: DbStamp,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct RawDataFile {
    pub block_size: i32,
    pub file_name: String,
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ResultLimit {
    pub start_row: i32,
    pub max_rows: i32,
}

impl Body {
    pub fn cmd(&self) -> Cmd {
        match self {
            Body::Hello(_) => Cmd::Hello,
            Body::OpenInstance => Cmd::OpenInstance,
            Body::CloseInstance => Cmd::CloseInstance,
            Body::Begin(_) => Cmd::BeginTran,
            Body::RunQuery(_) => Cmd::RunQueryTran,
            Body::RecQuery(_) => Cmd::RecQueryTran,
            Body::Abort => Cmd::AbortTran,
            Body::Commit1(_) => Cmd::Commit1Tran,
            Body::Commit2(_) => Cmd::Commit2Tran,
            Body::Result(_) => Cmd::Result,
            Body::ResultReset => Cmd::ResultReset,
            Body::SyncStamp(_) => Cmd::SyncStamp,
            Body::UpdateSyncTs(_) => Cmd::UpdateSyncTs,
            Body::UpdateStampId(_) => Cmd::UpdateStampId,
            Body::Uncommit1 => Cmd::Uncommit1Tran,
            Body::RawRead(_) => Cmd::RawRead,
            Body::RawData(_) => Cmd::RawData,
            Body::RawWrite(_) => Cmd::RawWrite,
            Body::RawWriteEnd(_) => Cmd::RawWriteEnd,
            Body::RawDataFile(_) => Cmd::RawDataFile,
            Body::WaitTran(_) => Cmd::WaitTran,
            Body::Continue => Cmd::Continue,
            Body::BreakQuery => Cmd::BreakQuery,
            Body::ResultOrder(_) => Cmd::ResultOrder,
            Body::ResultLimit(_) => Cmd::ResultLimit,
        }
    }

    fn encode_payload(&self, en: Endian) -> Vec<u8> {
        let mut w = FieldWriter::new(en);
        match self {
            Body::Hello(h) => {
                w.put_u64(h.sync_ts.raw());
                w.put_u64(h.min_cts.raw());
                w.put_i32(h.block_size);
                w.put_bytes(h.dbname.as_bytes());
                w.put_u8(0);
            }
            Body::Begin(b) => w.put_u64(b.freeze_ts.raw()),
            Body::RunQuery(sql) | Body::RecQuery(sql) => w.put_bytes(sql.as_bytes()),
            Body::Commit1(c) => w.put_u64(c.min_cts.raw()),
            Body::Commit2(c) => {
                w.put_u64(c.min_cts.raw());
                w.put_u32(c.user_id.raw());
            }
            Body::Result(row) => row.encode_into(&mut w),
            Body::SyncStamp(ts)
            | Body::UpdateSyncTs(ts)
            | Body::UpdateStampId(ts)
            | Body::WaitTran(ts)
            | Body::RawWriteEnd(ts) => w.put_u64(ts.raw()),
            Body::RawRead(r) | Body::RawWrite(r) => {
                w.put_u64(r.start_ts.raw());
                w.put_u64(r.end_ts.raw());
            }
            Body::RawData(bytes) => w.put_bytes(bytes),
            Body::RawDataFile(f) => {
                w.put_i32(f.block_size);
                w.put_bytes(f.file_name.as_bytes());
                w.put_u8(0);
            }
            Body::ResultOrder(order) => {
                w.put_i32(order.len() as i32);
                for &o in order {
                    w.put_i32(o);
                }
            }
            Body::ResultLimit(l) => {
                w.put_i32(l.start_row);
                w.put_i32(l.max_rows);
            }
            Body::OpenInstance
            | Body::CloseInstance
            | Body::Abort
            | Body::Uncommit1
            | Body::ResultReset
            | Body::Continue
            | Body::BreakQuery => {}
        }
        w.into_inner()
    }

    fn decode_payload(cmd: Cmd, en: Endian, payload: &[u8]) -> Result<Body, FrameError> {
        let mut r = FieldReader::new(en, payload);
        Ok(match cmd {
            Cmd::Hello => {
                let sync_ts = DbStamp::new(r.get_u64()?);
                let min_cts = DbStamp::new(r.get_u64()?);
                let block_size = r.get_i32()?;
                let dbname = r.get_cstr(MAX_DBNAME)?;
                Body::Hello(Hello {
                    sync_ts,
                    min_cts,
                    block_size,
                    dbname,
                })
            }
            Cmd::OpenInstance => Body::OpenInstance,
            Cmd::CloseInstance => Body::CloseInstance,
            Cmd::BeginTran => Body::Begin(Begin {
                freeze_ts: DbStamp::new(r.get_u64()?),
            }),
            Cmd::RunQueryTran => Body::RunQuery(r.rest_str()),
            Cmd::RecQueryTran => Body::RecQuery(r.rest_str()),
            Cmd::AbortTran => Body::Abort,
            Cmd::Commit1Tran => Body::Commit1(Commit1 {
                min_cts: DbStamp::new(r.get_u64()?),
            }),
            Cmd::Commit2Tran => Body::Commit2(Commit2 {
                min_cts: DbStamp::new(r.get_u64()?),
                user_id: UserId(r.get_u32()?),
            }),
            Cmd::Result => Body::Result(RowData::decode_from(&mut r)?),
            Cmd::ResultReset => Body::ResultReset,
            Cmd::SyncStamp => Body::SyncStamp(DbStamp::new(r.get_u64()?)),
            Cmd::UpdateSyncTs => Body::UpdateSyncTs(DbStamp::new(r.get_u64()?)),
            Cmd::UpdateStampId => Body::UpdateStampId(DbStamp::new(r.get_u64()?)),
            Cmd::Uncommit1Tran => Body::Uncommit1,
            Cmd::RawRead => Body::RawRead(RawRange {
                start_ts: DbStamp::new(r.get_u64()?),
                end_ts: DbStamp::new(r.get_u64()?),
            }),
            Cmd::RawData => Body::RawData(Bytes::copy_from_slice(r.rest())),
            Cmd::RawWrite => Body::RawWrite(RawRange {
                start_ts: DbStamp::new(r.get_u64()?),
                end_ts: DbStamp::new(r.get_u64()?),
            }),
            Cmd::RawWriteEnd => Body::RawWriteEnd(DbStamp::new(r.get_u64()?)),
            Cmd::RawDataFile => {
                let block_size = r.get_i32()?;
                let file_name = r.get_cstr(256)?;
                Body::RawDataFile(RawDataFile {
                    block_size,
                    file_name,
                })
            }
            Cmd::WaitTran => Body::WaitTran(DbStamp::new(r.get_u64()?)),
            Cmd::Continue => Body::Continue,
            Cmd::BreakQuery => Body::BreakQuery,
            Cmd::ResultOrder => {
                let n = r.get_i32()?;
                if n < 0 || n as usize > payload.len() / 4 {
                    return Err(FrameError::Malformed("RESULT_ORDER"));
                }
                let mut order = Vec::with_capacity(n as usize);
                for _ in 0..n {
                    order.push(r.get_i32()?);
                }
                Body::ResultOrder(order)
            }
            Cmd::ResultLimit => Body::ResultLimit(ResultLimit {
                start_row: r.get_i32()?,
                max_rows: r.get_i32()?,
            }),
        })
    }
}

/// One streamed result row.
///
/// `offsets` carries `count + 1` entries measured from the start of the
/// packet payload, exactly as they appear on the wire; a NULL column is
/// two adjacent equal offsets. `show_count` of the columns are display
/// columns, the rest are sort keys the client needs but does not show.
#[derive(Clone, Debug, PartialEq)]
pub struct RowData {
    pub show_count: i32,
    offsets: Vec<i32>,
    data: Bytes,
}

impl RowData {
    pub fn count(&self) -> usize {
        self.offsets.len().saturating_sub(1)
    }

    /// Byte offset of the data area within the payload.
    fn data_base(count: usize) -> i32 {
        (8 + 4 * (count + 1)) as i32
    }

    /// Column `i`; `None` for NULL. Values are NUL-terminated strings on
    /// the wire, so the value ends at the first NUL of its region.
    pub fn col(&self, i: usize) -> Option<&[u8]> {
        if i + 1 >= self.offsets.len() || self.offsets[i + 1] == self.offsets[i] {
            return None;
        }
        let base = Self::data_base(self.count());
        let start = (self.offsets[i] - base) as usize;
        let region = &self.data[start..];
        let len = memchr::memchr(0, region).unwrap_or(region.len());
        Some(&region[..len])
    }

    pub fn cols(&self) -> impl Iterator<Item = Option<&[u8]>> + '_ {
        (0..self.count()).map(|i| self.col(i))
    }

    fn encode_into(&self, w: &mut FieldWriter) {
        w.put_i32(self.show_count);
        w.put_i32(self.count() as i32);
        for &off in &self.offsets {
            w.put_i32(off);
        }
        w.put_bytes(&self.data);
    }

    fn decode_from(r: &mut FieldReader<'_>) -> Result<RowData, FrameError> {
        let show_count = r.get_i32()?;
        let count = r.get_i32()?;
        if count < 0 || show_count < 0 || show_count > count {
            return Err(FrameError::Malformed("RESULT"));
        }
        let mut offsets = Vec::with_capacity(count as usize + 1);
        for _ in 0..=count {
            offsets.push(r.get_i32()?);
        }
        let base = Self::data_base(count as usize);
        for w in offsets.windows(2) {
            if w[1] < w[0] || w[0] < base {
                return Err(FrameError::Malformed("RESULT"));
            }
        }
        let data = Bytes::copy_from_slice(r.rest());
        if offsets
            .last()
            .is_some_and(|&end| (end - base) as usize > data.len())
        {
            return Err(FrameError::Malformed("RESULT"));
        }
        Ok(RowData {
            show_count,
            offsets,
            data,
        })
    }
}

/// Builds a [`RowData`] column by column.
#[derive(Debug, Default)]
pub struct RowBuilder {
    show_count: i32,
    cols: Vec<Option<Vec<u8>>>,
}

impl RowBuilder {
    pub fn new() -> RowBuilder {
        RowBuilder::default()
    }

    pub fn push(&mut self, data: Option<&[u8]>) {
        self.cols.push(data.map(|d| d.to_vec()));
    }

    /// Columns pushed so far are the display set.
    pub fn mark_shown(&mut self) {
        self.show_count = self.cols.len() as i32;
    }

    pub fn finish(self) -> RowData {
        let count = self.cols.len();
        let base = RowData::data_base(count);
        let mut offsets = Vec::with_capacity(count + 1);
        let mut data = Vec::new();
        let mut off = base;
        for col in &self.cols {
            offsets.push(off);
            if let Some(bytes) = col {
                data.extend_from_slice(bytes);
                data.push(0);
                data.resize(align4(data.len()), 0);
                off = base + data.len() as i32;
            }
        }
        offsets.push(off);
        RowData {
            show_count: self.show_count,
            offsets,
            data: data.into(),
        }
    }
}

struct FieldWriter {
    en: Endian,
    buf: Vec<u8>,
}

impl FieldWriter {
    fn new(en: Endian) -> Self {
        FieldWriter {
            en,
            buf: Vec::new(),
        }
    }

    fn put_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    fn put_i32(&mut self, v: i32) {
        match self.en {
            Endian::Little => self.buf.extend_from_slice(&v.to_le_bytes()),
            Endian::Big => self.buf.extend_from_slice(&v.to_be_bytes()),
        }
    }

    fn put_u32(&mut self, v: u32) {
        self.put_i32(v as i32);
    }

    fn put_u64(&mut self, v: u64) {
        match self.en {
            Endian::Little => self.buf.extend_from_slice(&v.to_le_bytes()),
            Endian::Big => self.buf.extend_from_slice(&v.to_be_bytes()),
        }
    }

    fn put_bytes(&mut self, v: &[u8]) {
        self.buf.extend_from_slice(v);
    }

    fn into_inner(self) -> Vec<u8> {
        self.buf
    }
}

struct FieldReader<'a> {
    en: Endian,
    buf: &'a [u8],
    pos: usize,
}

impl<'a> FieldReader<'a> {
    fn new(en: Endian, buf: &'a [u8]) -> Self {
        FieldReader { en, buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], FrameError> {
        if self.pos + n > self.buf.len() {
            return Err(FrameError::Short);
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn get_i32(&mut self) -> Result<i32, FrameError> {
        let b: [u8; 4] = self.take(4)?.try_into().unwrap();
        Ok(match self.en {
            Endian::Little => i32::from_le_bytes(b),
            Endian::Big => i32::from_be_bytes(b),
        })
    }

    fn get_u32(&mut self) -> Result<u32, FrameError> {
        Ok(self.get_i32()? as u32)
    }

    fn get_u64(&mut self) -> Result<u64, FrameError> {
        let b: [u8; 8] = self.take(8)?.try_into().unwrap();
        Ok(match self.en {
            Endian::Little => u64::from_le_bytes(b),
            Endian::Big => u64::from_be_bytes(b),
        })
    }

    /// NUL-terminated string of at most `max` bytes.
    fn get_cstr(&mut self, max: usize) -> Result<String, FrameError> {
        let rest = &self.buf[self.pos..];
        let len = memchr::memchr(0, rest).ok_or(FrameError::Short)?;
        if len > max {
            return Err(FrameError::Malformed("string field"));
        }
        let s = String::from_utf8_lossy(&rest[..len]).into_owned();
        self.pos += len + 1;
        Ok(s)
    }

    fn rest(&mut self) -> &'a [u8] {
        let out = &self.buf[self.pos..];
        self.pos = self.buf.len();
        out
    }

    /// Remaining bytes as text, trailing NUL padding stripped.
    fn rest_str(&mut self) -> String {
        let rest = self.rest();
        let len = memchr::memchr(0, rest).unwrap_or(rest.len());
        String::from_utf8_lossy(&rest[..len]).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameHead;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn roundtrip(msg: &Msg, en: Endian) -> Msg {
        let wire = msg.encode(en);
        assert_eq!(wire.len() % 8, 0);
        let head = FrameHead::decode(&wire[..FRAME_HEAD_LEN].try_into().unwrap()).unwrap();
        let payload = &wire[FRAME_HEAD_LEN..head.bytes as usize];
        Msg::decode(&head, payload).unwrap()
    }

    #[test]
    fn hello_foreign_order_roundtrip() {
        let msg = Msg::new(Body::Hello(Hello {
            sync_ts: DbStamp::new(0x0123_4567_89AB_CDEF),
            min_cts: DbStamp::new(0x1122_3344_5566_7788),
            block_size: 131072,
            dbname: "accounts".into(),
        }));
        // built big-endian, consumed on this (likely little-endian) host
        assert_eq!(roundtrip(&msg, Endian::Big), msg);
        assert_eq!(roundtrip(&msg, Endian::Little), msg);
    }

    #[test]
    fn begin_flags_survive() {
        let msg = Msg::with_flags(
            Body::Begin(Begin {
                freeze_ts: DbStamp::new(77),
            }),
            PktFlags::READONLY | PktFlags::STREAM,
        );
        let back = roundtrip(&msg, Endian::Big);
        assert_eq!(back.flags, PktFlags::READONLY | PktFlags::STREAM);
    }

    #[test]
    fn row_nulls_encode_as_adjacent_offsets() {
        let mut b = RowBuilder::new();
        b.push(Some(b"k"));
        b.push(None);
        b.push(Some(b"value"));
        b.mark_shown();
        let row = b.finish();

        assert_eq!(row.count(), 3);
        assert_eq!(row.col(0), Some(&b"k"[..]));
        assert_eq!(row.col(1), None);
        assert_eq!(row.col(2), Some(&b"value"[..]));

        let msg = Msg::new(Body::Result(row));
        let back = roundtrip(&msg, Endian::Big);
        let Body::Result(row) = back.body else {
            panic!("wrong body")
        };
        assert_eq!(row.col(1), None);
        assert_eq!(row.col(2), Some(&b"value"[..]));
        assert_eq!(row.show_count, 3);
    }

    #[test]
    fn empty_string_is_not_null() {
        let mut b = RowBuilder::new();
        b.push(Some(b""));
        b.mark_shown();
        let row = b.finish();
        assert_eq!(row.col(0), Some(&b""[..]));
    }

    #[test]
    fn error_code_rides_the_header() {
        let msg = Msg::with_error(Body::Abort, -66);
        let back = roundtrip(&msg, Endian::Little);
        assert_eq!(back.error, -66);
    }

    #[test]
    fn query_text_roundtrip() {
        let msg = Msg::new(Body::RunQuery("SELECT a FROM s.t WHERE a='x';".into()));
        assert_eq!(roundtrip(&msg, Endian::Big), msg);
    }

    #[test]
    fn order_and_limit_roundtrip() {
        let msg = Msg::new(Body::ResultOrder(vec![
            ORDER_STRING_FWD | 0,
            ORDER_STRING_REV | 2,
        ]));
        assert_eq!(roundtrip(&msg, Endian::Big), msg);

        let msg = Msg::new(Body::ResultLimit(ResultLimit {
            start_row: 10,
            max_rows: 50,
        }));
        assert_eq!(roundtrip(&msg, Endian::Little), msg);
    }

    proptest! {
        #[test]
        fn byte_order_roundtrip_property(
            sync in any::<u64>(),
            min in any::<u64>(),
            bs in any::<i32>(),
            name in "[a-z]{0,16}",
        ) {
            let msg = Msg::new(Body::Hello(Hello {
                sync_ts: DbStamp::new(sync),
                min_cts: DbStamp::new(min),
                block_size: bs,
                dbname: name,
            }));
            prop_assert_eq!(roundtrip(&msg, Endian::Big), msg.clone());
            prop_assert_eq!(roundtrip(&msg, Endian::Little), msg);
        }

        #[test]
        fn row_roundtrip_property(cols in proptest::collection::vec(
            proptest::option::of("[a-z0-9]{0,40}"), 0..8,
        )) {
            let mut b = RowBuilder::new();
            for c in &cols {
                b.push(c.as_ref().map(|s| s.as_bytes()));
            }
            b.mark_shown();
            let row = b.finish();
            for (i, c) in cols.iter().enumerate() {
                prop_assert_eq!(row.col(i), c.as_ref().map(|s| s.as_bytes()));
            }
            let msg = Msg::new(Body::Result(row));
            let wire = msg.encode(Endian::Big);
            let head = FrameHead::decode(&wire[..FRAME_HEAD_LEN].try_into().unwrap()).unwrap();
            let back = Msg::decode(&head, &wire[FRAME_HEAD_LEN..head.bytes as usize]).unwrap();
            prop_assert_eq!(back, msg);
        }
    }
}
