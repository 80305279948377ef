//! Per-database write-ahead log.
//!
//! Every table append is mirrored here so a crashed database can be
//! brought back to its last committed state. Records are typed, carry a
//! per-file sequence number, and each BEGIN..COMMIT bracket is covered by
//! a crc32c stored in the COMMIT record. Log files rotate by size and are
//! named `log_NNNNNNNNN.lg0`.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use log::debug;
use stampdb_primitives::{align8, DbOff, DbStamp};

use crate::error::WalError;

pub const LOG_MAGIC: u8 = 0xA0;
pub const LOG_HEAD_LEN: usize = 24;

pub const DEFAULT_MAX_LOG_SIZE: u64 = 64 * 1024 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum LogCmd {
    Heartbeat = 0x01,
    TransBegin = 0x02,
    TransCommit = 0x03,
    FileId = 0x04,
    AppendOffset = 0x05,
    TableData = 0x06,
    IndexData = 0x07,
}

impl LogCmd {
    fn from_u8(v: u8) -> Option<LogCmd> {
        Some(match v {
            0x01 => LogCmd::Heartbeat,
            0x02 => LogCmd::TransBegin,
            0x03 => LogCmd::TransCommit,
            0x04 => LogCmd::FileId,
            0x05 => LogCmd::AppendOffset,
            0x06 => LogCmd::TableData,
            0x07 => LogCmd::IndexData,
            _ => return None,
        })
    }
}

/// Record flag: the record's table data was intentionally not logged.
pub const LRF_WITHOUT_DATA: u16 = 0x0001;

fn log_file_name(no: u32) -> String {
    format!("log_{no:09}.lg0")
}

#[derive(Clone, Copy, Debug)]
pub struct WalOptions {
    pub max_log_size: u64,
}

impl Default for WalOptions {
    fn default() -> Self {
        WalOptions {
            max_log_size: DEFAULT_MAX_LOG_SIZE,
        }
    }
}

struct OpenTx {
    crc: u32,
}

/// Append side of the log.
pub struct Wal {
    dir: PathBuf,
    opts: WalOptions,
    out: BufWriter<File>,
    file_no: u32,
    seq: u16,
    size: u64,
    last_bytes: i32,
    tx: Option<OpenTx>,
    file_ids: HashMap<String, i32>,
    next_file_id: i32,
}

impl Wal {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Wal, WalError> {
        Wal::open_with(dir, WalOptions::default())
    }

    pub fn open_with(dir: impl Into<PathBuf>, opts: WalOptions) -> Result<Wal, WalError> {
        let dir = dir.into();
        let mut file_no = 0u32;
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if let Some(no) = name
                .strip_prefix("log_")
                .and_then(|rest| rest.strip_suffix(".lg0"))
                .and_then(|digits| digits.parse::<u32>().ok())
            {
                file_no = file_no.max(no + 1);
            }
        }
        // Always start a fresh file: sequence numbers are per-file and we
        // never append into a log a previous process half-wrote.
        let path = dir.join(log_file_name(file_no));
        let file = OpenOptions::new().append(true).create_new(true).open(&path)?;
        debug!("opened write-ahead log {}", path.display());
        Ok(Wal {
            dir,
            opts,
            out: BufWriter::new(file),
            file_no,
            seq: 0,
            size: 0,
            last_bytes: 0,
            tx: None,
            file_ids: HashMap::new(),
            next_file_id: 1,
        })
    }

    pub fn current_file(&self) -> PathBuf {
        self.dir.join(log_file_name(self.file_no))
    }

    fn rotate(&mut self) -> Result<(), WalError> {
        self.out.flush()?;
        self.out.get_ref().sync_data()?;
        self.file_no += 1;
        let path = self.dir.join(log_file_name(self.file_no));
        let file = OpenOptions::new().append(true).create_new(true).open(&path)?;
        self.out = BufWriter::new(file);
        self.seq = 0;
        self.size = 0;
        self.last_bytes = 0;
        // File ids are scoped to one log file.
        self.file_ids.clear();
        self.next_file_id = 1;
        debug!("rotated write-ahead log to {}", path.display());
        Ok(())
    }

    fn put(&mut self, cmd: LogCmd, flags: u16, file_id: i32, payload: &[u8]) -> Result<(), WalError> {
        let bytes = align8(LOG_HEAD_LEN + payload.len());
        let mut buf = vec![0u8; bytes];
        buf[0] = LOG_MAGIC;
        buf[1] = cmd as u8;
        buf[2..4].copy_from_slice(&flags.to_le_bytes());
        buf[4..6].copy_from_slice(&self.seq.to_le_bytes());
        buf[8..12].copy_from_slice(&file_id.to_le_bytes());
        buf[12..16].copy_from_slice(&(bytes as i32).to_le_bytes());
        buf[16..20].copy_from_slice(&self.last_bytes.to_le_bytes());
        buf[LOG_HEAD_LEN..LOG_HEAD_LEN + payload.len()].copy_from_slice(payload);

        if let Some(tx) = &mut self.tx {
            tx.crc = crc32c::crc32c_append(tx.crc, &buf);
        }
        self.out.write_all(&buf)?;
        self.seq = self.seq.wrapping_add(1);
        self.size += bytes as u64;
        self.last_bytes = bytes as i32;
        Ok(())
    }

    pub fn heartbeat(&mut self, stamp: DbStamp) -> Result<(), WalError> {
        self.put(LogCmd::Heartbeat, 0, 0, &stamp.raw().to_le_bytes())
    }

    /// Open a transaction bracket. Rotation only happens here so a
    /// transaction never spans log files.
    pub fn begin(&mut self, stamp: DbStamp) -> Result<(), WalError> {
        debug_assert!(self.tx.is_none());
        if self.size > self.opts.max_log_size {
            self.rotate()?;
        }
        self.tx = Some(OpenTx { crc: 0 });
        self.put(LogCmd::TransBegin, 0, 0, &stamp.raw().to_le_bytes())
    }

    /// Id under which `name` is referenced by subsequent records,
    /// emitting the FILE_ID record on first use.
    pub fn file_id(&mut self, name: &str) -> Result<i32, WalError> {
        if let Some(&id) = self.file_ids.get(name) {
            return Ok(id);
        }
        let id = self.next_file_id;
        self.next_file_id += 1;
        let mut payload = name.as_bytes().to_vec();
        payload.push(0);
        self.put(LogCmd::FileId, 0, id, &payload)?;
        self.file_ids.insert(name.to_owned(), id);
        Ok(id)
    }

    pub fn append_offset(&mut self, file_id: i32, off: DbOff) -> Result<(), WalError> {
        self.put(LogCmd::AppendOffset, 0, file_id, &off.to_le_bytes())
    }

    pub fn table_data(&mut self, file_id: i32, off: DbOff, data: &[u8]) -> Result<(), WalError> {
        let mut payload = Vec::with_capacity(8 + data.len());
        payload.extend_from_slice(&off.to_le_bytes());
        payload.extend_from_slice(data);
        self.put(LogCmd::TableData, 0, file_id, &payload)
    }

    /// Close the bracket, stamping the crc over everything since BEGIN.
    pub fn commit(&mut self, stamp: DbStamp) -> Result<u32, WalError> {
        let tx = self.tx.take().ok_or(WalError::CommitWithoutBegin)?;
        let crc = tx.crc;
        let mut payload = [0u8; 16];
        payload[0..8].copy_from_slice(&stamp.raw().to_le_bytes());
        payload[8..12].copy_from_slice(&crc.to_le_bytes());
        self.put(LogCmd::TransCommit, 0, 0, &payload)?;
        self.out.flush()?;
        self.out.get_ref().sync_data()?;
        Ok(crc)
    }

    pub fn sync(&mut self) -> Result<(), WalError> {
        self.out.flush()?;
        self.out.get_ref().sync_data()?;
        Ok(())
    }
}

/// One decoded log record.
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub cmd: LogCmd,
    pub flags: u16,
    pub seq: u16,
    pub file_id: i32,
    pub payload: Vec<u8>,
    /// Raw encoded bytes, for crc accounting.
    raw: Vec<u8>,
}

impl LogEntry {
    pub fn stamp(&self) -> Option<DbStamp> {
        match self.cmd {
            LogCmd::Heartbeat | LogCmd::TransBegin | LogCmd::TransCommit => Some(DbStamp::new(
                u64::from_le_bytes(self.payload[0..8].try_into().ok()?),
            )),
            _ => None,
        }
    }

    pub fn commit_crc(&self) -> Option<u32> {
        match self.cmd {
            LogCmd::TransCommit => Some(u32::from_le_bytes(self.payload[8..12].try_into().ok()?)),
            _ => None,
        }
    }
}

/// Read side: sequential scan of one log file with sequence validation.
pub struct LogReader {
    buf: Vec<u8>,
    pos: usize,
    next_seq: u16,
}

impl LogReader {
    pub fn open(path: &Path) -> Result<LogReader, WalError> {
        let mut buf = Vec::new();
        File::open(path)?.read_to_end(&mut buf)?;
        Ok(LogReader {
            buf,
            pos: 0,
            next_seq: 0,
        })
    }

    pub fn next_entry(&mut self) -> Result<Option<LogEntry>, WalError> {
        if self.pos + LOG_HEAD_LEN > self.buf.len() {
            return Ok(None);
        }
        let head = &self.buf[self.pos..self.pos + LOG_HEAD_LEN];
        if head[0] != LOG_MAGIC {
            return Err(WalError::BadMagic(head[0]));
        }
        let cmd = LogCmd::from_u8(head[1]).ok_or(WalError::BadMagic(head[1]))?;
        let flags = u16::from_le_bytes(head[2..4].try_into().unwrap());
        let seq = u16::from_le_bytes(head[4..6].try_into().unwrap());
        if seq != self.next_seq {
            return Err(WalError::SequenceGap {
                expected: self.next_seq,
                found: seq,
            });
        }
        let file_id = i32::from_le_bytes(head[8..12].try_into().unwrap());
        let bytes = i32::from_le_bytes(head[12..16].try_into().unwrap()) as usize;
        if bytes < LOG_HEAD_LEN || self.pos + bytes > self.buf.len() {
            // trailing partial record: treat as end of usable log
            return Ok(None);
        }
        let raw = self.buf[self.pos..self.pos + bytes].to_vec();
        let payload = self.buf[self.pos + LOG_HEAD_LEN..self.pos + bytes].to_vec();
        self.pos += bytes;
        self.next_seq = self.next_seq.wrapping_add(1);
        Ok(Some(LogEntry {
            cmd,
            flags,
            seq,
            file_id,
            payload,
            raw,
        }))
    }

    /// Validate every complete BEGIN..COMMIT bracket against its crc.
    /// Returns the number of valid transactions.
    pub fn validate_transactions(&mut self) -> Result<usize, WalError> {
        let mut count = 0;
        let mut crc: Option<u32> = None;
        while let Some(entry) = self.next_entry()? {
            match entry.cmd {
                LogCmd::TransBegin => {
                    crc = Some(crc32c::crc32c(&entry.raw));
                }
                LogCmd::TransCommit => {
                    let computed = crc.take().ok_or(WalError::CommitWithoutBegin)?;
                    let logged = entry.commit_crc().unwrap_or(0);
                    if computed != logged {
                        return Err(WalError::CrcMismatch { computed, logged });
                    }
                    count += 1;
                }
                _ => {
                    if let Some(c) = &mut crc {
                        *c = crc32c::crc32c_append(*c, &entry.raw);
                    }
                }
            }
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn bracketed_appends_validate() {
        let dir = tempfile::tempdir().unwrap();
        let mut wal = Wal::open(dir.path()).unwrap();
        wal.begin(DbStamp::new(0x100)).unwrap();
        let fid = wal.file_id("sch.dt0").unwrap();
        wal.table_data(fid, 131072, b"recordrecord....").unwrap();
        wal.append_offset(fid, 131072 + 16).unwrap();
        wal.commit(DbStamp::new(0x100)).unwrap();

        let mut reader = LogReader::open(&wal.current_file()).unwrap();
        assert_eq!(reader.validate_transactions().unwrap(), 1);
    }

    #[test]
    fn file_ids_are_assigned_once() {
        let dir = tempfile::tempdir().unwrap();
        let mut wal = Wal::open(dir.path()).unwrap();
        wal.begin(DbStamp::new(1)).unwrap();
        let a = wal.file_id("a.dt0").unwrap();
        let b = wal.file_id("b.dt0").unwrap();
        assert_ne!(a, b);
        assert_eq!(wal.file_id("a.dt0").unwrap(), a);
        wal.commit(DbStamp::new(1)).unwrap();
    }

    #[test]
    fn corrupted_bracket_fails_crc() {
        let dir = tempfile::tempdir().unwrap();
        let mut wal = Wal::open(dir.path()).unwrap();
        wal.begin(DbStamp::new(1)).unwrap();
        let fid = wal.file_id("a.dt0").unwrap();
        wal.table_data(fid, 0, b"12345678").unwrap();
        wal.commit(DbStamp::new(1)).unwrap();
        let path = wal.current_file();
        drop(wal);

        // flip one payload byte inside the bracket
        let mut bytes = std::fs::read(&path).unwrap();
        let target = bytes.len() - 24 - 8; // inside the TABLE_DATA record
        bytes[target] ^= 0xFF;
        std::fs::write(&path, &bytes).unwrap();

        let mut reader = LogReader::open(&path).unwrap();
        assert!(matches!(
            reader.validate_transactions(),
            Err(WalError::CrcMismatch { .. })
        ));
    }

    #[test]
    fn sequence_gap_detected() {
        let dir = tempfile::tempdir().unwrap();
        let mut wal = Wal::open(dir.path()).unwrap();
        wal.heartbeat(DbStamp::new(1)).unwrap();
        wal.heartbeat(DbStamp::new(2)).unwrap();
        wal.sync().unwrap();
        let path = wal.current_file();
        drop(wal);

        let mut bytes = std::fs::read(&path).unwrap();
        // corrupt the second record's sequence number
        bytes[32 + 4] = 9;
        std::fs::write(&path, &bytes).unwrap();

        let mut reader = LogReader::open(&path).unwrap();
        reader.next_entry().unwrap();
        assert!(matches!(
            reader.next_entry(),
            Err(WalError::SequenceGap { .. })
        ));
    }
}
