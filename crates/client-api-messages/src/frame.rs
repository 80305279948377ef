//! The 12-byte wire frame and its byte-order handling.
//!
//! Every packet leads with a magic byte naming the sender's byte order.
//! Receivers decode the header, and then the command-specific payload
//! fields, in whichever order the magic announces; nothing on the wire is
//! ever rewritten in place.

use bitflags::bitflags;
use thiserror::Error;

pub const MAGIC_LSB: u8 = 0xAF;
pub const MAGIC_MSB: u8 = 0xAE;

pub const FRAME_HEAD_LEN: usize = 12;

/// Largest database name accepted in a HELLO packet.
pub const MAX_DBNAME: usize = 64;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Endian {
    Little,
    Big,
}

impl Endian {
    pub const NATIVE: Endian = if cfg!(target_endian = "big") {
        Endian::Big
    } else {
        Endian::Little
    };

    pub fn magic(self) -> u8 {
        match self {
            Endian::Little => MAGIC_LSB,
            Endian::Big => MAGIC_MSB,
        }
    }

    pub fn from_magic(magic: u8) -> Option<Endian> {
        match magic {
            MAGIC_LSB => Some(Endian::Little),
            MAGIC_MSB => Some(Endian::Big),
            _ => None,
        }
    }
}

bitflags! {
    /// Header flag word. READONLY/RWSYNC/STREAM qualify BEGIN_TRAN.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct PktFlags: u16 {
        const READONLY     = 0x0001;
        const RWSYNC       = 0x0008;
        const STREAM       = 0x0010;
        const TOP_READONLY = 0x0020;
    }
}

/// Command byte. Codes are wire-stable.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Cmd {
    Hello = 0x01,
    OpenInstance = 0x02,
    CloseInstance = 0x03,
    BeginTran = 0x04,
    RunQueryTran = 0x05,
    RecQueryTran = 0x06,
    AbortTran = 0x07,
    Commit1Tran = 0x08,
    Commit2Tran = 0x09,
    Result = 0x0A,
    ResultReset = 0x0B,
    SyncStamp = 0x0C,
    UpdateSyncTs = 0x0D,
    UpdateStampId = 0x0E,
    Uncommit1Tran = 0x0F,
    RawRead = 0x10,
    RawData = 0x11,
    RawWrite = 0x12,
    RawWriteEnd = 0x13,
    RawDataFile = 0x14,
    WaitTran = 0x15,
    Continue = 0x16,
    BreakQuery = 0x17,
    ResultOrder = 0x40,
    ResultLimit = 0x41,
}

impl Cmd {
    pub fn from_u8(v: u8) -> Option<Cmd> {
        Some(match v {
            0x01 => Cmd::Hello,
            0x02 => Cmd::OpenInstance,
            0x03 => Cmd::CloseInstance,
            0x04 => Cmd::BeginTran,
            0x05 => Cmd::RunQueryTran,
            0x06 => Cmd::RecQueryTran,
            0x07 => Cmd::AbortTran,
            0x08 => Cmd::Commit1Tran,
            0x09 => Cmd::Commit2Tran,
            0x0A => Cmd::Result,
            0x0B => Cmd::ResultReset,
            0x0C => Cmd::SyncStamp,
            0x0D => Cmd::UpdateSyncTs,
            0x0E => Cmd::UpdateStampId,
            0x0F => Cmd::Uncommit1Tran,
            0x10 => Cmd::RawRead,
            0x11 => Cmd::RawData,
            0x12 => Cmd::RawWrite,
            0x13 => Cmd::RawWriteEnd,
            0x14 => Cmd::RawDataFile,
            0x15 => Cmd::WaitTran,
            0x16 => Cmd::Continue,
            0x17 => Cmd::BreakQuery,
            0x40 => Cmd::ResultOrder,
            0x41 => Cmd::ResultLimit,
            _ => return None,
        })
    }
}

/// Decoded frame header, already in native field order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameHead {
    pub endian: Endian,
    pub cmd: Cmd,
    pub flags: PktFlags,
    /// Total packet bytes including this header, before wire padding.
    pub bytes: i32,
    pub error: i32,
}

impl FrameHead {
    pub fn decode(buf: &[u8; FRAME_HEAD_LEN]) -> Result<FrameHead, FrameError> {
        let endian = Endian::from_magic(buf[0]).ok_or(FrameError::BadMagic(buf[0]))?;
        let cmd = Cmd::from_u8(buf[1]).ok_or(FrameError::BadCommand(buf[1]))?;
        let (flags, bytes, error) = match endian {
            Endian::Little => (
                u16::from_le_bytes(buf[2..4].try_into().unwrap()),
                i32::from_le_bytes(buf[4..8].try_into().unwrap()),
                i32::from_le_bytes(buf[8..12].try_into().unwrap()),
            ),
            Endian::Big => (
                u16::from_be_bytes(buf[2..4].try_into().unwrap()),
                i32::from_be_bytes(buf[4..8].try_into().unwrap()),
                i32::from_be_bytes(buf[8..12].try_into().unwrap()),
            ),
        };
        if bytes < FRAME_HEAD_LEN as i32 {
            return Err(FrameError::BadLength(bytes));
        }
        Ok(FrameHead {
            endian,
            cmd,
            flags: PktFlags::from_bits_retain(flags),
            bytes,
            error,
        })
    }

    pub fn encode(&self) -> [u8; FRAME_HEAD_LEN] {
        let mut buf = [0u8; FRAME_HEAD_LEN];
        buf[0] = self.endian.magic();
        buf[1] = self.cmd as u8;
        match self.endian {
            Endian::Little => {
                buf[2..4].copy_from_slice(&self.flags.bits().to_le_bytes());
                buf[4..8].copy_from_slice(&self.bytes.to_le_bytes());
                buf[8..12].copy_from_slice(&self.error.to_le_bytes());
            }
            Endian::Big => {
                buf[2..4].copy_from_slice(&self.flags.bits().to_be_bytes());
                buf[4..8].copy_from_slice(&self.bytes.to_be_bytes());
                buf[8..12].copy_from_slice(&self.error.to_be_bytes());
            }
        }
        buf
    }
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("unknown packet magic {0:#04x}")]
    BadMagic(u8),
    #[error("unknown command {0:#04x}")]
    BadCommand(u8),
    #[error("implausible packet length {0}")]
    BadLength(i32),
    #[error("packet payload too short for its command")]
    Short,
    #[error("malformed {0} payload")]
    Malformed(&'static str),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
