//! Wire protocol spoken between stampdb clients, the client router, and
//! database instances.
//!
//! Every packet is a 12-byte header plus a command-specific payload,
//! 8-byte aligned on the wire. The header's magic byte announces the
//! sender's byte order; receivers decode into native order, so a
//! little-endian client and a big-endian instance interoperate without
//! either side translating twice.
//!
//! Result rows stream as [`msg::RowData`] packets with a per-query stall
//! credit: the instance stops writing once enough bytes are in flight and
//! waits for `CONTINUE` (more credit) or `BREAK_QUERY` (abandon the scan).

pub mod frame;
pub mod io;
pub mod msg;

pub use frame::{Cmd, Endian, FrameError, FrameHead, PktFlags, FRAME_HEAD_LEN, MAX_DBNAME};
pub use io::{read_msg, read_msg_sync, recv_msg_with_fd, send_msg_with_fd, write_msg, write_msg_sync};
pub use msg::{
    Begin, Body, Commit1, Commit2, Hello, Msg, RawDataFile, RawRange, ResultLimit, RowBuilder,
    RowData, ORDER_COL_MASK, ORDER_STRING_FWD, ORDER_STRING_REV,
};

/// Stall credit threshold: the instance flushes and waits once this many
/// result bytes are unacknowledged. `CONTINUE` returns half of it.
pub const STALL_CREDIT: i32 = 65536;
