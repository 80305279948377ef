//! Small value types shared by the storage, protocol and engine crates.
//!
//! Everything here is a thin newtype over an integer with the invariants
//! the rest of the system depends on: stamps embed a per-database id in
//! their low bits, virtual table ids pair an even data table with the odd
//! meta table describing its columns, and column ids below `0x10` are
//! reserved for system columns.

use std::fmt;

use bitflags::bitflags;

/// 64-bit logical timestamp. Microsecond-derived, but treated as an opaque
/// monotonically increasing value everywhere outside stamp allocation.
///
/// The low eight bits carry the database discriminator so that two
/// databases never allocate colliding commit stamps.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DbStamp(pub u64);

impl DbStamp {
    pub const ID_MASK: u64 = 0xFF;
    pub const INCR: u64 = 0x100;
    pub const MAX: DbStamp = DbStamp(i64::MAX as u64);

    pub const fn new(raw: u64) -> Self {
        DbStamp(raw)
    }

    pub fn from_unix_micros(micros: u64, id: u8) -> Self {
        DbStamp(micros & !Self::ID_MASK | id as u64)
    }

    /// The per-database discriminator embedded in the stamp.
    pub fn id(self) -> u8 {
        (self.0 & Self::ID_MASK) as u8
    }

    pub fn with_id(self, id: u8) -> Self {
        DbStamp(self.0 & !Self::ID_MASK | id as u64)
    }

    /// Smallest stamp strictly greater than `self` carrying `id` in its
    /// low bits. Used when assigning a minimum commit timestamp.
    pub fn next_unique(self, id: u8) -> Self {
        let base = (self.0 | Self::ID_MASK) + 1;
        DbStamp(base | id as u64)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for DbStamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DbStamp({:#x})", self.0)
    }
}

impl fmt::Display for DbStamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// File offset within a physical table file.
pub type DbOff = i64;

/// Virtual table id. Even ids name data tables; the next odd id names the
/// table's column-definition meta table.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VTableId(pub u16);

impl VTableId {
    pub const fn new(raw: u16) -> Self {
        VTableId(raw)
    }

    pub const fn is_meta(self) -> bool {
        self.0 & 1 != 0
    }

    /// The odd companion id carrying this table's column definitions.
    pub const fn meta(self) -> VTableId {
        VTableId(self.0 | 1)
    }

    pub const fn data(self) -> VTableId {
        VTableId(self.0 & !1)
    }

    pub const fn raw(self) -> u16 {
        self.0
    }
}

impl fmt::Debug for VTableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VTableId({:#06x})", self.0)
    }
}

/// Column id. Ids below [`ColId::SYS_LIMIT`] are reserved system columns;
/// user columns are allocated upward from [`ColId::USER_BASE`].
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ColId(pub u16);

impl ColId {
    pub const STAMP: ColId = ColId(0x01);
    pub const USERID: ColId = ColId(0x02);
    pub const VTID: ColId = ColId(0x03);
    pub const OPCODE: ColId = ColId(0x04);

    pub const SYS_LIMIT: u16 = 0x10;
    pub const USER_BASE: u16 = 0x400;

    pub const fn new(raw: u16) -> Self {
        ColId(raw)
    }

    pub const fn is_system(self) -> bool {
        self.0 < Self::SYS_LIMIT
    }

    pub const fn raw(self) -> u16 {
        self.0
    }
}

impl fmt::Debug for ColId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ColId({:#06x})", self.0)
    }
}

/// Authenticated source of a record.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct UserId(pub u32);

impl UserId {
    pub const fn raw(self) -> u32 {
        self.0
    }
}

bitflags! {
    /// Per-record operation flags stored in the record header.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct RecordFlags: u8 {
        const INSERT     = 0x01;
        const UPDATE     = 0x02;
        const DELETE     = 0x04;
        const REPLICATED = 0x08;
    }
}

impl RecordFlags {
    /// A record carries at most one of INSERT/DELETE/REPLICATED; UPDATE
    /// only decorates the INSERT half of an update pair.
    pub fn op_valid(self) -> bool {
        let ops = self & (RecordFlags::INSERT | RecordFlags::DELETE | RecordFlags::REPLICATED);
        if ops.bits().count_ones() > 1 {
            return false;
        }
        if self.contains(RecordFlags::UPDATE) && !self.contains(RecordFlags::INSERT) {
            return false;
        }
        true
    }
}

/// Round up to a 4-byte boundary.
pub const fn align4(n: usize) -> usize {
    (n + 3) & !3
}

/// Round up to an 8-byte boundary.
pub const fn align8(n: usize) -> usize {
    (n + 7) & !7
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stamp_id_roundtrip() {
        let ts = DbStamp::from_unix_micros(0x1234_5678_9abc_def0, 0x42);
        assert_eq!(ts.id(), 0x42);
        assert_eq!(ts.with_id(0x07).id(), 0x07);
    }

    #[test]
    fn next_unique_is_strictly_greater_and_carries_id() {
        let ts = DbStamp(0x1000_01ff);
        let next = ts.next_unique(0x0a);
        assert!(next > ts);
        assert_eq!(next.id(), 0x0a);
        // Rounded to the next 256-aligned window.
        assert_eq!(next.raw() & !DbStamp::ID_MASK, 0x1000_0200);
    }

    #[test]
    fn vtable_meta_pairing() {
        let vt = VTableId(0x0400);
        assert!(!vt.is_meta());
        assert_eq!(vt.meta(), VTableId(0x0401));
        assert!(vt.meta().is_meta());
        assert_eq!(vt.meta().data(), vt);
    }

    #[test]
    fn record_flag_validity() {
        assert!(RecordFlags::INSERT.op_valid());
        assert!((RecordFlags::INSERT | RecordFlags::UPDATE).op_valid());
        assert!(!(RecordFlags::INSERT | RecordFlags::DELETE).op_valid());
        assert!(!(RecordFlags::UPDATE | RecordFlags::DELETE).op_valid());
        assert!(RecordFlags::DELETE.op_valid());
    }

    #[test]
    fn alignment() {
        assert_eq!(align4(0), 0);
        assert_eq!(align4(1), 4);
        assert_eq!(align4(4), 4);
        assert_eq!(align8(9), 16);
    }
}
