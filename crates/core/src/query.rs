//! Executable query plans.
//!
//! The parser emits these structures directly; there is no intermediate
//! AST. A plan is a set of table instances, column instances in display
//! and sort order, and a clause list of range nodes that both filters
//! rows and drives indexed-scan termination.

use bitflags::bitflags;
use stampdb_primitives::{ColId, VTableId};

use crate::error::Loc;
use crate::sql::types::{DataType, OpId};

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct ColIFlags: u32 {
        /// Display (or insert-order) column.
        const ORDER      = 0x0004;
        /// Participates in ORDER BY.
        const SORTORDER  = 0x0008;
        const KEY        = 0x0010;
        const NOTNULL    = 0x0020;
        const DELETED    = 0x0040;
        const SORTDESC   = 0x0080;
        /// `__timestamp` and friends.
        const SPECIAL    = 0x0100;
        const UNIQUE     = 0x0200;
        const WILD       = 0x8000;
        const HASDEFAULT = 0x10000;
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct QueryFlags: u32 {
        const ROLLEDBACK   = 0x0001;
        /// Include deleted records (HISTORY).
        const RETURN_ALL   = 0x0002;
        const WITH_ORDER   = 0x0008;
        const WITH_LIMIT   = 0x0010;
        /// Set when the server streamed unsorted and the client must sort.
        const CLIENT_ORDER = 0x0100_0000;
        const CLIENT_LIMIT = 0x0200_0000;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueryOp {
    Select,
    Count,
    History,
    Insert,
    Delete,
    Update,
    CloneRows,
    CreateTable,
    AlterTable,
    DropTable,
}

impl QueryOp {
    pub fn is_read_only(self) -> bool {
        matches!(self, QueryOp::Select | QueryOp::Count | QueryOp::History)
    }
}

/// One instance of a table within a query. Two occurrences of the same
/// physical table in a self-join are two distinct instances.
#[derive(Clone, Debug)]
pub struct TableInst {
    pub schema: String,
    pub name: String,
    pub alias: String,
    pub vtable: VTableId,
    /// Physical file holding the table's records.
    pub file: String,
    pub loc: Loc,
}

impl TableInst {
    pub fn qualified(&self) -> String {
        format!("{}.{}", self.schema, self.name)
    }
}

/// One column in one table instance.
#[derive(Clone, Debug)]
pub struct ColInst {
    /// Index into [`Query::tables`].
    pub table: usize,
    pub name: String,
    pub col_id: ColId,
    pub dtype: DataType,
    pub flags: ColIFlags,
    /// Position within the display list, for client sort descriptors.
    pub order_index: i32,
    /// Constant assigned by VALUES / SET; inner `None` is NULL.
    pub const_val: Option<Option<Vec<u8>>>,
    pub loc: Loc,
}

/// Right-hand side of a clause.
#[derive(Clone, Debug)]
pub enum RangeRhs {
    /// Comparison against a constant; `None` is NULL.
    Const(Option<Vec<u8>>),
    /// Equi-join against another column instance (index into
    /// [`Query::cols`]).
    Col(usize),
}

/// One WHERE clause node. Nodes are ANDed in sequence.
#[derive(Clone, Debug)]
pub struct RangeNode {
    /// Left side, an index into [`Query::cols`].
    pub col: usize,
    pub op: OpId,
    pub rhs: RangeRhs,
    pub loc: Loc,
}

/// Column definition inside CREATE/ALTER TABLE.
#[derive(Clone, Debug)]
pub struct ColDefSpec {
    pub name: String,
    pub dtype: DataType,
    pub flags: ColIFlags,
    pub default: Option<Vec<u8>>,
    pub loc: Loc,
}

#[derive(Clone, Debug)]
pub enum DdlSpec {
    CreateTable { cols: Vec<ColDefSpec> },
    AlterAddColumn { col: ColDefSpec },
    AlterDropColumn { name: String, loc: Loc },
    DropTable,
}

#[derive(Clone, Debug)]
pub struct Query {
    pub op: QueryOp,
    pub tables: Vec<TableInst>,
    pub cols: Vec<ColInst>,
    /// Indexes into `cols`, display/insert order.
    pub display: Vec<usize>,
    /// Indexes into `cols`, ORDER BY order.
    pub sort: Vec<usize>,
    pub ranges: Vec<RangeNode>,
    pub start_row: i32,
    /// `-1` means unlimited.
    pub max_rows: i32,
    pub flags: QueryFlags,
    pub ddl: Option<DdlSpec>,
}

impl Query {
    pub fn new(op: QueryOp) -> Query {
        Query {
            op,
            tables: Vec::new(),
            cols: Vec::new(),
            display: Vec::new(),
            sort: Vec::new(),
            ranges: Vec::new(),
            start_row: 0,
            max_rows: -1,
            flags: QueryFlags::empty(),
            ddl: None,
        }
    }

    /// Columns of one table instance.
    pub fn cols_of(&self, ti: usize) -> impl Iterator<Item = usize> + '_ {
        (0..self.cols.len()).filter(move |&ci| self.cols[ci].table == ti)
    }
}
