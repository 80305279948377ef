//! The engine-wide error type.
//!
//! Every variant maps onto a stable negative integer: the wire protocol
//! carries the raw code in each reply's error word and clients translate
//! it back to a message, so the numbering is part of the external
//! interface and must not drift.

use stampdb_client_api_messages::FrameError;
use stampdb_tablestore::{IndexError, TableFileError, WalError};
use thiserror::Error;

/// Source location of a lex/parse error, for context rendering.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Loc {
    /// Byte offset of the offending token in the query text.
    pub off: usize,
    /// Token length in bytes (zero for end-of-input errors).
    pub len: usize,
    /// 1-based line number.
    pub line: u32,
}

#[derive(Debug, Error)]
pub enum DBError {
    #[error("general database error")]
    General,
    #[error("can't make directory")]
    CantMakeDir(#[source] std::io::Error),
    #[error("can't open table or database")]
    CantOpen,
    #[error("can't create table or database")]
    CantCreate,
    #[error("failed to connect to replicator")]
    CantConnect,
    #[error("query limit hit")]
    LimitAbort,

    #[error("storage: {0}")]
    Storage(#[from] TableFileError),
    #[error("index: {0}")]
    Index(#[from] IndexError),
    #[error("write-ahead log: {0}")]
    Wal(#[from] WalError),
    #[error("table not specified")]
    NeedTable,
    #[error("only one table may be specified")]
    OneTableOnly,
    #[error("database groupid mismatch")]
    GroupIdMismatch,

    #[error("general parsing error at {0:?}")]
    ParseError(Loc),
    #[error("unrecognized command or keyword at {0:?}")]
    UnrecognizedKeyword(Loc),
    #[error("unterminated string at {0:?}")]
    UnterminatedString(Loc),
    #[error("unexpected token at {0:?}")]
    UnexpectedToken(Loc),
    #[error("too much data specified at {0:?}")]
    TooMuchData(Loc),
    #[error("must declare columns for data at {0:?}")]
    MustDeclareCols(Loc),
    #[error("expected column at {0:?}")]
    ExpectedColumn(Loc),
    #[error("expected table at {0:?}")]
    ExpectedTable(Loc),
    #[error("expected data item at {0:?}")]
    ExpectedData(Loc),
    #[error("expected identifier at {0:?}")]
    ExpectedId(Loc),
    #[error("duplicate column at {0:?}")]
    DuplicateColumn(Loc),
    #[error("statement requires a WHERE clause")]
    MissingWhere(Loc),
    #[error("expected operator at {0:?}")]
    ExpectedOperator(Loc),
    #[error("expression cannot have two constants at {0:?}")]
    CannotHaveTwoConsts(Loc),
    #[error("table `{1}` not found")]
    TableNotFound(Loc, String),
    #[error("column `{1}` not found")]
    ColumnNotFound(Loc, String),
    #[error("not in a transaction")]
    NotInTransaction,
    #[error("wildcard column not legal here at {0:?}")]
    WildcardIllegal(Loc),
    #[error("syntax error at {0:?}")]
    SyntaxError(Loc),
    #[error("no default schema; schema must be specified at {0:?}")]
    NoDefaultSchema(Loc),
    #[error("schema `{1}` already exists")]
    SchemaExists(Loc, String),
    #[error("table `{1}` already exists")]
    TableExists(Loc, String),
    #[error("column `{1}` already exists")]
    ColumnExists(Loc, String),
    #[error("unrecognized type at {0:?}")]
    UnrecognizedType(Loc),
    #[error("can't push transaction")]
    CantPush,
    #[error("KEY or NOT NULL field cannot be empty")]
    KeyNull,
    #[error("too little data specified at {0:?}")]
    TooLittleData(Loc),
    #[error("record already exists")]
    RecordAlready,
    #[error("unrecognized attribute at {0:?}")]
    UnrecognizedAttr(Loc),
    #[error("schema `{1}` not found")]
    SchemaNotFound(Loc, String),
    #[error("feature not supported at {0:?}")]
    FeatureNotSupported(Loc),
    #[error("commit2 without commit1")]
    Commit2WithoutCommit1,
    #[error("commit1 conflict at stamp {conflict}")]
    Commit1Conflict {
        conflict: stampdb_primitives::DbStamp,
    },
    #[error("delayed commit2 aborted")]
    Commit2DelayAbort,
    #[error("abort outside a transaction")]
    AbortOutsideTrans,
    #[error("query interrupted")]
    SelectBreak,
    #[error("link lost during streaming query")]
    LostLink,
    #[error("field cannot be both UNIQUE and PRIMARY KEY at {0:?}")]
    NotBothUniquePrimary(Loc),
    #[error("duplicate default clause at {0:?}")]
    DuplicateDefault(Loc),

    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("protocol: {0}")]
    Frame(#[from] FrameError),
}

impl DBError {
    /// Stable negative wire code.
    pub fn code(&self) -> i32 {
        use DBError::*;
        match self {
            General => -1,
            CantMakeDir(_) => -2,
            CantOpen => -3,
            CantCreate => -4,
            CantConnect => -7,
            LimitAbort => -8,

            Storage(e) => storage_code(e),
            Index(_) => -20,
            Wal(_) => -23,
            NeedTable => -24,
            OneTableOnly => -25,
            GroupIdMismatch => -27,

            ParseError(_) => -30,
            UnrecognizedKeyword(_) => -31,
            UnterminatedString(_) => -32,
            UnexpectedToken(_) => -33,
            TooMuchData(_) => -34,
            MustDeclareCols(_) => -35,
            ExpectedColumn(_) => -36,
            ExpectedTable(_) => -37,
            ExpectedData(_) => -38,
            ExpectedId(_) => -39,
            DuplicateColumn(_) => -40,
            MissingWhere(_) => -41,
            ExpectedOperator(_) => -42,
            CannotHaveTwoConsts(_) => -43,
            TableNotFound(..) => -44,
            ColumnNotFound(..) => -45,
            NotInTransaction => -47,
            WildcardIllegal(_) => -48,
            SyntaxError(_) => -49,
            NoDefaultSchema(_) => -50,
            SchemaExists(..) => -51,
            TableExists(..) => -52,
            ColumnExists(..) => -53,
            UnrecognizedType(_) => -54,
            CantPush => -55,
            KeyNull => -57,
            TooLittleData(_) => -58,
            RecordAlready => -59,
            UnrecognizedAttr(_) => -60,
            SchemaNotFound(..) => -61,
            FeatureNotSupported(_) => -64,
            Commit2WithoutCommit1 => -65,
            Commit1Conflict { .. } => -66,
            Commit2DelayAbort => -67,
            AbortOutsideTrans => -68,
            SelectBreak => -69,
            LostLink => -70,
            NotBothUniquePrimary(_) => -71,
            DuplicateDefault(_) => -72,

            Io(_) => -1,
            Frame(_) => -33,
        }
    }

    /// Lex/parse location if this error carries one.
    pub fn loc(&self) -> Option<Loc> {
        use DBError::*;
        match self {
            ParseError(l) | UnrecognizedKeyword(l) | UnterminatedString(l)
            | UnexpectedToken(l) | TooMuchData(l) | MustDeclareCols(l) | ExpectedColumn(l)
            | ExpectedTable(l) | ExpectedData(l) | ExpectedId(l) | DuplicateColumn(l)
            | MissingWhere(l) | ExpectedOperator(l) | CannotHaveTwoConsts(l)
            | TableNotFound(l, _) | ColumnNotFound(l, _) | WildcardIllegal(l)
            | SyntaxError(l) | NoDefaultSchema(l) | SchemaExists(l, _) | TableExists(l, _)
            | ColumnExists(l, _) | UnrecognizedType(l) | TooLittleData(l)
            | UnrecognizedAttr(l) | SchemaNotFound(l, _) | FeatureNotSupported(l)
            | NotBothUniquePrimary(l) | DuplicateDefault(l) => Some(*l),
            _ => None,
        }
    }

    /// Human string for a raw wire code, for client-side rendering.
    pub fn describe_code(code: i32) -> &'static str {
        match code {
            0 => "",
            -1 => "General Database Error",
            -2 => "Can't Make Directory",
            -3 => "Can't Open Table/DB",
            -4 => "Can't Create Table/DB",
            -5 => "Ran out of Memory",
            -6 => "Memory Corrupted",
            -7 => "Failed to Connect to Replicator",
            -8 => "Limit Abort",
            -16 => "Bad Physical Table Magic",
            -17 => "Bad Physical Table Version",
            -18 => "Bad Physical Table Type",
            -19 => "Physical Table Was Truncated",
            -20 => "Physical Table Corrupted",
            -21 => "Physical Table MMap Failed",
            -22 => "Physical Table Read I/O Failed",
            -23 => "Physical Table Write I/O Failed",
            -24 => "Table Not Specified",
            -25 => "Only One Table May be Specified",
            -26 => "Unbounded Range",
            -27 => "Database GroupId Mismatch",
            -30 => "General Parsing Error",
            -31 => "Unrecognized Command/Keyword",
            -32 => "Unterminated String",
            -33 => "Unexpected Token",
            -34 => "Too Much Data Specified",
            -35 => "Must Declare Columns for Data",
            -36 => "Expected Column",
            -37 => "Expected Table",
            -38 => "Expected Data Item",
            -39 => "Expected Id",
            -40 => "Duplicate Column",
            -41 => "Requires WHERE Clause",
            -42 => "Expected Operator",
            -43 => "Expression Cannot have Two Constants",
            -44 => "Table not Found",
            -45 => "Column not Found",
            -46 => "Table Not Specified",
            -47 => "You must be in a transaction to run SQL",
            -48 => "Wildcard column not legal here",
            -49 => "Syntax Error",
            -50 => "No Default Schema, Schema must be Specified",
            -51 => "Schema Exists",
            -52 => "Table Exists",
            -53 => "Column Exists",
            -54 => "Unrecognized Type",
            -55 => "Can't push transaction for macro SQL",
            -56 => "Error executing macro SQL",
            -57 => "KEY or NOT NULL field cannot be empty",
            -58 => "Too Little Data Specified",
            -59 => "Record Already Exists",
            -60 => "Unrecognized Attribute",
            -61 => "Schema Not Found",
            -62 => "Cannot Remove Reserved Schema",
            -63 => "Cannot Remove Schema With Live Tables",
            -64 => "SQL Feature not supported",
            -65 => "Commit2 without Commit1",
            -66 => "Commit1 Conflict",
            -67 => "Delayed commit2 aborted after quorum reached",
            -68 => "Abort without a transaction to abort",
            -69 => "Query Interrupted",
            -70 => "Link lost during streaming query",
            -71 => "Cannot have both UNIQUE and PRIMARY KEY for field",
            -72 => "Duplicate default clause",
            _ => "Unknown Error",
        }
    }
}

fn storage_code(e: &TableFileError) -> i32 {
    match e {
        TableFileError::BadMagic(_) => -16,
        TableFileError::BadVersion(_) => -17,
        TableFileError::BadBlockType(_) | TableFileError::BadBlockSize(_) => -18,
        TableFileError::Truncated { .. } => -19,
        TableFileError::Corrupt(_) | TableFileError::Record(_) => -20,
        TableFileError::RecordTooLarge { .. } => -34,
        TableFileError::Io(_) => -22,
    }
}

pub type Result<T, E = DBError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_wire_stable() {
        assert_eq!(DBError::MissingWhere(Loc::default()).code(), -41);
        assert_eq!(DBError::ExpectedColumn(Loc::default()).code(), -36);
        assert_eq!(
            DBError::Commit1Conflict {
                conflict: stampdb_primitives::DbStamp::new(1)
            }
            .code(),
            -66
        );
        assert_eq!(DBError::SelectBreak.code(), -69);
        assert_eq!(DBError::Commit2WithoutCommit1.code(), -65);
    }

    #[test]
    fn describe_matches_code() {
        assert_eq!(DBError::describe_code(-66), "Commit1 Conflict");
        assert_eq!(DBError::describe_code(-999), "Unknown Error");
    }
}
