//! Data types and their comparator tables.
//!
//! Every comparator returns a signed region code that encodes both the
//! truth value and where the probe sits relative to the match window, so
//! the scanner can terminate an indexed range early:
//!
//! - `-1` FALSE, left side below the window
//! - `-2` FALSE, left side above the window
//! - `+1` TRUE, low side
//! - `+2` TRUE, high side
//! - `0` operator not applicable to the type
//!
//! Seeing `-2` on an ascending indexed scan means no further record can
//! match and the scan stops without reading to EOF.

use stampdb_tablestore::index::IndexOpClass;

/// Operator ids, in clause order of the WHERE grammar.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OpId {
    Like,
    RLike,
    Same,
    RSame,
    EqEq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
}

impl OpId {
    /// The index class able to serve this operator, if any.
    pub fn index_class(self) -> Option<IndexOpClass> {
        match self {
            OpId::EqEq | OpId::Lt | OpId::LtEq | OpId::Gt | OpId::GtEq => Some(IndexOpClass::Exact),
            OpId::Like | OpId::Same => Some(IndexOpClass::CaseFold),
            OpId::NotEq | OpId::RLike | OpId::RSame => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DataType {
    #[default]
    Unknown,
    Str,
}

impl DataType {
    pub fn parse(name: &str) -> Option<DataType> {
        // every stored value is a string; the type name space is kept for
        // schema compatibility
        match name.to_ascii_lowercase().as_str() {
            "varchar" | "char" | "text" | "string" | "data" => Some(DataType::Str),
            _ => None,
        }
    }

    pub fn type_name(self) -> &'static str {
        match self {
            DataType::Unknown => "unknown",
            DataType::Str => "varchar",
        }
    }
}

pub type OpFunc = fn(&[u8], &[u8]) -> i32;

/// Comparator for `(type, operator)`; the per-type operator table.
pub fn op_func(dt: DataType, op: OpId) -> OpFunc {
    match dt {
        DataType::Unknown => op_unknown,
        DataType::Str => match op {
            OpId::Like => op_like,
            OpId::RLike => op_rlike,
            OpId::Same => op_same,
            OpId::RSame => op_rsame,
            OpId::EqEq => op_exact_match,
            OpId::NotEq => op_exact_no_match,
            OpId::Lt => op_lt,
            OpId::LtEq => op_lteq,
            OpId::Gt => op_gt,
            OpId::GtEq => op_gteq,
        },
    }
}

fn op_unknown(_d1: &[u8], _d2: &[u8]) -> i32 {
    0
}

pub fn op_exact_match(d1: &[u8], d2: &[u8]) -> i32 {
    let s = d1.len().min(d2.len());
    for i in 0..s {
        if d1[i] == d2[i] {
            continue;
        }
        return if d1[i] < d2[i] { -1 } else { -2 };
    }
    if s == d1.len() {
        if s == d2.len() {
            return 1;
        }
        return -1;
    }
    -2
}

pub fn op_exact_no_match(d1: &[u8], d2: &[u8]) -> i32 {
    let s = d1.len().min(d2.len());
    for i in 0..s {
        if d1[i] == d2[i] {
            continue;
        }
        return if d1[i] < d2[i] { 1 } else { 2 };
    }
    if s == d1.len() {
        if s == d2.len() {
            return -1;
        }
        return 1;
    }
    2
}

fn op_lt(d1: &[u8], d2: &[u8]) -> i32 {
    let s = d1.len().min(d2.len());
    for i in 0..s {
        if d1[i] == d2[i] {
            continue;
        }
        return if d1[i] < d2[i] { 1 } else { -1 };
    }
    if s == d1.len() && s != d2.len() {
        return 1;
    }
    -1
}

fn op_gt(d1: &[u8], d2: &[u8]) -> i32 {
    let s = d1.len().min(d2.len());
    for i in 0..s {
        if d1[i] == d2[i] {
            continue;
        }
        return if d1[i] > d2[i] { 1 } else { -1 };
    }
    if s == d1.len() {
        return -1;
    }
    1
}

fn op_lteq(d1: &[u8], d2: &[u8]) -> i32 {
    let s = d1.len().min(d2.len());
    for i in 0..s {
        if d1[i] == d2[i] {
            continue;
        }
        return if d1[i] < d2[i] { 1 } else { -1 };
    }
    if s == d1.len() {
        return 1;
    }
    -1
}

fn op_gteq(d1: &[u8], d2: &[u8]) -> i32 {
    let s = d1.len().min(d2.len());
    for i in 0..s {
        if d1[i] == d2[i] {
            continue;
        }
        return if d1[i] > d2[i] { 1 } else { -1 };
    }
    if s == d2.len() {
        return 1;
    }
    -1
}

/// `d1 LIKE d2`: case-insensitive prefix match of the pattern `d2`
/// against the data `d1`.
fn op_like(d1: &[u8], d2: &[u8]) -> i32 {
    if d2.len() > d1.len() {
        return -1;
    }
    for i in 0..d2.len() {
        if d1[i].eq_ignore_ascii_case(&d2[i]) {
            continue;
        }
        return -2;
    }
    1
}

fn op_rlike(d1: &[u8], d2: &[u8]) -> i32 {
    if d1.len() > d2.len() {
        return 1;
    }
    for i in 0..d1.len() {
        if d1[i].eq_ignore_ascii_case(&d2[i]) {
            continue;
        }
        return 2;
    }
    -1
}

/// Case-insensitive equality with full region codes.
fn op_same(d1: &[u8], d2: &[u8]) -> i32 {
    let s = d1.len().min(d2.len());
    for i in 0..s {
        let c1 = d1[i].to_ascii_lowercase();
        let c2 = d2[i].to_ascii_lowercase();
        if c1 == c2 {
            continue;
        }
        return if c1 < c2 { -1 } else { -2 };
    }
    if s == d1.len() {
        if s == d2.len() {
            return 1;
        }
        return -1;
    }
    -2
}

fn op_rsame(d1: &[u8], d2: &[u8]) -> i32 {
    let s = d1.len().min(d2.len());
    for i in 0..s {
        let c1 = d1[i].to_ascii_lowercase();
        let c2 = d2[i].to_ascii_lowercase();
        if c1 == c2 {
            continue;
        }
        return if c1 < c2 { 1 } else { 2 };
    }
    if s == d1.len() {
        if s == d2.len() {
            return -1;
        }
        return 1;
    }
    2
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn exact_match_regions() {
        assert_eq!(op_exact_match(b"abc", b"abc"), 1);
        assert_eq!(op_exact_match(b"abb", b"abc"), -1); // below window
        assert_eq!(op_exact_match(b"abd", b"abc"), -2); // above window
        assert_eq!(op_exact_match(b"ab", b"abc"), -1);
        assert_eq!(op_exact_match(b"abcd", b"abc"), -2);
    }

    #[test]
    fn not_eq_regions_mirror_eq() {
        assert_eq!(op_exact_no_match(b"abc", b"abc"), -1);
        assert_eq!(op_exact_no_match(b"abb", b"abc"), 1);
        assert_eq!(op_exact_no_match(b"abd", b"abc"), 2);
    }

    #[test]
    fn relational_ops() {
        let lt = op_func(DataType::Str, OpId::Lt);
        assert_eq!(lt(b"a", b"b"), 1);
        assert_eq!(lt(b"b", b"b"), -1);
        assert_eq!(lt(b"c", b"b"), -1);
        assert_eq!(lt(b"a", b"ab"), 1); // shorter sorts first

        let gteq = op_func(DataType::Str, OpId::GtEq);
        assert_eq!(gteq(b"b", b"b"), 1);
        assert_eq!(gteq(b"c", b"b"), 1);
        assert_eq!(gteq(b"a", b"b"), -1);
    }

    #[test]
    fn like_is_case_insensitive_prefix() {
        let like = op_func(DataType::Str, OpId::Like);
        assert_eq!(like(b"Hello world", b"heLLo"), 1);
        assert_eq!(like(b"He", b"hello"), -1); // data shorter than pattern
        assert_eq!(like(b"Goodbye", b"hello"), -2);
    }

    #[test]
    fn same_is_case_insensitive_equality() {
        let same = op_func(DataType::Str, OpId::Same);
        assert_eq!(same(b"MiXeD", b"mixed"), 1);
        assert_eq!(same(b"apple", b"banana"), -1);
        assert_eq!(same(b"cherry", b"banana"), -2);
    }

    #[test]
    fn unknown_type_is_inapplicable() {
        let f = op_func(DataType::Unknown, OpId::EqEq);
        assert_eq!(f(b"a", b"a"), 0);
    }

    #[test]
    fn type_names_parse() {
        assert_eq!(DataType::parse("VARCHAR"), Some(DataType::Str));
        assert_eq!(DataType::parse("nonsense"), None);
    }
}
