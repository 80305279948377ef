//! SQL lexer.
//!
//! Table-driven over a 256-entry character class map. Identifiers may
//! contain dots (`schema.table.col` is one token), keywords are matched
//! case-insensitively through a 16-bucket hash keyed on the lowercased
//! first byte plus the length, and error tokens carry their error number
//! in the low 12 bits with the high bit set so the parser can hand the
//! same token straight to the error renderer.

use once_cell::sync::Lazy;

use crate::error::Loc;

pub const TOK_DOT: u32 = b'.' as u32;
pub const TOK_SEMI: u32 = b';' as u32;
pub const TOK_COMMA: u32 = b',' as u32;
pub const TOK_OBRACE: u32 = b'{' as u32;
pub const TOK_CBRACE: u32 = b'}' as u32;
pub const TOK_OPAREN: u32 = b'(' as u32;
pub const TOK_CPAREN: u32 = b')' as u32;
pub const TOK_OBRACKET: u32 = b'[' as u32;
pub const TOK_CBRACKET: u32 = b']' as u32;
pub const TOK_STAR: u32 = b'*' as u32;
pub const TOK_EQ: u32 = b'=' as u32;
pub const TOK_LT: u32 = b'<' as u32;
pub const TOK_GT: u32 = b'>' as u32;
pub const TOK_PLUS: u32 = b'+' as u32;
pub const TOK_MINUS: u32 = b'-' as u32;
pub const TOK_DOLLAR: u32 = b'$' as u32;
pub const TOK_STRING: u32 = b'\'' as u32;
pub const TOK_DQSTRING: u32 = b'"' as u32;

pub const TOKF_MISC: u32 = 0x0000_1000;
pub const TOKF_ID: u32 = 0x0000_2000;
pub const TOKF_EOF: u32 = 0x4000_0000;
pub const TOKF_ERROR: u32 = 0x8000_0000;
pub const TOKF_ERRMASK: u32 = 0x0000_0FFF;

pub const TOK_EOF1: u32 = TOKF_EOF; // embedded NUL, soft end of input
pub const TOK_EOF2: u32 = TOKF_EOF + 1; // true end of input

pub const TOK_SOF: u32 = TOKF_MISC;
pub const TOK_INT: u32 = TOKF_MISC + 0x01;
pub const TOK_REAL: u32 = TOKF_MISC + 0x02;
pub const TOK_LTEQ: u32 = TOKF_MISC + 0x03;
pub const TOK_GTEQ: u32 = TOKF_MISC + 0x04;
pub const TOK_NOTEQ: u32 = TOKF_MISC + 0x05;

pub const TOK_ID: u32 = TOKF_ID;
pub const TOK_INSERT: u32 = TOKF_ID + 0x001;
pub const TOK_DELETE: u32 = TOKF_ID + 0x002;
pub const TOK_SELECT: u32 = TOKF_ID + 0x003;
pub const TOK_UPDATE: u32 = TOKF_ID + 0x004;
pub const TOK_CREATE: u32 = TOKF_ID + 0x005;
pub const TOK_DROP: u32 = TOKF_ID + 0x006;
pub const TOK_COUNT: u32 = TOKF_ID + 0x007;
pub const TOK_CLONE: u32 = TOKF_ID + 0x008;
pub const TOK_INTO: u32 = TOKF_ID + 0x100;
pub const TOK_FROM: u32 = TOKF_ID + 0x101;
pub const TOK_WHERE: u32 = TOKF_ID + 0x102;
pub const TOK_SET: u32 = TOKF_ID + 0x103;
pub const TOK_VALUES: u32 = TOKF_ID + 0x104;
pub const TOK_USING: u32 = TOKF_ID + 0x105;
pub const TOK_TABLE: u32 = TOKF_ID + 0x106;
pub const TOK_SCHEMA: u32 = TOKF_ID + 0x107;
pub const TOK_AND: u32 = TOKF_ID + 0x108;
pub const TOK_BEGIN: u32 = TOKF_ID + 0x109;
pub const TOK_COMMIT: u32 = TOKF_ID + 0x10a;
pub const TOK_ROLLBACK: u32 = TOKF_ID + 0x10b;
pub const TOK_PRIMARY: u32 = TOKF_ID + 0x10c;
pub const TOK_KEY: u32 = TOKF_ID + 0x10d;
pub const TOK_NOT: u32 = TOKF_ID + 0x10e;
pub const TOK_NULL: u32 = TOKF_ID + 0x10f;
pub const TOK_ORDER: u32 = TOKF_ID + 0x110;
pub const TOK_BY: u32 = TOKF_ID + 0x111;
pub const TOK_DESC: u32 = TOKF_ID + 0x112;
pub const TOK_LOAD: u32 = TOKF_ID + 0x113;
pub const TOK_ALTER: u32 = TOKF_ID + 0x114;
pub const TOK_COLUMN: u32 = TOKF_ID + 0x115;
pub const TOK_ADD: u32 = TOKF_ID + 0x116;
pub const TOK_DATA: u32 = TOKF_ID + 0x117;
pub const TOK_TYPE: u32 = TOKF_ID + 0x118;
pub const TOK_BEGINRO: u32 = TOKF_ID + 0x119;
pub const TOK_LIMIT: u32 = TOKF_ID + 0x11a;
pub const TOK_LIKE: u32 = TOKF_ID + 0x11b;
pub const TOK_HISTORY: u32 = TOKF_ID + 0x11c;
pub const TOK_STREAMING: u32 = TOKF_ID + 0x11d;
pub const TOK_READONLY: u32 = TOKF_ID + 0x11e;
pub const TOK_SYNC: u32 = TOKF_ID + 0x11f;
pub const TOK_UNIQUE: u32 = TOKF_ID + 0x120;
pub const TOK_SAME: u32 = TOKF_ID + 0x121;
pub const TOK_DEFAULT: u32 = TOKF_ID + 0x122;

/// Encode a `DBError` wire code into an error token type.
pub const fn err_token(dberr: i32) -> u32 {
    ((-dberr) as u32 & TOKF_ERRMASK) | TOKF_ERROR
}

const ERR_PARSE: u32 = err_token(-30);
const ERR_UNTERMINATED_STRING: u32 = err_token(-32);
const ERR_UNEXPECTED_TOKEN: u32 = err_token(-33);

static KEYWORDS: &[(&str, u32)] = &[
    ("insert", TOK_INSERT),
    ("delete", TOK_DELETE),
    ("select", TOK_SELECT),
    ("update", TOK_UPDATE),
    ("create", TOK_CREATE),
    ("drop", TOK_DROP),
    ("count", TOK_COUNT),
    ("clone", TOK_CLONE),
    ("into", TOK_INTO),
    ("from", TOK_FROM),
    ("where", TOK_WHERE),
    ("set", TOK_SET),
    ("values", TOK_VALUES),
    ("using", TOK_USING),
    ("table", TOK_TABLE),
    ("schema", TOK_SCHEMA),
    ("and", TOK_AND),
    ("begin", TOK_BEGIN),
    ("beginro", TOK_BEGINRO),
    ("streaming", TOK_STREAMING),
    ("commit", TOK_COMMIT),
    ("rollback", TOK_ROLLBACK),
    ("primary", TOK_PRIMARY),
    ("key", TOK_KEY),
    ("not", TOK_NOT),
    ("null", TOK_NULL),
    ("order", TOK_ORDER),
    ("by", TOK_BY),
    ("desc", TOK_DESC),
    ("limit", TOK_LIMIT),
    ("load", TOK_LOAD),
    ("alter", TOK_ALTER),
    ("column", TOK_COLUMN),
    ("add", TOK_ADD),
    ("data", TOK_DATA),
    ("type", TOK_TYPE),
    ("like", TOK_LIKE),
    ("history", TOK_HISTORY),
    ("sync", TOK_SYNC),
    ("readonly", TOK_READONLY),
    ("unique", TOK_UNIQUE),
    ("same", TOK_SAME),
    ("default", TOK_DEFAULT),
];

const KW_BUCKETS: usize = 16;

fn kw_bucket(first: u8, len: usize) -> usize {
    (first.to_ascii_lowercase() as usize + len) & (KW_BUCKETS - 1)
}

static KEYWORD_HASH: Lazy<[Vec<(&'static str, u32)>; KW_BUCKETS]> = Lazy::new(|| {
    let mut buckets: [Vec<(&'static str, u32)>; KW_BUCKETS] = Default::default();
    for &(kw, tok) in KEYWORDS {
        buckets[kw_bucket(kw.as_bytes()[0], kw.len())].push((kw, tok));
    }
    buckets
});

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Class {
    Ws,
    Alpha,
    Digit,
    Special1,
    SpecialM,
    Quote,
    Dollar,
    Nul,
    Illegal,
}

static CLASSES: Lazy<[Class; 256]> = Lazy::new(|| {
    let mut t = [Class::Illegal; 256];
    for c in [b' ', b'\t', b'\r', b'\n'] {
        t[c as usize] = Class::Ws;
    }
    for c in b'a'..=b'z' {
        t[c as usize] = Class::Alpha;
    }
    for c in b'A'..=b'Z' {
        t[c as usize] = Class::Alpha;
    }
    t[b'_' as usize] = Class::Alpha;
    for c in b'0'..=b'9' {
        t[c as usize] = Class::Digit;
    }
    for c in [
        b'.', b';', b',', b'{', b'}', b'(', b')', b'[', b']', b'*', b'=', b'+', b'-',
    ] {
        t[c as usize] = Class::Special1;
    }
    for c in [b'<', b'>', b'/'] {
        t[c as usize] = Class::SpecialM;
    }
    t[b'\'' as usize] = Class::Quote;
    t[b'"' as usize] = Class::Quote;
    t[b'$' as usize] = Class::Dollar;
    t[0] = Class::Nul;
    t
});

fn ident_cont(b: u8) -> bool {
    matches!(CLASSES[b as usize], Class::Alpha | Class::Digit) || b == b'.'
}

/// A lexical token. Carries its own source span so the parser can save a
/// token as a re-scan cursor and the error renderer can point back into
/// the query text.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Token {
    pub ty: u32,
    pub off: usize,
    pub len: usize,
    pub line: u32,
}

impl Token {
    pub fn is_error(&self) -> bool {
        self.ty & TOKF_ERROR != 0
    }

    pub fn is_eof(&self) -> bool {
        self.ty & TOKF_EOF != 0
    }

    /// Negative wire error code, if this is an error token.
    pub fn error_code(&self) -> Option<i32> {
        self.is_error().then(|| -((self.ty & TOKF_ERRMASK) as i32))
    }

    pub fn loc(&self) -> Loc {
        Loc {
            off: self.off,
            len: self.len,
            line: self.line,
        }
    }
}

pub struct Lexer<'a> {
    buf: &'a [u8],
}

impl<'a> Lexer<'a> {
    /// Prime the lexer; the returned start-of-file token is the cursor
    /// for the first [`Lexer::next`] call.
    pub fn new(buf: &'a [u8]) -> (Lexer<'a>, Token) {
        let lexer = Lexer { buf };
        let sof = Token {
            ty: TOK_SOF,
            off: 0,
            len: 0,
            line: 1,
        };
        (lexer, sof)
    }

    pub fn data(&self, t: &Token) -> &'a [u8] {
        &self.buf[t.off..t.off + t.len]
    }

    pub fn text(&self, t: &Token) -> &'a str {
        std::str::from_utf8(self.data(t)).unwrap_or("")
    }

    /// Scan the token after `prev`.
    pub fn next(&self, prev: &Token) -> Token {
        let mut pos = prev.off + prev.len;
        let mut line = prev.line;

        loop {
            let Some(&b) = self.buf.get(pos) else {
                return Token {
                    ty: TOK_EOF2,
                    off: pos,
                    len: 0,
                    line,
                };
            };
            match CLASSES[b as usize] {
                Class::Ws => {
                    if b == b'\n' {
                        line += 1;
                    }
                    pos += 1;
                }
                Class::Nul => {
                    return Token {
                        ty: TOK_EOF1,
                        off: pos,
                        len: 0,
                        line,
                    }
                }
                Class::Alpha => return self.scan_ident(pos, line),
                Class::Digit => return self.scan_number(pos, line),
                Class::Quote => return self.scan_string(pos, line, b),
                Class::Dollar => {
                    // $var: a host variable reference, one identifier token
                    let mut end = pos + 1;
                    while end < self.buf.len() && ident_cont(self.buf[end]) {
                        end += 1;
                    }
                    return Token {
                        ty: TOK_DOLLAR,
                        off: pos,
                        len: end - pos,
                        line,
                    };
                }
                Class::Special1 => {
                    return Token {
                        ty: b as u32,
                        off: pos,
                        len: 1,
                        line,
                    }
                }
                Class::SpecialM => match b {
                    b'<' => {
                        return match self.buf.get(pos + 1) {
                            Some(b'=') => Token {
                                ty: TOK_LTEQ,
                                off: pos,
                                len: 2,
                                line,
                            },
                            Some(b'>') => Token {
                                ty: TOK_NOTEQ,
                                off: pos,
                                len: 2,
                                line,
                            },
                            _ => Token {
                                ty: TOK_LT,
                                off: pos,
                                len: 1,
                                line,
                            },
                        }
                    }
                    b'>' => {
                        return match self.buf.get(pos + 1) {
                            Some(b'=') => Token {
                                ty: TOK_GTEQ,
                                off: pos,
                                len: 2,
                                line,
                            },
                            _ => Token {
                                ty: TOK_GT,
                                off: pos,
                                len: 1,
                                line,
                            },
                        }
                    }
                    b'/' => match self.buf.get(pos + 1) {
                        Some(b'/') => {
                            while pos < self.buf.len() && self.buf[pos] != b'\n' {
                                pos += 1;
                            }
                        }
                        Some(b'*') => {
                            let mut end = pos + 2;
                            loop {
                                if end + 1 >= self.buf.len() {
                                    return Token {
                                        ty: ERR_PARSE,
                                        off: pos,
                                        len: 2,
                                        line,
                                    };
                                }
                                if self.buf[end] == b'\n' {
                                    line += 1;
                                }
                                if self.buf[end] == b'*' && self.buf[end + 1] == b'/' {
                                    break;
                                }
                                end += 1;
                            }
                            pos = end + 2;
                        }
                        _ => {
                            return Token {
                                ty: ERR_UNEXPECTED_TOKEN,
                                off: pos,
                                len: 1,
                                line,
                            }
                        }
                    },
                    _ => unreachable!(),
                },
                Class::Illegal => {
                    return Token {
                        ty: ERR_UNEXPECTED_TOKEN,
                        off: pos,
                        len: 1,
                        line,
                    }
                }
            }
        }
    }

    fn scan_ident(&self, pos: usize, line: u32) -> Token {
        let mut end = pos + 1;
        while end < self.buf.len() && ident_cont(self.buf[end]) {
            end += 1;
        }
        let word = &self.buf[pos..end];
        let mut ty = TOK_ID;
        // dotted names are never keywords
        if !word.contains(&b'.') {
            for &(kw, tok) in &KEYWORD_HASH[kw_bucket(word[0], word.len())] {
                if word.eq_ignore_ascii_case(kw.as_bytes()) {
                    ty = tok;
                    break;
                }
            }
        }
        Token {
            ty,
            off: pos,
            len: end - pos,
            line,
        }
    }

    fn scan_number(&self, pos: usize, line: u32) -> Token {
        let mut end = pos;
        let mut ty = TOK_INT;
        while end < self.buf.len() && self.buf[end].is_ascii_digit() {
            end += 1;
        }
        if end < self.buf.len()
            && self.buf[end] == b'.'
            && self.buf.get(end + 1).is_some_and(|b| b.is_ascii_digit())
        {
            ty = TOK_REAL;
            end += 1;
            while end < self.buf.len() && self.buf[end].is_ascii_digit() {
                end += 1;
            }
        }
        if end < self.buf.len() && (self.buf[end] | 0x20) == b'e' {
            let mut exp = end + 1;
            if self.buf.get(exp).is_some_and(|&b| b == b'+' || b == b'-') {
                exp += 1;
            }
            if self.buf.get(exp).is_some_and(|b| b.is_ascii_digit()) {
                ty = TOK_REAL;
                end = exp;
                while end < self.buf.len() && self.buf[end].is_ascii_digit() {
                    end += 1;
                }
            }
        }
        Token {
            ty,
            off: pos,
            len: end - pos,
            line,
        }
    }

    fn scan_string(&self, pos: usize, line: u32, quote: u8) -> Token {
        let mut end = pos + 1;
        loop {
            match self.buf.get(end) {
                None | Some(b'\n') | Some(0) => {
                    return Token {
                        ty: ERR_UNTERMINATED_STRING,
                        off: pos,
                        len: end - pos,
                        line,
                    }
                }
                Some(b'\\') => end += 2,
                Some(&b) if b == quote => {
                    return Token {
                        ty: quote as u32,
                        off: pos,
                        len: end + 1 - pos,
                        line,
                    }
                }
                Some(_) => end += 1,
            }
        }
    }

    /// The bytes inside a string token's quotes with backslash escapes
    /// resolved.
    pub fn string_value(&self, t: &Token) -> Vec<u8> {
        let raw = &self.buf[t.off + 1..t.off + t.len.saturating_sub(1)];
        let mut out = Vec::with_capacity(raw.len());
        let mut i = 0;
        while i < raw.len() {
            if raw[i] == b'\\' && i + 1 < raw.len() {
                out.push(raw[i + 1]);
                i += 2;
            } else {
                out.push(raw[i]);
                i += 1;
            }
        }
        out
    }

    /// Render the offending line with the token's span highlighted, the
    /// way interactive clients print query errors.
    pub fn error_context(&self, t: &Token) -> String {
        let start = self.buf[..t.off.min(self.buf.len())]
            .iter()
            .rposition(|&b| b == b'\n')
            .map(|i| i + 1)
            .unwrap_or(0);
        let end = self.buf[t.off.min(self.buf.len())..]
            .iter()
            .position(|&b| b == b'\n' || b == 0)
            .map(|i| t.off + i)
            .unwrap_or(self.buf.len());
        let src = String::from_utf8_lossy(&self.buf[start..end]);
        let pad = " ".repeat(t.off.saturating_sub(start));
        let mark = "^".repeat(t.len.max(1));
        format!("line {}: {}\n        {}{}{}", t.line, src, pad, mark, "")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn toks(src: &str) -> Vec<(u32, String)> {
        let (lexer, mut t) = Lexer::new(src.as_bytes());
        let mut out = Vec::new();
        loop {
            t = lexer.next(&t);
            if t.is_eof() {
                break;
            }
            out.push((t.ty, lexer.text(&t).to_string()));
            if t.is_error() {
                break;
            }
        }
        out
    }

    #[test]
    fn keywords_are_case_insensitive() {
        let got = toks("SeLeCt a FROM t;");
        assert_eq!(got[0].0, TOK_SELECT);
        assert_eq!(got[1], (TOK_ID, "a".into()));
        assert_eq!(got[2].0, TOK_FROM);
        assert_eq!(got[3], (TOK_ID, "t".into()));
        assert_eq!(got[4].0, TOK_SEMI);
    }

    #[test]
    fn dotted_identifier_is_one_token() {
        let got = toks("sch.table.col");
        assert_eq!(got, vec![(TOK_ID, "sch.table.col".into())]);
    }

    #[test]
    fn multi_char_operators() {
        let got = toks("a <= b >= c <> d < e > f = g");
        let ops: Vec<u32> = got.iter().map(|(t, _)| *t).collect();
        assert_eq!(
            ops,
            vec![
                TOK_ID, TOK_LTEQ, TOK_ID, TOK_GTEQ, TOK_ID, TOK_NOTEQ, TOK_ID, TOK_LT, TOK_ID,
                TOK_GT, TOK_ID, TOK_EQ, TOK_ID
            ]
        );
    }

    #[test]
    fn numbers_int_and_real() {
        assert_eq!(toks("42")[0].0, TOK_INT);
        assert_eq!(toks("3.25")[0].0, TOK_REAL);
        assert_eq!(toks("1e9")[0].0, TOK_REAL);
        assert_eq!(toks("6.02e+23")[0].0, TOK_REAL);
        // a trailing dot stays a separate token
        let got = toks("1.x");
        assert_eq!(got[0].0, TOK_INT);
        assert_eq!(got[1].0, TOK_DOT);
    }

    #[test]
    fn strings_and_escapes() {
        let (lexer, t) = Lexer::new(br#"'it\'s'"#);
        let t = lexer.next(&t);
        assert_eq!(t.ty, TOK_STRING);
        assert_eq!(lexer.string_value(&t), b"it's");

        let got = toks("\"double\"");
        assert_eq!(got[0].0, TOK_DQSTRING);
    }

    #[test]
    fn unterminated_string_is_an_error_token() {
        let got = toks("'oops");
        assert_eq!(got.last().unwrap().0 & TOKF_ERROR, TOKF_ERROR);
        let (lexer, t) = Lexer::new(b"'oops");
        let t = lexer.next(&t);
        assert_eq!(t.error_code(), Some(-32));
    }

    #[test]
    fn comments_are_skipped() {
        let got = toks("select /* hidden */ a // rest\n, b");
        let tys: Vec<u32> = got.iter().map(|(t, _)| *t).collect();
        assert_eq!(tys, vec![TOK_SELECT, TOK_ID, TOK_COMMA, TOK_ID]);
    }

    #[test]
    fn embedded_nul_is_soft_eof() {
        let (lexer, t) = Lexer::new(b"a\0b");
        let t = lexer.next(&t);
        assert_eq!(t.ty, TOK_ID);
        let t = lexer.next(&t);
        assert_eq!(t.ty, TOK_EOF1);
    }

    #[test]
    fn line_numbers_advance() {
        let (lexer, t) = Lexer::new(b"select\n\nfrom");
        let t = lexer.next(&t);
        assert_eq!(t.line, 1);
        let t = lexer.next(&t);
        assert_eq!(t.line, 3);
    }

    #[test]
    fn error_context_highlights_span() {
        let src = b"SELECT FROM t;";
        let (lexer, t) = Lexer::new(src);
        let t = lexer.next(&t); // SELECT
        let from = lexer.next(&t); // FROM
        let ctx = lexer.error_context(&from);
        assert!(ctx.contains("SELECT FROM t;"));
        // the caret line must sit under the FROM token
        let caret_line = ctx.lines().last().unwrap();
        assert_eq!(caret_line.find('^').unwrap() - 8, from.off);
        assert!(caret_line.matches('^').count() >= 4);
    }

    #[test]
    fn dollar_variable() {
        let got = toks("$var");
        assert_eq!(got[0], (TOK_DOLLAR, "$var".into()));
    }
}
