//! SQL front end: lexer, parser and the datatype operator tables.

pub mod lex;
pub mod parse;
pub mod types;

pub use lex::{Lexer, Token};
pub use parse::parse;
pub use types::{op_func, DataType, OpFunc, OpId};
