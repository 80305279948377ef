//! The stampdb engine.
//!
//! stampdb is a replicated SQL database core: clients speak a framed,
//! byte-order-agnostic packet protocol to per-client instance tasks;
//! each instance runs SQL through a hand-written lexer and a
//! recursive-descent parser that emits executable query plans, executes
//! them over append-only timestamp-stamped table files, and commits
//! through a two-phase protocol whose phase 1 assigns a minimum commit
//! timestamp and detects write-write conflicts.
//!
//! Crate layout mirrors the subsystem split:
//!
//! - [`sql`]: lexer, parser, datatype operator tables
//! - [`query`]: the executable plan structures
//! - [`db`]: schema catalog, table handles, transactions, two-phase commit
//! - [`engine`]: plan execution, delete suppression, ordering and limits
//! - [`instance`]: the per-client command loop with streamed results
//! - [`server`]: the rendezvous socket and instance hand-off
//!
//! Storage lives in `stampdb-tablestore`, the wire protocol in
//! `stampdb-client-api-messages`.

pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod instance;
pub mod query;
pub mod server;
pub mod sql;

pub use config::{default_db_dir, EngineOptions, DB_DIR_ENV};
pub use db::{Db, TxFlags};
pub use engine::{run_query, QueryOutcome, ResultRow};
pub use error::{DBError, Result};
pub use instance::Instance;
pub use server::Server;
