//! Engine configuration.

use std::env;
use std::path::PathBuf;

use stampdb_tablestore::datamap::DEFAULT_MAP_BUDGET;

/// Environment variable overriding the compiled-in database directory.
pub const DB_DIR_ENV: &str = "RDBMS_DIR";

const DEFAULT_DB_DIR: &str = "/var/db/rdbms";

/// Base directory holding databases (one subdirectory per database).
pub fn default_db_dir() -> PathBuf {
    env::var_os(DB_DIR_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DB_DIR))
}

/// Tunables for one open database.
#[derive(Clone, Debug)]
pub struct EngineOptions {
    /// ORDER BY result sets at most this large are sorted server-side;
    /// larger ones stream unsorted and the client is asked to sort.
    pub sort_buffer_rows: usize,
    /// Result-stream stall credit in bytes.
    pub stall_credit: i32,
    /// Block size for newly created table files.
    pub block_size: i32,
    /// Byte budget for data-map windows across all tables.
    pub map_budget: u64,
}

impl EngineOptions {
    pub fn sort_buffer_rows(mut self, n: usize) -> Self {
        self.sort_buffer_rows = n;
        self
    }

    pub fn stall_credit(mut self, n: i32) -> Self {
        self.stall_credit = n;
        self
    }

    pub fn block_size(mut self, n: i32) -> Self {
        self.block_size = n;
        self
    }
}

impl Default for EngineOptions {
    fn default() -> Self {
        EngineOptions {
            sort_buffer_rows: 500,
            stall_credit: stampdb_client_api_messages::STALL_CREDIT,
            block_size: stampdb_tablestore::tablefile::DEFAULT_BLOCK_SIZE,
            map_budget: DEFAULT_MAP_BUDGET,
        }
    }
}
