//! Standalone database server: open one database directory and serve
//! client instances on its rendezvous socket.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use stampdb::{EngineOptions, Server};

#[derive(Parser, Debug)]
#[command(name = "stampdb", about = "stampdb database server")]
struct Args {
    /// Database directory (defaults to $RDBMS_DIR).
    #[arg(value_name = "DIR")]
    dir: Option<PathBuf>,

    /// Block size for newly created table files.
    #[arg(long)]
    block_size: Option<i32>,

    /// Row count below which ORDER BY sorts server-side.
    #[arg(long)]
    sort_buffer_rows: Option<usize>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let dir = args.dir.unwrap_or_else(stampdb::default_db_dir);
    let mut opts = EngineOptions::default();
    if let Some(bs) = args.block_size {
        opts = opts.block_size(bs);
    }
    if let Some(rows) = args.sort_buffer_rows {
        opts = opts.sort_buffer_rows(rows);
    }

    log::info!("serving database at {}", dir.display());
    Server::new(&dir, opts)
        .run()
        .await
        .with_context(|| format!("server failed for {}", dir.display()))?;
    Ok(())
}
