use std::env;
use std::path::PathBuf;

use anyhow::{Context, Result};
use bench::workload::{self, WorkloadConfig};
use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "bpm-bench", about = "Buffer pool workload driver")]
struct Args {
    /// Data file path
    #[arg(long, value_name = "PATH", default_value = "bench.db")]
    db: PathBuf,

    /// Number of frames in the pool
    #[arg(long, default_value_t = 64)]
    pool_size: usize,

    /// Pages to create before the run
    #[arg(long, default_value_t = 256)]
    pages: usize,

    #[arg(long, default_value_t = 4)]
    workers: usize,

    /// Operations per worker
    #[arg(long, default_value_t = 10_000)]
    ops: usize,

    #[arg(long, default_value_t = 42)]
    seed: u64,
}

fn main() -> Result<()> {
    env_logger::init();

    let args = Args::parse();

    // Allow environment variables to override CLI args
    let db: PathBuf = if let Ok(path) = env::var("BPM_DB") {
        path.into()
    } else {
        args.db
    };
    let pool_size = if let Ok(value) = env::var("BPM_POOL_SIZE") {
        value.parse().context("Invalid BPM_POOL_SIZE value")?
    } else {
        args.pool_size
    };
    let workers = if let Ok(value) = env::var("BPM_WORKERS") {
        value.parse().context("Invalid BPM_WORKERS value")?
    } else {
        args.workers
    };

    if let Some(parent) = db.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).context("create db directory")?;
    }

    let config = WorkloadConfig {
        pool_size,
        pages: args.pages,
        workers,
        ops: args.ops,
        seed: args.seed,
    };
    println!("Using data file: {}", db.display());
    let report = workload::run(&db, &config)?;

    println!(
        "{} pages, {} fetches ({} increments), {} flushes, {} exhaustion retries in {:.2?}",
        report.pages,
        report.fetches,
        report.increments,
        report.flushes,
        report.retries,
        report.elapsed
    );
    Ok(())
}
