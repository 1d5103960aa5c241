//! wal_dump
//!
//! Prints the records of a database's write-ahead log, one per line.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use ariesdb::storage::wal::{
    WalFileStore, WalReader, DEFAULT_MAX_WAL_FILE_SIZE, OFFSET_FIRST_RECORD,
};
use ariesdb::storage::DiskManager;
use ariesdb::transactions::{TxnStateFile, TXNSTATE_FILENAME};
use ariesdb::{AriesError, Database, DatabaseConfig, Lsn, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

/// Dump the write-ahead log of an ariesdb database
#[derive(Parser, Debug)]
#[command(name = "wal_dump")]
#[command(about = "Print the records of an ariesdb write-ahead log")]
#[command(version)]
struct Args {
    /// Database directory
    #[arg(short, long)]
    dir: PathBuf,

    /// First LSN to print, as FILE:OFFSET (default: stored first LSN)
    #[arg(long)]
    from: Option<Lsn>,

    /// LSN to stop at, as FILE:OFFSET (default: stored next LSN)
    #[arg(long)]
    to: Option<Lsn>,

    /// WAL segment size cap in bytes
    #[arg(long, default_value_t = DEFAULT_MAX_WAL_FILE_SIZE)]
    segment_size: u32,

    /// Open the database (running recovery) before dumping; the default
    /// range then covers the recovered records and everything recovery wrote
    #[arg(long)]
    recover: bool,
}

fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    fmt().with_env_filter(filter).with_target(true).init();

    let args = Args::parse();
    match run(&args) {
        Ok(count) => {
            info!(count, "Dumped WAL records");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("wal_dump: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Reads `(first_lsn, next_lsn)` from the state file.
fn stored_range(dir: &Path) -> Result<(Lsn, Lsn)> {
    let disk_manager = DiskManager::new(dir)?;
    if !disk_manager.exists(TXNSTATE_FILENAME) {
        return Err(AriesError::NotFound(format!(
            "{} has no {TXNSTATE_FILENAME}",
            disk_manager.dir().display()
        )));
    }
    let state_file = TxnStateFile::open_or_create(&disk_manager)?;
    Ok((state_file.state().first_lsn, state_file.state().next_lsn))
}

/// Range printed when `--from`/`--to` are not given.
///
/// With `--recover` this is the range recovery replayed plus the records
/// it appended. Recovery deletes segments wholly before its new first LSN,
/// so the range starts no earlier than the first surviving segment.
fn default_range(args: &Args) -> Result<(Lsn, Lsn)> {
    let (first_lsn, next_lsn) = stored_range(&args.dir)?;
    if !args.recover {
        return Ok((first_lsn, next_lsn));
    }

    let config = DatabaseConfig {
        wal_segment_size: args.segment_size,
        ..DatabaseConfig::default()
    };
    let db = Database::open(&args.dir, config)?;
    let (recovered_first, recovered_next) = db.txn_manager().stored_lsns();
    // Leave the log as recovery wrote it.
    std::mem::forget(db);
    info!(%first_lsn, %next_lsn, %recovered_next, "Recovered database");

    let from = if first_lsn.log_file_no() == recovered_first.log_file_no() {
        first_lsn
    } else {
        Lsn::new(recovered_first.log_file_no(), OFFSET_FIRST_RECORD)
    };
    Ok((from, recovered_next))
}

fn run(args: &Args) -> Result<usize> {
    let (first_lsn, next_lsn) = default_range(args)?;
    let from = args.from.unwrap_or(first_lsn);
    let to = args.to.unwrap_or(next_lsn);
    println!("# range {from} .. {to} (default {first_lsn} .. {next_lsn})");

    let disk_manager = Arc::new(DiskManager::new(&args.dir)?);
    let store = Arc::new(WalFileStore::new(disk_manager, args.segment_size)?);
    let mut reader = WalReader::new(store);

    let mut lsn = from;
    let mut count = 0;
    while lsn < to {
        let (record, at, next) = reader.read_record(lsn)?;
        let prev = record
            .prev_lsn()
            .map_or_else(|| "-".to_string(), |prev| prev.to_string());
        let page = record
            .page_id()
            .map_or_else(|| "-".to_string(), |page| page.to_string());
        println!(
            "{at} size={:<5} {:<24} txn={:<6} prev={prev} page={page} segments={}",
            at.record_size().unwrap_or(0),
            record.record_type().to_string(),
            record.txn_id(),
            record.segment_count(),
        );
        count += 1;
        lsn = next;
    }
    Ok(count)
}
