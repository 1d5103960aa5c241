//! Write-ahead log benchmarks.
//!
//! Measures:
//! - Diff computation between page images
//! - Record encoding
//! - The append path with and without fsync
//! - Logged page updates through the transaction manager

use std::sync::Arc;

use ariesdb::storage::wal::{
    compute_segments, LogSequenceNumber, UpdateSegment, WalFileStore, WalRecord, WalWriter,
    DEFAULT_MAX_WAL_FILE_SIZE,
};
use ariesdb::storage::{DiskManager, PAGE_SIZE};
use ariesdb::{Database, DatabaseConfig, PageId};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tempfile::TempDir;

/// Builds a page image with `changes` single-byte edits spread evenly.
fn edited_page(changes: usize) -> (Vec<u8>, Vec<u8>) {
    let old: Vec<u8> = (0..PAGE_SIZE).map(|i| (i % 251) as u8).collect();
    let mut new = old.clone();
    if changes > 0 {
        let stride = PAGE_SIZE / changes;
        for i in 0..changes {
            new[i * stride] ^= 0xFF;
        }
    }
    (old, new)
}

/// Benchmark diff computation
fn bench_diff(c: &mut Criterion) {
    let mut group = c.benchmark_group("wal_diff");
    group.throughput(Throughput::Bytes(PAGE_SIZE as u64));

    for changes in &[0usize, 1, 16, 256, 4096] {
        let (old, new) = edited_page(*changes);
        group.bench_with_input(BenchmarkId::from_parameter(changes), changes, |b, _| {
            b.iter(|| black_box(compute_segments(&old, &new).expect("diff")));
        });
    }

    group.finish();
}

fn update_record(segment_len: usize) -> WalRecord {
    WalRecord::UpdatePage {
        txn_id: 1,
        prev_lsn: LogSequenceNumber::new(0, 6),
        file_name: "bench.tbl".to_string(),
        page_no: 7,
        segments: vec![UpdateSegment {
            offset: 0,
            old_data: vec![0; segment_len],
            new_data: vec![1; segment_len],
        }],
    }
}

/// Benchmark record encoding
fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("wal_encode");

    for len in &[8usize, 256, PAGE_SIZE] {
        let record = update_record(*len);
        group.throughput(Throughput::Bytes(*len as u64 * 2));
        group.bench_with_input(BenchmarkId::from_parameter(len), len, |b, _| {
            b.iter(|| black_box(record.encode(6).expect("encode")));
        });
    }

    group.finish();
}

/// Benchmark raw appends
fn bench_append(c: &mut Criterion) {
    let mut group = c.benchmark_group("wal_append");
    let record = update_record(64);

    for sync in [false, true] {
        let temp_dir = TempDir::new().expect("create temp dir");
        let disk_manager = Arc::new(DiskManager::new(temp_dir.path()).expect("disk manager"));
        let store = Arc::new(
            WalFileStore::new(disk_manager, DEFAULT_MAX_WAL_FILE_SIZE).expect("create store"),
        );
        let mut writer = WalWriter::new(store, LogSequenceNumber::new(0, 6), sync);

        let name = if sync { "append_force" } else { "append" };
        group.throughput(Throughput::Elements(1));
        group.bench_function(name, |b| {
            b.iter(|| {
                let lsn = writer.append(&record).expect("append");
                if sync {
                    writer.force(lsn.end()).expect("force");
                }
                black_box(lsn)
            });
        });
    }

    group.finish();
}

/// Benchmark a logged single-page update committed per iteration
fn bench_logged_update(c: &mut Criterion) {
    let mut group = c.benchmark_group("wal_logged_update");

    let temp_dir = TempDir::new().expect("create temp dir");
    let config = DatabaseConfig {
        wal_sync: false,
        ..DatabaseConfig::default()
    };
    let db = Database::open(temp_dir.path(), config).expect("open database");
    let page_id = PageId::new("bench.tbl", 0);
    let mut value = 0u8;

    group.throughput(Throughput::Elements(1));
    group.bench_function("update_commit", |b| {
        b.iter(|| {
            value = value.wrapping_add(1);
            let mut ctx = db.begin_transaction().expect("begin");
            db.update_page(&mut ctx, &page_id, 128, &[value; 16])
                .expect("update");
            db.commit(&mut ctx).expect("commit");
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_diff,
    bench_encode,
    bench_append,
    bench_logged_update
);

criterion_main!(benches);
