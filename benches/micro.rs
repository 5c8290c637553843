//! Micro-benchmarks for the SSTable write and read pipelines.
//!
//! Uses Criterion for statistically rigorous measurement with regression
//! detection and HTML reports.
//!
//! # Running
//!
//! ```bash
//! cargo bench --bench micro              # run all micro-benchmarks
//! cargo bench --bench micro -- write     # filter by name
//! ```
//!
//! Reports are generated in `target/criterion/report/index.html`.

use std::sync::Arc;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tempfile::TempDir;

use tabula::components::compression::Compressor;
use tabula::components::{Descriptor, Format, Version};
use tabula::model::*;
use tabula::reader::{ClusteringSlice, ReadDeadline};
use tabula::sstable::Sstable;
use tabula::writer::{SstableWriter, WriterConfig};

// ------------------------------------------------------------------------------------------------
// Helpers
// ------------------------------------------------------------------------------------------------

/// Value payload per cell (128 bytes).
const VALUE_128B: [u8; 128] = [0xAB; 128];

fn bench_schema() -> Arc<Schema> {
    Schema::new(
        "bench_ks",
        "bench_tbl",
        ColumnType::Blob,
        vec![ColumnType::Int32],
        vec![],
        vec![ColumnDef::atomic(b"val", ColumnType::Blob)],
    )
}

fn descriptor(dir: &std::path::Path, generation: u64) -> Descriptor {
    Descriptor {
        dir: dir.to_path_buf(),
        keyspace: "bench_ks".into(),
        table: "bench_tbl".into(),
        version: Version::Mc,
        generation,
        format: Format::Big,
    }
}

fn make_events(partitions: u64, rows_per_partition: i32) -> Vec<PartitionEvent> {
    let mut events = Vec::new();
    for p in 0..partitions {
        events.push(PartitionEvent::PartitionStart {
            key: DecoratedKey::new(&ByteOrderedPartitioner, p.to_be_bytes().to_vec()),
            tombstone: Tombstone::NONE,
        });
        for c in 0..rows_per_partition {
            events.push(PartitionEvent::Row(ClusteringRow {
                clustering: ClusteringPrefix::from(vec![c.to_be_bytes().to_vec()]),
                marker: Some(LivenessInfo {
                    timestamp: 1_000,
                    ttl: None,
                    local_deletion_time: None,
                }),
                deletion: None,
                cells: [(
                    b"val".to_vec(),
                    ColumnValue::Atomic(Cell::Live {
                        timestamp: 1_000,
                        ttl: None,
                        expiry: None,
                        value: VALUE_128B.to_vec(),
                    }),
                )]
                .into_iter()
                .collect(),
            }));
        }
        events.push(PartitionEvent::PartitionEnd);
    }
    events
}

fn write_generation(
    dir: &std::path::Path,
    generation: u64,
    compressor: Option<Compressor>,
    events: Vec<PartitionEvent>,
    partitions: u64,
) -> Descriptor {
    let desc = descriptor(dir, generation);
    let writer = SstableWriter::create(
        desc.clone(),
        bench_schema(),
        Arc::new(ByteOrderedPartitioner),
        partitions,
        WriterConfig { compressor, ..WriterConfig::default() },
    )
    .expect("create writer");
    writer.write_stream(events).expect("write");
    desc
}

// ================================================================================================
// Write benchmarks
// ================================================================================================

fn bench_write(c: &mut Criterion) {
    let mut group = c.benchmark_group("write");
    for (name, compressor) in [
        ("plain", None),
        ("lz4", Some(Compressor::Lz4)),
        ("snappy", Some(Compressor::Snappy)),
    ] {
        let events = make_events(64, 32);
        let bytes: u64 = 64 * 32 * 128;
        group.throughput(Throughput::Bytes(bytes));
        group.bench_with_input(BenchmarkId::new("stream", name), &events, |b, events| {
            let mut generation = 0u64;
            b.iter(|| {
                let tmp = TempDir::new().unwrap();
                generation += 1;
                write_generation(tmp.path(), generation, compressor, events.clone(), 64);
            });
        });
    }
    group.finish();
}

// ================================================================================================
// Read benchmarks
// ================================================================================================

fn bench_read(c: &mut Criterion) {
    let tmp = TempDir::new().unwrap();
    let events = make_events(64, 32);
    let desc = write_generation(tmp.path(), 1, None, events, 64);
    let sstable = Sstable::open(desc, bench_schema(), Arc::new(ByteOrderedPartitioner))
        .expect("open");

    let mut group = c.benchmark_group("read");
    group.bench_function("full_scan", |b| {
        b.iter(|| sstable.read_rows(ReadDeadline::none()).unwrap());
    });
    group.bench_function("single_partition", |b| {
        let key = DecoratedKey::new(&ByteOrderedPartitioner, 42u64.to_be_bytes().to_vec());
        b.iter(|| {
            sstable
                .read_single_partition(&key, &ClusteringSlice::full(), ReadDeadline::none())
                .unwrap()
        });
    });
    group.finish();
}

criterion_group!(benches, bench_write, bench_read);
criterion_main!(benches);
