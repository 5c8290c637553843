//! Clustering-slice filtering.

use std::sync::Arc;

use tempfile::TempDir;

use crate::components::{Descriptor, Format, Version};
use crate::model::*;
use crate::reader::{ClusteringSlice, ReadDeadline};
use crate::sstable::Sstable;
use crate::writer::{SstableWriter, WriterConfig};

fn schema() -> Arc<Schema> {
    Schema::new(
        "ks",
        "tbl",
        ColumnType::Int32,
        vec![ColumnType::Int32],
        vec![],
        vec![ColumnDef::atomic(b"val", ColumnType::Int32)],
    )
}

fn ck(n: i32) -> ClusteringPrefix {
    ClusteringPrefix::from(vec![n.to_be_bytes().to_vec()])
}

fn row(c: i32) -> ClusteringRow {
    ClusteringRow {
        clustering: ck(c),
        marker: Some(LivenessInfo { timestamp: 10, ttl: None, local_deletion_time: None }),
        deletion: None,
        cells: [(
            b"val".to_vec(),
            ColumnValue::Atomic(Cell::Live {
                timestamp: 10,
                ttl: None,
                expiry: None,
                value: c.to_be_bytes().to_vec(),
            }),
        )]
        .into_iter()
        .collect(),
    }
}

fn write_partition(dir: &std::path::Path, rows: i32) -> (Sstable, DecoratedKey) {
    let desc = Descriptor {
        dir: dir.to_path_buf(),
        keyspace: "ks".into(),
        table: "tbl".into(),
        version: Version::Mc,
        generation: 1,
        format: Format::Big,
    };
    let schema = schema();
    let partitioner: Arc<dyn Partitioner> = Arc::new(ByteOrderedPartitioner);
    let key = DecoratedKey::new(&ByteOrderedPartitioner, b"part".to_vec());

    let mut events = vec![PartitionEvent::PartitionStart {
        key: key.clone(),
        tombstone: Tombstone::NONE,
    }];
    for c in 0..rows {
        events.push(PartitionEvent::Row(row(c)));
    }
    events.push(PartitionEvent::PartitionEnd);

    let writer = SstableWriter::create(
        desc.clone(),
        schema.clone(),
        partitioner.clone(),
        1,
        WriterConfig::default(),
    )
    .unwrap();
    writer.write_stream(events).unwrap();
    (Sstable::open(desc, schema, partitioner).unwrap(), key)
}

fn row_keys(events: &[PartitionEvent]) -> Vec<i32> {
    events
        .iter()
        .filter_map(|e| match e {
            PartitionEvent::Row(r) => {
                let c = &r.clustering.components[0];
                Some(i32::from_be_bytes([c[0], c[1], c[2], c[3]]))
            }
            _ => None,
        })
        .collect()
}

#[test]
fn restricted_slice_returns_exactly_the_range() {
    let tmp = TempDir::new().unwrap();
    let (sstable, key) = write_partition(tmp.path(), 50);

    let slice = ClusteringSlice::between(ck(10), ck(20));
    let events = sstable
        .read_single_partition(&key, &slice, ReadDeadline::none())
        .unwrap()
        .unwrap();
    assert_eq!(row_keys(&events), (10..20).collect::<Vec<_>>());
}

#[test]
fn full_slice_returns_everything() {
    let tmp = TempDir::new().unwrap();
    let (sstable, key) = write_partition(tmp.path(), 20);

    let events = sstable
        .read_single_partition(&key, &ClusteringSlice::full(), ReadDeadline::none())
        .unwrap()
        .unwrap();
    assert_eq!(row_keys(&events), (0..20).collect::<Vec<_>>());
    assert!(matches!(events.last(), Some(PartitionEvent::PartitionEnd)));
}

#[test]
fn missing_partition_returns_none() {
    let tmp = TempDir::new().unwrap();
    let (sstable, _) = write_partition(tmp.path(), 5);

    let absent = DecoratedKey::new(&ByteOrderedPartitioner, b"nope".to_vec());
    let got = sstable
        .read_single_partition(&absent, &ClusteringSlice::full(), ReadDeadline::none())
        .unwrap();
    assert!(got.is_none());
}

#[test]
fn promoted_index_and_sequential_reads_agree() {
    let tmp = TempDir::new().unwrap();
    // enough rows for several promoted-index blocks
    let desc = Descriptor {
        dir: tmp.path().to_path_buf(),
        keyspace: "ks".into(),
        table: "tbl".into(),
        version: Version::Mc,
        generation: 1,
        format: Format::Big,
    };
    let schema = schema();
    let partitioner: Arc<dyn Partitioner> = Arc::new(ByteOrderedPartitioner);
    let key = DecoratedKey::new(&ByteOrderedPartitioner, b"part".to_vec());

    let mut events = vec![PartitionEvent::PartitionStart {
        key: key.clone(),
        tombstone: Tombstone::NONE,
    }];
    for c in 0..600 {
        events.push(PartitionEvent::Row(row(c)));
    }
    events.push(PartitionEvent::PartitionEnd);

    let writer = SstableWriter::create(
        desc.clone(),
        schema.clone(),
        partitioner.clone(),
        1,
        // small blocks so the lookup actually skips
        WriterConfig { promoted_index_block_size: 512, ..WriterConfig::default() },
    )
    .unwrap();
    writer.write_stream(events).unwrap();
    let sstable = Sstable::open(desc, schema, partitioner).unwrap();

    let slice = ClusteringSlice::between(ck(300), ck(320));
    let events = sstable
        .read_single_partition(&key, &slice, ReadDeadline::none())
        .unwrap()
        .unwrap();
    assert_eq!(row_keys(&events), (300..320).collect::<Vec<_>>());
}

#[test]
fn zero_timeout_fails_with_io_timeout() {
    let tmp = TempDir::new().unwrap();
    let (sstable, key) = write_partition(tmp.path(), 5);

    let deadline = ReadDeadline::after(std::time::Duration::ZERO);
    std::thread::sleep(std::time::Duration::from_millis(2));
    let err = sstable
        .read_single_partition(&key, &ClusteringSlice::full(), deadline)
        .unwrap_err();
    match err {
        crate::error::SstableError::Io(e) => {
            assert_eq!(e.kind(), std::io::ErrorKind::TimedOut);
        }
        other => panic!("expected a timeout, got {other:?}"),
    }
}
