//! Shared fixtures for the writer tests.

use std::path::Path;
use std::sync::Arc;

use tracing::Level;
use tracing_subscriber::fmt::Subscriber;

use crate::components::{Descriptor, Format, Version};
use crate::model::*;
use crate::reader::ReadDeadline;
use crate::sstable::Sstable;
use crate::writer::{SstableWriter, WriterConfig};

pub fn init_tracing() {
    let _ = Subscriber::builder()
        .with_max_level(Level::TRACE)
        .try_init();
}

pub fn descriptor(dir: &Path, version: Version, generation: u64) -> Descriptor {
    Descriptor {
        dir: dir.to_path_buf(),
        keyspace: "ks".into(),
        table: "tbl".into(),
        version,
        generation,
        format: Format::Big,
    }
}

/// One int clustering key, three static columns, one regular int column.
pub fn test_schema() -> Arc<Schema> {
    Schema::new(
        "ks",
        "tbl",
        ColumnType::Int32,
        vec![ColumnType::Int32],
        vec![
            ColumnDef::atomic(b"s_inet", ColumnType::Inet),
            ColumnDef::atomic(b"s_int", ColumnType::Int32),
            ColumnDef::atomic(b"s_text", ColumnType::Text),
        ],
        vec![ColumnDef::atomic(b"val", ColumnType::Int32)],
    )
}

pub fn ck(n: i32) -> ClusteringPrefix {
    ClusteringPrefix::from(vec![n.to_be_bytes().to_vec()])
}

pub fn pk(n: i32) -> DecoratedKey {
    DecoratedKey::new(&ByteOrderedPartitioner, n.to_be_bytes().to_vec())
}

pub fn int_cell(ts: i64, v: i32) -> ColumnValue {
    ColumnValue::Atomic(Cell::Live {
        timestamp: ts,
        ttl: None,
        expiry: None,
        value: v.to_be_bytes().to_vec(),
    })
}

pub fn bytes_cell(ts: i64, v: &[u8]) -> ColumnValue {
    ColumnValue::Atomic(Cell::Live {
        timestamp: ts,
        ttl: None,
        expiry: None,
        value: v.to_vec(),
    })
}

pub fn row(ckey: i32, ts: i64, value: i32) -> ClusteringRow {
    ClusteringRow {
        clustering: ck(ckey),
        marker: Some(LivenessInfo { timestamp: ts, ttl: None, local_deletion_time: None }),
        deletion: None,
        cells: [(b"val".to_vec(), int_cell(ts, value))].into_iter().collect(),
    }
}

/// Write `events` into a fresh generation and return the opened result.
pub fn write_and_open(
    dir: &Path,
    version: Version,
    generation: u64,
    config: WriterConfig,
    events: Vec<PartitionEvent>,
) -> Sstable {
    let desc = descriptor(dir, version, generation);
    let schema = test_schema();
    let partitioner: Arc<dyn Partitioner> = Arc::new(ByteOrderedPartitioner);
    let writer = SstableWriter::create(
        desc.clone(),
        schema.clone(),
        partitioner.clone(),
        16,
        config,
    )
    .expect("create writer");
    writer.write_stream(events).expect("write stream");
    Sstable::open(desc, schema, partitioner).expect("open sstable")
}

pub fn read_all(sstable: &Sstable) -> Vec<PartitionEvent> {
    sstable.read_rows(ReadDeadline::none()).expect("read rows")
}
