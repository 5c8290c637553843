//! Range-tombstone writing: boundaries, merging, reconstruction.

use tempfile::TempDir;

use super::helpers::*;
use crate::components::Version;
use crate::model::*;
use crate::writer::WriterConfig;

fn rt(start: ClusteringBound, end: ClusteringBound, ts: i64) -> RangeTombstone {
    RangeTombstone {
        start,
        end,
        tombstone: Tombstone { timestamp: ts, deletion_time: 100 },
    }
}

fn collect_rts(events: &[PartitionEvent]) -> Vec<&RangeTombstone> {
    events
        .iter()
        .filter_map(|e| match e {
            PartitionEvent::RangeTombstone(rt) => Some(rt),
            _ => None,
        })
        .collect()
}

/// # Scenario
/// Two range tombstones sharing the endpoint 2: `(-inf, 2]` with an older
/// tombstone and `[2, +inf)` with a newer one.
///
/// # Expected behavior
/// The reader yields two range tombstones: one closing at 2 carrying the
/// old tombstone, one opening at 2 carrying the new one.
#[test]
fn shared_endpoint_becomes_boundary() {
    init_tracing();
    let tmp = TempDir::new().unwrap();

    let t1 = 100;
    let t2 = 200;
    let events = vec![
        PartitionEvent::PartitionStart { key: pk(1), tombstone: Tombstone::NONE },
        PartitionEvent::RangeTombstone(rt(
            ClusteringBound::incl_start(ClusteringPrefix::empty()),
            ClusteringBound::incl_end(ck(2)),
            t1,
        )),
        PartitionEvent::RangeTombstone(rt(
            ClusteringBound::incl_start(ck(2)),
            ClusteringBound::incl_end(ClusteringPrefix::empty()),
            t2,
        )),
        PartitionEvent::PartitionEnd,
    ];

    let sstable = write_and_open(tmp.path(), Version::Mc, 1, WriterConfig::default(), events);
    let got = read_all(&sstable);
    let rts = collect_rts(&got);

    assert_eq!(rts.len(), 2, "events: {got:?}");
    // first closes at 2 with the old tombstone
    assert_eq!(rts[0].tombstone.timestamp, t1);
    assert_eq!(rts[0].end.prefix, ck(2));
    // second opens at 2 with the new one
    assert_eq!(rts[1].tombstone.timestamp, t2);
    assert_eq!(rts[1].start.prefix, ck(2));
}

/// Adjacent ranges with the same tombstone merge into one marker pair.
#[test]
fn equal_tombstones_coalesce_across_boundary() {
    init_tracing();
    let tmp = TempDir::new().unwrap();

    let events = vec![
        PartitionEvent::PartitionStart { key: pk(1), tombstone: Tombstone::NONE },
        PartitionEvent::RangeTombstone(RangeTombstone {
            start: ClusteringBound::incl_start(ck(1)),
            end: ClusteringBound::excl_end(ck(5)),
            tombstone: Tombstone { timestamp: 42, deletion_time: 9 },
        }),
        PartitionEvent::RangeTombstone(RangeTombstone {
            start: ClusteringBound::incl_start(ck(5)),
            end: ClusteringBound::incl_end(ck(9)),
            tombstone: Tombstone { timestamp: 42, deletion_time: 9 },
        }),
        PartitionEvent::PartitionEnd,
    ];

    let sstable = write_and_open(tmp.path(), Version::Mc, 1, WriterConfig::default(), events);
    let got = read_all(&sstable);
    let rts = collect_rts(&got);
    assert_eq!(rts.len(), 1);
    assert_eq!(rts[0].start.prefix, ck(1));
    assert_eq!(rts[0].end.prefix, ck(9));
}

/// # Scenario
/// A range over a whole prefix, a row inside it with a newer timestamp,
/// then a newer range covering the tail of the prefix.
///
/// # Expected behavior
/// On disk: one open marker, one boundary at the row's clustering carrying
/// both tombstones, one close. The reader reconstructs two ranges.
#[test]
fn converging_overlap_emits_boundary_at_row() {
    init_tracing();
    let tmp = TempDir::new().unwrap();

    // two-component clustering for this scenario
    let schema = Schema::new(
        "ks",
        "tbl",
        ColumnType::Int32,
        vec![ColumnType::Text, ColumnType::Text],
        vec![],
        vec![ColumnDef::atomic(b"val", ColumnType::Int32)],
    );
    let prefix_a = ClusteringPrefix::from(vec![b"aaa".to_vec()]);
    let row_ck = ClusteringPrefix::from(vec![b"aaa".to_vec(), b"bbb".to_vec()]);

    let t1 = 100;
    let t2 = 200;
    let t3 = 300;
    let events = vec![
        PartitionEvent::PartitionStart { key: pk(1), tombstone: Tombstone::NONE },
        PartitionEvent::RangeTombstone(rt(
            ClusteringBound::incl_start(prefix_a.clone()),
            ClusteringBound::incl_end(prefix_a.clone()),
            t1,
        )),
        PartitionEvent::Row(ClusteringRow {
            clustering: row_ck.clone(),
            marker: Some(LivenessInfo { timestamp: t3, ttl: None, local_deletion_time: None }),
            deletion: None,
            cells: [(b"val".to_vec(), int_cell(t3, 7))].into_iter().collect(),
        }),
        PartitionEvent::RangeTombstone(rt(
            ClusteringBound::excl_start(row_ck.clone()),
            ClusteringBound::incl_end(prefix_a.clone()),
            t2,
        )),
        PartitionEvent::PartitionEnd,
    ];

    let desc = super::helpers::descriptor(tmp.path(), Version::Mc, 1);
    let partitioner: std::sync::Arc<dyn Partitioner> =
        std::sync::Arc::new(ByteOrderedPartitioner);
    let writer = crate::writer::SstableWriter::create(
        desc.clone(),
        schema.clone(),
        partitioner.clone(),
        4,
        WriterConfig::default(),
    )
    .unwrap();
    writer.write_stream(events).unwrap();

    let sstable = crate::sstable::Sstable::open(desc, schema, partitioner).unwrap();
    let got = sstable.read_rows(crate::reader::ReadDeadline::none()).unwrap();
    let rts = collect_rts(&got);

    assert_eq!(rts.len(), 2, "events: {got:?}");
    assert_eq!(rts[0].tombstone.timestamp, t1);
    assert_eq!(rts[0].start.prefix, prefix_a);
    assert_eq!(rts[0].end.prefix, row_ck);
    assert_eq!(rts[1].tombstone.timestamp, t2);
    assert_eq!(rts[1].start.prefix, row_ck);
    assert_eq!(rts[1].end.prefix, prefix_a);
    // the row sits between the two ranges
    let row_idx = got
        .iter()
        .position(|e| matches!(e, PartitionEvent::Row(_)))
        .unwrap();
    let first_rt_idx = got
        .iter()
        .position(|e| matches!(e, PartitionEvent::RangeTombstone(r) if r.tombstone.timestamp == t1))
        .unwrap();
    assert!(first_rt_idx < row_idx || row_idx < first_rt_idx + 2);
}

/// A range tombstone with no rows still round-trips in a legacy layout.
#[test]
fn legacy_range_tombstone_roundtrip() {
    init_tracing();
    let tmp = TempDir::new().unwrap();

    let events = vec![
        PartitionEvent::PartitionStart { key: pk(3), tombstone: Tombstone::NONE },
        PartitionEvent::RangeTombstone(rt(
            ClusteringBound::incl_start(ck(1)),
            ClusteringBound::incl_end(ck(4)),
            55,
        )),
        PartitionEvent::PartitionEnd,
    ];

    let sstable = write_and_open(
        tmp.path(),
        Version::La,
        1,
        WriterConfig::default(),
        events.clone(),
    );
    let got = read_all(&sstable);
    let rts = collect_rts(&got);
    assert_eq!(rts.len(), 1);
    assert_eq!(rts[0].start.prefix, ck(1));
    assert_eq!(rts[0].end.prefix, ck(4));
    assert_eq!(rts[0].tombstone.timestamp, 55);
}
