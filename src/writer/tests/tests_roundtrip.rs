//! Write-then-read round trips.

use std::fs;

use tempfile::TempDir;

use super::helpers::*;
use crate::components::{ComponentType, Version};
use crate::components::compression::Compressor;
use crate::model::*;
use crate::writer::WriterConfig;

/// # Scenario
/// Write one partition with a compound static row and a single clustering
/// row, then read everything back.
///
/// # Expected behavior
/// Exactly: partition start (pk = 5, live), one static row with three
/// columns, one clustering row (ck = 15, val = 1005), partition end.
#[test]
fn single_partition_with_static_row() {
    init_tracing();
    let tmp = TempDir::new().unwrap();

    let static_row = StaticRow {
        cells: [
            (b"s_int".to_vec(), int_cell(50, 105)),
            (b"s_text".to_vec(), bytes_cell(50, b"Text for 5")),
            (b"s_inet".to_vec(), bytes_cell(50, &[10, 0, 0, 5])),
        ]
        .into_iter()
        .collect(),
    };
    let events = vec![
        PartitionEvent::PartitionStart { key: pk(5), tombstone: Tombstone::NONE },
        PartitionEvent::Static(static_row.clone()),
        PartitionEvent::Row(row(15, 60, 1005)),
        PartitionEvent::PartitionEnd,
    ];

    let sstable = write_and_open(tmp.path(), Version::Mc, 1, WriterConfig::default(), events);
    let got = read_all(&sstable);

    assert_eq!(got.len(), 4);
    match &got[0] {
        PartitionEvent::PartitionStart { key, tombstone } => {
            assert_eq!(key, &pk(5));
            assert!(tombstone.is_live());
        }
        other => panic!("expected partition start, got {other:?}"),
    }
    match &got[1] {
        PartitionEvent::Static(s) => {
            assert_eq!(s.cells.len(), 3);
            assert_eq!(s, &static_row);
        }
        other => panic!("expected static row, got {other:?}"),
    }
    match &got[2] {
        PartitionEvent::Row(r) => {
            assert_eq!(r.clustering, ck(15));
            assert_eq!(r.cells.get(b"val".as_slice()), Some(&int_cell(60, 1005)));
        }
        other => panic!("expected clustering row, got {other:?}"),
    }
    assert_eq!(got[3], PartitionEvent::PartitionEnd);
}

/// Partitions come back in `(token, key)` order, byte-identically.
#[test]
fn multi_partition_roundtrip_preserves_order() {
    init_tracing();
    let tmp = TempDir::new().unwrap();

    let mut events = Vec::new();
    for p in [1, 2, 7, 9, 12] {
        events.push(PartitionEvent::PartitionStart { key: pk(p), tombstone: Tombstone::NONE });
        for c in 0..5 {
            events.push(PartitionEvent::Row(row(c, 100 + c as i64, p * 100 + c)));
        }
        events.push(PartitionEvent::PartitionEnd);
    }

    let sstable = write_and_open(
        tmp.path(),
        Version::Mc,
        1,
        WriterConfig::default(),
        events.clone(),
    );
    let got = read_all(&sstable);

    let keys: Vec<_> = got
        .iter()
        .filter_map(|e| match e {
            PartitionEvent::PartitionStart { key, .. } => Some(key.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(keys.len(), 5);
    for pair in keys.windows(2) {
        assert!(pair[0] < pair[1], "partitions out of order");
    }
    // static columns exist in the schema, so a synthetic empty static row
    // is interleaved; drop those before comparing
    let got_filtered: Vec<_> = got
        .into_iter()
        .filter(|e| !matches!(e, PartitionEvent::Static(s) if s.cells.is_empty()))
        .collect();
    assert_eq!(got_filtered, events);
}

/// Partition tombstones and row deletions survive the trip.
#[test]
fn deletions_roundtrip() {
    init_tracing();
    let tmp = TempDir::new().unwrap();

    let partition_tomb = Tombstone { timestamp: 500, deletion_time: 1000 };
    let row_with_deletion = ClusteringRow {
        clustering: ck(3),
        marker: None,
        deletion: Some(RowDeletion {
            tombstone: Tombstone { timestamp: 600, deletion_time: 1001 },
            shadowable: false,
        }),
        cells: RowCells::new(),
    };
    let events = vec![
        PartitionEvent::PartitionStart { key: pk(1), tombstone: partition_tomb },
        PartitionEvent::Row(row_with_deletion.clone()),
        PartitionEvent::PartitionEnd,
    ];

    let sstable = write_and_open(tmp.path(), Version::Mc, 1, WriterConfig::default(), events);
    let got = read_all(&sstable);
    match &got[0] {
        PartitionEvent::PartitionStart { tombstone, .. } => {
            assert_eq!(*tombstone, partition_tomb);
        }
        other => panic!("unexpected {other:?}"),
    }
    assert!(got.iter().any(|e| matches!(
        e,
        PartitionEvent::Row(r) if r.deletion == row_with_deletion.deletion
    )));
}

/// # Scenario
/// The same mutation stream written with every compressor and with none.
///
/// # Expected behavior
/// - Identical readback events in every case.
/// - The CRC component exists only in the uncompressed case.
/// - A digest is present in every case.
#[test]
fn compression_roundtrip_all_compressors() {
    init_tracing();
    let tmp = TempDir::new().unwrap();

    let mut events = Vec::new();
    for p in 0..8 {
        events.push(PartitionEvent::PartitionStart { key: pk(p), tombstone: Tombstone::NONE });
        for c in 0..64 {
            events.push(PartitionEvent::Row(row(c, 10 + c as i64, p * 1000 + c)));
        }
        events.push(PartitionEvent::PartitionEnd);
    }

    let mut baseline = None;
    for (generation, compressor) in [
        (1, None),
        (2, Some(Compressor::Lz4)),
        (3, Some(Compressor::Snappy)),
        (4, Some(Compressor::Deflate)),
    ] {
        let config = WriterConfig { compressor, ..WriterConfig::default() };
        let sstable = write_and_open(tmp.path(), Version::Mc, generation, config, events.clone());

        assert_eq!(
            sstable.toc.contains(&ComponentType::Crc),
            compressor.is_none(),
            "CRC presence for {compressor:?}"
        );
        assert_eq!(
            sstable.toc.contains(&ComponentType::CompressionInfo),
            compressor.is_some()
        );
        assert!(sstable.digest.is_some());

        let got = read_all(&sstable);
        match &baseline {
            None => baseline = Some(got),
            Some(expected) => assert_eq!(&got, expected, "readback for {compressor:?}"),
        }
    }
}

/// Byte-for-byte stability: the same stream and parameters twice produce
/// byte-identical files.
#[test]
fn deterministic_streams_emit_identical_bytes() {
    init_tracing();
    let tmp_a = TempDir::new().unwrap();
    let tmp_b = TempDir::new().unwrap();

    let mut events = Vec::new();
    for p in 0..16 {
        events.push(PartitionEvent::PartitionStart { key: pk(p), tombstone: Tombstone::NONE });
        for c in 0..32 {
            events.push(PartitionEvent::Row(row(c, 77, p * 10 + c)));
        }
        events.push(PartitionEvent::PartitionEnd);
    }

    let a = write_and_open(
        tmp_a.path(),
        Version::Mc,
        9,
        WriterConfig::default(),
        events.clone(),
    );
    let b = write_and_open(tmp_b.path(), Version::Mc, 9, WriterConfig::default(), events);

    for component in [
        ComponentType::Data,
        ComponentType::Index,
        ComponentType::Summary,
        ComponentType::Filter,
        ComponentType::Statistics,
        ComponentType::Crc,
        ComponentType::Digest,
        ComponentType::Toc,
        ComponentType::Scylla,
    ] {
        let bytes_a = fs::read(a.desc.path(&component)).unwrap();
        let bytes_b = fs::read(b.desc.path(&component)).unwrap();
        assert_eq!(bytes_a, bytes_b, "component {component:?} differs");
    }
}

/// Legacy layout round trip through the same public pipeline.
#[test]
fn legacy_roundtrip() {
    init_tracing();
    let tmp = TempDir::new().unwrap();

    let events = vec![
        PartitionEvent::PartitionStart { key: pk(4), tombstone: Tombstone::NONE },
        PartitionEvent::Row(row(1, 10, 100)),
        PartitionEvent::Row(row(2, 11, 200)),
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
    assert_eq!(got, events);
}

/// Expiring cells keep their TTL and expiry through a round trip.
#[test]
fn expiring_cells_roundtrip() {
    init_tracing();
    let tmp = TempDir::new().unwrap();

    let expiring = ClusteringRow {
        clustering: ck(8),
        marker: None,
        deletion: None,
        cells: [(
            b"val".to_vec(),
            ColumnValue::Atomic(Cell::Live {
                timestamp: 900,
                ttl: Some(3600),
                expiry: Some(5000),
                value: 1i32.to_be_bytes().to_vec(),
            }),
        )]
        .into_iter()
        .collect(),
    };
    let events = vec![
        PartitionEvent::PartitionStart { key: pk(2), tombstone: Tombstone::NONE },
        PartitionEvent::Row(expiring.clone()),
        PartitionEvent::PartitionEnd,
    ];

    let sstable = write_and_open(tmp.path(), Version::Mc, 1, WriterConfig::default(), events);
    let got = read_all(&sstable);
    assert!(got.iter().any(|e| matches!(
        e,
        PartitionEvent::Row(r) if r == &expiring
    )));
}
