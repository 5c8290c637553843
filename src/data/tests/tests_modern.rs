//! Row-grouped framing round trips: rows, cells, flags and markers.

use std::io::Cursor;

use crate::components::statistics::{EncodingStats, SerializationHeaderMetadata};
use crate::data::modern::*;
use crate::error::SstableError;
use crate::model::*;

fn schema() -> std::sync::Arc<Schema> {
    Schema::new(
        "ks",
        "tbl",
        ColumnType::Int32,
        vec![ColumnType::Int32],
        vec![
            ColumnDef::atomic(b"s_int", ColumnType::Int32),
            ColumnDef::atomic(b"s_text", ColumnType::Text),
        ],
        vec![
            ColumnDef::atomic(b"val", ColumnType::Int32),
            ColumnDef::collection(b"tags", ColumnType::Text),
        ],
    )
}

fn header() -> SerializationHeaderMetadata {
    SerializationHeaderMetadata::from_schema(
        &schema(),
        EncodingStats {
            min_timestamp: 1_000_000,
            ..EncodingStats::default()
        },
    )
}

fn ck(n: i32) -> ClusteringPrefix {
    ClusteringPrefix::from(vec![n.to_be_bytes().to_vec()])
}

fn atomic_int(ts: i64, v: i32) -> ColumnValue {
    ColumnValue::Atomic(Cell::Live {
        timestamp: ts,
        ttl: None,
        expiry: None,
        value: v.to_be_bytes().to_vec(),
    })
}

#[test]
fn simple_row_roundtrip() {
    let header = header();
    let ser = ModernSerializer::new(&header);
    let parser = ModernParser::new(&header);

    let row = ClusteringRow {
        clustering: ck(15),
        marker: Some(LivenessInfo { timestamp: 1_000_500, ttl: None, local_deletion_time: None }),
        deletion: None,
        cells: [(b"val".to_vec(), atomic_int(1_000_500, 1005))].into_iter().collect(),
    };

    let mut buf = Vec::new();
    let written = ser.write_clustering_row(&mut buf, &row, 0).unwrap();
    assert_eq!(written as usize, buf.len());

    match parser.read_unfiltered(&mut Cursor::new(buf)).unwrap() {
        Unfiltered::Row { is_static, row: got } => {
            assert!(!is_static);
            assert_eq!(got, row);
        }
        other => panic!("expected a row, got {other:?}"),
    }
}

#[test]
fn row_timestamp_is_shared_with_cells() {
    let header = header();
    let ser = ModernSerializer::new(&header);

    // cell timestamp equals the row timestamp: the cell must not repeat it
    let shared = ClusteringRow {
        clustering: ck(1),
        marker: Some(LivenessInfo { timestamp: 7_000, ttl: None, local_deletion_time: None }),
        deletion: None,
        cells: [(b"val".to_vec(), atomic_int(7_000, 1))].into_iter().collect(),
    };
    let distinct = ClusteringRow {
        cells: [(b"val".to_vec(), atomic_int(8_000, 1))].into_iter().collect(),
        ..shared.clone()
    };

    let mut a = Vec::new();
    let mut b = Vec::new();
    ser.write_clustering_row(&mut a, &shared, 0).unwrap();
    ser.write_clustering_row(&mut b, &distinct, 0).unwrap();
    assert!(a.len() < b.len(), "shared timestamp must serialize shorter");

    let parser = ModernParser::new(&header);
    match parser.read_unfiltered(&mut Cursor::new(a)).unwrap() {
        Unfiltered::Row { row, .. } => assert_eq!(row, shared),
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn static_row_roundtrip() {
    let header = header();
    let ser = ModernSerializer::new(&header);
    let parser = ModernParser::new(&header);

    let row = StaticRow {
        cells: [
            (b"s_int".to_vec(), atomic_int(5, 105)),
            (
                b"s_text".to_vec(),
                ColumnValue::Atomic(Cell::Live {
                    timestamp: 5,
                    ttl: None,
                    expiry: None,
                    value: b"Text for 5".to_vec(),
                }),
            ),
        ]
        .into_iter()
        .collect(),
    };

    let mut buf = Vec::new();
    ser.write_static_row(&mut buf, &row).unwrap();
    match parser.read_unfiltered(&mut Cursor::new(buf)).unwrap() {
        Unfiltered::Row { is_static, row: got } => {
            assert!(is_static);
            assert_eq!(got.cells, row.cells);
            assert!(got.clustering.is_empty());
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn missing_column_bitmap_roundtrip() {
    let header = header();
    let ser = ModernSerializer::new(&header);
    let parser = ModernParser::new(&header);

    // only one of two regular columns present
    let row = ClusteringRow {
        clustering: ck(3),
        marker: None,
        deletion: None,
        cells: [(b"val".to_vec(), atomic_int(10, 42))].into_iter().collect(),
    };
    let mut buf = Vec::new();
    ser.write_clustering_row(&mut buf, &row, 0).unwrap();
    // has_all_columns must be clear
    assert_eq!(buf[0] & FLAG_HAS_ALL_COLUMNS, 0);
    match parser.read_unfiltered(&mut Cursor::new(buf)).unwrap() {
        Unfiltered::Row { row: got, .. } => assert_eq!(got, row),
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn expiring_and_tombstone_cells_roundtrip() {
    let header = header();
    let ser = ModernSerializer::new(&header);
    let parser = ModernParser::new(&header);

    let row = ClusteringRow {
        clustering: ck(9),
        marker: None,
        deletion: None,
        cells: [
            (
                b"val".to_vec(),
                ColumnValue::Atomic(Cell::Live {
                    timestamp: 2_000_000,
                    ttl: Some(3600),
                    expiry: Some(1_500_000),
                    value: 7i32.to_be_bytes().to_vec(),
                }),
            ),
            (
                b"tags".to_vec(),
                ColumnValue::Complex(CollectionMutation {
                    tombstone: Some(Tombstone { timestamp: 1_999_000, deletion_time: 111 }),
                    cells: vec![
                        (
                            b"a".to_vec(),
                            Cell::Live {
                                timestamp: 2_000_001,
                                ttl: None,
                                expiry: None,
                                value: b"x".to_vec(),
                            },
                        ),
                        (
                            b"b".to_vec(),
                            Cell::Tombstone { timestamp: 2_000_002, local_deletion_time: 222 },
                        ),
                    ],
                }),
            ),
        ]
        .into_iter()
        .collect(),
    };

    let mut buf = Vec::new();
    ser.write_clustering_row(&mut buf, &row, 0).unwrap();
    assert_ne!(buf[0] & FLAG_HAS_COMPLEX_DELETION, 0);
    match parser.read_unfiltered(&mut Cursor::new(buf)).unwrap() {
        Unfiltered::Row { row: got, .. } => assert_eq!(got, row),
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn row_deletion_and_shadowable_roundtrip() {
    let header = header();
    let ser = ModernSerializer::new(&header);
    let parser = ModernParser::new(&header);

    for shadowable in [false, true] {
        let row = ClusteringRow {
            clustering: ck(4),
            marker: None,
            deletion: Some(RowDeletion {
                tombstone: Tombstone { timestamp: 3_000, deletion_time: 99 },
                shadowable,
            }),
            cells: RowCells::new(),
        };
        let mut buf = Vec::new();
        ser.write_clustering_row(&mut buf, &row, 0).unwrap();
        match parser.read_unfiltered(&mut Cursor::new(buf)).unwrap() {
            Unfiltered::Row { row: got, .. } => assert_eq!(got, row),
            other => panic!("unexpected {other:?}"),
        }
    }
}

#[test]
fn foreign_shadowable_flag_is_rejected() {
    let header = header();
    let parser = ModernParser::new(&header);
    // flags byte with extension, extended byte with the foreign bit
    let bytes = vec![FLAG_EXTENSION, EXT_FLAG_SHADOWABLE_FOREIGN];
    let err = parser.read_unfiltered(&mut Cursor::new(bytes)).unwrap_err();
    assert!(matches!(err, SstableError::MalformedSstable(_)));
}

#[test]
fn marker_roundtrip_bound_and_boundary() {
    let header = header();
    let ser = ModernSerializer::new(&header);
    let parser = ModernParser::new(&header);

    let bound = RtMarker {
        clustering: ck(2),
        kind: BoundKind::InclStart,
        tombstone: Tombstone { timestamp: 500_000, deletion_time: 10 },
        boundary_tombstone: None,
    };
    let boundary = RtMarker {
        clustering: ck(2),
        kind: BoundKind::ExclEndInclStart,
        tombstone: Tombstone { timestamp: 500_000, deletion_time: 10 },
        boundary_tombstone: Some(Tombstone { timestamp: 600_000, deletion_time: 11 }),
    };

    for marker in [bound, boundary] {
        let mut buf = Vec::new();
        ser.write_rt_marker(&mut buf, &marker, 17).unwrap();
        match parser.read_unfiltered(&mut Cursor::new(buf)).unwrap() {
            Unfiltered::Marker(got) => assert_eq!(got, marker),
            other => panic!("unexpected {other:?}"),
        }
    }
}

#[test]
fn boundary_marker_requires_second_tombstone() {
    let header = header();
    let ser = ModernSerializer::new(&header);
    let marker = RtMarker {
        clustering: ck(2),
        kind: BoundKind::InclEndExclStart,
        tombstone: Tombstone { timestamp: 1, deletion_time: 1 },
        boundary_tombstone: None,
    };
    let mut buf = Vec::new();
    let err = ser.write_rt_marker(&mut buf, &marker, 0).unwrap_err();
    assert!(matches!(err, SstableError::MalformedSstable(_)));
}

#[test]
fn partition_header_and_end_roundtrip() {
    let header = header();
    let ser = ModernSerializer::new(&header);
    let parser = ModernParser::new(&header);

    let mut buf = Vec::new();
    let tomb = Tombstone { timestamp: 123, deletion_time: 456 };
    ser.write_partition_header(&mut buf, b"pk5", tomb).unwrap();
    ser.write_end_of_partition(&mut buf).unwrap();

    let mut r = Cursor::new(buf);
    let (key, got) = parser.read_partition_header(&mut r).unwrap();
    assert_eq!(key, b"pk5");
    assert_eq!(got, tomb);
    assert_eq!(parser.read_unfiltered(&mut r).unwrap(), Unfiltered::EndOfPartition);
}

#[test]
fn live_partition_tombstone_survives_roundtrip() {
    let header = header();
    let ser = ModernSerializer::new(&header);
    let parser = ModernParser::new(&header);
    let mut buf = Vec::new();
    ser.write_partition_header(&mut buf, b"k", Tombstone::NONE).unwrap();
    let (_, got) = parser.read_partition_header(&mut Cursor::new(buf)).unwrap();
    assert!(got.is_live());
}
