//! Range-tombstone accumulator merge tests.

use std::sync::Arc;

use crate::model::*;

fn schema() -> Arc<Schema> {
    Schema::new(
        "ks",
        "tbl",
        ColumnType::Blob,
        vec![ColumnType::Text],
        vec![],
        vec![ColumnDef::atomic(b"v", ColumnType::Int32)],
    )
}

fn ck(s: &str) -> ClusteringPrefix {
    ClusteringPrefix::from(vec![s.as_bytes().to_vec()])
}

fn rt(start: &str, end: &str, ts: i64) -> RangeTombstone {
    RangeTombstone {
        start: ClusteringBound::incl_start(ck(start)),
        end: ClusteringBound::incl_end(ck(end)),
        tombstone: Tombstone { timestamp: ts, deletion_time: 1000 },
    }
}

#[test]
fn disjoint_ranges_pass_through_sorted() {
    let mut acc = RangeTombstoneAccumulator::new(schema());
    acc.apply(rt("m", "p", 1));
    acc.apply(rt("a", "c", 2));
    let out = acc.drain_all();
    assert_eq!(out.len(), 2);
    assert_eq!(out[0].start.prefix, ck("a"));
    assert_eq!(out[1].start.prefix, ck("m"));
}

#[test]
fn newer_tombstone_wins_in_overlap() {
    let mut acc = RangeTombstoneAccumulator::new(schema());
    acc.apply(rt("a", "m", 1));
    acc.apply(rt("f", "z", 5));
    let out = acc.drain_all();
    // [a, f) @1, [f, z] @5
    assert_eq!(out.len(), 2);
    assert_eq!(out[0].tombstone.timestamp, 1);
    assert_eq!(out[0].start.prefix, ck("a"));
    assert_eq!(out[1].tombstone.timestamp, 5);
    assert_eq!(out[1].end.prefix, ck("z"));
}

#[test]
fn older_insert_splits_around_newer() {
    let mut acc = RangeTombstoneAccumulator::new(schema());
    acc.apply(rt("f", "h", 9));
    acc.apply(rt("a", "z", 1));
    let out = acc.drain_all();
    assert_eq!(out.len(), 3);
    assert_eq!(out[0].tombstone.timestamp, 1);
    assert_eq!(out[1].tombstone.timestamp, 9);
    assert_eq!(out[2].tombstone.timestamp, 1);
    assert_eq!(out[1].start.prefix, ck("f"));
    assert_eq!(out[1].end.prefix, ck("h"));
}

#[test]
fn identical_tombstones_coalesce() {
    let mut acc = RangeTombstoneAccumulator::new(schema());
    let t = Tombstone { timestamp: 3, deletion_time: 50 };
    acc.apply(RangeTombstone {
        start: ClusteringBound::incl_start(ck("a")),
        end: ClusteringBound::excl_end(ck("m")),
        tombstone: t,
    });
    acc.apply(RangeTombstone {
        start: ClusteringBound::incl_start(ck("m")),
        end: ClusteringBound::incl_end(ck("z")),
        tombstone: t,
    });
    let out = acc.drain_all();
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].start.prefix, ck("a"));
    assert_eq!(out[0].end.prefix, ck("z"));
}

#[test]
fn drain_up_to_stops_at_position() {
    let s = schema();
    let mut acc = RangeTombstoneAccumulator::new(s);
    acc.apply(rt("a", "c", 1));
    acc.apply(rt("m", "p", 2));
    let drained = acc.drain_up_to(&Position::at(ck("g")));
    assert_eq!(drained.len(), 1);
    assert_eq!(drained[0].start.prefix, ck("a"));
    assert!(!acc.is_empty());
    let rest = acc.drain_all();
    assert_eq!(rest[0].start.prefix, ck("m"));
}
