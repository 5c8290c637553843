//! Tests for arrays, maps and tagged-union sets.

use std::collections::BTreeMap;
use std::io::Cursor;

use crate::encoding::*;

#[test]
fn int_array_roundtrip() {
    let items: Vec<u32> = (0..1000).map(|i| i * 7).collect();
    let mut buf = Vec::new();
    write_array::<u32, u32, _>(&mut buf, &items).unwrap();
    let got = read_array::<u32, u32, _>(&mut Cursor::new(buf)).unwrap();
    assert_eq!(got, items);
}

#[test]
fn large_array_crosses_chunk_boundary() {
    // more elements than one transcoding batch holds
    let n = ARRAY_CHUNK_BYTES / 8 + 17;
    let items: Vec<u64> = (0..n as u64).collect();
    let mut buf = Vec::new();
    write_array::<u32, u64, _>(&mut buf, &items).unwrap();
    let got = read_array::<u32, u64, _>(&mut Cursor::new(buf)).unwrap();
    assert_eq!(got, items);
}

#[test]
fn hostile_array_length_does_not_allocate() {
    // length claims u32::MAX elements but the stream is empty
    let mut buf = Vec::new();
    write_int::<u32, _>(&mut buf, u32::MAX).unwrap();
    let err = read_array::<u32, u64, _>(&mut Cursor::new(buf)).unwrap_err();
    assert!(matches!(err, EncodingError::ShortRead { .. }));
}

#[test]
fn map_roundtrip_preserves_entries() {
    let mut map = BTreeMap::new();
    map.insert(b"sstable_compression".to_vec(), b"lz4".to_vec());
    map.insert(b"chunk_length_in_kb".to_vec(), b"64".to_vec());
    let mut buf = Vec::new();
    write_map::<u32, _>(&mut buf, &map).unwrap();
    let got = read_map::<u32, _>(&mut Cursor::new(buf)).unwrap();
    assert_eq!(got, map);
}

#[test]
fn tagged_union_roundtrip() {
    let entries = vec![
        TaggedEntry { tag: 1, payload: vec![1, 2, 3] },
        TaggedEntry { tag: 7, payload: vec![] },
    ];
    let mut buf = Vec::new();
    write_tagged_union(&mut buf, &entries).unwrap();
    let got = read_tagged_union(&mut Cursor::new(buf)).unwrap();
    assert_eq!(got, entries);
}

#[test]
fn unknown_tag_is_skipped_exactly() {
    // an entry with an unknown tag must not disturb the entry after it
    let entries = vec![
        TaggedEntry { tag: 9999, payload: vec![0xAA; 37] },
        TaggedEntry { tag: 2, payload: vec![0x01] },
    ];
    let mut buf = Vec::new();
    write_tagged_union(&mut buf, &entries).unwrap();
    let got = read_tagged_union(&mut Cursor::new(buf)).unwrap();
    assert_eq!(got.len(), 2);
    assert_eq!(got[1].tag, 2);
    assert_eq!(got[1].payload, vec![0x01]);
}

#[test]
fn counted_writer_tracks_offset() {
    let mut w = CountedWrite::new(Vec::new());
    write_vint(&mut w, 300).unwrap();
    write_int::<u64, _>(&mut w, 42).unwrap();
    assert_eq!(w.offset(), 2 + 8);
    assert_eq!(w.into_inner().len(), 10);
}
