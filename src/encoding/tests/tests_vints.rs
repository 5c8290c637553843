//! Tests for the variable-length integer codec.

use std::io::Cursor;

use crate::encoding::*;

fn roundtrip(v: u64) -> Vec<u8> {
    let mut buf = Vec::new();
    write_vint(&mut buf, v).unwrap();
    assert_eq!(buf.len(), vint_size(v), "size hint mismatch for {v}");
    let got = read_vint(&mut Cursor::new(&buf)).unwrap();
    assert_eq!(got, v);
    buf
}

#[test]
fn single_byte_values() {
    assert_eq!(roundtrip(0), [0x00]);
    assert_eq!(roundtrip(1), [0x01]);
    assert_eq!(roundtrip(127), [0x7F]);
}

#[test]
fn two_byte_boundary() {
    // 128 needs one extra byte: leading byte 10xxxxxx
    assert_eq!(roundtrip(128), [0x80, 0x80]);
    assert_eq!(roundtrip(0x3FFF), [0xBF, 0xFF]);
}

#[test]
fn encoded_length_grows_with_magnitude() {
    assert_eq!(vint_size(0x3FFF), 2);
    assert_eq!(vint_size(0x4000), 3);
    assert_eq!(vint_size(u32::MAX as u64), 5);
    assert_eq!(vint_size(u64::MAX), 9);
}

#[test]
fn max_value_takes_nine_bytes() {
    let buf = roundtrip(u64::MAX);
    assert_eq!(buf.len(), 9);
    assert_eq!(buf[0], 0xFF);
}

#[test]
fn every_width_boundary_roundtrips() {
    for bits in 1..=63 {
        let v = 1u64 << bits;
        roundtrip(v - 1);
        roundtrip(v);
    }
    roundtrip(u64::MAX);
}

#[test]
fn signed_vints_zigzag() {
    for v in [0i64, -1, 1, -2, 2, i64::MIN, i64::MAX, -123_456_789] {
        let mut buf = Vec::new();
        write_signed_vint(&mut buf, v).unwrap();
        assert_eq!(buf.len(), signed_vint_size(v));
        let got = read_signed_vint(&mut Cursor::new(buf)).unwrap();
        assert_eq!(got, v);
    }
}

#[test]
fn small_negatives_stay_small() {
    // zig-zag keeps near-zero values short in both directions
    assert_eq!(signed_vint_size(-1), 1);
    assert_eq!(signed_vint_size(-64), 1);
    assert_eq!(signed_vint_size(-65), 2);
}

#[test]
fn truncated_vint_is_short_read() {
    // leading byte declares 2 extra bytes, only 1 present
    let err = read_vint(&mut Cursor::new(vec![0xC1, 0x00])).unwrap_err();
    assert!(matches!(err, EncodingError::ShortRead { .. }));
}

#[test]
fn vint_prefixed_strings() {
    let mut buf = Vec::new();
    write_string_vint(&mut buf, b"clustering").unwrap();
    assert_eq!(buf[0], 10);
    let got = read_string_vint(&mut Cursor::new(buf)).unwrap();
    assert_eq!(got, b"clustering");
}
