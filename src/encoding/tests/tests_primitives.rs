//! Tests for fixed-width integers, bools, doubles and byte strings.

use std::io::Cursor;

use crate::encoding::*;

#[test]
fn fixed_ints_are_big_endian() {
    let mut buf = Vec::new();
    write_int::<u32, _>(&mut buf, 0x0102_0304).unwrap();
    assert_eq!(buf, [0x01, 0x02, 0x03, 0x04]);

    let mut buf = Vec::new();
    write_int::<u16, _>(&mut buf, 0xBEEF).unwrap();
    assert_eq!(buf, [0xBE, 0xEF]);

    let mut buf = Vec::new();
    write_int::<i64, _>(&mut buf, -2).unwrap();
    assert_eq!(buf, [0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFE]);
}

#[test]
fn fixed_int_roundtrip_all_widths() {
    let mut buf = Vec::new();
    write_int::<u8, _>(&mut buf, 0xAB).unwrap();
    write_int::<u16, _>(&mut buf, 0xABCD).unwrap();
    write_int::<u32, _>(&mut buf, 0xDEAD_BEEF).unwrap();
    write_int::<u64, _>(&mut buf, u64::MAX - 1).unwrap();
    write_int::<i32, _>(&mut buf, i32::MIN).unwrap();
    write_int::<i64, _>(&mut buf, i64::MIN).unwrap();

    let mut r = Cursor::new(buf);
    assert_eq!(read_int::<u8, _>(&mut r).unwrap(), 0xAB);
    assert_eq!(read_int::<u16, _>(&mut r).unwrap(), 0xABCD);
    assert_eq!(read_int::<u32, _>(&mut r).unwrap(), 0xDEAD_BEEF);
    assert_eq!(read_int::<u64, _>(&mut r).unwrap(), u64::MAX - 1);
    assert_eq!(read_int::<i32, _>(&mut r).unwrap(), i32::MIN);
    assert_eq!(read_int::<i64, _>(&mut r).unwrap(), i64::MIN);
}

#[test]
fn short_read_is_reported() {
    let mut r = Cursor::new(vec![0x01, 0x02]);
    let err = read_int::<u32, _>(&mut r).unwrap_err();
    assert!(matches!(err, EncodingError::ShortRead { .. }));
}

#[test]
fn bool_accepts_only_zero_and_one() {
    let mut r = Cursor::new(vec![0, 1, 2]);
    assert!(!read_bool(&mut r).unwrap());
    assert!(read_bool(&mut r).unwrap());
    let err = read_bool(&mut r).unwrap_err();
    assert!(matches!(err, EncodingError::InvalidBool(2)));
}

#[test]
fn double_roundtrips_bit_exactly() {
    for v in [0.0_f64, -0.0, 1.5, f64::MIN_POSITIVE, f64::MAX, f64::NEG_INFINITY] {
        let mut buf = Vec::new();
        write_double(&mut buf, v).unwrap();
        assert_eq!(buf.len(), 8);
        let got = read_double(&mut Cursor::new(buf)).unwrap();
        assert_eq!(got.to_bits(), v.to_bits());
    }
}

#[test]
fn string_u16_prefix_roundtrip() {
    let mut buf = Vec::new();
    write_string::<u16, _>(&mut buf, b"partition key").unwrap();
    assert_eq!(&buf[..2], &[0, 13]);
    let got = read_string::<u16, _>(&mut Cursor::new(buf)).unwrap();
    assert_eq!(got, b"partition key");
}

#[test]
fn empty_string_is_permitted() {
    let mut buf = Vec::new();
    write_string::<u16, _>(&mut buf, b"").unwrap();
    assert_eq!(buf, [0, 0]);
    let got = read_string::<u16, _>(&mut Cursor::new(buf)).unwrap();
    assert!(got.is_empty());
}

#[test]
fn string_length_overflow_rejected_on_write() {
    let long = vec![0u8; u16::MAX as usize + 1];
    let mut buf = Vec::new();
    let err = write_string::<u16, _>(&mut buf, &long).unwrap_err();
    assert!(matches!(err, EncodingError::Overflow { .. }));
}

#[test]
fn string_body_shorter_than_declared_is_short_read() {
    // declares 10 bytes, provides 3
    let bytes = vec![0x00, 0x0A, b'a', b'b', b'c'];
    let err = read_string::<u16, _>(&mut Cursor::new(bytes)).unwrap_err();
    assert!(matches!(err, EncodingError::ShortRead { .. }));
}
