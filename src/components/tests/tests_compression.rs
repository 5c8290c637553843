//! Compression info round-trip, chunked writer/reader, and checksum
//! enforcement.

use std::io::{Cursor, Read, Seek, SeekFrom, Write};

use crate::components::checksum::*;
use crate::components::compression::*;
use crate::components::Version;
use crate::error::SstableError;

fn payload(len: usize) -> Vec<u8> {
    // compressible but not trivial
    (0..len).map(|i| ((i / 7) % 251) as u8).collect()
}

#[test]
fn compression_info_roundtrip() {
    let info = CompressionInfo {
        compressor: Compressor::Lz4,
        options: [(b"level".to_vec(), b"1".to_vec())].into_iter().collect(),
        chunk_length: 4096,
        data_length: 123_456,
        offsets: vec![0, 1000, 2100, 3000],
    };
    let mut bytes = Vec::new();
    info.save(&mut bytes).unwrap();
    let loaded = CompressionInfo::load(&mut Cursor::new(bytes)).unwrap();
    assert_eq!(loaded, info);
}

#[test]
fn unknown_compressor_is_out_of_range() {
    let mut bytes = Vec::new();
    let info = CompressionInfo {
        compressor: Compressor::Snappy,
        options: Default::default(),
        chunk_length: 4096,
        data_length: 0,
        offsets: vec![],
    };
    info.save(&mut bytes).unwrap();
    // corrupt the name: "snappy" -> "snappx"
    let idx = bytes.windows(6).position(|w| w == b"snappy").unwrap();
    bytes[idx + 5] = b'x';
    let err = CompressionInfo::load(&mut Cursor::new(bytes)).unwrap_err();
    assert!(matches!(err, SstableError::OutOfRange(_)));
}

#[test]
fn chunked_roundtrip_all_compressors() {
    let data = payload(50_000);
    for compressor in [Compressor::Lz4, Compressor::Snappy, Compressor::Deflate] {
        let mut w = CompressedWriter::new(Vec::new(), compressor, 4096);
        w.write_all(&data).unwrap();
        assert_eq!(w.offset(), data.len() as u64);
        let (file, info, _digest, _) = w.finish().unwrap();
        assert_eq!(info.data_length, data.len() as u64);
        assert_eq!(info.chunk_count(), data.len().div_ceil(4096));

        let mut r = CompressedReader::new(Cursor::new(file), info).unwrap();
        let mut out = Vec::new();
        r.read_to_end(&mut out).unwrap();
        assert_eq!(out, data, "compressor {compressor:?}");
    }
}

#[test]
fn compressed_reader_seeks_in_uncompressed_space() {
    let data = payload(20_000);
    let mut w = CompressedWriter::new(Vec::new(), Compressor::Lz4, 4096);
    w.write_all(&data).unwrap();
    let (file, info, _, _) = w.finish().unwrap();

    let mut r = CompressedReader::new(Cursor::new(file), info).unwrap();
    r.seek(SeekFrom::Start(9500)).unwrap();
    let mut buf = [0u8; 100];
    r.read_exact(&mut buf).unwrap();
    assert_eq!(&buf[..], &data[9500..9600]);
}

#[test]
fn corrupt_compressed_chunk_is_integrity_failure() {
    let data = payload(10_000);
    let mut w = CompressedWriter::new(Vec::new(), Compressor::Lz4, 4096);
    w.write_all(&data).unwrap();
    let (mut file, info, _, _) = w.finish().unwrap();
    // flip a byte inside the second chunk's compressed body
    let target = info.offsets[1] as usize + 10;
    file[target] ^= 0xFF;

    let mut r = CompressedReader::new(Cursor::new(file), info).unwrap();
    r.seek(SeekFrom::Start(5000)).unwrap();
    let mut buf = [0u8; 16];
    let io_err = r.read_exact(&mut buf).unwrap_err();
    let err = into_sstable_error(io_err);
    assert!(matches!(err, SstableError::IntegrityFailure { chunk: 1, .. }));
}

#[test]
fn checksummed_writer_builds_chunk_table() {
    let data = payload(10_000);
    let mut w = ChecksummedWriter::new(Vec::new(), ChecksumType::Crc32, 4096);
    w.write_all(&data).unwrap();
    assert_eq!(w.offset(), 10_000);
    let (file, crc, digest) = w.finish();
    assert_eq!(file, data);
    assert_eq!(crc.chunk_length, 4096);
    assert_eq!(crc.checksums.len(), 3);
    assert_eq!(digest.0, checksum_of(ChecksumType::Crc32, &data));
    // each chunk checksum is over that chunk alone
    assert_eq!(crc.checksums[0], checksum_of(ChecksumType::Crc32, &data[..4096]));
    assert_eq!(crc.checksums[2], checksum_of(ChecksumType::Crc32, &data[8192..]));
}

#[test]
fn checksummed_reader_detects_corruption() {
    let data = payload(9_000);
    let mut w = ChecksummedWriter::new(Vec::new(), ChecksumType::Adler32, 4096);
    w.write_all(&data).unwrap();
    let (mut file, crc, _) = w.finish();
    file[5000] ^= 1;

    let mut r = ChecksummedReader::new(Cursor::new(file), ChecksumType::Adler32, crc).unwrap();
    r.seek(SeekFrom::Start(4096)).unwrap();
    let mut buf = [0u8; 8];
    let io_err = r.read_exact(&mut buf).unwrap_err();
    let err = into_sstable_error(io_err);
    assert!(matches!(err, SstableError::IntegrityFailure { chunk: 1, .. }));
}

#[test]
fn checksum_type_tracks_version() {
    assert_eq!(ChecksumType::for_version(Version::Mc), ChecksumType::Crc32);
    assert_eq!(ChecksumType::for_version(Version::La), ChecksumType::Adler32);
    assert_eq!(ChecksumType::for_version(Version::Ka), ChecksumType::Adler32);
}

#[test]
fn digest_roundtrips_as_ascii_decimal() {
    let digest = Digest(0xDEADBEEF);
    let mut bytes = Vec::new();
    digest.save(&mut bytes).unwrap();
    assert_eq!(bytes, 0xDEADBEEFu32.to_string().as_bytes());
    let loaded = Digest::load(&mut Cursor::new(bytes)).unwrap();
    assert_eq!(loaded, digest);
}
