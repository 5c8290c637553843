//! Block compression for the data file: the CompressionInfo component plus
//! the chunked writer and reader adaptors.
//!
//! The data stream is cut into fixed uncompressed chunks. Each chunk is
//! compressed independently and written as `compressed bytes + u32 crc32`
//! of the compressed bytes; CompressionInfo records where every compressed
//! chunk starts so the reader can seek in uncompressed coordinates. When
//! compression is enabled the CRC component is absent — the per-chunk
//! checksums live here instead.

use std::io::{Read, Seek, SeekFrom, Write};

use crc32fast::Hasher as Crc32;

use crate::components::checksum::Digest;
use crate::error::ChunkMismatch;
use crate::encoding::{read_int, read_map, read_string, write_int, write_map, write_string, FixedInt};
use crate::error::{Result, SstableError};

/// Uncompressed chunk length used when the caller does not configure one.
pub const DEFAULT_CHUNK_LEN: u32 = 65_536;

// ------------------------------------------------------------------------------------------------
// Compressors
// ------------------------------------------------------------------------------------------------

/// The supported block compressors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compressor {
    /// LZ4 block format.
    Lz4,
    /// Snappy raw format.
    Snappy,
    /// Raw deflate.
    Deflate,
}

impl Compressor {
    /// Wire name recorded in CompressionInfo.
    pub fn name(self) -> &'static str {
        match self {
            Compressor::Lz4 => "lz4",
            Compressor::Snappy => "snappy",
            Compressor::Deflate => "deflate",
        }
    }

    /// Reverse of [`Compressor::name`].
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "lz4" => Compressor::Lz4,
            "snappy" => Compressor::Snappy,
            "deflate" => Compressor::Deflate,
            _ => return None,
        })
    }

    /// Compress one chunk.
    pub fn compress(self, data: &[u8]) -> Result<Vec<u8>> {
        match self {
            Compressor::Lz4 => Ok(lz4_flex::block::compress(data)),
            Compressor::Snappy => snap::raw::Encoder::new()
                .compress_vec(data)
                .map_err(|e| SstableError::MalformedSstable(format!("snappy compress: {e}"))),
            Compressor::Deflate => {
                let mut encoder = flate2::write::DeflateEncoder::new(
                    Vec::new(),
                    flate2::Compression::default(),
                );
                encoder.write_all(data).map_err(SstableError::Io)?;
                encoder.finish().map_err(SstableError::Io)
            }
        }
    }

    /// Decompress one chunk whose uncompressed size is known.
    pub fn decompress(self, data: &[u8], uncompressed_len: usize) -> Result<Vec<u8>> {
        let out = match self {
            Compressor::Lz4 => lz4_flex::block::decompress(data, uncompressed_len)
                .map_err(|e| SstableError::MalformedSstable(format!("lz4 decompress: {e}")))?,
            Compressor::Snappy => snap::raw::Decoder::new()
                .decompress_vec(data)
                .map_err(|e| SstableError::MalformedSstable(format!("snappy decompress: {e}")))?,
            Compressor::Deflate => {
                let mut decoder = flate2::read::DeflateDecoder::new(data);
                let mut out = Vec::with_capacity(uncompressed_len);
                decoder.read_to_end(&mut out).map_err(SstableError::Io)?;
                out
            }
        };
        if out.len() != uncompressed_len {
            return Err(SstableError::MalformedSstable(format!(
                "decompressed chunk is {} bytes, expected {uncompressed_len}",
                out.len()
            )));
        }
        Ok(out)
    }
}

// ------------------------------------------------------------------------------------------------
// CompressionInfo component
// ------------------------------------------------------------------------------------------------

/// The CompressionInfo component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompressionInfo {
    /// The compressor every chunk was written with.
    pub compressor: Compressor,
    /// Pass-through compressor options.
    pub options: std::collections::BTreeMap<Vec<u8>, Vec<u8>>,
    /// Uncompressed chunk length.
    pub chunk_length: u32,
    /// Total uncompressed data length.
    pub data_length: u64,
    /// Start offset of each compressed chunk in the data file.
    pub offsets: Vec<u64>,
}

impl CompressionInfo {
    /// Serialize.
    pub fn save<W: Write>(&self, w: &mut W) -> Result<()> {
        write_string::<u16, _>(w, self.compressor.name().as_bytes())?;
        write_map::<u32, _>(w, &self.options)?;
        write_int(w, self.chunk_length)?;
        write_int(w, self.data_length)?;
        write_int(w, u32::from_len(self.offsets.len(), "compression offsets")?)?;
        for offset in &self.offsets {
            write_int(w, *offset)?;
        }
        Ok(())
    }

    /// Parse.
    pub fn load<R: Read>(r: &mut R) -> Result<CompressionInfo> {
        let name_bytes = read_string::<u16, _>(r)?;
        let name = String::from_utf8(name_bytes)
            .map_err(|_| SstableError::MalformedSstable("compressor name not UTF-8".into()))?;
        let compressor = Compressor::from_name(&name).ok_or_else(|| {
            SstableError::OutOfRange(format!("unknown compressor {name:?}"))
        })?;
        let options = read_map::<u32, _>(r)?;
        let chunk_length = read_int::<u32, _>(r)?;
        if chunk_length == 0 {
            return Err(SstableError::MalformedSstable(
                "compression chunk length is zero".into(),
            ));
        }
        let data_length = read_int(r)?;
        let n = read_int::<u32, _>(r)?.as_len().map_err(SstableError::from)?;
        let mut offsets = Vec::with_capacity(n.min(1 << 16));
        for _ in 0..n {
            offsets.push(read_int(r)?);
        }
        Ok(CompressionInfo {
            compressor,
            options,
            chunk_length,
            data_length,
            offsets,
        })
    }

    /// Number of chunks the data stream was cut into.
    pub fn chunk_count(&self) -> usize {
        self.offsets.len()
    }

    /// Uncompressed length of chunk `idx`.
    pub fn uncompressed_chunk_len(&self, idx: usize) -> usize {
        let start = idx as u64 * self.chunk_length as u64;
        self.chunk_length
            .min(self.data_length.saturating_sub(start) as u32) as usize
    }
}

// ------------------------------------------------------------------------------------------------
// Compressed writer
// ------------------------------------------------------------------------------------------------

/// Write adaptor for the compressed data path. Accepts the uncompressed
/// stream, emits compressed chunks with their checksum trailers, and tracks
/// both coordinate systems.
pub struct CompressedWriter<W: Write> {
    inner: W,
    compressor: Compressor,
    chunk_length: u32,
    buffer: Vec<u8>,
    offsets: Vec<u64>,
    /// Uncompressed bytes accepted.
    uncompressed_len: u64,
    /// Compressed bytes emitted (including checksum trailers).
    compressed_len: u64,
    digest: Crc32,
}

impl<W: Write> CompressedWriter<W> {
    /// Wrap `inner`.
    pub fn new(inner: W, compressor: Compressor, chunk_length: u32) -> Self {
        Self {
            inner,
            compressor,
            chunk_length,
            buffer: Vec::with_capacity(chunk_length as usize),
            offsets: Vec::new(),
            uncompressed_len: 0,
            compressed_len: 0,
            digest: Crc32::new(),
        }
    }

    /// Uncompressed bytes accepted so far; this is the offset row positions
    /// are measured in.
    pub fn offset(&self) -> u64 {
        self.uncompressed_len
    }

    /// Compressed file length so far. Summary sampling thresholds compare
    /// against this, mirroring what actually lands on disk.
    pub fn compressed_file_length(&self) -> u64 {
        self.compressed_len
    }

    fn flush_chunk(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let compressed = self.compressor.compress(&self.buffer)?;
        let crc = {
            let mut h = Crc32::new();
            h.update(&compressed);
            h.finalize()
        };
        self.offsets.push(self.compressed_len);
        self.inner.write_all(&compressed).map_err(SstableError::Io)?;
        self.inner
            .write_all(&crc.to_be_bytes())
            .map_err(SstableError::Io)?;
        self.digest.update(&compressed);
        self.digest.update(&crc.to_be_bytes());
        self.compressed_len += compressed.len() as u64 + 4;
        self.buffer.clear();
        Ok(())
    }

    /// Flush the trailing partial chunk and produce the CompressionInfo
    /// component, the full-file digest and the final compressed length.
    pub fn finish(mut self) -> Result<(W, CompressionInfo, Digest, u64)> {
        self.flush_chunk()?;
        let info = CompressionInfo {
            compressor: self.compressor,
            options: Default::default(),
            chunk_length: self.chunk_length,
            data_length: self.uncompressed_len,
            offsets: self.offsets,
        };
        Ok((
            self.inner,
            info,
            Digest(self.digest.finalize()),
            self.compressed_len,
        ))
    }
}

impl<W: Write> Write for CompressedWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut rest = buf;
        while !rest.is_empty() {
            let room = self.chunk_length as usize - self.buffer.len();
            let step = rest.len().min(room);
            self.buffer.extend_from_slice(&rest[..step]);
            self.uncompressed_len += step as u64;
            rest = &rest[step..];
            if self.buffer.len() == self.chunk_length as usize {
                self.flush_chunk().map_err(|e| {
                    std::io::Error::new(std::io::ErrorKind::Other, e.to_string())
                })?;
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

// ------------------------------------------------------------------------------------------------
// Compressed reader
// ------------------------------------------------------------------------------------------------

/// Read adaptor for the compressed data path: `Read + Seek` in uncompressed
/// coordinates over a compressed file, verifying each chunk's checksum
/// before serving any of its bytes.
pub struct CompressedReader<R: Read + Seek> {
    inner: R,
    info: CompressionInfo,
    compressed_len: u64,
    chunk: Vec<u8>,
    chunk_idx: Option<usize>,
    pos: u64,
}

impl<R: Read + Seek> CompressedReader<R> {
    /// Wrap `inner` with its CompressionInfo.
    pub fn new(mut inner: R, info: CompressionInfo) -> Result<Self> {
        let compressed_len = inner.seek(SeekFrom::End(0))?;
        inner.seek(SeekFrom::Start(0))?;
        Ok(Self {
            inner,
            info,
            compressed_len,
            chunk: Vec::new(),
            chunk_idx: None,
            pos: 0,
        })
    }

    /// Total uncompressed length.
    pub fn len(&self) -> u64 {
        self.info.data_length
    }

    /// Whether the stream is empty.
    pub fn is_empty(&self) -> bool {
        self.info.data_length == 0
    }

    fn load_chunk(&mut self, idx: usize) -> std::io::Result<()> {
        if self.chunk_idx == Some(idx) {
            return Ok(());
        }
        let start = *self.info.offsets.get(idx).ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("no compressed chunk {idx}"),
            )
        })?;
        let end = self
            .info
            .offsets
            .get(idx + 1)
            .copied()
            .unwrap_or(self.compressed_len);
        let span = end.checked_sub(start).filter(|s| *s >= 4).ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("compressed chunk {idx} has impossible span"),
            )
        })? as usize;

        self.inner.seek(SeekFrom::Start(start))?;
        let mut buf = vec![0u8; span];
        self.inner.read_exact(&mut buf)?;
        let (compressed, crc_bytes) = buf.split_at(span - 4);
        let expected = u32::from_be_bytes([crc_bytes[0], crc_bytes[1], crc_bytes[2], crc_bytes[3]]);
        let actual = {
            let mut h = Crc32::new();
            h.update(compressed);
            h.finalize()
        };
        if actual != expected {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                ChunkMismatch { chunk: idx, expected, actual },
            ));
        }
        let uncompressed_len = self.info.uncompressed_chunk_len(idx);
        let chunk = self
            .info
            .compressor
            .decompress(compressed, uncompressed_len)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;
        self.chunk = chunk;
        self.chunk_idx = Some(idx);
        Ok(())
    }
}

impl<R: Read + Seek> Read for CompressedReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.pos >= self.info.data_length {
            return Ok(0);
        }
        let chunk_len = self.info.chunk_length as u64;
        let idx = (self.pos / chunk_len) as usize;
        self.load_chunk(idx)?;
        let within = (self.pos % chunk_len) as usize;
        let available = self.chunk.len() - within;
        let step = buf.len().min(available);
        buf[..step].copy_from_slice(&self.chunk[within..within + step]);
        self.pos += step as u64;
        Ok(step)
    }
}

impl<R: Read + Seek> Seek for CompressedReader<R> {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(p) => p,
            SeekFrom::End(delta) => (self.info.data_length as i64 + delta) as u64,
            SeekFrom::Current(delta) => (self.pos as i64 + delta) as u64,
        };
        self.pos = target;
        Ok(self.pos)
    }
}
