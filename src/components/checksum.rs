//! Checksumming for the data file: the CRC component (per-chunk table for
//! uncompressed data), the Digest component (full-file checksum, textual)
//! and the writer/reader adaptors that maintain them.
//!
//! ModernM checksums with CRC32; the legacy layouts use Adler32. When
//! compression is enabled the per-chunk checksums live inside the
//! compressed stream instead and the CRC component is absent.

use std::io::{Read, Seek, SeekFrom, Write};

use adler32::RollingAdler32;
use crc32fast::Hasher as Crc32;

use crate::components::Version;
use crate::encoding::{read_array, read_int, write_array, write_int};
use crate::error::{ChunkMismatch, Result, SstableError};

/// Uncompressed chunk size the per-chunk table is built over.
pub const DEFAULT_CHUNK_LEN: u32 = 65_536;

/// Which checksum primitive a version uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumType {
    /// CRC32 (ModernM).
    Crc32,
    /// Adler32 (legacy layouts).
    Adler32,
}

impl ChecksumType {
    /// The primitive for files of `version`.
    pub fn for_version(version: Version) -> Self {
        if version.is_modern() {
            ChecksumType::Crc32
        } else {
            ChecksumType::Adler32
        }
    }
}

/// Incremental checksum over one of the two primitives.
pub enum Checksummer {
    /// CRC32 state.
    Crc32(Crc32),
    /// Adler32 state.
    Adler32(RollingAdler32),
}

impl Checksummer {
    /// Fresh state for `ctype`.
    pub fn new(ctype: ChecksumType) -> Self {
        match ctype {
            ChecksumType::Crc32 => Checksummer::Crc32(Crc32::new()),
            ChecksumType::Adler32 => Checksummer::Adler32(RollingAdler32::new()),
        }
    }

    /// Fold in `bytes`.
    pub fn update(&mut self, bytes: &[u8]) {
        match self {
            Checksummer::Crc32(h) => h.update(bytes),
            Checksummer::Adler32(h) => h.update_buffer(bytes),
        }
    }

    /// Current checksum value.
    pub fn value(&self) -> u32 {
        match self {
            Checksummer::Crc32(h) => h.clone().finalize(),
            Checksummer::Adler32(h) => h.hash(),
        }
    }
}

/// One-shot checksum of `bytes`.
pub fn checksum_of(ctype: ChecksumType, bytes: &[u8]) -> u32 {
    let mut c = Checksummer::new(ctype);
    c.update(bytes);
    c.value()
}

// ------------------------------------------------------------------------------------------------
// CRC component
// ------------------------------------------------------------------------------------------------

/// The CRC component: per-chunk checksums of the uncompressed data file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CrcComponent {
    /// Uncompressed chunk length the table was built over.
    pub chunk_length: u32,
    /// One checksum per chunk, in order.
    pub checksums: Vec<u32>,
}

impl CrcComponent {
    /// Serialize: `u32 chunk_length, u32 chunk_count, u32[chunk_count]`.
    pub fn save<W: Write>(&self, w: &mut W) -> Result<()> {
        write_int(w, self.chunk_length)?;
        write_array::<u32, u32, _>(w, &self.checksums)?;
        Ok(())
    }

    /// Parse a serialized CRC component.
    pub fn load<R: Read>(r: &mut R) -> Result<CrcComponent> {
        let chunk_length = read_int(r)?;
        let checksums = read_array::<u32, u32, _>(r)?;
        Ok(CrcComponent { chunk_length, checksums })
    }
}

// ------------------------------------------------------------------------------------------------
// Digest component
// ------------------------------------------------------------------------------------------------

/// The Digest component: the full-file checksum as ASCII decimal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Digest(pub u32);

impl Digest {
    /// Serialize the decimal representation.
    pub fn save<W: Write>(&self, w: &mut W) -> Result<()> {
        w.write_all(self.0.to_string().as_bytes())
            .map_err(SstableError::Io)?;
        Ok(())
    }

    /// Parse the decimal representation.
    pub fn load<R: Read>(r: &mut R) -> Result<Digest> {
        let mut text = String::new();
        r.read_to_string(&mut text).map_err(SstableError::Io)?;
        let value = text.trim().parse::<u32>().map_err(|_| {
            SstableError::MalformedSstable(format!("digest is not a decimal checksum: {text:?}"))
        })?;
        Ok(Digest(value))
    }
}

// ------------------------------------------------------------------------------------------------
// Checksummed writer
// ------------------------------------------------------------------------------------------------

/// Write adaptor for the uncompressed data path: splits the stream into
/// fixed chunks, maintaining the per-chunk table and the full-file digest.
pub struct ChecksummedWriter<W: Write> {
    inner: W,
    ctype: ChecksumType,
    chunk_length: u32,
    bytes_in_chunk: u32,
    chunk: Checksummer,
    full: Checksummer,
    checksums: Vec<u32>,
    offset: u64,
}

impl<W: Write> ChecksummedWriter<W> {
    /// Wrap `inner`, checksumming with `ctype` over `chunk_length` chunks.
    pub fn new(inner: W, ctype: ChecksumType, chunk_length: u32) -> Self {
        Self {
            inner,
            ctype,
            chunk_length,
            bytes_in_chunk: 0,
            chunk: Checksummer::new(ctype),
            full: Checksummer::new(ctype),
            checksums: Vec::new(),
            offset: 0,
        }
    }

    /// Bytes written so far.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Close the current chunk (if any bytes are pending), producing the
    /// final CRC component and digest, and hand back the inner writer.
    pub fn finish(mut self) -> (W, CrcComponent, Digest) {
        if self.bytes_in_chunk > 0 {
            self.checksums.push(self.chunk.value());
        }
        let crc = CrcComponent {
            chunk_length: self.chunk_length,
            checksums: self.checksums,
        };
        (self.inner, crc, Digest(self.full.value()))
    }
}

impl<W: Write> Write for ChecksummedWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut written = 0;
        let mut rest = buf;
        while !rest.is_empty() {
            let room = (self.chunk_length - self.bytes_in_chunk) as usize;
            let step = rest.len().min(room);
            self.inner.write_all(&rest[..step])?;
            self.chunk.update(&rest[..step]);
            self.full.update(&rest[..step]);
            self.bytes_in_chunk += step as u32;
            self.offset += step as u64;
            written += step;
            if self.bytes_in_chunk == self.chunk_length {
                self.checksums.push(self.chunk.value());
                self.chunk = Checksummer::new(self.ctype);
                self.bytes_in_chunk = 0;
            }
            rest = &rest[step..];
        }
        Ok(written)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

// ------------------------------------------------------------------------------------------------
// Checksummed reader
// ------------------------------------------------------------------------------------------------

/// Read adaptor for the uncompressed data path: serves bytes chunk by
/// chunk, verifying each chunk against the CRC table before any byte of it
/// escapes.
pub struct ChecksummedReader<R: Read + Seek> {
    inner: R,
    ctype: ChecksumType,
    table: CrcComponent,
    file_len: u64,
    /// Verified bytes of the current chunk.
    chunk: Vec<u8>,
    /// Index of the chunk held in `chunk`, if any.
    chunk_idx: Option<usize>,
    /// Absolute read position.
    pos: u64,
}

impl<R: Read + Seek> ChecksummedReader<R> {
    /// Wrap `inner` with its checksum table.
    pub fn new(mut inner: R, ctype: ChecksumType, table: CrcComponent) -> Result<Self> {
        let file_len = inner.seek(SeekFrom::End(0))?;
        inner.seek(SeekFrom::Start(0))?;
        Ok(Self {
            inner,
            ctype,
            table,
            file_len,
            chunk: Vec::new(),
            chunk_idx: None,
            pos: 0,
        })
    }

    /// Absolute position of the next byte served.
    pub fn position(&self) -> u64 {
        self.pos
    }

    /// Total data length.
    pub fn len(&self) -> u64 {
        self.file_len
    }

    /// Whether the file is empty.
    pub fn is_empty(&self) -> bool {
        self.file_len == 0
    }

    fn load_chunk(&mut self, idx: usize) -> std::io::Result<()> {
        if self.chunk_idx == Some(idx) {
            return Ok(());
        }
        let chunk_len = self.table.chunk_length as u64;
        let start = idx as u64 * chunk_len;
        let len = chunk_len.min(self.file_len.saturating_sub(start)) as usize;
        self.inner.seek(SeekFrom::Start(start))?;
        let mut buf = vec![0u8; len];
        self.inner.read_exact(&mut buf)?;
        let expected = *self.table.checksums.get(idx).ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("no checksum recorded for chunk {idx}"),
            )
        })?;
        let actual = checksum_of(self.ctype, &buf);
        if actual != expected {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                ChunkMismatch { chunk: idx, expected, actual },
            ));
        }
        self.chunk = buf;
        self.chunk_idx = Some(idx);
        Ok(())
    }
}

/// Convert an I/O error from the checksummed path into the crate taxonomy,
/// unwrapping a chunk mismatch into an integrity failure.
pub fn into_sstable_error(e: std::io::Error) -> SstableError {
    SstableError::from(e)
}

impl<R: Read + Seek> Read for ChecksummedReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.pos >= self.file_len {
            return Ok(0);
        }
        let chunk_len = self.table.chunk_length as u64;
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

impl<R: Read + Seek> Seek for ChecksummedReader<R> {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(p) => p,
            SeekFrom::End(delta) => (self.file_len as i64 + delta) as u64,
            SeekFrom::Current(delta) => (self.pos as i64 + delta) as u64,
        };
        self.pos = target;
        Ok(self.pos)
    }
}
