//! Deterministic binary primitives for the on-disk SSTable formats.
//!
//! Every component file in this crate is framed field-at-a-time through the
//! helpers in this module. Owning the wire format keeps the emitted bytes
//! stable: the same logical value always serializes to the same bytes, and a
//! dependency upgrade can never change what lands on disk.
//!
//! # Wire format
//!
//! | Shape                  | Encoding                                        |
//! |------------------------|-------------------------------------------------|
//! | fixed-width integer    | big-endian, width of the type                   |
//! | `bool`                 | one byte, `0x00` or `0x01`                      |
//! | `f64`                  | bit pattern as big-endian `u64`                 |
//! | unsigned vint          | leading-ones length prefix, 1–9 bytes           |
//! | signed vint            | zig-zag, then unsigned vint                     |
//! | string / bytes         | length (fixed-width or vint), then raw bytes    |
//! | array                  | length, then `length` elements                  |
//! | map                    | length, then `length` `(K, V)` pairs            |
//! | tagged union set       | `u32` count, then `count` × (tag, `u32` size, payload) |
//!
//! The vint layout is the leading-zeros family used by columnar stores: the
//! number of leading one bits in the first byte equals the number of extra
//! bytes that follow; the remaining bits of the first byte are the most
//! significant bits of the value. A `u64` therefore takes at most 9 bytes.
//!
//! # Errors
//!
//! Decoders never panic. Violations surface as [`EncodingError`]:
//! short reads, narrow-conversion overflow, or an unmapped enum value.

#[cfg(test)]
mod tests;

use std::collections::BTreeMap;
use std::io::{self, Read, Write};

use thiserror::Error;

/// Integral arrays are transcoded in bounded batches of this many bytes so a
/// hostile length prefix cannot make us allocate the whole declared array up
/// front.
pub const ARRAY_CHUNK_BYTES: usize = 100_000;

// ------------------------------------------------------------------------------------------------
// Error type
// ------------------------------------------------------------------------------------------------

/// Errors produced by the primitive codec layer.
#[derive(Debug, Error)]
pub enum EncodingError {
    /// The stream ended before the declared data was consumed.
    #[error("short read: {context}")]
    ShortRead {
        /// What was being decoded when the stream ran dry.
        context: &'static str,
    },

    /// A value does not fit the narrower target it must be stored in.
    #[error("overflow storing {value} into {target}")]
    Overflow {
        /// The offending value.
        value: u64,
        /// Name of the narrow target type or field.
        target: &'static str,
    },

    /// A mapped value is missing from the static enum table.
    #[error("unknown enum value {value} for {enum_name}")]
    UnknownEnum {
        /// The raw value read from disk.
        value: u64,
        /// The enum the value failed to map into.
        enum_name: &'static str,
    },

    /// A bool field held a byte other than `0x00` or `0x01`.
    #[error("invalid bool byte {0:#04x}")]
    InvalidBool(u8),

    /// A string field was not valid UTF-8.
    #[error("invalid UTF-8: {0}")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),

    /// Underlying I/O failure that is not a clean end-of-stream.
    #[error("I/O error: {0}")]
    Io(io::Error),
}

impl From<io::Error> for EncodingError {
    fn from(e: io::Error) -> Self {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            EncodingError::ShortRead { context: "stream" }
        } else {
            EncodingError::Io(e)
        }
    }
}

/// Codec-layer result alias.
pub type Result<T, E = EncodingError> = std::result::Result<T, E>;

// ------------------------------------------------------------------------------------------------
// Fixed-width integers
// ------------------------------------------------------------------------------------------------

/// Fixed-width big-endian integer, readable and writable on a stream.
pub trait FixedInt: Sized + Copy {
    /// Width of the type on the wire, in bytes.
    const WIDTH: usize;

    /// Read one value from `r`.
    fn read_be<R: Read>(r: &mut R) -> Result<Self>;

    /// Write one value to `w`.
    fn write_be<W: Write>(&self, w: &mut W) -> Result<()>;

    /// The value widened to a `usize` length, rejecting negatives.
    fn as_len(&self) -> Result<usize>;

    /// Narrow a length into this type, checking for overflow.
    fn from_len(len: usize, target: &'static str) -> Result<Self>;
}

macro_rules! impl_fixed_int {
    ($($t:ty),*) => {$(
        impl FixedInt for $t {
            const WIDTH: usize = std::mem::size_of::<$t>();

            fn read_be<R: Read>(r: &mut R) -> Result<Self> {
                let mut buf = [0u8; std::mem::size_of::<$t>()];
                r.read_exact(&mut buf)?;
                Ok(<$t>::from_be_bytes(buf))
            }

            fn write_be<W: Write>(&self, w: &mut W) -> Result<()> {
                w.write_all(&self.to_be_bytes())?;
                Ok(())
            }

            fn as_len(&self) -> Result<usize> {
                usize::try_from(*self).map_err(|_| EncodingError::Overflow {
                    value: *self as u64,
                    target: "usize length",
                })
            }

            fn from_len(len: usize, target: &'static str) -> Result<Self> {
                <$t>::try_from(len).map_err(|_| EncodingError::Overflow {
                    value: len as u64,
                    target,
                })
            }
        }
    )*};
}

impl_fixed_int!(u8, u16, u32, u64, i8, i16, i32, i64);

/// Read one big-endian integer of type `T`.
pub fn read_int<T: FixedInt, R: Read>(r: &mut R) -> Result<T> {
    T::read_be(r)
}

/// Write one big-endian integer of type `T`.
pub fn write_int<T: FixedInt, W: Write>(w: &mut W, value: T) -> Result<()> {
    value.write_be(w)
}

/// Read a bool encoded as a single `0`/`1` byte.
pub fn read_bool<R: Read>(r: &mut R) -> Result<bool> {
    match u8::read_be(r)? {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(EncodingError::InvalidBool(other)),
    }
}

/// Write a bool as a single `0`/`1` byte.
pub fn write_bool<W: Write>(w: &mut W, value: bool) -> Result<()> {
    u8::from(value).write_be(w)
}

/// Read an `f64` stored as the big-endian bit pattern of a `u64`.
pub fn read_double<R: Read>(r: &mut R) -> Result<f64> {
    Ok(f64::from_bits(u64::read_be(r)?))
}

/// Write an `f64` as the big-endian bit pattern of a `u64`.
pub fn write_double<W: Write>(w: &mut W, value: f64) -> Result<()> {
    value.to_bits().write_be(w)
}

// ------------------------------------------------------------------------------------------------
// Variable-length integers
// ------------------------------------------------------------------------------------------------

/// Number of bytes [`write_vint`] will emit for `value`.
pub fn vint_size(value: u64) -> usize {
    let bits = 64 - (value | 1).leading_zeros() as usize;
    if bits <= 7 {
        1
    } else if bits > 63 {
        9
    } else {
        // n extra bytes give 7 + 7n bits of capacity
        1 + (bits - 1) / 7
    }
}

/// Number of bytes [`write_signed_vint`] will emit for `value`.
pub fn signed_vint_size(value: i64) -> usize {
    vint_size(zigzag(value))
}

fn zigzag(value: i64) -> u64 {
    ((value << 1) ^ (value >> 63)) as u64
}

fn unzigzag(value: u64) -> i64 {
    ((value >> 1) as i64) ^ -((value & 1) as i64)
}

/// Write an unsigned variable-length integer.
pub fn write_vint<W: Write>(w: &mut W, value: u64) -> Result<()> {
    let size = vint_size(value);
    if size == 1 {
        w.write_all(&[value as u8])?;
        return Ok(());
    }
    let extra = size - 1;
    let mut buf = [0u8; 9];
    if extra == 8 {
        buf[0] = 0xff;
        buf[1..9].copy_from_slice(&value.to_be_bytes());
        w.write_all(&buf)?;
        return Ok(());
    }
    // leading byte: `extra` one bits, a zero bit, then the top value bits
    buf[0] = !(0xffu8 >> extra) | (value >> (8 * extra)) as u8;
    for i in 0..extra {
        buf[1 + i] = (value >> (8 * (extra - 1 - i))) as u8;
    }
    w.write_all(&buf[..size])?;
    Ok(())
}

/// Read an unsigned variable-length integer.
pub fn read_vint<R: Read>(r: &mut R) -> Result<u64> {
    let first = u8::read_be(r)?;
    let extra = first.leading_ones() as usize;
    if extra == 0 {
        return Ok(first as u64);
    }
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf[..extra])?;
    let mut value: u64 = if extra == 8 {
        0
    } else {
        ((first & (0xff >> extra)) as u64) << (8 * extra)
    };
    for (i, b) in buf[..extra].iter().enumerate() {
        value |= (*b as u64) << (8 * (extra - 1 - i));
    }
    Ok(value)
}

/// Write a signed variable-length integer (zig-zag, then unsigned vint).
pub fn write_signed_vint<W: Write>(w: &mut W, value: i64) -> Result<()> {
    write_vint(w, zigzag(value))
}

/// Read a signed variable-length integer.
pub fn read_signed_vint<R: Read>(r: &mut R) -> Result<i64> {
    Ok(unzigzag(read_vint(r)?))
}

// ------------------------------------------------------------------------------------------------
// Length-prefixed byte strings
// ------------------------------------------------------------------------------------------------

/// Read a byte string whose length is a fixed-width integer of type `L`.
pub fn read_string<L: FixedInt, R: Read>(r: &mut R) -> Result<Vec<u8>> {
    let len = L::read_be(r)?.as_len()?;
    read_raw(r, len, "string body")
}

/// Write a byte string with a fixed-width length prefix of type `L`.
pub fn write_string<L: FixedInt, W: Write>(w: &mut W, bytes: &[u8]) -> Result<()> {
    L::from_len(bytes.len(), "string length")?.write_be(w)?;
    w.write_all(bytes)?;
    Ok(())
}

/// Read a byte string with a vint length prefix.
pub fn read_string_vint<R: Read>(r: &mut R) -> Result<Vec<u8>> {
    let len = read_vint(r)?;
    let len = usize::try_from(len).map_err(|_| EncodingError::Overflow {
        value: len,
        target: "usize length",
    })?;
    read_raw(r, len, "vint string body")
}

/// Write a byte string with a vint length prefix.
pub fn write_string_vint<W: Write>(w: &mut W, bytes: &[u8]) -> Result<()> {
    write_vint(w, bytes.len() as u64)?;
    w.write_all(bytes)?;
    Ok(())
}

/// Read exactly `len` raw bytes, in bounded batches.
pub fn read_raw<R: Read>(r: &mut R, len: usize, context: &'static str) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(len.min(ARRAY_CHUNK_BYTES));
    let mut remaining = len;
    let mut buf = [0u8; 8192];
    while remaining > 0 {
        let step = remaining.min(buf.len());
        r.read_exact(&mut buf[..step])
            .map_err(|e| match EncodingError::from(e) {
                EncodingError::ShortRead { .. } => EncodingError::ShortRead { context },
                other => other,
            })?;
        out.extend_from_slice(&buf[..step]);
        remaining -= step;
    }
    Ok(out)
}

// ------------------------------------------------------------------------------------------------
// Arrays and maps
// ------------------------------------------------------------------------------------------------

/// Read an array of fixed-width integers with an `L` length prefix.
///
/// Transcoding happens in [`ARRAY_CHUNK_BYTES`] batches so the buffer stays
/// bounded no matter what the length prefix claims.
pub fn read_array<L: FixedInt, T: FixedInt, R: Read>(r: &mut R) -> Result<Vec<T>> {
    let len = L::read_be(r)?.as_len()?;
    let chunk_elems = (ARRAY_CHUNK_BYTES / T::WIDTH).max(1);
    let mut out = Vec::with_capacity(len.min(chunk_elems));
    let mut remaining = len;
    while remaining > 0 {
        let step = remaining.min(chunk_elems);
        for _ in 0..step {
            out.push(T::read_be(r)?);
        }
        remaining -= step;
    }
    Ok(out)
}

/// Write an array of fixed-width integers with an `L` length prefix.
pub fn write_array<L: FixedInt, T: FixedInt, W: Write>(w: &mut W, items: &[T]) -> Result<()> {
    L::from_len(items.len(), "array length")?.write_be(w)?;
    for item in items {
        item.write_be(w)?;
    }
    Ok(())
}

/// Read a map of `(K, V)` byte-string pairs with an `L` length prefix.
///
/// Both keys and values are themselves `L`-prefixed byte strings. The result
/// preserves key order via `BTreeMap`, which also makes re-serialization
/// deterministic.
pub fn read_map<L: FixedInt, R: Read>(r: &mut R) -> Result<BTreeMap<Vec<u8>, Vec<u8>>> {
    let len = L::read_be(r)?.as_len()?;
    let mut out = BTreeMap::new();
    for _ in 0..len {
        let k = read_string::<L, R>(r)?;
        let v = read_string::<L, R>(r)?;
        out.insert(k, v);
    }
    Ok(out)
}

/// Write a map of `(K, V)` byte-string pairs with an `L` length prefix.
pub fn write_map<L: FixedInt, W: Write>(
    w: &mut W,
    map: &BTreeMap<Vec<u8>, Vec<u8>>,
) -> Result<()> {
    L::from_len(map.len(), "map length")?.write_be(w)?;
    for (k, v) in map {
        write_string::<L, W>(w, k)?;
        write_string::<L, W>(w, v)?;
    }
    Ok(())
}

// ------------------------------------------------------------------------------------------------
// Tagged unions
// ------------------------------------------------------------------------------------------------

/// One raw entry of a tagged-union set: the tag and its undecoded payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaggedEntry {
    /// Union member tag as stored on disk.
    pub tag: u32,
    /// The member payload, exactly `byte_size` bytes.
    pub payload: Vec<u8>,
}

/// Read a tagged-union set: `u32` count, then `count` × (tag, `u32` size,
/// payload).
///
/// Unrecognized tags are not an error here: every entry is surfaced to the
/// caller with its raw payload, and a caller that does not know a tag keeps
/// or drops the payload without aborting the read.
pub fn read_tagged_union<R: Read>(r: &mut R) -> Result<Vec<TaggedEntry>> {
    let count = u32::read_be(r)?.as_len()?;
    let mut entries = Vec::with_capacity(count.min(64));
    for _ in 0..count {
        let tag = u32::read_be(r)?;
        let size = u32::read_be(r)?.as_len()?;
        let payload = read_raw(r, size, "tagged union payload")?;
        entries.push(TaggedEntry { tag, payload });
    }
    Ok(entries)
}

/// Write a tagged-union set from raw entries.
pub fn write_tagged_union<W: Write>(w: &mut W, entries: &[TaggedEntry]) -> Result<()> {
    u32::from_len(entries.len(), "tagged union count")?.write_be(w)?;
    for entry in entries {
        entry.tag.write_be(w)?;
        u32::from_len(entry.payload.len(), "tagged union member size")?.write_be(w)?;
        w.write_all(&entry.payload)?;
    }
    Ok(())
}

// ------------------------------------------------------------------------------------------------
// Position-tracking writer
// ------------------------------------------------------------------------------------------------

/// A `Write` adaptor that tracks how many bytes have passed through it.
///
/// Component writers use the offset both for index bookkeeping and for the
/// promoted-index width arithmetic, so the count must reflect exactly what
/// was handed to the inner writer.
pub struct CountedWrite<W> {
    inner: W,
    offset: u64,
}

impl<W: Write> CountedWrite<W> {
    /// Wrap `inner`, starting the count at zero.
    pub fn new(inner: W) -> Self {
        Self { inner, offset: 0 }
    }

    /// Bytes written so far.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Consume the adaptor, returning the inner writer.
    pub fn into_inner(self) -> W {
        self.inner
    }

    /// Borrow the inner writer.
    pub fn get_mut(&mut self) -> &mut W {
        &mut self.inner
    }
}

impl<W: Write> Write for CountedWrite<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.offset += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
