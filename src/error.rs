//! Crate-level error taxonomy.
//!
//! Every layer funnels into [`SstableError`]. The split mirrors how failures
//! are handled rather than where they occur:
//!
//! - [`SstableError::MalformedSstable`] — the bytes on disk violate the
//!   format. The SSTable is rejected; nothing is recovered.
//! - [`SstableError::Io`] — the operating system failed us. Recovery is the
//!   caller's responsibility.
//! - [`SstableError::IntegrityFailure`] — a per-chunk checksum mismatch. The
//!   corrupt chunk is never returned to the caller.
//! - [`SstableError::Overflow`] — a narrow-conversion check failed while
//!   serializing (for example a `u64` size into a `u16` length field).
//! - [`SstableError::OutOfRange`] — a reverse lookup into an enum-to-name
//!   map had no entry.
//! - [`SstableError::BrokenMetadata`] — statistics values failed invariant
//!   checks. This one is usually recovered locally by clearing the affected
//!   fields; it only propagates when the caller asks for strict loading.

use std::io;

use thiserror::Error;

use crate::encoding::EncodingError;

/// Error payload carried through `io::Error` when a data chunk fails its
/// checksum, so the failure survives the I/O plumbing and resurfaces as
/// [`SstableError::IntegrityFailure`] instead of a plain I/O error.
#[derive(Debug)]
pub struct ChunkMismatch {
    /// Failing chunk index.
    pub chunk: usize,
    /// Checksum recorded at write time.
    pub expected: u32,
    /// Checksum of the bytes actually read.
    pub actual: u32,
}

impl std::fmt::Display for ChunkMismatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "chunk {} checksum mismatch: expected {:#010x}, got {:#010x}",
            self.chunk, self.expected, self.actual
        )
    }
}

impl std::error::Error for ChunkMismatch {}

/// Errors returned by SSTable open, read and write pipelines.
#[derive(Debug, Error)]
pub enum SstableError {
    /// Binary expectations violated: bad TOC, unknown component, corrupt
    /// histogram, serialization header outside ModernM, and friends.
    #[error("malformed sstable: {0}")]
    MalformedSstable(String),

    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(io::Error),

    /// Per-chunk checksum mismatch while reading the data file.
    #[error("integrity failure: chunk {chunk} expected crc {expected:#010x}, got {actual:#010x}")]
    IntegrityFailure {
        /// Zero-based chunk index inside the data file.
        chunk: usize,
        /// Checksum recorded at write time.
        expected: u32,
        /// Checksum of the bytes actually read.
        actual: u32,
    },

    /// Narrow-conversion check failure during serialization.
    #[error("overflow: {0}")]
    Overflow(String),

    /// Reverse lookup of a component or enum name had no entry.
    #[error("out of range: {0}")]
    OutOfRange(String),

    /// Statistics values failed invariant checks.
    #[error("broken metadata: {0}")]
    BrokenMetadata(String),
}

impl From<io::Error> for SstableError {
    fn from(e: io::Error) -> Self {
        if e.get_ref().map(|inner| inner.is::<ChunkMismatch>()) != Some(true) {
            return SstableError::Io(e);
        }
        let kind = e.kind();
        match e.into_inner().map(|boxed| boxed.downcast::<ChunkMismatch>()) {
            Some(Ok(m)) => SstableError::IntegrityFailure {
                chunk: m.chunk,
                expected: m.expected,
                actual: m.actual,
            },
            Some(Err(other)) => SstableError::Io(io::Error::new(kind, other)),
            None => SstableError::Io(io::Error::new(kind, "chunk checksum mismatch")),
        }
    }
}

impl From<EncodingError> for SstableError {
    fn from(e: EncodingError) -> Self {
        match e {
            EncodingError::Overflow { .. } => SstableError::Overflow(e.to_string()),
            EncodingError::UnknownEnum { .. } => SstableError::OutOfRange(e.to_string()),
            EncodingError::Io(inner) => SstableError::from(inner),
            other => SstableError::MalformedSstable(other.to_string()),
        }
    }
}

/// Convenience alias used across the crate.
pub type Result<T, E = SstableError> = std::result::Result<T, E>;
