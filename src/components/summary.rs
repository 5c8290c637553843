//! The Summary component: a sparse, memory-resident sample of the external
//! index.
//!
//! # On-disk layout
//!
//! ```text
//! header {
//!     u32 min_index_interval
//!     u32 size
//!     u64 memory_size
//!     u32 sampling_level
//!     u32 size_at_full_sampling
//! }
//! u32 positions[size]          // little-endian
//! entries[size]                // each: key bytes, u64 position (little-endian)
//! u32-string first_key
//! u32-string last_key
//! ```
//!
//! `positions[i]` is the byte offset of entry `i` inside the in-memory
//! region that starts with the positions array itself, so entry lengths fall
//! out of consecutive positions. Loading appends a transient boundary
//! position equal to `memory_size` to delimit the last entry and pops it
//! before exposing the structure. The positions array and the per-entry
//! position are little-endian for portability with existing files; every
//! other field is big-endian.

use std::io::{Read, Write};

use crate::encoding::{read_int, read_raw, write_int, FixedInt};
use crate::error::{Result, SstableError};
use crate::model::{Partitioner, Token};

/// Sampling level written by a fresh writer.
pub const BASE_SAMPLING_LEVEL: u32 = 128;

/// Bytes of index per summary byte when no ratio is configured.
pub const DEFAULT_SUMMARY_BYTE_COST: u64 = 2000;

/// Mutable sampling bookkeeping carried by the writer between
/// [`Summary::maybe_add_entry`] calls.
#[derive(Debug, Clone)]
pub struct SamplingState {
    /// Partitions consumed so far.
    pub partition_count: u64,
    /// Data offset at which the next entry will be sampled.
    pub next_data_offset_to_write_summary: u64,
    /// Cost multiplier: index bytes represented per summary byte.
    pub summary_byte_cost: u64,
}

impl Default for SamplingState {
    fn default() -> Self {
        Self {
            partition_count: 0,
            next_data_offset_to_write_summary: 0,
            summary_byte_cost: DEFAULT_SUMMARY_BYTE_COST,
        }
    }
}

/// One summary entry: a sampled partition key and where its index entry
/// starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SummaryEntry {
    /// Token of the sampled key.
    pub token: Token,
    /// The sampled partition key bytes.
    pub key: Vec<u8>,
    /// Byte offset of the key's entry in the index file.
    pub position: u64,
}

/// Fixed-size summary header.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SummaryHeader {
    /// Minimum index sampling interval.
    pub min_index_interval: u32,
    /// Number of entries.
    pub size: u32,
    /// Total bytes of the positions-plus-entries region.
    pub memory_size: u64,
    /// Sampling level; [`BASE_SAMPLING_LEVEL`] when freshly written.
    pub sampling_level: u32,
    /// Entry count a full sampling of the index would have produced.
    pub size_at_full_sampling: u32,
}

/// The Summary component.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Summary {
    /// Header fields.
    pub header: SummaryHeader,
    /// Entry offsets inside the serialized region.
    pub positions: Vec<u32>,
    /// The sampled entries.
    pub entries: Vec<SummaryEntry>,
    /// First partition key of the SSTable.
    pub first_key: Vec<u8>,
    /// Last partition key of the SSTable.
    pub last_key: Vec<u8>,
}

impl Summary {
    /// Initialize the header for an expected partition count, rejecting
    /// inputs whose full sampling could not be counted in a `u32`.
    pub fn prepare(&mut self, expected_partitions: u64, min_interval: u32) -> Result<()> {
        let interval = u64::from(min_interval.max(1));
        let max_expected_entries =
            expected_partitions / interval + u64::from(expected_partitions % interval != 0);
        if max_expected_entries > u64::from(u32::MAX) {
            return Err(SstableError::MalformedSstable(format!(
                "sampling level {BASE_SAMPLING_LEVEL} cannot cover {expected_partitions} partitions"
            )));
        }
        self.header.min_index_interval = min_interval;
        self.header.sampling_level = BASE_SAMPLING_LEVEL;
        self.header.memory_size = 0;
        Ok(())
    }

    /// Append an entry if `data_offset` has crossed the sampling threshold;
    /// otherwise a no-op. Always counts the partition.
    pub fn maybe_add_entry(
        &mut self,
        token: Token,
        key: &[u8],
        data_offset: u64,
        index_offset: u64,
        state: &mut SamplingState,
    ) {
        state.partition_count += 1;
        if data_offset >= state.next_data_offset_to_write_summary {
            // offset + key-length prefix + key
            let entry_size = 8 + 2 + key.len() as u64;
            state.next_data_offset_to_write_summary += state.summary_byte_cost * entry_size;
            self.entries.push(SummaryEntry {
                token,
                key: key.to_vec(),
                position: index_offset,
            });
        }
    }

    /// Finalize counts, positions and the first/last keys.
    pub fn seal(&mut self, first_key: Vec<u8>, last_key: Option<Vec<u8>>, state: &SamplingState) {
        self.header.size = self.entries.len() as u32;
        self.header.size_at_full_sampling = {
            let interval = u64::from(self.header.min_index_interval.max(1));
            let n = state.partition_count;
            (n / interval + u64::from(n % interval != 0)) as u32
        };
        self.header.memory_size = self.header.size as u64 * 4;
        self.positions.clear();
        for entry in &self.entries {
            self.positions.push(self.header.memory_size as u32);
            self.header.memory_size += entry.key.len() as u64 + 8;
        }
        // A single-partition SSTable repeats the first key.
        self.last_key = last_key.unwrap_or_else(|| first_key.clone());
        self.first_key = first_key;
    }

    /// Serialize; byte-identical with [`Summary::load`].
    pub fn save<W: Write>(&self, w: &mut W) -> Result<()> {
        write_int(w, self.header.min_index_interval)?;
        write_int(w, self.header.size)?;
        write_int(w, self.header.memory_size)?;
        write_int(w, self.header.sampling_level)?;
        write_int(w, self.header.size_at_full_sampling)?;
        for p in &self.positions {
            w.write_all(&p.to_le_bytes()).map_err(SstableError::Io)?;
        }
        for entry in &self.entries {
            w.write_all(&entry.key).map_err(SstableError::Io)?;
            w.write_all(&entry.position.to_le_bytes())
                .map_err(SstableError::Io)?;
        }
        write_int(w, u32::from_len(self.first_key.len(), "summary first key")?)?;
        w.write_all(&self.first_key).map_err(SstableError::Io)?;
        write_int(w, u32::from_len(self.last_key.len(), "summary last key")?)?;
        w.write_all(&self.last_key).map_err(SstableError::Io)?;
        Ok(())
    }

    /// Parse a serialized summary. Tokens are recomputed through
    /// `partitioner` since only key bytes are stored.
    pub fn load<R: Read>(r: &mut R, partitioner: &dyn Partitioner) -> Result<Summary> {
        let header = SummaryHeader {
            min_index_interval: read_int(r)?,
            size: read_int(r)?,
            memory_size: read_int(r)?,
            sampling_level: read_int(r)?,
            size_at_full_sampling: read_int(r)?,
        };
        let size = header.size as usize;

        let mut positions = Vec::with_capacity(size);
        for _ in 0..size {
            let mut buf = [0u8; 4];
            r.read_exact(&mut buf)
                .map_err(|e| SstableError::from(crate::encoding::EncodingError::from(e)))?;
            positions.push(u32::from_le_bytes(buf));
        }
        // Transient boundary delimiting the last entry; popped below.
        positions.push(u32::try_from(header.memory_size).map_err(|_| {
            SstableError::MalformedSstable("summary memory_size exceeds u32".into())
        })?);

        let mut entries = Vec::with_capacity(size);
        for i in 0..size {
            let span = positions[i + 1]
                .checked_sub(positions[i])
                .filter(|span| *span >= 8)
                .ok_or_else(|| {
                    SstableError::MalformedSstable(format!(
                        "summary positions not monotonic at entry {i}"
                    ))
                })? as usize;
            let key = read_raw(r, span - 8, "summary entry key")?;
            let mut buf = [0u8; 8];
            r.read_exact(&mut buf)
                .map_err(|e| SstableError::from(crate::encoding::EncodingError::from(e)))?;
            let position = u64::from_le_bytes(buf);
            let token = partitioner.token(&key);
            entries.push(SummaryEntry { token, key, position });
        }
        positions.pop();

        let first_len = read_int::<u32, _>(r)?.as_len().map_err(SstableError::from)?;
        let first_key = read_raw(r, first_len, "summary first key")?;
        let last_len = read_int::<u32, _>(r)?.as_len().map_err(SstableError::from)?;
        let last_key = read_raw(r, last_len, "summary last key")?;

        Ok(Summary {
            header,
            positions,
            entries,
            first_key,
            last_key,
        })
    }

    /// Index of the last entry whose `(token, key)` is not greater than the
    /// target, or `None` when the target precedes every entry.
    pub fn lower_bound(&self, token: Token, key: &[u8]) -> Option<usize> {
        let mut lo = 0usize;
        let mut hi = self.entries.len();
        while lo < hi {
            let mid = (lo + hi) / 2;
            let e = &self.entries[mid];
            let cmp = e
                .token
                .cmp(&token)
                .then_with(|| e.key.as_slice().cmp(key));
            if cmp == std::cmp::Ordering::Greater {
                hi = mid;
            } else {
                lo = mid + 1;
            }
        }
        lo.checked_sub(1)
    }

    /// Byte range of the index file known to contain the target, given the
    /// summary entry chosen by [`Summary::lower_bound`].
    pub fn index_range(&self, entry_idx: usize, index_file_len: u64) -> (u64, u64) {
        let start = self.entries[entry_idx].position;
        let end = self
            .entries
            .get(entry_idx + 1)
            .map(|e| e.position)
            .unwrap_or(index_file_len);
        (start, end)
    }
}
