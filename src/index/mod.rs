//! The external index and the per-partition promoted index.
//!
//! # Index file
//!
//! A sequence of entries:
//!
//! ```text
//! u16 key_len, key
//! u64 data_offset
//! u32 promoted_index_size
//! promoted_index_size bytes
//! ```
//!
//! `promoted_index_size == 0` means the partition has no promoted index.
//!
//! # Promoted index (`mc`)
//!
//! ```text
//! vint partition_header_length
//! delta_deletion partition_tombstone
//! vint block_count
//! block_count × {
//!     u16-sized clustering first_in_block
//!     u16-sized clustering last_in_block
//!     vint block_offset
//!     signed_vint (block_width − 65536)
//!     u8 open_marker_flag
//!     optional delta_deletion open_marker_tombstone
//! }
//! u32 offsets[block_count]
//! ```
//!
//! Block offsets are measured from the partition's first byte after the
//! partition header. The legacy layouts store `(first_name, last_name,
//! offset, width)` per block with no continuation hints.

#[cfg(test)]
mod tests;

use std::io::{Cursor, Read, Seek, SeekFrom, Write};

use crate::components::summary::{SamplingState, Summary};
use crate::data::modern::{ModernParser, ModernSerializer};
use crate::data::{read_deletion_time, write_deletion_time};
use crate::encoding::{
    read_int, read_raw, read_signed_vint, read_string, read_vint, write_int, write_signed_vint,
    write_string, write_vint, FixedInt,
};
use crate::error::{Result, SstableError};
use crate::model::{
    BoundKind, ClusteringPrefix, Partitioner, Position, Schema, Token, Tombstone,
};

/// Width bias applied to promoted-index block widths before zig-zag
/// encoding; blocks near the desired size then encode in few bytes.
const WIDTH_BASE: i64 = 65_536;

// ------------------------------------------------------------------------------------------------
// Promoted index model
// ------------------------------------------------------------------------------------------------

/// Clustering position bounding a promoted-index block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockBound {
    /// The clustering prefix.
    pub prefix: ClusteringPrefix,
    /// How the prefix was reached: a row or a marker kind.
    pub kind: BoundKind,
}

impl BlockBound {
    /// Position of this bound in the partition.
    pub fn position(&self) -> Position {
        Position { prefix: self.prefix.clone(), weight: self.kind.weight() }
    }
}

/// One sampled block of a partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromotedBlock {
    /// First clustering written after the previous block boundary.
    pub first: BlockBound,
    /// Last clustering written before the cut.
    pub last: BlockBound,
    /// Offset of the block, from the first byte after the partition header.
    pub offset: u64,
    /// Bytes the block spans.
    pub width: u64,
    /// Range tombstone still open at the block end, when any.
    pub open_marker: Option<Tombstone>,
}

/// A parsed per-partition promoted index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromotedIndex {
    /// Bytes of partition key, tombstone and static row in the data file.
    pub partition_header_length: u64,
    /// The partition tombstone.
    pub partition_tombstone: Tombstone,
    /// The sampled blocks, in clustering order.
    pub blocks: Vec<PromotedBlock>,
}

impl PromotedIndex {
    /// Index of the first block that may contain `pos`: the last block
    /// whose first position is not greater than `pos`, clamped to zero.
    pub fn first_block_for(&self, schema: &Schema, pos: &Position) -> usize {
        let mut chosen = 0;
        for (i, block) in self.blocks.iter().enumerate() {
            if schema.compare_positions(&block.first.position(), pos) == std::cmp::Ordering::Greater
            {
                break;
            }
            chosen = i;
        }
        chosen
    }

    /// Block holding the first item at or after `prefix`.
    pub fn advance_to_clustering(&self, schema: &Schema, prefix: &ClusteringPrefix) -> usize {
        self.first_block_for(schema, &Position::at(prefix.clone()))
    }

    /// First block whose content lies entirely past `pos`, or `None` when
    /// every remaining block may still contain it.
    pub fn advance_past(&self, schema: &Schema, pos: &Position) -> Option<usize> {
        self.blocks.iter().position(|block| {
            schema.compare_positions(&block.first.position(), pos) == std::cmp::Ordering::Greater
        })
    }
}

// ------------------------------------------------------------------------------------------------
// Promoted index builder (writer side)
// ------------------------------------------------------------------------------------------------

/// Per-partition promoted-index accumulation: a bounded FIFO of block
/// descriptors, finalized and serialized only at end-of-partition so the
/// leading size prefix can be computed.
pub struct PromotedIndexBuilder {
    desired_block_size: u64,
    blocks: Vec<PromotedBlock>,
    first: Option<BlockBound>,
    last: Option<BlockBound>,
    block_start_offset: u64,
    block_next_start_offset: u64,
}

impl PromotedIndexBuilder {
    /// A builder cutting blocks roughly every `desired_block_size` bytes.
    pub fn new(desired_block_size: u64) -> Self {
        Self {
            desired_block_size,
            blocks: Vec::new(),
            first: None,
            last: None,
            block_start_offset: 0,
            block_next_start_offset: desired_block_size,
        }
    }

    /// Note a clustered item about to be written at `offset` (relative to
    /// the first byte after the partition header).
    pub fn note_first_clustering(&mut self, bound: BlockBound, offset: u64) {
        if self.first.is_none() {
            self.first = Some(bound);
            self.block_start_offset = offset;
        }
    }

    /// Note a clustered item fully written, ending at `end_offset`, with a
    /// possibly still-open range tombstone.
    pub fn note_clustered_written(
        &mut self,
        bound: BlockBound,
        end_offset: u64,
        open_marker: Option<Tombstone>,
    ) {
        self.last = Some(bound);
        if end_offset >= self.block_next_start_offset {
            self.cut_block(end_offset, open_marker);
        }
    }

    fn cut_block(&mut self, end_offset: u64, open_marker: Option<Tombstone>) {
        let (Some(first), Some(last)) = (self.first.take(), self.last.take()) else {
            return;
        };
        self.blocks.push(PromotedBlock {
            first,
            last,
            offset: self.block_start_offset,
            width: end_offset - self.block_start_offset,
            open_marker,
        });
        self.block_next_start_offset = end_offset + self.desired_block_size;
    }

    /// Close the trailing block and return all blocks.
    pub fn finish(mut self, end_offset: u64) -> Vec<PromotedBlock> {
        self.cut_block(end_offset, None);
        self.blocks
    }
}

// ------------------------------------------------------------------------------------------------
// Promoted index serialization
// ------------------------------------------------------------------------------------------------

fn write_block_bound<W: Write>(
    w: &mut W,
    serializer: &ModernSerializer<'_>,
    bound: &BlockBound,
) -> Result<()> {
    write_int(w, bound.kind.ordinal())?;
    write_int(w, u16::from_len(bound.prefix.len(), "block bound size")?)?;
    serializer.write_clustering_prefix(w, &bound.prefix)?;
    Ok(())
}

fn read_block_bound<R: Read>(r: &mut R, parser: &ModernParser<'_>) -> Result<BlockBound> {
    let kind_raw = read_int::<u8, _>(r)?;
    let kind = BoundKind::from_ordinal(kind_raw).ok_or_else(|| {
        SstableError::MalformedSstable(format!("bad block bound kind {kind_raw}"))
    })?;
    let len = read_int::<u16, _>(r)?.as_len().map_err(SstableError::from)?;
    let prefix = parser.read_clustering_prefix(r, len)?;
    Ok(BlockBound { prefix, kind })
}

/// Serialize a modern promoted index. Fewer than two blocks serialize to an
/// empty blob (callers then write size zero).
pub fn serialize_promoted_index(
    serializer: &ModernSerializer<'_>,
    partition_header_length: u64,
    partition_tombstone: Tombstone,
    blocks: &[PromotedBlock],
) -> Result<Vec<u8>> {
    if blocks.len() < 2 {
        return Ok(Vec::new());
    }
    let mut buf = Vec::new();
    write_vint(&mut buf, partition_header_length)?;
    serializer.write_delta_deletion(&mut buf, partition_tombstone)?;
    write_vint(&mut buf, blocks.len() as u64)?;
    let mut offsets = Vec::with_capacity(blocks.len());
    let block_area_start = buf.len();
    for block in blocks {
        offsets.push((buf.len() - block_area_start) as u32);
        write_block_bound(&mut buf, serializer, &block.first)?;
        write_block_bound(&mut buf, serializer, &block.last)?;
        write_vint(&mut buf, block.offset)?;
        write_signed_vint(&mut buf, block.width as i64 - WIDTH_BASE)?;
        match block.open_marker {
            Some(t) => {
                write_int(&mut buf, 1u8)?;
                serializer.write_delta_deletion(&mut buf, t)?;
            }
            None => write_int(&mut buf, 0u8)?,
        }
    }
    for offset in offsets {
        write_int(&mut buf, offset)?;
    }
    Ok(buf)
}

/// Parse a modern promoted index blob.
pub fn parse_promoted_index(parser: &ModernParser<'_>, blob: &[u8]) -> Result<PromotedIndex> {
    let mut r = Cursor::new(blob);
    let partition_header_length = read_vint(&mut r)?;
    let partition_tombstone = parser.read_delta_deletion(&mut r)?;
    let count = read_vint(&mut r)? as usize;
    let mut blocks = Vec::with_capacity(count.min(4096));
    for _ in 0..count {
        let first = read_block_bound(&mut r, parser)?;
        let last = read_block_bound(&mut r, parser)?;
        let offset = read_vint(&mut r)?;
        let width = (read_signed_vint(&mut r)? + WIDTH_BASE) as u64;
        let open_flag = read_int::<u8, _>(&mut r)?;
        let open_marker = if open_flag != 0 {
            Some(parser.read_delta_deletion(&mut r)?)
        } else {
            None
        };
        blocks.push(PromotedBlock { first, last, offset, width, open_marker });
    }
    // the trailing offsets array is redundant on this path; skip it
    Ok(PromotedIndex {
        partition_header_length,
        partition_tombstone,
        blocks,
    })
}

/// Serialize a legacy promoted index: per block `(first_name, last_name,
/// offset, width)` with no continuation hints.
pub fn serialize_legacy_promoted_index(
    partition_tombstone: Tombstone,
    blocks: &[(Vec<u8>, Vec<u8>, u64, u64)],
) -> Result<Vec<u8>> {
    if blocks.len() < 2 {
        return Ok(Vec::new());
    }
    let mut buf = Vec::new();
    write_deletion_time(&mut buf, partition_tombstone)?;
    write_int(&mut buf, u32::from_len(blocks.len(), "promoted index blocks")?)?;
    for (first, last, offset, width) in blocks {
        write_string::<u16, _>(&mut buf, first)?;
        write_string::<u16, _>(&mut buf, last)?;
        write_int(&mut buf, *offset)?;
        write_int(&mut buf, *width)?;
    }
    Ok(buf)
}

/// Parse a legacy promoted index blob.
pub fn parse_legacy_promoted_index(
    blob: &[u8],
) -> Result<(Tombstone, Vec<(Vec<u8>, Vec<u8>, u64, u64)>)> {
    let mut r = Cursor::new(blob);
    let tombstone = read_deletion_time(&mut r)?;
    let count = read_int::<u32, _>(&mut r)?.as_len().map_err(SstableError::from)?;
    let mut blocks = Vec::with_capacity(count.min(4096));
    for _ in 0..count {
        let first = read_string::<u16, _>(&mut r)?;
        let last = read_string::<u16, _>(&mut r)?;
        let offset = read_int(&mut r)?;
        let width = read_int(&mut r)?;
        blocks.push((first, last, offset, width));
    }
    Ok((tombstone, blocks))
}

// ------------------------------------------------------------------------------------------------
// Index file writer
// ------------------------------------------------------------------------------------------------

/// Appends entries to the index file.
pub struct IndexWriter<W: Write> {
    w: W,
    offset: u64,
}

impl<W: Write> IndexWriter<W> {
    /// Wrap an index file opened for writing.
    pub fn new(w: W) -> Self {
        Self { w, offset: 0 }
    }

    /// Byte offset the next entry will start at.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Append one entry.
    pub fn append(&mut self, key: &[u8], data_offset: u64, promoted: &[u8]) -> Result<()> {
        let mut buf = Vec::with_capacity(2 + key.len() + 8 + 4 + promoted.len());
        write_string::<u16, _>(&mut buf, key)?;
        write_int(&mut buf, data_offset)?;
        write_int(&mut buf, u32::from_len(promoted.len(), "promoted index size")?)?;
        buf.extend_from_slice(promoted);
        self.w.write_all(&buf).map_err(SstableError::Io)?;
        self.offset += buf.len() as u64;
        Ok(())
    }

    /// Flush and hand back the inner writer.
    pub fn finish(mut self) -> Result<W> {
        self.w.flush().map_err(SstableError::Io)?;
        Ok(self.w)
    }
}

// ------------------------------------------------------------------------------------------------
// Index file reader
// ------------------------------------------------------------------------------------------------

/// One parsed index entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    /// The partition key.
    pub key: Vec<u8>,
    /// Token of the key.
    pub token: Token,
    /// Offset of the partition record in the data file.
    pub data_offset: u64,
    /// Raw promoted-index blob; empty when absent.
    pub promoted: Vec<u8>,
    /// Offset of this entry in the index file.
    pub index_offset: u64,
}

/// Streams entries out of the index file.
pub struct IndexReader<R: Read + Seek> {
    r: R,
    len: u64,
    pos: u64,
}

impl<R: Read + Seek> IndexReader<R> {
    /// Wrap an index file opened for reading.
    pub fn new(mut r: R) -> Result<Self> {
        let len = r.seek(SeekFrom::End(0))?;
        r.seek(SeekFrom::Start(0))?;
        Ok(Self { r, len, pos: 0 })
    }

    /// Total index length in bytes.
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Whether the index is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Position the cursor at `offset`.
    pub fn seek_to(&mut self, offset: u64) -> Result<()> {
        self.r.seek(SeekFrom::Start(offset))?;
        self.pos = offset;
        Ok(())
    }

    /// Read the entry at the cursor, or `None` at end of file. Tokens are
    /// recomputed through `partitioner`.
    pub fn next_entry(&mut self, partitioner: &dyn Partitioner) -> Result<Option<IndexEntry>> {
        if self.pos >= self.len {
            return Ok(None);
        }
        let index_offset = self.pos;
        let key = read_string::<u16, _>(&mut self.r)?;
        let data_offset = read_int::<u64, _>(&mut self.r)?;
        let pi_size = read_int::<u32, _>(&mut self.r)?.as_len().map_err(SstableError::from)?;
        let promoted = read_raw(&mut self.r, pi_size, "promoted index")?;
        self.pos += 2 + key.len() as u64 + 8 + 4 + promoted.len() as u64;
        let token = partitioner.token(&key);
        Ok(Some(IndexEntry {
            key,
            token,
            data_offset,
            promoted,
            index_offset,
        }))
    }

    /// Locate the entry for `(token, key)`: binary-search the summary for
    /// the bracketing index range, then scan entries until the target is
    /// found or passed.
    pub fn seek_to_partition(
        &mut self,
        summary: &Summary,
        partitioner: &dyn Partitioner,
        token: Token,
        key: &[u8],
    ) -> Result<Option<IndexEntry>> {
        let Some(summary_idx) = summary.lower_bound(token, key) else {
            return Ok(None);
        };
        let (start, end) = summary.index_range(summary_idx, self.len);
        self.seek_to(start)?;
        while self.pos < end {
            let Some(entry) = self.next_entry(partitioner)? else {
                break;
            };
            let cmp = entry
                .token
                .cmp(&token)
                .then_with(|| entry.key.as_slice().cmp(key));
            match cmp {
                std::cmp::Ordering::Less => continue,
                std::cmp::Ordering::Equal => return Ok(Some(entry)),
                std::cmp::Ordering::Greater => return Ok(None),
            }
        }
        Ok(None)
    }
}

/// Rebuild the in-memory summary from the index file, as the reader does
/// when the Summary component is missing or fails to parse.
pub fn rebuild_summary_from_index<R: Read + Seek>(
    index: &mut IndexReader<R>,
    partitioner: &dyn Partitioner,
    min_index_interval: u32,
    summary_byte_cost: u64,
) -> Result<Summary> {
    let mut summary = Summary::default();
    summary.prepare(1, min_index_interval)?;
    let mut state = SamplingState { summary_byte_cost, ..Default::default() };
    index.seek_to(0)?;
    let mut first_key: Option<Vec<u8>> = None;
    let mut last_key: Option<Vec<u8>> = None;
    while let Some(entry) = index.next_entry(partitioner)? {
        summary.maybe_add_entry(
            entry.token,
            &entry.key,
            entry.data_offset,
            entry.index_offset,
            &mut state,
        );
        if first_key.is_none() {
            first_key = Some(entry.key.clone());
        }
        last_key = Some(entry.key);
    }
    let first = first_key.ok_or_else(|| {
        SstableError::MalformedSstable("cannot rebuild a summary from an empty index".into())
    })?;
    summary.seal(first, last_key, &state);
    Ok(summary)
}
