//! The Scylla component: a set of tagged unions carrying sharding metadata
//! and a feature bitmap.
//!
//! Every member is framed as `(u32 tag, u32 byte-size, payload)`, so a
//! reader that does not recognize a tag skips exactly `byte-size` bytes and
//! keeps going. Unrecognized members are retained raw and re-emitted on
//! save, which lets a newer writer's members survive a round trip through
//! an older build.

use std::io::{Cursor, Read, Write};

use crate::encoding::{
    read_int, read_string, read_tagged_union, write_int, write_string, write_tagged_union,
    FixedInt, TaggedEntry,
};
use crate::error::{Result, SstableError};
use crate::model::Token;

/// Member tags.
pub const TAG_SHARDING: u32 = 1;
/// Feature bitmap tag.
pub const TAG_FEATURES: u32 = 2;
/// Large-partition report tag.
pub const TAG_LARGE_PARTITION: u32 = 3;
/// Large-row report tag.
pub const TAG_LARGE_ROWS: u32 = 4;

/// Token span owned by one shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardTokenRange {
    /// Left edge, exclusive.
    pub left: Token,
    /// Right edge, inclusive.
    pub right: Token,
    /// Owning shard.
    pub shard: u32,
}

/// Feature bits a reader must understand to open the file correctly.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Features(pub u64);

/// One oversized partition or row recorded at write time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LargeDataEntry {
    /// Partition key of the offender.
    pub key: Vec<u8>,
    /// Observed size in bytes.
    pub size: u64,
}

/// The Scylla metadata component.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScyllaMetadata {
    /// Token ranges owned by each shard, when recorded.
    pub sharding: Option<Vec<ShardTokenRange>>,
    /// Feature bitmap, when recorded.
    pub features: Option<Features>,
    /// Partitions that exceeded the large-partition threshold.
    pub large_partitions: Option<Vec<LargeDataEntry>>,
    /// Rows that exceeded the large-row threshold.
    pub large_rows: Option<Vec<LargeDataEntry>>,
    /// Members with tags this build does not know, retained verbatim.
    pub unknown: Vec<TaggedEntry>,
}

fn save_large_entries(entries: &[LargeDataEntry]) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    write_int(&mut buf, u32::from_len(entries.len(), "large data entries")?)?;
    for e in entries {
        write_string::<u32, _>(&mut buf, &e.key)?;
        write_int(&mut buf, e.size)?;
    }
    Ok(buf)
}

fn load_large_entries(payload: &[u8]) -> Result<Vec<LargeDataEntry>> {
    let mut r = Cursor::new(payload);
    let n = read_int::<u32, _>(&mut r)?.as_len().map_err(SstableError::from)?;
    let mut out = Vec::with_capacity(n.min(1024));
    for _ in 0..n {
        let key = read_string::<u32, _>(&mut r)?;
        let size = read_int(&mut r)?;
        out.push(LargeDataEntry { key, size });
    }
    Ok(out)
}

impl ScyllaMetadata {
    /// Serialize all present members, recognized tags first in tag order,
    /// then the retained unknown members.
    pub fn save<W: Write>(&self, w: &mut W) -> Result<()> {
        let mut entries: Vec<TaggedEntry> = Vec::new();
        if let Some(ranges) = &self.sharding {
            let mut buf = Vec::new();
            write_int(&mut buf, u32::from_len(ranges.len(), "shard ranges")?)?;
            for r in ranges {
                write_int(&mut buf, r.left.0)?;
                write_int(&mut buf, r.right.0)?;
                write_int(&mut buf, r.shard)?;
            }
            entries.push(TaggedEntry { tag: TAG_SHARDING, payload: buf });
        }
        if let Some(features) = &self.features {
            let mut buf = Vec::new();
            write_int(&mut buf, features.0)?;
            entries.push(TaggedEntry { tag: TAG_FEATURES, payload: buf });
        }
        if let Some(large) = &self.large_partitions {
            entries.push(TaggedEntry {
                tag: TAG_LARGE_PARTITION,
                payload: save_large_entries(large)?,
            });
        }
        if let Some(large) = &self.large_rows {
            entries.push(TaggedEntry {
                tag: TAG_LARGE_ROWS,
                payload: save_large_entries(large)?,
            });
        }
        entries.extend(self.unknown.iter().cloned());
        write_tagged_union(w, &entries)?;
        Ok(())
    }

    /// Parse, skipping unknown tags by their declared size.
    pub fn load<R: Read>(r: &mut R) -> Result<ScyllaMetadata> {
        let mut out = ScyllaMetadata::default();
        for entry in read_tagged_union(r)? {
            match entry.tag {
                TAG_SHARDING => {
                    let mut body = Cursor::new(entry.payload.as_slice());
                    let n = read_int::<u32, _>(&mut body)?
                        .as_len()
                        .map_err(SstableError::from)?;
                    let mut ranges = Vec::with_capacity(n.min(1024));
                    for _ in 0..n {
                        ranges.push(ShardTokenRange {
                            left: Token(read_int(&mut body)?),
                            right: Token(read_int(&mut body)?),
                            shard: read_int(&mut body)?,
                        });
                    }
                    out.sharding = Some(ranges);
                }
                TAG_FEATURES => {
                    let mut body = Cursor::new(entry.payload.as_slice());
                    out.features = Some(Features(read_int(&mut body)?));
                }
                TAG_LARGE_PARTITION => {
                    out.large_partitions = Some(load_large_entries(&entry.payload)?);
                }
                TAG_LARGE_ROWS => {
                    out.large_rows = Some(load_large_entries(&entry.payload)?);
                }
                _ => out.unknown.push(entry),
            }
        }
        Ok(out)
    }
}
