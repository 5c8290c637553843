//! The Statistics component: a tagged union of metadata blobs.
//!
//! # On-disk layout
//!
//! ```text
//! u32 entry_count
//! { u32 tag, u32 offset } × entry_count      // offsets from file start
//! concatenated bodies
//! ```
//!
//! The writer always emits entries sorted by tag. Some legacy writers did
//! not, so the reader sorts the offset map before trusting it.
//!
//! Four kinds are recognized: Validation (partitioner name and filter
//! chance), Compaction (ancestor generations and a cardinality sketch),
//! Stats (timestamps, histograms, clustering bounds, level, repair stamp)
//! and SerializationHeader (ModernM only: the column sets and encoding-stats
//! epochs the row codec deltas against). An unrecognized tag is ignored; a
//! SerializationHeader in a non-ModernM file is malformed.

use std::io::{Cursor, Read, Write};

use tracing::warn;

use crate::components::Version;
use crate::encoding::{
    read_bool, read_double, read_int, read_signed_vint, read_string, read_string_vint, read_vint,
    write_bool, write_double, write_int, write_signed_vint, write_string, write_string_vint,
    write_vint, FixedInt,
};
use crate::error::{Result, SstableError};
use crate::model::{ColumnType, Schema};

// ------------------------------------------------------------------------------------------------
// Tags and encoding-stats epochs
// ------------------------------------------------------------------------------------------------

/// Metadata kind tags as stored on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u32)]
pub enum MetadataTag {
    /// Validation metadata.
    Validation = 0,
    /// Compaction metadata.
    Compaction = 1,
    /// Stats metadata.
    Stats = 2,
    /// Serialization header (ModernM only).
    SerializationHeader = 3,
}

/// Epoch the delta-encoded timestamps are measured against (microseconds).
pub const TIMESTAMP_EPOCH: i64 = 1_442_880_000_000_000;
/// Epoch the delta-encoded local deletion times are measured against.
pub const DELETION_TIME_EPOCH: i32 = 1_442_880_000;
/// Epoch the delta-encoded TTLs are measured against.
pub const TTL_EPOCH: i32 = 0;

/// Minima the ModernM data file deltas are measured against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodingStats {
    /// Smallest write timestamp expected in the file.
    pub min_timestamp: i64,
    /// Smallest local deletion time expected in the file.
    pub min_local_deletion_time: i32,
    /// Smallest TTL expected in the file.
    pub min_ttl: i32,
}

impl Default for EncodingStats {
    fn default() -> Self {
        Self {
            min_timestamp: TIMESTAMP_EPOCH,
            min_local_deletion_time: DELETION_TIME_EPOCH,
            min_ttl: TTL_EPOCH,
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Histograms
// ------------------------------------------------------------------------------------------------

/// Fixed-bucket histogram of sizes or counts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EstimatedHistogram {
    /// Upper bound of each bucket.
    pub bucket_offsets: Vec<u64>,
    /// Sample count per bucket.
    pub buckets: Vec<u64>,
}

impl EstimatedHistogram {
    /// A geometric bucket ladder with `n` buckets starting at 1.
    pub fn with_default_buckets(n: usize) -> Self {
        let mut offsets = Vec::with_capacity(n);
        let mut last = 1u64;
        for _ in 0..n {
            offsets.push(last);
            // ~20% growth, minimum step of one
            last = (last + (last / 5).max(1)).max(last + 1);
        }
        Self { bucket_offsets: offsets, buckets: vec![0; n] }
    }

    /// Count one sample of magnitude `value`.
    pub fn add(&mut self, value: u64) {
        let idx = match self.bucket_offsets.binary_search(&value) {
            Ok(i) => i,
            Err(i) => i.min(self.buckets.len().saturating_sub(1)),
        };
        if let Some(b) = self.buckets.get_mut(idx) {
            *b += 1;
        }
    }

    fn save<W: Write>(&self, w: &mut W) -> Result<()> {
        if self.bucket_offsets.len() != self.buckets.len() {
            return Err(SstableError::BrokenMetadata(
                "histogram offset/bucket length mismatch".into(),
            ));
        }
        write_int(w, u32::from_len(self.buckets.len(), "histogram length")?)?;
        for (offset, bucket) in self.bucket_offsets.iter().zip(&self.buckets) {
            write_int(w, *offset)?;
            write_int(w, *bucket)?;
        }
        Ok(())
    }

    fn load<R: Read>(r: &mut R) -> Result<Self> {
        let len = read_int::<u32, _>(r)?.as_len().map_err(SstableError::from)?;
        let mut bucket_offsets = Vec::with_capacity(len.min(4096));
        let mut buckets = Vec::with_capacity(len.min(4096));
        for _ in 0..len {
            bucket_offsets.push(read_int::<u64, _>(r)?);
            buckets.push(read_int::<u64, _>(r)?);
        }
        Ok(Self { bucket_offsets, buckets })
    }
}

/// Bounded-bin histogram of tombstone drop times.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamingHistogram {
    /// Maximum number of bins kept.
    pub max_bin_size: u32,
    /// `(drop time, count)` bins, key-sorted.
    pub bins: Vec<(f64, u64)>,
}

impl Default for StreamingHistogram {
    fn default() -> Self {
        Self { max_bin_size: 100, bins: Vec::new() }
    }
}

impl StreamingHistogram {
    /// Count one tombstone dropping at `point`, merging the two closest
    /// bins when the cap is exceeded.
    pub fn add(&mut self, point: f64) {
        match self.bins.binary_search_by(|(k, _)| k.partial_cmp(&point).unwrap_or(std::cmp::Ordering::Less)) {
            Ok(i) => self.bins[i].1 += 1,
            Err(i) => self.bins.insert(i, (point, 1)),
        }
        if self.bins.len() > self.max_bin_size as usize {
            // merge the pair with the smallest gap
            let mut best = 0;
            let mut best_gap = f64::MAX;
            for i in 0..self.bins.len() - 1 {
                let gap = self.bins[i + 1].0 - self.bins[i].0;
                if gap < best_gap {
                    best_gap = gap;
                    best = i;
                }
            }
            let (k1, c1) = self.bins[best];
            let (k2, c2) = self.bins[best + 1];
            let merged_count = c1 + c2;
            let merged_key =
                (k1 * c1 as f64 + k2 * c2 as f64) / merged_count as f64;
            self.bins[best] = (merged_key, merged_count);
            self.bins.remove(best + 1);
        }
    }

    fn save<W: Write>(&self, w: &mut W) -> Result<()> {
        write_int(w, self.max_bin_size)?;
        write_int(w, u32::from_len(self.bins.len(), "histogram bins")?)?;
        for (key, count) in &self.bins {
            write_double(w, *key)?;
            write_int(w, *count)?;
        }
        Ok(())
    }

    fn load<R: Read>(r: &mut R) -> Result<Self> {
        let max_bin_size = read_int::<u32, _>(r)?;
        let len = read_int::<u32, _>(r)?.as_len().map_err(SstableError::from)?;
        let mut bins = Vec::with_capacity(len.min(4096));
        for _ in 0..len {
            let key = read_double(r)?;
            let count = read_int::<u64, _>(r)?;
            bins.push((key, count));
        }
        Ok(Self { max_bin_size, bins })
    }
}

// ------------------------------------------------------------------------------------------------
// Metadata variants
// ------------------------------------------------------------------------------------------------

/// Validation metadata: enough to refuse a file written for a different
/// partitioner.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationMetadata {
    /// Partitioner the keys were decorated with.
    pub partitioner_name: String,
    /// Bloom filter false-positive chance the file was built with.
    pub filter_chance: f64,
}

impl ValidationMetadata {
    fn save<W: Write>(&self, w: &mut W) -> Result<()> {
        write_string::<u16, _>(w, self.partitioner_name.as_bytes())?;
        write_double(w, self.filter_chance)?;
        Ok(())
    }

    fn load<R: Read>(r: &mut R) -> Result<Self> {
        let name = read_string::<u16, _>(r)?;
        let partitioner_name = String::from_utf8(name)
            .map_err(|_| SstableError::MalformedSstable("partitioner name not UTF-8".into()))?;
        let filter_chance = read_double(r)?;
        Ok(Self { partitioner_name, filter_chance })
    }
}

/// Compaction metadata: lineage and a cardinality sketch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompactionMetadata {
    /// Generations this SSTable was compacted from.
    pub ancestors: Vec<u32>,
    /// Opaque cardinality estimator bytes.
    pub cardinality: Vec<u8>,
}

impl CompactionMetadata {
    fn save<W: Write>(&self, w: &mut W) -> Result<()> {
        write_int(w, u32::from_len(self.ancestors.len(), "ancestor count")?)?;
        for a in &self.ancestors {
            write_int(w, *a)?;
        }
        write_string::<u32, _>(w, &self.cardinality)?;
        Ok(())
    }

    fn load<R: Read>(r: &mut R) -> Result<Self> {
        let n = read_int::<u32, _>(r)?.as_len().map_err(SstableError::from)?;
        let mut ancestors = Vec::with_capacity(n.min(4096));
        for _ in 0..n {
            ancestors.push(read_int::<u32, _>(r)?);
        }
        let cardinality = read_string::<u32, _>(r)?;
        Ok(Self { ancestors, cardinality })
    }
}

/// Commit-log replay watermark.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayPosition {
    /// Commit-log segment id.
    pub segment_id: u64,
    /// Offset inside the segment.
    pub position: u32,
}

/// Stats metadata: everything a compaction or read planner wants to know
/// without touching the data file.
#[derive(Debug, Clone, PartialEq)]
pub struct StatsMetadata {
    /// Partition size histogram.
    pub estimated_partition_size: EstimatedHistogram,
    /// Cells-per-partition histogram.
    pub estimated_cells_count: EstimatedHistogram,
    /// Replay watermark recorded at flush.
    pub position: ReplayPosition,
    /// Smallest write timestamp.
    pub min_timestamp: i64,
    /// Largest write timestamp.
    pub max_timestamp: i64,
    /// Smallest local deletion time.
    pub min_local_deletion_time: i32,
    /// Largest local deletion time.
    pub max_local_deletion_time: i32,
    /// Smallest TTL.
    pub min_ttl: i32,
    /// Largest TTL.
    pub max_ttl: i32,
    /// Compressed-to-uncompressed size ratio, `-1.0` when not compressed.
    pub compression_ratio: f64,
    /// Tombstone drop-time histogram.
    pub estimated_tombstone_drop_time: StreamingHistogram,
    /// Leveled-compaction level.
    pub sstable_level: u32,
    /// Repair stamp, zero when unrepaired.
    pub repaired_at: u64,
    /// Smallest clustering component per position.
    pub min_column_names: Vec<Vec<u8>>,
    /// Largest clustering component per position.
    pub max_column_names: Vec<Vec<u8>>,
    /// Whether pre-2.1 counter shards may be present.
    pub has_legacy_counter_shards: bool,
    /// Total cell count.
    pub columns_count: i64,
    /// Total row count.
    pub rows_count: i64,
}

impl Default for StatsMetadata {
    fn default() -> Self {
        Self {
            estimated_partition_size: EstimatedHistogram::with_default_buckets(114),
            estimated_cells_count: EstimatedHistogram::with_default_buckets(114),
            position: ReplayPosition::default(),
            min_timestamp: i64::MAX,
            max_timestamp: i64::MIN,
            min_local_deletion_time: i32::MAX,
            max_local_deletion_time: i32::MIN,
            min_ttl: i32::MAX,
            max_ttl: 0,
            compression_ratio: -1.0,
            estimated_tombstone_drop_time: StreamingHistogram::default(),
            sstable_level: 0,
            repaired_at: 0,
            min_column_names: Vec::new(),
            max_column_names: Vec::new(),
            has_legacy_counter_shards: false,
            columns_count: 0,
            rows_count: 0,
        }
    }
}

impl StatsMetadata {
    fn save<W: Write>(&self, w: &mut W, version: Version) -> Result<()> {
        self.estimated_partition_size.save(w)?;
        self.estimated_cells_count.save(w)?;
        write_int(w, self.position.segment_id)?;
        write_int(w, self.position.position)?;
        write_int(w, self.min_timestamp)?;
        write_int(w, self.max_timestamp)?;
        if version.is_modern() {
            write_int(w, self.min_local_deletion_time)?;
        }
        write_int(w, self.max_local_deletion_time)?;
        if version.is_modern() {
            write_int(w, self.min_ttl)?;
            write_int(w, self.max_ttl)?;
        }
        write_double(w, self.compression_ratio)?;
        self.estimated_tombstone_drop_time.save(w)?;
        write_int(w, self.sstable_level)?;
        write_int(w, self.repaired_at)?;
        write_int(w, u32::from_len(self.min_column_names.len(), "min clustering values")?)?;
        for name in &self.min_column_names {
            write_string::<u16, _>(w, name)?;
        }
        write_int(w, u32::from_len(self.max_column_names.len(), "max clustering values")?)?;
        for name in &self.max_column_names {
            write_string::<u16, _>(w, name)?;
        }
        write_bool(w, self.has_legacy_counter_shards)?;
        if version.is_modern() {
            write_int(w, self.columns_count)?;
            write_int(w, self.rows_count)?;
        }
        Ok(())
    }

    fn load<R: Read>(r: &mut R, version: Version) -> Result<Self> {
        let estimated_partition_size = EstimatedHistogram::load(r)?;
        let estimated_cells_count = EstimatedHistogram::load(r)?;
        let position = ReplayPosition {
            segment_id: read_int(r)?,
            position: read_int(r)?,
        };
        let min_timestamp = read_int(r)?;
        let max_timestamp = read_int(r)?;
        let min_local_deletion_time = if version.is_modern() {
            read_int(r)?
        } else {
            i32::MIN
        };
        let max_local_deletion_time = read_int(r)?;
        let (min_ttl, max_ttl) = if version.is_modern() {
            (read_int(r)?, read_int(r)?)
        } else {
            (0, 0)
        };
        let compression_ratio = read_double(r)?;
        let estimated_tombstone_drop_time = StreamingHistogram::load(r)?;
        let sstable_level = read_int(r)?;
        let repaired_at = read_int(r)?;
        let n = read_int::<u32, _>(r)?.as_len().map_err(SstableError::from)?;
        let mut min_column_names = Vec::with_capacity(n.min(64));
        for _ in 0..n {
            min_column_names.push(read_string::<u16, _>(r)?);
        }
        let n = read_int::<u32, _>(r)?.as_len().map_err(SstableError::from)?;
        let mut max_column_names = Vec::with_capacity(n.min(64));
        for _ in 0..n {
            max_column_names.push(read_string::<u16, _>(r)?);
        }
        let has_legacy_counter_shards = read_bool(r)?;
        let (columns_count, rows_count) = if version.is_modern() {
            (read_int(r)?, read_int(r)?)
        } else {
            (0, 0)
        };
        let mut stats = Self {
            estimated_partition_size,
            estimated_cells_count,
            position,
            min_timestamp,
            max_timestamp,
            min_local_deletion_time,
            max_local_deletion_time,
            min_ttl,
            max_ttl,
            compression_ratio,
            estimated_tombstone_drop_time,
            sstable_level,
            repaired_at,
            min_column_names,
            max_column_names,
            has_legacy_counter_shards,
            columns_count,
            rows_count,
        };
        // Legacy writers could emit a wrapped-around deletion time.
        if !version.is_modern() && stats.max_local_deletion_time < 0 {
            warn!(
                value = stats.max_local_deletion_time,
                "clamping legacy max_local_deletion_time"
            );
            stats.max_local_deletion_time = i32::MAX;
        }
        Ok(stats)
    }
}

/// One column descriptor of the serialization header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSpec {
    /// Column name bytes.
    pub name: Vec<u8>,
    /// Type name, as [`ColumnType::name`].
    pub type_name: String,
}

/// Serialization header (ModernM only): what the row codec needs before the
/// first row byte can be interpreted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerializationHeaderMetadata {
    /// Encoding-stats minima the data file deltas against.
    pub encoding_stats: EncodingStats,
    /// Partition key type name.
    pub partition_key_type: String,
    /// Clustering component type names, in order.
    pub clustering_types: Vec<String>,
    /// Static column descriptors, name-sorted.
    pub static_columns: Vec<ColumnSpec>,
    /// Regular column descriptors, name-sorted.
    pub regular_columns: Vec<ColumnSpec>,
}

impl SerializationHeaderMetadata {
    /// Build the header for `schema` with the observed encoding minima.
    /// Multi-cell columns carry a `+multicell` suffix on the type name so
    /// the row codec can tell them apart without the schema.
    pub fn from_schema(schema: &Schema, encoding_stats: EncodingStats) -> Self {
        let spec = |c: &crate::model::ColumnDef| ColumnSpec {
            name: c.name.clone(),
            type_name: if c.complex {
                format!("{}+multicell", c.column_type.name())
            } else {
                c.column_type.name().to_string()
            },
        };
        Self {
            encoding_stats,
            partition_key_type: schema.partition_key_type.name().to_string(),
            clustering_types: schema
                .clustering_types
                .iter()
                .map(|t| t.name().to_string())
                .collect(),
            static_columns: schema.static_columns.iter().map(spec).collect(),
            regular_columns: schema.regular_columns.iter().map(spec).collect(),
        }
    }

    /// Fixed on-disk width of clustering component `i`, from the recorded
    /// type name.
    pub fn clustering_fixed_len(&self, i: usize) -> Option<usize> {
        self.clustering_types
            .get(i)
            .and_then(|name| ColumnType::from_name(name))
            .and_then(|t| t.fixed_len())
    }

    fn save<W: Write>(&self, w: &mut W) -> Result<()> {
        write_signed_vint(w, self.encoding_stats.min_timestamp - TIMESTAMP_EPOCH)?;
        write_signed_vint(
            w,
            i64::from(self.encoding_stats.min_local_deletion_time) - i64::from(DELETION_TIME_EPOCH),
        )?;
        write_signed_vint(w, i64::from(self.encoding_stats.min_ttl) - i64::from(TTL_EPOCH))?;
        write_string_vint(w, self.partition_key_type.as_bytes())?;
        write_vint(w, self.clustering_types.len() as u64)?;
        for t in &self.clustering_types {
            write_string_vint(w, t.as_bytes())?;
        }
        for columns in [&self.static_columns, &self.regular_columns] {
            write_vint(w, columns.len() as u64)?;
            for c in columns {
                write_string_vint(w, &c.name)?;
                write_string_vint(w, c.type_name.as_bytes())?;
            }
        }
        Ok(())
    }

    fn load<R: Read>(r: &mut R) -> Result<Self> {
        let narrow = |v: i64, what: &str| {
            i32::try_from(v).map_err(|_| {
                SstableError::MalformedSstable(format!("{what} out of range in header"))
            })
        };
        let min_timestamp = read_signed_vint(r)? + TIMESTAMP_EPOCH;
        let min_local_deletion_time =
            narrow(read_signed_vint(r)? + i64::from(DELETION_TIME_EPOCH), "min deletion time")?;
        let min_ttl = narrow(read_signed_vint(r)? + i64::from(TTL_EPOCH), "min ttl")?;
        let partition_key_type = utf8(read_string_vint(r)?)?;
        let n = read_vint(r)? as usize;
        let mut clustering_types = Vec::with_capacity(n.min(64));
        for _ in 0..n {
            clustering_types.push(utf8(read_string_vint(r)?)?);
        }
        let mut column_sets = Vec::with_capacity(2);
        for _ in 0..2 {
            let n = read_vint(r)? as usize;
            let mut columns = Vec::with_capacity(n.min(256));
            for _ in 0..n {
                let name = read_string_vint(r)?;
                let type_name = utf8(read_string_vint(r)?)?;
                columns.push(ColumnSpec { name, type_name });
            }
            column_sets.push(columns);
        }
        let regular_columns = column_sets.pop().unwrap_or_default();
        let static_columns = column_sets.pop().unwrap_or_default();
        Ok(Self {
            encoding_stats: EncodingStats {
                min_timestamp,
                min_local_deletion_time,
                min_ttl,
            },
            partition_key_type,
            clustering_types,
            static_columns,
            regular_columns,
        })
    }
}

fn utf8(bytes: Vec<u8>) -> Result<String> {
    String::from_utf8(bytes)
        .map_err(|_| SstableError::MalformedSstable("type name not UTF-8".into()))
}

// ------------------------------------------------------------------------------------------------
// The component
// ------------------------------------------------------------------------------------------------

/// The Statistics component.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Statistics {
    /// Validation metadata, when present.
    pub validation: Option<ValidationMetadata>,
    /// Compaction metadata, when present.
    pub compaction: Option<CompactionMetadata>,
    /// Stats metadata, when present.
    pub stats: Option<StatsMetadata>,
    /// Serialization header; ModernM only.
    pub serialization_header: Option<SerializationHeaderMetadata>,
}

impl Statistics {
    /// Serialize with the tag-to-offset prefix, entries sorted by tag.
    pub fn save<W: Write>(&self, w: &mut W, version: Version) -> Result<()> {
        let mut bodies: Vec<(u32, Vec<u8>)> = Vec::new();
        if let Some(v) = &self.validation {
            let mut buf = Vec::new();
            v.save(&mut buf)?;
            bodies.push((MetadataTag::Validation as u32, buf));
        }
        if let Some(c) = &self.compaction {
            let mut buf = Vec::new();
            c.save(&mut buf)?;
            bodies.push((MetadataTag::Compaction as u32, buf));
        }
        if let Some(s) = &self.stats {
            let mut buf = Vec::new();
            s.save(&mut buf, version)?;
            bodies.push((MetadataTag::Stats as u32, buf));
        }
        if let Some(h) = &self.serialization_header {
            if !version.is_modern() {
                return Err(SstableError::MalformedSstable(
                    "serialization header requires the row-grouped layout".into(),
                ));
            }
            let mut buf = Vec::new();
            h.save(&mut buf)?;
            bodies.push((MetadataTag::SerializationHeader as u32, buf));
        }
        bodies.sort_by_key(|(tag, _)| *tag);

        write_int(w, u32::from_len(bodies.len(), "statistics entry count")?)?;
        let mut offset = 4 + 8 * bodies.len() as u32;
        for (tag, body) in &bodies {
            write_int(w, *tag)?;
            write_int(w, offset)?;
            offset = offset
                .checked_add(u32::from_len(body.len(), "statistics body size")?)
                .ok_or_else(|| SstableError::Overflow("statistics offset".into()))?;
        }
        for (_, body) in &bodies {
            w.write_all(body).map_err(SstableError::Io)?;
        }
        Ok(())
    }

    /// Parse a serialized Statistics blob.
    ///
    /// The whole blob must be in memory: offsets address from the start of
    /// the component, and legacy files may store them unsorted.
    pub fn load(bytes: &[u8], version: Version) -> Result<Statistics> {
        let mut r = Cursor::new(bytes);
        let count = read_int::<u32, _>(&mut r)?.as_len().map_err(SstableError::from)?;
        let mut offsets = Vec::with_capacity(count.min(16));
        for _ in 0..count {
            let tag = read_int::<u32, _>(&mut r)?;
            let offset = read_int::<u32, _>(&mut r)?.as_len().map_err(SstableError::from)?;
            offsets.push((tag, offset));
        }
        // The source may have written the map unsorted.
        offsets.sort_by_key(|(tag, _)| *tag);

        let mut out = Statistics::default();
        for (tag, offset) in &offsets {
            // bodies are self-delimiting; hand each parser everything from
            // its offset on, so unsorted legacy offset maps still work
            let body = bytes.get(*offset..).ok_or_else(|| {
                SstableError::MalformedSstable(format!(
                    "statistics offset {offset} out of bounds"
                ))
            })?;
            let mut body = Cursor::new(body);
            match *tag {
                t if t == MetadataTag::Validation as u32 => {
                    out.validation = Some(ValidationMetadata::load(&mut body)?);
                }
                t if t == MetadataTag::Compaction as u32 => {
                    out.compaction = Some(CompactionMetadata::load(&mut body)?);
                }
                t if t == MetadataTag::Stats as u32 => {
                    out.stats = Some(StatsMetadata::load(&mut body, version)?);
                }
                t if t == MetadataTag::SerializationHeader as u32 => {
                    if !version.is_modern() {
                        return Err(SstableError::MalformedSstable(
                            "serialization header in a non-ModernM sstable".into(),
                        ));
                    }
                    out.serialization_header = Some(SerializationHeaderMetadata::load(&mut body)?);
                }
                unknown => {
                    warn!(tag = unknown, "ignoring unknown statistics entry");
                }
            }
        }
        Ok(out)
    }

    /// Validate the min/max clustering arrays against `schema`, clearing
    /// both on any violation instead of propagating broken values.
    pub fn validate_clustering_bounds(&mut self, schema: &Schema) {
        let Some(stats) = &mut self.stats else { return };
        let clear = |stats: &mut StatsMetadata, why: &str| {
            warn!(reason = why, "clearing min/max clustering components");
            stats.min_column_names.clear();
            stats.max_column_names.clear();
        };
        if stats.min_column_names.len() != stats.max_column_names.len() {
            clear(stats, "length mismatch");
            return;
        }
        if stats.min_column_names.is_empty() {
            return;
        }
        if !schema.has_clustering() {
            clear(stats, "schema has no clustering key");
            return;
        }
        let is_column_name = |v: &[u8]| {
            schema.static_columns.iter().any(|c| c.name == v)
                || schema.regular_columns.iter().any(|c| c.name == v)
        };
        if stats.min_column_names.iter().any(|v| is_column_name(v))
            || stats.max_column_names.iter().any(|v| is_column_name(v))
        {
            clear(stats, "values are schema column names");
            return;
        }
        if !schema.compound && schema.clustering_types.len() == 1 {
            // A composite wrapping of a single component is ambiguous with
            // older layouts: [u16 len][bytes][0x00].
            let looks_composite = |v: &[u8]| {
                v.len() >= 3
                    && v[v.len() - 1] == 0
                    && u16::from_be_bytes([v[0], v[1]]) as usize == v.len() - 3
            };
            if stats.min_column_names.iter().any(|v| looks_composite(v))
                || stats.max_column_names.iter().any(|v| looks_composite(v))
            {
                clear(stats, "composite encoding of single-component clustering");
            }
        }
    }
}
