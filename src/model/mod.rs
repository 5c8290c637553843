//! Logical entities produced and consumed by the SSTable engine.
//!
//! The writer consumes, and the reader reproduces, a fully-ordered stream of
//! [`PartitionEvent`]s: partition start (key plus partition tombstone),
//! optional static row, clustering rows and range tombstones in ascending
//! clustering order, partition end. Nothing in this module touches disk; it
//! is the vocabulary shared by both pipelines.
//!
//! The schema and the partitioner are collaborator seams: the engine only
//! needs element comparators, fixed-width hints and a key-to-token mapping,
//! all supplied through [`Schema`] and [`Partitioner`].

#[cfg(test)]
mod tests;

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

// ------------------------------------------------------------------------------------------------
// Tokens and keys
// ------------------------------------------------------------------------------------------------

/// Partitioner-assigned position of a partition key in the ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Token(pub i64);

/// Maps a partition key to its [`Token`]. Implementations live outside the
/// engine; the engine only relies on the ordering the token induces.
pub trait Partitioner: Send + Sync {
    /// Stable name recorded in the Validation metadata.
    fn name(&self) -> &str;

    /// Token for a raw partition key.
    fn token(&self, key: &[u8]) -> Token;
}

/// Order-preserving partitioner: the token is the first eight key bytes,
/// big-endian, shifted to preserve unsigned byte order in an `i64`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ByteOrderedPartitioner;

impl Partitioner for ByteOrderedPartitioner {
    fn name(&self) -> &str {
        "ByteOrderedPartitioner"
    }

    fn token(&self, key: &[u8]) -> Token {
        let mut buf = [0u8; 8];
        let n = key.len().min(8);
        buf[..n].copy_from_slice(&key[..n]);
        Token((u64::from_be_bytes(buf) ^ (1u64 << 63)) as i64)
    }
}

/// A partition key together with its token. Partitions are ordered by
/// `(token, key bytes)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecoratedKey {
    /// Token assigned by the partitioner.
    pub token: Token,
    /// Raw partition key bytes.
    pub key: Vec<u8>,
}

impl DecoratedKey {
    /// Decorate `key` with `partitioner`.
    pub fn new(partitioner: &dyn Partitioner, key: Vec<u8>) -> Self {
        let token = partitioner.token(&key);
        Self { token, key }
    }
}

impl PartialOrd for DecoratedKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DecoratedKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.token
            .cmp(&other.token)
            .then_with(|| self.key.cmp(&other.key))
    }
}

// ------------------------------------------------------------------------------------------------
// Tombstones and liveness
// ------------------------------------------------------------------------------------------------

/// A deletion: write timestamp plus the local wall-clock second it happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Tombstone {
    /// Write timestamp (microseconds by convention).
    pub timestamp: i64,
    /// Local deletion time, seconds since epoch.
    pub deletion_time: i32,
}

impl Tombstone {
    /// The "no deletion" sentinel.
    pub const NONE: Tombstone = Tombstone {
        timestamp: i64::MIN,
        deletion_time: i32::MAX,
    };

    /// Whether this tombstone actually deletes anything.
    pub fn is_live(&self) -> bool {
        *self == Self::NONE
    }

    /// The newer of two tombstones.
    pub fn max(self, other: Tombstone) -> Tombstone {
        if other.timestamp > self.timestamp {
            other
        } else {
            self
        }
    }
}

impl Default for Tombstone {
    fn default() -> Self {
        Self::NONE
    }
}

/// Row marker: stamps a row as existing, optionally with expiry info.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LivenessInfo {
    /// Write timestamp.
    pub timestamp: i64,
    /// Time-to-live in seconds, when the row expires.
    pub ttl: Option<i32>,
    /// Local deletion time paired with `ttl`.
    pub local_deletion_time: Option<i32>,
}

/// Row-scoped deletion, optionally shadowable (overridden by any newer live
/// marker; used by materialized views).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowDeletion {
    /// The deletion itself.
    pub tombstone: Tombstone,
    /// Whether a newer live marker overrides this deletion.
    pub shadowable: bool,
}

// ------------------------------------------------------------------------------------------------
// Cells
// ------------------------------------------------------------------------------------------------

/// One shard of a counter cell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterShard {
    /// Counter id (host id of the shard owner).
    pub id: [u8; 16],
    /// Logical clock of the shard.
    pub clock: i64,
    /// Accumulated value.
    pub value: i64,
}

/// An atomic cell: the smallest unit of written data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cell {
    /// A live value, optionally expiring.
    Live {
        /// Write timestamp.
        timestamp: i64,
        /// Time-to-live in seconds.
        ttl: Option<i32>,
        /// Expiry point paired with `ttl`.
        expiry: Option<i32>,
        /// The value bytes.
        value: Vec<u8>,
    },
    /// A deleted cell.
    Tombstone {
        /// Write timestamp.
        timestamp: i64,
        /// Local deletion time.
        local_deletion_time: i32,
    },
    /// A counter cell: a set of shards.
    Counter {
        /// Write timestamp.
        timestamp: i64,
        /// The counter shards.
        shards: Vec<CounterShard>,
    },
}

impl Cell {
    /// Write timestamp of the cell.
    pub fn timestamp(&self) -> i64 {
        match self {
            Cell::Live { timestamp, .. }
            | Cell::Tombstone { timestamp, .. }
            | Cell::Counter { timestamp, .. } => *timestamp,
        }
    }

    /// Whether the cell is a tombstone.
    pub fn is_tombstone(&self) -> bool {
        matches!(self, Cell::Tombstone { .. })
    }
}

/// A mutation of a multi-cell (collection) column: an optional tombstone
/// wiping older sub-cells plus new sub-cells keyed by path.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CollectionMutation {
    /// Deletes every sub-cell older than it.
    pub tombstone: Option<Tombstone>,
    /// Sub-cells keyed by cell path, in path order.
    pub cells: Vec<(Vec<u8>, Cell)>,
}

/// Value stored under one column of a row: atomic or complex.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnValue {
    /// Single atomic cell.
    Atomic(Cell),
    /// Collection mutation.
    Complex(CollectionMutation),
}

/// Cells of one row keyed by column name, in name order.
pub type RowCells = BTreeMap<Vec<u8>, ColumnValue>;

// ------------------------------------------------------------------------------------------------
// Clustering
// ------------------------------------------------------------------------------------------------

/// A clustering key truncated to a leading subset of its components.
#[derive(Debug, Clone, PartialEq, Eq, Default, Hash)]
pub struct ClusteringPrefix {
    /// The leading components, each an opaque typed value.
    pub components: Vec<Vec<u8>>,
}

impl ClusteringPrefix {
    /// The empty prefix.
    pub fn empty() -> Self {
        Self { components: Vec::new() }
    }

    /// A prefix from components.
    pub fn from(components: Vec<Vec<u8>>) -> Self {
        Self { components }
    }

    /// Number of populated components.
    pub fn len(&self) -> usize {
        self.components.len()
    }

    /// Whether the prefix has no components.
    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }
}

/// Kind of a range-tombstone bound or marker, with its on-disk ordinal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum BoundKind {
    /// End bound excluding its prefix.
    ExclEnd = 0,
    /// Start bound including its prefix.
    InclStart = 1,
    /// Boundary: exclusive end abutting an inclusive start.
    ExclEndInclStart = 2,
    /// The static clustering, ordered before all rows.
    StaticClustering = 3,
    /// A full clustering (a row position).
    Clustering = 4,
    /// Boundary: inclusive end abutting an exclusive start.
    InclEndExclStart = 5,
    /// End bound including its prefix.
    InclEnd = 6,
    /// Start bound excluding its prefix.
    ExclStart = 7,
}

impl BoundKind {
    /// Whether this kind opens a range (start side).
    pub fn is_start(self) -> bool {
        matches!(
            self,
            BoundKind::InclStart | BoundKind::ExclStart | BoundKind::ExclEndInclStart
        )
    }

    /// Whether this kind closes a range (end side).
    pub fn is_end(self) -> bool {
        matches!(
            self,
            BoundKind::InclEnd
                | BoundKind::ExclEnd
                | BoundKind::ExclEndInclStart
                | BoundKind::InclEndExclStart
        )
    }

    /// Whether this kind carries two tombstones.
    pub fn is_boundary(self) -> bool {
        matches!(self, BoundKind::ExclEndInclStart | BoundKind::InclEndExclStart)
    }

    /// On-disk ordinal for ModernM markers.
    pub fn ordinal(self) -> u8 {
        self as u8
    }

    /// Decode an on-disk ordinal.
    pub fn from_ordinal(v: u8) -> Option<Self> {
        Some(match v {
            0 => BoundKind::ExclEnd,
            1 => BoundKind::InclStart,
            2 => BoundKind::ExclEndInclStart,
            3 => BoundKind::StaticClustering,
            4 => BoundKind::Clustering,
            5 => BoundKind::InclEndExclStart,
            6 => BoundKind::InclEnd,
            7 => BoundKind::ExclStart,
            _ => return None,
        })
    }

    /// Relative position of this bound against the rows at its own prefix:
    /// negative sorts before them, positive after.
    pub fn weight(self) -> i8 {
        match self {
            BoundKind::ExclEnd | BoundKind::InclStart | BoundKind::ExclEndInclStart => -1,
            BoundKind::StaticClustering => -2,
            BoundKind::Clustering => 0,
            BoundKind::InclEndExclStart | BoundKind::InclEnd | BoundKind::ExclStart => 1,
        }
    }
}

/// A range-tombstone bound: a clustering prefix plus a kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusteringBound {
    /// The prefix the bound sits at.
    pub prefix: ClusteringPrefix,
    /// Which side of the prefix, and inclusivity.
    pub kind: BoundKind,
}

impl ClusteringBound {
    /// Inclusive start bound at `prefix`.
    pub fn incl_start(prefix: ClusteringPrefix) -> Self {
        Self { prefix, kind: BoundKind::InclStart }
    }

    /// Exclusive start bound at `prefix`.
    pub fn excl_start(prefix: ClusteringPrefix) -> Self {
        Self { prefix, kind: BoundKind::ExclStart }
    }

    /// Inclusive end bound at `prefix`.
    pub fn incl_end(prefix: ClusteringPrefix) -> Self {
        Self { prefix, kind: BoundKind::InclEnd }
    }

    /// Exclusive end bound at `prefix`.
    pub fn excl_end(prefix: ClusteringPrefix) -> Self {
        Self { prefix, kind: BoundKind::ExclEnd }
    }

    /// Position of this bound in the partition.
    pub fn position(&self) -> Position {
        Position {
            prefix: self.prefix.clone(),
            weight: self.kind.weight(),
        }
    }

    /// The bound that abuts this one on the other side: an inclusive start
    /// becomes the exclusive end just before it, and so on. Used when an
    /// interval is cut at another interval's edge.
    pub fn complement(&self) -> ClusteringBound {
        let kind = match self.kind {
            BoundKind::InclStart => BoundKind::ExclEnd,
            BoundKind::ExclStart => BoundKind::InclEnd,
            BoundKind::InclEnd => BoundKind::ExclStart,
            BoundKind::ExclEnd => BoundKind::InclStart,
            other => other,
        };
        ClusteringBound { prefix: self.prefix.clone(), kind }
    }
}

/// A position within a partition's clustering order: a prefix plus a weight
/// placing it before (`< 0`), at (`0`) or after (`> 0`) the rows sharing the
/// prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Position {
    /// The clustering prefix.
    pub prefix: ClusteringPrefix,
    /// Relative placement against rows at `prefix`.
    pub weight: i8,
}

impl Position {
    /// Position before every row.
    pub fn before_all() -> Self {
        Self { prefix: ClusteringPrefix::empty(), weight: -1 }
    }

    /// Position after every row.
    pub fn after_all() -> Self {
        Self { prefix: ClusteringPrefix::empty(), weight: 1 }
    }

    /// The position of a full clustering row.
    pub fn at(prefix: ClusteringPrefix) -> Self {
        Self { prefix, weight: 0 }
    }

    /// The position just after a clustering row.
    pub fn after(prefix: ClusteringPrefix) -> Self {
        Self { prefix, weight: 1 }
    }
}

/// A range tombstone: deletion applying to a clustering interval.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeTombstone {
    /// Start of the deleted interval.
    pub start: ClusteringBound,
    /// End of the deleted interval.
    pub end: ClusteringBound,
    /// The deletion applying inside.
    pub tombstone: Tombstone,
}

// ------------------------------------------------------------------------------------------------
// Rows and partition events
// ------------------------------------------------------------------------------------------------

/// A regular (clustered) row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusteringRow {
    /// The full clustering key.
    pub clustering: ClusteringPrefix,
    /// Row marker, when present.
    pub marker: Option<LivenessInfo>,
    /// Row deletion, when present.
    pub deletion: Option<RowDeletion>,
    /// Cells keyed by regular column name.
    pub cells: RowCells,
}

/// The per-partition static row.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StaticRow {
    /// Cells keyed by static column name.
    pub cells: RowCells,
}

/// One event of the fully-ordered mutation stream.
#[derive(Debug, Clone, PartialEq)]
pub enum PartitionEvent {
    /// Opens a partition. `tombstone` is [`Tombstone::NONE`] when the
    /// partition is not deleted.
    PartitionStart {
        /// The partition's decorated key.
        key: DecoratedKey,
        /// Partition-level deletion.
        tombstone: Tombstone,
    },
    /// The static row; at most one, right after the partition start.
    Static(StaticRow),
    /// A clustering row.
    Row(ClusteringRow),
    /// A range tombstone.
    RangeTombstone(RangeTombstone),
    /// Closes the current partition.
    PartitionEnd,
}

// ------------------------------------------------------------------------------------------------
// Column types and schema
// ------------------------------------------------------------------------------------------------

/// Element type of a column, supplying comparison and width hints. Full type
/// (de)serialization lives outside the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColumnType {
    /// 32-bit signed integer, fixed width 4.
    Int32,
    /// 64-bit signed integer, fixed width 8.
    BigInt,
    /// Boolean, fixed width 1.
    Boolean,
    /// IEEE-754 double, fixed width 8.
    Double,
    /// Millisecond timestamp, fixed width 8.
    Timestamp,
    /// UUID, fixed width 16.
    Uuid,
    /// UTF-8 text, variable width.
    Text,
    /// Opaque bytes, variable width.
    Blob,
    /// IPv4 or IPv6 address, variable width (4 or 16 bytes).
    Inet,
    /// Distributed counter, variable width (shard set).
    Counter,
}

impl ColumnType {
    /// Fixed on-disk width, or `None` for variable-width types.
    pub fn fixed_len(self) -> Option<usize> {
        match self {
            ColumnType::Int32 => Some(4),
            ColumnType::BigInt | ColumnType::Double | ColumnType::Timestamp => Some(8),
            ColumnType::Boolean => Some(1),
            ColumnType::Uuid => Some(16),
            ColumnType::Text | ColumnType::Blob | ColumnType::Inet | ColumnType::Counter => None,
        }
    }

    /// Stable name recorded in the serialization header.
    pub fn name(self) -> &'static str {
        match self {
            ColumnType::Int32 => "int32",
            ColumnType::BigInt => "bigint",
            ColumnType::Boolean => "boolean",
            ColumnType::Double => "double",
            ColumnType::Timestamp => "timestamp",
            ColumnType::Uuid => "uuid",
            ColumnType::Text => "text",
            ColumnType::Blob => "blob",
            ColumnType::Inet => "inet",
            ColumnType::Counter => "counter",
        }
    }

    /// Reverse of [`ColumnType::name`].
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "int32" => ColumnType::Int32,
            "bigint" => ColumnType::BigInt,
            "boolean" => ColumnType::Boolean,
            "double" => ColumnType::Double,
            "timestamp" => ColumnType::Timestamp,
            "uuid" => ColumnType::Uuid,
            "text" => ColumnType::Text,
            "blob" => ColumnType::Blob,
            "inet" => ColumnType::Inet,
            "counter" => ColumnType::Counter,
            _ => return None,
        })
    }

    /// Compare two serialized values of this type. Empty values sort before
    /// everything else.
    pub fn compare(self, a: &[u8], b: &[u8]) -> Ordering {
        match (a.is_empty(), b.is_empty()) {
            (true, true) => return Ordering::Equal,
            (true, false) => return Ordering::Less,
            (false, true) => return Ordering::Greater,
            _ => {}
        }
        match self {
            ColumnType::Int32 => decode_i32(a).cmp(&decode_i32(b)),
            ColumnType::BigInt | ColumnType::Timestamp => decode_i64(a).cmp(&decode_i64(b)),
            ColumnType::Double => {
                let (x, y) = (decode_f64(a), decode_f64(b));
                x.partial_cmp(&y).unwrap_or_else(|| a.cmp(b))
            }
            _ => a.cmp(b),
        }
    }
}

fn decode_i32(b: &[u8]) -> i32 {
    let mut buf = [0u8; 4];
    let n = b.len().min(4);
    buf[4 - n..].copy_from_slice(&b[..n]);
    i32::from_be_bytes(buf)
}

fn decode_i64(b: &[u8]) -> i64 {
    let mut buf = [0u8; 8];
    let n = b.len().min(8);
    buf[8 - n..].copy_from_slice(&b[..n]);
    i64::from_be_bytes(buf)
}

fn decode_f64(b: &[u8]) -> f64 {
    f64::from_bits(decode_i64(b) as u64)
}

/// Definition of one non-key column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    /// Column name bytes.
    pub name: Vec<u8>,
    /// Element type.
    pub column_type: ColumnType,
    /// Whether the column is multi-cell (a collection).
    pub complex: bool,
}

impl ColumnDef {
    /// An atomic column.
    pub fn atomic(name: &[u8], column_type: ColumnType) -> Self {
        Self { name: name.to_vec(), column_type, complex: false }
    }

    /// A multi-cell column.
    pub fn collection(name: &[u8], column_type: ColumnType) -> Self {
        Self { name: name.to_vec(), column_type, complex: true }
    }
}

/// The slice of schema the engine needs: names, comparators, column sets and
/// a couple of tuning knobs. Shared by reference; immutable once built.
#[derive(Debug, Clone)]
pub struct Schema {
    /// Keyspace name (directory-level identity).
    pub keyspace: String,
    /// Table name.
    pub table: String,
    /// Partition key type.
    pub partition_key_type: ColumnType,
    /// Types of the clustering components, in order.
    pub clustering_types: Vec<ColumnType>,
    /// Static columns sorted by name.
    pub static_columns: Vec<ColumnDef>,
    /// Regular columns sorted by name.
    pub regular_columns: Vec<ColumnDef>,
    /// Minimum index sampling interval for the summary.
    pub min_index_interval: u32,
    /// Bloom filter false-positive chance.
    pub bloom_filter_fp_chance: f64,
    /// Whether the clustering is compound (more than one component, or
    /// declared compound). Non-compound schemas hit the legacy
    /// range-tombstone encoding quirk.
    pub compound: bool,
}

impl Schema {
    /// Build a schema, sorting the column sets by name.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        keyspace: &str,
        table: &str,
        partition_key_type: ColumnType,
        clustering_types: Vec<ColumnType>,
        mut static_columns: Vec<ColumnDef>,
        mut regular_columns: Vec<ColumnDef>,
    ) -> Arc<Self> {
        static_columns.sort_by(|a, b| a.name.cmp(&b.name));
        regular_columns.sort_by(|a, b| a.name.cmp(&b.name));
        Arc::new(Self {
            keyspace: keyspace.to_string(),
            table: table.to_string(),
            partition_key_type,
            clustering_types,
            static_columns,
            regular_columns,
            min_index_interval: 128,
            bloom_filter_fp_chance: 0.01,
            compound: true,
        })
    }

    /// Mark the clustering non-compound (single bare component, as ancient
    /// tables declared it). Only such schemas hit the legacy
    /// range-tombstone encoding quirk.
    pub fn into_non_compound(self: Arc<Self>) -> Arc<Self> {
        let mut schema = (*self).clone();
        schema.compound = false;
        Arc::new(schema)
    }

    /// Whether the table has a clustering key at all.
    pub fn has_clustering(&self) -> bool {
        !self.clustering_types.is_empty()
    }

    /// The column set for a row kind.
    pub fn columns(&self, is_static: bool) -> &[ColumnDef] {
        if is_static {
            &self.static_columns
        } else {
            &self.regular_columns
        }
    }

    /// Index of `name` in the column set for a row kind.
    pub fn column_index(&self, is_static: bool, name: &[u8]) -> Option<usize> {
        self.columns(is_static)
            .binary_search_by(|c| c.name.as_slice().cmp(name))
            .ok()
    }

    /// Compare two clustering prefixes component-wise with the schema's
    /// comparators. A strict prefix compares equal on the shared length.
    pub fn compare_prefix_components(
        &self,
        a: &ClusteringPrefix,
        b: &ClusteringPrefix,
    ) -> Ordering {
        let shared = a.len().min(b.len());
        for i in 0..shared {
            let ty = self
                .clustering_types
                .get(i)
                .copied()
                .unwrap_or(ColumnType::Blob);
            match ty.compare(&a.components[i], &b.components[i]) {
                Ordering::Equal => continue,
                other => return other,
            }
        }
        Ordering::Equal
    }

    /// Total order over positions in a partition.
    pub fn compare_positions(&self, a: &Position, b: &Position) -> Ordering {
        match self.compare_prefix_components(&a.prefix, &b.prefix) {
            Ordering::Equal => {}
            other => return other,
        }
        if a.prefix.len() == b.prefix.len() {
            return a.weight.cmp(&b.weight);
        }
        // One prefix is strictly shorter: its weight against the longer
        // prefix's rows decides.
        if a.prefix.len() < b.prefix.len() {
            if a.weight <= 0 {
                Ordering::Less
            } else {
                Ordering::Greater
            }
        } else if b.weight <= 0 {
            Ordering::Greater
        } else {
            Ordering::Less
        }
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ------------------------------------------------------------------------------------------------
// Range-tombstone accumulator
// ------------------------------------------------------------------------------------------------

/// Merges overlapping range tombstones across one partition and hands them
/// to the writer sorted and overlap-free.
///
/// Logically a priority queue ordered by start bound with merge-on-insert:
/// the set is kept as sorted, non-overlapping intervals; inserting a new
/// tombstone splits intervals at the overlap edges and keeps the newer
/// tombstone in the overlapped stretch. The writer drains the set up to each
/// row's position before writing the row.
pub struct RangeTombstoneAccumulator {
    schema: Arc<Schema>,
    /// Sorted by start position, pairwise disjoint.
    ranges: Vec<RangeTombstone>,
}

impl RangeTombstoneAccumulator {
    /// An empty accumulator for one partition.
    pub fn new(schema: Arc<Schema>) -> Self {
        Self { schema, ranges: Vec::new() }
    }

    /// Whether nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    fn cmp_pos(&self, a: &Position, b: &Position) -> Ordering {
        self.schema.compare_positions(a, b)
    }

    /// Insert a range tombstone, merging against the buffered set.
    pub fn apply(&mut self, new: RangeTombstone) {
        let mut result: Vec<RangeTombstone> = Vec::with_capacity(self.ranges.len() + 1);
        let mut pending: Option<RangeTombstone> = Some(new);

        for old in std::mem::take(&mut self.ranges) {
            let Some(cur) = pending.take() else {
                result.push(old);
                continue;
            };
            let cur_start = cur.start.position();
            let cur_end = cur.end.position();
            let old_start = old.start.position();
            let old_end = old.end.position();

            if self.cmp_pos(&cur_end, &old_start) == Ordering::Less {
                // cur entirely before old
                result.push(cur);
                result.push(old);
                pending = None;
                continue;
            }
            if self.cmp_pos(&old_end, &cur_start) == Ordering::Less {
                // old entirely before cur
                result.push(old);
                pending = Some(cur);
                continue;
            }

            // Overlap. Split into up to three stretches; the newer tombstone
            // wins where both apply.
            let winner_is_new = cur.tombstone.timestamp >= old.tombstone.timestamp;

            // Leading non-overlapped stretch.
            match self.cmp_pos(&old_start, &cur_start) {
                Ordering::Less => {
                    // old starts first
                    result.push(RangeTombstone {
                        start: old.start.clone(),
                        end: cur.start.complement(),
                        tombstone: old.tombstone,
                    });
                }
                Ordering::Greater => {
                    result.push(RangeTombstone {
                        start: cur.start.clone(),
                        end: old.start.complement(),
                        tombstone: cur.tombstone,
                    });
                }
                Ordering::Equal => {}
            }

            // Overlapped stretch plus the trailing remainder.
            let overlap_start = if self.cmp_pos(&old_start, &cur_start) == Ordering::Less {
                cur.start.clone()
            } else {
                old.start.clone()
            };
            match self.cmp_pos(&cur_end, &old_end) {
                Ordering::Less => {
                    // old extends past cur
                    result.push(RangeTombstone {
                        start: overlap_start,
                        end: cur.end.clone(),
                        tombstone: if winner_is_new { cur.tombstone } else { old.tombstone },
                    });
                    pending = None;
                    result.push(RangeTombstone {
                        start: cur.end.complement(),
                        end: old.end.clone(),
                        tombstone: old.tombstone,
                    });
                }
                Ordering::Greater => {
                    // cur extends past old; keep scanning with the remainder
                    result.push(RangeTombstone {
                        start: overlap_start,
                        end: old.end.clone(),
                        tombstone: if winner_is_new { cur.tombstone } else { old.tombstone },
                    });
                    pending = Some(RangeTombstone {
                        start: old.end.complement(),
                        end: cur.end.clone(),
                        tombstone: cur.tombstone,
                    });
                }
                Ordering::Equal => {
                    result.push(RangeTombstone {
                        start: overlap_start,
                        end: cur.end.clone(),
                        tombstone: if winner_is_new { cur.tombstone } else { old.tombstone },
                    });
                    pending = None;
                }
            }
        }
        if let Some(cur) = pending {
            result.push(cur);
        }
        // Coalesce adjacent stretches carrying the same tombstone.
        let mut merged: Vec<RangeTombstone> = Vec::with_capacity(result.len());
        for rt in result {
            if let Some(last) = merged.last_mut() {
                if last.tombstone == rt.tombstone
                    && last.end.complement() == rt.start
                {
                    last.end = rt.end;
                    continue;
                }
            }
            merged.push(rt);
        }
        self.ranges = merged;
    }

    /// Remove and return every buffered tombstone whose start precedes
    /// `pos`, in order.
    pub fn drain_up_to(&mut self, pos: &Position) -> Vec<RangeTombstone> {
        let cut = self
            .ranges
            .iter()
            .position(|rt| self.cmp_pos(&rt.start.position(), pos) != Ordering::Less)
            .unwrap_or(self.ranges.len());
        self.ranges.drain(..cut).collect()
    }

    /// Remove and return everything buffered, in order.
    pub fn drain_all(&mut self) -> Vec<RangeTombstone> {
        std::mem::take(&mut self.ranges)
    }
}
