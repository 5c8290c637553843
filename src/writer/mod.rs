//! The writer pipeline: consumes a fully-ordered mutation stream and emits
//! every component of one SSTable in lockstep.
//!
//! One public facade, [`SstableWriter`], fronts two implementations picked
//! by version at construction: the row-grouped `mc` writer and the
//! column-oriented `ka`/`la` writer. Downstream code never branches on
//! version.
//!
//! While the data file grows the pipeline simultaneously maintains the
//! external index with per-partition promoted indexes, the summary sample,
//! the Bloom filter, min/max statistics, the per-chunk checksum table (or
//! the compression chunk map) and the large-partition report. Sealing is
//! transactional: no component is finalized before data and index are
//! closed and flushed, and the `TemporaryTOC` → `TOC` rename is the single
//! atomic publication point.

#[cfg(test)]
mod tests;

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::components::checksum::{ChecksumType, ChecksummedWriter, CrcComponent, Digest};
use crate::components::compression::{CompressedWriter, CompressionInfo, Compressor};
use crate::components::filter::{Filter, FilterFormat};
use crate::components::scylla::{Features, LargeDataEntry, ScyllaMetadata};
use crate::components::statistics::{
    CompactionMetadata, EncodingStats, ReplayPosition, SerializationHeaderMetadata, Statistics,
    StatsMetadata, ValidationMetadata,
};
use crate::components::summary::{SamplingState, Summary, DEFAULT_SUMMARY_BYTE_COST};
use crate::components::{sync_directory, ComponentType, Descriptor, Toc};
use crate::data::legacy::LegacySerializer;
use crate::data::modern::{ModernSerializer, RtMarker};
use crate::error::{Result, SstableError};
use crate::index::{
    serialize_legacy_promoted_index, serialize_promoted_index, BlockBound, IndexWriter,
    PromotedIndexBuilder,
};
use crate::model::{
    BoundKind, ClusteringBound, ClusteringRow, DecoratedKey, PartitionEvent, Partitioner,
    Position, RangeTombstone, RangeTombstoneAccumulator, Schema, StaticRow, Tombstone,
};

/// Default promoted-index block size.
pub const DEFAULT_PROMOTED_INDEX_BLOCK_SIZE: u64 = 64 * 1024;

// ------------------------------------------------------------------------------------------------
// Configuration and collaborator seams
// ------------------------------------------------------------------------------------------------

/// Called when a partition exceeds the configured size threshold.
pub trait LargePartitionHandler: Send + Sync {
    /// Report one oversized partition.
    fn on_large_partition(&self, key: &[u8], size: u64);
}

/// Default handler: log and move on.
pub struct LoggingLargePartitionHandler;

impl LargePartitionHandler for LoggingLargePartitionHandler {
    fn on_large_partition(&self, key: &[u8], size: u64) {
        warn!(key_len = key.len(), size, "writing large partition");
    }
}

/// Observer of writer lifecycle milestones.
pub trait WriteMonitor: Send + Sync {
    /// The writer was created and files are open.
    fn on_write_started(&self) {}
    /// The data and index files are closed and durable.
    fn on_data_write_completed(&self) {}
    /// Every component is written and the TOC is published.
    fn on_write_completed(&self) {}
    /// The final directory flush happened.
    fn on_flush_completed(&self) {}
}

/// Monitor that ignores everything.
pub struct NullWriteMonitor;

impl WriteMonitor for NullWriteMonitor {}

/// Writer configuration, passed by value at construction.
pub struct WriterConfig {
    /// Cap on the (published) data-file size; end-of-partition requests
    /// segmentation when reached.
    pub max_sstable_size: u64,
    /// Desired bytes between promoted-index samples.
    pub promoted_index_block_size: u64,
    /// When false, non-compound range-tombstone bounds use the historical
    /// broken encoding for interop with older peers.
    pub correctly_serialize_non_compound_range_tombstones: bool,
    /// Skip the TOC rename (test support).
    pub leave_unsealed: bool,
    /// Hard-link every component into `<dir>/backups/` after sealing.
    pub backup: bool,
    /// Commit-log replay watermark recorded in the Stats metadata.
    pub replay_position: Option<ReplayPosition>,
    /// Partition size that triggers the large-partition handler.
    pub large_partition_threshold: u64,
    /// Compressor for the data file; `None` writes the CRC component
    /// instead.
    pub compressor: Option<Compressor>,
    /// Uncompressed chunk length for both checksum table and compression.
    pub chunk_length: u32,
    /// Encoding minima snapshot the `mc` deltas are measured against.
    pub encoding_stats: EncodingStats,
    /// Extent pre-allocation hint for data and index files.
    pub sloppy_size: u64,
    /// Large-partition reporter.
    pub large_partition_handler: Arc<dyn LargePartitionHandler>,
    /// Lifecycle observer.
    pub monitor: Arc<dyn WriteMonitor>,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            max_sstable_size: u64::MAX,
            promoted_index_block_size: DEFAULT_PROMOTED_INDEX_BLOCK_SIZE,
            correctly_serialize_non_compound_range_tombstones: true,
            leave_unsealed: false,
            backup: false,
            replay_position: None,
            large_partition_threshold: u64::MAX,
            compressor: None,
            chunk_length: crate::components::checksum::DEFAULT_CHUNK_LEN,
            encoding_stats: EncodingStats::default(),
            sloppy_size: 0,
            large_partition_handler: Arc::new(LoggingLargePartitionHandler),
            monitor: Arc::new(NullWriteMonitor),
        }
    }
}

/// Whether the driving loop should start a new generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopIteration {
    /// Keep feeding this writer.
    No,
    /// The size cap was reached; seal and move on.
    Yes,
}

// ------------------------------------------------------------------------------------------------
// Data sink
// ------------------------------------------------------------------------------------------------

/// The data file behind either the checksummed or the compressed path.
enum DataSink {
    Plain(ChecksummedWriter<BufWriter<File>>),
    Compressed(CompressedWriter<BufWriter<File>>),
}

/// What the data sink produced at close.
enum DataSinkOutputs {
    Plain(CrcComponent, Digest),
    Compressed(CompressionInfo, Digest),
}

impl DataSink {
    /// Offset in uncompressed coordinates; rows and the index use this.
    fn offset(&self) -> u64 {
        match self {
            DataSink::Plain(w) => w.offset(),
            DataSink::Compressed(w) => w.offset(),
        }
    }

    /// Offset in on-disk coordinates; summary sampling and the size cap
    /// use this.
    fn published_offset(&self) -> u64 {
        match self {
            DataSink::Plain(w) => w.offset(),
            DataSink::Compressed(w) => w.compressed_file_length(),
        }
    }

    /// Close the sink, returning the inner writer, the physical bytes
    /// written, and the checksum or compression outputs.
    fn finish(self) -> Result<(BufWriter<File>, u64, DataSinkOutputs)> {
        match self {
            DataSink::Plain(w) => {
                let len = w.offset();
                let (inner, crc, digest) = w.finish();
                Ok((inner, len, DataSinkOutputs::Plain(crc, digest)))
            }
            DataSink::Compressed(w) => {
                let (inner, info, digest, len) = w.finish()?;
                Ok((inner, len, DataSinkOutputs::Compressed(info, digest)))
            }
        }
    }
}

impl Write for DataSink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            DataSink::Plain(w) => w.write(buf),
            DataSink::Compressed(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            DataSink::Plain(w) => w.flush(),
            DataSink::Compressed(w) => w.flush(),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Shared writer state
// ------------------------------------------------------------------------------------------------

/// Everything both implementations maintain identically.
struct WriterCommon {
    desc: Descriptor,
    schema: Arc<Schema>,
    partitioner: Arc<dyn Partitioner>,
    config: WriterConfig,

    sink: DataSink,
    index: IndexWriter<BufWriter<File>>,

    summary: Summary,
    sampling: SamplingState,
    filter: Filter,
    stats: StatsMetadata,
    scylla: ScyllaMetadata,
    large_partitions: Vec<LargeDataEntry>,

    first_key: Option<Vec<u8>>,
    last_key: Option<Vec<u8>>,

    // per-partition state
    partition_key: Option<DecoratedKey>,
    partition_start: u64,
    partition_tombstone: Tombstone,
    tombstone_written: bool,
    static_row_written: bool,
    partition_header_length: Option<u64>,
    prev_unfiltered_size: u64,
    accumulator: RangeTombstoneAccumulator,
    pi_builder: PromotedIndexBuilder,
}

fn write_component(desc: &Descriptor, component: ComponentType, bytes: &[u8]) -> Result<()> {
    let path = desc.path(&component);
    let mut file = OpenOptions::new().write(true).create_new(true).open(&path)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    Ok(())
}

fn create_file(desc: &Descriptor, component: ComponentType, sloppy_size: u64) -> Result<File> {
    let path = desc.path(&component);
    let file = OpenOptions::new().write(true).create_new(true).open(&path)?;
    if sloppy_size > 0 {
        // extent hint; trimmed back at seal
        file.set_len(sloppy_size)?;
    }
    Ok(file)
}

impl WriterCommon {
    fn new(
        desc: Descriptor,
        schema: Arc<Schema>,
        partitioner: Arc<dyn Partitioner>,
        estimated_partitions: u64,
        config: WriterConfig,
    ) -> Result<Self> {
        let data_file = create_file(&desc, ComponentType::Data, config.sloppy_size)?;
        let index_file = create_file(&desc, ComponentType::Index, config.sloppy_size)?;

        let sink = match config.compressor {
            Some(compressor) => DataSink::Compressed(CompressedWriter::new(
                BufWriter::new(data_file),
                compressor,
                config.chunk_length,
            )),
            None => DataSink::Plain(ChecksummedWriter::new(
                BufWriter::new(data_file),
                ChecksumType::for_version(desc.version),
                config.chunk_length,
            )),
        };

        let mut summary = Summary::default();
        summary.prepare(estimated_partitions.max(1), schema.min_index_interval)?;
        let filter = Filter::new(
            estimated_partitions.max(1),
            schema.bloom_filter_fp_chance,
            FilterFormat::for_version(desc.version),
        )?;
        let mut stats = StatsMetadata::default();
        if let Some(position) = config.replay_position {
            stats.position = position;
        }

        let accumulator = RangeTombstoneAccumulator::new(schema.clone());
        let pi_builder = PromotedIndexBuilder::new(config.promoted_index_block_size);

        config.monitor.on_write_started();
        info!(
            generation = desc.generation,
            version = desc.version.as_str(),
            "sstable write started"
        );

        Ok(Self {
            desc,
            schema,
            partitioner,
            config,
            sink,
            index: IndexWriter::new(BufWriter::new(index_file)),
            summary,
            sampling: SamplingState {
                summary_byte_cost: DEFAULT_SUMMARY_BYTE_COST,
                ..Default::default()
            },
            filter,
            stats,
            scylla: ScyllaMetadata::default(),
            large_partitions: Vec::new(),
            first_key: None,
            last_key: None,
            partition_key: None,
            partition_start: 0,
            partition_tombstone: Tombstone::NONE,
            tombstone_written: false,
            static_row_written: false,
            partition_header_length: None,
            prev_unfiltered_size: 0,
            accumulator,
            pi_builder,
        })
    }

    fn begin_partition(&mut self, key: &DecoratedKey) {
        self.partition_start = self.sink.offset();
        self.partition_key = Some(key.clone());
        self.partition_tombstone = Tombstone::NONE;
        self.tombstone_written = false;
        self.static_row_written = false;
        self.partition_header_length = None;
        self.prev_unfiltered_size = 0;
        self.pi_builder = PromotedIndexBuilder::new(self.config.promoted_index_block_size);
        self.filter.add(&key.key);
        if self.first_key.is_none() {
            self.first_key = Some(key.key.clone());
        }
        self.last_key = Some(key.key.clone());
    }

    /// Offset relative to the first byte after the partition header.
    fn content_relative_offset(&self) -> u64 {
        let header_len = self.partition_header_length.unwrap_or(0);
        self.sink.offset() - self.partition_start - header_len
    }

    fn freeze_partition_header_length(&mut self) {
        if self.partition_header_length.is_none() {
            self.partition_header_length = Some(self.sink.offset() - self.partition_start);
        }
    }

    fn track_tombstone(&mut self, t: Tombstone) {
        if t.is_live() {
            return;
        }
        self.stats.min_timestamp = self.stats.min_timestamp.min(t.timestamp);
        self.stats.max_timestamp = self.stats.max_timestamp.max(t.timestamp);
        self.stats.min_local_deletion_time =
            self.stats.min_local_deletion_time.min(t.deletion_time);
        self.stats.max_local_deletion_time =
            self.stats.max_local_deletion_time.max(t.deletion_time);
        self.stats
            .estimated_tombstone_drop_time
            .add(t.deletion_time as f64);
    }

    fn track_row(&mut self, row: &ClusteringRow) {
        self.stats.rows_count += 1;
        if let Some(l) = &row.marker {
            self.stats.min_timestamp = self.stats.min_timestamp.min(l.timestamp);
            self.stats.max_timestamp = self.stats.max_timestamp.max(l.timestamp);
            if let Some(ttl) = l.ttl {
                self.stats.min_ttl = self.stats.min_ttl.min(ttl);
                self.stats.max_ttl = self.stats.max_ttl.max(ttl);
            }
        }
        if let Some(d) = &row.deletion {
            self.track_tombstone(d.tombstone);
        }
        self.track_cells(&row.cells);
        self.track_clustering(&row.clustering);
    }

    fn track_cells(&mut self, cells: &crate::model::RowCells) {
        use crate::model::{Cell, ColumnValue};
        let mut track_cell = |cell: &Cell| {
            self.stats.columns_count += 1;
            let ts = cell.timestamp();
            self.stats.min_timestamp = self.stats.min_timestamp.min(ts);
            self.stats.max_timestamp = self.stats.max_timestamp.max(ts);
            match cell {
                Cell::Tombstone { local_deletion_time, .. } => {
                    self.stats.min_local_deletion_time =
                        self.stats.min_local_deletion_time.min(*local_deletion_time);
                    self.stats.max_local_deletion_time =
                        self.stats.max_local_deletion_time.max(*local_deletion_time);
                    self.stats
                        .estimated_tombstone_drop_time
                        .add(*local_deletion_time as f64);
                }
                Cell::Live { ttl: Some(ttl), expiry, .. } => {
                    self.stats.min_ttl = self.stats.min_ttl.min(*ttl);
                    self.stats.max_ttl = self.stats.max_ttl.max(*ttl);
                    if let Some(e) = expiry {
                        self.stats.min_local_deletion_time =
                            self.stats.min_local_deletion_time.min(*e);
                        self.stats.max_local_deletion_time =
                            self.stats.max_local_deletion_time.max(*e);
                    }
                }
                _ => {}
            }
        };
        for value in cells.values() {
            match value {
                ColumnValue::Atomic(cell) => track_cell(cell),
                ColumnValue::Complex(complex) => {
                    for (_, cell) in &complex.cells {
                        track_cell(cell);
                    }
                }
            }
        }
    }

    fn track_clustering(&mut self, prefix: &crate::model::ClusteringPrefix) {
        for (i, component) in prefix.components.iter().enumerate() {
            let ty = self
                .schema
                .clustering_types
                .get(i)
                .copied()
                .unwrap_or(crate::model::ColumnType::Blob);
            match self.stats.min_column_names.get_mut(i) {
                Some(current) => {
                    if ty.compare(component, current) == std::cmp::Ordering::Less {
                        *current = component.clone();
                    }
                }
                None => self.stats.min_column_names.push(component.clone()),
            }
            match self.stats.max_column_names.get_mut(i) {
                Some(current) => {
                    if ty.compare(component, current) == std::cmp::Ordering::Greater {
                        *current = component.clone();
                    }
                }
                None => self.stats.max_column_names.push(component.clone()),
            }
        }
    }

    /// Close out the partition in index, summary and statistics.
    fn finish_partition(&mut self, promoted: &[u8]) -> Result<StopIteration> {
        let key = self
            .partition_key
            .take()
            .ok_or_else(|| SstableError::MalformedSstable("partition end without start".into()))?;

        let index_offset = self.index.offset();
        self.index.append(&key.key, self.partition_start, promoted)?;
        self.summary.maybe_add_entry(
            key.token,
            &key.key,
            self.sink.published_offset(),
            index_offset,
            &mut self.sampling,
        );

        let partition_size = self.sink.offset() - self.partition_start;
        self.stats.estimated_partition_size.add(partition_size);
        if partition_size >= self.config.large_partition_threshold {
            self.config
                .large_partition_handler
                .on_large_partition(&key.key, partition_size);
            self.large_partitions.push(LargeDataEntry {
                key: key.key.clone(),
                size: partition_size,
            });
        }

        if self.sink.published_offset() >= self.config.max_sstable_size {
            debug!(
                generation = self.desc.generation,
                size = self.sink.published_offset(),
                "size cap reached, requesting segmentation"
            );
            return Ok(StopIteration::Yes);
        }
        Ok(StopIteration::No)
    }

    /// The transactional seal shared by both implementations.
    fn seal(self, serialization_header: Option<SerializationHeaderMetadata>) -> Result<()> {
        let WriterCommon {
            desc,
            schema,
            partitioner,
            config,
            sink,
            index,
            mut summary,
            sampling,
            filter,
            mut stats,
            mut scylla,
            large_partitions,
            first_key,
            last_key,
            ..
        } = self;

        // 1. close data and index files, trimming the extent hints
        let (data_buf, physical_len, outputs) = sink.finish()?;
        let data_file = data_buf
            .into_inner()
            .map_err(|e| SstableError::Io(e.into_error()))?;
        if config.sloppy_size > physical_len {
            data_file.set_len(physical_len)?;
        }
        data_file.sync_all()?;

        let index_len = index.offset();
        let index_buf = index.finish()?;
        let index_file = index_buf
            .into_inner()
            .map_err(|e| SstableError::Io(e.into_error()))?;
        if config.sloppy_size > index_len {
            index_file.set_len(index_len)?;
        }
        index_file.sync_all()?;
        config.monitor.on_data_write_completed();

        // 2. seal the summary
        let first_key = first_key.ok_or_else(|| {
            SstableError::MalformedSstable("sealing an sstable with no partitions".into())
        })?;
        summary.seal(first_key, last_key, &sampling);

        // 3. assemble statistics
        let compressed = matches!(outputs, DataSinkOutputs::Compressed(_, _));
        if let DataSinkOutputs::Compressed(info, _) = &outputs {
            if info.data_length > 0 {
                stats.compression_ratio = physical_len as f64 / info.data_length as f64;
            }
        }
        let statistics = Statistics {
            validation: Some(ValidationMetadata {
                partitioner_name: partitioner.name().to_string(),
                filter_chance: schema.bloom_filter_fp_chance,
            }),
            compaction: Some(CompactionMetadata::default()),
            stats: Some(stats),
            serialization_header,
        };

        // 4. small components, each created fresh and synced
        let mut buf = Vec::new();
        summary.save(&mut buf)?;
        write_component(&desc, ComponentType::Summary, &buf)?;

        buf.clear();
        filter.save(&mut buf)?;
        write_component(&desc, ComponentType::Filter, &buf)?;

        buf.clear();
        statistics.save(&mut buf, desc.version)?;
        write_component(&desc, ComponentType::Statistics, &buf)?;

        let digest = match &outputs {
            DataSinkOutputs::Plain(crc, digest) => {
                buf.clear();
                crc.save(&mut buf)?;
                write_component(&desc, ComponentType::Crc, &buf)?;
                *digest
            }
            DataSinkOutputs::Compressed(info, digest) => {
                buf.clear();
                info.save(&mut buf)?;
                write_component(&desc, ComponentType::CompressionInfo, &buf)?;
                *digest
            }
        };
        buf.clear();
        digest.save(&mut buf)?;
        write_component(&desc, ComponentType::Digest, &buf)?;

        scylla.features = Some(Features(0));
        if !large_partitions.is_empty() {
            scylla.large_partitions = Some(large_partitions);
        }
        buf.clear();
        scylla.save(&mut buf)?;
        write_component(&desc, ComponentType::Scylla, &buf)?;

        sync_directory(&desc.dir)?;

        // 5. publish
        let toc = Toc::for_write(compressed, true);
        toc.write_temporary(&desc)?;
        if config.leave_unsealed {
            info!(generation = desc.generation, "left unsealed by request");
        } else {
            Toc::publish(&desc)?;
            info!(generation = desc.generation, "sstable sealed");
        }
        config.monitor.on_write_completed();

        // 6. optional hard-link backups; TOC last so a half-made backup is
        // never mistaken for a complete one
        if config.backup && !config.leave_unsealed {
            let backup_dir = desc.dir.join("backups");
            fs::create_dir_all(&backup_dir)?;
            let mut backup_desc = desc.clone();
            backup_desc.dir = backup_dir.clone();
            for component in &toc.components {
                if matches!(component, ComponentType::TemporaryToc | ComponentType::Toc) {
                    continue;
                }
                fs::hard_link(desc.path(component), backup_desc.path(component))?;
            }
            sync_directory(&backup_dir)?;
            fs::hard_link(
                desc.path(&ComponentType::Toc),
                backup_desc.path(&ComponentType::Toc),
            )?;
            sync_directory(&backup_dir)?;
        }

        sync_directory(&desc.dir)?;
        config.monitor.on_flush_completed();
        Ok(())
    }
}

// ------------------------------------------------------------------------------------------------
// The version-specific implementations
// ------------------------------------------------------------------------------------------------

/// The writer protocol both implementations answer to.
trait WriterImpl {
    fn consume_new_partition(&mut self, key: &DecoratedKey) -> Result<()>;
    fn consume_partition_tombstone(&mut self, tombstone: Tombstone) -> Result<()>;
    fn consume_static_row(&mut self, row: &StaticRow) -> Result<()>;
    fn consume_row(&mut self, row: &ClusteringRow) -> Result<()>;
    fn consume_range_tombstone(&mut self, rt: RangeTombstone) -> Result<()>;
    fn consume_end_of_partition(&mut self) -> Result<StopIteration>;
    fn consume_end_of_stream(self: Box<Self>) -> Result<()>;
}

// ---- ModernM -----------------------------------------------------------------------------------

/// A row serializer deltaing against `header`, with the back-compat range
/// tombstone switch applied.
fn serializer_for(header: &SerializationHeaderMetadata, correct_rts: bool) -> ModernSerializer<'_> {
    let mut serializer = ModernSerializer::new(header);
    serializer.correct_non_compound_rts = correct_rts;
    serializer
}

struct ModernWriterImpl {
    common: WriterCommon,
    header: SerializationHeaderMetadata,
    end_open_marker: Option<RtMarker>,
}

impl ModernWriterImpl {
    fn new(common: WriterCommon) -> Self {
        let header = SerializationHeaderMetadata::from_schema(
            &common.schema,
            common.config.encoding_stats,
        );
        Self { common, header, end_open_marker: None }
    }

    fn ensure_tombstone_written(&mut self) -> Result<()> {
        if self.common.tombstone_written {
            return Ok(());
        }
        let key = self
            .common
            .partition_key
            .clone()
            .ok_or_else(|| SstableError::MalformedSstable("write outside a partition".into()))?;
        let tombstone = self.common.partition_tombstone;
        let serializer = ModernSerializer::new(&self.header);
        serializer.write_partition_header(&mut self.common.sink, &key.key, tombstone)?;
        self.common.tombstone_written = true;
        Ok(())
    }

    fn ensure_static_row_written(&mut self) -> Result<()> {
        if self.common.static_row_written || self.common.schema.static_columns.is_empty() {
            return Ok(());
        }
        // a synthetic empty static row keeps the byte layout regular
        self.write_static(&StaticRow::default())
    }

    fn write_static(&mut self, row: &StaticRow) -> Result<()> {
        self.ensure_tombstone_written()?;
        let serializer = ModernSerializer::new(&self.header);
        serializer.write_static_row(&mut self.common.sink, row)?;
        self.common.static_row_written = true;
        Ok(())
    }

    /// Write one marker, maintaining promoted-index state.
    fn write_marker(&mut self, marker: RtMarker) -> Result<()> {
        self.ensure_tombstone_written()?;
        self.ensure_static_row_written()?;
        self.common.freeze_partition_header_length();
        let bound = BlockBound {
            prefix: marker.clustering.clone(),
            kind: marker.kind,
        };
        let start = self.common.content_relative_offset();
        self.common.pi_builder.note_first_clustering(bound.clone(), start);
        let serializer = serializer_for(
            &self.header,
            self.common.config.correctly_serialize_non_compound_range_tombstones,
        );
        let size = serializer.write_rt_marker(
            &mut self.common.sink,
            &marker,
            self.common.prev_unfiltered_size,
        )?;
        self.common.prev_unfiltered_size = size;
        let open = self.end_open_marker.as_ref().map(|m| m.tombstone);
        self.common.pi_builder.note_clustered_written(
            bound,
            self.common.content_relative_offset(),
            open,
        );
        self.common.track_tombstone(marker.tombstone);
        if let Some(t) = marker.boundary_tombstone {
            self.common.track_tombstone(t);
        }
        self.common.track_clustering(&marker.clustering);
        Ok(())
    }

    /// Fold one accumulated range tombstone into markers.
    fn emit_range_tombstone(&mut self, rt: RangeTombstone) -> Result<()> {
        let schema = self.common.schema.clone();
        let new_end = RtMarker {
            clustering: rt.end.prefix.clone(),
            kind: rt.end.kind,
            tombstone: rt.tombstone,
            boundary_tombstone: None,
        };
        match self.end_open_marker.take() {
            None => {
                // the run is open from the start marker on, so expose it
                // before writing in case a block cut lands on the marker
                self.end_open_marker = Some(new_end);
                self.write_marker(RtMarker {
                    clustering: rt.start.prefix.clone(),
                    kind: rt.start.kind,
                    tombstone: rt.tombstone,
                    boundary_tombstone: None,
                })?;
            }
            Some(open) => {
                let open_pos = Position {
                    prefix: open.clustering.clone(),
                    weight: open.kind.weight(),
                };
                let start_pos = rt.start.position();
                match schema.compare_positions(&start_pos, &open_pos) {
                    std::cmp::Ordering::Greater => {
                        // disjoint: close the open run, open the new one
                        self.write_marker(open)?;
                        self.emit_range_tombstone(rt)?;
                    }
                    _ if open.tombstone == rt.tombstone => {
                        // same deletion reaching further: extend silently
                        self.end_open_marker = Some(new_end);
                    }
                    _ => {
                        // adjacent or overlapping runs with different
                        // tombstones: one boundary closes one and opens
                        // the other
                        let kind = match rt.start.kind {
                            BoundKind::InclStart => BoundKind::ExclEndInclStart,
                            _ => BoundKind::InclEndExclStart,
                        };
                        self.end_open_marker = Some(new_end);
                        self.write_marker(RtMarker {
                            clustering: rt.start.prefix.clone(),
                            kind,
                            tombstone: open.tombstone,
                            boundary_tombstone: Some(rt.tombstone),
                        })?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Drain accumulated range tombstones up to `pos` (or all of them),
    /// closing the open run when it ends before `pos`.
    fn drain_tombstones(&mut self, pos: Option<&Position>) -> Result<()> {
        let drained = match pos {
            Some(p) => self.common.accumulator.drain_up_to(p),
            None => self.common.accumulator.drain_all(),
        };
        for rt in drained {
            self.emit_range_tombstone(rt)?;
        }
        let close_open = match (&self.end_open_marker, pos) {
            (Some(open), Some(p)) => {
                let open_pos = Position {
                    prefix: open.clustering.clone(),
                    weight: open.kind.weight(),
                };
                self.common.schema.compare_positions(&open_pos, p) == std::cmp::Ordering::Less
            }
            (Some(_), None) => true,
            (None, _) => false,
        };
        if close_open {
            if let Some(open) = self.end_open_marker.take() {
                self.write_marker(open)?;
            }
        }
        Ok(())
    }
}

impl WriterImpl for ModernWriterImpl {
    fn consume_new_partition(&mut self, key: &DecoratedKey) -> Result<()> {
        self.common.begin_partition(key);
        self.end_open_marker = None;
        Ok(())
    }

    fn consume_partition_tombstone(&mut self, tombstone: Tombstone) -> Result<()> {
        self.common.partition_tombstone = tombstone;
        self.common.track_tombstone(tombstone);
        self.ensure_tombstone_written()
    }

    fn consume_static_row(&mut self, row: &StaticRow) -> Result<()> {
        self.common.track_cells(&row.cells);
        self.write_static(row)
    }

    fn consume_row(&mut self, row: &ClusteringRow) -> Result<()> {
        self.drain_tombstones(Some(&Position::after(row.clustering.clone())))?;
        self.ensure_tombstone_written()?;
        self.ensure_static_row_written()?;
        self.common.freeze_partition_header_length();

        let bound = BlockBound {
            prefix: row.clustering.clone(),
            kind: BoundKind::Clustering,
        };
        let start = self.common.content_relative_offset();
        self.common.pi_builder.note_first_clustering(bound.clone(), start);
        let serializer = serializer_for(
            &self.header,
            self.common.config.correctly_serialize_non_compound_range_tombstones,
        );
        let size = serializer.write_clustering_row(
            &mut self.common.sink,
            row,
            self.common.prev_unfiltered_size,
        )?;
        self.common.prev_unfiltered_size = size;
        let open = self.end_open_marker.as_ref().map(|m| m.tombstone);
        self.common.pi_builder.note_clustered_written(
            bound,
            self.common.content_relative_offset(),
            open,
        );
        self.common.track_row(row);
        Ok(())
    }

    fn consume_range_tombstone(&mut self, rt: RangeTombstone) -> Result<()> {
        self.drain_tombstones(Some(&rt.start.position()))?;
        self.common.accumulator.apply(rt);
        Ok(())
    }

    fn consume_end_of_partition(&mut self) -> Result<StopIteration> {
        self.drain_tombstones(None)?;
        self.ensure_tombstone_written()?;
        self.ensure_static_row_written()?;
        self.common.freeze_partition_header_length();

        let serializer = ModernSerializer::new(&self.header);
        serializer.write_end_of_partition(&mut self.common.sink)?;

        let end = self.common.content_relative_offset();
        let builder = std::mem::replace(
            &mut self.common.pi_builder,
            PromotedIndexBuilder::new(self.common.config.promoted_index_block_size),
        );
        let blocks = builder.finish(end);
        let header_len = self.common.partition_header_length.unwrap_or(0);
        let tombstone = self.common.partition_tombstone;
        let promoted = {
            let serializer = serializer_for(
                &self.header,
                self.common.config.correctly_serialize_non_compound_range_tombstones,
            );
            serialize_promoted_index(&serializer, header_len, tombstone, &blocks)?
        };
        self.common.finish_partition(&promoted)
    }

    fn consume_end_of_stream(self: Box<Self>) -> Result<()> {
        let header = self.header.clone();
        self.common.seal(Some(header))
    }
}

// ---- LegacyA / LegacyB -------------------------------------------------------------------------

struct LegacyWriterImpl {
    common: WriterCommon,
}

impl LegacyWriterImpl {
    fn new(common: WriterCommon) -> Self {
        Self { common }
    }

    fn ensure_tombstone_written(&mut self) -> Result<()> {
        if self.common.tombstone_written {
            return Ok(());
        }
        let key = self
            .common
            .partition_key
            .clone()
            .ok_or_else(|| SstableError::MalformedSstable("write outside a partition".into()))?;
        let schema = self.common.schema.clone();
        let serializer = LegacySerializer::new(&schema);
        serializer.write_partition_header(
            &mut self.common.sink,
            &key.key,
            self.common.partition_tombstone,
        )?;
        self.common.tombstone_written = true;
        Ok(())
    }
}

impl WriterImpl for LegacyWriterImpl {
    fn consume_new_partition(&mut self, key: &DecoratedKey) -> Result<()> {
        self.common.begin_partition(key);
        Ok(())
    }

    fn consume_partition_tombstone(&mut self, tombstone: Tombstone) -> Result<()> {
        self.common.partition_tombstone = tombstone;
        self.common.track_tombstone(tombstone);
        self.ensure_tombstone_written()
    }

    fn consume_static_row(&mut self, row: &StaticRow) -> Result<()> {
        self.ensure_tombstone_written()?;
        self.common.track_cells(&row.cells);
        let schema = self.common.schema.clone();
        let serializer = LegacySerializer::new(&schema);
        serializer.write_static_row(&mut self.common.sink, row)?;
        self.common.static_row_written = true;
        self.common.freeze_partition_header_length();
        Ok(())
    }

    fn consume_row(&mut self, row: &ClusteringRow) -> Result<()> {
        // drain everything positioned before this row so markers land in
        // clustering order
        let drained = self
            .common
            .accumulator
            .drain_up_to(&Position::after(row.clustering.clone()));
        self.ensure_tombstone_written()?;
        self.common.freeze_partition_header_length();
        let schema = self.common.schema.clone();
        let serializer = LegacySerializer::new(&schema);
        for rt in drained {
            serializer.write_range_tombstone(&mut self.common.sink, &rt)?;
            self.common.track_tombstone(rt.tombstone);
        }

        let bound = BlockBound {
            prefix: row.clustering.clone(),
            kind: BoundKind::Clustering,
        };
        let start = self.common.content_relative_offset();
        self.common.pi_builder.note_first_clustering(bound.clone(), start);
        serializer.write_clustering_row(&mut self.common.sink, row)?;
        self.common
            .pi_builder
            .note_clustered_written(bound, self.common.content_relative_offset(), None);
        self.common.track_row(row);
        Ok(())
    }

    fn consume_range_tombstone(&mut self, rt: RangeTombstone) -> Result<()> {
        let drained = self.common.accumulator.drain_up_to(&rt.start.position());
        if !drained.is_empty() {
            self.ensure_tombstone_written()?;
            self.common.freeze_partition_header_length();
            let schema = self.common.schema.clone();
            let serializer = LegacySerializer::new(&schema);
            for rt in drained {
                serializer.write_range_tombstone(&mut self.common.sink, &rt)?;
                self.common.track_tombstone(rt.tombstone);
            }
        }
        self.common.accumulator.apply(rt);
        Ok(())
    }

    fn consume_end_of_partition(&mut self) -> Result<StopIteration> {
        self.ensure_tombstone_written()?;
        self.common.freeze_partition_header_length();
        let drained = self.common.accumulator.drain_all();
        let schema = self.common.schema.clone();
        let serializer = LegacySerializer::new(&schema);
        for rt in drained {
            serializer.write_range_tombstone(&mut self.common.sink, &rt)?;
            self.common.track_tombstone(rt.tombstone);
        }
        serializer.write_end_of_partition(&mut self.common.sink)?;

        let end = self.common.content_relative_offset();
        let builder = std::mem::replace(
            &mut self.common.pi_builder,
            PromotedIndexBuilder::new(self.common.config.promoted_index_block_size),
        );
        let blocks = builder.finish(end);
        let named: Vec<(Vec<u8>, Vec<u8>, u64, u64)> = blocks
            .iter()
            .map(|b| {
                let first = compose_legacy_bound(&serializer, &b.first)?;
                let last = compose_legacy_bound(&serializer, &b.last)?;
                Ok((first, last, b.offset, b.width))
            })
            .collect::<Result<_>>()?;
        let promoted =
            serialize_legacy_promoted_index(self.common.partition_tombstone, &named)?;
        self.common.finish_partition(&promoted)
    }

    fn consume_end_of_stream(self: Box<Self>) -> Result<()> {
        self.common.seal(None)
    }
}

fn compose_legacy_bound(
    serializer: &LegacySerializer<'_>,
    bound: &BlockBound,
) -> Result<Vec<u8>> {
    // promoted-index bounds reuse the cell-name composite with the marker
    // column slot empty
    let rt = RangeTombstone {
        start: ClusteringBound {
            prefix: bound.prefix.clone(),
            kind: BoundKind::InclStart,
        },
        end: ClusteringBound {
            prefix: bound.prefix.clone(),
            kind: BoundKind::InclEnd,
        },
        tombstone: Tombstone::NONE,
    };
    let mut buf = Vec::new();
    serializer.write_range_tombstone(&mut buf, &rt)?;
    // the first u16-string in the record is the composed start name
    let len = u16::from_be_bytes([buf[0], buf[1]]) as usize;
    Ok(buf[2..2 + len].to_vec())
}

// ------------------------------------------------------------------------------------------------
// Public facade
// ------------------------------------------------------------------------------------------------

/// Writes one SSTable from a sorted mutation stream.
pub struct SstableWriter {
    inner: Option<Box<dyn WriterImpl>>,
    generation: u64,
}

impl SstableWriter {
    /// Create the writer, opening data and index files exclusively.
    pub fn create(
        desc: Descriptor,
        schema: Arc<Schema>,
        partitioner: Arc<dyn Partitioner>,
        estimated_partitions: u64,
        config: WriterConfig,
    ) -> Result<SstableWriter> {
        let generation = desc.generation;
        let modern = desc.version.is_modern();
        let common = WriterCommon::new(desc, schema, partitioner, estimated_partitions, config)?;
        let inner: Box<dyn WriterImpl> = if modern {
            Box::new(ModernWriterImpl::new(common))
        } else {
            Box::new(LegacyWriterImpl::new(common))
        };
        Ok(SstableWriter { inner: Some(inner), generation })
    }

    fn inner(&mut self) -> Result<&mut Box<dyn WriterImpl>> {
        self.inner
            .as_mut()
            .ok_or_else(|| SstableError::MalformedSstable("writer already sealed".into()))
    }

    /// Open a new partition.
    pub fn consume_new_partition(&mut self, key: &DecoratedKey) -> Result<()> {
        self.inner()?.consume_new_partition(key)
    }

    /// Record the partition tombstone.
    pub fn consume_partition_tombstone(&mut self, tombstone: Tombstone) -> Result<()> {
        self.inner()?.consume_partition_tombstone(tombstone)
    }

    /// Write the static row.
    pub fn consume_static_row(&mut self, row: &StaticRow) -> Result<()> {
        self.inner()?.consume_static_row(row)
    }

    /// Write one clustering row.
    pub fn consume_row(&mut self, row: &ClusteringRow) -> Result<()> {
        self.inner()?.consume_row(row)
    }

    /// Buffer one range tombstone.
    pub fn consume_range_tombstone(&mut self, rt: RangeTombstone) -> Result<()> {
        self.inner()?.consume_range_tombstone(rt)
    }

    /// Close the current partition. [`StopIteration::Yes`] asks the driving
    /// loop to seal and start a new generation.
    pub fn consume_end_of_partition(&mut self) -> Result<StopIteration> {
        self.inner()?.consume_end_of_partition()
    }

    /// Seal the SSTable: flush everything, write the remaining components
    /// and atomically publish the TOC.
    pub fn consume_end_of_stream(mut self) -> Result<()> {
        let inner = self.inner.take().ok_or_else(|| {
            SstableError::MalformedSstable("writer already sealed".into())
        })?;
        inner.consume_end_of_stream().map_err(|e| {
            error!(generation = self.generation, error = %e, "seal failed");
            e
        })
    }

    /// Drive the writer from a stream of events. Ends the stream (and
    /// seals) when the iterator is exhausted.
    pub fn write_stream<I>(mut self, events: I) -> Result<()>
    where
        I: IntoIterator<Item = PartitionEvent>,
    {
        for event in events {
            match event {
                PartitionEvent::PartitionStart { key, tombstone } => {
                    self.consume_new_partition(&key)?;
                    self.consume_partition_tombstone(tombstone)?;
                }
                PartitionEvent::Static(row) => self.consume_static_row(&row)?,
                PartitionEvent::Row(row) => self.consume_row(&row)?,
                PartitionEvent::RangeTombstone(rt) => self.consume_range_tombstone(rt)?,
                PartitionEvent::PartitionEnd => {
                    self.consume_end_of_partition()?;
                }
            }
        }
        self.consume_end_of_stream()
    }
}

impl Drop for SstableWriter {
    fn drop(&mut self) {
        // dropping an unsealed writer abandons the generation; the partial
        // files stay for the startup sweep
        if self.inner.is_some() {
            warn!(
                generation = self.generation,
                "writer dropped before seal; leaving partial generation for sweep"
            );
        }
    }
}
