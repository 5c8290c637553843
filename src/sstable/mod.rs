//! The SSTable lifecycle object.
//!
//! An [`Sstable`] goes through: **create** (identity assigned) →
//! **open-for-write** (exclusive data/index files) → **streaming** (the
//! writer consumes mutations) → **seal** (components finalized, TOC
//! renamed) → **open-for-read** → **read-many** → **close**. The presence
//! of the published `TOC` file alone marks a successfully sealed SSTable;
//! a generation holding only a `TemporaryTOC` is unsealed and reclaimed by
//! the startup sweep.
//!
//! Opening loads the TOC, then Summary (rebuilt from the Index when it
//! fails to parse), Statistics (validated, with broken clustering bounds
//! cleared rather than propagated), Filter (an always-true stand-in when
//! missing), CompressionInfo or CRC, and the Scylla metadata. Reads then
//! go through [`Sstable::read_rows`], [`Sstable::read_range_rows`] and
//! [`Sstable::read_single_partition`].

#[cfg(test)]
mod tests;

use std::fs::{self, File};
use std::io::{BufReader, Cursor, Read, Seek, SeekFrom};
use std::sync::Arc;

use tracing::{info, warn};

use crate::components::checksum::{ChecksumType, ChecksummedReader, CrcComponent, Digest};
use crate::components::compression::{CompressedReader, CompressionInfo};
use crate::components::filter::{Filter, FilterFormat};
use crate::components::scylla::ScyllaMetadata;
use crate::components::statistics::{SerializationHeaderMetadata, Statistics};
use crate::components::summary::{Summary, DEFAULT_SUMMARY_BYTE_COST};
use crate::components::{sync_directory, ComponentType, Descriptor, Toc};
use crate::error::{Result, SstableError};
use crate::index::{parse_promoted_index, IndexReader, PromotedIndex};
use crate::model::{DecoratedKey, PartitionEvent, Partitioner, Schema, Token};
use crate::reader::{
    read_legacy_partition, ClusteringSlice, Forwarding, PartitionReader, ReadDeadline,
};

// ------------------------------------------------------------------------------------------------
// Data source
// ------------------------------------------------------------------------------------------------

/// The data file behind whichever integrity layer the TOC dictates.
pub enum DataSource {
    /// Uncompressed data verified against the CRC component.
    Plain(ChecksummedReader<BufReader<File>>),
    /// Compressed data with in-stream chunk checksums.
    Compressed(CompressedReader<BufReader<File>>),
}

impl DataSource {
    /// Total length in uncompressed coordinates.
    pub fn len(&self) -> u64 {
        match self {
            DataSource::Plain(r) => r.len(),
            DataSource::Compressed(r) => r.len(),
        }
    }

    /// Whether the data file is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Read for DataSource {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            DataSource::Plain(r) => r.read(buf),
            DataSource::Compressed(r) => r.read(buf),
        }
    }
}

impl Seek for DataSource {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        match self {
            DataSource::Plain(r) => r.seek(pos),
            DataSource::Compressed(r) => r.seek(pos),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// The object
// ------------------------------------------------------------------------------------------------

/// Components that can be handed over in memory from a foreign shard
/// instead of being re-parsed from disk.
pub struct LoadedComponents {
    /// Parsed TOC.
    pub toc: Toc,
    /// Parsed summary.
    pub summary: Summary,
    /// Parsed statistics.
    pub statistics: Statistics,
    /// Loaded filter.
    pub filter: Filter,
    /// CompressionInfo when the data file is compressed.
    pub compression: Option<CompressionInfo>,
    /// CRC table when it is not.
    pub crc: Option<CrcComponent>,
    /// Scylla metadata.
    pub scylla: ScyllaMetadata,
}

/// One sealed, immutable SSTable, opened for reading.
pub struct Sstable {
    /// Identity of the file set.
    pub desc: Descriptor,
    /// Schema the data was written with.
    pub schema: Arc<Schema>,
    /// Partitioner decorating the keys.
    pub partitioner: Arc<dyn Partitioner>,
    /// Parsed TOC.
    pub toc: Toc,
    /// The summary, loaded or rebuilt.
    pub summary: Summary,
    /// Parsed statistics.
    pub statistics: Statistics,
    /// The filter, or the always-true stand-in.
    pub filter: Filter,
    /// CompressionInfo when compressed.
    pub compression: Option<CompressionInfo>,
    /// CRC table when uncompressed.
    pub crc: Option<CrcComponent>,
    /// Full-file digest.
    pub digest: Option<Digest>,
    /// Scylla metadata.
    pub scylla: ScyllaMetadata,
}

impl std::fmt::Debug for Sstable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sstable").field("desc", &self.desc).finish_non_exhaustive()
    }
}

fn read_component_bytes(desc: &Descriptor, component: &ComponentType) -> Result<Vec<u8>> {
    fs::read(desc.path(component)).map_err(|e| {
        SstableError::Io(std::io::Error::new(
            e.kind(),
            format!(
                "{} (component {})",
                e,
                desc.component_basename(component)
            ),
        ))
    })
}

impl Sstable {
    /// Open a sealed SSTable: parse the TOC and load every small component.
    pub fn open(
        desc: Descriptor,
        schema: Arc<Schema>,
        partitioner: Arc<dyn Partitioner>,
    ) -> Result<Sstable> {
        let toc = Toc::load(&desc)?;
        for component in &toc.components {
            if matches!(component, ComponentType::Unknown(_) | ComponentType::TemporaryToc) {
                continue;
            }
            if !desc.path(component).exists() {
                return Err(SstableError::MalformedSstable(format!(
                    "TOC references missing component {}",
                    component.name(desc.version)
                )));
            }
        }
        // exactly one of CRC / CompressionInfo per the TOC
        let has_crc = toc.contains(&ComponentType::Crc);
        let has_compression = toc.contains(&ComponentType::CompressionInfo);
        if has_crc == has_compression {
            return Err(SstableError::MalformedSstable(
                "expected exactly one of CRC and CompressionInfo".into(),
            ));
        }

        let statistics_bytes = read_component_bytes(&desc, &ComponentType::Statistics)?;
        let mut statistics = Statistics::load(&statistics_bytes, desc.version)?;
        statistics.validate_clustering_bounds(&schema);
        if desc.version.is_modern() && statistics.serialization_header.is_none() {
            return Err(SstableError::MalformedSstable(
                "row-grouped sstable without a serialization header".into(),
            ));
        }

        let summary = match read_component_bytes(&desc, &ComponentType::Summary)
            .and_then(|bytes| Summary::load(&mut Cursor::new(bytes), partitioner.as_ref()))
        {
            Ok(summary) => summary,
            Err(e) => {
                warn!(
                    file = %desc.component_basename(&ComponentType::Summary),
                    error = %e,
                    "summary unreadable; recreating from index"
                );
                let index_file = File::open(desc.path(&ComponentType::Index))?;
                let mut index = IndexReader::new(BufReader::new(index_file))?;
                crate::index::rebuild_summary_from_index(
                    &mut index,
                    partitioner.as_ref(),
                    schema.min_index_interval,
                    DEFAULT_SUMMARY_BYTE_COST,
                )?
            }
        };

        let filter = if toc.contains(&ComponentType::Filter) {
            match read_component_bytes(&desc, &ComponentType::Filter).and_then(|bytes| {
                Filter::load(
                    &mut Cursor::new(bytes),
                    FilterFormat::for_version(desc.version),
                )
            }) {
                Ok(filter) => filter,
                Err(e) => {
                    warn!(error = %e, "filter unreadable; falling back to always-true");
                    Filter::AlwaysPresent
                }
            }
        } else {
            Filter::AlwaysPresent
        };

        let compression = if has_compression {
            let bytes = read_component_bytes(&desc, &ComponentType::CompressionInfo)?;
            Some(CompressionInfo::load(&mut Cursor::new(bytes))?)
        } else {
            None
        };
        let crc = if has_crc {
            let bytes = read_component_bytes(&desc, &ComponentType::Crc)?;
            Some(CrcComponent::load(&mut Cursor::new(bytes))?)
        } else {
            None
        };
        let digest = if toc.contains(&ComponentType::Digest) {
            let bytes = read_component_bytes(&desc, &ComponentType::Digest)?;
            Some(Digest::load(&mut Cursor::new(bytes))?)
        } else {
            None
        };
        let scylla = if toc.contains(&ComponentType::Scylla) {
            let bytes = read_component_bytes(&desc, &ComponentType::Scylla)?;
            ScyllaMetadata::load(&mut Cursor::new(bytes))?
        } else {
            ScyllaMetadata::default()
        };

        info!(
            generation = desc.generation,
            version = desc.version.as_str(),
            partitions = summary.header.size,
            "sstable opened"
        );
        Ok(Sstable {
            desc,
            schema,
            partitioner,
            toc,
            summary,
            statistics,
            filter,
            compression,
            crc,
            digest,
            scylla,
        })
    }

    /// Build the object from components already loaded elsewhere (the
    /// foreign-shard handoff path). The data and index files are still
    /// opened from `desc` on demand.
    pub fn import(
        desc: Descriptor,
        schema: Arc<Schema>,
        partitioner: Arc<dyn Partitioner>,
        components: LoadedComponents,
    ) -> Result<Sstable> {
        if desc.version.is_modern() && components.statistics.serialization_header.is_none() {
            return Err(SstableError::MalformedSstable(
                "row-grouped sstable without a serialization header".into(),
            ));
        }
        let mut statistics = components.statistics;
        statistics.validate_clustering_bounds(&schema);
        Ok(Sstable {
            desc,
            schema,
            partitioner,
            toc: components.toc,
            summary: components.summary,
            statistics,
            filter: components.filter,
            compression: components.compression,
            crc: components.crc,
            digest: None,
            scylla: components.scylla,
        })
    }

    /// Every component this SSTable has, including unrecognized ones.
    pub fn all_components(&self) -> &[ComponentType] {
        &self.toc.components
    }

    /// The serialization header; present exactly on ModernM.
    pub fn serialization_header(&self) -> Result<&SerializationHeaderMetadata> {
        self.statistics.serialization_header.as_ref().ok_or_else(|| {
            SstableError::MalformedSstable("missing serialization header".into())
        })
    }

    /// Open the data file behind its integrity layer.
    pub fn data_source(&self) -> Result<DataSource> {
        let file = File::open(self.desc.path(&ComponentType::Data))?;
        match (&self.compression, &self.crc) {
            (Some(info), _) => Ok(DataSource::Compressed(CompressedReader::new(
                BufReader::new(file),
                info.clone(),
            )?)),
            (None, Some(crc)) => Ok(DataSource::Plain(ChecksummedReader::new(
                BufReader::new(file),
                ChecksumType::for_version(self.desc.version),
                crc.clone(),
            )?)),
            (None, None) => Err(SstableError::MalformedSstable(
                "no integrity layer for the data file".into(),
            )),
        }
    }

    /// Open the index file.
    pub fn index_reader(&self) -> Result<IndexReader<BufReader<File>>> {
        let file = File::open(self.desc.path(&ComponentType::Index))?;
        IndexReader::new(BufReader::new(file))
    }

    fn promoted_index_of(&self, blob: &[u8]) -> Result<Option<PromotedIndex>> {
        if blob.is_empty() || !self.desc.version.is_modern() {
            return Ok(None);
        }
        let header = self.serialization_header()?;
        let parser = crate::data::modern::ModernParser::new(header);
        Ok(Some(parse_promoted_index(&parser, blob)?))
    }

    // --------------------------------------------------------------------------------------------
    // Reads
    // --------------------------------------------------------------------------------------------

    /// Full scan: every partition, every event.
    pub fn read_rows(&self, deadline: ReadDeadline) -> Result<Vec<PartitionEvent>> {
        self.read_token_range(i64::MIN, i64::MAX, &ClusteringSlice::full(), deadline)
    }

    /// Scan partitions whose tokens fall in `[from, to]`, restricted to
    /// `slice` within each partition.
    pub fn read_range_rows(
        &self,
        from: Token,
        to: Token,
        slice: &ClusteringSlice,
        deadline: ReadDeadline,
    ) -> Result<Vec<PartitionEvent>> {
        self.read_token_range(from.0, to.0, slice, deadline)
    }

    fn read_token_range(
        &self,
        from: i64,
        to: i64,
        slice: &ClusteringSlice,
        deadline: ReadDeadline,
    ) -> Result<Vec<PartitionEvent>> {
        let mut index = self.index_reader()?;
        let mut source = self.data_source()?;
        let mut events = Vec::new();
        while let Some(entry) = index.next_entry(self.partitioner.as_ref())? {
            deadline.check()?;
            if entry.token.0 < from {
                continue;
            }
            if entry.token.0 > to {
                break;
            }
            let mut partition =
                self.read_partition_at(&mut source, &entry, slice, Forwarding::No, deadline)?;
            events.append(&mut partition);
        }
        Ok(events)
    }

    fn read_partition_at(
        &self,
        source: &mut DataSource,
        entry: &crate::index::IndexEntry,
        slice: &ClusteringSlice,
        forwarding: Forwarding,
        deadline: ReadDeadline,
    ) -> Result<Vec<PartitionEvent>> {
        if self.desc.version.is_modern() {
            let header = self.serialization_header()?;
            let promoted = self.promoted_index_of(&entry.promoted)?;
            let mut reader = PartitionReader::new(
                &self.schema,
                header,
                &mut *source,
                entry.data_offset,
                promoted,
                slice.clone(),
                forwarding,
                deadline,
            )?;
            reader.set_decorated_token(entry.token);
            let mut events = reader.collect_events()?;
            if forwarding == Forwarding::No
                && !matches!(events.last(), Some(PartitionEvent::PartitionEnd))
            {
                events.push(PartitionEvent::PartitionEnd);
            }
            // restore the token on the start event
            if let Some(PartitionEvent::PartitionStart { key, .. }) = events.first_mut() {
                key.token = entry.token;
            }
            Ok(events)
        } else {
            let mut events =
                read_legacy_partition(&self.schema, source, entry.data_offset, slice, deadline)?;
            if let Some(PartitionEvent::PartitionStart { key, .. }) = events.first_mut() {
                key.token = entry.token;
            }
            Ok(events)
        }
    }

    /// Read one partition. Returns `None` when the Bloom filter or the
    /// index rule the key out.
    pub fn read_single_partition(
        &self,
        key: &DecoratedKey,
        slice: &ClusteringSlice,
        deadline: ReadDeadline,
    ) -> Result<Option<Vec<PartitionEvent>>> {
        let Some(entry) = self.locate_partition(key)? else {
            return Ok(None);
        };
        let mut source = self.data_source()?;
        let events =
            self.read_partition_at(&mut source, &entry, slice, Forwarding::No, deadline)?;
        Ok(Some(events))
    }

    /// Locate a partition's index entry, or `None` when absent.
    pub fn locate_partition(&self, key: &DecoratedKey) -> Result<Option<crate::index::IndexEntry>> {
        if !self.filter.may_contain(&key.key) {
            return Ok(None);
        }
        let mut index = self.index_reader()?;
        index.seek_to_partition(&self.summary, self.partitioner.as_ref(), key.token, &key.key)
    }

    /// Open a forwarding reader over one ModernM partition; the caller
    /// drives it with `next_event` and `fast_forward_to`.
    pub fn forwarding_partition_reader(
        &self,
        key: &DecoratedKey,
        slice: ClusteringSlice,
        deadline: ReadDeadline,
    ) -> Result<Option<PartitionReader<'_, DataSource>>> {
        if !self.desc.version.is_modern() {
            return Err(SstableError::MalformedSstable(
                "forwarding reads need the row-grouped layout".into(),
            ));
        }
        let Some(entry) = self.locate_partition(key)? else {
            return Ok(None);
        };
        let header = self.serialization_header()?;
        let promoted = self.promoted_index_of(&entry.promoted)?;
        let source = self.data_source()?;
        let mut reader = PartitionReader::new(
            &self.schema,
            header,
            source,
            entry.data_offset,
            promoted,
            slice,
            Forwarding::Yes,
            deadline,
        )?;
        reader.set_decorated_token(entry.token);
        Ok(Some(reader))
    }

    // --------------------------------------------------------------------------------------------
    // Statistics rewrite
    // --------------------------------------------------------------------------------------------

    /// Rewrite the Statistics component in place: stage the new blob under
    /// the temporary name, then rename it over the published one with a
    /// directory flush. The rest of the file set never changes.
    pub fn rewrite_statistics(&mut self, statistics: Statistics) -> Result<()> {
        let tmp_path = self.desc.path(&ComponentType::TemporaryStatistics);
        let mut bytes = Vec::new();
        statistics.save(&mut bytes, self.desc.version)?;
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)?;
        std::io::Write::write_all(&mut file, &bytes)?;
        file.sync_all()?;
        fs::rename(&tmp_path, self.desc.path(&ComponentType::Statistics))?;
        sync_directory(&self.desc.dir)?;
        self.statistics = statistics;
        Ok(())
    }

    /// Set the compaction level, persisting through the staged-statistics
    /// rename.
    pub fn set_sstable_level(&mut self, level: u32) -> Result<()> {
        let mut statistics = self.statistics.clone();
        if let Some(stats) = &mut statistics.stats {
            stats.sstable_level = level;
        }
        self.rewrite_statistics(statistics)
    }

    /// Record the repair stamp, persisting through the staged-statistics
    /// rename.
    pub fn set_repaired_at(&mut self, repaired_at: u64) -> Result<()> {
        let mut statistics = self.statistics.clone();
        if let Some(stats) = &mut statistics.stats {
            stats.repaired_at = repaired_at;
        }
        self.rewrite_statistics(statistics)
    }

    // --------------------------------------------------------------------------------------------
    // Deletion and sweep
    // --------------------------------------------------------------------------------------------

    /// Delete the SSTable: demote the TOC to its temporary name, unlink
    /// every referenced component, unlink the temporary TOC last, then
    /// flush the directory.
    pub fn delete(self) -> Result<()> {
        let toc_path = self.desc.path(&ComponentType::Toc);
        let tmp_path = self.desc.path(&ComponentType::TemporaryToc);
        fs::rename(&toc_path, &tmp_path)?;
        sync_directory(&self.desc.dir)?;
        for component in &self.toc.components {
            if matches!(component, ComponentType::Toc | ComponentType::TemporaryToc) {
                continue;
            }
            let path = self.desc.path(component);
            if let Err(e) = fs::remove_file(&path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    return Err(SstableError::Io(e));
                }
            }
        }
        fs::remove_file(&tmp_path)?;
        sync_directory(&self.desc.dir)?;
        info!(generation = self.desc.generation, "sstable deleted");
        Ok(())
    }
}

/// Startup sweep: remove files of generations that were never published
/// (no `TOC`, or only a `TemporaryTOC`). Returns the swept generations.
pub fn sweep_unsealed(dir: &std::path::Path) -> Result<Vec<u64>> {
    use std::collections::BTreeMap;

    let mut by_generation: BTreeMap<u64, (bool, Vec<std::path::PathBuf>)> = BTreeMap::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Ok((desc, component)) = Descriptor::parse(dir, name) else {
            continue;
        };
        let slot = by_generation.entry(desc.generation).or_default();
        if component == ComponentType::Toc {
            slot.0 = true;
        }
        slot.1.push(entry.path());
    }

    let mut swept = Vec::new();
    for (generation, (published, paths)) in by_generation {
        if published {
            continue;
        }
        warn!(generation, files = paths.len(), "sweeping unsealed generation");
        for path in paths {
            fs::remove_file(path)?;
        }
        swept.push(generation);
    }
    if !swept.is_empty() {
        sync_directory(dir)?;
    }
    Ok(swept)
}
