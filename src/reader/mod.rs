//! The reader pipeline: streams partitions back out of the data file,
//! honoring clustering-range filtering and forward fast-forwarding.
//!
//! The modern path decodes unfiltereds one by one, reconstructing range
//! tombstones from markers: a start marker opens a run, an end marker
//! closes it (yielding one [`RangeTombstone`] event), a boundary does both
//! at a shared prefix. Fast-forwarding consults the promoted index to skip
//! unread blocks; a range tombstone open across the skipped region is
//! recovered from the target block's open-marker hint rather than
//! re-emitted.
//!
//! The legacy path reads a partition record whole (its promoted-index
//! blocks are self-contained) and filters in memory.

#[cfg(test)]
mod tests;

use std::io::{Read, Seek, SeekFrom};
use std::time::{Duration, Instant};

use crate::components::statistics::SerializationHeaderMetadata;
use crate::data::legacy::{LegacyItem, LegacySerializer};
use crate::data::modern::{ModernParser, Unfiltered};
use crate::error::{Result, SstableError};
use crate::index::PromotedIndex;
use crate::model::{
    BoundKind, ClusteringBound, ClusteringPrefix, PartitionEvent, Position, RangeTombstone,
    Schema, Tombstone,
};

// ------------------------------------------------------------------------------------------------
// Slices and forwarding
// ------------------------------------------------------------------------------------------------

/// Whether the caller intends to fast-forward after end-of-stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Forwarding {
    /// Emit everything in the slice, then end.
    No,
    /// The caller may request later subranges with `fast_forward_to`.
    Yes,
}

/// A clustering restriction: a half-open interval of positions.
#[derive(Debug, Clone, Default)]
pub struct ClusteringSlice {
    /// Lower bound; `None` means from the partition start.
    pub start: Option<ClusteringBound>,
    /// Upper bound; `None` means to the partition end.
    pub end: Option<ClusteringBound>,
}

impl ClusteringSlice {
    /// The unrestricted slice.
    pub fn full() -> Self {
        Self::default()
    }

    /// A slice covering `[start, end)` of full clusterings.
    pub fn between(start: ClusteringPrefix, end: ClusteringPrefix) -> Self {
        Self {
            start: Some(ClusteringBound::incl_start(start)),
            end: Some(ClusteringBound::excl_end(end)),
        }
    }

    /// Whether nothing restricts this slice.
    pub fn is_full(&self) -> bool {
        self.start.is_none() && self.end.is_none()
    }

    fn start_position(&self) -> Position {
        self.start
            .as_ref()
            .map(|b| b.position())
            .unwrap_or_else(Position::before_all)
    }

    fn end_position(&self) -> Position {
        self.end
            .as_ref()
            .map(|b| b.position())
            .unwrap_or_else(Position::after_all)
    }

    fn contains(&self, schema: &Schema, pos: &Position) -> bool {
        use std::cmp::Ordering;
        if self.start.is_some()
            && schema.compare_positions(pos, &self.start_position()) == Ordering::Less
        {
            return false;
        }
        if self.end.is_some()
            && schema.compare_positions(pos, &self.end_position()) != Ordering::Less
        {
            return false;
        }
        true
    }

    /// Whether `pos` lies at or past the slice end.
    fn past_end(&self, schema: &Schema, pos: &Position) -> bool {
        self.end.is_some()
            && schema.compare_positions(pos, &self.end_position()) != std::cmp::Ordering::Less
    }
}

/// Deadline plumbing carried through the read call chain.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReadDeadline {
    deadline: Option<Instant>,
}

impl ReadDeadline {
    /// No timeout.
    pub fn none() -> Self {
        Self { deadline: None }
    }

    /// Fail reads `timeout` from now.
    pub fn after(timeout: Duration) -> Self {
        Self { deadline: Some(Instant::now() + timeout) }
    }

    /// Fail with `io-timeout` when the deadline has passed.
    pub fn check(&self) -> Result<()> {
        if let Some(deadline) = self.deadline {
            if Instant::now() > deadline {
                return Err(SstableError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "io-timeout",
                )));
            }
        }
        Ok(())
    }
}

// ------------------------------------------------------------------------------------------------
// Modern partition reader
// ------------------------------------------------------------------------------------------------

/// Streams one partition of a modern (`mc`) data file as events.
pub struct PartitionReader<'a, R: Read + Seek> {
    schema: &'a Schema,
    header: &'a SerializationHeaderMetadata,
    source: R,
    /// Data offset of the first byte after the partition header.
    content_start: u64,
    promoted: Option<PromotedIndex>,
    slice: ClusteringSlice,
    forwarding: Forwarding,
    deadline: ReadDeadline,

    started: bool,
    exhausted: bool,
    partition_start_event: Option<PartitionEvent>,
    /// Open range-tombstone run: start bound plus its tombstone.
    rt_open: Option<(ClusteringBound, Tombstone)>,
    /// Suppress a leading end marker right after a skip when no open
    /// tombstone was carried over.
    suppress_leading_end: bool,
    /// Promoted-index blocks entered; test instrumentation for skip-read
    /// verification.
    pub blocks_visited: u64,
}

impl<'a, R: Read + Seek> PartitionReader<'a, R> {
    /// Open a partition whose record starts at `data_offset` in `source`.
    pub fn new(
        schema: &'a Schema,
        header: &'a SerializationHeaderMetadata,
        mut source: R,
        data_offset: u64,
        promoted: Option<PromotedIndex>,
        slice: ClusteringSlice,
        forwarding: Forwarding,
        deadline: ReadDeadline,
    ) -> Result<Self> {
        source.seek(SeekFrom::Start(data_offset))?;
        let parser = ModernParser::new(header);
        let (key, tombstone) = parser.read_partition_header(&mut source)?;
        // block offsets are measured from the first byte after the
        // partition header (key, tombstone and static row); the promoted
        // index records that length exactly
        let content_start = match &promoted {
            Some(pi) => data_offset + pi.partition_header_length,
            None => source.seek(SeekFrom::Current(0))?,
        };
        let partitioner_less_key = key;
        Ok(Self {
            schema,
            header,
            source,
            content_start,
            promoted,
            slice,
            forwarding,
            deadline,
            started: false,
            exhausted: false,
            partition_start_event: Some(PartitionEvent::PartitionStart {
                key: crate::model::DecoratedKey {
                    token: crate::model::Token(0),
                    key: partitioner_less_key,
                },
                tombstone,
            }),
            rt_open: None,
            suppress_leading_end: false,
            blocks_visited: 1,
        })
    }

    /// Replace the placeholder token in the pending start event; callers
    /// that already know the decorated key use this before streaming.
    pub fn set_decorated_token(&mut self, token: crate::model::Token) {
        if let Some(PartitionEvent::PartitionStart { key, .. }) = &mut self.partition_start_event {
            key.token = token;
        }
    }

    /// Use the promoted index to position the stream at the first block
    /// that can contain `pos`. Returns true when a skip happened.
    fn skip_to_block_for(&mut self, pos: &Position) -> Result<bool> {
        let Some(pi) = &self.promoted else {
            return Ok(false);
        };
        if pi.blocks.is_empty() {
            return Ok(false);
        }
        let idx = pi.first_block_for(self.schema, pos);
        let block = &pi.blocks[idx];
        let target = self.content_start + block.offset;
        let here = self.source.seek(SeekFrom::Current(0))?;
        if target <= here {
            return Ok(false);
        }
        self.source.seek(SeekFrom::Start(target))?;
        self.blocks_visited += 1;
        self.rt_open = block.open_marker.map(|t| {
            (
                ClusteringBound {
                    prefix: block.first.prefix.clone(),
                    kind: BoundKind::InclStart,
                },
                t,
            )
        });
        self.suppress_leading_end = self.rt_open.is_none();
        Ok(true)
    }

    /// After end-of-stream under [`Forwarding::Yes`]: continue from the
    /// clustering subrange `[from, to)`. Ranges must move forward.
    pub fn fast_forward_to(&mut self, slice: ClusteringSlice) -> Result<()> {
        if self.forwarding != Forwarding::Yes {
            return Err(SstableError::MalformedSstable(
                "fast_forward_to on a non-forwarding reader".into(),
            ));
        }
        self.slice = slice;
        self.exhausted = false;
        let start = self.slice.start_position();
        self.skip_to_block_for(&start)?;
        Ok(())
    }

    fn position_of_marker(clustering: &ClusteringPrefix, kind: BoundKind) -> Position {
        Position { prefix: clustering.clone(), weight: kind.weight() }
    }

    /// The next event inside the current slice, or `None` when the slice
    /// (or the partition) is exhausted.
    pub fn next_event(&mut self) -> Result<Option<PartitionEvent>> {
        self.deadline.check()?;
        if let Some(event) = self.partition_start_event.take() {
            return Ok(Some(event));
        }
        if self.exhausted {
            return Ok(None);
        }
        if !self.started {
            self.started = true;
            // with no static row in the schema, a restricted slice skips
            // straight to its first block; otherwise the skip happens after
            // the static row is delivered
            if !self.slice.is_full() && self.header.static_columns.is_empty() {
                let start = self.slice.start_position();
                self.skip_to_block_for(&start)?;
            }
        }
        let parser = ModernParser::new(self.header);
        loop {
            self.deadline.check()?;
            let unfiltered = parser.read_unfiltered(&mut self.source)?;
            match unfiltered {
                Unfiltered::EndOfPartition => {
                    self.exhausted = true;
                    return Ok(Some(PartitionEvent::PartitionEnd));
                }
                Unfiltered::Row { is_static: true, row } => {
                    let event = PartitionEvent::Static(crate::model::StaticRow { cells: row.cells });
                    // with a restricted slice, skip to the right block now
                    // that the static row is behind us
                    if !self.slice.is_full() {
                        let start = self.slice.start_position();
                        self.skip_to_block_for(&start)?;
                    }
                    return Ok(Some(event));
                }
                Unfiltered::Row { is_static: false, row } => {
                    self.suppress_leading_end = false;
                    let pos = Position::at(row.clustering.clone());
                    if self.slice.past_end(self.schema, &pos) {
                        return self.finish_slice();
                    }
                    if !self.slice.contains(self.schema, &pos) {
                        continue;
                    }
                    return Ok(Some(PartitionEvent::Row(row)));
                }
                Unfiltered::Marker(marker) => {
                    let pos = Self::position_of_marker(&marker.clustering, marker.kind);
                    if marker.kind.is_end() {
                        let open = self.rt_open.take();
                        let suppress = self.suppress_leading_end && open.is_none();
                        self.suppress_leading_end = false;
                        let event = match open {
                            Some((start, tombstone)) if !suppress => {
                                let end_kind = match marker.kind {
                                    BoundKind::ExclEndInclStart => BoundKind::ExclEnd,
                                    BoundKind::InclEndExclStart => BoundKind::InclEnd,
                                    k => k,
                                };
                                Some(RangeTombstone {
                                    start,
                                    end: ClusteringBound {
                                        prefix: marker.clustering.clone(),
                                        kind: end_kind,
                                    },
                                    tombstone,
                                })
                            }
                            _ => None,
                        };
                        // a boundary also opens the next run
                        if marker.kind.is_boundary() {
                            let open_kind = match marker.kind {
                                BoundKind::ExclEndInclStart => BoundKind::InclStart,
                                _ => BoundKind::ExclStart,
                            };
                            let tomb = marker.boundary_tombstone.ok_or_else(|| {
                                SstableError::MalformedSstable(
                                    "boundary marker without second tombstone".into(),
                                )
                            })?;
                            self.rt_open = Some((
                                ClusteringBound {
                                    prefix: marker.clustering.clone(),
                                    kind: open_kind,
                                },
                                tomb,
                            ));
                        }
                        if let Some(rt) = event {
                            if self.slice.past_end(self.schema, &pos)
                                && self
                                    .schema
                                    .compare_positions(
                                        &rt.start.position(),
                                        &self.slice.end_position(),
                                    )
                                    != std::cmp::Ordering::Less
                            {
                                return self.finish_slice();
                            }
                            return Ok(Some(PartitionEvent::RangeTombstone(rt)));
                        }
                        if self.slice.past_end(self.schema, &pos) && !marker.kind.is_boundary() {
                            return self.finish_slice();
                        }
                        continue;
                    }
                    // a pure start marker
                    self.suppress_leading_end = false;
                    if self.slice.past_end(self.schema, &pos) {
                        return self.finish_slice();
                    }
                    self.rt_open = Some((
                        ClusteringBound {
                            prefix: marker.clustering.clone(),
                            kind: marker.kind,
                        },
                        marker.tombstone,
                    ));
                    continue;
                }
            }
        }
    }

    fn finish_slice(&mut self) -> Result<Option<PartitionEvent>> {
        if self.forwarding == Forwarding::Yes {
            // leave the partition open for fast_forward_to
            Ok(None)
        } else {
            self.exhausted = true;
            Ok(Some(PartitionEvent::PartitionEnd))
        }
    }

    /// Collect every remaining event of the current slice.
    pub fn collect_events(&mut self) -> Result<Vec<PartitionEvent>> {
        let mut events = Vec::new();
        while let Some(event) = self.next_event()? {
            events.push(event);
        }
        Ok(events)
    }
}

// ------------------------------------------------------------------------------------------------
// Legacy partition reading
// ------------------------------------------------------------------------------------------------

/// Read one whole legacy partition record into events, applying `slice`.
pub fn read_legacy_partition<R: Read + Seek>(
    schema: &Schema,
    source: &mut R,
    data_offset: u64,
    slice: &ClusteringSlice,
    deadline: ReadDeadline,
) -> Result<Vec<PartitionEvent>> {
    deadline.check()?;
    source.seek(SeekFrom::Start(data_offset))?;
    let serializer = LegacySerializer::new(schema);
    let (key, tombstone) = serializer.read_partition_header(source)?;
    let content = serializer.read_partition_content(source)?;
    deadline.check()?;

    let mut events = Vec::with_capacity(content.items.len() + 3);
    events.push(PartitionEvent::PartitionStart {
        key: crate::model::DecoratedKey {
            token: crate::model::Token(0),
            key,
        },
        tombstone,
    });
    if let Some(static_row) = content.static_row {
        events.push(PartitionEvent::Static(static_row));
    }
    for item in content.items {
        match item {
            LegacyItem::Row(row) => {
                let pos = Position::at(row.clustering.clone());
                if slice.contains(schema, &pos) {
                    events.push(PartitionEvent::Row(row));
                }
            }
            LegacyItem::RangeTombstone(rt) => {
                // emit when the range intersects the slice
                let starts_before_end = !slice.past_end(schema, &rt.start.position());
                let ends_after_start = slice.start.is_none()
                    || schema.compare_positions(
                        &rt.end.position(),
                        &slice
                            .start
                            .as_ref()
                            .map(|b| b.position())
                            .unwrap_or_else(Position::before_all),
                    ) != std::cmp::Ordering::Less;
                if starts_before_end && ends_after_start {
                    events.push(PartitionEvent::RangeTombstone(rt));
                }
            }
        }
    }
    events.push(PartitionEvent::PartitionEnd);
    Ok(events)
}
