//! Column-oriented data framing for the `ka`/`la` layouts.
//!
//! # Partition record
//!
//! ```text
//! u16 key_len, key
//! deletion_time partition_tombstone
//! repeat:
//!     u16 column_name_len, column_name
//!     u8 mask
//!     <per-mask body>
//! u16 0                      // end-of-row sentinel
//! ```
//!
//! Column names are composites for compound schemas: each component is
//! `[u16 len][bytes][u8 eoc]`. A cell name is the clustering components
//! followed by the column name (and a sub-path component for collection
//! cells); the row marker cell carries an empty column-name component. A
//! range tombstone is a pair of bound names with a deletion body between;
//! the end-of-component byte encodes bound inclusivity. Static cells hang
//! off a prefix that opens with the `0xFFFF` static marker.

use std::io::{Read, Write};

use crate::data::{
    decode_counter_shards, encode_counter_shards, read_deletion_time, write_deletion_time,
};
use crate::encoding::{read_int, read_raw, read_string, write_int, write_string, FixedInt};
use crate::error::{Result, SstableError};
use crate::model::{
    BoundKind, Cell, ClusteringBound, ClusteringPrefix, ClusteringRow, CollectionMutation,
    ColumnValue, LivenessInfo, RangeTombstone, RowCells, RowDeletion, Schema, StaticRow, Tombstone,
};

/// Cell mask: the cell is a tombstone.
pub const MASK_DELETION: u8 = 0x01;
/// Cell mask: the cell is expiring.
pub const MASK_EXPIRATION: u8 = 0x02;
/// Cell mask: the cell is a counter.
pub const MASK_COUNTER: u8 = 0x04;
/// Cell mask: a range tombstone follows (the name just read is its start
/// bound).
pub const MASK_RANGE_TOMBSTONE: u8 = 0x10;
/// Cell mask: a shadowable row tombstone.
pub const MASK_SHADOWABLE: u8 = 0x40;

/// Leading `u16` of a static composite prefix.
const STATIC_MARKER: u16 = 0xFFFF;

/// End-of-component byte placing a bound before the rows at its prefix.
const EOC_START: u8 = 0xFF;
/// End-of-component byte for exact matches.
const EOC_NONE: u8 = 0x00;
/// End-of-component byte placing a bound after the rows at its prefix.
const EOC_END: u8 = 0x01;

// ------------------------------------------------------------------------------------------------
// Composite names
// ------------------------------------------------------------------------------------------------

/// A decoded legacy cell name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CellName {
    /// Whether the name hangs off the static prefix.
    pub is_static: bool,
    /// Clustering components.
    pub clustering: ClusteringPrefix,
    /// Column-name component; empty for the row marker cell.
    pub column: Vec<u8>,
    /// Collection sub-path component, when present.
    pub path: Option<Vec<u8>>,
    /// Bound placement carried by the trailing end-of-component byte.
    pub eoc: i8,
}

fn push_component(buf: &mut Vec<u8>, bytes: &[u8], eoc: u8) -> Result<()> {
    write_int(buf, u16::from_len(bytes.len(), "composite component length")?)?;
    buf.extend_from_slice(bytes);
    write_int(buf, eoc)?;
    Ok(())
}

/// Serializer/parser pair for the legacy framing.
pub struct LegacySerializer<'a> {
    schema: &'a Schema,
}

impl<'a> LegacySerializer<'a> {
    /// A serializer for `schema`.
    pub fn new(schema: &'a Schema) -> Self {
        Self { schema }
    }

    fn compose_name(
        &self,
        is_static: bool,
        clustering: &ClusteringPrefix,
        column: &[u8],
        path: Option<&[u8]>,
        eoc: u8,
    ) -> Result<Vec<u8>> {
        if !self.schema.compound {
            // non-compound names are the raw single component
            if let Some(first) = clustering.components.first() {
                return Ok(first.clone());
            }
            return Ok(column.to_vec());
        }
        let mut buf = Vec::new();
        if is_static {
            write_int(&mut buf, STATIC_MARKER)?;
        }
        let n = clustering.len();
        for (i, c) in clustering.components.iter().enumerate() {
            let last = i + 1 == n && column.is_empty() && path.is_none();
            push_component(&mut buf, c, if last { eoc } else { EOC_NONE })?;
        }
        if !column.is_empty() || path.is_some() || clustering.is_empty() {
            let last = path.is_none();
            push_component(&mut buf, column, if last { eoc } else { EOC_NONE })?;
        }
        if let Some(p) = path {
            push_component(&mut buf, p, eoc)?;
        }
        Ok(buf)
    }

    /// Decode a legacy composite cell name.
    pub fn parse_name(&self, bytes: &[u8]) -> Result<CellName> {
        if !self.schema.compound {
            return Ok(CellName {
                is_static: false,
                clustering: ClusteringPrefix::from(vec![bytes.to_vec()]),
                column: Vec::new(),
                path: None,
                eoc: 0,
            });
        }
        let mut r = std::io::Cursor::new(bytes);
        let mut is_static = false;
        let mut components: Vec<Vec<u8>> = Vec::new();
        let mut eoc: i8 = 0;

        // peek for the static marker
        if bytes.len() >= 2 && u16::from_be_bytes([bytes[0], bytes[1]]) == STATIC_MARKER {
            is_static = true;
            r.set_position(2);
        }
        loop {
            let pos = r.position() as usize;
            if pos >= bytes.len() {
                break;
            }
            let len = read_int::<u16, _>(&mut r)?.as_len().map_err(SstableError::from)?;
            let body = read_raw(&mut r, len, "composite component")?;
            let e = read_int::<u8, _>(&mut r)? as i8;
            components.push(body);
            eoc = e;
        }

        let clustering_len = self.schema.clustering_types.len();
        let clustering_take = components.len().min(if is_static { 0 } else { clustering_len });
        let mut rest = components.split_off(clustering_take);
        let clustering = ClusteringPrefix::from(components);
        let column = if rest.is_empty() { Vec::new() } else { rest.remove(0) };
        let path = rest.pop();
        Ok(CellName { is_static, clustering, column, path, eoc })
    }

    // --------------------------------------------------------------------------------------------
    // Writing
    // --------------------------------------------------------------------------------------------

    /// Write the partition header.
    pub fn write_partition_header<W: Write>(
        &self,
        w: &mut W,
        key: &[u8],
        tombstone: Tombstone,
    ) -> Result<()> {
        write_string::<u16, _>(w, key)?;
        write_deletion_time(w, tombstone)?;
        Ok(())
    }

    /// Write the end-of-row sentinel closing the partition record.
    pub fn write_end_of_partition<W: Write>(&self, w: &mut W) -> Result<()> {
        write_int(w, 0u16)?;
        Ok(())
    }

    fn write_named_cell<W: Write>(&self, w: &mut W, name: &[u8], cell: &Cell) -> Result<()> {
        write_string::<u16, _>(w, name)?;
        match cell {
            Cell::Live { timestamp, ttl: None, value, .. } => {
                write_int(w, 0u8)?;
                write_int(w, *timestamp)?;
                write_string::<u32, _>(w, value)?;
            }
            Cell::Live { timestamp, ttl: Some(ttl), expiry, value } => {
                write_int(w, MASK_EXPIRATION)?;
                write_int(w, *ttl as u32)?;
                write_int(w, expiry.unwrap_or(i32::MAX) as u32)?;
                write_int(w, *timestamp)?;
                write_string::<u32, _>(w, value)?;
            }
            Cell::Tombstone { timestamp, local_deletion_time } => {
                write_int(w, MASK_DELETION)?;
                write_int(w, *timestamp)?;
                write_int(w, 4u32)?;
                write_int(w, *local_deletion_time)?;
            }
            Cell::Counter { timestamp, shards } => {
                write_int(w, MASK_COUNTER)?;
                // timestamp of last delete; none tracked here
                write_int(w, i64::MIN)?;
                write_int(w, *timestamp)?;
                let blob = encode_counter_shards(shards)?;
                write_string::<u32, _>(w, &blob)?;
            }
        }
        Ok(())
    }

    fn write_row_cells<W: Write>(
        &self,
        w: &mut W,
        is_static: bool,
        clustering: &ClusteringPrefix,
        cells: &RowCells,
    ) -> Result<()> {
        for (column, value) in cells {
            match value {
                ColumnValue::Atomic(cell) => {
                    let name =
                        self.compose_name(is_static, clustering, column, None, EOC_NONE)?;
                    self.write_named_cell(w, &name, cell)?;
                }
                ColumnValue::Complex(complex) => {
                    if let Some(t) = complex.tombstone {
                        // collection tombstone: a range over the column's
                        // sub-names
                        let start =
                            self.compose_name(is_static, clustering, column, None, EOC_START)?;
                        let end =
                            self.compose_name(is_static, clustering, column, None, EOC_END)?;
                        self.write_range_tombstone_raw(w, &start, &end, t)?;
                    }
                    for (path, cell) in &complex.cells {
                        let name = self.compose_name(
                            is_static,
                            clustering,
                            column,
                            Some(path),
                            EOC_NONE,
                        )?;
                        self.write_named_cell(w, &name, cell)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Write the static row's cells.
    pub fn write_static_row<W: Write>(&self, w: &mut W, row: &StaticRow) -> Result<()> {
        self.write_row_cells(w, true, &ClusteringPrefix::empty(), &row.cells)
    }

    /// Write a clustering row: marker cell, optional row deletion, cells.
    pub fn write_clustering_row<W: Write>(&self, w: &mut W, row: &ClusteringRow) -> Result<()> {
        if let Some(d) = &row.deletion {
            if d.shadowable {
                let name =
                    self.compose_name(false, &row.clustering, b"", None, EOC_NONE)?;
                write_string::<u16, _>(w, &name)?;
                write_int(w, MASK_SHADOWABLE)?;
                write_int(w, d.tombstone.timestamp)?;
                write_int(w, d.tombstone.deletion_time)?;
            } else {
                // a row deletion is a range tombstone over the exact row
                let start =
                    self.compose_name(false, &row.clustering, b"", None, EOC_START)?;
                let end = self.compose_name(false, &row.clustering, b"", None, EOC_END)?;
                self.write_range_tombstone_raw(w, &start, &end, d.tombstone)?;
            }
        }
        if let Some(marker) = &row.marker {
            let name = self.compose_name(false, &row.clustering, b"", None, EOC_NONE)?;
            let cell = Cell::Live {
                timestamp: marker.timestamp,
                ttl: marker.ttl,
                expiry: marker.local_deletion_time,
                value: Vec::new(),
            };
            self.write_named_cell(w, &name, &cell)?;
        }
        self.write_row_cells(w, false, &row.clustering, &row.cells)
    }

    fn write_range_tombstone_raw<W: Write>(
        &self,
        w: &mut W,
        start_name: &[u8],
        end_name: &[u8],
        tombstone: Tombstone,
    ) -> Result<()> {
        write_string::<u16, _>(w, start_name)?;
        write_int(w, MASK_RANGE_TOMBSTONE)?;
        write_string::<u16, _>(w, end_name)?;
        write_deletion_time(w, tombstone)?;
        Ok(())
    }

    /// Write a range tombstone as a bound-name pair.
    pub fn write_range_tombstone<W: Write>(&self, w: &mut W, rt: &RangeTombstone) -> Result<()> {
        let start_eoc = match rt.start.kind {
            BoundKind::InclStart => EOC_START,
            BoundKind::ExclStart => EOC_END,
            _ => EOC_START,
        };
        let end_eoc = match rt.end.kind {
            BoundKind::InclEnd => EOC_END,
            BoundKind::ExclEnd => EOC_START,
            _ => EOC_END,
        };
        let start = self.compose_name(false, &rt.start.prefix, b"", None, start_eoc)?;
        let end = self.compose_name(false, &rt.end.prefix, b"", None, end_eoc)?;
        self.write_range_tombstone_raw(w, &start, &end, rt.tombstone)
    }

    // --------------------------------------------------------------------------------------------
    // Reading
    // --------------------------------------------------------------------------------------------

    /// Parse the partition header.
    pub fn read_partition_header<R: Read>(&self, r: &mut R) -> Result<(Vec<u8>, Tombstone)> {
        let key = read_string::<u16, _>(r)?;
        let tombstone = read_deletion_time(r)?;
        Ok((key, tombstone))
    }

    /// Parse everything between the partition header and the end-of-row
    /// sentinel, reassembling rows from consecutive same-clustering cells.
    pub fn read_partition_content<R: Read>(&self, r: &mut R) -> Result<LegacyPartitionContent> {
        let mut content = LegacyPartitionContent::default();
        let mut current: Option<(bool, ClusteringPrefix, ClusteringRow)> = None;

        loop {
            let name_len = read_int::<u16, _>(r)?.as_len().map_err(SstableError::from)?;
            if name_len == 0 {
                break;
            }
            let name_bytes = read_raw(r, name_len, "cell name")?;
            let mask = read_int::<u8, _>(r)?;

            if mask & MASK_RANGE_TOMBSTONE != 0 {
                let end_bytes = read_string::<u16, _>(r)?;
                let tombstone = read_deletion_time(r)?;
                let start = self.parse_name(&name_bytes)?;
                let end = self.parse_name(&end_bytes)?;
                self.apply_range_tombstone(&mut content, &mut current, start, end, tombstone)?;
                continue;
            }
            if mask & MASK_SHADOWABLE != 0 {
                let timestamp = read_int::<i64, _>(r)?;
                let deletion_time = read_int::<i32, _>(r)?;
                let name = self.parse_name(&name_bytes)?;
                self.ensure_row(&mut content, &mut current, name.is_static, name.clustering);
                if let Some((_, _, row)) = &mut current {
                    row.deletion = Some(RowDeletion {
                        tombstone: Tombstone { timestamp, deletion_time },
                        shadowable: true,
                    });
                }
                continue;
            }

            let cell = if mask & MASK_DELETION != 0 {
                let timestamp = read_int::<i64, _>(r)?;
                let dt_size = read_int::<u32, _>(r)?;
                if dt_size != 4 {
                    return Err(SstableError::MalformedSstable(format!(
                        "deletion body size {dt_size}, expected 4"
                    )));
                }
                let local_deletion_time = read_int::<i32, _>(r)?;
                Cell::Tombstone { timestamp, local_deletion_time }
            } else if mask & MASK_EXPIRATION != 0 {
                let ttl = read_int::<u32, _>(r)? as i32;
                let expiration = read_int::<u32, _>(r)? as i32;
                let timestamp = read_int::<i64, _>(r)?;
                let value = read_string::<u32, _>(r)?;
                Cell::Live {
                    timestamp,
                    ttl: Some(ttl),
                    expiry: Some(expiration),
                    value,
                }
            } else if mask & MASK_COUNTER != 0 {
                let _timestamp_of_last_delete = read_int::<i64, _>(r)?;
                let timestamp = read_int::<i64, _>(r)?;
                let blob = read_string::<u32, _>(r)?;
                Cell::Counter { timestamp, shards: decode_counter_shards(&blob)? }
            } else {
                let timestamp = read_int::<i64, _>(r)?;
                let value = read_string::<u32, _>(r)?;
                Cell::Live { timestamp, ttl: None, expiry: None, value }
            };

            let name = self.parse_name(&name_bytes)?;
            self.apply_cell(&mut content, &mut current, name, cell)?;
        }
        self.flush_row(&mut content, &mut current);
        Ok(content)
    }

    /// Make `current` hold the row at `(is_static, clustering)`, flushing
    /// the previous row when the position changed.
    fn ensure_row(
        &self,
        content: &mut LegacyPartitionContent,
        current: &mut Option<(bool, ClusteringPrefix, ClusteringRow)>,
        is_static: bool,
        clustering: ClusteringPrefix,
    ) {
        let switch = match current {
            Some((cur_static, cur_clustering, _)) => {
                *cur_static != is_static || *cur_clustering != clustering
            }
            None => true,
        };
        if switch {
            self.flush_row(content, current);
            *current = Some((
                is_static,
                clustering.clone(),
                ClusteringRow {
                    clustering,
                    marker: None,
                    deletion: None,
                    cells: RowCells::new(),
                },
            ));
        }
    }

    fn apply_cell(
        &self,
        content: &mut LegacyPartitionContent,
        current: &mut Option<(bool, ClusteringPrefix, ClusteringRow)>,
        name: CellName,
        cell: Cell,
    ) -> Result<()> {
        self.ensure_row(content, current, name.is_static, name.clustering.clone());
        let Some((_, _, row)) = current else {
            return Err(SstableError::MalformedSstable("no row in progress".into()));
        };
        if name.column.is_empty() && name.path.is_none() {
            // the row marker cell
            if let Cell::Live { timestamp, ttl, expiry, .. } = cell {
                row.marker = Some(LivenessInfo {
                    timestamp,
                    ttl,
                    local_deletion_time: expiry,
                });
            }
            return Ok(());
        }
        match name.path {
            None => {
                row.cells.insert(name.column, ColumnValue::Atomic(cell));
            }
            Some(path) => {
                let entry = row
                    .cells
                    .entry(name.column)
                    .or_insert_with(|| ColumnValue::Complex(CollectionMutation::default()));
                if let ColumnValue::Complex(complex) = entry {
                    complex.cells.push((path, cell));
                }
            }
        }
        Ok(())
    }

    fn apply_range_tombstone(
        &self,
        content: &mut LegacyPartitionContent,
        current: &mut Option<(bool, ClusteringPrefix, ClusteringRow)>,
        start: CellName,
        end: CellName,
        tombstone: Tombstone,
    ) -> Result<()> {
        // A collection tombstone addresses a column inside a row.
        if !start.column.is_empty() {
            let column = start.column.clone();
            self.ensure_row(content, current, start.is_static, start.clustering);
            if let Some((_, _, row)) = current {
                let entry = row
                    .cells
                    .entry(column)
                    .or_insert_with(|| ColumnValue::Complex(CollectionMutation::default()));
                if let ColumnValue::Complex(complex) = entry {
                    complex.tombstone = Some(tombstone);
                }
            }
            return Ok(());
        }
        // A row deletion covers exactly one clustering.
        if start.clustering == end.clustering
            && start.clustering.len() == self.schema.clustering_types.len()
            && start.eoc as u8 == EOC_START
            && end.eoc as u8 == EOC_END
        {
            self.ensure_row(content, current, false, start.clustering);
            if let Some((_, _, row)) = current {
                row.deletion = Some(RowDeletion { tombstone, shadowable: false });
            }
            return Ok(());
        }
        // Everything else is a real range tombstone.
        self.flush_row(content, current);
        let start_kind = if start.eoc as u8 == EOC_END {
            BoundKind::ExclStart
        } else {
            BoundKind::InclStart
        };
        let end_kind = if end.eoc as u8 == EOC_START {
            BoundKind::ExclEnd
        } else {
            BoundKind::InclEnd
        };
        content.items.push(LegacyItem::RangeTombstone(RangeTombstone {
            start: ClusteringBound { prefix: start.clustering, kind: start_kind },
            end: ClusteringBound { prefix: end.clustering, kind: end_kind },
            tombstone,
        }));
        Ok(())
    }

    fn flush_row(
        &self,
        content: &mut LegacyPartitionContent,
        current: &mut Option<(bool, ClusteringPrefix, ClusteringRow)>,
    ) {
        if let Some((is_static, _, row)) = current.take() {
            if is_static {
                content.static_row = Some(StaticRow { cells: row.cells });
            } else {
                content.items.push(LegacyItem::Row(row));
            }
        }
    }
}

/// A row or range tombstone reconstructed from the legacy framing.
#[derive(Debug, Clone, PartialEq)]
pub enum LegacyItem {
    /// A clustering row.
    Row(ClusteringRow),
    /// A range tombstone.
    RangeTombstone(RangeTombstone),
}

/// Everything one legacy partition record contained after the header.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LegacyPartitionContent {
    /// The static row, when static cells were present.
    pub static_row: Option<StaticRow>,
    /// Rows and range tombstones, in on-disk order.
    pub items: Vec<LegacyItem>,
}
