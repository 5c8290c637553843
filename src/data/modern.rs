//! Row-grouped data framing for the `mc` layout.
//!
//! # Partition record
//!
//! ```text
//! u16-string partition_key
//! deletion_time partition_tombstone
//! optional static_row
//! zero-or-more (clustering_row | rt_marker)
//! u8 flags = END_OF_PARTITION
//! ```
//!
//! Rows carry a flag byte (optionally an extended flag byte), the
//! clustering, two size vints, delta-encoded liveness and deletion info, a
//! missing-columns bitmap when not all header columns are present, then the
//! cells. Range-tombstone markers carry a bound kind, a sized clustering
//! prefix, the same size vints and one tombstone — or two for boundary
//! kinds, which close one range and open the next at a shared prefix.
//!
//! Timestamps, TTLs and local deletion times are stored as zig-zag vints
//! of deltas: timestamps against the serialization header's minimum, TTLs
//! and deletion times against the fixed epochs. Delta arithmetic wraps, so
//! the live-tombstone sentinel survives a round trip.

use std::io::{Read, Write};

use crate::components::statistics::{
    EncodingStats, SerializationHeaderMetadata, DELETION_TIME_EPOCH, TTL_EPOCH,
};
use crate::data::{
    decode_counter_shards, encode_counter_shards, read_deletion_time, write_deletion_time,
};
use crate::encoding::{
    read_int, read_raw, read_signed_vint, read_string, read_string_vint, read_vint, write_int,
    write_signed_vint, write_string, write_string_vint, write_vint, EncodingError, FixedInt,
};
use crate::error::{Result, SstableError};
use crate::model::{
    BoundKind, Cell, ClusteringPrefix, ClusteringRow, CollectionMutation, ColumnValue,
    LivenessInfo, RowCells, RowDeletion, StaticRow, Tombstone,
};

// ------------------------------------------------------------------------------------------------
// Flags
// ------------------------------------------------------------------------------------------------

/// Nothing follows a flags byte carrying this bit.
pub const FLAG_END_OF_PARTITION: u8 = 0x01;
/// The unfiltered is a range-tombstone marker, not a row.
pub const FLAG_IS_MARKER: u8 = 0x02;
/// The row has a timestamp (its liveness info is not empty).
pub const FLAG_HAS_TIMESTAMP: u8 = 0x04;
/// The row liveness carries TTL and local deletion time.
pub const FLAG_HAS_TTL: u8 = 0x08;
/// The row has deletion info.
pub const FLAG_HAS_DELETION: u8 = 0x10;
/// Every column of the header is present; no bitmap follows.
pub const FLAG_HAS_ALL_COLUMNS: u8 = 0x20;
/// At least one complex column carries its own deletion.
pub const FLAG_HAS_COMPLEX_DELETION: u8 = 0x40;
/// An extended-flags byte follows.
pub const FLAG_EXTENSION: u8 = 0x80;

/// Extended flag: the row is the static row.
pub const EXT_FLAG_IS_STATIC: u8 = 0x01;
/// Extended flag a foreign implementation uses for shadowable deletion;
/// rejected on read.
pub const EXT_FLAG_SHADOWABLE_FOREIGN: u8 = 0x02;
/// Extended flag: a shadowable tombstone follows the row deletion.
pub const EXT_FLAG_SHADOWABLE: u8 = 0x80;

/// Cell flag: the cell is a tombstone.
pub const CELL_IS_DELETED: u8 = 0x01;
/// Cell flag: the cell is expiring.
pub const CELL_IS_EXPIRING: u8 = 0x02;
/// Cell flag: the cell has no value bytes.
pub const CELL_HAS_EMPTY_VALUE: u8 = 0x04;
/// Cell flag: the cell reuses the row timestamp.
pub const CELL_USE_ROW_TIMESTAMP: u8 = 0x08;
/// Cell flag: the cell reuses the row TTL.
pub const CELL_USE_ROW_TTL: u8 = 0x10;

// ------------------------------------------------------------------------------------------------
// The serializer
// ------------------------------------------------------------------------------------------------

/// An unfiltered item of the modern data stream: a row or a marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtMarker {
    /// Prefix the marker sits at.
    pub clustering: ClusteringPrefix,
    /// Bound or boundary kind.
    pub kind: BoundKind,
    /// The closing tombstone for end kinds, the opening one for start
    /// kinds.
    pub tombstone: Tombstone,
    /// The opening tombstone of a boundary kind.
    pub boundary_tombstone: Option<Tombstone>,
}

/// Serializer for the modern row-grouped framing. Stateless apart from the
/// header it deltas against; the writer pipeline owns all positional state
/// and passes sizes in.
pub struct ModernSerializer<'a> {
    header: &'a SerializationHeaderMetadata,
    /// Back-compat switch: when false, non-compound range-tombstone bounds
    /// are emitted with the historical broken encoding.
    pub correct_non_compound_rts: bool,
}

impl<'a> ModernSerializer<'a> {
    /// A serializer deltaing against `header`.
    pub fn new(header: &'a SerializationHeaderMetadata) -> Self {
        Self { header, correct_non_compound_rts: true }
    }

    fn stats(&self) -> &EncodingStats {
        &self.header.encoding_stats
    }

    pub(crate) fn write_delta_timestamp<W: Write>(&self, w: &mut W, ts: i64) -> Result<()> {
        write_signed_vint(w, ts.wrapping_sub(self.stats().min_timestamp))?;
        Ok(())
    }

    pub(crate) fn write_delta_ttl<W: Write>(&self, w: &mut W, ttl: i32) -> Result<()> {
        write_signed_vint(w, i64::from(ttl).wrapping_sub(i64::from(TTL_EPOCH)))?;
        Ok(())
    }

    pub(crate) fn write_delta_ldt<W: Write>(&self, w: &mut W, ldt: i32) -> Result<()> {
        write_signed_vint(w, i64::from(ldt).wrapping_sub(i64::from(DELETION_TIME_EPOCH)))?;
        Ok(())
    }

    pub(crate) fn write_delta_deletion<W: Write>(&self, w: &mut W, t: Tombstone) -> Result<()> {
        self.write_delta_timestamp(w, t.timestamp)?;
        self.write_delta_ldt(w, t.deletion_time)?;
        Ok(())
    }

    /// Write one clustering component at position `i` of the prefix.
    pub(crate) fn write_clustering_component<W: Write>(&self, w: &mut W, i: usize, v: &[u8]) -> Result<()> {
        match self.header.clustering_fixed_len(i) {
            Some(fixed) => {
                if v.len() != fixed {
                    return Err(SstableError::MalformedSstable(format!(
                        "clustering component {i} is {} bytes, type wants {fixed}",
                        v.len()
                    )));
                }
                w.write_all(v).map_err(SstableError::Io)?;
            }
            None => write_string_vint(w, v)?,
        }
        Ok(())
    }

    pub(crate) fn write_clustering_prefix<W: Write>(&self, w: &mut W, p: &ClusteringPrefix) -> Result<()> {
        for (i, v) in p.components.iter().enumerate() {
            self.write_clustering_component(w, i, v)?;
        }
        Ok(())
    }

    /// Write the partition header: key plus the plain partition tombstone.
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

    /// Write the end-of-partition sentinel.
    pub fn write_end_of_partition<W: Write>(&self, w: &mut W) -> Result<()> {
        write_int(w, FLAG_END_OF_PARTITION)?;
        Ok(())
    }

    fn missing_columns_bitmap(&self, is_static: bool, cells: &RowCells) -> Result<Vec<u8>> {
        let columns = if is_static {
            &self.header.static_columns
        } else {
            &self.header.regular_columns
        };
        let n = columns.len();
        let missing: Vec<usize> = columns
            .iter()
            .enumerate()
            .filter(|(_, c)| !cells.contains_key(&c.name))
            .map(|(i, _)| i)
            .collect();
        let mut buf = Vec::new();
        if n <= 64 {
            let mut mask = 0u64;
            for i in &missing {
                mask |= 1 << i;
            }
            write_vint(&mut buf, mask)?;
        } else {
            let m = missing.len();
            write_vint(&mut buf, m as u64)?;
            if m < n / 2 {
                for i in missing {
                    write_vint(&mut buf, i as u64)?;
                }
            } else {
                for (i, c) in columns.iter().enumerate() {
                    if cells.contains_key(&c.name) {
                        write_vint(&mut buf, i as u64)?;
                    }
                }
            }
        }
        Ok(buf)
    }

    fn write_cell<W: Write>(
        &self,
        w: &mut W,
        cell: &Cell,
        fixed_len: Option<usize>,
        path: Option<&[u8]>,
        row_liveness: Option<&LivenessInfo>,
    ) -> Result<()> {
        let (timestamp, value, ttl, expiry, deleted) = match cell {
            Cell::Live { timestamp, ttl, expiry, value } => {
                (*timestamp, Some(value.as_slice()), *ttl, *expiry, None)
            }
            Cell::Tombstone { timestamp, local_deletion_time } => {
                (*timestamp, None, None, None, Some(*local_deletion_time))
            }
            Cell::Counter { timestamp, .. } => (*timestamp, None, None, None, None),
        };
        let counter_blob = match cell {
            Cell::Counter { shards, .. } => Some(encode_counter_shards(shards)?),
            _ => None,
        };
        let value: Option<&[u8]> = counter_blob.as_deref().or(value);

        let use_row_timestamp =
            row_liveness.map(|l| l.timestamp == timestamp).unwrap_or(false);
        let use_row_ttl = row_liveness
            .map(|l| ttl.is_some() && l.ttl == ttl && l.local_deletion_time == expiry)
            .unwrap_or(false);
        let is_expiring = ttl.is_some();
        let is_deleted = deleted.is_some();
        let has_empty_value = value.map(|v| v.is_empty()).unwrap_or(true);

        let mut flags = 0u8;
        if is_deleted {
            flags |= CELL_IS_DELETED;
        }
        if is_expiring {
            flags |= CELL_IS_EXPIRING;
        }
        if has_empty_value {
            flags |= CELL_HAS_EMPTY_VALUE;
        }
        if use_row_timestamp {
            flags |= CELL_USE_ROW_TIMESTAMP;
        }
        if use_row_ttl {
            flags |= CELL_USE_ROW_TTL;
        }
        write_int(w, flags)?;

        if !use_row_timestamp {
            self.write_delta_timestamp(w, timestamp)?;
        }
        if (is_deleted || is_expiring) && !use_row_ttl {
            let ldt = deleted.or(expiry).unwrap_or(i32::MAX);
            self.write_delta_ldt(w, ldt)?;
        }
        if is_expiring && !use_row_ttl {
            self.write_delta_ttl(w, ttl.unwrap_or(0))?;
        }
        if let Some(path) = path {
            write_string_vint(w, path)?;
        }
        if let Some(value) = value {
            if !value.is_empty() {
                match fixed_len {
                    Some(fixed) if counter_blob.is_none() => {
                        if value.len() != fixed {
                            return Err(SstableError::MalformedSstable(format!(
                                "cell value is {} bytes, type wants {fixed}",
                                value.len()
                            )));
                        }
                        w.write_all(value).map_err(SstableError::Io)?;
                    }
                    _ => write_string_vint(w, value)?,
                }
            }
        }
        Ok(())
    }

    fn column_fixed_len(&self, is_static: bool, name: &[u8]) -> Option<usize> {
        let columns = if is_static {
            &self.header.static_columns
        } else {
            &self.header.regular_columns
        };
        columns
            .iter()
            .find(|c| c.name == name)
            .and_then(|c| crate::model::ColumnType::from_name(&c.type_name))
            .and_then(|t| t.fixed_len())
    }

    /// Serialize the body shared by static and clustering rows into `buf`:
    /// liveness, deletion, bitmap and cells — everything after the size
    /// vints.
    #[allow(clippy::too_many_arguments)]
    fn render_row_body(
        &self,
        buf: &mut Vec<u8>,
        is_static: bool,
        marker: Option<&LivenessInfo>,
        deletion: Option<&RowDeletion>,
        cells: &RowCells,
        has_all_columns: bool,
        has_complex_deletion: bool,
    ) -> Result<()> {
        if let Some(l) = marker {
            self.write_delta_timestamp(buf, l.timestamp)?;
            if let (Some(ttl), Some(ldt)) = (l.ttl, l.local_deletion_time) {
                self.write_delta_ttl(buf, ttl)?;
                self.write_delta_ldt(buf, ldt)?;
            }
        }
        if let Some(d) = deletion {
            self.write_delta_deletion(buf, d.tombstone)?;
            if d.shadowable {
                // shadowable tombstone repeats after the row deletion
                self.write_delta_deletion(buf, d.tombstone)?;
            }
        }
        if !has_all_columns {
            let bitmap = self.missing_columns_bitmap(is_static, cells)?;
            buf.extend_from_slice(&bitmap);
        }
        // simple cells first, complex columns after, both in header order
        let columns = if is_static {
            &self.header.static_columns
        } else {
            &self.header.regular_columns
        };
        for column in columns {
            match cells.get(&column.name) {
                Some(ColumnValue::Atomic(cell)) => {
                    let fixed = self.column_fixed_len(is_static, &column.name);
                    self.write_cell(buf, cell, fixed, None, marker)?;
                }
                Some(ColumnValue::Complex(_)) | None => {}
            }
        }
        for column in columns {
            if let Some(ColumnValue::Complex(complex)) = cells.get(&column.name) {
                if has_complex_deletion {
                    self.write_delta_deletion(
                        buf,
                        complex.tombstone.unwrap_or(Tombstone::NONE),
                    )?;
                }
                write_vint(buf, complex.cells.len() as u64)?;
                let fixed = self.column_fixed_len(is_static, &column.name);
                for (path, cell) in &complex.cells {
                    self.write_cell(buf, cell, fixed, Some(path), marker)?;
                }
            }
        }
        Ok(())
    }

    fn row_flags(
        &self,
        is_static: bool,
        marker: Option<&LivenessInfo>,
        deletion: Option<&RowDeletion>,
        cells: &RowCells,
    ) -> (u8, Option<u8>, bool, bool) {
        let columns = if is_static {
            &self.header.static_columns
        } else {
            &self.header.regular_columns
        };
        let has_all_columns = columns.iter().all(|c| cells.contains_key(&c.name));
        let has_complex_deletion = cells
            .values()
            .any(|v| matches!(v, ColumnValue::Complex(c) if c.tombstone.is_some()));

        let mut flags = 0u8;
        let mut extended = None;
        if let Some(l) = marker {
            flags |= FLAG_HAS_TIMESTAMP;
            if l.ttl.is_some() {
                flags |= FLAG_HAS_TTL;
            }
        }
        if deletion.is_some() {
            flags |= FLAG_HAS_DELETION;
        }
        if has_all_columns {
            flags |= FLAG_HAS_ALL_COLUMNS;
        }
        if has_complex_deletion {
            flags |= FLAG_HAS_COMPLEX_DELETION;
        }
        if is_static {
            flags |= FLAG_EXTENSION;
            extended = Some(EXT_FLAG_IS_STATIC);
        } else if deletion.map(|d| d.shadowable).unwrap_or(false) {
            flags |= FLAG_EXTENSION;
            extended = Some(EXT_FLAG_SHADOWABLE);
        }
        (flags, extended, has_all_columns, has_complex_deletion)
    }

    /// Write the static row. Returns the bytes written.
    pub fn write_static_row<W: Write>(&self, w: &mut W, row: &StaticRow) -> Result<u64> {
        let (flags, extended, has_all, has_complex) =
            self.row_flags(true, None, None, &row.cells);
        let mut body = Vec::new();
        self.render_row_body(&mut body, true, None, None, &row.cells, has_all, has_complex)?;

        let mut out = Vec::new();
        write_int(&mut out, flags)?;
        if let Some(ext) = extended {
            write_int(&mut out, ext)?;
        }
        write_vint(&mut out, body.len() as u64)?;
        // previous-row size is fixed to zero for the static row
        write_vint(&mut out, 0)?;
        out.extend_from_slice(&body);
        w.write_all(&out).map_err(SstableError::Io)?;
        Ok(out.len() as u64)
    }

    /// Write a clustering row. `prev_size` is the serialized size of the
    /// previous unfiltered. Returns the bytes written.
    pub fn write_clustering_row<W: Write>(
        &self,
        w: &mut W,
        row: &ClusteringRow,
        prev_size: u64,
    ) -> Result<u64> {
        let (flags, extended, has_all, has_complex) = self.row_flags(
            false,
            row.marker.as_ref(),
            row.deletion.as_ref(),
            &row.cells,
        );
        let mut body = Vec::new();
        self.render_row_body(
            &mut body,
            false,
            row.marker.as_ref(),
            row.deletion.as_ref(),
            &row.cells,
            has_all,
            has_complex,
        )?;

        let mut out = Vec::new();
        write_int(&mut out, flags)?;
        if let Some(ext) = extended {
            write_int(&mut out, ext)?;
        }
        self.write_clustering_prefix(&mut out, &row.clustering)?;
        write_vint(&mut out, body.len() as u64)?;
        write_vint(&mut out, prev_size)?;
        out.extend_from_slice(&body);
        w.write_all(&out).map_err(SstableError::Io)?;
        Ok(out.len() as u64)
    }

    /// Write a range-tombstone marker. Returns the bytes written.
    pub fn write_rt_marker<W: Write>(
        &self,
        w: &mut W,
        marker: &RtMarker,
        prev_size: u64,
    ) -> Result<u64> {
        let mut body = Vec::new();
        self.write_delta_deletion(&mut body, marker.tombstone)?;
        if let Some(boundary) = marker.boundary_tombstone {
            if !marker.kind.is_boundary() {
                return Err(SstableError::MalformedSstable(
                    "boundary tombstone on a non-boundary marker".into(),
                ));
            }
            self.write_delta_deletion(&mut body, boundary)?;
        } else if marker.kind.is_boundary() {
            return Err(SstableError::MalformedSstable(
                "boundary marker without its second tombstone".into(),
            ));
        }

        let mut out = Vec::new();
        write_int(&mut out, FLAG_IS_MARKER)?;
        write_int(&mut out, marker.kind.ordinal())?;
        write_int(
            &mut out,
            u16::from_len(marker.clustering.len(), "marker clustering size")?,
        )?;
        if self.correct_non_compound_rts {
            self.write_clustering_prefix(&mut out, &marker.clustering)?;
        } else {
            // Historical quirk kept for interop with peers that expect
            // non-compound bounds wrapped in a composite:
            // [u16 len][bytes][0x00] per component.
            for v in &marker.clustering.components {
                write_int(&mut out, u16::from_len(v.len(), "composite component")?)?;
                out.extend_from_slice(v);
                write_int(&mut out, 0u8)?;
            }
        }
        write_vint(&mut out, body.len() as u64)?;
        write_vint(&mut out, prev_size)?;
        out.extend_from_slice(&body);
        w.write_all(&out).map_err(SstableError::Io)?;
        Ok(out.len() as u64)
    }
}

// ------------------------------------------------------------------------------------------------
// The parser
// ------------------------------------------------------------------------------------------------

/// One parsed unfiltered of the modern data stream.
#[derive(Debug, Clone, PartialEq)]
pub enum Unfiltered {
    /// A static or clustering row; static when `is_static`.
    Row {
        /// Whether this is the static row.
        is_static: bool,
        /// The parsed row; clustering is empty for the static row.
        row: ClusteringRow,
    },
    /// A range-tombstone marker.
    Marker(RtMarker),
    /// End of the partition.
    EndOfPartition,
}

/// Parser for the modern framing, mirroring [`ModernSerializer`].
pub struct ModernParser<'a> {
    header: &'a SerializationHeaderMetadata,
}

impl<'a> ModernParser<'a> {
    /// A parser deltaing against `header`.
    pub fn new(header: &'a SerializationHeaderMetadata) -> Self {
        Self { header }
    }

    fn stats(&self) -> &EncodingStats {
        &self.header.encoding_stats
    }

    pub(crate) fn read_delta_timestamp<R: Read>(&self, r: &mut R) -> Result<i64> {
        Ok(read_signed_vint(r)?.wrapping_add(self.stats().min_timestamp))
    }

    pub(crate) fn read_delta_ttl<R: Read>(&self, r: &mut R) -> Result<i32> {
        Ok(read_signed_vint(r)?.wrapping_add(i64::from(TTL_EPOCH)) as i32)
    }

    pub(crate) fn read_delta_ldt<R: Read>(&self, r: &mut R) -> Result<i32> {
        Ok(read_signed_vint(r)?.wrapping_add(i64::from(DELETION_TIME_EPOCH)) as i32)
    }

    pub(crate) fn read_delta_deletion<R: Read>(&self, r: &mut R) -> Result<Tombstone> {
        let timestamp = self.read_delta_timestamp(r)?;
        let deletion_time = self.read_delta_ldt(r)?;
        Ok(Tombstone { timestamp, deletion_time })
    }

    pub(crate) fn read_clustering_component<R: Read>(&self, r: &mut R, i: usize) -> Result<Vec<u8>> {
        match self.header.clustering_fixed_len(i) {
            Some(fixed) => Ok(read_raw(r, fixed, "clustering component")?),
            None => Ok(read_string_vint(r)?),
        }
    }

    pub(crate) fn read_clustering_prefix<R: Read>(&self, r: &mut R, len: usize) -> Result<ClusteringPrefix> {
        let mut components = Vec::with_capacity(len);
        for i in 0..len {
            components.push(self.read_clustering_component(r, i)?);
        }
        Ok(ClusteringPrefix { components })
    }

    /// Parse the partition header: `(key, partition tombstone)`.
    pub fn read_partition_header<R: Read>(&self, r: &mut R) -> Result<(Vec<u8>, Tombstone)> {
        let key = read_string::<u16, _>(r)?;
        let tombstone = read_deletion_time(r)?;
        Ok((key, tombstone))
    }

    fn read_missing_columns<R: Read>(&self, r: &mut R, is_static: bool) -> Result<Vec<bool>> {
        let columns = if is_static {
            &self.header.static_columns
        } else {
            &self.header.regular_columns
        };
        let n = columns.len();
        let mut present = vec![true; n];
        if n <= 64 {
            let mask = read_vint(r)?;
            for (i, p) in present.iter_mut().enumerate() {
                if mask & (1 << i) != 0 {
                    *p = false;
                }
            }
        } else {
            let missing_count = read_vint(r)? as usize;
            if missing_count < n / 2 {
                for _ in 0..missing_count {
                    let i = read_vint(r)? as usize;
                    if i >= n {
                        return Err(SstableError::MalformedSstable(format!(
                            "missing-column index {i} out of range"
                        )));
                    }
                    present[i] = false;
                }
            } else {
                present = vec![false; n];
                for _ in 0..n - missing_count {
                    let i = read_vint(r)? as usize;
                    if i >= n {
                        return Err(SstableError::MalformedSstable(format!(
                            "present-column index {i} out of range"
                        )));
                    }
                    present[i] = true;
                }
            }
        }
        Ok(present)
    }

    fn read_cell<R: Read>(
        &self,
        r: &mut R,
        column_type: Option<crate::model::ColumnType>,
        complex: bool,
        row_liveness: Option<&LivenessInfo>,
    ) -> Result<(Option<Vec<u8>>, Cell)> {
        let flags = read_int::<u8, _>(r)?;
        let is_deleted = flags & CELL_IS_DELETED != 0;
        let is_expiring = flags & CELL_IS_EXPIRING != 0;
        let has_empty_value = flags & CELL_HAS_EMPTY_VALUE != 0;
        let use_row_timestamp = flags & CELL_USE_ROW_TIMESTAMP != 0;
        let use_row_ttl = flags & CELL_USE_ROW_TTL != 0;

        let timestamp = if use_row_timestamp {
            row_liveness
                .map(|l| l.timestamp)
                .ok_or_else(|| SstableError::MalformedSstable(
                    "cell reuses row timestamp but the row has none".into(),
                ))?
        } else {
            self.read_delta_timestamp(r)?
        };
        let mut ldt = None;
        let mut ttl = None;
        if (is_deleted || is_expiring) && !use_row_ttl {
            ldt = Some(self.read_delta_ldt(r)?);
        }
        if is_expiring && !use_row_ttl {
            ttl = Some(self.read_delta_ttl(r)?);
        }
        if is_expiring && use_row_ttl {
            let liveness = row_liveness.ok_or_else(|| {
                SstableError::MalformedSstable("cell reuses row TTL but the row has none".into())
            })?;
            ttl = liveness.ttl;
            ldt = liveness.local_deletion_time;
        }
        let path = if complex {
            Some(read_string_vint(r)?)
        } else {
            None
        };
        let value = if has_empty_value {
            Vec::new()
        } else {
            match column_type.and_then(|t| t.fixed_len()) {
                Some(fixed) => read_raw(r, fixed, "cell value")?,
                None => read_string_vint(r)?,
            }
        };

        let cell = if is_deleted {
            Cell::Tombstone {
                timestamp,
                local_deletion_time: ldt.unwrap_or(i32::MAX),
            }
        } else if column_type == Some(crate::model::ColumnType::Counter) {
            Cell::Counter {
                timestamp,
                shards: decode_counter_shards(&value)?,
            }
        } else {
            Cell::Live {
                timestamp,
                ttl,
                expiry: if is_expiring { ldt } else { None },
                value,
            }
        };
        Ok((path, cell))
    }

    fn read_row_body<R: Read>(
        &self,
        r: &mut R,
        is_static: bool,
        flags: u8,
        shadowable: bool,
    ) -> Result<(Option<LivenessInfo>, Option<RowDeletion>, RowCells)> {
        let marker = if flags & FLAG_HAS_TIMESTAMP != 0 {
            let timestamp = self.read_delta_timestamp(r)?;
            let (ttl, ldt) = if flags & FLAG_HAS_TTL != 0 {
                (Some(self.read_delta_ttl(r)?), Some(self.read_delta_ldt(r)?))
            } else {
                (None, None)
            };
            Some(LivenessInfo { timestamp, ttl, local_deletion_time: ldt })
        } else {
            None
        };
        let deletion = if flags & FLAG_HAS_DELETION != 0 {
            let tombstone = self.read_delta_deletion(r)?;
            if shadowable {
                // the shadowable copy follows; identical by construction
                let _ = self.read_delta_deletion(r)?;
            }
            Some(RowDeletion { tombstone, shadowable })
        } else {
            None
        };

        let columns = if is_static {
            &self.header.static_columns
        } else {
            &self.header.regular_columns
        };
        let present = if flags & FLAG_HAS_ALL_COLUMNS != 0 {
            vec![true; columns.len()]
        } else {
            self.read_missing_columns(r, is_static)?
        };
        let has_complex_deletion = flags & FLAG_HAS_COMPLEX_DELETION != 0;

        let mut cells = RowCells::new();
        // simple cells first, then complex columns, both in header order
        for (column, present) in columns.iter().zip(&present) {
            if !present || Self::column_is_complex(column) {
                continue;
            }
            let ty = crate::model::ColumnType::from_name(&column.type_name);
            let (_, cell) = self.read_cell(r, ty, false, marker.as_ref())?;
            cells.insert(column.name.clone(), ColumnValue::Atomic(cell));
        }
        for (column, present) in columns.iter().zip(&present) {
            if !present || !Self::column_is_complex(column) {
                continue;
            }
            let tombstone = if has_complex_deletion {
                let t = self.read_delta_deletion(r)?;
                if t.is_live() {
                    None
                } else {
                    Some(t)
                }
            } else {
                None
            };
            let count = read_vint(r)? as usize;
            let ty = crate::model::ColumnType::from_name(&column.type_name);
            let mut sub = Vec::with_capacity(count.min(1024));
            for _ in 0..count {
                let (path, cell) = self.read_cell(r, ty, true, marker.as_ref())?;
                let path = path.ok_or_else(|| {
                    SstableError::MalformedSstable("complex cell without a path".into())
                })?;
                sub.push((path, cell));
            }
            cells.insert(
                column.name.clone(),
                ColumnValue::Complex(CollectionMutation { tombstone, cells: sub }),
            );
        }
        Ok((marker, deletion, cells))
    }

    fn column_is_complex(column: &crate::components::statistics::ColumnSpec) -> bool {
        // complex columns are flagged by a type-name suffix in the header
        column.type_name.ends_with("+multicell")
    }

    /// Parse the next unfiltered. The stream must be positioned at a flags
    /// byte.
    pub fn read_unfiltered<R: Read>(&self, r: &mut R) -> Result<Unfiltered> {
        let flags = read_int::<u8, _>(r)?;
        if flags & FLAG_END_OF_PARTITION != 0 {
            return Ok(Unfiltered::EndOfPartition);
        }
        if flags & FLAG_IS_MARKER != 0 {
            let kind_raw = read_int::<u8, _>(r)?;
            let kind = BoundKind::from_ordinal(kind_raw).ok_or(EncodingError::UnknownEnum {
                value: u64::from(kind_raw),
                enum_name: "BoundKind",
            })?;
            let size = read_int::<u16, _>(r)?.as_len().map_err(SstableError::from)?;
            let clustering = self.read_clustering_prefix(r, size)?;
            let _body_size = read_vint(r)?;
            let _prev_size = read_vint(r)?;
            let tombstone = self.read_delta_deletion(r)?;
            let boundary_tombstone = if kind.is_boundary() {
                Some(self.read_delta_deletion(r)?)
            } else {
                None
            };
            return Ok(Unfiltered::Marker(RtMarker {
                clustering,
                kind,
                tombstone,
                boundary_tombstone,
            }));
        }

        // a row
        let extended = if flags & FLAG_EXTENSION != 0 {
            read_int::<u8, _>(r)?
        } else {
            0
        };
        if extended & EXT_FLAG_SHADOWABLE_FOREIGN != 0 {
            return Err(SstableError::MalformedSstable(
                "deprecated foreign shadowable-deletion flag".into(),
            ));
        }
        let is_static = extended & EXT_FLAG_IS_STATIC != 0;
        let shadowable = extended & EXT_FLAG_SHADOWABLE != 0;

        let clustering = if is_static {
            ClusteringPrefix::empty()
        } else {
            self.read_clustering_prefix(r, self.header.clustering_types.len())?
        };
        let _body_size = read_vint(r)?;
        let _prev_size = read_vint(r)?;
        let (marker, deletion, cells) = self.read_row_body(r, is_static, flags, shadowable)?;
        Ok(Unfiltered::Row {
            is_static,
            row: ClusteringRow { clustering, marker, deletion, cells },
        })
    }
}
