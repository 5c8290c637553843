//! Data-file framing: the per-partition record encodings.
//!
//! Two families exist. The legacy layouts (`ka`/`la`) are column-oriented:
//! a partition is a run of named cells with per-cell masks and an
//! end-of-row sentinel. The modern layout (`mc`) is row-grouped: rows and
//! range-tombstone markers carry flag bytes, delta-encoded times and
//! missing-column bitmaps.
//!
//! Both families share the plain `deletion_time` struct and the counter
//! shard blob, which live here.

pub mod legacy;
pub mod modern;

#[cfg(test)]
mod tests;

use std::io::{Read, Write};

use crate::encoding::{read_int, write_int, FixedInt, Result as EncResult};
use crate::model::{CounterShard, Tombstone};

/// Serialize a tombstone as the plain on-disk `deletion_time` struct:
/// `i32 local_deletion_time, i64 marked_for_delete_at`, big-endian.
pub fn write_deletion_time<W: Write>(w: &mut W, t: Tombstone) -> EncResult<()> {
    write_int(w, t.deletion_time)?;
    write_int(w, t.timestamp)?;
    Ok(())
}

/// Parse a plain `deletion_time` struct.
pub fn read_deletion_time<R: Read>(r: &mut R) -> EncResult<Tombstone> {
    let deletion_time = read_int::<i32, _>(r)?;
    let timestamp = read_int::<i64, _>(r)?;
    Ok(Tombstone { timestamp, deletion_time })
}

/// Serialize counter shards as the cell-value blob:
/// `u16 count, count × (16-byte id, i64 clock, i64 value)`.
pub fn encode_counter_shards(shards: &[CounterShard]) -> EncResult<Vec<u8>> {
    let mut buf = Vec::with_capacity(2 + shards.len() * 32);
    write_int(&mut buf, u16::from_len(shards.len(), "counter shard count")?)?;
    for shard in shards {
        buf.extend_from_slice(&shard.id);
        write_int(&mut buf, shard.clock)?;
        write_int(&mut buf, shard.value)?;
    }
    Ok(buf)
}

/// Parse a counter-shard cell-value blob.
pub fn decode_counter_shards(bytes: &[u8]) -> EncResult<Vec<CounterShard>> {
    let mut r = std::io::Cursor::new(bytes);
    let count = read_int::<u16, _>(&mut r)?.as_len()?;
    let mut shards = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        let mut id = [0u8; 16];
        r.read_exact(&mut id)?;
        let clock = read_int(&mut r)?;
        let value = read_int(&mut r)?;
        shards.push(CounterShard { id, clock, value });
    }
    Ok(shards)
}
