//! Sealing, publication, segmentation and reporting behavior.

use std::fs;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tempfile::TempDir;

use super::helpers::*;
use crate::components::{ComponentType, Version};
use crate::model::*;
use crate::writer::*;

/// `leave_unsealed` stops right before the publication rename.
#[test]
fn leave_unsealed_skips_the_rename() {
    init_tracing();
    let tmp = TempDir::new().unwrap();

    let events = vec![
        PartitionEvent::PartitionStart { key: pk(1), tombstone: Tombstone::NONE },
        PartitionEvent::Row(row(1, 10, 1)),
        PartitionEvent::PartitionEnd,
    ];
    let desc = descriptor(tmp.path(), Version::Mc, 1);
    let writer = SstableWriter::create(
        desc.clone(),
        test_schema(),
        Arc::new(ByteOrderedPartitioner),
        4,
        WriterConfig { leave_unsealed: true, ..WriterConfig::default() },
    )
    .unwrap();
    writer.write_stream(events).unwrap();

    assert!(desc.path(&ComponentType::TemporaryToc).exists());
    assert!(!desc.path(&ComponentType::Toc).exists());
    // all data components exist regardless
    assert!(desc.path(&ComponentType::Data).exists());
    assert!(desc.path(&ComponentType::Summary).exists());
}

/// The size cap makes end-of-partition request segmentation.
#[test]
fn size_cap_requests_segmentation() {
    init_tracing();
    let tmp = TempDir::new().unwrap();

    let desc = descriptor(tmp.path(), Version::Mc, 1);
    let mut writer = SstableWriter::create(
        desc,
        test_schema(),
        Arc::new(ByteOrderedPartitioner),
        4,
        WriterConfig { max_sstable_size: 64, ..WriterConfig::default() },
    )
    .unwrap();

    writer.consume_new_partition(&pk(1)).unwrap();
    writer.consume_partition_tombstone(Tombstone::NONE).unwrap();
    for c in 0..16 {
        writer.consume_row(&row(c, 5, c)).unwrap();
    }
    let stop = writer.consume_end_of_partition().unwrap();
    assert_eq!(stop, StopIteration::Yes);
    writer.consume_end_of_stream().unwrap();
}

/// The large-partition handler fires above the threshold and the offender
/// lands in the Scylla metadata.
#[test]
fn large_partition_is_reported() {
    init_tracing();
    let tmp = TempDir::new().unwrap();

    struct Counting(AtomicU64);
    impl LargePartitionHandler for Counting {
        fn on_large_partition(&self, _key: &[u8], size: u64) {
            self.0.fetch_add(size, Ordering::Relaxed);
        }
    }
    let handler = Arc::new(Counting(AtomicU64::new(0)));

    let mut events = vec![PartitionEvent::PartitionStart {
        key: pk(1),
        tombstone: Tombstone::NONE,
    }];
    for c in 0..64 {
        events.push(PartitionEvent::Row(row(c, 5, c)));
    }
    events.push(PartitionEvent::PartitionEnd);

    let sstable = write_and_open(
        tmp.path(),
        Version::Mc,
        1,
        WriterConfig {
            large_partition_threshold: 100,
            large_partition_handler: handler.clone(),
            ..WriterConfig::default()
        },
        events,
    );
    assert!(handler.0.load(Ordering::Relaxed) > 100);
    let large = sstable.scylla.large_partitions.as_ref().unwrap();
    assert_eq!(large.len(), 1);
    assert_eq!(large[0].key, pk(1).key);
}

/// Monitor milestones fire in order.
#[test]
fn monitor_sees_all_milestones() {
    init_tracing();
    let tmp = TempDir::new().unwrap();

    #[derive(Default)]
    struct Recording {
        started: AtomicU64,
        data_done: AtomicU64,
        write_done: AtomicU64,
        flushed: AtomicU64,
    }
    impl WriteMonitor for Recording {
        fn on_write_started(&self) {
            self.started.fetch_add(1, Ordering::Relaxed);
        }
        fn on_data_write_completed(&self) {
            self.data_done.fetch_add(1, Ordering::Relaxed);
        }
        fn on_write_completed(&self) {
            self.write_done.fetch_add(1, Ordering::Relaxed);
        }
        fn on_flush_completed(&self) {
            self.flushed.fetch_add(1, Ordering::Relaxed);
        }
    }
    let monitor = Arc::new(Recording::default());

    let events = vec![
        PartitionEvent::PartitionStart { key: pk(1), tombstone: Tombstone::NONE },
        PartitionEvent::Row(row(1, 10, 1)),
        PartitionEvent::PartitionEnd,
    ];
    write_and_open(
        tmp.path(),
        Version::Mc,
        1,
        WriterConfig { monitor: monitor.clone(), ..WriterConfig::default() },
        events,
    );
    assert_eq!(monitor.started.load(Ordering::Relaxed), 1);
    assert_eq!(monitor.data_done.load(Ordering::Relaxed), 1);
    assert_eq!(monitor.write_done.load(Ordering::Relaxed), 1);
    assert_eq!(monitor.flushed.load(Ordering::Relaxed), 1);
}

/// Backups hard-link every component, TOC included.
#[test]
fn backup_links_all_components() {
    init_tracing();
    let tmp = TempDir::new().unwrap();

    let events = vec![
        PartitionEvent::PartitionStart { key: pk(1), tombstone: Tombstone::NONE },
        PartitionEvent::Row(row(1, 10, 1)),
        PartitionEvent::PartitionEnd,
    ];
    let sstable = write_and_open(
        tmp.path(),
        Version::Mc,
        1,
        WriterConfig { backup: true, ..WriterConfig::default() },
        events,
    );

    let backup_dir = tmp.path().join("backups");
    for component in sstable.all_components() {
        if matches!(component, ComponentType::TemporaryToc) {
            continue;
        }
        let mut backup_desc = sstable.desc.clone();
        backup_desc.dir = backup_dir.clone();
        assert!(
            backup_desc.path(component).exists(),
            "missing backup of {component:?}"
        );
    }
}

/// Statistics carry observed bounds and the replay position.
#[test]
fn statistics_capture_observed_bounds() {
    init_tracing();
    let tmp = TempDir::new().unwrap();

    let replay = crate::components::statistics::ReplayPosition { segment_id: 7, position: 99 };
    let mut events = vec![PartitionEvent::PartitionStart {
        key: pk(1),
        tombstone: Tombstone::NONE,
    }];
    for c in [1, 3, 8] {
        events.push(PartitionEvent::Row(row(c, 1000 + c as i64, c)));
    }
    events.push(PartitionEvent::PartitionEnd);

    let sstable = write_and_open(
        tmp.path(),
        Version::Mc,
        1,
        WriterConfig { replay_position: Some(replay), ..WriterConfig::default() },
        events,
    );
    let stats = sstable.statistics.stats.as_ref().unwrap();
    assert_eq!(stats.min_timestamp, 1001);
    assert_eq!(stats.max_timestamp, 1008);
    assert_eq!(stats.rows_count, 3);
    assert_eq!(stats.position, replay);
    // min/max clustering components track the int comparator
    assert_eq!(stats.min_column_names, vec![1i32.to_be_bytes().to_vec()]);
    assert_eq!(stats.max_column_names, vec![8i32.to_be_bytes().to_vec()]);

    let validation = sstable.statistics.validation.as_ref().unwrap();
    assert_eq!(validation.partitioner_name, "ByteOrderedPartitioner");
}

/// An interrupted seal (temporary TOC never renamed) is invisible to an
/// observer and sweepable.
#[test]
fn interrupted_seal_is_sweepable() {
    init_tracing();
    let tmp = TempDir::new().unwrap();

    let events = vec![
        PartitionEvent::PartitionStart { key: pk(1), tombstone: Tombstone::NONE },
        PartitionEvent::Row(row(1, 10, 1)),
        PartitionEvent::PartitionEnd,
    ];
    let desc = descriptor(tmp.path(), Version::Mc, 3);
    let writer = SstableWriter::create(
        desc.clone(),
        test_schema(),
        Arc::new(ByteOrderedPartitioner),
        4,
        WriterConfig { leave_unsealed: true, ..WriterConfig::default() },
    )
    .unwrap();
    writer.write_stream(events).unwrap();

    // an observer must treat this generation as never sealed
    assert!(crate::components::Toc::load(&desc).is_err());

    let swept = crate::sstable::sweep_unsealed(tmp.path()).unwrap();
    assert_eq!(swept, vec![3]);
    assert_eq!(fs::read_dir(tmp.path()).unwrap().count(), 0);
}

/// Dropping a writer mid-stream leaves a partial generation that the next
/// sweep reclaims.
#[test]
fn dropped_writer_leaves_sweepable_partial() {
    init_tracing();
    let tmp = TempDir::new().unwrap();

    let desc = descriptor(tmp.path(), Version::Mc, 5);
    let mut writer = SstableWriter::create(
        desc,
        test_schema(),
        Arc::new(ByteOrderedPartitioner),
        4,
        WriterConfig::default(),
    )
    .unwrap();
    writer.consume_new_partition(&pk(1)).unwrap();
    writer.consume_row(&row(1, 10, 1)).unwrap();
    drop(writer);

    let swept = crate::sstable::sweep_unsealed(tmp.path()).unwrap();
    assert_eq!(swept, vec![5]);
}
