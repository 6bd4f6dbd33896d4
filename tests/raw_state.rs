mod common;

use chrono::{TimeDelta, Utc};
use common::*;
use metabase::adapters::distributed::Emulator;
use metabase::adapters::{Adapter, DistributedAdapter, MAX_ROWS_PER_BATCH, RelationalAdapter};
use metabase::models::{
    Consistency, ObjectStatus, RawCopy, RawState, SegmentPosition, stored_timestamp,
};
use metabase::services::{Metabase, PartitionRouter};
use parking_lot::Mutex;
use std::io;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

fn sample_state() -> RawState {
    let mut objects = Vec::new();
    let mut segments = Vec::new();
    let rows = [
        (2, "b", "z"),
        (1, "b", "a"),
        (1, "a", "\u{00e9}t\u{00e9}"),
        (1, "a", "a"),
    ];
    for (p, bucket, key) in rows {
        let mut obj = object(project(p), bucket, key);
        obj.segment_count = 2;
        if key == "z" {
            obj.status = ObjectStatus::Pending;
            obj.expires_at = Some(at(1_900_000_000));
            obj.zombie_deletion_deadline = Some(at(1_800_000_000));
            obj.encrypted_etag = Some(vec![7; 8]);
        }
        segments.push(segment(obj.stream.stream_id, 1, &[3, 1, 2]));
        let mut inline = segment(obj.stream.stream_id, 0, &[]);
        inline.inline_data = Some(b"small object".to_vec());
        inline.repaired_at = Some(at(1_710_000_000));
        inline.position = SegmentPosition { part: 1, index: 0 };
        segments.push(inline);
        objects.push(obj);
    }
    let copies = vec![
        RawCopy {
            stream_id: Uuid::from_u128(20),
            ancestor_stream_id: objects[0].stream.stream_id,
        },
        RawCopy {
            stream_id: Uuid::from_u128(10),
            ancestor_stream_id: objects[1].stream.stream_id,
        },
    ];
    RawState {
        objects,
        segments,
        copies,
    }
}

async fn load(metabase: &Metabase, state: &RawState) {
    let cancel = CancellationToken::new();
    metabase
        .testing_batch_insert_objects(&cancel, &state.objects)
        .await
        .unwrap();
    metabase
        .testing_batch_insert_segments(&cancel, &state.segments)
        .await
        .unwrap();
    metabase
        .testing_batch_insert_copies(&cancel, &state.copies)
        .await
        .unwrap();
}

#[tokio::test]
async fn dump_returns_sorted_input() {
    let (_, distributed) = distributed_metabase(3).await;
    for metabase in [relational_metabase().await, distributed] {
        let input = sample_state();
        load(&metabase, &input).await;

        let dumped = metabase
            .testing_get_state(&CancellationToken::new(), Consistency::Strong)
            .await
            .unwrap();

        let mut expected = input.clone();
        expected.sort();
        assert_eq!(dumped, expected);
    }
}

#[tokio::test]
async fn dump_spans_routed_adapters() {
    let (_, distributed) = distributed(2).await;
    let metabase = Metabase::new(
        PartitionRouter::new(relational().await).with_adapter(distributed, [project(2)]),
    );
    let input = sample_state();
    load(&metabase, &input).await;

    let dumped = metabase
        .testing_get_state(&CancellationToken::new(), Consistency::Strong)
        .await
        .unwrap();
    let mut expected = input;
    expected.sort();
    assert_eq!(dumped, expected);
}

#[tokio::test]
async fn sub_microsecond_timestamps_are_stored_alike() {
    let nanos = |n| at(1_700_000_020) + TimeDelta::nanoseconds(n);
    let mut input = sample_state();
    input.objects[0].created_at = nanos(123_456_789);
    input.objects[0].expires_at = Some(nanos(999_999_999));
    input.objects[1].zombie_deletion_deadline = Some(Utc::now());
    input.segments[0].created_at = nanos(1);
    input.segments[1].repaired_at = Some(nanos(123_456_789));
    input.segments[2].expires_at = Some(nanos(500));

    let mut expected = input.clone();
    for obj in &mut expected.objects {
        obj.created_at = stored_timestamp(obj.created_at);
        obj.expires_at = obj.expires_at.map(stored_timestamp);
        obj.zombie_deletion_deadline = obj.zombie_deletion_deadline.map(stored_timestamp);
    }
    for seg in &mut expected.segments {
        seg.created_at = stored_timestamp(seg.created_at);
        seg.repaired_at = seg.repaired_at.map(stored_timestamp);
        seg.expires_at = seg.expires_at.map(stored_timestamp);
    }
    expected.sort();
    let mut unrounded = input.clone();
    unrounded.sort();
    assert_ne!(unrounded, expected);

    let (_, distributed) = distributed_metabase(2).await;
    for metabase in [relational_metabase().await, distributed] {
        load(&metabase, &input).await;
        let dumped = metabase
            .testing_get_state(&CancellationToken::new(), Consistency::Strong)
            .await
            .unwrap();
        assert_eq!(dumped, expected);
    }
}

#[tokio::test]
async fn delete_all_empties_every_table() {
    let (_, distributed) = distributed_metabase(2).await;
    for metabase in [relational_metabase().await, distributed] {
        load(&metabase, &sample_state()).await;
        let cancel = CancellationToken::new();

        metabase.testing_delete_all(&cancel).await.unwrap();
        let state = metabase
            .testing_get_state(&cancel, Consistency::Strong)
            .await
            .unwrap();
        assert_eq!(state, RawState::default());

        // aliases allocated after the wipe resolve normally
        load(&metabase, &sample_state()).await;
        let state = metabase
            .testing_get_state(&cancel, Consistency::Strong)
            .await
            .unwrap();
        assert_eq!(state.segments.len(), 8);
    }
}

#[tokio::test]
async fn batch_insert_makes_one_backend_call_per_chunk() {
    assert_eq!(MAX_ROWS_PER_BATCH, 250_000);

    let cancel = CancellationToken::new();
    for (rows, cap) in [(1usize, 4usize), (4, 4), (5, 4), (13, 4), (101, 25)] {
        let emulator = Arc::new(Emulator::new(2));
        let adapter = DistributedAdapter::new(emulator.clone()).with_batch_size(cap);
        adapter.migrate(&cancel).await.unwrap();

        let objects: Vec<_> = (0..rows)
            .map(|i| object(project(1), "b", &format!("{i:05}")))
            .collect();
        adapter
            .testing_batch_insert_objects(&cancel, &objects)
            .await
            .unwrap();

        assert_eq!(emulator.stats().applies, rows.div_ceil(cap), "{rows} rows, cap {cap}");
        let stored = adapter
            .testing_get_all_objects(&cancel, Consistency::Strong)
            .await
            .unwrap();
        assert_eq!(stored, objects);
    }
}

#[tokio::test]
async fn earlier_chunks_stay_committed_after_a_failure() {
    let cancel = CancellationToken::new();
    let emulator = Arc::new(Emulator::new(1));
    let adapter = DistributedAdapter::new(emulator.clone()).with_batch_size(2);
    adapter.migrate(&cancel).await.unwrap();

    let mut objects: Vec<_> = (0..4).map(|i| object(project(1), "b", &format!("{i}"))).collect();
    // the third chunk repeats a primary key and is rejected
    objects.push(objects[0].clone());

    let err = adapter
        .testing_batch_insert_objects(&cancel, &objects)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("batch insert objects"), "{err}");

    let stored = adapter
        .testing_get_all_objects(&cancel, Consistency::Strong)
        .await
        .unwrap();
    assert_eq!(stored.len(), 4);
}

#[tokio::test]
async fn relational_batches_are_chunked_transparently() {
    let cancel = CancellationToken::new();
    let adapter = RelationalAdapter::connect("sqlite::memory:", 1)
        .await
        .unwrap()
        .with_batch_size(3);
    adapter.migrate(&cancel).await.unwrap();

    let objects: Vec<_> = (0..10)
        .map(|i| object(project(1), "b", &format!("{i:02}")))
        .collect();
    adapter
        .testing_batch_insert_objects(&cancel, &objects)
        .await
        .unwrap();

    let stored = adapter
        .testing_get_all_objects(&cancel, Consistency::Strong)
        .await
        .unwrap();
    assert_eq!(stored, objects);
}

#[derive(Clone, Default)]
struct Captured(Arc<Mutex<Vec<u8>>>);

impl io::Write for Captured {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn every_batch_insert_reports_progress_per_chunk() {
    let logs = Captured::default();
    let writer = logs.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_ansi(false)
        .with_writer(move || writer.clone())
        .finish();
    let _guard = tracing::subscriber::set_default(subscriber);

    let cancel = CancellationToken::new();
    let relational = RelationalAdapter::connect("sqlite::memory:", 1)
        .await
        .unwrap()
        .with_batch_size(2);
    let distributed = DistributedAdapter::new(Arc::new(Emulator::new(1))).with_batch_size(2);
    let adapters: [Arc<dyn Adapter>; 2] = [Arc::new(relational), Arc::new(distributed)];

    for adapter in adapters {
        adapter.migrate(&cancel).await.unwrap();
        let objects: Vec<_> = (0..3)
            .map(|i| object(project(1), "b", &format!("{i}")))
            .collect();
        let state = RawState {
            segments: objects
                .iter()
                .map(|obj| segment(obj.stream.stream_id, 0, &[1, 2]))
                .collect(),
            copies: (0..3u128)
                .map(|i| RawCopy {
                    stream_id: Uuid::from_u128(100 + i),
                    ancestor_stream_id: objects[0].stream.stream_id,
                })
                .collect(),
            objects,
        };
        load(&Metabase::new(PartitionRouter::new(adapter)), &state).await;
    }

    let output = String::from_utf8(logs.0.lock().clone()).unwrap();
    for name in ["relational", "distributed"] {
        for progress in ["progress=2 total=3", "progress=3 total=3"] {
            let reported = output
                .lines()
                .filter(|line| line.contains("batch insert"))
                .filter(|line| line.contains(&format!("adapter=\"{name}\"")))
                .filter(|line| line.contains(progress))
                .count();
            // objects, segments and copies
            assert_eq!(reported, 3, "{name} {progress}:\n{output}");
        }
    }
}
