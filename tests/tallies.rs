mod common;

use chrono::{TimeDelta, Utc};
use common::*;
use metabase::MetabaseError;
use metabase::adapters::Adapter;
use metabase::adapters::distributed::EmulatorStats;
use metabase::models::{
    BucketLocation, BucketTally, CollectBucketTallies, Consistency, ObjectStatus, RawObject,
};
use metabase::services::{Metabase, PartitionRouter};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn full_range() -> CollectBucketTallies {
    CollectBucketTallies::new(BucketLocation::min(), BucketLocation::max())
}

fn assert_strictly_ascending(tallies: &[BucketTally]) {
    assert!(
        tallies.windows(2).all(|w| w[0].location < w[1].location),
        "not strictly ascending: {tallies:?}"
    );
}

#[tokio::test]
async fn tallies_from_two_adapters_are_merged_in_order() {
    let a = project(10);
    let relational = relational().await;
    let (_, distributed) = distributed(2).await;
    let cancel = CancellationToken::new();

    let mut objects: Vec<_> = (0..5).map(|i| object(a, "b", &format!("k{i}"))).collect();
    objects.extend((0..2).map(|i| object(a, "m", &format!("k{i}"))));
    relational
        .testing_batch_insert_objects(&cancel, &objects[..5])
        .await
        .unwrap();
    // same project on both adapters only to exercise the merge order
    distributed
        .testing_batch_insert_objects(&cancel, &objects[5..])
        .await
        .unwrap();

    let metabase = Metabase::new(PartitionRouter::new(relational).with_adapter(distributed, []));
    let tallies = metabase
        .collect_bucket_tallies(&cancel, full_range())
        .await
        .unwrap();

    let counts: Vec<_> = tallies
        .iter()
        .map(|t| (t.location.clone(), t.object_count))
        .collect();
    assert_eq!(
        counts,
        vec![
            (BucketLocation::new(a, "b"), 5),
            (BucketLocation::new(a, "m"), 2),
        ]
    );
}

#[tokio::test]
async fn tallies_are_ordered_and_aggregated() {
    let metabase = relational_metabase().await;
    let cancel = CancellationToken::new();

    let mut objects = Vec::new();
    for (p, bucket, n) in [(3, "z", 2), (1, "b", 3), (2, "a", 1), (1, "a", 4)] {
        for i in 0..n {
            let mut obj = object(project(p), bucket, &format!("{i}"));
            obj.encrypted_etag = Some(vec![0; 16]);
            objects.push(obj);
        }
    }
    metabase
        .testing_batch_insert_objects(&cancel, &objects)
        .await
        .unwrap();

    let tallies = metabase
        .collect_bucket_tallies(&cancel, full_range())
        .await
        .unwrap();
    assert_strictly_ascending(&tallies);
    assert_eq!(tallies.len(), 4);

    let first = &tallies[0];
    assert_eq!(first.location, BucketLocation::new(project(1), "a"));
    assert_eq!(first.object_count, 4);
    assert_eq!(first.pending_object_count, 0);
    assert_eq!(first.total_segments, 4);
    assert_eq!(first.total_bytes, 4 * 128);
    assert_eq!(first.metadata_size, 4 * (32 + 16));
}

#[tokio::test]
async fn range_bounds_are_inclusive() {
    let metabase = relational_metabase().await;
    let cancel = CancellationToken::new();
    let objects: Vec<_> = ["a", "b", "c", "d"]
        .iter()
        .map(|b| object(project(1), b, "k"))
        .collect();
    metabase
        .testing_batch_insert_objects(&cancel, &objects)
        .await
        .unwrap();

    let opts = CollectBucketTallies::new(
        BucketLocation::new(project(1), "b"),
        BucketLocation::new(project(1), "c"),
    );
    let tallies = metabase
        .collect_bucket_tallies(&cancel, opts)
        .await
        .unwrap();
    let buckets: Vec<_> = tallies
        .iter()
        .map(|t| t.location.bucket_name.as_str())
        .collect();
    assert_eq!(buckets, vec!["b", "c"]);
}

#[tokio::test]
async fn inverted_range_makes_no_backend_calls() {
    let (emulator, metabase) = distributed_metabase(2).await;
    let cancel = CancellationToken::new();

    for opts in [
        CollectBucketTallies::new(
            BucketLocation::new(project(2), "a"),
            BucketLocation::new(project(1), "z"),
        ),
        CollectBucketTallies::new(
            BucketLocation::new(project(1), "m"),
            BucketLocation::new(project(1), "b"),
        ),
    ] {
        let err = metabase
            .collect_bucket_tallies(&cancel, opts)
            .await
            .unwrap_err();
        assert!(err.is_invalid_request(), "{err}");
    }
    assert_eq!(emulator.stats(), EmulatorStats::default());
}

#[tokio::test]
async fn strategies_agree_at_a_snapshot_for_any_partition_count() {
    let cancel = CancellationToken::new();
    let mut objects = Vec::new();
    for i in 0..60u128 {
        let bucket = ["x", "y", "z"][(i % 3) as usize];
        let mut obj = object(project(1 + i % 4), bucket, &format!("{i}"));
        obj.total_encrypted_size = i as i64;
        obj.segment_count = (i % 5) as i32;
        if i % 7 == 0 {
            obj.status = ObjectStatus::Pending;
        }
        objects.push(obj);
    }

    let mut expected: Option<Vec<BucketTally>> = None;
    for partitions in [1, 2, 3, 7, 100] {
        let (_, metabase) = distributed_metabase(partitions).await;
        metabase
            .testing_batch_insert_objects(&cancel, &objects)
            .await
            .unwrap();
        let snapshot = Utc::now();
        tokio::time::sleep(Duration::from_millis(5)).await;
        metabase
            .testing_batch_insert_objects(&cancel, &[object(project(1), "x", "late")])
            .await
            .unwrap();

        let mut opts = full_range();
        opts.consistency = Consistency::Snapshot(snapshot);
        opts.now = Some(at(1_800_000_000));
        let direct = metabase
            .collect_bucket_tallies(&cancel, opts.clone())
            .await
            .unwrap();
        opts.use_partition_query = true;
        let partitioned = metabase
            .collect_bucket_tallies(&cancel, opts)
            .await
            .unwrap();

        assert_eq!(direct, partitioned, "{partitions} partitions");
        assert_eq!(direct.iter().map(|t| t.object_count).sum::<i64>(), 60);
        let expected = expected.get_or_insert_with(|| direct.clone());
        assert_eq!(&direct, expected);
    }
}

#[tokio::test]
async fn backends_agree_on_the_same_rows() {
    let cancel = CancellationToken::new();
    let mut objects = Vec::new();
    for i in 0..30u128 {
        let mut obj = object(project(1 + i % 3), ["a", "b"][(i % 2) as usize], &format!("{i}"));
        obj.encrypted_metadata = (i % 4 != 0).then(|| vec![0; i as usize]);
        obj.status = if i % 5 == 0 {
            ObjectStatus::Pending
        } else {
            ObjectStatus::CommittedVersioned
        };
        objects.push(obj);
    }

    let relational = relational_metabase().await;
    let (_, distributed) = distributed_metabase(3).await;
    relational
        .testing_batch_insert_objects(&cancel, &objects)
        .await
        .unwrap();
    distributed
        .testing_batch_insert_objects(&cancel, &objects)
        .await
        .unwrap();

    let opts = full_range();
    assert_eq!(
        relational
            .collect_bucket_tallies(&cancel, opts.clone())
            .await
            .unwrap(),
        distributed
            .collect_bucket_tallies(&cancel, opts)
            .await
            .unwrap()
    );
}

#[tokio::test]
async fn zombie_pending_objects_are_counted() {
    let now = at(1_750_000_000);
    let mut zombie = object(project(1), "b", "zombie");
    zombie.status = ObjectStatus::Pending;
    zombie.zombie_deletion_deadline = Some(at(1_700_000_000));
    let committed = object(project(1), "b", "done");

    let cancel = CancellationToken::new();
    let (_, distributed) = distributed_metabase(2).await;
    for metabase in [relational_metabase().await, distributed] {
        metabase
            .testing_batch_insert_objects(&cancel, &[zombie.clone(), committed.clone()])
            .await
            .unwrap();
        for use_partition_query in [false, true] {
            let opts = CollectBucketTallies {
                now: Some(now),
                use_partition_query,
                ..full_range()
            };
            let tallies = metabase
                .collect_bucket_tallies(&cancel, opts)
                .await
                .unwrap();
            assert_eq!(tallies.len(), 1);
            assert_eq!(tallies[0].object_count, 2);
            assert_eq!(tallies[0].pending_object_count, 1);
        }
    }
}

#[tokio::test]
async fn expired_objects_are_not_counted() {
    let now = at(1_750_000_000);
    let mut expired = object(project(1), "b", "expired");
    expired.expires_at = Some(at(1_740_000_000));
    let mut expiring_now = object(project(1), "b", "edge");
    expiring_now.expires_at = Some(now);
    let mut later = object(project(1), "b", "later");
    later.expires_at = Some(at(1_760_000_000));
    let kept = object(project(1), "b", "kept");
    let only_expired = {
        let mut obj = object(project(2), "gone", "x");
        obj.expires_at = Some(at(1_700_000_000));
        obj
    };
    let objects = [expired, expiring_now, later, kept, only_expired];

    let cancel = CancellationToken::new();
    let (_, distributed) = distributed_metabase(2).await;
    for metabase in [relational_metabase().await, distributed] {
        metabase
            .testing_batch_insert_objects(&cancel, &objects)
            .await
            .unwrap();
        for use_partition_query in [false, true] {
            let opts = CollectBucketTallies {
                now: Some(now),
                use_partition_query,
                ..full_range()
            };
            let tallies = metabase
                .collect_bucket_tallies(&cancel, opts)
                .await
                .unwrap();
            assert_eq!(tallies.len(), 1);
            assert_eq!(tallies[0].location, BucketLocation::new(project(1), "b"));
            assert_eq!(tallies[0].object_count, 2);
        }
    }
}

#[tokio::test]
async fn expiry_is_compared_at_stored_precision() {
    let base = at(1_750_000_000);
    let mut same_micro = object(project(1), "b", "same");
    same_micro.expires_at = Some(base + TimeDelta::nanoseconds(500));
    let mut next_micro = object(project(1), "b", "next");
    next_micro.expires_at = Some(base + TimeDelta::nanoseconds(1_500));
    let objects = [same_micro, next_micro];

    let cancel = CancellationToken::new();
    let (_, distributed) = distributed_metabase(2).await;
    for metabase in [relational_metabase().await, distributed] {
        metabase
            .testing_batch_insert_objects(&cancel, &objects)
            .await
            .unwrap();
        for use_partition_query in [false, true] {
            let opts = CollectBucketTallies {
                now: Some(base + TimeDelta::nanoseconds(100)),
                use_partition_query,
                ..full_range()
            };
            let tallies = metabase
                .collect_bucket_tallies(&cancel, opts)
                .await
                .unwrap();
            assert_eq!(tallies.len(), 1);
            assert_eq!(tallies[0].object_count, 1);
        }
    }
}

#[tokio::test]
async fn bounded_staleness_reads_are_accepted() {
    let (_, metabase) = distributed_metabase(2).await;
    let cancel = CancellationToken::new();
    metabase
        .testing_batch_insert_objects(&cancel, &[object(project(1), "b", "k")])
        .await
        .unwrap();

    for use_partition_query in [false, true] {
        let opts = CollectBucketTallies {
            consistency: Consistency::BoundedStaleness(Duration::from_secs(0)),
            use_partition_query,
            ..full_range()
        };
        let tallies = metabase
            .collect_bucket_tallies(&cancel, opts)
            .await
            .unwrap();
        assert_eq!(tallies.len(), 1);
    }
}

#[tokio::test]
async fn projects_stay_on_their_adapter() {
    let routed = [project(5), project(7)];
    let relational = relational().await;
    let (_, distributed) = distributed(3).await;
    let metabase = Metabase::new(
        PartitionRouter::new(relational.clone()).with_adapter(distributed.clone(), routed),
    );
    let cancel = CancellationToken::new();

    let objects: Vec<_> = (1..=8u128)
        .flat_map(|p| ["a", "b"].map(|b| object(project(p), b, "k")))
        .collect();
    metabase
        .testing_batch_insert_objects(&cancel, &objects)
        .await
        .unwrap();

    let on_distributed = distributed
        .testing_get_all_objects(&cancel, Consistency::Strong)
        .await
        .unwrap();
    assert_eq!(on_distributed.len(), 4);
    assert!(on_distributed.iter().all(|o| routed.contains(&o.stream.project_id)));

    let on_relational = relational
        .testing_get_all_objects(&cancel, Consistency::Strong)
        .await
        .unwrap();
    assert_eq!(on_relational.len(), 12);
    assert!(on_relational.iter().all(|o| !routed.contains(&o.stream.project_id)));

    for use_partition_query in [false, true] {
        let opts = CollectBucketTallies {
            use_partition_query,
            ..full_range()
        };
        let tallies = metabase
            .collect_bucket_tallies(&cancel, opts)
            .await
            .unwrap();
        assert_eq!(tallies.len(), 16);
        assert_strictly_ascending(&tallies);
    }
}

#[tokio::test]
async fn a_bucket_on_two_adapters_is_an_integrity_error() {
    let relational = relational().await;
    let (_, distributed) = distributed(1).await;
    let cancel = CancellationToken::new();
    let obj = object(project(1), "b", "k");
    relational
        .testing_batch_insert_objects(&cancel, std::slice::from_ref(&obj))
        .await
        .unwrap();
    distributed
        .testing_batch_insert_objects(&cancel, &[obj])
        .await
        .unwrap();

    let metabase = Metabase::new(PartitionRouter::new(relational).with_adapter(distributed, []));
    let err = metabase
        .collect_bucket_tallies(&cancel, full_range())
        .await
        .unwrap_err();
    assert!(err.is_data_integrity(), "{err}");
}

#[tokio::test]
async fn cancelled_requests_fail_without_results() {
    let (emulator, metabase) = distributed_metabase(2).await;
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = metabase
        .collect_bucket_tallies(&cancel, full_range())
        .await
        .unwrap_err();
    assert!(matches!(err, MetabaseError::Canceled { .. }), "{err}");
    assert_eq!(emulator.stats(), EmulatorStats::default());
}

/// Recomputes tallies row by row from the model.
fn reference_tallies(objects: &[RawObject], opts: &CollectBucketTallies) -> Vec<BucketTally> {
    let now = opts.now();
    let mut tallies = std::collections::BTreeMap::<BucketLocation, BucketTally>::new();
    for obj in objects {
        let location = obj.stream.location();
        if !opts.contains(&location) || obj.is_expired(now) {
            continue;
        }
        let tally = tallies
            .entry(location.clone())
            .or_insert_with(|| BucketTally::new(location));
        tally.object_count += 1;
        tally.pending_object_count += i64::from(obj.status.is_pending());
        tally.total_segments += i64::from(obj.segment_count);
        tally.total_bytes += obj.total_encrypted_size;
        tally.metadata_size += obj.metadata_size();
    }
    tallies.into_values().collect()
}

#[tokio::test]
async fn tallies_match_a_row_by_row_computation() {
    let mut objects = Vec::new();
    for i in 0..40u128 {
        let bucket = ["a", "bb", "c"][(i % 3) as usize];
        let mut obj = object(project(1 + i % 5), bucket, &format!("{i}"));
        obj.total_encrypted_size = 10 * i as i64;
        obj.encrypted_etag = (i % 2 == 0).then(|| vec![1; 4]);
        obj.expires_at = (i % 6 == 0).then(|| at(1_700_000_000 + (i as i64) * 1000));
        if i % 4 == 0 {
            obj.status = ObjectStatus::Pending;
        }
        objects.push(obj);
    }
    let opts = CollectBucketTallies {
        now: Some(at(1_700_020_000)),
        ..CollectBucketTallies::new(
            BucketLocation::new(project(2), "bb"),
            BucketLocation::new(project(4), "a"),
        )
    };
    let expected = reference_tallies(&objects, &opts);
    assert!(!expected.is_empty());

    let cancel = CancellationToken::new();
    let (_, distributed) = distributed_metabase(4).await;
    for metabase in [relational_metabase().await, distributed] {
        metabase
            .testing_batch_insert_objects(&cancel, &objects)
            .await
            .unwrap();
        for use_partition_query in [false, true] {
            let mut opts = opts.clone();
            opts.use_partition_query = use_partition_query;
            let mut tallies = metabase
                .collect_bucket_tallies(&cancel, opts)
                .await
                .unwrap();
            tallies.sort_by(|a, b| a.location.cmp(&b.location));
            assert_eq!(tallies, expected);
        }
    }
}
