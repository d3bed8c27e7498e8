//! Consistency checksum coordination: computing at most once per id,
//! collectors that arrive early or late, and lazy collection of old entries.

mod common;

use std::sync::atomic::Ordering;
use std::time::Duration;

use common::{range_desc, Harness};
use holo_replica::replica::{ChecksumId, ComputeChecksum, SideEffects};
use holo_replica::storage::{StateEngine, WriteBatch};
use holo_replica::ApplyConfig;

fn compute(id: u64, snapshot: bool) -> ComputeChecksum {
    ComputeChecksum {
        checksum_id: ChecksumId(id),
        snapshot,
    }
}

fn write_user_data(h: &Harness, keys: &[&[u8]]) {
    let mut batch = WriteBatch::new();
    for key in keys {
        batch.put(key.to_vec(), b"value".to_vec());
    }
    h.engine.commit(batch).expect("write user data");
}

#[tokio::test(start_paused = true)]
async fn duplicate_requests_compute_once() {
    let h = Harness::start();
    write_user_data(&h, &[b"b", b"c"]);

    h.replica.compute_checksum_post_apply(compute(1, false));
    h.replica.compute_checksum_post_apply(compute(1, false));

    let (first, second) = tokio::join!(
        h.replica.await_checksum(ChecksumId(1)),
        h.replica.await_checksum(ChecksumId(1)),
    );
    let first = first.expect("first");
    let second = second.expect("second");
    assert!(first.digest.is_some());
    assert_eq!(first, second);
    assert_eq!(h.engine.snapshots.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn collector_can_arrive_before_compute() {
    let h = Harness::start();
    let replica = h.replica.clone();
    let waiter = tokio::spawn(async move { replica.await_checksum(ChecksumId(2)).await });
    while !h.replica.has_checksum(ChecksumId(2)) {
        tokio::task::yield_now().await;
    }

    h.replica.compute_checksum_post_apply(compute(2, true));
    let result = waiter.await.expect("join").expect("checksum");
    assert!(result.digest.is_some());
    assert!(result.snapshot.is_some());
    assert_eq!(h.engine.snapshots.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn replicas_with_same_data_agree() {
    let a = Harness::start();
    let b = Harness::start();
    write_user_data(&a, &[b"b", b"q"]);
    write_user_data(&b, &[b"b", b"q"]);

    a.replica.compute_checksum_post_apply(compute(3, false));
    b.replica.compute_checksum_post_apply(compute(3, false));
    let da = a.replica.await_checksum(ChecksumId(3)).await.expect("a");
    let db = b.replica.await_checksum(ChecksumId(3)).await.expect("b");
    assert_eq!(da.digest, db.digest);

    write_user_data(&b, &[b"r"]);
    b.replica.compute_checksum_post_apply(compute(4, false));
    a.replica.compute_checksum_post_apply(compute(4, false));
    let da = a.replica.await_checksum(ChecksumId(4)).await.expect("a");
    let db = b.replica.await_checksum(ChecksumId(4)).await.expect("b");
    assert_ne!(da.digest, db.digest);
}

#[tokio::test(start_paused = true)]
async fn expired_entries_are_collected_on_next_compute() {
    let config = ApplyConfig {
        checksum_gc_interval_ms: 1_000,
        ..Default::default()
    };
    let h = Harness::start_with(config, range_desc(b"a", b"z"));

    h.replica.compute_checksum_post_apply(compute(5, false));
    h.replica
        .await_checksum(ChecksumId(5))
        .await
        .expect("checksum");
    assert!(h.replica.has_checksum(ChecksumId(5)));

    tokio::time::advance(Duration::from_millis(500)).await;
    h.replica.compute_checksum_post_apply(compute(6, false));
    assert!(h.replica.has_checksum(ChecksumId(5)));

    tokio::time::advance(Duration::from_millis(600)).await;
    assert!(h.replica.has_checksum(ChecksumId(5)), "collection is lazy");
    h.replica.compute_checksum_post_apply(compute(7, false));
    assert!(!h.replica.has_checksum(ChecksumId(5)));
    assert!(h.replica.has_checksum(ChecksumId(7)));
}

#[tokio::test(start_paused = true)]
async fn refused_launch_still_completes() {
    let h = Harness::start();
    h.stopper.quiesce();
    h.replica.compute_checksum_post_apply(compute(8, true));
    let result = h
        .replica
        .await_checksum(ChecksumId(8))
        .await
        .expect("completed");
    assert_eq!(result.digest, None);
    assert_eq!(result.snapshot, None);
}

#[tokio::test(start_paused = true)]
async fn await_without_compute_times_out() {
    let h = Harness::start();
    let err = h
        .replica
        .await_checksum(ChecksumId(9))
        .await
        .expect_err("never computed");
    assert!(err.to_string().contains("not computed"));
    assert!(!h.replica.has_checksum(ChecksumId(9)));
}

#[tokio::test(start_paused = true)]
async fn abandoned_entry_does_not_outlive_gc_sweep() {
    let config = ApplyConfig {
        checksum_await_timeout_ms: 100,
        ..Default::default()
    };
    let h = Harness::start_with(config, range_desc(b"a", b"z"));
    h.replica
        .await_checksum(ChecksumId(11))
        .await
        .expect_err("never computed");

    tokio::time::advance(Duration::from_secs(3_600)).await;
    h.replica.compute_checksum_post_apply(compute(12, false));
    assert!(!h.replica.has_checksum(ChecksumId(11)));
    h.replica
        .await_checksum(ChecksumId(12))
        .await
        .expect("later checksum still computes");
}

#[tokio::test(start_paused = true)]
async fn checksum_command_applies_through_side_effects() {
    let h = Harness::start();
    let mut effects = SideEffects::default();
    effects.replicated.compute_checksum = Some(compute(10, false));
    effects.replicated.is_consistency_related = true;
    h.apply(1, &mut effects).expect("apply");
    assert!(effects.is_empty());

    let result = h
        .replica
        .await_checksum(ChecksumId(10))
        .await
        .expect("checksum");
    assert!(result.digest.is_some());
}
