//! Lease changes applied through side effects: timestamp cache handling,
//! raft leadership transfer and first-range gossip.

mod common;

use std::sync::atomic::Ordering;

use common::{lease, range_desc, Harness, START_NANOS};
use holo_replica::replica::{FatalError, Lease, RaftRole, SideEffects, Timestamp};
use holo_replica::ApplyConfig;

fn apply_lease(h: &Harness, index: u64, new_lease: Lease) -> Result<(), FatalError> {
    let mut effects = SideEffects::default();
    effects.replicated.lease = Some(new_lease);
    effects.replicated.is_lease_request = true;
    effects.local.lease_metrics_result = Some(true);
    h.apply(index, &mut effects)
}

#[tokio::test]
async fn acquiring_lease_sets_low_water_to_new_start() {
    let h = Harness::start();
    h.clock.set(850);
    // Previous holder's lease ran until 800; the new one starts at 900.
    apply_lease(&h, 1, lease(2, 200, 700, 800)).expect("apply remote lease");
    h.clock.set(1_000);
    apply_lease(&h, 2, lease(1, 900, 5_000, 6_000)).expect("apply own lease");

    assert_eq!(h.replica.ts_cache_low_water(), Timestamp::new(900, 0));
    assert_eq!(h.replica.state().lease, lease(1, 900, 5_000, 6_000));
    assert_eq!(h.store.metrics().snapshot().lease_request_success, 2);
}

#[tokio::test]
async fn losing_lease_clears_timestamp_cache() {
    let h = Harness::start();
    h.clock.set(1_000);
    apply_lease(&h, 1, lease(1, 500, 5_000, 6_000)).expect("apply own lease");
    h.replica.record_read(b"k1".to_vec(), Timestamp::new(1_500, 0));
    h.replica.record_read(b"k2".to_vec(), Timestamp::new(1_600, 0));
    assert_eq!(h.replica.ts_cache_len(), 2);

    h.clock.set(2_000);
    apply_lease(&h, 2, lease(2, 2_000, 8_000, 9_000)).expect("apply remote lease");
    assert_eq!(h.replica.ts_cache_len(), 0);
    assert_eq!(h.replica.ts_cache_low_water(), Timestamp::new(2_000, 0));
}

#[tokio::test]
async fn lease_extension_keeps_cache() {
    let h = Harness::start();
    h.clock.set(1_000);
    apply_lease(&h, 1, lease(1, 500, 5_000, 6_000)).expect("apply lease");
    h.replica.record_read(b"k".to_vec(), Timestamp::new(1_500, 0));
    apply_lease(&h, 2, lease(1, 500, 9_000, 10_000)).expect("extend lease");
    assert_eq!(h.replica.ts_cache_len(), 1);
}

#[tokio::test]
async fn leader_hands_leadership_to_new_holder() {
    let h = Harness::start();
    h.clock.set(1_000);
    *h.raft.role.lock().expect("raft") = RaftRole::Leader;
    apply_lease(&h, 1, lease(3, 500, 5_000, 6_000)).expect("apply");
    assert_eq!(*h.raft.transfers.lock().expect("raft"), vec![3]);
}

#[tokio::test]
async fn follower_and_stale_leases_do_not_transfer() {
    let h = Harness::start();
    h.clock.set(1_000);
    apply_lease(&h, 1, lease(3, 500, 5_000, 6_000)).expect("follower");

    *h.raft.role.lock().expect("raft") = RaftRole::Leader;
    // Already past the stasis point: a trailing replica applying an old lease.
    h.clock.set(10_000);
    apply_lease(&h, 2, lease(2, 500, 5_000, 6_000)).expect("stale lease");
    assert!(h.raft.transfers.lock().expect("raft").is_empty());
}

#[tokio::test]
async fn broken_raft_group_is_fatal() {
    let h = Harness::start();
    h.clock.set(1_000);
    h.raft.fail.store(true, Ordering::SeqCst);
    let err = apply_lease(&h, 1, lease(2, 500, 5_000, 6_000)).expect_err("fatal");
    assert!(matches!(err, FatalError::LeadershipTransfer { .. }));
    assert!(h.replica.halted().is_some());
}

#[tokio::test]
async fn first_range_holder_gossips_on_acquire() {
    let h = Harness::start_with(ApplyConfig::default(), range_desc(b"", b"z"));
    h.clock.set(1_000);
    apply_lease(&h, 1, lease(1, 500, 5_000, 6_000)).expect("apply");
    assert_eq!(h.gossip.first_range_count(), 1);

    // Acquired but no longer covering now: nothing to gossip.
    apply_lease(&h, 2, lease(2, 500, 5_000, 6_000)).expect("apply");
    h.clock.set(20_000);
    apply_lease(&h, 3, lease(1, 10_000, 15_000, 16_000)).expect("apply");
    assert_eq!(h.gossip.first_range_count(), 1);
}

#[tokio::test]
async fn harness_clock_starts_before_leases() {
    let h = Harness::start();
    assert_eq!(h.replica.ts_cache_low_water(), Timestamp::new(START_NANOS, 0));
}
