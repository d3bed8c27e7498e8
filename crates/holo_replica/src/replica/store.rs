//! Store-wide collaborators shared by every replica on one store.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::config::ApplyConfig;
use crate::stopper::Stopper;
use crate::storage::StateEngine;

use super::types::{
    CandidateQueue, Clock, Gossip, IntentResolver, LeaseAcquirer, MvccStats, NodeId,
    RangeId, RangeTopology, ReplicaGcQueue, StoreId,
};

/// Host-provided services the apply path calls into.
#[derive(Clone)]
pub struct StoreServices {
    pub raft_log_queue: Arc<dyn CandidateQueue>,
    pub split_queue: Arc<dyn CandidateQueue>,
    pub replica_gc_queue: Arc<dyn ReplicaGcQueue>,
    pub gossip: Arc<dyn Gossip>,
    pub intent_resolver: Arc<dyn IntentResolver>,
    pub lease_acquirer: Arc<dyn LeaseAcquirer>,
    pub topology: Arc<dyn RangeTopology>,
}

pub struct Store {
    store_id: StoreId,
    node_id: NodeId,
    config: ApplyConfig,
    clock: Arc<dyn Clock>,
    engine: Arc<dyn StateEngine>,
    stopper: Arc<Stopper>,
    services: StoreServices,
    entry_cache: RaftEntryCache,
    metrics: StoreMetrics,
}

impl Store {
    pub fn new(
        store_id: StoreId,
        node_id: NodeId,
        config: ApplyConfig,
        clock: Arc<dyn Clock>,
        engine: Arc<dyn StateEngine>,
        stopper: Arc<Stopper>,
        services: StoreServices,
    ) -> Arc<Self> {
        Arc::new(Self {
            store_id,
            node_id,
            config,
            clock,
            engine,
            stopper,
            services,
            entry_cache: RaftEntryCache::default(),
            metrics: StoreMetrics::default(),
        })
    }

    pub fn store_id(&self) -> StoreId {
        self.store_id
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn config(&self) -> &ApplyConfig {
        &self.config
    }

    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    pub fn engine(&self) -> &Arc<dyn StateEngine> {
        &self.engine
    }

    pub fn stopper(&self) -> &Stopper {
        &self.stopper
    }

    pub fn services(&self) -> &StoreServices {
        &self.services
    }

    pub fn entry_cache(&self) -> &RaftEntryCache {
        &self.entry_cache
    }

    pub fn metrics(&self) -> &StoreMetrics {
        &self.metrics
    }
}

/// Store-level gauges and counters.
#[derive(Debug, Default)]
pub struct StoreMetrics {
    live_bytes: AtomicI64,
    key_bytes: AtomicI64,
    val_bytes: AtomicI64,
    intent_bytes: AtomicI64,
    live_count: AtomicI64,
    key_count: AtomicI64,
    val_count: AtomicI64,
    intent_count: AtomicI64,
    sys_bytes: AtomicI64,
    sys_count: AtomicI64,
    lease_request_success: AtomicU64,
    lease_request_error: AtomicU64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StoreMetricsSnapshot {
    pub live_bytes: i64,
    pub key_bytes: i64,
    pub val_bytes: i64,
    pub intent_bytes: i64,
    pub live_count: i64,
    pub key_count: i64,
    pub val_count: i64,
    pub intent_count: i64,
    pub sys_bytes: i64,
    pub sys_count: i64,
    pub lease_request_success: u64,
    pub lease_request_error: u64,
}

impl StoreMetrics {
    pub fn add_mvcc_stats(&self, delta: &MvccStats) {
        let pairs = [
            (&self.live_bytes, delta.live_bytes),
            (&self.key_bytes, delta.key_bytes),
            (&self.val_bytes, delta.val_bytes),
            (&self.intent_bytes, delta.intent_bytes),
            (&self.live_count, delta.live_count),
            (&self.key_count, delta.key_count),
            (&self.val_count, delta.val_count),
            (&self.intent_count, delta.intent_count),
            (&self.sys_bytes, delta.sys_bytes),
            (&self.sys_count, delta.sys_count),
        ];
        for (gauge, value) in pairs {
            if value != 0 {
                gauge.fetch_add(value, Ordering::Relaxed);
            }
        }
    }

    pub fn lease_request_complete(&self, success: bool) {
        let counter = if success {
            &self.lease_request_success
        } else {
            &self.lease_request_error
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StoreMetricsSnapshot {
        StoreMetricsSnapshot {
            live_bytes: self.live_bytes.load(Ordering::Relaxed),
            key_bytes: self.key_bytes.load(Ordering::Relaxed),
            val_bytes: self.val_bytes.load(Ordering::Relaxed),
            intent_bytes: self.intent_bytes.load(Ordering::Relaxed),
            live_count: self.live_count.load(Ordering::Relaxed),
            key_count: self.key_count.load(Ordering::Relaxed),
            val_count: self.val_count.load(Ordering::Relaxed),
            intent_count: self.intent_count.load(Ordering::Relaxed),
            sys_bytes: self.sys_bytes.load(Ordering::Relaxed),
            sys_count: self.sys_count.load(Ordering::Relaxed),
            lease_request_success: self.lease_request_success.load(Ordering::Relaxed),
            lease_request_error: self.lease_request_error.load(Ordering::Relaxed),
        }
    }
}

/// Decoded raft entries kept in memory for fast follower catch-up.
#[derive(Debug, Default)]
pub struct RaftEntryCache {
    entries: Mutex<BTreeMap<(RangeId, u64), Vec<u8>>>,
}

impl RaftEntryCache {
    pub fn add_entries(&self, range_id: RangeId, entries: impl IntoIterator<Item = (u64, Vec<u8>)>) {
        let mut cache = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        for (index, data) in entries {
            cache.insert((range_id, index), data);
        }
    }

    /// Drop every cached entry of `range_id` with an index below `hi`.
    pub fn clear_to(&self, range_id: RangeId, hi: u64) {
        let mut cache = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let doomed: Vec<_> = cache
            .range((range_id, 0)..(range_id, hi))
            .map(|(key, _)| *key)
            .collect();
        for key in doomed {
            cache.remove(&key);
        }
    }

    pub fn len(&self, range_id: RangeId) -> usize {
        let cache = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        cache.range((range_id, 0)..=(range_id, u64::MAX)).count()
    }
}
