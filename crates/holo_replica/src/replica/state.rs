//! Per-replica state and the mutex guarding it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, RwLock, RwLockReadGuard};

use serde::{Deserialize, Serialize};

use crate::storage::StateLoader;

use super::checksum::ChecksumEntry;
use super::error::FatalError;
use super::store::Store;
use super::tscache::TimestampCache;
use super::types::{
    ChecksumId, FrozenStatus, Lease, MvccStats, RaftGroup, RangeDescriptor, RangeId, ReplicaId,
    Timestamp, TruncatedState,
};

/// Replicated state of a range as seen by one replica. The same values are
/// persisted through `StateLoader`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaState {
    pub raft_applied_index: u64,
    pub lease_applied_index: u64,
    pub stats: MvccStats,
    pub desc: RangeDescriptor,
    pub lease: Lease,
    pub truncated_state: TruncatedState,
    pub gc_threshold: Timestamp,
    pub txn_span_gc_threshold: Timestamp,
    pub frozen: FrozenStatus,
}

impl ReplicaState {
    /// Names of the fields that differ between `self` and `other`.
    pub fn diff(&self, other: &ReplicaState) -> Vec<&'static str> {
        let ReplicaState {
            raft_applied_index,
            lease_applied_index,
            stats,
            desc,
            lease,
            truncated_state,
            gc_threshold,
            txn_span_gc_threshold,
            frozen,
        } = self;

        let mut fields = Vec::new();
        let mut check = |same: bool, name: &'static str| {
            if !same {
                fields.push(name);
            }
        };
        check(*raft_applied_index == other.raft_applied_index, "raft_applied_index");
        check(*lease_applied_index == other.lease_applied_index, "lease_applied_index");
        check(*stats == other.stats, "stats");
        check(*desc == other.desc, "desc");
        check(*lease == other.lease, "lease");
        check(*truncated_state == other.truncated_state, "truncated_state");
        check(*gc_threshold == other.gc_threshold, "gc_threshold");
        check(
            *txn_span_gc_threshold == other.txn_span_gc_threshold,
            "txn_span_gc_threshold",
        );
        check(*frozen == other.frozen, "frozen");
        fields
    }
}

pub(super) struct ReplicaMu {
    pub(super) replica_id: ReplicaId,
    pub(super) state: ReplicaState,
    pub(super) ts_cache: TimestampCache,
    /// Approximate; only the proposer's estimate is ever updated.
    pub(super) raft_log_size: i64,
    pub(super) checksums: HashMap<ChecksumId, ChecksumEntry>,
}

/// One replica of a range on this store.
///
/// `mu` is never held across calls into collaborators, task spawns, or the
/// lease transition handler.
pub struct Replica {
    pub(super) range_id: RangeId,
    pub(super) store: Arc<Store>,
    pub(super) raft: Arc<dyn RaftGroup>,
    /// Held for writing while a command that blocks reads applies.
    pub(super) read_only_cmd_mu: RwLock<()>,
    pub(super) mu: Mutex<ReplicaMu>,
    pub(super) halted: OnceLock<String>,
}

impl Replica {
    pub fn new(
        store: Arc<Store>,
        raft: Arc<dyn RaftGroup>,
        replica_id: ReplicaId,
        state: ReplicaState,
    ) -> Arc<Self> {
        let range_id = state.desc.range_id;
        let ts_cache = TimestampCache::new(store.clock().now());
        Arc::new(Self {
            range_id,
            store,
            raft,
            read_only_cmd_mu: RwLock::new(()),
            mu: Mutex::new(ReplicaMu {
                replica_id,
                state,
                ts_cache,
                raft_log_size: 0,
                checksums: HashMap::new(),
            }),
            halted: OnceLock::new(),
        })
    }

    /// Build a replica from the state persisted for `range_id`.
    pub fn load(
        store: Arc<Store>,
        raft: Arc<dyn RaftGroup>,
        range_id: RangeId,
        replica_id: ReplicaId,
    ) -> Result<Arc<Self>, FatalError> {
        let state = StateLoader::new(range_id)
            .load(store.engine().as_ref())
            .map_err(|error| FatalError::StateLoad { range_id, error })?;
        if state.desc.range_id != range_id {
            return Err(FatalError::StateLoad {
                range_id,
                error: anyhow::anyhow!(
                    "persisted descriptor belongs to range {}",
                    state.desc.range_id
                ),
            });
        }
        Ok(Self::new(store, raft, replica_id, state))
    }

    pub fn range_id(&self) -> RangeId {
        self.range_id
    }

    pub fn replica_id(&self) -> ReplicaId {
        self.mu().replica_id
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn state(&self) -> ReplicaState {
        self.mu().state.clone()
    }

    pub fn desc(&self) -> RangeDescriptor {
        self.mu().state.desc.clone()
    }

    pub fn raft_log_size(&self) -> i64 {
        self.mu().raft_log_size
    }

    pub fn ts_cache_low_water(&self) -> Timestamp {
        self.mu().ts_cache.low_water()
    }

    pub fn ts_cache_len(&self) -> usize {
        self.mu().ts_cache.len()
    }

    pub fn record_read(&self, key: Vec<u8>, ts: Timestamp) {
        self.mu().ts_cache.add(key, ts);
    }

    /// Shared guard taken by read-only commands; excluded while a command
    /// that blocks reads is applying.
    pub fn read_guard(&self) -> RwLockReadGuard<'_, ()> {
        self.read_only_cmd_mu
            .read()
            .unwrap_or_else(|e| e.into_inner())
    }

    /// Reason the replica stopped applying commands, if it did.
    pub fn halted(&self) -> Option<&str> {
        self.halted.get().map(String::as_str)
    }

    /// Install a new descriptor. The descriptor must belong to this range.
    pub fn set_desc(&self, desc: RangeDescriptor) -> anyhow::Result<()> {
        if desc.range_id != self.range_id {
            anyhow::bail!(
                "range descriptor ID ({}) does not match replica's range ID ({})",
                desc.range_id,
                self.range_id
            );
        }
        self.mu().state.desc = desc;
        Ok(())
    }

    pub(super) fn mu(&self) -> MutexGuard<'_, ReplicaMu> {
        self.mu.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(super) fn check_halted(&self) -> Result<(), FatalError> {
        match self.halted.get() {
            Some(reason) => Err(FatalError::Halted {
                range_id: self.range_id,
                reason: reason.clone(),
            }),
            None => Ok(()),
        }
    }

    /// Record `err` as the reason this replica stops and hand it back.
    pub(super) fn halt(&self, err: FatalError) -> FatalError {
        tracing::error!(range_id = self.range_id, error = %err, "halting replica");
        let _ = self.halted.set(err.to_string());
        err
    }
}
