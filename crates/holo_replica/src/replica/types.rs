//! Shared types for replica command application.
//!
//! These types are used by the side-effect record, the applicators, and the
//! collaborator traits that connect this crate to the rest of the store
//! (consensus, queues, gossip, intent resolution, range topology).

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Logical identifier for a range (shard).
pub type RangeId = u64;
/// Identifier of a store (one disk) in the cluster.
pub type StoreId = u64;
/// Identifier of a node in the cluster.
pub type NodeId = u64;
/// Identifier of a replica within its range's consensus group.
pub type ReplicaId = u64;

/// Hybrid-logical timestamp. The zero value means "unset".
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct Timestamp {
    pub wall_time: i64,
    pub logical: i32,
}

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp {
        wall_time: 0,
        logical: 0,
    };

    pub const fn new(wall_time: i64, logical: i32) -> Self {
        Self { wall_time, logical }
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }

    /// Ratchet `self` up to `other`. Returns whether `self` moved.
    pub fn forward(&mut self, other: Timestamp) -> bool {
        if other > *self {
            *self = other;
            true
        } else {
            false
        }
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.wall_time, self.logical)
    }
}

/// MVCC-style range statistics.
///
/// Used both as absolute per-range totals and as deltas produced by
/// evaluating a command.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MvccStats {
    /// Set when some of the counters are estimates rather than exact values.
    pub contains_estimates: bool,
    pub last_update_nanos: i64,
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
}

impl MvccStats {
    pub fn is_zero(&self) -> bool {
        *self == Self::default()
    }

    /// Fold `delta` into `self`.
    pub fn add(&mut self, delta: &MvccStats) {
        self.contains_estimates |= delta.contains_estimates;
        self.last_update_nanos = self.last_update_nanos.max(delta.last_update_nanos);
        self.live_bytes += delta.live_bytes;
        self.key_bytes += delta.key_bytes;
        self.val_bytes += delta.val_bytes;
        self.intent_bytes += delta.intent_bytes;
        self.live_count += delta.live_count;
        self.key_count += delta.key_count;
        self.val_count += delta.val_count;
        self.intent_count += delta.intent_count;
        self.sys_bytes += delta.sys_bytes;
        self.sys_count += delta.sys_count;
    }

    /// Total user data size, used for split-by-size decisions.
    pub fn total_bytes(&self) -> i64 {
        self.key_bytes + self.val_bytes
    }
}

/// Placement of one replica of a range.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReplicaDescriptor {
    pub node_id: NodeId,
    pub store_id: StoreId,
    pub replica_id: ReplicaId,
}

impl fmt::Display for ReplicaDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "(n{},s{}):{}",
            self.node_id, self.store_id, self.replica_id
        )
    }
}

/// Range boundaries and membership. Key ranges are end-exclusive; an empty
/// `end_key` means "up to the end of the keyspace".
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeDescriptor {
    pub range_id: RangeId,
    pub start_key: Vec<u8>,
    pub end_key: Vec<u8>,
    pub replicas: Vec<ReplicaDescriptor>,
    pub next_replica_id: ReplicaId,
}

impl RangeDescriptor {
    /// The first range anchors the keyspace and carries the cluster
    /// bootstrap metadata that gets gossiped.
    pub fn is_first_range(&self) -> bool {
        self.start_key.is_empty()
    }
}

/// Time-bounded, single-holder grant to serve the range.
///
/// `start_stasis` marks the point after which the holder stops serving even
/// though the lease has not expired yet; the gap absorbs clock offset between
/// nodes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub start: Timestamp,
    pub start_stasis: Timestamp,
    pub expiration: Timestamp,
    pub replica: ReplicaDescriptor,
}

impl Lease {
    /// Whether the lease can serve requests at `ts`.
    pub fn covers(&self, ts: Timestamp) -> bool {
        self.start <= ts && ts < self.start_stasis
    }
}

impl fmt::Display for Lease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "replica {} {} {}",
            self.replica, self.start, self.expiration
        )
    }
}

/// Raft log truncation marker: everything up to and including `index` is gone.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TruncatedState {
    pub index: u64,
    pub term: u64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrozenStatus {
    #[default]
    Unspecified,
    Frozen,
    Unfrozen,
}

/// Key span; an empty `end_key` denotes the single key `key`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub key: Vec<u8>,
    pub end_key: Vec<u8>,
}

/// A provisional write left behind by a transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Intent {
    pub span: Span,
    pub txn_id: u64,
}

/// Intents encountered while evaluating one request, with the request span.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IntentsWithArg {
    pub arg: Span,
    pub intents: Vec<Intent>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SplitTrigger {
    pub left_desc: RangeDescriptor,
    pub right_desc: RangeDescriptor,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Split {
    pub trigger: SplitTrigger,
    /// Stats of the right-hand side, subtracted from the left by the trigger.
    pub rhs_delta: MvccStats,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MergeTrigger {
    /// Left-hand descriptor after the merge (already spans both ranges).
    pub left_desc: RangeDescriptor,
    pub right_desc: RangeDescriptor,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReplicaChangeType {
    AddReplica,
    RemoveReplica,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChangeReplicasTrigger {
    pub change_type: ReplicaChangeType,
    pub replica: ReplicaDescriptor,
    pub updated_replicas: Vec<ReplicaDescriptor>,
    pub next_replica_id: ReplicaId,
}

/// Identifies one consistency check across all replicas of a range.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChecksumId(pub u64);

impl fmt::Display for ChecksumId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ComputeChecksum {
    pub checksum_id: ChecksumId,
    /// Also materialize the range contents for diagnostics.
    pub snapshot: bool,
}

/// Source of hybrid-logical time for lease and timestamp cache decisions.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> Timestamp;
}

/// Wall-clock backed hybrid clock. Logical ticks disambiguate readings taken
/// within the same nanosecond and keep `now` monotonic.
#[derive(Debug, Default)]
pub struct HybridClock {
    last: Mutex<Timestamp>,
}

impl HybridClock {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Clock for HybridClock {
    fn now(&self) -> Timestamp {
        let physical = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos()
            .min(i64::MAX as u128) as i64;
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        if physical > last.wall_time {
            *last = Timestamp::new(physical, 0);
        } else {
            last.logical += 1;
        }
        *last
    }
}

/// Manually driven clock for tests and simulations.
#[derive(Debug, Default)]
pub struct ManualClock {
    nanos: AtomicI64,
}

impl ManualClock {
    pub fn new(nanos: i64) -> Self {
        Self {
            nanos: AtomicI64::new(nanos),
        }
    }

    pub fn set(&self, nanos: i64) {
        self.nanos.store(nanos, Ordering::SeqCst);
    }

    pub fn advance(&self, nanos: i64) {
        self.nanos.fetch_add(nanos, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        Timestamp::new(self.nanos.load(Ordering::SeqCst), 0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RaftRole {
    Follower,
    Candidate,
    Leader,
}

/// Handle on the range's consensus group.
///
/// Errors from either method mean the local group is gone or storage is
/// failing; callers treat them as fatal.
pub trait RaftGroup: Send + Sync + 'static {
    fn role(&self) -> anyhow::Result<RaftRole>;
    /// Ask the group to hand leadership to `target`. The transfer may silently
    /// not happen (e.g. the target lags behind on the log).
    fn transfer_leader(&self, target: ReplicaId) -> anyhow::Result<()>;
}

/// "Maybe add" queue: the queue owns admission and dedup.
pub trait CandidateQueue: Send + Sync + 'static {
    fn maybe_add(&self, range_id: RangeId, now: Timestamp);
}

pub trait ReplicaGcQueue: Send + Sync + 'static {
    fn add(&self, range_id: RangeId, priority: f64) -> anyhow::Result<()>;
}

/// Best-effort publication of cluster metadata.
pub trait Gossip: Send + Sync + 'static {
    fn gossip_first_range(&self, desc: &RangeDescriptor);
    fn maybe_gossip_system_config(&self, range_id: RangeId);
    fn maybe_gossip_node_liveness(&self, range_id: RangeId, span: &Span);
}

pub trait IntentResolver: Send + Sync + 'static {
    /// Fire-and-forget: resolution happens asynchronously.
    fn process_intents_async(&self, range_id: RangeId, intents: Vec<IntentsWithArg>);
}

/// Lease acquisition, used when a side task must hold the lease to act.
#[async_trait]
pub trait LeaseAcquirer: Send + Sync + 'static {
    /// Return whether this replica holds (or just acquired) the lease.
    async fn lease_for_gossip(&self, range_id: RangeId) -> anyhow::Result<bool>;
}

/// Store-level execution of range topology changes.
pub trait RangeTopology: Send + Sync + 'static {
    /// Create the right-hand range of a split and split its data off.
    fn split_post_apply(&self, rhs_delta: &MvccStats, trigger: &SplitTrigger)
        -> anyhow::Result<()>;
    /// Absorb the right-hand range into the left one and drop its replica.
    fn merge_range(&self, left_desc: &RangeDescriptor, right_range_id: RangeId)
        -> anyhow::Result<()>;
}
