//! State engine abstraction and the durable layout of replica state.
//!
//! The apply path only needs three things from storage: point reads, atomic
//! batch commits, and consistent snapshots for checksums. `MemEngine` backs
//! tests and simulations; `FjallEngine` persists to a fjall partition.
//!
//! Replica state lives under a per-range local prefix (`StateLoader`) that
//! sorts before every user key, so checksum scans can cover the two spaces
//! separately.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::path::Path;
use std::sync::{Arc, RwLock};

use anyhow::Context;
use fjall::{Keyspace, PartitionCreateOptions, PersistMode};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::replica::{
    FrozenStatus, Lease, MvccStats, RangeDescriptor, RangeId, ReplicaState, Timestamp,
    TruncatedState,
};

/// Keys starting with this byte are range-local; user keys must not.
pub const LOCAL_PREFIX: &[u8] = b"\x01";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BatchOp {
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
}

/// Ordered set of writes committed atomically.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WriteBatch {
    ops: Vec<BatchOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) {
        self.ops.push(BatchOp::Put {
            key: key.into(),
            value: value.into(),
        });
    }

    pub fn delete(&mut self, key: impl Into<Vec<u8>>) {
        self.ops.push(BatchOp::Delete { key: key.into() });
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }
}

pub trait StateEngine: Send + Sync + 'static {
    fn get(&self, key: &[u8]) -> anyhow::Result<Option<Vec<u8>>>;
    fn commit(&self, batch: WriteBatch) -> anyhow::Result<()>;
    fn snapshot(&self) -> anyhow::Result<Box<dyn EngineSnapshot>>;
}

/// Point-in-time view used off the apply path.
pub trait EngineSnapshot: Send {
    /// Key/value pairs in `[start, end)`; an empty `end` is unbounded.
    fn scan(&self, start: &[u8], end: &[u8]) -> anyhow::Result<Vec<(Vec<u8>, Vec<u8>)>>;
}

fn upper_bound(end: &[u8]) -> Bound<Vec<u8>> {
    if end.is_empty() {
        Bound::Unbounded
    } else {
        Bound::Excluded(end.to_vec())
    }
}

type MemTable = BTreeMap<Vec<u8>, Vec<u8>>;

/// In-memory engine. Snapshots share the table until the next commit copies it.
#[derive(Debug, Default)]
pub struct MemEngine {
    table: RwLock<Arc<MemTable>>,
}

impl MemEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.table.read().map(|t| t.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl StateEngine for MemEngine {
    fn get(&self, key: &[u8]) -> anyhow::Result<Option<Vec<u8>>> {
        let table = self
            .table
            .read()
            .map_err(|_| anyhow::anyhow!("mem engine lock poisoned"))?;
        Ok(table.get(key).cloned())
    }

    fn commit(&self, batch: WriteBatch) -> anyhow::Result<()> {
        let mut guard = self
            .table
            .write()
            .map_err(|_| anyhow::anyhow!("mem engine lock poisoned"))?;
        let table = Arc::make_mut(&mut *guard);
        for op in batch.ops {
            match op {
                BatchOp::Put { key, value } => {
                    table.insert(key, value);
                }
                BatchOp::Delete { key } => {
                    table.remove(&key);
                }
            }
        }
        Ok(())
    }

    fn snapshot(&self) -> anyhow::Result<Box<dyn EngineSnapshot>> {
        let table = self
            .table
            .read()
            .map_err(|_| anyhow::anyhow!("mem engine lock poisoned"))?;
        Ok(Box::new(MemSnapshot {
            table: table.clone(),
        }))
    }
}

struct MemSnapshot {
    table: Arc<MemTable>,
}

impl EngineSnapshot for MemSnapshot {
    fn scan(&self, start: &[u8], end: &[u8]) -> anyhow::Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let range = (Bound::Included(start.to_vec()), upper_bound(end));
        Ok(self
            .table
            .range(range)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

/// Engine over a single fjall partition.
pub struct FjallEngine {
    keyspace: Arc<Keyspace>,
    partition: fjall::PartitionHandle,
    sync_writes: bool,
}

impl FjallEngine {
    pub fn open(keyspace: Arc<Keyspace>, name: &str, sync_writes: bool) -> anyhow::Result<Self> {
        let partition = keyspace
            .open_partition(name, PartitionCreateOptions::default())
            .with_context(|| format!("open partition {name}"))?;
        Ok(Self {
            keyspace,
            partition,
            sync_writes,
        })
    }

    /// Open (or create) a keyspace at `path` holding the replica state partition.
    pub fn open_path(path: impl AsRef<Path>, sync_writes: bool) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let keyspace = fjall::Config::new(path)
            .open()
            .with_context(|| format!("open keyspace at {}", path.display()))?;
        Self::open(Arc::new(keyspace), "replica_state", sync_writes)
    }
}

impl StateEngine for FjallEngine {
    fn get(&self, key: &[u8]) -> anyhow::Result<Option<Vec<u8>>> {
        Ok(self.partition.get(key)?.map(|v| v.to_vec()))
    }

    fn commit(&self, batch: WriteBatch) -> anyhow::Result<()> {
        let mut fjall_batch = self.keyspace.batch();
        for op in batch.ops {
            match op {
                BatchOp::Put { key, value } => fjall_batch.insert(&self.partition, key, value),
                BatchOp::Delete { key } => fjall_batch.remove(&self.partition, key),
            }
        }
        fjall_batch.commit().context("commit fjall batch")?;
        if self.sync_writes {
            self.keyspace
                .persist(PersistMode::SyncAll)
                .context("persist fjall keyspace")?;
        }
        Ok(())
    }

    fn snapshot(&self) -> anyhow::Result<Box<dyn EngineSnapshot>> {
        Ok(Box::new(FjallSnapshot {
            snapshot: self.partition.snapshot(),
        }))
    }
}

struct FjallSnapshot {
    snapshot: fjall::Snapshot,
}

impl EngineSnapshot for FjallSnapshot {
    fn scan(&self, start: &[u8], end: &[u8]) -> anyhow::Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let range = (Bound::Included(start.to_vec()), upper_bound(end));
        let mut out = Vec::new();
        for item in self.snapshot.range(range) {
            let (key, value) = item?;
            out.push((key.to_vec(), value.to_vec()));
        }
        Ok(out)
    }
}

const APPLIED_RAFT_SUFFIX: &str = "rftapl";
const APPLIED_LEASE_SUFFIX: &str = "lseapl";
const STATS_SUFFIX: &str = "stats";
const DESC_SUFFIX: &str = "rdsc";
const LEASE_SUFFIX: &str = "rll";
const TRUNCATED_SUFFIX: &str = "rftt";
const GC_THRESHOLD_SUFFIX: &str = "lgc";
const TXN_GC_THRESHOLD_SUFFIX: &str = "ltgc";
const FROZEN_SUFFIX: &str = "fzn";

/// Reads and writes the durable copy of a replica's state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StateLoader {
    range_id: RangeId,
}

impl StateLoader {
    pub fn new(range_id: RangeId) -> Self {
        Self { range_id }
    }

    /// Key prefix shared by every state item of this range.
    pub fn prefix(&self) -> Vec<u8> {
        let mut key = LOCAL_PREFIX.to_vec();
        key.extend_from_slice(b"i");
        key.extend_from_slice(&self.range_id.to_be_bytes());
        key
    }

    /// Exclusive end of this range's state keys.
    pub fn prefix_end(&self) -> Vec<u8> {
        let mut key = self.prefix();
        key.push(0xff);
        key
    }

    fn key(&self, suffix: &str) -> Vec<u8> {
        let mut key = self.prefix();
        key.extend_from_slice(suffix.as_bytes());
        key
    }

    fn put<T: Serialize>(&self, batch: &mut WriteBatch, suffix: &str, value: &T) -> anyhow::Result<()> {
        let bytes =
            serde_json::to_vec(value).with_context(|| format!("encode replica state {suffix}"))?;
        batch.put(self.key(suffix), bytes);
        Ok(())
    }

    fn get<T: DeserializeOwned + Default>(
        &self,
        engine: &dyn StateEngine,
        suffix: &str,
    ) -> anyhow::Result<T> {
        match engine.get(&self.key(suffix))? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .with_context(|| format!("decode replica state {suffix}")),
            None => Ok(T::default()),
        }
    }

    pub fn set_applied_index(
        &self,
        batch: &mut WriteBatch,
        raft_applied_index: u64,
        lease_applied_index: u64,
    ) -> anyhow::Result<()> {
        self.put(batch, APPLIED_RAFT_SUFFIX, &raft_applied_index)?;
        self.put(batch, APPLIED_LEASE_SUFFIX, &lease_applied_index)
    }

    pub fn set_stats(&self, batch: &mut WriteBatch, stats: &MvccStats) -> anyhow::Result<()> {
        self.put(batch, STATS_SUFFIX, stats)
    }

    pub fn set_desc(&self, batch: &mut WriteBatch, desc: &RangeDescriptor) -> anyhow::Result<()> {
        self.put(batch, DESC_SUFFIX, desc)
    }

    pub fn set_lease(&self, batch: &mut WriteBatch, lease: &Lease) -> anyhow::Result<()> {
        self.put(batch, LEASE_SUFFIX, lease)
    }

    pub fn set_truncated_state(
        &self,
        batch: &mut WriteBatch,
        truncated: &TruncatedState,
    ) -> anyhow::Result<()> {
        self.put(batch, TRUNCATED_SUFFIX, truncated)
    }

    pub fn set_gc_threshold(&self, batch: &mut WriteBatch, ts: &Timestamp) -> anyhow::Result<()> {
        self.put(batch, GC_THRESHOLD_SUFFIX, ts)
    }

    pub fn set_txn_span_gc_threshold(
        &self,
        batch: &mut WriteBatch,
        ts: &Timestamp,
    ) -> anyhow::Result<()> {
        self.put(batch, TXN_GC_THRESHOLD_SUFFIX, ts)
    }

    pub fn set_frozen(&self, batch: &mut WriteBatch, frozen: &FrozenStatus) -> anyhow::Result<()> {
        self.put(batch, FROZEN_SUFFIX, frozen)
    }

    /// Stage every item of `state`.
    pub fn save(&self, batch: &mut WriteBatch, state: &ReplicaState) -> anyhow::Result<()> {
        self.set_applied_index(batch, state.raft_applied_index, state.lease_applied_index)?;
        self.set_stats(batch, &state.stats)?;
        self.set_desc(batch, &state.desc)?;
        self.set_lease(batch, &state.lease)?;
        self.set_truncated_state(batch, &state.truncated_state)?;
        self.set_gc_threshold(batch, &state.gc_threshold)?;
        self.set_txn_span_gc_threshold(batch, &state.txn_span_gc_threshold)?;
        self.set_frozen(batch, &state.frozen)
    }

    pub fn load_stats(&self, engine: &dyn StateEngine) -> anyhow::Result<MvccStats> {
        self.get(engine, STATS_SUFFIX)
    }

    pub fn load(&self, engine: &dyn StateEngine) -> anyhow::Result<ReplicaState> {
        Ok(ReplicaState {
            raft_applied_index: self.get(engine, APPLIED_RAFT_SUFFIX)?,
            lease_applied_index: self.get(engine, APPLIED_LEASE_SUFFIX)?,
            stats: self.load_stats(engine)?,
            desc: self.get(engine, DESC_SUFFIX)?,
            lease: self.get(engine, LEASE_SUFFIX)?,
            truncated_state: self.get(engine, TRUNCATED_SUFFIX)?,
            gc_threshold: self.get(engine, GC_THRESHOLD_SUFFIX)?,
            txn_span_gc_threshold: self.get(engine, TXN_GC_THRESHOLD_SUFFIX)?,
            frozen: self.get(engine, FROZEN_SUFFIX)?,
        })
    }
}
