//! Shared harness for replica integration tests: one replica on store 1 with
//! recording fakes for every collaborator.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use holo_replica::replica::{
    CandidateQueue, FatalError, FrozenStatus, Gossip, IntentResolver, IntentsWithArg, Lease,
    LeaseAcquirer, ManualClock, MvccStats, RaftGroup, RaftRole, RangeDescriptor, RangeId,
    RangeTopology, Replica, ReplicaDescriptor, ReplicaGcQueue, ReplicaId, ReplicaState,
    SideEffects, Span, SplitTrigger, Store, StoreServices, Timestamp,
};
use holo_replica::storage::{EngineSnapshot, MemEngine, StateEngine, StateLoader, WriteBatch};
use holo_replica::{ApplyConfig, Stopper};
use tracing_subscriber::EnvFilter;

pub const RANGE_ID: RangeId = 1;
pub const START_NANOS: i64 = 100;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .with_test_writer()
        .try_init();
}

pub fn replica_desc(n: u64) -> ReplicaDescriptor {
    ReplicaDescriptor {
        node_id: n,
        store_id: n,
        replica_id: n,
    }
}

pub fn range_desc(start_key: &[u8], end_key: &[u8]) -> RangeDescriptor {
    RangeDescriptor {
        range_id: RANGE_ID,
        start_key: start_key.to_vec(),
        end_key: end_key.to_vec(),
        replicas: vec![replica_desc(1), replica_desc(2), replica_desc(3)],
        next_replica_id: 4,
    }
}

pub fn lease(holder: u64, start: i64, start_stasis: i64, expiration: i64) -> Lease {
    Lease {
        start: Timestamp::new(start, 0),
        start_stasis: Timestamp::new(start_stasis, 0),
        expiration: Timestamp::new(expiration, 0),
        replica: replica_desc(holder),
    }
}

/// MemEngine that counts snapshots and can be told to fail commits.
#[derive(Default)]
pub struct CountingEngine {
    inner: MemEngine,
    pub snapshots: AtomicUsize,
    pub fail_commits: AtomicBool,
}

impl StateEngine for CountingEngine {
    fn get(&self, key: &[u8]) -> anyhow::Result<Option<Vec<u8>>> {
        self.inner.get(key)
    }

    fn commit(&self, batch: WriteBatch) -> anyhow::Result<()> {
        if self.fail_commits.load(Ordering::SeqCst) {
            anyhow::bail!("injected commit failure");
        }
        self.inner.commit(batch)
    }

    fn snapshot(&self) -> anyhow::Result<Box<dyn EngineSnapshot>> {
        self.snapshots.fetch_add(1, Ordering::SeqCst);
        self.inner.snapshot()
    }
}

#[derive(Default)]
pub struct RecordingQueue {
    pub adds: Mutex<Vec<(RangeId, Timestamp)>>,
}

impl RecordingQueue {
    pub fn count(&self) -> usize {
        self.adds.lock().expect("queue lock").len()
    }
}

impl CandidateQueue for RecordingQueue {
    fn maybe_add(&self, range_id: RangeId, now: Timestamp) {
        self.adds.lock().expect("queue lock").push((range_id, now));
    }
}

#[derive(Default)]
pub struct RecordingGcQueue {
    pub adds: Mutex<Vec<(RangeId, f64)>>,
    pub fail: AtomicBool,
}

impl ReplicaGcQueue for RecordingGcQueue {
    fn add(&self, range_id: RangeId, priority: f64) -> anyhow::Result<()> {
        self.adds.lock().expect("gc lock").push((range_id, priority));
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("replica GC queue full");
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingGossip {
    pub first_range: Mutex<Vec<RangeDescriptor>>,
    pub system_config: Mutex<Vec<RangeId>>,
    pub liveness: Mutex<Vec<Span>>,
}

impl RecordingGossip {
    pub fn first_range_count(&self) -> usize {
        self.first_range.lock().expect("gossip lock").len()
    }
}

impl Gossip for RecordingGossip {
    fn gossip_first_range(&self, desc: &RangeDescriptor) {
        self.first_range.lock().expect("gossip lock").push(desc.clone());
    }

    fn maybe_gossip_system_config(&self, range_id: RangeId) {
        self.system_config.lock().expect("gossip lock").push(range_id);
    }

    fn maybe_gossip_node_liveness(&self, _range_id: RangeId, span: &Span) {
        self.liveness.lock().expect("gossip lock").push(span.clone());
    }
}

#[derive(Default)]
pub struct RecordingIntentResolver {
    pub batches: Mutex<Vec<Vec<IntentsWithArg>>>,
}

impl IntentResolver for RecordingIntentResolver {
    fn process_intents_async(&self, _range_id: RangeId, intents: Vec<IntentsWithArg>) {
        self.batches.lock().expect("intent lock").push(intents);
    }
}

pub struct FakeLeaseAcquirer {
    pub has_lease: AtomicBool,
    pub calls: AtomicUsize,
}

impl Default for FakeLeaseAcquirer {
    fn default() -> Self {
        Self {
            has_lease: AtomicBool::new(true),
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl LeaseAcquirer for FakeLeaseAcquirer {
    async fn lease_for_gossip(&self, _range_id: RangeId) -> anyhow::Result<bool> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.has_lease.load(Ordering::SeqCst))
    }
}

/// Records triggers along with the stats persisted when each one ran.
pub struct RecordingTopology {
    engine: Arc<CountingEngine>,
    pub splits: Mutex<Vec<(SplitTrigger, MvccStats)>>,
    pub merges: Mutex<Vec<(RangeDescriptor, RangeId)>>,
    pub fail_merge: AtomicBool,
}

impl RangeTopology for RecordingTopology {
    fn split_post_apply(&self, _rhs_delta: &MvccStats, trigger: &SplitTrigger) -> anyhow::Result<()> {
        let persisted = StateLoader::new(RANGE_ID).load_stats(self.engine.as_ref())?;
        self.splits
            .lock()
            .expect("topology lock")
            .push((trigger.clone(), persisted));
        Ok(())
    }

    fn merge_range(&self, left_desc: &RangeDescriptor, right_range_id: RangeId) -> anyhow::Result<()> {
        if self.fail_merge.load(Ordering::SeqCst) {
            anyhow::bail!("right-hand range {right_range_id} not found");
        }
        self.merges
            .lock()
            .expect("topology lock")
            .push((left_desc.clone(), right_range_id));
        Ok(())
    }
}

pub struct FakeRaft {
    pub role: Mutex<RaftRole>,
    pub transfers: Mutex<Vec<ReplicaId>>,
    pub fail: AtomicBool,
}

impl Default for FakeRaft {
    fn default() -> Self {
        Self {
            role: Mutex::new(RaftRole::Follower),
            transfers: Mutex::new(Vec::new()),
            fail: AtomicBool::new(false),
        }
    }
}

impl RaftGroup for FakeRaft {
    fn role(&self) -> anyhow::Result<RaftRole> {
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("raft group destroyed");
        }
        Ok(*self.role.lock().expect("raft lock"))
    }

    fn transfer_leader(&self, target: ReplicaId) -> anyhow::Result<()> {
        self.transfers.lock().expect("raft lock").push(target);
        Ok(())
    }
}

pub struct Harness {
    pub engine: Arc<CountingEngine>,
    pub clock: Arc<ManualClock>,
    pub stopper: Arc<Stopper>,
    pub raft: Arc<FakeRaft>,
    pub raft_log_queue: Arc<RecordingQueue>,
    pub split_queue: Arc<RecordingQueue>,
    pub gc_queue: Arc<RecordingGcQueue>,
    pub gossip: Arc<RecordingGossip>,
    pub intents: Arc<RecordingIntentResolver>,
    pub lease_acquirer: Arc<FakeLeaseAcquirer>,
    pub topology: Arc<RecordingTopology>,
    pub store: Arc<Store>,
    pub replica: Arc<Replica>,
}

impl Harness {
    /// Must run inside a tokio runtime.
    pub fn start() -> Self {
        Self::start_with(ApplyConfig::default(), range_desc(b"a", b"z"))
    }

    pub fn start_with(config: ApplyConfig, desc: RangeDescriptor) -> Self {
        init_tracing();
        let engine = Arc::new(CountingEngine::default());
        let clock = Arc::new(ManualClock::new(START_NANOS));
        let stopper = Arc::new(Stopper::from_current().expect("tokio runtime"));
        let raft = Arc::new(FakeRaft::default());
        let raft_log_queue = Arc::new(RecordingQueue::default());
        let split_queue = Arc::new(RecordingQueue::default());
        let gc_queue = Arc::new(RecordingGcQueue::default());
        let gossip = Arc::new(RecordingGossip::default());
        let intents = Arc::new(RecordingIntentResolver::default());
        let lease_acquirer = Arc::new(FakeLeaseAcquirer::default());
        let topology = Arc::new(RecordingTopology {
            engine: engine.clone(),
            splits: Mutex::new(Vec::new()),
            merges: Mutex::new(Vec::new()),
            fail_merge: AtomicBool::new(false),
        });

        let state = ReplicaState {
            desc,
            ..Default::default()
        };
        let mut batch = WriteBatch::new();
        StateLoader::new(RANGE_ID)
            .save(&mut batch, &state)
            .expect("stage initial state");
        engine.commit(batch).expect("persist initial state");

        let store = Store::new(
            1,
            1,
            config,
            clock.clone(),
            engine.clone(),
            stopper.clone(),
            StoreServices {
                raft_log_queue: raft_log_queue.clone(),
                split_queue: split_queue.clone(),
                replica_gc_queue: gc_queue.clone(),
                gossip: gossip.clone(),
                intent_resolver: intents.clone(),
                lease_acquirer: lease_acquirer.clone(),
                topology: topology.clone(),
            },
        );
        let replica =
            Replica::load(store.clone(), raft.clone(), RANGE_ID, 1).expect("load replica");

        Self {
            engine,
            clock,
            stopper,
            raft,
            raft_log_queue,
            split_queue,
            gc_queue,
            gossip,
            intents,
            lease_acquirer,
            topology,
            store,
            replica,
        }
    }

    pub fn local_origin(&self) -> ReplicaDescriptor {
        replica_desc(1)
    }

    pub fn remote_origin(&self) -> ReplicaDescriptor {
        replica_desc(2)
    }

    /// The writes evaluation would have produced alongside `effects`.
    pub fn stage(&self, effects: &SideEffects) -> WriteBatch {
        let loader = StateLoader::new(RANGE_ID);
        let r = &effects.replicated;
        let mut batch = WriteBatch::new();
        if let Some(split) = &r.split {
            loader
                .set_desc(&mut batch, &split.trigger.left_desc)
                .expect("stage split");
        }
        if let Some(desc) = &r.desc {
            loader.set_desc(&mut batch, desc).expect("stage desc");
        }
        if let Some(lease) = &r.lease {
            loader.set_lease(&mut batch, lease).expect("stage lease");
        }
        if let Some(truncated) = &r.truncated_state {
            loader
                .set_truncated_state(&mut batch, truncated)
                .expect("stage truncated state");
        }
        if !r.gc_threshold.is_zero() {
            loader
                .set_gc_threshold(&mut batch, &r.gc_threshold)
                .expect("stage gc threshold");
        }
        if !r.txn_span_gc_threshold.is_zero() {
            loader
                .set_txn_span_gc_threshold(&mut batch, &r.txn_span_gc_threshold)
                .expect("stage txn gc threshold");
        }
        if r.frozen != FrozenStatus::Unspecified {
            loader.set_frozen(&mut batch, &r.frozen).expect("stage frozen");
        }
        batch
    }

    /// Apply `effects` at `index` as proposed by this replica.
    pub fn apply(&self, index: u64, effects: &mut SideEffects) -> Result<(), FatalError> {
        let batch = self.stage(effects);
        self.replica
            .apply_raft_command(index, 0, self.local_origin(), effects, batch)
    }

    pub fn durable_state(&self) -> ReplicaState {
        StateLoader::new(RANGE_ID)
            .load(self.engine.as_ref())
            .expect("load durable state")
    }
}
