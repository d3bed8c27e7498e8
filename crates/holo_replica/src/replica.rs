//! Replica module wiring.
//!
//! `effects` defines the side-effect record and `merge` combines partial
//! records. `apply` hosts the replicated/local applicators and the apply
//! coordinator, with `lease` and `checksum` as sub-steps. `state` holds the
//! per-replica state behind its mutex, `store` the store-wide collaborators,
//! and `types` the shared data types and collaborator traits.

mod apply;
mod checksum;
mod effects;
mod error;
mod lease;
mod merge;
mod state;
mod store;
mod tscache;
mod types;

pub use checksum::{ChecksumResult, SnapshotData};
pub use effects::{
    result_channel, BatchReply, CommandError, CommandId, EndCmds, LocalEffects, ProposalResult,
    ProposalWaiter, ReplicatedEffects, ResultSender, SideEffects,
};
pub use error::{FatalError, MergeError};
pub use state::{Replica, ReplicaState};
pub use store::{RaftEntryCache, Store, StoreMetrics, StoreMetricsSnapshot, StoreServices};
pub use tscache::TimestampCache;
pub use types::{
    CandidateQueue, ChangeReplicasTrigger, ChecksumId, Clock, ComputeChecksum, FrozenStatus,
    Gossip, HybridClock, Intent, IntentResolver, IntentsWithArg, Lease, LeaseAcquirer,
    ManualClock, MergeTrigger, MvccStats, NodeId, RaftGroup, RaftRole, RangeDescriptor, RangeId,
    RangeTopology, ReplicaChangeType, ReplicaDescriptor, ReplicaGcQueue, ReplicaId, Span, Split,
    SplitTrigger, StoreId, Timestamp, TruncatedState,
};
