//! The side-effect record produced by evaluating a command.
//!
//! `ReplicatedEffects` must be applied identically on every replica;
//! `LocalEffects` only matters on the node that proposed the command.
//!
//! Both halves are consumed destructively: merging and applying reset each
//! field to its default once handled. `nonzero_fields` is the manifest used to
//! check that nothing was left behind. It destructures the struct without a
//! rest pattern, so a new field does not compile until it is listed there.

use std::fmt;

use thiserror::Error;
use tokio::sync::watch;

use super::types::{
    ChangeReplicasTrigger, ComputeChecksum, FrozenStatus, IntentsWithArg, Lease, MergeTrigger,
    MvccStats, RangeDescriptor, Span, Split, Timestamp, TruncatedState,
};

/// Client-visible error carried by a command and delivered verbatim.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct CommandError {
    pub message: String,
}

impl CommandError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Opaque reply payload for the waiting client.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BatchReply {
    pub payload: Vec<u8>,
}

/// Outcome delivered to whoever waits on a proposal.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProposalResult {
    pub reply: Option<BatchReply>,
    pub err: Option<CommandError>,
    pub should_retry: bool,
}

/// Proposal identity used for replay protection.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct CommandId(pub u64);

impl CommandId {
    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }
}

/// Releases the admission (command queue / timestamp cache slots) held by a
/// proposal. Runs once, before the result is published.
pub type EndCmds = Box<dyn FnOnce(&ProposalResult) + Send + 'static>;

/// Publishing side of a proposal's result channel.
///
/// Dropping it closes the channel, which tells every waiter that no further
/// outcome will arrive.
#[derive(Debug)]
pub struct ResultSender {
    tx: watch::Sender<Option<ProposalResult>>,
}

impl ResultSender {
    pub fn subscribe(&self) -> ProposalWaiter {
        ProposalWaiter {
            rx: self.tx.subscribe(),
        }
    }

    fn publish(self, result: ProposalResult) {
        self.tx.send_replace(Some(result));
    }
}

/// Waiting side of a proposal's result channel. Cheap to clone; every clone
/// observes the same outcome.
#[derive(Clone, Debug)]
pub struct ProposalWaiter {
    rx: watch::Receiver<Option<ProposalResult>>,
}

impl ProposalWaiter {
    /// Wait for the outcome. `None` means the channel closed without one.
    pub async fn wait(mut self) -> Option<ProposalResult> {
        // `wait_for` checks the current value first, so an outcome published
        // right before the sender was dropped is still observed.
        let outcome = match self.rx.wait_for(Option::is_some).await {
            Ok(value) => (*value).clone(),
            Err(_) => None,
        };
        outcome
    }

    /// Outcome published so far, without waiting.
    pub fn try_result(&self) -> Option<ProposalResult> {
        self.rx.borrow().clone()
    }
}

pub fn result_channel() -> (ResultSender, ProposalWaiter) {
    let (tx, rx) = watch::channel(None);
    (ResultSender { tx }, ProposalWaiter { rx })
}

/// Effects every replica applies identically.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ReplicatedEffects {
    // Markers that carry no action at apply time.
    pub is_lease_request: bool,
    pub is_consistency_related: bool,
    pub is_freeze: bool,
    pub timestamp: Timestamp,

    /// Gates the read-blocking critical section while the command applies.
    pub block_reads: bool,
    pub delta: MvccStats,

    // Assigned once by the apply loop, never by evaluation.
    pub raft_applied_index: u64,
    pub lease_applied_index: u64,
    pub stats: MvccStats,

    pub desc: Option<RangeDescriptor>,
    pub lease: Option<Lease>,
    pub truncated_state: Option<TruncatedState>,
    pub gc_threshold: Timestamp,
    pub txn_span_gc_threshold: Timestamp,
    pub frozen: FrozenStatus,

    pub split: Option<Split>,
    pub merge: Option<MergeTrigger>,
    pub change_replicas: Option<ChangeReplicasTrigger>,
    pub compute_checksum: Option<ComputeChecksum>,
}

impl ReplicatedEffects {
    /// Names of all fields still holding a non-default value.
    pub fn nonzero_fields(&self) -> Vec<&'static str> {
        let Self {
            is_lease_request,
            is_consistency_related,
            is_freeze,
            timestamp,
            block_reads,
            delta,
            raft_applied_index,
            lease_applied_index,
            stats,
            desc,
            lease,
            truncated_state,
            gc_threshold,
            txn_span_gc_threshold,
            frozen,
            split,
            merge,
            change_replicas,
            compute_checksum,
        } = self;

        let mut fields = Vec::new();
        let mut check = |set: bool, name: &'static str| {
            if set {
                fields.push(name);
            }
        };
        check(*is_lease_request, "is_lease_request");
        check(*is_consistency_related, "is_consistency_related");
        check(*is_freeze, "is_freeze");
        check(!timestamp.is_zero(), "timestamp");
        check(*block_reads, "block_reads");
        check(!delta.is_zero(), "delta");
        check(*raft_applied_index != 0, "raft_applied_index");
        check(*lease_applied_index != 0, "lease_applied_index");
        check(!stats.is_zero(), "stats");
        check(desc.is_some(), "desc");
        check(lease.is_some(), "lease");
        check(truncated_state.is_some(), "truncated_state");
        check(!gc_threshold.is_zero(), "gc_threshold");
        check(!txn_span_gc_threshold.is_zero(), "txn_span_gc_threshold");
        check(*frozen != FrozenStatus::Unspecified, "frozen");
        check(split.is_some(), "split");
        check(merge.is_some(), "merge");
        check(change_replicas.is_some(), "change_replicas");
        check(compute_checksum.is_some(), "compute_checksum");
        fields
    }

    pub fn is_empty(&self) -> bool {
        self.nonzero_fields().is_empty()
    }
}

/// Effects only relevant on the proposing node.
#[derive(Default)]
pub struct LocalEffects {
    pub command_id: CommandId,
    pub proposed_at_ticks: u64,

    /// Error to hand back to the client once the command applies. Some
    /// commands must commit data even though they fail.
    pub err: Option<CommandError>,
    pub reply: Option<BatchReply>,
    pub end_cmds: Option<EndCmds>,
    pub done_tx: Option<ResultSender>,

    /// New raft log size estimate; not replicated, so only approximate.
    pub raft_log_size: Option<i64>,
    /// Intents encountered but not conflicted with, resolved asynchronously
    /// on the proposer even if the command failed.
    pub intents: Option<Vec<IntentsWithArg>>,
    /// Whether a lease request succeeded, for the lease metrics.
    pub lease_metrics_result: Option<bool>,
    pub gossip_first_range: bool,
    pub maybe_gossip_system_config: bool,
    pub maybe_add_to_split_queue: bool,
    pub maybe_gossip_node_liveness: Option<Span>,
}

impl LocalEffects {
    pub fn nonzero_fields(&self) -> Vec<&'static str> {
        let Self {
            command_id,
            proposed_at_ticks,
            err,
            reply,
            end_cmds,
            done_tx,
            raft_log_size,
            intents,
            lease_metrics_result,
            gossip_first_range,
            maybe_gossip_system_config,
            maybe_add_to_split_queue,
            maybe_gossip_node_liveness,
        } = self;

        let mut fields = Vec::new();
        let mut check = |set: bool, name: &'static str| {
            if set {
                fields.push(name);
            }
        };
        check(!command_id.is_zero(), "command_id");
        check(*proposed_at_ticks != 0, "proposed_at_ticks");
        check(err.is_some(), "err");
        check(reply.is_some(), "reply");
        check(end_cmds.is_some(), "end_cmds");
        check(done_tx.is_some(), "done_tx");
        check(raft_log_size.is_some(), "raft_log_size");
        check(intents.is_some(), "intents");
        check(lease_metrics_result.is_some(), "lease_metrics_result");
        check(*gossip_first_range, "gossip_first_range");
        check(*maybe_gossip_system_config, "maybe_gossip_system_config");
        check(*maybe_add_to_split_queue, "maybe_add_to_split_queue");
        check(
            maybe_gossip_node_liveness.is_some(),
            "maybe_gossip_node_liveness",
        );
        fields
    }

    pub fn is_empty(&self) -> bool {
        self.nonzero_fields().is_empty()
    }

    /// Attach a fresh result channel and return a waiter for it.
    pub fn attach_result_channel(&mut self) -> ProposalWaiter {
        let (tx, rx) = result_channel();
        self.done_tx = Some(tx);
        rx
    }

    /// Run the completion hook, then publish `result` and close the channel.
    ///
    /// The hook runs here rather than in the waiting client because the client
    /// may have been cancelled and stopped listening. Both parts are taken out
    /// of `self`, so a second call (e.g. from a cancellation path racing normal
    /// completion) is a no-op.
    pub fn finish(&mut self, result: ProposalResult) {
        if let Some(end_cmds) = self.end_cmds.take() {
            end_cmds(&result);
        }
        if let Some(tx) = self.done_tx.take() {
            tx.publish(result);
        }
    }
}

impl fmt::Debug for LocalEffects {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalEffects")
            .field("command_id", &self.command_id)
            .field("proposed_at_ticks", &self.proposed_at_ticks)
            .field("err", &self.err)
            .field("reply", &self.reply)
            .field("end_cmds", &self.end_cmds.is_some())
            .field("done_tx", &self.done_tx.is_some())
            .field("raft_log_size", &self.raft_log_size)
            .field("intents", &self.intents)
            .field("lease_metrics_result", &self.lease_metrics_result)
            .field("gossip_first_range", &self.gossip_first_range)
            .field("maybe_gossip_system_config", &self.maybe_gossip_system_config)
            .field("maybe_add_to_split_queue", &self.maybe_add_to_split_queue)
            .field("maybe_gossip_node_liveness", &self.maybe_gossip_node_liveness)
            .finish()
    }
}

/// Full evaluation result of a command.
#[derive(Debug, Default)]
pub struct SideEffects {
    pub replicated: ReplicatedEffects,
    pub local: LocalEffects,
}

impl SideEffects {
    pub fn nonzero_fields(&self) -> Vec<&'static str> {
        let mut fields = self.replicated.nonzero_fields();
        fields.extend(self.local.nonzero_fields());
        fields
    }

    pub fn is_empty(&self) -> bool {
        self.replicated.is_empty() && self.local.is_empty()
    }
}
