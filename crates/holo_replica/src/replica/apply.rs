//! Applying the side effects of committed commands.
//!
//! `apply_raft_command` is the entry point used by the raft apply loop: it
//! commits the command's write batch together with the applied indexes and
//! stats, then applies the effects the way `handle_side_effects` does: the
//! replicated half on every replica and the local half with proposer-only
//! work gated on the origin store. Both entry points finish the proposal. Every handler consumes the fields it acts on; whatever is
//! left at the end was not handled and halts the replica.
//!
//! The replica lock is taken per step and never held while calling into
//! collaborators.

use std::sync::Arc;

use tracing::{error, info, warn};

use crate::storage::{StateLoader, WriteBatch};

use super::effects::{CommandError, LocalEffects, ProposalResult, ReplicatedEffects, SideEffects};
use super::error::FatalError;
use super::state::Replica;
use super::types::{FrozenStatus, ReplicaChangeType, ReplicaDescriptor};

impl Replica {
    /// Apply the replicated half of a command. Returns whether a nontrivial
    /// effect ran, in which case the caller should assert state.
    pub fn handle_replicated_effects(
        self: &Arc<Self>,
        r: &mut ReplicatedEffects,
    ) -> Result<bool, FatalError> {
        let range_id = self.range_id;
        let store = &self.store;

        r.is_lease_request = false;
        r.is_consistency_related = false;
        r.is_freeze = false;
        r.timestamp = Default::default();

        let _block_reads = if r.block_reads {
            r.block_reads = false;
            Some(
                self.read_only_cmd_mu
                    .write()
                    .unwrap_or_else(|e| e.into_inner()),
            )
        } else {
            None
        };

        let needs_split_by_size = {
            let mut mu = self.mu();
            mu.state.stats.add(&r.delta);
            if r.raft_applied_index != 0 {
                mu.state.raft_applied_index = r.raft_applied_index;
            }
            if r.lease_applied_index != 0 {
                mu.state.lease_applied_index = r.lease_applied_index;
            }
            let max_bytes = store.config().range_max_bytes;
            max_bytes > 0 && mu.state.stats.total_bytes() > max_bytes
        };

        store.metrics().add_mvcc_stats(&r.delta);
        r.delta = Default::default();

        let check_frequency = store.config().raft_log_check_frequency();
        let index = r.raft_applied_index;
        if index != 0 && index % check_frequency == 1 % check_frequency {
            store
                .services()
                .raft_log_queue
                .maybe_add(range_id, store.clock().now());
        }
        if needs_split_by_size {
            store
                .services()
                .split_queue
                .maybe_add(range_id, store.clock().now());
        }

        r.stats = Default::default();
        r.raft_applied_index = 0;
        r.lease_applied_index = 0;

        // Stats and indexes are always present; only what follows warrants an
        // assertion.
        let should_assert = !r.is_empty();

        if let Some(split) = r.split.take() {
            // Stats become exact at a split boundary and the trigger computes
            // the right-hand side against them, so persist them first.
            let stats = {
                let mut mu = self.mu();
                mu.state.stats.contains_estimates = false;
                mu.state.stats
            };
            let mut batch = WriteBatch::new();
            StateLoader::new(range_id)
                .set_stats(&mut batch, &stats)
                .and_then(|()| store.engine().commit(batch))
                .map_err(|error| FatalError::StatsPersist { range_id, error })?;

            store
                .services()
                .topology
                .split_post_apply(&split.rhs_delta, &split.trigger)
                .and_then(|()| self.set_desc(split.trigger.left_desc.clone()))
                .map_err(|error| FatalError::SplitTrigger { range_id, error })?;
        }

        if let Some(merge) = r.merge.take() {
            store
                .services()
                .topology
                .merge_range(&merge.left_desc, merge.right_desc.range_id)
                .map_err(|error| FatalError::MergeTrigger { range_id, error })?;
        }

        let frozen = std::mem::take(&mut r.frozen);
        if frozen != FrozenStatus::Unspecified {
            self.mu().state.frozen = frozen;
        }

        if let Some(desc) = r.desc.take() {
            self.set_desc(desc)
                .map_err(|error| FatalError::Descriptor { range_id, error })?;
        }

        if let Some(change) = r.change_replicas.take() {
            if change.change_type == ReplicaChangeType::RemoveReplica
                && change.replica.store_id == store.store_id()
            {
                // Runs as late as possible so the other replicas are likely
                // done with the removal by the time the queue looks.
                let priority = store.config().replica_gc_priority_removed;
                if let Err(err) = store.services().replica_gc_queue.add(range_id, priority) {
                    error!(range_id, error = ?err, "unable to add to replica GC queue");
                }
            }
        }

        if let Some(new_lease) = r.lease.take() {
            let (replica_id, prev_lease) = {
                let mut mu = self.mu();
                let prev = std::mem::replace(&mut mu.state.lease, new_lease);
                (mu.replica_id, prev)
            };
            self.lease_post_apply(&new_lease, replica_id, &prev_lease)?;
        }

        if let Some(truncated) = r.truncated_state.take() {
            self.mu().state.truncated_state = truncated;
            store.entry_cache().clear_to(range_id, truncated.index + 1);
        }

        let gc_threshold = std::mem::take(&mut r.gc_threshold);
        if !gc_threshold.is_zero() {
            self.mu().state.gc_threshold = gc_threshold;
        }
        let txn_span_gc_threshold = std::mem::take(&mut r.txn_span_gc_threshold);
        if !txn_span_gc_threshold.is_zero() {
            self.mu().state.txn_span_gc_threshold = txn_span_gc_threshold;
        }

        if let Some(cc) = r.compute_checksum.take() {
            self.compute_checksum_post_apply(cc);
        }

        let leftover = r.nonzero_fields();
        if !leftover.is_empty() {
            error!(range_id, fields = ?leftover, "unhandled field in replicated effects");
            return Err(FatalError::UnhandledFields {
                record: "ReplicatedEffects",
                fields: leftover,
            });
        }
        Ok(should_assert)
    }

    /// Apply the local half of a command. `origin` is the replica that
    /// proposed it; proposer-only work runs when it lives on this store.
    ///
    /// Completion fields still attached to `l` are discarded unrun; callers
    /// that own a proposal go through `handle_side_effects`.
    pub fn handle_local_effects(
        self: &Arc<Self>,
        origin: ReplicaDescriptor,
        l: &mut LocalEffects,
    ) -> Result<bool, FatalError> {
        let range_id = self.range_id;
        let store = &self.store;
        let is_proposer = origin.store_id == store.store_id();

        // Handled structurally by the apply loop, not as data.
        l.command_id = Default::default();
        l.proposed_at_ticks = 0;
        l.err = None;
        l.reply = None;
        l.end_cmds = None;
        l.done_tx = None;

        // Resolved even when the command failed.
        if let Some(intents) = l.intents.take() {
            if is_proposer {
                store
                    .services()
                    .intent_resolver
                    .process_intents_async(range_id, intents);
            }
        }

        let should_assert = !l.is_empty();

        if let Some(size) = l.raft_log_size.take() {
            self.mu().raft_log_size = size;
        }

        if std::mem::take(&mut l.gossip_first_range) {
            // Gossip needs the lease, and acquiring it inline could wait on
            // the apply loop this call is running on.
            let replica = Arc::clone(self);
            let launched = store.stopper().run_async_task("gossip_first_range", async move {
                let services = replica.store.services();
                match services.lease_acquirer.lease_for_gossip(replica.range_id).await {
                    Ok(true) => services.gossip.gossip_first_range(&replica.desc()),
                    Ok(false) => {}
                    Err(err) => {
                        info!(range_id = replica.range_id, error = ?err, "unable to gossip first range");
                    }
                }
            });
            if let Err(err) = launched {
                info!(range_id, error = ?err, "unable to gossip first range");
            }
        }

        if std::mem::take(&mut l.maybe_add_to_split_queue) {
            store
                .services()
                .split_queue
                .maybe_add(range_id, store.clock().now());
        }

        if std::mem::take(&mut l.maybe_gossip_system_config) {
            store.services().gossip.maybe_gossip_system_config(range_id);
        }

        let lease_metrics_result = l.lease_metrics_result.take();
        let liveness_span = l.maybe_gossip_node_liveness.take();
        if is_proposer {
            if let Some(success) = lease_metrics_result {
                store.metrics().lease_request_complete(success);
            }
            if let Some(span) = liveness_span {
                store
                    .services()
                    .gossip
                    .maybe_gossip_node_liveness(range_id, &span);
            }
        }

        let leftover = l.nonzero_fields();
        if !leftover.is_empty() {
            error!(range_id, fields = ?leftover, "unhandled field in local effects");
            return Err(FatalError::UnhandledFields {
                record: "LocalEffects",
                fields: leftover,
            });
        }
        Ok(should_assert)
    }

    /// Apply both halves of `effects`, then check durable against in-memory
    /// state if either half did something nontrivial.
    ///
    /// The proposal's admission hook and result channel are detached first
    /// and always finished, whether or not application succeeds.
    pub fn handle_side_effects(
        self: &Arc<Self>,
        origin: ReplicaDescriptor,
        effects: &mut SideEffects,
    ) -> Result<(), FatalError> {
        let (completion, result) = detach_proposal(&mut effects.local);
        let applied = self.apply_or_halt(origin, effects);
        self.finish_proposal(completion, result, &applied);
        applied
    }

    fn apply_or_halt(
        self: &Arc<Self>,
        origin: ReplicaDescriptor,
        effects: &mut SideEffects,
    ) -> Result<(), FatalError> {
        self.check_halted()?;
        let outcome = self.apply_side_effects(origin, effects);
        outcome.map_err(|err| self.halt(err))
    }

    fn apply_side_effects(
        self: &Arc<Self>,
        origin: ReplicaDescriptor,
        effects: &mut SideEffects,
    ) -> Result<(), FatalError> {
        let replicated_assert = self.handle_replicated_effects(&mut effects.replicated)?;
        let local_assert = self.handle_local_effects(origin, &mut effects.local)?;
        if replicated_assert || local_assert {
            self.assert_state()?;
        }
        Ok(())
    }

    fn finish_proposal(
        &self,
        mut completion: LocalEffects,
        mut result: ProposalResult,
        applied: &Result<(), FatalError>,
    ) {
        if let Err(err) = applied {
            warn!(range_id = self.range_id, error = %err, "command application failed");
            result = ProposalResult {
                reply: None,
                err: Some(CommandError::new(err.to_string())),
                should_retry: false,
            };
        }
        completion.finish(result);
    }

    /// Fail if the state persisted for this range differs from memory.
    pub fn assert_state(&self) -> Result<(), FatalError> {
        let range_id = self.range_id;
        let durable = StateLoader::new(range_id)
            .load(self.store.engine().as_ref())
            .map_err(|error| FatalError::StateLoad { range_id, error })?;
        let fields = self.mu().state.diff(&durable);
        if !fields.is_empty() {
            error!(range_id, fields = ?fields, "on-disk and in-memory state diverged");
            return Err(FatalError::StateDivergence { range_id, fields });
        }
        Ok(())
    }

    /// Apply a committed command at raft index `index`.
    ///
    /// `batch` holds the command's writes; the applied indexes and updated
    /// stats are staged into it before the commit. `lease_index` is zero for
    /// commands that do not consume a lease index. The proposal's reply or
    /// error is delivered through its result channel once application ends.
    pub fn apply_raft_command(
        self: &Arc<Self>,
        index: u64,
        lease_index: u64,
        origin: ReplicaDescriptor,
        effects: &mut SideEffects,
        mut batch: WriteBatch,
    ) -> Result<(), FatalError> {
        let (completion, result) = detach_proposal(&mut effects.local);
        let applied = self.apply_committed(index, lease_index, origin, effects, &mut batch);
        self.finish_proposal(completion, result, &applied);
        applied
    }

    fn apply_committed(
        self: &Arc<Self>,
        index: u64,
        lease_index: u64,
        origin: ReplicaDescriptor,
        effects: &mut SideEffects,
        batch: &mut WriteBatch,
    ) -> Result<(), FatalError> {
        self.check_halted()?;
        let range_id = self.range_id;

        let (lease_index, stats) = {
            let mu = self.mu();
            let mut stats = mu.state.stats;
            stats.add(&effects.replicated.delta);
            let lease_index = if lease_index == 0 {
                mu.state.lease_applied_index
            } else {
                lease_index
            };
            (lease_index, stats)
        };

        let loader = StateLoader::new(range_id);
        loader
            .set_applied_index(batch, index, lease_index)
            .and_then(|()| loader.set_stats(batch, &stats))
            .and_then(|()| self.store.engine().commit(std::mem::take(batch)))
            .map_err(|error| self.halt(FatalError::CommandBatch { range_id, index, error }))?;

        effects.replicated.raft_applied_index = index;
        effects.replicated.lease_applied_index = lease_index;
        self.apply_or_halt(origin, effects)
    }
}

/// Take the proposal's completion hooks and outcome out of `local`, leaving
/// only the effects to apply.
fn detach_proposal(local: &mut LocalEffects) -> (LocalEffects, ProposalResult) {
    let completion = LocalEffects {
        end_cmds: local.end_cmds.take(),
        done_tx: local.done_tx.take(),
        ..Default::default()
    };
    let result = ProposalResult {
        reply: local.reply.take(),
        err: local.err.take(),
        should_retry: false,
    };
    (completion, result)
}
