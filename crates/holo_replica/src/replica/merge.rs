//! Merging partial evaluation results of one command.
//!
//! A command can produce several `SideEffects` (e.g. the request itself plus
//! a triggered side effect). `merge_and_destroy` folds one into another:
//! exclusive triggers may be set on at most one side, accumulable fields are
//! summed, OR-ed, or ratcheted forward.

use std::mem;

use super::effects::SideEffects;
use super::error::{FatalError, MergeError};
use super::types::FrozenStatus;

/// Move `src` into `dst` unless both are set.
fn merge_exclusive<T>(
    field: &'static str,
    dst: &mut Option<T>,
    src: &mut Option<T>,
) -> Result<(), MergeError> {
    match src.take() {
        None => Ok(()),
        Some(_) if dst.is_some() => Err(MergeError::Conflict { field }),
        Some(value) => {
            *dst = Some(value);
            Ok(())
        }
    }
}

/// OR `src` into `dst` and reset `src`.
fn coalesce_bool(dst: &mut bool, src: &mut bool) {
    *dst |= mem::take(src);
}

impl SideEffects {
    /// Absorb `q` into `self`, rejecting combinations that make no sense (two
    /// leases, two log truncations, a split plus a merge, ...).
    ///
    /// On error `self` may be partially updated; the whole command must be
    /// failed, not retried with the same records.
    pub fn merge_and_destroy(&mut self, mut q: SideEffects) -> Result<(), MergeError> {
        let p = &mut self.replicated;
        let r = &mut q.replicated;

        if r.raft_applied_index != 0 {
            return Err(MergeError::Preassigned {
                field: "RaftAppliedIndex",
            });
        }
        if r.lease_applied_index != 0 {
            return Err(MergeError::Preassigned {
                field: "LeaseAppliedIndex",
            });
        }
        if !r.stats.is_zero() {
            return Err(MergeError::Preassigned { field: "Stats" });
        }

        coalesce_bool(&mut p.is_lease_request, &mut r.is_lease_request);
        coalesce_bool(&mut p.is_consistency_related, &mut r.is_consistency_related);
        coalesce_bool(&mut p.is_freeze, &mut r.is_freeze);
        p.timestamp.forward(mem::take(&mut r.timestamp));

        p.delta.add(&mem::take(&mut r.delta));

        merge_exclusive("RangeDescriptor", &mut p.desc, &mut r.desc)?;
        merge_exclusive("Lease", &mut p.lease, &mut r.lease)?;
        merge_exclusive("TruncatedState", &mut p.truncated_state, &mut r.truncated_state)?;

        p.gc_threshold.forward(mem::take(&mut r.gc_threshold));
        p.txn_span_gc_threshold
            .forward(mem::take(&mut r.txn_span_gc_threshold));

        match (p.frozen, mem::take(&mut r.frozen)) {
            (_, FrozenStatus::Unspecified) => {}
            (FrozenStatus::Unspecified, status) => p.frozen = status,
            _ => {
                return Err(MergeError::Conflict {
                    field: "FrozenStatus",
                })
            }
        }

        coalesce_bool(&mut p.block_reads, &mut r.block_reads);

        merge_exclusive("Split", &mut p.split, &mut r.split)?;
        merge_exclusive("Merge", &mut p.merge, &mut r.merge)?;
        merge_exclusive("ChangeReplicas", &mut p.change_replicas, &mut r.change_replicas)?;
        merge_exclusive("ComputeChecksum", &mut p.compute_checksum, &mut r.compute_checksum)?;

        let p = &mut self.local;
        let l = &mut q.local;

        merge_exclusive("RaftLogSize", &mut p.raft_log_size, &mut l.raft_log_size)?;

        if let Some(intents) = l.intents.take() {
            match p.intents.as_mut() {
                Some(existing) => existing.extend(intents),
                None => p.intents = Some(intents),
            }
        }

        merge_exclusive(
            "LeaseMetricsResult",
            &mut p.lease_metrics_result,
            &mut l.lease_metrics_result,
        )?;
        merge_exclusive(
            "MaybeGossipNodeLiveness",
            &mut p.maybe_gossip_node_liveness,
            &mut l.maybe_gossip_node_liveness,
        )?;

        coalesce_bool(&mut p.gossip_first_range, &mut l.gossip_first_range);
        coalesce_bool(
            &mut p.maybe_gossip_system_config,
            &mut l.maybe_gossip_system_config,
        );
        coalesce_bool(
            &mut p.maybe_add_to_split_queue,
            &mut l.maybe_add_to_split_queue,
        );

        let leftover = q.nonzero_fields();
        if !leftover.is_empty() {
            tracing::error!(fields = ?leftover, "unhandled fields while merging side effects");
            return Err(FatalError::UnhandledFields {
                record: "SideEffects",
                fields: leftover,
            }
            .into());
        }
        Ok(())
    }
}
