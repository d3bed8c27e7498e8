use tracing::info;

use super::error::FatalError;
use super::state::Replica;
use super::types::{Lease, RaftRole, ReplicaId};

impl Replica {
    /// React to a newly applied lease. `replica_id` is this replica's id and
    /// `prev_lease` the lease it replaced; the replica lock must not be held.
    pub fn lease_post_apply(
        &self,
        new_lease: &Lease,
        replica_id: ReplicaId,
        prev_lease: &Lease,
    ) -> Result<(), FatalError> {
        let i_am_holder = new_lease.replica.replica_id == replica_id;
        let changing_hands = prev_lease.replica.store_id != new_lease.replica.store_id;
        let clock = self.store.clock();

        if changing_hands && i_am_holder {
            info!(
                range_id = self.range_id,
                "new range lease {new_lease} following {prev_lease}"
            );
            // The previous lease may have been cut short by a transfer, so the
            // new lease's start (not the old expiration) bounds earlier reads.
            let desc = {
                let mut mu = self.mu();
                mu.ts_cache.set_low_water(new_lease.start);
                mu.state.desc.clone()
            };
            // A trailing replica applying an old lease must not gossip.
            if desc.is_first_range() && new_lease.covers(clock.now()) {
                self.store.services().gossip.gossip_first_range(&desc);
            }
        }
        if changing_hands && !i_am_holder {
            // Only the holder uses the cache; it is rebuilt on reacquisition.
            self.mu().ts_cache.clear(clock.now());
        }

        if !i_am_holder && new_lease.covers(clock.now()) {
            self.maybe_transfer_raft_leadership(new_lease.replica.replica_id)?;
        }
        Ok(())
    }

    /// Hand raft leadership to `target` if this replica currently leads. The
    /// transfer itself may silently not happen; a failing raft handle means
    /// the replica was destroyed or storage is broken.
    pub fn maybe_transfer_raft_leadership(&self, target: ReplicaId) -> Result<(), FatalError> {
        let range_id = self.range_id;
        let role = self
            .raft
            .role()
            .map_err(|error| FatalError::LeadershipTransfer { range_id, error })?;
        if role == RaftRole::Leader {
            info!(range_id, target, "transferring raft leadership");
            self.raft
                .transfer_leader(target)
                .map_err(|error| FatalError::LeadershipTransfer { range_id, error })?;
        }
        Ok(())
    }
}
