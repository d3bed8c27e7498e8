//! Consistency checksums.
//!
//! A `ComputeChecksum` command asks every replica to digest its copy of the
//! range at the same applied index. The digest runs as an async task off a
//! storage snapshot; collectors call `await_checksum` and may arrive before
//! or after the computation starts. Entries move `unstarted -> started ->
//! done` and are dropped lazily once their GC deadline passes.

use std::collections::hash_map::Entry;
use std::sync::Arc;

use anyhow::Context;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::storage::{EngineSnapshot, StateLoader, LOCAL_PREFIX};

use super::state::{Replica, ReplicaMu};
use super::types::{ChecksumId, ComputeChecksum, RangeDescriptor};

/// Range contents captured alongside a checksum, for diagnosing mismatches.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SnapshotData {
    pub kvs: Vec<(Vec<u8>, Vec<u8>)>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChecksumResult {
    /// `None` when the computation failed or could not be launched.
    pub digest: Option<Vec<u8>>,
    pub snapshot: Option<SnapshotData>,
}

pub(super) struct ChecksumEntry {
    started: bool,
    done_tx: watch::Sender<bool>,
    digest: Option<Vec<u8>>,
    snapshot: Option<SnapshotData>,
    /// Unset until the computation finishes. Unstarted entries are removed by
    /// the collector that gave up on them instead.
    gc_deadline: Option<Instant>,
}

impl ChecksumEntry {
    fn new() -> Self {
        let (done_tx, _) = watch::channel(false);
        Self {
            started: false,
            done_tx,
            digest: None,
            snapshot: None,
            gc_deadline: None,
        }
    }

    fn is_done(&self) -> bool {
        *self.done_tx.borrow()
    }

    fn result(&self) -> ChecksumResult {
        ChecksumResult {
            digest: self.digest.clone(),
            snapshot: self.snapshot.clone(),
        }
    }
}

fn gc_old_checksum_entries_locked(mu: &mut ReplicaMu, now: Instant) {
    mu.checksums.retain(|id, entry| match entry.gc_deadline {
        Some(deadline) if now > deadline => {
            debug!(checksum_id = %id, "dropping expired checksum entry");
            false
        }
        _ => true,
    });
}

impl Replica {
    /// Start computing the checksum requested by `cc`, at most once per id.
    pub fn compute_checksum_post_apply(self: &Arc<Self>, cc: ComputeChecksum) {
        let id = cc.checksum_id;
        let desc = {
            let mut mu = self.mu();
            gc_old_checksum_entries_locked(&mut mu, Instant::now());
            match mu.checksums.entry(id) {
                Entry::Vacant(slot) => {
                    let mut entry = ChecksumEntry::new();
                    entry.started = true;
                    slot.insert(entry);
                }
                Entry::Occupied(mut slot) => {
                    // Unstarted means a collector got here first; reuse its signal.
                    if slot.get().started {
                        return;
                    }
                    slot.get_mut().started = true;
                }
            }
            mu.state.desc.clone()
        };

        let snap = match self.store.engine().snapshot() {
            Ok(snap) => snap,
            Err(err) => {
                error!(range_id = self.range_id, checksum_id = %id, error = ?err, "checksum snapshot failed");
                self.compute_checksum_done(id, None, None);
                return;
            }
        };

        let replica = Arc::clone(self);
        let launched = self.store.stopper().run_async_task("replica_checksum", async move {
            let range_id = replica.range_id;
            match checksum_range(range_id, &desc, snap.as_ref(), cc.snapshot) {
                Ok((digest, snapshot)) => {
                    replica.compute_checksum_done(id, Some(digest), snapshot);
                }
                Err(err) => {
                    error!(range_id, checksum_id = %id, error = ?err, "checksum computation failed");
                    replica.compute_checksum_done(id, None, None);
                }
            }
        });
        if let Err(err) = launched {
            error!(
                range_id = self.range_id,
                checksum_id = %id,
                error = ?err,
                "could not run async checksum computation"
            );
            self.compute_checksum_done(id, None, None);
        }
    }

    /// Record the outcome of a computation and wake every collector.
    pub fn compute_checksum_done(
        &self,
        id: ChecksumId,
        digest: Option<Vec<u8>>,
        snapshot: Option<SnapshotData>,
    ) {
        let gc_interval = self.store.config().checksum_gc_interval();
        let mut mu = self.mu();
        let Some(entry) = mu.checksums.get_mut(&id) else {
            error!(range_id = self.range_id, checksum_id = %id, "no checksum entry to complete");
            return;
        };
        if let Some(digest) = &digest {
            info!(range_id = self.range_id, checksum_id = %id, digest = %hex::encode(digest), "computed checksum");
        }
        entry.digest = digest;
        entry.snapshot = snapshot;
        entry.gc_deadline = Some(Instant::now() + gc_interval);
        entry.done_tx.send_replace(true);
    }

    /// Wait for checksum `id`, creating an unstarted entry if the compute
    /// command has not applied here yet.
    pub async fn await_checksum(&self, id: ChecksumId) -> anyhow::Result<ChecksumResult> {
        let mut done_rx = {
            let mut mu = self.mu();
            let entry = mu.checksums.entry(id).or_insert_with(ChecksumEntry::new);
            if entry.is_done() {
                return Ok(entry.result());
            }
            entry.done_tx.subscribe()
        };

        let timeout = self.store.config().checksum_await_timeout();
        let waited = tokio::time::timeout(timeout, done_rx.wait_for(|done| *done))
            .await
            .map(|res| res.is_ok());
        if !matches!(waited, Ok(true)) {
            // Nothing will collect an entry no computation ever claimed.
            let mut mu = self.mu();
            if mu.checksums.get(&id).is_some_and(|entry| !entry.started) {
                debug!(range_id = self.range_id, checksum_id = %id, "dropping abandoned checksum entry");
                mu.checksums.remove(&id);
            }
        }
        match waited {
            Err(_) => anyhow::bail!("checksum {id} not computed within {timeout:?}"),
            Ok(false) => anyhow::bail!("checksum {id} was dropped before completing"),
            Ok(true) => {}
        }

        let mu = self.mu();
        mu.checksums
            .get(&id)
            .map(ChecksumEntry::result)
            .with_context(|| format!("checksum {id} was dropped after completing"))
    }

    /// Whether the checksum table still tracks `id`.
    pub fn has_checksum(&self, id: ChecksumId) -> bool {
        self.mu().checksums.contains_key(&id)
    }
}

/// Digest the range's replicated state and user keys in key order. Each key
/// and value is length-prefixed so adjacent pairs cannot alias.
fn checksum_range(
    range_id: u64,
    desc: &RangeDescriptor,
    snap: &dyn EngineSnapshot,
    want_snapshot: bool,
) -> anyhow::Result<(Vec<u8>, Option<SnapshotData>)> {
    let loader = StateLoader::new(range_id);
    let mut kvs = snap
        .scan(&loader.prefix(), &loader.prefix_end())
        .context("scan replica state")?;
    let user = snap
        .scan(&desc.start_key, &desc.end_key)
        .context("scan range data")?;
    kvs.extend(user.into_iter().filter(|(key, _)| !key.starts_with(LOCAL_PREFIX)));

    let mut hasher = blake3::Hasher::new();
    for (key, value) in &kvs {
        hasher.update(&(key.len() as u64).to_be_bytes());
        hasher.update(key);
        hasher.update(&(value.len() as u64).to_be_bytes());
        hasher.update(value);
    }
    let digest = hasher.finalize().as_bytes().to_vec();
    if kvs.is_empty() {
        warn!(range_id, "checksum over an empty range");
    }
    let snapshot = want_snapshot.then_some(SnapshotData { kvs });
    Ok((digest, snapshot))
}
