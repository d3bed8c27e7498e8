//! Error taxonomy for merging and applying side effects.

use thiserror::Error;

use super::types::RangeId;

/// Failure to combine two partial results of the same command.
///
/// `Conflict` and `Preassigned` fail the command being assembled. `Fatal`
/// means the merge met a field it does not know how to combine.
#[derive(Debug, Error)]
pub enum MergeError {
    #[error("must not specify {field}")]
    Preassigned { field: &'static str },
    #[error("conflicting {field}")]
    Conflict { field: &'static str },
    #[error(transparent)]
    Fatal(#[from] FatalError),
}

impl MergeError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, MergeError::Fatal(_))
    }
}

/// Unrecoverable failure: replicas may have diverged or a code path is
/// incomplete. The owning worker must stop processing the range.
#[derive(Debug, Error)]
pub enum FatalError {
    #[error("unhandled field(s) in {record}: {}", fields.join(", "))]
    UnhandledFields {
        record: &'static str,
        fields: Vec<&'static str>,
    },
    #[error("range {range_id}: unable to write MVCC stats: {error:#}")]
    StatsPersist {
        range_id: RangeId,
        error: anyhow::Error,
    },
    #[error("range {range_id}: failed to apply split trigger: {error:#}")]
    SplitTrigger {
        range_id: RangeId,
        error: anyhow::Error,
    },
    #[error("range {range_id}: failed to update store after merging range: {error:#}")]
    MergeTrigger {
        range_id: RangeId,
        error: anyhow::Error,
    },
    #[error("range {range_id}: failed to update range descriptor: {error:#}")]
    Descriptor {
        range_id: RangeId,
        error: anyhow::Error,
    },
    #[error("range {range_id}: replica corrupted during raft leadership transfer: {error:#}")]
    LeadershipTransfer {
        range_id: RangeId,
        error: anyhow::Error,
    },
    #[error("range {range_id}: failed to commit write batch at index {index}: {error:#}")]
    CommandBatch {
        range_id: RangeId,
        index: u64,
        error: anyhow::Error,
    },
    #[error("range {range_id}: unable to load replica state: {error:#}")]
    StateLoad {
        range_id: RangeId,
        error: anyhow::Error,
    },
    #[error("range {range_id}: on-disk and in-memory state diverged in {}", fields.join(", "))]
    StateDivergence {
        range_id: RangeId,
        fields: Vec<&'static str>,
    },
    #[error("range {range_id}: replica halted after fatal error: {reason}")]
    Halted { range_id: RangeId, reason: String },
}
