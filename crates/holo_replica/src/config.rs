//! Tunables for command application.
//!
//! `ApplyConfig` is a `clap::Args` group so a node binary can flatten it into
//! its own argument struct; every knob also reads a `HOLO_*` environment
//! variable.

use std::time::Duration;

use clap::{Args, Parser};

pub const DEFAULT_RAFT_LOG_QUEUE_STALE_THRESHOLD: u64 = 100;
pub const DEFAULT_RANGE_MAX_BYTES: i64 = 64 << 20;
pub const DEFAULT_CHECKSUM_GC_INTERVAL_MS: u64 = 60 * 60 * 1000;
pub const DEFAULT_CHECKSUM_AWAIT_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_REPLICA_GC_PRIORITY_REMOVED: f64 = 10.0;

#[derive(Clone, Debug, Args)]
pub struct ApplyConfig {
    /// Raft log entries past the truncation point before truncation is
    /// considered. Also sets how often the log queue is sampled.
    #[arg(
        long,
        env = "HOLO_RAFT_LOG_QUEUE_STALE_THRESHOLD",
        default_value_t = DEFAULT_RAFT_LOG_QUEUE_STALE_THRESHOLD
    )]
    pub raft_log_queue_stale_threshold: u64,

    /// Ranges above this many bytes of user data are offered to the split queue.
    #[arg(long, env = "HOLO_RANGE_MAX_BYTES", default_value_t = DEFAULT_RANGE_MAX_BYTES)]
    pub range_max_bytes: i64,

    /// How long a finished checksum stays around for late collectors (ms).
    #[arg(
        long,
        env = "HOLO_CHECKSUM_GC_INTERVAL_MS",
        default_value_t = DEFAULT_CHECKSUM_GC_INTERVAL_MS
    )]
    pub checksum_gc_interval_ms: u64,

    /// Upper bound on waiting for a checksum computation (ms).
    #[arg(
        long,
        env = "HOLO_CHECKSUM_AWAIT_TIMEOUT_MS",
        default_value_t = DEFAULT_CHECKSUM_AWAIT_TIMEOUT_MS
    )]
    pub checksum_await_timeout_ms: u64,

    /// Replica GC queue priority for a replica removed from its range.
    #[arg(
        long,
        env = "HOLO_REPLICA_GC_PRIORITY_REMOVED",
        default_value_t = DEFAULT_REPLICA_GC_PRIORITY_REMOVED
    )]
    pub replica_gc_priority_removed: f64,

    /// Fsync every applied write batch.
    #[arg(long, env = "HOLO_SYNC_WRITES", default_value_t = false)]
    pub sync_writes: bool,
}

impl Default for ApplyConfig {
    fn default() -> Self {
        Self {
            raft_log_queue_stale_threshold: DEFAULT_RAFT_LOG_QUEUE_STALE_THRESHOLD,
            range_max_bytes: DEFAULT_RANGE_MAX_BYTES,
            checksum_gc_interval_ms: DEFAULT_CHECKSUM_GC_INTERVAL_MS,
            checksum_await_timeout_ms: DEFAULT_CHECKSUM_AWAIT_TIMEOUT_MS,
            replica_gc_priority_removed: DEFAULT_REPLICA_GC_PRIORITY_REMOVED,
            sync_writes: false,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "holo-replica")]
struct ApplyArgs {
    #[command(flatten)]
    config: ApplyConfig,
}

impl ApplyConfig {
    /// Parse from a full argv (program name first). Unset flags fall back to
    /// their environment variables, then to the defaults.
    pub fn from_args<I, T>(args: I) -> anyhow::Result<Self>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        let parsed = ApplyArgs::try_parse_from(args)?;
        Ok(parsed.config)
    }

    /// Every how many applied indexes the raft log queue is consulted.
    pub fn raft_log_check_frequency(&self) -> u64 {
        1 + self.raft_log_queue_stale_threshold / 4
    }

    pub fn checksum_gc_interval(&self) -> Duration {
        Duration::from_millis(self.checksum_gc_interval_ms)
    }

    pub fn checksum_await_timeout(&self) -> Duration {
        Duration::from_millis(self.checksum_await_timeout_ms)
    }
}
