//! Tunables for the relocation queue and its rebalancers.
//!
//! Every delay, parallelism cap, and feature gate lives here; the queue
//! never reads global configuration. Defaults match a small production
//! cluster and are safe for tests to override field by field.

use std::time::Duration;

use serde::Deserialize;

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Knobs {
    /// Concurrent relocations a single source server is expected to sustain.
    pub relocation_parallelism_per_source_server: i32,
    /// Concurrent relocations a destination server may absorb. Zero or
    /// negative disables destination admission entirely.
    pub relocation_parallelism_per_dest_server: i32,
    /// Permits for each of the start / finish / cleanup transactional phases.
    pub move_keys_parallelism: usize,
    /// Permits for concurrent shard-to-server lookups.
    pub fetch_source_parallelism: usize,
    /// Queued rebalance moves allowed per rebalance priority before the
    /// background loops stop producing new ones.
    pub rebalance_parallelism: i64,
    /// Random shard samples inspected per disk-rebalance attempt.
    pub rebalance_max_retries: usize,
    /// Shards smaller than this never justify a disk rebalance on their own.
    pub min_shard_bytes: i64,

    /// Shards a source team may ship per metrics sample interval before read
    /// rebalance throttles it.
    pub read_rebalance_src_parallelism: f64,
    /// Minimum relative read-load gap between source and destination teams.
    pub read_rebalance_diff_frac: f64,
    /// Source CPU below this means read load is not worth moving.
    pub read_rebalance_cpu_threshold: f64,
    /// Cap on the top-K read-density shard query.
    pub read_rebalance_shard_topk: usize,
    /// A moved shard may carry at most this fraction of the load gap.
    pub read_rebalance_max_shard_frac: f64,

    pub health_poll_time: Duration,
    pub dest_overloaded_delay: Duration,
    pub best_team_stuck_delay: Duration,
    pub retry_relocate_shard_delay: Duration,
    pub rebalance_polling_interval: Duration,
    pub rebalance_switch_check_interval: Duration,
    /// Read-load samples lag reality by about this much; in-flight read
    /// accounting is released on the same schedule.
    pub storage_metrics_average_interval: Duration,
    pub queue_logging_interval: Duration,
    /// Deferral before resolving sources, letting bursts coalesce. Merges
    /// wait longer so neighbor queries batch.
    pub source_fetch_delay: Duration,
    pub merge_source_fetch_delay: Duration,

    /// Scoring penalty applied to in-flight load when choosing destinations.
    pub inflight_penalty_healthy: f64,
    pub inflight_penalty_unhealthy: f64,
    pub inflight_penalty_one_left: f64,

    /// Legacy needed-servers formula for source admission.
    pub use_old_needed_servers: bool,
    /// Durable per-move metadata: assign real data-move ids and clean up
    /// superseded moves transactionally.
    pub shard_encode_location_metadata: bool,
    /// Emit a decision event per relocation in addition to begin/end.
    pub verbose_tracing: bool,
    /// Consecutive idle rounds the unified rebalancer tolerates before its
    /// reset counter saturates.
    pub rebalance_reset_amount: i64,
    /// Read-bandwidth rebalancing requires read sampling upstream.
    pub read_sampling_enabled: bool,
    /// Route disk rebalance through the unified loop instead of the legacy
    /// mountain-chopper / valley-filler pair.
    pub use_unified_disk_rebalance: bool,
    /// Re-check cross-map invariants after every mutation batch.
    pub expensive_validation: bool,
    /// Fixed seed for reproducible randomized choices.
    pub rng_seed: Option<u64>,
}

impl Default for Knobs {
    fn default() -> Self {
        Knobs {
            relocation_parallelism_per_source_server: 2,
            relocation_parallelism_per_dest_server: 10,
            move_keys_parallelism: 15,
            fetch_source_parallelism: 250,
            rebalance_parallelism: 50,
            rebalance_max_retries: 100,
            min_shard_bytes: 200_000,
            read_rebalance_src_parallelism: 20.0,
            read_rebalance_diff_frac: 0.3,
            read_rebalance_cpu_threshold: 15.0,
            read_rebalance_shard_topk: 4,
            read_rebalance_max_shard_frac: 0.1,
            health_poll_time: Duration::from_secs(1),
            dest_overloaded_delay: Duration::from_millis(200),
            best_team_stuck_delay: Duration::from_millis(25),
            retry_relocate_shard_delay: Duration::from_millis(100),
            rebalance_polling_interval: Duration::from_secs(10),
            rebalance_switch_check_interval: Duration::from_secs(5),
            storage_metrics_average_interval: Duration::from_secs(120),
            queue_logging_interval: Duration::from_secs(5),
            source_fetch_delay: Duration::from_micros(100),
            merge_source_fetch_delay: Duration::from_millis(500),
            inflight_penalty_healthy: 1.0,
            inflight_penalty_unhealthy: 500.0,
            inflight_penalty_one_left: 1000.0,
            use_old_needed_servers: false,
            shard_encode_location_metadata: false,
            verbose_tracing: false,
            rebalance_reset_amount: 30,
            read_sampling_enabled: true,
            use_unified_disk_rebalance: false,
            expensive_validation: false,
            rng_seed: None,
        }
    }
}
