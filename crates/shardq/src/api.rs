//! External capabilities consumed by the queue.
//!
//! The queue decides when and where shards move; these traits are how the
//! decision becomes effect. The transactional layer (`ShardMover`) rewrites
//! shard-to-server assignments and resolves current sources; the metrics
//! provider answers size and read-density questions; the admin state exposes
//! the operator switch that mutes rebalancing.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{oneshot, Semaphore};

use crate::error::Result;
use crate::ids::Uid;
use crate::keyspace::KeyRange;

/// Size and read bandwidth of one shard.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct StorageMetrics {
    pub bytes: i64,
    pub bytes_read_per_ksecond: i64,
}

/// Top-K read-density query over a set of candidate shards.
#[derive(Clone, Debug)]
pub struct TopKReadRequest {
    pub shards: Vec<KeyRange>,
    pub k: usize,
    /// Shards above this read load are excluded (moving them would overshoot).
    pub max_read_load: f64,
    /// Shards below this read load are not worth moving.
    pub min_read_load: f64,
}

#[derive(Clone, Debug, Default)]
pub struct TopKReadReply {
    pub shard_metrics: Vec<(KeyRange, StorageMetrics)>,
    pub min_read_load: f64,
    pub max_read_load: f64,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct StorageServerStats {
    pub cpu_usage: f64,
}

/// Cluster-wide health snapshot keyed by storage server.
#[derive(Clone, Debug, Default)]
pub struct HealthSnapshot {
    pub storage_stats: HashMap<Uid, StorageServerStats>,
}

#[async_trait]
pub trait MetricsProvider: Send + Sync {
    async fn shard_metrics(&self, range: KeyRange) -> Result<StorageMetrics>;
    async fn top_k_read_metrics(&self, req: TopKReadRequest) -> Result<TopKReadReply>;
    async fn average_shard_bytes(&self) -> Result<i64>;
    async fn health_snapshot(&self) -> Result<HealthSnapshot>;
}

/// Source servers currently holding a range.
#[derive(Clone, Debug, Default)]
pub struct SourceServers {
    /// Every server holding any part of the range.
    pub src: Vec<Uid>,
    /// Servers holding the entire range.
    pub complete_sources: Vec<Uid>,
}

/// One transactional shard move.
pub struct MoveKeysRequest {
    pub data_move_id: Uid,
    pub range: KeyRange,
    pub dest_ids: Vec<Uid>,
    pub healthy_ids: Vec<Uid>,
    /// Fired when the destinations report the data readable (first half of
    /// the move); completion of the future itself means the catalog rewrite
    /// finished.
    pub data_movement_complete: Option<oneshot::Sender<()>>,
    pub start_lock: Arc<Semaphore>,
    pub finish_lock: Arc<Semaphore>,
    pub cross_dc: bool,
    /// Pair id correlating this move's trace events.
    pub relocation_id: Uid,
    pub cancel_conflicting: bool,
}

/// The transactional layer rewriting shard-to-server assignments.
#[async_trait]
pub trait ShardMover: Send + Sync {
    async fn move_keys(&self, req: MoveKeysRequest) -> Result<()>;

    /// Tear down the durable artifacts of a data move over `range`.
    async fn clean_up_data_move(
        &self,
        data_move_id: Uid,
        range: KeyRange,
        cleanup_lock: Arc<Semaphore>,
    ) -> Result<()>;

    /// Resolve which servers currently hold `range`.
    async fn sources_for_range(&self, range: KeyRange) -> Result<SourceServers>;
}

/// Operator-visible switches read by the background rebalancers.
#[async_trait]
pub trait AdminState: Send + Sync {
    /// Raw value of the rebalance-ignore key: absent means fully enabled,
    /// empty or `"on"` disables everything, otherwise the first byte is a
    /// bitmask of [`REBALANCE_DISK`] and [`REBALANCE_READ`].
    async fn rebalance_ignore(&self) -> Result<Option<Bytes>>;
}

pub const REBALANCE_DISK: u8 = 1 << 0;
pub const REBALANCE_READ: u8 = 1 << 1;

/// Decode the rebalance-ignore value for one dimension.
pub fn rebalance_disabled(value: &Option<Bytes>, read_rebalance: bool) -> bool {
    match value {
        None => false,
        Some(raw) => {
            if raw.is_empty() || raw.as_ref() == b"on" {
                return true;
            }
            let mask = raw[0];
            if read_rebalance {
                mask & REBALANCE_READ != 0
            } else {
                mask & REBALANCE_DISK != 0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ignore_key_decoding() {
        assert!(!rebalance_disabled(&None, false));
        assert!(rebalance_disabled(&Some(Bytes::new()), false));
        assert!(rebalance_disabled(&Some(Bytes::from_static(b"on")), true));
        let disk_only = Some(Bytes::from_static(&[REBALANCE_DISK]));
        assert!(rebalance_disabled(&disk_only, false));
        assert!(!rebalance_disabled(&disk_only, true));
        let both = Some(Bytes::from_static(&[REBALANCE_DISK | REBALANCE_READ]));
        assert!(rebalance_disabled(&both, false));
        assert!(rebalance_disabled(&both, true));
    }
}
