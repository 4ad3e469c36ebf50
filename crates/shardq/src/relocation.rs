//! Relocation requests and queue entries.
//!
//! A `RelocateShard` is the wire-facing request: move this key range, for
//! this reason. A `RelocateData` is the queue's working record for one
//! range, carrying merged priorities, resolved sources, and launch-time
//! bookkeeping.
//!
//! Ordered sets of `RelocateData` sort by (priority desc, start time asc,
//! random id desc). Set identity deliberately ignores the key range: a
//! truncated entry must still be findable in the per-server queues after its
//! range was split.

use std::cmp::Ordering;
use std::sync::Arc;

use rand::Rng;

use crate::ids::Uid;
use crate::keyspace::KeyRange;
use crate::priority::{
    is_boundary_priority, is_health_priority, is_mountain_chopper, is_valley_filler,
    movement_priority, MoveReason, RelocateReason,
};

/// Durable metadata of a previously started move discovered at startup.
/// Restores run against these fixed destinations and skip merge/cancel by
/// overlap.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DataMoveMeta {
    pub id: Uid,
    pub src: Vec<Uid>,
    pub primary_dest: Vec<Uid>,
    pub remote_dest: Vec<Uid>,
}

/// One relocation request entering the queue.
#[derive(Clone, Debug)]
pub struct RelocateShard {
    pub keys: KeyRange,
    pub priority: i32,
    pub move_reason: MoveReason,
    pub reason: RelocateReason,
    pub data_move_id: Uid,
    pub data_move: Option<Arc<DataMoveMeta>>,
    /// Administrative cancellation of the durable move over `keys`.
    pub cancelled: bool,
}

impl RelocateShard {
    pub fn new(keys: KeyRange, move_reason: MoveReason, reason: RelocateReason) -> Self {
        RelocateShard {
            keys,
            priority: movement_priority(move_reason),
            move_reason,
            reason,
            data_move_id: Uid::nil(),
            data_move: None,
            cancelled: false,
        }
    }

    /// A restore of the durable move described by `meta`.
    pub fn restore(keys: KeyRange, move_reason: MoveReason, meta: Arc<DataMoveMeta>) -> Self {
        let id = meta.id;
        RelocateShard {
            keys,
            priority: movement_priority(move_reason),
            move_reason,
            reason: RelocateReason::Other,
            data_move_id: id,
            data_move: Some(meta),
            cancelled: false,
        }
    }

    pub fn cancellation(keys: KeyRange, data_move_id: Uid) -> Self {
        RelocateShard {
            keys,
            priority: -1,
            move_reason: MoveReason::Invalid,
            reason: RelocateReason::Invalid,
            data_move_id,
            data_move: None,
            cancelled: true,
        }
    }

    pub fn is_restore(&self) -> bool {
        self.data_move.is_some()
    }
}

/// Queue-internal record for one key range being relocated.
#[derive(Clone, Debug)]
pub struct RelocateData {
    pub keys: KeyRange,
    pub priority: i32,
    pub boundary_priority: i32,
    pub health_priority: i32,
    pub reason: RelocateReason,
    /// Enqueue time; preserved across merges so age is not lost.
    pub start_time: f64,
    pub random_id: Uid,
    pub data_move_id: Uid,
    /// Per-source-server work admitted for this relocation; zero while
    /// queued.
    pub work_factor: i32,
    pub src: Vec<Uid>,
    pub complete_sources: Vec<Uid>,
    pub complete_dests: Vec<Uid>,
    pub wants_new_servers: bool,
    /// True until the relocator commits to a destination; a cancellable
    /// in-flight move may be superseded with its busyness refunded.
    pub cancellable: bool,
    pub data_move: Option<Arc<DataMoveMeta>>,
}

impl RelocateData {
    pub fn from_shard<R: Rng + ?Sized>(rs: &RelocateShard, now: f64, rng: &mut R) -> Self {
        let wants_new_servers = is_mountain_chopper(rs.move_reason)
            || is_valley_filler(rs.move_reason)
            || rs.move_reason == MoveReason::SplitShard
            || rs.move_reason == MoveReason::TeamRedundant;
        let src = rs
            .data_move
            .as_ref()
            .map(|m| m.src.clone())
            .unwrap_or_default();
        RelocateData {
            keys: rs.keys.clone(),
            priority: rs.priority,
            boundary_priority: if is_boundary_priority(rs.priority) {
                rs.priority
            } else {
                -1
            },
            health_priority: if is_health_priority(rs.priority) {
                rs.priority
            } else {
                -1
            },
            reason: rs.reason,
            start_time: now,
            random_id: Uid::random(rng),
            data_move_id: rs.data_move_id,
            work_factor: 0,
            src,
            complete_sources: Vec::new(),
            complete_dests: Vec::new(),
            wants_new_servers,
            cancellable: true,
            data_move: rs.data_move.clone(),
        }
    }

    pub fn is_restore(&self) -> bool {
        self.data_move.is_some()
    }

    /// Full semantic equality, unlike the set identity used for ordering.
    pub fn matches(&self, other: &RelocateData) -> bool {
        self.priority == other.priority
            && self.boundary_priority == other.boundary_priority
            && self.health_priority == other.health_priority
            && self.reason == other.reason
            && self.keys == other.keys
            && self.start_time == other.start_time
            && self.work_factor == other.work_factor
            && self.src == other.src
            && self.complete_sources == other.complete_sources
            && self.wants_new_servers == other.wants_new_servers
            && self.random_id == other.random_id
    }
}

impl Default for RelocateData {
    fn default() -> Self {
        RelocateData {
            keys: KeyRange::new(bytes::Bytes::new(), bytes::Bytes::new()),
            priority: -1,
            boundary_priority: -1,
            health_priority: -1,
            reason: RelocateReason::Invalid,
            start_time: -1.0,
            random_id: Uid::nil(),
            data_move_id: Uid::nil(),
            work_factor: 0,
            src: Vec::new(),
            complete_sources: Vec::new(),
            complete_dests: Vec::new(),
            wants_new_servers: false,
            cancellable: false,
            data_move: None,
        }
    }
}

impl PartialEq for RelocateData {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for RelocateData {}

impl Ord for RelocateData {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| self.start_time.total_cmp(&other.start_time))
            .then_with(|| other.random_id.cmp(&self.random_id))
    }
}

impl PartialOrd for RelocateData {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
