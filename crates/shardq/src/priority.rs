//! Relocation priorities and movement reasons.
//!
//! Priorities are integers in `[1, 999)`. The hundreds digit selects the
//! busyness ledger bucket, so values within one band compete for the same
//! per-server budget. Higher value always means more urgent.

use serde::{Deserialize, Serialize};

pub const PRIORITY_RECOVER_MOVE: i32 = 110;
pub const PRIORITY_REBALANCE_READ_UNDERUTIL: i32 = 120;
pub const PRIORITY_REBALANCE_READ_OVERUTIL: i32 = 121;
pub const PRIORITY_REBALANCE_UNDERUTILIZED: i32 = 122;
pub const PRIORITY_REBALANCE_OVERUTILIZED: i32 = 123;
pub const PRIORITY_PERPETUAL_STORAGE_WIGGLE: i32 = 139;
pub const PRIORITY_TEAM_HEALTHY: i32 = 140;
pub const PRIORITY_TEAM_CONTAINS_UNDESIRED_SERVER: i32 = 150;
pub const PRIORITY_TEAM_REDUNDANT: i32 = 200;
pub const PRIORITY_MERGE_SHARD: i32 = 340;
pub const PRIORITY_SPLIT_SHARD: i32 = 350;
pub const PRIORITY_POPULATE_REGION: i32 = 600;
pub const PRIORITY_TEAM_UNHEALTHY: i32 = 700;
pub const PRIORITY_TEAM_2_LEFT: i32 = 709;
pub const PRIORITY_TEAM_1_LEFT: i32 = 800;
pub const PRIORITY_TEAM_FAILED: i32 = 805;
pub const PRIORITY_TEAM_0_LEFT: i32 = 809;

/// Why a data movement was requested. Carries the semantic cause; the
/// numeric priority is derived from it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MoveReason {
    Invalid,
    RecoverMove,
    RebalanceUnderutilized,
    RebalanceOverutilized,
    RebalanceReadOverutil,
    RebalanceReadUnderutil,
    PerpetualStorageWiggle,
    TeamHealthy,
    TeamContainsUndesiredServer,
    TeamRedundant,
    MergeShard,
    SplitShard,
    PopulateRegion,
    TeamUnhealthy,
    Team2Left,
    Team1Left,
    TeamFailed,
    Team0Left,
}

/// Coarse classification used by destination-team scoring.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelocateReason {
    Invalid,
    Other,
    RebalanceDisk,
    RebalanceRead,
}

pub fn movement_priority(reason: MoveReason) -> i32 {
    match reason {
        MoveReason::Invalid => -1,
        MoveReason::RecoverMove => PRIORITY_RECOVER_MOVE,
        MoveReason::RebalanceUnderutilized => PRIORITY_REBALANCE_UNDERUTILIZED,
        MoveReason::RebalanceOverutilized => PRIORITY_REBALANCE_OVERUTILIZED,
        MoveReason::RebalanceReadOverutil => PRIORITY_REBALANCE_READ_OVERUTIL,
        MoveReason::RebalanceReadUnderutil => PRIORITY_REBALANCE_READ_UNDERUTIL,
        MoveReason::PerpetualStorageWiggle => PRIORITY_PERPETUAL_STORAGE_WIGGLE,
        MoveReason::TeamHealthy => PRIORITY_TEAM_HEALTHY,
        MoveReason::TeamContainsUndesiredServer => PRIORITY_TEAM_CONTAINS_UNDESIRED_SERVER,
        MoveReason::TeamRedundant => PRIORITY_TEAM_REDUNDANT,
        MoveReason::MergeShard => PRIORITY_MERGE_SHARD,
        MoveReason::SplitShard => PRIORITY_SPLIT_SHARD,
        MoveReason::PopulateRegion => PRIORITY_POPULATE_REGION,
        MoveReason::TeamUnhealthy => PRIORITY_TEAM_UNHEALTHY,
        MoveReason::Team2Left => PRIORITY_TEAM_2_LEFT,
        MoveReason::Team1Left => PRIORITY_TEAM_1_LEFT,
        MoveReason::TeamFailed => PRIORITY_TEAM_FAILED,
        MoveReason::Team0Left => PRIORITY_TEAM_0_LEFT,
    }
}

/// Priorities tied to replication health. These contribute to the unhealthy
/// counters and are inherited when relocations merge.
pub fn is_health_priority(priority: i32) -> bool {
    matches!(
        priority,
        PRIORITY_POPULATE_REGION
            | PRIORITY_TEAM_UNHEALTHY
            | PRIORITY_TEAM_2_LEFT
            | PRIORITY_TEAM_1_LEFT
            | PRIORITY_TEAM_0_LEFT
            | PRIORITY_TEAM_REDUNDANT
            | PRIORITY_TEAM_HEALTHY
            | PRIORITY_TEAM_CONTAINS_UNDESIRED_SERVER
            | PRIORITY_PERPETUAL_STORAGE_WIGGLE
    )
}

/// Priorities changing shard boundaries rather than placement health.
pub fn is_boundary_priority(priority: i32) -> bool {
    priority == PRIORITY_SPLIT_SHARD || priority == PRIORITY_MERGE_SHARD
}

pub fn is_valley_filler_priority(priority: i32) -> bool {
    priority == PRIORITY_REBALANCE_UNDERUTILIZED || priority == PRIORITY_REBALANCE_READ_UNDERUTIL
}

pub fn is_disk_rebalance(reason: MoveReason) -> bool {
    matches!(
        reason,
        MoveReason::RebalanceUnderutilized | MoveReason::RebalanceOverutilized
    )
}

pub fn is_read_rebalance(reason: MoveReason) -> bool {
    matches!(
        reason,
        MoveReason::RebalanceReadOverutil | MoveReason::RebalanceReadUnderutil
    )
}

/// Mountain choppers drain the most loaded team; valley fillers top up the
/// least loaded one.
pub fn is_mountain_chopper(reason: MoveReason) -> bool {
    matches!(
        reason,
        MoveReason::RebalanceOverutilized | MoveReason::RebalanceReadOverutil
    )
}

pub fn is_valley_filler(reason: MoveReason) -> bool {
    matches!(
        reason,
        MoveReason::RebalanceUnderutilized | MoveReason::RebalanceReadUnderutil
    )
}
