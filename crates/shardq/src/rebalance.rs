//! Background rebalancers.
//!
//! Four directions run per region: mountain chopper and valley filler over
//! disk bytes, and the same pair over read bandwidth. Each loop polls the
//! operator switch, sleeps its interval, and emits at most one relocation
//! request per tick, only while the queue holds fewer rebalance moves at
//! that priority than the configured parallelism.
//!
//! The disk pair ships in two flavors: the legacy dedicated loops (default)
//! and the unified loop shared with the read dimension, selected by knob.

use std::sync::Arc;

use tokio::task::JoinSet;

use crate::api::{rebalance_disabled, StorageMetrics, TopKReadRequest};
use crate::error::Result;
use crate::ids::Uid;
use crate::keyspace::KeyRange;
use crate::priority::{
    is_mountain_chopper, is_read_rebalance, movement_priority, MoveReason, RelocateReason,
    PRIORITY_REBALANCE_OVERUTILIZED, PRIORITY_REBALANCE_UNDERUTILIZED,
};
use crate::queue::RelocationQueue;
use crate::relocation::RelocateShard;
use crate::team::{GetTeamRequest, StorageTeam, TeamDesc, TeamRef};

pub(crate) fn spawn_rebalancers(queue: &Arc<RelocationQueue>, set: &mut JoinSet<Result<()>>) {
    for index in 0..queue.team_collections.len() {
        if queue.knobs.use_unified_disk_rebalance {
            set.spawn(load_rebalance_loop(
                queue.clone(),
                index,
                MoveReason::RebalanceOverutilized,
            ));
            set.spawn(load_rebalance_loop(
                queue.clone(),
                index,
                MoveReason::RebalanceUnderutilized,
            ));
        } else {
            set.spawn(mountain_chopper_loop(queue.clone(), index));
            set.spawn(valley_filler_loop(queue.clone(), index));
        }
        if queue.knobs.read_sampling_enabled {
            set.spawn(load_rebalance_loop(
                queue.clone(),
                index,
                MoveReason::RebalanceReadOverutil,
            ));
            set.spawn(load_rebalance_loop(
                queue.clone(),
                index,
                MoveReason::RebalanceReadUnderutil,
            ));
        }
    }
}

fn worst_cpu(health: &crate::api::HealthSnapshot, ids: &[Uid]) -> f64 {
    let mut cpu: f64 = 0.0;
    for id in ids {
        match health.storage_stats.get(id) {
            Some(stats) => cpu = cpu.max(stats.cpu_usage),
            None => {
                // No stats usually means the server is too busy to report.
                return 100.0;
            }
        }
    }
    cpu
}

/// Destination first: without somewhere to put the shard there is no point
/// loading the source-team query.
async fn src_dest_teams(
    queue: &Arc<RelocationQueue>,
    team_collection_index: usize,
    src_req: GetTeamRequest,
    dest_req: GetTeamRequest,
) -> Result<Option<(TeamRef, TeamRef)>> {
    let dest = queue.team_collections[team_collection_index]
        .get_team(dest_req)
        .await?;
    let Some(dest_team) = dest.team else {
        return Ok(None);
    };
    let src = queue.team_collections[team_collection_index]
        .get_team(src_req)
        .await?;
    let Some(src_team) = src.team else {
        return Ok(None);
    };
    Ok(Some((src_team, dest_team)))
}

/// Move one random oversized shard off `source_team` if it carries much more
/// data than `dest_team`.
pub async fn rebalance_teams(
    queue: &Arc<RelocationQueue>,
    reason: MoveReason,
    source_team: &TeamRef,
    dest_team: &TeamRef,
    primary: bool,
) -> Result<bool> {
    let average_shard_bytes = queue.metrics.average_shard_bytes().await?;
    let source_desc = TeamDesc {
        servers: source_team.server_ids(),
        primary,
    };
    let shards = queue.shard_tracker.shards_for(&source_desc);
    if shards.is_empty() {
        tracing::debug!(reason = ?reason, "rebalance skipped, no shard on source team");
        return Ok(false);
    }

    // Sample shards until one beats the cluster average, keeping the biggest
    // seen.
    let mut chosen: Option<KeyRange> = None;
    let mut metrics = StorageMetrics::default();
    let mut retries = 0;
    while retries < queue.knobs.rebalance_max_retries {
        let test_shard = match queue.random_choice(&shards) {
            Some(shard) => shard,
            None => break,
        };
        let test_metrics = queue.metrics.shard_metrics(test_shard.clone()).await?;
        if test_metrics.bytes > metrics.bytes {
            chosen = Some(test_shard);
            metrics = test_metrics;
            if metrics.bytes > average_shard_bytes {
                break;
            }
        }
        retries += 1;
    }
    let Some(shard) = chosen else {
        tracing::debug!(reason = ?reason, "rebalance skipped, only empty shards on source");
        return Ok(false);
    };

    let source_bytes = source_team.load_bytes(false, 1.0);
    let dest_bytes = dest_team.load_bytes(true, 1.0);
    let too_similar =
        source_bytes - dest_bytes <= 3 * queue.knobs.min_shard_bytes.max(metrics.bytes);
    tracing::debug!(
        reason = ?reason,
        source_bytes,
        dest_bytes,
        shard_bytes = metrics.bytes,
        too_similar,
        "disk rebalance candidate"
    );
    if too_similar || metrics.bytes == 0 {
        return Ok(false);
    }

    // The shard must still live on the source team after the metric waits.
    let shards = queue.shard_tracker.shards_for(&source_desc);
    if shards.iter().any(|s| *s == shard) {
        let request = RelocateShard::new(shard, reason, RelocateReason::RebalanceDisk);
        return Ok(queue.output.send(request).is_ok());
    }
    tracing::debug!(reason = ?reason, "rebalance skipped, shard left the source team");
    Ok(false)
}

/// Move one of the top-K read-hottest shards off `source_team` if its read
/// load is well above `dest_team`'s and the sampled metrics are trustworthy.
pub async fn rebalance_read_load(
    queue: &Arc<RelocationQueue>,
    reason: MoveReason,
    source_team: &TeamRef,
    dest_team: &TeamRef,
    primary: bool,
) -> Result<bool> {
    let source_desc = TeamDesc {
        servers: source_team.server_ids(),
        primary,
    };
    let shards = queue.shard_tracker.shards_for(&source_desc);
    // Moving the only shard elsewhere just moves the hot spot.
    if shards.len() <= 1 {
        tracing::debug!(reason = ?reason, "read rebalance skipped, no spare shard on source");
        return Ok(false);
    }

    // Sampled read metrics lag; a team that just shipped a shard must sit
    // out until the samples catch up.
    if queue.time_throttle(&source_desc.servers) {
        tracing::debug!(reason = ?reason, "read rebalance skipped, source team throttled");
        return Ok(false);
    }

    let src_load = source_team.read_load(false, 1.0);
    let dest_load = dest_team.read_load(true, 1.0);
    if (1.0 - queue.knobs.read_rebalance_diff_frac) * src_load <= dest_load {
        tracing::debug!(reason = ?reason, src_load, dest_load, "read rebalance skipped, teams too similar");
        return Ok(false);
    }

    let k = ((shards.len() as f64 * 0.1) as usize).min(queue.knobs.read_rebalance_shard_topk);
    let request = TopKReadRequest {
        shards: shards.clone(),
        k,
        max_read_load: (src_load - dest_load) * queue.knobs.read_rebalance_max_shard_frac,
        min_read_load: src_load / shards.len() as f64,
    };
    let (health, reply) = futures_util::join!(
        queue.metrics.health_snapshot(),
        queue.metrics.top_k_read_metrics(request)
    );
    let reply = reply?;
    let health = health?;

    let cpu = worst_cpu(&health, &source_desc.servers);
    if cpu < queue.knobs.read_rebalance_cpu_threshold {
        tracing::debug!(reason = ?reason, worst_cpu = cpu, "read rebalance skipped, source cpu low");
        return Ok(false);
    }

    let mut candidates = reply.shard_metrics;
    if candidates.is_empty() {
        tracing::debug!(reason = ?reason, "read rebalance skipped, no eligible shard");
        return Ok(false);
    }
    // Randomize so the same hot shard is not requeued every tick.
    queue.shuffle(&mut candidates);
    let (shard, shard_metrics) = candidates[0].clone();
    tracing::debug!(
        reason = ?reason,
        shard_read_load = shard_metrics.bytes_read_per_ksecond,
        min_read_load = reply.min_read_load,
        max_read_load = reply.max_read_load,
        "read rebalance candidate"
    );

    let shards = queue.shard_tracker.shards_for(&source_desc);
    if shards.iter().any(|s| *s == shard) {
        let request = RelocateShard::new(shard, reason, RelocateReason::RebalanceRead);
        if queue.output.send(request).is_ok() {
            queue.update_last_as_source(&source_desc.servers);
            return Ok(true);
        }
        return Ok(false);
    }
    tracing::debug!(reason = ?reason, "read rebalance skipped, shard left the source team");
    Ok(false)
}

/// Unified rebalance loop covering both load dimensions and both
/// directions, parameterized by the movement reason.
pub async fn load_rebalance_loop(
    queue: Arc<RelocationQueue>,
    team_collection_index: usize,
    reason: MoveReason,
) -> Result<()> {
    let read_rebalance = is_read_rebalance(reason);
    let mc_move = is_mountain_chopper(reason);
    let priority = movement_priority(reason);
    let mut last_switch_check = f64::NEG_INFINITY;
    let mut skip_current_loop = false;
    let mut reset_count: i64 = 0;

    loop {
        let delay = tokio::time::sleep(queue.knobs.rebalance_polling_interval);
        tokio::pin!(delay);

        if queue.clock.now() - last_switch_check
            > queue.knobs.rebalance_switch_check_interval.as_secs_f64()
        {
            match queue.admin.rebalance_ignore().await {
                Ok(value) => {
                    last_switch_check = queue.clock.now();
                    skip_current_loop = rebalance_disabled(&value, read_rebalance);
                }
                Err(err) => {
                    tracing::warn!(reason = ?reason, error = %err, "rebalance switch read failed");
                }
            }
        }

        delay.await;
        if skip_current_loop {
            continue;
        }

        if queue.queued_at_priority(priority) >= queue.knobs.rebalance_parallelism {
            continue;
        }

        let src_req = GetTeamRequest {
            want_new_servers: true,
            want_true_best: mc_move,
            prefer_lower_disk_util: false,
            team_must_have_shards: true,
            for_read_balance: read_rebalance,
            prefer_lower_read_util: false,
            ..GetTeamRequest::default()
        };
        let dest_req = GetTeamRequest {
            want_new_servers: true,
            want_true_best: !mc_move,
            prefer_lower_disk_util: true,
            team_must_have_shards: false,
            for_read_balance: read_rebalance,
            prefer_lower_read_util: true,
            ..GetTeamRequest::default()
        };

        let moved = match src_dest_teams(&queue, team_collection_index, src_req, dest_req).await {
            Ok(Some((source_team, dest_team))) => {
                let result = if read_rebalance {
                    rebalance_read_load(
                        &queue,
                        reason,
                        &source_team,
                        &dest_team,
                        team_collection_index == 0,
                    )
                    .await
                } else {
                    rebalance_teams(
                        &queue,
                        reason,
                        &source_team,
                        &dest_team,
                        team_collection_index == 0,
                    )
                    .await
                };
                match result {
                    Ok(moved) => moved,
                    Err(err) => {
                        tracing::warn!(reason = ?reason, error = %err, "rebalance attempt failed");
                        false
                    }
                }
            }
            Ok(None) => false,
            Err(err) => {
                tracing::warn!(reason = ?reason, error = %err, "rebalance team selection failed");
                false
            }
        };

        if moved {
            reset_count = 0;
        } else {
            reset_count = (reset_count + 1).min(queue.knobs.rebalance_reset_amount);
        }
        tracing::debug!(reason = ?reason, moved, reset_count, "rebalance tick");
    }
}

/// Legacy disk mountain chopper: drain the most loaded team into a randomly
/// sampled lightly loaded one.
pub async fn mountain_chopper_loop(
    queue: Arc<RelocationQueue>,
    team_collection_index: usize,
) -> Result<()> {
    let mut polling_interval = queue.knobs.rebalance_polling_interval;
    let mut last_switch_check = f64::NEG_INFINITY;
    let mut skip_current_loop = false;

    loop {
        let delay = tokio::time::sleep(polling_interval);
        tokio::pin!(delay);

        if queue.clock.now() - last_switch_check
            > queue.knobs.rebalance_switch_check_interval.as_secs_f64()
        {
            match queue.admin.rebalance_ignore().await {
                Ok(value) => {
                    last_switch_check = queue.clock.now();
                    let disabled = rebalance_disabled(&value, false);
                    if !disabled && skip_current_loop {
                        polling_interval = queue.knobs.rebalance_polling_interval;
                    }
                    skip_current_loop = disabled;
                }
                Err(err) => {
                    tracing::warn!(error = %err, "rebalance switch read failed");
                }
            }
        }

        delay.await;
        if skip_current_loop {
            // Avoid a busy loop while disabled.
            polling_interval = polling_interval.max(queue.knobs.rebalance_switch_check_interval);
            continue;
        }

        if queue.queued_at_priority(PRIORITY_REBALANCE_OVERUTILIZED)
            >= queue.knobs.rebalance_parallelism
        {
            continue;
        }

        let tick = async {
            let dest = queue.team_collections[team_collection_index]
                .get_team(GetTeamRequest {
                    want_new_servers: true,
                    want_true_best: false,
                    prefer_lower_disk_util: true,
                    team_must_have_shards: false,
                    ..GetTeamRequest::default()
                })
                .await?;
            let Some(dest_team) = dest.team else {
                return Ok(false);
            };
            let src = queue.team_collections[team_collection_index]
                .get_team(GetTeamRequest {
                    want_new_servers: true,
                    want_true_best: true,
                    prefer_lower_disk_util: false,
                    team_must_have_shards: true,
                    ..GetTeamRequest::default()
                })
                .await?;
            let Some(src_team) = src.team else {
                return Ok(false);
            };
            rebalance_teams(
                &queue,
                MoveReason::RebalanceOverutilized,
                &src_team,
                &dest_team,
                team_collection_index == 0,
            )
            .await
        };
        match tick.await {
            Ok(moved) => tracing::debug!(moved, "mountain chopper tick"),
            Err(err) => tracing::warn!(error = %err, "mountain chopper tick failed"),
        }
    }
}

/// Legacy disk valley filler: top up the globally least loaded team from a
/// randomly sampled team that has shards to give.
pub async fn valley_filler_loop(
    queue: Arc<RelocationQueue>,
    team_collection_index: usize,
) -> Result<()> {
    let mut polling_interval = queue.knobs.rebalance_polling_interval;
    let mut last_switch_check = f64::NEG_INFINITY;
    let mut skip_current_loop = false;

    loop {
        let delay = tokio::time::sleep(polling_interval);
        tokio::pin!(delay);

        if queue.clock.now() - last_switch_check
            > queue.knobs.rebalance_switch_check_interval.as_secs_f64()
        {
            match queue.admin.rebalance_ignore().await {
                Ok(value) => {
                    last_switch_check = queue.clock.now();
                    let disabled = rebalance_disabled(&value, false);
                    if !disabled && skip_current_loop {
                        polling_interval = queue.knobs.rebalance_polling_interval;
                    }
                    skip_current_loop = disabled;
                }
                Err(err) => {
                    tracing::warn!(error = %err, "rebalance switch read failed");
                }
            }
        }

        delay.await;
        if skip_current_loop {
            polling_interval = polling_interval.max(queue.knobs.rebalance_switch_check_interval);
            continue;
        }

        if queue.queued_at_priority(PRIORITY_REBALANCE_UNDERUTILIZED)
            >= queue.knobs.rebalance_parallelism
        {
            continue;
        }

        let tick = async {
            let src = queue.team_collections[team_collection_index]
                .get_team(GetTeamRequest {
                    want_new_servers: true,
                    want_true_best: false,
                    prefer_lower_disk_util: false,
                    team_must_have_shards: true,
                    ..GetTeamRequest::default()
                })
                .await?;
            let Some(src_team) = src.team else {
                return Ok(false);
            };
            let dest = queue.team_collections[team_collection_index]
                .get_team(GetTeamRequest {
                    want_new_servers: true,
                    want_true_best: true,
                    prefer_lower_disk_util: true,
                    team_must_have_shards: false,
                    ..GetTeamRequest::default()
                })
                .await?;
            let Some(dest_team) = dest.team else {
                return Ok(false);
            };
            rebalance_teams(
                &queue,
                MoveReason::RebalanceUnderutilized,
                &src_team,
                &dest_team,
                team_collection_index == 0,
            )
            .await
        };
        match tick.await {
            Ok(moved) => tracing::debug!(moved, "valley filler tick"),
            Err(err) => tracing::warn!(error = %err, "valley filler tick failed"),
        }
    }
}
