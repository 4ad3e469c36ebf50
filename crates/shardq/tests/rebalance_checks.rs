//! Rebalancer decision logic: source throttling by sample lag, read and
//! disk move emission, similarity rejection, and the operator ignore
//! switch.

mod common;

use std::time::Duration;

use bytes::Bytes;
use common::{quiet_knobs, range, uid, RecordingMover, StaticTeams, TestCluster, TestTeam};
use shardq::rebalance::{load_rebalance_loop, rebalance_read_load, rebalance_teams};
use shardq::{KeyRange, MoveReason, RelocateReason, StorageMetrics, TeamRef};

fn shard_ladder(count: usize) -> Vec<KeyRange> {
    // "a".."b", "b".."c", ... distinct single-letter ranges.
    (0..count)
        .map(|i| {
            let a = (b'a' + i as u8) as char;
            let b = (b'a' + i as u8 + 1) as char;
            range(&a.to_string(), &b.to_string())
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn read_rebalance_throttles_recent_sources() {
    let source = TestTeam::new(&[1, 2, 3]);
    let dest = TestTeam::new(&[4, 5, 6]);
    source.set_read_load(10_000);
    let mover = RecordingMover::new(&[1, 2, 3]);
    let mut knobs = quiet_knobs();
    knobs.read_rebalance_src_parallelism = 4.0;
    knobs.storage_metrics_average_interval = Duration::from_secs(10);
    let cluster = TestCluster::build(
        knobs,
        3,
        3,
        vec![StaticTeams::new(source.clone(), true)],
        mover,
    );
    cluster.tracker.set_shards(&[1, 2, 3], shard_ladder(20));
    for server in [1, 2, 3] {
        cluster.metrics.cpu.lock().insert(uid(server), 50.0);
    }
    cluster
        .metrics
        .top_k
        .lock()
        .push((range("a", "b"), StorageMetrics {
            bytes: 100,
            bytes_read_per_ksecond: 5_000,
        }));

    // One second after shipping a shard the samples have not caught up
    // (1 * 4 < 10), so the team sits out.
    cluster.queue.update_last_as_source(&[uid(1)]);
    tokio::time::sleep(Duration::from_secs(1)).await;
    let source_ref: TeamRef = source.clone();
    let dest_ref: TeamRef = dest.clone();
    let moved = rebalance_read_load(
        &cluster.queue,
        MoveReason::RebalanceReadOverutil,
        &source_ref,
        &dest_ref,
        true,
    )
    .await
    .unwrap();
    assert!(!moved);
    assert!(cluster.output.lock().try_recv().is_err());

    // Past the sample window the same request goes through.
    tokio::time::sleep(Duration::from_secs(10)).await;
    let moved = rebalance_read_load(
        &cluster.queue,
        MoveReason::RebalanceReadOverutil,
        &source_ref,
        &dest_ref,
        true,
    )
    .await
    .unwrap();
    assert!(moved);
    let emitted = cluster.output.lock().try_recv().unwrap();
    assert_eq!(emitted.reason, RelocateReason::RebalanceRead);
    assert_eq!(emitted.keys, range("a", "b"));
}

#[tokio::test(start_paused = true)]
async fn read_rebalance_needs_a_spare_shard_and_busy_cpu() {
    let source = TestTeam::new(&[1, 2, 3]);
    let dest = TestTeam::new(&[4, 5, 6]);
    source.set_read_load(10_000);
    let mover = RecordingMover::new(&[1, 2, 3]);
    let cluster = TestCluster::build(
        quiet_knobs(),
        3,
        3,
        vec![StaticTeams::new(source.clone(), true)],
        mover,
    );
    let source_ref: TeamRef = source.clone();
    let dest_ref: TeamRef = dest.clone();

    // A single hot shard cannot be fixed by moving it.
    cluster.tracker.set_shards(&[1, 2, 3], shard_ladder(1));
    let moved = rebalance_read_load(
        &cluster.queue,
        MoveReason::RebalanceReadOverutil,
        &source_ref,
        &dest_ref,
        true,
    )
    .await
    .unwrap();
    assert!(!moved);

    // Plenty of shards, but the source is not actually CPU-bound.
    cluster.tracker.set_shards(&[1, 2, 3], shard_ladder(20));
    for server in [1, 2, 3] {
        cluster.metrics.cpu.lock().insert(uid(server), 2.0);
    }
    let moved = rebalance_read_load(
        &cluster.queue,
        MoveReason::RebalanceReadOverutil,
        &source_ref,
        &dest_ref,
        true,
    )
    .await
    .unwrap();
    assert!(!moved);
    assert!(cluster.output.lock().try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn disk_rebalance_moves_a_large_shard_from_hot_to_cold() {
    let source = TestTeam::new(&[1, 2, 3]);
    let dest = TestTeam::new(&[4, 5, 6]);
    source.set_load_bytes(10_000_000_000);
    let mover = RecordingMover::new(&[1, 2, 3]);
    let cluster = TestCluster::build(
        quiet_knobs(),
        3,
        3,
        vec![StaticTeams::new(source.clone(), true)],
        mover,
    );
    cluster.tracker.set_shards(&[1, 2, 3], shard_ladder(4));

    let source_ref: TeamRef = source.clone();
    let dest_ref: TeamRef = dest.clone();
    let moved = rebalance_teams(
        &cluster.queue,
        MoveReason::RebalanceOverutilized,
        &source_ref,
        &dest_ref,
        true,
    )
    .await
    .unwrap();
    assert!(moved);
    let emitted = cluster.output.lock().try_recv().unwrap();
    assert_eq!(emitted.reason, RelocateReason::RebalanceDisk);
}

#[tokio::test(start_paused = true)]
async fn disk_rebalance_rejects_similar_teams() {
    let source = TestTeam::new(&[1, 2, 3]);
    let dest = TestTeam::new(&[4, 5, 6]);
    // The gap is under three shards' worth of bytes.
    source.set_load_bytes(10_000_000);
    dest.set_load_bytes(9_500_000);
    let mover = RecordingMover::new(&[1, 2, 3]);
    let cluster = TestCluster::build(
        quiet_knobs(),
        3,
        3,
        vec![StaticTeams::new(source.clone(), true)],
        mover,
    );
    cluster.tracker.set_shards(&[1, 2, 3], shard_ladder(4));

    let source_ref: TeamRef = source.clone();
    let dest_ref: TeamRef = dest.clone();
    let moved = rebalance_teams(
        &cluster.queue,
        MoveReason::RebalanceOverutilized,
        &source_ref,
        &dest_ref,
        true,
    )
    .await
    .unwrap();
    assert!(!moved);
    assert!(cluster.output.lock().try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn rebalance_loops_honor_the_ignore_switch() {
    let team = TestTeam::new(&[1, 2, 3]);
    let collection = StaticTeams::new(team, true);
    let mover = RecordingMover::new(&[1, 2, 3]);
    let mut knobs = quiet_knobs();
    knobs.rebalance_parallelism = 4;
    let cluster = TestCluster::build(knobs, 3, 3, vec![collection.clone()], mover);

    *cluster.admin.value.lock() = Some(Bytes::from_static(b"on"));
    let handle = tokio::spawn(load_rebalance_loop(
        cluster.queue.clone(),
        0,
        MoveReason::RebalanceReadOverutil,
    ));

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(collection.requests.lock().len(), 0, "disabled loop queried teams");

    *cluster.admin.value.lock() = None;
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert!(!collection.requests.lock().is_empty(), "enabled loop never queried teams");
    handle.abort();
}
