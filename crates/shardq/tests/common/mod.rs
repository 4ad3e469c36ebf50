//! Shared mock cluster for relocation queue tests.
//!
//! Every external capability the queue consumes has a controllable stand-in
//! here: teams with settable load and health, a mover that records calls and
//! can hold moves or source lookups open, static metrics, and an in-memory
//! shard tracker.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify, Semaphore};

use shardq::{
    AdminState, GetTeamRequest, HealthSnapshot, Key, KeyRange, Knobs, MetricsProvider,
    MoveKeysRequest, QueueConfig, RelocateShard, RelocationQueue, Result, ShardMover, ShardTracker,
    SourceServers, StorageMetrics, StorageTeam, TeamCollection, TeamDesc, TeamRef, TeamReply,
    TopKReadReply, TopKReadRequest, Uid,
};

pub fn key(s: &str) -> Key {
    Bytes::copy_from_slice(s.as_bytes())
}

pub fn range(a: &str, b: &str) -> KeyRange {
    KeyRange::new(key(a), key(b))
}

pub fn uid(n: u64) -> Uid {
    Uid::from_parts(n, 0)
}

/// Poll `cond` while paused time auto-advances; panic if it never holds.
pub async fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    for _ in 0..20_000 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for: {what}");
}

// ---- teams ----------------------------------------------------------------

pub struct TestTeam {
    ids: Vec<Uid>,
    healthy: AtomicBool,
    load_bytes: AtomicI64,
    read_load: AtomicI64,
    data_in_flight: AtomicI64,
    read_in_flight: AtomicI64,
}

impl TestTeam {
    pub fn new(ids: &[u64]) -> Arc<Self> {
        Arc::new(TestTeam {
            ids: ids.iter().map(|n| uid(*n)).collect(),
            healthy: AtomicBool::new(true),
            load_bytes: AtomicI64::new(0),
            read_load: AtomicI64::new(0),
            data_in_flight: AtomicI64::new(0),
            read_in_flight: AtomicI64::new(0),
        })
    }

    pub fn set_load_bytes(&self, bytes: i64) {
        self.load_bytes.store(bytes, Ordering::Relaxed);
    }

    pub fn set_read_load(&self, load: i64) {
        self.read_load.store(load, Ordering::Relaxed);
    }
}

#[async_trait]
impl StorageTeam for TestTeam {
    fn server_ids(&self) -> Vec<Uid> {
        self.ids.clone()
    }

    fn size(&self) -> usize {
        self.ids.len()
    }

    fn desc(&self) -> String {
        format!("test-team[{}]", self.ids.len())
    }

    fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    fn is_optimal(&self) -> bool {
        true
    }

    fn is_wrong_configuration(&self) -> bool {
        false
    }

    fn has_healthy_available_space(&self, _min_ratio: f64) -> bool {
        true
    }

    fn load_bytes(&self, include_in_flight: bool, _penalty: f64) -> i64 {
        let base = self.load_bytes.load(Ordering::Relaxed);
        if include_in_flight {
            base + self.data_in_flight.load(Ordering::Relaxed)
        } else {
            base
        }
    }

    fn read_load(&self, include_in_flight: bool, _penalty: f64) -> f64 {
        let base = self.read_load.load(Ordering::Relaxed);
        let total = if include_in_flight {
            base + self.read_in_flight.load(Ordering::Relaxed)
        } else {
            base
        };
        total as f64
    }

    fn data_in_flight(&self) -> i64 {
        self.data_in_flight.load(Ordering::Relaxed)
    }

    fn read_in_flight(&self) -> i64 {
        self.read_in_flight.load(Ordering::Relaxed)
    }

    fn min_available_space(&self, _include_in_flight: bool) -> i64 {
        i64::MAX
    }

    fn min_available_space_ratio(&self, _include_in_flight: bool) -> f64 {
        0.9
    }

    fn priority(&self) -> i32 {
        0
    }

    fn add_data_in_flight(&self, delta: i64) {
        self.data_in_flight.fetch_add(delta, Ordering::Relaxed);
    }

    fn add_read_in_flight(&self, delta: i64) {
        self.read_in_flight.fetch_add(delta, Ordering::Relaxed);
    }

    fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::Relaxed);
    }

    fn set_wrong_configuration(&self, _wrong: bool) {}

    fn set_priority(&self, _priority: i32) {}

    fn add_servers(&self, _servers: &[Uid]) {}

    async fn update_storage_metrics(&self) -> Result<()> {
        Ok(())
    }
}

/// Collection that always answers with the same team.
pub struct StaticTeams {
    pub team: Arc<TestTeam>,
    pub has_source_member: bool,
    pub requests: Mutex<Vec<GetTeamRequest>>,
}

impl StaticTeams {
    pub fn new(team: Arc<TestTeam>, has_source_member: bool) -> Arc<Self> {
        Arc::new(StaticTeams {
            team,
            has_source_member,
            requests: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl TeamCollection for StaticTeams {
    async fn get_team(&self, req: GetTeamRequest) -> Result<TeamReply> {
        self.requests.lock().push(req);
        let team: TeamRef = self.team.clone();
        Ok(TeamReply {
            team: Some(team),
            has_source_member: self.has_source_member,
        })
    }
}

// ---- mover ----------------------------------------------------------------

#[derive(Clone, Debug)]
pub struct MoveRecord {
    pub data_move_id: Uid,
    pub range: KeyRange,
    pub dest_ids: Vec<Uid>,
    pub healthy_ids: Vec<Uid>,
}

pub struct RecordingMover {
    pub move_calls: Mutex<Vec<MoveRecord>>,
    pub cleanup_calls: Mutex<Vec<(Uid, KeyRange)>>,
    pub sources: Mutex<SourceServers>,
    pub hold_moves: AtomicBool,
    pub hang_sources: AtomicBool,
    pub fire_data_movement_complete: AtomicBool,
    pub fail_next_move_with: Mutex<Option<shardq::Error>>,
    release: Notify,
}

impl RecordingMover {
    pub fn new(src: &[u64]) -> Arc<Self> {
        let ids: Vec<Uid> = src.iter().map(|n| uid(*n)).collect();
        Arc::new(RecordingMover {
            move_calls: Mutex::new(Vec::new()),
            cleanup_calls: Mutex::new(Vec::new()),
            sources: Mutex::new(SourceServers {
                src: ids.clone(),
                complete_sources: ids,
            }),
            hold_moves: AtomicBool::new(false),
            hang_sources: AtomicBool::new(false),
            fire_data_movement_complete: AtomicBool::new(false),
            fail_next_move_with: Mutex::new(None),
            release: Notify::new(),
        })
    }

    pub fn release_moves(&self) {
        self.hold_moves.store(false, Ordering::Relaxed);
        self.release.notify_waiters();
    }

    pub fn move_count(&self) -> usize {
        self.move_calls.lock().len()
    }
}

#[async_trait]
impl ShardMover for RecordingMover {
    async fn move_keys(&self, req: MoveKeysRequest) -> Result<()> {
        self.move_calls.lock().push(MoveRecord {
            data_move_id: req.data_move_id,
            range: req.range.clone(),
            dest_ids: req.dest_ids.clone(),
            healthy_ids: req.healthy_ids.clone(),
        });
        if let Some(err) = self.fail_next_move_with.lock().take() {
            return Err(err);
        }
        if let Some(tx) = req.data_movement_complete {
            if self.fire_data_movement_complete.load(Ordering::Relaxed) {
                let _ = tx.send(());
            }
        }
        while self.hold_moves.load(Ordering::Relaxed) {
            self.release.notified().await;
        }
        Ok(())
    }

    async fn clean_up_data_move(
        &self,
        data_move_id: Uid,
        range: KeyRange,
        _cleanup_lock: Arc<Semaphore>,
    ) -> Result<()> {
        self.cleanup_calls.lock().push((data_move_id, range));
        Ok(())
    }

    async fn sources_for_range(&self, _range: KeyRange) -> Result<SourceServers> {
        if self.hang_sources.load(Ordering::Relaxed) {
            std::future::pending::<()>().await;
        }
        Ok(self.sources.lock().clone())
    }
}

// ---- metrics and admin ----------------------------------------------------

pub struct TestMetrics {
    pub bytes: AtomicI64,
    pub read: AtomicI64,
    pub average: AtomicI64,
    pub cpu: Mutex<HashMap<Uid, f64>>,
    pub top_k: Mutex<Vec<(KeyRange, StorageMetrics)>>,
}

impl TestMetrics {
    pub fn new() -> Arc<Self> {
        Arc::new(TestMetrics {
            bytes: AtomicI64::new(1_000_000),
            read: AtomicI64::new(0),
            average: AtomicI64::new(500_000),
            cpu: Mutex::new(HashMap::new()),
            top_k: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl MetricsProvider for TestMetrics {
    async fn shard_metrics(&self, _range: KeyRange) -> Result<StorageMetrics> {
        Ok(StorageMetrics {
            bytes: self.bytes.load(Ordering::Relaxed),
            bytes_read_per_ksecond: self.read.load(Ordering::Relaxed),
        })
    }

    async fn top_k_read_metrics(&self, req: TopKReadRequest) -> Result<TopKReadReply> {
        let all = self.top_k.lock().clone();
        let shard_metrics: Vec<(KeyRange, StorageMetrics)> = all
            .into_iter()
            .filter(|(r, _)| req.shards.contains(r))
            .take(req.k.max(1))
            .collect();
        Ok(TopKReadReply {
            shard_metrics,
            min_read_load: 0.0,
            max_read_load: 0.0,
        })
    }

    async fn average_shard_bytes(&self) -> Result<i64> {
        Ok(self.average.load(Ordering::Relaxed))
    }

    async fn health_snapshot(&self) -> Result<HealthSnapshot> {
        let mut snapshot = HealthSnapshot::default();
        for (id, cpu) in self.cpu.lock().iter() {
            snapshot
                .storage_stats
                .insert(*id, shardq::api::StorageServerStats { cpu_usage: *cpu });
        }
        Ok(snapshot)
    }
}

pub struct TestAdmin {
    pub value: Mutex<Option<Bytes>>,
}

impl TestAdmin {
    pub fn new() -> Arc<Self> {
        Arc::new(TestAdmin {
            value: Mutex::new(None),
        })
    }
}

#[async_trait]
impl AdminState for TestAdmin {
    async fn rebalance_ignore(&self) -> Result<Option<Bytes>> {
        Ok(self.value.lock().clone())
    }
}

// ---- shard tracker --------------------------------------------------------

#[derive(Default)]
pub struct TestTracker {
    pub shards_by_team: Mutex<HashMap<Vec<Uid>, Vec<KeyRange>>>,
    pub moves: Mutex<Vec<(KeyRange, Vec<TeamDesc>)>>,
    pub finished: Mutex<Vec<KeyRange>>,
}

impl TestTracker {
    pub fn new() -> Arc<Self> {
        Arc::new(TestTracker::default())
    }

    pub fn set_shards(&self, servers: &[u64], shards: Vec<KeyRange>) {
        let team: Vec<Uid> = servers.iter().map(|n| uid(*n)).collect();
        self.shards_by_team.lock().insert(team, shards);
    }
}

impl ShardTracker for TestTracker {
    fn move_shard(&self, range: &KeyRange, teams: Vec<TeamDesc>) {
        self.moves.lock().push((range.clone(), teams));
    }

    fn finish_move(&self, range: &KeyRange) {
        self.finished.lock().push(range.clone());
    }

    fn shards_for(&self, team: &TeamDesc) -> Vec<KeyRange> {
        self.shards_by_team
            .lock()
            .get(&team.servers)
            .cloned()
            .unwrap_or_default()
    }
}

// ---- cluster --------------------------------------------------------------

pub struct TestCluster {
    pub queue: Arc<RelocationQueue>,
    pub input: mpsc::UnboundedSender<RelocateShard>,
    pub output: Mutex<mpsc::UnboundedReceiver<RelocateShard>>,
    pub mover: Arc<RecordingMover>,
    pub metrics: Arc<TestMetrics>,
    pub admin: Arc<TestAdmin>,
    pub tracker: Arc<TestTracker>,
    input_rx: Mutex<Option<mpsc::UnboundedReceiver<RelocateShard>>>,
}

impl TestCluster {
    /// Build a queue with the given collections but do not start its event
    /// loop; direct-call tests use this.
    pub fn build(
        mut knobs: Knobs,
        team_size: usize,
        single_region_team_size: usize,
        collections: Vec<Arc<dyn TeamCollection>>,
        mover: Arc<RecordingMover>,
    ) -> TestCluster {
        knobs.expensive_validation = true;
        if knobs.rng_seed.is_none() {
            knobs.rng_seed = Some(42);
        }
        let metrics = TestMetrics::new();
        let admin = TestAdmin::new();
        let tracker = TestTracker::new();
        let (output_tx, output_rx) = mpsc::unbounded_channel();
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let queue = RelocationQueue::new(QueueConfig {
            distributor_id: uid(999),
            team_size,
            single_region_team_size,
            knobs,
            team_collections: collections,
            shard_tracker: tracker.clone(),
            mover: mover.clone(),
            metrics: metrics.clone(),
            admin: admin.clone(),
            output: output_tx,
        });
        TestCluster {
            queue,
            input: input_tx,
            output: Mutex::new(output_rx),
            mover,
            metrics,
            admin,
            tracker,
            input_rx: Mutex::new(Some(input_rx)),
        }
    }

    /// Build and spawn the event loop.
    pub fn start(
        knobs: Knobs,
        team_size: usize,
        single_region_team_size: usize,
        collections: Vec<Arc<dyn TeamCollection>>,
        mover: Arc<RecordingMover>,
    ) -> TestCluster {
        let cluster = Self::build(knobs, team_size, single_region_team_size, collections, mover);
        cluster.spawn_run();
        cluster
    }

    pub fn spawn_run(&self) {
        let input_rx = self
            .input_rx
            .lock()
            .take()
            .expect("event loop already started");
        tokio::spawn(self.queue.clone().run(input_rx));
    }
}

/// Knobs most scenario tests want: validation on, rebalancers quiet.
pub fn quiet_knobs() -> Knobs {
    Knobs {
        rebalance_parallelism: 0,
        read_sampling_enabled: false,
        ..Knobs::default()
    }
}
