//! The relocation queue: intake, merging, admission, and launch.
//!
//! One `RelocationQueue` owns all scheduling state. Requests enter through
//! `queue_relocation`, wait in the fetching queue until their source servers
//! are known, then sit in per-server queues until the launch engine admits
//! them against the busyness ledgers. Launching inserts the relocation into
//! the in-flight map, cancels any overlapping in-flight work, and spawns a
//! relocator task for each resulting sub-range.
//!
//! Locking model: all mutable state sits behind one mutex. The queue
//! manager, source-fetch completion, launch engine, and completion handlers
//! each take the lock once for their whole body and never suspend while
//! holding it, so they are atomic with respect to each other, mirroring a
//! cooperative single-threaded scheduler. Suspending tasks (relocators,
//! rebalancers, source fetches) reacquire the lock between suspension
//! points.

use std::collections::hash_map::Entry;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::{BoxFuture, Shared};
use futures_util::FutureExt;
use parking_lot::{Mutex, MutexGuard};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::api::{AdminState, MetricsProvider, ShardMover};
use crate::busyness::{self, can_launch_src, Busyness};
use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::ids::Uid;
use crate::keyspace::KeyRange;
use crate::knobs::Knobs;
use crate::priority::{
    is_boundary_priority, is_health_priority, PRIORITY_MERGE_SHARD,
    PRIORITY_PERPETUAL_STORAGE_WIGGLE, PRIORITY_POPULATE_REGION, PRIORITY_TEAM_0_LEFT,
    PRIORITY_TEAM_1_LEFT, PRIORITY_TEAM_2_LEFT, PRIORITY_TEAM_REDUNDANT, PRIORITY_TEAM_UNHEALTHY,
};
use crate::range_map::RangeMap;
use crate::rebalance;
use crate::relocation::{RelocateData, RelocateShard};
use crate::relocator;
use crate::task_map::{TaskRangeMap, TaskSlot};
use crate::team::{ShardTracker, TeamCollection};

/// Completion signal of a data-move cleanup, shareable between the launch
/// engine and the relocator that must wait for it.
pub type CleanupSignal = Shared<BoxFuture<'static, Result<(), Error>>>;

pub(crate) fn ready_cleanup() -> CleanupSignal {
    async { Ok(()) }.boxed().shared()
}

/// Durable move recorded over a key range, with its cleanup in progress if
/// the move was cancelled.
#[derive(Clone, Default)]
pub struct DataMoveSlot {
    pub id: Uid,
    pub cancel: Option<CleanupSignal>,
}

impl DataMoveSlot {
    pub fn new(id: Uid) -> Self {
        DataMoveSlot { id, cancel: None }
    }

    pub fn is_valid(&self) -> bool {
        self.id.is_valid()
    }
}

/// Everything needed to build a queue.
pub struct QueueConfig {
    pub distributor_id: Uid,
    /// Total destination servers per relocation across all regions.
    pub team_size: usize,
    /// Servers per replica team within one region.
    pub single_region_team_size: usize,
    pub knobs: Knobs,
    /// One team collection per region, primary first.
    pub team_collections: Vec<Arc<dyn TeamCollection>>,
    pub shard_tracker: Arc<dyn ShardTracker>,
    pub mover: Arc<dyn ShardMover>,
    pub metrics: Arc<dyn MetricsProvider>,
    pub admin: Arc<dyn AdminState>,
    /// Where rebalancers emit their relocation requests; feed it back into
    /// the input stream.
    pub output: mpsc::UnboundedSender<RelocateShard>,
}

pub(crate) struct QueueState {
    pub queue_map: RangeMap<RelocateData>,
    pub fetching_sources: BTreeSet<RelocateData>,
    pub fetch_keys_complete: BTreeSet<RelocateData>,
    pub source_fetches: TaskRangeMap,
    pub server_queues: HashMap<Uid, BTreeSet<RelocateData>>,
    pub last_as_source: HashMap<Uid, f64>,
    pub in_flight: RangeMap<RelocateData>,
    pub in_flight_actors: TaskRangeMap,
    pub data_moves: RangeMap<DataMoveSlot>,
    pub busymap: HashMap<Uid, Busyness>,
    pub dest_busymap: HashMap<Uid, Busyness>,
    pub active_relocations: i64,
    pub queued_relocations: i64,
    pub unhealthy_relocations: i64,
    pub priority_relocations: HashMap<i32, i64>,
    pub bytes_written: i64,
    pub last_begin_event: f64,
    pub suppressed_events: i64,
}

struct Receivers {
    fetch_complete: mpsc::UnboundedReceiver<RelocateData>,
    transfer_complete: mpsc::UnboundedReceiver<RelocateData>,
    relocation_complete: mpsc::UnboundedReceiver<RelocateData>,
    ranges_complete: mpsc::UnboundedReceiver<KeyRange>,
    errors: mpsc::UnboundedReceiver<Error>,
}

pub struct RelocationQueue {
    pub(crate) distributor_id: Uid,
    pub(crate) team_size: usize,
    pub(crate) single_region_team_size: usize,
    pub(crate) knobs: Knobs,
    pub(crate) clock: Clock,
    rng: Mutex<StdRng>,

    pub(crate) team_collections: Vec<Arc<dyn TeamCollection>>,
    pub(crate) shard_tracker: Arc<dyn ShardTracker>,
    pub(crate) mover: Arc<dyn ShardMover>,
    pub(crate) metrics: Arc<dyn MetricsProvider>,
    pub(crate) admin: Arc<dyn AdminState>,

    pub(crate) start_move_lock: Arc<Semaphore>,
    pub(crate) finish_move_lock: Arc<Semaphore>,
    pub(crate) cleanup_lock: Arc<Semaphore>,
    fetch_source_lock: Arc<Semaphore>,

    state: Mutex<QueueState>,
    receivers: Mutex<Option<Receivers>>,

    pub(crate) output: mpsc::UnboundedSender<RelocateShard>,
    fetch_complete_tx: mpsc::UnboundedSender<RelocateData>,
    pub(crate) transfer_complete_tx: mpsc::UnboundedSender<RelocateData>,
    pub(crate) relocation_complete_tx: mpsc::UnboundedSender<RelocateData>,
    ranges_complete_tx: mpsc::UnboundedSender<KeyRange>,
    pub(crate) error_tx: mpsc::UnboundedSender<Error>,
    processing_unhealthy: watch::Sender<bool>,
    processing_wiggle: watch::Sender<bool>,
}

impl RelocationQueue {
    pub fn new(cfg: QueueConfig) -> Arc<Self> {
        let (fetch_complete_tx, fetch_complete) = mpsc::unbounded_channel();
        let (transfer_complete_tx, transfer_complete) = mpsc::unbounded_channel();
        let (relocation_complete_tx, relocation_complete) = mpsc::unbounded_channel();
        let (ranges_complete_tx, ranges_complete) = mpsc::unbounded_channel();
        let (error_tx, errors) = mpsc::unbounded_channel();
        let (processing_unhealthy, _) = watch::channel(false);
        let (processing_wiggle, _) = watch::channel(false);
        let rng = match cfg.knobs.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let state = QueueState {
            queue_map: RangeMap::new(RelocateData::default()),
            fetching_sources: BTreeSet::new(),
            fetch_keys_complete: BTreeSet::new(),
            source_fetches: TaskRangeMap::new(),
            server_queues: HashMap::new(),
            last_as_source: HashMap::new(),
            in_flight: RangeMap::new(RelocateData::default()),
            in_flight_actors: TaskRangeMap::new(),
            data_moves: RangeMap::new(DataMoveSlot::default()),
            busymap: HashMap::new(),
            dest_busymap: HashMap::new(),
            active_relocations: 0,
            queued_relocations: 0,
            unhealthy_relocations: 0,
            priority_relocations: HashMap::new(),
            bytes_written: 0,
            last_begin_event: 0.0,
            suppressed_events: 0,
        };
        Arc::new(RelocationQueue {
            distributor_id: cfg.distributor_id,
            team_size: cfg.team_size,
            single_region_team_size: cfg.single_region_team_size,
            start_move_lock: Arc::new(Semaphore::new(cfg.knobs.move_keys_parallelism)),
            finish_move_lock: Arc::new(Semaphore::new(cfg.knobs.move_keys_parallelism)),
            cleanup_lock: Arc::new(Semaphore::new(cfg.knobs.move_keys_parallelism)),
            fetch_source_lock: Arc::new(Semaphore::new(cfg.knobs.fetch_source_parallelism)),
            knobs: cfg.knobs,
            clock: Clock::new(),
            rng: Mutex::new(rng),
            team_collections: cfg.team_collections,
            shard_tracker: cfg.shard_tracker,
            mover: cfg.mover,
            metrics: cfg.metrics,
            admin: cfg.admin,
            state: Mutex::new(state),
            receivers: Mutex::new(Some(Receivers {
                fetch_complete,
                transfer_complete,
                relocation_complete,
                ranges_complete,
                errors,
            })),
            output: cfg.output,
            fetch_complete_tx,
            transfer_complete_tx,
            relocation_complete_tx,
            ranges_complete_tx,
            error_tx,
            processing_unhealthy,
            processing_wiggle,
        })
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock()
    }

    pub(crate) fn random_uid(&self) -> Uid {
        Uid::random(&mut *self.rng.lock())
    }

    pub(crate) fn random_index(&self, len: usize) -> usize {
        debug_assert!(len > 0);
        self.rng.lock().gen_range(0..len)
    }

    pub(crate) fn random_choice<T: Clone>(&self, items: &[T]) -> Option<T> {
        if items.is_empty() {
            return None;
        }
        Some(items[self.random_index(items.len())].clone())
    }

    pub(crate) fn shuffle<T>(&self, items: &mut [T]) {
        use rand::seq::SliceRandom;
        items.shuffle(&mut *self.rng.lock());
    }

    // ---- counters ---------------------------------------------------------

    pub fn active_relocations(&self) -> i64 {
        self.state.lock().active_relocations
    }

    pub fn queued_relocations(&self) -> i64 {
        self.state.lock().queued_relocations
    }

    pub fn unhealthy_relocations(&self) -> i64 {
        self.state.lock().unhealthy_relocations
    }

    pub fn bytes_written(&self) -> i64 {
        self.state.lock().bytes_written
    }

    pub fn queued_at_priority(&self, priority: i32) -> i64 {
        self.state
            .lock()
            .priority_relocations
            .get(&priority)
            .copied()
            .unwrap_or(0)
    }

    pub fn highest_priority_relocation(&self) -> i32 {
        self.state
            .lock()
            .priority_relocations
            .iter()
            .filter(|(_, count)| **count > 0)
            .map(|(priority, _)| *priority)
            .max()
            .unwrap_or(0)
    }

    /// Entries still waiting for source resolution.
    pub fn fetching_snapshot(&self) -> Vec<RelocateData> {
        self.state.lock().fetching_sources.iter().cloned().collect()
    }

    /// Launched relocations currently in flight, by range.
    pub fn in_flight_snapshot(&self) -> Vec<(KeyRange, RelocateData)> {
        self.state
            .lock()
            .in_flight
            .ranges()
            .into_iter()
            .filter(|(_, entry)| entry.start_time >= 0.0)
            .map(|(range, entry)| (range, entry.clone()))
            .collect()
    }

    /// Durable moves currently recorded, by range.
    pub fn data_move_snapshot(&self) -> Vec<(KeyRange, Uid)> {
        self.state
            .lock()
            .data_moves
            .ranges()
            .into_iter()
            .filter(|(_, slot)| slot.is_valid())
            .map(|(range, slot)| (range, slot.id))
            .collect()
    }

    pub fn processing_unhealthy(&self) -> watch::Receiver<bool> {
        self.processing_unhealthy.subscribe()
    }

    pub fn processing_wiggle(&self) -> watch::Receiver<bool> {
        self.processing_wiggle.subscribe()
    }

    fn start_relocation(&self, st: &mut QueueState, priority: i32, health_priority: i32) {
        // Team-redundant moves count as unhealthy even though boundary moves
        // outrank them: the team remover waits for this counter to reach
        // zero, and boundary moves must not be forced to wait behind it.
        if matches!(
            health_priority,
            PRIORITY_POPULATE_REGION
                | PRIORITY_TEAM_UNHEALTHY
                | PRIORITY_TEAM_2_LEFT
                | PRIORITY_TEAM_1_LEFT
                | PRIORITY_TEAM_0_LEFT
                | PRIORITY_TEAM_REDUNDANT
        ) {
            st.unhealthy_relocations += 1;
            self.processing_unhealthy.send_replace(true);
        }
        if health_priority == PRIORITY_PERPETUAL_STORAGE_WIGGLE {
            self.processing_wiggle.send_replace(true);
        }
        *st.priority_relocations.entry(priority).or_insert(0) += 1;
    }

    fn finish_relocation(&self, st: &mut QueueState, priority: i32, health_priority: i32) {
        if matches!(
            health_priority,
            PRIORITY_POPULATE_REGION
                | PRIORITY_TEAM_UNHEALTHY
                | PRIORITY_TEAM_2_LEFT
                | PRIORITY_TEAM_1_LEFT
                | PRIORITY_TEAM_0_LEFT
                | PRIORITY_TEAM_REDUNDANT
        ) {
            st.unhealthy_relocations -= 1;
            debug_assert!(st.unhealthy_relocations >= 0);
            if st.unhealthy_relocations == 0 {
                self.processing_unhealthy.send_replace(false);
            }
        }
        *st.priority_relocations.entry(priority).or_insert(0) -= 1;
        if st
            .priority_relocations
            .get(&PRIORITY_PERPETUAL_STORAGE_WIGGLE)
            .copied()
            .unwrap_or(0)
            == 0
        {
            self.processing_wiggle.send_replace(false);
        }
    }

    // ---- queue manager ----------------------------------------------------

    /// Accept one relocation request: inherit intent from overlapping queued
    /// work, supersede what it fully covers, split the key space, and
    /// (re)start source resolution for every resulting piece. Never
    /// suspends. Source servers of displaced entries are added to
    /// `servers_to_launch_from` so the launch engine reconsiders them.
    pub fn queue_relocation(
        self: &Arc<Self>,
        rs: &RelocateShard,
        servers_to_launch_from: &mut HashSet<Uid>,
    ) {
        let mut st = self.state.lock();
        let now = self.clock.now();
        let mut rd = RelocateData::from_shard(rs, now, &mut *self.rng.lock());
        let has_health_priority = is_health_priority(rd.priority);
        let has_boundary_priority = is_boundary_priority(rd.priority);

        // Inherit intent from every active overlapping entry and drop the
        // ones the new request fully covers.
        let overlapping: Vec<RelocateData> = st
            .queue_map
            .intersecting(&rd.keys)
            .into_iter()
            .map(|(_, v)| v.clone())
            .collect();
        for rrs in &overlapping {
            let found_fetching = st.fetching_sources.contains(rrs);
            let found_queued = !found_fetching
                && !rrs.src.is_empty()
                && st
                    .server_queues
                    .get(&rrs.src[0])
                    .map_or(false, |q| q.contains(rrs));
            if found_fetching || found_queued {
                rd.wants_new_servers |= rrs.wants_new_servers;
                rd.start_time = rd.start_time.min(rrs.start_time);
                if !has_health_priority {
                    rd.health_priority = rd.health_priority.max(rrs.health_priority);
                }
                if !has_boundary_priority {
                    rd.boundary_priority = rd.boundary_priority.max(rrs.boundary_priority);
                }
                rd.priority = rd
                    .priority
                    .max(rd.boundary_priority)
                    .max(rd.health_priority);
            }

            if rd.keys.contains(&rrs.keys) {
                if found_fetching {
                    st.fetching_sources.remove(rrs);
                } else if found_queued {
                    for server in &rrs.src {
                        if let Some(q) = st.server_queues.get_mut(server) {
                            q.remove(rrs);
                        }
                    }
                }
            }

            if found_fetching || found_queued {
                servers_to_launch_from.extend(rrs.src.iter().copied());
                st.queued_relocations -= 1;
                tracing::trace!(
                    data_move = %rrs.data_move_id,
                    relocation = %rrs.random_id,
                    total = st.queued_relocations,
                    "queued relocation superseded"
                );
                self.finish_relocation(&mut st, rrs.priority, rrs.health_priority);
            }
        }

        // Final partition of the touched span, then the splitting insert.
        let affected = st.queue_map.affected_ranges_after_insertion(&rd.keys);
        st.queue_map.insert(&rd.keys, rd.clone());

        // Source fetches for the whole affected span are stale now.
        if let (Some(first), Some(last)) = (affected.first(), affected.last()) {
            let span = KeyRange::new(first.begin.clone(), last.end.clone());
            st.source_fetches.cancel(&span);
        }

        // Requeue each surviving piece. A piece keeps its entry's identity;
        // when one displaced entry yields two pieces the second gets a fresh
        // id so ordered-set identities stay unique.
        let mut seen_active: HashMap<Uid, bool> = HashMap::new();
        for sr in &affected {
            let original = st.queue_map.range_containing(&sr.begin).1.clone();
            let is_inserted = original.random_id == rd.random_id;
            let (first_piece, was_active) = match seen_active.entry(original.random_id) {
                Entry::Vacant(slot) => {
                    let active = if is_inserted {
                        true
                    } else if original.src.is_empty() {
                        st.fetching_sources.remove(&original)
                    } else {
                        let mut any = false;
                        for server in &original.src {
                            if let Some(q) = st.server_queues.get_mut(server) {
                                any |= q.remove(&original);
                            }
                        }
                        any
                    };
                    slot.insert(active);
                    (true, active)
                }
                Entry::Occupied(slot) => (false, *slot.get()),
            };

            if !was_active {
                // Keep truncated keys on dead entries; validation relies on
                // the map and the entry agreeing.
                let (_, entry) = st.queue_map.value_containing_mut(&sr.begin);
                entry.keys = sr.clone();
                continue;
            }

            let mut piece = original.clone();
            piece.keys = sr.clone();
            if !first_piece {
                piece.random_id = Uid::random(&mut *self.rng.lock());
            }

            st.queued_relocations += 1;
            tracing::trace!(
                data_move = %piece.data_move_id,
                relocation = %piece.random_id,
                total = st.queued_relocations,
                "relocation queued"
            );
            self.start_relocation(&mut st, piece.priority, piece.health_priority);

            if piece.src.is_empty() {
                st.fetching_sources.insert(piece.clone());
                *st.queue_map.value_containing_mut(&sr.begin).1 = piece.clone();
                self.spawn_source_fetch(&mut st, piece);
            } else {
                for server in piece.src.clone() {
                    st.server_queues
                        .entry(server)
                        .or_default()
                        .insert(piece.clone());
                }
                *st.queue_map.value_containing_mut(&sr.begin).1 = piece;
            }
        }

        self.validate(&st);
    }

    fn spawn_source_fetch(self: &Arc<Self>, st: &mut QueueState, rd: RelocateData) {
        let token = CancellationToken::new();
        let task_token = token.clone();
        let queue = Arc::clone(self);
        let range = rd.keys.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = task_token.cancelled() => {}
                _ = queue.clone().fetch_source_servers(rd) => {}
            }
        });
        st.source_fetches
            .insert(&range, TaskSlot::new(token, handle.abort_handle()));
    }

    /// Resolve the servers currently holding `rd.keys`. Merges defer longer
    /// so adjacent-shard lookups batch into one window.
    async fn fetch_source_servers(self: Arc<Self>, mut rd: RelocateData) {
        let delay = if rd.priority == PRIORITY_MERGE_SHARD {
            self.knobs.merge_source_fetch_delay
        } else {
            self.knobs.source_fetch_delay
        };
        self.clock.sleep(delay).await;
        let permit = match self.fetch_source_lock.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return,
        };
        match self.mover.sources_for_range(rd.keys.clone()).await {
            Ok(sources) => {
                rd.src = sources.src;
                rd.complete_sources = sources.complete_sources;
                let _ = self.fetch_complete_tx.send(rd);
            }
            Err(err) => {
                tracing::warn!(range = %rd.keys, error = %err, "source server fetch failed");
            }
        }
        drop(permit);
    }

    /// Move a resolved entry from the fetching queue into its source
    /// servers' queues. Returns false for stale results whose entry was
    /// superseded after the lookup finished.
    pub fn complete_source_fetch(&self, results: &RelocateData) -> bool {
        let mut st = self.state.lock();
        if !st.fetching_sources.remove(results) {
            tracing::debug!(range = %results.keys, relocation = %results.random_id, "stale source fetch dropped");
            return false;
        }
        st.queue_map.insert(&results.keys, results.clone());
        for server in &results.src {
            st.server_queues
                .entry(*server)
                .or_default()
                .insert(results.clone());
        }
        let now = self.clock.now();
        for server in &results.src {
            st.last_as_source.insert(*server, now);
        }
        true
    }

    // ---- launch engine ----------------------------------------------------

    /// Reconsider every queued entry overlapping `keys`.
    pub fn launch_queued_work_range(self: &Arc<Self>, keys: &KeyRange) {
        let combined: BTreeSet<RelocateData> = {
            let st = self.state.lock();
            st.queue_map
                .intersecting(keys)
                .into_iter()
                .filter(|(_, v)| {
                    !v.src.is_empty()
                        && st
                            .server_queues
                            .get(&v.src[0])
                            .map_or(false, |q| q.contains(v))
                })
                .map(|(_, v)| v.clone())
                .collect()
        };
        self.launch_queued_set(combined);
    }

    /// Reconsider the best queued entries of each listed source server.
    pub fn launch_queued_work_servers(self: &Arc<Self>, servers: &HashSet<Uid>) {
        let combined: BTreeSet<RelocateData> = {
            let st = self.state.lock();
            let mut combined = BTreeSet::new();
            for id in servers {
                if let Some(q) = st.server_queues.get(id) {
                    for rd in q.iter().take(self.team_size) {
                        combined.insert(rd.clone());
                    }
                }
            }
            combined
        };
        self.launch_queued_set(combined);
    }

    /// Consider one specific entry (restores and freshly resolved fetches).
    pub fn launch_queued_work_single(self: &Arc<Self>, rd: RelocateData) {
        let mut combined = BTreeSet::new();
        combined.insert(rd);
        self.launch_queued_set(combined);
    }

    /// Walk candidates in priority order; for each, cancel superseded
    /// in-flight work, charge the busyness ledgers, and spawn relocators.
    /// Runs to completion without suspending.
    fn launch_queued_set(self: &Arc<Self>, combined: BTreeSet<RelocateData>) {
        let mut st = self.state.lock();
        let started = self.clock.now();
        for candidate in combined {
            let mut rd = candidate;

            // An overlapping in-flight move that already fetched its keys and
            // is not fully covered wins unless the newcomer is a health
            // emergency.
            let mut overlapping_in_flight = false;
            for (range, entry) in st.in_flight.intersecting(&rd.keys) {
                if st.fetch_keys_complete.contains(entry)
                    && st.in_flight_actors.live_task_at(&range.begin)
                    && !rd.keys.contains(&range)
                    && entry.priority >= rd.priority
                    && rd.health_priority < PRIORITY_TEAM_UNHEALTHY
                {
                    overlapping_in_flight = true;
                    break;
                }
            }
            if overlapping_in_flight {
                debug_assert!(!rd.is_restore());
                continue;
            }

            // Busyness of a server is refunded when a superseding launch
            // cancels its work, so admission must look at what the ledgers
            // WOULD be after those cancellations.
            let cancellable_relocations: Vec<RelocateData> = st
                .in_flight
                .contained(&rd.keys)
                .into_iter()
                .filter(|(_, v)| v.cancellable)
                .map(|(_, v)| v.clone())
                .collect();

            if !rd.is_restore()
                && !can_launch_src(
                    &rd,
                    self.team_size,
                    self.single_region_team_size,
                    &st.busymap,
                    &cancellable_relocations,
                    &self.knobs,
                )
            {
                continue;
            }

            if !rd.is_restore() {
                st.queued_relocations -= 1;
                tracing::trace!(
                    data_move = %rd.data_move_id,
                    relocation = %rd.random_id,
                    total = st.queued_relocations,
                    "relocation leaving queue"
                );
                self.finish_relocation(&mut st, rd.priority, rd.health_priority);
                for server in &rd.src {
                    if let Some(q) = st.server_queues.get_mut(server) {
                        q.remove(&rd);
                    }
                }
            }

            let cleanup = if self.knobs.shard_encode_location_metadata {
                self.spawn_cancel_data_move(rd.keys.clone())
            } else {
                ready_cleanup()
            };

            // Keep the relocation intent of in-flight work we are about to
            // cancel.
            for (range, entry) in st.in_flight.intersecting(&rd.keys) {
                if st.in_flight_actors.live_task_at(&range.begin) {
                    rd.wants_new_servers |= entry.wants_new_servers;
                }
            }

            let ranges = st.in_flight_actors.ranges_affected_by_insertion(&rd.keys);
            if let (Some(first), Some(last)) = (ranges.first(), ranges.last()) {
                let span = KeyRange::new(first.begin.clone(), last.end.clone());
                st.in_flight_actors.cancel(&span);
            }
            st.in_flight.insert(&rd.keys, rd.clone());

            for sr in &ranges {
                let mut launched = {
                    let fresh_id = if self.knobs.shard_encode_location_metadata {
                        Uid::random(&mut *self.rng.lock())
                    } else {
                        Uid::nil()
                    };
                    let (_, entry) = st.in_flight.value_containing_mut(&sr.begin);
                    entry.keys = sr.clone();
                    if *sr == rd.keys && rd.is_restore() {
                        // A restored move keeps its durable identity.
                    } else {
                        entry.data_move = None;
                        entry.data_move_id = fresh_id;
                    }
                    entry.clone()
                };
                busyness::launch_src(
                    &mut launched,
                    &mut st.busymap,
                    self.single_region_team_size,
                    &self.knobs,
                );
                *st.in_flight.value_containing_mut(&sr.begin).1 = launched.clone();
                st.active_relocations += 1;
                tracing::trace!(
                    data_move = %launched.data_move_id,
                    total = st.active_relocations,
                    "relocation launched"
                );
                self.start_relocation(&mut st, launched.priority, launched.health_priority);

                let token = CancellationToken::new();
                let task_token = token.clone();
                let queue = Arc::clone(self);
                let task_cleanup = cleanup.clone();
                let handle = tokio::spawn(async move {
                    relocator::run(queue, launched, task_cleanup, task_token).await;
                });
                st.in_flight_actors
                    .insert(sr, TaskSlot::new(token, handle.abort_handle()));
            }
        }
        let elapsed = self.clock.now() - started;
        if elapsed > 0.001 {
            tracing::debug!(elapsed, "launch pass ran long");
        }
        self.validate(&st);
    }

    // ---- data move cancellation -------------------------------------------

    fn spawn_cancel_data_move(self: &Arc<Self>, range: KeyRange) -> CleanupSignal {
        let queue = Arc::clone(self);
        let handle = tokio::spawn(async move { queue.cancel_data_move(range).await });
        async move {
            match handle.await {
                Ok(result) => result,
                Err(err) => Err(Error::from(anyhow::anyhow!(
                    "data move cleanup task failed: {err}"
                ))),
            }
        }
        .boxed()
        .shared()
    }

    /// Cancel every durable move intersecting `range`: kick off (or join)
    /// their cleanups, wait for all of them, then clear the touched span.
    pub async fn cancel_data_move(self: Arc<Self>, range: KeyRange) -> Result<()> {
        let pending: Vec<CleanupSignal> = {
            let mut st = self.state.lock();
            let mover = self.mover.clone();
            let cleanup_lock = self.cleanup_lock.clone();
            let mut pending = Vec::new();
            st.data_moves.for_each_intersecting_mut(&range, |r, slot| {
                if !slot.id.is_valid() {
                    return;
                }
                tracing::info!(
                    data_move = %slot.id,
                    move_range = %r,
                    cancel_range = %range,
                    "cancelling data move"
                );
                if slot.cancel.is_none() {
                    let mover = mover.clone();
                    let lock = cleanup_lock.clone();
                    let id = slot.id;
                    let keys = r.clone();
                    let handle =
                        tokio::spawn(async move { mover.clean_up_data_move(id, keys, lock).await });
                    slot.cancel = Some(
                        async move {
                            match handle.await {
                                Ok(result) => result,
                                Err(err) => Err(Error::from(anyhow::anyhow!(
                                    "data move cleanup task failed: {err}"
                                ))),
                            }
                        }
                        .boxed()
                        .shared(),
                    );
                }
                if let Some(cancel) = &slot.cancel {
                    pending.push(cancel.clone());
                }
            });
            pending
        };

        futures_util::future::try_join_all(pending).await?;

        let mut st = self.state.lock();
        let ranges = st.data_moves.affected_ranges_after_insertion(&range);
        if let (Some(first), Some(last)) = (ranges.first(), ranges.last()) {
            let span = KeyRange::new(first.begin.clone(), last.end.clone());
            st.data_moves.insert(&span, DataMoveSlot::default());
        }
        Ok(())
    }

    /// Record an administratively cancelled durable move and schedule its
    /// cleanup. A different valid move already covering part of the range is
    /// an invariant breach: trace it and do nothing.
    pub fn enqueue_cancelled_data_move(self: &Arc<Self>, data_move_id: Uid, range: KeyRange) {
        let mut st = self.state.lock();
        for (r, slot) in st.data_moves.intersecting(&range) {
            if slot.id.is_valid() && slot.id != data_move_id {
                tracing::error!(
                    data_move = %data_move_id,
                    cancelled_range = %range,
                    conflicting_move = %slot.id,
                    conflicting_range = %r,
                    "cancelled data move conflicts with a recorded move"
                );
                return;
            }
            if slot.id.is_valid() {
                // Same move already recorded; the cleanup is on its way.
                return;
            }
        }
        let mover = self.mover.clone();
        let lock = self.cleanup_lock.clone();
        let keys = range.clone();
        let handle =
            tokio::spawn(async move { mover.clean_up_data_move(data_move_id, keys, lock).await });
        let cancel = async move {
            match handle.await {
                Ok(result) => result,
                Err(err) => Err(Error::from(anyhow::anyhow!(
                    "data move cleanup task failed: {err}"
                ))),
            }
        }
        .boxed()
        .shared();
        st.data_moves.insert(
            &range,
            DataMoveSlot {
                id: data_move_id,
                cancel: Some(cancel),
            },
        );
        tracing::info!(data_move = %data_move_id, range = %range, "cancelled data move enqueued");
    }

    // ---- read-rebalance throttle ------------------------------------------

    /// True while any of `ids` shipped a shard so recently that the sampled
    /// read metrics have not caught up yet.
    pub fn time_throttle(&self, ids: &[Uid]) -> bool {
        let st = self.state.lock();
        let now = self.clock.now();
        let window = self.knobs.storage_metrics_average_interval.as_secs_f64();
        ids.iter().any(|id| {
            st.last_as_source.get(id).map_or(false, |last| {
                (now - last) * self.knobs.read_rebalance_src_parallelism < window
            })
        })
    }

    pub fn update_last_as_source(&self, ids: &[Uid]) {
        let now = self.clock.now();
        let mut st = self.state.lock();
        for id in ids {
            st.last_as_source.insert(*id, now);
        }
    }

    // ---- validation -------------------------------------------------------

    /// Cross-map invariant checks; each violation traces an error event.
    /// Gated on the expensive-validation knob.
    pub(crate) fn validate(&self, st: &QueueState) {
        if !self.knobs.expensive_validation {
            return;
        }

        for entry in &st.fetching_sources {
            if !entry.src.is_empty() {
                tracing::error!(range = %entry.keys, "fetching entry already has source servers");
            }
            if entry.work_factor != 0 {
                tracing::error!(range = %entry.keys, "fetching entry carries a work factor");
            }
            let (range, value) = st.queue_map.range_containing(&entry.keys.begin);
            if !value.matches(entry) || range != entry.keys {
                tracing::error!(range = %entry.keys, "fetching entry disagrees with the queue map");
            }
        }

        for (range, entry) in st.in_flight.ranges() {
            if entry.start_time < 0.0 {
                continue;
            }
            for server in &entry.src {
                if !st.busymap.contains_key(server) {
                    tracing::error!(server = %server, "in-flight source server missing from busyness ledger");
                }
                if st
                    .server_queues
                    .get(server)
                    .map_or(false, |q| q.contains(entry))
                {
                    tracing::error!(range = %entry.keys, "in-flight relocation still queued");
                }
            }
            for dest in &entry.complete_dests {
                if !st.dest_busymap.contains_key(dest) {
                    tracing::error!(server = %dest, "in-flight destination missing from busyness ledger");
                }
            }
            if entry.src.is_empty() {
                tracing::error!(range = %range, "in-flight relocation without source servers");
            }
            if st.in_flight_actors.live_task_at(&range.begin) {
                if entry.keys != range {
                    tracing::error!(range = %range, entry = %entry.keys, "in-flight entry range mismatch");
                }
            } else if entry.cancellable {
                tracing::error!(range = %range, "cancellable in-flight range has no live relocator");
            }
        }

        for (ledger_name, ledgers) in [("src", &st.busymap), ("dest", &st.dest_busymap)] {
            for (server, busy) in ledgers {
                let ledger = busy.ledger();
                for window in ledger.windows(2) {
                    if window[0] < window[1] {
                        tracing::error!(server = %server, ledger = ledger_name, "busyness ledger increases across bands");
                    }
                }
                if ledger.iter().any(|w| *w < 0) {
                    tracing::error!(server = %server, ledger = ledger_name, "negative busyness ledger");
                }
            }
        }

        let mut queued_union: BTreeSet<&RelocateData> = BTreeSet::new();
        for q in st.server_queues.values() {
            queued_union.extend(q.iter());
        }
        let counted = queued_union.len() + st.fetching_sources.len();
        if st.queued_relocations != counted as i64 {
            tracing::error!(
                queued = st.queued_relocations,
                counted,
                "queued relocation counter out of sync"
            );
        }

        let by_priority: i64 = st.priority_relocations.values().sum();
        if st.active_relocations + st.queued_relocations != by_priority {
            tracing::error!(
                active = st.active_relocations,
                queued = st.queued_relocations,
                by_priority,
                "per-priority counters out of sync"
            );
        }
    }

    // ---- periodic status --------------------------------------------------

    fn log_moving_data(self: &Arc<Self>) {
        let (active, queued, unhealthy, highest, bytes, priorities) = {
            let st = self.state.lock();
            let priorities: Vec<(i32, i64)> = st
                .priority_relocations
                .iter()
                .filter(|(_, c)| **c != 0)
                .map(|(p, c)| (*p, *c))
                .collect();
            (
                st.active_relocations,
                st.queued_relocations,
                st.unhealthy_relocations,
                self.highest_priority_relocation_locked(&st),
                st.bytes_written,
                priorities,
            )
        };
        let metrics = self.metrics.clone();
        tokio::spawn(async move {
            let average_shard_bytes = metrics.average_shard_bytes().await.unwrap_or(-1);
            tracing::info!(
                in_flight = active,
                in_queue = queued,
                average_shard_bytes,
                unhealthy_relocations = unhealthy,
                highest_priority = highest,
                bytes_written = bytes,
                priorities = ?priorities,
                "moving data"
            );
        });
    }

    fn highest_priority_relocation_locked(&self, st: &QueueState) -> i32 {
        st.priority_relocations
            .iter()
            .filter(|(_, count)| **count > 0)
            .map(|(priority, _)| *priority)
            .max()
            .unwrap_or(0)
    }

    // ---- main loop --------------------------------------------------------

    /// Drive the queue: consume relocation requests, resolve sources, launch
    /// admitted work, recycle completed ranges, and host the background
    /// rebalancers. Returns when the input stream closes or a relocation
    /// surfaces a terminal error.
    pub async fn run(
        self: Arc<Self>,
        mut input: mpsc::UnboundedReceiver<RelocateShard>,
    ) -> Result<()> {
        let mut rx = self
            .receivers
            .lock()
            .take()
            .ok_or_else(|| Error::from(anyhow::anyhow!("relocation queue already running")))?;

        let mut balancers: JoinSet<Result<()>> = JoinSet::new();
        rebalance::spawn_rebalancers(&self, &mut balancers);

        let mut servers_to_launch_from: HashSet<Uid> = HashSet::new();
        let mut launch_data: Option<RelocateData> = None;
        let mut keys_to_launch_from: Option<KeyRange> = None;
        let mut launch_timer: Option<Pin<Box<tokio::time::Sleep>>> = None;
        let mut log_timer = tokio::time::interval(self.knobs.queue_logging_interval);
        log_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            {
                let st = self.state.lock();
                self.validate(&st);
            }

            // Work queued up by the previous event is launched before the
            // next event is taken.
            if let Some(rd) = launch_data.take() {
                self.launch_queued_work_single(rd);
            } else if let Some(keys) = keys_to_launch_from.take() {
                self.launch_queued_work_range(&keys);
            }

            tokio::select! {
                request = input.recv() => {
                    match request {
                        Some(rs) if rs.is_restore() => {
                            debug_assert!(rs.data_move_id.is_valid());
                            let now = self.clock.now();
                            let rd = RelocateData::from_shard(&rs, now, &mut *self.rng.lock());
                            self.launch_queued_work_single(rd);
                        }
                        Some(rs) if rs.cancelled => {
                            self.enqueue_cancelled_data_move(rs.data_move_id, rs.keys.clone());
                        }
                        Some(rs) => {
                            let was_empty = servers_to_launch_from.is_empty();
                            self.queue_relocation(&rs, &mut servers_to_launch_from);
                            if was_empty && !servers_to_launch_from.is_empty() {
                                launch_timer = Some(Box::pin(tokio::time::sleep(Duration::ZERO)));
                            }
                        }
                        None => {
                            tracing::info!("relocation input closed, shutting down queue");
                            let mut st = self.state.lock();
                            st.source_fetches.cancel(&KeyRange::all());
                            st.in_flight_actors.cancel(&KeyRange::all());
                            return Ok(());
                        }
                    }
                }
                _ = wait_timer(&mut launch_timer), if launch_timer.is_some() => {
                    launch_timer = None;
                    let servers = std::mem::take(&mut servers_to_launch_from);
                    self.launch_queued_work_servers(&servers);
                }
                Some(results) = rx.fetch_complete.recv() => {
                    if self.complete_source_fetch(&results) {
                        launch_data = Some(results);
                    }
                }
                Some(done) = rx.transfer_complete.recv() => {
                    {
                        let mut guard = self.state.lock();
                        let st = &mut *guard;
                        busyness::complete(&done, &mut st.busymap, &mut st.dest_busymap, &self.knobs);
                    }
                    if servers_to_launch_from.is_empty() && !done.src.is_empty() {
                        launch_timer = Some(Box::pin(tokio::time::sleep(Duration::ZERO)));
                    }
                    servers_to_launch_from.extend(done.src.iter().copied());
                }
                Some(done) = rx.relocation_complete.recv() => {
                    {
                        let mut st = self.state.lock();
                        st.active_relocations -= 1;
                        tracing::trace!(
                            data_move = %done.data_move_id,
                            restore = done.is_restore(),
                            total = st.active_relocations,
                            "relocation complete"
                        );
                        self.finish_relocation(&mut st, done.priority, done.health_priority);
                        st.fetch_keys_complete.remove(&done);
                    }
                    let _ = self.ranges_complete_tx.send(done.keys.clone());
                }
                Some(keys) = rx.ranges_complete.recv() => {
                    keys_to_launch_from = Some(keys);
                }
                Some(err) = rx.errors.recv() => {
                    if !matches!(err, Error::DataMoveCancelled | Error::DestTeamNotFound) {
                        tracing::error!(error = %err, "relocation queue failing");
                    }
                    let mut st = self.state.lock();
                    st.source_fetches.cancel(&KeyRange::all());
                    st.in_flight_actors.cancel(&KeyRange::all());
                    return Err(err);
                }
                Some(balancer) = balancers.join_next(), if !balancers.is_empty() => {
                    match balancer {
                        Ok(Ok(())) => {}
                        Ok(Err(err)) => return Err(err),
                        Err(join_err) if join_err.is_cancelled() => {}
                        Err(join_err) => {
                            return Err(Error::from(anyhow::anyhow!(
                                "rebalancer task failed: {join_err}"
                            )));
                        }
                    }
                }
                _ = log_timer.tick() => {
                    self.log_moving_data();
                }
            }
        }
    }
}

async fn wait_timer(slot: &mut Option<Pin<Box<tokio::time::Sleep>>>) {
    match slot.as_mut() {
        Some(sleep) => sleep.as_mut().await,
        None => std::future::pending().await,
    }
}
