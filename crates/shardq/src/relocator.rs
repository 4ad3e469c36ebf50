//! The per-relocation task: pick destination teams, drive the transactional
//! move, watch destination health, and settle the books.
//!
//! One relocator owns one in-flight key range. It is cancelled cooperatively
//! through its token, observed only at suspension points; after any
//! suspension the task re-checks that the in-flight entry still carries its
//! identity before mutating shared state. Whatever way the task ends, the
//! completion messages it emits let the main loop refund busyness and
//! reconsider the range exactly once.

use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::api::{MoveKeysRequest, StorageMetrics};
use crate::busyness;
use crate::error::{Error, Result};
use crate::ids::Uid;
use crate::knobs::Knobs;
use crate::priority::{
    is_valley_filler_priority, RelocateReason, PRIORITY_POPULATE_REGION, PRIORITY_TEAM_0_LEFT,
    PRIORITY_TEAM_1_LEFT, PRIORITY_TEAM_2_LEFT, PRIORITY_TEAM_UNHEALTHY,
};
use crate::queue::{CleanupSignal, DataMoveSlot, RelocationQueue};
use crate::relocation::RelocateData;
use crate::team::{GetTeamRequest, ParallelTeam, StorageTeam, TeamDesc, TeamRef};

pub(crate) async fn run(
    queue: Arc<RelocationQueue>,
    rd: RelocateData,
    prev_cleanup: CleanupSignal,
    token: CancellationToken,
) {
    let mut task = Relocator::new(queue, rd, prev_cleanup);
    let result = tokio::select! {
        biased;
        _ = token.cancelled() => Err(Error::Cancelled),
        result = task.relocate() => result,
    };
    task.finish(result).await;
}

struct Relocator {
    queue: Arc<RelocationQueue>,
    rd: RelocateData,
    prev_cleanup: CleanupSignal,
    start_time: f64,
    signalled_transfer_complete: bool,
    healthy_destinations: ParallelTeam,
    metrics: StorageMetrics,
    dest_ids: Vec<Uid>,
}

fn inflight_penalty(health_priority: i32, knobs: &Knobs) -> f64 {
    if health_priority == PRIORITY_POPULATE_REGION
        || health_priority == PRIORITY_TEAM_1_LEFT
        || health_priority == PRIORITY_TEAM_0_LEFT
    {
        knobs.inflight_penalty_one_left
    } else if health_priority == PRIORITY_TEAM_UNHEALTHY
        || health_priority == PRIORITY_TEAM_2_LEFT
    {
        knobs.inflight_penalty_unhealthy
    } else {
        knobs.inflight_penalty_healthy
    }
}

impl Relocator {
    fn new(queue: Arc<RelocationQueue>, rd: RelocateData, prev_cleanup: CleanupSignal) -> Self {
        let start_time = queue.clock.now();
        Relocator {
            queue,
            rd,
            prev_cleanup,
            start_time,
            signalled_transfer_complete: false,
            healthy_destinations: ParallelTeam::new(),
            metrics: StorageMetrics::default(),
            dest_ids: Vec::new(),
        }
    }

    fn signal_transfer_complete(&mut self) {
        if !self.signalled_transfer_complete {
            self.signalled_transfer_complete = true;
            let _ = self.queue.transfer_complete_tx.send(self.rd.clone());
        }
    }

    /// Release the read-load estimate only after the sampled metrics had a
    /// chance to absorb the move.
    fn release_read_in_flight_later(&self, read_load: i64) {
        if read_load == 0 {
            return;
        }
        let destinations = self.healthy_destinations.clone();
        let delay = self.queue.knobs.storage_metrics_average_interval;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            destinations.add_read_in_flight(-read_load);
        });
    }

    fn trace_begin(&self) {
        let mut st = self.queue.state();
        let now = self.queue.clock.now();
        if now - st.last_begin_event < 1.0 {
            st.suppressed_events += 1;
            tracing::debug!(
                relocation = %self.rd.random_id,
                range = %self.rd.keys,
                priority = self.rd.priority,
                "relocate shard begin"
            );
        } else {
            st.last_begin_event = now;
            let suppressed = st.suppressed_events;
            st.suppressed_events = 0;
            tracing::info!(
                relocation = %self.rd.random_id,
                range = %self.rd.keys,
                priority = self.rd.priority,
                suppressed_events = suppressed,
                "relocate shard begin"
            );
        }
    }

    /// Confirm the in-flight entry still belongs to this task and pin it
    /// against supersession. A mismatch means a newer relocation took the
    /// range while this task was suspended.
    fn pin_in_flight_entry(&self) -> Result<()> {
        let mut st = self.queue.state();
        let (range, entry) = st.in_flight.value_containing_mut(&self.rd.keys.begin);
        if range != self.rd.keys || entry.random_id != self.rd.random_id {
            return Err(Error::Cancelled);
        }
        entry.cancellable = false;
        Ok(())
    }

    async fn relocate(&mut self) -> Result<()> {
        let queue = self.queue.clone();
        self.trace_begin();

        if queue.knobs.shard_encode_location_metadata {
            self.pin_in_flight_entry()?;
            self.prev_cleanup.clone().await?;
            let mut st = queue.state();
            for (range, slot) in st.data_moves.intersecting(&self.rd.keys) {
                if slot.id.is_valid() && slot.id != self.rd.data_move_id {
                    tracing::warn!(
                        current = %self.rd.data_move_id,
                        conflicting = %slot.id,
                        range = %range,
                        "conflicting data move while starting relocation"
                    );
                }
            }
            st.data_moves
                .insert(&self.rd.keys, DataMoveSlot::new(self.rd.data_move_id));
        }

        self.metrics = queue.metrics.shard_metrics(self.rd.keys.clone()).await?;
        debug_assert!(!self.rd.src.is_empty());

        loop {
            let (best_teams, all_healthy, any_with_source) = self.select_teams().await?;

            // Nothing may supersede this range past this point.
            self.pin_in_flight_entry()?;

            self.dest_ids.clear();
            let mut healthy_ids: Vec<Uid> = Vec::new();
            let mut extra_ids: Vec<Uid> = Vec::new();
            let mut destination_teams: Vec<TeamDesc> = Vec::new();
            for (index, (team, has_source)) in best_teams.iter().enumerate() {
                let server_ids = team.server_ids();
                destination_teams.push(TeamDesc {
                    servers: server_ids.clone(),
                    primary: index == 0,
                });
                if all_healthy && any_with_source && !*has_source {
                    // This team sits in a region that holds no copy of the
                    // shard yet. Seed one randomly chosen member now; the
                    // rest follow in a second phase so only one copy crosses
                    // regions.
                    let pick = queue.random_index(server_ids.len());
                    self.dest_ids.push(server_ids[pick]);
                    healthy_ids.push(server_ids[pick]);
                    extra_ids.extend(
                        server_ids
                            .iter()
                            .enumerate()
                            .filter(|(j, _)| *j != pick)
                            .map(|(_, id)| *id),
                    );
                    self.healthy_destinations.add_team(team.clone());
                } else {
                    self.dest_ids.extend(server_ids.iter().copied());
                    if team.is_healthy() {
                        healthy_ids.extend(server_ids.iter().copied());
                        self.healthy_destinations.add_team(team.clone());
                    }
                }
            }

            let total_ids: usize = destination_teams.iter().map(|t| t.servers.len()).sum();
            if total_ids != queue.team_size {
                tracing::warn!(
                    expected = queue.team_size,
                    actual = total_ids,
                    "destination teams do not add up to the configured team size"
                );
            }

            if !self.rd.is_restore() {
                queue
                    .shard_tracker
                    .move_shard(&self.rd.keys, destination_teams);
            }

            self.healthy_destinations
                .add_data_in_flight(self.metrics.bytes);
            self.healthy_destinations
                .add_read_in_flight(self.metrics.bytes_read_per_ksecond);
            {
                let mut st = queue.state();
                busyness::launch_dest(&mut self.rd, &best_teams, &mut st.dest_busymap, &queue.knobs);
            }

            if queue.knobs.verbose_tracing {
                tracing::info!(
                    relocation = %self.rd.random_id,
                    range = %self.rd.keys,
                    priority = self.rd.priority,
                    bytes = self.metrics.bytes,
                    read_load = self.metrics.bytes_read_per_ksecond,
                    sources = ?self.rd.src,
                    destinations = ?self.dest_ids,
                    extra = ?extra_ids,
                    "relocate shard decision"
                );
            } else {
                tracing::debug!(
                    relocation = %self.rd.random_id,
                    destinations = ?self.dest_ids,
                    extra = ?extra_ids,
                    "relocate shard has destination"
                );
            }

            let move_result = self.drive_move(healthy_ids, extra_ids, total_ids).await;
            let read_load = self.metrics.bytes_read_per_ksecond;
            match move_result {
                Err(Error::MoveToRemovedServer) => {
                    self.healthy_destinations
                        .add_data_in_flight(-self.metrics.bytes);
                    self.release_read_in_flight_later(read_load);
                    {
                        let mut st = queue.state();
                        busyness::complete_dest(&self.rd, &mut st.dest_busymap, &queue.knobs);
                    }
                    self.rd.complete_dests.clear();
                    queue.clock.sleep(queue.knobs.retry_relocate_shard_delay).await;
                    // Back to team selection with the relocation still in
                    // flight.
                }
                Err(err) => {
                    self.healthy_destinations
                        .add_data_in_flight(-self.metrics.bytes);
                    self.release_read_in_flight_later(read_load);
                    return Err(err);
                }
                Ok(()) => {
                    // Refresh destination metrics before dropping the
                    // in-flight estimate so the two never undercount
                    // simultaneously.
                    let refreshed = self.healthy_destinations.update_storage_metrics().await;
                    self.healthy_destinations
                        .add_data_in_flight(-self.metrics.bytes);
                    self.release_read_in_flight_later(read_load);
                    refreshed?;

                    let duration = queue.clock.now() - self.start_time;
                    tracing::info!(
                        relocation = %self.rd.random_id,
                        duration,
                        "relocate shard end"
                    );
                    if duration > 600.0 {
                        tracing::warn!(
                            duration,
                            destinations = ?self.dest_ids,
                            sources = ?self.rd.src,
                            "relocation ran very long"
                        );
                    }
                    self.signal_transfer_complete();
                    {
                        let mut st = queue.state();
                        st.bytes_written += self.metrics.bytes;
                    }
                    queue.shard_tracker.finish_move(&self.rd.keys);
                    let _ = queue.relocation_complete_tx.send(self.rd.clone());
                    return Ok(());
                }
            }
        }
    }

    /// Ask every region's collection for a destination team until all report
    /// one, at least one is healthy, and none of the chosen servers is
    /// overloaded. Secondary-region answers must be ready without
    /// suspending, or the round restarts: the shard-to-team commitment may
    /// not straddle a suspension or failure events could be missed.
    async fn select_teams(&mut self) -> Result<(Vec<(TeamRef, bool)>, bool, bool)> {
        let queue = self.queue.clone();
        let mut dest_overloaded_count = 0u32;
        let mut stuck_count = 0u32;
        loop {
            let mut found_teams = true;
            let mut any_healthy = false;
            let mut all_healthy = true;
            let mut any_with_source = false;
            let mut best_teams: Vec<(TeamRef, bool)> = Vec::new();

            for (index, collection) in queue.team_collections.iter().enumerate() {
                let restore_dest = if queue.knobs.shard_encode_location_metadata {
                    self.rd.data_move.as_ref().map(|meta| {
                        if index == 0 {
                            meta.primary_dest.clone()
                        } else {
                            meta.remote_dest.clone()
                        }
                    })
                } else {
                    None
                };
                let request = match &restore_dest {
                    Some(servers) => GetTeamRequest::exact(servers.clone()),
                    None => GetTeamRequest {
                        want_new_servers: self.rd.wants_new_servers,
                        want_true_best: is_valley_filler_priority(self.rd.priority),
                        prefer_lower_disk_util: true,
                        team_must_have_shards: false,
                        for_read_balance: self.rd.reason == RelocateReason::RebalanceRead,
                        prefer_lower_read_util: true,
                        inflight_penalty: inflight_penalty(self.rd.health_priority, &queue.knobs),
                        src: self.rd.src.clone(),
                        complete_sources: self.rd.complete_sources.clone(),
                        exact_servers: None,
                    },
                };

                let mut fut = collection.get_team(request);
                let reply = match futures_util::poll!(&mut fut) {
                    std::task::Poll::Ready(reply) => reply?,
                    std::task::Poll::Pending => {
                        if index > 0 {
                            tracing::debug!(
                                team_collection = index,
                                "secondary region team not immediately ready"
                            );
                            found_teams = false;
                            break;
                        }
                        fut.await?
                    }
                };

                if restore_dest.is_some() {
                    match reply.team {
                        Some(team) if team.is_healthy() => {
                            any_healthy = true;
                            best_teams.push((team, reply.has_source_member));
                        }
                        _ => {
                            found_teams = false;
                            break;
                        }
                    }
                } else {
                    match reply.team {
                        // A region without a healthy candidate blocks the
                        // whole round until it recovers or is excluded.
                        None => {
                            found_teams = false;
                            break;
                        }
                        Some(team) => {
                            if team.is_healthy() {
                                any_healthy = true;
                            } else {
                                all_healthy = false;
                            }
                            if reply.has_source_member {
                                any_with_source = true;
                            }
                            best_teams.push((team, reply.has_source_member));
                        }
                    }
                }
            }

            let any_dest_overloaded = {
                let st = queue.state();
                !busyness::can_launch_dest(
                    &best_teams,
                    self.rd.priority,
                    &st.dest_busymap,
                    &queue.knobs,
                )
            };

            if found_teams && any_healthy && !any_dest_overloaded {
                debug_assert!(self.rd.complete_dests.is_empty());
                return Ok((best_teams, all_healthy, any_with_source));
            }

            if any_dest_overloaded {
                dest_overloaded_count += 1;
                tracing::debug!(
                    relocation = %self.rd.random_id,
                    stuck_count,
                    dest_overloaded_count,
                    "destination servers too busy"
                );
                queue.clock.sleep(queue.knobs.dest_overloaded_delay).await;
            } else {
                stuck_count += 1;
                if stuck_count > 50 {
                    tracing::warn!(
                        relocation = %self.rd.random_id,
                        stuck_count,
                        dest_overloaded_count,
                        "no healthy destination team found"
                    );
                } else {
                    tracing::debug!(
                        relocation = %self.rd.random_id,
                        stuck_count,
                        dest_overloaded_count,
                        "no healthy destination team yet"
                    );
                }
                if self.rd.is_restore() && stuck_count > 50 {
                    return Err(Error::DestTeamNotFound);
                }
                queue.clock.sleep(queue.knobs.best_team_stuck_delay).await;
            }
        }
    }

    fn start_move(
        &self,
        dest_ids: Vec<Uid>,
        healthy_ids: Vec<Uid>,
        data_movement_complete: Option<oneshot::Sender<()>>,
    ) -> BoxFuture<'static, Result<()>> {
        let queue = self.queue.clone();
        let request = MoveKeysRequest {
            data_move_id: self.rd.data_move_id,
            range: self.rd.keys.clone(),
            dest_ids,
            healthy_ids,
            data_movement_complete,
            start_lock: queue.start_move_lock.clone(),
            finish_lock: queue.finish_move_lock.clone(),
            cross_dc: queue.team_collections.len() > 1,
            relocation_id: self.rd.random_id,
            cancel_conflicting: false,
        };
        async move { queue.mover.move_keys(request).await }.boxed()
    }

    /// Run the transactional move, polling destination health alongside it.
    /// The transfer-complete signal fires once, on whichever comes first:
    /// destinations reporting the data readable, destinations going
    /// unhealthy, or the whole move finishing.
    async fn drive_move(
        &mut self,
        mut healthy_ids: Vec<Uid>,
        mut extra_ids: Vec<Uid>,
        total_ids: usize,
    ) -> Result<()> {
        let queue = self.queue.clone();
        let (dmc_tx, mut dmc_rx) = oneshot::channel::<()>();
        let mut move_fut = self.start_move(self.dest_ids.clone(), healthy_ids.clone(), Some(dmc_tx));
        let mut poll_health: BoxFuture<'static, ()> = if self.signalled_transfer_complete {
            futures_util::future::pending().boxed()
        } else {
            tokio::time::sleep(queue.knobs.health_poll_time).boxed()
        };
        let mut dmc_live = true;

        loop {
            tokio::select! {
                result = &mut move_fut => {
                    result?;
                    if !extra_ids.is_empty() {
                        // Second phase of a cross-region seed move: fan out
                        // to the rest of the new region's team.
                        self.dest_ids.extend(extra_ids.iter().copied());
                        healthy_ids.extend(extra_ids.iter().copied());
                        extra_ids.clear();
                        debug_assert_eq!(total_ids, self.dest_ids.len());
                        move_fut = self.start_move(self.dest_ids.clone(), healthy_ids.clone(), None);
                    } else {
                        let mut st = queue.state();
                        st.fetch_keys_complete.insert(self.rd.clone());
                        if queue.knobs.shard_encode_location_metadata {
                            let ranges = st.data_moves.affected_ranges_after_insertion(&self.rd.keys);
                            let aligned = ranges.len() == 1 && ranges[0] == self.rd.keys;
                            let ours = {
                                let (_, slot) = st.data_moves.range_containing(&self.rd.keys.begin);
                                slot.id == self.rd.data_move_id && slot.cancel.is_none()
                            };
                            if aligned && ours {
                                st.data_moves.insert(&self.rd.keys, DataMoveSlot::default());
                                tracing::trace!(
                                    data_move = %self.rd.data_move_id,
                                    range = %self.rd.keys,
                                    "data move dequeued on success"
                                );
                            }
                        }
                        return Ok(());
                    }
                }
                _ = &mut poll_health => {
                    if !self.healthy_destinations.is_healthy() {
                        self.signal_transfer_complete();
                    }
                    poll_health = if self.signalled_transfer_complete {
                        futures_util::future::pending().boxed()
                    } else {
                        tokio::time::sleep(queue.knobs.health_poll_time).boxed()
                    };
                }
                received = &mut dmc_rx, if dmc_live && !self.signalled_transfer_complete => {
                    dmc_live = false;
                    if received.is_ok() {
                        {
                            let mut st = queue.state();
                            st.fetch_keys_complete.insert(self.rd.clone());
                        }
                        self.signal_transfer_complete();
                    }
                }
            }
        }
    }

    /// Error-path epilogue, mirroring the success path's completion
    /// messages so the main loop's bookkeeping always balances.
    async fn finish(&mut self, result: Result<()>) {
        let err = match result {
            Ok(()) => return,
            Err(err) => err,
        };
        let queue = self.queue.clone();
        let duration = queue.clock.now() - self.start_time;
        if matches!(err, Error::Cancelled) {
            tracing::debug!(
                relocation = %self.rd.random_id,
                duration,
                "relocate shard cancelled"
            );
        } else {
            tracing::info!(
                relocation = %self.rd.random_id,
                error = %err,
                duration,
                "relocate shard end"
            );
        }
        if duration > 600.0 {
            tracing::warn!(
                duration,
                destinations = ?self.dest_ids,
                sources = ?self.rd.src,
                "relocation ran very long"
            );
        }
        if !self.signalled_transfer_complete {
            let _ = queue.transfer_complete_tx.send(self.rd.clone());
        }
        let _ = queue.relocation_complete_tx.send(self.rd.clone());

        if matches!(err, Error::DestTeamNotFound) {
            if let Err(cleanup_err) = queue.clone().cancel_data_move(self.rd.keys.clone()).await {
                tracing::warn!(
                    error = %cleanup_err,
                    range = %self.rd.keys,
                    "data move cleanup after failed restore"
                );
            }
        }
        if !err.is_silent() {
            let _ = queue.error_tx.send(err);
        }
    }
}
