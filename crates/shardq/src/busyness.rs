//! Per-server workload ledgers and admission control.
//!
//! Work is measured in fixed-point units of a server's full capacity
//! (`WORK_FULL_UTILIZATION` == 100%). A server's ledger keeps one cumulative
//! counter per priority band: adding work at priority `p` charges every band
//! at or below `p / 100`, so low-priority work sees a server as busy while
//! high-priority work can still be admitted on top of it. The ledger is by
//! construction non-increasing across bands and never negative.

use std::collections::HashMap;
use std::fmt;

use crate::ids::Uid;
use crate::knobs::Knobs;
use crate::priority::{PRIORITY_TEAM_0_LEFT, PRIORITY_TEAM_1_LEFT, PRIORITY_TEAM_2_LEFT};
use crate::relocation::RelocateData;
use crate::team::TeamRef;

/// Fixed-point scaling factor: one server's full capacity.
pub const WORK_FULL_UTILIZATION: i32 = 10_000;

const BANDS: usize = 10;

/// Cumulative committed work on one server, bucketed by priority band.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Busyness {
    ledger: [i32; BANDS],
}

impl Busyness {
    pub fn new() -> Self {
        Busyness::default()
    }

    /// Whether `work` more units fit at `priority` without exceeding full
    /// utilization for that band.
    pub fn can_launch(&self, priority: i32, work: i32) -> bool {
        debug_assert!((1..1000).contains(&priority));
        let band = (priority / 100) as usize;
        self.ledger[band] <= WORK_FULL_UTILIZATION - work
    }

    pub fn add_work(&mut self, priority: i32, work: i32) {
        debug_assert!((1..1000).contains(&priority));
        let band = (priority / 100) as usize;
        for entry in &mut self.ledger[..=band] {
            *entry += work;
        }
    }

    pub fn remove_work(&mut self, priority: i32, work: i32) {
        self.add_work(priority, -work);
    }

    pub fn ledger(&self) -> &[i32] {
        &self.ledger
    }
}

impl fmt::Display for Busyness {
    /// Compact rendering collapsing equal adjacent bands, e.g.
    /// `100/600=0.50 (5000/10000), 700/900=0.00 (0/10000)`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut i = 1;
        let mut first = true;
        while i < BANDS {
            let mut j = i + 1;
            while j < BANDS && self.ledger[i] == self.ledger[j] {
                j += 1;
            }
            if !first {
                write!(f, ", ")?;
            }
            first = false;
            if i + 1 == j {
                write!(f, "{:03}", i * 100)?;
            } else {
                write!(f, "{:03}/{:03}", i * 100, (j - 1) * 100)?;
            }
            write!(
                f,
                "={:.2} ({}/{})",
                self.ledger[i] as f64 / WORK_FULL_UTILIZATION as f64,
                self.ledger[i],
                WORK_FULL_UTILIZATION
            )?;
            i = j;
        }
        Ok(())
    }
}

/// Work one source server contributes to `relocation` were it launched now.
/// Health emergencies spread across fewer surviving servers and therefore
/// count heavier.
pub fn src_work_factor(relocation: &RelocateData, single_region_team_size: usize, knobs: &Knobs) -> i32 {
    let parallelism = knobs.relocation_parallelism_per_source_server;
    if relocation.health_priority == PRIORITY_TEAM_1_LEFT
        || relocation.health_priority == PRIORITY_TEAM_0_LEFT
    {
        WORK_FULL_UTILIZATION / parallelism
    } else if relocation.health_priority == PRIORITY_TEAM_2_LEFT {
        WORK_FULL_UTILIZATION / 2 / parallelism
    } else {
        WORK_FULL_UTILIZATION / single_region_team_size.max(1) as i32 / parallelism
    }
}

/// Moving a shard loads destination servers evenly.
pub fn dest_work_factor(knobs: &Knobs) -> i32 {
    WORK_FULL_UTILIZATION / knobs.relocation_parallelism_per_dest_server.max(1)
}

/// Source admission: enough source servers must be able to absorb the move's
/// work factor at its priority. Work belonging to in-flight relocations that
/// this launch would cancel is refunded before the check.
pub fn can_launch_src(
    relocation: &RelocateData,
    team_size: usize,
    single_region_team_size: usize,
    busymap: &HashMap<Uid, Busyness>,
    cancellable_relocations: &[RelocateData],
    knobs: &Knobs,
) -> bool {
    debug_assert_eq!(relocation.work_factor, 0);
    debug_assert!(!relocation.src.is_empty());
    debug_assert!(team_size >= single_region_team_size);

    let work_factor = src_work_factor(relocation, single_region_team_size, knobs);
    let mut needed = relocation
        .src
        .len()
        .min(team_size - single_region_team_size + 1);
    if knobs.use_old_needed_servers {
        needed = 1usize.max(relocation.src.len().saturating_sub(team_size - 1));
    }

    for server in &relocation.src {
        let mut busy = busymap.get(server).cloned().unwrap_or_default();
        for cancelled in cancellable_relocations {
            if cancelled.src.contains(server) {
                busy.remove_work(cancelled.priority, cancelled.work_factor);
            }
        }
        if busy.can_launch(relocation.priority, work_factor) {
            needed -= 1;
            if needed == 0 {
                return true;
            }
        }
    }
    false
}

/// Destination admission: every server of every candidate team must absorb
/// the destination work factor. Disabled when destination parallelism is
/// configured non-positive.
pub fn can_launch_dest(
    candidate_teams: &[(TeamRef, bool)],
    priority: i32,
    dest_busymap: &HashMap<Uid, Busyness>,
    knobs: &Knobs,
) -> bool {
    if knobs.relocation_parallelism_per_dest_server <= 0 {
        return true;
    }
    let work_factor = dest_work_factor(knobs);
    for (team, _) in candidate_teams {
        for id in team.server_ids() {
            let admitted = dest_busymap
                .get(&id)
                .map(|b| b.can_launch(priority, work_factor))
                .unwrap_or(true);
            if !admitted {
                return false;
            }
        }
    }
    true
}

/// Commit the relocation's work factor onto its source servers.
pub fn launch_src(
    relocation: &mut RelocateData,
    busymap: &mut HashMap<Uid, Busyness>,
    single_region_team_size: usize,
    knobs: &Knobs,
) {
    relocation.work_factor = src_work_factor(relocation, single_region_team_size, knobs);
    for server in &relocation.src {
        busymap
            .entry(*server)
            .or_default()
            .add_work(relocation.priority, relocation.work_factor);
    }
}

/// Record the chosen destination servers and charge them.
pub fn launch_dest(
    relocation: &mut RelocateData,
    candidate_teams: &[(TeamRef, bool)],
    dest_busymap: &mut HashMap<Uid, Busyness>,
    knobs: &Knobs,
) {
    debug_assert!(relocation.complete_dests.is_empty());
    let work_factor = dest_work_factor(knobs);
    for (team, _) in candidate_teams {
        for id in team.server_ids() {
            relocation.complete_dests.push(id);
            dest_busymap
                .entry(id)
                .or_default()
                .add_work(relocation.priority, work_factor);
        }
    }
}

/// Refund the destination charge.
pub fn complete_dest(
    relocation: &RelocateData,
    dest_busymap: &mut HashMap<Uid, Busyness>,
    knobs: &Knobs,
) {
    let work_factor = dest_work_factor(knobs);
    for id in &relocation.complete_dests {
        if let Some(busy) = dest_busymap.get_mut(id) {
            busy.remove_work(relocation.priority, work_factor);
        }
    }
}

/// Refund both sides once the data transfer is done.
pub fn complete(
    relocation: &RelocateData,
    busymap: &mut HashMap<Uid, Busyness>,
    dest_busymap: &mut HashMap<Uid, Busyness>,
    knobs: &Knobs,
) {
    debug_assert!(relocation.work_factor > 0);
    for server in &relocation.src {
        if let Some(busy) = busymap.get_mut(server) {
            busy.remove_work(relocation.priority, relocation.work_factor);
        }
    }
    complete_dest(relocation, dest_busymap, knobs);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::priority::{PRIORITY_REBALANCE_UNDERUTILIZED, PRIORITY_TEAM_UNHEALTHY};

    fn uid(n: u64) -> Uid {
        Uid::from_parts(n, 0)
    }

    #[test]
    fn add_then_remove_restores_ledger() {
        let mut busy = Busyness::new();
        let before = busy.clone();
        busy.add_work(PRIORITY_TEAM_UNHEALTHY, 2500);
        assert_ne!(busy, before);
        busy.remove_work(PRIORITY_TEAM_UNHEALTHY, 2500);
        assert_eq!(busy, before);
    }

    #[test]
    fn ledger_is_cumulative_and_non_increasing() {
        let mut busy = Busyness::new();
        busy.add_work(PRIORITY_TEAM_UNHEALTHY, 3000);
        busy.add_work(PRIORITY_REBALANCE_UNDERUTILIZED, 1000);
        let ledger = busy.ledger();
        for pair in ledger.windows(2) {
            assert!(pair[0] >= pair[1]);
        }
        // Rebalance work is invisible to the unhealthy band.
        assert!(busy.can_launch(PRIORITY_TEAM_UNHEALTHY, 7000));
        assert!(!busy.can_launch(PRIORITY_REBALANCE_UNDERUTILIZED, 7000));
    }

    #[test]
    fn can_launch_is_inclusive_at_the_boundary() {
        let mut busy = Busyness::new();
        busy.add_work(PRIORITY_TEAM_UNHEALTHY, 4000);
        assert!(busy.can_launch(PRIORITY_TEAM_UNHEALTHY, 6000));
        assert!(!busy.can_launch(PRIORITY_TEAM_UNHEALTHY, 6001));
    }

    #[test]
    fn source_admission_needs_one_server_with_headroom() {
        // Replication 3, one region: a single free source server suffices.
        let mut knobs = Knobs::default();
        knobs.relocation_parallelism_per_source_server = 1;
        let mut rd = RelocateData {
            src: vec![uid(1), uid(2), uid(3)],
            priority: PRIORITY_TEAM_2_LEFT,
            health_priority: PRIORITY_TEAM_2_LEFT,
            ..RelocateData::default()
        };
        rd.work_factor = 0;

        let mut busymap = HashMap::new();
        let mut busy_a = Busyness::new();
        busy_a.add_work(PRIORITY_TEAM_2_LEFT, 6000);
        busymap.insert(uid(1), busy_a);
        let mut busy_b = Busyness::new();
        busy_b.add_work(PRIORITY_TEAM_2_LEFT, 4000);
        busymap.insert(uid(2), busy_b);
        busymap.insert(uid(3), Busyness::new());

        assert_eq!(src_work_factor(&rd, 3, &knobs), 5000);
        assert!(can_launch_src(&rd, 3, 3, &busymap, &[], &knobs));

        for server in [uid(2), uid(3)] {
            busymap
                .get_mut(&server)
                .unwrap()
                .add_work(PRIORITY_TEAM_2_LEFT, 6000);
        }
        busymap
            .get_mut(&uid(2))
            .unwrap()
            .remove_work(PRIORITY_TEAM_2_LEFT, 4000);
        assert!(!can_launch_src(&rd, 3, 3, &busymap, &[], &knobs));
    }

    #[test]
    fn cancellable_work_is_refunded_before_admission() {
        use crate::priority::PRIORITY_REBALANCE_OVERUTILIZED;

        let mut knobs = Knobs::default();
        knobs.relocation_parallelism_per_source_server = 1;
        let rd = RelocateData {
            src: vec![uid(1)],
            priority: PRIORITY_REBALANCE_OVERUTILIZED,
            ..RelocateData::default()
        };
        let mut busymap = HashMap::new();
        let mut busy = Busyness::new();
        busy.add_work(PRIORITY_REBALANCE_UNDERUTILIZED, 8000);
        busymap.insert(uid(1), busy);

        // Without the refund the server is too busy at work factor 10000/3.
        let cancelled = RelocateData {
            src: vec![uid(1)],
            priority: PRIORITY_REBALANCE_UNDERUTILIZED,
            work_factor: 8000,
            ..RelocateData::default()
        };
        assert!(!can_launch_src(&rd, 3, 3, &busymap, &[], &knobs));
        assert!(can_launch_src(&rd, 3, 3, &busymap, &[cancelled], &knobs));
    }

    #[test]
    fn idle_sources_admit_any_priority() {
        let knobs = Knobs::default();
        let rd = RelocateData {
            src: vec![uid(1), uid(2), uid(3)],
            priority: PRIORITY_REBALANCE_UNDERUTILIZED,
            ..RelocateData::default()
        };
        let busymap = HashMap::new();
        assert!(can_launch_src(&rd, 3, 3, &busymap, &[], &knobs));
    }

    #[test]
    fn dest_admission_disabled_when_parallelism_non_positive() {
        let mut knobs = Knobs::default();
        knobs.relocation_parallelism_per_dest_server = 0;
        assert!(can_launch_dest(&[], 100, &HashMap::new(), &knobs));
    }

    #[test]
    fn display_collapses_equal_bands() {
        let mut busy = Busyness::new();
        busy.add_work(250, 5000);
        let rendered = busy.to_string();
        assert!(rendered.contains("100/200"), "{rendered}");
        assert!(rendered.contains("=0.50"), "{rendered}");
    }
}
