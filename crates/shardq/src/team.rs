//! Destination teams and the selection interface.
//!
//! The queue never builds teams itself; it asks one `TeamCollection` per
//! region for the best candidate and treats the result through the
//! `StorageTeam` capability set. `ParallelTeam` folds the per-region picks
//! into a single destination view for in-flight accounting and health
//! polling.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::try_join_all;

use crate::error::Result;
use crate::ids::Uid;
use crate::keyspace::KeyRange;

/// Capability set of one replica group of storage servers.
#[async_trait]
pub trait StorageTeam: Send + Sync {
    /// Member ids, by value; composites rebuild the list per call.
    fn server_ids(&self) -> Vec<Uid>;
    fn size(&self) -> usize;
    fn desc(&self) -> String;

    fn is_healthy(&self) -> bool;
    fn is_optimal(&self) -> bool;
    fn is_wrong_configuration(&self) -> bool;
    fn has_healthy_available_space(&self, min_ratio: f64) -> bool;

    fn load_bytes(&self, include_in_flight: bool, inflight_penalty: f64) -> i64;
    fn read_load(&self, include_in_flight: bool, inflight_penalty: f64) -> f64;
    fn data_in_flight(&self) -> i64;
    fn read_in_flight(&self) -> i64;
    fn min_available_space(&self, include_in_flight: bool) -> i64;
    fn min_available_space_ratio(&self, include_in_flight: bool) -> f64;
    fn priority(&self) -> i32;

    fn add_data_in_flight(&self, delta: i64);
    fn add_read_in_flight(&self, delta: i64);
    fn set_healthy(&self, healthy: bool);
    fn set_wrong_configuration(&self, wrong: bool);
    fn set_priority(&self, priority: i32);
    fn add_servers(&self, servers: &[Uid]);

    async fn update_storage_metrics(&self) -> Result<()>;
}

pub type TeamRef = Arc<dyn StorageTeam>;

/// Options for one best-team query.
#[derive(Clone, Debug)]
pub struct GetTeamRequest {
    /// Exclude teams containing any current source server.
    pub want_new_servers: bool,
    /// Return the globally best-scoring team, not a sampled candidate.
    pub want_true_best: bool,
    pub prefer_lower_disk_util: bool,
    /// Restrict to teams already serving data.
    pub team_must_have_shards: bool,
    /// Score by read bandwidth instead of disk.
    pub for_read_balance: bool,
    pub prefer_lower_read_util: bool,
    /// Multiplier applied to in-flight load when scoring.
    pub inflight_penalty: f64,
    /// Origin hints for source-aware scoring.
    pub src: Vec<Uid>,
    pub complete_sources: Vec<Uid>,
    /// Ask for the team made of exactly these servers (restores).
    pub exact_servers: Option<Vec<Uid>>,
}

impl Default for GetTeamRequest {
    fn default() -> Self {
        GetTeamRequest {
            want_new_servers: false,
            want_true_best: false,
            prefer_lower_disk_util: false,
            team_must_have_shards: false,
            for_read_balance: false,
            prefer_lower_read_util: false,
            inflight_penalty: 1.0,
            src: Vec::new(),
            complete_sources: Vec::new(),
            exact_servers: None,
        }
    }
}

impl GetTeamRequest {
    pub fn exact(servers: Vec<Uid>) -> Self {
        GetTeamRequest {
            exact_servers: Some(servers),
            ..GetTeamRequest::default()
        }
    }
}

/// Reply to a best-team query.
#[derive(Clone)]
pub struct TeamReply {
    pub team: Option<TeamRef>,
    /// True if the returned team already hosts part of the queried shard's
    /// source data.
    pub has_source_member: bool,
}

/// One per region; answers best-team queries.
#[async_trait]
pub trait TeamCollection: Send + Sync {
    async fn get_team(&self, req: GetTeamRequest) -> Result<TeamReply>;
}

/// A team as tracked by the shard-to-team failure bookkeeping.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TeamDesc {
    pub servers: Vec<Uid>,
    pub primary: bool,
}

/// Shard-to-team assignment bookkeeping shared with the team builder. The
/// relocator records intended moves here before the transactional rewrite so
/// server failures during the move reach the right shards.
pub trait ShardTracker: Send + Sync {
    fn move_shard(&self, range: &KeyRange, teams: Vec<TeamDesc>);
    fn finish_move(&self, range: &KeyRange);
    fn shards_for(&self, team: &TeamDesc) -> Vec<KeyRange>;
}

/// Composite over the per-region destination teams of one relocation.
/// Reads aggregate (sums, mins, conjunctions); writes broadcast.
#[derive(Clone, Default)]
pub struct ParallelTeam {
    teams: Vec<TeamRef>,
}

impl ParallelTeam {
    pub fn new() -> Self {
        ParallelTeam { teams: Vec::new() }
    }

    pub fn add_team(&mut self, team: TeamRef) {
        self.teams.push(team);
    }

    pub fn clear(&mut self) {
        self.teams.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.teams.is_empty()
    }

    fn all(&self, f: impl Fn(&dyn StorageTeam) -> bool) -> bool {
        self.teams.iter().all(|t| f(t.as_ref()))
    }

    fn any(&self, f: impl Fn(&dyn StorageTeam) -> bool) -> bool {
        self.teams.iter().any(|t| f(t.as_ref()))
    }
}

#[async_trait]
impl StorageTeam for ParallelTeam {
    fn server_ids(&self) -> Vec<Uid> {
        self.teams.iter().flat_map(|t| t.server_ids()).collect()
    }

    fn size(&self) -> usize {
        self.teams.iter().map(|t| t.size()).sum()
    }

    fn desc(&self) -> String {
        self.teams
            .iter()
            .map(|t| t.desc())
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn is_healthy(&self) -> bool {
        self.all(|t| t.is_healthy())
    }

    fn is_optimal(&self) -> bool {
        self.all(|t| t.is_optimal())
    }

    fn is_wrong_configuration(&self) -> bool {
        self.any(|t| t.is_wrong_configuration())
    }

    fn has_healthy_available_space(&self, min_ratio: f64) -> bool {
        self.all(|t| t.has_healthy_available_space(min_ratio))
    }

    fn load_bytes(&self, include_in_flight: bool, inflight_penalty: f64) -> i64 {
        self.teams
            .iter()
            .map(|t| t.load_bytes(include_in_flight, inflight_penalty))
            .sum()
    }

    fn read_load(&self, include_in_flight: bool, inflight_penalty: f64) -> f64 {
        self.teams
            .iter()
            .map(|t| t.read_load(include_in_flight, inflight_penalty))
            .sum()
    }

    fn data_in_flight(&self) -> i64 {
        self.teams.iter().map(|t| t.data_in_flight()).sum()
    }

    fn read_in_flight(&self) -> i64 {
        self.teams.iter().map(|t| t.read_in_flight()).sum()
    }

    fn min_available_space(&self, include_in_flight: bool) -> i64 {
        self.teams
            .iter()
            .map(|t| t.min_available_space(include_in_flight))
            .min()
            .unwrap_or(i64::MAX)
    }

    fn min_available_space_ratio(&self, include_in_flight: bool) -> f64 {
        self.teams
            .iter()
            .map(|t| t.min_available_space_ratio(include_in_flight))
            .fold(f64::MAX, f64::min)
    }

    fn priority(&self) -> i32 {
        self.teams.iter().map(|t| t.priority()).max().unwrap_or(0)
    }

    fn add_data_in_flight(&self, delta: i64) {
        for team in &self.teams {
            team.add_data_in_flight(delta);
        }
    }

    fn add_read_in_flight(&self, delta: i64) {
        for team in &self.teams {
            team.add_read_in_flight(delta);
        }
    }

    fn set_healthy(&self, healthy: bool) {
        for team in &self.teams {
            team.set_healthy(healthy);
        }
    }

    fn set_wrong_configuration(&self, wrong: bool) {
        for team in &self.teams {
            team.set_wrong_configuration(wrong);
        }
    }

    fn set_priority(&self, priority: i32) {
        for team in &self.teams {
            team.set_priority(priority);
        }
    }

    fn add_servers(&self, servers: &[Uid]) {
        // Membership edits go to the primary region's team.
        if let Some(first) = self.teams.first() {
            first.add_servers(servers);
        }
    }

    async fn update_storage_metrics(&self) -> Result<()> {
        try_join_all(self.teams.iter().map(|t| t.update_storage_metrics())).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

    #[derive(Default)]
    struct FakeTeam {
        ids: Vec<Uid>,
        bytes: i64,
        space: i64,
        healthy: AtomicBool,
        in_flight: AtomicI64,
    }

    impl FakeTeam {
        fn new(ids: Vec<u64>, bytes: i64, space: i64, healthy: bool) -> Arc<Self> {
            Arc::new(FakeTeam {
                ids: ids.into_iter().map(|i| Uid::from_parts(i, 0)).collect(),
                bytes,
                space,
                healthy: AtomicBool::new(healthy),
                in_flight: AtomicI64::new(0),
            })
        }
    }

    #[async_trait]
    impl StorageTeam for FakeTeam {
        fn server_ids(&self) -> Vec<Uid> {
            self.ids.clone()
        }
        fn size(&self) -> usize {
            self.ids.len()
        }
        fn desc(&self) -> String {
            format!("fake:{}", self.ids.len())
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
        fn load_bytes(&self, _inflight: bool, _penalty: f64) -> i64 {
            self.bytes
        }
        fn read_load(&self, _inflight: bool, _penalty: f64) -> f64 {
            0.0
        }
        fn data_in_flight(&self) -> i64 {
            self.in_flight.load(Ordering::Relaxed)
        }
        fn read_in_flight(&self) -> i64 {
            0
        }
        fn min_available_space(&self, _inflight: bool) -> i64 {
            self.space
        }
        fn min_available_space_ratio(&self, _inflight: bool) -> f64 {
            0.5
        }
        fn priority(&self) -> i32 {
            0
        }
        fn add_data_in_flight(&self, delta: i64) {
            self.in_flight.fetch_add(delta, Ordering::Relaxed);
        }
        fn add_read_in_flight(&self, _delta: i64) {}
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

    #[tokio::test]
    async fn composite_aggregates_and_broadcasts() {
        let a = FakeTeam::new(vec![1, 2, 3], 100, 50, true);
        let b = FakeTeam::new(vec![4, 5, 6], 40, 20, true);
        let mut composite = ParallelTeam::new();
        composite.add_team(a.clone());
        composite.add_team(b.clone());

        assert_eq!(composite.size(), 6);
        assert_eq!(composite.server_ids().len(), 6);
        assert_eq!(composite.load_bytes(true, 1.0), 140);
        assert_eq!(composite.min_available_space(true), 20);
        assert!(composite.is_healthy());

        composite.add_data_in_flight(10);
        assert_eq!(a.data_in_flight(), 10);
        assert_eq!(b.data_in_flight(), 10);

        b.set_healthy(false);
        assert!(!composite.is_healthy());
        composite.update_storage_metrics().await.unwrap();
    }
}
