//! Queue error taxonomy.
//!
//! Only a handful of failures carry meaning for control flow: a destination
//! dropping out mid-move (retry team selection), a restore that cannot find
//! its fixed destination (cancel the durable move and surface), and the two
//! silent outcomes (cooperative cancellation, superseded data move). The
//! variants are cheap to clone so shared cleanup futures can fan the same
//! result out to several waiters.

use std::sync::Arc;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Clone, Debug, thiserror::Error)]
pub enum Error {
    /// A destination server was removed while keys were moving to it. The
    /// relocation stays in flight and re-selects teams after a delay.
    #[error("destination server removed during move")]
    MoveToRemovedServer,

    /// Restoring a durable move, but its recorded destination team could not
    /// be produced after repeated attempts.
    #[error("no destination team found for restored data move")]
    DestTeamNotFound,

    /// The durable move was superseded or administratively cancelled. Not
    /// surfaced.
    #[error("data move cancelled")]
    DataMoveCancelled,

    /// Cooperative task cancellation. Not surfaced.
    #[error("task cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(Arc<anyhow::Error>),
}

impl Error {
    /// True for outcomes that terminate a task without being reported.
    pub fn is_silent(&self) -> bool {
        matches!(self, Error::Cancelled | Error::DataMoveCancelled)
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Error::Other(Arc::new(err))
    }
}
