//! Per-range background task tracking.
//!
//! Relocators and source fetches are spawned tasks keyed by the key range
//! they act on. Inserting a task for a range must be able to cancel every
//! task previously spanning that range, and a split entry keeps pointing at
//! the task that still covers it. Cancellation is signalled through a
//! `CancellationToken`; the task observes it at its next suspension point.

use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;

use crate::keyspace::{terminal_key, Key, KeyRange};
use crate::range_map::RangeMap;

/// Handle to one spawned task: a cooperative cancellation signal plus the
/// runtime handle used to observe liveness.
#[derive(Clone)]
pub struct TaskSlot {
    token: CancellationToken,
    abort: AbortHandle,
}

impl TaskSlot {
    pub fn new(token: CancellationToken, abort: AbortHandle) -> Self {
        TaskSlot { token, abort }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_live(&self) -> bool {
        !self.abort.is_finished()
    }
}

/// Key-range map of task slots. Splitting an entry clones the slot, so the
/// same task may be referenced from several adjacent ranges until a span
/// cancellation clears them all.
pub struct TaskRangeMap {
    map: RangeMap<Option<TaskSlot>>,
}

impl TaskRangeMap {
    pub fn new() -> Self {
        TaskRangeMap {
            map: RangeMap::new(None),
        }
    }

    /// Track `slot` for `range`. Callers cancel the affected span first; a
    /// plain insert leaves split-off neighbors pointing at their old task.
    pub fn insert(&mut self, range: &KeyRange, slot: TaskSlot) {
        self.map.insert(range, Some(slot));
    }

    /// Signal cancellation to every task intersecting `range` and clear the
    /// range.
    pub fn cancel(&mut self, range: &KeyRange) {
        self.map.for_each_intersecting_mut(range, |_, slot| {
            if let Some(task) = slot {
                task.cancel();
            }
        });
        self.map.insert(range, None);
    }

    /// True if a still-running task is tracked at `key`.
    pub fn live_task_at(&self, key: &Key) -> bool {
        matches!(self.map.range_containing(key).1, Some(slot) if slot.is_live())
    }

    /// The ranges a tracked-task insertion at `range` would touch: the range
    /// itself, plus the truncated head and tail of any straddling entry that
    /// actually holds a task. Untracked keyspace on either side is not
    /// affected.
    pub fn ranges_affected_by_insertion(&self, range: &KeyRange) -> Vec<KeyRange> {
        if range.is_empty() {
            return Vec::new();
        }
        let mut out = Vec::with_capacity(3);
        let (head, slot) = self.map.range_containing(&range.begin);
        if head.begin != range.begin && slot.is_some() {
            out.push(KeyRange::new(head.begin, range.begin.clone()));
        }
        out.push(range.clone());
        if range.end < terminal_key() {
            let (tail, slot) = self.map.range_containing(&range.end);
            if tail.begin != range.end && slot.is_some() {
                out.push(KeyRange::new(range.end.clone(), tail.end));
            }
        }
        out
    }
}

impl Default for TaskRangeMap {
    fn default() -> Self {
        Self::new()
    }
}
