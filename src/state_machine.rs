//! The replicated state machine interface.

use crate::raft_types::SnapshotMeta;
use crate::AppData;

/// A trait defining the hooks through which the replication core drives the
/// application's replicated state machine.
///
/// All hooks are invoked synchronously on the thread executing the
/// replication flow, in log order. Because a follower may receive the same
/// entries again after a leader retry, `pre_commit` and `rollback` **must be
/// idempotent**: re-applying the same `(index, data)` pair twice must leave
/// the state machine in the same state.
pub trait StateMachine<D: AppData>: Send + Sync + 'static {
    /// An entry has been logged at `index` but is not yet committed. It may
    /// later be reverted through `rollback` if the leader overwrites it.
    fn pre_commit(&self, index: u64, data: &D);

    /// The pre-committed entry at `index` is being overwritten by a
    /// conflicting entry from a newer leader; undo its effects.
    fn rollback(&self, index: u64, data: &D);

    /// The entry at `index` is committed cluster-wide; apply it.
    fn commit(&self, index: u64, data: &D);

    /// Metadata of the newest snapshot held by the state machine, if any.
    ///
    /// The leader consults this when a follower has fallen behind the start
    /// of the log; the follower consults it when checking log-matching at
    /// the snapshot boundary.
    fn last_snapshot(&self) -> Option<SnapshotMeta>;
}
