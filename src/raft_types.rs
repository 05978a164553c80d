use std::fmt;

use serde::Deserialize;
use serde::Serialize;

/// The identity of a raft log.
/// A term and an index identifies a log entry globally.
#[derive(Debug, Default, Clone, Copy, PartialOrd, Ord, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogId {
    pub term: u64,
    pub index: u64,
}

impl LogId {
    pub fn new(term: u64, index: u64) -> Self {
        Self { term, index }
    }
}

impl fmt::Display for LogId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}-{}", self.term, self.index)
    }
}

impl From<(u64, u64)> for LogId {
    fn from((term, index): (u64, u64)) -> Self {
        Self { term, index }
    }
}

/// Metadata of the newest snapshot held locally.
///
/// The replication core never reads snapshot contents; it only needs the
/// identity of the last log entry a snapshot covers, both for the leader's
/// snapshot-fallback decision and for the follower's log-matching check at the
/// snapshot boundary.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMeta {
    /// The id of the last log entry included in the snapshot.
    pub last_log_id: LogId,
}

impl fmt::Display for SnapshotMeta {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "snapshot({})", self.last_log_id)
    }
}
