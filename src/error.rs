//! Error types exposed by this crate.

use crate::NodeId;

/// A result type where the error variant is always a `ReplicationError`.
pub type RaftResult<T> = std::result::Result<T, ReplicationError>;

/// Error variants related to the replication core.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ReplicationError {
    /// A peer reported a log index at or beyond the leader's own next slot.
    ///
    /// This can only happen with corrupted shared history and is
    /// unrecoverable; the core reports it through
    /// [`EventHandler::system_exit`](crate::EventHandler::system_exit) before
    /// surfacing the error.
    #[error("peer {peer} last log index {peer_last_log_idx} is not smaller than the leader's next slot {leader_next_slot}")]
    PeerLogAheadOfLeader {
        peer: NodeId,
        peer_last_log_idx: u64,
        leader_next_slot: u64,
    },

    /// The follower's commit index had to be moved backwards to overwrite
    /// entries it already applied. Only surfaced as an error when
    /// `Config::fatal_on_commit_rollback` is set; the default policy warns
    /// and proceeds.
    #[error("commit index rolled back from {from} to {to} while overwriting conflicting entries")]
    CommitIndexRollback { from: u64, to: u64 },
}

/// Error variants related to configuration.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConfigError {
    /// The given value for `heartbeat_interval` is too small, must be > 0.
    #[error("the given value for heartbeat_interval is too small, must be > 0")]
    HeartbeatIntervalTooSmall,

    /// The given value for `max_append_entries` is too small, must be > 0.
    #[error("the given value for max_append_entries is too small, must be > 0")]
    MaxAppendEntriesTooSmall,

    /// The staleness multipliers gate forced busy release and reconnection;
    /// zero would trigger them on every send.
    #[error("the given value for {0} is too small, must be > 0")]
    StalenessLimitTooSmall(&'static str),
}
