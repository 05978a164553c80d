//! Wire messages and log entry types.

use std::collections::BTreeSet;

use serde::Deserialize;
use serde::Serialize;

use crate::raft_types::LogId;
use crate::raft_types::SnapshotMeta;
use crate::summary::MessageSummary;
use crate::AppData;
use crate::NodeId;

/// An RPC sent by a cluster leader to replicate log entries (§5.3), and as a
/// heartbeat (§5.2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesRequest<D: AppData> {
    /// The leader's current term.
    pub term: u64,

    /// The sending node, i.e. the leader.
    pub src: NodeId,
    /// The receiving node.
    pub dst: NodeId,

    /// The index of the log entry immediately preceding `entries`.
    pub last_log_idx: u64,
    /// The term of the entry at `last_log_idx`.
    pub last_log_term: u64,

    /// The leader's commit index.
    pub commit_idx: u64,

    /// The new log entries to store.
    ///
    /// This may be empty when the leader is sending heartbeats. Entries
    /// are batched for efficiency.
    #[serde(bound = "D: AppData")]
    pub entries: Vec<Entry<D>>,
}

impl<D: AppData> MessageSummary for AppendEntriesRequest<D> {
    fn summary(&self) -> String {
        format!(
            "term={}, src={}, dst={}, last_log_idx={}, last_log_term={}, commit_idx={}, entries={}",
            self.term,
            self.src,
            self.dst,
            self.last_log_idx,
            self.last_log_term,
            self.commit_idx,
            self.entries.as_slice().summary()
        )
    }
}

/// The response to an `AppendEntriesRequest`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    /// The responding node's current term, for the leader to update itself.
    pub term: u64,

    /// The responding node, i.e. the follower.
    pub src: NodeId,
    /// The receiving node, i.e. the leader.
    pub dst: NodeId,

    /// Whether the follower accepted the entries.
    pub accepted: bool,

    /// On acceptance, `last_log_idx + len(entries) + 1`. On rejection, the
    /// index from which the leader should retry.
    pub next_idx: u64,
}

impl MessageSummary for AppendEntriesResponse {
    fn summary(&self) -> String {
        format!(
            "term={}, src={}, dst={}, accepted={}, next_idx={}",
            self.term, self.src, self.dst, self.accepted, self.next_idx
        )
    }
}

/// A request instructing a lagging follower to install the leader's snapshot.
///
/// Streaming the snapshot contents is outside of this core; the leader only
/// decides *that* a snapshot is needed and hands this frame to the transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotSyncRequest {
    /// The leader's current term.
    pub term: u64,

    /// The sending node, i.e. the leader.
    pub src: NodeId,
    /// The receiving node.
    pub dst: NodeId,

    /// Metadata of the snapshot the follower should request.
    pub snapshot: SnapshotMeta,

    /// The leader's commit index.
    pub commit_idx: u64,
}

impl MessageSummary for SnapshotSyncRequest {
    fn summary(&self) -> String {
        format!(
            "term={}, src={}, dst={}, snapshot={}, commit_idx={}",
            self.term, self.src, self.dst, self.snapshot, self.commit_idx
        )
    }
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// A Raft log entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Entry<D: AppData> {
    pub log_id: LogId,

    /// This entry's payload.
    #[serde(bound = "D: AppData")]
    pub payload: EntryPayload<D>,
}

impl<D: AppData> Entry<D> {
    /// Create a new application log entry.
    pub fn new_normal(log_id: LogId, data: D) -> Self {
        Self {
            log_id,
            payload: EntryPayload::Normal(EntryNormal { data }),
        }
    }

    /// Create a new membership config entry.
    pub fn new_config_change(log_id: LogId, membership: MembershipConfig) -> Self {
        Self {
            log_id,
            payload: EntryPayload::ConfigChange(membership),
        }
    }
}

impl<D: AppData> MessageSummary for Entry<D> {
    fn summary(&self) -> String {
        format!("{}:{}", self.log_id, self.payload.summary())
    }
}

impl<D: AppData> MessageSummary for &[Entry<D>] {
    fn summary(&self) -> String {
        let mut res = Vec::with_capacity(self.len());
        for x in self.iter() {
            res.push(x.summary());
        }
        res.join(",")
    }
}

/// Log entry payload variants.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum EntryPayload<D: AppData> {
    /// A normal application log entry.
    #[serde(bound = "D: AppData")]
    Normal(EntryNormal<D>),
    /// A cluster membership change entry.
    ConfigChange(MembershipConfig),
}

impl<D: AppData> MessageSummary for EntryPayload<D> {
    fn summary(&self) -> String {
        match self {
            EntryPayload::Normal(_) => "normal".to_string(),
            EntryPayload::ConfigChange(c) => format!("config-change: {:?}", c.voters),
        }
    }
}

/// A normal log entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EntryNormal<D: AppData> {
    /// The contents of this entry.
    #[serde(bound = "D: AppData")]
    pub data: D,
}

/// The membership configuration of the cluster, as carried by config-change
/// log entries.
///
/// The replication core does not interpret membership contents; it only
/// tracks whether a config change is in flight while such an entry sits
/// uncommitted in the log.
#[derive(Clone, Default, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipConfig {
    /// Voting members of the Raft cluster.
    pub voters: BTreeSet<NodeId>,
    /// Non-voting members receiving replication without counting toward
    /// quorum.
    pub learners: BTreeSet<NodeId>,
}
