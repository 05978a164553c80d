//! The callback surface through which the core reports to its host server.

use crate::error::ReplicationError;
use crate::raft::AppendEntriesRequest;
use crate::AppData;
use crate::NodeId;

/// The verdict of an event callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackAction {
    /// Proceed with the operation.
    Continue,
    /// Abort the operation. Only honored for
    /// [`RaftEvent::RequestAppendEntries`]; for other events the verdict is
    /// ignored.
    ReturnNull,
}

/// Events reported to the host server as the replication flows execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaftEvent {
    /// The leader is about to run the send path for a peer. Returning
    /// [`CallbackAction::ReturnNull`] aborts the send with no state
    /// mutation.
    RequestAppendEntries,
    /// A follower validated and is about to apply an AppendEntries request
    /// from its leader.
    GotAppendEntryReqFromLeader,
    /// The leader processed an accepted response from a peer;
    /// [`EventContext::matched_idx`] carries the peer's new matched index.
    GotAppendEntryRespFromPeer,
}

/// The parameter bundle passed with every event.
pub struct EventContext<'a, D: AppData> {
    /// The reporting node.
    pub self_id: NodeId,
    /// The last known leader, if any.
    pub leader_id: Option<NodeId>,
    /// The peer the event concerns, if any.
    pub peer_id: Option<NodeId>,
    /// The inbound request, for follower-side events.
    pub request: Option<&'a AppendEntriesRequest<D>>,
    /// The peer's new matched index, for
    /// [`RaftEvent::GotAppendEntryRespFromPeer`].
    pub matched_idx: Option<u64>,
}

/// A handler for events and lifecycle notifications from the replication
/// core.
///
/// All methods are invoked outside of the core's locks and must not call back
/// into the core from within the same stack frame.
pub trait EventHandler<D: AppData>: Send + Sync + 'static {
    /// Observe (and possibly veto) a replication event.
    #[allow(unused_variables)]
    fn on_event(&self, event: RaftEvent, ctx: &EventContext<'_, D>) -> CallbackAction {
        CallbackAction::Continue
    }

    /// An unrecoverable invariant break was detected; the process should
    /// exit. The core does not touch its own state after reporting this.
    fn system_exit(&self, fatal: &ReplicationError);

    /// A follower finished processing a valid leader request and its
    /// election timer should be restarted. The election machinery itself
    /// lives outside this crate.
    fn restart_election_timer(&self) {}
}
