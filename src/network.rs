//! The replication network interface.

use anyhow::Result;
use async_trait::async_trait;

use crate::raft::AppendEntriesRequest;
use crate::raft::AppendEntriesResponse;
use crate::raft::SnapshotSyncRequest;
use crate::AppData;
use crate::NodeId;

/// A trait defining the interface for the network between cluster members.
///
/// The core dispatches each outbound frame on its own task and treats the
/// returned future as the in-flight request: the per-peer exclusion token is
/// held until the future resolves. An `Err` from a send means the request is
/// known dead; the core releases the token and flags the peer for
/// reconnection.
#[async_trait]
pub trait ReplicationNetwork<D>: Send + Sync + 'static
where D: AppData
{
    /// Send an AppendEntries RPC to the target node and await its response
    /// (§5.3).
    async fn send_append_entries(&self, target: NodeId, rpc: AppendEntriesRequest<D>) -> Result<AppendEntriesResponse>;

    /// Send a snapshot-sync request to the target node (§7).
    ///
    /// The snapshot transfer itself is handled by the transport and the
    /// snapshot machinery; the core only needs to know that the frame was
    /// delivered (or not).
    async fn send_snapshot_sync(&self, target: NodeId, rpc: SnapshotSyncRequest) -> Result<()>;

    /// Re-establish the connection to the target node.
    ///
    /// Called before a send when the connection has been inactive beyond the
    /// configured threshold, or when a previous send failed outright. Must
    /// not block.
    fn reconnect(&self, target: NodeId);
}
