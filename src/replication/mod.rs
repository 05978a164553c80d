//! Leader-side replication: the AppendEntries dispatcher.

pub(crate) mod peer;

use std::sync::Arc;
use std::time::Instant;

use tracing::Instrument;

use crate::core::ReplicationCore;
use crate::core::Role;
use crate::error::RaftResult;
use crate::error::ReplicationError;
use crate::event::CallbackAction;
use crate::event::RaftEvent;
use crate::quorum;
use crate::raft::AppendEntriesRequest;
use crate::raft::AppendEntriesResponse;
use crate::raft::SnapshotSyncRequest;
use crate::replication::peer::Peer;
use crate::summary::MessageSummary;
use crate::AppData;
use crate::LogStore;
use crate::NodeId;
use crate::ReplicationNetwork;
use crate::StateMachine;

pub use peer::PeerConfig;

/// A frame produced by request construction, dispatched to the transport.
enum OutboundFrame<D: AppData> {
    Append(AppendEntriesRequest<D>),
    SnapshotSync(SnapshotSyncRequest),
}

impl<D, N, S, SM> ReplicationCore<D, N, S, SM>
where
    D: AppData,
    N: ReplicationNetwork<D>,
    S: LogStore<D>,
    SM: StateMachine<D>,
{
    /// Run the send path for every peer. This is the leader's heartbeat tick
    /// and its post-append fan-out.
    ///
    /// With no peers, or with a quorum already satisfied by the leader alone,
    /// no response will ever advance the commit index, so it is advanced
    /// directly here.
    #[tracing::instrument(level = "trace", skip(self), fields(id = self.id))]
    pub fn broadcast_append_entries(&self) {
        if self.role() != Role::Leader || self.is_stopping() {
            return;
        }

        if self.peers.is_empty() || self.quorum_for_commit() == 0 {
            let mut state = self.lock_state();
            let target = self.storage.next_slot() - 1;
            self.commit_to(&mut state, target);
            return;
        }

        for peer in self.peers.values() {
            if !self.send_append_entries_to(peer) {
                // The peer is busy; remember that it has something to catch
                // up on so the response handler re-enters the send path.
                peer.set_pending_commit();
            }
        }
    }

    /// Run the send path for a single peer.
    ///
    /// Returns `false` when the send was skipped because a request is
    /// already in flight.
    pub fn send_append_entries(&self, target: NodeId) -> bool {
        match self.peer(target) {
            Some(peer) => {
                let peer = peer.clone();
                self.send_append_entries_to(&peer)
            }
            None => {
                tracing::warn!(peer = target, "cannot send append entries to an unknown peer");
                true
            }
        }
    }

    #[tracing::instrument(level = "trace", skip(self, peer), fields(id = self.id, peer = peer.id()))]
    pub(crate) fn send_append_entries_to(&self, peer: &Arc<Peer>) -> bool {
        let leader_id = self.lock_state().leader_id;
        let verdict = self.call_event(RaftEvent::RequestAppendEntries, leader_id, Some(peer.id()), None, None);
        if verdict == CallbackAction::ReturnNull {
            tracing::warn!(peer = peer.id(), "aborting append entries request by callback");
            return true;
        }

        let mut need_reconnect = peer.take_reconnect();
        let inactive_ms = peer.lock().millis_since_active();
        if inactive_ms > self.config.heartbeat_interval * self.config.reconnect_limit {
            tracing::warn!(
                peer = peer.id(),
                inactive_ms,
                "connection to peer has not been active for a long time, force re-connect"
            );
            need_reconnect = true;
            peer.reset_activity_timer();
        }
        if need_reconnect {
            self.network.reconnect(peer.id());
        }

        if peer.try_acquire_send() {
            tracing::trace!(peer = peer.id(), "send request");
            let frame = match self.create_append_entries_req(peer) {
                Ok(Some(frame)) => frame,
                // Nothing to send right now (e.g. the log was truncated
                // concurrently); drop the token and let the next tick retry.
                Ok(None) => {
                    peer.release_send();
                    return true;
                }
                Err(_) => {
                    peer.release_send();
                    return true;
                }
            };

            if !peer.consume_manual_free() {
                // Actual recovery, not a forcibly freed token.
                let mut t = peer.lock();
                if t.long_pause_warnings >= self.config.warnings_limit {
                    let paused_ms = t.millis_since_sent();
                    t.recovery_cnt += 1;
                    tracing::warn!(
                        peer = peer.id(),
                        warnings = t.long_pause_warnings,
                        paused_ms,
                        recoveries = t.recovery_cnt,
                        "recovered from a long pause to peer"
                    );
                    if t.recovery_cnt >= 10 {
                        // Ten consecutive episodes; restart the count.
                        t.recovery_cnt = 0;
                    }
                }
                t.long_pause_warnings = 0;
            }

            self.dispatch(peer.clone(), frame);
            // Only the send timer is stamped at hand-off; the activity timer
            // moves in the dispatch task, once the connection shows life.
            peer.lock().last_sent_at = Instant::now();
            return true;
        }

        tracing::debug!(peer = peer.id(), "peer is busy, skip the request");

        let mut t = peer.lock();
        let pause_ms = t.millis_since_sent();
        if pause_ms > self.config.heartbeat_interval {
            // Waiting time became longer than the heartbeat interval.
            t.long_pause_warnings += 1;
            if t.long_pause_warnings < self.config.warnings_limit {
                tracing::warn!(
                    peer = peer.id(),
                    pause_ms,
                    "skipped sending to peer for too long since the last request"
                );
            } else if t.long_pause_warnings == self.config.warnings_limit {
                tracing::warn!(
                    peer = peer.id(),
                    "the long pause warning for this peer is too verbose, will suppress it from now"
                );
            }

            if pause_ms > self.config.heartbeat_interval * self.config.busy_flag_limit {
                // The request (or its response) was probably lost. Free the
                // token once so the next attempt can reach the peer.
                tracing::warn!(
                    peer = peer.id(),
                    pause_ms,
                    "probably something went wrong, temporarily free the busy flag for peer"
                );
                peer.force_release_manual();
                t.last_sent_at = Instant::now();
            }
        }
        false
    }

    /// Build the next AppendEntries request for `peer`, or the snapshot-sync
    /// request when the peer has fallen behind the start of the log.
    ///
    /// Returns `Ok(None)` when there is nothing to send (the token should be
    /// released and the send retried later).
    fn create_append_entries_req(&self, peer: &Arc<Peer>) -> RaftResult<Option<OutboundFrame<D>>> {
        let (starting_idx, cur_next_idx, commit_idx, term) = {
            let state = self.lock_state();
            (
                self.storage.start_index(),
                self.storage.next_slot(),
                state.quick_commit_index,
                state.current_term,
            )
        };

        let last_log_idx = {
            let mut t = peer.lock();
            if t.next_log_idx == 0 {
                t.next_log_idx = cur_next_idx;
            }
            t.next_log_idx - 1
        };

        if last_log_idx >= cur_next_idx {
            // The peer claims to hold log this leader never wrote: the
            // shared history is corrupted and there is no way to recover
            // from here.
            let err = ReplicationError::PeerLogAheadOfLeader {
                peer: peer.id(),
                peer_last_log_idx: last_log_idx,
                leader_next_slot: cur_next_idx,
            };
            tracing::error!(peer = peer.id(), last_log_idx, cur_next_idx, "peer's last log index is too large");
            self.event_handler.system_exit(&err);
            return Err(err);
        }

        // cur_next_idx: next slot of myself (leader).
        // starting_idx: start log index of myself (leader).
        // last_log_idx: last log index of the replica (follower).
        tracing::trace!(peer = peer.id(), last_log_idx, starting_idx, cur_next_idx, "create append entries req");

        let snapshot = self.state_machine.last_snapshot();
        if let Some(snap) = snapshot {
            if last_log_idx < starting_idx && last_log_idx < snap.last_log_id.index {
                tracing::debug!(
                    peer = peer.id(),
                    peer_log_idx = last_log_idx,
                    my_starting_idx = starting_idx,
                    snapshot_log_idx = snap.last_log_id.index,
                    "peer is behind the start of the log, sending snapshot"
                );
                return Ok(Some(OutboundFrame::SnapshotSync(SnapshotSyncRequest {
                    term,
                    src: self.id,
                    dst: peer.id(),
                    snapshot: snap,
                    commit_idx,
                })));
            }
        }

        let last_log_term = self.term_for_log(last_log_idx);
        let mut end_idx = std::cmp::min(cur_next_idx, last_log_idx + 1 + self.config.max_append_entries);

        // If this is a retry of the very batch sent last time, the follower
        // is probably struggling. After enough retries, send just one entry
        // until it comes back.
        {
            let mut t = peer.lock();
            if last_log_idx + 1 == t.last_sent_idx && last_log_idx + 2 < end_idx {
                t.cnt_not_applied += 1;
                tracing::debug!(
                    peer = peer.id(),
                    last_sent_idx = t.last_sent_idx,
                    cnt = t.cnt_not_applied,
                    "last sent batch to peer is not applied"
                );
                if t.cnt_not_applied >= self.config.stuck_batch_retries {
                    let prev_end_idx = end_idx;
                    end_idx = std::cmp::min(cur_next_idx, last_log_idx + 2);
                    tracing::debug!(peer = peer.id(), prev_end_idx, end_idx, "reduce end_idx");
                }
            } else {
                t.cnt_not_applied = 0;
            }
        }

        let entries = if last_log_idx + 1 >= cur_next_idx {
            // A pure heartbeat.
            Vec::new()
        } else {
            match self.storage.log_entries(last_log_idx + 1, end_idx) {
                Ok(entries) => entries,
                Err(err) => {
                    // The range became unavailable under us, most likely due
                    // to concurrent compaction. Retry on the next tick.
                    tracing::warn!(
                        peer = peer.id(),
                        error = %err,
                        start = last_log_idx + 1,
                        end = end_idx,
                        "reading log entries for replication failed"
                    );
                    return Ok(None);
                }
            }
        };

        tracing::debug!(
            peer = peer.id(),
            last_log_idx,
            last_log_term,
            entries = entries.len(),
            commit_idx,
            term,
            "append entries for peer"
        );

        let req = AppendEntriesRequest {
            term,
            src: self.id,
            dst: peer.id(),
            last_log_idx,
            last_log_term,
            commit_idx,
            entries,
        };
        peer.lock().last_sent_idx = last_log_idx + 1;

        Ok(Some(OutboundFrame::Append(req)))
    }

    /// Hand a frame to the transport on its own task. The in-flight token is
    /// held until the exchange resolves; a transport error releases it and
    /// flags the peer for reconnection, since the request is known dead.
    fn dispatch(&self, peer: Arc<Peer>, frame: OutboundFrame<D>) {
        let core = match self.self_arc() {
            Some(core) => core,
            None => return,
        };
        let network = self.network.clone();
        let target = peer.id();
        let task = async move {
            match frame {
                OutboundFrame::Append(rpc) => {
                    tracing::trace!(rpc = %rpc.summary(), "sending append entries");
                    match network.send_append_entries(target, rpc).await {
                        Ok(resp) => {
                            peer.release_send();
                            peer.reset_activity_timer();
                            core.handle_append_entries_response(resp);
                        }
                        Err(err) => {
                            tracing::warn!(peer = target, error = %err, "error sending AppendEntries RPC to peer");
                            peer.release_send();
                            peer.flag_reconnect();
                        }
                    }
                }
                OutboundFrame::SnapshotSync(rpc) => {
                    tracing::trace!(rpc = %rpc.summary(), "sending snapshot sync request");
                    match network.send_snapshot_sync(target, rpc).await {
                        Ok(()) => {
                            peer.release_send();
                            peer.reset_activity_timer();
                        }
                        Err(err) => {
                            tracing::warn!(peer = target, error = %err, "error sending snapshot sync request to peer");
                            peer.release_send();
                            peer.flag_reconnect();
                        }
                    }
                }
            }
        };
        tokio::spawn(task.instrument(tracing::debug_span!("replication_rpc", peer = target)));
    }

    /// Process an AppendEntries response from a peer.
    #[tracing::instrument(
        level = "debug",
        skip(self, resp),
        fields(id = self.id, src = resp.src, accepted = resp.accepted, next_idx = resp.next_idx)
    )]
    pub fn handle_append_entries_response(&self, resp: AppendEntriesResponse) {
        let peer = match self.peer(resp.src) {
            Some(peer) => peer.clone(),
            None => {
                tracing::info!(src = resp.src, "the response is from an unknown peer");
                return;
            }
        };

        let leader_id = {
            let mut state = self.lock_state();
            if resp.term > state.current_term {
                tracing::info!(
                    src = resp.src,
                    resp_term = resp.term,
                    my_term = state.current_term,
                    "response carries a newer term, stepping down"
                );
                self.become_follower_locked(&mut state, resp.term, None);
                return;
            }
            state.leader_id
        };

        // If there are pending logs to be synced or the commit index needs
        // to be advanced, continue sending to this peer.
        let need_to_catchup;

        if resp.accepted {
            let new_matched_idx = {
                let mut t = peer.lock();
                t.next_log_idx = resp.next_idx;
                let prev_matched_idx = t.matched_idx;
                t.matched_idx = resp.next_idx - 1;
                tracing::trace!(
                    peer = peer.id(),
                    prev_matched_idx,
                    new_matched_idx = t.matched_idx,
                    "peer accepted"
                );
                t.matched_idx
            };

            self.call_event(
                RaftEvent::GotAppendEntryRespFromPeer,
                leader_id,
                Some(peer.id()),
                None,
                Some(new_matched_idx),
            );

            // Try to commit with this response.
            {
                let mut state = self.lock_state();
                let mut matched_indexes = Vec::with_capacity(16);
                // The leader itself.
                matched_indexes.push(self.storage.next_slot() - 1);
                for p in self.peers.values() {
                    // Skip learners.
                    if p.is_learner() {
                        continue;
                    }
                    matched_indexes.push(p.lock().matched_idx);
                }
                debug_assert_eq!(matched_indexes.len(), self.num_voting_members());

                let quorum_idx = self.quorum_for_commit();
                let target_idx = quorum::committed_index(matched_indexes, quorum_idx);
                self.commit_to(&mut state, target_idx);
            }

            need_to_catchup = peer.clear_pending_commit() || resp.next_idx < self.storage.next_slot();
        } else {
            let (prev_next_idx, new_next_idx) = {
                let mut t = peer.lock();
                let prev = t.next_log_idx;
                if resp.next_idx > 0 && t.next_log_idx > resp.next_idx {
                    // Fast move for the peer to catch up.
                    t.next_log_idx = resp.next_idx;
                } else if t.next_log_idx > 0 {
                    // If not, move one log backward.
                    t.next_log_idx -= 1;
                }
                (prev, t.next_log_idx)
            };

            if peer.suppress_declined_warning(self.config.heartbeat_interval * self.config.busy_flag_limit) {
                tracing::info!(peer = peer.id(), prev_next_idx, resp_next_idx = resp.next_idx, new_next_idx, "declined append");
            } else {
                tracing::warn!(peer = peer.id(), prev_next_idx, resp_next_idx = resp.next_idx, new_next_idx, "declined append");
            }
            need_to_catchup = true;
        }

        // This node may not be the leader anymore, e.g. when the response
        // was sent out a long time ago and the role has changed since.
        if self.role() == Role::Leader && need_to_catchup {
            tracing::debug!(peer = peer.id(), "peer needs to catch up, re-entering the send path");
            self.send_append_entries_to(&peer);
        }
    }
}
