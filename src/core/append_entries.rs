use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Instant;

use crate::core::ReplicationCore;
use crate::core::Role;
use crate::error::ReplicationError;
use crate::event::RaftEvent;
use crate::raft::AppendEntriesRequest;
use crate::raft::AppendEntriesResponse;
use crate::raft::EntryPayload;
use crate::summary::MessageSummary;
use crate::AppData;
use crate::LogStore;
use crate::ReplicationNetwork;
use crate::StateMachine;

/// Keeps `serving_req` raised for the duration of the handler, so the
/// election timer thread does not transition roles mid-request. Cleared on
/// every exit path.
struct ServingGuard<'a>(&'a AtomicBool);

impl<'a> ServingGuard<'a> {
    fn raise(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::Release);
        Self(flag)
    }
}

impl Drop for ServingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl<D, N, S, SM> ReplicationCore<D, N, S, SM>
where
    D: AppData,
    N: ReplicationNetwork<D>,
    S: LogStore<D>,
    SM: StateMachine<D>,
{
    /// An RPC invoked by the leader to replicate log entries (§5.3); also
    /// used as heartbeat (§5.2).
    ///
    /// Returns `None` for the one condition that must not be answered: an
    /// AppendEntries from another leader at this leader's own term.
    #[tracing::instrument(
        level = "debug",
        skip(self, req),
        fields(id = self.id, src = req.src, term = req.term, last_log_idx = req.last_log_idx, commit_idx = req.commit_idx)
    )]
    pub fn handle_append_entries(&self, req: AppendEntriesRequest<D>) -> Option<AppendEntriesResponse> {
        let suppress_expected = self.consume_catching_up();
        if suppress_expected {
            tracing::info!("catch-up is in progress, expected log-mismatch warnings will be suppressed once");
        }

        let _serving = ServingGuard::raise(self.serving_req_flag());
        let started_at = Instant::now();

        let mut state = self.lock_state();
        tracing::trace!(
            my_term = state.current_term,
            my_role = ?state.role,
            entries = req.entries.len(),
            "inbound append entries"
        );

        // The leader hint is recorded only on acceptance, further below.
        if req.term > state.current_term {
            self.become_follower_locked(&mut state, req.term, None);
        } else if req.term == state.current_term {
            match state.role {
                Role::Candidate => self.become_follower_locked(&mut state, req.term, None),
                Role::Leader => {
                    tracing::warn!(
                        src = req.src,
                        term = req.term,
                        "received AppendEntries from another leader with the same term, \
                         there must be a bug; ignoring it instead of exiting"
                    );
                    return None;
                }
                Role::Follower => {
                    state.target_priority = super::INITIAL_TARGET_PRIORITY;
                    // The election timer restart is deferred to the end of
                    // this function; processing the batch may take a while.
                }
            }
        }

        // Rejections hint `next_slot` so the leader can jump straight to an
        // index that might align.
        let mut resp = AppendEntriesResponse {
            term: state.current_term,
            src: self.id,
            dst: req.src,
            accepted: false,
            next_idx: self.storage.next_slot(),
        };

        let local_snapshot = self.state_machine.last_snapshot();
        let log_term = if req.last_log_idx < self.storage.next_slot() {
            self.term_for_log(req.last_log_idx)
        } else {
            0
        };
        let log_okay = req.last_log_idx == 0
            || (log_term != 0 && req.last_log_term == log_term)
            || local_snapshot.is_some_and(|snap| {
                snap.last_log_id.index == req.last_log_idx && snap.last_log_id.term == req.last_log_term
            });

        if req.term < state.current_term || !log_okay {
            if suppress_expected {
                tracing::info!(
                    req_term = req.term,
                    my_term = state.current_term,
                    req_log_idx = req.last_log_idx,
                    req_log_term = req.last_log_term,
                    my_log_idx = self.storage.next_slot() - 1,
                    my_log_term = log_term,
                    "deny append entries"
                );
            } else {
                tracing::warn!(
                    req_term = req.term,
                    my_term = state.current_term,
                    req_log_idx = req.last_log_idx,
                    req_log_term = req.last_log_term,
                    my_log_idx = self.storage.next_slot() - 1,
                    my_log_term = log_term,
                    snapshot = ?local_snapshot,
                    "deny append entries"
                );
            }
            return Some(resp);
        }

        // -- Now this node is a follower, and the given log is okay. --

        self.set_initialized();

        // The callback runs outside of the server lock; revalidate the term
        // afterwards in case a newer one arrived in the meantime.
        drop(state);
        self.call_event(RaftEvent::GotAppendEntryReqFromLeader, Some(req.src), None, Some(&req), None);
        let mut state = self.lock_state();
        if req.term < state.current_term {
            resp.term = state.current_term;
            resp.next_idx = self.storage.next_slot();
            return Some(resp);
        }

        if !req.entries.is_empty() {
            // Write logs to the store, starting from overlapped entries.
            let mut log_idx = req.last_log_idx + 1;
            let mut cnt: usize = 0;

            // Skip entries already present with the same term.
            while log_idx < self.storage.next_slot() && cnt < req.entries.len() {
                if self.storage.term_at(log_idx) == Some(req.entries[cnt].log_id.term) {
                    log_idx += 1;
                    cnt += 1;
                } else {
                    break;
                }
            }

            // Overwrite conflicting entries (same index, different term).
            while log_idx < self.storage.next_slot() && cnt < req.entries.len() {
                if let Some(old_entry) = self.storage.entry_at(log_idx) {
                    match &old_entry.payload {
                        EntryPayload::Normal(normal) => self.state_machine.rollback(log_idx, &normal.data),
                        EntryPayload::ConfigChange(_) => {
                            tracing::info!(log_idx, "reverting an uncommitted membership config change");
                            state.config_changing = false;
                        }
                    }
                }

                let entry = req.entries[cnt].clone();
                tracing::debug!(log_idx, entry = %entry.summary(), "overwrite");
                self.storage.write_at(log_idx, entry.clone());
                match &entry.payload {
                    EntryPayload::Normal(normal) => self.state_machine.pre_commit(log_idx, &normal.data),
                    EntryPayload::ConfigChange(_) => {
                        tracing::info!(log_idx, "received a membership config change from the leader");
                        state.config_changing = true;
                    }
                }

                // If the overwrite point is at or below the commit index, the
                // commit index must be rolled back as well.
                if log_idx <= state.sm_commit_index {
                    let err = ReplicationError::CommitIndexRollback {
                        from: state.sm_commit_index,
                        to: log_idx - 1,
                    };
                    tracing::warn!(
                        from = state.sm_commit_index,
                        to = log_idx - 1,
                        "rolling back the commit index to overwrite applied entries"
                    );
                    if self.config.fatal_on_commit_rollback {
                        drop(state);
                        self.event_handler.system_exit(&err);
                        return Some(resp);
                    }
                    state.sm_commit_index = log_idx - 1;
                    state.quick_commit_index = log_idx - 1;
                }

                log_idx += 1;
                cnt += 1;

                if self.is_stopping() {
                    return Some(resp);
                }
            }

            // Append the remaining tail.
            while cnt < req.entries.len() {
                let entry = req.entries[cnt].clone();
                cnt += 1;
                let index = self.storage.append(entry.clone());
                tracing::trace!(index, "append");
                match &entry.payload {
                    EntryPayload::Normal(normal) => self.state_machine.pre_commit(index, &normal.data),
                    EntryPayload::ConfigChange(_) => {
                        tracing::info!(index, "received a membership config change from the leader");
                        state.config_changing = true;
                    }
                }

                if self.is_stopping() {
                    return Some(resp);
                }
            }

            self.storage.end_of_append_batch(req.last_log_idx + 1, req.entries.len() as u64);
        }

        state.leader_id = Some(req.src);
        state.leader_commit_index = req.commit_idx;

        // The leader may already have committed past what this node has
        // stored; never commit beyond the locally known log.
        let commit_target = std::cmp::min(req.commit_idx, self.storage.next_slot() - 1);
        self.commit_to(&mut state, commit_target);

        resp.accepted = true;
        resp.next_idx = req.last_log_idx + req.entries.len() as u64 + 1;

        let still_follower_same_term = state.role == Role::Follower && req.term == state.current_term;
        drop(state);

        let elapsed_ms = started_at.elapsed().as_millis() as u64;
        if elapsed_ms >= self.config.heartbeat_interval {
            tracing::warn!(
                src = req.src,
                elapsed_ms,
                entries = req.entries.len(),
                "appending entries took longer than the heartbeat interval"
            );
        }

        // Restart the election timer here rather than at the top: this
        // function may take a long time.
        if still_follower_same_term {
            self.event_handler.restart_election_timer();
        }

        Some(resp)
    }
}
