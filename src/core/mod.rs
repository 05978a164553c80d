//! The core state of the replication engine.

mod append_entries;

use std::collections::BTreeMap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Weak;

use parking_lot::Mutex;
use parking_lot::MutexGuard;

use crate::config::Config;
use crate::event::CallbackAction;
use crate::event::EventContext;
use crate::event::EventHandler;
use crate::event::RaftEvent;
use crate::quorum;
use crate::raft::AppendEntriesRequest;
use crate::raft::EntryPayload;
use crate::replication::peer::Peer;
use crate::replication::PeerConfig;
use crate::AppData;
use crate::LogStore;
use crate::NodeId;
use crate::ReplicationNetwork;
use crate::StateMachine;

/// The role of a node within the consensus group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

/// The initial priority value a valid leader message restores; the election
/// machinery decays it while the leader is silent.
const INITIAL_TARGET_PRIORITY: u32 = 1;

/// The mutable server-wide state record.
///
/// Guarded by a single mutex which every public entry point acquires exactly
/// once; internal helpers take the record by `&mut` instead of re-locking.
pub(crate) struct ServerState {
    /// The current term. Monotonically non-decreasing.
    pub current_term: u64,
    /// The current role of this node.
    pub role: Role,
    /// The last known leader.
    pub leader_id: Option<NodeId>,

    /// The highest log index known to be committed cluster-wide.
    pub quick_commit_index: u64,
    /// The highest log index applied to the local state machine. Trails
    /// `quick_commit_index`, never exceeds it.
    pub sm_commit_index: u64,
    /// The last commit index a leader reported to this node.
    pub leader_commit_index: u64,

    /// Election priority target, refreshed whenever a valid leader message
    /// arrives. The decay logic lives with the election machinery outside
    /// this crate.
    pub target_priority: u32,
    /// Whether a membership change entry sits in the log uncommitted.
    pub config_changing: bool,
}

/// The replication core of a Raft server.
///
/// One instance exists per node and is shared (via `Arc`) between the
/// transport, the heartbeat driver and the dispatch tasks the core spawns
/// itself. All entry points are synchronous and internally synchronized; the
/// only asynchrony is the actual wire exchange, which runs on spawned tasks.
pub struct ReplicationCore<D, N, S, SM>
where
    D: AppData,
    N: ReplicationNetwork<D>,
    S: LogStore<D>,
    SM: StateMachine<D>,
{
    /// This node's ID.
    pub(crate) id: NodeId,
    /// The runtime config.
    pub(crate) config: Arc<Config>,
    /// The `ReplicationNetwork` implementation.
    pub(crate) network: Arc<N>,
    /// The `LogStore` implementation.
    pub(crate) storage: Arc<S>,
    /// The `StateMachine` implementation.
    pub(crate) state_machine: Arc<SM>,
    /// The host server's event handler.
    pub(crate) event_handler: Arc<dyn EventHandler<D>>,

    /// The remote members of the cluster.
    pub(crate) peers: BTreeMap<NodeId, Arc<Peer>>,

    /// Back-reference handed to dispatch tasks, which must outlive the
    /// borrow they were spawned under.
    weak_self: Weak<Self>,

    pub(crate) state: Mutex<ServerState>,

    /// Set once a valid leader request has been accepted.
    initialized: AtomicBool,
    /// Polled between entry writes to exit long reconciliations early.
    stopping: AtomicBool,
    /// Set while this node is being caught up by a leader; consumed by the
    /// acceptor to downgrade expected log-mismatch warnings once.
    catching_up: AtomicBool,
    /// Held while an AppendEntries request is being processed, so the
    /// election timer thread does not transition roles mid-request.
    serving_req: AtomicBool,
}

impl<D, N, S, SM> ReplicationCore<D, N, S, SM>
where
    D: AppData,
    N: ReplicationNetwork<D>,
    S: LogStore<D>,
    SM: StateMachine<D>,
{
    /// Create a new replication core.
    ///
    /// The node starts as a follower at term 0; the host server installs the
    /// recovered term and role through [`become_follower`](Self::become_follower)
    /// / [`become_leader`](Self::become_leader) once its own state is loaded.
    pub fn new(
        id: NodeId,
        config: Arc<Config>,
        network: Arc<N>,
        storage: Arc<S>,
        state_machine: Arc<SM>,
        event_handler: Arc<dyn EventHandler<D>>,
        members: Vec<PeerConfig>,
    ) -> Arc<Self> {
        let peers: BTreeMap<_, _> = members.into_iter().map(|m| (m.id, Arc::new(Peer::new(m)))).collect();
        Arc::new_cyclic(|weak_self| Self {
            id,
            config,
            network,
            storage,
            state_machine,
            event_handler,
            peers,
            weak_self: weak_self.clone(),
            state: Mutex::new(ServerState {
                current_term: 0,
                role: Role::Follower,
                leader_id: None,
                quick_commit_index: 0,
                sm_commit_index: 0,
                leader_commit_index: 0,
                target_priority: INITIAL_TARGET_PRIORITY,
                config_changing: false,
            }),
            initialized: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            catching_up: AtomicBool::new(false),
            serving_req: AtomicBool::new(false),
        })
    }

    /// An owning handle to this core, for spawned tasks. `None` only while
    /// the last external handle is being dropped.
    pub(crate) fn self_arc(&self) -> Option<Arc<Self>> {
        self.weak_self.upgrade()
    }

    /// This node's ID.
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// The current term.
    pub fn current_term(&self) -> u64 {
        self.state.lock().current_term
    }

    /// The current role.
    pub fn role(&self) -> Role {
        self.state.lock().role
    }

    /// The last known leader.
    pub fn leader_id(&self) -> Option<NodeId> {
        self.state.lock().leader_id
    }

    /// The highest log index known to be committed cluster-wide.
    pub fn commit_index(&self) -> u64 {
        self.state.lock().quick_commit_index
    }

    /// The highest log index applied to the local state machine.
    pub fn sm_commit_index(&self) -> u64 {
        self.state.lock().sm_commit_index
    }

    /// The last commit index a leader reported to this node.
    pub fn leader_commit_index(&self) -> u64 {
        self.state.lock().leader_commit_index
    }

    /// Whether a membership change entry sits in the log uncommitted.
    pub fn is_config_changing(&self) -> bool {
        self.state.lock().config_changing
    }

    /// The current election priority target. The decay logic lives with the
    /// election machinery hosting this core.
    pub fn target_priority(&self) -> u32 {
        self.state.lock().target_priority
    }

    /// Whether a valid leader request has been accepted since startup.
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    pub(crate) fn set_initialized(&self) {
        self.initialized.store(true, Ordering::Release);
    }

    /// Whether an AppendEntries request is being processed right now. The
    /// election timer thread checks this before firing.
    pub fn is_serving_request(&self) -> bool {
        self.serving_req.load(Ordering::Acquire)
    }

    pub(crate) fn serving_req_flag(&self) -> &AtomicBool {
        &self.serving_req
    }

    /// Request the core to wind down: long reconciliations exit between
    /// entry writes and no further sends are dispatched.
    pub fn shutdown(&self) {
        self.stopping.store(true, Ordering::Release);
    }

    pub(crate) fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    /// Mark this node as being caught up by a leader. The next inbound
    /// request downgrades expected log-mismatch warnings.
    pub fn set_catching_up(&self, val: bool) {
        self.catching_up.store(val, Ordering::Release);
    }

    pub(crate) fn consume_catching_up(&self) -> bool {
        self.catching_up.swap(false, Ordering::AcqRel)
    }

    /// Assume leadership for `term`. Peer trackers are reset; next indices
    /// re-initialize lazily to the leader's `next_slot` on first send.
    pub fn become_leader(&self, term: u64) {
        {
            let mut state = self.state.lock();
            state.current_term = state.current_term.max(term);
            state.role = Role::Leader;
            state.leader_id = Some(self.id);
        }
        for peer in self.peers.values() {
            let mut t = peer.lock();
            t.next_log_idx = 0;
            t.matched_idx = 0;
            t.last_sent_idx = 0;
            t.long_pause_warnings = 0;
            t.recovery_cnt = 0;
            t.cnt_not_applied = 0;
            drop(t);
            peer.release_send();
            peer.consume_manual_free();
            peer.clear_pending_commit();
        }
        tracing::info!(id = self.id, term, "assumed leadership");
    }

    /// Step down to (or start as) a follower at `term`.
    pub fn become_follower(&self, term: u64, leader: Option<NodeId>) {
        let mut state = self.state.lock();
        self.become_follower_locked(&mut state, term, leader);
    }

    pub(crate) fn become_follower_locked(&self, state: &mut ServerState, term: u64, leader: Option<NodeId>) {
        state.current_term = state.current_term.max(term);
        state.role = Role::Follower;
        if leader.is_some() {
            state.leader_id = leader;
        }
        tracing::info!(id = self.id, term = state.current_term, "became follower");
    }

    /// Enter candidate state for `term`. Called by the election machinery
    /// hosting this core.
    pub fn become_candidate(&self, term: u64) {
        let mut state = self.state.lock();
        state.current_term = state.current_term.max(term);
        state.role = Role::Candidate;
    }

    /// Install recovered commit state at startup, e.g. after loading a
    /// snapshot: entries at or below `commit_index` are considered both
    /// committed and applied. Monotonic, never moves either index backwards.
    pub fn install_commit_state(&self, commit_index: u64) {
        let mut state = self.state.lock();
        state.quick_commit_index = state.quick_commit_index.max(commit_index);
        state.sm_commit_index = state.sm_commit_index.max(commit_index);
    }

    /// The number of voting members, including this node.
    pub fn num_voting_members(&self) -> usize {
        self.peers.values().filter(|p| !p.is_learner()).count() + 1
    }

    /// The quorum position for commit among the voting members.
    pub fn quorum_for_commit(&self) -> usize {
        quorum::quorum_for_commit(self.num_voting_members())
    }

    pub(crate) fn peer(&self, target: NodeId) -> Option<&Arc<Peer>> {
        self.peers.get(&target)
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, ServerState> {
        self.state.lock()
    }

    /// A point-in-time snapshot of a peer's replication state, for
    /// observability.
    pub fn peer_stats(&self, target: NodeId) -> Option<PeerStats> {
        let peer = self.peers.get(&target)?;
        let t = peer.lock();
        Some(PeerStats {
            id: peer.id(),
            learner: peer.is_learner(),
            next_log_idx: t.next_log_idx,
            matched_idx: t.matched_idx,
            last_sent_idx: t.last_sent_idx,
            busy: peer.is_busy(),
            long_pause_warnings: t.long_pause_warnings,
            recovery_cnt: t.recovery_cnt,
            cnt_not_applied: t.cnt_not_applied,
        })
    }

    /// The term of the log entry at `index`, falling back to the local
    /// snapshot for the entry right at the compaction boundary. Returns 0
    /// for index 0 and for entries this node has no knowledge of.
    pub(crate) fn term_for_log(&self, index: u64) -> u64 {
        if index == 0 {
            return 0;
        }
        if index >= self.storage.start_index() {
            return self.storage.term_at(index).unwrap_or(0);
        }
        match self.state_machine.last_snapshot() {
            Some(snap) if snap.last_log_id.index == index => snap.last_log_id.term,
            _ => {
                tracing::warn!(index, "term requested for a compacted entry not covered by the local snapshot");
                0
            }
        }
    }

    /// Advance the commit index to `target_idx` (monotonic) and apply newly
    /// committed entries to the state machine in order.
    pub(crate) fn commit_to(&self, state: &mut ServerState, target_idx: u64) {
        if target_idx > state.quick_commit_index {
            tracing::debug!(
                id = self.id,
                from = state.quick_commit_index,
                to = target_idx,
                "commit index advanced"
            );
            state.quick_commit_index = target_idx;
        }
        self.apply_committed(state);
    }

    /// Apply every committed-but-unapplied entry. The upper bound is capped
    /// by the locally stored log: `sm_commit_index` never reaches a slot the
    /// store has not filled.
    fn apply_committed(&self, state: &mut ServerState) {
        while state.sm_commit_index < state.quick_commit_index && state.sm_commit_index + 1 < self.storage.next_slot()
        {
            let index = state.sm_commit_index + 1;
            let entry = match self.storage.entry_at(index) {
                Some(entry) => entry,
                None => {
                    tracing::error!(index, "committed entry missing from the log store, cannot apply");
                    return;
                }
            };
            match &entry.payload {
                EntryPayload::Normal(normal) => self.state_machine.commit(index, &normal.data),
                EntryPayload::ConfigChange(_) => {
                    tracing::info!(index, "membership config entry committed");
                    state.config_changing = false;
                }
            }
            state.sm_commit_index = index;
        }
    }

    /// Run an event callback outside of any lock.
    pub(crate) fn call_event(
        &self,
        event: RaftEvent,
        leader_id: Option<NodeId>,
        peer_id: Option<NodeId>,
        request: Option<&AppendEntriesRequest<D>>,
        matched_idx: Option<u64>,
    ) -> CallbackAction {
        let ctx = EventContext {
            self_id: self.id,
            leader_id,
            peer_id,
            request,
            matched_idx,
        };
        self.event_handler.on_event(event, &ctx)
    }
}

/// A point-in-time snapshot of one peer's replication state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerStats {
    pub id: NodeId,
    pub learner: bool,
    /// The next index the leader plans to send (0 = not yet initialized).
    pub next_log_idx: u64,
    /// The highest index the peer has acknowledged.
    pub matched_idx: u64,
    /// The first index of the most recent batch.
    pub last_sent_idx: u64,
    /// Whether a request is in flight.
    pub busy: bool,
    pub long_pause_warnings: u32,
    pub recovery_cnt: u32,
    pub cnt_not_applied: u32,
}
