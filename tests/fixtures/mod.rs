//! Fixtures for testing the replication core.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use anyhow::Result;
use parking_lot::Mutex;
use parking_lot::RwLock;
use raft_replication::async_trait::async_trait;
use raft_replication::raft::AppendEntriesRequest;
use raft_replication::raft::AppendEntriesResponse;
use raft_replication::raft::Entry;
use raft_replication::raft::MembershipConfig;
use raft_replication::raft::SnapshotSyncRequest;
use raft_replication::AppData;
use raft_replication::CallbackAction;
use raft_replication::Config;
use raft_replication::EventContext;
use raft_replication::EventHandler;
use raft_replication::LogId;
use raft_replication::LogStore;
use raft_replication::NodeId;
use raft_replication::PeerConfig;
use raft_replication::RaftEvent;
use raft_replication::ReplicationCore;
use raft_replication::ReplicationError;
use raft_replication::ReplicationNetwork;
use raft_replication::SnapshotMeta;
use raft_replication::StateMachine;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing_subscriber::prelude::*;

/// A concrete core type used during testing.
pub type MemCore = Arc<ReplicationCore<ClientRequest, MockNetwork, MemLogStore, RecordingStateMachine>>;

/// Initialize the tracing system.
pub fn init_tracing() {
    let fmt_layer = tracing_subscriber::fmt::Layer::default().with_ansi(false);
    let subscriber = tracing_subscriber::Registry::default()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(fmt_layer);
    let _ = tracing::subscriber::set_global_default(subscriber);
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// The application data type which the fixtures work with.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ClientRequest {
    /// A simple string payload.
    pub data: String,
}

impl AppData for ClientRequest {}

/// Build a normal log entry.
pub fn entry(term: u64, index: u64, data: &str) -> Entry<ClientRequest> {
    Entry::new_normal(LogId::new(term, index), ClientRequest { data: data.to_string() })
}

/// Build a membership config entry.
pub fn conf_entry(term: u64, index: u64) -> Entry<ClientRequest> {
    Entry::new_config_change(LogId::new(term, index), MembershipConfig::default())
}

/// Build a log from `(term, data)` pairs, indices assigned from 1.
pub fn log_of(specs: &[(u64, &str)]) -> Vec<Entry<ClientRequest>> {
    specs
        .iter()
        .enumerate()
        .map(|(i, (term, data))| entry(*term, i as u64 + 1, data))
        .collect()
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// An in-memory log store.
pub struct MemLogStore {
    start: AtomicU64,
    log: RwLock<BTreeMap<u64, Entry<ClientRequest>>>,
    /// Recorded `end_of_append_batch` calls, as `(start, count)`.
    pub batches: Mutex<Vec<(u64, u64)>>,
}

impl MemLogStore {
    pub fn new() -> Arc<Self> {
        Self::with_entries(Vec::new())
    }

    pub fn with_entries(entries: Vec<Entry<ClientRequest>>) -> Arc<Self> {
        let log = entries.into_iter().map(|e| (e.log_id.index, e)).collect();
        Arc::new(Self {
            start: AtomicU64::new(1),
            log: RwLock::new(log),
            batches: Mutex::new(Vec::new()),
        })
    }

    /// A store whose prefix below `start` has been compacted away.
    pub fn compacted(start: u64, entries: Vec<Entry<ClientRequest>>) -> Arc<Self> {
        let store = Self::with_entries(entries);
        store.log.write().retain(|idx, _| *idx >= start);
        store.start.store(start, Ordering::Release);
        store
    }
}

impl LogStore<ClientRequest> for MemLogStore {
    fn start_index(&self) -> u64 {
        self.start.load(Ordering::Acquire)
    }

    fn next_slot(&self) -> u64 {
        let log = self.log.read();
        log.keys().next_back().map(|idx| idx + 1).unwrap_or_else(|| self.start_index())
    }

    fn term_at(&self, index: u64) -> Option<u64> {
        self.log.read().get(&index).map(|e| e.log_id.term)
    }

    fn entry_at(&self, index: u64) -> Option<Entry<ClientRequest>> {
        self.log.read().get(&index).cloned()
    }

    fn log_entries(&self, start: u64, stop: u64) -> Result<Vec<Entry<ClientRequest>>> {
        let log = self.log.read();
        let entries: Vec<_> = log.range(start..stop).map(|(_, e)| e.clone()).collect();
        if entries.len() as u64 != stop.saturating_sub(start) {
            return Err(anyhow!("log range [{}, {}) is not fully present", start, stop));
        }
        Ok(entries)
    }

    fn append(&self, entry: Entry<ClientRequest>) -> u64 {
        let mut log = self.log.write();
        let index = log.keys().next_back().map(|idx| idx + 1).unwrap_or_else(|| self.start_index());
        log.insert(index, entry);
        index
    }

    fn write_at(&self, index: u64, entry: Entry<ClientRequest>) {
        self.log.write().insert(index, entry);
    }

    fn end_of_append_batch(&self, start: u64, count: u64) {
        self.batches.lock().push((start, count));
    }
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// A state machine recording every hook invocation.
pub struct RecordingStateMachine {
    pub pre_commits: Mutex<Vec<(u64, String)>>,
    pub rollbacks: Mutex<Vec<(u64, String)>>,
    pub commits: Mutex<Vec<(u64, String)>>,
    snapshot: Mutex<Option<SnapshotMeta>>,
}

impl RecordingStateMachine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            pre_commits: Mutex::new(Vec::new()),
            rollbacks: Mutex::new(Vec::new()),
            commits: Mutex::new(Vec::new()),
            snapshot: Mutex::new(None),
        })
    }

    pub fn set_snapshot(&self, meta: SnapshotMeta) {
        *self.snapshot.lock() = Some(meta);
    }
}

impl StateMachine<ClientRequest> for RecordingStateMachine {
    fn pre_commit(&self, index: u64, data: &ClientRequest) {
        self.pre_commits.lock().push((index, data.data.clone()));
    }

    fn rollback(&self, index: u64, data: &ClientRequest) {
        self.rollbacks.lock().push((index, data.data.clone()));
    }

    fn commit(&self, index: u64, data: &ClientRequest) {
        self.commits.lock().push((index, data.data.clone()));
    }

    fn last_snapshot(&self) -> Option<SnapshotMeta> {
        *self.snapshot.lock()
    }
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// What the mock network does with a frame after capturing it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetBehavior {
    /// Park the send; the request stays in flight until
    /// [`MockNetwork::abort_holds`] fails it.
    Hold,
    /// Fail the send.
    Fail,
    /// Acknowledge every AppendEntries with an accepted response.
    AcceptAll,
}

/// A captured outbound frame.
#[derive(Debug, Clone)]
pub enum SentFrame {
    Append(AppendEntriesRequest<ClientRequest>),
    Snapshot(SnapshotSyncRequest),
}

/// A type which emulates a network transport, capturing every outbound frame
/// and responding according to the configured [`NetBehavior`].
pub struct MockNetwork {
    frames: mpsc::UnboundedSender<SentFrame>,
    behavior: Mutex<NetBehavior>,
    hold_gate: tokio::sync::Notify,
    pub reconnects: Mutex<Vec<NodeId>>,
}

impl MockNetwork {
    pub fn new(behavior: NetBehavior) -> (Arc<Self>, mpsc::UnboundedReceiver<SentFrame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let network = Arc::new(Self {
            frames: tx,
            behavior: Mutex::new(behavior),
            hold_gate: tokio::sync::Notify::new(),
            reconnects: Mutex::new(Vec::new()),
        });
        (network, rx)
    }

    pub fn set_behavior(&self, behavior: NetBehavior) {
        *self.behavior.lock() = behavior;
    }

    /// Fail every send currently parked by [`NetBehavior::Hold`].
    pub fn abort_holds(&self) {
        self.hold_gate.notify_waiters();
    }
}

#[async_trait]
impl ReplicationNetwork<ClientRequest> for MockNetwork {
    async fn send_append_entries(
        &self,
        _target: NodeId,
        rpc: AppendEntriesRequest<ClientRequest>,
    ) -> Result<AppendEntriesResponse> {
        let behavior = *self.behavior.lock();
        let _ = self.frames.send(SentFrame::Append(rpc.clone()));
        match behavior {
            NetBehavior::Hold => {
                self.hold_gate.notified().await;
                Err(anyhow!("held send aborted"))
            }
            NetBehavior::Fail => Err(anyhow!("connection refused")),
            NetBehavior::AcceptAll => Ok(AppendEntriesResponse {
                term: rpc.term,
                src: rpc.dst,
                dst: rpc.src,
                accepted: true,
                next_idx: rpc.last_log_idx + rpc.entries.len() as u64 + 1,
            }),
        }
    }

    async fn send_snapshot_sync(&self, _target: NodeId, rpc: SnapshotSyncRequest) -> Result<()> {
        let behavior = *self.behavior.lock();
        let _ = self.frames.send(SentFrame::Snapshot(rpc));
        match behavior {
            NetBehavior::Hold => {
                self.hold_gate.notified().await;
                Err(anyhow!("held send aborted"))
            }
            NetBehavior::Fail => Err(anyhow!("connection refused")),
            NetBehavior::AcceptAll => Ok(()),
        }
    }

    fn reconnect(&self, target: NodeId) {
        self.reconnects.lock().push(target);
    }
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// An event handler recording callbacks and fatal reports.
pub struct TestHandler {
    /// When set, `RequestAppendEntries` is answered with `ReturnNull`.
    pub veto_send: AtomicBool,
    /// Recorded events, as `(event, peer_id, matched_idx)`.
    pub events: Mutex<Vec<(RaftEvent, Option<NodeId>, Option<u64>)>>,
    /// Rendered fatal errors passed to `system_exit`.
    pub fatals: Mutex<Vec<String>>,
    pub timer_restarts: AtomicU64,
}

impl TestHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            veto_send: AtomicBool::new(false),
            events: Mutex::new(Vec::new()),
            fatals: Mutex::new(Vec::new()),
            timer_restarts: AtomicU64::new(0),
        })
    }

    pub fn events_of(&self, kind: RaftEvent) -> Vec<(RaftEvent, Option<NodeId>, Option<u64>)> {
        self.events.lock().iter().filter(|(e, _, _)| *e == kind).cloned().collect()
    }
}

impl EventHandler<ClientRequest> for TestHandler {
    fn on_event(&self, event: RaftEvent, ctx: &EventContext<'_, ClientRequest>) -> CallbackAction {
        self.events.lock().push((event, ctx.peer_id, ctx.matched_idx));
        if event == RaftEvent::RequestAppendEntries && self.veto_send.load(Ordering::Acquire) {
            return CallbackAction::ReturnNull;
        }
        CallbackAction::Continue
    }

    fn system_exit(&self, fatal: &ReplicationError) {
        self.fatals.lock().push(fatal.to_string());
    }

    fn restart_election_timer(&self) {
        self.timer_restarts.fetch_add(1, Ordering::AcqRel);
    }
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// All the pieces of a node under test.
pub struct RaftFixture {
    pub core: MemCore,
    pub store: Arc<MemLogStore>,
    pub sm: Arc<RecordingStateMachine>,
    pub network: Arc<MockNetwork>,
    pub handler: Arc<TestHandler>,
    pub frames: mpsc::UnboundedReceiver<SentFrame>,
}

pub fn default_config() -> Config {
    Config::build("test".into()).validate().expect("default test config is valid")
}

/// Build a node with the given config, initial log and remote members.
pub fn fixture(
    config: Config,
    log: Vec<Entry<ClientRequest>>,
    members: Vec<PeerConfig>,
    behavior: NetBehavior,
) -> RaftFixture {
    init_tracing();
    let store = MemLogStore::with_entries(log);
    fixture_with_store(config, store, members, behavior)
}

/// Build a node around a prepared store.
pub fn fixture_with_store(
    config: Config,
    store: Arc<MemLogStore>,
    members: Vec<PeerConfig>,
    behavior: NetBehavior,
) -> RaftFixture {
    init_tracing();
    let sm = RecordingStateMachine::new();
    let (network, frames) = MockNetwork::new(behavior);
    let handler = TestHandler::new();
    let core = ReplicationCore::new(
        1,
        Arc::new(config),
        network.clone(),
        store.clone(),
        sm.clone(),
        handler.clone(),
        members,
    );
    RaftFixture {
        core,
        store,
        sm,
        network,
        handler,
        frames,
    }
}

/// Await the next captured frame.
pub async fn next_frame(rx: &mut mpsc::UnboundedReceiver<SentFrame>) -> SentFrame {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for an outbound frame")
        .expect("network channel closed")
}

/// Unwrap a captured AppendEntries frame.
pub fn as_append(frame: SentFrame) -> AppendEntriesRequest<ClientRequest> {
    match frame {
        SentFrame::Append(rpc) => rpc,
        SentFrame::Snapshot(rpc) => panic!("expected an AppendEntries frame, got snapshot sync: {:?}", rpc),
    }
}

/// Give spawned dispatch tasks time to run to completion.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(20)).await;
}
