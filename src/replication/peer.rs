//! Per-peer replication tracking state.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Instant;

use parking_lot::Mutex;
use parking_lot::MutexGuard;

use crate::NodeId;

/// Static description of a remote cluster member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerConfig {
    /// The peer's node ID.
    pub id: NodeId,
    /// Learners receive replication but do not count toward quorum.
    pub learner: bool,
}

impl PeerConfig {
    /// A voting member.
    pub fn voter(id: NodeId) -> Self {
        Self { id, learner: false }
    }

    /// A non-voting member.
    pub fn learner(id: NodeId) -> Self {
        Self { id, learner: true }
    }
}

/// The mutable tracking state of one remote peer, owned by the leader side of
/// the core.
///
/// Index and counter fields are serialized by the tracker mutex. The
/// in-flight send token and the lifecycle flags are atomics so that the
/// dispatch tasks can flip them without taking the lock; together the token
/// and the `manual_free` flag form the small state machine
/// {Free, InFlight, ForcedFree}.
pub(crate) struct Peer {
    id: NodeId,
    learner: bool,

    /// The exclusive send token: at most one AppendEntries in flight.
    in_flight: AtomicBool,
    /// Set when the token was forcibly released rather than recovered
    /// normally, so the next acquisition does not mis-account a recovery.
    manual_free: AtomicBool,
    /// Set when new entries became available while the peer was busy; the
    /// response handler consumes it to decide on an immediate resend.
    pending_commit: AtomicBool,
    /// Set by the transport (or a failed send) to request reconnection
    /// before the next attempt.
    need_reconnect: AtomicBool,

    tracker: Mutex<Tracker>,
}

pub(crate) struct Tracker {
    /// The next index the leader plans to send. `0` means not yet
    /// initialized; it is lazily set to the leader's `next_slot` on first
    /// use.
    pub next_log_idx: u64,
    /// The highest index the peer has acknowledged.
    pub matched_idx: u64,
    /// The first index of the most recent batch, used to detect the same
    /// batch being re-sent without acknowledgement.
    pub last_sent_idx: u64,

    /// Long-pause warnings emitted in the current episode.
    pub long_pause_warnings: u32,
    /// Number of recoveries from long pauses.
    pub recovery_cnt: u32,
    /// Consecutive re-sends of an unacknowledged batch.
    pub cnt_not_applied: u32,

    /// When the last request was handed to the transport.
    pub last_sent_at: Instant,
    /// When the connection last showed activity.
    pub last_active_at: Instant,
    /// When the last declined-append warning was emitted.
    pub last_declined_at: Option<Instant>,
}

impl Peer {
    pub(crate) fn new(config: PeerConfig) -> Self {
        let now = Instant::now();
        Self {
            id: config.id,
            learner: config.learner,
            in_flight: AtomicBool::new(false),
            manual_free: AtomicBool::new(false),
            pending_commit: AtomicBool::new(false),
            need_reconnect: AtomicBool::new(false),
            tracker: Mutex::new(Tracker {
                next_log_idx: 0,
                matched_idx: 0,
                last_sent_idx: 0,
                long_pause_warnings: 0,
                recovery_cnt: 0,
                cnt_not_applied: 0,
                last_sent_at: now,
                last_active_at: now,
                last_declined_at: None,
            }),
        }
    }

    pub(crate) fn id(&self) -> NodeId {
        self.id
    }

    pub(crate) fn is_learner(&self) -> bool {
        self.learner
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Tracker> {
        self.tracker.lock()
    }

    /// Acquire the exclusive send token. Returns `false` if a request is
    /// already in flight.
    pub(crate) fn try_acquire_send(&self) -> bool {
        self.in_flight.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_ok()
    }

    /// Release the send token after the in-flight request completed.
    pub(crate) fn release_send(&self) {
        self.in_flight.store(false, Ordering::Release);
    }

    /// Forcibly release the send token for a request presumed lost, marking
    /// the release as manual so that the next acquisition skips recovery
    /// accounting.
    pub(crate) fn force_release_manual(&self) {
        self.manual_free.store(true, Ordering::Release);
        self.in_flight.store(false, Ordering::Release);
    }

    pub(crate) fn is_busy(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Consume the manual-free marker, reporting whether the previous release
    /// was forced.
    pub(crate) fn consume_manual_free(&self) -> bool {
        self.manual_free.swap(false, Ordering::AcqRel)
    }

    pub(crate) fn set_pending_commit(&self) {
        self.pending_commit.store(true, Ordering::Release);
    }

    /// Clear the pending-commit marker, reporting whether it was set.
    pub(crate) fn clear_pending_commit(&self) -> bool {
        self.pending_commit.swap(false, Ordering::AcqRel)
    }

    pub(crate) fn flag_reconnect(&self) {
        self.need_reconnect.store(true, Ordering::Release);
    }

    /// Consume the reconnect request, reporting whether it was set.
    pub(crate) fn take_reconnect(&self) -> bool {
        self.need_reconnect.swap(false, Ordering::AcqRel)
    }

    pub(crate) fn reset_activity_timer(&self) {
        self.tracker.lock().last_active_at = Instant::now();
    }

    /// Whether a declined-append warning falls inside the suppression window
    /// opened by the previous one. Re-arms the window either way.
    pub(crate) fn suppress_declined_warning(&self, window_ms: u64) -> bool {
        let mut t = self.tracker.lock();
        let suppress = t
            .last_declined_at
            .map(|at| (at.elapsed().as_millis() as u64) < window_ms)
            .unwrap_or(false);
        t.last_declined_at = Some(Instant::now());
        suppress
    }
}

impl Tracker {
    pub(crate) fn millis_since_sent(&self) -> u64 {
        self.last_sent_at.elapsed().as_millis() as u64
    }

    pub(crate) fn millis_since_active(&self) -> u64 {
        self.last_active_at.elapsed().as_millis() as u64
    }
}

//////////////////////////////////////////////////////////////////////////////////////////////////
// Unit Tests ////////////////////////////////////////////////////////////////////////////////////
