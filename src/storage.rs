//! The log store interface.

use anyhow::Result;

use crate::raft::Entry;
use crate::AppData;

/// A trait defining the interface to the persistent log store.
///
/// The store is a sequence of append-only numbered slots with 1-based
/// indices. `start_index` may be greater than 1 once a prefix of the log has
/// been compacted into a snapshot; `next_slot` is the index the next appended
/// entry will occupy, so the last stored entry lives at `next_slot - 1`.
///
/// The replication core is the only writer on the follower side; on the
/// leader side entries are appended by machinery outside of this crate, and
/// the core only reads.
pub trait LogStore<D: AppData>: Send + Sync + 'static {
    /// The index of the first entry still present in the log.
    fn start_index(&self) -> u64;

    /// The index the next appended entry will occupy.
    fn next_slot(&self) -> u64;

    /// The term of the entry at `index`, or `None` if the slot is empty or
    /// compacted away.
    fn term_at(&self, index: u64) -> Option<u64>;

    /// The entry at `index`, or `None` if the slot is empty or compacted
    /// away.
    fn entry_at(&self, index: u64) -> Option<Entry<D>>;

    /// Get a series of log entries from storage.
    ///
    /// The start value is inclusive in the search and the stop value is
    /// non-inclusive: `[start, stop)`. The range must be fully present; a
    /// range made partially unavailable by concurrent compaction is an error.
    fn log_entries(&self, start: u64, stop: u64) -> Result<Vec<Entry<D>>>;

    /// Append a new entry at `next_slot`, returning the index it was stored
    /// at.
    fn append(&self, entry: Entry<D>) -> u64;

    /// Overwrite the entry at `index`. Any suffix beyond `index` is left in
    /// place; the caller is responsible for overwriting or extending it
    /// entry by entry.
    fn write_at(&self, index: u64, entry: Entry<D>);

    /// Hook invoked after a batch of `count` entries starting at `start` has
    /// been written through `write_at`/`append`. This is the store's commit
    /// barrier for the batch: a durable store should flush here.
    fn end_of_append_batch(&self, start: u64, count: u64);
}
