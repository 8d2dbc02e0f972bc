use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, PoisonError};
use tracing::trace;

/// Tracks which captured records have been applied, to decide how far the
/// replication slot may be confirmed.
///
/// Records are numbered by their position in the queue. The stream reader
/// registers every commit with the number of records enqueued up to and
/// including it; the dispatcher marks record ranges complete as batches are
/// reaped. A commit is confirmed once every record before its mark is done.
#[derive(Debug, Default)]
pub struct ApplyProgress {
    state: Mutex<ProgressState>,
}

#[derive(Debug, Default)]
struct ProgressState {
    completed: u64,
    /// Finished ranges beyond `completed`, keyed by start.
    pending_ranges: BTreeMap<u64, u64>,
    /// `(records enqueued, commit end lsn)` not yet confirmed.
    commits: VecDeque<(u64, u64)>,
    confirmed_lsn: u64,
}

impl ApplyProgress {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a commit whose records occupy queue positions below `records_enqueued`.
    pub fn record_commit(&self, records_enqueued: u64, end_lsn: u64) {
        let mut state = self.lock();
        state.commits.push_back((records_enqueued, end_lsn));
        state.advance();
    }

    /// Marks the records in `start..end` as finished.
    pub fn complete(&self, start: u64, end: u64) {
        if start >= end {
            return;
        }
        let mut state = self.lock();
        state.pending_ranges.insert(start, end);
        state.advance();
    }

    /// Number of records finished without gaps from the start.
    pub fn completed(&self) -> u64 {
        self.lock().completed
    }

    /// Highest commit LSN whose records are all finished.
    pub fn confirmed_lsn(&self) -> u64 {
        self.lock().confirmed_lsn
    }

    /// Confirms `wal_end` when nothing captured is still outstanding.
    ///
    /// Used for keepalives on an idle source so the slot does not hold WAL
    /// for changes outside the publication.
    pub fn confirm_if_idle(&self, records_enqueued: u64, wal_end: u64) -> u64 {
        let mut state = self.lock();
        if state.commits.is_empty() && state.completed >= records_enqueued {
            state.confirmed_lsn = state.confirmed_lsn.max(wal_end);
        }
        state.confirmed_lsn
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ProgressState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ProgressState {
    fn advance(&mut self) {
        while let Some(end) = self.pending_ranges.remove(&self.completed) {
            self.completed = end;
        }

        while let Some(&(mark, lsn)) = self.commits.front() {
            if mark > self.completed {
                break;
            }
            self.confirmed_lsn = self.confirmed_lsn.max(lsn);
            self.commits.pop_front();
            trace!(lsn, completed = self.completed, "Commit confirmed");
        }
    }
}
