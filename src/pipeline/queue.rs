use crossbeam::queue::SegQueue;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// Unbounded FIFO of encoded change records between capture and apply.
///
/// Lock-free; safe for one producer and any number of consumers.
#[derive(Debug, Default)]
pub struct ChangeQueue {
    records: SegQueue<String>,
    enqueued: AtomicU64,
}

impl ChangeQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, record: String) {
        self.records.push(record);
        self.enqueued.fetch_add(1, Ordering::SeqCst);
    }

    /// Takes the oldest record, if any. Never blocks.
    pub fn poll(&self) -> Option<String> {
        self.records.pop()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Total number of records ever pushed.
    pub fn enqueued(&self) -> u64 {
        self.enqueued.load(Ordering::SeqCst)
    }
}

/// Queues keyed by source database name, scoped to one pipeline run.
#[derive(Debug, Default)]
pub struct QueueRegistry {
    queues: Mutex<HashMap<String, Arc<ChangeQueue>>>,
}

impl QueueRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the queue for `database`, creating it on first use.
    pub fn queue_for(&self, database: &str) -> Arc<ChangeQueue> {
        let mut queues = self.queues.lock().unwrap_or_else(PoisonError::into_inner);
        queues
            .entry(database.to_string())
            .or_insert_with(|| Arc::new(ChangeQueue::new()))
            .clone()
    }

    pub fn get(&self, database: &str) -> Option<Arc<ChangeQueue>> {
        self.queues
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(database)
            .cloned()
    }
}
