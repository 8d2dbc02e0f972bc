use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::pool::{ConnectionPool, PooledConnection};
use super::progress::ApplyProgress;
use super::queue::ChangeQueue;
use super::worker::{ApplyWorker, BatchApplier, FailurePolicy, WorkerReport};
use crate::postgres::TableMappings;
use crate::{Error, Result};

#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub max_tasks: usize,
    pub batch_size: usize,
    pub poll_interval: Duration,
    pub failure_policy: FailurePolicy,
}

/// Totals reported when the dispatcher stops.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    pub batches: u64,
    pub records_dispatched: u64,
    pub records_applied: u64,
    pub records_lost: u64,
    pub failed_batches: u64,
}

struct RunningTask<C> {
    task_id: u64,
    slot: usize,
    start: u64,
    end: u64,
    handle: JoinHandle<WorkerReport<C>>,
}

/// Drains the queue into batches and runs them on a bounded set of apply tasks.
pub struct Dispatcher<A: BatchApplier> {
    queue: Arc<ChangeQueue>,
    pool: Arc<ConnectionPool<A::Connection>>,
    applier: Arc<A>,
    mappings: Arc<TableMappings>,
    settings: DispatchSettings,
    records_handled: Arc<AtomicU64>,
    progress: Arc<ApplyProgress>,
    running: Vec<RunningTask<A::Connection>>,
    next_task_id: u64,
    summary: DispatchSummary,
}

impl<A: BatchApplier> Dispatcher<A> {
    pub fn new(
        queue: Arc<ChangeQueue>,
        pool: Arc<ConnectionPool<A::Connection>>,
        applier: Arc<A>,
        mappings: Arc<TableMappings>,
        settings: DispatchSettings,
    ) -> Self {
        Self {
            queue,
            pool,
            applier,
            mappings,
            settings,
            records_handled: Arc::new(AtomicU64::new(0)),
            progress: Arc::new(ApplyProgress::new()),
            running: Vec::new(),
            next_task_id: 1,
            summary: DispatchSummary::default(),
        }
    }

    /// Shares the applied-position tracker with the stream reader.
    pub fn with_progress(mut self, progress: Arc<ApplyProgress>) -> Self {
        self.progress = progress;
        self
    }

    /// Counter of records handed to apply tasks so far. Never decreases.
    pub fn records_handled(&self) -> Arc<AtomicU64> {
        self.records_handled.clone()
    }

    /// Runs until `cancel` fires or a fatal error occurs, then waits for
    /// every running task and shuts the pool down.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<DispatchSummary> {
        info!(
            max_tasks = self.settings.max_tasks,
            batch_size = self.settings.batch_size,
            pool_size = self.pool.capacity(),
            "Dispatcher started"
        );

        let mut outcome = Ok(());
        while !cancel.is_cancelled() {
            if let Err(e) = self.step(&cancel).await {
                error!(error = %e, "Dispatcher stopped on a fatal error");
                cancel.cancel();
                outcome = Err(e);
                break;
            }
        }

        info!("Dispatcher interrupted, no new batches will be started");
        self.drain().await;

        info!("All tasks are finished, releasing pooled connections");
        if let Err(e) = self.pool.shutdown() {
            error!(error = %e, "Connection pool did not shut down cleanly");
            if outcome.is_ok() {
                outcome = Err(e);
            }
        }

        info!(
            batches = self.summary.batches,
            dispatched = self.summary.records_dispatched,
            applied = self.summary.records_applied,
            lost = self.summary.records_lost,
            "Dispatcher finished"
        );
        outcome.map(|()| self.summary)
    }

    async fn step(&mut self, cancel: &CancellationToken) -> Result<()> {
        if self.running.len() < self.settings.max_tasks {
            // taken first so a pool failure never strands popped records
            let connection = self.pool.acquire()?;
            let batch = self.fill_batch(cancel).await;
            if batch.is_empty() {
                self.pool.release(connection);
            } else {
                self.dispatch(connection, batch);
            }
        }

        self.reap().await?;

        if self.running.len() >= self.settings.max_tasks {
            debug!("All tasks are busy, waiting");
            self.pause(cancel).await;
        }
        Ok(())
    }

    /// Polls up to `batch_size` records, pausing whenever the queue is empty.
    ///
    /// Stops early on cancellation; records already taken are still returned
    /// so they get dispatched rather than dropped.
    async fn fill_batch(&self, cancel: &CancellationToken) -> Vec<String> {
        let mut batch = Vec::with_capacity(self.settings.batch_size);

        for _ in 0..self.settings.batch_size {
            match self.queue.poll() {
                Some(record) => batch.push(record),
                None => {
                    if !self.pause(cancel).await {
                        break;
                    }
                }
            }
        }
        batch
    }

    fn dispatch(&mut self, connection: PooledConnection<A::Connection>, batch: Vec<String>) {
        let size = batch.len() as u64;
        let start = self.records_handled.fetch_add(size, Ordering::SeqCst);

        let task_id = self.next_task_id;
        self.next_task_id += 1;

        let slot = connection.slot();
        let worker = ApplyWorker::new(
            task_id,
            connection,
            batch,
            self.mappings.clone(),
            self.applier.clone(),
            self.settings.failure_policy,
            self.settings.poll_interval,
        );

        self.running.push(RunningTask {
            task_id,
            slot,
            start,
            end: start + size,
            handle: tokio::spawn(worker.run()),
        });

        self.summary.batches += 1;
        self.summary.records_dispatched += size;
        debug!(task_id, size, running = self.running.len(), "Batch dispatched");
    }

    /// Collects finished tasks and returns their connections to the pool.
    async fn reap(&mut self) -> Result<usize> {
        let (finished, running): (Vec<_>, Vec<_>) = std::mem::take(&mut self.running)
            .into_iter()
            .partition(|task| task.handle.is_finished());
        self.running = running;

        if finished.is_empty() {
            return Ok(0);
        }

        let count = finished.len();
        let mut abort = None;

        for task in finished {
            let size = task.end - task.start;
            match task.handle.await {
                Ok(report) => {
                    self.summary.records_applied += report.applied as u64;
                    let failure = report.failure.clone();
                    self.pool.release(report.connection);

                    match failure {
                        Some(message) if self.settings.failure_policy == FailurePolicy::Abort => {
                            self.summary.failed_batches += 1;
                            abort.get_or_insert(Error::BatchFailed {
                                task: task.task_id,
                                message,
                            });
                        }
                        Some(_) => {
                            self.summary.failed_batches += 1;
                            self.summary.records_lost += report.lost as u64;
                            self.progress.complete(task.start, task.end);
                        }
                        None => {
                            self.summary.records_lost += report.lost as u64;
                            self.progress.complete(task.start, task.end);
                        }
                    }
                }
                Err(e) => {
                    // workers catch their own panics, so only an aborted task gets here
                    error!(task_id = task.task_id, error = %e, "Apply task did not finish normally");
                    self.pool.discard(task.slot);
                    self.summary.failed_batches += 1;
                    if self.settings.failure_policy == FailurePolicy::Abort {
                        abort.get_or_insert(Error::BatchFailed {
                            task: task.task_id,
                            message: e.to_string(),
                        });
                    } else {
                        warn!(task_id = task.task_id, lost = size, "Records of the task are lost");
                        self.summary.records_lost += size;
                        self.progress.complete(task.start, task.end);
                    }
                }
            }
        }

        info!(
            "There are {} tasks from {} that have finished",
            count, self.settings.max_tasks
        );

        match abort {
            Some(e) => Err(e),
            None => Ok(count),
        }
    }

    /// Waits until every running task has been reaped.
    async fn drain(&mut self) {
        while !self.running.is_empty() {
            info!(
                running = self.running.len(),
                "Tasks are still working, waiting for them to finish"
            );
            if let Err(e) = self.reap().await {
                error!(error = %e, "Batch failed while draining");
            }
            if !self.running.is_empty() {
                tokio::time::sleep(self.settings.poll_interval).await;
            }
        }
    }

    /// Sleeps one poll interval. Returns `false` if cancelled meanwhile.
    async fn pause(&self, cancel: &CancellationToken) -> bool {
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(self.settings.poll_interval) => true,
        }
    }
}
