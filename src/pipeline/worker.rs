use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

use super::pool::PooledConnection;
use crate::postgres::{ChangeRecord, TableMappings};
use crate::{Error, Result};

/// What an apply task does with a batch it could not apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Log the batch's records as lost and carry on.
    Skip,
    /// Apply the whole batch again up to `attempts` more times, then skip.
    Retry { attempts: u32 },
    /// Leave the batch unconfirmed and stop the pipeline.
    Abort,
}

/// Writes a batch of change records to a target through one connection.
pub trait BatchApplier: Send + Sync + 'static {
    type Connection: Send + 'static;

    /// Applies `records` in order as a single unit of work.
    fn apply_batch(
        &self,
        connection: &mut Self::Connection,
        mappings: &TableMappings,
        records: &[ChangeRecord],
    ) -> impl Future<Output = Result<()>> + Send;
}

/// Outcome of one apply task, handed back to the dispatcher with the
/// connection it borrowed.
#[derive(Debug)]
pub struct WorkerReport<C> {
    pub task_id: u64,
    pub connection: PooledConnection<C>,
    pub applied: usize,
    pub lost: usize,
    pub failure: Option<String>,
}

/// One batch on its way to the target.
pub struct ApplyWorker<A: BatchApplier> {
    task_id: u64,
    connection: PooledConnection<A::Connection>,
    batch: Vec<String>,
    mappings: Arc<TableMappings>,
    applier: Arc<A>,
    policy: FailurePolicy,
    retry_pause: Duration,
}

impl<A: BatchApplier> ApplyWorker<A> {
    pub fn new(
        task_id: u64,
        connection: PooledConnection<A::Connection>,
        batch: Vec<String>,
        mappings: Arc<TableMappings>,
        applier: Arc<A>,
        policy: FailurePolicy,
        retry_pause: Duration,
    ) -> Self {
        Self {
            task_id,
            connection,
            batch,
            mappings,
            applier,
            policy,
            retry_pause,
        }
    }

    /// Decodes and applies the batch. Always returns the connection,
    /// whatever happened to the records, even if the applier panics.
    pub async fn run(self) -> WorkerReport<A::Connection> {
        let task_id = self.task_id;
        let mut lost = 0;
        let mut records = Vec::with_capacity(self.batch.len());

        for token in &self.batch {
            match ChangeRecord::decode(token) {
                Ok(record) => records.push(record),
                Err(e) => {
                    error!(task_id, error = %e, "Dropping undecodable change record");
                    lost += 1;
                }
            }
        }

        let mut report = WorkerReport {
            task_id,
            connection: self.connection,
            applied: 0,
            lost,
            failure: None,
        };

        if records.is_empty() {
            return report;
        }

        let attempts = match self.policy {
            FailurePolicy::Retry { attempts } => attempts + 1,
            FailurePolicy::Skip | FailurePolicy::Abort => 1,
        };

        for attempt in 1..=attempts {
            let applied = AssertUnwindSafe(self.applier.apply_batch(
                &mut report.connection,
                &self.mappings,
                &records,
            ))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                Err(Error::BatchFailed {
                    task: task_id,
                    message: format!("apply panicked: {}", panic_message(panic.as_ref())),
                })
            });

            match applied {
                Ok(()) => {
                    debug!(task_id, records = records.len(), attempt, "Batch applied");
                    report.applied = records.len();
                    report.failure = None;
                    return report;
                }
                Err(e) => {
                    warn!(task_id, attempt, attempts, error = %e, "Batch apply failed");
                    report.failure = Some(e.to_string());
                    if attempt < attempts {
                        tokio::time::sleep(self.retry_pause).await;
                    }
                }
            }
        }

        if self.policy != FailurePolicy::Abort {
            error!(
                task_id,
                lost = records.len(),
                first_lsn = %records[0].lsn,
                "Batch could not be applied, its records are lost"
            );
        }
        report.lost += records.len();
        report
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        *message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "unknown cause"
    }
}
