use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::pipeline::{
    ApplyProgress, ConnectionPool, DispatchSummary, Dispatcher, QueueRegistry,
};
use crate::postgres::{connect_pool, setup, PgApplier, PgConnection, StreamReader, TableMappings};
use crate::{Config, Error, Result};

/// Wires the stream reader, queue, dispatcher and connection pool for one
/// source/target pair.
pub struct Replicator {
    config: Config,
    mappings: Arc<TableMappings>,
}

impl Replicator {
    pub fn new(config: Config) -> Result<Self> {
        let mappings = Arc::new(config.table_mappings()?);
        Ok(Self { config, mappings })
    }

    pub fn mappings(&self) -> &TableMappings {
        &self.mappings
    }

    /// Creates the target tables, the publication and, if configured, the
    /// replication slot.
    pub async fn prepare(&self) -> Result<()> {
        let source = PgConnection::connect(&self.config.source).await?;
        let target = PgConnection::connect(&self.config.target).await?;

        info!(tables = self.mappings.len(), "Creating target tables");
        setup::create_target_tables(source.client(), target.client(), &self.mappings).await?;

        setup::ensure_publication(
            source.client(),
            &self.config.replication.publication,
            &self.mappings,
        )
        .await?;

        if self.config.replication.create_slot {
            setup::ensure_slot(source.client(), &self.config.replication.slot_name).await?;
        }

        source.close().await?;
        target.close().await
    }

    /// Opens the target pool and starts the reader and dispatcher tasks.
    ///
    /// Fails without starting anything if the pool cannot be filled.
    pub async fn start(&self) -> Result<PipelineHandle> {
        let apply = &self.config.apply;
        let connections = connect_pool(&self.config.target, apply.pool_size()).await?;
        let pool = Arc::new(ConnectionPool::new(connections));

        let queues = Arc::new(QueueRegistry::new());
        let queue = queues.queue_for(&self.config.source.database);
        let progress = Arc::new(ApplyProgress::new());
        let cancel = CancellationToken::new();

        let dispatcher = Dispatcher::new(
            queue.clone(),
            pool,
            Arc::new(PgApplier::new(self.config.target.clone())),
            self.mappings.clone(),
            self.config.dispatch_settings(),
        )
        .with_progress(progress.clone());
        let records_handled = dispatcher.records_handled();

        let reader = StreamReader::new(
            self.config.source.clone(),
            &self.config.replication,
            self.mappings.clone(),
            queue,
            progress,
        );

        let reader = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let result = reader.run(cancel.clone()).await;
                if let Err(e) = &result {
                    error!(error = %e, "Stream reader failed, stopping the pipeline");
                }
                // nothing new can arrive once the reader is gone
                cancel.cancel();
                result
            })
        };
        let dispatcher = tokio::spawn(dispatcher.run(cancel.clone()));

        info!(
            source = %self.config.source.database,
            target = %self.config.target.database,
            max_tasks = apply.max_tasks,
            batch_size = apply.batch_size,
            "Pipeline started"
        );

        Ok(PipelineHandle {
            cancel,
            records_handled,
            queues,
            database: self.config.source.database.clone(),
            poll_interval: apply.poll_interval(),
            reader,
            dispatcher,
        })
    }
}

/// Control surface of a running pipeline.
pub struct PipelineHandle {
    cancel: CancellationToken,
    records_handled: Arc<AtomicU64>,
    queues: Arc<QueueRegistry>,
    database: String,
    poll_interval: Duration,
    reader: JoinHandle<Result<u64>>,
    dispatcher: JoinHandle<Result<DispatchSummary>>,
}

/// What the pipeline did, collected once both tasks have finished.
#[derive(Debug)]
pub struct ShutdownReport {
    pub records_handled: u64,
    pub records_captured: Option<u64>,
    pub records_left_queued: usize,
    pub dispatch: Option<DispatchSummary>,
    pub reader_error: Option<Error>,
    pub dispatcher_error: Option<Error>,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.reader_error.is_none() && self.dispatcher_error.is_none()
    }
}

impl PipelineHandle {
    /// Records handed to apply tasks so far.
    pub fn records_handled(&self) -> u64 {
        self.records_handled.load(Ordering::SeqCst)
    }

    /// Records captured but not yet taken by the dispatcher.
    pub fn records_queued(&self) -> usize {
        self.queues.get(&self.database).map_or(0, |queue| queue.len())
    }

    pub fn is_running(&self) -> bool {
        !self.reader.is_finished() || !self.dispatcher.is_finished()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Resolves once the pipeline has been asked to stop, by the caller or
    /// by a fatal failure inside it.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// Cancels the pipeline and waits for both tasks to finish.
    pub async fn shutdown(self) -> ShutdownReport {
        self.cancel.cancel();

        while self.is_running() {
            tokio::time::sleep(self.poll_interval).await;
        }

        let (records_captured, reader_error) = split(self.reader.await);
        let (dispatch, dispatcher_error) = split(self.dispatcher.await);

        let report = ShutdownReport {
            records_handled: self.records_handled.load(Ordering::SeqCst),
            records_captured,
            records_left_queued: self
                .queues
                .get(&self.database)
                .map_or(0, |queue| queue.len()),
            dispatch,
            reader_error,
            dispatcher_error,
        };

        info!(
            handled = report.records_handled,
            left_queued = report.records_left_queued,
            clean = report.is_clean(),
            "Pipeline stopped"
        );
        report
    }
}

fn split<T>(joined: std::result::Result<Result<T>, tokio::task::JoinError>) -> (Option<T>, Option<Error>) {
    match joined {
        Ok(Ok(value)) => (Some(value), None),
        Ok(Err(e)) => (None, Some(e)),
        Err(e) if e.is_cancelled() => (None, Some(Error::Shutdown)),
        Err(e) => (None, Some(Error::Connection(format!("task panicked: {}", e)))),
    }
}
