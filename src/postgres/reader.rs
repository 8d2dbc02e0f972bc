use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::connection::ReplicationConnection;
use super::decoder::{ColumnValue, DecodedMessage, PgOutputDecoder, RowChange, TupleData};
use super::replication::{ReplicationMessage, ReplicationStream};
use super::types::{format_lsn, ChangeOperation, ChangeRecord, TableMapping, TableMappings};
use crate::config::{EndpointConfig, ReplicationConfig};
use crate::pipeline::{ApplyProgress, ChangeQueue};
use crate::{Error, Result};

/// Capture stage: turns the source's replication feed into encoded
/// change records on the queue of its database.
pub struct StreamReader {
    endpoint: EndpointConfig,
    slot_name: String,
    publication: String,
    status_interval: Duration,
    mappings: Arc<TableMappings>,
    queue: Arc<ChangeQueue>,
    progress: Arc<ApplyProgress>,
    decoder: PgOutputDecoder,
    in_transaction: bool,
}

enum Event {
    Cancelled,
    StatusDue,
    Message(Option<ReplicationMessage>),
}

impl StreamReader {
    pub fn new(
        endpoint: EndpointConfig,
        replication: &ReplicationConfig,
        mappings: Arc<TableMappings>,
        queue: Arc<ChangeQueue>,
        progress: Arc<ApplyProgress>,
    ) -> Self {
        Self {
            endpoint,
            slot_name: replication.slot_name.clone(),
            publication: replication.publication.clone(),
            status_interval: Duration::from_secs(replication.status_interval_secs),
            mappings,
            queue,
            progress,
            decoder: PgOutputDecoder::new(),
            in_transaction: false,
        }
    }

    /// Streams changes until cancelled. Returns the number of records captured.
    ///
    /// Any connection or decoding failure ends the reader with an error.
    /// The slot is only ever confirmed up to applied commits, so nothing
    /// unapplied is lost when the reader stops.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<u64> {
        let mut connection = ReplicationConnection::connect(
            &self.endpoint,
            self.slot_name.clone(),
            self.publication.clone(),
        )
        .await?;

        let system = connection.identify_system().await?;
        info!(
            system_id = %system.system_id,
            timeline = system.timeline,
            xlogpos = %system.xlogpos,
            "Identified source system"
        );

        let mut stream = connection.start_replication(None).await?;
        let first_record = self.queue.enqueued();

        let mut status = tokio::time::interval(self.status_interval);
        status.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => Event::Cancelled,
                _ = status.tick() => Event::StatusDue,
                message = stream.next_message() => Event::Message(message?),
            };

            match event {
                Event::Cancelled => {
                    info!("Stream reader cancelled, closing replication stream");
                    self.finish(stream).await;
                    break;
                }
                Event::StatusDue => {
                    stream.send_status_update(self.progress.confirmed_lsn()).await?;
                }
                Event::Message(None) => {
                    return Err(Error::Replication {
                        message: "server ended the replication stream".to_string(),
                    });
                }
                Event::Message(Some(ReplicationMessage::XLogData { wal_start, data, .. })) => {
                    self.handle_data(wal_start, &data)?;
                }
                Event::Message(Some(ReplicationMessage::Keepalive { wal_end, reply })) => {
                    trace!(wal_end = %format_lsn(wal_end), reply, "Keepalive");
                    if reply {
                        let confirmed = if self.in_transaction {
                            self.progress.confirmed_lsn()
                        } else {
                            self.progress.confirm_if_idle(self.queue.enqueued(), wal_end)
                        };
                        stream.send_status_update(confirmed).await?;
                    }
                }
            }
        }

        let captured = self.queue.enqueued() - first_record;
        info!(captured, "Stream reader stopped");
        Ok(captured)
    }

    fn handle_data(&mut self, wal_start: u64, data: &[u8]) -> Result<()> {
        match self.decoder.decode(data)? {
            Some(DecodedMessage::Begin { xid, .. }) => {
                trace!(xid, "Transaction started");
                self.in_transaction = true;
            }
            Some(DecodedMessage::Commit { end_lsn, .. }) => {
                self.in_transaction = false;
                self.progress.record_commit(self.queue.enqueued(), end_lsn);
            }
            Some(DecodedMessage::Change(change)) => {
                if let Some(record) = to_record(&change, &self.mappings, wal_start)? {
                    self.queue.push(record.encode()?);
                }
            }
            None => {}
        }
        Ok(())
    }

    async fn finish(&self, mut stream: ReplicationStream) {
        let confirmed = self.progress.confirmed_lsn();
        info!(
            received = %format_lsn(stream.received_lsn()),
            confirmed = %format_lsn(confirmed),
            "Stream reader stopping"
        );
        if let Err(e) = stream.send_status_update(confirmed).await {
            warn!(error = %e, "Could not send final status update");
            return;
        }
        if let Err(e) = stream.close().await {
            debug!(error = %e, "Could not end the copy cleanly");
        }
    }
}

/// Builds the change record for a decoded row change, or `None` when its
/// table is not mapped.
///
/// Only mapped columns are kept. Unchanged TOAST columns are left out of
/// the values so the target keeps what it has.
pub fn to_record(
    change: &RowChange,
    mappings: &TableMappings,
    lsn: u64,
) -> Result<Option<ChangeRecord>> {
    let Some(mapping) = mappings.get(&change.relation) else {
        trace!(table = %change.relation, "Skipping change on unmapped table");
        return Ok(None);
    };

    let values = match &change.new {
        Some(tuple) => mapped_values(tuple, mapping, |_| true),
        None => BTreeMap::new(),
    };

    let mut record = ChangeRecord {
        table: change.relation.clone(),
        op: change.op,
        values,
        key: BTreeMap::new(),
        lsn: format_lsn(lsn),
        xid: change.xid,
    };

    match (change.op, &change.old) {
        (ChangeOperation::Insert, _) => {}
        (_, Some(old)) => {
            record.key = mapped_values(old, mapping, |column| mapping.is_key_column(column));
        }
        (ChangeOperation::Update, None) => record.key = record.new_key(mapping),
        (ChangeOperation::Delete, None) => {
            return Err(Error::InvalidMessage {
                message: format!("DELETE on {} carries no old key", change.relation),
            });
        }
    }

    if change.op != ChangeOperation::Insert && record.key.len() != mapping.primary_key.len() {
        return Err(Error::InvalidMessage {
            message: format!(
                "{:?} on {} does not identify the row by its primary key",
                change.op, change.relation
            ),
        });
    }

    Ok(Some(record))
}

fn mapped_values(
    tuple: &TupleData,
    mapping: &TableMapping,
    keep: impl Fn(&str) -> bool,
) -> BTreeMap<String, Option<String>> {
    tuple
        .iter()
        .filter(|(column, _)| mapping.is_mapped_column(column) && keep(column))
        .filter_map(|(column, value)| match value {
            ColumnValue::Null => Some((column.clone(), None)),
            ColumnValue::Text(text) => Some((column.clone(), Some(text.clone()))),
            ColumnValue::Unchanged => None,
        })
        .collect()
}
