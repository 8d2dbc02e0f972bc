use postgres_protocol::escape::{escape_identifier, escape_literal};
use std::collections::BTreeMap;
use tokio::task::JoinHandle;
use tokio_postgres::{Client, NoTls};
use tracing::{debug, error, info, warn};

use super::types::{ChangeOperation, ChangeRecord, TableMapping, TableMappings};
use crate::config::EndpointConfig;
use crate::pipeline::BatchApplier;
use crate::{Error, Result};

/// A regular client session plus the task driving its socket.
pub struct PgConnection {
    client: Client,
    driver: JoinHandle<()>,
}

impl PgConnection {
    pub async fn connect(endpoint: &EndpointConfig) -> Result<Self> {
        let (client, connection) = endpoint.pg_config().connect(NoTls).await?;

        let database = endpoint.database.clone();
        let driver = tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!(database = %database, "Connection error: {}", e);
            }
        });

        Ok(Self { client, driver })
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn is_closed(&self) -> bool {
        self.client.is_closed()
    }

    /// Ends the session and waits for the driver to say goodbye to the
    /// server. Dropping the connection does the same in the background.
    pub async fn close(self) -> Result<()> {
        let Self { client, driver } = self;
        drop(client);
        driver
            .await
            .map_err(|e| Error::Connection(format!("connection driver failed: {}", e)))
    }
}

/// Opens the fixed set of target connections backing the pool.
///
/// Fails if any of them cannot be established.
pub async fn connect_pool(endpoint: &EndpointConfig, size: usize) -> Result<Vec<PgConnection>> {
    let mut connections = Vec::with_capacity(size);
    for _ in 0..size {
        connections.push(PgConnection::connect(endpoint).await?);
    }
    info!(
        host = %endpoint.host,
        database = %endpoint.database,
        size,
        "Target connections established"
    );
    Ok(connections)
}

/// Applies batches to a PostgreSQL target, one transaction per batch.
pub struct PgApplier {
    endpoint: EndpointConfig,
}

impl PgApplier {
    pub fn new(endpoint: EndpointConfig) -> Self {
        Self { endpoint }
    }
}

impl BatchApplier for PgApplier {
    type Connection = PgConnection;

    async fn apply_batch(
        &self,
        connection: &mut PgConnection,
        mappings: &TableMappings,
        records: &[ChangeRecord],
    ) -> Result<()> {
        if connection.is_closed() {
            warn!(database = %self.endpoint.database, "Target connection lost, reconnecting");
            *connection = PgConnection::connect(&self.endpoint).await?;
        }

        let mut sql = String::new();
        for record in records {
            let mapping = mappings.resolve(&record.table)?;
            for statement in statements(record, mapping)? {
                sql.push_str(&statement);
                sql.push_str(";\n");
            }
        }

        let transaction = connection.client.transaction().await?;
        transaction.batch_execute(&sql).await?;
        transaction.commit().await?;

        debug!(records = records.len(), "Batch committed");
        Ok(())
    }
}

/// SQL statements that bring the target in line with one record.
///
/// Updates that move a row to a new key remove the old key first.
pub fn statements(record: &ChangeRecord, mapping: &TableMapping) -> Result<Vec<String>> {
    match record.op {
        ChangeOperation::Insert => Ok(vec![upsert_sql(mapping, &record.values)?]),
        ChangeOperation::Update => {
            let new_key = record.new_key(mapping);
            let mut sql = Vec::with_capacity(2);
            if !record.key.is_empty() && record.key != new_key {
                sql.push(delete_sql(mapping, &record.key)?);
            }
            sql.push(upsert_sql(mapping, &record.values)?);
            Ok(sql)
        }
        ChangeOperation::Delete => Ok(vec![delete_sql(mapping, &record.key)?]),
    }
}

/// `INSERT .. ON CONFLICT (pk) DO UPDATE` over the columns present in `values`.
pub fn upsert_sql(mapping: &TableMapping, values: &BTreeMap<String, Option<String>>) -> Result<String> {
    require_key(mapping, values)?;

    let columns: Vec<&String> = mapping
        .columns
        .iter()
        .filter(|column| values.contains_key(*column))
        .collect();

    let names: Vec<String> = columns.iter().map(|c| escape_identifier(c)).collect();
    let literals: Vec<String> = columns.iter().map(|c| literal(&values[*c])).collect();
    let keys: Vec<String> = mapping
        .primary_key
        .iter()
        .map(|c| escape_identifier(c))
        .collect();
    let updates: Vec<String> = columns
        .iter()
        .filter(|c| !mapping.is_key_column(c))
        .map(|c| {
            let name = escape_identifier(c);
            format!("{} = EXCLUDED.{}", name, name)
        })
        .collect();

    let action = if updates.is_empty() {
        "DO NOTHING".to_string()
    } else {
        format!("DO UPDATE SET {}", updates.join(", "))
    };

    Ok(format!(
        "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT ({}) {}",
        mapping.target.quoted(),
        names.join(", "),
        literals.join(", "),
        keys.join(", "),
        action
    ))
}

pub fn delete_sql(mapping: &TableMapping, key: &BTreeMap<String, Option<String>>) -> Result<String> {
    require_key(mapping, key)?;

    let conditions: Vec<String> = mapping
        .primary_key
        .iter()
        .map(|column| match &key[column] {
            Some(value) => format!("{} = {}", escape_identifier(column), escape_literal(value)),
            None => format!("{} IS NULL", escape_identifier(column)),
        })
        .collect();

    Ok(format!(
        "DELETE FROM {} WHERE {}",
        mapping.target.quoted(),
        conditions.join(" AND ")
    ))
}

fn require_key(mapping: &TableMapping, row: &BTreeMap<String, Option<String>>) -> Result<()> {
    match mapping.primary_key.iter().find(|c| !row.contains_key(*c)) {
        Some(missing) => Err(Error::InvalidMessage {
            message: format!(
                "change for {} lacks primary key column '{}'",
                mapping.source, missing
            ),
        }),
        None => Ok(()),
    }
}

fn literal(value: &Option<String>) -> String {
    match value {
        Some(text) => escape_literal(text),
        None => "NULL".to_string(),
    }
}
