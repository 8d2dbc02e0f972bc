//! One-time preparation done before the pipeline starts: target tables,
//! the source publication and the replication slot.

use postgres_protocol::escape::escape_identifier;
use std::collections::HashMap;
use tokio_postgres::Client;
use tracing::{debug, info};

use super::types::{TableMapping, TableMappings};
use crate::{Error, Result};

const SOURCE_COLUMNS: &str = "\
    SELECT a.attname, format_type(a.atttypid, a.atttypmod) \
    FROM pg_attribute a \
    JOIN pg_class c ON c.oid = a.attrelid \
    JOIN pg_namespace n ON n.oid = c.relnamespace \
    WHERE n.nspname = $1 AND c.relname = $2 AND a.attnum > 0 AND NOT a.attisdropped \
    ORDER BY a.attnum";

/// Creates every missing target table with the mapped columns, typed as
/// they are in the source.
pub async fn create_target_tables(
    source: &Client,
    target: &Client,
    mappings: &TableMappings,
) -> Result<()> {
    let mut sorted: Vec<&TableMapping> = mappings.iter().collect();
    sorted.sort_by(|a, b| a.source.cmp(&b.source));

    for mapping in sorted {
        let rows = source
            .query(SOURCE_COLUMNS, &[&mapping.source.schema, &mapping.source.name])
            .await?;
        if rows.is_empty() {
            return Err(Error::Config(format!(
                "source table {} does not exist",
                mapping.source
            )));
        }

        let types: HashMap<String, String> = rows
            .iter()
            .map(|row| (row.get::<_, String>(0), row.get::<_, String>(1)))
            .collect();

        let sql = create_table_sql(mapping, &types)?;
        debug!(table = %mapping.target, "{}", sql);
        target.batch_execute(&sql).await?;
        info!(source = %mapping.source, target = %mapping.target, "Target table ready");
    }
    Ok(())
}

pub fn create_table_sql(mapping: &TableMapping, types: &HashMap<String, String>) -> Result<String> {
    let mut definitions = Vec::with_capacity(mapping.columns.len() + 1);
    for column in &mapping.columns {
        let data_type = types.get(column).ok_or_else(|| {
            Error::Config(format!(
                "column '{}' does not exist in source table {}",
                column, mapping.source
            ))
        })?;
        definitions.push(format!("{} {}", escape_identifier(column), data_type));
    }

    let keys: Vec<String> = mapping
        .primary_key
        .iter()
        .map(|c| escape_identifier(c))
        .collect();
    definitions.push(format!("PRIMARY KEY ({})", keys.join(", ")));

    Ok(format!(
        "CREATE SCHEMA IF NOT EXISTS {};\nCREATE TABLE IF NOT EXISTS {} (\n    {}\n)",
        escape_identifier(&mapping.target.schema),
        mapping.target.quoted(),
        definitions.join(",\n    ")
    ))
}

/// Makes the publication expose exactly the mapped source tables.
pub async fn ensure_publication(
    source: &Client,
    publication: &str,
    mappings: &TableMappings,
) -> Result<()> {
    let exists = source
        .query_opt("SELECT 1 FROM pg_publication WHERE pubname = $1", &[&publication])
        .await?
        .is_some();

    let sql = publication_sql(publication, mappings, exists);
    source.batch_execute(&sql).await?;

    if exists {
        info!(publication, tables = mappings.len(), "Publication updated");
    } else {
        info!(publication, tables = mappings.len(), "Publication created");
    }
    Ok(())
}

pub fn publication_sql(publication: &str, mappings: &TableMappings, exists: bool) -> String {
    let mut tables: Vec<_> = mappings.iter().map(|m| &m.source).collect();
    tables.sort();
    let tables: Vec<String> = tables.iter().map(|t| t.quoted()).collect();

    if exists {
        format!(
            "ALTER PUBLICATION {} SET TABLE {}",
            escape_identifier(publication),
            tables.join(", ")
        )
    } else {
        format!(
            "CREATE PUBLICATION {} FOR TABLE {}",
            escape_identifier(publication),
            tables.join(", ")
        )
    }
}

/// Creates the pgoutput slot if it is missing. Returns whether it was created.
pub async fn ensure_slot(source: &Client, slot_name: &str) -> Result<bool> {
    let existing = source
        .query_opt(
            "SELECT plugin FROM pg_replication_slots WHERE slot_name = $1",
            &[&slot_name],
        )
        .await?;

    if let Some(row) = existing {
        let plugin: Option<String> = row.get(0);
        if plugin.as_deref() != Some("pgoutput") {
            return Err(Error::Config(format!(
                "replication slot '{}' exists but does not use pgoutput",
                slot_name
            )));
        }
        debug!(slot = slot_name, "Replication slot already exists");
        return Ok(false);
    }

    source
        .execute(
            "SELECT pg_create_logical_replication_slot($1, 'pgoutput')",
            &[&slot_name],
        )
        .await?;
    info!(slot = slot_name, "Replication slot created");
    Ok(true)
}
