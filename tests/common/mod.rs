#![allow(dead_code)]

use pg_relay::config::{
    ApplyConfig, Config, EndpointConfig, OnFailure, ReplicationConfig, TableConfig,
};
use std::env;
use std::time::Duration;
use tokio_postgres::{Client, NoTls};

/// Source endpoint from `TEST_PG_*` environment variables.
///
/// The target is the same database; tables land in a per-run schema.
pub fn endpoint(schema: &str) -> EndpointConfig {
    EndpointConfig {
        host: env::var("TEST_PG_HOST").unwrap_or_else(|_| "localhost".to_string()),
        port: env::var("TEST_PG_PORT")
            .unwrap_or_else(|_| "5432".to_string())
            .parse()
            .unwrap_or(5432),
        database: env::var("TEST_PG_DATABASE").unwrap_or_else(|_| "postgres".to_string()),
        schema: schema.to_string(),
        username: env::var("TEST_PG_USERNAME").unwrap_or_else(|_| "postgres".to_string()),
        password: env::var("TEST_PG_PASSWORD").unwrap_or_else(|_| "postgres".to_string()),
        connect_timeout_secs: 10,
    }
}

/// Names unique to one test in one process.
pub struct TestNames {
    pub source_table: String,
    pub target_schema: String,
    pub publication: String,
    pub slot: String,
}

impl TestNames {
    pub fn new(test: &str) -> Self {
        let suffix = format!("{}_{}", test, std::process::id());
        Self {
            source_table: format!("relay_src_{}", suffix),
            target_schema: format!("relay_dst_{}", suffix),
            publication: format!("relay_pub_{}", suffix),
            slot: format!("relay_slot_{}", suffix),
        }
    }
}

pub fn get_test_config(names: &TestNames) -> Config {
    Config {
        source: endpoint("public"),
        target: endpoint(&names.target_schema),
        replication: ReplicationConfig {
            publication: names.publication.clone(),
            slot_name: names.slot.clone(),
            status_interval_secs: 1,
            create_slot: true,
        },
        apply: ApplyConfig {
            max_tasks: 2,
            batch_size: 3,
            pool_size: None,
            poll_interval_ms: 10,
            on_failure: OnFailure::Skip,
            retry_attempts: 0,
        },
        tables: vec![TableConfig {
            source: names.source_table.clone(),
            target: None,
            columns: vec!["id".into(), "name".into(), "age".into()],
            primary_key: vec!["id".into()],
        }],
    }
}

pub async fn connect() -> Client {
    let (client, connection) = endpoint("public")
        .pg_config()
        .connect(NoTls)
        .await
        .expect("Failed to connect to test database");

    tokio::spawn(async move {
        if let Err(e) = connection.await {
            eprintln!("Connection error: {}", e);
        }
    });

    client
}

pub async fn create_source_table(client: &Client, names: &TestNames) {
    client
        .batch_execute(&format!(
            "CREATE TABLE IF NOT EXISTS public.{} (
                id INTEGER PRIMARY KEY,
                name TEXT,
                age INTEGER,
                notes TEXT
            )",
            names.source_table
        ))
        .await
        .expect("Failed to create source table");
}

pub async fn cleanup(client: &Client, names: &TestNames) {
    // the slot may still be held by a walsender for a moment
    for _ in 0..20 {
        let dropped = client
            .execute(
                "SELECT pg_drop_replication_slot(slot_name) FROM pg_replication_slots \
                 WHERE slot_name = $1 AND NOT active",
                &[&names.slot],
            )
            .await;
        let remaining = client
            .query_opt(
                "SELECT 1 FROM pg_replication_slots WHERE slot_name = $1",
                &[&names.slot],
            )
            .await
            .ok()
            .flatten();
        if dropped.is_ok() && remaining.is_none() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }

    let _ = client
        .batch_execute(&format!(
            "DROP PUBLICATION IF EXISTS {};
             DROP TABLE IF EXISTS public.{};
             DROP SCHEMA IF EXISTS {} CASCADE;",
            names.publication, names.source_table, names.target_schema
        ))
        .await;
}

/// Target rows as `(id, name, age)` ordered by id.
pub async fn target_rows(client: &Client, names: &TestNames) -> Vec<(i32, Option<String>, Option<i32>)> {
    client
        .query(
            &format!(
                "SELECT id, name, age FROM {}.{} ORDER BY id",
                names.target_schema, names.source_table
            ),
            &[],
        )
        .await
        .expect("Failed to read target table")
        .iter()
        .map(|row| (row.get(0), row.get(1), row.get(2)))
        .collect()
}

/// Polls `target_rows` until it equals `expected` or the timeout passes.
pub async fn wait_for_rows(
    client: &Client,
    names: &TestNames,
    expected: &[(i32, Option<String>, Option<i32>)],
) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
    while tokio::time::Instant::now() < deadline {
        if target_rows(client, names).await == expected {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    false
}
