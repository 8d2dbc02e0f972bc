use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use crate::pipeline::{DispatchSettings, FailurePolicy};
use crate::postgres::{QualifiedName, TableMapping, TableMappings};
use crate::{Error, Result};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub source: EndpointConfig,
    pub target: EndpointConfig,
    pub replication: ReplicationConfig,
    #[serde(default)]
    pub apply: ApplyConfig,
    pub tables: Vec<TableConfig>,
}

/// Connection endpoint of either side of the replication.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EndpointConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub database: String,
    #[serde(default = "default_schema")]
    pub schema: String,
    pub username: String,
    pub password: String,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReplicationConfig {
    pub publication: String,
    pub slot_name: String,
    #[serde(default = "default_status_interval_secs")]
    pub status_interval_secs: u64,
    #[serde(default = "default_create_slot")]
    pub create_slot: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ApplyConfig {
    #[serde(default = "default_max_tasks")]
    pub max_tasks: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Defaults to `max_tasks` when omitted.
    #[serde(default)]
    pub pool_size: Option<usize>,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default)]
    pub on_failure: OnFailure,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OnFailure {
    #[default]
    Skip,
    Retry,
    Abort,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TableConfig {
    /// `schema.table` on the source; a bare name uses the source schema.
    pub source: String,
    /// `schema.table` on the target; defaults to the source table name
    /// in the target schema.
    #[serde(default)]
    pub target: Option<String>,
    pub columns: Vec<String>,
    pub primary_key: Vec<String>,
}

impl Default for ApplyConfig {
    fn default() -> Self {
        Self {
            max_tasks: default_max_tasks(),
            batch_size: default_batch_size(),
            pool_size: None,
            poll_interval_ms: default_poll_interval_ms(),
            on_failure: OnFailure::default(),
            retry_attempts: default_retry_attempts(),
        }
    }
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let settings = ::config::Config::builder()
            .add_source(::config::File::from(path.as_ref()))
            .add_source(
                ::config::Environment::with_prefix("PG_RELAY")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()
            .map_err(|e| Error::Config(e.to_string()))?;

        let config: Config = settings
            .try_deserialize()
            .map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let apply = &self.apply;
        if apply.max_tasks == 0 {
            return Err(Error::Config("apply.max_tasks must be positive".to_string()));
        }
        if apply.batch_size == 0 {
            return Err(Error::Config("apply.batch_size must be positive".to_string()));
        }
        if apply.pool_size() < apply.max_tasks {
            return Err(Error::Config(format!(
                "apply.pool_size ({}) must be at least apply.max_tasks ({})",
                apply.pool_size(),
                apply.max_tasks
            )));
        }
        if apply.poll_interval_ms == 0 {
            return Err(Error::Config(
                "apply.poll_interval_ms must be positive".to_string(),
            ));
        }
        if self.replication.publication.is_empty() || self.replication.slot_name.is_empty() {
            return Err(Error::Config(
                "replication.publication and replication.slot_name are required".to_string(),
            ));
        }

        // builds and checks every mapping
        self.table_mappings().map(|_| ())
    }

    pub fn table_mappings(&self) -> Result<TableMappings> {
        if self.tables.is_empty() {
            return Err(Error::Config("at least one [[tables]] entry is required".to_string()));
        }

        let mut seen = HashSet::new();
        let mut mappings = Vec::with_capacity(self.tables.len());

        for table in &self.tables {
            let source = QualifiedName::parse(&table.source, &self.source.schema)?;
            let target = match &table.target {
                Some(target) => QualifiedName::parse(target, &self.target.schema)?,
                None => QualifiedName::new(&self.target.schema, &source.name),
            };

            if !seen.insert(source.clone()) {
                return Err(Error::Config(format!("table {} is mapped twice", source)));
            }

            mappings.push(TableMapping::new(
                source,
                target,
                table.columns.clone(),
                table.primary_key.clone(),
            )?);
        }

        Ok(TableMappings::new(mappings))
    }

    pub fn dispatch_settings(&self) -> DispatchSettings {
        DispatchSettings {
            max_tasks: self.apply.max_tasks,
            batch_size: self.apply.batch_size,
            poll_interval: self.apply.poll_interval(),
            failure_policy: self.apply.failure_policy(),
        }
    }
}

impl EndpointConfig {
    /// Client configuration for a regular (non-replication) session.
    pub fn pg_config(&self) -> tokio_postgres::Config {
        let mut config = tokio_postgres::Config::new();
        config
            .host(&self.host)
            .port(self.port)
            .dbname(&self.database)
            .user(&self.username)
            .password(&self.password)
            .application_name("pg-relay")
            .connect_timeout(Duration::from_secs(self.connect_timeout_secs));
        config
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl ApplyConfig {
    pub fn pool_size(&self) -> usize {
        self.pool_size.unwrap_or(self.max_tasks)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn failure_policy(&self) -> FailurePolicy {
        match self.on_failure {
            OnFailure::Skip => FailurePolicy::Skip,
            OnFailure::Retry => FailurePolicy::Retry {
                attempts: self.retry_attempts,
            },
            OnFailure::Abort => FailurePolicy::Abort,
        }
    }
}

fn default_port() -> u16 {
    5432
}

fn default_schema() -> String {
    "public".to_string()
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_status_interval_secs() -> u64 {
    10
}

fn default_create_slot() -> bool {
    true
}

fn default_max_tasks() -> usize {
    4
}

fn default_batch_size() -> usize {
    100
}

fn default_poll_interval_ms() -> u64 {
    10
}

fn default_retry_attempts() -> u32 {
    3
}
