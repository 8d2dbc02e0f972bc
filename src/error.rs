//! Error types and result handling for pg-relay.
//!
//! This module defines the main error type [`Error`] and a convenience
//! [`Result`] type alias used throughout the crate.
//!
//! # Example
//!
//! ```rust
//! use pg_relay::{Error, Result};
//!
//! fn connect_to_database() -> Result<()> {
//!     // Simulating a connection error
//!     Err(Error::Connection("Failed to connect".to_string()))
//! }
//!
//! match connect_to_database() {
//!     Ok(()) => println!("Connected"),
//!     Err(Error::Connection(msg)) => eprintln!("Connection error: {}", msg),
//!     Err(e) => eprintln!("Other error: {}", e),
//! }
//! ```

use thiserror::Error;

/// The main error type for pg-relay operations.
///
/// Configuration and setup errors are fatal before the pipeline starts,
/// capture errors are fatal to the stream reader, and apply errors are
/// contained to the worker that produced them.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error, from a bad file, environment or failed validation.
    #[error("Configuration error: {0}")]
    Config(String),

    /// PostgreSQL client error on a regular (non-replication) connection.
    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    /// JSON error when encoding or decoding queued change records.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error on the replication socket.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic connection error not covered by specific types.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Authentication failure with PostgreSQL.
    #[error("Authentication error: {0}")]
    Authentication(String),

    /// Protocol-level error in the frontend/backend conversation.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Replication-specific error.
    #[error("Replication error: {message}")]
    Replication {
        /// Description of the replication error
        message: String,
    },

    /// Invalid or malformed replication message.
    #[error("Invalid message format: {message}")]
    InvalidMessage {
        /// Description of what was invalid
        message: String,
    },

    /// A change record referenced a table with no configured mapping.
    #[error("No table mapping for {0}")]
    UnknownTable(String),

    /// Every pooled connection is lent out.
    ///
    /// The pool is sized to at least `max_tasks`, so this indicates a
    /// broken invariant rather than load.
    #[error("Connection pool exhausted ({in_use} of {capacity} connections in use, {retired} retired)")]
    PoolExhausted {
        /// Number of slots the pool holds
        capacity: usize,
        /// Slots currently lent to apply tasks
        in_use: usize,
        /// Slots whose connection was discarded
        retired: usize,
    },

    /// The pool was shut down and cannot lend connections anymore.
    #[error("Connection pool is shut down")]
    PoolClosed,

    /// A batch could not be applied and the failure policy is `abort`.
    #[error("Batch failed in task {task}: {message}")]
    BatchFailed {
        /// Identifier of the apply task
        task: u64,
        /// Description of the underlying failure
        message: String,
    },

    /// A pipeline task was cancelled before it could report its outcome.
    #[error("Task cancelled during shutdown")]
    Shutdown,
}

/// A convenient Result type alias for pg-relay operations.
///
/// This is equivalent to `std::result::Result<T, pg_relay::Error>`.
pub type Result<T> = std::result::Result<T, Error>;
