pub mod apply;
pub mod connection;
pub mod decoder;
pub mod reader;
pub mod replication;
pub mod setup;
pub mod types;

#[cfg(test)]
mod decoder_tests;
#[cfg(test)]
mod test_utils;

pub use apply::{connect_pool, PgApplier, PgConnection};
pub use connection::{FramedStream, ReplicationConnection, SystemInfo};
pub use decoder::{ColumnInfo, ColumnValue, DecodedMessage, PgOutputDecoder, RelationInfo, RowChange};
pub use reader::StreamReader;
pub use replication::{ReplicationMessage, ReplicationStream};
pub use types::*;
