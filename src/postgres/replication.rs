use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::Utc;
use tracing::{debug, trace};

use super::connection::{error_message, FramedStream};
use super::types::format_lsn;
use crate::{Error, Result};

/// Microseconds between the Unix epoch and 2000-01-01, the PostgreSQL epoch.
const PG_EPOCH_OFFSET_MICROS: i64 = 946_684_800_000_000;

/// A message received inside the CopyBoth stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicationMessage {
    /// WAL data carrying one pgoutput message.
    XLogData {
        wal_start: u64,
        wal_end: u64,
        data: Bytes,
    },
    /// Primary keepalive; `reply` asks for an immediate status update.
    Keepalive { wal_end: u64, reply: bool },
}

impl ReplicationMessage {
    pub fn parse(mut data: Bytes) -> Result<Self> {
        if data.is_empty() {
            return Err(Error::InvalidMessage {
                message: "Empty message".to_string(),
            });
        }

        let tag = data.get_u8();

        match tag {
            b'w' => {
                if data.remaining() < 24 {
                    return Err(Error::InvalidMessage {
                        message: "Invalid XLogData header size".to_string(),
                    });
                }

                let wal_start = data.get_u64();
                let wal_end = data.get_u64();
                let _timestamp = data.get_i64();

                Ok(ReplicationMessage::XLogData {
                    wal_start,
                    wal_end,
                    data,
                })
            }
            b'k' => {
                if data.remaining() < 17 {
                    return Err(Error::InvalidMessage {
                        message: "Invalid keepalive message size".to_string(),
                    });
                }

                let wal_end = data.get_u64();
                let _timestamp = data.get_i64();
                let reply = data.get_u8() != 0;

                Ok(ReplicationMessage::Keepalive { wal_end, reply })
            }
            _ => Err(Error::InvalidMessage {
                message: format!("Unknown message tag: {}", tag),
            }),
        }
    }
}

/// The CopyBoth side of a replication connection.
pub struct ReplicationStream {
    stream: FramedStream,
    received_lsn: u64,
}

impl ReplicationStream {
    pub(crate) fn new(stream: FramedStream, start_lsn: u64) -> Self {
        Self {
            stream,
            received_lsn: start_lsn,
        }
    }

    /// Highest WAL position seen so far.
    pub fn received_lsn(&self) -> u64 {
        self.received_lsn
    }

    /// Waits for the next message. Returns `None` once the server ends the
    /// copy. Cancel safe.
    pub async fn next_message(&mut self) -> Result<Option<ReplicationMessage>> {
        loop {
            let (tag, body) = self.stream.read_frame().await?;

            match tag {
                b'd' => {
                    let message = ReplicationMessage::parse(body)?;
                    let wal_end = match &message {
                        ReplicationMessage::XLogData { wal_end, .. } => *wal_end,
                        ReplicationMessage::Keepalive { wal_end, .. } => *wal_end,
                    };
                    self.received_lsn = self.received_lsn.max(wal_end);
                    return Ok(Some(message));
                }
                b'c' => {
                    debug!("Server ended the replication stream");
                    return Ok(None);
                }
                b'E' => {
                    return Err(Error::Replication {
                        message: error_message(&body),
                    });
                }
                b'N' => debug!("Notice: {}", error_message(&body)),
                other => {
                    return Err(Error::Protocol(format!(
                        "Unexpected message in CopyBoth mode: {}",
                        other as char
                    )));
                }
            }
        }
    }

    /// Sends a standby status update.
    ///
    /// `confirmed_lsn` is reported as flushed and applied; the server may
    /// recycle WAL before it, so it must only cover applied changes.
    pub async fn send_status_update(&mut self, confirmed_lsn: u64) -> Result<()> {
        trace!(
            received = %format_lsn(self.received_lsn),
            confirmed = %format_lsn(confirmed_lsn),
            "Sending standby status update"
        );

        let frame = status_update_frame(self.received_lsn, confirmed_lsn, pg_now_micros());
        self.stream.write_all(&frame).await
    }

    /// Ends the copy from our side.
    pub async fn close(mut self) -> Result<()> {
        let mut frame = BytesMut::with_capacity(5);
        frame.put_u8(b'c');
        frame.put_i32(4);
        self.stream.write_all(&frame).await
    }
}

fn status_update_frame(written_lsn: u64, confirmed_lsn: u64, timestamp: i64) -> BytesMut {
    let mut payload = BytesMut::with_capacity(34);
    payload.put_u8(b'r');
    payload.put_u64(written_lsn);
    payload.put_u64(confirmed_lsn);
    payload.put_u64(confirmed_lsn);
    payload.put_i64(timestamp);
    payload.put_u8(0);

    let mut frame = BytesMut::with_capacity(payload.len() + 5);
    frame.put_u8(b'd');
    frame.put_i32(payload.len() as i32 + 4);
    frame.put_slice(&payload);
    frame
}

fn pg_now_micros() -> i64 {
    Utc::now().timestamp_micros() - PG_EPOCH_OFFSET_MICROS
}
