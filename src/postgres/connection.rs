use bytes::{Buf, BufMut, Bytes, BytesMut};
use fallible_iterator::FallibleIterator;
use postgres_protocol::authentication::{self, sasl};
use postgres_protocol::message::{backend, frontend};
use std::collections::HashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::replication::ReplicationStream;
use super::types::format_lsn;
use crate::config::EndpointConfig;
use crate::{Error, Result};

/// Length-prefixed backend messages read from a socket.
///
/// Incoming bytes are accumulated in an internal buffer, so dropping a
/// pending [`FramedStream::read_frame`] never loses part of a frame.
pub struct FramedStream {
    socket: TcpStream,
    buffer: BytesMut,
}

impl FramedStream {
    pub fn new(socket: TcpStream) -> Self {
        Self {
            socket,
            buffer: BytesMut::with_capacity(8192),
        }
    }

    /// Returns the next `(tag, body)` pair. Cancel safe.
    pub async fn read_frame(&mut self) -> Result<(u8, Bytes)> {
        loop {
            if let Some(frame) = self.split_frame()? {
                return Ok(frame);
            }

            let read = self.socket.read_buf(&mut self.buffer).await?;
            if read == 0 {
                return Err(Error::Connection(
                    "server closed the connection".to_string(),
                ));
            }
        }
    }

    pub async fn write_all(&mut self, data: &[u8]) -> Result<()> {
        self.socket.write_all(data).await?;
        self.socket.flush().await?;
        Ok(())
    }

    fn split_frame(&mut self) -> Result<Option<(u8, Bytes)>> {
        if self.buffer.len() < 5 {
            return Ok(None);
        }

        let len = i32::from_be_bytes([self.buffer[1], self.buffer[2], self.buffer[3], self.buffer[4]]);
        if len < 4 {
            return Err(Error::Protocol(format!("Invalid frame length: {}", len)));
        }

        let total = 1 + len as usize;
        if self.buffer.len() < total {
            self.buffer.reserve(total - self.buffer.len());
            return Ok(None);
        }

        let mut frame = self.buffer.split_to(total);
        let tag = frame.get_u8();
        frame.advance(4);
        Ok(Some((tag, frame.freeze())))
    }
}

/// Connection to the source in `replication=database` mode.
///
/// Speaks the frontend/backend protocol directly since the regular
/// client cannot enter CopyBoth mode.
pub struct ReplicationConnection {
    stream: FramedStream,
    slot_name: String,
    publication_name: String,
}

#[derive(Debug, Clone)]
pub struct SystemInfo {
    pub system_id: String,
    pub timeline: i32,
    pub xlogpos: String,
    pub dbname: Option<String>,
}

type Row = HashMap<String, Option<String>>;

impl ReplicationConnection {
    pub async fn connect(
        endpoint: &EndpointConfig,
        slot_name: String,
        publication_name: String,
    ) -> Result<Self> {
        info!(
            host = %endpoint.host,
            port = endpoint.port,
            database = %endpoint.database,
            "Creating replication connection to PostgreSQL"
        );

        let socket = timeout(
            endpoint.connect_timeout(),
            TcpStream::connect((endpoint.host.as_str(), endpoint.port)),
        )
        .await
        .map_err(|_| {
            Error::Connection(format!(
                "timed out connecting to {}:{}",
                endpoint.host, endpoint.port
            ))
        })??;
        socket.set_nodelay(true)?;

        let mut connection = Self {
            stream: FramedStream::new(socket),
            slot_name,
            publication_name,
        };

        let mut buf = BytesMut::new();
        frontend::startup_message(
            [
                ("user", endpoint.username.as_str()),
                ("database", endpoint.database.as_str()),
                ("replication", "database"),
                ("application_name", "pg-relay"),
            ],
            &mut buf,
        )?;
        connection.stream.write_all(&buf).await?;

        connection
            .authenticate(&endpoint.username, &endpoint.password)
            .await?;
        connection.wait_for_ready().await?;

        info!("Successfully connected to PostgreSQL in replication mode");
        Ok(connection)
    }

    async fn authenticate(&mut self, user: &str, password: &str) -> Result<()> {
        let mut scram: Option<sasl::ScramSha256> = None;

        loop {
            let (tag, body) = self.stream.read_frame().await?;
            if tag == b'E' {
                return Err(Error::Authentication(error_message(&body)));
            }

            let mut raw = BytesMut::with_capacity(body.len() + 5);
            raw.put_u8(tag);
            raw.put_i32(body.len() as i32 + 4);
            raw.put_slice(&body);

            let message = backend::Message::parse(&mut raw)?.ok_or_else(|| {
                Error::Protocol("incomplete authentication message".to_string())
            })?;

            let mut buf = BytesMut::new();
            match message {
                backend::Message::AuthenticationOk => {
                    debug!("Authentication successful");
                    return Ok(());
                }
                backend::Message::AuthenticationCleartextPassword => {
                    warn!("Server requested a cleartext password");
                    frontend::password_message(password.as_bytes(), &mut buf)?;
                }
                backend::Message::AuthenticationMd5Password(body) => {
                    let hash =
                        authentication::md5_hash(user.as_bytes(), password.as_bytes(), body.salt());
                    frontend::password_message(hash.as_bytes(), &mut buf)?;
                }
                backend::Message::AuthenticationSasl(body) => {
                    let mut mechanisms = body.mechanisms();
                    let mut supported = false;
                    while let Some(mechanism) = mechanisms.next()? {
                        if mechanism == sasl::SCRAM_SHA_256 {
                            supported = true;
                        }
                    }
                    if !supported {
                        return Err(Error::Authentication(
                            "server offers no supported SASL mechanism".to_string(),
                        ));
                    }

                    let client = sasl::ScramSha256::new(
                        password.as_bytes(),
                        sasl::ChannelBinding::unsupported(),
                    );
                    frontend::sasl_initial_response(sasl::SCRAM_SHA_256, client.message(), &mut buf)?;
                    scram = Some(client);
                }
                backend::Message::AuthenticationSaslContinue(body) => {
                    let client = scram.as_mut().ok_or_else(|| {
                        Error::Protocol("SASL continue without SASL start".to_string())
                    })?;
                    client
                        .update(body.data())
                        .map_err(|e| Error::Authentication(e.to_string()))?;
                    frontend::sasl_response(client.message(), &mut buf)?;
                }
                backend::Message::AuthenticationSaslFinal(body) => {
                    let client = scram.as_mut().ok_or_else(|| {
                        Error::Protocol("SASL final without SASL start".to_string())
                    })?;
                    client
                        .finish(body.data())
                        .map_err(|e| Error::Authentication(e.to_string()))?;
                    continue;
                }
                _ => {
                    return Err(Error::Authentication(format!(
                        "unsupported authentication request: {}",
                        tag as char
                    )));
                }
            }

            self.stream.write_all(&buf).await?;
        }
    }

    async fn wait_for_ready(&mut self) -> Result<()> {
        loop {
            let (tag, body) = self.stream.read_frame().await?;
            match tag {
                b'Z' => {
                    debug!("Ready for query");
                    return Ok(());
                }
                b'E' => return Err(Error::Connection(error_message(&body))),
                _ => {}
            }
        }
    }

    pub async fn identify_system(&mut self) -> Result<SystemInfo> {
        debug!("Sending IDENTIFY_SYSTEM command");

        let rows = self.simple_query("IDENTIFY_SYSTEM").await?;
        let row = rows.into_iter().next().ok_or_else(|| Error::Replication {
            message: "Failed to get system info".to_string(),
        })?;

        let field = |name: &str| row.get(name).cloned().flatten();
        let info = SystemInfo {
            system_id: field("systemid").unwrap_or_else(|| "unknown".to_string()),
            timeline: field("timeline").and_then(|t| t.parse().ok()).unwrap_or(1),
            xlogpos: field("xlogpos").unwrap_or_else(|| "0/0".to_string()),
            dbname: field("dbname"),
        };

        debug!("System info: {:?}", info);
        Ok(info)
    }

    /// Enters CopyBoth mode on the configured slot.
    ///
    /// Without `start_lsn` the server resumes from the slot's confirmed
    /// flush position.
    pub async fn start_replication(mut self, start_lsn: Option<u64>) -> Result<ReplicationStream> {
        let start_lsn = start_lsn.unwrap_or(0);
        let lsn = format_lsn(start_lsn);

        info!(
            slot = %self.slot_name,
            publication = %self.publication_name,
            "Starting replication from LSN: {}",
            lsn
        );

        let query = format!(
            "START_REPLICATION SLOT {} LOGICAL {} (proto_version '1', publication_names {})",
            postgres_protocol::escape::escape_identifier(&self.slot_name),
            lsn,
            postgres_protocol::escape::escape_literal(&self.publication_name)
        );

        let mut buf = BytesMut::new();
        frontend::query(&query, &mut buf)?;
        self.stream.write_all(&buf).await?;

        loop {
            let (tag, body) = self.stream.read_frame().await?;
            match tag {
                b'W' => {
                    info!("Entered CopyBoth mode");
                    return Ok(ReplicationStream::new(self.stream, start_lsn));
                }
                b'E' => {
                    return Err(Error::Replication {
                        message: format!("Failed to start replication: {}", error_message(&body)),
                    });
                }
                b'N' => debug!("Notice: {}", error_message(&body)),
                other => {
                    return Err(Error::Protocol(format!(
                        "Unexpected response to START_REPLICATION: {}",
                        other as char
                    )));
                }
            }
        }
    }

    async fn simple_query(&mut self, query: &str) -> Result<Vec<Row>> {
        let mut buf = BytesMut::new();
        frontend::query(query, &mut buf)?;
        self.stream.write_all(&buf).await?;

        let mut columns = Vec::new();
        let mut rows = Vec::new();
        let mut failure = None;

        loop {
            let (tag, body) = self.stream.read_frame().await?;
            match tag {
                b'T' => columns = parse_row_description(body)?,
                b'D' => {
                    let values = parse_data_row(body)?;
                    rows.push(columns.iter().cloned().zip(values).collect());
                }
                b'E' => failure = Some(error_message(&body)),
                b'Z' => break,
                _ => {}
            }
        }

        match failure {
            Some(message) => Err(Error::Replication { message }),
            None => Ok(rows),
        }
    }
}

/// Extracts the human-readable text of an ErrorResponse/NoticeResponse body.
pub fn error_message(body: &[u8]) -> String {
    let mut severity = None;
    let mut code = None;
    let mut message = None;

    let mut fields = body;
    while let Some((&field, rest)) = fields.split_first() {
        if field == 0 {
            break;
        }
        let end = rest.iter().position(|b| *b == 0).unwrap_or(rest.len());
        let value = String::from_utf8_lossy(&rest[..end]).to_string();
        match field {
            b'S' => severity = Some(value),
            b'C' => code = Some(value),
            b'M' => message = Some(value),
            _ => {}
        }
        fields = rest.get(end + 1..).unwrap_or_default();
    }

    format!(
        "{}: {} ({})",
        severity.unwrap_or_else(|| "ERROR".to_string()),
        message.unwrap_or_else(|| "unknown error".to_string()),
        code.unwrap_or_else(|| "?????".to_string())
    )
}

fn parse_row_description(mut body: Bytes) -> Result<Vec<String>> {
    let truncated = || Error::Protocol("truncated RowDescription".to_string());

    if body.remaining() < 2 {
        return Err(truncated());
    }
    let count = body.get_i16();
    let mut names = Vec::with_capacity(count.max(0) as usize);

    for _ in 0..count {
        let end = body.iter().position(|b| *b == 0).ok_or_else(truncated)?;
        names.push(String::from_utf8_lossy(&body[..end]).to_string());
        body.advance(end + 1);
        // table oid, attnum, type oid, typlen, typmod, format
        if body.remaining() < 18 {
            return Err(truncated());
        }
        body.advance(18);
    }
    Ok(names)
}

fn parse_data_row(mut body: Bytes) -> Result<Vec<Option<String>>> {
    let truncated = || Error::Protocol("truncated DataRow".to_string());

    if body.remaining() < 2 {
        return Err(truncated());
    }
    let count = body.get_i16();
    let mut values = Vec::with_capacity(count.max(0) as usize);

    for _ in 0..count {
        if body.remaining() < 4 {
            return Err(truncated());
        }
        let len = body.get_i32();
        if len < 0 {
            values.push(None);
            continue;
        }
        let len = len as usize;
        if body.remaining() < len {
            return Err(truncated());
        }
        values.push(Some(String::from_utf8_lossy(&body[..len]).to_string()));
        body.advance(len);
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_message_fields() {
        let mut body = Vec::new();
        body.extend_from_slice(b"SERROR\0");
        body.extend_from_slice(b"C42704\0");
        body.extend_from_slice(b"Mreplication slot \"s1\" does not exist\0");
        body.push(0);

        assert_eq!(
            error_message(&body),
            "ERROR: replication slot \"s1\" does not exist (42704)"
        );
    }

    #[test]
    fn test_error_message_tolerates_garbage() {
        assert_eq!(error_message(b""), "ERROR: unknown error (?????)");
        assert_eq!(error_message(b"Mno terminator"), "ERROR: no terminator (?????)");
    }

    #[test]
    fn test_parse_identify_system_row() {
        let mut description = BytesMut::new();
        description.put_i16(2);
        for name in ["systemid", "xlogpos"] {
            description.put_slice(name.as_bytes());
            description.put_u8(0);
            description.put_slice(&[0u8; 18]);
        }
        let names = parse_row_description(description.freeze()).unwrap();
        assert_eq!(names, vec!["systemid", "xlogpos"]);

        let mut row = BytesMut::new();
        row.put_i16(2);
        row.put_i32(3);
        row.put_slice(b"123");
        row.put_i32(-1);
        let values = parse_data_row(row.freeze()).unwrap();
        assert_eq!(values, vec![Some("123".to_string()), None]);
    }

    #[test]
    fn test_parse_data_row_rejects_truncation() {
        let mut row = BytesMut::new();
        row.put_i16(1);
        row.put_i32(10);
        row.put_slice(b"abc");
        assert!(parse_data_row(row.freeze()).is_err());
    }
}
