use bytes::Buf;
use std::collections::HashMap;
use tracing::{debug, trace, warn};

use super::types::{format_lsn, ChangeOperation, QualifiedName};
use crate::{Error, Result};

#[derive(Debug, Clone)]
pub struct RelationInfo {
    pub id: u32,
    pub name: QualifiedName,
    pub columns: Vec<ColumnInfo>,
}

#[derive(Debug, Clone)]
pub struct ColumnInfo {
    pub name: String,
    pub type_id: u32,
    pub is_key: bool,
}

/// A single column of a decoded tuple.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnValue {
    Null,
    /// TOASTed value that did not change; pgoutput does not resend it.
    Unchanged,
    Text(String),
}

pub type TupleData = Vec<(String, ColumnValue)>;

/// A row-level change with its tuples resolved against the relation cache.
#[derive(Debug, Clone)]
pub struct RowChange {
    pub relation: QualifiedName,
    pub op: ChangeOperation,
    /// Old key ('K') or full old row ('O'); absent when the key did not change.
    pub old: Option<TupleData>,
    pub new: Option<TupleData>,
    pub xid: Option<u32>,
}

#[derive(Debug)]
pub enum DecodedMessage {
    Begin { xid: u32, final_lsn: u64 },
    Commit { commit_lsn: u64, end_lsn: u64 },
    Change(RowChange),
}

/// Stateful decoder for pgoutput protocol version 1 messages.
///
/// Relation messages are cached so later row messages can be resolved;
/// they produce no output on their own.
pub struct PgOutputDecoder {
    relations: HashMap<u32, RelationInfo>,
    current_xid: Option<u32>,
}

impl Default for PgOutputDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl PgOutputDecoder {
    pub fn new() -> Self {
        Self {
            relations: HashMap::new(),
            current_xid: None,
        }
    }

    pub fn relation(&self, id: u32) -> Option<&RelationInfo> {
        self.relations.get(&id)
    }

    /// Decodes one pgoutput message (the payload of an XLogData frame).
    pub fn decode(&mut self, data: &[u8]) -> Result<Option<DecodedMessage>> {
        if data.is_empty() {
            return Ok(None);
        }

        let mut cursor = data;
        let msg_type = cursor.get_u8();

        match msg_type {
            b'B' => self.decode_begin(cursor),
            b'C' => self.decode_commit(cursor),
            b'R' => self.decode_relation(cursor),
            b'I' => self.decode_insert(cursor),
            b'U' => self.decode_update(cursor),
            b'D' => self.decode_delete(cursor),
            b'T' => self.decode_truncate(cursor),
            b'O' | b'Y' | b'M' => {
                trace!("Skipping pgoutput message type: {}", msg_type as char);
                Ok(None)
            }
            _ => {
                debug!("Unknown pgoutput message type: {}", msg_type as char);
                Ok(None)
            }
        }
    }

    fn decode_begin(&mut self, mut cursor: &[u8]) -> Result<Option<DecodedMessage>> {
        need(cursor, 20, "BEGIN message")?;

        let final_lsn = cursor.get_u64();
        let _timestamp = cursor.get_i64();
        let xid = cursor.get_u32();

        self.current_xid = Some(xid);

        trace!("BEGIN: lsn={}, xid={}", format_lsn(final_lsn), xid);
        Ok(Some(DecodedMessage::Begin { xid, final_lsn }))
    }

    fn decode_commit(&mut self, mut cursor: &[u8]) -> Result<Option<DecodedMessage>> {
        need(cursor, 25, "COMMIT message")?;

        let _flags = cursor.get_u8();
        let commit_lsn = cursor.get_u64();
        let end_lsn = cursor.get_u64();
        let _timestamp = cursor.get_i64();

        self.current_xid = None;

        trace!("COMMIT: lsn={}", format_lsn(end_lsn));
        Ok(Some(DecodedMessage::Commit {
            commit_lsn,
            end_lsn,
        }))
    }

    fn decode_relation(&mut self, mut cursor: &[u8]) -> Result<Option<DecodedMessage>> {
        need(cursor, 4, "RELATION message")?;
        let rel_id = cursor.get_u32();

        let schema = read_cstr(&mut cursor, "namespace")?;
        let table = read_cstr(&mut cursor, "relation name")?;

        need(cursor, 3, "RELATION header")?;
        let _replica_identity = cursor.get_u8();
        let num_columns = cursor.get_u16();

        let mut columns = Vec::with_capacity(num_columns as usize);

        for _ in 0..num_columns {
            need(cursor, 1, "column flags")?;
            let flags = cursor.get_u8();
            let name = read_cstr(&mut cursor, "column name")?;

            need(cursor, 8, "column type")?;
            let type_id = cursor.get_u32();
            let _type_modifier = cursor.get_i32();

            columns.push(ColumnInfo {
                name,
                type_id,
                is_key: (flags & 1) != 0,
            });
        }

        let relation = RelationInfo {
            id: rel_id,
            name: QualifiedName::new(schema, table),
            columns,
        };

        debug!("RELATION: {}={}", rel_id, relation.name);
        self.relations.insert(rel_id, relation);

        Ok(None)
    }

    fn decode_insert(&mut self, mut cursor: &[u8]) -> Result<Option<DecodedMessage>> {
        need(cursor, 5, "INSERT message")?;

        let rel_id = cursor.get_u32();
        let tuple_type = cursor.get_u8();

        if tuple_type != b'N' {
            return Err(Error::InvalidMessage {
                message: format!("Unexpected tuple type in INSERT: {}", tuple_type as char),
            });
        }

        let relation = self.lookup(rel_id)?;
        let new_tuple = decode_tuple_data(&mut cursor, &relation.columns)?;

        Ok(Some(DecodedMessage::Change(RowChange {
            relation: relation.name.clone(),
            op: ChangeOperation::Insert,
            old: None,
            new: Some(new_tuple),
            xid: self.current_xid,
        })))
    }

    fn decode_update(&mut self, mut cursor: &[u8]) -> Result<Option<DecodedMessage>> {
        need(cursor, 5, "UPDATE message")?;

        let rel_id = cursor.get_u32();
        let relation = self.lookup(rel_id)?;

        let mut old_tuple = None;
        let mut tuple_type = cursor.get_u8();

        if tuple_type == b'O' || tuple_type == b'K' {
            old_tuple = Some(decode_tuple_data(&mut cursor, &relation.columns)?);
            need(cursor, 1, "UPDATE new tuple")?;
            tuple_type = cursor.get_u8();
        }

        if tuple_type != b'N' {
            return Err(Error::InvalidMessage {
                message: format!("Unexpected tuple type in UPDATE: {}", tuple_type as char),
            });
        }

        let new_tuple = decode_tuple_data(&mut cursor, &relation.columns)?;

        Ok(Some(DecodedMessage::Change(RowChange {
            relation: relation.name.clone(),
            op: ChangeOperation::Update,
            old: old_tuple,
            new: Some(new_tuple),
            xid: self.current_xid,
        })))
    }

    fn decode_delete(&mut self, mut cursor: &[u8]) -> Result<Option<DecodedMessage>> {
        need(cursor, 5, "DELETE message")?;

        let rel_id = cursor.get_u32();
        let tuple_type = cursor.get_u8();

        if tuple_type != b'O' && tuple_type != b'K' {
            return Err(Error::InvalidMessage {
                message: format!("Unexpected tuple type in DELETE: {}", tuple_type as char),
            });
        }

        let relation = self.lookup(rel_id)?;
        let old_tuple = decode_tuple_data(&mut cursor, &relation.columns)?;

        Ok(Some(DecodedMessage::Change(RowChange {
            relation: relation.name.clone(),
            op: ChangeOperation::Delete,
            old: Some(old_tuple),
            new: None,
            xid: self.current_xid,
        })))
    }

    fn decode_truncate(&mut self, mut cursor: &[u8]) -> Result<Option<DecodedMessage>> {
        need(cursor, 5, "TRUNCATE message")?;
        let num_relations = cursor.get_u32() as usize;
        let _options = cursor.get_u8();
        need(cursor, num_relations * 4, "TRUNCATE relation ids")?;

        for _ in 0..num_relations {
            let rel_id = cursor.get_u32();
            let name = self
                .relations
                .get(&rel_id)
                .map(|r| r.name.to_string())
                .unwrap_or_else(|| rel_id.to_string());
            warn!("TRUNCATE of {} is not replicated", name);
        }
        Ok(None)
    }

    fn lookup(&self, rel_id: u32) -> Result<&RelationInfo> {
        self.relations.get(&rel_id).ok_or_else(|| Error::InvalidMessage {
            message: format!("Unknown relation ID: {}", rel_id),
        })
    }
}

fn decode_tuple_data(cursor: &mut &[u8], columns: &[ColumnInfo]) -> Result<TupleData> {
    need(*cursor, 2, "tuple header")?;
    let num_columns = cursor.get_u16();

    if num_columns as usize != columns.len() {
        return Err(Error::InvalidMessage {
            message: format!("Column count mismatch: {} vs {}", num_columns, columns.len()),
        });
    }

    let mut tuple = Vec::with_capacity(columns.len());

    for column in columns {
        need(*cursor, 1, "column kind")?;
        let value = match cursor.get_u8() {
            b'n' => ColumnValue::Null,
            b'u' => ColumnValue::Unchanged,
            b't' => {
                need(*cursor, 4, "text value length")?;
                let len = cursor.get_u32() as usize;
                need(*cursor, len, "text value")?;
                let text = String::from_utf8_lossy(&cursor[..len]).to_string();
                cursor.advance(len);
                ColumnValue::Text(text)
            }
            b'b' => {
                return Err(Error::InvalidMessage {
                    message: "Binary tuple values are not supported".to_string(),
                });
            }
            other => {
                return Err(Error::InvalidMessage {
                    message: format!("Unknown column type: {}", other as char),
                });
            }
        };
        tuple.push((column.name.clone(), value));
    }

    Ok(tuple)
}

fn need(cursor: &[u8], len: usize, what: &str) -> Result<()> {
    if cursor.remaining() < len {
        return Err(Error::InvalidMessage {
            message: format!("Truncated {}: need {} bytes, have {}", what, len, cursor.remaining()),
        });
    }
    Ok(())
}

fn read_cstr(cursor: &mut &[u8], what: &str) -> Result<String> {
    let end = cursor
        .iter()
        .position(|b| *b == 0)
        .ok_or_else(|| Error::InvalidMessage {
            message: format!("Unterminated {}", what),
        })?;
    let value = String::from_utf8_lossy(&cursor[..end]).to_string();
    cursor.advance(end + 1);
    Ok(value)
}
