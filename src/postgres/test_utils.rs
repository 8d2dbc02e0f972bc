use bytes::{BufMut, Bytes, BytesMut};
use std::collections::HashMap;

/// Builds pgoutput payloads (the data of XLogData frames) for decoder tests.
pub struct MockMessageBuilder {
    lsn: u64,
    timestamp: i64,
    relations: HashMap<u32, MockRelation>,
}

#[derive(Debug, Clone)]
pub struct MockRelation {
    pub schema: String,
    pub table: String,
    pub columns: Vec<MockColumn>,
}

#[derive(Debug, Clone)]
pub struct MockColumn {
    pub name: String,
    pub type_id: u32,
    pub is_key: bool,
}

/// One column of a mock tuple.
#[derive(Debug, Clone, Copy)]
pub enum Value<'a> {
    Null,
    Unchanged,
    Text(&'a str),
    Binary(&'a [u8]),
}

impl Default for MockMessageBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl MockMessageBuilder {
    pub fn new() -> Self {
        Self {
            lsn: 0x16B_3748,
            timestamp: 750_000_000_000_000, // 2023-10-07 in PG epoch microseconds
            relations: HashMap::new(),
        }
    }

    pub fn with_lsn(mut self, lsn: u64) -> Self {
        self.lsn = lsn;
        self
    }

    pub fn add_relation(
        mut self,
        id: u32,
        schema: &str,
        table: &str,
        columns: Vec<(&str, u32, bool)>,
    ) -> Self {
        let columns = columns
            .into_iter()
            .map(|(name, type_id, is_key)| MockColumn {
                name: name.to_string(),
                type_id,
                is_key,
            })
            .collect();

        self.relations.insert(
            id,
            MockRelation {
                schema: schema.to_string(),
                table: table.to_string(),
                columns,
            },
        );
        self
    }

    pub fn begin_message(&self, xid: u32) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(b'B');
        buf.put_u64(self.lsn);
        buf.put_i64(self.timestamp);
        buf.put_u32(xid);
        buf.freeze()
    }

    pub fn commit_message(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(b'C');
        buf.put_u8(0);
        buf.put_u64(self.lsn);
        buf.put_u64(self.lsn + 0x30);
        buf.put_i64(self.timestamp);
        buf.freeze()
    }

    pub fn relation_message(&self, rel_id: u32) -> Bytes {
        let relation = self
            .relations
            .get(&rel_id)
            .expect("Relation not found. Use add_relation() first.");

        let mut buf = BytesMut::new();
        buf.put_u8(b'R');
        buf.put_u32(rel_id);
        put_cstr(&mut buf, &relation.schema);
        put_cstr(&mut buf, &relation.table);
        buf.put_u8(b'd'); // replica identity default
        buf.put_u16(relation.columns.len() as u16);

        for column in &relation.columns {
            buf.put_u8(u8::from(column.is_key));
            put_cstr(&mut buf, &column.name);
            buf.put_u32(column.type_id);
            buf.put_i32(-1);
        }

        buf.freeze()
    }

    pub fn insert_message(&self, rel_id: u32, values: &[Value<'_>]) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(b'I');
        buf.put_u32(rel_id);
        buf.put_u8(b'N');
        put_tuple(&mut buf, values);
        buf.freeze()
    }

    /// `old` is tagged `kind` ('K' for key only, 'O' for the full row).
    pub fn update_message(
        &self,
        rel_id: u32,
        old: Option<(u8, &[Value<'_>])>,
        new: &[Value<'_>],
    ) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(b'U');
        buf.put_u32(rel_id);
        if let Some((kind, old)) = old {
            buf.put_u8(kind);
            put_tuple(&mut buf, old);
        }
        buf.put_u8(b'N');
        put_tuple(&mut buf, new);
        buf.freeze()
    }

    pub fn delete_message(&self, rel_id: u32, kind: u8, old: &[Value<'_>]) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(b'D');
        buf.put_u32(rel_id);
        buf.put_u8(kind);
        put_tuple(&mut buf, old);
        buf.freeze()
    }

    pub fn truncate_message(&self, rel_ids: &[u32]) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(b'T');
        buf.put_u32(rel_ids.len() as u32);
        buf.put_u8(0);
        for rel_id in rel_ids {
            buf.put_u32(*rel_id);
        }
        buf.freeze()
    }
}

fn put_cstr(buf: &mut BytesMut, value: &str) {
    buf.put_slice(value.as_bytes());
    buf.put_u8(0);
}

fn put_tuple(buf: &mut BytesMut, values: &[Value<'_>]) {
    buf.put_u16(values.len() as u16);
    for value in values {
        match value {
            Value::Null => buf.put_u8(b'n'),
            Value::Unchanged => buf.put_u8(b'u'),
            Value::Text(text) => {
                buf.put_u8(b't');
                buf.put_u32(text.len() as u32);
                buf.put_slice(text.as_bytes());
            }
            Value::Binary(data) => {
                buf.put_u8(b'b');
                buf.put_u32(data.len() as u32);
                buf.put_slice(data);
            }
        }
    }
}

/// Common PostgreSQL type OIDs.
pub mod type_oids {
    pub const BOOL: u32 = 16;
    pub const INT4: u32 = 23;
    pub const INT8: u32 = 20;
    pub const TEXT: u32 = 25;
    pub const TIMESTAMPTZ: u32 = 1184;
    pub const JSONB: u32 = 3802;
}

/// The `public.users` table most decoder tests run against.
pub fn users_builder() -> MockMessageBuilder {
    MockMessageBuilder::new().add_relation(
        1,
        "public",
        "users",
        vec![
            ("id", type_oids::INT4, true),
            ("name", type_oids::TEXT, false),
            ("email", type_oids::TEXT, false),
            ("active", type_oids::BOOL, false),
        ],
    )
}
