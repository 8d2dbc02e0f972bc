use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeOperation {
    Insert,
    Update,
    Delete,
}

/// A `schema.table` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QualifiedName {
    pub schema: String,
    pub name: String,
}

impl QualifiedName {
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            name: name.into(),
        }
    }

    /// Parses `schema.table`, or a bare `table` placed in `default_schema`.
    pub fn parse(text: &str, default_schema: &str) -> Result<Self> {
        let parts: Vec<&str> = text.split('.').collect();
        match parts.as_slice() {
            [name] if !name.is_empty() => Ok(Self::new(default_schema, *name)),
            [schema, name] if !schema.is_empty() && !name.is_empty() => {
                Ok(Self::new(*schema, *name))
            }
            _ => Err(Error::Config(format!("invalid table name '{}'", text))),
        }
    }

    /// Quoted identifier usable in SQL text.
    pub fn quoted(&self) -> String {
        format!(
            "{}.{}",
            postgres_protocol::escape::escape_identifier(&self.schema),
            postgres_protocol::escape::escape_identifier(&self.name)
        )
    }
}

impl fmt::Display for QualifiedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.name)
    }
}

/// Pairs one source table with the target table it is replicated into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableMapping {
    pub source: QualifiedName,
    pub target: QualifiedName,
    pub columns: Vec<String>,
    pub primary_key: Vec<String>,
}

impl TableMapping {
    /// Builds a mapping, rejecting an empty key or key columns that are
    /// not part of the column list.
    pub fn new(
        source: QualifiedName,
        target: QualifiedName,
        columns: Vec<String>,
        primary_key: Vec<String>,
    ) -> Result<Self> {
        if columns.is_empty() {
            return Err(Error::Config(format!("table {} has no columns", source)));
        }
        if primary_key.is_empty() {
            return Err(Error::Config(format!("table {} has no primary key", source)));
        }
        if let Some(missing) = primary_key.iter().find(|key| !columns.contains(key)) {
            return Err(Error::Config(format!(
                "primary key column '{}' of {} is not in its column list",
                missing, source
            )));
        }

        Ok(Self {
            source,
            target,
            columns,
            primary_key,
        })
    }

    pub fn is_key_column(&self, column: &str) -> bool {
        self.primary_key.iter().any(|key| key == column)
    }

    pub fn is_mapped_column(&self, column: &str) -> bool {
        self.columns.iter().any(|c| c == column)
    }
}

/// Read-only lookup of mappings by source table.
#[derive(Debug, Clone, Default)]
pub struct TableMappings {
    by_source: HashMap<QualifiedName, TableMapping>,
}

impl TableMappings {
    pub fn new(mappings: Vec<TableMapping>) -> Self {
        Self {
            by_source: mappings
                .into_iter()
                .map(|mapping| (mapping.source.clone(), mapping))
                .collect(),
        }
    }

    pub fn get(&self, source: &QualifiedName) -> Option<&TableMapping> {
        self.by_source.get(source)
    }

    pub fn resolve(&self, source: &QualifiedName) -> Result<&TableMapping> {
        self.get(source)
            .ok_or_else(|| Error::UnknownTable(source.to_string()))
    }

    pub fn iter(&self) -> impl Iterator<Item = &TableMapping> {
        self.by_source.values()
    }

    pub fn len(&self) -> usize {
        self.by_source.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_source.is_empty()
    }
}

/// One captured row mutation, as it travels through the queue.
///
/// Values are the text representation PostgreSQL sends in pgoutput.
/// `values` holds the new row image for inserts and updates; a column
/// missing from it was an unchanged TOAST value and must be left alone.
/// `key` identifies the row as it was before the change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub table: QualifiedName,
    pub op: ChangeOperation,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub values: BTreeMap<String, Option<String>>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub key: BTreeMap<String, Option<String>>,
    pub lsn: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub xid: Option<u32>,
}

impl ChangeRecord {
    /// Encodes the record into the string token stored on the queue.
    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(self).map_err(Into::into)
    }

    pub fn decode(token: &str) -> Result<Self> {
        serde_json::from_str(token).map_err(Into::into)
    }

    /// Key of the row after the change, taken from the new row image.
    pub fn new_key(&self, mapping: &TableMapping) -> BTreeMap<String, Option<String>> {
        mapping
            .primary_key
            .iter()
            .filter_map(|column| {
                self.values
                    .get(column)
                    .map(|value| (column.clone(), value.clone()))
            })
            .collect()
    }
}

pub fn format_lsn(lsn: u64) -> String {
    format!("{:X}/{:X}", lsn >> 32, lsn & 0xFFFFFFFF)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn users_mapping() -> TableMapping {
        TableMapping::new(
            QualifiedName::new("public", "users"),
            QualifiedName::new("replica", "users"),
            vec!["id".to_string(), "name".to_string()],
            vec!["id".to_string()],
        )
        .unwrap()
    }

    #[test]
    fn test_lsn_format() {
        assert_eq!(format_lsn(0x16_B374_D848), "16/B374D848");
        assert_eq!(format_lsn(0), "0/0");
    }

    #[test]
    fn test_qualified_name_parsing() {
        assert_eq!(
            QualifiedName::parse("users", "public").unwrap(),
            QualifiedName::new("public", "users")
        );
        assert_eq!(
            QualifiedName::parse("crm.users", "public").unwrap(),
            QualifiedName::new("crm", "users")
        );
        assert!(QualifiedName::parse("a.b.c", "public").is_err());
        assert!(QualifiedName::parse(".users", "public").is_err());
    }

    #[test]
    fn test_quoted_name_escapes_identifiers() {
        let name = QualifiedName::new("public", "we\"ird");
        assert_eq!(name.quoted(), "\"public\".\"we\"\"ird\"");
    }

    #[test]
    fn test_mapping_requires_key_within_columns() {
        let err = TableMapping::new(
            QualifiedName::new("public", "users"),
            QualifiedName::new("public", "users"),
            vec!["id".to_string()],
            vec!["email".to_string()],
        );
        assert!(matches!(err, Err(Error::Config(_))));

        let err = TableMapping::new(
            QualifiedName::new("public", "users"),
            QualifiedName::new("public", "users"),
            vec!["id".to_string()],
            vec![],
        );
        assert!(matches!(err, Err(Error::Config(_))));
    }

    #[test]
    fn test_resolve_unknown_table() {
        let mappings = TableMappings::new(vec![users_mapping()]);
        assert!(mappings.resolve(&QualifiedName::new("public", "users")).is_ok());
        assert!(matches!(
            mappings.resolve(&QualifiedName::new("public", "orders")),
            Err(Error::UnknownTable(_))
        ));
    }

    #[test]
    fn test_record_token_keeps_nulls_and_missing_columns_apart() {
        let record = ChangeRecord {
            table: QualifiedName::new("public", "users"),
            op: ChangeOperation::Update,
            values: BTreeMap::from([
                ("id".to_string(), Some("7".to_string())),
                ("name".to_string(), None),
            ]),
            key: BTreeMap::from([("id".to_string(), Some("7".to_string()))]),
            lsn: "0/16B3748".to_string(),
            xid: Some(42),
        };

        let token = record.encode().unwrap();
        let decoded = ChangeRecord::decode(&token).unwrap();
        assert_eq!(decoded, record);
        assert_eq!(decoded.values.get("name"), Some(&None));
        assert_eq!(decoded.values.get("bio"), None);
        assert!(ChangeRecord::decode("{not json").is_err());
    }

    #[test]
    fn test_new_key_comes_from_row_image() {
        let record = ChangeRecord {
            table: QualifiedName::new("public", "users"),
            op: ChangeOperation::Update,
            values: BTreeMap::from([
                ("id".to_string(), Some("8".to_string())),
                ("name".to_string(), Some("bob".to_string())),
            ]),
            key: BTreeMap::from([("id".to_string(), Some("7".to_string()))]),
            lsn: "0/1".to_string(),
            xid: None,
        };

        let new_key = record.new_key(&users_mapping());
        assert_eq!(new_key, BTreeMap::from([("id".to_string(), Some("8".to_string()))]));
        assert_ne!(new_key, record.key);
    }
}
