#[cfg(test)]
mod tests {
    use super::super::decoder::*;
    use super::super::test_utils::{type_oids, users_builder, MockMessageBuilder, Value};
    use super::super::types::{ChangeOperation, QualifiedName};
    use crate::Error;

    fn registered_decoder(builder: &MockMessageBuilder, rel_id: u32) -> PgOutputDecoder {
        let mut decoder = PgOutputDecoder::new();
        assert!(decoder.decode(&builder.relation_message(rel_id)).unwrap().is_none());
        decoder
    }

    fn text(value: &str) -> ColumnValue {
        ColumnValue::Text(value.to_string())
    }

    fn expect_change(message: Option<DecodedMessage>) -> RowChange {
        match message {
            Some(DecodedMessage::Change(change)) => change,
            other => panic!("Expected Change message, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_begin_message() {
        let builder = MockMessageBuilder::new().with_lsn(0x1000);
        let mut decoder = PgOutputDecoder::new();

        match decoder.decode(&builder.begin_message(12345)).unwrap() {
            Some(DecodedMessage::Begin { xid, final_lsn }) => {
                assert_eq!(xid, 12345);
                assert_eq!(final_lsn, 0x1000);
            }
            other => panic!("Expected Begin message, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_commit_message() {
        let builder = MockMessageBuilder::new().with_lsn(0x2000);
        let mut decoder = PgOutputDecoder::new();

        match decoder.decode(&builder.commit_message()).unwrap() {
            Some(DecodedMessage::Commit {
                commit_lsn,
                end_lsn,
            }) => {
                assert_eq!(commit_lsn, 0x2000);
                assert_eq!(end_lsn, 0x2030);
            }
            other => panic!("Expected Commit message, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_relation_message() {
        let builder = users_builder();
        let decoder = registered_decoder(&builder, 1);

        let relation = decoder.relation(1).unwrap();
        assert_eq!(relation.name, QualifiedName::new("public", "users"));
        assert_eq!(relation.columns.len(), 4);
        assert_eq!(relation.columns[0].name, "id");
        assert_eq!(relation.columns[0].type_id, type_oids::INT4);
        assert!(relation.columns[0].is_key);
        assert!(!relation.columns[1].is_key);
    }

    #[test]
    fn test_decode_insert_message() {
        let builder = users_builder();
        let mut decoder = registered_decoder(&builder, 1);
        decoder.decode(&builder.begin_message(77)).unwrap();

        let message = builder.insert_message(
            1,
            &[
                Value::Text("42"),
                Value::Text("John Doe"),
                Value::Null,
                Value::Text("t"),
            ],
        );
        let change = expect_change(decoder.decode(&message).unwrap());

        assert_eq!(change.relation, QualifiedName::new("public", "users"));
        assert_eq!(change.op, ChangeOperation::Insert);
        assert_eq!(change.xid, Some(77));
        assert!(change.old.is_none());
        assert_eq!(
            change.new.unwrap(),
            vec![
                ("id".to_string(), text("42")),
                ("name".to_string(), text("John Doe")),
                ("email".to_string(), ColumnValue::Null),
                ("active".to_string(), text("t")),
            ]
        );
    }

    #[test]
    fn test_decode_update_with_key_tuple() {
        let builder = users_builder();
        let mut decoder = registered_decoder(&builder, 1);

        let key: &[Value] = &[Value::Text("10"), Value::Null, Value::Null, Value::Null];
        let message = builder.update_message(
            1,
            Some((b'K', key)),
            &[
                Value::Text("11"),
                Value::Text("New Name"),
                Value::Unchanged,
                Value::Text("f"),
            ],
        );
        let change = expect_change(decoder.decode(&message).unwrap());

        assert_eq!(change.op, ChangeOperation::Update);
        let old = change.old.unwrap();
        assert_eq!(old[0], ("id".to_string(), text("10")));

        // new tuple must be read after the old one, not from the same offset
        let new = change.new.unwrap();
        assert_eq!(new[0], ("id".to_string(), text("11")));
        assert_eq!(new[1], ("name".to_string(), text("New Name")));
        assert_eq!(new[2], ("email".to_string(), ColumnValue::Unchanged));
    }

    #[test]
    fn test_decode_update_without_old_tuple() {
        let builder = users_builder();
        let mut decoder = registered_decoder(&builder, 1);

        let message = builder.update_message(
            1,
            None,
            &[Value::Text("1"), Value::Text("a"), Value::Text("a@x"), Value::Text("t")],
        );
        let change = expect_change(decoder.decode(&message).unwrap());
        assert!(change.old.is_none());
        assert_eq!(change.new.unwrap().len(), 4);
    }

    #[test]
    fn test_decode_delete_message() {
        let builder = users_builder();
        let mut decoder = registered_decoder(&builder, 1);

        let message = builder.delete_message(
            1,
            b'K',
            &[Value::Text("99"), Value::Null, Value::Null, Value::Null],
        );
        let change = expect_change(decoder.decode(&message).unwrap());

        assert_eq!(change.op, ChangeOperation::Delete);
        assert!(change.new.is_none());
        assert_eq!(change.old.unwrap()[0], ("id".to_string(), text("99")));
    }

    #[test]
    fn test_relation_cache_per_table() {
        let builder = users_builder().add_relation(
            2,
            "sales",
            "orders",
            vec![
                ("order_id", type_oids::INT8, true),
                ("placed_at", type_oids::TIMESTAMPTZ, false),
                ("details", type_oids::JSONB, false),
            ],
        );
        let mut decoder = registered_decoder(&builder, 1);
        decoder.decode(&builder.relation_message(2)).unwrap();

        let message = builder.insert_message(
            2,
            &[
                Value::Text("5000000000"),
                Value::Text("2024-01-01 00:00:00+00"),
                Value::Text(r#"{"items": 3}"#),
            ],
        );
        let change = expect_change(decoder.decode(&message).unwrap());
        assert_eq!(change.relation, QualifiedName::new("sales", "orders"));
        assert_eq!(
            change.new.unwrap()[2],
            ("details".to_string(), text(r#"{"items": 3}"#))
        );
    }

    #[test]
    fn test_truncate_is_ignored() {
        let builder = users_builder();
        let mut decoder = registered_decoder(&builder, 1);
        assert!(decoder.decode(&builder.truncate_message(&[1, 9])).unwrap().is_none());
    }

    #[test]
    fn test_binary_values_are_rejected() {
        let builder = users_builder();
        let mut decoder = registered_decoder(&builder, 1);

        let message = builder.insert_message(
            1,
            &[
                Value::Binary(&42i32.to_be_bytes()),
                Value::Null,
                Value::Null,
                Value::Null,
            ],
        );
        assert!(matches!(
            decoder.decode(&message),
            Err(Error::InvalidMessage { .. })
        ));
    }

    #[test]
    fn test_error_handling() {
        let builder = users_builder();
        let mut decoder = PgOutputDecoder::new();

        assert!(decoder.decode(&[]).unwrap().is_none());
        assert!(decoder.decode(&[b'x', 1, 2, 3]).unwrap().is_none());

        let begin = builder.begin_message(123);
        assert!(decoder.decode(&begin[..10]).is_err());

        // relation not announced yet
        let insert = builder.insert_message(1, &[Value::Text("1")]);
        assert!(decoder.decode(&insert).is_err());

        // column count differs from the relation
        decoder.decode(&builder.relation_message(1)).unwrap();
        assert!(decoder.decode(&insert).is_err());

        // text value longer than the message
        let mut cut = builder
            .insert_message(
                1,
                &[Value::Text("1"), Value::Text("abc"), Value::Null, Value::Null],
            )
            .to_vec();
        cut.truncate(cut.len() - 6);
        assert!(decoder.decode(&cut).is_err());
    }
}
