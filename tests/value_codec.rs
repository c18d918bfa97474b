//! End-to-end properties of the value wire encoding.
//!
//! These tests build realistic value trees through the public API and check
//! that they survive the codec unchanged, and that damaged input is rejected
//! with an error rather than a panic.

use pretty_assertions::assert_eq;
use xmmsv_ipc::serialize::{deserialize_bytes, serialize_to_bytes, CodecError, MAX_DEPTH};
use xmmsv_ipc::{deserialize, serialize, CollType, Value, ValueType};

/// A medialib-style reply: a list of property dicts plus a query collection.
fn sample_tree() -> Value {
    let track = Value::build_dict([
        ("title", Value::new_string("Blåbärssoppa")),
        ("duration", Value::new_int(215_000)),
        ("gain", Value::new_float(-3.5)),
        ("picture_front", Value::new_binary(vec![0u8, 1, 2, 254, 255])),
        ("lookup", Value::new_error("no lyrics")),
        ("missing", Value::new_none()),
    ]);

    let query = Value::new_coll(CollType::Equals);
    query.coll_attribute_set("field", "artist").unwrap();
    query.coll_attribute_set("value", "Kent").unwrap();
    query.coll_add_operand(&Value::universe()).unwrap();
    let ordered = query.add_order_operator(&Value::new_string("-tracknr")).unwrap();

    let ids = Value::new_coll(CollType::IdList);
    ids.coll_set_idlist(&[5, 3, 9, -1]).unwrap();

    let flags = Value::new_bitbuffer();
    flags.bitbuffer_put_bits(3, 0b101).unwrap();
    flags.bitbuffer_put_bits(17, 0x1_2345).unwrap();

    Value::build_list([
        track,
        ordered,
        ids,
        flags,
        Value::make_stringlist(&["server", "client/*"]),
    ])
}

#[test]
fn test_nested_tree_round_trip() {
    let tree = sample_tree();
    let bytes = serialize_to_bytes(&tree).expect("encodable");
    let back = deserialize_bytes(&bytes).expect("decodable");

    assert_eq!(back, tree);
    assert!(!back.ptr_eq(&tree));
    assert_eq!(back.list_get(4).unwrap().list_restricted_type().unwrap(), Some(ValueType::String));
    assert_eq!(back.list_get(3).unwrap().bitbuffer_len(), Some(20));
}

#[test]
fn test_dict_order_survives_encoding() {
    let dict = Value::new_dict();
    for key in ["zeta", "alpha", "mid"] {
        dict.dict_set_string(key, key).unwrap();
    }
    let back = deserialize(&serialize(&dict).unwrap()).unwrap();
    assert_eq!(back.dict_keys().unwrap(), vec!["zeta", "alpha", "mid"]);
}

#[test]
fn test_collection_structure_survives_encoding() {
    let tree = sample_tree();
    let back = deserialize_bytes(&serialize_to_bytes(&tree).unwrap()).unwrap();

    let order = back.list_get(1).unwrap();
    assert_eq!(order.coll_type(), Some(CollType::Order));
    assert_eq!(order.coll_attribute_get_string("direction").as_deref(), Some("DESC"));
    assert_eq!(order.coll_attribute_get_string("field").as_deref(), Some("tracknr"));

    let equals = &order.coll_operands().unwrap()[0];
    assert_eq!(equals.coll_type(), Some(CollType::Equals));
    assert_eq!(equals.coll_operands().unwrap()[0].coll_type(), Some(CollType::Universe));

    let ids = back.list_get(2).unwrap();
    assert_eq!(ids.coll_idlist().unwrap(), vec![5, 3, 9, -1]);
}

#[test]
fn test_every_truncation_is_rejected() {
    let bytes = serialize_to_bytes(&sample_tree()).unwrap();
    for cut in 0..bytes.len() {
        let result = deserialize_bytes(&bytes[..cut]);
        assert!(result.is_err(), "prefix of {} bytes decoded", cut);
    }
}

#[test]
fn test_appended_garbage_is_rejected() {
    let mut bytes = serialize_to_bytes(&sample_tree()).unwrap();
    bytes.extend_from_slice(&[0, 0]);
    assert_eq!(deserialize_bytes(&bytes), Err(CodecError::TrailingBytes(2)));
}

#[test]
fn test_corrupted_tags_never_panic() {
    let bytes = serialize_to_bytes(&sample_tree()).unwrap();
    for at in 0..bytes.len() {
        for replacement in [0x0a, 0x7f, 0xff] {
            let mut damaged = bytes.clone();
            damaged[at] = replacement;
            // Some flips still decode to a valid value; none may panic.
            let _ = deserialize_bytes(&damaged);
        }
    }
}

#[test]
fn test_depth_limit_applies_to_decoding() {
    // [LIST, no restriction, count 1] repeated past the limit.
    let mut bytes = Vec::new();
    for _ in 0..=MAX_DEPTH {
        bytes.extend_from_slice(&[ValueType::List.tag(), 0, 0, 0, 0, 1]);
    }
    bytes.push(ValueType::None.tag());
    assert_eq!(deserialize_bytes(&bytes), Err(CodecError::TooDeep));
}

#[test]
fn test_only_serialized_forms_deserialize() {
    assert_eq!(
        deserialize(&Value::new_int(3)),
        Err(CodecError::NotSerialized(ValueType::Int64))
    );
    let as_binary = Value::new_binary(serialize_to_bytes(&Value::new_int(3)).unwrap());
    assert_eq!(deserialize(&as_binary).unwrap().get_int(), Some(3));
}
