use serde_json::json;
use simrpc_core::{
    descriptor::resolve_from_files,
    message::{self, MessageError},
    prost_reflect::MessageDescriptor,
};
use support::protos;

mod support;

fn item_descriptor() -> MessageDescriptor {
    resolve_from_files(&protos(&["inventory.proto"]))
        .expect("Failed to resolve inventory.proto")
        .pool()
        .get_message_by_name("inventory.Item")
        .expect("inventory.Item not found")
}

#[test]
fn test_json_round_trip_keeps_every_set_field() {
    let desc = item_descriptor();
    let original = json!({
        "sku": "sku-1",
        "price": { "currency": "EUR", "units": "12", "nanos": 500000000 },
        "tags": ["red", "large"],
        "stockBySite": { "bcn": 3, "mad": 0 },
        "condition": "CONDITION_USED",
        "dimensions": { "width": 1.5, "height": 2.0 },
        "thumbnail": "aGVsbG8=",
        "discontinued": true
    });

    let msg = message::from_json(&desc, original.clone()).unwrap();
    let rendered = message::to_json(&msg).unwrap();
    let again = message::from_json(&desc, rendered.clone()).unwrap();

    assert_eq!(rendered, original);
    assert_eq!(message::to_json(&again).unwrap(), rendered);
    assert_eq!(again, msg);
}

#[test]
fn test_fields_are_coerced_recursively() {
    let desc = item_descriptor();
    let mut msg = message::new_message(&desc);

    message::set_field(&mut msg, "price", json!({ "currency": "USD", "units": 7 })).unwrap();
    message::set_field(&mut msg, "stock_by_site", json!({ "nyc": 4 })).unwrap();
    // Enums accept their number as well as their name.
    message::set_field(&mut msg, "condition", json!(1)).unwrap();

    assert_eq!(
        message::get_field(&msg, "price").unwrap(),
        json!({ "currency": "USD", "units": "7", "nanos": 0 })
    );
    assert_eq!(
        message::get_field(&msg, "stockBySite").unwrap(),
        json!({ "nyc": 4 })
    );
    assert_eq!(
        message::get_field(&msg, "condition").unwrap(),
        json!("CONDITION_NEW")
    );
}

#[test]
fn test_default_values_are_not_rendered() {
    let desc = item_descriptor();
    let msg = message::from_json(&desc, json!({ "sku": "", "tags": [] })).unwrap();

    assert_eq!(message::to_json(&msg).unwrap(), json!({}));
}

#[test]
fn test_schema_mismatches_are_reported() {
    let desc = item_descriptor();

    let err = message::from_json(&desc, json!({ "colour": "red" })).unwrap_err();
    assert!(matches!(
        err,
        MessageError::UnknownField { ref message, ref field }
            if message == "inventory.Item" && field == "colour"
    ));

    let err = message::from_json(&desc, json!({ "tags": "red" })).unwrap_err();
    assert!(matches!(err, MessageError::InvalidValue { .. }));

    let mut msg = message::new_message(&desc);
    let err = message::set_field(&mut msg, "condition", json!("CONDITION_BROKEN")).unwrap_err();
    assert!(matches!(err, MessageError::InvalidValue { .. }));

    let err = message::get_field(&msg, "colour").unwrap_err();
    assert!(matches!(err, MessageError::UnknownField { .. }));
}
