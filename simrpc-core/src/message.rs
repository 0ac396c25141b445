//! # Dynamic Messages
//!
//! Helpers to build and inspect `prost_reflect::DynamicMessage` values through the generic
//! `serde_json::Value` space, without any compiled per-type code.
//!
//! All coercions go through `prost-reflect`'s proto3 JSON mapping, so nested messages,
//! repeated and map fields, enums (by name or number), 64-bit integers (numbers or strings)
//! and bytes (base64) follow the same rules whether a whole message or a single field is
//! converted.
use prost_reflect::{
    DynamicMessage, FieldDescriptor, MessageDescriptor, ReflectMessage, SerializeOptions,
};
use serde_json::{Map, Value};

#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("Field '{field}' is not part of message '{message}'")]
    UnknownField { message: String, field: String },

    #[error("Message '{message}' expects a JSON object, got {found}")]
    NotAnObject {
        message: String,
        found: &'static str,
    },

    #[error("Invalid value for '{target}': '{source}'")]
    InvalidValue {
        target: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to map message '{message}' to JSON: '{source}'")]
    Json {
        message: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Creates an empty message bound to `desc`.
pub fn new_message(desc: &MessageDescriptor) -> DynamicMessage {
    DynamicMessage::new(desc.clone())
}

/// Sets a single field from a JSON value.
///
/// `name` may be either the proto field name (`user_id`) or its JSON name (`userId`).
/// A `null` value clears the field.
pub fn set_field(message: &mut DynamicMessage, name: &str, value: Value) -> Result<(), MessageError> {
    let desc = message.descriptor();
    let field = lookup_field(&desc, name)?;

    if value.is_null() {
        message.clear_field(&field);
        return Ok(());
    }

    // Deserialize a scratch message holding only this field, then move the
    // coerced value over.
    let mut single = Map::new();
    single.insert(field.json_name().to_string(), value);

    let scratch = DynamicMessage::deserialize(desc.clone(), Value::Object(single)).map_err(
        |source| MessageError::InvalidValue {
            target: field.full_name().to_string(),
            source,
        },
    )?;

    message.set_field(&field, scratch.get_field(&field).into_owned());
    Ok(())
}

/// Reads a single field as a JSON value.
///
/// Unset fields yield their default value, the way proto3 readers see them.
pub fn get_field(message: &DynamicMessage, name: &str) -> Result<Value, MessageError> {
    let desc = message.descriptor();
    let field = lookup_field(&desc, name)?;

    let mut single = DynamicMessage::new(desc.clone());
    single.set_field(&field, message.get_field(&field).into_owned());

    let options = SerializeOptions::new().skip_default_fields(false);
    let json = single
        .serialize_with_options(serde_json::value::Serializer, &options)
        .map_err(|source| MessageError::Json {
            message: desc.full_name().to_string(),
            source,
        })?;

    Ok(json
        .get(field.json_name())
        .cloned()
        .unwrap_or(Value::Null))
}

/// Converts a message into a JSON object.
///
/// Fields holding their default value are omitted, following the proto3 JSON mapping.
pub fn to_json(message: &DynamicMessage) -> Result<Value, MessageError> {
    serde_json::to_value(message).map_err(|source| MessageError::Json {
        message: message.descriptor().full_name().to_string(),
        source,
    })
}

/// Builds a message of type `desc` from a JSON object.
pub fn from_json(desc: &MessageDescriptor, value: Value) -> Result<DynamicMessage, MessageError> {
    let Value::Object(fields) = &value else {
        return Err(MessageError::NotAnObject {
            message: desc.full_name().to_string(),
            found: json_kind(&value),
        });
    };

    for name in fields.keys() {
        lookup_field(desc, name)?;
    }

    DynamicMessage::deserialize(desc.clone(), value).map_err(|source| {
        MessageError::InvalidValue {
            target: desc.full_name().to_string(),
            source,
        }
    })
}

fn lookup_field(desc: &MessageDescriptor, name: &str) -> Result<FieldDescriptor, MessageError> {
    desc.get_field_by_name(name)
        .or_else(|| desc.get_field_by_json_name(name))
        .ok_or_else(|| MessageError::UnknownField {
            message: desc.full_name().to_string(),
            field: name.to_string(),
        })
}

pub(crate) fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost_reflect::DescriptorPool;
    use prost_types::{
        DescriptorProto, FieldDescriptorProto, FileDescriptorProto, FileDescriptorSet,
        field_descriptor_proto::{Label, Type},
    };
    use serde_json::json;

    fn field(name: &str, number: i32, ty: Type, label: Label) -> FieldDescriptorProto {
        FieldDescriptorProto {
            name: Some(name.to_string()),
            number: Some(number),
            r#type: Some(ty.into()),
            label: Some(label.into()),
            json_name: None,
            ..Default::default()
        }
    }

    fn note_descriptor() -> MessageDescriptor {
        let note = DescriptorProto {
            name: Some("Note".to_string()),
            field: vec![
                field("title", 1, Type::String, Label::Optional),
                field("tags", 2, Type::String, Label::Repeated),
                field("view_count", 3, Type::Int64, Label::Optional),
            ],
            ..Default::default()
        };

        let file = FileDescriptorProto {
            name: Some("note.proto".to_string()),
            package: Some("notes".to_string()),
            syntax: Some("proto3".to_string()),
            message_type: vec![note],
            ..Default::default()
        };

        DescriptorPool::from_file_descriptor_set(FileDescriptorSet { file: vec![file] })
            .unwrap()
            .get_message_by_name("notes.Note")
            .unwrap()
    }

    #[test]
    fn set_and_get_accept_proto_and_json_names() {
        let mut note = new_message(&note_descriptor());

        set_field(&mut note, "view_count", json!(7)).unwrap();
        assert_eq!(get_field(&note, "viewCount").unwrap(), json!("7"));

        set_field(&mut note, "tags", json!(["a", "b"])).unwrap();
        assert_eq!(get_field(&note, "tags").unwrap(), json!(["a", "b"]));
    }

    #[test]
    fn unset_fields_read_as_defaults() {
        let note = new_message(&note_descriptor());
        assert_eq!(get_field(&note, "title").unwrap(), json!(""));
        assert_eq!(get_field(&note, "tags").unwrap(), json!([]));
    }

    #[test]
    fn null_clears_a_field() {
        let mut note = new_message(&note_descriptor());
        set_field(&mut note, "title", json!("draft")).unwrap();
        set_field(&mut note, "title", Value::Null).unwrap();
        assert_eq!(to_json(&note).unwrap(), json!({}));
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let mut note = new_message(&note_descriptor());
        let err = set_field(&mut note, "author", json!("me")).unwrap_err();
        assert!(matches!(
            err,
            MessageError::UnknownField { ref field, .. } if field == "author"
        ));

        let err = from_json(&note_descriptor(), json!({ "author": "me" })).unwrap_err();
        assert!(matches!(err, MessageError::UnknownField { .. }));
    }

    #[test]
    fn mismatched_values_are_invalid() {
        let mut note = new_message(&note_descriptor());
        let err = set_field(&mut note, "tags", json!({ "not": "a list" })).unwrap_err();
        assert!(matches!(err, MessageError::InvalidValue { .. }));

        let err = from_json(&note_descriptor(), json!(["not", "an", "object"])).unwrap_err();
        assert!(matches!(
            err,
            MessageError::NotAnObject { found: "an array", .. }
        ));
    }
}
