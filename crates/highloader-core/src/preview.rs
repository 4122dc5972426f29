//! Example payloads shown to users before they write a template.

use crate::schema::{Field, FieldType, Message, ParsedSchema, ScalarKind};
use serde_json::{Map, Value};

const DEFAULT_STRING: &str = "qwerty";
const DEFAULT_INT: i64 = 1;
const DEFAULT_FLOAT: f64 = 0.1;
const DEFAULT_BOOL: bool = false;
const ENUM_NOT_FOUND: &str = "EnumExampleNotFound";

/// Nested messages deeper than this are rendered as `{}`.
pub const MAX_EXAMPLE_DEPTH: usize = 8;

/// Build a representative JSON object for `message`.
pub fn example_value(message: &Message, schema: &ParsedSchema) -> Value {
    message_value(message, schema, 0)
}

/// Pretty-printed form of [`example_value`], ready to use as a template.
pub fn example_payload(message: &Message, schema: &ParsedSchema) -> String {
    let value = example_value(message, schema);
    serde_json::to_string_pretty(&value).unwrap_or_else(|_| "{}".to_string())
}

fn message_value(message: &Message, schema: &ParsedSchema, depth: usize) -> Value {
    let mut object = Map::new();
    if depth >= MAX_EXAMPLE_DEPTH {
        return Value::Object(object);
    }
    for field in &message.fields {
        let value = field_value(field, schema, depth);
        let value = if field.repeated {
            Value::Array(vec![value])
        } else {
            value
        };
        object.insert(field.json_name.clone(), value);
    }
    Value::Object(object)
}

fn field_value(field: &Field, schema: &ParsedSchema, depth: usize) -> Value {
    match field.field_type {
        FieldType::Map => Value::Object(Map::new()),
        FieldType::Message => match &field.message {
            Some(nested) => message_value(nested, schema, depth + 1),
            None => Value::Object(Map::new()),
        },
        FieldType::Enum => {
            let value = field
                .enum_name
                .as_deref()
                .and_then(|name| schema.find_enum(name))
                .and_then(|e| e.random_value())
                .unwrap_or(ENUM_NOT_FOUND);
            Value::String(value.to_string())
        }
        FieldType::Scalar(kind) => scalar_value(kind),
    }
}

fn scalar_value(kind: ScalarKind) -> Value {
    if kind.is_integer() {
        return Value::from(DEFAULT_INT);
    }
    if kind.is_float() {
        return Value::from(DEFAULT_FLOAT);
    }
    match kind {
        ScalarKind::Bool => Value::Bool(DEFAULT_BOOL),
        ScalarKind::String => Value::String(DEFAULT_STRING.to_string()),
        _ => Value::String(String::new()),
    }
}
