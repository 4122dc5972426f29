//! Language-neutral view of an RPC interface.
//!
//! The model is built once by the [`crate::reflector`] and is immutable
//! afterwards; configurations share it behind an `Arc`.

use rand::seq::SliceRandom;
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;

/// Scalar wire kinds, named after their protobuf spelling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ScalarKind {
    Double,
    Float,
    Int32,
    Int64,
    Uint32,
    Uint64,
    Sint32,
    Sint64,
    Fixed32,
    Fixed64,
    Sfixed32,
    Sfixed64,
    Bool,
    String,
    Bytes,
}

impl ScalarKind {
    pub fn is_integer(self) -> bool {
        !matches!(
            self,
            ScalarKind::Double
                | ScalarKind::Float
                | ScalarKind::Bool
                | ScalarKind::String
                | ScalarKind::Bytes
        )
    }

    pub fn is_float(self) -> bool {
        matches!(self, ScalarKind::Double | ScalarKind::Float)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "kind", content = "scalar", rename_all = "lowercase")]
pub enum FieldType {
    Scalar(ScalarKind),
    Enum,
    Message,
    Map,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Enum {
    pub name: String,
    pub full_name: String,
    pub values: Vec<String>,
}

impl Enum {
    /// Pick one value uniformly at random. Only used for example payloads.
    pub fn random_value(&self) -> Option<&str> {
        self.values
            .choose(&mut rand::thread_rng())
            .map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Field {
    /// Protobuf field name.
    pub name: String,
    /// Name used by the JSON mapping (lowerCamelCase by default).
    pub json_name: String,
    pub field_type: FieldType,
    pub repeated: bool,
    /// Present iff `field_type` is [`FieldType::Message`].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<Box<Message>>,
    /// Fully-qualified back-reference into [`ParsedSchema::enums`].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enum_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Message {
    pub name: String,
    pub full_name: String,
    pub fields: Vec<Field>,
    /// Set on the field-less stub that stands in for a message already
    /// being expanded further up the same path.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub recursive: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallPattern {
    Unary,
    ServerStreaming,
    ClientStreaming,
    BidiStreaming,
}

impl CallPattern {
    pub fn from_streaming(client_streaming: bool, server_streaming: bool) -> Self {
        match (client_streaming, server_streaming) {
            (false, false) => CallPattern::Unary,
            (false, true) => CallPattern::ServerStreaming,
            (true, false) => CallPattern::ClientStreaming,
            (true, true) => CallPattern::BidiStreaming,
        }
    }
}

impl fmt::Display for CallPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CallPattern::Unary => "unary",
            CallPattern::ServerStreaming => "server-streaming",
            CallPattern::ClientStreaming => "client-streaming",
            CallPattern::BidiStreaming => "bidi-streaming",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Method {
    pub name: String,
    pub call_pattern: CallPattern,
    pub request: Message,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Service {
    pub name: String,
    pub full_name: String,
    pub methods: Vec<Method>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParsedSchema {
    pub services: Vec<Service>,
    pub enums: Vec<Enum>,
    pub package: String,
    pub source_path: PathBuf,
}

impl ParsedSchema {
    /// First service whose short or fully-qualified name matches exactly.
    pub fn find_service(&self, service: &str) -> Option<&Service> {
        self.services
            .iter()
            .find(|s| s.name == service || s.full_name == service)
    }

    /// First method named `method` on the first service matching `service`.
    pub fn find_method(&self, service: &str, method: &str) -> Option<&Method> {
        self.find_service(service)?
            .methods
            .iter()
            .find(|m| m.name == method)
    }

    /// Exact fully-qualified match first, then the first enum with that
    /// short name. Nested enums in different messages may share a short name.
    pub fn find_enum(&self, name: &str) -> Option<&Enum> {
        self.enums
            .iter()
            .find(|e| e.full_name == name)
            .or_else(|| self.enums.iter().find(|e| e.name == name))
    }

    /// Every (service, method) pair that can be dispatched, in declaration order.
    pub fn unary_methods(&self) -> impl Iterator<Item = (&Service, &Method)> {
        self.services.iter().flat_map(|service| {
            service
                .methods
                .iter()
                .filter(|m| m.call_pattern == CallPattern::Unary)
                .map(move |m| (service, m))
        })
    }
}
