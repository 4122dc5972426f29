use std::path::PathBuf;

/// Failures while reading or resolving a schema source.
#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    #[error("failed to parse {path:?}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("service {0:?} not found")]
    ServiceNotFound(String),

    #[error("method {method:?} not found for service {service:?}")]
    MethodNotFound { service: String, method: String },
}

/// Failures while expanding a payload template.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TemplateError {
    #[error("template syntax error at byte {offset}: {message}")]
    Syntax { offset: usize, message: String },

    #[error("template evaluation error in {directive:?}: {message}")]
    Eval { directive: String, message: String },
}

/// Failures while building an engine or executing one attempt.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error("connection to {target:?} failed: {message}")]
    Connection { target: String, message: String },

    #[error("invalid header {key:?}: {message}")]
    InvalidHeader { key: String, message: String },

    #[error("method {method:?} uses call pattern {pattern}, only unary calls can be dispatched")]
    UnsupportedCallPattern { method: String, pattern: String },

    #[error("processing template message failed: {0}")]
    Template(#[from] TemplateError),

    #[error("payload does not match {message_type}: {message}")]
    Decode { message_type: String, message: String },

    #[error("call returned {code:?}: {message}")]
    CallOutcome { code: tonic::Code, message: String },
}

impl From<tonic::Status> for EngineError {
    fn from(status: tonic::Status) -> Self {
        EngineError::CallOutcome {
            code: status.code(),
            message: status.message().to_string(),
        }
    }
}

/// Failures while starting a dispatch loop.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("rate must be greater than zero")]
    InvalidRate,

    #[error("dispatch loop already started")]
    AlreadyStarted,

    #[error("aggregator is not the one the engine records into")]
    AggregatorMismatch,
}

/// A malformed field in a persisted run configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid {field}: {message}")]
pub struct ConfigParseError {
    pub field: String,
    pub message: String,
}

impl ConfigParseError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Why one request entry of a run configuration could not be turned into
/// call parameters.
#[derive(Debug, thiserror::Error)]
pub enum RequestConfigError {
    #[error(transparent)]
    Config(#[from] ConfigParseError),

    #[error(transparent)]
    Schema(#[from] SchemaError),
}
