use crate::error::SchemaError;
use crate::schema::{CallPattern, ParsedSchema};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_RATE: u64 = 1;

/// Everything one dispatch loop needs. Built once per call configuration
/// and not changed while the loop runs.
#[derive(Debug, Clone)]
pub struct CallParams {
    pub target: String,
    /// Fully-qualified service name, e.g. `demo.echo.Echo`.
    pub service: String,
    pub method: String,
    pub call_pattern: CallPattern,
    pub payload_template: String,
    pub headers: BTreeMap<String, String>,
    /// Calls per second.
    pub rate: u64,
    pub deadline: Option<Duration>,
    pub stop_after: Option<Duration>,
    pub schema: Arc<ParsedSchema>,
}

impl CallParams {
    /// Resolve `service`/`method` against `schema` and copy the method's
    /// call pattern. `service` may be the short or fully-qualified name.
    pub fn new(
        schema: Arc<ParsedSchema>,
        target: impl Into<String>,
        service: &str,
        method: &str,
    ) -> Result<Self, SchemaError> {
        let service_model = schema
            .find_service(service)
            .ok_or_else(|| SchemaError::ServiceNotFound(service.to_string()))?;
        let method_model = schema
            .find_method(service, method)
            .ok_or_else(|| SchemaError::MethodNotFound {
                service: service.to_string(),
                method: method.to_string(),
            })?;

        Ok(Self {
            target: target.into(),
            service: service_model.full_name.clone(),
            method: method_model.name.clone(),
            call_pattern: method_model.call_pattern,
            payload_template: "{}".to_string(),
            headers: BTreeMap::new(),
            rate: DEFAULT_RATE,
            deadline: None,
            stop_after: None,
            schema,
        })
    }

    pub fn with_template(mut self, template: impl Into<String>) -> Self {
        self.payload_template = template.into();
        self
    }

    pub fn with_rate(mut self, rate: u64) -> Self {
        self.rate = rate;
        self
    }

    pub fn with_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn with_stop_after(mut self, stop_after: Option<Duration>) -> Self {
        self.stop_after = stop_after;
        self
    }

    /// Later values for the same key replace earlier ones.
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// `service/method` label used in logs and result files.
    pub fn label(&self) -> String {
        format!("{}/{}", self.service, self.method)
    }
}
