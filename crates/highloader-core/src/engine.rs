//! Builds request messages at runtime and executes single attempts.

use crate::error::EngineError;
use crate::outcome::{Outcome, OutcomeAggregator};
use crate::params::CallParams;
use crate::reflector::SchemaReflector;
use crate::schema::CallPattern;
use crate::template;
use crate::transport::{CallTransport, GrpcTransport};
use prost_reflect::{DynamicMessage, MethodDescriptor};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tonic::metadata::{MetadataKey, MetadataMap, MetadataValue};
use tonic::{Code, Request, Status};
use tracing::{debug, info};

/// Per-attempt execution context: an optional absolute deadline.
#[derive(Debug, Clone, Copy, Default)]
pub struct CallContext {
    deadline: Option<Instant>,
}

impl CallContext {
    /// No deadline.
    pub fn background() -> Self {
        Self::default()
    }

    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            deadline: Some(deadline),
        }
    }

    pub fn with_timeout(timeout: Option<Duration>) -> Self {
        Self {
            deadline: timeout.map(|t| Instant::now() + t),
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }
}

#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Directories searched for schema imports.
    pub import_paths: Vec<PathBuf>,
    /// Dial during `open` instead of on the first attempt.
    pub eager_connect: bool,
    pub connect_timeout: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            import_paths: Vec::new(),
            eager_connect: false,
            connect_timeout: Duration::from_secs(5),
        }
    }
}

/// One target, one unary method, one set of counters.
///
/// `invoke` takes `&self` and holds the transport lock only long enough to
/// clone the handle, so any number of attempts may run at once.
pub struct CallEngine {
    target: String,
    method: MethodDescriptor,
    metadata: MetadataMap,
    transport_name: &'static str,
    /// Emptied by `close`; in-flight attempts keep their own clone.
    transport: Mutex<Option<Arc<dyn CallTransport>>>,
    aggregator: Arc<OutcomeAggregator>,
}

impl CallEngine {
    /// Open a gRPC connection to `target`. The channel is lazy unless
    /// `options.eager_connect` is set; a malformed address fails either way.
    pub async fn open(
        target: &str,
        method: MethodDescriptor,
        headers: &BTreeMap<String, String>,
        aggregator: Arc<OutcomeAggregator>,
        options: &EngineOptions,
    ) -> Result<Self, EngineError> {
        ensure_unary(&method)?;
        let transport = if options.eager_connect {
            GrpcTransport::connect(target, options.connect_timeout).await?
        } else {
            GrpcTransport::lazy(target)?
        };
        info!(
            "Opened {} connection to {} for {}",
            if options.eager_connect { "eager" } else { "lazy" },
            target,
            method.full_name()
        );
        Self::with_transport(target, method, headers, aggregator, Arc::new(transport))
    }

    pub fn with_transport(
        target: &str,
        method: MethodDescriptor,
        headers: &BTreeMap<String, String>,
        aggregator: Arc<OutcomeAggregator>,
        transport: Arc<dyn CallTransport>,
    ) -> Result<Self, EngineError> {
        ensure_unary(&method)?;
        Ok(Self {
            target: target.to_string(),
            method,
            metadata: build_metadata(headers)?,
            transport_name: transport.name(),
            transport: Mutex::new(Some(transport)),
            aggregator,
        })
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn method(&self) -> &MethodDescriptor {
        &self.method
    }

    pub fn transport_name(&self) -> &'static str {
        self.transport_name
    }

    pub fn aggregator(&self) -> &Arc<OutcomeAggregator> {
        &self.aggregator
    }

    /// Run one attempt: expand the template, build the request, call, and
    /// record exactly one outcome. Failures are counted before being
    /// returned; nothing is retried.
    pub async fn invoke(&self, ctx: &CallContext, raw_template: &str) -> Result<(), EngineError> {
        let message = match self.build_message(raw_template) {
            Ok(message) => message,
            Err(err) => {
                self.aggregator.increment_total();
                self.aggregator.increment_outcome(Outcome::BuildFailure);
                return Err(err);
            }
        };

        self.aggregator.increment_total();

        let Some(transport) = self.current_transport() else {
            self.aggregator.increment_outcome(Outcome::Unavailable);
            return Err(Status::unavailable("engine closed").into());
        };

        let mut request = Request::new(message);
        *request.metadata_mut() = self.metadata.clone();
        let remaining = ctx.remaining();
        if let Some(timeout) = remaining {
            request.set_timeout(timeout);
        }

        let call = transport.unary(&self.method, request);
        let result = match remaining {
            Some(timeout) => match tokio::time::timeout(timeout, call).await {
                Ok(result) => result,
                Err(_) => Err(Status::deadline_exceeded("deadline exceeded")),
            },
            None => call.await,
        };

        let code = match &result {
            Ok(_) => Code::Ok,
            Err(status) => status.code(),
        };
        self.aggregator.increment_outcome(Outcome::from(code));

        match result {
            Ok(response) => {
                debug!("Response {}: {:?}", self.method.name(), response.get_ref());
                Ok(())
            }
            Err(status) => Err(status.into()),
        }
    }

    /// Refuse further attempts and drop the engine's handle on the
    /// connection. Attempts already in flight finish on their own handles;
    /// the channel closes when the last of them completes.
    pub fn close(&self) {
        let released = match self.transport.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if released.is_some() {
            info!("Closed engine for {} at {}", self.method.full_name(), self.target);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.current_transport().is_none()
    }

    fn current_transport(&self) -> Option<Arc<dyn CallTransport>> {
        match self.transport.lock() {
            Ok(slot) => slot.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn build_message(&self, raw_template: &str) -> Result<DynamicMessage, EngineError> {
        let text = template::expand(raw_template)?;
        let descriptor = self.method.input();
        let decode_error = |e: serde_json::Error| EngineError::Decode {
            message_type: descriptor.full_name().to_string(),
            message: e.to_string(),
        };

        let mut deserializer = serde_json::Deserializer::from_str(&text);
        let message = DynamicMessage::deserialize(descriptor.clone(), &mut deserializer)
            .map_err(decode_error)?;
        deserializer.end().map_err(decode_error)?;
        Ok(message)
    }
}

impl std::fmt::Debug for CallEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallEngine")
            .field("target", &self.target)
            .field("method", &self.method.full_name())
            .field("transport", &self.transport_name)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Look up the wire descriptor for `params` and open a gRPC engine.
pub async fn build_engine(
    params: &CallParams,
    aggregator: Arc<OutcomeAggregator>,
    options: &EngineOptions,
) -> Result<CallEngine, EngineError> {
    let method = lookup_method(params, options)?;
    CallEngine::open(&params.target, method, &params.headers, aggregator, options).await
}

/// Same as [`build_engine`] but dispatching through `transport`.
pub fn build_engine_with_transport(
    params: &CallParams,
    aggregator: Arc<OutcomeAggregator>,
    options: &EngineOptions,
    transport: Arc<dyn CallTransport>,
) -> Result<CallEngine, EngineError> {
    let method = lookup_method(params, options)?;
    CallEngine::with_transport(&params.target, method, &params.headers, aggregator, transport)
}

fn lookup_method(params: &CallParams, options: &EngineOptions) -> Result<MethodDescriptor, EngineError> {
    let reflector = SchemaReflector::with_import_paths(options.import_paths.clone());
    let method = reflector.find_method_descriptor(
        &params.schema.source_path,
        &params.method,
        &params.service,
    )?;
    Ok(method)
}

fn ensure_unary(method: &MethodDescriptor) -> Result<(), EngineError> {
    let pattern =
        CallPattern::from_streaming(method.is_client_streaming(), method.is_server_streaming());
    if pattern != CallPattern::Unary {
        return Err(EngineError::UnsupportedCallPattern {
            method: method.full_name().to_string(),
            pattern: pattern.to_string(),
        });
    }
    Ok(())
}

fn build_metadata(headers: &BTreeMap<String, String>) -> Result<MetadataMap, EngineError> {
    let mut metadata = MetadataMap::new();
    for (key, value) in headers {
        let invalid = |message: String| EngineError::InvalidHeader {
            key: key.clone(),
            message,
        };
        let name = MetadataKey::from_bytes(key.as_bytes()).map_err(|e| invalid(e.to_string()))?;
        let value = MetadataValue::try_from(value.as_str()).map_err(|e| invalid(e.to_string()))?;
        metadata.insert(name, value);
    }
    Ok(metadata)
}
