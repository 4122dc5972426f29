use crate::error::EngineError;
use prost::Message as _;
use prost_reflect::{DynamicMessage, MessageDescriptor, MethodDescriptor};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::sleep;
use tonic::codec::{Codec, DecodeBuf, Decoder, EncodeBuf, Encoder};
use tonic::codegen::http::uri::PathAndQuery;
use tonic::transport::{Channel, Endpoint};
use tonic::{Request, Response, Status};
use tracing::debug;

pub type CallFuture<'a> =
    Pin<Box<dyn Future<Output = Result<Response<DynamicMessage>, Status>> + Send + 'a>>;

/// Executes one unary exchange for a method known only by its descriptor.
pub trait CallTransport: Send + Sync {
    fn name(&self) -> &'static str;

    fn unary<'a>(
        &'a self,
        method: &'a MethodDescriptor,
        request: Request<DynamicMessage>,
    ) -> CallFuture<'a>;
}

/// Plain-text HTTP/2 gRPC transport over a shared tonic channel.
pub struct GrpcTransport {
    channel: Channel,
    target: String,
}

impl GrpcTransport {
    /// Build a channel that dials on first use. Only the address is
    /// validated here; an unreachable target fails each attempt instead.
    pub fn lazy(target: &str) -> Result<Self, EngineError> {
        let endpoint = endpoint_for(target)?;
        Ok(Self {
            channel: endpoint.connect_lazy(),
            target: target.to_string(),
        })
    }

    /// Dial now and fail if the target cannot be reached within `timeout`.
    pub async fn connect(target: &str, timeout: Duration) -> Result<Self, EngineError> {
        let endpoint = endpoint_for(target)?.connect_timeout(timeout);
        let channel = endpoint
            .connect()
            .await
            .map_err(|e| EngineError::Connection {
                target: target.to_string(),
                message: e.to_string(),
            })?;
        Ok(Self {
            channel,
            target: target.to_string(),
        })
    }

    pub fn target(&self) -> &str {
        &self.target
    }
}

impl CallTransport for GrpcTransport {
    fn name(&self) -> &'static str {
        "grpc"
    }

    fn unary<'a>(
        &'a self,
        method: &'a MethodDescriptor,
        request: Request<DynamicMessage>,
    ) -> CallFuture<'a> {
        Box::pin(async move {
            let path = method_path(method)?;
            let mut grpc = tonic::client::Grpc::new(self.channel.clone());
            grpc.ready()
                .await
                .map_err(|e| Status::unavailable(format!("connection not ready: {e}")))?;
            grpc.unary(request, path, DynamicCodec::new(method.output()))
                .await
        })
    }
}

/// Normalise `host:port` or `http://host:port` into a tonic endpoint.
pub fn endpoint_for(target: &str) -> Result<Endpoint, EngineError> {
    let connection_error = |message: String| EngineError::Connection {
        target: target.to_string(),
        message,
    };

    let trimmed = target.trim();
    if trimmed.is_empty() {
        return Err(connection_error("empty target address".to_string()));
    }
    let with_scheme = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("http://{trimmed}")
    };

    let url = url::Url::parse(&with_scheme).map_err(|e| connection_error(e.to_string()))?;
    if url.scheme() != "http" {
        return Err(connection_error(format!(
            "unsupported scheme {:?}, only plain-text http is supported",
            url.scheme()
        )));
    }
    let host = url
        .host_str()
        .ok_or_else(|| connection_error("address has no host".to_string()))?;
    let port = url
        .port_or_known_default()
        .ok_or_else(|| connection_error("address has no port".to_string()))?;

    let uri = format!("http://{host}:{port}");
    debug!("Resolved target {:?} to {}", target, uri);
    Endpoint::from_shared(uri).map_err(|e| connection_error(e.to_string()))
}

fn method_path(method: &MethodDescriptor) -> Result<PathAndQuery, Status> {
    let path = format!("/{}/{}", method.parent_service().full_name(), method.name());
    path.parse::<PathAndQuery>()
        .map_err(|e| Status::internal(format!("invalid method path {path:?}: {e}")))
}

/// Codec that encodes any [`DynamicMessage`] and decodes responses against
/// a descriptor chosen at runtime.
#[derive(Debug, Clone)]
pub struct DynamicCodec {
    response: MessageDescriptor,
}

impl DynamicCodec {
    pub fn new(response: MessageDescriptor) -> Self {
        Self { response }
    }
}

impl Codec for DynamicCodec {
    type Encode = DynamicMessage;
    type Decode = DynamicMessage;
    type Encoder = DynamicEncoder;
    type Decoder = DynamicDecoder;

    fn encoder(&mut self) -> Self::Encoder {
        DynamicEncoder
    }

    fn decoder(&mut self) -> Self::Decoder {
        DynamicDecoder {
            response: self.response.clone(),
        }
    }
}

#[derive(Debug)]
pub struct DynamicEncoder;

impl Encoder for DynamicEncoder {
    type Item = DynamicMessage;
    type Error = Status;

    fn encode(&mut self, item: Self::Item, dst: &mut EncodeBuf<'_>) -> Result<(), Self::Error> {
        item.encode(dst)
            .map_err(|e| Status::internal(format!("failed to encode request: {e}")))
    }
}

#[derive(Debug)]
pub struct DynamicDecoder {
    response: MessageDescriptor,
}

impl Decoder for DynamicDecoder {
    type Item = DynamicMessage;
    type Error = Status;

    fn decode(&mut self, src: &mut DecodeBuf<'_>) -> Result<Option<Self::Item>, Self::Error> {
        let message = DynamicMessage::decode(self.response.clone(), src)
            .map_err(|e| Status::internal(format!("failed to decode response: {e}")))?;
        Ok(Some(message))
    }
}

/// In-process transport for tests and dry runs: waits `delay`, then
/// answers with `code` (an empty response message on `Ok`).
pub struct MockTransport {
    delay: Duration,
    code: tonic::Code,
    calls: AtomicU64,
    last_headers: Mutex<Vec<(String, String)>>,
}

impl MockTransport {
    pub fn new(delay: Duration) -> Self {
        Self::with_code(delay, tonic::Code::Ok)
    }

    pub fn with_code(delay: Duration, code: tonic::Code) -> Self {
        Self {
            delay,
            code,
            calls: AtomicU64::new(0),
            last_headers: Mutex::new(Vec::new()),
        }
    }

    /// Exchanges started so far.
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    /// ASCII metadata of the most recent request, sorted by key.
    pub fn last_headers(&self) -> Vec<(String, String)> {
        self.last_headers
            .lock()
            .map(|headers| headers.clone())
            .unwrap_or_default()
    }
}

impl CallTransport for MockTransport {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn unary<'a>(
        &'a self,
        method: &'a MethodDescriptor,
        request: Request<DynamicMessage>,
    ) -> CallFuture<'a> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::Relaxed);

            let mut headers: Vec<(String, String)> = request
                .metadata()
                .iter()
                .filter_map(|entry| match entry {
                    tonic::metadata::KeyAndValueRef::Ascii(key, value) => Some((
                        key.as_str().to_string(),
                        value.to_str().unwrap_or_default().to_string(),
                    )),
                    tonic::metadata::KeyAndValueRef::Binary(..) => None,
                })
                .collect();
            headers.sort();
            if let Ok(mut last) = self.last_headers.lock() {
                *last = headers;
            }

            sleep(self.delay).await;

            if self.code == tonic::Code::Ok {
                Ok(Response::new(DynamicMessage::new(method.output())))
            } else {
                Err(Status::new(self.code, "mock failure"))
            }
        })
    }
}
