//! # Simulation Client
//!
//! [`SimClient`] invokes any resolved method by name with JSON payloads.
//!
//! The client resolves its schema once, when connecting: from local `.proto` files when
//! given, through the peer's reflection service otherwise. File-resolved clients connect
//! on their first call. The streaming shape of the
//! target method alone decides the shape of payloads and responses:
//!
//! | Shape            | Payload                     | Response          |
//! |------------------|-----------------------------|-------------------|
//! | Unary            | object                      | object            |
//! | Client streaming | array of objects            | object            |
//! | Server streaming | object                      | array of objects  |
//! | Bidirectional    | object or array of objects  | array of objects  |
//!
//! Payloads are validated against the method's input type before anything is sent.
//!
//! ```no_run
//! use simrpc_core::client::SimClient;
//! use serde_json::json;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let mut client = SimClient::connect("127.0.0.1:50051", None).await?;
//!
//! let reply = client
//!     .invoke_rpc("helloworld.Greeter.SayHello", json!({ "name": "X" }))
//!     .await?;
//! println!("{}", reply.into_json());
//!
//! client.close();
//! # Ok(())
//! # }
//! ```
use crate::{
    BoxError,
    descriptor::{
        DEFAULT_CONNECT_TIMEOUT, ProtoFiles, ResolveError, RpcShape, ServiceSet,
        resolve_from_files, resolve_with_reflection,
    },
    grpc::client::{
        CallOptions, ClientConnectError, GrpcClient, GrpcRequestError, dial, dial_lazy,
    },
    message::{self, json_kind},
    reflection::client::ReflectionClient,
};
use http_body::Body as HttpBody;
use prost_reflect::{DynamicMessage, MethodDescriptor};
use serde_json::Value;
use std::time::Duration;
use tonic::{Streaming, client::GrpcService, transport::Channel};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Connect(#[from] ClientConnectError),

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error("Service '{0}' not found")]
    ServiceNotFound(String),

    #[error("Method '{0}' not found")]
    MethodNotFound(String),

    #[error("Invalid argument for '{method}': {reason}")]
    InvalidArgument { method: String, reason: String },

    #[error("Client for '{method}' was not ready: '{source}'")]
    NotReady {
        method: String,
        #[source]
        source: BoxError,
    },

    #[error("Invalid metadata for '{method}': '{source}'")]
    InvalidMetadata {
        method: String,
        #[source]
        source: GrpcRequestError,
    },

    #[error("'{method}' failed with status {}: '{}'", .status.code(), .status.message())]
    Status {
        method: String,
        #[source]
        status: tonic::Status,
    },

    #[error("Failed to read the response of '{method}': '{source}'")]
    Response {
        method: String,
        #[source]
        source: message::MessageError,
    },

    #[error("Client is closed")]
    Closed,
}

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub connect_timeout: Duration,
    /// Deadline sent with every call as `grpc-timeout`.
    pub request_timeout: Option<Duration>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            request_timeout: None,
        }
    }
}

/// The JSON result of an invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum InvokeResponse {
    /// The response of a unary or client-streaming method.
    Single(Value),
    /// The responses of a server-streaming or bidirectional method, in arrival order.
    Stream(Vec<Value>),
}

impl InvokeResponse {
    pub fn into_json(self) -> Value {
        match self {
            InvokeResponse::Single(value) => value,
            InvokeResponse::Stream(values) => Value::Array(values),
        }
    }
}

/// A client able to call any method of a resolved [`ServiceSet`].
#[derive(Debug, Clone)]
pub struct SimClient<S = Channel> {
    grpc: Option<GrpcClient<S>>,
    services: ServiceSet,
    request_timeout: Option<Duration>,
}

impl SimClient<Channel> {
    /// Resolves the services of `address`, from `protos` when given and through server
    /// reflection otherwise.
    ///
    /// With `protos` no connection is made until the first call, so the peer may be down
    /// or not deployed yet. Reflection needs a live peer and fails fast without one.
    pub async fn connect(address: &str, protos: Option<&ProtoFiles>) -> Result<Self, ClientError> {
        Self::connect_with(address, protos, ClientOptions::default()).await
    }

    pub async fn connect_with(
        address: &str,
        protos: Option<&ProtoFiles>,
        options: ClientOptions,
    ) -> Result<Self, ClientError> {
        let (channel, services) = match protos {
            Some(protos) if !protos.is_empty() => {
                let services = resolve_from_files(protos)?;
                (dial_lazy(address, options.connect_timeout)?, services)
            }
            _ => {
                let channel = dial(address, options.connect_timeout).await?;
                let services =
                    resolve_with_reflection(&mut ReflectionClient::new(channel.clone())).await?;
                (channel, services)
            }
        };

        tracing::debug!(%address, services = ?services.list_services(), "client ready");

        Ok(Self {
            grpc: Some(GrpcClient::new(channel)),
            services,
            request_timeout: options.request_timeout,
        })
    }
}

impl<S> SimClient<S>
where
    S: GrpcService<tonic::body::Body>,
    S::Error: Into<BoxError>,
    S::ResponseBody: HttpBody<Data = tonic::codegen::Bytes> + Send + 'static,
    <S::ResponseBody as HttpBody>::Error: Into<BoxError> + Send,
{
    /// Wraps an already connected transport (e.g. an in-process service).
    pub fn from_service(service: S, services: ServiceSet) -> Self {
        Self {
            grpc: Some(GrpcClient::new(service)),
            services,
            request_timeout: None,
        }
    }

    /// Service names in resolution order.
    pub fn list_services(&self) -> Result<&[String], ClientError> {
        self.ensure_open()?;
        Ok(self.services.list_services())
    }

    /// Method names of `service`, in declaration order.
    pub fn list_methods(&self, service: &str) -> Result<Vec<String>, ClientError> {
        self.ensure_open()?;
        self.services
            .list_methods(service)
            .ok_or_else(|| ClientError::ServiceNotFound(service.to_string()))
    }

    pub async fn invoke_rpc(
        &mut self,
        method: &str,
        payload: Value,
    ) -> Result<InvokeResponse, ClientError> {
        self.invoke_rpc_with_metadata(method, payload, Vec::new())
            .await
    }

    /// Invokes `method` (`package.Service.Method` or `package.Service/Method`), attaching
    /// `headers` as request metadata.
    pub async fn invoke_rpc_with_metadata(
        &mut self,
        method: &str,
        payload: Value,
        headers: Vec<(String, String)>,
    ) -> Result<InvokeResponse, ClientError> {
        let grpc = self.grpc.as_mut().ok_or(ClientError::Closed)?;
        let desc = self
            .services
            .method(method)
            .ok_or_else(|| ClientError::MethodNotFound(method.to_string()))?;

        let options = CallOptions {
            headers,
            timeout: self.request_timeout,
        };
        let shape = RpcShape::of(&desc);
        tracing::debug!(method = %desc.full_name(), %shape, "invoking method");

        match shape {
            RpcShape::Unary => {
                let request = single(&desc, payload)?;
                let response = grpc
                    .unary(&desc, request, &options)
                    .await
                    .map_err(|err| request_error(&desc, err))?
                    .map_err(|status| status_error(&desc, status))?;
                Ok(InvokeResponse::Single(render(&desc, &response)?))
            }
            RpcShape::ClientStreaming => {
                let requests = sequence(&desc, payload)?;
                let response = grpc
                    .client_streaming(&desc, tokio_stream::iter(requests), &options)
                    .await
                    .map_err(|err| request_error(&desc, err))?
                    .map_err(|status| status_error(&desc, status))?;
                Ok(InvokeResponse::Single(render(&desc, &response)?))
            }
            RpcShape::ServerStreaming => {
                let request = single(&desc, payload)?;
                let stream = grpc
                    .server_streaming(&desc, request, &options)
                    .await
                    .map_err(|err| request_error(&desc, err))?
                    .map_err(|status| status_error(&desc, status))?;
                Ok(InvokeResponse::Stream(collect(&desc, stream).await?))
            }
            RpcShape::Bidirectional => {
                let requests = match payload {
                    Value::Object(_) => vec![single(&desc, payload)?],
                    payload => sequence(&desc, payload)?,
                };
                let stream = grpc
                    .bidirectional_streaming(&desc, tokio_stream::iter(requests), &options)
                    .await
                    .map_err(|err| request_error(&desc, err))?
                    .map_err(|status| status_error(&desc, status))?;
                Ok(InvokeResponse::Stream(collect(&desc, stream).await?))
            }
        }
    }

    /// Releases the connection. Every later call fails with [`ClientError::Closed`].
    pub fn close(&mut self) {
        self.grpc = None;
    }

    pub fn is_closed(&self) -> bool {
        self.grpc.is_none()
    }

    fn ensure_open(&self) -> Result<(), ClientError> {
        if self.is_closed() {
            return Err(ClientError::Closed);
        }
        Ok(())
    }
}

fn invalid(method: &MethodDescriptor, reason: impl Into<String>) -> ClientError {
    ClientError::InvalidArgument {
        method: method.full_name().to_string(),
        reason: reason.into(),
    }
}

fn single(method: &MethodDescriptor, payload: Value) -> Result<DynamicMessage, ClientError> {
    if !payload.is_object() {
        return Err(invalid(
            method,
            format!(
                "a {} request expects a JSON object, got {}",
                RpcShape::of(method),
                json_kind(&payload)
            ),
        ));
    }

    message::from_json(&method.input(), payload).map_err(|err| invalid(method, err.to_string()))
}

fn sequence(method: &MethodDescriptor, payload: Value) -> Result<Vec<DynamicMessage>, ClientError> {
    let Value::Array(items) = payload else {
        return Err(invalid(
            method,
            format!(
                "a {} request expects a JSON array of objects, got {}",
                RpcShape::of(method),
                json_kind(&payload)
            ),
        ));
    };

    items
        .into_iter()
        .enumerate()
        .map(|(index, item)| {
            message::from_json(&method.input(), item)
                .map_err(|err| invalid(method, format!("item {index}: {err}")))
        })
        .collect()
}

fn render(method: &MethodDescriptor, response: &DynamicMessage) -> Result<Value, ClientError> {
    message::to_json(response).map_err(|source| ClientError::Response {
        method: method.full_name().to_string(),
        source,
    })
}

async fn collect(
    method: &MethodDescriptor,
    mut stream: Streaming<DynamicMessage>,
) -> Result<Vec<Value>, ClientError> {
    let mut responses = Vec::new();
    while let Some(response) = stream
        .message()
        .await
        .map_err(|status| status_error(method, status))?
    {
        responses.push(render(method, &response)?);
    }
    Ok(responses)
}

fn status_error(method: &MethodDescriptor, status: tonic::Status) -> ClientError {
    ClientError::Status {
        method: method.full_name().to_string(),
        status,
    }
}

fn request_error(method: &MethodDescriptor, err: GrpcRequestError) -> ClientError {
    let method = method.full_name().to_string();
    match err {
        GrpcRequestError::ClientNotReady(source) => ClientError::NotReady { method, source },
        source => ClientError::InvalidMetadata { method, source },
    }
}
