//! # Dynamic gRPC Client
//!
//! A thin layer over `tonic::client::Grpc` that sends and receives `DynamicMessage`s.
//!
//! The request path (`/package.Service/Method`) and the response decoder both come from
//! the [`MethodDescriptor`] passed to each call, so one client serves every method of
//! every service behind the same connection.
//!
//! Each call takes [`CallOptions`]: string headers become request metadata and the
//! optional timeout travels as `grpc-timeout`.
//!
//! Calls return a nested result. The outer error means the request never left
//! ([`GrpcRequestError`]); the inner one is the status the server answered with.
use super::codec::DynamicCodec;
use crate::BoxError;
use futures_util::Stream;
use http::uri::PathAndQuery;
use http_body::Body as HttpBody;
use prost_reflect::{DynamicMessage, MethodDescriptor};
use std::{str::FromStr, time::Duration};
use tonic::{
    Streaming,
    client::GrpcService,
    metadata::{
        MetadataKey, MetadataValue,
        errors::{InvalidMetadataKey, InvalidMetadataValue},
    },
    transport::{Channel, Endpoint},
};

#[derive(Debug, thiserror::Error)]
pub enum ClientConnectError {
    #[error("'{0}' is not a valid server address: '{1}'")]
    InvalidUrl(String, #[source] tonic::transport::Error),
    #[error("Could not reach '{0}': '{1}'")]
    ConnectionFailed(String, #[source] tonic::transport::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum GrpcRequestError {
    #[error("Transport not ready: '{0}'")]
    ClientNotReady(#[source] BoxError),
    #[error("'{key}' is not a valid metadata key: '{source}'")]
    InvalidMetadataKey {
        key: String,
        #[source]
        source: InvalidMetadataKey,
    },
    #[error("Metadata '{key}' has an invalid value: '{source}'")]
    InvalidMetadataValue {
        key: String,
        #[source]
        source: InvalidMetadataValue,
    },
}

/// Per-call settings attached to every outgoing request.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    pub headers: Vec<(String, String)>,
    pub timeout: Option<Duration>,
}

/// Dials a gRPC server, failing if it cannot be reached within `connect_timeout`.
///
/// `address` may omit the scheme (`127.0.0.1:50051`), in which case plain-text
/// `http://` is assumed.
pub async fn dial(address: &str, connect_timeout: Duration) -> Result<Channel, ClientConnectError> {
    endpoint(address, connect_timeout)?
        .connect()
        .await
        .map_err(|e| ClientConnectError::ConnectionFailed(address.to_string(), e))
}

/// Like [`dial`], but only connects on the first call.
///
/// An unreachable server surfaces as an `UNAVAILABLE` status on each call.
pub fn dial_lazy(address: &str, connect_timeout: Duration) -> Result<Channel, ClientConnectError> {
    Ok(endpoint(address, connect_timeout)?.connect_lazy())
}

fn endpoint(address: &str, connect_timeout: Duration) -> Result<Endpoint, ClientConnectError> {
    let uri = if address.contains("://") {
        address.to_string()
    } else {
        format!("http://{address}")
    };

    Ok(Endpoint::new(uri)
        .map_err(|e| ClientConnectError::InvalidUrl(address.to_string(), e))?
        .connect_timeout(connect_timeout))
}

/// Sends and receives `DynamicMessage`s over any gRPC transport.
#[derive(Debug, Clone)]
pub struct GrpcClient<S = Channel> {
    inner: tonic::client::Grpc<S>,
}

/// What a call produced: the decoded response, or the status the server failed it with.
pub type CallResult<T> = Result<Result<T, tonic::Status>, GrpcRequestError>;

impl<S> GrpcClient<S>
where
    S: GrpcService<tonic::body::Body>,
    S::Error: Into<BoxError>,
    S::ResponseBody: HttpBody<Data = tonic::codegen::Bytes> + Send + 'static,
    <S::ResponseBody as HttpBody>::Error: Into<BoxError> + Send,
{
    pub fn new(service: S) -> Self {
        Self {
            inner: tonic::client::Grpc::new(service),
        }
    }

    /// One request, one response.
    pub async fn unary(
        &mut self,
        method: &MethodDescriptor,
        payload: DynamicMessage,
        options: &CallOptions,
    ) -> CallResult<DynamicMessage> {
        let request = self.prepare(payload, options).await?;
        let response = self
            .inner
            .unary(request, path_of(method), DynamicCodec::for_client(method))
            .await;
        Ok(response.map(tonic::Response::into_inner))
    }

    /// One request, a stream of responses.
    pub async fn server_streaming(
        &mut self,
        method: &MethodDescriptor,
        payload: DynamicMessage,
        options: &CallOptions,
    ) -> CallResult<Streaming<DynamicMessage>> {
        let request = self.prepare(payload, options).await?;
        let response = self
            .inner
            .server_streaming(request, path_of(method), DynamicCodec::for_client(method))
            .await;
        Ok(response.map(tonic::Response::into_inner))
    }

    /// A stream of requests, one response.
    pub async fn client_streaming(
        &mut self,
        method: &MethodDescriptor,
        payloads: impl Stream<Item = DynamicMessage> + Send + 'static,
        options: &CallOptions,
    ) -> CallResult<DynamicMessage> {
        let request = self.prepare(payloads, options).await?;
        let response = self
            .inner
            .client_streaming(request, path_of(method), DynamicCodec::for_client(method))
            .await;
        Ok(response.map(tonic::Response::into_inner))
    }

    /// Streams in both directions at once.
    pub async fn bidirectional_streaming(
        &mut self,
        method: &MethodDescriptor,
        payloads: impl Stream<Item = DynamicMessage> + Send + 'static,
        options: &CallOptions,
    ) -> CallResult<Streaming<DynamicMessage>> {
        let request = self.prepare(payloads, options).await?;
        let response = self
            .inner
            .streaming(request, path_of(method), DynamicCodec::for_client(method))
            .await;
        Ok(response.map(tonic::Response::into_inner))
    }

    /// Waits for the transport, then wraps `payload` with the call's metadata and deadline.
    async fn prepare<T>(
        &mut self,
        payload: T,
        options: &CallOptions,
    ) -> Result<tonic::Request<T>, GrpcRequestError> {
        self.inner
            .ready()
            .await
            .map_err(|err| GrpcRequestError::ClientNotReady(err.into()))?;

        let mut request = tonic::Request::new(payload);

        for (name, value) in &options.headers {
            let key = MetadataKey::from_str(name).map_err(|source| {
                GrpcRequestError::InvalidMetadataKey {
                    key: name.clone(),
                    source,
                }
            })?;
            let value = MetadataValue::from_str(value).map_err(|source| {
                GrpcRequestError::InvalidMetadataValue {
                    key: name.clone(),
                    source,
                }
            })?;
            request.metadata_mut().insert(key, value);
        }

        if let Some(timeout) = options.timeout {
            request.set_timeout(timeout);
        }

        Ok(request)
    }
}

fn path_of(method: &MethodDescriptor) -> PathAndQuery {
    let path = format!("/{}/{}", method.parent_service().full_name(), method.name());
    // Service and method names are protobuf identifiers, always valid in a path.
    PathAndQuery::from_str(&path).expect("protobuf names form a valid path")
}
