//! # Reflection Client
//!
//! Talks `grpc.reflection.v1` to a live server and turns its answers into a
//! `FileDescriptorSet`.
//!
//! Every symbol asked for shares a single bidirectional reflection stream. Each file the
//! server returns is scanned for imports, and imports not seen yet are requested on the
//! same stream, until the whole import graph is local.
//!
//! ## References
//!
//! * [gRPC Server Reflection Protocol](https://github.com/grpc/grpc/blob/master/doc/server-reflection.md)
use crate::BoxError;
use futures_util::stream;
use http_body::Body as HttpBody;
use prost::Message;
use prost_types::{FileDescriptorProto, FileDescriptorSet};
use std::collections::{HashMap, HashSet};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tonic::{Streaming, client::GrpcService, transport::Channel};
use tonic_reflection::pb::v1::{
    ServerReflectionRequest, ServerReflectionResponse,
    server_reflection_client::ServerReflectionClient, server_reflection_request::MessageRequest,
    server_reflection_response::MessageResponse,
};

#[derive(Debug, thiserror::Error)]
pub enum ReflectionResolveError {
    /// The reflection stream could not be opened. `UNIMPLEMENTED` means the peer has no
    /// reflection service.
    #[error("Could not open a reflection stream: '{0}'")]
    ServerStreamInitFailed(#[source] tonic::Status),

    #[error("Reflection stream failed: '{0}'")]
    ServerStreamFailure(#[source] tonic::Status),

    #[error("Reflection stream ended before every request was answered")]
    StreamClosed,

    #[error("Could not queue a reflection request, the stream is gone")]
    SendFailed,

    #[error("Reflection request rejected with code {code}: '{message}'")]
    ServerError { code: i32, message: String },

    #[error("Unexpected reflection response: {0}")]
    UnexpectedResponseType(String),

    #[error("Invalid file descriptor in reflection response: '{0}'")]
    DecodeError(#[from] prost::DecodeError),
}

/// Client side of the reflection sub-protocol.
#[derive(Debug, Clone)]
pub struct ReflectionClient<T = Channel> {
    inner: ServerReflectionClient<T>,
}

impl<S> ReflectionClient<S>
where
    S: GrpcService<tonic::body::Body>,
    S::Error: Into<BoxError>,
    S::ResponseBody: HttpBody<Data = tonic::codegen::Bytes> + Send + 'static,
    <S::ResponseBody as HttpBody>::Error: Into<BoxError> + Send,
{
    pub fn new(service: S) -> Self {
        Self {
            inner: ServerReflectionClient::new(service),
        }
    }

    /// Service names exposed by the peer, in the order it reports them.
    pub async fn list_services(&mut self) -> Result<Vec<String>, ReflectionResolveError> {
        let query = request(MessageRequest::ListServices(String::new()));

        let mut responses = self
            .inner
            .server_reflection_info(stream::iter([query]))
            .await
            .map_err(ReflectionResolveError::ServerStreamInitFailed)?
            .into_inner();

        match next_answer(&mut responses).await? {
            MessageResponse::ListServicesResponse(list) => {
                Ok(list.service.into_iter().map(|service| service.name).collect())
            }
            other => Err(unexpected(&other)),
        }
    }

    /// The file defining `symbol` plus everything it imports, transitively.
    pub async fn file_descriptor_set_by_symbol(
        &mut self,
        symbol: &str,
    ) -> Result<FileDescriptorSet, ReflectionResolveError> {
        self.file_descriptor_set_by_symbols(&[symbol.to_string()])
            .await
    }

    /// The files defining every symbol of `symbols` (e.g. `my.package.MyService`) plus
    /// everything they import, transitively.
    ///
    /// A file needed by several symbols is fetched and returned once.
    pub async fn file_descriptor_set_by_symbols(
        &mut self,
        symbols: &[String],
    ) -> Result<FileDescriptorSet, ReflectionResolveError> {
        if symbols.is_empty() {
            return Ok(FileDescriptorSet::default());
        }

        let (queue, pending) = mpsc::unbounded_channel();
        for symbol in symbols {
            enqueue(&queue, MessageRequest::FileContainingSymbol(symbol.clone()))?;
        }

        let mut responses = self
            .inner
            .server_reflection_info(UnboundedReceiverStream::new(pending))
            .await
            .map_err(ReflectionResolveError::ServerStreamInitFailed)?
            .into_inner();

        let mut collector = Collector::default();
        collector
            .run(&mut responses, &queue, symbols.len())
            .await?;

        Ok(FileDescriptorSet {
            file: collector.files.into_values().collect(),
        })
    }
}

type RequestQueue = mpsc::UnboundedSender<ServerReflectionRequest>;

fn request(message_request: MessageRequest) -> ServerReflectionRequest {
    // Servers ignore `host`.
    ServerReflectionRequest {
        host: String::new(),
        message_request: Some(message_request),
    }
}

fn enqueue(queue: &RequestQueue, message_request: MessageRequest) -> Result<(), ReflectionResolveError> {
    queue
        .send(request(message_request))
        .map_err(|_| ReflectionResolveError::SendFailed)
}

/// Reads the next answer, turning protocol-level errors into [`ReflectionResolveError`]s.
async fn next_answer(
    responses: &mut Streaming<ServerReflectionResponse>,
) -> Result<MessageResponse, ReflectionResolveError> {
    let response = responses
        .message()
        .await
        .map_err(ReflectionResolveError::ServerStreamFailure)?
        .ok_or(ReflectionResolveError::StreamClosed)?;

    match response.message_response {
        Some(MessageResponse::ErrorResponse(err)) => Err(ReflectionResolveError::ServerError {
            code: err.error_code,
            message: err.error_message,
        }),
        Some(answer) => Ok(answer),
        None => Err(ReflectionResolveError::UnexpectedResponseType(
            "empty response".to_string(),
        )),
    }
}

fn unexpected(answer: &MessageResponse) -> ReflectionResolveError {
    ReflectionResolveError::UnexpectedResponseType(format!("{answer:?}"))
}

#[derive(Default)]
struct Collector {
    files: HashMap<String, FileDescriptorProto>,
    requested: HashSet<String>,
}

impl Collector {
    /// Reads answers until `outstanding` requests, and every import request they trigger,
    /// have been answered.
    async fn run(
        &mut self,
        responses: &mut Streaming<ServerReflectionResponse>,
        queue: &RequestQueue,
        mut outstanding: usize,
    ) -> Result<(), ReflectionResolveError> {
        while outstanding > 0 {
            outstanding -= 1;

            match next_answer(responses).await? {
                MessageResponse::FileDescriptorResponse(found) => {
                    outstanding += self.absorb(found.file_descriptor_proto, queue)?;
                }
                other => return Err(unexpected(&other)),
            }
        }

        Ok(())
    }

    /// Keeps the files not seen yet and requests their unknown imports.
    ///
    /// Returns the number of import requests queued.
    fn absorb(
        &mut self,
        encoded_files: Vec<Vec<u8>>,
        queue: &RequestQueue,
    ) -> Result<usize, ReflectionResolveError> {
        let mut queued = 0;

        for encoded in encoded_files {
            let file = FileDescriptorProto::decode(encoded.as_slice())?;
            let Some(name) = file.name.clone() else {
                continue;
            };
            if self.files.contains_key(&name) {
                continue;
            }
            self.requested.insert(name.clone());

            let missing: Vec<String> = file
                .dependency
                .iter()
                .filter(|import| !self.files.contains_key(*import))
                .filter(|import| self.requested.insert((*import).clone()))
                .cloned()
                .collect();

            for import in missing {
                enqueue(queue, MessageRequest::FileByFilename(import))?;
                queued += 1;
            }

            self.files.insert(name, file);
        }

        Ok(queued)
    }
}
