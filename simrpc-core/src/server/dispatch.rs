//! # Dynamic Dispatch
//!
//! Replaces the per-service code `tonic-build` would generate. [`DispatchService`] owns a
//! route table built from descriptors (`/package.Service/Method` to method) and hands every
//! request to the adapter matching the method's [`RpcShape`]:
//!
//! * [`Unary`]: one request in, handler runs, one response out.
//! * [`ClientStreaming`]: the handler reads the request stream, one response out.
//! * [`ServerStreaming`]: one request in, the handler runs on its own task and writes to a
//!   bounded channel drained by the response stream.
//! * [`Bidirectional`]: the handler owns both streams on its own task.
//!
//! Every adapter looks the handler up per call, so handlers swapped on a running server
//! govern the next call. A method without a handler fails with `UNIMPLEMENTED`, and a
//! handler still running when the server halts fails with `UNAVAILABLE`.
use super::{
    ServerState,
    handler::{Call, HandlerError, MethodHandler},
    listener::CallObserver,
};
use crate::{BoxError, descriptor::{RpcShape, ServiceSet}, grpc::codec::DynamicCodec, message};
use http_body::Body as HttpBody;
use prost_reflect::{DynamicMessage, MethodDescriptor};
use std::{
    collections::HashMap,
    convert::Infallible,
    sync::Arc,
    task::{Context, Poll},
};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{
    Request, Response, Status, Streaming,
    codegen::{BoxFuture, Service},
    server::{
        ClientStreamingService, Grpc, ServerStreamingService, StreamingService, UnaryService,
    },
};

type ResponseStream = ReceiverStream<Result<DynamicMessage, Status>>;

/// Routes gRPC requests to the adapter of their method.
#[derive(Clone)]
pub(crate) struct DispatchService {
    routes: Arc<HashMap<String, MethodDescriptor>>,
    state: Arc<ServerState>,
}

impl DispatchService {
    pub(crate) fn new(services: &ServiceSet, state: Arc<ServerState>) -> Self {
        let routes = services
            .methods()
            .map(|method| {
                let path = format!(
                    "/{}/{}",
                    method.parent_service().full_name(),
                    method.name()
                );
                tracing::debug!(%path, shape = %RpcShape::of(&method), "registered route");
                (path, method)
            })
            .collect();

        Self {
            routes: Arc::new(routes),
            state,
        }
    }
}

impl<B> Service<http::Request<B>> for DispatchService
where
    B: HttpBody + Send + 'static,
    B::Error: Into<BoxError> + Send + 'static,
{
    type Response = http::Response<tonic::body::Body>;
    type Error = Infallible;
    type Future = BoxFuture<Self::Response, Self::Error>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: http::Request<B>) -> Self::Future {
        let Some(method) = self.routes.get(req.uri().path()).cloned() else {
            let path = req.uri().path().to_string();
            return Box::pin(async move {
                tracing::warn!(%path, "request for a method that is not served");
                Ok(Status::unimplemented(format!("Method '{path}' is not served")).into_http())
            });
        };

        let state = self.state.clone();

        Box::pin(async move {
            let mut grpc = Grpc::new(DynamicCodec::for_server(&method));

            let response = match RpcShape::of(&method) {
                RpcShape::Unary => grpc.unary(Unary { method, state }, req).await,
                RpcShape::ClientStreaming => {
                    grpc.client_streaming(ClientStreaming { method, state }, req)
                        .await
                }
                RpcShape::ServerStreaming => {
                    grpc.server_streaming(ServerStreaming { method, state }, req)
                        .await
                }
                RpcShape::Bidirectional => {
                    grpc.streaming(Bidirectional { method, state }, req).await
                }
            };

            Ok(response)
        })
    }
}

fn lookup(state: &ServerState, method: &MethodDescriptor) -> Result<Arc<dyn MethodHandler>, Status> {
    state.handlers.dispatch(method.full_name()).map_err(|err| {
        tracing::warn!(method = %method.full_name(), "no handler registered");
        Status::unimplemented(err.to_string())
    })
}

fn observer<T>(state: &ServerState, method: &MethodDescriptor, request: &Request<T>) -> CallObserver {
    let render = |addr: Option<std::net::SocketAddr>| {
        addr.map_or_else(|| "unknown".to_string(), |addr| addr.to_string())
    };

    CallObserver::new(
        state.listeners.clone(),
        method.full_name().to_string(),
        render(request.remote_addr()),
        render(request.local_addr()),
    )
}

fn failed(method: &MethodDescriptor, err: HandlerError) -> Status {
    tracing::debug!(method = %method.full_name(), error = %err, "handler failed");
    err.into_status()
}

/// Runs `handler` until it returns or the server halts.
async fn run(
    state: &ServerState,
    handler: &dyn MethodHandler,
    call: &mut Call,
) -> Result<(), Status> {
    let method = call.method().clone();

    tokio::select! {
        result = handler.handle(call) => result.map_err(|err| failed(&method, err)),
        () = state.halted() => {
            tracing::debug!(method = %method.full_name(), "call aborted by shutdown");
            Err(Status::unavailable("Server is shutting down"))
        }
    }
}

// Streaming handlers run on their own task; a failure ends the response stream with its status.
fn spawn_streaming(
    state: Arc<ServerState>,
    handler: Arc<dyn MethodHandler>,
    mut call: Call,
    tx: mpsc::Sender<Result<DynamicMessage, Status>>,
) {
    tokio::spawn(async move {
        if let Err(status) = run(&state, handler.as_ref(), &mut call).await {
            // The caller may already be gone.
            let _ = tx.send(Err(status)).await;
        }
    });
}

pub(crate) struct Unary {
    method: MethodDescriptor,
    state: Arc<ServerState>,
}

impl UnaryService<DynamicMessage> for Unary {
    type Response = DynamicMessage;
    type Future = BoxFuture<Response<Self::Response>, Status>;

    fn call(&mut self, request: Request<DynamicMessage>) -> Self::Future {
        let method = self.method.clone();
        let state = self.state.clone();

        Box::pin(async move {
            let handler = lookup(&state, &method)?;
            let observer = observer(&state, &method, &request);

            let input = request.into_inner();
            observer.inbound(&input);

            let mut call = Call::new(method, input, observer.clone());
            run(&state, handler.as_ref(), &mut call).await?;

            let output = call.into_output();
            observer.outbound(&output);
            Ok(Response::new(output))
        })
    }
}

pub(crate) struct ClientStreaming {
    method: MethodDescriptor,
    state: Arc<ServerState>,
}

impl ClientStreamingService<DynamicMessage> for ClientStreaming {
    type Response = DynamicMessage;
    type Future = BoxFuture<Response<Self::Response>, Status>;

    fn call(&mut self, request: Request<Streaming<DynamicMessage>>) -> Self::Future {
        let method = self.method.clone();
        let state = self.state.clone();

        Box::pin(async move {
            let handler = lookup(&state, &method)?;
            let observer = observer(&state, &method, &request);

            let input = message::new_message(&method.input());
            let mut call = Call::new(method, input, observer.clone())
                .with_inbound(request.into_inner());
            run(&state, handler.as_ref(), &mut call).await?;

            let output = call.into_output();
            observer.outbound(&output);
            Ok(Response::new(output))
        })
    }
}

pub(crate) struct ServerStreaming {
    method: MethodDescriptor,
    state: Arc<ServerState>,
}

impl ServerStreamingService<DynamicMessage> for ServerStreaming {
    type Response = DynamicMessage;
    type ResponseStream = ResponseStream;
    type Future = BoxFuture<Response<Self::ResponseStream>, Status>;

    fn call(&mut self, request: Request<DynamicMessage>) -> Self::Future {
        let method = self.method.clone();
        let state = self.state.clone();

        Box::pin(async move {
            let handler = lookup(&state, &method)?;
            let observer = observer(&state, &method, &request);

            let input = request.into_inner();
            observer.inbound(&input);

            let (tx, rx) = mpsc::channel(state.stream_buffer);
            let call = Call::new(method, input, observer).with_outbound(tx.clone());
            spawn_streaming(state.clone(), handler, call, tx);

            Ok(Response::new(ReceiverStream::new(rx)))
        })
    }
}

pub(crate) struct Bidirectional {
    method: MethodDescriptor,
    state: Arc<ServerState>,
}

impl StreamingService<DynamicMessage> for Bidirectional {
    type Response = DynamicMessage;
    type ResponseStream = ResponseStream;
    type Future = BoxFuture<Response<Self::ResponseStream>, Status>;

    fn call(&mut self, request: Request<Streaming<DynamicMessage>>) -> Self::Future {
        let method = self.method.clone();
        let state = self.state.clone();

        Box::pin(async move {
            let handler = lookup(&state, &method)?;
            let observer = observer(&state, &method, &request);

            let (tx, rx) = mpsc::channel(state.stream_buffer);
            let input = message::new_message(&method.input());
            let call = Call::new(method, input, observer)
                .with_inbound(request.into_inner())
                .with_outbound(tx.clone());
            spawn_streaming(state.clone(), handler, call, tx);

            Ok(Response::new(ReceiverStream::new(rx)))
        })
    }
}
