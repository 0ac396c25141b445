//! # Method Handlers
//!
//! A [`MethodHandler`] computes the response(s) of one method. It receives a [`Call`], which
//! exposes two extension points:
//!
//! 1. **Mutate the response by field**: [`Call::set_output_field`], [`Call::output_mut`],
//!    reading the request through [`Call::input_field`].
//! 2. **Read and write the stream**: [`Call::recv`], [`Call::send`], [`Call::send_output`].
//!
//! Two built-in handlers cover the common cases: [`TemplateHandler`] applies a static JSON
//! object to every response and [`FnHandler`] computes each response from its request. Both
//! complete the call according to the method's [`RpcShape`]:
//!
//! | Shape            | Behaviour                                                     |
//! |------------------|---------------------------------------------------------------|
//! | Unary            | apply once, respond                                           |
//! | Client streaming | apply per inbound item, respond once at end of stream         |
//! | Server streaming | apply once, send once                                         |
//! | Bidirectional    | apply and send once per inbound item                          |
use super::listener::CallObserver;
use crate::{
    BoxError,
    descriptor::RpcShape,
    message::{self, MessageError},
};
use prost_reflect::{DynamicMessage, MethodDescriptor};
use serde_json::{Map, Value};
use std::fmt;
use tokio::sync::mpsc;
use tonic::{Status, Streaming};

#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// Returned to the caller verbatim.
    #[error("{0}")]
    Status(#[from] Status),

    #[error("Handler failed: '{0}'")]
    Failed(#[source] BoxError),

    #[error(transparent)]
    Message(#[from] MessageError),

    #[error("Method '{0}' has no request stream")]
    NotStreaming(String),

    #[error("Method '{0}' already sent its response")]
    AlreadyResponded(String),

    #[error("Failed to read the request stream: '{0}'")]
    Inbound(#[source] Status),

    #[error("The caller stopped receiving responses")]
    OutboundClosed,
}

impl HandlerError {
    pub fn failed(err: impl Into<BoxError>) -> Self {
        HandlerError::Failed(err.into())
    }

    /// The status reported to the caller when a handler fails with this error.
    pub fn into_status(self) -> Status {
        match self {
            HandlerError::Status(status) | HandlerError::Inbound(status) => status,
            HandlerError::Failed(err) => Status::unknown(err.to_string()),
            HandlerError::OutboundClosed => Status::cancelled("response stream closed"),
            err => Status::internal(err.to_string()),
        }
    }
}

/// Computes the response(s) of a method.
///
/// Handlers may await for as long as they like (e.g. to simulate latency); only the
/// caller's own deadline bounds them.
#[tonic::async_trait]
pub trait MethodHandler: Send + Sync + 'static {
    async fn handle(&self, call: &mut Call) -> Result<(), HandlerError>;
}

type Outbound = mpsc::Sender<Result<DynamicMessage, Status>>;

/// The state of one in-flight RPC, as seen by its handler.
///
/// `input` holds the request (for streaming requests, the item last returned by
/// [`Call::recv`]). `output` is the response being built.
pub struct Call {
    method: MethodDescriptor,
    input: DynamicMessage,
    output: DynamicMessage,
    inbound: Option<Streaming<DynamicMessage>>,
    outbound: Option<Outbound>,
    responded: bool,
    observer: CallObserver,
}

impl Call {
    pub(crate) fn new(
        method: MethodDescriptor,
        input: DynamicMessage,
        observer: CallObserver,
    ) -> Self {
        let output = message::new_message(&method.output());
        Self {
            method,
            input,
            output,
            inbound: None,
            outbound: None,
            responded: false,
            observer,
        }
    }

    pub(crate) fn with_inbound(mut self, inbound: Streaming<DynamicMessage>) -> Self {
        self.inbound = Some(inbound);
        self
    }

    pub(crate) fn with_outbound(mut self, outbound: Outbound) -> Self {
        self.outbound = Some(outbound);
        self
    }

    pub fn method(&self) -> &MethodDescriptor {
        &self.method
    }

    pub fn shape(&self) -> RpcShape {
        RpcShape::of(&self.method)
    }

    pub fn input(&self) -> &DynamicMessage {
        &self.input
    }

    pub fn input_field(&self, name: &str) -> Result<Value, HandlerError> {
        Ok(message::get_field(&self.input, name)?)
    }

    pub fn output(&self) -> &DynamicMessage {
        &self.output
    }

    pub fn output_mut(&mut self) -> &mut DynamicMessage {
        &mut self.output
    }

    pub fn set_output_field(&mut self, name: &str, value: Value) -> Result<(), HandlerError> {
        Ok(message::set_field(&mut self.output, name, value)?)
    }

    /// Borrows the request and the response at the same time.
    pub fn parts(&mut self) -> (&DynamicMessage, &mut DynamicMessage) {
        (&self.input, &mut self.output)
    }

    /// Receives the next request item, or `None` at end of stream.
    ///
    /// The item also becomes the call's [`input`](Call::input).
    pub async fn recv(&mut self) -> Result<Option<DynamicMessage>, HandlerError> {
        let inbound = self
            .inbound
            .as_mut()
            .ok_or_else(|| HandlerError::NotStreaming(self.method.full_name().to_string()))?;

        match inbound.message().await.map_err(HandlerError::Inbound)? {
            Some(item) => {
                self.observer.inbound(&item);
                self.input = item.clone();
                Ok(Some(item))
            }
            None => Ok(None),
        }
    }

    /// Sends a response.
    ///
    /// On streaming responses this may be called any number of times. Otherwise `message`
    /// becomes the single response, and a second call fails with
    /// [`HandlerError::AlreadyResponded`].
    pub async fn send(&mut self, message: DynamicMessage) -> Result<(), HandlerError> {
        match &self.outbound {
            Some(outbound) => {
                self.observer.outbound(&message);
                outbound
                    .send(Ok(message))
                    .await
                    .map_err(|_| HandlerError::OutboundClosed)
            }
            None if self.responded => Err(HandlerError::AlreadyResponded(
                self.method.full_name().to_string(),
            )),
            None => {
                self.output = message;
                self.responded = true;
                Ok(())
            }
        }
    }

    /// Sends the response built so far and starts a fresh, empty one.
    pub async fn send_output(&mut self) -> Result<(), HandlerError> {
        let fresh = message::new_message(&self.method.output());
        let output = std::mem::replace(&mut self.output, fresh);
        self.send(output).await
    }

    pub(crate) fn into_output(self) -> DynamicMessage {
        self.output
    }
}

impl fmt::Debug for Call {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Call")
            .field("method", &self.method.full_name())
            .field("input", &self.input)
            .field("output", &self.output)
            .finish_non_exhaustive()
    }
}

/// Runs `apply` over the call the way the built-in handlers do, according to its shape.
pub async fn complete_by_shape<F>(call: &mut Call, mut apply: F) -> Result<(), HandlerError>
where
    F: FnMut(&DynamicMessage, &mut DynamicMessage) -> Result<(), HandlerError> + Send,
{
    match call.shape() {
        RpcShape::Unary => {
            let (input, output) = call.parts();
            apply(input, output)
        }
        RpcShape::ServerStreaming => {
            let (input, output) = call.parts();
            apply(input, output)?;
            call.send_output().await
        }
        RpcShape::ClientStreaming => {
            while call.recv().await?.is_some() {
                let (input, output) = call.parts();
                apply(input, output)?;
            }
            Ok(())
        }
        RpcShape::Bidirectional => {
            while call.recv().await?.is_some() {
                let (input, output) = call.parts();
                apply(input, output)?;
                call.send_output().await?;
            }
            Ok(())
        }
    }
}

/// Applies a static JSON object to every response.
#[derive(Debug, Clone)]
pub struct TemplateHandler {
    template: Map<String, Value>,
}

impl TemplateHandler {
    pub fn new(template: Value) -> Result<Self, MessageError> {
        match template {
            Value::Object(template) => Ok(Self { template }),
            other => Err(MessageError::NotAnObject {
                message: "response template".to_string(),
                found: message::json_kind(&other),
            }),
        }
    }

    fn apply(&self, output: &mut DynamicMessage) -> Result<(), HandlerError> {
        for (name, value) in &self.template {
            message::set_field(output, name, value.clone())?;
        }
        Ok(())
    }
}

#[tonic::async_trait]
impl MethodHandler for TemplateHandler {
    async fn handle(&self, call: &mut Call) -> Result<(), HandlerError> {
        complete_by_shape(call, |_, output| self.apply(output)).await
    }
}

/// Computes every response from its request with a plain function.
///
/// This is the slot a scripting engine plugs into: the function gets the inbound message
/// and the outbound message being built.
pub struct FnHandler<F> {
    f: F,
}

pub fn handler_fn<F>(f: F) -> FnHandler<F>
where
    F: Fn(&DynamicMessage, &mut DynamicMessage) -> Result<(), HandlerError>
        + Send
        + Sync
        + 'static,
{
    FnHandler { f }
}

#[tonic::async_trait]
impl<F> MethodHandler for FnHandler<F>
where
    F: Fn(&DynamicMessage, &mut DynamicMessage) -> Result<(), HandlerError>
        + Send
        + Sync
        + 'static,
{
    async fn handle(&self, call: &mut Call) -> Result<(), HandlerError> {
        complete_by_shape(call, |input, output| (self.f)(input, output)).await
    }
}

impl<F> fmt::Debug for FnHandler<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnHandler").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn statuses_pass_through_verbatim() {
        let status = HandlerError::from(Status::not_found("no such user")).into_status();
        assert_eq!(status.code(), tonic::Code::NotFound);
        assert_eq!(status.message(), "no such user");
    }

    #[test]
    fn other_failures_map_to_unknown_or_internal() {
        let status = HandlerError::failed("boom").into_status();
        assert_eq!(status.code(), tonic::Code::Unknown);
        assert!(status.message().contains("boom"));

        let status = HandlerError::NotStreaming("a.B.C".into()).into_status();
        assert_eq!(status.code(), tonic::Code::Internal);
    }

    #[test]
    fn templates_must_be_objects() {
        assert!(TemplateHandler::new(json!({ "message": "hi" })).is_ok());
        assert!(matches!(
            TemplateHandler::new(json!("hi")),
            Err(MessageError::NotAnObject { found: "a string", .. })
        ));
    }
}
