//! # Mock Server
//!
//! A gRPC server built at runtime from a [`ServiceSet`], with no generated stubs.
//!
//! Every method of every service is routed to the adapter for its streaming shape.
//! Responses come from the [`MethodHandler`] registered for the method, and every message
//! in or out is published to the registered [`Listener`]s.
//!
//! ```no_run
//! # use simrpc_core::{descriptor::ProtoFiles, server::{MockServer, ServerConfig, handler_fn}};
//! # use simrpc_core::message;
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let server = MockServer::from_files(
//!     ServerConfig::default(),
//!     &ProtoFiles::new(["protos/helloworld.proto"]),
//! )?;
//!
//! server.set_method_handler(
//!     "helloworld.Greeter.SayHello",
//!     handler_fn(|input, output| {
//!         let name = message::get_field(input, "name")?;
//!         let name = name.as_str().unwrap_or_default();
//!         message::set_field(output, "message", format!("Hello {name}").into())?;
//!         Ok(())
//!     }),
//! )?;
//!
//! let addr = server.start().await?;
//! println!("serving on {addr}");
//! server.close().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Lifecycle
//!
//! `Created → Started → Stopped`. Handlers and listeners may change at any time while
//! running. Stopping is idempotent and terminal: a stopped instance cannot be restarted.
mod dispatch;
pub mod handler;
pub mod listener;
pub mod registry;

pub use handler::{Call, FnHandler, HandlerError, MethodHandler, TemplateHandler, handler_fn};
pub use listener::{Direction, Listener, ListenerBus, Traffic};
pub use registry::{HandlerRegistry, RegistryError};

use crate::descriptor::{ProtoFiles, ResolveError, ServiceSet, resolve_from_files};
use dispatch::DispatchService;
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::{
    net::TcpListener,
    sync::{Mutex, oneshot, watch},
    task::JoinHandle,
};
use tokio_stream::wrappers::TcpListenerStream;
use tonic::service::Routes;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind, e.g. `127.0.0.1:50051`. Port `0` picks a free port.
    pub address: String,
    /// Also serve `grpc.reflection.v1` for the served descriptors.
    pub reflection: bool,
    /// How long [`MockServer::close`] waits for in-flight calls before aborting them.
    pub shutdown_grace: Duration,
    /// Capacity of each streaming response channel.
    pub stream_buffer: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:0".to_string(),
            reflection: false,
            shutdown_grace: Duration::from_secs(5),
            stream_buffer: 16,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error("Failed to listen on '{address}': '{source}'")]
    Connection {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Server is already running on {0}")]
    AlreadyStarted(SocketAddr),

    #[error("Server was closed, create a new instance to serve again")]
    Closed,

    #[error("Method '{0}' is not part of the served services")]
    MethodNotFound(String),

    #[error("Failed to build the reflection service: '{0}'")]
    Reflection(#[source] tonic_reflection::server::Error),
}

/// State shared by the accept loop and the server's owner.
#[derive(Debug)]
pub(crate) struct ServerState {
    pub(crate) handlers: HandlerRegistry,
    pub(crate) listeners: ListenerBus,
    pub(crate) stream_buffer: usize,
    /// Flips to `true` once the grace period of [`MockServer::close`] has elapsed.
    halt: watch::Sender<bool>,
}

impl ServerState {
    /// Resolves once in-flight calls must stop.
    pub(crate) async fn halted(&self) {
        let mut halt = self.halt.subscribe();
        if halt.wait_for(|halted| *halted).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

enum Lifecycle {
    Created,
    Started {
        local_addr: SocketAddr,
        shutdown: oneshot::Sender<()>,
        serving: JoinHandle<Result<(), tonic::transport::Error>>,
    },
    Stopped,
}

pub struct MockServer {
    config: ServerConfig,
    services: ServiceSet,
    state: Arc<ServerState>,
    lifecycle: Mutex<Lifecycle>,
}

impl MockServer {
    pub fn new(config: ServerConfig, services: ServiceSet) -> Self {
        let state = ServerState {
            handlers: HandlerRegistry::default(),
            listeners: ListenerBus::default(),
            stream_buffer: config.stream_buffer.max(1),
            halt: watch::Sender::new(false),
        };

        Self {
            config,
            services,
            state: Arc::new(state),
            lifecycle: Mutex::new(Lifecycle::Created),
        }
    }

    /// Resolves `protos` and creates a server for every service they declare.
    pub fn from_files(config: ServerConfig, protos: &ProtoFiles) -> Result<Self, ServerError> {
        let services = resolve_from_files(protos)?;
        Ok(Self::new(config, services))
    }

    pub fn services(&self) -> &ServiceSet {
        &self.services
    }

    /// Every served method, service by service, in declaration order.
    pub fn list_methods(&self) -> Vec<String> {
        self.services
            .methods()
            .map(|m| m.full_name().to_string())
            .collect()
    }

    /// Binds the configured address and starts serving in the background.
    ///
    /// Returns the bound address once the accept loop is running.
    pub async fn start(&self) -> Result<SocketAddr, ServerError> {
        let mut lifecycle = self.lifecycle.lock().await;

        match &*lifecycle {
            Lifecycle::Created => {}
            Lifecycle::Started { local_addr, .. } => {
                return Err(ServerError::AlreadyStarted(*local_addr));
            }
            Lifecycle::Stopped => return Err(ServerError::Closed),
        }

        let routes = self.routes()?;

        let connection_error = |source| ServerError::Connection {
            address: self.config.address.clone(),
            source,
        };
        let listener = TcpListener::bind(&self.config.address)
            .await
            .map_err(connection_error)?;
        let local_addr = listener.local_addr().map_err(connection_error)?;

        let (shutdown, signal) = oneshot::channel::<()>();
        let serving = tokio::spawn(
            tonic::transport::Server::builder()
                .add_routes(routes)
                .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async move {
                    let _ = signal.await;
                }),
        );

        tracing::info!(
            address = %local_addr,
            services = ?self.services.list_services(),
            reflection = self.config.reflection,
            "mock server started"
        );

        *lifecycle = Lifecycle::Started {
            local_addr,
            shutdown,
            serving,
        };
        Ok(local_addr)
    }

    /// Stops the server, releases its socket and clears its handlers and listeners.
    ///
    /// In-flight calls get [`ServerConfig::shutdown_grace`] to finish. Calls still running
    /// afterwards fail with `UNAVAILABLE`. Closing twice is a no-op.
    pub async fn close(&self) {
        let mut lifecycle = self.lifecycle.lock().await;

        if let Lifecycle::Started {
            local_addr,
            shutdown,
            mut serving,
        } = std::mem::replace(&mut *lifecycle, Lifecycle::Stopped)
        {
            let _ = shutdown.send(());

            match tokio::time::timeout(self.config.shutdown_grace, &mut serving).await {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(err))) => {
                    tracing::warn!(address = %local_addr, error = %err, "server stopped with an error");
                }
                Ok(Err(err)) => {
                    tracing::warn!(address = %local_addr, error = %err, "server task failed");
                }
                Err(_) => {
                    tracing::warn!(address = %local_addr, "grace period elapsed, aborting in-flight calls");
                    self.state.halt.send_replace(true);
                    serving.abort();
                }
            }

            tracing::info!(address = %local_addr, "mock server stopped");
        }

        self.state.handlers.clear();
        self.state.listeners.clear();
    }

    /// The bound address while the server is running.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        match &*self.lifecycle.lock().await {
            Lifecycle::Started { local_addr, .. } => Some(*local_addr),
            _ => None,
        }
    }

    /// Registers the handler answering `method` (`package.Service.Method` or
    /// `package.Service/Method`), replacing any previous one.
    pub fn set_method_handler<H>(&self, method: &str, handler: H) -> Result<(), ServerError>
    where
        H: MethodHandler,
    {
        let method = self
            .services
            .method(method)
            .ok_or_else(|| ServerError::MethodNotFound(method.to_string()))?;

        self.state
            .handlers
            .set(method.full_name(), Arc::new(handler));
        Ok(())
    }

    /// Returns whether a handler was removed.
    pub fn remove_method_handler(&self, method: &str) -> bool {
        self.services
            .method(method)
            .is_some_and(|method| self.state.handlers.remove(method.full_name()))
    }

    pub fn add_listener<L>(&self, listener: L)
    where
        L: Listener,
    {
        self.state.listeners.add(Arc::new(listener));
    }

    fn routes(&self) -> Result<Routes, ServerError> {
        let dispatch = DispatchService::new(&self.services, self.state.clone());

        let router = if self.config.reflection {
            let reflection = tonic_reflection::server::Builder::configure()
                .register_file_descriptor_set(self.services.file_descriptor_set())
                .include_reflection_service(false)
                .build_v1()
                .map_err(ServerError::Reflection)?;
            Routes::new(reflection).into_axum_router()
        } else {
            axum::Router::new()
        };

        Ok(Routes::from(router.fallback_service(dispatch)))
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        // Let the accept loop wind down instead of serving forever.
        if let Lifecycle::Started { shutdown, .. } =
            std::mem::replace(self.lifecycle.get_mut(), Lifecycle::Stopped)
        {
            let _ = shutdown.send(());
        }
    }
}
