//! # Descriptor Resolution
//!
//! Builds a [`ServiceSet`], the immutable schema every server and client works from.
//!
//! Two sources are supported:
//!
//! 1. **Proto files**: compiled in-process with `protox`, no `protoc` required.
//! 2. **Server reflection**: the peer is asked for its services, then for the files
//!    defining them (see [`crate::reflection::client::ReflectionClient`]).
//!
//! When both are available, files win. This allows testing against peers that are not
//! deployed yet, or that do not expose reflection.
use crate::{
    BoxError,
    grpc::client::{ClientConnectError, dial},
    reflection::client::{ReflectionClient, ReflectionResolveError},
};
use http_body::Body as HttpBody;
use prost_reflect::{DescriptorError, DescriptorPool, MethodDescriptor, ServiceDescriptor};
use prost_types::FileDescriptorSet;
use std::{fmt, path::PathBuf, time::Duration};
use tonic::{Code, client::GrpcService};

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("Failed to parse proto files {files:?}: '{source}'")]
    Parse {
        files: Vec<PathBuf>,
        #[source]
        source: protox::Error,
    },

    #[error("Invalid descriptor set: '{0}'")]
    Descriptor(#[from] DescriptorError),

    #[error(transparent)]
    Connection(#[from] ClientConnectError),

    #[error("The peer does not support server reflection: '{0}'")]
    PeerUnsupported(#[source] tonic::Status),

    #[error("Reflection resolution failed: '{0}'")]
    Reflection(#[source] ReflectionResolveError),
}

impl From<ReflectionResolveError> for ResolveError {
    fn from(err: ReflectionResolveError) -> Self {
        match err {
            ReflectionResolveError::ServerStreamInitFailed(status)
                if status.code() == Code::Unimplemented =>
            {
                ResolveError::PeerUnsupported(status)
            }
            err => ResolveError::Reflection(err),
        }
    }
}

/// A set of `.proto` files and the directories their imports are resolved against.
#[derive(Debug, Clone, Default)]
pub struct ProtoFiles {
    pub files: Vec<PathBuf>,
    pub includes: Vec<PathBuf>,
}

impl ProtoFiles {
    pub fn new<I, P>(files: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        Self {
            files: files.into_iter().map(Into::into).collect(),
            includes: Vec::new(),
        }
    }

    pub fn with_includes<I, P>(mut self, includes: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.includes = includes.into_iter().map(Into::into).collect();
        self
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    // Without explicit include paths every file is its own import root.
    fn import_roots(&self) -> Vec<PathBuf> {
        if !self.includes.is_empty() {
            return self.includes.clone();
        }

        let mut roots: Vec<PathBuf> = Vec::new();
        for file in &self.files {
            let root = match file.parent() {
                Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
                _ => PathBuf::from("."),
            };
            if !roots.contains(&root) {
                roots.push(root);
            }
        }
        roots
    }
}

/// The streaming shape of a method, fixed by its descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RpcShape {
    Unary,
    ClientStreaming,
    ServerStreaming,
    Bidirectional,
}

impl RpcShape {
    pub fn of(method: &MethodDescriptor) -> Self {
        match (method.is_client_streaming(), method.is_server_streaming()) {
            (false, false) => RpcShape::Unary,
            (true, false) => RpcShape::ClientStreaming,
            (false, true) => RpcShape::ServerStreaming,
            (true, true) => RpcShape::Bidirectional,
        }
    }
}

impl fmt::Display for RpcShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RpcShape::Unary => "unary",
            RpcShape::ClientStreaming => "client-streaming",
            RpcShape::ServerStreaming => "server-streaming",
            RpcShape::Bidirectional => "bidirectional",
        };
        f.write_str(name)
    }
}

/// A resolved, immutable set of services.
///
/// Services keep the order of their source: declaration order for files, response order
/// for reflection. The order is never re-sorted.
#[derive(Debug, Clone)]
pub struct ServiceSet {
    pool: DescriptorPool,
    services: Vec<String>,
}

impl ServiceSet {
    /// Exposes every service of `pool`, in pool order.
    pub fn from_pool(pool: DescriptorPool) -> Self {
        let services = pool.services().map(|s| s.full_name().to_string()).collect();
        Self { pool, services }
    }

    /// Exposes only `services`, in the given order. Names absent from the pool are dropped.
    pub fn with_services(pool: DescriptorPool, services: Vec<String>) -> Self {
        let services = services
            .into_iter()
            .filter(|name| pool.get_service_by_name(name).is_some())
            .collect();
        Self { pool, services }
    }

    pub fn pool(&self) -> &DescriptorPool {
        &self.pool
    }

    /// Fully qualified service names (e.g. `helloworld.Greeter`).
    pub fn list_services(&self) -> &[String] {
        &self.services
    }

    pub fn service(&self, name: &str) -> Option<ServiceDescriptor> {
        if !self.services.iter().any(|s| s == name) {
            return None;
        }
        self.pool.get_service_by_name(name)
    }

    /// Fully qualified method names (e.g. `helloworld.Greeter.SayHello`) in declaration order.
    pub fn list_methods(&self, service: &str) -> Option<Vec<String>> {
        self.service(service)
            .map(|s| s.methods().map(|m| m.full_name().to_string()).collect())
    }

    /// Looks up a method by `package.Service.Method` or `package.Service/Method`.
    pub fn method(&self, name: &str) -> Option<MethodDescriptor> {
        let (service, method) = split_method_name(name)?;
        self.service(service)?
            .methods()
            .find(|m| m.name() == method)
    }

    /// Every method of every exposed service.
    pub fn methods(&self) -> impl Iterator<Item = MethodDescriptor> + '_ {
        self.services
            .iter()
            .filter_map(|name| self.pool.get_service_by_name(name))
            .flat_map(|service| service.methods().collect::<Vec<_>>())
    }

    /// The files backing this set, suitable for serving through reflection.
    pub fn file_descriptor_set(&self) -> FileDescriptorSet {
        FileDescriptorSet {
            file: self.pool.file_descriptor_protos().cloned().collect(),
        }
    }
}

/// Splits `package.Service.Method` or `package.Service/Method` into service and method.
pub fn split_method_name(name: &str) -> Option<(&str, &str)> {
    let name = name.trim_start_matches('/');
    let (service, method) = name.split_once('/').or_else(|| name.rsplit_once('.'))?;

    if service.is_empty() || method.is_empty() {
        return None;
    }
    Some((service, method))
}

/// Compiles `.proto` files into a [`ServiceSet`].
pub fn resolve_from_files(protos: &ProtoFiles) -> Result<ServiceSet, ResolveError> {
    let fd_set = protox::compile(&protos.files, protos.import_roots()).map_err(|source| {
        ResolveError::Parse {
            files: protos.files.clone(),
            source,
        }
    })?;

    let pool = DescriptorPool::from_file_descriptor_set(fd_set)?;
    let set = ServiceSet::from_pool(pool);

    tracing::debug!(
        files = ?protos.files,
        services = ?set.list_services(),
        "resolved descriptors from proto files"
    );
    Ok(set)
}

/// Dials `address` and resolves its services through server reflection.
pub async fn resolve_from_peer(address: &str) -> Result<ServiceSet, ResolveError> {
    let channel = dial(address, DEFAULT_CONNECT_TIMEOUT).await?;
    resolve_with_reflection(&mut ReflectionClient::new(channel)).await
}

/// Resolves from `protos` when given, from the peer's reflection service otherwise.
pub async fn resolve(address: &str, protos: Option<&ProtoFiles>) -> Result<ServiceSet, ResolveError> {
    match protos {
        Some(protos) if !protos.is_empty() => resolve_from_files(protos),
        _ => resolve_from_peer(address).await,
    }
}

pub(crate) const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

pub(crate) async fn resolve_with_reflection<S>(
    client: &mut ReflectionClient<S>,
) -> Result<ServiceSet, ResolveError>
where
    S: GrpcService<tonic::body::Body>,
    S::Error: Into<BoxError>,
    S::ResponseBody: HttpBody<Data = tonic::codegen::Bytes> + Send + 'static,
    <S::ResponseBody as HttpBody>::Error: Into<BoxError> + Send,
{
    let services = client.list_services().await?;
    let fd_set = client.file_descriptor_set_by_symbols(&services).await?;
    let pool = DescriptorPool::from_file_descriptor_set(fd_set)?;
    let set = ServiceSet::with_services(pool, services);

    tracing::debug!(
        services = ?set.list_services(),
        "resolved descriptors from server reflection"
    );
    Ok(set)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_dotted_and_slashed_method_names() {
        assert_eq!(
            split_method_name("helloworld.Greeter.SayHello"),
            Some(("helloworld.Greeter", "SayHello"))
        );
        assert_eq!(
            split_method_name("/helloworld.Greeter/SayHello"),
            Some(("helloworld.Greeter", "SayHello"))
        );
        assert_eq!(split_method_name("SayHello"), None);
        assert_eq!(split_method_name("helloworld.Greeter/"), None);
    }

    #[test]
    fn files_without_includes_use_their_parent_as_root() {
        let protos = ProtoFiles::new(["protos/a.proto", "protos/b.proto", "c.proto"]);
        assert_eq!(
            protos.import_roots(),
            vec![PathBuf::from("protos"), PathBuf::from(".")]
        );

        let protos = protos.with_includes(["vendor"]);
        assert_eq!(protos.import_roots(), vec![PathBuf::from("vendor")]);
    }
}
