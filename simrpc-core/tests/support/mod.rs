#![allow(dead_code)]

use simrpc_core::{
    descriptor::ProtoFiles,
    message,
    server::{HandlerError, MockServer, ServerConfig, Traffic},
};
use std::{
    path::PathBuf,
    sync::{Arc, Mutex},
    time::Duration,
};

pub fn proto(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests/protos")
        .join(name)
}

pub fn protos(names: &[&str]) -> ProtoFiles {
    ProtoFiles::new(names.iter().map(|name| proto(name)))
}

pub fn config() -> ServerConfig {
    ServerConfig {
        shutdown_grace: Duration::from_secs(1),
        ..ServerConfig::default()
    }
}

pub fn reflective_config() -> ServerConfig {
    ServerConfig {
        reflection: true,
        ..config()
    }
}

/// Starts a server for `names` and returns it with its address.
pub async fn serve(names: &[&str], config: ServerConfig) -> (MockServer, String) {
    let server = MockServer::from_files(config, &protos(names)).expect("Failed to resolve protos");
    let addr = server.start().await.expect("Failed to start server");
    (server, addr.to_string())
}

/// `{"message": "Hello " + name}`
pub fn say_hello(
    input: &prost_reflect::DynamicMessage,
    output: &mut prost_reflect::DynamicMessage,
) -> Result<(), HandlerError> {
    let name = message::get_field(input, "name")?;
    let name = name.as_str().unwrap_or_default();
    message::set_field(output, "message", format!("Hello {name}").into())?;
    Ok(())
}

/// Copies `message` from the request to the response.
pub fn echo(
    input: &prost_reflect::DynamicMessage,
    output: &mut prost_reflect::DynamicMessage,
) -> Result<(), HandlerError> {
    message::set_field(output, "message", message::get_field(input, "message")?)?;
    Ok(())
}

/// A listener recording every observed message.
#[derive(Clone, Default)]
pub struct Recorder {
    seen: Arc<Mutex<Vec<Traffic>>>,
}

impl Recorder {
    pub fn listener(&self) -> impl Fn(&Traffic) + Send + Sync + 'static {
        let seen = self.seen.clone();
        move |traffic: &Traffic| seen.lock().unwrap().push(traffic.clone())
    }

    pub fn traffic(&self) -> Vec<Traffic> {
        self.seen.lock().unwrap().clone()
    }
}
