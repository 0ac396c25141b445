//! # Serve Config
//!
//! The JSON document `simrpc serve` reads:
//!
//! ```json
//! {
//!   "address": "127.0.0.1:50051",
//!   "protos": ["helloworld.proto"],
//!   "includes": ["."],
//!   "reflection": true,
//!   "handlers": {
//!     "helloworld.Greeter.SayHello": { "message": "Hello from the mock" }
//!   }
//! }
//! ```
//!
//! Relative paths are resolved against the directory of the config file.
use serde::Deserialize;
use simrpc_core::{descriptor::ProtoFiles, server::ServerConfig};
use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    time::Duration,
};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read '{path}': '{source}'")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse '{path}': '{source}'")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("'{0}' lists no proto files")]
    NoProtos(PathBuf),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServeConfig {
    #[serde(default = "default_address")]
    pub address: String,
    pub protos: Vec<PathBuf>,
    #[serde(default)]
    pub includes: Vec<PathBuf>,
    #[serde(default)]
    pub reflection: bool,
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
    #[serde(default = "default_stream_buffer")]
    pub stream_buffer: usize,
    /// Response template per method name.
    #[serde(default)]
    pub handlers: BTreeMap<String, serde_json::Value>,
}

fn default_address() -> String {
    ServerConfig::default().address
}

fn default_shutdown_grace_ms() -> u64 {
    ServerConfig::default().shutdown_grace.as_millis() as u64
}

fn default_stream_buffer() -> usize {
    ServerConfig::default().stream_buffer
}

impl ServeConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let mut config: ServeConfig =
            serde_json::from_str(&contents).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;

        if config.protos.is_empty() {
            return Err(ConfigError::NoProtos(path.to_path_buf()));
        }

        if let Some(base) = path.parent() {
            config.rebase(base);
        }

        Ok(config)
    }

    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            address: self.address.clone(),
            reflection: self.reflection,
            shutdown_grace: Duration::from_millis(self.shutdown_grace_ms),
            stream_buffer: self.stream_buffer,
        }
    }

    pub fn proto_files(&self) -> ProtoFiles {
        ProtoFiles::new(self.protos.clone()).with_includes(self.includes.clone())
    }

    fn rebase(&mut self, base: &Path) {
        for path in self.protos.iter_mut().chain(self.includes.iter_mut()) {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        }
    }
}
