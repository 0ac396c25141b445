//! # CLI
//!
//! This module defines the command-line interface of `simrpc` using `clap`.
//!
//! It is responsible for parsing user input and performing validation (e.g., ensuring headers are `key:value`).
use crate::telemetry::LogFormat;
use clap::{Args, Parser, Subcommand};
use simrpc_core::descriptor::{ProtoFiles, split_method_name};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "simrpc", version, about = "Mock and call gRPC services from their descriptors")]
pub struct Cli {
    /// Log filter directives (e.g. `info` or `simrpc_core=debug`). Defaults to `RUST_LOG`.
    #[arg(long, global = true)]
    pub log: Option<String>,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Compact)]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Serve mock services described by a JSON config file
    ///
    /// The server answers every method of every service declared by the configured
    /// `.proto` files. Methods with a handler template answer with it; the others fail
    /// with UNIMPLEMENTED. Every message in or out is logged.
    ///
    /// ## Examples:
    ///
    /// ```bash
    /// simrpc serve mock.json
    /// ```
    Serve {
        /// Path to the JSON server config
        config: PathBuf,
    },

    /// Perform a gRPC call to a server
    ///
    /// This command connects to a gRPC server and executes a method using a JSON body.
    ///
    /// ## Examples:
    ///
    /// ```bash
    /// simrpc call localhost:50051 helloworld.Greeter.SayHello --body '{"name": "X"}'
    /// ```
    Call {
        #[command(flatten)]
        target: Target,

        /// Method (package.Service.Method or package.Service/Method)
        #[arg(value_parser = parse_method)]
        method: String,

        /// JSON body (Object for Unary and Server Streaming, Array for Client Streaming)
        #[arg(long, value_parser = parse_body)]
        body: serde_json::Value,

        #[arg(short = 'H', long = "header", value_parser = parse_header)]
        headers: Vec<(String, String)>,

        /// Deadline for the call, in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,
    },

    /// List available services or methods
    List {
        #[command(flatten)]
        target: Target,

        #[command(subcommand)]
        sub: ListCommands,
    },
}

#[derive(Subcommand, Debug)]
pub enum ListCommands {
    /// List all services available on the server
    Services,
    /// List the methods of a service
    Methods {
        /// Fully qualified service name (e.g. my.package.Service)
        service: String,
    },
}

/// The server to talk to and where its schema comes from.
#[derive(Args, Debug)]
pub struct Target {
    /// The server address (e.g. localhost:50051 or http://localhost:50051)
    pub url: String,

    /// `.proto` files describing the server. Server reflection is used when omitted.
    #[arg(long = "proto")]
    pub protos: Vec<PathBuf>,

    /// Directories imports are resolved against
    #[arg(short = 'I', long = "include")]
    pub includes: Vec<PathBuf>,
}

impl Target {
    pub fn proto_files(&self) -> Option<ProtoFiles> {
        if self.protos.is_empty() {
            return None;
        }
        Some(ProtoFiles::new(self.protos.clone()).with_includes(self.includes.clone()))
    }
}

fn parse_method(value: &str) -> Result<String, String> {
    split_method_name(value).map(|_| value.to_string()).ok_or_else(|| {
        format!("Invalid method format: '{value}'. Expected 'package.Service.Method'")
    })
}

fn parse_header(s: &str) -> Result<(String, String), String> {
    s.split_once(':')
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .ok_or_else(|| "Format must be 'key:value'".to_string())
}

fn parse_body(value: &str) -> Result<serde_json::Value, String> {
    serde_json::from_str(value).map_err(|e| format!("Invalid JSON: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_a_call_with_headers_and_protos() {
        let cli = Cli::try_parse_from([
            "simrpc",
            "call",
            "localhost:50051",
            "helloworld.Greeter/SayHello",
            "--body",
            r#"{"name": "X"}"#,
            "-H",
            "x-request-id: 42",
            "--proto",
            "protos/helloworld.proto",
            "-I",
            "protos",
        ])
        .unwrap();

        let Commands::Call {
            target,
            method,
            body,
            headers,
            timeout_ms,
        } = cli.command
        else {
            panic!("Expected a call command");
        };

        assert_eq!(target.url, "localhost:50051");
        assert_eq!(method, "helloworld.Greeter/SayHello");
        assert_eq!(body, json!({ "name": "X" }));
        assert_eq!(headers, vec![("x-request-id".to_string(), "42".to_string())]);
        assert_eq!(timeout_ms, None);

        let protos = target.proto_files().unwrap();
        assert_eq!(protos.files, vec![PathBuf::from("protos/helloworld.proto")]);
        assert_eq!(protos.includes, vec![PathBuf::from("protos")]);
    }

    #[test]
    fn rejects_malformed_arguments() {
        let base = ["simrpc", "call", "localhost:50051"];

        let bad_method = Cli::try_parse_from(base.iter().copied().chain(["SayHello", "--body", "{}"]));
        assert!(bad_method.is_err());

        let bad_body = Cli::try_parse_from(
            base.iter()
                .copied()
                .chain(["helloworld.Greeter.SayHello", "--body", "{oops"]),
        );
        assert!(bad_body.is_err());

        let bad_header = Cli::try_parse_from(base.iter().copied().chain([
            "helloworld.Greeter.SayHello",
            "--body",
            "{}",
            "-H",
            "no-colon",
        ]));
        assert!(bad_header.is_err());
    }

    #[test]
    fn list_without_protos_uses_reflection() {
        let cli = Cli::try_parse_from(["simrpc", "list", "localhost:50051", "methods", "a.B"])
            .unwrap();

        let Commands::List { target, sub } = cli.command else {
            panic!("Expected a list command");
        };
        assert!(target.proto_files().is_none());
        assert!(matches!(sub, ListCommands::Methods { service } if service == "a.B"));
    }
}
