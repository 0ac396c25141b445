//! # simrpc CLI Entry Point
//!
//! The main executable for simrpc. It drives two kinds of sessions:
//!
//! 1. **Serving**: builds a [`MockServer`] from the `.proto` files of a JSON config, answers
//!    the configured methods with their response templates and logs every message until
//!    interrupted.
//! 2. **Calling**: connects a [`SimClient`] to a server, resolving its schema from `.proto`
//!    files or server reflection, and prints the JSON results to standard output.
//!
//! Errors are printed to standard error and exit with status 1.
mod cli;
mod config;
mod formatter;
mod telemetry;

use clap::Parser;
use cli::{Cli, Commands, ListCommands, Target};
use config::ServeConfig;
use formatter::{FormattedString, GenericError, MethodList, ServiceList};
use simrpc_core::{
    client::{ClientOptions, SimClient},
    message,
    server::{MockServer, TemplateHandler, Traffic},
};
use std::{collections::HashSet, path::Path, process, time::Duration};

#[tokio::main]
async fn main() {
    let args = Cli::parse();

    if let Err(err) = telemetry::initialise(args.log.as_deref(), args.log_format) {
        eprintln!("{}", FormattedString::from(GenericError("Failed to set up logging", err)));
        process::exit(1);
    }

    match args.command {
        Commands::Serve { config } => serve(&config).await,
        Commands::Call {
            target,
            method,
            body,
            headers,
            timeout_ms,
        } => run_call(&target, &method, body, headers, timeout_ms).await,
        Commands::List { target, sub } => match sub {
            ListCommands::Services => list_services(&target).await,
            ListCommands::Methods { service } => list_methods(&target, &service).await,
        },
    }
}

fn exit_with(message: impl Into<FormattedString>) -> ! {
    eprintln!("{}", message.into());
    process::exit(1);
}

async fn serve(path: &Path) {
    let config = ServeConfig::load(path).unwrap_or_else(|err| exit_with(err));

    let server = MockServer::from_files(config.server_config(), &config.proto_files())
        .unwrap_or_else(|err| exit_with(err));

    let mut handled = HashSet::new();
    for (method, template) in &config.handlers {
        let Some(desc) = server.services().method(method) else {
            exit_with(GenericError("Unknown method in handlers", method));
        };

        // Surface template mistakes now rather than on the first call.
        if let Err(err) = message::from_json(&desc.output(), template.clone()) {
            exit_with(GenericError("Invalid response template", err));
        }

        let handler = TemplateHandler::new(template.clone())
            .unwrap_or_else(|err| exit_with(GenericError("Invalid response template", err)));
        server
            .set_method_handler(method, handler)
            .unwrap_or_else(|err| exit_with(err));
        handled.insert(desc.full_name().to_string());
    }

    server.add_listener(|traffic: &Traffic| {
        tracing::info!(
            method = %traffic.method,
            direction = %traffic.direction,
            source = %traffic.source,
            destination = %traffic.destination,
            payload = %traffic.payload,
            "traffic"
        );
    });

    let addr = server.start().await.unwrap_or_else(|err| exit_with(err));

    let unhandled: Vec<_> = server
        .list_methods()
        .into_iter()
        .filter(|method| !handled.contains(method))
        .collect();
    if !unhandled.is_empty() {
        tracing::warn!(methods = ?unhandled, "methods without a handler answer UNIMPLEMENTED");
    }

    println!("Serving {} on {addr}", server.services().list_services().join(", "));

    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for ctrl-c");
    }

    server.close().await;
}

async fn connect_or_exit(target: &Target, request_timeout: Option<Duration>) -> SimClient {
    let options = ClientOptions {
        request_timeout,
        ..ClientOptions::default()
    };

    match SimClient::connect_with(&target.url, target.proto_files().as_ref(), options).await {
        Ok(client) => client,
        Err(err) => exit_with(err),
    }
}

async fn run_call(
    target: &Target,
    method: &str,
    body: serde_json::Value,
    headers: Vec<(String, String)>,
    timeout_ms: Option<u64>,
) {
    let mut client = connect_or_exit(target, timeout_ms.map(Duration::from_millis)).await;

    match client.invoke_rpc_with_metadata(method, body, headers).await {
        Ok(response) => println!("{}", FormattedString::from(response)),
        Err(err) => exit_with(err),
    }
}

async fn list_services(target: &Target) {
    let client = connect_or_exit(target, None).await;

    match client.list_services() {
        Ok(services) => println!("{}", FormattedString::from(ServiceList(services.to_vec()))),
        Err(err) => exit_with(err),
    }
}

async fn list_methods(target: &Target, service: &str) {
    let client = connect_or_exit(target, None).await;

    match client.list_methods(service) {
        Ok(methods) => println!(
            "{}",
            FormattedString::from(MethodList(service.to_string(), methods))
        ),
        Err(err) => exit_with(err),
    }
}
