//! # Simrpc Core
//!
//! `simrpc-core` is a descriptor-driven gRPC simulation engine. Given nothing but `.proto`
//! files (or a live server exposing reflection) it can:
//!
//! * serve **any** method of **any** service through a [`server::MockServer`] whose dispatch
//!   table is generated at runtime, answering calls with pluggable [`server::MethodHandler`]s;
//! * call **any** method through a [`client::SimClient`] using JSON payloads.
//!
//! ## Key Components
//!
//! * **[`descriptor::ServiceSet`]:** The resolved schema, built from files or reflection.
//! * **[`message`]:** Reads and writes `DynamicMessage` values through `serde_json::Value`.
//! * **[`server::MockServer`]:** The dynamic server, with its handler registry and traffic
//!   listener bus.
//! * **[`client::SimClient`]:** The dynamic client, adapting to each method's streaming shape.
//!
//! ## Internal clients
//!
//! * **[`GrpcClient`](grpc::client::GrpcClient):** A generic gRPC client exchanging
//!   `DynamicMessage` values through the [`DynamicCodec`](grpc::codec::DynamicCodec).
//! * **[`ReflectionClient`](reflection::client::ReflectionClient):** A client for the gRPC
//!   Server Reflection Protocol.
//!
//! ## Re-exports
//!
//! This crate re-exports `prost`, `prost-reflect`, and `tonic` to ensure that consumers
//! use compatible versions of these underlying dependencies.
pub mod client;
pub mod descriptor;
pub mod grpc;
pub mod message;
pub mod reflection;
pub mod server;

// Re-exports
pub use prost;
pub use prost_reflect;
pub use tonic;

/// Type alias for the standard boxed error used in generic bounds.
type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;
