//! # Generic gRPC Transport
//!
//! The low-level building blocks shared by the mock server and the dynamic client.
//!
//! Unlike standard `tonic` services and clients, which are strongly typed
//! (e.g., `HelloRequest`), everything here exchanges `prost_reflect::DynamicMessage`
//! values whose schema is only known at runtime.
pub mod client;
pub mod codec;
