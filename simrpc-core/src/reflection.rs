//! # Server Reflection
//!
//! This module contains the logic necessary to interact with the gRPC Server Reflection Protocol.
//!
//! It enables the resolver to query a server for its own Protobuf schema at runtime, so the
//! client can function without local `.proto` files. The message and client types come from
//! `tonic-reflection`'s generated `grpc.reflection.v1` bindings.
pub mod client;
