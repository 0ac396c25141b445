//! # Dynamic Protobuf Codec
//!
//! This module implements `tonic::codec::Codec` over `prost_reflect::DynamicMessage`, so
//! `tonic` can transport messages whose types are only known at runtime.
//!
//! Encoding needs no schema: a `DynamicMessage` carries its own descriptor. Decoding
//! needs the descriptor of the incoming message, which depends on the side of the call:
//!
//! * **Server**: incoming messages are requests, decoded with the method's input type.
//! * **Client**: incoming messages are responses, decoded with the method's output type.
use prost::Message;
use prost_reflect::{DynamicMessage, MessageDescriptor};
use tonic::{
    Status,
    codec::{Codec, DecodeBuf, Decoder, EncodeBuf, Encoder},
};

/// A Codec that writes any `DynamicMessage` and reads messages of one given type.
#[derive(Debug, Clone)]
pub struct DynamicCodec {
    /// Schema for the messages read from the wire.
    decode_desc: MessageDescriptor,
}

impl DynamicCodec {
    pub fn new(decode_desc: MessageDescriptor) -> Self {
        Self { decode_desc }
    }

    /// Codec for the server side of `method`: reads requests, writes responses.
    pub fn for_server(method: &prost_reflect::MethodDescriptor) -> Self {
        Self::new(method.input())
    }

    /// Codec for the client side of `method`: writes requests, reads responses.
    pub fn for_client(method: &prost_reflect::MethodDescriptor) -> Self {
        Self::new(method.output())
    }
}

impl Codec for DynamicCodec {
    type Encode = DynamicMessage;
    type Decode = DynamicMessage;

    type Encoder = DynamicEncoder;
    type Decoder = DynamicDecoder;

    fn encoder(&mut self) -> Self::Encoder {
        DynamicEncoder
    }

    fn decoder(&mut self) -> Self::Decoder {
        DynamicDecoder(self.decode_desc.clone())
    }
}

/// Responsible for encoding a `DynamicMessage` into Protobuf bytes.
#[derive(Debug)]
pub struct DynamicEncoder;

impl Encoder for DynamicEncoder {
    type Item = DynamicMessage;
    type Error = Status;

    fn encode(&mut self, item: Self::Item, dst: &mut EncodeBuf<'_>) -> Result<(), Self::Error> {
        item.encode_raw(dst);
        Ok(())
    }
}

/// Responsible for decoding Protobuf bytes into a `DynamicMessage`.
#[derive(Debug)]
pub struct DynamicDecoder(MessageDescriptor);

impl Decoder for DynamicDecoder {
    type Item = DynamicMessage;
    type Error = Status;

    fn decode(&mut self, src: &mut DecodeBuf<'_>) -> Result<Option<Self::Item>, Self::Error> {
        let mut msg = DynamicMessage::new(self.0.clone());
        msg.merge(src).map_err(|e| {
            Status::internal(format!(
                "Failed to decode Protobuf bytes as '{}': {}",
                self.0.full_name(),
                e
            ))
        })?;

        Ok(Some(msg))
    }
}
