//! Wire protocol.
//!
//! Every request and response travels as one length-prefixed frame (see
//! `network::frame`). This module defines the frame payloads: integers are
//! big-endian, strings and byte arrays are an unsigned varint length followed
//! by the bytes, lists are an `i32` count followed by the elements.

pub use api_key::ApiKey;
pub use codec::{WireDecode, WireEncode};
pub use error_code::ErrorCode;
pub use messages::{
    CreateTopicRequest, GetTopicRequest, MessageBatch, PublishRequest, PublishResponse,
    SubscribeRequest,
};

pub(crate) use codec::{get_i16, get_i32, get_string, put_string};

mod api_key;
mod codec;
mod error_code;
mod messages;
