//! Body encodings.
//!
//! Requests and successful responses are either binary Protocol Buffers or
//! JSON. The `Content-Type` header picks the codec; parameters such as
//! `; charset=utf-8` are ignored and the comparison is case-insensitive.

use bytes::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;

pub const CONTENT_TYPE_PROTOBUF: &str = "application/protobuf";
pub const CONTENT_TYPE_JSON: &str = "application/json";

/// A message type usable with both codecs.
///
/// Implemented for every type that is a prost message and serde
/// (de)serializable, which is what generated code derives.
pub trait Message: prost::Message + Default + Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> Message for T where T: prost::Message + Default + Serialize + DeserializeOwned + Send + Sync + 'static {}

/// Encode/decode failures.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("protobuf decode: {0}")]
    Protobuf(#[from] prost::DecodeError),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

/// Negotiated body encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Codec {
    Protobuf,
    Json,
}

impl Codec {
    pub const fn content_type(self) -> &'static str {
        match self {
            Codec::Protobuf => CONTENT_TYPE_PROTOBUF,
            Codec::Json => CONTENT_TYPE_JSON,
        }
    }

    /// Codec for a `Content-Type` header value, if recognized.
    pub fn from_content_type(value: &str) -> Option<Self> {
        let media_type = value.split(';').next().unwrap_or("").trim();
        if media_type.eq_ignore_ascii_case(CONTENT_TYPE_PROTOBUF) {
            Some(Codec::Protobuf)
        } else if media_type.eq_ignore_ascii_case(CONTENT_TYPE_JSON) {
            Some(Codec::Json)
        } else {
            None
        }
    }

    pub fn encode<M: Message>(self, msg: &M) -> Result<Bytes, CodecError> {
        match self {
            Codec::Protobuf => Ok(Bytes::from(msg.encode_to_vec())),
            Codec::Json => Ok(Bytes::from(serde_json::to_vec(msg)?)),
        }
    }

    /// Like [`Codec::encode`], but JSON output leaves out fields holding
    /// their default value. Binary output is unchanged.
    pub fn encode_skipping_defaults<M: Message>(self, msg: &M) -> Result<Bytes, CodecError> {
        match self {
            Codec::Protobuf => self.encode(msg),
            Codec::Json => {
                let mut value = serde_json::to_value(msg)?;
                let defaults = serde_json::to_value(M::default())?;
                strip_defaults(&mut value, &defaults);
                Ok(Bytes::from(serde_json::to_vec(&value)?))
            }
        }
    }

    pub fn decode<M: Message>(self, body: &[u8]) -> Result<M, CodecError> {
        match self {
            Codec::Protobuf => Ok(M::decode(body)?),
            Codec::Json => Ok(serde_json::from_slice(body)?),
        }
    }

    /// Lower-case name used in log fields and error messages.
    pub const fn name(self) -> &'static str {
        match self {
            Codec::Protobuf => "proto",
            Codec::Json => "json",
        }
    }
}

/// Removes top-level fields equal to the message default, and zero values
/// inside nested messages.
fn strip_defaults(value: &mut Value, defaults: &Value) {
    let (Value::Object(fields), Value::Object(default_fields)) = (value, defaults) else {
        return;
    };
    fields.retain(|name, field| default_fields.get(name) != Some(field));
    fields.values_mut().for_each(strip_zero_values);
}

fn strip_zero_values(value: &mut Value) {
    match value {
        Value::Object(fields) => {
            fields.retain(|_, field| !is_zero(field));
            fields.values_mut().for_each(strip_zero_values);
        }
        Value::Array(items) => items.iter_mut().for_each(strip_zero_values),
        _ => {}
    }
}

fn is_zero(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::Number(n) => n.as_f64() == Some(0.0),
        Value::String(s) => s.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(_) => false,
    }
}
