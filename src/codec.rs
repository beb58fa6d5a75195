//! Payload codec dispatch
//!
//! A [`Codec`] is chosen once from the configured [`ContentType`] when the
//! client is built and shared by every request afterwards. Both variants
//! go through the same `serde` data model: typed values are converted to a
//! [`serde_json::Value`] tree, which is then written as JSON text or as
//! VelocyPack bytes.

use crate::config::ContentType;
use crate::error::{Error, Result};
use crate::velocypack;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

pub const CONTENT_TYPE_JSON: &str = "application/json; charset=UTF-8";
pub const ACCEPT_JSON: &str = "application/json";
pub const CONTENT_TYPE_VPACK: &str = "application/x-velocypack";

/// Wire encoding for request and response bodies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    Json,
    VelocyPack,
}

impl Codec {
    pub fn for_content_type(content_type: ContentType) -> Self {
        match content_type {
            ContentType::Json => Codec::Json,
            ContentType::VelocyPack => Codec::VelocyPack,
        }
    }

    /// `content-type` header for non-empty bodies
    pub fn content_type(&self) -> &'static str {
        match self {
            Codec::Json => CONTENT_TYPE_JSON,
            Codec::VelocyPack => CONTENT_TYPE_VPACK,
        }
    }

    /// `accept` header sent with every request
    pub fn accept(&self) -> &'static str {
        match self {
            Codec::Json => ACCEPT_JSON,
            Codec::VelocyPack => CONTENT_TYPE_VPACK,
        }
    }

    /// Serialize a typed value
    pub fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Bytes> {
        match self {
            Codec::Json => Ok(Bytes::from(serde_json::to_vec(value)?)),
            Codec::VelocyPack => {
                let tree = serde_json::to_value(value)?;
                Ok(Bytes::from(velocypack::to_vec(&tree)?))
            }
        }
    }

    /// Decode a body into its value tree
    pub fn decode_value(&self, bytes: &[u8]) -> Result<Value> {
        match self {
            Codec::Json => Ok(serde_json::from_slice(bytes)?),
            Codec::VelocyPack => Ok(velocypack::from_slice(bytes)?),
        }
    }

    /// Decode a body into a typed value
    pub fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        let tree = self.decode_value(bytes)?;
        serde_json::from_value(tree)
            .map_err(|e| Error::Protocol(format!("unexpected response shape: {}", e)))
    }
}
