//! Logical requests, encoded envelopes and responses

use crate::codec::Codec;
use crate::error::Result;
use bytes::Bytes;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// VelocyStream / envelope protocol version
pub const MESSAGE_VERSION: i64 = 1;

/// Request verb
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Head,
    Options,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
            Method::Head => "HEAD",
            Method::Options => "OPTIONS",
        }
    }

    /// Request type code used in VelocyStream headers
    pub fn vst_code(&self) -> i64 {
        match self {
            Method::Delete => 0,
            Method::Get => 1,
            Method::Post => 2,
            Method::Put => 3,
            Method::Head => 4,
            Method::Patch => 5,
            Method::Options => 6,
        }
    }

    pub fn from_vst_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(Method::Delete),
            1 => Some(Method::Get),
            2 => Some(Method::Post),
            3 => Some(Method::Put),
            4 => Some(Method::Head),
            5 => Some(Method::Patch),
            6 => Some(Method::Options),
            _ => None,
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Message kinds of the envelope protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Request,
    Response,
    Authentication,
}

impl MessageKind {
    pub fn code(&self) -> i64 {
        match self {
            MessageKind::Request => 1,
            MessageKind::Response => 2,
            MessageKind::Authentication => 1000,
        }
    }
}

/// Request payload before encoding
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Body {
    #[default]
    Empty,
    /// Encoded with the client's codec
    Value(Value),
    /// Sent as-is
    Raw(Bytes),
}

/// Logical request built by an endpoint wrapper
///
/// Builder methods consume `self`; once handed to the executor a request
/// is never modified.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub database: Option<String>,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub headers: BTreeMap<String, String>,
    pub body: Body,
}

impl Request {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            database: None,
            path: path.into(),
            query: Vec::new(),
            headers: BTreeMap::new(),
            body: Body::Empty,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::Get, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::Post, path)
    }

    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::Put, path)
    }

    pub fn patch(path: impl Into<String>) -> Self {
        Self::new(Method::Patch, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::Delete, path)
    }

    pub fn head(path: impl Into<String>) -> Self {
        Self::new(Method::Head, path)
    }

    pub fn database(mut self, name: impl Into<String>) -> Self {
        self.database = Some(name.into());
        self
    }

    /// Append a query parameter; order is preserved on the wire
    pub fn query_param(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.query.push((key.into(), value.to_string()));
        self
    }

    /// Set a header; names are case-insensitive and stored lower-cased
    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn json(mut self, value: Value) -> Self {
        self.body = Body::Value(value);
        self
    }

    /// Structured body from any serializable value
    pub fn body<T: Serialize + ?Sized>(self, value: &T) -> Result<Self> {
        Ok(self.json(serde_json::to_value(value)?))
    }

    pub fn raw_body(mut self, bytes: impl Into<Bytes>) -> Self {
        self.body = Body::Raw(bytes.into());
        self
    }
}

/// Encoded request as handed to a transport
#[derive(Debug, Clone, PartialEq)]
pub struct RequestEnvelope {
    pub version: i64,
    pub kind: MessageKind,
    pub database: Option<String>,
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub headers: BTreeMap<String, String>,
    pub body: Bytes,
}

impl RequestEnvelope {
    /// Encode the body with `codec` and set `content-type` / `accept`
    pub fn encode(request: &Request, codec: Codec) -> Result<Self> {
        let body = match &request.body {
            Body::Empty => Bytes::new(),
            Body::Value(value) => codec.encode(value)?,
            Body::Raw(bytes) => bytes.clone(),
        };

        let mut headers = request.headers.clone();
        headers.insert("accept".to_string(), codec.accept().to_string());
        if !body.is_empty() {
            headers
                .entry("content-type".to_string())
                .or_insert_with(|| codec.content_type().to_string());
        }

        Ok(Self {
            version: MESSAGE_VERSION,
            kind: MessageKind::Request,
            database: request.database.clone(),
            method: request.method,
            path: request.path.clone(),
            query: request.query.clone(),
            headers,
            body,
        })
    }

    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    /// Path with the `/_db/{database}` prefix and query string
    pub fn target(&self) -> String {
        let mut target = String::new();
        if let Some(db) = self.database.as_deref().filter(|db| !db.is_empty()) {
            target.push_str("/_db/");
            target.push_str(db);
        }
        target.push_str(&self.path);
        if !self.query.is_empty() {
            target.push('?');
            let params: Vec<String> = self
                .query
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect();
            target.push_str(&params.join("&"));
        }
        target
    }
}

/// Raw response as produced by a transport
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: Bytes,
}

impl Response {
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: BTreeMap::new(),
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }
}
