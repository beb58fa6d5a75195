//! Fake coordinator shared by the transport integration tests
//!
//! The request logic is transport independent; `serve_http` puts an axum
//! router in front of it and `serve_vst` a raw VelocyStream listener.

#![allow(dead_code)]

use arango_next::codec::{Codec, CONTENT_TYPE_VPACK};
use arango_next::connection::chunk::{self, MessageAssembler, VST_HANDSHAKE};
use arango_next::velocypack;
use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{header, HeaderMap, Method, StatusCode, Uri};
use axum::response::Response;
use axum::Router;
use base64::Engine;
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[derive(Debug, Clone)]
pub struct FakeRequest {
    pub method: String,
    pub database: String,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub headers: BTreeMap<String, String>,
    pub body: Value,
    /// VST connection already authenticated by an auth message
    pub authenticated: bool,
}

pub struct FakeReply {
    pub status: u16,
    pub body: Value,
    pub set_cookie: Option<String>,
}

impl FakeReply {
    fn new(status: u16, body: Value) -> Self {
        Self {
            status,
            body,
            set_cookie: None,
        }
    }
}

fn error_reply(status: u16, code: i64, message: &str) -> FakeReply {
    FakeReply::new(
        status,
        json!({"error": true, "code": status, "errorNum": code, "errorMessage": message}),
    )
}

struct Cursor {
    rows: VecDeque<Value>,
    batch_size: usize,
}

#[derive(Default)]
struct FakeState {
    rows: Vec<Value>,
    cursors: HashMap<String, Cursor>,
    next_id: u64,
    basic: Option<(String, String)>,
    jwt: Option<(String, String, String)>,
    reject_next: usize,
    requests: Vec<FakeRequest>,
    vst_auth_messages: Vec<Value>,
}

#[derive(Clone, Default)]
pub struct FakeCoordinator {
    state: Arc<Mutex<FakeState>>,
}

impl FakeCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rows(self, rows: Vec<Value>) -> Self {
        self.state.lock().rows = rows;
        self
    }

    pub fn with_basic(self, user: &str, password: &str) -> Self {
        self.state.lock().basic = Some((user.to_string(), password.to_string()));
        self
    }

    pub fn with_jwt(self, user: &str, password: &str, token: &str) -> Self {
        self.state.lock().jwt = Some((user.to_string(), password.to_string(), token.to_string()));
        self
    }

    pub fn reject_next(&self, n: usize) {
        self.state.lock().reject_next = n;
    }

    pub fn rotate_token(&self, token: &str) {
        if let Some((_, _, current)) = self.state.lock().jwt.as_mut() {
            *current = token.to_string();
        }
    }

    pub fn requests(&self) -> Vec<FakeRequest> {
        self.state.lock().requests.clone()
    }

    pub fn requests_to(&self, path: &str) -> Vec<FakeRequest> {
        self.requests().into_iter().filter(|r| r.path == path).collect()
    }

    pub fn vst_auth_messages(&self) -> Vec<Value> {
        self.state.lock().vst_auth_messages.clone()
    }

    pub fn open_cursors(&self) -> usize {
        self.state.lock().cursors.len()
    }

    fn expected_authorization(state: &FakeState) -> Option<String> {
        if let Some((user, password)) = &state.basic {
            let encoded = base64::engine::general_purpose::STANDARD
                .encode(format!("{}:{}", user, password));
            return Some(format!("Basic {}", encoded));
        }
        state
            .jwt
            .as_ref()
            .map(|(_, _, token)| format!("bearer {}", token))
    }

    /// Validate a VST authentication message
    pub fn vst_authenticate(&self, message: &Value) -> bool {
        let mut state = self.state.lock();
        state.vst_auth_messages.push(message.clone());
        match (message[2].as_str(), &state.basic, &state.jwt) {
            (Some("plain"), Some((user, password)), _) => {
                message[3] == json!(user) && message[4] == json!(password)
            }
            (Some("jwt"), _, Some((_, _, token))) => message[3] == json!(token),
            _ => false,
        }
    }

    pub fn handle(&self, request: FakeRequest) -> FakeReply {
        let mut state = self.state.lock();
        state.requests.push(request.clone());

        if request.path == "/_open/auth" {
            return match &state.jwt {
                Some((user, password, token))
                    if request.body["username"] == json!(user)
                        && request.body["password"] == json!(password) =>
                {
                    FakeReply::new(200, json!({"jwt": token}))
                }
                _ => error_reply(401, 401, "Wrong credentials"),
            };
        }

        if state.reject_next > 0 {
            state.reject_next -= 1;
            return error_reply(401, 401, "not authorized");
        }
        if let Some(expected) = Self::expected_authorization(&state) {
            let presented = request.headers.get("authorization");
            if !request.authenticated && presented != Some(&expected) {
                return error_reply(401, 401, "not authorized");
            }
        }

        let segments: Vec<&str> = request.path.trim_start_matches('/').split('/').collect();
        match (request.method.as_str(), segments.as_slice()) {
            ("GET", ["_api", "version"]) => FakeReply {
                status: 200,
                body: json!({"server": "arango", "version": "3.12.0", "license": "community"}),
                set_cookie: Some("arango_session=s1; Path=/".to_string()),
            },
            ("GET", ["_api", "echo"]) => {
                let query: Map<String, Value> = request
                    .query
                    .iter()
                    .map(|(k, v)| (k.clone(), json!(v)))
                    .collect();
                FakeReply::new(
                    200,
                    json!({
                        "database": request.database,
                        "headers": request.headers,
                        "query": query,
                    }),
                )
            }
            ("POST", ["_api", "echo"]) => FakeReply::new(200, json!({"body": request.body})),
            ("GET", ["_api", "database", "current"]) => {
                if request.database == "_system" {
                    FakeReply::new(
                        200,
                        json!({"error": false, "code": 200, "result": {
                            "name": "_system", "id": "1", "path": "/data", "isSystem": true
                        }}),
                    )
                } else {
                    error_reply(404, 1228, "database not found")
                }
            }
            ("POST", ["_api", "cursor"]) => {
                let batch_size = request.body["batchSize"].as_u64().unwrap_or(1000).max(1) as usize;
                let mut rows: VecDeque<Value> = state.rows.iter().cloned().collect();
                let first: Vec<Value> = rows.drain(..batch_size.min(rows.len())).collect();
                let has_more = !rows.is_empty();
                let mut body = json!({
                    "error": false, "code": 201, "result": first, "hasMore": has_more, "cached": false
                });
                if has_more {
                    state.next_id += 1;
                    let id = state.next_id.to_string();
                    body["id"] = json!(id);
                    state.cursors.insert(id, Cursor { rows, batch_size });
                }
                FakeReply::new(201, body)
            }
            ("POST", ["_api", "cursor", id]) | ("PUT", ["_api", "cursor", id]) => {
                let id = id.to_string();
                let Some(cursor) = state.cursors.get_mut(&id) else {
                    return error_reply(404, 1600, "cursor not found");
                };
                let take = cursor.batch_size.min(cursor.rows.len());
                let batch: Vec<Value> = cursor.rows.drain(..take).collect();
                let has_more = !cursor.rows.is_empty();
                if !has_more {
                    state.cursors.remove(&id);
                }
                FakeReply::new(
                    200,
                    json!({"error": false, "code": 200, "id": id, "result": batch, "hasMore": has_more}),
                )
            }
            ("DELETE", ["_api", "cursor", id]) => {
                if state.cursors.remove(*id).is_some() {
                    FakeReply::new(202, json!({"error": false, "code": 202, "id": id}))
                } else {
                    error_reply(404, 1600, "cursor not found")
                }
            }
            _ => error_reply(404, 404, "unknown path"),
        }
    }
}

fn codec_for(content_type: Option<&str>) -> Codec {
    match content_type {
        Some(ct) if ct.starts_with(CONTENT_TYPE_VPACK) => Codec::VelocyPack,
        _ => Codec::Json,
    }
}

fn decode_body(codec: Codec, bytes: &[u8]) -> Value {
    if bytes.is_empty() {
        Value::Null
    } else {
        codec.decode_value(bytes).unwrap_or(Value::Null)
    }
}

fn split_target(path: &str, query: Option<&str>) -> (String, String, Vec<(String, String)>) {
    let (database, path) = match path.strip_prefix("/_db/") {
        Some(rest) => match rest.split_once('/') {
            Some((db, tail)) => (db.to_string(), format!("/{}", tail)),
            None => (rest.to_string(), "/".to_string()),
        },
        None => ("_system".to_string(), path.to_string()),
    };
    let query = query
        .map(|q| {
            q.split('&')
                .filter(|p| !p.is_empty())
                .map(|pair| match pair.split_once('=') {
                    Some((k, v)) => (k.to_string(), v.to_string()),
                    None => (pair.to_string(), String::new()),
                })
                .collect()
        })
        .unwrap_or_default();
    (database, path, query)
}

async fn http_handler(
    State(coordinator): State<FakeCoordinator>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let header_map: BTreeMap<String, String> = headers
        .iter()
        .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str().to_string(), v.to_string())))
        .collect();
    let request_codec = codec_for(header_map.get("content-type").map(String::as_str));
    let reply_codec = codec_for(header_map.get("accept").map(String::as_str));
    let (database, path, query) = split_target(uri.path(), uri.query());

    let reply = coordinator.handle(FakeRequest {
        method: method.as_str().to_string(),
        database,
        path,
        query,
        headers: header_map,
        body: decode_body(request_codec, &body),
        authenticated: false,
    });

    let mut builder = Response::builder()
        .status(StatusCode::from_u16(reply.status).unwrap())
        .header(header::CONTENT_TYPE, reply_codec.content_type());
    if let Some(cookie) = reply.set_cookie {
        builder = builder.header(header::SET_COOKIE, cookie);
    }
    let bytes = reply_codec.encode(&reply.body).unwrap();
    builder.body(Body::from(bytes)).unwrap()
}

/// Serve the coordinator over HTTP on an ephemeral port
pub async fn serve_http(coordinator: FakeCoordinator) -> SocketAddr {
    let app = Router::new().fallback(http_handler).with_state(coordinator);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

async fn vst_session(mut stream: TcpStream, coordinator: FakeCoordinator, reply_chunk_size: usize) {
    let mut preamble = [0u8; 11];
    if stream.read_exact(&mut preamble).await.is_err() || preamble != VST_HANDSHAKE {
        return;
    }

    let mut assembler = MessageAssembler::new();
    let mut authenticated = false;
    loop {
        let chunk = match chunk::read_chunk(&mut stream).await {
            Ok(chunk) => chunk,
            Err(_) => return,
        };
        let Some((id, message)) = assembler.push(chunk).unwrap() else {
            continue;
        };
        let (header, size) = velocypack::read_value(&message).unwrap();

        let (status, meta, body) = if header[1] == json!(1000) {
            authenticated = coordinator.vst_authenticate(&header);
            let status = if authenticated { 200 } else { 401 };
            (status, Map::new(), Vec::new())
        } else {
            let meta: BTreeMap<String, String> = header[6]
                .as_object()
                .map(|m| {
                    m.iter()
                        .map(|(k, v)| (k.clone(), v.as_str().unwrap_or_default().to_string()))
                        .collect()
                })
                .unwrap_or_default();
            let query: Vec<(String, String)> = header[5]
                .as_object()
                .map(|m| {
                    m.iter()
                        .map(|(k, v)| (k.clone(), v.as_str().unwrap_or_default().to_string()))
                        .collect()
                })
                .unwrap_or_default();
            let method = match header[3].as_i64() {
                Some(0) => "DELETE",
                Some(1) => "GET",
                Some(2) => "POST",
                Some(3) => "PUT",
                Some(4) => "HEAD",
                Some(5) => "PATCH",
                _ => "OPTIONS",
            };
            let request_codec = codec_for(meta.get("content-type").map(String::as_str));
            let reply_codec = codec_for(meta.get("accept").map(String::as_str));

            let reply = coordinator.handle(FakeRequest {
                method: method.to_string(),
                database: header[2].as_str().unwrap_or("_system").to_string(),
                path: header[4].as_str().unwrap_or("/").to_string(),
                query,
                headers: meta,
                body: decode_body(request_codec, &message[size..]),
                authenticated,
            });
            let mut meta = Map::new();
            meta.insert("content-type".to_string(), json!(reply_codec.content_type()));
            let body = reply_codec.encode(&reply.body).unwrap().to_vec();
            (reply.status, meta, body)
        };

        let mut reply = velocypack::to_vec(&json!([1, 2, status, meta])).unwrap();
        reply.extend_from_slice(&body);
        if chunk::write_message(&mut stream, id, &reply, reply_chunk_size)
            .await
            .is_err()
        {
            return;
        }
    }
}

/// Serve the coordinator over VelocyStream on an ephemeral port
pub async fn serve_vst(coordinator: FakeCoordinator, reply_chunk_size: usize) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(vst_session(stream, coordinator.clone(), reply_chunk_size));
        }
    });
    addr
}

pub fn numbers(n: i64) -> Vec<Value> {
    (1..=n).map(|i| json!(i)).collect()
}
