//! Scripted in-memory coordinator for unit tests
//!
//! [`MockCoordinator`] answers the handful of endpoints the driver core
//! talks to, keeps server-side cursor and transaction state per host, and
//! can be told to reject credentials, drop hosts or stall responses.

use crate::codec::{Codec, CONTENT_TYPE_VPACK};
use crate::config::HostDescription;
use crate::connection::message::{Method, RequestEnvelope, Response};
use crate::connection::{Connection, ConnectionFactory};
use crate::error::{Error, Result};
use crate::error_codes;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub(crate) fn host(n: u16) -> HostDescription {
    HostDescription::new(format!("coordinator-{}", n), 8529)
}

/// Route `tracing` output to the test harness, once per process
pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// One logged request
#[derive(Debug, Clone)]
pub(crate) struct Seen {
    pub host: HostDescription,
    pub method: Method,
    pub path: String,
    pub database: Option<String>,
    pub transaction: Option<String>,
    pub authorization: Option<String>,
}

struct ServerCursor {
    host: HostDescription,
    rows: VecDeque<Value>,
    batch_size: usize,
}

struct ServerTransaction {
    host: HostDescription,
    status: &'static str,
}

enum Auth {
    Open,
    Basic(String),
    Jwt {
        user: String,
        password: String,
        token: String,
    },
}

struct State {
    auth: Auth,
    reject_next: usize,
    rows: Vec<Value>,
    cursors: HashMap<String, ServerCursor>,
    transactions: HashMap<String, ServerTransaction>,
    databases: HashSet<String>,
    documents: HashMap<String, Value>,
    endpoints: Option<Vec<String>>,
    down: HashSet<HostDescription>,
    latency: Option<Duration>,
    garbage_next: usize,
    reject_open: usize,
    next_id: u64,
    seen: Vec<Seen>,
    logins: usize,
}

#[derive(Clone)]
pub(crate) struct MockCoordinator {
    state: Arc<Mutex<State>>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
}

impl MockCoordinator {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                auth: Auth::Open,
                reject_next: 0,
                rows: Vec::new(),
                cursors: HashMap::new(),
                transactions: HashMap::new(),
                databases: ["_system".to_string()].into_iter().collect(),
                documents: HashMap::new(),
                endpoints: None,
                down: HashSet::new(),
                latency: None,
                garbage_next: 0,
                reject_open: 0,
                next_id: 100,
                seen: Vec::new(),
                logins: 0,
            })),
            in_flight: Arc::new(AtomicUsize::new(0)),
            max_in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_basic(self, user: &str, password: &str) -> Self {
        use base64::Engine;
        let encoded =
            base64::engine::general_purpose::STANDARD.encode(format!("{}:{}", user, password));
        self.state.lock().auth = Auth::Basic(format!("Basic {}", encoded));
        self
    }

    pub fn with_jwt(self, user: &str, password: &str, token: &str) -> Self {
        self.state.lock().auth = Auth::Jwt {
            user: user.to_string(),
            password: password.to_string(),
            token: token.to_string(),
        };
        self
    }

    pub fn with_rows(self, rows: Vec<Value>) -> Self {
        self.state.lock().rows = rows;
        self
    }

    pub fn with_database(self, name: &str) -> Self {
        self.state.lock().databases.insert(name.to_string());
        self
    }

    pub fn with_document(self, handle: &str, document: Value) -> Self {
        self.state.lock().documents.insert(handle.to_string(), document);
        self
    }

    pub fn with_endpoints(self, endpoints: &[&str]) -> Self {
        self.state.lock().endpoints = Some(endpoints.iter().map(|e| e.to_string()).collect());
        self
    }

    pub fn with_latency(self, latency: Duration) -> Self {
        self.set_latency(Some(latency));
        self
    }

    pub fn set_latency(&self, latency: Option<Duration>) {
        self.state.lock().latency = latency;
    }

    /// Answer the next `n` authenticated requests with 401
    pub fn reject_next(&self, n: usize) {
        self.state.lock().reject_next = n;
    }

    /// Invalidate the current token; the next login hands out `token`
    pub fn rotate_token(&self, token: &str) {
        if let Auth::Jwt { token: current, .. } = &mut self.state.lock().auth {
            *current = token.to_string();
        }
    }

    /// Refuse connections and fail requests for `host`
    pub fn take_down(&self, host: &HostDescription) {
        self.state.lock().down.insert(host.clone());
    }

    pub fn restore(&self, host: &HostDescription) {
        self.state.lock().down.remove(host);
    }

    /// Reject the credentials presented by the next `n` new connections
    pub fn reject_open(&self, n: usize) {
        self.state.lock().reject_open = n;
    }

    fn take_open_rejection(&self) -> bool {
        let mut state = self.state.lock();
        if state.reject_open > 0 {
            state.reject_open -= 1;
            return true;
        }
        false
    }

    /// Reply to the next `n` requests with an undecodable 200 body
    pub fn garbage_next(&self, n: usize) {
        self.state.lock().garbage_next = n;
    }

    pub fn requests(&self) -> Vec<Seen> {
        self.state.lock().seen.clone()
    }

    pub fn requests_to(&self, path_prefix: &str) -> Vec<Seen> {
        self.requests()
            .into_iter()
            .filter(|s| s.path.starts_with(path_prefix))
            .collect()
    }

    pub fn login_requests(&self) -> usize {
        self.state.lock().logins
    }

    pub fn open_cursors(&self) -> usize {
        self.state.lock().cursors.len()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn transaction_status(&self, id: &str) -> Option<&'static str> {
        self.state.lock().transactions.get(id).map(|t| t.status)
    }

    fn is_down(&self, host: &HostDescription) -> bool {
        self.state.lock().down.contains(host)
    }

    fn latency(&self) -> Option<Duration> {
        self.state.lock().latency
    }

    fn handle(&self, host: &HostDescription, request: &RequestEnvelope) -> Response {
        let request_codec = match request.header("content-type") {
            Some(ct) if ct.starts_with(CONTENT_TYPE_VPACK) => Codec::VelocyPack,
            _ => Codec::Json,
        };
        let response_codec = match request.header("accept") {
            Some(accept) if accept.starts_with(CONTENT_TYPE_VPACK) => Codec::VelocyPack,
            _ => Codec::Json,
        };
        let body = if request.body.is_empty() {
            Value::Null
        } else {
            match request_codec.decode_value(&request.body) {
                Ok(value) => value,
                Err(e) => return reply(response_codec, 400, error_body(400, 400, &e.to_string())),
            }
        };

        let mut state = self.state.lock();
        state.seen.push(Seen {
            host: host.clone(),
            method: request.method,
            path: request.path.clone(),
            database: request.database.clone(),
            transaction: request.header("x-arango-trx-id").map(str::to_string),
            authorization: request.header("authorization").map(str::to_string),
        });

        if request.path == crate::connection::auth::LOGIN_PATH {
            return state.login(response_codec, &body);
        }
        if let Some(rejection) = state.check_auth(request) {
            return reply(response_codec, 401, rejection);
        }
        if state.garbage_next > 0 {
            state.garbage_next -= 1;
            let mut response = Response::new(200, &b"\xff\xfe garbage"[..]);
            response
                .headers
                .insert("content-type".to_string(), response_codec.content_type().to_string());
            return response;
        }

        let (status, value) = state.route(host, request, &body);
        match value {
            Some(value) => reply(response_codec, status, value),
            None => Response::new(status, Vec::new()),
        }
    }
}

fn error_body(status: u16, code: i64, message: &str) -> Value {
    json!({"error": true, "code": status, "errorNum": code, "errorMessage": message})
}

fn reply(codec: Codec, status: u16, value: Value) -> Response {
    let body = codec.encode(&value).unwrap_or_default();
    let mut response = Response::new(status, body);
    response
        .headers
        .insert("content-type".to_string(), codec.content_type().to_string());
    response
}

impl State {
    fn next_id(&mut self) -> String {
        self.next_id += 1;
        self.next_id.to_string()
    }

    fn login(&mut self, codec: Codec, body: &Value) -> Response {
        self.logins += 1;
        match &self.auth {
            Auth::Jwt {
                user,
                password,
                token,
            } if body["username"] == json!(user) && body["password"] == json!(password) => {
                reply(codec, 200, json!({"jwt": token}))
            }
            _ => reply(codec, 401, error_body(401, 401, "Wrong credentials")),
        }
    }

    fn check_auth(&mut self, request: &RequestEnvelope) -> Option<Value> {
        let unauthorized = || Some(error_body(401, 401, "not authorized to execute this request"));
        if self.reject_next > 0 {
            self.reject_next -= 1;
            return unauthorized();
        }
        let presented = request.header("authorization");
        match &self.auth {
            Auth::Open => None,
            Auth::Basic(expected) if presented == Some(expected.as_str()) => None,
            Auth::Jwt { token, .. } if presented == Some(format!("bearer {}", token).as_str()) => {
                None
            }
            _ => unauthorized(),
        }
    }

    fn route(
        &mut self,
        host: &HostDescription,
        request: &RequestEnvelope,
        body: &Value,
    ) -> (u16, Option<Value>) {
        let database = request.database.clone().unwrap_or_else(|| "_system".to_string());
        let segments: Vec<&str> = request.path.trim_start_matches('/').split('/').collect();

        match (request.method, segments.as_slice()) {
            (Method::Get, ["_api", "version"]) => (
                200,
                Some(json!({"server": "arango", "version": "3.11.0", "license": "community"})),
            ),
            (Method::Get, ["_api", "database", "current"]) => {
                if self.databases.contains(&database) {
                    (
                        200,
                        Some(json!({"error": false, "code": 200, "result": {
                            "name": database,
                            "id": "1",
                            "path": "/var/lib/arangodb3/databases/database-1",
                            "isSystem": database == "_system",
                        }})),
                    )
                } else {
                    not_found(error_codes::ARANGO_DATABASE_NOT_FOUND, "database not found")
                }
            }
            (Method::Get, ["_api", "cluster", "endpoints"]) => match &self.endpoints {
                Some(endpoints) => {
                    let list: Vec<Value> =
                        endpoints.iter().map(|e| json!({"endpoint": e})).collect();
                    (200, Some(json!({"error": false, "code": 200, "endpoints": list})))
                }
                None => (
                    501,
                    Some(error_body(501, 9, "this operation is only valid on a coordinator")),
                ),
            },
            (Method::Post, ["_api", "cursor"]) => self.create_cursor(host, body),
            (Method::Post, ["_api", "cursor", id]) | (Method::Put, ["_api", "cursor", id]) => {
                self.next_batch(host, id)
            }
            (Method::Delete, ["_api", "cursor", id]) => {
                if self.cursors.get(*id).is_some_and(|c| c.host == *host) {
                    self.cursors.remove(*id);
                    (202, Some(json!({"id": id, "error": false, "code": 202})))
                } else {
                    not_found(error_codes::CURSOR_NOT_FOUND, "cursor not found")
                }
            }
            (Method::Post, ["_api", "transaction", "begin"]) => {
                let id = self.next_id();
                self.transactions.insert(
                    id.clone(),
                    ServerTransaction {
                        host: host.clone(),
                        status: "running",
                    },
                );
                (201, Some(json!({"result": {"id": id, "status": "running"}})))
            }
            (Method::Get, ["_api", "transaction"]) => {
                let list: Vec<Value> = self
                    .transactions
                    .iter()
                    .filter(|(_, t)| t.status == "running")
                    .map(|(id, t)| json!({"id": id, "state": t.status}))
                    .collect();
                (200, Some(json!({"transactions": list})))
            }
            (method, ["_api", "transaction", id]) => {
                let transaction = match self.transactions.get_mut(*id) {
                    Some(t) if t.host == *host => t,
                    _ => {
                        return not_found(
                            error_codes::TRANSACTION_NOT_FOUND,
                            "transaction not found",
                        )
                    }
                };
                match method {
                    Method::Put if transaction.status == "running" => {
                        transaction.status = "committed"
                    }
                    Method::Delete if transaction.status == "running" => {
                        transaction.status = "aborted"
                    }
                    Method::Get => {}
                    _ => {
                        return (
                            409,
                            Some(error_body(409, 1652, "transaction already finished")),
                        )
                    }
                }
                (200, Some(json!({"result": {"id": id, "status": transaction.status}})))
            }
            (Method::Get, ["_api", "document", collection, key]) => {
                match self.documents.get(&format!("{}/{}", collection, key)) {
                    Some(document) => (200, Some(document.clone())),
                    None => not_found(error_codes::ARANGO_DOCUMENT_NOT_FOUND, "document not found"),
                }
            }
            (Method::Get, ["_test", "plain-error"]) => (503, None),
            (Method::Get, ["_test", "error-in-200"]) => {
                (200, Some(error_body(200, error_codes::FAILED, "reported as success")))
            }
            _ => not_found(error_codes::HTTP_NOT_FOUND, "unknown path"),
        }
    }

    fn create_cursor(&mut self, host: &HostDescription, body: &Value) -> (u16, Option<Value>) {
        if body["query"].as_str().is_some_and(|q| q.contains("SYNTAX ERROR")) {
            return (
                400,
                Some(error_body(400, error_codes::QUERY_PARSE, "syntax error, unexpected")),
            );
        }
        let batch_size = body["batchSize"].as_u64().unwrap_or(1000).max(1) as usize;
        let mut rows: VecDeque<Value> = self.rows.iter().cloned().collect();
        let total = rows.len();
        let first: Vec<Value> = rows.drain(..batch_size.min(total)).collect();
        let has_more = !rows.is_empty();

        let mut response = json!({
            "error": false,
            "code": 201,
            "result": first,
            "hasMore": has_more,
            "cached": false,
            "extra": {"stats": {"scannedFull": total}},
        });
        if body["count"] == json!(true) {
            response["count"] = json!(total);
        }
        if has_more {
            let id = self.next_id();
            response["id"] = json!(id);
            self.cursors.insert(
                id,
                ServerCursor {
                    host: host.clone(),
                    rows,
                    batch_size,
                },
            );
        }
        (201, Some(response))
    }

    fn next_batch(&mut self, host: &HostDescription, id: &str) -> (u16, Option<Value>) {
        let cursor = match self.cursors.get_mut(id) {
            Some(cursor) if cursor.host == *host => cursor,
            _ => return not_found(error_codes::CURSOR_NOT_FOUND, "cursor not found"),
        };
        let take = cursor.batch_size.min(cursor.rows.len());
        let batch: Vec<Value> = cursor.rows.drain(..take).collect();
        let has_more = !cursor.rows.is_empty();
        if !has_more {
            self.cursors.remove(id);
        }
        (
            200,
            Some(json!({
                "error": false,
                "code": 200,
                "id": id,
                "result": batch,
                "hasMore": has_more,
                "cached": false,
            })),
        )
    }
}

fn not_found(code: i64, message: &str) -> (u16, Option<Value>) {
    (404, Some(error_body(404, code, message)))
}

struct InFlight(Arc<AtomicUsize>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub(crate) struct MockConnection {
    host: HostDescription,
    coordinator: MockCoordinator,
    broken: AtomicBool,
    closed: Arc<AtomicUsize>,
}

#[async_trait]
impl Connection for MockConnection {
    async fn execute(&self, request: &RequestEnvelope) -> Result<Response> {
        if self.broken.load(Ordering::SeqCst) {
            return Err(Error::Connection("connection already failed".to_string()));
        }
        if self.coordinator.is_down(&self.host) {
            self.broken.store(true, Ordering::SeqCst);
            return Err(Error::Connection(format!("connection to {} reset", self.host)));
        }

        let now = self.coordinator.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.coordinator.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlight(self.coordinator.in_flight.clone());

        if let Some(latency) = self.coordinator.latency() {
            tokio::time::sleep(latency).await;
        } else {
            tokio::task::yield_now().await;
        }
        Ok(self.coordinator.handle(&self.host, request))
    }

    async fn close(&self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }

    fn is_broken(&self) -> bool {
        self.broken.load(Ordering::SeqCst)
    }

    fn host(&self) -> &HostDescription {
        &self.host
    }
}

pub(crate) struct MockFactory {
    coordinator: MockCoordinator,
    opened: AtomicUsize,
    closed: Arc<AtomicUsize>,
}

pub(crate) fn factory(coordinator: MockCoordinator) -> MockFactory {
    MockFactory {
        coordinator,
        opened: AtomicUsize::new(0),
        closed: Arc::new(AtomicUsize::new(0)),
    }
}

impl MockFactory {
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn refuse(&self, host: &HostDescription) {
        self.coordinator.take_down(host);
    }
}

#[async_trait]
impl ConnectionFactory for MockFactory {
    async fn open(&self, host: &HostDescription) -> Result<Box<dyn Connection>> {
        if self.coordinator.is_down(host) {
            return Err(Error::Connection(format!("connection to {} refused", host)));
        }
        if self.coordinator.take_open_rejection() {
            return Err(Error::Authentication(format!(
                "authentication at {} rejected with status 401",
                host
            )));
        }
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockConnection {
            host: host.clone(),
            coordinator: self.coordinator.clone(),
            broken: AtomicBool::new(false),
            closed: self.closed.clone(),
        }))
    }
}
