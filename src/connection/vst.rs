//! VelocyStream 1.1 transport
//!
//! One socket per [`VstConnection`]. Requests are tagged with a
//! monotonically increasing message id; a background reader task
//! reassembles response chunks and hands each message to the waiter
//! registered under its id.

use super::auth::{Authenticator, Credentials};
use super::chunk::{self, MessageAssembler, VST_HANDSHAKE};
use super::message::{MessageKind, RequestEnvelope, Response, MESSAGE_VERSION};
use super::{Connection, ConnectionFactory};
use crate::config::{ConnectionConfig, HostDescription};
use crate::error::{Error, Result};
use crate::velocypack;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use rustls::pki_types::ServerName;
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, instrument, trace, warn};

/// Plain TCP or TLS stream
pub trait VstStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> VstStream for T {}

type BoxedStream = Box<dyn VstStream>;
type Waiters = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Bytes>>>>>;

/// Encode the request header array followed by the body
pub fn encode_request(request: &RequestEnvelope) -> Result<Vec<u8>> {
    let params: Map<String, Value> = request
        .query
        .iter()
        .map(|(k, v)| (k.clone(), Value::String(v.clone())))
        .collect();
    let meta: Map<String, Value> = request
        .headers
        .iter()
        .map(|(k, v)| (k.clone(), Value::String(v.clone())))
        .collect();
    let header = json!([
        MESSAGE_VERSION,
        MessageKind::Request.code(),
        request.database.as_deref().unwrap_or("_system"),
        request.method.vst_code(),
        request.path,
        params,
        meta,
    ]);

    let mut message = velocypack::to_vec(&header)?;
    message.extend_from_slice(&request.body);
    Ok(message)
}

/// Authentication message for the given credentials
pub fn encode_authentication(credentials: &Credentials) -> Result<Vec<u8>> {
    let header = match credentials {
        Credentials::Basic { user, password } => json!([
            MESSAGE_VERSION,
            MessageKind::Authentication.code(),
            "plain",
            user,
            password
        ]),
        Credentials::Jwt(token) => json!([
            MESSAGE_VERSION,
            MessageKind::Authentication.code(),
            "jwt",
            token
        ]),
    };
    Ok(velocypack::to_vec(&header)?)
}

/// Split a response message into status, meta headers and body
pub fn decode_response(message: Bytes) -> Result<Response> {
    let (header, size) = velocypack::read_value(&message)?;
    let fields = header
        .as_array()
        .ok_or_else(|| Error::Protocol("VST response header is not an array".to_string()))?;

    let kind = fields.get(1).and_then(Value::as_i64);
    if kind != Some(MessageKind::Response.code()) {
        return Err(Error::Protocol(format!(
            "expected VST response message, got type {:?}",
            kind
        )));
    }
    let status = fields
        .get(2)
        .and_then(Value::as_u64)
        .and_then(|s| u16::try_from(s).ok())
        .ok_or_else(|| Error::Protocol("VST response without status code".to_string()))?;

    let mut headers = BTreeMap::new();
    if let Some(meta) = fields.get(3).and_then(Value::as_object) {
        for (name, value) in meta {
            let value = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            headers.insert(name.to_ascii_lowercase(), value);
        }
    }

    Ok(Response {
        status,
        headers,
        body: message.slice(size..),
    })
}

async fn connect(host: &HostDescription, config: &ConnectionConfig) -> Result<BoxedStream> {
    let tcp = tokio::time::timeout(
        config.timeout,
        TcpStream::connect((host.host.as_str(), host.port)),
    )
    .await
    .map_err(|_| Error::Connection(format!("connect to {} timed out", host)))??;
    tcp.set_nodelay(true)?;

    if !config.use_ssl {
        return Ok(Box::new(tcp));
    }

    let tls = config.ssl_context.clone().ok_or_else(|| {
        Error::Connection(format!(
            "TLS requested for {} but no ssl_context is configured",
            host
        ))
    })?;
    let name = ServerName::try_from(host.host.clone())
        .map_err(|e| Error::Connection(format!("invalid TLS server name '{}': {}", host.host, e)))?;
    let stream = tokio_rustls::TlsConnector::from(tls)
        .connect(name, tcp)
        .await?;
    Ok(Box::new(stream))
}

pub struct VstConnection {
    host: HostDescription,
    chunk_size: usize,
    writer: tokio::sync::Mutex<WriteHalf<BoxedStream>>,
    waiters: Waiters,
    next_id: AtomicU64,
    broken: Arc<AtomicBool>,
    reader: JoinHandle<()>,
}

impl VstConnection {
    /// Connect, send the protocol preamble and authenticate if credentials
    /// are available
    pub async fn open(
        host: &HostDescription,
        config: &ConnectionConfig,
        credentials: Option<Credentials>,
    ) -> Result<Self> {
        let stream = connect(host, config).await?;
        Self::handshake(host.clone(), stream, config.chunk_size, credentials).await
    }

    /// Run the protocol over an already established stream
    pub async fn handshake(
        host: HostDescription,
        stream: BoxedStream,
        chunk_size: usize,
        credentials: Option<Credentials>,
    ) -> Result<Self> {
        let (read_half, mut write_half) = tokio::io::split(stream);
        write_half.write_all(VST_HANDSHAKE).await?;
        write_half.flush().await?;

        let waiters: Waiters = Arc::new(Mutex::new(HashMap::new()));
        let broken = Arc::new(AtomicBool::new(false));
        let reader = tokio::spawn(read_loop(
            read_half,
            waiters.clone(),
            broken.clone(),
            host.clone(),
        ));

        let connection = Self {
            host,
            chunk_size,
            writer: tokio::sync::Mutex::new(write_half),
            waiters,
            next_id: AtomicU64::new(1),
            broken,
            reader,
        };

        if let Some(credentials) = credentials {
            connection.authenticate(&credentials).await?;
        }

        debug!(host = %connection.host, "Opened VST connection");
        Ok(connection)
    }

    async fn authenticate(&self, credentials: &Credentials) -> Result<()> {
        let reply = self.send_message(encode_authentication(credentials)?).await?;
        let response = decode_response(reply)?;
        if !response.is_success() {
            self.broken.store(true, Ordering::SeqCst);
            return Err(Error::Authentication(format!(
                "VST authentication at {} rejected with status {}",
                self.host, response.status
            )));
        }
        trace!(host = %self.host, "VST authentication accepted");
        Ok(())
    }

    async fn send_message(&self, message: Vec<u8>) -> Result<Bytes> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().insert(id, tx);

        // the reader marks the connection broken before failing waiters
        if self.broken.load(Ordering::SeqCst) {
            self.waiters.lock().remove(&id);
            return Err(Error::Connection(format!(
                "VST connection to {} is broken",
                self.host
            )));
        }

        {
            let mut writer = self.writer.lock().await;
            if let Err(e) = chunk::write_message(&mut *writer, id, &message, self.chunk_size).await
            {
                self.waiters.lock().remove(&id);
                self.broken.store(true, Ordering::SeqCst);
                return Err(e);
            }
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(Error::Connection(format!(
                "VST connection to {} closed while awaiting message {}",
                self.host, id
            ))),
        }
    }
}

async fn read_loop(
    mut reader: ReadHalf<BoxedStream>,
    waiters: Waiters,
    broken: Arc<AtomicBool>,
    host: HostDescription,
) {
    let mut assembler = MessageAssembler::new();
    let failure = loop {
        let chunk = match chunk::read_chunk(&mut reader).await {
            Ok(chunk) => chunk,
            Err(e) => break e,
        };
        match assembler.push(chunk) {
            Ok(Some((id, message))) => {
                let waiter = waiters.lock().remove(&id);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(Ok(message));
                    }
                    None => warn!(host = %host, message_id = id, "VST response for unknown message"),
                }
            }
            Ok(None) => {}
            Err(e) => break e,
        }
    };

    broken.store(true, Ordering::SeqCst);
    debug!(host = %host, error = %failure, "VST reader stopped");

    let pending: Vec<_> = waiters.lock().drain().collect();
    for (_, tx) in pending {
        let err = match &failure {
            Error::Protocol(msg) => Error::Protocol(msg.clone()),
            other => Error::Connection(other.to_string()),
        };
        let _ = tx.send(Err(err));
    }
}

#[async_trait]
impl Connection for VstConnection {
    #[instrument(skip(self, request), fields(host = %self.host, method = %request.method, path = %request.path))]
    async fn execute(&self, request: &RequestEnvelope) -> Result<Response> {
        let reply = self.send_message(encode_request(request)?).await?;
        let response = decode_response(reply)?;
        trace!(status = response.status, bytes = response.body.len(), "VST response");
        Ok(response)
    }

    async fn close(&self) {
        self.broken.store(true, Ordering::SeqCst);
        self.reader.abort();
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
        debug!(host = %self.host, "Closed VST connection");
    }

    fn is_broken(&self) -> bool {
        self.broken.load(Ordering::SeqCst)
    }

    fn host(&self) -> &HostDescription {
        &self.host
    }
}

impl Drop for VstConnection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

pub struct VstConnectionFactory {
    config: Arc<ConnectionConfig>,
    authenticator: Arc<Authenticator>,
}

impl VstConnectionFactory {
    pub fn new(config: Arc<ConnectionConfig>, authenticator: Arc<Authenticator>) -> Self {
        Self {
            config,
            authenticator,
        }
    }
}

#[async_trait]
impl ConnectionFactory for VstConnectionFactory {
    async fn open(&self, host: &HostDescription) -> Result<Box<dyn Connection>> {
        let credentials = self.authenticator.credentials();
        Ok(Box::new(
            VstConnection::open(host, &self.config, credentials).await?,
        ))
    }
}
