//! Request execution
//!
//! The [`Executor`] is the one shared session of a client: configuration,
//! codec, authenticator, connection pool and host resolver. Every request
//! goes through it:
//!
//! 1. encode the body and pick a host (the pin, or the resolver's choice)
//! 2. log in if JWT is configured and no usable token is cached
//! 3. lease a connection, attach `authorization`, send
//! 4. on 401 discard the connection, re-authenticate and retry up to
//!    `auth_retries` times
//! 5. turn the response into a typed value or an [`Error`]
//!
//! The whole step runs under the configured per-request timeout.

use crate::codec::Codec;
use crate::config::{ConnectionConfig, HostDescription};
use crate::connection::auth::{Authenticator, LoginTarget};
use crate::connection::message::{Request, RequestEnvelope, Response};
use crate::connection::pool::ConnectionPool;
use crate::connection::resolver::HostResolver;
use crate::connection::ConnectionFactory;
use crate::error::{Error, Result};
use serde::de::{DeserializeOwned, IgnoredAny};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

/// Host used by the first step of a multi-step exchange
///
/// Cursors and stream transactions live on one coordinator; every later
/// step must be sent with this handle.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HostHandle(HostDescription);

impl HostHandle {
    pub fn new(host: HostDescription) -> Self {
        Self(host)
    }

    pub fn host(&self) -> &HostDescription {
        &self.0
    }
}

/// Extract a server error from a decoded body, if it is an error envelope
pub fn error_from_envelope(status: u16, body: &Value) -> Option<Error> {
    let envelope = body.as_object()?;
    if envelope.get("error").and_then(Value::as_bool) != Some(true) {
        return None;
    }
    Some(Error::Server {
        status: envelope
            .get("code")
            .and_then(Value::as_u64)
            .and_then(|c| u16::try_from(c).ok())
            .unwrap_or(status),
        code: envelope.get("errorNum").and_then(Value::as_i64).unwrap_or(0),
        message: envelope
            .get("errorMessage")
            .and_then(Value::as_str)
            .unwrap_or("unknown error")
            .to_string(),
    })
}

fn status_error(status: u16) -> Error {
    Error::Server {
        status,
        code: 0,
        message: format!("unexpected HTTP status {}", status),
    }
}

/// Typed body of a response, or the error it carries
pub fn decode_response<T: DeserializeOwned>(codec: Codec, response: &Response) -> Result<T> {
    if response.body.is_empty() {
        if !response.is_success() {
            return Err(status_error(response.status));
        }
        return serde_json::from_value(Value::Null)
            .map_err(|e| Error::Protocol(format!("empty response body: {}", e)));
    }

    let value = match codec.decode_value(&response.body) {
        Ok(value) => value,
        Err(_) if !response.is_success() => return Err(status_error(response.status)),
        Err(e) => return Err(e),
    };
    if let Some(err) = error_from_envelope(response.status, &value) {
        return Err(err);
    }
    if !response.is_success() {
        return Err(status_error(response.status));
    }
    serde_json::from_value(value)
        .map_err(|e| Error::Protocol(format!("unexpected response shape: {}", e)))
}

/// `{ "result": ... }` wrapper used by many endpoints
#[derive(Debug, Deserialize)]
pub struct Wrapped<T> {
    pub result: T,
}

pub struct Executor {
    config: Arc<ConnectionConfig>,
    codec: Codec,
    authenticator: Arc<Authenticator>,
    factory: Arc<dyn ConnectionFactory>,
    pool: ConnectionPool,
    resolver: HostResolver,
}

impl Executor {
    pub fn new(
        config: Arc<ConnectionConfig>,
        factory: Arc<dyn ConnectionFactory>,
        authenticator: Arc<Authenticator>,
    ) -> Self {
        Self {
            codec: Codec::for_content_type(config.content_type),
            pool: ConnectionPool::new(&config, factory.clone()),
            resolver: HostResolver::new(
                config.hosts.clone(),
                config.load_balancing,
                config.failover_threshold,
            ),
            authenticator,
            factory,
            config,
        }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn codec(&self) -> Codec {
        self.codec
    }

    pub fn authenticator(&self) -> &Authenticator {
        &self.authenticator
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub fn resolver(&self) -> &HostResolver {
        &self.resolver
    }

    /// Send `request` to the resolver's host and decode the result
    pub async fn execute<T: DeserializeOwned + Send>(&self, request: Request) -> Result<T> {
        self.execute_pinned(request, None).await.map(|(value, _)| value)
    }

    /// Send `request` to `pin` (or the resolver's host) and return the
    /// decoded result with the host actually used
    pub async fn execute_pinned<T: DeserializeOwned + Send>(
        &self,
        request: Request,
        pin: Option<&HostHandle>,
    ) -> Result<(T, HostHandle)> {
        self.dispatch(request, pin, decode_response::<T>).await
    }

    /// Like [`execute_pinned`](Self::execute_pinned), discarding the body
    pub async fn execute_void(
        &self,
        request: Request,
        pin: Option<&HostHandle>,
    ) -> Result<HostHandle> {
        self.dispatch(request, pin, |codec, response| {
            if response.is_success() {
                if response.body.is_empty() {
                    return Ok(());
                }
                if let Ok(value) = codec.decode_value(&response.body) {
                    if let Some(err) = error_from_envelope(response.status, &value) {
                        return Err(err);
                    }
                }
                return Ok(());
            }
            decode_response::<IgnoredAny>(codec, response).map(|_| ())
        })
        .await
        .map(|((), host)| host)
    }

    async fn dispatch<T, F>(
        &self,
        request: Request,
        pin: Option<&HostHandle>,
        decode: F,
    ) -> Result<(T, HostHandle)>
    where
        F: Fn(Codec, &Response) -> Result<T> + Send + Sync,
        T: Send,
    {
        let envelope = RequestEnvelope::encode(&request, self.codec)?;
        let host = match pin {
            Some(handle) => handle.host().clone(),
            None => self
                .resolver
                .select()
                .ok_or_else(|| Error::Config("no hosts configured".to_string()))?,
        };
        let pinned = pin.is_some();

        let deadline = self.config.timeout;
        match tokio::time::timeout(deadline, self.send(&envelope, &host, pinned, &decode)).await {
            Ok(result) => result.map(|value| (value, HostHandle::new(host))),
            Err(_) => {
                warn!(host = %host, path = %envelope.path, timeout = ?deadline, "Request timed out");
                if !pinned {
                    self.resolver.report_failure(&host);
                }
                Err(Error::Timeout(deadline))
            }
        }
    }

    fn login_target<'a>(&'a self, host: &'a HostDescription) -> LoginTarget<'a> {
        LoginTarget {
            factory: self.factory.as_ref(),
            codec: self.codec,
            host,
        }
    }

    #[instrument(skip(self, envelope, decode), fields(host = %host, method = %envelope.method, path = %envelope.path))]
    async fn send<T, F>(
        &self,
        envelope: &RequestEnvelope,
        host: &HostDescription,
        pinned: bool,
        decode: &F,
    ) -> Result<T>
    where
        F: Fn(Codec, &Response) -> Result<T> + Send + Sync,
        T: Send,
    {
        let mut rejections = 0;
        loop {
            self.authenticator
                .ensure_authenticated(&self.login_target(host))
                .await?;

            let mut attempt = envelope.clone();
            let token = self.authenticator.token();
            if let Some(authorization) = self.authenticator.authorization_header() {
                attempt.set_header("authorization", authorization);
            }

            let lease = match self.pool.lease(host).await {
                Ok(lease) => lease,
                // credentials refused while opening the connection (VST)
                Err(Error::Authentication(message)) => {
                    if rejections >= self.config.auth_retries {
                        return Err(Error::Authentication(message));
                    }
                    rejections += 1;
                    warn!(attempt = rejections, error = %message, "Connection authentication rejected, re-authenticating");
                    self.authenticator
                        .reauthenticate(&self.login_target(host), token.as_deref())
                        .await?;
                    continue;
                }
                Err(e) => {
                    if !pinned {
                        self.resolver.report_failure(host);
                    }
                    return Err(e);
                }
            };

            let response = match lease.connection().execute(&attempt).await {
                Ok(response) => response,
                Err(e) => {
                    lease.discard().await;
                    if !pinned {
                        self.resolver.report_failure(host);
                    }
                    return Err(e);
                }
            };

            if response.status == 401 {
                lease.discard().await;
                if rejections >= self.config.auth_retries {
                    return Err(Error::Authentication(format!(
                        "{} {} rejected with status 401 after {} re-authentication attempt(s)",
                        envelope.method, envelope.path, rejections
                    )));
                }
                rejections += 1;
                warn!(attempt = rejections, "Request rejected with 401, re-authenticating");
                self.authenticator
                    .reauthenticate(&self.login_target(host), token.as_deref())
                    .await?;
                continue;
            }

            debug!(status = response.status, "Request completed");
            let outcome = decode(self.codec, &response);
            match &outcome {
                Err(e) if e.poisons_connection() => lease.discard().await,
                _ => lease.release(),
            }
            self.resolver.report_success(host);
            return outcome;
        }
    }

    /// Add coordinators announced by `/_api/cluster/endpoints`
    pub async fn refresh_hosts(&self) -> Result<usize> {
        #[derive(Deserialize)]
        struct Endpoint {
            endpoint: String,
        }
        #[derive(Deserialize)]
        struct Endpoints {
            endpoints: Vec<Endpoint>,
        }

        let Endpoints { endpoints } = self
            .execute(Request::get("/_api/cluster/endpoints").database("_system"))
            .await?;
        let hosts = endpoints
            .iter()
            .map(|e| HostDescription::from_endpoint(&e.endpoint))
            .collect::<Result<Vec<_>>>()?;
        Ok(self.resolver.add_hosts(hosts))
    }

    /// Close every pooled connection; later requests fail
    pub async fn shutdown(&self) {
        self.pool.close_all().await;
    }
}
