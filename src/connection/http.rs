//! HTTP/1.1 transport
//!
//! Each [`HttpConnection`] owns a `reqwest` client restricted to a single
//! idle keep-alive socket, so one pooled connection maps to one TCP (or
//! TLS) stream. Cookies set by the server are replayed when
//! `resend_cookies` is enabled.

use super::message::{Method, RequestEnvelope, Response};
use super::{Connection, ConnectionFactory};
use crate::config::{ConnectionConfig, HostDescription};
use crate::error::{Error, Result};
use async_trait::async_trait;
use reqwest::cookie::Jar;
use reqwest::header::CONTENT_LENGTH;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, instrument, trace};

pub struct HttpConnection {
    host: HostDescription,
    base_url: String,
    client: reqwest::Client,
}

impl HttpConnection {
    pub fn open(host: &HostDescription, config: &ConnectionConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .http1_only()
            .pool_max_idle_per_host(1)
            .pool_idle_timeout(config.connection_ttl)
            .connect_timeout(config.timeout)
            .tcp_nodelay(true)
            .no_proxy();

        if config.use_ssl {
            let tls = config.ssl_context.as_ref().ok_or_else(|| {
                Error::Connection(format!(
                    "TLS requested for {} but no ssl_context is configured",
                    host
                ))
            })?;
            builder = builder.use_preconfigured_tls(rustls::ClientConfig::clone(tls));
        }

        if config.resend_cookies {
            builder = builder.cookie_provider(Arc::new(Jar::default()));
        }

        let client = builder.build()?;
        let scheme = if config.use_ssl { "https" } else { "http" };

        debug!(host = %host, scheme, "Opened HTTP connection");

        Ok(Self {
            host: host.clone(),
            base_url: format!("{}://{}", scheme, host),
            client,
        })
    }

    /// Full URL for an envelope
    pub fn url(&self, request: &RequestEnvelope) -> String {
        format!("{}{}", self.base_url, request.target())
    }
}

fn http_method(method: Method) -> reqwest::Method {
    match method {
        Method::Get => reqwest::Method::GET,
        Method::Post => reqwest::Method::POST,
        Method::Put => reqwest::Method::PUT,
        Method::Patch => reqwest::Method::PATCH,
        Method::Delete => reqwest::Method::DELETE,
        Method::Head => reqwest::Method::HEAD,
        Method::Options => reqwest::Method::OPTIONS,
    }
}

#[async_trait]
impl Connection for HttpConnection {
    #[instrument(skip(self, request), fields(host = %self.host, method = %request.method, path = %request.path))]
    async fn execute(&self, request: &RequestEnvelope) -> Result<Response> {
        let mut builder = self
            .client
            .request(http_method(request.method), self.url(request))
            .header(CONTENT_LENGTH, request.body.len());
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if !request.body.is_empty() {
            builder = builder.body(request.body.clone());
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let headers: BTreeMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        let body = response.bytes().await?;

        trace!(status, bytes = body.len(), "HTTP response");

        Ok(Response {
            status,
            headers,
            body,
        })
    }

    async fn close(&self) {
        debug!(host = %self.host, "Closing HTTP connection");
    }

    fn host(&self) -> &HostDescription {
        &self.host
    }
}

pub struct HttpConnectionFactory {
    config: Arc<ConnectionConfig>,
}

impl HttpConnectionFactory {
    pub fn new(config: Arc<ConnectionConfig>) -> Self {
        Self { config }
    }
}

#[async_trait]
impl ConnectionFactory for HttpConnectionFactory {
    async fn open(&self, host: &HostDescription) -> Result<Box<dyn Connection>> {
        Ok(Box::new(HttpConnection::open(host, &self.config)?))
    }
}
