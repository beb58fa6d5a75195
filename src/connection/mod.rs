//! Transports, pooling and host selection
//!
//! A [`Connection`] carries one request at a time for its current lease
//! holder. Connections are produced by a [`ConnectionFactory`], kept in a
//! per-host [`ConnectionPool`](pool::ConnectionPool) and addressed through
//! the [`HostResolver`](resolver::HostResolver).

pub mod auth;
pub mod chunk;
pub mod http;
pub mod message;
pub mod pool;
pub mod resolver;
pub mod vst;

use crate::config::{ConnectionConfig, HostDescription, Protocol};
use crate::error::Result;
use async_trait::async_trait;
use auth::Authenticator;
use message::{RequestEnvelope, Response};
use std::sync::Arc;

/// Live link to one coordinator
#[async_trait]
pub trait Connection: Send + Sync {
    /// Send one request and wait for its response
    async fn execute(&self, request: &RequestEnvelope) -> Result<Response>;

    /// Release the underlying socket
    async fn close(&self);

    /// Set once the transport has failed; the pool never hands it out again
    fn is_broken(&self) -> bool {
        false
    }

    fn host(&self) -> &HostDescription;
}

/// Opens connections for the pool
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn open(&self, host: &HostDescription) -> Result<Box<dyn Connection>>;
}

/// Factory for the configured protocol
pub fn factory_for(
    config: Arc<ConnectionConfig>,
    authenticator: Arc<Authenticator>,
) -> Arc<dyn ConnectionFactory> {
    match config.protocol {
        Protocol::Http => Arc::new(http::HttpConnectionFactory::new(config)),
        Protocol::Vst => Arc::new(vst::VstConnectionFactory::new(config, authenticator)),
    }
}
