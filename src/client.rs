//! Client entry point

use crate::config::ConnectionConfig;
use crate::connection::auth::Authenticator;
use crate::connection::{self, ConnectionFactory};
use crate::database::{Database, ServerVersion};
use crate::error::Result;
use crate::executor::Executor;
use std::sync::Arc;
use tracing::info;

pub const SYSTEM_DATABASE: &str = "_system";

/// Asynchronous client for a set of coordinators
///
/// Cloning is cheap; clones share pool, resolver and credentials.
#[derive(Clone)]
pub struct ArangoClient {
    executor: Arc<Executor>,
}

impl ArangoClient {
    /// Validate `config` and build the transport stack it describes
    pub fn new(config: ConnectionConfig) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let authenticator = Arc::new(Authenticator::new(config.authentication.clone()));
        let factory = connection::factory_for(config.clone(), authenticator.clone());
        Ok(Self::assemble(config, factory, authenticator))
    }

    /// Build a client over a custom transport
    pub fn with_factory(config: ConnectionConfig, factory: Arc<dyn ConnectionFactory>) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let authenticator = Arc::new(Authenticator::new(config.authentication.clone()));
        Ok(Self::assemble(config, factory, authenticator))
    }

    fn assemble(
        config: Arc<ConnectionConfig>,
        factory: Arc<dyn ConnectionFactory>,
        authenticator: Arc<Authenticator>,
    ) -> Self {
        info!(
            hosts = config.hosts.len(),
            protocol = ?config.protocol,
            content_type = ?config.content_type,
            max_connections = config.max_connections,
            "Created client"
        );
        Self {
            executor: Arc::new(Executor::new(config, factory, authenticator)),
        }
    }

    pub fn db(&self, name: impl Into<String>) -> Database {
        Database::new(self.executor.clone(), name)
    }

    pub fn system(&self) -> Database {
        self.db(SYSTEM_DATABASE)
    }

    pub fn executor(&self) -> &Arc<Executor> {
        &self.executor
    }

    pub async fn version(&self) -> Result<ServerVersion> {
        self.system().version().await
    }

    /// Merge cluster endpoints into the known hosts; returns how many were new
    pub async fn refresh_hosts(&self) -> Result<usize> {
        self.executor.refresh_hosts().await
    }

    pub async fn shutdown(&self) {
        self.executor.shutdown().await;
        info!("Client shut down");
    }
}
