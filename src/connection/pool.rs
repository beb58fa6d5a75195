//! Per-host connection pool
//!
//! Each host gets a semaphore with `max_connections` permits and a stack of
//! idle connections. A [`Lease`] holds one permit for its whole lifetime,
//! so at most `max_connections` connections to a host exist at any time
//! and further callers wait instead of opening more.

use super::{Connection, ConnectionFactory};
use crate::config::{ConnectionConfig, HostDescription};
use crate::error::{Error, Result};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::{debug, instrument, trace};

struct IdleConnection {
    connection: Box<dyn Connection>,
    idle_since: Instant,
}

struct HostPool {
    host: HostDescription,
    permits: Arc<Semaphore>,
    idle: Mutex<Vec<IdleConnection>>,
    opened: AtomicU64,
}

impl HostPool {
    fn new(host: HostDescription, max_connections: usize) -> Self {
        Self {
            host,
            permits: Arc::new(Semaphore::new(max_connections)),
            idle: Mutex::new(Vec::new()),
            opened: AtomicU64::new(0),
        }
    }

    /// Pop the most recently used live connection; expired or broken ones
    /// are returned separately for closing
    fn take_idle(&self, ttl: Duration) -> (Option<Box<dyn Connection>>, Vec<Box<dyn Connection>>) {
        let mut idle = self.idle.lock();
        let (stale, fresh): (Vec<_>, Vec<_>) = idle
            .drain(..)
            .partition(|c| c.idle_since.elapsed() >= ttl || c.connection.is_broken());
        *idle = fresh;
        let reusable = idle.pop().map(|c| c.connection);
        (reusable, stale.into_iter().map(|c| c.connection).collect())
    }
}

/// Pool statistics for one host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub idle: usize,
    pub leased: usize,
    pub opened: u64,
}

pub struct ConnectionPool {
    factory: Arc<dyn ConnectionFactory>,
    max_connections: usize,
    ttl: Duration,
    hosts: DashMap<HostDescription, Arc<HostPool>>,
    closed: AtomicBool,
}

impl ConnectionPool {
    pub fn new(config: &ConnectionConfig, factory: Arc<dyn ConnectionFactory>) -> Self {
        Self {
            factory,
            max_connections: config.max_connections,
            ttl: config.connection_ttl,
            hosts: DashMap::new(),
            closed: AtomicBool::new(false),
        }
    }

    fn host_pool(&self, host: &HostDescription) -> Arc<HostPool> {
        self.hosts
            .entry(host.clone())
            .or_insert_with(|| Arc::new(HostPool::new(host.clone(), self.max_connections)))
            .clone()
    }

    /// Obtain exclusive use of a connection to `host`
    ///
    /// Waits while `max_connections` leases are outstanding. Reuses an idle
    /// connection when one is live, otherwise opens a new one.
    #[instrument(skip(self), fields(host = %host))]
    pub async fn lease(&self, host: &HostDescription) -> Result<Lease> {
        let closed = || Error::Connection(format!("connection pool for {} is closed", host));
        if self.closed.load(Ordering::Acquire) {
            return Err(closed());
        }
        let pool = self.host_pool(host);
        let permit = pool.permits.clone().acquire_owned().await.map_err(|_| closed())?;
        // a host pool created while close_all was running
        if self.closed.load(Ordering::Acquire) {
            pool.permits.close();
            return Err(closed());
        }

        let (reusable, stale) = pool.take_idle(self.ttl);
        for connection in stale {
            debug!("Discarding stale pooled connection");
            connection.close().await;
        }

        let connection = match reusable {
            Some(connection) => {
                trace!("Reusing pooled connection");
                connection
            }
            None => {
                let connection = self.factory.open(host).await?;
                pool.opened.fetch_add(1, Ordering::Relaxed);
                debug!(opened = pool.opened.load(Ordering::Relaxed), "Opened pooled connection");
                connection
            }
        };

        Ok(Lease {
            connection: Some(connection),
            pool,
            _permit: permit,
        })
    }

    pub fn stats(&self, host: &HostDescription) -> PoolStats {
        match self.hosts.get(host) {
            Some(pool) => PoolStats {
                idle: pool.idle.lock().len(),
                leased: self.max_connections - pool.permits.available_permits(),
                opened: pool.opened.load(Ordering::Relaxed),
            },
            None => PoolStats {
                idle: 0,
                leased: 0,
                opened: 0,
            },
        }
    }

    /// Close every idle connection and refuse further leases
    pub async fn close_all(&self) {
        self.closed.store(true, Ordering::Release);
        let pools: Vec<Arc<HostPool>> = self.hosts.iter().map(|e| e.value().clone()).collect();
        for pool in pools {
            pool.permits.close();
            let idle: Vec<IdleConnection> = pool.idle.lock().drain(..).collect();
            for entry in idle {
                entry.connection.close().await;
            }
            debug!(host = %pool.host, "Closed connection pool");
        }
    }
}

/// Exclusive use of one pooled connection
///
/// Must end with [`release`](Lease::release) or [`discard`](Lease::discard).
/// A lease dropped without either (a cancelled request) discards its
/// connection, since a response may still be in flight on it.
pub struct Lease {
    connection: Option<Box<dyn Connection>>,
    pool: Arc<HostPool>,
    _permit: OwnedSemaphorePermit,
}

impl Lease {
    pub fn connection(&self) -> &dyn Connection {
        match &self.connection {
            Some(connection) => connection.as_ref(),
            None => unreachable!("lease used after release"),
        }
    }

    pub fn host(&self) -> &HostDescription {
        &self.pool.host
    }

    /// Return the connection for reuse
    pub fn release(mut self) {
        if let Some(connection) = self.connection.take() {
            if connection.is_broken() {
                debug!(host = %self.pool.host, "Dropping broken connection on release");
                return;
            }
            self.pool.idle.lock().push(IdleConnection {
                connection,
                idle_since: Instant::now(),
            });
        }
    }

    /// Close the connection instead of returning it
    pub async fn discard(mut self) {
        if let Some(connection) = self.connection.take() {
            debug!(host = %self.pool.host, "Discarding connection");
            connection.close().await;
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if self.connection.take().is_some() {
            debug!(host = %self.pool.host, "Lease dropped without release, connection discarded");
        }
    }
}
