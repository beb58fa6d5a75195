//! AQL query cursors
//!
//! A [`Cursor`] walks a server-side result set batch by batch. The first
//! request may go to any coordinator; every later step is pinned to the
//! coordinator that created the cursor.
//!
//! ```text
//! Created ──open──▶ HasMore ──next──▶ HasMore | Exhausted
//!                      │                  │
//!                      └──────close───────┴──▶ Closed
//! ```
//!
//! Any failed step leaves the cursor `Closed`.

use crate::connection::message::Request;
use crate::error::{Error, Result};
use crate::error_codes;
use crate::executor::{Executor, HostHandle};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, instrument};

pub const CURSOR_PATH: &str = "/_api/cursor";

/// AQL query with bind parameters and cursor options
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AqlQuery {
    pub query: String,
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub bind_vars: Map<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<bool>,
    /// Server-side cursor lifetime in seconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_limit: Option<u64>,
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub options: Map<String, Value>,
}

impl AqlQuery {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Default::default()
        }
    }

    pub fn bind(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.bind_vars.insert(name.into(), value.into());
        self
    }

    pub fn batch_size(mut self, size: u32) -> Self {
        self.batch_size = Some(size);
        self
    }

    /// Ask the server for the total result count
    pub fn count(mut self, count: bool) -> Self {
        self.count = Some(count);
        self
    }

    pub fn ttl(mut self, seconds: u64) -> Self {
        self.ttl = Some(seconds);
        self
    }

    pub fn option(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.options.insert(name.into(), value.into());
        self
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CursorBatch<T> {
    #[serde(default)]
    id: Option<String>,
    #[serde(default = "Vec::new")]
    result: Vec<T>,
    #[serde(default)]
    has_more: bool,
    #[serde(default)]
    count: Option<u64>,
    #[serde(default)]
    extra: Option<Value>,
    #[serde(default)]
    cached: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorState {
    Created,
    HasMore,
    Exhausted,
    Closed,
}

/// Server-side result set, read batch by batch
pub struct Cursor<T> {
    executor: Arc<Executor>,
    database: String,
    id: Option<String>,
    batch: Vec<T>,
    state: CursorState,
    host: HostHandle,
    count: Option<u64>,
    extra: Option<Value>,
    cached: bool,
}

impl<T: DeserializeOwned + Send> Cursor<T> {
    /// Run `query` and read the first batch
    #[instrument(skip(executor, query), fields(database = %database))]
    pub(crate) async fn open(
        executor: Arc<Executor>,
        database: &str,
        query: &AqlQuery,
    ) -> Result<Self> {
        let request = Request::post(CURSOR_PATH).database(database).body(query)?;
        let (batch, host) = executor
            .execute_pinned::<CursorBatch<T>>(request, None)
            .await?;
        let mut cursor = Self::created(executor, database, host);
        cursor.apply(batch)?;
        debug!(
            cursor_id = cursor.id.as_deref().unwrap_or("-"),
            host = %cursor.host.host(),
            rows = cursor.batch.len(),
            "Opened cursor"
        );
        Ok(cursor)
    }

    /// Continue an existing cursor by id from whichever coordinator holds it
    pub(crate) async fn attach(executor: Arc<Executor>, database: &str, id: &str) -> Result<Self> {
        let request = Request::post(format!("{}/{}", CURSOR_PATH, id)).database(database);
        let (batch, host) = executor
            .execute_pinned::<CursorBatch<T>>(request, None)
            .await?;
        let mut cursor = Self::created(executor, database, host);
        cursor.id = Some(id.to_string());
        cursor.apply(batch)?;
        Ok(cursor)
    }

    fn created(executor: Arc<Executor>, database: &str, host: HostHandle) -> Self {
        Self {
            executor,
            database: database.to_string(),
            id: None,
            batch: Vec::new(),
            state: CursorState::Created,
            host,
            count: None,
            extra: None,
            cached: false,
        }
    }

    fn apply(&mut self, batch: CursorBatch<T>) -> Result<()> {
        if batch.id.is_some() {
            self.id = batch.id;
        }
        if batch.has_more && self.id.is_none() {
            self.state = CursorState::Closed;
            return Err(Error::Protocol(
                "cursor reports more results but has no id".to_string(),
            ));
        }
        self.batch = batch.result;
        if batch.count.is_some() {
            self.count = batch.count;
        }
        if batch.extra.is_some() {
            self.extra = batch.extra;
        }
        self.cached = batch.cached;
        self.state = if batch.has_more {
            CursorState::HasMore
        } else {
            CursorState::Exhausted
        };
        Ok(())
    }

    /// Fetch the next batch; only valid while [`has_more`](Self::has_more)
    #[instrument(skip(self), fields(cursor_id = ?self.id))]
    pub async fn next(&mut self) -> Result<&[T]> {
        if self.state != CursorState::HasMore {
            return Err(Error::StateViolation(format!(
                "cannot read next batch of cursor in state {:?}",
                self.state
            )));
        }
        let Some(id) = self.id.clone() else {
            self.state = CursorState::Closed;
            return Err(Error::StateViolation("cursor has no id".to_string()));
        };

        // stays Closed if this step fails or is cancelled
        self.state = CursorState::Closed;
        let request = Request::post(format!("{}/{}", CURSOR_PATH, id)).database(&self.database);
        let (batch, _) = self
            .executor
            .execute_pinned::<CursorBatch<T>>(request, Some(&self.host))
            .await?;
        self.apply(batch)?;
        debug!(rows = self.batch.len(), has_more = self.has_more(), "Fetched batch");
        Ok(&self.batch)
    }

    /// Release the server-side cursor
    ///
    /// Idempotent. No request is sent if the server never assigned an id.
    #[instrument(skip(self), fields(cursor_id = ?self.id))]
    pub async fn close(&mut self) -> Result<()> {
        if self.state == CursorState::Closed {
            return Ok(());
        }
        self.state = CursorState::Closed;
        let Some(id) = self.id.clone() else {
            return Ok(());
        };

        let request = Request::delete(format!("{}/{}", CURSOR_PATH, id)).database(&self.database);
        match self.executor.execute_void(request, Some(&self.host)).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_server_code(error_codes::CURSOR_NOT_FOUND) => {
                debug!("Cursor already released by the server");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Read every remaining batch, then close
    pub async fn collect_all(mut self) -> Result<Vec<T>> {
        let mut rows = self.take_batch();
        while self.has_more() {
            self.next().await?;
            rows.append(&mut self.batch);
        }
        self.close().await?;
        Ok(rows)
    }
}

impl<T> Cursor<T> {
    pub fn state(&self) -> CursorState {
        self.state
    }

    pub fn has_more(&self) -> bool {
        self.state == CursorState::HasMore
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    /// Coordinator holding this cursor
    pub fn host(&self) -> &HostHandle {
        &self.host
    }

    pub fn batch(&self) -> &[T] {
        &self.batch
    }

    pub fn take_batch(&mut self) -> Vec<T> {
        std::mem::take(&mut self.batch)
    }

    /// Total result count, when requested with [`AqlQuery::count`]
    pub fn count(&self) -> Option<u64> {
        self.count
    }

    pub fn extra(&self) -> Option<&Value> {
        self.extra.as_ref()
    }

    pub fn is_cached(&self) -> bool {
        self.cached
    }
}
