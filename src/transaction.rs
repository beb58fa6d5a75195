//! Stream transactions
//!
//! A stream transaction is begun on one coordinator and lives there until
//! it is committed or aborted. Every operation on it, and every request
//! executed inside it, is pinned to that coordinator and carries the
//! `x-arango-trx-id` header.

use crate::connection::message::Request;
use crate::error::{Error, Result};
use crate::executor::{Executor, HostHandle, Wrapped};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, instrument};

pub const TRANSACTION_PATH: &str = "/_api/transaction";
pub const TRANSACTION_HEADER: &str = "x-arango-trx-id";

#[derive(Debug, Clone, Default, Serialize)]
pub struct TransactionCollections {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub read: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub write: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub exclusive: Vec<String>,
}

/// Collections to lock and transaction limits
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamTransactionOptions {
    pub collections: TransactionCollections,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wait_for_sync: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allow_implicit: Option<bool>,
    /// Seconds to wait for collection locks
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lock_timeout: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_transaction_size: Option<u64>,
}

impl StreamTransactionOptions {
    pub fn read(mut self, collection: impl Into<String>) -> Self {
        self.collections.read.push(collection.into());
        self
    }

    pub fn write(mut self, collection: impl Into<String>) -> Self {
        self.collections.write.push(collection.into());
        self
    }

    pub fn exclusive(mut self, collection: impl Into<String>) -> Self {
        self.collections.exclusive.push(collection.into());
        self
    }

    pub fn wait_for_sync(mut self, wait: bool) -> Self {
        self.wait_for_sync = Some(wait);
        self
    }

    pub fn allow_implicit(mut self, allow: bool) -> Self {
        self.allow_implicit = Some(allow);
        self
    }

    pub fn lock_timeout(mut self, seconds: u64) -> Self {
        self.lock_timeout = Some(seconds);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    Running,
    Committed,
    Aborted,
}

impl TransactionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TransactionStatus::Running)
    }
}

#[derive(Debug, Deserialize)]
struct TransactionEntity {
    id: String,
    status: TransactionStatus,
}

/// Entry of the running-transactions listing
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TransactionSummary {
    pub id: String,
    pub state: TransactionStatus,
}

pub struct StreamTransaction {
    executor: Arc<Executor>,
    database: String,
    id: String,
    status: TransactionStatus,
    host: HostHandle,
}

impl StreamTransaction {
    #[instrument(skip(executor, options), fields(database = %database))]
    pub(crate) async fn begin(
        executor: Arc<Executor>,
        database: &str,
        options: &StreamTransactionOptions,
    ) -> Result<Self> {
        let request = Request::post(format!("{}/begin", TRANSACTION_PATH))
            .database(database)
            .body(options)?;
        let (Wrapped { result }, host) = executor
            .execute_pinned::<Wrapped<TransactionEntity>>(request, None)
            .await?;
        info!(transaction_id = %result.id, host = %host.host(), "Began stream transaction");
        Ok(Self {
            executor,
            database: database.to_string(),
            id: result.id,
            status: result.status,
            host,
        })
    }

    /// Running stream transactions of a database
    pub(crate) async fn list(executor: &Executor, database: &str) -> Result<Vec<TransactionSummary>> {
        #[derive(Deserialize)]
        struct Listing {
            transactions: Vec<TransactionSummary>,
        }
        let Listing { transactions } = executor
            .execute(Request::get(TRANSACTION_PATH).database(database))
            .await?;
        Ok(transactions)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Last status seen by this handle
    pub fn status(&self) -> TransactionStatus {
        self.status
    }

    pub fn host(&self) -> &HostHandle {
        &self.host
    }

    fn ensure_running(&self, operation: &str) -> Result<()> {
        if self.status.is_terminal() {
            return Err(Error::StateViolation(format!(
                "cannot {} transaction {}: already {:?}",
                operation, self.id, self.status
            )));
        }
        Ok(())
    }

    async fn finish(&mut self, request: Request, operation: &str) -> Result<TransactionStatus> {
        self.ensure_running(operation)?;
        let (Wrapped { result }, _) = self
            .executor
            .execute_pinned::<Wrapped<TransactionEntity>>(request.database(&self.database), Some(&self.host))
            .await?;
        self.status = result.status;
        debug!(transaction_id = %self.id, status = ?self.status, "Transaction {}", operation);
        Ok(self.status)
    }

    /// Query the server for the current status
    pub async fn refresh_status(&mut self) -> Result<TransactionStatus> {
        let request = Request::get(format!("{}/{}", TRANSACTION_PATH, self.id));
        self.finish(request, "query").await
    }

    pub async fn commit(&mut self) -> Result<TransactionStatus> {
        let request = Request::put(format!("{}/{}", TRANSACTION_PATH, self.id));
        self.finish(request, "commit").await
    }

    pub async fn abort(&mut self) -> Result<TransactionStatus> {
        let request = Request::delete(format!("{}/{}", TRANSACTION_PATH, self.id));
        self.finish(request, "abort").await
    }

    /// Run `request` inside this transaction
    ///
    /// The request is sent to the transaction's coordinator with the
    /// transaction header; its database defaults to the transaction's.
    pub async fn execute<T: DeserializeOwned + Send>(&mut self, request: Request) -> Result<T> {
        self.ensure_running("use")?;
        let request = match request.database {
            Some(_) => request,
            None => request.database(&self.database),
        }
        .header(TRANSACTION_HEADER, self.id.clone());
        let (value, _) = self
            .executor
            .execute_pinned(request, Some(&self.host))
            .await?;
        Ok(value)
    }
}
