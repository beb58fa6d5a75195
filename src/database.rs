//! Database handle and thin endpoint wrappers

use crate::connection::message::Request;
use crate::cursor::{AqlQuery, Cursor};
use crate::error::{Error, Result};
use crate::error_codes;
use crate::executor::{Executor, Wrapped};
use crate::transaction::{StreamTransaction, StreamTransactionOptions, TransactionSummary};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::sync::Arc;

/// Result of a lookup where absence is an expected outcome
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup<T> {
    Found(T),
    NotFound,
}

impl<T> Lookup<T> {
    pub fn is_found(&self) -> bool {
        matches!(self, Lookup::Found(_))
    }

    pub fn into_option(self) -> Option<T> {
        match self {
            Lookup::Found(value) => Some(value),
            Lookup::NotFound => None,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Lookup<U> {
        match self {
            Lookup::Found(value) => Lookup::Found(f(value)),
            Lookup::NotFound => Lookup::NotFound,
        }
    }
}

/// Map a server error with `not_found` to [`Lookup::NotFound`]
pub fn lookup<T>(result: Result<T>, not_found: i64) -> Result<Lookup<T>> {
    match result {
        Ok(value) => Ok(Lookup::Found(value)),
        Err(e) if e.is_server_code(not_found) => Ok(Lookup::NotFound),
        Err(e) => Err(e),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseInfo {
    pub name: String,
    pub id: String,
    #[serde(default)]
    pub path: Option<String>,
    pub is_system: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ServerVersion {
    pub server: String,
    pub version: String,
    #[serde(default)]
    pub license: Option<String>,
}

/// Handle to one database; cheap to clone
#[derive(Clone)]
pub struct Database {
    executor: Arc<Executor>,
    name: String,
}

impl Database {
    pub fn new(executor: Arc<Executor>, name: impl Into<String>) -> Self {
        Self {
            executor,
            name: name.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn executor(&self) -> &Arc<Executor> {
        &self.executor
    }

    /// Request scoped to this database
    pub fn request(&self, request: Request) -> Request {
        request.database(&self.name)
    }

    pub async fn info(&self) -> Result<DatabaseInfo> {
        let Wrapped { result } = self
            .executor
            .execute(self.request(Request::get("/_api/database/current")))
            .await?;
        Ok(result)
    }

    pub async fn lookup_info(&self) -> Result<Lookup<DatabaseInfo>> {
        lookup(self.info().await, error_codes::ARANGO_DATABASE_NOT_FOUND)
    }

    /// Whether the database exists; any other failure is an error
    pub async fn exists(&self) -> Result<bool> {
        Ok(self.lookup_info().await?.is_found())
    }

    pub async fn version(&self) -> Result<ServerVersion> {
        self.executor
            .execute(self.request(Request::get("/_api/version")))
            .await
    }

    /// Fetch a document by handle (`collection/key`)
    pub async fn document<T: DeserializeOwned + Send>(&self, handle: &str) -> Result<Lookup<T>> {
        match handle.split_once('/') {
            Some((collection, key)) if !collection.is_empty() && !key.is_empty() => {}
            _ => {
                return Err(Error::InvalidArgument(format!(
                    "document handle '{}' is not of the form collection/key",
                    handle
                )))
            }
        }
        let request = self.request(Request::get(format!("/_api/document/{}", handle)));
        lookup(
            self.executor.execute(request).await,
            error_codes::ARANGO_DOCUMENT_NOT_FOUND,
        )
    }

    /// Run an AQL query and open a cursor on its result
    pub async fn query<T: DeserializeOwned + Send>(&self, query: &AqlQuery) -> Result<Cursor<T>> {
        Cursor::open(self.executor.clone(), &self.name, query).await
    }

    /// Re-attach to a cursor created earlier, reading its next batch
    pub async fn cursor<T: DeserializeOwned + Send>(&self, id: &str) -> Result<Cursor<T>> {
        Cursor::attach(self.executor.clone(), &self.name, id).await
    }

    pub async fn begin_transaction(
        &self,
        options: &StreamTransactionOptions,
    ) -> Result<StreamTransaction> {
        StreamTransaction::begin(self.executor.clone(), &self.name, options).await
    }

    pub async fn transactions(&self) -> Result<Vec<TransactionSummary>> {
        StreamTransaction::list(&self.executor, &self.name).await
    }
}
