// arango-next - Asynchronous ArangoDB driver core
// HTTP and VelocyStream transports, JSON and VelocyPack payloads

#![warn(rust_2018_idioms)]

pub mod client;
pub mod codec;
pub mod config;
pub mod connection;
pub mod cursor;
pub mod database;
pub mod error_codes;
pub mod executor;
pub mod transaction;
pub mod velocypack;

#[cfg(test)]
pub(crate) mod testing;

// Re-exports for convenience
pub use client::ArangoClient;
pub use codec::Codec;
pub use config::{AuthenticationMethod, ConnectionConfig, ContentType, HostDescription, Protocol};
pub use connection::message::{Method, Request, Response};
pub use cursor::{AqlQuery, Cursor, CursorState};
pub use database::{Database, Lookup};
pub use error::{Error, Result};
pub use executor::{Executor, HostHandle};
pub use transaction::{StreamTransaction, StreamTransactionOptions, TransactionStatus};

/// Driver error types
pub mod error {
    use std::time::Duration;
    use thiserror::Error;

    #[derive(Error, Debug)]
    pub enum Error {
        /// Transport-level failure: refused, reset, malformed frame
        #[error("Connection error: {0}")]
        Connection(String),

        /// Per-request deadline exceeded
        #[error("Request timed out after {0:?}")]
        Timeout(Duration),

        /// Credentials rejected after re-authentication, or login failed
        #[error("Authentication error: {0}")]
        Authentication(String),

        /// Well-formed error envelope returned by the server
        #[error("Server error {code} (HTTP {status}): {message}")]
        Server {
            status: u16,
            code: i64,
            message: String,
        },

        /// Response bytes do not match the expected encoding or shape
        #[error("Protocol error: {0}")]
        Protocol(String),

        /// Cursor or transaction used outside its legal state
        #[error("State violation: {0}")]
        StateViolation(String),

        /// Invalid client configuration
        #[error("Configuration error: {0}")]
        Config(String),

        #[error("Invalid argument: {0}")]
        InvalidArgument(String),
    }

    impl Error {
        /// Numeric server error code, for `Server` errors only
        pub fn server_code(&self) -> Option<i64> {
            match self {
                Error::Server { code, .. } => Some(*code),
                _ => None,
            }
        }

        /// Whether the error is a server error carrying `code`
        pub fn is_server_code(&self, code: i64) -> bool {
            self.server_code() == Some(code)
        }

        /// Transport faults leave the connection in an unknown state
        pub fn poisons_connection(&self) -> bool {
            matches!(
                self,
                Error::Connection(_) | Error::Timeout(_) | Error::Protocol(_)
            )
        }
    }

    impl From<std::io::Error> for Error {
        fn from(err: std::io::Error) -> Self {
            Error::Connection(err.to_string())
        }
    }

    impl From<serde_json::Error> for Error {
        fn from(err: serde_json::Error) -> Self {
            Error::Protocol(err.to_string())
        }
    }

    impl From<crate::velocypack::VPackError> for Error {
        fn from(err: crate::velocypack::VPackError) -> Self {
            Error::Protocol(format!("VelocyPack: {}", err))
        }
    }

    impl From<reqwest::Error> for Error {
        fn from(err: reqwest::Error) -> Self {
            if err.is_timeout() {
                Error::Connection(format!("transport timeout: {}", err))
            } else {
                Error::Connection(err.to_string())
            }
        }
    }

    pub type Result<T> = std::result::Result<T, Error>;
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
