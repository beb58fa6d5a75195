//! Client configuration
//!
//! [`ConnectionConfig`] is built once, validated, and then shared by `Arc`
//! across every connection of a client. It can be assembled in code
//! (struct literal with `..Default::default()`), parsed from TOML, or
//! loaded from a TOML file layered under `ARANGODB_*` environment
//! variables:
//!
//! ```toml
//! hosts = ["coordinator-1:8529", "coordinator-2:8529"]
//! protocol = "vst"
//! content_type = "vpack"
//! max_connections = 4
//! timeout_ms = 10000
//! user = "root"
//! password = "secret"
//! jwt = true
//! ```
//!
//! The TLS context is never read from configuration files; set
//! [`ConnectionConfig::ssl_context`] in code.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 8529;
pub const DEFAULT_MAX_CONNECTIONS: usize = 8;
pub const DEFAULT_TTL: Duration = Duration::from_secs(30);
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
/// VelocyStream chunk size used by the server's own clients
pub const DEFAULT_CHUNK_SIZE: usize = 30_000;
pub const DEFAULT_AUTH_RETRIES: u32 = 1;
pub const DEFAULT_FAILOVER_THRESHOLD: u32 = 2;

/// Address of one coordinator
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HostDescription {
    pub host: String,
    pub port: u16,
}

impl HostDescription {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse a cluster endpoint such as `tcp://10.0.0.1:8529` or
    /// `ssl://[::1]:8530`.
    pub fn from_endpoint(endpoint: &str) -> Result<Self> {
        let address = endpoint
            .split_once("://")
            .map(|(_, rest)| rest)
            .unwrap_or(endpoint);
        address.parse()
    }
}

impl FromStr for HostDescription {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim().trim_end_matches('/');
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| Error::Config(format!("host '{}' is missing a port", s)))?;
        let port = port
            .parse()
            .map_err(|_| Error::Config(format!("invalid port in host '{}'", s)))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(Error::Config(format!("host '{}' has an empty name", s)));
        }
        Ok(Self::new(host, port))
    }
}

impl fmt::Display for HostDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Transport variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Http,
    Vst,
}

/// Body encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ContentType {
    #[serde(rename = "json")]
    Json,
    #[default]
    #[serde(rename = "vpack", alias = "velocypack")]
    VelocyPack,
}

/// Host selection for requests without a pin
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancing {
    /// Stay on the current host until it fails repeatedly
    #[default]
    None,
    /// Advance to the next host on every request
    RoundRobin,
}

/// Credentials and scheme
#[derive(Clone, PartialEq, Eq)]
pub enum AuthenticationMethod {
    /// Static `Basic` header on every request
    Basic { user: String, password: String },
    /// Login once for a JWT, send it as `bearer` token
    Jwt { user: String, password: String },
}

impl AuthenticationMethod {
    pub fn user(&self) -> &str {
        match self {
            AuthenticationMethod::Basic { user, .. } | AuthenticationMethod::Jwt { user, .. } => {
                user
            }
        }
    }
}

impl fmt::Debug for AuthenticationMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = match self {
            AuthenticationMethod::Basic { .. } => "Basic",
            AuthenticationMethod::Jwt { .. } => "Jwt",
        };
        f.debug_struct(scheme)
            .field("user", &self.user())
            .field("password", &"***")
            .finish()
    }
}

/// Connection configuration
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Known coordinators, first one is the initial current host
    pub hosts: Vec<HostDescription>,
    pub protocol: Protocol,
    pub content_type: ContentType,
    /// Live connections per host
    pub max_connections: usize,
    /// Idle time after which a pooled connection is discarded
    pub connection_ttl: Duration,
    /// Per-request deadline
    pub timeout: Duration,
    pub use_ssl: bool,
    pub ssl_context: Option<Arc<rustls::ClientConfig>>,
    pub authentication: Option<AuthenticationMethod>,
    /// Echo cookies set by the server (session affinity, HTTP only)
    pub resend_cookies: bool,
    /// Largest VelocyStream chunk, header included
    pub chunk_size: usize,
    /// Re-authentication rounds after a 401 before giving up
    pub auth_retries: u32,
    /// Consecutive connection failures before unpinned requests move on
    pub failover_threshold: u32,
    pub load_balancing: LoadBalancing,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            hosts: vec![HostDescription::new(DEFAULT_HOST, DEFAULT_PORT)],
            protocol: Protocol::default(),
            content_type: ContentType::default(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            connection_ttl: DEFAULT_TTL,
            timeout: DEFAULT_TIMEOUT,
            use_ssl: false,
            ssl_context: None,
            authentication: None,
            resend_cookies: true,
            chunk_size: DEFAULT_CHUNK_SIZE,
            auth_retries: DEFAULT_AUTH_RETRIES,
            failover_threshold: DEFAULT_FAILOVER_THRESHOLD,
            load_balancing: LoadBalancing::default(),
        }
    }
}

impl ConnectionConfig {
    /// Parse a TOML document
    pub fn from_toml(source: &str) -> Result<Self> {
        let settings: Settings =
            toml::from_str(source).map_err(|e| Error::Config(e.to_string()))?;
        settings.try_into()
    }

    /// Read `ARANGODB_*` environment variables
    pub fn from_env() -> Result<Self> {
        Self::layered(None)
    }

    /// Read a TOML file, then apply `ARANGODB_*` environment overrides
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        Self::layered(Some(path.as_ref()))
    }

    fn layered(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::new(
                &path.to_string_lossy(),
                config::FileFormat::Toml,
            ));
        }
        let settings: Settings = builder
            .add_source(
                config::Environment::with_prefix("ARANGODB")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("hosts"),
            )
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| Error::Config(e.to_string()))?;
        settings.try_into()
    }

    pub fn with_hosts(mut self, hosts: impl IntoIterator<Item = HostDescription>) -> Self {
        self.hosts = hosts.into_iter().collect();
        self
    }

    pub fn with_authentication(mut self, method: AuthenticationMethod) -> Self {
        self.authentication = Some(method);
        self
    }

    pub fn with_ssl_context(mut self, context: Arc<rustls::ClientConfig>) -> Self {
        self.use_ssl = true;
        self.ssl_context = Some(context);
        self
    }

    /// Reject configurations no client can be built from
    pub fn validate(&self) -> Result<()> {
        if self.hosts.is_empty() {
            return Err(Error::Config("at least one host is required".to_string()));
        }
        if self.max_connections == 0 {
            return Err(Error::Config("max_connections must be positive".to_string()));
        }
        if self.timeout.is_zero() {
            return Err(Error::Config("timeout must be positive".to_string()));
        }
        if self.chunk_size <= crate::connection::chunk::CHUNK_HEADER_SIZE {
            return Err(Error::Config(format!(
                "chunk_size must exceed the {} byte chunk header",
                crate::connection::chunk::CHUNK_HEADER_SIZE
            )));
        }
        Ok(())
    }
}

/// Serialized form of [`ConnectionConfig`]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub hosts: Vec<String>,
    pub protocol: Protocol,
    pub content_type: ContentType,
    pub max_connections: usize,
    pub ttl_ms: u64,
    pub timeout_ms: u64,
    pub use_ssl: bool,
    pub user: Option<String>,
    pub password: Option<String>,
    pub jwt: bool,
    pub resend_cookies: bool,
    pub chunk_size: usize,
    pub auth_retries: u32,
    pub failover_threshold: u32,
    pub load_balancing: LoadBalancing,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            hosts: vec![format!("{}:{}", DEFAULT_HOST, DEFAULT_PORT)],
            protocol: Protocol::default(),
            content_type: ContentType::default(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            ttl_ms: DEFAULT_TTL.as_millis() as u64,
            timeout_ms: DEFAULT_TIMEOUT.as_millis() as u64,
            use_ssl: false,
            user: None,
            password: None,
            jwt: false,
            resend_cookies: true,
            chunk_size: DEFAULT_CHUNK_SIZE,
            auth_retries: DEFAULT_AUTH_RETRIES,
            failover_threshold: DEFAULT_FAILOVER_THRESHOLD,
            load_balancing: LoadBalancing::default(),
        }
    }
}

impl TryFrom<Settings> for ConnectionConfig {
    type Error = Error;

    fn try_from(settings: Settings) -> Result<Self> {
        let hosts = settings
            .hosts
            .iter()
            .map(|h| h.parse())
            .collect::<Result<Vec<HostDescription>>>()?;

        let authentication = match (settings.user, settings.jwt) {
            (Some(user), false) => Some(AuthenticationMethod::Basic {
                user,
                password: settings.password.unwrap_or_default(),
            }),
            (Some(user), true) => Some(AuthenticationMethod::Jwt {
                user,
                password: settings.password.unwrap_or_default(),
            }),
            (None, true) => {
                return Err(Error::Config("jwt authentication requires a user".to_string()))
            }
            (None, false) => None,
        };

        let config = ConnectionConfig {
            hosts,
            protocol: settings.protocol,
            content_type: settings.content_type,
            max_connections: settings.max_connections,
            connection_ttl: Duration::from_millis(settings.ttl_ms),
            timeout: Duration::from_millis(settings.timeout_ms),
            use_ssl: settings.use_ssl,
            ssl_context: None,
            authentication,
            resend_cookies: settings.resend_cookies,
            chunk_size: settings.chunk_size,
            auth_retries: settings.auth_retries,
            failover_threshold: settings.failover_threshold,
            load_balancing: settings.load_balancing,
        };
        config.validate()?;
        Ok(config)
    }
}
