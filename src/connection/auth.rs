//! Credential handling
//!
//! Basic authentication attaches a static header. JWT authentication logs
//! in once through `POST /_open/auth`, caches the returned token and sends
//! it as a `bearer` header until the server rejects it or it expires.
//! Concurrent logins are collapsed into one.

use super::message::{Method, Request, RequestEnvelope};
use super::ConnectionFactory;
use crate::codec::Codec;
use crate::config::{AuthenticationMethod, HostDescription};
use crate::error::{Error, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use jsonwebtoken::{DecodingKey, Validation};
use parking_lot::RwLock;
use serde::Deserialize;
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, instrument, warn};

pub const LOGIN_PATH: &str = "/_open/auth";

/// What a freshly opened connection presents to the server
#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    Basic { user: String, password: String },
    Jwt(String),
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credentials::Basic { user, .. } => write!(f, "Basic({})", user),
            Credentials::Jwt(_) => f.write_str("Jwt(***)"),
        }
    }
}

/// Where a login request is sent
pub struct LoginTarget<'a> {
    pub factory: &'a dyn ConnectionFactory,
    pub codec: Codec,
    pub host: &'a HostDescription,
}

#[derive(Deserialize)]
struct LoginResponse {
    jwt: String,
}

#[derive(Deserialize)]
struct Claims {
    exp: Option<u64>,
}

/// Whether a token's `exp` claim lies in the past
///
/// Tokens that cannot be decoded are treated as valid and left for the
/// server to judge.
pub fn token_expired(token: &str) -> bool {
    let mut validation = Validation::default();
    validation.insecure_disable_signature_validation();
    validation.validate_exp = false;
    validation.validate_aud = false;
    validation.required_spec_claims.clear();

    match jsonwebtoken::decode::<Claims>(token, &DecodingKey::from_secret(&[]), &validation) {
        Ok(data) => {
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0);
            data.claims.exp.is_some_and(|exp| exp <= now)
        }
        Err(_) => false,
    }
}

pub struct Authenticator {
    method: Option<AuthenticationMethod>,
    token: RwLock<Option<String>>,
    login_lock: tokio::sync::Mutex<()>,
    logins: AtomicU64,
}

impl Authenticator {
    pub fn new(method: Option<AuthenticationMethod>) -> Self {
        Self {
            method,
            token: RwLock::new(None),
            login_lock: tokio::sync::Mutex::new(()),
            logins: AtomicU64::new(0),
        }
    }

    pub fn method(&self) -> Option<&AuthenticationMethod> {
        self.method.as_ref()
    }

    /// Successful logins so far
    pub fn login_count(&self) -> u64 {
        self.logins.load(Ordering::Relaxed)
    }

    pub fn token(&self) -> Option<String> {
        self.token.read().clone()
    }

    /// Credentials for a new connection; `None` for JWT before login
    pub fn credentials(&self) -> Option<Credentials> {
        match self.method.as_ref()? {
            AuthenticationMethod::Basic { user, password } => Some(Credentials::Basic {
                user: user.clone(),
                password: password.clone(),
            }),
            AuthenticationMethod::Jwt { .. } => self.token().map(Credentials::Jwt),
        }
    }

    /// `Authorization` header value for the current credentials
    pub fn authorization_header(&self) -> Option<String> {
        match self.method.as_ref()? {
            AuthenticationMethod::Basic { user, password } => Some(format!(
                "Basic {}",
                STANDARD.encode(format!("{}:{}", user, password))
            )),
            AuthenticationMethod::Jwt { .. } => self.token().map(|t| format!("bearer {}", t)),
        }
    }

    fn needs_login(&self) -> bool {
        match self.method {
            Some(AuthenticationMethod::Jwt { .. }) => match self.token.read().as_deref() {
                Some(token) => token_expired(token),
                None => true,
            },
            _ => false,
        }
    }

    /// Log in if JWT is configured and no usable token is cached
    pub async fn ensure_authenticated(&self, target: &LoginTarget<'_>) -> Result<()> {
        if !self.needs_login() {
            return Ok(());
        }
        let _guard = self.login_lock.lock().await;
        // another task may have logged in while we waited
        if !self.needs_login() {
            return Ok(());
        }
        self.token.write().take();
        self.login(target).await
    }

    /// Refresh credentials after the server answered 401 to `rejected`
    pub async fn reauthenticate(
        &self,
        target: &LoginTarget<'_>,
        rejected: Option<&str>,
    ) -> Result<()> {
        if !matches!(self.method, Some(AuthenticationMethod::Jwt { .. })) {
            return Ok(());
        }
        let _guard = self.login_lock.lock().await;
        {
            let mut token = self.token.write();
            if token.is_some() && token.as_deref() != rejected {
                debug!("Token already refreshed by another request");
                return Ok(());
            }
            token.take();
        }
        self.login(target).await
    }

    #[instrument(skip(self, target), fields(host = %target.host))]
    async fn login(&self, target: &LoginTarget<'_>) -> Result<()> {
        let Some(AuthenticationMethod::Jwt { user, password }) = &self.method else {
            return Ok(());
        };

        let request = Request::new(Method::Post, LOGIN_PATH)
            .json(json!({"username": user, "password": password}));
        let envelope = RequestEnvelope::encode(&request, target.codec)?;

        let connection = target
            .factory
            .open(target.host)
            .await
            .map_err(|e| Error::Authentication(format!("login connection failed: {}", e)))?;
        let response = connection.execute(&envelope).await;
        connection.close().await;
        let response =
            response.map_err(|e| Error::Authentication(format!("login request failed: {}", e)))?;

        if !response.is_success() {
            warn!(user = %user, status = response.status, "JWT login rejected");
            return Err(Error::Authentication(format!(
                "login for user '{}' rejected with status {}",
                user, response.status
            )));
        }

        let LoginResponse { jwt } = target
            .codec
            .decode(&response.body)
            .map_err(|e| Error::Authentication(format!("malformed login response: {}", e)))?;

        *self.token.write() = Some(jwt);
        self.logins.fetch_add(1, Ordering::Relaxed);
        info!(user = %user, "Obtained JWT");
        Ok(())
    }
}
