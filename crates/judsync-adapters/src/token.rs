use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::{RegistryApi, RegistryError};

/// Tokens issued by the registry are reused for this long.
pub const TOKEN_TTL_HOURS: i64 = 6;

#[derive(Clone)]
pub struct Credentials {
    pub account: String,
    password: String,
}

impl Credentials {
    pub fn new(account: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            account: account.into(),
            password: password.into(),
        }
    }

    pub fn password(&self) -> &str {
        &self.password
    }

    pub fn is_complete(&self) -> bool {
        !self.account.trim().is_empty() && !self.password.is_empty()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("account", &self.account)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

impl AuthToken {
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

/// Caches one registry token and re-authenticates once it expires.
pub struct TokenManager {
    api: Arc<dyn RegistryApi>,
    credentials: Credentials,
    ttl: Duration,
    cached: Mutex<Option<AuthToken>>,
}

impl TokenManager {
    pub fn new(api: Arc<dyn RegistryApi>, credentials: Credentials) -> Self {
        Self::with_ttl(api, credentials, Duration::hours(TOKEN_TTL_HOURS))
    }

    pub fn with_ttl(api: Arc<dyn RegistryApi>, credentials: Credentials, ttl: Duration) -> Self {
        Self {
            api,
            credentials,
            ttl,
            cached: Mutex::new(None),
        }
    }

    pub async fn get_token(&self) -> Result<String, RegistryError> {
        self.get_token_at(Utc::now()).await
    }

    /// Holds the cache lock across authentication so concurrent callers
    /// share a single login.
    pub async fn get_token_at(&self, now: DateTime<Utc>) -> Result<String, RegistryError> {
        let mut cached = self.cached.lock().await;
        if let Some(token) = cached.as_ref().filter(|t| t.is_valid_at(now)) {
            debug!("reusing cached registry token");
            return Ok(token.token.clone());
        }

        if !self.credentials.is_complete() {
            return Err(RegistryError::Auth("registry credentials are not configured".to_string()));
        }
        let token = self.api.authenticate(&self.credentials).await?;
        if token.trim().is_empty() {
            return Err(RegistryError::Auth("registry returned an empty token".to_string()));
        }
        info!(account = %self.credentials.account, "obtained registry token");
        *cached = Some(AuthToken {
            token: token.clone(),
            expires_at: now + self.ttl,
        });
        Ok(token)
    }

    pub async fn invalidate(&self) {
        *self.cached.lock().await = None;
    }

    pub async fn cached(&self) -> Option<AuthToken> {
        self.cached.lock().await.clone()
    }
}
