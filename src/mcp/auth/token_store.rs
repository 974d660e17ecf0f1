//! Per-server token and client registration caches
//!
//! Every cached credential is scoped by a [`ServerHostKey`] so that a token
//! issued for one server is never presented to another. The caches are
//! [`KeyedCache`]s, so they inherit the replace-whole-collection discipline
//! of the underlying [`Store`](crate::store::Store).

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{NegotiatorError, Result};
use crate::store::KeyedCache;

// ---------------------------------------------------------------------------
// ServerHostKey
// ---------------------------------------------------------------------------

/// Lower-cased `host:port` of a target server, with the scheme's default
/// port filled in.
///
/// # Examples
///
/// ```
/// use url::Url;
/// use mcp_negotiator::mcp::auth::token_store::ServerHostKey;
///
/// let a = ServerHostKey::from_url(&Url::parse("https://Example.com/mcp").unwrap()).unwrap();
/// let b = ServerHostKey::from_url(&Url::parse("https://example.com:443/sse/").unwrap()).unwrap();
/// assert_eq!(a, b);
/// assert_eq!(a.as_str(), "example.com:443");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServerHostKey(String);

impl ServerHostKey {
    /// Derives the key from a URL.
    ///
    /// # Errors
    ///
    /// Returns [`NegotiatorError::InvalidTarget`] when the URL has no host.
    pub fn from_url(url: &Url) -> Result<Self> {
        let host = url
            .host_str()
            .ok_or_else(|| NegotiatorError::InvalidTarget(format!("{} has no host", url)))?;
        let port = url.port_or_known_default().unwrap_or(0);
        Ok(Self(format!("{}:{}", host.to_ascii_lowercase(), port)))
    }

    /// Borrow the key as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServerHostKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// OAuthToken
// ---------------------------------------------------------------------------

/// A complete OAuth 2.1 token response.
///
/// `Debug` output redacts both tokens.
///
/// # Examples
///
/// ```
/// use mcp_negotiator::mcp::auth::token_store::OAuthToken;
///
/// let token = OAuthToken {
///     access_token: "my_access_token".to_string(),
///     token_type: "Bearer".to_string(),
///     expires_at: None,
///     refresh_token: None,
///     scope: None,
/// };
///
/// // A token with no expiry is never considered expired.
/// assert!(!token.is_expired());
/// assert!(!format!("{:?}", token).contains("my_access_token"));
/// ```
#[derive(Clone, Serialize, Deserialize)]
pub struct OAuthToken {
    /// The access token string issued by the authorization server.
    pub access_token: String,

    /// The token type, typically `"Bearer"`.
    pub token_type: String,

    /// UTC timestamp at which the access token expires. `None` means the
    /// token is treated as non-expiring.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "chrono::serde::ts_seconds_option"
    )]
    pub expires_at: Option<DateTime<Utc>>,

    /// Refresh token for the `refresh_token` grant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,

    /// Space-separated scopes granted by the authorization server.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

impl OAuthToken {
    /// Returns `true` when the access token is expired or expires within the
    /// next 60 seconds.
    pub fn is_expired(&self) -> bool {
        match self.expires_at {
            None => false,
            Some(expires_at) => Utc::now() >= expires_at - chrono::Duration::seconds(60),
        }
    }
}

impl fmt::Debug for OAuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OAuthToken")
            .field("access_token", &"<redacted>")
            .field("token_type", &self.token_type)
            .field("expires_at", &self.expires_at)
            .field(
                "refresh_token",
                &self.refresh_token.as_ref().map(|_| "<redacted>"),
            )
            .field("scope", &self.scope)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// ClientRegistration
// ---------------------------------------------------------------------------

/// A client identity obtained through dynamic registration or configuration.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientRegistration {
    /// Client identifier presented to the authorization server.
    pub client_id: String,
    /// Secret for confidential clients. Never displayed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
}

impl fmt::Debug for ClientRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientRegistration")
            .field("client_id", &self.client_id)
            .field(
                "client_secret",
                &self.client_secret.as_ref().map(|_| "<redacted>"),
            )
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Caches
// ---------------------------------------------------------------------------

/// Tokens keyed by server host.
#[derive(Debug, Clone)]
pub struct TokenCache {
    inner: KeyedCache<OAuthToken>,
}

impl TokenCache {
    /// Wraps a keyed cache.
    pub fn new(inner: KeyedCache<OAuthToken>) -> Self {
        Self { inner }
    }

    /// In-memory token cache.
    pub fn in_memory() -> Self {
        Self::new(KeyedCache::in_memory())
    }

    /// Returns the cached token for `key`, expired or not.
    pub fn load(&self, key: &ServerHostKey) -> Result<Option<OAuthToken>> {
        self.inner.get(key.as_str())
    }

    /// Returns the cached token for `key` only when it is still valid.
    pub fn load_valid(&self, key: &ServerHostKey) -> Result<Option<OAuthToken>> {
        Ok(self.load(key)?.filter(|t| !t.is_expired()))
    }

    /// Caches `token` for `key`.
    pub fn save(&self, key: &ServerHostKey, token: OAuthToken) -> Result<()> {
        self.inner.put(key.as_str(), token)
    }

    /// Drops the token for `key`.
    pub fn forget(&self, key: &ServerHostKey) -> Result<()> {
        self.inner.take(key.as_str()).map(|_| ())
    }
}

/// Client registrations keyed by server host.
#[derive(Debug, Clone)]
pub struct RegistrationCache {
    inner: KeyedCache<ClientRegistration>,
}

impl RegistrationCache {
    /// Wraps a keyed cache.
    pub fn new(inner: KeyedCache<ClientRegistration>) -> Self {
        Self { inner }
    }

    /// In-memory registration cache.
    pub fn in_memory() -> Self {
        Self::new(KeyedCache::in_memory())
    }

    /// Returns the registration for `key`.
    pub fn load(&self, key: &ServerHostKey) -> Result<Option<ClientRegistration>> {
        self.inner.get(key.as_str())
    }

    /// Caches `registration` for `key`.
    pub fn save(&self, key: &ServerHostKey, registration: ClientRegistration) -> Result<()> {
        self.inner.put(key.as_str(), registration)
    }
}
