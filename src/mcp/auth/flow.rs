//! OAuth 2.1 authorization code flow with PKCE
//!
//! The flow is split into two machines because a browser navigation sits in
//! the middle:
//!
//! 1. [`OAuthFlow::begin`]: generate PKCE, discover endpoints, resolve a
//!    client id (cached registration, configured client, or Dynamic Client
//!    Registration), persist an [`AuthorizationHandoff`] and return the URL
//!    the user must visit.
//! 2. [`OAuthFlow::resume`]: take the handoff matching the returned `state`,
//!    exchange the code together with the stored verifier, and cache the
//!    token under the server's host key.
//!
//! Refreshing an expired token ([`OAuthFlow::refresh`]) reuses the
//! discovered endpoints and the cached registration.
//!
//! # References
//!
//! - OAuth 2.1 draft <https://datatracker.ietf.org/doc/draft-ietf-oauth-v2-1/>
//! - RFC 7636 PKCE <https://www.rfc-editor.org/rfc/rfc7636>
//! - RFC 7591 Dynamic Registration <https://www.rfc-editor.org/rfc/rfc7591>

use std::collections::HashMap;

use base64::Engine as _;
use url::Url;

use crate::error::{NegotiatorError, Result};
use crate::mcp::auth::discovery::{OAuthDiscovery, OAuthEndpoints};
use crate::mcp::auth::handoff::{AuthorizationHandoff, HandoffStore};
use crate::mcp::auth::pkce;
use crate::mcp::auth::token_store::{
    ClientRegistration, OAuthToken, RegistrationCache, ServerHostKey, TokenCache,
};

/// Client id used when a provider explicitly allows unregistered clients.
pub const FALLBACK_CLIENT_ID: &str = "mcp-negotiator";

// ---------------------------------------------------------------------------
// Configuration and outcomes
// ---------------------------------------------------------------------------

/// Static settings for the authorization flow.
#[derive(Debug, Clone)]
pub struct OAuthFlowConfig {
    /// Name sent during Dynamic Client Registration.
    pub client_name: String,
    /// Redirect URI registered for this client.
    pub redirect_uri: String,
    /// Pre-registered client ids keyed by hostname or `host:port`.
    pub static_clients: HashMap<String, String>,
}

/// Result of [`OAuthFlow::begin`].
#[derive(Debug, Clone)]
pub enum BeginOutcome {
    /// The user must be sent to `authorization_url`.
    Redirect {
        /// Fully built authorization request.
        authorization_url: Url,
        /// State nonce identifying the persisted handoff.
        state: String,
    },
    /// Discovery succeeded but no client identity can be obtained without
    /// operator action.
    NeedsManualConfiguration {
        /// Host the configuration is missing for.
        host_key: ServerHostKey,
        /// Human readable explanation.
        reason: String,
    },
}

/// Query parameters returned to the redirect URI.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthorizationCallback {
    /// Authorization code.
    pub code: Option<String>,
    /// State nonce.
    pub state: String,
    /// OAuth error code, when the user or server refused.
    pub error: Option<String>,
    /// OAuth error description.
    pub error_description: Option<String>,
}

impl AuthorizationCallback {
    /// Parses the full URL the authorization server redirected to.
    ///
    /// # Errors
    ///
    /// Returns [`NegotiatorError::Authorization`] when the URL is malformed
    /// or carries no `state`.
    ///
    /// # Examples
    ///
    /// ```
    /// use mcp_negotiator::mcp::auth::flow::AuthorizationCallback;
    ///
    /// let cb = AuthorizationCallback::from_redirect_url(
    ///     "http://localhost:3000/oauth/callback?code=abc&state=xyz",
    /// ).unwrap();
    /// assert_eq!(cb.code.as_deref(), Some("abc"));
    /// assert_eq!(cb.state, "xyz");
    /// ```
    pub fn from_redirect_url(redirect: &str) -> Result<Self> {
        let url = Url::parse(redirect).map_err(|e| {
            NegotiatorError::Authorization(format!("invalid callback URL: {}", e))
        })?;
        let mut callback = AuthorizationCallback::default();
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "code" => callback.code = Some(value.into_owned()),
                "state" => callback.state = value.into_owned(),
                "error" => callback.error = Some(value.into_owned()),
                "error_description" => callback.error_description = Some(value.into_owned()),
                _ => {}
            }
        }
        if callback.state.is_empty() {
            return Err(NegotiatorError::Authorization(
                "callback URL carries no state parameter".to_string(),
            )
            .into());
        }
        Ok(callback)
    }
}

/// A completed authorization.
#[derive(Debug, Clone)]
pub struct ResumedAuthorization {
    /// The target to reconnect to.
    pub target: String,
    /// Host the token was cached under.
    pub host_key: ServerHostKey,
    /// The issued token.
    pub token: OAuthToken,
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// Raw JSON response from an OAuth token endpoint.
#[derive(Debug, serde::Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_token_type")]
    token_type: String,
    #[serde(default)]
    expires_in: Option<u64>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    scope: Option<String>,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

impl TokenResponse {
    /// Converts `expires_in` seconds into an absolute `expires_at`.
    fn into_oauth_token(self) -> OAuthToken {
        let expires_at = self.expires_in.map(|secs| {
            chrono::Utc::now() + chrono::Duration::seconds(i64::try_from(secs).unwrap_or(i64::MAX))
        });

        OAuthToken {
            access_token: self.access_token,
            token_type: self.token_type,
            expires_at,
            refresh_token: self.refresh_token,
            scope: self.scope,
        }
    }
}

/// OAuth error body (RFC 6749 section 5.2).
#[derive(Debug, serde::Deserialize)]
struct OAuthErrorBody {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// Minimal Dynamic Client Registration response (RFC 7591).
#[derive(Debug, serde::Deserialize)]
struct DcrResponse {
    client_id: String,
    #[serde(default)]
    client_secret: Option<String>,
}

// ---------------------------------------------------------------------------
// OAuthFlow
// ---------------------------------------------------------------------------

/// Drives the authorization code flow for any number of servers.
#[derive(Debug, Clone)]
pub struct OAuthFlow {
    http: reqwest::Client,
    config: OAuthFlowConfig,
    discovery: OAuthDiscovery,
    registrations: RegistrationCache,
    handoffs: HandoffStore,
    tokens: TokenCache,
}

impl OAuthFlow {
    /// Creates a flow over the given caches.
    pub fn new(
        http: reqwest::Client,
        config: OAuthFlowConfig,
        discovery: OAuthDiscovery,
        registrations: RegistrationCache,
        handoffs: HandoffStore,
        tokens: TokenCache,
    ) -> Self {
        Self {
            http,
            config,
            discovery,
            registrations,
            handoffs,
            tokens,
        }
    }

    /// Token cache shared with the orchestrator.
    pub fn tokens(&self) -> &TokenCache {
        &self.tokens
    }

    /// Pending handoffs.
    pub fn handoffs(&self) -> &HandoffStore {
        &self.handoffs
    }

    /// Starts an authorization attempt for `server_url`.
    ///
    /// `target` is the user-supplied string the resumed attempt reconnects
    /// to.
    ///
    /// # Errors
    ///
    /// - [`NegotiatorError::Rng`] when PKCE material cannot be generated.
    /// - [`NegotiatorError::Discovery`] when no endpoints are found.
    /// - [`NegotiatorError::Authorization`] when dynamic registration is
    ///   rejected.
    pub async fn begin(&self, server_url: &Url, target: &str) -> Result<BeginOutcome> {
        let host_key = ServerHostKey::from_url(server_url)?;
        let pkce = pkce::generate()?;

        let endpoints = self.discovery.discover(server_url).await.ok_or_else(|| {
            NegotiatorError::Discovery(format!(
                "no OAuth metadata found for {} and no known provider matches",
                host_key
            ))
        })?;

        let client = match self.resolve_client(&host_key, server_url, &endpoints).await? {
            Some(client) => client,
            None => {
                tracing::warn!(host = %host_key, "OAuth requires a pre-registered client id");
                return Ok(BeginOutcome::NeedsManualConfiguration {
                    reason: format!(
                        "{} requires client registration but advertises no registration \
                         endpoint; configure a client id for this host",
                        host_key
                    ),
                    host_key,
                });
            }
        };

        let state = generate_state()?;
        let authorization_url = build_authorization_url(
            &endpoints,
            &client.client_id,
            &self.config.redirect_uri,
            &state,
            &pkce.challenge,
        )?;

        self.handoffs.save(AuthorizationHandoff {
            state: state.clone(),
            verifier: pkce.verifier,
            challenge: pkce.challenge,
            endpoints,
            client,
            host_key: host_key.clone(),
            redirect_uri: self.config.redirect_uri.clone(),
            target: target.to_string(),
            created_at: chrono::Utc::now(),
        })?;

        tracing::info!(host = %host_key, "Authorization required, redirecting");
        Ok(BeginOutcome::Redirect {
            authorization_url,
            state,
        })
    }

    /// Completes an authorization attempt from the redirect callback.
    ///
    /// The handoff is removed before anything else happens, so its verifier
    /// is used by at most one exchange whether or not that exchange succeeds.
    ///
    /// # Errors
    ///
    /// Returns [`NegotiatorError::Authorization`] for an unknown or stale
    /// state, an error returned by the authorization server, a missing code,
    /// or a rejected exchange.
    pub async fn resume(&self, callback: &AuthorizationCallback) -> Result<ResumedAuthorization> {
        let handoff = self.handoffs.take(&callback.state)?;

        if let Some(error) = &callback.error {
            return Err(NegotiatorError::Authorization(match &callback.error_description {
                Some(desc) => format!("authorization denied: {} ({})", error, desc),
                None => format!("authorization denied: {}", error),
            })
            .into());
        }
        let code = callback.code.as_deref().ok_or_else(|| {
            NegotiatorError::Authorization("callback carries no authorization code".to_string())
        })?;

        let AuthorizationHandoff {
            verifier,
            endpoints,
            client,
            host_key,
            redirect_uri,
            target,
            ..
        } = handoff;

        let mut params: Vec<(&str, &str)> = vec![
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", &redirect_uri),
            ("client_id", &client.client_id),
            ("code_verifier", &verifier),
        ];
        if let Some(secret) = client.client_secret.as_deref() {
            params.push(("client_secret", secret));
        }

        let result = self.post_token_request(&endpoints, &params).await;
        drop(params);
        drop(verifier);
        let token = result?;

        self.tokens.save(&host_key, token.clone())?;
        tracing::info!(host = %host_key, "Authorization completed");

        Ok(ResumedAuthorization {
            target,
            host_key,
            token,
        })
    }

    /// Exchanges the cached refresh token for `server_url` for a new token.
    ///
    /// Returns `Ok(None)` when there is nothing to refresh with.
    ///
    /// # Errors
    ///
    /// Returns [`NegotiatorError::Authorization`] when the token endpoint
    /// rejects the refresh.
    pub async fn refresh(&self, server_url: &Url) -> Result<Option<OAuthToken>> {
        let host_key = ServerHostKey::from_url(server_url)?;
        let Some(refresh_token) = self
            .tokens
            .load(&host_key)?
            .and_then(|t| t.refresh_token)
        else {
            return Ok(None);
        };
        let Some(endpoints) = self.discovery.discover(server_url).await else {
            return Ok(None);
        };
        let Some(client) = self.resolve_client(&host_key, server_url, &endpoints).await? else {
            return Ok(None);
        };

        let mut params: Vec<(&str, &str)> = vec![
            ("grant_type", "refresh_token"),
            ("refresh_token", &refresh_token),
            ("client_id", &client.client_id),
        ];
        if let Some(secret) = client.client_secret.as_deref() {
            params.push(("client_secret", secret));
        }

        let mut token = self.post_token_request(&endpoints, &params).await?;
        if token.refresh_token.is_none() {
            token.refresh_token = Some(refresh_token.clone());
        }
        self.tokens.save(&host_key, token.clone())?;
        tracing::info!(host = %host_key, "Refreshed access token");
        Ok(Some(token))
    }

    /// Resolves the client identity for `host_key`.
    ///
    /// Order: cached registration, configured client id, Dynamic Client
    /// Registration, then the fallback id when the provider allows
    /// unregistered clients. `None` means manual configuration is needed.
    async fn resolve_client(
        &self,
        host_key: &ServerHostKey,
        server_url: &Url,
        endpoints: &OAuthEndpoints,
    ) -> Result<Option<ClientRegistration>> {
        if let Some(cached) = self.registrations.load(host_key)? {
            return Ok(Some(cached));
        }

        let configured = self
            .config
            .static_clients
            .get(host_key.as_str())
            .or_else(|| {
                server_url
                    .host_str()
                    .and_then(|h| self.config.static_clients.get(h))
            });
        if let Some(client_id) = configured {
            return Ok(Some(ClientRegistration {
                client_id: client_id.clone(),
                client_secret: None,
            }));
        }

        if let Some(registration_endpoint) = &endpoints.registration_endpoint {
            let registration = self.dynamic_client_registration(registration_endpoint).await?;
            self.registrations.save(host_key, registration.clone())?;
            return Ok(Some(registration));
        }

        if !endpoints.requires_client_registration {
            return Ok(Some(ClientRegistration {
                client_id: FALLBACK_CLIENT_ID.to_string(),
                client_secret: None,
            }));
        }

        Ok(None)
    }

    /// Performs Dynamic Client Registration (RFC 7591).
    async fn dynamic_client_registration(
        &self,
        registration_endpoint: &str,
    ) -> Result<ClientRegistration> {
        let body = serde_json::json!({
            "client_name": self.config.client_name,
            "redirect_uris": [self.config.redirect_uri],
            "grant_types": ["authorization_code", "refresh_token"],
            "response_types": ["code"],
            "token_endpoint_auth_method": "none",
        });

        let resp = self
            .http
            .post(registration_endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                NegotiatorError::Authorization(format!("dynamic client registration failed: {e}"))
            })?;

        if !resp.status().is_success() {
            return Err(NegotiatorError::Authorization(format!(
                "client registration endpoint returned {}",
                resp.status()
            ))
            .into());
        }

        let dcr: DcrResponse = resp.json().await.map_err(|e| {
            NegotiatorError::Authorization(format!("failed to parse registration response: {e}"))
        })?;

        tracing::info!(client_id = %dcr.client_id, "Registered OAuth client");
        Ok(ClientRegistration {
            client_id: dcr.client_id,
            client_secret: dcr.client_secret,
        })
    }

    /// POSTs a form-encoded token request and parses the token.
    ///
    /// Error bodies are reduced to their OAuth `error` fields so request
    /// secrets echoed by a misbehaving server never reach the caller.
    async fn post_token_request(
        &self,
        endpoints: &OAuthEndpoints,
        params: &[(&str, &str)],
    ) -> Result<OAuthToken> {
        let mut req = self
            .http
            .post(&endpoints.token_endpoint)
            .header("Accept", "application/json")
            .form(params);
        for (k, v) in &endpoints.custom_headers {
            req = req.header(k.as_str(), v.as_str());
        }

        let resp = req.send().await.map_err(|e| {
            NegotiatorError::Authorization(format!(
                "token request failed: {}",
                e.without_url()
            ))
        })?;

        let status = resp.status();
        if !status.is_success() {
            let detail = match resp.json::<OAuthErrorBody>().await {
                Ok(body) => match body.error_description {
                    Some(desc) => format!("{}: {}", body.error, desc),
                    None => body.error,
                },
                Err(_) => "no OAuth error body".to_string(),
            };
            return Err(NegotiatorError::Authorization(format!(
                "token endpoint returned {}: {}",
                status, detail
            ))
            .into());
        }

        let raw: TokenResponse = resp.json().await.map_err(|e| {
            NegotiatorError::Authorization(format!("failed to parse token response: {e}"))
        })?;
        Ok(raw.into_oauth_token())
    }
}

// ---------------------------------------------------------------------------
// Utility functions
// ---------------------------------------------------------------------------

/// Generates a random state nonce: 16 bytes as base64url without padding.
fn generate_state() -> Result<String> {
    let mut bytes = [0u8; 16];
    pkce::fill_secure_random(&mut bytes)?;
    Ok(base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes))
}

/// Builds the authorization URL with every required query parameter.
pub fn build_authorization_url(
    endpoints: &OAuthEndpoints,
    client_id: &str,
    redirect_uri: &str,
    state: &str,
    code_challenge: &str,
) -> Result<Url> {
    let mut url = Url::parse(&endpoints.authorization_endpoint).map_err(|e| {
        NegotiatorError::Discovery(format!("invalid authorization endpoint URL: {e}"))
    })?;

    {
        let mut query = url.query_pairs_mut();
        query.append_pair("response_type", "code");
        query.append_pair("client_id", client_id);
        query.append_pair("redirect_uri", redirect_uri);
        query.append_pair("code_challenge", code_challenge);
        query.append_pair("code_challenge_method", pkce::CHALLENGE_METHOD);
        if !endpoints.scope.is_empty() {
            query.append_pair("scope", &endpoints.scope);
        }
        query.append_pair("state", state);
    }

    Ok(url)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::auth::discovery::EndpointSource;

    fn endpoints(scope: &str) -> OAuthEndpoints {
        OAuthEndpoints {
            authorization_endpoint: "https://auth.example.com/authorize".to_string(),
            token_endpoint: "https://auth.example.com/token".to_string(),
            registration_endpoint: None,
            scope: scope.to_string(),
            supports_pkce: true,
            requires_client_registration: true,
            custom_headers: HashMap::new(),
            source: EndpointSource::KnownProvider("test".to_string()),
        }
    }

    fn query_map(url: &Url) -> HashMap<String, String> {
        url.query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect()
    }

    #[test]
    fn test_build_authorization_url_contains_required_params() {
        let url = build_authorization_url(
            &endpoints("openid profile"),
            "client-1",
            "http://localhost:3000/oauth/callback",
            "state-1",
            "challenge-1",
        )
        .unwrap();
        let q = query_map(&url);
        assert_eq!(q["response_type"], "code");
        assert_eq!(q["client_id"], "client-1");
        assert_eq!(q["redirect_uri"], "http://localhost:3000/oauth/callback");
        assert_eq!(q["code_challenge"], "challenge-1");
        assert_eq!(q["code_challenge_method"], "S256");
        assert_eq!(q["scope"], "openid profile");
        assert_eq!(q["state"], "state-1");
    }

    #[test]
    fn test_build_authorization_url_omits_empty_scope() {
        let url =
            build_authorization_url(&endpoints(""), "c", "http://localhost/cb", "s", "ch").unwrap();
        assert!(!query_map(&url).contains_key("scope"));
    }

    #[test]
    fn test_build_authorization_url_rejects_invalid_endpoint() {
        let mut e = endpoints("openid");
        e.authorization_endpoint = "not a url".to_string();
        assert!(build_authorization_url(&e, "c", "http://localhost/cb", "s", "ch").is_err());
    }

    #[test]
    fn test_generate_state_produces_unique_values() {
        let a = generate_state().unwrap();
        let b = generate_state().unwrap();
        assert_eq!(a.len(), 22);
        assert_ne!(a, b);
    }

    #[test]
    fn test_callback_parses_error_response() {
        let cb = AuthorizationCallback::from_redirect_url(
            "http://localhost/cb?error=access_denied&error_description=User+denied&state=s1",
        )
        .unwrap();
        assert!(cb.code.is_none());
        assert_eq!(cb.error.as_deref(), Some("access_denied"));
        assert_eq!(cb.error_description.as_deref(), Some("User denied"));
    }

    #[test]
    fn test_callback_without_state_is_rejected() {
        assert!(AuthorizationCallback::from_redirect_url("http://localhost/cb?code=abc").is_err());
    }

    #[test]
    fn test_token_response_into_oauth_token_sets_expires_at() {
        let raw: TokenResponse = serde_json::from_value(serde_json::json!({
            "access_token": "at",
            "token_type": "Bearer",
            "expires_in": 3600,
            "refresh_token": "rt"
        }))
        .unwrap();
        let token = raw.into_oauth_token();
        assert!(token.expires_at.is_some());
        assert!(!token.is_expired());
        assert_eq!(token.refresh_token.as_deref(), Some("rt"));
    }

    #[test]
    fn test_token_response_defaults_token_type() {
        let raw: TokenResponse =
            serde_json::from_value(serde_json::json!({ "access_token": "at" })).unwrap();
        let token = raw.into_oauth_token();
        assert_eq!(token.token_type, "Bearer");
        assert!(token.expires_at.is_none());
    }
}
