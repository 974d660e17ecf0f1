//! OAuth endpoint discovery
//!
//! Resolves the authorization, token and (optional) registration endpoints
//! of the authorization server guarding a target.
//!
//! # Discovery sequence
//!
//! 1. RFC 9728 protected resource metadata at
//!    `{origin}/.well-known/oauth-protected-resource`. Every authorization
//!    server it lists contributes its RFC 8414 and OIDC documents.
//! 2. The explicit discovery URL of a matching known provider.
//! 3. `{origin}/.well-known/openid-configuration`
//! 4. `{origin}/.well-known/oauth-authorization-server`
//! 5. `{scheme}://{hostname}/.well-known/openid-configuration` (no port)
//! 6. The static endpoints of a matching known provider.
//!
//! A document is accepted only when it names both an authorization and a
//! token endpoint. Discovery never fails with an error: when nothing is
//! found it returns `None` and the caller decides what that means.
//!
//! The resulting [`OAuthEndpoints`] always report `supports_pkce = true`,
//! and `requires_client_registration` is `true` unless a known provider
//! says otherwise.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::mcp::auth::providers::{self, KnownProvider};

// ---------------------------------------------------------------------------
// Protected Resource Metadata (RFC 9728)
// ---------------------------------------------------------------------------

/// Metadata document describing a protected resource.
///
/// # Examples
///
/// ```
/// use mcp_negotiator::mcp::auth::discovery::ProtectedResourceMetadata;
///
/// let json = r#"{
///     "resource": "https://api.example.com",
///     "authorization_servers": ["https://auth.example.com"]
/// }"#;
///
/// let meta: ProtectedResourceMetadata = serde_json::from_str(json).unwrap();
/// assert_eq!(meta.authorization_servers.len(), 1);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtectedResourceMetadata {
    /// The URI of the protected resource itself.
    #[serde(default)]
    pub resource: String,

    /// Issuer URIs of the authorization servers protecting this resource.
    #[serde(default)]
    pub authorization_servers: Vec<String>,

    /// OAuth scopes supported by this resource, if advertised.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scopes_supported: Option<Vec<String>>,
}

// ---------------------------------------------------------------------------
// Authorization Server Metadata (RFC 8414 / OIDC Discovery)
// ---------------------------------------------------------------------------

/// Metadata document describing an OAuth 2.1 / OIDC authorization server.
///
/// Fields the negotiator does not need are kept in `extra`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorizationServerMetadata {
    /// The issuer identifier URI for this authorization server.
    #[serde(default)]
    pub issuer: String,

    /// The URL of the authorization endpoint.
    #[serde(default)]
    pub authorization_endpoint: Option<String>,

    /// The URL of the token endpoint.
    #[serde(default)]
    pub token_endpoint: Option<String>,

    /// URL of the Dynamic Client Registration endpoint (RFC 7591).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registration_endpoint: Option<String>,

    /// OAuth scopes the server supports.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scopes_supported: Option<Vec<String>>,

    /// PKCE challenge methods the server advertises. Informational only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_challenge_methods_supported: Option<Vec<String>>,

    /// Additional server metadata fields not explicitly modelled above.
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

// ---------------------------------------------------------------------------
// OAuthEndpoints
// ---------------------------------------------------------------------------

/// Where a set of endpoints came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum EndpointSource {
    /// A metadata document at this URL.
    Document(String),
    /// The static known-provider table.
    KnownProvider(String),
}

/// The resolved endpoint set for one server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuthEndpoints {
    /// Browser redirect target for the authorization request.
    pub authorization_endpoint: String,
    /// Form-encoded POST target for the code exchange.
    pub token_endpoint: String,
    /// Dynamic client registration endpoint, when advertised.
    pub registration_endpoint: Option<String>,
    /// Space separated scope to request.
    pub scope: String,
    /// Always `true`.
    pub supports_pkce: bool,
    /// `true` unless a known provider explicitly allows unregistered clients.
    pub requires_client_registration: bool,
    /// Extra headers for token endpoint requests.
    #[serde(default)]
    pub custom_headers: HashMap<String, String>,
    /// Provenance, for diagnostics.
    pub source: EndpointSource,
}

// ---------------------------------------------------------------------------
// OAuthDiscovery
// ---------------------------------------------------------------------------

/// Resolves [`OAuthEndpoints`] for target servers.
///
/// # Examples
///
/// ```no_run
/// use url::Url;
/// use mcp_negotiator::mcp::auth::discovery::OAuthDiscovery;
///
/// # async fn example() -> mcp_negotiator::error::Result<()> {
/// let discovery = OAuthDiscovery::new(reqwest::Client::new(), "openid profile email");
/// let endpoints = discovery.discover(&Url::parse("https://example.com/mcp")?).await;
/// if let Some(endpoints) = endpoints {
///     println!("token endpoint: {}", endpoints.token_endpoint);
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct OAuthDiscovery {
    http: reqwest::Client,
    default_scope: String,
}

impl OAuthDiscovery {
    /// Creates a discovery client. `default_scope` is requested when neither
    /// a known provider nor the server's metadata suggests a scope.
    pub fn new(http: reqwest::Client, default_scope: &str) -> Self {
        Self {
            http,
            default_scope: default_scope.to_string(),
        }
    }

    /// Discovers the endpoints guarding `server_url`.
    ///
    /// Returns `None` when neither a metadata document nor a known provider
    /// yields both an authorization and a token endpoint.
    pub async fn discover(&self, server_url: &Url) -> Option<OAuthEndpoints> {
        let hostname = server_url.host_str()?;
        let provider = providers::lookup(hostname);

        if provider.map_or(true, |p| p.supports_discovery) {
            let mut documents = self.protected_resource_documents(server_url).await;
            documents.extend(origin_document_urls(server_url, provider));
            dedup_in_order(&mut documents);

            for url in &documents {
                if let Some(meta) = self.fetch_document(url).await {
                    if let Some(endpoints) = self.endpoints_from_metadata(meta, url, provider) {
                        tracing::info!(document = %url, "Discovered OAuth endpoints");
                        return Some(endpoints);
                    }
                }
            }
        }

        match provider {
            Some(p) if p.has_static_endpoints() => {
                tracing::info!(provider = p.name, "Using static OAuth endpoints");
                Some(self.endpoints_from_provider(p))
            }
            _ => {
                tracing::debug!(server = %server_url, "No OAuth endpoints found");
                None
            }
        }
    }

    async fn protected_resource_documents(&self, server_url: &Url) -> Vec<Url> {
        let Ok(url) = server_url.join("/.well-known/oauth-protected-resource") else {
            return Vec::new();
        };
        let meta: ProtectedResourceMetadata = match self.get_json(&url).await {
            Some(value) => value,
            None => return Vec::new(),
        };

        let mut out = Vec::new();
        for issuer in &meta.authorization_servers {
            let Ok(issuer) = Url::parse(issuer) else {
                tracing::warn!(issuer = %issuer, "Ignoring unparseable authorization server");
                continue;
            };
            for suffix in [
                "/.well-known/oauth-authorization-server",
                "/.well-known/openid-configuration",
            ] {
                if let Ok(doc) = issuer.join(suffix) {
                    out.push(doc);
                }
            }
        }
        out
    }

    async fn fetch_document(&self, url: &Url) -> Option<AuthorizationServerMetadata> {
        self.get_json(url).await
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &Url) -> Option<T> {
        tracing::debug!(url = %url, "Trying discovery document");
        let resp = match self
            .http
            .get(url.clone())
            .header("Accept", "application/json")
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => {
                tracing::debug!(url = %url, error = %e, "Discovery request failed");
                return None;
            }
        };
        if !resp.status().is_success() {
            return None;
        }
        resp.json::<T>().await.ok()
    }

    fn endpoints_from_metadata(
        &self,
        meta: AuthorizationServerMetadata,
        document: &Url,
        provider: Option<&KnownProvider>,
    ) -> Option<OAuthEndpoints> {
        let authorization_endpoint = meta.authorization_endpoint.filter(|s| !s.is_empty())?;
        let token_endpoint = meta.token_endpoint.filter(|s| !s.is_empty())?;

        let scope = provider
            .and_then(|p| p.scope.map(str::to_string))
            .or_else(|| {
                meta.scopes_supported
                    .filter(|s| !s.is_empty())
                    .map(|s| s.join(" "))
            })
            .unwrap_or_else(|| self.default_scope.clone());

        Some(OAuthEndpoints {
            authorization_endpoint,
            token_endpoint,
            registration_endpoint: meta.registration_endpoint,
            scope,
            supports_pkce: true,
            requires_client_registration: provider.map_or(true, |p| p.requires_client_registration),
            custom_headers: provider.map(custom_headers).unwrap_or_default(),
            source: EndpointSource::Document(document.to_string()),
        })
    }

    fn endpoints_from_provider(&self, provider: &KnownProvider) -> OAuthEndpoints {
        OAuthEndpoints {
            authorization_endpoint: provider
                .authorization_endpoint
                .unwrap_or_default()
                .to_string(),
            token_endpoint: provider.token_endpoint.unwrap_or_default().to_string(),
            registration_endpoint: None,
            scope: provider
                .scope
                .map(str::to_string)
                .unwrap_or_else(|| self.default_scope.clone()),
            supports_pkce: true,
            requires_client_registration: provider.requires_client_registration,
            custom_headers: custom_headers(provider),
            source: EndpointSource::KnownProvider(provider.name.to_string()),
        }
    }
}

fn custom_headers(provider: &KnownProvider) -> HashMap<String, String> {
    provider
        .custom_headers
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Origin-derived discovery documents, preceded by the provider's explicit
/// discovery URL when it has one.
pub fn origin_document_urls(server_url: &Url, provider: Option<&KnownProvider>) -> Vec<Url> {
    let mut out = Vec::new();

    if let Some(explicit) = provider.and_then(|p| p.discovery_url) {
        if let Ok(u) = Url::parse(explicit) {
            out.push(u);
        }
    }

    for suffix in [
        "/.well-known/openid-configuration",
        "/.well-known/oauth-authorization-server",
    ] {
        if let Ok(u) = server_url.join(suffix) {
            out.push(u);
        }
    }

    if let Some(host) = server_url.host_str() {
        let bare = format!(
            "{}://{}/.well-known/openid-configuration",
            server_url.scheme(),
            host
        );
        if let Ok(u) = Url::parse(&bare) {
            out.push(u);
        }
    }

    out
}

fn dedup_in_order(urls: &mut Vec<Url>) {
    let mut seen = std::collections::HashSet::new();
    urls.retain(|u| seen.insert(u.as_str().to_string()));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_origin_document_urls_order_for_unknown_host() {
        let url = Url::parse("https://example.com:8443/api/mcp").unwrap();
        let urls: Vec<String> = origin_document_urls(&url, None)
            .into_iter()
            .map(|u| u.to_string())
            .collect();
        assert_eq!(
            urls,
            vec![
                "https://example.com:8443/.well-known/openid-configuration",
                "https://example.com:8443/.well-known/oauth-authorization-server",
                "https://example.com/.well-known/openid-configuration",
            ]
        );
    }

    #[test]
    fn test_origin_document_urls_prepends_provider_discovery_url() {
        let url = Url::parse("https://accounts.google.com/").unwrap();
        let provider = providers::lookup("accounts.google.com");
        let urls = origin_document_urls(&url, provider);
        assert_eq!(
            urls[0].as_str(),
            "https://accounts.google.com/.well-known/openid-configuration"
        );
    }

    #[test]
    fn test_dedup_in_order_keeps_first_occurrence() {
        let url = Url::parse("https://accounts.google.com/").unwrap();
        let mut urls = origin_document_urls(&url, providers::lookup("accounts.google.com"));
        let before = urls.len();
        dedup_in_order(&mut urls);
        assert!(urls.len() < before);
        assert_eq!(
            urls[0].as_str(),
            "https://accounts.google.com/.well-known/openid-configuration"
        );
    }

    #[test]
    fn test_metadata_without_token_endpoint_is_rejected() {
        let discovery = OAuthDiscovery::new(reqwest::Client::new(), "openid");
        let meta: AuthorizationServerMetadata = serde_json::from_value(serde_json::json!({
            "issuer": "https://auth.example.com",
            "authorization_endpoint": "https://auth.example.com/authorize"
        }))
        .unwrap();
        let doc = Url::parse("https://auth.example.com/.well-known/openid-configuration").unwrap();
        assert!(discovery.endpoints_from_metadata(meta, &doc, None).is_none());
    }

    #[test]
    fn test_metadata_endpoints_always_support_pkce() {
        let discovery = OAuthDiscovery::new(reqwest::Client::new(), "openid");
        let meta: AuthorizationServerMetadata = serde_json::from_value(serde_json::json!({
            "issuer": "https://auth.example.com",
            "authorization_endpoint": "https://auth.example.com/authorize",
            "token_endpoint": "https://auth.example.com/token",
            "code_challenge_methods_supported": ["plain"]
        }))
        .unwrap();
        let doc = Url::parse("https://auth.example.com/.well-known/openid-configuration").unwrap();
        let endpoints = discovery.endpoints_from_metadata(meta, &doc, None).unwrap();
        assert!(endpoints.supports_pkce);
        assert!(endpoints.requires_client_registration);
        assert_eq!(endpoints.scope, "openid");
        assert!(endpoints.registration_endpoint.is_none());
    }

    #[test]
    fn test_metadata_scope_joins_supported_scopes() {
        let discovery = OAuthDiscovery::new(reqwest::Client::new(), "openid");
        let meta: AuthorizationServerMetadata = serde_json::from_value(serde_json::json!({
            "authorization_endpoint": "https://a/authorize",
            "token_endpoint": "https://a/token",
            "scopes_supported": ["mcp:read", "mcp:write"]
        }))
        .unwrap();
        let doc = Url::parse("https://a/.well-known/oauth-authorization-server").unwrap();
        let endpoints = discovery.endpoints_from_metadata(meta, &doc, None).unwrap();
        assert_eq!(endpoints.scope, "mcp:read mcp:write");
    }

    #[test]
    fn test_provider_endpoints_carry_custom_headers() {
        let discovery = OAuthDiscovery::new(reqwest::Client::new(), "openid");
        let notion = providers::lookup("notion.so").unwrap();
        let endpoints = discovery.endpoints_from_provider(notion);
        assert_eq!(endpoints.token_endpoint, "https://api.notion.com/v1/oauth/token");
        assert_eq!(
            endpoints.custom_headers.get("Notion-Version").map(String::as_str),
            Some("2022-06-28")
        );
        assert_eq!(
            endpoints.source,
            EndpointSource::KnownProvider("Notion".to_string())
        );
    }

    #[tokio::test]
    async fn test_discover_known_provider_without_discovery_uses_static_table() {
        let discovery = OAuthDiscovery::new(reqwest::Client::new(), "openid");
        let url = Url::parse("https://github.com/some/mcp").unwrap();
        let endpoints = discovery.discover(&url).await.unwrap();
        assert_eq!(
            endpoints.authorization_endpoint,
            "https://github.com/login/oauth/authorize"
        );
        assert_eq!(endpoints.scope, "read:user user:email");
    }
}
