//! Static table of well-known OAuth providers
//!
//! Used when a server's hostname belongs to a provider whose endpoints are
//! known ahead of time, either because the provider publishes a discovery
//! document at a non-standard location or because it publishes none at all.

/// One entry of the known-provider table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KnownProvider {
    /// Hostname (or parent domain) this entry matches.
    pub domain: &'static str,
    /// Display name.
    pub name: &'static str,
    /// Explicit discovery document, tried before origin-derived documents.
    pub discovery_url: Option<&'static str>,
    /// Whether origin-derived discovery documents are worth trying.
    pub supports_discovery: bool,
    /// Static authorization endpoint.
    pub authorization_endpoint: Option<&'static str>,
    /// Static token endpoint.
    pub token_endpoint: Option<&'static str>,
    /// Scope requested when this provider is used.
    pub scope: Option<&'static str>,
    /// Whether a pre-registered client id is required.
    pub requires_client_registration: bool,
    /// Extra headers sent with token requests.
    pub custom_headers: &'static [(&'static str, &'static str)],
}

impl KnownProvider {
    /// Returns `true` when both static endpoints are present.
    pub fn has_static_endpoints(&self) -> bool {
        self.authorization_endpoint.is_some() && self.token_endpoint.is_some()
    }
}

/// The known-provider table.
pub const KNOWN_PROVIDERS: &[KnownProvider] = &[
    KnownProvider {
        domain: "github.com",
        name: "GitHub",
        discovery_url: None,
        supports_discovery: false,
        authorization_endpoint: Some("https://github.com/login/oauth/authorize"),
        token_endpoint: Some("https://github.com/login/oauth/access_token"),
        scope: Some("read:user user:email"),
        requires_client_registration: true,
        custom_headers: &[],
    },
    KnownProvider {
        domain: "accounts.google.com",
        name: "Google",
        discovery_url: Some("https://accounts.google.com/.well-known/openid-configuration"),
        supports_discovery: true,
        authorization_endpoint: None,
        token_endpoint: None,
        scope: Some("openid profile email"),
        requires_client_registration: true,
        custom_headers: &[],
    },
    KnownProvider {
        domain: "login.microsoftonline.com",
        name: "Microsoft",
        discovery_url: Some(
            "https://login.microsoftonline.com/common/v2.0/.well-known/openid-configuration",
        ),
        supports_discovery: true,
        authorization_endpoint: None,
        token_endpoint: None,
        scope: Some("openid profile email"),
        requires_client_registration: true,
        custom_headers: &[],
    },
    KnownProvider {
        domain: "auth0.com",
        name: "Auth0",
        discovery_url: None,
        supports_discovery: true,
        authorization_endpoint: None,
        token_endpoint: None,
        scope: Some("openid profile email"),
        requires_client_registration: true,
        custom_headers: &[],
    },
    KnownProvider {
        domain: "okta.com",
        name: "Okta",
        discovery_url: None,
        supports_discovery: true,
        authorization_endpoint: None,
        token_endpoint: None,
        scope: Some("openid profile email"),
        requires_client_registration: true,
        custom_headers: &[],
    },
    KnownProvider {
        domain: "notion.so",
        name: "Notion",
        discovery_url: None,
        supports_discovery: false,
        authorization_endpoint: Some("https://api.notion.com/v1/oauth/authorize"),
        token_endpoint: Some("https://api.notion.com/v1/oauth/token"),
        scope: Some("read_user"),
        requires_client_registration: true,
        custom_headers: &[("Notion-Version", "2022-06-28")],
    },
];

/// Finds the provider entry for `hostname`.
///
/// Exact matches win over suffix matches, so `accounts.google.com` is found
/// directly while `tenant.auth0.com` matches `auth0.com`.
///
/// # Examples
///
/// ```
/// use mcp_negotiator::mcp::auth::providers::lookup;
///
/// assert_eq!(lookup("github.com").unwrap().name, "GitHub");
/// assert_eq!(lookup("dev-123.okta.com").unwrap().name, "Okta");
/// assert!(lookup("example.com").is_none());
/// assert!(lookup("notgithub.com").is_none());
/// ```
pub fn lookup(hostname: &str) -> Option<&'static KnownProvider> {
    let hostname = hostname.trim_end_matches('.').to_ascii_lowercase();
    KNOWN_PROVIDERS
        .iter()
        .find(|p| p.domain == hostname)
        .or_else(|| {
            KNOWN_PROVIDERS.iter().find(|p| {
                hostname
                    .strip_suffix(p.domain)
                    .is_some_and(|prefix| prefix.ends_with('.'))
            })
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_exact_match() {
        let provider = lookup("accounts.google.com").unwrap();
        assert_eq!(provider.name, "Google");
        assert!(provider.discovery_url.is_some());
    }

    #[test]
    fn test_lookup_suffix_match() {
        assert_eq!(lookup("my-tenant.auth0.com").unwrap().domain, "auth0.com");
        assert_eq!(lookup("www.notion.so").unwrap().domain, "notion.so");
    }

    #[test]
    fn test_lookup_is_case_insensitive() {
        assert_eq!(lookup("GitHub.com").unwrap().domain, "github.com");
    }

    #[test]
    fn test_lookup_rejects_bare_suffix_without_dot() {
        assert!(lookup("evilgithub.com").is_none());
    }

    #[test]
    fn test_every_provider_requires_registration() {
        assert!(KNOWN_PROVIDERS.iter().all(|p| p.requires_client_registration));
    }

    #[test]
    fn test_notion_has_custom_version_header() {
        let notion = lookup("notion.so").unwrap();
        assert!(notion.has_static_endpoints());
        assert_eq!(notion.custom_headers, &[("Notion-Version", "2022-06-28")]);
    }
}
