//! Relay routing for targets the client cannot reach directly
//!
//! A relayed request goes to the configured relay base URL with the original
//! target URL appended as `?target=<url-encoded target>`, and carries the
//! caller's own delegated relay credential as its bearer token.

use std::fmt;

use url::Url;

use crate::mcp::transport::{TransportKind, DUAL_ACCEPT};

/// Query parameter carrying the forwarded target.
pub const TARGET_PARAM: &str = "target";

/// A configured relay endpoint plus the credential that authorizes its use.
#[derive(Clone)]
pub struct RelayRoute {
    base: Url,
    credential: String,
}

impl RelayRoute {
    /// Creates a route. Any query already on `base` is kept.
    pub fn new(base: Url, credential: String) -> Self {
        Self { base, credential }
    }

    /// Relay base URL.
    pub fn base(&self) -> &Url {
        &self.base
    }

    pub(crate) fn credential(&self) -> &str {
        &self.credential
    }

    /// URL that forwards to `target`.
    ///
    /// # Examples
    ///
    /// ```
    /// use url::Url;
    /// use mcp_negotiator::mcp::transport::RelayRoute;
    ///
    /// let relay = RelayRoute::new(Url::parse("https://relay.example.com/proxy").unwrap(), "c".into());
    /// let target = Url::parse("https://api.example.com/mcp?x=1").unwrap();
    /// let routed = relay.rewrite(&target);
    ///
    /// let forwarded = routed.query_pairs().find(|(k, _)| k == "target").unwrap().1;
    /// assert_eq!(forwarded, "https://api.example.com/mcp?x=1");
    /// ```
    pub fn rewrite(&self, target: &Url) -> Url {
        let mut url = self.base.clone();
        url.query_pairs_mut().append_pair(TARGET_PARAM, target.as_str());
        url
    }
}

impl fmt::Debug for RelayRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayRoute")
            .field("base", &self.base.as_str())
            .field("credential", &"<redacted>")
            .finish()
    }
}

/// Shell command reproducing a direct handshake against `url`.
///
/// Credentials appear only as a `$TOKEN` placeholder. The header carrying it
/// is double-quoted so the shell expands the variable.
pub fn curl_diagnostic(kind: TransportKind, url: &Url, with_token: bool) -> String {
    let auth = if with_token {
        " -H \"Authorization: Bearer $TOKEN\""
    } else {
        ""
    };
    match kind {
        TransportKind::Streaming => format!(
            "curl -i -X POST '{}' -H 'Content-Type: application/json' -H 'Accept: {}'{} \
             --data '{{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"initialize\",\"params\":{{}}}}'",
            url, DUAL_ACCEPT, auth
        ),
        TransportKind::LegacyEvents => {
            format!("curl -i -N '{}' -H 'Accept: text/event-stream'{}", url, auth)
        }
    }
}
