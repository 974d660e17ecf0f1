//! Persisted handoff between the two halves of the authorization flow
//!
//! Authorization spans a full browser navigation. The first machine
//! ([`OAuthFlow::begin`](super::flow::OAuthFlow::begin)) writes an
//! [`AuthorizationHandoff`] keyed by its `state` nonce and ends with a
//! redirect. The second machine ([`OAuthFlow::resume`](super::flow::OAuthFlow::resume))
//! rebuilds everything it needs from that record plus the returned code.
//!
//! A record is taken (removed) before the code exchange is attempted, so the
//! verifier it carries is used for at most one exchange whatever the outcome.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{NegotiatorError, Result};
use crate::mcp::auth::discovery::OAuthEndpoints;
use crate::mcp::auth::token_store::{ClientRegistration, ServerHostKey};
use crate::store::KeyedCache;

/// How long a pending authorization stays resumable.
pub const HANDOFF_TTL_MINUTES: i64 = 10;

/// Serialized OAuth context for one authorization attempt.
#[derive(Clone, Serialize, Deserialize)]
pub struct AuthorizationHandoff {
    /// Anti-CSRF nonce echoed back by the authorization server.
    pub state: String,
    /// PKCE verifier. Erased together with the record.
    pub verifier: String,
    /// PKCE challenge sent with the authorization request.
    pub challenge: String,
    /// Endpoints resolved by discovery.
    pub endpoints: OAuthEndpoints,
    /// Client identity used for the request.
    pub client: ClientRegistration,
    /// Server the resulting token is scoped to.
    pub host_key: ServerHostKey,
    /// Redirect URI sent with the authorization request.
    pub redirect_uri: String,
    /// The user-supplied target to reconnect to after the exchange.
    pub target: String,
    /// When the record was written.
    pub created_at: DateTime<Utc>,
}

impl AuthorizationHandoff {
    /// Returns `true` once the record is older than [`HANDOFF_TTL_MINUTES`].
    pub fn is_stale(&self) -> bool {
        Utc::now() - self.created_at > Duration::minutes(HANDOFF_TTL_MINUTES)
    }
}

impl fmt::Debug for AuthorizationHandoff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthorizationHandoff")
            .field("state", &self.state)
            .field("verifier", &"<redacted>")
            .field("challenge", &self.challenge)
            .field("client", &self.client)
            .field("host_key", &self.host_key)
            .field("target", &self.target)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

/// Pending handoffs keyed by `state`.
#[derive(Debug, Clone)]
pub struct HandoffStore {
    inner: KeyedCache<AuthorizationHandoff>,
}

impl HandoffStore {
    /// Wraps a keyed cache.
    pub fn new(inner: KeyedCache<AuthorizationHandoff>) -> Self {
        Self { inner }
    }

    /// In-memory handoff store.
    pub fn in_memory() -> Self {
        Self::new(KeyedCache::in_memory())
    }

    /// Persists `handoff` under its state and drops abandoned records that
    /// have gone stale.
    pub fn save(&self, handoff: AuthorizationHandoff) -> Result<()> {
        let pruned = self.inner.update(|pending| {
            let before = pending.len();
            pending.retain(|_, record| !record.is_stale());
            let pruned = before - pending.len();
            pending.insert(handoff.state.clone(), handoff);
            (pruned, true)
        })?;
        if pruned > 0 {
            tracing::debug!(pruned, "Dropped stale pending authorizations");
        }
        Ok(())
    }

    /// Returns `true` when a record for `state` is pending.
    pub fn contains(&self, state: &str) -> Result<bool> {
        Ok(self.inner.get(state)?.is_some())
    }

    /// Removes and returns the record for `state`.
    ///
    /// # Errors
    ///
    /// Returns [`NegotiatorError::Authorization`] when no record exists (an
    /// unknown or replayed state) or the record is stale. A stale record is
    /// still removed.
    pub fn take(&self, state: &str) -> Result<AuthorizationHandoff> {
        let handoff = self.inner.take(state)?.ok_or_else(|| {
            NegotiatorError::Authorization(
                "no pending authorization matches the returned state".to_string(),
            )
        })?;
        if handoff.is_stale() {
            return Err(NegotiatorError::Authorization(
                "the pending authorization expired; start the connection again".to_string(),
            )
            .into());
        }
        Ok(handoff)
    }
}
