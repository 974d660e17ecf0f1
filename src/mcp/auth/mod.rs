//! OAuth 2.1 authorization for MCP servers
//!
//! Authorization is only attempted when a caller asks for it. PKCE (`S256`)
//! is always used.
//!
//! # Module Layout
//!
//! - [`discovery`]   -- RFC 9728 protected resource metadata and RFC 8414 /
//!   OIDC discovery, with a static provider fallback
//! - [`flow`]        -- The begin/resume authorization code flow
//! - [`handoff`]     -- Persisted context between the two halves of the flow
//! - [`pkce`]        -- PKCE verifier and challenge generation
//! - [`providers`]   -- Table of well-known OAuth providers
//! - [`token_store`] -- Per-server token and registration caches

pub mod discovery;
pub mod flow;
pub mod handoff;
pub mod pkce;
pub mod providers;
pub mod token_store;
