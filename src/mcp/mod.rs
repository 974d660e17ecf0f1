//! MCP client plumbing for connection negotiation
//!
//! Only what is needed to establish a session is implemented: the
//! `initialize` handshake, both HTTP transports and OAuth 2.1 authorization.
//!
//! # Module Layout
//!
//! - `types`     -- JSON-RPC primitives and the `initialize` handshake
//! - `transport` -- Capability probing, streaming and legacy adapters, relay
//!   routing
//! - `auth`      -- PKCE, discovery, client registration and the
//!   begin/resume authorization flow

pub mod auth;
pub mod transport;
pub mod types;
