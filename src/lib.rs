//! mcp-negotiator - connection negotiation for remote MCP servers
//!
//! This library turns a bare host or URL typed by a user into a single,
//! initialized MCP session. It races every plausible transport and path
//! variant concurrently, adapts request headers to what the server accepts,
//! authorizes with OAuth 2.1 + PKCE when asked, and falls back to a relay
//! when the server cannot be reached directly.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//!
//! - `negotiation`: Target planning, the candidate race and the orchestrator
//! - `mcp`: Handshake types, transports, capability probing and OAuth
//! - `store`: Replace-whole-collection persistence for shared state
//! - `config`: Configuration management and validation
//! - `error`: Error types and result aliases
//! - `cli`: Command-line interface definition
//! - `commands`: Handlers behind each CLI subcommand
//!
//! # Example
//!
//! ```no_run
//! use mcp_negotiator::{Config, ConnectOutcome, ConnectRequest, Orchestrator};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::default();
//!     config.validate()?;
//!
//!     let orchestrator = Orchestrator::from_config(&config)?;
//!     if let ConnectOutcome::Connected(info) =
//!         orchestrator.connect(ConnectRequest::new("example.com/mcp")).await?
//!     {
//!         println!("{} via {}", info.url, info.kind);
//!     }
//!     orchestrator.disconnect().await;
//!     Ok(())
//! }
//! ```

pub mod cli;
pub mod commands;
pub mod config;
pub mod error;
pub mod mcp;
pub mod negotiation;
pub mod store;

// Re-export commonly used types
pub use config::Config;
pub use error::{NegotiatorError, Result};
pub use negotiation::{ConnectOutcome, ConnectRequest, NegotiationState, Orchestrator};
