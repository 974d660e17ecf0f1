//! Command-line interface definition for the negotiator
//!
//! This module defines the CLI structure using clap's derive API. Each
//! subcommand maps onto one building block of the negotiation engine.

use clap::{Parser, Subcommand, ValueEnum};

/// mcp-negotiator - connect to remote MCP servers of unknown shape
///
/// Turns a bare host or URL into an initialized session by racing transport
/// candidates, probing capabilities, authorizing with OAuth 2.1 + PKCE and
/// falling back to a relay when needed.
#[derive(Parser, Debug, Clone)]
#[command(name = "mcp-negotiator")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/negotiator.yaml")]
    pub config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    /// Command to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Log output format
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human readable lines
    #[default]
    Text,
    /// One JSON object per line
    Json,
}

/// Available commands
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Negotiate a session with a target server
    Connect {
        /// Host or URL of the server (scheme defaults to https)
        target: String,

        /// Authorize with OAuth before connecting when no token is cached
        #[arg(long)]
        oauth: bool,

        /// Relay base URL used when the target cannot be reached directly
        #[arg(long)]
        relay_url: Option<String>,

        /// Delegated credential for the relay
        #[arg(long, env = "MCP_NEGOTIATOR_RELAY_TOKEN", hide_env_values = true)]
        relay_token: Option<String>,

        /// Overall timeout in seconds for the race phase
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// Resume a pending authorization from the redirect URL
    Callback {
        /// Full URL the authorization server redirected to
        redirect_url: String,
    },

    /// Run a capability probe against a URL
    Probe {
        /// URL to probe
        url: String,
    },

    /// Discover OAuth endpoints for a server
    Discover {
        /// Server URL
        url: String,
    },

    /// Generate a PKCE verifier and challenge
    Pkce,

    /// List recently connected targets
    Recent,
}

impl Cli {
    /// Parse command line arguments
    ///
    /// # Returns
    ///
    /// Returns the parsed CLI structure
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Relay URL override, if the command carries one.
    pub fn relay_url_override(&self) -> Option<&str> {
        match &self.command {
            Commands::Connect { relay_url, .. } => relay_url.as_deref(),
            _ => None,
        }
    }

    /// Relay credential override, if the command carries one.
    pub fn relay_token_override(&self) -> Option<&str> {
        match &self.command {
            Commands::Connect { relay_token, .. } => relay_token.as_deref(),
            _ => None,
        }
    }

    /// Timeout override, if the command carries one.
    pub fn timeout_override(&self) -> Option<u64> {
        match &self.command {
            Commands::Connect { timeout, .. } => *timeout,
            _ => None,
        }
    }
}

impl Default for Cli {
    fn default() -> Self {
        Self {
            config: Some("config/negotiator.yaml".to_string()),
            verbose: false,
            log_format: LogFormat::Text,
            command: Commands::Recent,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_default() {
        let cli = Cli::default();
        assert_eq!(cli.config, Some("config/negotiator.yaml".to_string()));
        assert!(!cli.verbose);
        assert_eq!(cli.log_format, LogFormat::Text);
        assert!(matches!(cli.command, Commands::Recent));
    }

    #[test]
    fn test_cli_parse_connect_command() {
        let cli = Cli::try_parse_from(["mcp-negotiator", "connect", "example.com/mcp"]).unwrap();
        match cli.command {
            Commands::Connect { target, oauth, .. } => {
                assert_eq!(target, "example.com/mcp");
                assert!(!oauth);
            }
            _ => panic!("Expected Connect command"),
        }
    }

    #[test]
    fn test_cli_parse_connect_with_overrides() {
        let cli = Cli::try_parse_from([
            "mcp-negotiator",
            "connect",
            "example.com",
            "--oauth",
            "--relay-url",
            "https://relay.example.com/proxy",
            "--relay-token",
            "cred",
            "--timeout",
            "10",
        ])
        .unwrap();
        assert_eq!(cli.relay_url_override(), Some("https://relay.example.com/proxy"));
        assert_eq!(cli.relay_token_override(), Some("cred"));
        assert_eq!(cli.timeout_override(), Some(10));
        assert!(matches!(cli.command, Commands::Connect { oauth: true, .. }));
    }

    #[test]
    fn test_cli_parse_callback_command() {
        let cli = Cli::try_parse_from([
            "mcp-negotiator",
            "callback",
            "http://localhost:3000/oauth/callback?code=c&state=s",
        ])
        .unwrap();
        assert!(matches!(cli.command, Commands::Callback { .. }));
        assert_eq!(cli.relay_url_override(), None);
    }

    #[test]
    fn test_cli_parse_json_log_format() {
        let cli = Cli::try_parse_from(["mcp-negotiator", "--log-format", "json", "-v", "pkce"]).unwrap();
        assert_eq!(cli.log_format, LogFormat::Json);
        assert!(cli.verbose);
        assert!(matches!(cli.command, Commands::Pkce));
    }

    #[test]
    fn test_cli_requires_subcommand() {
        assert!(Cli::try_parse_from(["mcp-negotiator"]).is_err());
    }
}
