//! `probe`, `discover` and `pkce` command handlers
//!
//! Each exposes one building block of the negotiation engine on its own.

use url::Url;

use crate::config::Config;
use crate::error::{NegotiatorError, Result};
use crate::mcp::auth::discovery::OAuthDiscovery;
use crate::mcp::auth::pkce;
use crate::mcp::transport::CapabilityProber;

fn parse_url(raw: &str) -> Result<Url> {
    let with_scheme = if raw.contains("://") {
        raw.to_string()
    } else {
        format!("https://{}", raw)
    };
    Ok(Url::parse(&with_scheme)
        .map_err(|e| NegotiatorError::InvalidTarget(format!("{}: {}", raw, e)))?)
}

/// Runs one capability probe against `url`.
///
/// # Errors
///
/// Returns [`NegotiatorError::InvalidTarget`] for an unparsable URL. Probe
/// failures are reported as "not supported", never as errors.
pub async fn run_probe(config: &Config, url: &str) -> Result<()> {
    let url = parse_url(url)?;
    let prober = CapabilityProber::new(reqwest::Client::new(), &config.negotiation.origin);
    let result = prober.probe(&url).await;
    println!("accepts version header: {}", result.accepts_version_header);
    println!(
        "allowed origin:         {}",
        result.allowed_origin.as_deref().unwrap_or("-")
    );
    Ok(())
}

/// Discovers OAuth endpoints for `url` and prints them as JSON.
///
/// # Errors
///
/// Returns [`NegotiatorError::Discovery`] when nothing is found.
pub async fn run_discover(config: &Config, url: &str) -> Result<()> {
    let url = parse_url(url)?;
    let discovery = OAuthDiscovery::new(reqwest::Client::new(), &config.oauth.default_scope);
    match discovery.discover(&url).await {
        Some(endpoints) => {
            println!("{}", serde_json::to_string_pretty(&endpoints)?);
            Ok(())
        }
        None => Err(NegotiatorError::Discovery(format!(
            "no OAuth metadata found for {}",
            url.host_str().unwrap_or_default()
        ))
        .into()),
    }
}

/// Generates and prints a PKCE pair.
///
/// # Errors
///
/// Returns [`NegotiatorError::Rng`] when no secure random source exists.
pub fn run_pkce() -> Result<()> {
    let pair = pkce::generate()?;
    println!("code_verifier:         {}", pair.verifier);
    println!("code_challenge:        {}", pair.challenge);
    println!("code_challenge_method: {}", pair.method);
    Ok(())
}
