//! `connect`, `callback` and `recent` command handlers
//!
//! These drive a full [`Orchestrator`] and print the outcome for a human.

use std::sync::Arc;

use colored::Colorize;

use crate::config::{Config, StorageBackend};
use crate::error::{NegotiatorError, Result};
use crate::mcp::auth::flow::AuthorizationCallback;
use crate::negotiation::orchestrator::{ConnectOutcome, ConnectRequest, Orchestrator};
use crate::negotiation::recent::RecentTargets;
use crate::store;

/// Negotiates a session with `target` and reports how it went.
///
/// Ctrl-C aborts the attempt. A session that was established is closed
/// before returning.
///
/// # Errors
///
/// Returns the negotiation error unchanged so the process exits non-zero.
pub async fn run_connect(config: Config, target: String, oauth: bool) -> Result<()> {
    let orchestrator = Arc::new(Orchestrator::from_config(&config)?);
    let outcome = with_interrupt(&orchestrator, async {
        orchestrator
            .connect(ConnectRequest { target, oauth })
            .await
    })
    .await;
    finish(&config, &orchestrator, outcome).await
}

/// Resumes a pending authorization from the URL the authorization server
/// redirected to, then connects.
///
/// # Errors
///
/// Returns authorization errors from the callback or token exchange, then
/// any connection error.
pub async fn run_callback(config: Config, redirect_url: String) -> Result<()> {
    let callback = AuthorizationCallback::from_redirect_url(&redirect_url)?;
    let orchestrator = Arc::new(Orchestrator::from_config(&config)?);
    let outcome = with_interrupt(&orchestrator, async {
        orchestrator.resume_authorization(&callback).await
    })
    .await;
    finish(&config, &orchestrator, outcome).await
}

/// Prints the recent-target list.
///
/// # Errors
///
/// Returns storage errors.
pub fn run_recent(config: &Config) -> Result<()> {
    let recent = RecentTargets::new(
        store::open(&config.storage, "recent", false),
        config.storage.recent_capacity,
    )?;
    let entries = recent.list()?;
    if entries.is_empty() {
        println!("No recent targets.");
        return Ok(());
    }
    for (i, entry) in entries.iter().enumerate() {
        println!("{:>3}. {}", i + 1, entry);
    }
    Ok(())
}

async fn with_interrupt<F>(orchestrator: &Arc<Orchestrator>, attempt: F) -> Result<ConnectOutcome>
where
    F: std::future::Future<Output = Result<ConnectOutcome>>,
{
    let watcher = {
        let orchestrator = Arc::clone(orchestrator);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Interrupt received");
                orchestrator.abort();
            }
        })
    };
    let outcome = attempt.await;
    watcher.abort();
    outcome
}

async fn finish(
    config: &Config,
    orchestrator: &Orchestrator,
    outcome: Result<ConnectOutcome>,
) -> Result<()> {
    match outcome {
        Ok(ConnectOutcome::Connected(info)) => {
            println!("{} {}", "Connected".green().bold(), info.url);
            println!("  transport:        {}", info.kind);
            println!("  via relay:        {}", info.via_relay);
            println!("  protocol version: {}", info.protocol_version);
            if let Some(name) = &info.server_name {
                println!("  server:           {}", name);
            }
            orchestrator.disconnect().await;
            Ok(())
        }
        Ok(ConnectOutcome::RedirectForAuthorization {
            authorization_url, ..
        }) => {
            println!("{}", "Authorization required".yellow().bold());
            println!("Open this URL in a browser:\n\n  {}\n", authorization_url);
            println!("Then run: mcp-negotiator callback '<redirect URL>'");
            if config.storage.backend == StorageBackend::Memory {
                tracing::warn!(
                    "Storage backend is 'memory'; the pending authorization is lost when this process exits. Use 'file' or 'keyring' to resume from another invocation"
                );
            }
            Ok(())
        }
        Ok(ConnectOutcome::NeedsManualConfiguration { host_key, reason }) => {
            println!("{}", "Manual configuration required".yellow().bold());
            println!("  {}", reason);
            println!(
                "  Add a client id for '{}' under oauth.static_clients in the configuration file.",
                host_key
            );
            Err(NegotiatorError::NeedsManualConfiguration(reason).into())
        }
        Err(e) => {
            eprintln!("{} {}", "Error:".red().bold(), e);
            Err(e)
        }
    }
}
