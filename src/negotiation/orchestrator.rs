//! Negotiation orchestrator
//!
//! Owns the session lifecycle for one client:
//!
//! ```text
//! Idle -> CheckingAuth -> Racing -> Connected
//!                           |
//!                           +-> RacingViaProxy -> Connected
//! any active state -> Aborted | Failed
//! CheckingAuth -> AwaitingAuthorization | NeedsManualConfiguration
//! Connected -> Idle (disconnect)
//! ```
//!
//! State changes are published on a [`tokio::sync::watch`] channel. Only
//! one attempt runs at a time; a connect request arriving while connected
//! first tears the current session down and waits a short settle delay.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::config::Config;
use crate::error::{CompositeFailure, NegotiatorError, Result};
use crate::mcp::auth::discovery::OAuthDiscovery;
use crate::mcp::auth::flow::{AuthorizationCallback, BeginOutcome, OAuthFlow, OAuthFlowConfig};
use crate::mcp::auth::handoff::HandoffStore;
use crate::mcp::auth::token_store::{RegistrationCache, ServerHostKey, TokenCache};
use crate::mcp::transport::relay::curl_diagnostic;
use crate::mcp::transport::{AttemptContext, Connector, HttpConnector, RelayRoute, TransportKind};
use crate::negotiation::race::{RaceCoordinator, Session};
use crate::negotiation::recent::RecentTargets;
use crate::negotiation::target::{CandidatePlan, ConnectionTarget, PathSegments};
use crate::store::{self, KeyedCache};

/// Observable orchestrator state.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum NegotiationState {
    /// No attempt and no session.
    #[default]
    Idle,
    /// Looking for a usable token, possibly starting authorization.
    CheckingAuth,
    /// Racing direct candidates.
    Racing,
    /// Racing candidates routed through the relay.
    RacingViaProxy,
    /// A session is live.
    Connected {
        /// Winning transport.
        kind: TransportKind,
        /// Resolved target URL.
        url: Url,
        /// Whether the session goes through the relay.
        via_relay: bool,
    },
    /// The user was sent to the authorization server.
    AwaitingAuthorization,
    /// Authorization needs a client id the operator must configure.
    NeedsManualConfiguration,
    /// The attempt was cancelled.
    Aborted,
    /// The attempt failed.
    Failed(String),
}

/// A connect request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    /// Host or URL as typed by the user.
    pub target: String,
    /// Authorize with OAuth when no token is cached.
    pub oauth: bool,
}

impl ConnectRequest {
    /// Plain connect without OAuth.
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            oauth: false,
        }
    }

    /// Connect with OAuth.
    pub fn with_oauth(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            oauth: true,
        }
    }
}

/// Summary of an established session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    /// Target as typed.
    pub target: String,
    /// Winning transport.
    pub kind: TransportKind,
    /// Resolved target URL.
    pub url: Url,
    /// Whether the session goes through the relay.
    pub via_relay: bool,
    /// Protocol version the server answered with.
    pub protocol_version: String,
    /// Server name from `initialize`, if reported.
    pub server_name: Option<String>,
}

impl SessionInfo {
    fn from_session(target: &str, session: &Session) -> Self {
        let info = session.server_info();
        Self {
            target: target.to_string(),
            kind: session.kind(),
            url: session.url().clone(),
            via_relay: session.via_relay(),
            protocol_version: info.protocol_version.clone(),
            server_name: info.server_info.as_ref().map(|s| s.name.clone()),
        }
    }
}

/// Non-error outcomes of [`Orchestrator::connect`].
#[derive(Debug, Clone)]
pub enum ConnectOutcome {
    /// A session is live.
    Connected(SessionInfo),
    /// The caller must send the user to `authorization_url` and later call
    /// [`Orchestrator::resume_authorization`].
    RedirectForAuthorization {
        /// Authorization request URL.
        authorization_url: Url,
        /// State nonce of the pending handoff.
        state: String,
    },
    /// OAuth is required but no client id can be obtained automatically.
    NeedsManualConfiguration {
        /// Host a static client id must be configured for.
        host_key: ServerHostKey,
        /// Explanation.
        reason: String,
    },
}

/// Timing and naming settings.
#[derive(Debug, Clone)]
pub struct NegotiationSettings {
    /// Deadline of the race phase.
    pub timeout: Duration,
    /// Pause between tearing a session down and starting the next attempt.
    pub settle_delay: Duration,
    /// Transport path segments.
    pub segments: PathSegments,
    /// Protocol version offered.
    pub protocol_version: String,
    /// Client name offered in `initialize`.
    pub client_name: String,
}

impl NegotiationSettings {
    /// Settings from the `negotiation` config section.
    pub fn from_config(config: &Config) -> Self {
        let n = &config.negotiation;
        Self {
            timeout: n.timeout(),
            settle_delay: n.settle_delay(),
            segments: PathSegments::new(&n.streaming_path, &n.legacy_path),
            protocol_version: n.protocol_version.clone(),
            client_name: n.client_name.clone(),
        }
    }
}

enum AuthCheck {
    Proceed(Option<String>),
    Halt(ConnectOutcome),
}

/// Drives connection attempts and owns the resulting session.
#[derive(Debug)]
pub struct Orchestrator {
    settings: NegotiationSettings,
    coordinator: RaceCoordinator,
    oauth: OAuthFlow,
    relay: Option<Arc<RelayRoute>>,
    recent: RecentTargets,
    state: watch::Sender<NegotiationState>,
    session: tokio::sync::Mutex<Option<(SessionInfo, Session)>>,
    attempt: Mutex<Option<CancellationToken>>,
}

impl Orchestrator {
    /// Assembles an orchestrator from its parts.
    pub fn new(
        settings: NegotiationSettings,
        coordinator: RaceCoordinator,
        oauth: OAuthFlow,
        relay: Option<RelayRoute>,
        recent: RecentTargets,
    ) -> Self {
        let (state, _) = watch::channel(NegotiationState::Idle);
        Self {
            settings,
            coordinator,
            oauth,
            relay: relay.map(Arc::new),
            recent,
            state,
            session: tokio::sync::Mutex::new(None),
            attempt: Mutex::new(None),
        }
    }

    /// Builds the production wiring described by `config`.
    ///
    /// # Errors
    ///
    /// Returns an error when the HTTP client cannot be built, the relay URL
    /// does not parse, or the recent list capacity is zero.
    pub fn from_config(config: &Config) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()?;

        let n = &config.negotiation;
        let connector: Arc<dyn Connector> =
            Arc::new(HttpConnector::new(http.clone(), &n.origin, n.close_timeout()));
        let coordinator = RaceCoordinator::new(connector, n.grace_period(), n.close_timeout());

        let storage = &config.storage;
        let oauth = OAuthFlow::new(
            http.clone(),
            OAuthFlowConfig {
                client_name: config.oauth.client_name.clone(),
                redirect_uri: config.oauth.redirect_uri.clone(),
                static_clients: config.oauth.static_clients.clone(),
            },
            OAuthDiscovery::new(http, &config.oauth.default_scope),
            RegistrationCache::new(KeyedCache::new(store::open(storage, "registrations", true))),
            HandoffStore::new(KeyedCache::new(store::open(storage, "handoffs", true))),
            TokenCache::new(KeyedCache::new(store::open(storage, "tokens", true))),
        );

        let relay = match (&config.relay.url, &config.relay.credential) {
            (Some(url), Some(credential)) => {
                let base = Url::parse(url)
                    .map_err(|e| NegotiatorError::Config(format!("invalid relay URL: {}", e)))?;
                Some(RelayRoute::new(base, credential.clone()))
            }
            (Some(_), None) => {
                tracing::warn!("Relay URL configured without a credential; relay disabled");
                None
            }
            _ => None,
        };

        let recent = RecentTargets::new(
            store::open(storage, "recent", false),
            storage.recent_capacity,
        )?;

        Ok(Self::new(
            NegotiationSettings::from_config(config),
            coordinator,
            oauth,
            relay,
            recent,
        ))
    }

    /// Current state.
    pub fn state(&self) -> NegotiationState {
        self.state.borrow().clone()
    }

    /// Receiver observing every state change.
    pub fn subscribe(&self) -> watch::Receiver<NegotiationState> {
        self.state.subscribe()
    }

    /// Recent-target list.
    pub fn recent(&self) -> &RecentTargets {
        &self.recent
    }

    /// Authorization flow, for callers that drive begin/resume directly.
    pub fn oauth(&self) -> &OAuthFlow {
        &self.oauth
    }

    /// Summary of the live session, if any.
    pub async fn session(&self) -> Option<SessionInfo> {
        self.session.lock().await.as_ref().map(|(info, _)| info.clone())
    }

    fn set_state(&self, next: NegotiationState) {
        tracing::info!(state = ?next, "Negotiation state changed");
        self.state.send_replace(next);
    }

    /// Negotiates a session for `request`.
    ///
    /// An existing session is disconnected first.
    ///
    /// # Errors
    ///
    /// - [`NegotiatorError::Cancelled`] after [`Orchestrator::abort`].
    /// - [`NegotiatorError::Timeout`] when the race phase exceeds its
    ///   deadline.
    /// - [`NegotiatorError::CrossOrigin`] when candidates failed opaquely
    ///   and no relay is configured.
    /// - [`NegotiatorError::Authorization`] when the server rejected the
    ///   request with 401/403.
    /// - [`NegotiatorError::CompositeConnection`] for any other exhausted
    ///   race.
    /// - OAuth errors from discovery, registration or refresh.
    pub async fn connect(&self, request: ConnectRequest) -> Result<ConnectOutcome> {
        let mut slot = self.session.lock().await;
        // Registered before teardown so an abort during close or settle lands.
        let attempt = CancellationToken::new();
        self.replace_attempt(Some(attempt.clone()));

        if let Some((_, previous)) = slot.take() {
            tracing::info!(url = %previous.url(), "Disconnecting current session before reconnecting");
            previous.close().await;
            self.set_state(NegotiationState::Idle);
            tokio::select! {
                biased;
                _ = attempt.cancelled() => {}
                _ = tokio::time::sleep(self.settings.settle_delay) => {}
            }
        }

        let result = if attempt.is_cancelled() {
            Err(NegotiatorError::Cancelled.into())
        } else {
            self.run_attempt(&request, &attempt).await
        };
        self.replace_attempt(None);

        match result {
            Ok(Attempted::Connected(session)) => {
                let info = SessionInfo::from_session(request.target.trim(), &session);
                if let Err(e) = self.recent.record(&request.target) {
                    tracing::warn!(error = %e, "Failed to record recent target");
                }
                self.set_state(NegotiationState::Connected {
                    kind: info.kind,
                    url: info.url.clone(),
                    via_relay: info.via_relay,
                });
                *slot = Some((info.clone(), session));
                Ok(ConnectOutcome::Connected(info))
            }
            Ok(Attempted::Halted(outcome)) => {
                self.set_state(match &outcome {
                    ConnectOutcome::NeedsManualConfiguration { .. } => {
                        NegotiationState::NeedsManualConfiguration
                    }
                    _ => NegotiationState::AwaitingAuthorization,
                });
                Ok(outcome)
            }
            Err(e) => {
                if matches!(
                    e.downcast_ref::<NegotiatorError>(),
                    Some(NegotiatorError::Cancelled)
                ) {
                    self.set_state(NegotiationState::Aborted);
                } else {
                    self.set_state(NegotiationState::Failed(e.to_string()));
                }
                Err(e)
            }
        }
    }

    /// Completes an authorization started by [`Orchestrator::connect`] and
    /// connects to the original target with the new token.
    ///
    /// # Errors
    ///
    /// Authorization errors from the callback or the token exchange, then
    /// any error [`Orchestrator::connect`] returns.
    pub async fn resume_authorization(
        &self,
        callback: &AuthorizationCallback,
    ) -> Result<ConnectOutcome> {
        let resumed = match self.oauth.resume(callback).await {
            Ok(resumed) => resumed,
            Err(e) => {
                self.set_state(NegotiationState::Failed(e.to_string()));
                return Err(e);
            }
        };
        tracing::info!(host = %resumed.host_key, "Authorization completed, reconnecting");
        self.connect(ConnectRequest::with_oauth(resumed.target)).await
    }

    /// Closes the session, if any, and returns to `Idle`.
    ///
    /// Calling it with nothing connected is a no-op.
    pub async fn disconnect(&self) {
        let mut slot = self.session.lock().await;
        if let Some((_, session)) = slot.take() {
            session.close().await;
            tracing::info!(url = %session.url(), "Disconnected");
        }
        if *self.state.borrow() != NegotiationState::Idle {
            self.set_state(NegotiationState::Idle);
        }
    }

    /// Cancels the attempt in progress. Returns `false` when none is
    /// running.
    pub fn abort(&self) -> bool {
        let guard = self
            .attempt
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match guard.as_ref() {
            Some(token) => {
                tracing::info!("Aborting connection attempt");
                token.cancel();
                true
            }
            None => false,
        }
    }

    fn replace_attempt(&self, token: Option<CancellationToken>) {
        let mut guard = self
            .attempt
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = token;
    }

    async fn run_attempt(
        &self,
        request: &ConnectRequest,
        attempt: &CancellationToken,
    ) -> Result<Attempted> {
        let target = ConnectionTarget::parse(&request.target, self.settings.segments.clone())?;
        let host_key = target.host_key()?;

        self.set_state(NegotiationState::CheckingAuth);
        let bearer = match self.check_auth(&target, &host_key, request.oauth, attempt).await? {
            AuthCheck::Proceed(bearer) => bearer,
            AuthCheck::Halt(outcome) => return Ok(Attempted::Halted(outcome)),
        };

        let ctx = AttemptContext::new(
            bearer,
            &self.settings.protocol_version,
            &self.settings.client_name,
        );
        let deadline = Instant::now() + self.settings.timeout;
        let plan = target.plan();

        self.set_state(NegotiationState::Racing);
        let composite = match self.race_until(plan.clone(), &ctx, attempt, deadline).await {
            Ok(session) => return Ok(Attempted::Connected(session)),
            Err(e) => match e.downcast::<NegotiatorError>() {
                Ok(NegotiatorError::CompositeConnection(composite)) => composite,
                Ok(other) => return Err(other.into()),
                Err(e) => return Err(e),
            },
        };

        if composite.is_cross_origin_candidate() {
            if let Some(relay) = &self.relay {
                tracing::info!(relay = %relay.base(), "Direct race failed opaquely, retrying via relay");
                self.set_state(NegotiationState::RacingViaProxy);
                let relayed = CandidatePlan {
                    candidates: plan
                        .candidates
                        .iter()
                        .map(|c| c.via(Arc::clone(relay)))
                        .collect(),
                    grace_len: plan.grace_len,
                };
                return match self.race_until(relayed, &ctx, attempt, deadline).await {
                    Ok(session) => Ok(Attempted::Connected(session)),
                    Err(e) => Err(self.classify(e, &host_key, &ctx)),
                };
            }
        }

        Err(self.classify(
            NegotiatorError::CompositeConnection(composite).into(),
            &host_key,
            &ctx,
        ))
    }

    async fn check_auth(
        &self,
        target: &ConnectionTarget,
        host_key: &ServerHostKey,
        oauth: bool,
        attempt: &CancellationToken,
    ) -> Result<AuthCheck> {
        if let Some(token) = self.oauth.tokens().load_valid(host_key)? {
            tracing::debug!(host = %host_key, "Using cached token");
            return Ok(AuthCheck::Proceed(Some(token.access_token)));
        }
        if !oauth {
            return Ok(AuthCheck::Proceed(None));
        }

        let refreshed = tokio::select! {
            biased;
            _ = attempt.cancelled() => return Err(NegotiatorError::Cancelled.into()),
            r = self.oauth.refresh(target.url()) => r,
        };
        match refreshed {
            Ok(Some(token)) => {
                tracing::info!(host = %host_key, "Refreshed access token");
                return Ok(AuthCheck::Proceed(Some(token.access_token)));
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(host = %host_key, error = %e, "Token refresh failed, starting authorization"),
        }

        let begun = tokio::select! {
            biased;
            _ = attempt.cancelled() => return Err(NegotiatorError::Cancelled.into()),
            r = self.oauth.begin(target.url(), target.raw()) => r?,
        };
        Ok(AuthCheck::Halt(match begun {
            BeginOutcome::Redirect {
                authorization_url,
                state,
            } => ConnectOutcome::RedirectForAuthorization {
                authorization_url,
                state,
            },
            BeginOutcome::NeedsManualConfiguration { host_key, reason } => {
                ConnectOutcome::NeedsManualConfiguration { host_key, reason }
            }
        }))
    }

    /// Runs one race under the race-phase deadline.
    async fn race_until(
        &self,
        plan: CandidatePlan,
        ctx: &AttemptContext,
        attempt: &CancellationToken,
        deadline: Instant,
    ) -> Result<Session> {
        let signal = attempt.child_token();
        let race = self.coordinator.race(plan, ctx, &signal);
        tokio::pin!(race);

        tokio::select! {
            biased;
            result = &mut race => result,
            _ = tokio::time::sleep_until(deadline) => {
                signal.cancel();
                if let Ok(session) = race.await {
                    session.close().await;
                }
                Err(NegotiatorError::Timeout {
                    seconds: self.settings.timeout.as_secs(),
                }
                .into())
            }
        }
    }

    /// Maps an exhausted race onto the error the user can act on.
    fn classify(
        &self,
        err: anyhow::Error,
        host_key: &ServerHostKey,
        ctx: &AttemptContext,
    ) -> anyhow::Error {
        let Some(NegotiatorError::CompositeConnection(composite)) =
            err.downcast_ref::<NegotiatorError>()
        else {
            return err;
        };

        if composite.requires_authorization() {
            if ctx.bearer.is_some() {
                if let Err(e) = self.oauth.tokens().forget(host_key) {
                    tracing::warn!(error = %e, "Failed to drop rejected token");
                }
            }
            return NegotiatorError::Authorization(format!(
                "{} rejected the request; authorize with OAuth and retry\n{}",
                host_key, composite
            ))
            .into();
        }

        if composite.is_cross_origin_candidate() && !any_relayed(composite) {
            if let Some(first) = composite.attempts.iter().find(|a| a.reason.is_opaque()) {
                return NegotiatorError::CrossOrigin {
                    message: composite.to_string(),
                    diagnostic: curl_diagnostic(first.kind, &first.url, ctx.bearer.is_some()),
                }
                .into();
            }
        }

        err
    }
}

fn any_relayed(composite: &CompositeFailure) -> bool {
    composite.attempts.iter().any(|a| a.via_relay)
}

enum Attempted {
    Connected(Session),
    Halted(ConnectOutcome),
}
