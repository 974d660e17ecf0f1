//! Candidate transports and the seams the race coordinator drives them through
//!
//! Two wire transports exist:
//!
//! - [`streaming`] -- JSON-RPC over `POST`, answered with JSON or an event
//!   stream.
//! - [`legacy`] -- a long-lived `GET` event stream that announces a
//!   separate message endpoint.
//!
//! Both are reached through the [`Connector`] trait so the race coordinator
//! can be exercised with in-process fakes. A successful connect yields a
//! boxed [`SessionHandle`] that must be closed exactly when it is not the
//! race winner.
//!
//! Header construction is centralized in [`build_headers`]; adapters never
//! add the protocol-version header on their own.

pub mod legacy;
pub mod probe;
pub mod relay;
pub mod sse;
pub mod streaming;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, AUTHORIZATION};
use url::Url;

use crate::error::FailureReason;
use crate::mcp::types::{InitializeResult, PROTOCOL_VERSION_HEADER};

pub use probe::{CapabilityProber, ProbeCache, ProbeResult};
pub use relay::RelayRoute;

/// Accept value sent on every handshake request.
pub const DUAL_ACCEPT: &str = "application/json, text/event-stream";

// ---------------------------------------------------------------------------
// Candidate description
// ---------------------------------------------------------------------------

/// Wire transport of a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// Bidirectional streaming over `POST`.
    Streaming,
    /// Legacy server-push event stream.
    LegacyEvents,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Streaming => f.write_str("streaming"),
            TransportKind::LegacyEvents => f.write_str("legacy"),
        }
    }
}

/// Trailing-slash variant of a candidate path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PathVariant {
    /// `.../mcp/`
    Slash,
    /// `.../mcp`
    NoSlash,
}

/// How a candidate reaches its server.
#[derive(Debug, Clone, Default)]
pub enum Route {
    /// Straight to the target.
    #[default]
    Direct,
    /// Through a relay that forwards to `?target=<url>`.
    Relay(Arc<RelayRoute>),
}

impl Route {
    /// URL a request for `target` is actually sent to.
    pub fn request_url(&self, target: &Url) -> Url {
        match self {
            Route::Direct => target.clone(),
            Route::Relay(relay) => relay.rewrite(target),
        }
    }

    /// Returns `true` for relayed routes.
    pub fn is_relay(&self) -> bool {
        matches!(self, Route::Relay(_))
    }
}

/// One speculative connection attempt.
#[derive(Debug, Clone)]
pub struct Candidate {
    /// Transport to speak.
    pub kind: TransportKind,
    /// Path variant the URL was built from.
    pub variant: PathVariant,
    /// Target URL (before any relay rewrite).
    pub url: Url,
    /// Route to the target.
    pub route: Route,
}

impl Candidate {
    /// Creates a direct candidate.
    pub fn direct(kind: TransportKind, variant: PathVariant, url: Url) -> Self {
        Self {
            kind,
            variant,
            url,
            route: Route::Direct,
        }
    }

    /// Same candidate routed through `relay`.
    pub fn via(&self, relay: Arc<RelayRoute>) -> Self {
        Self {
            route: Route::Relay(relay),
            ..self.clone()
        }
    }
}

impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.url)?;
        if self.route.is_relay() {
            f.write_str(" (via relay)")?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Attempt context
// ---------------------------------------------------------------------------

/// Per-attempt inputs shared by every candidate of a race.
#[derive(Debug, Clone)]
pub struct AttemptContext {
    /// Target server bearer token, if authorization succeeded earlier.
    pub bearer: Option<String>,
    /// Probe results memoized for this attempt only.
    pub probes: Arc<ProbeCache>,
    /// Protocol version offered in `initialize` and the version header.
    pub protocol_version: String,
    /// Client name offered in `initialize`.
    pub client_name: String,
}

impl AttemptContext {
    /// Creates a context with a fresh probe cache.
    pub fn new(bearer: Option<String>, protocol_version: &str, client_name: &str) -> Self {
        Self {
            bearer,
            probes: Arc::new(ProbeCache::default()),
            protocol_version: protocol_version.to_string(),
            client_name: client_name.to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// An established, initialized connection.
#[async_trait::async_trait]
pub trait SessionHandle: Send + Sync + fmt::Debug {
    /// Transport that established the session.
    fn kind(&self) -> TransportKind;

    /// Target URL the session was resolved to.
    fn url(&self) -> &Url;

    /// `initialize` result returned by the server.
    fn server_info(&self) -> &InitializeResult;

    /// Closes the connection. Calling it more than once is a no-op.
    async fn close(&self);
}

/// Opens one candidate connection.
#[async_trait::async_trait]
pub trait Connector: Send + Sync + fmt::Debug {
    /// Runs the candidate's handshake to completion.
    ///
    /// Failures are reported as a [`FailureReason`] so the race coordinator
    /// can aggregate them.
    async fn connect(
        &self,
        candidate: &Candidate,
        ctx: &AttemptContext,
    ) -> std::result::Result<Box<dyn SessionHandle>, FailureReason>;
}

// ---------------------------------------------------------------------------
// HttpConnector
// ---------------------------------------------------------------------------

/// Real [`Connector`] dispatching to the streaming and legacy adapters.
#[derive(Debug, Clone)]
pub struct HttpConnector {
    http: reqwest::Client,
    prober: CapabilityProber,
    close_timeout: Duration,
}

impl HttpConnector {
    /// Creates a connector sharing `http` with the prober.
    pub fn new(http: reqwest::Client, origin: &str, close_timeout: Duration) -> Self {
        Self {
            prober: CapabilityProber::new(http.clone(), origin),
            http,
            close_timeout,
        }
    }
}

#[async_trait::async_trait]
impl Connector for HttpConnector {
    async fn connect(
        &self,
        candidate: &Candidate,
        ctx: &AttemptContext,
    ) -> std::result::Result<Box<dyn SessionHandle>, FailureReason> {
        match candidate.kind {
            TransportKind::Streaming => {
                let handle = streaming::StreamingAdapter::new(
                    self.http.clone(),
                    self.prober.clone(),
                    self.close_timeout,
                )
                .connect(candidate, ctx)
                .await?;
                Ok(Box::new(handle))
            }
            TransportKind::LegacyEvents => {
                let handle = legacy::LegacyAdapter::new(self.http.clone(), self.prober.clone())
                    .connect(candidate, ctx)
                    .await?;
                Ok(Box::new(handle))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Header construction
// ---------------------------------------------------------------------------

/// Builds the handshake headers for one request.
///
/// - `Accept` always asks for both JSON and event streams.
/// - The protocol-version header is present only when `probe` reported
///   support.
/// - `Authorization: Bearer` is present only when `bearer` is supplied.
///
/// # Examples
///
/// ```
/// use mcp_negotiator::mcp::transport::{build_headers, ProbeResult};
///
/// let probe = ProbeResult { accepts_version_header: false, allowed_origin: None };
/// let headers = build_headers(&probe, "2025-03-26", Some("tok"));
/// assert!(headers.get("mcp-protocol-version").is_none());
/// assert_eq!(headers["authorization"], "Bearer tok");
/// ```
pub fn build_headers(probe: &ProbeResult, protocol_version: &str, bearer: Option<&str>) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT, HeaderValue::from_static(DUAL_ACCEPT));

    if probe.accepts_version_header {
        if let Ok(value) = HeaderValue::from_str(protocol_version) {
            headers.insert(HeaderName::from_static(PROTOCOL_VERSION_HEADER), value);
        }
    }

    if let Some(token) = bearer {
        match HeaderValue::from_str(&format!("Bearer {}", token)) {
            Ok(mut value) => {
                value.set_sensitive(true);
                headers.insert(AUTHORIZATION, value);
            }
            Err(_) => tracing::warn!("Bearer token contains invalid header characters; omitted"),
        }
    }

    headers
}

/// Bearer presented on a request over `route`.
///
/// A relayed request carries the relay's own credential, never the target
/// server's token.
pub(crate) fn route_bearer<'a>(route: &'a Route, ctx: &'a AttemptContext) -> Option<&'a str> {
    match route {
        Route::Direct => ctx.bearer.as_deref(),
        Route::Relay(relay) => Some(relay.credential()),
    }
}
