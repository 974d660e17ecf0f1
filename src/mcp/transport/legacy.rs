//! Legacy event-stream transport adapter
//!
//! The session starts with a long-lived `GET` that must answer
//! `text/event-stream`. The server's first `endpoint` event names the URL
//! that JSON-RPC messages are `POST`ed to; responses come back as `message`
//! events on the original stream.
//!
//! The initiating `GET` carries no custom headers. Credentials travel as an
//! `auth=<token>` query parameter instead: the target server's token on a
//! direct stream, the relay credential on a relayed one. A relayed `target`
//! is the candidate URL verbatim.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, CONTENT_TYPE};
use tokio::sync::mpsc;
use url::Url;

use crate::error::FailureReason;
use crate::mcp::transport::sse::{discard_events, spawn_reader, AbortOnDrop, SseEvent};
use crate::mcp::transport::{
    build_headers, route_bearer, AttemptContext, Candidate, CapabilityProber, Route,
    SessionHandle, TransportKind,
};
use crate::mcp::types::{
    initialize_request, initialized_notification, parse_initialize_response, InitializeResult,
};

/// Query parameter carrying the bearer token on the initiating request.
pub const AUTH_PARAM: &str = "auth";

/// Event announcing the message endpoint.
pub const ENDPOINT_EVENT: &str = "endpoint";

/// Appends `auth=<token>` to `url` when a token is supplied.
///
/// # Examples
///
/// ```
/// use url::Url;
/// use mcp_negotiator::mcp::transport::legacy::with_auth_param;
///
/// let url = with_auth_param(&Url::parse("https://example.com/sse").unwrap(), Some("t"));
/// assert_eq!(url.as_str(), "https://example.com/sse?auth=t");
/// ```
pub fn with_auth_param(url: &Url, token: Option<&str>) -> Url {
    let mut url = url.clone();
    if let Some(token) = token {
        url.query_pairs_mut().append_pair(AUTH_PARAM, token);
    }
    url
}

/// Opens legacy sessions.
#[derive(Debug, Clone)]
pub struct LegacyAdapter {
    http: reqwest::Client,
    prober: CapabilityProber,
}

impl LegacyAdapter {
    /// Creates an adapter.
    pub fn new(http: reqwest::Client, prober: CapabilityProber) -> Self {
        Self { http, prober }
    }

    /// URL the initiating `GET` is sent to.
    fn stream_url(candidate: &Candidate, ctx: &AttemptContext) -> Url {
        match &candidate.route {
            Route::Direct => with_auth_param(&candidate.url, ctx.bearer.as_deref()),
            Route::Relay(relay) => {
                with_auth_param(&relay.rewrite(&candidate.url), Some(relay.credential()))
            }
        }
    }

    /// Runs the handshake for `candidate`.
    ///
    /// # Errors
    ///
    /// Same classification as the streaming adapter. A stream that is not
    /// `text/event-stream`, never announces an endpoint, or ends before the
    /// handshake completes is a [`FailureReason::Protocol`].
    pub async fn connect(
        &self,
        candidate: &Candidate,
        ctx: &AttemptContext,
    ) -> Result<LegacySession, FailureReason> {
        let stream_url = Self::stream_url(candidate, ctx);
        let probe = ctx.probes.get_or_probe(&self.prober, &stream_url).await;

        tracing::debug!(
            url = %candidate.url,
            relay = candidate.route.is_relay(),
            "Opening legacy event stream"
        );

        let response = self
            .http
            .get(stream_url)
            .header(ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(FailureReason::from_reqwest)?;

        let status = response.status();
        if !status.is_success() {
            return Err(FailureReason::from_status(status));
        }
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_ascii_lowercase();
        if !content_type.contains("text/event-stream") {
            return Err(FailureReason::Protocol(format!(
                "expected text/event-stream, got '{}'",
                content_type
            )));
        }

        let (guard, mut events) = spawn_reader(response.bytes_stream());

        let endpoint = wait_for_endpoint(&mut events).await?;
        let endpoint_url = candidate
            .url
            .join(&endpoint)
            .map_err(|e| FailureReason::Protocol(format!("invalid endpoint event: {}", e)))?;
        let message_url = candidate.route.request_url(&endpoint_url);

        let mut headers = build_headers(
            &probe,
            &ctx.protocol_version,
            route_bearer(&candidate.route, ctx),
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let response = self
            .http
            .post(message_url.clone())
            .headers(headers.clone())
            .body(initialize_request(&ctx.protocol_version, &ctx.client_name))
            .send()
            .await
            .map_err(FailureReason::from_reqwest)?;
        let status = response.status();
        if !status.is_success() {
            return Err(FailureReason::from_status(status));
        }

        // Some servers answer inline instead of on the stream.
        let inline = response
            .text()
            .await
            .ok()
            .and_then(|body| parse_initialize_response(&body).ok().flatten());
        let server_info = match inline {
            Some(result) => result,
            None => wait_for_initialize(&mut events).await?,
        };

        let session = LegacySession {
            http: self.http.clone(),
            url: candidate.url.clone(),
            message_url,
            headers,
            server_info,
            reader: Mutex::new(Some(StreamGuards {
                reader: guard,
                drain: discard_events(events),
            })),
            closed: AtomicBool::new(false),
        };
        session.notify_initialized().await;
        Ok(session)
    }
}

async fn wait_for_endpoint(
    events: &mut mpsc::UnboundedReceiver<SseEvent>,
) -> Result<String, FailureReason> {
    while let Some(event) = events.recv().await {
        if event.event == ENDPOINT_EVENT {
            return Ok(event.data.trim().to_string());
        }
    }
    Err(FailureReason::Protocol(
        "event stream ended without an endpoint event".to_string(),
    ))
}

async fn wait_for_initialize(
    events: &mut mpsc::UnboundedReceiver<SseEvent>,
) -> Result<InitializeResult, FailureReason> {
    while let Some(event) = events.recv().await {
        if event.event != "message" {
            continue;
        }
        if let Some(result) = parse_initialize_response(&event.data).map_err(FailureReason::Protocol)? {
            return Ok(result);
        }
    }
    Err(FailureReason::Protocol(
        "event stream ended before the initialize result".to_string(),
    ))
}

/// Tasks kept alive for a connected session: the stream reader and the
/// drain that discards events nobody asked for.
#[derive(Debug)]
struct StreamGuards {
    reader: AbortOnDrop,
    drain: AbortOnDrop,
}

/// An initialized legacy session. Holds the event stream open until closed.
#[derive(Debug)]
pub struct LegacySession {
    http: reqwest::Client,
    url: Url,
    message_url: Url,
    headers: HeaderMap,
    server_info: InitializeResult,
    reader: Mutex<Option<StreamGuards>>,
    closed: AtomicBool,
}

impl LegacySession {
    /// URL JSON-RPC messages are posted to.
    pub fn message_url(&self) -> &Url {
        &self.message_url
    }

    async fn notify_initialized(&self) {
        let result = self
            .http
            .post(self.message_url.clone())
            .headers(self.headers.clone())
            .body(initialized_notification())
            .send()
            .await;
        if let Err(e) = result {
            tracing::warn!(url = %self.url, error = %e.without_url(), "Initialized notification failed");
        }
    }
}

#[async_trait::async_trait]
impl SessionHandle for LegacySession {
    fn kind(&self) -> TransportKind {
        TransportKind::LegacyEvents
    }

    fn url(&self) -> &Url {
        &self.url
    }

    fn server_info(&self) -> &InitializeResult {
        &self.server_info
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let reader = self
            .reader
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(guards) = reader {
            guards.reader.abort();
            guards.drain.abort();
        }
        tracing::debug!(url = %self.url, "Closed legacy event stream");
    }
}
