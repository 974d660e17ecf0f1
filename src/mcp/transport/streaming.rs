//! Streaming transport adapter
//!
//! The handshake is a `POST` of the `initialize` request. The server may
//! answer with:
//!
//! - `application/json` -- the JSON-RPC response as the body
//! - `text/event-stream` -- an event stream carrying the response
//!
//! An `Mcp-Session-Id` response header, when present, is attached to every
//! later request of the session and is terminated with a `DELETE` on close.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use url::Url;

use crate::error::FailureReason;
use crate::mcp::transport::sse::spawn_reader;
use crate::mcp::transport::{
    build_headers, route_bearer, AttemptContext, Candidate, CapabilityProber, SessionHandle,
    TransportKind,
};
use crate::mcp::types::{
    initialize_request, initialized_notification, parse_initialize_response, InitializeResult,
    SESSION_ID_HEADER,
};

/// Opens streaming sessions.
#[derive(Debug, Clone)]
pub struct StreamingAdapter {
    http: reqwest::Client,
    prober: CapabilityProber,
    close_timeout: Duration,
}

impl StreamingAdapter {
    /// Creates an adapter.
    pub fn new(http: reqwest::Client, prober: CapabilityProber, close_timeout: Duration) -> Self {
        Self {
            http,
            prober,
            close_timeout,
        }
    }

    /// Runs the handshake for `candidate`.
    ///
    /// The probe for the request URL runs before any header is built.
    ///
    /// # Errors
    ///
    /// - [`FailureReason::Network`] when no response was received
    /// - [`FailureReason::Unauthorized`] for 401/403
    /// - [`FailureReason::HttpStatus`] for other error statuses
    /// - [`FailureReason::Protocol`] when the body is not a usable handshake
    pub async fn connect(
        &self,
        candidate: &Candidate,
        ctx: &AttemptContext,
    ) -> Result<StreamingSession, FailureReason> {
        let request_url = candidate.route.request_url(&candidate.url);
        let probe = ctx.probes.get_or_probe(&self.prober, &request_url).await;
        let mut headers = build_headers(
            &probe,
            &ctx.protocol_version,
            route_bearer(&candidate.route, ctx),
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        tracing::debug!(
            url = %candidate.url,
            relay = candidate.route.is_relay(),
            version_header = probe.accepts_version_header,
            "Sending streaming initialize"
        );

        let response = self
            .http
            .post(request_url.clone())
            .headers(headers.clone())
            .body(initialize_request(&ctx.protocol_version, &ctx.client_name))
            .send()
            .await
            .map_err(FailureReason::from_reqwest)?;

        let status = response.status();
        if !status.is_success() {
            return Err(FailureReason::from_status(status));
        }

        let session_id = response
            .headers()
            .get(SESSION_ID_HEADER)
            .cloned();
        if let Some(sid) = &session_id {
            headers.insert(SESSION_ID_HEADER, sid.clone());
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_ascii_lowercase();

        let server_info = if content_type.contains("text/event-stream") {
            read_initialize_from_stream(response).await?
        } else {
            let body = response.text().await.map_err(FailureReason::from_reqwest)?;
            parse_initialize_response(&body)
                .map_err(FailureReason::Protocol)?
                .ok_or_else(|| {
                    FailureReason::Protocol("response does not answer initialize".to_string())
                })?
        };

        let session = StreamingSession {
            http: self.http.clone(),
            url: candidate.url.clone(),
            request_url,
            headers,
            has_session_id: session_id.is_some(),
            server_info,
            close_timeout: self.close_timeout,
            closed: AtomicBool::new(false),
        };
        session.notify_initialized().await;
        Ok(session)
    }
}

/// Waits for the `initialize` answer on an event-stream response body.
async fn read_initialize_from_stream(
    response: reqwest::Response,
) -> Result<InitializeResult, FailureReason> {
    let (_guard, mut events) = spawn_reader(response.bytes_stream());
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

/// An initialized streaming session.
#[derive(Debug)]
pub struct StreamingSession {
    http: reqwest::Client,
    url: Url,
    request_url: Url,
    headers: HeaderMap,
    has_session_id: bool,
    server_info: InitializeResult,
    close_timeout: Duration,
    closed: AtomicBool,
}

impl StreamingSession {
    async fn notify_initialized(&self) {
        let result = self
            .http
            .post(self.request_url.clone())
            .headers(self.headers.clone())
            .body(initialized_notification())
            .send()
            .await;
        match result {
            Ok(resp) if resp.status().is_success() => {}
            Ok(resp) => {
                tracing::warn!(url = %self.url, status = %resp.status(), "Initialized notification rejected")
            }
            Err(e) => {
                tracing::warn!(url = %self.url, error = %e.without_url(), "Initialized notification failed")
            }
        }
    }
}

#[async_trait::async_trait]
impl SessionHandle for StreamingSession {
    fn kind(&self) -> TransportKind {
        TransportKind::Streaming
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
        if !self.has_session_id {
            tracing::debug!(url = %self.url, "Closed streaming session");
            return;
        }

        let result = self
            .http
            .delete(self.request_url.clone())
            .headers(self.headers.clone())
            .timeout(self.close_timeout)
            .send()
            .await;
        match result {
            Ok(resp) => {
                tracing::debug!(url = %self.url, status = %resp.status(), "Terminated streaming session")
            }
            Err(e) => {
                tracing::warn!(url = %self.url, error = %e.without_url(), "Session termination failed")
            }
        }
    }
}
