//! Error types for the negotiator
//!
//! This module defines the error taxonomy used throughout the crate, using
//! `thiserror` for ergonomic error handling. Candidate-level failures inside
//! a connection race are modelled separately by [`FailureReason`] and only
//! cross the race boundary aggregated into a [`CompositeFailure`].

use std::fmt;

use thiserror::Error;
use url::Url;

use crate::mcp::transport::TransportKind;

/// Main error type for negotiation operations
///
/// Each variant corresponds to a distinct user action: retry through a
/// relay, re-authenticate, fix configuration, or simply retry later.
#[derive(Error, Debug)]
pub enum NegotiatorError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// The user-supplied target could not be turned into a URL
    #[error("Invalid target: {0}")]
    InvalidTarget(String),

    /// Browser-style cross-origin rejection (or an opaque network failure
    /// that cannot be told apart from one)
    #[error("Cross-origin failure: {message}\n\nTry this request outside the browser to see the server's CORS policy:\n{diagnostic}")]
    CrossOrigin {
        /// Summary of the failed attempts
        message: String,
        /// A runnable request reproducing the preflight
        diagnostic: String,
    },

    /// Explicit 401/403 from a target or authorization server, or a
    /// rejected token exchange
    #[error("Authorization error: {0}")]
    Authorization(String),

    /// No authorization metadata could be located for the server
    #[error("Discovery error: {0}")]
    Discovery(String),

    /// OAuth is required but no client registration mechanism is available
    #[error("Manual configuration required: {0}")]
    NeedsManualConfiguration(String),

    /// The attempt was cancelled by the user
    #[error("Connection attempt cancelled")]
    Cancelled,

    /// The race phase exceeded its deadline
    #[error("Connection attempt timed out after {seconds}s")]
    Timeout {
        /// Deadline that elapsed
        seconds: u64,
    },

    /// Every race candidate failed
    #[error("{0}")]
    CompositeConnection(CompositeFailure),

    /// Transport-level protocol errors outside of a race
    #[error("Transport error: {0}")]
    Transport(String),

    /// Persistent store errors
    #[error("Storage error: {0}")]
    Storage(String),

    /// The operating system random source is unavailable
    #[error("Secure random source unavailable: {0}")]
    Rng(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML parsing errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// HTTP request errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Keyring/credential storage errors
    #[error("Keyring error: {0}")]
    Keyring(#[from] keyring::Error),
}

/// Result type alias for negotiator operations
///
/// Uses `anyhow::Error` so callers can attach context; the concrete
/// [`NegotiatorError`] is recovered with `downcast_ref` where the variant
/// matters.
pub type Result<T> = anyhow::Result<T>;

// ---------------------------------------------------------------------------
// Candidate failures
// ---------------------------------------------------------------------------

/// Why a single race candidate failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// No HTTP status was received. Indistinguishable from a cross-origin
    /// rejection on the client side.
    Network(String),
    /// The server answered with a non-success status.
    HttpStatus(u16),
    /// The server answered 401 or 403.
    Unauthorized(u16),
    /// The server answered but not with a usable handshake.
    Protocol(String),
    /// The candidate was stopped because the race was decided or cancelled.
    Cancelled,
    /// The candidate task ended abnormally.
    Aborted(String),
}

impl FailureReason {
    /// Returns `true` when this failure is an opaque network error.
    pub fn is_opaque(&self) -> bool {
        matches!(self, FailureReason::Network(_))
    }

    /// Builds a reason from a `reqwest` error, keeping status codes when the
    /// server actually answered.
    ///
    /// The request URL is stripped from the message since legacy candidates
    /// carry their bearer token in the query string.
    pub fn from_reqwest(err: reqwest::Error) -> Self {
        let err = err.without_url();
        match err.status() {
            Some(status) if status.as_u16() == 401 || status.as_u16() == 403 => {
                FailureReason::Unauthorized(status.as_u16())
            }
            Some(status) => FailureReason::HttpStatus(status.as_u16()),
            None if err.is_decode() => FailureReason::Protocol(err.to_string()),
            None => FailureReason::Network(err.to_string()),
        }
    }

    /// Builds a reason from a response status.
    pub fn from_status(status: reqwest::StatusCode) -> Self {
        match status.as_u16() {
            code @ (401 | 403) => FailureReason::Unauthorized(code),
            code => FailureReason::HttpStatus(code),
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Network(msg) => write!(f, "network error: {}", msg),
            FailureReason::HttpStatus(code) => write!(f, "HTTP {}", code),
            FailureReason::Unauthorized(code) => write!(f, "unauthorized (HTTP {})", code),
            FailureReason::Protocol(msg) => write!(f, "protocol error: {}", msg),
            FailureReason::Cancelled => write!(f, "cancelled"),
            FailureReason::Aborted(msg) => write!(f, "aborted: {}", msg),
        }
    }
}

/// One failed candidate inside a composite failure.
#[derive(Debug, Clone)]
pub struct CandidateFailure {
    /// Transport kind the candidate used
    pub kind: TransportKind,
    /// Target URL the candidate tried (before any relay rewrite)
    pub url: Url,
    /// Whether the attempt was routed through the relay
    pub via_relay: bool,
    /// Failure reason
    pub reason: FailureReason,
}

/// Aggregate of every candidate failure in a race.
#[derive(Debug, Clone, Default)]
pub struct CompositeFailure {
    /// Failures in launch order
    pub attempts: Vec<CandidateFailure>,
}

impl CompositeFailure {
    /// Returns `true` when any attempt failed without an HTTP status.
    ///
    /// Such failures are candidates for a relay retry.
    pub fn is_cross_origin_candidate(&self) -> bool {
        self.attempts.iter().any(|a| a.reason.is_opaque())
    }

    /// Returns `true` when any attempt was rejected with 401/403.
    pub fn requires_authorization(&self) -> bool {
        self.attempts
            .iter()
            .any(|a| matches!(a.reason, FailureReason::Unauthorized(_)))
    }
}

impl fmt::Display for CompositeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Unable to connect: all {} candidate(s) failed",
            self.attempts.len()
        )?;
        for attempt in &self.attempts {
            write!(
                f,
                "\n  - {} {}{}: {}",
                attempt.kind,
                attempt.url,
                if attempt.via_relay { " (via relay)" } else { "" },
                attempt.reason
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failure(kind: TransportKind, url: &str, reason: FailureReason) -> CandidateFailure {
        CandidateFailure {
            kind,
            url: Url::parse(url).unwrap(),
            via_relay: false,
            reason,
        }
    }

    #[test]
    fn test_config_error_display() {
        let error = NegotiatorError::Config("invalid format".to_string());
        assert_eq!(error.to_string(), "Configuration error: invalid format");
    }

    #[test]
    fn test_timeout_error_display() {
        let error = NegotiatorError::Timeout { seconds: 30 };
        assert_eq!(error.to_string(), "Connection attempt timed out after 30s");
    }

    #[test]
    fn test_cross_origin_display_includes_diagnostic() {
        let error = NegotiatorError::CrossOrigin {
            message: "blocked".to_string(),
            diagnostic: "curl -i -X OPTIONS 'https://example.com/mcp'".to_string(),
        };
        let msg = error.to_string();
        assert!(msg.contains("blocked"));
        assert!(msg.contains("curl -i -X OPTIONS"));
    }

    #[test]
    fn test_composite_failure_enumerates_every_attempt() {
        let composite = CompositeFailure {
            attempts: vec![
                failure(
                    TransportKind::Streaming,
                    "https://example.com/mcp",
                    FailureReason::HttpStatus(404),
                ),
                failure(
                    TransportKind::LegacyEvents,
                    "https://example.com/sse",
                    FailureReason::Network("connection refused".to_string()),
                ),
            ],
        };
        let msg = NegotiatorError::CompositeConnection(composite).to_string();
        assert!(msg.contains("all 2 candidate(s) failed"));
        assert!(msg.contains("https://example.com/mcp: HTTP 404"));
        assert!(msg.contains("https://example.com/sse: network error: connection refused"));
    }

    #[test]
    fn test_composite_cross_origin_candidate_requires_opaque_failure() {
        let mut composite = CompositeFailure {
            attempts: vec![failure(
                TransportKind::Streaming,
                "https://example.com/mcp",
                FailureReason::HttpStatus(500),
            )],
        };
        assert!(!composite.is_cross_origin_candidate());

        composite.attempts.push(failure(
            TransportKind::LegacyEvents,
            "https://example.com/sse",
            FailureReason::Network("failed to fetch".to_string()),
        ));
        assert!(composite.is_cross_origin_candidate());
    }

    #[test]
    fn test_failure_reason_from_status_maps_auth_codes() {
        assert_eq!(
            FailureReason::from_status(reqwest::StatusCode::UNAUTHORIZED),
            FailureReason::Unauthorized(401)
        );
        assert_eq!(
            FailureReason::from_status(reqwest::StatusCode::FORBIDDEN),
            FailureReason::Unauthorized(403)
        );
        assert_eq!(
            FailureReason::from_status(reqwest::StatusCode::NOT_FOUND),
            FailureReason::HttpStatus(404)
        );
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<NegotiatorError>();
    }
}
