//! Capability probing
//!
//! Before a transport emits any handshake header it asks the
//! [`CapabilityProber`] whether the server accepts the protocol-version
//! header. The probe is a CORS preflight (`OPTIONS`), which is non-mutating
//! and answered by most HTTP stacks without reaching application code.
//!
//! The prober never fails: anything other than an explicit allowance is
//! reported as "not supported" so the caller omits the header.
//!
//! Results are memoized in a [`ProbeCache`] that lives for exactly one
//! connection attempt.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::OnceCell;
use url::Url;

use crate::mcp::types::PROTOCOL_VERSION_HEADER;

/// Upper bound on a single preflight.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Headers asked about in the preflight.
pub const REQUESTED_HEADERS: &str = "content-type, accept, mcp-protocol-version";

/// Outcome of one capability probe.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProbeResult {
    /// The server explicitly allows the protocol-version header.
    pub accepts_version_header: bool,
    /// `Access-Control-Allow-Origin` value, if any.
    pub allowed_origin: Option<String>,
}

/// Issues preflight probes.
#[derive(Debug, Clone)]
pub struct CapabilityProber {
    http: reqwest::Client,
    origin: String,
}

impl CapabilityProber {
    /// Creates a prober presenting `origin` in its preflights.
    pub fn new(http: reqwest::Client, origin: &str) -> Self {
        Self {
            http,
            origin: origin.to_string(),
        }
    }

    /// Probes `url`.
    ///
    /// Only the host and path are logged, since legacy stream URLs may carry
    /// a token in their query.
    pub async fn probe(&self, url: &Url) -> ProbeResult {
        let response = self
            .http
            .request(reqwest::Method::OPTIONS, url.clone())
            .header("Origin", &self.origin)
            .header("Access-Control-Request-Method", "POST")
            .header("Access-Control-Request-Headers", REQUESTED_HEADERS)
            .timeout(PROBE_TIMEOUT)
            .send()
            .await;

        let response = match response {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(host = url.host_str(), path = url.path(), error = %e.without_url(), "Capability probe failed");
                return ProbeResult::default();
            }
        };

        let headers = response.headers();
        let allowed_origin = headers
            .get("access-control-allow-origin")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        if !response.status().is_success() {
            tracing::debug!(host = url.host_str(), path = url.path(), status = %response.status(), "Capability probe rejected");
            return ProbeResult {
                accepts_version_header: false,
                allowed_origin,
            };
        }

        let accepts_version_header = headers
            .get_all("access-control-allow-headers")
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .map(str::trim)
            .any(|h| h == "*" || h.eq_ignore_ascii_case(PROTOCOL_VERSION_HEADER));

        tracing::debug!(host = url.host_str(), path = url.path(), accepts_version_header, "Capability probe completed");
        ProbeResult {
            accepts_version_header,
            allowed_origin,
        }
    }
}

/// Probe results memoized per URL for one connection attempt.
///
/// Concurrent callers for the same URL share a single in-flight probe.
#[derive(Debug, Default)]
pub struct ProbeCache {
    cells: Mutex<HashMap<String, Arc<OnceCell<ProbeResult>>>>,
}

impl ProbeCache {
    /// Returns the memoized result for `url`, probing on first use.
    pub async fn get_or_probe(&self, prober: &CapabilityProber, url: &Url) -> ProbeResult {
        let cell = {
            let mut cells = self
                .cells
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            Arc::clone(cells.entry(url.to_string()).or_default())
        };
        cell.get_or_init(|| prober.probe(url)).await.clone()
    }

    /// Number of URLs probed so far.
    pub fn len(&self) -> usize {
        self.cells
            .lock()
            .map(|cells| cells.len())
            .unwrap_or_default()
    }

    /// Returns `true` when nothing has been probed.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
