//! Connection targets and their candidate sets
//!
//! A user may type `example.com`, `example.com/mcp`, `http://host:8080/sse/`
//! or anything in between. [`ConnectionTarget::parse`] normalizes the input
//! (defaulting the scheme to `https`), strips a trailing transport segment
//! from the path and remembers it as a hint. [`ConnectionTarget::plan`]
//! then produces the cross product of transport kinds and trailing-slash
//! variants, hinted candidates first.

use url::Url;

use crate::error::{NegotiatorError, Result};
use crate::mcp::auth::token_store::ServerHostKey;
use crate::mcp::transport::{Candidate, PathVariant, TransportKind};

/// Path segments identifying each transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathSegments {
    /// Segment of the streaming transport (`mcp`).
    pub streaming: String,
    /// Segment of the legacy transport (`sse`).
    pub legacy: String,
}

impl PathSegments {
    /// Creates segments, trimming surrounding slashes.
    pub fn new(streaming: &str, legacy: &str) -> Self {
        Self {
            streaming: streaming.trim_matches('/').to_string(),
            legacy: legacy.trim_matches('/').to_string(),
        }
    }

    fn segment(&self, kind: TransportKind) -> &str {
        match kind {
            TransportKind::Streaming => &self.streaming,
            TransportKind::LegacyEvents => &self.legacy,
        }
    }
}

impl Default for PathSegments {
    fn default() -> Self {
        Self::new("mcp", "sse")
    }
}

/// Ordered candidates for one race.
#[derive(Debug, Clone)]
pub struct CandidatePlan {
    /// Every candidate, highest priority first.
    pub candidates: Vec<Candidate>,
    /// How many leading candidates form the grace phase. Zero means every
    /// candidate starts at once.
    pub grace_len: usize,
}

/// A normalized user-supplied target.
#[derive(Debug, Clone)]
pub struct ConnectionTarget {
    raw: String,
    url: Url,
    base: Url,
    hint: Option<(TransportKind, PathVariant)>,
    segments: PathSegments,
}

impl ConnectionTarget {
    /// Normalizes `raw`.
    ///
    /// # Errors
    ///
    /// Returns [`NegotiatorError::InvalidTarget`] for empty input, unparsable
    /// URLs, schemes other than http(s), and URLs without a host.
    ///
    /// # Examples
    ///
    /// ```
    /// use mcp_negotiator::negotiation::target::{ConnectionTarget, PathSegments};
    /// use mcp_negotiator::mcp::transport::TransportKind;
    ///
    /// let target = ConnectionTarget::parse("example.com/api/mcp", PathSegments::default()).unwrap();
    /// assert_eq!(target.url().as_str(), "https://example.com/api/mcp");
    /// assert_eq!(target.hint(), Some(TransportKind::Streaming));
    /// ```
    pub fn parse(raw: &str, segments: PathSegments) -> Result<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(NegotiatorError::InvalidTarget("target is empty".to_string()).into());
        }

        let with_scheme = if trimmed.contains("://") {
            trimmed.to_string()
        } else {
            format!("https://{}", trimmed)
        };

        let mut url = Url::parse(&with_scheme)
            .map_err(|e| NegotiatorError::InvalidTarget(format!("{}: {}", trimmed, e)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(NegotiatorError::InvalidTarget(format!(
                "unsupported scheme '{}'",
                url.scheme()
            ))
            .into());
        }
        if url.host_str().map_or(true, str::is_empty) {
            return Err(NegotiatorError::InvalidTarget(format!("{} has no host", trimmed)).into());
        }
        url.set_fragment(None);

        let path = url.path();
        let variant = if path.len() > 1 && path.ends_with('/') {
            PathVariant::Slash
        } else {
            PathVariant::NoSlash
        };
        let trimmed_path = path.trim_end_matches('/');
        let (last, parent) = match trimmed_path.rfind('/') {
            Some(idx) => (&trimmed_path[idx + 1..], &trimmed_path[..idx]),
            None => (trimmed_path, ""),
        };

        let hint = [TransportKind::Streaming, TransportKind::LegacyEvents]
            .into_iter()
            .find(|kind| !last.is_empty() && last.eq_ignore_ascii_case(segments.segment(*kind)));

        let mut base = url.clone();
        if hint.is_some() {
            base.set_path(if parent.is_empty() { "/" } else { parent });
        }

        Ok(Self {
            raw: trimmed.to_string(),
            url,
            base,
            hint: hint.map(|kind| (kind, variant)),
            segments,
        })
    }

    /// Input as typed (trimmed).
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Normalized URL.
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// URL with any transport segment removed.
    pub fn base(&self) -> &Url {
        &self.base
    }

    /// Transport kind implied by the path, if any.
    pub fn hint(&self) -> Option<TransportKind> {
        self.hint.map(|(kind, _)| kind)
    }

    /// Key scoping cached credentials to this server.
    pub fn host_key(&self) -> Result<ServerHostKey> {
        ServerHostKey::from_url(&self.url)
    }

    /// Candidate URL for `kind` and `variant`, preserving the query.
    pub fn candidate_url(&self, kind: TransportKind, variant: PathVariant) -> Url {
        let mut url = self.base.clone();
        let prefix = self.base.path().trim_end_matches('/');
        let mut path = format!("{}/{}", prefix, self.segments.segment(kind));
        if variant == PathVariant::Slash {
            path.push('/');
        }
        url.set_path(&path);
        url
    }

    /// Builds the ordered candidate set.
    ///
    /// With a hint the two variants of the hinted kind come first (the
    /// variant as typed leading) and form the grace phase. Without one all
    /// four start together, streaming before legacy.
    pub fn plan(&self) -> CandidatePlan {
        let (first_kind, first_variant, grace_len) = match self.hint {
            Some((kind, variant)) => (kind, variant, 2),
            None => (TransportKind::Streaming, PathVariant::NoSlash, 0),
        };
        let other_kind = match first_kind {
            TransportKind::Streaming => TransportKind::LegacyEvents,
            TransportKind::LegacyEvents => TransportKind::Streaming,
        };
        let other_variant = match first_variant {
            PathVariant::Slash => PathVariant::NoSlash,
            PathVariant::NoSlash => PathVariant::Slash,
        };

        let candidates = [
            (first_kind, first_variant),
            (first_kind, other_variant),
            (other_kind, first_variant),
            (other_kind, other_variant),
        ]
        .into_iter()
        .map(|(kind, variant)| Candidate::direct(kind, variant, self.candidate_url(kind, variant)))
        .collect();

        CandidatePlan {
            candidates,
            grace_len,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(raw: &str) -> ConnectionTarget {
        ConnectionTarget::parse(raw, PathSegments::default()).unwrap()
    }

    fn urls(plan: &CandidatePlan) -> Vec<String> {
        plan.candidates.iter().map(|c| c.url.to_string()).collect()
    }

    #[test]
    fn test_scheme_defaults_to_https() {
        let target = parse("example.com");
        assert_eq!(target.url().scheme(), "https");
        assert_eq!(target.hint(), None);
        assert_eq!(target.raw(), "example.com");
    }

    #[test]
    fn test_explicit_http_is_kept() {
        assert_eq!(parse("http://localhost:8080/mcp").url().scheme(), "http");
    }

    #[test]
    fn test_rejects_bad_input() {
        for bad in ["", "   ", "ftp://example.com", "https://"] {
            let err = ConnectionTarget::parse(bad, PathSegments::default()).unwrap_err();
            assert!(
                matches!(err.downcast_ref::<NegotiatorError>(), Some(NegotiatorError::InvalidTarget(_))),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_no_hint_races_all_four() {
        let plan = parse("example.com").plan();
        assert_eq!(plan.grace_len, 0);
        assert_eq!(
            urls(&plan),
            vec![
                "https://example.com/mcp",
                "https://example.com/mcp/",
                "https://example.com/sse",
                "https://example.com/sse/",
            ]
        );
        assert_eq!(plan.candidates[0].kind, TransportKind::Streaming);
        assert_eq!(plan.candidates[3].kind, TransportKind::LegacyEvents);
    }

    #[test]
    fn test_streaming_hint_leads_with_typed_variant() {
        let plan = parse("example.com/mcp").plan();
        assert_eq!(plan.grace_len, 2);
        assert_eq!(plan.candidates[0].kind, TransportKind::Streaming);
        assert_eq!(plan.candidates[0].variant, PathVariant::NoSlash);
        assert_eq!(plan.candidates[1].url.as_str(), "https://example.com/mcp/");
        assert!(plan.candidates[2..]
            .iter()
            .all(|c| c.kind == TransportKind::LegacyEvents));
    }

    #[test]
    fn test_legacy_hint_with_slash_and_prefix() {
        let target = parse("https://host.example/api/v1/sse/");
        assert_eq!(target.hint(), Some(TransportKind::LegacyEvents));
        assert_eq!(target.base().path(), "/api/v1");

        let plan = target.plan();
        assert_eq!(
            urls(&plan)[..2],
            ["https://host.example/api/v1/sse/", "https://host.example/api/v1/sse"]
        );
        assert_eq!(urls(&plan)[2], "https://host.example/api/v1/mcp/");
    }

    #[test]
    fn test_unrelated_path_is_used_as_prefix() {
        let plan = parse("example.com/tools").plan();
        assert_eq!(plan.grace_len, 0);
        assert_eq!(urls(&plan)[0], "https://example.com/tools/mcp");
    }

    #[test]
    fn test_query_is_preserved_and_fragment_dropped() {
        let plan = parse("example.com/mcp?key=abc#frag").plan();
        assert_eq!(plan.candidates[0].url.as_str(), "https://example.com/mcp?key=abc");
        assert_eq!(plan.candidates[1].url.as_str(), "https://example.com/mcp/?key=abc");
    }

    #[test]
    fn test_custom_segments() {
        let target =
            ConnectionTarget::parse("example.com/rpc", PathSegments::new("/rpc/", "events")).unwrap();
        assert_eq!(target.hint(), Some(TransportKind::Streaming));
        assert_eq!(target.plan().candidates[2].url.as_str(), "https://example.com/events");
    }

    #[test]
    fn test_host_key_matches_normalized_url() {
        assert_eq!(parse("Example.com/mcp").host_key().unwrap().as_str(), "example.com:443");
    }
}
