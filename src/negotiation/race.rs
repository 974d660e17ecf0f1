//! Connection race coordinator
//!
//! Runs every candidate of a [`CandidatePlan`] as its own task inside a
//! [`JoinSet`] and promotes the first successful handshake to the session.
//!
//! Phases:
//!
//! 1. When the plan has a grace phase, only those candidates start. The rest
//!    start when the grace window elapses or when every grace candidate has
//!    failed, whichever comes first.
//! 2. The first success wins. Successes that completed in the same turn are
//!    resolved in favour of the higher-priority (lower index) candidate.
//! 3. Every other task is cancelled and joined before `race` returns. Any
//!    loser that managed to connect is closed.
//!
//! Cancelling the caller's token has the same teardown guarantee: every
//! task is joined and every opened handle is closed before `race` returns
//! [`NegotiatorError::Cancelled`].

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::{CandidateFailure, CompositeFailure, FailureReason, NegotiatorError, Result};
use crate::mcp::transport::{AttemptContext, Candidate, Connector, SessionHandle, TransportKind};
use crate::mcp::types::InitializeResult;
use crate::negotiation::target::CandidatePlan;

type Outcome = (usize, std::result::Result<Box<dyn SessionHandle>, FailureReason>);

/// The single live connection produced by a race.
#[derive(Debug)]
pub struct Session {
    candidate: Candidate,
    handle: Box<dyn SessionHandle>,
}

impl Session {
    /// Candidate that won.
    pub fn candidate(&self) -> &Candidate {
        &self.candidate
    }

    /// Transport kind of the winner.
    pub fn kind(&self) -> TransportKind {
        self.handle.kind()
    }

    /// Resolved target URL (before any relay rewrite).
    pub fn url(&self) -> &Url {
        self.handle.url()
    }

    /// `initialize` result.
    pub fn server_info(&self) -> &InitializeResult {
        self.handle.server_info()
    }

    /// Returns `true` when the session goes through the relay.
    pub fn via_relay(&self) -> bool {
        self.candidate.route.is_relay()
    }

    /// Closes the underlying handle.
    pub async fn close(&self) {
        self.handle.close().await;
    }
}

/// Races candidates against one another.
#[derive(Debug, Clone)]
pub struct RaceCoordinator {
    connector: Arc<dyn Connector>,
    grace: Duration,
    close_timeout: Duration,
}

impl RaceCoordinator {
    /// Creates a coordinator.
    pub fn new(connector: Arc<dyn Connector>, grace: Duration, close_timeout: Duration) -> Self {
        Self {
            connector,
            grace,
            close_timeout,
        }
    }

    /// Runs the race.
    ///
    /// # Errors
    ///
    /// - [`NegotiatorError::Cancelled`] when `signal` fires first.
    /// - [`NegotiatorError::CompositeConnection`] when every candidate fails,
    ///   listing each candidate in priority order.
    pub async fn race(
        &self,
        plan: CandidatePlan,
        ctx: &AttemptContext,
        signal: &CancellationToken,
    ) -> Result<Session> {
        let candidates = plan.candidates;
        let total = candidates.len();
        if total == 0 {
            return Err(NegotiatorError::CompositeConnection(CompositeFailure::default()).into());
        }

        let race_token = signal.child_token();
        let mut tasks: JoinSet<Outcome> = JoinSet::new();
        let mut pending: BTreeSet<usize> = BTreeSet::new();
        let mut failures: Vec<Option<FailureReason>> = vec![None; total];

        let first_phase = match plan.grace_len {
            0 => total,
            n => n.min(total),
        };
        for idx in 0..first_phase {
            self.launch(&mut tasks, idx, &candidates[idx], ctx, &race_token);
            pending.insert(idx);
        }
        let mut launched = first_phase;
        let grace_deadline = Instant::now() + self.grace;

        if launched < total {
            tracing::debug!(grace = ?self.grace, candidates = launched, "Grace phase started");
        }

        let mut winner: Option<(usize, Box<dyn SessionHandle>)> = None;

        loop {
            if launched < total && pending.is_empty() {
                tracing::debug!("Grace candidates exhausted, starting full race");
                self.launch_rest(&mut tasks, &mut pending, &mut launched, &candidates, ctx, &race_token);
            }

            tokio::select! {
                biased;

                _ = signal.cancelled() => {
                    tracing::info!("Race cancelled, tearing down candidates");
                    race_token.cancel();
                    self.drain(&mut tasks, Vec::new()).await;
                    return Err(NegotiatorError::Cancelled.into());
                }

                _ = tokio::time::sleep_until(grace_deadline), if launched < total => {
                    tracing::debug!("Grace window elapsed, starting full race");
                    self.launch_rest(&mut tasks, &mut pending, &mut launched, &candidates, ctx, &race_token);
                }

                joined = tasks.join_next() => match joined {
                    Some(Ok((idx, Ok(handle)))) => {
                        pending.remove(&idx);
                        winner = Some((idx, handle));
                        break;
                    }
                    Some(Ok((idx, Err(reason)))) => {
                        tracing::debug!(candidate = %candidates[idx], reason = %reason, "Candidate failed");
                        pending.remove(&idx);
                        failures[idx] = Some(reason);
                    }
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "Candidate task ended abnormally");
                    }
                    None if launched < total => {
                        self.launch_rest(&mut tasks, &mut pending, &mut launched, &candidates, ctx, &race_token);
                    }
                    None => break,
                }
            }
        }

        let Some((mut best_idx, mut best)) = winner else {
            let attempts = candidates
                .iter()
                .enumerate()
                .map(|(idx, candidate)| CandidateFailure {
                    kind: candidate.kind,
                    url: candidate.url.clone(),
                    via_relay: candidate.route.is_relay(),
                    reason: failures[idx]
                        .take()
                        .unwrap_or_else(|| FailureReason::Aborted("task ended abnormally".to_string())),
                })
                .collect();
            return Err(NegotiatorError::CompositeConnection(CompositeFailure { attempts }).into());
        };

        // Successes already completed in this turn compete on priority.
        let mut losers: Vec<Box<dyn SessionHandle>> = Vec::new();
        while let Some(joined) = tasks.try_join_next() {
            if let Ok((idx, Ok(handle))) = joined {
                if idx < best_idx {
                    losers.push(std::mem::replace(&mut best, handle));
                    best_idx = idx;
                } else {
                    losers.push(handle);
                }
            }
        }

        race_token.cancel();
        self.drain(&mut tasks, losers).await;

        let candidate = candidates[best_idx].clone();
        tracing::info!(candidate = %candidate, "Race won");
        Ok(Session {
            candidate,
            handle: best,
        })
    }

    fn launch(
        &self,
        tasks: &mut JoinSet<Outcome>,
        idx: usize,
        candidate: &Candidate,
        ctx: &AttemptContext,
        token: &CancellationToken,
    ) {
        let connector = Arc::clone(&self.connector);
        let candidate = candidate.clone();
        let ctx = ctx.clone();
        let token = token.clone();
        tracing::debug!(candidate = %candidate, "Launching candidate");
        tasks.spawn(async move {
            let result = tokio::select! {
                biased;
                _ = token.cancelled() => Err(FailureReason::Cancelled),
                result = connector.connect(&candidate, &ctx) => result,
            };
            (idx, result)
        });
    }

    fn launch_rest(
        &self,
        tasks: &mut JoinSet<Outcome>,
        pending: &mut BTreeSet<usize>,
        launched: &mut usize,
        candidates: &[Candidate],
        ctx: &AttemptContext,
        token: &CancellationToken,
    ) {
        for (idx, candidate) in candidates.iter().enumerate().skip(*launched) {
            self.launch(tasks, idx, candidate, ctx, token);
            pending.insert(idx);
        }
        *launched = candidates.len();
    }

    /// Joins every remaining task and closes every handle that connected,
    /// together with `already_open`.
    async fn drain(&self, tasks: &mut JoinSet<Outcome>, mut already_open: Vec<Box<dyn SessionHandle>>) {
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(handle))) => already_open.push(handle),
                Ok((_, Err(_))) => {}
                Err(e) => tracing::warn!(error = %e, "Candidate task ended abnormally"),
            }
        }

        let close_timeout = self.close_timeout;
        let closes = already_open.iter().map(|handle| async move {
            if tokio::time::timeout(close_timeout, handle.close()).await.is_err() {
                tracing::warn!(url = %handle.url(), "Closing losing candidate timed out");
            } else {
                tracing::debug!(url = %handle.url(), kind = %handle.kind(), "Closed losing candidate");
            }
        });
        futures::future::join_all(closes).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::transport::PathVariant;
    use crate::negotiation::target::{ConnectionTarget, PathSegments};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Scripted behaviour of one fake candidate.
    #[derive(Debug, Clone)]
    enum Script {
        Succeed(Duration),
        Fail(Duration, FailureReason),
        Hang,
    }

    #[derive(Debug, Default)]
    struct Counters {
        opened: AtomicUsize,
        closed: AtomicUsize,
        launched: Mutex<Vec<String>>,
    }

    impl Counters {
        fn open_now(&self) -> usize {
            self.opened.load(Ordering::SeqCst) - self.closed.load(Ordering::SeqCst)
        }
    }

    #[derive(Debug)]
    struct FakeHandle {
        kind: TransportKind,
        url: Url,
        info: InitializeResult,
        counters: Arc<Counters>,
        closed: AtomicBool,
    }

    #[async_trait::async_trait]
    impl SessionHandle for FakeHandle {
        fn kind(&self) -> TransportKind {
            self.kind
        }
        fn url(&self) -> &Url {
            &self.url
        }
        fn server_info(&self) -> &InitializeResult {
            &self.info
        }
        async fn close(&self) {
            if !self.closed.swap(true, Ordering::SeqCst) {
                self.counters.closed.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    #[derive(Debug)]
    struct FakeConnector {
        scripts: HashMap<String, Script>,
        counters: Arc<Counters>,
    }

    impl FakeConnector {
        fn new(scripts: &[(&str, Script)]) -> (Arc<Self>, Arc<Counters>) {
            let counters = Arc::new(Counters::default());
            let connector = Arc::new(Self {
                scripts: scripts
                    .iter()
                    .map(|(url, script)| (url.to_string(), script.clone()))
                    .collect(),
                counters: Arc::clone(&counters),
            });
            (connector, counters)
        }
    }

    #[async_trait::async_trait]
    impl Connector for FakeConnector {
        async fn connect(
            &self,
            candidate: &Candidate,
            _ctx: &AttemptContext,
        ) -> std::result::Result<Box<dyn SessionHandle>, FailureReason> {
            self.counters
                .launched
                .lock()
                .unwrap()
                .push(candidate.url.to_string());
            let script = self
                .scripts
                .get(candidate.url.as_str())
                .cloned()
                .unwrap_or(Script::Fail(Duration::ZERO, FailureReason::HttpStatus(404)));
            match script {
                Script::Succeed(delay) => {
                    tokio::time::sleep(delay).await;
                    self.counters.opened.fetch_add(1, Ordering::SeqCst);
                    Ok(Box::new(FakeHandle {
                        kind: candidate.kind,
                        url: candidate.url.clone(),
                        info: serde_json::from_value(serde_json::json!({"protocolVersion": "2025-03-26"}))
                            .unwrap(),
                        counters: Arc::clone(&self.counters),
                        closed: AtomicBool::new(false),
                    }))
                }
                Script::Fail(delay, reason) => {
                    tokio::time::sleep(delay).await;
                    Err(reason)
                }
                Script::Hang => std::future::pending().await,
            }
        }
    }

    fn ctx() -> AttemptContext {
        AttemptContext::new(None, "2025-03-26", "test")
    }

    fn plan(raw: &str) -> CandidatePlan {
        ConnectionTarget::parse(raw, PathSegments::default())
            .unwrap()
            .plan()
    }

    fn coordinator(connector: Arc<FakeConnector>) -> RaceCoordinator {
        RaceCoordinator::new(connector, Duration::from_secs(3), Duration::from_secs(1))
    }

    #[tokio::test(start_paused = true)]
    async fn test_hinted_winner_needs_no_full_race() {
        let (connector, counters) = FakeConnector::new(&[(
            "https://example.com/mcp",
            Script::Succeed(Duration::from_millis(100)),
        )]);
        let session = coordinator(connector)
            .race(plan("example.com/mcp"), &ctx(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(session.kind(), TransportKind::Streaming);
        assert_eq!(session.url().as_str(), "https://example.com/mcp");
        assert_eq!(counters.launched.lock().unwrap().len(), 2);
        assert_eq!(counters.open_now(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_grace_failure_launches_remaining_candidates() {
        let (connector, counters) = FakeConnector::new(&[(
            "https://example.com/sse/",
            Script::Succeed(Duration::from_millis(50)),
        )]);
        let session = coordinator(connector)
            .race(plan("example.com/mcp"), &ctx(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(session.kind(), TransportKind::LegacyEvents);
        assert_eq!(session.candidate().variant, PathVariant::Slash);
        assert_eq!(counters.launched.lock().unwrap().len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_grace_timeout_launches_full_race_while_grace_still_runs() {
        let (connector, counters) = FakeConnector::new(&[
            ("https://example.com/mcp", Script::Hang),
            ("https://example.com/mcp/", Script::Hang),
            ("https://example.com/sse", Script::Succeed(Duration::from_millis(10))),
        ]);
        let started = Instant::now();
        let session = coordinator(connector)
            .race(plan("example.com/mcp"), &ctx(), &CancellationToken::new())
            .await
            .unwrap();

        assert!(started.elapsed() >= Duration::from_secs(3));
        assert_eq!(session.url().as_str(), "https://example.com/sse");
        assert_eq!(counters.open_now(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_successes_are_closed() {
        let (connector, counters) = FakeConnector::new(&[
            ("https://example.com/mcp", Script::Succeed(Duration::from_millis(10))),
            ("https://example.com/mcp/", Script::Succeed(Duration::from_millis(10))),
            ("https://example.com/sse", Script::Succeed(Duration::from_millis(10))),
            ("https://example.com/sse/", Script::Succeed(Duration::from_millis(20))),
        ]);
        let session = coordinator(connector)
            .race(plan("example.com"), &ctx(), &CancellationToken::new())
            .await
            .unwrap();

        // Simultaneous successes resolve to the highest priority candidate.
        assert_eq!(session.url().as_str(), "https://example.com/mcp");
        assert_eq!(counters.open_now(), 1);
        assert!(counters.closed.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_failures_are_aggregated() {
        let (connector, _) = FakeConnector::new(&[
            (
                "https://example.com/mcp",
                Script::Fail(Duration::ZERO, FailureReason::HttpStatus(405)),
            ),
            (
                "https://example.com/mcp/",
                Script::Fail(Duration::ZERO, FailureReason::Unauthorized(401)),
            ),
            (
                "https://example.com/sse",
                Script::Fail(Duration::ZERO, FailureReason::Network("connection refused".into())),
            ),
            (
                "https://example.com/sse/",
                Script::Fail(Duration::ZERO, FailureReason::Protocol("no endpoint".into())),
            ),
        ]);
        let err = coordinator(connector)
            .race(plan("example.com"), &ctx(), &CancellationToken::new())
            .await
            .unwrap_err();

        let Some(NegotiatorError::CompositeConnection(composite)) = err.downcast_ref::<NegotiatorError>() else {
            panic!("expected composite failure, got {err}");
        };
        assert_eq!(composite.attempts.len(), 4);
        assert!(composite.is_cross_origin_candidate());
        assert!(composite.requires_authorization());
        let message = err.to_string();
        for needle in ["HTTP 405", "unauthorized (HTTP 401)", "connection refused", "no endpoint"] {
            assert!(message.contains(needle), "missing {needle} in {message}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_closes_every_opened_handle() {
        let (connector, counters) = FakeConnector::new(&[
            ("https://example.com/mcp", Script::Hang),
            ("https://example.com/mcp/", Script::Hang),
            ("https://example.com/sse", Script::Hang),
            ("https://example.com/sse/", Script::Hang),
        ]);
        let signal = CancellationToken::new();
        let trigger = signal.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            trigger.cancel();
        });

        let err = coordinator(connector)
            .race(plan("example.com"), &ctx(), &signal)
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<NegotiatorError>(),
            Some(NegotiatorError::Cancelled)
        ));
        assert_eq!(counters.open_now(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_before_start_opens_nothing() {
        let (connector, counters) = FakeConnector::new(&[(
            "https://example.com/mcp",
            Script::Succeed(Duration::ZERO),
        )]);
        let signal = CancellationToken::new();
        signal.cancel();
        let result = coordinator(connector)
            .race(plan("example.com"), &ctx(), &signal)
            .await;
        assert!(result.is_err());
        assert_eq!(counters.open_now(), 0);
    }

    #[tokio::test]
    async fn test_empty_plan_is_composite_failure() {
        let (connector, _) = FakeConnector::new(&[]);
        let err = coordinator(connector)
            .race(
                CandidatePlan {
                    candidates: Vec::new(),
                    grace_len: 0,
                },
                &ctx(),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<NegotiatorError>(),
            Some(NegotiatorError::CompositeConnection(_))
        ));
    }
}
