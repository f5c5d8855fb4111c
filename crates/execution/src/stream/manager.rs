//! Stream session manager.

use super::pacing::Pacer;
use super::session::{Session, SessionStatus};
use crate::gate::TradingGate;
use futures::Stream;
use keel_domain::{GapInfo, StreamEvent};
use keel_protocols::MarketTransport;
use std::collections::{BTreeMap, HashSet};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Configuration for market data sessions.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Maximum symbols per session.
    pub group_size: usize,
    /// First reconnect delay.
    pub backoff_base: Duration,
    /// Reconnect delay cap.
    pub backoff_max: Duration,
    /// Uniform jitter applied to every delay, as a fraction.
    pub backoff_jitter: f64,
    /// Connected time after which the backoff resets.
    pub stability_threshold: Duration,
    /// Age at which a session reconnects proactively.
    pub rotation_after: Duration,
    /// Minimum spacing between connect attempts across sessions.
    pub resubscribe_spacing: Duration,
    /// Wait after a "too many requests" close.
    pub too_many_requests_cooldown: Duration,
    /// Spacing multiplier after a "too many requests" close.
    pub pacing_widen_factor: u32,
    /// How long the widened spacing lasts.
    pub pacing_widen_duration: Duration,
    /// Hold applied to all sessions on a hard rate limit without a retry hint.
    pub rate_limit_hold: Duration,
    /// New-order pause after a venue server error.
    pub server_error_pause: Duration,
    /// Capacity of the event channel per subscription.
    pub event_buffer: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            group_size: 50,
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(60),
            backoff_jitter: 0.15,
            stability_threshold: Duration::from_secs(60),
            rotation_after: Duration::from_secs(23 * 3600 + 50 * 60), // 23h50m
            resubscribe_spacing: Duration::from_millis(250),
            too_many_requests_cooldown: Duration::from_secs(120),
            pacing_widen_factor: 4,
            pacing_widen_duration: Duration::from_secs(600),
            rate_limit_hold: Duration::from_secs(300),
            server_error_pause: Duration::from_secs(30),
            event_buffer: 1024,
        }
    }
}

/// State shared by every session of a manager.
pub(crate) struct SessionContext {
    pub(crate) transport: Arc<dyn MarketTransport>,
    pub(crate) config: StreamConfig,
    pub(crate) gate: TradingGate,
    pub(crate) pacer: Pacer,
    /// Manager-wide rate limit hold deadline.
    pub(crate) hold: watch::Sender<Option<Instant>>,
    pub(crate) statuses: RwLock<BTreeMap<usize, SessionStatus>>,
}

/// Market events and gap notifications from one subscription.
///
/// Ends only after the manager shuts down.
pub struct EventStream {
    rx: mpsc::Receiver<StreamEvent>,
}

impl EventStream {
    /// Waits for the next event.
    pub async fn recv(&mut self) -> Option<StreamEvent> {
        self.rx.recv().await
    }
}

impl Stream for EventStream {
    type Item = StreamEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// Owns the market data sessions.
pub struct StreamSessionManager {
    ctx: Arc<SessionContext>,
    gap_listener: Option<mpsc::Sender<GapInfo>>,
    cancel: CancellationToken,
    next_session_id: AtomicUsize,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl StreamSessionManager {
    /// Creates a new StreamSessionManager.
    pub fn new(transport: Arc<dyn MarketTransport>, config: StreamConfig, gate: TradingGate) -> Self {
        let (hold, _) = watch::channel(None);
        let pacer = Pacer::new(config.resubscribe_spacing);
        Self {
            ctx: Arc::new(SessionContext {
                transport,
                config,
                gate,
                pacer,
                hold,
                statuses: RwLock::new(BTreeMap::new()),
            }),
            gap_listener: None,
            cancel: CancellationToken::new(),
            next_session_id: AtomicUsize::new(0),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Also delivers every gap to `listener`, without blocking the sessions.
    #[must_use]
    pub fn with_gap_listener(mut self, listener: mpsc::Sender<GapInfo>) -> Self {
        self.gap_listener = Some(listener);
        self
    }

    /// Starts sessions for `symbols`, one per group of `group_size`.
    pub async fn subscribe<I, S>(&self, symbols: I) -> EventStream
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut seen = HashSet::new();
        let symbols: Vec<String> = symbols
            .into_iter()
            .map(Into::into)
            .filter(|s| seen.insert(s.clone()))
            .collect();

        let (tx, rx) = mpsc::channel(self.ctx.config.event_buffer.max(1));
        let mut tasks = self.tasks.lock().await;

        for group in symbols.chunks(self.ctx.config.group_size.max(1)) {
            let id = self.next_session_id.fetch_add(1, Ordering::SeqCst);
            self.ctx
                .statuses
                .write()
                .await
                .insert(id, SessionStatus::new(id, group.to_vec()));

            let session = Session::new(
                id,
                group.to_vec(),
                self.ctx.clone(),
                tx.clone(),
                self.gap_listener.clone(),
                self.cancel.child_token(),
            );
            tasks.push(tokio::spawn(session.run()));
        }

        info!(
            symbols = symbols.len(),
            sessions = symbols.len().div_ceil(self.ctx.config.group_size.max(1)),
            "Market data subscribed"
        );
        EventStream { rx }
    }

    /// Current state of every session.
    pub async fn session_states(&self) -> Vec<SessionStatus> {
        self.ctx.statuses.read().await.values().cloned().collect()
    }

    /// Remaining manager-wide rate limit hold.
    pub fn rate_limit_hold(&self) -> Option<Duration> {
        let now = Instant::now();
        (*self.ctx.hold.borrow())
            .filter(|until| *until > now)
            .map(|until| until - now)
    }

    /// Stops every session and waits for them to close their connections.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Stream session task failed");
            }
        }
        info!("Stream sessions stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::SessionState;
    use keel_domain::{GapReason, MarketEvent, ReconcileMode};
    use keel_protocols::TransportError;
    use keel_protocols::paper::{ConnectScript, ScriptStep, ScriptedTransport};
    use rust_decimal_macros::dec;

    fn manager(transport: &ScriptedTransport, config: StreamConfig) -> StreamSessionManager {
        StreamSessionManager::new(Arc::new(transport.clone()), config, TradingGate::new())
    }

    async fn next_gap(events: &mut EventStream) -> GapInfo {
        loop {
            match events.recv().await {
                Some(StreamEvent::GapDetected(gap)) => return gap,
                Some(StreamEvent::Market(_)) => continue,
                None => panic!("stream ended"),
            }
        }
    }

    fn event(seq: u64) -> ScriptStep {
        ScriptStep::Event(MarketEvent::new("BTCUSDT", dec!(100)).with_sequence(seq))
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_delays_follow_backoff() {
        let refused = || ConnectScript::Refuse(TransportError::Io("refused".to_string()));
        let transport = ScriptedTransport::new([
            ConnectScript::Accept(vec![ScriptStep::Fail(TransportError::Disconnected(
                "reset".to_string(),
            ))]),
            refused(),
            refused(),
            refused(),
        ]);
        let manager = manager(&transport, StreamConfig::default());
        let mut events = manager.subscribe(["BTCUSDT"]).await;

        let gap = next_gap(&mut events).await;
        assert_eq!(gap.reason, GapReason::Reconnect { attempt: 4 });

        let attempts = transport.attempts().await;
        assert_eq!(attempts.len(), 5);
        for (i, ideal) in [1.0, 2.0, 4.0, 8.0].iter().enumerate() {
            let actual = (attempts[i + 1].at - attempts[i].at).as_secs_f64();
            assert!(
                actual >= ideal * 0.85 && actual <= ideal * 1.15 + 0.01,
                "delay {i} was {actual}s, expected about {ideal}s"
            );
        }
        manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stable_connection_resets_backoff() {
        let refused = || ConnectScript::Refuse(TransportError::Io("refused".to_string()));
        let transport = ScriptedTransport::new([
            refused(),
            refused(),
            ConnectScript::Accept(vec![
                ScriptStep::Idle(Duration::from_secs(61)),
                ScriptStep::Fail(TransportError::Disconnected("reset".to_string())),
            ]),
            refused(),
        ]);
        let manager = manager(&transport, StreamConfig::default());
        let mut events = manager.subscribe(["BTCUSDT"]).await;

        next_gap(&mut events).await;

        let attempts = transport.attempts().await;
        assert_eq!(attempts.len(), 5);
        let grown = (attempts[2].at - attempts[1].at).as_secs_f64();
        assert!((1.7..=2.31).contains(&grown), "second delay was {grown}s");
        // 61s connected, then the first delay again instead of 4s.
        let after_stable = (attempts[3].at - attempts[2].at).as_secs_f64() - 61.0;
        assert!(
            (0.85..=1.16).contains(&after_stable),
            "delay after stable session was {after_stable}s"
        );
        manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_too_many_requests_cools_down() {
        let transport = ScriptedTransport::new([ConnectScript::Accept(vec![ScriptStep::Fail(
            TransportError::TooManyRequests,
        )])]);
        let manager = manager(&transport, StreamConfig::default());
        let mut events = manager.subscribe(["BTCUSDT"]).await;

        let gap = next_gap(&mut events).await;
        assert_eq!(gap.reason, GapReason::Reconnect { attempt: 1 });

        let attempts = transport.attempts().await;
        assert!(attempts[1].at - attempts[0].at >= Duration::from_secs(120));
        assert_eq!(manager.ctx.pacer.current_spacing().await, Duration::from_secs(1));
        manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_holds_every_session() {
        let transport = ScriptedTransport::new([
            ConnectScript::Accept(vec![ScriptStep::Fail(TransportError::RateLimited {
                retry_after: Some(Duration::from_secs(90)),
            })]),
            ConnectScript::Accept(Vec::new()),
        ]);
        let config = StreamConfig {
            group_size: 1,
            ..Default::default()
        };
        let manager = manager(&transport, config);
        let start = Instant::now();
        let mut events = manager.subscribe(["BTCUSDT", "ETHUSDT"]).await;

        next_gap(&mut events).await;
        next_gap(&mut events).await;

        let attempts = transport.attempts().await;
        assert_eq!(attempts.len(), 4);
        assert!(attempts[2..].iter().all(|a| a.at - start >= Duration::from_secs(90)));
        // The healthy session closed its connection when the hold started.
        assert_eq!(transport.closes(), 1);
        manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_error_pauses_orders() {
        let transport = ScriptedTransport::new([ConnectScript::Accept(vec![ScriptStep::Fail(
            TransportError::from_code(-1003, "internal error", None),
        )])]);
        let gate = TradingGate::new();
        gate.mark_reconciled(ReconcileMode::Full).await;
        let manager = StreamSessionManager::new(
            Arc::new(transport.clone()),
            StreamConfig::default(),
            gate.clone(),
        );
        let mut events = manager.subscribe(["BTCUSDT"]).await;

        next_gap(&mut events).await;
        assert!(!gate.can_submit().await);
        let status = gate.status().await;
        assert!(status.pause_remaining_ms.is_some_and(|ms| ms <= 30_000));

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(gate.can_submit().await);
        manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_rotation_reconnects_and_reports_gap() {
        let transport = ScriptedTransport::new([]);
        let manager = manager(&transport, StreamConfig::default());
        let mut events = manager.subscribe(["BTCUSDT"]).await;

        let gap = next_gap(&mut events).await;
        assert_eq!(gap.reason, GapReason::Rotation);

        let attempts = transport.attempts().await;
        assert_eq!(attempts.len(), 2);
        assert!(attempts[1].at - attempts[0].at >= Duration::from_secs(23 * 3600 + 50 * 60));
        assert_eq!(transport.closes(), 1);
        manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_sequence_jump_reports_gap_and_drops_stale() {
        let transport = ScriptedTransport::new([ConnectScript::Accept(vec![
            event(1),
            event(3),
            event(2),
            event(4),
        ])]);
        let manager = manager(&transport, StreamConfig::default());
        let mut events = manager.subscribe(["BTCUSDT"]).await;

        let mut seen = Vec::new();
        for _ in 0..4 {
            seen.push(events.recv().await.unwrap());
        }
        assert!(matches!(&seen[0], StreamEvent::Market(e) if e.sequence == Some(1)));
        assert!(matches!(
            &seen[1],
            StreamEvent::GapDetected(g) if g.reason == GapReason::SequenceGap { expected: 2, received: 3 }
        ));
        assert!(matches!(&seen[2], StreamEvent::Market(e) if e.sequence == Some(3)));
        assert!(matches!(&seen[3], StreamEvent::Market(e) if e.sequence == Some(4)));
        manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_sequence_at_upper_bound() {
        let transport = ScriptedTransport::new([ConnectScript::Accept(vec![
            event(u64::MAX - 1),
            event(u64::MAX),
            event(u64::MAX),
            event(1),
        ])]);
        let manager = manager(&transport, StreamConfig::default());
        let mut events = manager.subscribe(["BTCUSDT"]).await;

        for expected in [u64::MAX - 1, u64::MAX] {
            let event = events.recv().await.unwrap();
            assert!(matches!(event, StreamEvent::Market(e) if e.sequence == Some(expected)));
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(events.rx.try_recv().is_err());
        manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_all_sessions() {
        let transport = ScriptedTransport::new([]);
        let config = StreamConfig {
            group_size: 2,
            ..Default::default()
        };
        let manager = manager(&transport, config);
        let mut events = manager.subscribe(["BTCUSDT", "ETHUSDT", "SOLUSDT"]).await;

        tokio::time::sleep(Duration::from_secs(1)).await;
        let states = manager.session_states().await;
        assert_eq!(states.len(), 2);
        assert!(states.iter().all(|s| s.state == SessionState::Connected));
        assert_eq!(states[1].symbols, vec!["SOLUSDT".to_string()]);

        manager.shutdown().await;
        assert!(
            manager
                .session_states()
                .await
                .iter()
                .all(|s| s.state == SessionState::Stopped)
        );
        assert_eq!(transport.closes(), 2);
        assert!(events.recv().await.is_none());
    }
}
