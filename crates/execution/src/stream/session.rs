//! One market data session: a connection for a group of symbols and its
//! reconnect state machine.

use super::backoff::Backoff;
use super::manager::SessionContext;
use chrono::{DateTime, Utc};
use keel_domain::{GapInfo, GapReason, MarketEvent, StreamEvent};
use keel_protocols::{MarketConnection, TransportError};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, sleep, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    Connecting,
    Connected,
    Backoff,
    Rotating,
    Stopped,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Connecting => "CONNECTING",
            Self::Connected => "CONNECTED",
            Self::Backoff => "BACKOFF",
            Self::Rotating => "ROTATING",
            Self::Stopped => "STOPPED",
        };
        f.write_str(name)
    }
}

/// Operator view of one session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub session_id: usize,
    pub symbols: Vec<String>,
    pub state: SessionState,
    pub consecutive_failures: u32,
    /// Current reconnect delay while in `BACKOFF`.
    pub backoff_ms: Option<u64>,
    pub connected_since: Option<DateTime<Utc>>,
    pub reconnects: u32,
}

impl SessionStatus {
    pub(crate) fn new(session_id: usize, symbols: Vec<String>) -> Self {
        Self {
            session_id,
            symbols,
            state: SessionState::Connecting,
            consecutive_failures: 0,
            backoff_ms: None,
            connected_since: None,
            reconnects: 0,
        }
    }
}

/// Why a connected session stopped reading.
enum Exit {
    Rotate,
    Held,
    Failed(TransportError),
    Stopped,
}

pub(crate) struct Session {
    id: usize,
    symbols: Vec<String>,
    ctx: Arc<SessionContext>,
    events: mpsc::Sender<StreamEvent>,
    gaps: Option<mpsc::Sender<GapInfo>>,
    cancel: CancellationToken,
    hold_rx: watch::Receiver<Option<Instant>>,
    backoff: Backoff,
    failures: u32,
    attempts_since_connect: u32,
    reconnects: u32,
    connected_once: bool,
    pending_gap: Option<GapReason>,
}

impl Session {
    pub(crate) fn new(
        id: usize,
        symbols: Vec<String>,
        ctx: Arc<SessionContext>,
        events: mpsc::Sender<StreamEvent>,
        gaps: Option<mpsc::Sender<GapInfo>>,
        cancel: CancellationToken,
    ) -> Self {
        let config = &ctx.config;
        let backoff = Backoff::new(
            config.backoff_base,
            config.backoff_max,
            config.backoff_jitter,
        );
        let hold_rx = ctx.hold.subscribe();
        Self {
            id,
            symbols,
            ctx,
            events,
            gaps,
            cancel,
            hold_rx,
            backoff,
            failures: 0,
            attempts_since_connect: 0,
            reconnects: 0,
            connected_once: false,
            pending_gap: None,
        }
    }

    pub(crate) async fn run(mut self) {
        info!(
            session_id = self.id,
            symbols = self.symbols.len(),
            "Stream session started"
        );

        loop {
            if !self.wait_for_hold().await {
                break;
            }

            self.set_state(SessionState::Connecting, None).await;
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = self.ctx.pacer.acquire() => {}
            }

            self.attempts_since_connect += 1;
            let connected = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                result = self.ctx.transport.connect(&self.symbols) => result,
            };

            let delay = match connected {
                Ok(mut conn) => {
                    let connected_at = Instant::now();
                    let exit = self.on_connected(conn.as_mut(), connected_at).await;
                    if connected_at.elapsed() >= self.ctx.config.stability_threshold {
                        self.backoff.reset();
                        self.failures = 0;
                    }
                    match exit {
                        Exit::Rotate | Exit::Held => continue,
                        Exit::Stopped => break,
                        Exit::Failed(e) => self.remediate(e).await,
                    }
                }
                Err(e) => self.remediate(e).await,
            };

            if delay.is_zero() {
                continue;
            }
            self.set_state(SessionState::Backoff, Some(delay)).await;
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = sleep(delay) => {}
            }
        }

        self.set_state(SessionState::Stopped, None).await;
    }

    /// Waits out a manager-wide rate limit hold. Returns false when cancelled.
    async fn wait_for_hold(&mut self) -> bool {
        loop {
            let until = *self.hold_rx.borrow_and_update();
            let Some(until) = until.filter(|u| *u > Instant::now()) else {
                return true;
            };
            self.set_state(SessionState::Backoff, Some(until - Instant::now()))
                .await;
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return false,
                _ = sleep_until(until) => {}
                _ = self.hold_rx.changed() => {}
            }
        }
    }

    async fn on_connected(&mut self, conn: &mut dyn MarketConnection, connected_at: Instant) -> Exit {
        let attempts = std::mem::take(&mut self.attempts_since_connect);
        let reason = self.pending_gap.take();
        {
            let mut statuses = self.ctx.statuses.write().await;
            if let Some(status) = statuses.get_mut(&self.id) {
                status.state = SessionState::Connected;
                status.backoff_ms = None;
                status.connected_since = Some(Utc::now());
                if self.connected_once {
                    status.reconnects += 1;
                }
            }
        }
        info!(session_id = self.id, attempts, "Stream session connected");

        if self.connected_once {
            self.reconnects += 1;
            let reason = reason.unwrap_or(GapReason::Reconnect { attempt: attempts });
            if !self.emit_gap(reason).await {
                conn.close().await;
                return Exit::Stopped;
            }
        }
        self.connected_once = true;

        self.pump(conn, connected_at).await
    }

    async fn pump(&mut self, conn: &mut dyn MarketConnection, connected_at: Instant) -> Exit {
        let rotate_at = connected_at + self.ctx.config.rotation_after;
        let mut sequences: HashMap<String, u64> = HashMap::new();

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    conn.close().await;
                    return Exit::Stopped;
                }
                changed = self.hold_rx.changed() => {
                    let held = changed.is_ok()
                        && self.hold_rx.borrow_and_update().is_some_and(|u| u > Instant::now());
                    if held {
                        warn!(session_id = self.id, "Rate limit hold, disconnecting session");
                        conn.close().await;
                        return Exit::Held;
                    }
                }
                _ = sleep_until(rotate_at) => {
                    self.set_state(SessionState::Rotating, None).await;
                    conn.close().await;
                    self.pending_gap = Some(GapReason::Rotation);
                    return Exit::Rotate;
                }
                message = conn.next_message() => match message {
                    Ok(event) => {
                        if !self.forward(event, &mut sequences).await {
                            conn.close().await;
                            return Exit::Stopped;
                        }
                    }
                    Err(e) => return Exit::Failed(e),
                },
            }
        }
    }

    /// Picks the delay before the next connect attempt for `error`.
    async fn remediate(&mut self, error: TransportError) -> Duration {
        self.failures += 1;
        let config = &self.ctx.config;

        match &error {
            TransportError::TooManyRequests => {
                warn!(
                    session_id = self.id,
                    cooldown_secs = config.too_many_requests_cooldown.as_secs(),
                    "Too many requests, cooling down before resubscribing"
                );
                self.ctx
                    .pacer
                    .widen(config.pacing_widen_factor, config.pacing_widen_duration)
                    .await;
                config.too_many_requests_cooldown
            }
            TransportError::RateLimited { retry_after } => {
                let hold = retry_after.unwrap_or(config.rate_limit_hold);
                let until = Instant::now() + hold;
                error!(
                    session_id = self.id,
                    hold_secs = hold.as_secs(),
                    "Rate limited, holding all sessions"
                );
                self.ctx.hold.send_modify(|current| {
                    if current.is_none_or(|c| c < until) {
                        *current = Some(until);
                    }
                });
                Duration::ZERO
            }
            TransportError::ServerError { .. } => {
                let delay = self.backoff.next_delay();
                error!(
                    session_id = self.id,
                    error = %error,
                    retry_ms = delay.as_millis() as u64,
                    "Venue server error, pausing new orders"
                );
                self.ctx
                    .gate
                    .pause_orders(config.server_error_pause, &error.to_string())
                    .await;
                delay
            }
            TransportError::Disconnected(_) | TransportError::Io(_) => {
                let delay = self.backoff.next_delay();
                warn!(
                    session_id = self.id,
                    error = %error,
                    failures = self.failures,
                    retry_ms = delay.as_millis() as u64,
                    "Stream session dropped"
                );
                delay
            }
        }
    }

    /// Forwards a market update, flagging sequence jumps. Returns false once
    /// the consumer is gone.
    async fn forward(&mut self, event: MarketEvent, sequences: &mut HashMap<String, u64>) -> bool {
        if let Some(seq) = event.sequence {
            if let Some(&last) = sequences.get(&event.symbol) {
                if seq <= last {
                    debug!(session_id = self.id, symbol = %event.symbol, seq, last, "Dropping stale update");
                    return true;
                }
                if let Some(expected) = last.checked_add(1).filter(|next| seq > *next) {
                    let reason = GapReason::SequenceGap {
                        expected,
                        received: seq,
                    };
                    if !self.emit_gap(reason).await {
                        return false;
                    }
                }
            }
            sequences.insert(event.symbol.clone(), seq);
        }
        self.send(StreamEvent::Market(event)).await
    }

    async fn emit_gap(&mut self, reason: GapReason) -> bool {
        let gap = GapInfo {
            session_id: self.id,
            symbols: self.symbols.clone(),
            reason,
            detected_at: Utc::now(),
        };
        warn!(session_id = self.id, reason = ?gap.reason, "Market data gap detected");

        if let Some(listener) = &self.gaps {
            if let Err(e) = listener.try_send(gap.clone()) {
                debug!(session_id = self.id, error = %e, "Gap listener not accepting");
            }
        }
        self.send(StreamEvent::GapDetected(gap)).await
    }

    async fn send(&self, event: StreamEvent) -> bool {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            sent = self.events.send(event) => sent.is_ok(),
        }
    }

    async fn set_state(&self, state: SessionState, backoff: Option<Duration>) {
        let mut statuses = self.ctx.statuses.write().await;
        if let Some(status) = statuses.get_mut(&self.id) {
            status.state = state;
            status.consecutive_failures = self.failures;
            status.backoff_ms = backoff.map(|d| d.as_millis() as u64);
            if state != SessionState::Connected {
                status.connected_since = None;
            }
            status.reconnects = self.reconnects;
        }
        drop(statuses);

        match state {
            SessionState::Rotating | SessionState::Stopped => {
                info!(session_id = self.id, state = %state, "Stream session state changed");
            }
            _ => {
                debug!(
                    session_id = self.id,
                    state = %state,
                    backoff_ms = backoff.map(|d| d.as_millis() as u64),
                    "Stream session state changed"
                );
            }
        }
    }
}
