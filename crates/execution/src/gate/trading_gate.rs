//! Trading gate: readiness after reconciliation and temporary order pauses.

use chrono::{DateTime, Utc};
use keel_domain::ReconcileMode;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{error, info, warn};

/// Whether a new order may be submitted right now.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// Orders may be submitted.
    Open,
    /// No successful full reconciliation yet, or the last pass failed.
    NotReady { reason: Option<String> },
    /// Orders are paused after a venue error.
    Paused { remaining: Duration, reason: String },
}

/// Snapshot of the gate for operators.
#[derive(Debug, Clone, Serialize)]
pub struct GateStatus {
    /// Whether new orders are accepted.
    pub can_submit: bool,
    /// Whether reconciliation has established a trusted position view.
    pub ready: bool,
    /// Remaining order pause in milliseconds.
    pub pause_remaining_ms: Option<u64>,
    /// Why orders are paused.
    pub pause_reason: Option<String>,
    /// Reason of the last reconciliation failure, cleared on success.
    pub last_failure: Option<String>,
    /// Time of the last successful reconciliation.
    pub last_reconciled_at: Option<DateTime<Utc>>,
    /// Mode of the last successful reconciliation.
    pub last_reconcile_mode: Option<ReconcileMode>,
}

#[derive(Debug, Default)]
struct GateState {
    paused_until: Option<Instant>,
    pause_reason: Option<String>,
    last_failure: Option<String>,
    last_reconciled_at: Option<DateTime<Utc>>,
    last_reconcile_mode: Option<ReconcileMode>,
}

/// Gate checked before every new order.
///
/// Starts closed. Only a successful full reconciliation opens it; any failed
/// pass closes it again. Cloning shares the same gate.
#[derive(Clone, Default)]
pub struct TradingGate {
    /// Set after a successful pass, cleared on failure.
    ready: Arc<AtomicBool>,
    /// Set once a full pass has succeeded.
    full_reconciled: Arc<AtomicBool>,
    state: Arc<RwLock<GateState>>,
}

impl TradingGate {
    /// Creates a new closed TradingGate.
    pub fn new() -> Self {
        Self::default()
    }

    /// Checks whether a new order may be submitted.
    pub async fn admission(&self) -> Admission {
        if !self.ready.load(Ordering::SeqCst) {
            return Admission::NotReady {
                reason: self.state.read().await.last_failure.clone(),
            };
        }

        let state = self.state.read().await;
        match state.paused_until {
            Some(until) if until > Instant::now() => Admission::Paused {
                remaining: until - Instant::now(),
                reason: state.pause_reason.clone().unwrap_or_default(),
            },
            _ => Admission::Open,
        }
    }

    /// Returns true when new orders are accepted.
    pub async fn can_submit(&self) -> bool {
        self.admission().await == Admission::Open
    }

    /// Returns true when reconciliation has established a trusted view.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    /// Blocks new orders for `duration`. Protective orders are not affected.
    ///
    /// An existing longer pause is kept.
    pub async fn pause_orders(&self, duration: Duration, reason: &str) {
        let until = Instant::now() + duration;
        let mut state = self.state.write().await;
        if state.paused_until.is_some_and(|current| current >= until) {
            return;
        }
        state.paused_until = Some(until);
        state.pause_reason = Some(reason.to_string());
        warn!(
            pause_secs = duration.as_secs(),
            reason = reason,
            "New orders paused"
        );
    }

    /// Records a successful reconciliation.
    ///
    /// A soft pass only reopens the gate if a full pass has succeeded before.
    pub async fn mark_reconciled(&self, mode: ReconcileMode) {
        if mode == ReconcileMode::Full {
            self.full_reconciled.store(true, Ordering::SeqCst);
        }
        let ready = self.full_reconciled.load(Ordering::SeqCst);
        let was_ready = self.ready.swap(ready, Ordering::SeqCst);

        let mut state = self.state.write().await;
        state.last_failure = None;
        state.last_reconciled_at = Some(Utc::now());
        state.last_reconcile_mode = Some(mode);

        if ready && !was_ready {
            info!(mode = %mode, "Trading gate opened");
        }
    }

    /// Records a failed reconciliation and closes the gate.
    pub async fn mark_failed(&self, reason: &str) {
        let was_ready = self.ready.swap(false, Ordering::SeqCst);
        self.state.write().await.last_failure = Some(reason.to_string());
        error!(reason = reason, was_ready, "Trading gate closed");
    }

    /// Gets the current status.
    pub async fn status(&self) -> GateStatus {
        let admission = self.admission().await;
        let state = self.state.read().await;
        let now = Instant::now();
        let pause_remaining = state.paused_until.filter(|until| *until > now).map(|until| until - now);

        GateStatus {
            can_submit: admission == Admission::Open,
            ready: self.ready.load(Ordering::SeqCst),
            pause_remaining_ms: pause_remaining.map(|d| d.as_millis() as u64),
            pause_reason: pause_remaining.and(state.pause_reason.clone()),
            last_failure: state.last_failure.clone(),
            last_reconciled_at: state.last_reconciled_at,
            last_reconcile_mode: state.last_reconcile_mode,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_gate_starts_closed() {
        let gate = TradingGate::new();
        assert!(!gate.can_submit().await);
        assert_eq!(gate.admission().await, Admission::NotReady { reason: None });
    }

    #[tokio::test]
    async fn test_soft_pass_does_not_open_gate_before_full() {
        let gate = TradingGate::new();
        gate.mark_reconciled(ReconcileMode::Soft).await;
        assert!(!gate.can_submit().await);

        gate.mark_reconciled(ReconcileMode::Full).await;
        assert!(gate.can_submit().await);
    }

    #[tokio::test]
    async fn test_failure_closes_until_next_success() {
        let gate = TradingGate::new();
        gate.mark_reconciled(ReconcileMode::Full).await;
        gate.mark_failed("exchange unavailable").await;

        assert_eq!(
            gate.admission().await,
            Admission::NotReady {
                reason: Some("exchange unavailable".to_string())
            }
        );

        gate.mark_reconciled(ReconcileMode::Soft).await;
        assert!(gate.can_submit().await);
        assert!(gate.status().await.last_failure.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_expires() {
        let gate = TradingGate::new();
        gate.mark_reconciled(ReconcileMode::Full).await;
        gate.pause_orders(Duration::from_secs(30), "server error").await;

        assert!(matches!(gate.admission().await, Admission::Paused { .. }));
        let status = gate.status().await;
        assert_eq!(status.pause_remaining_ms, Some(30_000));
        assert_eq!(status.pause_reason.as_deref(), Some("server error"));

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(gate.can_submit().await);
        assert!(gate.status().await.pause_reason.is_none());
    }
}
