//! Scheduled and on-demand reconciliation.

use super::reconciler::{ReconcileError, Reconciler};
use keel_domain::{ReconcileMode, ReconciliationReport};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

type ReconcileReply = oneshot::Sender<Result<ReconciliationReport, ReconcileError>>;

/// Configuration for the reconcile service.
#[derive(Debug, Clone)]
pub struct ReconcileServiceConfig {
    /// Interval between scheduled soft passes.
    pub soft_interval: Duration,
    /// Capacity of the request queue.
    pub queue_capacity: usize,
}

impl Default for ReconcileServiceConfig {
    fn default() -> Self {
        Self {
            soft_interval: Duration::from_secs(3600),
            queue_capacity: 16,
        }
    }
}

struct ReconcileRequest {
    mode: ReconcileMode,
    reply: Option<ReconcileReply>,
}

/// Handle for requesting reconciliation passes.
#[derive(Clone)]
pub struct ReconcileHandle {
    tx: mpsc::Sender<ReconcileRequest>,
    /// Set while an unanswered soft request sits in the queue.
    soft_pending: Arc<AtomicBool>,
}

impl ReconcileHandle {
    /// Runs a pass and waits for its report.
    pub async fn reconcile(&self, mode: ReconcileMode) -> Result<ReconciliationReport, ReconcileError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(ReconcileRequest {
                mode,
                reply: Some(reply),
            })
            .await
            .map_err(|_| ReconcileError::ServiceStopped)?;
        rx.await.map_err(|_| ReconcileError::ServiceStopped)?
    }

    /// Queues a soft pass without waiting. Returns false if one is already
    /// queued, the queue is full, or the service has stopped.
    pub fn request_soft(&self) -> bool {
        if self.soft_pending.swap(true, Ordering::AcqRel) {
            return false;
        }
        let queued = self
            .tx
            .try_send(ReconcileRequest {
                mode: ReconcileMode::Soft,
                reply: None,
            })
            .is_ok();
        if !queued {
            self.soft_pending.store(false, Ordering::Release);
        }
        queued
    }
}

/// Runs scheduled soft passes and serves forced ones.
pub struct ReconcileService {
    reconciler: Arc<Reconciler>,
    config: ReconcileServiceConfig,
    rx: mpsc::Receiver<ReconcileRequest>,
    soft_pending: Arc<AtomicBool>,
}

impl ReconcileService {
    /// Spawns the service. It stops when `cancel` fires, after any pass in progress.
    pub fn spawn(
        reconciler: Arc<Reconciler>,
        config: ReconcileServiceConfig,
        cancel: CancellationToken,
    ) -> (ReconcileHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let soft_pending = Arc::new(AtomicBool::new(false));
        let service = Self {
            reconciler,
            config,
            rx,
            soft_pending: soft_pending.clone(),
        };
        let handle = tokio::spawn(service.run(cancel));
        (ReconcileHandle { tx, soft_pending }, handle)
    }

    async fn run(mut self, cancel: CancellationToken) {
        info!(
            soft_interval_secs = self.config.soft_interval.as_secs(),
            "Starting reconcile service"
        );
        let mut ticker = interval_at(
            Instant::now() + self.config.soft_interval,
            self.config.soft_interval,
        );
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                request = self.rx.recv() => match request {
                    Some(ReconcileRequest { mode, reply }) => {
                        debug!(mode = %mode, "Reconciliation requested");
                        if reply.is_none() {
                            // Gaps seen during this pass queue the next one.
                            self.soft_pending.store(false, Ordering::Release);
                        }
                        let result = self.reconciler.reconcile(mode).await;
                        match reply {
                            Some(reply) => {
                                let _ = reply.send(result);
                            }
                            None => {
                                if let Err(e) = result {
                                    warn!(mode = %mode, error = %e, "Requested reconciliation failed");
                                }
                            }
                        }
                    }
                    None => break,
                },
                _ = ticker.tick() => {
                    if let Err(e) = self.reconciler.reconcile(ReconcileMode::Soft).await {
                        warn!(error = %e, "Scheduled soft reconciliation failed");
                    }
                }
            }
        }

        self.rx.close();
        info!("Reconcile service stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gate::TradingGate;
    use crate::sync::ReconcilerConfig;
    use keel_data::{Ledger, LedgerConfig, PositionRepository, PositionStore};
    use keel_domain::ExchangePosition;
    use keel_protocols::paper::PaperExchange;
    use rust_decimal_macros::dec;

    async fn reconciler(dir: &std::path::Path, exchange: &PaperExchange) -> Arc<Reconciler> {
        let ledger = Arc::new(Ledger::open(LedgerConfig::new(dir.join("ledger"))).await.unwrap());
        let store = PositionStore::open(PositionRepository::new(dir.join("positions.json")))
            .await
            .unwrap();
        Arc::new(Reconciler::new(
            Arc::new(exchange.clone()),
            ledger,
            store,
            TradingGate::new(),
            ReconcilerConfig::default(),
        ))
    }

    #[tokio::test]
    async fn test_forced_reconcile_returns_report() {
        let dir = tempfile::tempdir().unwrap();
        let exchange = PaperExchange::new();
        exchange
            .open_position(ExchangePosition::from_signed("BTCUSDT", dec!(1), dec!(64000)).unwrap())
            .await;
        let cancel = CancellationToken::new();
        let (handle, task) = ReconcileService::spawn(
            reconciler(dir.path(), &exchange).await,
            ReconcileServiceConfig::default(),
            cancel.clone(),
        );

        let report = handle.reconcile(ReconcileMode::Full).await.unwrap();
        assert_eq!(report.orphan_adopted.len(), 1);

        cancel.cancel();
        task.await.unwrap();
        assert!(matches!(
            handle.reconcile(ReconcileMode::Soft).await,
            Err(ReconcileError::ServiceStopped)
        ));
    }

    #[tokio::test]
    async fn test_repeated_soft_requests_coalesce() {
        let dir = tempfile::tempdir().unwrap();
        let exchange = PaperExchange::new();
        let cancel = CancellationToken::new();
        let (handle, task) = ReconcileService::spawn(
            reconciler(dir.path(), &exchange).await,
            ReconcileServiceConfig::default(),
            cancel.clone(),
        );

        assert!(handle.request_soft());
        for _ in 0..10 {
            assert!(!handle.request_soft());
        }
        // Served after the queued soft pass.
        handle.reconcile(ReconcileMode::Soft).await.unwrap();
        assert_eq!(exchange.query_count(), 2);
        assert!(handle.request_soft());

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_soft_pass_runs_on_schedule() {
        let dir = tempfile::tempdir().unwrap();
        let exchange = PaperExchange::new();
        let cancel = CancellationToken::new();
        let (_handle, task) = ReconcileService::spawn(
            reconciler(dir.path(), &exchange).await,
            ReconcileServiceConfig {
                soft_interval: Duration::from_secs(60),
                ..Default::default()
            },
            cancel.clone(),
        );

        tokio::time::sleep(Duration::from_secs(150)).await;
        assert_eq!(exchange.query_count(), 2);

        cancel.cancel();
        task.await.unwrap();
    }
}
