//! Core runtime: wires the ledger, position store, reconciler, trading gate
//! and stream sessions together and owns their shutdown order.

use crate::gate::TradingGate;
use crate::intent::IntentGateway;
use crate::stream::{StreamConfig, StreamSessionManager};
use crate::sync::{
    ReconcileError, ReconcileHandle, ReconcileService, ReconcileServiceConfig, Reconciler,
    ReconcilerConfig,
};
use keel_data::{Ledger, LedgerConfig, LedgerError, PositionRepository, PositionStore, StoreError};
use keel_domain::{GapInfo, ReconcileMode};
use keel_protocols::{Exchange, MarketTransport};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Capacity of the gap notification queue.
const GAP_QUEUE: usize = 64;

/// Errors raised while starting or stopping the core.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("failed to open ledger: {0}")]
    Ledger(#[from] LedgerError),

    #[error("failed to open position store: {0}")]
    Store(#[from] StoreError),

    /// Startup reconciliation failed; trading must not begin.
    #[error("startup reconciliation failed: {0}")]
    Reconcile(#[from] ReconcileError),
}

/// Configuration for the core runtime.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    pub ledger: LedgerConfig,
    /// Position store snapshot file.
    pub positions_path: PathBuf,
    pub reconciler: ReconcilerConfig,
    pub stream: StreamConfig,
    pub service: ReconcileServiceConfig,
    /// Request a soft reconciliation whenever a market data gap is reported.
    pub reconcile_on_gap: bool,
}

impl CoreConfig {
    /// Creates a config with every file under `data_dir`.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        Self {
            ledger: LedgerConfig::new(data_dir.join("ledger")),
            positions_path: data_dir.join("positions.json"),
            reconciler: ReconcilerConfig::default(),
            stream: StreamConfig::default(),
            service: ReconcileServiceConfig::default(),
            reconcile_on_gap: true,
        }
    }
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self::new("data")
    }
}

/// Running trading core.
pub struct KeelCore {
    ledger: Arc<Ledger>,
    store: PositionStore,
    gate: TradingGate,
    gateway: IntentGateway,
    reconciler: Arc<Reconciler>,
    reconcile: ReconcileHandle,
    streams: StreamSessionManager,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl KeelCore {
    /// Opens storage and runs a full reconciliation before anything else.
    ///
    /// # Errors
    ///
    /// Returns an error if storage cannot be opened or the full pass fails.
    /// Nothing keeps running in that case.
    pub async fn start(
        config: CoreConfig,
        exchange: Arc<dyn Exchange>,
        transport: Arc<dyn MarketTransport>,
    ) -> Result<Self, CoreError> {
        info!(
            ledger_dir = %config.ledger.dir.display(),
            positions = %config.positions_path.display(),
            "Starting keel core"
        );

        let ledger = Arc::new(Ledger::open(config.ledger.clone()).await?);
        let store = match PositionStore::open(PositionRepository::new(&config.positions_path)).await {
            Ok(store) => store,
            Err(e) => {
                close_ledger(&ledger).await;
                return Err(e.into());
            }
        };

        let gate = TradingGate::new();
        let reconciler = Arc::new(Reconciler::new(
            exchange,
            ledger.clone(),
            store.clone(),
            gate.clone(),
            config.reconciler.clone(),
        ));

        if let Err(e) = reconciler.reconcile(ReconcileMode::Full).await {
            error!(error = %e, "Refusing to trade, startup reconciliation failed");
            store.shutdown().await;
            close_ledger(&ledger).await;
            return Err(e.into());
        }

        let cancel = CancellationToken::new();
        let (reconcile, service_task) =
            ReconcileService::spawn(reconciler.clone(), config.service.clone(), cancel.child_token());
        let mut tasks = vec![service_task];

        let mut streams = StreamSessionManager::new(transport, config.stream.clone(), gate.clone());
        if config.reconcile_on_gap {
            let (tx, rx) = mpsc::channel(GAP_QUEUE);
            streams = streams.with_gap_listener(tx);
            tasks.push(tokio::spawn(forward_gaps(
                rx,
                reconcile.clone(),
                cancel.child_token(),
            )));
        }

        let gateway = IntentGateway::new(ledger.clone(), store.clone(), gate.clone());
        info!("Keel core ready");

        Ok(Self {
            ledger,
            store,
            gate,
            gateway,
            reconciler,
            reconcile,
            streams,
            cancel,
            tasks: Mutex::new(tasks),
        })
    }

    pub fn gate(&self) -> &TradingGate {
        &self.gate
    }

    pub fn gateway(&self) -> &IntentGateway {
        &self.gateway
    }

    pub fn streams(&self) -> &StreamSessionManager {
        &self.streams
    }

    pub fn reconcile_handle(&self) -> &ReconcileHandle {
        &self.reconcile
    }

    pub fn reconciler(&self) -> &Arc<Reconciler> {
        &self.reconciler
    }

    pub fn store(&self) -> &PositionStore {
        &self.store
    }

    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    /// Stops streams, then the reconcile service, then flushes and closes storage.
    ///
    /// # Errors
    ///
    /// Returns an error if the final ledger flush fails.
    pub async fn shutdown(&self) -> Result<(), CoreError> {
        info!("Shutting down keel core");
        self.streams.shutdown().await;

        self.cancel.cancel();
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Core task failed");
            }
        }

        let flushed = self.ledger.flush().await;
        let closed = self.ledger.shutdown().await;
        self.store.shutdown().await;
        flushed?;
        closed?;
        info!("Keel core stopped");
        Ok(())
    }
}

/// Turns market data gaps into soft reconciliation requests.
async fn forward_gaps(
    mut gaps: mpsc::Receiver<GapInfo>,
    reconcile: ReconcileHandle,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            gap = gaps.recv() => match gap {
                Some(gap) => {
                    if !reconcile.request_soft() {
                        debug!(session_id = gap.session_id, "Soft reconciliation already queued");
                    }
                }
                None => break,
            },
        }
    }
}

async fn close_ledger(ledger: &Ledger) {
    if let Err(e) = ledger.shutdown().await {
        warn!(error = %e, "Failed to close ledger");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intent::IntentError;
    use keel_domain::{ExchangePosition, OrderIntent, Side};
    use keel_protocols::TransportError;
    use keel_protocols::paper::{ConnectScript, PaperExchange, ScriptStep, ScriptedTransport};
    use rust_decimal_macros::dec;
    use std::time::Duration;

    fn config(dir: &std::path::Path) -> CoreConfig {
        let mut config = CoreConfig::new(dir);
        config.reconciler.exchange_attempts = 1;
        config.reconciler.retry_base = Duration::from_millis(1);
        config.stream.backoff_base = Duration::from_millis(10);
        config.stream.resubscribe_spacing = Duration::ZERO;
        config
    }

    #[tokio::test]
    async fn test_start_adopts_orphans_and_opens_gate() {
        let dir = tempfile::tempdir().unwrap();
        let exchange = PaperExchange::new();
        exchange
            .open_position(ExchangePosition::from_signed("ETHUSDT", dec!(-2), dec!(3100)).unwrap())
            .await;

        let core = KeelCore::start(
            config(dir.path()),
            Arc::new(exchange.clone()),
            Arc::new(ScriptedTransport::default()),
        )
        .await
        .unwrap();

        assert!(core.gate().is_ready());
        assert!(core.store().get("ETHUSDT").await.unwrap().is_some());
        assert_eq!(exchange.protective_orders("ETHUSDT").await.len(), 1);

        let intent = OrderIntent::new("ETHUSDT", Side::Buy, dec!(2), None).unwrap();
        core.gateway().submit_order(intent).await.unwrap();
        core.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_start_fails_closed_when_exchange_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let exchange = PaperExchange::new();
        exchange.set_unavailable(true);

        let result = KeelCore::start(
            config(dir.path()),
            Arc::new(exchange),
            Arc::new(ScriptedTransport::default()),
        )
        .await;
        assert!(matches!(
            result,
            Err(CoreError::Reconcile(ReconcileError::ExchangeUnavailable { .. }))
        ));
    }

    #[tokio::test]
    async fn test_orders_rejected_after_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let core = KeelCore::start(
            config(dir.path()),
            Arc::new(PaperExchange::new()),
            Arc::new(ScriptedTransport::default()),
        )
        .await
        .unwrap();
        let gateway = core.gateway().clone();
        core.shutdown().await.unwrap();

        let intent = OrderIntent::new("BTCUSDT", Side::Sell, dec!(1), None).unwrap();
        assert!(matches!(
            gateway.submit_order(intent).await,
            Err(IntentError::Durability(_))
        ));
    }

    #[tokio::test]
    async fn test_gap_triggers_soft_reconciliation() {
        let dir = tempfile::tempdir().unwrap();
        let exchange = PaperExchange::new();
        let transport = ScriptedTransport::new([
            ConnectScript::Accept(vec![ScriptStep::Fail(TransportError::Disconnected(
                "reset".to_string(),
            ))]),
            ConnectScript::Accept(Vec::new()),
        ]);

        let core = KeelCore::start(
            config(dir.path()),
            Arc::new(exchange.clone()),
            Arc::new(transport),
        )
        .await
        .unwrap();
        let after_start = exchange.query_count();
        let _events = core.streams().subscribe(["BTCUSDT"]).await;

        let reconciled = tokio::time::timeout(Duration::from_secs(5), async {
            while exchange.query_count() == after_start {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(reconciled.is_ok());

        core.shutdown().await.unwrap();
    }
}
