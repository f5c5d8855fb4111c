//! Entry point for everything the execution layer wants recorded.

use crate::gate::{Admission, TradingGate};
use keel_data::{Ledger, LedgerError, PositionStore, StoreError};
use keel_domain::{
    CancelIntent, FillConfirmation, IntentRecord, MarketData, OrderIntent, PositionRecord,
};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info};

/// Errors returned to the execution layer.
#[derive(Debug, Error)]
pub enum IntentError {
    #[error("trading not ready: {}", reason.as_deref().unwrap_or("awaiting full reconciliation"))]
    NotReady { reason: Option<String> },

    #[error("new orders paused for {}ms: {reason}", remaining.as_millis())]
    Paused { remaining: Duration, reason: String },

    /// The intent is not confirmed durable and must not be executed.
    #[error("intent not durable: {0}")]
    Durability(#[source] LedgerError),

    #[error("informational record rejected: {0}")]
    Buffered(#[source] LedgerError),

    #[error("position store failed: {0}")]
    Store(#[from] StoreError),
}

/// Records intents in the ledger, enforcing the trading gate for new orders.
#[derive(Clone)]
pub struct IntentGateway {
    ledger: Arc<Ledger>,
    store: PositionStore,
    gate: TradingGate,
}

impl IntentGateway {
    /// Creates a new IntentGateway.
    pub fn new(ledger: Arc<Ledger>, store: PositionStore, gate: TradingGate) -> Self {
        Self { ledger, store, gate }
    }

    /// Durably records a new order intent.
    ///
    /// Only an `Ok` return allows the order to be sent.
    pub async fn submit_order(&self, intent: OrderIntent) -> Result<IntentRecord, IntentError> {
        match self.gate.admission().await {
            Admission::Open => {}
            Admission::NotReady { reason } => return Err(IntentError::NotReady { reason }),
            Admission::Paused { remaining, reason } => {
                return Err(IntentError::Paused { remaining, reason });
            }
        }

        let record = self.critical(intent.into()).await?;
        info!(seq = record.seq, symbol = %record.symbol(), "Order intent recorded");
        Ok(record)
    }

    /// Durably records a cancel. Cancels are never gated.
    pub async fn submit_cancel(&self, cancel: CancelIntent) -> Result<IntentRecord, IntentError> {
        self.critical(cancel.into()).await
    }

    /// Durably records a fill, resolving its order intent.
    pub async fn confirm_fill(&self, fill: FillConfirmation) -> Result<IntentRecord, IntentError> {
        self.critical(fill.into()).await
    }

    /// Records a market data point on the buffered tier.
    pub async fn record_market_data(&self, data: MarketData) -> Result<(), IntentError> {
        self.ledger
            .append_buffered(data)
            .await
            .map_err(IntentError::Buffered)
    }

    /// Stores the position opened by a confirmed fill.
    pub async fn record_position(&self, record: PositionRecord) -> Result<(), IntentError> {
        debug!(symbol = %record.symbol, quantity = %record.quantity, "Recording position");
        self.store.upsert(record).await?;
        Ok(())
    }

    async fn critical(&self, entry: keel_domain::RecordEntry) -> Result<IntentRecord, IntentError> {
        let kind = entry.kind();
        self.ledger.append_critical(entry).await.map_err(|e| {
            error!(kind = %kind, error = %e, "Ledger append failed, intent not confirmed");
            IntentError::Durability(e)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_data::{LedgerConfig, PositionRepository};
    use keel_domain::{ReconcileMode, Side};
    use rust_decimal_macros::dec;

    async fn gateway(dir: &std::path::Path) -> (IntentGateway, Arc<Ledger>, TradingGate) {
        let ledger = Arc::new(Ledger::open(LedgerConfig::new(dir.join("ledger"))).await.unwrap());
        let store = PositionStore::open(PositionRepository::new(dir.join("positions.json")))
            .await
            .unwrap();
        let gate = TradingGate::new();
        (
            IntentGateway::new(ledger.clone(), store, gate.clone()),
            ledger,
            gate,
        )
    }

    fn order() -> OrderIntent {
        OrderIntent::new("BTCUSDT", Side::Buy, dec!(0.1), Some(dec!(64000))).unwrap()
    }

    #[tokio::test]
    async fn test_orders_rejected_before_reconciliation() {
        let dir = tempfile::tempdir().unwrap();
        let (gateway, ledger, _gate) = gateway(dir.path()).await;

        let err = gateway.submit_order(order()).await.unwrap_err();
        assert!(matches!(err, IntentError::NotReady { .. }));
        assert_eq!(ledger.replay().unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_paused_gate_rejects_orders_but_not_cancels() {
        let dir = tempfile::tempdir().unwrap();
        let (gateway, _ledger, gate) = gateway(dir.path()).await;
        gate.mark_reconciled(ReconcileMode::Full).await;
        gate.pause_orders(Duration::from_secs(30), "server error").await;

        let intent = order();
        assert!(matches!(
            gateway.submit_order(intent.clone()).await,
            Err(IntentError::Paused { .. })
        ));
        assert!(gateway.submit_cancel(CancelIntent::for_order(&intent)).await.is_ok());
    }

    #[tokio::test]
    async fn test_ready_gate_records_intent_and_fill() {
        let dir = tempfile::tempdir().unwrap();
        let (gateway, ledger, gate) = gateway(dir.path()).await;
        gate.mark_reconciled(ReconcileMode::Full).await;

        let intent = order();
        let recorded = gateway.submit_order(intent.clone()).await.unwrap();
        let fill = gateway
            .confirm_fill(FillConfirmation::for_order(&intent, dec!(0.1), dec!(64010)))
            .await
            .unwrap();
        assert_eq!(fill.seq, recorded.seq + 1);

        gateway
            .record_market_data(MarketData::new("BTCUSDT", dec!(64020)))
            .await
            .unwrap();
        ledger.flush().await.unwrap();
        assert_eq!(ledger.replay().unwrap().count(), 3);
    }

    #[tokio::test]
    async fn test_closed_ledger_is_a_durability_failure() {
        let dir = tempfile::tempdir().unwrap();
        let (gateway, ledger, gate) = gateway(dir.path()).await;
        gate.mark_reconciled(ReconcileMode::Full).await;
        ledger.shutdown().await.unwrap();

        let err = gateway.submit_order(order()).await.unwrap_err();
        assert!(matches!(err, IntentError::Durability(LedgerError::WriterClosed)));
    }
}
