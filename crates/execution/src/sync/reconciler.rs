//! Position reconciler: ledger, exchange and position store agreement.

use crate::gate::TradingGate;
use chrono::Utc;
use keel_data::{Ledger, LedgerError, PositionStore, StoreError};
use keel_domain::{
    AdoptedPosition, ClosedPosition, DeadIntent, ExchangePosition, MatchedPosition, OrderIntent,
    Percentage, PositionRecord, ReconcileMode, ReconciliationReport, RecordEntry,
};
use keel_protocols::{Exchange, ExchangeError};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Errors that fail a reconciliation pass.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("exchange unavailable after {attempts} attempts: {last_error}")]
    ExchangeUnavailable { attempts: u32, last_error: String },

    #[error("ledger replay failed: {0}")]
    Ledger(#[from] LedgerError),

    #[error("position store failed: {0}")]
    Store(#[from] StoreError),

    #[error("could not protect orphan position {symbol}: {source}")]
    Protection {
        symbol: String,
        #[source]
        source: ExchangeError,
    },

    #[error("reconcile service has stopped")]
    ServiceStopped,
}

/// Configuration for the reconciler.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Timeout for one exchange position query.
    pub exchange_timeout: Duration,
    /// Query attempts before the pass fails.
    pub exchange_attempts: u32,
    /// Pause after the first failed query, doubled after each further failure.
    pub retry_base: Duration,
    /// Distance of the protective stop placed on an adopted position.
    pub stop_distance: Percentage,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            exchange_timeout: Duration::from_secs(30),
            exchange_attempts: 3,
            retry_base: Duration::from_secs(1),
            stop_distance: Percentage::DEFAULT_STOP,
        }
    }
}

/// Order intent with no fill seen in the ledger.
#[derive(Debug, Clone)]
struct Unresolved {
    seq: u64,
    intent: OrderIntent,
}

/// Outcome of replaying the ledger since the checkpoint.
#[derive(Debug, Default)]
struct ReplaySummary {
    records: usize,
    last_seq: Option<u64>,
    unresolved: Vec<Unresolved>,
}

/// Reconciler for keeping local positions in line with the exchange.
pub struct Reconciler {
    exchange: Arc<dyn Exchange>,
    ledger: Arc<Ledger>,
    store: PositionStore,
    gate: TradingGate,
    config: ReconcilerConfig,
    /// Held for the whole pass so passes never interleave.
    pass: Mutex<()>,
    last_report: RwLock<Option<ReconciliationReport>>,
}

impl Reconciler {
    /// Creates a new reconciler.
    pub fn new(
        exchange: Arc<dyn Exchange>,
        ledger: Arc<Ledger>,
        store: PositionStore,
        gate: TradingGate,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            exchange,
            ledger,
            store,
            gate,
            config,
            pass: Mutex::new(()),
            last_report: RwLock::new(None),
        }
    }

    /// Runs one reconciliation pass.
    ///
    /// On success the trading gate is marked reconciled; on any failure it
    /// is closed until a later pass succeeds.
    pub async fn reconcile(&self, mode: ReconcileMode) -> Result<ReconciliationReport, ReconcileError> {
        let _pass = self.pass.lock().await;
        info!(mode = %mode, "Starting reconciliation");

        match self.run_pass(mode).await {
            Ok(report) => {
                self.gate.mark_reconciled(mode).await;
                info!(
                    mode = %mode,
                    matched = report.matched.len(),
                    adopted = report.orphan_adopted.len(),
                    closed = report.closed_externally.len(),
                    dead = report.dead_intents.len(),
                    replayed = report.replayed_records,
                    "Reconciliation complete"
                );
                *self.last_report.write().await = Some(report.clone());
                Ok(report)
            }
            Err(e) => {
                error!(mode = %mode, error = %e, "Reconciliation failed");
                self.gate.mark_failed(&e.to_string()).await;
                Err(e)
            }
        }
    }

    /// Report of the last successful pass.
    pub async fn last_report(&self) -> Option<ReconciliationReport> {
        self.last_report.read().await.clone()
    }

    async fn run_pass(&self, mode: ReconcileMode) -> Result<ReconciliationReport, ReconcileError> {
        let mut report = ReconciliationReport::new(mode);

        let snapshot = self.store.snapshot().await?;
        let mut replay = if mode == ReconcileMode::Full {
            self.replay_since(snapshot.checkpoint_seq).await?
        } else {
            ReplaySummary::default()
        };
        report.replayed_records = replay.records;

        let exchange_positions = self.fetch_positions().await?;
        let exchange_symbols: HashSet<String> =
            exchange_positions.iter().map(|p| p.symbol.clone()).collect();
        let local = snapshot.positions;

        for position in &exchange_positions {
            match local.get(&position.symbol) {
                Some(record) => {
                    report.matched.push(self.verify(record, position).await?);
                }
                None => {
                    let ledger_intent = take_intent_for(&mut replay.unresolved, &position.symbol);
                    report
                        .orphan_adopted
                        .push(self.adopt(position, ledger_intent).await?);
                }
            }
        }

        for record in local.values() {
            if !exchange_symbols.contains(&record.symbol) {
                report.closed_externally.push(self.purge(record).await?);
            }
        }

        if mode == ReconcileMode::Full {
            for Unresolved { seq, intent } in replay.unresolved {
                if exchange_symbols.contains(&intent.symbol) || local.contains_key(&intent.symbol) {
                    continue;
                }
                warn!(
                    intent_id = %intent.intent_id,
                    seq,
                    symbol = %intent.symbol,
                    side = %intent.side,
                    quantity = %intent.quantity,
                    "Dead intent: logged but never executed, discarding"
                );
                report.dead_intents.push(DeadIntent {
                    intent_id: intent.intent_id,
                    seq,
                    symbol: intent.symbol,
                    side: intent.side,
                    quantity: intent.quantity,
                });
            }

            if let Some(seq) = replay.last_seq {
                self.store.set_checkpoint(seq).await?;
            }
            report.checkpoint_seq = replay.last_seq.or(snapshot.checkpoint_seq);
        }

        report.finish();
        Ok(report)
    }

    /// Replays the ledger after `checkpoint` and collects unfilled order intents.
    async fn replay_since(&self, checkpoint: Option<u64>) -> Result<ReplaySummary, ReconcileError> {
        let reader = self.ledger.reader();
        let from = checkpoint.map_or(0, |seq| seq + 1);

        let summary = tokio::task::spawn_blocking(move || -> Result<ReplaySummary, LedgerError> {
            let mut open: BTreeMap<Uuid, Unresolved> = BTreeMap::new();
            let mut summary = ReplaySummary::default();

            for record in reader.replay_from(from)? {
                let record = record?;
                summary.records += 1;
                summary.last_seq = Some(record.seq);
                match record.entry {
                    RecordEntry::OrderIntent(intent) => {
                        open.insert(
                            intent.intent_id,
                            Unresolved {
                                seq: record.seq,
                                intent,
                            },
                        );
                    }
                    RecordEntry::FillConfirmation(fill) => {
                        open.remove(&fill.intent_id);
                    }
                    RecordEntry::CancelIntent(_) | RecordEntry::MarketData(_) => {}
                }
            }

            summary.unresolved = open.into_values().collect();
            summary.unresolved.sort_by_key(|u| u.seq);
            Ok(summary)
        })
        .await
        .map_err(|e| LedgerError::from(std::io::Error::other(e)))??;

        debug!(
            from,
            records = summary.records,
            unresolved = summary.unresolved.len(),
            "Ledger replayed for reconciliation"
        );
        Ok(summary)
    }

    /// Queries open positions with a timeout and a bounded retry budget.
    async fn fetch_positions(&self) -> Result<Vec<ExchangePosition>, ReconcileError> {
        let attempts = self.config.exchange_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 0..attempts {
            match tokio::time::timeout(self.config.exchange_timeout, self.exchange.get_open_positions())
                .await
            {
                Ok(Ok(positions)) => return Ok(positions),
                Ok(Err(e)) => last_error = e.to_string(),
                Err(_) => {
                    last_error = format!(
                        "no response within {}s",
                        self.config.exchange_timeout.as_secs()
                    )
                }
            }

            warn!(
                attempt = attempt + 1,
                attempts,
                error = %last_error,
                "Exchange position query failed"
            );
            if attempt + 1 < attempts {
                tokio::time::sleep(self.config.retry_base.saturating_mul(1 << attempt.min(16))).await;
            }
        }

        Err(ReconcileError::ExchangeUnavailable {
            attempts,
            last_error,
        })
    }

    /// Refreshes a matched record, taking the exchange's size if it drifted.
    async fn verify(
        &self,
        record: &PositionRecord,
        position: &ExchangePosition,
    ) -> Result<MatchedPosition, ReconcileError> {
        let mut updated = record.clone();
        updated.last_verified = Utc::now();

        let adjusted_from = if record.drifted_from(position) {
            warn!(
                symbol = %record.symbol,
                local_side = %record.side,
                local_quantity = %record.quantity,
                exchange_side = %position.side,
                exchange_quantity = %position.quantity,
                "Position size drifted, adopting exchange values"
            );
            updated.side = position.side;
            updated.quantity = position.quantity;
            Some((record.side, record.quantity))
        } else {
            None
        };

        self.store.upsert(updated).await?;
        Ok(MatchedPosition {
            symbol: position.symbol.clone(),
            side: position.side,
            quantity: position.quantity,
            adjusted_from,
        })
    }

    /// Protects and records a position found only on the exchange.
    ///
    /// The protective order is placed before the record is written, so a
    /// stored adopted record always carries its stop. If the record cannot be
    /// written the stop is cancelled again, so the next pass that adopts the
    /// position leaves exactly one protective order resting.
    async fn adopt(
        &self,
        position: &ExchangePosition,
        ledger_intent: Option<Uuid>,
    ) -> Result<AdoptedPosition, ReconcileError> {
        let reference = position.reference_price();
        let stop_price = self.config.stop_distance.stop_price(position.side, reference);

        let order_id = self
            .exchange
            .place_protective_order(
                &position.symbol,
                position.side.opposite(),
                position.quantity,
                stop_price,
            )
            .await
            .map_err(|source| ReconcileError::Protection {
                symbol: position.symbol.clone(),
                source,
            })?;

        if let Err(e) = self
            .store
            .upsert(PositionRecord::adopted(position, order_id.clone()))
            .await
        {
            match self.exchange.cancel_order(&position.symbol, &order_id).await {
                Ok(()) => warn!(
                    symbol = %position.symbol,
                    protective_order_id = %order_id,
                    error = %e,
                    "Adoption not recorded, protective order withdrawn"
                ),
                Err(cancel_error) => error!(
                    symbol = %position.symbol,
                    protective_order_id = %order_id,
                    error = %e,
                    cancel_error = %cancel_error,
                    "Adoption not recorded and protective order could not be withdrawn"
                ),
            }
            return Err(e.into());
        }

        warn!(
            symbol = %position.symbol,
            side = %position.side,
            quantity = %position.quantity,
            reference_price = %reference,
            stop_price = %stop_price,
            protective_order_id = %order_id,
            ledger_intent = ?ledger_intent,
            "Orphan position adopted and protected"
        );
        Ok(AdoptedPosition {
            symbol: position.symbol.clone(),
            side: position.side,
            quantity: position.quantity,
            stop_price,
            protective_order_id: order_id,
            ledger_intent,
        })
    }

    /// Drops a record whose position no longer exists on the exchange.
    async fn purge(&self, record: &PositionRecord) -> Result<ClosedPosition, ReconcileError> {
        for order_id in &record.protective_order_ids {
            if let Err(e) = self.exchange.cancel_order(&record.symbol, order_id).await {
                debug!(symbol = %record.symbol, order_id = %order_id, error = %e, "Protective order already gone");
            }
        }
        self.store.remove(&record.symbol).await?;

        info!(
            symbol = %record.symbol,
            side = %record.side,
            quantity = %record.quantity,
            "Position closed externally, record purged"
        );
        Ok(ClosedPosition {
            symbol: record.symbol.clone(),
            side: record.side,
            quantity: record.quantity,
            was_adopted: record.adopted,
        })
    }
}

/// Removes and returns the oldest unresolved intent for `symbol`.
fn take_intent_for(unresolved: &mut Vec<Unresolved>, symbol: &str) -> Option<Uuid> {
    let index = unresolved.iter().position(|u| u.intent.symbol == symbol)?;
    Some(unresolved.remove(index).intent.intent_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_data::{LedgerConfig, PositionRepository};
    use keel_domain::{FillConfirmation, Side};
    use keel_protocols::paper::PaperExchange;
    use rust_decimal_macros::dec;

    struct Harness {
        _dir: tempfile::TempDir,
        exchange: PaperExchange,
        ledger: Arc<Ledger>,
        store: PositionStore,
        gate: TradingGate,
        reconciler: Reconciler,
    }

    async fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let exchange = PaperExchange::new();
        let ledger = Arc::new(
            Ledger::open(LedgerConfig::new(dir.path().join("ledger")))
                .await
                .unwrap(),
        );
        let store = PositionStore::open(PositionRepository::new(dir.path().join("positions.json")))
            .await
            .unwrap();
        let gate = TradingGate::new();
        let reconciler = Reconciler::new(
            Arc::new(exchange.clone()),
            ledger.clone(),
            store.clone(),
            gate.clone(),
            ReconcilerConfig {
                retry_base: Duration::from_millis(10),
                ..Default::default()
            },
        );
        Harness {
            _dir: dir,
            exchange,
            ledger,
            store,
            gate,
            reconciler,
        }
    }

    #[tokio::test]
    async fn test_unfilled_intent_without_position_is_dead() {
        let h = harness().await;
        let intent = OrderIntent::new("BTCUSDT", Side::Buy, dec!(0.1), Some(dec!(64000))).unwrap();
        let record = h.ledger.append_critical(intent.clone()).await.unwrap();

        let report = h.reconciler.reconcile(ReconcileMode::Full).await.unwrap();

        assert_eq!(report.dead_intents.len(), 1);
        assert_eq!(report.dead_intents[0].intent_id, intent.intent_id);
        assert_eq!(report.dead_intents[0].seq, record.seq);
        assert!(h.store.positions().await.unwrap().is_empty());
        assert_eq!(report.checkpoint_seq, Some(record.seq));
        assert!(h.gate.can_submit().await);
    }

    #[tokio::test]
    async fn test_filled_intent_is_not_dead() {
        let h = harness().await;
        let intent = OrderIntent::new("BTCUSDT", Side::Buy, dec!(0.1), None).unwrap();
        h.ledger.append_critical(intent.clone()).await.unwrap();
        h.ledger
            .append_critical(FillConfirmation::for_order(&intent, dec!(0.1), dec!(64000)))
            .await
            .unwrap();

        let report = h.reconciler.reconcile(ReconcileMode::Full).await.unwrap();
        assert!(report.dead_intents.is_empty());
        assert_eq!(report.replayed_records, 2);
    }

    #[tokio::test]
    async fn test_orphan_short_is_adopted_with_stop_above() {
        let h = harness().await;
        h.exchange
            .open_position(
                ExchangePosition::from_signed("ETHUSDT", dec!(-2), dec!(3000))
                    .unwrap()
                    .with_mark_price(dec!(3100)),
            )
            .await;

        let report = h.reconciler.reconcile(ReconcileMode::Full).await.unwrap();

        assert_eq!(report.orphan_adopted.len(), 1);
        let adopted = &report.orphan_adopted[0];
        assert_eq!(adopted.side, Side::Sell);
        assert_eq!(adopted.stop_price, dec!(3162));

        let orders = h.exchange.protective_orders("ETHUSDT").await;
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].side, Side::Buy);
        assert_eq!(orders[0].quantity, dec!(2));

        let stored = h.store.get("ETHUSDT").await.unwrap().unwrap();
        assert!(stored.adopted);
        assert_eq!(stored.protective_order_ids, vec![orders[0].order_id.clone()]);
    }

    #[tokio::test]
    async fn test_adoption_is_attributed_to_open_intent() {
        let h = harness().await;
        let intent = OrderIntent::new("ETHUSDT", Side::Sell, dec!(2), None).unwrap();
        h.ledger.append_critical(intent.clone()).await.unwrap();
        h.exchange
            .open_position(ExchangePosition::from_signed("ETHUSDT", dec!(-2), dec!(3000)).unwrap())
            .await;

        let report = h.reconciler.reconcile(ReconcileMode::Full).await.unwrap();
        assert_eq!(report.orphan_adopted[0].ledger_intent, Some(intent.intent_id));
        assert!(report.dead_intents.is_empty());
    }

    #[tokio::test]
    async fn test_second_pass_adopts_nothing() {
        let h = harness().await;
        h.exchange
            .open_position(ExchangePosition::from_signed("ETHUSDT", dec!(-2), dec!(3000)).unwrap())
            .await;

        h.reconciler.reconcile(ReconcileMode::Full).await.unwrap();
        let second = h.reconciler.reconcile(ReconcileMode::Full).await.unwrap();
        let soft = h.reconciler.reconcile(ReconcileMode::Soft).await.unwrap();

        assert!(second.orphan_adopted.is_empty());
        assert_eq!(second.matched.len(), 1);
        assert!(soft.orphan_adopted.is_empty());
        assert_eq!(h.exchange.protective_orders("ETHUSDT").await.len(), 1);
    }

    #[tokio::test]
    async fn test_local_position_missing_on_exchange_is_purged() {
        let h = harness().await;
        h.store
            .upsert(PositionRecord::new("SOLUSDT", Side::Buy, dec!(10), dec!(150)))
            .await
            .unwrap();

        let report = h.reconciler.reconcile(ReconcileMode::Full).await.unwrap();

        assert_eq!(report.closed_externally.len(), 1);
        assert_eq!(report.closed_externally[0].symbol, "SOLUSDT");
        assert!(h.store.get("SOLUSDT").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_quantity_drift_takes_exchange_values() {
        let h = harness().await;
        h.store
            .upsert(PositionRecord::new("BTCUSDT", Side::Buy, dec!(1), dec!(64000)))
            .await
            .unwrap();
        h.exchange
            .open_position(ExchangePosition::from_signed("BTCUSDT", dec!(0.4), dec!(64000)).unwrap())
            .await;

        let report = h.reconciler.reconcile(ReconcileMode::Soft).await.unwrap();

        assert_eq!(report.quantity_adjusted().count(), 1);
        assert_eq!(report.matched[0].adjusted_from, Some((Side::Buy, dec!(1))));
        assert_eq!(h.store.get("BTCUSDT").await.unwrap().unwrap().quantity, dec!(0.4));
    }

    #[tokio::test]
    async fn test_exchange_outage_fails_closed() {
        let h = harness().await;
        h.exchange.set_unavailable(true);

        let err = h.reconciler.reconcile(ReconcileMode::Full).await.unwrap_err();

        assert!(matches!(err, ReconcileError::ExchangeUnavailable { attempts: 3, .. }));
        assert_eq!(h.exchange.query_count(), 3);
        assert!(!h.gate.is_ready());
        assert!(h.gate.status().await.last_failure.is_some());
    }

    #[tokio::test]
    async fn test_transient_query_failure_is_retried() {
        let h = harness().await;
        h.exchange.fail_next_queries(2);

        h.reconciler.reconcile(ReconcileMode::Full).await.unwrap();
        assert_eq!(h.exchange.query_count(), 3);
        assert!(h.gate.can_submit().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_exchange_times_out() {
        let h = harness().await;
        h.exchange.set_query_delay(Duration::from_secs(45));

        let err = h.reconciler.reconcile(ReconcileMode::Full).await.unwrap_err();
        assert!(matches!(err, ReconcileError::ExchangeUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_unprotectable_orphan_fails_pass() {
        let h = harness().await;
        h.exchange
            .open_position(ExchangePosition::from_signed("ETHUSDT", dec!(-2), dec!(3000)).unwrap())
            .await;
        h.exchange.reject_protective_orders(true);

        let err = h.reconciler.reconcile(ReconcileMode::Full).await.unwrap_err();

        assert!(matches!(err, ReconcileError::Protection { ref symbol, .. } if symbol == "ETHUSDT"));
        assert!(h.store.get("ETHUSDT").await.unwrap().is_none());
        assert!(!h.gate.can_submit().await);
    }

    #[tokio::test]
    async fn test_unrecorded_adoption_withdraws_its_stop() {
        let dir = tempfile::tempdir().unwrap();
        let store_dir = dir.path().join("store");
        std::fs::create_dir(&store_dir).unwrap();
        let exchange = PaperExchange::new();
        let ledger = Arc::new(
            Ledger::open(LedgerConfig::new(dir.path().join("ledger")))
                .await
                .unwrap(),
        );
        let store = PositionStore::open(PositionRepository::new(store_dir.join("positions.json")))
            .await
            .unwrap();
        let reconciler = Reconciler::new(
            Arc::new(exchange.clone()),
            ledger,
            store.clone(),
            TradingGate::new(),
            ReconcilerConfig::default(),
        );
        exchange
            .open_position(ExchangePosition::from_signed("ETHUSDT", dec!(-2), dec!(3000)).unwrap())
            .await;

        std::fs::remove_dir_all(&store_dir).unwrap();
        let err = reconciler.reconcile(ReconcileMode::Soft).await.unwrap_err();
        assert!(matches!(err, ReconcileError::Store(_)));
        assert!(exchange.protective_orders("ETHUSDT").await.is_empty());

        std::fs::create_dir(&store_dir).unwrap();
        let report = reconciler.reconcile(ReconcileMode::Soft).await.unwrap();
        assert_eq!(report.orphan_adopted.len(), 1);

        let orders = exchange.protective_orders("ETHUSDT").await;
        assert_eq!(orders.len(), 1);
        let stored = store.get("ETHUSDT").await.unwrap().unwrap();
        assert_eq!(stored.protective_order_ids, vec![orders[0].order_id.clone()]);
    }

    #[tokio::test]
    async fn test_checkpoint_skips_already_classified_intents() {
        let h = harness().await;
        let intent = OrderIntent::new("BTCUSDT", Side::Buy, dec!(0.1), None).unwrap();
        h.ledger.append_critical(intent).await.unwrap();

        let first = h.reconciler.reconcile(ReconcileMode::Full).await.unwrap();
        let second = h.reconciler.reconcile(ReconcileMode::Full).await.unwrap();

        assert_eq!(first.dead_intents.len(), 1);
        assert!(second.dead_intents.is_empty());
        assert_eq!(second.replayed_records, 0);
        assert_eq!(second.checkpoint_seq, first.checkpoint_seq);
    }
}
