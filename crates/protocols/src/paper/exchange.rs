//! In-memory exchange for paper mode and tests.

use crate::exchange::{Exchange, ExchangeError, OrderId};
use async_trait::async_trait;
use keel_domain::{ExchangePosition, Side};
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

/// A resting protective stop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtectiveOrder {
    pub order_id: OrderId,
    pub symbol: String,
    pub side: Side,
    pub quantity: Decimal,
    pub stop_price: Decimal,
}

#[derive(Default)]
struct PaperBook {
    positions: BTreeMap<String, ExchangePosition>,
    orders: BTreeMap<OrderId, ProtectiveOrder>,
}

/// Paper venue holding positions and protective orders in memory.
///
/// Cloning shares the same book. Failures can be injected to exercise the
/// reconciler's fail-closed paths.
#[derive(Clone, Default)]
pub struct PaperExchange {
    book: Arc<RwLock<PaperBook>>,
    failing_queries: Arc<AtomicU32>,
    unavailable: Arc<AtomicBool>,
    reject_protective: Arc<AtomicBool>,
    query_delay_ms: Arc<AtomicU64>,
    queries: Arc<AtomicU32>,
}

impl PaperExchange {
    /// Creates a new empty PaperExchange.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens or replaces a position.
    pub async fn open_position(&self, position: ExchangePosition) {
        info!(
            symbol = %position.symbol,
            side = %position.side,
            quantity = %position.quantity,
            "Paper position opened"
        );
        self.book
            .write()
            .await
            .positions
            .insert(position.symbol.clone(), position);
    }

    /// Flattens a position and drops its protective orders.
    pub async fn close_position(&self, symbol: &str) -> Option<ExchangePosition> {
        let mut book = self.book.write().await;
        book.orders.retain(|_, order| order.symbol != symbol);
        book.positions.remove(symbol)
    }

    /// Returns protective orders resting for `symbol`.
    pub async fn protective_orders(&self, symbol: &str) -> Vec<ProtectiveOrder> {
        self.book
            .read()
            .await
            .orders
            .values()
            .filter(|order| order.symbol == symbol)
            .cloned()
            .collect()
    }

    /// Makes the next `count` position queries fail.
    pub fn fail_next_queries(&self, count: u32) {
        self.failing_queries.store(count, Ordering::SeqCst);
    }

    /// Makes every query fail until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Makes protective order placement fail until reset.
    pub fn reject_protective_orders(&self, reject: bool) {
        self.reject_protective.store(reject, Ordering::SeqCst);
    }

    /// Delays every position query, to exercise timeouts.
    pub fn set_query_delay(&self, delay: Duration) {
        self.query_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Number of position queries received so far.
    pub fn query_count(&self) -> u32 {
        self.queries.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Exchange for PaperExchange {
    async fn get_open_positions(&self) -> Result<Vec<ExchangePosition>, ExchangeError> {
        self.queries.fetch_add(1, Ordering::SeqCst);

        let delay = self.query_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(ExchangeError::Unavailable("paper exchange offline".to_string()));
        }
        let failing = self
            .failing_queries
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(ExchangeError::Unavailable("injected query failure".to_string()));
        }

        Ok(self.book.read().await.positions.values().cloned().collect())
    }

    async fn place_protective_order(
        &self,
        symbol: &str,
        side: Side,
        quantity: Decimal,
        stop_price: Decimal,
    ) -> Result<OrderId, ExchangeError> {
        if self.reject_protective.load(Ordering::SeqCst) {
            return Err(ExchangeError::Rejected(format!(
                "protective order for {symbol} rejected"
            )));
        }
        let mut book = self.book.write().await;
        if !book.positions.contains_key(symbol) {
            return Err(ExchangeError::Rejected(format!(
                "reduce-only order for {symbol} without a position"
            )));
        }

        let order_id = format!("paper-stop-{}", Uuid::new_v4());
        debug!(
            symbol = %symbol,
            side = %side,
            quantity = %quantity,
            stop_price = %stop_price,
            order_id = %order_id,
            "Paper protective order placed"
        );
        book.orders.insert(
            order_id.clone(),
            ProtectiveOrder {
                order_id: order_id.clone(),
                symbol: symbol.to_string(),
                side,
                quantity,
                stop_price,
            },
        );
        Ok(order_id)
    }

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<(), ExchangeError> {
        let mut book = self.book.write().await;
        match book.orders.get(order_id) {
            Some(order) if order.symbol == symbol => {
                book.orders.remove(order_id);
                Ok(())
            }
            _ => Err(ExchangeError::OrderNotFound(order_id.to_string())),
        }
    }
}
