//! Exchange collaborator used by the reconciler.

use async_trait::async_trait;
use keel_domain::{ExchangePosition, Side};
use rust_decimal::Decimal;
use thiserror::Error;

/// Exchange-assigned order identifier.
pub type OrderId = String;

/// Errors returned by an [`Exchange`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExchangeError {
    /// The venue could not be reached or answered with a server error.
    #[error("exchange unavailable: {0}")]
    Unavailable(String),

    /// The venue refused the request.
    #[error("exchange rejected request: {0}")]
    Rejected(String),

    /// Unknown order on cancel.
    #[error("order {0} not found")]
    OrderNotFound(OrderId),
}

/// Minimal view of a venue needed to keep local state honest.
#[async_trait]
pub trait Exchange: Send + Sync {
    /// Returns every open position. Flat symbols are omitted.
    async fn get_open_positions(&self) -> Result<Vec<ExchangePosition>, ExchangeError>;

    /// Places a reduce-only stop that closes `quantity` of the position.
    ///
    /// `side` is the order side, i.e. the opposite of the position side.
    async fn place_protective_order(
        &self,
        symbol: &str,
        side: Side,
        quantity: Decimal,
        stop_price: Decimal,
    ) -> Result<OrderId, ExchangeError>;

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<(), ExchangeError>;
}
