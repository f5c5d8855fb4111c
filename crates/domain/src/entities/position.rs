use crate::enums::Side;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Local belief about one open position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionRecord {
    pub symbol: String,
    pub side: Side,
    /// Absolute size, always positive.
    pub quantity: Decimal,
    pub entry_price: Decimal,
    #[serde(default)]
    pub protective_order_ids: Vec<String>,
    /// True when the position was found on the exchange without a local record.
    #[serde(default)]
    pub adopted: bool,
    pub last_verified: DateTime<Utc>,
    pub opened_at: DateTime<Utc>,
}

impl PositionRecord {
    pub fn new(symbol: impl Into<String>, side: Side, quantity: Decimal, entry_price: Decimal) -> Self {
        let now = Utc::now();
        Self {
            symbol: symbol.into(),
            side,
            quantity: quantity.abs(),
            entry_price,
            protective_order_ids: Vec::new(),
            adopted: false,
            last_verified: now,
            opened_at: now,
        }
    }

    /// Builds the record for a ghost position; the protective order must already exist.
    pub fn adopted(position: &ExchangePosition, protective_order_id: String) -> Self {
        let now = Utc::now();
        Self {
            symbol: position.symbol.clone(),
            side: position.side,
            quantity: position.quantity,
            entry_price: position.entry_price,
            protective_order_ids: vec![protective_order_id],
            adopted: true,
            last_verified: now,
            opened_at: now,
        }
    }

    pub fn is_protected(&self) -> bool {
        !self.protective_order_ids.is_empty()
    }

    /// Whether size or direction differ from what the exchange reports.
    pub fn drifted_from(&self, position: &ExchangePosition) -> bool {
        self.side != position.side || self.quantity != position.quantity
    }
}

/// An open position as reported by the exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangePosition {
    pub symbol: String,
    pub side: Side,
    /// Absolute size, always positive.
    pub quantity: Decimal,
    pub entry_price: Decimal,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mark_price: Option<Decimal>,
}

impl ExchangePosition {
    /// Builds a position from a signed amount; returns `None` for a flat amount.
    pub fn from_signed(
        symbol: impl Into<String>,
        amount: Decimal,
        entry_price: Decimal,
    ) -> Option<Self> {
        let side = Side::from_signed(amount)?;
        Some(Self {
            symbol: symbol.into(),
            side,
            quantity: amount.abs(),
            entry_price,
            mark_price: None,
        })
    }

    #[must_use]
    pub fn with_mark_price(mut self, mark_price: Decimal) -> Self {
        self.mark_price = Some(mark_price);
        self
    }

    /// Price used to place a protective stop: mark price when known, entry otherwise.
    pub fn reference_price(&self) -> Decimal {
        self.mark_price.unwrap_or(self.entry_price)
    }
}
