use crate::enums::Side;
use crate::error::DomainError;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Free-form annotations carried by a payload. Kept ordered so ledger lines are stable.
pub type Metadata = BTreeMap<String, String>;

/// One line of the ledger.
///
/// Serialized as a flat JSON object: `seq`, `ts`, the `kind` tag and the
/// payload fields of that kind. Unknown fields are ignored when reading so
/// older binaries can replay newer segments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntentRecord {
    pub seq: u64,
    pub ts: DateTime<Utc>,
    #[serde(flatten)]
    pub entry: RecordEntry,
}

impl IntentRecord {
    pub fn new(seq: u64, ts: DateTime<Utc>, entry: RecordEntry) -> Self {
        Self { seq, ts, entry }
    }

    pub fn kind(&self) -> RecordKind {
        self.entry.kind()
    }

    pub fn symbol(&self) -> &str {
        self.entry.symbol()
    }
}

/// Closed set of ledger payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecordEntry {
    OrderIntent(OrderIntent),
    CancelIntent(CancelIntent),
    FillConfirmation(FillConfirmation),
    MarketData(MarketData),
}

impl RecordEntry {
    pub fn kind(&self) -> RecordKind {
        match self {
            Self::OrderIntent(_) => RecordKind::OrderIntent,
            Self::CancelIntent(_) => RecordKind::CancelIntent,
            Self::FillConfirmation(_) => RecordKind::FillConfirmation,
            Self::MarketData(_) => RecordKind::MarketData,
        }
    }

    pub fn symbol(&self) -> &str {
        match self {
            Self::OrderIntent(o) => &o.symbol,
            Self::CancelIntent(c) => &c.symbol,
            Self::FillConfirmation(f) => &f.symbol,
            Self::MarketData(m) => &m.symbol,
        }
    }
}

impl From<OrderIntent> for RecordEntry {
    fn from(value: OrderIntent) -> Self {
        Self::OrderIntent(value)
    }
}

impl From<CancelIntent> for RecordEntry {
    fn from(value: CancelIntent) -> Self {
        Self::CancelIntent(value)
    }
}

impl From<FillConfirmation> for RecordEntry {
    fn from(value: FillConfirmation) -> Self {
        Self::FillConfirmation(value)
    }
}

impl From<MarketData> for RecordEntry {
    fn from(value: MarketData) -> Self {
        Self::MarketData(value)
    }
}

/// Tag of a [`RecordEntry`] without its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecordKind {
    OrderIntent,
    CancelIntent,
    FillConfirmation,
    MarketData,
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OrderIntent => "ORDER_INTENT",
            Self::CancelIntent => "CANCEL_INTENT",
            Self::FillConfirmation => "FILL_CONFIRMATION",
            Self::MarketData => "MARKET_DATA",
        }
    }

    /// Parses the ledger tag, accepting any case.
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_uppercase().replace('-', "_").as_str() {
            "ORDER_INTENT" => Some(Self::OrderIntent),
            "CANCEL_INTENT" => Some(Self::CancelIntent),
            "FILL_CONFIRMATION" => Some(Self::FillConfirmation),
            "MARKET_DATA" => Some(Self::MarketData),
            _ => None,
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderIntent {
    pub intent_id: Uuid,
    pub symbol: String,
    pub side: Side,
    pub quantity: Decimal,
    /// Limit price; `None` for market orders.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Metadata::is_empty")]
    pub metadata: Metadata,
}

impl OrderIntent {
    pub fn new(
        symbol: impl Into<String>,
        side: Side,
        quantity: Decimal,
        price: Option<Decimal>,
    ) -> Result<Self, DomainError> {
        let symbol = symbol.into();
        if symbol.trim().is_empty() {
            return Err(DomainError::EmptySymbol);
        }
        if quantity <= Decimal::ZERO {
            return Err(DomainError::NonPositiveQuantity(quantity));
        }
        if let Some(p) = price.filter(|p| *p <= Decimal::ZERO) {
            return Err(DomainError::NonPositivePrice(p));
        }
        Ok(Self {
            intent_id: Uuid::new_v4(),
            symbol,
            side,
            quantity,
            price,
            metadata: Metadata::new(),
        })
    }

    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelIntent {
    pub intent_id: Uuid,
    pub target_intent_id: Uuid,
    pub symbol: String,
    #[serde(default, skip_serializing_if = "Metadata::is_empty")]
    pub metadata: Metadata,
}

impl CancelIntent {
    pub fn for_order(order: &OrderIntent) -> Self {
        Self {
            intent_id: Uuid::new_v4(),
            target_intent_id: order.intent_id,
            symbol: order.symbol.clone(),
            metadata: Metadata::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FillConfirmation {
    /// The order intent this fill resolves.
    pub intent_id: Uuid,
    pub symbol: String,
    pub side: Side,
    pub filled_quantity: Decimal,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fill_price: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_id: Option<String>,
    #[serde(default, skip_serializing_if = "Metadata::is_empty")]
    pub metadata: Metadata,
}

impl FillConfirmation {
    pub fn for_order(order: &OrderIntent, filled_quantity: Decimal, fill_price: Decimal) -> Self {
        Self {
            intent_id: order.intent_id,
            symbol: order.symbol.clone(),
            side: order.side,
            filled_quantity,
            fill_price: Some(fill_price),
            order_id: None,
            metadata: Metadata::new(),
        }
    }

    #[must_use]
    pub fn with_order_id(mut self, order_id: impl Into<String>) -> Self {
        self.order_id = Some(order_id.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketData {
    pub symbol: String,
    pub price: Decimal,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Metadata::is_empty")]
    pub metadata: Metadata,
}

impl MarketData {
    pub fn new(symbol: impl Into<String>, price: Decimal) -> Self {
        Self {
            symbol: symbol.into(),
            price,
            volume: None,
            metadata: Metadata::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_order_intent_validation() {
        assert_eq!(
            OrderIntent::new("", Side::Buy, dec!(1), None).unwrap_err(),
            DomainError::EmptySymbol
        );
        assert_eq!(
            OrderIntent::new("BTCUSDT", Side::Buy, dec!(0), None).unwrap_err(),
            DomainError::NonPositiveQuantity(dec!(0))
        );
        assert!(OrderIntent::new("BTCUSDT", Side::Buy, dec!(0.01), Some(dec!(-1))).is_err());
    }

    #[test]
    fn test_record_line_is_flat_and_tagged() {
        let order = OrderIntent::new("ETHUSDT", Side::Sell, dec!(0.5), Some(dec!(3100.25)))
            .unwrap()
            .with_metadata("strategy", "scalper");
        let record = IntentRecord::new(7, Utc::now(), order.clone().into());

        let value: serde_json::Value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["seq"], 7);
        assert_eq!(value["kind"], "ORDER_INTENT");
        assert_eq!(value["symbol"], "ETHUSDT");
        assert_eq!(value["side"], "SELL");
        assert_eq!(value["metadata"]["strategy"], "scalper");

        let line = serde_json::to_string(&record).unwrap();
        let parsed: IntentRecord = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed, record);
        assert_eq!(parsed.kind(), RecordKind::OrderIntent);
    }

    #[test]
    fn test_unknown_fields_are_ignored() {
        let line = r#"{"seq":3,"ts":"2026-01-05T10:00:00Z","kind":"MARKET_DATA","symbol":"BTCUSDT","price":"42000.5","venue":"futures","extra":{"a":1}}"#;
        let parsed: IntentRecord = serde_json::from_str(line).unwrap();
        assert_eq!(parsed.seq, 3);
        match parsed.entry {
            RecordEntry::MarketData(md) => {
                assert_eq!(md.price, dec!(42000.5));
                assert!(md.volume.is_none());
            }
            other => panic!("unexpected entry {other:?}"),
        }
    }

    #[test]
    fn test_unknown_kind_is_rejected() {
        let line = r#"{"seq":3,"ts":"2026-01-05T10:00:00Z","kind":"SNAPSHOT","symbol":"BTCUSDT"}"#;
        assert!(serde_json::from_str::<IntentRecord>(line).is_err());
    }

    #[test]
    fn test_record_kind_parse() {
        assert_eq!(RecordKind::parse("order_intent"), Some(RecordKind::OrderIntent));
        assert_eq!(RecordKind::parse("market-data"), Some(RecordKind::MarketData));
        assert_eq!(RecordKind::parse("nope"), None);
    }
}
