use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A normalized market data update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketEvent {
    pub symbol: String,
    pub price: Decimal,
    pub volume: Option<Decimal>,
    pub ts: DateTime<Utc>,
    /// Transport sequence number, when the upstream provides one.
    pub sequence: Option<u64>,
}

impl MarketEvent {
    pub fn new(symbol: impl Into<String>, price: Decimal) -> Self {
        Self {
            symbol: symbol.into(),
            price,
            volume: None,
            ts: Utc::now(),
            sequence: None,
        }
    }

    #[must_use]
    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = Some(sequence);
        self
    }
}

/// Why the event stream may have skipped updates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GapReason {
    /// The session reconnected after a drop or a transport error.
    Reconnect { attempt: u32 },
    /// Planned reconnect before the upstream session lifetime expires.
    Rotation,
    /// Transport sequence numbers jumped.
    SequenceGap { expected: u64, received: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GapInfo {
    pub session_id: usize,
    pub symbols: Vec<String>,
    pub reason: GapReason,
    pub detected_at: DateTime<Utc>,
}

/// Item of the stream delivered to strategies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamEvent {
    Market(MarketEvent),
    /// Events may have been missed; downstream state must be revalidated.
    GapDetected(GapInfo),
}

impl StreamEvent {
    pub fn is_gap(&self) -> bool {
        matches!(self, Self::GapDetected(_))
    }
}
