use crate::enums::{ReconcileMode, Side};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Outcome of one reconciliation pass. Audit material only, never a source of truth.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationReport {
    pub mode: ReconcileMode,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub matched: Vec<MatchedPosition>,
    pub orphan_adopted: Vec<AdoptedPosition>,
    pub closed_externally: Vec<ClosedPosition>,
    pub dead_intents: Vec<DeadIntent>,
    /// Ledger records read during a full pass.
    pub replayed_records: usize,
    /// Checkpoint in force after the pass.
    pub checkpoint_seq: Option<u64>,
}

impl ReconciliationReport {
    pub fn new(mode: ReconcileMode) -> Self {
        Self {
            mode,
            started_at: Utc::now(),
            finished_at: None,
            matched: Vec::new(),
            orphan_adopted: Vec::new(),
            closed_externally: Vec::new(),
            dead_intents: Vec::new(),
            replayed_records: 0,
            checkpoint_seq: None,
        }
    }

    pub fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
    }

    /// Matched positions whose local size or side was corrected.
    pub fn quantity_adjusted(&self) -> impl Iterator<Item = &MatchedPosition> {
        self.matched.iter().filter(|m| m.adjusted_from.is_some())
    }

    /// True when the pass changed nothing.
    pub fn is_clean(&self) -> bool {
        self.orphan_adopted.is_empty()
            && self.closed_externally.is_empty()
            && self.dead_intents.is_empty()
            && self.quantity_adjusted().next().is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchedPosition {
    pub symbol: String,
    pub side: Side,
    pub quantity: Decimal,
    /// Previous local `(side, quantity)` when the record drifted from the exchange.
    pub adjusted_from: Option<(Side, Decimal)>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdoptedPosition {
    pub symbol: String,
    pub side: Side,
    pub quantity: Decimal,
    pub stop_price: Decimal,
    pub protective_order_id: String,
    /// Unresolved ledger intent for the same symbol, if any.
    pub ledger_intent: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClosedPosition {
    pub symbol: String,
    pub side: Side,
    pub quantity: Decimal,
    pub was_adopted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadIntent {
    pub intent_id: Uuid,
    pub seq: u64,
    pub symbol: String,
    pub side: Side,
    pub quantity: Decimal,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_clean_report() {
        let mut report = ReconciliationReport::new(ReconcileMode::Soft);
        report.matched.push(MatchedPosition {
            symbol: "BTCUSDT".to_string(),
            side: Side::Buy,
            quantity: dec!(1),
            adjusted_from: None,
        });
        assert!(report.is_clean());

        report.matched.push(MatchedPosition {
            symbol: "ETHUSDT".to_string(),
            side: Side::Buy,
            quantity: dec!(2),
            adjusted_from: Some((Side::Buy, dec!(1))),
        });
        assert!(!report.is_clean());
        assert_eq!(report.quantity_adjusted().count(), 1);
    }
}
