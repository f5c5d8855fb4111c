//! Domain types shared by the ledger, the stream manager and the reconciler.
//!
//! Everything here is plain data: intent records and their closed set of
//! payload kinds, position records, normalized market events and the
//! reconciliation report.

pub mod entities;
pub mod enums;
pub mod error;
pub mod market;
pub mod reconciliation;
pub mod value_objects;

pub use entities::{
    CancelIntent, ExchangePosition, FillConfirmation, IntentRecord, MarketData, OrderIntent,
    PositionRecord, RecordEntry, RecordKind,
};
pub use enums::{ReconcileMode, Side};
pub use error::DomainError;
pub use market::{GapInfo, GapReason, MarketEvent, StreamEvent};
pub use reconciliation::{
    AdoptedPosition, ClosedPosition, DeadIntent, MatchedPosition, ReconciliationReport,
};
pub use value_objects::percentage::Percentage;
