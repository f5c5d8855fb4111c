pub mod intent;
pub mod position;

// Re-export for easier access
pub use intent::{
    CancelIntent, FillConfirmation, IntentRecord, MarketData, Metadata, OrderIntent, RecordEntry,
    RecordKind,
};
pub use position::{ExchangePosition, PositionRecord};
