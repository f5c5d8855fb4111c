//! Order admission control.
//!
//! The gate is closed until reconciliation succeeds and can be paused
//! temporarily by stream sessions on venue errors.

mod trading_gate;

pub use trading_gate::*;
