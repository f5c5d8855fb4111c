//! Runtime side of the trading core.
//!
//! This crate provides:
//! - The trading gate: readiness after full reconciliation and order pauses
//! - The intent gateway through which every intent reaches the ledger
//! - Resilient market data sessions with backoff, rotation and gap reporting
//! - The position reconciler and its scheduling service
//! - The core runtime that starts and stops all of the above

/// Prelude module for convenient imports.
pub mod prelude;

/// Trading gate.
pub mod gate;
/// Intent gateway.
pub mod intent;
/// Market data sessions.
pub mod stream;
/// Core runtime wiring.
pub mod runtime;
/// Position reconciliation.
pub mod sync;
