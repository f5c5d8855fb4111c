//! Prelude module for convenient imports.
//!
//! This module re-exports the most commonly used types from the crate.
//!
//! # Example
//!
//! ```rust
//! use keel_execution::prelude::*;
//! ```

// Runtime
pub use crate::runtime::{CoreConfig, CoreError, KeelCore};

// Gate
pub use crate::gate::{Admission, GateStatus, TradingGate};

// Intent
pub use crate::intent::{IntentError, IntentGateway};

// Stream
pub use crate::stream::{
    Backoff, EventStream, SessionState, SessionStatus, StreamConfig, StreamSessionManager,
};

// Sync
pub use crate::sync::{
    ReconcileError, ReconcileHandle, ReconcileService, ReconcileServiceConfig, Reconciler,
    ReconcilerConfig,
};
