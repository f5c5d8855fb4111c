//! Position reconciliation.
//!
//! Provides:
//! - Full and soft reconciliation passes against the exchange
//! - Orphan position adoption with a protective stop
//! - A service running scheduled and forced passes

mod reconciler;
mod service;

pub use reconciler::*;
pub use service::*;
