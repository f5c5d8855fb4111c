//! Durable storage for the trading core.
//!
//! This crate provides:
//! - The intent ledger: a segmented, append-only log with a synchronous
//!   critical tier and a batched informational tier
//! - Lazy replay across all ledger segments
//! - The position store: an atomically saved snapshot owned by a single task

/// Append-only intent ledger.
pub mod ledger;
/// Position store persistence and its owning task.
pub mod repositories;

pub use ledger::{Ledger, LedgerConfig, LedgerError, LedgerReader, LedgerStats, Replay};
pub use repositories::{PositionRepository, PositionSnapshot, PositionStore, StoreError};
