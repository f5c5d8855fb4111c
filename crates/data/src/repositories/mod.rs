//! Position persistence.
//!
//! [`PositionRepository`] reads and writes the snapshot file; [`PositionStore`]
//! is the actor that owns the in-memory map and is the only way to change it.

mod position_repository;
mod position_store;

pub use position_repository::{PositionRepository, PositionSnapshot, SNAPSHOT_VERSION};
pub use position_store::PositionStore;

use std::io;
use thiserror::Error;

/// Errors raised by the position store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("position store io error: {0}")]
    Io(#[from] io::Error),

    #[error("position snapshot is not valid JSON: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("unsupported position snapshot version {0}")]
    UnsupportedVersion(u32),

    #[error("position store actor has stopped")]
    Closed,
}
