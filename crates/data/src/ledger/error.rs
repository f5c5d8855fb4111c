use std::time::Duration;
use thiserror::Error;

/// Errors raised by the ledger.
///
/// On the critical tier every variant means the record is not confirmed and
/// the decision that produced it must not be executed.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// Disk I/O failed.
    #[error("ledger I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// A record could not be encoded.
    #[error("failed to encode ledger record: {0}")]
    Encode(#[from] serde_json::Error),
    /// The writer thread has stopped.
    #[error("ledger writer is closed")]
    WriterClosed,
    /// The buffered queue stayed full for the whole bounded wait.
    #[error("buffered ledger queue full after waiting {0:?}")]
    BufferFull(Duration),
    /// The configuration cannot be used.
    #[error("invalid ledger configuration: {0}")]
    Config(String),
}
