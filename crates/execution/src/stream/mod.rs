//! Resilient market data streaming.
//!
//! Symbols are split into groups, one session task per group. Each session
//! reconnects with jittered exponential backoff, applies code-specific
//! remediation for venue errors, rotates before the upstream session
//! lifetime runs out, and reports every possible gap downstream.

mod backoff;
mod manager;
mod pacing;
mod session;

pub use backoff::Backoff;
pub use manager::{EventStream, StreamConfig, StreamSessionManager};
pub use session::{SessionState, SessionStatus};
