//! In-memory collaborators for paper mode and tests.

mod exchange;
mod transport;

pub use exchange::{PaperExchange, ProtectiveOrder};
pub use transport::{ConnectAttempt, ConnectScript, PaperTransport, ScriptStep, ScriptedTransport};
