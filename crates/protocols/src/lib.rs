//! Seams to the outside world.
//!
//! The core never talks to a venue directly. It goes through the
//! [`Exchange`] trait for positions and protective orders and the
//! [`MarketTransport`] trait for live market data. The [`paper`] module
//! provides in-memory implementations for paper mode and tests.

pub mod exchange;
pub mod paper;
pub mod transport;

pub use exchange::{Exchange, ExchangeError, OrderId};
pub use transport::{MarketConnection, MarketTransport, TransportError};
