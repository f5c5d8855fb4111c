//! Operator HTTP surface.
//!
//! This crate provides a small REST API over a running core:
//! - Health and readiness
//! - Gate, reconciliation and stream session status
//! - Stored positions
//! - Forced reconciliation
//! - API key authentication

/// Authentication module.
pub mod auth;
/// Error types.
pub mod error;
/// Request handlers.
pub mod handlers;
/// Route definitions.
pub mod routes;
/// Server configuration and startup.
pub mod server;
/// Application state.
pub mod state;

pub use auth::{AuthConfig, AuthError, AuthState};
pub use error::ApiError;
pub use routes::create_router;
pub use server::{ApiServer, ServerConfig};
pub use state::AppState;
