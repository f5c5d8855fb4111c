//! Application state.

use keel_execution::runtime::KeelCore;
use std::sync::Arc;

/// State shared by every handler.
#[derive(Clone)]
pub struct AppState {
    pub core: Arc<KeelCore>,
}

impl AppState {
    /// Creates a new AppState.
    pub fn new(core: Arc<KeelCore>) -> Self {
        Self { core }
    }
}
