//! Shared agent state handed to every handler.

use std::time::Instant;

use crate::session::SessionManager;
use crate::store::Store;

#[derive(Clone)]
pub struct AppState {
    pub sessions: SessionManager,
    pub store: Store,
    pub hostname: String,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(sessions: SessionManager, store: Store) -> Self {
        let hostname = hostname::get()
            .ok()
            .and_then(|s| s.into_string().ok())
            .unwrap_or_else(|| "unknown".to_string());
        Self {
            sessions,
            store,
            hostname,
            started_at: Instant::now(),
        }
    }
}
