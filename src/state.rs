//! Shared application state.

use crate::config::Config;
use crate::confine::Jail;
use crate::session::SessionStore;
use std::sync::Arc;
use std::time::Duration;

/// Shared application state, cloned into every handler.
#[derive(Clone)]
pub struct AppState {
    pub sessions: SessionStore,
    pub jail: Arc<Jail>,
    pub session_ttl: Duration,
    pub sweep_interval: Duration,
    /// Upload body limit in bytes; `None` disables it.
    pub max_upload_bytes: Option<usize>,
}

impl AppState {
    pub fn new(jail: Jail) -> Self {
        let defaults = Config::default();
        Self {
            sessions: SessionStore::new(jail.root()),
            jail: Arc::new(jail),
            session_ttl: defaults.session_ttl(),
            sweep_interval: defaults.sweep_interval(),
            max_upload_bytes: defaults.max_upload_bytes(),
        }
    }

    /// Builds state from a validated configuration.
    pub fn from_config(config: &Config, jail: Jail) -> Self {
        Self {
            session_ttl: config.session_ttl(),
            sweep_interval: config.sweep_interval(),
            max_upload_bytes: config.max_upload_bytes(),
            ..Self::new(jail)
        }
    }
}
