//! Application state shared across workers and handlers.

use std::sync::Arc;

use tokio::sync::Mutex;

use vitals_client::TimeseriesApi;
use vitals_cold::ObjectStore;
use vitals_store::Store;

use crate::config::Config;

/// Shared state for the workers and the HTTP control surface.
///
/// The configuration is immutable for the life of the process; runtime
/// changes go through a restart so every invocation of every worker sees
/// one consistent set of limits.
pub struct AppState {
    /// Hot store and durable worker state (wrapped in a Mutex for
    /// thread-safe access).
    pub store: Mutex<Store>,
    /// Cold storage backend.
    pub cold: Arc<dyn ObjectStore>,
    /// Remote timeseries API.
    pub api: Arc<dyn TimeseriesApi>,
    /// Immutable configuration.
    pub config: Config,
}

impl AppState {
    /// Create new application state.
    pub fn new(
        store: Store,
        cold: Arc<dyn ObjectStore>,
        api: Arc<dyn TimeseriesApi>,
        config: Config,
    ) -> Arc<Self> {
        Arc::new(Self {
            store: Mutex::new(store),
            cold,
            api,
            config,
        })
    }
}
