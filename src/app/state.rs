//! Application state shared across routes

use std::sync::Arc;

use crate::config::Config;
use crate::matchmaking::Matchmaker;
use crate::metrics::Metrics;
use crate::store::Store;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub matchmaker: Arc<Matchmaker>,
    pub metrics: Arc<Metrics>,
    pub store: Store,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        let config = Arc::new(config);
        let metrics = Arc::new(Metrics::new());
        let store = Store::from_config(&config);
        let matchmaker = Arc::new(Matchmaker::new(
            config.max_players_per_match,
            metrics.clone(),
            store.clone(),
        ));

        Self {
            config,
            matchmaker,
            metrics,
            store,
        }
    }
}
