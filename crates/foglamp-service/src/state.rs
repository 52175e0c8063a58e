//! Application state shared across handlers.

use std::collections::HashMap;
use std::sync::Arc;

use foglamp_store::ReadingsStore;
use tokio::sync::{broadcast, RwLock};

use crate::config::Config;

/// Shared application state.
///
/// The store carries its own internal locking, so handlers call it
/// directly; the state only adds the append broadcast channel and the
/// asset interest registry.
pub struct AppState {
    /// The readings engine.
    pub store: Arc<ReadingsStore>,
    /// Configuration.
    pub config: Config,
    /// Broadcast channel of append events.
    pub appends_tx: broadcast::Sender<AppendEvent>,
    /// Asset name to registered callback URLs.
    pub interests: RwLock<HashMap<String, Vec<String>>>,
    /// Client used to deliver interest callbacks.
    pub http: reqwest::Client,
}

impl AppState {
    /// Create new application state.
    pub fn new(store: ReadingsStore, config: Config) -> Arc<Self> {
        let (appends_tx, _) = broadcast::channel(100);
        Arc::new(Self {
            store: Arc::new(store),
            config,
            appends_tx,
            interests: RwLock::new(HashMap::new()),
            http: reqwest::Client::new(),
        })
    }
}

/// One appended asset, published once per asset per append batch.
#[derive(Debug, Clone, serde::Serialize)]
pub struct AppendEvent {
    /// Asset whose readings changed.
    pub asset_code: String,
    /// Rows the batch added for this append call.
    pub readings_added: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_app_state_new() {
        let store = ReadingsStore::open_in_memory().unwrap();
        let state = AppState::new(store, Config::default());
        assert_eq!(state.config.server.bind, "127.0.0.1:8080");
    }

    #[tokio::test]
    async fn test_append_broadcast_channel() {
        let store = ReadingsStore::open_in_memory().unwrap();
        let state = AppState::new(store, Config::default());

        let mut rx = state.appends_tx.subscribe();
        state
            .appends_tx
            .send(AppendEvent {
                asset_code: "pump1".to_string(),
                readings_added: 3,
            })
            .unwrap();

        let event = rx.recv().await.unwrap();
        assert_eq!(event.asset_code, "pump1");
        assert_eq!(event.readings_added, 3);
    }
}
