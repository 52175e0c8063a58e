//! Asset notification interests.
//!
//! Collaborators register a callback URL against an asset name; every
//! append batch publishes one event per changed asset on the broadcast
//! channel and POSTs `{"asset": name}` to each registered URL from a
//! detached task. Delivery is best effort: a failed callback is logged
//! and dropped.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::state::{AppendEvent, AppState};

/// Register a callback URL for an asset. Returns false when the pair was
/// already registered.
pub async fn register(state: &AppState, asset: &str, url: &str) -> bool {
    let mut interests = state.interests.write().await;
    let urls = interests.entry(asset.to_string()).or_default();
    if urls.iter().any(|u| u == url) {
        return false;
    }
    urls.push(url.to_string());
    debug!(asset, url, "interest registered");
    true
}

/// Remove a callback URL for an asset. Returns false when the pair was
/// not registered.
pub async fn unregister(state: &AppState, asset: &str, url: &str) -> bool {
    let mut interests = state.interests.write().await;
    let Some(urls) = interests.get_mut(asset) else {
        return false;
    };
    let before = urls.len();
    urls.retain(|u| u != url);
    let removed = urls.len() != before;
    if urls.is_empty() {
        interests.remove(asset);
    }
    if removed {
        debug!(asset, url, "interest unregistered");
    }
    removed
}

/// Publish one event per appended asset and fan callbacks out to the
/// registered URLs.
pub async fn publish_append(state: &Arc<AppState>, assets: BTreeSet<String>, readings_added: usize) {
    for asset in assets {
        let _ = state.appends_tx.send(AppendEvent {
            asset_code: asset.clone(),
            readings_added,
        });

        let urls = {
            let interests = state.interests.read().await;
            interests.get(&asset).cloned().unwrap_or_default()
        };
        for url in urls {
            let client = state.http.clone();
            let asset = asset.clone();
            tokio::spawn(async move {
                let body = serde_json::json!({ "asset": asset });
                if let Err(e) = client.post(&url).json(&body).send().await {
                    warn!(%asset, %url, error = %e, "asset notification failed");
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use foglamp_store::ReadingsStore;

    fn state() -> Arc<AppState> {
        AppState::new(ReadingsStore::open_in_memory().unwrap(), Config::default())
    }

    #[tokio::test]
    async fn test_register_and_unregister() {
        let state = state();
        assert!(register(&state, "pump1", "http://localhost:9/cb").await);
        assert!(!register(&state, "pump1", "http://localhost:9/cb").await);
        assert!(unregister(&state, "pump1", "http://localhost:9/cb").await);
        assert!(!unregister(&state, "pump1", "http://localhost:9/cb").await);
    }

    #[tokio::test]
    async fn test_unregister_unknown_asset() {
        let state = state();
        assert!(!unregister(&state, "nope", "http://localhost:9/cb").await);
    }

    #[tokio::test]
    async fn test_publish_reaches_subscribers() {
        let state = state();
        let mut rx = state.appends_tx.subscribe();

        let assets: BTreeSet<String> = ["a".to_string(), "b".to_string()].into();
        publish_append(&state, assets, 4).await;

        assert_eq!(rx.recv().await.unwrap().asset_code, "a");
        assert_eq!(rx.recv().await.unwrap().asset_code, "b");
    }
}
