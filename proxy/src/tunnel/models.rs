//! `GET /v1/models` listing
//!
//! Built on first use and cached against the config snapshot it came from;
//! a reload swaps the snapshot, which makes the next request rebuild it.

use std::sync::{Arc, Mutex, PoisonError};

use serde_json::{json, Value};

use crate::config::ProxyConfig;

#[derive(Default)]
pub struct ModelCatalog {
    cached: Mutex<Option<(Arc<ProxyConfig>, Arc<Value>)>>,
}

impl ModelCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn listing(&self, config: &Arc<ProxyConfig>) -> Arc<Value> {
        let mut cached = self.cached.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some((source, listing)) = cached.as_ref() {
            if Arc::ptr_eq(source, config) {
                return listing.clone();
            }
        }
        let listing = Arc::new(build(config));
        tracing::debug!("model listing rebuilt");
        *cached = Some((config.clone(), listing.clone()));
        listing
    }
}

fn build(config: &ProxyConfig) -> Value {
    let data: Vec<Value> = config
        .model_ids()
        .into_iter()
        .map(|(id, provider)| {
            json!({
                "id": id,
                "object": "model",
                "created": 0,
                "owned_by": provider,
            })
        })
        .collect();
    json!({"object": "list", "data": data})
}
