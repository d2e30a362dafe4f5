use std::sync::Arc;

use arc_swap::ArcSwap;

use anyproxy_common::GlobalConfig;
use anyproxy_transform::SignatureStore;

/// Process-wide shared state. Config readers take a `load_full` snapshot at
/// request entry so a live update never tears one request.
pub struct AppState {
    pub global: ArcSwap<GlobalConfig>,
    pub signatures: Arc<SignatureStore>,
}

impl AppState {
    pub fn new(config: GlobalConfig) -> Self {
        Self {
            global: ArcSwap::from_pointee(config),
            signatures: Arc::new(SignatureStore::new()),
        }
    }

    pub fn config(&self) -> Arc<GlobalConfig> {
        self.global.load_full()
    }

    pub fn apply_config(&self, config: GlobalConfig) {
        self.global.store(Arc::new(config));
    }
}
