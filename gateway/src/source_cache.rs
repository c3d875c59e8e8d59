use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use metrics::gauge;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::backend_config::SourceRegistry;

/// What the gateway needs to know about one write key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceEntry {
    pub source_id: String,
    pub enabled: bool,
    pub workspace_id: String,
}

#[derive(Debug, Default)]
struct SourceIndex {
    by_write_key: HashMap<String, SourceEntry>,
}

impl SourceIndex {
    fn build(registry: SourceRegistry) -> Self {
        let mut by_write_key = HashMap::with_capacity(registry.sources.len());
        for source in &registry.sources {
            if by_write_key.contains_key(&source.write_key) {
                warn!(
                    source_id = source.id,
                    "duplicate write key in source registry, keeping the first source"
                );
                continue;
            }
            let entry = SourceEntry {
                source_id: source.id.clone(),
                enabled: source.enabled,
                workspace_id: registry.workspace_for(source).to_string(),
            };
            by_write_key.insert(source.write_key.clone(), entry);
        }
        Self { by_write_key }
    }
}

/// Latest source registry, swapped atomically on every update.
///
/// Readers clone the current `Arc` under a short read lock and never observe a
/// half-applied update. Lookups do not block on the backend.
#[derive(Clone)]
pub struct SourceCache {
    snapshot: Arc<RwLock<Arc<SourceIndex>>>,
    ready: Arc<watch::Sender<bool>>,
}

impl Default for SourceCache {
    fn default() -> Self {
        Self::new()
    }
}

impl SourceCache {
    pub fn new() -> Self {
        let (ready, _) = watch::channel(false);
        Self {
            snapshot: Default::default(),
            ready: Arc::new(ready),
        }
    }

    /// Replaces the whole registry. The first call opens the ready gate.
    pub fn apply(&self, registry: SourceRegistry) {
        let index = Arc::new(SourceIndex::build(registry));
        gauge!("gateway_source_cache_write_keys").set(index.by_write_key.len() as f64);

        {
            let mut snapshot = self
                .snapshot
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            *snapshot = index;
        }

        self.ready.send_if_modified(|ready| {
            if *ready {
                false
            } else {
                info!("source registry received, gateway is ready");
                *ready = true;
                true
            }
        });
    }

    /// Applies every registry received on `updates` until the sender side closes.
    pub fn spawn_subscriber(&self, mut updates: mpsc::Receiver<SourceRegistry>) -> JoinHandle<()> {
        let cache = self.clone();
        tokio::spawn(async move {
            while let Some(registry) = updates.recv().await {
                cache.apply(registry);
            }
            warn!("source registry subscription closed");
        })
    }

    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    pub async fn wait_ready(&self) {
        let mut ready = self.ready.subscribe();
        if ready.wait_for(|ready| *ready).await.is_err() {
            warn!("source cache dropped before becoming ready");
        }
    }

    fn current(&self) -> Arc<SourceIndex> {
        self.snapshot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn get(&self, write_key: &str) -> Option<SourceEntry> {
        self.current().by_write_key.get(write_key).cloned()
    }

    /// Source id for a known and enabled write key. Unknown and disabled keys are
    /// indistinguishable to callers.
    pub fn enabled_source_id(&self, write_key: &str) -> Option<String> {
        self.get(write_key)
            .filter(|entry| entry.enabled)
            .map(|entry| entry.source_id)
    }

    pub fn workspace_id(&self, write_key: &str) -> Option<String> {
        self.get(write_key).map(|entry| entry.workspace_id)
    }
}
