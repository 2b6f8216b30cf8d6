use planforge_core::{ModuleEntry, PlanforgeResult};
use planforge_store::StateStore;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tracing::debug;

/// Read-through cache over the module catalog.
///
/// Handlers read the catalog on every task; the cache keeps that off the
/// store's hot path. Any write invalidates the cache and notifies
/// subscribers on a non-durable broadcast channel, so other instances
/// refresh on their next read. Readers tolerate the brief staleness window
/// between a remote write and the notification.
pub struct CatalogCache {
    store: Arc<dyn StateStore>,
    cached: RwLock<Option<Arc<Vec<ModuleEntry>>>>,
    invalidations: broadcast::Sender<()>,
}

impl CatalogCache {
    /// Creates an empty cache over the store.
    pub fn new(store: Arc<dyn StateStore>) -> Arc<Self> {
        let (invalidations, _) = broadcast::channel(16);
        Arc::new(Self {
            store,
            cached: RwLock::new(None),
            invalidations,
        })
    }

    /// The current catalog snapshot, reading through on a cache miss.
    pub async fn modules(&self) -> PlanforgeResult<Arc<Vec<ModuleEntry>>> {
        if let Some(modules) = self.cached.read().await.clone() {
            return Ok(modules);
        }
        let modules = Arc::new(self.store.list_modules().await?);
        *self.cached.write().await = Some(Arc::clone(&modules));
        Ok(modules)
    }

    /// Writes through to the store and invalidates every cache listening on
    /// the notification channel (including this one).
    pub async fn upsert(&self, entry: ModuleEntry) -> PlanforgeResult<()> {
        self.store.upsert_module(entry).await?;
        self.invalidate().await;
        let _ = self.invalidations.send(());
        Ok(())
    }

    /// Drops the cached snapshot.
    pub async fn invalidate(&self) {
        *self.cached.write().await = None;
        debug!("Module catalog cache invalidated");
    }

    /// Subscribes to invalidation notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.invalidations.subscribe()
    }

    /// Spawns a listener that drops this cache's snapshot whenever a peer
    /// publishes an invalidation.
    pub fn start_invalidation_listener(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let cache = Arc::clone(self);
        let mut rx = cache.subscribe();
        tokio::spawn(async move {
            while rx.recv().await.is_ok() {
                cache.invalidate().await;
            }
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use planforge_store::MemoryStateStore;

    #[tokio::test]
    async fn test_read_through_and_invalidate() {
        let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
        let cache = CatalogCache::new(Arc::clone(&store));

        assert!(cache.modules().await.unwrap().is_empty());

        // A write through the store alone is not yet visible (stale cache).
        store
            .upsert_module(ModuleEntry::new("m1", "Module", vec![], "1.0"))
            .await
            .unwrap();
        assert!(cache.modules().await.unwrap().is_empty());

        // Writing through the cache invalidates it.
        cache
            .upsert(ModuleEntry::new("m2", "Other", vec![], "1.0"))
            .await
            .unwrap();
        assert_eq!(cache.modules().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_invalidation_notifies_subscribers() {
        let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
        let cache = CatalogCache::new(store);
        let mut rx = cache.subscribe();

        cache
            .upsert(ModuleEntry::new("m1", "Module", vec![], "1.0"))
            .await
            .unwrap();
        assert!(rx.try_recv().is_ok());
    }
}
