//! Reconciliation protocol between the locally-held school registry and an
//! optional remote document store: point writes, full pulls, batched full
//! pushes, and a live change subscription with self-healing resubscription.

use std::{collections::BTreeMap, sync::Arc};

use async_trait::async_trait;
use chrono::Utc;
use futures::{stream::BoxStream, StreamExt};
use shared::{
    domain::{OrganizationConfig, OrganizationDoc, Registry},
    error::StoreError,
};
use throttle::SyncThrottle;
use tokio::{
    sync::Mutex,
    task::JoinHandle,
    time::{sleep, Duration},
};
use tracing::{error, info, warn};

mod http_store;
mod memory_store;

pub use http_store::{HttpRegistryStore, DEFAULT_SYNC_MAX_REQUESTS};
pub use memory_store::MemoryRegistryStore;

/// Upserts/deletes per concurrent batch during a full push.
pub const PUSH_BATCH_SIZE: usize = 5;
/// Pause between consecutive push batches.
pub const PUSH_BATCH_PAUSE: Duration = Duration::from_millis(1_000);
/// Pause before re-establishing a watch after remote-side throttling.
pub const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(5);

/// Notice that the remote collection changed; carries no payload because
/// subscribers rebuild the full snapshot on receipt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryChange;

pub type WatchStream = BoxStream<'static, Result<RegistryChange, StoreError>>;

pub type RegistrySnapshotCallback = Arc<dyn Fn(Registry) + Send + Sync>;

/// Contract of the remote organization-registry store: point reads/writes/
/// deletes, full-collection reads, and a full-collection change stream.
#[async_trait]
pub trait RegistryStore: Send + Sync {
    async fn put(&self, key: &str, doc: OrganizationDoc) -> Result<(), StoreError>;
    async fn get(&self, key: &str) -> Result<Option<OrganizationDoc>, StoreError>;
    async fn get_all(&self) -> Result<BTreeMap<String, OrganizationDoc>, StoreError>;
    async fn delete(&self, key: &str) -> Result<(), StoreError>;
    async fn watch(&self) -> Result<WatchStream, StoreError>;
}

struct SubscriptionHandle {
    watcher: JoinHandle<()>,
}

/// Stateless protocol executor over registry snapshots. The one piece of
/// state it owns is the subscription slot: at most one live watcher exists
/// per sync instance, and all mutation of the slot goes through
/// `subscribe`/`unsubscribe`.
pub struct RegistrySync {
    store: Arc<dyn RegistryStore>,
    throttle: Arc<SyncThrottle>,
    subscription: Mutex<Option<SubscriptionHandle>>,
}

impl RegistrySync {
    pub fn new(store: Arc<dyn RegistryStore>, throttle: Arc<SyncThrottle>) -> Self {
        Self {
            store,
            throttle,
            subscription: Mutex::new(None),
        }
    }

    /// Upserts a single school with freshly assigned timestamps.
    pub async fn save_one(&self, key: &str, config: &OrganizationConfig) -> Result<(), StoreError> {
        let store = Arc::clone(&self.store);
        let key = key.to_string();
        let config = config.clone();
        self.throttle
            .run(move || {
                let store = Arc::clone(&store);
                let key = key.clone();
                let config = config.clone();
                async move {
                    let doc = OrganizationDoc::stamped(&config, Utc::now());
                    store.put(&key, doc).await
                }
            })
            .await
    }

    /// Full pull. An absent or empty remote collection is an empty registry,
    /// not an error.
    pub async fn get_all(&self) -> Result<Registry, StoreError> {
        let docs = self.store.get_all().await?;
        Ok(docs
            .into_iter()
            .map(|(key, doc)| (key, doc.into_config()))
            .collect())
    }

    /// Point delete. Compensating the local state on failure is the
    /// caller's responsibility.
    pub async fn delete_one(&self, key: &str) -> Result<(), StoreError> {
        self.store.delete(key).await
    }

    /// Full reconciliation: removes remote entries absent locally, then
    /// re-upserts every local entry. Intentionally overwrites unchanged
    /// entries; convergence with the local set is the contract.
    pub async fn push_all(&self, local: &Registry) -> Result<(), StoreError> {
        let store = Arc::clone(&self.store);
        let local = local.clone();
        self.throttle
            .run(move || {
                let store = Arc::clone(&store);
                let local = local.clone();
                async move { push_all_once(store, local).await }
            })
            .await
    }

    /// Installs the live-change watcher, tearing down any previous one
    /// first. Each change notice rebuilds the full registry snapshot and
    /// hands it to `callback`; suppressing redundant snapshots is the
    /// caller's concern.
    pub async fn subscribe(&self, callback: RegistrySnapshotCallback) {
        let mut slot = self.subscription.lock().await;
        if let Some(previous) = slot.take() {
            info!("replacing active registry subscription");
            previous.watcher.abort();
            let _ = previous.watcher.await;
        }
        let store = Arc::clone(&self.store);
        let watcher = tokio::spawn(watch_loop(store, callback));
        *slot = Some(SubscriptionHandle { watcher });
    }

    /// Tears down the watcher and frees the slot. Idempotent.
    pub async fn unsubscribe(&self) {
        let mut slot = self.subscription.lock().await;
        if let Some(previous) = slot.take() {
            previous.watcher.abort();
            let _ = previous.watcher.await;
            info!("registry subscription torn down");
        }
    }

    pub async fn has_active_subscription(&self) -> bool {
        self.subscription.lock().await.is_some()
    }
}

async fn push_all_once(
    store: Arc<dyn RegistryStore>,
    local: Registry,
) -> Result<(), StoreError> {
    let remote = store.get_all().await?;
    let stale: Vec<String> = remote
        .keys()
        .filter(|key| !local.contains_key(*key))
        .cloned()
        .collect();
    info!(
        deletions = stale.len(),
        upserts = local.len(),
        "reconciling registry with remote store"
    );

    let mut first_batch = true;
    for batch in stale.chunks(PUSH_BATCH_SIZE) {
        if !first_batch {
            sleep(PUSH_BATCH_PAUSE).await;
        }
        first_batch = false;
        let deletions = batch.iter().map(|key| {
            let store = Arc::clone(&store);
            async move { store.delete(key).await }
        });
        for result in futures::future::join_all(deletions).await {
            result?;
        }
    }

    let now = Utc::now();
    let entries: Vec<(&String, &OrganizationConfig)> = local.iter().collect();
    for batch in entries.chunks(PUSH_BATCH_SIZE) {
        if !first_batch {
            sleep(PUSH_BATCH_PAUSE).await;
        }
        first_batch = false;
        let upserts = batch.iter().map(|&(key, config)| {
            let store = Arc::clone(&store);
            let doc = OrganizationDoc::stamped(config, now);
            async move { store.put(key, doc).await }
        });
        for result in futures::future::join_all(upserts).await {
            result?;
        }
    }

    Ok(())
}

/// Body of the watcher task. A resource-exhausted failure, whether while
/// establishing the watch or mid-stream, re-establishes the watch after a
/// fixed pause without releasing the subscription slot. Any other failure
/// ends the task.
async fn watch_loop(store: Arc<dyn RegistryStore>, callback: RegistrySnapshotCallback) {
    'rewatch: loop {
        let mut stream = match store.watch().await {
            Ok(stream) => stream,
            Err(err) if err.is_resource_exhausted() => {
                warn!(%err, "registry watch throttled, resubscribing after pause");
                sleep(RESUBSCRIBE_DELAY).await;
                continue 'rewatch;
            }
            Err(err) => {
                error!(%err, "failed to establish registry watch");
                return;
            }
        };

        while let Some(item) = stream.next().await {
            match item {
                Ok(RegistryChange) => match store.get_all().await {
                    Ok(docs) => {
                        let snapshot: Registry = docs
                            .into_iter()
                            .map(|(key, doc)| (key, doc.into_config()))
                            .collect();
                        callback(snapshot);
                    }
                    Err(err) => {
                        warn!(%err, "failed to rebuild registry snapshot after change notice");
                    }
                },
                Err(err) if err.is_resource_exhausted() => {
                    warn!(%err, "registry watch throttled, resubscribing after pause");
                    sleep(RESUBSCRIBE_DELAY).await;
                    continue 'rewatch;
                }
                Err(err) => {
                    error!(%err, "registry watch stream failed");
                    return;
                }
            }
        }

        info!("registry watch stream ended");
        return;
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
