use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex as StdMutex,
    },
};

use async_trait::async_trait;
use futures::StreamExt;
use shared::{domain::OrganizationDoc, error::StoreError};
use tokio::sync::broadcast;
use tracing::debug;

use crate::{RegistryChange, RegistryStore, WatchStream};

const CHANGE_CHANNEL_CAPACITY: usize = 64;

/// In-memory registry store. Serves as the offline backend of the console
/// and as the remote stand-in in tests, where the failure hooks let a test
/// script exactly one failing write.
pub struct MemoryRegistryStore {
    docs: StdMutex<BTreeMap<String, OrganizationDoc>>,
    changes: broadcast::Sender<Result<RegistryChange, StoreError>>,
    put_failure: StdMutex<Option<StoreError>>,
    delete_failure: StdMutex<Option<StoreError>>,
    watchers: Arc<AtomicUsize>,
}

impl Default for MemoryRegistryStore {
    fn default() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            docs: StdMutex::new(BTreeMap::new()),
            changes,
            put_failure: StdMutex::new(None),
            delete_failure: StdMutex::new(None),
            watchers: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl MemoryRegistryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a document without emitting a change notice, as if it had been
    /// written by another client before this one subscribed.
    pub fn insert_doc(&self, key: &str, doc: OrganizationDoc) {
        self.lock(&self.docs).insert(key.to_string(), doc);
    }

    pub fn keys(&self) -> Vec<String> {
        self.lock(&self.docs).keys().cloned().collect()
    }

    /// Arms the next `put` to fail once with `err`.
    pub fn set_put_failure(&self, err: Option<StoreError>) {
        *self.lock(&self.put_failure) = err;
    }

    /// Arms the next `delete` to fail once with `err`.
    pub fn set_delete_failure(&self, err: Option<StoreError>) {
        *self.lock(&self.delete_failure) = err;
    }

    /// Emits a change notice without touching the documents.
    pub fn emit_change(&self) {
        let _ = self.changes.send(Ok(RegistryChange));
    }

    /// Injects a failure into every live watch stream.
    pub fn emit_watch_error(&self, err: StoreError) {
        let _ = self.changes.send(Err(err));
    }

    /// Number of live watch streams, counted from stream creation to drop.
    pub fn active_watchers(&self) -> usize {
        self.watchers.load(Ordering::SeqCst)
    }

    fn lock<'a, T>(&self, mutex: &'a StdMutex<T>) -> std::sync::MutexGuard<'a, T> {
        match mutex.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

struct WatcherGuard {
    watchers: Arc<AtomicUsize>,
}

impl Drop for WatcherGuard {
    fn drop(&mut self) {
        self.watchers.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl RegistryStore for MemoryRegistryStore {
    async fn put(&self, key: &str, doc: OrganizationDoc) -> Result<(), StoreError> {
        if let Some(err) = self.lock(&self.put_failure).take() {
            return Err(err);
        }
        self.lock(&self.docs).insert(key.to_string(), doc);
        self.emit_change();
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<OrganizationDoc>, StoreError> {
        Ok(self.lock(&self.docs).get(key).cloned())
    }

    async fn get_all(&self) -> Result<BTreeMap<String, OrganizationDoc>, StoreError> {
        Ok(self.lock(&self.docs).clone())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        if let Some(err) = self.lock(&self.delete_failure).take() {
            return Err(err);
        }
        self.lock(&self.docs).remove(key);
        self.emit_change();
        Ok(())
    }

    async fn watch(&self) -> Result<WatchStream, StoreError> {
        let receiver = self.changes.subscribe();
        self.watchers.fetch_add(1, Ordering::SeqCst);
        let guard = WatcherGuard {
            watchers: Arc::clone(&self.watchers),
        };

        let stream = futures::stream::unfold(
            (receiver, guard),
            |(mut receiver, guard)| async move {
                loop {
                    match receiver.recv().await {
                        Ok(item) => return Some((item, (receiver, guard))),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            // A lagged watcher still converges: the next
                            // notice triggers a full snapshot rebuild anyway.
                            debug!(skipped, "registry watcher lagged behind change feed");
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            },
        );
        Ok(stream.boxed())
    }
}
